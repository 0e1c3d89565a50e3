#![allow(dead_code)]

use amsgq_core::{Amsgq, AmsgqConfig, Backend, Group};
use std::sync::Arc;
use std::thread;

/// Segment names must not collide between tests running in parallel.
pub fn unique_name(tag: &str) -> String {
    format!("it_{tag}_{}_{:x}", std::process::id(), rand::random::<u64>())
}

/// Run `peer` once per rank, each on its own thread, and collect the results
/// in rank order.
pub fn run_peers<T, F>(size: usize, tag: &str, peer: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(Group) -> T + Send + Sync + 'static,
{
    let name = unique_name(tag);
    let peer = Arc::new(peer);
    let handles: Vec<_> = (0..size)
        .map(|rank| {
            let peer = peer.clone();
            let name = name.clone();
            thread::Builder::new()
                .name(format!("peer-{rank}"))
                .spawn(move || {
                    let group = Group::join(&name, rank, size).expect("join group");
                    peer(group)
                })
                .expect("spawn peer")
        })
        .collect();
    handles
        .into_iter()
        .map(|h| h.join().expect("peer panicked"))
        .collect()
}

pub fn runtime(group: &Group, backend: Backend) -> Amsgq {
    Amsgq::init_with_config(group, AmsgqConfig::default().with_backend(backend)).expect("init runtime")
}
