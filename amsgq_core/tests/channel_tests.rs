mod common;

use amsgq_core::Channel;
use common::run_peers;

#[test]
fn ring_exchange_keeps_per_source_order() {
    const PEERS: usize = 3;
    const MSGS: u64 = 40;
    let received = run_peers(PEERS, "chan_ring", |g| {
        let ch = Channel::open(&g, 11, 4, 8).unwrap();
        let me = g.rank();
        let next = (me + 1) % PEERS;
        let prev = (me + PEERS - 1) % PEERS;
        let mut pending: std::collections::VecDeque<_> = (0..MSGS)
            .map(|i| ch.isend(next, i.to_le_bytes().to_vec()).unwrap())
            .collect();
        let mut got = Vec::new();
        while !pending.is_empty() || (got.len() as u64) < MSGS {
            while let Some(front) = pending.front_mut() {
                if !ch.test_send(front).unwrap() {
                    break;
                }
                pending.pop_front();
            }
            ch.try_recv(prev, |d| {
                got.push(u64::from_le_bytes(d.try_into().unwrap()));
                Ok(())
            })
            .unwrap();
        }
        g.barrier();
        got
    });
    for got in received {
        assert_eq!(got, (0..MSGS).collect::<Vec<_>>());
    }
}

#[test]
fn consume_error_still_reposts_slot() {
    let out = run_peers(1, "chan_err", |g| {
        let ch = Channel::open(&g, 3, 1, 4).unwrap();
        let mut a = ch.isend(0, vec![1]).unwrap();
        assert!(ch.test_send(&mut a).unwrap());
        let failed = ch.try_recv(0, |_| Err(amsgq_core::Error::Corruption("refused".into())));
        let mut b = ch.isend(0, vec![2]).unwrap();
        (failed.is_err(), ch.test_send(&mut b).unwrap(), ch.pending_receives())
    });
    assert_eq!(out, vec![(true, true, 1)]);
}
