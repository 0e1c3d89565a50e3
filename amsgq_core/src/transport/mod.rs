//! Transport collaborators of the queues: a group of peers with collectives,
//! one-sided windows over shared memory, and a two-sided channel built on a
//! window.

pub mod channel;
pub mod group;
pub mod window;

pub use channel::{Channel, SendRequest};
pub use group::{BarrierRequest, Group};
pub use window::{ReplaceMode, Window};

use crate::constants::JOIN_RETRY;
use crate::errors::Error;
use crate::platform::purge_segment;
use log::{debug, warn};
use shared_memory::{Shmem, ShmemConf, ShmemError};
use std::time::{Duration, Instant};

/// Create a named segment, reclaiming a stale one left behind by a crashed run.
pub(crate) fn create_segment(os_id: &str, bytes: usize) -> Result<Shmem, Error> {
    let conf = || ShmemConf::new().os_id(os_id).size(bytes);
    match conf().create() {
        Ok(shmem) => Ok(shmem),
        Err(ShmemError::MappingIdExists) => {
            warn!("stale segment {os_id} found, purging");
            if !purge_segment(os_id) {
                debug!("purge of {os_id} did not succeed, retrying create anyway");
            }
            Ok(conf().create()?)
        }
        Err(e) => Err(e.into()),
    }
}

/// Open a segment some peer creates concurrently, retrying until `timeout`.
pub(crate) fn open_segment(os_id: &str, min_len: usize, timeout: Duration) -> Result<Shmem, Error> {
    let deadline = Instant::now() + timeout;
    loop {
        match ShmemConf::new().os_id(os_id).open() {
            Ok(shmem) if shmem.len() >= min_len => return Ok(shmem),
            Ok(_) | Err(_) if Instant::now() < deadline => std::thread::sleep(JOIN_RETRY),
            Ok(shmem) => {
                return Err(Error::Transport(format!(
                    "segment {os_id} has {} bytes, expected at least {min_len}",
                    shmem.len()
                )))
            }
            Err(e) => return Err(e.into()),
        }
    }
}
