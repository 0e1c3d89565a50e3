//! A fixed set of peers sharing one control segment.
//!
//! Peers may be threads of one process or separate processes; all they need
//! is the group name. Rank 0 creates the segment, everybody else attaches.

use super::{create_segment, open_segment};
use crate::constants::{CACHE_LINE, GROUP_MAGIC, GROUP_PREFIX, JOIN_RETRY, JOIN_TIMEOUT};
use crate::errors::Error;
use crate::helpers::{align_up, fnv1a_64, Backoff};
use crate::platform::make_os_id;
use crate::types::GroupHeader;
use log::{debug, info};
use shared_memory::Shmem;
use std::fmt;
use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

const HEADER_PADDED: usize = align_up(size_of::<GroupHeader>(), CACHE_LINE);

struct GroupInner {
    name: String,
    hash: u64,
    rank: usize,
    size: usize,
    base: NonNull<u8>,
    next_collective: AtomicU64,
    _shmem: Shmem,
}

// The mapping outlives every reference handed out and is only touched
// through atomics.
unsafe impl Send for GroupInner {}
unsafe impl Sync for GroupInner {}

/// Handle on a group; cheap to clone.
#[derive(Clone)]
pub struct Group {
    inner: Arc<GroupInner>,
}

impl Group {
    /// Join group `name` as `rank` of `size`. Blocks until rank 0 has
    /// published the control segment (or [`JOIN_TIMEOUT`] elapses).
    pub fn join(name: &str, rank: usize, size: usize) -> Result<Self, Error> {
        crate::ensure_logging();
        if size == 0 || rank >= size {
            return Err(Error::Invalid(format!("rank {rank} outside group of {size}")));
        }
        if size > u32::MAX as usize {
            return Err(Error::Invalid(format!("group size {size} too large")));
        }
        let hash = fnv1a_64(name);
        let os_id = make_os_id(GROUP_PREFIX, hash, "");
        let bytes = HEADER_PADDED + size * size_of::<u64>();

        let shmem = if rank == 0 {
            create_segment(&os_id, bytes)?
        } else {
            open_segment(&os_id, bytes, JOIN_TIMEOUT)?
        };
        let base = NonNull::new(shmem.as_ptr())
            .ok_or_else(|| Error::Transport(format!("segment {os_id} mapped at null")))?;
        let inner = GroupInner {
            name: name.to_owned(),
            hash,
            rank,
            size,
            base,
            next_collective: AtomicU64::new(0),
            _shmem: shmem,
        };
        let group = Group { inner: Arc::new(inner) };

        let hdr = group.header();
        if rank == 0 {
            hdr.size.store(size as u64, Ordering::Relaxed);
            hdr.magic.store(GROUP_MAGIC, Ordering::Release);
            info!("group {name:?} created for {size} ranks ({os_id})");
        } else {
            let deadline = Instant::now() + JOIN_TIMEOUT;
            while hdr.magic.load(Ordering::Acquire) != GROUP_MAGIC {
                if Instant::now() >= deadline {
                    return Err(Error::Transport(format!("group {name:?} never initialised")));
                }
                std::thread::sleep(JOIN_RETRY);
            }
            let published = hdr.size.load(Ordering::Relaxed);
            if published != size as u64 {
                return Err(Error::Invalid(format!(
                    "group {name:?} has {published} ranks, joined with {size}"
                )));
            }
            debug!("rank {rank} attached to group {name:?}");
        }
        Ok(group)
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.inner.rank
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.inner.size
    }

    pub fn contains(&self, rank: usize) -> bool {
        rank < self.inner.size
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub(crate) fn hash(&self) -> u64 {
        self.inner.hash
    }

    /// Same group, seen from the same rank.
    pub fn same_as(&self, other: &Group) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
            || (self.inner.hash == other.inner.hash
                && self.inner.name == other.inner.name
                && self.inner.size == other.inner.size
                && self.inner.rank == other.inner.rank)
    }

    /// Sequence number of the next collective allocation on this group.
    /// Every rank performs collectives in the same order, so the numbers agree.
    pub(crate) fn next_collective_id(&self) -> u64 {
        self.inner.next_collective.fetch_add(1, Ordering::Relaxed)
    }

    #[inline]
    fn header(&self) -> &GroupHeader {
        unsafe { &*(self.inner.base.as_ptr() as *const GroupHeader) }
    }

    #[inline]
    fn slots(&self) -> &[AtomicU64] {
        unsafe {
            let first = self.inner.base.as_ptr().add(HEADER_PADDED) as *const AtomicU64;
            std::slice::from_raw_parts(first, self.inner.size)
        }
    }

    /// Enter the barrier without waiting for it.
    pub fn ibarrier(&self) -> BarrierRequest {
        let hdr = self.header();
        let generation = hdr.generation.value.load(Ordering::Acquire);
        let before = hdr.arrived.value.fetch_add(1, Ordering::AcqRel);
        if before + 1 == self.inner.size as u64 {
            // last one in opens the next round
            hdr.arrived.value.store(0, Ordering::Relaxed);
            hdr.generation.value.fetch_add(1, Ordering::Release);
        }
        BarrierRequest {
            group: self.clone(),
            generation,
        }
    }

    pub fn barrier(&self) {
        self.ibarrier().wait();
    }

    /// Everybody contributes one word, everybody receives all of them in
    /// rank order.
    pub fn allgather_u64(&self, value: u64) -> Vec<u64> {
        let slots = self.slots();
        slots[self.inner.rank].store(value, Ordering::Release);
        self.barrier();
        let all = slots.iter().map(|s| s.load(Ordering::Acquire)).collect();
        // nobody may overwrite a slot before everybody has read it
        self.barrier();
        all
    }
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("name", &self.inner.name)
            .field("rank", &self.inner.rank)
            .field("size", &self.inner.size)
            .finish()
    }
}

/// An entered, possibly incomplete barrier.
pub struct BarrierRequest {
    group: Group,
    generation: u64,
}

impl BarrierRequest {
    /// `true` once every rank of the group has entered.
    pub fn test(&self) -> bool {
        self.group.header().generation.value.load(Ordering::Acquire) != self.generation
    }

    pub fn wait(self) {
        let mut backoff = Backoff::new();
        while !self.test() {
            backoff.snooze();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique(tag: &str) -> String {
        format!("unit_{tag}_{}_{}", std::process::id(), rand::random::<u64>())
    }

    #[test]
    fn rejects_rank_outside_group() {
        let err = Group::join(&unique("bad_rank"), 3, 3).unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::Invalid);
        assert!(Group::join(&unique("empty"), 0, 0).is_err());
    }

    #[test]
    fn singleton_barrier_completes_immediately() {
        let g = Group::join(&unique("single"), 0, 1).unwrap();
        let req = g.ibarrier();
        assert!(req.test());
        g.barrier();
        assert_eq!(g.allgather_u64(42), vec![42]);
    }

    #[test]
    fn collective_ids_count_up() {
        let g = Group::join(&unique("ids"), 0, 1).unwrap();
        assert_eq!(g.next_collective_id(), 0);
        assert_eq!(g.next_collective_id(), 1);
        assert!(g.same_as(&g.clone()));
    }
}
