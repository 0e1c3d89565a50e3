//! LOCKFREE inbox: per half a signed writer count and a byte tail.
//!
//! A sender registers in `writer_count`, reserves a slot with a fetch-add on
//! `tail_offset`, writes, and deregisters. The reaper flips `active_half`,
//! claims the old half by swapping its writer count from 0 to a large
//! negative sentinel, drains it and hands it back with the tail at zero.

use super::inbox::{drain_half, drive_blocking, write_record, InboxLayout};
use super::message::MsgHeader;
use super::InboxBackend;
use crate::config::Backend;
use crate::constants::LOCKFREE_SENTINEL;
use crate::errors::Error;
use crate::helpers::Backoff;
use crate::transport::{ReplaceMode, Window};
use crate::types::{LockFreeHalf, LockFreeInboxHeader};
use crate::Runtime;
use log::{error, trace, warn};
use memoffset::offset_of;
use std::mem::size_of;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::Duration;

fn active_disp() -> usize {
    offset_of!(LockFreeInboxHeader, active_half)
}

fn writers_disp(half: usize) -> usize {
    offset_of!(LockFreeInboxHeader, halves)
        + half * size_of::<LockFreeHalf>()
        + offset_of!(LockFreeHalf, writer_count)
}

fn tail_disp(half: usize) -> usize {
    offset_of!(LockFreeInboxHeader, halves)
        + half * size_of::<LockFreeHalf>()
        + offset_of!(LockFreeHalf, tail_offset)
}

pub(crate) struct LockFreeQueue {
    rt: Arc<Runtime>,
    window: Window,
    layout: InboxLayout,
    send_mutex: Mutex<()>,
    process_mutex: Mutex<()>,
}

impl LockFreeQueue {
    pub fn open(rt: Arc<Runtime>, msg_size_max: usize, msg_count: usize) -> Result<Self, Error> {
        let layout = InboxLayout::new(msg_size_max, msg_count, size_of::<LockFreeInboxHeader>())?;
        // fresh segments are zero-filled: half 0 active, both halves empty
        let window = Window::allocate(rt.group(), layout.window_bytes())?;
        Ok(Self {
            rt,
            window,
            layout,
            send_mutex: Mutex::new(()),
            process_mutex: Mutex::new(()),
        })
    }

    fn deregister(&self, target: usize, half: usize) -> Result<(), Error> {
        self.window.fetch_add_i32(target, writers_disp(half), -1)?;
        self.window.flush(target)
    }

    fn lock_process(&self, blocking: bool) -> Result<MutexGuard<'_, ()>, Error> {
        if blocking {
            return self
                .process_mutex
                .lock()
                .map_err(|_| Error::Other("process lock poisoned".into()));
        }
        match self.process_mutex.try_lock() {
            Ok(g) => Ok(g),
            Err(TryLockError::WouldBlock) => Err(Error::Again),
            Err(TryLockError::Poisoned(_)) => Err(Error::Other("process lock poisoned".into())),
        }
    }

    /// Claim `half`, run its records and hand it back empty.
    fn reap(&self, half: usize) -> Result<usize, Error> {
        let w = &self.window;
        let me = self.rt.rank();
        let mut backoff = Backoff::new();
        // wait for writers that registered before the flip
        loop {
            let seen = w.compare_and_swap_i32(me, writers_disp(half), 0, LOCKFREE_SENTINEL)?;
            if seen == 0 {
                break;
            }
            if seen <= LOCKFREE_SENTINEL / 2 {
                // an earlier reap of this half failed and never handed it back
                error!("rank {me}: half {half} still claimed (writer count {seen})");
                return Err(Error::Corruption(format!("half {half} carries a stale sentinel")));
            }
            w.flush(me)?;
            backoff.snooze();
        }
        w.flush(me)?;

        let tail = w.load_u32(me, tail_disp(half))? as usize;
        let handled = drain_half(&self.rt, w, &self.layout, half, tail.min(self.layout.half_bytes))?;

        // reset the tail first; latecomers parked on the sentinel keep their count
        w.store_u32(me, tail_disp(half), 0)?;
        w.fetch_add_i32(me, writers_disp(half), -LOCKFREE_SENTINEL)?;
        w.flush(me)?;
        Ok(handled)
    }
}

impl InboxBackend for LockFreeQueue {
    fn kind(&self) -> Backend {
        Backend::LockFree
    }

    fn try_send(&self, target: usize, fn_handle: u64, payload: &[u8]) -> Result<(), Error> {
        let _guard = self
            .send_mutex
            .lock()
            .map_err(|_| Error::Other("send lock poisoned".into()))?;
        let w = &self.window;
        let slot = self.layout.slot;

        let half = (w.fetch_u8(target, active_disp())? & 1) as usize;
        let writers = w.fetch_add_i32(target, writers_disp(half), 1)?;
        w.flush(target)?;
        if writers < 0 {
            trace!("rank {target} half {half} is being reaped");
            self.deregister(target, half)?;
            return Err(Error::Again);
        }

        let offset = w.fetch_add_u32(target, tail_disp(half), slot as u32)? as usize;
        w.flush(target)?;
        if offset + slot > self.layout.half_bytes {
            // hand the reservation back if nobody reserved after us
            let end = (offset + slot) as u32;
            w.compare_and_swap_u32(target, tail_disp(half), end, offset as u32)?;
            self.deregister(target, half)?;
            return Err(Error::Again);
        }

        let header = MsgHeader {
            fn_handle,
            sender: self.rt.rank() as u32,
            payload_size: payload.len() as u32,
        };
        let written = write_record(w, target, self.layout.half_data(half) + offset, header, payload, false)
            .and_then(|()| w.flush(target));
        self.deregister(target, half)?;
        written
    }

    fn flush(&self) -> Result<(), Error> {
        // every put is completed before try_send returns
        self.window.flush_all();
        Ok(())
    }

    fn process(&self, blocking: bool) -> Result<usize, Error> {
        let _guard = self.lock_process(blocking)?;
        let w = &self.window;
        let me = self.rt.rank();
        let active = (w.fetch_u8(me, active_disp())? & 1) as usize;
        let idle = active ^ 1;

        if w.load_u32(me, tail_disp(active))? == 0 {
            // senders that read the flag before the last flip land in the idle half
            if w.load_u32(me, tail_disp(idle))? == 0 {
                return Ok(0);
            }
            return self.reap(idle);
        }

        w.replace_u8(me, active_disp(), idle as u8, ReplaceMode::FetchOp)?;
        w.flush(me)?;
        self.reap(active)
    }

    fn process_blocking(&self) -> Result<usize, Error> {
        drive_blocking(self.rt.group(), Duration::ZERO, |blocking| self.process(blocking))
    }

    fn close(self: Box<Self>) -> Result<(), Error> {
        let group = self.rt.group().clone();
        group.barrier();
        let me = group.rank();
        for half in 0..2 {
            let tail = self.window.load_u32(me, tail_disp(half))?;
            if tail > 0 {
                warn!(
                    "rank {me}: closing LOCKFREE queue with {} unprocessed message(s) in half {half}",
                    (tail as usize).min(self.layout.half_bytes) / self.layout.slot
                );
            }
        }
        drop(self);
        group.barrier();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Group;
    use crate::{Amsgq, AmsgqConfig, Delivery};

    fn noop(_: &Delivery<'_>) {}

    fn solo(msg_count: usize) -> (Amsgq, LockFreeQueue) {
        let name = format!("unit_lf_{}_{}", std::process::id(), rand::random::<u64>());
        let g = Group::join(&name, 0, 1).unwrap();
        let rt = Amsgq::init_with_config(&g, AmsgqConfig::default().with_backend(Backend::LockFree)).unwrap();
        let q = LockFreeQueue::open(rt.runtime.clone(), 8, msg_count).unwrap();
        (rt, q)
    }

    #[test]
    fn corrupt_half_stays_reported_instead_of_blocking() {
        let (rt, q) = solo(4);
        let bad = MsgHeader {
            fn_handle: 1,
            sender: 0,
            payload_size: 99,
        };
        q.window.put(0, q.layout.half_data(0), &bad.encode()).unwrap();
        q.window.store_u32(0, tail_disp(0), q.layout.slot as u32).unwrap();

        assert!(matches!(q.process(false), Err(Error::Corruption(_))));
        assert!(matches!(q.process(false), Err(Error::Corruption(_))));

        // the other half keeps working
        let handle = rt.runtime.encode(noop, 0).unwrap();
        q.try_send(0, handle, b"ok").unwrap();
        assert_eq!(q.process(false).unwrap(), 1);
        // active again on the poisoned half
        assert!(matches!(q.try_send(0, handle, b"no"), Err(Error::Again)));
        assert!(matches!(q.process(false), Err(Error::Corruption(_))));
    }

    #[test]
    fn failed_write_still_deregisters() {
        let (rt, q) = solo(1);
        q.window.replace_u8(0, active_disp(), 1, ReplaceMode::FetchOp).unwrap();
        let handle = rt.runtime.encode(noop, 0).unwrap();
        // runs past the end of the window
        let oversized = vec![0u8; 1 << 16];
        assert!(matches!(q.try_send(0, handle, &oversized), Err(Error::Transport(_))));
        assert_eq!(q.window.load_u32(0, writers_disp(1)).unwrap(), 0);
    }

    #[test]
    fn header_displacements() {
        assert_eq!(active_disp(), 0);
        assert_eq!(writers_disp(0), 8);
        assert_eq!(tail_disp(0), 12);
        assert_eq!(writers_disp(1), 16);
        assert_eq!(tail_disp(1), 20);
        assert_eq!(size_of::<LockFreeInboxHeader>(), 64);
    }
}
