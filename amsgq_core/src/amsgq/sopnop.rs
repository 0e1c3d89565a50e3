//! SOPNOP inbox: one fused word per half, `(writer_count << 32) | tail`.
//!
//! A single fetch-add of `(1, slot)` both registers a sender and reserves
//! its slot, so admission and reservation can never be observed apart. The
//! reaper claims a half by adding a large negative bias to the writer field;
//! the value that add returns is the tail as of the claim.

use super::inbox::{drain_half, drive_blocking, write_record, InboxLayout};
use super::message::MsgHeader;
use super::InboxBackend;
use crate::config::{Backend, SopnopConfig};
use crate::constants::{SOPNOP_SENTINEL, SOPNOP_THRESHOLD};
use crate::errors::Error;
use crate::helpers::{pack, pack_delta, unpack, Backoff};
use crate::transport::{ReplaceMode, Window};
use crate::types::{FusedHalf, FusedInboxHeader};
use crate::Runtime;
use log::{debug, error, trace, warn};
use memoffset::offset_of;
use std::mem::size_of;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

fn active_disp() -> usize {
    offset_of!(FusedInboxHeader, active_half)
}

fn fused_disp(half: usize) -> usize {
    offset_of!(FusedInboxHeader, halves) + half * size_of::<FusedHalf>() + offset_of!(FusedHalf, fused)
}

pub(crate) struct SopnopQueue {
    rt: Arc<Runtime>,
    window: Window,
    layout: InboxLayout,
    config: SopnopConfig,
    send_mutex: Mutex<()>,
    process_mutex: Mutex<()>,
}

impl SopnopQueue {
    pub fn open(rt: Arc<Runtime>, msg_size_max: usize, msg_count: usize) -> Result<Self, Error> {
        let layout = InboxLayout::new(msg_size_max, msg_count, size_of::<FusedInboxHeader>())?;
        let window = Window::allocate(rt.group(), layout.window_bytes())?;
        let config = rt.config().sopnop.clone();
        debug!("rank {}: SOPNOP tuning {config:?}", rt.rank());
        Ok(Self {
            rt,
            window,
            layout,
            config,
            send_mutex: Mutex::new(()),
            process_mutex: Mutex::new(()),
        })
    }

    fn replace_mode(&self) -> ReplaceMode {
        if self.config.use_fetch_op {
            ReplaceMode::FetchOp
        } else {
            ReplaceMode::Accumulate
        }
    }

    #[inline]
    fn rejects(&self, writers: i32, offset: u32) -> bool {
        writers <= SOPNOP_THRESHOLD || offset as usize + self.layout.slot > self.layout.half_bytes
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

    fn reap(&self, half: usize) -> Result<usize, Error> {
        let w = &self.window;
        let me = self.rt.rank();
        let disp = fused_disp(half);

        let before = w.fetch_add_u64(me, disp, pack_delta(SOPNOP_SENTINEL, 0))?;
        w.flush(me)?;
        let (writers_before, tail_at_claim) = unpack(before);
        if writers_before <= SOPNOP_THRESHOLD {
            // an earlier reap of this half failed and never handed it back
            w.fetch_add_u64(me, disp, pack_delta(-SOPNOP_SENTINEL, 0))?;
            w.flush(me)?;
            error!("rank {me}: half {half} still claimed (writer field {writers_before})");
            return Err(Error::Corruption(format!("half {half} carries a stale sentinel")));
        }

        let mut backoff = Backoff::new();
        while unpack(w.load_u64(me, disp)?).0 != SOPNOP_SENTINEL {
            backoff.snooze_for(self.config.sleep);
        }

        let valid_end = (tail_at_claim as usize).min(self.layout.half_bytes);
        let handled = drain_half(&self.rt, w, &self.layout, half, valid_end)?;

        // drop the bias and the tail together; rejected latecomers keep their count
        let mut current = w.load_u64(me, disp)?;
        loop {
            let (writers, _) = unpack(current);
            let next = pack(writers - SOPNOP_SENTINEL, 0);
            let seen = w.compare_and_swap_u64(me, disp, current, next)?;
            if seen == current {
                break;
            }
            current = seen;
        }
        w.flush(me)?;
        Ok(handled)
    }
}

impl InboxBackend for SopnopQueue {
    fn kind(&self) -> Backend {
        Backend::SopNop
    }

    fn try_send(&self, target: usize, fn_handle: u64, payload: &[u8]) -> Result<(), Error> {
        let _guard = self
            .send_mutex
            .lock()
            .map_err(|_| Error::Other("send lock poisoned".into()))?;
        let w = &self.window;
        let slot = self.layout.slot;

        let half = (w.fetch_u8(target, active_disp())? & 1) as usize;
        let disp = fused_disp(half);

        // a full or claimed half is refused without growing its tail
        let (writers, tail) = unpack(w.load_u64(target, disp)?);
        if self.rejects(writers, tail) {
            return Err(Error::Again);
        }

        let before = w.fetch_add_u64(target, disp, pack_delta(1, slot as u32))?;
        w.flush(target)?;
        let (writers, offset) = unpack(before);
        if self.rejects(writers, offset) {
            trace!("rank {target} half {half} refused: writers {writers}, offset {offset}");
            w.fetch_add_u64(target, disp, pack_delta(-1, 0))?;
            w.flush(target)?;
            return Err(Error::Again);
        }

        let header = MsgHeader {
            fn_handle,
            sender: self.rt.rank() as u32,
            payload_size: payload.len() as u32,
        };
        let at = self.layout.half_data(half) + offset as usize;
        let written = write_record(w, target, at, header, payload, self.config.flush_after_put)
            .and_then(|()| w.flush(target));
        w.fetch_add_u64(target, disp, pack_delta(-1, 0))?;
        w.flush(target)?;
        written
    }

    fn flush(&self) -> Result<(), Error> {
        self.window.flush_all();
        Ok(())
    }

    fn process(&self, blocking: bool) -> Result<usize, Error> {
        let _guard = self.lock_process(blocking)?;
        let w = &self.window;
        let me = self.rt.rank();
        let active = (w.fetch_u8(me, active_disp())? & 1) as usize;
        let idle = active ^ 1;

        if unpack(w.load_u64(me, fused_disp(active))?).1 == 0 {
            if unpack(w.load_u64(me, fused_disp(idle))?).1 == 0 {
                return Ok(0);
            }
            return self.reap(idle);
        }

        w.replace_u8(me, active_disp(), idle as u8, self.replace_mode())?;
        w.flush(me)?;
        self.reap(active)
    }

    fn process_blocking(&self) -> Result<usize, Error> {
        drive_blocking(self.rt.group(), self.config.sleep, |blocking| self.process(blocking))
    }

    fn close(self: Box<Self>) -> Result<(), Error> {
        let group = self.rt.group().clone();
        group.barrier();
        let me = group.rank();
        for half in 0..2 {
            let (_, tail) = unpack(self.window.load_u64(me, fused_disp(half))?);
            if tail > 0 {
                warn!(
                    "rank {me}: closing SOPNOP queue with {} unprocessed message(s) in half {half}",
                    (tail as usize).min(self.layout.half_bytes) / self.layout.slot
                );
            }
        }
        drop(self);
        group.barrier();
        Ok(())
    }
}
