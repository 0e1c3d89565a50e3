//! Two-sided messaging on top of a window.
//!
//! Every receiver exposes, for each source rank, a ring of pre-posted
//! receive slots. A send deposits into the next slot of its ring once the
//! receiver has re-posted it; a receive consumes slots in the same order.
//!
//! Slot layout: [`ChannelSlotHeader`] (16 bytes) followed by `slot_bytes`
//! of data.

use super::{Group, Window};
use crate::constants::MSG_ALIGN;
use crate::errors::Error;
use crate::helpers::align_up;
use crate::types::{ChannelSlotHeader, SLOT_EMPTY, SLOT_FULL};
use log::trace;
use memoffset::offset_of;
use std::mem::size_of;
use std::sync::{Mutex, MutexGuard};

pub struct Channel {
    window: Window,
    tag: u32,
    slots: usize,
    slot_bytes: usize,
    stride: usize,
    send_seq: Mutex<Vec<u64>>,
    recv_seq: Mutex<Vec<u64>>,
}

/// A send that has been assigned its slot but may not have been deposited yet.
#[derive(Debug)]
pub struct SendRequest {
    dst: usize,
    seq: u64,
    data: Vec<u8>,
    done: bool,
}

impl SendRequest {
    pub fn dst(&self) -> usize {
        self.dst
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}

fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>, Error> {
    m.lock().map_err(|_| Error::Other("channel sequence lock poisoned".into()))
}

impl Channel {
    /// Collective: `slots` receive slots of `slot_bytes` each, per source.
    pub fn open(group: &Group, tag: u32, slots: usize, slot_bytes: usize) -> Result<Self, Error> {
        if slots == 0 || slot_bytes == 0 {
            return Err(Error::Invalid("channel needs at least one slot of one byte".into()));
        }
        if slot_bytes > u32::MAX as usize {
            return Err(Error::Invalid(format!("slot of {slot_bytes} bytes too large")));
        }
        let stride = align_up(size_of::<ChannelSlotHeader>() + slot_bytes, MSG_ALIGN);
        let bytes = group
            .size()
            .checked_mul(slots)
            .and_then(|n| n.checked_mul(stride))
            .ok_or_else(|| Error::Invalid("channel window size overflows".into()))?;
        let window = Window::allocate(group, bytes)?;
        Ok(Self {
            window,
            tag,
            slots,
            slot_bytes,
            stride,
            send_seq: Mutex::new(vec![0; group.size()]),
            recv_seq: Mutex::new(vec![0; group.size()]),
        })
    }

    pub fn group(&self) -> &Group {
        self.window.group()
    }

    pub fn slot_bytes(&self) -> usize {
        self.slot_bytes
    }

    #[inline]
    fn slot_disp(&self, src: usize, seq: u64) -> usize {
        (src * self.slots + (seq % self.slots as u64) as usize) * self.stride
    }

    /// Queue `data` towards `dst`. Requests towards one destination must be
    /// tested in the order they were created.
    pub fn isend(&self, dst: usize, data: Vec<u8>) -> Result<SendRequest, Error> {
        if dst >= self.group().size() {
            return Err(Error::Invalid(format!("send to rank {dst} outside group")));
        }
        if data.len() > self.slot_bytes {
            return Err(Error::Invalid(format!(
                "message of {} bytes exceeds slot of {}",
                data.len(),
                self.slot_bytes
            )));
        }
        let mut seqs = lock(&self.send_seq)?;
        let seq = seqs[dst];
        seqs[dst] += 1;
        Ok(SendRequest {
            dst,
            seq,
            data,
            done: false,
        })
    }

    /// Try to deposit `req`; `true` once it sits in the receiver's slot.
    pub fn test_send(&self, req: &mut SendRequest) -> Result<bool, Error> {
        if req.done {
            return Ok(true);
        }
        let disp = self.slot_disp(self.group().rank(), req.seq);
        let state = disp + offset_of!(ChannelSlotHeader, state);
        if self.window.load_u32(req.dst, state)? != SLOT_EMPTY {
            return Ok(false);
        }
        self.window
            .put(req.dst, disp + size_of::<ChannelSlotHeader>(), &req.data)?;
        self.window
            .store_u32(req.dst, disp + offset_of!(ChannelSlotHeader, tag), self.tag)?;
        self.window
            .store_u32(req.dst, disp + offset_of!(ChannelSlotHeader, len), req.data.len() as u32)?;
        self.window.store_u32(req.dst, state, SLOT_FULL)?;
        trace!("deposited seq {} towards rank {}", req.seq, req.dst);
        req.done = true;
        Ok(true)
    }

    /// Complete the next receive from `src` if it has arrived, handing the
    /// data to `consume`. The slot is re-posted even if `consume` fails.
    pub fn try_recv<F>(&self, src: usize, consume: F) -> Result<bool, Error>
    where
        F: FnOnce(&[u8]) -> Result<(), Error>,
    {
        if src >= self.group().size() {
            return Err(Error::Invalid(format!("receive from rank {src} outside group")));
        }
        let me = self.group().rank();
        let mut seqs = lock(&self.recv_seq)?;
        let disp = self.slot_disp(src, seqs[src]);
        let state = disp + offset_of!(ChannelSlotHeader, state);
        if self.window.load_u32(me, state)? != SLOT_FULL {
            return Ok(false);
        }
        let tag = self.window.load_u32(me, disp + offset_of!(ChannelSlotHeader, tag))?;
        let len = self.window.load_u32(me, disp + offset_of!(ChannelSlotHeader, len))? as usize;
        let outcome = if tag != self.tag {
            Err(Error::Transport(format!("slot from rank {src} carries tag {tag}, expected {}", self.tag)))
        } else if len > self.slot_bytes {
            Err(Error::Corruption(format!("slot from rank {src} claims {len} bytes")))
        } else {
            // the sender does not touch a FULL slot until we re-post it
            let data = unsafe { self.window.local_slice(disp + size_of::<ChannelSlotHeader>(), len)? };
            consume(data)
        };
        self.window.store_u32(me, state, SLOT_EMPTY)?;
        seqs[src] += 1;
        outcome.map(|()| true)
    }

    /// Messages that arrived in this rank's slots but were never received.
    pub fn pending_receives(&self) -> usize {
        let me = self.group().rank();
        let total = self.group().size() * self.slots;
        (0..total)
            .filter(|i| {
                let state = i * self.stride + offset_of!(ChannelSlotHeader, state);
                matches!(self.window.load_u32(me, state), Ok(SLOT_FULL))
            })
            .count()
    }
}
