//! Pieces shared by the two one-sided inboxes (LOCKFREE and SOPNOP).
//!
//! Window layout, per rank:
//!
//! ```text
//! [ header, padded to a cache line ][ half 0: Q bytes ][ half 1: Q bytes ]
//! ```
//!
//! with `Q = msg_count * slot_size(msg_size_max)`.

use super::message::{slot_size, MsgHeader, RecordCursor};
use crate::constants::{CACHE_LINE, MSG_HEADER_SIZE};
use crate::errors::Error;
use crate::helpers::{align_up, Backoff};
use crate::telemetry;
use crate::transport::{Group, Window};
use crate::Runtime;
use log::{error, trace};
use metrics::counter;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub(crate) struct InboxLayout {
    pub msg_size_max: usize,
    pub slot: usize,
    pub half_bytes: usize,
    pub data_base: usize,
}

impl InboxLayout {
    pub fn new(msg_size_max: usize, msg_count: usize, header: usize) -> Result<Self, Error> {
        let slot = slot_size(msg_size_max);
        let half_bytes = msg_count
            .checked_mul(slot)
            .filter(|&q| q <= i32::MAX as usize)
            .ok_or_else(|| {
                Error::Invalid(format!(
                    "{msg_count} messages of {msg_size_max} bytes do not fit a 31-bit half"
                ))
            })?;
        Ok(Self {
            msg_size_max,
            slot,
            half_bytes,
            data_base: align_up(header, CACHE_LINE),
        })
    }

    #[inline]
    pub fn half_data(&self, half: usize) -> usize {
        self.data_base + half * self.half_bytes
    }

    pub fn window_bytes(&self) -> usize {
        self.data_base + 2 * self.half_bytes
    }
}

/// Deposit one record at `disp` of `target`'s window.
pub(crate) fn write_record(
    window: &Window,
    target: usize,
    disp: usize,
    header: MsgHeader,
    payload: &[u8],
    flush_each: bool,
) -> Result<(), Error> {
    window.put(target, disp, &header.encode())?;
    if flush_each {
        window.flush(target)?;
    }
    if !payload.is_empty() {
        window.put(target, disp + MSG_HEADER_SIZE, payload)?;
        if flush_each {
            window.flush(target)?;
        }
    }
    Ok(())
}

/// Run every record in `[0, valid_end)` of a claimed half, then scrub the
/// slot headers. The caller owns the half exclusively.
pub(crate) fn drain_half(
    rt: &Runtime,
    window: &Window,
    layout: &InboxLayout,
    half: usize,
    valid_end: usize,
) -> Result<usize, Error> {
    let base = layout.half_data(half);
    let me = rt.rank();
    // SAFETY: the half is claimed; admitted writers have all finished and
    // new ones are turned away until the reset.
    let region = unsafe { window.local_slice(base, valid_end)? };
    let mut handled = 0;
    for record in RecordCursor::new(region, layout.msg_size_max) {
        let record = record.map_err(|e| {
            error!("rank {me}: half {half} corrupt after {handled} records: {e}");
            e
        })?;
        rt.dispatch(record.header.fn_handle, record.header.sender, record.payload)?;
        handled += 1;
    }
    for slot in (0..valid_end).step_by(layout.slot) {
        window.zero(me, base + slot, MSG_HEADER_SIZE)?;
    }
    counter!(telemetry::REAPS).increment(1);
    trace!("rank {me}: reaped {handled} records from half {half}");
    Ok(handled)
}

/// Shared shape of `process_blocking` for the one-sided inboxes: keep
/// processing while the barrier fills, then drain until both halves are
/// empty, then close the round with a barrier.
pub(crate) fn drive_blocking<F>(group: &Group, pause: Duration, mut process: F) -> Result<usize, Error>
where
    F: FnMut(bool) -> Result<usize, Error>,
{
    let mut handled = 0;
    let req = group.ibarrier();
    let mut backoff = Backoff::new();
    while !req.test() {
        match process(false) {
            Ok(n) => handled += n,
            Err(Error::Again) => {}
            Err(e) => return Err(e),
        }
        backoff.snooze_for(pause);
    }
    loop {
        let n = process(true)?;
        if n == 0 {
            break;
        }
        handled += n;
    }
    group.barrier();
    Ok(handled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_holds_exactly_msg_count_slots() {
        let l = InboxLayout::new(10, 4, 24).unwrap();
        assert_eq!(l.slot, 32);
        assert_eq!(l.half_bytes, 128);
        assert_eq!(l.data_base, CACHE_LINE);
        assert_eq!(l.half_data(1), CACHE_LINE + 128);
        assert_eq!(l.window_bytes(), CACHE_LINE + 256);
    }

    #[test]
    fn oversized_half_is_invalid() {
        assert!(InboxLayout::new(1 << 20, 1 << 12, 24).is_err());
        assert!(InboxLayout::new(usize::MAX / 2, 4, 24).is_err());
    }
}
