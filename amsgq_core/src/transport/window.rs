//! Collectively allocated one-sided window.
//!
//! Every rank exposes one segment of the same size and maps the segments of
//! all other ranks. Remote accesses are addressed as `(target, displacement)`
//! and are bounds- and alignment-checked before they touch memory.

use super::{create_segment, open_segment, Group};
use crate::constants::{JOIN_TIMEOUT, WINDOW_PREFIX};
use crate::errors::Error;
use crate::platform::make_os_id;
use crate::telemetry;
use log::debug;
use metrics::counter;
use shared_memory::Shmem;
use std::mem::{align_of, size_of};
use std::ptr::{self, NonNull};
use std::sync::atomic::{fence, AtomicI32, AtomicU32, AtomicU64, AtomicU8, Ordering};

/// How a single-byte remote update is issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceMode {
    /// Plain accumulate-with-replace; the previous value is not observed.
    Accumulate,
    /// Fetch-and-op; returns the previous value.
    FetchOp,
}

struct Segment {
    base: NonNull<u8>,
    len: usize,
    _shmem: Shmem,
}

pub struct Window {
    group: Group,
    id: u64,
    segments: Vec<Segment>,
}

// Segments stay mapped for the window's lifetime; all shared accesses go
// through atomics or explicitly synchronised copies.
unsafe impl Send for Window {}
unsafe impl Sync for Window {}

impl Window {
    /// Collective: every rank of `group` must call this with the same size.
    pub fn allocate(group: &Group, bytes: usize) -> Result<Self, Error> {
        if bytes == 0 {
            return Err(Error::Invalid("window of zero bytes".into()));
        }
        let id = group.next_collective_id();
        let name_of = |rank: usize| make_os_id(WINDOW_PREFIX, group.hash(), &format!("_{id}_{rank}"));
        let me = group.rank();

        let own = create_segment(&name_of(me), bytes)?;
        group.barrier();

        let mut segments = Vec::with_capacity(group.size());
        for rank in 0..group.size() {
            if rank != me {
                segments.push(Self::segment(open_segment(&name_of(rank), bytes, JOIN_TIMEOUT)?)?);
            }
        }
        segments.insert(me, Self::segment(own)?);
        // every peer is attached before anyone may release its segment
        group.barrier();
        debug!("window {id} of {bytes} bytes ready on rank {me}");
        Ok(Self {
            group: group.clone(),
            id,
            segments,
        })
    }

    fn segment(shmem: Shmem) -> Result<Segment, Error> {
        let base = NonNull::new(shmem.as_ptr())
            .ok_or_else(|| Error::Transport("segment mapped at null".into()))?;
        Ok(Segment {
            base,
            len: shmem.len(),
            _shmem: shmem,
        })
    }

    pub fn group(&self) -> &Group {
        &self.group
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Collective release. Dropping a window releases it locally only.
    pub fn free(self) {
        let group = self.group.clone();
        group.barrier();
        drop(self);
    }

    /// Bytes exposed by `target`.
    pub fn len_of(&self, target: usize) -> Option<usize> {
        self.segments.get(target).map(|s| s.len)
    }

    fn addr(&self, target: usize, disp: usize, len: usize, align: usize) -> Result<*mut u8, Error> {
        let seg = self.segments.get(target).ok_or_else(|| {
            Error::Invalid(format!("rank {target} outside window of {} ranks", self.segments.len()))
        })?;
        if !disp.checked_add(len).is_some_and(|end| end <= seg.len) {
            return Err(Error::Transport(format!(
                "access [{disp}, +{len}) outside {} bytes of rank {target}",
                seg.len
            )));
        }
        if disp % align != 0 {
            return Err(Error::Transport(format!("displacement {disp} not aligned to {align}")));
        }
        Ok(unsafe { seg.base.as_ptr().add(disp) })
    }

    fn atomic<A>(&self, target: usize, disp: usize) -> Result<&A, Error> {
        let p = self.addr(target, disp, size_of::<A>(), align_of::<A>())?;
        Ok(unsafe { &*(p as *const A) })
    }

    pub fn put(&self, target: usize, disp: usize, data: &[u8]) -> Result<(), Error> {
        let dst = self.addr(target, disp, data.len(), 1)?;
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
        Ok(())
    }

    pub fn get(&self, target: usize, disp: usize, out: &mut [u8]) -> Result<(), Error> {
        let src = self.addr(target, disp, out.len(), 1)?;
        unsafe { ptr::copy_nonoverlapping(src as *const u8, out.as_mut_ptr(), out.len()) };
        Ok(())
    }

    pub fn zero(&self, target: usize, disp: usize, len: usize) -> Result<(), Error> {
        let dst = self.addr(target, disp, len, 1)?;
        unsafe { ptr::write_bytes(dst, 0, len) };
        Ok(())
    }

    /// Borrow a region of this rank's own segment.
    ///
    /// # Safety
    /// No peer may write to `[disp, disp + len)` while the slice is alive.
    pub unsafe fn local_slice(&self, disp: usize, len: usize) -> Result<&[u8], Error> {
        let p = self.addr(self.group.rank(), disp, len, 1)?;
        Ok(std::slice::from_raw_parts(p as *const u8, len))
    }

    pub fn fetch_u8(&self, target: usize, disp: usize) -> Result<u8, Error> {
        Ok(self.atomic::<AtomicU8>(target, disp)?.load(Ordering::Acquire))
    }

    /// Write a single byte. `FetchOp` returns the previous value, `Accumulate`
    /// returns the value written.
    pub fn replace_u8(&self, target: usize, disp: usize, value: u8, mode: ReplaceMode) -> Result<u8, Error> {
        let cell = self.atomic::<AtomicU8>(target, disp)?;
        Ok(match mode {
            ReplaceMode::FetchOp => cell.swap(value, Ordering::AcqRel),
            ReplaceMode::Accumulate => {
                cell.store(value, Ordering::Release);
                value
            }
        })
    }

    pub fn load_u32(&self, target: usize, disp: usize) -> Result<u32, Error> {
        Ok(self.atomic::<AtomicU32>(target, disp)?.load(Ordering::Acquire))
    }

    pub fn store_u32(&self, target: usize, disp: usize, value: u32) -> Result<(), Error> {
        self.atomic::<AtomicU32>(target, disp)?.store(value, Ordering::Release);
        Ok(())
    }

    pub fn load_u64(&self, target: usize, disp: usize) -> Result<u64, Error> {
        Ok(self.atomic::<AtomicU64>(target, disp)?.load(Ordering::Acquire))
    }

    pub fn fetch_add_i32(&self, target: usize, disp: usize, delta: i32) -> Result<i32, Error> {
        Ok(self.atomic::<AtomicI32>(target, disp)?.fetch_add(delta, Ordering::AcqRel))
    }

    pub fn fetch_add_u32(&self, target: usize, disp: usize, delta: u32) -> Result<u32, Error> {
        Ok(self.atomic::<AtomicU32>(target, disp)?.fetch_add(delta, Ordering::AcqRel))
    }

    pub fn fetch_add_u64(&self, target: usize, disp: usize, delta: u64) -> Result<u64, Error> {
        Ok(self.atomic::<AtomicU64>(target, disp)?.fetch_add(delta, Ordering::AcqRel))
    }

    /// Compare-and-swap; returns the value found, equal to `expected` on success.
    pub fn compare_and_swap_i32(&self, target: usize, disp: usize, expected: i32, new: i32) -> Result<i32, Error> {
        let cell = self.atomic::<AtomicI32>(target, disp)?;
        Ok(match cell.compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire) {
            Ok(v) | Err(v) => v,
        })
    }

    pub fn compare_and_swap_u32(&self, target: usize, disp: usize, expected: u32, new: u32) -> Result<u32, Error> {
        let cell = self.atomic::<AtomicU32>(target, disp)?;
        Ok(match cell.compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire) {
            Ok(v) | Err(v) => v,
        })
    }

    pub fn compare_and_swap_u64(&self, target: usize, disp: usize, expected: u64, new: u64) -> Result<u64, Error> {
        let cell = self.atomic::<AtomicU64>(target, disp)?;
        Ok(match cell.compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire) {
            Ok(v) | Err(v) => v,
        })
    }

    /// Complete all outstanding operations towards `target`.
    pub fn flush(&self, target: usize) -> Result<(), Error> {
        if target >= self.segments.len() {
            return Err(Error::Invalid(format!("flush towards unknown rank {target}")));
        }
        fence(Ordering::SeqCst);
        counter!(telemetry::RMA_FLUSHES).increment(1);
        Ok(())
    }

    pub fn flush_all(&self) {
        fence(Ordering::SeqCst);
        counter!(telemetry::RMA_FLUSHES).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solo_window(bytes: usize) -> Window {
        let name = format!("unit_win_{}_{}", std::process::id(), rand::random::<u64>());
        let g = Group::join(&name, 0, 1).unwrap();
        Window::allocate(&g, bytes).unwrap()
    }

    #[test]
    fn out_of_range_and_misaligned_access_fail() {
        let w = solo_window(64);
        assert!(w.put(0, 60, &[0u8; 8]).is_err());
        assert!(w.fetch_add_u32(0, 2, 1).is_err());
        assert!(w.load_u64(1, 0).is_err());
        assert!(w.put(0, usize::MAX, &[1]).is_err());
    }

    #[test]
    fn atomics_report_previous_values() {
        let w = solo_window(64);
        assert_eq!(w.fetch_add_i32(0, 0, 5).unwrap(), 0);
        assert_eq!(w.compare_and_swap_i32(0, 0, 4, 9).unwrap(), 5);
        assert_eq!(w.compare_and_swap_i32(0, 0, 5, 9).unwrap(), 5);
        assert_eq!(w.fetch_add_i32(0, 0, 0).unwrap(), 9);
        assert_eq!(w.replace_u8(0, 8, 3, ReplaceMode::FetchOp).unwrap(), 0);
        assert_eq!(w.replace_u8(0, 8, 4, ReplaceMode::Accumulate).unwrap(), 4);
        assert_eq!(w.fetch_u8(0, 8).unwrap(), 4);
    }

    #[test]
    fn put_then_get() {
        let w = solo_window(32);
        assert_eq!(w.id(), 0);
        assert_eq!(w.len_of(0), Some(32));
        w.put(0, 16, b"window").unwrap();
        let mut out = [0u8; 6];
        w.get(0, 16, &mut out).unwrap();
        assert_eq!(&out, b"window");
        w.zero(0, 16, 6).unwrap();
        w.get(0, 16, &mut out).unwrap();
        assert_eq!(out, [0u8; 6]);
    }
}
