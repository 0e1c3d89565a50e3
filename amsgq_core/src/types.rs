//! Data structures laid out in shared memory

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, AtomicU8};

/// A counter on its own cache line.
#[repr(C, align(64))]
pub struct PaddedCounter {
    pub value: AtomicU64,
}

/// Control segment of a group. The OS hands it out zero-filled, so every
/// counter starts at 0 without explicit initialisation.
#[repr(C)]
pub struct GroupHeader {
    pub magic: AtomicU64, // GROUP_MAGIC once rank 0 has published the segment
    pub size: AtomicU64,  // number of ranks
    pub arrived: PaddedCounter,    // peers inside the current barrier
    pub generation: PaddedCounter, // completed barriers
}

/// One half of a LOCKFREE inbox: two independent 32-bit counters.
#[repr(C, align(8))]
pub struct LockFreeHalf {
    pub writer_count: AtomicI32, // < 0 while the reaper owns the half
    pub tail_offset: AtomicU32,  // next free byte in the half's data region
}

/// One half of a SOPNOP inbox: `(writer_count << 32) | tail_offset`.
#[repr(C, align(8))]
pub struct FusedHalf {
    pub fused: AtomicU64,
}

/// Head of a LOCKFREE inbox window; the data halves follow at `data_base`.
#[repr(C, align(64))]
pub struct LockFreeInboxHeader {
    pub active_half: AtomicU8,
    pub _pad: [u8; 7],
    pub halves: [LockFreeHalf; 2],
}

/// Head of a SOPNOP inbox window.
#[repr(C, align(64))]
pub struct FusedInboxHeader {
    pub active_half: AtomicU8,
    pub _pad: [u8; 7],
    pub halves: [FusedHalf; 2],
}

/// Header of one pre-posted receive slot of a two-sided channel.
#[repr(C)]
pub struct ChannelSlotHeader {
    pub state: AtomicU32, // SLOT_EMPTY / SLOT_FULL
    pub tag: AtomicU32,
    pub len: AtomicU32,
    pub _reserved: u32,
}

pub const SLOT_EMPTY: u32 = 0;
pub const SLOT_FULL: u32 = 1;

const _: () = assert!(std::mem::size_of::<LockFreeHalf>() == 8);
const _: () = assert!(std::mem::size_of::<FusedHalf>() == 8);
const _: () = assert!(std::mem::size_of::<ChannelSlotHeader>() == 16);
const _: () = assert!(std::mem::align_of::<GroupHeader>() == crate::constants::CACHE_LINE);
