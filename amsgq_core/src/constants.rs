//! Constants and configuration keys for the active message queues

use std::time::Duration;

pub const GROUP_PREFIX: &str = "amsgq_grp_"; // control segment of a group
pub const WINDOW_PREFIX: &str = "amsgq_win_"; // one segment per rank and window

pub const FNV_OFFSET: u64 = 0xcbf29ce484222325;
pub const FNV_PRIME: u64 = 0x100000001b3;

pub const CACHE_LINE: usize = 64;

pub const GROUP_MAGIC: u64 = 0x414D_5347_5147_5250; // "AMSGQGRP"

/// How long a non-root peer waits for rank 0 to publish the group segment.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(30);
pub const JOIN_RETRY: Duration = Duration::from_millis(1);

/// Spins before a waiting loop starts yielding its time slice.
pub const SPIN_LIMIT: u32 = 64;

// ---- message wire format ------------------------------------------------
// u64  0 -- fn_handle
// u32  8 -- sender
// u32 12 -- payload_size
//     16 -- payload
pub const MSG_HEADER_SIZE: usize = 16;
pub const MSG_POS_FN: usize = 0;
pub const MSG_POS_SENDER: usize = 8;
pub const MSG_POS_SIZE: usize = 12;
pub const MSG_ALIGN: usize = 8;

// ---- inbox halves ---------------------------------------------------------
/// LOCKFREE claim value stored into `writer_count` by the reaper.
pub const LOCKFREE_SENTINEL: i32 = -(1 << 30);

/// SOPNOP bias added to the upper (writer) half of the fused word.
pub const SOPNOP_SENTINEL: i32 = -(1 << 30);
/// Senders treat any writer count at or below this as "being reaped".
pub const SOPNOP_THRESHOLD: i32 = SOPNOP_SENTINEL / 2;

// ---- environment ----------------------------------------------------------
pub const ENV_SOPNOP_SLEEP: &str = "DART_AMSGQ_SOPNOP_SLEEP";
pub const ENV_SOPNOP_FLUSH: &str = "DART_AMSGQ_SOPNOP_FLUSH";
pub const ENV_SOPNOP_FETCHOP: &str = "DART_AMSGQ_SOPNOP_FETCHOP";

/// Idle back-off of the SENDRECV progress thread.
pub const PROGRESS_IDLE: Duration = Duration::from_micros(50);
