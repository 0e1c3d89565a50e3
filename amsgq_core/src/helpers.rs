//! Helper functions shared by the transport and the queue back-ends

use crate::constants::{FNV_OFFSET, FNV_PRIME, SPIN_LIMIT};
use std::time::Duration;

pub fn fnv1a_64(s: &str) -> u64 {
    let mut h = FNV_OFFSET;
    for &b in s.as_bytes() {
        h ^= b as u64;
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

#[inline(always)]
pub const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

// Packs a writer count and a tail offset into the single word a SOPNOP half
// is driven by. Upper 32 bits: writers (signed), lower 32 bits: tail.
#[inline]
pub fn pack(writers: i32, tail: u32) -> u64 {
    ((writers as u32 as u64) << 32) | (tail as u64)
}

#[inline]
pub fn unpack(word: u64) -> (i32, u32) {
    ((word >> 32) as u32 as i32, word as u32)
}

/// Delta that adds `writers` to the upper field and `tail` to the lower one.
#[inline]
pub fn pack_delta(writers: i32, tail: u32) -> u64 {
    ((writers as i64 as u64) << 32).wrapping_add(tail as u64)
}

/// Parse `<int>[us|ms|s]`; a bare integer counts microseconds.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let s = raw.trim();
    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(i) => s.split_at(i),
        None => (s, ""),
    };
    let value: u64 = digits.parse().ok()?;
    match unit.trim().to_ascii_lowercase().as_str() {
        "" | "us" => Some(Duration::from_micros(value)),
        "ms" => Some(Duration::from_millis(value)),
        "s" => Some(Duration::from_secs(value)),
        _ => None,
    }
}

pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Spin first, then yield; used by every wait loop in the crate.
#[derive(Default)]
pub struct Backoff {
    step: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self { step: 0 }
    }

    #[inline]
    pub fn snooze(&mut self) {
        if self.step < SPIN_LIMIT {
            self.step += 1;
            core::hint::spin_loop();
        } else {
            std::thread::yield_now();
        }
    }

    /// Like `snooze`, but sleeps for `pause` once spinning is exhausted.
    pub fn snooze_for(&mut self, pause: Duration) {
        if pause.is_zero() || self.step < SPIN_LIMIT {
            self.snooze();
        } else {
            std::thread::sleep(pause);
        }
    }
}
