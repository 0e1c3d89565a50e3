//! Back-end selection and environment-driven tuning

use crate::constants::{ENV_SOPNOP_FETCHOP, ENV_SOPNOP_FLUSH, ENV_SOPNOP_SLEEP};
use crate::helpers::{parse_bool, parse_duration};
use log::warn;
use std::fmt;
use std::time::Duration;

/// Which inbox protocol a queue speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    /// Two 32-bit atomics per half, reaper claims with compare-and-swap.
    LockFree,
    /// One fused 64-bit word per half, a single fetch-add admits and reserves.
    SopNop,
    /// Two-sided messaging with a progress thread.
    SendRecv,
}

impl Backend {
    pub const ALL: [Backend; 3] = [Backend::LockFree, Backend::SopNop, Backend::SendRecv];

    pub fn as_str(self) -> &'static str {
        match self {
            Backend::LockFree => "lockfree",
            Backend::SopNop => "sopnop",
            Backend::SendRecv => "sendrecv",
        }
    }
}

impl Default for Backend {
    /// Chosen at build time through the crate features; SOPNOP otherwise.
    fn default() -> Self {
        if cfg!(feature = "lockfree") {
            Backend::LockFree
        } else if cfg!(feature = "sendrecv") {
            Backend::SendRecv
        } else {
            Backend::SopNop
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Knobs of the SOPNOP back-end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SopnopConfig {
    /// Pause between polls of `process_blocking`. Zero means spin/yield only.
    pub sleep: Duration,
    /// Complete every put with a flush before the next one is issued.
    pub flush_after_put: bool,
    /// Update single bytes with fetch-and-op (swap) instead of accumulate.
    pub use_fetch_op: bool,
}

impl Default for SopnopConfig {
    fn default() -> Self {
        Self {
            sleep: Duration::ZERO,
            flush_after_put: true,
            use_fetch_op: false,
        }
    }
}

impl SopnopConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unparsable values keep the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        if let Some(raw) = lookup(ENV_SOPNOP_SLEEP) {
            match parse_duration(&raw) {
                Some(d) => cfg.sleep = d,
                None => warn!("ignoring {ENV_SOPNOP_SLEEP}={raw:?}: expected <int>[us|ms|s]"),
            }
        }
        if let Some(raw) = lookup(ENV_SOPNOP_FLUSH) {
            match parse_bool(&raw) {
                Some(b) => cfg.flush_after_put = b,
                None => warn!("ignoring {ENV_SOPNOP_FLUSH}={raw:?}: expected a boolean"),
            }
        }
        if let Some(raw) = lookup(ENV_SOPNOP_FETCHOP) {
            match parse_bool(&raw) {
                Some(b) => cfg.use_fetch_op = b,
                None => warn!("ignoring {ENV_SOPNOP_FETCHOP}={raw:?}: expected a boolean"),
            }
        }
        cfg
    }
}

/// Runtime configuration handed to [`crate::Amsgq::init_with_config`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AmsgqConfig {
    pub backend: Backend,
    pub sopnop: SopnopConfig,
}

impl AmsgqConfig {
    pub fn from_env() -> Self {
        Self {
            backend: Backend::default(),
            sopnop: SopnopConfig::from_env(),
        }
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }
}
