//! Platform-specific segment naming and cleanup

#[cfg(target_os = "windows")]
pub mod windows;
#[cfg(unix)]
pub mod unix;

#[cfg(unix)]
pub use unix::{make_os_id, purge_segment};
#[cfg(target_os = "windows")]
pub use windows::{make_os_id, purge_segment};
