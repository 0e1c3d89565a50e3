//! Unix-specific platform code for amsgq

/// POSIX shm names: no slash, stay well below NAME_MAX.
pub fn make_os_id(prefix: &str, hash: u64, suffix: &str) -> String {
    format!("{prefix}{hash:016x}{suffix}")
}

/// Unlink a segment left behind by a job that died before closing it.
pub fn purge_segment(os_id: &str) -> bool {
    use std::ffi::CString;
    match CString::new(os_id) {
        Ok(c_name) => unsafe { libc::shm_unlink(c_name.as_ptr()) == 0 },
        Err(_) => false,
    }
}
