//! Windows-specific platform code for amsgq

pub fn make_os_id(prefix: &str, hash: u64, suffix: &str) -> String {
    format!("{prefix}{hash:016x}{suffix}")
}

/// Named file mappings vanish with their last handle; nothing to unlink.
pub fn purge_segment(_os_id: &str) -> bool {
    false
}
