//! Security validation constants and helpers
//!
//! Limits applied while parsing untrusted disk images, volume headers and
//! credential stores.

use crate::bytes::Realm;

/// Maximum sector size we'll accept (4KB - common for advanced format)
pub const MAX_SECTOR_SIZE: u32 = 4096;

/// Maximum allocation size for single buffer (256 MB)
pub const MAX_ALLOCATION_SIZE: usize = 256 * 1024 * 1024;

/// Maximum partition count (128 for GPT, padded for safety)
pub const MAX_PARTITION_COUNT: usize = 256;

/// Maximum file size for memory mapping (16 GB - practical limit for most systems)
pub const MAX_MMAP_SIZE: u64 = 16 * 1024 * 1024 * 1024;

/// Maximum size of FDE metadata read for verification (4 MB)
pub const MAX_METADATA_SIZE: usize = 4 * 1024 * 1024;

/// Maximum registry hive size we will load (256 MB)
pub const MAX_HIVE_SIZE: u64 = MAX_ALLOCATION_SIZE as u64;

/// Maximum size of text credential stores and key files (16 MB)
pub const MAX_TEXT_FILE_SIZE: u64 = 16 * 1024 * 1024;

/// Validate that a size is within allocation limits
///
/// # Security
/// Prevents memory exhaustion from hostile size fields
pub fn validate_allocation_size(size: u64, limit: usize, realm: Realm, context: &str) -> crate::Result<usize> {
    if size > limit as u64 {
        return Err(realm.error(format!("{} size {} exceeds limit {}", context, size, limit)));
    }

    size.try_into()
        .map_err(|_| realm.error(format!("{} size exceeds platform limits", context)))
}

/// Safely multiply two u64 values with overflow checking
pub fn checked_multiply_u64(a: u64, b: u64, realm: Realm, context: &str) -> crate::Result<u64> {
    a.checked_mul(b)
        .ok_or_else(|| realm.error(format!("{}: multiplication overflow", context)))
}

/// Safely add two u64 values with overflow checking
pub fn checked_add_u64(a: u64, b: u64, realm: Realm, context: &str) -> crate::Result<u64> {
    a.checked_add(b)
        .ok_or_else(|| realm.error(format!("{}: addition overflow", context)))
}

/// Safely convert u64 to usize with platform checking
pub fn u64_to_usize(value: u64, realm: Realm, context: &str) -> crate::Result<usize> {
    value.try_into().map_err(|_| {
        realm.error(format!(
            "{}: value {} exceeds platform usize limit",
            context, value
        ))
    })
}

/// Validate sector size is reasonable
pub fn validate_sector_size(sector_size: u32) -> crate::Result<()> {
    if sector_size < 512 || sector_size > MAX_SECTOR_SIZE || !sector_size.is_power_of_two() {
        return Err(Realm::Image.error(format!(
            "Invalid sector size: {} (must be a power of 2 in 512-{})",
            sector_size, MAX_SECTOR_SIZE
        )));
    }

    Ok(())
}
