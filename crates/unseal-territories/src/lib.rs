//! # Unseal Territories
//!
//! What lives on an unlocked filesystem:
//!
//! - **OS identification**: Windows (registry hives) and Linux (os-release)
//! - **Registry hives**: bounds-checked regf reader with same-length value rewrites
//! - **Credential stores**: SAM NT/LM hashes and `/etc/shadow` entries reset
//!   to a placeholder password
//!
//! ## Example
//!
//! ```rust,no_run
//! use unseal_territories::{identify, patch_profile};
//! use std::path::Path;
//!
//! let profile = identify(Path::new("/mnt/volume0")).unwrap();
//! let report = patch_profile(&profile, "unsealed").unwrap();
//! println!("{} accounts reset", report.patched().len());
//! ```

pub mod credentials;
pub mod hive;
pub mod os;

#[cfg(any(test, feature = "fixtures"))]
pub mod fixtures;

pub use credentials::{
    patch_profile, AccountPatch, CredentialStore, PatchOutcome, PatchReport, StoreReport, DIRTY_HIVE_WARNING,
};
pub use hive::Hive;
pub use os::{identify, OsFamily, OsProfile, StoreLocation};
