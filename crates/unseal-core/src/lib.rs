//! # Unseal Core
//!
//! Core traits, types, and error handling for the unseal pipeline.
//!
//! This crate provides the foundational abstractions shared by every stage:
//! - **Zones**: Partitions found by the inspector
//! - **Volume kinds**: Plaintext filesystems and FDE schemes
//! - **Key material**: What the crypt mapper needs to expose a volume
//! - **Collaborators**: Traits for the external mapper, mounter and provisioner
//!
//! ## Example
//!
//! ```rust
//! use unseal_core::{DeclaredType, Zone};
//!
//! let zone = Zone::new(0, 1_048_576, 64 * 1_048_576, DeclaredType::Mbr(0x07), "NTFS/exFAT");
//! println!("{}", zone);
//! ```

pub mod bytes;
pub mod error;
pub mod security;
pub mod traits;
pub mod types;

// Re-export commonly used items
pub use bytes::{ByteView, Realm};
pub use error::{Error, ErrorKind, Result};
pub use security::*;
pub use traits::{CryptMapper, Mounter, Provisioner, ReadSeek, VolumeGroups, ZoneTable};
pub use types::{
    fingerprint, DeclaredType, Firmware, KeyMaterial, MapRequest, ProvisionRequest, VolumeKind, Zone,
};
