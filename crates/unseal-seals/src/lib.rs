//! # Unseal Seals
//!
//! Volume classification and master-key resolution.
//!
//! - **Detection**: BitLocker, LUKS1/2, NTFS, ext2/3/4, VeraCrypt (entropy
//!   heuristic) and a catch-all `Unknown` with a hint
//! - **Candidates**: hex keys, key files, passphrases, XTS half-key pairs
//! - **Resolution**: header-based verification, first match in candidate
//!   order, verified in parallel
//!
//! ## Example
//!
//! ```rust,no_run
//! use unseal_pipeline::{DiskImage, ImageConfig};
//! use unseal_seals::{detect, resolve, CandidateSet, ResolverConfig};
//! use std::path::Path;
//!
//! let mut image = DiskImage::open(Path::new("disk.img"), &ImageConfig::default()).unwrap();
//! let length = image.length();
//! let map = unseal_zones::inspect(image.content(), length).unwrap();
//!
//! let mut candidates = CandidateSet::new();
//! candidates.load_key_file(Path::new("keys.txt")).unwrap();
//!
//! for zone in &map.zones {
//!     let volume = detect(image.content(), zone).unwrap();
//!     if volume.kind().is_encrypted() {
//!         let key = resolve(&volume, &candidates, image.content(), &ResolverConfig::default());
//!         println!("{}: {:?}", zone, key);
//!     }
//! }
//! ```

pub mod bitlocker;
pub mod detect;
pub mod kdf;
pub mod keys;
pub mod luks;
pub mod resolver;
pub mod sector;
pub mod veracrypt;
pub mod volume;

#[cfg(any(test, feature = "fixtures"))]
pub mod fixtures;

pub use detect::{detect, HEADER_PROBE_SIZE};
pub use keys::{parse_hex_key, CandidateKey, CandidateSet, KeyForm, Provenance, MAX_XTS_PAIRS};
pub use resolver::{default_workers, resolve, MasterKeyResult, ResolverConfig, VerificationMethod};
pub use volume::{ExtVariant, Seal, Volume};
