//! # Unseal Pipeline
//!
//! Read-only access to the disk image under preparation.
//!
//! - **DiskImage**: The image file, memory-mapped when possible
//! - **ZoneWindow**: One partition presented as an independent stream
//! - **MmapPipeline**: Memory-mapped image access
//!
//! ## Example
//!
//! ```rust,no_run
//! use unseal_pipeline::{DiskImage, ImageConfig};
//! use unseal_core::{DeclaredType, Zone};
//! use std::path::Path;
//!
//! let mut image = DiskImage::open(Path::new("disk.img"), &ImageConfig::default()).unwrap();
//! let zone = Zone::new(0, 1_048_576, 1_048_576, DeclaredType::Mbr(0x07), "NTFS/exFAT");
//! let mut window = image.window(&zone).unwrap();
//! let boot_sector = window.read_at(0, 512).unwrap();
//! ```

pub mod image;
pub mod mmap;
pub mod window;

pub use image::{DiskImage, ImageConfig};
pub use mmap::MmapPipeline;
pub use window::{read_region, ZoneWindow};
