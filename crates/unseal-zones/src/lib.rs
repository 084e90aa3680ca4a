//! # Unseal Zones
//!
//! Partition table inspection for disk images.
//!
//! - **MBR**: Master Boot Record with extended/logical partition chains
//! - **GPT**: GUID Partition Table with backup header fallback
//!
//! [`inspect`] picks the right table and returns every partition as a
//! [`Zone`]; an image without a recognized table is an
//! [`Error::ImageFormat`](unseal_core::Error::ImageFormat).
//!
//! ## Example
//!
//! ```rust,no_run
//! use unseal_pipeline::{DiskImage, ImageConfig};
//! use std::path::Path;
//!
//! let mut image = DiskImage::open(Path::new("disk.img"), &ImageConfig::default()).unwrap();
//! let length = image.length();
//! let map = unseal_zones::inspect(image.content(), length).unwrap();
//!
//! println!("Partition table: {}", map.scheme);
//! for zone in &map.zones {
//!     println!("  {}", zone);
//! }
//! ```

pub mod gpt;
pub mod mbr;

#[cfg(any(test, feature = "fixtures"))]
pub mod fixtures;

pub use gpt::GptZoneTable;
pub use mbr::MbrZoneTable;

use serde::Serialize;
use std::fmt;
use tracing::{debug, info};
use unseal_core::{Error, ReadSeek, Result, Zone, ZoneTable};

/// Partitioning scheme found on the image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PartitionScheme {
    Mbr,
    Gpt,
}

impl fmt::Display for PartitionScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionScheme::Mbr => f.write_str("MBR"),
            PartitionScheme::Gpt => f.write_str("GPT"),
        }
    }
}

/// All partitions of one image
#[derive(Debug, Clone, Serialize)]
pub struct PartitionMap {
    /// Table the zones came from
    pub scheme: PartitionScheme,
    /// Logical sector size used to interpret LBAs
    pub sector_size: u32,
    /// Partitions in table order
    pub zones: Vec<Zone>,
}

impl PartitionMap {
    fn from_table(scheme: PartitionScheme, sector_size: u32, table: &dyn ZoneTable) -> Self {
        Self {
            scheme,
            sector_size,
            zones: table.enumerate_zones().to_vec(),
        }
    }

    /// True when an EFI system partition is present
    pub fn has_efi_system_partition(&self) -> bool {
        self.zones.iter().any(|z| z.declared.is_efi_system())
    }
}

/// Sector sizes probed for a GPT header
const GPT_SECTOR_SIZES: [u32; 2] = [512, 4096];

/// Enumerate the partitions of a disk image
///
/// A protective MBR defers to the GPT (512-byte sectors first, then 4096);
/// otherwise the MBR and its extended chain are used.
///
/// # Errors
///
/// [`Error::ImageFormat`] when no usable table exists. This is the only
/// error that aborts a run.
pub fn inspect(stream: &mut dyn ReadSeek, image_len: u64) -> Result<PartitionMap> {
    let mbr = MbrZoneTable::parse(stream, 512)?;

    if !mbr.is_gpt_protective() {
        info!("Found MBR with {} partitions", mbr.enumerate_zones().len());
        return Ok(PartitionMap::from_table(PartitionScheme::Mbr, 512, &mbr));
    }

    let mut first_err = None;
    for sector_size in GPT_SECTOR_SIZES {
        match GptZoneTable::parse(stream, sector_size, image_len) {
            Ok(gpt) => {
                info!(
                    "Found GPT ({}-byte sectors) with {} partitions",
                    sector_size,
                    gpt.enumerate_zones().len()
                );
                return Ok(PartitionMap::from_table(PartitionScheme::Gpt, sector_size, &gpt));
            }
            Err(e) => {
                debug!("No GPT with {}-byte sectors: {}", sector_size, e);
                first_err.get_or_insert(e);
            }
        }
    }

    Err(Error::image_format(format!(
        "protective MBR present but GPT unreadable: {}",
        first_err.map(|e| e.to_string()).unwrap_or_default()
    )))
}
