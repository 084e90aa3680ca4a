//! Core traits for unseal

use crate::{
    error::Result,
    types::{MapRequest, ProvisionRequest, Zone},
};
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};

/// Trait for partition tables (zone tables)
pub trait ZoneTable: Send + Sync {
    /// Get a human-readable identifier for this zone table type
    fn identify(&self) -> &str;

    /// Get all zones in this partition table, in slot order
    fn enumerate_zones(&self) -> &[Zone];

    /// Get a zone by its table index
    fn get_zone(&self, index: usize) -> Option<&Zone> {
        self.enumerate_zones().iter().find(|z| z.index == index)
    }
}

/// Exposes a (possibly encrypted) volume as a decrypted block device
///
/// Implementations wrap host tooling such as loop devices, dm-crypt or FUSE
/// drivers. The returned path identifies the mapping for [`CryptMapper::unmap`].
pub trait CryptMapper: Send + Sync {
    /// Create a decrypted block device for the requested volume
    fn map(&self, request: &MapRequest) -> Result<PathBuf>;

    /// Tear down a device previously returned by [`CryptMapper::map`]
    fn unmap(&self, device: &Path) -> Result<()>;
}

/// Mounts and unmounts decrypted block devices
pub trait Mounter: Send + Sync {
    /// Mount a block device read-write and return the mount root
    fn mount(&self, device: &Path) -> Result<PathBuf>;

    /// Unmount a root previously returned by [`Mounter::mount`]
    fn unmount(&self, root: &Path) -> Result<()>;
}

/// Activates LVM volume groups on mapped block devices
pub trait VolumeGroups: Send + Sync {
    /// Activate the volume group whose physical volume is `device`
    ///
    /// Returns the group's logical volumes, or `None` when `device` is not
    /// an LVM physical volume.
    fn activate(&self, device: &Path) -> Result<Option<Vec<PathBuf>>>;

    /// Deactivate the group activated from `device`
    fn deactivate(&self, device: &Path) -> Result<()>;
}

/// Receives the prepared image once every volume has been processed
pub trait Provisioner: Send + Sync {
    /// Hand the image off for VM provisioning
    fn provision(&self, request: &ProvisionRequest) -> Result<()>;
}

/// Combined trait for Read + Seek
pub trait ReadSeek: Read + Seek + Send {}

/// Blanket implementation for any type that implements Read + Seek
impl<T: Read + Seek + Send> ReadSeek for T {}
