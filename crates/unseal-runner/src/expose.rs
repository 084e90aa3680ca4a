//! Decrypted volume exposure through the host collaborators
//!
//! [`Exposer::expose`] maps a volume to a block device, activates the LVM
//! volume group on it when there is one, and mounts the result. The
//! returned [`MountedFilesystem`] owns the whole stack and releases it
//! exactly once, either through [`MountedFilesystem::release`] or on drop.

use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use unseal_core::{CryptMapper, Error, KeyMaterial, MapRequest, Mounter, Result, VolumeGroups};
use unseal_seals::{MasterKeyResult, Seal, Volume};

/// Builds map requests and drives the mapper and mounter
pub struct Exposer<'a> {
    mapper: &'a dyn CryptMapper,
    mounter: &'a dyn Mounter,
    volume_groups: Option<&'a dyn VolumeGroups>,
}

impl<'a> Exposer<'a> {
    pub fn new(mapper: &'a dyn CryptMapper, mounter: &'a dyn Mounter) -> Self {
        Self {
            mapper,
            mounter,
            volume_groups: None,
        }
    }

    /// Look for LVM physical volumes on mapped devices
    pub fn with_volume_groups(mut self, volume_groups: &'a dyn VolumeGroups) -> Self {
        self.volume_groups = Some(volume_groups);
        self
    }

    /// Map and mount `volume`
    ///
    /// Encrypted volumes need the key resolved for them; plaintext volumes
    /// ignore `key`. When a decrypted device or a plain LVM volume carries
    /// a physical volume, every logical volume of its group is mounted;
    /// logical volumes that fail to mount (swap, for one) are skipped.
    ///
    /// # Errors
    ///
    /// - [`Error::UnsupportedScheme`] for `Unknown` volumes, and for LVM
    ///   volumes without a [`VolumeGroups`] collaborator
    /// - [`Error::InvalidOperation`] when an encrypted volume has no key, or
    ///   the key belongs to another volume
    /// - [`Error::Mount`] when the mapper, the group activation or every
    ///   mount fails; whatever was set up before the failure is torn down
    pub fn expose(&self, volume: &Volume, key: Option<&MasterKeyResult>) -> Result<MountedFilesystem<'a>> {
        let request = map_request(volume, key)?;
        let index = request.volume_index;
        let is_lvm = matches!(volume.seal(), Seal::Lvm { .. });
        if is_lvm && self.volume_groups.is_none() {
            return Err(Error::unsupported_scheme(format!(
                "volume {}: LVM2 physical volume and no volume group activator",
                index
            )));
        }

        let device = self
            .mapper
            .map(&request)
            .map_err(|e| Error::mount(format!("volume {}: mapping failed: {}", index, e)))?;
        debug!("Volume {} mapped to {}", index, device.display());

        let mut mounted = MountedFilesystem {
            volume_index: index,
            device,
            group_active: false,
            mounts: Vec::new(),
            mapper: self.mapper,
            mounter: self.mounter,
            volume_groups: self.volume_groups,
            released: false,
        };

        let logical_volumes = match self.volume_groups {
            Some(groups) if is_lvm || volume.kind().is_encrypted() => {
                match groups.activate(&mounted.device) {
                    Ok(found) => found,
                    Err(e) => {
                        return Err(mounted.abort(format!("activating volume group failed: {}", e)));
                    }
                }
            }
            _ => None,
        };

        match logical_volumes {
            Some(lvs) => {
                mounted.group_active = true;
                info!("Volume {}: volume group with {} logical volume(s)", index, lvs.len());
                for lv in lvs {
                    match self.mounter.mount(&lv) {
                        Ok(root) => {
                            info!("Volume {}: {} mounted at {}", index, lv.display(), root.display());
                            mounted.mounts.push(Mount { device: lv, root });
                        }
                        Err(e) => warn!("Volume {}: skipping {}: {}", index, lv.display(), e),
                    }
                }
                if mounted.mounts.is_empty() {
                    return Err(mounted.abort("no logical volume could be mounted".to_string()));
                }
            }
            None if is_lvm => {
                return Err(mounted.abort("no volume group found on the physical volume".to_string()));
            }
            None => match self.mounter.mount(&mounted.device) {
                Ok(root) => {
                    info!("Volume {} mounted at {}", index, root.display());
                    let device = mounted.device.clone();
                    mounted.mounts.push(Mount { device, root });
                }
                Err(e) => {
                    let reason = format!("mounting {} failed: {}", mounted.device.display(), e);
                    return Err(mounted.abort(reason));
                }
            },
        }

        Ok(mounted)
    }
}

/// Request handed to the mapper for `volume`
pub fn map_request(volume: &Volume, key: Option<&MasterKeyResult>) -> Result<MapRequest> {
    let index = volume.index();
    let material = match volume.seal() {
        Seal::Unknown { hint } => {
            return Err(Error::unsupported_scheme(format!("volume {}: {}", index, hint)));
        }
        Seal::PlaintextNtfs | Seal::PlaintextExt(_) | Seal::Lvm { .. } => KeyMaterial::Plain,
        Seal::BitLocker(_) | Seal::VeraCrypt(_) | Seal::Luks(_) => {
            let key = key.ok_or_else(|| {
                Error::invalid_operation(format!(
                    "volume {} is {} and has no resolved key",
                    index,
                    volume.kind()
                ))
            })?;
            if key.volume_index != index {
                return Err(Error::invalid_operation(format!(
                    "key resolved for volume {} cannot open volume {}",
                    key.volume_index, index
                )));
            }
            key.material.clone()
        }
    };
    let zone = volume.zone();
    Ok(MapRequest {
        volume_index: index,
        kind: volume.kind(),
        offset: zone.offset,
        length: zone.length,
        key: material,
    })
}

/// One mounted filesystem of a volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    /// Mapped device, or logical volume
    pub device: PathBuf,
    pub root: PathBuf,
}

/// A mounted decrypted volume
///
/// Always holds at least one mount. Unmounts, deactivates the volume group
/// and unmaps, in that order, when released or dropped.
pub struct MountedFilesystem<'a> {
    volume_index: usize,
    device: PathBuf,
    group_active: bool,
    mounts: Vec<Mount>,
    mapper: &'a dyn CryptMapper,
    mounter: &'a dyn Mounter,
    volume_groups: Option<&'a dyn VolumeGroups>,
    released: bool,
}

impl MountedFilesystem<'_> {
    pub fn volume_index(&self) -> usize {
        self.volume_index
    }

    /// Root of the first mounted tree
    pub fn root(&self) -> &Path {
        self.mounts.first().map_or(self.device.as_path(), |m| m.root.as_path())
    }

    /// Every mounted tree, in mount order
    pub fn mounts(&self) -> &[Mount] {
        &self.mounts
    }

    /// Mapped block device
    pub fn device(&self) -> &Path {
        &self.device
    }

    /// Unmount, deactivate and unmap, reporting the first failure
    pub fn release(mut self) -> Result<()> {
        self.release_once()
    }

    /// Tear down a partial exposure and build the error for it
    fn abort(mut self, reason: String) -> Error {
        if let Err(e) = self.release_once() {
            warn!("{}", e);
        }
        Error::mount(format!("volume {}: {}", self.volume_index, reason))
    }

    fn release_once(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let index = self.volume_index;

        let mut outcome = Ok(());
        for mount in self.mounts.iter().rev() {
            let unmounted = self.mounter.unmount(&mount.root).map_err(|e| {
                Error::mount(format!("volume {}: unmounting {} failed: {}", index, mount.root.display(), e))
            });
            outcome = outcome.and(unmounted);
        }
        if self.group_active {
            if let Some(groups) = self.volume_groups {
                let deactivated = groups.deactivate(&self.device).map_err(|e| {
                    Error::mount(format!(
                        "volume {}: deactivating volume group on {} failed: {}",
                        index,
                        self.device.display(),
                        e
                    ))
                });
                outcome = outcome.and(deactivated);
            }
        }
        let unmapped = self.mapper.unmap(&self.device).map_err(|e| {
            Error::mount(format!("volume {}: unmapping {} failed: {}", index, self.device.display(), e))
        });
        debug!("Volume {} released", index);
        outcome.and(unmapped)
    }
}

impl Drop for MountedFilesystem<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.release_once() {
            warn!("{}", e);
        }
    }
}

impl std::fmt::Debug for MountedFilesystem<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountedFilesystem")
            .field("volume_index", &self.volume_index)
            .field("device", &self.device)
            .field("group_active", &self.group_active)
            .field("mounts", &self.mounts)
            .field("released", &self.released)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeMapper, FakeMounter, FakeVolumeGroups};
    use unseal_core::{DeclaredType, Zone};
    use unseal_seals::ExtVariant;

    fn lvm_volume() -> Volume {
        Volume::new(
            Zone::new(3, 1 << 20, 8 << 20, DeclaredType::Mbr(0x8E), "Linux LVM"),
            Seal::Lvm {
                uuid: "Xq3bWc-9aLm-Tz0P-kR7v-Ne2S-u8Gh-Yd4FjK".into(),
            },
        )
    }

    fn ext_volume() -> Volume {
        Volume::new(
            Zone::new(1, 1 << 20, 8 << 20, DeclaredType::Mbr(0x83), "Linux"),
            Seal::PlaintextExt(ExtVariant::Ext4),
        )
    }

    #[test]
    fn test_release_runs_once_in_order() {
        let mapper = FakeMapper::default();
        let mounter = FakeMounter::new(std::env::temp_dir());
        let exposer = Exposer::new(&mapper, &mounter);

        let mounted = exposer.expose(&ext_volume(), None).unwrap();
        assert_eq!(mounted.device(), Path::new("/dev/fake1"));
        mounted.release().unwrap();

        assert_eq!(mapper.events(), vec!["map 1 Plain", "unmap /dev/fake1"]);
        assert_eq!(mounter.events(), vec!["mount /dev/fake1", "unmount"]);
    }

    #[test]
    fn test_drop_releases() {
        let mapper = FakeMapper::default();
        let mounter = FakeMounter::new(std::env::temp_dir());
        {
            let _mounted = Exposer::new(&mapper, &mounter).expose(&ext_volume(), None).unwrap();
        }
        assert_eq!(mapper.events().last().map(String::as_str), Some("unmap /dev/fake1"));
        assert_eq!(mounter.events().len(), 2);
    }

    #[test]
    fn test_mount_failure_unmaps() {
        let mapper = FakeMapper::default();
        let mounter = FakeMounter::failing();
        let err = Exposer::new(&mapper, &mounter).expose(&ext_volume(), None).unwrap_err();
        assert!(matches!(err, Error::Mount(ref msg) if msg.starts_with("volume 1:")));
        assert_eq!(mapper.events(), vec!["map 1 Plain", "unmap /dev/fake1"]);
    }

    #[test]
    fn test_unknown_volume_rejected() {
        let zone = Zone::new(2, 0, 1 << 20, DeclaredType::Mbr(0x07), "NTFS");
        let unknown = Volume::new(zone, Seal::Unknown { hint: "no recognised signature".into() });
        assert!(matches!(map_request(&unknown, None), Err(Error::UnsupportedScheme(_))));
    }

    #[test]
    fn test_lvm_mounts_every_logical_volume() {
        let mapper = FakeMapper::default();
        let groups = FakeVolumeGroups::default()
            .with_group("/dev/fake3", &["/dev/vg0/swap", "/dev/vg0/root", "/dev/vg0/home"]);
        let root = std::env::temp_dir().join("root");
        let home = std::env::temp_dir().join("home");
        let mounter = FakeMounter::failing()
            .with_device("/dev/vg0/root", root.clone())
            .with_device("/dev/vg0/home", home.clone());

        let mounted = Exposer::new(&mapper, &mounter)
            .with_volume_groups(&groups)
            .expose(&lvm_volume(), None)
            .unwrap();
        assert_eq!(mounted.root(), root.as_path());
        assert_eq!(
            mounted.mounts().iter().map(|m| m.device.clone()).collect::<Vec<_>>(),
            vec![PathBuf::from("/dev/vg0/root"), PathBuf::from("/dev/vg0/home")]
        );
        mounted.release().unwrap();

        assert_eq!(mapper.events(), vec!["map 3 Plain", "unmap /dev/fake3"]);
        assert_eq!(groups.events(), vec!["activate /dev/fake3", "deactivate /dev/fake3"]);
        assert_eq!(
            mounter.events(),
            vec![
                "mount /dev/vg0/swap",
                "mount /dev/vg0/root",
                "mount /dev/vg0/home",
                "unmount",
                "unmount"
            ]
        );
    }

    #[test]
    fn test_lvm_without_mountable_volume_tears_down() {
        let mapper = FakeMapper::default();
        let groups = FakeVolumeGroups::default().with_group("/dev/fake3", &["/dev/vg0/swap"]);
        let mounter = FakeMounter::failing();
        let err = Exposer::new(&mapper, &mounter)
            .with_volume_groups(&groups)
            .expose(&lvm_volume(), None)
            .unwrap_err();

        assert!(matches!(err, Error::Mount(ref msg) if msg == "volume 3: no logical volume could be mounted"));
        assert_eq!(groups.events(), vec!["activate /dev/fake3", "deactivate /dev/fake3"]);
        assert_eq!(mapper.events(), vec!["map 3 Plain", "unmap /dev/fake3"]);
    }

    #[test]
    fn test_lvm_needs_volume_groups() {
        let mapper = FakeMapper::default();
        let mounter = FakeMounter::new(std::env::temp_dir());
        let err = Exposer::new(&mapper, &mounter).expose(&lvm_volume(), None).unwrap_err();
        assert!(matches!(err, Error::UnsupportedScheme(_)));
        assert!(mapper.events().is_empty());
    }

    #[test]
    fn test_plaintext_filesystem_skips_activation() {
        let mapper = FakeMapper::default();
        let groups = FakeVolumeGroups::default();
        let mounter = FakeMounter::new(std::env::temp_dir());
        let mounted = Exposer::new(&mapper, &mounter)
            .with_volume_groups(&groups)
            .expose(&ext_volume(), None)
            .unwrap();
        assert_eq!(mounted.mounts().len(), 1);
        drop(mounted);
        assert!(groups.events().is_empty());
        assert_eq!(mapper.events(), vec!["map 1 Plain", "unmap /dev/fake1"]);
    }
}
