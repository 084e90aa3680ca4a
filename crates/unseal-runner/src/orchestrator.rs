//! Whole-image pipeline
//!
//! Each zone runs through detection, key resolution, exposure, OS
//! identification and credential patching. A failure is recorded in that
//! zone's report and the run moves on; only an unreadable partition table
//! ends the run.

use crate::config::RunConfig;
use crate::expose::{Exposer, MountedFilesystem};
use crate::report::{RunSummary, Verification, VolumeReport};
use chrono::Utc;
use std::path::Path;
use tracing::{debug, info, warn};
use unseal_core::{
    CryptMapper, Error, Firmware, Mounter, ProvisionRequest, Provisioner, Result, VolumeGroups, VolumeKind,
    Zone,
};
use unseal_pipeline::DiskImage;
use unseal_seals::{detect, resolve, CandidateSet, Seal};
use unseal_territories::{identify, patch_profile};

/// Drives the pipeline over one image at a time
pub struct Orchestrator {
    config: RunConfig,
    mapper: Box<dyn CryptMapper>,
    mounter: Box<dyn Mounter>,
    volume_groups: Option<Box<dyn VolumeGroups>>,
    provisioner: Option<Box<dyn Provisioner>>,
}

impl Orchestrator {
    pub fn new(config: RunConfig, mapper: Box<dyn CryptMapper>, mounter: Box<dyn Mounter>) -> Self {
        Self {
            config,
            mapper,
            mounter,
            volume_groups: None,
            provisioner: None,
        }
    }

    /// Activate LVM volume groups found on plain or decrypted volumes
    pub fn with_volume_groups(mut self, volume_groups: Box<dyn VolumeGroups>) -> Self {
        self.volume_groups = Some(volume_groups);
        self
    }

    /// Hand the prepared image to `provisioner` at the end of each run
    pub fn with_provisioner(mut self, provisioner: Box<dyn Provisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Open the image at `path` and process it
    pub fn run(&self, path: &Path, candidates: &CandidateSet) -> Result<RunSummary> {
        let mut image = DiskImage::open(path, &self.config.image())?;
        self.run_image(&mut image, candidates)
    }

    /// Process every zone of an opened image
    ///
    /// # Errors
    ///
    /// Only failures to read the partition table are returned; everything
    /// per volume lands in [`RunSummary::volumes`].
    pub fn run_image(&self, image: &mut DiskImage, candidates: &CandidateSet) -> Result<RunSummary> {
        let started_at = Utc::now();
        let length = image.length();
        let map = unseal_zones::inspect(image.content(), length)?;
        info!(
            "Processing {} ({} partitions, {} candidate keys)",
            image.path().display(),
            map.zones.len(),
            candidates.len()
        );

        let mut volumes = Vec::new();
        let mut excluded = Vec::new();
        for zone in &map.zones {
            if self.config.is_excluded(zone.index) {
                info!("Volume {} excluded by configuration", zone.index);
                excluded.push(zone.index);
                continue;
            }
            volumes.push(self.process_zone(image, zone, candidates));
        }

        let os_hint = volumes
            .iter()
            .find_map(|v| v.os.as_ref().map(|os| os.guest_os_hint.clone()));
        let firmware = if map.has_efi_system_partition() {
            Firmware::Efi
        } else {
            Firmware::Bios
        };

        let provisioned = match &self.provisioner {
            Some(provisioner) => {
                let request = ProvisionRequest {
                    image: image.path().to_path_buf(),
                    guest_os: os_hint.clone(),
                    firmware,
                };
                match provisioner.provision(&request) {
                    Ok(()) => {
                        info!("Image handed off for provisioning");
                        true
                    }
                    Err(e) => {
                        warn!("Provisioning hand-off failed: {}", e);
                        false
                    }
                }
            }
            None => false,
        };

        Ok(RunSummary {
            image: image.path().to_path_buf(),
            scheme: map.scheme,
            started_at,
            finished_at: Utc::now(),
            volumes,
            excluded,
            os_hint,
            firmware,
            provisioned,
        })
    }

    fn process_zone(&self, image: &mut DiskImage, zone: &Zone, candidates: &CandidateSet) -> VolumeReport {
        let mut report = VolumeReport::new(zone.index, VolumeKind::Unknown, &zone.zone_type, zone.offset, zone.length);
        if let Err(e) = self.unseal(image, zone, candidates, &mut report) {
            let e = e.in_volume(zone.index);
            warn!("{}", e);
            report.record_error(&e);
        }
        report
    }

    fn unseal(
        &self,
        image: &mut DiskImage,
        zone: &Zone,
        candidates: &CandidateSet,
        report: &mut VolumeReport,
    ) -> Result<()> {
        let volume = detect(image.content(), zone)?;
        report.kind = volume.kind();
        if let Seal::Unknown { hint } = volume.seal() {
            report.detail = Some(hint.clone());
            return Err(Error::unsupported_scheme(hint.clone()));
        }

        let key = if volume.kind().is_encrypted() {
            let key = resolve(&volume, candidates, image.content(), &self.config.resolver())?;
            report.verification = Some(Verification::from(&key));
            Some(key)
        } else {
            None
        };

        let mut exposer = Exposer::new(self.mapper.as_ref(), self.mounter.as_ref());
        if let Some(groups) = &self.volume_groups {
            exposer = exposer.with_volume_groups(groups.as_ref());
        }
        let mounted = exposer.expose(&volume, key.as_ref())?;
        report.bypassed = true;

        let outcome = self.reset_credentials(&mounted, report);
        let released = mounted.release();
        outcome.and(released)
    }

    fn reset_credentials(&self, mounted: &MountedFilesystem<'_>, report: &mut VolumeReport) -> Result<()> {
        let mut first_err = None;
        let mut found = None;
        for mount in mounted.mounts() {
            match identify(&mount.root) {
                Ok(profile) => {
                    found = Some(profile);
                    break;
                }
                Err(e) => {
                    debug!("No operating system on {}: {}", mount.device.display(), e);
                    first_err.get_or_insert(e);
                }
            }
        }
        let profile = match (found, first_err) {
            (Some(profile), _) => profile,
            (None, Some(e)) => return Err(e),
            (None, None) => {
                return Err(Error::unknown_os(format!(
                    "volume {} has no mounted filesystem",
                    mounted.volume_index()
                )))
            }
        };
        report.os = Some(profile.clone());

        if !self.config.patch_credentials {
            report.detail = Some("credential patching disabled".to_string());
            return Ok(());
        }
        if profile.credential_stores.is_empty() {
            report.detail = Some(format!("{} found but no credential store", profile.version));
            return Ok(());
        }
        let patch = patch_profile(&profile, &self.config.placeholder_password)?;
        report.record_patch(&patch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeMapper, FakeMounter, FakeProvisioner, FakeVolumeGroups};
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;
    use unseal_core::{ErrorKind, KeyMaterial, MapRequest};
    use unseal_seals::bitlocker::EncryptionMethod;
    use unseal_seals::fixtures::{
        ext_volume, luks1_volume, lvm_volume, ntfs_volume, pseudo_random, BitLockerFixture, LuksFixture,
    };
    use unseal_seals::{ExtVariant, Provenance};
    use unseal_territories::credentials::ntlm::nt_hash;
    use unseal_territories::credentials::SamStore;
    use unseal_territories::fixtures::{linux_root, windows_root, SamFixture, SamKeyRevision};
    use unseal_territories::OsFamily;
    use unseal_zones::fixtures::{gpt_disk, mbr_disk, place, GptPartitionSpec};
    use unseal_zones::gpt::PartitionTypeGuid;

    const SHADOW: &str = "root:$6$rootsalt$x:19000:0:99999:7:::\n\
daemon:*:19000:0:99999:7:::\n\
alice:$5$alicesalt$y:19000:0:99999:7:::\n";

    /// Shares the fakes with the orchestrator while keeping access for asserts
    struct Shared<T>(Arc<T>);

    impl CryptMapper for Shared<FakeMapper> {
        fn map(&self, request: &MapRequest) -> Result<std::path::PathBuf> {
            self.0.map(request)
        }
        fn unmap(&self, device: &Path) -> Result<()> {
            self.0.unmap(device)
        }
    }

    impl Mounter for Shared<FakeMounter> {
        fn mount(&self, device: &Path) -> Result<std::path::PathBuf> {
            self.0.mount(device)
        }
        fn unmount(&self, root: &Path) -> Result<()> {
            self.0.unmount(root)
        }
    }

    impl VolumeGroups for Shared<FakeVolumeGroups> {
        fn activate(&self, device: &Path) -> Result<Option<Vec<std::path::PathBuf>>> {
            self.0.activate(device)
        }
        fn deactivate(&self, device: &Path) -> Result<()> {
            self.0.deactivate(device)
        }
    }

    impl Provisioner for Shared<FakeProvisioner> {
        fn provision(&self, request: &ProvisionRequest) -> Result<()> {
            self.0.provision(request)
        }
    }

    struct Harness {
        mapper: Arc<FakeMapper>,
        mounter: Arc<FakeMounter>,
        orchestrator: Orchestrator,
    }

    fn harness(mounter: FakeMounter, config: RunConfig) -> Harness {
        let mapper = Arc::new(FakeMapper::default());
        let mounter = Arc::new(mounter);
        let orchestrator = Orchestrator::new(
            config,
            Box::new(Shared(mapper.clone())),
            Box::new(Shared(mounter.clone())),
        );
        Harness { mapper, mounter, orchestrator }
    }

    /// MBR disk with 64 KiB volumes at LBA 64, 192, 320, ...
    fn mbr_image(volumes: &[(u8, Vec<u8>)]) -> DiskImage {
        let entries: Vec<(u8, u32, u32)> = volumes
            .iter()
            .enumerate()
            .map(|(i, (code, _))| (*code, 64 + 128 * i as u32, 128))
            .collect();
        let mut disk = mbr_disk(64 + 128 * volumes.len() as u64, &entries);
        for (i, (_, bytes)) in volumes.iter().enumerate() {
            place(&mut disk, (64 + 128 * i as u64) * 512, bytes);
        }
        DiskImage::from_bytes("disk.img", disk)
    }

    fn shadow_field_counts(text: &str) -> Vec<usize> {
        text.lines().map(|l| l.split(':').count()).collect()
    }

    #[test]
    fn test_plaintext_ext4_linux_end_to_end() {
        let root = TempDir::new().unwrap();
        linux_root(root.path(), "PRETTY_NAME=\"Debian GNU/Linux 12 (bookworm)\"\n", SHADOW);
        let h = harness(FakeMounter::new(root.path().to_path_buf()), RunConfig::default());
        let mut image = mbr_image(&[(0x83, ext_volume(64 * 1024, ExtVariant::Ext4))]);

        let summary = h.orchestrator.run_image(&mut image, &CandidateSet::new()).unwrap();
        let volume = &summary.volumes[0];
        assert!(volume.error.is_none(), "{:?}", volume.error);
        assert_eq!(volume.kind, VolumeKind::PlaintextExt);
        assert!(volume.bypassed);
        assert_eq!(volume.os.as_ref().unwrap().family, OsFamily::Linux);
        assert_eq!(volume.patched_accounts, vec!["root", "alice"]);
        assert_eq!(volume.skipped_accounts.len(), 1);

        let patched = fs::read_to_string(root.path().join("etc/shadow")).unwrap();
        assert_eq!(shadow_field_counts(&patched), shadow_field_counts(SHADOW));
        for (before, after) in SHADOW.lines().zip(patched.lines()) {
            let b: Vec<&str> = before.split(':').collect();
            let a: Vec<&str> = after.split(':').collect();
            assert_eq!(b[0], a[0]);
            assert_eq!(b[2..], a[2..]);
        }
        assert_eq!(h.mapper.events(), vec!["map 0 Plain", "unmap /dev/fake0"]);
        assert_eq!(h.mounter.events(), vec!["mount /dev/fake0", "unmount"]);
    }

    #[test]
    fn test_bitlocker_third_of_five_candidates_then_sam() {
        let fixture = BitLockerFixture::new(EncryptionMethod::Aes128Xts);
        let keys = TempDir::new().unwrap();
        let key_file = keys.path().join("keys.txt");
        let mut lines = Vec::new();
        for i in 0..5u8 {
            if i == 2 {
                lines.push(hex::encode(&fixture.fvek));
            } else {
                lines.push(hex::encode(pseudo_random(&[b'w', i], fixture.fvek.len())));
            }
        }
        fs::write(&key_file, lines.join("\n")).unwrap();
        let mut candidates = CandidateSet::new();
        candidates.load_key_file(&key_file).unwrap();

        let root = TempDir::new().unwrap();
        windows_root(root.path(), &SamFixture::new(SamKeyRevision::Aes));
        let config = RunConfig { workers: 3, ..RunConfig::default() };
        let h = harness(FakeMounter::new(root.path().to_path_buf()), config);
        let mut image = mbr_image(&[(0x07, fixture.build())]);

        let summary = h.orchestrator.run_image(&mut image, &candidates).unwrap();
        let volume = &summary.volumes[0];
        assert!(volume.error.is_none(), "{:?}", volume.error);
        assert_eq!(volume.kind, VolumeKind::BitLocker);
        let verification = volume.verification.as_ref().unwrap();
        assert_eq!(verification.candidate, Some(2));
        assert_eq!(
            verification.provenance,
            Some(Provenance::KeyFile { path: key_file.clone(), line: 3 })
        );

        let requests = h.mapper.requests.lock().unwrap();
        match &requests[0].key {
            KeyMaterial::BitLocker { method, fvek } => {
                assert_eq!(*method, EncryptionMethod::Aes128Xts.code());
                assert_eq!(fvek, &fixture.fvek);
            }
            other => panic!("unexpected key material {:?}", other),
        }

        assert_eq!(volume.patched_accounts, vec!["Administrator", "Guest"]);
        assert_eq!(volume.skipped_accounts[0].account, "DefaultAccount");
        let config_dir = root.path().join("Windows/System32/config");
        let store = SamStore::load(&config_dir.join("SAM"), &config_dir.join("SYSTEM")).unwrap();
        for user in store.users().unwrap().iter().filter(|u| !u.nt.is_empty()) {
            assert_eq!(store.nt_hash_of(user).unwrap(), Some(nt_hash("unsealed")));
        }
        assert_eq!(summary.os_hint.as_deref(), Some("windows9-64"));
    }

    #[test]
    fn test_unknown_volume_skipped_plaintext_completed() {
        let root = TempDir::new().unwrap();
        windows_root(root.path(), &SamFixture::new(SamKeyRevision::Rc4));
        let h = harness(FakeMounter::new(root.path().to_path_buf()), RunConfig::default());
        let mut image = mbr_image(&[(0x07, vec![0u8; 64 * 1024]), (0x07, ntfs_volume(64 * 1024))]);

        let summary = h.orchestrator.run_image(&mut image, &CandidateSet::new()).unwrap();
        let unknown = &summary.volumes[0];
        assert_eq!(unknown.kind, VolumeKind::Unknown);
        assert!(!unknown.bypassed);
        let error = unknown.error.as_ref().unwrap();
        assert_eq!(error.kind, ErrorKind::UnsupportedScheme);
        assert!(error.message.contains("volume 0: no recognised signature"));

        let ntfs = &summary.volumes[1];
        assert!(ntfs.error.is_none(), "{:?}", ntfs.error);
        assert!(ntfs.bypassed);
        assert_eq!(ntfs.patched_accounts.len(), 2);
        assert_eq!(h.mapper.events(), vec!["map 1 Plain", "unmap /dev/fake1"]);
    }

    #[test]
    fn test_no_matching_key_never_mounts() {
        let fixture = BitLockerFixture::new(EncryptionMethod::Aes128Xts);
        let mut candidates = CandidateSet::new();
        for i in 0..4u8 {
            candidates
                .add_hex(&hex::encode(pseudo_random(&[b'x', i], fixture.fvek.len())), i as usize)
                .unwrap();
        }
        let h = harness(FakeMounter::new(std::env::temp_dir()), RunConfig::default());
        let mut image = mbr_image(&[(0x07, fixture.build())]);

        let summary = h.orchestrator.run_image(&mut image, &candidates).unwrap();
        let error = summary.volumes[0].error.as_ref().unwrap();
        assert_eq!(error.kind, ErrorKind::NoMatchingKey);
        assert!(error.message.contains("4 candidates tried"));
        assert!(h.mapper.events().is_empty());
        assert!(h.mounter.events().is_empty());
    }

    #[test]
    fn test_mount_failure_does_not_stop_siblings() {
        let root = TempDir::new().unwrap();
        linux_root(root.path(), "PRETTY_NAME=\"Test\"\n", SHADOW);
        let mounter = FakeMounter::failing().with_root(1, root.path().to_path_buf());
        let h = harness(mounter, RunConfig::default());
        let mut image = mbr_image(&[
            (0x83, ext_volume(64 * 1024, ExtVariant::Ext4)),
            (0x83, ext_volume(64 * 1024, ExtVariant::Ext3)),
        ]);

        let summary = h.orchestrator.run_image(&mut image, &CandidateSet::new()).unwrap();
        assert_eq!(summary.volumes[0].error.as_ref().unwrap().kind, ErrorKind::Mount);
        assert!(summary.volumes[1].bypassed);
        assert!(summary.volumes[1].error.is_none());
        // The failed mount was still unmapped
        assert!(h.mapper.events().contains(&"unmap /dev/fake0".to_string()));
    }

    #[test]
    fn test_unknown_os_recorded_and_released() {
        let root = TempDir::new().unwrap();
        let h = harness(FakeMounter::new(root.path().to_path_buf()), RunConfig::default());
        let mut image = mbr_image(&[(0x83, ext_volume(64 * 1024, ExtVariant::Ext2))]);

        let summary = h.orchestrator.run_image(&mut image, &CandidateSet::new()).unwrap();
        let volume = &summary.volumes[0];
        assert!(volume.bypassed);
        assert_eq!(volume.error.as_ref().unwrap().kind, ErrorKind::UnknownOs);
        assert_eq!(h.mounter.events(), vec!["mount /dev/fake0", "unmount"]);
    }

    #[test]
    fn test_excluded_zone_untouched() {
        let config = RunConfig {
            excluded: [0].into_iter().collect(),
            ..RunConfig::default()
        };
        let h = harness(FakeMounter::new(std::env::temp_dir()), config);
        let mut image = mbr_image(&[(0x83, ext_volume(64 * 1024, ExtVariant::Ext4))]);

        let summary = h.orchestrator.run_image(&mut image, &CandidateSet::new()).unwrap();
        assert!(summary.volumes.is_empty());
        assert_eq!(summary.excluded, vec![0]);
        assert!(h.mapper.events().is_empty());
    }

    #[test]
    fn test_efi_image_handed_off() {
        let root = TempDir::new().unwrap();
        linux_root(root.path(), "PRETTY_NAME=\"Test\"\n", SHADOW);
        let mut disk = gpt_disk(
            512,
            &[
                GptPartitionSpec::new(PartitionTypeGuid::EFI_SYSTEM, 64, 191, "EFI"),
                GptPartitionSpec::new(PartitionTypeGuid::LINUX_FILESYSTEM, 192, 319, "root"),
            ],
        );
        place(&mut disk, 192 * 512, &ext_volume(64 * 1024, ExtVariant::Ext4));
        let mut image = DiskImage::from_bytes("gpt.img", disk);

        let provisioner = Arc::new(FakeProvisioner::default());
        let mapper = Arc::new(FakeMapper::default());
        let orchestrator = Orchestrator::new(
            RunConfig::default(),
            Box::new(Shared(mapper.clone())),
            Box::new(Shared(Arc::new(FakeMounter::new(root.path().to_path_buf())))),
        )
        .with_provisioner(Box::new(Shared(provisioner.clone())));

        let summary = orchestrator.run_image(&mut image, &CandidateSet::new()).unwrap();
        assert_eq!(summary.firmware, Firmware::Efi);
        assert!(summary.provisioned);
        let esp = &summary.volumes[0];
        assert_eq!(esp.error.as_ref().unwrap().kind, ErrorKind::UnsupportedScheme);
        assert!(esp.detail.as_deref().unwrap().starts_with("EFI system partition"));

        let requests = provisioner.requests.lock().unwrap();
        assert_eq!(requests[0].firmware, Firmware::Efi);
        assert_eq!(requests[0].guest_os.as_deref(), Some("otherlinux"));
        assert_eq!(requests[0].image, Path::new("gpt.img"));
    }

    #[test]
    fn test_unreadable_table_is_fatal() {
        let h = harness(FakeMounter::new(std::env::temp_dir()), RunConfig::default());
        let mut image = DiskImage::from_bytes("blank.img", vec![0u8; 64 * 1024]);
        let err = h.orchestrator.run_image(&mut image, &CandidateSet::new()).unwrap_err();
        assert!(err.is_fatal());
    }

    fn lvm_harness(mounter: FakeMounter, groups: FakeVolumeGroups) -> (Harness, Arc<FakeVolumeGroups>) {
        let groups = Arc::new(groups);
        let mut h = harness(mounter, RunConfig::default());
        h.orchestrator = h.orchestrator.with_volume_groups(Box::new(Shared(groups.clone())));
        (h, groups)
    }

    #[test]
    fn test_luks_over_lvm_end_to_end() {
        let root = TempDir::new().unwrap();
        linux_root(root.path(), "PRETTY_NAME=\"Fedora Linux 40\"\n", SHADOW);
        let fixture = LuksFixture::new("unused passphrase");
        let mut candidates = CandidateSet::new();
        candidates.add_hex(&hex::encode(&fixture.master_key), 1).unwrap();

        let groups =
            FakeVolumeGroups::default().with_group("/dev/fake0", &["/dev/fedora/swap", "/dev/fedora/root"]);
        let mounter = FakeMounter::failing().with_device("/dev/fedora/root", root.path().to_path_buf());
        let (h, groups) = lvm_harness(mounter, groups);
        let mut image = mbr_image(&[(0x83, luks1_volume(&fixture))]);

        let summary = h.orchestrator.run_image(&mut image, &candidates).unwrap();
        let volume = &summary.volumes[0];
        assert!(volume.error.is_none(), "{:?}", volume.error);
        assert_eq!(volume.kind, VolumeKind::Luks);
        assert!(volume.bypassed);
        assert_eq!(volume.os.as_ref().unwrap().family, OsFamily::Linux);
        assert_eq!(volume.patched_accounts, vec!["root", "alice"]);

        assert_eq!(h.mapper.events(), vec!["map 0 Luks", "unmap /dev/fake0"]);
        assert_eq!(groups.events(), vec!["activate /dev/fake0", "deactivate /dev/fake0"]);
        assert_eq!(
            h.mounter.events(),
            vec!["mount /dev/fedora/swap", "mount /dev/fedora/root", "unmount"]
        );
    }

    #[test]
    fn test_plain_lvm_picks_volume_with_os() {
        let data = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        linux_root(root.path(), "PRETTY_NAME=\"Test\"\n", SHADOW);
        let groups =
            FakeVolumeGroups::default().with_group("/dev/fake0", &["/dev/vg0/data", "/dev/vg0/root"]);
        let mounter = FakeMounter::failing()
            .with_device("/dev/vg0/data", data.path().to_path_buf())
            .with_device("/dev/vg0/root", root.path().to_path_buf());
        let (h, groups) = lvm_harness(mounter, groups);
        let mut image = mbr_image(&[(0x8E, lvm_volume(64 * 1024, 1))]);

        let summary = h.orchestrator.run_image(&mut image, &CandidateSet::new()).unwrap();
        let volume = &summary.volumes[0];
        assert!(volume.error.is_none(), "{:?}", volume.error);
        assert_eq!(volume.kind, VolumeKind::Lvm);
        assert_eq!(volume.patched_accounts, vec!["root", "alice"]);
        assert!(fs::read_to_string(root.path().join("etc/shadow")).unwrap() != SHADOW);
        assert_eq!(groups.events().len(), 2);
        assert_eq!(h.mounter.events().iter().filter(|e| *e == "unmount").count(), 2);
    }

    #[test]
    fn test_lvm_without_activator_is_unsupported() {
        let h = harness(FakeMounter::new(std::env::temp_dir()), RunConfig::default());
        let mut image = mbr_image(&[(0x8E, lvm_volume(64 * 1024, 1))]);
        let summary = h.orchestrator.run_image(&mut image, &CandidateSet::new()).unwrap();
        let volume = &summary.volumes[0];
        assert_eq!(volume.kind, VolumeKind::Lvm);
        assert_eq!(volume.error.as_ref().unwrap().kind, ErrorKind::UnsupportedScheme);
        assert!(h.mapper.events().is_empty());
    }
}
