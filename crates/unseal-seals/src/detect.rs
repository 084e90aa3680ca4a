//! Volume classification
//!
//! Signatures are checked in a fixed order: BitLocker, LUKS, NTFS, ext,
//! LVM2 labels, other known filesystems, and finally the VeraCrypt entropy
//! heuristic.
//! A recognised signature whose metadata is unreadable yields `Unknown`
//! with the reason as hint.

use crate::bitlocker::{is_boot_sector, BitLockerHeader};
use crate::luks::types::LUKS_MAGIC;
use crate::luks::LuksHeader;
use crate::veracrypt::VeraCryptHeader;
use crate::volume::{ExtVariant, Seal, Volume};
use tracing::{debug, info, warn};
use unseal_core::{ByteView, Error, ReadSeek, Realm, Result, Zone};
use unseal_pipeline::read_region;

/// Bytes read from the start of every zone
pub const HEADER_PROBE_SIZE: usize = 4096;

const EXT_SUPERBLOCK: usize = 1024;

/// LVM2 writes its label into one of the first four sectors
const LVM_LABEL_SECTORS: usize = 4;
const LVM_LABEL_ID: &[u8] = b"LABELONE";
const LVM_LABEL_TYPE: &[u8] = b"LVM2 001";
const EXT_MAGIC: u16 = 0xEF53;

const EXT_COMPAT_HAS_JOURNAL: u32 = 0x0004;
const EXT_INCOMPAT_EXT4: u32 = 0x0040 | 0x0080 | 0x0200;
const EXT_RO_COMPAT_EXT4: u32 = 0x0008 | 0x0010 | 0x0020 | 0x0040 | 0x0400;

/// Classify the volume in `zone`
///
/// Only I/O failures are returned as errors; malformed metadata becomes
/// [`Seal::Unknown`].
pub fn detect(source: &mut dyn ReadSeek, zone: &Zone) -> Result<Volume> {
    let probe_len = (zone.length as usize).min(HEADER_PROBE_SIZE);
    let probe = read_region(source, zone.offset, probe_len)?;
    let seal = classify(source, zone, &probe)?;
    let volume = Volume::new(zone.clone(), seal);
    info!("Volume {}: {}", zone.index, volume.describe());
    Ok(volume)
}

fn classify(source: &mut dyn ReadSeek, zone: &Zone, probe: &[u8]) -> Result<Seal> {
    if probe.len() < 512 {
        return Ok(unknown(zone, format!("zone holds only {} readable bytes", probe.len())));
    }
    let view = ByteView::new(probe, Realm::Header, "volume probe");

    if view.matches(3, b"-FVE-FS-") || view.matches(3, b"MSWIN4.1") {
        match BitLockerHeader::read(source, zone, probe) {
            Ok(Some(header)) => return Ok(Seal::BitLocker(Box::new(header))),
            Ok(None) => {}
            Err(e) => return downgrade(zone, "BitLocker", e),
        }
    }

    if view.matches(0, LUKS_MAGIC) {
        return match LuksHeader::read(source, zone) {
            Ok(header) => Ok(Seal::Luks(Box::new(header))),
            Err(e) => downgrade(zone, "LUKS", e),
        };
    }

    if view.matches(3, b"NTFS    ") {
        return Ok(Seal::PlaintextNtfs);
    }

    if let Some(variant) = ext_variant(&view) {
        return Ok(Seal::PlaintextExt(variant));
    }

    if let Some(uuid) = lvm_pv_uuid(&view) {
        return Ok(Seal::Lvm { uuid });
    }

    if let Some(name) = other_filesystem(&view) {
        return Ok(unknown(zone, format!("{} filesystem", name)));
    }

    match VeraCryptHeader::read(source, zone, probe) {
        Ok(Some(header)) => return Ok(Seal::VeraCrypt(Box::new(header))),
        Ok(None) => {}
        Err(e) => return downgrade(zone, "VeraCrypt", e),
    }

    Ok(unknown(zone, "no recognised signature".to_string()))
}

fn unknown(zone: &Zone, hint: String) -> Seal {
    let hint = if zone.declared.is_efi_system() {
        format!("EFI system partition, {}", hint)
    } else {
        hint
    };
    debug!("Zone {} left unclassified: {}", zone.index, hint);
    Seal::Unknown { hint }
}

fn downgrade(zone: &Zone, scheme: &str, err: Error) -> Result<Seal> {
    if let Error::Io(_) = err {
        return Err(err);
    }
    warn!("Zone {} has a {} signature but unusable metadata: {}", zone.index, scheme, err);
    Ok(Seal::Unknown {
        hint: format!("{} signature present but metadata unreadable: {}", scheme, err),
    })
}

fn ext_variant(view: &ByteView) -> Option<ExtVariant> {
    if view.u16_le(EXT_SUPERBLOCK + 0x38).ok()? != EXT_MAGIC {
        return None;
    }
    let compat = view.u32_le(EXT_SUPERBLOCK + 0x5C).ok()?;
    let incompat = view.u32_le(EXT_SUPERBLOCK + 0x60).ok()?;
    let ro_compat = view.u32_le(EXT_SUPERBLOCK + 0x64).ok()?;

    Some(if incompat & EXT_INCOMPAT_EXT4 != 0 || ro_compat & EXT_RO_COMPAT_EXT4 != 0 {
        ExtVariant::Ext4
    } else if compat & EXT_COMPAT_HAS_JOURNAL != 0 {
        ExtVariant::Ext3
    } else {
        ExtVariant::Ext2
    })
}

/// PV UUID of an LVM2 label, in `pvs` notation
fn lvm_pv_uuid(view: &ByteView) -> Option<String> {
    let label = (0..LVM_LABEL_SECTORS)
        .map(|sector| sector * 512)
        .find(|&at| view.matches(at, LVM_LABEL_ID) && view.matches(at + 24, LVM_LABEL_TYPE))?;
    let content = view.u32_le(label + 20).ok()? as usize;
    let raw = view.bytes(label + content, 32).ok()?;
    if !raw.iter().all(u8::is_ascii_alphanumeric) {
        return Some(hex::encode(raw));
    }
    let raw = std::str::from_utf8(raw).ok()?;
    let mut uuid = String::with_capacity(38);
    let mut at = 0;
    for (i, group) in [6, 4, 4, 4, 4, 4, 6].into_iter().enumerate() {
        if i > 0 {
            uuid.push('-');
        }
        uuid.push_str(&raw[at..at + group]);
        at += group;
    }
    Some(uuid)
}

fn other_filesystem(view: &ByteView) -> Option<&'static str> {
    if view.matches(3, b"EXFAT   ") {
        Some("exFAT")
    } else if view.matches(82, b"FAT32   ") {
        Some("FAT32")
    } else if view.matches(54, b"FAT12   ") || view.matches(54, b"FAT16   ") {
        Some("FAT")
    } else if view.matches(4086, b"SWAPSPACE2") || view.matches(4086, b"SWAP-SPACE") {
        Some("Linux swap")
    } else if view.matches(0, b"XFSB") {
        Some("XFS")
    } else {
        None
    }
}

/// True when decrypted data starts like an NTFS/FAT boot sector or ext volume
pub fn has_filesystem_signature(data: &[u8]) -> bool {
    let view = ByteView::new(data, Realm::Header, "decrypted sample");
    is_boot_sector(data) || view.u16_le(EXT_SUPERBLOCK + 0x38).ok() == Some(EXT_MAGIC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{
        ext_volume, luks1_volume, lvm_volume, ntfs_volume, BitLockerFixture, LuksFixture, VeraCryptFixture,
    };
    use crate::bitlocker::EncryptionMethod;
    use std::io::Cursor;
    use unseal_core::{DeclaredType, VolumeKind};

    fn detect_bytes(volume: Vec<u8>, declared: DeclaredType) -> Volume {
        let zone = Zone::new(0, 0, volume.len() as u64, declared, "test");
        detect(&mut Cursor::new(volume), &zone).unwrap()
    }

    #[test]
    fn test_detects_each_kind() {
        let cases = [
            (ntfs_volume(64 * 1024), VolumeKind::PlaintextNtfs),
            (ext_volume(64 * 1024, ExtVariant::Ext4), VolumeKind::PlaintextExt),
            (BitLockerFixture::new(EncryptionMethod::Aes128Xts).build(), VolumeKind::BitLocker),
            (luks1_volume(&LuksFixture::new("pw")), VolumeKind::Luks),
            (VeraCryptFixture::new("pw").volume(), VolumeKind::VeraCrypt),
            (lvm_volume(64 * 1024, 1), VolumeKind::Lvm),
            (vec![0u8; 64 * 1024], VolumeKind::Unknown),
        ];
        for (bytes, expected) in cases {
            assert_eq!(detect_bytes(bytes, DeclaredType::Mbr(0x07)).kind(), expected);
        }
    }

    #[test]
    fn test_ext_variants() {
        for variant in [ExtVariant::Ext2, ExtVariant::Ext3, ExtVariant::Ext4] {
            let volume = detect_bytes(ext_volume(8192, variant), DeclaredType::Mbr(0x83));
            assert!(matches!(volume.seal(), Seal::PlaintextExt(v) if *v == variant));
        }
    }

    #[test]
    fn test_esp_is_unknown_with_hint() {
        let mut fat = vec![0u8; 64 * 1024];
        fat[3..11].copy_from_slice(b"MSDOS5.0");
        fat[82..90].copy_from_slice(b"FAT32   ");
        fat[510] = 0x55;
        fat[511] = 0xAA;
        let volume = detect_bytes(fat, DeclaredType::Gpt(DeclaredType::EFI_SYSTEM_GUID));
        match volume.seal() {
            Seal::Unknown { hint } => assert_eq!(hint, "EFI system partition, FAT32 filesystem"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_broken_luks_header_downgrades() {
        let mut bytes = vec![0u8; 64 * 1024];
        bytes[..6].copy_from_slice(LUKS_MAGIC);
        bytes[7] = 1;
        bytes[108..112].copy_from_slice(&0u32.to_be_bytes());
        let volume = detect_bytes(bytes, DeclaredType::Mbr(0x83));
        match volume.seal() {
            Seal::Unknown { hint } => assert!(hint.starts_with("LUKS signature present")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_truncated_bitlocker_metadata_downgrades() {
        let mut bytes = BitLockerFixture::new(EncryptionMethod::Aes128Xts).build();
        // Wipe every FVE information block copy
        for offset in BitLockerFixture::METADATA_OFFSETS {
            bytes[offset as usize..offset as usize + 8].fill(0);
        }
        let volume = detect_bytes(bytes, DeclaredType::Mbr(0x07));
        assert_eq!(volume.kind(), VolumeKind::Unknown);
    }

    #[test]
    fn test_lvm_label_in_any_of_first_sectors() {
        for sector in 0..4 {
            let volume = detect_bytes(lvm_volume(64 * 1024, sector), DeclaredType::Mbr(0x8E));
            match volume.seal() {
                Seal::Lvm { uuid } => assert_eq!(uuid, "Xq3bWc-9aLm-Tz0P-kR7v-Ne2S-u8Gh-Yd4FjK"),
                other => panic!("unexpected {:?}", other),
            }
        }
        let mut late = vec![0u8; 64 * 1024];
        late[2048..].copy_from_slice(&lvm_volume(62 * 1024, 0));
        assert_eq!(detect_bytes(late, DeclaredType::Mbr(0x8E)).kind(), VolumeKind::Unknown);
    }

    #[test]
    fn test_filesystem_signature() {
        assert!(has_filesystem_signature(&ntfs_volume(4096)));
        assert!(has_filesystem_signature(&ext_volume(4096, ExtVariant::Ext2)));
        assert!(!has_filesystem_signature(&[0u8; 4096]));
    }
}
