//! Core types shared across the unseal crates

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Partition type as declared by the partition table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeclaredType {
    /// MBR system indicator byte
    Mbr(u8),
    /// GPT partition type GUID
    Gpt(Uuid),
}

impl DeclaredType {
    /// EFI system partition GUID (C12A7328-F81F-11D2-BA4B-00A0C93EC93B)
    pub const EFI_SYSTEM_GUID: Uuid = Uuid::from_u128(0xC12A7328_F81F_11D2_BA4B_00A0C93EC93B);

    /// MBR system indicator of an EFI system partition
    pub const EFI_SYSTEM_MBR: u8 = 0xEF;

    /// True when this type marks an EFI system partition
    pub fn is_efi_system(&self) -> bool {
        match self {
            DeclaredType::Mbr(code) => *code == Self::EFI_SYSTEM_MBR,
            DeclaredType::Gpt(guid) => *guid == Self::EFI_SYSTEM_GUID,
        }
    }
}

impl fmt::Display for DeclaredType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeclaredType::Mbr(code) => write!(f, "0x{:02X}", code),
            DeclaredType::Gpt(guid) => write!(f, "{}", guid.hyphenated()),
        }
    }
}

/// A zone (partition) within a disk image
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Zone {
    /// Slot index in the partition table; logical MBR partitions start at 4
    pub index: usize,

    /// Offset from start of image in bytes
    pub offset: u64,

    /// Length of zone in bytes
    pub length: u64,

    /// Human-readable type name (e.g., "NTFS/exFAT", "Linux filesystem")
    pub zone_type: String,

    /// Raw type identifier from the table
    pub declared: DeclaredType,
}

impl Zone {
    /// Create a new zone
    pub fn new(index: usize, offset: u64, length: u64, declared: DeclaredType, zone_type: impl Into<String>) -> Self {
        Self {
            index,
            offset,
            length,
            zone_type: zone_type.into(),
            declared,
        }
    }

    /// Exclusive end offset in bytes
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Zone {} [{} ({}) @ 0x{:08X}, {} bytes]",
            self.index, self.zone_type, self.declared, self.offset, self.length
        )
    }
}

/// Classification of a volume's content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum VolumeKind {
    PlaintextNtfs,
    PlaintextExt,
    BitLocker,
    VeraCrypt,
    Luks,
    /// LVM2 physical volume; its logical volumes hold the filesystems
    Lvm,
    Unknown,
}

impl VolumeKind {
    /// True for schemes that need a master key before mounting
    pub fn is_encrypted(&self) -> bool {
        matches!(self, VolumeKind::BitLocker | VolumeKind::VeraCrypt | VolumeKind::Luks)
    }

    /// Short display name
    pub fn name(&self) -> &'static str {
        match self {
            VolumeKind::PlaintextNtfs => "NTFS",
            VolumeKind::PlaintextExt => "ext",
            VolumeKind::BitLocker => "BitLocker",
            VolumeKind::VeraCrypt => "VeraCrypt",
            VolumeKind::Luks => "LUKS",
            VolumeKind::Lvm => "LVM",
            VolumeKind::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for VolumeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Key material handed to the crypt mapper
#[derive(Clone, PartialEq, Eq)]
pub enum KeyMaterial {
    /// Plaintext volume, map as-is
    Plain,
    /// BitLocker full volume encryption key and its encryption method code
    BitLocker { method: u16, fvek: Vec<u8> },
    /// LUKS volume master key
    Luks { master_key: Vec<u8> },
    /// VeraCrypt data area key in dm-crypt plain terms
    VeraCrypt {
        cipher: String,
        key: Vec<u8>,
        data_offset_sectors: u64,
        iv_offset_sectors: u64,
    },
}

impl KeyMaterial {
    /// The raw key bytes, if any
    pub fn key_bytes(&self) -> Option<&[u8]> {
        match self {
            KeyMaterial::Plain => None,
            KeyMaterial::BitLocker { fvek, .. } => Some(fvek),
            KeyMaterial::Luks { master_key } => Some(master_key),
            KeyMaterial::VeraCrypt { key, .. } => Some(key),
        }
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyMaterial::Plain => f.write_str("Plain"),
            KeyMaterial::BitLocker { method, fvek } => f
                .debug_struct("BitLocker")
                .field("method", &format_args!("0x{:04X}", method))
                .field("fvek", &fingerprint(fvek))
                .finish(),
            KeyMaterial::Luks { master_key } => f
                .debug_struct("Luks")
                .field("master_key", &fingerprint(master_key))
                .finish(),
            KeyMaterial::VeraCrypt {
                cipher,
                key,
                data_offset_sectors,
                iv_offset_sectors,
            } => f
                .debug_struct("VeraCrypt")
                .field("cipher", cipher)
                .field("key", &fingerprint(key))
                .field("data_offset_sectors", data_offset_sectors)
                .field("iv_offset_sectors", iv_offset_sectors)
                .finish(),
        }
    }
}

/// A request to expose one volume as a block device
#[derive(Debug, Clone)]
pub struct MapRequest {
    /// Index of the zone being mapped
    pub volume_index: usize,
    /// Scheme of the volume
    pub kind: VolumeKind,
    /// Byte offset of the volume within the image
    pub offset: u64,
    /// Byte length of the volume
    pub length: u64,
    /// Key needed to decrypt on the fly
    pub key: KeyMaterial,
}

/// Boot firmware the prepared image expects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Firmware {
    Bios,
    Efi,
}

/// Final hand-off to the VM provisioning collaborator
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionRequest {
    /// Path of the prepared disk image
    pub image: PathBuf,
    /// Guest OS identifier hint (e.g. "windows9-64")
    pub guest_os: Option<String>,
    /// Firmware the guest boots with
    pub firmware: Firmware,
}

/// Short non-reversible identifier for key material in logs and reports
pub fn fingerprint(key: &[u8]) -> String {
    let digest = Sha256::digest(key);
    format!("sha256:{}", hex::encode(&digest[..4]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zone_creation() {
        let zone = Zone::new(4, 0x1000, 0x10000, DeclaredType::Mbr(0x83), "Linux");
        assert_eq!(zone.index, 4);
        assert_eq!(zone.end(), 0x11000);
        assert_eq!(zone.to_string(), "Zone 4 [Linux (0x83) @ 0x00001000, 65536 bytes]");
    }

    #[test]
    fn test_efi_system_detection() {
        assert!(DeclaredType::Mbr(0xEF).is_efi_system());
        assert!(!DeclaredType::Mbr(0x07).is_efi_system());
        let esp = Uuid::parse_str("c12a7328-f81f-11d2-ba4b-00a0c93ec93b").unwrap();
        assert!(DeclaredType::Gpt(esp).is_efi_system());
    }

    #[test]
    fn test_key_material_debug_redacts() {
        let material = KeyMaterial::Luks {
            master_key: vec![0xAB; 32],
        };
        let rendered = format!("{:?}", material);
        assert!(rendered.starts_with("Luks"));
        assert!(!rendered.contains(&"ab".repeat(8)));
        assert!(rendered.contains("sha256:"));
    }

    #[test]
    fn test_volume_kind_is_encrypted() {
        assert!(VolumeKind::BitLocker.is_encrypted());
        assert!(VolumeKind::Luks.is_encrypted());
        assert!(!VolumeKind::PlaintextExt.is_encrypted());
        assert!(!VolumeKind::Unknown.is_encrypted());
        assert!(!VolumeKind::Lvm.is_encrypted());
    }
}
