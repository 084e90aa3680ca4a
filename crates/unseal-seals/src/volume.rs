//! Detected volumes

use crate::bitlocker::BitLockerHeader;
use crate::luks::LuksHeader;
use crate::veracrypt::VeraCryptHeader;
use serde::Serialize;
use std::fmt;
use unseal_core::{VolumeKind, Zone};

/// ext filesystem generation, from the superblock feature flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExtVariant {
    Ext2,
    Ext3,
    Ext4,
}

impl fmt::Display for ExtVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtVariant::Ext2 => f.write_str("ext2"),
            ExtVariant::Ext3 => f.write_str("ext3"),
            ExtVariant::Ext4 => f.write_str("ext4"),
        }
    }
}

/// What protects (or does not protect) a volume, with the scheme's metadata
#[derive(Debug, Clone)]
pub enum Seal {
    PlaintextNtfs,
    PlaintextExt(ExtVariant),
    BitLocker(Box<BitLockerHeader>),
    VeraCrypt(Box<VeraCryptHeader>),
    Luks(Box<LuksHeader>),
    /// LVM2 physical volume, identified by its PV UUID
    Lvm { uuid: String },
    Unknown { hint: String },
}

/// A partition together with its classification
///
/// The seal is decided once by the detector and never changes.
#[derive(Debug, Clone)]
pub struct Volume {
    zone: Zone,
    seal: Seal,
}

impl Volume {
    pub fn new(zone: Zone, seal: Seal) -> Self {
        Self { zone, seal }
    }

    pub fn zone(&self) -> &Zone {
        &self.zone
    }

    pub fn seal(&self) -> &Seal {
        &self.seal
    }

    pub fn index(&self) -> usize {
        self.zone.index
    }

    pub fn kind(&self) -> VolumeKind {
        match &self.seal {
            Seal::PlaintextNtfs => VolumeKind::PlaintextNtfs,
            Seal::PlaintextExt(_) => VolumeKind::PlaintextExt,
            Seal::BitLocker(_) => VolumeKind::BitLocker,
            Seal::VeraCrypt(_) => VolumeKind::VeraCrypt,
            Seal::Luks(_) => VolumeKind::Luks,
            Seal::Lvm { .. } => VolumeKind::Lvm,
            Seal::Unknown { .. } => VolumeKind::Unknown,
        }
    }

    /// Short human description such as `LUKS2` or `ext4`
    pub fn describe(&self) -> String {
        match &self.seal {
            Seal::PlaintextNtfs => "NTFS".to_string(),
            Seal::PlaintextExt(variant) => variant.to_string(),
            Seal::BitLocker(h) => match h.method() {
                Some(method) => format!("BitLocker ({})", method),
                None => format!("BitLocker (method 0x{:04X})", h.method_code),
            },
            Seal::VeraCrypt(_) => "VeraCrypt (entropy heuristic)".to_string(),
            Seal::Luks(h) => format!("LUKS{} ({})", h.version(), h.cipher_spec()),
            Seal::Lvm { uuid } => format!("LVM2 physical volume {}", uuid),
            Seal::Unknown { hint } => format!("Unknown: {}", hint),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unseal_core::DeclaredType;

    #[test]
    fn test_kind_follows_seal() {
        let zone = Zone::new(1, 1 << 20, 1 << 20, DeclaredType::Mbr(0x83), "Linux");
        let volume = Volume::new(zone, Seal::PlaintextExt(ExtVariant::Ext4));
        assert_eq!(volume.kind(), VolumeKind::PlaintextExt);
        assert_eq!(volume.index(), 1);
        assert_eq!(volume.describe(), "ext4");

        let unknown = Volume::new(volume.zone().clone(), Seal::Unknown { hint: "swap".into() });
        assert_eq!(unknown.kind(), VolumeKind::Unknown);
        assert!(!unknown.kind().is_encrypted());
    }
}
