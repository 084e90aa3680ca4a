//! MBR partition types and table entries

use std::fmt;
use unseal_core::{ByteView, Result};

/// MBR partition type codes
///
/// The system indicator byte of an MBR partition entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MbrPartitionType {
    /// Empty/unused partition entry
    Empty,
    /// FAT12, CHS
    Fat12,
    /// FAT16 < 32MB, CHS
    Fat16Small,
    /// Extended partition, CHS
    Extended,
    /// FAT16 >= 32MB, CHS
    Fat16,
    /// NTFS/exFAT/HPFS (also used by BitLocker and VeraCrypt system volumes)
    Ntfs,
    /// FAT32, CHS
    Fat32Chs,
    /// FAT32, LBA
    Fat32Lba,
    /// FAT16, LBA
    Fat16Lba,
    /// Extended partition, LBA
    ExtendedLba,
    /// Hidden NTFS (OEM recovery)
    HiddenNtfs,
    /// Windows recovery environment
    WindowsRecovery,
    /// Linux swap
    LinuxSwap,
    /// Linux native (ext2/ext3/ext4, LUKS)
    LinuxNative,
    /// Linux extended
    LinuxExtended,
    /// Linux LVM
    LinuxLvm,
    /// Linux RAID autodetect
    LinuxRaid,
    /// GPT protective MBR
    GptProtective,
    /// EFI system partition
    EfiSystem,
    /// Unknown partition type
    Unknown(u8),
}

impl MbrPartitionType {
    /// Create a partition type from a byte value
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x00 => Self::Empty,
            0x01 => Self::Fat12,
            0x04 => Self::Fat16Small,
            0x05 => Self::Extended,
            0x06 => Self::Fat16,
            0x07 => Self::Ntfs,
            0x0B => Self::Fat32Chs,
            0x0C => Self::Fat32Lba,
            0x0E => Self::Fat16Lba,
            0x0F => Self::ExtendedLba,
            0x17 => Self::HiddenNtfs,
            0x27 => Self::WindowsRecovery,
            0x82 => Self::LinuxSwap,
            0x83 => Self::LinuxNative,
            0x85 => Self::LinuxExtended,
            0x8E => Self::LinuxLvm,
            0xFD => Self::LinuxRaid,
            0xEE => Self::GptProtective,
            0xEF => Self::EfiSystem,
            _ => Self::Unknown(b),
        }
    }

    /// Get the byte value of this partition type
    pub fn to_byte(self) -> u8 {
        match self {
            Self::Empty => 0x00,
            Self::Fat12 => 0x01,
            Self::Fat16Small => 0x04,
            Self::Extended => 0x05,
            Self::Fat16 => 0x06,
            Self::Ntfs => 0x07,
            Self::Fat32Chs => 0x0B,
            Self::Fat32Lba => 0x0C,
            Self::Fat16Lba => 0x0E,
            Self::ExtendedLba => 0x0F,
            Self::HiddenNtfs => 0x17,
            Self::WindowsRecovery => 0x27,
            Self::LinuxSwap => 0x82,
            Self::LinuxNative => 0x83,
            Self::LinuxExtended => 0x85,
            Self::LinuxLvm => 0x8E,
            Self::LinuxRaid => 0xFD,
            Self::GptProtective => 0xEE,
            Self::EfiSystem => 0xEF,
            Self::Unknown(b) => b,
        }
    }

    /// True for container entries whose space is described by an EBR chain
    pub fn is_extended(&self) -> bool {
        matches!(self, Self::Extended | Self::ExtendedLba | Self::LinuxExtended)
    }

    /// Get a human-readable name for this partition type
    pub fn name(&self) -> &'static str {
        match self {
            Self::Empty => "Empty",
            Self::Fat12 => "FAT12",
            Self::Fat16Small => "FAT16 (<32MB)",
            Self::Extended => "Extended",
            Self::Fat16 => "FAT16",
            Self::Ntfs => "NTFS/exFAT",
            Self::Fat32Chs => "FAT32 (CHS)",
            Self::Fat32Lba => "FAT32 (LBA)",
            Self::Fat16Lba => "FAT16 (LBA)",
            Self::ExtendedLba => "Extended (LBA)",
            Self::HiddenNtfs => "Hidden NTFS",
            Self::WindowsRecovery => "Windows RE",
            Self::LinuxSwap => "Linux swap",
            Self::LinuxNative => "Linux",
            Self::LinuxExtended => "Linux extended",
            Self::LinuxLvm => "Linux LVM",
            Self::LinuxRaid => "Linux RAID",
            Self::GptProtective => "GPT Protective",
            Self::EfiSystem => "EFI System",
            Self::Unknown(_) => "Unknown",
        }
    }
}

impl fmt::Display for MbrPartitionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One 16-byte partition entry of an MBR or EBR
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbrEntry {
    /// Boot indicator (0x80 = active)
    pub status: u8,
    /// System indicator
    pub partition_type: MbrPartitionType,
    /// First sector, relative to the table's base
    pub lba_start: u32,
    /// Sector count
    pub lba_length: u32,
}

impl MbrEntry {
    /// Size of a partition entry in bytes
    pub const ENTRY_SIZE: usize = 16;

    /// Parse the entry at `offset` of a table sector
    pub fn parse(sector: &ByteView<'_>, offset: usize) -> Result<Self> {
        Ok(Self {
            status: sector.u8(offset)?,
            partition_type: MbrPartitionType::from_byte(sector.u8(offset + 4)?),
            lba_start: sector.u32_le(offset + 8)?,
            lba_length: sector.u32_le(offset + 12)?,
        })
    }

    /// True when the slot describes no space
    pub fn is_empty(&self) -> bool {
        self.partition_type == MbrPartitionType::Empty || self.lba_length == 0
    }

    /// True when the active flag is set
    pub fn is_bootable(&self) -> bool {
        self.status & 0x80 != 0
    }
}
