//! GPT partition types and structures

use std::fmt;
use unseal_core::{ByteView, Realm, Result};
use uuid::Uuid;

/// GPT partition type GUID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PartitionTypeGuid(pub Uuid);

impl PartitionTypeGuid {
    /// Unused entry
    pub const UNUSED: Self = Self(Uuid::nil());

    /// EFI System Partition
    pub const EFI_SYSTEM: Self = Self(Uuid::from_u128(0xC12A7328_F81F_11D2_BA4B_00A0C93EC93B));

    /// Microsoft Basic Data (NTFS, FAT, exFAT, BitLocker)
    pub const MICROSOFT_BASIC_DATA: Self = Self(Uuid::from_u128(0xEBD0A0A2_B9E5_4433_87C0_68B6B72699C7));

    /// Microsoft Reserved
    pub const MICROSOFT_RESERVED: Self = Self(Uuid::from_u128(0xE3C9E316_0B5C_4DB8_817D_F92DF00215AE));

    /// Windows Recovery Environment
    pub const WINDOWS_RECOVERY: Self = Self(Uuid::from_u128(0xDE94BBA4_06D1_4D40_A16A_BFD50179D6AC));

    /// Linux filesystem
    pub const LINUX_FILESYSTEM: Self = Self(Uuid::from_u128(0x0FC63DAF_8483_4772_8E79_3D69D8477DE4));

    /// Linux root (x86-64)
    pub const LINUX_ROOT_X86_64: Self = Self(Uuid::from_u128(0x4F68BCE3_E8CD_4DB1_96E7_FBCAF984B709));

    /// Linux swap
    pub const LINUX_SWAP: Self = Self(Uuid::from_u128(0x0657FD6D_A4AB_43C4_84E5_0933C84B4F4F));

    /// Linux LUKS
    pub const LINUX_LUKS: Self = Self(Uuid::from_u128(0xCA7D7CCB_63ED_4C53_861C_1742536059CC));

    /// Linux LVM
    pub const LINUX_LVM: Self = Self(Uuid::from_u128(0xE6D6D379_F507_44C2_A23C_238F2A3DF928));

    /// Parse the mixed-endian on-disk form
    pub fn from_disk_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes_le(bytes))
    }

    /// Get a human-readable name for this partition type
    pub fn name(&self) -> &'static str {
        match *self {
            Self::UNUSED => "Unused",
            Self::EFI_SYSTEM => "EFI System",
            Self::MICROSOFT_BASIC_DATA => "Microsoft Basic Data",
            Self::MICROSOFT_RESERVED => "Microsoft Reserved",
            Self::WINDOWS_RECOVERY => "Windows Recovery",
            Self::LINUX_FILESYSTEM => "Linux filesystem",
            Self::LINUX_ROOT_X86_64 => "Linux root (x86-64)",
            Self::LINUX_SWAP => "Linux swap",
            Self::LINUX_LUKS => "Linux LUKS",
            Self::LINUX_LVM => "Linux LVM",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for PartitionTypeGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// GPT partition entry
///
/// Each partition entry is at least 128 bytes and describes one partition on the disk.
#[derive(Debug, Clone)]
pub struct GptPartitionEntry {
    /// Partition type GUID
    pub partition_type_guid: PartitionTypeGuid,
    /// Unique partition GUID
    pub unique_partition_guid: Uuid,
    /// First LBA (inclusive)
    pub first_lba: u64,
    /// Last LBA (inclusive)
    pub last_lba: u64,
    /// Attribute flags
    pub attributes: u64,
    /// Partition name (UTF-16LE, 36 code units)
    pub name: String,
}

impl GptPartitionEntry {
    /// Minimum size of a partition entry in bytes
    pub const ENTRY_SIZE: usize = 128;

    /// Parse a partition entry
    pub fn parse(entry: &ByteView<'_>) -> Result<Self> {
        let name_units: Vec<u16> = entry
            .bytes(56, 72)?
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .take_while(|&unit| unit != 0)
            .collect();

        Ok(Self {
            partition_type_guid: PartitionTypeGuid::from_disk_bytes(entry.array(0)?),
            unique_partition_guid: Uuid::from_bytes_le(entry.array(16)?),
            first_lba: entry.u64_le(32)?,
            last_lba: entry.u64_le(40)?,
            attributes: entry.u64_le(48)?,
            name: String::from_utf16_lossy(&name_units),
        })
    }

    /// Check if this entry is unused
    pub fn is_unused(&self) -> bool {
        self.partition_type_guid == PartitionTypeGuid::UNUSED
    }

    /// Get the size of this partition in LBA sectors
    pub fn size_lba(&self) -> u64 {
        if self.last_lba >= self.first_lba {
            self.last_lba - self.first_lba + 1
        } else {
            0
        }
    }
}

/// GPT header
#[derive(Debug, Clone)]
pub struct GptHeader {
    /// GPT revision (usually 0x00010000)
    pub revision: u32,
    /// Header size in bytes (usually 92)
    pub header_size: u32,
    /// CRC32 checksum of header
    pub header_crc32: u32,
    /// Location of this header
    pub current_lba: u64,
    /// Location of the other header copy
    pub backup_lba: u64,
    /// First usable LBA for partitions
    pub first_usable_lba: u64,
    /// Last usable LBA for partitions
    pub last_usable_lba: u64,
    /// Disk GUID
    pub disk_guid: Uuid,
    /// Starting LBA of partition entries
    pub partition_entries_lba: u64,
    /// Number of partition entries
    pub num_partition_entries: u32,
    /// Size of each partition entry
    pub partition_entry_size: u32,
    /// CRC32 of partition entries array
    pub partition_entries_crc32: u32,
}

impl GptHeader {
    /// GPT header signature
    pub const SIGNATURE: &'static [u8; 8] = b"EFI PART";

    /// Minimum GPT header size
    pub const HEADER_SIZE: usize = 92;

    /// Parse a GPT header sector
    ///
    /// # Errors
    ///
    /// [`unseal_core::Error::ImageFormat`] for a missing signature or an
    /// implausible header size.
    pub fn parse(sector: &[u8]) -> Result<Self> {
        let view = ByteView::new(sector, Realm::Image, "GPT header");

        if !view.matches(0, Self::SIGNATURE) {
            return Err(view.error("Invalid GPT header signature"));
        }

        let header_size = view.u32_le(12)?;
        if (header_size as usize) < Self::HEADER_SIZE || header_size as usize > sector.len() {
            return Err(view.error(format!("implausible header size {}", header_size)));
        }

        Ok(Self {
            revision: view.u32_le(8)?,
            header_size,
            header_crc32: view.u32_le(16)?,
            current_lba: view.u64_le(24)?,
            backup_lba: view.u64_le(32)?,
            first_usable_lba: view.u64_le(40)?,
            last_usable_lba: view.u64_le(48)?,
            disk_guid: Uuid::from_bytes_le(view.array(56)?),
            partition_entries_lba: view.u64_le(72)?,
            num_partition_entries: view.u32_le(80)?,
            partition_entry_size: view.u32_le(84)?,
            partition_entries_crc32: view.u32_le(88)?,
        })
    }

    /// Verify the header CRC32 checksum (computed with the CRC field zeroed)
    pub fn verify_header_crc32(&self, header_bytes: &[u8]) -> bool {
        let Some(raw) = header_bytes.get(..self.header_size as usize) else {
            return false;
        };

        let mut header_for_crc = raw.to_vec();
        header_for_crc[16..20].fill(0);

        crc32fast::hash(&header_for_crc) == self.header_crc32
    }

    /// Verify the partition entries array CRC32 checksum
    pub fn verify_partition_entries_crc32(&self, partition_entries_bytes: &[u8]) -> bool {
        let expected_size = self.entries_len();

        match partition_entries_bytes.get(..expected_size) {
            Some(entries) => crc32fast::hash(entries) == self.partition_entries_crc32,
            None => false,
        }
    }

    /// Total byte size of the partition entry array
    pub fn entries_len(&self) -> usize {
        self.num_partition_entries as usize * self.partition_entry_size as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_type_guid_names() {
        assert_eq!(PartitionTypeGuid::UNUSED.name(), "Unused");
        assert_eq!(PartitionTypeGuid::EFI_SYSTEM.name(), "EFI System");
        assert_eq!(PartitionTypeGuid::LINUX_LUKS.name(), "Linux LUKS");
    }

    #[test]
    fn test_mixed_endian_guid() {
        // EFI system partition as stored on disk
        let raw = [
            0x28, 0x73, 0x2a, 0xc1, 0x1f, 0xf8, 0xd2, 0x11,
            0xba, 0x4b, 0x00, 0xa0, 0xc9, 0x3e, 0xc9, 0x3b,
        ];
        assert_eq!(PartitionTypeGuid::from_disk_bytes(raw), PartitionTypeGuid::EFI_SYSTEM);
    }

    #[test]
    fn test_partition_entry_parse() {
        let mut raw = vec![0u8; GptPartitionEntry::ENTRY_SIZE];
        raw[0..16].copy_from_slice(&PartitionTypeGuid::LINUX_FILESYSTEM.0.to_bytes_le());
        raw[32..40].copy_from_slice(&100u64.to_le_bytes());
        raw[40..48].copy_from_slice(&199u64.to_le_bytes());
        for (i, unit) in "root".encode_utf16().enumerate() {
            raw[56 + i * 2..58 + i * 2].copy_from_slice(&unit.to_le_bytes());
        }

        let entry = GptPartitionEntry::parse(&ByteView::new(&raw, Realm::Image, "entry")).unwrap();
        assert!(!entry.is_unused());
        assert_eq!(entry.size_lba(), 100);
        assert_eq!(entry.name, "root");
        assert_eq!(entry.partition_type_guid, PartitionTypeGuid::LINUX_FILESYSTEM);
    }

    #[test]
    fn test_gpt_header_signature_validation() {
        let mut header_bytes = vec![0u8; 512];
        assert!(GptHeader::parse(&header_bytes).is_err());

        header_bytes[0..8].copy_from_slice(b"EFI PART");
        header_bytes[12..16].copy_from_slice(&92u32.to_le_bytes());
        assert!(GptHeader::parse(&header_bytes).is_ok());

        header_bytes[12..16].copy_from_slice(&12u32.to_le_bytes());
        assert!(GptHeader::parse(&header_bytes).is_err());
    }
}
