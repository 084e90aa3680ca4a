//! GPT (GUID Partition Table) partition table implementation

pub mod types;

use tracing::{debug, warn};
use unseal_core::{
    validate_allocation_size, ByteView, DeclaredType, Error, ReadSeek, Realm, Result, Zone, ZoneTable,
    MAX_PARTITION_COUNT,
};
use unseal_pipeline::read_region;
use uuid::Uuid;

pub use types::{GptHeader, GptPartitionEntry, PartitionTypeGuid};

/// GPT partition table
///
/// # Structure
///
/// ```text
/// LBA 0:    Protective MBR (for backward compatibility)
/// LBA 1:    Primary GPT header
/// LBA 2-33: Partition entries array (typically 128 entries)
/// LBA 34+:  Usable disk space
/// ...
/// Last 33:  Backup partition entries array
/// Last 1:   Backup GPT header
/// ```
///
/// Both header and entry-array CRC32s are enforced. When the primary copy is
/// damaged the backup header at the last LBA is used instead.
#[derive(Debug, Clone)]
pub struct GptZoneTable {
    zones: Vec<Zone>,
    header: GptHeader,
    from_backup: bool,
}

impl GptZoneTable {
    /// Parse a GPT, falling back to the backup header
    ///
    /// # Arguments
    ///
    /// * `stream` - The whole disk image
    /// * `sector_size` - Logical sector size in bytes (512 or 4096)
    /// * `image_len` - Image length, used to locate the backup header
    ///
    /// # Errors
    ///
    /// Returns the primary header's error when neither copy is usable.
    pub fn parse(stream: &mut dyn ReadSeek, sector_size: u32, image_len: u64) -> Result<Self> {
        let primary = Self::parse_at(stream, 1, sector_size);
        let primary_err = match primary {
            Ok(table) => return Ok(table),
            Err(e) => e,
        };

        let last_lba = (image_len / sector_size as u64).saturating_sub(1);
        if last_lba <= 1 {
            return Err(primary_err);
        }

        warn!("Primary GPT header unusable ({}), trying backup at LBA {}", primary_err, last_lba);
        match Self::parse_at(stream, last_lba, sector_size) {
            Ok(mut table) => {
                table.from_backup = true;
                Ok(table)
            }
            Err(backup_err) => {
                debug!("Backup GPT header unusable: {}", backup_err);
                Err(primary_err)
            }
        }
    }

    fn parse_at(stream: &mut dyn ReadSeek, header_lba: u64, sector_size: u32) -> Result<Self> {
        let ss = sector_size as u64;
        let header_offset = header_lba
            .checked_mul(ss)
            .ok_or_else(|| Realm::Image.error("GPT header offset overflow"))?;

        let header_bytes = read_region(stream, header_offset, sector_size as usize)?;
        let header = GptHeader::parse(&header_bytes)?;

        if !header.verify_header_crc32(&header_bytes) {
            return Err(Error::ChecksumVerification(format!(
                "GPT header CRC32 verification failed at LBA {}",
                header_lba
            )));
        }

        let entry_size = header.partition_entry_size as usize;
        if entry_size < GptPartitionEntry::ENTRY_SIZE || entry_size % 8 != 0 {
            return Err(Realm::Image.error(format!("GPT entry size {} not supported", entry_size)));
        }
        if header.num_partition_entries as usize > MAX_PARTITION_COUNT {
            return Err(Realm::Image.error(format!(
                "GPT declares {} entries, limit is {}",
                header.num_partition_entries, MAX_PARTITION_COUNT
            )));
        }

        let entries_len = validate_allocation_size(
            header.entries_len() as u64,
            MAX_PARTITION_COUNT * 4096,
            Realm::Image,
            "GPT entry array",
        )?;
        let entries_offset = header
            .partition_entries_lba
            .checked_mul(ss)
            .ok_or_else(|| Realm::Image.error("GPT entry array offset overflow"))?;
        let all_entries_bytes = read_region(stream, entries_offset, entries_len)?;

        if !header.verify_partition_entries_crc32(&all_entries_bytes) {
            return Err(Error::ChecksumVerification(
                "GPT partition entries CRC32 verification failed".to_string(),
            ));
        }

        let entries = ByteView::new(&all_entries_bytes, Realm::Image, "GPT entries");
        let mut zones = Vec::new();

        for i in 0..header.num_partition_entries as usize {
            let entry = GptPartitionEntry::parse(&entries.sub(i * entry_size, entry_size)?)?;

            if entry.is_unused() {
                continue;
            }

            let zone_type = if !entry.name.is_empty() {
                format!("{} ({})", entry.partition_type_guid.name(), entry.name)
            } else {
                entry.partition_type_guid.name().to_string()
            };

            zones.push(Zone::new(
                i,
                entry.first_lba.saturating_mul(ss),
                entry.size_lba().saturating_mul(ss),
                DeclaredType::Gpt(entry.partition_type_guid.0),
                zone_type,
            ));
        }

        Ok(Self {
            zones,
            header,
            from_backup: false,
        })
    }

    /// Get the disk GUID
    pub fn disk_guid(&self) -> Uuid {
        self.header.disk_guid
    }

    /// Get the GPT header that was used
    pub fn header(&self) -> &GptHeader {
        &self.header
    }

    /// True when the primary header was damaged and the backup was used
    pub fn from_backup(&self) -> bool {
        self.from_backup
    }
}

impl ZoneTable for GptZoneTable {
    fn identify(&self) -> &str {
        "GUID Partition Table"
    }

    fn enumerate_zones(&self) -> &[Zone] {
        &self.zones
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{gpt_disk, GptPartitionSpec};
    use std::io::Cursor;

    const TOTAL_SECTORS: u64 = 1000;

    fn sample_disk() -> Vec<u8> {
        gpt_disk(
            TOTAL_SECTORS,
            &[
                GptPartitionSpec::new(PartitionTypeGuid::EFI_SYSTEM, 40, 99, "EFI"),
                GptPartitionSpec::new(PartitionTypeGuid::LINUX_FILESYSTEM, 100, 199, "Test"),
            ],
        )
    }

    #[test]
    fn test_parse_valid_gpt() {
        let disk = sample_disk();
        let len = disk.len() as u64;
        let table = GptZoneTable::parse(&mut Cursor::new(disk), 512, len).unwrap();

        assert_eq!(table.identify(), "GUID Partition Table");
        assert!(!table.from_backup());
        let zones = table.enumerate_zones();
        assert_eq!(zones.len(), 2);
        assert!(zones[0].declared.is_efi_system());
        assert_eq!(zones[1].index, 1);
        assert_eq!(zones[1].offset, 100 * 512);
        assert_eq!(zones[1].length, 100 * 512);
        assert!(zones[1].zone_type.contains("Linux filesystem"));
        assert!(zones[1].zone_type.contains("Test"));
    }

    #[test]
    fn test_gpt_header_crc32_validation() {
        let mut disk = sample_disk();
        // Corrupt first_usable_lba of the primary header and the backup signature
        disk[512 + 40] ^= 0xFF;
        let backup = (TOTAL_SECTORS as usize - 1) * 512;
        disk[backup] = 0;

        let len = disk.len() as u64;
        let result = GptZoneTable::parse(&mut Cursor::new(disk), 512, len);
        assert!(matches!(result, Err(Error::ChecksumVerification(_))));
    }

    #[test]
    fn test_gpt_partition_entries_crc32_validation() {
        let mut disk = sample_disk();
        disk[2 * 512 + 100] ^= 0xFF;
        let backup = (TOTAL_SECTORS as usize - 1) * 512;
        disk[backup] = 0;

        let len = disk.len() as u64;
        let result = GptZoneTable::parse(&mut Cursor::new(disk), 512, len);
        assert!(matches!(result, Err(Error::ChecksumVerification(_))));
    }

    #[test]
    fn test_backup_header_fallback() {
        let mut disk = sample_disk();
        disk[512..520].copy_from_slice(b"GARBAGE!");

        let len = disk.len() as u64;
        let table = GptZoneTable::parse(&mut Cursor::new(disk), 512, len).unwrap();
        assert!(table.from_backup());
        assert_eq!(table.header().current_lba, TOTAL_SECTORS - 1);
        assert_eq!(table.enumerate_zones().len(), 2);
    }

    #[test]
    fn test_parse_invalid_gpt_signature() {
        let disk = vec![0u8; 4096];
        let result = GptZoneTable::parse(&mut Cursor::new(disk), 512, 4096);
        assert!(matches!(result, Err(Error::ImageFormat(_))));
    }
}
