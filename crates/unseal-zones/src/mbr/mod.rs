//! MBR (Master Boot Record) partition table implementation

pub mod types;

use std::collections::HashSet;
use tracing::{debug, warn};
use unseal_core::{
    ByteView, DeclaredType, ReadSeek, Realm, Result, Zone, ZoneTable, MAX_PARTITION_COUNT,
};
use unseal_pipeline::read_region;

pub use types::{MbrEntry, MbrPartitionType};

/// MBR partition table
///
/// Up to four primary slots; an extended slot points at a chain of EBRs, each
/// holding one logical partition and a link to the next EBR.
///
/// # Structure
///
/// ```text
/// Offset  Size  Field
/// ------  ----  -----
/// 0x000   440   Bootstrap code
/// 0x1B8   4     Disk signature
/// 0x1BE   16    Partition entry 1
/// 0x1CE   16    Partition entry 2
/// 0x1DE   16    Partition entry 3
/// 0x1EE   16    Partition entry 4
/// 0x1FE   2     Boot signature (0xAA55)
/// ```
///
/// Primary slots keep their slot index (0-3) even when earlier slots are
/// empty or extended; logical partitions are numbered from 4 in chain order.
#[derive(Debug, Clone)]
pub struct MbrZoneTable {
    zones: Vec<Zone>,
    disk_signature: u32,
    protective: bool,
}

impl MbrZoneTable {
    /// The boot signature that must be present at offset 0x1FE
    pub const BOOT_SIGNATURE: u16 = 0xAA55;

    /// Size of the MBR in bytes (always 512)
    pub const MBR_SIZE: usize = 512;

    /// Offset of the first partition entry
    pub const PARTITION_TABLE_OFFSET: usize = 0x1BE;

    /// Offset of the disk signature
    pub const DISK_SIGNATURE_OFFSET: usize = 0x1B8;

    /// Offset of the boot signature
    pub const BOOT_SIGNATURE_OFFSET: usize = 0x1FE;

    /// Number of partition entries in MBR
    pub const NUM_PARTITIONS: usize = 4;

    /// Index given to the first logical partition
    pub const FIRST_LOGICAL_INDEX: usize = 4;

    /// Parse an MBR and its extended chain
    ///
    /// # Errors
    ///
    /// Returns [`unseal_core::Error::ImageFormat`] if the boot signature is
    /// missing or the sector cannot be read.
    pub fn parse(stream: &mut dyn ReadSeek, sector_size: u32) -> Result<Self> {
        let mbr = read_region(stream, 0, Self::MBR_SIZE)?;
        let view = ByteView::new(&mbr, Realm::Image, "MBR");

        if mbr.len() < Self::MBR_SIZE {
            return Err(view.error(format!("image too small ({} bytes)", mbr.len())));
        }

        let boot_signature = view.u16_le(Self::BOOT_SIGNATURE_OFFSET)?;
        if boot_signature != Self::BOOT_SIGNATURE {
            return Err(view.error(format!(
                "Invalid MBR boot signature: expected 0x{:04X}, got 0x{:04X}",
                Self::BOOT_SIGNATURE,
                boot_signature
            )));
        }

        let disk_signature = view.u32_le(Self::DISK_SIGNATURE_OFFSET)?;
        let ss = sector_size as u64;

        let mut zones = Vec::new();
        let mut protective = false;
        let mut next_logical = Self::FIRST_LOGICAL_INDEX;

        for i in 0..Self::NUM_PARTITIONS {
            let entry = MbrEntry::parse(&view, Self::PARTITION_TABLE_OFFSET + i * MbrEntry::ENTRY_SIZE)?;

            if entry.is_empty() {
                continue;
            }

            if entry.partition_type == MbrPartitionType::GptProtective {
                protective = true;
                continue;
            }

            if entry.partition_type.is_extended() {
                debug!("Slot {} is extended, walking EBR chain at LBA {}", i, entry.lba_start);
                Self::walk_extended(stream, entry.lba_start as u64, ss, &mut zones, &mut next_logical)?;
                continue;
            }

            zones.push(Self::zone_for(i, 0, &entry, ss));
        }

        Ok(Self {
            zones,
            disk_signature,
            protective,
        })
    }

    /// Follow the EBR chain of one extended partition
    ///
    /// Logical entries are relative to their own EBR; link entries are
    /// relative to the start of the extended partition.
    fn walk_extended(
        stream: &mut dyn ReadSeek,
        extended_start: u64,
        sector_size: u64,
        zones: &mut Vec<Zone>,
        next_logical: &mut usize,
    ) -> Result<()> {
        let mut ebr_lba = extended_start;
        let mut visited = HashSet::new();

        for _ in 0..MAX_PARTITION_COUNT {
            if !visited.insert(ebr_lba) {
                warn!("EBR chain loops back to LBA {}, stopping", ebr_lba);
                break;
            }

            let offset = ebr_lba
                .checked_mul(sector_size)
                .ok_or_else(|| Realm::Image.error("EBR offset overflow"))?;
            let sector = read_region(stream, offset, Self::MBR_SIZE)?;
            let view = ByteView::new(&sector, Realm::Image, "EBR");

            if sector.len() < Self::MBR_SIZE
                || view.u16_le(Self::BOOT_SIGNATURE_OFFSET)? != Self::BOOT_SIGNATURE
            {
                warn!("EBR at LBA {} has no boot signature, stopping chain", ebr_lba);
                break;
            }

            let logical = MbrEntry::parse(&view, Self::PARTITION_TABLE_OFFSET)?;
            let link = MbrEntry::parse(&view, Self::PARTITION_TABLE_OFFSET + MbrEntry::ENTRY_SIZE)?;

            if !logical.is_empty() {
                zones.push(Self::zone_for(*next_logical, ebr_lba, &logical, sector_size));
                *next_logical += 1;
            }

            if link.is_empty() || !link.partition_type.is_extended() {
                break;
            }
            ebr_lba = extended_start + link.lba_start as u64;
        }

        Ok(())
    }

    fn zone_for(index: usize, base_lba: u64, entry: &MbrEntry, sector_size: u64) -> Zone {
        let code = entry.partition_type.to_byte();
        Zone::new(
            index,
            (base_lba + entry.lba_start as u64) * sector_size,
            entry.lba_length as u64 * sector_size,
            DeclaredType::Mbr(code),
            entry.partition_type.name(),
        )
    }

    /// Get the disk signature
    pub fn disk_signature(&self) -> u32 {
        self.disk_signature
    }

    /// Check if this MBR contains a GPT protective partition
    pub fn is_gpt_protective(&self) -> bool {
        self.protective
    }
}

impl ZoneTable for MbrZoneTable {
    fn identify(&self) -> &str {
        "Master Boot Record"
    }

    fn enumerate_zones(&self) -> &[Zone] {
        &self.zones
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{ebr_sector, mbr_disk, place};
    use std::io::Cursor;
    use unseal_core::Error;

    #[test]
    fn test_parse_primary_partitions() {
        let disk = mbr_disk(8192, &[(0x07, 2048, 2048), (0x83, 4096, 2048)]);
        let table = MbrZoneTable::parse(&mut Cursor::new(disk), 512).unwrap();

        assert_eq!(table.identify(), "Master Boot Record");
        assert_eq!(table.disk_signature(), 0x78563412);
        let zones = table.enumerate_zones();
        assert_eq!(zones.len(), 2);
        assert_eq!(zones[0].index, 0);
        assert_eq!(zones[0].offset, 2048 * 512);
        assert_eq!(zones[0].declared, DeclaredType::Mbr(0x07));
        assert_eq!(zones[1].zone_type, "Linux");
    }

    #[test]
    fn test_empty_slot_keeps_indices() {
        let mut disk = mbr_disk(8192, &[(0x07, 2048, 1024), (0x00, 0, 0), (0x83, 4096, 1024)]);
        // Slot 1 left empty; slot 2 must stay index 2
        disk[0x1BE + 16..0x1BE + 32].fill(0);
        let table = MbrZoneTable::parse(&mut Cursor::new(disk), 512).unwrap();
        let indices: Vec<usize> = table.enumerate_zones().iter().map(|z| z.index).collect();
        assert_eq!(indices, vec![0, 2]);
    }

    #[test]
    fn test_extended_chain_numbering() {
        // Primary NTFS in slot 0, extended container in slot 1 at LBA 4096
        let mut disk = mbr_disk(16384, &[(0x07, 2048, 2048), (0x0F, 4096, 8192)]);
        // First EBR: logical at +64 for 1024 sectors, next EBR at +2048
        place(&mut disk, 4096 * 512, &ebr_sector((0x83, 64, 1024), Some((2048, 2048))));
        // Second EBR: logical at +64 for 512 sectors, end of chain
        place(&mut disk, (4096 + 2048) * 512, &ebr_sector((0x82, 64, 512), None));

        let table = MbrZoneTable::parse(&mut Cursor::new(disk), 512).unwrap();
        let zones = table.enumerate_zones();

        assert_eq!(zones.len(), 3);
        assert_eq!(zones[0].index, 0);
        assert_eq!(zones[1].index, 4);
        assert_eq!(zones[1].offset, (4096 + 64) * 512);
        assert_eq!(zones[1].length, 1024 * 512);
        assert_eq!(zones[2].index, 5);
        assert_eq!(zones[2].offset, (4096 + 2048 + 64) * 512);
        assert_eq!(zones[2].zone_type, "Linux swap");
    }

    #[test]
    fn test_looping_chain_terminates() {
        let mut disk = mbr_disk(16384, &[(0x05, 4096, 8192)]);
        // Link points back at the first EBR
        place(&mut disk, 4096 * 512, &ebr_sector((0x83, 64, 128), Some((0, 2048))));
        let table = MbrZoneTable::parse(&mut Cursor::new(disk), 512).unwrap();
        assert_eq!(table.enumerate_zones().len(), 1);
    }

    #[test]
    fn test_parse_invalid_boot_signature() {
        let mut disk = mbr_disk(4096, &[(0x07, 2048, 1024)]);
        disk[0x1FE] = 0x00;

        let result = MbrZoneTable::parse(&mut Cursor::new(disk), 512);
        assert!(matches!(result, Err(Error::ImageFormat(ref msg)) if msg.contains("Invalid MBR boot signature")));
    }

    #[test]
    fn test_truncated_image() {
        let result = MbrZoneTable::parse(&mut Cursor::new(vec![0u8; 100]), 512);
        assert!(matches!(result, Err(Error::ImageFormat(_))));
    }

    #[test]
    fn test_gpt_protective_detection() {
        let disk = mbr_disk(4096, &[(0xEE, 1, 4095)]);
        let table = MbrZoneTable::parse(&mut Cursor::new(disk), 512).unwrap();

        assert!(table.is_gpt_protective());
        assert!(table.enumerate_zones().is_empty());
    }
}
