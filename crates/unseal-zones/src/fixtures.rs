//! Disk image builders for tests

use crate::gpt::PartitionTypeGuid;

const SECTOR: usize = 512;

/// Copy `bytes` into `disk` at `offset`, growing the disk if needed
pub fn place(disk: &mut Vec<u8>, offset: u64, bytes: &[u8]) {
    let start = offset as usize;
    if disk.len() < start + bytes.len() {
        disk.resize(start + bytes.len(), 0);
    }
    disk[start..start + bytes.len()].copy_from_slice(bytes);
}

fn write_entry(sector: &mut [u8], slot_offset: usize, type_code: u8, lba_start: u32, sectors: u32) {
    sector[slot_offset + 4] = type_code;
    sector[slot_offset + 8..slot_offset + 12].copy_from_slice(&lba_start.to_le_bytes());
    sector[slot_offset + 12..slot_offset + 16].copy_from_slice(&sectors.to_le_bytes());
}

/// MBR sector with up to four `(type, lba_start, sectors)` entries
pub fn mbr_sector(entries: &[(u8, u32, u32)]) -> [u8; SECTOR] {
    let mut mbr = [0u8; SECTOR];
    mbr[0x1B8..0x1BC].copy_from_slice(&0x78563412u32.to_le_bytes());
    for (i, &(type_code, lba_start, sectors)) in entries.iter().take(4).enumerate() {
        write_entry(&mut mbr, 0x1BE + i * 16, type_code, lba_start, sectors);
    }
    mbr[0x1FE] = 0x55;
    mbr[0x1FF] = 0xAA;
    mbr
}

/// Zero-filled disk of `total_sectors` with an MBR
pub fn mbr_disk(total_sectors: u64, entries: &[(u8, u32, u32)]) -> Vec<u8> {
    let mut disk = vec![0u8; total_sectors as usize * SECTOR];
    place(&mut disk, 0, &mbr_sector(entries));
    disk
}

/// EBR with a logical entry (relative to the EBR) and an optional link
/// `(start, sectors)` relative to the extended partition start
pub fn ebr_sector(logical: (u8, u32, u32), next: Option<(u32, u32)>) -> [u8; SECTOR] {
    let mut ebr = [0u8; SECTOR];
    write_entry(&mut ebr, 0x1BE, logical.0, logical.1, logical.2);
    if let Some((start, sectors)) = next {
        write_entry(&mut ebr, 0x1CE, 0x05, start, sectors);
    }
    ebr[0x1FE] = 0x55;
    ebr[0x1FF] = 0xAA;
    ebr
}

/// One partition of a GPT fixture
#[derive(Debug, Clone)]
pub struct GptPartitionSpec {
    pub type_guid: PartitionTypeGuid,
    pub first_lba: u64,
    pub last_lba: u64,
    pub name: String,
}

impl GptPartitionSpec {
    pub fn new(type_guid: PartitionTypeGuid, first_lba: u64, last_lba: u64, name: &str) -> Self {
        Self {
            type_guid,
            first_lba,
            last_lba,
            name: name.to_string(),
        }
    }
}

const GPT_ENTRIES: usize = 128;
const GPT_ENTRY_SIZE: usize = 128;
const GPT_ENTRY_SECTORS: u64 = (GPT_ENTRIES * GPT_ENTRY_SIZE / SECTOR) as u64;

fn gpt_entries(partitions: &[GptPartitionSpec]) -> Vec<u8> {
    let mut entries = vec![0u8; GPT_ENTRIES * GPT_ENTRY_SIZE];
    for (i, spec) in partitions.iter().enumerate() {
        let e = &mut entries[i * GPT_ENTRY_SIZE..(i + 1) * GPT_ENTRY_SIZE];
        e[0..16].copy_from_slice(&spec.type_guid.0.to_bytes_le());
        e[16] = i as u8 + 1;
        e[32..40].copy_from_slice(&spec.first_lba.to_le_bytes());
        e[40..48].copy_from_slice(&spec.last_lba.to_le_bytes());
        for (j, unit) in spec.name.encode_utf16().take(36).enumerate() {
            e[56 + j * 2..58 + j * 2].copy_from_slice(&unit.to_le_bytes());
        }
    }
    entries
}

fn gpt_header(current: u64, backup: u64, entries_lba: u64, last_usable: u64, entries_crc: u32) -> [u8; SECTOR] {
    let mut h = [0u8; SECTOR];
    h[0..8].copy_from_slice(b"EFI PART");
    h[8..12].copy_from_slice(&0x00010000u32.to_le_bytes());
    h[12..16].copy_from_slice(&92u32.to_le_bytes());
    h[24..32].copy_from_slice(&current.to_le_bytes());
    h[32..40].copy_from_slice(&backup.to_le_bytes());
    h[40..48].copy_from_slice(&(2 + GPT_ENTRY_SECTORS).to_le_bytes());
    h[48..56].copy_from_slice(&last_usable.to_le_bytes());
    h[56..72].copy_from_slice(&[0x5A; 16]);
    h[72..80].copy_from_slice(&entries_lba.to_le_bytes());
    h[80..84].copy_from_slice(&(GPT_ENTRIES as u32).to_le_bytes());
    h[84..88].copy_from_slice(&(GPT_ENTRY_SIZE as u32).to_le_bytes());
    h[88..92].copy_from_slice(&entries_crc.to_le_bytes());
    let crc = crc32fast::hash(&h[..92]);
    h[16..20].copy_from_slice(&crc.to_le_bytes());
    h
}

/// Zero-filled 512-byte-sector disk with protective MBR, primary and backup GPT
pub fn gpt_disk(total_sectors: u64, partitions: &[GptPartitionSpec]) -> Vec<u8> {
    let last = total_sectors - 1;
    let backup_entries_lba = last - GPT_ENTRY_SECTORS;
    let last_usable = backup_entries_lba - 1;

    let mut disk = mbr_disk(total_sectors, &[(0xEE, 1, (total_sectors - 1) as u32)]);
    let entries = gpt_entries(partitions);
    let entries_crc = crc32fast::hash(&entries);

    place(&mut disk, SECTOR as u64, &gpt_header(1, last, 2, last_usable, entries_crc));
    place(&mut disk, 2 * SECTOR as u64, &entries);
    place(&mut disk, backup_entries_lba * SECTOR as u64, &entries);
    place(&mut disk, last * SECTOR as u64, &gpt_header(last, 1, backup_entries_lba, last_usable, entries_crc));
    disk
}
