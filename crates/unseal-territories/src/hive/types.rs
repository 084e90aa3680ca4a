//! Registry hive record layouts

use encoding_rs::WINDOWS_1252;
use unseal_core::{ByteView, Result};

/// Size of the regf base block; hive bins start right after it
pub const BASE_BLOCK_LEN: usize = 4096;

/// Size of an hbin header
pub const HBIN_HEADER_LEN: usize = 32;

/// Key name stored as Latin-1 instead of UTF-16
pub const KEY_COMP_NAME: u16 = 0x0020;

/// Value name stored as Latin-1 instead of UTF-16
pub const VALUE_COMP_NAME: u16 = 0x0001;

/// Data length flag marking data held inside the vk record
pub const DATA_INLINE: u32 = 0x8000_0000;

/// Registry value types used by the readers
pub const REG_SZ: u32 = 1;
pub const REG_BINARY: u32 = 3;
pub const REG_DWORD: u32 = 4;

/// regf base block
///
/// Only the fields needed to find the root key and judge consistency are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseBlock {
    /// Incremented before a write starts
    pub primary_sequence: u32,
    /// Incremented after a write completes
    pub secondary_sequence: u32,
    /// Major format version (1)
    pub major_version: u32,
    /// Minor format version (3 to 6)
    pub minor_version: u32,
    /// Root key cell, relative to the first hive bin
    pub root_cell: u32,
    /// Total size of the hive bins
    pub hive_bins_size: u32,
    /// XOR-32 checksum stored at 0x1FC
    pub checksum: u32,
}

impl BaseBlock {
    pub fn parse(view: &ByteView) -> Result<Self> {
        if !view.matches(0, b"regf") {
            return Err(view.error("regf signature missing"));
        }
        Ok(Self {
            primary_sequence: view.u32_le(4)?,
            secondary_sequence: view.u32_le(8)?,
            major_version: view.u32_le(20)?,
            minor_version: view.u32_le(24)?,
            root_cell: view.u32_le(36)?,
            hive_bins_size: view.u32_le(40)?,
            checksum: view.u32_le(508)?,
        })
    }

    /// Sequence numbers differ when the last write did not finish
    pub fn is_dirty(&self) -> bool {
        self.primary_sequence != self.secondary_sequence
    }
}

/// XOR of the first 127 dwords of the base block
pub fn base_block_checksum(view: &ByteView) -> Result<u32> {
    let mut sum = 0u32;
    for i in 0..127 {
        sum ^= view.u32_le(i * 4)?;
    }
    Ok(match sum {
        0 => 1,
        0xFFFF_FFFF => 0xFFFF_FFFE,
        other => other,
    })
}

/// A key (`nk`) record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyNode {
    /// Cell offset of the record
    pub cell: u32,
    /// Key name
    pub name: String,
    /// Number of stable subkeys
    pub subkey_count: u32,
    /// Cell of the subkey index (`lf`, `lh`, `li` or `ri`)
    pub subkeys_cell: u32,
    /// Number of values
    pub value_count: u32,
    /// Cell of the value offset list
    pub values_cell: u32,
    /// Cell of the class name, `u32::MAX` when absent
    pub class_cell: u32,
    /// Class name length in bytes
    pub class_len: u16,
}

impl KeyNode {
    /// Parse the record in `cell_data` (cell size already stripped)
    pub fn parse(cell: u32, data: &ByteView) -> Result<Self> {
        if !data.matches(0, b"nk") {
            return Err(data.error(format!("cell 0x{:X} is not a key node", cell)));
        }
        let flags = data.u16_le(2)?;
        let name_len = data.u16_le(72)? as usize;
        let raw_name = data.bytes(76, name_len)?;
        Ok(Self {
            cell,
            name: decode_name(raw_name, flags & KEY_COMP_NAME != 0),
            subkey_count: data.u32_le(20)?,
            subkeys_cell: data.u32_le(28)?,
            value_count: data.u32_le(36)?,
            values_cell: data.u32_le(40)?,
            class_cell: data.u32_le(48)?,
            class_len: data.u16_le(74)?,
        })
    }
}

/// A value (`vk`) record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueNode {
    /// Cell offset of the record
    pub cell: u32,
    /// Value name; empty for the default value
    pub name: String,
    /// Registry data type
    pub data_type: u32,
    /// Data length with the inline flag removed
    pub data_len: u32,
    /// Data lives in the offset field of the record itself
    pub inline: bool,
    /// Cell holding the data when not inline
    pub data_cell: u32,
}

impl ValueNode {
    pub fn parse(cell: u32, data: &ByteView) -> Result<Self> {
        if !data.matches(0, b"vk") {
            return Err(data.error(format!("cell 0x{:X} is not a value node", cell)));
        }
        let name_len = data.u16_le(2)? as usize;
        let raw_len = data.u32_le(4)?;
        let flags = data.u16_le(16)?;
        let raw_name = data.bytes(20, name_len)?;
        Ok(Self {
            cell,
            name: decode_name(raw_name, flags & VALUE_COMP_NAME != 0),
            data_type: data.u32_le(12)?,
            data_len: raw_len & !DATA_INLINE,
            inline: raw_len & DATA_INLINE != 0,
            data_cell: data.u32_le(8)?,
        })
    }
}

/// Decode a key or value name
pub fn decode_name(raw: &[u8], compressed: bool) -> String {
    if compressed {
        let (text, _, _) = WINDOWS_1252.decode(raw);
        text.into_owned()
    } else {
        decode_utf16(raw)
    }
}

/// Decode UTF-16LE, stopping at the first NUL
pub fn decode_utf16(raw: &[u8]) -> String {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

#[cfg(test)]
mod tests {
    use super::*;
    use unseal_core::Realm;

    #[test]
    fn test_decode_names() {
        assert_eq!(decode_name(b"Caf\xe9", true), "Café");
        assert_eq!(decode_name(&[0x4A, 0, 0x44, 0, 0, 0], false), "JD");
    }

    #[test]
    fn test_checksum_of_zero_block() {
        let block = [0u8; 512];
        let view = ByteView::new(&block, Realm::Store, "base block");
        assert_eq!(base_block_checksum(&view).unwrap(), 1);
    }
}
