//! Windows registry hive (regf) reader with in-place value rewriting
//!
//! The hive is held in memory as one buffer. Keys and values are looked up
//! through bounds-checked views; values can be overwritten only with data of
//! the same length, so the cell layout never moves.
//!
//! # Security
//!
//! - Every cell offset is checked against the buffer before use
//! - Subkey index recursion (`ri` lists) is depth-limited
//! - Subkey and value counts are checked against the cells that hold them
//! - Hive files above `MAX_HIVE_SIZE` are rejected before reading

pub mod types;

pub use types::{BaseBlock, KeyNode, ValueNode, REG_BINARY, REG_DWORD, REG_SZ};

use std::fs;
use std::ops::Range;
use std::path::Path;
use tracing::{debug, warn};
use types::{base_block_checksum, decode_utf16, BASE_BLOCK_LEN, DATA_INLINE};
use unseal_core::{validate_allocation_size, ByteView, Error, Realm, Result, MAX_HIVE_SIZE};

/// Largest value stored in a single data cell; bigger values use `db` records
const MAX_SINGLE_CELL_DATA: u32 = 16344;

/// Nesting limit for `ri` index lists
const MAX_INDEX_DEPTH: usize = 8;

/// A loaded registry hive
#[derive(Clone)]
pub struct Hive {
    data: Vec<u8>,
    base: BaseBlock,
    checksum_ok: bool,
}

impl std::fmt::Debug for Hive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hive")
            .field("len", &self.data.len())
            .field("base", &self.base)
            .field("checksum_ok", &self.checksum_ok)
            .finish()
    }
}

impl Hive {
    /// Read a hive file from disk
    pub fn load(path: &Path) -> Result<Self> {
        let len = fs::metadata(path)?.len();
        validate_allocation_size(len, MAX_HIVE_SIZE as usize, Realm::Store, "registry hive")?;
        let data = fs::read(path)?;
        Self::parse(data).map_err(|e| match e {
            Error::CorruptStore(msg) => Error::corrupt_store(format!("{}: {}", path.display(), msg)),
            other => other,
        })
    }

    /// Parse a hive held in memory
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        if data.len() < BASE_BLOCK_LEN {
            return Err(Error::corrupt_store(format!(
                "registry hive is {} bytes, shorter than its base block",
                data.len()
            )));
        }
        let view = ByteView::new(&data, Realm::Store, "regf base block");
        let base = BaseBlock::parse(&view)?;
        let checksum_ok = base_block_checksum(&view)? == base.checksum;

        if base.is_dirty() || !checksum_ok {
            warn!(
                "Registry hive is dirty (sequence {}/{}, checksum {})",
                base.primary_sequence,
                base.secondary_sequence,
                if checksum_ok { "ok" } else { "mismatch" }
            );
        }

        let hive = Self { data, base, checksum_ok };
        // Resolve the root now so a broken hive fails before anything is patched
        let root = hive.root()?;
        debug!("Hive root key '{}' with {} subkeys", root.name, root.subkey_count);
        Ok(hive)
    }

    /// Base block header
    pub fn base_block(&self) -> &BaseBlock {
        &self.base
    }

    /// True when the last write to this hive did not complete cleanly
    pub fn is_dirty(&self) -> bool {
        self.base.is_dirty() || !self.checksum_ok
    }

    /// Raw hive bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// The root key
    pub fn root(&self) -> Result<KeyNode> {
        self.key_at(self.base.root_cell)
    }

    /// Walk a backslash-separated path from the root, ignoring ASCII case
    pub fn open_key(&self, path: &str) -> Result<Option<KeyNode>> {
        let mut key = self.root()?;
        for part in path.split('\\').filter(|p| !p.is_empty()) {
            match self.subkey(&key, part)? {
                Some(next) => key = next,
                None => return Ok(None),
            }
        }
        Ok(Some(key))
    }

    /// Direct child of `key` named `name`
    pub fn subkey(&self, key: &KeyNode, name: &str) -> Result<Option<KeyNode>> {
        Ok(self
            .subkeys(key)?
            .into_iter()
            .find(|k| k.name.eq_ignore_ascii_case(name)))
    }

    /// All direct children of `key`
    pub fn subkeys(&self, key: &KeyNode) -> Result<Vec<KeyNode>> {
        if key.subkey_count == 0 || key.subkeys_cell == u32::MAX {
            return Ok(Vec::new());
        }
        let mut cells = Vec::new();
        self.collect_index(key.subkeys_cell, 0, &mut cells)?;
        if cells.len() != key.subkey_count as usize {
            return Err(Error::corrupt_store(format!(
                "registry key '{}' claims {} subkeys, its index lists {}",
                key.name,
                key.subkey_count,
                cells.len()
            )));
        }
        cells.into_iter().map(|cell| self.key_at(cell)).collect()
    }

    fn collect_index(&self, cell: u32, depth: usize, out: &mut Vec<u32>) -> Result<()> {
        if depth > MAX_INDEX_DEPTH {
            return Err(Error::corrupt_store("registry subkey index nested too deeply"));
        }
        let view = self.cell(cell)?;
        let count = view.u16_le(2)? as usize;
        if view.matches(0, b"lf") || view.matches(0, b"lh") {
            for i in 0..count {
                out.push(view.u32_le(4 + i * 8)?);
            }
        } else if view.matches(0, b"li") {
            for i in 0..count {
                out.push(view.u32_le(4 + i * 4)?);
            }
        } else if view.matches(0, b"ri") {
            for i in 0..count {
                self.collect_index(view.u32_le(4 + i * 4)?, depth + 1, out)?;
            }
        } else {
            return Err(view.error(format!("unknown subkey index at cell 0x{:X}", cell)));
        }
        Ok(())
    }

    /// All values of `key`
    pub fn values(&self, key: &KeyNode) -> Result<Vec<ValueNode>> {
        if key.value_count == 0 || key.values_cell == u32::MAX {
            return Ok(Vec::new());
        }
        let list = self.cell(key.values_cell)?;
        let count = key.value_count as usize;
        if count > list.len() / 4 {
            return Err(list.error(format!(
                "key '{}' claims {} values, its value list holds at most {}",
                key.name,
                count,
                list.len() / 4
            )));
        }
        (0..count)
            .map(|i| {
                let cell = list.u32_le(i * 4)?;
                ValueNode::parse(cell, &self.cell(cell)?)
            })
            .collect()
    }

    /// Value of `key` named `name`, ignoring ASCII case
    pub fn value(&self, key: &KeyNode, name: &str) -> Result<Option<ValueNode>> {
        Ok(self
            .values(key)?
            .into_iter()
            .find(|v| v.name.eq_ignore_ascii_case(name)))
    }

    /// Data bytes of a value
    pub fn value_data(&self, value: &ValueNode) -> Result<&[u8]> {
        let range = self.data_range(value)?;
        Ok(&self.data[range])
    }

    /// Data of the named value of the key at `path`
    pub fn read_value(&self, path: &str, name: &str) -> Result<Option<Vec<u8>>> {
        let Some(key) = self.open_key(path)? else {
            return Ok(None);
        };
        match self.value(&key, name)? {
            Some(value) => Ok(Some(self.value_data(&value)?.to_vec())),
            None => Ok(None),
        }
    }

    /// Read a `REG_SZ` value as text
    pub fn read_string(&self, path: &str, name: &str) -> Result<Option<String>> {
        Ok(self.read_value(path, name)?.map(|raw| decode_utf16(&raw)))
    }

    /// Overwrite a value's data with bytes of the same length
    pub fn write_value_data(&mut self, value: &ValueNode, data: &[u8]) -> Result<()> {
        let range = self.data_range(value)?;
        if range.len() != data.len() {
            return Err(Error::invalid_operation(format!(
                "value '{}' holds {} bytes, replacement has {}",
                value.name,
                range.len(),
                data.len()
            )));
        }
        self.data[range].copy_from_slice(data);
        Ok(())
    }

    /// Class name of a key
    pub fn class_name(&self, key: &KeyNode) -> Result<Option<String>> {
        if key.class_cell == u32::MAX || key.class_len == 0 {
            return Ok(None);
        }
        let view = self.cell(key.class_cell)?;
        Ok(Some(decode_utf16(view.bytes(0, key.class_len as usize)?)))
    }

    fn key_at(&self, cell: u32) -> Result<KeyNode> {
        KeyNode::parse(cell, &self.cell(cell)?)
    }

    fn data_range(&self, value: &ValueNode) -> Result<Range<usize>> {
        let len = value.data_len as usize;
        if value.inline {
            if len > 4 {
                return Err(Error::corrupt_store(format!(
                    "inline value '{}' claims {} bytes",
                    value.name, len
                )));
            }
            let start = self.cell_range(value.cell)?.start + 8;
            return Ok(start..start + len);
        }
        if value.data_len > MAX_SINGLE_CELL_DATA && self.cell(value.data_cell)?.matches(0, b"db") {
            return Err(Error::corrupt_store(format!(
                "value '{}' is stored as big data, which is not supported",
                value.name
            )));
        }
        let cell = self.cell_range(value.data_cell)?;
        if cell.len() < len {
            return Err(Error::corrupt_store(format!(
                "value '{}' data ({} bytes) overruns its cell ({} bytes)",
                value.name,
                len,
                cell.len()
            )));
        }
        Ok(cell.start..cell.start + len)
    }

    /// Byte range of a cell's payload in the hive buffer
    fn cell_range(&self, cell: u32) -> Result<Range<usize>> {
        if cell == u32::MAX || cell & DATA_INLINE != 0 {
            return Err(Error::corrupt_store(format!("invalid cell offset 0x{:X}", cell)));
        }
        let start = BASE_BLOCK_LEN + cell as usize;
        let view = ByteView::new(&self.data, Realm::Store, "registry cell");
        let size = view.i32_le(start)?.unsigned_abs() as usize;
        if size < 4 || start + size > self.data.len() {
            return Err(Error::corrupt_store(format!(
                "cell 0x{:X} has invalid size {}",
                cell, size
            )));
        }
        Ok(start + 4..start + size)
    }

    fn cell(&self, cell: u32) -> Result<ByteView<'_>> {
        let range = self.cell_range(cell)?;
        Ok(ByteView::new(&self.data[range], Realm::Store, "registry cell"))
    }
}
