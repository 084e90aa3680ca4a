//! VeraCrypt header layout

use serde::Serialize;
use unseal_core::{ByteView, Realm, Result};

/// Volume header length, salt included
pub const HEADER_LEN: usize = 512;

/// Length of the plaintext salt preceding the encrypted header
pub const SALT_LEN: usize = 64;

/// Magic at the start of a decrypted header
pub const HEADER_MAGIC: &[u8; 4] = b"VERA";

/// Default start of the data area of a non-system volume
pub const VOLUME_DATA_OFFSET: u64 = 131_072;

/// Disk sector holding the system encryption header
pub const SYSTEM_HEADER_SECTOR: u64 = 62;

/// Size of a VeraCrypt data unit
pub const DATA_UNIT: u64 = 512;

/// Smallest zone considered for the entropy heuristic
pub const MIN_VOLUME_SIZE: u64 = 256 * 1024;

/// Bits of entropy per byte above which a sector looks encrypted
pub const ENTROPY_THRESHOLD: f64 = 7.2;

/// Length of the AES-XTS master (and header) key
pub const XTS_KEY_LEN: usize = 64;

/// Where the header was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VeraCryptLayout {
    /// Header in the first sector of the volume
    Volume,
    /// System encryption header in disk sector 62
    System,
}

/// Fields of a successfully decrypted header
#[derive(Clone, PartialEq, Eq)]
pub struct DecryptedHeader {
    pub version: u16,
    pub volume_size: u64,
    /// Byte offset where the encrypted data area starts
    pub data_area_offset: u64,
    pub data_area_size: u64,
    pub flags: u32,
    pub sector_size: u32,
    /// Primary and secondary XTS keys for the first cipher
    pub master_key: Vec<u8>,
}

impl std::fmt::Debug for DecryptedHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptedHeader")
            .field("version", &self.version)
            .field("volume_size", &self.volume_size)
            .field("data_area_offset", &self.data_area_offset)
            .field("flags", &format_args!("0x{:08X}", self.flags))
            .finish()
    }
}

impl DecryptedHeader {
    /// Validate magic and both CRCs of a decrypted 512-byte header
    ///
    /// `Ok(None)` means the bytes are not a valid header, which is the normal
    /// outcome of a wrong key.
    pub fn parse(plain: &[u8]) -> Result<Option<Self>> {
        let view = ByteView::new(plain, Realm::Header, "VeraCrypt header");
        if view.len() < HEADER_LEN || !view.matches(SALT_LEN, HEADER_MAGIC) {
            return Ok(None);
        }

        let keys_crc = view.u32_be(72)?;
        if crc32fast::hash(view.bytes(256, 256)?) != keys_crc {
            return Ok(None);
        }
        let header_crc = view.u32_be(252)?;
        if crc32fast::hash(view.bytes(64, 188)?) != header_crc {
            return Ok(None);
        }

        Ok(Some(Self {
            version: view.u16_be(68)?,
            volume_size: view.u64_be(100)?,
            data_area_offset: view.u64_be(108)?,
            data_area_size: view.u64_be(116)?,
            flags: view.u32_be(124)?,
            sector_size: view.u32_be(128)?,
            master_key: view.bytes(256, XTS_KEY_LEN)?.to_vec(),
        }))
    }
}

/// Shannon entropy in bits per byte
pub fn shannon_entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let mut counts = [0usize; 256];
    for &b in data {
        counts[b as usize] += 1;
    }
    let len = data.len() as f64;
    counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / len;
            -p * p.log2()
        })
        .sum()
}
