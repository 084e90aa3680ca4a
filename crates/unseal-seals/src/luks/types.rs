//! LUKS header structures

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use std::collections::BTreeMap;
use unseal_core::{ByteView, Error, Realm, Result};

/// `LUKS\xba\xbe`
pub const LUKS_MAGIC: &[u8; 6] = b"LUKS\xba\xbe";

/// Size of the LUKS1 binary header
pub const LUKS1_HEADER_LEN: usize = 592;

/// Size of the LUKS2 binary header preceding the JSON area
pub const LUKS2_BINARY_HEADER_LEN: usize = 4096;

/// Number of LUKS1 key slots
pub const LUKS1_SLOTS: usize = 8;

/// Marker of an enabled LUKS1 key slot
pub const SLOT_ACTIVE: u32 = 0x00AC_71F3;

/// Marker of a disabled LUKS1 key slot
pub const SLOT_INACTIVE: u32 = 0x0000_DEAD;

/// LUKS sector size for key material and offsets
pub const LUKS_SECTOR: u64 = 512;

const SLOT_TABLE_OFFSET: usize = 208;
const SLOT_LEN: usize = 48;

/// One LUKS1 key slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Luks1Slot {
    pub active: bool,
    pub iterations: u32,
    pub salt: [u8; 32],
    /// Start of the key material, in sectors
    pub key_material_offset: u32,
    pub stripes: u32,
}

/// LUKS1 phdr
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Luks1Header {
    pub cipher_name: String,
    pub cipher_mode: String,
    pub hash_spec: String,
    /// Start of the encrypted payload, in sectors
    pub payload_offset: u32,
    pub key_bytes: u32,
    pub mk_digest: [u8; 20],
    pub mk_digest_salt: [u8; 32],
    pub mk_digest_iterations: u32,
    pub uuid: String,
    pub slots: Vec<Luks1Slot>,
}

impl Luks1Header {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let view = ByteView::new(data, Realm::Header, "LUKS1 header");
        if !view.matches(0, LUKS_MAGIC) {
            return Err(view.error("LUKS magic missing"));
        }
        let version = view.u16_be(6)?;
        if version != 1 {
            return Err(view.error(format!("expected version 1, found {}", version)));
        }

        let mut slots = Vec::with_capacity(LUKS1_SLOTS);
        for i in 0..LUKS1_SLOTS {
            let slot = view.sub(SLOT_TABLE_OFFSET + i * SLOT_LEN, SLOT_LEN)?;
            let marker = slot.u32_be(0)?;
            slots.push(Luks1Slot {
                active: marker == SLOT_ACTIVE,
                iterations: slot.u32_be(4)?,
                salt: slot.array::<32>(8)?,
                key_material_offset: slot.u32_be(40)?,
                stripes: slot.u32_be(44)?,
            });
        }

        let key_bytes = view.u32_be(108)?;
        if key_bytes == 0 || key_bytes > 256 {
            return Err(view.error(format!("key size {} out of range", key_bytes)));
        }

        Ok(Self {
            cipher_name: view.fixed_str(8, 32)?,
            cipher_mode: view.fixed_str(40, 32)?,
            hash_spec: view.fixed_str(72, 32)?,
            payload_offset: view.u32_be(104)?,
            key_bytes,
            mk_digest: view.array::<20>(112)?,
            mk_digest_salt: view.array::<32>(132)?,
            mk_digest_iterations: view.u32_be(164)?,
            uuid: view.fixed_str(168, 40)?,
            slots,
        })
    }
}

/// Fields of the LUKS2 binary header that locate the JSON area
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Luks2BinaryHeader {
    pub header_size: u64,
    pub sequence_id: u64,
    pub label: String,
    pub uuid: String,
}

impl Luks2BinaryHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let view = ByteView::new(data, Realm::Header, "LUKS2 header");
        if !view.matches(0, LUKS_MAGIC) {
            return Err(view.error("LUKS magic missing"));
        }
        let version = view.u16_be(6)?;
        if version != 2 {
            return Err(view.error(format!("expected version 2, found {}", version)));
        }
        let header_size = view.u64_be(8)?;
        if header_size <= LUKS2_BINARY_HEADER_LEN as u64 {
            return Err(view.error(format!("header size {} leaves no JSON area", header_size)));
        }
        Ok(Self {
            header_size,
            sequence_id: view.u64_be(16)?,
            label: view.fixed_str(24, 48)?,
            uuid: view.fixed_str(168, 40)?,
        })
    }
}

/// LUKS2 JSON metadata
#[derive(Debug, Clone, Deserialize)]
pub struct Luks2Metadata {
    #[serde(default)]
    pub keyslots: BTreeMap<String, Luks2Keyslot>,
    #[serde(default)]
    pub segments: BTreeMap<String, Luks2Segment>,
    #[serde(default)]
    pub digests: BTreeMap<String, Luks2Digest>,
}

impl Luks2Metadata {
    /// Parse the NUL-padded JSON area
    pub fn parse(area: &[u8]) -> Result<Self> {
        let end = area.iter().position(|&b| b == 0).unwrap_or(area.len());
        serde_json::from_slice(&area[..end])
            .map_err(|e| Error::invalid_header(format!("LUKS2 JSON metadata: {}", e)))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Luks2Keyslot {
    /// `luks2` for passphrase slots, `reencrypt` during online reencryption
    #[serde(rename = "type")]
    pub slot_type: String,
    pub key_size: usize,
    pub area: Luks2Area,
    #[serde(default)]
    pub kdf: Option<Luks2Kdf>,
    #[serde(default)]
    pub af: Option<Luks2Af>,
}

impl Luks2Keyslot {
    pub fn holds_master_key(&self) -> bool {
        self.slot_type == "luks2"
    }
}

/// Keyslot area; only `raw` areas carry encryption parameters
#[derive(Debug, Clone, Deserialize)]
pub struct Luks2Area {
    #[serde(rename = "type")]
    pub area_type: String,
    pub offset: String,
    pub size: String,
    #[serde(default)]
    pub encryption: Option<String>,
    #[serde(default)]
    pub key_size: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Luks2Kdf {
    #[serde(rename = "type")]
    pub kdf_type: String,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub iterations: Option<u32>,
    #[serde(default)]
    pub salt: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Luks2Af {
    #[serde(rename = "type")]
    pub af_type: String,
    #[serde(default)]
    pub stripes: Option<u32>,
    #[serde(default)]
    pub hash: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Luks2Segment {
    #[serde(rename = "type")]
    pub segment_type: String,
    pub offset: String,
    pub size: String,
    #[serde(default)]
    pub encryption: Option<String>,
    #[serde(default)]
    pub sector_size: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Luks2Digest {
    #[serde(rename = "type")]
    pub digest_type: String,
    #[serde(default)]
    pub keyslots: Vec<String>,
    #[serde(default)]
    pub segments: Vec<String>,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub iterations: Option<u32>,
    pub salt: String,
    pub digest: String,
}

/// Parse a JSON number carried as a string
pub fn json_u64(value: &str, field: &str) -> Result<u64> {
    value
        .parse::<u64>()
        .map_err(|_| Error::invalid_header(format!("LUKS2 {} is not a number: {:?}", field, value)))
}

/// Decode a base64 JSON field
pub fn json_base64(value: &str, field: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(value)
        .map_err(|e| Error::invalid_header(format!("LUKS2 {} is not base64: {}", field, e)))
}
