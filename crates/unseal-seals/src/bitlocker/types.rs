//! BitLocker on-disk structures

use serde::Serialize;
use std::fmt;
use unseal_core::{ByteView, Error, Result};
use uuid::Uuid;

/// Signature of BitLocker boot sectors and FVE information blocks
pub const FVE_SIGNATURE: &[u8; 8] = b"-FVE-FS-";

/// OEM identifier of BitLocker To Go volumes
pub const TO_GO_SIGNATURE: &[u8; 8] = b"MSWIN4.1";

/// Offset of the dataset inside an FVE information block
pub const DATASET_OFFSET: usize = 0x40;

/// Datum entry type of a volume master key
pub const ENTRY_VMK: u16 = 0x0002;
/// Datum entry type of the full volume encryption key
pub const ENTRY_FVEK: u16 = 0x0003;
/// Datum entry type locating the relocated boot sectors
pub const ENTRY_VOLUME_HEADER_BLOCK: u16 = 0x000F;

/// Datum value type of a raw key
pub const DATUM_KEY: u16 = 0x0001;
/// Datum value type of an AES-CCM encrypted key
pub const DATUM_AES_CCM: u16 = 0x0005;
/// Datum value type of a volume master key protector
pub const DATUM_VMK: u16 = 0x0008;
/// Datum value type of an offset and size pair
pub const DATUM_OFFSET_AND_SIZE: u16 = 0x000F;

const DATUM_HEADER_LEN: usize = 8;

/// Layout generation of the volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BitLockerVersion {
    /// Windows Vista, metadata located through an LCN
    Vista,
    /// Windows 7 and later
    Seven,
    /// Removable media with a FAT-compatible boot sector
    ToGo,
}

/// Data encryption method recorded in the dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EncryptionMethod {
    Aes128Diffuser,
    Aes256Diffuser,
    Aes128Cbc,
    Aes256Cbc,
    Aes128Xts,
    Aes256Xts,
}

impl EncryptionMethod {
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0x8000 => Some(EncryptionMethod::Aes128Diffuser),
            0x8001 => Some(EncryptionMethod::Aes256Diffuser),
            0x8002 => Some(EncryptionMethod::Aes128Cbc),
            0x8003 => Some(EncryptionMethod::Aes256Cbc),
            0x8004 => Some(EncryptionMethod::Aes128Xts),
            0x8005 => Some(EncryptionMethod::Aes256Xts),
            _ => None,
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            EncryptionMethod::Aes128Diffuser => 0x8000,
            EncryptionMethod::Aes256Diffuser => 0x8001,
            EncryptionMethod::Aes128Cbc => 0x8002,
            EncryptionMethod::Aes256Cbc => 0x8003,
            EncryptionMethod::Aes128Xts => 0x8004,
            EncryptionMethod::Aes256Xts => 0x8005,
        }
    }

    /// FVEK length in bytes; diffuser methods carry the tweak key too
    pub fn key_len(&self) -> usize {
        match self {
            EncryptionMethod::Aes128Cbc => 16,
            EncryptionMethod::Aes256Cbc => 32,
            EncryptionMethod::Aes128Xts | EncryptionMethod::Aes128Diffuser => 32,
            EncryptionMethod::Aes256Xts | EncryptionMethod::Aes256Diffuser => 64,
        }
    }

    pub fn has_diffuser(&self) -> bool {
        matches!(self, EncryptionMethod::Aes128Diffuser | EncryptionMethod::Aes256Diffuser)
    }

    pub fn is_xts(&self) -> bool {
        matches!(self, EncryptionMethod::Aes128Xts | EncryptionMethod::Aes256Xts)
    }
}

impl fmt::Display for EncryptionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EncryptionMethod::Aes128Diffuser => "AES-128-CBC + Elephant diffuser",
            EncryptionMethod::Aes256Diffuser => "AES-256-CBC + Elephant diffuser",
            EncryptionMethod::Aes128Cbc => "AES-128-CBC",
            EncryptionMethod::Aes256Cbc => "AES-256-CBC",
            EncryptionMethod::Aes128Xts => "AES-128-XTS",
            EncryptionMethod::Aes256Xts => "AES-256-XTS",
        };
        f.write_str(name)
    }
}

/// How a VMK protector guards the volume master key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProtectionType {
    /// Protection suspended, the key is stored in the clear
    ClearKey,
    Tpm,
    StartupKey,
    TpmAndPin,
    RecoveryPassword,
    Password,
    Other(u16),
}

impl ProtectionType {
    pub fn from_code(code: u16) -> Self {
        match code {
            0x0000 => ProtectionType::ClearKey,
            0x0100 => ProtectionType::Tpm,
            0x0200 => ProtectionType::StartupKey,
            0x0500 => ProtectionType::TpmAndPin,
            0x0800 => ProtectionType::RecoveryPassword,
            0x2000 => ProtectionType::Password,
            other => ProtectionType::Other(other),
        }
    }
}

/// AES-CCM encrypted blob (nonce, tag, ciphertext)
#[derive(Clone, PartialEq, Eq)]
pub struct CcmBlob {
    pub nonce: [u8; 12],
    pub mac: [u8; 16],
    pub payload: Vec<u8>,
}

impl fmt::Debug for CcmBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CcmBlob")
            .field("nonce", &hex::encode(self.nonce))
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Decoded value of a datum
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatumValue {
    Key { algorithm: u16, key: Vec<u8> },
    AesCcm(CcmBlob),
    Vmk { guid: Uuid, protection: u16, nested: Vec<Datum> },
    OffsetAndSize { offset: u64, size: u64 },
    Other { datum_type: u16 },
}

/// One metadata entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datum {
    pub entry_type: u16,
    pub value: DatumValue,
}

impl Datum {
    /// Parse one datum starting at `offset`; returns it with its size
    pub fn parse(view: &ByteView, offset: usize) -> Result<(Self, usize)> {
        let size = view.u16_le(offset)? as usize;
        let entry_type = view.u16_le(offset + 2)?;
        let datum_type = view.u16_le(offset + 4)?;

        if size < DATUM_HEADER_LEN {
            return Err(view.error(format!("datum at 0x{:X} has size {}", offset, size)));
        }
        let body = view.sub(offset, size)?;

        let value = match datum_type {
            DATUM_KEY => DatumValue::Key {
                algorithm: body.u16_le(8)?,
                key: body.bytes(12, size.saturating_sub(12))?.to_vec(),
            },
            DATUM_AES_CCM => DatumValue::AesCcm(CcmBlob {
                nonce: body.array::<12>(8)?,
                mac: body.array::<16>(20)?,
                payload: body.bytes(36, size.saturating_sub(36))?.to_vec(),
            }),
            DATUM_VMK => {
                let guid = Uuid::from_bytes_le(body.array::<16>(8)?);
                let protection = body.u16_le(34)?;
                let nested = parse_datums(&body, 36, size)?;
                DatumValue::Vmk {
                    guid,
                    protection,
                    nested,
                }
            }
            DATUM_OFFSET_AND_SIZE => DatumValue::OffsetAndSize {
                offset: body.u64_le(8)?,
                size: body.u64_le(16)?,
            },
            other => DatumValue::Other { datum_type: other },
        };

        Ok((Self { entry_type, value }, size))
    }

    /// Key bytes of a `Key` datum
    pub fn key(&self) -> Option<(u16, &[u8])> {
        match &self.value {
            DatumValue::Key { algorithm, key } => Some((*algorithm, key)),
            _ => None,
        }
    }

    pub fn ccm(&self) -> Option<&CcmBlob> {
        match &self.value {
            DatumValue::AesCcm(blob) => Some(blob),
            _ => None,
        }
    }
}

/// Parse consecutive datums in `start..end`
pub fn parse_datums(view: &ByteView, start: usize, end: usize) -> Result<Vec<Datum>> {
    let mut datums = Vec::new();
    let mut offset = start;
    while offset + DATUM_HEADER_LEN <= end {
        let (datum, size) = Datum::parse(view, offset)?;
        datums.push(datum);
        offset += size;
    }
    Ok(datums)
}

/// A VMK protector from the dataset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmkProtector {
    pub guid: Uuid,
    pub protection: ProtectionType,
    /// Clear key stored next to the wrapped VMK when protection is suspended
    pub clear_key: Option<Vec<u8>>,
    /// VMK encrypted with the protector's key
    pub wrapped_vmk: Option<CcmBlob>,
}

impl VmkProtector {
    pub fn from_datum(datum: &Datum) -> Option<Self> {
        let DatumValue::Vmk {
            guid,
            protection,
            nested,
        } = &datum.value
        else {
            return None;
        };
        Some(Self {
            guid: *guid,
            protection: ProtectionType::from_code(*protection),
            clear_key: nested.iter().find_map(|d| d.key()).map(|(_, k)| k.to_vec()),
            wrapped_vmk: nested.iter().find_map(|d| d.ccm()).cloned(),
        })
    }
}

/// Fields of the BitLocker boot sector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootSector {
    pub version: BitLockerVersion,
    pub bytes_per_sector: u16,
    /// Offsets of the three FVE information block copies, relative to the volume
    pub metadata_offsets: [u64; 3],
}

impl BootSector {
    /// Parse a BitLocker boot sector, or `None` when it is not one
    pub fn parse(sector: &[u8]) -> Result<Option<Self>> {
        let view = ByteView::new(sector, unseal_core::Realm::Header, "BitLocker boot sector");
        let bytes_per_sector = view.u16_le(0x0B)?;

        if view.matches(3, FVE_SIGNATURE) {
            let offsets = [view.u64_le(0xB0)?, view.u64_le(0xB8)?, view.u64_le(0xC0)?];
            if offsets.iter().any(|&o| o != 0) {
                return Ok(Some(Self {
                    version: BitLockerVersion::Seven,
                    bytes_per_sector,
                    metadata_offsets: offsets,
                }));
            }

            let sectors_per_cluster = view.u8(0x0D)? as u64;
            let lcn = view.u64_le(0x38)?;
            let offset = lcn
                .checked_mul(sectors_per_cluster)
                .and_then(|v| v.checked_mul(bytes_per_sector as u64))
                .ok_or_else(|| Error::invalid_header("Vista metadata LCN overflows"))?;
            return Ok(Some(Self {
                version: BitLockerVersion::Vista,
                bytes_per_sector,
                metadata_offsets: [offset, 0, 0],
            }));
        }

        if view.matches(3, TO_GO_SIGNATURE) {
            let offsets = [view.u64_le(0x1B0)?, view.u64_le(0x1B8)?, view.u64_le(0x1C0)?];
            if offsets.iter().all(|&o| o != 0) {
                return Ok(Some(Self {
                    version: BitLockerVersion::ToGo,
                    bytes_per_sector,
                    metadata_offsets: offsets,
                }));
            }
        }

        Ok(None)
    }
}
