//! BitLocker volumes
//!
//! Metadata is read from the first FVE information block whose signature
//! checks out. Verification never touches the encrypted data area: a
//! candidate FVEK must decrypt the relocated boot sector into a filesystem
//! boot sector, and a candidate VMK must pass the AES-CCM tag of the
//! wrapped FVEK.

pub mod types;

pub use types::{
    BitLockerVersion, BootSector, CcmBlob, Datum, DatumValue, EncryptionMethod, ProtectionType, VmkProtector,
};

use crate::sector::{IvScheme, SectorCipher};
use aes::Aes256;
use ccm::aead::generic_array::GenericArray;
use ccm::aead::{AeadInPlace, KeyInit};
use ccm::consts::{U12, U16};
use ccm::Ccm;
use std::fmt;
use tracing::debug;
use types::{DATASET_OFFSET, ENTRY_FVEK, ENTRY_VMK, ENTRY_VOLUME_HEADER_BLOCK, FVE_SIGNATURE};
use unseal_core::{ByteView, Error, ReadSeek, Realm, Result, Zone, MAX_METADATA_SIZE};
use unseal_pipeline::read_region;
use uuid::Uuid;

/// AES-256-CCM as used for BitLocker key protectors
pub type BitLockerCcm = Ccm<Aes256, U16, U12>;

/// Filesystem OEM identifiers accepted in a decrypted boot sector
const BOOT_OEM_IDS: [&[u8; 8]; 4] = [b"NTFS    ", b"MSDOS5.0", b"MSWIN4.1", b"EXFAT   "];

/// Parsed BitLocker metadata plus the encrypted boot sector used for checks
#[derive(Clone)]
pub struct BitLockerHeader {
    pub version: BitLockerVersion,
    pub sector_size: u16,
    /// Offset of the information block that was used
    pub metadata_offset: u64,
    pub info_version: u16,
    pub dataset_guid: Uuid,
    /// Raw method code from the dataset
    pub method_code: u16,
    pub protectors: Vec<VmkProtector>,
    pub wrapped_fvek: Option<CcmBlob>,
    /// Offset of the relocated boot sector, relative to the volume
    pub boot_backup_offset: u64,
    /// The relocated boot sector as stored (encrypted)
    pub encrypted_boot_sector: Vec<u8>,
}

impl fmt::Debug for BitLockerHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitLockerHeader")
            .field("version", &self.version)
            .field("dataset_guid", &self.dataset_guid)
            .field("method", &format_args!("0x{:04X}", self.method_code))
            .field("protectors", &self.protectors.len())
            .field("boot_backup_offset", &self.boot_backup_offset)
            .finish()
    }
}

impl BitLockerHeader {
    /// Read the metadata of the volume in `zone`
    ///
    /// Returns `Ok(None)` when the boot sector is not a BitLocker one.
    pub fn read(source: &mut dyn ReadSeek, zone: &Zone, boot_sector: &[u8]) -> Result<Option<Self>> {
        let Some(boot) = BootSector::parse(boot_sector)? else {
            return Ok(None);
        };

        let mut last_err = None;
        for &offset in boot.metadata_offsets.iter().filter(|&&o| o != 0) {
            match Self::read_information(source, zone, &boot, offset) {
                Ok(header) => return Ok(Some(header)),
                Err(e) => {
                    debug!("FVE information block at 0x{:X} unusable: {}", offset, e);
                    last_err = Some(e);
                }
            }
        }

        // A To Go signature alone is an ordinary FAT volume
        if boot.version == BitLockerVersion::ToGo {
            return Ok(None);
        }
        Err(last_err.unwrap_or_else(|| Error::invalid_header("no FVE information block offsets")))
    }

    fn read_information(source: &mut dyn ReadSeek, zone: &Zone, boot: &BootSector, offset: u64) -> Result<Self> {
        if offset >= zone.length {
            return Err(Error::invalid_header(format!("FVE block offset 0x{:X} beyond volume", offset)));
        }

        let head = read_region(source, zone.offset + offset, DATASET_OFFSET + 0x30)?;
        let head_view = ByteView::new(&head, Realm::Header, "FVE information block");
        if !head_view.matches(0, FVE_SIGNATURE) {
            return Err(Error::invalid_header("FVE information block signature missing"));
        }
        let dataset_size = head_view.u32_le(DATASET_OFFSET)? as usize;
        if dataset_size < 0x30 || dataset_size > MAX_METADATA_SIZE {
            return Err(Error::invalid_header(format!("dataset size {} out of range", dataset_size)));
        }

        let block = read_region(source, zone.offset + offset, DATASET_OFFSET + dataset_size)?;
        let view = ByteView::new(&block, Realm::Header, "FVE information block");
        let info_version = view.u16_le(0x0A)?;
        let backup_from_info = view.u64_le(0x38)?;

        let dataset = view.sub(DATASET_OFFSET, dataset_size)?;
        let header_size = dataset.u32_le(8)? as usize;
        if header_size < 0x30 || header_size > dataset_size {
            return Err(Error::invalid_header(format!("dataset header size {}", header_size)));
        }
        let dataset_guid = Uuid::from_bytes_le(dataset.array::<16>(0x10)?);
        let method_code = dataset.u16_le(0x24)?;
        let datums = types::parse_datums(&dataset, header_size, dataset_size)?;

        let protectors: Vec<VmkProtector> = datums
            .iter()
            .filter(|d| d.entry_type == ENTRY_VMK)
            .filter_map(VmkProtector::from_datum)
            .collect();
        let wrapped_fvek = datums
            .iter()
            .filter(|d| d.entry_type == ENTRY_FVEK)
            .find_map(|d| d.ccm())
            .cloned();
        let boot_backup_offset = datums
            .iter()
            .filter(|d| d.entry_type == ENTRY_VOLUME_HEADER_BLOCK)
            .find_map(|d| match d.value {
                DatumValue::OffsetAndSize { offset, .. } => Some(offset),
                _ => None,
            })
            .unwrap_or(backup_from_info);

        let sector_size = boot.bytes_per_sector.max(512) as usize;
        let encrypted_boot_sector = read_region(source, zone.offset + boot_backup_offset, sector_size)?;
        if encrypted_boot_sector.len() < sector_size {
            return Err(Error::invalid_header("relocated boot sector truncated"));
        }

        debug!(
            "BitLocker {:?} dataset {} method 0x{:04X}, {} protectors",
            boot.version,
            dataset_guid,
            method_code,
            protectors.len()
        );

        Ok(Self {
            version: boot.version,
            sector_size: boot.bytes_per_sector,
            metadata_offset: offset,
            info_version,
            dataset_guid,
            method_code,
            protectors,
            wrapped_fvek,
            boot_backup_offset,
            encrypted_boot_sector,
        })
    }

    pub fn method(&self) -> Option<EncryptionMethod> {
        EncryptionMethod::from_code(self.method_code)
    }

    /// Protectors whose protection is suspended
    pub fn clear_key_protectors(&self) -> impl Iterator<Item = &VmkProtector> {
        self.protectors
            .iter()
            .filter(|p| p.protection == ProtectionType::ClearKey && p.clear_key.is_some())
    }

    /// Decrypt the relocated boot sector with `fvek` and check for a filesystem
    pub fn verify_fvek(&self, fvek: &[u8]) -> bool {
        let Some(method) = self.method() else {
            return false;
        };
        if method.has_diffuser() || fvek.len() != method.key_len() {
            return false;
        }

        let sector_size = self.sector_size.max(512) as u64;
        let cipher = if method.is_xts() {
            SectorCipher::xts(fvek)
        } else {
            SectorCipher::cbc(fvek, IvScheme::EncryptedOffset)
        };
        let Ok(cipher) = cipher else {
            return false;
        };

        let position = if method.is_xts() {
            self.boot_backup_offset / sector_size
        } else {
            self.boot_backup_offset
        };
        let mut sector = self.encrypted_boot_sector.clone();
        cipher.decrypt_unit(&mut sector, position);
        is_boot_sector(&sector)
    }

    /// Unwrap the FVEK with a volume master key; the CCM tag is the check
    pub fn unwrap_fvek(&self, vmk: &[u8]) -> Option<(u16, Vec<u8>)> {
        let blob = self.wrapped_fvek.as_ref()?;
        let plain = ccm_unwrap(vmk, blob)?;
        let (algorithm, key) = key_from_payload(&plain)?;
        Some((algorithm, key))
    }

    /// FVEK reachable without any candidate through a clear-key protector
    pub fn clear_key_fvek(&self) -> Option<(u16, Vec<u8>)> {
        self.clear_key_protectors().find_map(|p| {
            let clear = p.clear_key.as_ref()?;
            let vmk_plain = ccm_unwrap(clear, p.wrapped_vmk.as_ref()?)?;
            let (_, vmk) = key_from_payload(&vmk_plain)?;
            self.unwrap_fvek(&vmk)
        })
    }
}

/// AES-CCM decrypt and authenticate a protector blob
pub fn ccm_unwrap(key: &[u8], blob: &CcmBlob) -> Option<Vec<u8>> {
    if key.len() != 32 {
        return None;
    }
    let cipher = BitLockerCcm::new(GenericArray::from_slice(key));
    let mut buffer = blob.payload.clone();
    cipher
        .decrypt_in_place_detached(
            GenericArray::from_slice(&blob.nonce),
            b"",
            &mut buffer,
            GenericArray::from_slice(&blob.mac),
        )
        .ok()?;
    Some(buffer)
}

/// AES-CCM encrypt a payload into a protector blob
pub fn ccm_wrap(key: &[u8], nonce: [u8; 12], payload: &[u8]) -> Result<CcmBlob> {
    if key.len() != 32 {
        return Err(Error::crypto(format!("AES-CCM key must be 32 bytes, got {}", key.len())));
    }
    let cipher = BitLockerCcm::new(GenericArray::from_slice(key));
    let mut buffer = payload.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(GenericArray::from_slice(&nonce), b"", &mut buffer)
        .map_err(|_| Error::crypto("AES-CCM encryption failed"))?;
    let mut mac = [0u8; 16];
    mac.copy_from_slice(&tag);
    Ok(CcmBlob {
        nonce,
        mac,
        payload: buffer,
    })
}

/// Decrypted CCM payloads are themselves key datums
fn key_from_payload(plain: &[u8]) -> Option<(u16, Vec<u8>)> {
    let view = ByteView::new(plain, Realm::Header, "unwrapped key");
    let (datum, _) = Datum::parse(&view, 0).ok()?;
    datum.key().map(|(algorithm, key)| (algorithm, key.to_vec()))
}

/// True for a sector that looks like an NTFS or FAT boot sector
pub fn is_boot_sector(sector: &[u8]) -> bool {
    sector.len() >= 512
        && sector[510] == 0x55
        && sector[511] == 0xAA
        && BOOT_OEM_IDS.iter().any(|oem| &sector[3..11] == oem.as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{ntfs_boot_sector, BitLockerFixture};
    use std::io::Cursor;
    use unseal_core::DeclaredType;

    fn read(fixture: &BitLockerFixture) -> BitLockerHeader {
        let volume = fixture.build();
        let zone = Zone::new(0, 0, volume.len() as u64, DeclaredType::Mbr(0x07), "NTFS/exFAT");
        let boot = volume[..512].to_vec();
        BitLockerHeader::read(&mut Cursor::new(volume), &zone, &boot)
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_ccm_wrap_unwrap() {
        let blob = ccm_wrap(&[7u8; 32], [1u8; 12], b"volume master key").unwrap();
        assert_eq!(ccm_unwrap(&[7u8; 32], &blob).unwrap(), b"volume master key");
        assert!(ccm_unwrap(&[8u8; 32], &blob).is_none());
    }

    #[test]
    fn test_read_metadata() {
        let fixture = BitLockerFixture::new(EncryptionMethod::Aes128Xts);
        let header = read(&fixture);
        assert_eq!(header.version, BitLockerVersion::Seven);
        assert_eq!(header.method(), Some(EncryptionMethod::Aes128Xts));
        assert_eq!(header.protectors.len(), 1);
        assert_eq!(header.protectors[0].protection, ProtectionType::Password);
        assert!(header.wrapped_fvek.is_some());
        assert_eq!(header.clear_key_protectors().count(), 0);
    }

    #[test]
    fn test_verify_fvek_xts_and_cbc() {
        for method in [EncryptionMethod::Aes128Xts, EncryptionMethod::Aes256Xts, EncryptionMethod::Aes256Cbc] {
            let fixture = BitLockerFixture::new(method);
            let header = read(&fixture);
            assert!(header.verify_fvek(&fixture.fvek), "{}", method);
            let mut wrong = fixture.fvek.clone();
            wrong[0] ^= 1;
            assert!(!header.verify_fvek(&wrong));
        }
    }

    #[test]
    fn test_unwrap_fvek_with_vmk() {
        let fixture = BitLockerFixture::new(EncryptionMethod::Aes256Xts);
        let header = read(&fixture);
        let (algorithm, fvek) = header.unwrap_fvek(&fixture.vmk).unwrap();
        assert_eq!(algorithm, 0x8005);
        assert_eq!(fvek, fixture.fvek);
        assert!(header.unwrap_fvek(&[0u8; 32]).is_none());
    }

    #[test]
    fn test_clear_key_protector() {
        let fixture = BitLockerFixture::new(EncryptionMethod::Aes128Xts).with_clear_key([0x33; 32]);
        let header = read(&fixture);
        assert_eq!(header.clear_key_fvek().unwrap().1, fixture.fvek);
    }

    #[test]
    fn test_plain_boot_sector_is_not_bitlocker() {
        let sector = ntfs_boot_sector();
        let zone = Zone::new(0, 0, 4096, DeclaredType::Mbr(0x07), "NTFS/exFAT");
        let mut source = Cursor::new(vec![0u8; 4096]);
        assert!(BitLockerHeader::read(&mut source, &zone, &sector).unwrap().is_none());
        assert!(is_boot_sector(&sector));
    }
}
