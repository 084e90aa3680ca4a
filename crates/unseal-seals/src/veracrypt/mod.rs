//! VeraCrypt volumes
//!
//! VeraCrypt has no plaintext signature. A zone is taken for a VeraCrypt
//! volume when its first sector looks random; the salt and encrypted header
//! are kept together with an encrypted data sample so candidates can be
//! verified without the external mapper.

pub mod types;

pub use types::{shannon_entropy, DecryptedHeader, VeraCryptLayout};

use crate::detect::has_filesystem_signature;
use crate::kdf::HashSpec;
use crate::sector::SectorCipher;
use std::fmt;
use tracing::debug;
use types::{
    DATA_UNIT, ENTROPY_THRESHOLD, HEADER_LEN, MIN_VOLUME_SIZE, SALT_LEN, SYSTEM_HEADER_SECTOR, VOLUME_DATA_OFFSET,
    XTS_KEY_LEN,
};
use unseal_core::{KeyMaterial, ReadSeek, Result, Zone};
use unseal_pipeline::read_region;

/// Data cipher handed to the mapper
pub const DATA_CIPHER: &str = "aes-xts-plain64";

/// Length of the encrypted sample kept for master-key checks
const SAMPLE_LEN: usize = 4096;

/// A header derivation tried for passphrases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VeraCryptKdf {
    pub hash: HashSpec,
    pub iterations: u32,
}

impl VeraCryptKdf {
    /// Derivations VeraCrypt uses without a PIM
    pub fn defaults() -> Vec<Self> {
        vec![
            VeraCryptKdf {
                hash: HashSpec::Sha512,
                iterations: 500_000,
            },
            VeraCryptKdf {
                hash: HashSpec::Sha256,
                iterations: 500_000,
            },
            VeraCryptKdf {
                hash: HashSpec::Sha256,
                iterations: 200_000,
            },
        ]
    }
}

/// One place a VeraCrypt header may live
#[derive(Clone)]
pub struct HeaderSource {
    pub layout: VeraCryptLayout,
    pub salt: [u8; SALT_LEN],
    /// Encrypted header bytes following the salt
    pub encrypted: Vec<u8>,
    /// Encrypted data area sample
    pub sample: Vec<u8>,
    /// Data unit number of the first sample sector
    pub sample_unit: u64,
}

impl fmt::Debug for HeaderSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeaderSource")
            .field("layout", &self.layout)
            .field("sample_unit", &self.sample_unit)
            .finish()
    }
}

impl HeaderSource {
    fn from_sector(layout: VeraCryptLayout, sector: &[u8], sample: Vec<u8>, sample_unit: u64) -> Option<Self> {
        if sector.len() < HEADER_LEN {
            return None;
        }
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&sector[..SALT_LEN]);
        Some(Self {
            layout,
            salt,
            encrypted: sector[SALT_LEN..HEADER_LEN].to_vec(),
            sample,
            sample_unit,
        })
    }

    /// Decrypt the header with a header key
    pub fn decrypt_header(&self, header_key: &[u8]) -> Option<DecryptedHeader> {
        let cipher = SectorCipher::xts(header_key).ok()?;
        let mut plain = vec![0u8; HEADER_LEN];
        plain[..SALT_LEN].copy_from_slice(&self.salt);
        plain[SALT_LEN..].copy_from_slice(&self.encrypted);
        cipher.decrypt_unit(&mut plain[SALT_LEN..], 0);
        DecryptedHeader::parse(&plain).ok().flatten()
    }

    /// Decrypt the data sample with a master key and look for a filesystem
    pub fn verify_master_key(&self, master_key: &[u8]) -> bool {
        let Ok(cipher) = SectorCipher::xts(master_key) else {
            return false;
        };
        let mut sample = self.sample.clone();
        cipher.decrypt_units(&mut sample, DATA_UNIT as usize, self.sample_unit);
        has_filesystem_signature(&sample)
    }
}

/// Encrypted headers that may belong to a VeraCrypt volume
#[derive(Debug, Clone)]
pub struct VeraCryptHeader {
    pub sources: Vec<HeaderSource>,
    /// Absolute sector of the zone start, the IV base of system encryption
    pub zone_sector: u64,
}

/// A verified header or master key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VeraCryptUnlock {
    pub layout: VeraCryptLayout,
    pub header: Option<DecryptedHeader>,
}

impl VeraCryptHeader {
    /// Apply the entropy heuristic to the zone and collect header sources
    pub fn read(source: &mut dyn ReadSeek, zone: &Zone, first_sector: &[u8]) -> Result<Option<Self>> {
        if zone.length < MIN_VOLUME_SIZE || first_sector.len() < HEADER_LEN {
            return Ok(None);
        }
        let first = &first_sector[..HEADER_LEN];
        let entropy = shannon_entropy(first);
        if entropy < ENTROPY_THRESHOLD {
            return Ok(None);
        }
        debug!("Zone {} first sector entropy {:.2} bits/byte", zone.index, entropy);

        let zone_sector = zone.offset / DATA_UNIT;
        let mut sources = Vec::new();

        let volume_sample = read_region(source, zone.offset + VOLUME_DATA_OFFSET, SAMPLE_LEN)?;
        if volume_sample.len() == SAMPLE_LEN {
            sources.extend(HeaderSource::from_sector(
                VeraCryptLayout::Volume,
                first,
                volume_sample,
                VOLUME_DATA_OFFSET / DATA_UNIT,
            ));
        }

        let system_offset = SYSTEM_HEADER_SECTOR * DATA_UNIT;
        if zone.offset > system_offset {
            let system = read_region(source, system_offset, HEADER_LEN)?;
            if system.len() == HEADER_LEN && shannon_entropy(&system) >= ENTROPY_THRESHOLD {
                let system_sample = read_region(source, zone.offset, SAMPLE_LEN)?;
                sources.extend(HeaderSource::from_sector(
                    VeraCryptLayout::System,
                    &system,
                    system_sample,
                    zone_sector,
                ));
            }
        }

        if sources.is_empty() {
            return Ok(None);
        }
        Ok(Some(Self { sources, zone_sector }))
    }

    /// Try a candidate as a header key on every source
    pub fn try_header_key(&self, key: &[u8]) -> Option<VeraCryptUnlock> {
        if key.len() != XTS_KEY_LEN {
            return None;
        }
        self.sources.iter().find_map(|s| {
            s.decrypt_header(key).map(|header| VeraCryptUnlock {
                layout: s.layout,
                header: Some(header),
            })
        })
    }

    /// Try a candidate as the data area master key on every source
    pub fn try_master_key(&self, key: &[u8]) -> Option<VeraCryptUnlock> {
        if key.len() != XTS_KEY_LEN {
            return None;
        }
        self.sources
            .iter()
            .find(|s| s.verify_master_key(key))
            .map(|s| VeraCryptUnlock {
                layout: s.layout,
                header: None,
            })
    }

    /// Derive header keys from a passphrase and try them
    pub fn try_passphrase(&self, passphrase: &[u8], kdfs: &[VeraCryptKdf]) -> Option<(VeraCryptUnlock, VeraCryptKdf)> {
        for source in &self.sources {
            for kdf in kdfs {
                let header_key = kdf.hash.derive(passphrase, &source.salt, kdf.iterations, XTS_KEY_LEN);
                if let Some(header) = source.decrypt_header(&header_key) {
                    return Some((
                        VeraCryptUnlock {
                            layout: source.layout,
                            header: Some(header),
                        },
                        *kdf,
                    ));
                }
            }
        }
        None
    }

    /// Mapper parameters for an unlocked volume
    pub fn key_material(&self, unlock: &VeraCryptUnlock, master_key: &[u8]) -> KeyMaterial {
        let (data_offset_sectors, iv_offset_sectors) = match unlock.layout {
            VeraCryptLayout::Volume => {
                let offset = unlock
                    .header
                    .as_ref()
                    .map(|h| h.data_area_offset)
                    .filter(|&o| o != 0)
                    .unwrap_or(VOLUME_DATA_OFFSET);
                (offset / DATA_UNIT, offset / DATA_UNIT)
            }
            VeraCryptLayout::System => (0, self.zone_sector),
        };
        KeyMaterial::VeraCrypt {
            cipher: DATA_CIPHER.to_string(),
            key: master_key.to_vec(),
            data_offset_sectors,
            iv_offset_sectors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::VeraCryptFixture;
    use std::io::Cursor;
    use unseal_core::DeclaredType;

    fn read(disk: Vec<u8>, zone: &Zone) -> Option<VeraCryptHeader> {
        let first = disk[zone.offset as usize..zone.offset as usize + 512].to_vec();
        VeraCryptHeader::read(&mut Cursor::new(disk), zone, &first).unwrap()
    }

    #[test]
    fn test_volume_layout_keys() {
        let fixture = VeraCryptFixture::new("open sesame");
        let volume = fixture.volume();
        let zone = Zone::new(0, 0, volume.len() as u64, DeclaredType::Mbr(0x07), "NTFS/exFAT");
        let header = read(volume, &zone).unwrap();
        assert_eq!(header.sources.len(), 1);

        let unlock = header.try_header_key(&fixture.header_key()).unwrap();
        assert_eq!(unlock.layout, VeraCryptLayout::Volume);
        assert_eq!(unlock.header.as_ref().unwrap().master_key, fixture.master_key);

        let by_master = header.try_master_key(&fixture.master_key).unwrap();
        assert!(by_master.header.is_none());
        assert!(header.try_master_key(&fixture.header_key()).is_none());

        let (by_pass, kdf) = header.try_passphrase(b"open sesame", &fixture.kdfs()).unwrap();
        assert_eq!(kdf, fixture.kdfs()[0]);
        assert_eq!(by_pass, unlock);
        assert!(header.try_passphrase(b"close sesame", &fixture.kdfs()).is_none());

        match header.key_material(&unlock, &fixture.master_key) {
            KeyMaterial::VeraCrypt {
                data_offset_sectors,
                iv_offset_sectors,
                ..
            } => {
                assert_eq!(data_offset_sectors, 256);
                assert_eq!(iv_offset_sectors, 256);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_low_entropy_is_not_veracrypt() {
        let zone = Zone::new(0, 0, 512 * 1024, DeclaredType::Mbr(0x07), "NTFS/exFAT");
        assert!(read(vec![0u8; 512 * 1024], &zone).is_none());
    }

    #[test]
    fn test_small_zone_is_not_veracrypt() {
        let fixture = VeraCryptFixture::new("pw");
        let volume = fixture.volume();
        let zone = Zone::new(0, 0, 64 * 1024, DeclaredType::Mbr(0x07), "NTFS/exFAT");
        assert!(read(volume, &zone).is_none());
    }
}
