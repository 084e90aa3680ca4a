//! LUKS1 and LUKS2 volumes
//!
//! A raw candidate is a master key when its PBKDF2 digest matches the one in
//! the header. A passphrase opens a key slot: PBKDF2 derives the slot key,
//! which decrypts the anti-forensic stripes, which merge into a master key
//! that must then pass the same digest check.

pub mod types;

pub use types::{Luks1Header, Luks1Slot, Luks2BinaryHeader, Luks2Metadata};

use crate::kdf::HashSpec;
use crate::sector::SectorCipher;
use std::fmt;
use tracing::debug;
use types::{json_base64, json_u64, LUKS1_HEADER_LEN, LUKS2_BINARY_HEADER_LEN, LUKS_SECTOR};
use unseal_core::{validate_allocation_size, Error, ReadSeek, Realm, Result, Zone, MAX_METADATA_SIZE};
use unseal_pipeline::read_region;

/// LUKS2 header with its decoded JSON area
#[derive(Debug, Clone)]
pub struct Luks2Header {
    pub binary: Luks2BinaryHeader,
    pub metadata: Luks2Metadata,
}

/// A LUKS header of either version
#[derive(Debug, Clone)]
pub enum LuksHeader {
    V1(Luks1Header),
    V2(Box<Luks2Header>),
}

/// Everything needed to open one key slot with a passphrase
#[derive(Clone, PartialEq, Eq)]
pub struct KeyslotSpec {
    pub slot: usize,
    pub kdf_hash: HashSpec,
    pub iterations: u32,
    pub salt: Vec<u8>,
    /// Length of the derived slot key
    pub area_key_size: usize,
    /// Length of the master key stored in the slot
    pub master_key_size: usize,
    /// Key material offset in bytes from the volume start
    pub area_offset: u64,
    pub stripes: u32,
    pub af_hash: HashSpec,
    pub cipher: String,
    pub mode: String,
}

impl fmt::Debug for KeyslotSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyslotSpec")
            .field("slot", &self.slot)
            .field("kdf_hash", &self.kdf_hash)
            .field("iterations", &self.iterations)
            .field("area_offset", &self.area_offset)
            .field("stripes", &self.stripes)
            .field("cipher", &format_args!("{}-{}", self.cipher, self.mode))
            .finish()
    }
}

impl KeyslotSpec {
    /// Bytes of encrypted stripe material
    pub fn material_len(&self) -> usize {
        self.master_key_size.saturating_mul(self.stripes as usize)
    }
}

/// A key slot together with its encrypted stripe material
#[derive(Debug, Clone)]
pub struct KeyslotArea {
    pub spec: KeyslotSpec,
    pub material: Vec<u8>,
}

/// Master-key digest from the header
#[derive(Debug, Clone, PartialEq, Eq)]
struct MasterDigest {
    hash: HashSpec,
    iterations: u32,
    salt: Vec<u8>,
    digest: Vec<u8>,
}

impl MasterDigest {
    fn matches(&self, key: &[u8]) -> bool {
        self.hash.derive(key, &self.salt, self.iterations, self.digest.len()) == self.digest
    }
}

impl LuksHeader {
    /// Read the header of the volume in `zone`
    pub fn read(source: &mut dyn ReadSeek, zone: &Zone) -> Result<Self> {
        let head = read_region(source, zone.offset, LUKS2_BINARY_HEADER_LEN)?;
        if head.len() < LUKS1_HEADER_LEN {
            return Err(Error::invalid_header("LUKS header truncated"));
        }

        match u16::from_be_bytes([head[6], head[7]]) {
            1 => Ok(LuksHeader::V1(Luks1Header::parse(&head)?)),
            2 => {
                let binary = Luks2BinaryHeader::parse(&head)?;
                let json_len = validate_allocation_size(
                    binary.header_size - LUKS2_BINARY_HEADER_LEN as u64,
                    MAX_METADATA_SIZE,
                    Realm::Header,
                    "LUKS2 JSON area",
                )?;
                let area = read_region(source, zone.offset + LUKS2_BINARY_HEADER_LEN as u64, json_len)?;
                let metadata = Luks2Metadata::parse(&area)?;
                debug!(
                    "LUKS2 {} with {} keyslots, {} digests",
                    binary.uuid,
                    metadata.keyslots.len(),
                    metadata.digests.len()
                );
                Ok(LuksHeader::V2(Box::new(Luks2Header { binary, metadata })))
            }
            other => Err(Error::unsupported_scheme(format!("LUKS version {}", other))),
        }
    }

    pub fn version(&self) -> u16 {
        match self {
            LuksHeader::V1(_) => 1,
            LuksHeader::V2(_) => 2,
        }
    }

    pub fn uuid(&self) -> &str {
        match self {
            LuksHeader::V1(h) => &h.uuid,
            LuksHeader::V2(h) => &h.binary.uuid,
        }
    }

    /// Data cipher in `aes-xts-plain64` form
    pub fn cipher_spec(&self) -> String {
        match self {
            LuksHeader::V1(h) => format!("{}-{}", h.cipher_name, h.cipher_mode),
            LuksHeader::V2(h) => h
                .metadata
                .segments
                .values()
                .find_map(|s| s.encryption.clone())
                .unwrap_or_default(),
        }
    }

    /// Master key lengths the header accepts
    pub fn master_key_sizes(&self) -> Vec<usize> {
        match self {
            LuksHeader::V1(h) => vec![h.key_bytes as usize],
            LuksHeader::V2(h) => {
                let mut sizes: Vec<usize> = h
                    .metadata
                    .keyslots
                    .values()
                    .filter(|k| k.holds_master_key())
                    .map(|k| k.key_size)
                    .collect();
                sizes.sort_unstable();
                sizes.dedup();
                sizes
            }
        }
    }

    fn digests(&self) -> Vec<MasterDigest> {
        match self {
            LuksHeader::V1(h) => match HashSpec::parse(&h.hash_spec) {
                Ok(hash) => vec![MasterDigest {
                    hash,
                    iterations: h.mk_digest_iterations,
                    salt: h.mk_digest_salt.to_vec(),
                    digest: h.mk_digest.to_vec(),
                }],
                Err(e) => {
                    debug!("LUKS1 digest unusable: {}", e);
                    Vec::new()
                }
            },
            LuksHeader::V2(h) => h
                .metadata
                .digests
                .iter()
                .filter_map(|(id, d)| {
                    luks2_digest(d)
                        .map_err(|e| debug!("LUKS2 digest {} skipped: {}", id, e))
                        .ok()
                })
                .collect(),
        }
    }

    /// True when `key` is the volume master key
    pub fn verify_master_key(&self, key: &[u8]) -> bool {
        if !self.master_key_sizes().contains(&key.len()) {
            return false;
        }
        self.digests().iter().any(|d| d.matches(key))
    }

    /// Key slots that a passphrase can open
    ///
    /// Argon2 and reencryption slots are left out, as are unknown AF types.
    pub fn keyslots(&self) -> Vec<KeyslotSpec> {
        match self {
            LuksHeader::V1(h) => {
                let Ok(hash) = HashSpec::parse(&h.hash_spec) else {
                    return Vec::new();
                };
                h.slots
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| s.active)
                    .map(|(slot, s)| KeyslotSpec {
                        slot,
                        kdf_hash: hash,
                        iterations: s.iterations,
                        salt: s.salt.to_vec(),
                        area_key_size: h.key_bytes as usize,
                        master_key_size: h.key_bytes as usize,
                        area_offset: s.key_material_offset as u64 * LUKS_SECTOR,
                        stripes: s.stripes,
                        af_hash: hash,
                        cipher: h.cipher_name.clone(),
                        mode: h.cipher_mode.clone(),
                    })
                    .collect()
            }
            LuksHeader::V2(h) => h
                .metadata
                .keyslots
                .iter()
                .filter_map(|(id, k)| {
                    luks2_keyslot(id, k)
                        .map_err(|e| debug!("LUKS2 keyslot {} skipped: {}", id, e))
                        .ok()
                })
                .collect(),
        }
    }

    /// Read the stripe material of every usable key slot
    pub fn read_keyslot_areas(&self, source: &mut dyn ReadSeek, zone: &Zone) -> Result<Vec<KeyslotArea>> {
        let mut areas = Vec::new();
        for spec in self.keyslots() {
            let len = validate_allocation_size(
                spec.material_len() as u64,
                MAX_METADATA_SIZE,
                Realm::Header,
                "LUKS key material",
            )?;
            let padded = len.div_ceil(LUKS_SECTOR as usize) * LUKS_SECTOR as usize;
            let material = read_region(source, zone.offset + spec.area_offset, padded)?;
            if material.len() < padded {
                debug!("Key slot {} material truncated, skipping", spec.slot);
                continue;
            }
            areas.push(KeyslotArea { spec, material });
        }
        Ok(areas)
    }

    /// Open a key slot with a passphrase and return the master key
    pub fn unlock_keyslot(&self, area: &KeyslotArea, passphrase: &[u8]) -> Option<Vec<u8>> {
        let spec = &area.spec;
        let slot_key = spec
            .kdf_hash
            .derive(passphrase, &spec.salt, spec.iterations, spec.area_key_size);
        let cipher = SectorCipher::from_spec(&spec.cipher, &spec.mode, &slot_key).ok()?;

        let mut material = area.material.clone();
        cipher.decrypt_units(&mut material, LUKS_SECTOR as usize, 0);

        let master_key = af_merge(&material, spec.master_key_size, spec.stripes, spec.af_hash)?;
        self.verify_master_key(&master_key).then_some(master_key)
    }
}

fn luks2_digest(d: &types::Luks2Digest) -> Result<MasterDigest> {
    if d.digest_type != "pbkdf2" {
        return Err(Error::unsupported_scheme(format!("digest type {}", d.digest_type)));
    }
    Ok(MasterDigest {
        hash: HashSpec::parse(d.hash.as_deref().unwrap_or("sha256"))?,
        iterations: d.iterations.unwrap_or(1000),
        salt: json_base64(&d.salt, "digest salt")?,
        digest: json_base64(&d.digest, "digest")?,
    })
}

fn luks2_keyslot(id: &str, k: &types::Luks2Keyslot) -> Result<KeyslotSpec> {
    if !k.holds_master_key() {
        return Err(Error::unsupported_scheme(format!("keyslot type {}", k.slot_type)));
    }
    let missing = |field: &str| Error::invalid_header(format!("LUKS2 keyslot {} has no {}", id, field));
    let kdf = k.kdf.as_ref().ok_or_else(|| missing("kdf"))?;
    let af = k.af.as_ref().ok_or_else(|| missing("af"))?;
    if kdf.kdf_type != "pbkdf2" {
        return Err(Error::unsupported_scheme(format!("KDF {}", kdf.kdf_type)));
    }
    if af.af_type != "luks1" {
        return Err(Error::unsupported_scheme(format!("AF {}", af.af_type)));
    }
    let encryption = k.area.encryption.as_deref().ok_or_else(|| missing("area encryption"))?;
    let (cipher, mode) = SectorCipher::split_spec(encryption);
    let salt = kdf.salt.as_deref().ok_or_else(|| missing("kdf salt"))?;
    Ok(KeyslotSpec {
        slot: json_u64(id, "keyslot id")? as usize,
        kdf_hash: HashSpec::parse(kdf.hash.as_deref().unwrap_or("sha256"))?,
        iterations: kdf.iterations.unwrap_or(1000),
        salt: json_base64(salt, "keyslot salt")?,
        area_key_size: k.area.key_size.ok_or_else(|| missing("area key_size"))?,
        master_key_size: k.key_size,
        area_offset: json_u64(&k.area.offset, "area offset")?,
        stripes: af.stripes.ok_or_else(|| missing("af stripes"))?,
        af_hash: HashSpec::parse(af.hash.as_deref().ok_or_else(|| missing("af hash"))?)?,
        cipher: cipher.to_string(),
        mode: mode.to_string(),
    })
}

fn xor_into(acc: &mut [u8], other: &[u8]) {
    for (a, b) in acc.iter_mut().zip(other) {
        *a ^= b;
    }
}

fn diffuse(data: &[u8], hash: HashSpec) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for (i, chunk) in data.chunks(hash.output_len()).enumerate() {
        let digest = hash.digest(&[&(i as u32).to_be_bytes(), chunk]);
        out.extend_from_slice(&digest[..chunk.len()]);
    }
    out
}

/// Merge anti-forensic stripes back into the key
pub fn af_merge(material: &[u8], key_len: usize, stripes: u32, hash: HashSpec) -> Option<Vec<u8>> {
    let stripes = stripes as usize;
    if key_len == 0 || stripes == 0 || material.len() < key_len.checked_mul(stripes)? {
        return None;
    }

    let mut merged = vec![0u8; key_len];
    for stripe in material.chunks_exact(key_len).take(stripes - 1) {
        xor_into(&mut merged, stripe);
        merged = diffuse(&merged, hash);
    }
    xor_into(&mut merged, &material[(stripes - 1) * key_len..stripes * key_len]);
    Some(merged)
}

/// Split a key into anti-forensic stripes using `filler` for the random stripes
#[cfg(any(test, feature = "fixtures"))]
pub fn af_split(key: &[u8], stripes: u32, hash: HashSpec, mut filler: impl FnMut(usize) -> u8) -> Vec<u8> {
    let stripes = stripes as usize;
    let mut out = Vec::with_capacity(key.len() * stripes);
    let mut merged = vec![0u8; key.len()];
    for s in 0..stripes.saturating_sub(1) {
        let stripe: Vec<u8> = (0..key.len()).map(|i| filler(s * key.len() + i)).collect();
        xor_into(&mut merged, &stripe);
        merged = diffuse(&merged, hash);
        out.extend_from_slice(&stripe);
    }
    xor_into(&mut merged, key);
    out.extend_from_slice(&merged);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{luks1_volume, luks2_volume, LuksFixture};
    use std::io::Cursor;
    use unseal_core::DeclaredType;

    fn zone(len: usize) -> Zone {
        Zone::new(0, 0, len as u64, DeclaredType::Mbr(0x83), "Linux")
    }

    #[test]
    fn test_af_merge_inverts_split() {
        let key: Vec<u8> = (0..32u8).collect();
        let material = af_split(&key, 7, HashSpec::Sha256, |i| (i * 31 % 256) as u8);
        assert_eq!(material.len(), 32 * 7);
        assert_eq!(af_merge(&material, 32, 7, HashSpec::Sha256).unwrap(), key);
        assert!(af_merge(&material[..100], 32, 7, HashSpec::Sha256).is_none());
    }

    #[test]
    fn test_luks1_master_key_and_passphrase() {
        let fixture = LuksFixture::new("correct horse");
        let volume = luks1_volume(&fixture);
        let header = LuksHeader::read(&mut Cursor::new(volume.clone()), &zone(volume.len())).unwrap();

        assert_eq!(header.version(), 1);
        assert_eq!(header.cipher_spec(), "aes-xts-plain64");
        assert!(header.verify_master_key(&fixture.master_key));
        assert!(!header.verify_master_key(&[0u8; 64]));
        assert!(!header.verify_master_key(&fixture.master_key[..32]));

        let areas = header
            .read_keyslot_areas(&mut Cursor::new(volume.clone()), &zone(volume.len()))
            .unwrap();
        assert_eq!(areas.len(), 1);
        assert_eq!(areas[0].spec.slot, 0);
        assert_eq!(header.unlock_keyslot(&areas[0], b"correct horse").unwrap(), fixture.master_key);
        assert!(header.unlock_keyslot(&areas[0], b"wrong horse").is_none());
    }

    #[test]
    fn test_luks2_json_metadata() {
        let fixture = LuksFixture::new("battery staple");
        let volume = luks2_volume(&fixture);
        let header = LuksHeader::read(&mut Cursor::new(volume.clone()), &zone(volume.len())).unwrap();

        assert_eq!(header.version(), 2);
        assert_eq!(header.cipher_spec(), "aes-xts-plain64");
        assert_eq!(header.master_key_sizes(), vec![64]);
        assert!(header.verify_master_key(&fixture.master_key));

        let areas = header
            .read_keyslot_areas(&mut Cursor::new(volume.clone()), &zone(volume.len()))
            .unwrap();
        assert_eq!(areas.len(), 1);
        assert_eq!(header.unlock_keyslot(&areas[0], b"battery staple").unwrap(), fixture.master_key);
    }

    #[test]
    fn test_luks2_argon2_slot_is_skipped() {
        let fixture = LuksFixture::new("pw").with_argon2_slot();
        let volume = luks2_volume(&fixture);
        let header = LuksHeader::read(&mut Cursor::new(volume.clone()), &zone(volume.len())).unwrap();
        assert_eq!(header.keyslots().len(), 1);
        assert!(header.verify_master_key(&fixture.master_key));
    }

    #[test]
    fn test_luks2_reencrypt_slot_is_skipped() {
        let fixture = LuksFixture::new("mid reencrypt").with_reencrypt_slot();
        let volume = luks2_volume(&fixture);
        let header = LuksHeader::read(&mut Cursor::new(volume.clone()), &zone(volume.len())).unwrap();

        assert_eq!(header.master_key_sizes(), vec![64]);
        assert!(header.verify_master_key(&fixture.master_key));
        let areas = header
            .read_keyslot_areas(&mut Cursor::new(volume.clone()), &zone(volume.len()))
            .unwrap();
        assert_eq!(areas.len(), 1);
        assert_eq!(areas[0].spec.slot, 0);
        assert_eq!(header.unlock_keyslot(&areas[0], b"mid reencrypt").unwrap(), fixture.master_key);
    }

    #[test]
    fn test_bad_version() {
        let mut head = vec![0u8; 4096];
        head[..6].copy_from_slice(types::LUKS_MAGIC);
        head[7] = 3;
        let err = LuksHeader::read(&mut Cursor::new(head), &zone(4096)).unwrap_err();
        assert!(matches!(err, Error::UnsupportedScheme(_)));
    }
}
