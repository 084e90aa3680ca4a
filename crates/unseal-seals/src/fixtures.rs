//! Volume builders for tests
//!
//! Every builder produces a complete volume image with real metadata and
//! real encryption, using small KDF iteration counts.

use crate::bitlocker::{ccm_wrap, EncryptionMethod};
use crate::kdf::HashSpec;
use crate::luks::af_split;
use crate::sector::{IvScheme, SectorCipher};
use crate::veracrypt::VeraCryptKdf;
use crate::volume::ExtVariant;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha256};

const SECTOR: usize = 512;

/// Deterministic bytes that look random
pub fn pseudo_random(seed: &[u8], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len + 32);
    let mut counter = 0u32;
    while out.len() < len {
        out.extend_from_slice(&Sha256::new().chain_update(seed).chain_update(counter.to_le_bytes()).finalize());
        counter += 1;
    }
    out.truncate(len);
    out
}

fn put(buf: &mut [u8], offset: usize, bytes: &[u8]) {
    buf[offset..offset + bytes.len()].copy_from_slice(bytes);
}

/// NTFS boot sector
pub fn ntfs_boot_sector() -> Vec<u8> {
    let mut sector = vec![0u8; SECTOR];
    put(&mut sector, 0, &[0xEB, 0x52, 0x90]);
    put(&mut sector, 3, b"NTFS    ");
    put(&mut sector, 0x0B, &512u16.to_le_bytes());
    sector[0x0D] = 8;
    sector[510] = 0x55;
    sector[511] = 0xAA;
    sector
}

/// Zero-filled NTFS volume with a boot sector
pub fn ntfs_volume(len: usize) -> Vec<u8> {
    let mut volume = vec![0u8; len];
    put(&mut volume, 0, &ntfs_boot_sector());
    volume
}

/// Zero-filled ext volume with a superblock for `variant`
pub fn ext_volume(len: usize, variant: ExtVariant) -> Vec<u8> {
    let mut volume = vec![0u8; len.max(2048)];
    let sb = 1024;
    put(&mut volume, sb + 0x38, &0xEF53u16.to_le_bytes());
    let (compat, incompat) = match variant {
        ExtVariant::Ext2 => (0u32, 0u32),
        ExtVariant::Ext3 => (0x0004, 0x0002),
        ExtVariant::Ext4 => (0x0004, 0x0002 | 0x0040 | 0x0200),
    };
    put(&mut volume, sb + 0x5C, &compat.to_le_bytes());
    put(&mut volume, sb + 0x60, &incompat.to_le_bytes());
    volume
}

/// Zero-filled LVM2 physical volume with its label in `label_sector`
pub fn lvm_volume(len: usize, label_sector: usize) -> Vec<u8> {
    let mut volume = vec![0u8; len.max(4096)];
    let at = label_sector * 512;
    put(&mut volume, at, b"LABELONE");
    put(&mut volume, at + 8, &(label_sector as u64).to_le_bytes());
    put(&mut volume, at + 20, &32u32.to_le_bytes());
    put(&mut volume, at + 24, b"LVM2 001");
    put(&mut volume, at + 32, b"Xq3bWc9aLmTz0PkR7vNe2Su8GhYd4FjK");
    volume
}

fn datum(entry_type: u16, datum_type: u16, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + body.len());
    out.extend_from_slice(&((8 + body.len()) as u16).to_le_bytes());
    out.extend_from_slice(&entry_type.to_le_bytes());
    out.extend_from_slice(&datum_type.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(body);
    out
}

fn key_datum(entry_type: u16, algorithm: u16, key: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&algorithm.to_le_bytes());
    body.extend_from_slice(&0u16.to_le_bytes());
    body.extend_from_slice(key);
    datum(entry_type, 0x0001, &body)
}

fn ccm_datum(entry_type: u16, key: &[u8], nonce: [u8; 12], payload: &[u8]) -> Vec<u8> {
    let blob = match ccm_wrap(key, nonce, payload) {
        Ok(blob) => blob,
        Err(e) => panic!("fixture CCM wrap failed: {}", e),
    };
    let mut body = Vec::new();
    body.extend_from_slice(&blob.nonce);
    body.extend_from_slice(&blob.mac);
    body.extend_from_slice(&blob.payload);
    datum(entry_type, 0x0005, &body)
}

/// BitLocker (Windows 7 layout) volume builder
#[derive(Debug, Clone)]
pub struct BitLockerFixture {
    pub method: EncryptionMethod,
    pub fvek: Vec<u8>,
    pub vmk: [u8; 32],
    pub clear_key: Option<[u8; 32]>,
}

impl BitLockerFixture {
    /// Offsets of the three FVE information block copies
    pub const METADATA_OFFSETS: [u64; 3] = [0x2000, 0x3000, 0x4000];
    /// Offset of the relocated boot sector
    pub const BOOT_BACKUP_OFFSET: u64 = 0x6000;
    /// Size of the built volume
    pub const VOLUME_LEN: usize = 64 * 1024;

    pub fn new(method: EncryptionMethod) -> Self {
        let mut vmk = [0u8; 32];
        vmk.copy_from_slice(&pseudo_random(b"bitlocker vmk", 32));
        Self {
            method,
            fvek: pseudo_random(b"bitlocker fvek", method.key_len()),
            vmk,
            clear_key: None,
        }
    }

    /// Suspend protection: store `key` in the clear next to the wrapped VMK
    pub fn with_clear_key(mut self, key: [u8; 32]) -> Self {
        self.clear_key = Some(key);
        self
    }

    fn vmk_datum(&self) -> Vec<u8> {
        let vmk_payload = key_datum(0, 0x2003, &self.vmk);
        let (protection, nested) = match self.clear_key {
            Some(clear) => {
                let mut nested = key_datum(0, 0x2003, &clear);
                nested.extend(ccm_datum(0, &clear, [0x0C; 12], &vmk_payload));
                (0x0000u16, nested)
            }
            None => {
                let stretched = pseudo_random(b"stretched password", 32);
                (0x2000u16, ccm_datum(0, &stretched, [0x0D; 12], &vmk_payload))
            }
        };

        let mut body = Vec::new();
        body.extend_from_slice(&pseudo_random(b"vmk guid", 16));
        body.extend_from_slice(&0x01D0_0000_0000_0000u64.to_le_bytes());
        body.extend_from_slice(&0u16.to_le_bytes());
        body.extend_from_slice(&protection.to_le_bytes());
        body.extend(nested);
        datum(0x0002, 0x0008, &body)
    }

    fn information_block(&self) -> Vec<u8> {
        let mut datums = self.vmk_datum();
        let fvek_payload = key_datum(0, self.method.code(), &self.fvek);
        datums.extend(ccm_datum(0x0003, &self.vmk, [0x0F; 12], &fvek_payload));
        let mut location = Vec::new();
        location.extend_from_slice(&Self::BOOT_BACKUP_OFFSET.to_le_bytes());
        location.extend_from_slice(&0x2000u64.to_le_bytes());
        datums.extend(datum(0x000F, 0x000F, &location));

        let dataset_size = 0x30 + datums.len();
        let block_len = 0x40 + dataset_size;
        let mut block = vec![0u8; block_len];
        put(&mut block, 0, b"-FVE-FS-");
        put(&mut block, 0x08, &((block_len / 16) as u16).to_le_bytes());
        put(&mut block, 0x0A, &2u16.to_le_bytes());
        put(&mut block, 0x1C, &16u32.to_le_bytes());
        put(&mut block, 0x38, &Self::BOOT_BACKUP_OFFSET.to_le_bytes());

        let ds = 0x40;
        put(&mut block, ds, &(dataset_size as u32).to_le_bytes());
        put(&mut block, ds + 0x04, &1u32.to_le_bytes());
        put(&mut block, ds + 0x08, &0x30u32.to_le_bytes());
        put(&mut block, ds + 0x0C, &(dataset_size as u32).to_le_bytes());
        put(&mut block, ds + 0x10, &pseudo_random(b"dataset guid", 16));
        put(&mut block, ds + 0x24, &self.method.code().to_le_bytes());
        put(&mut block, ds + 0x30, &datums);
        block
    }

    fn encrypted_boot_sector(&self) -> Vec<u8> {
        let mut sector = ntfs_boot_sector();
        let cipher = if self.method.is_xts() {
            SectorCipher::xts(&self.fvek).map(|c| (c, Self::BOOT_BACKUP_OFFSET / SECTOR as u64))
        } else if self.method.has_diffuser() {
            return pseudo_random(b"diffused boot sector", SECTOR);
        } else {
            SectorCipher::cbc(&self.fvek, IvScheme::EncryptedOffset).map(|c| (c, Self::BOOT_BACKUP_OFFSET))
        };
        match cipher {
            Ok((cipher, position)) => cipher.encrypt_unit(&mut sector, position),
            Err(e) => panic!("fixture cipher failed: {}", e),
        }
        sector
    }

    /// Build the volume
    pub fn build(&self) -> Vec<u8> {
        let mut volume = pseudo_random(b"bitlocker data", Self::VOLUME_LEN);

        let mut boot = vec![0u8; SECTOR];
        put(&mut boot, 0, &[0xEB, 0x58, 0x90]);
        put(&mut boot, 3, b"-FVE-FS-");
        put(&mut boot, 0x0B, &512u16.to_le_bytes());
        boot[0x0D] = 8;
        for (i, offset) in Self::METADATA_OFFSETS.iter().enumerate() {
            put(&mut boot, 0xB0 + i * 8, &offset.to_le_bytes());
        }
        boot[510] = 0x55;
        boot[511] = 0xAA;
        put(&mut volume, 0, &boot);

        let block = self.information_block();
        for offset in Self::METADATA_OFFSETS {
            put(&mut volume, offset as usize, &block);
        }
        put(&mut volume, Self::BOOT_BACKUP_OFFSET as usize, &self.encrypted_boot_sector());
        volume
    }
}

/// LUKS volume builder, shared by the v1 and v2 layouts
#[derive(Debug, Clone)]
pub struct LuksFixture {
    pub passphrase: String,
    pub master_key: Vec<u8>,
    pub iterations: u32,
    pub stripes: u32,
    pub argon2_slot: bool,
    pub reencrypt_slot: bool,
}

impl LuksFixture {
    pub fn new(passphrase: &str) -> Self {
        Self {
            passphrase: passphrase.to_string(),
            master_key: pseudo_random(b"luks master key", 64),
            iterations: 8,
            stripes: 16,
            argon2_slot: false,
            reencrypt_slot: false,
        }
    }

    /// Add a second (argon2id) key slot next to the pbkdf2 one
    pub fn with_argon2_slot(mut self) -> Self {
        self.argon2_slot = true;
        self
    }

    /// Add an online-reencryption slot, as left by `cryptsetup reencrypt`
    pub fn with_reencrypt_slot(mut self) -> Self {
        self.reencrypt_slot = true;
        self
    }

    fn digest_salt(&self) -> Vec<u8> {
        pseudo_random(b"luks digest salt", 32)
    }

    fn slot_salt(&self) -> Vec<u8> {
        pseudo_random(b"luks slot salt", 32)
    }

    /// Encrypted stripe material for the passphrase slot
    fn key_material(&self) -> Vec<u8> {
        let mut material = af_split(&self.master_key, self.stripes, HashSpec::Sha256, |i| {
            (i.wrapping_mul(131) ^ 0x5A) as u8
        });
        material.resize(material.len().div_ceil(SECTOR) * SECTOR, 0);
        let slot_key = HashSpec::Sha256.derive(
            self.passphrase.as_bytes(),
            &self.slot_salt(),
            self.iterations,
            self.master_key.len(),
        );
        match SectorCipher::from_spec("aes", "xts-plain64", &slot_key) {
            Ok(cipher) => cipher.encrypt_units(&mut material, SECTOR, 0),
            Err(e) => panic!("fixture cipher failed: {}", e),
        }
        material
    }
}

fn put_str(buf: &mut [u8], offset: usize, text: &str) {
    put(buf, offset, text.as_bytes());
}

/// LUKS1 volume: key material at sector 8, payload at sector 64
pub fn luks1_volume(fixture: &LuksFixture) -> Vec<u8> {
    let mut volume = vec![0u8; 64 * 1024];
    put(&mut volume, 0, b"LUKS\xba\xbe");
    put(&mut volume, 6, &1u16.to_be_bytes());
    put_str(&mut volume, 8, "aes");
    put_str(&mut volume, 40, "xts-plain64");
    put_str(&mut volume, 72, "sha256");
    put(&mut volume, 104, &64u32.to_be_bytes());
    put(&mut volume, 108, &(fixture.master_key.len() as u32).to_be_bytes());
    let digest = HashSpec::Sha256.derive(&fixture.master_key, &fixture.digest_salt(), fixture.iterations, 20);
    put(&mut volume, 112, &digest);
    put(&mut volume, 132, &fixture.digest_salt());
    put(&mut volume, 164, &fixture.iterations.to_be_bytes());
    put_str(&mut volume, 168, "6c1c1ef4-6b0c-4b2f-9d3c-0a3b5e7f9a11");

    for slot in 0..8usize {
        let base = 208 + slot * 48;
        if slot == 0 {
            put(&mut volume, base, &0x00AC_71F3u32.to_be_bytes());
            put(&mut volume, base + 4, &fixture.iterations.to_be_bytes());
            put(&mut volume, base + 8, &fixture.slot_salt());
            put(&mut volume, base + 40, &8u32.to_be_bytes());
            put(&mut volume, base + 44, &fixture.stripes.to_be_bytes());
        } else {
            put(&mut volume, base, &0x0000_DEADu32.to_be_bytes());
            put(&mut volume, base + 40, &(8 + slot as u32 * 8).to_be_bytes());
            put(&mut volume, base + 44, &4000u32.to_be_bytes());
        }
    }

    put(&mut volume, 8 * SECTOR, &fixture.key_material());
    volume
}

/// LUKS2 volume: 16 KiB header, key material at 32 KiB, data at 48 KiB
pub fn luks2_volume(fixture: &LuksFixture) -> Vec<u8> {
    const HEADER_SIZE: u64 = 16 * 1024;
    const AREA_OFFSET: u64 = 32 * 1024;

    let material = fixture.key_material();
    let digest = HashSpec::Sha256.derive(&fixture.master_key, &fixture.digest_salt(), fixture.iterations, 32);

    let mut keyslots = serde_json::json!({
        "0": {
            "type": "luks2",
            "key_size": fixture.master_key.len(),
            "area": {
                "type": "raw",
                "offset": AREA_OFFSET.to_string(),
                "size": material.len().to_string(),
                "encryption": "aes-xts-plain64",
                "key_size": fixture.master_key.len()
            },
            "kdf": {
                "type": "pbkdf2",
                "hash": "sha256",
                "iterations": fixture.iterations,
                "salt": STANDARD.encode(fixture.slot_salt())
            },
            "af": { "type": "luks1", "stripes": fixture.stripes, "hash": "sha256" }
        }
    });
    if fixture.argon2_slot {
        keyslots["1"] = serde_json::json!({
            "type": "luks2",
            "key_size": fixture.master_key.len(),
            "area": {
                "type": "raw",
                "offset": (AREA_OFFSET + 4096).to_string(),
                "size": material.len().to_string(),
                "encryption": "aes-xts-plain64",
                "key_size": fixture.master_key.len()
            },
            "kdf": {
                "type": "argon2id",
                "time": 4,
                "memory": 1048576,
                "cpus": 4,
                "salt": STANDARD.encode(pseudo_random(b"argon2 salt", 32))
            },
            "af": { "type": "luks1", "stripes": fixture.stripes, "hash": "sha256" }
        });
    }
    if fixture.reencrypt_slot {
        keyslots["2"] = serde_json::json!({
            "type": "reencrypt",
            "key_size": 1,
            "mode": "encrypt",
            "direction": "forward",
            "area": {
                "type": "datashift-checksum",
                "offset": (AREA_OFFSET + 8192).to_string(),
                "size": "4096",
                "hash": "sha256",
                "sector_size": 4096,
                "shift_size": "33554432"
            },
            "kdf": { "type": "none" },
            "af": { "type": "none" }
        });
    }
    let metadata = serde_json::json!({
        "keyslots": keyslots,
        "segments": {
            "0": {
                "type": "crypt",
                "offset": "49152",
                "size": "dynamic",
                "iv_tweak": "0",
                "encryption": "aes-xts-plain64",
                "sector_size": 512
            }
        },
        "digests": {
            "0": {
                "type": "pbkdf2",
                "keyslots": ["0"],
                "segments": ["0"],
                "hash": "sha256",
                "iterations": fixture.iterations,
                "salt": STANDARD.encode(fixture.digest_salt()),
                "digest": STANDARD.encode(&digest)
            }
        },
        "config": { "json_size": "12288", "keyslots_size": "16384" }
    });
    let json = metadata.to_string();

    let mut volume = vec![0u8; 64 * 1024];
    put(&mut volume, 0, b"LUKS\xba\xbe");
    put(&mut volume, 6, &2u16.to_be_bytes());
    put(&mut volume, 8, &HEADER_SIZE.to_be_bytes());
    put(&mut volume, 16, &1u64.to_be_bytes());
    put_str(&mut volume, 72, "sha256");
    put_str(&mut volume, 168, "0f6e9a54-3c1d-4f8e-b2a7-5d4c3b2a1f00");
    put(&mut volume, 4096, json.as_bytes());
    put(&mut volume, AREA_OFFSET as usize, &material);
    volume
}

/// VeraCrypt (non-system) volume builder
#[derive(Debug, Clone)]
pub struct VeraCryptFixture {
    pub passphrase: String,
    pub master_key: Vec<u8>,
    pub salt: [u8; 64],
}

impl VeraCryptFixture {
    /// Size of the built volume
    pub const VOLUME_LEN: usize = 256 * 1024;
    const DATA_OFFSET: u64 = 131_072;

    pub fn new(passphrase: &str) -> Self {
        let mut salt = [0u8; 64];
        salt.copy_from_slice(&pseudo_random(b"veracrypt salt", 64));
        Self {
            passphrase: passphrase.to_string(),
            master_key: pseudo_random(b"veracrypt master key", 64),
            salt,
        }
    }

    /// Cheap derivations standing in for the real iteration counts
    pub fn kdfs(&self) -> Vec<VeraCryptKdf> {
        vec![
            VeraCryptKdf {
                hash: HashSpec::Sha512,
                iterations: 3,
            },
            VeraCryptKdf {
                hash: HashSpec::Sha256,
                iterations: 3,
            },
        ]
    }

    /// Header key derived from the passphrase
    pub fn header_key(&self) -> Vec<u8> {
        let kdf = self.kdfs()[0];
        kdf.hash.derive(self.passphrase.as_bytes(), &self.salt, kdf.iterations, 64)
    }

    fn plain_header(&self) -> Vec<u8> {
        let mut header = vec![0u8; SECTOR];
        put(&mut header, 0, &self.salt);
        put(&mut header, 64, b"VERA");
        put(&mut header, 68, &5u16.to_be_bytes());
        put(&mut header, 70, &0x010Bu16.to_be_bytes());
        let data_size = Self::VOLUME_LEN as u64 - 2 * Self::DATA_OFFSET;
        put(&mut header, 100, &data_size.to_be_bytes());
        put(&mut header, 108, &Self::DATA_OFFSET.to_be_bytes());
        put(&mut header, 116, &data_size.to_be_bytes());
        put(&mut header, 128, &512u32.to_be_bytes());
        put(&mut header, 256, &self.master_key);
        let keys_crc = crc32fast::hash(&header[256..512]);
        put(&mut header, 72, &keys_crc.to_be_bytes());
        let header_crc = crc32fast::hash(&header[64..252]);
        put(&mut header, 252, &header_crc.to_be_bytes());
        header
    }

    /// Build the volume: header, then an encrypted NTFS boot sector at 128 KiB
    pub fn volume(&self) -> Vec<u8> {
        let mut volume = vec![0u8; Self::VOLUME_LEN];

        let mut header = self.plain_header();
        let header_cipher = SectorCipher::xts(&self.header_key());
        let data_cipher = SectorCipher::xts(&self.master_key);
        let (header_cipher, data_cipher) = match (header_cipher, data_cipher) {
            (Ok(h), Ok(d)) => (h, d),
            _ => panic!("fixture XTS keys must be 64 bytes"),
        };
        header_cipher.encrypt_unit(&mut header[64..], 0);
        put(&mut volume, 0, &header);

        let mut data = ntfs_volume(4096);
        data_cipher.encrypt_units(&mut data, SECTOR, Self::DATA_OFFSET / SECTOR as u64);
        put(&mut volume, Self::DATA_OFFSET as usize, &data);
        volume
    }
}
