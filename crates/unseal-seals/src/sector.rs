//! Sector ciphers used by full-disk encryption schemes
//!
//! AES-XTS and AES-CBC over fixed-size data units, with the IV conventions
//! of dm-crypt (`plain`, `plain64`, `essiv:sha256`) and BitLocker (byte offset).

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes128, Aes256};
use sha2::{Digest, Sha256};
use unseal_core::{Error, Result};
use xts_mode::Xts128;

/// AES block size in bytes
pub const AES_BLOCK: usize = 16;

/// AES with a runtime-selected key size
#[derive(Clone)]
pub enum AesKey {
    Aes128(Aes128),
    Aes256(Aes256),
}

impl AesKey {
    /// Build from a 16 or 32 byte key
    pub fn new(key: &[u8]) -> Result<Self> {
        match key.len() {
            16 => Ok(AesKey::Aes128(Aes128::new(GenericArray::from_slice(key)))),
            32 => Ok(AesKey::Aes256(Aes256::new(GenericArray::from_slice(key)))),
            n => Err(Error::crypto(format!("unsupported AES key length {}", n))),
        }
    }

    pub fn encrypt_block(&self, block: &mut [u8; AES_BLOCK]) {
        match self {
            AesKey::Aes128(c) => c.encrypt_block(GenericArray::from_mut_slice(block)),
            AesKey::Aes256(c) => c.encrypt_block(GenericArray::from_mut_slice(block)),
        }
    }

    pub fn decrypt_block(&self, block: &mut [u8; AES_BLOCK]) {
        match self {
            AesKey::Aes128(c) => c.decrypt_block(GenericArray::from_mut_slice(block)),
            AesKey::Aes256(c) => c.decrypt_block(GenericArray::from_mut_slice(block)),
        }
    }

    /// Encrypt one block and return it
    pub fn encrypt_copy(&self, block: [u8; AES_BLOCK]) -> [u8; AES_BLOCK] {
        let mut out = block;
        self.encrypt_block(&mut out);
        out
    }
}

/// How a CBC initialisation vector is derived from the data unit position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IvScheme {
    /// Little-endian sector number (`plain`, `plain64`)
    Plain64,
    /// Sector number encrypted with SHA-256 of the key (`essiv:sha256`)
    EssivSha256,
    /// Byte offset encrypted with the volume key (BitLocker)
    EncryptedOffset,
}

enum Engine {
    Xts128(Box<Xts128<Aes128>>),
    Xts256(Box<Xts128<Aes256>>),
    Cbc { key: AesKey, iv: IvScheme, essiv: Option<AesKey> },
}

/// A sector cipher bound to one key
pub struct SectorCipher {
    engine: Engine,
}

impl SectorCipher {
    /// AES-XTS with a 32 (AES-128) or 64 (AES-256) byte key
    pub fn xts(key: &[u8]) -> Result<Self> {
        let half = key.len() / 2;
        let engine = match key.len() {
            32 => Engine::Xts128(Box::new(Xts128::new(
                Aes128::new(GenericArray::from_slice(&key[..half])),
                Aes128::new(GenericArray::from_slice(&key[half..])),
            ))),
            64 => Engine::Xts256(Box::new(Xts128::new(
                Aes256::new(GenericArray::from_slice(&key[..half])),
                Aes256::new(GenericArray::from_slice(&key[half..])),
            ))),
            n => return Err(Error::crypto(format!("unsupported AES-XTS key length {}", n))),
        };
        Ok(Self { engine })
    }

    /// AES-CBC with a 16 or 32 byte key
    pub fn cbc(key: &[u8], iv: IvScheme) -> Result<Self> {
        let essiv = match iv {
            IvScheme::EssivSha256 => Some(AesKey::new(&Sha256::digest(key))?),
            _ => None,
        };
        Ok(Self {
            engine: Engine::Cbc {
                key: AesKey::new(key)?,
                iv,
                essiv,
            },
        })
    }

    /// Build from a dm-crypt style cipher spec such as `aes` + `xts-plain64`
    pub fn from_spec(cipher: &str, mode: &str, key: &[u8]) -> Result<Self> {
        if !cipher.eq_ignore_ascii_case("aes") {
            return Err(Error::unsupported_scheme(format!("cipher {} not supported", cipher)));
        }
        match mode.to_ascii_lowercase().as_str() {
            "xts-plain64" | "xts-plain" => Self::xts(key),
            "cbc-plain64" | "cbc-plain" => Self::cbc(key, IvScheme::Plain64),
            "cbc-essiv:sha256" => Self::cbc(key, IvScheme::EssivSha256),
            other => Err(Error::unsupported_scheme(format!("cipher mode {} not supported", other))),
        }
    }

    /// Split a `aes-xts-plain64` style spec into cipher and mode
    pub fn split_spec(spec: &str) -> (&str, &str) {
        spec.split_once('-').unwrap_or((spec, ""))
    }

    fn cbc_iv(key: &AesKey, iv: IvScheme, essiv: Option<&AesKey>, position: u64) -> [u8; AES_BLOCK] {
        let mut block = [0u8; AES_BLOCK];
        block[..8].copy_from_slice(&position.to_le_bytes());
        match iv {
            IvScheme::Plain64 => block,
            IvScheme::EssivSha256 => essiv.map(|e| e.encrypt_copy(block)).unwrap_or(block),
            IvScheme::EncryptedOffset => key.encrypt_copy(block),
        }
    }

    /// Decrypt one data unit in place
    ///
    /// `position` is the sector number for XTS and dm-crypt IVs, and the
    /// byte offset for [`IvScheme::EncryptedOffset`].
    pub fn decrypt_unit(&self, data: &mut [u8], position: u64) {
        match &self.engine {
            Engine::Xts128(xts) => xts.decrypt_sector(data, (position as u128).to_le_bytes()),
            Engine::Xts256(xts) => xts.decrypt_sector(data, (position as u128).to_le_bytes()),
            Engine::Cbc { key, iv, essiv } => {
                let mut prev = Self::cbc_iv(key, *iv, essiv.as_ref(), position);
                for chunk in data.chunks_exact_mut(AES_BLOCK) {
                    let mut block = [0u8; AES_BLOCK];
                    block.copy_from_slice(chunk);
                    let saved = block;
                    key.decrypt_block(&mut block);
                    for (out, (b, p)) in chunk.iter_mut().zip(block.iter().zip(prev.iter())) {
                        *out = b ^ p;
                    }
                    prev = saved;
                }
            }
        }
    }

    /// Encrypt one data unit in place
    pub fn encrypt_unit(&self, data: &mut [u8], position: u64) {
        match &self.engine {
            Engine::Xts128(xts) => xts.encrypt_sector(data, (position as u128).to_le_bytes()),
            Engine::Xts256(xts) => xts.encrypt_sector(data, (position as u128).to_le_bytes()),
            Engine::Cbc { key, iv, essiv } => {
                let mut prev = Self::cbc_iv(key, *iv, essiv.as_ref(), position);
                for chunk in data.chunks_exact_mut(AES_BLOCK) {
                    let mut block = [0u8; AES_BLOCK];
                    for (b, (c, p)) in block.iter_mut().zip(chunk.iter().zip(prev.iter())) {
                        *b = c ^ p;
                    }
                    key.encrypt_block(&mut block);
                    chunk.copy_from_slice(&block);
                    prev = block;
                }
            }
        }
    }

    /// Decrypt consecutive data units whose positions advance by one
    pub fn decrypt_units(&self, data: &mut [u8], unit_size: usize, first_position: u64) {
        for (i, unit) in data.chunks_mut(unit_size).enumerate() {
            self.decrypt_unit(unit, first_position + i as u64);
        }
    }

    /// Encrypt consecutive data units whose positions advance by one
    pub fn encrypt_units(&self, data: &mut [u8], unit_size: usize, first_position: u64) {
        for (i, unit) in data.chunks_mut(unit_size).enumerate() {
            self.encrypt_unit(unit, first_position + i as u64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        (0..1024u32).map(|i| (i * 7 % 251) as u8).collect()
    }

    #[test]
    fn test_xts_units_depend_on_position() {
        let cipher = SectorCipher::xts(&[0x11; 64]).unwrap();
        let plain = sample();
        let mut a = plain.clone();
        cipher.encrypt_units(&mut a, 512, 0);
        let mut b = plain.clone();
        cipher.encrypt_units(&mut b, 512, 1);
        assert_ne!(a, b);
        assert_ne!(&a[..512], &a[512..]);

        cipher.decrypt_units(&mut a, 512, 0);
        assert_eq!(a, plain);
    }

    #[test]
    fn test_cbc_iv_schemes() {
        let plain = sample();
        for iv in [IvScheme::Plain64, IvScheme::EssivSha256, IvScheme::EncryptedOffset] {
            let cipher = SectorCipher::cbc(&[0x42; 16], iv).unwrap();
            let mut data = plain.clone();
            cipher.encrypt_unit(&mut data[..512], 9);
            assert_ne!(&data[..512], &plain[..512]);
            cipher.decrypt_unit(&mut data[..512], 9);
            assert_eq!(data, plain);
        }
    }

    #[test]
    fn test_cbc_plain64_first_block() {
        // First block of CBC with a plain64 IV is AES(key, P0 ^ IV)
        let key = [0x24u8; 32];
        let cipher = SectorCipher::cbc(&key, IvScheme::Plain64).unwrap();
        let mut data = [0u8; 32];
        cipher.encrypt_unit(&mut data, 3);

        let mut expected = [0u8; 16];
        expected[0] = 3;
        AesKey::new(&key).unwrap().encrypt_block(&mut expected);
        assert_eq!(&data[..16], &expected);
    }

    #[test]
    fn test_from_spec() {
        assert!(SectorCipher::from_spec("aes", "xts-plain64", &[0; 64]).is_ok());
        assert!(SectorCipher::from_spec("aes", "cbc-essiv:sha256", &[0; 32]).is_ok());
        assert!(SectorCipher::from_spec("twofish", "xts-plain64", &[0; 64]).is_err());
        assert!(SectorCipher::from_spec("aes", "lrw-benbi", &[0; 32]).is_err());
        assert!(SectorCipher::xts(&[0; 48]).is_err());
        assert_eq!(SectorCipher::split_spec("aes-xts-plain64"), ("aes", "xts-plain64"));
    }
}
