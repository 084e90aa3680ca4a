//! Hash selection and PBKDF2 key derivation

use pbkdf2::pbkdf2_hmac;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use unseal_core::{Error, Result};

/// Hash functions accepted in volume headers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashSpec {
    Sha1,
    Sha256,
    Sha512,
}

impl HashSpec {
    /// Parse a header hash name (`sha1`, `sha256`, `sha512`, case-insensitive)
    pub fn parse(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "sha1" => Ok(HashSpec::Sha1),
            "sha256" => Ok(HashSpec::Sha256),
            "sha512" => Ok(HashSpec::Sha512),
            other => Err(Error::unsupported_scheme(format!("hash {} not supported", other))),
        }
    }

    /// Digest length in bytes
    pub fn output_len(&self) -> usize {
        match self {
            HashSpec::Sha1 => 20,
            HashSpec::Sha256 => 32,
            HashSpec::Sha512 => 64,
        }
    }

    /// PBKDF2-HMAC filling `out`
    pub fn pbkdf2(&self, password: &[u8], salt: &[u8], rounds: u32, out: &mut [u8]) {
        match self {
            HashSpec::Sha1 => pbkdf2_hmac::<Sha1>(password, salt, rounds, out),
            HashSpec::Sha256 => pbkdf2_hmac::<Sha256>(password, salt, rounds, out),
            HashSpec::Sha512 => pbkdf2_hmac::<Sha512>(password, salt, rounds, out),
        }
    }

    /// PBKDF2-HMAC returning `len` bytes
    pub fn derive(&self, password: &[u8], salt: &[u8], rounds: u32, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        self.pbkdf2(password, salt, rounds, &mut out);
        out
    }

    /// Hash the concatenation of `parts`
    pub fn digest(&self, parts: &[&[u8]]) -> Vec<u8> {
        fn run<D: Digest>(parts: &[&[u8]]) -> Vec<u8> {
            let mut hasher = D::new();
            for part in parts {
                hasher.update(part);
            }
            hasher.finalize().to_vec()
        }
        match self {
            HashSpec::Sha1 => run::<Sha1>(parts),
            HashSpec::Sha256 => run::<Sha256>(parts),
            HashSpec::Sha512 => run::<Sha512>(parts),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hash_names() {
        assert_eq!(HashSpec::parse("SHA256").unwrap(), HashSpec::Sha256);
        assert_eq!(HashSpec::parse("sha1").unwrap().output_len(), 20);
        assert!(HashSpec::parse("ripemd160").is_err());
    }

    #[test]
    fn test_pbkdf2_sha1_rfc6070() {
        // RFC 6070 test vector: "password" / "salt", 2 iterations
        let out = HashSpec::Sha1.derive(b"password", b"salt", 2, 20);
        assert_eq!(hex::encode(out), "ea6c014dc72d6f8ccd1ed92ace1d41f0d8de8957");
    }

    #[test]
    fn test_digest_concatenates() {
        let joined = HashSpec::Sha256.digest(&[b"ab", b"c"]);
        assert_eq!(joined, HashSpec::Sha256.digest(&[b"abc"]));
        assert_eq!(joined.len(), 32);
    }
}
