//! NT/LM password hashes and the SAM per-RID DES layer

use des::cipher::generic_array::GenericArray;
use des::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use des::Des;
use md4::{Digest, Md4};

/// Longest password the LM hash can represent
pub const LM_MAX_LEN: usize = 14;

const LM_MAGIC: &[u8; 8] = b"KGS!@#$%";

/// MD4 of the UTF-16LE password
pub fn nt_hash(password: &str) -> [u8; 16] {
    let utf16: Vec<u8> = password.encode_utf16().flat_map(u16::to_le_bytes).collect();
    Md4::digest(&utf16).into()
}

/// True when `password` survives LM hashing without truncation
pub fn lm_representable(password: &str) -> bool {
    password.is_ascii() && password.len() <= LM_MAX_LEN
}

/// LM hash, or `None` when the password cannot be represented
pub fn lm_hash(password: &str) -> Option<[u8; 16]> {
    if !lm_representable(password) {
        return None;
    }
    let mut padded = [0u8; LM_MAX_LEN];
    for (slot, b) in padded.iter_mut().zip(password.to_ascii_uppercase().bytes()) {
        *slot = b;
    }
    let mut out = [0u8; 16];
    for (half, chunk) in padded.chunks_exact(7).enumerate() {
        let cipher = des_cipher(chunk);
        let mut block = GenericArray::clone_from_slice(LM_MAGIC);
        cipher.encrypt_block(&mut block);
        out[half * 8..half * 8 + 8].copy_from_slice(&block);
    }
    Some(out)
}

/// Remove the per-RID DES obfuscation from a 16-byte hash
pub fn des_unwrap(data: &[u8; 16], rid: u32) -> [u8; 16] {
    let (k1, k2) = rid_ciphers(rid);
    let mut out = [0u8; 16];
    for (i, cipher) in [k1, k2].iter().enumerate() {
        let mut block = GenericArray::clone_from_slice(&data[i * 8..i * 8 + 8]);
        cipher.decrypt_block(&mut block);
        out[i * 8..i * 8 + 8].copy_from_slice(&block);
    }
    out
}

/// Apply the per-RID DES obfuscation to a 16-byte hash
pub fn des_wrap(hash: &[u8; 16], rid: u32) -> [u8; 16] {
    let (k1, k2) = rid_ciphers(rid);
    let mut out = [0u8; 16];
    for (i, cipher) in [k1, k2].iter().enumerate() {
        let mut block = GenericArray::clone_from_slice(&hash[i * 8..i * 8 + 8]);
        cipher.encrypt_block(&mut block);
        out[i * 8..i * 8 + 8].copy_from_slice(&block);
    }
    out
}

fn rid_ciphers(rid: u32) -> (Des, Des) {
    let r = rid.to_le_bytes();
    let first = [r[0], r[1], r[2], r[3], r[0], r[1], r[2]];
    let second = [r[3], r[0], r[1], r[2], r[3], r[0], r[1]];
    (des_cipher(&first), des_cipher(&second))
}

/// Spread 56 key bits over 8 bytes, low bit left for parity
fn str_to_key(s: &[u8]) -> [u8; 8] {
    let key = [
        s[0] >> 1,
        ((s[0] & 0x01) << 6) | (s[1] >> 2),
        ((s[1] & 0x03) << 5) | (s[2] >> 3),
        ((s[2] & 0x07) << 4) | (s[3] >> 4),
        ((s[3] & 0x0F) << 3) | (s[4] >> 5),
        ((s[4] & 0x1F) << 2) | (s[5] >> 6),
        ((s[5] & 0x3F) << 1) | (s[6] >> 7),
        s[6] & 0x7F,
    ];
    key.map(|b| b << 1)
}

fn des_cipher(seven: &[u8]) -> Des {
    Des::new(GenericArray::from_slice(&str_to_key(seven)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nt_hash_vector() {
        assert_eq!(hex::encode(nt_hash("password")), "8846f7eaee8fb117ad06bdd830b7586c");
        assert_eq!(hex::encode(nt_hash("")), "31d6cfe0d16ae931b73c59d7e0c089c0");
    }

    #[test]
    fn test_lm_hash_vector() {
        assert_eq!(
            hex::encode(lm_hash("password").unwrap()),
            "e52cac67419a9a224a3b108f3fa6cb6d"
        );
        assert!(lm_hash("a-password-that-is-too-long").is_none());
        assert!(lm_hash("pässword").is_none());
    }

    #[test]
    fn test_rid_layer_inverts() {
        let hash = nt_hash("unsealed");
        let wrapped = des_wrap(&hash, 1001);
        assert_ne!(wrapped, hash);
        assert_eq!(des_unwrap(&wrapped, 1001), hash);
        assert_ne!(des_unwrap(&wrapped, 500), hash);
    }
}
