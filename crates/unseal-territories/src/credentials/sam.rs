//! Windows SAM account database
//!
//! Hashes in `Users\<RID>\V` are protected in three layers: DES keyed by the
//! RID, then RC4 or AES-128-CBC keyed by the hashed boot key, which is itself
//! encrypted with the boot key scattered over the SYSTEM hive's `Lsa` class
//! names. Replacement hashes are encrypted exactly the way the slot already
//! is, re-using its salt, so the V value keeps its length.

use super::ntlm::{des_unwrap, des_wrap, lm_hash, nt_hash};
use super::{AccountPatch, PatchOutcome};
use crate::hive::{Hive, ValueNode};
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use md5::{Digest, Md5};
use rc4::consts::U16;
use rc4::{Rc4, StreamCipher};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use unseal_core::{ByteView, Error, Realm, Result};

pub(crate) const QWERTY: &[u8] = b"!@#$%^&*()qwertyUIOPAzxcvbnmQQQQQQQQQQQQ)(*@&%\0";
pub(crate) const DIGITS: &[u8] = b"0123456789012345678901234567890123456789\0";
pub(crate) const NT_PASSWORD: &[u8] = b"NTPASSWORD\0";
pub(crate) const LM_PASSWORD: &[u8] = b"LMPASSWORD\0";

/// Order in which the scrambled `Lsa` class bytes form the boot key
pub(crate) const BOOT_KEY_PERMUTATION: [usize; 16] =
    [8, 5, 4, 2, 11, 9, 13, 3, 0, 6, 1, 12, 14, 10, 15, 7];

/// `Lsa` subkeys whose class names carry the scrambled boot key
pub(crate) const BOOT_KEY_PARTS: [&str; 4] = ["JD", "Skew1", "GBG", "Data"];

pub(crate) const ACCOUNT_PATH: &str = "SAM\\Domains\\Account";
pub(crate) const USERS_PATH: &str = "SAM\\Domains\\Account\\Users";

/// Start of the V value's data area; header offsets are relative to it
pub(crate) const V_DATA_BASE: usize = 0xCC;
pub(crate) const V_NAME: usize = 0x0C;
pub(crate) const V_LM: usize = 0x9C;
pub(crate) const V_NT: usize = 0xA8;

/// Offset of the key data inside `Account\F`
pub(crate) const F_KEY_DATA: usize = 0x68;

/// Offset of the account control bits inside `Users\<RID>\F`
pub(crate) const F_ACB: usize = 0x38;
const ACB_DISABLED: u16 = 0x0001;

/// Boot key recovered from a SYSTEM hive
pub fn boot_key(system: &Hive) -> Result<[u8; 16]> {
    let current = system
        .read_value("Select", "Current")?
        .ok_or_else(|| Error::corrupt_store("SYSTEM hive has no Select\\Current value"))?;
    let current = ByteView::new(&current, Realm::Store, "Select\\Current").u32_le(0)?;
    let lsa_path = format!("ControlSet{:03}\\Control\\Lsa", current);
    let lsa = system
        .open_key(&lsa_path)?
        .ok_or_else(|| Error::corrupt_store(format!("SYSTEM hive has no {}", lsa_path)))?;

    let mut scrambled = Vec::with_capacity(16);
    for part in BOOT_KEY_PARTS {
        let key = system
            .subkey(&lsa, part)?
            .ok_or_else(|| Error::corrupt_store(format!("{}\\{} is missing", lsa_path, part)))?;
        let class = system
            .class_name(&key)?
            .ok_or_else(|| Error::corrupt_store(format!("{}\\{} has no class name", lsa_path, part)))?;
        let bytes = hex::decode(class.trim())
            .map_err(|e| Error::corrupt_store(format!("{}\\{} class name: {}", lsa_path, part, e)))?;
        if bytes.len() != 4 {
            return Err(Error::corrupt_store(format!(
                "{}\\{} class name holds {} bytes",
                lsa_path,
                part,
                bytes.len()
            )));
        }
        scrambled.extend_from_slice(&bytes);
    }

    let mut key = [0u8; 16];
    for (slot, &from) in key.iter_mut().zip(BOOT_KEY_PERMUTATION.iter()) {
        *slot = scrambled[from];
    }
    debug!("Boot key recovered from {}", lsa_path);
    Ok(key)
}

/// Decrypt the hashed boot key from the `Account\F` value
pub fn hashed_boot_key(f: &[u8], boot_key: &[u8; 16]) -> Result<[u8; 16]> {
    let view = ByteView::new(f, Realm::Store, "Account\\F");
    let data = view.sub(F_KEY_DATA, f.len().saturating_sub(F_KEY_DATA))?;
    match data.u32_le(0)? {
        1 => {
            let salt = data.bytes(8, 16)?;
            let mut key = data.array::<32>(24)?;
            rc4_apply(&rc4_boot_key(salt, boot_key), &mut key)?;
            let mut hashed = [0u8; 16];
            hashed.copy_from_slice(&key[..16]);
            if boot_key_checksum(&hashed) != key[16..32] {
                return Err(Error::corrupt_store(
                    "hashed boot key checksum mismatch (wrong SYSTEM hive?)",
                ));
            }
            Ok(hashed)
        }
        2 => {
            let data_len = data.u32_le(12)? as usize;
            let iv = data.array::<16>(16)?;
            let mut plain = data.bytes(32, data_len)?.to_vec();
            cbc_decrypt(boot_key, &iv, &mut plain)?;
            let mut hashed = [0u8; 16];
            hashed.copy_from_slice(
                plain
                    .get(..16)
                    .ok_or_else(|| Error::corrupt_store("AES boot key data shorter than 16 bytes"))?,
            );
            Ok(hashed)
        }
        other => Err(Error::corrupt_store(format!(
            "unsupported SAM key revision {}",
            other
        ))),
    }
}

/// Encrypted hash slot inside a V value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashSlot {
    /// Slot present but holding no hash
    Empty,
    /// RC4 revision; `at` is the offset of the 16 encrypted bytes in V
    Rc4 { at: usize },
    /// AES revision
    Aes { at: usize, len: usize, salt: [u8; 16] },
}

impl HashSlot {
    fn parse(v: &ByteView, header: usize) -> Result<Self> {
        let offset = v.u32_le(header)? as usize + V_DATA_BASE;
        let len = v.u32_le(header + 4)? as usize;
        if len <= 4 {
            return Ok(HashSlot::Empty);
        }
        let entry = v.sub(offset, len)?;
        match entry.u16_le(2)? {
            1 if len == 20 => Ok(HashSlot::Rc4 { at: offset + 4 }),
            1 => Ok(HashSlot::Empty),
            2 if len <= 24 => Ok(HashSlot::Empty),
            2 => {
                let data_len = len - 24;
                if data_len % 16 != 0 {
                    return Err(v.error(format!("AES hash entry of {} bytes", len)));
                }
                Ok(HashSlot::Aes {
                    at: offset + 24,
                    len: data_len,
                    salt: entry.array::<16>(8)?,
                })
            }
            other => Err(v.error(format!("unknown hash entry revision {}", other))),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, HashSlot::Empty)
    }

    /// Decrypt the stored hash
    fn read(&self, v: &[u8], hbk: &[u8; 16], rid: u32, constant: &[u8]) -> Result<Option<[u8; 16]>> {
        let view = ByteView::new(v, Realm::Store, "V value");
        let obfuscated = match self {
            HashSlot::Empty => return Ok(None),
            HashSlot::Rc4 { at } => {
                let mut data = view.array::<16>(*at)?;
                rc4_apply(&rc4_hash_key(hbk, rid, constant), &mut data)?;
                data
            }
            HashSlot::Aes { at, len, salt } => {
                let mut data = view.bytes(*at, *len)?.to_vec();
                cbc_decrypt(hbk, salt, &mut data)?;
                let mut first = [0u8; 16];
                first.copy_from_slice(&data[..16]);
                first
            }
        };
        Ok(Some(des_unwrap(&obfuscated, rid)))
    }

    /// Encrypt `hash` into the slot, in place
    fn write(&self, v: &mut [u8], hbk: &[u8; 16], rid: u32, constant: &[u8], hash: &[u8; 16]) -> Result<()> {
        let obfuscated = des_wrap(hash, rid);
        match self {
            HashSlot::Empty => Err(Error::invalid_operation("cannot write into an empty hash slot")),
            HashSlot::Rc4 { at } => {
                let mut data = obfuscated;
                rc4_apply(&rc4_hash_key(hbk, rid, constant), &mut data)?;
                v[*at..*at + 16].copy_from_slice(&data);
                Ok(())
            }
            HashSlot::Aes { at, len, salt } => {
                // Keep the decrypted tail (padding) so the ciphertext is stable
                let mut plain = v[*at..*at + *len].to_vec();
                cbc_decrypt(hbk, salt, &mut plain)?;
                plain[..16].copy_from_slice(&obfuscated);
                cbc_encrypt(hbk, salt, &mut plain)?;
                v[*at..*at + *len].copy_from_slice(&plain);
                Ok(())
            }
        }
    }
}

/// One account under `Account\Users`
#[derive(Debug, Clone)]
pub struct SamUser {
    pub rid: u32,
    pub name: String,
    pub disabled: bool,
    pub lm: HashSlot,
    pub nt: HashSlot,
    v: ValueNode,
}

impl SamUser {
    fn parse(rid: u32, v: ValueNode, v_data: &[u8], f: Option<&[u8]>) -> Result<Self> {
        let view = ByteView::new(v_data, Realm::Store, "V value");
        let name_offset = view.u32_le(V_NAME)? as usize + V_DATA_BASE;
        let name_len = view.u32_le(V_NAME + 4)? as usize;
        let name = crate::hive::types::decode_utf16(view.bytes(name_offset, name_len)?);
        let disabled = match f {
            Some(f) => ByteView::new(f, Realm::Store, "user F value").u16_le(F_ACB)? & ACB_DISABLED != 0,
            None => false,
        };
        Ok(Self {
            rid,
            name,
            disabled,
            lm: HashSlot::parse(&view, V_LM)?,
            nt: HashSlot::parse(&view, V_NT)?,
            v,
        })
    }
}

/// A SAM hive paired with the key needed to rewrite its hashes
#[derive(Debug, Clone)]
pub struct SamStore {
    path: PathBuf,
    hive: Hive,
    hashed_boot_key: [u8; 16],
    dirty: bool,
}

impl SamStore {
    /// Load SAM and derive its hashed boot key from SYSTEM
    pub fn load(sam: &Path, system: &Path) -> Result<Self> {
        let system_hive = Hive::load(system)?;
        let sam_hive = Hive::load(sam)?;
        Self::from_hives(sam.to_path_buf(), sam_hive, &system_hive)
    }

    pub fn from_hives(path: PathBuf, hive: Hive, system: &Hive) -> Result<Self> {
        let boot_key = boot_key(system)?;
        let f = hive
            .read_value(ACCOUNT_PATH, "F")?
            .ok_or_else(|| Error::corrupt_store("SAM hive has no Domains\\Account\\F value"))?;
        let hashed_boot_key = hashed_boot_key(&f, &boot_key)?;
        let dirty = hive.is_dirty();
        if dirty {
            warn!("SAM hive {} is dirty; patching anyway", path.display());
        }
        Ok(Self {
            path,
            hive,
            hashed_boot_key,
            dirty,
        })
    }

    /// True when the hive was loaded with an incomplete write pending
    ///
    /// Windows replays SAM.LOG1/SAM.LOG2 over such a hive at boot, which
    /// can restore the old hashes.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.hive.as_bytes()
    }

    /// Every account, in key order
    pub fn users(&self) -> Result<Vec<SamUser>> {
        let users = self
            .hive
            .open_key(USERS_PATH)?
            .ok_or_else(|| Error::corrupt_store("SAM hive has no Account\\Users key"))?;
        let mut out = Vec::new();
        for key in self.hive.subkeys(&users)? {
            let Ok(rid) = u32::from_str_radix(&key.name, 16) else {
                continue;
            };
            let v = self
                .hive
                .value(&key, "V")?
                .ok_or_else(|| Error::corrupt_store(format!("user {} has no V value", key.name)))?;
            let v_data = self.hive.value_data(&v)?.to_vec();
            let f = match self.hive.value(&key, "F")? {
                Some(f) => Some(self.hive.value_data(&f)?.to_vec()),
                None => None,
            };
            out.push(SamUser::parse(rid, v, &v_data, f.as_deref())?);
        }
        Ok(out)
    }

    /// Decrypted NT hash of a user
    pub fn nt_hash_of(&self, user: &SamUser) -> Result<Option<[u8; 16]>> {
        let v = self.hive.value_data(&user.v)?;
        user.nt.read(v, &self.hashed_boot_key, user.rid, NT_PASSWORD)
    }

    /// Decrypted LM hash of a user
    pub fn lm_hash_of(&self, user: &SamUser) -> Result<Option<[u8; 16]>> {
        let v = self.hive.value_data(&user.v)?;
        user.lm.read(v, &self.hashed_boot_key, user.rid, LM_PASSWORD)
    }

    /// Replace every stored hash with the placeholder's
    ///
    /// All new V values are computed before any is written back into the
    /// hive, so an error leaves the store untouched.
    pub fn patch(&mut self, placeholder: &str) -> Result<Vec<AccountPatch>> {
        let nt = nt_hash(placeholder);
        let lm = lm_hash(placeholder);
        let mut reports = Vec::new();
        let mut writes = Vec::new();

        for user in self.users()? {
            let mut report = AccountPatch {
                account: user.name.clone(),
                rid: Some(user.rid),
                disabled: user.disabled,
                outcome: PatchOutcome::Patched,
                notes: Vec::new(),
            };
            if user.nt.is_empty() {
                report.outcome = PatchOutcome::Skipped {
                    reason: "no stored NT hash".to_string(),
                };
                reports.push(report);
                continue;
            }

            let mut v = self.hive.value_data(&user.v)?.to_vec();
            user.nt.write(&mut v, &self.hashed_boot_key, user.rid, NT_PASSWORD, &nt)?;
            if !user.lm.is_empty() {
                match &lm {
                    Some(lm) => user.lm.write(&mut v, &self.hashed_boot_key, user.rid, LM_PASSWORD, lm)?,
                    None => report.notes.push(
                        "LM hash left unchanged: placeholder is non-ASCII or longer than 14 characters"
                            .to_string(),
                    ),
                }
            }
            if user.disabled {
                report.notes.push("account is disabled".to_string());
            }
            debug!("Prepared new hashes for {} (RID {})", user.name, user.rid);
            writes.push((user.v.clone(), v));
            reports.push(report);
        }

        for (value, data) in &writes {
            self.hive.write_value_data(value, data)?;
        }
        info!("Patched {} of {} SAM accounts", writes.len(), reports.len());
        Ok(reports)
    }
}

/// RC4 key protecting the hashed boot key
pub(crate) fn rc4_boot_key(salt: &[u8], boot_key: &[u8; 16]) -> [u8; 16] {
    let mut md5 = Md5::new();
    md5.update(salt);
    md5.update(QWERTY);
    md5.update(boot_key);
    md5.update(DIGITS);
    md5.finalize().into()
}

/// Checksum stored after the RC4-encrypted hashed boot key
pub(crate) fn boot_key_checksum(hashed: &[u8; 16]) -> [u8; 16] {
    let mut md5 = Md5::new();
    md5.update(hashed);
    md5.update(DIGITS);
    md5.update(hashed);
    md5.update(QWERTY);
    md5.finalize().into()
}

/// RC4 key of a revision 1 hash entry
pub(crate) fn rc4_hash_key(hbk: &[u8; 16], rid: u32, constant: &[u8]) -> [u8; 16] {
    let mut md5 = Md5::new();
    md5.update(hbk);
    md5.update(rid.to_le_bytes());
    md5.update(constant);
    md5.finalize().into()
}

pub(crate) fn rc4_apply(key: &[u8; 16], data: &mut [u8]) -> Result<()> {
    let mut cipher = Rc4::<U16>::new_from_slice(key)
        .map_err(|e| Error::crypto(format!("RC4 key: {}", e)))?;
    cipher.apply_keystream(data);
    Ok(())
}

pub(crate) fn cbc_decrypt(key: &[u8; 16], iv: &[u8; 16], data: &mut [u8]) -> Result<()> {
    if data.len() % 16 != 0 {
        return Err(Error::corrupt_store(format!(
            "AES-CBC data of {} bytes is not block aligned",
            data.len()
        )));
    }
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut prev = *iv;
    for block in data.chunks_exact_mut(16) {
        let mut ciphertext = [0u8; 16];
        ciphertext.copy_from_slice(block);
        cipher.decrypt_block(GenericArray::from_mut_slice(block));
        for (b, p) in block.iter_mut().zip(prev.iter()) {
            *b ^= p;
        }
        prev = ciphertext;
    }
    Ok(())
}

pub(crate) fn cbc_encrypt(key: &[u8; 16], iv: &[u8; 16], data: &mut [u8]) -> Result<()> {
    if data.len() % 16 != 0 {
        return Err(Error::invalid_operation("AES-CBC plaintext is not block aligned"));
    }
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut prev = *iv;
    for block in data.chunks_exact_mut(16) {
        for (b, p) in block.iter_mut().zip(prev.iter()) {
            *b ^= p;
        }
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
        prev.copy_from_slice(block);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{SamFixture, SamKeyRevision};

    fn store(fixture: &SamFixture) -> SamStore {
        let (sam, system) = fixture.build();
        SamStore::from_hives(
            PathBuf::from("SAM"),
            Hive::parse(sam).unwrap(),
            &Hive::parse(system).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_boot_key_from_system() {
        let fixture = SamFixture::new(SamKeyRevision::Aes);
        let (_, system) = fixture.build();
        assert_eq!(boot_key(&Hive::parse(system).unwrap()).unwrap(), fixture.boot_key);
    }

    #[test]
    fn test_reads_existing_hashes() {
        for revision in [SamKeyRevision::Rc4, SamKeyRevision::Aes] {
            let store = store(&SamFixture::new(revision));
            let users = store.users().unwrap();
            let admin = users.iter().find(|u| u.rid == 500).unwrap();
            assert_eq!(admin.name, "Administrator");
            assert_eq!(store.nt_hash_of(admin).unwrap(), Some(nt_hash("Secret#1")));
            assert_eq!(store.lm_hash_of(admin).unwrap(), lm_hash("Secret#1"));
        }
    }

    #[test]
    fn test_patch_sets_placeholder_for_all_accounts() {
        for revision in [SamKeyRevision::Rc4, SamKeyRevision::Aes] {
            let mut store = store(&SamFixture::new(revision));
            let len = store.as_bytes().len();
            let reports = store.patch("unsealed").unwrap();
            assert_eq!(store.as_bytes().len(), len);
            assert_eq!(reports.len(), 3);

            for user in store.users().unwrap() {
                let report = reports.iter().find(|r| r.rid == Some(user.rid)).unwrap();
                if user.nt.is_empty() {
                    assert!(matches!(report.outcome, PatchOutcome::Skipped { .. }));
                } else {
                    assert_eq!(report.outcome, PatchOutcome::Patched);
                    assert_eq!(store.nt_hash_of(&user).unwrap(), Some(nt_hash("unsealed")));
                    assert_eq!(store.lm_hash_of(&user).unwrap(), lm_hash("unsealed"));
                }
            }
        }
    }

    #[test]
    fn test_disabled_account_is_patched() {
        let mut store = store(&SamFixture::new(SamKeyRevision::Aes));
        let reports = store.patch("unsealed").unwrap();
        let guest = reports.iter().find(|r| r.rid == Some(501)).unwrap();
        assert!(guest.disabled);
        assert_eq!(guest.outcome, PatchOutcome::Patched);
    }

    #[test]
    fn test_patch_is_idempotent() {
        let mut store = store(&SamFixture::new(SamKeyRevision::Rc4));
        store.patch("unsealed").unwrap();
        let once = store.as_bytes().to_vec();
        store.patch("unsealed").unwrap();
        assert_eq!(store.as_bytes(), &once[..]);
    }

    #[test]
    fn test_long_placeholder_leaves_lm() {
        let mut store = store(&SamFixture::new(SamKeyRevision::Aes));
        let reports = store.patch("a much longer placeholder").unwrap();
        let users = store.users().unwrap();
        let admin = users.iter().find(|u| u.rid == 500).unwrap();
        assert_eq!(store.lm_hash_of(admin).unwrap(), lm_hash("Secret#1"));
        let admin_report = reports.iter().find(|r| r.rid == Some(500)).unwrap();
        assert!(admin_report.notes.iter().any(|n| n.starts_with("LM hash left unchanged")));
    }

    #[test]
    fn test_wrong_system_hive_is_rejected() {
        let fixture = SamFixture::new(SamKeyRevision::Rc4);
        let other = SamFixture {
            boot_key: [0x77; 16],
            ..SamFixture::new(SamKeyRevision::Rc4)
        };
        let (sam, _) = fixture.build();
        let (_, system) = other.build();
        let err = SamStore::from_hives(
            PathBuf::from("SAM"),
            Hive::parse(sam).unwrap(),
            &Hive::parse(system).unwrap(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::CorruptStore(_)));
    }
}
