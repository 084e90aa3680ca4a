//! `/etc/shadow` rewriting
//!
//! Lines are kept with their original terminators and only the second field
//! of an entry ever changes, so an unpatched file serialises byte-for-byte.

use super::{AccountPatch, PatchOutcome};
use pwhash::{sha512_crypt, unix};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use unseal_core::{validate_allocation_size, Error, Realm, Result, MAX_TEXT_FILE_SIZE};

/// Hash identifiers `pwhash` cannot compute; these get SHA-512-crypt instead
const FALLBACK_IDS: [&str; 3] = ["$y$", "$gy$", "$7$"];

const MAX_SALT_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowFile {
    path: PathBuf,
    lines: Vec<String>,
}

impl ShadowFile {
    pub fn load(path: &Path) -> Result<Self> {
        let len = fs::metadata(path)?.len();
        validate_allocation_size(len, MAX_TEXT_FILE_SIZE as usize, Realm::Store, "shadow file")?;
        Self::parse(path.to_path_buf(), fs::read(path)?)
    }

    pub fn parse(path: PathBuf, bytes: Vec<u8>) -> Result<Self> {
        let text = String::from_utf8(bytes)
            .map_err(|e| Error::corrupt_store(format!("{}: not valid UTF-8: {}", path.display(), e)))?;
        let lines: Vec<String> = text.split_inclusive('\n').map(str::to_string).collect();
        for (number, line) in lines.iter().enumerate() {
            let body = body(line);
            if is_entry(body) && body.split(':').count() < 2 {
                return Err(Error::corrupt_store(format!(
                    "{}:{}: entry has no password field",
                    path.display(),
                    number + 1
                )));
            }
        }
        Ok(Self { path, lines })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.lines.concat().into_bytes()
    }

    /// Replace every usable password hash with one for `placeholder`
    ///
    /// New lines are computed first and swapped in together.
    pub fn patch(&mut self, placeholder: &str) -> Result<Vec<AccountPatch>> {
        let mut reports = Vec::new();
        let mut patched = self.lines.clone();

        for (line, slot) in self.lines.iter().zip(patched.iter_mut()) {
            let body = body(line);
            if !is_entry(body) {
                continue;
            }
            let mut fields: Vec<&str> = body.split(':').collect();
            let account = fields[0].to_string();
            let outcome = match skip_reason(fields[1]) {
                Some(reason) => PatchOutcome::Skipped { reason },
                None => match rehash(placeholder, fields[1]) {
                    Ok(hash) => {
                        let terminator = &line[body.len()..];
                        fields[1] = &hash;
                        *slot = format!("{}{}", fields.join(":"), terminator);
                        PatchOutcome::Patched
                    }
                    Err(reason) => PatchOutcome::Skipped { reason },
                },
            };
            debug!("shadow entry {}: {:?}", account, outcome);
            reports.push(AccountPatch {
                account,
                rid: None,
                disabled: false,
                outcome,
                notes: Vec::new(),
            });
        }

        self.lines = patched;
        info!(
            "Patched {} of {} shadow entries in {}",
            reports.iter().filter(|r| r.outcome == PatchOutcome::Patched).count(),
            reports.len(),
            self.path.display()
        );
        Ok(reports)
    }
}

fn body(line: &str) -> &str {
    line.trim_end_matches(['\n', '\r'])
}

fn is_entry(body: &str) -> bool {
    !body.trim().is_empty() && !body.starts_with('#')
}

fn skip_reason(hash: &str) -> Option<String> {
    if hash.is_empty() {
        Some("no password set".to_string())
    } else if hash.starts_with('!') || hash.starts_with('*') {
        Some("account locked".to_string())
    } else {
        None
    }
}

/// crypt(3) of the placeholder using the existing hash as setting
fn rehash(placeholder: &str, existing: &str) -> std::result::Result<String, String> {
    if FALLBACK_IDS.iter().any(|id| existing.starts_with(id)) {
        let salt = fallback_salt(existing).ok_or_else(|| "no usable salt in hash".to_string())?;
        return sha512_crypt::hash_with(format!("$6${}", salt).as_str(), placeholder)
            .map_err(|e| format!("SHA-512-crypt failed: {}", e));
    }
    unix::crypt(placeholder, existing).map_err(|e| format!("unsupported hash scheme: {}", e))
}

/// Salt segment of a `$id$params$salt$hash` string, limited to the crypt alphabet
fn fallback_salt(existing: &str) -> Option<String> {
    let segments: Vec<&str> = existing.split('$').collect();
    if segments.len() < 4 {
        return None;
    }
    let salt: String = segments[segments.len() - 2]
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '.' || *c == '/')
        .take(MAX_SALT_LEN)
        .collect();
    (!salt.is_empty()).then_some(salt)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHADOW: &str = "root:$6$saltsalt$qFmFH.bQmmtXzyBY0s9v7Oicd2z4XSIecDzlB5KiA2/jctKu9YterLp8wwnSq.qc.eoxqOmSuNp2xS0ktL3nh/:19000:0:99999:7:::\n\
daemon:*:19000:0:99999:7:::\n\
alice:$1$abcdefgh$M.Mx7C5qM5dXq8V6ZqV9a1:19000:0:99999:7:::\r\n\
bob::19000:0:99999:7:::\n\
carol:!$6$xyz$abc:19000:0:99999:7:::\n\
dave:$y$j9T$F5Jx5fExrKuPp53xLKQ..1$X3DX6M94c7o.9agCG9G317fhZg9SqC.5i5rd.RhAtQ7:19000:0:99999:7:::";

    fn shadow() -> ShadowFile {
        ShadowFile::parse(PathBuf::from("shadow"), SHADOW.as_bytes().to_vec()).unwrap()
    }

    #[test]
    fn test_unpatched_roundtrip_is_identical() {
        assert_eq!(shadow().to_bytes(), SHADOW.as_bytes());
    }

    #[test]
    fn test_patch_all_accounts() {
        let mut file = shadow();
        let reports = file.patch("unsealed").unwrap();
        assert_eq!(reports.len(), 6);
        let outcome = |name: &str| &reports.iter().find(|r| r.account == name).unwrap().outcome;
        assert_eq!(*outcome("root"), PatchOutcome::Patched);
        assert_eq!(*outcome("alice"), PatchOutcome::Patched);
        assert_eq!(*outcome("dave"), PatchOutcome::Patched);
        assert!(matches!(outcome("daemon"), PatchOutcome::Skipped { .. }));
        assert!(matches!(outcome("bob"), PatchOutcome::Skipped { .. }));
        assert!(matches!(outcome("carol"), PatchOutcome::Skipped { .. }));

        let text = String::from_utf8(file.to_bytes()).unwrap();
        for (before, after) in SHADOW.split_inclusive('\n').zip(text.split_inclusive('\n')) {
            assert_eq!(before.split(':').count(), after.split(':').count());
            assert_eq!(before.ends_with("\r\n"), after.ends_with("\r\n"));
        }
        let root_hash = text.lines().next().unwrap().split(':').nth(1).unwrap();
        assert!(root_hash.starts_with("$6$saltsalt$"));
        assert!(pwhash::unix::verify("unsealed", root_hash));
        let alice_hash = text.lines().nth(2).unwrap().split(':').nth(1).unwrap();
        assert!(alice_hash.starts_with("$1$abcdefgh$"));
        assert!(pwhash::unix::verify("unsealed", alice_hash));
        let dave_hash = text.lines().nth(5).unwrap().split(':').nth(1).unwrap();
        assert!(dave_hash.starts_with("$6$F5Jx5fExrKuPp53x$"));
        assert!(pwhash::unix::verify("unsealed", dave_hash));
    }

    #[test]
    fn test_patch_is_idempotent() {
        let mut file = shadow();
        file.patch("unsealed").unwrap();
        let once = file.to_bytes();
        file.patch("unsealed").unwrap();
        assert_eq!(file.to_bytes(), once);
    }

    #[test]
    fn test_corrupt_shadow_rejected() {
        let err = ShadowFile::parse(PathBuf::from("shadow"), b"root\n".to_vec()).unwrap_err();
        assert!(matches!(err, Error::CorruptStore(_)));
        let err = ShadowFile::parse(PathBuf::from("shadow"), vec![0xFF, 0xFE, b':']).unwrap_err();
        assert!(matches!(err, Error::CorruptStore(_)));
    }

    #[test]
    fn test_fallback_salt() {
        assert_eq!(fallback_salt("$y$j9T$abc$hash").as_deref(), Some("abc"));
        assert_eq!(fallback_salt("$7$hash"), None);
    }
}
