//! Credential-store patching
//!
//! Every store of a profile is parsed and patched in memory first. Changed
//! stores are then staged as temporary files next to the originals and
//! renamed over them only once every one of them was written.

pub mod ntlm;
pub mod sam;
pub mod shadow;

pub use sam::SamStore;
pub use shadow::ShadowFile;

use crate::os::{OsProfile, StoreLocation};
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{info, warn};
use unseal_core::{Error, Result};

/// Note attached to a store whose hive has unreplayed transaction logs
pub const DIRTY_HIVE_WARNING: &str =
    "hive was not cleanly closed; Windows may replay SAM.LOG1/SAM.LOG2 and revert the new hashes";

/// Result for one account
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PatchOutcome {
    Patched,
    Skipped { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountPatch {
    pub account: String,
    /// Windows relative identifier
    pub rid: Option<u32>,
    pub disabled: bool,
    #[serde(flatten)]
    pub outcome: PatchOutcome,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

impl AccountPatch {
    pub fn is_patched(&self) -> bool {
        self.outcome == PatchOutcome::Patched
    }
}

/// A parsed credential store
#[derive(Debug, Clone)]
pub enum CredentialStore {
    Shadow(ShadowFile),
    Sam(SamStore),
}

impl CredentialStore {
    pub fn load(location: &StoreLocation) -> Result<Self> {
        Ok(match location {
            StoreLocation::Sam { sam, system } => CredentialStore::Sam(SamStore::load(sam, system)?),
            StoreLocation::Shadow { path } => CredentialStore::Shadow(ShadowFile::load(path)?),
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CredentialStore::Shadow(_) => "shadow",
            CredentialStore::Sam(_) => "sam",
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            CredentialStore::Shadow(s) => s.path(),
            CredentialStore::Sam(s) => s.path(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            CredentialStore::Shadow(s) => s.to_bytes(),
            CredentialStore::Sam(s) => s.as_bytes().to_vec(),
        }
    }

    pub fn patch(&mut self, placeholder: &str) -> Result<Vec<AccountPatch>> {
        match self {
            CredentialStore::Shadow(s) => s.patch(placeholder),
            CredentialStore::Sam(s) => s.patch(placeholder),
        }
    }

    /// Conditions that may undo the patch after boot
    pub fn warnings(&self) -> Vec<String> {
        match self {
            CredentialStore::Sam(s) if s.is_dirty() => vec![DIRTY_HIVE_WARNING.to_string()],
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreReport {
    pub path: PathBuf,
    pub kind: &'static str,
    /// False when the patched bytes equal what was on disk
    pub changed: bool,
    pub accounts: Vec<AccountPatch>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PatchReport {
    pub stores: Vec<StoreReport>,
}

impl PatchReport {
    pub fn accounts(&self) -> impl Iterator<Item = &AccountPatch> {
        self.stores.iter().flat_map(|s| s.accounts.iter())
    }

    pub fn patched(&self) -> Vec<String> {
        self.accounts().filter(|a| a.is_patched()).map(|a| a.account.clone()).collect()
    }

    pub fn skipped(&self) -> Vec<(String, String)> {
        self.accounts()
            .filter_map(|a| match &a.outcome {
                PatchOutcome::Skipped { reason } => Some((a.account.clone(), reason.clone())),
                PatchOutcome::Patched => None,
            })
            .collect()
    }

    /// Store warnings, prefixed with the store path
    pub fn warnings(&self) -> Vec<String> {
        self.stores
            .iter()
            .flat_map(|s| s.warnings.iter().map(move |w| format!("{}: {}", s.path.display(), w)))
            .collect()
    }
}

/// Write `bytes` to a temporary file beside `path`, keeping its permissions
fn stage(path: &Path, bytes: &[u8]) -> Result<NamedTempFile> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::invalid_operation(format!("{} has no parent directory", path.display())))?;
    let mut staged = NamedTempFile::new_in(dir)?;
    staged.write_all(bytes)?;
    staged.as_file().sync_all()?;
    let metadata = fs::metadata(path)?;
    staged.as_file().set_permissions(metadata.permissions())?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        std::os::unix::fs::fchown(staged.as_file(), Some(metadata.uid()), Some(metadata.gid()))?;
    }
    Ok(staged)
}

/// Set every account of every store in `profile` to `placeholder`
pub fn patch_profile(profile: &OsProfile, placeholder: &str) -> Result<PatchReport> {
    let mut staged = Vec::with_capacity(profile.credential_stores.len());
    for location in &profile.credential_stores {
        let mut store = CredentialStore::load(location)?;
        let original = store.to_bytes();
        let accounts = store.patch(placeholder)?;
        let patched = store.to_bytes();
        staged.push((store, original != patched, patched, accounts));
    }

    let mut pending = Vec::new();
    for (store, changed, bytes, _) in &staged {
        if *changed {
            pending.push((store.path(), stage(store.path(), bytes)?));
        }
    }
    for (path, file) in pending {
        file.persist(path).map_err(|e| e.error)?;
    }

    let mut report = PatchReport::default();
    for (store, changed, _, accounts) in staged {
        if changed {
            info!("Rewrote {} store {}", store.kind(), store.path().display());
        } else {
            info!("{} store {} already up to date", store.kind(), store.path().display());
        }
        let warnings = store.warnings();
        for warning in &warnings {
            warn!("{}: {}", store.path().display(), warning);
        }
        report.stores.push(StoreReport {
            path: store.path().to_path_buf(),
            kind: store.kind(),
            changed,
            accounts,
            warnings,
        });
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{linux_root, windows_root, SamFixture, SamKeyRevision};
    use crate::hive::Hive;
    use crate::os::identify;
    use tempfile::TempDir;
    use unseal_core::Error;

    const SHADOW: &str = "root:$6$abcdefgh$x:19000:0:99999:7:::\nnobody:*:19000::::::\n";

    #[test]
    fn test_patch_windows_profile() {
        let dir = TempDir::new().unwrap();
        let fixture = SamFixture::new(SamKeyRevision::Aes);
        windows_root(dir.path(), &fixture);
        let profile = identify(dir.path()).unwrap();

        let report = patch_profile(&profile, "unsealed").unwrap();
        assert_eq!(report.stores.len(), 1);
        assert!(report.stores[0].changed);
        assert_eq!(report.patched().len(), 2);
        assert_eq!(report.skipped().len(), 1);

        let StoreLocation::Sam { sam, system } = &profile.credential_stores[0] else {
            panic!("expected a SAM store");
        };
        let store = SamStore::load(sam, system).unwrap();
        for user in store.users().unwrap().iter().filter(|u| !u.nt.is_empty()) {
            assert_eq!(store.nt_hash_of(user).unwrap(), Some(ntlm::nt_hash("unsealed")));
        }
    }

    #[test]
    fn test_second_patch_writes_nothing() {
        let dir = TempDir::new().unwrap();
        linux_root(dir.path(), "PRETTY_NAME=\"Test\"\n", SHADOW);
        let profile = identify(dir.path()).unwrap();

        assert!(patch_profile(&profile, "unsealed").unwrap().stores[0].changed);
        let after_first = fs::read(dir.path().join("etc/shadow")).unwrap();
        let second = patch_profile(&profile, "unsealed").unwrap();
        assert!(!second.stores[0].changed);
        assert_eq!(fs::read(dir.path().join("etc/shadow")).unwrap(), after_first);
    }

    #[test]
    fn test_corrupt_store_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let fixture = SamFixture::new(SamKeyRevision::Rc4);
        windows_root(dir.path(), &fixture);
        linux_root(dir.path(), "PRETTY_NAME=\"Test\"\n", SHADOW);
        let sam = dir.path().join("Windows/System32/config/SAM");
        let shadow = dir.path().join("etc/shadow");
        fs::write(dir.path().join("Windows/System32/config/SYSTEM"), b"not a hive").unwrap();

        let profile = OsProfile {
            family: crate::os::OsFamily::Linux,
            version: "both".into(),
            credential_stores: vec![
                StoreLocation::Shadow { path: shadow.clone() },
                StoreLocation::Sam {
                    sam: sam.clone(),
                    system: dir.path().join("Windows/System32/config/SYSTEM"),
                },
            ],
            guest_os_hint: "otherlinux".into(),
        };
        let sam_before = fs::read(&sam).unwrap();
        let err = patch_profile(&profile, "unsealed").unwrap_err();
        assert!(matches!(err, Error::CorruptStore(_)));
        assert_eq!(fs::read(&shadow).unwrap(), SHADOW.as_bytes());
        assert_eq!(fs::read(&sam).unwrap(), sam_before);
        assert!(Hive::parse(sam_before).is_ok());
    }

    #[test]
    fn test_commit_replaces_files_in_place() {
        let dir = TempDir::new().unwrap();
        linux_root(dir.path(), "PRETTY_NAME=\"Test\"\n", SHADOW);
        let shadow = dir.path().join("etc/shadow");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&shadow, fs::Permissions::from_mode(0o640)).unwrap();
        }
        let listing = |path: &Path| {
            let mut names: Vec<_> = fs::read_dir(path).unwrap().map(|e| e.unwrap().file_name()).collect();
            names.sort();
            names
        };
        let before = listing(&dir.path().join("etc"));

        let profile = identify(dir.path()).unwrap();
        assert!(patch_profile(&profile, "unsealed").unwrap().stores[0].changed);

        assert_eq!(listing(&dir.path().join("etc")), before);
        assert_ne!(fs::read(&shadow).unwrap(), SHADOW.as_bytes());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            assert_eq!(fs::metadata(&shadow).unwrap().permissions().mode() & 0o777, 0o640);
        }
    }

    #[test]
    fn test_dirty_sam_is_reported() {
        let dir = TempDir::new().unwrap();
        let fixture = SamFixture::new(SamKeyRevision::Aes);
        windows_root(dir.path(), &fixture);
        let sam = dir.path().join("Windows/System32/config/SAM");
        let mut bytes = fs::read(&sam).unwrap();
        bytes[8] = bytes[8].wrapping_add(1);
        fs::write(&sam, bytes).unwrap();

        let profile = identify(dir.path()).unwrap();
        let report = patch_profile(&profile, "unsealed").unwrap();
        assert_eq!(report.stores[0].warnings, vec![DIRTY_HIVE_WARNING.to_string()]);
        assert_eq!(report.patched().len(), 2);
        let warnings = report.warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].ends_with(DIRTY_HIVE_WARNING));
    }

    #[test]
    fn test_clean_stores_carry_no_warnings() {
        let dir = TempDir::new().unwrap();
        windows_root(dir.path(), &SamFixture::new(SamKeyRevision::Rc4));
        let profile = identify(dir.path()).unwrap();
        assert!(patch_profile(&profile, "unsealed").unwrap().warnings().is_empty());
    }
}
