//! Operating system identification on a mounted filesystem
//!
//! Windows is recognised by its registry hives, Linux by `os-release` or
//! `/etc/passwd`. Paths are matched without regard to ASCII case because
//! NTFS trees mounted on Linux keep their original casing.

use crate::hive::Hive;
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use unseal_core::{validate_allocation_size, Error, Realm, Result, MAX_TEXT_FILE_SIZE};

const CURRENT_VERSION: &str = "Microsoft\\Windows NT\\CurrentVersion";

/// First Windows 11 build
const WINDOWS_11_BUILD: u32 = 22000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OsFamily {
    Windows,
    Linux,
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OsFamily::Windows => f.write_str("Windows"),
            OsFamily::Linux => f.write_str("Linux"),
        }
    }
}

/// Where a credential store lives inside the mounted root
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreLocation {
    /// SAM hive plus the SYSTEM hive holding its boot key
    Sam { sam: PathBuf, system: PathBuf },
    /// `/etc/shadow`
    Shadow { path: PathBuf },
}

impl StoreLocation {
    /// File that gets rewritten
    pub fn target(&self) -> &Path {
        match self {
            StoreLocation::Sam { sam, .. } => sam,
            StoreLocation::Shadow { path } => path,
        }
    }
}

/// What was found on a volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OsProfile {
    pub family: OsFamily,
    /// Human readable version, e.g. "Windows 11 Pro 23H2 (build 22631)"
    pub version: String,
    pub credential_stores: Vec<StoreLocation>,
    /// Hypervisor guest identifier, e.g. "windows9-64"
    pub guest_os_hint: String,
}

/// Identify the OS installed under `root`
pub fn identify(root: &Path) -> Result<OsProfile> {
    let profile = match identify_windows(root)? {
        Some(profile) => profile,
        None => match identify_linux(root)? {
            Some(profile) => profile,
            None => {
                return Err(Error::unknown_os(format!(
                    "no Windows registry or Linux release marker under {}",
                    root.display()
                )))
            }
        },
    };
    info!(
        "Identified {} ({}) with {} credential store(s)",
        profile.version,
        profile.guest_os_hint,
        profile.credential_stores.len()
    );
    Ok(profile)
}

fn identify_windows(root: &Path) -> Result<Option<OsProfile>> {
    let Some(config) = find_path(root, &["Windows", "System32", "config"])? else {
        return Ok(None);
    };
    let sam = find_path(&config, &["SAM"])?;
    let system = find_path(&config, &["SYSTEM"])?;
    let (sam, system) = match (sam, system) {
        (Some(sam), Some(system)) => (sam, system),
        _ => {
            debug!("{} lacks SAM or SYSTEM", config.display());
            return Ok(None);
        }
    };

    let info = match find_path(&config, &["SOFTWARE"])? {
        Some(path) => match WindowsVersion::read(&path) {
            Ok(info) => info,
            Err(e) => {
                warn!("Could not read Windows version from {}: {}", path.display(), e);
                WindowsVersion::default()
            }
        },
        None => WindowsVersion::default(),
    };
    let wow64 = find_path(root, &["Windows", "SysWOW64"])?.is_some();

    Ok(Some(OsProfile {
        family: OsFamily::Windows,
        version: info.describe(),
        credential_stores: vec![StoreLocation::Sam { sam, system }],
        guest_os_hint: info.guest_hint(wow64),
    }))
}

/// Fields of `CurrentVersion` in the SOFTWARE hive
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct WindowsVersion {
    product: Option<String>,
    display_version: Option<String>,
    build: Option<u32>,
    build_lab: Option<String>,
}

impl WindowsVersion {
    fn read(path: &Path) -> Result<Self> {
        let hive = Hive::load(path)?;
        let text = |name: &str| -> Result<Option<String>> {
            Ok(hive
                .read_string(CURRENT_VERSION, name)?
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()))
        };
        let build = match text("CurrentBuildNumber")? {
            Some(build) => Some(build),
            None => text("CurrentBuild")?,
        };
        Ok(Self {
            product: text("ProductName")?,
            display_version: text("DisplayVersion")?,
            build: build.and_then(|b| b.parse().ok()),
            build_lab: text("BuildLabEx")?,
        })
    }

    fn describe(&self) -> String {
        let mut product = self.product.clone().unwrap_or_else(|| "Windows".to_string());
        // Windows 11 still reports "Windows 10" as its product name
        if self.build.is_some_and(|b| b >= WINDOWS_11_BUILD) {
            product = product.replace("Windows 10", "Windows 11");
        }
        let mut out = product;
        if let Some(display) = &self.display_version {
            out.push(' ');
            out.push_str(display);
        }
        match self.build {
            Some(build) => out.push_str(&format!(" (build {})", build)),
            None if self.product.is_none() => out.push_str(" (unknown version)"),
            None => {}
        }
        out
    }

    fn guest_hint(&self, wow64: bool) -> String {
        let base = match self.build {
            Some(b) if b >= 10240 => "windows9",
            Some(b) if b >= 9200 => "windows8",
            Some(b) if b >= 7600 => "windows7",
            Some(_) => "winvista",
            None => "windows9",
        };
        let amd64 = self
            .build_lab
            .as_deref()
            .is_some_and(|lab| lab.to_ascii_lowercase().contains("amd64"));
        if amd64 || wow64 {
            format!("{}-64", base)
        } else {
            base.to_string()
        }
    }
}

fn identify_linux(root: &Path) -> Result<Option<OsProfile>> {
    let release = match find_path(root, &["etc", "os-release"])? {
        Some(path) => Some(path),
        None => find_path(root, &["usr", "lib", "os-release"])?,
    };
    let version = match release {
        Some(path) => release_name(&read_text(&path)?),
        None if find_path(root, &["etc", "passwd"])?.is_some() => {
            "Linux (unknown distribution)".to_string()
        }
        None => return Ok(None),
    };

    let credential_stores = find_path(root, &["etc", "shadow"])?
        .map(|path| vec![StoreLocation::Shadow { path }])
        .unwrap_or_default();
    let is_64 = find_path(root, &["lib64"])?.is_some()
        || find_path(root, &["usr", "lib64"])?.is_some()
        || find_path(root, &["usr", "lib", "x86_64-linux-gnu"])?.is_some();

    Ok(Some(OsProfile {
        family: OsFamily::Linux,
        version,
        credential_stores,
        guest_os_hint: if is_64 { "otherlinux-64" } else { "otherlinux" }.to_string(),
    }))
}

/// `PRETTY_NAME`, else `NAME VERSION_ID`, from os-release text
fn release_name(text: &str) -> String {
    let field = |key: &str| {
        text.lines().find_map(|line| {
            let (k, v) = line.split_once('=')?;
            (k.trim() == key).then(|| v.trim().trim_matches(['"', '\'']).to_string())
        })
    };
    if let Some(pretty) = field("PRETTY_NAME").filter(|s| !s.is_empty()) {
        return pretty;
    }
    match (field("NAME"), field("VERSION_ID")) {
        (Some(name), Some(version)) => format!("{} {}", name, version),
        (Some(name), None) => name,
        _ => "Linux".to_string(),
    }
}

fn read_text(path: &Path) -> Result<String> {
    let len = fs::metadata(path)?.len();
    validate_allocation_size(len, MAX_TEXT_FILE_SIZE as usize, Realm::Store, "os-release")?;
    Ok(String::from_utf8_lossy(&fs::read(path)?).into_owned())
}

/// Resolve `components` under `root`, matching each name without regard to ASCII case
pub fn find_path(root: &Path, components: &[&str]) -> Result<Option<PathBuf>> {
    let mut current = root.to_path_buf();
    for component in components {
        let exact = current.join(component);
        if exact.exists() {
            current = exact;
            continue;
        }
        if !current.is_dir() {
            return Ok(None);
        }
        let mut found = None;
        for entry in fs::read_dir(&current)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().eq_ignore_ascii_case(component) {
                found = Some(entry.path());
                break;
            }
        }
        match found {
            Some(path) => current = path,
            None => return Ok(None),
        }
    }
    Ok(Some(current))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{linux_root, windows_root, SamFixture, SamKeyRevision};
    use tempfile::TempDir;

    #[test]
    fn test_identify_windows_11() {
        let dir = TempDir::new().unwrap();
        let fixture = SamFixture::new(SamKeyRevision::Aes);
        windows_root(dir.path(), &fixture);
        let profile = identify(dir.path()).unwrap();
        assert_eq!(profile.family, OsFamily::Windows);
        assert_eq!(profile.version, "Windows 11 Pro 23H2 (build 22631)");
        assert_eq!(profile.guest_os_hint, "windows9-64");
        assert!(matches!(profile.credential_stores[0], StoreLocation::Sam { .. }));
    }

    #[test]
    fn test_identify_linux() {
        let dir = TempDir::new().unwrap();
        linux_root(
            dir.path(),
            "NAME=\"Ubuntu\"\nVERSION_ID=\"22.04\"\nPRETTY_NAME=\"Ubuntu 22.04.3 LTS\"\n",
            "root:*:19000:0:99999:7:::\n",
        );
        let profile = identify(dir.path()).unwrap();
        assert_eq!(profile.family, OsFamily::Linux);
        assert_eq!(profile.version, "Ubuntu 22.04.3 LTS");
        assert_eq!(profile.guest_os_hint, "otherlinux");
        assert_eq!(
            profile.credential_stores,
            vec![StoreLocation::Shadow { path: dir.path().join("etc/shadow") }]
        );
    }

    #[test]
    fn test_unknown_os() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("home/user")).unwrap();
        assert!(matches!(identify(dir.path()), Err(Error::UnknownOs(_))));
    }

    #[test]
    fn test_find_path_ignores_case() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("WINDOWS/system32/Config")).unwrap();
        let found = find_path(dir.path(), &["Windows", "System32", "config"]).unwrap();
        assert_eq!(found, Some(dir.path().join("WINDOWS/system32/Config")));
        assert_eq!(find_path(dir.path(), &["Windows", "Fonts"]).unwrap(), None);
    }

    #[test]
    fn test_release_name_fallbacks() {
        assert_eq!(release_name("NAME=Debian\nVERSION_ID=12\n"), "Debian 12");
        assert_eq!(release_name("ID=arch\n"), "Linux");
    }

    #[test]
    fn test_guest_hints() {
        let seven = WindowsVersion {
            product: Some("Windows 7 Professional".into()),
            display_version: None,
            build: Some(7601),
            build_lab: Some("7601.24214.x86fre.win7sp1_ldr".into()),
        };
        assert_eq!(seven.guest_hint(false), "windows7");
        assert_eq!(seven.describe(), "Windows 7 Professional (build 7601)");
        assert_eq!(WindowsVersion::default().describe(), "Windows (unknown version)");
    }
}
