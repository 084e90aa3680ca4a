//! Host collaborators backed by Linux tooling
//!
//! `losetup` windows the image, `cryptsetup` and `dislocker-fuse` expose
//! decrypted devices, LVM volume groups are switched on with `vgchange`,
//! and `mount`/`umount` attach filesystems on fresh temporary directories. Key material only ever reaches the tools through
//! short-lived temporary files.

use serde::Serialize;
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use unseal_core::{
    CryptMapper, Error, Firmware, KeyMaterial, MapRequest, Mounter, ProvisionRequest, Provisioner, Result,
    VolumeGroups,
};
use uuid::Uuid;

/// Name of the manifest written for the hypervisor tooling
pub const MANIFEST_NAME: &str = "vm-manifest.json";

/// FVEK file layout expected by dislocker: method code then a 512-bit key
const DISLOCKER_KEY_LEN: usize = 64;

const UNMOUNT_ATTEMPTS: usize = 10;
const UNMOUNT_BACKOFF: Duration = Duration::from_millis(500);

/// Run `program` and return its trimmed stdout
fn run<I, S>(program: &str, args: I) -> Result<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let args: Vec<OsString> = args.into_iter().map(|a| a.as_ref().to_os_string()).collect();
    debug!("Running {} {:?}", program, args);
    let output = Command::new(program)
        .args(&args)
        .output()
        .map_err(|e| Error::mount(format!("{}: {}", program, e)))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::mount(format!(
            "{} exited with {}: {}",
            program,
            output.status,
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Run `program` until it succeeds, sleeping between attempts
fn run_retrying(program: &str, args: &[&OsStr]) -> Result<()> {
    let mut attempt = 1;
    loop {
        match run(program, args) {
            Ok(_) => return Ok(()),
            Err(e) if attempt >= UNMOUNT_ATTEMPTS => return Err(e),
            Err(e) => {
                debug!("Attempt {} failed: {}", attempt, e);
                attempt += 1;
                thread::sleep(UNMOUNT_BACKOFF);
            }
        }
    }
}

/// Key bytes in a private temporary file
fn key_file(bytes: &[u8]) -> Result<NamedTempFile> {
    let mut file = NamedTempFile::new()?;
    file.write_all(bytes)?;
    file.flush()?;
    Ok(file)
}

fn dislocker_key(method: u16, fvek: &[u8]) -> Result<Vec<u8>> {
    if fvek.len() > DISLOCKER_KEY_LEN {
        return Err(Error::invalid_key(format!("FVEK of {} bytes is too long", fvek.len())));
    }
    let mut data = Vec::with_capacity(2 + DISLOCKER_KEY_LEN);
    data.extend_from_slice(&method.to_le_bytes());
    data.extend_from_slice(fvek);
    data.resize(2 + DISLOCKER_KEY_LEN, 0);
    Ok(data)
}

/// Fresh directory under the system temp dir
fn scratch_dir(prefix: &str) -> Result<PathBuf> {
    let dir = std::env::temp_dir().join(format!("{}-{}", prefix, Uuid::new_v4().simple()));
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// One piece of host state set up while mapping
#[derive(Debug)]
enum Layer {
    Loop(PathBuf),
    Crypt(String),
    Fuse(PathBuf),
}

impl Layer {
    fn tear_down(&self) -> Result<()> {
        match self {
            Layer::Loop(device) => run("losetup", [OsStr::new("--detach"), device.as_os_str()]).map(drop),
            Layer::Crypt(name) => run("cryptsetup", ["close", name.as_str()]).map(drop),
            Layer::Fuse(dir) => {
                run_retrying("umount", &[dir.as_os_str()])?;
                fs::remove_dir(dir)?;
                Ok(())
            }
        }
    }
}

/// Tear down `layers` innermost first, keeping the first error
fn tear_down(layers: &[Layer]) -> Result<()> {
    let mut first = Ok(());
    for layer in layers.iter().rev() {
        if let Err(e) = layer.tear_down() {
            warn!("Releasing {:?} failed: {}", layer, e);
            if first.is_ok() {
                first = Err(e);
            }
        }
    }
    first
}

/// Maps image regions to block devices
pub struct HostMapper {
    image: PathBuf,
    mappings: Mutex<HashMap<PathBuf, Vec<Layer>>>,
}

impl HostMapper {
    pub fn new(image: &Path) -> Self {
        Self {
            image: image.to_path_buf(),
            mappings: Mutex::new(HashMap::new()),
        }
    }

    fn build(&self, request: &MapRequest, layers: &mut Vec<Layer>) -> Result<PathBuf> {
        let offset = request.offset.to_string();
        let length = request.length.to_string();
        let window = PathBuf::from(run(
            "losetup",
            [
                OsStr::new("--find"),
                OsStr::new("--show"),
                OsStr::new("--offset"),
                OsStr::new(&offset),
                OsStr::new("--sizelimit"),
                OsStr::new(&length),
                self.image.as_os_str(),
            ],
        )?);
        layers.push(Layer::Loop(window.clone()));

        match &request.key {
            KeyMaterial::Plain => Ok(window),
            KeyMaterial::Luks { master_key } => {
                let key = key_file(master_key)?;
                let name = format!("unseal-luks-{}", Uuid::new_v4().simple());
                run(
                    "cryptsetup",
                    [
                        OsStr::new("open"),
                        OsStr::new("--type=luks"),
                        OsStr::new("--master-key-file"),
                        key.path().as_os_str(),
                        window.as_os_str(),
                        OsStr::new(&name),
                    ],
                )?;
                layers.push(Layer::Crypt(name.clone()));
                Ok(Path::new("/dev/mapper").join(name))
            }
            KeyMaterial::VeraCrypt {
                cipher,
                key,
                data_offset_sectors,
                iv_offset_sectors,
            } => {
                let file = key_file(key)?;
                let name = format!("unseal-vc-{}", Uuid::new_v4().simple());
                let key_size = (key.len() * 8).to_string();
                let data_offset = data_offset_sectors.to_string();
                let iv_offset = iv_offset_sectors.to_string();
                run(
                    "cryptsetup",
                    [
                        OsStr::new("open"),
                        OsStr::new("--type=plain"),
                        OsStr::new("--cipher"),
                        OsStr::new(cipher),
                        OsStr::new("--key-file"),
                        file.path().as_os_str(),
                        OsStr::new("--key-size"),
                        OsStr::new(&key_size),
                        OsStr::new("--offset"),
                        OsStr::new(&data_offset),
                        OsStr::new("--skip"),
                        OsStr::new(&iv_offset),
                        window.as_os_str(),
                        OsStr::new(&name),
                    ],
                )?;
                layers.push(Layer::Crypt(name.clone()));
                Ok(Path::new("/dev/mapper").join(name))
            }
            KeyMaterial::BitLocker { method, fvek } => {
                let file = key_file(&dislocker_key(*method, fvek)?)?;
                let dir = scratch_dir("unseal-dislocker")?;
                if let Err(e) = run(
                    "dislocker-fuse",
                    [
                        OsStr::new("--volume"),
                        window.as_os_str(),
                        OsStr::new("--fvek"),
                        file.path().as_os_str(),
                        OsStr::new("--"),
                        dir.as_os_str(),
                    ],
                ) {
                    if let Err(rm) = fs::remove_dir(&dir) {
                        warn!("Removing {} failed: {}", dir.display(), rm);
                    }
                    return Err(e);
                }
                layers.push(Layer::Fuse(dir.clone()));

                let decrypted = dir.join("dislocker-file");
                let device = PathBuf::from(run(
                    "losetup",
                    [OsStr::new("--find"), OsStr::new("--show"), decrypted.as_os_str()],
                )?);
                layers.push(Layer::Loop(device.clone()));
                Ok(device)
            }
        }
    }
}

impl CryptMapper for HostMapper {
    fn map(&self, request: &MapRequest) -> Result<PathBuf> {
        let mut layers = Vec::new();
        match self.build(request, &mut layers) {
            Ok(device) => {
                info!("Volume {} exposed as {}", request.volume_index, device.display());
                self.mappings
                    .lock()
                    .map_err(|_| Error::custom("mapping table poisoned"))?
                    .insert(device.clone(), layers);
                Ok(device)
            }
            Err(e) => {
                if let Err(cleanup) = tear_down(&layers) {
                    warn!("Cleanup after failed mapping failed: {}", cleanup);
                }
                Err(e)
            }
        }
    }

    fn unmap(&self, device: &Path) -> Result<()> {
        let layers = self
            .mappings
            .lock()
            .map_err(|_| Error::custom("mapping table poisoned"))?
            .remove(device)
            .ok_or_else(|| Error::invalid_operation(format!("{} was not mapped here", device.display())))?;
        tear_down(&layers)
    }
}

/// Mounts devices on temporary directories
#[derive(Debug, Default)]
pub struct HostMounter;

impl Mounter for HostMounter {
    fn mount(&self, device: &Path) -> Result<PathBuf> {
        let dir = scratch_dir("unseal-mnt")?;
        let mounted = run(
            "mount",
            [
                OsStr::new("--source"),
                device.as_os_str(),
                OsStr::new("--target"),
                dir.as_os_str(),
                OsStr::new("--types"),
                OsStr::new("auto"),
            ],
        );
        if let Err(e) = mounted {
            if let Err(rm) = fs::remove_dir(&dir) {
                warn!("Removing {} failed: {}", dir.display(), rm);
            }
            return Err(e);
        }
        Ok(dir)
    }

    fn unmount(&self, root: &Path) -> Result<()> {
        run_retrying("umount", &[root.as_os_str()])?;
        fs::remove_dir(root)?;
        Ok(())
    }
}

/// One path per non-empty line of `lvs` output
fn parse_lv_paths(output: &str) -> Vec<PathBuf> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(PathBuf::from)
        .collect()
}

/// Activates LVM volume groups found on mapped devices
#[derive(Debug, Default)]
pub struct HostVolumeGroups {
    /// Physical volume device to the group activated from it
    active: Mutex<HashMap<PathBuf, String>>,
}

impl HostVolumeGroups {
    pub fn new() -> Self {
        Self::default()
    }

    fn group_of(device: &Path) -> Option<String> {
        match run(
            "pvs",
            [
                OsStr::new("--noheadings"),
                OsStr::new("--options"),
                OsStr::new("vg_name"),
                device.as_os_str(),
            ],
        ) {
            Ok(group) if !group.is_empty() => Some(group),
            Ok(_) => {
                debug!("{} is a physical volume outside any volume group", device.display());
                None
            }
            Err(e) => {
                debug!("{} is not a physical volume: {}", device.display(), e);
                None
            }
        }
    }
}

impl VolumeGroups for HostVolumeGroups {
    fn activate(&self, device: &Path) -> Result<Option<Vec<PathBuf>>> {
        let Some(group) = Self::group_of(device) else {
            return Ok(None);
        };
        let mut active = self
            .active
            .lock()
            .map_err(|_| Error::custom("volume group table poisoned"))?;
        if active.values().any(|g| *g == group) {
            return Err(Error::mount(format!(
                "volume group {} on {} is already active from another device",
                group,
                device.display()
            )));
        }

        info!("Activating volume group {} on {}", group, device.display());
        run("vgchange", ["--activate", "y", "--yes", group.as_str()])?;
        let listed = run("lvs", ["--noheadings", "--options", "lv_path", group.as_str()]);
        let logical_volumes = match listed {
            Ok(out) => parse_lv_paths(&out),
            Err(e) => {
                if let Err(off) = run("vgchange", ["--activate", "n", group.as_str()]) {
                    warn!("Deactivating {} failed: {}", group, off);
                }
                return Err(e);
            }
        };
        active.insert(device.to_path_buf(), group);
        Ok(Some(logical_volumes))
    }

    fn deactivate(&self, device: &Path) -> Result<()> {
        let group = self
            .active
            .lock()
            .map_err(|_| Error::custom("volume group table poisoned"))?
            .remove(device)
            .ok_or_else(|| {
                Error::invalid_operation(format!("no volume group was activated from {}", device.display()))
            })?;
        info!("Deactivating volume group {}", group);
        run_retrying("vgchange", &[OsStr::new("--activate"), OsStr::new("n"), OsStr::new(&group)])
    }
}

#[derive(Debug, Serialize)]
struct VmManifest<'a> {
    id: Uuid,
    disk_image: &'a Path,
    disk_format: &'static str,
    guest_os: Option<&'a str>,
    firmware: Firmware,
}

/// Writes a VM manifest next to other provisioning inputs
#[derive(Debug, Clone)]
pub struct ManifestProvisioner {
    dir: PathBuf,
}

impl ManifestProvisioner {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_NAME)
    }
}

impl Provisioner for ManifestProvisioner {
    fn provision(&self, request: &ProvisionRequest) -> Result<()> {
        let manifest = VmManifest {
            id: Uuid::new_v4(),
            disk_image: &request.image,
            disk_format: "raw",
            guest_os: request.guest_os.as_deref(),
            firmware: request.firmware,
        };
        let json = serde_json::to_string_pretty(&manifest)
            .map_err(|e| Error::custom(format!("manifest serialisation failed: {}", e)))?;
        fs::create_dir_all(&self.dir)?;
        let path = self.manifest_path();
        fs::write(&path, json)?;
        info!("VM manifest written to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_dislocker_key_layout() {
        let data = dislocker_key(0x8004, &[0xAB; 32]).unwrap();
        assert_eq!(data.len(), 66);
        assert_eq!(&data[..2], &[0x04, 0x80]);
        assert!(data[2..34].iter().all(|b| *b == 0xAB));
        assert!(data[34..].iter().all(|b| *b == 0));
        assert!(dislocker_key(0x8005, &[0u8; 65]).is_err());
    }

    #[test]
    fn test_key_file_holds_bytes() {
        let file = key_file(b"\x01\x02\x03").unwrap();
        assert_eq!(fs::read(file.path()).unwrap(), vec![1, 2, 3]);
        let path = file.path().to_path_buf();
        drop(file);
        assert!(!path.exists());
    }

    #[test]
    fn test_manifest_written() {
        let dir = TempDir::new().unwrap();
        let provisioner = ManifestProvisioner::new(dir.path().join("vm"));
        provisioner
            .provision(&ProvisionRequest {
                image: PathBuf::from("/images/disk.img"),
                guest_os: Some("windows9-64".into()),
                firmware: Firmware::Efi,
            })
            .unwrap();

        let text = fs::read_to_string(dir.path().join("vm").join(MANIFEST_NAME)).unwrap();
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["disk_image"], "/images/disk.img");
        assert_eq!(json["guest_os"], "windows9-64");
        assert_eq!(json["firmware"], "Efi");
        assert_eq!(json["disk_format"], "raw");
    }

    #[test]
    fn test_unmap_unknown_device() {
        let mapper = HostMapper::new(Path::new("disk.img"));
        let err = mapper.unmap(Path::new("/dev/loop99")).unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
    }

    #[test]
    fn test_lv_paths_parsed() {
        let output = "  /dev/vg0/root\n  /dev/vg0/swap  \n\n";
        assert_eq!(
            parse_lv_paths(output),
            vec![PathBuf::from("/dev/vg0/root"), PathBuf::from("/dev/vg0/swap")]
        );
        assert!(parse_lv_paths("").is_empty());
    }

    #[test]
    fn test_missing_device_is_not_a_physical_volume() {
        let groups = HostVolumeGroups::new();
        let device = std::env::temp_dir().join(format!("unseal-missing-{}", Uuid::new_v4().simple()));
        assert_eq!(groups.activate(&device).unwrap(), None);
        let err = groups.deactivate(&device).unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
    }
}
