//! Recording collaborators for tests

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use unseal_core::{
    CryptMapper, Error, KeyMaterial, MapRequest, Mounter, ProvisionRequest, Provisioner, Result, VolumeGroups,
};

#[derive(Default)]
pub struct FakeMapper {
    events: Mutex<Vec<String>>,
    pub requests: Mutex<Vec<MapRequest>>,
}

impl FakeMapper {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl CryptMapper for FakeMapper {
    fn map(&self, request: &MapRequest) -> Result<PathBuf> {
        let material = match request.key {
            KeyMaterial::Plain => "Plain",
            KeyMaterial::BitLocker { .. } => "BitLocker",
            KeyMaterial::Luks { .. } => "Luks",
            KeyMaterial::VeraCrypt { .. } => "VeraCrypt",
        };
        self.events
            .lock()
            .unwrap()
            .push(format!("map {} {}", request.volume_index, material));
        self.requests.lock().unwrap().push(request.clone());
        Ok(PathBuf::from(format!("/dev/fake{}", request.volume_index)))
    }

    fn unmap(&self, device: &Path) -> Result<()> {
        self.events.lock().unwrap().push(format!("unmap {}", device.display()));
        Ok(())
    }
}

/// Mounts every device onto a prepared directory
pub struct FakeMounter {
    default_root: Option<PathBuf>,
    roots: HashMap<PathBuf, PathBuf>,
    events: Mutex<Vec<String>>,
}

impl FakeMounter {
    pub fn new(root: PathBuf) -> Self {
        Self {
            default_root: Some(root),
            roots: HashMap::new(),
            events: Mutex::new(Vec::new()),
        }
    }

    /// A mounter whose every mount fails
    pub fn failing() -> Self {
        Self {
            default_root: None,
            roots: HashMap::new(),
            events: Mutex::new(Vec::new()),
        }
    }

    /// Mount `/dev/fake<index>` onto `root`
    pub fn with_root(self, index: usize, root: PathBuf) -> Self {
        self.with_device(format!("/dev/fake{}", index), root)
    }

    /// Mount `device` onto `root`
    pub fn with_device(mut self, device: impl Into<PathBuf>, root: PathBuf) -> Self {
        self.roots.insert(device.into(), root);
        self
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl Mounter for FakeMounter {
    fn mount(&self, device: &Path) -> Result<PathBuf> {
        self.events.lock().unwrap().push(format!("mount {}", device.display()));
        self.roots
            .get(device)
            .or(self.default_root.as_ref())
            .cloned()
            .ok_or_else(|| Error::custom("wrong fs type, bad superblock"))
    }

    fn unmount(&self, _root: &Path) -> Result<()> {
        self.events.lock().unwrap().push("unmount".to_string());
        Ok(())
    }
}

/// Volume groups keyed by the physical volume device
#[derive(Default)]
pub struct FakeVolumeGroups {
    groups: HashMap<PathBuf, Vec<PathBuf>>,
    events: Mutex<Vec<String>>,
}

impl FakeVolumeGroups {
    /// Treat `device` as a physical volume holding `logical_volumes`
    pub fn with_group(mut self, device: &str, logical_volumes: &[&str]) -> Self {
        self.groups
            .insert(PathBuf::from(device), logical_volumes.iter().map(PathBuf::from).collect());
        self
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl VolumeGroups for FakeVolumeGroups {
    fn activate(&self, device: &Path) -> Result<Option<Vec<PathBuf>>> {
        self.events.lock().unwrap().push(format!("activate {}", device.display()));
        Ok(self.groups.get(device).cloned())
    }

    fn deactivate(&self, device: &Path) -> Result<()> {
        self.events.lock().unwrap().push(format!("deactivate {}", device.display()));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeProvisioner {
    pub requests: Mutex<Vec<ProvisionRequest>>,
}

impl Provisioner for FakeProvisioner {
    fn provision(&self, request: &ProvisionRequest) -> Result<()> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(())
    }
}
