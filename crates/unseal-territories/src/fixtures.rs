//! Registry hive writer and mounted-root builders for tests

use crate::credentials::ntlm::{des_wrap, lm_hash, nt_hash};
use crate::credentials::sam::{
    boot_key_checksum, cbc_encrypt, rc4_apply, rc4_boot_key, rc4_hash_key, ACCOUNT_PATH,
    BOOT_KEY_PARTS, BOOT_KEY_PERMUTATION, F_ACB, F_KEY_DATA, LM_PASSWORD, NT_PASSWORD, USERS_PATH,
    V_DATA_BASE, V_LM, V_NAME, V_NT,
};
use crate::hive::types::{BASE_BLOCK_LEN, DATA_INLINE, HBIN_HEADER_LEN, KEY_COMP_NAME, VALUE_COMP_NAME};
use crate::hive::{REG_BINARY, REG_DWORD, REG_SZ};
use std::fs;
use std::path::Path;

/// In-memory key tree
#[derive(Debug, Clone, Default)]
pub struct HiveKey {
    pub name: String,
    pub class: Option<String>,
    pub values: Vec<(String, u32, Vec<u8>)>,
    pub children: Vec<HiveKey>,
}

impl HiveKey {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Child named `name`, created when missing
    pub fn child(&mut self, name: &str) -> &mut HiveKey {
        let index = match self.children.iter().position(|c| c.name == name) {
            Some(index) => index,
            None => {
                self.children.push(HiveKey::new(name));
                self.children.len() - 1
            }
        };
        &mut self.children[index]
    }

    /// Walk or create a backslash-separated path
    pub fn path(&mut self, path: &str) -> &mut HiveKey {
        path.split('\\').fold(self, |key, part| key.child(part))
    }

    pub fn value_binary(&mut self, name: &str, data: Vec<u8>) -> &mut Self {
        self.values.push((name.to_string(), REG_BINARY, data));
        self
    }

    pub fn value_dword(&mut self, name: &str, value: u32) -> &mut Self {
        self.values.push((name.to_string(), REG_DWORD, value.to_le_bytes().to_vec()));
        self
    }

    pub fn value_string(&mut self, name: &str, value: &str) -> &mut Self {
        let mut data: Vec<u8> = value.encode_utf16().flat_map(u16::to_le_bytes).collect();
        data.extend_from_slice(&[0, 0]);
        self.values.push((name.to_string(), REG_SZ, data));
        self
    }
}

/// Serialises a [`HiveKey`] tree into a single-bin regf hive
pub struct HiveBuilder {
    root: HiveKey,
    bin: Vec<u8>,
}

impl HiveBuilder {
    pub fn new(root: HiveKey) -> Self {
        Self { root, bin: vec![0; HBIN_HEADER_LEN] }
    }

    pub fn build(mut self) -> Vec<u8> {
        let root = std::mem::take(&mut self.root);
        let root_cell = self.write_key(&root);

        let bin_len = self.bin.len().div_ceil(4096) * 4096;
        let free = bin_len - self.bin.len();
        let free_cell = self.bin.len();
        self.bin.resize(bin_len, 0);
        if free >= 8 {
            put_u32(&mut self.bin, free_cell, free as u32);
        }
        self.bin[0..4].copy_from_slice(b"hbin");
        put_u32(&mut self.bin, 4, 0);
        put_u32(&mut self.bin, 8, bin_len as u32);

        let mut hive = vec![0u8; BASE_BLOCK_LEN];
        hive[0..4].copy_from_slice(b"regf");
        put_u32(&mut hive, 4, 1);
        put_u32(&mut hive, 8, 1);
        put_u32(&mut hive, 20, 1);
        put_u32(&mut hive, 24, 5);
        put_u32(&mut hive, 36, root_cell);
        put_u32(&mut hive, 40, bin_len as u32);
        let checksum = (0..127).fold(0u32, |acc, i| {
            acc ^ u32::from_le_bytes([hive[i * 4], hive[i * 4 + 1], hive[i * 4 + 2], hive[i * 4 + 3]])
        });
        put_u32(&mut hive, 508, checksum);
        hive.extend_from_slice(&self.bin);
        hive
    }

    /// Allocate a cell, returning its offset
    fn alloc(&mut self, payload: &[u8]) -> u32 {
        let cell = self.bin.len();
        let size = (payload.len() + 4).div_ceil(8) * 8;
        self.bin.extend_from_slice(&(-(size as i32)).to_le_bytes());
        self.bin.extend_from_slice(payload);
        self.bin.resize(cell + size, 0);
        cell as u32
    }

    fn write_key(&mut self, key: &HiveKey) -> u32 {
        let mut nk = vec![0u8; 76];
        nk[0..2].copy_from_slice(b"nk");
        nk[2..4].copy_from_slice(&KEY_COMP_NAME.to_le_bytes());
        nk[72..74].copy_from_slice(&(key.name.len() as u16).to_le_bytes());
        nk.extend_from_slice(key.name.as_bytes());
        let cell = self.alloc(&nk);
        let field = cell as usize + 4;

        let children: Vec<u32> = key.children.iter().map(|c| self.write_key(c)).collect();
        let list = if children.is_empty() {
            u32::MAX
        } else {
            let mut lf = Vec::with_capacity(4 + children.len() * 8);
            lf.extend_from_slice(b"lf");
            lf.extend_from_slice(&(children.len() as u16).to_le_bytes());
            for (child, spec) in children.iter().zip(&key.children) {
                lf.extend_from_slice(&child.to_le_bytes());
                let mut hint = [0u8; 4];
                for (h, b) in hint.iter_mut().zip(spec.name.bytes()) {
                    *h = b;
                }
                lf.extend_from_slice(&hint);
            }
            self.alloc(&lf)
        };
        put_u32(&mut self.bin, field + 20, children.len() as u32);
        put_u32(&mut self.bin, field + 28, list);

        let mut value_cells = Vec::new();
        for (name, data_type, data) in &key.values {
            value_cells.push(self.write_value(name, *data_type, data));
        }
        let values = if value_cells.is_empty() {
            u32::MAX
        } else {
            let list: Vec<u8> = value_cells.iter().flat_map(|c| c.to_le_bytes()).collect();
            self.alloc(&list)
        };
        put_u32(&mut self.bin, field + 36, value_cells.len() as u32);
        put_u32(&mut self.bin, field + 40, values);

        match &key.class {
            Some(class) => {
                let utf16: Vec<u8> = class.encode_utf16().flat_map(u16::to_le_bytes).collect();
                let class_cell = self.alloc(&utf16);
                put_u32(&mut self.bin, field + 48, class_cell);
                self.bin[field + 74..field + 76].copy_from_slice(&(utf16.len() as u16).to_le_bytes());
            }
            None => put_u32(&mut self.bin, field + 48, u32::MAX),
        }
        cell
    }

    fn write_value(&mut self, name: &str, data_type: u32, data: &[u8]) -> u32 {
        let mut vk = vec![0u8; 20];
        vk[0..2].copy_from_slice(b"vk");
        vk[2..4].copy_from_slice(&(name.len() as u16).to_le_bytes());
        if data.len() <= 4 {
            vk[4..8].copy_from_slice(&(data.len() as u32 | DATA_INLINE).to_le_bytes());
            vk[8..8 + data.len()].copy_from_slice(data);
        } else {
            let data_cell = self.alloc(data);
            vk[4..8].copy_from_slice(&(data.len() as u32).to_le_bytes());
            vk[8..12].copy_from_slice(&data_cell.to_le_bytes());
        }
        vk[12..16].copy_from_slice(&data_type.to_le_bytes());
        vk[16..18].copy_from_slice(&VALUE_COMP_NAME.to_le_bytes());
        vk.extend_from_slice(name.as_bytes());
        self.alloc(&vk)
    }
}

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Encryption revision of the SAM hashed boot key and user hashes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamKeyRevision {
    /// Windows before 10 1607
    Rc4,
    /// Windows 10 1607 and later
    Aes,
}

#[derive(Debug, Clone)]
pub struct SamUserSpec {
    pub rid: u32,
    pub name: String,
    pub password: Option<String>,
    pub disabled: bool,
}

impl SamUserSpec {
    pub fn new(rid: u32, name: &str, password: Option<&str>) -> Self {
        Self {
            rid,
            name: name.to_string(),
            password: password.map(str::to_string),
            disabled: false,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }
}

/// SAM/SYSTEM pair with known boot key and passwords
#[derive(Debug, Clone)]
pub struct SamFixture {
    pub revision: SamKeyRevision,
    pub boot_key: [u8; 16],
    pub hashed_boot_key: [u8; 16],
    pub users: Vec<SamUserSpec>,
}

impl SamFixture {
    /// Administrator with a password, a disabled Guest with one, and a
    /// disabled account without any hash
    pub fn new(revision: SamKeyRevision) -> Self {
        Self {
            revision,
            boot_key: *b"\x3b\x1e\x5a\x90\x17\xc4\x62\xde\x05\xa8\x4f\x31\xe9\x7d\x26\xbb",
            hashed_boot_key: *b"\x8d\x02\x6f\xe4\x51\xb9\x3a\x77\xc0\x1d\x95\x48\xae\x63\xf2\x0c",
            users: vec![
                SamUserSpec::new(500, "Administrator", Some("Secret#1")),
                SamUserSpec::new(501, "Guest", Some("guest")).disabled(),
                SamUserSpec::new(503, "DefaultAccount", None).disabled(),
            ],
        }
    }

    /// `(SAM, SYSTEM)` hive bytes
    pub fn build(&self) -> (Vec<u8>, Vec<u8>) {
        (self.sam_hive(), self.system_hive())
    }

    pub fn system_hive(&self) -> Vec<u8> {
        let mut root = HiveKey::new("ROOT");
        root.child("Select").value_dword("Current", 1).value_dword("Default", 1);
        let lsa = root.path("ControlSet001\\Control\\Lsa");
        let mut scrambled = [0u8; 16];
        for (i, &from) in BOOT_KEY_PERMUTATION.iter().enumerate() {
            scrambled[from] = self.boot_key[i];
        }
        for (i, part) in BOOT_KEY_PARTS.iter().enumerate() {
            lsa.child(part).class = Some(hex::encode(&scrambled[i * 4..i * 4 + 4]));
        }
        HiveBuilder::new(root).build()
    }

    pub fn sam_hive(&self) -> Vec<u8> {
        let mut root = HiveKey::new("ROOT");
        root.path(ACCOUNT_PATH).value_binary("F", self.account_f());
        let users = root.path(USERS_PATH);
        users.child("Names");
        for user in &self.users {
            users
                .child(&format!("{:08X}", user.rid))
                .value_binary("F", user_f(user.disabled))
                .value_binary("V", self.user_v(user));
        }
        HiveBuilder::new(root).build()
    }

    fn account_f(&self) -> Vec<u8> {
        let mut f = vec![0u8; F_KEY_DATA];
        match self.revision {
            SamKeyRevision::Rc4 => {
                let salt = [0x5Au8; 16];
                let mut key = [0u8; 32];
                key[..16].copy_from_slice(&self.hashed_boot_key);
                key[16..].copy_from_slice(&boot_key_checksum(&self.hashed_boot_key));
                rc4_apply(&rc4_boot_key(&salt, &self.boot_key), &mut key).unwrap();
                f.extend_from_slice(&1u32.to_le_bytes());
                f.extend_from_slice(&0x28u32.to_le_bytes());
                f.extend_from_slice(&salt);
                f.extend_from_slice(&key);
                f.extend_from_slice(&[0u8; 8]);
            }
            SamKeyRevision::Aes => {
                let iv = [0xA5u8; 16];
                let mut data = [0x10u8; 32];
                data[..16].copy_from_slice(&self.hashed_boot_key);
                cbc_encrypt(&self.boot_key, &iv, &mut data).unwrap();
                f.extend_from_slice(&2u32.to_le_bytes());
                f.extend_from_slice(&0x38u32.to_le_bytes());
                f.extend_from_slice(&16u32.to_le_bytes());
                f.extend_from_slice(&32u32.to_le_bytes());
                f.extend_from_slice(&iv);
                f.extend_from_slice(&data);
            }
        }
        f
    }

    fn user_v(&self, user: &SamUserSpec) -> Vec<u8> {
        let mut header = vec![0u8; V_DATA_BASE];
        let mut data = Vec::new();
        let mut place = |header: &mut Vec<u8>, slot: usize, bytes: &[u8]| {
            put_u32(header, slot, data.len() as u32);
            put_u32(header, slot + 4, bytes.len() as u32);
            data.extend_from_slice(bytes);
            data.resize(data.len().div_ceil(4) * 4, 0);
        };

        let name: Vec<u8> = user.name.encode_utf16().flat_map(u16::to_le_bytes).collect();
        place(&mut header, V_NAME, &name);
        let lm = user.password.as_deref().and_then(lm_hash);
        let nt = user.password.as_deref().map(nt_hash);
        place(&mut header, V_LM, &self.hash_entry(user.rid, lm, LM_PASSWORD, 0x11));
        place(&mut header, V_NT, &self.hash_entry(user.rid, nt, NT_PASSWORD, 0x22));
        header.extend_from_slice(&data);
        header
    }

    fn hash_entry(&self, rid: u32, hash: Option<[u8; 16]>, constant: &[u8], salt_byte: u8) -> Vec<u8> {
        let obfuscated = hash.map(|h| des_wrap(&h, rid));
        match self.revision {
            SamKeyRevision::Rc4 => {
                let mut entry = vec![0, 0, 1, 0];
                if let Some(mut data) = obfuscated {
                    rc4_apply(&rc4_hash_key(&self.hashed_boot_key, rid, constant), &mut data).unwrap();
                    entry.extend_from_slice(&data);
                }
                entry
            }
            SamKeyRevision::Aes => {
                let salt = [salt_byte ^ rid as u8; 16];
                let mut entry = vec![0, 0, 2, 0];
                entry.extend_from_slice(&0x10u32.to_le_bytes());
                entry.extend_from_slice(&salt);
                if let Some(obfuscated) = obfuscated {
                    let mut data = [0x10u8; 32];
                    data[..16].copy_from_slice(&obfuscated);
                    cbc_encrypt(&self.hashed_boot_key, &salt, &mut data).unwrap();
                    entry.extend_from_slice(&data);
                }
                entry
            }
        }
    }
}

fn user_f(disabled: bool) -> Vec<u8> {
    let mut f = vec![0u8; 0x50];
    let acb: u16 = if disabled { 0x0011 } else { 0x0010 };
    f[F_ACB..F_ACB + 2].copy_from_slice(&acb.to_le_bytes());
    f
}

/// SOFTWARE hive describing Windows 11 Pro 23H2 on amd64
pub fn software_hive() -> Vec<u8> {
    let mut root = HiveKey::new("ROOT");
    root.path("Microsoft\\Windows NT\\CurrentVersion")
        .value_string("ProductName", "Windows 10 Pro")
        .value_string("CurrentBuildNumber", "22631")
        .value_string("DisplayVersion", "23H2")
        .value_string("BuildLabEx", "22621.1.amd64fre.ni_release.220506-1250");
    HiveBuilder::new(root).build()
}

/// Lay out a Windows system tree under `root`
pub fn windows_root(root: &Path, fixture: &SamFixture) {
    let config = root.join("Windows/System32/config");
    fs::create_dir_all(&config).unwrap();
    fs::create_dir_all(root.join("Windows/SysWOW64")).unwrap();
    let (sam, system) = fixture.build();
    fs::write(config.join("SAM"), sam).unwrap();
    fs::write(config.join("SYSTEM"), system).unwrap();
    fs::write(config.join("SOFTWARE"), software_hive()).unwrap();
}

/// Lay out a Linux system tree under `root`
pub fn linux_root(root: &Path, os_release: &str, shadow: &str) {
    let etc = root.join("etc");
    fs::create_dir_all(&etc).unwrap();
    fs::write(etc.join("os-release"), os_release).unwrap();
    fs::write(etc.join("passwd"), "root:x:0:0:root:/root:/bin/bash\n").unwrap();
    fs::write(etc.join("shadow"), shadow).unwrap();
}
