//! Master-key resolution
//!
//! Every candidate is verified against the volume's own metadata; nothing is
//! mounted until a candidate passes. Candidates are tried on a bounded
//! rayon pool; the lowest verified index wins regardless of which worker
//! finishes first.

use crate::bitlocker::{BitLockerHeader, EncryptionMethod};
use crate::keys::{CandidateKey, CandidateSet, KeyForm, Provenance};
use crate::luks::{KeyslotArea, LuksHeader};
use crate::veracrypt::{VeraCryptHeader, VeraCryptKdf, VeraCryptLayout};
use crate::volume::{Seal, Volume};
use serde::Serialize;
use std::fmt;
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use std::thread;
use tracing::{debug, info};
use unseal_core::{fingerprint, Error, KeyMaterial, ReadSeek, Result, VolumeKind};

/// Upper bound of the default worker count
const MAX_DEFAULT_WORKERS: usize = 8;

/// Resolver tuning
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Parallel verification workers; 1 verifies serially
    pub workers: usize,
    /// Header key derivations tried for VeraCrypt passphrases
    pub veracrypt_kdfs: Vec<VeraCryptKdf>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            veracrypt_kdfs: VeraCryptKdf::defaults(),
        }
    }
}

/// Available parallelism, capped
pub fn default_workers() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(MAX_DEFAULT_WORKERS)
}

/// How the winning key was proven correct
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum VerificationMethod {
    /// Suspended BitLocker protection, no candidate needed
    BitLockerClearKey,
    /// Candidate decrypted the relocated boot sector
    BitLockerFvek,
    /// Candidate authenticated the wrapped FVEK
    BitLockerVmk,
    /// Candidate matched the LUKS master-key digest
    LuksDigest,
    /// Passphrase opened a LUKS key slot
    LuksKeyslot { slot: usize },
    VeraCryptHeaderKey { layout: VeraCryptLayout },
    VeraCryptMasterKey { layout: VeraCryptLayout },
    VeraCryptPassphrase {
        layout: VeraCryptLayout,
        hash: String,
        iterations: u32,
    },
}

impl fmt::Display for VerificationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerificationMethod::BitLockerClearKey => f.write_str("BitLocker clear key"),
            VerificationMethod::BitLockerFvek => f.write_str("BitLocker FVEK boot sector check"),
            VerificationMethod::BitLockerVmk => f.write_str("BitLocker VMK unwrap"),
            VerificationMethod::LuksDigest => f.write_str("LUKS master key digest"),
            VerificationMethod::LuksKeyslot { slot } => write!(f, "LUKS key slot {}", slot),
            VerificationMethod::VeraCryptHeaderKey { layout } => write!(f, "VeraCrypt {:?} header key", layout),
            VerificationMethod::VeraCryptMasterKey { layout } => write!(f, "VeraCrypt {:?} master key", layout),
            VerificationMethod::VeraCryptPassphrase {
                layout,
                hash,
                iterations,
            } => write!(f, "VeraCrypt {:?} passphrase ({}, {} iterations)", layout, hash, iterations),
        }
    }
}

/// The verified key of one volume
#[derive(Clone)]
pub struct MasterKeyResult {
    pub volume_index: usize,
    pub scheme: VolumeKind,
    /// Key that decrypts the data area
    pub key: Vec<u8>,
    /// Parameters for the crypt mapper
    pub material: KeyMaterial,
    pub method: VerificationMethod,
    /// Index of the winning candidate; `None` for clear keys
    pub candidate: Option<usize>,
    pub provenance: Option<Provenance>,
}

impl MasterKeyResult {
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.key)
    }
}

impl fmt::Debug for MasterKeyResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKeyResult")
            .field("volume_index", &self.volume_index)
            .field("scheme", &self.scheme)
            .field("key", &self.fingerprint())
            .field("method", &self.method)
            .field("candidate", &self.candidate)
            .field("provenance", &self.provenance)
            .finish()
    }
}

/// Outcome of one successful verification
#[derive(Debug)]
struct Verified {
    key: Vec<u8>,
    material: KeyMaterial,
    method: VerificationMethod,
}

/// Find the master key of an encrypted volume
///
/// # Errors
///
/// - [`Error::UnsupportedScheme`] for `Unknown` volumes
/// - [`Error::InvalidOperation`] for plaintext volumes
/// - [`Error::NoMatchingKey`] when no candidate verifies
pub fn resolve(
    volume: &Volume,
    candidates: &CandidateSet,
    source: &mut dyn ReadSeek,
    config: &ResolverConfig,
) -> Result<MasterKeyResult> {
    let index = volume.index();
    let scheme = volume.kind();

    let found = match volume.seal() {
        Seal::Unknown { hint } => {
            return Err(Error::unsupported_scheme(format!("volume {}: {}", index, hint)));
        }
        Seal::PlaintextNtfs | Seal::PlaintextExt(_) | Seal::Lvm { .. } => {
            return Err(Error::invalid_operation(format!(
                "volume {} is plaintext, no key to resolve",
                index
            )));
        }
        Seal::BitLocker(header) => {
            if let Some((algorithm, fvek)) = header.clear_key_fvek() {
                info!("Volume {} has a clear key protector", index);
                return Ok(MasterKeyResult {
                    volume_index: index,
                    scheme,
                    material: bitlocker_material(header, algorithm, &fvek),
                    key: fvek,
                    method: VerificationMethod::BitLockerClearKey,
                    candidate: None,
                    provenance: None,
                });
            }
            search(candidates.as_slice(), config.workers, |c| verify_bitlocker(header, c))?
        }
        Seal::Luks(header) => {
            let areas = if candidates.has_passphrases() {
                header.read_keyslot_areas(source, volume.zone())?
            } else {
                Vec::new()
            };
            search(candidates.as_slice(), config.workers, |c| verify_luks(header, &areas, c))?
        }
        Seal::VeraCrypt(header) => search(candidates.as_slice(), config.workers, |c| {
            verify_veracrypt(header, &config.veracrypt_kdfs, c)
        })?,
    };

    let Some((candidate, verified)) = found else {
        info!("Volume {}: none of {} candidates verified", index, candidates.len());
        return Err(Error::no_matching_key(scheme.name(), candidates.len()));
    };

    let provenance = candidates.get(candidate).map(|c| c.provenance().clone());
    info!(
        "Volume {} unlocked by candidate {} ({}) via {}, key {}",
        index,
        candidate,
        provenance.as_ref().map(|p| p.to_string()).unwrap_or_default(),
        verified.method,
        fingerprint(&verified.key)
    );

    Ok(MasterKeyResult {
        volume_index: index,
        scheme,
        key: verified.key,
        material: verified.material,
        method: verified.method,
        candidate: Some(candidate),
        provenance,
    })
}

/// Verify candidates in parallel and return the lowest verified index
///
/// Candidates above an already verified index are abandoned.
fn search<F>(candidates: &[CandidateKey], workers: usize, verify: F) -> Result<Option<(usize, Verified)>>
where
    F: Fn(&CandidateKey) -> Option<Verified> + Sync,
{
    if candidates.is_empty() {
        return Ok(None);
    }
    let pool = ThreadPoolBuilder::new()
        .num_threads(workers.clamp(1, candidates.len()))
        .build()
        .map_err(|e| Error::custom(format!("resolver thread pool: {}", e)))?;
    Ok(pool.install(|| {
        candidates
            .par_iter()
            .enumerate()
            .find_map_first(|(i, candidate)| verify(candidate).map(|verified| (i, verified)))
    }))
}

fn bitlocker_material(header: &BitLockerHeader, algorithm: u16, fvek: &[u8]) -> KeyMaterial {
    let method = EncryptionMethod::from_code(algorithm)
        .map(|m| m.code())
        .unwrap_or(header.method_code);
    KeyMaterial::BitLocker {
        method,
        fvek: fvek.to_vec(),
    }
}

fn verify_bitlocker(header: &BitLockerHeader, candidate: &CandidateKey) -> Option<Verified> {
    if candidate.form() != KeyForm::Raw {
        return None;
    }
    let bytes = candidate.bytes();

    if header.verify_fvek(bytes) {
        return Some(Verified {
            key: bytes.to_vec(),
            material: bitlocker_material(header, header.method_code, bytes),
            method: VerificationMethod::BitLockerFvek,
        });
    }

    let (algorithm, fvek) = header.unwrap_fvek(bytes)?;
    Some(Verified {
        material: bitlocker_material(header, algorithm, &fvek),
        key: fvek,
        method: VerificationMethod::BitLockerVmk,
    })
}

fn verify_luks(header: &LuksHeader, areas: &[KeyslotArea], candidate: &CandidateKey) -> Option<Verified> {
    let bytes = candidate.bytes();
    match candidate.form() {
        KeyForm::Raw => header.verify_master_key(bytes).then(|| Verified {
            key: bytes.to_vec(),
            material: KeyMaterial::Luks {
                master_key: bytes.to_vec(),
            },
            method: VerificationMethod::LuksDigest,
        }),
        KeyForm::Passphrase => areas.iter().find_map(|area| {
            let master_key = header.unlock_keyslot(area, bytes)?;
            debug!("Passphrase opened LUKS key slot {}", area.spec.slot);
            Some(Verified {
                material: KeyMaterial::Luks {
                    master_key: master_key.clone(),
                },
                key: master_key,
                method: VerificationMethod::LuksKeyslot { slot: area.spec.slot },
            })
        }),
    }
}

fn verify_veracrypt(header: &VeraCryptHeader, kdfs: &[VeraCryptKdf], candidate: &CandidateKey) -> Option<Verified> {
    let bytes = candidate.bytes();
    let (unlock, method) = match candidate.form() {
        KeyForm::Raw => {
            if let Some(unlock) = header.try_header_key(bytes) {
                let layout = unlock.layout;
                (unlock, VerificationMethod::VeraCryptHeaderKey { layout })
            } else {
                let unlock = header.try_master_key(bytes)?;
                let layout = unlock.layout;
                (unlock, VerificationMethod::VeraCryptMasterKey { layout })
            }
        }
        KeyForm::Passphrase => {
            let (unlock, kdf) = header.try_passphrase(bytes, kdfs)?;
            let method = VerificationMethod::VeraCryptPassphrase {
                layout: unlock.layout,
                hash: format!("{:?}", kdf.hash).to_lowercase(),
                iterations: kdf.iterations,
            };
            (unlock, method)
        }
    };

    let master_key = match &unlock.header {
        Some(decrypted) => decrypted.master_key.clone(),
        None => bytes.to_vec(),
    };
    Some(Verified {
        material: header.key_material(&unlock, &master_key),
        key: master_key,
        method,
    })
}
