//! Per-volume results and the run summary

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use unseal_core::{Error, ErrorKind, Firmware, VolumeKind};
use unseal_seals::{MasterKeyResult, Provenance, VerificationMethod};
use unseal_territories::{OsProfile, PatchReport};
use unseal_zones::PartitionScheme;

/// Error recorded against one volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&Error> for VolumeError {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// How the volume's key was found, without the key itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verification {
    #[serde(flatten)]
    pub method: VerificationMethod,
    pub candidate: Option<usize>,
    pub provenance: Option<Provenance>,
    pub key_fingerprint: String,
}

impl From<&MasterKeyResult> for Verification {
    fn from(result: &MasterKeyResult) -> Self {
        Self {
            method: result.method.clone(),
            candidate: result.candidate,
            provenance: result.provenance.clone(),
            key_fingerprint: result.fingerprint(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedAccount {
    pub account: String,
    pub reason: String,
}

/// Outcome for one volume
#[derive(Debug, Clone, Serialize)]
pub struct VolumeReport {
    pub volume_index: usize,
    pub kind: VolumeKind,
    pub zone_type: String,
    pub offset: u64,
    pub length: u64,
    /// The volume was unlocked (or plaintext) and mounted
    pub bypassed: bool,
    pub patched_accounts: Vec<String>,
    pub skipped_accounts: Vec<SkippedAccount>,
    pub error: Option<VolumeError>,
    /// Detector hint or other context
    pub detail: Option<String>,
    /// Conditions that may undo the credential reset
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub verification: Option<Verification>,
    pub os: Option<OsProfile>,
}

impl VolumeReport {
    pub fn new(volume_index: usize, kind: VolumeKind, zone_type: &str, offset: u64, length: u64) -> Self {
        Self {
            volume_index,
            kind,
            zone_type: zone_type.to_string(),
            offset,
            length,
            bypassed: false,
            patched_accounts: Vec::new(),
            skipped_accounts: Vec::new(),
            error: None,
            detail: None,
            warnings: Vec::new(),
            verification: None,
            os: None,
        }
    }

    pub fn record_error(&mut self, err: &Error) {
        self.error = Some(VolumeError::from(err));
    }

    pub fn record_patch(&mut self, patch: &PatchReport) {
        self.patched_accounts = patch.patched();
        self.skipped_accounts = patch
            .skipped()
            .into_iter()
            .map(|(account, reason)| SkippedAccount { account, reason })
            .collect();
        self.warnings = patch.warnings();
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Everything one run did to an image
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub image: PathBuf,
    pub scheme: PartitionScheme,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub volumes: Vec<VolumeReport>,
    /// Zones skipped by configuration
    pub excluded: Vec<usize>,
    /// Guest identifier of the first identified OS
    pub os_hint: Option<String>,
    pub firmware: Firmware,
    /// The provisioning collaborator accepted the image
    pub provisioned: bool,
}

impl RunSummary {
    pub fn bypassed(&self) -> impl Iterator<Item = &VolumeReport> {
        self.volumes.iter().filter(|v| v.bypassed)
    }

    pub fn failed(&self) -> impl Iterator<Item = &VolumeReport> {
        self.volumes.iter().filter(|v| !v.succeeded())
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Image: {} ({})", self.image.display(), self.scheme)?;
        for volume in &self.volumes {
            write!(f, "  volume {:<3} {:<10}", volume.volume_index, volume.kind.name())?;
            if let Some(error) = &volume.error {
                write!(f, " skipped: {}: {}", error.kind, error.message)?;
            } else if volume.bypassed {
                write!(f, " bypassed")?;
                if let Some(os) = &volume.os {
                    write!(f, ", {}", os.version)?;
                }
                write!(f, ", {} account(s) reset", volume.patched_accounts.len())?;
                if !volume.skipped_accounts.is_empty() {
                    write!(f, ", {} skipped", volume.skipped_accounts.len())?;
                }
            }
            if let Some(detail) = &volume.detail {
                write!(f, " ({})", detail)?;
            }
            writeln!(f)?;
            for warning in &volume.warnings {
                writeln!(f, "      warning: {}", warning)?;
            }
        }
        for index in &self.excluded {
            writeln!(f, "  volume {:<3} excluded", index)?;
        }
        let firmware = match self.firmware {
            Firmware::Bios => "BIOS",
            Firmware::Efi => "EFI",
        };
        write!(
            f,
            "{} of {} volume(s) bypassed; firmware {}; guest {}",
            self.bypassed().count(),
            self.volumes.len(),
            firmware,
            self.os_hint.as_deref().unwrap_or("unknown")
        )?;
        if self.provisioned {
            write!(f, "; handed off for provisioning")?;
        }
        Ok(())
    }
}
