//! # Unseal Runner
//!
//! Drives a disk image through the whole bypass pipeline: partition
//! inspection, volume detection, master-key resolution, exposure through
//! the host mapper and mounter, OS identification and credential reset.
//!
//! Host integration stays behind the [`unseal_core::CryptMapper`],
//! [`unseal_core::Mounter`] and [`unseal_core::Provisioner`] traits.

pub mod config;
pub mod expose;
pub mod orchestrator;
pub mod report;

#[cfg(test)]
mod testing;

pub use config::{RunConfig, DEFAULT_PLACEHOLDER};
pub use expose::{map_request, Exposer, Mount, MountedFilesystem};
pub use orchestrator::Orchestrator;
pub use report::{RunSummary, SkippedAccount, Verification, VolumeError, VolumeReport};
