//! Unseal CLI - FDE bypass and credential reset for disk images
//!
//! Inspects partition layouts, resolves full-disk-encryption master keys
//! from supplied candidates, and resets every local account password on
//! the operating systems it finds.

mod host;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use host::{HostMapper, HostMounter, HostVolumeGroups, ManifestProvisioner};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use unseal_pipeline::{DiskImage, ImageConfig};
use unseal_runner::{Orchestrator, RunConfig, Verification, DEFAULT_PLACEHOLDER};
use unseal_seals::{detect, resolve, CandidateSet};

#[derive(Parser)]
#[command(name = "unseal")]
#[command(about = "Unlock encrypted disk images and reset local account passwords")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log filter
    #[arg(long, env = "RUST_LOG", default_value = "info", global = true)]
    log_level: String,

    /// Raise verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// List partitions and detected volume kinds
    Inspect {
        image: PathBuf,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Resolve master keys without mounting anything
    Resolve {
        image: PathBuf,

        #[command(flatten)]
        keys: KeyArgs,

        /// Skip a partition by index
        #[arg(long = "exclude", value_name = "INDEX")]
        excluded: Vec<usize>,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Unlock, mount and reset credentials on every volume
    Run {
        image: PathBuf,

        #[command(flatten)]
        keys: KeyArgs,

        /// Skip a partition by index
        #[arg(long = "exclude", value_name = "INDEX")]
        excluded: Vec<usize>,

        /// Password every account is reset to
        #[arg(long, env = "UNSEAL_PLACEHOLDER", default_value = DEFAULT_PLACEHOLDER)]
        placeholder_password: String,

        /// Only identify operating systems, leave credentials alone
        #[arg(long)]
        no_patch: bool,

        /// Write the JSON run report here
        #[arg(long, value_name = "FILE")]
        report: Option<PathBuf>,

        /// Write a VM manifest into this directory after the run
        #[arg(long, value_name = "DIR")]
        manifest_dir: Option<PathBuf>,
    },
}

/// Candidate key sources shared by `resolve` and `run`
#[derive(Args)]
struct KeyArgs {
    /// Hex master key candidate (repeatable)
    #[arg(long = "master-key", value_name = "HEX")]
    master_keys: Vec<String>,

    /// File with one hex master key per line
    #[arg(long, value_name = "PATH")]
    master_keys_file: Option<PathBuf>,

    /// Passphrase candidate for LUKS or VeraCrypt (repeatable)
    #[arg(long = "passphrase", value_name = "TEXT")]
    passphrases: Vec<String>,

    /// Do not try concatenated half-key pairs
    #[arg(long)]
    no_xts_combine: bool,

    /// Resolver worker threads
    #[arg(long)]
    workers: Option<usize>,

    /// Read the image through a file stream instead of a memory map
    #[arg(long)]
    no_mmap: bool,
}

impl KeyArgs {
    fn candidates(&self) -> Result<CandidateSet> {
        let mut set = CandidateSet::new();
        for (i, key) in self.master_keys.iter().enumerate() {
            set.add_hex(key, i + 1)?;
        }
        if let Some(path) = &self.master_keys_file {
            set.load_key_file(path)
                .with_context(|| format!("Failed to load key file {}", path.display()))?;
        }
        for (i, passphrase) in self.passphrases.iter().enumerate() {
            set.add_passphrase(passphrase, i + 1);
        }
        if !self.no_xts_combine {
            let pairs = set.add_xts_pairs();
            if pairs > 0 {
                info!("Added {} half-key pair candidates", pairs);
            }
        }
        Ok(set)
    }

    fn config(&self, excluded: &[usize]) -> RunConfig {
        let mut config = RunConfig {
            excluded: excluded.iter().copied().collect::<BTreeSet<_>>(),
            use_mmap: !self.no_mmap,
            ..RunConfig::default()
        };
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        config
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => cli.log_level.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Inspect { image, json } => cmd_inspect(image, json),
        Command::Resolve {
            image,
            keys,
            excluded,
            json,
        } => cmd_resolve(image, &keys, &excluded, json),
        Command::Run {
            image,
            keys,
            excluded,
            placeholder_password,
            no_patch,
            report,
            manifest_dir,
        } => {
            let mut config = keys.config(&excluded);
            config.placeholder_password = placeholder_password;
            config.patch_credentials = !no_patch;
            cmd_run(image, &keys, config, report, manifest_dir)
        }
    }
}

fn open(image: &Path, use_mmap: bool) -> Result<DiskImage> {
    DiskImage::open(image, &ImageConfig { use_mmap })
        .with_context(|| format!("Failed to open {}", image.display()))
}

fn cmd_inspect(image: PathBuf, json: bool) -> Result<()> {
    let mut disk = open(&image, true)?;
    let length = disk.length();
    let map = unseal_zones::inspect(disk.content(), length)?;

    let mut rows = Vec::new();
    for zone in &map.zones {
        let volume = detect(disk.content(), zone)?;
        rows.push((zone.clone(), volume));
    }

    if json {
        let volumes: Vec<_> = rows
            .iter()
            .map(|(zone, volume)| {
                serde_json::json!({
                    "zone": zone,
                    "kind": volume.kind(),
                    "description": volume.describe(),
                })
            })
            .collect();
        let out = serde_json::json!({
            "image": image,
            "scheme": map.scheme,
            "sector_size": map.sector_size,
            "volumes": volumes,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("=== {} ===", image.display());
    println!("Table:       {} ({}-byte sectors)", map.scheme, map.sector_size);
    println!("Partitions:  {}", map.zones.len());
    println!();
    println!("{:<6} {:>14} {:>14}  {:<24} VOLUME", "INDEX", "OFFSET", "LENGTH", "TYPE");
    for (zone, volume) in &rows {
        println!(
            "{:<6} {:>14} {:>14}  {:<24} {}",
            zone.index,
            zone.offset,
            zone.length,
            zone.zone_type,
            volume.describe()
        );
    }
    Ok(())
}

fn cmd_resolve(image: PathBuf, keys: &KeyArgs, excluded: &[usize], json: bool) -> Result<()> {
    let candidates = keys.candidates()?;
    let config = keys.config(excluded);
    let mut disk = open(&image, config.use_mmap)?;
    let length = disk.length();
    let map = unseal_zones::inspect(disk.content(), length)?;

    let mut results = Vec::new();
    for zone in map.zones.iter().filter(|z| !config.is_excluded(z.index)) {
        let volume = detect(disk.content(), zone)?;
        if !volume.kind().is_encrypted() {
            continue;
        }
        let outcome = resolve(&volume, &candidates, disk.content(), &config.resolver())
            .map(|key| Verification::from(&key));
        match &outcome {
            Ok(found) if !json => println!(
                "volume {}: {} unlocked via {} ({}, key {})",
                zone.index,
                volume.kind(),
                found.method,
                found
                    .provenance
                    .as_ref()
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "volume metadata".to_string()),
                found.key_fingerprint
            ),
            Err(e) if !json => println!("volume {}: {}", zone.index, e),
            _ => {}
        }
        results.push(serde_json::json!({
            "volume_index": zone.index,
            "kind": volume.kind(),
            "verification": outcome.as_ref().ok(),
            "error": outcome.as_ref().err().map(|e| e.to_string()),
        }));
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else if results.is_empty() {
        println!("No encrypted volumes found");
    }
    Ok(())
}

fn cmd_run(
    image: PathBuf,
    keys: &KeyArgs,
    config: RunConfig,
    report: Option<PathBuf>,
    manifest_dir: Option<PathBuf>,
) -> Result<()> {
    let candidates = keys.candidates()?;
    let mut orchestrator = Orchestrator::new(
        config,
        Box::new(HostMapper::new(&image)),
        Box::new(HostMounter),
    )
    .with_volume_groups(Box::new(HostVolumeGroups::new()));
    if let Some(dir) = manifest_dir {
        orchestrator = orchestrator.with_provisioner(Box::new(ManifestProvisioner::new(dir)));
    }

    let summary = orchestrator
        .run(&image, &candidates)
        .with_context(|| format!("Failed to process {}", image.display()))?;
    println!("{}", summary);

    if let Some(path) = report {
        fs::write(&path, summary.to_json()?)
            .with_context(|| format!("Failed to write report {}", path.display()))?;
        info!("Report written to {}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_flags() {
        let cli = Cli::try_parse_from([
            "unseal",
            "run",
            "disk.img",
            "--master-key",
            "00112233445566778899aabbccddeeff",
            "--master-key",
            "ffeeddccbbaa99887766554433221100",
            "--exclude",
            "2",
            "--placeholder-password",
            "hunter2",
            "--workers",
            "3",
        ])
        .unwrap();
        let Command::Run {
            keys,
            excluded,
            placeholder_password,
            ..
        } = cli.command
        else {
            panic!("expected run");
        };
        assert_eq!(placeholder_password, "hunter2");
        let config = keys.config(&excluded);
        assert!(config.is_excluded(2));
        assert_eq!(config.workers, 3);

        let candidates = keys.candidates().unwrap();
        // two originals then both ordered pairs
        assert_eq!(candidates.len(), 4);
    }

    #[test]
    fn test_no_xts_combine() {
        let cli = Cli::try_parse_from([
            "unseal",
            "resolve",
            "disk.img",
            "--master-key",
            "00112233445566778899aabbccddeeff",
            "--master-key",
            "ffeeddccbbaa99887766554433221100",
            "--no-xts-combine",
        ])
        .unwrap();
        let Command::Resolve { keys, .. } = cli.command else {
            panic!("expected resolve");
        };
        assert_eq!(keys.candidates().unwrap().len(), 2);
    }

    #[test]
    fn test_bad_hex_rejected() {
        let cli = Cli::try_parse_from(["unseal", "resolve", "disk.img", "--master-key", "xyz"]).unwrap();
        let Command::Resolve { keys, .. } = cli.command else {
            panic!("expected resolve");
        };
        assert!(keys.candidates().is_err());
    }
}
