//! Run configuration

use std::collections::BTreeSet;
use unseal_pipeline::ImageConfig;
use unseal_seals::veracrypt::VeraCryptKdf;
use unseal_seals::{default_workers, ResolverConfig};

/// Password every account is reset to unless configured otherwise
pub const DEFAULT_PLACEHOLDER: &str = "unsealed";

/// Settings for one orchestrated run
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Password written into every credential store
    pub placeholder_password: String,
    /// Zone indices left untouched
    pub excluded: BTreeSet<usize>,
    /// Resolver worker threads
    pub workers: usize,
    /// Memory-map the image when possible
    pub use_mmap: bool,
    /// Reset credentials after mounting; false stops after OS identification
    pub patch_credentials: bool,
    /// Key derivations tried for VeraCrypt passphrases
    pub veracrypt_kdfs: Vec<VeraCryptKdf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            placeholder_password: DEFAULT_PLACEHOLDER.to_string(),
            excluded: BTreeSet::new(),
            workers: default_workers(),
            use_mmap: true,
            patch_credentials: true,
            veracrypt_kdfs: VeraCryptKdf::defaults(),
        }
    }
}

impl RunConfig {
    pub fn resolver(&self) -> ResolverConfig {
        ResolverConfig {
            workers: self.workers.max(1),
            veracrypt_kdfs: self.veracrypt_kdfs.clone(),
        }
    }

    pub fn image(&self) -> ImageConfig {
        ImageConfig { use_mmap: self.use_mmap }
    }

    pub fn is_excluded(&self, index: usize) -> bool {
        self.excluded.contains(&index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RunConfig::default();
        assert_eq!(config.placeholder_password, "unsealed");
        assert!(config.patch_credentials);
        assert!(config.workers >= 1);
        assert_eq!(config.resolver().veracrypt_kdfs.len(), 3);
    }

    #[test]
    fn test_zero_workers_clamped() {
        let config = RunConfig { workers: 0, ..RunConfig::default() };
        assert_eq!(config.resolver().workers, 1);
    }
}
