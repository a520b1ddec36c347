//! Page pool configuration.
//!
//! Sizing is consulted once, when the pool is built. The memory budget
//! defaults to one eighth of physical memory.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;

/// Environment override for [`PoolConfig::max_memory_mb`].
pub const ENV_MAX_MEMORY_MB: &str = "FSXRPC_ENC_POOL_MAX_MEMORY_MB";

/// Size of the largest bulk RPC payload.
pub const MAX_BRW_SIZE: usize = 1 << 20;

/// Default quiescent period before an untouched pool counts as fully idle.
pub const DEFAULT_QUIESCENT_PERIOD_SECS: u64 = 20;

/// Returns the OS page size, 4096 if it can't be determined.
pub fn os_page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 {
        sz as usize
    } else {
        4096
    }
}

/// Returns physical memory expressed in pages of `page_size` bytes.
pub fn physical_pages(page_size: usize) -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let (pages, os_page) = unsafe {
        (
            libc::sysconf(libc::_SC_PHYS_PAGES),
            libc::sysconf(libc::_SC_PAGESIZE),
        )
    };
    if pages <= 0 || os_page <= 0 || page_size == 0 {
        return 0;
    }
    (pages as u128 * os_page as u128 / page_size as u128) as usize
}

/// Configuration for the bulk encryption page pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Memory budget in MiB; unset, zero or above physical memory means 1/8 of RAM.
    pub max_memory_mb: Option<u64>,
    /// Exact page capacity; takes precedence over `max_memory_mb`.
    pub max_pages: Option<usize>,
    /// Size of one pool page in bytes.
    pub page_size: usize,
    /// Page slots per pool segment (allocation granularity).
    pub pages_per_pool: usize,
    /// Pages in one maximal bulk transfer: the shrink floor and minimum grow batch.
    pub max_brw_pages: usize,
    /// Seconds without access after which the pool is treated as fully idle.
    pub quiescent_period_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let page_size = os_page_size();
        Self {
            max_memory_mb: None,
            max_pages: None,
            page_size,
            pages_per_pool: page_size / std::mem::size_of::<usize>(),
            max_brw_pages: MAX_BRW_SIZE / page_size,
            quiescent_period_secs: DEFAULT_QUIESCENT_PERIOD_SECS,
        }
    }
}

impl PoolConfig {
    /// Loads a configuration from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: PoolConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => return Err(ConfigError::UnsupportedExtension(ext.to_string())),
        };
        config.validate()?;
        debug!(path = %path.display(), "loaded pool config");
        Ok(config)
    }

    /// Defaults with `FSXRPC_ENC_POOL_MAX_MEMORY_MB` applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides()
    }

    /// Applies environment overrides on top of `self`.
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Ok(value) = std::env::var(ENV_MAX_MEMORY_MB) {
            let mb = value.trim().parse::<u64>().map_err(|_| ConfigError::InvalidEnv {
                var: ENV_MAX_MEMORY_MB,
                value: value.clone(),
            })?;
            self.max_memory_mb = Some(mb);
        }
        Ok(self)
    }

    /// Rejects zero or inconsistent sizes.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 || !self.page_size.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "page_size {} must be a non-zero power of two",
                self.page_size
            )));
        }
        if self.pages_per_pool == 0 {
            return Err(ConfigError::Invalid("pages_per_pool must be non-zero".into()));
        }
        if self.max_brw_pages == 0 {
            return Err(ConfigError::Invalid("max_brw_pages must be non-zero".into()));
        }
        if self.max_pages == Some(0) {
            return Err(ConfigError::Invalid("max_pages must be non-zero".into()));
        }
        Ok(())
    }

    /// Pool capacity in pages.
    pub fn resolved_max_pages(&self) -> usize {
        if let Some(pages) = self.max_pages {
            return pages;
        }
        let total = physical_pages(self.page_size);
        let default = (total / 8).max(1);
        match self.max_memory_mb {
            Some(mb) if mb > 0 => {
                let pages = (mb as u128 * (1 << 20) / self.page_size as u128) as usize;
                if pages <= total {
                    pages.max(1)
                } else {
                    default
                }
            }
            _ => default,
        }
    }

    /// Quiescent period as a `Duration`.
    pub fn quiescent_period(&self) -> Duration {
        Duration::from_secs(self.quiescent_period_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::Builder;

    #[test]
    fn test_default_values() {
        let config = PoolConfig::default();
        assert_eq!(config.page_size, os_page_size());
        assert_eq!(
            config.pages_per_pool,
            config.page_size / std::mem::size_of::<usize>()
        );
        assert_eq!(config.max_brw_pages * config.page_size, MAX_BRW_SIZE);
        assert_eq!(config.quiescent_period(), Duration::from_secs(20));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_budget_is_eighth_of_ram() {
        let config = PoolConfig::default();
        let total = physical_pages(config.page_size);
        assert!(total > 0);
        assert_eq!(config.resolved_max_pages(), total / 8);
    }

    #[test]
    fn test_memory_budget_in_mb() {
        let config = PoolConfig {
            max_memory_mb: Some(1),
            page_size: 4096,
            ..PoolConfig::default()
        };
        assert_eq!(config.resolved_max_pages(), 256);
    }

    #[test]
    fn test_oversized_budget_falls_back() {
        let config = PoolConfig {
            max_memory_mb: Some(u64::MAX / (1 << 21)),
            ..PoolConfig::default()
        };
        let total = physical_pages(config.page_size);
        assert_eq!(config.resolved_max_pages(), total / 8);

        let zero = PoolConfig {
            max_memory_mb: Some(0),
            ..PoolConfig::default()
        };
        assert_eq!(zero.resolved_max_pages(), total / 8);
    }

    #[test]
    fn test_explicit_max_pages_wins() {
        let config = PoolConfig {
            max_pages: Some(64),
            max_memory_mb: Some(1),
            ..PoolConfig::default()
        };
        assert_eq!(config.resolved_max_pages(), 64);
    }

    #[test]
    fn test_validate_rejects_bad_sizes() {
        let bad_page = PoolConfig {
            page_size: 3000,
            ..PoolConfig::default()
        };
        assert!(matches!(bad_page.validate(), Err(ConfigError::Invalid(_))));

        let bad_ppp = PoolConfig {
            pages_per_pool: 0,
            ..PoolConfig::default()
        };
        assert!(bad_ppp.validate().is_err());

        let bad_max = PoolConfig {
            max_pages: Some(0),
            ..PoolConfig::default()
        };
        assert!(bad_max.validate().is_err());
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "max_pages = 64\npages_per_pool = 16\nmax_brw_pages = 16").unwrap();
        let config = PoolConfig::from_file(file.path()).unwrap();
        assert_eq!(config.max_pages, Some(64));
        assert_eq!(config.pages_per_pool, 16);
        assert_eq!(config.max_brw_pages, 16);
        assert_eq!(config.page_size, os_page_size());
    }

    #[test]
    fn test_from_json_file() {
        let mut file = Builder::new().suffix(".json").tempfile().unwrap();
        writeln!(file, r#"{{"max_memory_mb": 8, "quiescent_period_secs": 5}}"#).unwrap();
        let config = PoolConfig::from_file(file.path()).unwrap();
        assert_eq!(config.max_memory_mb, Some(8));
        assert_eq!(config.quiescent_period_secs, 5);
    }

    #[test]
    fn test_from_file_rejects_extension() {
        let file = Builder::new().suffix(".yaml").tempfile().unwrap();
        assert!(matches!(
            PoolConfig::from_file(file.path()),
            Err(ConfigError::UnsupportedExtension(_))
        ));
    }

    #[test]
    fn test_from_file_validates() {
        let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "pages_per_pool = 0").unwrap();
        assert!(matches!(
            PoolConfig::from_file(file.path()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_env_override() {
        std::env::set_var(ENV_MAX_MEMORY_MB, "16");
        let config = PoolConfig::from_env();
        std::env::set_var(ENV_MAX_MEMORY_MB, "lots");
        let bad = PoolConfig::from_env();
        std::env::remove_var(ENV_MAX_MEMORY_MB);

        assert_eq!(config.unwrap().max_memory_mb, Some(16));
        assert!(matches!(bad, Err(ConfigError::InvalidEnv { .. })));
    }
}
