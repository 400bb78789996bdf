//! Pool policy configuration.
//!
//! These structs mirror the daemon's TOML configuration surface. They are
//! deserialized once at startup and passed into the constructors of the
//! components that need them; nothing here is lazily memoized.

use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::{CachetError, CachetResult};

/// OS group configuration: cache ways and CPUs reserved for the operating
/// system, applied to the resctrl root group.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OsGroup {
    /// Cache ways reserved for the OS.
    pub cacheways: u32,
    /// CPU list reserved for the OS (kernel cpu-list syntax).
    pub cpuset: String,
}

impl Default for OsGroup {
    fn default() -> Self {
        Self {
            cacheways: 1,
            cpuset: "0".to_string(),
        }
    }
}

/// Infrastructure group configuration. Absence of the section disables the
/// group entirely.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InfraGroup {
    /// Cache ways reserved for infrastructure tasks.
    pub cacheways: u32,
    /// CPU list for infrastructure tasks.
    pub cpuset: String,
    /// Command-line substrings identifying the tasks to bind.
    pub tasks: Vec<String>,
}

/// Cache pool layout configuration, in way counts.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CachePool {
    /// Ceiling on the ways any single shared-pool consumer may request.
    pub max_allowed_shared: u32,
    /// Ways in the guaranteed pool.
    pub guarantee: u32,
    /// Ways in the best-effort pool.
    pub besteffort: u32,
    /// Ways in the shared pool.
    pub shared: u32,
    /// Whether the best-effort pool may be shrunk to satisfy guarantees.
    pub shrink: bool,
}

impl Default for CachePool {
    fn default() -> Self {
        Self {
            max_allowed_shared: 10,
            guarantee: 10,
            besteffort: 7,
            shared: 2,
            shrink: false,
        }
    }
}

/// Memory-bandwidth allocation mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MbaMode {
    /// Throttling disabled.
    #[default]
    None,
    /// Throttle expressed as a 0-100 percentage.
    Percentage,
    /// Throttle expressed as an absolute bandwidth ceiling in MBps.
    Mbps,
}

impl MbaMode {
    /// The integer encoding the PQOS interface uses for this mode
    /// (none/percentage/mbps map to -1/0/1).
    #[must_use]
    pub const fn as_pqos(self) -> i32 {
        match self {
            Self::None => -1,
            Self::Percentage => 0,
            Self::Mbps => 1,
        }
    }
}

impl FromStr for MbaMode {
    type Err = CachetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "percentage" => Ok(Self::Percentage),
            "mbps" => Ok(Self::Mbps),
            other => Err(CachetError::Unsupported {
                feature: format!("MBA mode [{other}]"),
            }),
        }
    }
}

/// Convert a supported MBA mode name (none, percentage or mbps) into its
/// PQOS-compatible value (-1, 0 and 1 respectively).
///
/// # Errors
///
/// Returns [`CachetError::Unsupported`] for any other string.
pub fn mba_mode_to_int(mode: &str) -> CachetResult<i32> {
    mode.parse::<MbaMode>().map(MbaMode::as_pqos)
}

/// RDT-related configuration flags.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RdtConfig {
    /// Requested memory-bandwidth allocation mode.
    #[serde(rename = "mbaMode")]
    pub mba_mode: MbaMode,
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CachetConfig {
    /// Resctrl control-filesystem mount point.
    #[serde(rename = "sysResctrl")]
    pub sys_resctrl: Option<PathBuf>,
    /// OS group section.
    #[serde(rename = "OSGroup")]
    pub os_group: OsGroup,
    /// Infra group section; `None` is a valid disabled state.
    #[serde(rename = "InfraGroup")]
    pub infra_group: Option<InfraGroup>,
    /// Cache pool layout section.
    #[serde(rename = "CachePool")]
    pub cache_pool: CachePool,
    /// RDT flags section.
    #[serde(rename = "RDTConfig")]
    pub rdt: RdtConfig,
}

impl CachetConfig {
    /// Default resctrl mount point when the configuration does not name one.
    pub const DEFAULT_RESCTRL: &'static str = "/sys/fs/resctrl";

    /// The configured control root, or the conventional mount point.
    #[must_use]
    pub fn resctrl_root(&self) -> PathBuf {
        self.sys_resctrl
            .clone()
            .unwrap_or_else(|| PathBuf::from(Self::DEFAULT_RESCTRL))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_group_defaults() {
        let group = OsGroup::default();
        assert_eq!(group.cacheways, 1);
        assert_eq!(group.cpuset, "0");
    }

    #[test]
    fn cache_pool_defaults() {
        let pool = CachePool::default();
        assert_eq!(pool.max_allowed_shared, 10);
        assert_eq!(pool.guarantee, 10);
        assert_eq!(pool.besteffort, 7);
        assert_eq!(pool.shared, 2);
        assert!(!pool.shrink);
    }

    #[test]
    fn mba_mode_mapping() {
        assert_eq!(mba_mode_to_int("none").unwrap(), -1);
        assert_eq!(mba_mode_to_int("percentage").unwrap(), 0);
        assert_eq!(mba_mode_to_int("mbps").unwrap(), 1);
        assert!(mba_mode_to_int("bogus").is_err());
        assert!(mba_mode_to_int("").is_err());
    }

    #[test]
    fn parse_full_config() {
        let config: CachetConfig = toml::from_str(
            r#"
            sysResctrl = "/sys/fs/resctrl"

            [OSGroup]
            cacheways = 2
            cpuset = "0-1"

            [InfraGroup]
            cacheways = 4
            cpuset = "2-3"
            tasks = ["ovs-vswitchd"]

            [CachePool]
            max_allowed_shared = 8
            guarantee = 12
            besteffort = 5
            shared = 3
            shrink = true

            [RDTConfig]
            mbaMode = "percentage"
            "#,
        )
        .unwrap();

        assert_eq!(config.os_group.cacheways, 2);
        let infra = config.infra_group.unwrap();
        assert_eq!(infra.tasks, vec!["ovs-vswitchd".to_string()]);
        assert_eq!(config.cache_pool.guarantee, 12);
        assert!(config.cache_pool.shrink);
        assert_eq!(config.rdt.mba_mode, MbaMode::Percentage);
    }

    #[test]
    fn missing_infra_group_is_disabled() {
        let config: CachetConfig = toml::from_str("[OSGroup]\ncacheways = 1\n").unwrap();
        assert!(config.infra_group.is_none());
        // Unset sections fall back to the documented defaults.
        assert_eq!(config.cache_pool.guarantee, 10);
        assert_eq!(config.rdt.mba_mode, MbaMode::None);
        assert_eq!(
            config.resctrl_root(),
            PathBuf::from(CachetConfig::DEFAULT_RESCTRL)
        );
    }
}
