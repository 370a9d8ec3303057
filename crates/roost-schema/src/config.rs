use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

const LEGACY_FILE: &str = "instances.json";
const SQLITE_FILE: &str = "roost.db";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("invalid config value for '{key}': {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub store: StoreSection,
    pub engine: EngineSection,
    pub policy: PolicySection,
    pub reconciler: ReconcilerSection,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Whole-collection JSON file. Superseded by `sqlite`.
    Legacy,
    #[default]
    Sqlite,
}

impl std::fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreBackend::Legacy => write!(f, "legacy"),
            StoreBackend::Sqlite => write!(f, "sqlite"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct StoreSection {
    pub backend: StoreBackend,
    /// Directory holding the store files.
    pub path: PathBuf,
    /// How long a request waits for another transition on the same instance.
    pub lock_timeout_secs: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: PathBuf::from("roost-data"),
            lock_timeout_secs: 30,
        }
    }
}

impl StoreSection {
    #[inline]
    pub fn legacy_file(&self) -> PathBuf {
        self.path.join(LEGACY_FILE)
    }

    #[inline]
    pub fn sqlite_file(&self) -> PathBuf {
        self.path.join(SQLITE_FILE)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct EngineSection {
    /// `docker` or `mock`.
    pub backend: String,
    /// Where the mock engine persists its container table. Defaults to the store path.
    pub state_dir: Option<PathBuf>,
    pub timeout_secs: u64,
    pub stop_grace_secs: u32,
    pub network: String,
    pub default_image: String,
    /// Extra environment injected into every container.
    pub env: BTreeMap<String, String>,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            backend: "docker".to_owned(),
            state_dir: None,
            timeout_secs: 120,
            stop_grace_secs: 10,
            network: "bridge".to_owned(),
            default_image: "ubuntu:22.04".to_owned(),
            env: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct PolicySection {
    pub max_instances_per_owner: u32,
    pub max_instances_total: u32,
    pub default_ttl_hours: Option<u64>,
    /// Whether operators flagged as administrators may act on other owners' instances.
    pub allow_admin_override: bool,
    pub blocked_image_patterns: Vec<String>,
    pub max_cpu_millis: Option<u32>,
    pub max_memory_mb: Option<u64>,
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            max_instances_per_owner: 3,
            max_instances_total: 100,
            default_ttl_hours: None,
            allow_admin_override: true,
            blocked_image_patterns: ["xmrig", "miner", "cryptonight", "stratum", "pool"]
                .into_iter()
                .map(str::to_owned)
                .collect(),
            max_cpu_millis: None,
            max_memory_mb: None,
        }
    }
}

impl PolicySection {
    /// First blocklist pattern contained in `image`, case-insensitively.
    pub fn blocked_pattern(&self, image: &str) -> Option<&str> {
        let image = image.to_ascii_lowercase();
        self.blocked_image_patterns
            .iter()
            .map(String::as_str)
            .find(|p| !p.is_empty() && image.contains(&p.to_ascii_lowercase()))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ReconcilerSection {
    pub interval_secs: u64,
    pub batch_size: usize,
    /// Age after which a `pending` record is treated as an interrupted creation.
    pub pending_grace_secs: u64,
}

impl Default for ReconcilerSection {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            batch_size: 50,
            pending_grace_secs: 600,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(key: &'static str, reason: &str) -> Result<(), ConfigError> {
            Err(ConfigError::Invalid {
                key,
                reason: reason.to_owned(),
            })
        }

        if self.store.path.as_os_str().is_empty() {
            return invalid("store.path", "must not be empty");
        }
        if self.store.lock_timeout_secs == 0 {
            return invalid("store.lock_timeout_secs", "must be positive");
        }
        if self.engine.backend.trim().is_empty() {
            return invalid("engine.backend", "must not be empty");
        }
        if self.engine.timeout_secs == 0 {
            return invalid("engine.timeout_secs", "must be positive");
        }
        if self.engine.default_image.trim().is_empty() {
            return invalid("engine.default_image", "must not be empty");
        }
        if self.policy.max_instances_per_owner == 0 {
            return invalid("policy.max_instances_per_owner", "must be at least 1");
        }
        if self.policy.max_instances_total < self.policy.max_instances_per_owner {
            return invalid(
                "policy.max_instances_total",
                "must not be smaller than max_instances_per_owner",
            );
        }
        if self.policy.default_ttl_hours == Some(0) {
            return invalid("policy.default_ttl_hours", "must be positive when set");
        }
        if self.reconciler.interval_secs == 0 {
            return invalid("reconciler.interval_secs", "must be positive");
        }
        if self.reconciler.batch_size == 0 {
            return invalid("reconciler.batch_size", "must be positive");
        }
        Ok(())
    }

    /// Directory the mock engine persists to.
    pub fn engine_state_dir(&self) -> PathBuf {
        self.engine
            .state_dir
            .clone()
            .unwrap_or_else(|| self.store.path.clone())
    }
}

pub fn parse_config_str(input: &str) -> Result<Config, ConfigError> {
    let config: Config = toml::from_str(input)?;
    config.validate()?;
    Ok(config)
}

pub fn parse_config_file(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config_str(&content)
}

/// Load `path` if it exists, otherwise fall back to defaults.
pub fn load_config_or_default(path: &Path) -> Result<Config, ConfigError> {
    if path.exists() {
        parse_config_file(path)
    } else {
        Ok(Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let input = r#"
[store]
backend = "legacy"
path = "/var/lib/roost"
lock_timeout_secs = 5

[engine]
backend = "mock"
timeout_secs = 30
network = "vps-net"
default_image = "debian:12"

[engine.env]
WATERMARK = "Roost VPS"

[policy]
max_instances_per_owner = 2
max_instances_total = 10
default_ttl_hours = 24
allow_admin_override = false
blocked_image_patterns = ["xmrig"]

[reconciler]
interval_secs = 60
batch_size = 10
"#;
        let config = parse_config_str(input).expect("should parse");
        assert_eq!(config.store.backend, StoreBackend::Legacy);
        assert_eq!(
            config.store.legacy_file(),
            PathBuf::from("/var/lib/roost/instances.json")
        );
        assert_eq!(config.engine.backend, "mock");
        assert_eq!(config.engine.env.get("WATERMARK").unwrap(), "Roost VPS");
        assert_eq!(config.policy.max_instances_per_owner, 2);
        assert_eq!(config.policy.default_ttl_hours, Some(24));
        assert!(!config.policy.allow_admin_override);
        assert_eq!(config.reconciler.interval_secs, 60);
        assert_eq!(config.reconciler.pending_grace_secs, 600);
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = parse_config_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
        assert_eq!(config.policy.max_instances_per_owner, 3);
        assert_eq!(config.policy.max_instances_total, 100);
        assert_eq!(config.engine.default_image, "ubuntu:22.04");
    }

    #[test]
    fn rejects_unknown_fields() {
        assert!(parse_config_str("[store]\nflavour = \"x\"\n").is_err());
        assert!(parse_config_str("[surprise]\n").is_err());
    }

    #[test]
    fn rejects_invalid_values() {
        let err = parse_config_str("[policy]\nmax_instances_per_owner = 0\n").unwrap_err();
        assert!(err.to_string().contains("policy.max_instances_per_owner"));

        let err = parse_config_str("[reconciler]\nbatch_size = 0\n").unwrap_err();
        assert!(err.to_string().contains("reconciler.batch_size"));

        let err = parse_config_str(
            "[policy]\nmax_instances_per_owner = 5\nmax_instances_total = 2\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("max_instances_total"));
    }

    #[test]
    fn blocked_pattern_matches_case_insensitively() {
        let policy = PolicySection::default();
        assert_eq!(policy.blocked_pattern("evil/XMRig:latest"), Some("xmrig"));
        assert_eq!(policy.blocked_pattern("ubuntu:22.04"), None);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn engine_state_dir_defaults_to_store_path() {
        let config = Config::default();
        assert_eq!(config.engine_state_dir(), PathBuf::from("roost-data"));
    }
}
