//! Daemon configuration.
//!
//! Read from the YAML file named by `KUBED_CONFIG` (all defaults when unset),
//! then overridden field by field from the environment.

use crate::error::ControllerError;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the YAML config file.
pub const CONFIG_PATH_ENV: &str = "KUBED_CONFIG";

/// Cluster-wide daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterConfig {
    /// Search index settings
    pub api_server: ApiServerSpec,

    /// Recycle bin settings; absent means no recycle bin
    pub recycle_bin: Option<RecycleBinSpec>,

    /// Replicate annotated Secrets and ConfigMaps
    pub enable_config_syncer: bool,

    /// Full redelivery period of every router
    pub resync_period_seconds: u64,

    /// Upper bound on a single replica write
    pub write_timeout_seconds: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            api_server: ApiServerSpec::default(),
            recycle_bin: None,
            enable_config_syncer: true,
            resync_period_seconds: 300,
            write_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiServerSpec {
    pub enable_search_index: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecycleBinSpec {
    /// Directory holding the snapshots
    pub path: PathBuf,

    /// Also keep the previous state on every content change
    pub handle_updates: bool,
}

impl ClusterConfig {
    /// Loads the process configuration.
    pub fn load() -> Result<Self, ControllerError> {
        let config = match env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.with_overrides(|key| env::var(key).ok())
    }

    /// Parses a YAML config file.
    pub fn from_file(path: &Path) -> Result<Self, ControllerError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ControllerError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&raw)
    }

    /// Parses YAML config text. An empty document yields the defaults.
    pub fn from_yaml(raw: &str) -> Result<Self, ControllerError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw).map_err(|e| ControllerError::InvalidConfig(e.to_string()))
    }

    /// Applies environment overrides looked up through `lookup`, then
    /// validates the result.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("RESYNC_PERIOD_SECONDS") {
            self.resync_period_seconds = parse_seconds("RESYNC_PERIOD_SECONDS", &value)?;
        }
        if let Some(value) = lookup("ENABLE_SEARCH_INDEX") {
            self.api_server.enable_search_index = parse_flag("ENABLE_SEARCH_INDEX", &value)?;
        }
        if let Some(path) = lookup("RECYCLE_BIN_PATH") {
            if path.is_empty() {
                self.recycle_bin = None;
            } else {
                self.recycle_bin.get_or_insert_with(RecycleBinSpec::default).path = PathBuf::from(path);
            }
        }
        if let Some(value) = lookup("RECYCLE_BIN_HANDLE_UPDATES") {
            let handle_updates = parse_flag("RECYCLE_BIN_HANDLE_UPDATES", &value)?;
            match self.recycle_bin.as_mut() {
                Some(bin) => bin.handle_updates = handle_updates,
                None => {
                    return Err(ControllerError::InvalidConfig(
                        "RECYCLE_BIN_HANDLE_UPDATES requires a recycle bin path".to_string(),
                    ));
                }
            }
        }
        if let Some(value) = lookup("ENABLE_CONFIG_SYNCER") {
            self.enable_config_syncer = parse_flag("ENABLE_CONFIG_SYNCER", &value)?;
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<(), ControllerError> {
        if self.resync_period_seconds == 0 {
            return Err(ControllerError::InvalidConfig(
                "resyncPeriodSeconds must be greater than zero".to_string(),
            ));
        }
        if self.write_timeout_seconds == 0 {
            return Err(ControllerError::InvalidConfig(
                "writeTimeoutSeconds must be greater than zero".to_string(),
            ));
        }
        if let Some(bin) = &self.recycle_bin {
            if bin.path.as_os_str().is_empty() {
                return Err(ControllerError::InvalidConfig(
                    "recycleBin.path must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn resync_period(&self) -> Duration {
        Duration::from_secs(self.resync_period_seconds)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_seconds)
    }
}

fn parse_seconds(key: &str, value: &str) -> Result<u64, ControllerError> {
    value
        .trim()
        .parse()
        .map_err(|_| ControllerError::InvalidConfig(format!("{key} must be a whole number of seconds, got {value:?}")))
}

fn parse_flag(key: &str, value: &str) -> Result<bool, ControllerError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ControllerError::InvalidConfig(format!("{key} must be true or false, got {value:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ClusterConfig::default().with_overrides(env(&[])).unwrap();

        assert!(config.enable_config_syncer);
        assert!(!config.api_server.enable_search_index);
        assert!(config.recycle_bin.is_none());
        assert_eq!(config.resync_period(), Duration::from_secs(300));
        assert_eq!(config.write_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_yaml_fields() {
        let config = ClusterConfig::from_yaml(
            r"
apiServer:
  enableSearchIndex: true
recycleBin:
  path: /var/lib/kubed/trash
  handleUpdates: true
enableConfigSyncer: false
resyncPeriodSeconds: 60
",
        )
        .unwrap();

        assert!(config.api_server.enable_search_index);
        assert_eq!(
            config.recycle_bin,
            Some(RecycleBinSpec {
                path: PathBuf::from("/var/lib/kubed/trash"),
                handle_updates: true,
            })
        );
        assert!(!config.enable_config_syncer);
        assert_eq!(config.resync_period_seconds, 60);
        assert_eq!(config.write_timeout_seconds, 30);
    }

    #[test]
    fn test_empty_file_is_defaults() {
        assert_eq!(ClusterConfig::from_yaml("  \n").unwrap(), ClusterConfig::default());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "resyncPeriodSeconds: 45").unwrap();

        let config = ClusterConfig::from_file(file.path()).unwrap();
        assert_eq!(config.resync_period_seconds, 45);

        let missing = ClusterConfig::from_file(Path::new("/nonexistent/kubed.yaml"));
        assert!(matches!(missing, Err(ControllerError::InvalidConfig(_))));
    }

    #[test]
    fn test_env_overrides_file() {
        let config = ClusterConfig::from_yaml("resyncPeriodSeconds: 60\nenableConfigSyncer: true\n")
            .unwrap()
            .with_overrides(env(&[
                ("RESYNC_PERIOD_SECONDS", "120"),
                ("ENABLE_SEARCH_INDEX", "true"),
                ("RECYCLE_BIN_PATH", "/tmp/bin"),
                ("RECYCLE_BIN_HANDLE_UPDATES", "yes"),
                ("ENABLE_CONFIG_SYNCER", "false"),
            ]))
            .unwrap();

        assert_eq!(config.resync_period_seconds, 120);
        assert!(config.api_server.enable_search_index);
        assert!(!config.enable_config_syncer);
        let bin = config.recycle_bin.unwrap();
        assert_eq!(bin.path, PathBuf::from("/tmp/bin"));
        assert!(bin.handle_updates);
    }

    #[test]
    fn test_empty_recycle_bin_path_disables_it() {
        let config = ClusterConfig::from_yaml("recycleBin:\n  path: /data\n")
            .unwrap()
            .with_overrides(env(&[("RECYCLE_BIN_PATH", "")]))
            .unwrap();
        assert!(config.recycle_bin.is_none());
    }

    #[test]
    fn test_invalid_values_rejected() {
        for pairs in [
            vec![("RESYNC_PERIOD_SECONDS", "0")],
            vec![("RESYNC_PERIOD_SECONDS", "5m")],
            vec![("ENABLE_SEARCH_INDEX", "maybe")],
            vec![("RECYCLE_BIN_HANDLE_UPDATES", "true")],
        ] {
            let result = ClusterConfig::default().with_overrides(env(&pairs));
            assert!(matches!(result, Err(ControllerError::InvalidConfig(_))), "{pairs:?}");
        }

        let zero_timeout = ClusterConfig::from_yaml("writeTimeoutSeconds: 0").unwrap().with_overrides(env(&[]));
        assert!(matches!(zero_timeout, Err(ControllerError::InvalidConfig(_))));

        assert!(ClusterConfig::from_yaml("resyncPeriodSeconds: soon").is_err());
    }
}
