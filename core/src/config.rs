//! Configuration loading and validation for the process factory
//!
//! A `FactoryConfig` can be parsed from TOML, built in code, or assembled from
//! the environment (`STENCIL_CONFIG`, `STENCIL_WORKER`, `STENCIL_LOG`).

use crate::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable naming a TOML config file
pub const CONFIG_ENV: &str = "STENCIL_CONFIG";
/// Environment variable overriding the worker binary path
pub const WORKER_ENV: &str = "STENCIL_WORKER";
/// Environment variable overriding the log level
pub const LOG_ENV: &str = "STENCIL_LOG";

/// How the factory spawns fresh workers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct FactoryConfig {
    /// Worker executable; resolved automatically when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_path: Option<PathBuf>,
    /// Names of variables copied from our environment into the worker's
    pub env_passthrough: Vec<String>,
    /// Extra variables set in the worker's environment
    pub extra_env: BTreeMap<String, String>,
    /// Start fresh workers in their own session and process group
    pub new_session: bool,
    /// Default tracing level
    pub log_level: String,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            worker_path: None,
            env_passthrough: default_env_passthrough(),
            extra_env: BTreeMap::new(),
            new_session: false,
            log_level: "info".to_string(),
        }
    }
}

fn default_env_passthrough() -> Vec<String> {
    ["PATH", "LD_LIBRARY_PATH", "RUST_LOG", "RUST_BACKTRACE", LOG_ENV]
        .into_iter()
        .map(String::from)
        .collect()
}

impl FactoryConfig {
    /// Validate the configuration and return field-path errors
    pub fn validate(&self) -> Result<()> {
        if let Some(path) = &self.worker_path {
            if path.as_os_str().is_empty() {
                return Err(CoreError::Validation(
                    "workerPath: cannot be empty".to_string(),
                ));
            }
        }
        for (i, name) in self.env_passthrough.iter().enumerate() {
            if name.trim().is_empty() || name.contains('=') {
                return Err(CoreError::Validation(format!(
                    "envPassthrough[{}]: invalid variable name '{}'",
                    i, name
                )));
            }
        }
        for key in self.extra_env.keys() {
            if key.trim().is_empty() || key.contains('=') {
                return Err(CoreError::Validation(format!(
                    "extraEnv.{}: invalid variable name",
                    key
                )));
            }
        }
        if self.log_level.trim().is_empty() {
            return Err(CoreError::Validation(
                "logLevel: cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Build from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup
    pub fn from_env_with(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = match lookup(CONFIG_ENV).filter(|p| !p.is_empty()) {
            Some(path) => load_factory_config_from_toml_path(path)?,
            None => FactoryConfig::default(),
        };
        if let Some(worker) = lookup(WORKER_ENV).filter(|p| !p.is_empty()) {
            config.worker_path = Some(PathBuf::from(worker));
        }
        if let Some(level) = lookup(LOG_ENV).filter(|l| !l.is_empty()) {
            config.log_level = level;
        }
        config.validate()?;
        Ok(config)
    }

    /// Environment handed to a freshly spawned worker
    pub fn spawn_env(&self) -> Vec<(String, String)> {
        self.spawn_env_with(|key| std::env::var(key).ok())
    }

    /// Like [`FactoryConfig::spawn_env`] with an explicit lookup
    pub fn spawn_env_with(&self, lookup: impl Fn(&str) -> Option<String>) -> Vec<(String, String)> {
        let mut env: BTreeMap<String, String> = self
            .env_passthrough
            .iter()
            .filter_map(|name| lookup(name).map(|value| (name.clone(), value)))
            .collect();
        env.extend(self.extra_env.clone());
        env.into_iter().collect()
    }
}

/// Load factory config from TOML file path
pub fn load_factory_config_from_toml_path(path: impl AsRef<Path>) -> Result<FactoryConfig> {
    let data = fs::read_to_string(&path).map_err(|e| {
        CoreError::Configuration(format!("Failed to read config {:?}: {}", path.as_ref(), e))
    })?;
    load_factory_config_from_toml_str(&data)
}

/// Load factory config from a TOML string
pub fn load_factory_config_from_toml_str(input: &str) -> Result<FactoryConfig> {
    let cfg: FactoryConfig = toml::from_str(input)
        .map_err(|e| CoreError::Configuration(format!("TOML parse error: {}", e)))?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = FactoryConfig::default();
        assert!(cfg.validate().is_ok());
        assert!(cfg.env_passthrough.iter().any(|n| n == "LD_LIBRARY_PATH"));
        assert_eq!(cfg.log_level, "info");
        assert!(!cfg.new_session);
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
workerPath = "/opt/stencil/bin/stencil-worker"
envPassthrough = ["PATH", "HOME"]
newSession = true
logLevel = "debug"

[extraEnv]
APP_MODE = "worker"
"#;
        let cfg = load_factory_config_from_toml_str(toml).unwrap();
        assert_eq!(
            cfg.worker_path.as_deref(),
            Some(Path::new("/opt/stencil/bin/stencil-worker"))
        );
        assert_eq!(cfg.env_passthrough, vec!["PATH", "HOME"]);
        assert!(cfg.new_session);
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.extra_env.get("APP_MODE").map(String::as_str), Some("worker"));
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let cfg = load_factory_config_from_toml_str("newSession = true").unwrap();
        assert!(cfg.new_session);
        assert_eq!(cfg.env_passthrough, default_env_passthrough());
    }

    #[test]
    fn test_validation_errors_name_the_field() {
        let err = load_factory_config_from_toml_str(r#"envPassthrough = ["PATH", "A=B"]"#)
            .unwrap_err();
        assert!(err.to_string().contains("envPassthrough[1]"));

        let err = load_factory_config_from_toml_str(r#"logLevel = " ""#).unwrap_err();
        assert!(err.to_string().contains("logLevel"));

        let err = load_factory_config_from_toml_str(r#"workerPath = """#).unwrap_err();
        assert!(err.to_string().contains("workerPath"));
    }

    #[test]
    fn test_bad_toml_is_configuration_error() {
        let err = load_factory_config_from_toml_str("newSession = ").unwrap_err();
        assert!(matches!(err, CoreError::Configuration(_)));
    }

    #[test]
    fn test_from_env_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "logLevel = \"warn\"\nnewSession = true").unwrap();

        let vars: HashMap<&str, String> = HashMap::from([
            (CONFIG_ENV, file.path().display().to_string()),
            (WORKER_ENV, "/usr/local/bin/stencil-worker".to_string()),
        ]);
        let cfg = FactoryConfig::from_env_with(|k| vars.get(k).cloned()).unwrap();
        assert!(cfg.new_session);
        assert_eq!(cfg.log_level, "warn");
        assert_eq!(
            cfg.worker_path.as_deref(),
            Some(Path::new("/usr/local/bin/stencil-worker"))
        );

        let vars: HashMap<&str, String> = HashMap::from([(LOG_ENV, "trace".to_string())]);
        let cfg = FactoryConfig::from_env_with(|k| vars.get(k).cloned()).unwrap();
        assert_eq!(cfg.log_level, "trace");
        assert!(cfg.worker_path.is_none());
    }

    #[test]
    fn test_spawn_env_filters_and_extends() {
        let mut cfg = FactoryConfig {
            env_passthrough: vec!["PATH".to_string(), "UNSET_VAR".to_string()],
            ..FactoryConfig::default()
        };
        cfg.extra_env.insert("APP_MODE".to_string(), "worker".to_string());

        let env = cfg.spawn_env_with(|k| (k == "PATH").then(|| "/bin".to_string()));
        assert_eq!(
            env,
            vec![
                ("APP_MODE".to_string(), "worker".to_string()),
                ("PATH".to_string(), "/bin".to_string()),
            ]
        );
    }
}
