//! Configuration management.

use std::{collections::HashMap, env, path::Path, time::Duration};

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Top-level configuration for the registry integration layer.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config. Paths support
    /// `~` expansion. Loaded in order, later files override earlier.
    #[serde(default)]
    pub env_files: Vec<String>,
    /// The registry this process binds providers/consumers against.
    pub registry: RegistryConfig,
    /// Defaults applied to every provider export.
    pub provider: ProviderConfig,
    /// Defaults applied to every consumer refer.
    pub consumer: ConsumerConfig,
    /// Extension descriptor discovery settings.
    pub extensions: ExtensionsConfig,
    /// Failback retry policy for registry operations.
    pub failback: FailbackConfig,
    /// File-backed dynamic configuration (hot-reloaded configurator rules).
    pub dynamic_config: DynamicConfigSettings,
}

/// Registry connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// `registry://host:port/RegistryService?registry=<backend>...` style URL.
    pub url: String,
    /// Separator used when encoding `<category>:<interface>:<version>:<group>`
    /// at the naming-service level.
    pub service_name_separator: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: "registry://127.0.0.1:2181/RegistryService?registry=mock".to_string(),
            service_name_separator: ":".to_string(),
        }
    }
}

/// Provider-side defaults applied during export.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Keep only these parameter keys (plus any extra keys listed on the
    /// registry URL) when simplifying a provider URL for registration.
    /// Empty means "use the exclusion list instead of an allow-list".
    pub simplified_keys: Vec<String>,
    /// Parameter keys always stripped from a registered URL, regardless of
    /// simplified mode.
    pub excluded_keys: Vec<String>,
    /// How long `unexport` waits before releasing the inner invoker, giving
    /// in-flight consumer calls a chance to drain.
    #[serde(with = "crate::config::humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            simplified_keys: Vec::new(),
            excluded_keys: default_excluded_keys(),
            shutdown_timeout: Duration::from_millis(0),
        }
    }
}

/// Literal infrastructure keys always stripped from a registered URL. Any
/// `qos.`-prefixed key is also always stripped during provider URL
/// simplification, regardless of this list.
fn default_excluded_keys() -> Vec<String> {
    [
        "monitor",
        "bind.ip",
        "bind.port",
        "validation",
        "interfaces",
        // Volatile call-tuning parameters: a configurator changing one of
        // these must not change the registered identity, so a pure QoS
        // override reExports locally without an unregister/register pair.
        "timeout",
        "retries",
        "weight",
        "loadbalance",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// Consumer-side defaults applied during refer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Default cluster strategy name (`failover`, `failfast`, `mergeable`).
    pub cluster: String,
    /// Default load balance strategy name (`random`, `round_robin`, `least_active`).
    pub loadbalance: String,
    /// Maximum number of further invokers a `failover` cluster tries.
    pub retries: u32,
    /// Per-call timeout.
    #[serde(with = "crate::config::humantime_serde")]
    pub timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            cluster: "failover".to_string(),
            loadbalance: "random".to_string(),
            retries: 2,
            timeout: Duration::from_secs(5),
        }
    }
}

/// Extension descriptor discovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtensionsConfig {
    /// Directories probed, in order, for `<interface-fqn>` descriptor files.
    /// Mirrors the well-known internal/public/standard probe order.
    pub directories: Vec<String>,
}

impl Default for ExtensionsConfig {
    fn default() -> Self {
        Self {
            directories: vec![
                "META-INF/fabric/internal".to_string(),
                "META-INF/fabric".to_string(),
                "META-INF/services".to_string(),
            ],
        }
    }
}

/// Failback retry policy for registry register/subscribe operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailbackConfig {
    /// Enable failback retry at all.
    pub enabled: bool,
    /// Initial backoff before the first retry.
    #[serde(with = "crate::config::humantime_serde")]
    pub initial_backoff: Duration,
    /// Maximum backoff between retries.
    #[serde(with = "crate::config::humantime_serde")]
    pub max_backoff: Duration,
    /// Backoff multiplier applied after each failed retry.
    pub multiplier: f64,
}

impl Default for FailbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// File-backed dynamic configuration settings (hot-reloaded configurator rules,
/// distinct from the naming registry).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicConfigSettings {
    /// Enable the file watcher.
    pub enabled: bool,
    /// Directory holding `<key>.yaml` configurator-rule files.
    pub directory: String,
}

impl Default for DynamicConfigSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: "config/dynamic".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from an optional YAML file, layered with
    /// `FABRIC_RPC_`-prefixed environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("FABRIC_RPC_").split("__"));

        let config: Self = figment.extract().map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();

        Ok(config)
    }

    /// Load environment files into the process environment. Files that
    /// don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if let Some(rest) = path_str.strip_prefix('~') {
                env::var("HOME").map_or_else(|_| path_str.clone(), |home| format!("{home}{rest}"))
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("env file not found (skipped): {expanded}");
            }
        }
    }

    /// Merge this process's environment variables into a `HashMap`,
    /// restricted to the keys referenced by configurator payloads.
    #[must_use]
    pub fn resolved_env(&self, keys: &[String]) -> HashMap<String, String> {
        keys.iter()
            .filter_map(|k| env::var(k).ok().map(|v| (k.clone(), v)))
            .collect()
    }
}

/// Custom humantime-style serde module for `Duration` (`"30s"`, `"5m"`, `"100ms"`).
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize a `Duration` as a human-readable string.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    /// Deserialize a human-readable duration string.
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed.
    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        if let Some(secs) = s.strip_suffix("ms") {
            // order matters: check "ms" before "s"
            return secs
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom);
        }
        if let Some(secs) = s.strip_suffix('s') {
            return secs
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom);
        }
        if let Some(mins) = s.strip_suffix('m') {
            return mins
                .parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(serde::de::Error::custom);
        }
        s.parse::<u64>()
            .map(Duration::from_secs)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_env_files_sets_process_env() {
        let dir = tempfile::tempdir().unwrap();
        let env_path = dir.path().join("test.env");
        let mut f = std::fs::File::create(&env_path).unwrap();
        writeln!(f, "FABRIC_RPC_TEST_KEY=hello").unwrap();
        drop(f);

        let config = Config {
            env_files: vec![env_path.to_string_lossy().to_string()],
            ..Default::default()
        };
        config.load_env_files();

        assert_eq!(env::var("FABRIC_RPC_TEST_KEY").unwrap(), "hello");
    }

    #[test]
    fn load_env_files_skips_missing_path() {
        let config = Config {
            env_files: vec!["/nonexistent/path/.env".to_string()],
            ..Default::default()
        };
        config.load_env_files();
    }

    #[test]
    fn default_excluded_keys_cover_infrastructure_params() {
        let provider = ProviderConfig::default();
        assert!(provider.excluded_keys.contains(&"bind.ip".to_string()));
        assert!(provider.excluded_keys.contains(&"monitor".to_string()));
    }

    #[test]
    fn yaml_round_trips_through_figment_defaults() {
        let yaml = r#"
registry:
  url: "registry://r:2181/RegistryService?registry=mock"
consumer:
  cluster: failfast
  retries: 5
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.consumer.cluster, "failfast");
        assert_eq!(config.consumer.retries, 5);
    }
}
