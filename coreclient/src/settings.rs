// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::{num::NonZeroUsize, path::PathBuf, time::Duration};

use config::{Config, Environment, File, FileFormat};
use fieldapiclient::RetryPolicy;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::cache::{CacheConfig, DEFAULT_OFFLINE_DOCUMENT, NamespaceLimits};

/// Prefix of environment variables overriding settings, e.g. `FIELDSYNC__API__BASE_URL`.
pub const ENV_PREFIX: &str = "FIELDSYNC";

#[derive(Debug, Error)]
#[error("Failed to load settings: {0}")]
pub struct SettingsError(#[from] config::ConfigError);

/// Configuration of the client data layer.
#[derive(Deserialize, Clone, Debug)]
pub struct Settings {
    pub api: ApiSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub cache: CacheSettings,
}

impl Settings {
    /// Loads the settings from an optional YAML file, overridden by the environment.
    pub fn load(path: Option<PathBuf>) -> Result<Self, SettingsError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml));
        }
        let settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("cache.storage_hosts"),
            )
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, SettingsError> {
        let settings = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }

    pub fn cache_config(&self) -> CacheConfig {
        self.cache.to_config(self.api.base_url.clone())
    }
}

/// The remote API.
#[derive(Deserialize, Clone, Debug)]
pub struct ApiSettings {
    /// Base URL of the API and origin of the application
    pub base_url: Url,
    /// Timeout of a single request attempt
    ///
    /// Default is 30 seconds.
    #[serde(
        rename = "request_timeout_ms",
        default = "default_request_timeout",
        with = "duration_millis"
    )]
    pub request_timeout: Duration,
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Retries of transient failures.
#[derive(Deserialize, Clone, Debug)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(
        rename = "base_delay_ms",
        default = "default_base_delay",
        with = "duration_millis"
    )]
    pub base_delay: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay: default_base_delay(),
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: self.base_delay,
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_millis(500)
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct DatabaseSettings {
    /// Path of the SQLite database holding the mutation queue
    ///
    /// If this isn't present, the queue is kept in memory and does not survive a restart.
    pub path: Option<PathBuf>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct CacheSettings {
    /// Content version of the cache namespaces
    ///
    /// Default is the version of this crate.
    #[serde(default = "default_cache_version")]
    pub version: String,
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,
    /// Hosts of the object storage serving uploaded images
    #[serde(default)]
    pub storage_hosts: Vec<String>,
    /// Entry limits below are disabled by setting them to 0.
    #[serde(default = "default_pages_max_entries")]
    pub pages_max_entries: usize,
    #[serde(default = "default_api_max_entries")]
    pub api_max_entries: usize,
    #[serde(
        rename = "api_max_age_secs",
        default = "default_api_max_age",
        with = "duration_seconds"
    )]
    pub api_max_age: Duration,
    #[serde(default = "default_object_max_entries")]
    pub object_max_entries: usize,
    #[serde(
        rename = "object_max_age_secs",
        default = "default_object_max_age",
        with = "duration_seconds"
    )]
    pub object_max_age: Duration,
    #[serde(default = "default_static_max_entries")]
    pub static_max_entries: usize,
    #[serde(default = "default_runtime_max_entries")]
    pub runtime_max_entries: usize,
    #[serde(
        rename = "runtime_max_age_secs",
        default = "default_runtime_max_age",
        with = "duration_seconds"
    )]
    pub runtime_max_age: Duration,
    #[serde(default = "default_offline_document")]
    pub offline_document: String,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            version: default_cache_version(),
            api_prefix: default_api_prefix(),
            storage_hosts: Vec::new(),
            pages_max_entries: default_pages_max_entries(),
            api_max_entries: default_api_max_entries(),
            api_max_age: default_api_max_age(),
            object_max_entries: default_object_max_entries(),
            object_max_age: default_object_max_age(),
            static_max_entries: default_static_max_entries(),
            runtime_max_entries: default_runtime_max_entries(),
            runtime_max_age: default_runtime_max_age(),
            offline_document: default_offline_document(),
        }
    }
}

impl CacheSettings {
    fn to_config(&self, app_origin: Url) -> CacheConfig {
        CacheConfig {
            version: self.version.clone(),
            app_origin,
            api_prefix: self.api_prefix.clone(),
            storage_hosts: self.storage_hosts.clone(),
            pages: NamespaceLimits {
                max_entries: NonZeroUsize::new(self.pages_max_entries),
                max_age: None,
            },
            api: NamespaceLimits {
                max_entries: NonZeroUsize::new(self.api_max_entries),
                max_age: Some(self.api_max_age),
            },
            objects: NamespaceLimits {
                max_entries: NonZeroUsize::new(self.object_max_entries),
                max_age: Some(self.object_max_age),
            },
            static_assets: NamespaceLimits {
                max_entries: NonZeroUsize::new(self.static_max_entries),
                max_age: None,
            },
            runtime: NamespaceLimits {
                max_entries: NonZeroUsize::new(self.runtime_max_entries),
                max_age: Some(self.runtime_max_age),
            },
            offline_document: self.offline_document.clone(),
        }
    }
}

fn default_cache_version() -> String {
    env!("CARGO_PKG_VERSION").to_owned()
}

fn default_api_prefix() -> String {
    "/api/".to_owned()
}

fn default_pages_max_entries() -> usize {
    50
}

fn default_api_max_entries() -> usize {
    100
}

fn default_api_max_age() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_object_max_entries() -> usize {
    200
}

fn default_object_max_age() -> Duration {
    Duration::from_secs(30 * 24 * 60 * 60)
}

fn default_static_max_entries() -> usize {
    500
}

fn default_runtime_max_entries() -> usize {
    100
}

fn default_runtime_max_age() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_offline_document() -> String {
    DEFAULT_OFFLINE_DOCUMENT.to_owned()
}

mod duration_seconds {
    use serde::de;

    use std::time::Duration;

    pub fn deserialize<'de, D>(d: D) -> Result<Duration, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        let seconds: u64 = serde::Deserialize::deserialize(d)?;
        Ok(Duration::from_secs(seconds))
    }
}

mod duration_millis {
    use serde::de;

    use std::time::Duration;

    pub fn deserialize<'de, D>(d: D) -> Result<Duration, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        let millis: u64 = serde::Deserialize::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::*;

    #[test]
    fn minimal_settings_use_defaults() {
        let settings = Settings::from_yaml("api:\n  base_url: https://inventory.example.com\n")
            .expect("valid settings");

        assert_eq!(settings.api.base_url.as_str(), "https://inventory.example.com/");
        assert_eq!(settings.api.request_timeout, Duration::from_secs(30));
        assert_eq!(settings.retry.policy(), RetryPolicy::default());
        assert_eq!(settings.database.path, None);

        let cache = settings.cache_config();
        assert_eq!(cache.version, env!("CARGO_PKG_VERSION"));
        assert_eq!(cache.api_prefix, "/api/");
        assert_eq!(cache.api.max_entries, NonZeroUsize::new(100));
        assert_eq!(cache.api.max_age, Some(Duration::from_secs(86400)));
        assert_eq!(cache.objects.max_age, Some(Duration::from_secs(2_592_000)));
        assert_eq!(cache.pages.max_entries, NonZeroUsize::new(50));
        assert_eq!(cache.static_assets.max_entries, NonZeroUsize::new(500));
        assert_eq!(
            cache.runtime,
            NamespaceLimits {
                max_entries: NonZeroUsize::new(100),
                max_age: Some(Duration::from_secs(86400)),
            }
        );
        assert_eq!(cache.offline_document, DEFAULT_OFFLINE_DOCUMENT);
    }

    #[test]
    fn overrides_from_yaml() {
        let yaml = r#"
api:
  base_url: https://inventory.example.com
  request_timeout_ms: 5000
retry:
  max_retries: 5
  base_delay_ms: 250
database:
  path: /var/lib/fieldsync/queue.sqlite
cache:
  version: "2026.10"
  storage_hosts:
    - objects.example.net
  api_max_age_secs: 60
  static_max_entries: 0
  runtime_max_entries: 20
"#;
        let settings = Settings::from_yaml(yaml).expect("valid settings");

        assert_eq!(settings.api.request_timeout, Duration::from_secs(5));
        assert_eq!(
            settings.retry.policy(),
            RetryPolicy {
                max_retries: 5,
                base_delay: Duration::from_millis(250),
            }
        );
        assert_eq!(
            settings.database.path,
            Some(PathBuf::from("/var/lib/fieldsync/queue.sqlite"))
        );

        let cache = settings.cache_config();
        assert_eq!(cache.version, "2026.10");
        assert_eq!(cache.storage_hosts, ["objects.example.net"]);
        assert_eq!(cache.api.max_age, Some(Duration::from_secs(60)));
        assert_eq!(cache.static_assets.max_entries, None);
        assert_eq!(cache.runtime.max_entries, NonZeroUsize::new(20));
    }

    #[test]
    fn missing_base_url_is_an_error() {
        let error = Settings::from_yaml("retry:\n  max_retries: 1\n").unwrap_err();
        assert!(error.to_string().contains("base_url"), "{error}");

        assert!(Settings::from_yaml("api:\n  base_url: not a url\n").is_err());
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .unwrap();
        writeln!(file, "api:\n  base_url: https://inventory.example.com/v2/").unwrap();

        let settings = Settings::load(Some(file.path().to_owned())).unwrap();
        assert_eq!(settings.api.base_url.path(), "/v2/");
    }
}
