//! Environment configuration and its on-disk persistence

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::chaos::ExperimentInfo;
use crate::environment::chart::HelmChart;
use crate::environment::connections::ChartConnections;
use crate::error::{Error, Result};

/// Environment variable pointing at a config file to load instead of
/// deploying a fresh environment.
pub const CONFIG_FILE_ENV: &str = "CHARTBED_CONFIG_FILE";

const DEFAULT_INSTALL_TIMEOUT: Duration = Duration::from_secs(180);
const DEFAULT_FORWARD_TIMEOUT: Duration = Duration::from_secs(60);

/// Full environment configuration. A persisted config file is enough to
/// reattach to a running environment from another process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Where this config is persisted. Derived from the namespace when
    /// unset.
    #[serde(skip)]
    pub path: Option<PathBuf>,
    /// Keep the config synced to disk after every mutating operation.
    #[serde(default)]
    pub persistent: bool,
    /// Forward ports via detached kubectl processes that outlive this
    /// process, instead of in-process streams.
    #[serde(default)]
    pub persistent_connection: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_prefix: Option<String>,
    /// Set once the namespace has been allocated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default = "default_install_timeout", with = "duration_str")]
    pub install_timeout: Duration,
    #[serde(default = "default_forward_timeout", with = "duration_str")]
    pub forward_timeout: Duration,
    #[serde(default, skip_serializing_if = "Charts::is_empty")]
    pub charts: Charts,
    /// Standalone chaos experiments that survive process restarts.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub experiments: BTreeMap<String, ExperimentInfo>,
}

fn default_install_timeout() -> Duration {
    DEFAULT_INSTALL_TIMEOUT
}

fn default_forward_timeout() -> Duration {
    DEFAULT_FORWARD_TIMEOUT
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: None,
            persistent: false,
            persistent_connection: false,
            namespace_prefix: None,
            namespace: None,
            install_timeout: DEFAULT_INSTALL_TIMEOUT,
            forward_timeout: DEFAULT_FORWARD_TIMEOUT,
            charts: Charts::default(),
            experiments: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn new(namespace_prefix: impl Into<String>) -> Self {
        Self {
            namespace_prefix: Some(namespace_prefix.into()),
            ..Self::default()
        }
    }

    /// Load a config from a YAML or JSON file, recording the path so
    /// later syncs write back to the same file.
    pub fn load_file(path: &Path) -> Result<Self> {
        FileStore.load(path)
    }
}

/// Charts of the environment, keyed by release name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Charts(BTreeMap<String, HelmChart>);

impl Charts {
    pub fn get(&self, release: &str) -> Result<&HelmChart> {
        self.0
            .get(release)
            .ok_or_else(|| Error::NotFoundError(format!("chart {} not found", release)))
    }

    pub fn get_mut(&mut self, release: &str) -> Result<&mut HelmChart> {
        self.0
            .get_mut(release)
            .ok_or_else(|| Error::NotFoundError(format!("chart {} not found", release)))
    }

    /// Discovered connections of one chart.
    pub fn connections(&self, release: &str) -> Result<&ChartConnections> {
        Ok(&self.get(release)?.chart_connections)
    }

    pub fn contains(&self, release: &str) -> bool {
        self.0.contains_key(release)
    }

    pub fn insert(&mut self, chart: HelmChart) {
        self.0.insert(chart.release_name.clone(), chart);
    }

    pub fn remove(&mut self, release: &str) -> Option<HelmChart> {
        self.0.remove(release)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &HelmChart)> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut HelmChart)> {
        self.0.iter_mut()
    }

    pub fn release_names(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }

    /// Release names grouped into waves by chart index, ascending. Charts
    /// that share an index deploy in parallel within one wave.
    pub fn ordered_waves(&self) -> Vec<Vec<String>> {
        let mut by_index: BTreeMap<u32, Vec<String>> = BTreeMap::new();
        for (release, chart) in &self.0 {
            by_index.entry(chart.index).or_default().push(release.clone());
        }
        by_index.into_values().collect()
    }
}

/// Persistence backend for [`Config`].
pub trait ConfigStore: Send + Sync {
    fn save(&self, config: &Config) -> Result<()>;
    fn load(&self, path: &Path) -> Result<Config>;
}

/// Stores configs as YAML or JSON files, chosen by extension.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileStore;

impl ConfigStore for FileStore {
    fn save(&self, config: &Config) -> Result<()> {
        let path = config
            .path
            .as_ref()
            .ok_or_else(|| Error::StateError("config has no file path to save to".into()))?;
        let contents = match extension(path)? {
            ConfigFormat::Yaml => serde_yaml::to_string(config)?,
            ConfigFormat::Json => serde_json::to_string_pretty(config)?,
        };
        std::fs::write(path, contents)?;
        tracing::info!(path = %path.display(), "Config synced");
        Ok(())
    }

    fn load(&self, path: &Path) -> Result<Config> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::NotFoundError(format!("cannot read config {}: {}", path.display(), e))
        })?;
        let mut config: Config = match extension(path)? {
            ConfigFormat::Yaml => serde_yaml::from_str(&contents)?,
            ConfigFormat::Json => serde_json::from_str(&contents)?,
        };
        config.path = Some(path.to_path_buf());
        Ok(config)
    }
}

enum ConfigFormat {
    Yaml,
    Json,
}

fn extension(path: &Path) -> Result<ConfigFormat> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => Ok(ConfigFormat::Yaml),
        Some("json") => Ok(ConfigFormat::Json),
        other => Err(Error::ValidationError(format!(
            "unsupported config extension {:?} for {}",
            other,
            path.display()
        ))),
    }
}

/// Serializes a [`Duration`] as a short human string such as `180s` or
/// `3m`, and parses either that form or a bare number of seconds.
mod duration_str {
    use std::time::Duration;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let secs = d.as_secs();
        if secs >= 60 && secs % 60 == 0 {
            serializer.serialize_str(&format!("{}m", secs / 60))
        } else {
            serializer.serialize_str(&format!("{}s", secs))
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Seconds(u64),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => parse(&text).map_err(D::Error::custom),
        }
    }

    fn parse(text: &str) -> Result<Duration, String> {
        let text = text.trim();
        let (digits, unit) = match text.find(|c: char| !c.is_ascii_digit()) {
            Some(pos) => text.split_at(pos),
            None => (text, "s"),
        };
        let value: u64 = digits
            .parse()
            .map_err(|_| format!("invalid duration '{}'", text))?;
        let secs = match unit {
            "s" | "" => value,
            "m" => value * 60,
            "h" => value * 3600,
            _ => return Err(format!("invalid duration unit in '{}'", text)),
        };
        Ok(Duration::from_secs(secs))
    }
}
