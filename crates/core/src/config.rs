//! Hub and client configuration (TOML)
//!
//! Every recognized key is enumerated into an explicit record below.
//! Unknown keys warn, missing required keys fail at startup, and the
//! legacy `[hub] data_dir` key is accepted as a synonym for
//! `[server] data_root` (the latter wins when both are present).

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use color_eyre::Result;
use color_eyre::eyre::{WrapErr, bail, eyre};
use serde::Deserialize;
use tracing::warn;
use url::Url;

use crate::freshness::{DEFAULT_NEWER_RATIO_THRESHOLD, MtimeGranularity};

/// Default debounce between the two stability scans
pub const DEFAULT_DEBOUNCE_SECONDS: u64 = 60;
/// Default scheduler tick interval
pub const DEFAULT_INTERVAL_MINUTES: u64 = 10;
/// Default number of archive versions kept per dataset
pub const DEFAULT_KEEP_VERSIONS: usize = 2;
/// Default download attempt budget on the client
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default first backoff step on the client
pub const DEFAULT_INITIAL_BACKOFF_SECONDS: u64 = 1;
/// Default overall deadline for package downloads
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECONDS: u64 = 300;
/// Overall deadline for listing requests
pub const LISTING_TIMEOUT: Duration = Duration::from_secs(30);

/// Hub configuration (see the `[server]`, `[freshness]`, `[scheduler]`,
/// `[packaging]` and `[[datasets]]` tables)
#[derive(Debug, Deserialize)]
pub struct HubConfig {
    pub server: ServerSection,
    #[serde(default)]
    pub freshness: FreshnessSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub packaging: PackagingSection,
    #[serde(default)]
    pub datasets: Vec<DatasetSpec>,
    pub state_file: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub data_root: PathBuf,
    pub cache_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct FreshnessSection {
    pub debounce_seconds: u64,
    pub mtime_granularity: MtimeGranularity,
}

impl Default for FreshnessSection {
    fn default() -> Self {
        Self {
            debounce_seconds: DEFAULT_DEBOUNCE_SECONDS,
            mtime_granularity: MtimeGranularity::Minute,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub interval_minutes: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            interval_minutes: DEFAULT_INTERVAL_MINUTES,
        }
    }
}

/// Archive container format; the wire contract speaks zip
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveFormat {
    #[default]
    Zip,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PackagingSection {
    pub format: ArchiveFormat,
    pub keep_versions: usize,
}

impl Default for PackagingSection {
    fn default() -> Self {
        Self {
            format: ArchiveFormat::Zip,
            keep_versions: DEFAULT_KEEP_VERSIONS,
        }
    }
}

/// One dataset in the hub's registry
#[derive(Debug, Clone, Deserialize)]
pub struct DatasetSpec {
    pub name: String,
    pub path: PathBuf,
    #[serde(default = "default_threshold")]
    pub newer_ratio_threshold: f64,
}

impl DatasetSpec {
    /// Absolute source directory for this dataset
    #[must_use]
    pub fn source_path(&self, data_root: &Path) -> PathBuf {
        data_root.join(&self.path)
    }
}

impl HubConfig {
    /// Load and validate a hub configuration file
    ///
    /// # Errors
    /// Returns an error when the file is unreadable, does not parse,
    /// or fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .wrap_err_with(|| format!("reading configuration {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse and validate a hub configuration document
    ///
    /// # Errors
    /// Returns an error on syntax, missing required keys, or invalid
    /// values.
    pub fn parse(content: &str) -> Result<Self> {
        let mut root: toml::Table = content
            .parse()
            .map_err(|e| eyre!("invalid configuration: {e}"))?;

        warn_unknown_keys(
            &root,
            &[
                "server", "hub", "freshness", "scheduler", "packaging", "datasets", "state_file",
            ],
            "",
        );
        if let Some(server) = root.get("server").and_then(toml::Value::as_table) {
            warn_unknown_keys(server, &["host", "port", "data_root", "cache_dir"], "server.");
        }
        if let Some(hub) = root.get("hub").and_then(toml::Value::as_table) {
            warn_unknown_keys(hub, &["data_dir"], "hub.");
        }
        if let Some(freshness) = root.get("freshness").and_then(toml::Value::as_table) {
            warn_unknown_keys(
                freshness,
                &["debounce_seconds", "mtime_granularity"],
                "freshness.",
            );
        }
        if let Some(scheduler) = root.get("scheduler").and_then(toml::Value::as_table) {
            warn_unknown_keys(scheduler, &["interval_minutes"], "scheduler.");
        }
        if let Some(packaging) = root.get("packaging").and_then(toml::Value::as_table) {
            warn_unknown_keys(packaging, &["format", "keep_versions"], "packaging.");
        }
        if let Some(datasets) = root.get("datasets").and_then(toml::Value::as_array) {
            for dataset in datasets.iter().filter_map(toml::Value::as_table) {
                warn_unknown_keys(
                    dataset,
                    &["name", "path", "newer_ratio_threshold"],
                    "datasets.",
                );
            }
        }

        apply_data_dir_synonym(&mut root);

        let config: Self = toml::Value::Table(root)
            .try_into()
            .map_err(|e| eyre!("invalid configuration: {e}"))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.datasets.is_empty() {
            bail!("configuration declares no datasets");
        }

        let mut seen = HashSet::new();
        for dataset in &self.datasets {
            if !is_url_safe_name(&dataset.name) {
                bail!("dataset name `{}` is not URL-safe", dataset.name);
            }
            if !seen.insert(dataset.name.as_str()) {
                bail!("duplicate dataset name `{}`", dataset.name);
            }
            if !(0.0..=1.0).contains(&dataset.newer_ratio_threshold) {
                bail!(
                    "newer_ratio_threshold for `{}` must be within [0, 1]",
                    dataset.name
                );
            }
        }

        if self.packaging.keep_versions == 0 {
            bail!("packaging.keep_versions must be at least 1");
        }
        if self.scheduler.interval_minutes == 0 {
            bail!("scheduler.interval_minutes must be at least 1");
        }

        Ok(())
    }

    /// Debounce window as a [`Duration`]
    #[must_use]
    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.freshness.debounce_seconds)
    }

    /// Tick interval as a [`Duration`]
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.interval_minutes * 60)
    }
}

/// Client configuration (see the `[hub]`, `[retries]`, `[logging]` and
/// `[[datasets]]` tables)
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    pub hub: HubEndpoint,
    #[serde(default)]
    pub retries: RetrySection,
    #[serde(default)]
    pub datasets: Vec<ClientDataset>,
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Deserialize)]
pub struct HubEndpoint {
    pub url: Url,
    #[serde(default = "default_download_timeout")]
    pub timeout: u64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max: u32,
    pub initial_backoff_seconds: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max: DEFAULT_MAX_RETRIES,
            initial_backoff_seconds: DEFAULT_INITIAL_BACKOFF_SECONDS,
        }
    }
}

/// One dataset the client mirrors
#[derive(Debug, Clone, Deserialize)]
pub struct ClientDataset {
    pub name: String,
    pub local_dir: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: Option<String>,
    pub file: Option<PathBuf>,
}

impl ClientConfig {
    /// Load and validate a client configuration file
    ///
    /// # Errors
    /// Returns an error when the file is unreadable, does not parse,
    /// or fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .wrap_err_with(|| format!("reading configuration {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse and validate a client configuration document
    ///
    /// # Errors
    /// Returns an error on syntax, missing required keys, or invalid
    /// values.
    pub fn parse(content: &str) -> Result<Self> {
        let root: toml::Table = content
            .parse()
            .map_err(|e| eyre!("invalid configuration: {e}"))?;

        warn_unknown_keys(
            &root,
            &[
                "hub", "retries", "datasets", "state_file", "scratch_dir", "logging",
            ],
            "",
        );
        if let Some(hub) = root.get("hub").and_then(toml::Value::as_table) {
            warn_unknown_keys(hub, &["url", "timeout"], "hub.");
        }
        if let Some(retries) = root.get("retries").and_then(toml::Value::as_table) {
            warn_unknown_keys(retries, &["max", "initial_backoff_seconds"], "retries.");
        }
        if let Some(logging) = root.get("logging").and_then(toml::Value::as_table) {
            warn_unknown_keys(logging, &["level", "file"], "logging.");
        }
        if let Some(datasets) = root.get("datasets").and_then(toml::Value::as_array) {
            for dataset in datasets.iter().filter_map(toml::Value::as_table) {
                warn_unknown_keys(dataset, &["name", "local_dir"], "datasets.");
            }
        }

        let config: Self = toml::Value::Table(root)
            .try_into()
            .map_err(|e| eyre!("invalid configuration: {e}"))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        match self.hub.url.scheme() {
            "http" | "https" => {}
            other => bail!("hub.url must be http or https, got `{other}`"),
        }

        let mut seen = HashSet::new();
        for dataset in &self.datasets {
            if !is_url_safe_name(&dataset.name) {
                bail!("dataset name `{}` is not URL-safe", dataset.name);
            }
            if !seen.insert(dataset.name.as_str()) {
                bail!("duplicate dataset name `{}`", dataset.name);
            }
            if dataset.local_dir.as_os_str().is_empty() {
                bail!("dataset `{}` has an empty local_dir", dataset.name);
            }
        }

        Ok(())
    }

    /// Scratch directory for a dataset's partial downloads
    #[must_use]
    pub fn scratch_dir(&self, dataset: &ClientDataset) -> PathBuf {
        self.scratch_dir
            .clone()
            .unwrap_or_else(|| dataset.local_dir.join(".scratch"))
    }

    /// Overall deadline for package downloads
    #[must_use]
    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.hub.timeout)
    }

    /// First backoff step of the retry schedule
    #[must_use]
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_secs(self.retries.initial_backoff_seconds)
    }
}

/// Whether a dataset name is safe to appear in URLs and file names
#[must_use]
pub fn is_url_safe_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && !name.contains("..")
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn apply_data_dir_synonym(root: &mut toml::Table) {
    let Some(data_dir) = root
        .get("hub")
        .and_then(toml::Value::as_table)
        .and_then(|hub| hub.get("data_dir"))
        .cloned()
    else {
        root.remove("hub");
        return;
    };
    root.remove("hub");

    let server = root
        .entry("server")
        .or_insert_with(|| toml::Value::Table(toml::Table::new()));
    if let Some(table) = server.as_table_mut() {
        if table.contains_key("data_root") {
            warn!("both server.data_root and hub.data_dir set; using server.data_root");
        } else {
            warn!("hub.data_dir is deprecated, prefer server.data_root");
            let _ = table.insert("data_root".to_string(), data_dir);
        }
    }
}

fn warn_unknown_keys(table: &toml::Table, allowed: &[&str], prefix: &str) {
    for key in table.keys() {
        if !allowed.contains(&key.as_str()) {
            warn!("unrecognized configuration key `{prefix}{key}`");
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_threshold() -> f64 {
    DEFAULT_NEWER_RATIO_THRESHOLD
}

fn default_state_file() -> PathBuf {
    PathBuf::from(".last_sync.json")
}

fn default_download_timeout() -> u64 {
    DEFAULT_DOWNLOAD_TIMEOUT_SECONDS
}

#[cfg(test)]
mod tests {
    use super::*;

    const HUB_MINIMAL: &str = r#"
state_file = "hub_state.json"

[server]
data_root = "/data"
cache_dir = "/cache"

[[datasets]]
name = "quotes"
path = "quotes"
"#;

    #[test]
    fn test_hub_defaults_applied() {
        let config = HubConfig::parse(HUB_MINIMAL).unwrap();

        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.freshness.debounce_seconds, 60);
        assert_eq!(config.freshness.mtime_granularity, MtimeGranularity::Minute);
        assert_eq!(config.scheduler.interval_minutes, 10);
        assert_eq!(config.packaging.format, ArchiveFormat::Zip);
        assert_eq!(config.packaging.keep_versions, 2);
        assert!((config.datasets[0].newer_ratio_threshold - 0.30).abs() < f64::EPSILON);
    }

    #[test]
    fn test_hub_missing_required_key_fails() {
        let incomplete = r#"
state_file = "hub_state.json"

[server]
cache_dir = "/cache"

[[datasets]]
name = "quotes"
path = "quotes"
"#;
        assert!(HubConfig::parse(incomplete).is_err());
    }

    #[test]
    fn test_hub_without_datasets_fails() {
        let empty = r#"
state_file = "hub_state.json"

[server]
data_root = "/data"
cache_dir = "/cache"
"#;
        assert!(HubConfig::parse(empty).is_err());
    }

    #[test]
    fn test_data_dir_synonym_accepted() {
        let legacy = r#"
state_file = "hub_state.json"

[hub]
data_dir = "/legacy/data"

[server]
cache_dir = "/cache"

[[datasets]]
name = "quotes"
path = "quotes"
"#;
        let config = HubConfig::parse(legacy).unwrap();
        assert_eq!(config.server.data_root, PathBuf::from("/legacy/data"));
    }

    #[test]
    fn test_data_root_wins_over_synonym() {
        let both = r#"
state_file = "hub_state.json"

[hub]
data_dir = "/legacy/data"

[server]
data_root = "/data"
cache_dir = "/cache"

[[datasets]]
name = "quotes"
path = "quotes"
"#;
        let config = HubConfig::parse(both).unwrap();
        assert_eq!(config.server.data_root, PathBuf::from("/data"));
    }

    #[test]
    fn test_unknown_keys_do_not_fail() {
        let extra = r#"
state_file = "hub_state.json"
surprise = true

[server]
data_root = "/data"
cache_dir = "/cache"
flux_capacitor = 88

[[datasets]]
name = "quotes"
path = "quotes"
"#;
        assert!(HubConfig::parse(extra).is_ok());
    }

    #[test]
    fn test_rejects_unsafe_dataset_name() {
        let unsafe_name = r#"
state_file = "hub_state.json"

[server]
data_root = "/data"
cache_dir = "/cache"

[[datasets]]
name = "../etc"
path = "quotes"
"#;
        assert!(HubConfig::parse(unsafe_name).is_err());
    }

    #[test]
    fn test_rejects_threshold_out_of_range() {
        let bad = r#"
state_file = "hub_state.json"

[server]
data_root = "/data"
cache_dir = "/cache"

[[datasets]]
name = "quotes"
path = "quotes"
newer_ratio_threshold = 1.5
"#;
        assert!(HubConfig::parse(bad).is_err());
    }

    #[test]
    fn test_rejects_unknown_packaging_format() {
        let bad = r#"
state_file = "hub_state.json"

[server]
data_root = "/data"
cache_dir = "/cache"

[packaging]
format = "tar"

[[datasets]]
name = "quotes"
path = "quotes"
"#;
        assert!(HubConfig::parse(bad).is_err());
    }

    const CLIENT_MINIMAL: &str = r#"
[hub]
url = "https://hub.example.com"

[[datasets]]
name = "quotes"
local_dir = "/srv/data/quotes"
"#;

    #[test]
    fn test_client_defaults_applied() {
        let config = ClientConfig::parse(CLIENT_MINIMAL).unwrap();

        assert_eq!(config.hub.timeout, 300);
        assert_eq!(config.retries.max, 3);
        assert_eq!(config.retries.initial_backoff_seconds, 1);
        assert_eq!(config.state_file, PathBuf::from(".last_sync.json"));
        assert_eq!(
            config.scratch_dir(&config.datasets[0]),
            PathBuf::from("/srv/data/quotes/.scratch")
        );
    }

    #[test]
    fn test_client_scratch_override() {
        let with_scratch = r#"
scratch_dir = "/var/tmp/hubsync"

[hub]
url = "https://hub.example.com"

[[datasets]]
name = "quotes"
local_dir = "/srv/data/quotes"
"#;
        let config = ClientConfig::parse(with_scratch).unwrap();
        assert_eq!(
            config.scratch_dir(&config.datasets[0]),
            PathBuf::from("/var/tmp/hubsync")
        );
    }

    #[test]
    fn test_client_requires_hub_url() {
        assert!(ClientConfig::parse("[[datasets]]\nname = \"q\"\nlocal_dir = \"/d\"\n").is_err());
    }

    #[test]
    fn test_client_rejects_non_http_scheme() {
        let ftp = r#"
[hub]
url = "ftp://hub.example.com"
"#;
        assert!(ClientConfig::parse(ftp).is_err());
    }

    #[test]
    fn test_url_safe_names() {
        assert!(is_url_safe_name("stock-trading-data-pro"));
        assert!(is_url_safe_name("quotes_v2.daily"));
        assert!(!is_url_safe_name(""));
        assert!(!is_url_safe_name("a/b"));
        assert!(!is_url_safe_name("."));
        assert!(!is_url_safe_name(".."));
        assert!(!is_url_safe_name("name with spaces"));
    }
}
