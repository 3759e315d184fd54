//! TOML configuration.
//!
//! Every section has defaults, so an absent file is a valid configuration.
//! A present file is parsed strictly: unknown keys are rejected.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    /// Upper bound on waiting for in-flight HTTP requests during stop.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: default_data_dir(),
            pid_file: default_pid_file(),
            socket_path: default_socket_path(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_data_dir() -> PathBuf {
    home_dir().join(".local/share/diu")
}
fn default_pid_file() -> PathBuf {
    PathBuf::from("/tmp/diu.pid")
}
fn default_socket_path() -> PathBuf {
    PathBuf::from("/tmp/diu.sock")
}
fn default_shutdown_grace_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    #[serde(default = "default_json_file")]
    pub json_file: PathBuf,
    #[serde(default = "default_true")]
    pub backup_enabled: bool,
    #[serde(default = "default_backup_interval")]
    pub backup_interval: String,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            json_file: default_json_file(),
            backup_enabled: true,
            backup_interval: default_backup_interval(),
            retention_days: default_retention_days(),
        }
    }
}

fn default_json_file() -> PathBuf {
    default_data_dir().join("executions.json")
}
fn default_backup_interval() -> String {
    "24h".to_string()
}
fn default_retention_days() -> u32 {
    365
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonitoringConfig {
    #[serde(default = "default_enabled_tools")]
    pub enabled_tools: Vec<String>,
    /// Directory holding the generated wrapper scripts; skipped during
    /// binary discovery so a wrapper is never mistaken for the real tool.
    #[serde(default = "default_wrapper_dir")]
    pub wrapper_dir: PathBuf,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled_tools: default_enabled_tools(),
            wrapper_dir: default_wrapper_dir(),
        }
    }
}

fn default_enabled_tools() -> Vec<String> {
    ["homebrew", "npm", "go", "pip", "cargo"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_wrapper_dir() -> PathBuf {
    home_dir().join(".local/bin/diu-wrappers")
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolsConfig {
    #[serde(default)]
    pub homebrew: HomebrewConfig,
    #[serde(default)]
    pub npm: NpmConfig,
    #[serde(default)]
    pub go: GoConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HomebrewConfig {
    /// Empty means auto-detect.
    #[serde(default)]
    pub cellar_paths: Vec<PathBuf>,
    #[serde(default = "default_true")]
    pub track_casks: bool,
}

impl Default for HomebrewConfig {
    fn default() -> Self {
        Self {
            cellar_paths: Vec::new(),
            track_casks: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NpmConfig {
    #[serde(default = "default_true")]
    pub track_global_only: bool,
}

impl Default for NpmConfig {
    fn default() -> Self {
        Self {
            track_global_only: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GoConfig {
    /// Empty means `$GOPATH`, then `~/go`.
    #[serde(default)]
    pub gopath: String,
    /// Empty means `$GOBIN`, then `$GOPATH/bin`.
    #[serde(default)]
    pub gobin: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_enabled: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            port: default_port(),
            cors_enabled: false,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8081
}

impl Config {
    pub fn backup_interval(&self) -> Result<Duration> {
        parse_duration(&self.storage.backup_interval)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.storage.retention_days) * 86_400)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.daemon.shutdown_grace_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage.json_file.as_os_str().is_empty() {
            bail!("storage.json_file must not be empty");
        }
        let interval = self
            .backup_interval()
            .context("storage.backup_interval is invalid")?;
        if interval.is_zero() {
            bail!("storage.backup_interval must be greater than zero");
        }
        if !LOG_LEVELS.contains(&self.daemon.log_level.as_str()) {
            bail!(
                "daemon.log_level must be one of {}, got '{}'",
                LOG_LEVELS.join(", "),
                self.daemon.log_level
            );
        }
        if self.api.enabled && self.api.host.trim().is_empty() {
            bail!("api.host must not be empty when the API is enabled");
        }
        Ok(())
    }

    /// Creates the data directory and the storage file's parent.
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.daemon.data_dir).with_context(|| {
            format!(
                "Failed to create data directory: {}",
                self.daemon.data_dir.display()
            )
        })?;
        if let Some(parent) = self.storage.json_file.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create storage directory: {}", parent.display())
                })?;
            }
        }
        Ok(())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create config directory: {}", parent.display())
                })?;
            }
        }
        let content = toml::to_string_pretty(self).context("Failed to encode config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }

    fn expand_paths(&mut self) {
        self.daemon.data_dir = expand_home(&self.daemon.data_dir);
        self.daemon.pid_file = expand_home(&self.daemon.pid_file);
        self.daemon.socket_path = expand_home(&self.daemon.socket_path);
        self.storage.json_file = expand_home(&self.storage.json_file);
        self.monitoring.wrapper_dir = expand_home(&self.monitoring.wrapper_dir);
        for path in &mut self.tools.homebrew.cellar_paths {
            *path = expand_home(path);
        }
    }
}

pub fn default_config_path() -> PathBuf {
    home_dir().join(".config/diu/config.toml")
}

/// Loads the configuration at `path`. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<Config> {
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str::<Config>(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?
    } else {
        Config::default()
    };

    config.expand_paths();
    config.validate()?;
    Ok(config)
}

/// Parses `<n><unit>` where unit is `s`, `min`, `h`, `d`, `w` or `m`
/// (a 30-day month).
pub fn parse_duration(input: &str) -> Result<Duration> {
    let input = input.trim();
    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (digits, unit) = input.split_at(split);
    if digits.is_empty() {
        bail!("invalid duration '{input}': expected a number followed by a unit");
    }
    let n: u64 = digits
        .parse()
        .with_context(|| format!("invalid duration '{input}'"))?;

    let secs_per_unit = match unit {
        "s" => 1,
        "min" => 60,
        "h" => 3_600,
        "d" => 86_400,
        "w" => 7 * 86_400,
        "m" => 30 * 86_400,
        "" => bail!("invalid duration '{input}': missing unit"),
        other => bail!("invalid duration '{input}': unknown unit '{other}'"),
    };

    n.checked_mul(secs_per_unit)
        .map(Duration::from_secs)
        .with_context(|| format!("duration '{input}' is too large"))
}

/// The instant `window` before `now`, or `None` when it falls outside the
/// range `DateTime<Utc>` can represent.
pub fn checked_window_start(now: DateTime<Utc>, window: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|window| now.checked_sub_signed(window))
}

/// Parses a relative window such as `7d` and resolves it against `now`.
pub fn window_start(now: DateTime<Utc>, input: &str) -> Result<DateTime<Utc>> {
    let window = parse_duration(input)?;
    checked_window_start(now, window)
        .with_context(|| format!("duration '{}' is too large", input.trim()))
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => home_dir().join(rest),
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = load_config(&tmp.path().join("absent.toml")).unwrap();
        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.api.port, 8081);
        assert_eq!(config.storage.retention_days, 365);
        assert_eq!(config.monitoring.enabled_tools.len(), 5);
        assert!(config.tools.npm.track_global_only);
    }

    #[test]
    fn test_partial_file_and_home_expansion() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[storage]
json_file = "~/diu-data/executions.json"
backup_interval = "7d"

[api]
enabled = false
"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert!(!config.api.enabled);
        assert!(!config.storage.json_file.starts_with("~"));
        assert!(config.storage.json_file.ends_with("diu-data/executions.json"));
        assert_eq!(
            config.backup_interval().unwrap(),
            Duration::from_secs(7 * 86_400)
        );
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[daemon]\nlog_levle = \"debug\"\n").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn test_validation_failures() {
        let mut config = Config::default();
        config.daemon.log_level = "verbose".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.storage.backup_interval = "0h".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.api.host = "  ".into();
        assert!(config.validate().is_err());
        config.api.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_then_load() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("nested/config.toml");
        let mut config = Config::default();
        config.api.port = 9999;
        config.monitoring.enabled_tools = vec!["npm".into()];
        config.save_to(&path).unwrap();

        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.api.port, 9999);
        assert_eq!(loaded.monitoring.enabled_tools, vec!["npm"]);
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("15min").unwrap(), Duration::from_secs(900));
        assert_eq!(parse_duration("24h").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse_duration("2w").unwrap(), Duration::from_secs(14 * 86_400));
        assert_eq!(parse_duration("3m").unwrap(), Duration::from_secs(90 * 86_400));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        for bad in ["", "h", "12", "1h30m", "5y", "-1d"] {
            assert!(parse_duration(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_window_start_out_of_range() {
        use chrono::TimeZone;
        let now = Utc.with_ymd_and_hms(2024, 6, 10, 12, 0, 0).unwrap();
        assert_eq!(
            window_start(now, "1d").unwrap(),
            Utc.with_ymd_and_hms(2024, 6, 9, 12, 0, 0).unwrap()
        );

        // Parses fine but reaches past the earliest representable date.
        let err = window_start(now, "100000000d").unwrap_err();
        assert!(err.to_string().contains("too large"), "{err}");
        assert!(checked_window_start(now, Duration::from_secs(u64::MAX)).is_none());
    }
}
