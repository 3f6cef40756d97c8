//! Settings file: `~/.trackguard/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use trackguard_kernel::NotifierConfig;
use trackguard_kernel::alerts::TELEGRAM_API_BASE;
use trackguard_kernel::dispatch::DEFAULT_PROTOCOL;
use trackguard_kernel::geofence::DEFAULT_SAFE_ZONES;
use trackguard_runtime::{CapabilityOptions, EvaluatorConfig, JammerThresholds};
use trackguard_types::TrackError;

#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// Chat bot token. Notifications are off while empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub telegram_bot_token: String,

    #[serde(default)]
    pub telegram_chat_ids: Vec<String>,

    #[serde(default = "default_notify_timeout_ms")]
    pub notify_timeout_ms: u64,

    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    /// Concurrent evaluation tasks.
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,

    /// SQLite geofence database. Unset means an empty in-memory store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geofence_db: Option<PathBuf>,

    /// SQLite file receiving one row per won alert claim. May be the
    /// geofence database. Unset disables the audit trail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert_audit_db: Option<PathBuf>,

    #[serde(default = "default_safe_zones")]
    pub safe_zones: Vec<String>,

    #[serde(default = "default_protocol")]
    pub protocol: String,

    /// Send a cut-engine command with the jammer alert.
    #[serde(default)]
    pub cut_engine_on_jammer: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_buffered_devices: Option<usize>,

    #[serde(default)]
    pub jammer: JammerThresholds,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field(
                "telegram_bot_token",
                if self.telegram_bot_token.is_empty() { &"<not set>" } else { &"<redacted>" },
            )
            .field("telegram_chat_ids", &self.telegram_chat_ids)
            .field("notify_timeout_ms", &self.notify_timeout_ms)
            .field("store_timeout_ms", &self.store_timeout_ms)
            .field("workers", &self.workers)
            .field("bus_capacity", &self.bus_capacity)
            .field("geofence_db", &self.geofence_db)
            .field("alert_audit_db", &self.alert_audit_db)
            .field("safe_zones", &self.safe_zones)
            .field("protocol", &self.protocol)
            .field("cut_engine_on_jammer", &self.cut_engine_on_jammer)
            .field("max_buffered_devices", &self.max_buffered_devices)
            .field("jammer", &self.jammer)
            .finish()
    }
}

fn default_notify_timeout_ms() -> u64 {
    5000
}
fn default_store_timeout_ms() -> u64 {
    2000
}
fn default_workers() -> usize {
    8
}
fn default_bus_capacity() -> usize {
    1024
}
fn default_safe_zones() -> Vec<String> {
    DEFAULT_SAFE_ZONES.iter().map(|g| g.to_string()).collect()
}
fn default_protocol() -> String {
    DEFAULT_PROTOCOL.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            telegram_bot_token: String::new(),
            telegram_chat_ids: Vec::new(),
            notify_timeout_ms: default_notify_timeout_ms(),
            store_timeout_ms: default_store_timeout_ms(),
            workers: default_workers(),
            bus_capacity: default_bus_capacity(),
            geofence_db: None,
            alert_audit_db: None,
            safe_zones: default_safe_zones(),
            protocol: default_protocol(),
            cut_engine_on_jammer: false,
            max_buffered_devices: None,
            jammer: JammerThresholds::default(),
        }
    }
}

impl Config {
    pub fn notifier(&self) -> NotifierConfig {
        NotifierConfig {
            bot_token: self.telegram_bot_token.clone(),
            chat_ids: self.telegram_chat_ids.clone(),
            timeout: Duration::from_millis(self.notify_timeout_ms),
            api_base: TELEGRAM_API_BASE.to_string(),
        }
    }

    pub fn capability_options(&self) -> CapabilityOptions {
        CapabilityOptions {
            store_timeout: Duration::from_millis(self.store_timeout_ms),
            audit_groups: self.safe_zones.clone(),
            protocol: self.protocol.clone(),
            max_buffered_devices: self.max_buffered_devices,
        }
    }

    pub fn evaluator(&self) -> EvaluatorConfig {
        EvaluatorConfig {
            safe_zones: self.safe_zones.clone(),
            thresholds: self.jammer,
        }
    }
}

pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".trackguard").join("config.toml")
}

/// `Ok(None)` when no file exists yet. Environment overrides are applied
/// on top of the file.
pub fn load() -> Result<Option<Config>, TrackError> {
    let mut cfg = load_from(&config_path())?;
    if let Some(cfg) = cfg.as_mut() {
        apply_env_overrides(cfg);
    }
    Ok(cfg)
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, TrackError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| TrackError::Config(format!("failed to read {}: {e}", path.display())))?;
    toml::from_str(&raw)
        .map(Some)
        .map_err(|e| TrackError::Config(format!("failed to parse {}: {e}", path.display())))
}

/// `TRACKGUARD_*` overrides. Unparseable numbers are ignored.
///
/// | Variable | Field |
/// |---|---|
/// | `TRACKGUARD_TELEGRAM_BOT_TOKEN` | `telegram_bot_token` |
/// | `TRACKGUARD_TELEGRAM_CHAT_IDS` | `telegram_chat_ids`, comma-separated |
/// | `TRACKGUARD_GEOFENCE_DB` | `geofence_db` |
/// | `TRACKGUARD_ALERT_AUDIT_DB` | `alert_audit_db` |
/// | `TRACKGUARD_WORKERS` | `workers` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("TRACKGUARD_TELEGRAM_BOT_TOKEN") {
        cfg.telegram_bot_token = v;
    }
    if let Ok(v) = std::env::var("TRACKGUARD_TELEGRAM_CHAT_IDS") {
        cfg.telegram_chat_ids = v
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(String::from)
            .collect();
    }
    if let Ok(v) = std::env::var("TRACKGUARD_GEOFENCE_DB") {
        cfg.geofence_db = (!v.is_empty()).then(|| PathBuf::from(v));
    }
    if let Ok(v) = std::env::var("TRACKGUARD_ALERT_AUDIT_DB") {
        cfg.alert_audit_db = (!v.is_empty()).then(|| PathBuf::from(v));
    }
    if let Ok(v) = std::env::var("TRACKGUARD_WORKERS")
        && let Ok(n) = v.parse::<usize>()
        && n > 0
    {
        cfg.workers = n;
    }
}

pub fn save(cfg: &Config) -> Result<(), TrackError> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), TrackError> {
    let io_err = |what: &str, e: std::io::Error| TrackError::Config(format!("{what} {}: {e}", path.display()));

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| io_err("failed to create directory for", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| io_err("failed to restrict directory of", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg).map_err(|e| TrackError::Config(format!("failed to serialize config: {e}")))?;

    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(|e| io_err("failed to write", e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(|e| io_err("failed to write", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_bot_token() {
        let mut cfg = Config::default();
        assert!(format!("{cfg:?}").contains("<not set>"));
        cfg.telegram_bot_token = "123456:ABC-secret".into();
        let shown = format!("{cfg:?}");
        assert!(!shown.contains("ABC-secret"));
        assert!(shown.contains("<redacted>"));
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.notify_timeout_ms, 5000);
        assert_eq!(cfg.store_timeout_ms, 2000);
        assert_eq!(cfg.workers, 8);
        assert_eq!(cfg.bus_capacity, 1024);
        assert_eq!(cfg.safe_zones, vec!["Taller", "CLIENTES", "Resguardo/Cedis/Puerto"]);
        assert_eq!(cfg.protocol, "meitrack");
        assert_eq!(cfg.jammer.offline_minutes, 5);
        assert!(!cfg.notifier().is_configured());
    }

    #[test]
    fn partial_file_fills_defaults() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.toml");
        fs::write(&path, "workers = 3\n\n[jammer]\nmin_avg_speed = 30\n")?;
        let cfg = load_from(&path)?.ok_or("missing config")?;
        assert_eq!(cfg.workers, 3);
        assert_eq!(cfg.jammer.min_avg_speed, 30);
        assert_eq!(cfg.jammer.max_avg_signal, 15);
        assert_eq!(cfg.bus_capacity, 1024);
        Ok(())
    }

    #[test]
    fn unparseable_file_is_config_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.toml");
        fs::write(&path, "workers = \"many\"")?;
        assert!(matches!(load_from(&path), Err(TrackError::Config(_))));
        Ok(())
    }

    #[test]
    fn save_then_load() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = config_path_for_home(&dir.path().to_string_lossy());
        let mut cfg = Config::default();
        cfg.geofence_db = Some(dir.path().join("geo.db"));
        cfg.alert_audit_db = Some(dir.path().join("geo.db"));
        cfg.telegram_chat_ids = vec!["-100200".into()];
        cfg.cut_engine_on_jammer = true;
        save_to(&cfg, &path)?;

        let loaded = load_from(&path)?.ok_or("missing config")?;
        assert_eq!(loaded.geofence_db, cfg.geofence_db);
        assert_eq!(loaded.alert_audit_db, cfg.alert_audit_db);
        assert_eq!(loaded.telegram_chat_ids, vec!["-100200"]);
        assert!(loaded.cut_engine_on_jammer);
        assert_eq!(loaded.jammer, JammerThresholds::default());
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn saved_file_is_owner_only() -> Result<(), Box<dyn std::error::Error>> {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir()?;
        let path = config_path_for_home(&dir.path().to_string_lossy());
        save_to(&Config::default(), &path)?;
        assert_eq!(fs::metadata(&path)?.permissions().mode() & 0o777, 0o600);
        let parent = path.parent().ok_or("no parent")?;
        assert_eq!(fs::metadata(parent)?.permissions().mode() & 0o777, 0o700);
        Ok(())
    }

    #[test]
    fn missing_file_is_none() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        assert!(load_from(&config_path_for_home(&dir.path().to_string_lossy()))?.is_none());
        Ok(())
    }

    #[test]
    fn env_overrides_apply() {
        // SAFETY: only this test touches these variables.
        unsafe {
            std::env::set_var("TRACKGUARD_TELEGRAM_CHAT_IDS", "1, 2,,3");
            std::env::set_var("TRACKGUARD_WORKERS", "16");
            std::env::set_var("TRACKGUARD_GEOFENCE_DB", "/var/lib/trackguard/geo.db");
            std::env::set_var("TRACKGUARD_ALERT_AUDIT_DB", "/var/lib/trackguard/audit.db");
        }
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.telegram_chat_ids, vec!["1", "2", "3"]);
        assert_eq!(cfg.workers, 16);
        assert_eq!(cfg.geofence_db, Some(PathBuf::from("/var/lib/trackguard/geo.db")));
        assert_eq!(cfg.alert_audit_db, Some(PathBuf::from("/var/lib/trackguard/audit.db")));

        unsafe { std::env::set_var("TRACKGUARD_WORKERS", "zero") };
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.workers, 16);
        unsafe {
            std::env::remove_var("TRACKGUARD_TELEGRAM_CHAT_IDS");
            std::env::remove_var("TRACKGUARD_WORKERS");
            std::env::remove_var("TRACKGUARD_GEOFENCE_DB");
            std::env::remove_var("TRACKGUARD_ALERT_AUDIT_DB");
        }
    }
}
