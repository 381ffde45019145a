//! Runtime configuration.
//!
//! Layered: built-in defaults, then environment variables, then
//! per-installation overrides kept in the `local_settings` table. A value
//! that fails to parse is logged and skipped; the previous layer wins.

use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use rusqlite::Connection;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::db;
use crate::meter::HighVolumePolicy;

pub const ENV_DATA_DIR: &str = "FUEL_CLOSING_DATA_DIR";
pub const ENV_REMOTE_URL: &str = "FUEL_CLOSING_REMOTE_URL";
pub const ENV_API_KEY: &str = "FUEL_CLOSING_API_KEY";
pub const ENV_HIGH_VOLUME: &str = "FUEL_CLOSING_HIGH_VOLUME_LITERS";

/// `local_settings` category for closing overrides.
pub const SETTINGS_CATEGORY: &str = "closing";
pub const KEY_HIGH_VOLUME: &str = "high_volume_threshold_liters";
pub const KEY_HIGH_VOLUME_PER_FUEL: &str = "high_volume_per_fuel";

const DEFAULT_DATA_DIR: &str = "fuel-closing-data";
const DEFAULT_LOG_RETENTION: usize = 14;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConfig {
    pub base_url: String,
    pub api_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClosingConfig {
    pub data_dir: PathBuf,
    pub log_retention_files: usize,
    pub high_volume: HighVolumePolicy,
    pub remote: Option<RemoteConfig>,
}

impl Default for ClosingConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            log_retention_files: DEFAULT_LOG_RETENTION,
            high_volume: HighVolumePolicy::default(),
            remote: None,
        }
    }
}

/// Parse a positive liter threshold.
fn parse_threshold(raw: &str) -> Option<Decimal> {
    Decimal::from_str(raw.trim())
        .ok()
        .filter(|d| *d > Decimal::ZERO)
}

/// A closing override from `local_settings`. Read failures are logged and
/// leave the previous layer in place.
fn stored_setting(conn: &Connection, key: &str) -> Option<String> {
    db::get_setting(conn, SETTINGS_CATEGORY, key).unwrap_or_else(|e| {
        warn!(key, error = %e, "Failed to read stored closing setting");
        None
    })
}

fn non_blank_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl ClosingConfig {
    /// Defaults overlaid with the process environment.
    ///
    /// Invalid values are reported through `tracing`; callers that set up
    /// logging from the data directory should use [`Self::data_dir_from_env`]
    /// first and [`Self::apply_env`] once the subscriber is installed.
    pub fn from_env() -> Self {
        let mut config = Self {
            data_dir: Self::data_dir_from_env(),
            ..Self::default()
        };
        config.apply_env();
        config
    }

    /// Data directory from the environment, or the default. Never logs.
    pub fn data_dir_from_env() -> PathBuf {
        non_blank_env(ENV_DATA_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
    }

    /// Overlay every environment setting except the data directory.
    pub fn apply_env(&mut self) {
        if let Some(raw) = non_blank_env(ENV_HIGH_VOLUME) {
            match parse_threshold(&raw) {
                Some(limit) => self.high_volume.default_threshold_liters = limit,
                None => warn!(var = ENV_HIGH_VOLUME, value = %raw, "Ignoring invalid high-volume threshold"),
            }
        }

        match (non_blank_env(ENV_REMOTE_URL), non_blank_env(ENV_API_KEY)) {
            (Some(base_url), Some(api_key)) => {
                self.remote = Some(RemoteConfig { base_url, api_key });
            }
            (Some(_), None) => {
                warn!(var = ENV_API_KEY, "Remote URL set without an API key; using local store");
            }
            _ => {}
        }
    }

    /// Overlay installation overrides from `local_settings`.
    pub fn apply_local_overrides(&mut self, conn: &Connection) {
        if let Some(raw) = stored_setting(conn, KEY_HIGH_VOLUME) {
            match parse_threshold(&raw) {
                Some(limit) => {
                    info!(threshold = %limit, "Using stored high-volume threshold");
                    self.high_volume.default_threshold_liters = limit;
                }
                None => warn!(value = %raw, "Ignoring invalid stored high-volume threshold"),
            }
        }

        if let Some(raw) = stored_setting(conn, KEY_HIGH_VOLUME_PER_FUEL) {
            match serde_json::from_str::<BTreeMap<i64, Decimal>>(&raw) {
                Ok(per_fuel) if per_fuel.values().all(|d| *d > Decimal::ZERO) => {
                    self.high_volume.per_fuel = per_fuel;
                }
                Ok(_) => warn!("Ignoring per-fuel thresholds with non-positive values"),
                Err(e) => warn!(error = %e, "Ignoring unreadable per-fuel thresholds"),
            }
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        crate::diagnostics::get_log_dir(&self.data_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for var in [ENV_DATA_DIR, ENV_REMOTE_URL, ENV_API_KEY, ENV_HIGH_VOLUME] {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults_without_env() {
        clear_env();
        let config = ClosingConfig::from_env();
        assert_eq!(config, ClosingConfig::default());
        assert_eq!(config.high_volume.default_threshold_liters, Decimal::from(3000));
        assert_eq!(config.log_retention_files, 14);
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        env::set_var(ENV_DATA_DIR, "/var/lib/closing");
        env::set_var(ENV_HIGH_VOLUME, "4500");
        env::set_var(ENV_REMOTE_URL, "https://abc.supabase.co");
        env::set_var(ENV_API_KEY, "anon");

        let config = ClosingConfig::from_env();
        clear_env();

        assert_eq!(config.data_dir, PathBuf::from("/var/lib/closing"));
        assert_eq!(config.high_volume.default_threshold_liters, Decimal::from(4500));
        assert_eq!(
            config.remote,
            Some(RemoteConfig {
                base_url: "https://abc.supabase.co".into(),
                api_key: "anon".into(),
            })
        );
    }

    #[test]
    #[serial]
    fn test_invalid_env_values_are_ignored() {
        clear_env();
        env::set_var(ENV_HIGH_VOLUME, "lots");
        env::set_var(ENV_REMOTE_URL, "https://abc.supabase.co");

        let config = ClosingConfig::from_env();
        clear_env();

        assert_eq!(config.high_volume.default_threshold_liters, Decimal::from(3000));
        assert_eq!(config.remote, None);
    }

    #[test]
    #[serial]
    fn test_apply_env_leaves_data_dir_alone() {
        clear_env();
        env::set_var(ENV_DATA_DIR, "/var/lib/closing");
        env::set_var(ENV_HIGH_VOLUME, "5000");

        assert_eq!(ClosingConfig::data_dir_from_env(), PathBuf::from("/var/lib/closing"));
        let mut config = ClosingConfig {
            data_dir: PathBuf::from("/from/cli"),
            ..ClosingConfig::default()
        };
        config.apply_env();
        clear_env();

        assert_eq!(config.data_dir, PathBuf::from("/from/cli"));
        assert_eq!(config.high_volume.default_threshold_liters, Decimal::from(5000));
        assert_eq!(ClosingConfig::data_dir_from_env(), PathBuf::from(DEFAULT_DATA_DIR));
    }

    #[test]
    fn test_unreadable_settings_table_keeps_defaults() {
        let state = db::open_in_memory().unwrap();
        let conn = state.lock().unwrap();
        conn.execute_batch("DROP TABLE local_settings").unwrap();

        let mut config = ClosingConfig::default();
        config.apply_local_overrides(&conn);

        assert_eq!(config, ClosingConfig::default());
    }

    #[test]
    fn test_local_overrides() {
        let state = db::open_in_memory().unwrap();
        let conn = state.lock().unwrap();
        db::set_setting(&conn, SETTINGS_CATEGORY, KEY_HIGH_VOLUME, "2500").unwrap();
        db::set_setting(&conn, SETTINGS_CATEGORY, KEY_HIGH_VOLUME_PER_FUEL, r#"{"2": "8000"}"#)
            .unwrap();

        let mut config = ClosingConfig::default();
        config.apply_local_overrides(&conn);

        assert_eq!(config.high_volume.threshold_for(1), Decimal::from(2500));
        assert_eq!(config.high_volume.threshold_for(2), Decimal::from(8000));
    }

    #[test]
    fn test_bad_local_overrides_keep_previous_values() {
        let state = db::open_in_memory().unwrap();
        let conn = state.lock().unwrap();
        db::set_setting(&conn, SETTINGS_CATEGORY, KEY_HIGH_VOLUME, "-1").unwrap();
        db::set_setting(&conn, SETTINGS_CATEGORY, KEY_HIGH_VOLUME_PER_FUEL, "[1, 2]").unwrap();

        let mut config = ClosingConfig::default();
        config.apply_local_overrides(&conn);

        assert_eq!(config.high_volume, HighVolumePolicy::default());
    }

    #[test]
    fn test_config_json_shape() {
        let config: ClosingConfig =
            serde_json::from_str(r#"{"dataDir": "/tmp/x", "highVolume": {"defaultThresholdLiters": "1000"}}"#)
                .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/x"));
        assert_eq!(config.log_retention_files, 14);
        assert_eq!(config.high_volume.default_threshold_liters, Decimal::from(1000));
    }
}
