use std::{env, path::PathBuf, str::FromStr};

use crate::authtoken::ApnsCredentials;
use crate::error::ConfigError;
use crate::util::{
    missing_apns_vars, HOST, PORT, VAR_APNS_HOST_NAME, VAR_AUTH_KEY_ID, VAR_LOG_CONFIG_PATH,
    VAR_MAX_PENDING_TRIGGERS, VAR_SNOOZE_SECONDS, VAR_STORAGE_BACKEND, VAR_STORAGE_DIR,
    VAR_STORAGE_NAMESPACE, VAR_TEAM_ID, VAR_TOKEN_KEY_PATH, VAR_TOPIC,
};

pub const DEFAULT_NAMESPACE: &str = "freepray";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    File,
    Memory,
}

#[derive(Debug, Clone)]
pub struct ApnsSettings {
    pub host: String,
    pub topic: String,
    pub credentials: ApnsCredentials,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub storage_dir: PathBuf,
    pub storage_backend: StorageBackend,
    pub namespace: String,
    pub max_pending_triggers: usize,
    pub snooze_seconds: u64,
    pub log_config_path: String,
    /// `None` when any APNs variable is missing; reminders are then only logged.
    pub apns: Option<ApnsSettings>,
}

impl Settings {
    pub fn from_env() -> Result<Settings, ConfigError> {
        let storage_backend = match var_or(VAR_STORAGE_BACKEND, "file").to_lowercase().as_str() {
            "file" => StorageBackend::File,
            "memory" => StorageBackend::Memory,
            other => {
                return Err(ConfigError::InvalidValue {
                    key: VAR_STORAGE_BACKEND,
                    value: other.to_string(),
                })
            }
        };

        let apns = if missing_apns_vars().is_empty() {
            Some(ApnsSettings {
                host: var_or(VAR_APNS_HOST_NAME, ""),
                topic: var_or(VAR_TOPIC, ""),
                credentials: ApnsCredentials {
                    key_path: PathBuf::from(var_or(VAR_TOKEN_KEY_PATH, "")),
                    key_id: var_or(VAR_AUTH_KEY_ID, ""),
                    team_id: var_or(VAR_TEAM_ID, ""),
                },
            })
        } else {
            None
        };

        Ok(Settings {
            host: var_or(HOST, "127.0.0.1"),
            port: parse_var(PORT, 9898)?,
            storage_dir: PathBuf::from(var_or(VAR_STORAGE_DIR, "./data")),
            storage_backend,
            namespace: var_or(VAR_STORAGE_NAMESPACE, DEFAULT_NAMESPACE),
            max_pending_triggers: parse_var(VAR_MAX_PENDING_TRIGGERS, 64)?,
            snooze_seconds: parse_var(VAR_SNOOZE_SECONDS, 300)?,
            log_config_path: var_or(VAR_LOG_CONFIG_PATH, "log4rs.yaml"),
            apns,
        })
    }
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| String::from(default))
}

fn parse_var<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value }),
        Err(_) => Ok(default),
    }
}
