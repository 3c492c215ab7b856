use log::LevelFilter;
use log4rs::{
    append::console::ConsoleAppender,
    config::{Appender, Config, Root},
    encode::pattern::PatternEncoder,
};
use std::env;

pub const HOST: &str = "HOST";
pub const PORT: &str = "PORT";

pub const VAR_STORAGE_DIR: &str = "STORAGE_DIR";
pub const VAR_STORAGE_BACKEND: &str = "STORAGE_BACKEND";
pub const VAR_STORAGE_NAMESPACE: &str = "STORAGE_NAMESPACE";
pub const VAR_MAX_PENDING_TRIGGERS: &str = "MAX_PENDING_TRIGGERS";
pub const VAR_SNOOZE_SECONDS: &str = "SNOOZE_SECONDS";
pub const VAR_LOG_CONFIG_PATH: &str = "LOG_CONFIG_PATH";

pub const VAR_TOPIC: &str = "TOPIC";
pub const VAR_TEAM_ID: &str = "TEAM_ID";
pub const VAR_TOKEN_KEY_PATH: &str = "TOKEN_KEY_PATH";
pub const VAR_AUTH_KEY_ID: &str = "AUTH_KEY_ID";
pub const VAR_APNS_HOST_NAME: &str = "APNS_HOST_NAME";

pub const APNS_VARS: [&str; 5] = [
    VAR_TOPIC,
    VAR_TEAM_ID,
    VAR_TOKEN_KEY_PATH,
    VAR_AUTH_KEY_ID,
    VAR_APNS_HOST_NAME,
];

/// APNs variables that are unset or empty.
pub fn missing_apns_vars() -> Vec<&'static str> {
    APNS_VARS
        .into_iter()
        .filter(|var| env::var(var).map_or(true, |value| value.trim().is_empty()))
        .collect()
}

/// Load the log4rs config at `path`, or log to the console at info if it can't be read.
pub fn init_logging(path: &str) {
    if let Err(e) = log4rs::init_file(path, Default::default()) {
        let stdout = ConsoleAppender::builder()
            .encoder(Box::new(PatternEncoder::new("{d(%Y-%m-%d %H:%M:%S)} {h({l})} {t} - {m}{n}")))
            .build();
        let config = Config::builder()
            .appender(Appender::builder().build("stdout", Box::new(stdout)))
            .build(Root::builder().appender("stdout").build(LevelFilter::Info));
        match config {
            Ok(config) => {
                if log4rs::init_config(config).is_ok() {
                    log::warn!("Could not load log config '{path}' ({e}), logging to console");
                }
            }
            Err(e) => eprintln!("Could not configure logging: {e}"),
        }
    }
}

/// Last eight characters of a token, enough to tell devices apart in logs.
pub fn get_short_token(token: &str) -> &str {
    let start = token
        .char_indices()
        .rev()
        .nth(7)
        .map_or(0, |(index, _)| index);
    &token[start..]
}
