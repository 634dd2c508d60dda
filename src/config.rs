use std::path::PathBuf;
use thiserror::Error;

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_MAX_LOGIN_ATTEMPTS: u32 = 5;
pub const DEFAULT_HASH_ROUNDS: u32 = 10_000;

pub const SETTING_STATUSES: &str = "registration.statuses";
pub const SETTING_NATURES: &str = "registration.natures";
pub const SETTING_COUNTRIES: &str = "registration.countries";

pub const DEFAULT_STATUSES: &[&str] = &[
    "CallOut",
    "Active",
    "Drop-Out",
    "Graduated",
    "NextBatch",
    "On-Hold",
    "Pending",
];
pub const DEFAULT_NATURES: &[&str] = &["Exited", "Soft"];
pub const DEFAULT_COUNTRIES: &[&str] = &[
    "India",
    "USA",
    "UK",
    "Canada",
    "Singapore",
    "Australia",
    "KSA",
    "UAE",
    "Qatar",
    "China",
    "Japan",
    "Malaysia",
    "Philippines",
    "Thailand",
    "Vietnam",
    "Indonesia",
    "Pakistan",
    "Other",
];

/// Settings keys whose value must be a non-empty list of strings.
pub const LIST_SETTINGS: &[(&str, &[&str])] = &[
    (SETTING_STATUSES, DEFAULT_STATUSES),
    (SETTING_NATURES, DEFAULT_NATURES),
    (SETTING_COUNTRIES, DEFAULT_COUNTRIES),
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be a positive integer, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub log_filter: String,
    pub workspace: Option<PathBuf>,
    pub max_login_attempts: u32,
    pub hash_rounds: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            workspace: None,
            max_login_attempts: DEFAULT_MAX_LOGIN_ATTEMPTS,
            hash_rounds: DEFAULT_HASH_ROUNDS,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Config::default();
        if let Some(v) = non_empty(lookup("SIMSD_LOG")) {
            cfg.log_filter = v;
        }
        if let Some(v) = non_empty(lookup("SIMSD_WORKSPACE")) {
            cfg.workspace = Some(PathBuf::from(v));
        }
        if let Some(v) = non_empty(lookup("SIMSD_MAX_LOGIN_ATTEMPTS")) {
            cfg.max_login_attempts = positive("SIMSD_MAX_LOGIN_ATTEMPTS", v)?;
        }
        if let Some(v) = non_empty(lookup("SIMSD_HASH_ROUNDS")) {
            cfg.hash_rounds = positive("SIMSD_HASH_ROUNDS", v)?;
        }
        Ok(cfg)
    }
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn positive(var: &'static str, value: String) -> Result<u32, ConfigError> {
    match value.parse::<u32>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::InvalidNumber { var, value }),
    }
}
