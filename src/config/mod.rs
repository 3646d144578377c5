//! Configuration layer: typed settings with layered precedence (file → explicit file → env).

use std::{path::Path, str::FromStr, time::Duration};

use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::runtime::policy::{FetchPolicy, RenderPolicy};

const LOCAL_CONFIG_BASENAME: &str = "relay-reactive";
const ENV_PREFIX: &str = "RELAY_REACTIVE";
const DEFAULT_QUERY_CACHE_CAPACITY: usize = 1000;
const DEFAULT_FRAGMENT_CACHE_CAPACITY: usize = 1_000_000;
const DEFAULT_TEMPORARY_RETAIN_MS: u64 = 5 * 60 * 1000;

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub cache: CacheSettings,
    pub retention: RetentionSettings,
    pub policy: PolicySettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub query_capacity: usize,
    pub fragment_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct RetentionSettings {
    pub temporary_retain: Duration,
}

#[derive(Debug, Clone)]
pub struct PolicySettings {
    pub default_fetch_policy: FetchPolicy,
    pub default_live_fetch_policy: FetchPolicy,
    pub default_render_policy: RenderPolicy,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Compact,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cache: CacheSettings {
                query_capacity: DEFAULT_QUERY_CACHE_CAPACITY,
                fragment_capacity: DEFAULT_FRAGMENT_CACHE_CAPACITY,
            },
            retention: RetentionSettings {
                temporary_retain: Duration::from_millis(DEFAULT_TEMPORARY_RETAIN_MS),
            },
            policy: PolicySettings {
                default_fetch_policy: FetchPolicy::StoreOrNetwork,
                default_live_fetch_policy: FetchPolicy::StoreAndNetwork,
                default_render_policy: RenderPolicy::Partial,
            },
            logging: LoggingSettings {
                level: LevelFilter::INFO,
                format: LogFormat::Compact,
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (local file → explicit file → environment).
pub fn load(config_file: Option<&Path>) -> Result<Settings, LoadError> {
    let mut builder =
        Config::builder().add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = config_file {
        builder = builder.add_source(File::from(path).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let raw: RawSettings = builder.build()?.try_deserialize()?;
    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    cache: RawCacheSettings,
    retention: RawRetentionSettings,
    policy: RawPolicySettings,
    logging: RawLoggingSettings,
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            cache,
            retention,
            policy,
            logging,
        } = raw;

        let cache = build_cache_settings(cache)?;
        let retention = build_retention_settings(retention)?;
        let policy = build_policy_settings(policy)?;
        let logging = build_logging_settings(logging)?;

        Ok(Self {
            cache,
            retention,
            policy,
            logging,
        })
    }
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let query_capacity = non_zero_usize(
        cache.query_capacity.unwrap_or(DEFAULT_QUERY_CACHE_CAPACITY),
        "cache.query_capacity",
    )?;
    let fragment_capacity = non_zero_usize(
        cache
            .fragment_capacity
            .unwrap_or(DEFAULT_FRAGMENT_CACHE_CAPACITY),
        "cache.fragment_capacity",
    )?;

    Ok(CacheSettings {
        query_capacity,
        fragment_capacity,
    })
}

fn build_retention_settings(
    retention: RawRetentionSettings,
) -> Result<RetentionSettings, LoadError> {
    let millis = retention
        .temporary_retain_ms
        .unwrap_or(DEFAULT_TEMPORARY_RETAIN_MS);
    if millis == 0 {
        return Err(LoadError::invalid(
            "retention.temporary_retain_ms",
            "must be greater than zero",
        ));
    }

    Ok(RetentionSettings {
        temporary_retain: Duration::from_millis(millis),
    })
}

fn build_policy_settings(policy: RawPolicySettings) -> Result<PolicySettings, LoadError> {
    let default_fetch_policy = parse_or(
        policy.default_fetch_policy,
        FetchPolicy::StoreOrNetwork,
        "policy.default_fetch_policy",
    )?;
    let default_live_fetch_policy = parse_or(
        policy.default_live_fetch_policy,
        FetchPolicy::StoreAndNetwork,
        "policy.default_live_fetch_policy",
    )?;
    let default_render_policy = parse_or(
        policy.default_render_policy,
        RenderPolicy::Partial,
        "policy.default_render_policy",
    )?;

    Ok(PolicySettings {
        default_fetch_policy,
        default_live_fetch_policy,
        default_render_policy,
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    query_capacity: Option<usize>,
    fragment_capacity: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRetentionSettings {
    temporary_retain_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPolicySettings {
    default_fetch_policy: Option<String>,
    default_live_fetch_policy: Option<String>,
    default_render_policy: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

fn non_zero_usize(value: usize, key: &'static str) -> Result<usize, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(value)
}

fn parse_or<T>(value: Option<String>, default: T, key: &'static str) -> Result<T, LoadError>
where
    T: FromStr<Err = String>,
{
    match value {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|reason| LoadError::invalid(key, reason)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests;
