// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Configuration for the NotifyFree log channel.
//!
//! All settings live in one [`Config`] struct with typed fields and the
//! defaults documented on each constant below. Values are read from
//! `NOTIFYFREE_*` environment variables by [`Config::from_env`].
//!
//! # Legacy keys
//!
//! Older deployments used different variable names. They are rewritten to
//! their canonical names once, by [`migrate_legacy_keys`], before any value is
//! parsed. A canonical key always wins over its alias.

pub mod delivery_mode;

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::error::ConfigError;
use crate::record::Level;
pub use delivery_mode::DeliveryMode;

pub const DEFAULT_ENDPOINT: &str = "https://api.notifyfree.com/v1/logs";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const DEFAULT_BUFFER_SIZE: usize = 50;
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CHUNK_SIZE: usize = 10;
pub const DEFAULT_STATUS_CACHE_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 1000;
pub const DEFAULT_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%:z";
pub const DEFAULT_FALLBACK_PATH: &str = "storage/logs/notifyfree-fallback.log";
pub const DEFAULT_FALLBACK_MAX_SIZE: u64 = 10 * 1024 * 1024;
pub const DEFAULT_SENSITIVE_KEYS: &[&str] = &[
    "password",
    "token",
    "secret",
    "key",
    "auth",
    "api_key",
    "access_token",
    "refresh_token",
    "authorization",
];

/// Smallest accepted buffer size. Lower values are clamped up.
pub const MIN_BUFFER_SIZE: usize = 2;
/// Smallest accepted flush timeout. Lower values are clamped up.
pub const MIN_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);
pub const MIN_CHUNK_SIZE: usize = 1;
pub const MIN_RETRY_ATTEMPTS: u32 = 1;
/// The truncation marker must fit inside the limit.
pub const MIN_MAX_MESSAGE_LENGTH: usize = 3;

/// Legacy variable name and the canonical name it maps to.
pub const LEGACY_ALIASES: &[(&str, &str)] = &[
    ("NOTIFYFREE_BATCH_SIZE", "NOTIFYFREE_BUFFER_SIZE"),
    ("NOTIFYFREE_RETRY", "NOTIFYFREE_RETRY_ATTEMPTS"),
    ("NOTIFYFREE_HANDLER", "NOTIFYFREE_MODE"),
];

const ENV_KEYS: &[&str] = &[
    "NOTIFYFREE_ENDPOINT",
    "NOTIFYFREE_TOKEN",
    "NOTIFYFREE_APP_ID",
    "NOTIFYFREE_TIMEOUT",
    "NOTIFYFREE_RETRY_ATTEMPTS",
    "NOTIFYFREE_RETRY_BACKOFF_MS",
    "NOTIFYFREE_MODE",
    "NOTIFYFREE_LEVEL",
    "NOTIFYFREE_BUFFER_SIZE",
    "NOTIFYFREE_FLUSH_TIMEOUT",
    "NOTIFYFREE_CHUNK_SIZE",
    "NOTIFYFREE_BACKGROUND_FLUSH",
    "NOTIFYFREE_STATUS_CACHE",
    "NOTIFYFREE_STATUS_CACHE_TTL",
    "NOTIFYFREE_INCLUDE_CONTEXT",
    "NOTIFYFREE_INCLUDE_EXTRA",
    "NOTIFYFREE_TIMESTAMP_FORMAT",
    "NOTIFYFREE_MAX_MESSAGE_LENGTH",
    "NOTIFYFREE_SENSITIVE_KEYS",
    "NOTIFYFREE_FALLBACK_ENABLED",
    "NOTIFYFREE_FALLBACK_PATH",
    "NOTIFYFREE_FALLBACK_MAX_SIZE",
    "NOTIFYFREE_STRICT",
];

/// What to do when endpoint, token or app id are missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingConfigPolicy {
    /// Build an inert client that drops entries and logs a warning once.
    #[default]
    Degrade,
    /// Return [`ConfigError`] from construction.
    FailFast,
}

/// Buffering policy for [`DeliveryMode::Batching`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    /// Flush once this many entries are buffered.
    pub buffer_size: usize,
    /// Flush on the next write once the last flush is this old.
    pub flush_timeout: Duration,
    /// Entries per HTTP request during a flush.
    pub chunk_size: usize,
    /// Run a ticker that flushes stale buffers between writes.
    pub background_flush: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            background_flush: false,
        }
    }
}

impl BatchConfig {
    /// Returns a copy with every value raised to its floor.
    #[must_use]
    pub fn clamped(&self) -> Self {
        Self {
            buffer_size: clamp_buffer_size(self.buffer_size),
            flush_timeout: clamp_flush_timeout(self.flush_timeout),
            chunk_size: self.chunk_size.max(MIN_CHUNK_SIZE),
            background_flush: self.background_flush,
        }
    }
}

pub fn clamp_buffer_size(size: usize) -> usize {
    size.max(MIN_BUFFER_SIZE)
}

pub fn clamp_flush_timeout(timeout: Duration) -> Duration {
    timeout.max(MIN_FLUSH_TIMEOUT)
}

/// Connectivity probe caching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusCacheConfig {
    pub enabled: bool,
    pub ttl: Duration,
}

impl Default for StatusCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: DEFAULT_STATUS_CACHE_TTL,
        }
    }
}

/// Shape of the formatted entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatConfig {
    pub include_context: bool,
    pub include_extra: bool,
    /// chrono strftime pattern.
    pub timestamp_format: String,
    /// Byte limit for the message, including the truncation marker.
    pub max_message_length: usize,
    /// Matched case-insensitively against metadata keys.
    pub sensitive_keys: Vec<String>,
}

impl Default for FormatConfig {
    fn default() -> Self {
        Self {
            include_context: true,
            include_extra: true,
            timestamp_format: DEFAULT_TIMESTAMP_FORMAT.to_string(),
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
            sensitive_keys: DEFAULT_SENSITIVE_KEYS
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }
}

/// Local file that holds entries which could not be delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackConfig {
    pub enabled: bool,
    pub path: PathBuf,
    /// The file is rotated before an append once it grows past this size.
    pub max_file_size: u64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from(DEFAULT_FALLBACK_PATH),
            max_file_size: DEFAULT_FALLBACK_MAX_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Ingestion URL. Batches go to `{endpoint}/batch`.
    pub endpoint: String,
    /// Bearer token sent in the `Authorization` header.
    pub token: Option<String>,
    pub app_id: Option<String>,
    /// Per-request timeout.
    pub timeout: Duration,
    pub retry_attempts: u32,
    /// Wait before retry `n` is `retry_backoff_base * 2^(n-1)`.
    pub retry_backoff_base: Duration,
    pub mode: DeliveryMode,
    /// Records below this level are ignored.
    pub min_level: Level,
    pub batch: BatchConfig,
    pub status_cache: StatusCacheConfig,
    pub format: FormatConfig,
    pub fallback: FallbackConfig,
    pub on_missing_config: MissingConfigPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            token: None,
            app_id: None,
            timeout: DEFAULT_TIMEOUT,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_backoff_base: DEFAULT_RETRY_BACKOFF_BASE,
            mode: DeliveryMode::default(),
            min_level: Level::Debug,
            batch: BatchConfig::default(),
            status_cache: StatusCacheConfig::default(),
            format: FormatConfig::default(),
            fallback: FallbackConfig::default(),
            on_missing_config: MissingConfigPolicy::default(),
        }
    }
}

impl Config {
    /// Create configuration from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Create configuration from any key lookup, e.g. a map in tests.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut vars: HashMap<String, String> = ENV_KEYS
            .iter()
            .chain(LEGACY_ALIASES.iter().map(|(legacy, _)| legacy))
            .filter_map(|key| lookup(key).map(|value| ((*key).to_string(), value)))
            .collect();
        for legacy in migrate_legacy_keys(&mut vars) {
            warn!("NOTIFYFREE | {legacy} is deprecated, use its replacement instead");
        }

        let defaults = Self::default();
        let get = |key: &str| vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

        let mode = match get("NOTIFYFREE_MODE") {
            Some(raw) => DeliveryMode::from_env_str(raw).unwrap_or_else(|| {
                warn!("NOTIFYFREE | Unknown delivery mode '{raw}', using {}", defaults.mode);
                defaults.mode
            }),
            None => defaults.mode,
        };
        let min_level = get("NOTIFYFREE_LEVEL")
            .and_then(|raw| raw.parse::<Level>().ok())
            .unwrap_or(defaults.min_level);

        let batch = BatchConfig {
            buffer_size: parse_or(get("NOTIFYFREE_BUFFER_SIZE"), defaults.batch.buffer_size),
            flush_timeout: get("NOTIFYFREE_FLUSH_TIMEOUT")
                .and_then(|v| v.parse::<u64>().ok())
                .map_or(defaults.batch.flush_timeout, Duration::from_secs),
            chunk_size: parse_or(get("NOTIFYFREE_CHUNK_SIZE"), defaults.batch.chunk_size),
            background_flush: parse_bool(get("NOTIFYFREE_BACKGROUND_FLUSH"), false),
        }
        .clamped();

        let status_cache = StatusCacheConfig {
            enabled: parse_bool(get("NOTIFYFREE_STATUS_CACHE"), true),
            ttl: get("NOTIFYFREE_STATUS_CACHE_TTL")
                .and_then(|v| v.parse::<u64>().ok())
                .map_or(defaults.status_cache.ttl, Duration::from_secs),
        };

        let format = FormatConfig {
            include_context: parse_bool(get("NOTIFYFREE_INCLUDE_CONTEXT"), true),
            include_extra: parse_bool(get("NOTIFYFREE_INCLUDE_EXTRA"), true),
            timestamp_format: get("NOTIFYFREE_TIMESTAMP_FORMAT")
                .map_or(defaults.format.timestamp_format, ToString::to_string),
            max_message_length: parse_or(
                get("NOTIFYFREE_MAX_MESSAGE_LENGTH"),
                defaults.format.max_message_length,
            )
            .max(MIN_MAX_MESSAGE_LENGTH),
            sensitive_keys: get("NOTIFYFREE_SENSITIVE_KEYS").map_or(
                defaults.format.sensitive_keys,
                |raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|k| !k.is_empty())
                        .map(str::to_lowercase)
                        .collect()
                },
            ),
        };

        let fallback = FallbackConfig {
            enabled: parse_bool(get("NOTIFYFREE_FALLBACK_ENABLED"), true),
            path: get("NOTIFYFREE_FALLBACK_PATH").map_or(defaults.fallback.path, PathBuf::from),
            max_file_size: parse_or(
                get("NOTIFYFREE_FALLBACK_MAX_SIZE"),
                defaults.fallback.max_file_size,
            ),
        };

        Self {
            endpoint: get("NOTIFYFREE_ENDPOINT").map_or(defaults.endpoint, ToString::to_string),
            token: get("NOTIFYFREE_TOKEN").map(ToString::to_string),
            app_id: get("NOTIFYFREE_APP_ID").map(ToString::to_string),
            timeout: get("NOTIFYFREE_TIMEOUT")
                .and_then(|v| v.parse::<u64>().ok())
                .map_or(defaults.timeout, Duration::from_secs),
            retry_attempts: parse_or(get("NOTIFYFREE_RETRY_ATTEMPTS"), defaults.retry_attempts)
                .max(MIN_RETRY_ATTEMPTS),
            retry_backoff_base: get("NOTIFYFREE_RETRY_BACKOFF_MS")
                .and_then(|v| v.parse::<u64>().ok())
                .map_or(defaults.retry_backoff_base, Duration::from_millis),
            mode,
            min_level,
            batch,
            status_cache,
            format,
            fallback,
            on_missing_config: if parse_bool(get("NOTIFYFREE_STRICT"), false) {
                MissingConfigPolicy::FailFast
            } else {
                MissingConfigPolicy::Degrade
            },
        }
    }

    /// Validate the configuration.
    ///
    /// Presence is checked in order endpoint, token, app id; the endpoint must
    /// be an absolute `http` or `https` URL.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.trim().is_empty() {
            return Err(ConfigError::Missing("endpoint"));
        }
        if self.token.as_deref().map_or(true, |t| t.trim().is_empty()) {
            return Err(ConfigError::Missing("token"));
        }
        if self.app_id.as_deref().map_or(true, |a| a.trim().is_empty()) {
            return Err(ConfigError::Missing("app_id"));
        }
        validate_endpoint(&self.endpoint)
    }

    /// True when the fallback store should receive failed entries.
    pub fn fallback_active(&self) -> bool {
        self.fallback.enabled || self.mode.forces_fallback()
    }
}

pub(crate) fn validate_endpoint(endpoint: &str) -> Result<(), ConfigError> {
    match reqwest::Url::parse(endpoint) {
        Ok(url) if matches!(url.scheme(), "http" | "https") && url.has_host() => Ok(()),
        _ => Err(ConfigError::InvalidEndpoint(endpoint.to_string())),
    }
}

/// Rewrites legacy variable names to their canonical names.
///
/// Returns the legacy names that were applied. A legacy value is discarded
/// when the canonical key is already present.
pub fn migrate_legacy_keys(vars: &mut HashMap<String, String>) -> Vec<&'static str> {
    let mut applied = Vec::new();
    for (legacy, canonical) in LEGACY_ALIASES {
        if let Some(value) = vars.remove(*legacy) {
            if !vars.contains_key(*canonical) {
                vars.insert((*canonical).to_string(), value);
                applied.push(*legacy);
            }
        }
    }
    applied
}

fn parse_or<T: std::str::FromStr>(raw: Option<&str>, default: T) -> T {
    raw.and_then(|v| v.parse::<T>().ok()).unwrap_or(default)
}

fn parse_bool(raw: Option<&str>, default: bool) -> bool {
    match raw.map(str::to_lowercase).as_deref() {
        Some("true" | "1" | "yes" | "on") => true,
        Some("false" | "0" | "no" | "off") => false,
        _ => default,
    }
}
