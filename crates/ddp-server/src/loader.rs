//! Configuration loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ServerConfig::default()`]
//! 2. If a settings file is given and exists, deep-merge its values over
//!    the defaults
//! 3. Apply `DDP_*` environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::Path;

use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{LogFormat, ServerConfig};
use crate::errors::ConfigError;

/// Load configuration from an optional file, then apply env overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_config(path: Option<&Path>) -> Result<ServerConfig, ConfigError> {
    let mut config = match path {
        Some(path) => load_config_file(path)?,
        None => ServerConfig::default(),
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Load defaults deep-merged with the file at `path`, without env overrides.
pub fn load_config_file(path: &Path) -> Result<ServerConfig, ConfigError> {
    let defaults = serde_json::to_value(ServerConfig::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        if !user.is_object() {
            return Err(ConfigError::InvalidValue(
                "settings file must contain a JSON object".into(),
            ));
        }
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply overrides from the process environment.
pub fn apply_env_overrides(config: &mut ServerConfig) {
    apply_overrides_from(config, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`.
///
/// Numbers must parse and fall within range; invalid values are logged and
/// ignored.
pub fn apply_overrides_from(config: &mut ServerConfig, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    if let Some(v) = env.string("DDP_HOST") {
        config.host = v;
    }
    if let Some(v) = env.u64_in("DDP_PORT", 0, u64::from(u16::MAX)) {
        config.port = u16::try_from(v).unwrap_or(config.port);
    }
    if let Some(v) = env.u64_in("DDP_HEARTBEAT_INTERVAL_MS", 100, 3_600_000) {
        config.heartbeat_interval_ms = v;
    }
    if let Some(v) = env.usize_in("DDP_MAX_UNANSWERED_PINGS", 1, 1_000) {
        config.max_unanswered_pings = v;
    }
    if let Some(v) = env.u64_in("DDP_METHOD_TIMEOUT_MS", 1, 86_400_000) {
        config.method_timeout_ms = v;
    }
    if let Some(v) = env.usize_in("DDP_MAX_CONNECTIONS", 1, 1_000_000) {
        config.max_connections = v;
    }
    if let Some(v) = env.usize_in("DDP_SEND_QUEUE_CAPACITY", 1, 1_000_000) {
        config.send_queue_capacity = v;
    }
    if let Some(v) = env.usize_in("DDP_MAX_MESSAGE_SIZE", 1024, 1_073_741_824) {
        config.max_message_size = v;
    }
    if let Some(v) = env.string("DDP_LOG_LEVEL") {
        config.log_level = v;
    }
    if let Some(v) = env.string("DDP_LOG_FORMAT") {
        match parse_log_format(&v) {
            Some(format) => config.log_format = format,
            None => warn!(key = "DDP_LOG_FORMAT", value = %v, "invalid log format env var, ignoring"),
        }
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse `compact` / `json` (case-insensitive).
pub fn parse_log_format(val: &str) -> Option<LogFormat> {
    match val.to_lowercase().as_str() {
        "compact" => Some(LogFormat::Compact),
        "json" => Some(LogFormat::Json),
        _ => None,
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn u64_in(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = self.string(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }

    fn usize_in(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        let val = self.string(name)?;
        let result = parse_usize_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid usize env var, ignoring");
        }
        result
    }
}
