//! Parsing of composite failover URIs.
//!
//! Accepted forms:
//!
//! ```text
//! failover:(tcp://a:61616,tcp://b:61616)?initialReconnectDelay=10&randomize=false
//! failover:tcp://a:61616,tcp://b:61616
//! tcp://a:61616
//! ```

use crate::config::schema::FailoverConfig;
use crate::error::{Error, Result};
use std::time::Duration;
use url::Url;

/// A parsed failover URI: candidate brokers plus transport options.
#[derive(Debug, Clone, PartialEq)]
pub struct FailoverUri {
    /// Candidate broker URIs, in declaration order
    pub uris: Vec<Url>,
    /// Options applied on top of the defaults
    pub config: FailoverConfig,
}

impl FailoverUri {
    /// Parse a failover URI, applying options over [`FailoverConfig::default`].
    ///
    /// # Errors
    /// Returns [`Error::InvalidUri`] for malformed URIs and unknown options.
    pub fn parse(input: &str) -> Result<Self> {
        Self::parse_with(input, FailoverConfig::default())
    }

    /// Parse a failover URI, applying options over the given base configuration.
    ///
    /// # Errors
    /// Returns [`Error::InvalidUri`] for malformed URIs and unknown options.
    pub fn parse_with(input: &str, base: FailoverConfig) -> Result<Self> {
        let trimmed = input.trim();
        let composite = trimmed.strip_prefix("failover:").unwrap_or(trimmed);

        let (list, query) = if let Some(rest) = composite.strip_prefix('(') {
            let close = rest.find(')').ok_or_else(|| invalid(input, "unbalanced parentheses"))?;
            let query = rest[close + 1..].strip_prefix('?');
            if query.is_none() && !rest[close + 1..].is_empty() {
                return Err(invalid(input, "unexpected text after broker list"));
            }
            (&rest[..close], query)
        } else {
            match composite.split_once('?') {
                Some((list, query)) if trimmed.starts_with("failover:") => (list, Some(query)),
                _ => (composite, None),
            }
        };

        let uris = parse_uri_list(list)?;
        if uris.is_empty() {
            return Err(invalid(input, "no broker URIs"));
        }

        let mut config = base;
        if let Some(query) = query {
            for pair in query.split('&').filter(|pair| !pair.is_empty()) {
                let (key, value) =
                    pair.split_once('=').ok_or_else(|| invalid(input, &format!("option '{pair}' has no value")))?;
                apply_option(&mut config, key, value).map_err(|message| invalid(input, &message))?;
            }
        }

        Ok(Self { uris, config })
    }
}

/// Parse a comma-separated list of broker URIs, skipping empty entries.
///
/// # Errors
/// Returns [`Error::InvalidUri`] for the first entry that fails to parse.
pub fn parse_uri_list(list: &str) -> Result<Vec<Url>> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| Url::parse(entry).map_err(|e| invalid(entry, &e.to_string())))
        .collect()
}

fn invalid(uri: &str, message: &str) -> Error {
    Error::InvalidUri { uri: uri.to_string(), message: message.to_string() }
}

fn apply_option(config: &mut FailoverConfig, key: &str, value: &str) -> std::result::Result<(), String> {
    match key {
        "timeout" => config.timeout = parse_optional_millis(value)?,
        "initialReconnectDelay" => config.initial_reconnect_delay = parse_millis(value)?,
        "maxReconnectDelay" => config.max_reconnect_delay = parse_millis(value)?,
        "backOffMultiplier" => {
            config.backoff_multiplier =
                value.parse().map_err(|_| format!("backOffMultiplier '{value}' is not a number"))?;
        },
        "useExponentialBackOff" => config.use_exponential_backoff = parse_bool(key, value)?,
        "reconnectDelay" => config.reconnect_delay = parse_millis(value)?,
        "maxReconnectAttempts" => config.max_reconnect_attempts = parse_attempts(key, value)?,
        "startupMaxReconnectAttempts" => {
            config.startup_max_reconnect_attempts = parse_attempts(key, value)?;
        },
        "randomize" => config.randomize = parse_bool(key, value)?,
        "backup" => config.backup = parse_bool(key, value)?,
        "backupPoolSize" => {
            config.backup_pool_size =
                value.parse().map_err(|_| format!("backupPoolSize '{value}' is not a count"))?;
        },
        "trackMessages" => config.track_messages = parse_bool(key, value)?,
        "trackTransactionProducers" => config.track_transaction_producers = parse_bool(key, value)?,
        "maxCacheSize" => {
            config.max_cache_size =
                value.parse().map_err(|_| format!("maxCacheSize '{value}' is not a count"))?;
        },
        "reconnectSupported" => config.reconnect_supported = parse_bool(key, value)?,
        "updateURIsSupported" => config.update_uris_supported = parse_bool(key, value)?,
        _ => return Err(format!("unknown option '{key}'")),
    }
    Ok(())
}

fn parse_bool(key: &str, value: &str) -> std::result::Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(format!("{key} expects true or false, got '{value}'")),
    }
}

fn parse_millis(value: &str) -> std::result::Result<Duration, String> {
    value
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| format!("'{value}' is not a millisecond count"))
}

/// Negative or zero values mean "no timeout".
fn parse_optional_millis(value: &str) -> std::result::Result<Option<Duration>, String> {
    let ms: i64 = value.parse().map_err(|_| format!("'{value}' is not a millisecond count"))?;
    Ok(u64::try_from(ms).ok().filter(|ms| *ms > 0).map(Duration::from_millis))
}

/// Negative values mean "unlimited".
fn parse_attempts(key: &str, value: &str) -> std::result::Result<Option<u32>, String> {
    let attempts: i64 = value.parse().map_err(|_| format!("{key} '{value}' is not a count"))?;
    Ok(u32::try_from(attempts).ok())
}
