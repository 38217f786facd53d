use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

const DEFAULT_ENDPOINT: &str = "http://localhost:3000/api/gpt";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{key} has an invalid value {value:?}")]
    Invalid { key: &'static str, value: String },

    #[error("{key} must be greater than zero")]
    Zero { key: &'static str },
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Where the `{messages, stream}` requests go.
    pub endpoint: String,
    pub connect_timeout: Duration,
    /// Upper bound for one streamed explanation, enforced by the bot.
    pub stream_deadline: Duration,
    /// Minimum gap between two edits of the same Telegram message.
    pub edit_interval: Duration,
    pub limits: RateLimits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimits {
    pub per_minute: u32,
    pub per_hour: u32,
    pub per_day: u32,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            per_minute: 15,
            per_hour: 250,
            per_day: 500,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let endpoint = lookup("GENERATION_ENDPOINT")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());

        let limits = RateLimits {
            per_minute: positive(&lookup, "RATE_LIMIT_PER_MINUTE", 15)?,
            per_hour: positive(&lookup, "RATE_LIMIT_PER_HOUR", 250)?,
            per_day: positive(&lookup, "RATE_LIMIT_PER_DAY", 500)?,
        };

        Ok(Self {
            endpoint,
            connect_timeout: Duration::from_secs(positive(&lookup, "CONNECT_TIMEOUT_SECS", 10)?),
            stream_deadline: Duration::from_secs(positive(&lookup, "STREAM_DEADLINE_SECS", 90)?),
            edit_interval: Duration::from_millis(parse_or(&lookup, "EDIT_INTERVAL_MS", 800)?),
            limits,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}

fn positive<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + PartialOrd + Default,
{
    let value = parse_or(lookup, key, default)?;
    if value <= T::default() {
        return Err(ConfigError::Zero { key });
    }
    Ok(value)
}
