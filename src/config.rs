//! Environment-driven configuration.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::admission::RouteLimits;
use crate::backend::OpenAiCompletionBackend;
use crate::retry::{BuildError, DEFAULT_DELAY, DEFAULT_MAX_ATTEMPTS};
use crate::timeout::DEFAULT_UPSTREAM_TIMEOUT;

pub const DEFAULT_BIND: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_TOKEN_BUDGET: i64 = 1_000_000;
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} has invalid value {value:?}")]
    InvalidValue { var: &'static str, value: String },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error(transparent)]
    Retry(#[from] BuildError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub bind: SocketAddr,
    /// Search endpoint; search is disabled when unset.
    pub search_url: Option<String>,
    /// Completion credential; completions are disabled when unset.
    pub openai_api_key: Option<String>,
    pub openai_url: String,
    pub openai_model: String,
    /// Monthly completion token budget.
    pub token_budget: i64,
    pub upstream_timeout: Duration,
    pub retry_attempts: usize,
    pub retry_delay: Duration,
    pub sweep_interval: Duration,
    pub query_limits: RouteLimits,
    pub like_read_limits: RouteLimits,
    pub like_write_limits: RouteLimits,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            search_url: None,
            openai_api_key: None,
            openai_url: OpenAiCompletionBackend::DEFAULT_URL.to_string(),
            openai_model: OpenAiCompletionBackend::DEFAULT_MODEL.to_string(),
            token_budget: DEFAULT_TOKEN_BUDGET,
            upstream_timeout: DEFAULT_UPSTREAM_TIMEOUT,
            retry_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: DEFAULT_DELAY,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            query_limits: RouteLimits::query(),
            like_read_limits: RouteLimits::like_read(),
            like_write_limits: RouteLimits::like_write(),
        }
    }
}

impl GatewayConfig {
    /// Read configuration from the process environment.
    ///
    /// # Environment Variables
    /// - `RAMPART_BIND`: listen address (default: 0.0.0.0)
    /// - `PORT`: listen port (default: 3000)
    /// - `SEARCH_URL`: search endpoint (default: unset, search disabled)
    /// - `OPENAI_API_KEY`: completion key (default: unset, completions disabled)
    /// - `OPENAI_URL`: chat completions endpoint
    /// - `OPENAI_MODEL`: model name (default: gpt-3.5-turbo)
    /// - `RAMPART_TOKEN_BUDGET`: monthly token budget (default: 1000000)
    /// - `RAMPART_UPSTREAM_TIMEOUT_SECS`: per-attempt timeout (default: 30)
    /// - `RAMPART_RETRY_ATTEMPTS`: total attempts per upstream call (default: 3)
    /// - `RAMPART_RETRY_DELAY_MS`: pause between attempts (default: 1000)
    /// - `RAMPART_SWEEP_INTERVAL_SECS`: expired-state sweep interval (default: 300)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let non_empty = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        let host = non_empty("RAMPART_BIND").unwrap_or_else(|| DEFAULT_BIND.to_string());
        let port: u16 = parse(&non_empty, "PORT")?.unwrap_or(DEFAULT_PORT);
        let bind = format!("{}:{}", host, port)
            .parse()
            .map_err(|_| ConfigError::InvalidValue { var: "RAMPART_BIND", value: host.clone() })?;

        let config = Self {
            bind,
            search_url: non_empty("SEARCH_URL"),
            openai_api_key: non_empty("OPENAI_API_KEY"),
            openai_url: non_empty("OPENAI_URL").unwrap_or(defaults.openai_url),
            openai_model: non_empty("OPENAI_MODEL").unwrap_or(defaults.openai_model),
            token_budget: parse(&non_empty, "RAMPART_TOKEN_BUDGET")?.unwrap_or(defaults.token_budget),
            upstream_timeout: parse(&non_empty, "RAMPART_UPSTREAM_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.upstream_timeout),
            retry_attempts: parse(&non_empty, "RAMPART_RETRY_ATTEMPTS")?.unwrap_or(defaults.retry_attempts),
            retry_delay: parse(&non_empty, "RAMPART_RETRY_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_delay),
            sweep_interval: parse(&non_empty, "RAMPART_SWEEP_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            ..defaults
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the policies cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upstream_timeout.is_zero() {
            return Err(ConfigError::Zero("upstream timeout"));
        }
        if self.retry_attempts == 0 {
            return Err(BuildError::InvalidMaxAttempts(0).into());
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::Zero("sweep interval"));
        }
        for limits in [&self.query_limits, &self.like_read_limits, &self.like_write_limits] {
            if limits.window.is_zero() {
                return Err(ConfigError::Zero("admission window"));
            }
            if limits.limit == 0 {
                return Err(ConfigError::Zero("admission limit"));
            }
        }
        Ok(())
    }
}

fn parse<T, F>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(var)
        .map(|value| value.trim().parse().map_err(|_| ConfigError::InvalidValue { var, value }))
        .transpose()
}
