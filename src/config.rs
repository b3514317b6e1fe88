//! Configuration types.
//!
//! Everything is read from environment variables with sensible defaults.
//! `from_lookup` takes the variable source as a closure so tests can feed
//! values without touching the process environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::delivery::rate_limiter::RateLimitConfig;
use crate::delivery::retry::RetryPolicy;
use crate::error::ConfigError;

/// Upstream email API settings.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Bearer token for the Resend API. Redacted in `Debug` output.
    pub api_key: SecretString,
    pub base_url: String,
    pub from_email: String,
    pub from_name: String,
    /// Per-request timeout. The engine imposes no other deadline.
    pub request_timeout: Duration,
    /// Value for the `List-Unsubscribe` header, added to every message when set.
    pub list_unsubscribe: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: SecretString::from(String::new()),
            base_url: "https://api.resend.com".to_string(),
            from_email: "noreply@example.com".to_string(),
            from_name: "No Reply".to_string(),
            request_timeout: Duration::from_secs(30),
            list_unsubscribe: None,
        }
    }
}

impl ProviderConfig {
    /// `Name <address>` form used in the `from` field.
    pub fn from_header(&self) -> String {
        format!("{} <{}>", self.from_name, self.from_email)
    }

    pub fn has_api_key(&self) -> bool {
        !self.api_key.expose_secret().trim().is_empty()
    }
}

/// Dispatch-engine knobs.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Maximum number of remote-call phases in flight at once.
    pub concurrency: usize,
    pub dry_run: bool,
    pub daily_limit: u32,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            dry_run: false,
            daily_limit: 100,
            rate_limit: RateLimitConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Full mailer configuration.
#[derive(Debug, Clone)]
pub struct MailerConfig {
    pub provider: ProviderConfig,
    pub dispatch: DispatchConfig,
    pub database_path: PathBuf,
    pub templates_dir: PathBuf,
    /// When set, logs are also written to a daily-rolling file here.
    pub log_dir: Option<PathBuf>,
}

impl Default for MailerConfig {
    fn default() -> Self {
        Self {
            provider: ProviderConfig::default(),
            dispatch: DispatchConfig::default(),
            database_path: PathBuf::from("./data/mailer.db"),
            templates_dir: PathBuf::from("templates"),
            log_dir: None,
        }
    }
}

impl MailerConfig {
    /// Build config from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let provider = ProviderConfig {
            api_key: SecretString::from(get("RESEND_API_KEY").unwrap_or_default()),
            base_url: get("RESEND_BASE_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or(defaults.provider.base_url),
            from_email: get("RESEND_FROM_EMAIL").unwrap_or(defaults.provider.from_email),
            from_name: get("RESEND_FROM_NAME").unwrap_or(defaults.provider.from_name),
            request_timeout: Duration::from_secs(parse_or(
                &get,
                "RESEND_TIMEOUT_SECS",
                defaults.provider.request_timeout.as_secs(),
            )?),
            list_unsubscribe: get("LIST_UNSUBSCRIBE"),
        };

        let dispatch = DispatchConfig {
            concurrency: parse_or(&get, "CONCURRENCY", defaults.dispatch.concurrency)?,
            dry_run: match get("DRY_RUN") {
                Some(raw) => parse_bool("DRY_RUN", &raw)?,
                None => defaults.dispatch.dry_run,
            },
            daily_limit: parse_or(&get, "DAILY_LIMIT", defaults.dispatch.daily_limit)?,
            rate_limit: RateLimitConfig {
                calls_per_window: parse_or(
                    &get,
                    "RATE_LIMIT_CALLS",
                    defaults.dispatch.rate_limit.calls_per_window,
                )?,
                window: Duration::from_secs(parse_or(
                    &get,
                    "RATE_LIMIT_WINDOW_SECS",
                    defaults.dispatch.rate_limit.window.as_secs(),
                )?),
            },
            retry: RetryPolicy {
                max_retries: parse_or(&get, "MAX_RETRIES", defaults.dispatch.retry.max_retries)?,
                base_delay: Duration::from_millis(parse_or(
                    &get,
                    "RETRY_BASE_DELAY_MS",
                    defaults.dispatch.retry.base_delay.as_millis() as u64,
                )?),
            },
        };

        Ok(Self {
            provider,
            dispatch,
            database_path: get("SQLITE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            templates_dir: get("TEMPLATES_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.templates_dir),
            log_dir: get("MAILER_LOG_DIR").map(PathBuf::from),
        })
    }

    /// Preflight checks. Collects every problem instead of stopping at the first.
    ///
    /// The API key is only required for live sends.
    pub fn validate(&self, live: bool) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if live && !self.provider.has_api_key() {
            problems.push("RESEND_API_KEY is not set".to_string());
        }
        if !self.provider.from_email.contains('@') {
            problems.push(format!(
                "RESEND_FROM_EMAIL is not an address: {}",
                self.provider.from_email
            ));
        }
        if self.provider.from_name.trim().is_empty() {
            problems.push("RESEND_FROM_NAME is empty".to_string());
        }
        if self.dispatch.concurrency == 0 {
            problems.push("CONCURRENCY must be greater than 0".to_string());
        }
        if self.dispatch.daily_limit == 0 {
            problems.push("DAILY_LIMIT must be greater than 0".to_string());
        }
        if self.dispatch.rate_limit.calls_per_window == 0 {
            problems.push("RATE_LIMIT_CALLS must be greater than 0".to_string());
        }
        if self.dispatch.rate_limit.window.is_zero() {
            problems.push("RATE_LIMIT_WINDOW_SECS must be greater than 0".to_string());
        }
        if let Some(parent) = self.database_path.parent().filter(|p| p.exists()) {
            let readonly = std::fs::metadata(parent)
                .map(|m| m.permissions().readonly())
                .unwrap_or(true);
            if readonly {
                problems.push(format!(
                    "Database directory is not writable: {}",
                    parent.display()
                ));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Preflight(problems))
        }
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        }),
        None => Ok(default),
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a boolean, got {other:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_set() {
        let config = MailerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.provider.base_url, "https://api.resend.com");
        assert_eq!(config.provider.from_header(), "No Reply <noreply@example.com>");
        assert_eq!(config.dispatch.concurrency, 5);
        assert_eq!(config.dispatch.daily_limit, 100);
        assert_eq!(config.dispatch.rate_limit.calls_per_window, 10);
        assert_eq!(config.dispatch.retry.max_retries, 3);
        assert!(!config.dispatch.dry_run);
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn reads_overrides() {
        let config = MailerConfig::from_lookup(lookup(&[
            ("RESEND_BASE_URL", "http://localhost:9999/"),
            ("CONCURRENCY", "8"),
            ("DRY_RUN", "yes"),
            ("DAILY_LIMIT", "250"),
            ("RATE_LIMIT_CALLS", "2"),
            ("RATE_LIMIT_WINDOW_SECS", "5"),
            ("MAX_RETRIES", "0"),
            ("RETRY_BASE_DELAY_MS", "250"),
            ("LIST_UNSUBSCRIBE", "<mailto:unsub@example.com>"),
        ]))
        .unwrap();
        assert_eq!(config.provider.base_url, "http://localhost:9999");
        assert_eq!(config.dispatch.concurrency, 8);
        assert!(config.dispatch.dry_run);
        assert_eq!(config.dispatch.daily_limit, 250);
        assert_eq!(config.dispatch.rate_limit.window, Duration::from_secs(5));
        assert_eq!(config.dispatch.retry.max_retries, 0);
        assert_eq!(config.dispatch.retry.base_delay, Duration::from_millis(250));
        assert_eq!(
            config.provider.list_unsubscribe.as_deref(),
            Some("<mailto:unsub@example.com>")
        );
    }

    #[test]
    fn bad_number_is_an_error() {
        let err = MailerConfig::from_lookup(lookup(&[("CONCURRENCY", "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "CONCURRENCY"));
    }

    #[test]
    fn api_key_is_redacted() {
        let config =
            MailerConfig::from_lookup(lookup(&[("RESEND_API_KEY", "re_supersecret")])).unwrap();
        let dbg = format!("{:?}", config.provider);
        assert!(!dbg.contains("re_supersecret"));
    }

    #[test]
    fn preflight_requires_key_only_when_live() {
        let config = MailerConfig::from_lookup(lookup(&[])).unwrap();
        assert!(config.validate(false).is_ok());

        match config.validate(true) {
            Err(ConfigError::Preflight(problems)) => {
                assert!(problems.iter().any(|p| p.contains("RESEND_API_KEY")));
            }
            other => panic!("expected preflight failure, got {other:?}"),
        }
    }

    #[test]
    fn preflight_collects_all_problems() {
        let config = MailerConfig::from_lookup(lookup(&[
            ("CONCURRENCY", "0"),
            ("DAILY_LIMIT", "0"),
            ("RESEND_FROM_EMAIL", "not-an-address"),
        ]))
        .unwrap();
        match config.validate(false) {
            Err(ConfigError::Preflight(problems)) => assert_eq!(problems.len(), 3),
            other => panic!("expected preflight failure, got {other:?}"),
        }
    }
}
