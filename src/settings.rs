use std::time::Duration;

use config::{Config, Environment};
use serde::Deserialize;

use crate::error::{CrawlError, Result};

pub const DEFAULT_ENDPOINT: &str = "https://maps.googleapis.com/maps/api/place/textsearch/json";
pub const API_KEY_VAR: &str = "GOOGLE_API_KEY";
const ENV_PREFIX: &str = "BIO";

/// Upstream refuses a continuation token presented earlier than this.
pub const MIN_PAGE_DELAY_MS: u64 = 2100;
/// Queries-per-second ceiling of the upstream, expressed as a gap between searches.
pub const MIN_KEYWORD_DELAY_MS: u64 = 1000;

/// Runtime settings, built once in `main` and passed down explicitly.
#[derive(Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub api_key: Option<String>,
    pub endpoint: String,
    pub page_delay_ms: u64,
    pub keyword_delay_ms: u64,
    pub max_pages: usize,
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub request_timeout_secs: u64,
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("endpoint", &self.endpoint)
            .field("page_delay_ms", &self.page_delay_ms)
            .field("keyword_delay_ms", &self.keyword_delay_ms)
            .field("max_pages", &self.max_pages)
            .field("max_retries", &self.max_retries)
            .field("backoff_ms", &self.backoff_ms)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

impl Settings {
    /// Defaults, then `BIO_*` variables, then the credential from `GOOGLE_API_KEY`.
    pub fn load() -> Result<Self> {
        let api_key = std::env::var(API_KEY_VAR).ok().filter(|k| !k.trim().is_empty());
        Self::from_source(Environment::with_prefix(ENV_PREFIX), api_key)
    }

    fn from_source(env: Environment, api_key: Option<String>) -> Result<Self> {
        let settings: Settings = Config::builder()
            .set_default("endpoint", DEFAULT_ENDPOINT)
            .and_then(|b| b.set_default("page_delay_ms", MIN_PAGE_DELAY_MS as i64))
            .and_then(|b| b.set_default("keyword_delay_ms", MIN_KEYWORD_DELAY_MS as i64))
            .and_then(|b| b.set_default("max_pages", 3_i64))
            .and_then(|b| b.set_default("max_retries", 3_i64))
            .and_then(|b| b.set_default("backoff_ms", 2000_i64))
            .and_then(|b| b.set_default("request_timeout_secs", 30_i64))
            .and_then(|b| b.set_override_option("api_key", api_key))
            .map_err(config_error)?
            .add_source(env.try_parsing(true))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(config_error)?;

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.page_delay_ms < MIN_PAGE_DELAY_MS {
            return Err(CrawlError::Config(format!(
                "page_delay_ms must be at least {} (got {})",
                MIN_PAGE_DELAY_MS, self.page_delay_ms
            )));
        }
        if self.keyword_delay_ms < MIN_KEYWORD_DELAY_MS {
            return Err(CrawlError::Config(format!(
                "keyword_delay_ms must be at least {} (got {})",
                MIN_KEYWORD_DELAY_MS, self.keyword_delay_ms
            )));
        }
        if self.max_pages == 0 {
            return Err(CrawlError::Config("max_pages must be at least 1".into()));
        }
        Ok(())
    }

    /// The credential, or a `ConfigError` naming the variable to set.
    pub fn require_api_key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .ok_or_else(|| CrawlError::Config(format!("{} is not set (environment or .env)", API_KEY_VAR)))
    }

    pub fn page_delay(&self) -> Duration {
        Duration::from_millis(self.page_delay_ms)
    }

    pub fn keyword_delay(&self) -> Duration {
        Duration::from_millis(self.keyword_delay_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_key: None,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            page_delay_ms: MIN_PAGE_DELAY_MS,
            keyword_delay_ms: MIN_KEYWORD_DELAY_MS,
            max_pages: 3,
            max_retries: 3,
            backoff_ms: 2000,
            request_timeout_secs: 30,
        }
    }
}

fn config_error(err: config::ConfigError) -> CrawlError {
    CrawlError::Config(err.to_string())
}
