// =============================================================================
// Runtime Configuration: pipeline settings with atomic save
// =============================================================================
//
// Every tunable of the ingestion pipeline lives here: which provider to talk
// to and how politely, how strict normalisation is, and how results are
// cached.
//
// The file is JSON and may omit any field. Saving goes through a sibling
// `.tmp` file and a rename, so readers see either the old or the new file.
//
// =============================================================================

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::source::{binance, coingecko, RetryPolicy};
use crate::types::ProviderKind;

pub const DEFAULT_CONFIG_PATH: &str = "coinscope.json";

/// Upper bound on bars per dataset, configured or requested. A year of
/// hourly bars fits.
pub const MAX_LOOKBACK_BARS: u32 = 10_000;

// =============================================================================
// Serde defaults
// =============================================================================

fn default_vs_currency() -> String {
    "usd".to_string()
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_max_network_attempts() -> u32 {
    3
}

fn default_max_rate_limit_attempts() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_max_invalid_fraction() -> f64 {
    0.05
}

fn default_cache_capacity() -> usize {
    256
}

fn default_lookback_bars() -> u32 {
    500
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Pipeline settings as read from disk, after env overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Provider -----------------------------------------------------------

    #[serde(default)]
    pub provider: ProviderKind,

    /// Override of the provider's public endpoint (tests, proxies).
    #[serde(default)]
    pub base_url: Option<String>,

    /// Quote currency for price-point providers (CoinGecko).
    #[serde(default = "default_vs_currency")]
    pub vs_currency: String,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Minimum gap between two outbound requests. Unset means the provider's
    /// own default (100 ms Binance, 2.5 s CoinGecko free tier).
    #[serde(default)]
    pub min_request_spacing_ms: Option<u64>,

    // --- Retry --------------------------------------------------------------

    #[serde(default = "default_max_network_attempts")]
    pub max_network_attempts: u32,

    #[serde(default = "default_max_rate_limit_attempts")]
    pub max_rate_limit_attempts: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    // --- Normalisation ------------------------------------------------------

    /// Share of invalid bars tolerated before a payload is rejected.
    #[serde(default = "default_max_invalid_fraction")]
    pub max_invalid_fraction: f64,

    /// Bars requested per dataset (ending now) when a request does not say.
    /// Clamped to `1..=MAX_LOOKBACK_BARS`, see [`RuntimeConfig::lookback`].
    #[serde(default = "default_lookback_bars")]
    pub lookback_bars: u32,

    // --- Cache --------------------------------------------------------------

    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// Fixed dataset TTL. Unset means one bar of the requested interval.
    #[serde(default)]
    pub cache_ttl_secs: Option<u64>,

    /// Directory for the on-disk cache layer. Unset disables it.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    // --- Server -------------------------------------------------------------

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            base_url: None,
            vs_currency: default_vs_currency(),
            request_timeout_secs: default_request_timeout_secs(),
            min_request_spacing_ms: None,
            max_network_attempts: default_max_network_attempts(),
            max_rate_limit_attempts: default_max_rate_limit_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            max_invalid_fraction: default_max_invalid_fraction(),
            lookback_bars: default_lookback_bars(),
            cache_capacity: default_cache_capacity(),
            cache_ttl_secs: None,
            cache_dir: None,
            bind_addr: default_bind_addr(),
        }
    }
}

impl RuntimeConfig {
    /// Read `path`. A missing or unparsable file is an error; the caller
    /// decides whether defaults are acceptable.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("config {} is not valid JSON", path.display()))?;

        info!(
            path = %path.display(),
            provider = %config.provider,
            cache_capacity = config.cache_capacity,
            "config loaded"
        );

        Ok(config)
    }

    /// Write the config as pretty JSON via a `.tmp` sibling and a rename.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let body = serde_json::to_string_pretty(self).context("encoding config")?;
        let staging = path.with_extension("json.tmp");
        std::fs::write(&staging, body)
            .with_context(|| format!("writing {}", staging.display()))?;
        std::fs::rename(&staging, path)
            .with_context(|| format!("replacing {}", path.display()))?;
        info!(path = %path.display(), "config saved");
        Ok(())
    }

    /// Apply `COINSCOPE_PROVIDER`, `COINSCOPE_BIND_ADDR` and
    /// `COINSCOPE_CACHE_DIR` on top of the file values.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(raw) = var("COINSCOPE_PROVIDER") {
            match raw.parse::<ProviderKind>() {
                Ok(provider) => self.provider = provider,
                Err(e) => warn!(value = %raw, error = %e, "ignoring COINSCOPE_PROVIDER"),
            }
        }
        if let Some(addr) = var("COINSCOPE_BIND_ADDR").filter(|s| !s.trim().is_empty()) {
            self.bind_addr = addr;
        }
        if let Some(dir) = var("COINSCOPE_CACHE_DIR").filter(|s| !s.trim().is_empty()) {
            self.cache_dir = Some(PathBuf::from(dir));
        }
    }

    pub fn lookback(&self) -> u32 {
        self.lookback_bars.clamp(1, MAX_LOOKBACK_BARS)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_network_attempts: self.max_network_attempts.max(1),
            max_rate_limit_attempts: self.max_rate_limit_attempts.max(1),
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms.max(self.backoff_base_ms)),
        }
    }

    pub fn request_spacing(&self) -> Duration {
        let ms = self.min_request_spacing_ms.unwrap_or(match self.provider {
            ProviderKind::Binance => 100,
            ProviderKind::CoinGecko => 2_500,
        });
        Duration::from_millis(ms)
    }

    pub fn base_url_or_default(&self) -> String {
        match &self.base_url {
            Some(url) => url.clone(),
            None => match self.provider {
                ProviderKind::Binance => binance::DEFAULT_BASE_URL.to_string(),
                ProviderKind::CoinGecko => coingecko::DEFAULT_BASE_URL.to_string(),
            },
        }
    }
}
