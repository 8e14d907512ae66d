use anyhow::{Context, Result, bail};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use std::{fs, path::PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BotProviderConfig {
    pub base_url: String,
    /// Sent as `X-IBM-Client-Id` when present.
    #[serde(default)]
    pub client_id: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct OpenErProviderConfig {
    pub base_url: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ProvidersConfig {
    pub bot: BotProviderConfig,
    pub open_er: OpenErProviderConfig,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        ProvidersConfig {
            bot: BotProviderConfig {
                base_url: "https://apigw1.bot.or.th/bot/public".to_string(),
                client_id: None,
            },
            open_er: OpenErProviderConfig {
                base_url: "https://open.er-api.com".to_string(),
            },
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt, transient failures only.
    pub retries: usize,
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retries: 1,
            delay_ms: 200,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct RatesConfig {
    pub ttl_secs: u64,
    pub refresh_ahead_secs: u64,
    pub tick_secs: u64,
    pub wait_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub retry: RetryConfig,
    pub providers: ProvidersConfig,
}

impl Default for RatesConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 30 * 60,
            refresh_ahead_secs: 5 * 60,
            tick_secs: 60,
            wait_timeout_ms: 5_000,
            request_timeout_ms: 10_000,
            retry: RetryConfig::default(),
            providers: ProvidersConfig::default(),
        }
    }
}

impl RatesConfig {
    pub fn load() -> Result<Self> {
        debug!("Loading default config");
        let config_path = Self::default_config_path()?;
        Self::load_from_path(&config_path)
    }

    pub fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("th", "market", "thb-rates")
            .context("Could not determine project directories")?;
        Ok(proj_dirs.config_dir().join("config.yaml"))
    }

    pub fn load_from_path<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let config_str = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Self = serde_yaml::from_str(&config_str)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.as_ref().display()))?;
        debug!("Successfully loaded config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ttl_secs == 0 {
            bail!("ttl_secs must be greater than zero");
        }
        if self.refresh_ahead_secs > self.max_refresh_ahead_secs() {
            warn!(
                refresh_ahead_secs = self.refresh_ahead_secs,
                ttl_secs = self.ttl_secs,
                "refresh_ahead_secs exceeds half the TTL, capping it"
            );
        }
        Ok(())
    }

    fn max_refresh_ahead_secs(&self) -> u64 {
        self.ttl_secs / 2
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Age at which the background tick refreshes, ahead of the TTL. The
    /// lead is capped at half the TTL so a snapshot is never due the moment
    /// it lands.
    pub fn refresh_ahead_age(&self) -> Duration {
        let lead = self.refresh_ahead_secs.min(self.max_refresh_ahead_secs());
        Duration::from_secs(self.ttl_secs - lead)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs.max(1))
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
