use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    pub backend: BackendConfig,
    #[serde(default)]
    pub realtime: RealtimeConfig,
    #[serde(default)]
    pub pagination: PaginationConfig,
    #[serde(default)]
    pub screens: ScreenConfig,
    #[serde(default)]
    pub wallet: WalletConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

impl ClientConfig {
    pub fn load() -> Result<Self> {
        let configured_path = std::env::var("ONESOCIAL_CONFIG")
            .unwrap_or_else(|_| "config/client.toml".to_string());
        ensure!(
            !configured_path.is_empty(),
            "Configuration path must be non-empty"
        );

        let mut builder = Config::builder()
            .add_source(File::new(&configured_path, FileFormat::Toml).required(true));

        if let Ok(env_override) = std::env::var("ONESOCIAL_ENV") {
            if !env_override.is_empty() {
                let env_file = format!("config/client.{}.toml", env_override);
                if Path::new(&env_file).exists() {
                    builder = builder.add_source(File::new(&env_file, FileFormat::Toml));
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("ONESOCIAL")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let settings = builder
            .build()
            .map_err(|err| map_config_error(err, &configured_path))?;
        Self::from_settings(settings)
    }

    pub fn from_toml(source: &str) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::from_str(source, FileFormat::Toml))
            .build()
            .context("Failed to parse client configuration")?;
        Self::from_settings(settings)
    }

    fn from_settings(settings: Config) -> Result<Self> {
        let config: Self = settings
            .try_deserialize()
            .context("Failed to deserialize client configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// In-process configuration used by offline runs and tests.
    pub fn memory() -> Self {
        Self {
            backend: BackendConfig {
                mode: BackendMode::Memory,
                url: String::new(),
                anon_key: String::new(),
                request_timeout_ms: None,
            },
            realtime: RealtimeConfig::default(),
            pagination: PaginationConfig::default(),
            screens: ScreenConfig::default(),
            wallet: WalletConfig::default(),
            cache: CacheConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.backend.mode == BackendMode::Rest {
            ensure!(!self.backend.url.is_empty(), "Backend URL must be specified");
            ensure!(
                self.backend.url.starts_with("http://") || self.backend.url.starts_with("https://"),
                "Backend URL must be http(s)"
            );
            ensure!(
                !self.backend.anon_key.is_empty(),
                "Backend anon key must be specified"
            );
        }
        ensure_millis("backend.request_timeout_ms", self.backend.request_timeout_ms())?;
        ensure_millis("realtime.heartbeat_interval_ms", self.realtime.heartbeat_interval_ms)?;
        ensure_millis("realtime.join_timeout_ms", self.realtime.join_timeout_ms)?;
        ensure_millis("screens.load_timeout_ms", self.screens.load_timeout_ms)?;
        self.pagination.ensure_bounds()?;
        self.wallet.ensure_bounds()?;
        self.cache.ensure_bounds()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    Rest,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "BackendConfig::default_mode")]
    pub mode: BackendMode,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub anon_key: String,
    pub request_timeout_ms: Option<u64>,
}

impl BackendConfig {
    pub fn request_timeout_ms(&self) -> u64 {
        self.request_timeout_ms.unwrap_or(10_000)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms())
    }

    const fn default_mode() -> BackendMode {
        BackendMode::Rest
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    pub heartbeat_interval_ms: u64,
    pub join_timeout_ms: u64,
}

impl RealtimeConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 25_000,
            join_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PaginationConfig {
    pub page_size: usize,
}

impl PaginationConfig {
    fn ensure_bounds(&self) -> Result<()> {
        ensure!(self.page_size > 0, "Page size must be positive");
        ensure!(self.page_size <= 200, "Page size exceeds limit of 200");
        Ok(())
    }
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self { page_size: 20 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScreenConfig {
    pub load_timeout_ms: u64,
}

impl ScreenConfig {
    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }
}

impl Default for ScreenConfig {
    fn default() -> Self {
        Self {
            load_timeout_ms: 15_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    pub bootstrap_attempts: u32,
    pub backoff_base_ms: u64,
    pub default_currency: String,
}

impl WalletConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    fn ensure_bounds(&self) -> Result<()> {
        ensure!(
            self.bootstrap_attempts >= 1,
            "Wallet bootstrap needs at least one attempt"
        );
        ensure!(
            self.bootstrap_attempts <= 10,
            "Wallet bootstrap attempts exceed limit of 10"
        );
        ensure!(
            self.backoff_base_ms <= 10_000,
            "Wallet backoff base cannot exceed 10 seconds"
        );
        ensure!(
            !self.default_currency.trim().is_empty(),
            "Wallet default currency must be set"
        );
        Ok(())
    }
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            bootstrap_attempts: 3,
            backoff_base_ms: 200,
            default_currency: "USD".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub profiles_max_capacity: u64,
    pub profiles_ttl_seconds: u64,
}

impl CacheConfig {
    pub fn profiles_ttl(&self) -> Duration {
        Duration::from_secs(self.profiles_ttl_seconds)
    }

    fn ensure_bounds(&self) -> Result<()> {
        ensure!(
            self.profiles_max_capacity >= 16,
            "Profile cache capacity must be at least 16"
        );
        ensure!(
            self.profiles_ttl_seconds > 0,
            "Profile cache TTL must be positive"
        );
        ensure!(
            self.profiles_ttl_seconds <= 86_400,
            "Profile cache TTL cannot exceed one day"
        );
        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            profiles_max_capacity: 1_024,
            profiles_ttl_seconds: 300,
        }
    }
}

fn ensure_millis(label: &str, millis: u64) -> Result<()> {
    ensure!(millis >= 100, "{label} must be at least 100ms");
    ensure!(millis <= 60_000, "{label} cannot exceed 60 seconds");
    Ok(())
}

fn map_config_error(err: ConfigError, path: &str) -> ConfigError {
    match err {
        ConfigError::NotFound(_) => ConfigError::NotFound(path.to_string()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [backend]
        url = "https://example.supabase.co"
        anon_key = "anon"

        [pagination]
        page_size = 25
    "#;

    #[test]
    fn parses_sample_with_defaults() {
        let config = ClientConfig::from_toml(SAMPLE).expect("sample parses");
        assert_eq!(config.backend.mode, BackendMode::Rest);
        assert_eq!(config.pagination.page_size, 25);
        assert_eq!(config.wallet.bootstrap_attempts, 3);
        assert_eq!(config.backend.request_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn rejects_rest_mode_without_url() {
        let err = ClientConfig::from_toml("[backend]\nanon_key = \"anon\"\n").unwrap_err();
        assert!(err.to_string().contains("Backend URL"));
    }

    #[test]
    fn rejects_oversized_page() {
        let source = format!("{SAMPLE}\n[screens]\nload_timeout_ms = 50\n");
        assert!(ClientConfig::from_toml(&source).is_err());

        let mut config = ClientConfig::memory();
        config.pagination.page_size = 500;
        assert!(config.validate().is_err());
    }

    #[test]
    fn memory_config_is_valid() {
        ClientConfig::memory().validate().expect("memory config valid");
    }
}
