use serde::Deserialize;
use std::time::Duration;

/// Which rail implementations bootstrap wires in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RailMode {
    Live,
    Sandbox,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    /// In-process ledger when unset
    pub database_url: Option<String>,
    pub bind_address: String,
    pub rail_mode: RailMode,
    /// Comma separated list of allowed origins
    pub cors_origins: String,
    pub juno: JunoConfig,
    pub escrow: EscrowRelayerConfig,
    pub payout: PayoutConfig,
    pub lifecycle: LifecycleConfig,
    pub workers: WorkerConfig,
    pub safety: SafetyConfig,
    pub notifications: NotificationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            bind_address: "0.0.0.0:8080".to_string(),
            rail_mode: RailMode::Sandbox,
            cors_origins: "http://localhost:3000".to_string(),
            juno: JunoConfig::default(),
            escrow: EscrowRelayerConfig::default(),
            payout: PayoutConfig::default(),
            lifecycle: LifecycleConfig::default(),
            workers: WorkerConfig::default(),
            safety: SafetyConfig::default(),
            notifications: NotificationConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct JunoConfig {
    pub base_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub timeout_secs: u64,
}

impl Default for JunoConfig {
    fn default() -> Self {
        Self {
            base_url: "https://stage.buildwithjuno.com".to_string(),
            api_key: String::new(),
            api_secret: String::new(),
            timeout_secs: 15,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EscrowRelayerConfig {
    pub relayer_url: String,
    pub api_token: String,
    pub token_symbol: String,
    pub timeout_secs: u64,
}

impl Default for EscrowRelayerConfig {
    fn default() -> Self {
        Self {
            relayer_url: "http://localhost:8545".to_string(),
            api_token: String::new(),
            token_symbol: "MXNB".to_string(),
            timeout_secs: 30,
        }
    }
}

/// Redemption confirmation polling bounds
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PayoutConfig {
    pub poll_attempts: u32,
    pub poll_interval_ms: u64,
    /// How many recent rail transactions each poll inspects
    pub poll_page_size: u32,
}

impl Default for PayoutConfig {
    fn default() -> Self {
        Self {
            poll_attempts: 20,
            poll_interval_ms: 1000,
            poll_page_size: 10,
        }
    }
}

impl PayoutConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LifecycleConfig {
    pub platform_fee_bps: u32,
    /// A `processing` claim untouched for this long may be re-taken
    pub processing_lease_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            platform_fee_bps: 0,
            processing_lease_secs: 600,
        }
    }
}

impl LifecycleConfig {
    pub fn processing_lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.processing_lease_secs as i64)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WorkerConfig {
    pub enabled: bool,
    pub deposit_poll_secs: u64,
    pub custody_scan_secs: u64,
    pub safety_scan_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            deposit_poll_secs: 60,
            custody_scan_secs: 300,
            safety_scan_secs: 1800,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SafetyConfig {
    pub stuck_age_secs: u64,
    pub max_recovery_attempts: u32,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            stuck_age_secs: 1800,
            max_recovery_attempts: 3,
        }
    }
}

impl SafetyConfig {
    pub fn stuck_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stuck_age_secs as i64)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct NotificationConfig {
    pub resend_api_key: Option<String>,
    pub from_email: Option<String>,
    pub admin_email: Option<String>,
}

impl Config {
    /// Defaults overlaid with environment variables; nested keys use `__`,
    /// e.g. `SAFETY__MAX_RECOVERY_ATTEMPTS=5`.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), config::ConfigError> {
        if self.payout.poll_attempts == 0 {
            return Err(config::ConfigError::Message(
                "payout.poll_attempts must be at least 1".to_string(),
            ));
        }
        if self.safety.max_recovery_attempts == 0 {
            return Err(config::ConfigError::Message(
                "safety.max_recovery_attempts must be at least 1".to_string(),
            ));
        }
        if self.rail_mode == RailMode::Live
            && (self.juno.api_key.is_empty() || self.juno.api_secret.is_empty())
        {
            return Err(config::ConfigError::Message(
                "live rail mode requires JUNO__API_KEY and JUNO__API_SECRET".to_string(),
            ));
        }
        Ok(())
    }

    pub fn cors_origin_list(&self) -> Vec<String> {
        self.cors_origins
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(str::to_string)
            .collect()
    }
}
