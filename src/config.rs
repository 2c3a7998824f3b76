//! Configuration types for the broker.
//!
//! Config is loaded once at startup from a TOML file and validated before the
//! server opens any ports. Invalid configs are rejected with a clear error
//! rather than silently falling back to defaults.
//!
//! # Example
//! ```toml
//! [gateway]
//! client_port = 8080
//! admin_port  = 8081
//!
//! [[accounts]]
//! key_env    = "ACME_API_KEY"
//! account_id = "11111111-1111-1111-1111-111111111111"
//!
//! [tokenomics]
//! welcome_amount    = "1.0"
//! platform_fee_rate = "0.10"
//! ```

use std::{collections::HashMap, path::Path};

use anyhow::Context;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dispatcher::DispatcherConfig;
use crate::model::AccountId;
use crate::session::HeartbeatConfig;
use crate::tokenomics::{ConversionRates, Tokenomics};

/// A credential binding: the broker reads the actual API key value from the
/// environment variable named by `key_env` at startup and maps it to
/// `account_id`. The same credential authenticates a consumer's client
/// requests and a provider's WebSocket registration — the broker resolves
/// one account id either way (§6: unified account resolution).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AccountCredential {
    /// Name of the environment variable whose value is this account's API key.
    pub key_env: String,
    pub account_id: Uuid,
}

/// Top-level broker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub tokenomics: TokenomicsConfig,

    /// API key → account bindings, shared by client auth and provider auth.
    #[serde(default)]
    pub accounts: Vec<AccountCredential>,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Self = toml::from_str(&content).context("parsing config TOML")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.gateway.client_port != self.gateway.admin_port,
            "gateway.client_port and gateway.admin_port must differ"
        );
        anyhow::ensure!(
            self.tokenomics.platform_fee_rate >= Decimal::ZERO && self.tokenomics.platform_fee_rate < Decimal::ONE,
            "tokenomics.platform_fee_rate must be in [0, 1)"
        );
        anyhow::ensure!(self.tokenomics.welcome_amount >= Decimal::ZERO, "tokenomics.welcome_amount must be non-negative");
        for rate in [
            self.tokenomics.conversion_rates.small,
            self.tokenomics.conversion_rates.medium,
            self.tokenomics.conversion_rates.large,
            self.tokenomics.conversion_rates.xl,
        ] {
            anyhow::ensure!(rate > 0, "tokenomics.conversion_rates entries must be positive");
        }

        let mut seen = std::collections::HashSet::new();
        for account in &self.accounts {
            anyhow::ensure!(seen.insert(account.key_env.as_str()), "duplicate accounts[].key_env `{}`", account.key_env);
        }

        Ok(())
    }

    /// Resolve every configured account credential's API key from its
    /// environment variable. Fails fast at startup rather than letting an
    /// account silently become unauthenticatable (§1: fail fast on
    /// misconfiguration rather than degrade silently).
    pub fn resolve_api_keys(&self) -> anyhow::Result<HashMap<String, AccountId>> {
        let mut keys = HashMap::with_capacity(self.accounts.len());
        for account in &self.accounts {
            let value = std::env::var(&account.key_env)
                .with_context(|| format!("accounts[].key_env `{}` is not set", account.key_env))?;
            keys.insert(value, AccountId(account.account_id));
        }
        Ok(keys)
    }

    pub fn tokenomics(&self) -> Tokenomics {
        Tokenomics {
            welcome_amount: self.tokenomics.welcome_amount,
            platform_fee_rate: self.tokenomics.platform_fee_rate,
            conversion_rates: ConversionRates {
                small: self.tokenomics.conversion_rates.small,
                medium: self.tokenomics.conversion_rates.medium,
                large: self.tokenomics.conversion_rates.large,
                xl: self.tokenomics.conversion_rates.xl,
            },
        }
    }

    pub fn heartbeat(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            ping_interval: std::time::Duration::from_secs(self.gateway.ping_interval_secs),
            timeout: std::time::Duration::from_secs(self.gateway.heartbeat_timeout_secs),
        }
    }

    pub fn dispatcher(&self) -> DispatcherConfig {
        DispatcherConfig {
            load_threshold: self.gateway.load_threshold,
            default_timeout: std::time::Duration::from_secs(self.gateway.default_request_timeout_secs),
            max_timeout: std::time::Duration::from_secs(self.gateway.max_request_timeout_secs),
        }
    }
}

/// Core gateway settings, plus the broker tunables of §6.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Port for the client- and provider-facing API (default: 8080).
    #[serde(default = "defaults::client_port")]
    pub client_port: u16,

    /// Port for the admin API (default: 8081).
    #[serde(default = "defaults::admin_port")]
    pub admin_port: u16,

    /// Number of recent requests to keep in the in-memory traffic log (default: 500).
    #[serde(default = "defaults::traffic_log_capacity")]
    pub traffic_log_capacity: usize,

    /// Log level override (also controlled by `RUST_LOG` env var).
    #[serde(default)]
    pub log_level: Option<String>,

    /// Maximum requests per minute per client IP on the client port. Leave
    /// unset (or 0) to disable rate limiting.
    #[serde(default)]
    pub rate_limit_rpm: Option<u32>,

    /// Environment variable whose value is the Bearer token required for all
    /// admin API requests. Leave unset to disable admin authentication (only
    /// recommended when the admin port is strictly firewalled).
    #[serde(default)]
    pub admin_token_env: Option<String>,

    /// Permit a provider to register without a recognized credential,
    /// forgoing ledger credit entirely for that session (§9 design notes).
    #[serde(default)]
    pub allow_anonymous_providers: bool,

    /// `T_ping` — heartbeat ping interval (§4.4, §6; default 15s).
    #[serde(default = "defaults::ping_interval_secs")]
    pub ping_interval_secs: u64,

    /// `T_timeout` — heartbeat timeout; demotion happens at `T_timeout / 3`
    /// (§4.4, §6; default 45s).
    #[serde(default = "defaults::heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,

    /// In-flight requests at or above which a provider is skipped during
    /// selection (§4.5 step 3, §6; default 5).
    #[serde(default = "defaults::load_threshold")]
    pub load_threshold: u32,

    /// `T_req` — default per-request timeout, overridable by the client up
    /// to `max_request_timeout_secs` (§6; default 180s).
    #[serde(default = "defaults::default_request_timeout_secs")]
    pub default_request_timeout_secs: u64,

    /// Hard cap on `T_req`, regardless of client override (§6; default 300s).
    #[serde(default = "defaults::max_request_timeout_secs")]
    pub max_request_timeout_secs: u64,
}

/// Tokenomics tunables (§2, §6), mirrored from [`crate::tokenomics::Tokenomics`]
/// with `Deserialize`/`Serialize` and string-form decimals for TOML.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TokenomicsConfig {
    #[serde(default = "defaults::welcome_amount")]
    pub welcome_amount: Decimal,

    #[serde(default = "defaults::platform_fee_rate")]
    pub platform_fee_rate: Decimal,

    #[serde(default)]
    pub conversion_rates: ConversionRatesConfig,
}

impl Default for TokenomicsConfig {
    fn default() -> Self {
        Self {
            welcome_amount: defaults::welcome_amount(),
            platform_fee_rate: defaults::platform_fee_rate(),
            conversion_rates: ConversionRatesConfig::default(),
        }
    }
}

/// Tokens-per-mule conversion rate per tier (§2, §6).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConversionRatesConfig {
    #[serde(default = "defaults::rate_small")]
    pub small: u64,
    #[serde(default = "defaults::rate_medium")]
    pub medium: u64,
    #[serde(default = "defaults::rate_large")]
    pub large: u64,
    #[serde(default = "defaults::rate_xl")]
    pub xl: u64,
}

impl Default for ConversionRatesConfig {
    fn default() -> Self {
        Self {
            small: defaults::rate_small(),
            medium: defaults::rate_medium(),
            large: defaults::rate_large(),
            xl: defaults::rate_xl(),
        }
    }
}

mod defaults {
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    pub fn client_port() -> u16 { 8080 }
    pub fn admin_port() -> u16 { 8081 }
    pub fn traffic_log_capacity() -> usize { 500 }
    pub fn ping_interval_secs() -> u64 { 15 }
    pub fn heartbeat_timeout_secs() -> u64 { 45 }
    pub fn load_threshold() -> u32 { 5 }
    pub fn default_request_timeout_secs() -> u64 { 180 }
    pub fn max_request_timeout_secs() -> u64 { 300 }
    pub fn welcome_amount() -> Decimal { dec!(1.0) }
    pub fn platform_fee_rate() -> Decimal { dec!(0.10) }
    pub fn rate_small() -> u64 { 1_000_000 }
    pub fn rate_medium() -> u64 { 500_000 }
    pub fn rate_large() -> u64 { 250_000 }
    pub fn rate_xl() -> u64 { 125_000 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> Config {
        toml::from_str(
            r#"
            [gateway]
            client_port = 8080
            admin_port  = 8081

            [[accounts]]
            key_env    = "TEST_ACME_KEY"
            account_id = "11111111-1111-1111-1111-111111111111"
            "#,
        )
        .expect("minimal config should parse")
    }

    #[test]
    fn gateway_defaults_are_applied_when_section_is_minimal() {
        let config: Config = toml::from_str("[gateway]\n").expect("should parse");
        assert_eq!(config.gateway.client_port, 8080);
        assert_eq!(config.gateway.admin_port, 8081);
        assert_eq!(config.gateway.traffic_log_capacity, 500);
        assert_eq!(config.gateway.ping_interval_secs, 15);
        assert_eq!(config.gateway.heartbeat_timeout_secs, 45);
        assert_eq!(config.gateway.load_threshold, 5);
        assert_eq!(config.gateway.default_request_timeout_secs, 180);
        assert_eq!(config.gateway.max_request_timeout_secs, 300);
    }

    #[test]
    fn tokenomics_defaults_match_spec() {
        let config: Config = toml::from_str("[gateway]\n").expect("should parse");
        let tok = config.tokenomics();
        assert_eq!(tok.welcome_amount, dec!(1.0));
        assert_eq!(tok.platform_fee_rate, dec!(0.10));
        assert_eq!(tok.conversion_rates.small, 1_000_000);
        assert_eq!(tok.conversion_rates.xl, 125_000);
    }

    #[test]
    fn validate_rejects_matching_client_and_admin_ports() {
        let mut config = minimal_config();
        config.gateway.admin_port = config.gateway.client_port;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_fee_rate_out_of_range() {
        let mut config = minimal_config();
        config.tokenomics.platform_fee_rate = dec!(1.5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_duplicate_key_env() {
        let mut config = minimal_config();
        config.accounts.push(AccountCredential {
            key_env: "TEST_ACME_KEY".into(),
            account_id: Uuid::new_v4(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn resolve_api_keys_maps_env_value_to_account_id() {
        let config = minimal_config();
        std::env::set_var("TEST_ACME_KEY", "sk-acme-123");
        let keys = config.resolve_api_keys().expect("env var is set");
        std::env::remove_var("TEST_ACME_KEY");
        assert_eq!(keys.get("sk-acme-123"), Some(&AccountId(Uuid::parse_str("11111111-1111-1111-1111-111111111111").unwrap())));
    }

    #[test]
    fn resolve_api_keys_fails_when_env_var_unset() {
        let config = minimal_config();
        std::env::remove_var("TEST_ACME_KEY");
        assert!(config.resolve_api_keys().is_err());
    }
}
