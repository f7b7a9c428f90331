//! Configuration management for session-optimizer
//!
//! Supports configuration via:
//! 1. Config file (~/.config/session-optimizer/config.toml)
//! 2. Environment variables (SESSION_OPTIMIZER_BUDGET, SESSION_OPTIMIZER_ACTIVE_TIER)
//! 3. CLI arguments (override file/env settings)

use crate::cache::{CacheConfig, CacheTier};
use crate::interceptor::InterceptorConfig;
use crate::metrics::MetricsSettings;
use crate::optimization::{
    BudgetPeriod, ModelPricing, ModelTier, ParseModelTierError, PriceTable, SelectionPolicy,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;
use tracing::warn;

pub const ENV_BUDGET: &str = "SESSION_OPTIMIZER_BUDGET";
pub const ENV_ACTIVE_TIER: &str = "SESSION_OPTIMIZER_ACTIVE_TIER";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Invalid model price table: {0}")]
    UnknownModelTier(#[from] ParseModelTierError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Model prices and selection thresholds
    pub models: ModelSettings,

    /// Spend limits
    pub budget: BudgetSettings,

    /// Cache tiers
    pub cache: CacheConfig,

    /// Collector fan-out
    pub interceptor: InterceptorConfig,

    /// Stream metrics
    pub metrics: MetricsSettings,
}

/// Model settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// Tier name -> pricing (USD per 1k tokens). Missing tiers keep their defaults.
    pub prices: BTreeMap<String, ModelPricing>,

    /// Complexity thresholds
    pub selection: SelectionPolicy,
}

impl Default for ModelSettings {
    fn default() -> Self {
        let defaults = PriceTable::default();
        Self {
            prices: ModelTier::ALL
                .iter()
                .map(|tier| (tier.as_str().to_string(), *defaults.get(*tier)))
                .collect(),
            selection: SelectionPolicy::default(),
        }
    }
}

/// Budget settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetSettings {
    /// USD per period; unlimited when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_per_period: Option<f64>,

    /// Period boundary (daily, weekly, monthly, session)
    pub period: BudgetPeriod,

    /// Reservations older than this can be reclaimed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation_ttl_secs: Option<u64>,

    /// Where period spend is kept between sessions; in-memory only when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ledger_path: Option<PathBuf>,
}

impl Default for BudgetSettings {
    fn default() -> Self {
        Self {
            limit_per_period: None,
            period: BudgetPeriod::Daily,
            reservation_ttl_secs: Some(3600),
            ledger_path: None,
        }
    }
}

impl Config {
    /// Get default config file path
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("session-optimizer")
            .join("config.toml")
    }

    /// Load config from default location
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Self::default_path())
    }

    /// Load config from specific path
    pub fn load_from(path: PathBuf) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default().with_env_overrides());
        }

        let content = std::fs::read_to_string(&path)?;
        let config: Config = toml::from_str(&content)?;

        Ok(config.with_env_overrides())
    }

    /// Apply environment variable overrides
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(value) = std::env::var(ENV_BUDGET) {
            let value = value.trim();
            if value.eq_ignore_ascii_case("unlimited") || value.eq_ignore_ascii_case("none") {
                self.budget.limit_per_period = None;
            } else {
                match value.parse::<f64>() {
                    Ok(limit) => self.budget.limit_per_period = Some(limit),
                    Err(_) => warn!("Ignoring {}={}: not a number", ENV_BUDGET, value),
                }
            }
        }

        if let Ok(value) = std::env::var(ENV_ACTIVE_TIER) {
            match value.parse::<ModelTier>() {
                Ok(tier) => self.metrics.active_tier = tier,
                Err(e) => warn!("Ignoring {}: {}", ENV_ACTIVE_TIER, e),
            }
        }

        self
    }

    /// Save config to default location
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(Self::default_path())
    }

    /// Save config to specific path
    pub fn save_to(&self, path: PathBuf) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, pricing) in &self.models.prices {
            name.parse::<ModelTier>()?;
            let valid_price = |p: f64| p.is_finite() && p >= 0.0;
            if !valid_price(pricing.price_in) || !valid_price(pricing.price_out) {
                return Err(ConfigError::Invalid(format!(
                    "prices for {} must be non-negative",
                    name
                )));
            }
            if pricing.max_context_tokens == 0 {
                return Err(ConfigError::Invalid(format!(
                    "max_context_tokens for {} must be greater than zero",
                    name
                )));
            }
        }

        let selection = &self.models.selection;
        if !(0.0..=1.0).contains(&selection.standard_threshold)
            || !(0.0..=1.0).contains(&selection.advanced_threshold)
            || selection.standard_threshold > selection.advanced_threshold
        {
            return Err(ConfigError::Invalid(
                "selection thresholds must satisfy 0 <= standard <= advanced <= 1".to_string(),
            ));
        }

        if let Some(limit) = self.budget.limit_per_period {
            if !limit.is_finite() || limit < 0.0 {
                return Err(ConfigError::Invalid(
                    "budget limit_per_period must be a non-negative amount".to_string(),
                ));
            }
        }

        self.cache.validate().map_err(ConfigError::Invalid)?;

        if self.interceptor.max_collectors == 0 || self.interceptor.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "interceptor max_collectors and queue_capacity must be greater than zero"
                    .to_string(),
            ));
        }

        Ok(())
    }

    /// Price table with the configured overrides applied
    pub fn price_table(&self) -> Result<PriceTable, ConfigError> {
        Ok(PriceTable::with_overrides(&self.models.prices)?)
    }

    /// Generate example config content
    pub fn example() -> String {
        let mut example = Config::default();
        example.budget.limit_per_period = Some(10.0);
        toml::to_string_pretty(&example).unwrap_or_default()
    }
}

/// Builder for creating Config programmatically
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn model_price(mut self, tier: ModelTier, pricing: ModelPricing) -> Self {
        self.config
            .models
            .prices
            .insert(tier.as_str().to_string(), pricing);
        self
    }

    pub fn selection_thresholds(mut self, standard: f64, advanced: f64) -> Self {
        self.config.models.selection = SelectionPolicy {
            standard_threshold: standard,
            advanced_threshold: advanced,
        };
        self
    }

    pub fn budget_limit(mut self, limit: f64) -> Self {
        self.config.budget.limit_per_period = Some(limit);
        self
    }

    pub fn budget_period(mut self, period: BudgetPeriod) -> Self {
        self.config.budget.period = period;
        self
    }

    pub fn cache_ttl(mut self, tier: CacheTier, secs: u64) -> Self {
        self.config
            .cache
            .ttl_overrides
            .insert(tier.as_str().to_string(), secs);
        self
    }

    pub fn max_collectors(mut self, max: usize) -> Self {
        self.config.interceptor.max_collectors = max;
        self
    }

    pub fn active_tier(mut self, tier: ModelTier) -> Self {
        self.config.metrics.active_tier = tier;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    // Tests that read or write the process environment
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.budget.limit_per_period, None);
        assert_eq!(config.budget.period, BudgetPeriod::Daily);
        assert_eq!(config.interceptor.max_collectors, 16);
        assert_eq!(config.metrics.recent_window, 50);
        assert_eq!(config.models.prices.len(), 4);
        assert!(config.validate().is_ok());
        assert_eq!(config.price_table().unwrap(), PriceTable::default());
    }

    #[test]
    fn test_config_builder() {
        let config = ConfigBuilder::new()
            .budget_limit(5.0)
            .budget_period(BudgetPeriod::Monthly)
            .model_price(ModelTier::Haiku, ModelPricing::new(0.001, 0.002, 100_000))
            .cache_ttl(CacheTier::Analysis, 600)
            .active_tier(ModelTier::Opus)
            .build();

        assert_eq!(config.budget.limit_per_period, Some(5.0));
        assert_eq!(config.budget.period, BudgetPeriod::Monthly);
        assert_eq!(config.metrics.active_tier, ModelTier::Opus);
        assert_eq!(
            config.cache.ttl_for(CacheTier::Analysis),
            Some(Duration::from_secs(600))
        );
        let prices = config.price_table().unwrap();
        assert_eq!(prices.get(ModelTier::Haiku).max_context_tokens, 100_000);
    }

    #[test]
    fn test_example_config() {
        let example = Config::example();
        assert!(example.contains("[budget]"));
        assert!(example.contains("[models.selection]"));
        assert!(example.contains("[interceptor]"));

        let parsed: Config = toml::from_str(&example).unwrap();
        assert_eq!(parsed.budget.limit_per_period, Some(10.0));
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [budget]
            limit_per_period = 2.5
            period = "weekly"
            ledger_path = "state/ledger.json"

            [models.prices.opus]
            price_in = 0.01
            price_out = 0.05
            max_context_tokens = 200000

            [cache.ttl_overrides]
            command = 3600
            "#,
        )
        .unwrap();

        assert_eq!(config.budget.limit_per_period, Some(2.5));
        assert_eq!(config.budget.period, BudgetPeriod::Weekly);
        assert_eq!(
            config.budget.ledger_path,
            Some(PathBuf::from("state/ledger.json"))
        );
        assert_eq!(config.budget.reservation_ttl_secs, Some(3600));
        assert_eq!(config.interceptor.queue_capacity, 4096);
        assert_eq!(config.price_table().unwrap().get(ModelTier::Opus).price_in, 0.01);
        assert_eq!(
            config.cache.ttl_for(CacheTier::Command),
            Some(Duration::from_secs(3600))
        );
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut unknown_tier = Config::default();
        unknown_tier
            .models
            .prices
            .insert("gpt".into(), ModelPricing::new(0.1, 0.1, 1000));
        assert!(matches!(
            unknown_tier.validate(),
            Err(ConfigError::UnknownModelTier(_))
        ));

        let thresholds = ConfigBuilder::new().selection_thresholds(0.9, 0.5).build();
        assert!(thresholds.validate().is_err());

        let negative = ConfigBuilder::new().budget_limit(-1.0).build();
        assert!(negative.validate().is_err());

        let no_collectors = ConfigBuilder::new().max_collectors(0).build();
        assert!(no_collectors.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let _env = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
        let config = ConfigBuilder::new().budget_limit(3.0).build();
        config.save_to(path.clone()).unwrap();

        let loaded = Config::load_from(path).unwrap();
        assert_eq!(loaded.budget.limit_per_period, Some(3.0));
    }

    #[test]
    fn test_env_overrides() {
        let _env = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
        std::env::set_var(ENV_BUDGET, "7.5");
        std::env::set_var(ENV_ACTIVE_TIER, "haiku");
        let config = Config::default().with_env_overrides();
        assert_eq!(config.budget.limit_per_period, Some(7.5));
        assert_eq!(config.metrics.active_tier, ModelTier::Haiku);

        std::env::set_var(ENV_BUDGET, "unlimited");
        std::env::set_var(ENV_ACTIVE_TIER, "gpt-4");
        let config = ConfigBuilder::new().budget_limit(1.0).build().with_env_overrides();
        assert_eq!(config.budget.limit_per_period, None);
        assert_eq!(config.metrics.active_tier, ModelTier::Sonnet);

        std::env::remove_var(ENV_BUDGET);
        std::env::remove_var(ENV_ACTIVE_TIER);
    }
}
