//! Cost optimization for agent tasks
//!
//! Three cooperating pieces decide how much a task may cost:
//!
//! - [`ModelSelector`] picks the cheapest model tier that can handle a task
//! - [`CostEstimator`] prices a call against the configured per-1k token rates
//! - [`BudgetEnforcer`] reserves and settles spend against a per-period limit
//!
//! [`CostOptimizer`] bundles them for the session layer.

mod budget;
mod estimator;
mod selector;

pub use budget::{
    Budget, BudgetEnforcer, BudgetError, BudgetPeriod, BudgetStatus, CommitOutcome, LedgerError,
    ReservationToken,
};
pub use estimator::{CostEstimate, CostEstimator};
pub use selector::{ModelSelector, SelectionError, SelectionPolicy};

use crate::cache::CacheManager;
use crate::config::Config;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Discrete model classes offered by the agent runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    /// Fast, cheap model for simple tasks
    Haiku,
    /// Balanced default model
    Sonnet,
    /// Sonnet with the 1M token context window
    SonnetExtended,
    /// Strongest and most expensive model
    Opus,
}

impl ModelTier {
    pub const ALL: [ModelTier; 4] = [
        ModelTier::Haiku,
        ModelTier::Sonnet,
        ModelTier::SonnetExtended,
        ModelTier::Opus,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::Haiku => "haiku",
            ModelTier::Sonnet => "sonnet",
            ModelTier::SonnetExtended => "sonnet_extended",
            ModelTier::Opus => "opus",
        }
    }

    /// The class of task this tier is trusted with
    pub fn capability(&self) -> CapabilityClass {
        match self {
            ModelTier::Haiku => CapabilityClass::Basic,
            ModelTier::Sonnet | ModelTier::SonnetExtended => CapabilityClass::Standard,
            ModelTier::Opus => CapabilityClass::Advanced,
        }
    }

    fn index(&self) -> usize {
        match self {
            ModelTier::Haiku => 0,
            ModelTier::Sonnet => 1,
            ModelTier::SonnetExtended => 2,
            ModelTier::Opus => 3,
        }
    }
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown model tier: {0}")]
pub struct ParseModelTierError(pub String);

impl FromStr for ModelTier {
    type Err = ParseModelTierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "haiku" => Ok(ModelTier::Haiku),
            "sonnet" => Ok(ModelTier::Sonnet),
            "sonnet_extended" | "sonnet-extended" | "sonnet[1m]" => Ok(ModelTier::SonnetExtended),
            "opus" => Ok(ModelTier::Opus),
            other => Err(ParseModelTierError(other.to_string())),
        }
    }
}

/// Capability classes, ordered from weakest to strongest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityClass {
    Basic,
    Standard,
    Advanced,
}

/// Per-tier pricing in USD per 1k tokens
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub price_in: f64,
    pub price_out: f64,
    pub max_context_tokens: u64,
}

impl ModelPricing {
    pub const fn new(price_in: f64, price_out: f64, max_context_tokens: u64) -> Self {
        Self {
            price_in,
            price_out,
            max_context_tokens,
        }
    }

    /// Combined input + output rate, used to rank tiers by cost
    pub fn blended(&self) -> f64 {
        self.price_in + self.price_out
    }
}

/// Pricing for every [`ModelTier`]
#[derive(Debug, Clone, PartialEq)]
pub struct PriceTable {
    prices: [ModelPricing; 4],
}

impl PriceTable {
    pub fn get(&self, tier: ModelTier) -> &ModelPricing {
        &self.prices[tier.index()]
    }

    pub fn set(&mut self, tier: ModelTier, pricing: ModelPricing) {
        self.prices[tier.index()] = pricing;
    }

    /// Default table with the given per-tier overrides applied
    pub fn with_overrides(
        overrides: &BTreeMap<String, ModelPricing>,
    ) -> Result<Self, ParseModelTierError> {
        let mut table = Self::default();
        for (name, pricing) in overrides {
            table.set(name.parse()?, *pricing);
        }
        Ok(table)
    }

    /// Tiers sorted cheapest first; ties keep declaration order
    pub fn by_ascending_cost(&self) -> Vec<ModelTier> {
        let mut tiers = ModelTier::ALL.to_vec();
        tiers.sort_by(|a, b| {
            self.get(*a)
                .blended()
                .partial_cmp(&self.get(*b).blended())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.cmp(b))
        });
        tiers
    }
}

impl Default for PriceTable {
    fn default() -> Self {
        Self {
            prices: [
                ModelPricing::new(0.00025, 0.00125, 200_000),
                ModelPricing::new(0.003, 0.015, 200_000),
                ModelPricing::new(0.006, 0.0225, 1_000_000),
                ModelPricing::new(0.015, 0.075, 200_000),
            ],
        }
    }
}

/// What the orchestrator knows about a task before running it
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TaskProfile {
    /// Complexity score in 0.0..=1.0
    pub complexity_score: f64,
    /// Tokens of context the task will send
    pub context_tokens: u64,
    /// Expected response size
    pub expected_output_tokens: u64,
}

/// Result of planning a task
#[derive(Debug, Clone, Serialize)]
pub struct ModelSelection {
    pub tier: ModelTier,
    pub estimate: CostEstimate,
    pub baseline: ModelTier,
    /// Positive when the selected tier is cheaper than the baseline
    pub savings_vs_baseline: f64,
}

/// Aggregate spend and savings for reporting
#[derive(Debug, Clone, Serialize)]
pub struct CostReport {
    pub budget: BudgetStatus,
    pub cache_savings: f64,
    pub cache_hit_rate: f64,
}

impl fmt::Display for CostReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Cost Report ===")?;
        writeln!(f, "Period: {}", self.budget.period_id)?;
        match self.budget.limit {
            Some(limit) => writeln!(f, "Limit: ${:.4}", limit)?,
            None => writeln!(f, "Limit: unlimited")?,
        }
        writeln!(f, "Spent: ${:.4}", self.budget.spent)?;
        writeln!(f, "Reserved: ${:.4}", self.budget.reserved)?;
        writeln!(f, "Cache hit rate: {:.1}%", self.cache_hit_rate * 100.0)?;
        writeln!(f, "Est. cache savings: ${:.4}", self.cache_savings)?;
        Ok(())
    }
}

/// Model selection, pricing and budget control behind one handle
pub struct CostOptimizer {
    selector: ModelSelector,
    estimator: CostEstimator,
    budget: Arc<BudgetEnforcer>,
    baseline: ModelTier,
}

impl CostOptimizer {
    pub fn new(prices: PriceTable, policy: SelectionPolicy, budget: Arc<BudgetEnforcer>) -> Self {
        Self {
            selector: ModelSelector::new(prices.clone(), policy),
            estimator: CostEstimator::new(prices),
            budget,
            baseline: ModelTier::Sonnet,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, crate::config::ConfigError> {
        let prices = config.price_table()?;
        let budget = Arc::new(BudgetEnforcer::from_settings(&config.budget));
        Ok(Self::new(prices, config.models.selection.clone(), budget))
    }

    pub fn selector(&self) -> &ModelSelector {
        &self.selector
    }

    pub fn estimator(&self) -> &CostEstimator {
        &self.estimator
    }

    pub fn budget(&self) -> &Arc<BudgetEnforcer> {
        &self.budget
    }

    /// Pick a tier for the task and price it
    pub fn plan(&self, task: &TaskProfile) -> Result<ModelSelection, SelectionError> {
        self.plan_excluding(task, &[])
    }

    /// Same as [`plan`](Self::plan), skipping tiers reported unavailable
    pub fn plan_excluding(
        &self,
        task: &TaskProfile,
        excluded: &[ModelTier],
    ) -> Result<ModelSelection, SelectionError> {
        let tier = self.selector.select_excluding(
            task.complexity_score,
            task.context_tokens,
            excluded,
        )?;
        let estimate =
            self.estimator
                .estimate(tier, task.context_tokens, task.expected_output_tokens);
        let savings_vs_baseline = self.estimator.savings_vs(
            tier,
            self.baseline,
            task.context_tokens,
            task.expected_output_tokens,
        );

        Ok(ModelSelection {
            tier,
            estimate,
            baseline: self.baseline,
            savings_vs_baseline,
        })
    }

    /// Current period spend combined with cache savings
    pub fn report(&self, cache: &CacheManager) -> CostReport {
        let summary = cache.summary();
        CostReport {
            budget: self.budget.status(&self.budget.current_period_id()),
            cache_savings: summary.estimated_savings,
            cache_hit_rate: summary.hit_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, CacheKey, CacheTier};

    #[test]
    fn test_model_tier_parse() {
        assert_eq!("haiku".parse::<ModelTier>(), Ok(ModelTier::Haiku));
        assert_eq!("sonnet[1m]".parse::<ModelTier>(), Ok(ModelTier::SonnetExtended));
        assert_eq!(" Opus ".parse::<ModelTier>(), Ok(ModelTier::Opus));
        assert!("gpt-4".parse::<ModelTier>().is_err());
    }

    #[test]
    fn test_default_prices_ascending() {
        let table = PriceTable::default();
        assert_eq!(
            table.by_ascending_cost(),
            vec![
                ModelTier::Haiku,
                ModelTier::Sonnet,
                ModelTier::SonnetExtended,
                ModelTier::Opus
            ]
        );
    }

    #[test]
    fn test_price_overrides() {
        let mut overrides = BTreeMap::new();
        overrides.insert("opus".to_string(), ModelPricing::new(0.0001, 0.0001, 200_000));
        let table = PriceTable::with_overrides(&overrides).unwrap();
        assert_eq!(table.by_ascending_cost()[0], ModelTier::Opus);

        overrides.insert("mystery".to_string(), ModelPricing::new(1.0, 1.0, 1));
        assert!(PriceTable::with_overrides(&overrides).is_err());
    }

    #[test]
    fn test_plan_reports_savings_for_cheap_tier() {
        let budget = Arc::new(BudgetEnforcer::new(BudgetPeriod::Session, Some(100.0)));
        let optimizer = CostOptimizer::new(PriceTable::default(), SelectionPolicy::default(), budget);

        let selection = optimizer
            .plan(&TaskProfile {
                complexity_score: 0.25,
                context_tokens: 10_000,
                expected_output_tokens: 2_000,
            })
            .unwrap();

        assert_eq!(selection.tier, ModelTier::Haiku);
        assert!(selection.savings_vs_baseline > 0.0);
        assert!(selection.estimate.estimated_cost < 100.0);
    }

    #[test]
    fn test_plan_excluding_unavailable_tier() {
        let budget = Arc::new(BudgetEnforcer::new(BudgetPeriod::Session, None));
        let optimizer = CostOptimizer::new(PriceTable::default(), SelectionPolicy::default(), budget);
        let task = TaskProfile {
            complexity_score: 0.1,
            context_tokens: 5_000,
            expected_output_tokens: 500,
        };

        let selection = optimizer.plan_excluding(&task, &[ModelTier::Haiku]).unwrap();
        assert_eq!(selection.tier, ModelTier::Sonnet);
        assert_eq!(selection.savings_vs_baseline, 0.0);
    }

    #[test]
    fn test_report_includes_cache_savings() {
        let budget = Arc::new(BudgetEnforcer::new(BudgetPeriod::Session, Some(10.0)));
        let optimizer =
            CostOptimizer::new(PriceTable::default(), SelectionPolicy::default(), budget.clone());
        let cache = CacheManager::new(CacheConfig::default(), optimizer.estimator().clone());

        let key = CacheKey::capability("which tools are installed");
        cache.set_with_cost(CacheTier::Capability, &key, b"[]".to_vec(), None, 0.5);
        assert!(cache.get(CacheTier::Capability, &key).is_some());

        let token = budget.reserve(&budget.current_period_id(), 2.0).unwrap();
        budget.commit(token, 1.5).unwrap();

        let report = optimizer.report(&cache);
        assert_eq!(report.cache_savings, 0.5);
        assert_eq!(report.budget.spent, 1.5);
        assert_eq!(report.cache_hit_rate, 1.0);
    }
}
