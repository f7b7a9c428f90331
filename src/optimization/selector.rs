//! Model tier selection by task complexity and context size

use super::{CapabilityClass, ModelTier, PriceTable};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectionError {
    #[error("context of {requested} tokens exceeds the largest available window ({largest})")]
    ContextTooLarge { requested: u64, largest: u64 },

    #[error("no model tier available (all excluded)")]
    NoTierAvailable,
}

/// Complexity thresholds for escalating to stronger tiers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionPolicy {
    /// Scores at or above this need at least a standard tier
    pub standard_threshold: f64,
    /// Scores at or above this need an advanced tier
    pub advanced_threshold: f64,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self {
            standard_threshold: 0.30,
            advanced_threshold: 0.85,
        }
    }
}

/// Picks the cheapest model tier able to handle a task
#[derive(Debug, Clone)]
pub struct ModelSelector {
    prices: PriceTable,
    policy: SelectionPolicy,
}

impl ModelSelector {
    pub fn new(prices: PriceTable, policy: SelectionPolicy) -> Self {
        Self { prices, policy }
    }

    pub fn policy(&self) -> &SelectionPolicy {
        &self.policy
    }

    pub fn required_capability(&self, complexity_score: f64) -> CapabilityClass {
        if complexity_score >= self.policy.advanced_threshold {
            CapabilityClass::Advanced
        } else if complexity_score >= self.policy.standard_threshold {
            CapabilityClass::Standard
        } else {
            CapabilityClass::Basic
        }
    }

    pub fn select(
        &self,
        complexity_score: f64,
        context_tokens: u64,
    ) -> Result<ModelTier, SelectionError> {
        self.select_excluding(complexity_score, context_tokens, &[])
    }

    /// Select while skipping tiers the caller found unavailable.
    ///
    /// A tier whose window cannot hold the context is never chosen. When
    /// only under-powered tiers fit, the most capable of them is forced,
    /// cheapest first among equals, so a higher score never gets a weaker
    /// tier.
    pub fn select_excluding(
        &self,
        complexity_score: f64,
        context_tokens: u64,
        excluded: &[ModelTier],
    ) -> Result<ModelTier, SelectionError> {
        let available: Vec<ModelTier> = self
            .prices
            .by_ascending_cost()
            .into_iter()
            .filter(|tier| !excluded.contains(tier))
            .collect();

        if available.is_empty() {
            return Err(SelectionError::NoTierAvailable);
        }

        let fitting: Vec<ModelTier> = available
            .iter()
            .copied()
            .filter(|tier| self.prices.get(*tier).max_context_tokens >= context_tokens)
            .collect();

        let Some(&cheapest_fit) = fitting.first() else {
            let largest = available
                .iter()
                .map(|tier| self.prices.get(*tier).max_context_tokens)
                .max()
                .unwrap_or(0);
            return Err(SelectionError::ContextTooLarge {
                requested: context_tokens,
                largest,
            });
        };

        let required = self.required_capability(complexity_score);
        match fitting.iter().find(|tier| tier.capability() >= required) {
            Some(&tier) => {
                debug!(
                    "Selected {} for complexity {:.2} ({} context tokens)",
                    tier, complexity_score, context_tokens
                );
                Ok(tier)
            }
            None => {
                // `fitting` is cheapest first, so ties keep the cheaper tier
                let strongest = fitting.iter().copied().fold(cheapest_fit, |best, tier| {
                    if tier.capability() > best.capability() {
                        tier
                    } else {
                        best
                    }
                });
                info!(
                    "Context of {} tokens forces {} despite {:?} requirement",
                    context_tokens, strongest, required
                );
                Ok(strongest)
            }
        }
    }
}

impl Default for ModelSelector {
    fn default() -> Self {
        Self::new(PriceTable::default(), SelectionPolicy::default())
    }
}
