//! Cost estimation against the configured price table

use super::{ModelTier, PriceTable};
use serde::Serialize;
use std::sync::{Arc, OnceLock};
use tiktoken_rs::CoreBPE;
use tracing::warn;

/// Fixed prompt scaffolding sent with every spec analysis
const ANALYSIS_PROMPT_TOKENS: u64 = 2_000;
/// Extra input when project context accompanies the spec
const CONTEXT_OVERHEAD_TOKENS: u64 = 8_000;
/// Typical size of an analysis response
const ANALYSIS_OUTPUT_TOKENS: u64 = 1_500;

/// Priced estimate for a single model call
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CostEstimate {
    pub model_tier: ModelTier,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub estimated_cost: f64,
}

/// Prices model calls. Pure apart from the lazily loaded tokenizer.
#[derive(Clone)]
pub struct CostEstimator {
    prices: PriceTable,
    tokenizer: Arc<OnceLock<Option<CoreBPE>>>,
}

impl CostEstimator {
    pub fn new(prices: PriceTable) -> Self {
        Self {
            prices,
            tokenizer: Arc::new(OnceLock::new()),
        }
    }

    pub fn prices(&self) -> &PriceTable {
        &self.prices
    }

    /// `tokens_in/1000 * price_in + tokens_out/1000 * price_out`
    pub fn estimate(&self, tier: ModelTier, tokens_in: u64, tokens_out: u64) -> CostEstimate {
        let pricing = self.prices.get(tier);
        let input_cost = (tokens_in as f64 / 1000.0) * pricing.price_in;
        let output_cost = (tokens_out as f64 / 1000.0) * pricing.price_out;

        CostEstimate {
            model_tier: tier,
            tokens_in,
            tokens_out,
            estimated_cost: input_cost + output_cost,
        }
    }

    /// What running on `chosen` saves relative to `baseline`; negative if it costs more
    pub fn savings_vs(
        &self,
        chosen: ModelTier,
        baseline: ModelTier,
        tokens_in: u64,
        tokens_out: u64,
    ) -> f64 {
        self.estimate(baseline, tokens_in, tokens_out).estimated_cost
            - self.estimate(chosen, tokens_in, tokens_out).estimated_cost
    }

    /// Estimate a spec analysis call on the default analysis tier
    pub fn estimate_spec_analysis(&self, spec_text: &str, has_context: bool) -> CostEstimate {
        let mut tokens_in = self.count_tokens(spec_text) as u64 + ANALYSIS_PROMPT_TOKENS;
        if has_context {
            tokens_in += CONTEXT_OVERHEAD_TOKENS;
        }
        self.estimate(ModelTier::Sonnet, tokens_in, ANALYSIS_OUTPUT_TOKENS)
    }

    /// Token count using cl100k, or ~4 chars per token if the encoder is unavailable
    pub fn count_tokens(&self, text: &str) -> usize {
        let tokenizer = self.tokenizer.get_or_init(|| match tiktoken_rs::cl100k_base() {
            Ok(bpe) => Some(bpe),
            Err(e) => {
                warn!("Tokenizer unavailable, falling back to length heuristic: {}", e);
                None
            }
        });

        match tokenizer {
            Some(bpe) => bpe.encode_with_special_tokens(text).len(),
            None => text.len().div_ceil(4),
        }
    }
}

impl Default for CostEstimator {
    fn default() -> Self {
        Self::new(PriceTable::default())
    }
}

impl std::fmt::Debug for CostEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CostEstimator")
            .field("prices", &self.prices)
            .finish_non_exhaustive()
    }
}
