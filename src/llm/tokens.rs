//! Token estimation and usage accounting.

use serde::{Deserialize, Serialize};

use super::ProviderAdapter;
use super::provider::ModelInfo;

/// Character-ratio token estimator with optional exact counting.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenEstimator {
    chars_per_token: f64,
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self { chars_per_token: 4.0 }
    }
}

impl TokenEstimator {
    #[must_use]
    pub fn new(chars_per_token: f64) -> Self {
        Self {
            chars_per_token: if chars_per_token > 0.0 { chars_per_token } else { 4.0 },
        }
    }

    /// `ceil(chars / chars_per_token)`. Counts Unicode scalar values.
    #[must_use]
    pub fn estimate(&self, text: &str) -> u64 {
        let chars = text.chars().count() as f64;
        (chars / self.chars_per_token).ceil() as u64
    }

    /// Count through the provider's endpoint, falling back to [`estimate`](Self::estimate)
    /// on any failure. Never errors.
    pub async fn exact_count(&self, adapter: &dyn ProviderAdapter, text: &str, model_id: &str) -> u64 {
        if !adapter.descriptor().capabilities.token_counting {
            return self.estimate(text);
        }
        match adapter.count_tokens(text, model_id).await {
            Ok(count) => count,
            Err(e) => {
                tracing::debug!(
                    provider = %adapter.descriptor().kind,
                    error = %e,
                    "Token count failed, using estimate"
                );
                self.estimate(text)
            }
        }
    }
}

/// Running totals for a project. Only ever grows until [`reset`](Self::reset).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub grounding_requests: u64,
    pub estimated_cost: f64,
}

impl TokenUsage {
    /// Add one generation's tokens and cost.
    pub fn record(&mut self, input: u64, output: u64, grounded: bool, model: &ModelInfo, grounding_fee: f64) {
        self.input += input;
        self.output += output;
        let mut cost = cost_of(input, model.input_per_million) + cost_of(output, model.output_per_million);
        if grounded {
            self.grounding_requests += 1;
            cost += grounding_fee.max(0.0);
        }
        self.estimated_cost += cost.max(0.0);
    }

    /// Clear totals on project switch.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    #[must_use]
    pub fn total_tokens(&self) -> u64 {
        self.input + self.output
    }
}

fn cost_of(tokens: u64, per_million: f64) -> f64 {
    tokens as f64 / 1_000_000.0 * per_million
}
