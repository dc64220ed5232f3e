//! Token-count estimation.
//!
//! Estimates only need to be good enough to keep requests inside a per-minute budget.

use crate::types::ModelRequest;

pub trait TokenEstimator: Send + Sync {
    /// Best-effort token count, or `None` when the estimator cannot say.
    fn estimate(&self, request: &ModelRequest) -> Option<u64>;
}

impl<F> TokenEstimator for F
where
    F: Fn(&ModelRequest) -> Option<u64> + Send + Sync,
{
    fn estimate(&self, request: &ModelRequest) -> Option<u64> {
        self(request)
    }
}

/// Roughly four characters per token, plus a small per-message overhead for role markers.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicEstimator;

const CHARS_PER_TOKEN: u64 = 4;
const PER_MESSAGE_OVERHEAD: u64 = 4;

impl TokenEstimator for HeuristicEstimator {
    fn estimate(&self, request: &ModelRequest) -> Option<u64> {
        if request.messages.is_empty() {
            return None;
        }
        let tokens = request
            .messages
            .iter()
            .map(|m| (m.content.chars().count() as u64).div_ceil(CHARS_PER_TOKEN) + PER_MESSAGE_OVERHEAD)
            .sum();
        Some(tokens)
    }
}

/// Run the estimator, falling back to a quarter of the serialized request size.
pub fn estimate_or_fallback(estimator: &dyn TokenEstimator, request: &ModelRequest) -> u64 {
    estimator.estimate(request).unwrap_or_else(|| {
        let size = serde_json::to_vec(request).map(|v| v.len()).unwrap_or(0) as u64;
        size / CHARS_PER_TOKEN
    })
}
