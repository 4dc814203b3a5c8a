//! Per-request time budget. Optional phases drain gracefully when the
//! request is running out of time instead of blowing the route timeout.

use crate::config::BoardConfig;
use crate::models::BudgetDebug;
use std::time::Instant;

/// Optional work phases, in the order the assembly pipeline runs them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoardPhase {
    SparseRetry,
    ScopeFallback,
    Alerts,
    Supplement,
}

impl BoardPhase {
    pub fn skip_reason(&self) -> &'static str {
        match self {
            BoardPhase::SparseRetry => "sparse_retry_budget_skipped",
            BoardPhase::ScopeFallback => "scope_fallback_budget_skipped",
            BoardPhase::Alerts => "alerts_budget_skipped",
            BoardPhase::Supplement => "supplement_budget_skipped",
        }
    }
}

/// Wall-clock budget for one board request. The total is the route timeout
/// capped at the configured ceiling; once remaining time drops below the
/// low-water mark, every optional phase is refused and recorded.
pub struct RequestBudget {
    started: Instant,
    total_budget_ms: u64,
    low_budget_threshold_ms: u64,
    degraded_reasons: Vec<String>,
}

impl RequestBudget {
    pub fn new(route_timeout_ms: u64, config: &BoardConfig) -> Self {
        RequestBudget {
            started: Instant::now(),
            total_budget_ms: route_timeout_ms.min(config.total_budget_cap_ms),
            low_budget_threshold_ms: config.low_budget_threshold_ms,
            degraded_reasons: Vec::new(),
        }
    }

    pub fn remaining_ms(&self) -> u64 {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.total_budget_ms.saturating_sub(elapsed)
    }

    /// Strictly-below comparison: remaining == threshold still passes.
    pub fn is_low(&self, remaining_ms: u64) -> bool {
        remaining_ms < self.low_budget_threshold_ms
    }

    /// Whether `phase` may run. Refusals are recorded once per phase even
    /// when the same phase is asked about repeatedly.
    pub fn allow(&mut self, phase: BoardPhase) -> bool {
        let remaining = self.remaining_ms();
        if self.is_low(remaining) {
            self.record(phase.skip_reason());
            tracing::debug!(
                phase = ?phase,
                remaining_ms = remaining,
                "budget low, skipping optional phase"
            );
            return false;
        }
        true
    }

    /// Records a non-budget degradation, e.g. a realtime load failure the
    /// request survived.
    pub fn record_failure(&mut self, reason: &str) {
        self.record(reason);
    }

    fn record(&mut self, reason: &str) {
        if !self.degraded_reasons.iter().any(|r| r == reason) {
            self.degraded_reasons.push(reason.to_string());
        }
    }

    pub fn debug(&self) -> BudgetDebug {
        BudgetDebug {
            degraded_mode: !self.degraded_reasons.is_empty(),
            degraded_reasons: self.degraded_reasons.clone(),
            total_budget_ms: self.total_budget_ms,
            low_budget_threshold_ms: self.low_budget_threshold_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget_with_total(total_ms: u64) -> RequestBudget {
        RequestBudget::new(total_ms, &BoardConfig::default())
    }

    #[test]
    fn test_total_is_capped() {
        let budget = budget_with_total(30_000);
        assert_eq!(budget.debug().total_budget_ms, 5000);

        let budget = budget_with_total(2000);
        assert_eq!(budget.debug().total_budget_ms, 2000);
    }

    #[test]
    fn test_low_boundary_is_strict() {
        let budget = budget_with_total(5000);
        assert!(!budget.is_low(400));
        assert!(budget.is_low(399));
        assert!(!budget.is_low(401));
    }

    #[test]
    fn test_exhausted_budget_refuses_and_records_once() {
        let mut budget = budget_with_total(5000);
        budget.total_budget_ms = 0;

        assert!(!budget.allow(BoardPhase::Alerts));
        assert!(!budget.allow(BoardPhase::Alerts));
        assert!(!budget.allow(BoardPhase::Supplement));

        let debug = budget.debug();
        assert!(debug.degraded_mode);
        assert_eq!(
            debug.degraded_reasons,
            vec![
                "alerts_budget_skipped".to_string(),
                "supplement_budget_skipped".to_string()
            ]
        );
    }

    #[test]
    fn test_healthy_budget_allows_everything() {
        let mut budget = budget_with_total(5000);
        assert!(budget.allow(BoardPhase::SparseRetry));
        assert!(budget.allow(BoardPhase::Alerts));
        assert!(!budget.debug().degraded_mode);
    }

    #[test]
    fn test_failure_reasons_dedup() {
        let mut budget = budget_with_total(5000);
        budget.record_failure("rt_load_failed");
        budget.record_failure("rt_load_failed");
        assert_eq!(budget.debug().degraded_reasons.len(), 1);
    }
}
