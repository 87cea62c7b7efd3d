//! Error types, cooperative cancellation and per-run diagnostics.
//!
//! Hard failures (cancellation, coordinate overflow, invalid config) are
//! surfaced through [`TreeSupportError`]. Recoverable geometric faults
//! (area-destroying unions, exhausted propagation, dropped tips) are
//! handled locally where they occur and only counted here, so a run never
//! aborts for a recoverable fault.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;

/// Errors that abort a tree support run.
#[derive(Debug, Error)]
pub enum TreeSupportError {
    /// The cancellation token was triggered; the pipeline unwound cleanly.
    #[error("tree support generation was cancelled")]
    Cancelled,

    /// A coordinate left the admissible ±2^30 scaled range.
    #[error("coordinate outside admissible range during {operation}")]
    CoordinateOverflow { operation: &'static str },

    /// The configuration cannot be used as given.
    #[error("invalid tree support configuration: {0}")]
    InvalidConfig(String),
}

/// Result alias for fallible pipeline operations.
pub type TreeSupportResult<T> = Result<T, TreeSupportError>;

/// Cooperative cancellation token polled at every stage suspension point.
///
/// Cloning is cheap; all clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. All subsequent polls will fail.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Poll the token, unwinding with [`TreeSupportError::Cancelled`].
    #[inline]
    pub fn check(&self) -> TreeSupportResult<()> {
        if self.is_cancelled() {
            Err(TreeSupportError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Per-run diagnostics context.
///
/// Throttles repeated user-facing warnings to the first occurrence per run
/// and counts recoverable geometric faults for post-run inspection.
#[derive(Debug, Default)]
pub struct DiagnosticsContext {
    critical_shown: AtomicBool,
    performance_shown: AtomicBool,
    lost_branches: AtomicUsize,
    destroyed_unions: AtomicUsize,
    dropped_tips: AtomicUsize,
    non_gracious_drops: AtomicUsize,
}

impl DiagnosticsContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a critical geometric fault. Returns true on the first
    /// occurrence of the run, so callers can escalate the log level once.
    pub fn report_critical(&self) -> bool {
        !self.critical_shown.swap(true, Ordering::Relaxed)
    }

    /// Record a performance-only fault. Returns true on first occurrence.
    pub fn report_performance(&self) -> bool {
        !self.performance_shown.swap(true, Ordering::Relaxed)
    }

    pub fn count_lost_branch(&self) {
        self.lost_branches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_destroyed_union(&self) {
        self.destroyed_unions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_dropped_tip(&self) {
        self.dropped_tips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_non_gracious_drop(&self) {
        self.non_gracious_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn lost_branches(&self) -> usize {
        self.lost_branches.load(Ordering::Relaxed)
    }

    pub fn destroyed_unions(&self) -> usize {
        self.destroyed_unions.load(Ordering::Relaxed)
    }

    pub fn dropped_tips(&self) -> usize {
        self.dropped_tips.load(Ordering::Relaxed)
    }

    pub fn non_gracious_drops(&self) -> usize {
        self.non_gracious_drops.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_propagates_to_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(token.check().is_ok());
        clone.cancel();
        assert!(matches!(token.check(), Err(TreeSupportError::Cancelled)));
    }

    #[test]
    fn diagnostics_first_occurrence_latch() {
        let diag = DiagnosticsContext::new();
        assert!(diag.report_critical());
        assert!(!diag.report_critical());
        assert!(diag.report_performance());
        assert!(!diag.report_performance());
    }

    #[test]
    fn diagnostics_counters() {
        let diag = DiagnosticsContext::new();
        diag.count_lost_branch();
        diag.count_lost_branch();
        diag.count_dropped_tip();
        assert_eq!(diag.lost_branches(), 2);
        assert_eq!(diag.dropped_tips(), 1);
        assert_eq!(diag.destroyed_unions(), 0);
    }
}
