//! Pipeline error model and retry backoff policy helpers.

use std::time::Duration;

use tidewater_types::error::{BackoffClass, StageError};

// ---------------------------------------------------------------------------
// PipelineError: categorised errors for retry decisions
// ---------------------------------------------------------------------------

/// Categorized pipeline error.
///
/// `Stage` wraps a typed [`StageError`] with retry metadata. `Infrastructure`
/// wraps opaque host-side failures (state store, task join, I/O) that end
/// the run. `Cancelled` marks work abandoned cleanly because of shutdown.
#[derive(Debug)]
pub enum PipelineError {
    /// Typed stage error with retry metadata.
    Stage(StageError),
    /// Infrastructure error (state store, blocking task, file I/O).
    Infrastructure(anyhow::Error),
    /// Shutdown was requested before the work could complete.
    Cancelled,
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stage(e) => write!(f, "{e}"),
            Self::Infrastructure(e) => write!(f, "{e:#}"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<anyhow::Error> for PipelineError {
    fn from(e: anyhow::Error) -> Self {
        Self::Infrastructure(e)
    }
}

impl From<StageError> for PipelineError {
    fn from(e: StageError) -> Self {
        Self::Stage(e)
    }
}

impl From<crate::buffer::BufferError> for PipelineError {
    fn from(e: crate::buffer::BufferError) -> Self {
        Self::Infrastructure(anyhow::Error::new(e).context("Ingestion buffer failure"))
    }
}

impl From<crate::checkpoint::CheckpointError> for PipelineError {
    fn from(e: crate::checkpoint::CheckpointError) -> Self {
        Self::Infrastructure(anyhow::Error::new(e).context("Checkpoint store failure"))
    }
}

impl PipelineError {
    /// Wrap a state store failure.
    pub(crate) fn state(context: &'static str, err: tidewater_state::StateError) -> Self {
        Self::Infrastructure(anyhow::Error::new(err).context(context))
    }

    /// Wrap a `spawn_blocking` join failure.
    pub(crate) fn task(name: &str, err: &tokio::task::JoinError) -> Self {
        Self::Infrastructure(anyhow::anyhow!("{name} task panicked: {err}"))
    }

    /// Returns `true` if this is a typed stage error marked retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Stage(e) => e.retryable,
            Self::Infrastructure(_) | Self::Cancelled => false,
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns the typed stage error if this is a `Stage` variant.
    #[must_use]
    pub fn as_stage_error(&self) -> Option<&StageError> {
        match self {
            Self::Stage(e) => Some(e),
            Self::Infrastructure(_) | Self::Cancelled => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Exponential backoff curve: `base * 2^(attempt-1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based) at the normal class.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_from(self.base, attempt)
    }

    fn delay_from(&self, base: Duration, attempt: u32) -> Duration {
        let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        let delay = Duration::from_millis(base_ms.saturating_mul(factor));
        delay.min(self.max)
    }
}

/// Compute retry delay based on error hints and attempt number.
pub(crate) fn compute_backoff(policy: &BackoffPolicy, err: &StageError, attempt: u32) -> Duration {
    // An explicit hint from the failing stage wins.
    if let Some(ms) = err.retry_after_ms {
        return Duration::from_millis(ms).min(policy.max);
    }

    let base = match err.backoff_class {
        BackoffClass::Fast => (policy.base / 10).max(Duration::from_millis(1)),
        BackoffClass::Normal => policy.base,
        BackoffClass::Slow => policy.base.saturating_mul(5),
    };
    policy.delay_from(base, attempt)
}

/// Sleep for `delay` unless `cancel` fires first.
///
/// # Errors
///
/// Returns [`PipelineError::Cancelled`] if shutdown was requested.
pub(crate) async fn backoff_sleep(
    delay: Duration,
    cancel: &tokio_util::sync::CancellationToken,
) -> Result<(), PipelineError> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(PipelineError::Cancelled),
        () = tokio::time::sleep(delay) => Ok(()),
    }
}

/// `Duration` as whole milliseconds for log fields.
pub(crate) fn millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidewater_types::error::ErrorCategory;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_secs(60),
        }
    }

    // -----------------------------------------------------------------------
    // PipelineError tests
    // -----------------------------------------------------------------------

    #[test]
    fn test_pipeline_error_stage_is_retryable() {
        let err = PipelineError::Stage(StageError::write_unavailable("BUSY", "database is locked"));
        assert!(err.is_retryable());
        let se = err.as_stage_error().unwrap();
        assert_eq!(se.category, ErrorCategory::WriteUnavailable);
    }

    #[test]
    fn test_pipeline_error_stage_not_retryable() {
        let err = PipelineError::Stage(StageError::storage("STATE_DOWN", "disk gone"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_pipeline_error_infrastructure_not_retryable() {
        let err = PipelineError::Infrastructure(anyhow::anyhow!("state db vanished"));
        assert!(!err.is_retryable());
        assert!(err.as_stage_error().is_none());
        assert!(err.to_string().contains("state db vanished"));
    }

    #[test]
    fn test_pipeline_error_from_anyhow() {
        let pe: PipelineError = anyhow::anyhow!("something went wrong").into();
        assert!(matches!(pe, PipelineError::Infrastructure(_)));
    }

    #[test]
    fn test_cancelled_display() {
        assert!(PipelineError::Cancelled.is_cancelled());
        assert_eq!(PipelineError::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn test_state_error_keeps_context() {
        let err = PipelineError::state(
            "advance checkpoint",
            tidewater_state::StateError::LockPoisoned,
        );
        let msg = err.to_string();
        assert!(msg.contains("advance checkpoint"), "got: {msg}");
        assert!(msg.contains("lock poisoned"), "got: {msg}");
    }

    // -----------------------------------------------------------------------
    // compute_backoff tests
    // -----------------------------------------------------------------------

    #[test]
    fn test_backoff_normal_doubles() {
        let err = StageError::transient("X", "y");
        assert_eq!(compute_backoff(&policy(), &err, 1), Duration::from_millis(100));
        assert_eq!(compute_backoff(&policy(), &err, 2), Duration::from_millis(200));
        assert_eq!(compute_backoff(&policy(), &err, 4), Duration::from_millis(800));
    }

    #[test]
    fn test_backoff_fast_and_slow_classes() {
        let fast = StageError::capacity("FULL", "buffer full");
        assert_eq!(compute_backoff(&policy(), &fast, 1), Duration::from_millis(10));
        let mut slow = StageError::transient("X", "y");
        slow.backoff_class = BackoffClass::Slow;
        assert_eq!(compute_backoff(&policy(), &slow, 2), Duration::from_millis(1000));
    }

    #[test]
    fn test_backoff_caps_at_max() {
        let err = StageError::transient("X", "y");
        let capped = BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_millis(300),
        };
        assert_eq!(compute_backoff(&capped, &err, 10), Duration::from_millis(300));
        assert_eq!(compute_backoff(&capped, &err, 200), Duration::from_millis(300));
    }

    #[test]
    fn test_backoff_retry_after_overrides() {
        let err = StageError::transient("X", "y").with_retry_after(250);
        assert_eq!(compute_backoff(&policy(), &err, 5), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_backoff_sleep_observes_cancel() {
        let cancel = tokio_util::sync::CancellationToken::new();
        backoff_sleep(Duration::from_millis(1), &cancel).await.unwrap();
        cancel.cancel();
        let err = backoff_sleep(Duration::from_secs(3600), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_backoff_attempt_zero_treated_as_first() {
        let err = StageError::transient("X", "y");
        assert_eq!(compute_backoff(&policy(), &err, 0), Duration::from_millis(100));
    }
}
