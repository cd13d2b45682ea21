//! Exponential-backoff retry and code-specific error recovery.
//!
//! Retry decisions come from the error taxonomy: transient kinds back off
//! and try again, fatal kinds abort immediately. [`ErrorHandler`] is the
//! last line before surfacing a failure — it attempts a local recovery
//! strategy for the failing kind and otherwise degrades the pipeline or
//! hands back a remediation suggestion instead of terminating the caller.

use crate::config::Config;
use crate::error::{ErrorCode, PipelineError, Result};
use crate::lock::LockManager;
use crate::state::StateStore;
use std::time::Duration;

/// Maximum additive jitter per backoff sleep.
const BACKOFF_JITTER_MS: u64 = 100;

/// Bounded pause used by the wait-and-retry recovery strategy.
const RECOVERY_WAIT: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

/// Exponential delay for the given attempt (1-based), capped, with additive
/// jitter so contending processes spread out.
fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let shift = (attempt - 1).min(16);
    let exponential = policy.base_delay.saturating_mul(1u32 << shift);
    let capped = exponential.min(policy.max_delay);
    capped + Duration::from_millis(rand::random::<u64>() % (BACKOFF_JITTER_MS + 1))
}

/// Invoke `op` up to `policy.max_attempts` times. Retryable failures sleep
/// the backoff delay first; non-retryable failures abort immediately without
/// delay. The last error is returned when attempts run out.
pub fn retry_with_backoff<T, F>(policy: &RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) => {
                let code = err.code();
                if !code.retryable() || attempt >= policy.max_attempts {
                    return Err(err);
                }
                let delay = backoff_delay(policy, attempt);
                tracing::debug!(
                    attempt,
                    code = %code,
                    delay_ms = delay.as_millis() as u64,
                    "retrying after backoff"
                );
                std::thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ErrorHandler
// ---------------------------------------------------------------------------

/// Outcome of [`ErrorHandler::handle`].
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorDisposition {
    /// Local recovery succeeded; the caller may retry the operation.
    Recovered,
    /// The pipeline was flipped into degraded mode and can continue with the
    /// named features disabled.
    Degraded {
        reason: String,
        disabled_features: Vec<String>,
    },
    /// No recovery was possible; surface this suggestion to the operator.
    Remediate {
        code: ErrorCode,
        suggestion: &'static str,
    },
}

pub struct ErrorHandler {
    config: Config,
    locks: LockManager,
    store: StateStore,
}

impl ErrorHandler {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
            locks: LockManager::new(config),
            store: StateStore::new(config),
        }
    }

    /// Attempt a code-specific local recovery for a failure observed during
    /// `operation`. Recovery strategies by kind:
    ///
    /// - `LockTimeout` — reclaim stale locks.
    /// - `StateCorruption` / `DataIntegrity` — restore the newest valid
    ///   backup; if that fails, degrade instead of aborting.
    /// - `ResourceExhausted` / `DiskFull` — purge leftover temp files.
    /// - `Timeout` / `NetworkError` / `ServiceUnavailable` — bounded wait,
    ///   then let the caller retry.
    ///
    /// Everything else (or `auto_recover == false`) yields the kind-specific
    /// remediation suggestion.
    pub fn handle(
        &self,
        code: ErrorCode,
        message: &str,
        operation: &str,
        auto_recover: bool,
    ) -> Result<ErrorDisposition> {
        tracing::warn!(code = %code, operation, message, "handling pipeline error");
        if !auto_recover {
            return Ok(remediate(code));
        }

        match code {
            ErrorCode::LockTimeout => {
                let reclaimed = self.locks.reclaim_stale()?;
                if reclaimed > 0 {
                    tracing::debug!(reclaimed, "stale locks reclaimed");
                    return Ok(ErrorDisposition::Recovered);
                }
                Ok(remediate(code))
            }
            ErrorCode::StateCorruption | ErrorCode::DataIntegrity => {
                let had_backups = !crate::backup::list(&self.config)?.is_empty();
                match self.store.recover(None) {
                    Ok(_) if had_backups => Ok(ErrorDisposition::Recovered),
                    // Nothing to restore from (or recovery itself failed):
                    // keep the pipeline alive with the untrustworthy
                    // features switched off.
                    Ok(_) => self.degrade(operation, message),
                    Err(err) => {
                        tracing::warn!(error = %err, "recovery failed; entering degraded mode");
                        self.degrade(operation, message)
                    }
                }
            }
            ErrorCode::ResourceExhausted | ErrorCode::DiskFull => {
                let purged = self.purge_temp_files()?;
                if purged > 0 {
                    tracing::debug!(purged, "temp files purged");
                    return Ok(ErrorDisposition::Recovered);
                }
                Ok(remediate(code))
            }
            ErrorCode::Timeout | ErrorCode::NetworkError | ErrorCode::ServiceUnavailable => {
                std::thread::sleep(RECOVERY_WAIT);
                Ok(ErrorDisposition::Recovered)
            }
            _ => Ok(remediate(code)),
        }
    }

    fn degrade(&self, operation: &str, message: &str) -> Result<ErrorDisposition> {
        let reason = format!("{operation}: {message}");
        let disabled = vec!["checkpoint-restore".to_string()];
        self.store.enable_degraded_mode(&reason, &disabled)?;
        Ok(ErrorDisposition::Degraded {
            reason,
            disabled_features: disabled,
        })
    }

    /// Remove tempfile debris (`.tmp*`) left behind by interrupted atomic
    /// writes in the control directories.
    fn purge_temp_files(&self) -> Result<usize> {
        let mut dirs: Vec<&std::path::Path> =
            vec![&self.config.backup_dir, &self.config.checkpoint_dir];
        if let Some(parent) = self.config.state_file.parent() {
            dirs.push(parent);
        }

        let mut purged = 0;
        for dir in dirs {
            if !dir.exists() {
                continue;
            }
            for entry in std::fs::read_dir(dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with(".tmp") && entry.file_type()?.is_file() {
                    std::fs::remove_file(entry.path())?;
                    purged += 1;
                }
            }
        }
        Ok(purged)
    }
}

fn remediate(code: ErrorCode) -> ErrorDisposition {
    ErrorDisposition::Remediate {
        code,
        suggestion: code.remediation(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
