use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Closed taxonomy of failure kinds. The numeric value doubles as the process
/// exit code, so `Success` must stay at zero and the order is load-bearing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ErrorCode {
    Success = 0,
    GeneralError = 1,
    LockTimeout = 2,
    StateCorruption = 3,
    ValidationFailed = 4,
    DependencyMissing = 5,
    PermissionDenied = 6,
    DiskFull = 7,
    NetworkError = 8,
    Timeout = 9,
    ResourceExhausted = 10,
    ConfigurationError = 11,
    DataIntegrity = 12,
    ServiceUnavailable = 13,
    AuthenticationError = 14,
    AuthorizationError = 15,
}

impl ErrorCode {
    pub fn all() -> &'static [ErrorCode] {
        &[
            ErrorCode::Success,
            ErrorCode::GeneralError,
            ErrorCode::LockTimeout,
            ErrorCode::StateCorruption,
            ErrorCode::ValidationFailed,
            ErrorCode::DependencyMissing,
            ErrorCode::PermissionDenied,
            ErrorCode::DiskFull,
            ErrorCode::NetworkError,
            ErrorCode::Timeout,
            ErrorCode::ResourceExhausted,
            ErrorCode::ConfigurationError,
            ErrorCode::DataIntegrity,
            ErrorCode::ServiceUnavailable,
            ErrorCode::AuthenticationError,
            ErrorCode::AuthorizationError,
        ]
    }

    pub const fn code(self) -> u8 {
        self as u8
    }

    pub const fn from_code(code: u8) -> Option<ErrorCode> {
        match code {
            0 => Some(ErrorCode::Success),
            1 => Some(ErrorCode::GeneralError),
            2 => Some(ErrorCode::LockTimeout),
            3 => Some(ErrorCode::StateCorruption),
            4 => Some(ErrorCode::ValidationFailed),
            5 => Some(ErrorCode::DependencyMissing),
            6 => Some(ErrorCode::PermissionDenied),
            7 => Some(ErrorCode::DiskFull),
            8 => Some(ErrorCode::NetworkError),
            9 => Some(ErrorCode::Timeout),
            10 => Some(ErrorCode::ResourceExhausted),
            11 => Some(ErrorCode::ConfigurationError),
            12 => Some(ErrorCode::DataIntegrity),
            13 => Some(ErrorCode::ServiceUnavailable),
            14 => Some(ErrorCode::AuthenticationError),
            15 => Some(ErrorCode::AuthorizationError),
            _ => None,
        }
    }

    /// Whether a failure of this kind is worth retrying. Transient,
    /// environment-level failures are; everything that requires a human or a
    /// code change is not.
    pub const fn retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::LockTimeout
                | ErrorCode::Timeout
                | ErrorCode::NetworkError
                | ErrorCode::ResourceExhausted
                | ErrorCode::ServiceUnavailable
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Success => "success",
            ErrorCode::GeneralError => "general_error",
            ErrorCode::LockTimeout => "lock_timeout",
            ErrorCode::StateCorruption => "state_corruption",
            ErrorCode::ValidationFailed => "validation_failed",
            ErrorCode::DependencyMissing => "dependency_missing",
            ErrorCode::PermissionDenied => "permission_denied",
            ErrorCode::DiskFull => "disk_full",
            ErrorCode::NetworkError => "network_error",
            ErrorCode::Timeout => "timeout",
            ErrorCode::ResourceExhausted => "resource_exhausted",
            ErrorCode::ConfigurationError => "configuration_error",
            ErrorCode::DataIntegrity => "data_integrity",
            ErrorCode::ServiceUnavailable => "service_unavailable",
            ErrorCode::AuthenticationError => "authentication_error",
            ErrorCode::AuthorizationError => "authorization_error",
        }
    }

    /// Actionable, kind-specific remediation text surfaced to the operator
    /// when local recovery was not possible.
    pub fn remediation(self) -> &'static str {
        match self {
            ErrorCode::Success => "no action required",
            ErrorCode::GeneralError => "re-run with RUST_LOG=debug for detail",
            ErrorCode::LockTimeout => {
                "another pipeline process may hold the lock; run 'pipeline locks reclaim-stale' and retry"
            }
            ErrorCode::StateCorruption => {
                "run 'pipeline recover' to restore the newest valid backup"
            }
            ErrorCode::ValidationFailed => {
                "the rejected document was not written; fix the named fields and retry"
            }
            ErrorCode::DependencyMissing => {
                "install the missing tool and make sure it is on PATH"
            }
            ErrorCode::PermissionDenied => {
                "check ownership and permissions of the .pipeline directory"
            }
            ErrorCode::DiskFull => {
                "free disk space; leftover temp files under .pipeline are safe to delete"
            }
            ErrorCode::NetworkError => "check connectivity; the operation is safe to retry",
            ErrorCode::Timeout => "the operation is safe to retry, possibly with a longer timeout",
            ErrorCode::ResourceExhausted => {
                "wait for concurrent pipeline processes to finish, then retry"
            }
            ErrorCode::ConfigurationError => {
                "check the STATE_FILE / LOCK_DIR / WORKTREE_BASE_DIR environment overrides"
            }
            ErrorCode::DataIntegrity => {
                "compare the state file against its backups with 'pipeline status'"
            }
            ErrorCode::ServiceUnavailable => "the upstream service is down; retry with backoff",
            ErrorCode::AuthenticationError => "refresh credentials for the upstream service",
            ErrorCode::AuthorizationError => {
                "run this command from inside the worktree assigned to the current phase and task"
            }
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry decision over a raw numeric code, e.g. the exit status of an
/// external step. Codes outside the known taxonomy are treated as retryable:
/// an unknown failure is assumed transient until classified.
pub const fn should_retry(code: u8) -> bool {
    match ErrorCode::from_code(code) {
        Some(known) => known.retryable(),
        None => true,
    }
}

// ---------------------------------------------------------------------------
// PipelineError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("timed out acquiring lock '{resource}' after {waited_ms}ms")]
    LockTimeout { resource: String, waited_ms: u64 },

    #[error("state file is corrupt: {0}")]
    StateCorruption(String),

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("schema version {found} is newer than this binary supports (current {current})")]
    UnsupportedSchema { found: u32, current: u32 },

    #[error("backup not found: {0}")]
    BackupNotFound(String),

    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("invalid worktree name '{0}': expected phase-<n>-task-<n>")]
    InvalidWorktreeName(String),

    #[error("invalid worktree status: {0}")]
    InvalidWorktreeStatus(String),

    #[error("worktree not found: {0}")]
    WorktreeNotFound(String),

    #[error("refusing to remove worktree '{name}' with status '{status}'")]
    WorktreeBusy { name: String, status: String },

    #[error("merging '{branch}' into '{target}' hit conflicts; merge aborted, target left clean")]
    MergeConflict { branch: String, target: String },

    #[error("isolation violation: expected to run inside worktree '{expected}', but current dir is {actual}")]
    IsolationViolation { expected: String, actual: String },

    #[error("{command} failed: {detail}")]
    Git { command: String, detail: String },

    #[error("required dependency missing: {0}")]
    DependencyMissing(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// Map onto the closed taxonomy. I/O errors classify by kind so that
    /// retry and recovery decisions see disk-full and permission failures for
    /// what they are.
    pub fn code(&self) -> ErrorCode {
        match self {
            PipelineError::LockTimeout { .. } => ErrorCode::LockTimeout,
            PipelineError::StateCorruption(_) => ErrorCode::StateCorruption,
            PipelineError::ValidationFailed(_)
            | PipelineError::UnsupportedSchema { .. }
            | PipelineError::InvalidWorktreeName(_)
            | PipelineError::InvalidWorktreeStatus(_) => ErrorCode::ValidationFailed,
            PipelineError::MergeConflict { .. } => ErrorCode::DataIntegrity,
            PipelineError::IsolationViolation { .. } => ErrorCode::AuthorizationError,
            PipelineError::DependencyMissing(_) => ErrorCode::DependencyMissing,
            PipelineError::Json(_) => ErrorCode::StateCorruption,
            PipelineError::Io(err) => match err.kind() {
                std::io::ErrorKind::PermissionDenied => ErrorCode::PermissionDenied,
                std::io::ErrorKind::StorageFull | std::io::ErrorKind::QuotaExceeded => {
                    ErrorCode::DiskFull
                }
                std::io::ErrorKind::TimedOut => ErrorCode::Timeout,
                std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::NotConnected => ErrorCode::NetworkError,
                _ => ErrorCode::GeneralError,
            },
            PipelineError::BackupNotFound(_)
            | PipelineError::CheckpointNotFound(_)
            | PipelineError::WorktreeNotFound(_)
            | PipelineError::WorktreeBusy { .. }
            | PipelineError::Git { .. } => ErrorCode::GeneralError,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
