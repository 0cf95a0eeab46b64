//! Crate-wide error type.
//!
//! Errors are partitioned along the four kinds the node loop (see
//! [`crate::node`]) needs to dispatch on: a peer-supplied artefact that fails
//! validation is rejected and logged, never crashes the process; transient
//! I/O is retried next iteration; state-machine errors ("already signed") are
//! idempotent no-ops; fatal errors abort the process with a distinct exit
//! code.

use std::collections::HashMap;
use thiserror::Error;

/// Result alias used pervasively across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The four error kinds from the error-handling design.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A proposed batch, signature, or PSBT failed a [`crate::validator`] check.
    Validation,
    /// An RPC call, socket, or database operation failed transiently.
    TransientIo,
    /// The action was already applied; the caller should treat it as success.
    StateMachine,
    /// Unrecoverable; the process should exit.
    Fatal,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("already applied: {0}")]
    AlreadyApplied(String),

    #[error("chain adapter error: {0}")]
    Chain(String),

    #[error("bitcoin adapter error: {0}")]
    Bitcoin(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("p2p error: {0}")]
    P2p(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("federator role lost")]
    RoleLost,

    #[error("startup check failed: {0}")]
    StartupCheck(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Classify the error into one of the four handling kinds, used by the
    /// node loop and the p2p message dispatcher to decide what to do next.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::AlreadyApplied(_) => ErrorKind::StateMachine,
            Error::Chain(_) | Error::Bitcoin(_) | Error::Store(_) | Error::P2p(_)
            | Error::Io(_) | Error::Json(_) | Error::Sqlite(_) | Error::Http(_)
            | Error::NotFound(_) => ErrorKind::TransientIo,
            Error::RoleLost | Error::StartupCheck(_) | Error::Crypto(_) | Error::Config(_)
            | Error::Internal(_) => ErrorKind::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::TransientIo)
    }
}

/// Exit codes the process uses when a fatal error aborts `main` (§6).
pub mod exit_code {
    pub const CLEAN_SHUTDOWN: i32 = 0;
    pub const BITCOIN_HEALTH_CHECK_FAILED: i32 = 1;
    pub const LOST_FEDERATOR_ROLE: i32 = 101;
    pub const NEVER_BECAME_FEDERATOR: i32 = 102;
}

/// Per-iteration error context attached to log lines; not a control flow
/// mechanism, just structured fields for `tracing`.
#[derive(Debug, Default, Clone)]
pub struct ErrorContext {
    pub fields: HashMap<String, String>,
}

impl ErrorContext {
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_not_retryable() {
        let err = Error::validation("bad signature");
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(!err.is_retryable());
    }

    #[test]
    fn transient_errors_are_retryable() {
        let err = Error::Chain("rpc timeout".into());
        assert!(err.is_retryable());
    }

    #[test]
    fn already_applied_is_state_machine_kind() {
        let err = Error::AlreadyApplied("sending signature from 0xabc".into());
        assert_eq!(err.kind(), ErrorKind::StateMachine);
        assert!(!err.is_retryable());
    }
}
