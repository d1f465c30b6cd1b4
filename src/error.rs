//! The error type shared across the whole crate.

use std::io;

/// Errors produced by the connection, session, and execution layers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No cached access token, or it has expired; an external login step
    /// must populate `state/session.json` before this crate can proceed.
    #[error("not logged in: {0}")]
    NotAuthenticated(String),

    /// Could not connect to the kernel (handshake failure, timeout, etc).
    #[error("could not connect to the kernel: {0}")]
    KernelConnect(String),

    /// Disconnected while communicating with a kernel.
    #[error("disconnected from the kernel")]
    KernelDisconnect,

    /// The WebSocket dropped mid-execute. Carries the partial result
    /// (status=ABORT, output captured before the drop) so the caller can
    /// reconnect without re-submitting the same code.
    #[error("execution aborted by disconnect")]
    ExecutionAborted(Box<crate::kernel_client::ExecutionResult>),

    /// An execution was already in flight on this kernel.
    #[error("a call is already in progress on this kernel")]
    ExecutionInProgress,

    /// An invalid URL was provided or constructed.
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// HTTP transport failure from reqwest.
    #[error("HTTP failure: {0}")]
    Reqwest(#[from] reqwest::Error),

    /// Colab API or Jupyter proxy returned a structured error response.
    #[error(transparent)]
    ColabApi(#[from] crate::colab::api_client::ColabApiError),

    /// Could not (de)serialize a kernel wire message.
    #[error("could not deserialize message: {0}")]
    DeserializeMessage(String),

    /// The connection state machine reached FAILED and cannot proceed.
    #[error("connection unstable: {0}")]
    ConnectionFailed(String),

    /// A requested Session Record could not be resolved.
    #[error("{0}")]
    SessionNotFound(String),

    /// A session id prefix matched more than one record, or was too short.
    #[error("ambiguous session reference {0:?}: {1}")]
    AmbiguousSession(String, String),

    /// Creating a new session would exceed the account's concurrency tier cap.
    #[error("session limit reached ({current}/{max} for {tier} tier)")]
    SessionLimitExceeded {
        /// Sessions currently held.
        current: usize,
        /// Maximum permitted for the tier.
        max: usize,
        /// Human-readable tier name.
        tier: String,
    },

    /// Filesystem I/O failure reading or writing persisted state.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path being accessed when the error occurred.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Malformed JSON in a persisted state file.
    #[error("malformed JSON in {path}: {source}")]
    Json {
        /// Path being parsed when the error occurred.
        path: String,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// An unrecognized or unparsable `since` filter was supplied to `logs`.
    #[error("invalid `since` filter {0:?}: expected ISO-8601 or `<N>[smhd]`")]
    InvalidSinceFilter(String),

    /// Config file missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Wrap an I/O error with the path that produced it.
    pub fn io(path: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// Wrap a JSON error with the path that produced it.
    pub fn json(path: impl Into<String>, source: serde_json::Error) -> Self {
        Error::Json {
            path: path.into(),
            source,
        }
    }
}
