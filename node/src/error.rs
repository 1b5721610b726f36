use std::fmt;

/// Semantic category of a failure; decides the handling policy at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Network, rate-limit or mining hiccup. Retried with backoff.
    ChainTransient,
    /// Missing contract, bad configuration, nonce exhaustion. Never retried.
    ChainFatal,
    /// Persistence write or archive failure. Retried once.
    Storage,
    /// MPC aborted because of a participant.
    Protocol,
    /// Peer drop beyond what the protocol tolerates. Surfaces as `Protocol`.
    Transport,
    /// Local cryptographic failure.
    Crypto,
    Canceled,
    /// Event rejected by the deduplicator.
    Stale,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::ChainTransient => "chain_transient",
            ErrorKind::ChainFatal => "chain_fatal",
            ErrorKind::Storage => "storage",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Transport => "transport",
            ErrorKind::Crypto => "crypto",
            ErrorKind::Canceled => "canceled",
            ErrorKind::Stale => "stale",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum KeepError {
    #[error("chain request failed: {0}")]
    ChainTransient(String),
    #[error("chain failure: {0}")]
    ChainFatal(String),
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("protocol aborted: {0}")]
    Protocol(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("crypto failure: {0}")]
    Crypto(String),
    #[error("operation canceled")]
    Canceled,
    #[error("stale event: {0}")]
    Stale(String),
}

pub type KeepResult<T> = Result<T, KeepError>;

impl KeepError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            KeepError::ChainTransient(_) => ErrorKind::ChainTransient,
            KeepError::ChainFatal(_) => ErrorKind::ChainFatal,
            KeepError::Storage(_) => ErrorKind::Storage,
            KeepError::Protocol(_) => ErrorKind::Protocol,
            KeepError::Transport(_) => ErrorKind::Transport,
            KeepError::Crypto(_) => ErrorKind::Crypto,
            KeepError::Canceled => ErrorKind::Canceled,
            KeepError::Stale(_) => ErrorKind::Stale,
        }
    }

    /// Whether a generic retry loop may try the failed operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ChainTransient | ErrorKind::Storage | ErrorKind::Transport
        )
    }

    /// Canceled and stale outcomes are normal control flow and are never logged
    /// as errors.
    pub fn is_quiet(&self) -> bool {
        matches!(self.kind(), ErrorKind::Canceled | ErrorKind::Stale)
    }

    /// Transport failures inside an MPC run are reported as protocol failures.
    pub fn into_protocol(self) -> Self {
        match self {
            KeepError::Transport(msg) => KeepError::Protocol(format!("transport: {}", msg)),
            other => other,
        }
    }

    /// Prefixes the message with `context`, preserving the kind.
    pub fn context(self, context: impl fmt::Display) -> Self {
        let wrap = |msg: String| format!("{}: {}", context, msg);
        match self {
            KeepError::ChainTransient(msg) => KeepError::ChainTransient(wrap(msg)),
            KeepError::ChainFatal(msg) => KeepError::ChainFatal(wrap(msg)),
            KeepError::Storage(msg) => KeepError::Storage(wrap(msg)),
            KeepError::Protocol(msg) => KeepError::Protocol(wrap(msg)),
            KeepError::Transport(msg) => KeepError::Transport(wrap(msg)),
            KeepError::Crypto(msg) => KeepError::Crypto(wrap(msg)),
            KeepError::Stale(msg) => KeepError::Stale(wrap(msg)),
            KeepError::Canceled => KeepError::Canceled,
        }
    }

    pub fn storage(context: &str, err: impl fmt::Display) -> Self {
        KeepError::Storage(format!("{}: {}", context, err))
    }
}

/// Returns the `KeepError` carried by an `anyhow::Error`, if any.
pub fn as_keep_error(err: &anyhow::Error) -> Option<&KeepError> {
    err.downcast_ref::<KeepError>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_becomes_protocol() {
        let err = KeepError::Transport("peer 0xabcd dropped".to_string()).into_protocol();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert_eq!(
            err.to_string(),
            "protocol aborted: transport: peer 0xabcd dropped"
        );
        assert_eq!(KeepError::Canceled.into_protocol(), KeepError::Canceled);
    }

    #[test]
    fn test_context_preserves_kind() {
        let err = KeepError::ChainTransient("timeout".to_string()).context("get members");
        assert_eq!(err.kind(), ErrorKind::ChainTransient);
        assert_eq!(err.to_string(), "chain request failed: get members: timeout");
    }

    #[test]
    fn test_retry_and_quiet_classes() {
        assert!(KeepError::ChainTransient(String::new()).is_retryable());
        assert!(!KeepError::ChainFatal(String::new()).is_retryable());
        assert!(!KeepError::Crypto(String::new()).is_retryable());
        assert!(KeepError::Canceled.is_quiet());
        assert!(KeepError::Stale(String::new()).is_quiet());
        assert!(!KeepError::Protocol(String::new()).is_quiet());
    }

    #[test]
    fn test_downcast_through_anyhow() {
        let err: anyhow::Error = KeepError::Canceled.into();
        assert_eq!(as_keep_error(&err), Some(&KeepError::Canceled));
    }
}
