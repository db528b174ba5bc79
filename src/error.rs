//! Error types for the XMPP engine.
//!
//! Transport failures, negotiation failures and authentication failures are
//! fatal to the current connection. Timeouts are not, unless the request was a
//! liveness ping to the server (see `engine`).

use thiserror::Error;

/// Failures while securing the stream with STARTTLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TlsError {
    /// The server answered `<starttls/>` with `<failure/>`.
    #[error("Server response failure")]
    ServerFailure,
    /// The TLS handshake against the validation host failed.
    #[error("Cannot establish a TLS connection with the given validation host")]
    ValidationError,
    /// The server mandates TLS and the caller disabled it.
    #[error("The server requires TLS/SSL.")]
    TlsRequired,
}

/// SASL negotiation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SaslError {
    #[error("No supported SASL mechanism found")]
    NoSupportedMechanism,
    #[error("SASL mechanism {0} is not registered")]
    UnknownMechanism(String),
    #[error("SASL authentication failed: {0}")]
    Rejected(String),
    #[error("Malformed SASL challenge: {0}")]
    MalformedChallenge(String),
    #[error("Could not verify the server's signature")]
    ServerProofMismatch,
    #[error("Invalid SASL payload encoding: {0}")]
    Encoding(String),
}

/// Crate-wide error.
#[derive(Debug, Error)]
pub enum XmppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection went down (read/write failure, stream closed, dead peer).
    #[error("Disconnected: {0}")]
    Disconnected(String),

    #[error("TLS negotiation failed: {0}")]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Sasl(#[from] SaslError),

    /// A request did not get its reply in time.
    #[error("Request timed out")]
    Timeout,

    /// The server sent `<stream:error/>`.
    #[error("Stream error: {0}")]
    StreamError(String),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Invalid XML: {0}")]
    InvalidXml(String),

    /// Rejected at the call site before any network interaction.
    #[error("Invalid operation: {0}")]
    Misuse(String),

    #[error("The engine has been closed")]
    Closed,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl XmppError {
    /// True if the connection cannot be used anymore after this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, XmppError::Timeout | XmppError::Misuse(_))
    }

    /// Why pending requests are abandoned when this error ends a connection.
    pub fn disconnect_reason(&self) -> String {
        match self {
            XmppError::Disconnected(reason) => reason.clone(),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, XmppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_error_messages() {
        assert_eq!(TlsError::TlsRequired.to_string(), "The server requires TLS/SSL.");
        assert_eq!(TlsError::ServerFailure.to_string(), "Server response failure");
    }

    #[test]
    fn test_sasl_error_converts_transparently() {
        let err: XmppError = SaslError::ServerProofMismatch.into();
        assert_eq!(err.to_string(), "Could not verify the server's signature");
        assert!(err.is_fatal());
    }

    #[test]
    fn test_timeout_and_misuse_are_not_fatal() {
        assert!(!XmppError::Timeout.is_fatal());
        assert!(!XmppError::Misuse("x".into()).is_fatal());
        assert!(XmppError::Disconnected("x".into()).is_fatal());
    }

    #[test]
    fn test_disconnect_reason_is_not_wrapped_twice() {
        let err = XmppError::Disconnected("server closed the stream".into());
        assert_eq!(err.disconnect_reason(), "server closed the stream");
        let err = XmppError::StreamError("conflict".into());
        assert_eq!(err.disconnect_reason(), "Stream error: conflict");
    }
}
