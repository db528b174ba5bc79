use std::fmt;

/// Lifecycle of one engine connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    StreamNegotiating,
    TlsNegotiating,
    Authenticating,
    Bound,
    Ready,
    Failed,
}

impl ConnectionState {
    /// Forward paths of the negotiation, plus failure and close from anywhere.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (_, Failed) | (_, Disconnected) => true,
            (Disconnected, StreamNegotiating) | (Failed, StreamNegotiating) => true,
            (StreamNegotiating, TlsNegotiating) | (StreamNegotiating, Authenticating) => true,
            (TlsNegotiating, StreamNegotiating) => true,
            (Authenticating, Bound) | (Authenticating, Ready) => true,
            (Bound, Ready) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::StreamNegotiating => "stream_negotiating",
            ConnectionState::TlsNegotiating => "tls_negotiating",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Bound => "bound",
            ConnectionState::Ready => "ready",
            ConnectionState::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectionState::*;

    #[test]
    fn test_negotiation_path() {
        let path = [
            Disconnected,
            StreamNegotiating,
            TlsNegotiating,
            StreamNegotiating,
            Authenticating,
            Bound,
            Ready,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_no_backwards_jumps() {
        assert!(!Ready.can_transition_to(Authenticating));
        assert!(!Authenticating.can_transition_to(TlsNegotiating));
        assert!(!Disconnected.can_transition_to(Ready));
        assert!(!Bound.can_transition_to(StreamNegotiating));
    }

    #[test]
    fn test_failure_and_reconnect() {
        assert!(Ready.can_transition_to(Failed));
        assert!(Authenticating.can_transition_to(Disconnected));
        assert!(Failed.can_transition_to(StreamNegotiating));
    }
}
