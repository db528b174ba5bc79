//! PLAIN (RFC 4616): `authzid NUL authcid NUL passwd` in one message.

use super::{Credentials, SaslMechanism};
use crate::error::SaslError;

#[derive(Debug)]
pub struct Plain {
    credentials: Credentials,
    complete: bool,
}

impl Plain {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            complete: false,
        }
    }
}

impl SaslMechanism for Plain {
    fn name(&self) -> &'static str {
        "PLAIN"
    }

    fn has_initial_response(&self) -> bool {
        true
    }

    fn next_token(&mut self, _challenge: &[u8]) -> Result<Vec<u8>, SaslError> {
        if self.complete {
            return Ok(Vec::new());
        }
        let Credentials { username, password, .. } = &self.credentials;
        let mut token = Vec::with_capacity(username.len() + password.len() + 2);
        token.push(0);
        token.extend_from_slice(username.as_bytes());
        token.push(0);
        token.extend_from_slice(password.as_bytes());
        self.complete = true;
        Ok(token)
    }

    fn is_complete(&self) -> bool {
        self.complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_initial_response() {
        let mut plain = Plain::new(Credentials {
            username: "juliet".into(),
            password: "r0m30".into(),
            host: "capulet.lit".into(),
        });
        assert!(!plain.is_complete());
        assert_eq!(plain.next_token(b"").unwrap(), b"\0juliet\0r0m30");
        assert!(plain.is_complete());
        // A trailing empty success must not produce more data.
        assert!(plain.next_token(b"").unwrap().is_empty());
    }
}
