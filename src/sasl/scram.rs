//! SCRAM-SHA-1 (RFC 5802) and SCRAM-SHA-256 (RFC 7677), without channel binding.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::RngCore;

use super::crypto::{CryptoProvider, Sha1Provider, Sha256Provider};
use super::{attribute, parse_attributes, Credentials, SaslMechanism};
use crate::error::SaslError;

/// gs2 header for "client does not support channel binding", no authzid.
const GS2_HEADER: &str = "n,,";

enum Step {
    ClientFirst,
    ServerFirst { client_first_bare: String },
    ServerFinal { server_signature: Vec<u8> },
    Done,
    Failed,
}

pub struct Scram {
    name: &'static str,
    provider: Box<dyn CryptoProvider>,
    credentials: Credentials,
    client_nonce: String,
    step: Step,
}

/// `=` and `,` are reserved in SCRAM attribute values.
fn escape_username(name: &str) -> String {
    name.replace('=', "=3D").replace(',', "=2C")
}

fn xor(a: &[u8], b: &[u8]) -> Vec<u8> {
    a.iter().zip(b).map(|(x, y)| x ^ y).collect()
}

fn random_nonce() -> String {
    let mut raw = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut raw);
    STANDARD.encode(raw)
}

fn malformed(msg: &str) -> SaslError {
    SaslError::MalformedChallenge(msg.to_string())
}

impl Scram {
    pub fn sha1(credentials: Credentials) -> Self {
        Self::with_nonce("SCRAM-SHA-1", Box::new(Sha1Provider), credentials, random_nonce())
    }

    pub fn sha256(credentials: Credentials) -> Self {
        Self::with_nonce("SCRAM-SHA-256", Box::new(Sha256Provider), credentials, random_nonce())
    }

    pub(crate) fn with_nonce(
        name: &'static str,
        provider: Box<dyn CryptoProvider>,
        credentials: Credentials,
        client_nonce: String,
    ) -> Self {
        Self {
            name,
            provider,
            credentials,
            client_nonce,
            step: Step::ClientFirst,
        }
    }

    fn client_final(&self, client_first_bare: &str, server_first: &str) -> Result<(String, Vec<u8>), SaslError> {
        let attrs = parse_attributes(server_first);
        if let Some(err) = attribute(&attrs, "e") {
            return Err(SaslError::Rejected(err.to_string()));
        }
        let nonce = attribute(&attrs, "r").ok_or_else(|| malformed("missing nonce"))?;
        if !nonce.starts_with(&self.client_nonce) || nonce.len() == self.client_nonce.len() {
            return Err(malformed("server nonce does not extend the client nonce"));
        }
        let salt = attribute(&attrs, "s")
            .ok_or_else(|| malformed("missing salt"))
            .and_then(|s| STANDARD.decode(s).map_err(|e| SaslError::Encoding(e.to_string())))?;
        let iterations: u32 = attribute(&attrs, "i")
            .and_then(|i| i.parse().ok())
            .filter(|i| *i > 0)
            .ok_or_else(|| malformed("missing or invalid iteration count"))?;

        let p = &self.provider;
        let salted = p.derive_key(self.credentials.password.as_bytes(), &salt, iterations);
        let client_key = p.hmac(&salted, b"Client Key");
        let stored_key = p.hash(&client_key);
        let server_key = p.hmac(&salted, b"Server Key");

        let without_proof = format!("c={},r={}", STANDARD.encode(GS2_HEADER), nonce);
        let auth_message = format!("{},{},{}", client_first_bare, server_first, without_proof);
        let client_signature = p.hmac(&stored_key, auth_message.as_bytes());
        let proof = xor(&client_key, &client_signature);
        let server_signature = p.hmac(&server_key, auth_message.as_bytes());

        Ok((
            format!("{},p={}", without_proof, STANDARD.encode(proof)),
            server_signature,
        ))
    }
}

impl SaslMechanism for Scram {
    fn name(&self) -> &'static str {
        self.name
    }

    fn has_initial_response(&self) -> bool {
        true
    }

    fn next_token(&mut self, challenge: &[u8]) -> Result<Vec<u8>, SaslError> {
        let challenge = std::str::from_utf8(challenge)
            .map_err(|e| SaslError::Encoding(e.to_string()))?;

        match std::mem::replace(&mut self.step, Step::Failed) {
            Step::ClientFirst => {
                let bare = format!(
                    "n={},r={}",
                    escape_username(&self.credentials.username),
                    self.client_nonce
                );
                let token = format!("{}{}", GS2_HEADER, bare);
                self.step = Step::ServerFirst { client_first_bare: bare };
                Ok(token.into_bytes())
            }
            Step::ServerFirst { client_first_bare } => {
                let (token, server_signature) = self.client_final(&client_first_bare, challenge)?;
                self.step = Step::ServerFinal { server_signature };
                Ok(token.into_bytes())
            }
            Step::ServerFinal { server_signature } => {
                let attrs = parse_attributes(challenge);
                if let Some(err) = attribute(&attrs, "e") {
                    return Err(SaslError::Rejected(err.to_string()));
                }
                let verifier = attribute(&attrs, "v")
                    .ok_or_else(|| malformed("missing server signature"))
                    .and_then(|v| STANDARD.decode(v).map_err(|e| SaslError::Encoding(e.to_string())))?;
                if verifier != server_signature {
                    return Err(SaslError::ServerProofMismatch);
                }
                self.step = Step::Done;
                Ok(Vec::new())
            }
            Step::Done => {
                self.step = Step::Done;
                Ok(Vec::new())
            }
            Step::Failed => Err(SaslError::Rejected("exchange already failed".to_string())),
        }
    }

    fn is_complete(&self) -> bool {
        matches!(self.step, Step::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_pencil() -> Credentials {
        Credentials {
            username: "user".into(),
            password: "pencil".into(),
            host: "example.com".into(),
        }
    }

    fn run(mut mech: Scram, server_first: &str, expected_final: &str, server_final: &str) {
        let first = mech.next_token(b"").unwrap();
        assert!(String::from_utf8(first).unwrap().starts_with("n,,n=user,r="));
        let client_final = mech.next_token(server_first.as_bytes()).unwrap();
        assert_eq!(String::from_utf8(client_final).unwrap(), expected_final);
        assert!(!mech.is_complete());
        assert!(mech.next_token(server_final.as_bytes()).unwrap().is_empty());
        assert!(mech.is_complete());
    }

    #[test]
    fn test_scram_sha1_rfc5802() {
        let mech = Scram::with_nonce(
            "SCRAM-SHA-1",
            Box::new(Sha1Provider),
            user_pencil(),
            "fyko+d2lbbFgONRv9qkxdawL".into(),
        );
        run(
            mech,
            "r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,s=QSXCR+Q6sek8bf92,i=4096",
            "c=biws,r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,p=v0X8v3Bz2T0CJGbJQyF0X+HI4Ts=",
            "v=rmF9pqV8S7suAoZWja4dJRkFsKQ=",
        );
    }

    #[test]
    fn test_scram_sha256_rfc7677() {
        let mech = Scram::with_nonce(
            "SCRAM-SHA-256",
            Box::new(Sha256Provider),
            user_pencil(),
            "rOprNGfwEbeRWgbNEkqO".into(),
        );
        run(
            mech,
            "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096",
            "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ=",
            "v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=",
        );
    }

    #[test]
    fn test_bad_server_signature() {
        let mut mech = Scram::with_nonce(
            "SCRAM-SHA-1",
            Box::new(Sha1Provider),
            user_pencil(),
            "fyko+d2lbbFgONRv9qkxdawL".into(),
        );
        mech.next_token(b"").unwrap();
        mech.next_token(b"r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,s=QSXCR+Q6sek8bf92,i=4096")
            .unwrap();
        assert_eq!(
            mech.next_token(b"v=AAAAAAAAAAAAAAAAAAAAAAAAAAA="),
            Err(SaslError::ServerProofMismatch)
        );
        assert!(!mech.is_complete());
    }

    #[test]
    fn test_server_nonce_must_extend_client_nonce() {
        let mut mech = Scram::with_nonce("SCRAM-SHA-1", Box::new(Sha1Provider), user_pencil(), "abc".into());
        mech.next_token(b"").unwrap();
        assert!(matches!(
            mech.next_token(b"r=xyz123,s=QSXCR+Q6sek8bf92,i=4096"),
            Err(SaslError::MalformedChallenge(_))
        ));
    }

    #[test]
    fn test_username_escaping() {
        assert_eq!(escape_username("a=b,c"), "a=3Db=2Cc");
    }
}
