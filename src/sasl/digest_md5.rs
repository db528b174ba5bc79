//! DIGEST-MD5 (RFC 2831), `qop=auth` only.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use md5::{Digest, Md5};
use rand::RngCore;

use super::{attribute, parse_attributes, Credentials, SaslMechanism};
use crate::error::SaslError;

const NONCE_COUNT: &str = "00000001";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    AwaitChallenge,
    AwaitRspauth,
    Done,
}

#[derive(Debug)]
pub struct DigestMd5 {
    credentials: Credentials,
    digest_uri: String,
    cnonce: String,
    expected_rspauth: Option<String>,
    step: Step,
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

impl DigestMd5 {
    pub fn new(credentials: Credentials) -> Self {
        let mut raw = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut raw);
        let digest_uri = format!("xmpp/{}", credentials.host);
        Self::with_params(credentials, digest_uri, STANDARD.encode(raw))
    }

    pub(crate) fn with_params(credentials: Credentials, digest_uri: String, cnonce: String) -> Self {
        Self {
            credentials,
            digest_uri,
            cnonce,
            expected_rspauth: None,
            step: Step::AwaitChallenge,
        }
    }

    /// HEX(KD(HEX(H(A1)), nonce:nc:cnonce:qop:HEX(H(A2))))
    fn response_value(&self, realm: &str, nonce: &str, a2_prefix: &str) -> String {
        let Credentials { username, password, .. } = &self.credentials;
        let secret = Md5::digest(format!("{}:{}:{}", username, realm, password));
        let mut a1 = secret.to_vec();
        a1.extend_from_slice(format!(":{}:{}", nonce, self.cnonce).as_bytes());
        let ha1 = hex(&Md5::digest(&a1));
        let ha2 = hex(&Md5::digest(format!("{}:{}", a2_prefix, self.digest_uri)));
        let kd = format!("{}:{}:{}:{}:auth:{}", ha1, nonce, NONCE_COUNT, self.cnonce, ha2);
        hex(&Md5::digest(kd))
    }

    fn answer_challenge(&mut self, challenge: &str) -> Result<Vec<u8>, SaslError> {
        let attrs = parse_attributes(challenge);
        let nonce = attribute(&attrs, "nonce")
            .ok_or_else(|| SaslError::MalformedChallenge("missing nonce".to_string()))?;
        if let Some(qop) = attribute(&attrs, "qop") {
            if !qop.split(',').any(|q| q.trim() == "auth") {
                return Err(SaslError::MalformedChallenge(format!("unsupported qop: {}", qop)));
            }
        }
        let realm = attribute(&attrs, "realm")
            .unwrap_or(&self.credentials.host)
            .to_string();

        let response = self.response_value(&realm, nonce, "AUTHENTICATE");
        self.expected_rspauth = Some(self.response_value(&realm, nonce, ""));

        let mut out = format!(
            "username={},realm={},nonce={},cnonce={},nc={},qop=auth,digest-uri={},response={}",
            quote(&self.credentials.username),
            quote(&realm),
            quote(nonce),
            quote(&self.cnonce),
            NONCE_COUNT,
            quote(&self.digest_uri),
            response
        );
        if attribute(&attrs, "charset") == Some("utf-8") {
            out.push_str(",charset=utf-8");
        }
        self.step = Step::AwaitRspauth;
        Ok(out.into_bytes())
    }

    fn verify_rspauth(&mut self, challenge: &str) -> Result<Vec<u8>, SaslError> {
        let attrs = parse_attributes(challenge);
        let rspauth = attribute(&attrs, "rspauth")
            .ok_or_else(|| SaslError::MalformedChallenge("missing rspauth".to_string()))?;
        if self.expected_rspauth.as_deref() != Some(rspauth) {
            return Err(SaslError::ServerProofMismatch);
        }
        self.step = Step::Done;
        Ok(Vec::new())
    }
}

impl SaslMechanism for DigestMd5 {
    fn name(&self) -> &'static str {
        "DIGEST-MD5"
    }

    fn has_initial_response(&self) -> bool {
        false
    }

    fn next_token(&mut self, challenge: &[u8]) -> Result<Vec<u8>, SaslError> {
        let challenge = std::str::from_utf8(challenge)
            .map_err(|e| SaslError::Encoding(e.to_string()))?;
        match self.step {
            Step::AwaitChallenge => self.answer_challenge(challenge),
            Step::AwaitRspauth => self.verify_rspauth(challenge),
            Step::Done => Ok(Vec::new()),
        }
    }

    fn is_complete(&self) -> bool {
        self.step == Step::Done
    }
}
