//! SASL authentication framework.
//!
//! Every mechanism implements [`SaslMechanism`], a step-wise
//! challenge/response contract. Mechanisms are looked up by name in a static
//! registry ordered strongest first, which is also the selection policy.

pub mod crypto;
pub mod digest_md5;
pub mod plain;
pub mod scram;

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::error::SaslError;

pub use digest_md5::DigestMd5;
pub use plain::Plain;
pub use scram::Scram;

/// One authentication attempt with a given mechanism.
pub trait SaslMechanism: Send {
    /// Registered name, as sent in `<auth mechanism='...'/>`.
    fn name(&self) -> &'static str;

    /// Whether the client speaks first (the `<auth/>` element carries data).
    fn has_initial_response(&self) -> bool;

    /// Produce the next client token from the server's last token.
    ///
    /// For mechanisms with an initial response, the first call is made with
    /// an empty challenge.
    fn next_token(&mut self, challenge: &[u8]) -> Result<Vec<u8>, SaslError>;

    /// True once the exchange has finished from the client's point of view,
    /// including verification of the server's proof where the mechanism has one.
    fn is_complete(&self) -> bool;
}

/// Credentials for one authentication attempt.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// Server domain, used by mechanisms that bind to the service (digest-uri).
    pub host: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("host", &self.host)
            .finish()
    }
}

type Factory = fn(Credentials) -> Box<dyn SaslMechanism>;

fn new_scram_sha256(c: Credentials) -> Box<dyn SaslMechanism> {
    Box::new(Scram::sha256(c))
}

fn new_scram_sha1(c: Credentials) -> Box<dyn SaslMechanism> {
    Box::new(Scram::sha1(c))
}

fn new_digest_md5(c: Credentials) -> Box<dyn SaslMechanism> {
    Box::new(DigestMd5::new(c))
}

fn new_plain(c: Credentials) -> Box<dyn SaslMechanism> {
    Box::new(Plain::new(c))
}

/// Supported mechanisms, strongest first.
const REGISTRY: &[(&str, Factory)] = &[
    ("SCRAM-SHA-256", new_scram_sha256),
    ("SCRAM-SHA-1", new_scram_sha1),
    ("DIGEST-MD5", new_digest_md5),
    ("PLAIN", new_plain),
];

/// Names of all supported mechanisms in priority order.
pub fn supported_mechanisms() -> impl Iterator<Item = &'static str> {
    REGISTRY.iter().map(|(name, _)| *name)
}

/// Pick the strongest supported mechanism among those the server advertised.
pub fn select_mechanism<'a, I>(advertised: I) -> Result<&'static str, SaslError>
where
    I: IntoIterator<Item = &'a str>,
{
    let advertised: Vec<&str> = advertised.into_iter().map(str::trim).collect();
    supported_mechanisms()
        .find(|name| advertised.iter().any(|a| a.eq_ignore_ascii_case(name)))
        .ok_or(SaslError::NoSupportedMechanism)
}

/// Instantiate a registered mechanism.
pub fn create(name: &str, credentials: Credentials) -> Result<Box<dyn SaslMechanism>, SaslError> {
    REGISTRY
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, factory)| factory(credentials))
        .ok_or_else(|| SaslError::UnknownMechanism(name.to_string()))
}

/// Base64 text content of `<auth/>` and `<response/>`. Empty data is sent as
/// an empty element.
pub fn encode_payload(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Decode the text content of `<challenge/>` and `<success/>`; `=` and blank
/// mean no data.
pub fn decode_payload(text: &str) -> Result<Vec<u8>, SaslError> {
    let text = text.trim();
    if text.is_empty() || text == "=" {
        return Ok(Vec::new());
    }
    STANDARD
        .decode(text)
        .map_err(|e| SaslError::Encoding(e.to_string()))
}

/// Split `k=v,k="v, quoted"` attribute lists used by DIGEST-MD5 and SCRAM.
pub(crate) fn parse_attributes(input: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut rest = input.trim();
    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else { break };
        let key = rest[..eq].trim().to_string();
        rest = &rest[eq + 1..];
        let value;
        if let Some(quoted) = rest.strip_prefix('"') {
            let end = quoted.find('"').unwrap_or(quoted.len());
            value = quoted[..end].to_string();
            rest = quoted.get(end + 1..).unwrap_or("");
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            value = rest[..end].trim().to_string();
            rest = &rest[end..];
        }
        rest = rest.trim_start_matches(|c: char| c == ',' || c.is_whitespace());
        out.push((key, value));
    }
    out
}

pub(crate) fn attribute<'a>(attrs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    attrs.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> Credentials {
        Credentials {
            username: "alice".into(),
            password: "secret".into(),
            host: "example.com".into(),
        }
    }

    #[test]
    fn test_select_prefers_strongest() {
        assert_eq!(select_mechanism(["PLAIN", "SCRAM-SHA-1", "DIGEST-MD5"]), Ok("SCRAM-SHA-1"));
        assert_eq!(
            select_mechanism(["PLAIN", "SCRAM-SHA-1", "SCRAM-SHA-256"]),
            Ok("SCRAM-SHA-256")
        );
        assert_eq!(select_mechanism(["PLAIN", "DIGEST-MD5"]), Ok("DIGEST-MD5"));
    }

    #[test]
    fn test_select_is_case_insensitive() {
        assert_eq!(select_mechanism(["plain", "x-oauth2"]), Ok("PLAIN"));
    }

    #[test]
    fn test_select_none_supported() {
        assert_eq!(
            select_mechanism(["X-OAUTH2", "EXTERNAL"]),
            Err(SaslError::NoSupportedMechanism)
        );
        assert_eq!(select_mechanism(std::iter::empty()), Err(SaslError::NoSupportedMechanism));
    }

    #[test]
    fn test_create_from_registry() {
        let mech = create("scram-sha-1", creds()).unwrap();
        assert_eq!(mech.name(), "SCRAM-SHA-1");
        assert!(mech.has_initial_response());
        assert!(matches!(create("GSSAPI", creds()), Err(SaslError::UnknownMechanism(_))));
    }

    #[test]
    fn test_payload_encoding() {
        assert_eq!(encode_payload(b""), "");
        assert_eq!(decode_payload("=").unwrap(), Vec::<u8>::new());
        assert_eq!(decode_payload(" AGFsaWNlAHNlY3JldA== ").unwrap(), b"\0alice\0secret");
        assert!(decode_payload("not base64!").is_err());
    }

    #[test]
    fn test_parse_attributes_quoted() {
        let attrs = parse_attributes(r#"realm="a,b",nonce="OA6MG9tEQGm2hh",qop="auth",algorithm=md5-sess"#);
        assert_eq!(attribute(&attrs, "realm"), Some("a,b"));
        assert_eq!(attribute(&attrs, "nonce"), Some("OA6MG9tEQGm2hh"));
        assert_eq!(attribute(&attrs, "algorithm"), Some("md5-sess"));
        assert_eq!(attribute(&attrs, "charset"), None);
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let out = format!("{:?}", creds());
        assert!(!out.contains("secret"));
    }
}
