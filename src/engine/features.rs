//! `<stream:features/>` as advertised after each stream (re)open.

use crate::xml::Element;

pub const NS_TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
pub const NS_SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
pub const NS_BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
pub const NS_SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartTls {
    pub required: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamFeatures {
    pub starttls: Option<StartTls>,
    pub mechanisms: Vec<String>,
    pub bind: bool,
    /// RFC 3921 session establishment that the server did not mark `<optional/>`.
    pub session_required: bool,
}

impl StreamFeatures {
    pub fn parse(features: &Element) -> Self {
        let starttls = features.child_ns("starttls", NS_TLS).map(|tls| StartTls {
            required: tls.child("required").is_some(),
        });
        let mechanisms = features
            .child_ns("mechanisms", NS_SASL)
            .map(|m| {
                m.children()
                    .filter(|c| c.local_name() == "mechanism")
                    .map(|c| c.text().trim().to_string())
                    .filter(|name| !name.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        let session_required = features
            .child_ns("session", NS_SESSION)
            .map_or(false, |s| s.child("optional").is_none());

        Self {
            starttls,
            mechanisms,
            bind: features.child_ns("bind", NS_BIND).is_some(),
            session_required,
        }
    }

    pub fn tls_required(&self) -> bool {
        self.starttls.map_or(false, |t| t.required)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starttls_required() {
        let el = Element::parse(
            "<stream:features><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls></stream:features>",
        )
        .unwrap();
        let features = StreamFeatures::parse(&el);
        assert!(features.tls_required());
        assert!(features.mechanisms.is_empty());
        assert!(!features.bind);
    }

    #[test]
    fn test_post_auth_features() {
        let el = Element::parse(
            "<stream:features><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/><session xmlns='urn:ietf:params:xml:ns:xmpp-session'><optional/></session></stream:features>",
        )
        .unwrap();
        let features = StreamFeatures::parse(&el);
        assert!(features.bind);
        assert!(!features.session_required);
        assert_eq!(features.starttls, None);
    }

    #[test]
    fn test_mechanism_list() {
        let el = Element::parse(
            "<stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>SCRAM-SHA-1</mechanism><mechanism> PLAIN </mechanism></mechanisms><session xmlns='urn:ietf:params:xml:ns:xmpp-session'/></stream:features>",
        )
        .unwrap();
        let features = StreamFeatures::parse(&el);
        assert_eq!(features.mechanisms, ["SCRAM-SHA-1", "PLAIN"]);
        assert!(features.session_required);
    }
}
