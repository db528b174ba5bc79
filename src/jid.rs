//! XMPP addresses: `[node@]domain[/resource]`.

use std::fmt;
use std::str::FromStr;

use crate::error::XmppError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Jid {
    node: Option<String>,
    domain: String,
    resource: Option<String>,
}

impl Jid {
    pub fn new(node: Option<&str>, domain: &str, resource: Option<&str>) -> Result<Self, XmppError> {
        if domain.is_empty() {
            return Err(XmppError::Misuse("JID domain must not be empty".to_string()));
        }
        Ok(Self {
            node: node.filter(|n| !n.is_empty()).map(str::to_string),
            domain: domain.to_string(),
            resource: resource.filter(|r| !r.is_empty()).map(str::to_string),
        })
    }

    /// A server address with neither node nor resource.
    pub fn domain_only(domain: &str) -> Result<Self, XmppError> {
        Self::new(None, domain, None)
    }

    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// The address without its resource.
    pub fn bare(&self) -> Jid {
        Jid {
            resource: None,
            ..self.clone()
        }
    }

    /// True for addresses of the server itself (no node part).
    pub fn is_server(&self) -> bool {
        self.node.is_none()
    }
}

impl FromStr for Jid {
    type Err = XmppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        // The resource may itself contain '@' or '/', so split it off first.
        let (rest, resource) = match s.split_once('/') {
            Some((rest, res)) => (rest, Some(res)),
            None => (s, None),
        };
        let (node, domain) = match rest.split_once('@') {
            Some((node, domain)) => (Some(node), domain),
            None => (None, rest),
        };
        Jid::new(node, domain, resource)
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(node) = &self.node {
            write!(f, "{}@", node)?;
        }
        f.write_str(&self.domain)?;
        if let Some(resource) = &self.resource {
            write!(f, "/{}", resource)?;
        }
        Ok(())
    }
}
