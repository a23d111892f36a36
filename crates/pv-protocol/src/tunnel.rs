//! Remote forward naming
//!
//! Every published (service, port) pair becomes one SSH remote forward. The
//! tunnel server does not bind a TCP port for it; instead the forward's bind
//! address carries a name and the requested access level:
//!
//! ```text
//! /<service>-<port>-<env id>#access=<public|private>
//! ```
//!
//! The server answers `hello` with a URL per bind address, and forwarded
//! channels arrive with the same bind address as `connected_address`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Who may reach a published tunnel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    /// Reachable by anyone holding the URL
    #[default]
    Public,
    /// Reachable only after authenticating with the tunnel server
    Private,
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessLevel::Public => write!(f, "public"),
            AccessLevel::Private => write!(f, "private"),
        }
    }
}

impl FromStr for AccessLevel {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "public" => Ok(AccessLevel::Public),
            "private" => Ok(AccessLevel::Private),
            other => Err(ProtocolError::UnknownAccessLevel(other.to_string())),
        }
    }
}

/// Build the tunnel name for a service port within an environment.
///
/// Names are lowercased and anything outside `[a-z0-9-]` becomes `-`, so the
/// result is safe to use as a DNS label prefix on the server side.
pub fn tunnel_name(service: &str, port: u16, env_id: &str) -> String {
    let raw = format!("{}-{}-{}", service, port, env_id);
    raw.chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// A single remote forward as requested from the tunnel server
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ForwardRequest {
    /// Tunnel name (see [`tunnel_name`])
    pub name: String,
    /// Requested access level
    pub access: AccessLevel,
}

impl ForwardRequest {
    /// Create a forward request
    pub fn new(name: impl Into<String>, access: AccessLevel) -> Self {
        Self {
            name: name.into(),
            access,
        }
    }

    /// Encode as the bind address sent in `tcpip-forward`
    pub fn bind_address(&self) -> String {
        format!("/{}#access={}", self.name, self.access)
    }

    /// Decode a bind address received from the server
    pub fn parse(bind_address: &str) -> Result<Self, ProtocolError> {
        let rest = bind_address
            .strip_prefix('/')
            .ok_or_else(|| ProtocolError::InvalidForwardRequest(bind_address.to_string()))?;

        let (name, access) = match rest.split_once('#') {
            Some((name, fragment)) => {
                let level = fragment
                    .strip_prefix("access=")
                    .ok_or_else(|| ProtocolError::InvalidForwardRequest(bind_address.to_string()))?;
                (name, level.parse()?)
            }
            None => (rest, AccessLevel::default()),
        };

        if name.is_empty() {
            return Err(ProtocolError::InvalidForwardRequest(bind_address.to_string()));
        }

        Ok(Self::new(name, access))
    }
}

impl fmt::Display for ForwardRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.bind_address())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunnel_name_sanitizes() {
        assert_eq!(tunnel_name("Web_App", 8080, "demo"), "web-app-8080-demo");
        assert_eq!(tunnel_name("api", 80, "feat/login"), "api-80-feat-login");
    }

    #[test]
    fn test_bind_address_parses_back() {
        let request = ForwardRequest::new("web-80-demo", AccessLevel::Private);
        assert_eq!(request.bind_address(), "/web-80-demo#access=private");
        assert_eq!(ForwardRequest::parse(&request.bind_address()).unwrap(), request);
    }

    #[test]
    fn test_parse_defaults_to_public() {
        let request = ForwardRequest::parse("/web-80-demo").unwrap();
        assert_eq!(request.access, AccessLevel::Public);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(ForwardRequest::parse("web-80-demo").is_err());
        assert!(ForwardRequest::parse("/").is_err());
        assert!(ForwardRequest::parse("/web#mode=x").is_err());
        assert!(ForwardRequest::parse("/web#access=secret").is_err());
    }

    #[test]
    fn test_access_level_from_str() {
        assert_eq!("PRIVATE".parse::<AccessLevel>().unwrap(), AccessLevel::Private);
        assert_eq!(" public ".parse::<AccessLevel>().unwrap(), AccessLevel::Public);
        assert!("internal".parse::<AccessLevel>().is_err());
    }
}
