//! Tunnel server SSH URL

use std::fmt;
use std::str::FromStr;

use reqwest::Url;

use crate::error::ProtocolError;

/// Default SSH port when the URL does not name one
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Parsed `ssh://[user@]host[:port]` URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshUrl {
    /// Host name or address
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Username embedded in the URL, if any
    pub username: Option<String>,
}

impl SshUrl {
    /// `host:port` form accepted by socket connectors
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl FromStr for SshUrl {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(s).map_err(|e| ProtocolError::InvalidSshUrl {
            url: s.to_string(),
            reason: e.to_string(),
        })?;

        if url.scheme() != "ssh" {
            return Err(ProtocolError::UnsupportedScheme(url.scheme().to_string()));
        }

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ProtocolError::InvalidSshUrl {
                url: s.to_string(),
                reason: "missing host".to_string(),
            })?
            .to_string();

        let username = Some(url.username())
            .filter(|u| !u.is_empty())
            .map(str::to_string);

        Ok(Self {
            host,
            port: url.port().unwrap_or(DEFAULT_SSH_PORT),
            username,
        })
    }
}

impl fmt::Display for SshUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.username {
            Some(user) => write!(f, "ssh://{}@{}:{}", user, self.host, self.port),
            None => write!(f, "ssh://{}:{}", self.host, self.port),
        }
    }
}
