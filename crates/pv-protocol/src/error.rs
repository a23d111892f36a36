//! Protocol error types

use thiserror::Error;

/// Errors that can occur while encoding or decoding wire types
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// SSH URL could not be parsed
    #[error("Invalid SSH URL {url}: {reason}")]
    InvalidSshUrl { url: String, reason: String },

    /// SSH URL uses a scheme other than `ssh`
    #[error("Unsupported tunnel server scheme: {0}")]
    UnsupportedScheme(String),

    /// Remote forward address did not follow the `/<name>#access=<level>` form
    #[error("Invalid forward request: {0}")]
    InvalidForwardRequest(String),

    /// Unknown access level
    #[error("Unknown access level: {0}")]
    UnknownAccessLevel(String),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
