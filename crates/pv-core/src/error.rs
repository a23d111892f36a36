//! Core error types for preview environments

use std::fmt;
use std::path::PathBuf;

use pv_protocol::ProtocolError;
use thiserror::Error;

/// Top-level error type for the preview ecosystem
#[derive(Error, Debug)]
pub enum PvError {
    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Connection error
    #[error("Connection error: {0}")]
    Connect(#[from] ConnectError),

    /// Session error
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Provisioning error
    #[error("Provisioning error: {0}")]
    Provision(#[from] ProvisionError),

    /// Tunnel query error
    #[error("Tunnel query error: {0}")]
    TunnelQuery(#[from] TunnelQueryError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// SSH connection errors
#[derive(Error, Debug)]
pub enum ConnectError {
    /// TCP connect or SSH handshake failed
    #[error("Cannot reach {address}: {reason}")]
    Unreachable { address: String, reason: String },

    /// Connection attempt timed out
    #[error("Connection to {address} timed out")]
    Timeout { address: String },

    /// Public key authentication was rejected
    #[error("Authentication rejected for user '{username}'")]
    AuthRejected { username: String },

    /// Server host key is not among the known keys
    #[error("Host key verification failed: {message}")]
    HostKeyRejected { message: String },

    /// Private key material could not be decoded
    #[error("Invalid private key: {0}")]
    InvalidKey(String),
}

impl ConnectError {
    /// Whether another attempt could succeed.
    ///
    /// Machines refuse connections for a while after boot, so reachability
    /// failures are retried. Credential and host key failures are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConnectError::Unreachable { .. } | ConnectError::Timeout { .. }
        )
    }
}

/// Errors on an established SSH session
#[derive(Error, Debug)]
pub enum SessionError {
    /// Opening a channel failed
    #[error("Failed to open channel: {0}")]
    Channel(String),

    /// Running a command failed at the transport level
    #[error("Failed to execute '{command}': {reason}")]
    Exec { command: String, reason: String },

    /// Copying a file failed
    #[error("Failed to copy {path}: {reason}")]
    Transfer { path: String, reason: String },

    /// Requesting or cancelling a remote forward failed
    #[error("Forward {name} failed: {reason}")]
    Forward { name: String, reason: String },

    /// The tunnel server's hello reply was unusable
    #[error("Invalid hello response: {0}")]
    Hello(String),

    /// The session has been disposed or the transport is gone
    #[error("Session is closed")]
    Closed,

    /// A newer tunnel update was applied before this one got its turn
    #[error("Tunnel update {generation} superseded by update {latest}")]
    Superseded { generation: u64, latest: u64 },
}

impl SessionError {
    /// Whether the failure was a broken pipe on a long-running stream
    pub fn is_broken_pipe(&self) -> bool {
        let reason = match self {
            SessionError::Exec { reason, .. } | SessionError::Transfer { reason, .. } => reason,
            SessionError::Channel(reason) => reason,
            _ => return false,
        };
        let reason = reason.to_ascii_lowercase();
        reason.contains("broken pipe") || reason.contains("epipe")
    }
}

/// A customization script failed
#[derive(Error, Debug)]
pub enum ScriptError {
    /// Script exited non-zero
    #[error("Script {script} failed with exit code {exit_code}: {stderr}")]
    Failed {
        script: String,
        exit_code: u32,
        stderr: String,
    },

    /// Script could not be uploaded or started
    #[error("Script {script} could not run: {source}")]
    Session {
        script: String,
        #[source]
        source: SessionError,
    },
}

impl ScriptError {
    /// Name of the failing script
    pub fn script(&self) -> &str {
        match self {
            ScriptError::Failed { script, .. } | ScriptError::Session { script, .. } => script,
        }
    }
}

/// Machine driver errors
#[derive(Error, Debug)]
pub enum DriverError {
    /// Provider call failed
    #[error("{operation} failed: {reason}")]
    Failed {
        operation: &'static str,
        reason: String,
    },

    /// Driver does not implement this capability
    #[error("{0} is not supported by this driver")]
    Unsupported(&'static str),
}

impl DriverError {
    /// Convenience constructor for provider failures
    pub fn failed(operation: &'static str, reason: impl fmt::Display) -> Self {
        DriverError::Failed {
            operation,
            reason: reason.to_string(),
        }
    }
}

/// Key and profile store errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// Filesystem access failed
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Stored JSON could not be decoded
    #[error("Corrupt store entry {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Entry exists where none was expected
    #[error("Already exists: {0}")]
    Exists(PathBuf),

    /// Required entry is missing
    #[error("Not found: {0}")]
    NotFound(PathBuf),
}

/// Step of provisioning that was running when it failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionPhase {
    /// Looking up or creating the SSH key pair
    KeyResolution,
    /// Creating (or removing) the machine
    MachineCreation,
    /// Connecting over SSH
    Connect,
    /// Running customization scripts
    ScriptExecution,
    /// Driver bookkeeping after creation
    Finalize,
}

impl fmt::Display for ProvisionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisionPhase::KeyResolution => write!(f, "key resolution"),
            ProvisionPhase::MachineCreation => write!(f, "machine creation"),
            ProvisionPhase::Connect => write!(f, "connect"),
            ProvisionPhase::ScriptExecution => write!(f, "script execution"),
            ProvisionPhase::Finalize => write!(f, "finalize"),
        }
    }
}

/// Provisioning failed
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// Driver call failed
    #[error("{phase}: {source}")]
    Driver {
        phase: ProvisionPhase,
        #[source]
        source: DriverError,
    },

    /// Key store access failed
    #[error("key resolution: {0}")]
    KeyStore(#[from] StoreError),

    /// SSH connection could not be established
    #[error("connect: {0}")]
    Connect(#[from] ConnectError),

    /// A customization script failed
    #[error("script execution: {0}")]
    Script(#[from] ScriptError),
}

impl ProvisionError {
    /// Phase the failure happened in
    pub fn phase(&self) -> ProvisionPhase {
        match self {
            ProvisionError::Driver { phase, .. } => *phase,
            ProvisionError::KeyStore(_) => ProvisionPhase::KeyResolution,
            ProvisionError::Connect(_) => ProvisionPhase::Connect,
            ProvisionError::Script(_) => ProvisionPhase::ScriptExecution,
        }
    }

    /// Wrap a driver error with the phase it happened in, for `map_err`
    pub fn driver(phase: ProvisionPhase) -> impl FnOnce(DriverError) -> Self {
        move |source| ProvisionError::Driver { phase, source }
    }
}

/// Querying the agent for active tunnels failed
#[derive(Error, Debug)]
pub enum TunnelQueryError {
    /// Agent endpoint could not be reached
    #[error("Agent unreachable: {0}")]
    Unreachable(String),

    /// Agent answered with an error status
    #[error("Agent returned HTTP {status}: {body}")]
    BadStatus { status: u16, body: String },

    /// Agent reply could not be decoded
    #[error("Invalid agent response: {0}")]
    InvalidBody(String),

    /// Every attempt failed
    #[error("Gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<TunnelQueryError>,
    },
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// Config file could not be read or written
    #[error("Config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),
}
