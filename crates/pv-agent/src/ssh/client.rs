//! SSH session to a machine or to the tunnel server

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::try_join_all;
use russh::client::{self, Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use pv_core::error::{ConnectError, SessionError};
use pv_core::retry::RetryPolicy;
use pv_core::shell;
use pv_core::traits::{ConnectTarget, RemoteSession, SessionConnector, TunnelSession};
use pv_core::types::{
    CommandOutput, ContainerService, FileToCopy, Tunnel, TunnelRequest, TunnelResult,
    TunnelTarget,
};
use pv_protocol::HelloResponse;

use super::close::CloseMonitor;
use super::forwards::{AppliedForwards, ForwardTable, Forwarder};
use super::handler::ClientHandler;
use super::known_hosts::HostKeyPolicy;
use super::relay::relay;

/// Command the tunnel server answers with the URL of every forward
const HELLO_COMMAND: &str = "hello";

/// Options shared by every connection attempt
#[derive(Debug, Clone)]
pub struct SshOptions {
    /// Host key verification
    pub host_keys: HostKeyPolicy,
    /// Environment id used to name tunnels
    pub env_id: String,
    /// Bound on TCP connect plus handshake
    pub connect_timeout: Duration,
    /// Keepalive interval, if any
    pub keepalive_interval: Option<Duration>,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            host_keys: HostKeyPolicy::AcceptAny,
            env_id: String::new(),
            connect_timeout: Duration::from_secs(30),
            keepalive_interval: Some(Duration::from_secs(30)),
        }
    }
}

/// One established SSH connection
///
/// Exclusively owned by one `up` invocation or one agent process. Closing
/// the transport without [`dispose`](SshSession::dispose) is reported as
/// [`SessionClosed::Unexpected`](super::SessionClosed::Unexpected) through
/// the [`CloseMonitor`].
pub struct SshSession {
    handle: Arc<Mutex<Handle<ClientHandler>>>,
    address: String,
    env_id: String,
    forwards: ForwardTable,
    /// Forwards currently held on the server. Locked for the whole of an
    /// update, including the hello query.
    applied: Mutex<AppliedForwards>,
    close: CloseMonitor,
    disposed: AtomicBool,
}

impl SshSession {
    /// Connect and authenticate once
    pub async fn connect(
        target: &ConnectTarget,
        options: &SshOptions,
    ) -> Result<Self, ConnectError> {
        let key = russh_keys::decode_secret_key(&target.private_key, None)
            .map_err(|e| ConnectError::InvalidKey(e.to_string()))?;

        let config = Arc::new(client::Config {
            keepalive_interval: options.keepalive_interval,
            ..Default::default()
        });

        let forwards: ForwardTable = Arc::new(DashMap::new());
        let (close, close_guard) = CloseMonitor::new();
        let handler = ClientHandler::new(
            options.host_keys.clone(),
            Arc::clone(&forwards),
            close_guard,
        );

        let address = target.address();
        tracing::debug!("Connecting to {}", address);

        let mut handle = tokio::time::timeout(
            options.connect_timeout,
            client::connect(config, (target.host.as_str(), target.port), handler),
        )
        .await
        .map_err(|_| ConnectError::Timeout {
            address: address.clone(),
        })?
        .map_err(|e| classify_connect_error(&address, e))?;

        tracing::debug!("Authenticating as user '{}'", target.username);
        let authenticated = handle
            .authenticate_publickey(&target.username, Arc::new(key))
            .await
            .map_err(|e| ConnectError::Unreachable {
                address: address.clone(),
                reason: format!("authentication error: {}", e),
            })?;

        if !authenticated {
            return Err(ConnectError::AuthRejected {
                username: target.username.clone(),
            });
        }

        tracing::info!("Connected to {} as {}", address, target.username);

        Ok(Self {
            handle: Arc::new(Mutex::new(handle)),
            address,
            env_id: options.env_id.clone(),
            forwards,
            applied: Mutex::new(AppliedForwards::default()),
            close,
            disposed: AtomicBool::new(false),
        })
    }

    /// Connect, retrying reachability failures under `policy`
    pub async fn connect_with_retry(
        target: &ConnectTarget,
        options: &SshOptions,
        policy: &RetryPolicy,
    ) -> Result<Self, ConnectError> {
        policy
            .retry_if(
                &format!("SSH connect to {}", target.address()),
                || Self::connect(target, options),
                ConnectError::is_retryable,
            )
            .await
            .map_err(|e| e.into_inner())
    }

    /// `host:port` this session is connected to
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Close notifications for this session
    pub fn close_monitor(&self) -> &CloseMonitor {
        &self.close
    }

    async fn open_session_channel(&self) -> Result<Channel<Msg>, SessionError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(SessionError::Closed);
        }
        let handle = self.handle.lock().await;
        if handle.is_closed() {
            return Err(SessionError::Closed);
        }
        handle
            .channel_open_session()
            .await
            .map_err(|e| SessionError::Channel(e.to_string()))
    }

    /// Run a command, optionally feeding `stdin` followed by EOF
    pub async fn exec_with_stdin(
        &self,
        command: &str,
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput, SessionError> {
        let exec_err = |reason: String| SessionError::Exec {
            command: command.to_string(),
            reason,
        };

        let mut channel = self.open_session_channel().await?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| exec_err(e.to_string()))?;

        if let Some(input) = stdin {
            channel
                .data(input)
                .await
                .map_err(|e| exec_err(format!("writing stdin: {}", e)))?;
            channel
                .eof()
                .await
                .map_err(|e| exec_err(format!("closing stdin: {}", e)))?;
        }

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                    stderr.extend_from_slice(data)
                }
                ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status),
                ChannelMsg::ExitSignal { signal_name, .. } => {
                    return Err(exec_err(format!("killed by signal {:?}", signal_name)));
                }
                ChannelMsg::Close => break,
                _ => {}
            }
        }

        let exit_code =
            exit_code.ok_or_else(|| exec_err("channel closed without exit status".to_string()))?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        })
    }

    async fn put_file(&self, file: &FileToCopy) -> Result<(), SessionError> {
        let transfer_err = |reason: String| SessionError::Transfer {
            path: file.remote.clone(),
            reason,
        };

        let content = tokio::fs::read(&file.local)
            .await
            .map_err(|e| transfer_err(format!("reading {}: {}", file.local.display(), e)))?;

        let command = match file.remote.rsplit_once('/') {
            Some((dir, _)) if !dir.is_empty() => format!(
                "mkdir -p {} && cat > {}",
                shell::quote(dir),
                shell::quote(&file.remote)
            ),
            _ => format!("cat > {}", shell::quote(&file.remote)),
        };

        let output = self
            .exec_with_stdin(&command, Some(&content))
            .await
            .map_err(|e| transfer_err(e.to_string()))?;

        if !output.success() {
            return Err(transfer_err(format!(
                "exit code {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }
        tracing::debug!("Copied {} -> {}", file.local.display(), file.remote);
        Ok(())
    }

    /// Listen on `127.0.0.1:0` and relay every accepted connection to
    /// `remote_host:remote_port` as seen from the server
    pub async fn forward_local(
        &self,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<LocalForward, SessionError> {
        let forward_err = |reason: String| SessionError::Forward {
            name: format!("{}:{}", remote_host, remote_port),
            reason,
        };

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| forward_err(e.to_string()))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| forward_err(e.to_string()))?;

        let cancel = CancellationToken::new();
        let handle = Arc::clone(&self.handle);
        let host = remote_host.to_string();
        let token = cancel.clone();

        tokio::spawn(async move {
            loop {
                let (stream, peer) = tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!("Local forward accept failed: {}", e);
                            break;
                        }
                    },
                };

                let channel = {
                    let handle = handle.lock().await;
                    handle
                        .channel_open_direct_tcpip(
                            host.as_str(),
                            u32::from(remote_port),
                            peer.ip().to_string(),
                            u32::from(peer.port()),
                        )
                        .await
                };

                match channel {
                    Ok(channel) => {
                        let label = format!("{}:{}", host, remote_port);
                        tokio::spawn(async move { relay(channel, stream, &label).await });
                    }
                    Err(e) => {
                        tracing::warn!(
                            "Failed to open channel to {}:{}: {}",
                            host,
                            remote_port,
                            e
                        );
                    }
                }
            }
        });

        tracing::debug!(
            "Forwarding {} -> {}:{} via {}",
            local_addr,
            remote_host,
            remote_port,
            self.address
        );

        Ok(LocalForward { local_addr, cancel })
    }

    /// Ask the tunnel server for the URL of every forward
    async fn hello(&self) -> Result<HelloResponse, SessionError> {
        let output = self.exec_with_stdin(HELLO_COMMAND, None).await?;
        if !output.success() {
            return Err(SessionError::Hello(format!(
                "exit code {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }
        serde_json::from_str(output.stdout.trim()).map_err(|e| SessionError::Hello(e.to_string()))
    }
}

/// Remote forwards through the session handle
struct HandleForwarder<'a>(&'a Mutex<Handle<ClientHandler>>);

#[async_trait]
impl Forwarder for HandleForwarder<'_> {
    async fn request(&self, bind: &str) -> Result<(), String> {
        let mut handle = self.0.lock().await;
        handle
            .tcpip_forward(bind, 0)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    async fn cancel(&self, bind: &str) -> Result<(), String> {
        let handle = self.0.lock().await;
        handle
            .cancel_tcpip_forward(bind, 0)
            .await
            .map_err(|e| e.to_string())
    }
}

/// Fold the server's URL map into one entry per service
fn tunnel_result(desired: &BTreeMap<String, TunnelTarget>, hello: HelloResponse) -> TunnelResult {
    let mut by_service: BTreeMap<&str, Tunnel> = BTreeMap::new();
    for (bind, target) in desired {
        let tunnel = by_service
            .entry(target.service.as_str())
            .or_insert_with(|| Tunnel {
                project: target.project.clone(),
                service: target.service.clone(),
                ports: BTreeMap::new(),
            });
        let urls = tunnel.ports.entry(target.port).or_default();
        if let Some(url) = hello.tunnels.get(bind) {
            urls.push(url.clone());
        }
    }
    TunnelResult {
        client_id: hello.client_id,
        tunnels: by_service.into_values().collect(),
    }
}

fn classify_connect_error(address: &str, e: anyhow::Error) -> ConnectError {
    if matches!(e.downcast_ref::<russh::Error>(), Some(russh::Error::UnknownKey)) {
        return ConnectError::HostKeyRejected {
            message: format!("{} presented a host key that is not known", address),
        };
    }
    ConnectError::Unreachable {
        address: address.to_string(),
        reason: e.to_string(),
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn exec_command(&self, command: &str) -> Result<CommandOutput, SessionError> {
        self.exec_with_stdin(command, None).await
    }

    async fn put_files(&self, files: &[FileToCopy]) -> Result<(), SessionError> {
        try_join_all(files.iter().map(|f| self.put_file(f))).await?;
        Ok(())
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.close.request_end();

        let handle = self.handle.lock().await;
        if let Err(e) = handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            tracing::debug!("Disconnect from {} failed: {}", self.address, e);
        }
        tracing::debug!("Session to {} disposed", self.address);
    }
}

#[async_trait]
impl TunnelSession for SshSession {
    async fn update_tunnels(
        &self,
        generation: u64,
        services: &[ContainerService],
    ) -> Result<TunnelResult, SessionError> {
        let desired = TunnelRequest::from_services(services).forwards(&self.env_id);

        let mut applied = self.applied.lock().await;
        applied.claim(generation)?;
        tracing::debug!(
            "Applying tunnel update {}: {} service ports",
            generation,
            desired.len()
        );
        applied
            .apply(&desired, &HandleForwarder(&self.handle), &self.forwards)
            .await?;
        tracing::debug!("{} tunnels held", applied.targets().len());

        let hello = self.hello().await?;
        Ok(tunnel_result(&desired, hello))
    }
}

/// A local listener relaying to a remote address; stops when dropped
pub struct LocalForward {
    local_addr: SocketAddr,
    cancel: CancellationToken,
}

impl LocalForward {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for LocalForward {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Opens [`SshSession`]s with fixed options
#[derive(Debug, Clone, Default)]
pub struct SshConnector {
    options: SshOptions,
}

impl SshConnector {
    pub fn new(options: SshOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl SessionConnector for SshConnector {
    type Session = SshSession;

    async fn connect(&self, target: &ConnectTarget) -> Result<SshSession, ConnectError> {
        SshSession::connect(target, &self.options).await
    }
}

/// SHA-256 fingerprint of the public half of an OpenSSH private key
pub fn public_key_fingerprint(private_key: &str) -> Option<String> {
    let key = russh_keys::decode_secret_key(private_key, None).ok()?;
    key.clone_public_key().ok().map(|public| public.fingerprint())
}
