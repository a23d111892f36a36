//! russh client handler

use async_trait::async_trait;
use russh::client::{self, Msg};
use russh::Channel;
use russh_keys::key::PublicKey;
use tokio::net::TcpStream;

use super::close::CloseGuard;
use super::forwards::ForwardTable;
use super::known_hosts::HostKeyPolicy;
use super::relay::relay;

pub(crate) struct ClientHandler {
    host_keys: HostKeyPolicy,
    forwards: ForwardTable,
    /// Dropped together with the handler when the transport ends
    _close_guard: CloseGuard,
}

impl ClientHandler {
    pub(crate) fn new(host_keys: HostKeyPolicy, forwards: ForwardTable, close_guard: CloseGuard) -> Self {
        Self {
            host_keys,
            forwards,
            _close_guard: close_guard,
        }
    }
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint();
        if self.host_keys.accepts(server_public_key) {
            tracing::debug!("Server host key accepted: {}", fingerprint);
            Ok(true)
        } else {
            tracing::warn!("Server host key not in known keys: {}", fingerprint);
            Ok(false)
        }
    }

    /// Inbound connection on one of our remote forwards
    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        _connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let upstream = match self.forwards.get(connected_address) {
            Some(entry) => entry.value().clone(),
            None => {
                tracing::warn!("Forwarded connection for unknown tunnel {}", connected_address);
                let _ = channel.close().await;
                return Ok(());
            }
        };

        tracing::debug!(
            "Forwarded connection {} from {}:{} -> {}",
            connected_address,
            originator_address,
            originator_port,
            upstream
        );

        tokio::spawn(async move {
            match TcpStream::connect(&upstream).await {
                Ok(stream) => relay(channel, stream, &upstream).await,
                Err(e) => {
                    tracing::warn!("Failed to connect to {}: {}", upstream, e);
                    let _ = channel.close().await;
                }
            }
        });

        Ok(())
    }
}
