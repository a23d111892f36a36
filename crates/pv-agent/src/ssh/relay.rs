//! Byte relay between an SSH channel and a TCP stream

use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Copy bytes both ways until either side closes
pub(crate) async fn relay(mut channel: Channel<Msg>, stream: TcpStream, label: &str) {
    let (mut tcp_read, mut tcp_write) = stream.into_split();
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];

    loop {
        tokio::select! {
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => {
                    if let Err(e) = tcp_write.write_all(&data).await {
                        tracing::debug!("{}: write to socket failed: {}", label, e);
                        break;
                    }
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                    let _ = tcp_write.shutdown().await;
                    break;
                }
                Some(_) => {}
            },
            read = tcp_read.read(&mut buf) => match read {
                Ok(0) => {
                    let _ = channel.eof().await;
                    break;
                }
                Ok(n) => {
                    if let Err(e) = channel.data(&buf[..n]).await {
                        tracing::debug!("{}: write to channel failed: {}", label, e);
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!("{}: read from socket failed: {}", label, e);
                    break;
                }
            },
        }
    }

    let _ = channel.close().await;
    tracing::trace!("{}: relay finished", label);
}
