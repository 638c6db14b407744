//! Connected-UDP channel: one socket `connect()`-ed to a single peer so
//! `send`/`recv` behave like a stream for the channel's purposes, even
//! though the underlying protocol is datagram-oriented.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;

use super::RelaySink;
use crate::channel::{Attachments, Channel, Packet};
use crate::config::DstClientConf;
use crate::error::{ProxyError, Result};

const MAX_DATAGRAM: usize = 65507;

pub struct UdpChannel {
    id: String,
    socket: Arc<UdpSocket>,
    attachments: Attachments,
}

impl UdpChannel {
    pub fn spawn(id: String, socket: UdpSocket, sink: Arc<dyn RelaySink>) -> Arc<Self> {
        let socket = Arc::new(socket);
        let channel = Arc::new(Self {
            id,
            socket: Arc::clone(&socket),
            attachments: Attachments::new(),
        });

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                match socket.recv(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let packet = Packet::text(buf[..n].to_vec());
                        if sink.on_message(packet).await.is_err() {
                            break;
                        }
                    }
                }
            }
            sink.on_close().await;
        });

        channel
    }
}

#[async_trait]
impl Channel for UdpChannel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn write(&self, packet: Packet) -> Result<()> {
        self.socket.send(&packet.data).await?;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        // UDP sockets have no shutdown handshake; dropping the last Arc
        // closes the fd. The read loop exits on its own next recv error.
        Ok(())
    }

    fn attachments(&self) -> &Attachments {
        &self.attachments
    }
}

/// An agent-side UDP "channel" for one remote address, sharing the
/// listener's single bound socket. Unlike `UdpChannel` it owns no reader
/// task of its own: the listener's demux loop in `service` reads every
/// datagram on the shared socket and dispatches to the right sink by
/// source address, since a connectionless listener can't give each client
/// its own `recv`.
pub struct UdpAgentChannel {
    id: String,
    socket: Arc<UdpSocket>,
    peer: std::net::SocketAddr,
    attachments: Attachments,
}

impl UdpAgentChannel {
    pub fn new(id: String, socket: Arc<UdpSocket>, peer: std::net::SocketAddr) -> Arc<Self> {
        Arc::new(Self { id, socket, peer, attachments: Attachments::new() })
    }
}

#[async_trait]
impl Channel for UdpAgentChannel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn write(&self, packet: Packet) -> Result<()> {
        self.socket.send_to(&packet.data, self.peer).await?;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    fn attachments(&self) -> &Attachments {
        &self.attachments
    }
}

pub(super) async fn dial(id: String, conf: &DstClientConf, sink: Arc<dyn RelaySink>) -> Result<crate::channel::DynChannel> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| ProxyError::DialFailure { upstream: id.clone(), reason: e.to_string() })?;
    socket
        .connect(format!("{}:{}", conf.ip, conf.port))
        .await
        .map_err(|e| ProxyError::DialFailure { upstream: id.clone(), reason: e.to_string() })?;
    Ok(UdpChannel::spawn(id, socket, sink))
}
