//! WebSocket channels, both sides.
//!
//! `WsDstChannel` dials out with `tokio-tungstenite` (the proxy is the
//! client here). `WsAgentChannel` wraps the `axum` `WebSocket` the listener
//! accepts from a browser/agent. Both relay through the same `RelaySink`
//! contract so `upstream::proxy` never has to know which side built the
//! channel.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message as AxumMessage, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::RelaySink;
use crate::channel::{Attachments, Channel, DynChannel, Packet};
use crate::config::DstClientConf;
use crate::error::{ProxyError, Result};

pub const OPCODE_TEXT: u16 = 1;
pub const OPCODE_BINARY: u16 = 2;

type DstSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, TungsteniteMessage>;
type DstStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

pub struct WsDstChannel {
    id: String,
    sink: Mutex<DstSink>,
    attachments: Attachments,
}

impl WsDstChannel {
    fn spawn_reader(mut stream: DstStream, sink: Arc<dyn RelaySink>) {
        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let packet = match msg {
                    Ok(TungsteniteMessage::Text(text)) => Packet::new(OPCODE_TEXT, text.as_bytes().to_vec()),
                    Ok(TungsteniteMessage::Binary(data)) => Packet::new(OPCODE_BINARY, data.to_vec()),
                    Ok(TungsteniteMessage::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                if sink.on_message(packet).await.is_err() {
                    break;
                }
            }
            sink.on_close().await;
        });
    }
}

#[async_trait]
impl Channel for WsDstChannel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn write(&self, packet: Packet) -> Result<()> {
        let message = if packet.opcode == OPCODE_BINARY {
            TungsteniteMessage::Binary(packet.data.into())
        } else {
            TungsteniteMessage::Text(String::from_utf8_lossy(&packet.data).into_owned().into())
        };
        let mut sink = self.sink.lock().await;
        sink.send(message).await.map_err(ProxyError::from)
    }

    async fn stop(&self) -> Result<()> {
        let mut sink = self.sink.lock().await;
        let _ = sink.send(TungsteniteMessage::Close(None)).await;
        Ok(())
    }

    fn attachments(&self) -> &Attachments {
        &self.attachments
    }
}

pub(super) async fn dial(id: String, conf: &DstClientConf, sink: Arc<dyn RelaySink>) -> Result<DynChannel> {
    let url = super::dial_target(conf);

    let (stream, _response) = tokio_tungstenite::connect_async(&url)
        .await
        .map_err(|e| ProxyError::DialFailure { upstream: id.clone(), reason: e.to_string() })?;

    let (write_half, read_half) = stream.split();
    let channel = Arc::new(WsDstChannel {
        id,
        sink: Mutex::new(write_half),
        attachments: Attachments::new(),
    });
    WsDstChannel::spawn_reader(read_half, sink);
    Ok(channel)
}

type AgentSink = SplitSink<WebSocket, AxumMessage>;
type AgentStream = SplitStream<WebSocket>;

pub struct WsAgentChannel {
    id: String,
    sink: Mutex<AgentSink>,
    attachments: Attachments,
}

impl WsAgentChannel {
    /// Split an accepted axum `WebSocket`, spawn its read loop, and return
    /// the writable channel half. `id` should already be unique (spec.md
    /// §3: agent channel ids are assigned by the listener, e.g. a UUID).
    pub fn spawn(id: String, socket: WebSocket, sink: Arc<dyn RelaySink>) -> Arc<Self> {
        let (write_half, read_half) = socket.split();
        let channel = Arc::new(Self {
            id,
            sink: Mutex::new(write_half),
            attachments: Attachments::new(),
        });
        Self::spawn_reader(read_half, sink);
        channel
    }

    fn spawn_reader(mut stream: AgentStream, sink: Arc<dyn RelaySink>) {
        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let packet = match msg {
                    Ok(AxumMessage::Text(text)) => Packet::new(OPCODE_TEXT, text.as_bytes().to_vec()),
                    Ok(AxumMessage::Binary(data)) => Packet::new(OPCODE_BINARY, data.to_vec()),
                    Ok(AxumMessage::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                if sink.on_message(packet).await.is_err() {
                    break;
                }
            }
            sink.on_close().await;
        });
    }
}

#[async_trait]
impl Channel for WsAgentChannel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn write(&self, packet: Packet) -> Result<()> {
        let message = if packet.opcode == OPCODE_BINARY {
            AxumMessage::Binary(packet.data.into())
        } else {
            AxumMessage::Text(String::from_utf8_lossy(&packet.data).into_owned().into())
        };
        let mut sink = self.sink.lock().await;
        sink.send(message).await.map_err(|e| ProxyError::Transport(e.to_string()))
    }

    async fn stop(&self) -> Result<()> {
        let mut sink = self.sink.lock().await;
        let _ = sink.send(AxumMessage::Close(None)).await;
        Ok(())
    }

    fn attachments(&self) -> &Attachments {
        &self.attachments
    }
}
