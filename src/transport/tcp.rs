//! Raw TCP channel: one framing-free byte stream, opcode carried only in
//! the in-process `Packet` struct (spec.md §4.4: "opcode is preserved
//! end-to-end even across protocols that have no opcode of their own").

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use super::RelaySink;
use crate::channel::{Attachments, Channel, Packet};
use crate::config::DstClientConf;
use crate::error::{ProxyError, Result};

const READ_CHUNK: usize = 8192;

pub struct TcpChannel {
    id: String,
    writer: Mutex<OwnedWriteHalf>,
    attachments: Attachments,
}

impl TcpChannel {
    pub fn spawn(id: String, stream: TcpStream, sink: Arc<dyn RelaySink>) -> Arc<Self> {
        let (mut read_half, write_half) = stream.into_split();
        let channel = Arc::new(Self {
            id,
            writer: Mutex::new(write_half),
            attachments: Attachments::new(),
        });

        tokio::spawn(async move {
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                match read_half.read(&mut buf).await {
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
impl Channel for TcpChannel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn write(&self, packet: Packet) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(&packet.data).await?;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        Ok(())
    }

    fn attachments(&self) -> &Attachments {
        &self.attachments
    }
}

pub(super) async fn dial(id: String, conf: &DstClientConf, sink: Arc<dyn RelaySink>) -> Result<crate::channel::DynChannel> {
    let stream = TcpStream::connect(format!("{}:{}", conf.ip, conf.port))
        .await
        .map_err(|e| ProxyError::DialFailure { upstream: id.clone(), reason: e.to_string() })?;
    Ok(TcpChannel::spawn(id, stream, sink))
}
