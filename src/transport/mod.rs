//! Concrete `Channel` implementations plus the dst-side dial entrypoint.
//!
//! Each transport owns its read loop and hands decoded `Packet`s to a
//! `RelaySink`, which is where the core's pairing/relay logic (in
//! `upstream::proxy`) actually lives. This mirrors the
//! reader-task-plus-sink split in
//! `other_examples/.../groblegark-coop__crates-mux-src-upstream-bridge.rs`'s
//! `WsBridge`, generalized to TCP and UDP as well as WebSocket.

pub mod tcp;
pub mod udp;
pub mod ws;

pub use tcp::TcpChannel;
pub use udp::{UdpAgentChannel, UdpChannel};
pub use ws::{WsAgentChannel, WsDstChannel};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::channel::{DynChannel, Packet};
use crate::config::{DstClientConf, Protocol};
use crate::error::{ProxyError, Result};

/// Receives decoded packets and the close notification off a transport's
/// read loop. Implementations live in `upstream::proxy` and relay into the
/// sibling channel found through the registry.
#[async_trait]
pub trait RelaySink: Send + Sync {
    async fn on_message(&self, packet: Packet) -> Result<()>;

    async fn on_close(&self);
}

/// The address a dst channel dials: shared by every connection to the same
/// destination, so it is never a valid registry id on its own.
pub fn dial_target(conf: &DstClientConf) -> String {
    match conf.protocol {
        Protocol::Ws => {
            let scheme = conf.scheme.as_deref().unwrap_or("ws");
            let path = conf.path.as_deref().unwrap_or("/");
            format!("{scheme}://{}:{}{path}", conf.ip, conf.port)
        }
        _ => format!("{}:{}", conf.ip, conf.port),
    }
}

static DST_CHANNEL_SEQ: AtomicU64 = AtomicU64::new(0);

/// Mint the registry id a freshly dialed dst channel will use, computed up
/// front so a caller can build the `RelaySink` that needs that id *before*
/// `dial` returns the channel (spec.md's stale-id-after-stop fix: capture
/// ids before any `stop()` call, never read them back off a channel that
/// may already be gone). Suffixed with a monotonic counter rather than
/// reusing `dial_target` verbatim: any upstream with fewer destinations
/// than concurrent clients dials the same destination more than once, and
/// two live dst channels can never share a registry key (I2).
pub fn next_dst_id(conf: &DstClientConf) -> String {
    let seq = DST_CHANNEL_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{}#{seq}", dial_target(conf))
}

/// Dial a dst channel for the given destination config under the given
/// (already-unique) id, wiring its read loop to `sink`. HTTP is rejected
/// here rather than at config load since it can still appear as a
/// programmatic `DstClientConf` even though no config key table entry can
/// select it (spec.md §9 Open Questions).
pub async fn dial(id: String, conf: &DstClientConf, sink: Arc<dyn RelaySink>) -> Result<DynChannel> {
    match conf.protocol {
        Protocol::Tcp => tcp::dial(id, conf, sink).await,
        Protocol::Udp => udp::dial(id, conf, sink).await,
        Protocol::Ws => ws::dial(id, conf, sink).await,
        Protocol::Http => Err(ProxyError::Config("network 'http' has no dst dial implementation".into())),
    }
}
