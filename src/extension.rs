//! Extension hook points an embedder can implement to observe channel
//! lifecycle events without reaching into the registry directly.
//!
//! Grounded on the listener-trait style of
//! `harborgrid-justin-rusty-db/src/websocket/connection.rs`'s connection
//! callbacks; hooks here are sync-in-spirit (spec.md §4.6: "must not
//! block") so the trait is plain `async_trait` but implementations are
//! expected to return quickly or spawn their own task.

use async_trait::async_trait;

use crate::channel::{ChannelPeer, DynChannel};

/// Hooks fired around channel and peer lifecycle. All methods have a
/// default no-op body so embedders only override what they need.
#[async_trait]
pub trait Extension: Send + Sync {
    async fn on_agent_channel_active(&self, _channel: &DynChannel) {}

    async fn on_agent_channel_inactive(&self, _channel: &DynChannel) {}

    async fn on_dst_channel_active(&self, _channel: &DynChannel) {}

    async fn on_dst_channel_inactive(&self, _channel: &DynChannel) {}

    /// Fired once a `ChannelPeer` has been constructed and indexed, before
    /// any data has been relayed. Implementations may mutate
    /// `peer.attachments` but must not replace `agent_channel`/`dst_channel`.
    async fn on_channel_peer_init(&self, _peer: &ChannelPeer) {}
}

/// The default extension: every hook is a no-op.
#[derive(Default)]
pub struct NoopExtension;

#[async_trait]
impl Extension for NoopExtension {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Attachments, Channel, Packet};
    use crate::error::Result;
    use std::sync::Arc;

    struct FakeChannel(&'static str, Attachments);

    #[async_trait]
    impl Channel for FakeChannel {
        fn id(&self) -> &str {
            self.0
        }

        async fn write(&self, _packet: Packet) -> Result<()> {
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            Ok(())
        }

        fn attachments(&self) -> &Attachments {
            &self.1
        }
    }

    #[tokio::test]
    async fn noop_extension_hooks_never_panic() {
        let ext = NoopExtension;
        let chan: DynChannel = Arc::new(FakeChannel("a1", Attachments::new()));
        ext.on_agent_channel_active(&chan).await;
        ext.on_agent_channel_inactive(&chan).await;
        ext.on_dst_channel_active(&chan).await;
        ext.on_dst_channel_inactive(&chan).await;
        let peer = ChannelPeer::new(
            Arc::new(FakeChannel("a1", Attachments::new())),
            Arc::new(FakeChannel("d1", Attachments::new())),
        );
        ext.on_channel_peer_init(&peer).await;
    }
}
