//! `Upstream`: one routed backend group, its load balancer, and the
//! registry of channel pairs it owns.
//!
//! Grounded on `harborgrid-justin-rusty-db/src/networking/loadbalancer/mod.rs`'s
//! `LoadBalancerContext` (a config plus a selector plus the backends it
//! picks from), generalized to also own the channel pairing state
//! (spec.md §4.3).

pub mod proxy;

use std::sync::Arc;

use crate::channel::registry::ChannelRegistry;
use crate::channel::{ChannelPeer, DynChannel};
use crate::config::UpstreamConf;
use crate::error::Result;
use crate::extension::Extension;
use crate::loadbalance::{self, LoadBalancer};

pub struct Upstream {
    conf: UpstreamConf,
    registry: ChannelRegistry,
    load_balancer: Box<dyn LoadBalancer>,
    extension: Arc<dyn Extension>,
}

impl Upstream {
    pub fn new(conf: UpstreamConf, extension: Arc<dyn Extension>) -> Self {
        let load_balancer = loadbalance::build(conf.load_balance);
        Self {
            conf,
            registry: ChannelRegistry::new(),
            load_balancer,
            extension,
        }
    }

    pub fn conf(&self) -> &UpstreamConf {
        &self.conf
    }

    pub fn extension(&self) -> &Arc<dyn Extension> {
        &self.extension
    }

    pub fn load_balancer(&self) -> &dyn LoadBalancer {
        self.load_balancer.as_ref()
    }

    pub fn dst_channels(&self) -> Vec<DynChannel> {
        self.registry.dst_values()
    }

    pub fn channel_peer_count(&self) -> usize {
        self.registry.peer_count()
    }

    pub fn get_channel_peer_by_agent(&self, agent_id: &str) -> Option<Arc<ChannelPeer>> {
        self.registry.get_peer_by_agent(agent_id)
    }

    pub fn get_channel_peer_by_dst(&self, dst_id: &str) -> Option<Arc<ChannelPeer>> {
        self.registry.get_peer_by_dst(dst_id)
    }

    pub fn query_dst_channel(&self, agent_id: &str) -> Option<DynChannel> {
        self.registry.get_peer_by_agent(agent_id).map(|p| Arc::clone(&p.dst_channel))
    }

    pub fn query_agent_channel(&self, dst_id: &str) -> Option<DynChannel> {
        self.registry.get_peer_by_dst(dst_id).map(|p| Arc::clone(&p.agent_channel))
    }

    /// Register an already-constructed peer. Callers (`upstream::proxy`)
    /// are responsible for firing `on_channel_peer_init` before this, since
    /// the hook must run before any message can be relayed.
    pub fn init_channel_peer(&self, peer: Arc<ChannelPeer>) -> Result<Arc<ChannelPeer>> {
        self.registry.put_dst(Arc::clone(&peer.dst_channel));
        self.registry.put_peer(Arc::clone(&peer))?;
        Ok(peer)
    }

    /// Tear down the pair reachable from `agent_id`, if still present.
    /// Idempotent: a second call after the pair is gone is a no-op, which
    /// is what lets both sides' close paths call this without racing.
    pub async fn release_on_agent_channel(&self, agent_id: &str) {
        if let Some(peer) = self.registry.remove_peer_by_agent(agent_id) {
            self.teardown_peer(peer).await;
        }
    }

    pub async fn release_on_dst_channel(&self, dst_id: &str) {
        if let Some(peer) = self.registry.remove_peer_by_dst(dst_id) {
            self.teardown_peer(peer).await;
        }
    }

    async fn teardown_peer(&self, peer: Arc<ChannelPeer>) {
        self.registry.remove_dst(peer.dst_channel.id());
        let _ = peer.dst_channel.stop().await;
        let _ = peer.agent_channel.stop().await;
        self.extension.on_dst_channel_inactive(&peer.dst_channel).await;
        self.extension.on_agent_channel_inactive(&peer.agent_channel).await;
    }

    /// Stop every live pair's dst channel owned by this upstream. Agent
    /// channels are left alone: they belong to their own listener's
    /// lifecycle, not the upstream's (`ReleaseChannelPeers` in the
    /// original only tears down the dst pool). Used on service shutdown
    /// (spec.md §6 "Exit").
    pub async fn release_channel_peers(&self) {
        for peer in self.registry.drain_peers() {
            let _ = peer.dst_channel.stop().await;
            self.extension.on_dst_channel_inactive(&peer.dst_channel).await;
        }
        self.registry.clear_dst();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Attachments, Channel, Packet};
    use crate::config::{DstClientConf, Protocol};
    use crate::extension::NoopExtension;
    use crate::loadbalance::LoadBalanceType;
    use async_trait::async_trait;

    struct FakeChannel {
        id: String,
        attachments: Attachments,
    }

    impl FakeChannel {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self { id: id.to_string(), attachments: Attachments::new() })
        }
    }

    #[async_trait]
    impl Channel for FakeChannel {
        fn id(&self) -> &str {
            &self.id
        }

        async fn write(&self, _packet: Packet) -> Result<()> {
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            Ok(())
        }

        fn attachments(&self) -> &Attachments {
            &self.attachments
        }
    }

    fn test_upstream() -> Upstream {
        let conf = UpstreamConf {
            id: "u1".into(),
            load_balance: LoadBalanceType::Default,
            dst_clients: vec![DstClientConf {
                ip: "127.0.0.1".into(),
                port: 19980,
                protocol: Protocol::Tcp,
                scheme: None,
                path: None,
                subprotocol: None,
                weight: 1,
            }],
        };
        Upstream::new(conf, Arc::new(NoopExtension))
    }

    #[tokio::test]
    async fn init_then_query_resolves_both_directions() {
        let upstream = test_upstream();
        let peer = Arc::new(ChannelPeer::new(FakeChannel::new("a1"), FakeChannel::new("d1")));
        upstream.init_channel_peer(peer).unwrap();

        assert_eq!(upstream.query_dst_channel("a1").unwrap().id(), "d1");
        assert_eq!(upstream.query_agent_channel("d1").unwrap().id(), "a1");
        assert_eq!(upstream.channel_peer_count(), 1);
    }

    #[tokio::test]
    async fn release_on_agent_channel_is_idempotent_and_symmetric() {
        let upstream = test_upstream();
        let peer = Arc::new(ChannelPeer::new(FakeChannel::new("a1"), FakeChannel::new("d1")));
        upstream.init_channel_peer(peer).unwrap();

        upstream.release_on_agent_channel("a1").await;
        assert!(upstream.query_dst_channel("a1").is_none());
        assert!(upstream.query_agent_channel("d1").is_none());
        assert_eq!(upstream.dst_channels().len(), 0);

        // Second call (e.g. the dst side's own close path racing in) is a no-op.
        upstream.release_on_dst_channel("d1").await;
    }

    #[tokio::test]
    async fn release_channel_peers_stops_every_pair() {
        let upstream = test_upstream();
        upstream
            .init_channel_peer(Arc::new(ChannelPeer::new(FakeChannel::new("a1"), FakeChannel::new("d1"))))
            .unwrap();
        upstream
            .init_channel_peer(Arc::new(ChannelPeer::new(FakeChannel::new("a2"), FakeChannel::new("d2"))))
            .unwrap();

        upstream.release_channel_peers().await;
        assert_eq!(upstream.channel_peer_count(), 0);
        assert_eq!(upstream.dst_channels().len(), 0);
    }
}
