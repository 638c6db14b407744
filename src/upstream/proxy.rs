//! The active half of an upstream: dialing a dst channel for a freshly
//! accepted agent channel, and relaying messages between the two once
//! paired.
//!
//! Grounded on `agent/upstream.go`'s `SelectDstChannel` /
//! `onDstChannelMsgHandle` / `onDstChannelStopHandle` flow, re-expressed as
//! two small `RelaySink` implementations rather than closures captured over
//! mutable agent state.

use std::sync::Arc;

use async_trait::async_trait;

use super::Upstream;
use crate::channel::{ChannelPeer, DynChannel, Packet, DEFAULT_OPCODE, OPCODE_KEY};
use crate::error::{ProxyError, Result};
use crate::transport::{self, RelaySink};

/// Relays agent -> dst. Built before the dst channel exists, since the
/// agent channel must already be live (and able to receive messages) the
/// moment the listener hands it off. Looks the peer up fresh on every
/// message rather than holding the agent channel directly, so there's no
/// chicken-and-egg construction order with the transport that owns it.
struct AgentToDstRelay {
    upstream: Arc<Upstream>,
    agent_id: String,
}

#[async_trait]
impl RelaySink for AgentToDstRelay {
    async fn on_message(&self, packet: Packet) -> Result<()> {
        let peer = self
            .upstream
            .get_channel_peer_by_agent(&self.agent_id)
            .ok_or_else(|| ProxyError::SiblingMissing(self.agent_id.clone()))?;
        // Remember the framing opcode so the backward relay can reapply it
        // even if the dst side has no opcode concept of its own (spec P4).
        peer.agent_channel.attachments().insert(OPCODE_KEY, packet.opcode);
        peer.dst_channel.write(packet).await
    }

    async fn on_close(&self) {
        self.upstream.release_on_agent_channel(&self.agent_id).await;
    }
}

/// Relays dst -> agent.
struct DstToAgentRelay {
    upstream: Arc<Upstream>,
    dst_id: String,
}

#[async_trait]
impl RelaySink for DstToAgentRelay {
    async fn on_message(&self, packet: Packet) -> Result<()> {
        let peer = self
            .upstream
            .get_channel_peer_by_dst(&self.dst_id)
            .ok_or_else(|| ProxyError::SiblingMissing(self.dst_id.clone()))?;
        let opcode = peer.agent_channel.attachments().get::<u16>(OPCODE_KEY).unwrap_or(DEFAULT_OPCODE);
        peer.agent_channel.write(Packet::new(opcode, packet.data)).await
    }

    async fn on_close(&self) {
        self.upstream.release_on_dst_channel(&self.dst_id).await;
    }
}

/// Build the agent-side relay sink for a not-yet-paired agent channel.
/// Callers (the listener accept loop in `service`) use this to construct
/// the concrete transport channel, then immediately call
/// [`select_dst_channel`].
pub fn agent_relay_sink(upstream: Arc<Upstream>, agent_id: String) -> Arc<dyn RelaySink> {
    Arc::new(AgentToDstRelay { upstream, agent_id })
}

/// Pick a destination (the load balancer's "affinity key" is the agent
/// channel's own id, matching `TakeChannnelKey` in the original), dial it,
/// and register the pair. Fires `on_channel_peer_init` before the pair is
/// reachable from either registry key, and `on_dst_channel_active` once
/// the dial succeeds.
pub async fn select_dst_channel(upstream: &Arc<Upstream>, agent_channel: DynChannel) -> Result<Arc<ChannelPeer>> {
    let dst_conf = {
        let conf = upstream.conf();
        upstream
            .load_balancer()
            .select(&conf.dst_clients, agent_channel.id())?
            .clone()
    };

    let dst_id = transport::next_dst_id(&dst_conf);
    let sink = Arc::new(DstToAgentRelay { upstream: Arc::clone(upstream), dst_id: dst_id.clone() });

    let dst_channel = transport::dial(dst_id.clone(), &dst_conf, sink).await.map_err(|e| match e {
        ProxyError::DialFailure { upstream: u, reason } => ProxyError::DialFailure { upstream: u, reason },
        other => ProxyError::DialFailure { upstream: dst_id.clone(), reason: other.to_string() },
    })?;

    let peer = Arc::new(ChannelPeer::new(agent_channel, dst_channel));
    upstream.extension().on_channel_peer_init(&peer).await;
    let peer = upstream.init_channel_peer(peer)?;
    upstream.extension().on_dst_channel_active(&peer.dst_channel).await;
    Ok(peer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Attachments;
    use crate::channel::Channel;
    use crate::config::{DstClientConf, Protocol, UpstreamConf};
    use crate::extension::NoopExtension;
    use crate::loadbalance::LoadBalanceType;

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

    struct RecordingChannel {
        id: String,
        attachments: Attachments,
        writes: tokio::sync::Mutex<Vec<Packet>>,
    }

    impl RecordingChannel {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                attachments: Attachments::new(),
                writes: tokio::sync::Mutex::new(Vec::new()),
            })
        }

        async fn writes(&self) -> Vec<Packet> {
            self.writes.lock().await.clone()
        }
    }

    #[async_trait]
    impl Channel for RecordingChannel {
        fn id(&self) -> &str {
            &self.id
        }

        async fn write(&self, packet: Packet) -> Result<()> {
            self.writes.lock().await.push(packet);
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            Ok(())
        }

        fn attachments(&self) -> &Attachments {
            &self.attachments
        }
    }

    fn test_upstream() -> Arc<Upstream> {
        let conf = UpstreamConf {
            id: "u1".into(),
            load_balance: LoadBalanceType::Default,
            dst_clients: vec![DstClientConf {
                ip: "127.0.0.1".into(),
                port: 1,
                protocol: Protocol::Tcp,
                scheme: None,
                path: None,
                subprotocol: None,
                weight: 1,
            }],
        };
        Arc::new(Upstream::new(conf, Arc::new(NoopExtension)))
    }

    // P4: the backward relay must carry the opcode last recorded on the
    // agent channel's attachments, not whatever opcode the dst happened
    // to use on the wire.
    #[tokio::test]
    async fn backward_relay_reapplies_recorded_opcode() {
        let upstream = test_upstream();
        let agent = RecordingChannel::new("a1");
        let dst = RecordingChannel::new("d1");
        upstream
            .init_channel_peer(Arc::new(ChannelPeer::new(agent.clone(), dst.clone())))
            .unwrap();

        let agent_sink = AgentToDstRelay { upstream: Arc::clone(&upstream), agent_id: "a1".into() };
        agent_sink.on_message(Packet::new(2, b"hello".to_vec())).await.unwrap();
        assert_eq!(dst.writes().await, vec![Packet::new(2, b"hello".to_vec())]);
        assert_eq!(agent.attachments().get::<u16>(OPCODE_KEY), Some(2));

        let dst_sink = DstToAgentRelay { upstream: Arc::clone(&upstream), dst_id: "d1".into() };
        // Opcode 99 on the wire is discarded in favor of the recorded 2.
        dst_sink.on_message(Packet::new(99, b"hi".to_vec())).await.unwrap();
        assert_eq!(agent.writes().await, vec![Packet::new(2, b"hi".to_vec())]);
    }

    #[tokio::test]
    async fn relay_errors_when_sibling_missing() {
        let upstream = test_upstream();
        let sink = AgentToDstRelay { upstream, agent_id: "ghost".into() };
        let err = sink.on_message(Packet::text(b"x".to_vec())).await.unwrap_err();
        assert!(matches!(err, ProxyError::SiblingMissing(_)));
    }

    // select_dst_channel dials a real socket, so it is exercised indirectly
    // through relay-sink wiring here instead: a dial failure (nothing is
    // listening on this port) must surface as DialFailure, not panic.
    #[tokio::test]
    async fn select_dst_channel_surfaces_dial_failure() {
        let upstream = test_upstream();
        let agent = FakeChannel::new("a1");
        let err = select_dst_channel(&upstream, agent).await.unwrap_err();
        assert!(matches!(err, ProxyError::DialFailure { .. }));
        assert_eq!(upstream.channel_peer_count(), 0);
    }
}
