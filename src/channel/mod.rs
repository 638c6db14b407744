//! The `Channel` abstraction the core relays through.
//!
//! A `Channel` is either an *agent* channel (accepted from a client listener)
//! or a *dst* channel (dialed by a `Proxy` upstream). Both sides of a pair
//! are stored and manipulated through the same trait object so the
//! pairing/relay code never needs to know which concrete transport it is
//! driving.

pub mod registry;

use async_trait::async_trait;
use dashmap::DashMap;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::error::Result;

/// Well-known attachment key the proxy uses to remember which framing
/// opcode to reapply on the backward (dst -> agent) relay path.
pub const OPCODE_KEY: &str = "opcode";

/// Default opcode used when an agent channel has never recorded one.
/// Mirrors `gkcp.OPCODE_TEXT_SIGNALLING` from the original implementation.
pub const DEFAULT_OPCODE: u16 = 0x01;

/// A single outbound/inbound unit of data carried across a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub opcode: u16,
    pub data: Vec<u8>,
}

impl Packet {
    pub fn new(opcode: u16, data: Vec<u8>) -> Self {
        Self { opcode, data }
    }

    pub fn text(data: Vec<u8>) -> Self {
        Self::new(DEFAULT_OPCODE, data)
    }
}

/// Per-channel attachment map: string keys to arbitrary typed values.
///
/// Backed by a `DashMap` rather than a `Mutex<HashMap>` so concurrent
/// readers (the relay hot path) and the rare writer (pairing setup,
/// extension hooks) don't serialize on each other.
#[derive(Default)]
pub struct Attachments(DashMap<String, Box<dyn Any + Send + Sync>>);

impl Attachments {
    pub fn new() -> Self {
        Self(DashMap::new())
    }

    pub fn insert<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.0.insert(key.into(), Box::new(value));
    }

    pub fn get<T: Any + Send + Sync + Clone>(&self, key: &str) -> Option<T> {
        self.0.get(key).and_then(|v| v.downcast_ref::<T>().cloned())
    }

    pub fn remove(&self, key: &str) {
        self.0.remove(key);
    }
}

impl fmt::Debug for Attachments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attachments")
            .field("len", &self.0.len())
            .finish()
    }
}

/// The core's view of a connection, agent-side or dst-side.
///
/// Implementations wrap a concrete transport (WebSocket, TCP, UDP, ...) and
/// must be cheap to clone (`Arc<dyn Channel>` is the currency the registry
/// and relay code pass around).
#[async_trait]
pub trait Channel: Send + Sync {
    /// Stable identity used as the registry key on both sides of I2.
    fn id(&self) -> &str;

    /// Write a packet to this channel's peer on the wire.
    async fn write(&self, packet: Packet) -> Result<()>;

    /// Stop (close) this channel. Idempotent: a second call is a no-op.
    async fn stop(&self) -> Result<()>;

    /// Per-channel attachment map.
    fn attachments(&self) -> &Attachments;
}

pub type DynChannel = Arc<dyn Channel>;

/// Immutable pairing of one agent channel and one dst channel.
///
/// Once constructed neither field is replaced — a re-pair always creates a
/// new `ChannelPeer` and is registered under fresh keys. Equality is by
/// identity (`Arc` pointer), never by value, matching §3's data model.
pub struct ChannelPeer {
    pub agent_channel: DynChannel,
    pub dst_channel: DynChannel,
    pub attachments: Attachments,
}

impl ChannelPeer {
    pub fn new(agent_channel: DynChannel, dst_channel: DynChannel) -> Self {
        Self {
            agent_channel,
            dst_channel,
            attachments: Attachments::new(),
        }
    }
}

impl fmt::Debug for ChannelPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelPeer")
            .field("agent_id", &self.agent_channel.id())
            .field("dst_id", &self.dst_channel.id())
            .finish()
    }
}
