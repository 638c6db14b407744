//! Binds every configured listener, routes accepted connections to an
//! upstream, and owns the clean-shutdown path.
//!
//! Grounded on `harborgrid-justin-rusty-db/src/main.rs`'s bind/serve/signal
//! flow, generalized from one HTTP server to the WS/TCP/UDP listener set
//! `agent.go`'s `Run` drives.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{State, WebSocketUpgrade};
use axum::http::Uri;
use axum::response::Response;
use axum::routing::get;
use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use crate::channel::{Channel, DynChannel, Packet};
use crate::config::{ListenerConf, Protocol, ServiceConfig};
use crate::error::{ProxyError, Result};
use crate::extension::Extension;
use crate::router::Router;
use crate::transport::{TcpChannel, UdpAgentChannel, WsAgentChannel};
use crate::upstream::{proxy, Upstream};

const MAX_DATAGRAM: usize = 65507;

pub struct Service {
    agent_id: String,
    upstreams: HashMap<String, Arc<Upstream>>,
    router: Router,
    listeners: Vec<ListenerConf>,
}

impl Service {
    pub fn new(config: ServiceConfig, extension: Arc<dyn Extension>) -> Result<Arc<Self>> {
        let router = Router::new(&config.locations);

        let mut upstreams = HashMap::new();
        for conf in config.upstreams {
            upstreams.insert(conf.id.clone(), Arc::new(Upstream::new(conf, Arc::clone(&extension))));
        }

        for location in &config.locations {
            if !upstreams.contains_key(&location.upstream_id) {
                return Err(ProxyError::Config(format!(
                    "location {:?} references unknown upstream {}",
                    location.pattern, location.upstream_id
                )));
            }
        }

        Ok(Arc::new(Self {
            agent_id: config.agent_id,
            upstreams,
            router,
            listeners: config.listeners,
        }))
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Bind every listener and run until a shutdown signal arrives, then
    /// release every live channel pair before returning (spec.md §6
    /// "Exit").
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut handles = Vec::new();
        for listener in self.listeners.clone() {
            let service = Arc::clone(&self);
            handles.push(tokio::spawn(async move {
                if let Err(e) = service.run_listener(listener).await {
                    tracing::error!(error = %e, "listener exited with error");
                }
            }));
        }

        tokio::signal::ctrl_c().await.ok();
        tracing::info!("shutdown signal received, releasing channel peers");
        self.shutdown().await;
        for handle in handles {
            handle.abort();
        }
        Ok(())
    }

    async fn shutdown(&self) {
        for upstream in self.upstreams.values() {
            upstream.release_channel_peers().await;
        }
    }

    async fn run_listener(self: Arc<Self>, listener: ListenerConf) -> Result<()> {
        match listener.protocol {
            Protocol::Tcp => self.run_tcp_listener(listener).await,
            Protocol::Udp => self.run_udp_listener(listener).await,
            Protocol::Ws => self.run_ws_listener(listener).await,
            Protocol::Http => Err(ProxyError::Config("http listeners have no server implementation".into())),
        }
    }

    fn listener_addr(listener: &ListenerConf) -> Result<SocketAddr> {
        let ip = if listener.ip.is_empty() { "0.0.0.0" } else { &listener.ip };
        format!("{ip}:{}", listener.port)
            .parse()
            .map_err(|e| ProxyError::Config(format!("invalid listener address: {e}")))
    }

    async fn run_tcp_listener(self: Arc<Self>, listener: ListenerConf) -> Result<()> {
        let addr = Self::listener_addr(&listener)?;
        let tcp_listener = TcpListener::bind(addr).await?;
        tracing::info!(%addr, "tcp listener bound");
        loop {
            let (stream, peer) = tcp_listener.accept().await?;
            let service = Arc::clone(&self);
            tokio::spawn(async move {
                service.handle_tcp_agent(stream, peer).await;
            });
        }
    }

    async fn handle_tcp_agent(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let Some(upstream) = self.resolve_default_upstream() else {
            return;
        };
        let agent_id = format!("{peer}-{}", uuid::Uuid::new_v4());
        let sink = proxy::agent_relay_sink(Arc::clone(&upstream), agent_id.clone());
        let agent_channel: DynChannel = TcpChannel::spawn(agent_id, stream, sink);
        upstream.extension().on_agent_channel_active(&agent_channel).await;
        if let Err(e) = proxy::select_dst_channel(&upstream, Arc::clone(&agent_channel)).await {
            tracing::warn!(error = %e, "tcp dst dial failed, closing agent channel");
            let _ = agent_channel.stop().await;
        }
    }

    async fn run_udp_listener(self: Arc<Self>, listener: ListenerConf) -> Result<()> {
        let addr = Self::listener_addr(&listener)?;
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        tracing::info!(%addr, "udp listener bound");

        // peer addr -> the upstream and agent id it was paired into. No
        // idle eviction: spec.md doesn't define a UDP session timeout, so
        // sessions live until the dst side closes them.
        let sessions: DashMap<SocketAddr, (Arc<Upstream>, String)> = DashMap::new();
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let (n, peer) = socket.recv_from(&mut buf).await?;
            let data = buf[..n].to_vec();

            if let Some(session) = sessions.get(&peer) {
                let (upstream, agent_id) = session.value().clone();
                drop(session);
                if let Some(dst) = upstream.query_dst_channel(&agent_id) {
                    let _ = dst.write(Packet::text(data)).await;
                } else {
                    sessions.remove(&peer);
                }
                continue;
            }

            let Some(upstream) = self.resolve_default_upstream() else {
                continue;
            };
            let agent_id = peer.to_string();
            let agent_channel: DynChannel = UdpAgentChannel::new(agent_id.clone(), Arc::clone(&socket), peer);
            upstream.extension().on_agent_channel_active(&agent_channel).await;

            if let Err(e) = proxy::select_dst_channel(&upstream, Arc::clone(&agent_channel)).await {
                tracing::warn!(error = %e, "udp dst dial failed, dropping datagram");
                continue;
            }
            sessions.insert(peer, (Arc::clone(&upstream), agent_id.clone()));
            if let Some(dst) = upstream.query_dst_channel(&agent_id) {
                let _ = dst.write(Packet::text(data)).await;
            }
        }
    }

    async fn run_ws_listener(self: Arc<Self>, listener: ListenerConf) -> Result<()> {
        let addr = Self::listener_addr(&listener)?;
        let mut app = axum::Router::new();
        let paths: Vec<String> = if listener.ws_children.is_empty() {
            vec!["/".to_string()]
        } else {
            listener.ws_children.iter().map(|c| if c.path.is_empty() { "/".to_string() } else { c.path.clone() }).collect()
        };
        for path in paths {
            app = app.route(&path, get(ws_upgrade_handler));
        }
        let app = app.with_state(Arc::clone(&self));

        let tcp_listener = TcpListener::bind(addr).await?;
        tracing::info!(%addr, "ws listener bound");
        axum::serve(tcp_listener, app.into_make_service())
            .await
            .map_err(|e| ProxyError::Transport(e.to_string()))
    }

    async fn handle_ws_agent(self: Arc<Self>, socket: axum::extract::ws::WebSocket, path: String) {
        let Some(upstream) = self.resolve_upstream_for_path(&path) else {
            return;
        };
        let agent_id = uuid::Uuid::new_v4().to_string();
        let sink = proxy::agent_relay_sink(Arc::clone(&upstream), agent_id.clone());
        let agent_channel: DynChannel = WsAgentChannel::spawn(agent_id, socket, sink);
        upstream.extension().on_agent_channel_active(&agent_channel).await;
        if let Err(e) = proxy::select_dst_channel(&upstream, Arc::clone(&agent_channel)).await {
            tracing::warn!(error = %e, "ws dst dial failed, closing agent channel");
            let _ = agent_channel.stop().await;
        }
    }

    /// Non-WS transports have no request path to route on, so they resolve
    /// through the catch-all location only.
    fn resolve_default_upstream(&self) -> Option<Arc<Upstream>> {
        self.resolve_upstream_for_path("")
    }

    fn resolve_upstream_for_path(&self, path: &str) -> Option<Arc<Upstream>> {
        let upstream_id = self.router.resolve(path).ok()?;
        self.upstreams.get(upstream_id).cloned()
    }
}

async fn ws_upgrade_handler(State(service): State<Arc<Service>>, uri: Uri, ws: WebSocketUpgrade) -> Response {
    let path = uri.path().to_string();
    ws.on_upgrade(move |socket| async move {
        service.handle_ws_agent(socket, path).await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DstClientConf, LocationConf, Protocol as P, UpstreamConf};
    use crate::extension::NoopExtension;
    use crate::loadbalance::LoadBalanceType;

    fn minimal_config() -> ServiceConfig {
        ServiceConfig {
            agent_id: "a".into(),
            channel_conf: Default::default(),
            read_pool_conf: crate::config::ReadPoolConf { max_size: 1, max_queue_size: 1 },
            listeners: vec![],
            locations: vec![LocationConf { pattern: "".into(), upstream_id: "u1".into() }],
            upstreams: vec![UpstreamConf {
                id: "u1".into(),
                load_balance: LoadBalanceType::Default,
                dst_clients: vec![DstClientConf {
                    ip: "127.0.0.1".into(),
                    port: 1,
                    protocol: P::Tcp,
                    scheme: None,
                    path: None,
                    subprotocol: None,
                    weight: 1,
                }],
            }],
        }
    }

    #[test]
    fn rejects_location_with_unknown_upstream() {
        let mut config = minimal_config();
        config.locations[0].upstream_id = "does-not-exist".into();
        assert!(Service::new(config, Arc::new(NoopExtension)).is_err());
    }

    #[test]
    fn builds_with_valid_config() {
        let service = Service::new(minimal_config(), Arc::new(NoopExtension)).unwrap();
        assert_eq!(service.agent_id(), "a");
        assert!(service.resolve_default_upstream().is_some());
    }
}
