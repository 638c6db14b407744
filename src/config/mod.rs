//! Flat key -> string config parsing, mirroring
//! `original_source/config/config.go`'s `InitServiceConf` but expressed as
//! typed Rust structs with `Result` instead of `panic`.

pub mod loader;

use std::collections::HashMap;
use std::time::Duration;

use crate::error::{ProxyError, Result};
use crate::loadbalance::LoadBalanceType;

pub const DEFAULT_NETWORK: &str = "ws";
pub const DEFAULT_PORT: u16 = 9080;
pub const DEFAULT_DST_PORT: u16 = 19980;
pub const MAX_READ_POOL_EVERY_CPU: usize = 4;
pub const MAX_READ_QUEUE_SIZE: usize = 1024;

/// Wire protocol a listener or a dst client speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Ws,
    Tcp,
    Udp,
    Http,
}

impl Protocol {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "" | "ws" => Ok(Self::Ws),
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "http" | "kws00" | "kws01" | "kcp" => Err(ProxyError::Config(format!(
                "network '{s}' is not supported: refused at config load (see DESIGN.md Open Questions)"
            ))),
            other => Err(ProxyError::Config(format!("unknown network: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChannelConf {
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub read_buf_size: usize,
    pub write_buf_size: usize,
    pub close_rev_fail_time: i64,
}

#[derive(Debug, Clone)]
pub struct ReadPoolConf {
    pub max_size: usize,
    pub max_queue_size: usize,
}

/// One destination the load balancer can pick for a given upstream.
#[derive(Debug, Clone)]
pub struct DstClientConf {
    pub ip: String,
    pub port: u16,
    pub protocol: Protocol,
    pub scheme: Option<String>,
    pub path: Option<String>,
    pub subprotocol: Option<String>,
    pub weight: u32,
}

#[derive(Debug, Clone)]
pub struct UpstreamConf {
    pub id: String,
    pub load_balance: LoadBalanceType,
    pub dst_clients: Vec<DstClientConf>,
}

/// A WebSocket child endpoint sharing a listener's port.
#[derive(Debug, Clone)]
pub struct WsChildConf {
    pub path: String,
    pub subprotocol: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ListenerConf {
    pub id: String,
    pub ip: String,
    pub port: u16,
    pub protocol: Protocol,
    pub max_channel_size: usize,
    pub scheme: Option<String>,
    pub ws_children: Vec<WsChildConf>,
}

#[derive(Debug, Clone)]
pub struct LocationConf {
    pub pattern: String,
    pub upstream_id: String,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub agent_id: String,
    pub channel_conf: ChannelConf,
    pub read_pool_conf: ReadPoolConf,
    pub listeners: Vec<ListenerConf>,
    pub locations: Vec<LocationConf>,
    pub upstreams: Vec<UpstreamConf>,
}

fn parse_int(map: &HashMap<String, String>, key: &str) -> Result<Option<i64>> {
    match map.get(key) {
        None => Ok(None),
        Some(v) if v.is_empty() => Ok(None),
        Some(v) => v
            .parse::<i64>()
            .map(Some)
            .map_err(|_| ProxyError::Config(format!("{key} is not a valid integer: {v}"))),
    }
}

impl ServiceConfig {
    /// Build a `ServiceConfig` from the flat map an external config loader
    /// produces. Unknown keys are ignored; malformed integers are a fatal
    /// `ProxyError::Config` (spec.md §6).
    pub fn from_map(config: &HashMap<String, String>) -> Result<Self> {
        let agent_id = config
            .get("agent.server.id")
            .filter(|s| !s.is_empty())
            .cloned()
            .unwrap_or_else(|| format!("agent-{}", rand::random::<u32>()));

        let channel_conf = Self::parse_channel_conf(config)?;
        let read_pool_conf = Self::parse_read_pool_conf(config)?;
        let locations = Self::parse_locations(config)?;
        let listeners = Self::parse_listeners(config)?;
        let upstreams = Self::parse_upstreams(config)?;

        if listeners.is_empty() {
            return Err(ProxyError::Config("no listener configured".into()));
        }
        if upstreams.is_empty() {
            return Err(ProxyError::Config("agent.upstream.id is missing or empty".into()));
        }

        Ok(Self {
            agent_id,
            channel_conf,
            read_pool_conf,
            listeners,
            locations,
            upstreams,
        })
    }

    fn parse_channel_conf(config: &HashMap<String, String>) -> Result<ChannelConf> {
        let mut conf = ChannelConf::default();
        if let Some(v) = parse_int(config, "agent.channel.readBufSize")? {
            conf.read_buf_size = v as usize;
        }
        if let Some(v) = parse_int(config, "agent.channel.writeBufSize")? {
            conf.write_buf_size = v as usize;
        }
        if let Some(v) = parse_int(config, "agent.channel.readTimeout")? {
            conf.read_timeout = Duration::from_millis(v.max(0) as u64);
        }
        if let Some(v) = parse_int(config, "agent.channel.writeTimeout")? {
            conf.write_timeout = Duration::from_millis(v.max(0) as u64);
        }
        if let Some(v) = parse_int(config, "agent.channel.closeRevFailTime")? {
            conf.close_rev_fail_time = v;
        }
        Ok(conf)
    }

    fn parse_read_pool_conf(config: &HashMap<String, String>) -> Result<ReadPoolConf> {
        let max_size = parse_int(config, "agent.readpool.maxCpuSize")?
            .map(|v| v as usize)
            .unwrap_or(MAX_READ_POOL_EVERY_CPU);
        let max_queue_size = parse_int(config, "agent.readqueue.maxSize")?
            .map(|v| v as usize)
            .unwrap_or(MAX_READ_QUEUE_SIZE);
        Ok(ReadPoolConf {
            max_size: max_size * num_cpus(),
            max_queue_size,
        })
    }

    fn parse_locations(config: &HashMap<String, String>) -> Result<Vec<LocationConf>> {
        let mut locations = Vec::new();
        let mut index = 0usize;
        loop {
            let upstream_key = format!("agent.server.location.{index}.upstreamId");
            let Some(upstream_id) = config.get(&upstream_key).filter(|s| !s.is_empty()) else {
                break;
            };
            let pattern = config
                .get(&format!("agent.server.location.{index}.pattern"))
                .cloned()
                .unwrap_or_default();
            locations.push(LocationConf {
                pattern,
                upstream_id: upstream_id.clone(),
            });
            index += 1;
        }
        Ok(locations)
    }

    fn parse_listeners(config: &HashMap<String, String>) -> Result<Vec<ListenerConf>> {
        let default_ip = config.get("agent.server.ip").cloned().unwrap_or_default();
        let default_network = config
            .get("agent.server.network")
            .filter(|s| !s.is_empty())
            .cloned()
            .unwrap_or_else(|| DEFAULT_NETWORK.to_string());
        let default_max_channel_size = parse_int(config, "agent.server.maxChannelSize")?
            .map(|v| v as usize)
            .unwrap_or(0);

        let mut listeners = Vec::new();
        let mut index = 0usize;
        loop {
            let port_key = format!("agent.server.{index}.port");
            let Some(port_str) = config.get(&port_key).filter(|s| !s.is_empty()) else {
                break;
            };
            let port: u16 = port_str
                .parse()
                .map_err(|_| ProxyError::Config(format!("{port_key} is not a valid port: {port_str}")))?;
            let ip = config
                .get(&format!("agent.server.{index}.ip"))
                .filter(|s| !s.is_empty())
                .cloned()
                .unwrap_or_else(|| default_ip.clone());
            let network = config
                .get(&format!("agent.server.{index}.network"))
                .filter(|s| !s.is_empty())
                .cloned()
                .unwrap_or_else(|| default_network.clone());
            let max_channel_size = parse_int(config, &format!("agent.server.{index}.maxChannelSize"))?
                .map(|v| v as usize)
                .unwrap_or(default_max_channel_size);

            listeners.push(Self::build_listener(config, index, ip, port, &network, max_channel_size)?);
            index += 1;
        }

        // The single default listener (agent.server.port), only created
        // when no indexed listeners were configured at all and no explicit
        // port override exists, matching config.go's fallback-to-9080 rule.
        if listeners.is_empty() {
            let port: u16 = match config.get("agent.server.port").filter(|s| !s.is_empty()) {
                Some(p) => p
                    .parse()
                    .map_err(|_| ProxyError::Config(format!("agent.server.port is not a valid port: {p}")))?,
                None => DEFAULT_PORT,
            };
            listeners.push(Self::build_listener(
                config,
                listeners.len(),
                default_ip.clone(),
                port,
                &default_network,
                default_max_channel_size,
            )?);
        } else if let Some(port_str) = config.get("agent.server.port").filter(|s| !s.is_empty()) {
            let port: u16 = port_str
                .parse()
                .map_err(|_| ProxyError::Config(format!("agent.server.port is not a valid port: {port_str}")))?;
            listeners.push(Self::build_listener(
                config,
                listeners.len(),
                default_ip,
                port,
                &default_network,
                default_max_channel_size,
            )?);
        }

        Ok(listeners)
    }

    fn build_listener(
        config: &HashMap<String, String>,
        index: usize,
        ip: String,
        port: u16,
        network: &str,
        max_channel_size: usize,
    ) -> Result<ListenerConf> {
        let protocol = Protocol::parse(network)?;
        let (scheme, ws_children) = if matches!(protocol, Protocol::Ws) {
            Self::parse_ws_children(config)?
        } else {
            (None, Vec::new())
        };
        Ok(ListenerConf {
            id: format!("listener-{index}"),
            ip,
            port,
            protocol,
            max_channel_size,
            scheme,
            ws_children,
        })
    }

    fn parse_ws_children(
        config: &HashMap<String, String>,
    ) -> Result<(Option<String>, Vec<WsChildConf>)> {
        let scheme = config.get("agent.server.scheme").cloned();
        let mut children = Vec::new();
        let mut index = 0usize;
        loop {
            let path_key = format!("agent.server.ws.{index}.path");
            let Some(path) = config.get(&path_key).filter(|s| !s.is_empty()) else {
                break;
            };
            let subprotocol = config.get(&format!("agent.server.ws.{index}.subprotocol")).cloned();
            children.push(WsChildConf {
                path: path.clone(),
                subprotocol,
            });
            index += 1;
        }
        if children.is_empty() {
            let path = config.get("agent.server.path").cloned().unwrap_or_default();
            let subprotocol = config.get("agent.server.subprotocol").cloned();
            children.push(WsChildConf { path, subprotocol });
        }
        Ok((scheme, children))
    }

    fn parse_upstreams(config: &HashMap<String, String>) -> Result<Vec<UpstreamConf>> {
        let Some(ids) = config.get("agent.upstream.id").filter(|s| !s.is_empty()) else {
            return Ok(Vec::new());
        };
        let ids: Vec<&str> = if ids.contains(';') {
            ids.split(';').collect()
        } else if ids.contains(',') {
            ids.split(',').collect()
        } else {
            vec![ids.as_str()]
        };

        let mut upstreams = Vec::new();
        for id in ids {
            let id = id.trim();
            if id.is_empty() {
                continue;
            }
            let lb_str = config
                .get(&format!("agent.upstream.{id}.loadBalance"))
                .cloned()
                .unwrap_or_default();
            let load_balance = LoadBalanceType::parse(&lb_str)?;

            let dst_clients = Self::parse_dst_clients(config, id)?;
            if dst_clients.is_empty() {
                return Err(ProxyError::Config(format!("upstream {id} has no dstclient entries")));
            }

            upstreams.push(UpstreamConf {
                id: id.to_string(),
                load_balance,
                dst_clients,
            });
        }
        Ok(upstreams)
    }

    fn parse_dst_clients(config: &HashMap<String, String>, upstream_id: &str) -> Result<Vec<DstClientConf>> {
        let mut dsts = Vec::new();
        let mut index = 0usize;
        loop {
            let prefix = format!("agent.upstream.{upstream_id}.dstclient.{index}.");
            let ip_key = format!("{prefix}ip");
            let Some(ip) = config.get(&ip_key).filter(|s| !s.is_empty()) else {
                break;
            };

            let port = match config.get(&format!("{prefix}port")).filter(|s| !s.is_empty()) {
                Some(p) => p
                    .parse()
                    .map_err(|_| ProxyError::Config(format!("{prefix}port is not a valid port: {p}")))?,
                None => DEFAULT_DST_PORT,
            };
            let network = config
                .get(&format!("{prefix}network"))
                .filter(|s| !s.is_empty())
                .cloned()
                .unwrap_or_else(|| DEFAULT_NETWORK.to_string());
            let protocol = Protocol::parse(&network)?;
            let scheme = config.get(&format!("{prefix}scheme")).cloned();
            let path = config.get(&format!("{prefix}path")).cloned();
            let subprotocol = config.get(&format!("{prefix}subprotocol")).cloned();
            let weight = parse_int(config, &format!("{prefix}weight"))?.map(|v| v as u32).unwrap_or(1);

            dsts.push(DstClientConf {
                ip: ip.clone(),
                port,
                protocol,
                scheme,
                path,
                subprotocol,
                weight,
            });
            index += 1;
        }
        Ok(dsts)
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_map() -> HashMap<String, String> {
        let mut m = HashMap::new();
        m.insert("agent.server.port".into(), "9080".into());
        m.insert("agent.upstream.id".into(), "u1".into());
        m.insert("agent.upstream.u1.dstclient.0.ip".into(), "127.0.0.1".into());
        m.insert("agent.upstream.u1.dstclient.0.port".into(), "19980".into());
        m.insert("agent.upstream.u1.dstclient.0.network".into(), "ws".into());
        m
    }

    #[test]
    fn minimal_config_parses() {
        let conf = ServiceConfig::from_map(&base_map()).unwrap();
        assert_eq!(conf.listeners.len(), 1);
        assert_eq!(conf.listeners[0].port, 9080);
        assert_eq!(conf.upstreams.len(), 1);
        assert_eq!(conf.upstreams[0].dst_clients.len(), 1);
    }

    #[test]
    fn missing_upstream_id_is_config_error() {
        let mut m = base_map();
        m.remove("agent.upstream.id");
        assert!(ServiceConfig::from_map(&m).is_err());
    }

    #[test]
    fn malformed_port_is_config_error() {
        let mut m = base_map();
        m.insert("agent.server.port".into(), "not-a-number".into());
        assert!(ServiceConfig::from_map(&m).is_err());
    }

    #[test]
    fn kcp_network_is_rejected_at_load() {
        let mut m = base_map();
        m.insert("agent.upstream.u1.dstclient.0.network".into(), "kcp".into());
        assert!(ServiceConfig::from_map(&m).is_err());
    }

    #[test]
    fn semicolon_delimited_upstream_ids() {
        let mut m = base_map();
        m.insert("agent.upstream.id".into(), "u1;u2".into());
        m.insert("agent.upstream.u2.dstclient.0.ip".into(), "127.0.0.2".into());
        let conf = ServiceConfig::from_map(&m).unwrap();
        assert_eq!(conf.upstreams.len(), 2);
    }

    #[test]
    fn locations_parsed_in_order() {
        let mut m = base_map();
        m.insert("agent.server.location.0.pattern".into(), "api/".into());
        m.insert("agent.server.location.0.upstreamId".into(), "u1".into());
        m.insert("agent.server.location.1.pattern".into(), "".into());
        m.insert("agent.server.location.1.upstreamId".into(), "u1".into());
        let conf = ServiceConfig::from_map(&m).unwrap();
        assert_eq!(conf.locations.len(), 2);
        assert_eq!(conf.locations[0].pattern, "api/");
    }
}
