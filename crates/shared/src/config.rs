use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    pub router: RouterConfig,
    pub chunk: ChunkConfig,
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Fixed node identifier; a random one is generated when absent
    pub node_id: Option<u64>,
    /// Hex-encoded secp256k1 secret key; generated on startup when absent
    pub private_key_hex: Option<String>,
    /// UDP address the node listens on (default: 0.0.0.0:4403)
    pub listen_addr: String,
    /// Peer addresses every outbound frame is sent to
    pub peers: Vec<String>,
    /// Sub-mesh partition stamped into every outbound packet (default: 0)
    pub sub_mesh_id: u16,
    /// Public forum channels joined at startup (default: general)
    pub forum_channels: Vec<String>,
    /// Interval between key announcements (default: 120)
    pub announce_interval_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            private_key_hex: None,
            listen_addr: "0.0.0.0:4403".to_string(),
            peers: Vec::new(),
            sub_mesh_id: 0,
            forum_channels: vec!["general".to_string()],
            announce_interval_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    /// Upper bound applied to every TTL arriving from the mesh (default: 10)
    pub max_ttl: u8,
    /// TTL stamped on locally originated messages (default: 10)
    pub default_ttl: u8,
    /// Expiration time for seen message IDs in seconds (default: 300)
    pub seen_expiration_secs: u64,
    /// Neighbors unseen for longer than this are inactive (default: 300)
    pub neighbor_timeout_secs: u64,
    /// Interval of the seen/neighbor cleanup pass (default: 60)
    pub cleanup_interval_secs: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_ttl: MAX_HOP_LIMIT,
            default_ttl: 10,
            seen_expiration_secs: 300,
            neighbor_timeout_secs: 300,
            cleanup_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChunkConfig {
    /// Maximum characters of text carried by a single packet (default: 200)
    pub max_text_length: usize,
    /// Partial reassemblies older than this are discarded (default: 300)
    pub chunk_timeout_secs: u64,
    /// Pause between consecutive chunk sends in milliseconds (default: 100)
    pub inter_chunk_delay_ms: u64,
    /// Interval of the pending chunk sweep (default: 60)
    pub sweep_interval_secs: u64,
    /// Largest `totalChunks` accepted for one message (default: 256)
    pub max_total_chunks: u16,
    /// Partial reassemblies held at once (default: 64)
    pub max_pending_sets: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_text_length: 200,
            chunk_timeout_secs: 300,
            inter_chunk_delay_ms: 100,
            sweep_interval_secs: 60,
            max_total_chunks: 256,
            max_pending_sets: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayMode {
    #[default]
    Client,
    Gateway,
}

impl FromStr for GatewayMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "client" => Ok(GatewayMode::Client),
            "gateway" => Ok(GatewayMode::Gateway),
            other => Err(ConfigError::UnknownMode(other.to_string())),
        }
    }
}

/// Internet-side services a gateway offers to the mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServiceFlags {
    pub mempool: bool,
    pub cashu: bool,
    pub mqtt: bool,
    pub lora: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Mode requested at startup (default: client)
    pub mode: GatewayMode,
    pub services: ServiceFlags,
    /// MQTT broker as host:port, probed during activation
    pub mqtt_broker: Option<String>,
    /// Connect timeout for the broker probe in seconds (default: 5)
    pub mqtt_timeout_secs: u64,
    /// Base URL of the Esplora-compatible transaction API
    pub mempool_url: String,
    /// Endpoint accepting Cashu tokens for redemption
    pub cashu_relay_url: Option<String>,
    /// Peers unseen for longer than this are evicted (default: 300)
    pub max_peer_age_secs: u64,
    /// Relay jobs untouched for longer than this are evicted (default: 3600)
    pub max_relay_job_age_secs: u64,
    /// Interval of the peer/job janitor (default: 60)
    pub cleanup_interval_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            mode: GatewayMode::Client,
            services: ServiceFlags::default(),
            mqtt_broker: None,
            mqtt_timeout_secs: 5,
            mempool_url: "https://mempool.space".to_string(),
            cashu_relay_url: None,
            max_peer_age_secs: 300,
            max_relay_job_age_secs: 3600,
            cleanup_interval_secs: 60,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let node = NodeConfig {
            node_id: optional_var("MESH_NODE_ID")
                .map(|raw| parse_node_id(&raw))
                .transpose()?,
            private_key_hex: optional_var("MESH_PRIVATE_KEY"),
            listen_addr: env::var("MESH_LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:4403".to_string()),
            peers: list_var("MESH_PEERS"),
            sub_mesh_id: parse_var("MESH_SUB_MESH_ID", 0)?,
            forum_channels: {
                let channels = list_var("MESH_FORUM_CHANNELS");
                if channels.is_empty() {
                    vec!["general".to_string()]
                } else {
                    channels
                }
            },
            announce_interval_secs: parse_var("MESH_ANNOUNCE_INTERVAL_SECS", 120)?,
        };

        let router = RouterConfig {
            max_ttl: checked_max_ttl(parse_var("MESH_MAX_TTL", MAX_HOP_LIMIT)?)?,
            default_ttl: parse_var("MESH_DEFAULT_TTL", 10)?,
            seen_expiration_secs: parse_var("MESH_SEEN_EXPIRATION_SECS", 300)?,
            neighbor_timeout_secs: parse_var("MESH_NEIGHBOR_TIMEOUT_SECS", 300)?,
            cleanup_interval_secs: parse_var("MESH_ROUTER_CLEANUP_INTERVAL_SECS", 60)?,
        };

        let chunk = ChunkConfig {
            max_text_length: parse_var("MESH_MAX_TEXT_LENGTH", 200)?,
            chunk_timeout_secs: parse_var("MESH_CHUNK_TIMEOUT_SECS", 300)?,
            inter_chunk_delay_ms: parse_var("MESH_INTER_CHUNK_DELAY_MS", 100)?,
            sweep_interval_secs: parse_var("MESH_CHUNK_SWEEP_INTERVAL_SECS", 60)?,
            max_total_chunks: parse_var("MESH_MAX_TOTAL_CHUNKS", 256)?,
            max_pending_sets: parse_var("MESH_MAX_PENDING_CHUNK_SETS", 64)?,
        };

        let gateway = GatewayConfig {
            mode: parse_var("MESH_GATEWAY_MODE", GatewayMode::Client)?,
            services: ServiceFlags {
                mempool: parse_var("MESH_SERVICE_MEMPOOL", false)?,
                cashu: parse_var("MESH_SERVICE_CASHU", false)?,
                mqtt: parse_var("MESH_SERVICE_MQTT", false)?,
                lora: parse_var("MESH_SERVICE_LORA", true)?,
            },
            mqtt_broker: optional_var("MESH_MQTT_BROKER"),
            mqtt_timeout_secs: parse_var("MESH_MQTT_TIMEOUT_SECS", 5)?,
            mempool_url: env::var("MESH_MEMPOOL_URL")
                .unwrap_or_else(|_| "https://mempool.space".to_string()),
            cashu_relay_url: optional_var("MESH_CASHU_RELAY_URL"),
            max_peer_age_secs: parse_var("MESH_MAX_PEER_AGE_SECS", 300)?,
            max_relay_job_age_secs: parse_var("MESH_MAX_RELAY_JOB_AGE_SECS", 3600)?,
            cleanup_interval_secs: parse_var("MESH_GATEWAY_CLEANUP_INTERVAL_SECS", 60)?,
        };

        tracing::debug!(
            listen_addr = %node.listen_addr,
            peers = node.peers.len(),
            gateway_mode = ?gateway.mode,
            "Configuration loaded from environment"
        );

        Ok(Config {
            node,
            router,
            chunk,
            gateway,
        })
    }
}

/// Upper bound on any TTL accepted from the mesh
pub const MAX_HOP_LIMIT: u8 = 10;

fn checked_max_ttl(max_ttl: u8) -> Result<u8> {
    if max_ttl > MAX_HOP_LIMIT {
        return Err(ConfigError::InvalidValue {
            key: "MESH_MAX_TTL".to_string(),
            value: format!("{} (must be at most {})", max_ttl, MAX_HOP_LIMIT),
        });
    }
    Ok(max_ttl)
}

/// Parse a node id written as hex, with or without a leading `!` or `0x`.
pub fn parse_node_id(raw: &str) -> Result<u64> {
    let trimmed = raw.trim();
    let digits = trimmed
        .strip_prefix('!')
        .or_else(|| trimmed.strip_prefix("0x"))
        .unwrap_or(trimmed);
    u64::from_str_radix(digits, 16).map_err(|_| ConfigError::InvalidNodeId(raw.to_string()))
}

fn optional_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn list_var(key: &str) -> Vec<String> {
    optional_var(key)
        .map(|raw| {
            raw.split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn parse_var<T: FromStr>(key: &str, default: T) -> Result<T> {
    match optional_var(key) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value,
        }),
    }
}
