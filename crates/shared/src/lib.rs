pub mod config;
pub mod error;

pub use config::{ChunkConfig, Config, GatewayConfig, GatewayMode, NodeConfig, RouterConfig, ServiceFlags};
pub use error::{ConfigError, Result};
