use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Unknown gateway mode: {0}")]
    UnknownMode(String),

    #[error("Invalid node id: {0}")]
    InvalidNodeId(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
