use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io { path: String, source: io::Error },

    #[error("invalid json in {path}: {source}")]
    InvalidJson {
        path: String,
        source: serde_json::Error,
    },

    #[error("{path} is missing the expected {{type:{expected_type:?}, config:{{...}}}} envelope")]
    MissingEnvelope {
        path: String,
        expected_type: &'static str,
    },

    #[error("invalid neighbor weight for '{neighbor}': {reason}")]
    InvalidNeighborWeight { neighbor: String, reason: String },
}

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("malformed packet payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("schema violation: {0}")]
    SchemaViolation(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport not connected")]
    NotConnected,

    #[error("unknown channel: {0}")]
    ChannelUnknown(String),

    #[error("transport io error: {0}")]
    Io(String),
}
