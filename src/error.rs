use std::io;

/// Crate-wide result alias, re-exported from `lib.rs`.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("peer disconnected")]
    Disconnected,

    #[error("framing error: {0}")]
    Framing(&'static str),

    #[error("malformed message: {0}")]
    Decode(&'static str),

    #[error("invalid json in control message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration file: {0}")]
    Config(#[from] toml::de::Error),

    #[error("screen capture failed: {0}")]
    Capture(String),

    #[error("image codec failed: {0}")]
    Codec(String),

    #[error("os input injection failed: {0}")]
    Input(String),

    #[error("display surface failed: {0}")]
    Display(String),
}
