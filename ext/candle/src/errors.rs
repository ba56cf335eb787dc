use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while locating, reading or wiring checkpoint components.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error("hub request failed: {0}")]
    Hub(#[from] hf_hub::api::sync::ApiError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid options file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid safetensors file: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("unsupported checkpoint: {0}")]
    Unsupported(String),

    #[error("{backend} is not available: {reason}")]
    BackendUnavailable { backend: &'static str, reason: String },

    #[error("{0}")]
    Msg(String),
}

impl LoadError {
    pub fn msg(msg: impl Into<String>) -> Self {
        Self::Msg(msg.into())
    }
}

impl From<tokenizers::Error> for LoadError {
    fn from(err: tokenizers::Error) -> Self {
        Self::Tokenizer(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LoadError>;
