use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to access activity file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("activity file {path:?} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize activity data: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("sheets api returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid service account credentials: {0}")]
    Credentials(String),

    #[error("failed to sign token request")]
    Signing,

    #[error("failed to read credentials: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed response: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("font error: {0}")]
    Font(#[from] ab_glyph::InvalidFont),

    #[error("avatar download failed: {0}")]
    Fetch(#[from] reqwest::Error),

    #[error("avatar cache io: {0}")]
    Io(#[from] std::io::Error),

    #[error("discord delivery failed: {0}")]
    Discord(#[from] serenity::Error),
}
