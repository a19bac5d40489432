use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown serializer: {0}")]
    UnknownSerializer(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("failed to encode report as JSON")]
    Json(#[from] serde_json::Error),
    #[error("failed to encode report as YAML")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
