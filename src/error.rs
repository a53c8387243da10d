use thiserror::Error;

use crate::broker::BrokerError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable fetching error: {0}")]
    EnvVar(#[from] dotenvy::Error),
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),
    #[error("Content regex error: {0}")]
    Regex(#[from] regex::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),
    #[error("Message at {0} has no payload")]
    MissingPayload(String),
    #[error("Message at {0} has no timestamp; messages without timestamp are not supported")]
    MissingTimestamp(String),
    #[error("Invalid site status event: {0}")]
    InvalidEvent(String),
    #[error("Storage error: {0}")]
    Storage(String),
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
