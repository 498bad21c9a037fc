use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum GatewayError {
    #[error("I/O error: {0}")]
    #[diagnostic(code(waypoint::io))]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    #[diagnostic(code(waypoint::config))]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    #[diagnostic(code(waypoint::serde))]
    Serde(#[from] serde_json::Error),

    #[error("Cache error: {0}")]
    #[diagnostic(code(waypoint::cache))]
    Cache(#[from] crate::cache::CacheError),

    #[error("Upstream request failed: {0}")]
    #[diagnostic(code(waypoint::upstream))]
    Upstream(#[from] reqwest::Error),

    #[error("Invalid configuration: {0}")]
    #[diagnostic(code(waypoint::invalid_config))]
    InvalidConfig(String),

    #[error("{0}")]
    #[diagnostic(code(waypoint::other))]
    Other(String),
}
