use thiserror::Error;

#[derive(Error, Debug)]
pub enum HavocError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// Dispatch resolved to an empty target set.
    #[error("No nodes configured for this dispatch")]
    NoNodesConfigured,

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("API request failed: {0}")]
    Api(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, HavocError>;
