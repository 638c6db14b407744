use thiserror::Error;

/// Error kinds produced by the proxy core and its transport boundary.
///
/// Shaped after `harborgrid-justin-rusty-db`'s `DbError`: one flat
/// `thiserror` enum, a crate-wide `Result` alias, and `From` conversions for
/// the handful of external error types the crate actually touches.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("no route matched for {0:?}")]
    NoRoute(String),

    #[error("dial failure to upstream {upstream}: {reason}")]
    DialFailure { upstream: String, reason: String },

    #[error("channel already paired: {0}")]
    AlreadyPaired(String),

    #[error("sibling channel missing for {0}")]
    SiblingMissing(String),

    #[error("transport error: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, ProxyError>;

impl From<serde_json::Error> for ProxyError {
    fn from(e: serde_json::Error) -> Self {
        ProxyError::Config(format!("invalid json: {e}"))
    }
}

impl From<serde_yaml::Error> for ProxyError {
    fn from(e: serde_yaml::Error) -> Self {
        ProxyError::Config(format!("invalid yaml: {e}"))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ProxyError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ProxyError::Transport(e.to_string())
    }
}
