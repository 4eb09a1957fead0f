use thiserror::Error;

/// Failure modes of the remote forwarding half of the logger.
#[derive(Debug, Error)]
pub enum LoggerError {
    /// Couldn't reach (or lost) the remote log sink.
    #[error("remote logger connection failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),

    /// A wire message couldn't be encoded or decoded.
    #[error("malformed remote logger message: {0}")]
    Wire(#[from] serde_json::Error),

    /// The local server-side socket could not be bound.
    #[error("couldn't open remote logger socket: {0}")]
    Bind(#[from] std::io::Error),
}
