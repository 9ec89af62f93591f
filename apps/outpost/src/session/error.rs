use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connection not established")]
    NotConnected,
    #[error("no handshake from server within {}s", .0.as_secs())]
    DialTimeout(Duration),
    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error("failed to encode outbound message: {0}")]
    Encode(#[from] serde_json::Error),
}
