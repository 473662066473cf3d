use thiserror::Error;

/// Errors produced by the socket layer.
#[derive(Error, Debug)]
pub enum NetError {
    /// `connect` was called without a stored credential.
    #[error("no credential available for connect")]
    MissingCredential,

    /// The socket handshake was refused or failed.
    #[error("socket handshake failed: {0}")]
    Handshake(String),

    /// An emission was attempted while disconnected.
    #[error("socket is not connected")]
    NotConnected,

    /// Reconnection attempts were exhausted.
    #[error("connection failed after {attempts} attempts")]
    ConnectionFailed { attempts: u32 },

    /// A frame could not be encoded.
    #[error("frame encode error: {0}")]
    Encode(#[from] serde_json::Error),

    /// Writing a frame to the wire failed.
    #[error("send failed: {0}")]
    Send(String),

    /// The connection closed while an operation was in flight.
    #[error("connection closed")]
    Closed,
}
