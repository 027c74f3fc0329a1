use thiserror::Error;

pub type Result<T> = std::result::Result<T, SocketError>;

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("unsupported domain/type/protocol combination: {0}")]
    Unsupported(String),

    #[error("socket is not connected")]
    NotConnected,

    #[error("socket is already connected")]
    AlreadyConnected,

    #[error("bad socket descriptor: {0}")]
    BadDescriptor(i32),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
