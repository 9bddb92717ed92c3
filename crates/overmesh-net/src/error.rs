//! Network layer errors

use std::net::SocketAddr;

use thiserror::Error;

/// Errors from the UDP transport and TUN device layers
#[derive(Debug, Error)]
pub enum NetError {
    /// Address already in use
    #[error("address already in use: {0}")]
    AddressInUse(SocketAddr),

    /// Packet failed structural validation
    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    /// The TUN device has been closed
    #[error("tun device closed")]
    TunClosed,

    /// Underlying I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for network operations
pub type NetResult<T> = Result<T, NetError>;
