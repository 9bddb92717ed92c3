//! Core protocol errors

use overmesh_net::OverlayIp;
use thiserror::Error;

/// Core protocol errors
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration did not validate
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Certificate failed verification
    #[error("certificate error: {0}")]
    Cert(#[from] overmesh_pki::PkiError),

    /// Peer certificate does not own the overlay address it claims
    #[error("certificate overlay address mismatch: cert {cert_ip}, claimed {claimed}")]
    CertIpMismatch { cert_ip: OverlayIp, claimed: OverlayIp },

    /// An outstanding handshake ran out of retries
    #[error("handshake with {0} timed out")]
    HandshakeTimeout(OverlayIp),

    /// A handshake message failed authentication
    #[error("handshake message failed to authenticate")]
    HandshakeDecryptFailed,

    /// A handshake message was a replay
    #[error("handshake message replayed")]
    HandshakeReplay,

    /// A data packet failed authentication or replay protection
    #[error("packet failed to decrypt")]
    DataDecryptFailed,

    /// Could not find a free tunnel index after probing
    #[error("exhausted attempts to allocate a tunnel index")]
    IndexExhausted,

    /// No tunnel for the given overlay address
    #[error("no tunnel for {0}")]
    HostNotFound(OverlayIp),

    /// No tunnel for the given local index
    #[error("no tunnel for local index {0}")]
    IndexNotFound(u32),

    /// No relay for the given index
    #[error("no relay for index {0}")]
    UnknownRelay(u32),

    /// The session is not ready to carry traffic
    #[error("tunnel is not ready")]
    TunnelNotReady,

    /// Wire header failed to parse
    #[error("invalid header: {0}")]
    InvalidHeader(String),

    /// Payload serialization failed
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Underlying network failure
    #[error("network error: {0}")]
    Net(#[from] overmesh_net::NetError),
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;
