//! PKI errors

use thiserror::Error;

/// Errors raised while handling certificates and key material
#[derive(Debug, Error)]
pub enum PkiError {
    /// Certificate has passed its not_after time
    #[error("certificate is expired")]
    CertExpired,

    /// Certificate not_before lies in the future
    #[error("certificate is not yet valid")]
    CertNotYetValid,

    /// No CA in the pool matches the certificate issuer
    #[error("certificate signed by unknown issuer {0}")]
    UnknownIssuer(String),

    /// Ed25519 signature did not verify
    #[error("certificate signature did not match")]
    InvalidSignature,

    /// The issuing CA itself is expired
    #[error("root certificate is expired")]
    RootExpired,

    /// Certificate fingerprint is on the blocklist
    #[error("certificate is blocked")]
    CertBlocklisted,

    /// A CA certificate was presented where a node certificate was expected
    #[error("certificate is a CA certificate")]
    UnexpectedCaCert,

    /// A node certificate was presented where a CA certificate was expected
    #[error("certificate is not a CA certificate")]
    NotACaCert,

    /// Certificate does not contain exactly one overlay address
    #[error("certificate must contain exactly one overlay network address")]
    NoOverlayAddress,

    /// The supplied private key does not match the certificate public key
    #[error("private key does not match certificate public key")]
    KeyMismatch,

    /// PEM banner missing or unknown
    #[error("invalid PEM: {0}")]
    InvalidPem(String),

    /// Key material had the wrong length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Certificate encoding or decoding failed
    #[error("certificate encoding error: {0}")]
    Encoding(String),
}

/// Result type for PKI operations
pub type PkiResult<T> = Result<T, PkiError>;
