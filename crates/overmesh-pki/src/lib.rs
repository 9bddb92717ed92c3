//! Certificate handling for overmesh.
//!
//! Every participant owns an overlay IPv4 address backed by a certificate.
//! Node certificates carry an X25519 public key (used as the static key of
//! the tunnel handshake) and are signed by a certificate authority holding
//! an Ed25519 keypair. Certificates travel inside handshake messages and
//! are verified against a [`CaPool`].

mod cert;
mod error;
mod pem;
mod pool;

pub use cert::{unix_now, CertDetails, MeshCertificate};
pub use error::{PkiError, PkiResult};
pub use pem::{
    decode_pem, encode_pem, BANNER_CERTIFICATE, BANNER_ED25519_PRIVATE_KEY,
    BANNER_PUBLIC_KEY, BANNER_X25519_PRIVATE_KEY,
};
pub use pool::CaPool;
