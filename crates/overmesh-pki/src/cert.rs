//! Node and CA certificates.
//!
//! A certificate binds a name and a set of overlay addresses, subnets and
//! groups to a public key for a validity window. Node certificates carry
//! an X25519 key (the static key of the tunnel handshake); CA certificates
//! carry the Ed25519 verifying key that signs node certificates.

use std::net::Ipv4Addr;
use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;

use crate::error::{PkiError, PkiResult};
use crate::pem::{decode_pem, encode_pem, BANNER_CERTIFICATE};

/// Seconds since the unix epoch, the time base for certificate validity
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// The signed portion of a certificate
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CertDetails {
    /// Common name of the holder
    pub name: String,
    /// Overlay addresses owned by the holder (node certs carry exactly one)
    pub ips: Vec<Ipv4Net>,
    /// Routable subnets behind the holder
    pub subnets: Vec<Ipv4Net>,
    /// Group memberships, matched by firewall rules
    pub groups: Vec<String>,
    /// Validity window start, unix seconds
    pub not_before: u64,
    /// Validity window end, unix seconds
    pub not_after: u64,
    /// X25519 public key for nodes, Ed25519 verifying key for CAs
    pub public_key: [u8; 32],
    /// Whether this certificate is a signing authority
    pub is_ca: bool,
    /// Hex fingerprint of the issuing CA certificate (empty for CAs)
    pub issuer: String,
}

/// A certificate plus the Ed25519 signature over its details
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MeshCertificate {
    pub details: CertDetails,
    #[serde(with = "BigArray")]
    pub signature: [u8; 64],
}

impl MeshCertificate {
    /// Deterministic encoding of the details, the exact bytes that get signed
    pub fn signing_bytes(details: &CertDetails) -> PkiResult<Vec<u8>> {
        bincode::serialize(details).map_err(|e| PkiError::Encoding(e.to_string()))
    }

    /// Build and sign a certificate with the given CA signing key
    pub fn sign(details: CertDetails, key: &SigningKey) -> PkiResult<Self> {
        let raw = Self::signing_bytes(&details)?;
        let signature = key.sign(&raw);
        Ok(Self {
            details,
            signature: signature.to_bytes(),
        })
    }

    /// Verify the signature against an Ed25519 verifying key
    pub fn check_signature(&self, key: &VerifyingKey) -> PkiResult<()> {
        let raw = Self::signing_bytes(&self.details)?;
        let sig = Signature::from_bytes(&self.signature);
        key.verify(&raw, &sig).map_err(|_| PkiError::InvalidSignature)
    }

    /// Whether the validity window has closed as of `now`
    pub fn expired(&self, now: u64) -> bool {
        now > self.details.not_after
    }

    /// Whether `now` falls inside the validity window
    pub fn valid_at(&self, now: u64) -> PkiResult<()> {
        if now < self.details.not_before {
            return Err(PkiError::CertNotYetValid);
        }
        if self.expired(now) {
            return Err(PkiError::CertExpired);
        }
        Ok(())
    }

    /// The single overlay address a node certificate must carry
    pub fn overlay_addr(&self) -> PkiResult<Ipv4Addr> {
        match self.details.ips.first() {
            Some(net) if self.details.ips.len() == 1 => Ok(net.addr()),
            _ => Err(PkiError::NoOverlayAddress),
        }
    }

    /// The overlay network of a node certificate
    pub fn overlay_net(&self) -> PkiResult<Ipv4Net> {
        self.details
            .ips
            .first()
            .copied()
            .filter(|_| self.details.ips.len() == 1)
            .ok_or(PkiError::NoOverlayAddress)
    }

    /// Hex BLAKE3 fingerprint over the full encoded certificate
    pub fn fingerprint(&self) -> PkiResult<String> {
        let raw = self.to_bytes()?;
        Ok(hex_encode(blake3::hash(&raw).as_bytes()))
    }

    /// Encode to raw bytes
    pub fn to_bytes(&self) -> PkiResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| PkiError::Encoding(e.to_string()))
    }

    /// Decode from raw bytes
    pub fn from_bytes(raw: &[u8]) -> PkiResult<Self> {
        bincode::deserialize(raw).map_err(|e| PkiError::Encoding(e.to_string()))
    }

    /// Encode to a PEM block
    pub fn to_pem(&self) -> PkiResult<String> {
        Ok(encode_pem(BANNER_CERTIFICATE, &self.to_bytes()?))
    }

    /// Decode the first certificate in a PEM document, returning the rest
    pub fn from_pem(input: &str) -> PkiResult<(Self, &str)> {
        let (raw, rest) = decode_pem(BANNER_CERTIFICATE, input)?;
        Ok((Self::from_bytes(&raw)?, rest))
    }

    /// Check that an X25519 private key matches this certificate's public key
    pub fn verify_private_key(&self, key: &x25519_dalek::StaticSecret) -> PkiResult<()> {
        let public = x25519_dalek::PublicKey::from(key);
        if public.as_bytes() != &self.details.public_key {
            return Err(PkiError::KeyMismatch);
        }
        Ok(())
    }
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
