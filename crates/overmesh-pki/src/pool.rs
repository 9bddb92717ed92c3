//! CA trust pool.

use std::collections::{HashMap, HashSet};

use ed25519_dalek::VerifyingKey;

use crate::cert::MeshCertificate;
use crate::error::{PkiError, PkiResult};

/// The set of CA certificates a node trusts, plus a blocklist of revoked
/// node certificate fingerprints.
#[derive(Default)]
pub struct CaPool {
    cas: HashMap<String, MeshCertificate>,
    blocklist: HashSet<String>,
}

impl CaPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a pool from a PEM document holding one or more CA certificates
    pub fn from_pem(mut input: &str) -> PkiResult<Self> {
        let mut pool = Self::new();
        loop {
            let (cert, rest) = MeshCertificate::from_pem(input)?;
            pool.add_ca(cert)?;
            input = rest;
            if !input.contains("-----BEGIN") {
                break;
            }
        }
        Ok(pool)
    }

    /// Add a self-signed CA certificate, keyed by its fingerprint
    pub fn add_ca(&mut self, cert: MeshCertificate) -> PkiResult<()> {
        if !cert.details.is_ca {
            return Err(PkiError::NotACaCert);
        }
        let key = VerifyingKey::from_bytes(&cert.details.public_key)
            .map_err(|_| PkiError::InvalidSignature)?;
        cert.check_signature(&key)?;
        self.cas.insert(cert.fingerprint()?, cert);
        Ok(())
    }

    /// Add a node certificate fingerprint to the blocklist
    pub fn blocklist(&mut self, fingerprint: &str) {
        self.blocklist.insert(fingerprint.to_string());
    }

    pub fn ca_count(&self) -> usize {
        self.cas.len()
    }

    /// Look up the CA that issued a certificate
    pub fn get_ca(&self, cert: &MeshCertificate) -> PkiResult<&MeshCertificate> {
        self.cas
            .get(&cert.details.issuer)
            .ok_or_else(|| PkiError::UnknownIssuer(cert.details.issuer.clone()))
    }

    /// Full verification of a node certificate at time `now`:
    /// shape, blocklist, validity window, issuer known and unexpired,
    /// signature chains to the issuer.
    pub fn verify(&self, cert: &MeshCertificate, now: u64) -> PkiResult<()> {
        if cert.details.is_ca {
            return Err(PkiError::UnexpectedCaCert);
        }
        if self.blocklist.contains(&cert.fingerprint()?) {
            return Err(PkiError::CertBlocklisted);
        }
        cert.valid_at(now)?;

        let ca = self.get_ca(cert)?;
        if ca.expired(now) {
            return Err(PkiError::RootExpired);
        }
        let key = VerifyingKey::from_bytes(&ca.details.public_key)
            .map_err(|_| PkiError::InvalidSignature)?;
        cert.check_signature(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::{unix_now, CertDetails};
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    fn build_ca(now: u64) -> (SigningKey, MeshCertificate) {
        let key = SigningKey::generate(&mut OsRng);
        let details = CertDetails {
            name: "test ca".to_string(),
            ips: vec![],
            subnets: vec![],
            groups: vec![],
            not_before: now,
            not_after: now + 86400,
            public_key: key.verifying_key().to_bytes(),
            is_ca: true,
            issuer: String::new(),
        };
        let cert = MeshCertificate::sign(details, &key).unwrap();
        (key, cert)
    }

    fn build_node(ca_key: &SigningKey, ca: &MeshCertificate, now: u64, ttl: u64) -> MeshCertificate {
        let details = CertDetails {
            name: "node".to_string(),
            ips: vec!["10.128.0.2/24".parse().unwrap()],
            subnets: vec![],
            groups: vec![],
            not_before: now,
            not_after: now + ttl,
            public_key: [9u8; 32],
            is_ca: false,
            issuer: ca.fingerprint().unwrap(),
        };
        MeshCertificate::sign(details, ca_key).unwrap()
    }

    #[test]
    fn test_verify_good_cert() {
        let now = unix_now();
        let (ca_key, ca) = build_ca(now);
        let node = build_node(&ca_key, &ca, now, 3600);

        let mut pool = CaPool::new();
        pool.add_ca(ca).unwrap();
        pool.verify(&node, now + 10).unwrap();
    }

    #[test]
    fn test_verify_expired_cert() {
        let now = unix_now();
        let (ca_key, ca) = build_ca(now);
        let node = build_node(&ca_key, &ca, now, 60);

        let mut pool = CaPool::new();
        pool.add_ca(ca).unwrap();
        assert!(matches!(pool.verify(&node, now + 61), Err(PkiError::CertExpired)));
    }

    #[test]
    fn test_verify_unknown_issuer() {
        let now = unix_now();
        let (ca_key, ca) = build_ca(now);
        let node = build_node(&ca_key, &ca, now, 3600);

        let (_, other_ca) = build_ca(now);
        let mut pool = CaPool::new();
        pool.add_ca(other_ca).unwrap();
        assert!(matches!(
            pool.verify(&node, now),
            Err(PkiError::UnknownIssuer(_))
        ));
    }

    #[test]
    fn test_verify_blocklisted() {
        let now = unix_now();
        let (ca_key, ca) = build_ca(now);
        let node = build_node(&ca_key, &ca, now, 3600);

        let mut pool = CaPool::new();
        pool.add_ca(ca).unwrap();
        pool.blocklist(&node.fingerprint().unwrap());
        assert!(matches!(pool.verify(&node, now), Err(PkiError::CertBlocklisted)));
    }

    #[test]
    fn test_pool_from_pem() {
        let now = unix_now();
        let (_, ca1) = build_ca(now);
        let (_, ca2) = build_ca(now);
        let pem = format!("{}{}", ca1.to_pem().unwrap(), ca2.to_pem().unwrap());

        let pool = CaPool::from_pem(&pem).unwrap();
        assert_eq!(pool.ca_count(), 2);
    }

    #[test]
    fn test_node_cert_rejected_as_ca() {
        let now = unix_now();
        let (ca_key, ca) = build_ca(now);
        let node = build_node(&ca_key, &ca, now, 3600);

        let mut pool = CaPool::new();
        assert!(matches!(pool.add_ca(node), Err(PkiError::NotACaCert)));
    }
}
