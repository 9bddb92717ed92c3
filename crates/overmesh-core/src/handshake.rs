//! Tunnel establishment handshake.
//!
//! Two messages bring a tunnel up. The initiator's hello carries a fresh
//! X25519 ephemeral, its certificate, and the tunnel index it picked; the
//! responder's reply carries its own ephemeral and certificate encrypted
//! under the ephemeral-ephemeral secret, plus both tunnel indices.
//! Session keys mix the ephemeral-ephemeral and static-static secrets, so
//! a peer must hold the private key its certificate names to ever read
//! traffic. Certificates ride in the handshake itself; verification
//! against the CA pool happens in the handshake manager.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};

use overmesh_pki::MeshCertificate;

use crate::error::{CoreError, CoreResult};
use crate::session::{CipherKind, SessionKey};

/// Handshake format version
pub const HANDSHAKE_VERSION: u8 = 1;

// Accepted clock skew for the hello timestamp
const MAX_CLOCK_AHEAD: u64 = 60;
const MAX_CLOCK_BEHIND: u64 = 120;

/// The initiator's first message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeHello {
    pub version: u8,
    pub ephemeral_pubkey: [u8; 32],
    pub timestamp: u64,
    pub nonce: [u8; 16],
    /// bincode [`HelloPayload`], integrity-protected by `mac`
    pub payload: Vec<u8>,
    pub mac: [u8; 16],
}

/// The responder's reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeReply {
    pub ephemeral_pubkey: [u8; 32],
    /// bincode [`ReplyPayload`] sealed under the ephemeral-ephemeral key
    pub encrypted_payload: Vec<u8>,
    pub mac: [u8; 16],
}

#[derive(Serialize, Deserialize)]
struct HelloPayload {
    cert: Vec<u8>,
    initiator_index: u32,
}

#[derive(Serialize, Deserialize)]
struct ReplyPayload {
    cert: Vec<u8>,
    initiator_index: u32,
    responder_index: u32,
}

/// Everything a completed handshake yields
pub struct HandshakeOutcome {
    pub send: SessionKey,
    pub recv: SessionKey,
    pub peer_cert: MeshCertificate,
    pub peer_cert_raw: Vec<u8>,
    pub initiator_index: u32,
    pub responder_index: u32,
}

/// A verified, decoded hello, ready for the responder to answer
pub struct ParsedHello {
    hello: HandshakeHello,
    pub peer_cert: MeshCertificate,
    pub peer_cert_raw: Vec<u8>,
    pub initiator_index: u32,
}

/// Initiator side: lives in the pending tunnel's connection state until
/// the reply arrives.
pub struct InitiatorHandshake {
    static_key: Arc<StaticSecret>,
    ephemeral: StaticSecret,
    ephemeral_pub: PublicKey,
    timestamp: u64,
}

impl InitiatorHandshake {
    pub fn new(static_key: Arc<StaticSecret>) -> Self {
        let ephemeral = StaticSecret::random_from_rng(OsRng);
        let ephemeral_pub = PublicKey::from(&ephemeral);
        Self {
            static_key,
            ephemeral,
            ephemeral_pub,
            timestamp: unix_now(),
        }
    }

    /// Build the hello message bytes
    pub fn create_hello(&self, cert_raw: &[u8], initiator_index: u32) -> CoreResult<Vec<u8>> {
        let payload = encode(&HelloPayload {
            cert: cert_raw.to_vec(),
            initiator_index,
        })?;

        let mut nonce = [0u8; 16];
        OsRng.fill_bytes(&mut nonce);

        let mac = compute_mac(
            self.ephemeral_pub.as_bytes(),
            &[
                &[HANDSHAKE_VERSION],
                self.ephemeral_pub.as_bytes(),
                &self.timestamp.to_be_bytes(),
                &nonce,
                &payload,
            ],
        );

        encode(&HandshakeHello {
            version: HANDSHAKE_VERSION,
            ephemeral_pubkey: self.ephemeral_pub.to_bytes(),
            timestamp: self.timestamp,
            nonce,
            payload,
            mac,
        })
    }

    /// Authenticate the reply and derive the session
    pub fn process_reply(&self, data: &[u8], kind: CipherKind) -> CoreResult<HandshakeOutcome> {
        let reply: HandshakeReply = decode(data)?;

        let responder_ephemeral = PublicKey::from(reply.ephemeral_pubkey);
        let ee = self.ephemeral.diffie_hellman(&responder_ephemeral);
        let reply_keys = ReplyKeys::derive(&ee);

        let expected = compute_mac(
            &reply_keys.mac_key,
            &[&reply.ephemeral_pubkey, &reply.encrypted_payload],
        );
        if expected != reply.mac {
            return Err(CoreError::HandshakeDecryptFailed);
        }

        let payload_raw = reply_keys.open(&reply.encrypted_payload)?;
        let payload: ReplyPayload = decode(&payload_raw)?;
        let peer_cert = MeshCertificate::from_bytes(&payload.cert)
            .map_err(|_| CoreError::HandshakeDecryptFailed)?;

        let peer_static = PublicKey::from(peer_cert.details.public_key);
        let ss = self.static_key.diffie_hellman(&peer_static);
        let (forward, backward) = derive_session_keys(&ee, &ss);

        Ok(HandshakeOutcome {
            send: SessionKey::new(kind, &forward)?,
            recv: SessionKey::new(kind, &backward)?,
            peer_cert,
            peer_cert_raw: payload.cert,
            initiator_index: payload.initiator_index,
            responder_index: payload.responder_index,
        })
    }
}

/// Decode and authenticate a hello as the responder.
///
/// A hello outside the clock-skew window is treated as a replayed
/// handshake and never answered.
pub fn read_hello(data: &[u8], now: u64) -> CoreResult<ParsedHello> {
    let hello: HandshakeHello = decode(data)?;

    if hello.version != HANDSHAKE_VERSION {
        return Err(CoreError::HandshakeDecryptFailed);
    }
    if hello.timestamp > now + MAX_CLOCK_AHEAD || hello.timestamp + MAX_CLOCK_BEHIND < now {
        return Err(CoreError::HandshakeReplay);
    }

    let expected = compute_mac(
        &hello.ephemeral_pubkey,
        &[
            &[hello.version],
            &hello.ephemeral_pubkey,
            &hello.timestamp.to_be_bytes(),
            &hello.nonce,
            &hello.payload,
        ],
    );
    if expected != hello.mac {
        return Err(CoreError::HandshakeDecryptFailed);
    }

    let payload: HelloPayload = decode(&hello.payload)?;
    let peer_cert = MeshCertificate::from_bytes(&payload.cert)
        .map_err(|_| CoreError::HandshakeDecryptFailed)?;

    Ok(ParsedHello {
        hello,
        peer_cert,
        peer_cert_raw: payload.cert,
        initiator_index: payload.initiator_index,
    })
}

/// Responder side: answer a verified hello, deriving the session in one
/// step. Returns the reply bytes to put on the wire and the outcome.
pub fn respond(
    static_key: &StaticSecret,
    our_cert_raw: &[u8],
    parsed: &ParsedHello,
    responder_index: u32,
    kind: CipherKind,
) -> CoreResult<(Vec<u8>, HandshakeOutcome)> {
    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let ephemeral_pub = PublicKey::from(&ephemeral);

    let initiator_ephemeral = PublicKey::from(parsed.hello.ephemeral_pubkey);
    let ee = ephemeral.diffie_hellman(&initiator_ephemeral);
    let reply_keys = ReplyKeys::derive(&ee);

    let payload_raw = encode(&ReplyPayload {
        cert: our_cert_raw.to_vec(),
        initiator_index: parsed.initiator_index,
        responder_index,
    })?;
    let encrypted_payload = reply_keys.seal(&payload_raw)?;

    let mac = compute_mac(
        &reply_keys.mac_key,
        &[ephemeral_pub.as_bytes(), &encrypted_payload],
    );

    let reply_bytes = encode(&HandshakeReply {
        ephemeral_pubkey: ephemeral_pub.to_bytes(),
        encrypted_payload,
        mac,
    })?;

    let peer_static = PublicKey::from(parsed.peer_cert.details.public_key);
    let ss = static_key.diffie_hellman(&peer_static);
    let (forward, backward) = derive_session_keys(&ee, &ss);

    let outcome = HandshakeOutcome {
        // The responder receives on the forward direction
        send: SessionKey::new(kind, &backward)?,
        recv: SessionKey::new(kind, &forward)?,
        peer_cert: parsed.peer_cert.clone(),
        peer_cert_raw: parsed.peer_cert_raw.clone(),
        initiator_index: parsed.initiator_index,
        responder_index,
    };
    Ok((reply_bytes, outcome))
}

/// Keys protecting the reply message itself, before statics enter the mix
struct ReplyKeys {
    enc_key: [u8; 32],
    mac_key: [u8; 32],
    nonce: [u8; 12],
}

impl ReplyKeys {
    fn derive(ee: &SharedSecret) -> Self {
        let hk = Hkdf::<Sha256>::new(Some(b"overmesh:handshake:reply"), ee.as_bytes());
        let mut enc_key = [0u8; 32];
        let mut mac_key = [0u8; 32];
        let mut nonce = [0u8; 12];
        hk.expand(b"enc", &mut enc_key).expect("hkdf expand");
        hk.expand(b"mac", &mut mac_key).expect("hkdf expand");
        hk.expand(b"nonce", &mut nonce).expect("hkdf expand");
        Self {
            enc_key,
            mac_key,
            nonce,
        }
    }

    fn seal(&self, plaintext: &[u8]) -> CoreResult<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new_from_slice(&self.enc_key)
            .map_err(|_| CoreError::HandshakeDecryptFailed)?;
        cipher
            .encrypt(chacha20poly1305::Nonce::from_slice(&self.nonce), plaintext)
            .map_err(|_| CoreError::HandshakeDecryptFailed)
    }

    fn open(&self, ciphertext: &[u8]) -> CoreResult<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new_from_slice(&self.enc_key)
            .map_err(|_| CoreError::HandshakeDecryptFailed)?;
        cipher
            .decrypt(chacha20poly1305::Nonce::from_slice(&self.nonce), ciphertext)
            .map_err(|_| CoreError::HandshakeDecryptFailed)
    }
}

/// Mix both secrets into the per-direction session keys
fn derive_session_keys(ee: &SharedSecret, ss: &SharedSecret) -> ([u8; 32], [u8; 32]) {
    let mut ikm = [0u8; 64];
    ikm[..32].copy_from_slice(ee.as_bytes());
    ikm[32..].copy_from_slice(ss.as_bytes());

    let hk = Hkdf::<Sha256>::new(Some(b"overmesh:session"), &ikm);
    let mut forward = [0u8; 32];
    let mut backward = [0u8; 32];
    hk.expand(b"initiator to responder", &mut forward)
        .expect("hkdf expand");
    hk.expand(b"responder to initiator", &mut backward)
        .expect("hkdf expand");
    (forward, backward)
}

/// Keyed BLAKE3 MAC truncated to 16 bytes
fn compute_mac(key: &[u8], parts: &[&[u8]]) -> [u8; 16] {
    let mut padded = [0u8; 32];
    let len = key.len().min(32);
    padded[..len].copy_from_slice(&key[..len]);

    let mut hasher = blake3::Hasher::new_keyed(&padded);
    for part in parts {
        hasher.update(part);
    }
    let hash = hasher.finalize();
    let mut mac = [0u8; 16];
    mac.copy_from_slice(&hash.as_bytes()[..16]);
    mac
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn encode<T: Serialize>(value: &T) -> CoreResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| CoreError::Encoding(e.to_string()))
}

fn decode<'a, T: Deserialize<'a>>(data: &'a [u8]) -> CoreResult<T> {
    bincode::deserialize(data).map_err(|e| CoreError::Encoding(e.to_string()))
}
