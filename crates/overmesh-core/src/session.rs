//! Per-tunnel session state: AEAD keys, the outbound counter, replay
//! protection, and the queue of packets held while the handshake is
//! still in flight.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

use aes_gcm::Aes256Gcm;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::ChaCha20Poly1305;

use crate::error::{CoreError, CoreResult};
use crate::header::MessageType;

/// Default replay window width in packets
pub const REPLAY_WINDOW_SIZE: u64 = 1024;

/// Default cap on packets queued while a handshake is in flight
pub const DEFAULT_QUEUE_CAP: usize = 20;

/// Which AEAD seals tunnel traffic.
///
/// chachapoly keeps a little-endian wire counter for historical nonce
/// byte-order reasons; aes uses big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    Aes,
    ChaChaPoly,
}

impl CipherKind {
    pub fn counter_le(self) -> bool {
        matches!(self, CipherKind::ChaChaPoly)
    }

    pub fn from_name(name: &str) -> CoreResult<Self> {
        match name {
            "aes" => Ok(CipherKind::Aes),
            "chachapoly" => Ok(CipherKind::ChaChaPoly),
            other => Err(CoreError::ConfigInvalid(format!(
                "unknown cipher: {}",
                other
            ))),
        }
    }
}

enum SessionCipher {
    Aes(Box<Aes256Gcm>),
    ChaCha(Box<ChaCha20Poly1305>),
}

/// One direction's AEAD key, sealed to a cipher instance
pub struct SessionKey {
    cipher: SessionCipher,
    kind: CipherKind,
}

impl SessionKey {
    pub fn new(kind: CipherKind, key: &[u8; 32]) -> CoreResult<Self> {
        let cipher = match kind {
            CipherKind::Aes => SessionCipher::Aes(Box::new(
                Aes256Gcm::new_from_slice(key).map_err(|_| CoreError::DataDecryptFailed)?,
            )),
            CipherKind::ChaChaPoly => SessionCipher::ChaCha(Box::new(
                ChaCha20Poly1305::new_from_slice(key).map_err(|_| CoreError::DataDecryptFailed)?,
            )),
        };
        Ok(Self { cipher, kind })
    }

    fn nonce(&self, counter: u64) -> [u8; 12] {
        let mut n = [0u8; 12];
        if self.kind.counter_le() {
            n[4..].copy_from_slice(&counter.to_le_bytes());
        } else {
            n[4..].copy_from_slice(&counter.to_be_bytes());
        }
        n
    }

    /// Seal `plaintext` with the counter-derived nonce, binding `aad`
    pub fn encrypt(&self, counter: u64, aad: &[u8], plaintext: &[u8]) -> CoreResult<Vec<u8>> {
        let nonce = self.nonce(counter);
        let payload = Payload {
            msg: plaintext,
            aad,
        };
        match &self.cipher {
            SessionCipher::Aes(c) => c
                .encrypt(aes_gcm::Nonce::from_slice(&nonce), payload)
                .map_err(|_| CoreError::DataDecryptFailed),
            SessionCipher::ChaCha(c) => c
                .encrypt(chacha20poly1305::Nonce::from_slice(&nonce), payload)
                .map_err(|_| CoreError::DataDecryptFailed),
        }
    }

    /// Open `ciphertext`; authentication failure is an error, never a panic
    pub fn decrypt(&self, counter: u64, aad: &[u8], ciphertext: &[u8]) -> CoreResult<Vec<u8>> {
        let nonce = self.nonce(counter);
        let payload = Payload {
            msg: ciphertext,
            aad,
        };
        match &self.cipher {
            SessionCipher::Aes(c) => c
                .decrypt(aes_gcm::Nonce::from_slice(&nonce), payload)
                .map_err(|_| CoreError::DataDecryptFailed),
            SessionCipher::ChaCha(c) => c
                .decrypt(chacha20poly1305::Nonce::from_slice(&nonce), payload)
                .map_err(|_| CoreError::DataDecryptFailed),
        }
    }
}

/// Sliding bitmap over recently seen counters. A counter is accepted iff
/// it has not been observed before and is within the window of the
/// current maximum.
pub struct ReplayWindow {
    max: u64,
    bitmap: Vec<u64>,
    size: u64,
}

impl ReplayWindow {
    /// `size` is rounded up to a multiple of 64 bits
    pub fn new(size: u64) -> Self {
        let size = size.max(64).div_ceil(64) * 64;
        Self {
            max: 0,
            bitmap: vec![0; (size / 64) as usize],
            size,
        }
    }

    fn slot(&self, counter: u64) -> (usize, u64) {
        let bit = counter % self.size;
        ((bit / 64) as usize, bit % 64)
    }

    /// Would this counter be accepted? Does not mutate.
    pub fn check(&self, counter: u64) -> bool {
        if counter == 0 {
            // counter 0 is reserved as "never sent"
            return false;
        }
        if counter > self.max {
            return true;
        }
        if self.max - counter >= self.size {
            return false;
        }
        let (block, bit) = self.slot(counter);
        self.bitmap[block] & (1 << bit) == 0
    }

    /// Record a counter; returns false if it should have been rejected
    pub fn update(&mut self, counter: u64) -> bool {
        if !self.check(counter) {
            return false;
        }
        if counter > self.max {
            // Zero the blocks the window skipped over
            let blocks = self.bitmap.len() as u64;
            let cur_block = self.max / 64;
            let new_block = counter / 64;
            let diff = new_block - cur_block;
            if diff >= blocks {
                self.bitmap.iter_mut().for_each(|b| *b = 0);
            } else {
                for i in 1..=diff {
                    let idx = ((cur_block + i) % blocks) as usize;
                    self.bitmap[idx] = 0;
                }
            }
            self.max = counter;
        }
        let (block, bit) = self.slot(counter);
        self.bitmap[block] |= 1 << bit;
        true
    }
}

/// A packet held back while the tunnel handshake completes
#[derive(Debug, Clone)]
pub struct CachedPacket {
    pub typ: MessageType,
    pub subtype: u8,
    pub payload: Vec<u8>,
}

/// Shared state of one tunnel's crypto session.
///
/// Keys are write-once; the outbound counter is a plain atomic add; the
/// replay window has its own lock (contention is per-tunnel); the packet
/// queue lock doubles as the gate that keeps new packets from slipping
/// past a concurrent drain when the session flips to ready.
pub struct ConnectionState {
    initiator: bool,
    kind: CipherKind,
    ready: AtomicBool,
    ekey: OnceLock<SessionKey>,
    dkey: OnceLock<SessionKey>,
    counter: AtomicU64,
    window: Mutex<ReplayWindow>,
    queue: Mutex<VecDeque<CachedPacket>>,
    queue_cap: usize,
}

impl ConnectionState {
    pub fn new(initiator: bool, kind: CipherKind, queue_cap: usize) -> Self {
        Self {
            initiator,
            kind,
            ready: AtomicBool::new(false),
            ekey: OnceLock::new(),
            dkey: OnceLock::new(),
            counter: AtomicU64::new(0),
            window: Mutex::new(ReplayWindow::new(REPLAY_WINDOW_SIZE)),
            queue: Mutex::new(VecDeque::new()),
            queue_cap,
        }
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn cipher_kind(&self) -> CipherKind {
        self.kind
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Install the session keys. May only happen once per session.
    pub fn set_keys(&self, ekey: SessionKey, dkey: SessionKey) -> CoreResult<()> {
        self.ekey
            .set(ekey)
            .map_err(|_| CoreError::TunnelNotReady)?;
        self.dkey
            .set(dkey)
            .map_err(|_| CoreError::TunnelNotReady)?;
        Ok(())
    }

    /// Flip to ready. Both keys must be installed first.
    pub fn mark_ready(&self) -> CoreResult<()> {
        if self.ekey.get().is_none() || self.dkey.get().is_none() {
            return Err(CoreError::TunnelNotReady);
        }
        self.ready.store(true, Ordering::Release);
        Ok(())
    }

    /// Claim the next outbound counter (starts at 1; 0 means never sent)
    pub fn next_counter(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Last counter handed out
    pub fn message_counter(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }

    /// Seal an outbound payload under the send key
    pub fn encrypt(&self, counter: u64, aad: &[u8], plaintext: &[u8]) -> CoreResult<Vec<u8>> {
        let key = self.ekey.get().ok_or(CoreError::TunnelNotReady)?;
        key.encrypt(counter, aad, plaintext)
    }

    /// Open an inbound payload: replay pre-check, decrypt, window update.
    /// Both failures drop silently at the call site; replays never
    /// produce a response to the peer.
    pub fn decrypt(&self, counter: u64, aad: &[u8], ciphertext: &[u8]) -> CoreResult<Vec<u8>> {
        let key = self.dkey.get().ok_or(CoreError::TunnelNotReady)?;
        if !self.window.lock().unwrap().check(counter) {
            return Err(CoreError::DataDecryptFailed);
        }
        let plaintext = key.decrypt(counter, aad, ciphertext)?;
        if !self.window.lock().unwrap().update(counter) {
            return Err(CoreError::DataDecryptFailed);
        }
        Ok(plaintext)
    }

    /// Queue a packet while the handshake is in flight. Re-checks
    /// readiness under the queue lock so a packet cannot be stranded by
    /// a concurrent drain; returns false if the session flipped to ready
    /// and the caller should just send.
    pub fn queue_packet(&self, packet: CachedPacket, dropped: &AtomicU64) -> bool {
        let mut queue = self.queue.lock().unwrap();
        if self.is_ready() {
            return false;
        }
        if queue.len() >= self.queue_cap {
            queue.pop_front();
            dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(packet);
        true
    }

    /// Drain the held packets, marking the session ready under the same
    /// lock so no new packet lands in the queue afterwards.
    pub fn ready_and_drain(&self) -> CoreResult<Vec<CachedPacket>> {
        let mut queue = self.queue.lock().unwrap();
        self.mark_ready()?;
        Ok(queue.drain(..).collect())
    }
}
