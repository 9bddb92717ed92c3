//! The overmesh core: tunnel state, handshakes, peer discovery, relays,
//! and the encrypted packet pipeline.
//!
//! The pieces compose around [`interface::Interface`]: packets read from
//! the TUN device flow through the firewall and out as AEAD-sealed UDP
//! datagrams ([`outbound`]); datagrams received from the underlay are
//! decoded, decrypted, filtered and written back to the TUN device
//! ([`inbound`]). The [`handshake_manager`] drives tunnel establishment
//! off a timer wheel, the [`connection_manager`] evicts dead tunnels, the
//! [`lighthouse`] trades underlay addresses, and the [`relay_manager`]
//! threads tunnels through a third peer when no direct path exists.

pub mod config;
pub mod connection_manager;
pub mod control;
pub mod error;
pub mod firewall;
pub mod handshake;
pub mod handshake_manager;
pub mod header;
pub mod hostmap;
pub mod interface;
pub mod lighthouse;
pub mod metrics;
pub mod punchy;
pub mod relay_manager;
pub mod remote_list;
pub mod session;
pub mod timer_wheel;

mod inbound;
mod outbound;

pub use error::{CoreError, CoreResult};
pub use interface::{CertState, EncWriter, Interface};
