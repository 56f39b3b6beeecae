//! Encrypted workspace file sharing over a length-prefixed wire
//! protocol.
//!
//! A [Server] keeps per-workspace file areas, a membership ledger and
//! wrapped key records; a [Client] opens one authenticated TLS
//! connection and drives chunked uploads and downloads over it. The
//! workspace key never crosses the wire in the clear: it travels
//! RSA-wrapped per member, and files carry detached RSA signatures
//! verified against a local [KeyRing].

pub mod client;
pub mod crypto;
pub mod definitions;
pub mod server;
pub mod transfer;
pub mod transport;
pub mod wire;

mod error;

pub use client::{Client, KeyRing, TlsClient};
pub use error::Error;
pub use server::{Server, ServerState};
