//! Torrentium Core - Shared types, protocols, and utilities
//!
//! This crate provides the fundamental building blocks for the Torrentium
//! peer-to-peer content distribution engine.

pub mod chunk;
pub mod error;
pub mod proto;
pub mod rpc;
pub mod tcp;
pub mod transport;
pub mod types;

pub use error::{Error, Result};
pub use tcp::TcpHost;
pub use transport::{memory::MemoryNetwork, Host, HostEvent, PeerStream};
pub use types::*;

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Default chunk size: 256 KB
pub const CHUNK_SIZE: usize = 256 * 1024;
