#![doc = include_str!("../README.md")]
//! ## Feature flags
#![doc = document_features::document_features!()]
//!

// Public modules
pub mod actor;
pub mod common;
pub mod protocol;

#[cfg(feature = "async")]
pub mod async_dht;
mod dht;
mod error;

pub use actor::{
    Actor, BroadcastEvent, Config, FindPeerResult, GetValueResult, Info, MemoryNetwork,
    MemoryTransport, TouchResult, Transport, UdpTransport, DEFAULT_PORT,
};
pub use common::{
    ActiveResult, Endpoint, Hash, NatType, PeerInfo, Protocol, ServiceRole, WHOLE_TABLE_KEY,
};
pub use dht::{Dht, DhtBuilder, DhtWasShutdown, ServiceDht, Testnet};
pub use error::{Error, Result, ResultCode};
