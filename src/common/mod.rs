//! Data types shared by the routing, protocol and actor layers.

mod bucket;
mod closest;
mod endpoint;
mod hash;
mod local_peer;
mod peer;
mod service;
mod values;

pub use bucket::*;
pub use closest::*;
pub use endpoint::*;
pub use hash::*;
pub use local_peer::*;
pub use peer::*;
pub use service::*;
pub use values::*;
