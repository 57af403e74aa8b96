//! meshgate-core — node addresses, wire format, messages, identity, and configuration.
//! All other meshgate crates depend on this one.

pub mod address;
pub mod config;
pub mod identity;
pub mod message;
pub mod wire;

pub use address::{AddressError, NodeAddress};
pub use config::MeshgateConfig;
pub use identity::Identity;
pub use message::{
    ChunkAnswer, ChunkRequest, ErrorAnswer, ErrorCode, Message, RequestId, RequestMessage,
    ResponseMessage, Schema,
};
pub use wire::WireError;
