//! meshgate-services — the bridge itself: transports, chunk streams,
//! server, client, and discovery.

pub mod client;
pub mod directory;
pub mod drain;
pub mod publisher;
pub mod server;
pub mod stream;
pub mod tcp;
pub mod transport;
pub mod upstream;

pub use client::{BridgeClient, ClientError, ClientOptions, FetchRequest, FetchResponse, ResponseHead, StreamingBody};
pub use directory::{Directory, DirectoryError, HttpDirectory, MemoryDirectory, PublishRecord};
pub use drain::{drain, DrainError, DrainOptions, DrainStats};
pub use publisher::{PublishError, Publisher, PublisherConfig};
pub use server::{BridgeServer, ExchangeState};
pub use stream::{BodyReader, StreamConfig, StreamError, StreamTable};
pub use tcp::{TcpQueryClient, TcpQueryListener};
pub use transport::{
    ConnectionId, LoopbackTransport, QueryContext, QueryHandler, QueryTransport, TransportError,
};
pub use upstream::{HttpUpstream, Upstream, UpstreamError, UpstreamRequest, UpstreamResponse};
