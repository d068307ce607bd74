//! Network data model and non-blocking socket engines.

pub mod endpoint;
pub mod node;
pub mod stream;
pub mod udp;

pub use endpoint::{NetworkEndpoint, NetworkEndpointFactory};
pub use node::NetworkNode;
pub use stream::{connect_tcp, connect_unix, server_tcp, server_unix, StreamSocket, StreamState};
pub use udp::UdpSocket;
