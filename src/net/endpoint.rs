//! Application-facing connection callbacks.
//!
//! Grounded on `original_source/include/libnetworkd/Network.hpp`'s
//! `NetworkEndpoint`/`NetworkEndpointFactory`. `connectionLost`'s default
//! implementation forwarding to `connectionClosed` is kept verbatim; the
//! open question of whether the pre-close state should be visible to these
//! callbacks is resolved in SPEC_FULL.md (snapshot it before dispatch).

use crate::net::node::NetworkNode;

/// One side of an established (or being-established) connection.
///
/// Implemented manually for a connection initiated locally (`connect`), or
/// manufactured by a [`NetworkEndpointFactory`] for one accepted by a server
/// socket.
pub trait NetworkEndpoint {
    /// Data arrived on the connection. Always called with at least one byte.
    fn data_read(&mut self, buffer: &[u8]);

    /// A previously buffered send finished reaching the kernel. Default is a
    /// no-op, matching the original.
    fn data_sent(&mut self, _length: u32) {}

    /// The connection finished its handshake (TCP connect, or a UNIX/accept
    /// that has nothing to negotiate). `local` is `None` when the local
    /// address couldn't be determined (e.g. `getsockname` failed).
    fn connection_established(&mut self, _remote: Option<&NetworkNode>, _local: Option<&NetworkNode>) {}

    /// The connection was closed in an orderly way (local `close()`, or a
    /// clean remote FIN with no buffered output left).
    fn connection_closed(&mut self) {}

    /// The connection died unexpectedly (RST, a poll error, a failed
    /// connect). Default forwards to `connection_closed`, matching the
    /// original; override to distinguish the two.
    fn connection_lost(&mut self) {
        self.connection_closed();
    }
}

/// Manufactures one [`NetworkEndpoint`] per accepted connection on a server
/// socket.
pub trait NetworkEndpointFactory {
    fn create_endpoint(&mut self) -> Box<dyn NetworkEndpoint>;

    /// Called once the connection backing `endpoint` has fully torn down.
    /// The default just drops it; override for pooling or bookkeeping.
    fn destroy_endpoint(&mut self, _endpoint: Box<dyn NetworkEndpoint>) {}
}
