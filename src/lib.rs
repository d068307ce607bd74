//! A single-threaded, event-driven runtime for POSIX network daemons:
//! a `poll(2)` reactor, a timeout wheel, non-blocking TCP/UNIX/UDP sockets,
//! a DNS resolver (synchronous and asynchronous), a SOCKS5 proxied dialer,
//! and a publish/subscribe event bus.
//!
//! ## Usage
//!
//! ```toml
//! [dependencies]
//! netskel = "0.1"
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! use netskel::net::{NetworkEndpoint, NetworkEndpointFactory, NetworkNode};
//! use netskel::reactor::Reactor;
//!
//! struct Echo;
//!
//! impl NetworkEndpoint for Echo {
//!     fn data_read(&mut self, buffer: &[u8]) {
//!         println!("got {} bytes", buffer.len());
//!     }
//! }
//!
//! struct EchoFactory;
//!
//! impl NetworkEndpointFactory for EchoFactory {
//!     fn create_endpoint(&mut self) -> Box<dyn NetworkEndpoint> {
//!         Box::new(Echo)
//!     }
//! }
//!
//! let mut reactor = Reactor::new();
//! let factory: Rc<RefCell<dyn NetworkEndpointFactory>> = Rc::new(RefCell::new(EchoFactory));
//! let local = NetworkNode::new("127.0.0.1", 9000);
//! let _server = netskel::net::server_tcp(&mut reactor, &local, factory, 128).unwrap();
//!
//! loop {
//!     reactor.step(1000).unwrap();
//! }
//! ```

pub mod config;
pub mod dns;
pub mod error;
pub mod event;
pub mod log_sink;
pub mod module;
pub mod net;
pub mod reactor;
pub mod socks5;
pub mod timer;

pub use config::Configuration;
pub use dns::{AsyncResolver, NameResolver, NameResolvingFacility, ResolutionStatus, SyncResolver};
pub use error::{SetupError, Socks5Error};
pub use event::{Event, EventBus, EventSubscriber, Uid};
pub use log_sink::{LogLevel, LogSink};
pub use module::Module;
pub use net::{NetworkEndpoint, NetworkEndpointFactory, NetworkNode, StreamSocket, StreamState, UdpSocket};
pub use reactor::{Hint, Reactor, SocketHandle, Source};
pub use socks5::{connect_socks5, ProxiedStream, ProxyAddress, ProxyPool};
pub use timer::{TimerHandle, TimerWheel};
