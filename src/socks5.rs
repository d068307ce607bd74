//! SOCKS5 proxied dialer.
//!
//! Grounded on `original_source/src/ProxiedTcpSocket.cpp`: a stream socket
//! that intercepts its own callbacks to run the method-selection and
//! CONNECT handshake, then "pivots" by forwarding everything to the caller's
//! real endpoint (SPEC_FULL.md §4.6).
//!
//! The original solves the pivot by inheritance: `ProxiedTcpSocket` IS a
//! `TcpSocket`, so `send()` during negotiation is just a same-object method
//! call. A trait object endpoint here has no `&mut Reactor` in its callback
//! signature, so that shortcut isn't available; `ProxiedStream` is instead
//! its own top-level [`Source`], directly registered with the reactor on its
//! own raw socket, exactly the way the original registers itself with
//! `IOManager`. Negotiation frames are sent with the same
//! [`crate::net::stream::send_no_sigpipe`] helper plain stream sockets use.

use std::io;
use std::net::Ipv4Addr;
use std::os::unix::io::{AsRawFd, RawFd};

use socket2::{Domain, SockAddr, Socket as RawSocket, Type};
use tracing::{debug, trace, warn};

use crate::error::{SetupError, Socks5Error};
use crate::net::endpoint::NetworkEndpoint;
use crate::net::node::NetworkNode;
use crate::net::stream::send_no_sigpipe;
use crate::reactor::{Hint, Reactor, SocketHandle, Source};

const READ_BUFFER: usize = 4096;
const CONNECT_REPLY_HEADER: usize = 10;

/// Negotiation phase (SPEC_FULL.md §4.6 phase table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitGreeting,
    AwaitUserAuth,
    SendConnect,
    AwaitConnect,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Connecting,
    Idle,
    Buffering,
    Down,
}

impl State {
    fn hint(self) -> Hint {
        match self {
            State::Down => Hint::Ignore,
            State::Idle => Hint::Idle,
            State::Connecting | State::Buffering => Hint::Buffering,
        }
    }
}

/// Username/password credential for SOCKS5 user/pass sub-negotiation.
#[derive(Debug, Clone)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

/// A stream socket connected to a SOCKS5 proxy, negotiating on the caller's
/// behalf before pivoting to `final_endpoint`.
pub struct ProxiedStream {
    socket: Option<RawSocket>,
    out: Vec<u8>,
    input: Vec<u8>,
    phase: Phase,
    state: State,
    target: NetworkNode,
    credential: Option<Credential>,
    final_endpoint: Box<dyn NetworkEndpoint>,
}

impl ProxiedStream {
    fn fd(&self) -> RawFd {
        self.socket.as_ref().map(|s| s.as_raw_fd()).unwrap_or(-1)
    }

    /// Queue negotiation or post-pivot payload for sending. Identical
    /// buffering discipline to `StreamSocket::send`.
    pub fn send(&mut self, data: &[u8]) {
        match self.state {
            State::Idle => {
                let socket = match &self.socket {
                    Some(s) => s,
                    None => return,
                };
                match send_no_sigpipe(socket, data) {
                    Ok(sent) if sent == data.len() => {}
                    Ok(sent) => {
                        self.state = State::Buffering;
                        self.out.extend_from_slice(&data[sent..]);
                    }
                    Err(err)
                        if err.kind() == io::ErrorKind::WouldBlock
                            || err.raw_os_error() == Some(libc::EINTR) =>
                    {
                        self.state = State::Buffering;
                        self.out.extend_from_slice(data);
                    }
                    Err(err) => {
                        trace!(error = %err, "proxied send failed outside would-block/eintr");
                    }
                }
            }
            State::Buffering | State::Connecting => {
                self.out.extend_from_slice(data);
            }
            State::Down => {}
        }
    }

    fn queue(&mut self, frame: Vec<u8>) {
        match self.state {
            State::Idle => self.send(&frame),
            _ => self.out.extend_from_slice(&frame),
        }
    }

    fn begin_negotiation(&mut self) {
        self.phase = Phase::AwaitGreeting;
        // no-auth (0x00) and user/pass (0x02) offered, per the phase table.
        self.queue(vec![0x05, 0x02, 0x00, 0x02]);
    }

    fn send_user_auth(&mut self) -> bool {
        let credential = match &self.credential {
            Some(c) => c.clone(),
            None => return false,
        };
        let mut frame = vec![0x01, credential.username.len() as u8];
        frame.extend_from_slice(credential.username.as_bytes());
        frame.push(credential.password.len() as u8);
        frame.extend_from_slice(credential.password.as_bytes());
        self.phase = Phase::AwaitUserAuth;
        self.queue(frame);
        true
    }

    fn send_connect(&mut self) {
        let addr: Ipv4Addr = self
            .target
            .name
            .parse()
            .unwrap_or(Ipv4Addr::UNSPECIFIED);
        let mut frame = vec![0x05, 0x01, 0x00, 0x01];
        frame.extend_from_slice(&addr.octets());
        frame.extend_from_slice(&self.target.port.to_be_bytes());
        self.phase = Phase::AwaitConnect;
        self.queue(frame);
    }

    fn pivot(&mut self, bound: Option<NetworkNode>, trailing: &[u8]) {
        self.phase = Phase::Done;
        self.final_endpoint
            .connection_established(Some(&self.target.clone()), bound.as_ref());
        if !trailing.is_empty() {
            self.final_endpoint.data_read(trailing);
        }
    }

    /// Log the specific protocol failure and tear down via the usual
    /// `connection_lost` path — all SOCKS5 negotiation failures still
    /// collapse to `connection_lost` at the endpoint boundary (§7), but the
    /// `Socks5Error` gives the log line a concrete, matchable cause.
    fn teardown_protocol_error(&mut self, reactor: &mut Reactor, handle: SocketHandle, err: Socks5Error) {
        warn!(error = %err, "SOCKS5 negotiation failed");
        self.teardown(reactor, handle, true);
    }

    fn teardown(&mut self, reactor: &mut Reactor, handle: SocketHandle, lost: bool) {
        self.socket = None;
        self.state = State::Down;
        reactor.unregister(handle);

        // always forwarded regardless of negotiation phase, mirroring
        // `ProxiedTcpSocket::connectionLost`/`connectionClosed` always
        // checking `m_finalClientEndpoint`.
        if lost {
            self.final_endpoint.connection_lost();
        } else {
            self.final_endpoint.connection_closed();
        }
    }

    /// Consume input bytes the negotiation phases need, returning whatever
    /// the current phase couldn't use yet.
    fn advance(&mut self, reactor: &mut Reactor, handle: SocketHandle) {
        loop {
            match self.phase {
                Phase::AwaitGreeting => {
                    if self.input.len() < 2 {
                        return;
                    }
                    let version = self.input[0];
                    let method = self.input[1];
                    self.input.drain(0..2);

                    if version != 0x05 {
                        self.teardown_protocol_error(reactor, handle, Socks5Error::BadVersion(version));
                        return;
                    }

                    let usable_credential = self
                        .credential
                        .as_ref()
                        .is_some_and(|c| !c.username.is_empty() && !c.password.is_empty());

                    match method {
                        0x00 => self.send_connect(),
                        0x02 if usable_credential => {
                            self.send_user_auth();
                        }
                        0x02 => {
                            self.teardown_protocol_error(reactor, handle, Socks5Error::EmptyCredential);
                            return;
                        }
                        _ => {
                            self.teardown_protocol_error(reactor, handle, Socks5Error::NoAcceptableMethod);
                            return;
                        }
                    }
                }
                Phase::AwaitUserAuth => {
                    if self.input.len() < 2 {
                        return;
                    }
                    let status = self.input[1];
                    self.input.drain(0..2);

                    if status == 0x00 {
                        self.send_connect();
                    } else {
                        self.teardown_protocol_error(reactor, handle, Socks5Error::AuthFailed(status));
                        return;
                    }
                }
                Phase::SendConnect => {
                    // queued synchronously by send_connect(); nothing to
                    // read yet.
                    return;
                }
                Phase::AwaitConnect => {
                    if self.input.len() < CONNECT_REPLY_HEADER {
                        return;
                    }
                    let reply = self.input[1];
                    let bound = sockaddr_from_reply(&self.input[4..10]);
                    self.input.drain(0..CONNECT_REPLY_HEADER);

                    if reply != 0x00 {
                        self.teardown_protocol_error(reactor, handle, Socks5Error::ConnectRefused(reply));
                        return;
                    }

                    let remaining = std::mem::take(&mut self.input);
                    self.pivot(bound, &remaining);
                }
                Phase::Done => {
                    if self.input.is_empty() {
                        return;
                    }
                    let remaining = std::mem::take(&mut self.input);
                    self.final_endpoint.data_read(&remaining);
                }
            }
        }
    }
}

fn sockaddr_from_reply(bytes: &[u8]) -> Option<NetworkNode> {
    if bytes.len() < 6 {
        return None;
    }
    let addr = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
    let port = u16::from_be_bytes([bytes[4], bytes[5]]);
    Some(NetworkNode::new(addr.to_string(), port))
}

impl Source for ProxiedStream {
    fn poll_read(&mut self, reactor: &mut Reactor, handle: SocketHandle) {
        if self.phase == Phase::Done {
            let socket = match &self.socket {
                Some(s) => s,
                None => return,
            };
            let mut buffer = [0u8; READ_BUFFER];
            let read = unsafe {
                libc::recv(
                    socket.as_raw_fd(),
                    buffer.as_mut_ptr() as *mut libc::c_void,
                    buffer.len(),
                    0,
                )
            };
            if read == 0 {
                self.teardown(reactor, handle, false);
            } else if read < 0 {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::WouldBlock {
                    self.teardown(reactor, handle, true);
                }
            } else {
                self.final_endpoint.data_read(&buffer[..read as usize]);
            }
            return;
        }

        let socket = match &self.socket {
            Some(s) => s,
            None => return,
        };
        let mut buffer = [0u8; READ_BUFFER];
        let read = unsafe {
            libc::recv(
                socket.as_raw_fd(),
                buffer.as_mut_ptr() as *mut libc::c_void,
                buffer.len(),
                0,
            )
        };
        if read == 0 {
            self.teardown(reactor, handle, false);
            return;
        }
        if read < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                self.teardown(reactor, handle, true);
            }
            return;
        }

        self.input.extend_from_slice(&buffer[..read as usize]);
        self.advance(reactor, handle);
    }

    fn poll_write(&mut self, reactor: &mut Reactor, handle: SocketHandle) {
        if self.state == State::Connecting {
            self.state = State::Idle;
            self.begin_negotiation();
            if !self.out.is_empty() {
                let pending = std::mem::take(&mut self.out);
                self.send(&pending);
            }
            return;
        }

        let socket = match &self.socket {
            Some(s) => s,
            None => return,
        };
        if self.out.is_empty() {
            return;
        }

        match send_no_sigpipe(socket, &self.out) {
            Ok(sent) if sent == self.out.len() => {
                self.out.clear();
                self.state = State::Idle;
            }
            Ok(sent) => {
                self.out.drain(0..sent);
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(_) => {
                self.teardown(reactor, handle, true);
            }
        }
    }

    fn poll_error(&mut self, reactor: &mut Reactor, handle: SocketHandle) {
        self.teardown(reactor, handle, true);
    }

    fn derived_hint(&self) -> Hint {
        self.state.hint()
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

/// Connect through a SOCKS5 proxy to `target`, pivoting to `final_endpoint`
/// once negotiation completes.
pub fn connect_socks5(
    reactor: &mut Reactor,
    proxy: &ProxyAddress,
    target: &NetworkNode,
    final_endpoint: Box<dyn NetworkEndpoint>,
) -> Result<SocketHandle, SetupError> {
    let socket = RawSocket::new(Domain::IPV4, Type::STREAM, None).map_err(SetupError::Create)?;
    socket.set_nonblocking(true).map_err(SetupError::NonBlocking)?;
    let fd = socket.as_raw_fd();
    let proxy_addr = SockAddr::from(std::net::SocketAddrV4::new(proxy.host, proxy.port));

    let mut stream = ProxiedStream {
        socket: None,
        out: Vec::new(),
        input: Vec::new(),
        phase: Phase::AwaitGreeting,
        state: State::Connecting,
        target: target.clone(),
        credential: proxy.credential.clone(),
        final_endpoint,
    };

    debug!(proxy = %proxy.host, port = proxy.port, target = %target, "dialing through SOCKS5 proxy");

    match socket.connect(&proxy_addr) {
        Ok(()) => {
            stream.socket = Some(socket);
            stream.state = State::Idle;
            let handle = reactor.register(Box::new(stream), fd, Hint::Buffering);
            if let Some(s) = reactor.get_mut::<ProxiedStream>(handle) {
                s.begin_negotiation();
            }
            Ok(handle)
        }
        Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {
            stream.socket = Some(socket);
            stream.state = State::Connecting;
            Ok(reactor.register(Box::new(stream), fd, Hint::Buffering))
        }
        Err(err) => Err(SetupError::Connect(err)),
    }
}

/// One proxy in a [`ProxyPool`]: host, port and an optional credential.
#[derive(Debug, Clone)]
pub struct ProxyAddress {
    pub host: Ipv4Addr,
    pub port: u16,
    pub credential: Option<Credential>,
}

impl ProxyAddress {
    pub fn new(host: Ipv4Addr, port: u16) -> ProxyAddress {
        ProxyAddress {
            host,
            port,
            credential: None,
        }
    }

    pub fn with_credential(mut self, username: impl Into<String>, password: impl Into<String>) -> ProxyAddress {
        self.credential = Some(Credential {
            username: username.into(),
            password: password.into(),
        });
        self
    }
}

struct ProxySet {
    proxies: Vec<ProxyAddress>,
    cursor: usize,
}

/// Named sets of proxies with a round-robin cursor per active set
/// (SPEC_FULL.md §4.6 "Proxy pool").
#[derive(Default)]
pub struct ProxyPool {
    sets: std::collections::HashMap<u32, ProxySet>,
    active: Option<u32>,
}

impl ProxyPool {
    pub fn new() -> ProxyPool {
        ProxyPool {
            sets: std::collections::HashMap::new(),
            active: None,
        }
    }

    pub fn add_proxy(&mut self, set_id: u32, proxy: ProxyAddress) {
        self.sets
            .entry(set_id)
            .or_insert_with(|| ProxySet {
                proxies: Vec::new(),
                cursor: 0,
            })
            .proxies
            .push(proxy);
    }

    pub fn activate_set(&mut self, set_id: u32) -> bool {
        if self.sets.contains_key(&set_id) {
            self.active = Some(set_id);
            true
        } else {
            false
        }
    }

    pub fn clear(&mut self) {
        self.sets.clear();
        self.active = None;
    }

    pub fn uses_proxies(&self) -> bool {
        self.active
            .and_then(|id| self.sets.get(&id))
            .is_some_and(|set| !set.proxies.is_empty())
    }

    /// The next proxy in the active set's round-robin cycle.
    pub fn next_proxy(&mut self) -> Option<ProxyAddress> {
        let id = self.active?;
        let set = self.sets.get_mut(&id)?;
        if set.proxies.is_empty() {
            return None;
        }
        let proxy = set.proxies[set.cursor % set.proxies.len()].clone();
        set.cursor = (set.cursor + 1) % set.proxies.len();
        Some(proxy)
    }
}
