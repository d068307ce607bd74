//! Error types for the fallible parts of the runtime.
//!
//! Most of the public contract collapses errors down to `bool`/`Option`
//! returns and callback deliveries (see SPEC_FULL.md §7) to stay close to
//! the original API shape, but the `errno` behind a setup failure is still
//! worth keeping around for diagnostics, so the internal plumbing uses these
//! types before downgrading at the boundary.

use std::io;

use thiserror::Error;

/// Failure setting up a socket (create/bind/listen/connect before it is
/// handed to the reactor).
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("socket already initialized")]
    AlreadyInitialized,
    #[error("socket(2) failed: {0}")]
    Create(#[source] io::Error),
    #[error("setsockopt(2) failed: {0}")]
    SetOpt(#[source] io::Error),
    #[error("fcntl(2) failed: {0}")]
    NonBlocking(#[source] io::Error),
    #[error("bind(2) failed: {0}")]
    Bind(#[source] io::Error),
    #[error("listen(2) failed: {0}")]
    Listen(#[source] io::Error),
    #[error("connect(2) failed: {0}")]
    Connect(#[source] io::Error),
    #[error("'{0}' is not a literal address this layer can dial (resolve it first)")]
    InvalidAddress(String),
}

/// Failure negotiating a SOCKS5 session.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum Socks5Error {
    #[error("unexpected SOCKS version {0}")]
    BadVersion(u8),
    #[error("proxy offered no acceptable authentication method")]
    NoAcceptableMethod,
    #[error("user/password authentication failed with status {0}")]
    AuthFailed(u8),
    #[error("CONNECT request refused, reply code {0}")]
    ConnectRefused(u8),
    #[error("empty username or password supplied for user/pass auth")]
    EmptyCredential,
}
