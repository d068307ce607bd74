//! Blocking `getaddrinfo`-style resolver.
//!
//! Grounded on `original_source/src/PosixResolvingFacility.cpp`: a thin
//! wrapper around the platform resolver with no state of its own.
//! `std::net::ToSocketAddrs` is backed by libc `getaddrinfo` on POSIX
//! targets, which is what carries the `AI_ADDRCONFIG` behavior the original
//! requests explicitly (SPEC_FULL.md §4.5).

use std::cell::RefCell;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::rc::Rc;

use tracing::debug;

use crate::dns::{NameResolver, NameResolvingFacility, ResolutionStatus};

/// Resolves one name per call, blocking the calling thread until the
/// platform resolver returns. `cancel_all` is a no-op: there is nothing in
/// flight to cancel once `resolve` has returned.
#[derive(Debug, Default)]
pub struct SyncResolver;

impl SyncResolver {
    pub fn new() -> SyncResolver {
        SyncResolver
    }
}

impl NameResolvingFacility for SyncResolver {
    fn resolve(&mut self, name: &str, requester: Rc<RefCell<dyn NameResolver>>) {
        // a bogus port is fine: only the address half of the result is used.
        let lookup_result = (name, 0u16).to_socket_addrs();

        let (addresses, status) = match lookup_result {
            Ok(addrs) => {
                let v4: Vec<String> = addrs
                    .filter_map(|addr| match addr {
                        SocketAddr::V4(v4) => Some(v4.ip().to_string()),
                        SocketAddr::V6(_) => None,
                    })
                    .collect();

                if v4.is_empty() {
                    (Vec::new(), ResolutionStatus::HostUnknown)
                } else {
                    (v4, ResolutionStatus::Ok)
                }
            }
            Err(err) => {
                debug!(name, error = %err, "synchronous resolution failed");
                (Vec::new(), classify(&err))
            }
        };

        requester.borrow_mut().name_resolved(name, addresses, status);
    }

    fn cancel_all(&mut self, _requester: &Rc<RefCell<dyn NameResolver>>) {}
}

fn classify(err: &io::Error) -> ResolutionStatus {
    match err.kind() {
        io::ErrorKind::NotFound => ResolutionStatus::HostUnknown,
        _ => ResolutionStatus::Failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;

    struct Recorder {
        result: Option<(Vec<String>, ResolutionStatus)>,
    }

    impl NameResolver for Recorder {
        fn name_resolved(&mut self, _name: &str, addresses: Vec<String>, status: ResolutionStatus) {
            self.result = Some((addresses, status));
        }
    }

    #[test]
    fn resolves_loopback_literal() {
        let mut resolver = SyncResolver::new();
        let requester = Rc::new(StdRefCell::new(Recorder { result: None }));

        resolver.resolve("127.0.0.1", requester.clone());

        let (addresses, status) = requester.borrow_mut().result.take().unwrap();
        assert_eq!(status, ResolutionStatus::Ok);
        assert_eq!(addresses, vec!["127.0.0.1".to_string()]);
    }
}
