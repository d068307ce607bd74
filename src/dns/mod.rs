//! DNS resolution: one interface, two implementations.
//!
//! Grounded on `original_source/include/libnetworkd/NameResolution.hpp`'s
//! `NameResolver`/`NameResolvingFacility` pair.

use std::cell::RefCell;
use std::rc::Rc;

pub mod async_resolver;
pub mod sync;

pub use async_resolver::AsyncResolver;
pub use sync::SyncResolver;

/// Status delivered to a [`NameResolver`] on completion of a lookup
/// (SPEC_FULL.md §4.5 "Status mapping").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionStatus {
    Ok,
    HostUnknown,
    Timeout,
    Failed,
}

/// Implemented by whatever wants to receive the result of a name resolution.
pub trait NameResolver {
    fn name_resolved(&mut self, name: &str, addresses: Vec<String>, status: ResolutionStatus);
}

/// A facility that can resolve names, synchronously or asynchronously.
pub trait NameResolvingFacility {
    fn resolve(&mut self, name: &str, requester: Rc<RefCell<dyn NameResolver>>);

    /// Drop every outstanding query belonging to `requester`. A no-op for a
    /// synchronous facility, which never has anything in flight.
    fn cancel_all(&mut self, requester: &Rc<RefCell<dyn NameResolver>>);
}
