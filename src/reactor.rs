//! `poll(2)`-style readiness multiplexer.
//!
//! Grounded on `original_source/include/libnetworkd/IO.hpp` and
//! `src/IOManager.cpp`: one registration table, one `poll` call per step,
//! dispatch in POLLERR -> POLLOUT -> POLLIN order, two-phase removal so a
//! callback that unregisters a socket (itself or another) never invalidates
//! the iteration in progress (§4.1, §9 "Iterator invalidation under
//! re-entry").
//!
//! The spec's own redesign guidance (§9 "Back-pointers inside callbacks")
//! directs a systems-language rewrite to centralize socket lifetimes in an
//! owning, generation-indexed table rather than the original's raw,
//! non-owning `IOSocket *` list; that's what `Reactor` is here. Registered
//! sources are stored as `Box<dyn Source>` behind a `slab::Slab`, and
//! `SocketHandle` is the opaque handle callers keep instead of a pointer.

use std::any::Any;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use slab::Slab;
use tracing::trace;

/// Readiness class a registered socket advertises to the reactor.
///
/// Drives which `poll(2)` events are requested for the socket's fd; see the
/// table in SPEC_FULL.md §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hint {
    /// Completely ignored; no events requested, no callbacks fire.
    Ignore,
    /// Waiting for input, nothing buffered to write.
    Idle,
    /// Both directions of interest: reading is still possible and there is
    /// output pending (or a connect in flight).
    Buffering,
    /// Only interested in errors (mid-syscall, nothing pollable otherwise).
    Busy,
}

impl Hint {
    fn events(self) -> libc::c_short {
        match self {
            Hint::Ignore => 0,
            Hint::Idle => libc::POLLIN | libc::POLLERR,
            Hint::Buffering => libc::POLLIN | libc::POLLOUT | libc::POLLERR,
            Hint::Busy => libc::POLLERR,
        }
    }
}

/// Opaque handle to a socket registered with a [`Reactor`].
///
/// Replaces the raw `IOSocket *` identity the original uses; stale handles
/// (the entry was already unregistered and compacted away) simply miss on
/// lookup instead of dereferencing freed memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketHandle(usize);

/// Callback surface the reactor dispatches into, one fixed order per step:
/// error, then write, then read (§4.1).
///
/// Implementors get `&mut Reactor` back so they can register new sources
/// (e.g. a listening socket accepting a connection), change their own hint,
/// or unregister any socket including themselves.
pub trait Source: Any {
    fn poll_read(&mut self, reactor: &mut Reactor, handle: SocketHandle);
    fn poll_write(&mut self, reactor: &mut Reactor, handle: SocketHandle);
    fn poll_error(&mut self, reactor: &mut Reactor, handle: SocketHandle);

    /// The hint implied by this source's current internal state. Consulted
    /// by the reactor after every dispatched callback and every
    /// [`Reactor::with_source_mut`] call, so implementors never have to
    /// remember to call `set_hint` themselves when their state changes.
    fn derived_hint(&self) -> Hint;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

struct Entry {
    fd: RawFd,
    hint: Hint,
    marked_for_removal: bool,
    // `None` only while a dispatch for this key is in progress (taken out
    // so the callback can borrow `Reactor` without aliasing itself).
    source: Option<Box<dyn Source>>,
}

enum Stage {
    Error,
    Write,
    Read,
}

/// The readiness multiplexer itself. One instance per process (§5).
pub struct Reactor {
    table: Slab<Entry>,
}

impl Reactor {
    pub fn new() -> Reactor {
        Reactor { table: Slab::new() }
    }

    /// Register a source with its initial fd and hint. The caller must not
    /// double-register the same logical socket.
    pub fn register(&mut self, source: Box<dyn Source>, fd: RawFd, hint: Hint) -> SocketHandle {
        let key = self.table.insert(Entry {
            fd,
            hint,
            marked_for_removal: false,
            source: Some(source),
        });
        SocketHandle(key)
    }

    /// Rebind the fd of an already-registered socket (used after a late
    /// `socket(2)`, e.g. lazy connect).
    pub fn set_fd(&mut self, handle: SocketHandle, fd: RawFd) {
        if let Some(entry) = self.table.get_mut(handle.0) {
            entry.fd = fd;
        }
    }

    /// Update the readiness hint consulted on the next step.
    pub fn set_hint(&mut self, handle: SocketHandle, hint: Hint) {
        if let Some(entry) = self.table.get_mut(handle.0) {
            entry.hint = hint;
        }
    }

    pub fn hint(&self, handle: SocketHandle) -> Option<Hint> {
        self.table.get(handle.0).map(|e| e.hint)
    }

    /// Schedule removal. Safe to call from within a dispatched callback,
    /// including on the socket currently being dispatched.
    pub fn unregister(&mut self, handle: SocketHandle) -> bool {
        match self.table.get_mut(handle.0) {
            Some(entry) if !entry.marked_for_removal => {
                entry.marked_for_removal = true;
                true
            }
            _ => false,
        }
    }

    pub fn is_registered(&self, handle: SocketHandle) -> bool {
        matches!(self.table.get(handle.0), Some(e) if !e.marked_for_removal)
    }

    /// Borrow a registered source back by its concrete type, for
    /// application code that wants to call e.g. `TcpSocket::send` on a
    /// socket it previously registered.
    pub fn get_mut<T: Source>(&mut self, handle: SocketHandle) -> Option<&mut T> {
        self.table
            .get_mut(handle.0)?
            .source
            .as_mut()?
            .as_any_mut()
            .downcast_mut::<T>()
    }

    /// Take a registered source out of the table by its concrete type, run
    /// `f` on it with the rest of the reactor available, then put it back
    /// and resync its hint. This is how application code drives an
    /// operation (`send`, `close`, ...) on a socket it holds only a
    /// [`SocketHandle`] for, using the same take-out/put-back discipline
    /// dispatched callbacks get for free.
    pub fn with_source_mut<T, R>(
        &mut self,
        handle: SocketHandle,
        f: impl FnOnce(&mut T, &mut Reactor, SocketHandle) -> R,
    ) -> Option<R>
    where
        T: Source,
    {
        let mut boxed = self.table.get_mut(handle.0)?.source.take()?;
        let result = match boxed.as_any_mut().downcast_mut::<T>() {
            Some(typed) => f(typed, self, handle),
            None => {
                if let Some(entry) = self.table.get_mut(handle.0) {
                    entry.source = Some(boxed);
                }
                return None;
            }
        };

        self.resync(handle, boxed);
        Some(result)
    }

    fn resync(&mut self, handle: SocketHandle, source: Box<dyn Source>) {
        let hint = source.derived_hint();
        if let Some(entry) = self.table.get_mut(handle.0) {
            entry.source = Some(source);
            if !entry.marked_for_removal {
                entry.hint = hint;
            }
        }
    }

    fn compact(&mut self) {
        self.table.retain(|_, entry| !entry.marked_for_removal);
    }

    /// Wait at most `max_wait_ms` milliseconds (0 = indefinite, matching the
    /// `poll(2)` convention the spec calls out) and dispatch readiness
    /// callbacks for whatever fired.
    pub fn step(&mut self, max_wait_ms: u32) -> io::Result<()> {
        self.compact();

        let keys: Vec<usize> = self.table.iter().map(|(k, _)| k).collect();
        let mut pollfds: Vec<libc::pollfd> = keys
            .iter()
            .map(|&k| {
                let entry = &self.table[k];
                libc::pollfd {
                    fd: entry.fd,
                    events: entry.hint.events(),
                    revents: 0,
                }
            })
            .collect();

        let timeout = if max_wait_ms == 0 {
            -1
        } else {
            max_wait_ms as libc::c_int
        };

        let ret = unsafe {
            libc::poll(
                pollfds.as_mut_ptr(),
                pollfds.len() as libc::nfds_t,
                timeout,
            )
        };

        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        if ret == 0 {
            return Ok(());
        }

        for (i, &key) in keys.iter().enumerate() {
            let revents = pollfds[i].revents;
            if revents == 0 {
                continue;
            }

            match self.table.get(key) {
                Some(entry) if !entry.marked_for_removal && !matches!(entry.hint, Hint::Ignore) => {}
                _ => continue,
            }

            if revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
                self.dispatch(key, Stage::Error);
            }

            if self.removed_or_gone(key) {
                continue;
            }

            if revents & libc::POLLOUT != 0 {
                self.dispatch(key, Stage::Write);
            }

            if self.removed_or_gone(key) {
                continue;
            }

            if revents & libc::POLLIN != 0 {
                self.dispatch(key, Stage::Read);
            }
        }

        self.compact();

        Ok(())
    }

    fn removed_or_gone(&self, key: usize) -> bool {
        !matches!(self.table.get(key), Some(entry) if !entry.marked_for_removal)
    }

    fn dispatch(&mut self, key: usize, stage: Stage) {
        let mut source = match self.table.get_mut(key).and_then(|e| e.source.take()) {
            Some(source) => source,
            None => return,
        };

        let handle = SocketHandle(key);
        trace!(socket = key, stage = ?stage_name(&stage), "dispatching reactor callback");

        match stage {
            Stage::Error => source.poll_error(self, handle),
            Stage::Write => source.poll_write(self, handle),
            Stage::Read => source.poll_read(self, handle),
        }

        self.resync(handle, source);
    }

    /// Smallest max-wait that respects a caller-provided cap and the given
    /// timer wheel's next due delta, per §2's "data flow" description.
    pub fn bounded_wait_ms(max_wait: Option<Duration>, next_timer: Option<Duration>) -> u32 {
        let cap = max_wait.map(|d| d.as_millis() as u64);
        let timer = next_timer.map(|d| d.as_millis() as u64);

        match (cap, timer) {
            (None, None) => 0,
            (Some(c), None) => c.max(1) as u32,
            (None, Some(t)) => t.max(1) as u32,
            (Some(c), Some(t)) => c.min(t).max(1) as u32,
        }
    }
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

fn stage_name(stage: &Stage) -> &'static str {
    match stage {
        Stage::Error => "error",
        Stage::Write => "write",
        Stage::Read => "read",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Recorder {
        log: Rc<RefCell<Vec<&'static str>>>,
        unregister_other: Option<SocketHandle>,
    }

    impl Source for Recorder {
        fn poll_read(&mut self, reactor: &mut Reactor, _handle: SocketHandle) {
            self.log.borrow_mut().push("read");
            if let Some(other) = self.unregister_other.take() {
                reactor.unregister(other);
            }
        }

        fn poll_write(&mut self, _reactor: &mut Reactor, _handle: SocketHandle) {
            self.log.borrow_mut().push("write");
        }

        fn poll_error(&mut self, _reactor: &mut Reactor, _handle: SocketHandle) {
            self.log.borrow_mut().push("error");
        }

        fn derived_hint(&self) -> Hint {
            Hint::Idle
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn socketpair() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        unsafe {
            assert_eq!(
                libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()),
                0
            );
        }
        (fds[0], fds[1])
    }

    #[test]
    fn ignore_hint_receives_no_callbacks() {
        let (a, b) = socketpair();
        let mut reactor = Reactor::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        let handle = reactor.register(
            Box::new(Recorder {
                log: log.clone(),
                unregister_other: None,
            }),
            a,
            Hint::Ignore,
        );

        unsafe {
            libc::write(b, b"x".as_ptr() as *const _, 1);
        }

        reactor.step(10).unwrap();
        assert!(log.borrow().is_empty());

        reactor.set_hint(handle, Hint::Idle);
        reactor.step(10).unwrap();
        assert_eq!(*log.borrow(), vec!["read"]);

        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn unregister_during_dispatch_skips_remaining_stages() {
        let (a1, b1) = socketpair();
        let (a2, b2) = socketpair();
        let mut reactor = Reactor::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        // `first` is registered (and so iterated) before `second`; its read
        // callback unregisters `second` before the reactor ever reaches
        // `second`'s own turn in this same step.
        let first = reactor.register(
            Box::new(Recorder {
                log: log.clone(),
                unregister_other: None,
            }),
            a1,
            Hint::Idle,
        );

        let second = reactor.register(
            Box::new(Recorder {
                log: log.clone(),
                unregister_other: None,
            }),
            a2,
            Hint::Buffering,
        );

        reactor
            .get_mut::<Recorder>(first)
            .unwrap()
            .unregister_other = Some(second);

        unsafe {
            libc::write(b1, b"x".as_ptr() as *const _, 1);
        }

        // `second`'s fd is freshly connected so POLLOUT is ready too;
        // without the marked-for-removal guard it would log a "write".
        reactor.step(10).unwrap();

        assert_eq!(log.borrow().iter().filter(|&&s| s == "write").count(), 0);
        assert!(!reactor.is_registered(second));

        unsafe {
            libc::close(a1);
            libc::close(b1);
            libc::close(a2);
            libc::close(b2);
        }
    }
}
