//! External log-facade interface.
//!
//! Grounded on `original_source/include/libnetworkd/LogFacility.hpp` and
//! `LogManager.hpp`. The original exposes a global `LogManager *` pointer
//! that every component reaches for; this rewrite threads a `LogSink` as an
//! explicit, optional dependency injected into whatever wants to report to
//! it (currently [`crate::event::EventBus`]), per Design Notes "Global
//! singletons". It is deliberately a narrow interface — no sinks, no
//! formatting — matching SPEC_FULL.md §1's framing of the log facade as an
//! external collaborator; the crate's own internal diagnostics go through
//! `tracing` independently of whatever a consuming daemon wires up here.

/// Severity levels the original `LogManager::logMessage` accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Event,
    Spam,
    Info,
    Critical,
}

/// A daemon-supplied sink for textual log lines. Implemented outside this
/// crate; the event bus calls into it with the `Event` log level whenever it
/// fires an event (SPEC_FULL.md §4.7).
pub trait LogSink {
    fn log(&mut self, level: LogLevel, message: &str);
}
