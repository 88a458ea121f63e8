//! mio-based event loop implementation.
//!
//! Readiness-based I/O using mio (epoll on Linux, kqueue on macOS).
//! One thread multiplexes the listener and every client socket.

mod event_loop;

pub use event_loop::{run, AcceptOutcome, Multiplexer, Ready, RelayLoop, RelayOutcome};
