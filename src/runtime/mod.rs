//! Readiness-based runtime.
//!
//! One thread owns a mio `Poll` (epoll on Linux, kqueue on macOS), the
//! listening socket and every client connection:
//! - `Reactor`: wait/dispatch loop, stopped through a `StopHandle`
//! - `handler`: accept, read, reply and write for one readiness event
//! - `ConnectionRegistry`: slab of live connections keyed by poll token

mod connection;
mod event_loop;
mod handler;

pub use event_loop::{Reactor, StopHandle};
