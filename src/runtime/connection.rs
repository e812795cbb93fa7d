//! Connection state machine and registry for client connections.
//!
//! A connection is `Accepted` until it is registered for read readiness,
//! stays `Readable` for its whole life (replies are written inline), and
//! ends `Closed` on end-of-stream or an I/O error.

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use slab::Slab;
use std::io;
use std::net::SocketAddr;

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accepted but not yet registered with the poller.
    Accepted,
    /// Registered for read readiness.
    Readable,
    /// Deregistered; the socket is released on drop.
    Closed,
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    state: ConnState,
}

impl Connection {
    /// Wrap a freshly accepted stream.
    ///
    /// Streams returned by mio's accept are already in non-blocking mode.
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            state: ConnState::Accepted,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> ConnState {
        self.state
    }

    fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        registry.register(&mut self.stream, token, Interest::READABLE)?;
        self.state = ConnState::Readable;
        Ok(())
    }

    fn close(&mut self, registry: &Registry) {
        if self.state == ConnState::Readable {
            let _ = registry.deregister(&mut self.stream);
        }
        self.state = ConnState::Closed;
    }
}

/// Registry of live connections using slab allocation.
///
/// The slab key doubles as the poll token, so every live connection has
/// exactly one registration.
pub struct ConnectionRegistry {
    connections: Slab<Connection>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(1024)),
            max_connections,
        }
    }

    /// Insert a connection and register it for read readiness.
    ///
    /// Returns `Ok(None)` if the registry is at capacity; the connection is
    /// dropped, which closes the socket.
    pub fn insert(&mut self, conn: Connection, registry: &Registry) -> io::Result<Option<usize>> {
        if self.connections.len() >= self.max_connections {
            return Ok(None);
        }

        let entry = self.connections.vacant_entry();
        let id = entry.key();
        let conn = entry.insert(conn);
        if let Err(e) = conn.register(registry, Token(id)) {
            self.connections.remove(id);
            return Err(e);
        }
        Ok(Some(id))
    }

    /// Get a mutable reference to a connection.
    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    /// Deregister and release a connection.
    ///
    /// Returns the closed connection's peer address, or `None` if the id
    /// was not live.
    pub fn close(&mut self, id: usize, registry: &Registry) -> Option<SocketAddr> {
        let mut conn = self.connections.try_remove(id)?;
        conn.close(registry);
        Some(conn.peer)
    }

    /// Deregister and release every live connection.
    pub fn close_all(&mut self, registry: &Registry) -> usize {
        let mut closed = 0;
        for mut conn in self.connections.drain() {
            conn.close(registry);
            closed += 1;
        }
        closed
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }
}
