//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking accept/read/write syscalls on this thread.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! The poll handle lives as long as the `Reactor` and is closed once, when
//! `run` returns (or when a reactor that never ran is dropped).
//!
//! Each connection gets a bounded read budget per iteration. Connections
//! that exhaust it are queued and serviced again on the next iteration,
//! which then polls without blocking. The stop flag is therefore checked
//! after a bounded amount of work, however fast peers write.

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::runtime::connection::ConnectionRegistry;
use crate::runtime::handler::{accept_connections, handle_readable, ReadOutcome};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Connection backlog of the listening socket.
const LISTEN_BACKLOG: i32 = 1024;

/// Cross-thread stop signal for a running reactor.
///
/// Cloneable and safe to trigger from any thread, any number of times.
/// The loop observes it once per iteration, so a stop takes effect within
/// one poll timeout.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Single-threaded readiness loop owning the listener and all connections.
pub struct Reactor<C = SystemClock> {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    local_addr: SocketAddr,
    connections: ConnectionRegistry,
    /// Connections that may still hold unread data.
    pending: Vec<usize>,
    poll_timeout: Duration,
    stop: StopHandle,
    clock: C,
}

impl Reactor<SystemClock> {
    /// Bind using the host, port and loop settings in `config`.
    pub fn bind(config: &Config) -> io::Result<Self> {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> Reactor<C> {
    /// Build a reactor that renders time replies with `clock`.
    ///
    /// Any failure here means the server cannot start.
    pub fn with_clock(config: &Config, clock: C) -> io::Result<Self> {
        let poll = Poll::new()?;

        let listener = create_listener(config.listen_addr())?;
        let mut listener = TcpListener::from_std(listener);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let local_addr = listener.local_addr()?;

        info!(
            addr = %local_addr,
            poll_timeout_ms = config.poll_timeout.as_millis() as u64,
            max_connections = config.max_connections,
            "Reactor listening"
        );

        Ok(Self {
            poll,
            events: Events::with_capacity(config.max_events.max(1)),
            listener,
            local_addr,
            connections: ConnectionRegistry::new(config.max_connections),
            pending: Vec::new(),
            poll_timeout: config.poll_timeout,
            stop: StopHandle::default(),
            clock,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle that stops this reactor from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Drive the loop until stopped, then release every socket.
    pub fn run(mut self) {
        info!(addr = %self.local_addr, "Reactor started");

        while !self.stop.is_stopped() {
            let timeout = if self.pending.is_empty() {
                self.poll_timeout
            } else {
                Duration::ZERO
            };

            if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
                if e.kind() != io::ErrorKind::Interrupted {
                    warn!(error = %e, "Readiness wait failed");
                }
                continue;
            }

            let mut ready = std::mem::take(&mut self.pending);
            for event in self.events.iter() {
                match event.token() {
                    LISTENER_TOKEN => {
                        accept_connections(
                            &self.listener,
                            self.poll.registry(),
                            &mut self.connections,
                        );
                    }
                    Token(conn_id) => ready.push(conn_id),
                }
            }

            // A connection can be both pending and freshly ready.
            ready.sort_unstable();
            ready.dedup();

            for conn_id in ready {
                self.service(conn_id);
            }
        }

        self.shutdown();
    }

    fn service(&mut self, conn_id: usize) {
        match handle_readable(conn_id, &mut self.connections, &self.clock) {
            Ok(ReadOutcome::Open) => {}
            Ok(ReadOutcome::Pending) => self.pending.push(conn_id),
            Ok(ReadOutcome::EndOfStream) => {
                if let Some(peer) = self.connections.close(conn_id, self.poll.registry()) {
                    debug!(conn_id, peer = %peer, "Connection closed by peer");
                }
            }
            Err(e) => {
                debug!(conn_id, error = %e, "Connection error");
                self.connections.close(conn_id, self.poll.registry());
            }
        }
    }

    fn shutdown(mut self) {
        let registry = self.poll.registry();
        let closed = self.connections.close_all(registry);
        if let Err(e) = registry.deregister(&mut self.listener) {
            debug!(error = %e, "Failed to deregister listener");
        }

        info!(closed_connections = closed, "Reactor stopped");
        // Listener and poll handle are released when `self` drops here.
    }
}

/// Create a non-blocking TCP listener with the fixed backlog.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use std::io::{Read, Write};
    use std::net::{IpAddr, Shutdown, TcpStream};
    use std::sync::Barrier;
    use std::thread::{self, JoinHandle};
    use std::time::Instant;

    fn test_config() -> Config {
        Config {
            host: IpAddr::from([127, 0, 0, 1]),
            port: 0,
            poll_timeout: Duration::from_millis(100),
            ..Config::default()
        }
    }

    fn start(config: Config) -> (SocketAddr, StopHandle, JoinHandle<()>) {
        let reactor = Reactor::bind(&config).unwrap();
        let addr = reactor.local_addr();
        let stop = reactor.stop_handle();
        let handle = thread::spawn(move || reactor.run());
        (addr, stop, handle)
    }

    fn connect(addr: SocketAddr) -> TcpStream {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    fn exchange(stream: &mut TcpStream, body: &[u8]) -> String {
        stream.write_all(body).unwrap();
        let mut buf = [0u8; 1024];
        let n = stream.read(&mut buf).unwrap();
        String::from_utf8(buf[..n].to_vec()).unwrap()
    }

    fn assert_timestamp(reply: &str) {
        assert!(
            DateTime::parse_from_rfc3339(reply).is_ok(),
            "not a timestamp: {:?}",
            reply
        );
    }

    fn finish(stop: StopHandle, handle: JoinHandle<()>) {
        stop.stop();
        handle.join().unwrap();
    }

    #[test]
    fn test_query_time_any_case() {
        let (addr, stop, handle) = start(test_config());

        for body in ["QUERY TIME ORDER", "query time order", "Query Time Order"] {
            let mut client = connect(addr);
            assert_timestamp(&exchange(&mut client, body.as_bytes()));
        }

        finish(stop, handle);
    }

    #[test]
    fn test_bad_order() {
        let (addr, stop, handle) = start(test_config());

        let mut client = connect(addr);
        assert_eq!(exchange(&mut client, b"QUERY TIME"), "BAD ORDER");
        assert_eq!(exchange(&mut client, b"QUERY TIME ORDER\n"), "BAD ORDER");
        assert_eq!(exchange(&mut client, &[0xff, 0xfe, 0xfd]), "BAD ORDER");

        // Unrecognized requests keep the connection open.
        assert_timestamp(&exchange(&mut client, b"QUERY TIME ORDER"));

        finish(stop, handle);
    }

    #[test]
    fn test_independent_connections_get_fresh_timestamps() {
        let (addr, stop, handle) = start(test_config());

        let first = exchange(&mut connect(addr), b"QUERY TIME ORDER");
        thread::sleep(Duration::from_millis(20));
        let second = exchange(&mut connect(addr), b"QUERY TIME ORDER");

        assert_timestamp(&first);
        assert_timestamp(&second);
        assert_ne!(first, second);

        finish(stop, handle);
    }

    #[test]
    fn test_concurrent_clients() {
        const CLIENTS: usize = 16;
        let (addr, stop, handle) = start(test_config());
        let barrier = Arc::new(Barrier::new(CLIENTS));

        let clients: Vec<_> = (0..CLIENTS)
            .map(|i| {
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let mut client = connect(addr);
                    barrier.wait();
                    let body = if i % 2 == 0 {
                        "QUERY TIME ORDER".to_string()
                    } else {
                        format!("client {i}")
                    };
                    (i, exchange(&mut client, body.as_bytes()))
                })
            })
            .collect();

        for client in clients {
            let (i, reply) = client.join().unwrap();
            if i % 2 == 0 {
                assert_timestamp(&reply);
            } else {
                assert_eq!(reply, "BAD ORDER");
            }
        }

        finish(stop, handle);
    }

    #[test]
    fn test_peer_close_releases_connection() {
        let (addr, stop, handle) = start(test_config());

        let mut leaving = connect(addr);
        let mut staying = connect(addr);
        assert_timestamp(&exchange(&mut leaving, b"QUERY TIME ORDER"));

        leaving.shutdown(Shutdown::Write).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(leaving.read(&mut buf).unwrap(), 0);

        assert_timestamp(&exchange(&mut staying, b"QUERY TIME ORDER"));
        assert_timestamp(&exchange(&mut connect(addr), b"query time order"));

        finish(stop, handle);
    }

    #[test]
    fn test_flooding_clients_do_not_starve_others() {
        let config = test_config();
        let poll_timeout = config.poll_timeout;
        let (addr, stop, handle) = start(config);
        let done = Arc::new(AtomicBool::new(false));

        let flooders: Vec<_> = (0..2)
            .map(|_| {
                let mut client = connect(addr);
                client
                    .set_write_timeout(Some(Duration::from_millis(200)))
                    .unwrap();
                let done = Arc::clone(&done);
                thread::spawn(move || {
                    let chunk = vec![b'x'; 64 * 1024];
                    while !done.load(Ordering::Relaxed) {
                        match client.write(&chunk) {
                            Ok(_) => {}
                            Err(ref e)
                                if e.kind() == io::ErrorKind::WouldBlock
                                    || e.kind() == io::ErrorKind::TimedOut => {}
                            Err(_) => break,
                        }
                    }
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(200));

        let mut client = connect(addr);
        assert_timestamp(&exchange(&mut client, b"QUERY TIME ORDER"));

        let started = Instant::now();
        stop.stop();
        handle.join().unwrap();
        assert!(
            started.elapsed() < poll_timeout * 2,
            "stop took {:?}",
            started.elapsed()
        );

        done.store(true, Ordering::Relaxed);
        for flooder in flooders {
            flooder.join().unwrap();
        }
    }

    #[test]
    fn test_connection_limit() {
        let (addr, stop, handle) = start(Config {
            max_connections: 1,
            ..test_config()
        });

        let mut first = connect(addr);
        assert_timestamp(&exchange(&mut first, b"QUERY TIME ORDER"));

        let mut rejected = connect(addr);
        let mut buf = [0u8; 16];
        assert!(matches!(rejected.read(&mut buf), Ok(0) | Err(_)));

        assert_eq!(exchange(&mut first, b"still here"), "BAD ORDER");

        finish(stop, handle);
    }

    #[test]
    fn test_stop_idle_reactor() {
        let (addr, stop, handle) = start(test_config());

        let started = Instant::now();
        stop.stop();
        stop.stop();
        handle.join().unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));

        assert!(TcpStream::connect(addr).is_err());
    }

    #[test]
    fn test_stop_closes_live_connections() {
        let (addr, stop, handle) = start(test_config());

        let mut client = connect(addr);
        assert_timestamp(&exchange(&mut client, b"QUERY TIME ORDER"));

        finish(stop, handle);

        let mut buf = [0u8; 16];
        assert!(matches!(client.read(&mut buf), Ok(0) | Err(_)));
    }

    #[test]
    fn test_bind_port_in_use() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let config = Config {
            port: taken.local_addr().unwrap().port(),
            ..test_config()
        };

        assert!(Reactor::bind(&config).is_err());
    }

    #[test]
    fn test_stop_handle_shared() {
        let reactor = Reactor::bind(&test_config()).unwrap();
        let handle = reactor.stop_handle();
        assert!(!handle.is_stopped());

        handle.stop();
        assert!(handle.is_stopped());
        assert!(reactor.stop_handle().is_stopped());
    }
}
