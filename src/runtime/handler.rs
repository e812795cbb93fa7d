//! Per-socket handling for one readiness event.
//!
//! mio readiness is edge-triggered, so accept drains the pending queue.
//! Reads are capped per event; a connection that used its whole budget
//! may still hold data and is reported back to the reactor, which services
//! it again on the next loop iteration. Every chunk returned by a single
//! read call is an independent request.

use crate::clock::Clock;
use crate::protocols::time::{self, parser::response_bad_order, Request};
use crate::runtime::connection::{Connection, ConnectionRegistry};
use bytes::Bytes;
use mio::net::TcpListener;
use mio::Registry;
use std::io::{self, Read, Write};
use tracing::{debug, error, warn};

/// Fixed capacity of the per-event request buffer.
pub const READ_BUFFER_SIZE: usize = 1024;

/// Reads performed for one connection before yielding back to the loop.
pub const MAX_READS_PER_EVENT: usize = 16;

/// What a read event left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// No more data for now; the connection stays registered.
    Open,
    /// Read budget used up; the socket may still hold data.
    Pending,
    /// The peer signaled end-of-stream.
    EndOfStream,
}

/// Accept every pending connection and register each for read readiness.
pub fn accept_connections(
    listener: &TcpListener,
    registry: &Registry,
    connections: &mut ConnectionRegistry,
) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => match connections.insert(Connection::new(stream, peer), registry) {
                Ok(Some(conn_id)) => debug!(
                    conn_id,
                    peer = %peer,
                    live = connections.len(),
                    "Accepted connection"
                ),
                Ok(None) => warn!(peer = %peer, "Connection limit reached, dropping connection"),
                Err(e) => error!(peer = %peer, error = %e, "Failed to register connection"),
            },
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!(error = %e, "Accept error");
                break;
            }
        }
    }
}

/// Service a read-ready connection.
///
/// Each successful read is decoded, answered, and the reply is written
/// before the next read. Errors are returned to the caller, which closes
/// the connection.
pub fn handle_readable(
    conn_id: usize,
    connections: &mut ConnectionRegistry,
    clock: &dyn Clock,
) -> io::Result<ReadOutcome> {
    let conn = match connections.get_mut(conn_id) {
        Some(conn) => conn,
        None => return Ok(ReadOutcome::Open),
    };

    let mut reads = 0;
    while reads < MAX_READS_PER_EVENT {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        let n = match conn.stream.read(&mut buf) {
            Ok(0) => return Ok(ReadOutcome::EndOfStream),
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadOutcome::Open),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        reads += 1;

        let reply = respond(conn_id, &buf[..n], clock);
        write_reply(conn_id, conn, &reply)?;
    }

    Ok(ReadOutcome::Pending)
}

/// Decode one request and compute its reply.
///
/// Undecodable bytes get the same reply as an unknown request.
fn respond(conn_id: usize, input: &[u8], clock: &dyn Clock) -> Bytes {
    match time::parse(input) {
        Ok(request) => {
            match &request {
                Request::QueryTime => debug!(conn_id, "Time query"),
                Request::Unknown(body) => debug!(conn_id, body = %body, "Unrecognized request"),
            }
            time::reply(&request, clock)
        }
        Err(e) => {
            warn!(conn_id, error = %e, "Undecodable request");
            response_bad_order()
        }
    }
}

/// Single best-effort write of a reply.
///
/// Bytes the socket cannot take right now are dropped.
fn write_reply(conn_id: usize, conn: &mut Connection, reply: &[u8]) -> io::Result<()> {
    if is_blank(reply) {
        return Ok(());
    }

    loop {
        match conn.stream.write(reply) {
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
            }
            Ok(n) => {
                if n < reply.len() {
                    debug!(conn_id, written = n, dropped = reply.len() - n, "Reply truncated");
                }
                return Ok(());
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                debug!(conn_id, dropped = reply.len(), "Socket not writable, reply dropped");
                return Ok(());
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

fn is_blank(reply: &[u8]) -> bool {
    reply.iter().all(u8::is_ascii_whitespace)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedClock;

    impl Clock for FixedClock {
        fn now_text(&self) -> String {
            "2026-10-17T08:15:30Z".to_string()
        }
    }

    #[test]
    fn test_read_budget_yields() {
        let poll = mio::Poll::new().unwrap();
        let mut connections = ConnectionRegistry::new(4);

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        let conn_id = connections
            .insert(
                Connection::new(mio::net::TcpStream::from_std(server), peer),
                poll.registry(),
            )
            .unwrap()
            .unwrap();

        // More than one budget's worth of request bytes.
        let flood = vec![b'x'; READ_BUFFER_SIZE * MAX_READS_PER_EVENT * 2];
        client.write_all(&flood).unwrap();

        assert_eq!(
            handle_readable(conn_id, &mut connections, &FixedClock).unwrap(),
            ReadOutcome::Pending
        );

        let mut rounds = 1;
        while handle_readable(conn_id, &mut connections, &FixedClock).unwrap()
            == ReadOutcome::Pending
        {
            rounds += 1;
            assert!(rounds < 64);
        }
        assert!(rounds >= 2);

        client.shutdown(std::net::Shutdown::Write).unwrap();
        assert_eq!(
            handle_readable(conn_id, &mut connections, &FixedClock).unwrap(),
            ReadOutcome::EndOfStream
        );
    }

    #[test]
    fn test_is_blank() {
        assert!(is_blank(b""));
        assert!(is_blank(b" \t\r\n"));
        assert!(!is_blank(b"BAD ORDER"));
        assert!(!is_blank(b"  x  "));
    }

    #[test]
    fn test_respond() {
        assert_eq!(
            respond(0, b"query TIME order", &FixedClock),
            Bytes::from_static(b"2026-10-17T08:15:30Z")
        );
        assert_eq!(
            respond(0, b"what time is it", &FixedClock),
            Bytes::from_static(b"BAD ORDER")
        );
        assert_eq!(
            respond(0, &[0xc3, 0x28], &FixedClock),
            Bytes::from_static(b"BAD ORDER")
        );
    }
}
