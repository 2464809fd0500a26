//! Reconnecting TCP stream and the retry policy around it.
//!
//! A [`ReconnectStream`] owns a peer address and at most one live
//! connection.  Connecting is lazy (first I/O dials), writes are full-delivery,
//! reads fill the whole buffer.  When an I/O error looks transient the
//! connection is dropped so the next operation redials; [`retry`] wraps a
//! whole exchange and repeats it with a fixed backoff until it succeeds, the
//! error turns out to be permanent, or shutdown is requested.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::RETRY_DELAY;

/// Process-wide shutdown request (set by the SIGINT handler and on fatal
/// session errors).  Once raised, in-flight I/O errors are no longer retried.
pub static SHUTDOWN: AtomicBool = AtomicBool::new(false);

pub fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::Relaxed)
}

pub fn request_shutdown() {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

/// Errors worth dropping the connection and retrying over: the peer went
/// away, the path hiccuped, or a receive timeout fired.  Framing errors and
/// protocol violations are deliberately not in this set.
pub fn is_transient(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::NotConnected
    )
}

/// TCP stream with lazy connect and automatic teardown of sick connections.
#[derive(Debug)]
pub struct ReconnectStream {
    addr: SocketAddr,
    conn: Option<TcpStream>,
    read_timeout: Option<Duration>,
}

impl ReconnectStream {
    /// Resolve `addr` once; no connection is made until the first I/O.
    pub fn new<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "address resolved to nothing"))?;
        Ok(ReconnectStream {
            addr,
            conn: None,
            read_timeout: None,
        })
    }

    /// Apply `timeout` to every connection this stream establishes.  A read
    /// that expires surfaces as a transient error, which drops the connection.
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    fn connect(&mut self) -> io::Result<&mut TcpStream> {
        if self.conn.is_none() {
            debug!(addr = %self.addr, "connecting");
            let stream = TcpStream::connect(self.addr)?;
            stream.set_read_timeout(self.read_timeout)?;
            self.conn = Some(stream);
        }
        Ok(self.conn.as_mut().unwrap())
    }

    /// Drop the connection if `err` looks transient, so the next I/O redials.
    fn absorb(&mut self, err: &io::Error) {
        if is_transient(err.kind()) {
            self.conn = None;
        }
    }

    /// Whether a connection is currently established.  After a transient
    /// fault this reads false, which lets session-oriented callers re-run
    /// their connection preamble before the next exchange.
    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Write the whole of `buf` or fail.
    pub fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        let res = self.connect().and_then(|c| c.write_all(buf));
        if let Err(ref e) = res {
            self.absorb(e);
        }
        res
    }

    /// Fill the whole of `buf` or fail.  A clean peer close mid-buffer shows
    /// up as `UnexpectedEof`, which is transient here.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let res = self.connect().and_then(|c| c.read_exact(buf));
        if let Err(ref e) = res {
            self.absorb(e);
        }
        res
    }

    /// Tear down the connection (session teardown); the stream can still
    /// redial later if asked to.
    pub fn close(&mut self) {
        self.conn = None;
    }
}

/// Repeat `op` until it succeeds or fails permanently.
///
/// Transient failures back off for [`RETRY_DELAY`] and go again, each attempt
/// logged; once [`SHUTDOWN`] is raised the error is returned as-is so
/// teardown is not delayed.  `op` must be a self-contained exchange: on
/// reconnect the responder starts a fresh session, so the closure has to
/// resend everything the exchange needs.
pub fn retry<T, F>(what: &str, mut op: F) -> io::Result<T>
where
    F: FnMut() -> io::Result<T>,
{
    let mut attempt = 0u32;
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if is_transient(e.kind()) && !shutdown_requested() => {
                attempt += 1;
                warn!(what, attempt, error = %e, "transient network error, retrying");
                thread::sleep(RETRY_DELAY);
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn classification_is_conservative() {
        assert!(is_transient(io::ErrorKind::ConnectionReset));
        assert!(is_transient(io::ErrorKind::UnexpectedEof));
        assert!(is_transient(io::ErrorKind::TimedOut));
        assert!(is_transient(io::ErrorKind::HostUnreachable));
        assert!(!is_transient(io::ErrorKind::InvalidData));
        assert!(!is_transient(io::ErrorKind::PermissionDenied));
        assert!(!is_transient(io::ErrorKind::AlreadyExists));
    }

    #[test]
    fn lazy_connect_and_echo() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).unwrap();
            conn.write_all(&buf).unwrap();
        });

        let mut stream = ReconnectStream::new(addr).unwrap();
        // No connection yet; the write dials.
        stream.write_all(b"hello").unwrap();
        let mut back = [0u8; 5];
        stream.read_exact(&mut back).unwrap();
        assert_eq!(&back, b"hello");
        server.join().unwrap();
    }

    #[test]
    fn reconnects_after_peer_close() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            // First connection: accept and immediately drop.
            let (conn, _) = listener.accept().unwrap();
            drop(conn);
            // Second connection: echo 3 bytes.
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = [0u8; 3];
            conn.read_exact(&mut buf).unwrap();
            conn.write_all(&buf).unwrap();
        });

        let mut stream = ReconnectStream::new(addr).unwrap();
        let out = retry("echo", || {
            stream.write_all(b"abc")?;
            let mut buf = [0u8; 3];
            stream.read_exact(&mut buf)?;
            Ok(buf)
        })
        .unwrap();
        assert_eq!(&out, b"abc");
        server.join().unwrap();
    }

    #[test]
    fn retry_gives_up_on_permanent_errors() {
        let mut calls = 0;
        let res: io::Result<()> = retry("probe", || {
            calls += 1;
            Err(io::Error::new(io::ErrorKind::InvalidData, "framing broke"))
        });
        assert!(res.is_err());
        assert_eq!(calls, 1);
    }
}
