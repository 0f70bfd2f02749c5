//! Stream connection to the harness.
//!
//! The socket is blocking only during the handshake. Afterwards it is switched
//! to non-blocking mode and driven through a `mio` poll, so a receive never
//! waits longer than the caller allows.

use crate::error::{Error, Result};
use hdriver_proto as proto;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use nix::libc;
use nix::sys::socket::{setsockopt, sockopt};
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

const TOKEN_HARNESS: Token = Token(0);

/// Longest any single wait (reply window, send, handshake) may last.
pub const MAX_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

/// One live connection. Replaced as a whole when it fails.
pub trait Connection {
    /// Write one complete frame.
    fn send(&mut self, frame: &[u8]) -> Result<()>;

    /// Read whatever is available, waiting at most `wait` for it.
    /// `Ok(None)` means nothing arrived.
    fn poll_receive(&mut self, wait: Duration) -> Result<Option<Vec<u8>>>;
}

/// Produces fresh connections: used for the first connect and for every
/// reconnect after a transport fault.
pub trait Connector {
    type Conn: Connection;

    fn connect(&mut self) -> Result<Self::Conn>;
}

/// TCP connection to a harness behind a local port forward.
pub struct TcpConnection {
    stream: TcpStream,
    poll: Poll,
    events: Events,
    read_buf: Vec<u8>,
    send_timeout: Duration,
}

impl TcpConnection {
    /// Connect to `127.0.0.1:port` and complete the handshake before `deadline`.
    /// One attempt; retrying is up to the caller.
    pub fn open(
        port: u16,
        deadline: Instant,
        buffer_size: usize,
        send_timeout: Duration,
    ) -> io::Result<Self> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let remaining = remaining_until(deadline)?;
        let mut std_stream = std::net::TcpStream::connect_timeout(&addr, remaining)?;

        // Abortive close: no FIN_WAIT lingering that would stall the next bind.
        let linger = libc::linger {
            l_onoff: 1,
            l_linger: 0,
        };
        setsockopt(&std_stream, sockopt::Linger, &linger).map_err(io::Error::other)?;

        std_stream.set_write_timeout(Some(remaining_until(deadline)?))?;
        std_stream.write_all(proto::HANDSHAKE)?;

        let mut ack = vec![0u8; buffer_size.max(1)];
        std_stream.set_read_timeout(Some(remaining_until(deadline)?))?;
        let n = std_stream.read(&mut ack)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "harness closed the connection during handshake",
            ));
        }
        log::info!(
            "Harness handshake ok on port {}: {:?}",
            port,
            String::from_utf8_lossy(&ack[..n])
        );

        std_stream.set_read_timeout(None)?;
        std_stream.set_write_timeout(None)?;
        std_stream.set_nonblocking(true)?;
        let mut stream = TcpStream::from_std(std_stream);

        let poll = Poll::new()?;
        poll.registry().register(
            &mut stream,
            TOKEN_HARNESS,
            Interest::READABLE.add(Interest::WRITABLE),
        )?;

        Ok(Self {
            stream,
            poll,
            events: Events::with_capacity(8),
            read_buf: vec![0u8; buffer_size.max(1)],
            send_timeout,
        })
    }

    fn wait(&mut self, timeout: Duration) -> io::Result<()> {
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn try_read(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            match self.stream.read(&mut self.read_buf) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "harness closed the connection",
                    ))
                }
                Ok(n) => return Ok(Some(self.read_buf[..n].to_vec())),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl Connection for TcpConnection {
    fn send(&mut self, frame: &[u8]) -> Result<()> {
        let deadline = deadline_after(self.send_timeout);
        let mut written = 0;
        while written < frame.len() {
            match self.stream.write(&frame[written..]) {
                Ok(0) => {
                    return Err(Error::Transport(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "harness stream closed",
                    )))
                }
                Ok(n) => written += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let remaining = remaining_until(deadline).map_err(Error::Transport)?;
                    self.wait(remaining).map_err(Error::Transport)?;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Transport(e)),
            }
        }
        Ok(())
    }

    fn poll_receive(&mut self, wait: Duration) -> Result<Option<Vec<u8>>> {
        if let Some(bytes) = self.try_read().map_err(Error::Transport)? {
            return Ok(Some(bytes));
        }
        self.wait(wait).map_err(Error::Transport)?;
        self.try_read().map_err(Error::Transport)
    }
}

/// `now + wait`, with `wait` capped at [`MAX_WAIT`].
pub(crate) fn deadline_after(wait: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(wait.min(MAX_WAIT)).unwrap_or(now)
}

fn remaining_until(deadline: Instant) -> io::Result<Duration> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        Err(io::Error::new(io::ErrorKind::TimedOut, "deadline elapsed"))
    } else {
        Ok(remaining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn spawn_peer(
        script: impl FnOnce(std::net::TcpStream) + Send + 'static,
    ) -> (u16, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            script(stream);
        });
        (port, handle)
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[test]
    fn handshake_then_exchange() {
        let (port, peer) = spawn_peer(|mut stream| {
            let mut hello = [0u8; 5];
            stream.read_exact(&mut hello).unwrap();
            assert_eq!(&hello, b"hello");
            stream.write_all(b"hi").unwrap();

            let mut buf = [0u8; 64];
            let n = stream.read(&mut buf).unwrap();
            stream.write_all(&buf[..n]).unwrap();
            thread::sleep(Duration::from_millis(200));
        });

        let mut conn = TcpConnection::open(port, deadline(), 1024, Duration::from_secs(1)).unwrap();
        assert!(conn.poll_receive(Duration::from_millis(10)).unwrap().is_none());

        conn.send(b"ping").unwrap();
        let mut got = Vec::new();
        let until = Instant::now() + Duration::from_secs(2);
        while got.len() < 4 && Instant::now() < until {
            if let Some(bytes) = conn.poll_receive(Duration::from_millis(50)).unwrap() {
                got.extend(bytes);
            }
        }
        assert_eq!(got, b"ping");
        peer.join().unwrap();
    }

    #[test]
    fn peer_close_is_transport_fault() {
        let (port, peer) = spawn_peer(|mut stream| {
            let mut hello = [0u8; 5];
            stream.read_exact(&mut hello).unwrap();
            stream.write_all(b"ack").unwrap();
        });

        let mut conn = TcpConnection::open(port, deadline(), 1024, Duration::from_secs(1)).unwrap();
        peer.join().unwrap();

        let until = Instant::now() + Duration::from_secs(2);
        let err = loop {
            match conn.poll_receive(Duration::from_millis(50)) {
                Err(e) => break e,
                Ok(_) if Instant::now() < until => continue,
                Ok(_) => panic!("close never observed"),
            }
        };
        assert!(err.is_transport());
    }

    #[test]
    fn silent_peer_fails_handshake() {
        let (port, peer) = spawn_peer(|stream| {
            thread::sleep(Duration::from_millis(500));
            drop(stream);
        });

        let short = Instant::now() + Duration::from_millis(200);
        assert!(TcpConnection::open(port, short, 1024, Duration::from_secs(1)).is_err());
        peer.join().unwrap();
    }

    #[test]
    fn deadlines_are_capped() {
        let before = Instant::now();
        let far = deadline_after(Duration::MAX);
        assert!(far >= before + MAX_WAIT);
        assert!(far <= Instant::now() + MAX_WAIT);

        let near = deadline_after(Duration::from_millis(20));
        assert!(near <= Instant::now() + Duration::from_millis(20));
    }
}
