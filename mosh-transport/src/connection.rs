use std::net::{SocketAddr, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use mosh_crypto::{Base64Key, Nonce, Session};

use crate::error::{Error, Result};
use crate::rtt::RttEstimator;

/// Bytes subtracted from SEND_MTU's partner on recv: the largest datagram
/// the connection layer will accept.
pub const RECEIVE_MTU: usize = 2048;

/// Default outbound MTU on the server; a discovered Path MTU may enlarge it.
pub const SEND_MTU: usize = 1400;

const PORT_RANGE_LOW: u16 = 60001;
const PORT_RANGE_HIGH: u16 = 60999;

/// Direction of a packet's sequence number, carried as the nonce's top bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToServer,
    ToClient,
}

const DIRECTION_MASK: u64 = 1 << 63;
const SEQUENCE_MASK: u64 = !DIRECTION_MASK;

/// One UDP socket bound to a single peer, encrypting every payload with an
/// AEAD session and maintaining an RTT estimate and (server-side) roaming.
pub struct Connection {
    socket: UdpSocket,
    session: Session,
    server: bool,
    direction: Direction,
    remote_addr: Option<SocketAddr>,
    mtu: usize,

    next_seq: u64,
    expected_receiver_seq: u64,

    saved_timestamp: Option<u16>,
    saved_timestamp_received_at: Option<Instant>,

    rtt: RttEstimator,

    send_exception: Option<Error>,
}

impl Connection {
    /// Binds a server-side socket in `[PORT_RANGE_LOW, PORT_RANGE_HIGH]`,
    /// preferring `desired_port` if given.
    pub fn bind_server(desired_port: Option<u16>, key: &Base64Key) -> Result<Self> {
        let socket = bind_in_range(desired_port)?;
        configure_socket(&socket)?;

        Ok(Self {
            socket,
            session: Session::new(key),
            server: true,
            direction: Direction::ToClient,
            remote_addr: None,
            mtu: SEND_MTU,
            next_seq: 0,
            expected_receiver_seq: 0,
            saved_timestamp: None,
            saved_timestamp_received_at: None,
            rtt: RttEstimator::new(),
            send_exception: None,
        })
    }

    /// Connects a client-side socket to `remote`, with a key reconstructed
    /// from its base64 printable form.
    pub fn connect_client(remote: SocketAddr, key: &Base64Key) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").map_err(io_err(false))?;
        configure_socket(&socket)?;

        Ok(Self {
            socket,
            session: Session::new(key),
            server: false,
            direction: Direction::ToServer,
            remote_addr: Some(remote),
            mtu: SEND_MTU,
            next_seq: 0,
            expected_receiver_seq: 0,
            saved_timestamp: None,
            saved_timestamp_received_at: None,
            rtt: RttEstimator::new(),
            send_exception: None,
        })
    }

    pub fn local_port(&self) -> Result<u16> {
        self.socket.local_addr().map(|a| a.port()).map_err(io_err(false))
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Encrypts and sends `payload` to the current remote address. A
    /// failure is recorded, not raised; the next call to
    /// `take_send_exception` observes it once.
    pub fn send(&mut self, payload: &[u8]) {
        let Some(remote_addr) = self.remote_addr else {
            return;
        };

        let seq = self.next_seq;
        self.next_seq += 1;

        let direction_bit = matches!(self.direction, Direction::ToClient) as u64;
        let nonce = Nonce::from_seq((direction_bit << 63) | (seq & SEQUENCE_MASK));

        let now16 = timestamp16();
        let ts_reply = self.outgoing_timestamp_reply();

        let mut plaintext = Vec::with_capacity(4 + payload.len());
        plaintext.extend_from_slice(&now16.to_be_bytes());
        plaintext.extend_from_slice(&ts_reply.to_be_bytes());
        plaintext.extend_from_slice(payload);

        let wire = self.session.encrypt(nonce, &plaintext);

        match self.socket.send_to(&wire, remote_addr) {
            Ok(n) if n == wire.len() => self.send_exception = None,
            Ok(_) => {
                self.send_exception = Some(Error::Io {
                    source: std::io::Error::new(std::io::ErrorKind::Other, "short send"),
                    permanent: false,
                })
            }
            Err(e) => self.send_exception = Some(Error::Io { source: e, permanent: false }),
        }
    }

    /// Returns (and clears) a pending send failure, if any.
    pub fn take_send_exception(&mut self) -> Option<Error> {
        self.send_exception.take()
    }

    /// Receives, decrypts, and validates one datagram. Out-of-order or
    /// duplicate sequence numbers are returned but do not update timing or
    /// roaming state (replay-safe).
    pub fn recv(&mut self) -> Result<Vec<u8>> {
        let mut buf = [0u8; RECEIVE_MTU];
        let (len, from) = self.socket.recv_from(&mut buf).map_err(io_err(true))?;

        if len > RECEIVE_MTU {
            return Err(Error::OversizeDatagram(len, RECEIVE_MTU));
        }

        let (nonce, plaintext) = self.session.decrypt(&buf[..len])?;

        let expect_to_server = self.server;
        let is_to_client = nonce.val() & DIRECTION_MASK != 0;
        if is_to_client == expect_to_server {
            return Err(Error::Decode("packet direction mismatch (possible replay)".into()));
        }

        if plaintext.len() < 4 {
            return Err(Error::Decode("plaintext missing timestamp header".into()));
        }

        let seq = nonce.val() & SEQUENCE_MASK;
        let timestamp = u16::from_be_bytes([plaintext[0], plaintext[1]]);
        let timestamp_reply = u16::from_be_bytes([plaintext[2], plaintext[3]]);
        let payload = plaintext[4..].to_vec();

        if seq < self.expected_receiver_seq {
            return Ok(payload);
        }

        self.expected_receiver_seq = seq + 1;

        if timestamp != TIMESTAMP_ABSENT {
            self.saved_timestamp = Some(timestamp);
            self.saved_timestamp_received_at = Some(Instant::now());
        }

        if timestamp_reply != TIMESTAMP_ABSENT {
            let now16 = timestamp16();
            let r_ms = timestamp_diff(now16, timestamp_reply);
            if r_ms < 5000 {
                self.rtt.update(Duration::from_millis(r_ms as u64));
            }
        }

        if self.server {
            if self.remote_addr != Some(from) {
                tracing::info!(old = ?self.remote_addr, new = %from, "server now attached to client at new address");
            }
            self.remote_addr = Some(from);
        } else {
            // clients never roam: remote_addr was fixed at connect time.
        }

        Ok(payload)
    }

    /// Blocks up to `timeout` waiting for one datagram, driving the
    /// cooperative event loop without a separate poll/select crate.
    /// `Ok(None)` means the deadline passed with nothing to read.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let effective = timeout.max(Duration::from_millis(1));
        self.socket.set_read_timeout(Some(effective)).map_err(io_err(false))?;
        match self.recv() {
            Ok(payload) => Ok(Some(payload)),
            Err(Error::Io { source, .. })
                if matches!(source.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.rtt.timeout()
    }

    pub fn srtt(&self) -> Duration {
        self.rtt.srtt()
    }

    pub fn has_remote_addr(&self) -> bool {
        self.remote_addr.is_some()
    }

    fn outgoing_timestamp_reply(&mut self) -> u16 {
        let Some(received_at) = self.saved_timestamp_received_at else {
            return TIMESTAMP_ABSENT;
        };

        if received_at.elapsed() >= Duration::from_millis(1000) {
            return TIMESTAMP_ABSENT;
        }

        let Some(saved) = self.saved_timestamp.take() else {
            return TIMESTAMP_ABSENT;
        };
        self.saved_timestamp_received_at = None;

        let held_for = received_at.elapsed().as_millis() as u16;
        let corrected = saved.wrapping_add(held_for);
        if corrected == TIMESTAMP_ABSENT {
            corrected.wrapping_sub(1)
        } else {
            corrected
        }
    }
}

impl AsRawFd for Connection {
    /// Exposes the underlying socket fd so a single-threaded event loop can
    /// multiplex it against stdin with `nix::poll` instead of spawning a
    /// reader thread.
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

const TIMESTAMP_ABSENT: u16 = 0xffff;

static PROCESS_START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

fn timestamp16() -> u16 {
    let start = *PROCESS_START.get_or_init(Instant::now);
    let millis = start.elapsed().as_millis();
    let ts = (millis % 65536) as u16;
    if ts == TIMESTAMP_ABSENT {
        ts.wrapping_sub(1)
    } else {
        ts
    }
}

fn timestamp_diff(new: u16, old: u16) -> u16 {
    new.wrapping_sub(old)
}

fn bind_in_range(desired_port: Option<u16>) -> Result<UdpSocket> {
    let (low, high) = match desired_port {
        Some(p) => (p, p),
        None => (PORT_RANGE_LOW, PORT_RANGE_HIGH),
    };

    for port in low..=high {
        if let Ok(socket) = UdpSocket::bind(("0.0.0.0", port)) {
            return Ok(socket);
        }
    }

    Err(Error::Io {
        source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "no free port in range"),
        permanent: true,
    })
}

fn configure_socket(_socket: &UdpSocket) -> Result<()> {
    // Path-MTU discovery and DSCP tuning are Linux-specific setsockopt calls
    // (IP_MTU_DISCOVER / IP_TOS); left as a platform hook since std::net
    // exposes neither directly.
    Ok(())
}

fn io_err(permanent: bool) -> impl Fn(std::io::Error) -> Error {
    move |source| Error::Io { source, permanent }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_diff_wraps() {
        assert_eq!(timestamp_diff(5, 65530), 11);
        assert_eq!(timestamp_diff(100, 50), 50);
    }

    #[test]
    fn client_server_round_trip_over_loopback() {
        let key = Base64Key::generate();
        let mut server = Connection::bind_server(None, &key).unwrap();
        let server_port = server.local_port().unwrap();

        let mut client =
            Connection::connect_client(([127, 0, 0, 1], server_port).into(), &key).unwrap();

        client.send(b"hello");
        let received = server.recv().unwrap();
        assert_eq!(received, b"hello");
    }
}
