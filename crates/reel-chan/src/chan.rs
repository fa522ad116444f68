use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, trace};

use crate::ring::Ring;

/// What a channel is currently doing. Modes mirror the direction of the
/// buffered data, not the socket: a `Read` channel fills its ring from the
/// peer, a `Write` channel drains its ring to the peer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChanMode {
    Idle,
    Read,
    Write,
    /// Poll for arrival without consuming; used to notice a peer close on an
    /// otherwise idle connection.
    ReadChk,
    Listen,
    Closed,
}

enum Endpoint {
    /// Pure in-memory buffer (local image stream); never polled.
    None,
    Stream(TcpStream),
    Listener(TcpListener),
}

/// Non-blocking buffered byte channel.
///
/// All actual socket I/O happens inside [`Wait::quantum`]; between quanta,
/// consumers look at the ring and the `ready`/`eof`/`saved_errno` flags.
pub struct Channel {
    name: &'static str,
    mode: ChanMode,
    ring: Ring,
    endpoint: Endpoint,
    /// New bytes (or an accept) arrived during the last quantum.
    pub ready: bool,
    /// Peer closed; buffered bytes may still be pending.
    pub eof: bool,
    /// First non-retryable I/O error observed.
    pub saved_errno: Option<io::ErrorKind>,
    token: Option<Token>,
    registered: Option<Interest>,
    /// The last read stopped because the ring was full, not because the
    /// socket drained; retry before the next poll.
    stalled: bool,
}

impl Channel {
    pub fn buffer(name: &'static str, capacity: usize) -> Self {
        Self::with_endpoint(name, capacity, Endpoint::None, ChanMode::Idle)
    }

    pub fn stream(name: &'static str, capacity: usize, stream: TcpStream) -> Self {
        Self::with_endpoint(name, capacity, Endpoint::Stream(stream), ChanMode::Idle)
    }

    pub fn listener(name: &'static str, listener: TcpListener) -> Self {
        // A listener never buffers bytes; the ring is a stub.
        Self::with_endpoint(name, 64, Endpoint::Listener(listener), ChanMode::Listen)
    }

    fn with_endpoint(
        name: &'static str,
        capacity: usize,
        endpoint: Endpoint,
        mode: ChanMode,
    ) -> Self {
        Self {
            name,
            mode,
            ring: Ring::with_capacity(capacity),
            endpoint,
            ready: false,
            eof: false,
            saved_errno: None,
            token: None,
            registered: None,
            stalled: false,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn mode(&self) -> ChanMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ChanMode) {
        self.mode = mode;
    }

    pub fn is_fd(&self) -> bool {
        !matches!(self.endpoint, Endpoint::None)
    }

    pub fn n_ready(&self) -> usize {
        self.ring.n_ready()
    }

    pub fn n_avail(&self) -> usize {
        self.ring.n_avail()
    }

    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    pub fn ring_mut(&mut self) -> &mut Ring {
        &mut self.ring
    }

    /// Grows the ring to at least `capacity`. Only legal while empty.
    pub fn ensure_capacity(&mut self, capacity: usize) {
        if self.ring.capacity() < capacity {
            debug_assert!(self.ring.is_empty());
            self.ring = Ring::with_capacity(capacity.next_power_of_two());
        }
    }

    /// Accepts one pending connection on a LISTEN channel.
    pub fn accept(&mut self) -> io::Result<Option<(TcpStream, SocketAddr)>> {
        let Endpoint::Listener(l) = &mut self.endpoint else {
            return Err(io::ErrorKind::InvalidInput.into());
        };
        match l.accept() {
            Ok((stream, addr)) => Ok(Some((stream, addr))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.endpoint {
            Endpoint::Stream(s) => s.local_addr().ok(),
            Endpoint::Listener(l) => l.local_addr().ok(),
            Endpoint::None => None,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match &self.endpoint {
            Endpoint::Stream(s) => s.peer_addr().ok(),
            _ => None,
        }
    }

    /// Half-closes the write side, signalling end of stream to the peer
    /// while reads continue.
    pub fn shutdown_write(&mut self) {
        if let Endpoint::Stream(s) = &mut self.endpoint {
            let _ = s.shutdown(std::net::Shutdown::Write);
        }
    }

    /// Non-blocking write straight to the endpoint, bypassing the ring.
    /// Used by the RPC layer, whose outbound records are staged separately
    /// from the inbound request buffer.
    pub fn write_direct(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.endpoint {
            Endpoint::Stream(s) => io::Write::write(s, buf),
            _ => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// Clears buffered bytes and transfer flags ahead of a fresh transfer.
    pub fn reset(&mut self) {
        self.ring.clear();
        self.ready = false;
        self.eof = false;
        self.saved_errno = None;
        self.stalled = false;
    }

    /// Drops the endpoint and marks the channel closed. The kernel removes
    /// the fd from the poll set when it is closed.
    pub fn close(&mut self) {
        self.endpoint = Endpoint::None;
        self.mode = ChanMode::Closed;
        self.token = None;
        self.registered = None;
        self.stalled = false;
    }

    fn desired_interest(&self) -> Option<Interest> {
        match self.mode {
            ChanMode::Read if !self.eof && self.ring.n_avail() > 0 => Some(Interest::READABLE),
            ChanMode::ReadChk if !self.eof => Some(Interest::READABLE),
            ChanMode::Write if self.ring.n_ready() > 0 => Some(Interest::WRITABLE),
            ChanMode::Listen => Some(Interest::READABLE),
            _ => None,
        }
    }

    fn fail(&mut self, kind: io::ErrorKind) {
        debug!(chan = self.name, ?kind, "channel error");
        self.saved_errno = Some(kind);
        self.eof = true;
    }

    /// Fill the ring from the stream. Returns true on progress.
    fn do_read(&mut self) -> bool {
        let Endpoint::Stream(stream) = &mut self.endpoint else {
            return false;
        };
        match self.ring.ingress(stream) {
            Ok((n, saw_eof)) => {
                if saw_eof {
                    trace!(chan = self.name, "eof");
                    self.eof = true;
                }
                if n > 0 {
                    self.ready = true;
                }
                // Full ring with no EOF means the socket may still hold data.
                self.stalled = !saw_eof && self.ring.n_avail() == 0;
                n > 0 || saw_eof
            }
            Err(e) => {
                self.stalled = false;
                self.fail(e.kind());
                true
            }
        }
    }

    /// One-byte peek to detect peer close without consuming.
    fn do_readchk(&mut self) -> bool {
        let Endpoint::Stream(stream) = &mut self.endpoint else {
            return false;
        };
        let mut probe = [0u8; 1];
        match stream.peek(&mut probe) {
            Ok(0) => {
                self.eof = true;
                true
            }
            Ok(_) => {
                self.ready = true;
                true
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                false
            }
            Err(e) => {
                self.fail(e.kind());
                true
            }
        }
    }

    /// Drain the ring into the stream. Returns true on progress.
    fn do_write(&mut self) -> bool {
        let Endpoint::Stream(stream) = &mut self.endpoint else {
            return false;
        };
        if self.ring.is_empty() {
            return false;
        }
        match self.ring.egress(stream) {
            Ok(n) => n > 0,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
            Err(e) => {
                self.fail(e.kind());
                true
            }
        }
    }

    fn service(&mut self, readable: bool, writable: bool) -> bool {
        match self.mode {
            ChanMode::Read if readable => self.do_read(),
            ChanMode::ReadChk if readable => self.do_readchk(),
            ChanMode::Write if writable => self.do_write(),
            ChanMode::Listen if readable => {
                self.ready = true;
                true
            }
            _ => false,
        }
    }
}

/// The central suspension point: one `mio::Poll` across every channel of a
/// session. Performs the socket I/O it can and returns; callers then inspect
/// ring counters and flags.
pub struct Wait {
    poll: Poll,
    events: Events,
    next_token: usize,
}

impl Wait {
    pub fn new() -> io::Result<Self> {
        Ok(Self { poll: Poll::new()?, events: Events::with_capacity(64), next_token: 0 })
    }

    /// One wait across `chans`, bounded by `max_delay`. Returns true if any
    /// I/O progress was made.
    pub fn quantum(&mut self, chans: &mut [&mut Channel], max_delay: Duration) -> io::Result<bool> {
        let mut did_something = false;

        // Opportunistic slices first: edge-triggered readiness will not fire
        // again for data we declined last quantum (ring was full) or for
        // rings that were empty when the socket last signalled writable.
        for ch in chans.iter_mut() {
            match ch.mode {
                ChanMode::Read if ch.stalled && ch.ring.n_avail() > 0 => {
                    ch.stalled = false;
                    did_something |= ch.do_read();
                }
                ChanMode::Write if ch.is_fd() && ch.ring.n_ready() > 0 => {
                    did_something |= ch.do_write();
                }
                _ => {}
            }
        }

        // Bring registrations in line with what each channel wants now.
        for ch in chans.iter_mut() {
            if !ch.is_fd() {
                continue;
            }
            let desired = ch.desired_interest();
            if desired == ch.registered {
                continue;
            }
            let registry = self.poll.registry();
            match desired {
                None => {
                    if ch.token.is_some() {
                        let _ = match &mut ch.endpoint {
                            Endpoint::Stream(s) => registry.deregister(s),
                            Endpoint::Listener(l) => registry.deregister(l),
                            Endpoint::None => Ok(()),
                        };
                    }
                    ch.registered = None;
                    ch.token = None;
                }
                Some(interest) => {
                    let (tok, fresh) = match ch.token {
                        Some(t) => (t, false),
                        None => {
                            let t = Token(self.next_token);
                            self.next_token += 1;
                            (t, true)
                        }
                    };
                    let result = match &mut ch.endpoint {
                        Endpoint::Stream(s) if fresh => registry.register(s, tok, interest),
                        Endpoint::Stream(s) => registry.reregister(s, tok, interest),
                        Endpoint::Listener(l) if fresh => registry.register(l, tok, interest),
                        Endpoint::Listener(l) => registry.reregister(l, tok, interest),
                        Endpoint::None => Ok(()),
                    };
                    match result {
                        Ok(()) => {
                            ch.token = Some(tok);
                            ch.registered = desired;
                        }
                        Err(e) => ch.fail(e.kind()),
                    }
                }
            }
        }

        let timeout = if did_something { Duration::ZERO } else { max_delay };
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(did_something),
            Err(e) => return Err(e),
        }

        for event in self.events.iter() {
            let Some(ch) = chans.iter_mut().find(|c| c.token == Some(event.token())) else {
                continue;
            };
            did_something |= ch.service(event.is_readable(), event.is_writable());
        }

        Ok(did_something)
    }
}
