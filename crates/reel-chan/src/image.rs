use std::io;
use std::net::{Ipv4Addr, SocketAddr};

use mio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::chan::{ChanMode, Channel};
use crate::DEFAULT_RING_SIZE;

/// Connect progress of one image-stream endpoint.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectStatus {
    Idle,
    Listen,
    Accepted,
    Connected,
    /// Accept or connect failed; the mover converts this into a
    /// CONNECT_ERROR halt.
    Botched,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StreamTransport {
    /// DATA and TAPE roles live in one session; bytes never leave process
    /// memory.
    Local,
    Tcp,
}

/// Which role an endpoint belongs to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Side {
    Data,
    Tape,
}

#[derive(Debug)]
pub struct ImageEndpoint {
    pub status: ConnectStatus,
}

impl ImageEndpoint {
    fn new() -> Self {
        Self { status: ConnectStatus::Idle }
    }

    pub fn is_attached(&self) -> bool {
        matches!(self.status, ConnectStatus::Accepted | ConnectStatus::Connected)
    }
}

/// The bulk byte pipe between the DATA producer/consumer and the TAPE
/// mover. Exactly one `Channel` carries the bytes; the transport decides
/// whether that channel wraps a socket or plain memory.
pub struct ImageStream {
    pub chan: Channel,
    listen: Option<Channel>,
    listen_side: Option<Side>,
    pub data_ep: ImageEndpoint,
    pub tape_ep: ImageEndpoint,
    transport: StreamTransport,
}

impl ImageStream {
    pub fn new() -> Self {
        Self {
            chan: Channel::buffer("image", DEFAULT_RING_SIZE),
            listen: None,
            listen_side: None,
            data_ep: ImageEndpoint::new(),
            tape_ep: ImageEndpoint::new(),
            transport: StreamTransport::Local,
        }
    }

    pub fn transport(&self) -> StreamTransport {
        self.transport
    }

    pub fn ep(&self, side: Side) -> &ImageEndpoint {
        match side {
            Side::Data => &self.data_ep,
            Side::Tape => &self.tape_ep,
        }
    }

    fn ep_mut(&mut self, side: Side) -> &mut ImageEndpoint {
        match side {
            Side::Data => &mut self.data_ep,
            Side::Tape => &mut self.tape_ep,
        }
    }

    /// LISTEN on the in-process transport: nothing to bind, the peer role
    /// connects by calling [`connect_local`].
    pub fn listen_local(&mut self, side: Side) {
        self.transport = StreamTransport::Local;
        self.ep_mut(side).status = ConnectStatus::Listen;
    }

    /// Local counterpart of an accept: both endpoints attach to the shared
    /// buffer channel.
    pub fn connect_local(&mut self, side: Side) -> io::Result<()> {
        let other = match side {
            Side::Data => Side::Tape,
            Side::Tape => Side::Data,
        };
        if self.transport != StreamTransport::Local
            || self.ep(other).status != ConnectStatus::Listen
        {
            return Err(io::ErrorKind::NotConnected.into());
        }
        self.ep_mut(other).status = ConnectStatus::Accepted;
        self.ep_mut(side).status = ConnectStatus::Accepted;
        Ok(())
    }

    /// Binds an ephemeral listener and parks the endpoint in LISTEN. The
    /// caller publishes the returned address in the LISTEN reply.
    pub fn listen_tcp(&mut self, side: Side) -> io::Result<SocketAddr> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0).into())?;
        let addr = listener.local_addr()?;
        debug!(?addr, ?side, "image stream listening");
        self.listen = Some(Channel::listener("image-listen", listener));
        self.listen_side = Some(side);
        self.transport = StreamTransport::Tcp;
        self.ep_mut(side).status = ConnectStatus::Listen;
        Ok(addr)
    }

    /// Outbound connect. Blocking connect, then the stream joins the
    /// non-blocking channel set.
    pub fn connect_tcp(&mut self, side: Side, addr: SocketAddr) -> io::Result<()> {
        self.transport = StreamTransport::Tcp;
        let stream = std::net::TcpStream::connect(addr).and_then(|s| {
            s.set_nonblocking(true)?;
            Ok(s)
        });
        match stream {
            Ok(s) => {
                self.install_stream(TcpStream::from_std(s));
                self.ep_mut(side).status = ConnectStatus::Accepted;
                Ok(())
            }
            Err(e) => {
                warn!(?addr, err = %e, "image stream connect failed");
                self.ep_mut(side).status = ConnectStatus::Botched;
                Err(e)
            }
        }
    }

    /// Accepts a pending image connection, if one arrived. Returns true when
    /// the listening endpoint moved to ACCEPTED.
    pub fn poll_accept(&mut self) -> bool {
        let Some(lc) = self.listen.as_mut() else {
            return false;
        };
        match lc.accept() {
            Ok(Some((stream, peer))) => {
                debug!(?peer, "image stream accepted");
                self.install_stream(stream);
                if let Some(side) = self.listen_side.take() {
                    self.ep_mut(side).status = ConnectStatus::Accepted;
                }
                self.listen = None;
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(err = %e, "image stream accept failed");
                if let Some(side) = self.listen_side.take() {
                    self.ep_mut(side).status = ConnectStatus::Botched;
                }
                self.listen = None;
                false
            }
        }
    }

    fn install_stream(&mut self, stream: TcpStream) {
        let capacity = self.chan.ring().capacity();
        self.chan = Channel::stream("image", capacity, stream);
    }

    /// Puts the byte channel in motion for an active mover: `Read` fills the
    /// ring from the peer (backup), `Write` drains it to the peer (recover).
    /// The ring must hold at least one full tape record.
    pub fn start(&mut self, mode: ChanMode, record_size: usize) {
        self.chan.reset();
        self.chan.ensure_capacity(record_size.max(DEFAULT_RING_SIZE));
        self.chan.set_mode(mode);
    }

    /// First successful bulk I/O upgrades ACCEPTED endpoints to CONNECTED.
    pub fn note_activity(&mut self) {
        if self.chan.ready || !self.chan.ring().is_empty() {
            for ep in [&mut self.data_ep, &mut self.tape_ep] {
                if ep.status == ConnectStatus::Accepted {
                    ep.status = ConnectStatus::Connected;
                }
            }
        }
    }

    /// The LISTEN channel, for inclusion in the central wait while an accept
    /// is pending.
    pub fn listen_chan_mut(&mut self) -> Option<&mut Channel> {
        self.listen.as_mut()
    }

    /// Both channels of the stream at once, for the central wait.
    pub fn wait_channels(&mut self) -> (&mut Channel, Option<&mut Channel>) {
        (&mut self.chan, self.listen.as_mut())
    }

    pub fn is_listening(&self) -> bool {
        self.listen.is_some()
            || self.data_ep.status == ConnectStatus::Listen
            || self.tape_ep.status == ConnectStatus::Listen
    }

    /// Tears the stream down: cancels any pending accept and detaches both
    /// endpoints.
    pub fn close(&mut self) {
        self.chan.close();
        self.chan = Channel::buffer("image", DEFAULT_RING_SIZE);
        self.listen = None;
        self.listen_side = None;
        self.data_ep.status = ConnectStatus::Idle;
        self.tape_ep.status = ConnectStatus::Idle;
        self.transport = StreamTransport::Local;
    }
}

impl Default for ImageStream {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chan::Wait;
    use std::time::Duration;

    #[test]
    fn local_listen_accept_handshake() {
        let mut is = ImageStream::new();
        is.listen_local(Side::Tape);
        assert_eq!(is.tape_ep.status, ConnectStatus::Listen);

        is.connect_local(Side::Data).unwrap();
        assert_eq!(is.tape_ep.status, ConnectStatus::Accepted);
        assert_eq!(is.data_ep.status, ConnectStatus::Accepted);
    }

    #[test]
    fn local_connect_without_listener_fails() {
        let mut is = ImageStream::new();
        assert!(is.connect_local(Side::Data).is_err());
        assert_eq!(is.data_ep.status, ConnectStatus::Idle);
    }

    #[test]
    fn tcp_listen_then_accept() {
        let mut is = ImageStream::new();
        let addr = is.listen_tcp(Side::Tape).unwrap();
        assert_eq!(is.tape_ep.status, ConnectStatus::Listen);

        let connect_to = SocketAddr::from((Ipv4Addr::LOCALHOST, addr.port()));
        let _peer = std::net::TcpStream::connect(connect_to).unwrap();

        let mut wait = Wait::new().unwrap();
        let mut accepted = false;
        for _ in 0..100 {
            if let Some(lc) = is.listen_chan_mut() {
                wait.quantum(&mut [lc], Duration::from_millis(20)).unwrap();
            }
            if is.poll_accept() {
                accepted = true;
                break;
            }
        }
        assert!(accepted);
        assert_eq!(is.tape_ep.status, ConnectStatus::Accepted);
        assert!(is.chan.is_fd());
    }

    #[test]
    fn close_cancels_pending_listen() {
        let mut is = ImageStream::new();
        is.listen_tcp(Side::Tape).unwrap();
        is.close();
        assert_eq!(is.tape_ep.status, ConnectStatus::Idle);
        assert!(!is.is_listening());
    }
}
