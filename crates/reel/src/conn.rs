//! RPC peer: framing, sequence numbering, request intake, correlated
//! replies, and the connection-level auth sub-state.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use mio::net::TcpStream;
use reel_chan::{ChanMode, Channel, Wait};
use reel_proto::xdr::{Reader, Writer};
use reel_proto::{
    AuthAttr, Header, MessageCode, MessageType, NdmpError, ProtoError, ProtocolVersion, Reply,
    Request, HEADER_SIZE, LAST_FRAGMENT,
};
use tracing::{debug, trace, warn};

/// Connection buffer: large enough for one maximal tape record frame.
const CONN_RING_SIZE: usize = 1 << 20;

fn now_secs() -> u32 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as u32).unwrap_or(0)
}

struct PendingCall {
    sequence: u32,
    code: MessageCode,
    reply: Option<Result<Reply, NdmpError>>,
}

/// One NDMP peer. The channel carries inbound bytes; outbound records are
/// staged in `out` and flushed opportunistically (the peer reads control
/// replies promptly, so the backlog stays small).
pub struct Connection {
    pub chan: Channel,
    version: ProtocolVersion,
    /// Authorization is connection-wide state, owned here rather than by any
    /// agent.
    pub authorized: bool,
    next_sequence: u32,
    frag: Vec<u8>,
    out: Vec<u8>,
    out_at: usize,
    pending_call: Option<PendingCall>,
    /// Requests that arrived while waiting on a call, i.e. notifications
    /// from the peer, kept for the caller to consume in order.
    notices: VecDeque<(Header, Request)>,
}

impl Connection {
    /// Server side: wrap an accepted control socket.
    pub fn accept(stream: TcpStream) -> Self {
        let mut chan = Channel::stream("conn", CONN_RING_SIZE, stream);
        chan.set_mode(ChanMode::Read);
        Self {
            chan,
            version: ProtocolVersion::MAX,
            authorized: false,
            next_sequence: 1,
            frag: Vec::new(),
            out: Vec::new(),
            out_at: 0,
            pending_call: None,
            notices: VecDeque::new(),
        }
    }

    /// Client side: blocking connect, then the stream joins the non-blocking
    /// channel set.
    pub fn connect(addr: SocketAddr) -> io::Result<Self> {
        let stream = std::net::TcpStream::connect(addr)?;
        stream.set_nonblocking(true)?;
        Ok(Self::accept(TcpStream::from_std(stream)))
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// CONNECT_OPEN: the peer selects the version; everything after speaks
    /// through the version adapter in the codec.
    pub fn negotiate(&mut self, version: u16) -> Result<(), ProtoError> {
        self.version = ProtocolVersion::validate(version)?;
        debug!(version, "protocol version negotiated");
        Ok(())
    }

    /// Connection auth sub-state. TEXT and NONE are accepted; MD5 digesting
    /// is not implemented.
    pub fn try_auth(&mut self, attr: &AuthAttr) -> NdmpError {
        match attr {
            AuthAttr::None | AuthAttr::Text { .. } => {
                self.authorized = true;
                NdmpError::NoErr
            }
            AuthAttr::Md5 { .. } => NdmpError::NotSupported,
        }
    }

    fn push_record(&mut self, body: &[u8]) {
        let mark = LAST_FRAGMENT | body.len() as u32;
        self.out.extend_from_slice(&mark.to_be_bytes());
        self.out.extend_from_slice(body);
    }

    /// Drains staged outbound bytes into the socket until it blocks.
    pub fn flush(&mut self) {
        while self.out_at < self.out.len() {
            match self.chan.write_direct(&self.out[self.out_at..]) {
                Ok(0) => {
                    self.chan.eof = true;
                    break;
                }
                Ok(n) => self.out_at += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(err = %e, "control connection write failed");
                    self.chan.saved_errno = Some(e.kind());
                    self.chan.eof = true;
                    break;
                }
            }
        }
        if self.out_at == self.out.len() {
            self.out.clear();
            self.out_at = 0;
        }
    }

    pub fn has_backlog(&self) -> bool {
        self.out_at < self.out.len()
    }

    fn send_message(
        &mut self,
        message_type: MessageType,
        code: MessageCode,
        reply_sequence: u32,
        encode_body: impl FnOnce(&mut Writer<'_>),
    ) -> u32 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let header = Header {
            sequence,
            time_stamp: now_secs(),
            message_type,
            code,
            reply_sequence,
            error: NdmpError::NoErr,
        };
        let mut body = Vec::with_capacity(HEADER_SIZE + 64);
        let mut w = Writer::new(&mut body);
        header.encode(&mut w);
        encode_body(&mut w);
        self.push_record(&body);
        self.flush();
        sequence
    }

    /// Posts a request that expects no reply (notifications).
    pub fn post(&mut self, req: &Request) -> u32 {
        trace!(code = ?req.code(), "posting notification");
        let version = self.version;
        self.send_message(MessageType::Request, req.code(), 0, |w| req.encode(w, version))
    }

    /// Answers `req_header` with `reply`.
    pub fn send_reply(&mut self, req_header: &Header, reply: &Reply) {
        let version = self.version;
        self.send_message(MessageType::Reply, req_header.code, req_header.sequence, |w| {
            reply.encode(w, version);
        });
    }

    /// Replies NOT_SUPPORTED to a message code this agent does not know.
    /// The raw code is echoed so the peer can correlate.
    fn send_unknown_reply(&mut self, raw_code: u32, req_sequence: u32) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let mut body = Vec::with_capacity(HEADER_SIZE + 4);
        let mut w = Writer::new(&mut body);
        w.u32(sequence);
        w.u32(now_secs());
        w.u32(MessageType::Reply as u32);
        w.u32(raw_code);
        w.u32(req_sequence);
        w.u32(NdmpError::NotSupported as u32);
        w.u32(NdmpError::NotSupported as u32);
        self.push_record(&body);
        self.flush();
    }

    /// Starts an outgoing call. Only one may be in flight per direction;
    /// a second attempt is a sequence error.
    pub fn call_start(&mut self, req: &Request) -> Result<u32, ProtoError> {
        if self.pending_call.is_some() {
            return Err(ProtoError::CallInFlight);
        }
        let version = self.version;
        let code = req.code();
        let sequence =
            self.send_message(MessageType::Request, code, 0, |w| req.encode(w, version));
        self.pending_call = Some(PendingCall { sequence, code, reply: None });
        Ok(sequence)
    }

    /// Takes the completed reply of the in-flight call, if it has arrived.
    pub fn call_take(&mut self) -> Option<Result<Reply, NdmpError>> {
        if self.pending_call.as_ref().is_some_and(|p| p.reply.is_some()) {
            return self.pending_call.take().and_then(|p| p.reply);
        }
        None
    }

    /// Synchronous call used by driving roles: pumps the channel through
    /// `wait` until the matching reply arrives. Server dispatch never calls
    /// this; it would re-enter the scheduler.
    pub fn call(
        &mut self,
        wait: &mut Wait,
        req: &Request,
        timeout: Duration,
    ) -> Result<Reply, ProtoError> {
        self.call_start(req)?;
        let deadline = Instant::now() + timeout;
        loop {
            self.flush();
            wait.quantum(&mut [&mut self.chan], Duration::from_millis(50))
                .map_err(|_| ProtoError::ConnectionClosed)?;
            // Interleaved requests are notifications; keep them for the
            // caller. Replies route to the pending call as a side effect.
            while let Some(notice) = self.next_request()? {
                self.notices.push_back(notice);
            }
            if let Some(reply) = self.call_take() {
                return reply.map_err(|_| ProtoError::ConnectionClosed);
            }
            if self.chan.eof {
                return Err(ProtoError::ConnectionClosed);
            }
            if Instant::now() >= deadline {
                return Err(ProtoError::ConnectionClosed);
            }
        }
    }

    /// Next notification the peer posted, if any was buffered during calls.
    pub fn take_notice(&mut self) -> Option<(Header, Request)> {
        self.notices.pop_front()
    }

    /// Waits for a notification from the peer.
    pub fn recv_notice(
        &mut self,
        wait: &mut Wait,
        timeout: Duration,
    ) -> Result<(Header, Request), ProtoError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(notice) = self.take_notice() {
                return Ok(notice);
            }
            self.flush();
            wait.quantum(&mut [&mut self.chan], Duration::from_millis(50))
                .map_err(|_| ProtoError::ConnectionClosed)?;
            if let Some(pair) = self.next_request()? {
                return Ok(pair);
            }
            if self.chan.eof || Instant::now() >= deadline {
                return Err(ProtoError::ConnectionClosed);
            }
        }
    }

    /// Pulls one complete record off the ring, reassembling fragments.
    fn next_frame(&mut self) -> Result<Option<Vec<u8>>, ProtoError> {
        loop {
            let ring = self.chan.ring_mut();
            if ring.n_ready() < 4 {
                return Ok(None);
            }
            let mut mark = [0u8; 4];
            ring.peek(&mut mark);
            let mark = u32::from_be_bytes(mark);
            let len = (mark & !LAST_FRAGMENT) as usize;
            let last = mark & LAST_FRAGMENT != 0;
            if len + 4 > ring.capacity() || self.frag.len() + len > reel_proto::MAX_FRAME_LEN {
                return Err(ProtoError::FrameTooLong(len));
            }
            if ring.n_ready() < 4 + len {
                return Ok(None);
            }
            ring.consume(4);
            let mut payload = vec![0u8; len];
            ring.copy_out(&mut payload);
            if last && self.frag.is_empty() {
                return Ok(Some(payload));
            }
            self.frag.extend_from_slice(&payload);
            if last {
                return Ok(Some(std::mem::take(&mut self.frag)));
            }
        }
    }

    /// Returns the next inbound request, routing replies to the in-flight
    /// call and answering unknown message codes on the spot.
    pub fn next_request(&mut self) -> Result<Option<(Header, Request)>, ProtoError> {
        loop {
            let Some(frame) = self.next_frame()? else {
                return Ok(None);
            };
            let mut r = Reader::new(&frame);
            let header = match Header::decode(&mut r) {
                Ok(h) => h,
                Err(ProtoError::UnknownMessage(raw)) => {
                    // Header layout is fixed, so the sequence is recoverable
                    // even when the code is not.
                    let seq = u32::from_be_bytes(frame[0..4].try_into().unwrap());
                    let mt = u32::from_be_bytes(frame[8..12].try_into().unwrap());
                    warn!(code = format_args!("{raw:#x}"), "unknown message");
                    if mt == MessageType::Request as u32 {
                        self.send_unknown_reply(raw, seq);
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };
            match header.message_type {
                MessageType::Reply => {
                    self.route_reply(&header, &mut r);
                }
                MessageType::Request => {
                    let req = Request::decode(header.code, &mut r, self.version)?;
                    trace!(code = ?header.code, seq = header.sequence, "request");
                    return Ok(Some((header, req)));
                }
            }
        }
    }

    fn route_reply(&mut self, header: &Header, r: &mut Reader<'_>) {
        let Some(pending) = self.pending_call.as_mut() else {
            debug!(seq = header.reply_sequence, "reply with no call outstanding");
            return;
        };
        if pending.sequence != header.reply_sequence || pending.code != header.code {
            debug!(
                want = pending.sequence,
                got = header.reply_sequence,
                "reply does not match the in-flight call"
            );
            return;
        }
        pending.reply = Some(if header.error != NdmpError::NoErr {
            Err(header.error)
        } else {
            Reply::decode(header.code, r, self.version).map_err(|e| {
                warn!(err = %e, "undecodable reply");
                NdmpError::Undefined
            })
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reel_proto::TapeOpenMode;

    fn pipe() -> (Connection, Connection) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = Connection::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (client, Connection::accept(TcpStream::from_std(server)))
    }

    fn pump(wait: &mut Wait, conn: &mut Connection) {
        conn.flush();
        wait.quantum(&mut [&mut conn.chan], Duration::from_millis(20)).unwrap();
    }

    #[test]
    fn request_travels_and_reply_correlates() {
        let (mut client, mut server) = pipe();
        let mut wait = Wait::new().unwrap();

        let req = Request::TapeOpen { device: "t.sim".into(), mode: TapeOpenMode::Rdwr };
        let seq = client.call_start(&req).unwrap();

        // Server receives the request.
        let (header, got) = loop {
            pump(&mut wait, &mut server);
            if let Some(pair) = server.next_request().unwrap() {
                break pair;
            }
        };
        assert_eq!(header.sequence, seq);
        assert_eq!(got, req);

        // Server answers; client sees the correlated reply.
        server.send_reply(&header, &Reply::Error { error: NdmpError::NoErr });
        let reply = loop {
            pump(&mut wait, &mut client);
            while client.next_request().unwrap().is_some() {}
            if let Some(r) = client.call_take() {
                break r;
            }
        };
        assert_eq!(reply.unwrap().error(), NdmpError::NoErr);
    }

    #[test]
    fn second_call_in_flight_is_rejected() {
        let (mut client, _server) = pipe();
        client.call_start(&Request::TapeGetState).unwrap();
        let err = client.call_start(&Request::TapeGetState);
        assert!(matches!(err, Err(ProtoError::CallInFlight)));
    }

    #[test]
    fn auth_sub_state() {
        let (mut client, _server) = pipe();
        assert!(!client.authorized);
        assert_eq!(
            client.try_auth(&AuthAttr::Md5 { id: "x".into(), digest: [0; 16] }),
            NdmpError::NotSupported
        );
        assert!(!client.authorized);
        assert_eq!(
            client.try_auth(&AuthAttr::Text { id: "x".into(), password: "y".into() }),
            NdmpError::NoErr
        );
        assert!(client.authorized);
    }

    #[test]
    fn fragmented_record_is_reassembled() {
        let (mut client, mut server) = pipe();
        let mut wait = Wait::new().unwrap();

        // Hand-build a two-fragment CONNECT_OPEN request.
        let header = Header {
            sequence: 9,
            time_stamp: 0,
            message_type: MessageType::Request,
            code: MessageCode::ConnectOpen,
            reply_sequence: 0,
            error: NdmpError::NoErr,
        };
        let mut body = Vec::new();
        let mut w = Writer::new(&mut body);
        header.encode(&mut w);
        w.u32(4);
        let (a, b) = body.split_at(10);
        let mut raw = Vec::new();
        raw.extend_from_slice(&(a.len() as u32).to_be_bytes()); // not last
        raw.extend_from_slice(a);
        raw.extend_from_slice(&(LAST_FRAGMENT | b.len() as u32).to_be_bytes());
        raw.extend_from_slice(b);
        client.out.extend_from_slice(&raw);
        client.flush();

        let (got_header, got) = loop {
            pump(&mut wait, &mut server);
            if let Some(pair) = server.next_request().unwrap() {
                break pair;
            }
        };
        assert_eq!(got_header.sequence, 9);
        assert_eq!(got, Request::ConnectOpen { version: 4 });
    }

    #[test]
    fn unknown_message_code_answers_not_supported() {
        let (mut client, mut server) = pipe();
        let mut wait = Wait::new().unwrap();

        let mut body = Vec::new();
        let mut w = Writer::new(&mut body);
        w.u32(77); // sequence
        w.u32(0);
        w.u32(MessageType::Request as u32);
        w.u32(0xdead); // no such code
        w.u32(0);
        w.u32(0);
        client.push_record(&body);
        client.flush();

        // Server answers without surfacing a request.
        loop {
            pump(&mut wait, &mut server);
            assert!(server.next_request().unwrap().is_none());
            if !server.has_backlog() {
                break;
            }
        }

        // The client sees a raw NOT_SUPPORTED reply for sequence 77.
        let frame = loop {
            pump(&mut wait, &mut client);
            if let Some(f) = client.next_frame().unwrap() {
                break f;
            }
        };
        let mut r = Reader::new(&frame);
        r.u32().unwrap(); // sequence
        r.u32().unwrap(); // time
        assert_eq!(r.u32().unwrap(), MessageType::Reply as u32);
        assert_eq!(r.u32().unwrap(), 0xdead);
        assert_eq!(r.u32().unwrap(), 77);
        assert_eq!(r.u32().unwrap(), NdmpError::NotSupported as u32);
    }
}
