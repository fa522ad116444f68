//! Session aggregate and the cooperative quantum scheduler.
//!
//! One session runs everything on one thread: agents get non-blocking
//! slices, the single poll wait in the middle of [`Session::quantum`] is the
//! only place the session suspends, and control requests are dispatched
//! after the wait.

use std::io;
use std::net::TcpListener;
use std::time::Duration;

use mio::net::TcpStream;
use reel_chan::{Channel, ImageStream, Wait};
use reel_proto::{ConnectReason, DataFsmState, MoverFsmState, ProtocolVersion, Request};
use reel_robot::RobotSim;
use reel_tape::{TapeDevice, TapeLimits};
use tracing::{debug, info, warn};

use crate::conn::Connection;
use crate::data::DataAgent;
use crate::dispatch;
use crate::mover::TapeAgent;

#[derive(Debug, Clone, Copy, Default)]
pub struct SessionConfig {
    /// Byte ceiling for simulated tapes; `None` means unlimited.
    pub tape_limits: Option<TapeLimits>,
}

/// Which connection carries each role. Roles may alias a single connection;
/// the scheduler de-duplicates.
#[derive(Debug, Default)]
pub struct Plumb {
    pub control: Option<usize>,
    pub data: Option<usize>,
    pub tape: Option<usize>,
    pub robot: Option<usize>,
}

pub struct Session {
    pub wait: Wait,
    pub conns: Vec<Connection>,
    pub plumb: Plumb,
    pub image: ImageStream,
    pub tape: TapeAgent,
    pub data: DataAgent,
    pub robot: RobotSim,
}

impl Session {
    pub fn new(config: SessionConfig) -> io::Result<Self> {
        Ok(Self {
            wait: Wait::new()?,
            conns: Vec::new(),
            plumb: Plumb::default(),
            image: ImageStream::new(),
            tape: TapeAgent::new(config.tape_limits),
            data: DataAgent::new(),
            robot: RobotSim::new(),
        })
    }

    pub fn add_connection(&mut self, conn: Connection) -> usize {
        self.conns.push(conn);
        self.conns.len() - 1
    }

    /// Distinct connections in role order.
    fn conn_set(&self) -> Vec<usize> {
        let mut set = Vec::with_capacity(4);
        for role in [self.plumb.control, self.plumb.data, self.plumb.tape, self.plumb.robot] {
            if let Some(i) = role {
                if !set.contains(&i) {
                    set.push(i);
                }
            }
        }
        set
    }

    /// Lets the image stream and the active agents make all the progress
    /// they can without blocking. Returns true if anything happened.
    pub fn distribute_quantum(&mut self) -> bool {
        let mut total = false;
        loop {
            let mut did = false;
            if self.image.is_listening() && self.image.poll_accept() {
                did = true;
                // A DATA-side accept completes the data agent's listen.
                if self.data.state == DataFsmState::Listen && self.image.data_ep.is_attached() {
                    let addr = self
                        .image
                        .chan
                        .peer_addr()
                        .map_or(reel_proto::Addr::Local, reel_proto::Addr::from_socket_addr);
                    self.data.connected(addr);
                }
            }
            self.image.note_activity();
            if self.tape.mover.state != MoverFsmState::Idle {
                did |= self.tape.quantum(&mut self.image);
            }
            if self.data.state != DataFsmState::Idle {
                did |= self.data.quantum(&mut self.image);
            }
            total |= did;
            if !did {
                break;
            }
        }
        total
    }

    /// One scheduler turn: agent slices, the central wait, more agent
    /// slices, then control dispatch and pending notifications.
    pub fn quantum(&mut self, max_delay: Duration) -> io::Result<()> {
        let set = self.conn_set();

        let mut delay = max_delay;
        if self.distribute_quantum() {
            delay = Duration::ZERO;
        }
        for &i in &set {
            self.conns[i].flush();
        }

        {
            let mut chans: Vec<&mut Channel> = Vec::new();
            for (i, c) in self.conns.iter_mut().enumerate() {
                if set.contains(&i) {
                    chans.push(&mut c.chan);
                }
            }
            let (image_chan, listen_chan) = self.image.wait_channels();
            if let Some(lc) = listen_chan {
                chans.push(lc);
            }
            chans.push(image_chan);
            self.wait.quantum(&mut chans, delay)?;
        }

        self.image.note_activity();
        self.distribute_quantum();

        for &i in &set {
            if self.conns[i].chan.ready {
                self.conns[i].chan.ready = false;
                dispatch::dispatch_conn(self, i);
            }
        }

        self.send_notices();
        for &i in &set {
            self.conns[i].flush();
        }
        Ok(())
    }

    /// Emits at most one notification per agent transition per quantum;
    /// redundant notifications are suppressed.
    fn send_notices(&mut self) {
        let Some(ci) = self.plumb.control else {
            self.tape.notify_pending = false;
            self.data.notify_pending = false;
            return;
        };
        if self.tape.notify_pending {
            self.tape.notify_pending = false;
            match self.tape.mover.state {
                MoverFsmState::Halted => {
                    self.conns[ci].post(&Request::NotifyMoverHalted {
                        reason: self.tape.mover.halt_reason,
                        text: String::new(),
                    });
                }
                MoverFsmState::Paused => {
                    self.conns[ci].post(&Request::NotifyMoverPaused {
                        reason: self.tape.mover.pause_reason,
                        seek_position: self.tape.mover.seek_position,
                    });
                }
                _ => {} // transition already superseded
            }
        }
        if self.data.notify_pending {
            self.data.notify_pending = false;
            if self.data.state == DataFsmState::Halted {
                let reason = self.data.halt_reason;
                self.conns[ci].post(&Request::NotifyDataHalted { reason, text: String::new() });
            }
        }
    }

    /// Releases everything the session holds: open tape (and its lockfile),
    /// image stream, channels.
    pub fn decommission(&mut self) {
        if self.tape.device.is_open() {
            let _ = self.tape.device.close();
        }
        self.image.close();
        for conn in &mut self.conns {
            conn.chan.close();
        }
        debug!("session decommissioned");
    }
}

/// Runs one server session over an accepted control socket, until the peer
/// closes the connection.
pub fn server_session(config: SessionConfig, stream: std::net::TcpStream) -> io::Result<()> {
    let peer = stream.peer_addr().ok();
    stream.set_nodelay(true)?;
    stream.set_nonblocking(true)?;

    let mut sess = Session::new(config)?;
    let ci = sess.add_connection(Connection::accept(TcpStream::from_std(stream)));
    sess.plumb =
        Plumb { control: Some(ci), data: Some(ci), tape: Some(ci), robot: Some(ci) };
    info!(?peer, "connection accepted");

    sess.conns[ci].post(&Request::NotifyConnected {
        reason: ConnectReason::Connected,
        protocol_version: ProtocolVersion::MAX.0,
        text: "reel".into(),
    });

    while !sess.conns[ci].chan.eof {
        sess.quantum(Duration::from_secs(1))?;
    }
    info!(?peer, "connection closed");
    sess.decommission();
    Ok(())
}

/// Accept-loop failures, split so the daemon can exit with the
/// conventional code for each.
#[derive(thiserror::Error, Debug)]
pub enum ServeError {
    #[error("accept failed: {0}")]
    Accept(io::Error),
    #[error("session thread spawn failed: {0}")]
    Spawn(io::Error),
}

/// Accept loop: one isolated session per connection, each on its own
/// thread (sessions share no mutable state).
pub fn serve(listener: TcpListener, config: SessionConfig) -> Result<(), ServeError> {
    loop {
        let (stream, peer) = listener.accept().map_err(ServeError::Accept)?;
        debug!(?peer, "accepted");
        std::thread::Builder::new()
            .name(format!("session-{peer}"))
            .spawn(move || {
                if let Err(e) = server_session(config, stream) {
                    warn!(err = %e, "session failed");
                }
            })
            .map_err(ServeError::Spawn)?;
    }
}
