//! Shared harness: an in-process server session plus a driving client.
#![allow(dead_code)] // each test binary uses a different subset

use std::net::TcpListener;
use std::path::Path;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use reel::session::server_session;
use reel::{Connection, SessionConfig};
use reel_chan::Wait;
use reel_proto::{AuthAttr, MoverStateInfo, NdmpError, Reply, Request};

pub struct Client {
    pub conn: Connection,
    pub wait: Wait,
}

impl Client {
    pub fn rpc(&mut self, req: Request) -> Reply {
        self.conn
            .call(&mut self.wait, &req, Duration::from_secs(10))
            .expect("rpc call failed")
    }

    pub fn rpc_ok(&mut self, req: Request) -> Reply {
        let reply = self.rpc(req);
        assert_eq!(reply.error(), NdmpError::NoErr, "unexpected error reply");
        reply
    }

    pub fn mover_state(&mut self) -> MoverStateInfo {
        match self.rpc(Request::MoverGetState) {
            Reply::MoverGetState { info, .. } => info,
            other => panic!("unexpected reply {other:?}"),
        }
    }

    /// Polls MOVER_GET_STATE until `pred` holds.
    pub fn wait_mover(&mut self, pred: impl Fn(&MoverStateInfo) -> bool) -> MoverStateInfo {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let info = self.mover_state();
            if pred(&info) {
                return info;
            }
            assert!(Instant::now() < deadline, "mover never reached state, last {info:?}");
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

/// Boots a one-connection server session on an ephemeral port and connects
/// a client to it.
pub fn start_session(config: SessionConfig) -> (Client, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        server_session(config, stream).unwrap();
    });
    let conn = Connection::connect(addr).unwrap();
    let client = Client { conn, wait: Wait::new().unwrap() };
    (client, handle)
}

/// CONNECT_OPEN + text auth.
pub fn handshake(client: &mut Client) {
    client.rpc_ok(Request::ConnectOpen { version: 4 });
    client.rpc_ok(Request::ConnectClientAuth {
        auth: AuthAttr::Text { id: "operator".into(), password: "secret".into() },
    });
}

/// Parses a simulator tape file into `(rectype_tag, payload)` pairs,
/// including the BOT and EOT sentinels.
pub fn parse_tape(path: &Path) -> Vec<(String, Vec<u8>)> {
    let bytes = std::fs::read(path).unwrap();
    let mut out = Vec::new();
    let mut at = 0;
    while at + 16 <= bytes.len() {
        let magic = u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap());
        assert_eq!(magic, reel_tape::GAP_MAGIC, "bad gap magic at offset {at}");
        let tag = String::from_utf8_lossy(&bytes[at + 4..at + 8]).into_owned();
        let size = u32::from_le_bytes(bytes[at + 12..at + 16].try_into().unwrap()) as usize;
        let payload = bytes[at + 16..at + 16 + size].to_vec();
        at += 16 + size;
        let last = tag == "EOT_";
        out.push((tag, payload));
        if last {
            break;
        }
    }
    out
}
