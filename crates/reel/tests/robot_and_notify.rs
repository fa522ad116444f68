//! ROBOT agent over RPC, and the notification path for mover/data
//! transitions.

mod common;

use std::time::Duration;

use common::{handshake, start_session};
use reel::SessionConfig;
use reel_proto::{
    AddrType, CdbRequest, ConnectReason, DataHaltReason, EnvPair, MoverMode, MoverPauseReason,
    Reply, Request, ScsiDataDir, TapeOpenMode,
};
use tempfile::TempDir;

fn move_medium_cdb(mte: u16, src: u16, dest: u16) -> CdbRequest {
    let mut cdb = vec![0u8; 12];
    cdb[0] = 0xa5;
    cdb[2..4].copy_from_slice(&mte.to_be_bytes());
    cdb[4..6].copy_from_slice(&src.to_be_bytes());
    cdb[6..8].copy_from_slice(&dest.to_be_bytes());
    CdbRequest { cdb, data_dir: ScsiDataDir::None, timeout_ms: 0, datain_len: 0, dataout: Vec::new() }
}

fn read_element_status_cdb(response_len: usize) -> CdbRequest {
    let mut cdb = vec![0u8; 12];
    cdb[0] = 0xb8;
    cdb[4..6].copy_from_slice(&100u16.to_be_bytes());
    cdb[7] = (response_len >> 16) as u8;
    cdb[8] = (response_len >> 8) as u8;
    cdb[9] = response_len as u8;
    CdbRequest {
        cdb,
        data_dir: ScsiDataDir::In,
        timeout_ms: 0,
        datain_len: response_len as u32,
        dataout: Vec::new(),
    }
}

#[test]
fn robot_move_medium_over_rpc() {
    let dir = TempDir::new().unwrap();
    let (mut client, server) = start_session(SessionConfig::default());
    handshake(&mut client);

    client.rpc_ok(Request::ScsiOpen { device: dir.path().to_str().unwrap().into() });

    let cdb = match client.rpc_ok(Request::ScsiExecuteCdb(move_medium_cdb(16, 1024, 128))) {
        Reply::ScsiExecuteCdb { cdb, .. } => cdb,
        other => panic!("unexpected reply {other:?}"),
    };
    assert_eq!(cdb.status, 0, "MOVE MEDIUM should report GOOD");

    let report = match client.rpc_ok(Request::ScsiExecuteCdb(read_element_status_cdb(4096))) {
        Reply::ScsiExecuteCdb { cdb, .. } => cdb,
        other => panic!("unexpected reply {other:?}"),
    };
    assert_eq!(report.status, 0);
    // The moved volume shows up in drive 128 with its source recorded.
    let datain = &report.datain;
    let mut found = false;
    let mut at = 8;
    while at + 8 <= datain.len() {
        let descr = datain[at + 3] as usize;
        let total = ((datain[at + 5] as usize) << 16)
            + ((datain[at + 6] as usize) << 8)
            + datain[at + 7] as usize;
        if descr == 0 {
            break;
        }
        at += 8;
        let mut off = at;
        while off + descr <= at + total {
            if u16::from_be_bytes([datain[off], datain[off + 1]]) == 128 {
                assert_eq!(datain[off + 2], 0x81, "drive is full");
                assert_eq!(u16::from_be_bytes([datain[off + 10], datain[off + 11]]), 1024);
                found = true;
            }
            off += descr;
        }
        at += total;
    }
    assert!(found, "drive 128 missing from element report");

    client.rpc_ok(Request::ScsiClose);
    client.rpc_ok(Request::ConnectClose);
    server.join().unwrap();
}

#[test]
fn transitions_notify_the_control_peer() {
    let dir = TempDir::new().unwrap();
    let tape_path = dir.path().join("t.sim");
    std::fs::write(&tape_path, b"").unwrap();

    let (mut client, server) = start_session(SessionConfig::default());

    // The server announces itself before anything else.
    let (_, notice) = client
        .conn
        .recv_notice(&mut client.wait, Duration::from_secs(5))
        .unwrap();
    assert!(matches!(
        notice,
        Request::NotifyConnected { reason: ConnectReason::Connected, .. }
    ));

    handshake(&mut client);
    client.rpc_ok(Request::TapeOpen {
        device: tape_path.to_str().unwrap().into(),
        mode: TapeOpenMode::Rdwr,
    });
    client.rpc_ok(Request::MoverSetRecordSize { len: 512 });
    // A window of one record forces a SEEK pause immediately after the
    // first tape write.
    client.rpc_ok(Request::MoverSetWindow { offset: 0, length: 512 });
    client.rpc_ok(Request::MoverListen { mode: MoverMode::Read, addr_type: AddrType::Local });
    client.rpc_ok(Request::DataStartBackup {
        bu_type: "null".into(),
        env: vec![EnvPair::new("LENGTH", "1024"), EnvPair::new("FILL", "0x11")],
    });

    let mut saw_pause = false;
    let mut saw_data_halt = false;
    for _ in 0..2 {
        let (_, notice) = client
            .conn
            .recv_notice(&mut client.wait, Duration::from_secs(5))
            .unwrap();
        match notice {
            Request::NotifyMoverPaused { reason, seek_position } => {
                assert_eq!(reason, MoverPauseReason::Seek);
                assert_eq!(seek_position, 512);
                saw_pause = true;
            }
            Request::NotifyDataHalted { reason, .. } => {
                assert_eq!(reason, DataHaltReason::Successful);
                saw_data_halt = true;
            }
            other => panic!("unexpected notification {other:?}"),
        }
    }
    assert!(saw_pause);
    assert!(saw_data_halt);

    client.rpc_ok(Request::ConnectClose);
    server.join().unwrap();
}
