//! Local-loop backup scenarios: DATA and TAPE share the session and the
//! image stream never leaves process memory.

mod common;

use common::{handshake, parse_tape, start_session};
use reel::SessionConfig;
use reel_proto::{
    AddrType, EnvPair, MoverFsmState, MoverHaltReason, MoverMode, NdmpError, Reply, Request,
    TapeOpenMode,
};
use tempfile::TempDir;

fn backup_env(length: u64, fill: &str) -> Vec<EnvPair> {
    vec![EnvPair::new("LENGTH", length.to_string()), EnvPair::new("FILL", fill)]
}

#[test]
fn local_loop_backup_fills_tape() {
    let dir = TempDir::new().unwrap();
    let tape_path = dir.path().join("t.sim");
    std::fs::write(&tape_path, b"").unwrap();

    let (mut client, server) = start_session(SessionConfig::default());
    handshake(&mut client);

    client.rpc_ok(Request::TapeOpen {
        device: tape_path.to_str().unwrap().into(),
        mode: TapeOpenMode::Rdwr,
    });
    client.rpc_ok(Request::MoverSetRecordSize { len: 512 });
    client.rpc_ok(Request::MoverSetWindow { offset: 0, length: 1 << 30 });
    client.rpc_ok(Request::MoverListen { mode: MoverMode::Read, addr_type: AddrType::Local });
    client.rpc_ok(Request::DataStartBackup {
        bu_type: "null".into(),
        env: backup_env(1 << 20, "0xA5"),
    });

    let info = client.wait_mover(|i| i.state == MoverFsmState::Halted);
    assert_eq!(info.halt_reason, MoverHaltReason::ConnectClosed);
    assert_eq!(info.bytes_moved, 1 << 20);

    // 2048 records of 512 bytes each landed on the tape.
    match client.rpc(Request::TapeGetState) {
        Reply::TapeGetState { info, .. } => assert_eq!(info.blockno, Some(2048)),
        other => panic!("unexpected reply {other:?}"),
    }

    client.rpc_ok(Request::MoverStop);
    client.rpc_ok(Request::TapeClose);
    client.rpc_ok(Request::ConnectClose);
    server.join().unwrap();

    // On disk: BOT, the data records, the close-flushed filemark, EOT.
    let records = parse_tape(&tape_path);
    assert_eq!(records.first().unwrap().0, "BOT_");
    assert_eq!(records.last().unwrap().0, "EOT_");
    let data: Vec<_> = records.iter().filter(|(t, _)| t == "DATA").collect();
    assert_eq!(data.len(), 2048);
    for (_, payload) in &data {
        assert_eq!(payload.len(), 512);
        assert!(payload.iter().all(|&b| b == 0xa5));
    }
    assert_eq!(records.iter().filter(|(t, _)| t == "FILE").count(), 1);
}

#[test]
fn short_final_record_is_zero_padded() {
    let dir = TempDir::new().unwrap();
    let tape_path = dir.path().join("t.sim");
    std::fs::write(&tape_path, b"").unwrap();

    let (mut client, server) = start_session(SessionConfig::default());
    handshake(&mut client);

    client.rpc_ok(Request::TapeOpen {
        device: tape_path.to_str().unwrap().into(),
        mode: TapeOpenMode::Rdwr,
    });
    client.rpc_ok(Request::MoverSetRecordSize { len: 512 });
    client.rpc_ok(Request::MoverSetWindow { offset: 0, length: 1 << 30 });
    client.rpc_ok(Request::MoverListen { mode: MoverMode::Read, addr_type: AddrType::Local });
    client.rpc_ok(Request::DataStartBackup {
        bu_type: "null".into(),
        env: backup_env((1 << 20) + 100, "0xA5"),
    });

    let info = client.wait_mover(|i| i.state == MoverFsmState::Halted);
    assert_eq!(info.halt_reason, MoverHaltReason::ConnectClosed);
    // ⌈L/R⌉ full records moved, the final one padded.
    assert_eq!(info.bytes_moved, 2049 * 512);

    client.rpc_ok(Request::ConnectClose);
    server.join().unwrap();

    let records = parse_tape(&tape_path);
    let data: Vec<_> = records.iter().filter(|(t, _)| t == "DATA").collect();
    assert_eq!(data.len(), 2049);
    let (_, last) = data.last().unwrap();
    assert_eq!(last.len(), 512);
    assert!(last[..100].iter().all(|&b| b == 0xa5));
    assert!(last[100..].iter().all(|&b| b == 0));
}

#[test]
fn mover_listen_requires_open_tape() {
    let (mut client, server) = start_session(SessionConfig::default());
    handshake(&mut client);

    let reply = client.rpc(Request::MoverListen {
        mode: MoverMode::Read,
        addr_type: AddrType::Local,
    });
    assert_eq!(reply.error(), NdmpError::DevNotOpen);

    client.rpc_ok(Request::ConnectClose);
    server.join().unwrap();
}

#[test]
fn requests_before_auth_are_rejected() {
    let (mut client, server) = start_session(SessionConfig::default());
    client.rpc_ok(Request::ConnectOpen { version: 3 });

    let reply = client.rpc(Request::TapeGetState);
    assert_eq!(reply.error(), NdmpError::NotAuthorized);

    client.rpc_ok(Request::ConnectClose);
    server.join().unwrap();
}
