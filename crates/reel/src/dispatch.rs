//! Request dispatcher: maps decoded requests onto agent operations and
//! builds the reply for each.

use std::net::SocketAddr;
use std::path::Path;

use reel_chan::Side;
use reel_proto::{
    Addr, AddrType, Header, MoverFsmState, MoverMode, MoverPauseReason, MtioOpCode, NdmpError,
    Reply, Request, TapeAgentState, TapeOpenMode, TapeStateInfo, DataFsmState,
};
use reel_tape::{MtioOp, OpenMode, TapeDevice, TapeError};
use tracing::{debug, warn};

use crate::session::Session;

/// Upper bound on the mover record size and on a single TAPE_READ.
pub const MAX_RECORD_SIZE: u32 = 512 * 1024;

fn tape_error(e: TapeError) -> NdmpError {
    match e {
        TapeError::NoDevice => NdmpError::NoDevice,
        TapeError::WriteProtect => NdmpError::WriteProtect,
        TapeError::DeviceBusy => NdmpError::DeviceBusy,
        TapeError::Permission => NdmpError::Permission,
        TapeError::NoTapeLoaded => NdmpError::NoTapeLoaded,
        TapeError::Io => NdmpError::Io,
        TapeError::DeviceOpened => NdmpError::DeviceOpened,
        TapeError::DevNotOpen => NdmpError::DevNotOpen,
        TapeError::Eof => NdmpError::Eof,
        TapeError::Eom => NdmpError::Eom,
        TapeError::IllegalArgs => NdmpError::IllegalArgs,
    }
}

fn err_reply(error: NdmpError) -> Reply {
    Reply::Error { error }
}

fn ok_reply() -> Reply {
    Reply::Error { error: NdmpError::NoErr }
}

fn tape_result(res: Result<(), TapeError>) -> Reply {
    match res {
        Ok(()) => ok_reply(),
        Err(e) => err_reply(tape_error(e)),
    }
}

/// Processes every complete request buffered on a ready connection.
pub fn dispatch_conn(sess: &mut Session, ci: usize) {
    loop {
        match sess.conns[ci].next_request() {
            Ok(Some((header, req))) => handle_request(sess, ci, &header, req),
            Ok(None) => break,
            Err(e) => {
                warn!(err = %e, "protocol error, dropping connection");
                sess.conns[ci].chan.eof = true;
                sess.conns[ci].chan.close();
                break;
            }
        }
    }
}

fn handle_request(sess: &mut Session, ci: usize, header: &Header, req: Request) {
    if !sess.conns[ci].authorized && !header.code.is_connect() {
        sess.conns[ci].send_reply(header, &err_reply(NdmpError::NotAuthorized));
        return;
    }

    let reply = match req {
        Request::ConnectOpen { version } => Some(match sess.conns[ci].negotiate(version) {
            Ok(()) => ok_reply(),
            Err(_) => err_reply(NdmpError::IllegalArgs),
        }),
        Request::ConnectClientAuth { auth } => {
            let error = sess.conns[ci].try_auth(&auth);
            Some(err_reply(error))
        }
        Request::ConnectClose => {
            sess.conns[ci].send_reply(header, &ok_reply());
            sess.conns[ci].chan.eof = true;
            None
        }

        Request::ScsiOpen { device } => Some(match sess.robot.open(Path::new(&device)) {
            Ok(()) => ok_reply(),
            Err(e) => err_reply(e),
        }),
        Request::ScsiClose => Some(if sess.robot.is_open() {
            sess.robot.close();
            ok_reply()
        } else {
            err_reply(NdmpError::DevNotOpen)
        }),
        Request::ScsiResetDevice => Some(match sess.robot.reset() {
            Ok(()) => ok_reply(),
            Err(e) => err_reply(e),
        }),
        Request::ScsiExecuteCdb(cdb) => Some(match sess.robot.execute_cdb(&cdb) {
            Ok(r) => Reply::ScsiExecuteCdb { error: NdmpError::NoErr, cdb: r },
            Err(e) => err_reply(e),
        }),

        Request::TapeOpen { device, mode } => {
            let open_mode = match mode {
                TapeOpenMode::Read => OpenMode::Read,
                TapeOpenMode::Rdwr => OpenMode::ReadWrite,
            };
            Some(tape_result(sess.tape.device.open(Path::new(&device), open_mode)))
        }
        Request::TapeClose => Some(if mover_owns_tape(sess) {
            err_reply(NdmpError::IllegalState)
        } else {
            tape_result(sess.tape.device.close())
        }),
        Request::TapeGetState => Some(tape_get_state(sess)),
        Request::TapeMtio { op, count } => Some(handle_tape_mtio(sess, op, count)),
        Request::TapeWrite { data } => Some(if mover_owns_tape(sess) {
            err_reply(NdmpError::IllegalState)
        } else {
            match sess.tape.device.write(&data) {
                Ok(n) => Reply::TapeWrite { error: NdmpError::NoErr, count: n as u32 },
                Err(e) => Reply::TapeWrite { error: tape_error(e), count: 0 },
            }
        }),
        Request::TapeRead { count } => Some(handle_tape_read(sess, count)),

        Request::DataGetState => {
            Some(Reply::DataGetState { error: NdmpError::NoErr, info: sess.data.state_info() })
        }
        Request::DataListen { addr_type } => Some(handle_data_listen(sess, ci, addr_type)),
        Request::DataConnect { addr } => Some(handle_data_connect(sess, addr)),
        Request::DataStartBackup { bu_type, env } => {
            Some(match attach_local_data(sess) {
                Ok(()) => match sess.data.start_backup(&bu_type, env) {
                    Ok(()) => ok_reply(),
                    Err(e) => err_reply(e),
                },
                Err(e) => err_reply(e),
            })
        }
        Request::DataStartRecover { bu_type, env, nlist } => {
            Some(match attach_local_data(sess) {
                Ok(()) => match sess.data.start_recover(&bu_type, env, nlist, false) {
                    Ok(()) => ok_reply(),
                    Err(e) => err_reply(e),
                },
                Err(e) => err_reply(e),
            })
        }
        Request::DataStartRecoverFilehist { bu_type, env, nlist } => {
            Some(match attach_local_data(sess) {
                Ok(()) => match sess.data.start_recover(&bu_type, env, nlist, true) {
                    Ok(()) => ok_reply(),
                    Err(e) => err_reply(e),
                },
                Err(e) => err_reply(e),
            })
        }
        Request::DataAbort => Some(match sess.data.state {
            DataFsmState::Idle | DataFsmState::Halted => err_reply(NdmpError::IllegalState),
            _ => {
                sess.data.abort();
                ok_reply()
            }
        }),
        Request::DataGetEnv => {
            Some(Reply::DataGetEnv { error: NdmpError::NoErr, env: sess.data.env.clone() })
        }
        Request::DataStop => Some(if sess.data.state == DataFsmState::Halted {
            sess.data.stop();
            ok_reply()
        } else {
            err_reply(NdmpError::IllegalState)
        }),

        Request::MoverGetState => {
            sess.tape.sync_state();
            Some(Reply::MoverGetState { error: NdmpError::NoErr, info: sess.tape.state_info() })
        }
        Request::MoverListen { mode, addr_type } => {
            Some(handle_mover_listen(sess, ci, mode, addr_type))
        }
        Request::MoverConnect { mode, addr } => Some(handle_mover_connect(sess, mode, addr)),
        Request::MoverContinue => Some(handle_mover_continue(sess)),
        Request::MoverAbort => Some(match sess.tape.mover.state {
            MoverFsmState::Listen | MoverFsmState::Active | MoverFsmState::Paused => {
                sess.tape.abort(&mut sess.image);
                ok_reply()
            }
            _ => err_reply(NdmpError::IllegalState),
        }),
        Request::MoverStop => Some(if sess.tape.mover.state == MoverFsmState::Halted {
            sess.tape.stop();
            sess.image.close();
            ok_reply()
        } else {
            err_reply(NdmpError::IllegalState)
        }),
        Request::MoverSetWindow { offset, length } => Some(match sess.tape.mover.state {
            MoverFsmState::Idle | MoverFsmState::Listen | MoverFsmState::Paused => {
                sess.tape.set_window(offset, length);
                ok_reply()
            }
            _ => err_reply(NdmpError::IllegalState),
        }),
        Request::MoverRead { offset, length } => Some(match sess.tape.mover.state {
            // A stricter reading than some agents: overwriting an
            // outstanding read is a sequencing fault, not a silent restart.
            MoverFsmState::Active if sess.tape.mover.bytes_left_to_read > 0 => {
                err_reply(NdmpError::Sequence)
            }
            MoverFsmState::Active | MoverFsmState::Listen | MoverFsmState::Paused => {
                sess.tape.read(offset, length);
                ok_reply()
            }
            _ => err_reply(NdmpError::IllegalState),
        }),
        Request::MoverClose => Some(if sess.tape.mover.state == MoverFsmState::Halted {
            // The recorded halt reason stands; a redundant close is an
            // error, not a new CONNECT_CLOSED.
            err_reply(NdmpError::IllegalState)
        } else {
            sess.tape.halt(reel_proto::MoverHaltReason::ConnectClosed, &mut sess.image);
            ok_reply()
        }),
        Request::MoverSetRecordSize { len } => Some(handle_set_record_size(sess, len)),

        Request::NotifyDataHalted { .. }
        | Request::NotifyConnected { .. }
        | Request::NotifyMoverHalted { .. }
        | Request::NotifyMoverPaused { .. }
        | Request::NotifyDataRead { .. } => {
            debug!(code = ?header.code, "ignoring notification from peer");
            None
        }
    };

    if let Some(reply) = reply {
        sess.conns[ci].send_reply(header, &reply);
    }
}

fn mover_owns_tape(sess: &Session) -> bool {
    sess.tape.mover.state == MoverFsmState::Active
}

fn tape_get_state(sess: &mut Session) -> Reply {
    let dev = &sess.tape.device;
    if dev.is_open() {
        let c = dev.counters();
        let info = TapeStateInfo {
            state: if mover_owns_tape(sess) {
                TapeAgentState::Mover
            } else {
                TapeAgentState::Open
            },
            open_mode: match dev.open_mode() {
                Some(OpenMode::ReadWrite) => TapeOpenMode::Rdwr,
                _ => TapeOpenMode::Read,
            },
            file_num: Some(c.file_num),
            soft_errors: Some(c.soft_errors),
            block_size: Some(u64::from(c.block_size)),
            blockno: Some(c.blockno),
            total_space: c.total_space,
            space_remain: c.space_remain,
        };
        Reply::TapeGetState { error: NdmpError::NoErr, info }
    } else {
        // Zero-filled reply with the error set; the FSM is untouched.
        Reply::TapeGetState { error: NdmpError::DevNotOpen, info: TapeStateInfo::closed() }
    }
}

fn handle_tape_mtio(sess: &mut Session, op: MtioOpCode, count: u32) -> Reply {
    if mover_owns_tape(sess) {
        return err_reply(NdmpError::IllegalState);
    }
    let op = match op {
        MtioOpCode::Fsf => MtioOp::Fsf,
        MtioOpCode::Bsf => MtioOp::Bsf,
        MtioOpCode::Fsr => MtioOp::Fsr,
        MtioOpCode::Bsr => MtioOp::Bsr,
        MtioOpCode::Rew => MtioOp::Rew,
        MtioOpCode::Off => MtioOp::Off,
        MtioOpCode::Eof => MtioOp::Weof,
    };
    match sess.tape.device.mtio(op, count) {
        Ok(resid) => Reply::TapeMtio { error: NdmpError::NoErr, resid },
        Err(e) => Reply::TapeMtio { error: tape_error(e), resid: count },
    }
}

fn handle_tape_read(sess: &mut Session, count: u32) -> Reply {
    if mover_owns_tape(sess) {
        return err_reply(NdmpError::IllegalState);
    }
    if count > MAX_RECORD_SIZE {
        return err_reply(NdmpError::IllegalArgs);
    }
    let mut data = vec![0u8; count as usize];
    match sess.tape.device.read(&mut data) {
        Ok(n) => {
            data.truncate(n);
            Reply::TapeRead { error: NdmpError::NoErr, data }
        }
        Err(e) => Reply::TapeRead { error: tape_error(e), data: Vec::new() },
    }
}

/// Substitutes the wildcard bind address with the control connection's local
/// address, which is the one the peer can actually reach.
fn publishable(sess: &Session, ci: usize, addr: SocketAddr) -> Addr {
    let mut out = addr;
    if out.ip().is_unspecified() {
        if let Some(local) = sess.conns[ci].chan.local_addr() {
            out.set_ip(local.ip());
        }
    }
    Addr::from_socket_addr(out)
}

fn handle_data_listen(sess: &mut Session, ci: usize, addr_type: AddrType) -> Reply {
    if sess.data.state != DataFsmState::Idle {
        return err_reply(NdmpError::IllegalState);
    }
    match addr_type {
        AddrType::Local => {
            sess.image.listen_local(Side::Data);
            sess.data.listen();
            Reply::DataListen { error: NdmpError::NoErr, addr: Addr::Local }
        }
        AddrType::Tcp => match sess.image.listen_tcp(Side::Data) {
            Ok(sa) => {
                sess.data.listen();
                Reply::DataListen { error: NdmpError::NoErr, addr: publishable(sess, ci, sa) }
            }
            Err(_) => err_reply(NdmpError::Connect),
        },
        AddrType::AsConnected => err_reply(NdmpError::IllegalArgs),
    }
}

fn handle_data_connect(sess: &mut Session, addr: Addr) -> Reply {
    if !matches!(sess.data.state, DataFsmState::Idle | DataFsmState::Listen) {
        return err_reply(NdmpError::IllegalState);
    }
    match addr {
        Addr::Local => match sess.image.connect_local(Side::Data) {
            Ok(()) => {
                sess.data.connected(Addr::Local);
                ok_reply()
            }
            Err(_) => err_reply(NdmpError::IllegalState),
        },
        Addr::Tcp(sa) => match sess.image.connect_tcp(Side::Data, sa.into()) {
            Ok(()) => {
                sess.data.connected(Addr::Tcp(sa));
                ok_reply()
            }
            Err(_) => err_reply(NdmpError::Connect),
        },
        Addr::AsConnected => err_reply(NdmpError::NotSupported),
    }
}

/// A local START while the tape side is listening completes the in-process
/// connection implicitly, the way a TCP peer's connect would.
fn attach_local_data(sess: &mut Session) -> Result<(), NdmpError> {
    if sess.data.state == DataFsmState::Idle && sess.image.connect_local(Side::Data).is_ok() {
        sess.data.connected(Addr::Local);
    }
    if sess.data.state == DataFsmState::Connected {
        Ok(())
    } else {
        Err(NdmpError::IllegalState)
    }
}

fn handle_mover_listen(sess: &mut Session, ci: usize, mode: MoverMode, addr_type: AddrType) -> Reply {
    if sess.tape.mover.state != MoverFsmState::Idle {
        return err_reply(NdmpError::IllegalState);
    }
    if mode == MoverMode::NoAction {
        return err_reply(NdmpError::IllegalArgs);
    }
    if !sess.tape.device.is_open() {
        return err_reply(NdmpError::DevNotOpen);
    }
    match addr_type {
        AddrType::Local => {
            sess.image.listen_local(Side::Tape);
            sess.tape.listen(mode);
            sess.tape.connect_addr = Addr::Local;
            Reply::MoverListen { error: NdmpError::NoErr, addr: Addr::Local }
        }
        AddrType::Tcp => match sess.image.listen_tcp(Side::Tape) {
            Ok(sa) => {
                sess.tape.listen(mode);
                let addr = publishable(sess, ci, sa);
                sess.tape.connect_addr = addr.clone();
                Reply::MoverListen { error: NdmpError::NoErr, addr }
            }
            Err(_) => err_reply(NdmpError::Connect),
        },
        AddrType::AsConnected => err_reply(NdmpError::IllegalArgs),
    }
}

fn handle_mover_connect(sess: &mut Session, mode: MoverMode, addr: Addr) -> Reply {
    if sess.tape.mover.state != MoverFsmState::Idle {
        return err_reply(NdmpError::IllegalState);
    }
    if mode == MoverMode::NoAction {
        return err_reply(NdmpError::IllegalArgs);
    }
    if !sess.tape.device.is_open() {
        return err_reply(NdmpError::DevNotOpen);
    }
    match addr {
        Addr::Local => match sess.image.connect_local(Side::Tape) {
            Ok(()) => {
                sess.tape.connect_addr = Addr::Local;
                sess.tape.connect(mode, &mut sess.image);
                ok_reply()
            }
            Err(_) => err_reply(NdmpError::IllegalState),
        },
        Addr::Tcp(sa) => match sess.image.connect_tcp(Side::Tape, sa.into()) {
            Ok(()) => {
                sess.tape.connect_addr = Addr::Tcp(sa);
                sess.tape.connect(mode, &mut sess.image);
                ok_reply()
            }
            Err(_) => err_reply(NdmpError::Connect),
        },
        Addr::AsConnected => err_reply(NdmpError::NotSupported),
    }
}

fn handle_mover_continue(sess: &mut Session) -> Reply {
    if sess.tape.mover.state != MoverFsmState::Paused {
        return err_reply(NdmpError::IllegalState);
    }
    // Paused for EOM with the warning still latched: the tape is still out
    // of space until some tape motion clears it.
    if sess.tape.mover.pause_reason == MoverPauseReason::Eom && sess.tape.device.leom_pending() {
        return err_reply(NdmpError::IllegalState);
    }
    // In tape-read (recover) mode there must be an outstanding mover read.
    if sess.tape.mover.mode == MoverMode::Write && sess.tape.mover.bytes_left_to_read == 0 {
        return err_reply(NdmpError::IllegalState);
    }
    sess.tape.mover_continue();
    ok_reply()
}

fn handle_set_record_size(sess: &mut Session, len: u32) -> Reply {
    if len == 0 || len > MAX_RECORD_SIZE {
        return err_reply(NdmpError::IllegalArgs);
    }
    match sess.tape.mover.state {
        MoverFsmState::Idle | MoverFsmState::Listen | MoverFsmState::Paused => {
            sess.tape.set_record_size(len);
            ok_reply()
        }
        _ => err_reply(NdmpError::IllegalState),
    }
}
