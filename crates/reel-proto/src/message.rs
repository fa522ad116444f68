//! Message header, message codes and the typed request/reply bodies.
//!
//! Every message is one XDR record: a 24-byte header followed by the body.
//! Replies repeat the request's message code and carry the request sequence
//! in `reply_sequence`; notifications are requests that expect no reply.

use crate::error::{NdmpError, ProtoError};
use crate::types::{
    Addr, AddrType, AuthAttr, CdbReply, CdbRequest, ConnectReason, DataHaltReason, DataStateInfo,
    EnvPair, MoverHaltReason, MoverMode, MoverPauseReason, MoverStateInfo, MtioOpCode, NlistEntry,
    ProtocolVersion, TapeOpenMode, TapeStateInfo,
};
use crate::xdr::{Reader, Writer};

/// Record-mark bit flagging the final fragment. Records this agent emits are
/// always a single fragment.
pub const LAST_FRAGMENT: u32 = 0x8000_0000;

/// Upper bound on a single record; sized for a large tape record plus the
/// header and opaque framing.
pub const MAX_FRAME_LEN: usize = 4 << 20;

/// Six big-endian `u32`s.
pub const HEADER_SIZE: usize = 24;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    Request = 0,
    Reply = 1,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageCode {
    ConnectOpen = 0x900,
    ConnectClientAuth = 0x901,
    ConnectClose = 0x902,

    ScsiOpen = 0x200,
    ScsiClose = 0x201,
    ScsiResetDevice = 0x204,
    ScsiExecuteCdb = 0x206,

    TapeOpen = 0x300,
    TapeClose = 0x301,
    TapeGetState = 0x302,
    TapeMtio = 0x303,
    TapeWrite = 0x304,
    TapeRead = 0x305,

    DataGetState = 0x400,
    DataStartBackup = 0x401,
    DataStartRecover = 0x402,
    DataAbort = 0x403,
    DataGetEnv = 0x404,
    DataStop = 0x407,
    DataListen = 0x409,
    DataConnect = 0x40a,
    DataStartRecoverFilehist = 0x40b,

    NotifyDataHalted = 0x501,
    NotifyConnected = 0x502,
    NotifyMoverHalted = 0x503,
    NotifyMoverPaused = 0x504,
    NotifyDataRead = 0x505,

    MoverGetState = 0xa00,
    MoverListen = 0xa01,
    MoverContinue = 0xa02,
    MoverAbort = 0xa03,
    MoverStop = 0xa04,
    MoverSetWindow = 0xa05,
    MoverRead = 0xa06,
    MoverClose = 0xa07,
    MoverSetRecordSize = 0xa08,
    MoverConnect = 0xa09,
}

impl MessageCode {
    pub fn from_wire(v: u32) -> Result<Self, ProtoError> {
        Ok(match v {
            0x900 => Self::ConnectOpen,
            0x901 => Self::ConnectClientAuth,
            0x902 => Self::ConnectClose,
            0x200 => Self::ScsiOpen,
            0x201 => Self::ScsiClose,
            0x204 => Self::ScsiResetDevice,
            0x206 => Self::ScsiExecuteCdb,
            0x300 => Self::TapeOpen,
            0x301 => Self::TapeClose,
            0x302 => Self::TapeGetState,
            0x303 => Self::TapeMtio,
            0x304 => Self::TapeWrite,
            0x305 => Self::TapeRead,
            0x400 => Self::DataGetState,
            0x401 => Self::DataStartBackup,
            0x402 => Self::DataStartRecover,
            0x403 => Self::DataAbort,
            0x404 => Self::DataGetEnv,
            0x407 => Self::DataStop,
            0x409 => Self::DataListen,
            0x40a => Self::DataConnect,
            0x40b => Self::DataStartRecoverFilehist,
            0x501 => Self::NotifyDataHalted,
            0x502 => Self::NotifyConnected,
            0x503 => Self::NotifyMoverHalted,
            0x504 => Self::NotifyMoverPaused,
            0x505 => Self::NotifyDataRead,
            0xa00 => Self::MoverGetState,
            0xa01 => Self::MoverListen,
            0xa02 => Self::MoverContinue,
            0xa03 => Self::MoverAbort,
            0xa04 => Self::MoverStop,
            0xa05 => Self::MoverSetWindow,
            0xa06 => Self::MoverRead,
            0xa07 => Self::MoverClose,
            0xa08 => Self::MoverSetRecordSize,
            0xa09 => Self::MoverConnect,
            other => return Err(ProtoError::UnknownMessage(other)),
        })
    }

    pub fn to_wire(self) -> u32 {
        self as u32
    }

    /// Connect-phase messages are exempt from the authorization check.
    pub fn is_connect(self) -> bool {
        matches!(self, Self::ConnectOpen | Self::ConnectClientAuth | Self::ConnectClose)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Header {
    pub sequence: u32,
    pub time_stamp: u32,
    pub message_type: MessageType,
    pub code: MessageCode,
    pub reply_sequence: u32,
    pub error: NdmpError,
}

impl Header {
    pub fn encode(&self, w: &mut Writer<'_>) {
        w.u32(self.sequence);
        w.u32(self.time_stamp);
        w.u32(self.message_type as u32);
        w.u32(self.code.to_wire());
        w.u32(self.reply_sequence);
        w.u32(self.error as u32);
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, ProtoError> {
        let sequence = r.u32()?;
        let time_stamp = r.u32()?;
        let message_type = match r.u32()? {
            0 => MessageType::Request,
            1 => MessageType::Reply,
            other => return Err(ProtoError::BadEnum { what: "message type", value: other }),
        };
        let code = MessageCode::from_wire(r.u32()?)?;
        let reply_sequence = r.u32()?;
        let error = NdmpError::from_wire(r.u32()?)?;
        Ok(Self { sequence, time_stamp, message_type, code, reply_sequence, error })
    }
}

/// A decoded request body. Notifications are posted as requests and never
/// answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    ConnectOpen { version: u16 },
    ConnectClientAuth { auth: AuthAttr },
    ConnectClose,

    ScsiOpen { device: String },
    ScsiClose,
    ScsiResetDevice,
    ScsiExecuteCdb(CdbRequest),

    TapeOpen { device: String, mode: TapeOpenMode },
    TapeClose,
    TapeGetState,
    TapeMtio { op: MtioOpCode, count: u32 },
    TapeWrite { data: Vec<u8> },
    TapeRead { count: u32 },

    DataGetState,
    DataListen { addr_type: AddrType },
    DataConnect { addr: Addr },
    DataStartBackup { bu_type: String, env: Vec<EnvPair> },
    DataStartRecover { bu_type: String, env: Vec<EnvPair>, nlist: Vec<NlistEntry> },
    DataStartRecoverFilehist { bu_type: String, env: Vec<EnvPair>, nlist: Vec<NlistEntry> },
    DataAbort,
    DataGetEnv,
    DataStop,

    MoverGetState,
    MoverListen { mode: MoverMode, addr_type: AddrType },
    MoverConnect { mode: MoverMode, addr: Addr },
    MoverContinue,
    MoverAbort,
    MoverStop,
    MoverSetWindow { offset: u64, length: u64 },
    MoverRead { offset: u64, length: u64 },
    MoverClose,
    MoverSetRecordSize { len: u32 },

    NotifyDataHalted { reason: DataHaltReason, text: String },
    NotifyConnected { reason: ConnectReason, protocol_version: u16, text: String },
    NotifyMoverHalted { reason: MoverHaltReason, text: String },
    NotifyMoverPaused { reason: MoverPauseReason, seek_position: u64 },
    NotifyDataRead { offset: u64, length: u64 },
}

fn encode_env(w: &mut Writer<'_>, env: &[EnvPair]) {
    w.u32(env.len() as u32);
    for e in env {
        e.encode(w);
    }
}

fn decode_env(r: &mut Reader<'_>) -> Result<Vec<EnvPair>, ProtoError> {
    let n = r.u32()?;
    let mut env = Vec::with_capacity(n.min(256) as usize);
    for _ in 0..n {
        env.push(EnvPair::decode(r)?);
    }
    Ok(env)
}

fn encode_nlist(w: &mut Writer<'_>, nlist: &[NlistEntry]) {
    w.u32(nlist.len() as u32);
    for e in nlist {
        e.encode(w);
    }
}

fn decode_nlist(r: &mut Reader<'_>) -> Result<Vec<NlistEntry>, ProtoError> {
    let n = r.u32()?;
    let mut nlist = Vec::with_capacity(n.min(256) as usize);
    for _ in 0..n {
        nlist.push(NlistEntry::decode(r)?);
    }
    Ok(nlist)
}

impl Request {
    pub fn code(&self) -> MessageCode {
        match self {
            Self::ConnectOpen { .. } => MessageCode::ConnectOpen,
            Self::ConnectClientAuth { .. } => MessageCode::ConnectClientAuth,
            Self::ConnectClose => MessageCode::ConnectClose,
            Self::ScsiOpen { .. } => MessageCode::ScsiOpen,
            Self::ScsiClose => MessageCode::ScsiClose,
            Self::ScsiResetDevice => MessageCode::ScsiResetDevice,
            Self::ScsiExecuteCdb(_) => MessageCode::ScsiExecuteCdb,
            Self::TapeOpen { .. } => MessageCode::TapeOpen,
            Self::TapeClose => MessageCode::TapeClose,
            Self::TapeGetState => MessageCode::TapeGetState,
            Self::TapeMtio { .. } => MessageCode::TapeMtio,
            Self::TapeWrite { .. } => MessageCode::TapeWrite,
            Self::TapeRead { .. } => MessageCode::TapeRead,
            Self::DataGetState => MessageCode::DataGetState,
            Self::DataListen { .. } => MessageCode::DataListen,
            Self::DataConnect { .. } => MessageCode::DataConnect,
            Self::DataStartBackup { .. } => MessageCode::DataStartBackup,
            Self::DataStartRecover { .. } => MessageCode::DataStartRecover,
            Self::DataStartRecoverFilehist { .. } => MessageCode::DataStartRecoverFilehist,
            Self::DataAbort => MessageCode::DataAbort,
            Self::DataGetEnv => MessageCode::DataGetEnv,
            Self::DataStop => MessageCode::DataStop,
            Self::MoverGetState => MessageCode::MoverGetState,
            Self::MoverListen { .. } => MessageCode::MoverListen,
            Self::MoverConnect { .. } => MessageCode::MoverConnect,
            Self::MoverContinue => MessageCode::MoverContinue,
            Self::MoverAbort => MessageCode::MoverAbort,
            Self::MoverStop => MessageCode::MoverStop,
            Self::MoverSetWindow { .. } => MessageCode::MoverSetWindow,
            Self::MoverRead { .. } => MessageCode::MoverRead,
            Self::MoverClose => MessageCode::MoverClose,
            Self::MoverSetRecordSize { .. } => MessageCode::MoverSetRecordSize,
            Self::NotifyDataHalted { .. } => MessageCode::NotifyDataHalted,
            Self::NotifyConnected { .. } => MessageCode::NotifyConnected,
            Self::NotifyMoverHalted { .. } => MessageCode::NotifyMoverHalted,
            Self::NotifyMoverPaused { .. } => MessageCode::NotifyMoverPaused,
            Self::NotifyDataRead { .. } => MessageCode::NotifyDataRead,
        }
    }

    pub fn encode(&self, w: &mut Writer<'_>, version: ProtocolVersion) {
        match self {
            Self::ConnectOpen { version: v } => w.u32(u32::from(*v)),
            Self::ConnectClientAuth { auth } => auth.encode(w),
            Self::ConnectClose
            | Self::ScsiClose
            | Self::ScsiResetDevice
            | Self::TapeClose
            | Self::TapeGetState
            | Self::DataGetState
            | Self::DataAbort
            | Self::DataGetEnv
            | Self::DataStop
            | Self::MoverGetState
            | Self::MoverContinue
            | Self::MoverAbort
            | Self::MoverStop
            | Self::MoverClose => {}
            Self::ScsiOpen { device } => w.string(device),
            Self::ScsiExecuteCdb(cdb) => cdb.encode(w),
            Self::TapeOpen { device, mode } => {
                w.string(device);
                w.u32(mode.to_wire());
            }
            Self::TapeMtio { op, count } => {
                w.u32(op.to_wire());
                w.u32(*count);
            }
            Self::TapeWrite { data } => w.opaque(data),
            Self::TapeRead { count } => w.u32(*count),
            Self::DataListen { addr_type } => w.u32(addr_type.to_wire()),
            Self::DataConnect { addr } => addr.encode(w, version),
            Self::DataStartBackup { bu_type, env } => {
                w.string(bu_type);
                encode_env(w, env);
            }
            Self::DataStartRecover { bu_type, env, nlist }
            | Self::DataStartRecoverFilehist { bu_type, env, nlist } => {
                w.string(bu_type);
                encode_env(w, env);
                encode_nlist(w, nlist);
            }
            Self::MoverListen { mode, addr_type } => {
                w.u32(mode.to_wire());
                w.u32(addr_type.to_wire());
            }
            Self::MoverConnect { mode, addr } => {
                w.u32(mode.to_wire());
                addr.encode(w, version);
            }
            Self::MoverSetWindow { offset, length } | Self::MoverRead { offset, length } => {
                w.u64(*offset);
                w.u64(*length);
            }
            Self::MoverSetRecordSize { len } => w.u32(*len),
            Self::NotifyDataHalted { reason, text } => {
                w.u32(reason.to_wire());
                w.string(text);
            }
            Self::NotifyConnected { reason, protocol_version, text } => {
                w.u32(reason.to_wire());
                w.u32(u32::from(*protocol_version));
                w.string(text);
            }
            Self::NotifyMoverHalted { reason, text } => {
                w.u32(reason.to_wire());
                w.string(text);
            }
            Self::NotifyMoverPaused { reason, seek_position } => {
                w.u32(reason.to_wire());
                w.u64(*seek_position);
            }
            Self::NotifyDataRead { offset, length } => {
                w.u64(*offset);
                w.u64(*length);
            }
        }
    }

    pub fn decode(
        code: MessageCode,
        r: &mut Reader<'_>,
        version: ProtocolVersion,
    ) -> Result<Self, ProtoError> {
        let req = match code {
            MessageCode::ConnectOpen => Self::ConnectOpen { version: r.u32()? as u16 },
            MessageCode::ConnectClientAuth => {
                Self::ConnectClientAuth { auth: AuthAttr::decode(r)? }
            }
            MessageCode::ConnectClose => Self::ConnectClose,
            MessageCode::ScsiOpen => Self::ScsiOpen { device: r.string()? },
            MessageCode::ScsiClose => Self::ScsiClose,
            MessageCode::ScsiResetDevice => Self::ScsiResetDevice,
            MessageCode::ScsiExecuteCdb => Self::ScsiExecuteCdb(CdbRequest::decode(r)?),
            MessageCode::TapeOpen => Self::TapeOpen {
                device: r.string()?,
                mode: TapeOpenMode::from_wire(r.u32()?)?,
            },
            MessageCode::TapeClose => Self::TapeClose,
            MessageCode::TapeGetState => Self::TapeGetState,
            MessageCode::TapeMtio => Self::TapeMtio {
                op: MtioOpCode::from_wire(r.u32()?)?,
                count: r.u32()?,
            },
            MessageCode::TapeWrite => Self::TapeWrite { data: r.opaque()? },
            MessageCode::TapeRead => Self::TapeRead { count: r.u32()? },
            MessageCode::DataGetState => Self::DataGetState,
            MessageCode::DataListen => {
                Self::DataListen { addr_type: AddrType::from_wire(r.u32()?)? }
            }
            MessageCode::DataConnect => Self::DataConnect { addr: Addr::decode(r, version)? },
            MessageCode::DataStartBackup => Self::DataStartBackup {
                bu_type: r.string()?,
                env: decode_env(r)?,
            },
            MessageCode::DataStartRecover => Self::DataStartRecover {
                bu_type: r.string()?,
                env: decode_env(r)?,
                nlist: decode_nlist(r)?,
            },
            MessageCode::DataStartRecoverFilehist => Self::DataStartRecoverFilehist {
                bu_type: r.string()?,
                env: decode_env(r)?,
                nlist: decode_nlist(r)?,
            },
            MessageCode::DataAbort => Self::DataAbort,
            MessageCode::DataGetEnv => Self::DataGetEnv,
            MessageCode::DataStop => Self::DataStop,
            MessageCode::MoverGetState => Self::MoverGetState,
            MessageCode::MoverListen => Self::MoverListen {
                mode: MoverMode::from_wire(r.u32()?)?,
                addr_type: AddrType::from_wire(r.u32()?)?,
            },
            MessageCode::MoverConnect => Self::MoverConnect {
                mode: MoverMode::from_wire(r.u32()?)?,
                addr: Addr::decode(r, version)?,
            },
            MessageCode::MoverContinue => Self::MoverContinue,
            MessageCode::MoverAbort => Self::MoverAbort,
            MessageCode::MoverStop => Self::MoverStop,
            MessageCode::MoverSetWindow => Self::MoverSetWindow {
                offset: r.u64()?,
                length: r.u64()?,
            },
            MessageCode::MoverRead => Self::MoverRead { offset: r.u64()?, length: r.u64()? },
            MessageCode::MoverClose => Self::MoverClose,
            MessageCode::MoverSetRecordSize => Self::MoverSetRecordSize { len: r.u32()? },
            MessageCode::NotifyDataHalted => Self::NotifyDataHalted {
                reason: DataHaltReason::from_wire(r.u32()?)?,
                text: r.string()?,
            },
            MessageCode::NotifyConnected => Self::NotifyConnected {
                reason: ConnectReason::from_wire(r.u32()?)?,
                protocol_version: r.u32()? as u16,
                text: r.string()?,
            },
            MessageCode::NotifyMoverHalted => Self::NotifyMoverHalted {
                reason: MoverHaltReason::from_wire(r.u32()?)?,
                text: r.string()?,
            },
            MessageCode::NotifyMoverPaused => Self::NotifyMoverPaused {
                reason: MoverPauseReason::from_wire(r.u32()?)?,
                seek_position: r.u64()?,
            },
            MessageCode::NotifyDataRead => Self::NotifyDataRead {
                offset: r.u64()?,
                length: r.u64()?,
            },
        };
        Ok(req)
    }
}

/// A decoded reply body. Every reply leads with the operation error; replies
/// without a payload collapse into [`Reply::Error`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Error { error: NdmpError },
    ScsiExecuteCdb { error: NdmpError, cdb: CdbReply },
    TapeGetState { error: NdmpError, info: TapeStateInfo },
    TapeMtio { error: NdmpError, resid: u32 },
    TapeWrite { error: NdmpError, count: u32 },
    TapeRead { error: NdmpError, data: Vec<u8> },
    DataGetState { error: NdmpError, info: DataStateInfo },
    DataGetEnv { error: NdmpError, env: Vec<EnvPair> },
    DataListen { error: NdmpError, addr: Addr },
    MoverGetState { error: NdmpError, info: MoverStateInfo },
    MoverListen { error: NdmpError, addr: Addr },
}

impl Reply {
    pub fn error(&self) -> NdmpError {
        match self {
            Self::Error { error }
            | Self::ScsiExecuteCdb { error, .. }
            | Self::TapeGetState { error, .. }
            | Self::TapeMtio { error, .. }
            | Self::TapeWrite { error, .. }
            | Self::TapeRead { error, .. }
            | Self::DataGetState { error, .. }
            | Self::DataGetEnv { error, .. }
            | Self::DataListen { error, .. }
            | Self::MoverGetState { error, .. }
            | Self::MoverListen { error, .. } => *error,
        }
    }

    pub fn encode(&self, w: &mut Writer<'_>, version: ProtocolVersion) {
        w.u32(self.error() as u32);
        match self {
            Self::Error { .. } => {}
            Self::ScsiExecuteCdb { cdb, .. } => cdb.encode(w),
            Self::TapeGetState { info, .. } => info.encode(w),
            Self::TapeMtio { resid, .. } => w.u32(*resid),
            Self::TapeWrite { count, .. } => w.u32(*count),
            Self::TapeRead { data, .. } => w.opaque(data),
            Self::DataGetState { info, .. } => info.encode(w, version),
            Self::DataGetEnv { env, .. } => encode_env(w, env),
            Self::DataListen { addr, .. } | Self::MoverListen { addr, .. } => {
                addr.encode(w, version);
            }
            Self::MoverGetState { info, .. } => info.encode(w, version),
        }
    }

    pub fn decode(
        code: MessageCode,
        r: &mut Reader<'_>,
        version: ProtocolVersion,
    ) -> Result<Self, ProtoError> {
        let error = NdmpError::from_wire(r.u32()?)?;
        // Error replies may legally omit the payload.
        if error != NdmpError::NoErr && r.remaining() == 0 {
            return Ok(Self::Error { error });
        }
        let reply = match code {
            MessageCode::ScsiExecuteCdb => {
                Self::ScsiExecuteCdb { error, cdb: CdbReply::decode(r)? }
            }
            MessageCode::TapeGetState => Self::TapeGetState {
                error,
                info: TapeStateInfo::decode(r)?,
            },
            MessageCode::TapeMtio => Self::TapeMtio { error, resid: r.u32()? },
            MessageCode::TapeWrite => Self::TapeWrite { error, count: r.u32()? },
            MessageCode::TapeRead => Self::TapeRead { error, data: r.opaque()? },
            MessageCode::DataGetState => Self::DataGetState {
                error,
                info: DataStateInfo::decode(r, version)?,
            },
            MessageCode::DataGetEnv => Self::DataGetEnv { error, env: decode_env(r)? },
            MessageCode::DataListen => Self::DataListen {
                error,
                addr: Addr::decode(r, version)?,
            },
            MessageCode::MoverGetState => Self::MoverGetState {
                error,
                info: MoverStateInfo::decode(r, version)?,
            },
            MessageCode::MoverListen => Self::MoverListen {
                error,
                addr: Addr::decode(r, version)?,
            },
            _ => Self::Error { error },
        };
        Ok(reply)
    }
}
