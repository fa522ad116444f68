use thiserror::Error;

/// NDMP wire error codes, shared by every reply body.
///
/// Values follow the NDMPv4 assignment.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum NdmpError {
    #[error("no error")]
    NoErr = 0,
    #[error("not supported")]
    NotSupported = 1,
    #[error("device busy")]
    DeviceBusy = 2,
    #[error("device already opened")]
    DeviceOpened = 3,
    #[error("not authorized")]
    NotAuthorized = 4,
    #[error("permission denied")]
    Permission = 5,
    #[error("device not open")]
    DevNotOpen = 6,
    #[error("I/O error")]
    Io = 7,
    #[error("timeout")]
    Timeout = 8,
    #[error("illegal arguments")]
    IllegalArgs = 9,
    #[error("no tape loaded")]
    NoTapeLoaded = 10,
    #[error("write protected")]
    WriteProtect = 11,
    #[error("end of file")]
    Eof = 12,
    #[error("end of medium")]
    Eom = 13,
    #[error("no device")]
    NoDevice = 16,
    #[error("illegal state")]
    IllegalState = 19,
    #[error("undefined error")]
    Undefined = 20,
    #[error("connect error")]
    Connect = 23,
    #[error("sequence error")]
    Sequence = 24,
    #[error("already connected")]
    Connected = 25,
}

impl NdmpError {
    pub fn from_wire(v: u32) -> Result<Self, ProtoError> {
        Ok(match v {
            0 => Self::NoErr,
            1 => Self::NotSupported,
            2 => Self::DeviceBusy,
            3 => Self::DeviceOpened,
            4 => Self::NotAuthorized,
            5 => Self::Permission,
            6 => Self::DevNotOpen,
            7 => Self::Io,
            8 => Self::Timeout,
            9 => Self::IllegalArgs,
            10 => Self::NoTapeLoaded,
            11 => Self::WriteProtect,
            12 => Self::Eof,
            13 => Self::Eom,
            16 => Self::NoDevice,
            19 => Self::IllegalState,
            20 => Self::Undefined,
            23 => Self::Connect,
            24 => Self::Sequence,
            25 => Self::Connected,
            other => return Err(ProtoError::BadEnum { what: "ndmp error code", value: other }),
        })
    }
}

/// Codec-level failures. These never travel on the wire; the dispatcher maps
/// them to `NdmpError` (or drops the connection) as appropriate.
#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("record truncated while reading {what}")]
    Truncated { what: &'static str },
    #[error("bad value {value} for {what}")]
    BadEnum { what: &'static str, value: u32 },
    #[error("frame of {0} bytes exceeds the frame limit")]
    FrameTooLong(usize),
    #[error("unknown message code {0:#x}")]
    UnknownMessage(u32),
    #[error("{0} bytes left over after decoding message body")]
    TrailingBytes(usize),
    #[error("protocol version {0} not in the supported v2-v4 range")]
    BadVersion(u16),
    #[error("a call is already in flight on this connection")]
    CallInFlight,
    #[error("connection closed")]
    ConnectionClosed,
}
