//! Shared protocol types: addresses, agent state enums, state snapshots and
//! the SCSI CDB envelope.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use crate::error::ProtoError;
use crate::xdr::{Reader, Writer};

macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident { $($var:ident = $val:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq)]
        #[repr(u32)]
        pub enum $name {
            $($var = $val),+
        }

        impl $name {
            pub fn from_wire(v: u32) -> Result<Self, ProtoError> {
                match v {
                    $($val => Ok(Self::$var),)+
                    other => Err(ProtoError::BadEnum { what: stringify!($name), value: other }),
                }
            }

            pub fn to_wire(self) -> u32 {
                self as u32
            }
        }
    };
}

/// Negotiated protocol version. The agent proposes v4 and accepts anything
/// the peer selects in the v2-v4 range.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ProtocolVersion(pub u16);

impl ProtocolVersion {
    pub const MIN: Self = Self(2);
    pub const MAX: Self = Self(4);

    pub fn validate(v: u16) -> Result<Self, ProtoError> {
        if (Self::MIN.0..=Self::MAX.0).contains(&v) {
            Ok(Self(v))
        } else {
            Err(ProtoError::BadVersion(v))
        }
    }
}

wire_enum! {
    AddrType {
        Local = 0,
        Tcp = 1,
        AsConnected = 0x1000,
    }
}

/// Image-stream endpoint address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Addr {
    /// DATA and MOVER live in the same session; the stream is in-process.
    Local,
    Tcp(SocketAddrV4),
    /// Reuse the already-established data connection (v4).
    AsConnected,
}

impl Addr {
    pub fn addr_type(&self) -> AddrType {
        match self {
            Self::Local => AddrType::Local,
            Self::Tcp(_) => AddrType::Tcp,
            Self::AsConnected => AddrType::AsConnected,
        }
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Self::Tcp(v4),
            // The wire format only carries IPv4; a v6 peer address is
            // reported as the unspecified v4 address.
            SocketAddr::V6(v6) => Self::Tcp(SocketAddrV4::new(
                v6.ip().to_ipv4_mapped().unwrap_or(Ipv4Addr::UNSPECIFIED),
                v6.port(),
            )),
        }
    }

    /// v2/v3 carry a bare `(ip, port)` pair; v4 wraps the pair in a
    /// one-element address list with an empty env table.
    pub fn encode(&self, w: &mut Writer<'_>, version: ProtocolVersion) {
        w.u32(self.addr_type().to_wire());
        if let Self::Tcp(sa) = self {
            if version.0 >= 4 {
                w.u32(1); // one tcp_addr entry
            }
            w.u32(u32::from_be_bytes(sa.ip().octets()));
            w.u32(u32::from(sa.port()));
            if version.0 >= 4 {
                w.u32(0); // empty addr_env list
            }
        }
    }

    pub fn decode(r: &mut Reader<'_>, version: ProtocolVersion) -> Result<Self, ProtoError> {
        match AddrType::from_wire(r.u32()?)? {
            AddrType::Local => Ok(Self::Local),
            AddrType::AsConnected => Ok(Self::AsConnected),
            AddrType::Tcp => {
                let entries = if version.0 >= 4 { r.u32()? } else { 1 };
                if entries == 0 {
                    return Err(ProtoError::Truncated { what: "tcp addr list" });
                }
                let ip = Ipv4Addr::from(r.u32()?.to_be_bytes());
                let port = r.u32()? as u16;
                if version.0 >= 4 {
                    let envs = r.u32()?;
                    for _ in 0..envs {
                        r.string()?;
                        r.string()?;
                    }
                    // Surplus entries beyond the first are carried by v4
                    // peers with multiple interfaces; only the first is used.
                    for _ in 1..entries {
                        r.u32()?;
                        r.u32()?;
                        let envs = r.u32()?;
                        for _ in 0..envs {
                            r.string()?;
                            r.string()?;
                        }
                    }
                }
                Ok(Self::Tcp(SocketAddrV4::new(ip, port)))
            }
        }
    }
}

/// One name/value pair of a backup environment table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvPair {
    pub name: String,
    pub value: String,
}

impl EnvPair {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), value: value.into() }
    }

    pub fn encode(&self, w: &mut Writer<'_>) {
        w.string(&self.name);
        w.string(&self.value);
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, ProtoError> {
        Ok(Self { name: r.string()?, value: r.string()? })
    }
}

/// One recover name-list entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NlistEntry {
    pub original_path: String,
    pub destination: String,
    pub fh_info: u64,
    pub node: u64,
}

impl NlistEntry {
    pub fn encode(&self, w: &mut Writer<'_>) {
        w.string(&self.original_path);
        w.string(&self.destination);
        w.u64(self.fh_info);
        w.u64(self.node);
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, ProtoError> {
        Ok(Self {
            original_path: r.string()?,
            destination: r.string()?,
            fh_info: r.u64()?,
            node: r.u64()?,
        })
    }
}

/// Client authentication attribute of CONNECT_CLIENT_AUTH.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthAttr {
    None,
    Text { id: String, password: String },
    Md5 { id: String, digest: [u8; 16] },
}

impl AuthAttr {
    pub fn encode(&self, w: &mut Writer<'_>) {
        match self {
            Self::None => w.u32(0),
            Self::Text { id, password } => {
                w.u32(1);
                w.string(id);
                w.string(password);
            }
            Self::Md5 { id, digest } => {
                w.u32(2);
                w.string(id);
                w.fixed(digest);
            }
        }
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, ProtoError> {
        match r.u32()? {
            0 => Ok(Self::None),
            1 => Ok(Self::Text { id: r.string()?, password: r.string()? }),
            2 => {
                let id = r.string()?;
                let digest: [u8; 16] = r
                    .fixed(16)?
                    .try_into()
                    .map_err(|_| ProtoError::Truncated { what: "md5 digest" })?;
                Ok(Self::Md5 { id, digest })
            }
            other => Err(ProtoError::BadEnum { what: "auth type", value: other }),
        }
    }
}

wire_enum! {
    TapeOpenMode {
        Read = 0,
        Rdwr = 1,
    }
}

wire_enum! {
    TapeAgentState {
        Idle = 0,
        Open = 1,
        Mover = 2,
    }
}

wire_enum! {
    MtioOpCode {
        Fsf = 0,
        Bsf = 1,
        Fsr = 2,
        Bsr = 3,
        Rew = 4,
        Off = 5,
        Eof = 6,
    }
}

wire_enum! {
    MoverFsmState {
        Idle = 0,
        Listen = 1,
        Active = 2,
        Paused = 3,
        Halted = 4,
    }
}

wire_enum! {
    MoverMode {
        Read = 0,
        Write = 1,
        NoAction = 2,
    }
}

wire_enum! {
    MoverPauseReason {
        NotPaused = 0,
        Eom = 1,
        Eof = 2,
        Seek = 3,
        MediaError = 4,
    }
}

wire_enum! {
    MoverHaltReason {
        NotHalted = 0,
        ConnectClosed = 1,
        Aborted = 2,
        InternalError = 3,
        ConnectError = 4,
    }
}

wire_enum! {
    DataFsmState {
        Idle = 0,
        Active = 1,
        Halted = 2,
        Listen = 3,
        Connected = 4,
    }
}

wire_enum! {
    DataOperation {
        NoAction = 0,
        Backup = 1,
        Recover = 2,
        RecoverFilehist = 3,
    }
}

wire_enum! {
    DataHaltReason {
        NotHalted = 0,
        Successful = 1,
        Aborted = 2,
        InternalError = 3,
        ConnectError = 4,
    }
}

wire_enum! {
    ScsiDataDir {
        None = 0,
        In = 1,
        Out = 2,
    }
}

wire_enum! {
    ConnectReason {
        Connected = 0,
        Shutdown = 1,
        Refused = 2,
    }
}

fn encode_opt_u64(w: &mut Writer<'_>, v: Option<u64>) {
    w.u32(u32::from(v.is_some()));
    w.u64(v.unwrap_or(0));
}

fn decode_opt_u64(r: &mut Reader<'_>) -> Result<Option<u64>, ProtoError> {
    let valid = r.u32()? != 0;
    let value = r.u64()?;
    Ok(valid.then_some(value))
}

/// TAPE_GET_STATE payload. Counters are validity-masked: a closed device
/// reports all of them invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapeStateInfo {
    pub state: TapeAgentState,
    pub open_mode: TapeOpenMode,
    pub file_num: Option<u64>,
    pub soft_errors: Option<u64>,
    pub block_size: Option<u64>,
    pub blockno: Option<u64>,
    pub total_space: Option<u64>,
    pub space_remain: Option<u64>,
}

impl TapeStateInfo {
    pub fn closed() -> Self {
        Self {
            state: TapeAgentState::Idle,
            open_mode: TapeOpenMode::Read,
            file_num: None,
            soft_errors: None,
            block_size: None,
            blockno: None,
            total_space: None,
            space_remain: None,
        }
    }

    pub fn encode(&self, w: &mut Writer<'_>) {
        w.u32(self.state.to_wire());
        w.u32(self.open_mode.to_wire());
        encode_opt_u64(w, self.file_num);
        encode_opt_u64(w, self.soft_errors);
        encode_opt_u64(w, self.block_size);
        encode_opt_u64(w, self.blockno);
        encode_opt_u64(w, self.total_space);
        encode_opt_u64(w, self.space_remain);
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, ProtoError> {
        Ok(Self {
            state: TapeAgentState::from_wire(r.u32()?)?,
            open_mode: TapeOpenMode::from_wire(r.u32()?)?,
            file_num: decode_opt_u64(r)?,
            soft_errors: decode_opt_u64(r)?,
            block_size: decode_opt_u64(r)?,
            blockno: decode_opt_u64(r)?,
            total_space: decode_opt_u64(r)?,
            space_remain: decode_opt_u64(r)?,
        })
    }
}

/// MOVER_GET_STATE payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoverStateInfo {
    pub state: MoverFsmState,
    pub mode: MoverMode,
    pub pause_reason: MoverPauseReason,
    pub halt_reason: MoverHaltReason,
    pub record_size: u32,
    pub record_num: u64,
    pub bytes_moved: u64,
    pub seek_position: u64,
    pub bytes_left_to_read: u64,
    pub window_offset: u64,
    pub window_length: u64,
    pub connect_addr: Addr,
}

impl MoverStateInfo {
    pub fn encode(&self, w: &mut Writer<'_>, version: ProtocolVersion) {
        w.u32(self.state.to_wire());
        w.u32(self.mode.to_wire());
        w.u32(self.pause_reason.to_wire());
        w.u32(self.halt_reason.to_wire());
        w.u32(self.record_size);
        w.u64(self.record_num);
        w.u64(self.bytes_moved);
        w.u64(self.seek_position);
        w.u64(self.bytes_left_to_read);
        w.u64(self.window_offset);
        w.u64(self.window_length);
        self.connect_addr.encode(w, version);
    }

    pub fn decode(r: &mut Reader<'_>, version: ProtocolVersion) -> Result<Self, ProtoError> {
        Ok(Self {
            state: MoverFsmState::from_wire(r.u32()?)?,
            mode: MoverMode::from_wire(r.u32()?)?,
            pause_reason: MoverPauseReason::from_wire(r.u32()?)?,
            halt_reason: MoverHaltReason::from_wire(r.u32()?)?,
            record_size: r.u32()?,
            record_num: r.u64()?,
            bytes_moved: r.u64()?,
            seek_position: r.u64()?,
            bytes_left_to_read: r.u64()?,
            window_offset: r.u64()?,
            window_length: r.u64()?,
            connect_addr: Addr::decode(r, version)?,
        })
    }
}

/// DATA_GET_STATE payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataStateInfo {
    pub state: DataFsmState,
    pub operation: DataOperation,
    pub halt_reason: DataHaltReason,
    pub bytes_processed: u64,
    pub read_offset: u64,
    pub read_length: u64,
    pub connect_addr: Addr,
}

impl DataStateInfo {
    pub fn encode(&self, w: &mut Writer<'_>, version: ProtocolVersion) {
        w.u32(self.state.to_wire());
        w.u32(self.operation.to_wire());
        w.u32(self.halt_reason.to_wire());
        w.u64(self.bytes_processed);
        w.u64(self.read_offset);
        w.u64(self.read_length);
        self.connect_addr.encode(w, version);
    }

    pub fn decode(r: &mut Reader<'_>, version: ProtocolVersion) -> Result<Self, ProtoError> {
        Ok(Self {
            state: DataFsmState::from_wire(r.u32()?)?,
            operation: DataOperation::from_wire(r.u32()?)?,
            halt_reason: DataHaltReason::from_wire(r.u32()?)?,
            bytes_processed: r.u64()?,
            read_offset: r.u64()?,
            read_length: r.u64()?,
            connect_addr: Addr::decode(r, version)?,
        })
    }
}

/// SCSI_EXECUTE_CDB request envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdbRequest {
    pub cdb: Vec<u8>,
    pub data_dir: ScsiDataDir,
    pub timeout_ms: u32,
    pub datain_len: u32,
    pub dataout: Vec<u8>,
}

impl CdbRequest {
    pub fn encode(&self, w: &mut Writer<'_>) {
        w.u32(self.data_dir.to_wire());
        w.u32(self.timeout_ms);
        w.u32(self.datain_len);
        w.opaque(&self.cdb);
        w.opaque(&self.dataout);
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, ProtoError> {
        Ok(Self {
            data_dir: ScsiDataDir::from_wire(r.u32()?)?,
            timeout_ms: r.u32()?,
            datain_len: r.u32()?,
            cdb: r.opaque()?,
            dataout: r.opaque()?,
        })
    }
}

/// SCSI_EXECUTE_CDB reply envelope. A non-GOOD `status` carries extended
/// sense bytes; `datain` is present for DATA-IN commands.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CdbReply {
    pub status: u32,
    pub dataout_len: u32,
    pub datain: Vec<u8>,
    pub ext_sense: Vec<u8>,
}

impl CdbReply {
    pub fn encode(&self, w: &mut Writer<'_>) {
        w.u32(self.status);
        w.u32(self.dataout_len);
        w.opaque(&self.datain);
        w.opaque(&self.ext_sense);
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, ProtoError> {
        Ok(Self {
            status: r.u32()?,
            dataout_len: r.u32()?,
            datain: r.opaque()?,
            ext_sense: r.opaque()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_addr(addr: &Addr, version: ProtocolVersion) -> Addr {
        let mut buf = Vec::new();
        addr.encode(&mut Writer::new(&mut buf), version);
        Addr::decode(&mut Reader::new(&buf), version).unwrap()
    }

    #[test]
    fn addr_roundtrip_all_versions() {
        let tcp = Addr::Tcp(SocketAddrV4::new(Ipv4Addr::new(10, 1, 2, 3), 10000));
        for v in [2u16, 3, 4] {
            let version = ProtocolVersion(v);
            assert_eq!(roundtrip_addr(&Addr::Local, version), Addr::Local);
            assert_eq!(roundtrip_addr(&tcp, version), tcp);
        }
        assert_eq!(
            roundtrip_addr(&Addr::AsConnected, ProtocolVersion(4)),
            Addr::AsConnected
        );
    }

    #[test]
    fn version_range() {
        assert!(ProtocolVersion::validate(2).is_ok());
        assert!(ProtocolVersion::validate(4).is_ok());
        assert!(ProtocolVersion::validate(5).is_err());
        assert!(ProtocolVersion::validate(0).is_err());
    }

    #[test]
    fn auth_attr_roundtrip() {
        for attr in [
            AuthAttr::None,
            AuthAttr::Text { id: "op".into(), password: "secret".into() },
            AuthAttr::Md5 { id: "op".into(), digest: [7; 16] },
        ] {
            let mut buf = Vec::new();
            attr.encode(&mut Writer::new(&mut buf));
            assert_eq!(AuthAttr::decode(&mut Reader::new(&buf)).unwrap(), attr);
        }
    }

    #[test]
    fn tape_state_validity_mask() {
        let info = TapeStateInfo {
            state: TapeAgentState::Open,
            open_mode: TapeOpenMode::Rdwr,
            file_num: Some(3),
            soft_errors: Some(0),
            block_size: Some(512),
            blockno: Some(17),
            total_space: None,
            space_remain: None,
        };
        let mut buf = Vec::new();
        info.encode(&mut Writer::new(&mut buf));
        let back = TapeStateInfo::decode(&mut Reader::new(&buf)).unwrap();
        assert_eq!(back, info);
        assert_eq!(back.total_space, None);
    }
}
