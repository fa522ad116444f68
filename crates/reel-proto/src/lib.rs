//! Wire surface of the NDMP agent, reduced to the internal "v9" dialect.
//!
//! The peer speaks NDMP v2-v4 over an XDR-framed record stream. Everything
//! above the codec sees a single protocol-agnostic message set: typed
//! [`Request`] and [`Reply`] enums plus the shared [`NdmpError`] code space.
//! Version differences are confined to the codec (address layout is the only
//! spot where v2-v4 disagree within the subset this agent implements).

mod error;
mod message;
mod types;
pub mod xdr;

pub use error::{NdmpError, ProtoError};
pub use message::{
    Header, MessageCode, MessageType, Reply, Request, HEADER_SIZE, LAST_FRAGMENT, MAX_FRAME_LEN,
};
pub use types::{
    Addr, AddrType, AuthAttr, CdbReply, CdbRequest, ConnectReason, DataFsmState, DataHaltReason,
    DataOperation, DataStateInfo, EnvPair, MoverFsmState, MoverHaltReason, MoverMode,
    MoverPauseReason, MoverStateInfo, MtioOpCode, NlistEntry, ProtocolVersion, ScsiDataDir,
    TapeAgentState, TapeOpenMode, TapeStateInfo,
};
