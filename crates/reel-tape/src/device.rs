use std::path::Path;

use thiserror::Error;

/// Typed tape operation failures. The dispatch layer maps these onto wire
/// error codes; the mover maps the media subset onto pause reasons.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum TapeError {
    #[error("no such device")]
    NoDevice,
    #[error("device is write protected")]
    WriteProtect,
    #[error("device is busy")]
    DeviceBusy,
    #[error("permission denied")]
    Permission,
    #[error("no tape loaded")]
    NoTapeLoaded,
    #[error("tape I/O error")]
    Io,
    #[error("device already open")]
    DeviceOpened,
    #[error("device not open")]
    DevNotOpen,
    #[error("end of file")]
    Eof,
    #[error("end of medium")]
    Eom,
    #[error("illegal argument")]
    IllegalArgs,
}

/// Tape motion operations. `Weof` writes a filemark.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MtioOp {
    Fsf,
    Bsf,
    Fsr,
    Bsr,
    Rew,
    Off,
    Weof,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    ReadWrite,
}

/// Publicly visible position/usage counters, refreshed by the device on
/// every operation.
#[derive(Debug, Clone, Default)]
pub struct TapeCounters {
    pub file_num: u64,
    pub blockno: u64,
    pub soft_errors: u64,
    pub block_size: u32,
    pub total_space: Option<u64>,
    pub space_remain: Option<u64>,
}

/// A block-structured tape with positioning and EOM signalling.
///
/// Reads return at most one record; writes write exactly one record of the
/// given length. A zero-length read or write is a no-op (NDMPv4
/// clarification).
pub trait TapeDevice {
    fn open(&mut self, path: &Path, mode: OpenMode) -> Result<(), TapeError>;
    fn close(&mut self) -> Result<(), TapeError>;
    fn is_open(&self) -> bool;
    fn open_mode(&self) -> Option<OpenMode>;

    /// Executes `count` iterations of `op`, returning the residual count at
    /// the point motion stopped (EOF/EOM/BOT).
    fn mtio(&mut self, op: MtioOp, count: u32) -> Result<u32, TapeError>;

    /// Reads up to `buf.len()` bytes of the current record. Anything other
    /// than a data record yields `Eof` without moving.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TapeError>;

    /// Appends one record. May return `Eom` (soft, once per open) before the
    /// physical limit and `Io` when the limit would be exceeded.
    fn write(&mut self, buf: &[u8]) -> Result<usize, TapeError>;

    /// Writes a filemark.
    fn wfm(&mut self) -> Result<(), TapeError>;

    fn counters(&self) -> &TapeCounters;

    /// True while the soft-EOM warning is latched; cleared by tape motion.
    fn leom_pending(&self) -> bool;
}
