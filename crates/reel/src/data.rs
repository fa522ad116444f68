//! DATA agent: backup/recover endpoint of the image stream.
//!
//! The only built-in backup type is `"null"`: a pattern generator on backup
//! and a byte sink on recover, enough to drive the mover end to end. Real
//! formatters are external programs in a full deployment and out of scope
//! here.

use reel_chan::ImageStream;
use reel_proto::{
    Addr, DataFsmState, DataHaltReason, DataOperation, DataStateInfo, EnvPair, NdmpError,
    NlistEntry,
};
use tracing::{debug, warn};

/// Env name for the null formatter's stream length in bytes.
pub const ENV_LENGTH: &str = "LENGTH";
/// Env name for the null formatter's fill byte (decimal or 0x-hex).
pub const ENV_FILL: &str = "FILL";

enum Formatter {
    NullBackup { remaining: u64, fill: u8 },
    NullRecover,
}

pub struct DataAgent {
    pub state: DataFsmState,
    pub operation: DataOperation,
    pub halt_reason: DataHaltReason,
    pub env: Vec<EnvPair>,
    pub nlist: Vec<NlistEntry>,
    pub bytes_processed: u64,
    pub connect_addr: Addr,
    pub notify_pending: bool,
    formatter: Option<Formatter>,
}

fn env_lookup<'a>(env: &'a [EnvPair], name: &str) -> Option<&'a str> {
    env.iter().find(|e| e.name == name).map(|e| e.value.as_str())
}

fn parse_byte(s: &str) -> Option<u8> {
    s.strip_prefix("0x")
        .map_or_else(|| s.parse().ok(), |hex| u8::from_str_radix(hex, 16).ok())
}

impl DataAgent {
    pub fn new() -> Self {
        Self {
            state: DataFsmState::Idle,
            operation: DataOperation::NoAction,
            halt_reason: DataHaltReason::NotHalted,
            env: Vec::new(),
            nlist: Vec::new(),
            bytes_processed: 0,
            connect_addr: Addr::Local,
            notify_pending: false,
            formatter: None,
        }
    }

    pub fn state_info(&self) -> DataStateInfo {
        DataStateInfo {
            state: self.state,
            operation: self.operation,
            halt_reason: self.halt_reason,
            bytes_processed: self.bytes_processed,
            read_offset: 0,
            read_length: 0,
            connect_addr: self.connect_addr.clone(),
        }
    }

    pub fn listen(&mut self) {
        self.state = DataFsmState::Listen;
    }

    pub fn connected(&mut self, addr: Addr) {
        self.state = DataFsmState::Connected;
        self.connect_addr = addr;
    }

    pub fn start_backup(&mut self, bu_type: &str, env: Vec<EnvPair>) -> Result<(), NdmpError> {
        self.start_formatter(bu_type, &env, DataOperation::Backup)?;
        self.env = env;
        Ok(())
    }

    pub fn start_recover(
        &mut self,
        bu_type: &str,
        env: Vec<EnvPair>,
        nlist: Vec<NlistEntry>,
        filehist: bool,
    ) -> Result<(), NdmpError> {
        let op = if filehist { DataOperation::RecoverFilehist } else { DataOperation::Recover };
        self.start_formatter(bu_type, &env, op)?;
        self.env = env;
        self.nlist = nlist;
        Ok(())
    }

    fn start_formatter(
        &mut self,
        bu_type: &str,
        env: &[EnvPair],
        op: DataOperation,
    ) -> Result<(), NdmpError> {
        if bu_type != "null" {
            warn!(bu_type, "unknown backup type");
            return Err(NdmpError::NotSupported);
        }
        self.formatter = Some(if op == DataOperation::Backup {
            let remaining = env_lookup(env, ENV_LENGTH)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0u64);
            let fill =
                env_lookup(env, ENV_FILL).and_then(parse_byte).unwrap_or(0u8);
            Formatter::NullBackup { remaining, fill }
        } else {
            Formatter::NullRecover
        });
        self.operation = op;
        self.state = DataFsmState::Active;
        self.halt_reason = DataHaltReason::NotHalted;
        self.bytes_processed = 0;
        debug!(?op, "data operation started");
        Ok(())
    }

    pub fn halt(&mut self, reason: DataHaltReason) {
        debug!(?reason, "data halted");
        self.state = DataFsmState::Halted;
        self.halt_reason = reason;
        self.formatter = None;
        self.notify_pending = true;
    }

    pub fn abort(&mut self) {
        self.halt(DataHaltReason::Aborted);
    }

    /// Only legal from HALTED (checked by dispatch); resets to IDLE.
    pub fn stop(&mut self) {
        *self = Self::new();
    }

    /// One non-blocking slice of formatter work.
    pub fn quantum(&mut self, image: &mut ImageStream) -> bool {
        if self.state != DataFsmState::Active {
            return false;
        }
        match &mut self.formatter {
            Some(Formatter::NullBackup { remaining, fill }) => {
                let mut did = false;
                if *remaining > 0 {
                    let ring = image.chan.ring_mut();
                    let want = (*remaining).min(ring.n_avail() as u64) as usize;
                    let mut left = want;
                    while left > 0 {
                        let step = {
                            let slice = ring.avail_slice_mut();
                            let step = slice.len().min(left);
                            slice[..step].fill(*fill);
                            step
                        };
                        ring.commit(step);
                        left -= step;
                    }
                    if want > 0 {
                        *remaining -= want as u64;
                        self.bytes_processed += want as u64;
                        did = true;
                    }
                }
                if *remaining == 0 {
                    // End of stream: a local channel flags EOF directly, a
                    // socket half-closes once the ring has drained.
                    if image.chan.is_fd() {
                        if image.chan.n_ready() == 0 {
                            image.chan.shutdown_write();
                            self.halt(DataHaltReason::Successful);
                            did = true;
                        }
                    } else {
                        image.chan.eof = true;
                        self.halt(DataHaltReason::Successful);
                        did = true;
                    }
                }
                did
            }
            Some(Formatter::NullRecover) => {
                let mut did = false;
                let mut sink = [0u8; 4096];
                loop {
                    let n = image.chan.ring_mut().copy_out(&mut sink);
                    if n == 0 {
                        break;
                    }
                    self.bytes_processed += n as u64;
                    did = true;
                }
                if image.chan.eof && image.chan.n_ready() == 0 {
                    self.halt(DataHaltReason::Successful);
                    did = true;
                }
                did
            }
            None => false,
        }
    }
}

impl Default for DataAgent {
    fn default() -> Self {
        Self::new()
    }
}
