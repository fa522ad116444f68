//! Tape device abstraction and the file-backed simulator.
//!
//! The simulator provides faithful block/filemark/EOM semantics on top of a
//! regular file: every record is framed by a fixed-width little-endian gap
//! header, a sentinel EOT gap trails the last record, and `prev_size` links
//! allow O(1) backward motion.

mod device;
mod sim;

pub use device::{MtioOp, OpenMode, TapeCounters, TapeDevice, TapeError};
pub use sim::{SimTape, TapeLimits, GAP_MAGIC};
