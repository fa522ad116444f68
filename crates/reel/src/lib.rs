//! NDMP agent runtime.
//!
//! A [`Session`] multiplexes the CONTROL, DATA, TAPE and ROBOT roles over
//! RPC connections driven by one cooperative event loop. The TAPE agent owns
//! the mover state machine and the data pump that shuttles bytes between the
//! image stream and the tape device.

pub mod conn;
pub mod data;
pub mod dispatch;
pub mod mover;
pub mod session;

pub use conn::Connection;
pub use data::DataAgent;
pub use mover::{TapeAgent, DEFAULT_RECORD_SIZE, WINDOW_INFINITY};
pub use session::{Session, SessionConfig};
