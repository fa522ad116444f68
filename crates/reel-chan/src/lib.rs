//! Byte plumbing for the agent runtime: a ring buffer with free-running
//! indices, a non-blocking buffered [`Channel`] over a socket (or plain
//! memory), the central poll-based [`Wait`] that suspends the session, and
//! the [`ImageStream`] carrying bulk backup image bytes between the DATA and
//! TAPE endpoints.

mod chan;
mod image;
mod ring;

pub use chan::{ChanMode, Channel, Wait};
pub use image::{ConnectStatus, ImageEndpoint, ImageStream, Side, StreamTransport};
pub use ring::Ring;

/// Default channel buffer size. Channels carrying tape records are resized
/// to hold at least one full record.
pub const DEFAULT_RING_SIZE: usize = 64 * 1024;
