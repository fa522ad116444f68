//! TAPE agent: mover finite-state machine and the quantum-based data pump
//! between the image stream and the tape device.

use reel_chan::{ChanMode, ConnectStatus, ImageStream, Side};
use reel_proto::{
    Addr, MoverFsmState, MoverHaltReason, MoverMode, MoverPauseReason, MoverStateInfo,
};
use reel_tape::{MtioOp, SimTape, TapeDevice, TapeError, TapeLimits};
use tracing::{debug, trace, warn};

/// Traditional tar default, 20 × 512.
pub const DEFAULT_RECORD_SIZE: u32 = 10_240;

/// "No window end": reads and writes are bounded only by the stream.
pub const WINDOW_INFINITY: u64 = u64::MAX;

/// Peer-visible mover state.
#[derive(Debug, Clone)]
pub struct MoverState {
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
}

impl MoverState {
    fn initial() -> Self {
        Self {
            state: MoverFsmState::Idle,
            mode: MoverMode::NoAction,
            pause_reason: MoverPauseReason::NotPaused,
            halt_reason: MoverHaltReason::NotHalted,
            record_size: DEFAULT_RECORD_SIZE,
            record_num: 0,
            bytes_moved: 0,
            seek_position: 0,
            bytes_left_to_read: 0,
            window_offset: 0,
            window_length: WINDOW_INFINITY,
        }
    }
}

struct PendingChange {
    state: MoverFsmState,
    halt_reason: MoverHaltReason,
    pause_reason: MoverPauseReason,
}

/// The TAPE role's control block: device, mover state, and pump scratch.
pub struct TapeAgent {
    pub device: SimTape,
    pub mover: MoverState,
    /// Address of the attached image-stream peer, for GET_STATE.
    pub connect_addr: Addr,
    /// Set on every state/pause/halt transition; the scheduler turns it into
    /// at most one notification per quantum.
    pub notify_pending: bool,
    window_end: u64,
    want_pos: u64,
    record_buf: Vec<u8>,
    /// Which tape block currently sits in `record_buf`, if trustworthy.
    tb_blockno: Option<u64>,
    pending: Option<PendingChange>,
}

impl TapeAgent {
    pub fn new(limits: Option<TapeLimits>) -> Self {
        Self {
            device: SimTape::new(limits),
            mover: MoverState::initial(),
            connect_addr: Addr::Local,
            notify_pending: false,
            window_end: WINDOW_INFINITY,
            want_pos: 0,
            record_buf: Vec::new(),
            tb_blockno: None,
            pending: None,
        }
    }

    /// Mover state resets on each start/stop cycle; the device persists
    /// until an explicit close.
    fn init_mover_state(&mut self) {
        self.mover = MoverState::initial();
        self.connect_addr = Addr::Local;
        self.window_end = WINDOW_INFINITY;
        self.want_pos = 0;
        self.tb_blockno = None;
        self.pending = None;
    }

    pub fn sync_state(&mut self) {
        self.mover.record_num = self.device.counters().blockno;
    }

    pub fn state_info(&self) -> MoverStateInfo {
        MoverStateInfo {
            state: self.mover.state,
            mode: self.mover.mode,
            pause_reason: self.mover.pause_reason,
            halt_reason: self.mover.halt_reason,
            record_size: self.mover.record_size,
            record_num: self.mover.record_num,
            bytes_moved: self.mover.bytes_moved,
            seek_position: self.mover.seek_position,
            bytes_left_to_read: self.mover.bytes_left_to_read,
            window_offset: self.mover.window_offset,
            window_length: self.mover.window_length,
            connect_addr: self.connect_addr.clone(),
        }
    }

    pub fn listen(&mut self, mode: MoverMode) {
        self.mover.mode = mode;
        self.mover.state = MoverFsmState::Listen;
        self.mover.halt_reason = MoverHaltReason::NotHalted;
        self.mover.pause_reason = MoverPauseReason::NotPaused;
    }

    pub fn connect(&mut self, mode: MoverMode, image: &mut ImageStream) {
        self.mover.mode = mode;
        self.start_active(image);
    }

    /// Immediate halt: clears any pending transition and detaches the image
    /// stream.
    pub fn halt(&mut self, reason: MoverHaltReason, image: &mut ImageStream) {
        debug!(?reason, "mover halted");
        self.mover.state = MoverFsmState::Halted;
        self.mover.halt_reason = reason;
        self.mover.pause_reason = MoverPauseReason::NotPaused;
        self.pending = None;
        self.notify_pending = true;
        image.close();
    }

    pub fn pause(&mut self, reason: MoverPauseReason) {
        debug!(?reason, "mover paused");
        self.mover.state = MoverFsmState::Paused;
        self.mover.halt_reason = MoverHaltReason::NotHalted;
        self.mover.pause_reason = reason;
        self.pending = None;
        self.notify_pending = true;
    }

    /// Queues a transition to take effect once the image channel drains, so
    /// buffered bytes are never lost to a pause.
    fn pause_pending(&mut self, reason: MoverPauseReason) {
        trace!(?reason, "pause pending drain");
        self.pending = Some(PendingChange {
            state: MoverFsmState::Paused,
            halt_reason: MoverHaltReason::NotHalted,
            pause_reason: reason,
        });
    }

    fn apply_pending(&mut self) {
        if let Some(p) = self.pending.take() {
            debug!(state = ?p.state, pause = ?p.pause_reason, "applying drained transition");
            self.mover.state = p.state;
            self.mover.halt_reason = p.halt_reason;
            self.mover.pause_reason = p.pause_reason;
            self.notify_pending = true;
        }
    }

    pub fn abort(&mut self, image: &mut ImageStream) {
        self.halt(MoverHaltReason::Aborted, image);
    }

    /// Only legal from HALTED (checked by dispatch); resets to IDLE.
    pub fn stop(&mut self) {
        self.init_mover_state();
    }

    pub fn mover_continue(&mut self) {
        self.activate();
    }

    pub fn set_window(&mut self, offset: u64, length: u64) {
        self.mover.window_offset = offset;
        self.mover.window_length = length;
        self.window_end = offset.saturating_add(length);
    }

    pub fn read(&mut self, offset: u64, length: u64) {
        self.mover.seek_position = offset;
        self.mover.bytes_left_to_read = length;
        self.want_pos = offset;
    }

    pub fn set_record_size(&mut self, len: u32) {
        self.mover.record_size = len;
    }

    fn activate(&mut self) {
        self.mover.state = MoverFsmState::Active;
        self.mover.halt_reason = MoverHaltReason::NotHalted;
        self.mover.pause_reason = MoverPauseReason::NotPaused;
        // Never trust the record buffer across a reactivation.
        self.tb_blockno = None;
    }

    pub fn start_active(&mut self, image: &mut ImageStream) {
        debug!(mode = ?self.mover.mode, "mover going active");
        let chan_mode = match self.mover.mode {
            MoverMode::Read => ChanMode::Read,
            MoverMode::Write => ChanMode::Write,
            MoverMode::NoAction => {
                warn!("mover started with no mode");
                return;
            }
        };
        image.start(chan_mode, self.mover.record_size as usize);
        self.activate();
    }

    /// One non-blocking slice of mover work. Returns true if anything
    /// happened.
    pub fn quantum(&mut self, image: &mut ImageStream) -> bool {
        match self.mover.state {
            MoverFsmState::Idle | MoverFsmState::Paused | MoverFsmState::Halted => false,
            MoverFsmState::Listen => match image.ep(Side::Tape).status {
                ConnectStatus::Listen => false,
                ConnectStatus::Accepted | ConnectStatus::Connected => {
                    self.start_active(image);
                    true
                }
                ConnectStatus::Botched | ConnectStatus::Idle => {
                    self.halt(MoverHaltReason::ConnectError, image);
                    true
                }
            },
            MoverFsmState::Active => match self.mover.mode {
                MoverMode::Read => self.read_quantum(image),
                MoverMode::Write => self.write_quantum(image),
                MoverMode::NoAction => {
                    warn!("active mover with no mode");
                    false
                }
            },
        }
    }

    fn image_halt_reason(image: &ImageStream) -> MoverHaltReason {
        if image.chan.saved_errno.is_some() {
            MoverHaltReason::ConnectError
        } else {
            MoverHaltReason::ConnectClosed
        }
    }

    /// BACKUP direction: image ring → tape, one full record per write.
    fn read_quantum(&mut self, image: &mut ImageStream) -> bool {
        let count = self.mover.record_size as usize;
        if self.record_buf.len() < count {
            self.record_buf.resize(count, 0);
        }

        let mut did = false;
        loop {
            let mut n_ready = image.chan.n_ready();
            if image.chan.eof {
                if n_ready == 0 {
                    let reason = Self::image_halt_reason(image);
                    self.halt(reason, image);
                    return true;
                }
                if n_ready < count {
                    // Final short record: zero-pad up to record size. Only
                    // EOF may pad; mid-stream the pump never splits.
                    image.chan.ring_mut().pad_zero(count - n_ready);
                    n_ready = image.chan.n_ready();
                }
            }
            if n_ready < count {
                return did; // blocked on producer
            }

            if self.want_pos >= self.window_end {
                self.mover.seek_position = self.want_pos;
                self.pause(MoverPauseReason::Seek);
                return true;
            }

            image.chan.ring().peek(&mut self.record_buf[..count]);
            match self.device.write(&self.record_buf[..count]) {
                Ok(_) => {
                    image.chan.ring_mut().consume(count);
                    self.mover.bytes_moved += count as u64;
                    self.want_pos += count as u64;
                    did = true;
                }
                Err(TapeError::Eom) => {
                    self.pause(MoverPauseReason::Eom);
                    return true;
                }
                Err(e) => {
                    debug!(err = %e, "tape write failed");
                    self.pause(MoverPauseReason::MediaError);
                    return true;
                }
            }
        }
    }

    /// RECOVER direction: tape → image ring, repositioning to the record
    /// containing `want_pos` as needed.
    fn write_quantum(&mut self, image: &mut ImageStream) -> bool {
        let count = self.mover.record_size as usize;
        if self.record_buf.len() < count {
            self.record_buf.resize(count, 0);
        }

        let mut did = false;
        loop {
            if image.chan.eof {
                let reason = Self::image_halt_reason(image);
                self.halt(reason, image);
                return true;
            }
            let n_avail = image.chan.n_avail();
            if n_avail == 0 {
                return did; // let the consumer drain
            }
            if self.pending.is_some() {
                if image.chan.n_ready() > 0 {
                    return did; // transition waits for the drain
                }
                self.apply_pending();
                return true;
            }

            let mut n_read = n_avail.min(self.mover.bytes_left_to_read.min(usize::MAX as u64) as usize);
            if n_read == 0 {
                // A finished mover read pauses for the next window cycle;
                // before the first read there is nothing to do yet.
                if self.want_pos > self.mover.seek_position {
                    self.mover.seek_position = self.want_pos;
                    self.pause_pending(MoverPauseReason::Seek);
                    continue;
                }
                return did;
            }

            if self.want_pos < self.mover.window_offset || self.want_pos >= self.window_end {
                self.mover.seek_position = self.want_pos;
                self.pause_pending(MoverPauseReason::Seek);
                continue;
            }
            let max_read = self.window_end - self.want_pos;
            if n_read as u64 > max_read {
                n_read = max_read as usize;
            }

            let rs = u64::from(self.mover.record_size);
            let want_blockno = (self.want_pos - self.mover.window_offset) / rs;
            if self.tb_blockno != Some(want_blockno) {
                self.sync_state();
                let cur = self.device.counters().blockno;
                if cur < want_blockno {
                    match self.device.mtio(MtioOp::Fsr, (want_blockno - cur) as u32) {
                        Ok(0) => {}
                        Ok(_) | Err(TapeError::Eof) => {
                            self.pause_pending(MoverPauseReason::Eof);
                            continue;
                        }
                        Err(e) => {
                            debug!(err = %e, "forward space failed");
                            self.pause_pending(MoverPauseReason::MediaError);
                            continue;
                        }
                    }
                } else if cur > want_blockno {
                    match self.device.mtio(MtioOp::Bsr, (cur - want_blockno) as u32) {
                        Ok(0) => {}
                        _ => {
                            self.pause_pending(MoverPauseReason::MediaError);
                            continue;
                        }
                    }
                }

                match self.device.read(&mut self.record_buf[..count]) {
                    Err(TapeError::Eof) => {
                        self.pause_pending(MoverPauseReason::Eof);
                        continue;
                    }
                    Err(e) => {
                        debug!(err = %e, "tape read failed");
                        self.pause_pending(MoverPauseReason::MediaError);
                        continue;
                    }
                    Ok(0) => return did,
                    Ok(n) if n != count => {
                        // Short record; reposition and retry until the full
                        // record is obtained.
                        did = true;
                        continue;
                    }
                    Ok(_) => {
                        self.tb_blockno = Some(want_blockno);
                        did = true;
                    }
                }
            }

            let record_off = (self.want_pos % rs) as usize;
            let n = n_read.min(count - record_off);
            image.chan.ring_mut().copy_in(&self.record_buf[record_off..record_off + n]);
            self.want_pos += n as u64;
            self.mover.bytes_left_to_read -= n as u64;
            did = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reel_chan::ImageStream;

    #[test]
    fn listen_on_botched_accept_halts_with_connect_error() {
        let mut ta = TapeAgent::new(None);
        let mut image = ImageStream::new();
        ta.listen(MoverMode::Read);
        image.listen_local(Side::Tape);
        image.tape_ep.status = ConnectStatus::Botched;

        assert!(ta.quantum(&mut image));
        assert_eq!(ta.mover.state, MoverFsmState::Halted);
        assert_eq!(ta.mover.halt_reason, MoverHaltReason::ConnectError);
        assert!(ta.notify_pending);
    }

    #[test]
    fn stop_resets_counters() {
        let mut ta = TapeAgent::new(None);
        let mut image = ImageStream::new();
        ta.set_window(100, 200);
        ta.mover.bytes_moved = 5;
        ta.halt(MoverHaltReason::Aborted, &mut image);
        ta.stop();
        assert_eq!(ta.mover.state, MoverFsmState::Idle);
        assert_eq!(ta.mover.bytes_moved, 0);
        assert_eq!(ta.mover.window_length, WINDOW_INFINITY);
        assert_eq!(ta.mover.record_size, DEFAULT_RECORD_SIZE);
    }

    #[test]
    fn pause_clears_halt_reason_and_flags_notify() {
        let mut ta = TapeAgent::new(None);
        ta.pause(MoverPauseReason::Eom);
        assert_eq!(ta.mover.state, MoverFsmState::Paused);
        assert_eq!(ta.mover.pause_reason, MoverPauseReason::Eom);
        assert_eq!(ta.mover.halt_reason, MoverHaltReason::NotHalted);
        assert!(ta.notify_pending);
    }
}
