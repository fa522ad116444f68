use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::device::{MtioOp, OpenMode, TapeCounters, TapeDevice, TapeError};

pub const GAP_MAGIC: u32 = 0x0BEE_FEE0;

/// Gap record types, stored as the 4-character tag in little-endian order.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum RecType {
    Bot,
    Data,
    File,
    Eot,
}

impl RecType {
    fn to_wire(self) -> u32 {
        let tag: &[u8; 4] = match self {
            Self::Bot => b"BOT_",
            Self::Data => b"DATA",
            Self::File => b"FILE",
            Self::Eot => b"EOT_",
        };
        u32::from_le_bytes(*tag)
    }

    fn from_wire(v: u32) -> Option<Self> {
        [Self::Bot, Self::Data, Self::File, Self::Eot]
            .into_iter()
            .find(|t| t.to_wire() == v)
    }
}

/// Fixed-width header preceding every simulated record. `prev_size` is the
/// payload length of the preceding record, allowing O(1) backward motion.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct Gap {
    rectype: RecType,
    prev_size: u32,
    size: u32,
}

impl Gap {
    const SIZE: u64 = 16;

    fn encode(&self) -> [u8; 16] {
        let mut buf = [0u8; 16];
        buf[0..4].copy_from_slice(&GAP_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&self.rectype.to_wire().to_le_bytes());
        buf[8..12].copy_from_slice(&self.prev_size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.size.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8; 16]) -> Option<Self> {
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != GAP_MAGIC {
            return None;
        }
        let rectype = RecType::from_wire(u32::from_le_bytes(buf[4..8].try_into().unwrap()))?;
        Some(Self {
            rectype,
            prev_size: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            size: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
        })
    }
}

/// Byte ceiling of a simulated tape. LEOM fires once when a write starts
/// within `leom_margin` of the limit; exceeding the limit itself is a hard
/// I/O error.
#[derive(Debug, Copy, Clone)]
pub struct TapeLimits {
    pub limit: u64,
    pub leom_margin: u64,
}

impl TapeLimits {
    /// Default margin is a bit less than two traditional 32 KiB blocks of
    /// usable space (the gaps eat into it).
    pub const DEFAULT_LEOM_MARGIN: u64 = 2 * 32 * 1024;

    pub fn new(limit: u64) -> Self {
        Self { limit, leom_margin: Self::DEFAULT_LEOM_MARGIN }
    }
}

enum Motion {
    Stopped,
    Data,
    FileMark,
}

/// File-backed tape simulator.
///
/// Side files: `<path>.lck` is an exclusive-create ownership lock and
/// `<path>.pos` a symlink whose target is the decimal offset to resume at
/// after a graceful close.
pub struct SimTape {
    file: Option<File>,
    path: PathBuf,
    open_mode: Option<OpenMode>,
    counters: TapeCounters,
    limits: Option<TapeLimits>,
    sent_leom: bool,
    weof_on_close: bool,
}

impl SimTape {
    pub fn new(limits: Option<TapeLimits>) -> Self {
        Self {
            file: None,
            path: PathBuf::new(),
            open_mode: None,
            counters: TapeCounters::default(),
            limits,
            sent_leom: false,
            weof_on_close: false,
        }
    }

    fn lock_path(path: &Path) -> PathBuf {
        let mut p = path.as_os_str().to_owned();
        p.push(".lck");
        PathBuf::from(p)
    }

    fn pos_path(path: &Path) -> PathBuf {
        let mut p = path.as_os_str().to_owned();
        p.push(".pos");
        PathBuf::from(p)
    }

    fn file(&mut self) -> Result<&mut File, TapeError> {
        self.file.as_mut().ok_or(TapeError::DevNotOpen)
    }

    fn is_writable(&self) -> bool {
        self.open_mode == Some(OpenMode::ReadWrite)
    }

    fn position(&mut self) -> Result<u64, TapeError> {
        self.file()?.stream_position().map_err(|_| TapeError::Io)
    }

    fn seek(&mut self, pos: u64) -> Result<(), TapeError> {
        self.file()?.seek(SeekFrom::Start(pos)).map(|_| ()).map_err(|_| TapeError::Io)
    }

    /// Reads and validates the gap at the current position, leaving the file
    /// cursor just past it.
    fn read_gap(&mut self) -> Result<Gap, TapeError> {
        let mut buf = [0u8; 16];
        self.file()?.read_exact(&mut buf).map_err(|_| TapeError::Io)?;
        Gap::decode(&buf).ok_or(TapeError::Io)
    }

    fn write_gap(&mut self, gap: &Gap) -> io::Result<()> {
        let buf = gap.encode();
        self.file.as_mut().expect("checked open").write_all(&buf)
    }

    fn update_space_remain(&mut self, pos: u64) {
        if let Some(limits) = self.limits {
            self.counters.space_remain = Some(limits.limit.saturating_sub(pos));
        }
    }

    /// A deferred filemark is flushed before motion and before close.
    fn flush_weof(&mut self) {
        if self.weof_on_close {
            // Best effort, matching drive behavior at unload.
            let _ = self.wfm();
        }
    }

    /// Steps backward over one element. `over_file_mark` allows crossing a
    /// FILE gap (BSF); without it the motion stops on the data side of the
    /// mark (BSR).
    fn back_one(&mut self, over_file_mark: bool) -> Result<Motion, TapeError> {
        let cur = self.position()?;
        let here = match self.read_gap() {
            Ok(g) => g,
            Err(e) => {
                self.seek(cur)?;
                return Err(e);
            }
        };

        self.sent_leom = false;
        let Some(new_pos) = cur.checked_sub(Gap::SIZE + u64::from(here.prev_size)) else {
            self.seek(cur)?;
            return Err(TapeError::Io);
        };

        self.seek(new_pos)?;
        let target = match self.read_gap() {
            Ok(g) => g,
            Err(e) => {
                self.seek(cur)?;
                return Err(e);
            }
        };

        match target.rectype {
            RecType::Bot => {
                // Cannot move over BOT; position lands on the first record.
                self.counters.file_num = 0;
                self.counters.blockno = 0;
                Ok(Motion::Stopped)
            }
            RecType::Eot => {
                self.seek(cur)?;
                Err(TapeError::Io)
            }
            RecType::Data => {
                self.counters.blockno = self.counters.blockno.saturating_sub(1);
                self.seek(new_pos)?;
                Ok(Motion::Data)
            }
            RecType::File => {
                self.counters.blockno = 0;
                if !over_file_mark {
                    self.seek(cur)?;
                    return Ok(Motion::Stopped);
                }
                self.counters.file_num = self.counters.file_num.saturating_sub(1);
                self.seek(new_pos)?;
                Ok(Motion::FileMark)
            }
        }
    }

    /// Steps forward over one element; the mirror of [`back_one`].
    fn forw_one(&mut self, over_file_mark: bool) -> Result<Motion, TapeError> {
        let cur = self.position()?;
        let here = match self.read_gap() {
            Ok(g) => g,
            Err(e) => {
                self.seek(cur)?;
                return Err(e);
            }
        };

        self.sent_leom = false;
        let new_pos = cur + Gap::SIZE + u64::from(here.size);

        match here.rectype {
            RecType::Bot => {
                self.seek(cur)?;
                Err(TapeError::Io)
            }
            RecType::Eot => {
                self.seek(cur)?;
                Ok(Motion::Stopped)
            }
            RecType::Data => {
                self.counters.blockno += 1;
                self.seek(new_pos)?;
                Ok(Motion::Data)
            }
            RecType::File => {
                if !over_file_mark {
                    self.seek(cur)?;
                    return Ok(Motion::Stopped);
                }
                self.counters.blockno = 0;
                self.counters.file_num += 1;
                // A FILE gap has no payload; the cursor already sits at
                // new_pos after the gap read.
                Ok(Motion::FileMark)
            }
        }
    }

    fn cleanup_failed_open(&mut self, path: &Path) {
        self.file = None;
        let _ = fs::remove_file(Self::lock_path(path));
    }
}

impl TapeDevice for SimTape {
    fn open(&mut self, path: &Path, mode: OpenMode) -> Result<(), TapeError> {
        if self.file.is_some() {
            warn!("tape simulator is already open");
            return Err(TapeError::DeviceOpened);
        }

        let meta = fs::metadata(path).map_err(|_| TapeError::NoDevice)?;
        if mode == OpenMode::ReadWrite && meta.permissions().readonly() {
            return Err(TapeError::WriteProtect);
        }

        // Exclusive-create lockfile; EEXIST means another session owns the
        // drive.
        if let Err(e) = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(Self::lock_path(path))
        {
            debug!(err = %e, "tape lockfile unavailable");
            return Err(TapeError::DeviceBusy);
        }

        let file = OpenOptions::new()
            .read(true)
            .write(mode == OpenMode::ReadWrite)
            .open(path);
        let file = match file {
            Ok(f) => f,
            Err(_) => {
                let _ = fs::remove_file(Self::lock_path(path));
                return Err(TapeError::Permission);
            }
        };
        self.file = Some(file);

        let pos_path = Self::pos_path(path);
        if meta.len() == 0 {
            let _ = fs::remove_file(&pos_path);
            if mode == OpenMode::ReadWrite {
                // Fresh tape: lay down [BOT][EOT].
                let bot = Gap { rectype: RecType::Bot, prev_size: 0, size: 0 };
                let eot = Gap { rectype: RecType::Eot, prev_size: 0, size: 0 };
                if self.write_gap(&bot).and_then(|()| self.write_gap(&eot)).is_err() {
                    self.cleanup_failed_open(path);
                    return Err(TapeError::Io);
                }
            } else {
                self.cleanup_failed_open(path);
                return Err(TapeError::NoTapeLoaded);
            }
        }

        if self.seek(0).is_err() {
            self.cleanup_failed_open(path);
            return Err(TapeError::Io);
        }
        match self.read_gap() {
            Ok(_) => {}
            Err(_) => {
                self.cleanup_failed_open(path);
                // A file too short to hold a gap has no tape structure at
                // all; a bad magic is a media error.
                return if meta.len() < Gap::SIZE {
                    Err(TapeError::NoTapeLoaded)
                } else {
                    Err(TapeError::Io)
                };
            }
        }

        // Position hint from a previous graceful close. A stale or corrupt
        // hint silently falls back to the first record.
        let mut resume = Gap::SIZE;
        if let Ok(target) = fs::read_link(&pos_path) {
            if let Some(pos) = target.to_str().and_then(|s| s.parse::<u64>().ok()) {
                if self.seek(pos).is_ok() && self.read_gap().is_ok() {
                    resume = pos;
                }
            }
        }
        let _ = fs::remove_file(&pos_path);
        if self.seek(resume).is_err() {
            self.cleanup_failed_open(path);
            return Err(TapeError::Io);
        }

        self.path = path.to_path_buf();
        self.open_mode = Some(mode);
        self.counters = TapeCounters::default();
        self.sent_leom = false;
        self.weof_on_close = false;
        if let Some(limits) = self.limits {
            self.counters.total_space = Some(limits.limit);
            self.counters.space_remain = Some(limits.limit.saturating_sub(meta.len()));
        }
        debug!(path = %path.display(), ?mode, resume, "tape opened");
        Ok(())
    }

    fn close(&mut self) -> Result<(), TapeError> {
        if self.file.is_none() {
            return Err(TapeError::DevNotOpen);
        }
        self.flush_weof();

        if let Ok(cur) = self.position() {
            // Record the resume offset; ignore failures during close.
            let _ = std::os::unix::fs::symlink(cur.to_string(), Self::pos_path(&self.path));
        }

        self.file = None;
        let _ = fs::remove_file(Self::lock_path(&self.path));
        debug!(path = %self.path.display(), "tape closed");
        self.open_mode = None;
        self.counters = TapeCounters::default();
        self.sent_leom = false;
        self.weof_on_close = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn open_mode(&self) -> Option<OpenMode> {
        self.open_mode
    }

    fn mtio(&mut self, op: MtioOp, count: u32) -> Result<u32, TapeError> {
        if self.file.is_none() {
            return Err(TapeError::DevNotOpen);
        }

        let mut resid = count;
        match op {
            MtioOp::Fsf => {
                while resid > 0 {
                    self.flush_weof();
                    match self.forw_one(true)? {
                        Motion::Stopped => break,
                        Motion::FileMark => resid -= 1,
                        Motion::Data => {}
                    }
                }
            }
            MtioOp::Bsf => {
                while resid > 0 {
                    self.flush_weof();
                    match self.back_one(true)? {
                        Motion::Stopped => break,
                        Motion::FileMark => resid -= 1,
                        Motion::Data => {}
                    }
                }
            }
            MtioOp::Fsr => {
                while resid > 0 {
                    self.flush_weof();
                    match self.forw_one(false)? {
                        Motion::Stopped => break,
                        _ => resid -= 1,
                    }
                }
            }
            MtioOp::Bsr => {
                while resid > 0 {
                    self.flush_weof();
                    match self.back_one(false)? {
                        Motion::Stopped => break,
                        _ => resid -= 1,
                    }
                }
            }
            MtioOp::Rew => {
                self.flush_weof();
                resid = 0;
                self.counters.file_num = 0;
                self.counters.blockno = 0;
                self.seek(Gap::SIZE)?;
            }
            MtioOp::Off => {
                self.flush_weof();
                resid = 0;
            }
            MtioOp::Weof => {
                if !self.is_writable() {
                    return Err(TapeError::Permission);
                }
                while resid > 0 {
                    self.wfm()?;
                    resid -= 1;
                }
            }
        }
        Ok(resid)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TapeError> {
        if self.file.is_none() {
            return Err(TapeError::DevNotOpen);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let cur = self.position()?;
        let gap = match self.read_gap() {
            Ok(g) => g,
            Err(e) => {
                self.seek(cur)?;
                return Err(e);
            }
        };

        if gap.rectype != RecType::Data {
            // All other record types read as EOF, without advancing.
            self.seek(cur)?;
            return Err(TapeError::Eof);
        }

        let nb = buf.len().min(gap.size as usize);
        if self.file()?.read_exact(&mut buf[..nb]).is_err() {
            self.seek(cur)?;
            return Err(TapeError::Io);
        }
        if nb < gap.size as usize {
            // Partial read still consumes the whole record.
            self.seek(cur + Gap::SIZE + u64::from(gap.size))?;
        }
        self.counters.blockno += 1;
        Ok(nb)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, TapeError> {
        if self.file.is_none() {
            return Err(TapeError::DevNotOpen);
        }
        if !self.is_writable() {
            return Err(TapeError::Permission);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let cur = self.position()?;
        if let Some(limits) = self.limits {
            if !self.sent_leom && cur > limits.limit.saturating_sub(limits.leom_margin) {
                self.sent_leom = true;
                return Err(TapeError::Eom);
            }
            if cur + Gap::SIZE + buf.len() as u64 > limits.limit {
                return Err(TapeError::Io);
            }
        }

        let old = match self.read_gap() {
            Ok(g) => g,
            Err(e) => {
                self.seek(cur)?;
                return Err(e);
            }
        };

        let gap = Gap { rectype: RecType::Data, prev_size: old.prev_size, size: buf.len() as u32 };
        self.seek(cur)?;
        let wrote = self.write_gap(&gap).is_ok()
            && self.file.as_mut().expect("checked open").write_all(buf).is_ok();

        let (new_pos, trailing_prev) = if wrote {
            self.counters.blockno += 1;
            (cur + Gap::SIZE + buf.len() as u64, buf.len() as u32)
        } else {
            (cur, old.prev_size)
        };

        // Whatever happened, the byte after the last record is an EOT gap.
        let f = self.file.as_mut().expect("checked open");
        if f.set_len(new_pos).is_err() {
            return Err(TapeError::Io);
        }
        self.seek(new_pos)?;
        let eot = Gap { rectype: RecType::Eot, prev_size: trailing_prev, size: 0 };
        if self.write_gap(&eot).is_err() {
            return Err(TapeError::Io);
        }
        self.seek(new_pos)?;
        self.update_space_remain(new_pos);
        self.weof_on_close = true;

        if wrote { Ok(buf.len()) } else { Err(TapeError::Io) }
    }

    fn wfm(&mut self) -> Result<(), TapeError> {
        self.weof_on_close = false;

        if self.file.is_none() {
            return Err(TapeError::DevNotOpen);
        }
        if !self.is_writable() {
            return Err(TapeError::Permission);
        }

        let cur = self.position()?;
        if let Some(limits) = self.limits {
            // Filemarks never trigger the soft EOM warning.
            if cur + Gap::SIZE > limits.limit {
                return Err(TapeError::Io);
            }
        }

        let old = match self.read_gap() {
            Ok(g) => g,
            Err(e) => {
                self.seek(cur)?;
                return Err(e);
            }
        };

        let gap = Gap { rectype: RecType::File, prev_size: old.prev_size, size: 0 };
        self.seek(cur)?;
        let wrote = self.write_gap(&gap).is_ok();

        let (new_pos, trailing_prev) = if wrote {
            self.counters.file_num += 1;
            self.counters.blockno = 0;
            (cur + Gap::SIZE, 0)
        } else {
            (cur, old.prev_size)
        };

        let f = self.file.as_mut().expect("checked open");
        if f.set_len(new_pos).is_err() {
            return Err(TapeError::Io);
        }
        self.seek(new_pos)?;
        let eot = Gap { rectype: RecType::Eot, prev_size: trailing_prev, size: 0 };
        if self.write_gap(&eot).is_err() {
            return Err(TapeError::Io);
        }
        self.seek(new_pos)?;
        self.update_space_remain(new_pos);

        if wrote { Ok(()) } else { Err(TapeError::Io) }
    }

    fn counters(&self) -> &TapeCounters {
        &self.counters
    }

    fn leom_pending(&self) -> bool {
        self.sent_leom
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fresh(dir: &TempDir, limits: Option<TapeLimits>) -> (SimTape, PathBuf) {
        let path = dir.path().join("t.sim");
        fs::write(&path, b"").unwrap();
        let mut tape = SimTape::new(limits);
        tape.open(&path, OpenMode::ReadWrite).unwrap();
        (tape, path)
    }

    #[test]
    fn fresh_tape_reads_eof() {
        let dir = TempDir::new().unwrap();
        let (mut tape, _) = fresh(&dir, None);
        let mut buf = [0u8; 64];
        assert_eq!(tape.read(&mut buf), Err(TapeError::Eof));
        assert_eq!(tape.counters().blockno, 0);
    }

    #[test]
    fn write_bsr_read_returns_same_bytes() {
        let dir = TempDir::new().unwrap();
        let (mut tape, _) = fresh(&dir, None);

        let record: Vec<u8> = (0..512u32).map(|i| (i * 7) as u8).collect();
        assert_eq!(tape.write(&record).unwrap(), 512);
        assert_eq!(tape.counters().blockno, 1);

        assert_eq!(tape.mtio(MtioOp::Bsr, 1).unwrap(), 0);
        assert_eq!(tape.counters().blockno, 0);

        let mut back = vec![0u8; 512];
        assert_eq!(tape.read(&mut back).unwrap(), 512);
        assert_eq!(back, record);
        assert_eq!(tape.counters().blockno, 1);
    }

    #[test]
    fn reopen_resumes_and_replays_stream() {
        let dir = TempDir::new().unwrap();
        let (mut tape, path) = fresh(&dir, None);

        for fill in [0x11u8, 0x22, 0x33] {
            tape.write(&[fill; 256]).unwrap();
            tape.wfm().unwrap();
        }
        tape.mtio(MtioOp::Rew, 1).unwrap();
        tape.close().unwrap();

        // The .pos hint points at the first record after the rewind.
        let mut tape = SimTape::new(None);
        tape.open(&path, OpenMode::Read).unwrap();
        let mut buf = vec![0u8; 256];
        for fill in [0x11u8, 0x22, 0x33] {
            assert_eq!(tape.read(&mut buf).unwrap(), 256);
            assert_eq!(buf, vec![fill; 256]);
            assert_eq!(tape.read(&mut buf), Err(TapeError::Eof));
            assert_eq!(tape.mtio(MtioOp::Fsf, 1).unwrap(), 0);
        }
        assert_eq!(tape.counters().file_num, 3);
        tape.close().unwrap();
    }

    #[test]
    fn pos_hint_survives_mid_tape_close() {
        let dir = TempDir::new().unwrap();
        let (mut tape, path) = fresh(&dir, None);
        tape.write(&[0xaa; 128]).unwrap();
        tape.write(&[0xbb; 128]).unwrap();
        tape.mtio(MtioOp::Rew, 1).unwrap();
        let mut buf = vec![0u8; 128];
        tape.read(&mut buf).unwrap();
        tape.close().unwrap();

        let mut tape = SimTape::new(None);
        tape.open(&path, OpenMode::Read).unwrap();
        tape.read(&mut buf).unwrap();
        assert_eq!(buf, vec![0xbb; 128]);
    }

    #[test]
    fn filemark_semantics() {
        let dir = TempDir::new().unwrap();
        let (mut tape, _) = fresh(&dir, None);

        tape.write(&[1; 64]).unwrap();
        tape.wfm().unwrap();
        tape.write(&[2; 64]).unwrap();
        assert_eq!(tape.counters().file_num, 1);
        assert_eq!(tape.counters().blockno, 1);

        // The pending weof flushes into a trailing filemark, so BSF 2
        // crosses it plus the first mark, landing on the data side of the
        // first mark where a read sees EOF.
        assert_eq!(tape.mtio(MtioOp::Bsf, 2).unwrap(), 0);
        assert_eq!(tape.counters().file_num, 0);
        let mut buf = vec![0u8; 64];
        assert_eq!(tape.read(&mut buf), Err(TapeError::Eof));

        // BSR steps back over the first record; a read then replays it.
        assert_eq!(tape.mtio(MtioOp::Bsr, 1).unwrap(), 0);
        assert_eq!(tape.read(&mut buf).unwrap(), 64);
        assert_eq!(buf, vec![1; 64]);
    }

    #[test]
    fn bsf_cannot_cross_bot() {
        let dir = TempDir::new().unwrap();
        let (mut tape, _) = fresh(&dir, None);
        tape.write(&[5; 32]).unwrap();
        // The flush adds one crossable mark; the second BSF stops at BOT
        // with a residual, positioned on the first record.
        assert_eq!(tape.mtio(MtioOp::Bsf, 2).unwrap(), 1);
        assert_eq!(tape.counters().file_num, 0);
        assert_eq!(tape.counters().blockno, 0);
        let mut buf = vec![0u8; 32];
        assert_eq!(tape.read(&mut buf).unwrap(), 32);
    }

    #[test]
    fn lockfile_enforces_exclusive_open() {
        let dir = TempDir::new().unwrap();
        let (tape, path) = fresh(&dir, None);

        let mut second = SimTape::new(None);
        assert_eq!(second.open(&path, OpenMode::Read), Err(TapeError::DeviceBusy));
        drop(tape); // first session keeps the lock until close

        let mut third = SimTape::new(None);
        // The lockfile is still on disk: the first tape was dropped, not
        // closed.
        assert_eq!(third.open(&path, OpenMode::Read), Err(TapeError::DeviceBusy));
        fs::remove_file(SimTape::lock_path(&path)).unwrap();
        third.open(&path, OpenMode::Read).unwrap();
    }

    #[test]
    fn leom_fires_once_then_hard_io() {
        let dir = TempDir::new().unwrap();
        let limit = 256 * 1024;
        let (mut tape, _) = fresh(&dir, Some(TapeLimits::new(limit as u64)));

        let record = vec![0u8; 32 * 1024];
        let mut soft = 0;
        let mut written = 0usize;
        loop {
            match tape.write(&record) {
                Ok(n) => written += n,
                Err(TapeError::Eom) => {
                    soft += 1;
                    break;
                }
                Err(e) => panic!("unexpected error before LEOM: {e}"),
            }
        }
        assert_eq!(soft, 1);
        assert!(written > 0);
        assert!(tape.leom_pending());

        // After the warning, writes either fit or fail hard; EOM is never
        // reported twice.
        loop {
            match tape.write(&record) {
                Ok(_) => {}
                Err(TapeError::Io) => break,
                Err(e) => panic!("expected hard IO after LEOM, got {e}"),
            }
        }
    }

    #[test]
    fn filemark_never_triggers_leom() {
        let dir = TempDir::new().unwrap();
        let (mut tape, _) = fresh(&dir, Some(TapeLimits::new(128 * 1024)));
        let record = vec![0u8; 32 * 1024];
        while tape.write(&record).is_ok() {}
        assert!(tape.leom_pending());
        tape.wfm().unwrap();
        assert_eq!(tape.counters().file_num, 1);
    }

    #[test]
    fn zero_length_io_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let (mut tape, _) = fresh(&dir, None);
        assert_eq!(tape.write(&[]).unwrap(), 0);
        let mut empty = [0u8; 0];
        assert_eq!(tape.read(&mut empty).unwrap(), 0);
        assert_eq!(tape.counters().blockno, 0);
    }

    #[test]
    fn empty_readonly_tape_is_not_loaded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blank.sim");
        fs::write(&path, b"").unwrap();
        let mut tape = SimTape::new(None);
        assert_eq!(tape.open(&path, OpenMode::Read), Err(TapeError::NoTapeLoaded));
        // Failure releases the lock.
        assert!(!SimTape::lock_path(&path).exists());
    }

    #[test]
    fn garbage_file_fails_magic_check() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("junk.sim");
        fs::write(&path, vec![0x5a; 64]).unwrap();
        let mut tape = SimTape::new(None);
        assert_eq!(tape.open(&path, OpenMode::Read), Err(TapeError::Io));
    }

    #[test]
    fn deferred_weof_flushes_before_motion() {
        let dir = TempDir::new().unwrap();
        let (mut tape, path) = fresh(&dir, None);
        tape.write(&[9; 64]).unwrap();
        // The pending weof becomes a filemark on rewind, then close adds
        // nothing further.
        tape.mtio(MtioOp::Rew, 1).unwrap();
        tape.close().unwrap();

        let mut tape = SimTape::new(None);
        tape.open(&path, OpenMode::Read).unwrap();
        let mut buf = vec![0u8; 64];
        tape.read(&mut buf).unwrap();
        assert_eq!(tape.read(&mut buf), Err(TapeError::Eof));
        assert_eq!(tape.mtio(MtioOp::Fsf, 1).unwrap(), 0);
        assert_eq!(tape.counters().file_num, 1);
        assert_eq!(tape.read(&mut buf), Err(TapeError::Eof));
    }

    #[test]
    fn partial_record_read_consumes_record() {
        let dir = TempDir::new().unwrap();
        let (mut tape, _) = fresh(&dir, None);
        tape.write(&[7; 512]).unwrap();
        tape.write(&[8; 512]).unwrap();
        tape.mtio(MtioOp::Rew, 1).unwrap();

        let mut small = vec![0u8; 100];
        assert_eq!(tape.read(&mut small).unwrap(), 100);
        assert_eq!(small, vec![7; 100]);
        assert_eq!(tape.counters().blockno, 1);

        let mut full = vec![0u8; 512];
        assert_eq!(tape.read(&mut full).unwrap(), 512);
        assert_eq!(full, vec![8; 512]);
    }
}
