//! SCSI media-changer simulator.
//!
//! Implements the minimal CDB set a backup controller needs against a fake
//! library: TEST UNIT READY, INQUIRY (page 0), MODE SENSE(6) page 0x1D,
//! READ ELEMENT STATUS and MOVE MEDIUM. Library state lives in a directory:
//! a fixed-width little-endian `state` file plus one marker file per
//! occupied drive/slot/ie element, renamed as volumes move.

use std::fs;
use std::path::{Path, PathBuf};

use reel_proto::{CdbReply, CdbRequest, NdmpError, ScsiDataDir};
use tracing::{debug, warn};

/// Fixed element address layout.
pub const IE_FIRST: u16 = 0;
pub const IE_COUNT: u16 = 2;
pub const MTE_FIRST: u16 = 16;
pub const MTE_COUNT: u16 = 1;
pub const DTE_FIRST: u16 = 128;
pub const DTE_COUNT: u16 = 2;
pub const STORAGE_FIRST: u16 = 1024;
pub const STORAGE_COUNT: u16 = 10;

const NUM_ELEMENTS: u16 = IE_COUNT + MTE_COUNT + DTE_COUNT + STORAGE_COUNT;

/// SCSI status bytes.
pub const STATUS_GOOD: u32 = 0x00;
pub const STATUS_CHECK_CONDITION: u32 = 0x02;

const SENSE_KEY_ILLEGAL_REQUEST: u8 = 0x05;
const ASQ_INVALID_FIELD_IN_CDB: u16 = 0x2400;
const ASQ_INVALID_ELEMENT_ADDRESS: u16 = 0x2101;

const CDB_TEST_UNIT_READY: u8 = 0x00;
const CDB_INQUIRY: u8 = 0x12;
const CDB_MODE_SENSE_6: u8 = 0x1a;
const CDB_MOVE_MEDIUM: u8 = 0xa5;
const CDB_READ_ELEMENT_STATUS: u8 = 0xb8;

const VOLTAG_LEN: usize = 32;
/// full flag + medium type + source element + both voltags.
const ELEMENT_WIRE_LEN: usize = 1 + 1 + 2 + 2 * VOLTAG_LEN;

#[derive(Debug, Copy, Clone)]
struct ElementState {
    full: bool,
    medium_type: u8,
    source_element: u16,
    pvoltag: [u8; VOLTAG_LEN],
    avoltag: [u8; VOLTAG_LEN],
}

impl ElementState {
    fn empty() -> Self {
        Self {
            full: false,
            medium_type: 0,
            source_element: 0,
            pvoltag: [0; VOLTAG_LEN],
            avoltag: [0; VOLTAG_LEN],
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.push(u8::from(self.full));
        out.push(self.medium_type);
        out.extend_from_slice(&self.source_element.to_le_bytes());
        out.extend_from_slice(&self.pvoltag);
        out.extend_from_slice(&self.avoltag);
    }

    fn decode(buf: &[u8]) -> Self {
        let mut es = Self::empty();
        es.full = buf[0] != 0;
        es.medium_type = buf[1];
        es.source_element = u16::from_le_bytes(buf[2..4].try_into().unwrap());
        es.pvoltag.copy_from_slice(&buf[4..4 + VOLTAG_LEN]);
        es.avoltag.copy_from_slice(&buf[4 + VOLTAG_LEN..ELEMENT_WIRE_LEN]);
        es
    }
}

fn voltag(prefix: &str, index: usize) -> [u8; VOLTAG_LEN] {
    let mut tag = [b' '; VOLTAG_LEN];
    let text = format!("{prefix}{index:02X}XX");
    tag[..text.len()].copy_from_slice(text.as_bytes());
    tag
}

struct RobotState {
    mte: Vec<ElementState>,
    storage: Vec<ElementState>,
    ie: Vec<ElementState>,
    dte: Vec<ElementState>,
}

impl RobotState {
    /// A freshly-invented library: all storage slots populated, everything
    /// else empty.
    fn init() -> Self {
        let storage = (0..STORAGE_COUNT as usize)
            .map(|i| ElementState {
                full: true,
                medium_type: 1, // data
                source_element: 0,
                pvoltag: voltag("PTAG", i),
                avoltag: voltag("ATAG", i),
            })
            .collect();
        Self {
            mte: vec![ElementState::empty(); MTE_COUNT as usize],
            storage,
            ie: vec![ElementState::empty(); IE_COUNT as usize],
            dte: vec![ElementState::empty(); DTE_COUNT as usize],
        }
    }

    fn load(dir: &Path) -> Self {
        let path = dir.join("state");
        let Ok(bytes) = fs::read(&path) else {
            return Self::init();
        };
        if bytes.len() < NUM_ELEMENTS as usize * ELEMENT_WIRE_LEN {
            return Self::init();
        }
        let mut at = 0;
        let mut take = |n: usize| {
            let mut v = Vec::with_capacity(n);
            for _ in 0..n {
                v.push(ElementState::decode(&bytes[at..at + ELEMENT_WIRE_LEN]));
                at += ELEMENT_WIRE_LEN;
            }
            v
        };
        Self {
            mte: take(MTE_COUNT as usize),
            storage: take(STORAGE_COUNT as usize),
            ie: take(IE_COUNT as usize),
            dte: take(DTE_COUNT as usize),
        }
    }

    fn save(&self, dir: &Path) {
        let mut out = Vec::with_capacity(NUM_ELEMENTS as usize * ELEMENT_WIRE_LEN);
        for es in self.mte.iter().chain(&self.storage).chain(&self.ie).chain(&self.dte) {
            es.encode(&mut out);
        }
        if let Err(e) = fs::write(dir.join("state"), &out) {
            warn!(err = %e, "failed to persist robot state");
        }
    }

    fn element_mut(&mut self, addr: u16) -> Option<(&mut ElementState, String)> {
        if (IE_FIRST..IE_FIRST + IE_COUNT).contains(&addr) {
            let i = (addr - IE_FIRST) as usize;
            Some((&mut self.ie[i], format!("ie{i}")))
        } else if (DTE_FIRST..DTE_FIRST + DTE_COUNT).contains(&addr) {
            let i = (addr - DTE_FIRST) as usize;
            Some((&mut self.dte[i], format!("drive{i}")))
        } else if (STORAGE_FIRST..STORAGE_FIRST + STORAGE_COUNT).contains(&addr) {
            let i = (addr - STORAGE_FIRST) as usize;
            Some((&mut self.storage[i], format!("slot{i}")))
        } else {
            None
        }
    }

    /// Moves a volume between elements, renaming the on-disk marker file so
    /// a tape drive pointed at the element sees the right media.
    fn move_medium(&mut self, dir: &Path, src: u16, dest: u16) -> Result<(), ()> {
        let (src_elt, src_name) = self.element_mut(src).ok_or(())?;
        let src_elt = *src_elt;
        let (dest_elt, dest_name) = self.element_mut(dest).ok_or(())?;
        let dest_full = dest_elt.full;

        if !src_elt.full {
            debug!(src, "move source is empty");
            return Err(());
        }
        if dest_full {
            debug!(dest, "move destination is full");
            return Err(());
        }

        let src_file = dir.join(&src_name);
        let dest_file = dir.join(&dest_name);
        if dest_file.exists() {
            if let Err(e) = fs::remove_file(&dest_file) {
                warn!(err = %e, "failed to clear destination marker");
                return Err(());
            }
        }
        if src_file.exists() {
            if let Err(e) = fs::rename(&src_file, &dest_file) {
                warn!(err = %e, "failed to move marker");
                return Err(());
            }
        } else if let Err(e) = fs::File::create(&dest_file) {
            warn!(err = %e, "failed to create destination marker");
            return Err(());
        }
        // Stale position hints of moved volumes are meaningless.
        let _ = fs::remove_file(dir.join(format!("{src_name}.pos")));
        let _ = fs::remove_file(dir.join(format!("{dest_name}.pos")));

        let (dest_elt, _) = self.element_mut(dest).expect("validated above");
        *dest_elt = src_elt;
        dest_elt.source_element = src;
        let (src_elt, _) = self.element_mut(src).expect("validated above");
        src_elt.full = false;

        debug!(src, dest, "medium moved");
        Ok(())
    }
}

fn check_condition(sense_key: u8, asq: u16) -> CdbReply {
    let ext_sense = vec![
        0x72, // current errors
        sense_key & 0x0f,
        (asq >> 8) as u8,
        (asq & 0xff) as u8,
        0,
        0,
        0,
        0,
    ];
    CdbReply { status: STATUS_CHECK_CONDITION, dataout_len: 0, datain: Vec::new(), ext_sense }
}

fn invalid_cdb() -> CdbReply {
    check_condition(SENSE_KEY_ILLEGAL_REQUEST, ASQ_INVALID_FIELD_IN_CDB)
}

/// The ROBOT agent's device: a directory-backed media changer.
pub struct RobotSim {
    dir: Option<PathBuf>,
}

impl RobotSim {
    pub fn new() -> Self {
        Self { dir: None }
    }

    pub fn open(&mut self, path: &Path) -> Result<(), NdmpError> {
        if !path.is_dir() {
            return Err(NdmpError::NoDevice);
        }
        self.dir = Some(path.to_path_buf());
        Ok(())
    }

    pub fn close(&mut self) {
        self.dir = None;
    }

    pub fn is_open(&self) -> bool {
        self.dir.is_some()
    }

    pub fn reset(&self) -> Result<(), NdmpError> {
        if self.dir.is_some() { Ok(()) } else { Err(NdmpError::DevNotOpen) }
    }

    pub fn execute_cdb(&mut self, req: &CdbRequest) -> Result<CdbReply, NdmpError> {
        let dir = self.dir.clone().ok_or(NdmpError::DevNotOpen)?;
        if req.cdb.is_empty() {
            return Err(NdmpError::IllegalArgs);
        }
        let reply = match req.cdb[0] {
            CDB_TEST_UNIT_READY => Self::test_unit_ready(req),
            CDB_INQUIRY => Self::inquiry(req),
            CDB_MODE_SENSE_6 => Self::mode_sense_6(req),
            CDB_READ_ELEMENT_STATUS => Self::read_element_status(&dir, req),
            CDB_MOVE_MEDIUM => Self::move_medium(&dir, req),
            _ => return Err(NdmpError::IllegalArgs),
        };
        Ok(reply)
    }

    fn test_unit_ready(req: &CdbRequest) -> CdbReply {
        if req.cdb.len() != 6 {
            return invalid_cdb();
        }
        CdbReply::default()
    }

    fn inquiry(req: &CdbRequest) -> CdbReply {
        let cdb = &req.cdb;
        // Only standard page 0 is supported.
        if cdb.len() != 6
            || req.data_dir != ScsiDataDir::In
            || cdb[1] & 0x01 != 0
            || cdb[2] != 0
            || req.datain_len < 96
            || (u32::from(cdb[3]) << 8) + u32::from(cdb[4]) < 96
        {
            return invalid_cdb();
        }

        let mut datain = vec![0u8; 96];
        datain[0] = 0x08; // media changer
        datain[2] = 6; // SPC-4
        datain[3] = 2; // response data format
        datain[4] = 92; // remaining bytes
        datain[8..16].copy_from_slice(b"NDMJOB  ");
        datain[16..32].copy_from_slice(b"FakeRobot       ");
        datain[32..36].copy_from_slice(b"1.0 ");
        CdbReply { datain, ..CdbReply::default() }
    }

    fn mode_sense_6(req: &CdbRequest) -> CdbReply {
        let cdb = &req.cdb;
        if cdb.len() != 6 || req.data_dir != ScsiDataDir::In {
            return invalid_cdb();
        }
        let page = cdb[2] & 0x3f;
        let subpage = cdb[3];
        if (u16::from(page) << 8) + u16::from(subpage) != 0x1d00 {
            return invalid_cdb();
        }
        // Element Address Assignment.
        if req.datain_len < 20 || cdb[4] < 20 {
            return invalid_cdb();
        }

        let mut p = vec![0u8; 24];
        p[0] = 24; // mode data length
        p[4] = 0x1d; // page code
        p[5] = 18; // remaining bytes
        p[6..8].copy_from_slice(&MTE_FIRST.to_be_bytes());
        p[8..10].copy_from_slice(&MTE_COUNT.to_be_bytes());
        p[10..12].copy_from_slice(&STORAGE_FIRST.to_be_bytes());
        p[12..14].copy_from_slice(&STORAGE_COUNT.to_be_bytes());
        p[14..16].copy_from_slice(&IE_FIRST.to_be_bytes());
        p[16..18].copy_from_slice(&IE_COUNT.to_be_bytes());
        p[18..20].copy_from_slice(&DTE_FIRST.to_be_bytes());
        p[20..22].copy_from_slice(&DTE_COUNT.to_be_bytes());
        CdbReply { datain: p, ..CdbReply::default() }
    }

    fn read_element_status(dir: &Path, req: &CdbRequest) -> CdbReply {
        let cdb = &req.cdb;
        if cdb.len() != 12 || req.data_dir != ScsiDataDir::In {
            return invalid_cdb();
        }
        let min_addr = u16::from_be_bytes([cdb[2], cdb[3]]);
        let max_elts = u16::from_be_bytes([cdb[4], cdb[5]]);
        let response_len =
            (usize::from(cdb[7]) << 16) + (usize::from(cdb[8]) << 8) + usize::from(cdb[9]);
        if response_len < 8 {
            return invalid_cdb();
        }
        // Partial reports are not supported: one report covers the library.
        if min_addr > IE_FIRST || max_elts < NUM_ELEMENTS {
            return invalid_cdb();
        }

        let rs = RobotState::load(dir);
        rs.save(dir);

        struct Page<'a> {
            first: u16,
            have_voltags: bool,
            eltype: u8,
            empty_flags: u8,
            full_flags: u8,
            elements: &'a [ElementState],
        }
        let pages = [
            Page {
                first: IE_FIRST,
                have_voltags: true,
                eltype: 3,
                empty_flags: 0x38,
                full_flags: 0x39,
                elements: &rs.ie,
            },
            Page {
                first: MTE_FIRST,
                have_voltags: false,
                eltype: 1,
                empty_flags: 0x00,
                full_flags: 0x01,
                elements: &rs.mte,
            },
            Page {
                first: DTE_FIRST,
                have_voltags: true,
                eltype: 4,
                empty_flags: 0x08,
                full_flags: 0x81,
                elements: &rs.dte,
            },
            Page {
                first: STORAGE_FIRST,
                have_voltags: true,
                eltype: 2,
                empty_flags: 0x08,
                full_flags: 0x09,
                elements: &rs.storage,
            },
        ];

        let required_len: usize = 8
            + pages
                .iter()
                .map(|p| 8 + p.elements.len() * if p.have_voltags { 84 } else { 12 })
                .sum::<usize>();

        let mut out = Vec::with_capacity(required_len);
        // Element status data header.
        out.extend_from_slice(&IE_FIRST.to_be_bytes());
        out.extend_from_slice(&NUM_ELEMENTS.to_be_bytes());
        out.push(0);
        let remaining = required_len - 8;
        out.push((remaining >> 16) as u8);
        out.push((remaining >> 8) as u8);
        out.push(remaining as u8);

        // Only fill in the report body if the controller gave us room.
        if required_len <= response_len {
            for page in &pages {
                let descr_size: usize = if page.have_voltags { 84 } else { 12 };
                let total = descr_size * page.elements.len();
                out.push(page.eltype);
                out.push(if page.have_voltags { 0xc0 } else { 0 });
                out.push(0);
                out.push(descr_size as u8);
                out.push(0);
                out.push((total >> 16) as u8);
                out.push((total >> 8) as u8);
                out.push(total as u8);

                for (i, es) in page.elements.iter().enumerate() {
                    let addr = page.first + i as u16;
                    out.extend_from_slice(&addr.to_be_bytes());
                    out.push(if es.full { page.full_flags } else { page.empty_flags });
                    out.extend_from_slice(&[0; 6]);
                    let mut byte9 = es.medium_type;
                    if es.source_element != 0 {
                        byte9 |= 0x80; // SVALID
                    }
                    out.push(byte9);
                    out.extend_from_slice(&es.source_element.to_be_bytes());
                    if page.have_voltags {
                        let mut tags = [0u8; 72];
                        if es.full {
                            tags[..VOLTAG_LEN].copy_from_slice(&es.pvoltag);
                            tags[36..36 + VOLTAG_LEN].copy_from_slice(&es.avoltag);
                        } else {
                            tags[..VOLTAG_LEN].fill(b' ');
                            tags[36..36 + VOLTAG_LEN].fill(b' ');
                        }
                        out.extend_from_slice(&tags);
                    }
                }
            }
        }
        out.resize(response_len, 0);
        CdbReply { datain: out, ..CdbReply::default() }
    }

    fn move_medium(dir: &Path, req: &CdbRequest) -> CdbReply {
        let cdb = &req.cdb;
        if cdb.len() != 12 {
            return invalid_cdb();
        }
        let mte = u16::from_be_bytes([cdb[2], cdb[3]]);
        let src = u16::from_be_bytes([cdb[4], cdb[5]]);
        let dest = u16::from_be_bytes([cdb[6], cdb[7]]);

        if !(MTE_FIRST..MTE_FIRST + MTE_COUNT).contains(&mte) {
            return check_condition(SENSE_KEY_ILLEGAL_REQUEST, ASQ_INVALID_ELEMENT_ADDRESS);
        }

        let mut rs = RobotState::load(dir);
        if rs.move_medium(dir, src, dest).is_err() {
            return check_condition(SENSE_KEY_ILLEGAL_REQUEST, ASQ_INVALID_ELEMENT_ADDRESS);
        }
        rs.save(dir);
        CdbReply::default()
    }
}

impl Default for RobotSim {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cdb_in(cdb: Vec<u8>, datain_len: u32) -> CdbRequest {
        CdbRequest {
            cdb,
            data_dir: ScsiDataDir::In,
            timeout_ms: 0,
            datain_len,
            dataout: Vec::new(),
        }
    }

    fn read_element_status_cdb(response_len: usize) -> CdbRequest {
        let mut cdb = vec![0u8; 12];
        cdb[0] = CDB_READ_ELEMENT_STATUS;
        cdb[2..4].copy_from_slice(&0u16.to_be_bytes());
        cdb[4..6].copy_from_slice(&100u16.to_be_bytes());
        cdb[7] = (response_len >> 16) as u8;
        cdb[8] = (response_len >> 8) as u8;
        cdb[9] = response_len as u8;
        cdb_in(cdb, response_len as u32)
    }

    fn move_medium_cdb(mte: u16, src: u16, dest: u16) -> CdbRequest {
        let mut cdb = vec![0u8; 12];
        cdb[0] = CDB_MOVE_MEDIUM;
        cdb[2..4].copy_from_slice(&mte.to_be_bytes());
        cdb[4..6].copy_from_slice(&src.to_be_bytes());
        cdb[6..8].copy_from_slice(&dest.to_be_bytes());
        CdbRequest {
            cdb,
            data_dir: ScsiDataDir::None,
            timeout_ms: 0,
            datain_len: 0,
            dataout: Vec::new(),
        }
    }

    /// Locates the descriptor for `addr` in a READ ELEMENT STATUS report.
    fn find_descriptor(report: &[u8], addr: u16) -> Option<&[u8]> {
        let mut at = 8;
        while at + 8 <= report.len() {
            let descr_size = report[at + 3] as usize;
            let total = ((report[at + 5] as usize) << 16)
                + ((report[at + 6] as usize) << 8)
                + report[at + 7] as usize;
            if descr_size == 0 {
                return None;
            }
            at += 8;
            let mut off = at;
            while off + descr_size <= at + total {
                let got = u16::from_be_bytes([report[off], report[off + 1]]);
                if got == addr {
                    return Some(&report[off..off + descr_size]);
                }
                off += descr_size;
            }
            at += total;
        }
        None
    }

    fn open_robot(dir: &TempDir) -> RobotSim {
        let mut robot = RobotSim::new();
        robot.open(dir.path()).unwrap();
        robot
    }

    #[test]
    fn open_requires_directory() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("not-a-dir");
        fs::write(&file, b"x").unwrap();
        let mut robot = RobotSim::new();
        assert_eq!(robot.open(&file), Err(NdmpError::NoDevice));
        robot.open(dir.path()).unwrap();
    }

    #[test]
    fn test_unit_ready_reports_good() {
        let dir = TempDir::new().unwrap();
        let mut robot = open_robot(&dir);
        let reply = robot
            .execute_cdb(&cdb_in(vec![CDB_TEST_UNIT_READY, 0, 0, 0, 0, 0], 0))
            .unwrap();
        assert_eq!(reply.status, STATUS_GOOD);
    }

    #[test]
    fn short_cdb_yields_check_condition() {
        let dir = TempDir::new().unwrap();
        let mut robot = open_robot(&dir);
        let reply = robot.execute_cdb(&cdb_in(vec![CDB_TEST_UNIT_READY, 0], 0)).unwrap();
        assert_eq!(reply.status, STATUS_CHECK_CONDITION);
        assert_eq!(reply.ext_sense[1], SENSE_KEY_ILLEGAL_REQUEST);
        assert_eq!(
            u16::from_be_bytes([reply.ext_sense[2], reply.ext_sense[3]]),
            ASQ_INVALID_FIELD_IN_CDB
        );
    }

    #[test]
    fn inquiry_identifies_media_changer() {
        let dir = TempDir::new().unwrap();
        let mut robot = open_robot(&dir);
        let reply = robot
            .execute_cdb(&cdb_in(vec![CDB_INQUIRY, 0, 0, 0, 96, 0], 96))
            .unwrap();
        assert_eq!(reply.status, STATUS_GOOD);
        assert_eq!(reply.datain.len(), 96);
        assert_eq!(reply.datain[0], 0x08);
        assert_eq!(&reply.datain[8..16], b"NDMJOB  ");
    }

    #[test]
    fn mode_sense_reports_element_layout() {
        let dir = TempDir::new().unwrap();
        let mut robot = open_robot(&dir);
        let reply = robot
            .execute_cdb(&cdb_in(vec![CDB_MODE_SENSE_6, 0, 0x1d, 0, 24, 0], 24))
            .unwrap();
        assert_eq!(reply.status, STATUS_GOOD);
        let p = &reply.datain;
        assert_eq!(u16::from_be_bytes([p[6], p[7]]), MTE_FIRST);
        assert_eq!(u16::from_be_bytes([p[10], p[11]]), STORAGE_FIRST);
        assert_eq!(u16::from_be_bytes([p[12], p[13]]), STORAGE_COUNT);
        assert_eq!(u16::from_be_bytes([p[18], p[19]]), DTE_FIRST);
    }

    #[test]
    fn move_medium_updates_elements_and_markers() {
        let dir = TempDir::new().unwrap();
        let mut robot = open_robot(&dir);

        let reply = robot.execute_cdb(&move_medium_cdb(16, 1024, 128)).unwrap();
        assert_eq!(reply.status, STATUS_GOOD);
        assert!(dir.path().join("drive0").exists());

        let report = robot.execute_cdb(&read_element_status_cdb(4096)).unwrap();
        assert_eq!(report.status, STATUS_GOOD);

        let slot = find_descriptor(&report.datain, 1024).unwrap();
        assert_eq!(slot[2], 0x08, "slot should be empty");

        let dte = find_descriptor(&report.datain, 128).unwrap();
        assert_eq!(dte[2], 0x81, "drive should be full");
        assert_eq!(dte[9] & 0x80, 0x80, "SVALID set");
        assert_eq!(u16::from_be_bytes([dte[10], dte[11]]), 1024);
        assert_eq!(&dte[12..20], b"PTAG00XX");
    }

    #[test]
    fn move_to_full_destination_fails() {
        let dir = TempDir::new().unwrap();
        let mut robot = open_robot(&dir);
        let reply = robot.execute_cdb(&move_medium_cdb(16, 1024, 1025)).unwrap();
        assert_eq!(reply.status, STATUS_CHECK_CONDITION);
        assert_eq!(
            u16::from_be_bytes([reply.ext_sense[2], reply.ext_sense[3]]),
            ASQ_INVALID_ELEMENT_ADDRESS
        );
    }

    #[test]
    fn move_from_empty_source_fails() {
        let dir = TempDir::new().unwrap();
        let mut robot = open_robot(&dir);
        let reply = robot.execute_cdb(&move_medium_cdb(16, 128, 1024)).unwrap();
        assert_eq!(reply.status, STATUS_CHECK_CONDITION);
    }

    #[test]
    fn bad_transport_address_fails() {
        let dir = TempDir::new().unwrap();
        let mut robot = open_robot(&dir);
        let reply = robot.execute_cdb(&move_medium_cdb(17, 1024, 128)).unwrap();
        assert_eq!(reply.status, STATUS_CHECK_CONDITION);
    }

    #[test]
    fn state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut robot = open_robot(&dir);
            robot.execute_cdb(&move_medium_cdb(16, 1024, 128)).unwrap();
        }
        let mut robot = open_robot(&dir);
        let report = robot.execute_cdb(&read_element_status_cdb(4096)).unwrap();
        let dte = find_descriptor(&report.datain, 128).unwrap();
        assert_eq!(dte[2], 0x81);
    }

    #[test]
    fn closed_robot_rejects_cdbs() {
        let mut robot = RobotSim::new();
        let err = robot.execute_cdb(&cdb_in(vec![CDB_TEST_UNIT_READY, 0, 0, 0, 0, 0], 0));
        assert_eq!(err, Err(NdmpError::DevNotOpen));
    }
}
