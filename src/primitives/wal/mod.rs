#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::primitives::io::{is_unexpected_eof, FileIo};
use crate::types::checksum::crc32_chunks;
use crate::types::{Checksum, Crc32Fast, Lsn, PendelError, Result};

const WAL_MAGIC: [u8; 4] = *b"PDLW";
const WAL_FORMAT_VERSION: u16 = 1;
const FILE_HEADER_LEN: usize = 32;
const FRAME_HEADER_LEN: usize = 32;
/// Upper bound on a single record payload.
pub const MAX_RECORD_LEN: usize = 64 << 20;

/// Type tag carried by every log record.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// Snapshot of the pending-delete registry.
    PendingDelete,
    /// Top-level transaction commit with its sub-transactions.
    XactCommit,
    /// Top-level transaction abort with its sub-transactions.
    XactAbort,
    /// Checkpoint marker.
    Checkpoint,
}

impl RecordKind {
    fn to_byte(self) -> u8 {
        match self {
            RecordKind::PendingDelete => 1,
            RecordKind::XactCommit => 2,
            RecordKind::XactAbort => 3,
            RecordKind::Checkpoint => 4,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(RecordKind::PendingDelete),
            2 => Some(RecordKind::XactCommit),
            3 => Some(RecordKind::XactAbort),
            4 => Some(RecordKind::Checkpoint),
            _ => None,
        }
    }

    /// Short lowercase name used in tool output.
    pub fn name(self) -> &'static str {
        match self {
            RecordKind::PendingDelete => "pending_delete",
            RecordKind::XactCommit => "xact_commit",
            RecordKind::XactAbort => "xact_abort",
            RecordKind::Checkpoint => "checkpoint",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Ordered durable log that records can be appended to.
pub trait RecordLog: Send + Sync {
    /// Appends one record and returns the position assigned to it.
    fn insert(&self, kind: RecordKind, payload: &[u8]) -> Result<Lsn>;
    /// Makes every record up to and including `upto` durable.
    fn flush(&self, upto: Lsn) -> Result<()>;
}

/// Configuration options for opening a record log.
#[derive(Clone, Debug, Default)]
pub struct WalOptions {
    /// Salt distinguishing logs of different clusters.
    pub wal_salt: u64,
    /// Position assigned to the first record of a fresh log.
    pub start_lsn: Lsn,
}

impl WalOptions {
    /// Creates options with the given salt and starting position.
    pub fn new(wal_salt: u64, start_lsn: Lsn) -> Self {
        Self {
            wal_salt,
            start_lsn,
        }
    }
}

/// Counters for log activity since open.
#[derive(Clone, Debug, Default, serde::Serialize)]
pub struct WalStats {
    /// Records appended.
    pub records_appended: u64,
    /// Bytes appended including frame headers.
    pub bytes_appended: u64,
    /// Sync calls that reached the file.
    pub syncs: u64,
    /// Bytes of torn tail discarded when the log was opened.
    pub truncated_tail_bytes: u64,
}

#[derive(Clone, Debug)]
struct FileHeader {
    wal_salt: u64,
    start_lsn: Lsn,
}

impl FileHeader {
    fn encode(&self) -> [u8; FILE_HEADER_LEN] {
        let mut buf = [0u8; FILE_HEADER_LEN];
        buf[0..4].copy_from_slice(&WAL_MAGIC);
        buf[4..6].copy_from_slice(&WAL_FORMAT_VERSION.to_be_bytes());
        buf[12..20].copy_from_slice(&self.wal_salt.to_be_bytes());
        buf[20..28].copy_from_slice(&self.start_lsn.0.to_be_bytes());
        let crc = crc32_chunks(&[&buf]);
        buf[28..32].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < FILE_HEADER_LEN {
            return Err(PendelError::Corruption("wal header truncated"));
        }
        let mut header = [0u8; FILE_HEADER_LEN];
        header.copy_from_slice(&src[..FILE_HEADER_LEN]);
        if header[0..4] != WAL_MAGIC {
            return Err(PendelError::Corruption("wal magic mismatch"));
        }
        let version = u16::from_be_bytes(header[4..6].try_into().unwrap());
        if version != WAL_FORMAT_VERSION {
            return Err(PendelError::Corruption("wal format version mismatch"));
        }
        if header[6..12].iter().any(|b| *b != 0) {
            return Err(PendelError::Corruption(
                "wal reserved header bytes non-zero",
            ));
        }
        let stored_crc = u32::from_be_bytes(header[28..32].try_into().unwrap());
        header[28..32].fill(0);
        if crc32_chunks(&[&header]) != stored_crc {
            return Err(PendelError::Corruption("wal header crc mismatch"));
        }
        Ok(Self {
            wal_salt: u64::from_be_bytes(header[12..20].try_into().unwrap()),
            start_lsn: Lsn(u64::from_be_bytes(header[20..28].try_into().unwrap())),
        })
    }
}

#[derive(Clone, Debug)]
struct FrameHeader {
    lsn: Lsn,
    kind: u8,
    payload_len: u32,
    prev_chain: u64,
    payload_crc32: u32,
}

impl FrameHeader {
    fn encode(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut buf = [0u8; FRAME_HEADER_LEN];
        buf[0..8].copy_from_slice(&self.lsn.0.to_be_bytes());
        buf[8] = self.kind;
        buf[12..16].copy_from_slice(&self.payload_len.to_be_bytes());
        buf[16..24].copy_from_slice(&self.prev_chain.to_be_bytes());
        buf[24..28].copy_from_slice(&self.payload_crc32.to_be_bytes());
        let crc = crc32_chunks(&[&buf]);
        buf[28..32].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    fn decode(src: &[u8; FRAME_HEADER_LEN]) -> Result<Self> {
        let mut header = *src;
        let stored_crc = u32::from_be_bytes(header[28..32].try_into().unwrap());
        header[28..32].fill(0);
        if crc32_chunks(&[&header]) != stored_crc {
            return Err(PendelError::Corruption("wal frame header crc mismatch"));
        }
        if header[9..12].iter().any(|b| *b != 0) {
            return Err(PendelError::Corruption("wal frame reserved bytes non-zero"));
        }
        Ok(Self {
            lsn: Lsn(u64::from_be_bytes(header[0..8].try_into().unwrap())),
            kind: header[8],
            payload_len: u32::from_be_bytes(header[12..16].try_into().unwrap()),
            prev_chain: u64::from_be_bytes(header[16..24].try_into().unwrap()),
            payload_crc32: u32::from_be_bytes(header[24..28].try_into().unwrap()),
        })
    }
}

fn next_chain(prev_chain: u64, encoded_header: &[u8], payload: &[u8]) -> u64 {
    let mut hasher = Crc32Fast::default();
    hasher.update(&prev_chain.to_be_bytes());
    hasher.update(encoded_header);
    hasher.update(payload);
    let frame_size = (FRAME_HEADER_LEN + payload.len()) as u64;
    (frame_size << 32) | u64::from(hasher.finalize())
}

struct WalState {
    header: FileHeader,
    append_offset: u64,
    prev_chain: u64,
    next_lsn: Lsn,
    flushed_lsn: Option<Lsn>,
    stats: WalStats,
}

/// File-backed record log.
///
/// Records are framed with a checksummed header and chained to their
/// predecessor so that a torn or overwritten tail is detected on replay.
pub struct Wal {
    io: Arc<dyn FileIo>,
    state: Mutex<WalState>,
}

impl Wal {
    /// Opens or creates a record log.
    ///
    /// An existing log is scanned to find its valid end; any torn tail past
    /// the last intact record is truncated away before new appends.
    pub fn open(io: Arc<dyn FileIo>, options: WalOptions) -> Result<Self> {
        let len = io.len()?;
        let (header, fresh) = if len < FILE_HEADER_LEN as u64 {
            let header = FileHeader {
                wal_salt: options.wal_salt,
                start_lsn: options.start_lsn,
            };
            io.write_at(0, &header.encode())?;
            io.truncate(FILE_HEADER_LEN as u64)?;
            (header, true)
        } else {
            let mut buf = [0u8; FILE_HEADER_LEN];
            io.read_at(0, &mut buf)?;
            let header = FileHeader::decode(&buf)?;
            if header.wal_salt != options.wal_salt {
                return Err(PendelError::Corruption("wal salt mismatch"));
            }
            (header, false)
        };

        let mut state = WalState {
            header: header.clone(),
            append_offset: FILE_HEADER_LEN as u64,
            prev_chain: 0,
            next_lsn: header.start_lsn,
            flushed_lsn: None,
            stats: WalStats::default(),
        };
        if !fresh {
            let mut iter = WalIterator::new(Arc::clone(&io), header)?;
            let mut last = None;
            while let Some(record) = iter.next_record()? {
                last = Some(record.lsn);
            }
            state.append_offset = iter.valid_up_to();
            state.prev_chain = iter.prev_chain;
            if let Some(lsn) = last {
                state.next_lsn = Lsn(lsn.0 + 1);
                state.flushed_lsn = Some(lsn);
            }
            let end = io.len()?;
            if end > state.append_offset {
                let torn = end - state.append_offset;
                warn!(
                    torn_bytes = torn,
                    valid_up_to = state.append_offset,
                    "wal.open.truncate_tail"
                );
                io.truncate(state.append_offset)?;
                state.stats.truncated_tail_bytes = torn;
            }
        }
        debug!(
            next_lsn = state.next_lsn.0,
            offset = state.append_offset,
            fresh,
            "wal.open"
        );
        Ok(Self {
            io,
            state: Mutex::new(state),
        })
    }

    /// Appends one record without syncing it.
    pub fn append(&self, kind: RecordKind, payload: &[u8]) -> Result<Lsn> {
        if payload.len() > MAX_RECORD_LEN {
            return Err(PendelError::Invalid("wal record payload too large"));
        }
        let mut state = self.state.lock();
        let lsn = state.next_lsn;
        let header = FrameHeader {
            lsn,
            kind: kind.to_byte(),
            payload_len: payload.len() as u32,
            prev_chain: state.prev_chain,
            payload_crc32: crc32_chunks(&[payload]),
        };
        let encoded = header.encode();
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.extend_from_slice(&encoded);
        frame.extend_from_slice(payload);
        self.io.write_at(state.append_offset, &frame)?;

        state.prev_chain = next_chain(state.prev_chain, &encoded, payload);
        state.append_offset += frame.len() as u64;
        state.next_lsn = Lsn(lsn.0 + 1);
        state.stats.records_appended += 1;
        state.stats.bytes_appended += frame.len() as u64;
        debug!(lsn = lsn.0, %kind, len = payload.len(), "wal.append");
        Ok(lsn)
    }

    /// Syncs all appended records to stable storage.
    ///
    /// Only records appended before the sync starts are marked durable.
    pub fn sync(&self) -> Result<()> {
        let target = self.state.lock().next_lsn;
        self.io.sync_all()?;
        let mut state = self.state.lock();
        state.stats.syncs += 1;
        if target.0 > state.header.start_lsn.0 {
            let covered = Lsn(target.0 - 1);
            state.flushed_lsn = Some(
                state
                    .flushed_lsn
                    .map_or(covered, |done| done.max(covered)),
            );
        }
        Ok(())
    }

    /// Highest position known to be durable.
    pub fn flushed_lsn(&self) -> Option<Lsn> {
        self.state.lock().flushed_lsn
    }

    /// Position the next appended record will receive.
    pub fn next_lsn(&self) -> Lsn {
        self.state.lock().next_lsn
    }

    /// Creates an iterator over the records currently in the file.
    pub fn iter(&self) -> Result<WalIterator> {
        let header = self.state.lock().header.clone();
        WalIterator::new(Arc::clone(&self.io), header)
    }

    /// Returns current statistics for this log.
    pub fn stats(&self) -> WalStats {
        self.state.lock().stats.clone()
    }

    /// Returns the total size of the log file in bytes.
    pub fn len(&self) -> Result<u64> {
        self.io.len()
    }

    /// Returns true if the log holds no records.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? <= FILE_HEADER_LEN as u64)
    }
}

impl RecordLog for Wal {
    fn insert(&self, kind: RecordKind, payload: &[u8]) -> Result<Lsn> {
        self.append(kind, payload)
    }

    fn flush(&self, upto: Lsn) -> Result<()> {
        if matches!(self.flushed_lsn(), Some(done) if done >= upto) {
            return Ok(());
        }
        self.sync()
    }
}

impl fmt::Debug for Wal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Wal")
            .field("next_lsn", &state.next_lsn)
            .field("append_offset", &state.append_offset)
            .field("stats", &state.stats)
            .finish()
    }
}

/// A record read back from the log.
#[derive(Clone, PartialEq, Eq)]
pub struct WalRecord {
    /// Position of the record.
    pub lsn: Lsn,
    /// Record type tag.
    pub kind: RecordKind,
    /// Record body.
    pub payload: Vec<u8>,
}

impl fmt::Debug for WalRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalRecord")
            .field("lsn", &self.lsn)
            .field("kind", &self.kind)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Forward reader over the records of a log.
pub struct WalIterator {
    io: Arc<dyn FileIo>,
    offset: u64,
    end: u64,
    prev_chain: u64,
    valid_up_to: u64,
    header: FileHeader,
}

impl WalIterator {
    fn new(io: Arc<dyn FileIo>, header: FileHeader) -> Result<Self> {
        let end = io.len()?;
        if end < FILE_HEADER_LEN as u64 {
            return Err(PendelError::Corruption("wal truncated header"));
        }
        Ok(Self {
            io,
            offset: FILE_HEADER_LEN as u64,
            end,
            prev_chain: 0,
            valid_up_to: FILE_HEADER_LEN as u64,
            header,
        })
    }

    /// Opens a log file read-only for inspection, validating its header.
    pub fn open(io: Arc<dyn FileIo>) -> Result<Self> {
        if io.len()? < FILE_HEADER_LEN as u64 {
            return Err(PendelError::Corruption("wal truncated header"));
        }
        let mut buf = [0u8; FILE_HEADER_LEN];
        io.read_at(0, &mut buf)?;
        let header = FileHeader::decode(&buf)?;
        Self::new(io, header)
    }

    /// Salt stored in the log header.
    pub fn wal_salt(&self) -> u64 {
        self.header.wal_salt
    }

    /// Starting position stored in the log header.
    pub fn start_lsn(&self) -> Lsn {
        self.header.start_lsn
    }

    fn stop(&mut self) -> Result<Option<WalRecord>> {
        self.offset = self.end;
        Ok(None)
    }

    /// Reads the next record.
    ///
    /// Returns `None` at the end of the log or at the first torn or corrupt
    /// frame. A frame whose checksums pass but whose kind is unknown is an
    /// error.
    pub fn next_record(&mut self) -> Result<Option<WalRecord>> {
        if self.offset + FRAME_HEADER_LEN as u64 > self.end {
            return self.stop();
        }
        let mut header_buf = [0u8; FRAME_HEADER_LEN];
        match self.io.read_at(self.offset, &mut header_buf) {
            Ok(()) => {}
            Err(err) if is_unexpected_eof(&err) => return self.stop(),
            Err(err) => return Err(err),
        }
        let header = match FrameHeader::decode(&header_buf) {
            Ok(header) => header,
            Err(_) => return self.stop(),
        };
        if header.prev_chain != self.prev_chain {
            return self.stop();
        }
        if header.lsn.0 < self.header.start_lsn.0 {
            return Err(PendelError::Corruption("wal record lsn below start_lsn"));
        }
        let len = header.payload_len as usize;
        let payload_off = self.offset + FRAME_HEADER_LEN as u64;
        if len > MAX_RECORD_LEN || payload_off + len as u64 > self.end {
            return self.stop();
        }
        let mut payload = vec![0u8; len];
        match self.io.read_at(payload_off, &mut payload) {
            Ok(()) => {}
            Err(err) if is_unexpected_eof(&err) => return self.stop(),
            Err(err) => return Err(err),
        }
        if crc32_chunks(&[&payload]) != header.payload_crc32 {
            return self.stop();
        }
        let kind = RecordKind::from_byte(header.kind)
            .ok_or(PendelError::Corruption("wal record kind unknown"))?;
        self.prev_chain = next_chain(self.prev_chain, &header_buf, &payload);
        self.offset = payload_off + len as u64;
        self.valid_up_to = self.offset;
        Ok(Some(WalRecord {
            lsn: header.lsn,
            kind,
            payload,
        }))
    }

    /// Returns the file offset up to which records have been validated.
    pub fn valid_up_to(&self) -> u64 {
        self.valid_up_to
    }
}

impl Iterator for WalIterator {
    type Item = Result<WalRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}
