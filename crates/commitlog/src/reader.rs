//! Sequential segment reader used by recovery.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use model::{Mutation, ReplayPosition};
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

use crate::CommitLogError;

/// Magic number at the start of every segment file (ASCII "UCL1").
pub const SEGMENT_MAGIC: u32 = 0x5543_4C31;
/// Current segment format version.
pub const SEGMENT_VERSION: u16 = 1;
/// Segment header: `[magic: u32][version: u16][segment_id: u64]`.
pub const HEADER_LEN: u64 = 4 + 2 + 8;
/// Frame header: `[record_len: u32][crc32: u32]`.
pub const FRAME_HEADER_LEN: u64 = 4 + 4;

/// Frames above this size are treated as corruption rather than allocated.
const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

pub(crate) fn write_header<W: Write>(w: &mut W, segment_id: u64) -> io::Result<()> {
    w.write_u32::<LittleEndian>(SEGMENT_MAGIC)?;
    w.write_u16::<LittleEndian>(SEGMENT_VERSION)?;
    w.write_u64::<LittleEndian>(segment_id)?;
    Ok(())
}

/// Wraps an encoded mutation in a `[record_len][crc32][body]` frame.
///
/// `record_len` includes the 4-byte CRC but not itself.
pub(crate) fn encode_frame(body: &[u8], out: &mut Vec<u8>) -> Result<(), CommitLogError> {
    let record_len = (body.len() as u64) + 4;
    if record_len > MAX_FRAME_SIZE as u64 {
        return Err(CommitLogError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "commit log entry too large",
        )));
    }

    let mut hasher = Crc32::new();
    hasher.update(body);

    out.clear();
    out.reserve(FRAME_HEADER_LEN as usize + body.len());
    out.write_u32::<LittleEndian>(record_len as u32)?;
    out.write_u32::<LittleEndian>(hasher.finalize())?;
    out.extend_from_slice(body);
    Ok(())
}

/// Reads until `buf` is full or EOF, returning the number of bytes read.
fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Yields `(position, mutation)` pairs from one segment in append order.
///
/// The reader is generic over any `Read` implementor so tests can feed it
/// in-memory buffers. Every frame's CRC32 is verified.
///
/// # Termination
///
/// - **Clean EOF** -> iteration ends.
/// - **Torn tail** (partial header or frame, e.g. crash mid-write) ->
///   iteration ends and [`torn_tail`](SegmentReader::torn_tail) reports it.
/// - **Bad length, CRC mismatch, undecodable body** -> yields
///   `Err(CommitLogError::Corrupt)` once, then ends.
/// - **I/O error** -> yields `Err(CommitLogError::Io)` once, then ends.
pub struct SegmentReader<R: Read> {
    rdr: BufReader<R>,
    segment_id: u64,
    /// End offset of the last frame returned.
    offset: u64,
    body: Vec<u8>,
    done: bool,
    torn_tail: bool,
}

impl SegmentReader<File> {
    /// Opens a segment file for a fresh pass from its first entry.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, CommitLogError> {
        let f = File::open(path)?;
        Self::from_reader(f)
    }
}

impl<R: Read> SegmentReader<R> {
    /// Reads and validates the segment header.
    pub fn from_reader(reader: R) -> Result<Self, CommitLogError> {
        let mut rdr = BufReader::new(reader);
        let mut header = [0u8; HEADER_LEN as usize];
        let n = read_full(&mut rdr, &mut header)?;

        let mut this = Self {
            rdr,
            segment_id: 0,
            offset: HEADER_LEN,
            body: Vec::with_capacity(256),
            done: false,
            torn_tail: false,
        };

        if n < header.len() {
            // crashed before the header was complete: nothing to replay
            this.done = true;
            this.torn_tail = n > 0;
            return Ok(this);
        }

        let mut h = &header[..];
        let magic = h.read_u32::<LittleEndian>()?;
        let version = h.read_u16::<LittleEndian>()?;
        let segment_id = h.read_u64::<LittleEndian>()?;
        if magic != SEGMENT_MAGIC {
            return Err(CommitLogError::Corrupt {
                segment_id: 0,
                offset: 0,
                reason: format!("bad segment magic {:#010x}", magic),
            });
        }
        if version != SEGMENT_VERSION {
            return Err(CommitLogError::Corrupt {
                segment_id,
                offset: 4,
                reason: format!("unsupported segment version {}", version),
            });
        }
        this.segment_id = segment_id;
        Ok(this)
    }

    /// Segment id from the header (0 if the header was torn).
    #[must_use]
    pub fn segment_id(&self) -> u64 {
        self.segment_id
    }

    /// Returns `true` if iteration stopped at a partially written frame.
    #[must_use]
    pub fn torn_tail(&self) -> bool {
        self.torn_tail
    }

    /// End offset of the last entry returned (the header length before any).
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn corrupt(&mut self, reason: String) -> CommitLogError {
        self.done = true;
        CommitLogError::Corrupt {
            segment_id: self.segment_id,
            offset: self.offset,
            reason,
        }
    }

    fn next_entry(&mut self) -> Result<Option<(ReplayPosition, Mutation)>, CommitLogError> {
        if self.done {
            return Ok(None);
        }

        let mut head = [0u8; FRAME_HEADER_LEN as usize];
        let n = read_full(&mut self.rdr, &mut head)?;
        if n == 0 {
            self.done = true;
            return Ok(None);
        }
        if n < head.len() {
            self.done = true;
            self.torn_tail = true;
            return Ok(None);
        }

        let mut h = &head[..];
        let record_len = h.read_u32::<LittleEndian>()?;
        let crc = h.read_u32::<LittleEndian>()?;
        if record_len <= 4 || record_len > MAX_FRAME_SIZE {
            return Err(self.corrupt(format!("invalid record length {}", record_len)));
        }

        let body_len = (record_len - 4) as usize;
        self.body.clear();
        self.body.resize(body_len, 0);
        if read_full(&mut self.rdr, &mut self.body)? < body_len {
            self.done = true;
            self.torn_tail = true;
            return Ok(None);
        }

        let mut hasher = Crc32::new();
        hasher.update(&self.body);
        let actual = hasher.finalize();
        if actual != crc {
            return Err(self.corrupt(format!(
                "crc mismatch: expected {:#010x}, got {:#010x}",
                crc, actual
            )));
        }

        let mutation = match Mutation::decode(&self.body) {
            Ok(m) => m,
            Err(e) => return Err(self.corrupt(e.to_string())),
        };

        self.offset += FRAME_HEADER_LEN + body_len as u64;
        Ok(Some((ReplayPosition::new(self.segment_id, self.offset), mutation)))
    }
}

impl<R: Read> Iterator for SegmentReader<R> {
    type Item = Result<(ReplayPosition, Mutation), CommitLogError>;

    fn next(&mut self) -> Option<Self::Item> {
        let res = self.next_entry();
        if res.is_err() {
            self.done = true;
        }
        res.transpose()
    }
}
