//! SSTable footer layout and read/write helpers.
//!
//! ```text
//! [cf_id: u32 LE][flush_segment: u64 LE][flush_offset: u64 LE][index_offset: u64 LE][magic: u32 LE]
//! ```

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use model::{CfId, FlushMetadata, ReplayPosition};
use std::io::{self, Read, Result as IoResult, Seek, SeekFrom, Write};

/// Magic number identifying Undertow table files (ASCII "UST1").
pub const SSTABLE_MAGIC: u32 = 0x5553_5431;

/// Size of the footer in bytes: 4 + 8 + 8 + 8 + 4.
pub const FOOTER_BYTES: u64 = 4 + 8 + 8 + 8 + 4;

/// Parsed table footer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub cf_id: CfId,
    /// Commit log position this table covers.
    pub flush_position: ReplayPosition,
    pub index_offset: u64,
}

impl Footer {
    pub fn flush_metadata(&self) -> FlushMetadata {
        FlushMetadata {
            cf_id: self.cf_id,
            replay_position: self.flush_position,
        }
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> IoResult<()> {
        w.write_u32::<LittleEndian>(self.cf_id)?;
        w.write_u64::<LittleEndian>(self.flush_position.segment_id)?;
        w.write_u64::<LittleEndian>(self.flush_position.offset)?;
        w.write_u64::<LittleEndian>(self.index_offset)?;
        w.write_u32::<LittleEndian>(SSTABLE_MAGIC)?;
        Ok(())
    }

    /// Reads the footer from the last [`FOOTER_BYTES`] of `r`.
    pub fn read_from<R: Read + Seek>(r: &mut R) -> IoResult<Self> {
        let filesize = r.seek(SeekFrom::End(0))?;
        if filesize < FOOTER_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "file too small for SSTable footer",
            ));
        }

        r.seek(SeekFrom::End(-(FOOTER_BYTES as i64)))?;
        let cf_id = r.read_u32::<LittleEndian>()?;
        let segment_id = r.read_u64::<LittleEndian>()?;
        let offset = r.read_u64::<LittleEndian>()?;
        let index_offset = r.read_u64::<LittleEndian>()?;
        let magic = r.read_u32::<LittleEndian>()?;
        if magic != SSTABLE_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown SSTable magic: {:#x}", magic),
            ));
        }

        Ok(Self {
            cf_id,
            flush_position: ReplayPosition::new(segment_id, offset),
            index_offset,
        })
    }
}
