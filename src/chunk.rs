//! Reading of tagged, length-prefixed chunks.
//!
//! Standard Midi Files, RIFF containers and the MFi format all share the same basic layout: a
//! 4-byte identifier, a size and `size` bytes of payload.
//! They only differ in the width and endianness of the size field, and in whether payloads are
//! padded to an even length.
//!
//! There's also an abomination called RMID, MIDI embedded in a RIFF file.
//! Support for these files is provided by `unwrap_rmid`, which strips away the RIFF wrappers
//! around the raw SMF file.

use crate::prelude::*;

/// Width of the size field of a chunk.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub enum SizeWidth {
    U16,
    U32,
}

/// How chunk headers are laid out in a particular format.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub struct ChunkLayout {
    /// Whether the size field is big-endian.
    pub big_endian: bool,
    /// The width of the size field.
    pub width: SizeWidth,
    /// Whether odd-sized payloads are followed by a padding byte.
    pub padded: bool,
}
impl ChunkLayout {
    /// Standard Midi File chunks: big-endian 32-bit sizes, no padding.
    pub const SMF: ChunkLayout = ChunkLayout {
        big_endian: true,
        width: SizeWidth::U32,
        padded: false,
    };
    /// RIFF chunks: little-endian 32-bit sizes, padded to even lengths.
    pub const RIFF: ChunkLayout = ChunkLayout {
        big_endian: false,
        width: SizeWidth::U32,
        padded: true,
    };
    /// MFi data-information records: big-endian 16-bit sizes, no padding.
    pub const MFI_INFO: ChunkLayout = ChunkLayout {
        big_endian: true,
        width: SizeWidth::U16,
        padded: false,
    };

    fn header_len(&self) -> usize {
        match self.width {
            SizeWidth::U16 => 4 + 2,
            SizeWidth::U32 => 4 + 4,
        }
    }

    fn read_size(&self, raw: &[u8]) -> u32 {
        match (self.width, self.big_endian) {
            (SizeWidth::U16, true) => u32::from(u16::from_be_bytes([raw[0], raw[1]])),
            (SizeWidth::U16, false) => u32::from(u16::from_le_bytes([raw[0], raw[1]])),
            (SizeWidth::U32, true) => u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]),
            (SizeWidth::U32, false) => u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
        }
    }
}

/// A single chunk: its identifier, its declared size and where its payload starts.
///
/// Chunks never copy their payload, use `ChunkReader::data` to get at it.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub struct Chunk {
    /// The 4-byte identifier, such as `MThd` or `trac`.
    pub id: [u8; 4],
    /// The size as declared in the file.
    pub size: u32,
    /// Offset of the first payload byte, relative to the start of the scanned buffer.
    pub offset: usize,
}
impl Chunk {
    /// The payload length that is actually available in a buffer of `len` bytes.
    fn available(&self, len: usize) -> usize {
        (self.size as usize).min(len.saturating_sub(self.offset))
    }
}

/// Scans a buffer for consecutive chunks.
#[derive(Clone, Debug)]
pub struct ChunkReader<'a> {
    raw: &'a [u8],
    layout: ChunkLayout,
    cursor: usize,
    chunks: Vec<Chunk>,
}
impl<'a> ChunkReader<'a> {
    /// Create a reader over `raw`, without reading anything yet.
    pub fn new(raw: &'a [u8], layout: ChunkLayout) -> ChunkReader<'a> {
        ChunkReader {
            raw,
            layout,
            cursor: 0,
            chunks: Vec::new(),
        }
    }

    /// Scan chunks from where the last scan stopped until the end of the buffer, or until
    /// `limit` chunks have been read in total.
    ///
    /// Returns the total amount of chunks read so far.
    pub fn parse(&mut self, limit: Option<usize>) -> Result<usize> {
        let header_len = self.layout.header_len();
        while limit.map_or(true, |limit| self.chunks.len() < limit) {
            let rest = &self.raw[self.cursor..];
            if rest.len() < header_len {
                if !rest.is_empty() {
                    if cfg!(feature = "strict") {
                        bail!(err_malformed!("trailing bytes after last chunk"));
                    }
                    log::warn!("ignoring {} trailing bytes after last chunk", rest.len());
                }
                break;
            }
            let mut id = [0; 4];
            id.copy_from_slice(&rest[..4]);
            let size = self.layout.read_size(&rest[4..header_len]);
            let chunk = Chunk {
                id,
                size,
                offset: self.cursor + header_len,
            };
            let available = chunk.available(self.raw.len());
            if available < size as usize {
                if cfg!(feature = "strict") {
                    bail!(err_malformed!("reached eof before chunk ended"));
                }
                log::warn!(
                    "chunk {:?} declares {} bytes but only {} remain",
                    latin_id(&id),
                    size,
                    available
                );
            }
            let mut next = chunk.offset + available;
            if self.layout.padded && size % 2 == 1 {
                next = (next + 1).min(self.raw.len());
            }
            self.cursor = next;
            self.chunks.push(chunk);
        }
        Ok(self.chunks.len())
    }

    /// Get the `index`-th chunk read so far.
    pub fn get(&self, index: usize) -> Result<&Chunk> {
        Ok(self
            .chunks
            .get(index)
            .ok_or(err_invalid!("chunk not found"))?)
    }

    /// All chunks read so far.
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks[..]
    }

    /// The payload of a chunk read by this reader.
    ///
    /// If the chunk extends past the end of the buffer, the payload is truncated.
    pub fn data(&self, chunk: &Chunk) -> &'a [u8] {
        let raw = self.raw;
        let start = chunk.offset.min(raw.len());
        &raw[start..start + chunk.available(raw.len())]
    }

    /// Offset of the first byte that was not scanned yet.
    pub fn position(&self) -> usize {
        self.cursor
    }
}

fn latin_id(id: &[u8; 4]) -> String {
    crate::primitive::latin1(&id[..])
}

/// If `raw` is an RMID file, get the Standard Midi File embedded within.
pub fn unwrap_rmid(raw: &[u8]) -> Result<&[u8]> {
    let mut outer = ChunkReader::new(raw, ChunkLayout::RIFF);
    outer.parse(Some(1))?;
    let main = *outer.get(0).context(err_invalid!("no main riff chunk"))?;
    ensure!(&main.id == b"RIFF", err_invalid!("invalid main riff chunk"));
    let mut riff = outer.data(&main);
    let formtype = riff
        .split_checked(4)
        .ok_or(err_invalid!("failed to read riff formtype"))?;
    ensure!(formtype == b"RMID", err_invalid!("not an rmid riff file"));
    let mut inner = ChunkReader::new(riff, ChunkLayout::RIFF);
    inner.parse(None)?;
    for chunk in inner.chunks() {
        if &chunk.id == b"data" {
            return Ok(inner.data(chunk));
        }
    }
    bail!(err_invalid!("no rmid data chunk"))
}
