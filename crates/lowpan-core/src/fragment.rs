//! Fragmentation engine. Splits a datagram into fixed-size, checksummed
//! chunks for the mesh link and puts them back together.
//!
//! Pure data transform: no I/O, no shared state. Every function here is safe
//! to call from any thread.

use bytes::{Bytes, BytesMut};
use zerocopy::byteorder::U16;
use zerocopy::{AsBytes, FromBytes};

use crate::wire::{ChunkHeader, WireError, CHUNK_HEADER_LEN};

/// One fragment of a larger buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Position within the original buffer, 0-based.
    pub sequence: u16,
    /// Fragmentation operation this chunk belongs to.
    pub ordering: u16,
    /// Number of chunks the operation produced.
    pub parts: u16,
    /// Internet checksum of `payload`, computed at split time.
    pub checksum: u16,
    pub payload: Bytes,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Recompute the payload checksum and compare it with the stored one.
    pub fn verify(&self) -> bool {
        checksum(&self.payload) == self.checksum
    }

    /// Serialize as header followed by payload.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let length = u16::try_from(self.payload.len()).map_err(|_| WireError::Oversized {
            field: "chunk payload",
            len: self.payload.len(),
        })?;
        let header = ChunkHeader {
            sequence: U16::new(self.sequence),
            ordering: U16::new(self.ordering),
            parts: U16::new(self.parts),
            checksum: U16::new(self.checksum),
            length: U16::new(length),
        };

        let mut out = Vec::with_capacity(CHUNK_HEADER_LEN + self.payload.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Parse one chunk from the start of `buf`. Bytes past the declared
    /// payload length are ignored.
    ///
    /// The checksum is carried through unverified; `rebuild` checks it.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let header = ChunkHeader::read_from_prefix(buf).ok_or(WireError::Truncated {
            needed: CHUNK_HEADER_LEN,
            got: buf.len(),
        })?;

        let length = header.length.get() as usize;
        let end = CHUNK_HEADER_LEN + length;
        if buf.len() < end {
            return Err(WireError::Truncated {
                needed: end,
                got: buf.len(),
            });
        }

        Ok(Self {
            sequence: header.sequence.get(),
            ordering: header.ordering.get(),
            parts: header.parts.get(),
            checksum: header.checksum.get(),
            payload: Bytes::copy_from_slice(&buf[CHUNK_HEADER_LEN..end]),
        })
    }
}

/// Errors raised by splitting or rebuilding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FragmentError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("chunk {sequence} of operation {ordering} failed its checksum")]
    CorruptChunk { ordering: u16, sequence: u16 },

    #[error("operation {ordering} is missing chunk {missing}")]
    IncompleteSequence { ordering: u16, missing: u16 },
}

/// 16-bit one's-complement sum over `data`, as used by IP, UDP and ICMPv6.
///
/// Words are read big-endian; an odd trailing byte is padded with zero.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    let mut words = data.chunks_exact(2);
    for word in &mut words {
        sum += u16::from_be_bytes([word[0], word[1]]) as u32;
        // Fold early so very large inputs cannot overflow.
        if sum > 0xffff {
            sum = (sum & 0xffff) + (sum >> 16);
        }
    }
    if let [last] = words.remainder() {
        sum += (*last as u32) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Split `buffer` into `ceil(len / chunk_size)` chunks tagged with `ordering`.
///
/// Every chunk but the last carries exactly `chunk_size` bytes; the last
/// carries the remainder.
pub fn split(buffer: &[u8], chunk_size: usize, ordering: u16) -> Result<Vec<Chunk>, FragmentError> {
    if chunk_size == 0 {
        return Err(FragmentError::InvalidArgument("chunk size must be positive"));
    }
    if chunk_size > u16::MAX as usize {
        return Err(FragmentError::InvalidArgument("chunk size exceeds the length field"));
    }
    if buffer.is_empty() {
        return Err(FragmentError::InvalidArgument("buffer must not be empty"));
    }

    let count = buffer.len().div_ceil(chunk_size);
    let parts = u16::try_from(count)
        .map_err(|_| FragmentError::InvalidArgument("buffer needs more than 65535 chunks"))?;

    let chunks = buffer
        .chunks(chunk_size)
        .enumerate()
        .map(|(i, piece)| Chunk {
            sequence: i as u16,
            ordering,
            parts,
            checksum: checksum(piece),
            payload: Bytes::copy_from_slice(piece),
        })
        .collect();

    Ok(chunks)
}

/// Reassemble the chunks of one operation into the original buffer.
///
/// Input order does not matter. Every chunk is verified first; a checksum
/// mismatch fails with the sequence number of the lowest corrupt chunk. A
/// repeated sequence number keeps the first copy.
pub fn rebuild(chunks: &[Chunk]) -> Result<Bytes, FragmentError> {
    let first = chunks
        .first()
        .ok_or(FragmentError::InvalidArgument("no chunks to rebuild"))?;
    let ordering = first.ordering;
    let parts = first.parts;

    if parts == 0 {
        return Err(FragmentError::InvalidArgument("chunk declares zero parts"));
    }
    if chunks.iter().any(|c| c.ordering != ordering) {
        return Err(FragmentError::InvalidArgument("chunks span several operations"));
    }
    if chunks.iter().any(|c| c.parts != parts) {
        return Err(FragmentError::InvalidArgument("chunks disagree on the part count"));
    }

    let mut slots: Vec<Option<&Chunk>> = vec![None; parts as usize];
    for chunk in chunks {
        let slot = slots
            .get_mut(chunk.sequence as usize)
            .ok_or(FragmentError::InvalidArgument("sequence number beyond part count"))?;
        if slot.is_none() {
            *slot = Some(chunk);
        }
    }

    if let Some(corrupt) = slots.iter().flatten().find(|c| !c.verify()) {
        return Err(FragmentError::CorruptChunk {
            ordering,
            sequence: corrupt.sequence,
        });
    }

    let mut total = 0;
    for (i, slot) in slots.iter().enumerate() {
        match slot {
            Some(chunk) => total += chunk.len(),
            None => {
                return Err(FragmentError::IncompleteSequence {
                    ordering,
                    missing: i as u16,
                })
            }
        }
    }

    let mut out = BytesMut::with_capacity(total);
    for chunk in slots.into_iter().flatten() {
        out.extend_from_slice(&chunk.payload);
    }
    Ok(out.freeze())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
