//! Collects chunks arriving from the mesh and hands back the
//! original datagram once every part of an operation is present.
//!
//! Operations are keyed by ordering number. At most `max_pending` operations
//! are tracked at once; the oldest is evicted to make room. Operations that
//! stop receiving chunks are dropped after `timeout`.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::fragment::{rebuild, Chunk, FragmentError};

/// Maximum number of operations reassembled concurrently.
pub const MAX_PENDING: usize = 100;

/// Default idle time after which an incomplete operation is dropped.
pub const ASSEMBLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of adding one chunk.
#[derive(Debug, PartialEq, Eq)]
pub enum Progress {
    /// More chunks are needed.
    Pending { received: u16, parts: u16 },
    /// The chunk completed its operation.
    Complete { ordering: u16, datagram: Bytes },
    /// This sequence number was already held; the chunk was ignored.
    Duplicate,
}

struct Assembly {
    parts: u16,
    chunks: BTreeMap<u16, Chunk>,
    started_at: Instant,
    last_chunk_at: Instant,
}

impl Assembly {
    fn first_missing(&self) -> u16 {
        (0..self.parts)
            .find(|seq| !self.chunks.contains_key(seq))
            .unwrap_or(self.parts)
    }
}

pub struct Reassembler {
    active: HashMap<u16, Assembly>,
    max_pending: usize,
    timeout: Duration,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(MAX_PENDING, ASSEMBLY_TIMEOUT)
    }
}

impl Reassembler {
    pub fn new(max_pending: usize, timeout: Duration) -> Self {
        Self {
            active: HashMap::new(),
            max_pending: max_pending.max(1),
            timeout,
        }
    }

    /// Number of operations currently incomplete.
    pub fn pending(&self) -> usize {
        self.active.len()
    }

    /// Add a chunk received from the mesh.
    ///
    /// A chunk that fails its checksum discards the whole operation and
    /// returns `CorruptChunk`; the other operations are untouched.
    pub fn add(&mut self, chunk: Chunk) -> Result<Progress, FragmentError> {
        if chunk.parts == 0 || chunk.sequence >= chunk.parts {
            return Err(FragmentError::InvalidArgument("chunk sequence outside its part count"));
        }

        let ordering = chunk.ordering;
        if !chunk.verify() {
            self.active.remove(&ordering);
            return Err(FragmentError::CorruptChunk {
                ordering,
                sequence: chunk.sequence,
            });
        }

        // A part-count change means the ordering number wrapped onto a
        // stale operation. Start over.
        if let Some(existing) = self.active.get(&ordering) {
            if existing.parts != chunk.parts {
                tracing::warn!(
                    ordering,
                    old_parts = existing.parts,
                    new_parts = chunk.parts,
                    "ordering number reused, dropping stale assembly"
                );
                self.active.remove(&ordering);
            }
        }

        if !self.active.contains_key(&ordering) {
            self.make_room();
        }

        let now = Instant::now();
        let assembly = self.active.entry(ordering).or_insert_with(|| Assembly {
            parts: chunk.parts,
            chunks: BTreeMap::new(),
            started_at: now,
            last_chunk_at: now,
        });

        if assembly.chunks.contains_key(&chunk.sequence) {
            return Ok(Progress::Duplicate);
        }
        assembly.last_chunk_at = now;
        assembly.chunks.insert(chunk.sequence, chunk);

        let received = assembly.chunks.len() as u16;
        let parts = assembly.parts;
        if received < parts {
            return Ok(Progress::Pending { received, parts });
        }

        let Some(assembly) = self.active.remove(&ordering) else {
            return Ok(Progress::Pending { received, parts });
        };
        let chunks: Vec<Chunk> = assembly.chunks.into_values().collect();
        let datagram = rebuild(&chunks)?;
        Ok(Progress::Complete { ordering, datagram })
    }

    /// Drop operations that have received nothing for longer than the
    /// timeout. Returns one `IncompleteSequence` per dropped operation,
    /// naming its first missing chunk.
    pub fn expire_stale(&mut self) -> Vec<FragmentError> {
        let timeout = self.timeout;
        let mut expired = Vec::new();
        self.active.retain(|&ordering, assembly| {
            let stale = assembly.last_chunk_at.elapsed() > timeout;
            if stale {
                expired.push(FragmentError::IncompleteSequence {
                    ordering,
                    missing: assembly.first_missing(),
                });
            }
            !stale
        });
        expired
    }

    fn make_room(&mut self) {
        while self.active.len() >= self.max_pending {
            let oldest = self
                .active
                .iter()
                .min_by_key(|(_, a)| a.started_at)
                .map(|(&ordering, _)| ordering);
            match oldest {
                Some(ordering) => {
                    if let Some(evicted) = self.active.remove(&ordering) {
                        tracing::warn!(
                            ordering,
                            received = evicted.chunks.len(),
                            parts = evicted.parts,
                            "reassembly table full, evicting oldest operation"
                        );
                    }
                }
                None => break,
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::split;

    #[test]
    fn completes_when_all_parts_arrive() {
        let original: Vec<u8> = (0..250u32).map(|i| i as u8).collect();
        let chunks = split(&original, 100, 11).unwrap();
        let mut reassembler = Reassembler::default();

        assert_eq!(
            reassembler.add(chunks[2].clone()).unwrap(),
            Progress::Pending { received: 1, parts: 3 }
        );
        assert_eq!(
            reassembler.add(chunks[0].clone()).unwrap(),
            Progress::Pending { received: 2, parts: 3 }
        );
        match reassembler.add(chunks[1].clone()).unwrap() {
            Progress::Complete { ordering, datagram } => {
                assert_eq!(ordering, 11);
                assert_eq!(&datagram[..], &original[..]);
            }
            other => panic!("expected completion, got {other:?}"),
        }
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn interleaved_operations_stay_separate() {
        let a = split(b"first datagram body", 5, 1).unwrap();
        let b = split(b"second datagram body", 5, 2).unwrap();
        let mut reassembler = Reassembler::default();
        let mut done = Vec::new();

        for (x, y) in a.into_iter().zip(b) {
            for chunk in [x, y] {
                if let Progress::Complete { ordering, datagram } = reassembler.add(chunk).unwrap() {
                    done.push((ordering, datagram));
                }
            }
        }

        done.sort_by_key(|(o, _)| *o);
        assert_eq!(done[0].1, Bytes::from_static(b"first datagram body"));
        assert_eq!(done[1].1, Bytes::from_static(b"second datagram body"));
    }

    #[test]
    fn duplicate_chunk_is_ignored() {
        let chunks = split(b"abcdefgh", 4, 5).unwrap();
        let mut reassembler = Reassembler::default();
        reassembler.add(chunks[0].clone()).unwrap();
        assert_eq!(reassembler.add(chunks[0].clone()).unwrap(), Progress::Duplicate);
    }

    #[test]
    fn corrupt_chunk_discards_only_its_operation() {
        let a = split(b"aaaaaaaa", 4, 1).unwrap();
        let b = split(b"bbbbbbbb", 4, 2).unwrap();
        let mut reassembler = Reassembler::default();

        reassembler.add(a[0].clone()).unwrap();
        reassembler.add(b[0].clone()).unwrap();

        let mut bad = a[1].clone();
        bad.payload = Bytes::from_static(b"zzzz");
        assert_eq!(
            reassembler.add(bad),
            Err(FragmentError::CorruptChunk { ordering: 1, sequence: 1 })
        );
        assert_eq!(reassembler.pending(), 1);
        assert!(matches!(
            reassembler.add(b[1].clone()).unwrap(),
            Progress::Complete { ordering: 2, .. }
        ));
    }

    #[test]
    fn stale_operations_expire_with_missing_index() {
        let chunks = split(b"abcdefghijkl", 4, 3).unwrap();
        let mut reassembler = Reassembler::new(MAX_PENDING, Duration::ZERO);
        reassembler.add(chunks[0].clone()).unwrap();
        reassembler.add(chunks[2].clone()).unwrap();

        std::thread::sleep(Duration::from_millis(5));
        let expired = reassembler.expire_stale();
        assert_eq!(
            expired,
            vec![FragmentError::IncompleteSequence { ordering: 3, missing: 1 }]
        );
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn full_table_evicts_oldest() {
        let mut reassembler = Reassembler::new(2, ASSEMBLY_TIMEOUT);
        for ordering in 0..3u16 {
            let chunks = split(b"0123456789", 5, ordering).unwrap();
            reassembler.add(chunks[0].clone()).unwrap();
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(reassembler.pending(), 2);

        // Operation 0 was evicted: its second half starts a fresh assembly.
        let chunks = split(b"0123456789", 5, 0).unwrap();
        assert_eq!(
            reassembler.add(chunks[1].clone()).unwrap(),
            Progress::Pending { received: 1, parts: 2 }
        );
    }

    #[test]
    fn out_of_range_sequence_is_rejected() {
        let mut chunk = split(b"abcd", 4, 0).unwrap().remove(0);
        chunk.sequence = 3;
        assert!(matches!(
            Reassembler::default().add(chunk),
            Err(FragmentError::InvalidArgument(_))
        ));
    }
}
