//! The per-shard log: segment ring, key index, and reclamation.

use std::collections::HashMap;

use crate::error::{StoreError, StoreResult};
use crate::metrics;
use crate::object::{self, HEADER_SIZE};
use crate::segment::Segment;

/// Geometry of a shard's memory region.
#[derive(Debug, Clone, Copy)]
pub struct LogConfig {
    /// Total bytes of the region. Must be a multiple of `segment_size`.
    pub region_size: usize,
    /// Bytes per segment. Also the upper bound on object size.
    pub segment_size: usize,
}

/// Where a live object lives: `(segment, offset)` instead of a raw pointer,
/// so reclamation can move objects without dangling references.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub segment: u32,
    pub offset: u32,
}

/// A log of objects.
///
/// Owns the shard's region, the segment ring, and the key index. The index
/// maps each key to at most one non-expired object. Mutated only by the
/// owning shard thread.
pub struct Log {
    region: Box<[u8]>,
    segment_size: usize,
    segments: Vec<Segment>,
    /// Oldest segment still holding claimed data; where reclamation starts.
    head: usize,
    /// Segment currently being written.
    tail: usize,
    index: HashMap<Box<[u8]>, Location, ahash::RandomState>,
}

impl Log {
    /// Allocate the region and carve it into segments.
    pub fn new(config: LogConfig) -> StoreResult<Self> {
        if config.segment_size <= HEADER_SIZE
            || config.segment_size > u32::MAX as usize
            || config.region_size == 0
            || config.region_size % config.segment_size != 0
        {
            return Err(StoreError::InvalidConfig);
        }

        let nr_segments = config.region_size / config.segment_size;
        let segments = (0..nr_segments)
            .map(|i| Segment::new(i * config.segment_size, config.segment_size))
            .collect();

        Ok(Self {
            region: vec![0u8; config.region_size].into_boxed_slice(),
            segment_size: config.segment_size,
            segments,
            head: 0,
            tail: 0,
            index: HashMap::default(),
        })
    }

    /// Total bytes of the backing region.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.region.len()
    }

    /// Number of segments in the ring.
    #[inline]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Number of live keys.
    #[inline]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Bytes currently occupied across all segments, live or garbage.
    pub fn occupied_bytes(&self) -> usize {
        self.segments.iter().map(|s| s.occupancy()).sum()
    }

    /// Look up the blob for `key`.
    ///
    /// The returned view is valid until the next mutating call on this log.
    pub fn find(&self, key: &[u8]) -> Option<&[u8]> {
        let loc = *self.index.get(key)?;
        Some(self.view_at(loc).blob())
    }

    /// Append a key-blob pair.
    ///
    /// Replacing an existing key expires the prior object in place; the old
    /// bytes stay put until their segment is reclaimed.
    pub fn append(&mut self, key: &[u8], blob: &[u8]) -> StoreResult<()> {
        let size = object::size_of(key.len(), blob.len());
        if size > self.segment_size {
            return Err(StoreError::OutOfRange);
        }
        loop {
            if self.try_append(key, blob) {
                return Ok(());
            }
            if self.reclaim(size) < size {
                return Err(StoreError::OutOfMemory);
            }
        }
    }

    /// Expire the indexed object for `key` and drop the index entry.
    ///
    /// Returns `true` if the key was present. The bytes remain in the
    /// segment until reclamation.
    pub fn remove(&mut self, key: &[u8]) -> bool {
        match self.index.remove(key) {
            Some(loc) => {
                self.expire_at(loc);
                true
            }
            None => false,
        }
    }

    /// Reclaim at least `target` bytes by draining segments from the head.
    ///
    /// For each segment: objects that are expired or superseded are garbage;
    /// live objects are relocated to the tail through a non-reclaiming
    /// append. When relocation cannot fit, the current segment is left
    /// untouched and the bytes freed so far are returned. A single call
    /// sweeps at most one full ring.
    pub fn reclaim(&mut self, target: usize) -> usize {
        let nr_segments = self.segments.len();
        let mut reclaimed = 0;
        let mut swept = 0;

        while reclaimed < target && swept < nr_segments {
            swept += 1;
            let victim = self.head;
            let freed = match self.drain(victim) {
                Some(freed) => freed,
                None => break,
            };
            reclaimed += freed;
            self.segments[victim].reset();
            if self.head == self.tail {
                // Drained the write segment itself; nothing older remains.
                break;
            }
            self.head = (self.head + 1) % nr_segments;
        }
        if reclaimed > 0 {
            metrics::RECLAIMED_BYTES.add(reclaimed as u64);
        }
        reclaimed
    }

    fn try_append(&mut self, key: &[u8], blob: &[u8]) -> bool {
        loop {
            let tail = self.tail;
            if let Some(offset) = self.segments[tail].append(&mut self.region, key, blob) {
                self.install(
                    key,
                    Location {
                        segment: tail as u32,
                        offset,
                    },
                );
                return true;
            }
            if !self.advance_tail() {
                return false;
            }
        }
    }

    /// Bind `key` to `loc`, expiring any prior object for the same key.
    fn install(&mut self, key: &[u8], loc: Location) {
        if let Some(prev) = self.index.insert(Box::from(key), loc) {
            self.expire_at(prev);
        }
    }

    fn advance_tail(&mut self) -> bool {
        let next = (self.tail + 1) % self.segments.len();
        if next == self.head {
            return false;
        }
        self.tail = next;
        true
    }

    /// Drain one segment: relocate live objects, count garbage bytes.
    ///
    /// Returns `None` when a live object could not be relocated; the segment
    /// must not be reset in that case. Index entries for relocated objects
    /// already point at their new copies, so the stale bytes left behind are
    /// garbage on the next pass.
    fn drain(&mut self, victim: usize) -> Option<usize> {
        let mut garbage = 0;
        let mut live: Vec<u32> = Vec::new();

        for (offset, view) in self.segments[victim].iter(&self.region) {
            if view.is_expired() {
                garbage += view.size();
                continue;
            }
            match self.index.get(view.key()) {
                Some(loc) if loc.segment as usize == victim && loc.offset == offset => {
                    live.push(offset);
                }
                _ => garbage += view.size(),
            }
        }

        if live.is_empty() {
            return Some(garbage);
        }

        // Never relocate into the segment being drained.
        if victim == self.tail && !self.advance_tail() {
            return None;
        }

        for offset in live {
            if !self.relocate(victim, offset) {
                return None;
            }
        }
        Some(garbage)
    }

    /// Copy one live object from `victim` to the tail and repoint its index
    /// entry. Fails when no segment has room.
    fn relocate(&mut self, victim: usize, offset: u32) -> bool {
        let src_at = self.segments[victim].start() + offset as usize;
        let header = object::read_header(&self.region[src_at..]);
        let total = header.total();

        while self.segments[self.tail].remaining() < total {
            if !self.advance_tail() {
                return false;
            }
        }

        let dst = self.tail;
        let dst_offset = self.segments[dst].occupancy() as u32;
        let dst_at = self.segments[dst].start() + dst_offset as usize;
        self.region.copy_within(src_at..src_at + total, dst_at);
        self.segments[dst].advance(total);

        let key_start = src_at + HEADER_SIZE;
        let key_end = key_start + header.key_len as usize;
        if let Some(loc) = self.index.get_mut(&self.region[key_start..key_end]) {
            *loc = Location {
                segment: dst as u32,
                offset: dst_offset,
            };
        }
        true
    }

    fn view_at(&self, loc: Location) -> object::ObjectView<'_> {
        let seg = &self.segments[loc.segment as usize];
        let at = seg.start() + loc.offset as usize;
        let header = object::read_header(&self.region[at..]);
        object::ObjectView::new(&self.region[at..at + header.total()])
    }

    fn expire_at(&mut self, loc: Location) {
        let at = self.segments[loc.segment as usize].start() + loc.offset as usize;
        object::expire(&mut self.region[at..]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn log(region_size: usize, segment_size: usize) -> Log {
        Log::new(LogConfig {
            region_size,
            segment_size,
        })
        .unwrap()
    }

    fn random_bytes(len: usize) -> Vec<u8> {
        let mut rng = rand::thread_rng();
        (0..len)
            .map(|_| rng.sample(rand::distributions::Alphanumeric))
            .collect()
    }

    /// Every index entry must address a non-expired object whose key matches.
    fn assert_index_consistent(log: &Log) {
        for (key, loc) in &log.index {
            let view = log.view_at(*loc);
            assert!(!view.is_expired(), "indexed object is expired");
            assert_eq!(view.key(), &key[..], "indexed object has wrong key");
        }
        assert!(log.occupied_bytes() <= log.capacity());
    }

    #[test]
    fn append_and_find() {
        let mut log = log(128, 64);
        let key = b"abcdefgh";
        let blob = b"0123456789abcdef";

        log.append(key, blob).unwrap();
        assert_eq!(log.find(key), Some(&blob[..]));
        assert_index_consistent(&log);
    }

    #[test]
    fn append_replaces_and_expires_previous() {
        let mut log = log(128, 64);
        let key = b"abcdefgh";

        log.append(key, b"0123456789abcdef").unwrap();
        log.append(key, b"fedcba9876543210").unwrap();

        assert_eq!(log.find(key), Some(&b"fedcba9876543210"[..]));
        assert_eq!(log.len(), 1);

        // the first copy is still physically present, but expired
        let (_, first) = log.segments[0].iter(&log.region).next().unwrap();
        assert!(first.is_expired());
        assert_index_consistent(&log);
    }

    #[test]
    fn fill_until_full_then_stay_full() {
        let mut log = log(1024, 64);

        loop {
            let key = random_bytes(8);
            let blob = random_bytes(16);
            if log.append(&key, &blob).is_err() {
                break;
            }
        }

        // no phantom capacity: a fresh append must also fail
        let key = random_bytes(8);
        let blob = random_bytes(16);
        assert_eq!(log.append(&key, &blob), Err(StoreError::OutOfMemory));
        assert_index_consistent(&log);
    }

    #[test]
    fn remove_then_reclaim_then_append() {
        let mut log = log(64, 64);
        let key = b"abcdefgh";
        let blob = b"0123456789abcdef";
        let size = object::size_of(key.len(), blob.len());

        log.append(key, blob).unwrap();
        assert_eq!(log.append(key, blob), Err(StoreError::OutOfMemory));

        assert!(log.remove(key));
        assert!(log.reclaim(size) >= size);

        log.append(key, blob).unwrap();
        assert_eq!(log.find(key), Some(&blob[..]));
        assert_index_consistent(&log);
    }

    #[test]
    fn reclaim_zero_is_a_noop() {
        let mut log = log(128, 64);
        log.append(b"key", b"value").unwrap();
        let occupied = log.occupied_bytes();

        assert_eq!(log.reclaim(0), 0);
        assert_eq!(log.occupied_bytes(), occupied);
        assert_eq!(log.find(b"key"), Some(&b"value"[..]));
    }

    #[test]
    fn oversized_object_is_rejected() {
        let mut log = log(128, 64);
        let blob = vec![0u8; 64];
        assert_eq!(log.append(b"key", &blob), Err(StoreError::OutOfRange));
        // nothing was written
        assert_eq!(log.occupied_bytes(), 0);
    }

    #[test]
    fn remove_missing_key() {
        let mut log = log(128, 64);
        assert!(!log.remove(b"missing"));
        log.append(b"key", b"value").unwrap();
        assert!(log.remove(b"key"));
        assert!(!log.remove(b"key"));
        assert_eq!(log.find(b"key"), None);
    }

    #[test]
    fn reclaim_relocates_live_objects() {
        // objects are 12 + 4 + 10 = 26 bytes; two fit per 64-byte segment
        let mut log = log(128, 64);
        log.append(b"key0", b"aaaaaaaaaa").unwrap();
        log.append(b"key1", b"bbbbbbbbbb").unwrap();
        log.append(b"key2", b"cccccccccc").unwrap(); // lands in segment 1

        assert!(log.remove(b"key0"));
        let freed = log.reclaim(26);
        assert!(freed >= 26);

        // key1 was live in the drained segment and must have moved
        assert_eq!(log.find(b"key1"), Some(&b"bbbbbbbbbb"[..]));
        assert_eq!(log.find(b"key2"), Some(&b"cccccccccc"[..]));
        assert_eq!(log.find(b"key0"), None);
        assert_index_consistent(&log);

        // the freed segment is writable again
        log.append(b"key3", b"dddddddddd").unwrap();
        log.append(b"key4", b"eeeeeeeeee").unwrap();
        assert_index_consistent(&log);
    }

    #[test]
    fn reclaim_aborts_when_relocation_cannot_fit() {
        // one object per segment, everything live: nothing to free
        let mut log = log(128, 64);
        log.append(b"abcdefgh", b"0123456789abcdef").unwrap();
        log.append(b"hgfedcba", b"0123456789abcdef").unwrap();

        assert_eq!(log.reclaim(1), 0);
        assert_eq!(log.find(b"abcdefgh"), Some(&b"0123456789abcdef"[..]));
        assert_eq!(log.find(b"hgfedcba"), Some(&b"0123456789abcdef"[..]));
        assert_index_consistent(&log);
    }

    #[test]
    fn overwrite_churn_reclaims_superseded_copies() {
        // repeatedly overwrite a small working set; reclamation must keep up
        let mut log = log(1024, 64);
        for round in 0..64 {
            for k in 0..4u8 {
                let key = [b'k', k];
                let blob = [round as u8; 20];
                log.append(&key, &blob).unwrap();
            }
        }
        assert_eq!(log.len(), 4);
        for k in 0..4u8 {
            let key = [b'k', k];
            assert_eq!(log.find(&key), Some(&[63u8; 20][..]));
        }
        assert_index_consistent(&log);
    }

    #[test]
    fn invalid_geometry_is_rejected() {
        assert_eq!(
            Log::new(LogConfig {
                region_size: 100,
                segment_size: 64,
            })
            .err(),
            Some(StoreError::InvalidConfig)
        );
        assert_eq!(
            Log::new(LogConfig {
                region_size: 0,
                segment_size: 64,
            })
            .err(),
            Some(StoreError::InvalidConfig)
        );
        assert_eq!(
            Log::new(LogConfig {
                region_size: 64,
                segment_size: 8,
            })
            .err(),
            Some(StoreError::InvalidConfig)
        );
    }
}
