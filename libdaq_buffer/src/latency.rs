use std::collections::VecDeque;

use super::buffer_pool::BufferPool;
use super::frame::FrameRecord;

/// LatencyRing holds the most recent frames of one stream that no event has claimed yet.
///
/// It lets an event reach back in time when its trigger arrives after the relevant data has
/// already streamed past. The ring never holds more than `depth` frames: inserting into a full
/// ring returns the oldest frame's buffer to the driver.
#[derive(Debug)]
pub struct LatencyRing {
    records: VecDeque<FrameRecord>,
    depth: usize,
}

impl LatencyRing {
    pub fn new(depth: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(depth + 1),
            depth,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Append `record`, evicting and freeing the oldest frame once the ring is over depth
    pub fn replace(&mut self, record: FrameRecord, pool: &BufferPool) {
        self.records.push_back(record);
        if self.records.len() > self.depth {
            if let Some(oldest) = self.records.pop_front() {
                spdlog::trace!("Latency ring evicting buffer {}", oldest.index());
                oldest.free(pool);
            }
        }
    }

    /// Take the frames an event starting at `window_begin` can use.
    ///
    /// Frames beginning before the window are freed; triggers never overlap, so no later event
    /// can need them. The first frame at or after the window start and everything after it move
    /// out as one block. The ring is left empty.
    pub fn seed(&mut self, window_begin: u64, pool: &BufferPool) -> VecDeque<FrameRecord> {
        let first = self
            .records
            .iter()
            .position(|r| r.begin() >= window_begin)
            .unwrap_or(self.records.len());
        let block = self.records.split_off(first);
        for stale in self.records.drain(..) {
            stale.free(pool);
        }
        self.reset();
        block
    }

    /// Forget every entry without freeing it.
    ///
    /// Only valid once the entries have been handed to someone else. Returns how many entries
    /// were forgotten; anything non-zero means buffers were leaked.
    pub fn reset(&mut self) -> usize {
        let forgotten = self.records.len();
        if forgotten != 0 {
            spdlog::error!(
                "Latency ring reset while still holding {} frames; their buffers are lost",
                forgotten
            );
            for record in self.records.drain(..) {
                // Dropping the token without returning it to the driver
                let _ = record.into_buffer();
            }
        }
        forgotten
    }

    /// Return every held frame to the driver
    pub fn flush(&mut self, pool: &BufferPool) {
        for record in self.records.drain(..) {
            record.free(pool);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;

    #[test]
    fn test_depth_nine_evicts_oldest() {
        let harness = Harness::new(32);
        let mut ring = LatencyRing::new(9);
        let mut first_index = None;
        for i in 0..10u64 {
            let record = harness.frame(0, 1000 * i, 1000 * i + 999);
            if i == 0 {
                first_index = Some(record.index());
            }
            ring.replace(record, &harness.pool);
            assert!(ring.len() <= 9);
        }
        let first_index = first_index.unwrap();
        assert_eq!(ring.len(), 9);
        assert_eq!(harness.driver.free_count(first_index), 1);
        let held = ring.seed(0, &harness.pool);
        let begins: Vec<u64> = held.iter().map(|r| r.begin()).collect();
        assert_eq!(begins, (1..10).map(|i| 1000 * i).collect::<Vec<u64>>());
        for record in held {
            record.free(&harness.pool);
        }
        assert_eq!(harness.pool.outstanding(), 0);
    }

    #[test]
    fn test_each_eviction_frees_once() {
        let harness = Harness::new(64);
        let mut ring = LatencyRing::new(3);
        let mut indices = Vec::new();
        for i in 0..20u64 {
            let record = harness.frame(1, 100 * i, 100 * i + 99);
            indices.push(record.index());
            ring.replace(record, &harness.pool);
            assert!(ring.len() <= 3);
        }
        for index in &indices[..17] {
            assert_eq!(harness.driver.free_count(*index), 1);
        }
        for index in &indices[17..] {
            assert_eq!(harness.driver.free_count(*index), 0);
        }
        ring.flush(&harness.pool);
    }

    #[test]
    fn test_seed_frees_frames_before_window() {
        let harness = Harness::new(16);
        let mut ring = LatencyRing::new(9);
        let mut indices = Vec::new();
        for begin in [1000u64, 2000, 3000, 4000] {
            let record = harness.frame(0, begin, begin + 999);
            indices.push(record.index());
            ring.replace(record, &harness.pool);
        }
        let block = ring.seed(3000, &harness.pool);
        let begins: Vec<u64> = block.iter().map(|r| r.begin()).collect();
        assert_eq!(begins, vec![3000, 4000]);
        assert!(ring.is_empty());
        assert_eq!(harness.driver.free_count(indices[0]), 1);
        assert_eq!(harness.driver.free_count(indices[1]), 1);
        assert_eq!(harness.driver.free_count(indices[2]), 0);
        assert_eq!(harness.driver.free_count(indices[3]), 0);
        for record in block {
            record.free(&harness.pool);
        }
        assert_eq!(harness.pool.outstanding(), 0);
    }

    #[test]
    fn test_seed_with_only_stale_frames_yields_nothing() {
        let harness = Harness::new(8);
        let mut ring = LatencyRing::new(9);
        ring.replace(harness.frame(0, 0, 999), &harness.pool);
        let block = ring.seed(5000, &harness.pool);
        assert!(block.is_empty());
        assert!(ring.is_empty());
        assert_eq!(harness.pool.outstanding(), 0);

        let block = ring.seed(5000, &harness.pool);
        assert!(block.is_empty());
    }
}
