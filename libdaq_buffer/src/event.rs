use super::buffer_pool::{Buffer, BufferPool};
use super::constants::{ALL_STREAMS_MASK, N_DATA_STREAMS};
use super::frame::{FrameRecord, TimestampRange};
use super::latency::LatencyRing;
use super::timing_msg::TimingMsg;

/// Where a trigger came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerSource {
    #[default]
    Software = 0,
    Hardware = 1,
}

/// The triggering information carried by an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Trigger {
    pub timestamp: u64,
    pub sequence: u32,
    pub opaque: u32,
    pub source: TriggerSource,
}

impl Trigger {
    pub fn software(timestamp: u64, sequence: u32, opaque: u32) -> Self {
        Self {
            timestamp,
            sequence,
            opaque,
            source: TriggerSource::Software,
        }
    }

    pub fn hardware(msg: &TimingMsg) -> Self {
        Self {
            timestamp: msg.timestamp,
            sequence: msg.sequence,
            opaque: msg.tsw,
            source: TriggerSource::Hardware,
        }
    }

    /// The window `[timestamp - pretrigger, timestamp + posttrigger]`
    pub fn window(&self, pretrigger: u64, posttrigger: u64) -> TimestampRange {
        TimestampRange::new(
            self.timestamp.saturating_sub(pretrigger),
            self.timestamp.saturating_add(posttrigger),
        )
    }
}

/// The outcome of offering frames to an event
#[derive(Debug)]
pub enum Fate {
    /// Accepted; other contributions are still pending
    Added,
    /// Accepted and every stream now covers the window
    Completed,
    /// The stream had already finished for this event. The event must be posted as it stands;
    /// the frame is handed back.
    Overrun(FrameRecord),
    /// The frame starts after the window; the event is untouched and the frame is handed back
    Rejected(FrameRecord),
}

/// Lifecycle of an event slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventState {
    Empty,
    Seeding,
    Pending,
    Completed,
    Overrun,
    Freed,
}

/// The buffer that identifies an event while it is in flight. It is released last.
#[derive(Debug, Default)]
pub enum Anchor {
    #[default]
    None,
    /// The trigger message buffer, owned by the event
    Trigger(Buffer),
    /// A data frame that is also one of the contributions
    Frame(u32),
}

impl Anchor {
    pub fn index(&self) -> Option<u32> {
        match self {
            Anchor::None => None,
            Anchor::Trigger(buffer) => Some(buffer.index()),
            Anchor::Frame(index) => Some(*index),
        }
    }
}

/// Event is one trigger's worth of data from every stream.
///
/// The event opens a time window around its trigger, seeds itself from each stream's latency
/// ring, then takes frames as they arrive until each stream's data reaches the end of the
/// window. Streams are not synchronized with each other, so completion is tracked per stream
/// with one pending bit each.
#[derive(Debug)]
pub struct Event {
    slot: usize,
    state: EventState,
    window: TimestampRange,
    trigger: Trigger,
    contributions: [Vec<FrameRecord>; N_DATA_STREAMS],
    pending: u32,
    anchor: Anchor,
}

impl Event {
    /// An empty event slot. `capacity` reserves room for that many frames per stream.
    pub fn new(slot: usize, capacity: usize) -> Self {
        Self {
            slot,
            state: EventState::Empty,
            window: TimestampRange::default(),
            trigger: Trigger::default(),
            contributions: std::array::from_fn(|_| Vec::with_capacity(capacity)),
            pending: 0,
            anchor: Anchor::None,
        }
    }

    /// Begin assembling for `trigger` over `window`
    pub fn open(&mut self, window: TimestampRange, trigger: Trigger, anchor: Anchor) {
        self.window = window;
        self.trigger = trigger;
        self.anchor = anchor;
        self.pending = 0;
        self.state = EventState::Seeding;
    }

    /// Pull every stream's usable history out of its latency ring.
    ///
    /// All streams are marked pending first; a stream whose seeded frames already reach the end
    /// of the window is cleared. Returns `Completed` if nothing is left pending.
    pub fn seed_and_drain(&mut self, rings: &mut [LatencyRing], pool: &BufferPool) -> Fate {
        self.pending = ALL_STREAMS_MASK;
        for (stream, ring) in rings.iter_mut().enumerate().take(N_DATA_STREAMS) {
            let block = ring.seed(self.window.begin, pool);
            let covered = block.iter().any(|r| r.end() >= self.window.end);
            self.contributions[stream].extend(block);
            if covered {
                self.pending &= !(1 << stream);
            }
        }

        if self.pending == 0 {
            self.state = EventState::Completed;
            Fate::Completed
        } else {
            self.state = EventState::Pending;
            Fate::Added
        }
    }

    /// Offer a newly received frame from `stream`.
    ///
    /// A frame from a stream that already finished means the event has waited long enough for
    /// the others: it is declared `Overrun` and the frame is returned.
    pub fn add(&mut self, record: FrameRecord, stream: usize) -> Fate {
        if stream >= N_DATA_STREAMS {
            return Fate::Rejected(record);
        }
        let mask = 1 << stream;
        if self.pending & mask == 0 {
            self.state = EventState::Overrun;
            return Fate::Overrun(record);
        }

        if record.begin() <= self.window.end {
            let covers = record.end() >= self.window.end;
            self.contributions[stream].push(record);
            if covers {
                self.pending &= !mask;
                if self.pending == 0 {
                    self.state = EventState::Completed;
                    return Fate::Completed;
                }
            }
            Fate::Added
        } else {
            Fate::Rejected(record)
        }
    }

    /// Mark `stream` finished without it covering the window. Streams are time ordered, so once a
    /// frame starts past the window nothing more can arrive for it. Returns true when no stream
    /// is left pending.
    pub fn close_stream(&mut self, stream: usize) -> bool {
        if stream < N_DATA_STREAMS {
            self.pending &= !(1 << stream);
        }
        if self.pending == 0 {
            self.state = EventState::Completed;
            true
        } else {
            false
        }
    }

    /// Return every buffer this event holds to the driver, the anchor last. Calling it again is a
    /// no-op.
    pub fn free(&mut self, pool: &BufferPool) {
        let anchor = std::mem::take(&mut self.anchor);
        let anchor_frame = match &anchor {
            Anchor::Frame(index) => Some(*index),
            _ => None,
        };
        let mut held = None;
        for list in self.contributions.iter_mut() {
            for record in list.drain(..) {
                if Some(record.index()) == anchor_frame {
                    held = Some(record);
                } else {
                    record.free(pool);
                }
            }
        }
        match anchor {
            Anchor::Trigger(buffer) => pool.free(buffer),
            Anchor::Frame(_) => {
                if let Some(record) = held {
                    record.free(pool);
                }
            }
            Anchor::None => (),
        }
        self.pending = 0;
        if self.state != EventState::Empty {
            self.state = EventState::Freed;
        }
    }

    /// Make a freed slot ready for reuse
    pub fn recycle(&mut self) {
        self.state = EventState::Empty;
        self.pending = 0;
        self.trigger = Trigger::default();
        self.window = TimestampRange::default();
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    /// The buffer index that identifies this event in flight
    pub fn id(&self) -> Option<u32> {
        self.anchor.index()
    }

    pub fn state(&self) -> EventState {
        self.state
    }

    pub fn window(&self) -> TimestampRange {
        self.window
    }

    pub fn trigger(&self) -> &Trigger {
        &self.trigger
    }

    pub fn pending(&self) -> u32 {
        self.pending
    }

    pub fn is_pending(&self, stream: usize) -> bool {
        stream < N_DATA_STREAMS && self.pending & (1 << stream) != 0
    }

    pub fn contributions(&self, stream: usize) -> &[FrameRecord] {
        self.contributions
            .get(stream)
            .map(|c| c.as_slice())
            .unwrap_or(&[])
    }

    /// Every contribution, stream 0 first, each in receipt order
    pub fn frames(&self) -> impl Iterator<Item = &FrameRecord> {
        self.contributions.iter().flat_map(|c| c.iter())
    }

    pub fn n_frames(&self) -> usize {
        self.contributions.iter().map(|c| c.len()).sum()
    }

    /// The earliest receive sequence number in the event, zero if it is empty
    pub fn rx_sequence(&self) -> u32 {
        self.frames().map(|r| r.rx_sequence).min().unwrap_or(0)
    }

    /// Total payload bytes over all contributions
    pub fn payload_size(&self) -> usize {
        self.frames().map(|r| r.size() as usize).sum()
    }

    /// Number of buffers held, anchor included when it is not a contribution
    pub fn held_buffers(&self) -> usize {
        let anchor = match self.anchor {
            Anchor::Trigger(_) => 1,
            _ => 0,
        };
        self.n_frames() + anchor
    }
}

/// EventPool keeps one pre-built event slot per hardware buffer
#[derive(Debug)]
pub struct EventPool {
    free: Vec<Box<Event>>,
    size: usize,
}

impl EventPool {
    pub fn new(nevents: usize, capacity: usize) -> Self {
        Self {
            free: (0..nevents)
                .rev()
                .map(|slot| Box::new(Event::new(slot, capacity)))
                .collect(),
            size: nevents,
        }
    }

    /// Take an empty slot, or None if all are in flight
    pub fn allocate(&mut self) -> Option<Box<Event>> {
        self.free.pop()
    }

    /// Put a slot back. The event must already have been freed.
    pub fn deallocate(&mut self, mut event: Box<Event>) {
        if event.held_buffers() != 0 {
            spdlog::error!(
                "Event slot {} returned while still holding {} buffers",
                event.slot(),
                event.held_buffers()
            );
        }
        event.recycle();
        self.free.push(event);
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use std::collections::HashSet;

    fn rings() -> Vec<LatencyRing> {
        (0..N_DATA_STREAMS).map(|_| LatencyRing::new(9)).collect()
    }

    fn open(window: TimestampRange) -> Event {
        let mut event = Event::new(0, 16);
        event.open(window, Trigger::software(window.center(), 0, 0), Anchor::None);
        event
    }

    #[test]
    fn test_seed_transfers_window_frames() {
        let harness = Harness::new(32);
        let mut rings = rings();
        let mut indices = Vec::new();
        for begin in [1000u64, 2000, 3000, 4000] {
            let record = harness.frame(0, begin, begin + 999);
            indices.push(record.index());
            rings[0].replace(record, &harness.pool);
        }
        let trigger = Trigger::software(5000, 0, 0);
        let mut event = Event::new(0, 16);
        event.open(trigger.window(2000, 2000), trigger, Anchor::None);
        assert_eq!(event.window(), TimestampRange::new(3000, 7000));

        let fate = event.seed_and_drain(&mut rings, &harness.pool);
        assert!(matches!(fate, Fate::Added));
        let begins: Vec<u64> = event.contributions(0).iter().map(|r| r.begin()).collect();
        assert_eq!(begins, vec![3000, 4000]);
        assert!(rings[0].is_empty());
        assert_eq!(harness.driver.free_count(indices[0]), 1);
        assert_eq!(harness.driver.free_count(indices[1]), 1);
        assert_eq!(event.pending(), ALL_STREAMS_MASK);

        event.free(&harness.pool);
        assert_eq!(harness.pool.outstanding(), 0);
    }

    #[test]
    fn test_two_stream_completion() {
        let harness = Harness::new(32);
        let mut rings = rings();
        rings[0].replace(harness.frame(0, 4000, 5999), &harness.pool);
        rings[0].replace(harness.frame(0, 6000, 7000), &harness.pool);

        let mut event = open(TimestampRange::new(3000, 7000));
        let fate = event.seed_and_drain(&mut rings, &harness.pool);
        assert!(matches!(fate, Fate::Added));
        assert!(!event.is_pending(0));
        assert!(event.is_pending(1));

        let fate = event.add(harness.frame(1, 6500, 7500), 1);
        assert!(matches!(fate, Fate::Completed));
        assert_eq!(event.state(), EventState::Completed);

        // Every stream reaches the end of the window
        for stream in 0..N_DATA_STREAMS {
            let max_end = event
                .contributions(stream)
                .iter()
                .map(|r| r.end())
                .max()
                .unwrap();
            assert!(max_end >= event.window().end);
        }
        event.free(&harness.pool);
        assert_eq!(harness.pool.outstanding(), 0);
    }

    #[test]
    fn test_seed_alone_can_complete() {
        let harness = Harness::new(16);
        let mut rings = rings();
        rings[0].replace(harness.frame(0, 3000, 8000), &harness.pool);
        rings[1].replace(harness.frame(1, 3500, 7200), &harness.pool);
        let mut event = open(TimestampRange::new(3000, 7000));
        assert!(matches!(
            event.seed_and_drain(&mut rings, &harness.pool),
            Fate::Completed
        ));
        assert_eq!(event.pending(), 0);
        event.free(&harness.pool);
    }

    #[test]
    fn test_rejection_leaves_event_untouched() {
        let harness = Harness::new(16);
        let mut rings = rings();
        let mut event = open(TimestampRange::new(3000, 7000));
        event.seed_and_drain(&mut rings, &harness.pool);

        let late = harness.frame(0, 7001, 8000);
        let late_index = late.index();
        match event.add(late, 0) {
            Fate::Rejected(record) => {
                assert_eq!(record.index(), late_index);
                record.free(&harness.pool);
            }
            other => panic!("expected rejection, got {:?}", other),
        }
        assert_eq!(event.n_frames(), 0);
        assert_eq!(event.pending(), ALL_STREAMS_MASK);
        assert_eq!(event.state(), EventState::Pending);
    }

    #[test]
    fn test_finished_stream_declares_overrun() {
        let harness = Harness::new(16);
        let mut rings = rings();
        let mut event = open(TimestampRange::new(3000, 7000));
        event.seed_and_drain(&mut rings, &harness.pool);
        assert!(matches!(
            event.add(harness.frame(0, 3000, 7100), 0),
            Fate::Added
        ));
        match event.add(harness.frame(0, 7100, 8100), 0) {
            Fate::Overrun(record) => record.free(&harness.pool),
            other => panic!("expected overrun, got {:?}", other),
        }
        assert_eq!(event.state(), EventState::Overrun);
        assert!(event.is_pending(1));
        event.free(&harness.pool);
        assert_eq!(harness.pool.outstanding(), 0);
    }

    #[test]
    fn test_close_stream_completes() {
        let mut event = open(TimestampRange::new(0, 10));
        event.pending = ALL_STREAMS_MASK;
        assert!(!event.close_stream(0));
        assert!(event.close_stream(1));
        assert_eq!(event.state(), EventState::Completed);
    }

    #[test]
    fn test_free_releases_each_buffer_once_anchor_last() {
        let harness = Harness::new(16);
        let mut rings = rings();
        let trigger_buffer = harness.trigger_buffer(5000);
        let anchor_index = trigger_buffer.index();
        let mut event = Event::new(3, 16);
        event.open(
            TimestampRange::new(3000, 7000),
            Trigger::software(5000, 1, 0),
            Anchor::Trigger(trigger_buffer),
        );
        assert_eq!(event.id(), Some(anchor_index));
        event.seed_and_drain(&mut rings, &harness.pool);
        let mut indices = vec![anchor_index];
        for (stream, begin) in [(0usize, 3000u64), (1, 3200), (0, 5000)] {
            let record = harness.frame(stream as u32, begin, begin + 1999);
            indices.push(record.index());
            event.add(record, stream);
        }
        assert_eq!(event.held_buffers(), 4);
        event.free(&harness.pool);
        event.free(&harness.pool);
        for index in indices {
            assert_eq!(harness.driver.free_count(index), 1);
        }
        assert_eq!(event.state(), EventState::Freed);
        assert_eq!(harness.pool.outstanding(), 0);
    }

    #[test]
    fn test_frame_anchor_is_freed_once() {
        let harness = Harness::new(16);
        let mut rings = rings();
        let record = harness.frame(0, 1000, 2000);
        let index = record.index();
        let mut event = Event::new(0, 16);
        let trigger = Trigger::software(record.range.center(), 0, 0);
        event.open(trigger.window(500, 500), trigger, Anchor::Frame(index));
        event.seed_and_drain(&mut rings, &harness.pool);
        event.add(record, 0);
        event.free(&harness.pool);
        assert_eq!(harness.driver.free_count(index), 1);
    }

    #[test]
    fn test_no_frame_in_two_events() {
        let harness = Harness::new(64);
        let mut rings = rings();
        let mut t = 0u64;
        let mut previous: HashSet<u32> = HashSet::new();
        let mut held: Vec<Event> = Vec::new();
        for window_start in [2000u64, 6000, 10000] {
            for _ in 0..4 {
                for (stream, ring) in rings.iter_mut().enumerate() {
                    ring.replace(harness.frame(stream as u32, t, t + 999), &harness.pool);
                }
                t += 1000;
            }
            let mut event = open(TimestampRange::new(window_start, window_start + 3000));
            event.seed_and_drain(&mut rings, &harness.pool);
            let indices: HashSet<u32> = event.frames().map(|r| r.index()).collect();
            assert_eq!(indices.len(), event.n_frames());
            assert!(indices.is_disjoint(&previous));
            previous.extend(indices);
            // Keep the events alive so no index can be recycled
            held.push(event);
        }
        assert_eq!(previous.len(), 12);
        for event in held.iter_mut() {
            event.free(&harness.pool);
        }
        assert_eq!(harness.pool.outstanding(), 0);
    }

    #[test]
    fn test_event_pool_recycles() {
        let mut pool = EventPool::new(2, 4);
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert!(pool.allocate().is_none());
        assert_ne!(a.slot(), b.slot());
        pool.deallocate(a);
        pool.deallocate(b);
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.allocate().unwrap().state(), EventState::Empty);
    }
}
