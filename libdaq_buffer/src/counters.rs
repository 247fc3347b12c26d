use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Running totals kept by the pipeline threads. Each stage only ever adds to its own fields.
#[derive(Debug, Default)]
pub struct Counters {
    pub rx_count: AtomicU64,
    pub rx_total: AtomicU64,
    pub rx_errors: AtomicU64,
    /// Data frames that did not span a full frame of samples
    pub missing_count: AtomicU64,
    pub drop_count: AtomicU64,
    pub triggers: AtomicU64,
    pub trg_msg_count: AtomicU64,
    pub dis_trg_count: AtomicU64,
    pub overruns: AtomicU64,
    pub tx_count: AtomicU64,
    pub tx_total: AtomicU64,
    pub tx_errors: AtomicU64,
}

impl Counters {
    pub fn increment(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            rx_count: self.rx_count.load(Ordering::Relaxed),
            rx_total: self.rx_total.load(Ordering::Relaxed),
            rx_errors: self.rx_errors.load(Ordering::Relaxed),
            missing_count: self.missing_count.load(Ordering::Relaxed),
            drop_count: self.drop_count.load(Ordering::Relaxed),
            triggers: self.triggers.load(Ordering::Relaxed),
            trg_msg_count: self.trg_msg_count.load(Ordering::Relaxed),
            dis_trg_count: self.dis_trg_count.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
            tx_count: self.tx_count.load(Ordering::Relaxed),
            tx_total: self.tx_total.load(Ordering::Relaxed),
            tx_errors: self.tx_errors.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.rx_count,
            &self.rx_total,
            &self.rx_errors,
            &self.missing_count,
            &self.drop_count,
            &self.triggers,
            &self.trg_msg_count,
            &self.dis_trg_count,
            &self.overruns,
            &self.tx_count,
            &self.tx_total,
            &self.tx_errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// A plain copy of [`Counters`] at one instant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub rx_count: u64,
    pub rx_total: u64,
    pub rx_errors: u64,
    pub missing_count: u64,
    pub drop_count: u64,
    pub triggers: u64,
    pub trg_msg_count: u64,
    pub dis_trg_count: u64,
    pub overruns: u64,
    pub tx_count: u64,
    pub tx_total: u64,
    pub tx_errors: u64,
}

/// Instantaneous levels, overwritten rather than accumulated
#[derive(Debug, Default)]
pub struct Gauges {
    /// Buffers currently held by the pipeline
    pub rx_pend: AtomicU64,
    /// Events handed to transmit and not yet acknowledged
    pub tx_pend: AtomicU64,
    /// Size of the last received frame
    pub rx_size: AtomicU64,
    /// Size of the last transmitted message
    pub tx_size: AtomicU64,
}

impl Gauges {
    pub fn set(gauge: &AtomicU64, value: u64) {
        gauge.store(value, Ordering::Relaxed);
    }

    pub fn get(gauge: &AtomicU64) -> u64 {
        gauge.load(Ordering::Relaxed)
    }
}

/// Status report returned by [`crate::daq_buffer::DaqBuffer::status`]
#[derive(Debug, Clone, Default)]
pub struct BufferStatus {
    pub buff_count: usize,
    pub rx_pend: u64,
    pub tx_pend: u64,
    pub rx_size: u64,
    pub tx_size: u64,
    pub counters: CounterSnapshot,
    /// Hz
    pub trigger_rate: f64,
    /// Hz
    pub rx_rate: f64,
    /// Mbit/s
    pub rx_bw: f64,
    /// Hz
    pub tx_rate: f64,
    /// Mbit/s
    pub tx_bw: f64,
}

/// Turns successive counter snapshots into rates
#[derive(Debug)]
pub struct StatusPoller {
    last: CounterSnapshot,
    last_time: Instant,
}

impl Default for StatusPoller {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusPoller {
    pub fn new() -> Self {
        Self {
            last: CounterSnapshot::default(),
            last_time: Instant::now(),
        }
    }

    /// Rates since the previous poll
    pub fn poll(&mut self, counters: &Counters, gauges: &Gauges, buff_count: usize) -> BufferStatus {
        let now = Instant::now();
        let current = counters.snapshot();
        let status = Self::compute(
            &self.last,
            &current,
            now.duration_since(self.last_time).as_secs_f64(),
            gauges,
            buff_count,
        );
        self.last = current;
        self.last_time = now;
        status
    }

    /// Forget the previous snapshot, used after the counters are zeroed
    pub fn restart(&mut self) {
        self.last = CounterSnapshot::default();
        self.last_time = Instant::now();
    }

    fn compute(
        last: &CounterSnapshot,
        current: &CounterSnapshot,
        interval: f64,
        gauges: &Gauges,
        buff_count: usize,
    ) -> BufferStatus {
        let rate = |now: u64, then: u64| {
            if interval > 0.0 {
                now.saturating_sub(then) as f64 / interval
            } else {
                0.0
            }
        };
        BufferStatus {
            buff_count,
            rx_pend: Gauges::get(&gauges.rx_pend),
            tx_pend: Gauges::get(&gauges.tx_pend),
            rx_size: Gauges::get(&gauges.rx_size),
            tx_size: Gauges::get(&gauges.tx_size),
            counters: *current,
            trigger_rate: rate(current.triggers, last.triggers),
            rx_rate: rate(current.rx_count, last.rx_count),
            rx_bw: rate(current.rx_total, last.rx_total) * 8.0 / 1e6,
            tx_rate: rate(current.tx_count, last.tx_count),
            tx_bw: rate(current.tx_total, last.tx_total) * 8.0 / 1e6,
        }
    }
}
