use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use super::buffer_pool::BufferPool;
use super::config::{Config, RunControl};
use super::counters::{Counters, Gauges};
use super::driver::DmaDriver;
use super::event::Event;
use super::transmit::Transmitter;

/// State shared by the three pipeline threads and the control plane
#[derive(Debug)]
pub struct Shared {
    pub pool: BufferPool,
    pub control: RunControl,
    pub counters: Counters,
    pub gauges: Gauges,
    pub transmitter: Transmitter,
    pub rx_sequence: AtomicU32,
    pub tx_sequence: AtomicU32,
    /// Bumped on every run start so the receive stage can restart its trigger pacing
    pub run_number: AtomicU32,
}

impl Shared {
    pub fn new(driver: Arc<dyn DmaDriver>, config: &Config) -> Self {
        Self {
            pool: BufferPool::new(driver),
            control: RunControl::new(config),
            counters: Counters::default(),
            gauges: Gauges::default(),
            transmitter: Transmitter::new(),
            rx_sequence: AtomicU32::new(0),
            tx_sequence: AtomicU32::new(0),
            run_number: AtomicU32::new(0),
        }
    }

    pub fn start_run(&self) {
        self.rx_sequence.store(0, Ordering::Relaxed);
        self.tx_sequence.store(0, Ordering::Relaxed);
        self.run_number.fetch_add(1, Ordering::Relaxed);
    }
}

/// The queues between the pipeline stages.
///
/// Events flow receive -> `work` -> work stage -> `tx_req` -> transmit -> `ack` -> work stage ->
/// `release` -> receive, where the slot goes back into the event pool.
#[derive(Debug, Clone)]
pub struct Queues {
    pub work_tx: Sender<Box<Event>>,
    pub work_rx: Receiver<Box<Event>>,
    pub tx_req_tx: Sender<Box<Event>>,
    pub tx_req_rx: Receiver<Box<Event>>,
    pub ack_tx: Sender<Box<Event>>,
    pub ack_rx: Receiver<Box<Event>>,
    pub release_tx: Sender<Box<Event>>,
    pub release_rx: Receiver<Box<Event>>,
}

impl Queues {
    /// `nevents` is the number of event slots in circulation. The ack and release queues are
    /// sized to hold all of them so those hand-offs never block.
    pub fn new(queue_depth: usize, tx_frame_count: usize, nevents: usize) -> Self {
        let (work_tx, work_rx) = bounded(queue_depth);
        let (tx_req_tx, tx_req_rx) = bounded(tx_frame_count);
        let (ack_tx, ack_rx) = bounded(nevents);
        let (release_tx, release_rx) = bounded(nevents);
        Self {
            work_tx,
            work_rx,
            tx_req_tx,
            tx_req_rx,
            ack_tx,
            ack_rx,
            release_tx,
            release_rx,
        }
    }

    /// Free every event still sitting in a queue. Returns how many there were.
    pub fn drain(&self, shared: &Shared) -> usize {
        let mut drained = 0;
        for queue in [&self.work_rx, &self.tx_req_rx, &self.ack_rx, &self.release_rx] {
            while let Ok(mut event) = queue.try_recv() {
                event.free(&shared.pool);
                drained += 1;
            }
        }
        drained
    }
}
