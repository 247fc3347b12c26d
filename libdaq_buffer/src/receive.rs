use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::buffer_pool::Buffer;
use super::config::RunMode;
use super::constants::{MAX_PENDING_TRIGGERS, N_DATA_STREAMS, TIMING_DEST};
use super::counters::{Counters, Gauges};
use super::driver::RxDescriptor;
use super::event::{Anchor, Event, EventPool, Fate, Trigger};
use super::frame::FrameRecord;
use super::latency::LatencyRing;
use super::pipeline::Shared;
use super::soft_trigger::SoftTrigger;
use super::timing_msg::TimingMsg;

/// The receive stage.
///
/// Owns the latency rings, the event slots and the one event that may be open at a time. Every
/// buffer the driver hands out passes through here first: it is either released on the spot,
/// parked in a latency ring, or given to the open event.
///
/// Hardware triggers that arrive while an event is open wait in a short queue and are opened in
/// arrival order once the event is posted.
#[derive(Debug)]
pub struct ReceiveStage {
    shared: Arc<Shared>,
    rings: Vec<LatencyRing>,
    events: EventPool,
    active: Option<Box<Event>>,
    pending: VecDeque<(Trigger, Buffer)>,
    soft_trigger: SoftTrigger,
    run_number: u32,
    work: Sender<Box<Event>>,
    release: Receiver<Box<Event>>,
    wait: Duration,
}

impl ReceiveStage {
    pub fn new(
        shared: Arc<Shared>,
        latency_depth: usize,
        work: Sender<Box<Event>>,
        release: Receiver<Box<Event>>,
        wait: Duration,
    ) -> Self {
        let nevents = shared.pool.buffer_count();
        let run_number = shared.run_number.load(Ordering::Relaxed);
        Self {
            shared,
            rings: (0..N_DATA_STREAMS)
                .map(|_| LatencyRing::new(latency_depth))
                .collect(),
            events: EventPool::new(nevents, latency_depth + 1),
            active: None,
            pending: VecDeque::with_capacity(MAX_PENDING_TRIGGERS),
            soft_trigger: SoftTrigger::new(),
            run_number,
            work,
            release,
            wait,
        }
    }

    pub fn run(mut self, enabled: &AtomicBool) {
        spdlog::info!("Receive stage started");
        while enabled.load(Ordering::Relaxed) {
            self.poll();
        }
        self.shutdown();
        spdlog::info!("Receive stage stopped");
    }

    /// One pass: recycle acknowledged event slots, then wait for and handle one frame
    pub fn poll(&mut self) {
        self.drain_releases();

        let run_number = self.shared.run_number.load(Ordering::Relaxed);
        if run_number != self.run_number {
            self.run_number = run_number;
            self.soft_trigger.reset();
        }

        let desc = match self.shared.pool.driver().read_frame(self.wait) {
            Ok(Some(desc)) => desc,
            Ok(None) => return,
            Err(e) => {
                spdlog::error!("Receive stage failed to read from the driver: {}", e);
                std::thread::sleep(self.wait);
                return;
            }
        };

        let buffer = match self.shared.pool.receive(&desc) {
            Ok(buffer) => buffer,
            Err(e) => {
                Counters::increment(&self.shared.counters.rx_errors);
                spdlog::error!("Receive stage could not take buffer {}: {}", desc.index, e);
                return;
            }
        };

        if desc.dest == TIMING_DEST {
            self.handle_timing(buffer);
        } else if (desc.dest as usize) < N_DATA_STREAMS {
            self.handle_data(buffer, &desc);
        } else {
            Counters::increment(&self.shared.counters.rx_errors);
            spdlog::warn!(
                "Receive stage got buffer {} for unknown destination {}",
                desc.index,
                desc.dest
            );
            self.shared.pool.free(buffer);
        }
        self.open_pending();

        Gauges::set(
            &self.shared.gauges.rx_pend,
            self.shared.pool.outstanding() as u64,
        );
    }

    /// Return everything this stage holds. Called once the stage is disabled.
    pub fn shutdown(&mut self) {
        self.drain_releases();
        if let Some(mut event) = self.active.take() {
            event.free(&self.shared.pool);
            self.events.deallocate(event);
        }
        for (_, buffer) in self.pending.drain(..) {
            self.shared.pool.free(buffer);
        }
        for ring in self.rings.iter_mut() {
            ring.flush(&self.shared.pool);
        }
    }

    pub fn has_open_event(&self) -> bool {
        self.active.is_some()
    }

    pub fn ring(&self, stream: usize) -> Option<&LatencyRing> {
        self.rings.get(stream)
    }

    fn handle_timing(&mut self, buffer: Buffer) {
        let pool = &self.shared.pool;
        if self.shared.control.blow_off_dma() || self.shared.control.run_mode() != RunMode::External
        {
            pool.free(buffer);
            return;
        }

        let msg = match TimingMsg::parse(pool.bytes(&buffer)) {
            Ok(msg) => msg,
            Err(e) => {
                Counters::increment(&self.shared.counters.rx_errors);
                spdlog::warn!("Receive stage got a bad timing message: {}", e);
                pool.free(buffer);
                return;
            }
        };
        Counters::increment(&self.shared.counters.trg_msg_count);

        if !msg.is_trigger() {
            pool.free(buffer);
            return;
        }

        let trigger = Trigger::hardware(&msg);
        if self.active.is_none() {
            self.open_event(trigger, Anchor::Trigger(buffer));
        } else if self.pending.len() < MAX_PENDING_TRIGGERS {
            self.pending.push_back((trigger, buffer));
        } else {
            Counters::increment(&self.shared.counters.dis_trg_count);
            spdlog::warn!(
                "Trigger {} at {} discarded, {} triggers already waiting",
                msg.sequence,
                msg.timestamp,
                self.pending.len()
            );
            pool.free(buffer);
        }
    }

    fn handle_data(&mut self, buffer: Buffer, desc: &RxDescriptor) {
        let stream = desc.dest as usize;
        let pool = &self.shared.pool;

        if self.shared.control.blow_off_dma() {
            Counters::increment(&self.shared.counters.drop_count);
            pool.free(buffer);
            return;
        }

        Counters::increment(&self.shared.counters.rx_count);
        Counters::add(&self.shared.counters.rx_total, desc.size as u64);
        Gauges::set(&self.shared.gauges.rx_size, desc.size as u64);

        if desc.is_eofe() {
            Counters::increment(&self.shared.counters.rx_errors);
            spdlog::warn!(
                "Stream {} frame in buffer {} ended with an error",
                stream,
                desc.index
            );
            pool.free(buffer);
            return;
        }

        let rx_sequence = self.shared.rx_sequence.fetch_add(1, Ordering::Relaxed);
        let record = match FrameRecord::parse(buffer, pool, rx_sequence) {
            Ok(record) => record,
            Err((buffer, e)) => {
                Counters::increment(&self.shared.counters.rx_errors);
                spdlog::warn!("Stream {} frame {} dropped: {}", stream, rx_sequence, e);
                pool.free(buffer);
                return;
            }
        };
        if record.is_missing_samples() {
            Counters::increment(&self.shared.counters.missing_count);
        }

        if self.active.is_none()
            && stream == 0
            && self.shared.control.run_mode() == RunMode::Software
        {
            let pacing = self.shared.control.pacing();
            if let Some((timestamp, sequence)) = self.soft_trigger.check(&record.range, &pacing) {
                let trigger = Trigger::software(timestamp, sequence, 0);
                self.open_event(trigger, Anchor::Frame(record.index()));
            }
        }

        let pool = &self.shared.pool;
        match self.active.take() {
            Some(mut event) => match event.add(record, stream) {
                Fate::Added => self.active = Some(event),
                Fate::Completed => self.post(event),
                Fate::Overrun(record) => {
                    Counters::increment(&self.shared.counters.overruns);
                    spdlog::debug!(
                        "Event for trigger {} overrun by stream {}",
                        event.trigger().sequence,
                        stream
                    );
                    self.post(event);
                    self.rings[stream].replace(record, &self.shared.pool);
                }
                Fate::Rejected(record) => {
                    self.rings[stream].replace(record, pool);
                    if event.close_stream(stream) {
                        self.post(event);
                    } else {
                        self.active = Some(event);
                    }
                }
            },
            None => self.rings[stream].replace(record, pool),
        }
    }

    /// Allocate an event for `trigger`, seed it from the rings and either post it or keep it open
    fn open_event(&mut self, trigger: Trigger, anchor: Anchor) {
        let Some(mut event) = self.events.allocate() else {
            Counters::increment(&self.shared.counters.drop_count);
            spdlog::error!(
                "No event slots left, trigger {} at {} dropped",
                trigger.sequence,
                trigger.timestamp
            );
            if let Anchor::Trigger(buffer) = anchor {
                self.shared.pool.free(buffer);
            }
            return;
        };

        let (pretrigger, posttrigger) = self.shared.control.window();
        event.open(trigger.window(pretrigger, posttrigger), trigger, anchor);
        Counters::increment(&self.shared.counters.triggers);

        match event.seed_and_drain(&mut self.rings, &self.shared.pool) {
            Fate::Completed => self.post(event),
            _ => self.active = Some(event),
        }
    }

    /// Open waiting hardware triggers, oldest first, until one stays open
    fn open_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let control = &self.shared.control;
        if control.blow_off_dma() || control.run_mode() != RunMode::External {
            for (_, buffer) in self.pending.drain(..) {
                self.shared.pool.free(buffer);
            }
            return;
        }
        while self.active.is_none() {
            let Some((trigger, buffer)) = self.pending.pop_front() else {
                break;
            };
            self.open_event(trigger, Anchor::Trigger(buffer));
        }
    }

    /// Hand a finished event to the work stage. A full queue drops the event.
    fn post(&mut self, event: Box<Event>) {
        match self.work.try_send(event) {
            Ok(()) => (),
            Err(TrySendError::Full(mut event)) | Err(TrySendError::Disconnected(mut event)) => {
                Counters::increment(&self.shared.counters.drop_count);
                spdlog::warn!(
                    "Work queue unavailable, event for trigger {} dropped",
                    event.trigger().sequence
                );
                event.free(&self.shared.pool);
                self.events.deallocate(event);
            }
        }
    }

    fn drain_releases(&mut self) {
        while let Ok(event) = self.release.try_recv() {
            self.events.deallocate(event);
        }
    }
}
