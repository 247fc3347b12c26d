use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use super::buf_checker::{BufferChecker, CheckReport};
use super::config::{Config, RunMode};
use super::constants::ticks_from_usecs;
use super::counters::{BufferStatus, StatusPoller};
use super::driver::DmaDriver;
use super::error::DaqBufferError;
use super::pipeline::{Queues, Shared};
use super::receive::ReceiveStage;
use super::transmit::transmit_run;
use super::work::{work_run, WorkQueues};

/// One pipeline thread and the flag that keeps it running
#[derive(Debug)]
struct Stage {
    name: &'static str,
    enabled: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Stage {
    fn spawn<F>(name: &'static str, task: F) -> Result<Self, DaqBufferError>
    where
        F: FnOnce(&AtomicBool) + Send + 'static,
    {
        let enabled = Arc::new(AtomicBool::new(true));
        let thread_enabled = enabled.clone();
        let handle = std::thread::Builder::new()
            .name(String::from(name))
            .spawn(move || task(&thread_enabled))
            .map_err(|e| DaqBufferError::SpawnError(name, e))?;
        Ok(Self {
            name,
            enabled,
            handle: Some(handle),
        })
    }

    fn stop(&mut self) -> Result<(), DaqBufferError> {
        self.enabled.store(false, Ordering::Relaxed);
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| DaqBufferError::JoinError(self.name)),
            None => Ok(()),
        }
    }
}

/// DaqBuffer is the event assembly pipeline and its control surface.
///
/// It owns the driver's buffers through a [`crate::buffer_pool::BufferPool`] and runs three
/// threads: receive (classify frames, build events), work (throttle and recycle) and transmit
/// (send events downstream). All other methods are the control plane and may be called from any
/// thread while the pipeline runs.
#[derive(Debug)]
pub struct DaqBuffer {
    config: Config,
    shared: Arc<Shared>,
    queues: Option<Queues>,
    rx: Option<Stage>,
    work: Option<Stage>,
    tx: Option<Stage>,
    poller: Mutex<StatusPoller>,
}

impl DaqBuffer {
    pub fn new(config: Config, driver: Arc<dyn DmaDriver>) -> Result<Self, DaqBufferError> {
        config.is_valid()?;
        let shared = Arc::new(Shared::new(driver, &config));
        Ok(Self {
            config,
            shared,
            queues: None,
            rx: None,
            work: None,
            tx: None,
            poller: Mutex::new(StatusPoller::new()),
        })
    }

    /// Vet the buffers and start the pipeline threads
    pub fn open(&mut self) -> Result<CheckReport, DaqBufferError> {
        if self.is_open() {
            return Err(DaqBufferError::AlreadyOpen);
        }

        let report = BufferChecker::new(&self.shared.pool).check();
        spdlog::info!(
            "Opening DaqBuffer with {} usable buffers of {}",
            report.usable(),
            human_bytes::human_bytes(self.shared.pool.driver().buffer_size() as f64)
        );

        let queues = Queues::new(
            self.config.queue_depth,
            self.config.tx_frame_count,
            self.shared.pool.buffer_count(),
        );
        self.queues = Some(queues.clone());
        let wait = Duration::from_millis(self.config.wait_time_ms);

        if let Err(e) = self.spawn_stages(queues, wait) {
            spdlog::error!("Failed to start the pipeline: {}", e);
            self.close();
            return Err(e);
        }
        Ok(report)
    }

    fn spawn_stages(&mut self, queues: Queues, wait: Duration) -> Result<(), DaqBufferError> {
        let shared = self.shared.clone();
        let tx_req = queues.tx_req_rx.clone();
        let ack = queues.ack_tx.clone();
        let error_delay = Duration::from_millis(self.config.tx_error_delay_ms);
        self.tx = Some(Stage::spawn("daq_tx", move |enabled| {
            transmit_run(&shared, enabled, tx_req, ack, wait, error_delay)
        })?);

        let shared = self.shared.clone();
        let work_queues = WorkQueues {
            work: queues.work_rx.clone(),
            tx_req: queues.tx_req_tx.clone(),
            ack: queues.ack_rx.clone(),
            release: queues.release_tx.clone(),
        };
        let tx_frame_count = self.config.tx_frame_count;
        self.work = Some(Stage::spawn("daq_work", move |enabled| {
            work_run(&shared, enabled, work_queues, tx_frame_count, wait)
        })?);

        let stage = ReceiveStage::new(
            self.shared.clone(),
            self.config.latency_depth,
            queues.work_tx,
            queues.release_rx,
            wait,
        );
        self.rx = Some(Stage::spawn("daq_rx", move |enabled| stage.run(enabled))?);
        Ok(())
    }

    /// Stop the threads (transmit, then work, then receive) and return every buffer still held
    pub fn close(&mut self) {
        for stage in [&mut self.tx, &mut self.work, &mut self.rx] {
            if let Some(mut stage) = stage.take() {
                if let Err(e) = stage.stop() {
                    spdlog::error!("{}", e);
                }
            }
        }

        if let Some(queues) = self.queues.take() {
            let drained = queues.drain(&self.shared);
            if drained != 0 {
                spdlog::info!("Freed {} queued events at close", drained);
            }
        }

        let outstanding = self.shared.pool.outstanding();
        if outstanding != 0 {
            spdlog::error!("DaqBuffer closed with {} buffers unaccounted for", outstanding);
        }
    }

    pub fn is_open(&self) -> bool {
        self.rx.is_some() || self.work.is_some() || self.tx.is_some()
    }

    /// Return the runtime settings to their safe state: idle, nothing blown off, the configured
    /// window and pacing. The pipeline keeps running.
    pub fn hard_reset(&self) {
        let control = &self.shared.control;
        control.reset();
        control.set_window(self.config.pretrigger, self.config.posttrigger);
        control.set_pacing(self.config.naccept, self.config.nframes);
        control.set_period(ticks_from_usecs(self.config.period_us));
        spdlog::info!("DaqBuffer hard reset");
    }

    pub fn set_config(&self, blow_off_dma: bool, blow_off_tx: bool, naccept: u32, nframes: u32) {
        let control = &self.shared.control;
        control.set_blow_off_dma(blow_off_dma);
        control.set_blow_off_tx(blow_off_tx);
        control.set_pacing(naccept, nframes);
        spdlog::info!(
            "DaqBuffer config: blow off dma {}, blow off tx {}, accept {}/{}",
            blow_off_dma,
            blow_off_tx,
            naccept,
            nframes
        );
    }

    pub fn set_run_mode(&self, mode: RunMode) {
        self.shared.control.set_run_mode(mode);
        spdlog::info!("DaqBuffer run mode set to {:?}", mode);
    }

    /// Set the trigger window in clock ticks before and after the trigger
    pub fn set_window(&self, pretrigger: u64, posttrigger: u64) {
        self.shared.control.set_window(pretrigger, posttrigger);
    }

    /// Set the trigger window and software trigger period in microseconds. The window opens
    /// `pretrigger` before the trigger and lasts `duration` in all.
    pub fn set_trigger_timing(&self, pretrigger: u64, duration: u64, period: u64) {
        let control = &self.shared.control;
        control.set_window(
            ticks_from_usecs(pretrigger),
            ticks_from_usecs(duration.saturating_sub(pretrigger)),
        );
        control.set_period(ticks_from_usecs(period));
        spdlog::info!(
            "DaqBuffer trigger window {} us ({} us before), software period {} us",
            duration,
            pretrigger,
            period
        );
    }

    /// Connect to the event receiver and resume sending
    pub fn enable_tx(&self, address: &str, port: u16) -> Result<(), DaqBufferError> {
        self.shared.transmitter.disconnect();
        self.shared.transmitter.connect(address, port)?;
        self.shared.tx_sequence.store(0, Ordering::Relaxed);
        self.shared.control.set_blow_off_tx(false);
        Ok(())
    }

    /// Send events to `writer` instead of a network connection
    pub fn enable_tx_writer(&self, writer: Box<dyn Write + Send>) {
        self.shared.transmitter.attach(writer);
        self.shared.control.set_blow_off_tx(false);
    }

    pub fn disable_tx(&self) {
        self.shared.control.set_blow_off_tx(true);
        self.shared.transmitter.disconnect();
    }

    pub fn start_run(&self) {
        self.shared.start_run();
        spdlog::info!("DaqBuffer run started");
    }

    pub fn reset_counters(&self) {
        self.shared.counters.reset();
        self.lock_poller().restart();
    }

    /// Counters, levels and the rates since the previous call
    pub fn status(&self) -> BufferStatus {
        self.lock_poller().poll(
            &self.shared.counters,
            &self.shared.gauges,
            self.shared.pool.buffer_count(),
        )
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn lock_poller(&self) -> std::sync::MutexGuard<'_, StatusPoller> {
        match self.poller.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for DaqBuffer {
    fn drop(&mut self) {
        self.close();
    }
}
