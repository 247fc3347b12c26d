use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::config::EmulatorParams;
use super::constants::*;
use super::error::DaqBufferError;
use super::frame::TimestampRange;
use super::memory_driver::MemoryDriver;
use super::timing_msg::{TimingMsg, TimingState, TimingType};

/// Build a well formed data frame covering `range` with `nsub` sub-frames.
///
/// Sub-frame timestamps are spread evenly from `range.begin` to one sample before `range.end`,
/// so that [`crate::frame::read_range`] gives back `range` exactly. With a single sub-frame the
/// frame covers one sample starting at `range.begin`.
pub fn build_data_frame(range: TimestampRange, nsub: usize) -> Vec<u8> {
    let nsub = nsub.max(1);
    let n64 = HEADER_WORDS + nsub * SUBFRAME_WORDS + TRAILER_WORDS;
    let nbytes = (n64 * WORD_SIZE) as u64;
    let last = range.end.saturating_sub(TICKS_PER_SAMPLE).max(range.begin);

    let mut words = vec![0u64; n64];
    words[0] = nbytes & LENGTH_MASK;
    for sub in 0..nsub {
        let timestamp = if nsub == 1 {
            range.begin
        } else {
            range.begin + (last - range.begin) * sub as u64 / (nsub as u64 - 1)
        };
        let base = HEADER_WORDS + sub * SUBFRAME_WORDS;
        words[base] = sub as u64;
        words[base + SUBFRAME_TIMESTAMP_WORD] = timestamp;
    }
    words[n64 - 1] = nbytes & LENGTH_MASK;

    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

/// Emulator stands in for the front end electronics.
///
/// It runs its own thread which writes frames for both data streams into a [`MemoryDriver`] at a
/// fixed cadence, each covering one full frame of samples, and a hardware trigger message every
/// `trigger_period` frames. The second stream lags the first by `stream_skew` ticks.
#[derive(Debug)]
pub struct Emulator {
    is_running: Arc<AtomicBool>,
    frames: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl Emulator {
    pub fn start(driver: Arc<MemoryDriver>, params: EmulatorParams) -> Result<Self, DaqBufferError> {
        let is_running = Arc::new(AtomicBool::new(true));
        let frames = Arc::new(AtomicU64::new(0));
        let thread_running = is_running.clone();
        let thread_frames = frames.clone();
        let handle = std::thread::Builder::new()
            .name(String::from("emulator"))
            .spawn(move || emulate(driver, params, thread_running, thread_frames))
            .map_err(|e| DaqBufferError::SpawnError("emulator", e))?;
        spdlog::info!("Emulator started");
        Ok(Self {
            is_running,
            frames,
            handle: Some(handle),
        })
    }

    /// Number of frame periods generated so far
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn stop(&mut self) {
        self.is_running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                spdlog::error!("Emulator thread panicked");
            }
            spdlog::info!("Emulator stopped after {} frames", self.frames());
        }
    }
}

impl Drop for Emulator {
    fn drop(&mut self) {
        self.stop();
    }
}

fn emulate(
    driver: Arc<MemoryDriver>,
    params: EmulatorParams,
    is_running: Arc<AtomicBool>,
    frames: Arc<AtomicU64>,
) {
    let period = Duration::from_micros(params.frame_period_us.max(1));
    let wait = Duration::from_millis(10);
    let mut timestamp = TICKS_PER_FRAME;
    let mut trigger_sequence = 0u32;
    let mut frame_number = 0u64;
    let mut next = Instant::now();

    while is_running.load(Ordering::Relaxed) {
        for stream in 0..N_DATA_STREAMS as u64 {
            let begin = timestamp.saturating_sub(stream * params.stream_skew);
            let bytes = build_data_frame(
                TimestampRange::new(begin, begin + TICKS_PER_FRAME),
                params.subframes,
            );
            if let Err(e) = driver.inject_wait(stream as u32, 0, &bytes, wait) {
                spdlog::debug!("Emulator dropped a frame on stream {}: {}", stream, e);
            }
        }

        if params.trigger_period != 0 && frame_number % params.trigger_period as u64 == 0 {
            // Triggers lag the data they select by about one frame
            let msg = TimingMsg::new(
                timestamp.saturating_sub(TICKS_PER_FRAME / 2),
                trigger_sequence,
                TimingType::Trigger,
                TimingState::Running,
            );
            trigger_sequence = trigger_sequence.wrapping_add(1);
            if let Err(e) = driver.inject_wait(TIMING_DEST, 0, &msg.to_bytes(), wait) {
                spdlog::debug!("Emulator dropped a trigger: {}", e);
            }
        }

        frame_number += 1;
        frames.store(frame_number, Ordering::Relaxed);
        timestamp += TICKS_PER_FRAME;

        next += period;
        let now = Instant::now();
        if next > now {
            std::thread::sleep(next - now);
        } else {
            next = now;
        }
    }
}
