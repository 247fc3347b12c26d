use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};

use super::constants::*;
use super::error::ConfigError;
use super::soft_trigger::Pacing;

/// How events are triggered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RunMode {
    /// Data flows through the latency rings but no events are built
    #[default]
    Idle,
    /// Events are opened by hardware trigger messages on the timing stream
    External,
    /// Events are opened by the software pacer from stream 0 frames
    Software,
}

impl RunMode {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::External,
            2 => Self::Software,
            _ => Self::Idle,
        }
    }
}

/// Parameters for the frame emulator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmulatorParams {
    pub enabled: bool,
    pub frame_period_us: u64,
    pub subframes: usize,
    /// Frames between hardware triggers, zero for none
    pub trigger_period: u32,
    /// Ticks by which stream 1 trails stream 0
    pub stream_skew: u64,
}

impl Default for EmulatorParams {
    fn default() -> Self {
        Self {
            enabled: true,
            frame_period_us: 1000,
            subframes: 32,
            trigger_period: 10,
            stream_skew: TICKS_PER_FRAME / 4,
        }
    }
}

/// Startup configuration of the DaqBuffer. Serializable to YAML using serde and serde_yaml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub buffer_count: usize,
    pub buffer_size: usize,
    pub latency_depth: usize,
    pub tx_frame_count: usize,
    pub queue_depth: usize,
    pub wait_time_ms: u64,
    pub pretrigger: u64,
    pub posttrigger: u64,
    pub run_mode: RunMode,
    pub naccept: u32,
    pub nframes: u32,
    /// Software trigger period in microseconds, zero to offer every stream 0 frame
    pub period_us: u64,
    pub tx_address: Option<String>,
    pub tx_port: u16,
    pub tx_error_delay_ms: u64,
    pub emulator: EmulatorParams,
    pub run_seconds: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            buffer_count: DEFAULT_BUFFER_COUNT,
            buffer_size: DEFAULT_BUFFER_SIZE,
            latency_depth: DEFAULT_LATENCY_DEPTH,
            tx_frame_count: DEFAULT_TX_FRAME_COUNT,
            queue_depth: DEFAULT_BUFFER_COUNT,
            wait_time_ms: DEFAULT_WAIT_TIME_MS,
            pretrigger: DEFAULT_HALF_WINDOW,
            posttrigger: DEFAULT_HALF_WINDOW,
            run_mode: RunMode::Idle,
            naccept: 1,
            nframes: 1,
            period_us: DEFAULT_SOFT_TRIGGER_PERIOD_US,
            tx_address: None,
            tx_port: 8991,
            tx_error_delay_ms: DEFAULT_TX_ERROR_DELAY_MS,
            emulator: EmulatorParams::default(),
            run_seconds: None,
        }
    }
}

impl Config {
    /// Read the configuration in a YAML file
    /// Returns a Config if successful
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;

        Ok(serde_yaml::from_str::<Self>(&yaml_str)?)
    }

    /// Check the values which would stall or break the pipeline
    pub fn is_valid(&self) -> Result<(), ConfigError> {
        if self.buffer_count == 0 {
            return Err(ConfigError::InvalidValue(
                "buffer_count",
                self.buffer_count.to_string(),
            ));
        }
        if self.buffer_size < MIN_FRAME_BYTES {
            return Err(ConfigError::InvalidValue(
                "buffer_size",
                self.buffer_size.to_string(),
            ));
        }
        if self.latency_depth == 0 {
            return Err(ConfigError::InvalidValue(
                "latency_depth",
                self.latency_depth.to_string(),
            ));
        }
        if self.tx_frame_count == 0 {
            return Err(ConfigError::InvalidValue(
                "tx_frame_count",
                self.tx_frame_count.to_string(),
            ));
        }
        if self.queue_depth == 0 {
            return Err(ConfigError::InvalidValue(
                "queue_depth",
                self.queue_depth.to_string(),
            ));
        }
        if self.naccept > self.nframes || self.nframes == 0 {
            return Err(ConfigError::InvalidValue(
                "naccept/nframes",
                format!("{}/{}", self.naccept, self.nframes),
            ));
        }
        Ok(())
    }

    pub fn has_tx_address(&self) -> bool {
        self.tx_address.is_some()
    }
}

/// Runtime settings, written by the control plane and read by the receive stage on every frame
#[derive(Debug)]
pub struct RunControl {
    blow_off_dma: AtomicBool,
    blow_off_tx: AtomicBool,
    run_mode: AtomicU8,
    naccept: AtomicU32,
    nframes: AtomicU32,
    period: AtomicU64,
    pretrigger: AtomicU64,
    posttrigger: AtomicU64,
}

impl RunControl {
    pub fn new(config: &Config) -> Self {
        Self {
            blow_off_dma: AtomicBool::new(false),
            blow_off_tx: AtomicBool::new(!config.has_tx_address()),
            run_mode: AtomicU8::new(config.run_mode as u8),
            naccept: AtomicU32::new(config.naccept),
            nframes: AtomicU32::new(config.nframes),
            period: AtomicU64::new(ticks_from_usecs(config.period_us)),
            pretrigger: AtomicU64::new(config.pretrigger),
            posttrigger: AtomicU64::new(config.posttrigger),
        }
    }

    /// Back to the safe state: idle, nothing blown off
    pub fn reset(&self) {
        self.blow_off_dma.store(false, Ordering::Relaxed);
        self.blow_off_tx.store(false, Ordering::Relaxed);
        self.set_run_mode(RunMode::Idle);
    }

    pub fn blow_off_dma(&self) -> bool {
        self.blow_off_dma.load(Ordering::Relaxed)
    }

    pub fn set_blow_off_dma(&self, state: bool) {
        self.blow_off_dma.store(state, Ordering::Relaxed)
    }

    pub fn blow_off_tx(&self) -> bool {
        self.blow_off_tx.load(Ordering::Relaxed)
    }

    pub fn set_blow_off_tx(&self, state: bool) {
        self.blow_off_tx.store(state, Ordering::Relaxed)
    }

    pub fn run_mode(&self) -> RunMode {
        RunMode::from_u8(self.run_mode.load(Ordering::Relaxed))
    }

    pub fn set_run_mode(&self, mode: RunMode) {
        self.run_mode.store(mode as u8, Ordering::Relaxed)
    }

    pub fn pacing(&self) -> Pacing {
        Pacing {
            period: self.period.load(Ordering::Relaxed),
            naccept: self.naccept.load(Ordering::Relaxed),
            nframes: self.nframes.load(Ordering::Relaxed),
        }
    }

    pub fn set_pacing(&self, naccept: u32, nframes: u32) {
        self.naccept.store(naccept, Ordering::Relaxed);
        self.nframes.store(nframes, Ordering::Relaxed);
    }

    /// Software trigger period in clock ticks
    pub fn set_period(&self, period: u64) {
        self.period.store(period, Ordering::Relaxed);
    }

    /// Trigger window as (pretrigger, posttrigger) ticks
    pub fn window(&self) -> (u64, u64) {
        (
            self.pretrigger.load(Ordering::Relaxed),
            self.posttrigger.load(Ordering::Relaxed),
        )
    }

    pub fn set_window(&self, pretrigger: u64, posttrigger: u64) {
        self.pretrigger.store(pretrigger, Ordering::Relaxed);
        self.posttrigger.store(posttrigger, Ordering::Relaxed);
    }
}
