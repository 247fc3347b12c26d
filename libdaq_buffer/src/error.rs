use std::path::PathBuf;
use thiserror::Error;

use super::constants::*;

#[derive(Debug, Clone, Error)]
pub enum DriverError {
    #[error("DMA driver was given buffer index {0} which is outside of the mapped range 0..{1}")]
    BadIndex(u32, usize),
    #[error("DMA driver was asked to free buffer {0} which it already owns")]
    NotOutstanding(u32),
    #[error("DMA driver has no free buffers available")]
    Exhausted,
    #[error("DMA driver frame of {0} bytes does not fit in a {1} byte buffer")]
    Oversize(usize, usize),
    #[error("DMA driver has been shut down")]
    Closed,
}

#[derive(Debug, Clone, Error)]
pub enum BufferError {
    #[error("BufferPool failed due to driver error: {0}")]
    Driver(#[from] DriverError),
    #[error("BufferPool was handed buffer {0} which the pipeline already owns")]
    AlreadyOwned(u32),
    #[error("BufferPool was asked to release buffer {0} which the pipeline does not own")]
    NotOwned(u32),
    #[error("BufferPool was handed buffer {0} which has been retired")]
    Retired(u32),
}

#[derive(Debug, Clone, Error)]
pub enum FrameError {
    #[error("Frame of {0} bytes is too short; expected at least {min} bytes", min=MIN_FRAME_BYTES)]
    Truncated(usize),
    #[error("Frame of {0} bytes is not a whole number of 64-bit words")]
    Misaligned(usize),
    #[error("Frame trailer length {0} does not match the received byte count {1}")]
    TrailerMismatch(u32, u32),
    #[error("Frame sub-frame timestamps {0} to {1} do not form a valid range")]
    BadRange(u64, u64),
    #[error("Timing message of {0} bytes is too short; expected {size} bytes", size=TIMING_MSG_BYTES)]
    ShortTimingMessage(usize),
    #[error("Frame could not be read: {0}")]
    IOError(String),
}

impl From<std::io::Error> for FrameError {
    fn from(value: std::io::Error) -> Self {
        Self::IOError(value.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Config field {0} has invalid value {1}")]
    InvalidValue(&'static str, String),
}

#[derive(Debug, Error)]
pub enum TransmitError {
    #[error("Transmit failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Transmit wrote {0} bytes of a {1} byte message")]
    ShortWrite(usize, usize),
    #[error("Transmit failed because there is no connection")]
    NotConnected,
}

#[derive(Debug, Error)]
pub enum DaqBufferError {
    #[error("DaqBuffer failed due to configuration error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("DaqBuffer failed due to transmit error: {0}")]
    TransmitError(#[from] TransmitError),
    #[error("DaqBuffer failed to spawn the {0} thread: {1}")]
    SpawnError(&'static str, std::io::Error),
    #[error("DaqBuffer is already open")]
    AlreadyOpen,
    #[error("DaqBuffer failed to join the {0} thread")]
    JoinError(&'static str),
}
