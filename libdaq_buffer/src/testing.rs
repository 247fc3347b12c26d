//! Shared fixtures for the unit tests
use std::cell::Cell;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::buffer_pool::{Buffer, BufferPool};
use super::constants::TIMING_DEST;
use super::driver::DmaDriver;
use super::emulator::build_data_frame;
use super::frame::{FrameRecord, TimestampRange};
use super::memory_driver::MemoryDriver;
use super::timing_msg::{TimingMsg, TimingState, TimingType};

pub struct Harness {
    pub driver: Arc<MemoryDriver>,
    pub pool: BufferPool,
    sequence: Cell<u32>,
}

impl Harness {
    pub fn new(buffers: usize) -> Self {
        let driver = Arc::new(MemoryDriver::new(buffers, 4096));
        let pool = BufferPool::new(driver.clone());
        Self {
            driver,
            pool,
            sequence: Cell::new(0),
        }
    }

    /// Push a data frame through the driver and parse it
    pub fn frame(&self, stream: u32, begin: u64, end: u64) -> FrameRecord {
        let bytes = build_data_frame(TimestampRange::new(begin, end), 2);
        let buffer = self.receive(stream, &bytes);
        let seq = self.sequence.get();
        self.sequence.set(seq + 1);
        match FrameRecord::parse(buffer, &self.pool, seq) {
            Ok(record) => record,
            Err((_, e)) => panic!("{e}"),
        }
    }

    /// Push a trigger message through the driver
    pub fn trigger_buffer(&self, timestamp: u64) -> Buffer {
        let msg = TimingMsg::new(timestamp, 0, TimingType::Trigger, TimingState::Running);
        self.receive(TIMING_DEST, &msg.to_bytes())
    }

    fn receive(&self, dest: u32, bytes: &[u8]) -> Buffer {
        self.driver.inject(dest, 0, bytes).unwrap();
        let desc = self
            .driver
            .read_frame(Duration::from_millis(100))
            .unwrap()
            .unwrap();
        self.pool.receive(&desc).unwrap()
    }
}

/// An in-memory connection that can be inspected after being handed to a transmitter
#[derive(Debug, Clone, Default)]
pub struct SharedWriter {
    data: Arc<Mutex<Vec<u8>>>,
}

impl SharedWriter {
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }
}

impl Write for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.data.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// A connection whose every write fails, as a dropped peer would
#[derive(Debug, Default)]
pub struct BrokenWriter;

impl Write for BrokenWriter {
    fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
        Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
