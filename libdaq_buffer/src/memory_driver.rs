use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::time::Duration;

use super::driver::{DmaDriver, RxDescriptor};
use super::error::DriverError;

const STATE_FREE: u8 = 0;
const STATE_FILLING: u8 = 1;
const STATE_READY: u8 = 2;
const STATE_LOANED: u8 = 3;
const STATE_RETIRED: u8 = 4;

/// One buffer of the emulated mapped region
struct Slot(UnsafeCell<Box<[u8]>>);

// SAFETY: a slot is written only by the injector between popping its index from the free queue
// and publishing it on the ready queue. It is read only by whoever holds the index after
// `read_frame`. The channels order those two phases, so reads and writes never overlap.
unsafe impl Sync for Slot {}

/// A software DMA engine backed by heap buffers.
///
/// The injector side (`inject`, `inject_wait`) plays the role of the firmware: it takes a free
/// buffer, fills it and queues it for `read_frame`. The reader side implements [`DmaDriver`].
/// Every free is counted per index so ownership can be audited.
pub struct MemoryDriver {
    slots: Vec<Slot>,
    buffer_size: usize,
    states: Vec<AtomicU8>,
    free_counts: Vec<AtomicU32>,
    unreadable: Vec<AtomicBool>,
    free_tx: Sender<u32>,
    free_rx: Receiver<u32>,
    ready_tx: Sender<RxDescriptor>,
    ready_rx: Receiver<RxDescriptor>,
}

impl MemoryDriver {
    /// Map `buffer_count` buffers of `buffer_size` bytes, all owned by the driver
    pub fn new(buffer_count: usize, buffer_size: usize) -> Self {
        let (free_tx, free_rx) = bounded(buffer_count);
        let (ready_tx, ready_rx) = bounded(buffer_count);
        let mut slots = Vec::with_capacity(buffer_count);
        for index in 0..buffer_count {
            slots.push(Slot(UnsafeCell::new(vec![0u8; buffer_size].into_boxed_slice())));
            // The free queue is sized to hold every index
            let _ = free_tx.try_send(index as u32);
        }
        Self {
            slots,
            buffer_size,
            states: (0..buffer_count).map(|_| AtomicU8::new(STATE_FREE)).collect(),
            free_counts: (0..buffer_count).map(|_| AtomicU32::new(0)).collect(),
            unreadable: (0..buffer_count).map(|_| AtomicBool::new(false)).collect(),
            free_tx,
            free_rx,
            ready_tx,
            ready_rx,
        }
    }

    /// Fill a free buffer with `bytes` and queue it as received on `dest`.
    ///
    /// Fails with `Exhausted` if every buffer is in use.
    pub fn inject(&self, dest: u32, flags: u32, bytes: &[u8]) -> Result<u32, DriverError> {
        let index = self.pop_free(None)?;
        self.fill(index, dest, flags, bytes)
    }

    /// Like `inject`, but waits up to `timeout` for a buffer to be freed
    pub fn inject_wait(
        &self,
        dest: u32,
        flags: u32,
        bytes: &[u8],
        timeout: Duration,
    ) -> Result<u32, DriverError> {
        let index = self.pop_free(Some(timeout))?;
        self.fill(index, dest, flags, bytes)
    }

    /// How many times `index` has been returned through `free`
    pub fn free_count(&self, index: u32) -> u32 {
        self.free_counts
            .get(index as usize)
            .map(|c| c.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Number of buffers handed out by `read_frame` and not yet freed
    pub fn outstanding(&self) -> usize {
        self.count_state(STATE_LOANED)
    }

    /// Number of buffers filled and waiting to be read
    pub fn pending(&self) -> usize {
        self.ready_rx.len()
    }

    /// Number of retired buffers
    pub fn retired(&self) -> usize {
        self.count_state(STATE_RETIRED)
    }

    /// Make `probe` report a buffer as unreadable
    pub fn mark_unreadable(&self, index: u32) {
        if let Some(flag) = self.unreadable.get(index as usize) {
            flag.store(true, Ordering::Release);
        }
    }

    fn count_state(&self, state: u8) -> usize {
        self.states
            .iter()
            .filter(|s| s.load(Ordering::Acquire) == state)
            .count()
    }

    fn pop_free(&self, timeout: Option<Duration>) -> Result<u32, DriverError> {
        loop {
            let index = match timeout {
                None => match self.free_rx.try_recv() {
                    Ok(index) => index,
                    Err(TryRecvError::Empty) => return Err(DriverError::Exhausted),
                    Err(TryRecvError::Disconnected) => return Err(DriverError::Closed),
                },
                Some(t) => match self.free_rx.recv_timeout(t) {
                    Ok(index) => index,
                    Err(RecvTimeoutError::Timeout) => return Err(DriverError::Exhausted),
                    Err(RecvTimeoutError::Disconnected) => return Err(DriverError::Closed),
                },
            };
            // Retired buffers may still be sitting in the free queue; drop them here
            if self.states[index as usize]
                .compare_exchange(STATE_FREE, STATE_FILLING, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(index);
            }
        }
    }

    fn fill(&self, index: u32, dest: u32, flags: u32, bytes: &[u8]) -> Result<u32, DriverError> {
        if bytes.len() > self.buffer_size {
            self.states[index as usize].store(STATE_FREE, Ordering::Release);
            let _ = self.free_tx.try_send(index);
            return Err(DriverError::Oversize(bytes.len(), self.buffer_size));
        }
        // SAFETY: the index was just moved FREE -> FILLING by this call, nobody else can touch it
        let buf = unsafe { &mut *self.slots[index as usize].0.get() };
        buf[..bytes.len()].copy_from_slice(bytes);
        self.states[index as usize].store(STATE_READY, Ordering::Release);
        let desc = RxDescriptor {
            index,
            dest,
            flags,
            size: bytes.len() as u32,
        };
        self.ready_tx
            .try_send(desc)
            .map_err(|_| DriverError::Exhausted)?;
        Ok(index)
    }

    fn check_index(&self, index: u32) -> Result<usize, DriverError> {
        if (index as usize) < self.slots.len() {
            Ok(index as usize)
        } else {
            Err(DriverError::BadIndex(index, self.slots.len()))
        }
    }
}

impl DmaDriver for MemoryDriver {
    fn buffer_count(&self) -> usize {
        self.slots.len()
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn read_frame(&self, timeout: Duration) -> Result<Option<RxDescriptor>, DriverError> {
        match self.ready_rx.recv_timeout(timeout) {
            Ok(desc) => {
                self.states[desc.index as usize].store(STATE_LOANED, Ordering::Release);
                Ok(Some(desc))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(DriverError::Closed),
        }
    }

    fn free(&self, index: u32) -> Result<(), DriverError> {
        let idx = self.check_index(index)?;
        self.states[idx]
            .compare_exchange(STATE_LOANED, STATE_FREE, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| DriverError::NotOutstanding(index))?;
        self.free_counts[idx].fetch_add(1, Ordering::AcqRel);
        self.free_tx
            .try_send(index)
            .map_err(|_| DriverError::Closed)
    }

    unsafe fn buffer(&self, index: u32) -> Result<&[u8], DriverError> {
        let idx = self.check_index(index)?;
        // SAFETY: the caller owns the index, so the injector is not writing it
        Ok(unsafe { &*self.slots[idx].0.get() })
    }

    fn probe(&self, index: u32) -> bool {
        match self.unreadable.get(index as usize) {
            Some(flag) => !flag.load(Ordering::Acquire),
            None => false,
        }
    }

    fn retire(&self, index: u32) -> Result<(), DriverError> {
        let idx = self.check_index(index)?;
        self.states[idx].store(STATE_RETIRED, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inject_read_free() {
        let driver = MemoryDriver::new(2, 64);
        let index = match driver.inject(1, 0, &[1, 2, 3, 4]) {
            Ok(i) => i,
            Err(e) => panic!("{e}"),
        };
        let desc = driver
            .read_frame(Duration::from_millis(10))
            .unwrap()
            .unwrap();
        assert_eq!(desc.index, index);
        assert_eq!(desc.dest, 1);
        assert_eq!(desc.size, 4);
        let bytes = unsafe { driver.buffer(index).unwrap() };
        assert_eq!(&bytes[..4], &[1, 2, 3, 4]);
        assert_eq!(driver.outstanding(), 1);
        driver.free(index).unwrap();
        assert_eq!(driver.free_count(index), 1);
        assert_eq!(driver.outstanding(), 0);
    }

    #[test]
    fn test_double_free_is_refused() {
        let driver = MemoryDriver::new(1, 16);
        driver.inject(0, 0, &[0; 8]).unwrap();
        let desc = driver.read_frame(Duration::from_millis(10)).unwrap().unwrap();
        driver.free(desc.index).unwrap();
        assert!(matches!(
            driver.free(desc.index),
            Err(DriverError::NotOutstanding(_))
        ));
        assert_eq!(driver.free_count(desc.index), 1);
    }

    #[test]
    fn test_exhaustion_and_timeout() {
        let driver = MemoryDriver::new(1, 16);
        driver.inject(0, 0, &[0; 8]).unwrap();
        assert!(matches!(
            driver.inject(0, 0, &[0; 8]),
            Err(DriverError::Exhausted)
        ));
        let _ = driver.read_frame(Duration::from_millis(1)).unwrap();
        assert!(driver.read_frame(Duration::from_millis(1)).unwrap().is_none());
    }

    #[test]
    fn test_retired_buffer_leaves_circulation() {
        let driver = MemoryDriver::new(2, 16);
        driver.retire(0).unwrap();
        let first = driver.inject(0, 0, &[0; 8]).unwrap();
        assert_eq!(first, 1);
        assert!(matches!(
            driver.inject(0, 0, &[0; 8]),
            Err(DriverError::Exhausted)
        ));
        assert_eq!(driver.retired(), 1);
    }
}
