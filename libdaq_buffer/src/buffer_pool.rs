use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::driver::{DmaDriver, RxDescriptor};
use super::error::{BufferError, DriverError};

/// Ownership of one DMA buffer while it is held by the pipeline.
///
/// A Buffer can only be made by [`BufferPool::receive`] and only be given back by
/// [`BufferPool::release`] (or [`BufferPool::free`]), which consume it. It is deliberately not
/// `Clone`: moving the token is how ownership passes between the latency rings, events and the
/// transmitter.
#[derive(Debug, PartialEq, Eq)]
pub struct Buffer {
    index: u32,
    size: u32,
}

impl Buffer {
    /// The driver index of this buffer
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Number of valid bytes received into this buffer
    pub fn size(&self) -> u32 {
        self.size
    }
}

/// BufferPool is the ownership ledger over a driver's buffer array.
///
/// Every index the driver hands out is claimed here exactly once and returned exactly once. The
/// ledger is a pair of atomic flags per index, so the receive and transmit threads can share one
/// pool without locking.
pub struct BufferPool {
    driver: Arc<dyn DmaDriver>,
    owned: Vec<AtomicBool>,
    retired: Vec<AtomicBool>,
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_count", &self.buffer_count())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

impl BufferPool {
    /// Create the ledger for every buffer of `driver`. All buffers start owned by the driver.
    pub fn new(driver: Arc<dyn DmaDriver>) -> Self {
        let count = driver.buffer_count();
        Self {
            driver,
            owned: (0..count).map(|_| AtomicBool::new(false)).collect(),
            retired: (0..count).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    pub fn driver(&self) -> &Arc<dyn DmaDriver> {
        &self.driver
    }

    pub fn buffer_count(&self) -> usize {
        self.owned.len()
    }

    /// Take ownership of the buffer the driver reported in `desc`
    pub fn receive(&self, desc: &RxDescriptor) -> Result<Buffer, BufferError> {
        let idx = self.check_index(desc.index)?;
        if self.retired[idx].load(Ordering::Acquire) {
            return Err(BufferError::Retired(desc.index));
        }
        if self.owned[idx].swap(true, Ordering::AcqRel) {
            return Err(BufferError::AlreadyOwned(desc.index));
        }
        Ok(Buffer {
            index: desc.index,
            size: desc.size,
        })
    }

    /// Give a buffer back to the driver
    pub fn release(&self, buffer: Buffer) -> Result<(), BufferError> {
        let idx = self.check_index(buffer.index)?;
        if self.owned[idx]
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(BufferError::NotOwned(buffer.index));
        }
        if self.retired[idx].load(Ordering::Acquire) {
            // Retired buffers never go back into circulation
            return Ok(());
        }
        self.driver.free(buffer.index)?;
        Ok(())
    }

    /// Release a buffer, logging instead of returning any failure
    pub fn free(&self, buffer: Buffer) {
        let index = buffer.index;
        if let Err(e) = self.release(buffer) {
            spdlog::error!("Failed to return buffer {} to the driver: {}", index, e);
        }
    }

    /// The received bytes of a buffer. The slice lives no longer than the token borrow.
    pub fn bytes<'a>(&'a self, buffer: &'a Buffer) -> &'a [u8] {
        // SAFETY: holding the token means this pool owns the index and the driver will not
        // refill it until the token is released, which cannot happen while it is borrowed.
        match unsafe { self.driver.buffer(buffer.index) } {
            Ok(mem) => &mem[..(buffer.size as usize).min(mem.len())],
            Err(_) => &[],
        }
    }

    /// Permanently remove a buffer from circulation
    pub fn retire(&self, index: u32) -> Result<(), BufferError> {
        let idx = self.check_index(index)?;
        self.retired[idx].store(true, Ordering::Release);
        self.driver.retire(index)?;
        Ok(())
    }

    pub fn is_owned(&self, index: u32) -> bool {
        self.owned
            .get(index as usize)
            .map(|f| f.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub fn is_retired(&self, index: u32) -> bool {
        self.retired
            .get(index as usize)
            .map(|f| f.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Number of buffers currently held by the pipeline
    pub fn outstanding(&self) -> usize {
        self.owned
            .iter()
            .filter(|f| f.load(Ordering::Acquire))
            .count()
    }

    fn check_index(&self, index: u32) -> Result<usize, BufferError> {
        if (index as usize) < self.owned.len() {
            Ok(index as usize)
        } else {
            Err(BufferError::Driver(DriverError::BadIndex(
                index,
                self.owned.len(),
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_driver::MemoryDriver;
    use std::time::Duration;

    fn setup(count: usize) -> (Arc<MemoryDriver>, BufferPool) {
        let driver = Arc::new(MemoryDriver::new(count, 64));
        let pool = BufferPool::new(driver.clone());
        (driver, pool)
    }

    fn take(driver: &MemoryDriver, pool: &BufferPool, bytes: &[u8]) -> Buffer {
        driver.inject(0, 0, bytes).unwrap();
        let desc = driver.read_frame(Duration::from_millis(10)).unwrap().unwrap();
        pool.receive(&desc).unwrap()
    }

    #[test]
    fn test_receive_release_single_owner() {
        let (driver, pool) = setup(4);
        let buffer = take(&driver, &pool, &[9, 8, 7]);
        let index = buffer.index();
        assert_eq!(pool.bytes(&buffer), &[9, 8, 7]);
        assert!(pool.is_owned(index));
        assert_eq!(pool.outstanding(), 1);
        pool.release(buffer).unwrap();
        assert!(!pool.is_owned(index));
        assert_eq!(driver.free_count(index), 1);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_claiming_an_owned_index_fails() {
        let (driver, pool) = setup(2);
        let buffer = take(&driver, &pool, &[1]);
        let desc = RxDescriptor {
            index: buffer.index(),
            dest: 0,
            flags: 0,
            size: 1,
        };
        assert!(matches!(
            pool.receive(&desc),
            Err(BufferError::AlreadyOwned(_))
        ));
        pool.free(buffer);
        assert_eq!(driver.outstanding(), 0);
    }

    #[test]
    fn test_retired_buffer_is_not_returned() {
        let (driver, pool) = setup(2);
        let buffer = take(&driver, &pool, &[1]);
        let index = buffer.index();
        pool.retire(index).unwrap();
        pool.release(buffer).unwrap();
        assert_eq!(driver.free_count(index), 0);
        assert!(pool.is_retired(index));
        assert_eq!(pool.outstanding(), 0);
    }
}
