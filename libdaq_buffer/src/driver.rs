use std::time::Duration;

use super::constants::FLAG_EOFE;
use super::error::DriverError;

/// What the driver reports about one completed receive.
///
/// The index names a buffer in the mapped region. From the moment the driver hands out a
/// descriptor, the buffer belongs to the caller until it is given back through [`DmaDriver::free`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxDescriptor {
    pub index: u32,
    pub dest: u32,
    pub flags: u32,
    pub size: u32,
}

impl RxDescriptor {
    /// The frame was terminated with an error by the firmware
    pub fn is_eofe(&self) -> bool {
        self.flags & FLAG_EOFE != 0
    }
}

/// The interface to a DMA engine with a fixed array of index-addressed buffers.
///
/// Implementations hand out buffers through `read_frame` and take them back through `free`.
/// The `buffer` mapping must stay valid for the lifetime of the driver; the contents of an index
/// may only change while the driver owns it.
pub trait DmaDriver: Send + Sync {
    /// Number of buffers in the mapped region
    fn buffer_count(&self) -> usize;

    /// Size of each buffer, in bytes
    fn buffer_size(&self) -> usize;

    /// Wait up to `timeout` for the next received frame. `Ok(None)` on timeout.
    fn read_frame(&self, timeout: Duration) -> Result<Option<RxDescriptor>, DriverError>;

    /// Return a buffer to the driver
    fn free(&self, index: u32) -> Result<(), DriverError>;

    /// The mapped memory of a buffer
    ///
    /// # Safety
    ///
    /// The caller must own `index` (it came out of `read_frame` and has not been freed) and must
    /// not keep the slice past the call to `free`. The driver may refill the memory afterwards.
    unsafe fn buffer(&self, index: u32) -> Result<&[u8], DriverError>;

    /// Check that every location of a buffer can be read. Implementations must isolate any fault
    /// so that an unreadable buffer is reported rather than taking down the caller.
    fn probe(&self, _index: u32) -> bool {
        true
    }

    /// Remove a buffer from circulation for good
    fn retire(&self, index: u32) -> Result<(), DriverError>;
}
