use super::buffer_pool::BufferPool;

/// Outcome of vetting the mapped buffers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckReport {
    pub checked: usize,
    pub retired: Vec<u32>,
}

impl CheckReport {
    pub fn usable(&self) -> usize {
        self.checked - self.retired.len()
    }
}

/// BufferChecker vets every mapped buffer once before data taking starts.
///
/// A buffer the driver cannot read back is retired so it is never handed to the pipeline. The
/// check runs through the driver's own isolated `probe`, so a bad mapping fails the probe instead
/// of faulting the process.
#[derive(Debug)]
pub struct BufferChecker<'a> {
    pool: &'a BufferPool,
}

impl<'a> BufferChecker<'a> {
    pub fn new(pool: &'a BufferPool) -> Self {
        Self { pool }
    }

    pub fn check(&self) -> CheckReport {
        let driver = self.pool.driver();
        let mut report = CheckReport {
            checked: self.pool.buffer_count(),
            retired: Vec::new(),
        };

        for index in 0..report.checked as u32 {
            if self.pool.is_retired(index) || driver.probe(index) {
                continue;
            }
            spdlog::warn!("Buffer {} failed its read check and is retired", index);
            match self.pool.retire(index) {
                Ok(()) => report.retired.push(index),
                Err(e) => spdlog::error!("Could not retire buffer {}: {}", index, e),
            }
        }

        if report.retired.is_empty() {
            spdlog::info!("All {} buffers passed the read check", report.checked);
        } else {
            spdlog::warn!(
                "{} of {} buffers retired by the read check",
                report.retired.len(),
                report.checked
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_driver::MemoryDriver;
    use std::sync::Arc;

    #[test]
    fn test_unreadable_buffers_are_retired() {
        let driver = Arc::new(MemoryDriver::new(8, 256));
        driver.mark_unreadable(2);
        driver.mark_unreadable(5);
        let pool = BufferPool::new(driver.clone());
        let report = BufferChecker::new(&pool).check();
        assert_eq!(report.retired, vec![2, 5]);
        assert_eq!(report.usable(), 6);
        assert!(pool.is_retired(2));
        assert_eq!(driver.retired(), 2);

        // A second pass does not retire them again
        let report = BufferChecker::new(&pool).check();
        assert!(report.retired.is_empty());
    }
}
