use super::frame::TimestampRange;

/// Software trigger settings, read from the run control on every offered frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    /// Trigger period in clock ticks. Zero makes every offered frame a candidate.
    pub period: u64,
    pub naccept: u32,
    pub nframes: u32,
}

/// The period boundary crossed by `range`, if any.
///
/// A frame crosses a boundary when the phase of its end within the period is smaller than the
/// phase of its begin. The trigger time is the boundary itself.
pub fn period_crossing(range: &TimestampRange, period: u64) -> Option<u64> {
    if period == 0 {
        return None;
    }
    let begin = range.begin % period;
    let end = range.end % period;
    if end < begin {
        Some(range.end - end)
    } else {
        None
    }
}

/// Generates software triggers from stream 0 frames.
///
/// With a period set, a frame is a candidate when it crosses a multiple of the period and the
/// trigger sits on that boundary. Without one, every frame is a candidate and the trigger sits at
/// its midpoint. Candidates are then thinned to `naccept` out of every `nframes`; 10/2048 takes
/// ten in a row and skips the following 2038.
///
/// Frames are only offered while no event is open.
#[derive(Debug, Default)]
pub struct SoftTrigger {
    candidates: u64,
    sequence: u32,
}

impl SoftTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a frame covering `range`. Returns the trigger timestamp and sequence if accepted.
    pub fn check(&mut self, range: &TimestampRange, pacing: &Pacing) -> Option<(u64, u32)> {
        if pacing.nframes == 0 || pacing.naccept == 0 {
            return None;
        }
        let timestamp = if pacing.period == 0 {
            range.center()
        } else {
            period_crossing(range, pacing.period)?
        };

        let phase = self.candidates % pacing.nframes as u64;
        self.candidates += 1;
        if phase < pacing.naccept as u64 {
            let sequence = self.sequence;
            self.sequence = self.sequence.wrapping_add(1);
            Some((timestamp, sequence))
        } else {
            None
        }
    }

    /// Start a new run: restart the cycle and the trigger count
    pub fn reset(&mut self) {
        self.candidates = 0;
        self.sequence = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::ticks_from_usecs;

    fn every_frame(naccept: u32, nframes: u32) -> Pacing {
        Pacing {
            period: 0,
            naccept,
            nframes,
        }
    }

    #[test]
    fn test_accept_m_of_n() {
        let mut pacer = SoftTrigger::new();
        let range = TimestampRange::new(1000, 2000);
        let accepted: Vec<bool> = (0..10)
            .map(|_| pacer.check(&range, &every_frame(2, 5)).is_some())
            .collect();
        assert_eq!(
            accepted,
            vec![true, true, false, false, false, true, true, false, false, false]
        );
        assert_eq!(pacer.check(&range, &every_frame(2, 5)), Some((1500, 4)));
    }

    #[test]
    fn test_trigger_at_frame_midpoint() {
        let mut pacer = SoftTrigger::new();
        let range = TimestampRange::new(1000, 2000);
        assert_eq!(pacer.check(&range, &every_frame(1, 1)), Some((1500, 0)));
        assert_eq!(pacer.check(&range, &every_frame(1, 1)), Some((1500, 1)));
        pacer.reset();
        assert_eq!(pacer.check(&range, &every_frame(0, 1)), None);
        assert_eq!(pacer.check(&range, &every_frame(1, 1)), Some((1500, 0)));
    }

    #[test]
    fn test_period_boundary_crossing() {
        // One millisecond period
        let period = ticks_from_usecs(1000);
        assert_eq!(period, 50_000);
        assert_eq!(
            period_crossing(&TimestampRange::new(99_000, 101_000), period),
            Some(100_000)
        );
        assert_eq!(
            period_crossing(&TimestampRange::new(101_000, 103_000), period),
            None
        );
        assert_eq!(period_crossing(&TimestampRange::new(0, 10), 0), None);
    }

    #[test]
    fn test_periodic_trigger_on_boundary() {
        let mut pacer = SoftTrigger::new();
        let pacing = Pacing {
            period: 10_000,
            naccept: 1,
            nframes: 1,
        };
        let fired: Vec<Option<(u64, u32)>> = (0..6u64)
            .map(|n| pacer.check(&TimestampRange::new(n * 4000, n * 4000 + 4000), &pacing))
            .collect();
        assert_eq!(
            fired,
            vec![None, None, Some((10_000, 0)), None, Some((20_000, 1)), None]
        );
    }
}
