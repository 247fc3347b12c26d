use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use std::io::Cursor;

use super::constants::TIMING_MSG_BYTES;
use super::error::FrameError;

/// Message types of the timing system. Values of 8 and above are all triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TimingType {
    TimeSync = 0,
    Echo = 1,
    SpillStart = 2,
    SpillStop = 3,
    RunStart = 4,
    RunStop = 5,
    Trigger = 8,
}

/// Link states of the timing system receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TimingState {
    Reset = 0x0,
    WaitingSfpLos = 0x1,
    WaitingCdrLock = 0x2,
    WaitingAlign = 0x3,
    WaitingFreq = 0x4,
    WaitingLock = 0x5,
    WaitingGpsTs = 0x6,
    Running = 0x8,
    ErrRx = 0xc,
    ErrGpsTs = 0xd,
}

/// A message from the hardware timing/trigger system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingMsg {
    pub timestamp: u64,
    pub sequence: u32,
    pub tsw: u32,
}

impl TimingMsg {
    pub fn new(timestamp: u64, sequence: u32, kind: TimingType, state: TimingState) -> Self {
        Self {
            timestamp,
            sequence,
            tsw: ((state as u32) << 4) | kind as u32,
        }
    }

    /// Decode the fixed 16 byte record
    pub fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < TIMING_MSG_BYTES {
            return Err(FrameError::ShortTimingMessage(bytes.len()));
        }
        let mut cursor = Cursor::new(bytes);
        Ok(Self {
            timestamp: cursor.read_u64::<LittleEndian>()?,
            sequence: cursor.read_u32::<LittleEndian>()?,
            tsw: cursor.read_u32::<LittleEndian>()?,
        })
    }

    pub fn to_bytes(&self) -> [u8; TIMING_MSG_BYTES] {
        let mut bytes = [0u8; TIMING_MSG_BYTES];
        LittleEndian::write_u64(&mut bytes[0..8], self.timestamp);
        LittleEndian::write_u32(&mut bytes[8..12], self.sequence);
        LittleEndian::write_u32(&mut bytes[12..16], self.tsw);
        bytes
    }

    pub fn kind(&self) -> u32 {
        self.tsw & 0xf
    }

    pub fn state(&self) -> u32 {
        (self.tsw >> 4) & 0xf
    }

    /// The timing system is running and the type has its trigger bit (bit 3) set
    pub fn is_trigger(&self) -> bool {
        (self.tsw & 0xf8) == (((TimingState::Running as u32) << 4) | TimingType::Trigger as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_detection() {
        let msg = TimingMsg::new(5000, 7, TimingType::Trigger, TimingState::Running);
        let parsed = TimingMsg::parse(&msg.to_bytes()).unwrap();
        assert_eq!(parsed, msg);
        assert!(parsed.is_trigger());
        assert_eq!(parsed.state(), 8);

        // Any trigger subtype counts
        let sub = TimingMsg {
            timestamp: 0,
            sequence: 0,
            tsw: 0x8b,
        };
        assert!(sub.is_trigger());

        let sync = TimingMsg::new(5000, 7, TimingType::TimeSync, TimingState::Running);
        assert!(!sync.is_trigger());
        let not_running = TimingMsg::new(5000, 7, TimingType::Trigger, TimingState::WaitingLock);
        assert!(!not_running.is_trigger());
    }

    #[test]
    fn test_short_message() {
        assert!(matches!(
            TimingMsg::parse(&[0u8; 12]),
            Err(FrameError::ShortTimingMessage(12))
        ));
    }
}
