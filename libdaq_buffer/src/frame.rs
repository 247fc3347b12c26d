use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use super::buffer_pool::{Buffer, BufferPool};
use super::constants::*;
use super::error::FrameError;

/// The half-open span of timing-system ticks `[begin, end)` covered by some data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimestampRange {
    pub begin: u64,
    pub end: u64,
}

impl TimestampRange {
    pub fn new(begin: u64, end: u64) -> Self {
        Self { begin, end }
    }

    pub fn duration(&self) -> u64 {
        self.end.saturating_sub(self.begin)
    }

    /// The midpoint of the range
    pub fn center(&self) -> u64 {
        self.begin + self.duration() / 2
    }
}

/// Status bit: the frame did not span a full frame's worth of samples
pub const STATUS_MISSING: u32 = 0x1;

/// Metadata for one received data frame.
///
/// The record owns its buffer. It moves from the receive stage into a latency ring or an event
/// and its buffer is returned when the record is handed to [`FrameRecord::free`].
#[derive(Debug)]
pub struct FrameRecord {
    buffer: Buffer,
    pub range: TimestampRange,
    pub rx_sequence: u32,
    pub status: u32,
}

impl FrameRecord {
    /// Validate the frame held in `buffer` and derive its timestamp range.
    ///
    /// On error the buffer is handed back alongside the error so the caller can free it.
    pub fn parse(
        buffer: Buffer,
        pool: &BufferPool,
        rx_sequence: u32,
    ) -> Result<Self, (Buffer, FrameError)> {
        match read_range(pool.bytes(&buffer)) {
            Ok(range) => {
                let status = if range.duration() != TICKS_PER_FRAME {
                    STATUS_MISSING
                } else {
                    0
                };
                Ok(Self {
                    buffer,
                    range,
                    rx_sequence,
                    status,
                })
            }
            Err(e) => Err((buffer, e)),
        }
    }

    pub fn index(&self) -> u32 {
        self.buffer.index()
    }

    pub fn size(&self) -> u32 {
        self.buffer.size()
    }

    pub fn begin(&self) -> u64 {
        self.range.begin
    }

    pub fn end(&self) -> u64 {
        self.range.end
    }

    pub fn is_missing_samples(&self) -> bool {
        self.status & STATUS_MISSING != 0
    }

    /// The raw frame bytes, valid while the record is alive
    pub fn bytes<'a>(&'a self, pool: &'a BufferPool) -> &'a [u8] {
        pool.bytes(&self.buffer)
    }

    /// Return this frame's buffer to the driver
    pub fn free(self, pool: &BufferPool) {
        pool.free(self.buffer)
    }

    /// Give up the record, keeping the buffer
    pub fn into_buffer(self) -> Buffer {
        self.buffer
    }
}

/// Check the trailer and derive the timestamp range of a received frame.
///
/// Layout, in little-endian 64-bit words: one header word, whole sub-frames of
/// [`SUBFRAME_WORDS`] words, one trailer word. The low 24 bits of the trailer must equal the byte
/// count. The range runs from the first sub-frame timestamp to one sample past the last one.
pub fn read_range(bytes: &[u8]) -> Result<TimestampRange, FrameError> {
    let nbytes = bytes.len();
    if nbytes < WORD_SIZE * (HEADER_WORDS + TRAILER_WORDS) {
        return Err(FrameError::Truncated(nbytes));
    }
    if nbytes % WORD_SIZE != 0 {
        return Err(FrameError::Misaligned(nbytes));
    }

    let n64 = nbytes / WORD_SIZE;
    let trailer = read_word(bytes, n64 - 1)?;
    let trailer_len = (trailer & LENGTH_MASK) as u32;
    if trailer_len != nbytes as u32 {
        return Err(FrameError::TrailerMismatch(trailer_len, nbytes as u32));
    }
    if nbytes < MIN_FRAME_BYTES {
        return Err(FrameError::Truncated(nbytes));
    }

    let begin = read_word(bytes, HEADER_WORDS + SUBFRAME_TIMESTAMP_WORD)?;
    let last = n64 - TRAILER_WORDS - SUBFRAME_WORDS;
    let last_timestamp = read_word(bytes, last + SUBFRAME_TIMESTAMP_WORD)?;
    let end = last_timestamp
        .checked_add(TICKS_PER_SAMPLE)
        .ok_or(FrameError::BadRange(begin, last_timestamp))?;
    if end < begin {
        return Err(FrameError::BadRange(begin, last_timestamp));
    }
    Ok(TimestampRange::new(begin, end))
}

fn read_word(bytes: &[u8], word: usize) -> Result<u64, FrameError> {
    let mut cursor = Cursor::new(bytes);
    cursor.set_position((word * WORD_SIZE) as u64);
    Ok(cursor.read_u64::<LittleEndian>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulator::build_data_frame;

    #[test]
    fn test_range_from_subframes() {
        let frame = build_data_frame(TimestampRange::new(1000, 1999), 3);
        let range = match read_range(&frame) {
            Ok(r) => r,
            Err(e) => panic!("{e}"),
        };
        assert_eq!(range, TimestampRange::new(1000, 1999));
    }

    #[test]
    fn test_trailer_mismatch() {
        let mut frame = vec![0u8; 96];
        frame[88..96].copy_from_slice(&100u64.to_le_bytes());
        assert!(matches!(
            read_range(&frame),
            Err(FrameError::TrailerMismatch(100, 96))
        ));
    }

    #[test]
    fn test_short_and_misaligned_frames() {
        assert!(matches!(read_range(&[0u8; 8]), Err(FrameError::Truncated(8))));
        assert!(matches!(read_range(&[0u8; 20]), Err(FrameError::Misaligned(20))));
        // Trailer agrees, but no room for a sub-frame
        let mut frame = vec![0u8; 16];
        frame[8..16].copy_from_slice(&16u64.to_le_bytes());
        assert!(matches!(read_range(&frame), Err(FrameError::Truncated(16))));
    }

    #[test]
    fn test_timestamp_at_end_of_clock() {
        let mut frame = build_data_frame(TimestampRange::new(0, 0), 1);
        let word = (HEADER_WORDS + SUBFRAME_TIMESTAMP_WORD) * WORD_SIZE;
        frame[word..word + WORD_SIZE].copy_from_slice(&(u64::MAX - 3).to_le_bytes());
        assert!(matches!(
            read_range(&frame),
            Err(FrameError::BadRange(b, l)) if b == u64::MAX - 3 && l == u64::MAX - 3
        ));
    }

    #[test]
    fn test_last_subframe_before_first() {
        let mut frame = build_data_frame(TimestampRange::new(10_000, 20_000), 2);
        let second = (HEADER_WORDS + SUBFRAME_WORDS + SUBFRAME_TIMESTAMP_WORD) * WORD_SIZE;
        frame[second..second + WORD_SIZE].copy_from_slice(&500u64.to_le_bytes());
        assert!(matches!(
            read_range(&frame),
            Err(FrameError::BadRange(10_000, 500))
        ));
    }
}
