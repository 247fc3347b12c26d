// Timing system
/// Nanoseconds per timing-system clock tick
pub const CLOCK_PERIOD_NS: u64 = 20;
/// Clock ticks between ADC samples
pub const TICKS_PER_SAMPLE: u64 = 25;
/// Samples carried by one complete DMA frame
pub const SAMPLES_PER_FRAME: u64 = 1024;
/// Elapsed ticks covered by one complete DMA frame
pub const TICKS_PER_FRAME: u64 = TICKS_PER_SAMPLE * SAMPLES_PER_FRAME;

/// Convert a period in microseconds to timing-system clock ticks (rounded)
pub const fn ticks_from_usecs(period: u64) -> u64 {
    (1000 * period + CLOCK_PERIOD_NS / 2) / CLOCK_PERIOD_NS
}

// Streams
/// Number of data-producing streams (destinations 0 and 1)
pub const N_DATA_STREAMS: usize = 2;
/// Mask with one bit set per data stream
pub const ALL_STREAMS_MASK: u32 = (1 << N_DATA_STREAMS) - 1;
/// Destination of the timing/trigger stream
pub const TIMING_DEST: u32 = 2;
/// Receive flag: frame ended with an error
pub const FLAG_EOFE: u32 = 0x1;

// Incoming frame layout, in 64-bit words
pub const WORD_SIZE: usize = 8;
pub const HEADER_WORDS: usize = 1;
pub const TRAILER_WORDS: usize = 1;
pub const SUBFRAME_WORDS: usize = 30;
/// Word offset of the timestamp inside one sub-frame
pub const SUBFRAME_TIMESTAMP_WORD: usize = 1;
/// Length field mask for header and trailer words
pub const LENGTH_MASK: u64 = 0xff_ffff;
/// The smallest frame that carries a timestamp range
pub const MIN_FRAME_BYTES: usize = (HEADER_WORDS + SUBFRAME_WORDS + TRAILER_WORDS) * WORD_SIZE;

// Timing message
pub const TIMING_MSG_BYTES: usize = 16;

// Outgoing message
pub const DAQ_HEADER_BYTES: usize = 16;

// Pipeline defaults
pub const DEFAULT_LATENCY_DEPTH: usize = 10 - 1;
pub const DEFAULT_TX_FRAME_COUNT: usize = 100;
pub const DEFAULT_WAIT_TIME_MS: u64 = 1;
pub const DEFAULT_HALF_WINDOW: u64 = 2000;
pub const DEFAULT_BUFFER_COUNT: usize = 800;
pub const DEFAULT_BUFFER_SIZE: usize = 256 * 1024;
/// Delay after a failed send before the connection is dropped
pub const DEFAULT_TX_ERROR_DELAY_MS: u64 = 1000;
/// Software trigger period, one second
pub const DEFAULT_SOFT_TRIGGER_PERIOD_US: u64 = 1000 * 1000;
/// Hardware triggers held back while an event is open
pub const MAX_PENDING_TRIGGERS: usize = 16;
