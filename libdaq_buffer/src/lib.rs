//! # daq_buffer
//!
//! daq_buffer is the event assembly core of a data acquisition node, written in Rust. It
//! receives fixed size DMA frames from two free running waveform streams and a stream of
//! timing/trigger messages, holds a short history of each data stream, and when a trigger
//! arrives it collects every frame overlapping a time window around the trigger into one event.
//! Completed events are sent downstream over TCP as a single message.
//!
//! ## Installation
//!
//! The only method of install is from source. To build and install the CLI use
//! `cargo install --path ./daq_buffer_cli` from the top level repository.
//!
//! ## Pipeline
//!
//! Three threads share a pool of driver buffers:
//!
//! - receive: classifies every frame the driver delivers. Data frames go into a per-stream
//!   latency ring (the last nine frames by default) or into the open event. Trigger messages
//!   open an event, which first takes what it needs out of the rings.
//! - work: forwards completed events to transmit, keeping at most `tx_frame_count` in flight,
//!   and recycles acknowledged event slots.
//! - transmit: writes each event as a 16 byte header followed by the raw frames, stream 0
//!   first, then returns the buffers to the driver.
//!
//! Every buffer is owned by exactly one place at a time. Ownership is an unclonable
//! [`buffer_pool::Buffer`] token that is moved between the rings, events and queues and
//! consumed when the buffer is returned.
//!
//! ## Configuration
//!
//! The YAML format of a configuration file is as follows:
//!
//! ```yml
//! buffer_count: 800
//! buffer_size: 262144
//! latency_depth: 9
//! tx_frame_count: 100
//! queue_depth: 800
//! wait_time_ms: 1
//! pretrigger: 2000
//! posttrigger: 2000
//! run_mode: Idle
//! naccept: 1
//! nframes: 1
//! period_us: 1000000
//! tx_address: null
//! tx_port: 8991
//! tx_error_delay_ms: 1000
//! emulator:
//!   enabled: true
//!   frame_period_us: 1000
//!   subframes: 32
//!   trigger_period: 10
//!   stream_skew: 6400
//! run_seconds: null
//! ```
//!
//! Window and skew values are in timing system clock ticks (20 ns). The software trigger period
//! is in microseconds; in software mode an event is opened whenever a stream 0 frame crosses a
//! multiple of the period, or on every frame if it is zero, thinned to `naccept` of `nframes`.
//!
//! ## Output
//!
//! Each event on the wire is:
//!
//! ```text
//! frame_size: u32   total bytes, header included
//! tx_sequence: u32  count of events sent
//! rx_sequence: u32  receive sequence of the earliest frame in the event
//! type_id: u32      0 software trigger, 1 hardware trigger
//! frames...         raw DMA frames, stream 0 then stream 1, in receipt order
//! ```
pub mod buf_checker;
pub mod buffer_pool;
pub mod config;
pub mod constants;
pub mod counters;
pub mod daq_buffer;
pub mod driver;
pub mod emulator;
pub mod error;
pub mod event;
pub mod frame;
pub mod latency;
pub mod memory_driver;
pub mod pipeline;
pub mod receive;
pub mod soft_trigger;
pub mod timing_msg;
pub mod transmit;
pub mod work;

#[cfg(test)]
mod testing;
