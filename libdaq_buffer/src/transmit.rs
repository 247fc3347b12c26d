use byteorder::{ByteOrder, LittleEndian};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::io::{ErrorKind, IoSlice, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::constants::DAQ_HEADER_BYTES;
use super::counters::{Counters, Gauges};
use super::error::TransmitError;
use super::event::Event;
use super::pipeline::Shared;

/// The header in front of every outgoing event. Four little-endian u32.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DaqHeader {
    /// Total message size in bytes, header included
    pub frame_size: u32,
    pub tx_sequence: u32,
    /// Receive sequence number of the earliest frame in the event
    pub rx_sequence: u32,
    /// Trigger source of the event
    pub type_id: u32,
}

impl DaqHeader {
    pub fn to_bytes(&self) -> [u8; DAQ_HEADER_BYTES] {
        let mut bytes = [0u8; DAQ_HEADER_BYTES];
        LittleEndian::write_u32_into(
            &[self.frame_size, self.tx_sequence, self.rx_sequence, self.type_id],
            &mut bytes,
        );
        bytes
    }
}

/// Transmitter owns the outgoing connection.
///
/// The connection is swapped by the control plane and used by the transmit thread, so it sits
/// behind the pipeline's only mutex.
#[derive(Default)]
pub struct Transmitter {
    connection: Mutex<Option<Box<dyn Write + Send>>>,
}

impl std::fmt::Debug for Transmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transmitter")
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Transmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a TCP connection to the event receiver, replacing any existing one
    pub fn connect(&self, address: &str, port: u16) -> Result<(), TransmitError> {
        let stream = TcpStream::connect((address, port))?;
        stream.set_nodelay(true)?;
        spdlog::info!("Transmitter connected to {}:{}", address, port);
        self.attach(Box::new(stream));
        Ok(())
    }

    /// Use an arbitrary writer as the connection
    pub fn attach(&self, writer: Box<dyn Write + Send>) {
        *self.lock() = Some(writer);
    }

    pub fn disconnect(&self) {
        if self.lock().take().is_some() {
            spdlog::info!("Transmitter disconnected");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.lock().is_some()
    }

    /// Write one event as a single vectored message. Returns the number of bytes sent.
    pub fn send(&self, event: &Event, shared: &Shared) -> Result<usize, TransmitError> {
        let mut guard = self.lock();
        let writer = guard.as_mut().ok_or(TransmitError::NotConnected)?;

        let frame_size = DAQ_HEADER_BYTES + event.payload_size();
        let header = DaqHeader {
            frame_size: frame_size as u32,
            tx_sequence: shared.tx_sequence.fetch_add(1, Ordering::Relaxed),
            rx_sequence: event.rx_sequence(),
            type_id: event.trigger().source as u32,
        }
        .to_bytes();

        let mut slices = Vec::with_capacity(1 + event.n_frames());
        slices.push(IoSlice::new(&header));
        for record in event.frames() {
            slices.push(IoSlice::new(record.bytes(&shared.pool)));
        }
        write_all_vectored(writer.as_mut(), &mut slices, frame_size)?;
        writer.flush()?;
        Ok(frame_size)
    }

    fn lock(&self) -> MutexGuard<'_, Option<Box<dyn Write + Send>>> {
        match self.connection.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn write_all_vectored(
    writer: &mut dyn Write,
    mut slices: &mut [IoSlice<'_>],
    total: usize,
) -> Result<(), TransmitError> {
    let mut written = 0;
    while !slices.is_empty() {
        match writer.write_vectored(slices) {
            Ok(0) => return Err(TransmitError::ShortWrite(written, total)),
            Ok(n) => {
                written += n;
                IoSlice::advance_slices(&mut slices, n);
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => (),
            Err(e) => return Err(TransmitError::IOError(e)),
        }
    }
    Ok(())
}

/// The transmit stage. Sends each requested event, returns its buffers and acknowledges it.
///
/// A failed send blows off transmission, then after `error_delay` drops the connection. Sending
/// resumes only once the control plane reconnects.
pub fn transmit_run(
    shared: &Shared,
    enabled: &AtomicBool,
    tx_req: Receiver<Box<Event>>,
    ack: Sender<Box<Event>>,
    wait: Duration,
    error_delay: Duration,
) {
    spdlog::info!("Transmit stage started");
    while enabled.load(Ordering::Relaxed) {
        let mut event = match tx_req.recv_timeout(wait) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        if !shared.control.blow_off_tx() && shared.transmitter.is_connected() {
            match shared.transmitter.send(&event, shared) {
                Ok(size) => {
                    Counters::increment(&shared.counters.tx_count);
                    Counters::add(&shared.counters.tx_total, size as u64);
                    Gauges::set(&shared.gauges.tx_size, size as u64);
                }
                Err(e) => {
                    Counters::increment(&shared.counters.tx_errors);
                    shared.control.set_blow_off_tx(true);
                    spdlog::error!(
                        "Transmit failed, sending is disabled until reconnected: {}",
                        e
                    );
                    std::thread::sleep(error_delay);
                    shared.transmitter.disconnect();
                }
            }
        }

        event.free(&shared.pool);
        if let Err(e) = ack.send(event) {
            spdlog::error!("Transmit stage could not acknowledge an event: {}", e);
            break;
        }
    }
    spdlog::info!("Transmit stage stopped");
}
