use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::counters::Gauges;
use super::event::Event;
use super::pipeline::Shared;

/// The endpoints the work stage sits between
#[derive(Debug)]
pub struct WorkQueues {
    pub work: Receiver<Box<Event>>,
    pub tx_req: Sender<Box<Event>>,
    pub ack: Receiver<Box<Event>>,
    pub release: Sender<Box<Event>>,
}

/// The work stage. Moves completed events on to transmit, keeping at most `tx_frame_count` in
/// flight, and routes acknowledged events back to the receive stage for reuse.
pub fn work_run(
    shared: &Shared,
    enabled: &AtomicBool,
    queues: WorkQueues,
    tx_frame_count: usize,
    wait: Duration,
) {
    spdlog::info!("Work stage started");
    let mut pending: usize = 0;

    'run: while enabled.load(Ordering::Relaxed) {
        // Collect acknowledgements, waiting on them only when transmit is saturated
        loop {
            let acked = if pending >= tx_frame_count {
                match queues.ack.recv_timeout(wait) {
                    Ok(event) => event,
                    Err(RecvTimeoutError::Timeout) => break,
                    Err(RecvTimeoutError::Disconnected) => break 'run,
                }
            } else {
                match queues.ack.try_recv() {
                    Ok(event) => event,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => break 'run,
                }
            };
            pending = pending.saturating_sub(1);
            if queues.release.send(acked).is_err() {
                spdlog::error!("Work stage lost the release queue");
                break 'run;
            }
        }
        Gauges::set(&shared.gauges.tx_pend, pending as u64);

        if pending >= tx_frame_count {
            continue;
        }

        match queues.work.recv_timeout(wait) {
            Ok(event) => {
                if queues.tx_req.send(event).is_err() {
                    spdlog::error!("Work stage lost the transmit queue");
                    break;
                }
                pending += 1;
            }
            Err(RecvTimeoutError::Timeout) => (),
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    spdlog::info!("Work stage stopped");
}
