//! Receiver runtime
//!
//! The data-plane worker. Binds the inbound listener (probing upward
//! from the configured port), signals readiness so the lifecycle
//! controller may tell the board to dial back, accepts exactly one
//! connection, then decodes framed trigger packets and fans each one
//! out to the downstream sinks and the optional calibration stream.
//!
//! Ownership: this thread is the only toucher of the listener, the
//! accepted socket, the sequence state, the calibration file handle and
//! the bounded window. Cancellation is cooperative through the shared
//! `running` flag, observed between accept polls and between packets.

use std::io::{ErrorKind, Read};
use std::net::{Ipv4Addr, Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cib_protocol::{HsiEvent, RawFrame, SequenceTracker, TcpHeader, TriggerWord};
use tracing::{debug, error, info, warn};

use crate::calibration::CalibrationStream;
use crate::error::{BridgeError, Result};
use crate::monitoring::BridgeStats;
use crate::sink::HsiSink;

/// Everything the worker thread needs, handed over at spawn.
pub(crate) struct ReceiverTask {
    pub port: u16,
    pub timeout: Duration,
    pub trigger_bit: u32,
    pub run_number: u32,
    pub running: Arc<AtomicBool>,
    pub ready: Arc<AtomicBool>,
    pub stats: Arc<BridgeStats>,
    pub sink: Arc<dyn HsiSink>,
    pub calibration: Option<CalibrationStream>,
}

/// Spawn the worker thread.
///
/// The returned channel carries exactly one message: the bind outcome,
/// with the chosen port on success. It is sent before readiness is
/// signalled, so the controller can fail `start` fast on a dead bind.
pub(crate) fn spawn(task: ReceiverTask) -> Result<(JoinHandle<()>, mpsc::Receiver<Result<u16>>)> {
    let (bind_tx, bind_rx) = mpsc::channel();
    let handle = thread::Builder::new()
        .name("cib-receiver".to_string())
        .spawn(move || run(task, bind_tx))
        .map_err(|e| BridgeError::module(format!("Failed to spawn receiver thread: {e}")))?;
    Ok((handle, bind_rx))
}

fn run(mut task: ReceiverTask, bind_tx: mpsc::Sender<Result<u16>>) {
    let stream = match wait_for_connection(&task, bind_tx) {
        Some(stream) => stream,
        None => {
            task.ready.store(false, Ordering::SeqCst);
            return;
        }
    };

    info!("Connection received: start reading");
    read_loop(&mut task, stream);

    task.ready.store(false, Ordering::SeqCst);
    debug!("End of receiver loop: stop receiving data from the CIB");
}

/// Bind, report the bind result, signal readiness, and poll the accept
/// helper until a connection lands or the run is cancelled.
fn wait_for_connection(
    task: &ReceiverTask,
    bind_tx: mpsc::Sender<Result<u16>>,
) -> Option<TcpStream> {
    let (listener, port) = match bind_receiver(task.port) {
        Ok(bound) => bound,
        Err(e) => {
            let _ = bind_tx.send(Err(e));
            return None;
        }
    };
    if let Err(e) = listener.set_nonblocking(true) {
        let _ = bind_tx.send(Err(BridgeError::communication(format!(
            "Failed to make receiver listener pollable: {e}"
        ))));
        return None;
    }
    info!("Waiting for an incoming connection on port {port}");
    let _ = bind_tx.send(Ok(port));

    let (accept_tx, accept_rx) = mpsc::channel();
    let helper = {
        let running = Arc::clone(&task.running);
        let timeout = task.timeout;
        thread::spawn(move || accept_loop(listener, timeout, &running, &accept_tx))
    };

    // The board is only told to dial back after this flag goes up.
    task.ready.store(true, Ordering::SeqCst);

    let stream = loop {
        if !task.running.load(Ordering::SeqCst) {
            break None;
        }
        match accept_rx.recv_timeout(task.timeout) {
            Ok(Ok(stream)) => break Some(stream),
            Ok(Err(e)) => {
                error!("Accept on receiver socket failed: {e}");
                break None;
            }
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                if task.running.load(Ordering::SeqCst) {
                    error!("Accept helper exited without a connection");
                }
                break None;
            }
        }
    };

    if helper.join().is_err() {
        error!("Accept helper thread panicked");
    }

    let stream = stream?;
    if let Err(e) = stream.set_read_timeout(Some(task.timeout)) {
        error!("Failed to set receiver read timeout: {e}");
        return None;
    }
    Some(stream)
}

/// Probe ports upward from `start_port` until a bind succeeds.
///
/// Allocation is racy against other processes; the chosen port is
/// reported so operators can find the listener.
fn bind_receiver(start_port: u16) -> Result<(TcpListener, u16)> {
    let mut port = start_port;
    loop {
        match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)) {
            Ok(listener) => {
                if port != start_port {
                    warn!("Receiver port {start_port} is taken, listening on {port} instead");
                }
                return Ok((listener, port));
            }
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                port = port.checked_add(1).ok_or_else(|| {
                    BridgeError::communication(format!(
                        "No free receiver port at or above {start_port}"
                    ))
                })?;
            }
            Err(e) => {
                return Err(BridgeError::communication(format!(
                    "Receiver bind on port {port} failed: {e}"
                )));
            }
        }
    }
}

/// Accept one connection on a nonblocking listener, interleaving polls
/// with cancellation checks.
fn accept_loop(
    listener: TcpListener,
    timeout: Duration,
    running: &AtomicBool,
    tx: &mpsc::Sender<std::io::Result<TcpStream>>,
) {
    loop {
        if !running.load(Ordering::SeqCst) {
            return;
        }
        match listener.accept() {
            Ok((stream, addr)) => {
                debug!("Inbound connection from {addr}");
                let _ = tx.send(Ok(stream));
                return;
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(timeout),
            Err(e) => {
                let _ = tx.send(Err(e));
                return;
            }
        }
    }
}

enum ReadStatus {
    Full,
    Eof,
    Cancelled,
    Failed(std::io::Error),
}

/// Fill `buf` from the socket, waiting out transport timeouts.
///
/// Cancellation is honored whenever the read returns at transport
/// level; a packet in flight is drained to completion only while the
/// run stays live, so stop never waits on a stalled sender.
fn read_exact_interruptible(
    stream: &mut TcpStream,
    buf: &mut [u8],
    running: &AtomicBool,
) -> ReadStatus {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => return ReadStatus::Eof,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                if !running.load(Ordering::SeqCst) {
                    return ReadStatus::Cancelled;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return ReadStatus::Failed(e),
        }
    }
    ReadStatus::Full
}

fn read_loop(task: &mut ReceiverTask, mut stream: TcpStream) {
    let mut tracker = SequenceTracker::new();
    let mut header_buf = [0u8; TcpHeader::SIZE];
    let mut word_buf = [0u8; TriggerWord::SIZE];

    while task.running.load(Ordering::SeqCst) {
        if let Some(calibration) = task.calibration.as_mut() {
            calibration.maybe_rotate(Instant::now());
        }

        match read_exact_interruptible(&mut stream, &mut header_buf, &task.running) {
            ReadStatus::Full => {}
            ReadStatus::Eof => {
                info!("Socket closed: connection ended by the board");
                break;
            }
            ReadStatus::Cancelled => break,
            ReadStatus::Failed(e) => {
                error!("Read failure on receiver socket: {e}");
                break;
            }
        }
        let header = TcpHeader::from_bytes(header_buf);

        let n_words = header.word_count();
        if n_words != 1 {
            warn!(
                "Unexpected packet size {} ({n_words} words); reading a single trigger word",
                header.packet_size
            );
        }

        match read_exact_interruptible(&mut stream, &mut word_buf, &task.running) {
            ReadStatus::Full => {}
            ReadStatus::Eof => {
                info!("Socket closed mid-packet by the board");
                break;
            }
            ReadStatus::Cancelled => break,
            ReadStatus::Failed(e) => {
                error!("Read failure on receiver socket: {e}");
                break;
            }
        }
        let word = TriggerWord::from_bytes(word_buf);

        if let Some(gap) = tracker.check(header.sequence_id) {
            match gap.prev {
                Some(prev) => {
                    warn!("Skipped CIB word sequence. Prev {prev} current {}", gap.current)
                }
                None => warn!(
                    "First CIB packet carries sequence id {} (expected 0)",
                    gap.current
                ),
            }
        }

        task.stats.push_buffer_count(n_words as u32);

        if let Some(calibration) = task.calibration.as_mut() {
            calibration.write_word(&word);
        }

        task.stats
            .num_total_triggers
            .fetch_add(1, Ordering::Relaxed);
        let counter =
            task.stats.run_trigger_counter.fetch_add(1, Ordering::Relaxed) as u32 + 1;
        task.stats
            .last_readout_timestamp
            .store(word.timestamp, Ordering::Relaxed);

        let frame = RawFrame::from_trigger(&word, task.trigger_bit, counter);
        if let Err(e) = task.sink.send_raw_frame(&frame) {
            warn!("Failed to send raw HSI frame: {e}");
        }

        let event = HsiEvent::from_trigger(&word, task.trigger_bit, counter, task.run_number);
        match task.sink.send_event(&event) {
            Ok(()) => {
                task.stats.sent_events.fetch_add(1, Ordering::Relaxed);
                task.stats
                    .last_sent_timestamp
                    .store(event.timestamp, Ordering::Relaxed);
            }
            Err(e) => {
                task.stats
                    .failed_to_send_events
                    .fetch_add(1, Ordering::Relaxed);
                warn!("Failed to send HSI event: {e}");
            }
        }
    }

    if let Err(e) = stream.shutdown(Shutdown::Both) {
        debug!("Receiver socket close failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_probe_skips_occupied_port() {
        // occupy an ephemeral port on the wildcard address, then probe
        // from it
        let occupied = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
        let base = occupied.local_addr().unwrap().port();
        let (listener, port) = bind_receiver(base).unwrap();
        assert_eq!(port, base + 1);
        drop(listener);
    }

    #[test]
    fn test_port_probe_uses_free_port_directly() {
        let probe = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
        let base = probe.local_addr().unwrap().port();
        drop(probe);
        let (_listener, port) = bind_receiver(base).unwrap();
        assert_eq!(port, base);
    }

    #[test]
    fn test_accept_loop_exits_on_cancel() {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
        listener.set_nonblocking(true).unwrap();
        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel();
        let helper = {
            let running = Arc::clone(&running);
            thread::spawn(move || {
                accept_loop(listener, Duration::from_millis(5), &running, &tx)
            })
        };
        running.store(false, Ordering::SeqCst);
        helper.join().unwrap();
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::TryRecvError::Disconnected)
        ));
    }
}
