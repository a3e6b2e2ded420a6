//! Lifecycle controller
//!
//! Owns the configure → start → stop state machine, the control
//! socket, and the receiver worker thread. Commands are delivered
//! serially by the host; nothing here is re-entrant.
//!
//! The one subtle ordering rule: the receiver's readiness flag must be
//! observed true before `start_run` leaves for the board, otherwise
//! the board can dial back before the listener exists.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;

use cib_protocol::{Conf, ControlCommand};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::calibration::CalibrationStream;
use crate::control::ControlChannel;
use crate::error::{BridgeError, Result};
use crate::monitoring::{BridgeStats, CibBridgeInfo};
use crate::receiver::{self, ReceiverTask};
use crate::sink::HsiSink;

/// Poll period of the listener-readiness handshake.
const READY_POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Poll attempts before the handshake is declared dead (~500 ms).
const READY_POLL_ITERATIONS: u32 = 50;
/// Ceiling on how long the freshly spawned worker may take to report
/// its bind outcome.
const BIND_REPORT_TIMEOUT: Duration = Duration::from_secs(5);

/// The bridge between one CIB and the DAQ fabric.
pub struct CibBridge {
    name: String,
    conf: Option<Conf>,
    control: ControlChannel,
    stats: Arc<BridgeStats>,
    sink: Arc<dyn HsiSink>,
    running: Arc<AtomicBool>,
    receiver_ready: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    run_number: u32,
}

impl CibBridge {
    pub fn new(name: impl Into<String>, sink: Arc<dyn HsiSink>) -> Self {
        let stats = Arc::new(BridgeStats::new());
        Self {
            name: name.into(),
            conf: None,
            control: ControlChannel::new(Arc::clone(&stats)),
            stats,
            sink,
            running: Arc::new(AtomicBool::new(false)),
            receiver_ready: Arc::new(AtomicBool::new(false)),
            worker: None,
            run_number: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_configured(&self) -> bool {
        self.stats.is_configured.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.stats.is_running.load(Ordering::SeqCst)
    }

    /// Snapshot of the monitoring record.
    pub fn info(&self) -> CibBridgeInfo {
        self.stats.snapshot()
    }

    /// `conf`: decode the document, connect the control socket and push
    /// the board configuration.
    ///
    /// Any failure leaves the module unconfigured; a repeated `conf`
    /// starts over from a fresh connection.
    pub fn configure(&mut self, args: &Value) -> Result<()> {
        info!("{}: Configuring CIB", self.name);
        self.stats.is_configured.store(false, Ordering::SeqCst);
        self.conf = None;

        let conf: Conf = serde_json::from_value(args.clone())
            .map_err(|e| BridgeError::module(format!("Malformed configuration: {e}")))?;
        conf.validate()
            .map_err(|e| BridgeError::module(e.to_string()))?;
        info!(
            instance = conf.cib_instance,
            "Board control endpoint {}:{}, receiver port {}, trigger bit {}",
            conf.cib_host,
            conf.cib_port,
            conf.receiver_port,
            conf.cib_trigger_bit
        );
        if conf.calibration.enabled {
            info!(
                "Calibration stream enabled under {} (rotation {} min)",
                conf.calibration.directory, conf.calibration.rotation_minutes
            );
        }

        self.stats
            .num_control_messages_sent
            .store(0, Ordering::Relaxed);
        self.stats
            .num_control_responses_received
            .store(0, Ordering::Relaxed);

        self.control.close();
        self.control.connect(&conf.cib_host, conf.cib_port)?;

        let command = ControlCommand::Config {
            config: conf.board_config.clone(),
        };
        match self.control.send(&command) {
            Ok(true) => {}
            Ok(false) => {
                self.control.close();
                return Err(BridgeError::communication("Unable to configure CIB"));
            }
            Err(e) => {
                self.control.close();
                return Err(e);
            }
        }

        self.conf = Some(conf);
        self.stats.is_configured.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// `start`: spawn the receiver, wait for its listener, then open
    /// the run on the board.
    pub fn start(&mut self, run_number: u32) -> Result<()> {
        if self.is_running() {
            return Err(BridgeError::wrong_state("a run is already in progress"));
        }
        let (receiver_port, receiver_timeout, trigger_bit, calibration_conf) =
            match self.conf.as_ref() {
                Some(conf) if self.is_configured() => (
                    conf.receiver_port,
                    conf.receiver_timeout(),
                    conf.trigger_bit(),
                    conf.calibration.clone(),
                ),
                _ => {
                    return Err(BridgeError::wrong_state(
                        "CIB has not been successfully configured",
                    ))
                }
            };

        self.run_number = run_number;

        let calibration = if calibration_conf.enabled {
            let mut stream = CalibrationStream::new(
                &calibration_conf.directory,
                Duration::from_secs(calibration_conf.rotation_minutes * 60),
            );
            stream.set_prefix(&format!("run{run_number}"));
            Some(stream)
        } else {
            None
        };

        self.running.store(true, Ordering::SeqCst);
        self.receiver_ready.store(false, Ordering::SeqCst);

        let task = ReceiverTask {
            port: receiver_port,
            timeout: receiver_timeout,
            trigger_bit,
            run_number,
            running: Arc::clone(&self.running),
            ready: Arc::clone(&self.receiver_ready),
            stats: Arc::clone(&self.stats),
            sink: Arc::clone(&self.sink),
            calibration,
        };
        let (worker, bind_rx) = match receiver::spawn(task) {
            Ok(spawned) => spawned,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        self.worker = Some(worker);

        match bind_rx.recv_timeout(BIND_REPORT_TIMEOUT) {
            Ok(Ok(port)) => debug!("Receiver listening on port {port}"),
            Ok(Err(e)) => {
                self.teardown_worker();
                return Err(e);
            }
            Err(mpsc::RecvTimeoutError::Timeout | mpsc::RecvTimeoutError::Disconnected) => {
                self.teardown_worker();
                return Err(BridgeError::module(
                    "Receiver task never reported its bind outcome",
                ));
            }
        }

        if let Err(e) = wait_for_ready(
            &self.receiver_ready,
            READY_POLL_ITERATIONS,
            READY_POLL_INTERVAL,
        ) {
            self.teardown_worker();
            return Err(e);
        }

        info!("Sending start of run command for run {run_number}");
        match self.control.send(&ControlCommand::StartRun { run_number }) {
            Ok(true) => {
                self.stats.is_running.store(true, Ordering::SeqCst);
                info!("{}: successfully started", self.name);
                Ok(())
            }
            Ok(false) => {
                self.teardown_worker();
                Err(BridgeError::communication("Unable to start run on CIB"))
            }
            Err(e) => {
                self.teardown_worker();
                Err(e)
            }
        }
    }

    /// `stop`: close the run on the board, then tear down the receiver
    /// regardless of the board's answer.
    pub fn stop(&mut self) -> Result<()> {
        if !self.is_running() {
            return Err(BridgeError::wrong_state("no run in progress"));
        }

        info!("Sending stop run command");
        let control_result = match self.control.send(&ControlCommand::StopRun) {
            Ok(true) => Ok(()),
            Ok(false) => Err(BridgeError::communication("Unable to stop CIB")),
            Err(e) => Err(e),
        };
        if control_result.is_err() {
            warn!("Board did not acknowledge stop; tearing down the receiver anyway");
        }

        self.teardown_worker();

        let per_run = self.stats.run_trigger_counter.swap(0, Ordering::Relaxed);
        let lifetime = self.stats.num_total_triggers.load(Ordering::Relaxed);
        info!(
            "Run {} closed: {per_run} triggers this run, {lifetime} since startup",
            self.run_number
        );
        self.stats.is_running.store(false, Ordering::SeqCst);

        control_result
    }

    fn teardown_worker(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Receiver thread panicked");
            }
        }
        self.receiver_ready.store(false, Ordering::SeqCst);
    }
}

impl Drop for CibBridge {
    fn drop(&mut self) {
        if self.is_running() {
            if let Err(e) = self.stop() {
                warn!("Stop during teardown failed: {e}");
            }
        }
        self.control.close();
    }
}

/// Busy-poll the readiness flag; the board must not be told to start
/// until this returns.
fn wait_for_ready(ready: &AtomicBool, iterations: u32, interval: Duration) -> Result<()> {
    for _ in 0..iterations {
        if ready.load(Ordering::SeqCst) {
            return Ok(());
        }
        std::thread::sleep(interval);
    }
    Err(BridgeError::module(
        "Timed out waiting for the receiver listener to become ready",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_wait_for_ready_times_out() {
        let ready = AtomicBool::new(false);
        let started = Instant::now();
        let err = wait_for_ready(&ready, READY_POLL_ITERATIONS, READY_POLL_INTERVAL).unwrap_err();
        let elapsed = started.elapsed();
        assert!(matches!(err, BridgeError::Module(_)));
        // 50 polls at 10 ms each
        assert!(elapsed >= Duration::from_millis(400), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "{elapsed:?}");
    }

    #[test]
    fn test_wait_for_ready_succeeds_immediately() {
        let ready = AtomicBool::new(true);
        wait_for_ready(&ready, 1, Duration::from_millis(1)).unwrap();
    }
}
