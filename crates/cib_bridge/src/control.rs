//! Control channel
//!
//! A blocking request/reply client for the board's control socket. One
//! JSON command out, one JSON reply back, each reply carrying a
//! `feedback` array that is counted and logged entry by entry.
//!
//! Transport errors are fatal for the caller; explicit error feedback
//! is a protocol-level failure that leaves the socket usable.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use cib_protocol::{ControlCommand, ControlReply, Severity};
use tracing::{debug, error, info, warn};

use crate::error::{BridgeError, Result};
use crate::monitoring::BridgeStats;

/// Replies are read best-effort into a buffer of this size; anything
/// longer or split across segments is a framing error.
const REPLY_BUFFER_SIZE: usize = 1024;

/// Client side of the board's control socket.
pub struct ControlChannel {
    stream: Option<TcpStream>,
    stats: Arc<BridgeStats>,
}

impl ControlChannel {
    pub fn new(stats: Arc<BridgeStats>) -> Self {
        Self {
            stream: None,
            stats,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Resolve and connect to the board's control endpoint.
    pub fn connect(&mut self, host: &str, port: u16) -> Result<()> {
        let stream = TcpStream::connect((host, port)).map_err(|e| {
            BridgeError::communication(format!("Failed to connect to CIB at {host}:{port}: {e}"))
        })?;
        debug!("Control connection established to {host}:{port}");
        self.stream = Some(stream);
        Ok(())
    }

    /// Send one command and read one reply.
    ///
    /// Returns `Ok(true)` iff no feedback entry classified as an
    /// error. Transport failures are `Err`; the connection should be
    /// considered dead afterwards.
    pub fn send(&mut self, command: &ControlCommand) -> Result<bool> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| BridgeError::communication("Control socket is not connected"))?;

        let payload = serde_json::to_vec(command)
            .map_err(|e| BridgeError::module(format!("Failed to encode control command: {e}")))?;
        debug!("Sending message: {}", String::from_utf8_lossy(&payload));

        self.stats
            .num_control_messages_sent
            .fetch_add(1, Ordering::Relaxed);

        stream
            .write_all(&payload)
            .map_err(|e| BridgeError::communication(format!("Control write failed: {e}")))?;

        let mut buf = [0u8; REPLY_BUFFER_SIZE];
        let n = stream
            .read(&mut buf)
            .map_err(|e| BridgeError::communication(format!("Control read failed: {e}")))?;
        if n == 0 {
            return Err(BridgeError::communication(
                "Control socket closed by the board",
            ));
        }
        debug!("Unformatted answer: {}", String::from_utf8_lossy(&buf[..n]));

        let reply = ControlReply::parse(&buf[..n]).map_err(|e| {
            BridgeError::communication(format!("Control reply framing error: {e}"))
        })?;
        debug!("Received messages: {}", reply.feedback.len());

        let mut ok = true;
        for entry in &reply.feedback {
            self.stats
                .num_control_responses_received
                .fetch_add(1, Ordering::Relaxed);
            match entry.severity() {
                Severity::Error => {
                    error!("Message from the board: {}", entry.message_text());
                    ok = false;
                }
                Severity::Warning => warn!("Message from the board: {}", entry.message_text()),
                Severity::Info => info!("Message from the board: {}", entry.message_text()),
                Severity::Raw => info!(
                    "Unformatted from the board: {}",
                    serde_json::to_string(entry).unwrap_or_else(|_| entry.kind.clone())
                ),
            }
        }

        Ok(ok)
    }

    /// Idempotent shutdown; close problems are logged, not raised.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                debug!("Control socket shutdown failed: {e}");
            }
        }
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn serve_one_reply(reply: &'static [u8]) -> (u16, thread::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut buf = [0u8; REPLY_BUFFER_SIZE];
            let n = socket.read(&mut buf).unwrap();
            socket.write_all(reply).unwrap();
            buf[..n].to_vec()
        });
        (port, handle)
    }

    #[test]
    fn test_send_counts_and_classifies() {
        let (port, server) =
            serve_one_reply(br#"{"feedback":[{"type":"info","message":"running"}]}"#);
        let stats = Arc::new(BridgeStats::new());
        let mut channel = ControlChannel::new(Arc::clone(&stats));
        channel.connect("127.0.0.1", port).unwrap();

        let ok = channel
            .send(&ControlCommand::StartRun { run_number: 7 })
            .unwrap();
        assert!(ok);
        let received = server.join().unwrap();
        assert_eq!(
            received,
            br#"{"command":"start_run","run_number":7}"#.to_vec()
        );
        assert_eq!(
            stats.num_control_messages_sent.load(Ordering::Relaxed),
            1
        );
        assert_eq!(
            stats.num_control_responses_received.load(Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn test_error_feedback_fails_exchange_but_not_socket() {
        let (port, server) = serve_one_reply(
            br#"{"feedback":[{"type":"Error","message":"bad board state"},{"type":"info","message":"details"}]}"#,
        );
        let stats = Arc::new(BridgeStats::new());
        let mut channel = ControlChannel::new(Arc::clone(&stats));
        channel.connect("127.0.0.1", port).unwrap();

        let ok = channel.send(&ControlCommand::StopRun).unwrap();
        assert!(!ok);
        assert!(channel.is_connected());
        assert_eq!(
            stats.num_control_responses_received.load(Ordering::Relaxed),
            2
        );
        server.join().unwrap();
    }

    #[test]
    fn test_connect_refused_is_communication_error() {
        // grab a free port and leave it closed
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut channel = ControlChannel::new(Arc::new(BridgeStats::new()));
        let err = channel.connect("127.0.0.1", port).unwrap_err();
        assert!(matches!(err, BridgeError::Communication(_)));
    }

    #[test]
    fn test_send_without_connect() {
        let mut channel = ControlChannel::new(Arc::new(BridgeStats::new()));
        let err = channel.send(&ControlCommand::StopRun).unwrap_err();
        assert!(matches!(err, BridgeError::Communication(_)));
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut channel = ControlChannel::new(Arc::new(BridgeStats::new()));
        channel.close();
        channel.close();
        assert!(!channel.is_connected());
    }
}
