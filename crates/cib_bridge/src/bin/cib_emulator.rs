//! CIB board emulator
//!
//! Plays the board side of both sockets for bench runs: answers the
//! bridge's control commands with JSON feedback and, once a run is
//! opened, dials the bridge's receiver port and streams synthetic
//! trigger packets at a fixed period.
//!
//! The receiver endpoint is taken from the `config` fragment
//! (`cib.sockets.receiver.{host,port}`) when present, falling back to
//! the command-line defaults.

use anyhow::{Context, Result};
use cib_protocol::{ControlCommand, ControlReply, Feedback, TcpHeader, TriggerWord};
use clap::Parser;
use serde_json::json;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "cib-emulator", about = "Synthetic CIB board for bench testing")]
struct Args {
    /// Port to serve control commands on
    #[arg(long, default_value_t = 8991)]
    control_port: u16,

    /// Receiver endpoint to dial back, unless the config fragment
    /// overrides it
    #[arg(long, default_value = "127.0.0.1")]
    receiver_host: String,
    #[arg(long, default_value_t = 8993)]
    receiver_port: u16,

    /// Triggers to stream per run
    #[arg(long, default_value_t = 100)]
    triggers: u32,

    /// Period between triggers in milliseconds
    #[arg(long, default_value_t = 100)]
    period_ms: u64,
}

fn main() -> Result<()> {
    let args = Args::parse();
    cib_logging::init_logging(cib_logging::LogConfig {
        verbose: false,
        log_file: None,
    })?;

    let listener = TcpListener::bind(("0.0.0.0", args.control_port))
        .with_context(|| format!("Failed to bind control port {}", args.control_port))?;
    tracing::info!("Emulated CIB waiting for control connections on {}", args.control_port);

    let mut receiver_host = args.receiver_host.clone();
    let mut receiver_port = args.receiver_port;
    let streaming = Arc::new(AtomicBool::new(false));

    loop {
        let (mut socket, addr) = listener.accept().context("Control accept failed")?;
        tracing::info!("Bridge connected from {addr}");

        let mut buf = [0u8; 1024];
        loop {
            let n = match socket.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!("Control read failed: {e}");
                    break;
                }
            };

            let command = match parse_command(&buf[..n]) {
                Ok(command) => command,
                Err(e) => {
                    tracing::warn!("Unparseable command: {e}");
                    reply(&mut socket, "error", &format!("unparseable command: {e}"))?;
                    continue;
                }
            };

            match command {
                ControlCommand::Config { config } => {
                    if let Some(receiver) = config.pointer("/cib/sockets/receiver") {
                        if let Some(host) = receiver.get("host").and_then(|h| h.as_str()) {
                            receiver_host = host.to_string();
                        }
                        if let Some(port) = receiver.get("port").and_then(|p| p.as_u64()) {
                            receiver_port = port as u16;
                        }
                    }
                    tracing::info!(
                        "Configured; will dial {receiver_host}:{receiver_port} on start_run"
                    );
                    reply(&mut socket, "info", "board configured")?;
                }
                ControlCommand::StartRun { run_number } => {
                    tracing::info!("Opening run {run_number}");
                    streaming.store(true, Ordering::SeqCst);
                    let target = (receiver_host.clone(), receiver_port);
                    let flag = Arc::clone(&streaming);
                    let count = args.triggers;
                    let period = Duration::from_millis(args.period_ms);
                    thread::spawn(move || {
                        if let Err(e) = stream_triggers(target, count, period, &flag) {
                            tracing::warn!("Trigger stream ended early: {e}");
                        }
                    });
                    reply(&mut socket, "info", &format!("run {run_number} started"))?;
                }
                ControlCommand::StopRun => {
                    tracing::info!("Closing run");
                    streaming.store(false, Ordering::SeqCst);
                    reply(&mut socket, "info", "run stopped")?;
                }
            }
        }
        streaming.store(false, Ordering::SeqCst);
        tracing::info!("Bridge disconnected");
    }
}

fn parse_command(buf: &[u8]) -> Result<ControlCommand> {
    let mut stream = serde_json::Deserializer::from_slice(buf).into_iter::<ControlCommand>();
    match stream.next() {
        Some(result) => result.context("invalid control JSON"),
        None => anyhow::bail!("empty control message"),
    }
}

fn reply(socket: &mut TcpStream, kind: &str, message: &str) -> Result<()> {
    let reply = ControlReply {
        feedback: vec![Feedback {
            kind: kind.to_string(),
            message: json!(message),
        }],
    };
    let payload = serde_json::to_vec(&reply).context("Failed to encode reply")?;
    socket.write_all(&payload).context("Control write failed")
}

fn stream_triggers(
    target: (String, u16),
    count: u32,
    period: Duration,
    streaming: &AtomicBool,
) -> Result<()> {
    let mut socket = TcpStream::connect((target.0.as_str(), target.1))
        .with_context(|| format!("Failed to dial receiver at {}:{}", target.0, target.1))?;
    tracing::info!("Streaming {count} triggers to {}:{}", target.0, target.1);

    for i in 0..count {
        if !streaming.load(Ordering::SeqCst) {
            break;
        }
        let header = TcpHeader {
            sequence_id: i as u8,
            packet_size: TriggerWord::SIZE as u16,
        };
        let word = TriggerWord {
            timestamp: 0x1000 + u64::from(i),
            additional: 0,
        };
        socket.write_all(&header.pack())?;
        socket.write_all(&word.pack())?;
        thread::sleep(period);
    }
    Ok(())
}
