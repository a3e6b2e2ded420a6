//! CIB bridge host shim
//!
//! Runs one bridge instance standalone, outside a DAQ host: the
//! configuration document comes from a JSON file and the run-control
//! commands arrive on stdin.
//!
//! Usage:
//!     cib-bridge --config bridge.json
//!     > conf
//!     > start 42
//!     > stop
//!     > info
//!     > quit

use anyhow::{Context, Result};
use cib_bridge::{CibBridge, TracingSink};
use clap::Parser;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "cib-bridge", about = "Bridge between a CIB trigger board and a DAQ fabric")]
struct Args {
    /// Path to the JSON configuration document passed to `conf`
    #[arg(long)]
    config: PathBuf,

    /// Instance name used in logs
    #[arg(long, default_value = "cib")]
    name: String,

    /// Optional append-mode log file alongside stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Console logging at debug level
    #[arg(long, short)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    cib_logging::init_logging(cib_logging::LogConfig {
        verbose: args.verbose,
        log_file: args.log_file.as_deref(),
    })?;

    let raw = std::fs::read_to_string(&args.config)
        .with_context(|| format!("Failed to read {}", args.config.display()))?;
    let conf_doc: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not valid JSON", args.config.display()))?;

    let mut bridge = CibBridge::new(args.name, Arc::new(TracingSink));
    tracing::info!("CIB bridge ready; commands: conf | start <run> | stop | info | quit");

    let stdin = io::stdin();
    prompt()?;
    for line in stdin.lock().lines() {
        let line = line.context("Failed to read command")?;
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("conf") => report(bridge.configure(&conf_doc)),
            Some("start") => match parts.next().map(str::parse::<u32>) {
                Some(Ok(run)) => report(bridge.start(run)),
                _ => eprintln!("usage: start <run-number>"),
            },
            Some("stop") => report(bridge.stop()),
            Some("info") => match serde_json::to_string_pretty(&bridge.info()) {
                Ok(json) => println!("{json}"),
                Err(e) => eprintln!("error: {e}"),
            },
            Some("quit") | Some("exit") => break,
            Some(other) => eprintln!("unknown command: {other}"),
            None => {}
        }
        prompt()?;
    }

    // Drop stops a live run and closes the control socket.
    drop(bridge);
    Ok(())
}

fn prompt() -> Result<()> {
    print!("> ");
    io::stdout().flush().context("Failed to flush prompt")
}

fn report(result: cib_bridge::Result<()>) {
    match result {
        Ok(()) => println!("ok"),
        Err(e) => eprintln!("error: {e}"),
    }
}
