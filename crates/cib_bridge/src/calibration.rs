//! Calibration stream
//!
//! Optional side-channel of raw trigger-word bytes for offline replay.
//! One binary file at a time, rotated on a wall-clock interval, written
//! and flushed word by word so a crash loses at most one trigger.
//!
//! The sink is advisory: any open or write problem downgrades it to
//! disabled for the rest of the run and the main pipeline continues.

use chrono::{DateTime, Local};
use std::fs::File;
use std::io::Write;
use std::time::{Duration, Instant};

use cib_protocol::TriggerWord;
use tracing::{info, warn};

struct OpenFile {
    file: File,
    last_open: Instant,
}

/// Rotating binary sink for trigger words.
pub struct CalibrationStream {
    directory: String,
    prefix: String,
    interval: Duration,
    state: Option<OpenFile>,
    failed: bool,
}

impl CalibrationStream {
    /// Create a disabled-until-prefixed stream writing under
    /// `directory`, rotating every `interval`.
    pub fn new(directory: &str, interval: Duration) -> Self {
        let mut directory = directory.to_string();
        if !directory.ends_with('/') {
            directory.push('/');
        }
        Self {
            directory,
            prefix: String::new(),
            interval,
            state: None,
            failed: false,
        }
    }

    /// Install the run prefix and open the first file.
    ///
    /// Called once per run with `run{N}`; the prefix is separated from
    /// the timestamp by an underscore.
    pub fn set_prefix(&mut self, prefix: &str) {
        self.prefix = prefix.to_string();
        if !self.prefix.is_empty() {
            self.prefix.push('_');
        }
        self.reopen(Local::now(), Instant::now());
    }

    /// Rotate if the interval has elapsed since the last open.
    pub fn maybe_rotate(&mut self, now: Instant) {
        if self.needs_rotation(now) {
            self.reopen(Local::now(), now);
        }
    }

    /// Append one trigger word and flush.
    pub fn write_word(&mut self, word: &TriggerWord) {
        if self.failed {
            return;
        }
        let Some(open) = self.state.as_mut() else {
            return;
        };
        let result = open
            .file
            .write_all(&word.pack())
            .and_then(|()| open.file.flush());
        if let Err(e) = result {
            warn!("Calibration stream write failed, disabling for this run: {e}");
            self.disable();
        }
    }

    fn needs_rotation(&self, now: Instant) -> bool {
        match &self.state {
            Some(open) => now.duration_since(open.last_open) >= self.interval,
            None => false,
        }
    }

    fn reopen(&mut self, stamp: DateTime<Local>, now: Instant) {
        if self.failed {
            return;
        }
        self.state = None;
        let name = self.file_name(stamp);
        match File::create(&name) {
            Ok(file) => {
                info!("New calibration stream file: {name}");
                self.state = Some(OpenFile {
                    file,
                    last_open: now,
                });
            }
            Err(e) => {
                warn!("Failed to open calibration file {name}, disabling for this run: {e}");
                self.disable();
            }
        }
    }

    fn file_name(&self, stamp: DateTime<Local>) -> String {
        format!(
            "{}{}{}.calib",
            self.directory,
            self.prefix,
            stamp.format("%Y-%m-%d_%H.%M.%S")
        )
    }

    fn disable(&mut self) {
        self.state = None;
        self.failed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn word(ts: u64) -> TriggerWord {
        TriggerWord {
            timestamp: ts,
            additional: 0,
        }
    }

    #[test]
    fn test_file_name_layout() {
        let stream = CalibrationStream::new("/data/calib", Duration::from_secs(60));
        let stamp = Local.with_ymd_and_hms(2024, 8, 5, 13, 7, 9).unwrap();
        // no prefix yet
        assert_eq!(
            stream.file_name(stamp),
            "/data/calib/2024-08-05_13.07.09.calib"
        );
    }

    #[test]
    fn test_prefix_gets_separator() {
        let dir = tempdir().unwrap();
        let mut stream =
            CalibrationStream::new(dir.path().to_str().unwrap(), Duration::from_secs(60));
        stream.set_prefix("run42");
        let stamp = Local.with_ymd_and_hms(2024, 8, 5, 13, 7, 9).unwrap();
        assert!(stream
            .file_name(stamp)
            .ends_with("/run42_2024-08-05_13.07.09.calib"));
    }

    #[test]
    fn test_rotation_interval() {
        let dir = tempdir().unwrap();
        let mut stream =
            CalibrationStream::new(dir.path().to_str().unwrap(), Duration::from_secs(60));
        stream.set_prefix("run1");
        let opened = stream.state.as_ref().unwrap().last_open;
        assert!(!stream.needs_rotation(opened + Duration::from_secs(59)));
        assert!(stream.needs_rotation(opened + Duration::from_secs(70)));
    }

    #[test]
    fn test_rotation_writes_to_fresh_file() {
        let dir = tempdir().unwrap();
        let mut stream =
            CalibrationStream::new(dir.path().to_str().unwrap(), Duration::from_secs(60));
        stream.prefix = "run1_".to_string();

        let t0 = Instant::now();
        stream.reopen(Local.with_ymd_and_hms(2024, 8, 5, 13, 0, 0).unwrap(), t0);
        stream.write_word(&word(1));
        // 70 s later the interval has elapsed and a new stamp is taken
        assert!(stream.needs_rotation(t0 + Duration::from_secs(70)));
        stream.reopen(
            Local.with_ymd_and_hms(2024, 8, 5, 13, 1, 10).unwrap(),
            t0 + Duration::from_secs(70),
        );
        stream.write_word(&word(2));

        let mut names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "run1_2024-08-05_13.00.00.calib",
                "run1_2024-08-05_13.01.10.calib"
            ]
        );
        let first = std::fs::read(dir.path().join(&names[0])).unwrap();
        let second = std::fs::read(dir.path().join(&names[1])).unwrap();
        assert_eq!(first, word(1).pack());
        assert_eq!(second, word(2).pack());
    }

    #[test]
    fn test_unwritable_directory_disables_sink() {
        let mut stream = CalibrationStream::new("/nonexistent/calib", Duration::from_secs(60));
        stream.set_prefix("run1");
        assert!(stream.failed);
        // writes become no-ops rather than errors
        stream.write_word(&word(1));
        stream.maybe_rotate(Instant::now() + Duration::from_secs(3600));
        assert!(stream.state.is_none());
    }
}
