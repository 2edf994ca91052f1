//! Baled byte log for transport diagnostics.
//!
//! Transports hand every byte they read or write to a [`ByteLog`]. The
//! log groups consecutive same-direction bytes into records of up to
//! sixteen bytes, stamps each record, and writes them as hex-plus-ascii
//! lines. Output rotates ("bales") when the current file reaches a size
//! cap or when a fixed interval elapses; a time-based roll starts the
//! new file with a `New File:` header so readers can re-anchor.
//!
//! Concatenating all bales in order reproduces, per direction, the
//! exact byte stream handed to [`ByteLog::wr`].

use crate::stamp::{Stamp, NSEC_PER_MSEC};
use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Byte-log failures. The log is diagnostic machinery, so transports
/// treat these as warnings rather than transport faults.
#[derive(Debug, Error)]
pub enum ByteLogError {
    #[error("log I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

/// How the log decides to roll to the next bale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaleRule {
    /// Roll once the current file exceeds `max_bytes`, keeping at most
    /// `max_files` numbered bales.
    Size { max_bytes: u64, max_files: u32 },
    /// Roll every `interval_ms` milliseconds, stamping the new file
    /// with a `New File:` header.
    Time { interval_ms: i64 },
}

impl Default for BaleRule {
    fn default() -> Self {
        BaleRule::Size {
            max_bytes: 1_200_000,
            max_files: 5,
        }
    }
}

/// One line of logged I/O: up to sixteen bytes in one direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub stamp: Stamp,
    /// True when the bytes were read from the peer.
    pub is_input: bool,
    pub data: Vec<u8>,
}

impl LogRecord {
    const CAPACITY: usize = 16;

    fn new(stamp: Stamp, is_input: bool) -> Self {
        Self {
            stamp,
            is_input,
            data: Vec::with_capacity(Self::CAPACITY),
        }
    }

    fn try_add(&mut self, value: u8, is_input: bool) -> bool {
        if !self.data.is_empty() && (self.is_input != is_input || self.data.len() >= Self::CAPACITY) {
            return false;
        }
        self.is_input = is_input;
        self.data.push(value);
        true
    }

    /// Formats the record the way the log file stores it: wall time,
    /// direction code, hex dump padded to sixteen columns, printable
    /// rendering.
    #[must_use]
    pub fn format(&self) -> String {
        let mut line = String::with_capacity(80);
        let _ = write!(line, "{}", self.stamp.to_utc().format("%H:%M:%S%.3f"));
        line.push(' ');
        line.push(if self.is_input { 'R' } else { 'T' });
        line.push(' ');
        for value in &self.data {
            let _ = write!(line, "{value:02x} ");
        }
        for _ in self.data.len()..Self::CAPACITY {
            line.push_str("   ");
        }
        line.push(' ');
        for value in &self.data {
            let printable = *value >= 0x20 && *value < 0x7f;
            line.push(if printable { *value as char } else { '.' });
        }
        line
    }
}

/// Rotating, direction-tagged byte log.
pub struct ByteLog {
    dir: PathBuf,
    file_name: String,
    rule: BaleRule,
    enabled: bool,
    file: Option<File>,
    written: u64,
    bale_no: u32,
    bale_started: Stamp,
    accumulator: Option<LogRecord>,
    /// Flushed records kept for clients that poll recent history.
    history: Vec<LogRecord>,
    history_cap: usize,
}

impl ByteLog {
    /// Opens a log under `dir` with the given base file name. The file
    /// is not created until the first record is flushed.
    pub fn new(dir: impl AsRef<Path>, file_name: &str, rule: BaleRule) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            file_name: file_name.to_string(),
            rule,
            enabled: true,
            file: None,
            written: 0,
            bale_no: 0,
            bale_started: Stamp::now(),
            accumulator: None,
            history: Vec::new(),
            history_cap: 1024,
        }
    }

    /// Enables or disables output. Disabling flushes the accumulator
    /// first so no bytes are lost.
    pub fn set_enabled(&mut self, enabled: bool) {
        if !enabled {
            self.flush_accumulator(Stamp::now());
        }
        self.enabled = enabled;
        if !enabled {
            self.file = None;
        }
    }

    /// Appends bytes travelling in one direction. `is_input` is true
    /// for bytes read from the peer.
    pub fn wr(&mut self, buf: &[u8], is_input: bool) {
        self.wr_at(buf, is_input, Stamp::now());
    }

    /// Same as [`ByteLog::wr`] with an explicit stamp.
    pub fn wr_at(&mut self, buf: &[u8], is_input: bool, stamp: Stamp) {
        if !self.enabled {
            return;
        }
        for &value in buf {
            let full = match &mut self.accumulator {
                Some(record) => !record.try_add(value, is_input),
                None => {
                    let mut record = LogRecord::new(stamp, is_input);
                    let added = record.try_add(value, is_input);
                    debug_assert!(added);
                    self.accumulator = Some(record);
                    false
                }
            };
            if full {
                self.flush_accumulator(stamp);
                let mut record = LogRecord::new(stamp, is_input);
                let added = record.try_add(value, is_input);
                debug_assert!(added);
                self.accumulator = Some(record);
            }
        }
    }

    /// Forces a break line into the log, flushing pending bytes first.
    pub fn force_break(&mut self, annotation: &str) {
        let now = Stamp::now();
        self.flush_accumulator(now);
        let line = if annotation.is_empty() {
            format!("--- {}\r\n", now.to_log_header())
        } else {
            format!("--- {} {}\r\n", now.to_log_header(), annotation)
        };
        self.write_line(&line, now);
    }

    /// Flushes the accumulator and the file buffer.
    pub fn flush(&mut self) {
        self.flush_accumulator(Stamp::now());
        if let Some(file) = &mut self.file {
            if let Err(error) = file.flush() {
                warn!(%error, "byte log flush failed");
            }
        }
    }

    /// Drains up to `max` records of flushed history, oldest first.
    pub fn pop_history(&mut self, max: usize) -> Vec<LogRecord> {
        let take = max.min(self.history.len());
        self.history.drain(..take).collect()
    }

    /// Path of the bale currently being written.
    #[must_use]
    pub fn current_path(&self) -> PathBuf {
        self.dir.join(format!("{}.{}", self.file_name, self.bale_no))
    }

    fn flush_accumulator(&mut self, now: Stamp) {
        if let Some(record) = self.accumulator.take() {
            let line = format!("{}\r\n", record.format());
            if self.history.len() >= self.history_cap {
                self.history.remove(0);
            }
            self.history.push(record);
            self.write_line(&line, now);
        }
    }

    fn write_line(&mut self, line: &str, now: Stamp) {
        if !self.enabled {
            return;
        }
        if let Err(error) = self.write_line_inner(line, now) {
            warn!(%error, "byte log write failed");
            self.file = None;
        }
    }

    fn write_line_inner(&mut self, line: &str, now: Stamp) -> Result<(), ByteLogError> {
        self.maybe_bale(now)?;
        if self.file.is_none() {
            self.open_current(false, now)?;
        }
        if let Some(file) = &mut self.file {
            file.write_all(line.as_bytes())?;
            self.written += line.len() as u64;
        }
        Ok(())
    }

    fn maybe_bale(&mut self, now: Stamp) -> Result<(), ByteLogError> {
        match self.rule {
            BaleRule::Size { max_bytes, max_files } => {
                if self.file.is_some() && self.written >= max_bytes {
                    self.bale_no = (self.bale_no + 1) % max_files.max(1);
                    self.open_current(false, now)?;
                }
            }
            BaleRule::Time { interval_ms } => {
                let elapsed = (now - self.bale_started) / NSEC_PER_MSEC;
                if self.file.is_some() && elapsed >= interval_ms {
                    self.bale_no += 1;
                    self.open_current(true, now)?;
                }
            }
        }
        Ok(())
    }

    fn open_current(&mut self, time_roll: bool, now: Stamp) -> Result<(), ByteLogError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.current_path();
        let mut file = OpenOptions::new().create(true).write(true).truncate(true).open(path)?;
        if time_roll {
            writeln!(file, "New File:  {}\r", now.to_log_header())?;
        }
        self.file = Some(file);
        self.written = 0;
        self.bale_started = now;
        Ok(())
    }
}

impl Drop for ByteLog {
    fn drop(&mut self) {
        self.flush();
    }
}
