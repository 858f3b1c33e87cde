/*
 * This file is part of hd-idle.
 *
 * Copyright (C) 2025 hd-idle contributors
 *
 * hd-idle is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * hd-idle is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with hd-idle. If not, see <https://www.gnu.org/licenses/>.
 */

//! Spin-up, spin-down and skew events, written to the console and to the
//! optional audit log file.
//!
//! Any failure to write the audit log is returned to the caller and ends the
//! daemon: a silently missing audit trail is treated as a misconfiguration.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

use hd_error::{HdIdleError, Result};

use crate::monitor::DeviceState;

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Append one line to the audit log, opening and closing the file each time
pub fn append_log_line(path: &Path, text: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o600)
        .open(path)
        .map_err(|source| HdIdleError::LogOpen {
            path: path.to_path_buf(),
            source,
        })?;
    writeln!(file, "{}", text).map_err(|source| HdIdleError::LogWrite {
        path: path.to_path_buf(),
        source,
    })?;
    close_log_fd(file.into_raw_fd(), path)
}

/// Close the log descriptor explicitly; dropping a `File` discards the result
fn close_log_fd(fd: RawFd, path: &Path) -> Result<()> {
    // SAFETY: the caller hands over ownership of `fd` and never uses it again.
    if unsafe { libc::close(fd) } != 0 {
        return Err(HdIdleError::LogClose {
            path: path.to_path_buf(),
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

fn whole_seconds(from: DateTime<Local>, to: DateTime<Local>) -> i64 {
    (to - from).num_seconds()
}

fn timestamp(t: Option<DateTime<Local>>) -> String {
    t.map(|t| t.format(TIMESTAMP_FORMAT).to_string())
        .unwrap_or_else(|| "-".to_string())
}

pub struct Reporter {
    log_file: Option<PathBuf>,
    console: Box<dyn Write + Send>,
}

impl Reporter {
    pub fn new(log_file: Option<PathBuf>, console: Box<dyn Write + Send>) -> Self {
        Self { log_file, console }
    }

    /// Reporter writing console events to standard output
    pub fn stdout(log_file: Option<PathBuf>) -> Self {
        Self::new(log_file, Box::new(io::stdout()))
    }

    pub fn log_file(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }

    fn console_line(&mut self, text: &str) -> Result<()> {
        writeln!(self.console, "{}", text)
            .and_then(|_| self.console.flush())
            .map_err(HdIdleError::Console)
    }

    /// No configured log file means file events are dropped
    fn log_line(&self, text: &str) -> Result<()> {
        match &self.log_file {
            Some(path) => append_log_line(path, text),
            None => Ok(()),
        }
    }

    pub fn spin_down(&mut self, device_path: &str) -> Result<()> {
        self.console_line(&format!("{} spindown", device_path))
    }

    pub fn spindown_failed(&mut self, err: &HdIdleError) -> Result<()> {
        self.console_line(&err.to_string())
    }

    /// `state` must still hold the timestamps from before the spin-up
    pub fn spin_up(&mut self, state: &DeviceState, now: DateTime<Local>) -> Result<()> {
        self.console_line(&format!("{} spinup", state.name))?;
        let (running, stopped) = match state.spin_down_at {
            Some(down) => (whole_seconds(state.spin_up_at, down), whole_seconds(down, now)),
            None => (whole_seconds(state.spin_up_at, now), 0),
        };
        self.log_line(&format!(
            "date: {}, time: {}, disk: {}, running: {}, stopped: {}",
            now.format(DATE_FORMAT),
            now.format(TIME_FORMAT),
            state.name,
            running,
            stopped
        ))
    }

    pub fn skew(&mut self, name: &str, now: DateTime<Local>) -> Result<()> {
        self.log_line(&format!(
            "date: {}, time: {}, disk: {}, assuming disk spun up after long sleep",
            now.format(DATE_FORMAT),
            now.format(TIME_FORMAT),
            name
        ))
    }

    pub fn symlink_resolved(&mut self, given_name: &str, name: &str) -> Result<()> {
        self.log_line(&format!("symlink {} resolved to {}", given_name, name))
    }

    pub fn resolve_failed(&mut self, given_name: &str) -> Result<()> {
        self.console_line(&format!("Cannot resolve symlink {}", given_name))
    }

    pub fn debug_state(&mut self, state: &DeviceState, now: DateTime<Local>) -> Result<()> {
        let idle_duration = state.idle_duration(now).as_secs_f64().round_ties_even();
        self.console_line(&format!(
            "disk={} command={} spunDown={} reads={} writes={} idleTime={} idleDuration={} \
             spindown={} spinup={} lastIO={}",
            state.name,
            state.command_type,
            state.spun_down,
            state.reads,
            state.writes,
            state.idle_time.as_secs(),
            idle_duration,
            timestamp(state.spin_down_at),
            timestamp(Some(state.spin_up_at)),
            timestamp(Some(state.last_io_at)),
        ))
    }
}
