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

//! Diagnostic tracing for the daemon itself. Disk events go through
//! [`crate::report::Reporter`]; this is only for lifecycle and failures.

use std::env;
use std::path::Path;

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the tracing filter
pub const LOG_ENV: &str = "HD_IDLE_LOG";

const JOURNALD_SOCKET: &str = "/run/systemd/journal/socket";

/// Filter directive: `HD_IDLE_LOG` wins, then the debug flag, then `info`
pub fn log_level(debug: bool) -> String {
    match env::var(LOG_ENV) {
        Ok(level) if !level.trim().is_empty() => level,
        _ if debug => "debug".to_string(),
        _ => "info".to_string(),
    }
}

/// Install the global subscriber: journald when systemd is present, stderr
/// otherwise. Returns where diagnostics go.
pub fn init_tracing(debug: bool) -> &'static str {
    let level = log_level(debug);

    if Path::new(JOURNALD_SOCKET).exists() {
        match tracing_journald::layer() {
            Ok(journald) => {
                let _ = tracing_subscriber::registry()
                    .with(journald)
                    .with(EnvFilter::new(&level))
                    .try_init();
                return "systemd journal";
            }
            Err(e) => eprintln!("Failed to create journald layer: {}, falling back to stderr", e),
        }
    }

    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .with_env_filter(EnvFilter::new(&level))
        .try_init();
    "stderr"
}
