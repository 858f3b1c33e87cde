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

use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};

use hd_idle::config::{self, Command};
use hd_idle::logger;
use hd_idle::service;
use hd_idle::sgio::{device_path, SgIoSpindown, Spindown};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_help() {
    eprintln!("hd-idle {} - spin down idle hard disks", VERSION);
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    hd-idle [-t <disk>] [-s <symlink_policy>] [-a <name>] [-i <idle_time>]");
    eprintln!("            [-c <command_type>] [-l <logfile>] [-d] [--config <file>] [-h] [-v]");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("    -t <disk>           Spin down the given disk immediately and exit");
    eprintln!("    -s 0|1              0: resolve device symlinks at startup only (default)");
    eprintln!("                        1: keep retrying unresolved symlinks every cycle");
    eprintln!("    -a <name>           Start a section for a disk; following -i/-c apply to it");
    eprintln!("    -i <seconds>        Idle time before spin-down, 0 disables (default 600)");
    eprintln!("    -c scsi|ata         Command used to stop the disk (default scsi)");
    eprintln!("    -l <logfile>        Append spin-up and skew events to this file");
    eprintln!("    -d                  Print the state of every disk each cycle");
    eprintln!("    --config <file>     Load a JSON configuration before applying flags");
    eprintln!("    -h, --help          Print this help");
    eprintln!("    -v, --version       Print version");
    eprintln!();
    eprintln!("ENVIRONMENT:");
    eprintln!("    {}      JSON configuration file (same as --config)", config::CONFIG_ENV);
    eprintln!("    {}         Diagnostic log filter (trace, debug, info, warn, error)", logger::LOG_ENV);
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match config::parse_args(args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!();
            print_help();
            process::exit(1);
        }
    };

    match command {
        Command::Help => print_help(),
        Command::Version => println!("hd-idle {}", VERSION),
        Command::SpindownNow { device, command_type } => {
            logger::init_tracing(false);
            let path = device_path(&device);
            println!("{} spindown", path);
            SgIoSpindown
                .spindown(&path, command_type)
                .with_context(|| format!("spin down {}", path))?;
        }
        Command::Run(cfg) => {
            let sink = logger::init_tracing(cfg.defaults.debug);
            info!("hd-idle {} starting, diagnostics to {}", VERSION, sink);

            // SAFETY: geteuid only returns the effective user id of this process.
            if unsafe { libc::geteuid() } != 0 {
                warn!("not running as root; stop commands will most likely fail");
            }

            let shutdown = Arc::new(AtomicBool::new(false));
            let flag = shutdown.clone();
            if let Err(e) = ctrlc::set_handler(move || {
                flag.store(true, Ordering::SeqCst);
            }) {
                warn!("Failed to set signal handler: {}", e);
            }

            if let Err(e) = service::run_service(cfg, &shutdown) {
                if let Some(hint) = e.operator_hint() {
                    error!("{}: {}", e, hint);
                }
                return Err(e).context("hd-idle stopped");
            }
        }
    }
    Ok(())
}
