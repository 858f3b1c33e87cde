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

//! Idle detection and spin-down decisions.
//!
//! [`DiskMonitor`] owns the runtime state of every disk seen so far and turns
//! successive counter snapshots into spin-down commands and spin-up events.
//! A polling cycle always runs in this order: retry unresolved device names,
//! take a snapshot, check for clock skew, reconcile every disk.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Local};
use tracing::{debug, info, warn};

use hd_error::Result;

use crate::config::{CommandType, Config, DeviceSettings};
use crate::diskstats::{DiskStats, StatsProvider};
use crate::report::Reporter;
use crate::resolver::{resolve_symlinks, NameResolver};
use crate::sgio::{device_path, Spindown};

/// Runtime state of one disk, kept for the life of the process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceState {
    pub name: String,
    pub reads: u64,
    pub writes: u64,
    /// Zero disables spin-down for this disk
    pub idle_time: Duration,
    pub command_type: CommandType,
    pub last_io_at: DateTime<Local>,
    pub spin_up_at: DateTime<Local>,
    pub spin_down_at: Option<DateTime<Local>>,
    pub spun_down: bool,
}

impl DeviceState {
    fn first_sighting(stats: &DiskStats, settings: DeviceSettings, now: DateTime<Local>) -> Self {
        Self {
            name: stats.name.clone(),
            reads: stats.reads,
            writes: stats.writes,
            idle_time: settings.idle,
            command_type: settings.command_type,
            last_io_at: now,
            spin_up_at: now,
            spin_down_at: None,
            spun_down: false,
        }
    }

    /// Time since the counters last changed; zero if the clock went backwards
    pub fn idle_duration(&self, now: DateTime<Local>) -> Duration {
        (now - self.last_io_at).to_std().unwrap_or(Duration::ZERO)
    }

    fn counters_match(&self, stats: &DiskStats) -> bool {
        self.reads == stats.reads && self.writes == stats.writes
    }
}

/// External capabilities a polling cycle needs
pub struct Collaborators<'a> {
    pub stats: &'a mut dyn StatsProvider,
    pub resolver: &'a dyn NameResolver,
    pub spindown: &'a mut dyn Spindown,
    pub reporter: &'a mut Reporter,
}

#[derive(Debug)]
pub struct DiskMonitor {
    devices: BTreeMap<String, DeviceState>,
    last_now: DateTime<Local>,
}

impl DiskMonitor {
    pub fn new(started_at: DateTime<Local>) -> Self {
        Self {
            devices: BTreeMap::new(),
            last_now: started_at,
        }
    }

    pub fn device(&self, name: &str) -> Option<&DeviceState> {
        self.devices.get(name)
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceState> {
        self.devices.values()
    }

    /// Start time of the previous cycle
    pub fn last_now(&self) -> DateTime<Local> {
        self.last_now
    }

    /// Run one full polling cycle at time `now`
    pub fn observe(
        &mut self,
        now: DateTime<Local>,
        config: &mut Config,
        io: &mut Collaborators<'_>,
    ) -> Result<()> {
        resolve_symlinks(config, io.resolver, io.reporter)?;
        let snapshot = io.stats.snapshot()?;
        self.detect_skew(now, config.skew_time, io.reporter)?;
        for stats in &snapshot {
            self.reconcile(stats, now, config, io.spindown, io.reporter)?;
        }
        self.last_now = now;
        Ok(())
    }

    /// Treat every known disk as just spun up when the gap since the previous
    /// cycle exceeds `skew_time`. Returns whether the detector fired.
    pub fn detect_skew(
        &mut self,
        now: DateTime<Local>,
        skew_time: Duration,
        reporter: &mut Reporter,
    ) -> Result<bool> {
        let gap = match (now - self.last_now).to_std() {
            Ok(gap) => gap,
            Err(_) => return Ok(false),
        };
        if gap <= skew_time {
            return Ok(false);
        }
        info!(
            "{}s passed since the last cycle (skew limit {}s), assuming a suspend",
            gap.as_secs(),
            skew_time.as_secs()
        );
        for state in self.devices.values_mut() {
            state.spin_up_at = now;
            state.last_io_at = now;
            state.spun_down = false;
            reporter.skew(&state.name, now)?;
        }
        Ok(true)
    }

    /// Fold one disk's counters into its state, stopping the disk when it
    /// has been idle for longer than its threshold.
    pub fn reconcile(
        &mut self,
        stats: &DiskStats,
        now: DateTime<Local>,
        config: &Config,
        spindown: &mut dyn Spindown,
        reporter: &mut Reporter,
    ) -> Result<()> {
        let state = match self.devices.entry(stats.name.clone()) {
            Entry::Vacant(slot) => {
                let settings = config.device_config(&stats.name);
                debug!(
                    "tracking {} (idle={}s, command={})",
                    stats.name,
                    settings.idle.as_secs(),
                    settings.command_type
                );
                slot.insert(DeviceState::first_sighting(stats, settings, now));
                return Ok(());
            }
            Entry::Occupied(slot) => slot.into_mut(),
        };

        if state.counters_match(stats) {
            if !state.spun_down {
                let idle = state.idle_duration(now);
                if !state.idle_time.is_zero() && idle > state.idle_time {
                    let path = device_path(&state.name);
                    reporter.spin_down(&path)?;
                    if let Err(e) = spindown.spindown(&path, state.command_type) {
                        warn!("{}", e);
                        reporter.spindown_failed(&e)?;
                    }
                    // A failed command still counts, so it is not re-sent every cycle
                    state.spin_down_at = Some(now);
                    state.spun_down = true;
                }
            }
        } else {
            if state.spun_down {
                reporter.spin_up(state, now)?;
                state.spin_up_at = now;
            }
            state.reads = stats.reads;
            state.writes = stats.writes;
            state.last_io_at = now;
            state.spun_down = false;
        }

        if config.defaults.debug {
            reporter.debug_state(state, now)?;
        }
        Ok(())
    }
}
