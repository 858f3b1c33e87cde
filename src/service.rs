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

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use tracing::info;

use hd_error::Result;

use crate::config::Config;
use crate::diskstats::{ProcDiskStats, StatsProvider};
use crate::monitor::{Collaborators, DiskMonitor};
use crate::report::Reporter;
use crate::resolver::{resolve_at_startup, FsResolver, NameResolver};
use crate::sgio::{SgIoSpindown, Spindown};

/// Granularity at which a sleeping loop notices a shutdown request
const SHUTDOWN_CHECK: Duration = Duration::from_millis(250);

/// The polling daemon: configuration, disk state and the capabilities it
/// drives, advanced one cycle at a time.
pub struct Service<S, D, R> {
    config: Config,
    monitor: DiskMonitor,
    stats: S,
    spindown: D,
    resolver: R,
    reporter: Reporter,
}

impl<S, D, R> Service<S, D, R>
where
    S: StatsProvider,
    D: Spindown,
    R: NameResolver,
{
    /// Resolves every configured device name once before the first cycle
    pub fn new(
        mut config: Config,
        stats: S,
        spindown: D,
        resolver: R,
        mut reporter: Reporter,
        started_at: DateTime<Local>,
    ) -> Result<Self> {
        resolve_at_startup(&mut config, &resolver, &mut reporter)?;
        Ok(Self {
            config,
            monitor: DiskMonitor::new(started_at),
            stats,
            spindown,
            resolver,
            reporter,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn monitor(&self) -> &DiskMonitor {
        &self.monitor
    }

    /// Run one polling cycle at `now`
    pub fn tick(&mut self, now: DateTime<Local>) -> Result<()> {
        let mut io = Collaborators {
            stats: &mut self.stats,
            resolver: &self.resolver,
            spindown: &mut self.spindown,
            reporter: &mut self.reporter,
        };
        self.monitor.observe(now, &mut self.config, &mut io)
    }

    /// Poll until `shutdown` is set. Any cycle error ends the loop.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        let interval = self.config.poll_interval();
        info!(
            "polling every {}s, skew limit {}s",
            interval.as_secs(),
            self.config.skew_time.as_secs()
        );
        while !shutdown.load(Ordering::SeqCst) {
            self.tick(Local::now())?;
            sleep_unless_shutdown(interval, shutdown);
        }
        info!("shutdown requested, stopping");
        Ok(())
    }
}

fn sleep_unless_shutdown(total: Duration, shutdown: &AtomicBool) {
    let deadline = Instant::now() + total;
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep((deadline - now).min(SHUTDOWN_CHECK));
    }
}

/// Run the daemon against the real disks until `shutdown` is set
pub fn run_service(config: Config, shutdown: &AtomicBool) -> Result<()> {
    let reporter = Reporter::stdout(config.defaults.log_file.clone());
    let mut service = Service::new(
        config,
        ProcDiskStats::default(),
        SgIoSpindown,
        FsResolver,
        reporter,
        Local::now(),
    )?;
    info!("configuration: {}", service.config());
    service.run(shutdown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CommandType, DeviceConf, SymlinkPolicy};
    use crate::resolver::MockNameResolver;
    use crate::test_utils::test_utils::{disk, RecordingSpindown, ScriptedStats, SharedBuffer};
    use chrono::TimeDelta;
    use hd_error::HdIdleError;

    fn base_config() -> Config {
        let mut cfg = Config::default();
        cfg.defaults.idle = Duration::from_secs(2);
        cfg.skew_time = Duration::from_secs(120);
        cfg
    }

    #[test]
    fn test_end_to_end_spin_down_and_up() {
        let stats = ScriptedStats::new(vec![
            vec![disk("sda", 10, 5)],
            vec![disk("sda", 10, 5)],
            vec![disk("sda", 10, 5)],
            vec![disk("sda", 12, 5)],
        ]);
        let console = SharedBuffer::new();
        let reporter = Reporter::new(None, Box::new(console.clone()));
        let resolver = MockNameResolver::new();
        let t0 = Local::now();
        let mut service =
            Service::new(base_config(), stats, RecordingSpindown::default(), resolver, reporter, t0).unwrap();

        service.tick(t0).unwrap();
        service.tick(t0 + TimeDelta::seconds(1)).unwrap();
        assert!(!service.monitor().device("sda").unwrap().spun_down);
        assert!(service.spindown.calls.is_empty());

        service.tick(t0 + TimeDelta::seconds(3)).unwrap();
        assert!(service.monitor().device("sda").unwrap().spun_down);
        assert_eq!(service.spindown.calls, vec![("/dev/sda".to_string(), CommandType::Scsi)]);

        service.tick(t0 + TimeDelta::seconds(4)).unwrap();
        let sda = service.monitor().device("sda").unwrap();
        assert!(!sda.spun_down);
        assert_eq!(sda.reads, 12);
        assert_eq!(service.spindown.calls.len(), 1);
        assert_eq!(console.contents(), "/dev/sda spindown\nsda spinup\n");
    }

    #[test]
    fn test_late_resolution_enables_override() {
        let mut cfg = base_config();
        cfg.defaults.symlink_policy = SymlinkPolicy::Enabled;
        let mut dev = DeviceConf::new("/dev/disk/by-id/usb-backup");
        dev.idle = Some(Duration::from_secs(0));
        cfg.devices.push(dev);

        let mut resolver = MockNameResolver::new();
        let mut seq = mockall::Sequence::new();
        resolver
            .expect_resolve()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|n| Err(HdIdleError::Resolve { name: n.to_string(), reason: "absent".into() }));
        resolver
            .expect_resolve()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok("sdb".to_string()));

        let stats = ScriptedStats::new(vec![vec![disk("sda", 0, 0)], vec![disk("sda", 0, 0), disk("sdb", 0, 0)]]);
        let reporter = Reporter::new(None, Box::new(SharedBuffer::new()));
        let t0 = Local::now();
        // startup attempt fails, first cycle fails, second cycle resolves
        let mut service = Service::new(cfg, stats, RecordingSpindown::default(), resolver, reporter, t0).unwrap();
        service.tick(t0).unwrap();
        assert!(!service.config().devices[0].is_resolved());
        service.tick(t0 + TimeDelta::seconds(1)).unwrap();
        assert_eq!(service.config().devices[0].name, "sdb");
        assert_eq!(service.monitor().device("sdb").unwrap().idle_time, Duration::ZERO);
        assert_eq!(service.monitor().device("sda").unwrap().idle_time, Duration::from_secs(2));
    }

    #[test]
    fn test_sampler_failure_ends_cycle_with_error() {
        let reporter = Reporter::new(None, Box::new(SharedBuffer::new()));
        let t0 = Local::now();
        let mut service = Service::new(
            base_config(),
            ScriptedStats::default(),
            RecordingSpindown::default(),
            MockNameResolver::new(),
            reporter,
            t0,
        )
        .unwrap();
        assert!(service.tick(t0).is_err());
    }

    #[test]
    fn test_run_returns_when_shutdown_already_set() {
        let reporter = Reporter::new(None, Box::new(SharedBuffer::new()));
        let mut service = Service::new(
            base_config(),
            ScriptedStats::default(),
            RecordingSpindown::default(),
            MockNameResolver::new(),
            reporter,
            Local::now(),
        )
        .unwrap();
        let shutdown = AtomicBool::new(true);
        assert!(service.run(&shutdown).is_ok());
    }

    #[test]
    fn test_sleep_unless_shutdown_returns_early() {
        let shutdown = AtomicBool::new(true);
        let started = Instant::now();
        sleep_unless_shutdown(Duration::from_secs(30), &shutdown);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
