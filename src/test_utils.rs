/*
 * Test utilities and fakes for hd-idle
 *
 * Recording stand-ins for the console sink, the snapshot sampler and the
 * stop-command capability, shared by the unit tests of several modules.
 */

#[cfg(test)]
pub mod test_utils {
    use std::collections::VecDeque;
    use std::io::{self, Write};
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    use hd_error::{HdIdleError, Result};

    use crate::config::CommandType;
    use crate::diskstats::{DiskStats, StatsProvider, PROC_DISKSTATS};
    use crate::sgio::Spindown;

    /// Shorthand for one snapshot entry
    pub fn disk(name: &str, reads: u64, writes: u64) -> DiskStats {
        DiskStats { name: name.to_string(), reads, writes }
    }

    /// Console sink whose output can be inspected after the fact
    #[derive(Clone, Default)]
    pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl SharedBuffer {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn contents(&self) -> String {
            let buf = self.0.lock().unwrap();
            String::from_utf8_lossy(&buf).into_owned()
        }
    }

    impl Write for SharedBuffer {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(data);
            Ok(data.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Hands out pre-recorded snapshots, one per call
    #[derive(Default)]
    pub struct ScriptedStats {
        pub snapshots: VecDeque<Vec<DiskStats>>,
    }

    impl ScriptedStats {
        pub fn new(snapshots: Vec<Vec<DiskStats>>) -> Self {
            Self { snapshots: snapshots.into() }
        }
    }

    impl StatsProvider for ScriptedStats {
        fn snapshot(&mut self) -> Result<Vec<DiskStats>> {
            self.snapshots
                .pop_front()
                .ok_or_else(|| HdIdleError::DiskStats {
                    path: PathBuf::from(PROC_DISKSTATS),
                    reason: "no snapshot scripted".to_string(),
                })
        }
    }

    /// Records every stop command it is asked to send
    #[derive(Default)]
    pub struct RecordingSpindown {
        pub calls: Vec<(String, CommandType)>,
    }

    impl Spindown for RecordingSpindown {
        fn spindown(&mut self, device: &str, command_type: CommandType) -> Result<()> {
            self.calls.push((device.to_string(), command_type));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_utils::*;
    use crate::config::CommandType;
    use crate::diskstats::StatsProvider;
    use crate::sgio::Spindown;
    use std::io::Write;

    #[test]
    fn test_shared_buffer_clones_share_output() {
        let buf = SharedBuffer::new();
        let mut writer = buf.clone();
        writeln!(writer, "sda spinup").unwrap();
        assert_eq!(buf.contents(), "sda spinup\n");
    }

    #[test]
    fn test_scripted_stats_runs_out() {
        let mut stats = ScriptedStats::new(vec![vec![disk("sda", 1, 2)]]);
        assert_eq!(stats.snapshot().unwrap(), vec![disk("sda", 1, 2)]);
        assert!(stats.snapshot().is_err());
    }

    #[test]
    fn test_recording_spindown() {
        let mut rec = RecordingSpindown::default();
        rec.spindown("/dev/sda", CommandType::Ata).unwrap();
        assert_eq!(rec.calls, vec![("/dev/sda".to_string(), CommandType::Ata)]);
    }
}
