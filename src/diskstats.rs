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

//! Point-in-time read/write counters for every whole disk, from /proc/diskstats.

use std::fs;
use std::path::{Path, PathBuf};

use hd_error::{HdIdleError, Result};

pub const PROC_DISKSTATS: &str = "/proc/diskstats";
pub const SYS_BLOCK: &str = "/sys/block";

/// Virtual devices that never spin
const IGNORED_PREFIXES: &[&str] = &["loop", "ram", "zram"];

/// Minimum fields on a diskstats line (kernels >= 2.6 emit 14 or more)
const MIN_FIELDS: usize = 14;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskStats {
    pub name: String,
    /// Reads completed
    pub reads: u64,
    /// Writes completed
    pub writes: u64,
}

/// Source of counter snapshots
#[cfg_attr(test, mockall::automock)]
pub trait StatsProvider {
    fn snapshot(&mut self) -> Result<Vec<DiskStats>>;
}

#[derive(Debug, Clone)]
pub struct ProcDiskStats {
    diskstats: PathBuf,
    sys_block: PathBuf,
}

impl Default for ProcDiskStats {
    fn default() -> Self {
        Self::with_paths(PROC_DISKSTATS, SYS_BLOCK)
    }
}

impl ProcDiskStats {
    pub fn with_paths(diskstats: impl Into<PathBuf>, sys_block: impl Into<PathBuf>) -> Self {
        Self {
            diskstats: diskstats.into(),
            sys_block: sys_block.into(),
        }
    }

    fn is_whole_disk(&self, name: &str) -> bool {
        if IGNORED_PREFIXES.iter().any(|p| name.starts_with(p)) {
            return false;
        }
        self.sys_block.join(name).exists()
    }
}

impl StatsProvider for ProcDiskStats {
    fn snapshot(&mut self) -> Result<Vec<DiskStats>> {
        let data = fs::read_to_string(&self.diskstats).map_err(|source| HdIdleError::FileRead {
            path: self.diskstats.clone(),
            source,
        })?;
        let mut stats = parse_diskstats(&data, &self.diskstats)?;
        stats.retain(|s| self.is_whole_disk(&s.name));
        Ok(stats)
    }
}

fn parse_counter(field: &str, what: &str, name: &str, path: &Path) -> Result<u64> {
    field.parse::<u64>().map_err(|_| HdIdleError::DiskStats {
        path: path.to_path_buf(),
        reason: format!("invalid {} counter '{}' for {}", what, field, name),
    })
}

/// Parse the contents of a diskstats file. Short lines are skipped.
pub fn parse_diskstats(data: &str, path: &Path) -> Result<Vec<DiskStats>> {
    let mut out = Vec::new();
    for line in data.lines() {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < MIN_FIELDS {
            continue;
        }
        let name = cols[2];
        out.push(DiskStats {
            name: name.to_string(),
            reads: parse_counter(cols[3], "read", name, path)?,
            writes: parse_counter(cols[7], "write", name, path)?,
        });
    }
    Ok(out)
}
