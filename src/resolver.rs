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

//! Maps configured device names (often /dev/disk/by-* symlinks) to the kernel
//! names that appear in /proc/diskstats.

use std::fs;
use std::path::Path;

use tracing::{debug, warn};

use hd_error::{HdIdleError, Result};

use crate::config::{Config, DeviceConf, SymlinkPolicy};
use crate::report::Reporter;

#[cfg_attr(test, mockall::automock)]
pub trait NameResolver {
    /// Canonical kernel name for `given_name`, e.g. `sda`
    fn resolve(&self, given_name: &str) -> Result<String>;
}

/// Follows symlinks through the filesystem
#[derive(Debug, Default, Clone, Copy)]
pub struct FsResolver;

impl NameResolver for FsResolver {
    fn resolve(&self, given_name: &str) -> Result<String> {
        let real = fs::canonicalize(Path::new(given_name)).map_err(|e| HdIdleError::Resolve {
            name: given_name.to_string(),
            reason: e.to_string(),
        })?;
        real.file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| HdIdleError::Resolve {
                name: given_name.to_string(),
                reason: format!("{} is not a device node", real.display()),
            })
    }
}

fn resolve_one(
    device: &mut DeviceConf,
    resolver: &dyn NameResolver,
    reporter: &mut Reporter,
    debug_enabled: bool,
) -> Result<bool> {
    match resolver.resolve(&device.given_name) {
        Ok(name) => {
            reporter.symlink_resolved(&device.given_name, &name)?;
            device.name = name;
            Ok(true)
        }
        Err(e) => {
            debug!("{}", e);
            if debug_enabled {
                reporter.resolve_failed(&device.given_name)?;
            }
            Ok(false)
        }
    }
}

/// Startup pass over every configured device, independent of the policy.
///
/// Names without a `/` are already kernel names and are taken as-is.
pub fn resolve_at_startup(
    config: &mut Config,
    resolver: &dyn NameResolver,
    reporter: &mut Reporter,
) -> Result<()> {
    let debug_enabled = config.defaults.debug;
    let retry = config.defaults.symlink_policy == SymlinkPolicy::Enabled;
    for device in config.devices.iter_mut().filter(|d| !d.is_resolved()) {
        if device.given_name.contains('/') {
            if !resolve_one(device, resolver, reporter, debug_enabled)? && !retry {
                warn!(
                    "unable to resolve {}; its settings are ignored until restart (use -s 1 to keep retrying)",
                    device.given_name
                );
            }
        } else {
            device.name = device.given_name.clone();
        }
    }
    Ok(())
}

/// Per-cycle retry of names that have not resolved yet. Only runs with
/// [`SymlinkPolicy::Enabled`]; resolved entries are never touched again.
pub fn resolve_symlinks(
    config: &mut Config,
    resolver: &dyn NameResolver,
    reporter: &mut Reporter,
) -> Result<()> {
    if config.defaults.symlink_policy == SymlinkPolicy::Disabled {
        return Ok(());
    }
    let debug_enabled = config.defaults.debug;
    for device in config.devices.iter_mut().filter(|d| !d.is_resolved()) {
        resolve_one(device, resolver, reporter, debug_enabled)?;
    }
    Ok(())
}
