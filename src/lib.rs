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

//! hd-idle - spin down idle hard disks on Linux
//!
//! Watches the read/write counters in /proc/diskstats and puts any disk that
//! has been idle longer than its threshold into standby, tracking each disk
//! across polling cycles and across host suspend/resume.

pub mod config;
pub mod diskstats;
pub mod logger;
pub mod monitor;
pub mod report;
pub mod resolver;
pub mod service;
pub mod sgio;

#[cfg(test)]
pub mod test_utils;
