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

use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use hd_error::{HdIdleError, Result};

/// Idle threshold applied to devices without an override
pub const DEFAULT_IDLE_TIME: Duration = Duration::from_secs(600);

/// Poll interval used when every idle threshold is disabled
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A gap between cycles longer than this many poll intervals is a suspend
const SKEW_FACTOR: u32 = 3;

const MAX_DEVICES: usize = 256;

/// Environment variable naming a JSON configuration file
pub const CONFIG_ENV: &str = "HD_IDLE_CONFIG";

/// Command protocol used to stop a disk
#[derive(Debug, Copy, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CommandType {
    #[default]
    Scsi,
    Ata,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::Scsi => "scsi",
            CommandType::Ata => "ata",
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandType {
    type Err = HdIdleError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "scsi" => Ok(CommandType::Scsi),
            "ata" => Ok(CommandType::Ata),
            other => Err(HdIdleError::invalid_config(
                "command_type",
                format!("unknown command type '{}' (expected scsi or ata)", other),
            )),
        }
    }
}

/// When configured device names are resolved through the filesystem.
///
/// Every name is resolved once at startup. `Enabled` keeps retrying names
/// that did not resolve on every polling cycle.
#[derive(Debug, Copy, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SymlinkPolicy {
    #[default]
    Disabled,
    Enabled,
}

impl SymlinkPolicy {
    /// Parse the numeric form used on the command line
    pub fn from_flag(s: &str) -> Result<Self> {
        match s {
            "0" => Ok(SymlinkPolicy::Disabled),
            "1" => Ok(SymlinkPolicy::Enabled),
            other => Err(HdIdleError::invalid_config(
                "symlink_policy",
                format!("expected 0 or 1, got '{}'", other),
            )),
        }
    }

    fn as_flag(&self) -> u8 {
        match self {
            SymlinkPolicy::Disabled => 0,
            SymlinkPolicy::Enabled => 1,
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

mod opt_duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|v| v.map(Duration::from_secs))
    }
}

fn default_idle() -> Duration { DEFAULT_IDLE_TIME }

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Defaults {
    /// Idle threshold in seconds; zero disables spin-down
    #[serde(default = "default_idle", with = "duration_secs")]
    pub idle: Duration,
    #[serde(default)]
    pub command_type: CommandType,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub symlink_policy: SymlinkPolicy,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            idle: DEFAULT_IDLE_TIME,
            command_type: CommandType::default(),
            debug: false,
            log_file: None,
            symlink_policy: SymlinkPolicy::default(),
        }
    }
}

/// Per-device override as configured
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConf {
    /// Canonical kernel name, empty until the given name resolves
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    pub given_name: String,
    #[serde(default, with = "opt_duration_secs")]
    pub idle: Option<Duration>,
    #[serde(default)]
    pub command_type: Option<CommandType>,
}

impl DeviceConf {
    pub fn new(given_name: impl Into<String>) -> Self {
        Self {
            name: String::new(),
            given_name: given_name.into(),
            idle: None,
            command_type: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        !self.name.is_empty()
    }
}

impl fmt::Display for DeviceConf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "name={}, givenName={}", self.name, self.given_name)?;
        match self.idle {
            Some(idle) => write!(f, ", idle={}", idle.as_secs())?,
            None => write!(f, ", idle=default")?,
        }
        match self.command_type {
            Some(ct) => write!(f, ", commandType={}", ct),
            None => write!(f, ", commandType=default"),
        }
    }
}

/// Effective settings for one device, as returned by [`Config::device_config`]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DeviceSettings {
    pub idle: Duration,
    pub command_type: CommandType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub devices: Vec<DeviceConf>,
    /// Zero means "derive from the poll interval"
    #[serde(default, with = "duration_secs")]
    pub skew_time: Duration,
}

impl Config {
    /// Effective idle threshold and protocol for a canonical device name.
    ///
    /// Overrides whose name has not resolved yet never match.
    pub fn device_config(&self, name: &str) -> DeviceSettings {
        let found = self
            .devices
            .iter()
            .find(|d| d.is_resolved() && d.name == name);
        match found {
            Some(d) => DeviceSettings {
                idle: d.idle.unwrap_or(self.defaults.idle),
                command_type: d.command_type.unwrap_or(self.defaults.command_type),
            },
            None => DeviceSettings {
                idle: self.defaults.idle,
                command_type: self.defaults.command_type,
            },
        }
    }

    /// One tenth of the shortest enabled idle threshold, never below one second
    pub fn poll_interval(&self) -> Duration {
        let shortest = std::iter::once(self.defaults.idle)
            .chain(self.devices.iter().filter_map(|d| d.idle))
            .filter(|idle| !idle.is_zero())
            .min();
        match shortest {
            Some(idle) => (idle / 10).max(MIN_POLL_INTERVAL),
            None => DEFAULT_POLL_INTERVAL,
        }
    }

    /// Fill in values derived from the rest of the configuration
    pub fn finalize(&mut self) {
        if self.skew_time.is_zero() {
            self.skew_time = self.poll_interval() * SKEW_FACTOR;
        }
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "symlinkPolicy={}, defaultIdle={}, defaultCommand={}, debug={}, logFile={}, skewTime={}, devices=",
            self.defaults.symlink_policy.as_flag(),
            self.defaults.idle.as_secs(),
            self.defaults.command_type,
            self.defaults.debug,
            self.defaults
                .log_file
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            self.skew_time.as_secs(),
        )?;
        for device in &self.devices {
            write!(f, "{{{}}}", device)?;
        }
        Ok(())
    }
}

fn is_safe_name(s: &str) -> bool {
    !s.is_empty() && s.len() <= 4096 && !s.contains('\0')
}

pub fn validate_config(cfg: &Config) -> Result<()> {
    if cfg.devices.len() > MAX_DEVICES {
        return Err(HdIdleError::invalid_config(
            "devices",
            format!("too many devices (max {})", MAX_DEVICES),
        ));
    }
    for (i, d) in cfg.devices.iter().enumerate() {
        if !is_safe_name(&d.given_name) {
            return Err(HdIdleError::invalid_config(
                "devices",
                format!("invalid device name in entry #{}", i + 1),
            ));
        }
        if cfg.devices[..i].iter().any(|prev| prev.given_name == d.given_name) {
            return Err(HdIdleError::invalid_config(
                "devices",
                format!("device {} configured twice", d.given_name),
            ));
        }
    }
    if let Some(log) = &cfg.defaults.log_file {
        if log.as_os_str().is_empty() {
            return Err(HdIdleError::invalid_config("log_file", "empty path"));
        }
    }
    Ok(())
}

pub fn config_path_from_env() -> Option<PathBuf> {
    env::var_os(CONFIG_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// Load and validate a JSON configuration file
pub fn load_config_file(path: &Path) -> Result<Config> {
    let mut cfg = read_config_file(path)?;
    cfg.finalize();
    Ok(cfg)
}

/// Parse and validate a JSON config file, leaving derived values unset
fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path).map_err(|source| HdIdleError::FileRead {
        path: path.to_path_buf(),
        source,
    })?;
    let cfg: Config = serde_json::from_str(&data)?;
    validate_config(&cfg)?;
    Ok(cfg)
}

/// What the command line asks the binary to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Run(Config),
    /// Stop one disk right away and exit
    SpindownNow {
        device: String,
        command_type: CommandType,
    },
    Help,
    Version,
}

fn next_value<'a>(flag: &str, it: &mut impl Iterator<Item = &'a String>) -> Result<&'a String> {
    it.next()
        .ok_or_else(|| HdIdleError::usage(format!("option {} requires a value", flag)))
}

fn parse_seconds(flag: &str, v: &str) -> Result<Duration> {
    v.parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| HdIdleError::usage(format!("option {} expects seconds, got '{}'", flag, v)))
}

/// Parse hd-idle style arguments (without the program name).
///
/// `-i` and `-c` apply to the defaults until the first `-a`, and to the most
/// recent `-a` device after it. A JSON file given with `--config` (or through
/// `HD_IDLE_CONFIG`) is loaded first and the flags are applied on top of it.
pub fn parse_args<I>(args: I) -> Result<Command>
where
    I: IntoIterator<Item = String>,
{
    let args: Vec<String> = args.into_iter().collect();

    let file = match args.iter().position(|a| a == "--config") {
        Some(pos) => Some(PathBuf::from(
            args.get(pos + 1)
                .ok_or_else(|| HdIdleError::usage("option --config requires a value"))?,
        )),
        None => config_path_from_env(),
    };
    let mut cfg = match file {
        Some(path) => read_config_file(&path)?,
        None => Config::default(),
    };

    let mut current: Option<usize> = None;
    let mut spindown_now: Option<String> = None;
    let mut it = args.iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(Command::Help),
            "-v" | "--version" => return Ok(Command::Version),
            "--config" => {
                next_value(arg, &mut it)?;
            }
            "-a" => {
                let name = next_value(arg, &mut it)?;
                cfg.devices.push(DeviceConf::new(name.clone()));
                current = Some(cfg.devices.len() - 1);
            }
            "-i" => {
                let idle = parse_seconds(arg, next_value(arg, &mut it)?)?;
                match current {
                    Some(i) => cfg.devices[i].idle = Some(idle),
                    None => cfg.defaults.idle = idle,
                }
            }
            "-c" => {
                let ct: CommandType = next_value(arg, &mut it)?
                    .parse()
                    .map_err(|e: HdIdleError| HdIdleError::usage(e.to_string()))?;
                match current {
                    Some(i) => cfg.devices[i].command_type = Some(ct),
                    None => cfg.defaults.command_type = ct,
                }
            }
            "-s" => {
                cfg.defaults.symlink_policy = SymlinkPolicy::from_flag(next_value(arg, &mut it)?)
                    .map_err(|e| HdIdleError::usage(e.to_string()))?;
            }
            "-l" => {
                cfg.defaults.log_file = Some(PathBuf::from(next_value(arg, &mut it)?));
            }
            "-d" => cfg.defaults.debug = true,
            "-t" => spindown_now = Some(next_value(arg, &mut it)?.clone()),
            other => return Err(HdIdleError::usage(format!("unknown option '{}'", other))),
        }
    }

    if let Some(device) = spindown_now {
        return Ok(Command::SpindownNow {
            device,
            command_type: cfg.defaults.command_type,
        });
    }

    validate_config(&cfg)?;
    cfg.finalize();
    Ok(Command::Run(cfg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn run_config(list: &[&str]) -> Config {
        match parse_args(args(list)).unwrap() {
            Command::Run(cfg) => cfg,
            other => panic!("expected Run, got {:?}", other),
        }
    }

    fn resolved(name: &str, idle: Option<u64>, ct: Option<CommandType>) -> DeviceConf {
        DeviceConf {
            name: name.to_string(),
            given_name: format!("/dev/disk/by-id/{}", name),
            idle: idle.map(Duration::from_secs),
            command_type: ct,
        }
    }

    #[test]
    fn test_command_type_serialization() {
        assert_eq!(serde_json::to_string(&CommandType::Scsi).unwrap(), "\"scsi\"");
        assert_eq!(serde_json::to_string(&CommandType::Ata).unwrap(), "\"ata\"");
        assert_eq!("ata".parse::<CommandType>().unwrap(), CommandType::Ata);
        assert!("sata".parse::<CommandType>().is_err());
    }

    #[test]
    fn test_symlink_policy_flag() {
        assert_eq!(SymlinkPolicy::from_flag("0").unwrap(), SymlinkPolicy::Disabled);
        assert_eq!(SymlinkPolicy::from_flag("1").unwrap(), SymlinkPolicy::Enabled);
        assert!(SymlinkPolicy::from_flag("2").is_err());
    }

    #[test]
    fn test_device_config_falls_back_to_defaults() {
        let cfg = Config::default();
        let s = cfg.device_config("sda");
        assert_eq!(s.idle, DEFAULT_IDLE_TIME);
        assert_eq!(s.command_type, CommandType::Scsi);
    }

    #[test]
    fn test_device_config_override_takes_precedence() {
        let mut cfg = Config::default();
        cfg.defaults.idle = Duration::from_secs(300);
        cfg.devices.push(resolved("sdb", Some(1200), Some(CommandType::Ata)));

        let s = cfg.device_config("sdb");
        assert_eq!(s.idle, Duration::from_secs(1200));
        assert_eq!(s.command_type, CommandType::Ata);

        let other = cfg.device_config("sda");
        assert_eq!(other.idle, Duration::from_secs(300));
        assert_eq!(other.command_type, CommandType::Scsi);
    }

    #[test]
    fn test_device_config_partial_override() {
        let mut cfg = Config::default();
        cfg.defaults.command_type = CommandType::Ata;
        cfg.devices.push(resolved("sdc", Some(60), None));
        let s = cfg.device_config("sdc");
        assert_eq!(s.idle, Duration::from_secs(60));
        assert_eq!(s.command_type, CommandType::Ata);
    }

    #[test]
    fn test_device_config_unresolved_override_is_inert() {
        let mut cfg = Config::default();
        let mut dev = DeviceConf::new("/dev/disk/by-label/backup");
        dev.idle = Some(Duration::from_secs(5));
        cfg.devices.push(dev);
        // An empty canonical name must never match anything
        assert_eq!(cfg.device_config("").idle, DEFAULT_IDLE_TIME);
        assert_eq!(cfg.device_config("backup").idle, DEFAULT_IDLE_TIME);
    }

    #[test]
    fn test_poll_interval() {
        let mut cfg = Config::default();
        assert_eq!(cfg.poll_interval(), Duration::from_secs(60));

        cfg.devices.push(resolved("sda", Some(120), None));
        assert_eq!(cfg.poll_interval(), Duration::from_secs(12));

        cfg.devices.push(resolved("sdb", Some(3), None));
        assert_eq!(cfg.poll_interval(), MIN_POLL_INTERVAL);

        let mut off = Config::default();
        off.defaults.idle = Duration::ZERO;
        assert_eq!(off.poll_interval(), DEFAULT_POLL_INTERVAL);
    }

    #[test]
    fn test_finalize_derives_skew_time() {
        let mut cfg = Config::default();
        cfg.finalize();
        assert_eq!(cfg.skew_time, Duration::from_secs(180));

        let mut explicit = Config { skew_time: Duration::from_secs(7), ..Config::default() };
        explicit.finalize();
        assert_eq!(explicit.skew_time, Duration::from_secs(7));
    }

    #[test]
    #[serial]
    fn test_parse_args_scoping() {
        env::remove_var(CONFIG_ENV);
        let cfg = run_config(&[
            "-i", "300", "-c", "ata", "-a", "sda", "-i", "60", "-a", "/dev/disk/by-id/x", "-c", "scsi",
            "-l", "/var/log/hd-idle.log", "-d", "-s", "1",
        ]);
        assert_eq!(cfg.defaults.idle, Duration::from_secs(300));
        assert_eq!(cfg.defaults.command_type, CommandType::Ata);
        assert!(cfg.defaults.debug);
        assert_eq!(cfg.defaults.symlink_policy, SymlinkPolicy::Enabled);
        assert_eq!(cfg.defaults.log_file, Some(PathBuf::from("/var/log/hd-idle.log")));
        assert_eq!(cfg.devices.len(), 2);
        assert_eq!(cfg.devices[0].given_name, "sda");
        assert_eq!(cfg.devices[0].idle, Some(Duration::from_secs(60)));
        assert_eq!(cfg.devices[0].command_type, None);
        assert_eq!(cfg.devices[1].idle, None);
        assert_eq!(cfg.devices[1].command_type, Some(CommandType::Scsi));
        assert!(cfg.devices.iter().all(|d| d.name.is_empty()));
        // shortest idle is 60s
        assert_eq!(cfg.skew_time, Duration::from_secs(18));
    }

    #[test]
    #[serial]
    fn test_parse_args_errors() {
        env::remove_var(CONFIG_ENV);
        assert!(matches!(parse_args(args(&["-i"])), Err(HdIdleError::Usage(_))));
        assert!(matches!(parse_args(args(&["-i", "ten"])), Err(HdIdleError::Usage(_))));
        assert!(matches!(parse_args(args(&["-c", "nvme"])), Err(HdIdleError::Usage(_))));
        assert!(matches!(parse_args(args(&["-s", "yes"])), Err(HdIdleError::Usage(_))));
        assert!(matches!(parse_args(args(&["--bogus"])), Err(HdIdleError::Usage(_))));
        assert!(parse_args(args(&["-a", "sda", "-a", "sda"])).is_err());
    }

    #[test]
    #[serial]
    fn test_parse_args_commands() {
        env::remove_var(CONFIG_ENV);
        assert_eq!(parse_args(args(&["-h"])).unwrap(), Command::Help);
        assert_eq!(parse_args(args(&["--version"])).unwrap(), Command::Version);
        assert_eq!(
            parse_args(args(&["-c", "ata", "-t", "sdb"])).unwrap(),
            Command::SpindownNow { device: "sdb".to_string(), command_type: CommandType::Ata }
        );
    }

    #[test]
    #[serial]
    fn test_config_file_then_flags() {
        env::remove_var(CONFIG_ENV);
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"defaults": {{"idle": 900, "command_type": "ata", "symlink_policy": "enabled"}},
                "devices": [{{"given_name": "sdb", "idle": 0}}]}}"#
        )
        .unwrap();
        let path = file.path().to_string_lossy().to_string();

        let cfg = run_config(&["--config", &path, "-i", "1200"]);
        assert_eq!(cfg.defaults.idle, Duration::from_secs(1200));
        assert_eq!(cfg.defaults.command_type, CommandType::Ata);
        assert_eq!(cfg.defaults.symlink_policy, SymlinkPolicy::Enabled);
        assert_eq!(cfg.devices[0].idle, Some(Duration::ZERO));
        assert_eq!(cfg.skew_time, Duration::from_secs(360));

        env::set_var(CONFIG_ENV, &path);
        let from_env = run_config(&[]);
        assert_eq!(from_env.defaults.idle, Duration::from_secs(900));
        env::remove_var(CONFIG_ENV);
    }

    #[test]
    #[serial]
    fn test_config_file_skew_time_survives_flags() {
        env::remove_var(CONFIG_ENV);
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"defaults": {{"idle": 600}}, "skew_time": 300}}"#).unwrap();
        let path = file.path().to_string_lossy().to_string();

        assert_eq!(load_config_file(file.path()).unwrap().skew_time, Duration::from_secs(300));
        let cfg = run_config(&["--config", &path]);
        assert_eq!(cfg.skew_time, Duration::from_secs(300));
        let cfg = run_config(&["--config", &path, "-i", "60"]);
        assert_eq!(cfg.skew_time, Duration::from_secs(300));
    }

    #[test]
    fn test_load_config_file_rejects_unknown_fields() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"defaults": {{"idle": 10, "spin": true}}}}"#).unwrap();
        assert!(matches!(load_config_file(file.path()), Err(HdIdleError::JsonParse(_))));
    }

    #[test]
    fn test_load_config_file_missing() {
        let err = load_config_file(Path::new("/nonexistent/hd-idle.json")).unwrap_err();
        assert!(matches!(err, HdIdleError::FileRead { .. }));
    }

    #[test]
    fn test_validate_config_too_many_devices() {
        let mut cfg = Config::default();
        cfg.devices = (0..257).map(|i| DeviceConf::new(format!("sd{}", i))).collect();
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn test_display() {
        let mut cfg = Config::default();
        cfg.devices.push(resolved("sda", Some(60), Some(CommandType::Ata)));
        cfg.finalize();
        let s = cfg.to_string();
        assert!(s.starts_with("symlinkPolicy=0, defaultIdle=600, defaultCommand=scsi"));
        assert!(s.contains("{name=sda, givenName=/dev/disk/by-id/sda, idle=60, commandType=ata}"));
    }
}
