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

//! Stop commands sent to a block device through the Linux SG_IO ioctl.
//!
//! SCSI disks get START STOP UNIT with the start bit cleared. ATA disks get
//! STANDBY IMMEDIATE wrapped in a 16-byte ATA PASS-THROUGH command, which is
//! how libata and USB bridges expose ATA commands.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;

use thiserror::Error;
use tracing::debug;

use hd_error::{HdIdleError, Result};

use crate::config::CommandType;

const SG_IO: u32 = 0x2285;
const SG_INTERFACE_ID: libc::c_int = b'S' as libc::c_int;
const SG_DXFER_NONE: libc::c_int = -1;
const SG_TIMEOUT_MS: libc::c_uint = 60_000;
const SENSE_LEN: usize = 32;

const START_STOP_UNIT: u8 = 0x1b;
const ATA_PASS_THROUGH_16: u8 = 0x85;
/// Protocol field: non-data
const ATA_PROTOCOL_NON_DATA: u8 = 3 << 1;
/// Ask for the ATA registers back in the sense data
const ATA_CK_COND: u8 = 0x20;
const ATA_OP_STANDBY_NOW1: u8 = 0xe0;
const ATA_OP_STANDBY_NOW2: u8 = 0x94;

const SAM_STAT_GOOD: u8 = 0x00;
const SAM_STAT_CHECK_CONDITION: u8 = 0x02;
const DRIVER_SENSE: u16 = 0x08;
const ATA_STATUS_ERR: u8 = 0x01;

/// Mirrors `struct sg_io_hdr` from <scsi/sg.h>
#[repr(C)]
struct SgIoHdr {
    interface_id: libc::c_int,
    dxfer_direction: libc::c_int,
    cmd_len: libc::c_uchar,
    mx_sb_len: libc::c_uchar,
    iovec_count: libc::c_ushort,
    dxfer_len: libc::c_uint,
    dxferp: *mut libc::c_void,
    cmdp: *mut libc::c_uchar,
    sbp: *mut libc::c_uchar,
    timeout: libc::c_uint,
    flags: libc::c_uint,
    pack_id: libc::c_int,
    usr_ptr: *mut libc::c_void,
    status: libc::c_uchar,
    masked_status: libc::c_uchar,
    msg_status: libc::c_uchar,
    sb_len_wr: libc::c_uchar,
    host_status: libc::c_ushort,
    driver_status: libc::c_ushort,
    resid: libc::c_int,
    duration: libc::c_uint,
    info: libc::c_uint,
}

#[derive(Debug, Error)]
pub enum SgIoError {
    #[error("cannot open device: {0}")]
    Open(io::Error),
    #[error("SG_IO ioctl failed: {0}")]
    Ioctl(io::Error),
    #[error("transport error (host_status={host:#04x}, driver_status={driver:#04x})")]
    Transport { host: u16, driver: u16 },
    #[error("device returned SCSI status {0:#04x}")]
    ScsiStatus(u8),
    #[error("device returned ATA status {status:#04x}, error {error:#04x}")]
    AtaStatus { status: u8, error: u8 },
}

/// Outcome of one SG_IO round trip
struct SgIoReply {
    status: u8,
    host_status: u16,
    driver_status: u16,
    sense: [u8; SENSE_LEN],
    sense_len: usize,
}

/// Capability to put a disk into standby
#[cfg_attr(test, mockall::automock)]
pub trait Spindown {
    fn spindown(&mut self, device: &str, command_type: CommandType) -> Result<()>;
}

/// Spins disks down with real SG_IO commands
#[derive(Debug, Default, Clone, Copy)]
pub struct SgIoSpindown;

impl Spindown for SgIoSpindown {
    fn spindown(&mut self, device: &str, command_type: CommandType) -> Result<()> {
        let res = match command_type {
            CommandType::Scsi => stop_scsi_device(device),
            CommandType::Ata => stop_ata_device(device),
        };
        res.map_err(|e| HdIdleError::Spindown {
            device: device.to_string(),
            protocol: command_type.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Device node for a kernel disk name; paths are passed through
pub fn device_path(name: &str) -> String {
    if name.contains('/') {
        name.to_string()
    } else {
        format!("/dev/{}", name)
    }
}

fn open_device(device: &str) -> std::result::Result<File, SgIoError> {
    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(device)
        .map_err(SgIoError::Open)
}

fn sg_io(file: &File, cdb: &mut [u8]) -> std::result::Result<SgIoReply, SgIoError> {
    let mut sense = [0u8; SENSE_LEN];
    let mut hdr = SgIoHdr {
        interface_id: SG_INTERFACE_ID,
        dxfer_direction: SG_DXFER_NONE,
        cmd_len: cdb.len() as libc::c_uchar,
        mx_sb_len: SENSE_LEN as libc::c_uchar,
        iovec_count: 0,
        dxfer_len: 0,
        dxferp: std::ptr::null_mut(),
        cmdp: cdb.as_mut_ptr(),
        sbp: sense.as_mut_ptr(),
        timeout: SG_TIMEOUT_MS,
        flags: 0,
        pack_id: 0,
        usr_ptr: std::ptr::null_mut(),
        status: 0,
        masked_status: 0,
        msg_status: 0,
        sb_len_wr: 0,
        host_status: 0,
        driver_status: 0,
        resid: 0,
        duration: 0,
        info: 0,
    };
    // SAFETY: hdr is a fully initialised sg_io_hdr whose cdb and sense pointers
    // stay valid for the duration of the call; no data buffer is transferred.
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), SG_IO as _, &mut hdr as *mut SgIoHdr) };
    if rc != 0 {
        return Err(SgIoError::Ioctl(io::Error::last_os_error()));
    }
    Ok(SgIoReply {
        status: hdr.status,
        host_status: hdr.host_status,
        driver_status: hdr.driver_status,
        sense_len: usize::from(hdr.sb_len_wr).min(SENSE_LEN),
        sense,
    })
}

fn scsi_stop_cdb() -> [u8; 6] {
    // LOEJ=0, START=0
    [START_STOP_UNIT, 0, 0, 0, 0, 0]
}

fn ata_standby_cdb(opcode: u8) -> [u8; 16] {
    let mut cdb = [0u8; 16];
    cdb[0] = ATA_PASS_THROUGH_16;
    cdb[1] = ATA_PROTOCOL_NON_DATA;
    cdb[2] = ATA_CK_COND;
    cdb[14] = opcode;
    cdb
}

/// Extract (status, error) from an ATA Status Return sense descriptor
fn ata_registers(sense: &[u8]) -> Option<(u8, u8)> {
    if sense.len() < 22 || sense[0] & 0x7f != 0x72 {
        return None;
    }
    // Descriptor starts right after the 8-byte header
    if sense[8] != 0x09 {
        return None;
    }
    Some((sense[21], sense[11]))
}

fn check_transport(reply: &SgIoReply) -> std::result::Result<(), SgIoError> {
    if reply.host_status != 0 || reply.driver_status & !DRIVER_SENSE != 0 {
        return Err(SgIoError::Transport {
            host: reply.host_status,
            driver: reply.driver_status,
        });
    }
    Ok(())
}

fn check_scsi_reply(reply: &SgIoReply) -> std::result::Result<(), SgIoError> {
    check_transport(reply)?;
    match reply.status {
        SAM_STAT_GOOD => Ok(()),
        other => Err(SgIoError::ScsiStatus(other)),
    }
}

fn check_ata_reply(reply: &SgIoReply) -> std::result::Result<(), SgIoError> {
    check_transport(reply)?;
    match reply.status {
        SAM_STAT_GOOD => Ok(()),
        SAM_STAT_CHECK_CONDITION => match ata_registers(&reply.sense[..reply.sense_len]) {
            Some((status, error)) if status & ATA_STATUS_ERR != 0 => {
                Err(SgIoError::AtaStatus { status, error })
            }
            Some(_) => Ok(()),
            None => Err(SgIoError::ScsiStatus(reply.status)),
        },
        other => Err(SgIoError::ScsiStatus(other)),
    }
}

pub fn stop_scsi_device(device: &str) -> std::result::Result<(), SgIoError> {
    let file = open_device(device)?;
    let reply = sg_io(&file, &mut scsi_stop_cdb())?;
    check_scsi_reply(&reply)
}

pub fn stop_ata_device(device: &str) -> std::result::Result<(), SgIoError> {
    let file = open_device(device)?;
    let reply = sg_io(&file, &mut ata_standby_cdb(ATA_OP_STANDBY_NOW1))?;
    match check_ata_reply(&reply) {
        Ok(()) => Ok(()),
        Err(SgIoError::AtaStatus { .. }) => {
            debug!("{} rejected STANDBY IMMEDIATE (0xe0), retrying with 0x94", device);
            let reply = sg_io(&file, &mut ata_standby_cdb(ATA_OP_STANDBY_NOW2))?;
            check_ata_reply(&reply)
        }
        Err(e) => Err(e),
    }
}
