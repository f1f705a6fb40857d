//! SCSI request blocks as they arrive from the class driver, and the sense
//! data the port returns with them.

use alloc::{vec, vec::Vec};

use bitflags::bitflags;

use crate::ata::{
    ATA_ERROR_ABRT, ATA_ERROR_ICRC, ATA_ERROR_IDNF, ATA_ERROR_MC, ATA_ERROR_MCR, ATA_ERROR_NM,
    ATA_ERROR_UNC, ATA_STATUS_DF,
};

pub const SCSIOP_TEST_UNIT_READY: u8 = 0x00;
pub const SCSIOP_REQUEST_SENSE: u8 = 0x03;
pub const SCSIOP_READ6: u8 = 0x08;
pub const SCSIOP_WRITE6: u8 = 0x0a;
pub const SCSIOP_INQUIRY: u8 = 0x12;
pub const SCSIOP_MODE_SELECT: u8 = 0x15;
pub const SCSIOP_MODE_SENSE: u8 = 0x1a;
pub const SCSIOP_START_STOP_UNIT: u8 = 0x1b;
pub const SCSIOP_READ_CAPACITY: u8 = 0x25;
pub const SCSIOP_READ: u8 = 0x28;
pub const SCSIOP_WRITE: u8 = 0x2a;
pub const SCSIOP_VERIFY: u8 = 0x2f;
pub const SCSIOP_SYNCHRONIZE_CACHE: u8 = 0x35;
pub const SCSIOP_MODE_SELECT10: u8 = 0x55;
pub const SCSIOP_MODE_SENSE10: u8 = 0x5a;
pub const SCSIOP_ATA_PASSTHROUGH16: u8 = 0x85;
pub const SCSIOP_READ16: u8 = 0x88;
pub const SCSIOP_WRITE16: u8 = 0x8a;
pub const SCSIOP_VERIFY16: u8 = 0x8f;
pub const SCSIOP_SYNCHRONIZE_CACHE16: u8 = 0x91;
pub const SCSIOP_SERVICE_ACTION_IN16: u8 = 0x9e;
pub const SCSIOP_ATA_PASSTHROUGH12: u8 = 0xa1;
pub const SCSIOP_READ12: u8 = 0xa8;
pub const SCSIOP_WRITE12: u8 = 0xaa;
pub const SCSIOP_VERIFY12: u8 = 0xaf;

pub const SERVICE_ACTION_READ_CAPACITY16: u8 = 0x10;

pub const SCSISTAT_GOOD: u8 = 0x00;
pub const SCSISTAT_CHECK_CONDITION: u8 = 0x02;

pub const SCSI_SENSE_NO_SENSE: u8 = 0x00;
pub const SCSI_SENSE_NOT_READY: u8 = 0x02;
pub const SCSI_SENSE_MEDIUM_ERROR: u8 = 0x03;
pub const SCSI_SENSE_HARDWARE_ERROR: u8 = 0x04;
pub const SCSI_SENSE_ILLEGAL_REQUEST: u8 = 0x05;
pub const SCSI_SENSE_UNIT_ATTENTION: u8 = 0x06;
pub const SCSI_SENSE_ABORTED_COMMAND: u8 = 0x0b;

pub const SCSI_ADSENSE_NO_SENSE: u8 = 0x00;
pub const SCSI_ADSENSE_UNRECOVERED_ERROR: u8 = 0x11;
pub const SCSI_ADSENSE_ILLEGAL_COMMAND: u8 = 0x20;
pub const SCSI_ADSENSE_ILLEGAL_BLOCK: u8 = 0x21;
pub const SCSI_ADSENSE_INVALID_CDB: u8 = 0x24;
pub const SCSI_ADSENSE_INVALID_FIELD_PARAMETER_LIST: u8 = 0x26;
pub const SCSI_ADSENSE_NO_MEDIA_IN_DEVICE: u8 = 0x3a;
pub const SCSI_ADSENSE_INTERNAL_TARGET_FAILURE: u8 = 0x44;
pub const SCSI_ADSENSE_LUN_COMMUNICATION: u8 = 0x08;
pub const SCSI_ADSENSE_CRC_ERROR: u8 = 0x47;

pub const SENSE_BUFFER_SIZE: usize = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SrbFunction {
    ExecuteScsi,
    IoControl,
    ClaimDevice,
    ReleaseDevice,
    Flush,
    Shutdown,
    ReleaseQueue,
    LockQueue,
    UnlockQueue,
    FlushQueue,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SrbStatus {
    #[default]
    Pending,
    Success,
    Aborted,
    Error,
    Busy,
    InvalidRequest,
    NoDevice,
    Timeout,
    DataOverrun,
    InsufficientResources,
}

bitflags! {
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct SrbFlags: u32 {
        const DATA_IN = 1 << 0;
        const DATA_OUT = 1 << 1;
        const NO_QUEUE_FREEZE = 1 << 2;
        const BYPASS_FROZEN_QUEUE = 1 << 3;
        const BYPASS_LOCKED_QUEUE = 1 << 4;
        const DISABLE_AUTOSENSE = 1 << 5;
    }
}

/// A SCSI request block.
#[derive(Debug, Clone)]
pub struct Srb {
    pub function: SrbFunction,
    pub path_id: u8,
    pub target_id: u8,
    pub lun: u8,
    pub cdb: [u8; 16],
    pub cdb_length: u8,
    pub flags: SrbFlags,
    pub data: Vec<u8>,
    /// Requested length on submission, transferred length on completion.
    pub data_transfer_length: u32,
    pub sense: Vec<u8>,
    /// Seconds.
    pub timeout: u32,
    /// Disk scheduling key, normally the starting LBA.
    pub sort_key: u64,

    pub status: SrbStatus,
    pub autosense_valid: bool,
    pub queue_frozen: bool,
    pub scsi_status: u8,
    pub(crate) retried: bool,
}

impl Srb {
    pub fn new(function: SrbFunction) -> Self {
        Self {
            function,
            path_id: 0,
            target_id: 0,
            lun: 0,
            cdb: [0; 16],
            cdb_length: 0,
            flags: SrbFlags::empty(),
            data: Vec::new(),
            data_transfer_length: 0,
            sense: vec![0; SENSE_BUFFER_SIZE],
            timeout: 10,
            sort_key: 0,
            status: SrbStatus::Pending,
            autosense_valid: false,
            queue_frozen: false,
            scsi_status: SCSISTAT_GOOD,
            retried: false,
        }
    }

    pub fn scsi(cdb: &[u8]) -> Self {
        let mut srb = Self::new(SrbFunction::ExecuteScsi);
        srb.cdb[..cdb.len()].copy_from_slice(cdb);
        srb.cdb_length = cdb.len() as u8;
        srb
    }

    /// A data-in SCSI command with a zeroed `len`-byte buffer.
    pub fn scsi_in(cdb: &[u8], len: usize) -> Self {
        let mut srb = Self::scsi(cdb);
        srb.flags |= SrbFlags::DATA_IN;
        srb.data = vec![0; len];
        srb.data_transfer_length = len as u32;
        srb
    }

    pub fn scsi_out(cdb: &[u8], data: Vec<u8>) -> Self {
        let mut srb = Self::scsi(cdb);
        srb.flags |= SrbFlags::DATA_OUT;
        srb.data_transfer_length = data.len() as u32;
        srb.data = data;
        srb
    }

    pub fn cdb(&self) -> &[u8] {
        &self.cdb[..self.cdb_length as usize]
    }

    pub fn opcode(&self) -> u8 {
        self.cdb[0]
    }

    pub fn is_write(&self) -> bool {
        self.flags.contains(SrbFlags::DATA_OUT)
    }

    /// Fails the request with CHECK CONDITION and, unless disabled, returns
    /// `sense` through autosense.
    pub fn set_check_condition(&mut self, sense: SenseData) {
        self.status = SrbStatus::Error;
        self.scsi_status = SCSISTAT_CHECK_CONDITION;
        if self.flags.contains(SrbFlags::DISABLE_AUTOSENSE) || self.sense.is_empty() {
            return;
        }
        sense.write_fixed(&mut self.sense);
        self.autosense_valid = true;
    }

    pub fn set_invalid_cdb(&mut self) {
        self.set_check_condition(SenseData::new(
            SCSI_SENSE_ILLEGAL_REQUEST,
            SCSI_ADSENSE_INVALID_CDB,
            0,
        ));
    }

    pub fn set_invalid_opcode(&mut self) {
        self.set_check_condition(SenseData::new(
            SCSI_SENSE_ILLEGAL_REQUEST,
            SCSI_ADSENSE_ILLEGAL_COMMAND,
            0,
        ));
    }
}

/// Fields of fixed-format sense data the port fills in.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SenseData {
    pub key: u8,
    pub asc: u8,
    pub ascq: u8,
    pub information: Option<u32>,
}

impl SenseData {
    pub const fn new(key: u8, asc: u8, ascq: u8) -> Self {
        Self {
            key,
            asc,
            ascq,
            information: None,
        }
    }

    pub fn write_fixed(&self, out: &mut [u8]) {
        let mut raw = [0u8; SENSE_BUFFER_SIZE];
        raw[0] = 0x70;
        raw[2] = self.key & 0xf;
        if let Some(info) = self.information {
            raw[0] |= 0x80;
            raw[3..7].copy_from_slice(&info.to_be_bytes());
        }
        raw[7] = (SENSE_BUFFER_SIZE - 8) as u8;
        raw[12] = self.asc;
        raw[13] = self.ascq;
        let len = out.len().min(SENSE_BUFFER_SIZE);
        out[..len].copy_from_slice(&raw[..len]);
    }

    pub fn parse_fixed(raw: &[u8]) -> Option<Self> {
        if raw.len() < 14 || raw[0] & 0x7e != 0x70 {
            return None;
        }
        Some(Self::new(raw[2] & 0xf, raw[12], raw[13]))
    }

    /// Sense data describing an ATA task-file error.
    pub fn from_ata_error(status: u8, error: u8) -> Self {
        if status & ATA_STATUS_DF != 0 {
            return Self::new(SCSI_SENSE_HARDWARE_ERROR, SCSI_ADSENSE_INTERNAL_TARGET_FAILURE, 0);
        }
        if error & ATA_ERROR_ICRC != 0 {
            Self::new(SCSI_SENSE_ABORTED_COMMAND, SCSI_ADSENSE_CRC_ERROR, 0x03)
        } else if error & ATA_ERROR_UNC != 0 {
            Self::new(SCSI_SENSE_MEDIUM_ERROR, SCSI_ADSENSE_UNRECOVERED_ERROR, 0x04)
        } else if error & ATA_ERROR_IDNF != 0 {
            Self::new(SCSI_SENSE_ILLEGAL_REQUEST, SCSI_ADSENSE_ILLEGAL_BLOCK, 0)
        } else if error & (ATA_ERROR_MC | ATA_ERROR_MCR) != 0 {
            Self::new(SCSI_SENSE_UNIT_ATTENTION, SCSI_ADSENSE_NO_MEDIA_IN_DEVICE, 0)
        } else if error & ATA_ERROR_NM != 0 {
            Self::new(SCSI_SENSE_NOT_READY, SCSI_ADSENSE_NO_MEDIA_IN_DEVICE, 0)
        } else if error & ATA_ERROR_ABRT != 0 {
            Self::new(SCSI_SENSE_ABORTED_COMMAND, SCSI_ADSENSE_NO_SENSE, 0)
        } else {
            Self::new(SCSI_SENSE_HARDWARE_ERROR, SCSI_ADSENSE_LUN_COMMUNICATION, 0)
        }
    }
}

/// LBA and block count of a READ/WRITE/VERIFY CDB.
pub(crate) fn decode_rw_cdb(cdb: &[u8]) -> Option<(u64, u32)> {
    let be32 = |b: &[u8]| u32::from_be_bytes([b[0], b[1], b[2], b[3]]);
    match cdb[0] {
        SCSIOP_READ6 | SCSIOP_WRITE6 => {
            let lba = u32::from_be_bytes([0, cdb[1] & 0x1f, cdb[2], cdb[3]]) as u64;
            // A zero transfer length means 256 blocks.
            let count = if cdb[4] == 0 { 256 } else { cdb[4] as u32 };
            Some((lba, count))
        }
        SCSIOP_READ | SCSIOP_WRITE | SCSIOP_VERIFY => Some((
            be32(&cdb[2..6]) as u64,
            u16::from_be_bytes([cdb[7], cdb[8]]) as u32,
        )),
        SCSIOP_READ12 | SCSIOP_WRITE12 | SCSIOP_VERIFY12 => {
            Some((be32(&cdb[2..6]) as u64, be32(&cdb[6..10])))
        }
        SCSIOP_READ16 | SCSIOP_WRITE16 | SCSIOP_VERIFY16 => {
            let lba = u64::from_be_bytes([
                cdb[2], cdb[3], cdb[4], cdb[5], cdb[6], cdb[7], cdb[8], cdb[9],
            ]);
            Some((lba, be32(&cdb[10..14])))
        }
        _ => None,
    }
}
