use alloc::{boxed::Box, sync::Arc, vec::Vec};

use bitflags::bitflags;

use crate::{
    ata::{ATA_DEVICE_LBA, ATA_LBA28_LIMIT},
    hal::SgEntry,
    queue::Irp,
    scsi::Srb,
};

bitflags! {
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct RequestFlags: u32 {
        const DATA_IN = 1 << 0;
        const DATA_OUT = 1 << 1;
        const DMA = 1 << 2;
        const NCQ = 1 << 3;
        const LBA48 = 1 << 4;
        const PACKET_COMMAND = 1 << 5;
        const FUA = 1 << 6;
        /// Needs the device to itself (IDENTIFY, SET FEATURES, ...).
        const EXCLUSIVE = 1 << 7;
        /// Issued by the error recovery worker.
        const RECOVERY = 1 << 8;
        /// May be issued while the port is not active.
        const BYPASS_ACTIVE_QUEUE = 1 << 9;
    }
}

/// Progress of a request through the port.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum InternalState {
    /// Holds a tag but no slot.
    #[default]
    NotStarted,
    /// Holds a slot; issued or prepared for issue.
    Active,
    /// Stopped by an engine halt, waiting for the recovery worker.
    NeedRecovery,
    /// Named by the recovery worker as the failing command.
    Recovery,
}

/// What to do with the data once the hardware command finishes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Report the hardware result in the SRB.
    #[default]
    Srb,
    /// Scratch holds fresh IDENTIFY data; answer READ CAPACITY from it.
    ReadCapacity { long: bool },
    /// Scratch holds a MODE SENSE(10) reply to be returned as MODE SENSE(6).
    ModeSense6,
    /// SET FEATURES changed the write cache state.
    WriteCache { enabled: bool },
    /// Recovery or bus-scan command owned by the port itself.
    Internal,
}

/// Where the data phase of a request lands.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum DataBuffer {
    #[default]
    None,
    Srb,
    Scratch,
}

pub const SCRATCH_SIZE: usize = 512;

/// The ATA register set of one command.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TaskFile {
    pub command: u8,
    pub feature: u8,
    pub sector_count: u8,
    pub lba_low: u8,
    pub lba_mid: u8,
    pub lba_high: u8,
    pub drive_select: u8,
    pub feature_exp: u8,
    pub sector_count_exp: u8,
    pub lba_low_exp: u8,
    pub lba_mid_exp: u8,
    pub lba_high_exp: u8,
    pub control: u8,
}

impl TaskFile {
    pub fn lba48(&mut self, lba: u64, count: u32) {
        let [l0, l1, l2, l3, l4, l5, ..] = lba.to_le_bytes();
        // 65536 sectors are encoded as 0.
        let [c0, c1, ..] = count.to_le_bytes();
        self.lba_low = l0;
        self.lba_mid = l1;
        self.lba_high = l2;
        self.lba_low_exp = l3;
        self.lba_mid_exp = l4;
        self.lba_high_exp = l5;
        self.sector_count = c0;
        self.sector_count_exp = c1;
        self.drive_select = ATA_DEVICE_LBA;
    }

    pub fn lba28(&mut self, lba: u64, count: u32) {
        debug_assert!(lba < ATA_LBA28_LIMIT);
        let [l0, l1, l2, l3, ..] = lba.to_le_bytes();
        self.lba_low = l0;
        self.lba_mid = l1;
        self.lba_high = l2;
        self.drive_select = ATA_DEVICE_LBA | (l3 & 0x0f);
        // 256 sectors are encoded as 0.
        self.sector_count = count as u8;
    }

    pub fn lba(&self) -> u64 {
        u64::from_le_bytes([
            self.lba_low,
            self.lba_mid,
            self.lba_high,
            self.lba_low_exp,
            self.lba_mid_exp,
            self.lba_high_exp,
            0,
            0,
        ])
    }
}

/// One in-flight command of a device, pre-associated with its tag.
pub struct AtaDeviceRequest {
    pub(crate) tag: u8,
    pub(crate) slot: u8,
    pub(crate) flags: RequestFlags,
    pub(crate) state: InternalState,
    pub(crate) task_file: TaskFile,
    pub(crate) cdb: [u8; 16],
    pub(crate) buffer: DataBuffer,
    pub(crate) data_length: u32,
    pub(crate) sg: Vec<SgEntry>,
    /// Seconds.
    pub(crate) timeout: u32,
    pub(crate) completion: Completion,
    pub(crate) srb: Option<Srb>,
    pub(crate) irp: Option<Arc<Irp>>,
    pub(crate) scratch: Box<[u8; SCRATCH_SIZE]>,
}

impl AtaDeviceRequest {
    pub(crate) fn new(tag: u8) -> Self {
        Self {
            tag,
            slot: 0,
            flags: RequestFlags::empty(),
            state: InternalState::NotStarted,
            task_file: TaskFile::default(),
            cdb: [0; 16],
            buffer: DataBuffer::None,
            data_length: 0,
            sg: Vec::new(),
            timeout: 0,
            completion: Completion::Srb,
            srb: None,
            irp: None,
            scratch: Box::new([0; SCRATCH_SIZE]),
        }
    }

    /// Returns the request to a blank state; the scratch buffer is kept.
    pub(crate) fn reset(&mut self) {
        self.flags = RequestFlags::empty();
        self.state = InternalState::NotStarted;
        self.task_file = TaskFile::default();
        self.cdb = [0; 16];
        self.buffer = DataBuffer::None;
        self.data_length = 0;
        self.sg.clear();
        self.timeout = 0;
        self.completion = Completion::Srb;
        self.srb = None;
        self.irp = None;
    }

    pub fn tag(&self) -> u8 {
        self.tag
    }

    pub fn flags(&self) -> RequestFlags {
        self.flags
    }

    pub fn task_file(&self) -> &TaskFile {
        &self.task_file
    }

    pub fn packet(&self) -> &[u8; 16] {
        &self.cdb
    }

    pub fn is_write(&self) -> bool {
        self.flags.contains(RequestFlags::DATA_OUT)
    }

    /// Virtual address and length of the data phase, if any.
    pub(crate) fn data_region(&mut self) -> Option<(usize, usize)> {
        let len = self.data_length as usize;
        if len == 0 {
            return None;
        }
        match self.buffer {
            DataBuffer::None => None,
            DataBuffer::Srb => {
                let data = &mut self.srb.as_mut()?.data;
                Some((data.as_mut_ptr() as usize, len.min(data.len())))
            }
            DataBuffer::Scratch => Some((self.scratch.as_mut_ptr() as usize, len.min(SCRATCH_SIZE))),
        }
    }
}
