#![allow(non_camel_case_types)]

use bitfield_struct::bitfield;
use volatile::VolatileFieldAccess;

use crate::hal::SgEntry;

/// DW0 of a command header.
#[bitfield(u32)]
pub struct ahci_cmd_opts {
    /// Command FIS length in dwords.
    #[bits(5)]
    pub cfl: u8,
    pub atapi: bool,
    pub write: bool,
    pub prefetch: bool,
    pub reset: bool,
    pub bist: bool,
    pub clear_busy: bool,
    __: bool,
    #[bits(4)]
    pub pmp: u8,
    /// Number of PRD entries in the command table.
    pub prdtl: u16,
}

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct ahci_cmd_hdr {
    pub opts: ahci_cmd_opts,
    /// Bytes transferred, written back by the HBA.
    pub prdbc: u32,
    pub tbl_addr_lo: u32,
    pub tbl_addr_hi: u32,
    pub reserved: [u32; 4],
}

pub const AHCI_MAX_CMDS: usize = 32;

pub type ahci_cmd_list = [ahci_cmd_hdr; AHCI_MAX_CMDS];

#[derive(Debug, Clone, Copy, VolatileFieldAccess)]
#[repr(C, align(256))]
pub struct ahci_rx_fis {
    pub dsfis: [u8; 0x1c],
    _res0: [u8; 4],
    pub psfis: [u8; 0x14],
    _res1: [u8; 0xc],
    /// Last D2H Register FIS.
    pub rfis: [u8; 0x14],
    _res2: [u8; 4],
    pub sdbfis: [u8; 8],
    pub ufis: [u8; 0x40],
    _res3: [u8; 0x60],
}

const _: () = assert!(size_of::<ahci_rx_fis>() == 256);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct ahci_sg {
    pub addr_lo: u32,
    pub addr_hi: u32,
    pub reserved: u32,
    pub flags_size: u32,
}

const AHCI_SG_IRQ: u32 = 1 << 31;

impl ahci_sg {
    pub fn new(entry: SgEntry, irq: bool) -> Self {
        Self {
            addr_lo: entry.phys as u32,
            addr_hi: (entry.phys >> 32) as u32,
            reserved: 0,
            flags_size: (entry.len - 1) & 0x3f_ffff | if irq { AHCI_SG_IRQ } else { 0 },
        }
    }

    pub fn byte_count(&self) -> u32 {
        (self.flags_size & 0x3f_ffff) + 1
    }

    pub fn interrupt(&self) -> bool {
        self.flags_size & AHCI_SG_IRQ != 0
    }
}

/// PRD entries per command table; keeps four tables in one page.
pub const AHCI_MAX_SG: usize = 56;
pub const AHCI_MAX_BYTES_PER_SG: usize = 4 * 1024 * 1024; // 4 MiB

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct sata_fis_h2d {
    pub fis_type: u8,
    pub pm_port_c: u8,
    pub command: u8,
    pub features: u8,
    pub lba_low: u8,
    pub lba_mid: u8,
    pub lba_high: u8,
    pub device: u8,
    pub lba_low_exp: u8,
    pub lba_mid_exp: u8,
    pub lba_high_exp: u8,
    pub features_exp: u8,
    pub sector_count: u8,
    pub sector_count_exp: u8,
    pub icc: u8,
    pub control: u8,
    pub aux: [u8; 4],
}

/// Register FIS fields the driver consumes from the device.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct sata_fis_d2h {
    pub status: u8,
    pub error: u8,
    pub lba: u64,
    pub sector_count: u16,
    pub device: u8,
}

impl sata_fis_d2h {
    pub fn parse(raw: &[u8; 0x14]) -> Self {
        let lba = u64::from_le_bytes([raw[4], raw[5], raw[6], raw[8], raw[9], raw[10], 0, 0]);
        Self {
            status: raw[2],
            error: raw[3],
            lba,
            sector_count: u16::from_le_bytes([raw[12], raw[13]]),
            device: raw[7],
        }
    }
}

#[derive(Debug, Clone, Copy, VolatileFieldAccess)]
#[repr(C, align(128))]
pub struct ahci_cmd_tbl {
    pub cfis: sata_fis_h2d,
    _res0: [u8; 0x2c],
    /// ATAPI packet.
    pub acmd: [u8; 16],
    _res1: [u8; 0x30],
    pub sgs: [ahci_sg; AHCI_MAX_SG],
}

const _: () = assert!(size_of::<ahci_cmd_tbl>() == 0x400);

/// Command tables sharing one page.
pub const AHCI_TBLS_PER_PAGE: usize = 4096 / size_of::<ahci_cmd_tbl>();
