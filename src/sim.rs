//! Register-level model of an AHCI HBA with attached disks, used by the
//! unit tests. Physical addresses are virtual addresses (see [`TestHal`]).

use alloc::{sync::Arc, vec, vec::Vec};
use core::{
    ptr,
    sync::atomic::{AtomicU64, Ordering},
};

use spin::Mutex;

use crate::{
    AhciChannel, ChannelConfig, Hal, MemoryDeviceTypeStore, RegisterIo,
    ata::{
        ATA_CMD_FLUSH, ATA_CMD_FLUSH_EXT, ATA_CMD_FPDMA_READ, ATA_CMD_FPDMA_WRITE, ATA_CMD_ID_ATA,
        ATA_CMD_ID_ATAPI, ATA_CMD_PACKET, ATA_CMD_READ, ATA_CMD_READ_DMA, ATA_CMD_READ_DMA_EXT,
        ATA_CMD_READ_EXT, ATA_CMD_READ_LOG_EXT, ATA_CMD_READ_MULTIPLE, ATA_CMD_READ_MULTIPLE_EXT,
        ATA_CMD_SET_FEATURES, ATA_CMD_SET_MULTIPLE, ATA_CMD_VERIFY, ATA_CMD_VERIFY_EXT,
        ATA_CMD_WRITE, ATA_CMD_WRITE_DMA, ATA_CMD_WRITE_DMA_EXT, ATA_CMD_WRITE_DMA_FUA_EXT,
        ATA_CMD_WRITE_EXT, ATA_CMD_WRITE_MULTIPLE, ATA_CMD_WRITE_MULTIPLE_EXT,
        ATA_CMD_WRITE_MULTIPLE_FUA_EXT, ATA_ERROR_ABRT, ATA_ERROR_IDNF, ATA_ERROR_UNC,
        ATA_ID_CFS_ENABLE_1, ATA_LOG_NCQ_ERROR, ATA_STATUS_BSY, ATA_STATUS_DRDY, ATA_STATUS_ERR,
        SATA_FIS_TYPE_REGISTER_D2H, SETFEATURES_WC_OFF, SETFEATURES_WC_ON,
        tests::{disk_identify, ncq_log},
    },
    mmio::{CAP, GHC, HBA_CAP, HBA_CAP2, HBA_GHC, HBA_IS, HBA_PI, HBA_VS, PxCMD, PxI, port_base},
    mmio::{
        PX_CI, PX_CLB, PX_CLBU, PX_CMD, PX_FB, PX_FBU, PX_IE, PX_IS, PX_SACT, PX_SCTL, PX_SERR,
        PX_SIG, PX_SSTS, PX_TFD,
    },
    port::SATA_SIG_ATAPI,
    queue::Irp,
    scsi::{
        SCSIOP_INQUIRY, SCSIOP_READ, SCSIOP_REQUEST_SENSE, SCSIOP_TEST_UNIT_READY, SCSIOP_WRITE,
        SenseData, Srb,
    },
    types::{ahci_cmd_hdr, ahci_cmd_tbl, ahci_sg, sata_fis_h2d},
};

static CLOCK: AtomicU64 = AtomicU64::new(0);

/// Identity-mapped memory and a clock that advances one millisecond per
/// reading, so bounded waits always terminate.
pub(crate) struct TestHal;

impl Hal for TestHal {
    fn virt_to_phys(va: usize) -> usize {
        va
    }

    fn current_ms() -> u64 {
        CLOCK.fetch_add(1, Ordering::Relaxed)
    }

    fn flush_dcache() {}
}

const SATA_SIG_ATA: u32 = 0x0000_0101;
const SSTS_LINK_UP: u32 = 0x113;
const TFD_READY: u32 = 0x50;
const SECTOR: usize = 512;
const ATAPI_SECTOR: usize = 2048;

/// IDENTIFY PACKET DEVICE data of a DMA capable CD drive.
pub(crate) fn atapi_identify() -> [u8; 512] {
    let mut raw = [0u8; 512];
    raw[0..2].copy_from_slice(&0x8580u16.to_le_bytes());
    raw[98..100].copy_from_slice(&(1u16 << 9 | 1 << 8).to_le_bytes());
    raw
}

/// A device behind a simulated port.
pub(crate) struct SimDisk {
    pub atapi: bool,
    pub identify: [u8; 512],
    pub data: Vec<u8>,
    /// Reads and writes touching this LBA fail with UNC.
    pub fail_lba: Option<u64>,
    /// Commands touching this LBA never complete.
    pub hang_lba: Option<u64>,
    /// Bytes withheld from every data transfer.
    pub short: u32,
    /// Reported by REQUEST SENSE.
    pub sense: SenseData,
    /// Sense key the next packet command fails with.
    pub packet_error: Option<u8>,
    /// Breaks the checksum of the NCQ error log.
    pub corrupt_log: bool,
    pub write_cache: bool,
    ncq_error: Option<(u8, u8, u8, u64)>,
}

impl SimDisk {
    pub fn disk(sectors: u64, ncq: bool) -> Self {
        let mut data = vec![0; sectors as usize * SECTOR];
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = (i / SECTOR) as u8 ^ (i % 251) as u8;
        }
        Self {
            atapi: false,
            identify: disk_identify(sectors, ncq),
            data,
            fail_lba: None,
            hang_lba: None,
            short: 0,
            sense: SenseData::default(),
            packet_error: None,
            corrupt_log: false,
            write_cache: true,
            ncq_error: None,
        }
    }

    pub fn cdrom() -> Self {
        Self {
            atapi: true,
            identify: atapi_identify(),
            data: vec![0; 16 * ATAPI_SECTOR],
            ..Self::disk(0, false)
        }
    }

    pub fn sector(&self, lba: u64) -> &[u8] {
        let start = lba as usize * SECTOR;
        &self.data[start..start + SECTOR]
    }
}

/// One command as the HBA fetched it.
#[derive(Debug, Clone)]
pub(crate) struct SimCommand {
    pub slot: u8,
    pub fis: sata_fis_h2d,
    pub packet: [u8; 16],
    pub prds: Vec<ahci_sg>,
    pub write: bool,
    pub atapi: bool,
}

impl SimCommand {
    pub fn command(&self) -> u8 {
        self.fis.command
    }
}

enum Outcome {
    Done(u32),
    Error { status: u8, error: u8, lba: u64 },
    Hang,
}

#[derive(Default)]
struct SimPort {
    clb: u64,
    fb: u64,
    is: u32,
    ie: u32,
    cmd: u32,
    tfd: u32,
    sig: u32,
    ssts: u32,
    sctl: u32,
    serr: u32,
    sact: u32,
    ci: u32,
    halted: bool,
    hold: bool,
    /// Slots fetched but never finished.
    hung: u32,
    disk: Option<SimDisk>,
    log: Vec<SimCommand>,
    ci_writes: Vec<u32>,
}

struct Hba {
    cap: CAP,
    pi: u32,
    ghc: GHC,
    reset_stuck: bool,
    ports: Vec<SimPort>,
}

pub(crate) struct SimHba {
    inner: Mutex<Hba>,
}

fn lba28(f: &sata_fis_h2d) -> u64 {
    u64::from_le_bytes([f.lba_low, f.lba_mid, f.lba_high, f.device & 0x0f, 0, 0, 0, 0])
}

fn lba48(f: &sata_fis_h2d) -> u64 {
    u64::from_le_bytes([
        f.lba_low,
        f.lba_mid,
        f.lba_high,
        f.lba_low_exp,
        f.lba_mid_exp,
        f.lba_high_exp,
        0,
        0,
    ])
}

fn count(low: u8, high: u8, max: u32) -> u32 {
    match u16::from_le_bytes([low, high]) as u32 {
        0 => max,
        n => n,
    }
}

fn prd_len(prds: &[ahci_sg]) -> usize {
    prds.iter().map(|sg| sg.byte_count() as usize).sum()
}

fn prd_addr(sg: &ahci_sg) -> usize {
    (sg.addr_lo as u64 | (sg.addr_hi as u64) << 32) as usize
}

/// Copies `data` into the PRD buffers; returns the bytes copied.
fn scatter(prds: &[ahci_sg], data: &[u8]) -> u32 {
    let mut done = 0;
    for sg in prds {
        let len = (sg.byte_count() as usize).min(data.len() - done);
        // SAFETY: PRD addresses are identity-mapped test buffers.
        unsafe { ptr::copy_nonoverlapping(data[done..].as_ptr(), prd_addr(sg) as *mut u8, len) };
        done += len;
        if done == data.len() {
            break;
        }
    }
    done as u32
}

fn gather(prds: &[ahci_sg], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    for sg in prds {
        let n = (sg.byte_count() as usize).min(len - out.len());
        // SAFETY: PRD addresses are identity-mapped test buffers.
        out.extend_from_slice(unsafe { core::slice::from_raw_parts(prd_addr(sg) as *const u8, n) });
    }
    out
}

impl SimDisk {
    fn transfer(&mut self, cmd: &SimCommand, lba: u64, sectors: u32, write: bool) -> Outcome {
        let end = lba + sectors as u64;
        if end as usize * SECTOR > self.data.len() {
            return Outcome::Error {
                status: ATA_STATUS_DRDY | ATA_STATUS_ERR,
                error: ATA_ERROR_IDNF,
                lba,
            };
        }
        if self.hang_lba.is_some_and(|l| (lba..end).contains(&l)) {
            return Outcome::Hang;
        }
        if let Some(bad) = self.fail_lba.filter(|l| (lba..end).contains(l)) {
            return Outcome::Error {
                status: ATA_STATUS_DRDY | ATA_STATUS_ERR,
                error: ATA_ERROR_UNC,
                lba: bad,
            };
        }
        let bytes = (sectors as usize * SECTOR)
            .min(prd_len(&cmd.prds))
            .saturating_sub(self.short as usize);
        let range = lba as usize * SECTOR..lba as usize * SECTOR + bytes;
        if write {
            let data = gather(&cmd.prds, bytes);
            self.data[range].copy_from_slice(&data);
            Outcome::Done(bytes as u32)
        } else {
            Outcome::Done(scatter(&cmd.prds, &self.data[range]))
        }
    }

    fn packet(&mut self, cmd: &SimCommand) -> Outcome {
        if let Some(key) = self.packet_error.take() {
            return Outcome::Error {
                status: ATA_STATUS_DRDY | ATA_STATUS_ERR,
                error: key << 4,
                lba: 0,
            };
        }
        let cdb = cmd.packet;
        match cdb[0] {
            SCSIOP_TEST_UNIT_READY => Outcome::Done(0),
            SCSIOP_REQUEST_SENSE => {
                let mut raw = [0u8; 18];
                self.sense.write_fixed(&mut raw);
                let len = (cdb[4] as usize).min(raw.len());
                Outcome::Done(scatter(&cmd.prds, &raw[..len]))
            }
            SCSIOP_INQUIRY => {
                let mut raw = [0u8; 36];
                raw[0] = 0x05;
                raw[1] = 0x80;
                raw[8..16].copy_from_slice(b"SIM     ");
                let len = (cdb[4] as usize).min(raw.len());
                Outcome::Done(scatter(&cmd.prds, &raw[..len]))
            }
            _ => {
                let zeros = vec![0u8; prd_len(&cmd.prds)];
                Outcome::Done(scatter(&cmd.prds, &zeros))
            }
        }
    }

    fn execute(&mut self, cmd: &SimCommand) -> Outcome {
        let f = &cmd.fis;
        let abort = Outcome::Error {
            status: ATA_STATUS_DRDY | ATA_STATUS_ERR,
            error: ATA_ERROR_ABRT,
            lba: 0,
        };
        let outcome = match f.command {
            ATA_CMD_ID_ATA | ATA_CMD_ID_ATAPI => {
                if self.atapi != (f.command == ATA_CMD_ID_ATAPI) {
                    return abort;
                }
                let mut id = self.identify;
                let word = ATA_ID_CFS_ENABLE_1 * 2;
                if self.write_cache {
                    id[word] |= 1 << 5;
                } else {
                    id[word] &= !(1 << 5);
                }
                Outcome::Done(scatter(&cmd.prds, &id))
            }
            _ if self.atapi && f.command != ATA_CMD_PACKET => abort,
            ATA_CMD_PACKET => self.packet(cmd),
            ATA_CMD_READ | ATA_CMD_READ_DMA | ATA_CMD_READ_MULTIPLE => {
                self.transfer(cmd, lba28(f), count(f.sector_count, 0, 256), false)
            }
            ATA_CMD_WRITE | ATA_CMD_WRITE_DMA | ATA_CMD_WRITE_MULTIPLE => {
                self.transfer(cmd, lba28(f), count(f.sector_count, 0, 256), true)
            }
            ATA_CMD_READ_EXT | ATA_CMD_READ_DMA_EXT | ATA_CMD_READ_MULTIPLE_EXT => self.transfer(
                cmd,
                lba48(f),
                count(f.sector_count, f.sector_count_exp, 65536),
                false,
            ),
            ATA_CMD_WRITE_EXT
            | ATA_CMD_WRITE_DMA_EXT
            | ATA_CMD_WRITE_MULTIPLE_EXT
            | ATA_CMD_WRITE_DMA_FUA_EXT
            | ATA_CMD_WRITE_MULTIPLE_FUA_EXT => self.transfer(
                cmd,
                lba48(f),
                count(f.sector_count, f.sector_count_exp, 65536),
                true,
            ),
            ATA_CMD_FPDMA_READ | ATA_CMD_FPDMA_WRITE => {
                let write = f.command == ATA_CMD_FPDMA_WRITE;
                let outcome =
                    self.transfer(cmd, lba48(f), count(f.features, f.features_exp, 65536), write);
                if let Outcome::Error { status, error, lba } = outcome {
                    self.ncq_error = Some((f.sector_count >> 3, status, error, lba));
                }
                outcome
            }
            ATA_CMD_READ_LOG_EXT if f.lba_low == ATA_LOG_NCQ_ERROR => {
                let (tag, status, error, lba) = self.ncq_error.take().unwrap_or((0x80, 0, 0, 0));
                let mut page = ncq_log(tag, status, error, lba);
                if self.corrupt_log {
                    page[100] ^= 0x01;
                }
                Outcome::Done(scatter(&cmd.prds, &page))
            }
            ATA_CMD_SET_FEATURES => match f.features {
                SETFEATURES_WC_ON => {
                    self.write_cache = true;
                    Outcome::Done(0)
                }
                SETFEATURES_WC_OFF => {
                    self.write_cache = false;
                    Outcome::Done(0)
                }
                _ => abort,
            },
            ATA_CMD_FLUSH | ATA_CMD_FLUSH_EXT | ATA_CMD_SET_MULTIPLE | ATA_CMD_VERIFY
            | ATA_CMD_VERIFY_EXT => Outcome::Done(0),
            _ => abort,
        };
        outcome
    }
}

impl SimPort {
    fn running(&self) -> bool {
        PxCMD::from_bits(self.cmd).ST() && !self.halted && !self.hold && self.disk.is_some()
    }

    fn fetch(&self, slot: u8) -> SimCommand {
        // SAFETY: the driver programmed CLB and the command table with
        // identity-mapped allocations that outlive the command.
        unsafe {
            let hdr = ptr::read_volatile((self.clb as usize as *const ahci_cmd_hdr).add(slot as usize));
            let tbl = (hdr.tbl_addr_lo as u64 | (hdr.tbl_addr_hi as u64) << 32) as usize
                as *const ahci_cmd_tbl;
            let tbl = ptr::read_volatile(tbl);
            SimCommand {
                slot,
                fis: tbl.cfis,
                packet: tbl.acmd,
                prds: tbl.sgs[..hdr.opts.prdtl() as usize].to_vec(),
                write: hdr.opts.write(),
                atapi: hdr.opts.atapi(),
            }
        }
    }

    /// Writes the D2H register FIS of a failed command to the receive area.
    fn post_d2h(&self, status: u8, error: u8, lba: u64) {
        let l = lba.to_le_bytes();
        let mut fis = [0u8; 0x14];
        fis[0] = SATA_FIS_TYPE_REGISTER_D2H;
        fis[2] = status;
        fis[3] = error;
        fis[4..7].copy_from_slice(&l[..3]);
        fis[8..11].copy_from_slice(&l[3..6]);
        // SAFETY: FB points at the identity-mapped receive area the driver
        // allocated; the register FIS lives at offset 0x40.
        unsafe {
            let rfis = (self.fb as usize + 0x40) as *mut [u8; 0x14];
            rfis.write_volatile(fis);
        }
    }

    fn set_prdbc(&self, slot: u8, bytes: u32) {
        // SAFETY: as in `fetch`.
        unsafe {
            let hdr = (self.clb as usize as *mut ahci_cmd_hdr).add(slot as usize);
            ptr::addr_of_mut!((*hdr).prdbc).write_volatile(bytes);
        }
    }

    fn run(&mut self) {
        while self.running() {
            let ready = self.ci & !self.hung;
            if ready == 0 {
                return;
            }
            let slot = ready.trailing_zeros() as u8;
            let bit = 1 << slot;
            let cmd = self.fetch(slot);
            let ncq = matches!(cmd.command(), ATA_CMD_FPDMA_READ | ATA_CMD_FPDMA_WRITE);
            self.log.push(cmd.clone());

            let Some(disk) = self.disk.as_mut() else {
                return;
            };
            match disk.execute(&cmd) {
                Outcome::Done(bytes) => {
                    self.ci &= !bit;
                    self.tfd = TFD_READY;
                    let is = PxI::from_bits(self.is);
                    self.is = if ncq {
                        self.sact &= !bit;
                        is.with_SDB(true)
                    } else {
                        self.set_prdbc(slot, bytes);
                        is.with_DHR(true)
                    }
                    .into_bits();
                }
                Outcome::Error { status, error, lba } => {
                    self.post_d2h(status, error, lba);
                    self.tfd = status as u32 | (error as u32) << 8;
                    self.is = PxI::from_bits(self.is).with_TFE(true).into_bits();
                    self.halted = true;
                }
                Outcome::Hang => {
                    self.hung |= bit;
                    self.tfd = ATA_STATUS_BSY as u32;
                }
            }
        }
    }

    fn write_cmd(&mut self, value: u32) {
        let old = PxCMD::from_bits(self.cmd);
        let new = PxCMD::from_bits(value);
        if old.ST() && !new.ST() {
            self.ci = 0;
            self.sact = 0;
            self.hung = 0;
            self.halted = false;
        }
        self.cmd = new
            .with_CR(new.ST())
            .with_FR(new.FRE())
            .with_CLO(false)
            .into_bits();
    }

    fn write_sctl(&mut self, value: u32) {
        let old = self.sctl & 0xf;
        self.sctl = value;
        match (old, value & 0xf) {
            (_, 1) => self.ssts = 0,
            (1, 0) => self.link_up(),
            _ => {}
        }
    }

    fn link_up(&mut self) {
        let Some(disk) = &self.disk else {
            return;
        };
        self.ssts = SSTS_LINK_UP;
        self.tfd = TFD_READY;
        self.sig = if disk.atapi { SATA_SIG_ATAPI } else { SATA_SIG_ATA };
        self.hung = 0;
    }

    fn read(&self, reg: usize) -> u32 {
        match reg {
            PX_CLB => self.clb as u32,
            PX_CLBU => (self.clb >> 32) as u32,
            PX_FB => self.fb as u32,
            PX_FBU => (self.fb >> 32) as u32,
            PX_IS => self.is,
            PX_IE => self.ie,
            PX_CMD => self.cmd,
            PX_TFD => self.tfd,
            PX_SIG => self.sig,
            PX_SSTS => self.ssts,
            PX_SCTL => self.sctl,
            PX_SERR => self.serr,
            PX_SACT => self.sact,
            PX_CI => self.ci,
            _ => 0,
        }
    }

    fn write(&mut self, reg: usize, value: u32) {
        match reg {
            PX_CLB => self.clb = self.clb & !0xffff_ffff | value as u64,
            PX_CLBU => self.clb = self.clb & 0xffff_ffff | (value as u64) << 32,
            PX_FB => self.fb = self.fb & !0xffff_ffff | value as u64,
            PX_FBU => self.fb = self.fb & 0xffff_ffff | (value as u64) << 32,
            PX_IS => self.is &= !value,
            PX_IE => self.ie = value,
            PX_CMD => self.write_cmd(value),
            PX_SCTL => self.write_sctl(value),
            PX_SERR => self.serr &= !value,
            PX_SACT => self.sact |= value,
            PX_CI => {
                self.ci |= value;
                self.ci_writes.push(value);
                self.run();
            }
            _ => {}
        }
    }
}

impl SimHba {
    pub fn new(slots: u32, ncq: bool) -> Arc<Self> {
        let cap = CAP::new()
            .with_S64A(true)
            .with_SNCQ(ncq)
            .with_NCS((slots - 1) as u8)
            .with_NP(31);
        Arc::new(Self {
            inner: Mutex::new(Hba {
                cap,
                pi: 0,
                ghc: GHC::new(),
                reset_stuck: false,
                ports: (0..32).map(|_| SimPort::default()).collect(),
            }),
        })
    }

    /// Implements `port` and connects `disk` to it.
    pub fn attach(&self, port: u8, disk: SimDisk) {
        let mut hba = self.inner.lock();
        hba.pi |= 1 << port;
        let p = &mut hba.ports[port as usize];
        p.disk = Some(disk);
        p.link_up();
    }

    /// Unplugs the device; the port stays implemented.
    pub fn detach(&self, port: u8) {
        let mut hba = self.inner.lock();
        let p = &mut hba.ports[port as usize];
        p.disk = None;
        p.ssts = 0;
        p.tfd = 0x7f;
    }

    pub fn implement(&self, port: u8) {
        self.inner.lock().pi |= 1 << port;
    }

    pub fn with_disk<R>(&self, port: u8, f: impl FnOnce(&mut SimDisk) -> R) -> R {
        let mut hba = self.inner.lock();
        f(hba.ports[port as usize]
            .disk
            .as_mut()
            .expect("no disk on port"))
    }

    pub fn set_reset_stuck(&self, stuck: bool) {
        self.inner.lock().reset_stuck = stuck;
    }

    /// Commands issued from now on wait for [`SimHba::release`].
    pub fn hold(&self, port: u8) {
        self.inner.lock().ports[port as usize].hold = true;
    }

    pub fn release(&self, port: u8) {
        let mut hba = self.inner.lock();
        let p = &mut hba.ports[port as usize];
        p.hold = false;
        p.run();
    }

    pub fn log(&self, port: u8) -> Vec<SimCommand> {
        self.inner.lock().ports[port as usize].log.clone()
    }

    pub fn commands(&self, port: u8) -> Vec<u8> {
        self.log(port).iter().map(SimCommand::command).collect()
    }

    pub fn ci_writes(&self, port: u8) -> Vec<u32> {
        self.inner.lock().ports[port as usize].ci_writes.clone()
    }

    pub fn clear_log(&self, port: u8) {
        let mut hba = self.inner.lock();
        let p = &mut hba.ports[port as usize];
        p.log.clear();
        p.ci_writes.clear();
    }

    pub fn outstanding(&self, port: u8) -> u32 {
        let hba = self.inner.lock();
        let p = &hba.ports[port as usize];
        p.ci | p.sact
    }
}

impl RegisterIo for SimHba {
    fn read32(&self, offset: usize) -> u32 {
        let hba = self.inner.lock();
        match offset {
            HBA_CAP => hba.cap.into_bits(),
            HBA_GHC => hba.ghc.into_bits(),
            HBA_IS => hba
                .ports
                .iter()
                .enumerate()
                .filter(|(_, p)| p.is & p.ie != 0)
                .fold(0, |is, (i, _)| is | 1 << i),
            HBA_PI => hba.pi,
            HBA_VS => 0x0001_0301,
            HBA_CAP2 => 0,
            _ if offset >= port_base(0) => {
                let port = (offset - port_base(0)) / 0x80;
                hba.ports[port].read((offset - port_base(0)) % 0x80)
            }
            _ => 0,
        }
    }

    fn write32(&self, offset: usize, value: u32) {
        let mut hba = self.inner.lock();
        match offset {
            HBA_GHC => {
                let ghc = GHC::from_bits(value);
                if !ghc.HR() {
                    hba.ghc = ghc;
                } else if hba.reset_stuck {
                    hba.ghc = ghc;
                } else {
                    hba.ghc = GHC::new();
                    for p in hba.ports.iter_mut() {
                        p.write_cmd(0);
                        p.is = 0;
                        p.ie = 0;
                    }
                }
            }
            _ if offset >= port_base(0) => {
                let port = (offset - port_base(0)) / 0x80;
                hba.ports[port].write((offset - port_base(0)) % 0x80, value);
            }
            _ => {}
        }
    }
}

/// Runs interrupt, DPC and worker processing until the channel is quiet.
pub(crate) fn pump(ch: &AhciChannel<TestHal>) {
    for _ in 0..256 {
        let irq = ch.isr();
        let dpc = ch.run_dpcs();
        let worker = ch.run_workers();
        if !irq && !dpc && !worker {
            return;
        }
    }
    panic!("channel did not settle");
}

/// A channel over `hba` with the bus already scanned.
pub(crate) fn channel(hba: &Arc<SimHba>) -> AhciChannel<TestHal> {
    channel_with(hba, ChannelConfig::default())
}

pub(crate) fn channel_with(hba: &Arc<SimHba>, config: ChannelConfig) -> AhciChannel<TestHal> {
    let ch = AhciChannel::new(hba.clone(), config);
    ch.scan_bus(&MemoryDeviceTypeStore::default())
        .expect("scan failed");
    ch
}

/// Pumps the channel and returns the finished SRB.
pub(crate) fn finish(ch: &AhciChannel<TestHal>, irp: &Arc<Irp>) -> Srb {
    pump(ch);
    irp.take_result().expect("request still pending")
}

fn rw10(opcode: u8, lba: u32, blocks: u16) -> [u8; 10] {
    let mut cdb = [0u8; 10];
    cdb[0] = opcode;
    cdb[2..6].copy_from_slice(&lba.to_be_bytes());
    cdb[7..9].copy_from_slice(&blocks.to_be_bytes());
    cdb
}

/// READ(10) of `blocks` 512-byte sectors at `lba`.
pub(crate) fn read10(target: u8, lba: u32, blocks: u16) -> Srb {
    let mut srb = Srb::scsi_in(&rw10(SCSIOP_READ, lba, blocks), blocks as usize * SECTOR);
    srb.target_id = target;
    srb.sort_key = lba as u64;
    srb
}

pub(crate) fn write10(target: u8, lba: u32, data: Vec<u8>) -> Srb {
    let blocks = (data.len() / SECTOR) as u16;
    let mut srb = Srb::scsi_out(&rw10(SCSIOP_WRITE, lba, blocks), data);
    srb.target_id = target;
    srb.sort_key = lba as u64;
    srb
}
