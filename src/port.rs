//! Port-level hardware operations: DMA memory, command tables and the
//! engine start/stop sequences.

use alloc::{alloc::alloc_zeroed, vec::Vec};
use core::{alloc::Layout, ptr::NonNull};

use log::{debug, warn};
use volatile::VolatilePtr;

use crate::{
    AhciError, Hal,
    ata::{
        ATA_STATUS_ERR, SATA_FIS_H2D_C, SATA_FIS_TYPE_REGISTER_D2H, SATA_FIS_TYPE_REGISTER_H2D,
    },
    hal::{PAGE_SIZE, wait_until_timeout},
    mmio::{ICC, PortIo, PxI},
    request::{AtaDeviceRequest, RequestFlags},
    types::{
        AHCI_TBLS_PER_PAGE, ahci_cmd_hdr, ahci_cmd_list, ahci_cmd_opts, ahci_cmd_tbl,
        ahci_cmd_tblVolatileFieldAccess, ahci_rx_fis, ahci_rx_fisVolatileFieldAccess, ahci_sg,
        sata_fis_d2h, sata_fis_h2d,
    },
};

/// Engine stop and FIS receive stop are bounded at 500 ms by AHCI.
const ENGINE_STOP_TIMEOUT_MS: u64 = 500;
const LINK_TIMEOUT_MS: u64 = 1000;
const SPIN_UP_TIMEOUT_MS: u64 = 1000;

/// Signature of a packet device in PxSIG.
pub(crate) const SATA_SIG_ATAPI: u32 = 0xeb14_0101;

fn dma_alloc(size: usize, align: usize) -> Result<(NonNull<u8>, Layout), AhciError> {
    let layout = Layout::from_size_align(size, align).map_err(|_| AhciError::NoMemory)?;
    // SAFETY: the layout has a non-zero size.
    let ptr = NonNull::new(unsafe { alloc_zeroed(layout) }).ok_or(AhciError::NoMemory)?;
    Ok((ptr, layout))
}

/// DMA memory of one port: command list, received FIS area and one
/// command table per slot. Tables are carved out of whole pages so no
/// allocation is larger than a page.
pub(crate) struct CommandMemory {
    cmd_list: VolatilePtr<'static, ahci_cmd_list>,
    rx_fis: VolatilePtr<'static, ahci_rx_fis>,
    tables: Vec<VolatilePtr<'static, ahci_cmd_tbl>>,
    allocations: Vec<(NonNull<u8>, Layout)>,
}

// SAFETY: the memory is owned exclusively by this value and only touched
// under the device lock.
unsafe impl Send for CommandMemory {}

impl CommandMemory {
    pub(crate) fn new(slots: usize) -> Result<Self, AhciError> {
        let mut allocations = Vec::new();
        let mut alloc = |size, align| {
            let (ptr, layout) = dma_alloc(size, align)?;
            allocations.push((ptr, layout));
            Ok::<_, AhciError>(ptr)
        };

        let cmd_list = alloc(size_of::<ahci_cmd_list>(), 1024)?;
        let rx_fis = alloc(size_of::<ahci_rx_fis>(), 256)?;
        let mut tables = Vec::with_capacity(slots);
        for _ in 0..slots.div_ceil(AHCI_TBLS_PER_PAGE) {
            let page = alloc(PAGE_SIZE, PAGE_SIZE)?;
            for i in 0..AHCI_TBLS_PER_PAGE {
                if tables.len() == slots {
                    break;
                }
                // SAFETY: four tables fit exactly in one page.
                let table = unsafe { page.add(i * size_of::<ahci_cmd_tbl>()) };
                tables.push(unsafe { VolatilePtr::new(table.cast()) });
            }
        }

        Ok(Self {
            // SAFETY: freshly allocated, zeroed and suitably aligned.
            cmd_list: unsafe { VolatilePtr::new(cmd_list.cast()) },
            rx_fis: unsafe { VolatilePtr::new(rx_fis.cast()) },
            tables,
            allocations,
        })
    }

    pub(crate) fn slots(&self) -> usize {
        self.tables.len()
    }

    pub(crate) fn cmd_list_phys<H: Hal>(&self) -> u64 {
        H::virt_to_phys(self.cmd_list.as_raw_ptr().addr().get()) as u64
    }

    pub(crate) fn rx_fis_phys<H: Hal>(&self) -> u64 {
        H::virt_to_phys(self.rx_fis.as_raw_ptr().addr().get()) as u64
    }

    fn header(&self, slot: u8) -> VolatilePtr<'static, ahci_cmd_hdr> {
        // SAFETY: slot < AHCI_MAX_CMDS, checked by the slot allocator.
        unsafe {
            self.cmd_list
                .map(|list| list.cast::<ahci_cmd_hdr>().add(slot as usize))
        }
    }

    fn table(&self, slot: u8) -> VolatilePtr<'static, ahci_cmd_tbl> {
        self.tables[slot as usize]
    }

    /// Bytes the HBA reports as transferred for the slot.
    pub(crate) fn transferred(&self, slot: u8) -> u32 {
        self.header(slot).read().prdbc
    }

    pub(crate) fn clear_transferred(&self, slot: u8) {
        self.header(slot).update(|mut hdr| {
            hdr.prdbc = 0;
            hdr
        });
    }

    /// The last D2H register FIS the device sent, if any arrived.
    pub(crate) fn received_d2h(&self) -> Option<sata_fis_d2h> {
        let raw = self.rx_fis.rfis().read();
        (raw[0] == SATA_FIS_TYPE_REGISTER_D2H).then(|| sata_fis_d2h::parse(&raw))
    }

    /// Writes the command FIS, packet, PRD table and header of `slot`.
    pub(crate) fn prepare<H: Hal>(&self, slot: u8, req: &AtaDeviceRequest) {
        let tf = req.task_file();
        let ncq = req.flags().contains(RequestFlags::NCQ);
        let table = self.table(slot);

        table.cfis().write(sata_fis_h2d {
            fis_type: SATA_FIS_TYPE_REGISTER_H2D,
            pm_port_c: SATA_FIS_H2D_C,
            command: tf.command,
            features: tf.feature,
            lba_low: tf.lba_low,
            lba_mid: tf.lba_mid,
            lba_high: tf.lba_high,
            device: tf.drive_select,
            lba_low_exp: tf.lba_low_exp,
            lba_mid_exp: tf.lba_mid_exp,
            lba_high_exp: tf.lba_high_exp,
            features_exp: tf.feature_exp,
            // The queue tag of an FPDMA command is its slot.
            sector_count: if ncq { slot << 3 } else { tf.sector_count },
            sector_count_exp: tf.sector_count_exp,
            icc: 0,
            control: tf.control,
            aux: [0; 4],
        });

        let packet = req.flags().contains(RequestFlags::PACKET_COMMAND);
        if packet {
            table.acmd().write(*req.packet());
        }

        let last = req.sg.len().saturating_sub(1);
        for (i, entry) in req.sg.iter().enumerate() {
            // SAFETY: the mapping was bounded by AHCI_MAX_SG entries.
            unsafe { table.sgs().map(|sg| sg.cast::<ahci_sg>().add(i)) }
                .write(ahci_sg::new(*entry, i == last));
        }

        let tbl_addr = H::virt_to_phys(table.as_raw_ptr().addr().get()) as u64;
        self.header(slot).write(ahci_cmd_hdr {
            opts: ahci_cmd_opts::new()
                .with_cfl((size_of::<sata_fis_h2d>() / 4) as u8)
                .with_atapi(packet)
                .with_write(req.is_write())
                .with_prdtl(req.sg.len() as u16),
            prdbc: 0,
            tbl_addr_lo: tbl_addr as u32,
            tbl_addr_hi: (tbl_addr >> 32) as u32,
            ..Default::default()
        });

        H::flush_dcache();
    }
}

impl Drop for CommandMemory {
    fn drop(&mut self) {
        for (ptr, layout) in self.allocations.drain(..) {
            // SAFETY: allocated in `new` with this layout.
            unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) };
        }
    }
}

/// Clears PxCMD.ST and waits for the command list to stop running.
pub(crate) fn stop_engine<H: Hal>(io: &PortIo, port: u8) -> Result<(), AhciError> {
    io.update_cmd(|cmd| cmd.with_ST(false));
    if !wait_until_timeout::<H>(|| !io.cmd().CR(), ENGINE_STOP_TIMEOUT_MS) {
        warn!("Port {port} command engine did not stop");
        return Err(AhciError::EngineStuck(port));
    }
    Ok(())
}

pub(crate) fn start_engine(io: &PortIo) {
    io.update_cmd(|cmd| cmd.with_FRE(true).with_ST(true));
}

fn stop_fis_receive<H: Hal>(io: &PortIo, port: u8) -> Result<(), AhciError> {
    io.update_cmd(|cmd| cmd.with_FRE(false));
    if !wait_until_timeout::<H>(|| !io.cmd().FR(), ENGINE_STOP_TIMEOUT_MS) {
        warn!("Port {port} FIS receive did not stop");
        return Err(AhciError::EngineStuck(port));
    }
    Ok(())
}

fn link_up(io: &PortIo) -> bool {
    io.ssts().DET() == 3
}

/// Waits for BSY and DRQ to drop.
pub(crate) fn wait_ready<H: Hal>(io: &PortIo, port: u8, timeout: u64) -> Result<(), AhciError> {
    if !wait_until_timeout::<H>(|| !io.tfd().is_busy(), timeout) {
        warn!("Port {port} device busy: {:?}", io.tfd());
        return Err(AhciError::DeviceBusy(port));
    }
    Ok(())
}

/// Resets the link with COMRESET. The engine must be stopped.
pub(crate) fn comreset<H: Hal>(io: &PortIo, port: u8) -> Result<(), AhciError> {
    debug!("Port {port} COMRESET");
    io.set_sctl(io.sctl().with_DET(1));
    // COMRESET has to be asserted for at least 1 ms.
    wait_until_timeout::<H>(|| false, 1);
    io.set_sctl(io.sctl().with_DET(0));

    if !wait_until_timeout::<H>(|| link_up(io), LINK_TIMEOUT_MS) {
        warn!("Port {port} link did not come back after COMRESET");
        return Err(AhciError::LinkDown(port));
    }
    io.clear_serr();
    Ok(())
}

/// Brings an idle port up to a running command engine with the device
/// ready, and returns its signature.
pub(crate) fn bring_up<H: Hal>(
    io: &PortIo,
    mem: &CommandMemory,
    port: u8,
    staggered_spin_up: bool,
    ready_timeout: u64,
) -> Result<u32, AhciError> {
    io.set_ie(PxI::new());
    io.clear_serr();

    let cmd = io.cmd();
    if cmd.ST() || cmd.CR() {
        stop_engine::<H>(io, port)?;
    }
    if cmd.FRE() || cmd.FR() {
        stop_fis_receive::<H>(io, port)?;
    }

    io.set_clb(mem.cmd_list_phys::<H>());
    io.set_fb(mem.rx_fis_phys::<H>());
    io.update_cmd(|cmd| cmd.with_FRE(true));

    if staggered_spin_up {
        io.update_cmd(|cmd| cmd.with_SUD(true));
        if !wait_until_timeout::<H>(|| io.cmd().SUD(), SPIN_UP_TIMEOUT_MS) {
            warn!("Port {port} set Spin-Up Device timeout");
        }
    }
    io.update_cmd(|cmd| cmd.with_POD(true).with_ICC(ICC::Active));

    if !wait_until_timeout::<H>(|| link_up(io), LINK_TIMEOUT_MS) {
        debug!("Port {port} no device present (DET {})", io.ssts().DET());
        io.update_cmd(|cmd| cmd.with_FRE(false));
        return Err(AhciError::NoDevice(port));
    }
    debug!("Port {port} sata link up");

    io.clear_serr();
    io.ack_is(PxI::from_bits(u32::MAX));

    if wait_ready::<H>(io, port, ready_timeout).is_err() {
        stop_engine::<H>(io, port)?;
        comreset::<H>(io, port)?;
        wait_ready::<H>(io, port, ready_timeout)?;
    }

    start_engine(io);
    Ok(io.sig().into_bits())
}

/// Runs one command with interrupts masked and polls for its completion.
/// Returns the status and error registers.
pub(crate) fn exec_polled<H: Hal>(
    io: &PortIo,
    mem: &CommandMemory,
    port: u8,
    slot: u8,
    req: &AtaDeviceRequest,
    timeout: u64,
) -> Result<(u8, u8), AhciError> {
    mem.prepare::<H>(slot, req);
    io.set_ci(1 << slot);

    let done = wait_until_timeout::<H>(
        || io.ci() & (1 << slot) == 0 || io.is().TFE(),
        timeout,
    );
    H::flush_dcache();
    let is = io.is();
    io.ack_is(is);
    let tfd = io.tfd();

    if !done {
        warn!("Port {port} polled command {:#04x} timed out", req.task_file().command);
        restart_engine::<H>(io, port)?;
        return Err(AhciError::Timeout);
    }
    if is.TFE() || tfd.status() & ATA_STATUS_ERR != 0 {
        debug!("Port {port} polled command {:#04x} failed: {tfd:?}", req.task_file().command);
        restart_engine::<H>(io, port)?;
        return Err(AhciError::TaskFile {
            status: tfd.status(),
            error: tfd.ERR(),
        });
    }
    Ok((tfd.status(), tfd.ERR()))
}

/// Stop and start of the engine to clear a halted command list.
fn restart_engine<H: Hal>(io: &PortIo, port: u8) -> Result<(), AhciError> {
    stop_engine::<H>(io, port)?;
    io.clear_serr();
    if io.tfd().is_busy() {
        comreset::<H>(io, port)?;
    }
    start_engine(io);
    Ok(())
}

/// Shuts the port down for removal.
pub(crate) fn shut_down<H: Hal>(io: &PortIo, port: u8) {
    io.set_ie(PxI::new());
    if stop_engine::<H>(io, port).is_ok() {
        let _ = stop_fis_receive::<H>(io, port);
    }
    io.update_cmd(|cmd| cmd.with_ICC(ICC::Idle));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ata::{ATA_CMD_FPDMA_WRITE, ATA_CMD_PACKET, ATA_CMD_READ_DMA},
        hal::SgEntry,
        request::AtaDeviceRequest,
        sim::TestHal,
    };

    #[test]
    fn tables_are_page_granular() {
        let mem = CommandMemory::new(9).unwrap();
        assert_eq!(mem.slots(), 9);
        assert_eq!(mem.allocations.len(), 2 + 3);
        let t0 = mem.table(0).as_raw_ptr().addr().get();
        let t3 = mem.table(3).as_raw_ptr().addr().get();
        assert_eq!(t0 % PAGE_SIZE, 0);
        assert_eq!(t3 - t0, 3 * 0x400);
        assert_eq!(mem.cmd_list_phys::<TestHal>() % 1024, 0);
    }

    #[test]
    fn prepare_writes_fis_prd_and_header() {
        let mem = CommandMemory::new(4).unwrap();
        let mut req = AtaDeviceRequest::new(0);
        req.task_file.command = ATA_CMD_READ_DMA;
        req.task_file.lba28(0, 1);
        req.flags = RequestFlags::DATA_IN | RequestFlags::DMA;
        req.sg.push(SgEntry {
            phys: 0x8000,
            len: 512,
        });
        mem.prepare::<TestHal>(2, &req);

        let hdr = mem.header(2).read();
        assert_eq!(hdr.opts.cfl(), 5);
        assert_eq!(hdr.opts.prdtl(), 1);
        assert!(!hdr.opts.write());
        let table = mem.table(2);
        assert_eq!(
            hdr.tbl_addr_lo as usize,
            table.as_raw_ptr().addr().get() as u32 as usize
        );
        let fis = table.cfis().read();
        assert_eq!(fis.fis_type, SATA_FIS_TYPE_REGISTER_H2D);
        assert_eq!(fis.pm_port_c, SATA_FIS_H2D_C);
        assert_eq!(fis.command, ATA_CMD_READ_DMA);
        assert_eq!(fis.sector_count, 1);
        let sg = table.sgs().read()[0];
        assert_eq!(sg.byte_count(), 512);
        assert!(sg.interrupt());
    }

    #[test]
    fn ncq_tag_and_packet_placement() {
        let mem = CommandMemory::new(8).unwrap();
        let mut req = AtaDeviceRequest::new(0);
        req.task_file.command = ATA_CMD_FPDMA_WRITE;
        req.flags = RequestFlags::NCQ | RequestFlags::DATA_OUT;
        mem.prepare::<TestHal>(5, &req);
        assert_eq!(mem.table(5).cfis().read().sector_count, 5 << 3);
        assert!(mem.header(5).read().opts.write());

        let mut atapi = AtaDeviceRequest::new(1);
        atapi.task_file.command = ATA_CMD_PACKET;
        atapi.flags = RequestFlags::PACKET_COMMAND;
        atapi.cdb[0] = 0x12;
        mem.prepare::<TestHal>(6, &atapi);
        assert!(mem.header(6).read().opts.atapi());
        assert_eq!(mem.table(6).acmd().read()[0], 0x12);
    }
}
