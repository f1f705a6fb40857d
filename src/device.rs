//! One ATA or ATAPI device behind an AHCI port.
//!
//! Requests enter through [`AtaDevice::start_srb`], wait in the C-LOOK
//! queue until a tag is free, get translated, wait for a command slot and
//! are then handed to the hardware. Completion runs from the DPC.
//!
//! Locks are taken in the order request, then device state or queue; the
//! device state and the queue lock are never held together.

use alloc::{boxed::Box, collections::VecDeque, sync::Arc, vec::Vec};
use core::{
    marker::PhantomData,
    sync::atomic::{AtomicBool, AtomicU32, Ordering},
};

use bitflags::bitflags;
use log::{debug, info, warn};
use spin::{Mutex, RwLock};

use crate::{
    Hal,
    ahci::ChannelConfig,
    ata::{ATA_CMD_ID_ATA, ATA_CMD_ID_ATAPI, IdentifyData},
    bitmap::SlotBitmap,
    hal::{map_sg, wait_until_timeout},
    mmio::{PortIo, PxI},
    port::{self, CommandMemory},
    queue::{FreezeReason, Irp, QueueEntry, WaitQueue},
    recovery::{RecoveryCause, RecoveryState},
    request::{AtaDeviceRequest, Completion, DataBuffer, InternalState, RequestFlags},
    satl::{self, Translation},
    scsi::{SenseData, Srb, SrbFlags, SrbFunction, SrbStatus},
    types::{AHCI_MAX_BYTES_PER_SG, AHCI_MAX_CMDS, AHCI_MAX_SG},
};

bitflags! {
    /// Capabilities taken from IDENTIFY data.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceFlags: u32 {
        const ATAPI = 1 << 0;
        const LBA = 1 << 1;
        const LBA48 = 1 << 2;
        /// NCQ is supported by the device and the HBA and allowed.
        const NCQ = 1 << 3;
        const PIO_ONLY = 1 << 4;
        const FUA = 1 << 5;
        const REMOVABLE = 1 << 6;
        const DMADIR = 1 << 7;
        const WRITE_CACHE = 1 << 8;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Ata,
    Atapi,
}

impl DeviceClass {
    /// IDENTIFY command that answers for this class.
    pub fn identify_command(self) -> u8 {
        match self {
            Self::Ata => ATA_CMD_ID_ATA,
            Self::Atapi => ATA_CMD_ID_ATAPI,
        }
    }

    pub fn other(self) -> Self {
        match self {
            Self::Ata => Self::Atapi,
            Self::Atapi => Self::Ata,
        }
    }
}

/// Cached device parameters.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub class: DeviceClass,
    pub flags: DeviceFlags,
    /// Sectors per block of READ/WRITE MULTIPLE, 0 when unused.
    pub multiple: u8,
    pub queue_depth: u8,
    pub cylinders: u16,
    pub heads: u16,
    pub sectors_per_track: u16,
    pub total_sectors: u64,
    pub sector_size: u32,
    pub cdb_size: u8,
    pub identify: IdentifyData,
}

impl DeviceInfo {
    pub fn from_identify(class: DeviceClass, id: &IdentifyData, allow_ncq: bool) -> Self {
        let mut flags = DeviceFlags::empty();
        flags.set(DeviceFlags::PIO_ONLY, !id.has_dma());
        flags.set(DeviceFlags::REMOVABLE, id.is_removable());

        let mut info = Self {
            class,
            flags,
            multiple: 0,
            queue_depth: 1,
            cylinders: 0,
            heads: 0,
            sectors_per_track: 0,
            total_sectors: 0,
            sector_size: 2048,
            cdb_size: id.cdb_size() as u8,
            identify: id.clone(),
        };
        if class == DeviceClass::Atapi {
            info.flags |= DeviceFlags::ATAPI;
            info.flags.set(DeviceFlags::DMADIR, id.atapi_dmadir());
            return info;
        }

        info.flags.set(DeviceFlags::LBA, id.has_lba());
        info.flags.set(DeviceFlags::LBA48, id.has_lba48());
        info.flags.set(DeviceFlags::FUA, id.has_fua());
        if allow_ncq && id.has_ncq() && id.queue_depth() > 1 && id.has_dma() {
            info.flags |= DeviceFlags::NCQ;
            info.queue_depth = id.queue_depth();
        }
        info.multiple = id.multiple_sectors();
        info.cylinders = id.cylinders();
        info.heads = id.heads();
        info.sectors_per_track = id.sectors_per_track();
        info.refresh(id);
        info
    }

    /// Takes over the parts of fresh IDENTIFY data that can change at run
    /// time.
    pub(crate) fn refresh(&mut self, id: &IdentifyData) {
        self.total_sectors = id.user_addressable_sectors();
        self.sector_size = id.sector_size();
        self.flags.set(DeviceFlags::WRITE_CACHE, id.write_cache_enabled());
        self.identify = id.clone();
    }
}

/// Who holds a command slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Owner {
    Tag(u8),
    Internal,
}

/// State guarded by the device lock: slots, issue bitmaps, DMA memory.
pub(crate) struct PortState {
    pub(crate) mem: CommandMemory,
    free_slots: SlotBitmap,
    last_slot: u8,
    /// Positive: non-NCQ commands hold slots. Negative: NCQ commands do.
    allocated: i32,
    exclusive: bool,
    /// Issued to the HBA.
    pub(crate) active: SlotBitmap,
    /// Built, waiting for the port to become active.
    pub(crate) prepared: SlotBitmap,
    /// Halted by an engine stop, waiting to be reissued.
    pub(crate) paused: SlotBitmap,
    pub(crate) ncq: SlotBitmap,
    pub(crate) owners: [Option<Owner>; AHCI_MAX_CMDS],
    timeouts: [u32; AHCI_MAX_CMDS],
    timers: [u32; AHCI_MAX_CMDS],
    pub(crate) port_active: bool,
    /// Tags that hold a translated request but no slot, oldest first.
    pending: VecDeque<u8>,
    pub(crate) internal_slot: u8,
    pub(crate) recovery: RecoveryState,
}

impl PortState {
    pub(crate) fn new(mem: CommandMemory, slots: u32) -> Self {
        let internal_slot = (mem.slots().max(1) - 1) as u8;
        Self {
            mem,
            free_slots: SlotBitmap::with_first(slots),
            last_slot: (AHCI_MAX_CMDS - 1) as u8,
            allocated: 0,
            exclusive: false,
            active: SlotBitmap::empty(),
            prepared: SlotBitmap::empty(),
            paused: SlotBitmap::empty(),
            ncq: SlotBitmap::empty(),
            owners: [None; AHCI_MAX_CMDS],
            timeouts: [0; AHCI_MAX_CMDS],
            timers: [0; AHCI_MAX_CMDS],
            port_active: false,
            pending: VecDeque::new(),
            internal_slot,
            recovery: RecoveryState::default(),
        }
    }

    /// Picks a slot for a request with `flags`, honouring exclusive access
    /// and the NCQ/non-NCQ split.
    pub(crate) fn allocate_slot(&mut self, flags: RequestFlags) -> Option<u8> {
        if self.exclusive {
            return None;
        }
        if flags.contains(RequestFlags::EXCLUSIVE) && self.allocated != 0 {
            return None;
        }
        let ncq = flags.contains(RequestFlags::NCQ);
        if (ncq && self.allocated > 0) || (!ncq && self.allocated < 0) {
            return None;
        }

        let slot = self.free_slots.next_after(self.last_slot)?;
        self.free_slots.clear(slot);
        self.last_slot = slot;
        self.allocated += if ncq { -1 } else { 1 };
        if flags.contains(RequestFlags::EXCLUSIVE) {
            self.exclusive = true;
        }
        Some(slot)
    }

    pub(crate) fn release_slot(&mut self, slot: u8, flags: RequestFlags) {
        debug_assert!(!self.free_slots.test(slot));
        self.free_slots.set(slot);
        self.allocated -= if flags.contains(RequestFlags::NCQ) { -1 } else { 1 };
        if flags.contains(RequestFlags::EXCLUSIVE) {
            self.exclusive = false;
        }
        self.forget_slot(slot);
    }

    pub(crate) fn forget_slot(&mut self, slot: u8) {
        self.active.clear(slot);
        self.prepared.clear(slot);
        self.paused.clear(slot);
        self.ncq.clear(slot);
        self.owners[slot as usize] = None;
        self.timers[slot as usize] = 0;
    }

    pub(crate) fn clear_timer(&mut self, slot: u8) {
        self.timers[slot as usize] = 0;
    }

    pub(crate) fn allocated(&self) -> i32 {
        self.allocated
    }

    pub(crate) fn outstanding(&self) -> SlotBitmap {
        SlotBitmap::from_bits(self.active.bits() | self.paused.bits() | self.prepared.bits())
    }
}

struct QueueState {
    free_tags: SlotBitmap,
    all_tags: SlotBitmap,
    waiting: WaitQueue,
    frozen: FreezeReason,
}

/// An attached device and the port state it owns.
pub struct AtaDevice<H> {
    pub(crate) port: u8,
    pub(crate) io: PortIo,
    pub(crate) config: ChannelConfig,
    info: RwLock<DeviceInfo>,
    queue: Mutex<QueueState>,
    pub(crate) state: Mutex<PortState>,
    requests: Box<[Mutex<AtaDeviceRequest>]>,
    pub(crate) internal: Mutex<AtaDeviceRequest>,
    pending_is: AtomicU32,
    dpc_pending: AtomicBool,
    pub(crate) worker_pending: AtomicBool,
    pub(crate) in_worker: AtomicBool,
    channel_failed: Arc<AtomicBool>,
    _h: PhantomData<fn() -> H>,
}

fn complete_irp_now(irp: &Irp, status: SrbStatus) {
    if let Some(mut srb) = irp.take_srb() {
        srb.status = status;
        if status != SrbStatus::Success {
            srb.data_transfer_length = 0;
        }
        irp.complete(srb);
    }
}

impl<H: Hal> AtaDevice<H> {
    pub(crate) fn new(
        port: u8,
        io: PortIo,
        mem: CommandMemory,
        info: DeviceInfo,
        config: ChannelConfig,
        channel_failed: Arc<AtomicBool>,
    ) -> Self {
        // The highest slot is kept for recovery commands.
        let hba_slots = mem.slots() as u32;
        let usable = hba_slots.saturating_sub(1).max(1);
        let tags = if info.flags.contains(DeviceFlags::NCQ) {
            (info.queue_depth as u32).min(usable)
        } else {
            usable
        }
        .max(1);
        debug!("Port {port} {tags} tags, {hba_slots} slots");

        Self {
            port,
            io,
            config,
            info: RwLock::new(info),
            queue: Mutex::new(QueueState {
                free_tags: SlotBitmap::with_first(tags),
                all_tags: SlotBitmap::with_first(tags),
                waiting: WaitQueue::default(),
                frozen: FreezeReason::NOT_STARTED,
            }),
            state: Mutex::new(PortState::new(mem, tags)),
            requests: (0..tags as u8)
                .map(|tag| Mutex::new(AtaDeviceRequest::new(tag)))
                .collect(),
            internal: Mutex::new(AtaDeviceRequest::new(u8::MAX)),
            pending_is: AtomicU32::new(0),
            dpc_pending: AtomicBool::new(false),
            worker_pending: AtomicBool::new(false),
            in_worker: AtomicBool::new(false),
            channel_failed,
            _h: PhantomData,
        }
    }

    pub fn port(&self) -> u8 {
        self.port
    }

    pub fn info(&self) -> DeviceInfo {
        self.info.read().clone()
    }

    pub fn tag_count(&self) -> usize {
        self.requests.len()
    }

    /// Requests waiting for a tag.
    pub fn queued(&self) -> usize {
        self.queue.lock().waiting.len()
    }

    /// Error recovery owns the port.
    pub fn in_recovery(&self) -> bool {
        self.state.lock().recovery.in_progress()
    }

    pub fn frozen(&self) -> FreezeReason {
        self.queue.lock().frozen
    }

    /// No request holds a tag.
    pub fn is_idle(&self) -> bool {
        let q = self.queue.lock();
        q.free_tags == q.all_tags
    }

    pub(crate) fn link_present(&self) -> bool {
        self.io.ssts().DET() == 3
    }

    /// Activates the port after discovery and lets the queue run.
    pub fn start(&self) {
        {
            let mut st = self.state.lock();
            st.port_active = true;
            self.issue_prepared(&mut st);
        }
        self.io.set_ie(PxI::default_enable());
        info!("Port {} started", self.port);
        self.thaw(FreezeReason::NOT_STARTED);
    }

    /// Entry point for SCSI request blocks. The returned IRP completes
    /// asynchronously; its SRB carries the result.
    pub fn start_srb(&self, mut srb: Srb) -> Arc<Irp> {
        srb.status = SrbStatus::Pending;
        srb.queue_frozen = false;
        srb.autosense_valid = false;
        let function = srb.function;
        let irp = Irp::new(srb);

        match function {
            SrbFunction::ExecuteScsi | SrbFunction::Flush | SrbFunction::Shutdown => {
                self.queue_request(&irp);
            }
            SrbFunction::ReleaseQueue => {
                self.thaw(FreezeReason::SRB_ERROR);
                complete_irp_now(&irp, SrbStatus::Success);
            }
            SrbFunction::LockQueue => {
                self.freeze(FreezeReason::LOCKED);
                complete_irp_now(&irp, SrbStatus::Success);
            }
            SrbFunction::UnlockQueue => {
                self.thaw(FreezeReason::LOCKED);
                complete_irp_now(&irp, SrbStatus::Success);
            }
            SrbFunction::FlushQueue => {
                self.abort_queued(SrbStatus::Aborted);
                complete_irp_now(&irp, SrbStatus::Success);
            }
            SrbFunction::ClaimDevice | SrbFunction::ReleaseDevice => {
                complete_irp_now(&irp, SrbStatus::Success);
            }
            SrbFunction::IoControl => complete_irp_now(&irp, SrbStatus::InvalidRequest),
        }
        irp
    }

    fn queue_request(&self, irp: &Arc<Irp>) {
        if self.channel_failed.load(Ordering::Acquire) {
            complete_irp_now(irp, SrbStatus::NoDevice);
            return;
        }
        {
            let mut q = self.queue.lock();
            if q.frozen.contains(FreezeReason::REMOVED) {
                drop(q);
                complete_irp_now(irp, SrbStatus::NoDevice);
                return;
            }
            q.waiting.insert(QueueEntry::new(irp.clone()));
            if !irp.set_cancel_routine() {
                q.waiting.remove(irp.id());
                drop(q);
                complete_irp_now(irp, SrbStatus::Aborted);
                return;
            }
        }
        self.run_queue(self.get_next_request());
    }

    /// Cancels a request that is still waiting for a tag. Dispatched
    /// requests cannot be cancelled; returns whether this call completed
    /// the IRP.
    pub fn cancel_irp(&self, irp: &Arc<Irp>) -> bool {
        irp.request_cancel();
        if !irp.clear_cancel_routine() {
            return false;
        }
        self.queue.lock().waiting.remove(irp.id());
        debug!("Port {} IRP {} cancelled", self.port, irp.id());
        complete_irp_now(irp, SrbStatus::Aborted);
        true
    }

    /// Completes every queued request with `status`.
    fn abort_queued(&self, status: SrbStatus) {
        let entries = self.queue.lock().waiting.drain();
        for entry in entries {
            if entry.irp.clear_cancel_routine() {
                complete_irp_now(&entry.irp, status);
            }
        }
    }

    pub fn freeze(&self, reason: FreezeReason) {
        self.queue.lock().frozen |= reason;
    }

    /// Clears `reason` and restarts the queue once nothing holds it.
    pub fn thaw(&self, reason: FreezeReason) {
        self.queue.lock().frozen.remove(reason);
        self.run_queue(self.get_next_request());
    }

    /// Freezes the queue for `reason` and waits until every dispatched
    /// request has completed. The caller thaws the queue afterwards.
    pub fn freeze_queue_and_wait(&self, reason: FreezeReason, timeout_ms: u64) -> bool {
        self.freeze(reason);
        wait_until_timeout::<H>(|| self.is_idle(), timeout_ms)
    }

    /// Pops the next eligible queued request and gives it a tag.
    fn get_next_request(&self) -> Option<(u8, Arc<Irp>)> {
        let mut q = self.queue.lock();
        loop {
            let tag = q.free_tags.lowest()?;
            let frozen = q.frozen;
            let entry = q
                .waiting
                .pop_next(|e| (frozen - FreezeReason::bypassed_by(e.flags)).is_empty())?;
            // Lost against the cancel routine, which completes it.
            if !entry.irp.clear_cancel_routine() {
                continue;
            }
            q.free_tags.clear(tag);
            return Some((tag, entry.irp));
        }
    }

    fn free_tag(&self, tag: u8) {
        self.queue.lock().free_tags.set(tag);
    }

    fn run_queue(&self, mut next: Option<(u8, Arc<Irp>)>) {
        while let Some((tag, irp)) = next.take() {
            self.dispatch(tag, irp);
            next = self.get_next_request();
        }
    }

    /// Translates the request and either completes it or sends it on to
    /// the slot allocator.
    fn dispatch(&self, tag: u8, irp: Arc<Irp>) {
        let Some(srb) = irp.take_srb() else {
            self.free_tag(tag);
            return;
        };
        let mut req = self.requests[tag as usize].lock();
        req.reset();
        req.srb = Some(srb);
        req.irp = Some(irp);

        let translation = {
            let info = self.info.read();
            satl::translate(&info, &mut req, self.config.max_transfer)
        };
        if req.timeout == 0 {
            req.timeout = self.config.default_timeout;
        }
        match translation {
            Translation::Complete => self.finish_request(&mut req),
            Translation::Execute => self.submit(&mut req),
        }
    }

    fn submit(&self, req: &mut AtaDeviceRequest) {
        if let Some((va, len)) = req.data_region() {
            let mut sg = core::mem::take(&mut req.sg);
            let mapped = map_sg::<H>(va, len, AHCI_MAX_BYTES_PER_SG, AHCI_MAX_SG, &mut sg);
            req.sg = sg;
            if let Err(err) = mapped {
                warn!("Port {} tag {}: {err}", self.port, req.tag);
                self.resource_failure(req);
                return;
            }
        }

        let mut st = self.state.lock();
        match st.allocate_slot(req.flags) {
            Some(slot) => self.execute(&mut st, req, slot),
            None => st.pending.push_back(req.tag),
        }
    }

    /// Requeues the request once, then fails it.
    fn resource_failure(&self, req: &mut AtaDeviceRequest) {
        let retry = req.srb.as_ref().is_some_and(|srb| !srb.retried);
        if !retry {
            if let Some(srb) = req.srb.as_mut() {
                srb.status = SrbStatus::InsufficientResources;
                srb.data_transfer_length = 0;
            }
            self.finish_request(req);
            return;
        }

        let tag = req.tag;
        if let (Some(irp), Some(mut srb)) = (req.irp.take(), req.srb.take()) {
            srb.retried = true;
            irp.restore_srb(srb);
            let mut q = self.queue.lock();
            q.waiting.insert(QueueEntry::new(irp.clone()));
            if !irp.set_cancel_routine() {
                q.waiting.remove(irp.id());
                drop(q);
                complete_irp_now(&irp, SrbStatus::Aborted);
            }
        }
        req.reset();
        self.free_tag(tag);
    }

    /// Builds the command in `slot` and issues it, or parks it in the
    /// prepared set while the port is not active.
    fn execute(&self, st: &mut PortState, req: &mut AtaDeviceRequest, slot: u8) {
        req.slot = slot;
        req.state = InternalState::Active;
        st.owners[slot as usize] = Some(if req.flags.contains(RequestFlags::RECOVERY) {
            Owner::Internal
        } else {
            Owner::Tag(req.tag)
        });
        st.timeouts[slot as usize] = req.timeout;
        st.ncq.set_to(slot, req.flags.contains(RequestFlags::NCQ));
        st.mem.prepare::<H>(slot, req);

        if st.port_active || req.flags.contains(RequestFlags::BYPASS_ACTIVE_QUEUE) {
            self.issue(st, slot);
        } else {
            st.prepared.set(slot);
        }
    }

    /// Issues a recovery command in the reserved slot. The port is stopped
    /// for everything else while it runs.
    pub(crate) fn execute_internal(&self, req: &mut AtaDeviceRequest) {
        debug_assert!(
            req.flags
                .contains(RequestFlags::RECOVERY | RequestFlags::BYPASS_ACTIVE_QUEUE)
        );
        let mut st = self.state.lock();
        let slot = st.internal_slot;
        self.execute(&mut st, req, slot);
    }

    /// Sets the SACT (NCQ) and CI bits of a built slot.
    pub(crate) fn issue(&self, st: &mut PortState, slot: u8) {
        st.active.set(slot);
        st.timers[slot as usize] = st.timeouts[slot as usize].max(1);
        debug!("Port {} issue slot {slot}", self.port);
        if st.ncq.test(slot) {
            self.io.set_sact(1 << slot);
        }
        self.io.set_ci(1 << slot);
    }

    pub(crate) fn issue_prepared(&self, st: &mut PortState) {
        let prepared = st.prepared;
        st.prepared = SlotBitmap::empty();
        for slot in prepared.iter() {
            self.issue(st, slot);
        }
    }

    /// Gives freed slots to requests that were waiting for one, oldest
    /// first. Stops at the first request that still cannot get a slot.
    fn dispatch_pending(&self) {
        loop {
            let Some(tag) = self.state.lock().pending.front().copied() else {
                return;
            };
            let mut req = self.requests[tag as usize].lock();
            let mut st = self.state.lock();
            if st.pending.front() != Some(&tag) {
                continue;
            }
            let Some(slot) = st.allocate_slot(req.flags) else {
                return;
            };
            st.pending.pop_front();
            self.execute(&mut st, &mut req, slot);
        }
    }

    /// Releases everything a finished request holds and completes its IRP.
    /// Does not schedule new work.
    pub(crate) fn finish_request(&self, req: &mut AtaDeviceRequest) {
        if req.state != InternalState::NotStarted {
            self.state.lock().release_slot(req.slot, req.flags);
        }
        let tag = req.tag;
        let irp = req.irp.take();
        let srb = req.srb.take();
        req.reset();

        if let (Some(irp), Some(mut srb)) = (irp, srb) {
            if srb.status == SrbStatus::Pending {
                srb.status = SrbStatus::Success;
            }
            let failed = !matches!(srb.status, SrbStatus::Success | SrbStatus::DataOverrun);
            if failed && !srb.flags.contains(SrbFlags::NO_QUEUE_FREEZE) {
                srb.queue_frozen = true;
                self.freeze(FreezeReason::SRB_ERROR);
            }
            debug!(
                "Port {} tag {tag} done: {:?} ({} bytes)",
                self.port, srb.status, srb.data_transfer_length
            );
            irp.complete(srb);
        }
        self.free_tag(tag);
    }

    /// Fails the request in `slot` with `status`, or with CHECK CONDITION
    /// when sense data is given.
    pub(crate) fn fail_slot(&self, slot: u8, status: SrbStatus, sense: Option<SenseData>) {
        let owner = self.state.lock().owners[slot as usize];
        let Some(Owner::Tag(tag)) = owner else {
            return;
        };
        let mut req = self.requests[tag as usize].lock();
        req.state = InternalState::Recovery;
        if let Some(srb) = req.srb.as_mut() {
            srb.data_transfer_length = 0;
            match sense {
                Some(sense) => srb.set_check_condition(sense),
                None => srb.status = status,
            }
        }
        self.finish_request(&mut req);
    }

    /// Marks every request halted by an engine stop.
    pub(crate) fn mark_paused(&self, slots: SlotBitmap, state: InternalState) {
        for slot in slots.iter() {
            let owner = self.state.lock().owners[slot as usize];
            if let Some(Owner::Tag(tag)) = owner {
                self.requests[tag as usize].lock().state = state;
            }
        }
    }

    /// Lets waiting work run after completions or a resume.
    pub(crate) fn schedule(&self) {
        self.dispatch_pending();
        self.run_queue(self.get_next_request());
    }

    /// Interrupt handler: acknowledges and masks the port, defers the work.
    pub(crate) fn isr(&self) -> bool {
        let is = self.io.is();
        if is.into_bits() == 0 {
            return false;
        }
        self.io.ack_is(is);
        self.io.set_ie(PxI::new());
        self.pending_is.fetch_or(is.into_bits(), Ordering::AcqRel);
        self.dpc_pending.store(true, Ordering::Release);
        true
    }

    pub(crate) fn dpc_pending(&self) -> bool {
        self.dpc_pending.load(Ordering::Acquire)
    }

    /// Completion processing for everything the ISR collected.
    pub(crate) fn run_dpc(&self) {
        if !self.dpc_pending.swap(false, Ordering::AcqRel) {
            return;
        }
        let is = PxI::from_bits(self.pending_is.swap(0, Ordering::AcqRel));
        let mut finished = Vec::new();
        let mut paused = false;
        let mut resumed = false;
        {
            let mut st = self.state.lock();
            if is.is_hotplug() {
                warn!("Port {} hot plug event {is:?}", self.port);
            }
            if is.INF() {
                let serr = self.io.clear_serr();
                debug!("Port {} interface error {serr:?}", self.port);
            }

            let busy = self.io.ci() | self.io.sact();
            let done = SlotBitmap::from_bits(st.active.bits() & !busy);
            for slot in done.iter() {
                st.active.clear(slot);
                st.timers[slot as usize] = 0;
                let owner = st.owners[slot as usize];
                finished.push((slot, owner, st.mem.transferred(slot)));
            }

            if is.is_fatal() {
                paused = self.enter_recovery(&mut st, RecoveryCause::Fatal(is));
            } else if st.recovery.isolating() && st.active.is_empty() {
                resumed = self.reissue_paused(&mut st);
            }
        }
        if paused {
            self.freeze(FreezeReason::PAUSED);
            self.worker_pending.store(true, Ordering::Release);
        }

        for (slot, owner, transferred) in finished {
            match owner {
                Some(Owner::Tag(tag)) => {
                    let mut req = self.requests[tag as usize].lock();
                    self.complete_hw(&mut req, transferred);
                }
                Some(Owner::Internal) => self.complete_internal(slot, transferred),
                None => warn!("Port {} completion on idle slot {slot}", self.port),
            }
        }

        self.io.set_ie(PxI::default_enable());
        if resumed {
            self.thaw(FreezeReason::PAUSED);
        }
        self.schedule();
    }

    /// Finishes a request whose slot the HBA reported complete.
    fn complete_hw(&self, req: &mut AtaDeviceRequest, transferred: u32) {
        let mut status = SrbStatus::Success;
        let mut actual = req.data_length;
        let data = req.flags.intersects(RequestFlags::DATA_IN | RequestFlags::DATA_OUT);
        // PRDBC is not maintained for queued commands.
        if data && !req.flags.contains(RequestFlags::NCQ) && transferred < req.data_length {
            status = SrbStatus::DataOverrun;
            actual = transferred;
        }

        match req.completion {
            Completion::Srb | Completion::Internal => {
                let buffer = req.buffer;
                if let Some(srb) = req.srb.as_mut() {
                    srb.status = status;
                    if buffer == DataBuffer::Srb {
                        srb.data_transfer_length = actual;
                    } else if buffer == DataBuffer::None {
                        srb.data_transfer_length = 0;
                    }
                }
            }
            Completion::ReadCapacity { long } => {
                let id = IdentifyData::from_bytes(&req.scratch[..]);
                let mut reply = [0u8; 32];
                let len = {
                    let mut info = self.info.write();
                    info.refresh(&id);
                    satl::read_capacity_reply(&info, long, &mut reply)
                };
                if let Some(srb) = req.srb.as_mut() {
                    let len = len
                        .min(srb.data.len())
                        .min(srb.data_transfer_length as usize);
                    srb.data[..len].copy_from_slice(&reply[..len]);
                    srb.data_transfer_length = len as u32;
                    srb.status = SrbStatus::Success;
                }
            }
            Completion::ModeSense6 => {
                let scratch = req.scratch.clone();
                if let Some(srb) = req.srb.as_mut() {
                    let allocation = (srb.data_transfer_length as usize).min(srb.data.len());
                    let len = satl::mode_sense10_to_6(
                        &scratch[..],
                        actual as usize,
                        &mut srb.data[..allocation],
                    );
                    srb.data_transfer_length = len as u32;
                    srb.status = SrbStatus::Success;
                }
            }
            Completion::WriteCache { enabled } => {
                self.info.write().flags.set(DeviceFlags::WRITE_CACHE, enabled);
                if let Some(srb) = req.srb.as_mut() {
                    srb.status = SrbStatus::Success;
                }
            }
        }
        self.finish_request(req);
    }

    fn complete_internal(&self, slot: u8, transferred: u32) {
        {
            let mut req = self.internal.lock();
            req.data_length = transferred.min(req.data_length);
            req.state = InternalState::NotStarted;
        }
        self.state.lock().forget_slot(slot);
        self.worker_pending.store(true, Ordering::Release);
    }

    /// Counts down the timers of issued slots; called once per second.
    pub(crate) fn io_timer(&self) {
        let paused = {
            let mut st = self.state.lock();
            let mut expired = None;
            for slot in st.active.iter() {
                let timer = &mut st.timers[slot as usize];
                if *timer == 0 {
                    continue;
                }
                *timer -= 1;
                if *timer == 0 && expired.is_none() {
                    expired = Some(slot);
                }
            }
            match expired {
                Some(slot) => {
                    warn!("Port {} slot {slot} timed out", self.port);
                    self.enter_recovery(&mut st, RecoveryCause::Timeout(slot))
                }
                None => false,
            }
        };
        if paused {
            self.freeze(FreezeReason::PAUSED);
            self.worker_pending.store(true, Ordering::Release);
        }
    }

    /// Takes the device offline: queued and outstanding requests complete
    /// with `NoDevice`.
    pub(crate) fn remove(&self) {
        info!("Port {} device removed", self.port);
        self.freeze(FreezeReason::REMOVED);
        port::shut_down::<H>(&self.io, self.port);
        self.abort_queued(SrbStatus::NoDevice);

        let (slots, pending) = {
            let mut st = self.state.lock();
            st.port_active = false;
            st.recovery = RecoveryState::default();
            let pending: Vec<u8> = st.pending.drain(..).collect();
            (st.outstanding(), pending)
        };
        for slot in slots.iter() {
            self.fail_slot(slot, SrbStatus::NoDevice, None);
        }
        for tag in pending {
            let mut req = self.requests[tag as usize].lock();
            if let Some(srb) = req.srb.as_mut() {
                srb.status = SrbStatus::NoDevice;
                srb.data_transfer_length = 0;
            }
            self.finish_request(&mut req);
        }
    }
}
