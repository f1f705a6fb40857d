//! Error recovery for a port whose command engine halted.
//!
//! The DPC (or the I/O timer) stops the engine, moves every issued command
//! to the paused set and freezes the queue. The worker then restarts the
//! port, finds out which command failed, completes it with sense data and
//! reissues the rest.

use core::sync::atomic::Ordering;

use log::{debug, error, info, warn};

use crate::{
    Hal,
    ata::{
        ATA_CMD_PACKET, ATA_CMD_READ_LOG_EXT, ATA_ERROR_IDNF, ATA_ERROR_UNC, ATA_LOG_NCQ_ERROR,
        NcqErrorLog,
    },
    bitmap::SlotBitmap,
    device::{AtaDevice, DeviceClass, Owner, PortState},
    hal::map_sg,
    mmio::PxI,
    port,
    queue::FreezeReason,
    request::{Completion, DataBuffer, InternalState, RequestFlags, SCRATCH_SIZE},
    scsi::{SCSIOP_REQUEST_SENSE, SENSE_BUFFER_SIZE, SenseData, SrbStatus},
    types::{AHCI_MAX_BYTES_PER_SG, AHCI_MAX_SG},
};

/// Seconds an internal recovery command may take.
const INTERNAL_TIMEOUT: u32 = 10;

#[derive(Debug, Clone, Copy)]
pub(crate) enum RecoveryCause {
    Fatal(PxI),
    Timeout(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InternalCommand {
    /// REQUEST SENSE for the packet command in `slot`.
    RequestSense { slot: u8 },
    /// READ LOG EXT of the NCQ Command Error log.
    ReadLog,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum Stage {
    #[default]
    Idle,
    /// Engine stopped, the worker has to restart the port.
    Restart,
    /// An internal command is running.
    Wait(InternalCommand),
    /// Paused commands are reissued one at a time.
    Isolate,
}

#[derive(Debug, Default)]
pub(crate) struct RecoveryState {
    stage: Stage,
    /// Slot of the command known to have failed.
    fault: Option<u8>,
    timed_out: bool,
    /// Status and error registers at the time of the fault.
    task_file: (u8, u8),
    /// First failing LBA the device reported for the fault.
    fault_lba: Option<u64>,
    internal_failed: bool,
    hard_reset: bool,
    /// The NCQ error log was read and the failed command completed.
    log_read: bool,
    isolating: bool,
    isolate: SlotBitmap,
}

impl RecoveryState {
    pub(crate) fn isolating(&self) -> bool {
        self.stage == Stage::Isolate
    }

    pub(crate) fn in_progress(&self) -> bool {
        self.stage != Stage::Idle
    }
}

/// Next step of the recovery state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Fail {
        slot: u8,
        status: SrbStatus,
        sense: Option<SenseData>,
    },
    Internal(InternalCommand),
    Isolate,
    Resume,
}

/// Sense data built from the task file when the device could not be
/// asked for it.
fn fallback_sense(class: DeviceClass, (status, error): (u8, u8), lba: Option<u64>) -> SenseData {
    match class {
        DeviceClass::Atapi => SenseData::new(error >> 4, 0, 0),
        DeviceClass::Ata => SenseData {
            information: lba
                .filter(|_| error & (ATA_ERROR_UNC | ATA_ERROR_IDNF) != 0)
                .and_then(|lba| u32::try_from(lba).ok()),
            ..SenseData::from_ata_error(status, error)
        },
    }
}

impl<H: Hal> AtaDevice<H> {
    /// Stops the port after a fatal interrupt or a timeout. Returns `true`
    /// when the caller has to freeze the queue and wake the worker.
    pub(crate) fn enter_recovery(&self, st: &mut PortState, cause: RecoveryCause) -> bool {
        let tfd = self.io.tfd();
        let mut halted = st.active;
        let stopped = port::stop_engine::<H>(&self.io, self.port).is_ok();
        let serr = self.io.clear_serr();
        warn!(
            "Port {} error recovery: {cause:?}, TFD {tfd:?}, SERR {serr:?}, active {:#x}",
            self.port,
            halted.bits()
        );

        st.active = SlotBitmap::empty();
        st.port_active = false;
        for slot in halted.iter() {
            st.clear_timer(slot);
        }

        let internal = st.internal_slot;
        let timed_out_internal = matches!(
            cause,
            RecoveryCause::Timeout(slot) if st.owners[slot as usize] == Some(Owner::Internal)
        );
        let rec_was_waiting = matches!(st.recovery.stage, Stage::Wait(_));
        if halted.test(internal) && st.owners[internal as usize] == Some(Owner::Internal) {
            halted.clear(internal);
            st.forget_slot(internal);
            st.recovery.internal_failed = true;
            debug!("Port {} internal command failed", self.port);
        }
        st.paused = SlotBitmap::from_bits(st.paused.bits() | halted.bits());

        let d2h = st.mem.received_d2h();
        let isolating = st.recovery.isolating;
        let queued = !SlotBitmap::from_bits(halted.bits() & st.ncq.bits()).is_empty();
        let rec = &mut st.recovery;
        rec.hard_reset |= !stopped || tfd.is_busy();
        match cause {
            RecoveryCause::Timeout(slot) => {
                rec.hard_reset = true;
                if !timed_out_internal {
                    rec.fault = Some(slot);
                    rec.timed_out = true;
                    rec.task_file = (tfd.status(), tfd.ERR());
                }
            }
            RecoveryCause::Fatal(is) => {
                rec.hard_reset |= is.HBF() || is.HBD() || is.IF();
                if !rec_was_waiting && rec.fault.is_none() {
                    rec.task_file = (tfd.status(), tfd.ERR());
                    if halted.count() == 1 && (isolating || !queued) {
                        rec.fault = halted.lowest();
                        rec.fault_lba = d2h.map(|fis| fis.lba);
                    }
                }
            }
        }
        st.recovery.stage = Stage::Restart;
        true
    }

    /// Worker entry: runs queued recovery steps until there is no more
    /// work. Only one thread runs the worker at a time.
    pub(crate) fn run_worker(&self) {
        loop {
            if self.in_worker.swap(true, Ordering::AcqRel) {
                return;
            }
            while self.worker_pending.swap(false, Ordering::AcqRel) {
                self.recovery_step();
            }
            self.in_worker.store(false, Ordering::Release);
            if !self.worker_pending.load(Ordering::Acquire) {
                return;
            }
        }
    }

    fn recovery_step(&self) {
        let stage = self.state.lock().recovery.stage;
        match stage {
            Stage::Idle | Stage::Isolate => {}
            Stage::Restart => self.restart_port(),
            Stage::Wait(cmd) => self.internal_done(cmd),
        }
    }

    fn restart_port(&self) {
        let hard_reset = self.state.lock().recovery.hard_reset || self.io.tfd().is_busy();
        self.io.clear_serr();
        self.io.ack_is(PxI::from_bits(u32::MAX));

        if hard_reset {
            let reset = port::stop_engine::<H>(&self.io, self.port)
                .and_then(|()| port::comreset::<H>(&self.io, self.port))
                .and_then(|()| {
                    port::wait_ready::<H>(&self.io, self.port, self.config.poll_timeout_ms)
                });
            if let Err(err) = reset {
                error!("Port {} reset failed, removing device: {err}", self.port);
                self.remove();
                return;
            }
        }
        port::start_engine(&self.io);

        let paused = {
            let mut st = self.state.lock();
            st.recovery.hard_reset = false;
            st.paused
        };
        self.mark_paused(paused, InternalState::NeedRecovery);
        self.advance_recovery();
    }

    fn decide(&self, class: DeviceClass, st: &PortState) -> Action {
        let rec = &st.recovery;
        let internal_ok = st.mem.slots() > 1 && !rec.internal_failed;
        if let Some(slot) = rec.fault {
            return if rec.timed_out {
                Action::Fail {
                    slot,
                    status: SrbStatus::Timeout,
                    sense: None,
                }
            } else if class == DeviceClass::Atapi && internal_ok {
                Action::Internal(InternalCommand::RequestSense { slot })
            } else {
                Action::Fail {
                    slot,
                    status: SrbStatus::Error,
                    sense: Some(fallback_sense(class, rec.task_file, rec.fault_lba)),
                }
            };
        }
        if st.paused.is_empty() {
            return Action::Resume;
        }
        if rec.isolating {
            return Action::Isolate;
        }
        let queued = !SlotBitmap::from_bits(st.paused.bits() & st.ncq.bits()).is_empty();
        match (queued, rec.log_read) {
            // The device aborted every other queued command.
            (true, true) => Action::Resume,
            (true, false) if internal_ok => Action::Internal(InternalCommand::ReadLog),
            _ => Action::Isolate,
        }
    }

    /// Runs the state machine until it has to wait for hardware.
    fn advance_recovery(&self) {
        loop {
            let class = self.info().class;
            let action = {
                let st = self.state.lock();
                self.decide(class, &st)
            };
            debug!("Port {} recovery: {action:?}", self.port);
            match action {
                Action::Fail {
                    slot,
                    status,
                    sense,
                } => {
                    self.fail_slot(slot, status, sense);
                    let mut st = self.state.lock();
                    st.recovery.fault = None;
                    st.recovery.fault_lba = None;
                    st.recovery.timed_out = false;
                }
                Action::Internal(cmd) => {
                    if self.issue_internal(cmd) {
                        return;
                    }
                    self.state.lock().recovery.internal_failed = true;
                }
                Action::Isolate => {
                    let resumed = {
                        let mut st = self.state.lock();
                        if !st.recovery.isolating {
                            info!(
                                "Port {} isolating {} commands",
                                self.port,
                                st.paused.count()
                            );
                            st.recovery.isolating = true;
                            st.recovery.isolate = st.paused;
                        }
                        st.recovery.stage = Stage::Isolate;
                        self.reissue_paused(&mut st)
                    };
                    if resumed {
                        self.resumed();
                    }
                    return;
                }
                Action::Resume => {
                    {
                        let mut st = self.state.lock();
                        self.reissue_paused(&mut st);
                    }
                    self.resumed();
                    return;
                }
            }
        }
    }

    fn resumed(&self) {
        info!("Port {} resumed", self.port);
        self.thaw(FreezeReason::PAUSED);
        self.schedule();
    }

    /// Reissues halted commands. While isolating, only the next one is
    /// issued; returns `true` once the port runs normally again.
    pub(crate) fn reissue_paused(&self, st: &mut PortState) -> bool {
        if st.recovery.isolating {
            while let Some(slot) = st.recovery.isolate.lowest() {
                st.recovery.isolate.clear(slot);
                if st.paused.test(slot) {
                    st.paused.clear(slot);
                    st.mem.clear_transferred(slot);
                    self.issue(st, slot);
                    return false;
                }
            }
        }

        let paused = st.paused;
        st.paused = SlotBitmap::empty();
        for slot in paused.iter() {
            st.mem.clear_transferred(slot);
            self.issue(st, slot);
        }
        st.recovery = RecoveryState::default();
        st.port_active = true;
        self.issue_prepared(st);
        true
    }

    fn issue_internal(&self, cmd: InternalCommand) -> bool {
        let mut req = self.internal.lock();
        req.reset();
        req.flags = RequestFlags::RECOVERY | RequestFlags::BYPASS_ACTIVE_QUEUE | RequestFlags::DATA_IN;
        req.buffer = DataBuffer::Scratch;
        req.completion = Completion::Internal;
        req.timeout = INTERNAL_TIMEOUT;
        req.scratch.fill(0);

        match cmd {
            InternalCommand::RequestSense { .. } => {
                req.flags |= RequestFlags::PACKET_COMMAND;
                req.data_length = SENSE_BUFFER_SIZE as u32;
                req.cdb[0] = SCSIOP_REQUEST_SENSE;
                req.cdb[4] = SENSE_BUFFER_SIZE as u8;
                let tf = &mut req.task_file;
                tf.command = ATA_CMD_PACKET;
                tf.lba_mid = SENSE_BUFFER_SIZE as u8;
            }
            InternalCommand::ReadLog => {
                req.flags |= RequestFlags::LBA48;
                req.data_length = SCRATCH_SIZE as u32;
                req.task_file.lba48(u64::from(ATA_LOG_NCQ_ERROR), 1);
                req.task_file.command = ATA_CMD_READ_LOG_EXT;
            }
        }

        if let Some((va, len)) = req.data_region() {
            let mut sg = core::mem::take(&mut req.sg);
            let mapped = map_sg::<H>(va, len, AHCI_MAX_BYTES_PER_SG, AHCI_MAX_SG, &mut sg);
            req.sg = sg;
            if mapped.is_err() {
                return false;
            }
        }

        self.state.lock().recovery.stage = Stage::Wait(cmd);
        self.execute_internal(&mut req);
        true
    }

    fn internal_done(&self, cmd: InternalCommand) {
        let (page, len) = {
            let req = self.internal.lock();
            if req.state != InternalState::NotStarted {
                return;
            }
            (req.scratch.clone(), req.data_length as usize)
        };
        let class = self.info().class;

        match cmd {
            InternalCommand::RequestSense { slot } => {
                let task_file = self.state.lock().recovery.task_file;
                let sense = SenseData::parse_fixed(&page[..len])
                    .unwrap_or_else(|| fallback_sense(class, task_file, None));
                self.fail_slot(slot, SrbStatus::Error, Some(sense));
                let mut st = self.state.lock();
                st.recovery.fault = None;
                st.recovery.stage = Stage::Restart;
            }
            InternalCommand::ReadLog => {
                let mut st = self.state.lock();
                st.recovery.stage = Stage::Restart;
                match NcqErrorLog::parse(&page[..]) {
                    Ok(log)
                        if st.paused.test(log.tag)
                            && st.ncq.test(log.tag)
                            && matches!(st.owners[log.tag as usize], Some(Owner::Tag(_))) =>
                    {
                        debug!("Port {} NCQ error log: {log:?}", self.port);
                        st.recovery.fault = Some(log.tag);
                        st.recovery.task_file = (log.status, log.error);
                        st.recovery.fault_lba = Some(log.lba);
                        st.recovery.log_read = true;
                    }
                    result => {
                        warn!("Port {} unusable NCQ error log: {result:?}", self.port);
                        st.recovery.internal_failed = true;
                    }
                }
            }
        }
        self.advance_recovery();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    use crate::ata::{ATA_ERROR_ABRT, ATA_STATUS_DRDY, ATA_STATUS_ERR};
    use crate::scsi::{
        SCSI_ADSENSE_NO_MEDIA_IN_DEVICE, SCSI_SENSE_ABORTED_COMMAND, SCSI_SENSE_MEDIUM_ERROR,
        SCSI_SENSE_NOT_READY, SCSISTAT_CHECK_CONDITION, Srb, SrbFunction,
    };
    use crate::sim::{SimDisk, SimHba, channel, finish, pump, read10};

    #[test]
    fn fallback_sense_for_packet_devices_uses_the_sense_key_nibble() {
        let sense = fallback_sense(DeviceClass::Atapi, (ATA_STATUS_ERR, 0x54), Some(9));
        assert_eq!(sense.key, 0x05);
        assert_eq!(sense.asc, 0);
        assert_eq!(sense.information, None);
    }

    #[test]
    fn fallback_sense_for_disks_translates_the_error_register() {
        let sense = fallback_sense(
            DeviceClass::Ata,
            (ATA_STATUS_DRDY | ATA_STATUS_ERR, ATA_ERROR_UNC),
            Some(0x1234),
        );
        assert_eq!(sense.key, SCSI_SENSE_MEDIUM_ERROR);
        assert_eq!(sense.information, Some(0x1234));
        let sense = fallback_sense(DeviceClass::Ata, (ATA_STATUS_ERR, ATA_ERROR_ABRT), Some(5));
        assert_eq!(sense.key, SCSI_SENSE_ABORTED_COMMAND);
        assert_eq!(sense.information, None);
    }

    #[test]
    fn fresh_state_is_idle() {
        let rec = RecoveryState::default();
        assert!(!rec.in_progress());
        assert!(!rec.isolating());
    }

    fn statuses(irps: &[alloc::sync::Arc<crate::Irp>]) -> Vec<SrbStatus> {
        irps.iter()
            .map(|irp| irp.take_result().expect("request still pending").status)
            .collect()
    }

    #[test]
    fn ncq_error_is_attributed_through_the_error_log() {
        let hba = SimHba::new(32, true);
        hba.attach(0, SimDisk::disk(2048, true));
        let ch = channel(&hba);
        let dev = ch.device(0).unwrap();
        hba.with_disk(0, |d| d.fail_lba = Some(16));
        hba.clear_log(0);

        hba.hold(0);
        let irps: Vec<_> = [0, 8, 16, 24].map(|lba| ch.start_srb(read10(0, lba, 8))).into();
        hba.release(0);
        pump(&ch);

        let failed = irps[2].take_result().unwrap();
        assert_eq!(failed.status, SrbStatus::Error);
        assert_eq!(failed.sense[2], SCSI_SENSE_MEDIUM_ERROR);
        assert_eq!(u32::from_be_bytes(failed.sense[3..7].try_into().unwrap()), 16);
        for irp in [&irps[0], &irps[1], &irps[3]] {
            assert_eq!(irp.take_result().unwrap().status, SrbStatus::Success);
        }
        assert!(hba.commands(0).contains(&ATA_CMD_READ_LOG_EXT));
        assert!(!dev.in_recovery());
        assert!(dev.is_idle());
        assert_eq!(dev.state.lock().allocated(), 0);
    }

    #[test]
    fn unusable_error_log_falls_back_to_isolation() {
        let hba = SimHba::new(32, true);
        hba.attach(0, SimDisk::disk(2048, true));
        let ch = channel(&hba);
        let dev = ch.device(0).unwrap();
        hba.with_disk(0, |d| {
            d.fail_lba = Some(16);
            d.corrupt_log = true;
        });

        hba.hold(0);
        let irps: Vec<_> = [0, 8, 16, 24].map(|lba| ch.start_srb(read10(0, lba, 8))).into();
        hba.release(0);
        pump(&ch);

        assert_eq!(
            statuses(&irps),
            [
                SrbStatus::Success,
                SrbStatus::Success,
                SrbStatus::Error,
                SrbStatus::Success
            ]
        );
        assert!(!dev.in_recovery());
        assert!(dev.is_idle());
        assert_eq!(dev.frozen(), FreezeReason::SRB_ERROR);

        let release = ch.start_srb(Srb::new(SrbFunction::ReleaseQueue));
        finish(&ch, &release);
        assert_eq!(finish(&ch, &ch.start_srb(read10(0, 0, 1))).status, SrbStatus::Success);
    }

    #[test]
    fn timed_out_command_resets_the_port() {
        let hba = SimHba::new(32, true);
        hba.attach(0, SimDisk::disk(2048, false));
        let ch = channel(&hba);
        let dev = ch.device(0).unwrap();
        hba.with_disk(0, |d| d.hang_lba = Some(40));

        let mut srb = read10(0, 40, 1);
        srb.timeout = 2;
        let irp = ch.start_srb(srb);
        pump(&ch);
        assert!(!irp.is_complete());

        for _ in 0..3 {
            ch.io_timer();
            pump(&ch);
        }
        let srb = irp.take_result().unwrap();
        assert_eq!(srb.status, SrbStatus::Timeout);
        assert!(srb.queue_frozen);
        assert!(!dev.in_recovery());

        finish(&ch, &ch.start_srb(Srb::new(SrbFunction::ReleaseQueue)));
        assert_eq!(finish(&ch, &ch.start_srb(read10(0, 0, 1))).status, SrbStatus::Success);
    }

    #[test]
    fn packet_error_is_answered_with_request_sense() {
        let hba = SimHba::new(32, true);
        hba.attach(0, SimDisk::cdrom());
        let ch = channel(&hba);
        hba.with_disk(0, |d| {
            d.packet_error = Some(SCSI_SENSE_NOT_READY);
            d.sense = SenseData::new(SCSI_SENSE_NOT_READY, SCSI_ADSENSE_NO_MEDIA_IN_DEVICE, 0);
        });
        hba.clear_log(0);

        let srb = finish(&ch, &ch.start_srb(Srb::scsi(&[0; 6])));
        assert_eq!(srb.status, SrbStatus::Error);
        assert_eq!(srb.scsi_status, SCSISTAT_CHECK_CONDITION);
        assert!(srb.autosense_valid);
        assert_eq!(srb.sense[2], SCSI_SENSE_NOT_READY);
        assert_eq!(srb.sense[12], SCSI_ADSENSE_NO_MEDIA_IN_DEVICE);

        let log = hba.log(0);
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].packet[0], SCSIOP_REQUEST_SENSE);
        assert!(!ch.device(0).unwrap().in_recovery());
    }

    #[test]
    fn packet_error_without_a_spare_slot_uses_the_error_register() {
        let hba = SimHba::new(1, false);
        hba.attach(0, SimDisk::cdrom());
        let ch = channel(&hba);
        assert_eq!(ch.device(0).unwrap().tag_count(), 1);
        hba.with_disk(0, |d| d.packet_error = Some(SCSI_SENSE_NOT_READY));
        hba.clear_log(0);

        let srb = finish(&ch, &ch.start_srb(Srb::scsi(&[0; 6])));
        assert_eq!(srb.status, SrbStatus::Error);
        assert!(srb.autosense_valid);
        assert_eq!(srb.sense[2], SCSI_SENSE_NOT_READY);
        assert_eq!(srb.sense[12], 0);
        assert_eq!(hba.log(0).len(), 1);
    }

    #[test]
    fn failed_port_reset_removes_the_device() {
        let hba = SimHba::new(32, true);
        hba.attach(0, SimDisk::disk(2048, false));
        let ch = channel(&hba);
        let dev = ch.device(0).unwrap();
        hba.with_disk(0, |d| d.hang_lba = Some(5));

        let mut srb = read10(0, 5, 1);
        srb.timeout = 1;
        let irp = ch.start_srb(srb);
        pump(&ch);
        hba.detach(0);

        ch.io_timer();
        pump(&ch);
        assert_eq!(irp.take_result().unwrap().status, SrbStatus::NoDevice);
        assert!(dev.frozen().contains(FreezeReason::REMOVED));

        let late = ch.start_srb(read10(0, 0, 1));
        assert_eq!(late.take_result().unwrap().status, SrbStatus::NoDevice);
    }
}
