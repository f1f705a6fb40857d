use alloc::{sync::Arc, vec::Vec};
use core::{
    marker::PhantomData,
    sync::atomic::{AtomicBool, Ordering},
};

use log::{debug, error, info, warn};
use spin::{Mutex, RwLock};

use crate::{
    AhciError, Hal,
    device::AtaDevice,
    hal::{PAGE_SIZE, wait_until_timeout},
    mmio::{CAP, CAP2, GHC, HBA_CAP, HBA_CAP2, HBA_GHC, HBA_IS, HBA_PI, HBA_VS, RegisterIo, VS},
    queue::Irp,
    scsi::{Srb, SrbStatus},
    types::AHCI_MAX_SG,
};

/// The HBA has one second to finish GHC.HR.
const HBA_RESET_TIMEOUT_MS: u64 = 1000;

/// Tunables of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Seconds a command may run when the request does not say otherwise.
    pub default_timeout: u32,
    /// Milliseconds a polled command or a busy device is waited for.
    pub poll_timeout_ms: u64,
    /// Use native command queuing where both sides support it.
    pub enable_ncq: bool,
    /// Largest transfer in bytes handed to one command.
    pub max_transfer: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            default_timeout: 10,
            poll_timeout_ms: 5000,
            enable_ncq: true,
            // A buffer that does not start on a page boundary needs one
            // extra entry.
            max_transfer: ((AHCI_MAX_SG - 1) * PAGE_SIZE) as u32,
        }
    }
}

/// One AHCI host bus adapter and the devices found behind it.
pub struct AhciChannel<H> {
    pub(crate) io: Arc<dyn RegisterIo>,
    pub(crate) config: ChannelConfig,
    pub(crate) cap: CAP,
    pub(crate) ports_implemented: u32,
    pub(crate) failed: Arc<AtomicBool>,
    interrupt_lock: Mutex<()>,
    pub(crate) devices: RwLock<Vec<Arc<AtaDevice<H>>>>,
    /// Consecutive scans that found no link, per port.
    pub(crate) misses: Mutex<[u8; 32]>,
    _h: PhantomData<fn() -> H>,
}

impl<H: Hal> AhciChannel<H> {
    /// Takes over the HBA behind `io`: enables AHCI mode, reads the
    /// capabilities and masks the global interrupt until devices are found.
    pub fn new(io: Arc<dyn RegisterIo>, config: ChannelConfig) -> Self {
        io.write32(HBA_GHC, GHC::from_bits(io.read32(HBA_GHC)).with_AE(true).into_bits());

        let cap = CAP::from_bits(io.read32(HBA_CAP));
        let cap2 = CAP2::from_bits(io.read32(HBA_CAP2));
        let vs = VS::from_bits(io.read32(HBA_VS));
        info!("AHCI {vs}, {cap}");
        debug!("{cap2:?}");

        let mut ports_implemented = io.read32(HBA_PI);
        if ports_implemented == 0 {
            // Some firmware leaves PI unset.
            ports_implemented = match cap.NP() {
                31 => u32::MAX,
                np => (1 << (np + 1)) - 1,
            };
            warn!("PI is zero, assuming ports {ports_implemented:#x}");
        }
        io.write32(HBA_GHC, GHC::from_bits(io.read32(HBA_GHC)).with_IE(false).into_bits());

        Self {
            io,
            config,
            cap,
            ports_implemented,
            failed: Arc::new(AtomicBool::new(false)),
            interrupt_lock: Mutex::new(()),
            devices: RwLock::new(Vec::new()),
            misses: Mutex::new([0; 32]),
            _h: PhantomData,
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Bitmap of implemented ports.
    pub fn ports_implemented(&self) -> u32 {
        self.ports_implemented
    }

    /// Command slots per port.
    pub fn command_slots(&self) -> usize {
        self.cap.NCS() as usize + 1
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Resets the HBA with GHC.HR. A controller that does not come back is
    /// marked failed, and every later request completes with `NoDevice`.
    pub fn reset(&self) -> Result<(), AhciError> {
        let ghc = GHC::from_bits(self.io.read32(HBA_GHC));
        self.io.write32(HBA_GHC, ghc.with_HR(true).into_bits());
        let done = wait_until_timeout::<H>(
            || !GHC::from_bits(self.io.read32(HBA_GHC)).HR(),
            HBA_RESET_TIMEOUT_MS,
        );
        if !done {
            error!("HBA reset timeout, channel failed");
            self.failed.store(true, Ordering::Release);
            return Err(AhciError::ResetTimeout);
        }
        self.io.write32(
            HBA_GHC,
            GHC::from_bits(self.io.read32(HBA_GHC)).with_AE(true).into_bits(),
        );
        debug!("HBA reset done");
        Ok(())
    }

    /// Sets or clears GHC.IE.
    pub fn set_interrupts_enabled(&self, enable: bool) {
        let _guard = self.interrupt_lock.lock();
        let ghc = GHC::from_bits(self.io.read32(HBA_GHC));
        self.io.write32(HBA_GHC, ghc.with_IE(enable).into_bits());
    }

    /// Interrupt handler. Returns whether the HBA raised the interrupt.
    pub fn isr(&self) -> bool {
        let is = self.io.read32(HBA_IS) & self.ports_implemented;
        if is == 0 {
            return false;
        }
        for dev in self.devices.read().iter() {
            if is & (1 << dev.port) != 0 {
                dev.isr();
            }
        }
        // Port bits in IS are cleared after the port's own status.
        self.io.write32(HBA_IS, is);
        true
    }

    /// Runs deferred completion processing for every device.
    pub fn run_dpcs(&self) -> bool {
        let mut ran = false;
        for dev in self.snapshot() {
            if dev.dpc_pending() {
                dev.run_dpc();
                ran = true;
            }
        }
        ran
    }

    /// Runs the error recovery worker of every device that has work.
    pub fn run_workers(&self) -> bool {
        let mut ran = false;
        for dev in self.snapshot() {
            if dev.worker_pending.load(Ordering::Acquire) {
                dev.run_worker();
                ran = true;
            }
        }
        ran
    }

    /// Once-per-second tick driving command timeouts.
    pub fn io_timer(&self) {
        for dev in self.snapshot() {
            dev.io_timer();
        }
    }

    pub fn device(&self, port: u8) -> Option<Arc<AtaDevice<H>>> {
        self.devices.read().iter().find(|d| d.port == port).cloned()
    }

    /// Attached devices in port order.
    pub fn devices(&self) -> Vec<Arc<AtaDevice<H>>> {
        self.snapshot()
    }

    fn snapshot(&self) -> Vec<Arc<AtaDevice<H>>> {
        self.devices.read().clone()
    }

    /// Routes an SRB to the device at its target id.
    pub fn start_srb(&self, srb: Srb) -> Arc<Irp> {
        match self.device(srb.target_id) {
            Some(dev) if !self.is_failed() => dev.start_srb(srb),
            _ => {
                let irp = Irp::new(srb);
                if let Some(mut srb) = irp.take_srb() {
                    srb.status = SrbStatus::NoDevice;
                    srb.data_transfer_length = 0;
                    irp.complete(srb);
                }
                irp
            }
        }
    }
}
