//! Device discovery on the ports of a channel.

use alloc::sync::Arc;

use log::{debug, info, warn};
use spin::Mutex;

use crate::{
    AhciError, Hal,
    ahci::AhciChannel,
    ata::IdentifyData,
    device::{AtaDevice, DeviceClass, DeviceInfo},
    hal::map_sg,
    mmio::PortIo,
    port::{self, CommandMemory, SATA_SIG_ATAPI},
    request::{AtaDeviceRequest, DataBuffer, RequestFlags, SCRATCH_SIZE},
    types::{AHCI_MAX_BYTES_PER_SG, AHCI_MAX_SG},
};

/// Scans in a row without a link before a device is removed.
const MISSES_BEFORE_REMOVAL: u8 = 2;

/// Remembers the class found on each port, so the next scan issues the
/// right IDENTIFY first.
pub trait DeviceTypeStore: Send + Sync {
    fn load(&self, port: u8) -> Option<DeviceClass>;
    fn store(&self, port: u8, class: DeviceClass);
}

#[derive(Default)]
pub struct MemoryDeviceTypeStore {
    classes: Mutex<[Option<DeviceClass>; 32]>,
}

impl DeviceTypeStore for MemoryDeviceTypeStore {
    fn load(&self, port: u8) -> Option<DeviceClass> {
        self.classes.lock().get(port as usize).copied().flatten()
    }

    fn store(&self, port: u8, class: DeviceClass) {
        if let Some(entry) = self.classes.lock().get_mut(port as usize) {
            *entry = Some(class);
        }
    }
}

impl<H: Hal> AhciChannel<H> {
    /// Looks for new devices and drops the ones whose link is gone.
    /// Returns the number of attached devices.
    pub fn scan_bus(&self, store: &dyn DeviceTypeStore) -> Result<usize, AhciError> {
        if self.is_failed() {
            return Err(AhciError::ChannelFailed);
        }

        for port in (0..32u8).filter(|p| self.ports_implemented & (1 << p) != 0) {
            if let Some(dev) = self.device(port) {
                self.check_present(&dev);
                continue;
            }
            match self.probe_port(port, store) {
                Ok(dev) => {
                    let dev = Arc::new(dev);
                    {
                        let mut devices = self.devices.write();
                        let pos = devices.partition_point(|d| d.port < port);
                        devices.insert(pos, dev.clone());
                    }
                    self.misses.lock()[port as usize] = 0;
                    dev.start();
                }
                Err(AhciError::NoDevice(_)) => debug!("Port {port} empty"),
                Err(err) => warn!("Port {port} probe failed: {err}"),
            }
        }

        let count = self.devices.read().len();
        if count > 0 {
            self.set_interrupts_enabled(true);
        }
        Ok(count)
    }

    fn check_present(&self, dev: &Arc<AtaDevice<H>>) {
        let port = dev.port;
        let gone = {
            let mut misses = self.misses.lock();
            let miss = &mut misses[port as usize];
            if dev.link_present() {
                *miss = 0;
                false
            } else {
                *miss += 1;
                debug!("Port {port} link missing ({miss})");
                *miss >= MISSES_BEFORE_REMOVAL
            }
        };
        if gone {
            self.devices.write().retain(|d| d.port != port);
            self.misses.lock()[port as usize] = 0;
            dev.remove();
        }
    }

    fn probe_port(&self, port: u8, store: &dyn DeviceTypeStore) -> Result<AtaDevice<H>, AhciError> {
        let io = PortIo::new(self.io.clone(), port);
        let mem = CommandMemory::new(self.command_slots())?;
        let sig = port::bring_up::<H>(&io, &mem, port, self.cap.SSS(), self.config.poll_timeout_ms)?;
        debug!("Port {port} signature {sig:#010x}");

        let hint = if sig == SATA_SIG_ATAPI {
            DeviceClass::Atapi
        } else {
            DeviceClass::Ata
        };
        let first = store.load(port).unwrap_or(hint);
        let (class, id) = match self.identify(&io, &mem, port, first) {
            Ok(id) => (first, id),
            Err(AhciError::TaskFile { .. }) => {
                debug!("Port {port} is not {first:?}");
                let other = first.other();
                (other, self.identify(&io, &mem, port, other)?)
            }
            Err(err) => return Err(err),
        };
        store.store(port, class);

        let info = DeviceInfo::from_identify(class, &id, self.config.enable_ncq && self.cap.SNCQ());
        info!(
            "Port {port}: {class:?} {} (SN {}, FW {}), {} sectors of {} bytes, {:?}",
            id.model(),
            id.serial(),
            id.firmware(),
            info.total_sectors,
            info.sector_size,
            info.flags
        );
        Ok(AtaDevice::new(port, io, mem, info, self.config, self.failed.clone()))
    }

    /// Polled IDENTIFY (PACKET) DEVICE in slot 0.
    fn identify(
        &self,
        io: &PortIo,
        mem: &CommandMemory,
        port: u8,
        class: DeviceClass,
    ) -> Result<IdentifyData, AhciError> {
        let mut req = AtaDeviceRequest::new(0);
        req.flags = RequestFlags::DATA_IN;
        req.buffer = DataBuffer::Scratch;
        req.data_length = SCRATCH_SIZE as u32;
        req.task_file.command = class.identify_command();

        if let Some((va, len)) = req.data_region() {
            let mut sg = core::mem::take(&mut req.sg);
            map_sg::<H>(va, len, AHCI_MAX_BYTES_PER_SG, AHCI_MAX_SG, &mut sg)?;
            req.sg = sg;
        }
        port::exec_polled::<H>(io, mem, port, 0, &req, self.config.poll_timeout_ms)?;
        Ok(IdentifyData::from_bytes(&req.scratch[..]))
    }
}
