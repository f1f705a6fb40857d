#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod ahci;
mod ata;
mod bitmap;
mod device;
mod enumerate;
mod error;
mod hal;
mod mmio;
mod port;
mod queue;
mod recovery;
mod request;
mod satl;
mod scsi;
mod types;

#[cfg(test)]
mod sim;

pub use ahci::{AhciChannel, ChannelConfig};
pub use ata::IdentifyData;
pub use device::{AtaDevice, DeviceClass, DeviceFlags, DeviceInfo};
pub use enumerate::{DeviceTypeStore, MemoryDeviceTypeStore};
pub use error::AhciError;
pub use hal::Hal;
pub use mmio::{MmioRegion, RegisterIo};
pub use queue::{FreezeReason, Irp};
pub use scsi::{SenseData, Srb, SrbFlags, SrbFunction, SrbStatus};
