#![allow(non_snake_case, clippy::upper_case_acronyms)]

use alloc::sync::Arc;
use core::{fmt, mem::offset_of, ptr::NonNull};

use bitfield_struct::bitfield;
use volatile::VolatilePtr;

/// 32-bit access to the HBA register window (ABAR).
///
/// Offsets are byte offsets from the start of the window. Implementations
/// must preserve the side effects the AHCI register model attaches to a
/// write (write-1-to-clear status registers, write-1-to-set issue
/// registers), which is why the driver never caches register values.
pub trait RegisterIo: Send + Sync {
    fn read32(&self, offset: usize) -> u32;
    fn write32(&self, offset: usize, value: u32);
}

/// Register window of a real controller, accessed with volatile loads and
/// stores.
pub struct MmioRegion {
    base: VolatilePtr<'static, AhciMmio>,
}

// SAFETY: the window is device memory; every access is a single aligned
// volatile load or store, ordering between CPUs is provided by the locks
// the driver holds around register sequences.
unsafe impl Send for MmioRegion {}
unsafe impl Sync for MmioRegion {}

impl MmioRegion {
    /// # Safety
    ///
    /// `base` must be the virtual address of a mapped ABAR window that stays
    /// mapped for the rest of the program.
    pub unsafe fn new(base: usize) -> Option<Self> {
        let base = NonNull::new(base as *mut AhciMmio)?;
        Some(Self {
            base: unsafe { VolatilePtr::new(base) },
        })
    }

    fn reg(&self, offset: usize) -> VolatilePtr<'static, u32> {
        debug_assert!(offset % 4 == 0 && offset < size_of::<AhciMmio>());
        let raw = self
            .base
            .as_raw_ptr()
            .as_ptr()
            .cast::<u8>()
            .wrapping_add(offset)
            .cast::<u32>();
        // SAFETY: offset lies inside the window the constructor was given.
        unsafe { VolatilePtr::new(NonNull::new_unchecked(raw)) }
    }
}

impl RegisterIo for MmioRegion {
    fn read32(&self, offset: usize) -> u32 {
        self.reg(offset).read()
    }

    fn write32(&self, offset: usize, value: u32) {
        self.reg(offset).write(value)
    }
}

#[repr(C)]
pub struct AhciMmio {
    pub host: GenericHostControl,
    _res: [u8; 0xd4],
    pub ports: [PortRegisters; 32],
}

const _: () = assert!(offset_of!(AhciMmio, ports) == 0x100);

#[repr(C)]
pub struct GenericHostControl {
    pub cap: CAP,
    pub ghc: GHC,
    /// One bit per port with an interrupt pending.
    pub is: u32,
    pub pi: u32,
    pub vs: VS,
    pub ccc_ctl: u32,
    pub ccc_ports: u32,
    pub em_loc: u32,
    pub em_ctl: u32,
    pub cap2: CAP2,
    pub bohc: u32,
}

#[repr(C)]
pub struct PortRegisters {
    pub CLB: u32,
    pub CLBU: u32,
    pub FB: u32,
    pub FBU: u32,
    pub IS: PxI,
    pub IE: PxI,
    pub CMD: PxCMD,
    _res0: u32,
    pub TFD: PxTFD,
    pub SIG: PxSIG,
    pub SSTS: PxSSTS,
    pub SCTL: PxSCTL,
    pub SERR: PxSERR,
    pub SACT: u32,
    pub CI: u32,
    pub SNTF: u32,
    pub FBS: u32,
    pub DEVSLP: u32,
    _res1: [u32; 10],
    pub VS: [u32; 4],
}

const _: () = assert!(size_of::<PortRegisters>() == 0x80);

pub(crate) const HBA_CAP: usize = offset_of!(GenericHostControl, cap);
pub(crate) const HBA_GHC: usize = offset_of!(GenericHostControl, ghc);
pub(crate) const HBA_IS: usize = offset_of!(GenericHostControl, is);
pub(crate) const HBA_PI: usize = offset_of!(GenericHostControl, pi);
pub(crate) const HBA_VS: usize = offset_of!(GenericHostControl, vs);
pub(crate) const HBA_CAP2: usize = offset_of!(GenericHostControl, cap2);

pub(crate) const PX_CLB: usize = offset_of!(PortRegisters, CLB);
pub(crate) const PX_CLBU: usize = offset_of!(PortRegisters, CLBU);
pub(crate) const PX_FB: usize = offset_of!(PortRegisters, FB);
pub(crate) const PX_FBU: usize = offset_of!(PortRegisters, FBU);
pub(crate) const PX_IS: usize = offset_of!(PortRegisters, IS);
pub(crate) const PX_IE: usize = offset_of!(PortRegisters, IE);
pub(crate) const PX_CMD: usize = offset_of!(PortRegisters, CMD);
pub(crate) const PX_TFD: usize = offset_of!(PortRegisters, TFD);
pub(crate) const PX_SIG: usize = offset_of!(PortRegisters, SIG);
pub(crate) const PX_SSTS: usize = offset_of!(PortRegisters, SSTS);
pub(crate) const PX_SCTL: usize = offset_of!(PortRegisters, SCTL);
pub(crate) const PX_SERR: usize = offset_of!(PortRegisters, SERR);
pub(crate) const PX_SACT: usize = offset_of!(PortRegisters, SACT);
pub(crate) const PX_CI: usize = offset_of!(PortRegisters, CI);

pub(crate) const fn port_base(port: u8) -> usize {
    offset_of!(AhciMmio, ports) + port as usize * size_of::<PortRegisters>()
}

/// Typed view of one port's registers.
#[derive(Clone)]
pub(crate) struct PortIo {
    io: Arc<dyn RegisterIo>,
    base: usize,
}

impl PortIo {
    pub(crate) fn new(io: Arc<dyn RegisterIo>, port: u8) -> Self {
        Self {
            io,
            base: port_base(port),
        }
    }

    fn read(&self, reg: usize) -> u32 {
        self.io.read32(self.base + reg)
    }

    fn write(&self, reg: usize, value: u32) {
        self.io.write32(self.base + reg, value)
    }

    pub(crate) fn is(&self) -> PxI {
        PxI::from_bits(self.read(PX_IS))
    }

    /// Clears the given interrupt status bits (write-1-to-clear).
    pub(crate) fn ack_is(&self, bits: PxI) {
        self.write(PX_IS, bits.into_bits())
    }

    pub(crate) fn set_ie(&self, ie: PxI) {
        self.write(PX_IE, ie.into_bits())
    }

    pub(crate) fn cmd(&self) -> PxCMD {
        PxCMD::from_bits(self.read(PX_CMD))
    }

    pub(crate) fn set_cmd(&self, cmd: PxCMD) {
        self.write(PX_CMD, cmd.into_bits())
    }

    pub(crate) fn update_cmd(&self, f: impl FnOnce(PxCMD) -> PxCMD) {
        self.set_cmd(f(self.cmd()))
    }

    pub(crate) fn tfd(&self) -> PxTFD {
        PxTFD::from_bits(self.read(PX_TFD))
    }

    pub(crate) fn sig(&self) -> PxSIG {
        PxSIG::from_bits(self.read(PX_SIG))
    }

    pub(crate) fn ssts(&self) -> PxSSTS {
        PxSSTS::from_bits(self.read(PX_SSTS))
    }

    pub(crate) fn sctl(&self) -> PxSCTL {
        PxSCTL::from_bits(self.read(PX_SCTL))
    }

    pub(crate) fn set_sctl(&self, sctl: PxSCTL) {
        self.write(PX_SCTL, sctl.into_bits())
    }

    /// Reads SError and clears every bit that was set.
    pub(crate) fn clear_serr(&self) -> PxSERR {
        let serr = self.read(PX_SERR);
        self.write(PX_SERR, serr);
        PxSERR::from_bits(serr)
    }

    pub(crate) fn sact(&self) -> u32 {
        self.read(PX_SACT)
    }

    pub(crate) fn set_sact(&self, bits: u32) {
        self.write(PX_SACT, bits)
    }

    pub(crate) fn ci(&self) -> u32 {
        self.read(PX_CI)
    }

    pub(crate) fn set_ci(&self, bits: u32) {
        self.write(PX_CI, bits)
    }

    pub(crate) fn set_clb(&self, addr: u64) {
        self.write(PX_CLB, addr as u32);
        self.write(PX_CLBU, (addr >> 32) as u32);
    }

    pub(crate) fn set_fb(&self, addr: u64) {
        self.write(PX_FB, addr as u32);
        self.write(PX_FBU, (addr >> 32) as u32);
    }
}

/// CAP – HBA Capabilities
#[bitfield(u32, order = Msb)]
pub struct CAP {
    /// 64-bit addressing.
    pub S64A: bool,
    /// Native command queuing.
    pub SNCQ: bool,
    pub SSNTF: bool,
    pub SMPS: bool,
    /// Staggered spin-up: software must set PxCMD.SUD per port.
    pub SSS: bool,
    pub SALP: bool,
    pub SAL: bool,
    /// Command list override (PxCMD.CLO).
    pub SCLO: bool,
    #[bits(4)]
    pub ISS: ISS,
    pub __: bool,
    pub SAM: bool,
    pub SPM: bool,
    pub FBSS: bool,
    pub PMD: bool,
    pub SSC: bool,
    pub PSC: bool,
    /// Command slots per port, 0's based.
    #[bits(5)]
    pub NCS: u8,
    pub CCCS: bool,
    pub EMS: bool,
    pub SXS: bool,
    /// Ports supported by the silicon, 0's based.
    #[bits(5)]
    pub NP: u8,
}

/// Interface speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ISS {
    Reserved = 0,
    Gen1     = 1,
    Gen2     = 2,
    Gen3     = 3,
}

impl ISS {
    pub const fn into_bits(self) -> u8 {
        self as _
    }

    pub const fn from_bits(bits: u8) -> Self {
        match bits {
            1 => ISS::Gen1,
            2 => ISS::Gen2,
            3 => ISS::Gen3,
            _ => ISS::Reserved,
        }
    }
}

impl fmt::Display for ISS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ISS::Reserved => write!(f, "unknown speed"),
            ISS::Gen1 => write!(f, "1.5 Gbps"),
            ISS::Gen2 => write!(f, "3 Gbps"),
            ISS::Gen3 => write!(f, "6 Gbps"),
        }
    }
}

impl fmt::Display for CAP {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let features = [
            (self.S64A(), "64bit"),
            (self.SNCQ(), "ncq"),
            (self.SSS(), "stag"),
            (self.SCLO(), "clo"),
            (self.SAM(), "only"),
            (self.SPM(), "pmp"),
            (self.FBSS(), "fbs"),
            (self.PMD(), "pio"),
            (self.SSC(), "slum"),
            (self.PSC(), "part"),
            (self.CCCS(), "ccc"),
            (self.EMS(), "ems"),
        ];
        for (_, name) in features.iter().filter(|(on, _)| *on) {
            write!(f, "{name} ")?;
        }
        write!(
            f,
            "{}, {} slots, {} ports",
            self.ISS(),
            self.NCS() + 1,
            self.NP() + 1
        )
    }
}

/// GHC – Global HBA Control
#[bitfield(u32, order = Msb)]
pub struct GHC {
    /// AHCI enable; must be set before any other register is touched.
    pub AE: bool,
    #[bits(28)]
    __: u32,
    pub MRSM: bool,
    /// Global interrupt enable.
    pub IE: bool,
    /// HBA reset, self-clearing.
    pub HR: bool,
}

/// VS – AHCI Version, BCD encoded.
#[bitfield(u32, order = Msb)]
pub struct VS {
    major_h: u8,
    major_l: u8,
    minor_h: u8,
    minor_l: u8,
}

impl fmt::Display for VS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let major = self.major_h() * 0x10 + self.major_l();
        let minor = self.minor_h() * 0x10 + self.minor_l();
        write!(f, "{major:x}.{minor:x}")
    }
}

/// CAP2 – HBA Capabilities Extended
#[bitfield(u32, order = Msb)]
pub struct CAP2 {
    #[bits(26)]
    __: u32,
    pub DESO: bool,
    pub SADM: bool,
    pub SDS: bool,
    pub APST: bool,
    pub NVMP: bool,
    /// BIOS/OS handoff.
    pub BOH: bool,
}

/// PxIS / PxIE layout.
#[bitfield(u32, order = Msb)]
pub struct PxI {
    /// Cold port detect.
    pub CPD: bool,
    /// Task file error.
    pub TFE: bool,
    /// Host bus fatal error.
    pub HBF: bool,
    /// Host bus data error.
    pub HBD: bool,
    /// Interface fatal error.
    pub IF: bool,
    /// Interface non-fatal error.
    pub INF: bool,
    __: bool,
    /// Overflow.
    pub OF: bool,
    pub IPM: bool,
    /// PhyRdy change.
    pub PRC: bool,
    #[bits(14)]
    __: u16,
    pub DMP: bool,
    /// Port connect change.
    pub PC: bool,
    /// Descriptor processed.
    pub DP: bool,
    /// Unknown FIS.
    pub UF: bool,
    /// Set Device Bits FIS received (NCQ completion).
    pub SDB: bool,
    /// DMA Setup FIS received.
    pub DS: bool,
    /// PIO Setup FIS received.
    pub PS: bool,
    /// D2H Register FIS received.
    pub DHR: bool,
}

impl PxI {
    pub fn default_enable() -> Self {
        Self::new()
            .with_TFE(true)
            .with_HBF(true)
            .with_HBD(true)
            .with_IF(true)
            .with_INF(true)
            .with_OF(true)
            .with_PRC(true)
            .with_PC(true)
            .with_UF(true)
            .with_SDB(true)
            .with_DS(true)
            .with_PS(true)
            .with_DHR(true)
    }

    /// Conditions after which the command engine must be restarted.
    pub fn fatal() -> Self {
        Self::new()
            .with_TFE(true)
            .with_HBF(true)
            .with_HBD(true)
            .with_IF(true)
            .with_OF(true)
    }

    pub fn is_fatal(&self) -> bool {
        self.into_bits() & Self::fatal().into_bits() != 0
    }

    pub fn is_hotplug(&self) -> bool {
        self.PRC() || self.PC() || self.CPD()
    }
}

#[bitfield(u32, order = Msb)]
pub struct PxCMD {
    #[bits(4)]
    pub ICC: ICC,
    pub ASP: bool,
    pub ALPE: bool,
    pub DLAE: bool,
    pub ATAPI: bool,
    pub APSTE: bool,
    #[bits(access = RO)]
    pub FBSCP: bool,
    #[bits(access = RO)]
    pub ESP: bool,
    #[bits(access = RO)]
    pub CPD: bool,
    #[bits(access = RO)]
    pub MPSP: bool,
    #[bits(access = RO)]
    pub HPCP: bool,
    pub PMA: bool,
    #[bits(access = RO)]
    pub CPS: bool,
    /// Command list running.
    pub CR: bool,
    /// FIS receive running.
    pub FR: bool,
    #[bits(access = RO)]
    pub MPSS: bool,
    #[bits(5, access = RO)]
    pub CCS: u8,
    #[bits(3)]
    pub __: u8,
    /// FIS receive enable.
    pub FRE: bool,
    /// Command list override.
    pub CLO: bool,
    pub POD: bool,
    pub SUD: bool,
    /// Start; clearing it also clears PxCI and PxSACT.
    pub ST: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ICC {
    #[default]
    Idle     = 0x0,
    Active   = 0x1,
    Partial  = 0x2,
    Slumber  = 0x6,
    DevSleep = 0x8,
    Reserved = 0xf,
}

impl ICC {
    pub const fn into_bits(self) -> u8 {
        self as _
    }

    pub const fn from_bits(bits: u8) -> Self {
        match bits {
            0x0 => Self::Idle,
            0x1 => Self::Active,
            0x2 => Self::Partial,
            0x6 => Self::Slumber,
            0x8 => Self::DevSleep,
            _ => Self::Reserved,
        }
    }
}

/// PxTFD – status and error registers of the last D2H FIS.
#[bitfield(u32, order = Msb)]
pub struct PxTFD {
    __: u16,
    pub ERR: u8,
    pub STS_BSY: bool,
    #[bits(3)]
    __: u8,
    pub STS_DRQ: bool,
    #[bits(2)]
    __: u8,
    pub STS_ERR: bool,
}

impl PxTFD {
    pub fn status(&self) -> u8 {
        self.into_bits() as u8
    }

    pub fn is_busy(&self) -> bool {
        self.STS_BSY() || self.STS_DRQ()
    }
}

#[bitfield(u32, order = Msb)]
pub struct PxSIG {
    pub high: u8,
    pub mid: u8,
    pub low: u8,
    pub count: u8,
}

#[bitfield(u32, order = Msb)]
pub struct PxSSTS {
    #[bits(20)]
    __: u32,
    #[bits(4)]
    pub IPM: u8,
    #[bits(4)]
    pub SPD: u8,
    /// 0: nothing, 1: device without phy, 3: device and phy.
    #[bits(4)]
    pub DET: u8,
}

#[bitfield(u32, order = Msb)]
pub struct PxSCTL {
    #[bits(20)]
    __: u32,
    #[bits(4)]
    pub IPM: u8,
    #[bits(4)]
    pub SPD: u8,
    /// Writing 1 performs COMRESET until written back to 0.
    #[bits(4)]
    pub DET: u8,
}

#[bitfield(u32, order = Msb)]
pub struct PxSERR {
    #[bits(5)]
    __: u8,
    pub DIAG_X: bool,
    pub DIAG_F: bool,
    pub DIAG_T: bool,
    pub DIAG_S: bool,
    pub DIAG_H: bool,
    pub DIAG_C: bool,
    pub DIAG_D: bool,
    pub DIAG_B: bool,
    pub DIAG_W: bool,
    pub DIAG_I: bool,
    pub DIAG_N: bool,
    #[bits(4)]
    __: u8,
    pub ERR_E: bool,
    pub ERR_P: bool,
    pub ERR_C: bool,
    pub ERR_T: bool,
    #[bits(6)]
    __: u8,
    pub ERR_M: bool,
    pub ERR_I: bool,
}
