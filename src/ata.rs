use alloc::string::String;

pub const SATA_FIS_TYPE_REGISTER_H2D: u8 = 0x27;
pub const SATA_FIS_TYPE_REGISTER_D2H: u8 = 0x34;
/// Command bit in byte 1 of a H2D FIS.
pub const SATA_FIS_H2D_C: u8 = 0x80;

pub const ATA_CMD_READ: u8 = 0x20;
pub const ATA_CMD_READ_EXT: u8 = 0x24;
pub const ATA_CMD_READ_DMA_EXT: u8 = 0x25;
pub const ATA_CMD_READ_LOG_EXT: u8 = 0x2f;
pub const ATA_CMD_READ_MULTIPLE_EXT: u8 = 0x29;
pub const ATA_CMD_WRITE: u8 = 0x30;
pub const ATA_CMD_WRITE_EXT: u8 = 0x34;
pub const ATA_CMD_WRITE_DMA_EXT: u8 = 0x35;
pub const ATA_CMD_WRITE_MULTIPLE_EXT: u8 = 0x39;
pub const ATA_CMD_WRITE_DMA_FUA_EXT: u8 = 0x3d;
pub const ATA_CMD_VERIFY: u8 = 0x40;
pub const ATA_CMD_VERIFY_EXT: u8 = 0x42;
pub const ATA_CMD_FPDMA_READ: u8 = 0x60;
pub const ATA_CMD_FPDMA_WRITE: u8 = 0x61;
pub const ATA_CMD_PACKET: u8 = 0xa0;
pub const ATA_CMD_ID_ATAPI: u8 = 0xa1;
pub const ATA_CMD_READ_MULTIPLE: u8 = 0xc4;
pub const ATA_CMD_WRITE_MULTIPLE: u8 = 0xc5;
pub const ATA_CMD_SET_MULTIPLE: u8 = 0xc6;
pub const ATA_CMD_READ_DMA: u8 = 0xc8;
pub const ATA_CMD_WRITE_DMA: u8 = 0xca;
pub const ATA_CMD_WRITE_MULTIPLE_FUA_EXT: u8 = 0xce;
pub const ATA_CMD_STANDBY_IMMEDIATE: u8 = 0xe0;
pub const ATA_CMD_IDLE_IMMEDIATE: u8 = 0xe1;
pub const ATA_CMD_FLUSH: u8 = 0xe7;
pub const ATA_CMD_FLUSH_EXT: u8 = 0xea;
pub const ATA_CMD_ID_ATA: u8 = 0xec;
pub const ATA_CMD_SET_FEATURES: u8 = 0xef;

pub const SETFEATURES_WC_ON: u8 = 0x02;
pub const SETFEATURES_WC_OFF: u8 = 0x82;

pub const ATA_LOG_NCQ_ERROR: u8 = 0x10;

pub const ATA_DEVICE_LBA: u8 = 1 << 6;
/// Legacy bits that must read as one in CHS/LBA28 device registers.
pub const ATA_DEVICE_OBS: u8 = 0xa0;
pub const ATA_DEVICE_FUA: u8 = 1 << 7;

pub const ATA_FEATURE_DMA: u8 = 1 << 0;
pub const ATA_FEATURE_DMADIR: u8 = 1 << 2;

pub const ATA_STATUS_ERR: u8 = 1 << 0;
pub const ATA_STATUS_DF: u8 = 1 << 5;
#[cfg(test)]
pub const ATA_STATUS_DRDY: u8 = 1 << 6;
pub const ATA_STATUS_BSY: u8 = 1 << 7;

pub const ATA_ERROR_NM: u8 = 1 << 1;
pub const ATA_ERROR_ABRT: u8 = 1 << 2;
pub const ATA_ERROR_MCR: u8 = 1 << 3;
pub const ATA_ERROR_IDNF: u8 = 1 << 4;
pub const ATA_ERROR_MC: u8 = 1 << 5;
pub const ATA_ERROR_UNC: u8 = 1 << 6;
pub const ATA_ERROR_ICRC: u8 = 1 << 7;

pub const ATA_SECTOR_SIZE: u32 = 512;
pub const ATA_ID_WORDS: usize = 256;

pub const ATA_ID_CONFIG: usize = 0;
pub const ATA_ID_CYLS: usize = 1;
pub const ATA_ID_HEADS: usize = 3;
pub const ATA_ID_SECTORS: usize = 6;
pub const ATA_ID_SERNO: usize = 10;
pub const ATA_ID_FW_REV: usize = 23;
pub const ATA_ID_PROD: usize = 27;
pub const ATA_ID_MAX_MULTSECT: usize = 47;
pub const ATA_ID_CAPABILITY: usize = 49;
pub const ATA_ID_MULTSECT: usize = 59;
pub const ATA_ID_LBA_CAPACITY: usize = 60;
pub const ATA_ID_DMADIR: usize = 62;
pub const ATA_ID_QUEUE_DEPTH: usize = 75;
pub const ATA_ID_SATA_CAPABILITY: usize = 76;
pub const ATA_ID_COMMAND_SET_2: usize = 83;
pub const ATA_ID_CFSSE: usize = 84;
pub const ATA_ID_CFS_ENABLE_1: usize = 85;
pub const ATA_ID_CFS_ENABLE_2: usize = 86;
pub const ATA_ID_LBA_CAPACITY_2: usize = 100;
pub const ATA_ID_SECTOR_SIZE: usize = 106;
pub const ATA_ID_LOGICAL_SECTOR_SIZE: usize = 117;
pub const ATA_ID_ROT_SPEED: usize = 217;

pub const ATA_ID_SERNO_LEN: usize = 20;
pub const ATA_ID_FW_REV_LEN: usize = 8;
pub const ATA_ID_PROD_LEN: usize = 40;

/// Largest sector count one LBA28 command can carry (encoded as 0).
pub const ATA_MAX_LBA28_SECTORS: u32 = 256;
pub const ATA_MAX_LBA48_SECTORS: u32 = 65536;
pub const ATA_LBA28_LIMIT: u64 = 1 << 28;

/// Extracts an IDENTIFY string; the device stores it as big-endian words.
pub fn ata_id_to_string(id: &[u16], offset: usize, len: usize) -> String {
    let mut out = String::with_capacity(len);
    for word in &id[offset..offset + len / 2] {
        for byte in word.to_be_bytes() {
            out.push(if byte.is_ascii_graphic() || byte == b' ' {
                byte as char
            } else {
                ' '
            });
        }
    }
    String::from(out.trim())
}

/// Parsed IDENTIFY (PACKET) DEVICE data.
#[derive(Clone)]
pub struct IdentifyData {
    words: [u16; ATA_ID_WORDS],
}

impl core::fmt::Debug for IdentifyData {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IdentifyData")
            .field("model", &self.model())
            .field("sectors", &self.user_addressable_sectors())
            .finish()
    }
}

impl Default for IdentifyData {
    fn default() -> Self {
        Self {
            words: [0; ATA_ID_WORDS],
        }
    }
}

impl IdentifyData {
    pub fn from_bytes(raw: &[u8]) -> Self {
        let mut words = [0u16; ATA_ID_WORDS];
        for (word, chunk) in words.iter_mut().zip(raw.chunks_exact(2)) {
            *word = u16::from_le_bytes([chunk[0], chunk[1]]);
        }
        Self { words }
    }

    pub fn words(&self) -> &[u16; ATA_ID_WORDS] {
        &self.words
    }

    fn bit(&self, word: usize, bit: u32) -> bool {
        self.words[word] & (1 << bit) != 0
    }

    fn dword(&self, word: usize) -> u32 {
        self.words[word] as u32 | (self.words[word + 1] as u32) << 16
    }

    pub fn model(&self) -> String {
        ata_id_to_string(&self.words, ATA_ID_PROD, ATA_ID_PROD_LEN)
    }

    pub fn serial(&self) -> String {
        ata_id_to_string(&self.words, ATA_ID_SERNO, ATA_ID_SERNO_LEN)
    }

    pub fn firmware(&self) -> String {
        ata_id_to_string(&self.words, ATA_ID_FW_REV, ATA_ID_FW_REV_LEN)
    }

    pub fn is_atapi(&self) -> bool {
        self.words[ATA_ID_CONFIG] & 0xc000 == 0x8000
    }

    pub fn is_removable(&self) -> bool {
        self.bit(ATA_ID_CONFIG, 7)
    }

    /// ATAPI peripheral device type (5 for CD/DVD).
    pub fn atapi_device_type(&self) -> u8 {
        ((self.words[ATA_ID_CONFIG] >> 8) & 0x1f) as u8
    }

    pub fn cdb_size(&self) -> usize {
        if self.words[ATA_ID_CONFIG] & 0x3 == 1 {
            16
        } else {
            12
        }
    }

    pub fn atapi_dmadir(&self) -> bool {
        self.bit(ATA_ID_DMADIR, 15)
    }

    pub fn has_lba(&self) -> bool {
        self.bit(ATA_ID_CAPABILITY, 9)
    }

    pub fn has_dma(&self) -> bool {
        self.bit(ATA_ID_CAPABILITY, 8)
    }

    pub fn has_lba48(&self) -> bool {
        self.bit(ATA_ID_COMMAND_SET_2, 10) && self.bit(ATA_ID_CFS_ENABLE_2, 10)
    }

    pub fn has_fua(&self) -> bool {
        self.has_lba48() && self.bit(ATA_ID_CFSSE, 6)
    }

    pub fn has_ncq(&self) -> bool {
        let w = self.words[ATA_ID_SATA_CAPABILITY];
        w != 0 && w != 0xffff && w & (1 << 8) != 0
    }

    pub fn queue_depth(&self) -> u8 {
        (self.words[ATA_ID_QUEUE_DEPTH] & 0x1f) as u8 + 1
    }

    pub fn write_cache_enabled(&self) -> bool {
        self.bit(ATA_ID_CFS_ENABLE_1, 5)
    }

    /// Sectors per DRQ block for READ/WRITE MULTIPLE, 0 when not configured.
    pub fn multiple_sectors(&self) -> u8 {
        let current = self.words[ATA_ID_MULTSECT];
        if current & (1 << 8) != 0 {
            current as u8
        } else {
            0
        }
    }

    pub fn max_multiple_sectors(&self) -> u8 {
        self.words[ATA_ID_MAX_MULTSECT] as u8
    }

    pub fn cylinders(&self) -> u16 {
        self.words[ATA_ID_CYLS]
    }

    pub fn heads(&self) -> u16 {
        self.words[ATA_ID_HEADS]
    }

    pub fn sectors_per_track(&self) -> u16 {
        self.words[ATA_ID_SECTORS]
    }

    pub fn user_addressable_sectors(&self) -> u64 {
        if self.has_lba48() {
            let sectors = self.dword(ATA_ID_LBA_CAPACITY_2) as u64
                | (self.dword(ATA_ID_LBA_CAPACITY_2 + 2) as u64) << 32;
            if sectors != 0 {
                return sectors;
            }
        }
        if self.has_lba() {
            return self.dword(ATA_ID_LBA_CAPACITY) as u64;
        }
        self.cylinders() as u64 * self.heads() as u64 * self.sectors_per_track() as u64
    }

    pub fn sector_size(&self) -> u32 {
        let info = self.words[ATA_ID_SECTOR_SIZE];
        // Word 106 is valid when bit 14 is set and bit 15 clear.
        if info & 0xc000 == 0x4000 && info & (1 << 12) != 0 {
            let words = self.dword(ATA_ID_LOGICAL_SECTOR_SIZE);
            if words >= 256 {
                return words * 2;
            }
        }
        ATA_SECTOR_SIZE
    }

    /// log2 of logical sectors per physical sector.
    pub fn physical_sector_exponent(&self) -> u8 {
        let info = self.words[ATA_ID_SECTOR_SIZE];
        if info & 0xc000 == 0x4000 && info & (1 << 13) != 0 {
            (info & 0xf) as u8
        } else {
            0
        }
    }

    pub fn rotation_rate(&self) -> u16 {
        self.words[ATA_ID_ROT_SPEED]
    }
}

/// Why an NCQ command error log page cannot be used to name a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NcqLogError {
    /// Bytes of the page do not sum to zero.
    Checksum,
    /// The error was not caused by a queued command.
    NotQueued,
    /// The device reports the log contents as unknown.
    Unloaded,
}

/// NCQ Command Error log (page 10h).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NcqErrorLog {
    pub tag: u8,
    pub status: u8,
    pub error: u8,
    pub lba: u64,
}

impl NcqErrorLog {
    pub fn parse(page: &[u8]) -> Result<Self, NcqLogError> {
        let sum = page[..512].iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        if sum != 0 {
            return Err(NcqLogError::Checksum);
        }
        if page[0] & 0x80 != 0 {
            return Err(NcqLogError::NotQueued);
        }
        if page[0] & 0x40 != 0 {
            return Err(NcqLogError::Unloaded);
        }
        Ok(Self {
            tag: page[0] & 0x1f,
            status: page[2],
            error: page[3],
            lba: u64::from_le_bytes([page[4], page[5], page[6], page[8], page[9], page[10], 0, 0]),
        })
    }
}
