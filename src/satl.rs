//! SCSI to ATA translation.
//!
//! Turns the CDB of the SRB attached to a request into a task file (or an
//! ATAPI packet) and decides how the data phase is carried. Commands that can
//! be answered from cached IDENTIFY data complete here without touching the
//! hardware.

use log::debug;

use crate::{
    ata::*,
    device::{DeviceFlags, DeviceInfo},
    request::{AtaDeviceRequest, Completion, DataBuffer, RequestFlags, SCRATCH_SIZE},
    scsi::*,
};

/// Outcome of translating one SRB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Translation {
    /// The task file is ready to be sent to the device.
    Execute,
    /// The SRB has its final status already.
    Complete,
}

/// Read/write opcodes indexed by `(lba48, fua, mode)` then direction;
/// mode is PIO, PIO multiple, DMA. Zero marks a combination ATA lacks.
const RW_COMMANDS: [[u8; 2]; 12] = [
    [ATA_CMD_READ, ATA_CMD_WRITE],
    [ATA_CMD_READ_MULTIPLE, ATA_CMD_WRITE_MULTIPLE],
    [ATA_CMD_READ_DMA, ATA_CMD_WRITE_DMA],
    [0, 0],
    [0, 0],
    [0, 0],
    [ATA_CMD_READ_EXT, ATA_CMD_WRITE_EXT],
    [ATA_CMD_READ_MULTIPLE_EXT, ATA_CMD_WRITE_MULTIPLE_EXT],
    [ATA_CMD_READ_DMA_EXT, ATA_CMD_WRITE_DMA_EXT],
    [0, 0],
    [0, ATA_CMD_WRITE_MULTIPLE_FUA_EXT],
    [0, ATA_CMD_WRITE_DMA_FUA_EXT],
];

pub(crate) fn rw_command(lba48: bool, fua: bool, mode: usize, write: bool) -> u8 {
    RW_COMMANDS[(lba48 as usize * 2 + fua as usize) * 3 + mode][write as usize]
}

/// Whether a transfer needs the 48-bit command set.
pub(crate) fn needs_lba48(info: &DeviceInfo, lba: u64, count: u32, fua: bool) -> bool {
    info.flags.contains(DeviceFlags::LBA48)
        && (fua
            || lba.saturating_add(count as u64) >= ATA_LBA28_LIMIT
            || count > ATA_MAX_LBA28_SECTORS)
}

const SCSI_ADSENSE_SAVING_PARAMETERS_NOT_SUPPORTED: u8 = 0x39;

const MODE_PAGE_CACHING: u8 = 0x08;
const MODE_PAGE_CONTROL: u8 = 0x0a;
const MODE_PAGE_ALL: u8 = 0x3f;
const MODE_DSP_FUA_SUPPORTED: u8 = 0x10;

const VPD_SUPPORTED_PAGES: u8 = 0x00;
const VPD_SERIAL_NUMBER: u8 = 0x80;
const VPD_BLOCK_DEVICE_CHARACTERISTICS: u8 = 0xb1;

pub(crate) fn translate(
    info: &DeviceInfo,
    req: &mut AtaDeviceRequest,
    max_transfer: u32,
) -> Translation {
    let Some(mut srb) = req.srb.take() else {
        return Translation::Complete;
    };
    req.timeout = srb.timeout;

    let translation = match srb.function {
        SrbFunction::Flush | SrbFunction::Shutdown => {
            if info.flags.contains(DeviceFlags::ATAPI) {
                complete(&mut srb, SrbStatus::Success)
            } else {
                flush(info, req)
            }
        }
        SrbFunction::ExecuteScsi if info.flags.contains(DeviceFlags::ATAPI) => {
            atapi_packet(info, req, &mut srb, max_transfer)
        }
        SrbFunction::ExecuteScsi => ata_scsi(info, req, &mut srb, max_transfer),
        _ => complete(&mut srb, SrbStatus::InvalidRequest),
    };
    req.srb = Some(srb);
    translation
}

fn complete(srb: &mut Srb, status: SrbStatus) -> Translation {
    srb.status = status;
    if status != SrbStatus::Success {
        srb.data_transfer_length = 0;
    }
    Translation::Complete
}

fn invalid_cdb(srb: &mut Srb) -> Translation {
    srb.set_invalid_cdb();
    srb.data_transfer_length = 0;
    Translation::Complete
}

fn check_condition(srb: &mut Srb, key: u8, asc: u8) -> Translation {
    srb.set_check_condition(SenseData::new(key, asc, 0));
    srb.data_transfer_length = 0;
    Translation::Complete
}

/// Copies synthesized reply data into the SRB buffer, clipped to the
/// allocation length.
fn reply(srb: &mut Srb, data: &[u8], allocation: usize) -> Translation {
    let len = data
        .len()
        .min(allocation)
        .min(srb.data.len())
        .min(srb.data_transfer_length as usize);
    srb.data[..len].copy_from_slice(&data[..len]);
    srb.data_transfer_length = len as u32;
    srb.status = SrbStatus::Success;
    Translation::Complete
}

fn ata_scsi(
    info: &DeviceInfo,
    req: &mut AtaDeviceRequest,
    srb: &mut Srb,
    max_transfer: u32,
) -> Translation {
    let cdb = srb.cdb;
    match cdb[0] {
        SCSIOP_READ6 | SCSIOP_READ | SCSIOP_READ12 | SCSIOP_READ16 | SCSIOP_WRITE6
        | SCSIOP_WRITE | SCSIOP_WRITE12 | SCSIOP_WRITE16 => {
            read_write(info, req, srb, &cdb, max_transfer)
        }
        SCSIOP_VERIFY | SCSIOP_VERIFY12 | SCSIOP_VERIFY16 => verify(info, req, srb, &cdb),
        SCSIOP_SYNCHRONIZE_CACHE | SCSIOP_SYNCHRONIZE_CACHE16 => flush(info, req),
        SCSIOP_TEST_UNIT_READY => complete(srb, SrbStatus::Success),
        SCSIOP_INQUIRY => inquiry(info, srb, &cdb),
        SCSIOP_READ_CAPACITY => identify_refresh(req, false),
        SCSIOP_SERVICE_ACTION_IN16 if cdb[1] & 0x1f == SERVICE_ACTION_READ_CAPACITY16 => {
            identify_refresh(req, true)
        }
        SCSIOP_MODE_SENSE | SCSIOP_MODE_SENSE10 => mode_sense(info, srb, &cdb),
        SCSIOP_MODE_SELECT | SCSIOP_MODE_SELECT10 => mode_select(info, req, srb, &cdb),
        SCSIOP_START_STOP_UNIT => start_stop(req, &cdb),
        SCSIOP_REQUEST_SENSE => {
            let mut sense = [0u8; SENSE_BUFFER_SIZE];
            SenseData::new(SCSI_SENSE_NO_SENSE, SCSI_ADSENSE_NO_SENSE, 0).write_fixed(&mut sense);
            reply(srb, &sense, cdb[4] as usize)
        }
        SCSIOP_ATA_PASSTHROUGH12 | SCSIOP_ATA_PASSTHROUGH16 => passthrough(info, req, srb, &cdb),
        op => {
            debug!("Unsupported SCSI opcode {op:#04x}");
            srb.set_invalid_opcode();
            srb.data_transfer_length = 0;
            Translation::Complete
        }
    }
}

fn read_write(
    info: &DeviceInfo,
    req: &mut AtaDeviceRequest,
    srb: &mut Srb,
    cdb: &[u8; 16],
    max_transfer: u32,
) -> Translation {
    let Some((lba, count)) = decode_rw_cdb(cdb) else {
        return invalid_cdb(srb);
    };
    let write = matches!(
        cdb[0],
        SCSIOP_WRITE6 | SCSIOP_WRITE | SCSIOP_WRITE12 | SCSIOP_WRITE16
    );
    // ATA has no FUA read; the bit is only honoured for writes.
    let fua = write && cdb[0] != SCSIOP_WRITE6 && cdb[1] & 0x08 != 0;

    if count == 0 {
        srb.data_transfer_length = 0;
        return complete(srb, SrbStatus::Success);
    }
    if lba
        .checked_add(count as u64)
        .is_none_or(|end| end > info.total_sectors)
    {
        return check_condition(srb, SCSI_SENSE_ILLEGAL_REQUEST, SCSI_ADSENSE_ILLEGAL_BLOCK);
    }
    let bytes = count as u64 * info.sector_size as u64;
    if bytes > srb.data.len() as u64
        || bytes > srb.data_transfer_length as u64
        || bytes > max_transfer as u64
    {
        return complete(srb, SrbStatus::InvalidRequest);
    }

    req.flags |= if write {
        RequestFlags::DATA_OUT
    } else {
        RequestFlags::DATA_IN
    };
    req.buffer = DataBuffer::Srb;
    req.data_length = bytes as u32;

    if info.flags.contains(DeviceFlags::NCQ) && count <= ATA_MAX_LBA48_SECTORS {
        // FPDMA commands always use 48-bit addressing; the count travels in
        // the feature registers and the tag is filled in at issue time.
        let tf = &mut req.task_file;
        tf.lba48(lba, 0);
        tf.command = if write {
            ATA_CMD_FPDMA_WRITE
        } else {
            ATA_CMD_FPDMA_READ
        };
        tf.feature = count as u8;
        tf.feature_exp = (count >> 8) as u8;
        tf.sector_count = 0;
        tf.sector_count_exp = 0;
        if fua {
            tf.drive_select |= ATA_DEVICE_FUA;
        }
        req.flags |= RequestFlags::NCQ | RequestFlags::DMA | RequestFlags::LBA48;
        if fua {
            req.flags |= RequestFlags::FUA;
        }
        return Translation::Execute;
    }

    let lba48 = needs_lba48(info, lba, count, fua);
    let limit = if lba48 {
        ATA_MAX_LBA48_SECTORS
    } else {
        ATA_MAX_LBA28_SECTORS
    };
    if count > limit || (!lba48 && lba + count as u64 > ATA_LBA28_LIMIT) {
        return invalid_cdb(srb);
    }

    let mode = if !info.flags.contains(DeviceFlags::PIO_ONLY) {
        req.flags |= RequestFlags::DMA;
        2
    } else if info.multiple != 0 {
        1
    } else {
        0
    };
    let command = rw_command(lba48, fua, mode, write);
    if command == 0 {
        return invalid_cdb(srb);
    }

    let tf = &mut req.task_file;
    tf.command = command;
    if !info.flags.contains(DeviceFlags::LBA) {
        chs(info, tf, lba, count);
    } else if lba48 {
        tf.lba48(lba, count);
        req.flags |= RequestFlags::LBA48;
    } else {
        tf.lba28(lba, count);
    }
    if fua {
        req.flags |= RequestFlags::FUA;
    }
    Translation::Execute
}

fn chs(info: &DeviceInfo, tf: &mut crate::request::TaskFile, lba: u64, count: u32) {
    let spt = info.sectors_per_track.max(1) as u64;
    let heads = info.heads.max(1) as u64;
    let sector = lba % spt + 1;
    let track = lba / spt;
    let head = track % heads;
    let cylinder = track / heads;
    tf.lba_low = sector as u8;
    tf.lba_mid = cylinder as u8;
    tf.lba_high = (cylinder >> 8) as u8;
    tf.drive_select = ATA_DEVICE_OBS | (head as u8 & 0x0f);
    tf.sector_count = count as u8;
}

fn verify(
    info: &DeviceInfo,
    req: &mut AtaDeviceRequest,
    srb: &mut Srb,
    cdb: &[u8; 16],
) -> Translation {
    // Byte-by-byte compare needs a data-out phase ATA cannot do.
    if cdb[1] & 0x02 != 0 {
        return invalid_cdb(srb);
    }
    let Some((lba, count)) = decode_rw_cdb(cdb) else {
        return invalid_cdb(srb);
    };
    if count == 0 {
        return complete(srb, SrbStatus::Success);
    }
    if lba
        .checked_add(count as u64)
        .is_none_or(|end| end > info.total_sectors)
    {
        return check_condition(srb, SCSI_SENSE_ILLEGAL_REQUEST, SCSI_ADSENSE_ILLEGAL_BLOCK);
    }
    let lba48 = needs_lba48(info, lba, count, false);
    if count > if lba48 { ATA_MAX_LBA48_SECTORS } else { ATA_MAX_LBA28_SECTORS } {
        return invalid_cdb(srb);
    }
    let tf = &mut req.task_file;
    if !info.flags.contains(DeviceFlags::LBA) {
        tf.command = ATA_CMD_VERIFY;
        chs(info, tf, lba, count);
    } else if lba48 {
        tf.command = ATA_CMD_VERIFY_EXT;
        tf.lba48(lba, count);
        req.flags |= RequestFlags::LBA48;
    } else {
        tf.command = ATA_CMD_VERIFY;
        tf.lba28(lba, count);
    }
    Translation::Execute
}

fn flush(info: &DeviceInfo, req: &mut AtaDeviceRequest) -> Translation {
    if info.flags.contains(DeviceFlags::LBA48) {
        req.task_file.command = ATA_CMD_FLUSH_EXT;
        req.flags |= RequestFlags::LBA48;
    } else {
        req.task_file.command = ATA_CMD_FLUSH;
    }
    req.task_file.drive_select = ATA_DEVICE_LBA;
    // Flushing a large cache can take a while.
    req.timeout = req.timeout.max(60);
    Translation::Execute
}

/// Issues IDENTIFY DEVICE into scratch; READ CAPACITY is answered from the
/// fresh data when it completes.
fn identify_refresh(req: &mut AtaDeviceRequest, long: bool) -> Translation {
    req.task_file.command = ATA_CMD_ID_ATA;
    req.task_file.drive_select = ATA_DEVICE_LBA;
    req.flags |= RequestFlags::DATA_IN | RequestFlags::EXCLUSIVE;
    req.buffer = DataBuffer::Scratch;
    req.data_length = SCRATCH_SIZE as u32;
    req.completion = Completion::ReadCapacity { long };
    Translation::Execute
}

/// Builds the READ CAPACITY reply from IDENTIFY data.
pub(crate) fn read_capacity_reply(info: &DeviceInfo, long: bool, out: &mut [u8; 32]) -> usize {
    let last = info.total_sectors.saturating_sub(1);
    if long {
        out[..8].copy_from_slice(&last.to_be_bytes());
        out[8..12].copy_from_slice(&info.sector_size.to_be_bytes());
        out[13] = info.identify.physical_sector_exponent() & 0xf;
        32
    } else {
        let last = u32::try_from(last).unwrap_or(u32::MAX);
        out[..4].copy_from_slice(&last.to_be_bytes());
        out[4..8].copy_from_slice(&info.sector_size.to_be_bytes());
        8
    }
}

fn inquiry(info: &DeviceInfo, srb: &mut Srb, cdb: &[u8; 16]) -> Translation {
    let evpd = cdb[1] & 0x01 != 0;
    let page = cdb[2];
    let allocation = u16::from_be_bytes([cdb[3], cdb[4]]) as usize;
    let id = &info.identify;
    let mut data = [0u8; 96];

    if !evpd {
        if page != 0 {
            return invalid_cdb(srb);
        }
        if info.flags.contains(DeviceFlags::REMOVABLE) {
            data[1] = 0x80;
        }
        data[2] = 0x05;
        data[3] = 0x02;
        data[4] = (data.len() - 5) as u8;
        if info.flags.contains(DeviceFlags::NCQ) {
            data[7] = 0x02;
        }
        data[8..16].copy_from_slice(b"ATA     ");
        fill_ascii(&mut data[16..32], &id.model());
        let firmware = id.firmware();
        let revision = if firmware.len() > 4 {
            &firmware[firmware.len() - 4..]
        } else {
            &firmware[..]
        };
        fill_ascii(&mut data[32..36], revision);
        return reply(srb, &data, allocation);
    }

    data[1] = page;
    let len = match page {
        VPD_SUPPORTED_PAGES => {
            let pages = [
                VPD_SUPPORTED_PAGES,
                VPD_SERIAL_NUMBER,
                VPD_BLOCK_DEVICE_CHARACTERISTICS,
            ];
            data[4..4 + pages.len()].copy_from_slice(&pages);
            pages.len()
        }
        VPD_SERIAL_NUMBER => {
            let serial = id.serial();
            fill_ascii(&mut data[4..4 + ATA_ID_SERNO_LEN], &serial);
            ATA_ID_SERNO_LEN
        }
        VPD_BLOCK_DEVICE_CHARACTERISTICS => {
            data[4..6].copy_from_slice(&id.rotation_rate().to_be_bytes());
            0x3c
        }
        _ => return invalid_cdb(srb),
    };
    data[3] = len as u8;
    reply(srb, &data[..4 + len], allocation)
}

fn fill_ascii(out: &mut [u8], s: &str) {
    out.fill(b' ');
    let len = s.len().min(out.len());
    out[..len].copy_from_slice(&s.as_bytes()[..len]);
}

fn caching_page(info: &DeviceInfo, changeable: bool, out: &mut [u8]) -> usize {
    out[0] = MODE_PAGE_CACHING;
    out[1] = 0x12;
    if changeable || info.flags.contains(DeviceFlags::WRITE_CACHE) {
        out[2] = 0x04;
    }
    0x14
}

fn control_page(out: &mut [u8]) -> usize {
    out[0] = MODE_PAGE_CONTROL;
    out[1] = 0x0a;
    0x0c
}

fn mode_sense(info: &DeviceInfo, srb: &mut Srb, cdb: &[u8; 16]) -> Translation {
    let ten = cdb[0] == SCSIOP_MODE_SENSE10;
    let control = cdb[2] >> 6;
    let page = cdb[2] & 0x3f;
    let allocation = if ten {
        u16::from_be_bytes([cdb[7], cdb[8]]) as usize
    } else {
        cdb[4] as usize
    };
    if control == 3 {
        return check_condition(
            srb,
            SCSI_SENSE_ILLEGAL_REQUEST,
            SCSI_ADSENSE_SAVING_PARAMETERS_NOT_SUPPORTED,
        );
    }

    let header = if ten { 8 } else { 4 };
    let mut data = [0u8; 64];
    let mut len = header;
    let changeable = control == 1;
    match page {
        MODE_PAGE_CACHING => len += caching_page(info, changeable, &mut data[len..]),
        MODE_PAGE_CONTROL => len += control_page(&mut data[len..]),
        MODE_PAGE_ALL => {
            len += caching_page(info, changeable, &mut data[len..]);
            len += control_page(&mut data[len..]);
        }
        _ => return invalid_cdb(srb),
    }

    let dsp = if info.flags.contains(DeviceFlags::FUA) {
        MODE_DSP_FUA_SUPPORTED
    } else {
        0
    };
    if ten {
        data[..2].copy_from_slice(&((len - 2) as u16).to_be_bytes());
        data[3] = dsp;
    } else {
        data[0] = (len - 1) as u8;
        data[2] = dsp;
    }
    reply(srb, &data[..len], allocation)
}

fn mode_select(
    info: &DeviceInfo,
    req: &mut AtaDeviceRequest,
    srb: &mut Srb,
    cdb: &[u8; 16],
) -> Translation {
    let ten = cdb[0] == SCSIOP_MODE_SELECT10;
    // Page format is required, saving is not supported.
    if cdb[1] & 0x10 == 0 || cdb[1] & 0x01 != 0 {
        return invalid_cdb(srb);
    }
    let length = if ten {
        u16::from_be_bytes([cdb[7], cdb[8]]) as usize
    } else {
        cdb[4] as usize
    };
    if length == 0 {
        return complete(srb, SrbStatus::Success);
    }

    let length = length.min(srb.data.len());
    let params = &srb.data[..length];
    let header = if ten { 8 } else { 4 };
    if params.len() < header {
        return check_condition(
            srb,
            SCSI_SENSE_ILLEGAL_REQUEST,
            SCSI_ADSENSE_INVALID_FIELD_PARAMETER_LIST,
        );
    }
    let descriptors = if ten {
        u16::from_be_bytes([params[6], params[7]]) as usize
    } else {
        params[3] as usize
    };
    let page = &params[(header + descriptors).min(params.len())..];
    if page.len() < 3 || page[0] & 0x3f != MODE_PAGE_CACHING {
        return check_condition(
            srb,
            SCSI_SENSE_ILLEGAL_REQUEST,
            SCSI_ADSENSE_INVALID_FIELD_PARAMETER_LIST,
        );
    }

    let enable = page[2] & 0x04 != 0;
    if enable == info.flags.contains(DeviceFlags::WRITE_CACHE) {
        return complete(srb, SrbStatus::Success);
    }
    req.task_file.command = ATA_CMD_SET_FEATURES;
    req.task_file.feature = if enable {
        SETFEATURES_WC_ON
    } else {
        SETFEATURES_WC_OFF
    };
    req.task_file.drive_select = ATA_DEVICE_LBA;
    req.flags |= RequestFlags::EXCLUSIVE;
    req.completion = Completion::WriteCache { enabled: enable };
    Translation::Execute
}

fn start_stop(req: &mut AtaDeviceRequest, cdb: &[u8; 16]) -> Translation {
    let start = cdb[4] & 0x01 != 0;
    req.task_file.command = if start {
        ATA_CMD_IDLE_IMMEDIATE
    } else {
        ATA_CMD_STANDBY_IMMEDIATE
    };
    req.task_file.drive_select = ATA_DEVICE_LBA;
    Translation::Execute
}

const PROTOCOL_NON_DATA: u8 = 3;
const PROTOCOL_PIO_IN: u8 = 4;
const PROTOCOL_PIO_OUT: u8 = 5;
const PROTOCOL_DMA: u8 = 6;

fn passthrough(
    info: &DeviceInfo,
    req: &mut AtaDeviceRequest,
    srb: &mut Srb,
    cdb: &[u8; 16],
) -> Translation {
    let protocol = (cdb[1] >> 1) & 0x0f;
    let to_device = cdb[2] & 0x08 == 0;
    let tf = &mut req.task_file;
    let extend = if cdb[0] == SCSIOP_ATA_PASSTHROUGH16 {
        tf.feature_exp = cdb[3];
        tf.feature = cdb[4];
        tf.sector_count_exp = cdb[5];
        tf.sector_count = cdb[6];
        tf.lba_low_exp = cdb[7];
        tf.lba_low = cdb[8];
        tf.lba_mid_exp = cdb[9];
        tf.lba_mid = cdb[10];
        tf.lba_high_exp = cdb[11];
        tf.lba_high = cdb[12];
        tf.drive_select = cdb[13];
        tf.command = cdb[14];
        cdb[1] & 0x01 != 0
    } else {
        tf.feature = cdb[3];
        tf.sector_count = cdb[4];
        tf.lba_low = cdb[5];
        tf.lba_mid = cdb[6];
        tf.lba_high = cdb[7];
        tf.drive_select = cdb[8];
        tf.command = cdb[9];
        false
    };
    let command = tf.command;

    let length = srb.data_transfer_length.min(srb.data.len() as u32);
    match protocol {
        PROTOCOL_NON_DATA => {}
        PROTOCOL_PIO_IN | PROTOCOL_PIO_OUT | PROTOCOL_DMA => {
            let data_in = protocol == PROTOCOL_PIO_IN || (protocol == PROTOCOL_DMA && !to_device);
            if length == 0 || data_in == to_device && protocol != PROTOCOL_DMA {
                return invalid_cdb(srb);
            }
            if protocol == PROTOCOL_DMA {
                if info.flags.contains(DeviceFlags::PIO_ONLY) {
                    return invalid_cdb(srb);
                }
                req.flags |= RequestFlags::DMA;
            }
            req.flags |= if data_in {
                RequestFlags::DATA_IN
            } else {
                RequestFlags::DATA_OUT
            };
            req.buffer = DataBuffer::Srb;
            req.data_length = length;
        }
        _ => return invalid_cdb(srb),
    }
    if extend {
        req.flags |= RequestFlags::LBA48;
    }
    if matches!(
        command,
        ATA_CMD_ID_ATA | ATA_CMD_ID_ATAPI | ATA_CMD_SET_FEATURES | ATA_CMD_SET_MULTIPLE
    ) {
        req.flags |= RequestFlags::EXCLUSIVE;
    }
    Translation::Execute
}

fn atapi_packet(
    info: &DeviceInfo,
    req: &mut AtaDeviceRequest,
    srb: &mut Srb,
    max_transfer: u32,
) -> Translation {
    let cdb = srb.cdb;
    let mut length = srb.data_transfer_length.min(srb.data.len() as u32);
    let mut data_out = srb.is_write();
    let data_in = srb.flags.contains(SrbFlags::DATA_IN);
    if length > max_transfer {
        return complete(srb, SrbStatus::InvalidRequest);
    }
    req.buffer = DataBuffer::Srb;

    match cdb[0] {
        SCSIOP_MODE_SENSE => {
            // Packet devices only implement the 10-byte mode commands.
            let allocation = cdb[4] as usize + 4;
            req.cdb = [0; 16];
            req.cdb[0] = SCSIOP_MODE_SENSE10;
            req.cdb[1] = cdb[1] & 0x08;
            req.cdb[2] = cdb[2];
            req.cdb[7..9].copy_from_slice(&(allocation as u16).to_be_bytes());
            req.cdb[9] = cdb[5];
            req.buffer = DataBuffer::Scratch;
            req.completion = Completion::ModeSense6;
            length = allocation as u32;
        }
        SCSIOP_MODE_SELECT => {
            let params = &srb.data;
            let len = (cdb[4] as usize).min(params.len());
            if len < 4 || len + 4 > SCRATCH_SIZE {
                return invalid_cdb(srb);
            }
            let mut scratch = [0u8; SCRATCH_SIZE];
            scratch[2] = params[1];
            scratch[3] = params[2];
            scratch[7] = params[3];
            scratch[8..len + 4].copy_from_slice(&params[4..len]);
            req.scratch[..len + 4].copy_from_slice(&scratch[..len + 4]);
            req.cdb = [0; 16];
            req.cdb[0] = SCSIOP_MODE_SELECT10;
            req.cdb[1] = cdb[1] & 0x11;
            req.cdb[7..9].copy_from_slice(&((len + 4) as u16).to_be_bytes());
            req.cdb[9] = cdb[5];
            req.buffer = DataBuffer::Scratch;
            length = (len + 4) as u32;
            data_out = true;
        }
        _ => {
            let cdb_len = srb.cdb_length as usize;
            if cdb_len > info.cdb_size as usize {
                return invalid_cdb(srb);
            }
            req.cdb = [0; 16];
            req.cdb[..cdb_len].copy_from_slice(&cdb[..cdb_len]);
        }
    }

    req.flags |= RequestFlags::PACKET_COMMAND;
    req.data_length = length;
    if length != 0 {
        req.flags |= if data_out {
            RequestFlags::DATA_OUT
        } else if data_in || req.completion == Completion::ModeSense6 {
            RequestFlags::DATA_IN
        } else {
            RequestFlags::empty()
        };
    }

    let tf = &mut req.task_file;
    tf.command = ATA_CMD_PACKET;
    let dma = length != 0 && length % 4 == 0 && !info.flags.contains(DeviceFlags::PIO_ONLY);
    if dma {
        req.flags |= RequestFlags::DMA;
        tf.feature = ATA_FEATURE_DMA;
        if info.flags.contains(DeviceFlags::DMADIR) && !data_out {
            tf.feature |= ATA_FEATURE_DMADIR;
        }
    }
    // Byte count limit for PIO data phases.
    let limit = length.min(0xfffe) as u16;
    tf.lba_mid = limit as u8;
    tf.lba_high = (limit >> 8) as u8;
    Translation::Execute
}

/// Converts a MODE SENSE(10) reply sitting in `scratch` into the 6-byte
/// format expected by the SRB.
pub(crate) fn mode_sense10_to_6(scratch: &[u8], transferred: usize, out: &mut [u8]) -> usize {
    if transferred < 8 || out.len() < 4 {
        return 0;
    }
    let body = &scratch[8..transferred];
    let len = (body.len() + 4).min(out.len());
    out[0] = (len - 1) as u8;
    out[1] = scratch[2];
    out[2] = scratch[3];
    out[3] = scratch[7];
    out[4..len].copy_from_slice(&body[..len - 4]);
    len
}
