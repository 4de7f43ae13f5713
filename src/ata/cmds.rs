//! Typed wrappers for the ATA commands the monitor issues

use std::time::Duration;

use crate::{
    ata::{AtaData, AtaInRegs, AtaOutRegs, OutRegsNeeded},
    device::{AtaDevice, DEFAULT_TIMEOUT, SELF_TEST_TIMEOUT, SmartError},
    unaligned,
};

/// IDENTIFY DEVICE
pub(crate) const CMD_IDENTIFY_DEVICE: u8 = 0xEC;
/// IDENTIFY PACKET DEVICE
pub(crate) const CMD_IDENTIFY_PACKET_DEVICE: u8 = 0xA1;
/// SMART
pub(crate) const CMD_SMART: u8 = 0xB0;
/// CHECK POWER MODE
pub(crate) const CMD_CHECK_POWER_MODE: u8 = 0xE5;

/// SMART signature for the LBA mid register
pub(crate) const SMART_CYL_LOW: u8 = 0x4F;
/// SMART signature for the LBA high register
pub(crate) const SMART_CYL_HI: u8 = 0xC2;

/// SMART feature register subcommands
pub(crate) mod feature {
    pub(crate) const READ_VALUES: u8 = 0xD0;
    pub(crate) const READ_THRESHOLDS: u8 = 0xD1;
    pub(crate) const AUTOSAVE: u8 = 0xD2;
    pub(crate) const IMMEDIATE_OFFLINE: u8 = 0xD4;
    pub(crate) const READ_LOG: u8 = 0xD5;
    pub(crate) const WRITE_LOG: u8 = 0xD6;
    pub(crate) const ENABLE: u8 = 0xD8;
    pub(crate) const DISABLE: u8 = 0xD9;
    pub(crate) const STATUS: u8 = 0xDA;
    pub(crate) const AUTO_OFFLINE: u8 = 0xDB;
}

/// SMART log addresses
pub(crate) mod log_addr {
    /// Summary error log
    pub(crate) const ERROR: u8 = 0x01;
    /// Self-test log
    pub(crate) const SELF_TEST: u8 = 0x06;
    /// Selective self-test log
    pub(crate) const SELECTIVE: u8 = 0x09;
}

/// ATA status register ERR bit
const STATUS_ERR: u8 = 0x01;
/// ATA error register ABRT bit
const ERROR_ABRT: u8 = 0x04;

/// SMART health verdict from the status registers
#[derive(Copy, Clone, Debug, Eq, PartialEq, strum::Display)]
pub(crate) enum HealthStatus {
    /// Threshold not exceeded
    Healthy,
    /// Threshold exceeded, failure predicted
    Failing,
    /// Registers did not carry either signature
    Unknown,
}

/// Power state reported by CHECK POWER MODE
#[derive(Copy, Clone, Debug, Eq, PartialEq, strum::Display)]
pub(crate) enum PowerMode {
    /// In or going to standby (spun down)
    Standby,
    /// Idle
    Idle,
    /// Active or idle
    ActiveIdle,
    /// NV cache power mode, spun down or up
    NvCache,
    /// Sleep, only leaves on reset
    Sleep,
    /// Non-compliant answer
    Unknown,
}

impl PowerMode {
    /// Whether the drive is spun down at least to the given threshold mode
    pub(crate) fn is_low_power(self, threshold: PowerMode) -> bool {
        match threshold {
            PowerMode::Sleep => matches!(self, PowerMode::Sleep),
            PowerMode::Standby => matches!(self, PowerMode::Sleep | PowerMode::Standby),
            PowerMode::Idle => {
                matches!(self, PowerMode::Sleep | PowerMode::Standby | PowerMode::Idle)
            }
            _ => false,
        }
    }
}

/// Fail when the device flagged the command itself as failed
fn check_regs(out: &AtaOutRegs) -> Result<(), SmartError> {
    if out.status & STATUS_ERR != 0 {
        return Err(SmartError::BadResponse("ata command status"));
    }
    Ok(())
}

/// IDENTIFY DEVICE, 512 bytes of identity data
pub(crate) fn identify(dev: &mut dyn AtaDevice) -> Result<[u8; 512], SmartError> {
    let regs = AtaInRegs {
        command: CMD_IDENTIFY_DEVICE,
        sector_count: 1,
        ..AtaInRegs::default()
    };
    let mut data = [0u8; 512];
    dev.ata_pass_through(
        &regs,
        AtaData::In(&mut data),
        &OutRegsNeeded::NONE,
        DEFAULT_TIMEOUT,
    )?;
    if !identify_valid(&data) {
        return Err(SmartError::BadResponse("identify device"));
    }
    Ok(data)
}

/// Whether an IDENTIFY response looks like real identity data
pub(crate) fn identify_valid(data: &[u8; 512]) -> bool {
    if data.iter().all(|b| *b == 0) {
        return false;
    }
    // trailing signature makes the whole sector sum to zero
    if data[510] == 0xA5 {
        return data.iter().fold(0u8, |sum, b| sum.wrapping_add(*b)) == 0;
    }
    true
}

/// Extract an ATA identify string: big-endian byte pairs per 16-bit word,
/// space padded
pub(crate) fn ata_string(data: &[u8; 512], start_word: usize, num_words: usize) -> String {
    let mut out = String::with_capacity(num_words * 2);
    for word in start_word..start_word + num_words {
        out.push(char::from(data[2 * word + 1]));
        out.push(char::from(data[2 * word]));
    }
    out.trim().to_owned()
}

/// Model name from IDENTIFY data
pub(crate) fn identify_model(data: &[u8; 512]) -> String {
    ata_string(data, 27, 20)
}

/// Serial number from IDENTIFY data
pub(crate) fn identify_serial(data: &[u8; 512]) -> String {
    ata_string(data, 10, 10)
}

/// Firmware revision from IDENTIFY data
pub(crate) fn identify_firmware(data: &[u8; 512]) -> String {
    ata_string(data, 23, 4)
}

/// User-addressable sector count from IDENTIFY data (words 60-61, or
/// words 100-103 when the 48-bit feature set is present)
pub(crate) fn identify_sectors(data: &[u8; 512]) -> u64 {
    let lba48 = unaligned::le16(data, 2 * 83) & (1 << 10) != 0;
    if lba48 {
        unaligned::le64(data, 2 * 100)
    } else {
        u64::from(unaligned::le32(data, 2 * 60))
    }
}

/// Issue one non-data SMART subcommand
fn smart_non_data(
    dev: &mut dyn AtaDevice,
    feature: u8,
    sector_count: u8,
    lba_low: u8,
    timeout: Duration,
) -> Result<(), SmartError> {
    let regs = AtaInRegs {
        sector_count,
        lba_low,
        ..AtaInRegs::smart(feature)
    };
    let out = dev.ata_pass_through(&regs, AtaData::None, &OutRegsNeeded::NONE, timeout)?;
    check_regs(&out)
}

/// SMART ENABLE OPERATIONS
pub(crate) fn smart_enable(dev: &mut dyn AtaDevice) -> Result<(), SmartError> {
    smart_non_data(dev, feature::ENABLE, 0, 1, DEFAULT_TIMEOUT)
}

/// SMART DISABLE OPERATIONS
pub(crate) fn smart_disable(dev: &mut dyn AtaDevice) -> Result<(), SmartError> {
    smart_non_data(dev, feature::DISABLE, 0, 1, DEFAULT_TIMEOUT)
}

/// SMART ENABLE/DISABLE ATTRIBUTE AUTOSAVE
pub(crate) fn smart_autosave(dev: &mut dyn AtaDevice, enable: bool) -> Result<(), SmartError> {
    // 0xF1 enables, 0 disables
    smart_non_data(
        dev,
        feature::AUTOSAVE,
        if enable { 0xF1 } else { 0x00 },
        0,
        DEFAULT_TIMEOUT,
    )
}

/// SMART ENABLE/DISABLE AUTO OFFLINE
pub(crate) fn smart_auto_offline(dev: &mut dyn AtaDevice, enable: bool) -> Result<(), SmartError> {
    // 0xF8 enables, 0 disables
    smart_non_data(
        dev,
        feature::AUTO_OFFLINE,
        if enable { 0xF8 } else { 0x00 },
        0,
        DEFAULT_TIMEOUT,
    )
}

/// SMART READ DATA, the 512-byte attribute/capability structure
pub(crate) fn read_smart_values(dev: &mut dyn AtaDevice) -> Result<[u8; 512], SmartError> {
    let regs = AtaInRegs {
        sector_count: 1,
        ..AtaInRegs::smart(feature::READ_VALUES)
    };
    let mut data = [0u8; 512];
    dev.ata_pass_through(
        &regs,
        AtaData::In(&mut data),
        &OutRegsNeeded::NONE,
        DEFAULT_TIMEOUT,
    )?;
    if !checksum_ok(&data) {
        log::warn!("{}: SMART values checksum error", dev.name());
    }
    Ok(data)
}

/// SMART READ THRESHOLDS, the companion 512-byte threshold structure
pub(crate) fn read_smart_thresholds(dev: &mut dyn AtaDevice) -> Result<[u8; 512], SmartError> {
    let regs = AtaInRegs {
        sector_count: 1,
        lba_low: 1,
        ..AtaInRegs::smart(feature::READ_THRESHOLDS)
    };
    let mut data = [0u8; 512];
    dev.ata_pass_through(
        &regs,
        AtaData::In(&mut data),
        &OutRegsNeeded::NONE,
        DEFAULT_TIMEOUT,
    )?;
    if !checksum_ok(&data) {
        log::warn!("{}: SMART thresholds checksum error", dev.name());
    }
    Ok(data)
}

/// SMART READ LOG
pub(crate) fn smart_read_log(
    dev: &mut dyn AtaDevice,
    addr: u8,
    sectors: u8,
) -> Result<Vec<u8>, SmartError> {
    let regs = AtaInRegs {
        sector_count: sectors,
        lba_low: addr,
        ..AtaInRegs::smart(feature::READ_LOG)
    };
    let mut data = vec![0u8; usize::from(sectors) * 512];
    dev.ata_pass_through(
        &regs,
        AtaData::In(&mut data),
        &OutRegsNeeded::NONE,
        DEFAULT_TIMEOUT,
    )?;
    Ok(data)
}

/// SMART WRITE LOG
pub(crate) fn smart_write_log(
    dev: &mut dyn AtaDevice,
    addr: u8,
    data: &[u8],
) -> Result<(), SmartError> {
    let regs = AtaInRegs {
        sector_count: (data.len() / 512) as u8,
        lba_low: addr,
        ..AtaInRegs::smart(feature::WRITE_LOG)
    };
    let out = dev.ata_pass_through(
        &regs,
        AtaData::Out(data),
        &OutRegsNeeded::NONE,
        DEFAULT_TIMEOUT,
    )?;
    check_regs(&out)
}

/// SMART RETURN STATUS; the verdict is carried in the LBA mid/high registers
pub(crate) fn smart_return_status(dev: &mut dyn AtaDevice) -> Result<HealthStatus, SmartError> {
    let regs = AtaInRegs::smart(feature::STATUS);
    let out = dev.ata_pass_through(
        &regs,
        AtaData::None,
        &OutRegsNeeded::LBA_MID_HIGH,
        DEFAULT_TIMEOUT,
    )?;
    Ok(match (out.lba_mid as u8, out.lba_high as u8) {
        (SMART_CYL_LOW, SMART_CYL_HI) => HealthStatus::Healthy,
        (0xF4, 0x2C) => HealthStatus::Failing,
        _ => HealthStatus::Unknown,
    })
}

/// SMART EXECUTE OFF-LINE IMMEDIATE with the given subcommand
/// (0x00 full offline, 0x01 short, 0x02 extended, 0x03 conveyance,
/// 0x04 selective)
pub(crate) fn execute_offline_immediate(
    dev: &mut dyn AtaDevice,
    subcommand: u8,
) -> Result<(), SmartError> {
    smart_non_data(
        dev,
        feature::IMMEDIATE_OFFLINE,
        0,
        subcommand,
        SELF_TEST_TIMEOUT,
    )
}

/// CHECK POWER MODE, decoded from the returned sector count register
pub(crate) fn check_power_mode(dev: &mut dyn AtaDevice) -> Result<PowerMode, SmartError> {
    let regs = AtaInRegs {
        command: CMD_CHECK_POWER_MODE,
        ..AtaInRegs::default()
    };
    let needed = OutRegsNeeded {
        error: true,
        status: true,
        ..OutRegsNeeded::SECTOR_COUNT
    };
    let out = dev.ata_pass_through(&regs, AtaData::None, &needed, DEFAULT_TIMEOUT)?;
    // a sleeping drive aborts the command
    if out.status & STATUS_ERR != 0 && out.error & ERROR_ABRT != 0 {
        return Ok(PowerMode::Sleep);
    }
    check_regs(&out)?;
    Ok(match out.sector_count as u8 {
        0x00 => PowerMode::Standby,
        0x80 => PowerMode::Idle,
        0xFF => PowerMode::ActiveIdle,
        0x40 | 0x41 => PowerMode::NvCache,
        _ => PowerMode::Unknown,
    })
}

/// Span selection for a selective self-test
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum SelectiveMode {
    /// Run the span already in the log
    Range,
    /// Redo the last span
    Redo,
    /// Advance to the span after the last one
    Next,
    /// Continue an interrupted span
    Cont,
}

/// Rewrite the selective self-test log (0x09) with the next span to scan,
/// returning its bounds.
///
/// Span LBAs are clipped to `num_sectors - 1`.
pub(crate) fn prepare_selective_log(
    dev: &mut dyn AtaDevice,
    mode: SelectiveMode,
    num_sectors: u64,
) -> Result<(u64, u64), SmartError> {
    if num_sectors == 0 {
        return Err(SmartError::Unsupported("device capacity unknown"));
    }
    let mut log = smart_read_log(dev, log_addr::SELECTIVE, 1)?;
    let prev_start = unaligned::le64(&log, 2);
    let prev_end = unaligned::le64(&log, 10);
    let (start, end) = match mode {
        SelectiveMode::Range | SelectiveMode::Redo | SelectiveMode::Cont => {
            (prev_start.min(num_sectors - 1), prev_end.min(num_sectors - 1))
        }
        SelectiveMode::Next => {
            let size = if prev_end > prev_start {
                prev_end - prev_start + 1
            } else {
                // first span: 1% of the disk
                num_sectors / 100 + 1
            };
            let start = if prev_end == 0 || prev_end + 1 >= num_sectors {
                0
            } else {
                prev_end + 1
            };
            (start, (start + size - 1).min(num_sectors - 1))
        }
    };
    unaligned::put_le64(&mut log, 2, start);
    unaligned::put_le64(&mut log, 10, end);
    // zero remaining spans so only span 1 runs
    for span in 1..5 {
        unaligned::put_le64(&mut log, 2 + span * 16, 0);
        unaligned::put_le64(&mut log, 10 + span * 16, 0);
    }
    fix_checksum(&mut log);
    smart_write_log(dev, log_addr::SELECTIVE, &log)?;
    Ok((start, end))
}

/// Whether a 512-byte SMART structure sums to zero
pub(crate) fn checksum_ok(data: &[u8]) -> bool {
    data.iter().fold(0u8, |sum, b| sum.wrapping_add(*b)) == 0
}

/// Recompute the trailing checksum byte of a 512-byte SMART structure
fn fix_checksum(data: &mut [u8]) {
    data[511] = 0;
    let sum = data.iter().fold(0u8, |sum, b| sum.wrapping_add(*b));
    data[511] = 0u8.wrapping_sub(sum);
}
