//! Decoders for the mode and log pages the monitor interprets

use crate::{
    device::{ScsiDevice, SmartError},
    scsi::cmds,
    unaligned,
};

/// Parsed Informational Exceptions Control mode page (0x1C)
#[derive(Clone, Debug)]
pub(crate) struct IecModePage {
    /// Full MODE SENSE response, reused for MODE SELECT
    data: Vec<u8>,
    /// Offset of the mode page inside `data`
    page_off: usize,
    /// Whether the 10-byte MODE SENSE/SELECT pair is in use
    ten_byte: bool,
}

impl IecModePage {
    /// Byte 2 of the page: DEXCPT (bit 3) and EWASC (bit 4)
    fn control_byte(&self) -> u8 {
        self.data.get(self.page_off + 2).copied().unwrap_or(0)
    }

    /// Whether informational exception reporting is enabled
    pub(crate) fn exceptions_enabled(&self) -> bool {
        self.control_byte() & 0x08 == 0
    }

    /// Whether warning reporting (temperature) is enabled
    pub(crate) fn warnings_enabled(&self) -> bool {
        self.control_byte() & 0x10 != 0
    }

    /// Method of reporting informational exceptions field
    pub(crate) fn mrie(&self) -> u8 {
        self.data.get(self.page_off + 3).copied().unwrap_or(0) & 0x0F
    }
}

/// Fetch the IEC mode page, remembering which MODE SENSE length the device
/// accepts (`mode_sense_len`: 0 unknown, 6 or 10).
pub(crate) fn fetch_iec(
    dev: &mut dyn ScsiDevice,
    mode_sense_len: &mut u8,
) -> Result<IecModePage, SmartError> {
    if *mode_sense_len != 10 {
        match cmds::mode_sense6(dev, cmds::MP_IEC, 0, 64) {
            Ok(data) => {
                let page_off = cmds::mode6_page_offset(&data);
                if data.get(page_off).is_some_and(|b| b & 0x3F == cmds::MP_IEC) {
                    *mode_sense_len = 6;
                    return Ok(IecModePage {
                        data,
                        page_off,
                        ten_byte: false,
                    });
                }
            }
            Err(e) => {
                if *mode_sense_len == 6 {
                    return Err(e);
                }
            }
        }
    }
    let data = cmds::mode_sense10(dev, cmds::MP_IEC, 0, 64)?;
    let page_off = cmds::mode10_page_offset(&data);
    if !data.get(page_off).is_some_and(|b| b & 0x3F == cmds::MP_IEC) {
        return Err(SmartError::BadResponse("iec mode page"));
    }
    *mode_sense_len = 10;
    Ok(IecModePage {
        data,
        page_off,
        ten_byte: true,
    })
}

/// Enable informational exception reporting (and optionally temperature
/// warnings) by rewriting the IEC page
pub(crate) fn set_exception_control(
    dev: &mut dyn ScsiDevice,
    page: &mut IecModePage,
    enable_warnings: bool,
) -> Result<(), SmartError> {
    let off = page.page_off;
    if off + 3 >= page.data.len() {
        return Err(SmartError::BadResponse("iec mode page"));
    }
    page.data[off + 2] &= !0x08; // clear DEXCPT
    if enable_warnings {
        page.data[off + 2] |= 0x10; // set EWASC
    }
    // report on request keeps exceptions out of the command stream
    page.data[off + 3] = (page.data[off + 3] & 0xF0) | 0x06;
    if page.ten_byte {
        cmds::mode_select10(dev, &mut page.data)
    } else {
        cmds::mode_select6(dev, &mut page.data)
    }
}

/// Informational exception status out of log page 0x2F: `(asc, ascq,
/// temperature)`
pub(crate) fn ie_status(dev: &mut dyn ScsiDevice) -> Result<(u8, u8, Option<u8>), SmartError> {
    let data = cmds::log_sense(dev, cmds::LP_IE, 0)?;
    // parameter 0: additional sense code, qualifier, most recent temperature
    let param = find_log_param(&data, 0x0000).ok_or(SmartError::BadResponse("ie log page"))?;
    if param.len() < 7 {
        return Err(SmartError::BadResponse("ie log page"));
    }
    let temp = (param[6] != 0 && param[6] != 0xFF).then_some(param[6]);
    Ok((param[4], param[5], temp))
}

/// Current temperature out of log page 0x0D
pub(crate) fn temperature_from_log(dev: &mut dyn ScsiDevice) -> Result<Option<u8>, SmartError> {
    let data = cmds::log_sense(dev, cmds::LP_TEMPERATURE, 0)?;
    Ok(find_log_param(&data, 0x0000)
        .and_then(|param| param.get(5).copied())
        .filter(|t| *t != 0 && *t != 0xFF))
}

/// Locate one parameter of a log page by code, returning the full parameter
/// (header included)
pub(crate) fn find_log_param(data: &[u8], code: u16) -> Option<&[u8]> {
    let page_len = usize::from(unaligned::be16(data, 2));
    let end = data.len().min(4 + page_len);
    let mut off = 4;
    while off + 4 <= end {
        let param_len = 4 + usize::from(data[off + 3]);
        if off + param_len > end {
            return None;
        }
        if unaligned::be16(data, off) == code {
            return Some(&data[off..off + param_len]);
        }
        off += param_len;
    }
    None
}

/// One entry of the self-test results log page (0x10)
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct ScsiSelfTestResult {
    /// Parameter code (1 = most recent)
    pub code: u16,
    /// Self-test result nibble
    pub result: u8,
    /// Test number
    pub number: u8,
    /// Accumulated power-on hours at completion
    pub power_on_hours: u16,
    /// LBA of the first failure, all-ones when not applicable
    pub failing_lba: u64,
    /// Sense key/asc/ascq triple for failed tests
    pub sense: (u8, u8, u8),
}

impl ScsiSelfTestResult {
    /// Whether this entry records a failed test
    pub(crate) fn failed(&self) -> bool {
        matches!(self.result, 0x3..=0x7)
    }
}

/// Parse the self-test results log page (20-byte parameters)
pub(crate) fn parse_self_test_results(data: &[u8]) -> Vec<ScsiSelfTestResult> {
    let page_len = usize::from(unaligned::be16(data, 2));
    let end = data.len().min(4 + page_len);
    let mut results = Vec::new();
    let mut off = 4;
    while off + 20 <= end {
        if data[off + 3] != 0x10 {
            break;
        }
        let entry = ScsiSelfTestResult {
            code: unaligned::be16(data, off),
            result: data[off + 4] & 0x0F,
            number: data[off + 5],
            power_on_hours: unaligned::be16(data, off + 6),
            failing_lba: unaligned::be64(data, off + 8),
            sense: (data[off + 16] & 0x0F, data[off + 17], data[off + 18]),
        };
        // unused slots carry all-zero timestamps and results
        if entry.result != 0 || entry.power_on_hours != 0 || entry.number != 0 {
            results.push(entry);
        }
        off += 20;
    }
    results
}

/// Failed-test count and hour stamp of the most recent failure, mirroring
/// the ATA self-test log accounting
pub(crate) fn scsi_self_test_errors(data: &[u8]) -> (u32, u16) {
    let results = parse_self_test_results(data);
    let count = results.iter().filter(|r| r.failed()).count() as u32;
    // parameter 1 is the most recent result, codes increase with age
    let hour = results
        .iter()
        .filter(|r| r.failed())
        .min_by_key(|r| r.code)
        .map_or(0, |r| r.power_on_hours);
    (count, hour)
}

/// Background scan status codes (log page 0x15)
#[derive(Copy, Clone, Debug, Eq, PartialEq, strum::Display)]
pub(crate) enum BackgroundScanStatus {
    /// No scan active
    Idle,
    /// Scan active
    Active,
    /// Pre-scan active
    PreScan,
    /// Halted due to fatal error
    HaltedFatal,
    /// Halted due to vendor specific cause
    HaltedVendor,
    /// Halted due to temperature out of range
    HaltedTemperature,
    /// Waiting until BMS interval timer expires
    TimerWait,
    /// Reserved or unknown code
    Unknown,
}

/// Decode the background scan status parameter of log page 0x15
pub(crate) fn background_scan_status(data: &[u8]) -> Option<BackgroundScanStatus> {
    let param = find_log_param(data, 0x0000)?;
    let status = param.get(9)?;
    Some(match status {
        0 => BackgroundScanStatus::Idle,
        1 => BackgroundScanStatus::Active,
        2 => BackgroundScanStatus::PreScan,
        3 => BackgroundScanStatus::HaltedFatal,
        4..=6 => BackgroundScanStatus::HaltedVendor,
        7 => BackgroundScanStatus::HaltedTemperature,
        8 => BackgroundScanStatus::TimerWait,
        _ => BackgroundScanStatus::Unknown,
    })
}

/// TapeAlert severity, from the leading tag of the flag's description
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, strum::Display)]
pub(crate) enum TapeAlertSeverity {
    /// Informational
    Information,
    /// Warning
    Warning,
    /// Critical
    Critical,
}

/// One active TapeAlert flag
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct TapeAlert {
    /// 1-based flag number
    pub flag: u16,
    /// Severity from the standard description table
    pub severity: TapeAlertSeverity,
    /// Standard description
    pub message: &'static str,
}

/// Standard TapeAlert flag descriptions; the leading tag encodes severity
const TAPE_ALERT_TEXT: [&str; 20] = [
    "W: read warning",
    "W: write warning",
    "W: hard error",
    "C: media error",
    "C: read failure",
    "C: write failure",
    "W: media life",
    "W: not data grade",
    "C: write protect",
    "I: no removal",
    "I: cleaning media",
    "I: unsupported format",
    "C: recoverable mechanical cartridge failure",
    "C: unrecoverable mechanical cartridge failure",
    "W: memory chip in cartridge failure",
    "C: forced eject",
    "W: read only format",
    "W: tape directory corrupted on load",
    "I: nearing media life",
    "C: clean now",
];

/// Severity and text for a 1-based TapeAlert flag number
fn tape_alert_info(flag: u16) -> (TapeAlertSeverity, &'static str) {
    let text = TAPE_ALERT_TEXT
        .get(usize::from(flag).wrapping_sub(1))
        .copied()
        .unwrap_or("W: device-specific warning");
    let severity = match text.as_bytes().first() {
        Some(b'C') => TapeAlertSeverity::Critical,
        Some(b'I') => TapeAlertSeverity::Information,
        _ => TapeAlertSeverity::Warning,
    };
    (severity, text)
}

/// Active flags out of the TapeAlert log page (0x2E): 64 parameters of 5
/// bytes each
pub(crate) fn parse_tape_alerts(data: &[u8]) -> Vec<TapeAlert> {
    let page_len = usize::from(unaligned::be16(data, 2));
    let end = data.len().min(4 + page_len);
    let mut alerts = Vec::new();
    let mut off = 4;
    while off + 5 <= end {
        let code = unaligned::be16(data, off);
        let value = data[off + 4];
        if value != 0 && (1..=64).contains(&code) {
            let (severity, message) = tape_alert_info(code);
            alerts.push(TapeAlert {
                flag: code,
                severity,
                message,
            });
        }
        off += 5;
    }
    alerts
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::{
        device::{Context, ScsiCore},
        tests::MockTransport,
    };

    /// Log page with raw parameter bytes appended after the header
    fn log_page(page: u8, params: &[u8]) -> Vec<u8> {
        let mut data = vec![0u8; 4 + params.len()];
        data[0] = page;
        unaligned::put_be16(&mut data, 2, params.len() as u16);
        data[4..].copy_from_slice(params);
        data
    }

    #[test]
    fn iec_page_bits() {
        let mut data = vec![0u8; 16];
        data[3] = 0; // no block descriptors
        data[4] = cmds::MP_IEC;
        data[5] = 10;
        data[6] = 0x10; // EWASC set, DEXCPT clear
        data[7] = 0x06;
        let page = IecModePage {
            data,
            page_off: 4,
            ten_byte: false,
        };
        assert!(page.exceptions_enabled());
        assert!(page.warnings_enabled());
        assert_eq!(page.mrie(), 6);
    }

    #[test]
    fn iec_disabled_detected() {
        let mut data = vec![0u8; 16];
        data[4] = cmds::MP_IEC;
        data[6] = 0x08; // DEXCPT set
        let page = IecModePage {
            data,
            page_off: 4,
            ten_byte: false,
        };
        assert!(!page.exceptions_enabled());
    }

    #[test]
    fn fetch_iec_remembers_mode_sense_6() {
        let mut response = vec![0u8; 64];
        response[0] = 63;
        response[3] = 0;
        response[4] = cmds::MP_IEC;
        response[5] = 10;
        let mut transport = MockTransport::new(Vec::new());
        transport.data_in = vec![response];
        let mut dev = ScsiCore::new("/dev/mock", Box::new(transport), Context::default());
        let mut mode_len = 0u8;
        let page = fetch_iec(&mut dev, &mut mode_len).unwrap();
        assert_eq!(mode_len, 6);
        assert!(page.exceptions_enabled());
    }

    #[test]
    fn ie_status_param() {
        // param 0: code 0, flags, len 8, {asc, ascq, temp, ...}
        let params = [0x00, 0x00, 0x00, 0x08, 0x5D, 0x10, 0x2E, 0, 0, 0, 0, 0];
        let page = log_page(cmds::LP_IE, &params);
        let mut transport = MockTransport::new(Vec::new());
        transport.data_in = vec![vec![page[0], page[1], page[2], page[3]], page];
        let mut dev = ScsiCore::new("/dev/mock", Box::new(transport), Context::default());
        let (asc, ascq, temp) = ie_status(&mut dev).unwrap();
        assert_eq!(asc, 0x5D);
        assert_eq!(ascq, 0x10);
        assert_eq!(temp, Some(0x2E));
    }

    #[test]
    fn self_test_results_counts_failures() {
        // two parameters: one clean, one failed read test
        let mut params = vec![0u8; 40];
        // param 1, most recent, clean
        unaligned::put_be16(&mut params, 0, 1);
        params[3] = 0x10;
        params[4] = 0x00;
        params[5] = 1;
        unaligned::put_be16(&mut params, 6, 300);
        // param 2, older, failed
        unaligned::put_be16(&mut params, 20, 2);
        params[23] = 0x10;
        params[24] = 0x07;
        params[25] = 1;
        unaligned::put_be16(&mut params, 26, 120);
        let page = log_page(cmds::LP_SELF_TEST, &params);
        let results = parse_self_test_results(&page);
        assert_eq!(results.len(), 2);
        let (count, hour) = scsi_self_test_errors(&page);
        assert_eq!(count, 1);
        assert_eq!(hour, 120);
    }

    #[test]
    fn background_scan_codes() {
        let mut params = vec![0u8; 16];
        params[3] = 0x0C;
        params[9] = 3;
        let page = log_page(cmds::LP_BACKGROUND_SCAN, &params);
        assert_eq!(
            background_scan_status(&page),
            Some(BackgroundScanStatus::HaltedFatal)
        );
    }

    #[test]
    fn tape_alerts_active_flags() {
        let mut params = vec![0u8; 64 * 5];
        for (i, chunk) in params.chunks_mut(5).enumerate() {
            unaligned::put_be16(chunk, 0, (i + 1) as u16);
            chunk[3] = 1;
        }
        params[4 * 5 - 1] = 1; // flag 4: media error
        params[10 * 5 - 1] = 1; // flag 10: no removal
        let page = log_page(cmds::LP_TAPE_ALERTS, &params);
        let alerts = parse_tape_alerts(&page);
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].flag, 4);
        assert_eq!(alerts[0].severity, TapeAlertSeverity::Critical);
        assert_eq!(alerts[1].flag, 10);
        assert_eq!(alerts[1].severity, TapeAlertSeverity::Information);
    }
}
