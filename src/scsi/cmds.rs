//! Typed wrappers for the SCSI commands the monitor issues

use std::time::Duration;

use crate::{
    device::{DEFAULT_TIMEOUT, DataDir, SELF_TEST_TIMEOUT, ScsiDevice, SmartError,
        pass_through_checked},
    scsi::{SimpleErr, opcode, sense},
    unaligned,
};

/// Log page: supported pages
pub(crate) const LP_SUPPORTED_PAGES: u8 = 0x00;
/// Log page: self-test results
pub(crate) const LP_SELF_TEST: u8 = 0x10;
/// Log page: temperature
pub(crate) const LP_TEMPERATURE: u8 = 0x0D;
/// Log page: informational exceptions
pub(crate) const LP_IE: u8 = 0x2F;
/// Log page: background scan results
pub(crate) const LP_BACKGROUND_SCAN: u8 = 0x15;
/// Log page: TapeAlert
pub(crate) const LP_TAPE_ALERTS: u8 = 0x2E;

/// Mode page: informational exceptions control
pub(crate) const MP_IEC: u8 = 0x1C;

/// TapeAlert page response allocation (4-byte header + 64 x 5-byte
/// parameters)
const TAPE_ALERT_LEN: usize = 324;

/// Issue a CDB and fail unless the device answered GOOD
fn issue(
    dev: &mut dyn ScsiDevice,
    cdb: &[u8],
    dir: DataDir,
    buf: &mut [u8],
    timeout: Duration,
) -> Result<(), SmartError> {
    let completion = pass_through_checked(dev, cdb, dir, buf, timeout)?;
    let simple = completion.simple_err();
    if !simple.is_ok() {
        return Err(SmartError::Sense(simple));
    }
    Ok(())
}

/// Parsed standard INQUIRY response
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct StdInquiry {
    /// Peripheral device type, low 5 bits of byte 0
    pub peripheral_type: u8,
    /// Removable medium bit
    pub removable: bool,
    /// Vendor identification
    pub vendor: String,
    /// Product identification
    pub product: String,
    /// Product revision
    pub revision: String,
}

impl StdInquiry {
    /// Whether the vendor field carries the SATL bridge marker
    pub(crate) fn is_ata_bridge(&self) -> bool {
        self.vendor == "ATA"
    }

    /// Whether this is a tape (sequential access) device
    pub(crate) fn is_tape(&self) -> bool {
        self.peripheral_type == 0x01
    }
}

/// Trim an ASCII field out of an INQUIRY response
fn inquiry_field(data: &[u8], range: std::ops::Range<usize>) -> String {
    data.get(range)
        .map(|bytes| {
            bytes
                .iter()
                .map(|b| if (0x20..0x7F).contains(b) { char::from(*b) } else { ' ' })
                .collect::<String>()
                .trim()
                .to_owned()
        })
        .unwrap_or_default()
}

/// Standard INQUIRY (EVPD=0).
///
/// Fetched with a 36-byte allocation first; devices reporting a longer
/// additional length are re-queried with 64 bytes.
pub(crate) fn inquiry(dev: &mut dyn ScsiDevice) -> Result<StdInquiry, SmartError> {
    fn fetch(dev: &mut dyn ScsiDevice, data: &mut [u8; 64], len: u8) -> Result<(), SmartError> {
        let cdb = [opcode::INQUIRY, 0, 0, 0, len, 0];
        issue(
            dev,
            &cdb,
            DataDir::In,
            &mut data[..usize::from(len)],
            DEFAULT_TIMEOUT,
        )
    }
    let mut data = [0u8; 64];
    fetch(dev, &mut data, 36)?;
    if usize::from(data[4]) + 5 > 36 {
        fetch(dev, &mut data, 64)?;
    }
    Ok(StdInquiry {
        peripheral_type: data[0] & 0x1F,
        removable: data[1] & 0x80 != 0,
        vendor: inquiry_field(&data, 8..16),
        product: inquiry_field(&data, 16..32),
        revision: inquiry_field(&data, 32..36),
    })
}

/// INQUIRY with EVPD=1 for the given vital product data page.
///
/// Without a known length, a 4-byte probe reads the declared page length
/// before the full fetch.
pub(crate) fn inquiry_vpd(
    dev: &mut dyn ScsiDevice,
    page: u8,
    known_len: Option<usize>,
) -> Result<Vec<u8>, SmartError> {
    let len = match known_len {
        Some(len) => len,
        None => {
            let mut probe = [0u8; 4];
            let cdb = [opcode::INQUIRY, 0x01, page, 0, 4, 0];
            issue(dev, &cdb, DataDir::In, &mut probe, DEFAULT_TIMEOUT)?;
            if probe[1] != page {
                return Err(SmartError::BadResponse("vpd page"));
            }
            usize::from(probe[3]) + 4
        }
    };
    let mut data = vec![0u8; len];
    let mut cdb = [opcode::INQUIRY, 0x01, page, 0, 0, 0];
    unaligned::put_be16(&mut cdb, 3, len as u16);
    issue(dev, &cdb, DataDir::In, &mut data, DEFAULT_TIMEOUT)?;
    Ok(data)
}

/// TEST UNIT READY, classified
pub(crate) fn test_unit_ready(dev: &mut dyn ScsiDevice) -> Result<SimpleErr, SmartError> {
    let cdb = [opcode::TEST_UNIT_READY, 0, 0, 0, 0, 0];
    let mut buf = [0u8; 0];
    let completion = pass_through_checked(dev, &cdb, DataDir::None, &mut buf, DEFAULT_TIMEOUT)?;
    Ok(completion.simple_err())
}

/// REQUEST SENSE, normalized
pub(crate) fn request_sense(dev: &mut dyn ScsiDevice) -> Result<sense::SenseDisect, SmartError> {
    let mut data = [0u8; 32];
    let cdb = [opcode::REQUEST_SENSE, 0, 0, 0, data.len() as u8, 0];
    issue(dev, &cdb, DataDir::In, &mut data, DEFAULT_TIMEOUT)?;
    sense::normalize(&data).ok_or(SmartError::BadResponse("request sense"))
}

/// Build a LOG SENSE CDB for the given page/subpage and allocation
fn log_sense_cdb(page: u8, subpage: u8, alloc: usize) -> [u8; 10] {
    let mut cdb = [0u8; 10];
    cdb[0] = opcode::LOG_SENSE;
    cdb[2] = 0x40 | (page & 0x3F); // current cumulative values
    cdb[3] = subpage;
    unaligned::put_be16(&mut cdb, 7, alloc as u16);
    cdb
}

/// LOG SENSE with the twin-fetch strategy: read the 4-byte header for the
/// declared page length, then refetch exactly that much, padding odd lengths
/// to even.
///
/// The TapeAlert page is an exception: reading it clears its state, so it is
/// fetched in one shot.
pub(crate) fn log_sense(
    dev: &mut dyn ScsiDevice,
    page: u8,
    subpage: u8,
) -> Result<Vec<u8>, SmartError> {
    if page == LP_TAPE_ALERTS {
        let mut data = vec![0u8; TAPE_ALERT_LEN];
        let cdb = log_sense_cdb(page, subpage, data.len());
        issue(dev, &cdb, DataDir::In, &mut data, DEFAULT_TIMEOUT)?;
        return Ok(data);
    }
    let mut header = [0u8; 4];
    let cdb = log_sense_cdb(page, subpage, header.len());
    issue(dev, &cdb, DataDir::In, &mut header, DEFAULT_TIMEOUT)?;
    if header[0] & 0x3F != page && page != LP_SUPPORTED_PAGES {
        return Err(SmartError::BadResponse("log page"));
    }
    let declared = usize::from(unaligned::be16(&header, 2));
    if declared == 0 {
        return Err(SmartError::BadResponse("log page"));
    }
    let mut len = declared + 4;
    if len % 2 != 0 {
        // some HBAs reject odd-length transfers
        len += 1;
    }
    let mut data = vec![0u8; len];
    let cdb = log_sense_cdb(page, subpage, data.len());
    issue(dev, &cdb, DataDir::In, &mut data, DEFAULT_TIMEOUT)?;
    Ok(data)
}

/// Supported log pages out of page 0x00
pub(crate) fn supported_log_pages(dev: &mut dyn ScsiDevice) -> Result<Vec<u8>, SmartError> {
    let data = log_sense(dev, LP_SUPPORTED_PAGES, 0)?;
    let len = usize::from(unaligned::be16(&data, 2));
    let end = (4 + len).min(data.len());
    Ok(data.get(4..end).unwrap_or_default().to_vec())
}

/// MODE SENSE (6)
pub(crate) fn mode_sense6(
    dev: &mut dyn ScsiDevice,
    page: u8,
    subpage: u8,
    alloc: u8,
) -> Result<Vec<u8>, SmartError> {
    let cdb = [
        opcode::MODE_SENSE_6,
        0,
        page & 0x3F,
        subpage,
        alloc,
        0,
    ];
    let mut data = vec![0u8; usize::from(alloc)];
    issue(dev, &cdb, DataDir::In, &mut data, DEFAULT_TIMEOUT)?;
    Ok(data)
}

/// MODE SENSE (10)
pub(crate) fn mode_sense10(
    dev: &mut dyn ScsiDevice,
    page: u8,
    subpage: u8,
    alloc: u16,
) -> Result<Vec<u8>, SmartError> {
    let mut cdb = [0u8; 10];
    cdb[0] = opcode::MODE_SENSE_10;
    cdb[2] = page & 0x3F;
    cdb[3] = subpage;
    unaligned::put_be16(&mut cdb, 7, alloc);
    let mut data = vec![0u8; usize::from(alloc)];
    issue(dev, &cdb, DataDir::In, &mut data, DEFAULT_TIMEOUT)?;
    Ok(data)
}

/// Offset of the first mode page in a MODE SENSE (6) response
pub(crate) fn mode6_page_offset(data: &[u8]) -> usize {
    4 + usize::from(*data.get(3).unwrap_or(&0))
}

/// Offset of the first mode page in a MODE SENSE (10) response
pub(crate) fn mode10_page_offset(data: &[u8]) -> usize {
    if data.len() < 8 {
        return 8;
    }
    8 + usize::from(unaligned::be16(data, 6))
}

/// MODE SELECT (6), rewriting a buffer previously read with MODE SENSE (6).
///
/// The response-length field is zeroed and the PS bit cleared, as devices
/// reject them on select.
pub(crate) fn mode_select6(dev: &mut dyn ScsiDevice, data: &mut [u8]) -> Result<(), SmartError> {
    data[0] = 0;
    let off = mode6_page_offset(data);
    if off < data.len() {
        data[off] &= 0x7F;
    }
    let cdb = [
        opcode::MODE_SELECT_6,
        0x10, // page format
        0,
        0,
        data.len() as u8,
        0,
    ];
    issue(dev, &cdb, DataDir::Out, data, DEFAULT_TIMEOUT)
}

/// MODE SELECT (10), rewriting a buffer previously read with MODE SENSE (10)
pub(crate) fn mode_select10(dev: &mut dyn ScsiDevice, data: &mut [u8]) -> Result<(), SmartError> {
    data[0] = 0;
    data[1] = 0;
    let off = mode10_page_offset(data);
    if off < data.len() {
        data[off] &= 0x7F;
    }
    let mut cdb = [0u8; 10];
    cdb[0] = opcode::MODE_SELECT_10;
    cdb[1] = 0x10;
    unaligned::put_be16(&mut cdb, 7, data.len() as u16);
    issue(dev, &cdb, DataDir::Out, data, DEFAULT_TIMEOUT)
}

/// Parsed READ CAPACITY result
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct Capacity {
    /// Total addressable blocks
    pub num_blocks: u64,
    /// Logical block size in bytes
    pub block_size: u32,
    /// Protection type (0 = none), from the 16-byte variant
    pub prot_type: u8,
    /// Logical blocks per physical block exponent
    pub lb_per_pb_exp: u8,
    /// Logical block provisioning management enabled
    pub lbpme: bool,
    /// Unmapped blocks read as zero
    pub lbprz: bool,
}

/// READ CAPACITY (10), promoted to (16) when the device overflows the
/// 32-bit LBA field or the caller asks for the extended form
pub(crate) fn read_capacity(
    dev: &mut dyn ScsiDevice,
    prefer16: bool,
) -> Result<Capacity, SmartError> {
    if !prefer16 {
        let cdb = [opcode::READ_CAPACITY_10, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let mut data = [0u8; 8];
        issue(dev, &cdb, DataDir::In, &mut data, DEFAULT_TIMEOUT)?;
        let last_lba = unaligned::be32(&data, 0);
        if last_lba != u32::MAX {
            return Ok(Capacity {
                num_blocks: u64::from(last_lba) + 1,
                block_size: unaligned::be32(&data, 4),
                ..Capacity::default()
            });
        }
    }
    let mut cdb = [0u8; 16];
    cdb[0] = opcode::SERVICE_ACTION_IN_16;
    cdb[1] = 0x10; // READ CAPACITY (16)
    let mut data = [0u8; 32];
    unaligned::put_be32(&mut cdb, 10, data.len() as u32);
    issue(dev, &cdb, DataDir::In, &mut data, DEFAULT_TIMEOUT)?;
    Ok(Capacity {
        num_blocks: unaligned::be64(&data, 0) + 1,
        block_size: unaligned::be32(&data, 8),
        prot_type: (data[12] >> 1) & 0x07,
        lb_per_pb_exp: data[13] & 0x0F,
        lbpme: data[14] & 0x80 != 0,
        lbprz: data[14] & 0x40 != 0,
    })
}

/// REPORT SUPPORTED OPERATION CODES for one opcode; returns the CDB usage
/// data when the command is supported
pub(crate) fn report_supported_opcode(
    dev: &mut dyn ScsiDevice,
    op: u8,
) -> Result<Option<Vec<u8>>, SmartError> {
    let mut cdb = [0u8; 12];
    cdb[0] = opcode::MAINTENANCE_IN_12;
    cdb[1] = 0x0C; // REPORT SUPPORTED OPERATION CODES
    cdb[2] = 0x01; // one command format
    cdb[3] = op;
    let mut data = [0u8; 64];
    unaligned::put_be32(&mut cdb, 6, data.len() as u32);
    issue(dev, &cdb, DataDir::In, &mut data, DEFAULT_TIMEOUT)?;
    let support = data[1] & 0x07;
    if support != 0x03 {
        return Ok(None);
    }
    let cdb_size = usize::from(unaligned::be16(&data, 2));
    Ok(Some(
        data.get(4..4 + cdb_size).unwrap_or_default().to_vec(),
    ))
}

/// Per-device command support bitmap, populated from REPORT SUPPORTED
/// OPERATION CODES
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct OpcodeSupport {
    /// RSOC itself answered
    pub rsoc: bool,
    /// LOG SENSE supported
    pub log_sense: bool,
    /// LOG SENSE accepts a subpage code
    pub log_sense_subpages: bool,
    /// READ CAPACITY (16) supported
    pub read_capacity16: bool,
}

/// Probe command support for the opcodes the monitor relies on
pub(crate) fn probe_opcode_support(dev: &mut dyn ScsiDevice) -> OpcodeSupport {
    let mut support = OpcodeSupport::default();
    let Ok(log_sense_usage) = report_supported_opcode(dev, opcode::LOG_SENSE) else {
        return support;
    };
    support.rsoc = true;
    if let Some(usage) = log_sense_usage {
        support.log_sense = true;
        // byte 3 of the usage bitmap marks the subpage code field
        support.log_sense_subpages = usage.get(3).is_some_and(|b| *b != 0);
    }
    support.read_capacity16 = matches!(
        report_supported_opcode(dev, opcode::SERVICE_ACTION_IN_16),
        Ok(Some(_))
    );
    support
}

/// SCSI self-test variants launched through SEND DIAGNOSTIC
#[derive(Copy, Clone, Debug, Eq, PartialEq, strum::Display)]
pub(crate) enum ScsiSelfTest {
    /// Background short self-test
    ShortBackground,
    /// Background extended self-test
    LongBackground,
}

/// SEND DIAGNOSTIC launching the given self-test
pub(crate) fn send_diagnostic(
    dev: &mut dyn ScsiDevice,
    test: ScsiSelfTest,
) -> Result<(), SmartError> {
    let byte1 = match test {
        ScsiSelfTest::ShortBackground => 1 << 5,
        ScsiSelfTest::LongBackground => 2 << 5,
    };
    let cdb = [opcode::SEND_DIAGNOSTIC, byte1, 0, 0, 0, 0];
    let mut buf = [0u8; 0];
    issue(dev, &cdb, DataDir::None, &mut buf, SELF_TEST_TIMEOUT)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::{
        device::{Context, ScsiCore},
        tests::MockTransport,
    };

    fn scsi_dev(transport: MockTransport) -> ScsiCore {
        ScsiCore::new("/dev/mock", Box::new(transport), Context::default())
    }

    /// 36-byte INQUIRY response with the given vendor/product
    fn inquiry_data(vendor: &[u8; 8], product: &[u8; 16]) -> Vec<u8> {
        let mut data = vec![0u8; 36];
        data[4] = 31; // additional length
        data[8..16].copy_from_slice(vendor);
        data[16..32].copy_from_slice(product);
        data[32..36].copy_from_slice(b"1.02");
        data
    }

    #[test]
    fn inquiry_parses_fields() {
        let mut transport = MockTransport::new(Vec::new());
        transport.data_in = vec![inquiry_data(b"SEAGATE ", b"ST2000NM0001    ")];
        let mut dev = scsi_dev(transport);
        let inq = inquiry(&mut dev).unwrap();
        assert_eq!(inq.vendor, "SEAGATE");
        assert_eq!(inq.product, "ST2000NM0001");
        assert_eq!(inq.revision, "1.02");
        assert!(!inq.is_ata_bridge());
        assert!(!inq.is_tape());
    }

    #[test]
    fn inquiry_detects_satl_bridge() {
        let mut transport = MockTransport::new(Vec::new());
        transport.data_in = vec![inquiry_data(b"ATA     ", b"WDC WD40EZRX    ")];
        let mut dev = scsi_dev(transport);
        assert!(inquiry(&mut dev).unwrap().is_ata_bridge());
    }

    #[test]
    fn inquiry_refetches_long_response() {
        let mut first = inquiry_data(b"LSI     ", b"MegaRAID        ");
        first[4] = 59; // declares 64 bytes total
        let second = inquiry_data(b"LSI2    ", b"MegaRAID        ");
        let mut transport = MockTransport::new(Vec::new());
        transport.data_in = vec![first, second];
        let mut dev = scsi_dev(transport);
        // the parsed result comes from the 64-byte refetch
        assert_eq!(inquiry(&mut dev).unwrap().vendor, "LSI2");
    }

    #[test]
    fn log_sense_twin_fetch_pads_odd_length() {
        // temperature page declaring 11 bytes of parameters
        let mut header = vec![0u8; 4];
        header[0] = LP_TEMPERATURE;
        unaligned::put_be16(&mut header, 2, 11);
        let mut full = vec![0u8; 16];
        full[0] = LP_TEMPERATURE;
        unaligned::put_be16(&mut full, 2, 11);
        let mut transport = MockTransport::new(Vec::new());
        transport.data_in = vec![header, full];
        let mut dev = scsi_dev(transport);
        let data = log_sense(&mut dev, LP_TEMPERATURE, 0).unwrap();
        // 11 + 4 = 15, padded to 16
        assert_eq!(data.len(), 16);
    }

    #[test]
    fn read_capacity_promotes_to_16() {
        let mut rc10 = vec![0u8; 8];
        unaligned::put_be32(&mut rc10, 0, u32::MAX);
        unaligned::put_be32(&mut rc10, 4, 512);
        let mut rc16 = vec![0u8; 32];
        // 6 TB of 512-byte blocks
        let last = 11_721_045_167u64;
        for (i, b) in last.to_be_bytes().iter().enumerate() {
            rc16[i] = *b;
        }
        unaligned::put_be32(&mut rc16, 8, 512);
        rc16[12] = 0x02; // protection type 1 enabled
        rc16[13] = 0x03; // 8 logical per physical
        rc16[14] = 0x80;
        let mut transport = MockTransport::new(Vec::new());
        transport.data_in = vec![rc10, rc16];
        let mut dev = scsi_dev(transport);
        let capacity = read_capacity(&mut dev, false).unwrap();
        assert_eq!(capacity.num_blocks, last + 1);
        assert_eq!(capacity.block_size, 512);
        assert_eq!(capacity.prot_type, 1);
        assert_eq!(capacity.lb_per_pb_exp, 3);
        assert!(capacity.lbpme);
        assert!(!capacity.lbprz);
    }

    #[test]
    fn read_capacity_10_sufficient() {
        let mut rc10 = vec![0u8; 8];
        unaligned::put_be32(&mut rc10, 0, 3_906_250_000u32.min(u32::MAX - 1));
        unaligned::put_be32(&mut rc10, 4, 512);
        let mut transport = MockTransport::new(Vec::new());
        transport.data_in = vec![rc10];
        let mut dev = scsi_dev(transport);
        let capacity = read_capacity(&mut dev, false).unwrap();
        assert_eq!(capacity.num_blocks, 3_906_250_001);
    }

    #[test]
    fn rsoc_subpage_probe() {
        // LOG SENSE supported, subpage byte set in the usage bitmap
        let mut rsoc_log = vec![0u8; 64];
        rsoc_log[1] = 0x03;
        unaligned::put_be16(&mut rsoc_log, 2, 10);
        rsoc_log[4 + 3] = 0xFF;
        // RC16 unsupported
        let rsoc_rc16 = vec![0u8; 64];
        let mut transport = MockTransport::new(Vec::new());
        transport.data_in = vec![rsoc_log, rsoc_rc16];
        let mut dev = scsi_dev(transport);
        let support = probe_opcode_support(&mut dev);
        assert!(support.rsoc);
        assert!(support.log_sense);
        assert!(support.log_sense_subpages);
        assert!(!support.read_capacity16);
    }

    #[test]
    fn mode_select_clears_ps_and_length() {
        // MODE SENSE(6): header {len, medium, dev-specific, bd len 8},
        // 8-byte block descriptor, then IEC page with PS bit set
        let mut data = vec![0u8; 24];
        data[0] = 23;
        data[3] = 8;
        data[12] = 0x80 | MP_IEC;
        data[13] = 10;
        let transport = MockTransport::new(Vec::new());
        let mut dev = scsi_dev(transport);
        mode_select6(&mut dev, &mut data).unwrap();
        assert_eq!(data[0], 0);
        assert_eq!(data[12], MP_IEC);
    }
}
