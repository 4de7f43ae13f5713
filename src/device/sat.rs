//! SCSI-to-ATA tunnelling: SAT ATA PASS-THROUGH (12/16) and the Cypress USB
//! bridge vendor CDB
//!
//! Implements [`AtaDevice`] on top of an owned [`ScsiDevice`]: the input
//! taskfile is packed into a CDB, and the completed taskfile is recovered
//! from the ATA Return Descriptor of descriptor-format sense data.

use std::time::Duration;

use crate::{
    ata::{AtaData, AtaInRegs, AtaOutRegs, OutRegsNeeded, cmds as ata_cmds},
    device::{
        DEFAULT_TIMEOUT, DataDir, ScsiCompletion, ScsiDevice, SmartError, pass_through_checked,
        status,
    },
    scsi::{SimpleErr, asc, sense, sense_key},
};

/// ATA PASS-THROUGH (16) opcode
const SAT_16: u8 = 0x85;

/// ATA PASS-THROUGH (12) opcode
const SAT_12: u8 = 0xA1;

/// Default Cypress ATACB vendor signature
pub(crate) const CYPRESS_DEFAULT_SIGNATURE: u8 = 0x24;

/// Cypress ATACB subcommand byte
const CYPRESS_SUBCOMMAND: u8 = 0x24;

/// SAT protocol field: non-data
const PROTO_NON_DATA: u8 = 3;
/// SAT protocol field: PIO data-in
const PROTO_PIO_IN: u8 = 4;
/// SAT protocol field: PIO data-out
const PROTO_PIO_OUT: u8 = 5;

/// CDB length of the SAT ATA PASS-THROUGH command
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub(crate) enum SatCdbLen {
    /// 12-byte CDB, 28-bit commands only
    Cdb12 = 12,
    /// 16-byte CDB, supports the 48-bit register set
    Cdb16 = 16,
}

/// Wire parameters shared by both CDB encodings
struct SatPhase {
    /// SAT protocol field
    protocol: u8,
    /// Device-to-host transfer
    t_dir: u8,
    /// Transfer unit is 512-byte blocks
    byte_block: u8,
    /// Length specifier: 2 = sector_count register holds the block count
    t_length: u8,
}

impl SatPhase {
    /// Derive wire parameters from the data phase
    fn from_data(data: &AtaData<'_>) -> Self {
        match data {
            AtaData::None => Self {
                protocol: PROTO_NON_DATA,
                t_dir: 1,
                byte_block: 1,
                t_length: 0,
            },
            AtaData::In(_) => Self {
                protocol: PROTO_PIO_IN,
                t_dir: 1,
                byte_block: 1,
                t_length: 2,
            },
            AtaData::Out(_) => Self {
                protocol: PROTO_PIO_OUT,
                t_dir: 0,
                byte_block: 1,
                t_length: 2,
            },
        }
    }

    /// Flags byte at CDB offset 2
    fn flags(&self, ck_cond: bool) -> u8 {
        (u8::from(ck_cond) << 5) | (self.t_dir << 3) | (self.byte_block << 2) | self.t_length
    }
}

/// Encode the 16-byte ATA PASS-THROUGH CDB
pub(crate) fn encode_cdb16(regs: &AtaInRegs, data: &AtaData<'_>, ck_cond: bool) -> [u8; 16] {
    let phase = SatPhase::from_data(data);
    let prev = regs.prev.unwrap_or_default();
    let mut cdb = [0u8; 16];
    cdb[0] = SAT_16;
    cdb[1] = (phase.protocol << 1) | u8::from(regs.is_48bit());
    cdb[2] = phase.flags(ck_cond);
    cdb[3] = prev.features;
    cdb[4] = regs.features;
    cdb[5] = prev.sector_count;
    cdb[6] = regs.sector_count;
    cdb[7] = prev.lba_low;
    cdb[8] = regs.lba_low;
    cdb[9] = prev.lba_mid;
    cdb[10] = regs.lba_mid;
    cdb[11] = prev.lba_high;
    cdb[12] = regs.lba_high;
    cdb[13] = regs.device;
    cdb[14] = regs.command;
    cdb
}

/// Encode the 12-byte ATA PASS-THROUGH CDB.
///
/// 48-bit commands cannot be expressed in this form and are rejected before
/// any I/O is issued.
pub(crate) fn encode_cdb12(
    regs: &AtaInRegs,
    data: &AtaData<'_>,
    ck_cond: bool,
) -> Result<[u8; 12], SmartError> {
    if regs.is_48bit() {
        return Err(SmartError::Unsupported(
            "48-bit ATA commands require ATA PASS-THROUGH (16)",
        ));
    }
    let phase = SatPhase::from_data(data);
    let mut cdb = [0u8; 12];
    cdb[0] = SAT_12;
    cdb[1] = phase.protocol << 1;
    cdb[2] = phase.flags(ck_cond);
    cdb[3] = regs.features;
    cdb[4] = regs.sector_count;
    cdb[5] = regs.lba_low;
    cdb[6] = regs.lba_mid;
    cdb[7] = regs.lba_high;
    cdb[8] = regs.device;
    cdb[9] = regs.command;
    Ok(cdb)
}

/// Decode the completed taskfile out of an ATA Return Descriptor
fn decode_ata_return(ard: &[u8], regs_48bit: bool) -> AtaOutRegs {
    let hi = |idx: usize| -> u16 {
        if regs_48bit {
            u16::from(ard[idx]) << 8
        } else {
            0
        }
    };
    AtaOutRegs {
        error: ard[3],
        sector_count: hi(4) | u16::from(ard[5]),
        lba_low: hi(6) | u16::from(ard[7]),
        lba_mid: hi(8) | u16::from(ard[9]),
        lba_high: hi(10) | u16::from(ard[11]),
        device: ard[12],
        status: ard[13],
    }
}

/// Whether descriptor-format sense announces ATA PASS THROUGH INFORMATION
/// AVAILABLE
fn ata_info_available(disect: &sense::SenseDisect) -> bool {
    disect.is_descriptor_format()
        && matches!(
            disect.sense_key,
            sense_key::NO_SENSE | sense_key::RECOVERED_ERROR
        )
        && disect.asc == 0
        && disect.ascq == asc::ASCQ_ATA_PT_INFO_AVAILABLE
}

/// Interpret the SCSI completion of a SAT pass-through
fn classify_completion(
    completion: &ScsiCompletion,
    ck_cond: bool,
    regs_48bit: bool,
) -> Result<AtaOutRegs, SmartError> {
    let disect = (completion.status == status::CHECK_CONDITION)
        .then(|| sense::normalize(&completion.sense))
        .flatten();
    let ard = sense::find_descriptor(&completion.sense, sense::DESC_ATA_RETURN)
        .filter(|a| a.len() >= 14);
    if let Some(disect) = &disect {
        let simple = sense::simple_filter(disect);
        if !simple.is_ok() {
            return Err(SmartError::Sense(simple));
        }
    }
    if ck_cond {
        // the forced CHECK CONDITION must carry the completed taskfile
        return match ard {
            Some(ard) => Ok(decode_ata_return(ard, regs_48bit)),
            None => Err(SmartError::SatNoAtaDescriptor),
        };
    }
    if let (Some(disect), Some(ard)) = (disect.as_ref(), ard) {
        if ata_info_available(disect) {
            return Ok(decode_ata_return(ard, regs_48bit));
        }
    }
    Ok(AtaOutRegs::default())
}

/// ATA device tunnelled through SAT ATA PASS-THROUGH CDBs
pub(crate) struct SatTunnel {
    /// Tunnelled SCSI device
    inner: Box<dyn ScsiDevice>,
    /// Selected pass-through CDB length
    cdb_len: SatCdbLen,
}

impl SatTunnel {
    /// Wrap a SCSI device
    pub(crate) fn new(inner: Box<dyn ScsiDevice>, cdb_len: SatCdbLen) -> Self {
        Self { inner, cdb_len }
    }
}

impl super::AtaDevice for SatTunnel {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn last_error(&self) -> Option<&super::DeviceError> {
        self.inner.last_error()
    }

    fn open(&mut self) -> Result<(), SmartError> {
        self.inner.open()
    }

    fn close(&mut self) {
        self.inner.close();
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn ata_pass_through(
        &mut self,
        regs: &AtaInRegs,
        data: AtaData<'_>,
        needed: &OutRegsNeeded,
        timeout: Duration,
    ) -> Result<AtaOutRegs, SmartError> {
        let ck_cond = needed.any();
        let cdb16;
        let cdb12;
        let cdb: &[u8] = match self.cdb_len {
            SatCdbLen::Cdb16 => {
                cdb16 = encode_cdb16(regs, &data, ck_cond);
                &cdb16
            }
            SatCdbLen::Cdb12 => {
                cdb12 = encode_cdb12(regs, &data, ck_cond)?;
                &cdb12
            }
        };
        let mut out_copy;
        let mut no_data = [0u8; 0];
        let (dir, buf): (DataDir, &mut [u8]) = match data {
            AtaData::None => (DataDir::None, &mut no_data),
            AtaData::In(b) => (DataDir::In, b),
            AtaData::Out(b) => {
                out_copy = b.to_vec();
                (DataDir::Out, &mut out_copy)
            }
        };
        let completion = pass_through_checked(&mut *self.inner, cdb, dir, buf, timeout)?;
        classify_completion(&completion, ck_cond, regs.is_48bit())
    }
}

/// ATA device behind a Cypress USB-to-ATA bridge.
///
/// The bridge has no ATA Return Descriptor; output registers are read back
/// with a second vendor CDB, which leaves a window where an interleaved
/// command can clobber the taskfile. That readback is best effort.
pub(crate) struct UsbCypress {
    /// Tunnelled SCSI device
    inner: Box<dyn ScsiDevice>,
    /// Vendor CDB signature byte
    signature: u8,
}

/// Encode the 16-byte vendor ATACB CDB
fn encode_cypress_cdb(signature: u8, regs: &AtaInRegs, data: &AtaData<'_>) -> [u8; 16] {
    let mut cdb = [0u8; 16];
    cdb[0] = signature;
    cdb[1] = CYPRESS_SUBCOMMAND;
    if matches!(
        regs.command,
        ata_cmds::CMD_IDENTIFY_DEVICE | ata_cmds::CMD_IDENTIFY_PACKET_DEVICE
    ) {
        cdb[2] |= 1 << 7; // identify response needs the bridge's byte swap
    }
    // register-select mask: features, sector count, all LBA and command
    cdb[3] = 0xFF - (1 << 0) - (1 << 6);
    cdb[4] = u8::from(!matches!(data, AtaData::None)); // 512-byte blocks
    cdb[6] = regs.features;
    cdb[7] = regs.sector_count;
    cdb[8] = regs.lba_low;
    cdb[9] = regs.lba_mid;
    cdb[10] = regs.lba_high;
    cdb[12] = regs.command;
    cdb
}

impl UsbCypress {
    /// Wrap a SCSI device
    pub(crate) fn new(inner: Box<dyn ScsiDevice>, signature: u8) -> Self {
        Self { inner, signature }
    }

    /// Read the completed taskfile back with a second CDB
    fn read_taskfile(&mut self, cdb: &mut [u8; 16], timeout: Duration) -> Result<AtaOutRegs, SmartError> {
        cdb[2] = 1 << 0; // read taskfile instead of executing
        let mut regs_buf = [0u8; 8];
        let completion = self
            .inner
            .scsi_pass_through(cdb, DataDir::In, &mut regs_buf, timeout)?;
        if completion.status == status::CHECK_CONDITION
            && sense::normalize(&completion.sense).is_some()
        {
            return Err(SmartError::UsbTaskfileRace);
        }
        Ok(AtaOutRegs {
            error: regs_buf[1],
            sector_count: u16::from(regs_buf[2]),
            lba_low: u16::from(regs_buf[3]),
            lba_mid: u16::from(regs_buf[4]),
            lba_high: u16::from(regs_buf[5]),
            device: regs_buf[6],
            status: regs_buf[7],
        })
    }
}

impl super::AtaDevice for UsbCypress {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn last_error(&self) -> Option<&super::DeviceError> {
        self.inner.last_error()
    }

    fn open(&mut self) -> Result<(), SmartError> {
        self.inner.open()
    }

    fn close(&mut self) {
        self.inner.close();
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn ata_pass_through(
        &mut self,
        regs: &AtaInRegs,
        data: AtaData<'_>,
        needed: &OutRegsNeeded,
        timeout: Duration,
    ) -> Result<AtaOutRegs, SmartError> {
        if regs.is_48bit() {
            return Err(SmartError::Unsupported(
                "48-bit ATA commands not supported by the Cypress bridge",
            ));
        }
        let mut cdb = encode_cypress_cdb(self.signature, regs, &data);
        let mut out_copy;
        let mut no_data = [0u8; 0];
        let (dir, buf): (DataDir, &mut [u8]) = match data {
            AtaData::None => (DataDir::None, &mut no_data),
            AtaData::In(b) => (DataDir::In, b),
            AtaData::Out(b) => {
                out_copy = b.to_vec();
                (DataDir::Out, &mut out_copy)
            }
        };
        let completion = pass_through_checked(&mut *self.inner, &cdb, dir, buf, timeout)?;
        if completion.status == status::CHECK_CONDITION {
            if let Some(disect) = sense::normalize(&completion.sense) {
                return Err(SmartError::Sense(sense::simple_filter(&disect)));
            }
        }
        if needed.any() {
            return self.read_taskfile(&mut cdb, timeout);
        }
        Ok(AtaOutRegs::default())
    }
}

/// Taskfile probing for SAT/Cypress detection: IDENTIFY DEVICE, one block in
fn identify_regs() -> AtaInRegs {
    AtaInRegs {
        command: ata_cmds::CMD_IDENTIFY_DEVICE,
        sector_count: 1,
        ..AtaInRegs::default()
    }
}

/// Probe a SCSI device for SAT support with an IDENTIFY DEVICE through the
/// 16-byte pass-through
pub(crate) fn probe_sat(dev: &mut dyn ScsiDevice) -> bool {
    let mut id = [0u8; 512];
    let cdb = encode_cdb16(&identify_regs(), &AtaData::In(&mut id), false);
    match pass_through_checked(dev, &cdb, DataDir::In, &mut id, DEFAULT_TIMEOUT) {
        Ok(completion) if completion.simple_err() == SimpleErr::Ok => {
            ata_cmds::identify_valid(&id)
        }
        _ => false,
    }
}

/// Probe a SCSI device for the Cypress bridge: IDENTIFY DEVICE through the
/// vendor CDB, then sanity-check that model/serial/firmware are printable
/// ASCII
pub(crate) fn probe_cypress(dev: &mut dyn ScsiDevice, signature: u8) -> bool {
    let mut id = [0u8; 512];
    let cdb = encode_cypress_cdb(signature, &identify_regs(), &AtaData::In(&mut id));
    match pass_through_checked(dev, &cdb, DataDir::In, &mut id, DEFAULT_TIMEOUT) {
        Ok(completion) if completion.simple_err() == SimpleErr::Ok => [
            ata_cmds::ata_string(&id, 27, 20),
            ata_cmds::ata_string(&id, 10, 10),
            ata_cmds::ata_string(&id, 23, 4),
        ]
        .iter()
        .all(|s| s.bytes().all(|b| (0x20..0x7F).contains(&b))),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::{super::AtaDevice as _, *};
    use crate::{
        ata::AtaPrevRegs,
        device::{Context, ScsiCore},
        tests::{MockTransport, check_condition_sense},
    };

    /// Canonical SAT descriptor sense after SMART RETURN STATUS on a
    /// healthy drive
    const HEALTHY_SENSE: [u8; 22] = [
        0x72, 0x00, 0x00, 0x1D, 0x00, 0x00, 0x00, 0x0E, //
        0x09, 0x0C, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, //
        0x00, 0x4F, 0x00, 0xC2, 0x40, 0x50,
    ];

    /// Same sense with the failing-drive signature in lba mid/high
    const FAILING_SENSE: [u8; 22] = [
        0x72, 0x00, 0x00, 0x1D, 0x00, 0x00, 0x00, 0x0E, //
        0x09, 0x0C, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, //
        0x00, 0xF4, 0x00, 0x2C, 0x40, 0x50,
    ];

    fn smart_status_regs() -> AtaInRegs {
        AtaInRegs::smart(0xDA)
    }

    #[test]
    fn cdb16_smart_return_status() {
        let cdb = encode_cdb16(&smart_status_regs(), &AtaData::None, true);
        assert_eq!(
            cdb,
            [
                0x85, 0x06, 0x2C, 0x00, 0xDA, 0x00, 0x00, 0x00, //
                0x00, 0x00, 0x4F, 0x00, 0xC2, 0x00, 0xB0, 0x00,
            ]
        );
    }

    #[test]
    fn cdb16_identify() {
        let regs = AtaInRegs {
            command: 0xEC,
            sector_count: 1,
            ..AtaInRegs::default()
        };
        let mut buf = [0u8; 512];
        let cdb = encode_cdb16(&regs, &AtaData::In(&mut buf), false);
        assert_eq!(
            cdb,
            [
                0x85, 0x08, 0x0E, 0x00, 0x00, 0x00, 0x01, 0x00, //
                0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xEC, 0x00,
            ]
        );
    }

    #[test]
    fn cdb16_48bit_read_log_ext() {
        let regs = AtaInRegs {
            command: 0x2F,
            sector_count: 1,
            lba_low: 0x09,
            prev: Some(AtaPrevRegs::default()),
            ..AtaInRegs::default()
        };
        let mut buf = [0u8; 512];
        let cdb = encode_cdb16(&regs, &AtaData::In(&mut buf), false);
        assert_eq!(cdb[0], 0x85);
        assert_eq!(cdb[1], (PROTO_PIO_IN << 1) | 1); // extend set
        assert_eq!(cdb[8], 0x09);
        assert_eq!(cdb[14], 0x2F);
        assert_eq!(cdb[15], 0x00);
    }

    #[test]
    fn cdb12_rejects_48bit_without_io() {
        let regs = AtaInRegs {
            command: 0x25,
            prev: Some(AtaPrevRegs::default()),
            ..AtaInRegs::default()
        };
        let err = encode_cdb12(&regs, &AtaData::None, false).unwrap_err();
        assert!(matches!(err, SmartError::Unsupported(_)));
    }

    #[test]
    fn cdb12_smart_read_data() {
        let regs = AtaInRegs {
            sector_count: 1,
            ..AtaInRegs::smart(0xD0)
        };
        let mut buf = [0u8; 512];
        let cdb = encode_cdb12(&regs, &AtaData::In(&mut buf), false).unwrap();
        assert_eq!(
            cdb,
            [0xA1, 0x08, 0x0E, 0xD0, 0x01, 0x00, 0x4F, 0xC2, 0x00, 0xB0, 0x00, 0x00]
        );
    }

    #[test]
    fn healthy_drive_status_registers() {
        let transport =
            MockTransport::new(vec![Ok(check_condition_sense(&HEALTHY_SENSE))]);
        let core = ScsiCore::new("/dev/mock", Box::new(transport), Context::default());
        let mut tunnel = SatTunnel::new(Box::new(core), SatCdbLen::Cdb16);
        let out = tunnel
            .ata_pass_through(
                &smart_status_regs(),
                AtaData::None,
                &OutRegsNeeded::LBA_MID_HIGH,
                DEFAULT_TIMEOUT,
            )
            .unwrap();
        assert_eq!(out.lba_mid, 0x4F);
        assert_eq!(out.lba_high, 0xC2);
    }

    #[test]
    fn failing_drive_status_registers() {
        let transport =
            MockTransport::new(vec![Ok(check_condition_sense(&FAILING_SENSE))]);
        let core = ScsiCore::new("/dev/mock", Box::new(transport), Context::default());
        let mut tunnel = SatTunnel::new(Box::new(core), SatCdbLen::Cdb16);
        let out = tunnel
            .ata_pass_through(
                &smart_status_regs(),
                AtaData::None,
                &OutRegsNeeded::LBA_MID_HIGH,
                DEFAULT_TIMEOUT,
            )
            .unwrap();
        assert_eq!(out.lba_mid, 0xF4);
        assert_eq!(out.lba_high, 0x2C);
    }

    #[test]
    fn ck_cond_without_descriptor_fails() {
        let transport = MockTransport::new(vec![Ok(ScsiCompletion::default())]);
        let core = ScsiCore::new("/dev/mock", Box::new(transport), Context::default());
        let mut tunnel = SatTunnel::new(Box::new(core), SatCdbLen::Cdb16);
        let err = tunnel
            .ata_pass_through(
                &smart_status_regs(),
                AtaData::None,
                &OutRegsNeeded::LBA_MID_HIGH,
                DEFAULT_TIMEOUT,
            )
            .unwrap_err();
        assert!(matches!(err, SmartError::SatNoAtaDescriptor));
    }

    #[test]
    fn cypress_cdb_layout() {
        let regs = AtaInRegs::smart(0xD0);
        let mut buf = [0u8; 512];
        let cdb = encode_cypress_cdb(
            CYPRESS_DEFAULT_SIGNATURE,
            &AtaInRegs {
                sector_count: 1,
                ..regs
            },
            &AtaData::In(&mut buf),
        );
        assert_eq!(cdb[0], 0x24);
        assert_eq!(cdb[1], 0x24);
        assert_eq!(cdb[2], 0x00);
        assert_eq!(cdb[3], 0xBE);
        assert_eq!(cdb[4], 0x01);
        assert_eq!(cdb[6], 0xD0);
        assert_eq!(cdb[9], 0x4F);
        assert_eq!(cdb[10], 0xC2);
        assert_eq!(cdb[12], 0xB0);
    }

    #[test]
    fn cypress_identify_sets_packet_flag() {
        let regs = AtaInRegs {
            command: 0xEC,
            sector_count: 1,
            ..AtaInRegs::default()
        };
        let mut buf = [0u8; 512];
        let cdb = encode_cypress_cdb(0xBC, &regs, &AtaData::In(&mut buf));
        assert_eq!(cdb[0], 0xBC);
        assert_eq!(cdb[2] & 0x80, 0x80);
    }

    #[test]
    fn cypress_taskfile_readback() {
        // first exchange executes the command, second returns the registers
        let mut transport = MockTransport::new(vec![
            Ok(ScsiCompletion::default()),
            Ok(ScsiCompletion::default()),
        ]);
        transport.data_in = vec![
            Vec::new(),
            vec![0x00, 0x00, 0x00, 0x00, 0x4F, 0xC2, 0x40, 0x50],
        ];
        let core = ScsiCore::new("/dev/mock", Box::new(transport), Context::default());
        let mut bridge = UsbCypress::new(Box::new(core), CYPRESS_DEFAULT_SIGNATURE);
        let out = bridge
            .ata_pass_through(
                &AtaInRegs::smart(0xDA),
                AtaData::None,
                &OutRegsNeeded::LBA_MID_HIGH,
                DEFAULT_TIMEOUT,
            )
            .unwrap();
        assert_eq!(out.lba_mid, 0x4F);
        assert_eq!(out.lba_high, 0xC2);
        assert_eq!(out.status, 0x50);
    }
}
