//! SCSI command set: sense data handling, typed command wrappers, log/mode
//! page decoders

pub(crate) mod cmds;
pub(crate) mod pages;
pub(crate) mod sense;

/// Sense key values (SPC-3 table 27)
pub(crate) mod sense_key {
    pub(crate) const NO_SENSE: u8 = 0x0;
    pub(crate) const RECOVERED_ERROR: u8 = 0x1;
    pub(crate) const NOT_READY: u8 = 0x2;
    pub(crate) const MEDIUM_ERROR: u8 = 0x3;
    pub(crate) const HARDWARE_ERROR: u8 = 0x4;
    pub(crate) const ILLEGAL_REQUEST: u8 = 0x5;
    pub(crate) const UNIT_ATTENTION: u8 = 0x6;
    pub(crate) const DATA_PROTECT: u8 = 0x7;
    pub(crate) const ABORTED_COMMAND: u8 = 0xB;
    pub(crate) const MISCOMPARE: u8 = 0xE;
    pub(crate) const COMPLETED: u8 = 0xF;
}

/// Additional sense codes used by the monitor
pub(crate) mod asc {
    pub(crate) const NOT_READY: u8 = 0x04;
    /// With `NOT_READY`: self-test in progress
    pub(crate) const ASCQ_SELF_TEST_IN_PROGRESS: u8 = 0x09;
    pub(crate) const UNKNOWN_OPCODE: u8 = 0x20;
    pub(crate) const INVALID_FIELD: u8 = 0x24;
    pub(crate) const UNKNOWN_PARAM: u8 = 0x26;
    pub(crate) const NO_MEDIUM: u8 = 0x3A;
    pub(crate) const WARNING: u8 = 0x0B;
    pub(crate) const IMPENDING_FAILURE: u8 = 0x5D;
    /// ASC 0x00 + this ASCQ: ATA PASS THROUGH INFORMATION AVAILABLE (SAT)
    pub(crate) const ASCQ_ATA_PT_INFO_AVAILABLE: u8 = 0x1D;
}

/// Opcodes of the commands the monitor issues
pub(crate) mod opcode {
    pub(crate) const TEST_UNIT_READY: u8 = 0x00;
    pub(crate) const REQUEST_SENSE: u8 = 0x03;
    pub(crate) const INQUIRY: u8 = 0x12;
    pub(crate) const MODE_SELECT_6: u8 = 0x15;
    pub(crate) const MODE_SENSE_6: u8 = 0x1A;
    pub(crate) const SEND_DIAGNOSTIC: u8 = 0x1D;
    pub(crate) const READ_CAPACITY_10: u8 = 0x25;
    pub(crate) const LOG_SENSE: u8 = 0x4D;
    pub(crate) const MODE_SELECT_10: u8 = 0x55;
    pub(crate) const MODE_SENSE_10: u8 = 0x5A;
    pub(crate) const ATA_PASS_THROUGH_16: u8 = 0x85;
    pub(crate) const REPORT_LUNS: u8 = 0xA0;
    pub(crate) const ATA_PASS_THROUGH_12: u8 = 0xA1;
    pub(crate) const SERVICE_ACTION_IN_16: u8 = 0x9E;
    pub(crate) const MAINTENANCE_IN_12: u8 = 0xA3;
}

/// Coarse classification of a CHECK CONDITION, for callers that only need to
/// know how to react
#[derive(Copy, Clone, Debug, Eq, PartialEq, strum::Display)]
pub(crate) enum SimpleErr {
    /// No error
    Ok,
    /// Device not ready
    NotReady,
    /// No medium present
    NoMedium,
    /// Becoming ready
    BecomingReady,
    /// Unsupported opcode
    BadOpcode,
    /// Unsupported field in CDB
    BadField,
    /// Bad parameter in data
    BadParam,
    /// Medium or hardware error
    MediumOrHardware,
    /// Aborted command
    Aborted,
    /// Data protect
    Protection,
    /// Miscompare
    Miscompare,
    /// Unit attention, retry may succeed
    TryAgain,
    /// Anything else
    Unknown,
}

impl SimpleErr {
    /// Whether the device answered the command successfully
    pub(crate) fn is_ok(self) -> bool {
        matches!(self, SimpleErr::Ok)
    }
}
