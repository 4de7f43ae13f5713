//! ATA command set: taskfile registers, typed command wrappers, SMART data
//! structures

pub(crate) mod cmds;
pub(crate) mod names;
pub(crate) mod smart;

/// Shadow registers for 48-bit (extended) commands, holding the previous
/// value of each 8-bit register pair
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct AtaPrevRegs {
    /// Features (15:8)
    pub features: u8,
    /// Sector count (15:8)
    pub sector_count: u8,
    /// LBA low (15:8)
    pub lba_low: u8,
    /// LBA mid (15:8)
    pub lba_mid: u8,
    /// LBA high (15:8)
    pub lba_high: u8,
}

/// Input taskfile for one ATA command
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct AtaInRegs {
    /// Features register
    pub features: u8,
    /// Sector count register
    pub sector_count: u8,
    /// LBA low register
    pub lba_low: u8,
    /// LBA mid register
    pub lba_mid: u8,
    /// LBA high register
    pub lba_high: u8,
    /// Device register
    pub device: u8,
    /// Command register
    pub command: u8,
    /// Previous register contents, present iff this is a 48-bit command
    pub prev: Option<AtaPrevRegs>,
}

impl AtaInRegs {
    /// Taskfile for a SMART subcommand: feature register selects the
    /// operation, LBA mid/high carry the SMART signature
    pub(crate) fn smart(feature: u8) -> Self {
        Self {
            features: feature,
            lba_mid: cmds::SMART_CYL_LOW,
            lba_high: cmds::SMART_CYL_HI,
            command: cmds::CMD_SMART,
            ..Self::default()
        }
    }

    /// Whether this command uses the 48-bit (extended) register set
    pub(crate) fn is_48bit(&self) -> bool {
        self.prev.is_some()
    }
}

/// Output taskfile returned by the device.
///
/// 16-bit fields hold the previous-register byte in their high half when the
/// command was a 48-bit form.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct AtaOutRegs {
    /// Error register
    pub error: u8,
    /// Sector count register
    pub sector_count: u16,
    /// LBA low register
    pub lba_low: u16,
    /// LBA mid register
    pub lba_mid: u16,
    /// LBA high register
    pub lba_high: u16,
    /// Device register
    pub device: u8,
    /// Status register
    pub status: u8,
}

/// Which output registers the caller needs after command completion.
///
/// Requesting any register forces the transport to ask the device for the
/// completed taskfile (`ck_cond` on the SAT path).
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct OutRegsNeeded {
    /// Error register
    pub error: bool,
    /// Sector count register
    pub sector_count: bool,
    /// LBA low register
    pub lba_low: bool,
    /// LBA mid register
    pub lba_mid: bool,
    /// LBA high register
    pub lba_high: bool,
    /// Status register
    pub status: bool,
}

impl OutRegsNeeded {
    /// Request no output registers
    pub(crate) const NONE: Self = Self {
        error: false,
        sector_count: false,
        lba_low: false,
        lba_mid: false,
        lba_high: false,
        status: false,
    };

    /// Request the LBA mid/high pair (SMART status signature)
    pub(crate) const LBA_MID_HIGH: Self = Self {
        lba_mid: true,
        lba_high: true,
        ..Self::NONE
    };

    /// Request the sector count register
    pub(crate) const SECTOR_COUNT: Self = Self {
        sector_count: true,
        ..Self::NONE
    };

    /// Whether any register was requested
    pub(crate) fn any(&self) -> bool {
        self.error
            || self.sector_count
            || self.lba_low
            || self.lba_mid
            || self.lba_high
            || self.status
    }
}

/// Data phase of one ATA command
pub(crate) enum AtaData<'a> {
    /// Non-data command
    None,
    /// PIO data-in, buffer length must be a multiple of 512
    In(&'a mut [u8]),
    /// PIO data-out, buffer length must be a multiple of 512
    Out(&'a [u8]),
}

impl AtaData<'_> {
    /// Number of 512-byte blocks transferred
    pub(crate) fn blocks(&self) -> usize {
        match self {
            AtaData::None => 0,
            AtaData::In(b) => b.len() / 512,
            AtaData::Out(b) => b.len() / 512,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smart_taskfile_carries_signature() {
        let regs = AtaInRegs::smart(0xD0);
        assert_eq!(regs.command, 0xB0);
        assert_eq!(regs.features, 0xD0);
        assert_eq!(regs.lba_mid, 0x4F);
        assert_eq!(regs.lba_high, 0xC2);
        assert!(!regs.is_48bit());
    }

    #[test]
    fn needed_regs_any() {
        assert!(!OutRegsNeeded::NONE.any());
        assert!(OutRegsNeeded::LBA_MID_HIGH.any());
        assert!(OutRegsNeeded::SECTOR_COUNT.any());
    }
}
