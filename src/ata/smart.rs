//! SMART data structures: attribute tables, thresholds, self-test and error
//! logs

use crate::unaligned;

/// Attribute slots in the SMART data structure
pub(crate) const NUM_ATTRIBUTES: usize = 30;

/// Temperature attribute ids, in preference order
const TEMP_ATTRIBUTE_IDS: [u8; 2] = [194, 190];

/// One vendor attribute slot
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct SmartAttribute {
    /// Attribute id, 0 marks an empty slot
    pub id: u8,
    /// Status flags
    pub flags: u16,
    /// Normalized current value
    pub current: u8,
    /// Normalized worst value
    pub worst: u8,
    /// Vendor raw value bytes, little-endian
    pub raw: [u8; 6],
}

impl SmartAttribute {
    /// 48-bit raw value, little-endian concatenation of the raw bytes
    pub(crate) fn raw48(&self) -> u64 {
        unaligned::le48(&self.raw, 0)
    }

    /// Whether this is a pre-failure attribute (threshold crossing predicts
    /// imminent failure) rather than a usage attribute
    pub(crate) fn is_prefail(&self) -> bool {
        self.flags & 0x01 != 0
    }
}

/// Parsed SMART READ DATA structure
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct SmartValues {
    /// Structure revision
    pub revision: u16,
    /// Attribute slots
    pub attrs: [SmartAttribute; NUM_ATTRIBUTES],
    /// Off-line data collection status
    pub offline_collection_status: u8,
    /// Self-test execution status byte
    pub self_test_exec_status: u8,
    /// Off-line data collection capability
    pub offline_collection_capability: u8,
    /// SMART capability word
    pub smart_capability: u16,
    /// Error logging capability
    pub errorlog_capability: u8,
    /// Short self-test completion time, minutes
    pub short_test_minutes: u8,
    /// Extended self-test completion time, minutes
    pub extended_test_minutes: u8,
}

impl SmartValues {
    /// Parse the 512-byte SMART READ DATA response
    pub(crate) fn parse(data: &[u8; 512]) -> Self {
        let mut attrs = [SmartAttribute::default(); NUM_ATTRIBUTES];
        for (i, attr) in attrs.iter_mut().enumerate() {
            let off = 2 + i * 12;
            attr.id = data[off];
            attr.flags = unaligned::le16(data, off + 1);
            attr.current = data[off + 3];
            attr.worst = data[off + 4];
            attr.raw.copy_from_slice(&data[off + 5..off + 11]);
        }
        Self {
            revision: unaligned::le16(data, 0),
            attrs,
            offline_collection_status: data[362],
            self_test_exec_status: data[363],
            offline_collection_capability: data[367],
            smart_capability: unaligned::le16(data, 368),
            errorlog_capability: data[370],
            short_test_minutes: data[372],
            extended_test_minutes: data[373],
        }
    }

    /// Attribute slot with the given id
    pub(crate) fn attr(&self, id: u8) -> Option<&SmartAttribute> {
        if id == 0 {
            return None;
        }
        self.attrs.iter().find(|a| a.id == id)
    }

    /// Whether a self-test is currently running
    pub(crate) fn self_test_in_progress(&self) -> bool {
        self.self_test_exec_status >> 4 == 0xF
    }

    /// Percent remaining of a running self-test
    pub(crate) fn self_test_percent_remaining(&self) -> u8 {
        (self.self_test_exec_status & 0x0F) * 10
    }

    /// EXECUTE OFF-LINE IMMEDIATE (full scan) supported
    pub(crate) fn supports_offline_immediate(&self) -> bool {
        self.offline_collection_capability & 0x01 != 0
    }

    /// Short and extended self-tests supported
    pub(crate) fn supports_self_test(&self) -> bool {
        self.offline_collection_capability & 0x10 != 0
    }

    /// Conveyance self-test supported
    pub(crate) fn supports_conveyance(&self) -> bool {
        self.offline_collection_capability & 0x20 != 0
    }

    /// Selective self-test supported
    pub(crate) fn supports_selective(&self) -> bool {
        self.offline_collection_capability & 0x40 != 0
    }

    /// Drive temperature in °C from the temperature attributes, if present
    pub(crate) fn temperature(&self) -> Option<u8> {
        TEMP_ATTRIBUTE_IDS
            .iter()
            .filter_map(|id| self.attr(*id))
            .map(|a| (a.raw48() & 0xFF) as u8)
            .find(|t| *t != 0)
    }
}

/// Parsed SMART READ THRESHOLDS structure
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct SmartThresholds {
    /// Threshold per attribute slot, paired by id
    entries: [(u8, u8); NUM_ATTRIBUTES],
}

impl SmartThresholds {
    /// Parse the 512-byte SMART READ THRESHOLDS response
    pub(crate) fn parse(data: &[u8; 512]) -> Self {
        let mut entries = [(0u8, 0u8); NUM_ATTRIBUTES];
        for (i, entry) in entries.iter_mut().enumerate() {
            let off = 2 + i * 12;
            *entry = (data[off], data[off + 1]);
        }
        Self { entries }
    }

    /// Threshold for the given attribute id
    pub(crate) fn threshold(&self, id: u8) -> Option<u8> {
        if id == 0 {
            return None;
        }
        self.entries
            .iter()
            .find(|(eid, _)| *eid == id)
            .map(|(_, thresh)| *thresh)
    }
}

/// One self-test log entry
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct SelfTestEntry {
    /// Test number (subcommand that was run)
    pub test_num: u8,
    /// Execution status byte
    pub status: u8,
    /// Power-on hours at test completion, wraps at 2^16
    pub timestamp_hours: u16,
    /// Failing checkpoint
    pub checkpoint: u8,
    /// LBA of first failure
    pub first_failure_lba: u32,
}

impl SelfTestEntry {
    /// Whether this entry records a failed test
    pub(crate) fn failed(&self) -> bool {
        matches!(self.status >> 4, 0x3..=0x8)
    }

    /// Whether the slot holds a test record at all
    fn present(&self) -> bool {
        self.test_num != 0 || self.status != 0 || self.timestamp_hours != 0
    }
}

/// Parsed self-test log (log address 0x06)
#[derive(Clone, Debug, Default)]
pub(crate) struct SelfTestLog {
    /// Entries in on-disk slot order
    pub entries: Vec<SelfTestEntry>,
    /// 1-based slot number of the most recent test
    pub most_recent: u8,
}

impl SelfTestLog {
    /// Parse one 512-byte self-test log sector.
    ///
    /// Some Samsung firmware writes multi-byte fields in reversed order;
    /// `swap_words` undoes that.
    pub(crate) fn parse(data: &[u8], swap_words: bool) -> Option<Self> {
        if data.len() < 512 {
            return None;
        }
        let word = |off: usize| {
            if swap_words {
                unaligned::be16(data, off)
            } else {
                unaligned::le16(data, off)
            }
        };
        let mut entries = Vec::with_capacity(21);
        for i in 0..21 {
            let off = 2 + i * 24;
            entries.push(SelfTestEntry {
                test_num: data[off],
                status: data[off + 1],
                timestamp_hours: word(off + 2),
                checkpoint: data[off + 4],
                first_failure_lba: unaligned::le32(data, off + 5),
            });
        }
        Some(Self {
            entries,
            most_recent: data[508],
        })
    }

    /// Count of failed tests and power-on-hour stamp of the most recent
    /// failure.
    ///
    /// The hour stamp wraps with the drive's 16-bit counter; a failure at
    /// exactly one wrap distance is indistinguishable from the previous one.
    pub(crate) fn error_count_and_hour(&self) -> (u32, u16) {
        let count = self
            .entries
            .iter()
            .filter(|e| e.present() && e.failed())
            .count() as u32;
        // walk backwards from the most recent slot, first failure wins
        let mut hour = 0;
        let slots = self.entries.len();
        if slots > 0 && self.most_recent as usize >= 1 {
            let start = (self.most_recent as usize - 1).min(slots - 1);
            for back in 0..slots {
                let idx = (start + slots - back) % slots;
                let entry = &self.entries[idx];
                if entry.present() && entry.failed() {
                    hour = entry.timestamp_hours;
                    break;
                }
            }
        }
        (count, hour)
    }
}

/// Error count out of the summary SMART error log (log address 0x01).
///
/// The count is only meaningful when the log pointer is set.
pub(crate) fn error_log_count(data: &[u8]) -> Option<u32> {
    if data.len() < 512 {
        return None;
    }
    let error_log_pointer = data[1];
    if error_log_pointer == 0 {
        return Some(0);
    }
    Some(u32::from(unaligned::le16(data, 452)))
}
