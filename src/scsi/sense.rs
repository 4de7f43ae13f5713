//! SCSI sense data normalization
//!
//! Devices report errors in one of two wire layouts: fixed format (response
//! codes 0x70/0x71) and descriptor format (0x72/0x73). Both are normalized
//! into [`SenseDisect`] so upper layers never touch raw offsets.

use crate::{
    scsi::{SimpleErr, asc, sense_key},
    unaligned,
};

/// Offset of the first sense descriptor in descriptor-format sense data
const DESC_START: usize = 8;

/// Sense-key-specific descriptor type
const DESC_SENSE_KEY_SPECIFIC: u8 = 0x02;

/// ATA Return Descriptor type (SAT)
pub(crate) const DESC_ATA_RETURN: u8 = 0x09;

/// Normalized view of one sense buffer
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct SenseDisect {
    /// Response code, low 7 bits of byte 0
    pub response_code: u8,
    /// Sense key
    pub sense_key: u8,
    /// Additional sense code
    pub asc: u8,
    /// Additional sense code qualifier
    pub ascq: u8,
    /// Sense-key-specific progress indication, in 65536ths
    pub progress: Option<u16>,
}

impl SenseDisect {
    /// Whether this is descriptor-format sense
    pub(crate) fn is_descriptor_format(&self) -> bool {
        self.response_code >= 0x72
    }

    /// Whether the device reports a self-test in progress
    pub(crate) fn self_test_in_progress(&self) -> bool {
        self.sense_key == sense_key::NOT_READY
            && self.asc == asc::NOT_READY
            && self.ascq == asc::ASCQ_SELF_TEST_IN_PROGRESS
    }
}

/// Normalize a raw sense buffer.
///
/// Returns `None` for buffers whose response code is not one of
/// 0x70/0x71/0x72/0x73; no other field is interpreted in that case.
pub(crate) fn normalize(sense: &[u8]) -> Option<SenseDisect> {
    let response_code = sense.first()? & 0x7F;
    match response_code {
        0x70 | 0x71 => {
            let mut disect = SenseDisect {
                response_code,
                sense_key: sense.get(2)? & 0x0F,
                ..SenseDisect::default()
            };
            // asc/ascq are only present when the additional sense length
            // covers them
            let addl_len = usize::from(*sense.get(7).unwrap_or(&0));
            if addl_len >= 6 && sense.len() >= 14 {
                disect.asc = sense[12];
                disect.ascq = sense[13];
            }
            // sense-key-specific bytes, SKSV bit gates validity
            if sense.len() >= 18 && sense[15] & 0x80 != 0 {
                disect.progress = Some(unaligned::be16(sense, 16));
            }
            Some(disect)
        }
        0x72 | 0x73 => {
            let mut disect = SenseDisect {
                response_code,
                sense_key: sense.get(1)? & 0x0F,
                asc: *sense.get(2)?,
                ascq: *sense.get(3)?,
                progress: None,
            };
            if matches!(disect.sense_key, sense_key::NO_SENSE | sense_key::NOT_READY) {
                if let Some(desc) = find_descriptor(sense, DESC_SENSE_KEY_SPECIFIC) {
                    if desc.len() >= 7 && desc[4] & 0x80 != 0 {
                        disect.progress = Some(unaligned::be16(desc, 5));
                    }
                }
            }
            Some(disect)
        }
        _ => None,
    }
}

/// Find the first descriptor of the given type in descriptor-format sense
/// data.
///
/// Returns the full descriptor slice including its `{type, additional
/// length}` header.
pub(crate) fn find_descriptor(sense: &[u8], dtype: u8) -> Option<&[u8]> {
    if sense.first()? & 0x7F < 0x72 {
        return None;
    }
    let addl_len = usize::from(*sense.get(7)?);
    let end = sense.len().min(DESC_START + addl_len);
    let mut off = DESC_START;
    while off + 2 <= end {
        let desc_len = 2 + usize::from(sense[off + 1]);
        if off + desc_len > end {
            return None;
        }
        if sense[off] == dtype {
            return Some(&sense[off..off + desc_len]);
        }
        off += desc_len;
    }
    None
}

/// Classify normalized sense into the coarse error categories
pub(crate) fn simple_filter(disect: &SenseDisect) -> SimpleErr {
    match disect.sense_key {
        sense_key::NO_SENSE | sense_key::RECOVERED_ERROR | sense_key::COMPLETED => SimpleErr::Ok,
        sense_key::NOT_READY => {
            if disect.asc == asc::NO_MEDIUM {
                SimpleErr::NoMedium
            } else if disect.asc == asc::NOT_READY && disect.ascq == 0x1 {
                SimpleErr::BecomingReady
            } else {
                SimpleErr::NotReady
            }
        }
        sense_key::MEDIUM_ERROR | sense_key::HARDWARE_ERROR => SimpleErr::MediumOrHardware,
        sense_key::ILLEGAL_REQUEST => match disect.asc {
            asc::UNKNOWN_OPCODE => SimpleErr::BadOpcode,
            asc::INVALID_FIELD => SimpleErr::BadField,
            _ => SimpleErr::BadParam,
        },
        sense_key::UNIT_ATTENTION => SimpleErr::TryAgain,
        sense_key::ABORTED_COMMAND => SimpleErr::Aborted,
        sense_key::DATA_PROTECT => SimpleErr::Protection,
        sense_key::MISCOMPARE => SimpleErr::Miscompare,
        _ => SimpleErr::Unknown,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn rejects_unknown_response_codes() {
        assert_eq!(normalize(&[]), None);
        assert_eq!(normalize(&[0x00; 18]), None);
        let mut sense = [0u8; 18];
        sense[0] = 0x74;
        assert_eq!(normalize(&sense), None);
        sense[0] = 0x6F;
        assert_eq!(normalize(&sense), None);
    }

    #[test]
    fn fixed_format() {
        let mut sense = [0u8; 18];
        sense[0] = 0xF0; // valid bit set, must be masked off
        sense[2] = 0x05;
        sense[7] = 10;
        sense[12] = 0x24;
        sense[13] = 0x00;
        let disect = normalize(&sense).unwrap();
        assert_eq!(disect.response_code, 0x70);
        assert_eq!(disect.sense_key, sense_key::ILLEGAL_REQUEST);
        assert_eq!(disect.asc, 0x24);
        assert_eq!(simple_filter(&disect), SimpleErr::BadField);
    }

    #[test]
    fn fixed_format_short_additional_length() {
        // additional length too small for asc/ascq
        let mut sense = [0u8; 18];
        sense[0] = 0x70;
        sense[2] = 0x02;
        sense[7] = 4;
        sense[12] = 0x3A;
        let disect = normalize(&sense).unwrap();
        assert_eq!(disect.asc, 0);
        assert_eq!(simple_filter(&disect), SimpleErr::NotReady);
    }

    #[test]
    fn fixed_format_progress() {
        let mut sense = [0u8; 18];
        sense[0] = 0x70;
        sense[2] = 0x00;
        sense[7] = 10;
        sense[15] = 0x80;
        sense[16] = 0x80;
        sense[17] = 0x00;
        let disect = normalize(&sense).unwrap();
        assert_eq!(disect.progress, Some(0x8000));
    }

    #[test]
    fn descriptor_format() {
        let sense = [
            0x72, 0x01, 0x00, 0x1D, 0x00, 0x00, 0x00, 0x0E, //
            0x09, 0x0C, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, //
            0x00, 0x4F, 0x00, 0xC2, 0x40, 0x50,
        ];
        let disect = normalize(&sense).unwrap();
        assert_eq!(disect.response_code, 0x72);
        assert_eq!(disect.sense_key, sense_key::RECOVERED_ERROR);
        assert_eq!(disect.asc, 0x00);
        assert_eq!(disect.ascq, 0x1D);
        assert_eq!(simple_filter(&disect), SimpleErr::Ok);
        let ard = find_descriptor(&sense, DESC_ATA_RETURN).unwrap();
        assert_eq!(ard.len(), 14);
        assert_eq!(ard[0], 0x09);
        assert_eq!(ard[1], 0x0C);
    }

    #[test]
    fn descriptor_iteration_skips_other_types() {
        let sense = [
            0x72, 0x02, 0x04, 0x09, 0x00, 0x00, 0x00, 0x14, //
            0x00, 0x0A, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
            0x00, 0x00, 0x00, 0x00, //
            0x02, 0x06, 0x00, 0x00, 0x80, 0x40, 0x00, 0x00,
        ];
        let desc = find_descriptor(&sense, DESC_SENSE_KEY_SPECIFIC).unwrap();
        assert_eq!(desc[0], 0x02);
        let disect = normalize(&sense).unwrap();
        assert!(disect.self_test_in_progress());
        assert_eq!(disect.progress, Some(0x4000));
    }

    #[test]
    fn descriptor_truncated_is_rejected() {
        let sense = [
            0x72, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x20, //
            0x09, 0x0C, 0x00, 0x00,
        ];
        assert_eq!(find_descriptor(&sense, DESC_ATA_RETURN), None);
    }

    #[test]
    fn unit_attention_maps_to_try_again() {
        let mut sense = [0u8; 18];
        sense[0] = 0x70;
        sense[2] = sense_key::UNIT_ATTENTION;
        sense[7] = 10;
        sense[12] = 0x29; // power on or reset
        let disect = normalize(&sense).unwrap();
        assert_eq!(simple_filter(&disect), SimpleErr::TryAgain);
    }
}
