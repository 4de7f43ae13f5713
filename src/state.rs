//! Per-device runtime state and its persistent text codec
//!
//! The persistable subset survives daemon restarts as `key = integer` lines;
//! everything else is re-learned from the device on the next initial scan.

use std::{
    fs::{self, File},
    io::{self, BufRead as _, BufReader, Write as _},
    path::Path,
};

use crate::ata::smart::{SmartThresholds, SmartValues};

/// Notification slots, one per event class
pub(crate) const N_MAIL: usize = 13;

/// Slot index of the test email, never persisted
pub(crate) const MAIL_SLOT_TEST: usize = 0;

/// Tracked attribute slots
pub(crate) const N_ATTR_SLOTS: usize = 30;

/// Delivery bookkeeping for one notification slot
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct MailInfo {
    /// Deliveries so far
    pub count: u32,
    /// Epoch seconds of the first delivery
    pub first_sent: i64,
    /// Epoch seconds of the most recent delivery
    pub last_sent: i64,
}

/// Persisted attribute snapshot
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct PersistedAttr {
    /// Attribute id, 0 marks an empty slot
    pub id: u8,
    /// Normalized value at the last cycle
    pub val: u8,
    /// 48-bit raw value at the last cycle
    pub raw: u64,
}

/// Complete per-device state owned by the monitoring engine.
///
/// Only the fields covered by [`write_state`] survive restarts.
#[derive(Clone, Debug)]
pub(crate) struct DeviceState {
    /// Lowest temperature seen, °C
    pub tempmin: u8,
    /// Highest temperature seen, °C
    pub tempmax: u8,
    /// Failed self-tests in the log
    pub selflogcount: u32,
    /// Power-on hour stamp of the most recent self-test failure
    pub selfloghour: u32,
    /// Epoch seconds of the next scheduled-test check
    pub scheduled_test_next_check: i64,
    /// ATA error log count
    pub ataerrorcount: u32,
    /// Per-event-class delivery log
    pub maillog: [MailInfo; N_MAIL],
    /// Attribute snapshots from the last cycle
    pub ata_attributes: [PersistedAttr; N_ATTR_SLOTS],

    // transient from here on
    /// State changed since the last flush
    pub must_write: bool,
    /// Device reported short self-tests unsupported
    pub not_cap_short: bool,
    /// Device reported long self-tests unsupported
    pub not_cap_long: bool,
    /// Device reported offline immediate unsupported
    pub not_cap_offline: bool,
    /// Device reported conveyance self-tests unsupported
    pub not_cap_conveyance: bool,
    /// Device reported selective self-tests unsupported
    pub not_cap_selective: bool,
    /// Temperature at the last cycle, 0 when unknown
    pub temp_last: u8,
    /// Epoch seconds before which minimum-temperature tracking is held off
    pub tempmin_delay: i64,
    /// CHECK POWER MODE returned garbage, `-n` disabled
    pub powermodefail: bool,
    /// Consecutive cycles skipped due to low power
    pub powerskipcnt: u8,
    /// SCSI: SMART support confirmed via log pages
    pub smart_page_supported: bool,
    /// SCSI: temperature log page available
    pub temp_page_supported: bool,
    /// SCSI: suppress repeated IE reports
    pub suppress_report: bool,
    /// SCSI: MODE SENSE length the device accepts (0 = unknown, 6 or 10)
    pub mode_sense_len: u8,
    /// SCSI: self-test results log page available
    pub selftest_page_supported: bool,
    /// SCSI: background scan results log page available
    pub bg_scan_supported: bool,
    /// SCSI: sequential-access (tape) device, TapeAlerts apply
    pub tape_device: bool,
    /// ATA: user-addressable sectors, for selective self-test spans
    pub num_sectors: u64,
    /// ATA: SMART data from the last read
    pub smart_values: Option<SmartValues>,
    /// ATA: thresholds from the initial scan
    pub smart_thresholds: Option<SmartThresholds>,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            tempmin: 0,
            tempmax: 0,
            selflogcount: 0,
            selfloghour: 0,
            scheduled_test_next_check: 0,
            ataerrorcount: 0,
            maillog: [MailInfo::default(); N_MAIL],
            ata_attributes: [PersistedAttr::default(); N_ATTR_SLOTS],
            must_write: false,
            not_cap_short: false,
            not_cap_long: false,
            not_cap_offline: false,
            not_cap_conveyance: false,
            not_cap_selective: false,
            temp_last: 0,
            tempmin_delay: 0,
            powermodefail: false,
            powerskipcnt: 0,
            smart_page_supported: false,
            temp_page_supported: false,
            suppress_report: false,
            mode_sense_len: 0,
            selftest_page_supported: false,
            bg_scan_supported: false,
            tape_device: false,
            num_sectors: 0,
            smart_values: None,
            smart_thresholds: None,
        }
    }
}

impl DeviceState {
    /// Update the persisted attribute table from freshly read SMART data
    pub(crate) fn snapshot_attributes(&mut self, values: &SmartValues) {
        for (slot, attr) in self.ata_attributes.iter_mut().zip(values.attrs.iter()) {
            let new = PersistedAttr {
                id: attr.id,
                val: attr.current,
                raw: attr.raw48(),
            };
            if *slot != new {
                *slot = new;
                self.must_write = true;
            }
        }
    }
}

/// Outcome of reading a state file
#[derive(Debug, Eq, PartialEq)]
pub(crate) enum ReadOutcome {
    /// File missing, baselines come from the live device
    Missing,
    /// File read; invalid lines were skipped
    Read {
        /// Lines that failed validation
        bad_lines: u32,
    },
    /// Nothing usable in the file
    Corrupt,
}

/// Apply one `key = value` assignment to the state, false when invalid
fn apply_line(state: &mut DeviceState, key: &str, val: u64) -> bool {
    let as_u8 = |v: u64| u8::try_from(v).ok();
    match key {
        "temperature-min" => match as_u8(val) {
            Some(v) => {
                state.tempmin = v;
                true
            }
            None => false,
        },
        "temperature-max" => match as_u8(val) {
            Some(v) => {
                state.tempmax = v;
                true
            }
            None => false,
        },
        "self-test-errors" => {
            state.selflogcount = val as u32;
            true
        }
        "self-test-last-err-hour" => {
            state.selfloghour = val as u32;
            true
        }
        "scheduled-test-next-check" => {
            state.scheduled_test_next_check = val as i64;
            true
        }
        "ata-error-count" => {
            state.ataerrorcount = val as u32;
            true
        }
        _ => apply_indexed_line(state, key, val),
    }
}

/// Handle the `mail.<i>.*` and `ata-smart-attribute.<j>.*` key families
fn apply_indexed_line(state: &mut DeviceState, key: &str, val: u64) -> bool {
    if let Some(rest) = key.strip_prefix("mail.") {
        let Some((idx, field)) = rest.split_once('.') else {
            return false;
        };
        let Ok(i) = idx.parse::<usize>() else {
            return false;
        };
        if i >= N_MAIL {
            return false;
        }
        if i == MAIL_SLOT_TEST {
            // never suppress test mails across runs
            return true;
        }
        match field {
            "count" => state.maillog[i].count = val as u32,
            "first-sent-time" => state.maillog[i].first_sent = val as i64,
            "last-sent-time" => state.maillog[i].last_sent = val as i64,
            _ => return false,
        }
        return true;
    }
    if let Some(rest) = key.strip_prefix("ata-smart-attribute.") {
        let Some((idx, field)) = rest.split_once('.') else {
            return false;
        };
        let Ok(j) = idx.parse::<usize>() else {
            return false;
        };
        if j >= N_ATTR_SLOTS {
            return false;
        }
        match field {
            "id" => match u8::try_from(val) {
                Ok(v) => state.ata_attributes[j].id = v,
                Err(_) => return false,
            },
            "val" => match u8::try_from(val) {
                Ok(v) => state.ata_attributes[j].val = v,
                Err(_) => return false,
            },
            "raw" => {
                if val >= 1 << 48 {
                    return false;
                }
                state.ata_attributes[j].raw = val;
            }
            _ => return false,
        }
        return true;
    }
    false
}

/// Read a state file into `state`.
///
/// Unparsable lines are counted, not fatal; the file is rejected only when
/// no line parses at all.
pub(crate) fn read_state(path: &Path, state: &mut DeviceState) -> io::Result<ReadOutcome> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ReadOutcome::Missing),
        Err(e) => return Err(e),
    };
    let mut good = 0u32;
    let mut bad = 0u32;
    for line in BufReader::new(file).lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let parsed = trimmed.split_once('=').and_then(|(key, value)| {
            let key = key.trim();
            value.trim().parse::<u64>().ok().map(|v| (key, v))
        });
        match parsed {
            Some((key, val)) if apply_line(state, key, val) => good += 1,
            _ => bad += 1,
        }
    }
    if good == 0 && bad > 0 {
        return Ok(ReadOutcome::Corrupt);
    }
    Ok(ReadOutcome::Read { bad_lines: bad })
}

/// Append one assignment, skipping zero values like the rest of the format
fn write_line(out: &mut String, key: &str, val: u64) {
    if val != 0 {
        out.push_str(key);
        out.push_str(" = ");
        out.push_str(&val.to_string());
        out.push('\n');
    }
}

/// Render the persistable subset of the state
pub(crate) fn render_state(state: &DeviceState) -> String {
    let mut out = String::from("# smartmond state file\n");
    write_line(&mut out, "temperature-min", u64::from(state.tempmin));
    write_line(&mut out, "temperature-max", u64::from(state.tempmax));
    write_line(&mut out, "self-test-errors", u64::from(state.selflogcount));
    write_line(
        &mut out,
        "self-test-last-err-hour",
        u64::from(state.selfloghour),
    );
    write_line(
        &mut out,
        "scheduled-test-next-check",
        state.scheduled_test_next_check.max(0) as u64,
    );
    for (i, mail) in state.maillog.iter().enumerate() {
        if i == MAIL_SLOT_TEST || mail.count == 0 {
            continue;
        }
        write_line(&mut out, &format!("mail.{i}.count"), u64::from(mail.count));
        write_line(
            &mut out,
            &format!("mail.{i}.first-sent-time"),
            mail.first_sent.max(0) as u64,
        );
        write_line(
            &mut out,
            &format!("mail.{i}.last-sent-time"),
            mail.last_sent.max(0) as u64,
        );
    }
    write_line(&mut out, "ata-error-count", u64::from(state.ataerrorcount));
    for (j, attr) in state.ata_attributes.iter().enumerate() {
        if attr.id == 0 {
            continue;
        }
        write_line(
            &mut out,
            &format!("ata-smart-attribute.{j}.id"),
            u64::from(attr.id),
        );
        write_line(
            &mut out,
            &format!("ata-smart-attribute.{j}.val"),
            u64::from(attr.val),
        );
        write_line(&mut out, &format!("ata-smart-attribute.{j}.raw"), attr.raw);
    }
    out
}

/// Write a state file atomically: the previous file is kept as `…~`, the new
/// content is synced before close so a crash leaves one valid copy.
pub(crate) fn write_state(path: &Path, state: &DeviceState) -> io::Result<()> {
    let backup = {
        let mut os = path.as_os_str().to_owned();
        os.push("~");
        std::path::PathBuf::from(os)
    };
    if path.exists() {
        let _ = fs::remove_file(&backup);
        fs::rename(path, &backup)?;
    }
    let mut file = File::create(path)?;
    file.write_all(render_state(state).as_bytes())?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    /// The S3-style populated state
    fn sample_state() -> DeviceState {
        let mut state = DeviceState::default();
        state.tempmin = 20;
        state.tempmax = 47;
        state.selflogcount = 2;
        state.selfloghour = 12345;
        state.scheduled_test_next_check = 1_700_000_000;
        state.maillog[3] = MailInfo {
            count: 2,
            first_sent: 1_699_000_000,
            last_sent: 1_699_900_000,
        };
        state.ata_attributes[0] = PersistedAttr {
            id: 194,
            val: 90,
            raw: 0x30,
        };
        state
    }

    /// Compare the persisted subset of two states
    fn persisted_eq(a: &DeviceState, b: &DeviceState) -> bool {
        a.tempmin == b.tempmin
            && a.tempmax == b.tempmax
            && a.selflogcount == b.selflogcount
            && a.selfloghour == b.selfloghour
            && a.scheduled_test_next_check == b.scheduled_test_next_check
            && a.ataerrorcount == b.ataerrorcount
            && a.maillog == b.maillog
            && a.ata_attributes == b.ata_attributes
    }

    #[test]
    fn round_trip() {
        let state = sample_state();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("smartmond.FAKEDISK-SN01.state");
        write_state(&path, &state).unwrap();
        let mut read_back = DeviceState::default();
        assert_eq!(
            read_state(&path, &mut read_back).unwrap(),
            ReadOutcome::Read { bad_lines: 0 }
        );
        assert!(persisted_eq(&state, &read_back));
    }

    #[test]
    fn test_mail_slot_not_written_and_dropped_on_read() {
        let mut state = sample_state();
        state.maillog[MAIL_SLOT_TEST] = MailInfo {
            count: 9,
            first_sent: 1,
            last_sent: 2,
        };
        let rendered = render_state(&state);
        assert!(!rendered.contains("mail.0."));

        let mut read_back = DeviceState::default();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        fs::write(&path, "mail.0.count = 5\nmail.3.count = 2\n").unwrap();
        assert_eq!(
            read_state(&path, &mut read_back).unwrap(),
            ReadOutcome::Read { bad_lines: 0 }
        );
        assert_eq!(read_back.maillog[MAIL_SLOT_TEST].count, 0);
        assert_eq!(read_back.maillog[3].count, 2);
    }

    #[test]
    fn bad_lines_counted_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        fs::write(
            &path,
            "# comment\n\ntemperature-min = 21\nbogus-key = 5\nmail.99.count = 1\n\
             ata-smart-attribute.4.raw = 281474976710656\n",
        )
        .unwrap();
        let mut state = DeviceState::default();
        assert_eq!(
            read_state(&path, &mut state).unwrap(),
            ReadOutcome::Read { bad_lines: 3 }
        );
        assert_eq!(state.tempmin, 21);
    }

    #[test]
    fn all_bad_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        fs::write(&path, "gibberish\nmore = gibberish\n").unwrap();
        let mut state = DeviceState::default();
        assert_eq!(read_state(&path, &mut state).unwrap(), ReadOutcome::Corrupt);
    }

    #[test]
    fn missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = DeviceState::default();
        assert_eq!(
            read_state(&dir.path().join("nope"), &mut state).unwrap(),
            ReadOutcome::Missing
        );
    }

    #[test]
    fn rewrite_keeps_backup() {
        let state = sample_state();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        write_state(&path, &state).unwrap();
        let mut newer = state.clone();
        newer.tempmax = 55;
        write_state(&path, &newer).unwrap();
        let backup = dir.path().join("state~");
        assert!(backup.exists());
        let mut old = DeviceState::default();
        read_state(&backup, &mut old).unwrap();
        assert_eq!(old.tempmax, 47);
        let mut current = DeviceState::default();
        read_state(&path, &mut current).unwrap();
        assert_eq!(current.tempmax, 55);
    }

    #[test]
    fn attribute_snapshot_marks_dirty() {
        let mut state = DeviceState::default();
        let data = crate::tests::fake_smart_values(&[(5, 100, 1)]);
        state.snapshot_attributes(&SmartValues::parse(&data));
        assert!(state.must_write);
        assert_eq!(state.ata_attributes[0].id, 5);
        state.must_write = false;
        state.snapshot_attributes(&SmartValues::parse(&data));
        assert!(!state.must_write);
    }
}
