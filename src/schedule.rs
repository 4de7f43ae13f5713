//! Calendar-driven self-test scheduling
//!
//! A schedule is an extended regex over tokens `T/MM/DD/wd/HH`, matched
//! against every hour between the last check and now. Test kinds carry a
//! priority so one schedule can arm several tests for the same window and
//! the most thorough one wins.

use chrono::{DateTime, Datelike as _, Local, TimeZone as _, Timelike as _};

use crate::state::DeviceState;

/// Lookback clamp when the daemon was down for a long time
const MAX_LOOKBACK_SECS: i64 = 3600 * 24 * 90;

/// Self-test kinds, most expensive first; the scan prefers earlier entries
#[derive(Copy, Clone, Debug, Eq, PartialEq, strum::Display)]
pub(crate) enum TestKind {
    /// Extended self-test
    Long,
    /// Selective self-test, next span
    SelectiveNext,
    /// Selective self-test, continue interrupted span
    SelectiveCont,
    /// Selective self-test, redo last span
    SelectiveRedo,
    /// Short self-test
    Short,
    /// Conveyance self-test
    Conveyance,
    /// Immediate offline data collection
    Offline,
}

/// Priority order used by the scan
const TEST_PRIORITY: [TestKind; 7] = [
    TestKind::Long,
    TestKind::SelectiveNext,
    TestKind::SelectiveCont,
    TestKind::SelectiveRedo,
    TestKind::Short,
    TestKind::Conveyance,
    TestKind::Offline,
];

impl TestKind {
    /// Schedule token character
    pub(crate) fn as_char(self) -> char {
        match self {
            TestKind::Long => 'L',
            TestKind::SelectiveNext => 'n',
            TestKind::SelectiveCont => 'c',
            TestKind::SelectiveRedo => 'r',
            TestKind::Short => 'S',
            TestKind::Conveyance => 'C',
            TestKind::Offline => 'O',
        }
    }

    /// Whether the device lacks the capability for this test
    fn not_capable(self, state: &DeviceState, scsi: bool) -> bool {
        match self {
            TestKind::Long => state.not_cap_long,
            TestKind::Short => state.not_cap_short,
            TestKind::Conveyance => scsi || state.not_cap_conveyance,
            TestKind::Offline => scsi || state.not_cap_offline,
            TestKind::SelectiveNext | TestKind::SelectiveCont | TestKind::SelectiveRedo => {
                scsi || state.not_cap_selective
            }
        }
    }
}

/// Compiled calendar pattern
#[derive(Clone, Debug)]
pub(crate) struct TestRegex {
    /// Source pattern, kept for display and comparison
    pattern: String,
    /// Anchored matcher
    re: regex::Regex,
}

impl TestRegex {
    /// Compile a calendar pattern, anchoring it for full-token matches
    pub(crate) fn new(pattern: &str) -> Result<Self, regex::Error> {
        let re = regex::Regex::new(&format!("^(?:{pattern})$"))?;
        Ok(Self {
            pattern: pattern.to_owned(),
            re,
        })
    }

    /// Source pattern
    pub(crate) fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Whether the whole token matches
    fn full_match(&self, token: &str) -> bool {
        self.re.is_match(token)
    }
}

impl PartialEq for TestRegex {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern
    }
}

impl Eq for TestRegex {}

/// Schedule token for one test kind at one local time, `T/MM/DD/wd/HH` with
/// Monday as weekday 1
fn schedule_token(kind: TestKind, tm: &DateTime<Local>) -> String {
    format!(
        "{}/{:02}/{:02}/{}/{:02}",
        kind.as_char(),
        tm.month(),
        tm.day(),
        tm.weekday().number_from_monday(),
        tm.hour()
    )
}

/// Pick the test to run now, if any hour since the last check matches the
/// schedule.
///
/// Scans the window hour by hour (clamped to 90 days), retaining the first
/// match per hour and lowering the priority ceiling after each hit, so a
/// lower-priority test earlier in the window never shadows a
/// higher-priority one later. Advances the next-check stamp to the top of
/// the next hour whenever a scan ran.
pub(crate) fn next_test(
    regex: Option<&TestRegex>,
    state: &mut DeviceState,
    scsi: bool,
    now: i64,
    device_name: &str,
) -> Option<TestKind> {
    let regex = regex?;
    // no test to schedule when the device can run none of them
    if state.not_cap_long
        && state.not_cap_short
        && (scsi || (state.not_cap_conveyance && state.not_cap_offline))
    {
        return None;
    }
    if now < state.scheduled_test_next_check {
        return None;
    }
    if state.scheduled_test_next_check + MAX_LOOKBACK_SECS < now {
        state.scheduled_test_next_check = now - MAX_LOOKBACK_SECS;
    }

    let mut found: Option<(TestKind, i64, u32)> = None;
    let mut max_priority = TEST_PRIORITY.len();
    let mut t = state.scheduled_test_next_check;
    loop {
        if let Some(tm) = Local.timestamp_opt(t, 0).earliest() {
            for (i, kind) in TEST_PRIORITY.iter().enumerate().take(max_priority) {
                if kind.not_capable(state, scsi) {
                    continue;
                }
                if regex.full_match(&schedule_token(*kind, &tm)) {
                    found = Some((*kind, t, tm.hour()));
                    max_priority = i;
                    break;
                }
            }
        }
        if max_priority == 0 || t >= now {
            break;
        }
        t = (t + 3600).min(now);
    }

    // never rescan before the next top of the hour
    let now_tm = Local.timestamp_opt(now, 0).earliest();
    state.scheduled_test_next_check = now_tm.as_ref().map_or(now + 3600, |tm| {
        now + (3600 - i64::from(tm.minute()) * 60 - i64::from(tm.second()))
    });

    let (kind, testtime, scan_hour) = found?;
    state.must_write = true;
    // a match in the current hour slot is on time; anything found at an
    // earlier hour was missed while the daemon was not looking
    let on_time = now_tm.is_some_and(|tm| tm.hour() == scan_hour) && testtime + 3600 > now;
    if !on_time {
        log::info!(
            "{device_name}: overdue scheduled {kind} self-test from {} starting now",
            Local
                .timestamp_opt(testtime, 0)
                .earliest()
                .map_or_else(|| testtime.to_string(), |tm| tm.to_rfc3339())
        );
    }
    Some(kind)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> i64 {
        Local
            .with_ymd_and_hms(y, mo, d, h, mi, 0)
            .single()
            .unwrap()
            .timestamp()
    }

    #[test]
    fn weekday_hour_pattern_picks_long_test() {
        // long test Sundays at 04, short test weekdays at 02
        let regex = TestRegex::new("L/../../7/04|S/../../[1-5]/02").unwrap();
        let mut state = DeviceState {
            // 2024-01-01 is a Monday
            scheduled_test_next_check: at(2024, 1, 1, 0, 0),
            ..DeviceState::default()
        };
        let now = at(2024, 1, 7, 5, 0); // Sunday 05:00
        let kind = next_test(Some(&regex), &mut state, false, now, "/dev/sda");
        assert_eq!(kind, Some(TestKind::Long));
        // next check at the following top of the hour
        assert_eq!(state.scheduled_test_next_check, at(2024, 1, 7, 6, 0));
        assert!(state.must_write);
    }

    #[test]
    fn short_test_runs_when_long_not_due() {
        let regex = TestRegex::new("L/../../7/04|S/../../[1-5]/02").unwrap();
        let mut state = DeviceState {
            scheduled_test_next_check: at(2024, 1, 1, 0, 0),
            ..DeviceState::default()
        };
        let now = at(2024, 1, 1, 2, 30); // Monday 02:30
        let kind = next_test(Some(&regex), &mut state, false, now, "/dev/sda");
        assert_eq!(kind, Some(TestKind::Short));
    }

    #[test]
    fn empty_schedule_never_advances_the_stamp() {
        let mut state = DeviceState {
            scheduled_test_next_check: 12345,
            ..DeviceState::default()
        };
        let kind = next_test(None, &mut state, false, at(2024, 1, 7, 5, 0), "/dev/sda");
        assert_eq!(kind, None);
        assert_eq!(state.scheduled_test_next_check, 12345);
        assert!(!state.must_write);
    }

    #[test]
    fn future_stamp_skips_the_scan() {
        let regex = TestRegex::new("S/../.././..").unwrap();
        let now = at(2024, 1, 1, 2, 0);
        let mut state = DeviceState {
            scheduled_test_next_check: now + 1800,
            ..DeviceState::default()
        };
        assert_eq!(next_test(Some(&regex), &mut state, false, now, "d"), None);
        assert_eq!(state.scheduled_test_next_check, now + 1800);
    }

    #[test]
    fn capability_loss_skips_test_kind() {
        let regex = TestRegex::new("L/../.././02|S/../.././02").unwrap();
        let mut state = DeviceState {
            scheduled_test_next_check: at(2024, 1, 1, 0, 0),
            not_cap_long: true,
            ..DeviceState::default()
        };
        let now = at(2024, 1, 1, 2, 0);
        assert_eq!(
            next_test(Some(&regex), &mut state, false, now, "d"),
            Some(TestKind::Short)
        );
    }

    #[test]
    fn scsi_never_gets_ata_only_tests() {
        let regex = TestRegex::new("C/../.././..|O/../.././..|n/../.././..").unwrap();
        let mut state = DeviceState {
            scheduled_test_next_check: at(2024, 1, 1, 0, 0),
            ..DeviceState::default()
        };
        let now = at(2024, 1, 1, 2, 0);
        assert_eq!(next_test(Some(&regex), &mut state, true, now, "d"), None);
        // the scan still ran, so the stamp advanced
        assert_eq!(state.scheduled_test_next_check, at(2024, 1, 1, 3, 0));
    }

    #[test]
    fn lookback_clamped_to_90_days() {
        let regex = TestRegex::new("S/../.././04").unwrap();
        let now = at(2024, 6, 1, 12, 0);
        let mut state = DeviceState {
            scheduled_test_next_check: at(2023, 1, 1, 0, 0),
            ..DeviceState::default()
        };
        // a match exists long before the clamp window; the scan must still
        // terminate and find one inside it
        let kind = next_test(Some(&regex), &mut state, false, now, "d");
        assert_eq!(kind, Some(TestKind::Short));
    }

    #[test]
    fn higher_priority_later_match_wins() {
        // short at 01, long at 03; polled after both
        let regex = TestRegex::new("S/../.././01|L/../.././03").unwrap();
        let mut state = DeviceState {
            scheduled_test_next_check: at(2024, 1, 1, 0, 30),
            ..DeviceState::default()
        };
        let now = at(2024, 1, 1, 3, 30);
        assert_eq!(
            next_test(Some(&regex), &mut state, false, now, "d"),
            Some(TestKind::Long)
        );
    }
}
