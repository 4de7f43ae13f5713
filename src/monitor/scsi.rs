//! SCSI side of the monitoring engine

use std::path::PathBuf;

use crate::{
    config::DeviceConfig,
    device::{ScsiDevice, SmartDevice, SmartError},
    monitor::{check_temperature, emit, load_state, state_file_path},
    notify::{EventKind, Notifier},
    schedule::{self, TestKind},
    scsi::{
        SimpleErr, asc,
        cmds::{self, ScsiSelfTest},
        pages::{self, TapeAlertSeverity},
    },
    state::DeviceState,
};

/// Unit serial number VPD page
const VPD_UNIT_SERIAL: u8 = 0x80;

/// Serial number from the unit serial VPD page, empty when unavailable
fn unit_serial(scsi: &mut dyn ScsiDevice) -> String {
    let Ok(data) = cmds::inquiry_vpd(scsi, VPD_UNIT_SERIAL, None) else {
        return String::new();
    };
    let len = usize::from(*data.get(3).unwrap_or(&0));
    data.get(4..(4 + len).min(data.len()))
        .map(|bytes| {
            bytes
                .iter()
                .map(|b| char::from(*b))
                .collect::<String>()
                .trim()
                .to_owned()
        })
        .unwrap_or_default()
}

/// Initial scan: readiness, identity, IE setup, log page discovery, state
/// load
pub(super) fn initial_scan(
    cfg: &mut DeviceConfig,
    state: &mut DeviceState,
    dev: &mut SmartDevice,
    state_prefix: Option<&str>,
) -> Result<Option<PathBuf>, SmartError> {
    let Some(scsi) = dev.as_scsi() else {
        return Err(SmartError::Unsupported("not a SCSI device"));
    };
    let name = scsi.name().to_owned();

    match cmds::test_unit_ready(scsi)? {
        SimpleErr::Ok => {}
        err @ (SimpleErr::NotReady | SimpleErr::NoMedium | SimpleErr::BecomingReady) => {
            return Err(SmartError::Sense(err));
        }
        other => log::warn!("{name}: unexpected TEST UNIT READY answer: {other}"),
    }

    let inq = cmds::inquiry(scsi)?;
    state.tape_device = inq.is_tape();
    let serial = unit_serial(scsi);
    log::debug!(
        "{name}: {} {} rev {}, serial {serial}{}",
        inq.vendor,
        inq.product,
        inq.revision,
        if inq.removable { ", removable" } else { "" }
    );
    if inq.is_ata_bridge() {
        log::info!("{name}: SATL bridge detected, ATA pass-through may give better results");
    }

    match pages::fetch_iec(scsi, &mut state.mode_sense_len) {
        Ok(mut page) => {
            if !page.exceptions_enabled() {
                log::info!("{name}: informational exceptions (SMART) reporting disabled");
                let want_warnings = cfg.tempdiff != 0 || cfg.tempinfo != 0 || cfg.tempcrit != 0;
                if cfg.smartcheck || want_warnings {
                    match pages::set_exception_control(scsi, &mut page, want_warnings) {
                        Ok(()) => log::info!("{name}: informational exceptions enabled"),
                        Err(e) => {
                            log::warn!("{name}: cannot enable informational exceptions: {e}");
                        }
                    }
                }
            } else {
                log::debug!(
                    "{name}: informational exceptions enabled, mrie {}",
                    page.mrie()
                );
            }
        }
        Err(e) => {
            if cfg.permissive {
                log::warn!("{name}: bad IEC mode page: {e}");
            } else {
                return Err(e);
            }
        }
    }

    let op_support = cmds::probe_opcode_support(scsi);
    if op_support.rsoc && !op_support.log_sense {
        log::info!("{name}: LOG SENSE not supported, log page monitoring disabled");
    } else {
        if op_support.log_sense_subpages {
            log::debug!("{name}: LOG SENSE accepts subpage codes");
        }
        match cmds::supported_log_pages(scsi) {
            Ok(pages_list) => {
                state.smart_page_supported = pages_list.contains(&cmds::LP_IE);
                state.temp_page_supported = pages_list.contains(&cmds::LP_TEMPERATURE);
                state.selftest_page_supported = pages_list.contains(&cmds::LP_SELF_TEST);
                state.bg_scan_supported = pages_list.contains(&cmds::LP_BACKGROUND_SCAN);
            }
            Err(e) => log::debug!("{name}: cannot read supported log pages: {e}"),
        }
    }
    match cmds::read_capacity(scsi, op_support.read_capacity16) {
        Ok(capacity) => {
            state.num_sectors = capacity.num_blocks;
            log::debug!(
                "{name}: {} blocks of {} bytes",
                capacity.num_blocks,
                capacity.block_size
            );
        }
        Err(e) => log::debug!("{name}: cannot read capacity: {e}"),
    }
    if cfg.selftest && !state.selftest_page_supported {
        log::info!("{name}: no self-test results log page, log monitoring disabled");
        cfg.selftest = false;
    }
    if cfg.errorlog {
        // the ATA error log has no SCSI counterpart
        cfg.errorlog = false;
    }
    if cfg.powermode.is_some() {
        log::info!("{name}: power-mode skipping not supported on SCSI devices");
        cfg.powermode = None;
    }
    state.not_cap_conveyance = true;
    state.not_cap_offline = true;
    state.not_cap_selective = true;

    let path = state_file_path(state_prefix, &inq.product, &serial, "scsi");
    let loaded = path
        .as_ref()
        .is_some_and(|p| load_state(p, state, &name));
    if cfg.selftest && !loaded {
        match cmds::log_sense(scsi, cmds::LP_SELF_TEST, 0) {
            Ok(data) => {
                let (count, hour) = pages::scsi_self_test_errors(&data);
                state.selflogcount = count;
                state.selfloghour = u32::from(hour);
            }
            Err(e) => log::debug!("{name}: cannot prime self-test error count: {e}"),
        }
    }
    Ok(path)
}

/// Per-cycle check pipeline; returns the number of critical events raised
pub(super) fn check_device(
    cfg: &DeviceConfig,
    state: &mut DeviceState,
    dev: &mut SmartDevice,
    notifier: &mut dyn Notifier,
    allow_selftests: bool,
    now: i64,
) -> u32 {
    let mut criticals = 0u32;
    let Some(scsi) = dev.as_scsi() else {
        return criticals;
    };
    let name = scsi.name().to_owned();
    let want_temp = cfg.tempdiff != 0 || cfg.tempinfo != 0 || cfg.tempcrit != 0;

    if cfg.smartcheck || want_temp {
        check_ie(cfg, state, scsi, notifier, now, &mut criticals, &name, want_temp);
    }

    if state.tape_device && cfg.smartcheck {
        check_tape_alerts(cfg, state, scsi, notifier, now, &mut criticals, &name);
    }

    if state.bg_scan_supported {
        if let Ok(data) = cmds::log_sense(scsi, cmds::LP_BACKGROUND_SCAN, 0) {
            if let Some(status) = pages::background_scan_status(&data) {
                log::debug!("{name}: background media scan {status}");
            }
        }
    }

    if cfg.selftest {
        match cmds::log_sense(scsi, cmds::LP_SELF_TEST, 0) {
            Ok(data) => {
                let (newc, newh) = pages::scsi_self_test_errors(&data);
                let newh = u32::from(newh);
                if state.selflogcount < newc {
                    emit(
                        cfg,
                        state,
                        notifier,
                        now,
                        &mut criticals,
                        EventKind::SelfTestError,
                        &name,
                        format!(
                            "self-test log error count increased from {} to {newc}",
                            state.selflogcount
                        ),
                        Some(i64::from(newc)),
                    );
                } else if state.selfloghour != newh && newc != 0 {
                    emit(
                        cfg,
                        state,
                        notifier,
                        now,
                        &mut criticals,
                        EventKind::SelfTestError,
                        &name,
                        format!("new self-test log error at power-on hour {newh}"),
                        Some(i64::from(newh)),
                    );
                }
                if state.selflogcount != newc || state.selfloghour != newh {
                    state.selflogcount = newc;
                    state.selfloghour = newh;
                    state.must_write = true;
                }
            }
            Err(e) => emit(
                cfg,
                state,
                notifier,
                now,
                &mut criticals,
                EventKind::FailedToReadSelfTestLog,
                &name,
                format!("cannot read self-test results log: {e}"),
                None,
            ),
        }
    }

    if allow_selftests && cfg.test_regex.is_some() {
        run_scheduled_test(cfg, state, scsi, now, &name);
    }

    criticals
}

/// Health and temperature via the informational exceptions machinery
#[expect(clippy::too_many_arguments)]
fn check_ie(
    cfg: &DeviceConfig,
    state: &mut DeviceState,
    scsi: &mut dyn ScsiDevice,
    notifier: &mut dyn Notifier,
    now: i64,
    criticals: &mut u32,
    name: &str,
    want_temp: bool,
) {
    let status = if state.smart_page_supported {
        pages::ie_status(scsi)
    } else {
        cmds::request_sense(scsi).map(|disect| (disect.asc, disect.ascq, None))
    };
    match status {
        Ok((ie_asc, ie_ascq, temp)) => {
            if cfg.smartcheck {
                if ie_asc == asc::IMPENDING_FAILURE {
                    if !state.suppress_report {
                        emit(
                            cfg,
                            state,
                            notifier,
                            now,
                            criticals,
                            EventKind::HealthFailed,
                            name,
                            format!(
                                "failure prediction threshold exceeded (asc {ie_asc:#04x}, ascq {ie_ascq:#04x})"
                            ),
                            Some(i64::from(ie_ascq)),
                        );
                        state.suppress_report = true;
                    }
                } else {
                    if ie_asc == asc::WARNING {
                        log::warn!("{name}: warning condition (ascq {ie_ascq:#04x})");
                    }
                    state.suppress_report = false;
                }
            }
            if want_temp {
                let temp = match temp {
                    Some(t) => Some(t),
                    None if state.temp_page_supported => {
                        pages::temperature_from_log(scsi).unwrap_or(None)
                    }
                    None => None,
                };
                if let Some(temp) = temp {
                    check_temperature(cfg, state, notifier, now, criticals, name, temp);
                }
            }
        }
        Err(e) => {
            if cfg.smartcheck {
                emit(
                    cfg,
                    state,
                    notifier,
                    now,
                    criticals,
                    EventKind::FailedToReadHealth,
                    name,
                    format!("cannot read informational exception status: {e}"),
                    None,
                );
            }
        }
    }
}

/// TapeAlert flags; critical ones notify, the rest are logged
fn check_tape_alerts(
    cfg: &DeviceConfig,
    state: &mut DeviceState,
    scsi: &mut dyn ScsiDevice,
    notifier: &mut dyn Notifier,
    now: i64,
    criticals: &mut u32,
    name: &str,
) {
    let data = match cmds::log_sense(scsi, cmds::LP_TAPE_ALERTS, 0) {
        Ok(data) => data,
        Err(e) => {
            log::debug!("{name}: cannot read TapeAlert page: {e}");
            return;
        }
    };
    for alert in pages::parse_tape_alerts(&data) {
        match alert.severity {
            TapeAlertSeverity::Critical => emit(
                cfg,
                state,
                notifier,
                now,
                criticals,
                EventKind::HealthFailed,
                name,
                format!("TapeAlert {}: {}", alert.flag, alert.message),
                Some(i64::from(alert.flag)),
            ),
            TapeAlertSeverity::Warning => {
                log::warn!("{name}: TapeAlert {}: {}", alert.flag, alert.message);
            }
            TapeAlertSeverity::Information => {
                log::info!("{name}: TapeAlert {}: {}", alert.flag, alert.message);
            }
        }
    }
}

/// Launch at most one scheduled background self-test if one is due
fn run_scheduled_test(
    cfg: &DeviceConfig,
    state: &mut DeviceState,
    scsi: &mut dyn ScsiDevice,
    now: i64,
    name: &str,
) {
    let Some(kind) = schedule::next_test(cfg.test_regex.as_ref(), state, true, now, name) else {
        return;
    };
    // don't interrupt a test the device is already running
    if let Ok(disect) = cmds::request_sense(scsi) {
        if disect.self_test_in_progress() {
            let remaining = disect
                .progress
                .map_or(0, |p| 100 - u32::from(p) * 100 / 65535);
            log::info!(
                "{name}: skipping scheduled {kind} self-test, {remaining}% of current test remaining"
            );
            return;
        }
    }
    let test = match kind {
        TestKind::Short => ScsiSelfTest::ShortBackground,
        TestKind::Long => ScsiSelfTest::LongBackground,
        other => {
            log::warn!("{name}: {other} self-test not available on SCSI devices");
            return;
        }
    };
    match cmds::send_diagnostic(scsi, test) {
        Ok(()) => log::info!("{name}: starting scheduled {kind} self-test"),
        Err(e) => {
            log::error!("{name}: executing {kind} self-test failed: {e}");
            match kind {
                TestKind::Short => state.not_cap_short = true,
                TestKind::Long => state.not_cap_long = true,
                _ => {}
            }
        }
    }
}
