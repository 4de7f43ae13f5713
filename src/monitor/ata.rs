//! ATA side of the monitoring engine

use std::path::PathBuf;

use crate::{
    ata::{
        cmds::{self, HealthStatus, PowerMode, SelectiveMode},
        smart::{SelfTestLog, SmartThresholds, SmartValues, error_log_count},
    },
    config::{DeviceConfig, FirmwareFix, PresetMode, Toggle, attr_flag},
    device::{AtaDevice, SmartDevice, SmartError},
    monitor::{TEMP_MIN_DELAY_SECS, check_temperature, emit, load_state, state_file_path},
    notify::{EventKind, Notifier},
    schedule::{self, TestKind},
    state::DeviceState,
};

/// Settle time before re-reading the power mode of a drive that looked
/// spun down, so a spin-up in progress is not mistaken for idleness
const POWER_MODE_RECHECK: std::time::Duration = std::time::Duration::from_secs(5);

/// Initial scan: identity, SMART setup, capability discovery, state load.
///
/// Directives the device cannot honor are cleared here so the per-cycle
/// path never retries them.
pub(super) fn initial_scan(
    cfg: &mut DeviceConfig,
    state: &mut DeviceState,
    dev: &mut SmartDevice,
    state_prefix: Option<&str>,
) -> Result<Option<PathBuf>, SmartError> {
    let Some(ata) = dev.as_ata() else {
        return Err(SmartError::Unsupported("not an ATA device"));
    };
    let name = ata.name().to_owned();

    let id = cmds::identify(ata)?;
    state.num_sectors = cmds::identify_sectors(&id);
    let model = cmds::identify_model(&id);
    let serial = cmds::identify_serial(&id);
    log::debug!(
        "{name}: model {model}, serial {serial}, {} sectors",
        state.num_sectors
    );
    if cfg.presets != PresetMode::Use {
        // no attribute preset database is compiled in; `-v` overrides cover
        // the same ground per device
        log::debug!("{name}: attribute presets not available, -P {} ignored", cfg.presets);
    }

    if let Err(e) = cmds::smart_enable(ata) {
        if cfg.permissive {
            log::warn!("{name}: could not enable SMART: {e}");
        } else {
            return Err(e);
        }
    }
    match cfg.autosave {
        Toggle::Unchanged => {}
        Toggle::On | Toggle::Off => {
            let on = cfg.autosave == Toggle::On;
            match cmds::smart_autosave(ata, on) {
                Ok(()) => log::info!("{name}: attribute autosave {}", cfg.autosave),
                Err(e) => log::warn!("{name}: could not change attribute autosave: {e}"),
            }
        }
    }
    match cfg.auto_offline {
        Toggle::Unchanged => {}
        Toggle::On | Toggle::Off => {
            let on = cfg.auto_offline == Toggle::On;
            match cmds::smart_auto_offline(ata, on) {
                Ok(()) => log::info!("{name}: automatic offline testing {}", cfg.auto_offline),
                Err(e) => log::warn!("{name}: could not change automatic offline testing: {e}"),
            }
        }
    }

    // attribute monitoring needs SMART READ DATA to work at least once
    let values = match cmds::read_smart_values(ata) {
        Ok(raw) => Some(SmartValues::parse(&raw)),
        Err(e) => {
            log::warn!("{name}: cannot read SMART data, attribute monitoring disabled: {e}");
            cfg.usagefailed = false;
            cfg.prefail = false;
            cfg.usage = false;
            cfg.curr_pending_id = 0;
            cfg.offl_pending_id = 0;
            cfg.tempdiff = 0;
            cfg.tempinfo = 0;
            cfg.tempcrit = 0;
            None
        }
    };
    let thresholds = if values.is_some() && cfg.usagefailed {
        match cmds::read_smart_thresholds(ata) {
            Ok(raw) => Some(SmartThresholds::parse(&raw)),
            Err(e) => {
                log::warn!("{name}: cannot read SMART thresholds, usage failure check disabled: {e}");
                cfg.usagefailed = false;
                None
            }
        }
    } else {
        None
    };

    if let Some(values) = &values {
        if cfg.curr_pending_id != 0 && values.attr(cfg.curr_pending_id).is_none() {
            cfg.curr_pending_id = 0;
        }
        if cfg.offl_pending_id != 0 && values.attr(cfg.offl_pending_id).is_none() {
            cfg.offl_pending_id = 0;
        }
        if (cfg.tempdiff != 0 || cfg.tempinfo != 0 || cfg.tempcrit != 0)
            && values.temperature().is_none()
        {
            log::info!("{name}: no temperature attribute, temperature monitoring disabled");
            cfg.tempdiff = 0;
            cfg.tempinfo = 0;
            cfg.tempcrit = 0;
        }
        state.not_cap_short = !values.supports_self_test();
        state.not_cap_long = !values.supports_self_test();
        state.not_cap_conveyance = !values.supports_conveyance();
        state.not_cap_offline = !values.supports_offline_immediate();
        state.not_cap_selective = !values.supports_selective();
        if (cfg.selftest || cfg.errorlog)
            && values.errorlog_capability & 0x01 == 0
            && !cfg.permissive
        {
            log::info!("{name}: no SMART error logging capability, log monitoring disabled");
            cfg.selftest = false;
            cfg.errorlog = false;
        }
    }

    if cfg.powermode.is_some() {
        match cmds::check_power_mode(ata) {
            Ok(PowerMode::Unknown) | Err(_) => {
                log::warn!("{name}: CHECK POWER MODE not working, power-mode skipping disabled");
                cfg.powermode = None;
            }
            Ok(_) => {}
        }
    }

    let path = state_file_path(state_prefix, &model, &serial, "ata");
    let loaded = path
        .as_ref()
        .is_some_and(|p| load_state(p, state, &name));

    if let Some(values) = values {
        if !loaded {
            state.snapshot_attributes(&values);
        }
        state.smart_values = Some(values);
        state.smart_thresholds = thresholds;
    }
    if cfg.selftest && !loaded {
        match read_selftest_errors(ata, cfg.fix_firmwarebug) {
            Ok((count, hour)) => {
                state.selflogcount = count;
                state.selfloghour = u32::from(hour);
            }
            Err(e) => {
                if !cfg.permissive {
                    log::info!("{name}: no SMART self-test log, log monitoring disabled: {e}");
                    cfg.selftest = false;
                }
            }
        }
    }
    if cfg.errorlog && !loaded {
        match read_error_count(ata) {
            Ok(count) => state.ataerrorcount = count,
            Err(e) => {
                if !cfg.permissive {
                    log::info!("{name}: no SMART error log, log monitoring disabled: {e}");
                    cfg.errorlog = false;
                }
            }
        }
    }
    Ok(path)
}

/// Failed self-test count and most-recent-failure hour from the self-test
/// log
fn read_selftest_errors(
    ata: &mut dyn AtaDevice,
    fix: FirmwareFix,
) -> Result<(u32, u16), SmartError> {
    let raw = cmds::smart_read_log(ata, cmds::log_addr::SELF_TEST, 1)?;
    let swap = matches!(fix, FirmwareFix::Samsung | FirmwareFix::Samsung2);
    let log = SelfTestLog::parse(&raw, swap).ok_or(SmartError::BadResponse("self-test log"))?;
    Ok(log.error_count_and_hour())
}

/// Error count from the summary error log
fn read_error_count(ata: &mut dyn AtaDevice) -> Result<u32, SmartError> {
    let raw = cmds::smart_read_log(ata, cmds::log_addr::ERROR, 1)?;
    error_log_count(&raw).ok_or(SmartError::BadResponse("error log"))
}

/// Whether this cycle needs a fresh SMART READ DATA
fn needs_smart_data(cfg: &DeviceConfig) -> bool {
    cfg.usagefailed
        || cfg.prefail
        || cfg.usage
        || cfg.curr_pending_id != 0
        || cfg.offl_pending_id != 0
        || cfg.tempdiff != 0
        || cfg.tempinfo != 0
        || cfg.tempcrit != 0
        || cfg.test_regex.is_some()
}

/// Power-mode gate: true when this cycle should be skipped entirely
fn power_mode_skip(
    cfg: &DeviceConfig,
    state: &mut DeviceState,
    ata: &mut dyn AtaDevice,
    name: &str,
    now: i64,
) -> bool {
    let Some(threshold) = cfg.powermode else {
        return false;
    };
    if state.powermodefail {
        return false;
    }
    let mode = match cmds::check_power_mode(ata) {
        Ok(mode) => mode,
        Err(e) => {
            log::warn!("{name}: CHECK POWER MODE failed, power-mode skipping disabled: {e}");
            state.powermodefail = true;
            return false;
        }
    };
    let mode = if mode.is_low_power(threshold) {
        // the first answer may catch a drive mid-spin-up
        std::thread::sleep(POWER_MODE_RECHECK);
        cmds::check_power_mode(ata).unwrap_or(mode)
    } else {
        mode
    };
    if mode == PowerMode::Unknown {
        log::warn!("{name}: CHECK POWER MODE returned unknown value, power-mode skipping disabled");
        state.powermodefail = true;
        return false;
    }
    if !mode.is_low_power(threshold) {
        if state.powerskipcnt != 0 {
            if !cfg.powerquiet {
                log::info!(
                    "{name}: previous checks skipped ({} times) while in low-power mode",
                    state.powerskipcnt
                );
            }
            state.powerskipcnt = 0;
            // the drive just spun up; hold off minimum tracking so the
            // transient does not register as a new low
            state.tempmin_delay = now + TEMP_MIN_DELAY_SECS;
        }
        return false;
    }
    state.powerskipcnt = state.powerskipcnt.saturating_add(1);
    if cfg.powerskipmax != 0 && state.powerskipcnt >= cfg.powerskipmax {
        log::info!(
            "{name}: in {mode} mode, but checks forced after {} skipped cycles",
            state.powerskipcnt
        );
        state.powerskipcnt = 0;
        state.tempmin_delay = now + TEMP_MIN_DELAY_SECS;
        return false;
    }
    if !cfg.powerquiet {
        log::info!(
            "{name}: in {mode} mode, skipping checks ({} skipped so far)",
            state.powerskipcnt
        );
    }
    true
}

/// Per-cycle check pipeline; returns the number of critical events raised
#[expect(clippy::too_many_lines)]
pub(super) fn check_device(
    cfg: &DeviceConfig,
    state: &mut DeviceState,
    dev: &mut SmartDevice,
    notifier: &mut dyn Notifier,
    allow_selftests: bool,
    now: i64,
) -> u32 {
    let mut criticals = 0u32;
    let Some(ata) = dev.as_ata() else {
        return criticals;
    };
    let name = ata.name().to_owned();

    if power_mode_skip(cfg, state, ata, &name, now) {
        return criticals;
    }

    if cfg.smartcheck {
        match cmds::smart_return_status(ata) {
            Ok(HealthStatus::Healthy) => {}
            Ok(HealthStatus::Failing) => emit(
                cfg,
                state,
                notifier,
                now,
                &mut criticals,
                EventKind::HealthFailed,
                &name,
                "SMART health status reports imminent failure".to_owned(),
                None,
            ),
            Ok(HealthStatus::Unknown) => emit(
                cfg,
                state,
                notifier,
                now,
                &mut criticals,
                EventKind::FailedToReadHealth,
                &name,
                "SMART RETURN STATUS returned unidentifiable registers".to_owned(),
                None,
            ),
            Err(e) => emit(
                cfg,
                state,
                notifier,
                now,
                &mut criticals,
                EventKind::FailedToReadHealth,
                &name,
                format!("cannot read SMART health status: {e}"),
                None,
            ),
        }
    }

    let mut new_values = None;
    if needs_smart_data(cfg) {
        match cmds::read_smart_values(ata) {
            Ok(raw) => new_values = Some(SmartValues::parse(&raw)),
            Err(e) => emit(
                cfg,
                state,
                notifier,
                now,
                &mut criticals,
                EventKind::FailedToReadSmartData,
                &name,
                format!("cannot read SMART data: {e}"),
                None,
            ),
        }
    }

    if let Some(new) = new_values {
        check_attributes(cfg, state, notifier, now, &mut criticals, &name, &new);
        check_pending(
            cfg,
            state,
            notifier,
            now,
            &mut criticals,
            &name,
            &new,
            cfg.curr_pending_id,
            cfg.curr_pending_incr,
            EventKind::PendingCurrent,
            "currently unreadable (pending)",
        );
        check_pending(
            cfg,
            state,
            notifier,
            now,
            &mut criticals,
            &name,
            &new,
            cfg.offl_pending_id,
            cfg.offl_pending_incr,
            EventKind::PendingOffline,
            "offline uncorrectable",
        );
        if cfg.tempdiff != 0 || cfg.tempinfo != 0 || cfg.tempcrit != 0 {
            if let Some(temp) = new.temperature() {
                check_temperature(cfg, state, notifier, now, &mut criticals, &name, temp);
            }
        }
        state.snapshot_attributes(&new);
        state.smart_values = Some(new);
    }

    if cfg.selftest {
        match read_selftest_errors(ata, cfg.fix_firmwarebug) {
            Ok((newc, newh)) => {
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
                    // hour stamps wrap with the drive's 16-bit counter
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
                format!("cannot read SMART self-test log: {e}"),
                None,
            ),
        }
    }

    if cfg.errorlog {
        match read_error_count(ata) {
            Ok(newc) => {
                if state.ataerrorcount < newc {
                    emit(
                        cfg,
                        state,
                        notifier,
                        now,
                        &mut criticals,
                        EventKind::AtaErrorCountIncreased,
                        &name,
                        format!(
                            "ATA error count increased from {} to {newc}",
                            state.ataerrorcount
                        ),
                        Some(i64::from(newc)),
                    );
                }
                if state.ataerrorcount != newc {
                    state.ataerrorcount = newc;
                    state.must_write = true;
                }
            }
            Err(e) => emit(
                cfg,
                state,
                notifier,
                now,
                &mut criticals,
                EventKind::FailedToReadErrorLog,
                &name,
                format!("cannot read SMART error log: {e}"),
                None,
            ),
        }
    }

    if allow_selftests && cfg.test_regex.is_some() {
        run_scheduled_test(cfg, state, ata, now, &name);
    }

    criticals
}

/// Threshold failures and change tracking over the 30 attribute slots
fn check_attributes(
    cfg: &DeviceConfig,
    state: &mut DeviceState,
    notifier: &mut dyn Notifier,
    now: i64,
    criticals: &mut u32,
    name: &str,
    new: &SmartValues,
) {
    let thresholds = state.smart_thresholds;
    let prev = state.ata_attributes;
    for (slot, attr) in prev.iter().zip(new.attrs.iter()) {
        if attr.id == 0 {
            continue;
        }
        let flags = &cfg.attribute_flags;
        // usage attribute crossing its threshold predicts trouble
        if cfg.usagefailed
            && !attr.is_prefail()
            && !flags.has(attr.id, attr_flag::IGNORE_FAILURE)
        {
            if let Some(thresh) = thresholds.as_ref().and_then(|t| t.threshold(attr.id)) {
                if (1..=0xFD).contains(&thresh) && attr.current <= thresh {
                    emit(
                        cfg,
                        state,
                        notifier,
                        now,
                        criticals,
                        EventKind::UsageFailedAttr,
                        name,
                        format!(
                            "usage attribute {} failed: normalized value {} below threshold {thresh}",
                            attr.id, attr.current
                        ),
                        Some(i64::from(attr.current)),
                    );
                }
            }
        }
        // change tracking against the last cycle's snapshot
        if slot.id != attr.id {
            continue;
        }
        let tracked = if attr.is_prefail() {
            cfg.prefail
        } else {
            cfg.usage
        };
        if !tracked || flags.has(attr.id, attr_flag::IGNORE_TRACKING) {
            continue;
        }
        let raw_suffix = if flags.has(attr.id, attr_flag::PRINT_RAW) {
            format!(" (raw {})", cfg.raw_formats.get(attr.id).render(attr.raw48()))
        } else {
            String::new()
        };
        if slot.val != attr.current {
            let message = format!(
                "SMART attribute {} changed from {} to {}{raw_suffix}",
                attr.id, slot.val, attr.current
            );
            if flags.has(attr.id, attr_flag::CRIT_CHANGE) {
                emit(
                    cfg,
                    state,
                    notifier,
                    now,
                    criticals,
                    EventKind::UsageFailedAttr,
                    name,
                    message,
                    Some(i64::from(attr.current)),
                );
            } else {
                log::info!("{name}: {message}");
            }
        }
        if flags.has(attr.id, attr_flag::TRACK_RAW) && slot.raw != attr.raw48() {
            let delta = attr.raw48() as i64 - slot.raw as i64;
            let message = format!(
                "SMART attribute {} raw value changed from {} to {} ({delta:+})",
                attr.id,
                slot.raw,
                attr.raw48()
            );
            if flags.has(attr.id, attr_flag::CRIT_RAW_CHANGE) {
                emit(
                    cfg,
                    state,
                    notifier,
                    now,
                    criticals,
                    EventKind::UsageFailedAttr,
                    name,
                    message,
                    Some(delta),
                );
            } else {
                log::info!("{name}: {message}");
            }
        }
    }
}

/// Pending/uncorrectable sector attribute check
#[expect(clippy::too_many_arguments)]
fn check_pending(
    cfg: &DeviceConfig,
    state: &mut DeviceState,
    notifier: &mut dyn Notifier,
    now: i64,
    criticals: &mut u32,
    name: &str,
    new: &SmartValues,
    id: u8,
    increase_only: bool,
    kind: EventKind,
    what: &str,
) {
    if id == 0 {
        return;
    }
    let Some(attr) = new.attr(id) else {
        return;
    };
    let raw = attr.raw48();
    let prev_raw = state
        .ata_attributes
        .iter()
        .find(|a| a.id == id)
        .map_or(0, |a| a.raw);
    if raw == 0 || (increase_only && raw <= prev_raw) {
        return;
    }
    let delta = raw as i64 - prev_raw as i64;
    let suffix = if increase_only {
        format!(" (changed {delta:+})")
    } else {
        String::new()
    };
    emit(
        cfg,
        state,
        notifier,
        now,
        criticals,
        kind,
        name,
        format!("{raw} {what} sectors{suffix}"),
        Some(delta),
    );
}

/// Launch at most one scheduled self-test if the calendar says one is due
fn run_scheduled_test(
    cfg: &DeviceConfig,
    state: &mut DeviceState,
    ata: &mut dyn AtaDevice,
    now: i64,
    name: &str,
) {
    let Some(kind) = schedule::next_test(cfg.test_regex.as_ref(), state, false, now, name) else {
        return;
    };
    let Some(values) = state.smart_values else {
        log::warn!("{name}: no SMART data available, skipping scheduled {kind} self-test");
        return;
    };
    if values.self_test_in_progress() {
        if cfg.fix_firmwarebug == FirmwareFix::Samsung3 && values.self_test_exec_status == 0xF0 {
            log::info!(
                "{name}: not skipping scheduled {kind} self-test despite unclear progress byte"
            );
        } else {
            log::info!(
                "{name}: skipping scheduled {kind} self-test, {}% of current test remaining",
                values.self_test_percent_remaining()
            );
            return;
        }
    }
    // capability may have been lost since the scan
    let capable = match kind {
        TestKind::Long | TestKind::Short => values.supports_self_test(),
        TestKind::Conveyance => values.supports_conveyance(),
        TestKind::Offline => values.supports_offline_immediate(),
        TestKind::SelectiveNext | TestKind::SelectiveCont | TestKind::SelectiveRedo => {
            values.supports_selective()
        }
    };
    if !capable {
        log::error!("{name}: not capable of {kind} self-test");
        match kind {
            TestKind::Long => state.not_cap_long = true,
            TestKind::Short => state.not_cap_short = true,
            TestKind::Conveyance => state.not_cap_conveyance = true,
            TestKind::Offline => state.not_cap_offline = true,
            TestKind::SelectiveNext | TestKind::SelectiveCont | TestKind::SelectiveRedo => {
                state.not_cap_selective = true;
            }
        }
        return;
    }
    let subcommand = match kind {
        TestKind::Offline => 0x00,
        TestKind::Short => 0x01,
        TestKind::Long => 0x02,
        TestKind::Conveyance => 0x03,
        TestKind::SelectiveNext | TestKind::SelectiveCont | TestKind::SelectiveRedo => 0x04,
    };
    let selective_mode = match kind {
        TestKind::SelectiveNext => Some(SelectiveMode::Next),
        TestKind::SelectiveCont => Some(SelectiveMode::Cont),
        TestKind::SelectiveRedo => Some(SelectiveMode::Redo),
        _ => None,
    };
    if let Some(mode) = selective_mode {
        match cmds::prepare_selective_log(ata, mode, state.num_sectors) {
            Ok((start, end)) => {
                log::info!("{name}: selective self-test span set to LBA {start}-{end}");
            }
            Err(e) => {
                log::error!("{name}: preparing {kind} self-test failed: {e}");
                return;
            }
        }
    }
    match cmds::execute_offline_immediate(ata, subcommand) {
        Ok(()) => {
            log::info!("{name}: starting scheduled {kind} self-test");
            if kind != TestKind::Offline {
                // force a fresh progress read next cycle
                if let Some(values) = state.smart_values.as_mut() {
                    values.self_test_exec_status = 0xFF;
                }
            }
        }
        Err(e) => log::error!("{name}: executing {kind} self-test failed: {e}"),
    }
}
