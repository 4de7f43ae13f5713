//! Monitoring engine: initial device scans, the per-cycle check pipeline and
//! state-file bookkeeping

mod ata;
mod scsi;

use std::path::{Path, PathBuf};

use crate::{
    config::DeviceConfig,
    device::{Context, SmartDevice},
    notify::{Event, EventKind, Notifier},
    state::{self, DeviceState, ReadOutcome},
};

/// One registered device with its configuration and state
pub(crate) struct MonitoredDevice {
    /// Effective configuration; directives the device cannot honor are
    /// cleared during the initial scan
    pub cfg: DeviceConfig,
    /// Engine-owned state
    pub state: DeviceState,
    /// Device handle
    pub dev: SmartDevice,
    /// State file location, when persistence is configured
    pub state_path: Option<PathBuf>,
}

/// The monitoring engine
pub(crate) struct Monitor {
    /// Registered devices, in configuration order
    pub devices: Vec<MonitoredDevice>,
    /// Tracing knobs
    ctx: Context,
    /// State file prefix from the command line
    state_prefix: Option<String>,
    /// Critical events seen since startup
    pub failures: u32,
}

impl Monitor {
    /// Engine with no devices registered yet
    pub(crate) fn new(ctx: Context, state_prefix: Option<String>) -> Self {
        Self {
            devices: Vec::new(),
            ctx,
            state_prefix,
            failures: 0,
        }
    }

    /// Tracing knobs
    pub(crate) fn context(&self) -> Context {
        self.ctx
    }

    /// Run the initial scan and register the device; a device that fails
    /// its scan is dropped with a log message.
    pub(crate) fn register_device(
        &mut self,
        cfg: DeviceConfig,
        mut dev: SmartDevice,
        notifier: &mut dyn Notifier,
        now: i64,
    ) -> bool {
        let mut cfg = cfg;
        let mut state = DeviceState::default();
        let scanned = if dev.is_ata() {
            ata::initial_scan(&mut cfg, &mut state, &mut dev, self.state_prefix.as_deref())
        } else {
            scsi::initial_scan(&mut cfg, &mut state, &mut dev, self.state_prefix.as_deref())
        };
        let state_path = match scanned {
            Ok(path) => path,
            Err(e) => {
                log::error!("{}: not monitoring: {e}", dev.name());
                return false;
            }
        };
        // arm the scheduler if the state file had no stamp
        if cfg.test_regex.is_some() && state.scheduled_test_next_check == 0 {
            state.scheduled_test_next_check = now;
        }
        if cfg.email_test {
            let event = Event::new(
                EventKind::EmailTest,
                dev.name(),
                format!("test notification for device {}", dev.name()),
                None,
            );
            crate::notify::dispatch(&cfg, &mut state, notifier, &event, now);
        }
        log::info!(
            "{}: monitoring as {} device",
            dev.name(),
            dev.dev_type()
        );
        dev.close();
        self.devices.push(MonitoredDevice {
            cfg,
            state,
            dev,
            state_path,
        });
        true
    }

    /// Run one check cycle over every device, in configuration order
    pub(crate) fn check_all(
        &mut self,
        notifier: &mut dyn Notifier,
        allow_selftests: bool,
        now: i64,
    ) {
        for md in &mut self.devices {
            if let Err(e) = md.dev.open() {
                let detail = md
                    .dev
                    .last_error()
                    .map_or_else(|| e.to_string(), |le| le.message.clone());
                let event = Event::new(
                    EventKind::OpenFailed,
                    md.dev.name(),
                    format!("unable to open device: {detail}"),
                    None,
                );
                crate::notify::dispatch(&md.cfg, &mut md.state, notifier, &event, now);
                continue;
            }
            let criticals = if md.dev.is_ata() {
                ata::check_device(
                    &md.cfg,
                    &mut md.state,
                    &mut md.dev,
                    notifier,
                    allow_selftests,
                    now,
                )
            } else {
                scsi::check_device(
                    &md.cfg,
                    &mut md.state,
                    &mut md.dev,
                    notifier,
                    allow_selftests,
                    now,
                )
            };
            self.failures += criticals;
            md.dev.close();
        }
    }

    /// Write dirty state files; `write_always` forces every file out
    pub(crate) fn flush_states(&mut self, write_always: bool) {
        for md in &mut self.devices {
            let Some(path) = md.state_path.as_ref() else {
                continue;
            };
            if !write_always && !md.state.must_write {
                continue;
            }
            match state::write_state(path, &md.state) {
                Ok(()) => md.state.must_write = false,
                Err(e) => log::error!("{}: cannot write state file {path:?}: {e}", md.dev.name()),
            }
        }
    }
}

/// Dispatch one event, counting critical ones toward the failure total
#[expect(clippy::too_many_arguments)]
pub(super) fn emit(
    cfg: &DeviceConfig,
    state: &mut DeviceState,
    notifier: &mut dyn Notifier,
    now: i64,
    criticals: &mut u32,
    kind: EventKind,
    device: &str,
    message: String,
    value: Option<i64>,
) {
    if kind.is_critical() {
        *criticals += 1;
    }
    let event = Event::new(kind, device, message, value);
    crate::notify::dispatch(cfg, state, notifier, &event, now);
}

/// Seconds to hold off minimum-temperature tracking after the first
/// observation or a power-state change, so a spin-up transient is not
/// recorded as the all-time low
pub(super) const TEMP_MIN_DELAY_SECS: i64 = 1800;

/// Track the temperature envelope and raise the configured warnings
pub(super) fn check_temperature(
    cfg: &DeviceConfig,
    state: &mut DeviceState,
    notifier: &mut dyn Notifier,
    now: i64,
    criticals: &mut u32,
    name: &str,
    temp: u8,
) {
    if temp == 0 {
        return;
    }
    if state.tempmin_delay == 0 {
        state.tempmin_delay = now + TEMP_MIN_DELAY_SECS;
    }
    if temp > state.tempmax {
        if state.tempmax != 0 {
            log::info!("{name}: new temperature maximum {temp}°C");
        }
        state.tempmax = temp;
        state.must_write = true;
    }
    if now >= state.tempmin_delay && (state.tempmin == 0 || temp < state.tempmin) {
        if state.tempmin != 0 {
            log::info!("{name}: new temperature minimum {temp}°C");
        }
        state.tempmin = temp;
        state.must_write = true;
    }
    if cfg.tempcrit != 0 && temp >= cfg.tempcrit {
        emit(
            cfg,
            state,
            notifier,
            now,
            criticals,
            EventKind::TemperatureCritical,
            name,
            format!(
                "temperature {temp}°C reached critical limit of {}°C (lifetime min/max {}/{}°C)",
                cfg.tempcrit, state.tempmin, state.tempmax
            ),
            Some(i64::from(temp)),
        );
    } else if cfg.tempinfo != 0 && temp >= cfg.tempinfo {
        log::info!(
            "{name}: temperature {temp}°C reached limit of {}°C",
            cfg.tempinfo
        );
    }
    if cfg.tempdiff != 0 && state.temp_last != 0 && temp.abs_diff(state.temp_last) >= cfg.tempdiff
    {
        log::info!(
            "{name}: temperature changed {:+}°C to {temp}°C (lifetime min/max {}/{}°C)",
            i16::from(temp) - i16::from(state.temp_last),
            state.tempmin,
            state.tempmax
        );
    }
    state.temp_last = temp;
}

/// Sanitize one identity component for use in a state file name
fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// State file path `<prefix><MODEL>-<SERIAL>.<kind>.state`, matching how
/// prior runs named it
pub(super) fn state_file_path(
    prefix: Option<&str>,
    model: &str,
    serial: &str,
    kind: &str,
) -> Option<PathBuf> {
    let prefix = prefix?;
    Some(PathBuf::from(format!(
        "{prefix}{}-{}.{kind}.state",
        sanitize(model),
        sanitize(serial)
    )))
}

/// Load persisted state, falling back to live baselines on a missing or
/// corrupt file
pub(super) fn load_state(path: &Path, state: &mut DeviceState, name: &str) -> bool {
    match state::read_state(path, state) {
        Ok(ReadOutcome::Read { bad_lines: 0 }) => {
            log::debug!("{name}: state read from {path:?}");
            true
        }
        Ok(ReadOutcome::Read { bad_lines }) => {
            log::warn!("{name}: {bad_lines} invalid line(s) in state file {path:?}");
            true
        }
        Ok(ReadOutcome::Missing) => false,
        Ok(ReadOutcome::Corrupt) => {
            log::warn!("{name}: state file {path:?} unusable, using live baselines");
            false
        }
        Err(e) => {
            log::warn!("{name}: cannot read state file {path:?}: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::{
        config::parse_config,
        device::{ScsiCompletion, ScsiCore, sat},
        notify::EventKind,
        tests::{
            MockTransport, RecordingNotifier, check_condition_sense, fake_identify,
            fake_smart_values,
        },
        unaligned,
    };

    /// Canonical SAT descriptor sense for a failing SMART RETURN STATUS
    const FAILING_SENSE: [u8; 22] = [
        0x72, 0x00, 0x00, 0x1D, 0x00, 0x00, 0x00, 0x0E, //
        0x09, 0x0C, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, //
        0x00, 0xF4, 0x00, 0x2C, 0x40, 0x50,
    ];

    /// Same sense with the healthy signature
    const HEALTHY_SENSE: [u8; 22] = [
        0x72, 0x00, 0x00, 0x1D, 0x00, 0x00, 0x00, 0x0E, //
        0x09, 0x0C, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, //
        0x00, 0x4F, 0x00, 0xC2, 0x40, 0x50,
    ];

    fn sat_device(transport: MockTransport) -> SmartDevice {
        let core = ScsiCore::new("/dev/mock", Box::new(transport), Context::default());
        SmartDevice::SatTunnel(sat::SatTunnel::new(Box::new(core), sat::SatCdbLen::Cdb16))
    }

    /// Register an ATA device whose scan sees `values`, then run one cycle
    /// where SMART RETURN STATUS answers with `status_sense` and the fresh
    /// attribute read returns `cycle_values`
    fn run_ata_cycle(
        config_line: &str,
        scan_values: [u8; 512],
        status_sense: &[u8],
        cycle_values: [u8; 512],
    ) -> (Monitor, RecordingNotifier) {
        let mut transport = MockTransport::new(vec![
            // scan: identify, smart enable, read values
            Ok(ScsiCompletion::default()),
            Ok(ScsiCompletion::default()),
            Ok(ScsiCompletion::default()),
            // cycle: smart return status (forced check condition), read values
            Ok(check_condition_sense(status_sense)),
            Ok(ScsiCompletion::default()),
        ]);
        transport.data_in = vec![
            fake_identify(1_000_000).to_vec(),
            Vec::new(),
            scan_values.to_vec(),
            Vec::new(),
            cycle_values.to_vec(),
        ];
        let cfg = parse_config(config_line).unwrap().remove(0);
        let mut notifier = RecordingNotifier::default();
        let mut monitor = Monitor::new(Context::default(), None);
        assert!(monitor.register_device(cfg, sat_device(transport), &mut notifier, 1000));
        monitor.check_all(&mut notifier, false, 2000);
        (monitor, notifier)
    }

    #[test]
    fn failing_health_raises_event() {
        let values = fake_smart_values(&[(194, 100, 35)]);
        let (monitor, notifier) = run_ata_cycle(
            "/dev/mock -H -t -m root\n",
            values,
            &FAILING_SENSE,
            values,
        );
        let kinds: Vec<EventKind> = notifier.delivered.iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&EventKind::HealthFailed));
        assert!(monitor.failures >= 1);
    }

    #[test]
    fn healthy_drive_raises_nothing() {
        let values = fake_smart_values(&[(194, 100, 35)]);
        let (monitor, notifier) = run_ata_cycle(
            "/dev/mock -H -t -m root\n",
            values,
            &HEALTHY_SENSE,
            values,
        );
        assert!(notifier.delivered.is_empty());
        assert_eq!(monitor.failures, 0);
    }

    #[test]
    fn critical_raw_change_detected() {
        // attribute 5 raw value goes from 0 to 1 between cycles
        let scan_values = fake_smart_values(&[(5, 100, 0), (194, 100, 35)]);
        let cycle_values = fake_smart_values(&[(5, 100, 1), (194, 100, 35)]);
        let (_, notifier) = run_ata_cycle(
            "/dev/mock -H -t -R 5! -m root\n",
            scan_values,
            &HEALTHY_SENSE,
            cycle_values,
        );
        let raw_events: Vec<_> = notifier
            .delivered
            .iter()
            .filter(|e| e.kind == EventKind::UsageFailedAttr)
            .collect();
        assert_eq!(raw_events.len(), 1);
        assert_eq!(raw_events[0].value, Some(1));
    }

    #[test]
    fn pending_sectors_increase_only() {
        let scan_values = fake_smart_values(&[(197, 100, 2), (198, 100, 0)]);
        let cycle_values = fake_smart_values(&[(197, 100, 2), (198, 100, 0)]);
        // unchanged count with increase-only does not notify
        let (_, notifier) = run_ata_cycle(
            "/dev/mock -H -C 197+ -U 198+ -m root\n",
            scan_values,
            &HEALTHY_SENSE,
            cycle_values,
        );
        assert!(
            !notifier
                .delivered
                .iter()
                .any(|e| e.kind == EventKind::PendingCurrent)
        );

        // an increase notifies with the delta
        let cycle_values = fake_smart_values(&[(197, 100, 5), (198, 100, 0)]);
        let (_, notifier) = run_ata_cycle(
            "/dev/mock -H -C 197+ -U 198+ -m root\n",
            scan_values,
            &HEALTHY_SENSE,
            cycle_values,
        );
        let pending: Vec<_> = notifier
            .delivered
            .iter()
            .filter(|e| e.kind == EventKind::PendingCurrent)
            .collect();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].value, Some(3));
    }

    #[test]
    fn missing_pending_attribute_silently_disabled() {
        // SMART data has no attribute 197; -C must be dropped at scan and
        // never raise an event
        let values = fake_smart_values(&[(5, 100, 0)]);
        let (monitor, notifier) = run_ata_cycle(
            "/dev/mock -H -C 197+ -m root\n",
            values,
            &HEALTHY_SENSE,
            values,
        );
        assert_eq!(monitor.devices[0].cfg.curr_pending_id, 0);
        assert!(
            !notifier
                .delivered
                .iter()
                .any(|e| e.kind == EventKind::PendingCurrent)
        );
    }

    #[test]
    fn temperature_critical_threshold() {
        let scan_values = fake_smart_values(&[(194, 100, 35)]);
        let cycle_values = fake_smart_values(&[(194, 100, 58)]);
        let (_, notifier) = run_ata_cycle(
            "/dev/mock -H -W 5,50,55 -m root\n",
            scan_values,
            &HEALTHY_SENSE,
            cycle_values,
        );
        let temp_events: Vec<_> = notifier
            .delivered
            .iter()
            .filter(|e| e.kind == EventKind::TemperatureCritical)
            .collect();
        assert_eq!(temp_events.len(), 1);
        assert_eq!(temp_events[0].value, Some(58));
    }

    #[test]
    fn open_failure_raises_event() {
        // the scan talks to the device without opening it (the factory did
        // that in production), then every per-cycle open fails
        let mut transport = MockTransport::new(Vec::new());
        transport.data_in = vec![
            fake_identify(1000).to_vec(),
            Vec::new(),
            fake_smart_values(&[(194, 100, 35)]).to_vec(),
        ];
        transport.fail_open = true;
        let cfg = parse_config("/dev/mock -H -m root\n").unwrap().remove(0);
        let mut notifier = RecordingNotifier::default();
        let mut monitor = Monitor::new(Context::default(), None);
        assert!(monitor.register_device(cfg, sat_device(transport), &mut notifier, 1000));
        monitor.check_all(&mut notifier, false, 2000);
        assert_eq!(notifier.delivered.len(), 1);
        assert_eq!(notifier.delivered[0].kind, EventKind::OpenFailed);
    }

    #[test]
    fn scsi_impending_failure_raises_event() {
        let mut inquiry = vec![0u8; 36];
        inquiry[4] = 31;
        inquiry[8..16].copy_from_slice(b"SEAGATE ");
        inquiry[16..32].copy_from_slice(b"ST2000NM0001    ");
        inquiry[32..36].copy_from_slice(b"0002");
        // unit serial VPD page
        let vpd_probe = vec![0x00, 0x80, 0x00, 0x04];
        let vpd_full = vec![0x00, 0x80, 0x00, 0x04, b'S', b'1', b'2', b'3'];
        // IEC mode page, exceptions enabled
        let mut iec = vec![0u8; 64];
        iec[0] = 63;
        iec[4] = 0x1C;
        iec[5] = 10;
        iec[6] = 0x10;
        iec[7] = 0x06;
        // RSOC: LOG SENSE supported, READ CAPACITY 16 not
        let mut rsoc_log = vec![0u8; 64];
        rsoc_log[1] = 0x03;
        unaligned::put_be16(&mut rsoc_log, 2, 10);
        rsoc_log[4 + 3] = 0xFF;
        let rsoc_rc16 = vec![0u8; 64];
        // supported log pages: temperature, self-test, IE
        let sup_header = vec![0x00, 0x00, 0x00, 0x03];
        let sup_full = vec![0x00, 0x00, 0x00, 0x03, 0x0D, 0x10, 0x2F, 0x00];
        // READ CAPACITY (10)
        let mut rc10 = vec![0u8; 8];
        unaligned::put_be32(&mut rc10, 0, 999_999);
        unaligned::put_be32(&mut rc10, 4, 512);
        // IE log page: impending failure asc/ascq and a temperature
        let ie_header = vec![0x2F, 0x00, 0x00, 0x07];
        let ie_full = vec![
            0x2F, 0x00, 0x00, 0x07, //
            0x00, 0x00, 0x00, 0x03, 0x5D, 0x10, 0x2E, 0x00,
        ];
        let mut transport = MockTransport::new(Vec::new());
        transport.data_in = vec![
            Vec::new(), // TEST UNIT READY
            inquiry,
            vpd_probe,
            vpd_full,
            iec,
            rsoc_log,
            rsoc_rc16,
            sup_header,
            sup_full,
            rc10,
            // cycle starts here
            ie_header,
            ie_full,
        ];
        let core = ScsiCore::new("/dev/mock", Box::new(transport), Context::default());
        let dev = SmartDevice::Scsi(core);
        let cfg = parse_config("/dev/mock -H -m root\n").unwrap().remove(0);
        let mut notifier = RecordingNotifier::default();
        let mut monitor = Monitor::new(Context::default(), None);
        assert!(monitor.register_device(cfg, dev, &mut notifier, 1000));
        assert!(monitor.devices[0].state.smart_page_supported);
        assert!(monitor.devices[0].state.temp_page_supported);
        assert_eq!(monitor.devices[0].state.num_sectors, 1_000_000);
        monitor.check_all(&mut notifier, false, 2000);
        let kinds: Vec<EventKind> = notifier.delivered.iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&EventKind::HealthFailed));
        assert!(monitor.failures >= 1);
    }

    #[test]
    fn state_path_sanitized() {
        let path = state_file_path(
            Some("/var/lib/smartmond/"),
            "WDC WD40EZRX-00S",
            "WD-WCC4E1234567",
            "ata",
        )
        .unwrap();
        assert_eq!(
            path,
            PathBuf::from("/var/lib/smartmond/WDC_WD40EZRX_00S-WD_WCC4E1234567.ata.state")
        );
    }

    #[test]
    fn no_prefix_no_path() {
        assert_eq!(state_file_path(None, "m", "s", "ata"), None);
    }
}
