//! Signal-driven daemon lifecycle: reload, forced checks, graceful exit

use std::{
    fs, io,
    path::PathBuf,
    sync::atomic::{AtomicBool, AtomicI32, Ordering},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::{
    config::{self, DeviceConfig},
    device::{Context, classify_scsi_device},
    monitor::Monitor,
    notify::{ExecNotifier, Notifier},
    os, schedule,
};

/// Exit codes
pub(crate) mod exit_code {
    pub(crate) const OK: u8 = 0;
    pub(crate) const BAD_CMDLINE: u8 = 1;
    pub(crate) const BAD_CONFIG: u8 = 2;
    pub(crate) const PIDFILE: u8 = 4;
    pub(crate) const CONFIG_MISSING: u8 = 5;
    pub(crate) const CONFIG_UNREADABLE: u8 = 6;
    pub(crate) const DEVICE_FAILURE: u8 = 16;
    pub(crate) const NO_DEVICES: u8 = 17;
    pub(crate) const SIGNALLED: u8 = 254;
}

/// Reload requested (HUP)
static CAUGHT_HUP: AtomicBool = AtomicBool::new(false);
/// Immediate check requested (USR1)
static CAUGHT_USR1: AtomicBool = AtomicBool::new(false);
/// Terminating signal number, 0 when none arrived yet
static CAUGHT_EXIT: AtomicI32 = AtomicI32::new(0);

extern "C" fn on_hup(_sig: i32) {
    CAUGHT_HUP.store(true, Ordering::Relaxed);
}

extern "C" fn on_usr1(_sig: i32) {
    CAUGHT_USR1.store(true, Ordering::Relaxed);
}

extern "C" fn on_exit_signal(sig: i32) {
    CAUGHT_EXIT.store(sig, Ordering::Relaxed);
}

/// Install the sticky-flag signal handlers
fn install_signal_handlers() -> nix::Result<()> {
    let install = |sig: Signal, handler: extern "C" fn(i32)| {
        let action = SigAction::new(
            SigHandler::Handler(handler),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        // SAFETY: the handlers only store to atomics, which is
        // async-signal-safe
        unsafe { signal::sigaction(sig, &action) }.map(|_| ())
    };
    install(Signal::SIGHUP, on_hup)?;
    install(Signal::SIGUSR1, on_usr1)?;
    install(Signal::SIGTERM, on_exit_signal)?;
    install(Signal::SIGQUIT, on_exit_signal)?;
    install(Signal::SIGINT, on_exit_signal)?;
    Ok(())
}

/// Exit policy selected with `-q`
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, clap::ValueEnum, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum QuitMode {
    /// Exit when no devices can be monitored, at startup or on reload
    #[default]
    Nodev,
    /// Exit only when no devices can be monitored at startup
    Nodevstartup,
    /// Keep running even with nothing to monitor
    Never,
    /// Run a single check cycle, then exit
    Onecheck,
    /// Show the upcoming scheduled self-tests, then exit
    Showtests,
    /// Run a single check cycle, exit non-zero if failures were seen
    Errors,
}

/// Daemon options distilled from the command line
pub(crate) struct Options {
    /// Config file path, `-` for stdin
    pub config_path: String,
    /// Seconds between check cycles
    pub interval: Duration,
    /// Exit policy
    pub quit: QuitMode,
    /// Pid file to create at startup
    pub pidfile: Option<PathBuf>,
    /// State file prefix
    pub state_prefix: Option<String>,
    /// Tracing knobs
    pub ctx: Context,
}

/// Wall clock as epoch seconds
fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64)
}

/// Read the configuration text from a file or stdin
fn read_config_text(path: &str) -> Result<String, u8> {
    if path == "-" {
        let mut text = String::new();
        io::Read::read_to_string(&mut io::stdin(), &mut text).map_err(|e| {
            log::error!("cannot read configuration from stdin: {e}");
            exit_code::CONFIG_UNREADABLE
        })?;
        return Ok(text);
    }
    match fs::read_to_string(path) {
        Ok(text) => Ok(text),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            log::error!("configuration file {path} does not exist");
            Err(exit_code::CONFIG_MISSING)
        }
        Err(e) => {
            log::error!("configuration file {path} unreadable: {e}");
            Err(exit_code::CONFIG_UNREADABLE)
        }
    }
}

/// Parse the configuration, expanding the device-scan sentinel
fn load_config(path: &str) -> Result<Vec<DeviceConfig>, u8> {
    let text = read_config_text(path)?;
    let entries = config::parse_config(&text).map_err(|e| {
        log::error!("{e}");
        exit_code::BAD_CONFIG
    })?;
    if let Some(template) = entries.first().filter(|e| e.is_devicescan()) {
        let devices = os::scan_devices().unwrap_or_else(|e| {
            log::error!("device scan failed: {e}");
            Vec::new()
        });
        log::info!("device scan found {} device(s)", devices.len());
        return Ok(devices
            .into_iter()
            .map(|path| DeviceConfig {
                name: path.to_string_lossy().into_owned(),
                ..template.clone()
            })
            .collect());
    }
    Ok(entries)
}

/// Build and register devices for every config entry
fn register_all(
    monitor: &mut Monitor,
    entries: Vec<DeviceConfig>,
    notifier: &mut dyn Notifier,
    now: i64,
) {
    for cfg in entries {
        let transport = os::make_transport(&cfg.name);
        let dev = match classify_scsi_device(&cfg.name, transport, cfg.dev_type, monitor.context())
        {
            Ok(dev) => dev,
            Err(e) => {
                log::error!("{}: cannot open device: {e}", cfg.name);
                continue;
            }
        };
        monitor.register_device(cfg, dev, notifier, now);
    }
}

/// Log the first due time of each scheduled test kind per device over the
/// next 90 days
fn show_test_schedule(monitor: &Monitor) {
    let now = now_epoch();
    for md in &monitor.devices {
        let Some(regex) = md.cfg.test_regex.as_ref() else {
            continue;
        };
        let mut state = md.state.clone();
        state.scheduled_test_next_check = now;
        match schedule::next_test(
            Some(regex),
            &mut state,
            !md.dev.is_ata(),
            now + 3600 * 24 * 90,
            md.dev.name(),
        ) {
            Some(kind) => log::info!(
                "{}: next scheduled test within 90 days is a {kind} self-test",
                md.dev.name()
            ),
            None => log::info!("{}: no test scheduled within 90 days", md.dev.name()),
        }
    }
}

/// Create the pid file
fn write_pidfile(path: &PathBuf) -> Result<(), u8> {
    fs::write(path, format!("{}\n", std::process::id())).map_err(|e| {
        log::error!("cannot write pid file {path:?}: {e}");
        exit_code::PIDFILE
    })
}

/// Sleep until the wakeup stamp, waking early for signals.
///
/// A wall clock that jumped backwards by more than one interval resets the
/// stamp so the daemon does not stall until the old time comes back.
fn sleep_until(wakeup: i64, interval: i64) -> i64 {
    let mut wakeup = wakeup;
    loop {
        let now = now_epoch();
        if now < wakeup - interval {
            log::warn!("system clock jumped backwards, resetting wakeup time");
            wakeup = now + interval;
        }
        if now >= wakeup
            || CAUGHT_EXIT.load(Ordering::Relaxed) != 0
            || CAUGHT_HUP.load(Ordering::Relaxed)
            || CAUGHT_USR1.load(Ordering::Relaxed)
        {
            return wakeup;
        }
        std::thread::sleep(Duration::from_secs(((wakeup - now) as u64).min(1)));
    }
}

/// Exit code for a terminating signal
fn signal_exit_code(sig: i32) -> u8 {
    let graceful = [
        Signal::SIGTERM as i32,
        Signal::SIGQUIT as i32,
        Signal::SIGINT as i32,
    ];
    if graceful.contains(&sig) {
        exit_code::OK
    } else {
        exit_code::SIGNALLED
    }
}

/// The main loop: reload on HUP, check on schedule or USR1, flush state and
/// exit on termination
pub(crate) fn run(opts: &Options) -> u8 {
    let interval = opts.interval.as_secs() as i64;
    let mut notifier = ExecNotifier;
    let mut monitor = Monitor::new(opts.ctx, opts.state_prefix.clone());
    let mut first_pass = true;
    let mut wakeup = 0i64;

    if let Some(pidfile) = &opts.pidfile {
        if let Err(code) = write_pidfile(pidfile) {
            return code;
        }
    }

    loop {
        let sig = CAUGHT_EXIT.load(Ordering::Relaxed);
        if sig != 0 {
            log::info!("caught signal {sig}, exiting");
            monitor.flush_states(false);
            if let Some(pidfile) = &opts.pidfile {
                let _ = fs::remove_file(pidfile);
            }
            return signal_exit_code(sig);
        }

        let mut reloaded = false;
        if first_pass || CAUGHT_HUP.swap(false, Ordering::Relaxed) {
            reloaded = !first_pass;
            let now = now_epoch();
            match load_config(&opts.config_path) {
                Ok(entries) => {
                    monitor.flush_states(false);
                    monitor = Monitor::new(opts.ctx, opts.state_prefix.clone());
                    register_all(&mut monitor, entries, &mut notifier, now);
                    if !first_pass {
                        log::info!(
                            "configuration reloaded, monitoring {} device(s)",
                            monitor.devices.len()
                        );
                    }
                }
                Err(code) => {
                    if first_pass {
                        return code;
                    }
                    log::error!("reload failed, keeping previous configuration");
                }
            }
            if monitor.devices.is_empty() {
                log::warn!("no devices to monitor");
                match opts.quit {
                    QuitMode::Nodev | QuitMode::Onecheck | QuitMode::Showtests
                    | QuitMode::Errors => return exit_code::NO_DEVICES,
                    QuitMode::Nodevstartup if first_pass => return exit_code::NO_DEVICES,
                    _ => {}
                }
            }
            if opts.quit == QuitMode::Showtests {
                show_test_schedule(&monitor);
                return exit_code::OK;
            }
        }

        CAUGHT_USR1.store(false, Ordering::Relaxed);
        let allow_selftests = !first_pass || opts.quit == QuitMode::Onecheck;
        monitor.check_all(&mut notifier, allow_selftests, now_epoch());
        if opts.state_prefix.is_some() {
            // a fresh configuration gets everything written out once
            monitor.flush_states(reloaded);
        }

        match opts.quit {
            QuitMode::Onecheck => {
                log::info!("single check cycle done, exiting");
                monitor.flush_states(false);
                return exit_code::OK;
            }
            QuitMode::Errors => {
                monitor.flush_states(false);
                return if monitor.failures > 0 {
                    exit_code::DEVICE_FAILURE
                } else {
                    exit_code::OK
                };
            }
            _ => {}
        }

        if first_pass {
            if let Err(e) = install_signal_handlers() {
                log::error!("cannot install signal handlers: {e}");
                return exit_code::SIGNALLED;
            }
            wakeup = now_epoch() + interval;
            first_pass = false;
        }

        wakeup = sleep_until(wakeup, interval);
        if CAUGHT_USR1.load(Ordering::Relaxed) {
            log::info!("caught USR1, checking devices now");
        }
        while wakeup <= now_epoch() {
            wakeup += interval;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graceful_signals_exit_zero() {
        assert_eq!(signal_exit_code(Signal::SIGTERM as i32), exit_code::OK);
        assert_eq!(signal_exit_code(Signal::SIGQUIT as i32), exit_code::OK);
        assert_eq!(signal_exit_code(Signal::SIGINT as i32), exit_code::OK);
        assert_eq!(signal_exit_code(Signal::SIGABRT as i32), exit_code::SIGNALLED);
    }
}
