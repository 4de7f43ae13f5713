//! Command line interface

use std::{path::PathBuf, str::FromStr, time::Duration};

use clap::Parser;

use crate::{daemon::QuitMode, device::Context};

/// Minimum polling interval
pub(crate) const MIN_INTERVAL: Duration = Duration::from_secs(10);

/// Wire tracing selector for `-r`, `TYPE[,N]` with N repeats
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ReportSetting {
    /// `ioctl`, `ataioctl` or `scsiioctl`
    pub kind: String,
    /// Verbosity level
    pub level: u8,
}

impl FromStr for ReportSetting {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, level) = match s.split_once(',') {
            Some((kind, n)) => (
                kind,
                clap_num::number_range(n, 1, 4).map_err(|_| "report level must be 1-4")?,
            ),
            None => (s, 1),
        };
        if !matches!(kind, "ioctl" | "ataioctl" | "scsiioctl") {
            return Err("expected ioctl, ataioctl or scsiioctl");
        }
        Ok(Self {
            kind: kind.to_owned(),
            level,
        })
    }
}

/// Smartmond command line arguments
#[derive(Parser, Debug)]
#[command(version, about)]
pub(crate) struct Args {
    /// Level of logging output (TRACE, DEBUG, INFO, WARN, ERROR).
    #[arg(short, default_value_t = log::Level::Info)]
    pub verbosity: log::Level,

    /// Configuration file path, or '-' to read from stdin.
    #[arg(short, long, default_value = "/etc/smartmond.conf")]
    pub configfile: String,

    /// Debug mode: stay in the foreground and log everything to stderr.
    #[arg(short, long)]
    pub debug: bool,

    /// Print the configuration directive summary and exit.
    #[arg(short = 'D', long)]
    pub showdirectives: bool,

    /// Interval between check cycles, ie. '30m', '1800s' (minimum 10s).
    #[arg(short, long, default_value = "30m")]
    pub interval: humantime::Duration,

    /// Write the daemon pid to this file at startup.
    #[arg(short, long)]
    pub pidfile: Option<PathBuf>,

    /// When to exit instead of monitoring forever.
    #[arg(short, long, value_enum, default_value_t = QuitMode::Nodev)]
    pub quit: QuitMode,

    /// Trace pass-through traffic: TYPE[,N] with TYPE one of
    /// ioctl, ataioctl, scsiioctl.
    #[arg(short, long)]
    pub report: Vec<ReportSetting>,

    /// Prefix for per-device state files; enables state persistence.
    #[arg(short, long)]
    pub state_prefix: Option<String>,

    /// Don't fork to the background (always on; accepted for
    /// compatibility with init scripts).
    #[arg(short, long)]
    pub no_fork: bool,
}

impl Args {
    /// Tracing knobs derived from `-r` and `-d`
    pub(crate) fn context(&self) -> Context {
        let mut ctx = Context {
            debug: u8::from(self.debug),
            ..Context::default()
        };
        for report in &self.report {
            match report.kind.as_str() {
                "ioctl" => {
                    ctx.report_scsi = ctx.report_scsi.max(report.level);
                    ctx.report_ata = ctx.report_ata.max(report.level);
                }
                "ataioctl" => ctx.report_ata = ctx.report_ata.max(report.level),
                "scsiioctl" => ctx.report_scsi = ctx.report_scsi.max(report.level),
                _ => {}
            }
        }
        ctx
    }
}
