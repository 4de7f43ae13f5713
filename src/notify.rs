//! Warning events and pluggable notification dispatch
//!
//! Every engine warning maps to one notification slot whose delivery
//! bookkeeping lives in the device state; the per-device frequency policy
//! decides whether a repeat is delivered or quenched.

use std::process::{Command, Stdio};

use crate::{
    config::{DeviceConfig, EmailFreq, NO_MAILER},
    state::{DeviceState, MAIL_SLOT_TEST},
};

/// One day in seconds
const DAY_SECS: i64 = 86_400;

/// Warning classes emitted by the monitoring engine
#[derive(Copy, Clone, Debug, Eq, PartialEq, strum::Display)]
pub(crate) enum EventKind {
    /// Startup test notification
    EmailTest,
    /// SMART health status reports failure
    HealthFailed,
    /// A usage attribute crossed its threshold
    UsageFailedAttr,
    /// Self-test log gained an error
    SelfTestError,
    /// ATA error count increased
    AtaErrorCountIncreased,
    /// Health status could not be read
    FailedToReadHealth,
    /// SMART data could not be read
    FailedToReadSmartData,
    /// Error log could not be read
    FailedToReadErrorLog,
    /// Self-test log could not be read
    FailedToReadSelfTestLog,
    /// Device could not be opened
    OpenFailed,
    /// Current pending sectors detected
    PendingCurrent,
    /// Offline uncorrectable sectors detected
    PendingOffline,
    /// Temperature reached the critical limit
    TemperatureCritical,
}

impl EventKind {
    /// Notification slot index in the delivery log
    pub(crate) fn mail_slot(self) -> usize {
        match self {
            EventKind::EmailTest => MAIL_SLOT_TEST,
            EventKind::HealthFailed => 1,
            EventKind::UsageFailedAttr => 2,
            EventKind::SelfTestError => 3,
            EventKind::AtaErrorCountIncreased => 4,
            EventKind::FailedToReadHealth => 5,
            EventKind::FailedToReadSmartData => 6,
            EventKind::FailedToReadErrorLog => 7,
            EventKind::FailedToReadSelfTestLog => 8,
            EventKind::OpenFailed => 9,
            EventKind::PendingCurrent => 10,
            EventKind::PendingOffline => 11,
            EventKind::TemperatureCritical => 12,
        }
    }

    /// Whether this event logs at critical priority
    pub(crate) fn is_critical(self) -> bool {
        matches!(
            self,
            EventKind::HealthFailed
                | EventKind::UsageFailedAttr
                | EventKind::SelfTestError
                | EventKind::AtaErrorCountIncreased
                | EventKind::PendingCurrent
                | EventKind::PendingOffline
                | EventKind::TemperatureCritical
        )
    }
}

/// One warning ready for dispatch
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Event {
    /// Warning class
    pub kind: EventKind,
    /// Device name
    pub device: String,
    /// Human-readable summary
    pub message: String,
    /// Numeric detail (delta, temperature, count) when one exists
    pub value: Option<i64>,
}

impl Event {
    /// Build an event
    pub(crate) fn new(kind: EventKind, device: &str, message: String, value: Option<i64>) -> Self {
        Self {
            kind,
            device: device.to_owned(),
            message,
            value,
        }
    }
}

/// Delivery hook; implementations hand events to the outside world
pub(crate) trait Notifier {
    /// Deliver one event for the device it concerns
    fn notify(&mut self, cfg: &DeviceConfig, event: &Event) -> anyhow::Result<()>;
}

/// Notifier spawning the configured external command per event.
///
/// The event is passed in the environment; the recipient list is the first
/// argument, mirroring a traditional mailer invocation.
#[derive(Default)]
pub(crate) struct ExecNotifier;

impl Notifier for ExecNotifier {
    fn notify(&mut self, cfg: &DeviceConfig, event: &Event) -> anyhow::Result<()> {
        let Some(cmdline) = cfg.email_cmdline.as_deref() else {
            // no delivery path configured, logging already happened
            return Ok(());
        };
        let address = cfg
            .email_addrs
            .as_deref()
            .filter(|a| *a != NO_MAILER)
            .unwrap_or_default();
        let output = Command::new(cmdline)
            .arg(address)
            .env("LANG", "C")
            .env("SMARTMOND_DEVICE", &event.device)
            .env("SMARTMOND_FAILTYPE", event.kind.to_string())
            .env("SMARTMOND_MESSAGE", &event.message)
            .env(
                "SMARTMOND_VALUE",
                event.value.map_or_else(String::new, |v| v.to_string()),
            )
            .stdin(Stdio::null())
            .output()?;
        anyhow::ensure!(
            output.status.success(),
            "notifier {cmdline} failed with {}",
            output.status
        );
        Ok(())
    }
}

/// Whether a repeat in this slot is currently quenched by the frequency
/// policy
fn suppressed(freq: EmailFreq, count: u32, last_sent: i64, now: i64) -> bool {
    if count == 0 {
        return false;
    }
    match freq {
        EmailFreq::Once => true,
        EmailFreq::Daily => now < last_sent + DAY_SECS,
        EmailFreq::Diminishing => {
            let wait = DAY_SECS.saturating_mul(1i64 << (count - 1).min(32));
            now < last_sent + wait
        }
    }
}

/// Log an event and hand it to the notifier unless the frequency policy
/// quenches it.
///
/// Delivery bookkeeping is updated on every actual delivery; the test-email
/// slot never persists, so a fresh configuration always gets its test.
pub(crate) fn dispatch(
    cfg: &DeviceConfig,
    state: &mut DeviceState,
    notifier: &mut dyn Notifier,
    event: &Event,
    now: i64,
) {
    if event.kind.is_critical() {
        log::error!("{}: {}", event.device, event.message);
    } else {
        log::warn!("{}: {}", event.device, event.message);
    }
    if cfg.email_addrs.is_none() && cfg.email_cmdline.is_none() {
        return;
    }
    let slot = event.kind.mail_slot();
    let mail = &mut state.maillog[slot];
    if suppressed(cfg.email_freq, mail.count, mail.last_sent, now) {
        log::debug!(
            "{}: {} notification quenched by {} policy",
            event.device,
            event.kind,
            cfg.email_freq
        );
        return;
    }
    if mail.count == 0 {
        mail.first_sent = now;
    }
    mail.last_sent = now;
    mail.count += 1;
    if slot != MAIL_SLOT_TEST {
        state.must_write = true;
    }
    if let Err(e) = notifier.notify(cfg, event) {
        log::error!("{}: failed to deliver {}: {e:#}", event.device, event.kind);
    }
}
