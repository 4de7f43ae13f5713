//! Configuration file model and directive parser
//!
//! One device entry per logical line: a device path followed by `-X`
//! directives. `\` at end of line continues onto the next, `#` starts a
//! comment. The `DEVICESCAN` sentinel stands for every device the OS can
//! enumerate and must be the only entry when used.

use std::str::FromStr;

use crate::{ata::cmds::PowerMode, device::DevType, schedule::TestRegex};

/// Sentinel device name expanding to all enumerated devices
pub(crate) const DEVICESCAN: &str = "DEVICESCAN";

/// Literal `-m` address requesting no mailer, only `-M exec`
pub(crate) const NO_MAILER: &str = "<nomailer>";

/// Summary of the configuration directives, printed for `-D`
pub(crate) const DIRECTIVE_HELP: &str = "\
Configuration file directives, one device entry per line:
  DEVICE [DIRECTIVES...], or DEVICESCAN [DIRECTIVES...] alone
  -d TYPE     device type: auto, ata, scsi, sat[,12|,16], usbcypress[,0xNN],
              removable
  -T TYPE     tolerance: normal, permissive
  -o VAL      automatic offline testing: on, off
  -S VAL      attribute autosave: on, off
  -H          monitor SMART health status
  -f          monitor usage attributes for threshold failures
  -l TYPE     monitor a log: error, selftest
  -s REGEX    schedule self-tests matching T/MM/DD/wd/HH
  -m ADDR     notification address(es), or <nomailer>
  -M TYPE     notification policy: once, daily, diminishing, test, exec PATH
  -p          track prefailure attribute changes
  -u          track usage attribute changes
  -t          track all attribute changes (same as -p -u)
  -r ID[!]    report raw value of attribute ID; ! makes changes critical
  -R ID[!]    track raw value changes of attribute ID
  -i ID       ignore attribute ID for failure checks
  -I ID       ignore attribute ID for change tracking
  -C ID[+]    monitor pending sectors via attribute ID; + reports increases
  -U ID[+]    monitor offline uncorrectable sectors via attribute ID
  -W D,I,C    temperature: report change of D, log at I, warn at C degrees
  -n MODE[,N][,q]  skip checks in low power mode: never, sleep, standby, idle
  -F TYPE     firmware bug workaround: none, samsung, samsung2, samsung3
  -v N,FMT    raw display format for attribute N
  -P TYPE     preset handling: use, ignore, show, showall
  -a          default set: -H -f -t -l error -l selftest -C 197 -U 198
  #           comment, rest of line ignored
  \\           at end of line: continue on the next line";

/// Configuration syntax error
#[derive(thiserror::Error, Debug)]
#[error("config line {lineno}: {msg}")]
pub(crate) struct ParseError {
    /// 1-based logical line number
    pub lineno: usize,
    /// What went wrong
    pub msg: String,
}

/// Three-state device setting knob
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum Toggle {
    /// Leave the device as it is
    #[default]
    Unchanged,
    /// Switch off
    Off,
    /// Switch on
    On,
}

/// Notification repeat policy
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum EmailFreq {
    /// One notification per event type
    #[default]
    Once,
    /// At most one per day per event type
    Daily,
    /// Exponentially growing gaps between repeats
    Diminishing,
}

/// Firmware bug workarounds
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum FirmwareFix {
    /// No workaround
    #[default]
    None,
    /// Samsung byte-order fix
    Samsung,
    /// Samsung self-test log fix
    Samsung2,
    /// Ignore ambiguous self-test-in-progress byte
    Samsung3,
}

/// Attribute preset database policy
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum PresetMode {
    /// Apply presets silently
    #[default]
    Use,
    /// Ignore presets
    Ignore,
    /// Apply and log presets
    Show,
    /// Log all available presets
    ShowAll,
}

/// Raw value display formats for `-v`
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum RawFormat {
    /// Six single-byte values
    Raw8,
    /// Three 16-bit values
    Raw16,
    /// Two 24-bit values
    Raw24,
    /// One 48-bit value
    #[default]
    Raw48,
    /// One 64-bit value (vendors abusing the reserved byte)
    Raw64,
    /// One 48-bit value, hexadecimal
    Hex48,
    /// Seconds, displayed as hours
    Sec2Hour,
    /// Minutes, displayed as hours
    Min2Hour,
    /// Half-minutes, displayed as hours
    HalfMin2Hour,
    /// Temperature with min/max in the upper bytes
    TempMinMax,
}

impl RawFormat {
    /// Render a 48-bit raw value for log messages
    pub(crate) fn render(self, raw: u64) -> String {
        let word = |i: u32| (raw >> (16 * i)) & 0xFFFF;
        match self {
            RawFormat::Raw48 | RawFormat::Raw64 => raw.to_string(),
            RawFormat::Raw8 => (0..6u32)
                .rev()
                .map(|i| ((raw >> (8 * i)) & 0xFF).to_string())
                .collect::<Vec<_>>()
                .join(" "),
            RawFormat::Raw16 => format!("{} {} {}", word(2), word(1), word(0)),
            RawFormat::Raw24 => format!("{}/{}", (raw >> 24) & 0xFF_FFFF, raw & 0xFF_FFFF),
            RawFormat::Hex48 => format!("{raw:#014x}"),
            RawFormat::Sec2Hour => {
                format!("{}h+{:02}m+{:02}s", raw / 3600, (raw % 3600) / 60, raw % 60)
            }
            RawFormat::Min2Hour => format!("{}h+{:02}m", raw / 60, raw % 60),
            RawFormat::HalfMin2Hour => format!("{}h+{:02}m", raw / 120, (raw % 120) / 2),
            RawFormat::TempMinMax => format!("{} (min/max {}/{})", word(0), word(1), word(2)),
        }
    }
}

/// Per-attribute monitoring flag bits
pub(crate) mod attr_flag {
    /// Exclude from threshold-failure checks
    pub(crate) const IGNORE_FAILURE: u8 = 0x01;
    /// Exclude from change tracking
    pub(crate) const IGNORE_TRACKING: u8 = 0x02;
    /// Include the raw value in change messages
    pub(crate) const PRINT_RAW: u8 = 0x04;
    /// Track raw value changes, not only normalized ones
    pub(crate) const TRACK_RAW: u8 = 0x08;
    /// Normalized change notifies as critical
    pub(crate) const CRIT_CHANGE: u8 = 0x10;
    /// Raw change notifies as critical
    pub(crate) const CRIT_RAW_CHANGE: u8 = 0x20;
}

/// Per-attribute flag bitmap, indexed by attribute id
#[derive(Clone, Eq, PartialEq)]
pub(crate) struct AttributeFlags {
    /// One flag byte per attribute id
    flags: [u8; 256],
}

impl Default for AttributeFlags {
    fn default() -> Self {
        Self { flags: [0; 256] }
    }
}

impl std::fmt::Debug for AttributeFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let set: Vec<(usize, u8)> = self
            .flags
            .iter()
            .enumerate()
            .filter(|(_, fl)| **fl != 0)
            .map(|(id, fl)| (id, *fl))
            .collect();
        f.debug_tuple("AttributeFlags").field(&set).finish()
    }
}

impl AttributeFlags {
    /// Set a flag for one attribute id
    pub(crate) fn set(&mut self, id: u8, flag: u8) {
        self.flags[usize::from(id)] |= flag;
    }

    /// Whether the attribute has the flag
    pub(crate) fn has(&self, id: u8, flag: u8) -> bool {
        self.flags[usize::from(id)] & flag != 0
    }
}

/// Raw display format per attribute id
#[derive(Clone, Eq, PartialEq)]
pub(crate) struct RawFormats {
    /// Format per attribute id
    formats: [RawFormat; 256],
}

impl Default for RawFormats {
    fn default() -> Self {
        Self {
            formats: [RawFormat::default(); 256],
        }
    }
}

impl std::fmt::Debug for RawFormats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let set: Vec<(usize, RawFormat)> = self
            .formats
            .iter()
            .enumerate()
            .filter(|(_, fmt)| **fmt != RawFormat::default())
            .map(|(id, fmt)| (id, *fmt))
            .collect();
        f.debug_tuple("RawFormats").field(&set).finish()
    }
}

impl RawFormats {
    /// Override the format of one attribute
    pub(crate) fn set(&mut self, id: u8, format: RawFormat) {
        self.formats[usize::from(id)] = format;
    }

    /// Display format for an attribute
    pub(crate) fn get(&self, id: u8) -> RawFormat {
        self.formats[usize::from(id)]
    }
}

/// One device entry of the configuration file, immutable after parsing
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct DeviceConfig {
    /// Device path, or [`DEVICESCAN`]
    pub name: String,
    /// Logical line number in the config file
    pub lineno: usize,
    /// Transport/type selection from `-d`
    pub dev_type: DevType,
    /// Device may be removed without it being an error
    pub removable: bool,
    /// Ignore failures of optional commands
    pub permissive: bool,
    /// `-H`: check SMART health status
    pub smartcheck: bool,
    /// `-f`: check usage attributes against thresholds
    pub usagefailed: bool,
    /// `-p`: track prefailure attribute changes
    pub prefail: bool,
    /// `-u`: track usage attribute changes
    pub usage: bool,
    /// `-l selftest`: monitor the self-test log
    pub selftest: bool,
    /// `-l error`: monitor the ATA error log
    pub errorlog: bool,
    /// `-s`: scheduled self-test calendar pattern
    pub test_regex: Option<TestRegex>,
    /// `-m`: notification addresses
    pub email_addrs: Option<String>,
    /// `-M exec`: notifier command override
    pub email_cmdline: Option<String>,
    /// `-M once|daily|diminishing`
    pub email_freq: EmailFreq,
    /// `-M test`: send a test notification on startup
    pub email_test: bool,
    /// `-S`: attribute autosave control
    pub autosave: Toggle,
    /// `-o`: automatic offline testing control
    pub auto_offline: Toggle,
    /// Per-attribute monitoring flags from `-i/-I/-r/-R`
    pub attribute_flags: AttributeFlags,
    /// Per-attribute raw display formats from `-v`
    pub raw_formats: RawFormats,
    /// `-C`: current-pending-sector attribute id, 0 disables
    pub curr_pending_id: u8,
    /// `-C ID+`: only report increases
    pub curr_pending_incr: bool,
    /// `-U`: offline-uncorrectable attribute id, 0 disables
    pub offl_pending_id: u8,
    /// `-U ID+`: only report increases
    pub offl_pending_incr: bool,
    /// `-W`: report when temperature changes by this many °C
    pub tempdiff: u8,
    /// `-W`: log when temperature reaches this value
    pub tempinfo: u8,
    /// `-W`: notify when temperature reaches this value
    pub tempcrit: u8,
    /// `-n`: skip checks when the drive is at or below this power mode
    pub powermode: Option<PowerMode>,
    /// `-n MODE,N`: run the check anyway after N skipped cycles
    pub powerskipmax: u8,
    /// `-n MODE,q`: don't log skipped cycles
    pub powerquiet: bool,
    /// `-F`: firmware bug workaround
    pub fix_firmwarebug: FirmwareFix,
    /// `-P`: preset database policy
    pub presets: PresetMode,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            lineno: 0,
            dev_type: DevType::Auto,
            removable: false,
            permissive: false,
            smartcheck: false,
            usagefailed: false,
            prefail: false,
            usage: false,
            selftest: false,
            errorlog: false,
            test_regex: None,
            email_addrs: None,
            email_cmdline: None,
            email_freq: EmailFreq::Once,
            email_test: false,
            autosave: Toggle::Unchanged,
            auto_offline: Toggle::Unchanged,
            attribute_flags: AttributeFlags::default(),
            raw_formats: RawFormats::default(),
            curr_pending_id: 0,
            curr_pending_incr: false,
            offl_pending_id: 0,
            offl_pending_incr: false,
            tempdiff: 0,
            tempinfo: 0,
            tempcrit: 0,
            powermode: None,
            powerskipmax: 0,
            powerquiet: false,
            fix_firmwarebug: FirmwareFix::None,
            presets: PresetMode::Use,
        }
    }
}

impl DeviceConfig {
    /// Whether this entry is the device-scan sentinel
    pub(crate) fn is_devicescan(&self) -> bool {
        self.name == DEVICESCAN
    }

    /// Render this entry back into a config file line.
    ///
    /// Parsing the result reproduces the entry (directive order is
    /// canonical, not the order they were written in).
    #[expect(clippy::too_many_lines)]
    pub(crate) fn directive_line(&self) -> String {
        use std::fmt::Write as _;

        let mut line = self.name.clone();
        if self.dev_type != DevType::Auto {
            let _ = write!(line, " -d {}", self.dev_type);
        }
        if self.removable {
            line.push_str(" -d removable");
        }
        if self.permissive {
            line.push_str(" -T permissive");
        }
        if self.auto_offline != Toggle::Unchanged {
            let _ = write!(line, " -o {}", self.auto_offline);
        }
        if self.autosave != Toggle::Unchanged {
            let _ = write!(line, " -S {}", self.autosave);
        }
        if self.smartcheck {
            line.push_str(" -H");
        }
        if self.usagefailed {
            line.push_str(" -f");
        }
        if self.prefail {
            line.push_str(" -p");
        }
        if self.usage {
            line.push_str(" -u");
        }
        if self.errorlog {
            line.push_str(" -l error");
        }
        if self.selftest {
            line.push_str(" -l selftest");
        }
        if let Some(regex) = &self.test_regex {
            let _ = write!(line, " -s {}", regex.pattern());
        }
        if let Some(addrs) = &self.email_addrs {
            let _ = write!(line, " -m {addrs}");
        }
        if self.email_freq != EmailFreq::Once {
            let _ = write!(line, " -M {}", self.email_freq);
        }
        if self.email_test {
            line.push_str(" -M test");
        }
        if let Some(cmd) = &self.email_cmdline {
            let _ = write!(line, " -M exec {cmd}");
        }
        for id in 1..=255u8 {
            let flags = &self.attribute_flags;
            if flags.has(id, attr_flag::IGNORE_FAILURE) {
                let _ = write!(line, " -i {id}");
            }
            if flags.has(id, attr_flag::IGNORE_TRACKING) {
                let _ = write!(line, " -I {id}");
            }
            if flags.has(id, attr_flag::TRACK_RAW) {
                let bang = if flags.has(id, attr_flag::CRIT_RAW_CHANGE) {
                    "!"
                } else {
                    ""
                };
                let _ = write!(line, " -R {id}{bang}");
            } else if flags.has(id, attr_flag::PRINT_RAW) {
                let bang = if flags.has(id, attr_flag::CRIT_CHANGE) {
                    "!"
                } else {
                    ""
                };
                let _ = write!(line, " -r {id}{bang}");
            }
            if self.raw_formats.get(id) != RawFormat::default() {
                let _ = write!(line, " -v {id},{}", self.raw_formats.get(id));
            }
        }
        if self.curr_pending_id != 0 {
            let plus = if self.curr_pending_incr { "+" } else { "" };
            let _ = write!(line, " -C {}{plus}", self.curr_pending_id);
        }
        if self.offl_pending_id != 0 {
            let plus = if self.offl_pending_incr { "+" } else { "" };
            let _ = write!(line, " -U {}{plus}", self.offl_pending_id);
        }
        if self.tempdiff != 0 || self.tempinfo != 0 || self.tempcrit != 0 {
            let _ = write!(
                line,
                " -W {},{},{}",
                self.tempdiff, self.tempinfo, self.tempcrit
            );
        }
        if let Some(mode) = self.powermode {
            let mode = match mode {
                PowerMode::Sleep => "sleep",
                PowerMode::Idle => "idle",
                _ => "standby",
            };
            let _ = write!(line, " -n {mode}");
            if self.powerskipmax != 0 {
                let _ = write!(line, ",{}", self.powerskipmax);
            }
            if self.powerquiet {
                line.push_str(",q");
            }
        }
        if self.fix_firmwarebug != FirmwareFix::None {
            let _ = write!(line, " -F {}", self.fix_firmwarebug);
        }
        if self.presets != PresetMode::Use {
            let _ = write!(line, " -P {}", self.presets);
        }
        line
    }

    /// Whether any monitoring work is enabled
    fn any_check_enabled(&self) -> bool {
        self.smartcheck
            || self.usagefailed
            || self.prefail
            || self.usage
            || self.selftest
            || self.errorlog
            || self.tempdiff != 0
            || self.tempinfo != 0
            || self.tempcrit != 0
    }

    /// Apply the `-a` shorthand: `-H -f -t -l error -l selftest -C 197
    /// -U 198`
    fn apply_default_checks(&mut self) {
        self.smartcheck = true;
        self.usagefailed = true;
        self.prefail = true;
        self.usage = true;
        self.errorlog = true;
        self.selftest = true;
        if self.curr_pending_id == 0 {
            self.curr_pending_id = 197;
        }
        if self.offl_pending_id == 0 {
            self.offl_pending_id = 198;
        }
    }
}

/// Join continuation lines and strip comments, yielding `(lineno, line)`
/// per logical line
fn logical_lines(text: &str) -> Vec<(usize, String)> {
    let mut lines = Vec::new();
    let mut pending = String::new();
    let mut pending_start = 0;
    for (i, raw) in text.lines().enumerate() {
        let no_comment = raw.split('#').next().unwrap_or("");
        let trimmed = no_comment.trim_end();
        if pending.is_empty() {
            pending_start = i + 1;
        }
        if let Some(cont) = trimmed.strip_suffix('\\') {
            pending.push_str(cont);
            pending.push(' ');
            continue;
        }
        pending.push_str(trimmed);
        if !pending.trim().is_empty() {
            lines.push((pending_start, std::mem::take(&mut pending)));
        } else {
            pending.clear();
        }
    }
    if !pending.trim().is_empty() {
        lines.push((pending_start, pending));
    }
    lines
}

/// Parse an attribute id with an optional trailing marker character
fn parse_attr_id(arg: &str, marker: char) -> Option<(u8, bool)> {
    let (id_str, flagged) = match arg.strip_suffix(marker) {
        Some(stripped) => (stripped, true),
        None => (arg, false),
    };
    id_str.parse::<u8>().ok().map(|id| (id, flagged))
}

/// Parse one device entry line
fn parse_entry(lineno: usize, line: &str) -> Result<DeviceConfig, ParseError> {
    let err = |msg: String| ParseError { lineno, msg };
    let mut tokens = line.split_whitespace();
    let name = tokens
        .next()
        .ok_or_else(|| err("missing device name".to_owned()))?;
    let mut cfg = DeviceConfig {
        name: name.to_owned(),
        lineno,
        ..DeviceConfig::default()
    };
    let mut email_policy_given = false;

    while let Some(directive) = tokens.next() {
        let mut arg = || {
            tokens
                .next()
                .map(str::to_owned)
                .ok_or_else(|| err(format!("directive {directive} needs an argument")))
        };
        match directive {
            "-d" => {
                let arg = arg()?;
                if arg == "removable" {
                    cfg.removable = true;
                } else {
                    cfg.dev_type = DevType::from_str(&arg)
                        .map_err(|e| err(format!("-d {arg}: {e}")))?;
                }
            }
            "-T" => match arg()?.as_str() {
                "normal" => cfg.permissive = false,
                "permissive" => cfg.permissive = true,
                other => return Err(err(format!("-T {other}: expected normal or permissive"))),
            },
            "-o" => {
                let arg = arg()?;
                cfg.auto_offline = Toggle::from_str(&arg)
                    .ok()
                    .filter(|t| *t != Toggle::Unchanged)
                    .ok_or_else(|| err(format!("-o {arg}: expected on or off")))?;
            }
            "-S" => {
                let arg = arg()?;
                cfg.autosave = Toggle::from_str(&arg)
                    .ok()
                    .filter(|t| *t != Toggle::Unchanged)
                    .ok_or_else(|| err(format!("-S {arg}: expected on or off")))?;
            }
            "-H" => cfg.smartcheck = true,
            "-f" => cfg.usagefailed = true,
            "-l" => match arg()?.as_str() {
                "error" => cfg.errorlog = true,
                "selftest" => cfg.selftest = true,
                other => return Err(err(format!("-l {other}: expected error or selftest"))),
            },
            "-s" => {
                let arg = arg()?;
                cfg.test_regex = Some(
                    TestRegex::new(&arg).map_err(|e| err(format!("-s {arg}: {e}")))?,
                );
            }
            "-m" => cfg.email_addrs = Some(arg()?),
            "-M" => {
                email_policy_given = true;
                let arg = arg()?;
                match arg.as_str() {
                    "once" | "daily" | "diminishing" => {
                        cfg.email_freq = EmailFreq::from_str(&arg)
                            .map_err(|e| err(format!("-M {arg}: {e}")))?;
                    }
                    "test" => cfg.email_test = true,
                    "exec" => {
                        cfg.email_cmdline = Some(tokens.next().map(str::to_owned).ok_or_else(
                            || err("-M exec needs a command".to_owned()),
                        )?);
                    }
                    other => {
                        return Err(err(format!(
                            "-M {other}: expected once, daily, diminishing, test or exec"
                        )));
                    }
                }
            }
            "-p" => cfg.prefail = true,
            "-u" => cfg.usage = true,
            "-t" => {
                cfg.prefail = true;
                cfg.usage = true;
            }
            "-r" | "-R" => {
                let arg = arg()?;
                let (id, critical) = parse_attr_id(&arg, '!')
                    .filter(|(id, _)| *id != 0)
                    .ok_or_else(|| err(format!("{directive} {arg}: bad attribute id")))?;
                if directive == "-r" {
                    cfg.attribute_flags.set(id, attr_flag::PRINT_RAW);
                    if critical {
                        cfg.attribute_flags.set(id, attr_flag::CRIT_CHANGE);
                    }
                } else {
                    cfg.attribute_flags
                        .set(id, attr_flag::PRINT_RAW | attr_flag::TRACK_RAW);
                    if critical {
                        cfg.attribute_flags.set(id, attr_flag::CRIT_RAW_CHANGE);
                    }
                }
            }
            "-i" | "-I" => {
                let arg = arg()?;
                let id = arg
                    .parse::<u8>()
                    .ok()
                    .filter(|id| *id != 0)
                    .ok_or_else(|| err(format!("{directive} {arg}: bad attribute id")))?;
                cfg.attribute_flags.set(
                    id,
                    if directive == "-i" {
                        attr_flag::IGNORE_FAILURE
                    } else {
                        attr_flag::IGNORE_TRACKING
                    },
                );
            }
            "-C" => {
                let arg = arg()?;
                let (id, incr) = parse_attr_id(&arg, '+')
                    .ok_or_else(|| err(format!("-C {arg}: bad attribute id")))?;
                cfg.curr_pending_id = id;
                cfg.curr_pending_incr = incr;
            }
            "-U" => {
                let arg = arg()?;
                let (id, incr) = parse_attr_id(&arg, '+')
                    .ok_or_else(|| err(format!("-U {arg}: bad attribute id")))?;
                cfg.offl_pending_id = id;
                cfg.offl_pending_incr = incr;
            }
            "-W" => {
                let arg = arg()?;
                let mut parts = arg.split(',');
                let mut next_temp = |what: &str| -> Result<u8, ParseError> {
                    match parts.next() {
                        None => Ok(0),
                        Some(v) => v
                            .parse::<u8>()
                            .map_err(|_| err(format!("-W {arg}: bad {what}"))),
                    }
                };
                cfg.tempdiff = next_temp("difference")?;
                cfg.tempinfo = next_temp("info threshold")?;
                cfg.tempcrit = next_temp("critical threshold")?;
            }
            "-n" => {
                let arg = arg()?;
                let mut parts = arg.split(',');
                let mode = parts.next().unwrap_or_default();
                cfg.powermode = match mode {
                    "never" => None,
                    "sleep" => Some(PowerMode::Sleep),
                    "standby" => Some(PowerMode::Standby),
                    "idle" => Some(PowerMode::Idle),
                    other => return Err(err(format!("-n {other}: unknown power mode"))),
                };
                for part in parts {
                    if part == "q" {
                        cfg.powerquiet = true;
                    } else {
                        cfg.powerskipmax = part
                            .parse::<u8>()
                            .map_err(|_| err(format!("-n {arg}: bad skip count")))?;
                    }
                }
            }
            "-F" => {
                let arg = arg()?;
                cfg.fix_firmwarebug =
                    FirmwareFix::from_str(&arg).map_err(|e| err(format!("-F {arg}: {e}")))?;
            }
            "-v" => {
                let arg = arg()?;
                let (id_str, fmt_str) = arg
                    .split_once(',')
                    .ok_or_else(|| err(format!("-v {arg}: expected ID,FORMAT")))?;
                let id = id_str
                    .parse::<u8>()
                    .ok()
                    .filter(|id| *id != 0)
                    .ok_or_else(|| err(format!("-v {arg}: bad attribute id")))?;
                // the doubled spelling of the 24-bit pair is also accepted
                let fmt_str = if fmt_str == "raw24/raw24" { "raw24" } else { fmt_str };
                let format = RawFormat::from_str(fmt_str)
                    .map_err(|_| err(format!("-v {arg}: unknown format")))?;
                cfg.raw_formats.set(id, format);
            }
            "-P" => {
                let arg = arg()?;
                cfg.presets = PresetMode::from_str(&arg)
                    .map_err(|e| err(format!("-P {arg}: {e}")))?;
            }
            "-a" => cfg.apply_default_checks(),
            other => return Err(err(format!("unknown directive {other}"))),
        }
    }

    // a bare device entry monitors everything
    if !cfg.any_check_enabled() {
        cfg.apply_default_checks();
    }
    if email_policy_given && cfg.email_addrs.is_none() {
        return Err(err("-M requires -m".to_owned()));
    }
    if cfg.email_addrs.as_deref() == Some(NO_MAILER) && cfg.email_cmdline.is_none() {
        return Err(err(format!("-m {NO_MAILER} requires -M exec")));
    }
    Ok(cfg)
}

/// Parse a whole configuration file
pub(crate) fn parse_config(text: &str) -> Result<Vec<DeviceConfig>, ParseError> {
    let mut entries = Vec::new();
    for (lineno, line) in logical_lines(text) {
        entries.push(parse_entry(lineno, &line)?);
    }
    if let Some(pos) = entries.iter().position(DeviceConfig::is_devicescan) {
        if pos != 0 || entries.len() != 1 {
            let lineno = entries[pos].lineno;
            return Err(ParseError {
                lineno,
                msg: format!("{DEVICESCAN} must be the only device entry"),
            });
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn bare_device_gets_default_checks() {
        let entries = parse_config("/dev/sda\n").unwrap();
        assert_eq!(entries.len(), 1);
        let cfg = &entries[0];
        assert!(cfg.smartcheck && cfg.usagefailed && cfg.prefail && cfg.usage);
        assert!(cfg.selftest && cfg.errorlog);
        assert_eq!(cfg.curr_pending_id, 197);
        assert_eq!(cfg.offl_pending_id, 198);
    }

    #[test]
    fn explicit_directives() {
        let entries = parse_config(
            "/dev/sdb -d sat,12 -H -l error -l selftest -S on -o off \
             -W 4,45,55 -C 197+ -U 198 -F samsung3 -P ignore\n",
        )
        .unwrap();
        let cfg = &entries[0];
        assert_eq!(
            cfg.dev_type,
            DevType::Sat {
                cdb_len: crate::device::sat::SatCdbLen::Cdb12
            }
        );
        assert!(cfg.smartcheck);
        assert!(cfg.errorlog && cfg.selftest);
        assert_eq!(cfg.autosave, Toggle::On);
        assert_eq!(cfg.auto_offline, Toggle::Off);
        assert_eq!((cfg.tempdiff, cfg.tempinfo, cfg.tempcrit), (4, 45, 55));
        assert!(cfg.curr_pending_incr);
        assert!(!cfg.offl_pending_incr);
        assert_eq!(cfg.fix_firmwarebug, FirmwareFix::Samsung3);
        assert_eq!(cfg.presets, PresetMode::Ignore);
        // explicit directives suppress the -a default
        assert!(!cfg.usagefailed);
    }

    #[test]
    fn comments_and_continuation() {
        let text = "# header comment\n\
                    /dev/sda -H \\\n  -l error # trailing comment\n\
                    \n\
                    /dev/sdb -a\n";
        let entries = parse_config(text).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "/dev/sda");
        assert!(entries[0].errorlog);
        assert_eq!(entries[0].lineno, 2);
        assert_eq!(entries[1].name, "/dev/sdb");
    }

    #[test]
    fn devicescan_must_be_alone() {
        assert!(parse_config("DEVICESCAN -a\n").is_ok());
        assert!(parse_config("/dev/sda\nDEVICESCAN\n").is_err());
        assert!(parse_config("DEVICESCAN\n/dev/sda\n").is_err());
    }

    #[test]
    fn mail_policy_requires_address() {
        assert!(parse_config("/dev/sda -a -M daily\n").is_err());
        assert!(parse_config("/dev/sda -a -m root -M daily\n").is_ok());
        let entries = parse_config("/dev/sda -a -m root -M diminishing\n").unwrap();
        assert_eq!(entries[0].email_freq, EmailFreq::Diminishing);
    }

    #[test]
    fn nomailer_requires_exec() {
        assert!(parse_config("/dev/sda -a -m <nomailer>\n").is_err());
        let entries =
            parse_config("/dev/sda -a -m <nomailer> -M exec /usr/local/bin/alert\n").unwrap();
        assert_eq!(
            entries[0].email_cmdline.as_deref(),
            Some("/usr/local/bin/alert")
        );
    }

    #[test]
    fn schedule_regex_compiles() {
        let entries = parse_config("/dev/sda -a -s L/../../7/03|S/../.././02\n").unwrap();
        assert!(entries[0].test_regex.is_some());
        assert!(parse_config("/dev/sda -a -s ((broken\n").is_err());
    }

    #[test]
    fn attribute_flag_directives() {
        let entries = parse_config("/dev/sda -a -i 194 -I 9 -r 5 -R 199!\n").unwrap();
        let flags = &entries[0].attribute_flags;
        assert!(flags.has(194, attr_flag::IGNORE_FAILURE));
        assert!(flags.has(9, attr_flag::IGNORE_TRACKING));
        assert!(flags.has(5, attr_flag::PRINT_RAW));
        assert!(!flags.has(5, attr_flag::CRIT_CHANGE));
        assert!(flags.has(199, attr_flag::TRACK_RAW));
        assert!(flags.has(199, attr_flag::CRIT_RAW_CHANGE));
    }

    #[test]
    fn raw_format_directive() {
        let entries = parse_config("/dev/sda -a -v 9,min2hour -v 194,tempminmax\n").unwrap();
        assert_eq!(entries[0].raw_formats.get(9), RawFormat::Min2Hour);
        assert_eq!(entries[0].raw_formats.get(194), RawFormat::TempMinMax);
        assert_eq!(entries[0].raw_formats.get(5), RawFormat::Raw48);
    }

    #[test]
    fn raw_format_rendering() {
        assert_eq!(RawFormat::Raw48.render(12345), "12345");
        assert_eq!(RawFormat::Hex48.render(0x30), "0x000000000030");
        assert_eq!(RawFormat::Sec2Hour.render(3723), "1h+02m+03s");
        assert_eq!(RawFormat::Min2Hour.render(1445), "24h+05m");
        assert_eq!(RawFormat::HalfMin2Hour.render(241), "2h+00m");
        assert_eq!(
            RawFormat::TempMinMax.render(0x002D_000D_0023),
            "35 (min/max 13/45)"
        );
        assert_eq!(RawFormat::Raw16.render(0x0001_0002_0003), "1 2 3");
        assert_eq!(RawFormat::Raw8.render(0x0102_0304_0506), "1 2 3 4 5 6");
    }

    #[test]
    fn power_mode_directive() {
        let entries = parse_config("/dev/sda -a -n standby,15,q\n").unwrap();
        let cfg = &entries[0];
        assert_eq!(cfg.powermode, Some(PowerMode::Standby));
        assert_eq!(cfg.powerskipmax, 15);
        assert!(cfg.powerquiet);
        assert_eq!(
            parse_config("/dev/sda -a -n never\n").unwrap()[0].powermode,
            None
        );
    }

    #[test]
    fn removable_flag() {
        let entries = parse_config("/dev/sdc -d removable -d auto -a\n").unwrap();
        assert!(entries[0].removable);
        assert_eq!(entries[0].dev_type, DevType::Auto);
    }

    #[test]
    fn render_parse_round_trip() {
        let lines = [
            "/dev/sda -a -m root -s L/../../7/03 -W 4,45,55\n",
            "/dev/sdb -d sat,12 -H -f -l error -l selftest -S on -o off \
             -C 197+ -U 198 -R 5! -i 194 -v 9,min2hour -n standby,15,q \
             -F samsung2 -P showall -T permissive -m admin@example.org \
             -M diminishing\n",
            "/dev/sdc -H -m <nomailer> -M exec /usr/local/bin/alert -M test\n",
        ];
        for line in lines {
            let cfg = parse_config(line).unwrap().remove(0);
            let rendered = format!("{}\n", cfg.directive_line());
            let reparsed = parse_config(&rendered).unwrap().remove(0);
            assert_eq!(reparsed, cfg, "round trip failed for {line:?}");
        }
    }

    #[test]
    fn unknown_directive_rejected() {
        assert!(parse_config("/dev/sda -Z\n").is_err());
        assert!(parse_config("/dev/sda -W cold\n").is_err());
    }
}
