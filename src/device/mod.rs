//! Device abstraction: transport contract, ATA/SCSI device traits, and the
//! polymorphic device handle

pub(crate) mod sat;

use std::{fmt, io, str::FromStr, time::Duration};

use backon::{BlockingRetryable as _, ConstantBuilder};
use itertools::Itertools as _;

use crate::{
    ata::{AtaData, AtaInRegs, AtaOutRegs, OutRegsNeeded},
    scsi::{SimpleErr, opcode, sense},
};

/// Default timeout for one command
pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout for self-test launch commands
pub(crate) const SELF_TEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Maximum retries after a UNIT ATTENTION
const UA_MAX_RETRIES: usize = 3;

/// SCSI status byte values
pub(crate) mod status {
    pub(crate) const GOOD: u8 = 0x00;
    pub(crate) const CHECK_CONDITION: u8 = 0x02;
    pub(crate) const BUSY: u8 = 0x08;
}

/// Process-wide tracing knobs, passed explicitly instead of global state
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct Context {
    /// Debug level
    pub debug: u8,
    /// SCSI wire tracing level
    pub report_scsi: u8,
    /// ATA wire tracing level
    pub report_ata: u8,
}

/// Render bytes as space-separated hex for trace logs
pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).join(" ")
}

/// Errors from the device and transport layers
#[derive(thiserror::Error, Debug)]
pub(crate) enum SmartError {
    /// Syscall-level transport failure
    #[error("transport I/O error: {0}")]
    TransportIo(#[from] io::Error),
    /// Device returned CHECK CONDITION
    #[error("SCSI error: {0}")]
    Sense(SimpleErr),
    /// SAT response carried no ATA Return Descriptor
    #[error("missing ATA return descriptor in SAT response")]
    SatNoAtaDescriptor,
    /// Command timed out at the OS transport
    #[error("command timed out")]
    Timeout,
    /// Operation not representable on this device/transport combination
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
    /// Device answered with data that does not parse
    #[error("malformed {0} response")]
    BadResponse(&'static str),
    /// USB bridge taskfile readback did not match the issued command
    #[error("inconsistent taskfile readback from USB bridge")]
    UsbTaskfileRace,
}

/// Last-error record kept per device handle
#[derive(Clone, Debug, Default)]
pub(crate) struct DeviceError {
    /// errno-like code, 0 if not applicable
    pub code: i32,
    /// Human-readable message
    pub message: String,
}

/// Data phase direction of a SCSI command
#[derive(Copy, Clone, Debug, Eq, PartialEq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum DataDir {
    /// No data phase
    None,
    /// Device to host
    In,
    /// Host to device
    Out,
}

/// Completion of one pass-through exchange
#[derive(Clone, Debug, Default)]
pub(crate) struct ScsiCompletion {
    /// SCSI status byte
    pub status: u8,
    /// Raw sense bytes, empty when none were returned
    pub sense: Vec<u8>,
    /// Bytes of the data phase that were not transferred
    pub resid: usize,
}

impl ScsiCompletion {
    /// Classify this completion into a coarse error category
    pub(crate) fn simple_err(&self) -> SimpleErr {
        match self.status {
            status::GOOD => SimpleErr::Ok,
            status::CHECK_CONDITION => sense::normalize(&self.sense)
                .map_or(SimpleErr::Unknown, |disect| sense::simple_filter(&disect)),
            status::BUSY => SimpleErr::TryAgain,
            _ => SimpleErr::Unknown,
        }
    }
}

/// OS-level SCSI pass-through backend (SG_IO and friends).
///
/// The single seam between the monitor core and the operating system: a
/// populated CDB, a data direction and a timeout go in, a status byte and
/// sense bytes come out.
pub(crate) trait Transport {
    /// Open the underlying OS handle
    fn open(&mut self) -> io::Result<()>;
    /// Release the underlying OS handle
    fn close(&mut self);
    /// Whether the OS handle is currently open
    fn is_open(&self) -> bool;
    /// Issue one CDB
    fn pass_through(
        &mut self,
        cdb: &[u8],
        dir: DataDir,
        buf: &mut [u8],
        timeout: Duration,
    ) -> io::Result<ScsiCompletion>;
}

/// OS-level ATA taskfile backend, for transports that speak ATA natively
pub(crate) trait AtaTransport {
    /// Open the underlying OS handle
    fn open(&mut self) -> io::Result<()>;
    /// Release the underlying OS handle
    fn close(&mut self);
    /// Whether the OS handle is currently open
    fn is_open(&self) -> bool;
    /// Issue one taskfile
    fn ata_command(
        &mut self,
        regs: &AtaInRegs,
        data: AtaData<'_>,
        needed: &OutRegsNeeded,
        timeout: Duration,
    ) -> io::Result<AtaOutRegs>;
}

/// A device reachable with SCSI CDBs
pub(crate) trait ScsiDevice {
    /// Informal device name for logs
    fn name(&self) -> &str;
    /// Open the device
    fn open(&mut self) -> Result<(), SmartError>;
    /// Close the device
    fn close(&mut self);
    /// Whether the device is open
    fn is_open(&self) -> bool;
    /// Record of the last failed operation, if any
    fn last_error(&self) -> Option<&DeviceError> {
        None
    }
    /// Issue one CDB; transport failures are errors, CHECK CONDITION is a
    /// completion carrying sense
    fn scsi_pass_through(
        &mut self,
        cdb: &[u8],
        dir: DataDir,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<ScsiCompletion, SmartError>;
}

/// A device reachable with ATA taskfiles
pub(crate) trait AtaDevice {
    /// Informal device name for logs
    fn name(&self) -> &str;
    /// Open the device
    fn open(&mut self) -> Result<(), SmartError>;
    /// Close the device
    fn close(&mut self);
    /// Whether the device is open
    fn is_open(&self) -> bool;
    /// Record of the last failed operation, if any
    fn last_error(&self) -> Option<&DeviceError> {
        None
    }
    /// Issue one ATA command, returning the output registers the caller
    /// asked for
    fn ata_pass_through(
        &mut self,
        regs: &AtaInRegs,
        data: AtaData<'_>,
        needed: &OutRegsNeeded,
        timeout: Duration,
    ) -> Result<AtaOutRegs, SmartError>;
}

/// Commands that must not be retried on UNIT ATTENTION, so the caller can
/// observe the condition (e.g. a bus reset)
const NO_UA_RETRY_OPCODES: [u8; 3] = [opcode::INQUIRY, opcode::REQUEST_SENSE, opcode::REPORT_LUNS];

/// Issue a CDB, retrying up to 3 times on UNIT ATTENTION.
///
/// INQUIRY, REQUEST SENSE and REPORT LUNS are never retried; their UNIT
/// ATTENTION surfaces in the returned completion.
pub(crate) fn pass_through_checked(
    dev: &mut dyn ScsiDevice,
    cdb: &[u8],
    dir: DataDir,
    buf: &mut [u8],
    timeout: Duration,
) -> Result<ScsiCompletion, SmartError> {
    if cdb.first().is_some_and(|op| NO_UA_RETRY_OPCODES.contains(op)) {
        return dev.scsi_pass_through(cdb, dir, buf, timeout);
    }
    let attempt = || {
        let completion = dev.scsi_pass_through(cdb, dir, buf, timeout)?;
        if completion.status == status::CHECK_CONDITION
            && completion.simple_err() == SimpleErr::TryAgain
        {
            return Err(SmartError::Sense(SimpleErr::TryAgain));
        }
        Ok(completion)
    };
    attempt
        .retry(
            ConstantBuilder::default()
                .with_delay(Duration::ZERO)
                .with_max_times(UA_MAX_RETRIES),
        )
        .when(|e| matches!(e, SmartError::Sense(SimpleErr::TryAgain)))
        .call()
}

/// Concrete SCSI device over an OS transport
pub(crate) struct ScsiCore {
    /// Informal name (device path)
    name: String,
    /// OS backend
    transport: Box<dyn Transport>,
    /// Tracing knobs
    ctx: Context,
    /// Last failed operation
    last_err: Option<DeviceError>,
}

impl ScsiCore {
    /// Wrap an OS transport
    pub(crate) fn new(name: &str, transport: Box<dyn Transport>, ctx: Context) -> Self {
        Self {
            name: name.to_owned(),
            transport,
            ctx,
            last_err: None,
        }
    }
}

impl ScsiDevice for ScsiCore {
    fn name(&self) -> &str {
        &self.name
    }

    fn last_error(&self) -> Option<&DeviceError> {
        self.last_err.as_ref()
    }

    fn open(&mut self) -> Result<(), SmartError> {
        self.transport.open().map_err(|e| {
            self.last_err = Some(DeviceError {
                code: e.raw_os_error().unwrap_or(0),
                message: e.to_string(),
            });
            SmartError::TransportIo(e)
        })
    }

    fn close(&mut self) {
        self.transport.close();
    }

    fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    fn scsi_pass_through(
        &mut self,
        cdb: &[u8],
        dir: DataDir,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<ScsiCompletion, SmartError> {
        if self.ctx.report_scsi > 0 {
            log::debug!("{}: scsi cdb [{}] dir {dir}", self.name, hex(cdb));
        }
        let completion = self
            .transport
            .pass_through(cdb, dir, buf, timeout)
            .map_err(|e| {
                self.last_err = Some(DeviceError {
                    code: e.raw_os_error().unwrap_or(0),
                    message: e.to_string(),
                });
                if e.kind() == io::ErrorKind::TimedOut {
                    SmartError::Timeout
                } else {
                    SmartError::TransportIo(e)
                }
            })?;
        if self.ctx.report_scsi > 1 && !completion.sense.is_empty() {
            log::debug!(
                "{}: scsi status {:#04x} resid {} sense [{}]",
                self.name,
                completion.status,
                completion.resid,
                hex(&completion.sense)
            );
        }
        Ok(completion)
    }
}

/// Concrete ATA device over a native-ATA OS transport
pub(crate) struct AtaCore {
    /// Informal name (device path)
    name: String,
    /// OS backend
    transport: Box<dyn AtaTransport>,
    /// Tracing knobs
    ctx: Context,
    /// Last failed operation
    last_err: Option<DeviceError>,
}

impl AtaCore {
    /// Wrap a native ATA OS transport
    pub(crate) fn new(name: &str, transport: Box<dyn AtaTransport>, ctx: Context) -> Self {
        Self {
            name: name.to_owned(),
            transport,
            ctx,
            last_err: None,
        }
    }
}

impl AtaDevice for AtaCore {
    fn name(&self) -> &str {
        &self.name
    }

    fn last_error(&self) -> Option<&DeviceError> {
        self.last_err.as_ref()
    }

    fn open(&mut self) -> Result<(), SmartError> {
        self.transport.open().map_err(SmartError::TransportIo)
    }

    fn close(&mut self) {
        self.transport.close();
    }

    fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    fn ata_pass_through(
        &mut self,
        regs: &AtaInRegs,
        data: AtaData<'_>,
        needed: &OutRegsNeeded,
        timeout: Duration,
    ) -> Result<AtaOutRegs, SmartError> {
        if self.ctx.report_ata > 0 {
            log::debug!(
                "{}: ata cmd {} sc {:#04x} lba {:#04x}/{:#04x}/{:#04x}",
                self.name,
                crate::ata::names::command_name(regs.command, regs.features),
                regs.sector_count,
                regs.lba_low,
                regs.lba_mid,
                regs.lba_high,
            );
        }
        self.transport
            .ata_command(regs, data, needed, timeout)
            .map_err(|e| {
                self.last_err = Some(DeviceError {
                    code: e.raw_os_error().unwrap_or(0),
                    message: e.to_string(),
                });
                if e.kind() == io::ErrorKind::TimedOut {
                    SmartError::Timeout
                } else {
                    SmartError::TransportIo(e)
                }
            })
    }
}

/// Device type selection, from the `-d` directive or auto-detection
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub(crate) enum DevType {
    /// Probe SAT, then USB bridges, then plain SCSI
    #[default]
    Auto,
    /// Native ATA
    Ata,
    /// Plain SCSI
    Scsi,
    /// SAT tunnel with the given CDB length
    Sat {
        /// ATA PASS-THROUGH CDB length
        cdb_len: sat::SatCdbLen,
    },
    /// USB Cypress bridge with the given vendor signature byte
    UsbCypress {
        /// Vendor-specific CDB signature
        signature: u8,
    },
}

impl fmt::Display for DevType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DevType::Auto => write!(f, "auto"),
            DevType::Ata => write!(f, "ata"),
            DevType::Scsi => write!(f, "scsi"),
            DevType::Sat { cdb_len } => write!(f, "sat,{}", *cdb_len as u8),
            DevType::UsbCypress { signature } => write!(f, "usbcypress,{signature:#04x}"),
        }
    }
}

impl FromStr for DevType {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(DevType::Auto),
            "ata" => Ok(DevType::Ata),
            "scsi" => Ok(DevType::Scsi),
            "sat" | "sat,16" => Ok(DevType::Sat {
                cdb_len: sat::SatCdbLen::Cdb16,
            }),
            "sat,12" => Ok(DevType::Sat {
                cdb_len: sat::SatCdbLen::Cdb12,
            }),
            "usbcypress" => Ok(DevType::UsbCypress {
                signature: sat::CYPRESS_DEFAULT_SIGNATURE,
            }),
            _ => {
                if let Some(sig) = s.strip_prefix("usbcypress,") {
                    let sig = sig.strip_prefix("0x").unwrap_or(sig);
                    u8::from_str_radix(sig, 16)
                        .map(|signature| DevType::UsbCypress { signature })
                        .map_err(|_| "invalid usbcypress signature")
                } else {
                    Err("unknown device type")
                }
            }
        }
    }
}

/// Polymorphic device handle owned by the monitoring engine
pub(crate) enum SmartDevice {
    /// Native ATA device
    Ata(AtaCore),
    /// Plain SCSI device
    Scsi(ScsiCore),
    /// ATA device tunnelled through SCSI ATA PASS-THROUGH
    SatTunnel(sat::SatTunnel),
    /// ATA device behind a Cypress USB bridge
    UsbCypress(sat::UsbCypress),
}

impl fmt::Display for SmartDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl SmartDevice {
    /// Informal device name
    pub(crate) fn name(&self) -> &str {
        match self {
            SmartDevice::Ata(d) => AtaDevice::name(d),
            SmartDevice::Scsi(d) => ScsiDevice::name(d),
            SmartDevice::SatTunnel(d) => AtaDevice::name(d),
            SmartDevice::UsbCypress(d) => AtaDevice::name(d),
        }
    }

    /// Device type tag for logs
    pub(crate) fn dev_type(&self) -> &'static str {
        match self {
            SmartDevice::Ata(_) => "ata",
            SmartDevice::Scsi(_) => "scsi",
            SmartDevice::SatTunnel(_) => "sat",
            SmartDevice::UsbCypress(_) => "usbcypress",
        }
    }

    /// Whether the handle answers ATA commands
    pub(crate) fn is_ata(&self) -> bool {
        !matches!(self, SmartDevice::Scsi(_))
    }

    /// ATA view of this device, if it has one
    pub(crate) fn as_ata(&mut self) -> Option<&mut dyn AtaDevice> {
        match self {
            SmartDevice::Ata(d) => Some(d),
            SmartDevice::SatTunnel(d) => Some(d),
            SmartDevice::UsbCypress(d) => Some(d),
            SmartDevice::Scsi(_) => None,
        }
    }

    /// SCSI view of this device, if it has one
    pub(crate) fn as_scsi(&mut self) -> Option<&mut dyn ScsiDevice> {
        match self {
            SmartDevice::Scsi(d) => Some(d),
            _ => None,
        }
    }

    /// Open the underlying OS handle
    pub(crate) fn open(&mut self) -> Result<(), SmartError> {
        match self {
            SmartDevice::Ata(d) => AtaDevice::open(d),
            SmartDevice::Scsi(d) => ScsiDevice::open(d),
            SmartDevice::SatTunnel(d) => AtaDevice::open(d),
            SmartDevice::UsbCypress(d) => AtaDevice::open(d),
        }
    }

    /// Release the underlying OS handle
    pub(crate) fn close(&mut self) {
        match self {
            SmartDevice::Ata(d) => AtaDevice::close(d),
            SmartDevice::Scsi(d) => ScsiDevice::close(d),
            SmartDevice::SatTunnel(d) => AtaDevice::close(d),
            SmartDevice::UsbCypress(d) => AtaDevice::close(d),
        }
    }

    /// Whether the OS handle is open
    pub(crate) fn is_open(&self) -> bool {
        match self {
            SmartDevice::Ata(d) => AtaDevice::is_open(d),
            SmartDevice::Scsi(d) => ScsiDevice::is_open(d),
            SmartDevice::SatTunnel(d) => AtaDevice::is_open(d),
            SmartDevice::UsbCypress(d) => AtaDevice::is_open(d),
        }
    }

    /// Record of the last failed operation, if any
    pub(crate) fn last_error(&self) -> Option<&DeviceError> {
        match self {
            SmartDevice::Ata(d) => AtaDevice::last_error(d),
            SmartDevice::Scsi(d) => ScsiDevice::last_error(d),
            SmartDevice::SatTunnel(d) => AtaDevice::last_error(d),
            SmartDevice::UsbCypress(d) => AtaDevice::last_error(d),
        }
    }
}

/// Build a device from a SCSI transport according to the type selection.
///
/// With [`DevType::Auto`], probe SAT first (IDENTIFY DEVICE through a
/// 16-byte ATA PASS-THROUGH), then the Cypress vendor CDB, and fall back to
/// plain SCSI.
pub(crate) fn classify_scsi_device(
    name: &str,
    transport: Box<dyn Transport>,
    dev_type: DevType,
    ctx: Context,
) -> Result<SmartDevice, SmartError> {
    let mut core = ScsiCore::new(name, transport, ctx);
    ScsiDevice::open(&mut core)?;
    match dev_type {
        DevType::Scsi => Ok(SmartDevice::Scsi(core)),
        DevType::Sat { cdb_len } => Ok(SmartDevice::SatTunnel(sat::SatTunnel::new(
            Box::new(core),
            cdb_len,
        ))),
        DevType::UsbCypress { signature } => Ok(SmartDevice::UsbCypress(sat::UsbCypress::new(
            Box::new(core),
            signature,
        ))),
        DevType::Auto | DevType::Ata => {
            if sat::probe_sat(&mut core) {
                log::debug!("{name}: SAT pass-through detected");
                return Ok(SmartDevice::SatTunnel(sat::SatTunnel::new(
                    Box::new(core),
                    sat::SatCdbLen::Cdb16,
                )));
            }
            if sat::probe_cypress(&mut core, sat::CYPRESS_DEFAULT_SIGNATURE) {
                log::debug!("{name}: Cypress USB bridge detected");
                return Ok(SmartDevice::UsbCypress(sat::UsbCypress::new(
                    Box::new(core),
                    sat::CYPRESS_DEFAULT_SIGNATURE,
                )));
            }
            log::debug!("{name}: no ATA pass-through detected, treating as plain SCSI");
            Ok(SmartDevice::Scsi(core))
        }
    }
}
