//! Linux SG_IO pass-through transport and block device enumeration
//!
//! The only OS-specific code in the daemon; everything above consumes the
//! [`Transport`] contract.

use std::{
    ffi::c_void,
    fs::{self, File, OpenOptions},
    io,
    os::{fd::AsRawFd as _, unix::fs::OpenOptionsExt as _},
    path::{Path, PathBuf},
    time::Duration,
};

use nix::libc::O_NONBLOCK;

use crate::device::{DataDir, ScsiCompletion, Transport};

/// SG_IO ioctl request number
const SG_IO: u64 = 0x2285;

/// sg data direction: no transfer
const SG_DXFER_NONE: i32 = -1;
/// sg data direction: host to device
const SG_DXFER_TO_DEV: i32 = -2;
/// sg data direction: device to host
const SG_DXFER_FROM_DEV: i32 = -3;

/// Host adapter timeout status
const DID_TIME_OUT: u16 = 0x03;
/// Driver-level timeout flag
const DRIVER_TIMEOUT: u16 = 0x06;

/// Sense buffer size handed to the kernel
const MAX_SENSE_LEN: usize = 32;

/// `struct sg_io_hdr` from `<scsi/sg.h>`
#[repr(C)]
struct SgIoHdr {
    interface_id: i32,
    dxfer_direction: i32,
    cmd_len: u8,
    mx_sb_len: u8,
    iovec_count: u16,
    dxfer_len: u32,
    dxferp: *mut c_void,
    cmdp: *mut u8,
    sbp: *mut u8,
    timeout: u32,
    flags: u32,
    pack_id: i32,
    usr_ptr: *mut c_void,
    status: u8,
    masked_status: u8,
    msg_status: u8,
    sb_len_wr: u8,
    host_status: u16,
    driver_status: u16,
    resid: i32,
    duration: u32,
    info: u32,
}

// the sg driver predates the encoded-request ioctl convention
nix::ioctl_readwrite_bad!(sg_io_ioctl, SG_IO, SgIoHdr);

/// SCSI generic pass-through over `/dev/sdX`
pub(crate) struct SgTransport {
    /// Device path
    path: PathBuf,
    /// Open handle, kept only while the engine holds the device open
    file: Option<File>,
}

impl SgTransport {
    /// Transport for the given block device path
    pub(crate) fn new(path: &Path) -> Self {
        Self {
            path: path.to_owned(),
            file: None,
        }
    }
}

impl Transport for SgTransport {
    fn open(&mut self) -> io::Result<()> {
        if self.file.is_none() {
            let file = OpenOptions::new()
                .read(true)
                .custom_flags(O_NONBLOCK)
                .open(&self.path)?;
            self.file = Some(file);
        }
        Ok(())
    }

    fn close(&mut self) {
        self.file = None;
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn pass_through(
        &mut self,
        cdb: &[u8],
        dir: DataDir,
        buf: &mut [u8],
        timeout: Duration,
    ) -> io::Result<ScsiCompletion> {
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "device not open"))?;
        let mut cdb_copy = cdb.to_vec();
        let mut sense = [0u8; MAX_SENSE_LEN];
        let mut hdr = SgIoHdr {
            interface_id: i32::from(b'S'),
            dxfer_direction: match dir {
                DataDir::None => SG_DXFER_NONE,
                DataDir::In => SG_DXFER_FROM_DEV,
                DataDir::Out => SG_DXFER_TO_DEV,
            },
            cmd_len: cdb_copy.len() as u8,
            mx_sb_len: MAX_SENSE_LEN as u8,
            iovec_count: 0,
            dxfer_len: buf.len() as u32,
            dxferp: buf.as_mut_ptr().cast::<c_void>(),
            cmdp: cdb_copy.as_mut_ptr(),
            sbp: sense.as_mut_ptr(),
            timeout: timeout.as_millis().min(u128::from(u32::MAX)) as u32,
            flags: 0,
            pack_id: 0,
            usr_ptr: std::ptr::null_mut(),
            status: 0,
            masked_status: 0,
            msg_status: 0,
            sb_len_wr: 0,
            host_status: 0,
            driver_status: 0,
            resid: 0,
            duration: 0,
            info: 0,
        };
        // SAFETY: hdr points at buffers that outlive the ioctl call, and the
        // kernel writes at most mx_sb_len/dxfer_len bytes into them
        unsafe { sg_io_ioctl(file.as_raw_fd(), &raw mut hdr) }
            .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        if hdr.host_status == DID_TIME_OUT || hdr.driver_status & 0x0F == DRIVER_TIMEOUT {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "SG_IO timeout"));
        }
        if hdr.host_status != 0 {
            return Err(io::Error::other(format!(
                "SG_IO host status {:#04x}",
                hdr.host_status
            )));
        }
        Ok(ScsiCompletion {
            status: hdr.status,
            sense: sense[..usize::from(hdr.sb_len_wr)].to_vec(),
            resid: usize::try_from(hdr.resid).unwrap_or(0),
        })
    }
}

/// Transport for a device path
pub(crate) fn make_transport(path: &str) -> Box<dyn Transport> {
    Box::new(SgTransport::new(Path::new(path)))
}

/// Enumerate monitorable block devices for the device-scan sentinel
pub(crate) fn scan_devices() -> io::Result<Vec<PathBuf>> {
    let mut devices: Vec<PathBuf> = fs::read_dir("/sys/block")?
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let name = entry.file_name();
            let name = name.to_str()?;
            (name.starts_with("sd") || name.starts_with("hd"))
                .then(|| PathBuf::from(format!("/dev/{name}")))
        })
        .collect();
    devices.sort();
    Ok(devices)
}
