//! Shared code for tests

#![allow(clippy::unwrap_used)]

use std::{io, time::Duration};

use crate::{
    config::DeviceConfig,
    device::{DataDir, ScsiCompletion, Transport, status},
    notify::{Event, Notifier},
    unaligned,
};

/// Notifier remembering delivered events
#[derive(Default)]
pub(crate) struct RecordingNotifier {
    /// Events that made it past the frequency policy
    pub(crate) delivered: Vec<Event>,
}

impl Notifier for RecordingNotifier {
    fn notify(&mut self, _cfg: &DeviceConfig, event: &Event) -> anyhow::Result<()> {
        self.delivered.push(event.clone());
        Ok(())
    }
}

/// Transport replaying canned completions, recording issued CDBs.
///
/// Completions are popped front first; data-in payloads are matched to calls
/// by index. Once the completion queue is exhausted, further calls succeed
/// with GOOD status and no data.
pub(crate) struct MockTransport {
    /// Queued completions
    completions: Vec<io::Result<ScsiCompletion>>,
    /// CDBs seen, in order
    pub(crate) cdbs: Vec<Vec<u8>>,
    /// Data returned for data-in phases, matched by call index
    pub(crate) data_in: Vec<Vec<u8>>,
    /// Make open calls fail
    pub(crate) fail_open: bool,
    /// Whether open was called
    open: bool,
}

impl MockTransport {
    pub(crate) fn new(completions: Vec<io::Result<ScsiCompletion>>) -> Self {
        Self {
            completions,
            cdbs: Vec::new(),
            data_in: Vec::new(),
            fail_open: false,
            open: false,
        }
    }
}

impl Transport for MockTransport {
    fn open(&mut self) -> io::Result<()> {
        if self.fail_open {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "mock open"));
        }
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn pass_through(
        &mut self,
        cdb: &[u8],
        _dir: DataDir,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> io::Result<ScsiCompletion> {
        let idx = self.cdbs.len();
        self.cdbs.push(cdb.to_vec());
        if let Some(data) = self.data_in.get(idx) {
            let n = data.len().min(buf.len());
            buf[..n].copy_from_slice(&data[..n]);
        }
        if self.completions.is_empty() {
            return Ok(ScsiCompletion::default());
        }
        self.completions.remove(0)
    }
}

/// Native-ATA transport replaying canned output registers
pub(crate) struct MockAtaTransport {
    /// Queued register answers
    responses: Vec<io::Result<crate::ata::AtaOutRegs>>,
    /// Taskfiles seen, in order
    pub(crate) commands: Vec<crate::ata::AtaInRegs>,
    /// Whether open was called
    open: bool,
}

impl MockAtaTransport {
    pub(crate) fn new(responses: Vec<io::Result<crate::ata::AtaOutRegs>>) -> Self {
        Self {
            responses,
            commands: Vec::new(),
            open: false,
        }
    }
}

impl crate::device::AtaTransport for MockAtaTransport {
    fn open(&mut self) -> io::Result<()> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn ata_command(
        &mut self,
        regs: &crate::ata::AtaInRegs,
        _data: crate::ata::AtaData<'_>,
        _needed: &crate::ata::OutRegsNeeded,
        _timeout: Duration,
    ) -> io::Result<crate::ata::AtaOutRegs> {
        self.commands.push(*regs);
        if self.responses.is_empty() {
            return Ok(crate::ata::AtaOutRegs::default());
        }
        self.responses.remove(0)
    }
}

/// Fixed-format sense with the given key
pub(crate) fn sense_with_key(key: u8) -> Vec<u8> {
    let mut sense = vec![0u8; 18];
    sense[0] = 0x70;
    sense[2] = key;
    sense[7] = 10;
    sense
}

/// CHECK CONDITION completion with a fixed-format sense of the given key
pub(crate) fn check_condition(key: u8) -> ScsiCompletion {
    ScsiCompletion {
        status: status::CHECK_CONDITION,
        sense: sense_with_key(key),
        resid: 0,
    }
}

/// CHECK CONDITION completion with the given raw sense bytes
pub(crate) fn check_condition_sense(sense: &[u8]) -> ScsiCompletion {
    ScsiCompletion {
        status: status::CHECK_CONDITION,
        sense: sense.to_vec(),
        resid: 0,
    }
}

/// SMART READ DATA image with the given attribute triples
/// `(id, current, raw)`, prefail flags and full self-test capabilities
pub(crate) fn fake_smart_values(attrs: &[(u8, u8, u64)]) -> [u8; 512] {
    let mut data = [0u8; 512];
    data[0] = 0x10;
    for (i, (id, current, raw)) in attrs.iter().enumerate() {
        let off = 2 + i * 12;
        data[off] = *id;
        data[off + 1] = 0x03; // prefail, online
        data[off + 3] = *current;
        data[off + 4] = *current;
        for b in 0..6 {
            data[off + 5 + b] = (*raw >> (8 * b)) as u8;
        }
    }
    // capabilities: offline immediate, self-test, conveyance, selective
    data[367] = 0x71;
    data[511] = {
        let sum = data.iter().fold(0u8, |s, b| s.wrapping_add(*b));
        0u8.wrapping_sub(sum)
    };
    data
}

/// IDENTIFY data with model/serial/firmware strings, a 48-bit sector count
/// and a valid checksum signature
pub(crate) fn fake_identify(sectors: u64) -> [u8; 512] {
    let mut id = [0u8; 512];
    let put_string = |id: &mut [u8; 512], start_word: usize, s: &str| {
        for (i, pair) in s.as_bytes().chunks(2).enumerate() {
            id[2 * (start_word + i) + 1] = pair[0];
            id[2 * (start_word + i)] = *pair.get(1).unwrap_or(&b' ');
        }
    };
    put_string(&mut id, 27, "FAKEDISK 2000GB                         ");
    put_string(&mut id, 10, "SN0123456789        ");
    put_string(&mut id, 23, "FW1.0   ");
    // 48-bit feature set + sector count
    unaligned::put_le16(&mut id, 2 * 83, 1 << 10);
    unaligned::put_le64(&mut id, 2 * 100, sectors);
    id[510] = 0xA5;
    let sum = id.iter().fold(0u8, |sum, b| sum.wrapping_add(*b));
    id[511] = 0u8.wrapping_sub(sum);
    id
}
