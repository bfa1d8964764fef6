//! Scripted mock transport used in unit tests to emulate the HID device.

use core::time::Duration;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread;

use crate::frame::{DEVICE_MARKER, crc16};
use crate::transport::HidTransport;

/// Build a device-to-host report the way the hardware frames one.
pub fn device_frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
    let mut raw = vec![DEVICE_MARKER, opcode, 0x00, payload.len() as u8];
    raw.extend_from_slice(payload);
    let crc = crc16(&raw);
    raw.extend_from_slice(&crc.to_le_bytes());
    raw
}

#[derive(Debug)]
pub enum MockHidError {
    /// Generic simulated I/O failure.
    Simulated,
}

#[derive(Default)]
struct Inner {
    /// Reports written by the driver, in order.
    written: Vec<Vec<u8>>,
    /// Pre-scripted reports handed out one per read. An empty queue means
    /// the device stays silent and reads time out.
    responses: VecDeque<Vec<u8>>,
    should_error_on_write: bool,
    should_short_write: bool,
}

/// Clonable handle to shared mock state, so tests can keep inspecting the
/// transport after handing a clone to the driver (including from another
/// thread).
#[derive(Clone, Default)]
pub struct MockHid {
    inner: Arc<Mutex<Inner>>,
}

impl MockHid {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a raw report to be returned by the next read.
    pub fn push_response(&self, raw: &[u8]) {
        self.inner.lock().unwrap().responses.push_back(raw.to_vec());
    }

    /// Queue a well-formed device frame to be returned by the next read.
    pub fn push_frame(&self, opcode: u8, payload: &[u8]) {
        self.push_response(&device_frame(opcode, payload));
    }

    /// All reports written so far.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.inner.lock().unwrap().written.clone()
    }

    /// Number of written reports carrying the given opcode.
    pub fn written_count(&self, opcode: u8) -> usize {
        self.inner
            .lock()
            .unwrap()
            .written
            .iter()
            .filter(|report| report.get(1) == Some(&opcode))
            .count()
    }

    pub fn set_write_error(&self, should_error: bool) {
        self.inner.lock().unwrap().should_error_on_write = should_error;
    }

    /// Make the next writes report one byte fewer than requested.
    pub fn set_short_write(&self, short: bool) {
        self.inner.lock().unwrap().should_short_write = short;
    }
}

impl HidTransport for MockHid {
    type Error = MockHidError;

    fn write_report(&mut self, report: &[u8]) -> Result<usize, Self::Error> {
        let mut inner = self.inner.lock().unwrap();
        if inner.should_error_on_write {
            return Err(MockHidError::Simulated);
        }
        inner.written.push(report.to_vec());
        if inner.should_short_write {
            Ok(report.len() - 1)
        } else {
            Ok(report.len())
        }
    }

    fn read_report(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, Self::Error> {
        let response = self.inner.lock().unwrap().responses.pop_front();
        match response {
            Some(report) => {
                let n = report.len().min(buf.len());
                buf[..n].copy_from_slice(&report[..n]);
                Ok(n)
            }
            None => {
                // Emulate a blocking read that runs into its timeout.
                thread::sleep(timeout);
                Ok(0)
            }
        }
    }
}
