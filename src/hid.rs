//! Real USB-HID transport backed by `hidapi`.

use core::time::Duration;

use hidapi::{HidApi, HidDevice, HidError};

use crate::frame::REPORT_LEN;
use crate::psu::Dp100;
use crate::transport::HidTransport;

/// USB vendor ID of the DP100.
pub const USB_VID: u16 = 0x2E3C;
/// USB product ID of the DP100.
pub const USB_PID: u16 = 0xAF01;

/// A handle to the DP100's HID interface.
pub struct HidLink {
    device: HidDevice,
}

impl HidLink {
    /// Open the first attached DP100.
    pub fn open() -> Result<Self, HidError> {
        let api = HidApi::new()?;
        let device = api.open(USB_VID, USB_PID)?;
        Ok(Self { device })
    }
}

impl HidTransport for HidLink {
    type Error = HidError;

    fn write_report(&mut self, report: &[u8]) -> Result<usize, Self::Error> {
        // Output reports need the report ID (always 0 on this device)
        // prepended and must be padded to the full report size.
        let mut padded = [0u8; REPORT_LEN + 1];
        let n = report.len().min(REPORT_LEN);
        padded[1..1 + n].copy_from_slice(&report[..n]);
        let written = self.device.write(&padded)?;
        if written == padded.len() {
            Ok(report.len())
        } else {
            Ok(written.saturating_sub(1))
        }
    }

    fn read_report(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, Self::Error> {
        self.device.read_timeout(buf, timeout.as_millis() as i32)
    }
}

impl Dp100<HidLink> {
    /// Open the first attached DP100 and return a connected handle.
    pub fn open() -> Result<Self, HidError> {
        let psu = Self::new();
        psu.connect(HidLink::open()?);
        Ok(psu)
    }
}
