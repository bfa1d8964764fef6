//! The seam between the protocol engine and the raw USB-HID layer.
//!
//! The engine only ever moves whole fixed-size reports, so the trait is
//! deliberately narrower than a byte stream: one write per request frame, one
//! bounded read per poll. Anything that can shuttle 64-byte reports with a
//! per-call read timeout can drive a [`Dp100`](crate::psu::Dp100) — the
//! `hidapi` feature provides the real implementation, tests use a scripted
//! mock.

use core::time::Duration;

/// Fixed-size HID report transport.
pub trait HidTransport {
    type Error: core::fmt::Debug;

    /// Write one output report. Returns the number of report bytes accepted;
    /// anything short of `report.len()` is treated as a failed exchange by
    /// the caller.
    fn write_report(&mut self, report: &[u8]) -> Result<usize, Self::Error>;

    /// Read at most one input report into `buf`, waiting up to `timeout`.
    ///
    /// Returns `Ok(0)` when nothing arrived in time. The timeout bounds a
    /// single read so the dispatcher can interleave abort and deadline
    /// checks between polls; it is not the overall exchange deadline.
    fn read_report(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, Self::Error>;
}
