//! Error types for DP100 communications.

use thiserror::Error;

pub type Result<T, I> = core::result::Result<T, Error<I>>;

/// Failure of a single operation against the device.
///
/// `I` is the transport's own error type, carried through unchanged so
/// callers can inspect the underlying HID failure.
#[derive(Error, Debug)]
pub enum Error<I: core::fmt::Debug> {
    /// The transport failed to move a report in or out.
    #[error("HID transport error")]
    Transport(I),
    /// No transport handle; `connect` has not been called or `disconnect`
    /// already ran.
    #[error("device not connected")]
    NotConnected,
    /// The transport accepted fewer bytes than one full request frame.
    #[error("short report write")]
    ShortWrite,
    /// The request payload does not fit a single 64-byte report.
    #[error("payload too large for one report")]
    PayloadTooLarge,
    /// No valid frame arrived before the exchange deadline.
    #[error("exchange timed out")]
    Timeout,
    /// The shared abort signal was raised while waiting for a response.
    #[error("exchange aborted")]
    Aborted,
    /// A structurally valid frame arrived whose opcode or payload shape does
    /// not match the request.
    #[error("unexpected response to opcode {expected:#04x}")]
    UnexpectedResponse { expected: u8 },
    /// The device acknowledged a setpoint but telemetry never converged to it
    /// within tolerance.
    #[error("output did not converge to the requested setpoint")]
    VerificationFailed,
}
