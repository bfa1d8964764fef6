//! The DP100 device handle: command dispatcher, cancellation and the typed
//! operations built on top of it.
//!
//! The link is half-duplex request/response with no multiplexing, so all
//! callers are serialized through one mutex held for the whole
//! send-then-receive cycle. Exactly one exchange is in flight system-wide;
//! requests are processed strictly in lock-acquisition order.
//!
//! We use the nomenclature that "get" reads a value back from the device and
//! "set"/"update" writes one; `get_basic_info` returns measured values.

use core::time::Duration;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use log::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::frame::{self, Frame, Opcode, REPORT_LEN};
use crate::payload::{
    BASIC_INFO_LEN, BasicInfo, DEVICE_INFO_LEN, DeviceInfo, MODIFY_ACTIVE, OUTPUT_SET_LEN,
    OutputRequest, PRESET_GROUPS, SETTINGS_LEN, SettingsUpdate, SystemSettings,
};
use crate::transport::HidTransport;

/// Default number of apply attempts for a verified setpoint change.
pub const SET_ATTEMPTS: u32 = 3;

/// Verification tolerance for output voltage, 0.1 V.
const TOLERANCE_MV: u32 = 100;
/// Verification tolerance for output current, 0.1 A.
const TOLERANCE_MA: u32 = 100;
/// Status byte the device returns for an accepted state change.
const ACK_OK: u8 = 1;

/// Cooperative cancellation signal shared between the dispatcher and an
/// external watchdog.
///
/// The dispatcher clears it at the start of every exchange and checks it
/// between bounded reads, so setting it unblocks an in-flight exchange within
/// one poll interval. Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of the in-flight exchange.
    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Timing knobs for the dispatcher and the setpoint verification loop.
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    /// Overall deadline for one request/response exchange.
    pub exchange_timeout: Duration,
    /// Bound on a single transport read. Abort and deadline are re-checked
    /// between reads, so this is the worst-case cancellation latency.
    pub poll_interval: Duration,
    /// Wait between an acknowledged setpoint and the verification read, to
    /// let the device's control loop converge.
    pub settle_delay: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            exchange_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(100),
            settle_delay: Duration::from_millis(500),
        }
    }
}

/// A DP100 power supply reached through any [`HidTransport`].
///
/// All methods take `&self`; the handle can be shared across threads (e.g. a
/// periodic telemetry poller plus user-triggered setpoint changes) and the
/// internal lock serializes the exchanges.
pub struct Dp100<T: HidTransport> {
    /// Transport handle and exchange lock in one: the mutex is held for a
    /// full send/receive cycle, the `Option` is the connect state.
    link: Mutex<Option<T>>,
    abort: AbortSignal,
    timing: Timing,
}

impl<T: HidTransport> Default for Dp100<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: HidTransport> Dp100<T> {
    /// Create a handle with default [`Timing`], not yet connected.
    pub fn new() -> Self {
        Self::with_timing(Timing::default())
    }

    pub fn with_timing(timing: Timing) -> Self {
        Self {
            link: Mutex::new(None),
            abort: AbortSignal::new(),
            timing,
        }
    }

    /// Attach a transport handle. No-op if already connected, in which case
    /// the offered handle is dropped.
    pub fn connect(&self, transport: T) {
        let mut link = self.link.lock().unwrap_or_else(|err| err.into_inner());
        if link.is_none() {
            *link = Some(transport);
        }
    }

    /// Drop the transport handle, closing the device. No-op when not
    /// connected. Blocks until any in-flight exchange finishes.
    pub fn disconnect(&self) {
        let mut link = self.link.lock().unwrap_or_else(|err| err.into_inner());
        *link = None;
    }

    pub fn is_connected(&self) -> bool {
        self.link
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .is_some()
    }

    /// Request cancellation of the in-flight exchange, if any.
    pub fn abort(&self) {
        self.abort.set();
    }

    /// A clonable handle for an external watchdog to trigger [`Self::abort`]
    /// without borrowing the device.
    pub fn abort_signal(&self) -> AbortSignal {
        self.abort.clone()
    }

    /// Perform one framed exchange: write the request, then poll for the
    /// first valid response frame.
    ///
    /// Holds the exclusive device lock for the whole cycle; the lock is
    /// released on every exit path. `abort` is cleared on entry and checked
    /// between reads; the typed operations pass the handle's own signal, but
    /// callers driving `execute` directly may scope a signal per exchange.
    /// Reports that fail to decode are treated as noise and skipped, since
    /// HID queues may intermix partial or stale reports. The first
    /// checksummed frame is returned regardless of its opcode; the typed
    /// operations check it against the request.
    pub fn execute(
        &self,
        opcode: Opcode,
        payload: &[u8],
        timeout: Duration,
        abort: &AbortSignal,
    ) -> Result<Frame, T::Error> {
        let mut link = self.link.lock().unwrap_or_else(|err| err.into_inner());
        let device = link.as_mut().ok_or(Error::NotConnected)?;

        abort.clear();

        let request = frame::encode(opcode, payload).ok_or(Error::PayloadTooLarge)?;
        trace!("sending frame: {:02x?}", request.as_slice());
        let written = device.write_report(&request).map_err(Error::Transport)?;
        if written < request.len() {
            return Err(Error::ShortWrite);
        }

        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; REPORT_LEN];
        loop {
            if abort.is_set() {
                debug!("exchange for opcode {:#04x} aborted", u8::from(opcode));
                return Err(Error::Aborted);
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            let n = device
                .read_report(&mut buf, self.timing.poll_interval)
                .map_err(Error::Transport)?;
            if n == 0 {
                continue;
            }
            trace!("received report: {:02x?}", &buf[..n]);
            match frame::decode(&buf[..n]) {
                Some(response) => return Ok(response),
                None => debug!("discarding undecodable report ({n} bytes)"),
            }
        }
    }

    /// One empty-payload exchange whose response must echo the opcode and
    /// carry a payload of exactly `expected_len` bytes.
    fn fetch(&self, opcode: Opcode, expected_len: usize) -> Result<Frame, T::Error> {
        let response = self.execute(opcode, &[], self.timing.exchange_timeout, &self.abort)?;
        if response.opcode != u8::from(opcode) || response.payload.len() != expected_len {
            return Err(Error::UnexpectedResponse {
                expected: opcode.into(),
            });
        }
        Ok(response)
    }

    /// Read one telemetry snapshot.
    pub fn get_basic_info(&self) -> Result<BasicInfo, T::Error> {
        let response = self.fetch(Opcode::BasicInfo, BASIC_INFO_LEN)?;
        BasicInfo::from_payload(&response.payload).ok_or(Error::UnexpectedResponse {
            expected: Opcode::BasicInfo.into(),
        })
    }

    /// Read the device identity record.
    pub fn get_device_info(&self) -> Result<DeviceInfo, T::Error> {
        let response = self.fetch(Opcode::DeviceInfo, DEVICE_INFO_LEN)?;
        DeviceInfo::from_payload(&response.payload).ok_or(Error::UnexpectedResponse {
            expected: Opcode::DeviceInfo.into(),
        })
    }

    /// Read the full system settings record.
    pub fn get_system_settings(&self) -> Result<SystemSettings, T::Error> {
        let response = self.fetch(Opcode::SystemInfo, SETTINGS_LEN)?;
        SystemSettings::from_payload(&response.payload).ok_or(Error::UnexpectedResponse {
            expected: Opcode::SystemInfo.into(),
        })
    }

    /// Set the output voltage and current limit with default protections and
    /// [`SET_ATTEMPTS`] verified attempts.
    pub fn set_output(&self, vset_mv: u16, iset_ma: u16) -> Result<(), T::Error> {
        self.apply_output(OutputRequest::new(vset_mv, iset_ma), SET_ATTEMPTS)
    }

    /// Apply an output setpoint, verifying against telemetry and retrying.
    ///
    /// The device may acknowledge a setpoint frame yet never converge to the
    /// requested operating point (protection limits can clamp it), so an ack
    /// alone proves nothing. Each attempt dispatches the setpoint, accepts
    /// either a one-byte success ack or a full readback, waits the settle
    /// delay, re-reads telemetry and compares output voltage and current
    /// against the request within 0.1 V / 0.1 A. Exchange failures count as
    /// failed attempts; exhausting `max_attempts` returns
    /// [`Error::VerificationFailed`]. A watchdog abort cuts the whole retry
    /// sequence short.
    pub fn apply_output(&self, request: OutputRequest, max_attempts: u32) -> Result<(), T::Error> {
        let payload = request.to_payload(MODIFY_ACTIVE);
        for attempt in 1..=max_attempts {
            match self.execute(
                Opcode::BasicSet,
                &payload,
                self.timing.exchange_timeout,
                &self.abort,
            ) {
                Ok(response) if setpoint_accepted(&response) => {}
                Ok(response) => {
                    warn!(
                        "attempt {attempt}: unexpected basic-set response ({} bytes)",
                        response.payload.len()
                    );
                    continue;
                }
                Err(Error::Aborted) => return Err(Error::Aborted),
                Err(err) => {
                    warn!("attempt {attempt}: basic-set exchange failed: {err}");
                    continue;
                }
            }

            thread::sleep(self.timing.settle_delay);

            let info = match self.get_basic_info() {
                Ok(info) => info,
                Err(Error::Aborted) => return Err(Error::Aborted),
                Err(err) => {
                    warn!("attempt {attempt}: verification read failed: {err}");
                    continue;
                }
            };
            if converged(&request, &info) {
                return Ok(());
            }
            debug!(
                "attempt {attempt}: output at {} mV / {} mA, requested {} mV / {} mA",
                info.vout_mv, info.iout_ma, request.vset_mv, request.iset_ma
            );
        }
        Err(Error::VerificationFailed)
    }

    /// Apply a partial settings change.
    ///
    /// The wire format has no sparse update, so this always reads the current
    /// record, merges the given fields over it and writes the whole record
    /// back. Requires a one-byte success ack.
    pub fn update_settings(&self, update: SettingsUpdate) -> Result<(), T::Error> {
        let current = self.get_system_settings()?;
        let merged = current.merged(&update);
        let response = self.execute(
            Opcode::SystemInfo,
            &merged.to_payload(),
            self.timing.exchange_timeout,
            &self.abort,
        )?;
        if is_ack(&response, Opcode::SystemInfo) {
            Ok(())
        } else {
            Err(Error::UnexpectedResponse {
                expected: Opcode::SystemInfo.into(),
            })
        }
    }

    /// Read back a stored preset group (0-9).
    pub fn get_preset(&self, group: u8) -> Result<OutputRequest, T::Error> {
        assert!(group < PRESET_GROUPS);
        let response = self.execute(
            Opcode::BasicSet,
            &[group],
            self.timing.exchange_timeout,
            &self.abort,
        )?;
        if response.opcode != u8::from(Opcode::BasicSet)
            || response.payload.len() != OUTPUT_SET_LEN
        {
            return Err(Error::UnexpectedResponse {
                expected: Opcode::BasicSet.into(),
            });
        }
        OutputRequest::from_payload(&response.payload)
            .map(|(_, preset)| preset)
            .ok_or(Error::UnexpectedResponse {
                expected: Opcode::BasicSet.into(),
            })
    }

    /// Store a setpoint into a preset group (0-9).
    ///
    /// Writing a group does not activate it, so there is no telemetry to
    /// verify against; only the ack is required.
    pub fn set_preset(&self, group: u8, request: OutputRequest) -> Result<(), T::Error> {
        assert!(group < PRESET_GROUPS);
        let response = self.execute(
            Opcode::BasicSet,
            &request.to_payload(group),
            self.timing.exchange_timeout,
            &self.abort,
        )?;
        if is_ack(&response, Opcode::BasicSet) {
            Ok(())
        } else {
            Err(Error::UnexpectedResponse {
                expected: Opcode::BasicSet.into(),
            })
        }
    }
}

fn is_ack(response: &Frame, opcode: Opcode) -> bool {
    response.opcode == u8::from(opcode) && matches!(response.payload.as_slice(), [ACK_OK])
}

fn setpoint_accepted(response: &Frame) -> bool {
    is_ack(response, Opcode::BasicSet)
        || (response.opcode == u8::from(Opcode::BasicSet)
            && response.payload.len() == OUTPUT_SET_LEN)
}

fn converged(request: &OutputRequest, info: &BasicInfo) -> bool {
    info.vout_mv.abs_diff(request.vset_mv as u32) <= TOLERANCE_MV
        && info.iout_ma.abs_diff(request.iset_ma as u32) <= TOLERANCE_MA
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_hid::{MockHid, device_frame};

    fn fast_timing() -> Timing {
        Timing {
            exchange_timeout: Duration::from_millis(50),
            poll_interval: Duration::from_millis(5),
            settle_delay: Duration::from_millis(1),
        }
    }

    fn psu_with(timing: Timing) -> (Dp100<MockHid>, MockHid) {
        let mock = MockHid::new();
        let psu = Dp100::with_timing(timing);
        psu.connect(mock.clone());
        (psu, mock)
    }

    fn telemetry_payload(vout_mv: u16, iout_ma: u16) -> Vec<u8> {
        let mut payload = Vec::new();
        for w in [2405, vout_mv, iout_ma, 500, 255, 300, 5002, 0x0001] {
            payload.extend_from_slice(&w.to_le_bytes());
        }
        payload
    }

    #[test]
    fn basic_info_exchange() {
        let (psu, mock) = psu_with(fast_timing());
        mock.push_frame(0x30, &telemetry_payload(5000, 1000));

        let info = psu.get_basic_info().unwrap();
        assert_eq!(info.vout_mv, 5000);
        assert_eq!(info.iout_ma, 1000);
        assert_eq!(info.vin_mv, 24050);
        assert!(info.status.output_on());

        // The request on the wire is the bare basic-info header frame.
        let written = mock.written();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0], [0xFB, 0x30, 0x00, 0x00, 0x31, 0x0F]);
    }

    #[test]
    fn not_connected() {
        let psu: Dp100<MockHid> = Dp100::with_timing(fast_timing());
        assert!(matches!(psu.get_basic_info(), Err(Error::NotConnected)));
    }

    #[test]
    fn connect_disconnect_lifecycle() {
        let (psu, _mock) = psu_with(fast_timing());
        assert!(psu.is_connected());

        // Connecting again is a no-op.
        psu.connect(MockHid::new());
        assert!(psu.is_connected());

        psu.disconnect();
        assert!(!psu.is_connected());
        psu.disconnect();
        assert!(matches!(psu.get_basic_info(), Err(Error::NotConnected)));
    }

    #[test]
    fn noise_reports_are_skipped() {
        let (psu, mock) = psu_with(fast_timing());
        // A corrupt report, a short fragment, then the real frame.
        let mut corrupt = device_frame(0x30, &telemetry_payload(5000, 1000));
        corrupt[10] ^= 0xFF;
        mock.push_response(&corrupt);
        mock.push_response(&[0xFA, 0x30]);
        mock.push_frame(0x30, &telemetry_payload(5000, 1000));

        assert!(psu.get_basic_info().is_ok());
    }

    #[test]
    fn wrong_opcode_is_protocol_mismatch() {
        let (psu, mock) = psu_with(fast_timing());
        mock.push_frame(0x35, &[1]);
        assert!(matches!(
            psu.get_basic_info(),
            Err(Error::UnexpectedResponse { expected: 0x30 })
        ));
    }

    #[test]
    fn wrong_payload_size_is_protocol_mismatch() {
        let (psu, mock) = psu_with(fast_timing());
        mock.push_frame(0x30, &[0u8; 12]);
        assert!(matches!(
            psu.get_basic_info(),
            Err(Error::UnexpectedResponse { expected: 0x30 })
        ));
    }

    #[test]
    fn silent_device_times_out() {
        let (psu, _mock) = psu_with(fast_timing());
        let start = Instant::now();
        assert!(matches!(psu.get_basic_info(), Err(Error::Timeout)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn write_failure_is_transport_error() {
        let (psu, mock) = psu_with(fast_timing());
        mock.set_write_error(true);
        assert!(matches!(psu.get_basic_info(), Err(Error::Transport(_))));
    }

    #[test]
    fn short_write_fails_exchange() {
        let (psu, mock) = psu_with(fast_timing());
        mock.set_short_write(true);
        assert!(matches!(psu.get_basic_info(), Err(Error::ShortWrite)));
    }

    #[test]
    fn oversized_payload_rejected_before_write() {
        let (psu, mock) = psu_with(fast_timing());
        let result = psu.execute(
            Opcode::BasicSet,
            &[0u8; 59],
            Duration::from_millis(10),
            &psu.abort_signal(),
        );
        assert!(matches!(result, Err(Error::PayloadTooLarge)));
        assert!(mock.written().is_empty());
    }

    #[test]
    fn set_output_converges_first_attempt() {
        let (psu, mock) = psu_with(fast_timing());
        mock.push_frame(0x35, &[1]);
        // Readback 40 mV / 30 mA off target, inside the 100/100 tolerance.
        mock.push_frame(0x30, &telemetry_payload(5040, 970));

        psu.set_output(5000, 1000).unwrap();
        assert_eq!(mock.written_count(0x35), 1);

        // The setpoint frame carries the modify-active record.
        let request = mock.written()[0].clone();
        let decoded = frame::decode(&request).unwrap();
        assert_eq!(
            decoded.payload.as_slice(),
            [0x20, 0x01, 0x88, 0x13, 0xE8, 0x03, 0xFF, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn set_output_accepts_full_readback_ack() {
        let (psu, mock) = psu_with(fast_timing());
        let readback = OutputRequest::new(5000, 1000).to_payload(MODIFY_ACTIVE);
        mock.push_frame(0x35, &readback);
        mock.push_frame(0x30, &telemetry_payload(5000, 1000));

        psu.set_output(5000, 1000).unwrap();
    }

    #[test]
    fn set_output_exhausts_attempts_when_not_converging() {
        let (psu, mock) = psu_with(fast_timing());
        // Device acks every attempt but telemetry stays clamped far below
        // the request (e.g. a protection limit kicked in).
        for _ in 0..3 {
            mock.push_frame(0x35, &[1]);
            mock.push_frame(0x30, &telemetry_payload(3300, 200));
        }

        let result = psu.set_output(5000, 1000);
        assert!(matches!(result, Err(Error::VerificationFailed)));
        assert_eq!(mock.written_count(0x35), 3);
        assert_eq!(mock.written_count(0x30), 3);
    }

    #[test]
    fn set_output_retries_after_nak() {
        let (psu, mock) = psu_with(fast_timing());
        // First attempt rejected, second acked and converged.
        mock.push_frame(0x35, &[0]);
        mock.push_frame(0x35, &[1]);
        mock.push_frame(0x30, &telemetry_payload(5000, 1000));

        psu.set_output(5000, 1000).unwrap();
        assert_eq!(mock.written_count(0x35), 2);
    }

    #[test]
    fn update_settings_merges_over_current_record() {
        let (psu, mock) = psu_with(fast_timing());
        let current = SystemSettings {
            backlight: 4,
            volume: 2,
            opp_dw: 1050,
            otp_degc: 70,
            reverse_protect: true,
            auto_output: false,
        };
        mock.push_frame(0x40, &current.to_payload());
        mock.push_frame(0x40, &[1]);

        psu.update_settings(SettingsUpdate {
            backlight: Some(2),
            ..Default::default()
        })
        .unwrap();

        // Second written frame must carry the full merged record with only
        // the backlight changed.
        let written = mock.written();
        assert_eq!(written.len(), 2);
        let sent = frame::decode(&written[1]).unwrap();
        let sent = SystemSettings::from_payload(&sent.payload).unwrap();
        assert_eq!(
            sent,
            SystemSettings {
                backlight: 2,
                ..current
            }
        );
    }

    #[test]
    fn update_settings_requires_success_ack() {
        let (psu, mock) = psu_with(fast_timing());
        let current = SystemSettings {
            backlight: 4,
            volume: 2,
            opp_dw: 1050,
            otp_degc: 70,
            reverse_protect: true,
            auto_output: false,
        };
        mock.push_frame(0x40, &current.to_payload());
        mock.push_frame(0x40, &[0]);

        assert!(matches!(
            psu.update_settings(SettingsUpdate::default()),
            Err(Error::UnexpectedResponse { expected: 0x40 })
        ));
    }

    #[test]
    fn preset_read_and_write() {
        let (psu, mock) = psu_with(fast_timing());
        let stored = OutputRequest {
            enable: false,
            vset_mv: 12000,
            iset_ma: 2500,
            ovp_mv: 12500,
            ocp_ma: 3000,
        };
        mock.push_frame(0x35, &stored.to_payload(3));
        mock.push_frame(0x35, &[1]);

        assert_eq!(psu.get_preset(3).unwrap(), stored);
        psu.set_preset(3, stored).unwrap();

        let written = mock.written();
        let read_request = frame::decode(&written[0]).unwrap();
        assert_eq!(read_request.payload.as_slice(), [3]);
        let write_request = frame::decode(&written[1]).unwrap();
        assert_eq!(write_request.payload.as_slice(), stored.to_payload(3));
    }

    #[test]
    fn abort_unblocks_stuck_exchange_and_releases_lock() {
        let timing = Timing {
            exchange_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(10),
            settle_delay: Duration::from_millis(1),
        };
        let mock = MockHid::new();
        let psu = Arc::new(Dp100::with_timing(timing));
        psu.connect(mock.clone());

        // The device never responds; without the abort this exchange would
        // block for the full ten seconds.
        let worker = {
            let psu = Arc::clone(&psu);
            thread::spawn(move || psu.get_basic_info())
        };
        thread::sleep(Duration::from_millis(50));

        let aborted_at = Instant::now();
        psu.abort();
        let result = worker.join().unwrap();
        assert!(matches!(result, Err(Error::Aborted)));
        // Observed within roughly one poll interval, not at the deadline.
        assert!(aborted_at.elapsed() < Duration::from_millis(500));

        // The aborted exchange must not leave the lock held.
        mock.push_frame(0x30, &telemetry_payload(5000, 1000));
        assert!(psu.get_basic_info().is_ok());
    }

    #[test]
    fn watchdog_signal_clone_shares_the_flag() {
        let (psu, mock) = psu_with(fast_timing());
        let signal = psu.abort_signal();
        signal.set();
        assert!(psu.abort_signal().is_set());

        // A new exchange clears the stale flag rather than failing on it.
        mock.push_frame(0x30, &telemetry_payload(5000, 1000));
        assert!(psu.get_basic_info().is_ok());
        assert!(!signal.is_set());
    }
}
