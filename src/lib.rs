//! Driver for the Alientek DP100 USB bench power supply.
//!
//! The DP100 speaks a simple request/response protocol over USB-HID: every
//! message is one 64-byte report carrying a CRC-16 checked frame. This crate
//! implements the framing, a serialized command dispatcher with cooperative
//! cancellation, and typed operations for telemetry, output control, preset
//! groups and system settings. Setpoint changes are verified against
//! telemetry and retried, because the device can acknowledge a setpoint it
//! never reaches.
//!
//! The protocol engine is generic over a [`transport::HidTransport`], so it
//! can be unit tested without hardware. The default `hidapi` feature provides
//! `hid::HidLink`, which opens the device by its USB vendor and product ID,
//! and a `Dp100::open` convenience constructor.
#![cfg_attr(feature = "hidapi", doc = r#"
```no_run
use alientek_dp100::psu::Dp100;

# fn main() -> Result<(), Box<dyn std::error::Error>> {
let psu = Dp100::open()?;
let info = psu.get_basic_info()?;
println!("{} mV / {} mA", info.vout_mv, info.iout_ma);
psu.set_output(5000, 1000)?;
# Ok(())
# }
```
"#)]

pub mod error;
pub mod frame;
pub mod payload;
pub mod psu;
pub mod transport;

#[cfg(feature = "hidapi")]
pub mod hid;

#[cfg(test)]
mod mock_hid;
