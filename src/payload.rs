//! Typed payload parsers and builders for each DP100 operation.
//!
//! These are pure functions over byte slices: parsing never panics, a
//! wrong-sized payload yields `None`, and a record is either fully populated
//! or not produced at all. All multi-byte fields are little-endian.

use modular_bitfield::prelude::*;

/// Basic-info response payload size: 8 little-endian words.
pub const BASIC_INFO_LEN: usize = 16;
/// Device-info response payload size.
pub const DEVICE_INFO_LEN: usize = 26;
/// System settings record size, identical for read and write.
pub const SETTINGS_LEN: usize = 8;
/// Basic-set request and readback record size.
pub const OUTPUT_SET_LEN: usize = 10;

/// Index byte directing a basic-set at the live output rather than a stored
/// preset group.
pub const MODIFY_ACTIVE: u8 = 0x20;
/// Number of stored preset groups on the device.
pub const PRESET_GROUPS: u8 = 10;
/// Raw limit value the device treats as "protection disabled".
pub const PROTECTION_DISABLED: u16 = 0xFFFF;

fn word(payload: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([payload[offset], payload[offset + 1]])
}

/// Work-state word from the basic-info response.
///
/// Bit 0 is output enable, bit 1 distinguishes constant-current from
/// constant-voltage regulation, bits 2-5 latch tripped protections.
#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusFlags {
    pub output_on: bool,
    pub constant_current: bool,
    pub ovp_tripped: bool,
    pub ocp_tripped: bool,
    pub opp_tripped: bool,
    pub otp_tripped: bool,
    #[skip]
    __: B10,
}

impl StatusFlags {
    /// True if any of the four protection latches is set.
    pub fn protection_tripped(&self) -> bool {
        self.ovp_tripped() || self.ocp_tripped() || self.opp_tripped() || self.otp_tripped()
    }
}

/// One live telemetry snapshot.
///
/// Scaling per field: the input voltage word is in centivolts and the power
/// word in centiwatts (both scaled up to milli-units here); output voltage,
/// output current and the 5V rail are already in milli-units on the wire;
/// temperatures are tenths of a degree Celsius. Power is the device-reported
/// field, not recomputed from voltage and current.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BasicInfo {
    /// Supply input voltage in millivolts.
    pub vin_mv: u32,
    /// Measured output voltage in millivolts.
    pub vout_mv: u32,
    /// Measured output current in milliamps.
    pub iout_ma: u32,
    /// Measured output power in milliwatts.
    pub power_mw: u32,
    /// First temperature sensor, tenths of a degree Celsius.
    pub temp1_ddegc: u16,
    /// Second temperature sensor, tenths of a degree Celsius.
    pub temp2_ddegc: u16,
    /// Auxiliary 5V rail voltage in millivolts.
    pub dc5v_mv: u32,
    /// Work-state and protection flags.
    pub status: StatusFlags,
}

impl BasicInfo {
    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        if payload.len() != BASIC_INFO_LEN {
            return None;
        }
        Some(Self {
            vin_mv: word(payload, 0) as u32 * 10,
            vout_mv: word(payload, 2) as u32,
            iout_ma: word(payload, 4) as u32,
            power_mw: word(payload, 6) as u32 * 10,
            temp1_ddegc: word(payload, 8),
            temp2_ddegc: word(payload, 10),
            dc5v_mv: word(payload, 12) as u32,
            status: StatusFlags::from_bytes([payload[14], payload[15]]),
        })
    }
}

/// Device identity record, immutable once read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Model name, NUL-padded ASCII on the wire.
    pub model: String,
    /// Hardware version in tenths. E.g. `144` -> `v14.4`.
    pub hardware_ver: u16,
    /// Application firmware version in tenths.
    pub application_ver: u16,
    /// Bootloader version in tenths.
    pub bootloader_ver: u16,
    /// Manufacture date.
    pub year: u16,
    pub month: u8,
    pub day: u8,
}

impl DeviceInfo {
    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        if payload.len() != DEVICE_INFO_LEN {
            return None;
        }
        let name = &payload[..16];
        let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());
        Some(Self {
            model: String::from_utf8_lossy(&name[..end]).into_owned(),
            hardware_ver: word(payload, 16),
            application_ver: word(payload, 18),
            bootloader_ver: word(payload, 20),
            year: word(payload, 22),
            month: payload[24],
            day: payload[25],
        })
    }
}

/// Persistent system settings record.
///
/// The wire format always carries the complete record, in both directions.
/// To change a subset of fields, merge a [`SettingsUpdate`] over a freshly
/// read record; writing a record built from scratch would silently reset the
/// untouched fields on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemSettings {
    /// Display backlight level, 0-4.
    pub backlight: u8,
    /// Key sound volume level, 0-4.
    pub volume: u8,
    /// Over-power protection limit in deciwatts. E.g. `1050` -> 105.0 W.
    pub opp_dw: u16,
    /// Over-temperature protection limit in degrees Celsius.
    pub otp_degc: u16,
    /// Reverse-polarity protection enabled.
    pub reverse_protect: bool,
    /// Enable the output automatically at power-on.
    pub auto_output: bool,
}

impl SystemSettings {
    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        if payload.len() != SETTINGS_LEN {
            return None;
        }
        Some(Self {
            backlight: payload[0],
            volume: payload[1],
            opp_dw: word(payload, 2),
            otp_degc: word(payload, 4),
            reverse_protect: payload[6] != 0,
            auto_output: payload[7] != 0,
        })
    }

    pub fn to_payload(&self) -> [u8; SETTINGS_LEN] {
        let opp = self.opp_dw.to_le_bytes();
        let otp = self.otp_degc.to_le_bytes();
        [
            self.backlight,
            self.volume,
            opp[0],
            opp[1],
            otp[0],
            otp[1],
            self.reverse_protect as u8,
            self.auto_output as u8,
        ]
    }

    /// Return a copy with every field present in `update` overridden and
    /// every absent field kept.
    pub fn merged(mut self, update: &SettingsUpdate) -> Self {
        if let Some(backlight) = update.backlight {
            self.backlight = backlight;
        }
        if let Some(volume) = update.volume {
            self.volume = volume;
        }
        if let Some(opp_dw) = update.opp_dw {
            self.opp_dw = opp_dw;
        }
        if let Some(otp_degc) = update.otp_degc {
            self.otp_degc = otp_degc;
        }
        if let Some(reverse_protect) = update.reverse_protect {
            self.reverse_protect = reverse_protect;
        }
        if let Some(auto_output) = update.auto_output {
            self.auto_output = auto_output;
        }
        self
    }
}

/// Partial settings change. `None` fields keep the device's current value.
#[derive(Debug, Clone, Copy, Default)]
pub struct SettingsUpdate {
    pub backlight: Option<u8>,
    pub volume: Option<u8>,
    pub opp_dw: Option<u16>,
    pub otp_degc: Option<u16>,
    pub reverse_protect: Option<bool>,
    pub auto_output: Option<bool>,
}

/// An output setpoint, used both to drive the live output and as a stored
/// preset group record. Constructed per apply attempt, never retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputRequest {
    pub enable: bool,
    /// Target voltage in millivolts.
    pub vset_mv: u16,
    /// Target current limit in milliamps.
    pub iset_ma: u16,
    /// Over-voltage protection limit in millivolts.
    pub ovp_mv: u16,
    /// Over-current protection limit in milliamps.
    pub ocp_ma: u16,
}

impl OutputRequest {
    /// A setpoint with the output enabled and both protections disabled.
    pub fn new(vset_mv: u16, iset_ma: u16) -> Self {
        Self {
            enable: true,
            vset_mv,
            iset_ma,
            ovp_mv: PROTECTION_DISABLED,
            ocp_ma: PROTECTION_DISABLED,
        }
    }

    /// Serialize for a basic-set request. `index` selects the target:
    /// [`MODIFY_ACTIVE`] for the live output, `0..PRESET_GROUPS` for a
    /// stored group.
    pub fn to_payload(&self, index: u8) -> [u8; OUTPUT_SET_LEN] {
        let vset = self.vset_mv.to_le_bytes();
        let iset = self.iset_ma.to_le_bytes();
        let ovp = self.ovp_mv.to_le_bytes();
        let ocp = self.ocp_ma.to_le_bytes();
        [
            index,
            self.enable as u8,
            vset[0],
            vset[1],
            iset[0],
            iset[1],
            ovp[0],
            ovp[1],
            ocp[0],
            ocp[1],
        ]
    }

    /// Parse a full readback record, returning the index byte alongside the
    /// setpoint.
    pub fn from_payload(payload: &[u8]) -> Option<(u8, Self)> {
        if payload.len() != OUTPUT_SET_LEN {
            return None;
        }
        Some((
            payload[0],
            Self {
                enable: payload[1] != 0,
                vset_mv: word(payload, 2),
                iset_ma: word(payload, 4),
                ovp_mv: word(payload, 6),
                ocp_ma: word(payload, 8),
            },
        ))
    }
}
