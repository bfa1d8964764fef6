use std::thread;
use std::time::Duration;

use alientek_dp100::payload::SettingsUpdate;
use alientek_dp100::psu::Dp100;

// Configuration constants - adjust these for your setup
const OUTPUT_VOLTAGE_MV: u16 = 5000; // 5V
const CURRENT_LIMIT_MA: u16 = 1000; // 1A
const TELEMETRY_SAMPLES: u32 = 10;
const SAMPLE_INTERVAL_MS: u64 = 500;

fn main() {
    // RUST_LOG=trace shows every frame on the wire
    env_logger::init();

    let psu = Dp100::open().expect("Failed to open DP100 (is it plugged in?)");

    // Identify the device
    let info = psu.get_device_info().unwrap();
    println!(
        "{} hw v{}.{} fw v{}.{} ({}-{:02}-{:02})",
        info.model,
        info.hardware_ver / 10,
        info.hardware_ver % 10,
        info.application_ver / 10,
        info.application_ver % 10,
        info.year,
        info.month,
        info.day
    );

    // Show the persistent settings
    let settings = psu.get_system_settings().unwrap();
    println!("{:#?}", settings);

    // Apply a setpoint; this retries until telemetry confirms the output
    psu.set_output(OUTPUT_VOLTAGE_MV, CURRENT_LIMIT_MA).unwrap();
    println!(
        "Output set to {}V / {}A",
        OUTPUT_VOLTAGE_MV as f32 / 1000.0,
        CURRENT_LIMIT_MA as f32 / 1000.0
    );

    // Poll telemetry for a few seconds
    for _ in 0..TELEMETRY_SAMPLES {
        let info = psu.get_basic_info().unwrap();
        println!(
            "vin {:.2}V  vout {:.3}V  iout {:.3}A  {:.3}W  {}{}",
            info.vin_mv as f32 / 1000.0,
            info.vout_mv as f32 / 1000.0,
            info.iout_ma as f32 / 1000.0,
            info.power_mw as f32 / 1000.0,
            if info.status.constant_current() {
                "CC"
            } else {
                "CV"
            },
            if info.status.protection_tripped() {
                " PROTECTION TRIPPED"
            } else {
                ""
            },
        );
        thread::sleep(Duration::from_millis(SAMPLE_INTERVAL_MS));
    }

    // Dim the backlight, leaving every other setting untouched
    psu.update_settings(SettingsUpdate {
        backlight: Some(1),
        ..Default::default()
    })
    .unwrap();
    println!("Backlight dimmed");
}
