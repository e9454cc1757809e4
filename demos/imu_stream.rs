//! Stream calibrated IMU samples and magnetometer events to stdout.
//!
//! Usage: cargo run --release --example imu_stream

use std::time::Duration;

use xreal_light::{Instruction, XrealLight};

fn main() {
    env_logger::init();

    let mut glasses = XrealLight::new(None, None);
    if let Err(e) = glasses.connect() {
        eprintln!("Failed to connect: {}", e);
        std::process::exit(1);
    }

    glasses.set_imu_handler(|sample| {
        println!(
            "imu  accel=({:+.3}, {:+.3}, {:+.3})  gyro=({:+.3}, {:+.3}, {:+.3})  t={}ms",
            sample.accelerometer.x,
            sample.accelerometer.y,
            sample.accelerometer.z,
            sample.gyroscope.x,
            sample.gyroscope.y,
            sample.gyroscope.z,
            sample.time_since_boot_ms,
        );
    });
    glasses.set_magnetometer_handler(|reading| {
        println!("mag  (x,y,z)=({}, {}, {})", reading.x, reading.y, reading.z);
    });

    if let Err(e) = glasses.enable_event_reporting(Instruction::EnableMagnetometer, "1") {
        eprintln!("Could not enable magnetometer reporting: {}", e);
    }

    eprintln!("Streaming (Ctrl+C to stop)...");
    loop {
        std::thread::sleep(Duration::from_secs(1));
    }
}
