//! # xreal-light - host driver for XREAL Light AR glasses
//!
//! Talks to the glasses over their four USB endpoints: the MCU control
//! channel (ASCII packets over HID), the OV580 controller (binary commands,
//! calibration file, IMU stream over a second HID interface), and the two
//! UVC camera interfaces (stereo SLAM frames over bulk, RGB open-only).
//!
//! ## Quick start
//! ```no_run
//! use xreal_light::XrealLight;
//!
//! let mut glasses = XrealLight::new(None, None);
//! glasses.connect().unwrap();
//! println!("serial: {}", glasses.get_serial().unwrap());
//! println!("firmware: {}", glasses.get_firmware_version().unwrap());
//!
//! glasses.set_imu_handler(|sample| {
//!     println!("gyro: {:?} at {} ms", sample.gyroscope, sample.time_since_boot_ms);
//! });
//! ```

pub mod camera;
pub mod command;
pub mod crc;
pub mod device;
pub mod error;
pub mod hid;
pub mod mcu;
pub mod ov580;
pub mod packet;
pub mod types;

pub use command::{Command, Instruction, DEVICE_NAME, SUPPORTED_FIRMWARE};
pub use device::{list_devices, XrealLight};
pub use error::LightError;
pub use types::*;

/// Result type alias for driver operations.
pub type Result<T> = std::result::Result<T, LightError>;
