//! Connect to the first pair of glasses and print its identity.

use xreal_light::{XrealLight, SUPPORTED_FIRMWARE};

fn main() {
    env_logger::init();

    let mut glasses = XrealLight::new(None, None);
    if let Err(e) = glasses.connect() {
        eprintln!("Failed to connect: {}", e);
        std::process::exit(1);
    }

    match glasses.get_firmware_version() {
        Ok(firmware) => {
            println!("Firmware:   {}", firmware);
            if !SUPPORTED_FIRMWARE.contains(&firmware.as_str()) {
                eprintln!(
                    "warning: firmware {} is not validated (validated: {:?})",
                    firmware, SUPPORTED_FIRMWARE
                );
            }
        }
        Err(e) => eprintln!("Firmware:   error: {}", e),
    }

    match glasses.get_serial() {
        Ok(serial) => println!("Serial:     {}", serial),
        Err(e) => eprintln!("Serial:     error: {}", e),
    }
    match glasses.get_display_mode() {
        Ok(mode) => println!("Display:    {}", mode),
        Err(e) => eprintln!("Display:    error: {}", e),
    }
    match glasses.get_brightness_level() {
        Ok(level) => println!("Brightness: {}", level),
        Err(e) => eprintln!("Brightness: error: {}", e),
    }

    if let Err(e) = glasses.disconnect() {
        eprintln!("Disconnect: {}", e);
    }
}
