//! List all connected XREAL Light glasses.

fn main() {
    env_logger::init();

    match xreal_light::list_devices() {
        Ok(devices) => {
            println!("Found {} XREAL Light device(s):", devices.len());
            for (i, dev) in devices.iter().enumerate() {
                println!("  [{}] path={}  serial={}", i, dev.path, dev.serial_number);
            }
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}
