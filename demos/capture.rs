//! Pull one stereo SLAM frame and write both planes as PGM files.
//!
//! The core hands raw grayscale planes to an [`ImageSink`]; this demo's
//! sink writes binary PGM, which needs no image crate.
//!
//! Usage: cargo run --release --example capture [output-folder]

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use xreal_light::{ImagePlane, ImageSink, XrealLight};

struct PgmSink;

impl PgmSink {
    fn write_plane(
        &self,
        folder: &Path,
        name: &str,
        plane: &ImagePlane,
    ) -> xreal_light::Result<PathBuf> {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let path = folder.join(format!("{}_{}.pgm", stamp, name));
        let mut file = File::create(&path)
            .map_err(|e| xreal_light::LightError::Open(format!("{}: {}", path.display(), e)))?;
        write!(file, "P5\n{} {}\n255\n", plane.width, plane.height)
            .and_then(|_| file.write_all(&plane.pixels))
            .map_err(|e| xreal_light::LightError::Open(format!("{}: {}", path.display(), e)))?;
        Ok(path)
    }
}

impl ImageSink for PgmSink {
    fn sink_stereo(
        &self,
        folder: &Path,
        left: &ImagePlane,
        right: &ImagePlane,
    ) -> xreal_light::Result<Vec<PathBuf>> {
        Ok(vec![
            self.write_plane(folder, "left", left)?,
            self.write_plane(folder, "right", right)?,
        ])
    }
}

fn main() {
    env_logger::init();

    let folder = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    let mut glasses = XrealLight::new(None, None);
    if let Err(e) = glasses.connect() {
        eprintln!("Failed to connect: {}", e);
        std::process::exit(1);
    }

    match glasses.get_images(&folder, &PgmSink) {
        Ok(paths) => {
            for path in paths {
                println!("wrote {}", path.display());
            }
        }
        Err(e) => eprintln!("Failed to capture frame: {}", e),
    }

    if let Err(e) = glasses.disconnect() {
        eprintln!("Disconnect: {}", e);
    }
}
