use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Display mode of the glasses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayMode {
    /// Same picture for both eyes (plain 2D 1080p at 60 Hz).
    SameOnBoth,
    /// Half-SBS: presents 1920x1080 but renders 960x540 per eye at 120 Hz.
    HalfSbs,
    /// Full 1080p per eye at 60 Hz.
    Stereo,
    /// 1080p at 72 Hz.
    HighRefreshRate,
}

impl DisplayMode {
    /// Single-byte encoding used on the wire.
    pub fn wire_byte(self) -> u8 {
        match self {
            DisplayMode::SameOnBoth => b'1',
            DisplayMode::HalfSbs => b'2',
            DisplayMode::Stereo => b'3',
            DisplayMode::HighRefreshRate => b'4',
        }
    }

    /// Decode a mode from the first byte of a response. The device may
    /// append detail after the digit (e.g. `"3&3D_1080"`); only the first
    /// byte is significant.
    pub fn from_wire_byte(byte: u8) -> Option<DisplayMode> {
        match byte {
            b'1' => Some(DisplayMode::SameOnBoth),
            b'2' => Some(DisplayMode::HalfSbs),
            b'3' => Some(DisplayMode::Stereo),
            b'4' => Some(DisplayMode::HighRefreshRate),
            _ => None,
        }
    }
}

impl fmt::Display for DisplayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DisplayMode::SameOnBoth => "SAME_ON_BOTH",
            DisplayMode::HalfSbs => "HALF_SBS",
            DisplayMode::Stereo => "STEREO",
            DisplayMode::HighRefreshRate => "HIGH_REFRESH_RATE",
        };
        f.write_str(name)
    }
}

/// Press event from the brightness rocker on the temple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEvent {
    Unknown,
    UpPressed,
    DownPressed,
}

/// Proximity sensor event (wearing detection).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProximityEvent {
    Unknown,
    Near,
    Far,
}

/// Raw magnetometer reading reported by the MCU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MagnetometerVector {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    /// Sender-side timestamp carried by the packet, if it parsed.
    pub timestamp: Option<SystemTime>,
}

/// Calibrated linear acceleration in m/s².
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccelerometerVector {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// Calibrated angular rate in rad/s.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GyroscopeVector {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// One decoded IMU sample from the OV580 stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuEvent {
    pub accelerometer: AccelerometerVector,
    pub gyroscope: GyroscopeVector,
    /// Device uptime in milliseconds.
    pub time_since_boot_ms: u64,
}

pub type AmbientLightHandler = Box<dyn Fn(u16) + Send + Sync>;
pub type KeyHandler = Box<dyn Fn(KeyEvent) + Send + Sync>;
pub type MagnetometerHandler = Box<dyn Fn(MagnetometerVector) + Send + Sync>;
pub type ProximityHandler = Box<dyn Fn(ProximityEvent) + Send + Sync>;
pub type TemperatureHandler = Box<dyn Fn(&str) + Send + Sync>;
pub type VsyncHandler = Box<dyn Fn(&str) + Send + Sync>;
pub type ImuHandler = Box<dyn Fn(ImuEvent) + Send + Sync>;

/// Callback bundle for asynchronous device events.
///
/// Handlers run on the channels' background reader threads and must not
/// call back into blocking operations of the same channel.
#[derive(Default)]
pub struct EventHandlers {
    pub ambient_light: Option<AmbientLightHandler>,
    pub key: Option<KeyHandler>,
    pub magnetometer: Option<MagnetometerHandler>,
    pub proximity: Option<ProximityHandler>,
    pub temperature: Option<TemperatureHandler>,
    pub vsync: Option<VsyncHandler>,
    pub imu: Option<ImuHandler>,
}

impl fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandlers")
            .field("ambient_light", &self.ambient_light.is_some())
            .field("key", &self.key.is_some())
            .field("magnetometer", &self.magnetometer.is_some())
            .field("proximity", &self.proximity.is_some())
            .field("temperature", &self.temperature.is_some())
            .field("vsync", &self.vsync.is_some())
            .field("imu", &self.imu.is_some())
            .finish()
    }
}

/// One 8-bit grayscale plane, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePlane {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// One stereo frame pulled from the SLAM camera: two 640x480 grayscale
/// planes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlamFrame {
    pub left: Vec<u8>,
    pub right: Vec<u8>,
}

/// Caller-supplied encoder for [`SlamFrame`] planes. The core never touches
/// image formats; it hands the sink raw pixels and reports back whatever
/// paths the sink wrote.
pub trait ImageSink {
    fn sink_stereo(
        &self,
        folder: &Path,
        left: &ImagePlane,
        right: &ImagePlane,
    ) -> crate::Result<Vec<PathBuf>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_mode_wire_bytes() {
        let modes = [
            (DisplayMode::SameOnBoth, b'1'),
            (DisplayMode::HalfSbs, b'2'),
            (DisplayMode::Stereo, b'3'),
            (DisplayMode::HighRefreshRate, b'4'),
        ];
        for (mode, byte) in modes {
            assert_eq!(mode.wire_byte(), byte);
            assert_eq!(DisplayMode::from_wire_byte(byte), Some(mode));
        }
        assert_eq!(DisplayMode::from_wire_byte(b'5'), None);
    }

    #[test]
    fn display_mode_ignores_response_suffix() {
        // The device answers e.g. "3&3D_1080"; the first byte decides.
        let response = b"3&3D_1080";
        assert_eq!(
            DisplayMode::from_wire_byte(response[0]),
            Some(DisplayMode::Stereo)
        );
    }
}
