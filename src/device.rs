use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use hidapi::HidApi;

use crate::camera::CameraChannel;
use crate::command::{DEVICE_NAME, Instruction};
use crate::error::ChannelFailures;
use crate::hid::{self, HidDeviceInfo};
use crate::mcu::{McuChannel, MCU_PID, MCU_VID, RETRY_MAX_ATTEMPTS};
use crate::ov580::Ov580Channel;
use crate::types::{
    DisplayMode, EventHandlers, ImagePlane, ImageSink, ImuEvent, KeyEvent, MagnetometerVector,
    ProximityEvent,
};
use crate::{LightError, Result};

/// List all connected XREAL Light glasses (by their MCU interface),
/// deduplicated by OS path.
pub fn list_devices() -> Result<Vec<HidDeviceInfo>> {
    let api = HidApi::new()?;
    Ok(hid::enumerate(&api, MCU_VID, MCU_PID))
}

/// One pair of XREAL Light glasses.
///
/// Composes the three device channels behind one handle: the MCU control
/// channel, the OV580 IMU/calibration channel, and the stereo/RGB camera
/// channel. All three share one connect/disconnect lifecycle.
pub struct XrealLight {
    handlers: Arc<RwLock<EventHandlers>>,
    mcu: McuChannel,
    ov580: Ov580Channel,
    camera: CameraChannel,
}

impl XrealLight {
    /// Create an unconnected handle. `device_path` and `serial_number`
    /// disambiguate the MCU interface when several glasses are plugged in;
    /// the OV580 and the cameras are matched by VID/PID.
    pub fn new(device_path: Option<String>, serial_number: Option<String>) -> XrealLight {
        let handlers: Arc<RwLock<EventHandlers>> = Arc::default();
        XrealLight {
            mcu: McuChannel::new(device_path, serial_number, Arc::clone(&handlers)),
            ov580: Ov580Channel::new(None, None, Arc::clone(&handlers)),
            camera: CameraChannel::new(),
            handlers,
        }
    }

    pub fn name(&self) -> &'static str {
        DEVICE_NAME
    }

    pub fn vid(&self) -> u16 {
        MCU_VID
    }

    pub fn pid(&self) -> u16 {
        MCU_PID
    }

    /// Open and initialize all three channels in parallel. If any channel
    /// fails the others are torn down best-effort and the error names the
    /// failed channels.
    pub fn connect(&mut self) -> Result<()> {
        let XrealLight {
            mcu,
            ov580,
            camera,
            ..
        } = self;

        let (mcu_result, ov580_result, camera_result) = std::thread::scope(|scope| {
            let mcu = scope.spawn(|| mcu.connect());
            let ov580 = scope.spawn(|| ov580.connect());
            let camera = scope.spawn(|| camera.connect());
            (join(mcu), join(ov580), join(camera))
        });

        let failures = collect_failures(mcu_result, ov580_result, camera_result);
        if !failures.is_empty() {
            if let Err(err) = self.disconnect() {
                log::debug!("teardown after failed connect: {err}");
            }
        }
        ChannelFailures {
            context: "connect",
            failures,
        }
        .into_result()
    }

    /// Close all three channels in parallel. Idempotent.
    pub fn disconnect(&mut self) -> Result<()> {
        let XrealLight {
            mcu,
            ov580,
            camera,
            ..
        } = self;

        let (mcu_result, ov580_result, camera_result) = std::thread::scope(|scope| {
            let mcu = scope.spawn(|| mcu.disconnect());
            let ov580 = scope.spawn(|| ov580.disconnect());
            let camera = scope.spawn(|| camera.disconnect());
            (join(mcu), join(ov580), join(camera))
        });

        ChannelFailures {
            context: "disconnect",
            failures: collect_failures(mcu_result, ov580_result, camera_result),
        }
        .into_result()
    }

    pub fn get_serial(&self) -> Result<String> {
        self.mcu.get_serial()
    }

    /// Firmware version captured during initialization; performs no I/O.
    pub fn get_firmware_version(&self) -> Result<String> {
        self.mcu.firmware_version()
    }

    pub fn get_display_mode(&self) -> Result<DisplayMode> {
        self.mcu.get_display_mode()
    }

    pub fn set_display_mode(&self, mode: DisplayMode) -> Result<()> {
        self.mcu.set_display_mode(mode)
    }

    pub fn get_brightness_level(&self) -> Result<String> {
        self.mcu.get_brightness_level()
    }

    pub fn set_brightness_level(&self, level: &str) -> Result<()> {
        self.mcu.set_brightness_level(level)
    }

    pub fn get_display_hdcp(&self) -> Result<String> {
        self.mcu.get_display_hdcp()
    }

    pub fn get_display_firmware(&self) -> Result<String> {
        self.mcu.get_display_firmware()
    }

    pub fn get_stock_firmware_version(&self) -> Result<String> {
        self.mcu.get_stock_firmware_version()
    }

    pub fn get_glass_activated(&self) -> Result<String> {
        self.mcu.get_glass_activated()
    }

    pub fn get_glass_activation_time(&self) -> Result<String> {
        self.mcu.get_glass_activation_time()
    }

    pub fn set_sdk_works(&self, enabled: bool) -> Result<()> {
        self.mcu.set_sdk_works(enabled)
    }

    /// Toggle an event-reporting stream ("0" off, "1" on). The IMU stream
    /// lives on the OV580; every other stream lives on the MCU.
    pub fn enable_event_reporting(&self, instruction: Instruction, enabled: &str) -> Result<()> {
        match instruction {
            Instruction::Ov580EnableImuStream => {
                self.ov580.enable_event_reporting(instruction, enabled)
            }
            _ => self.mcu.enable_event_reporting(instruction, enabled),
        }
    }

    /// Pull one stereo frame (up to 3 attempts) and hand both planes to the
    /// caller's image sink. Returns the paths the sink wrote.
    pub fn get_images(&self, folder: &Path, sink: &dyn ImageSink) -> Result<Vec<PathBuf>> {
        let mut last_err = LightError::Timeout;
        for _ in 0..RETRY_MAX_ATTEMPTS {
            match self.camera.get_slam_frame() {
                Ok(frame) => {
                    let left = ImagePlane {
                        width: crate::camera::FRAME_WIDTH as u32,
                        height: crate::camera::FRAME_HEIGHT as u32,
                        pixels: frame.left,
                    };
                    let right = ImagePlane {
                        width: crate::camera::FRAME_WIDTH as u32,
                        height: crate::camera::FRAME_HEIGHT as u32,
                        pixels: frame.right,
                    };
                    return sink.sink_stereo(folder, &left, &right);
                }
                Err(err) => {
                    log::debug!("frame pull failed, retrying: {err}");
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    /// Send a raw MCU command; development helper.
    pub fn execute_raw(&self, ty: u8, id: u8, payload: &[u8]) -> Result<Vec<u8>> {
        self.mcu.execute_raw(ty, id, payload)
    }

    pub fn set_ambient_light_handler(&self, handler: impl Fn(u16) + Send + Sync + 'static) {
        self.with_handlers(|h| h.ambient_light = Some(Box::new(handler)));
    }

    pub fn set_key_handler(&self, handler: impl Fn(KeyEvent) + Send + Sync + 'static) {
        self.with_handlers(|h| h.key = Some(Box::new(handler)));
    }

    pub fn set_magnetometer_handler(
        &self,
        handler: impl Fn(MagnetometerVector) + Send + Sync + 'static,
    ) {
        self.with_handlers(|h| h.magnetometer = Some(Box::new(handler)));
    }

    pub fn set_proximity_handler(&self, handler: impl Fn(ProximityEvent) + Send + Sync + 'static) {
        self.with_handlers(|h| h.proximity = Some(Box::new(handler)));
    }

    pub fn set_temperature_handler(&self, handler: impl Fn(&str) + Send + Sync + 'static) {
        self.with_handlers(|h| h.temperature = Some(Box::new(handler)));
    }

    pub fn set_vsync_handler(&self, handler: impl Fn(&str) + Send + Sync + 'static) {
        self.with_handlers(|h| h.vsync = Some(Box::new(handler)));
    }

    pub fn set_imu_handler(&self, handler: impl Fn(ImuEvent) + Send + Sync + 'static) {
        self.with_handlers(|h| h.imu = Some(Box::new(handler)));
    }

    fn with_handlers(&self, update: impl FnOnce(&mut EventHandlers)) {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        update(&mut handlers);
    }
}

fn join(handle: std::thread::ScopedJoinHandle<'_, Result<()>>) -> Result<()> {
    handle
        .join()
        .unwrap_or_else(|_| Err(LightError::Open("channel task panicked".into())))
}

fn collect_failures(
    mcu: Result<()>,
    ov580: Result<()>,
    camera: Result<()>,
) -> Vec<(&'static str, LightError)> {
    let mut failures = Vec::new();
    if let Err(err) = mcu {
        failures.push(("mcu", err));
    }
    if let Err(err) = ov580 {
        failures.push(("ov580", err));
    }
    if let Err(err) = camera {
        failures.push(("camera", err));
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_the_mcu_interface() {
        let light = XrealLight::new(None, None);
        assert_eq!(light.name(), "XREAL Light");
        assert_eq!(light.vid(), 0x0486);
        assert_eq!(light.pid(), 0x573c);
    }

    #[test]
    fn operations_before_connect_fail_not_ready() {
        let light = XrealLight::new(None, None);
        assert!(matches!(light.get_serial(), Err(LightError::NotReady)));
        assert!(matches!(
            light.get_firmware_version(),
            Err(LightError::NotReady)
        ));
        assert!(matches!(
            light.set_display_mode(DisplayMode::Stereo),
            Err(LightError::NotReady)
        ));
        assert!(matches!(
            light.enable_event_reporting(Instruction::Ov580EnableImuStream, "1"),
            Err(LightError::NotReady)
        ));
    }

    #[test]
    fn disconnect_before_connect_is_idempotent() {
        let mut light = XrealLight::new(None, None);
        assert!(light.disconnect().is_ok());
        assert!(light.disconnect().is_ok());
    }

    #[test]
    fn handler_setters_replace_bundle_entries() {
        let light = XrealLight::new(None, None);
        light.set_key_handler(|_| {});
        light.set_imu_handler(|_| {});
        let handlers = light.handlers.read().unwrap();
        assert!(handlers.key.is_some());
        assert!(handlers.imu.is_some());
        assert!(handlers.proximity.is_none());
    }
}
