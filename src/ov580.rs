use std::f32::consts::PI;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, select, tick, Receiver, RecvTimeoutError, Sender};
use hidapi::{HidApi, HidDevice};

use crate::command::{self, Command, Instruction};
use crate::hid;
use crate::mcu::{READ_TICK, READ_TIMEOUT, RESPONSE_TIMEOUT, RETRY_MAX_ATTEMPTS};
use crate::types::{AccelerometerVector, EventHandlers, GyroscopeVector, ImuEvent};
use crate::{LightError, Result};

/// XREAL Light OV580 (SLAM camera controller + IMU) HID interface.
pub const OV580_VID: u16 = 0x05a9;
pub const OV580_PID: u16 = 0x0680;

/// Inbound reports are fixed 128 bytes; commands are fixed 7-byte writes.
const REPORT_SIZE: usize = 128;
const COMMAND_SIZE: usize = 7;

/// IMU fields start at this offset of a `0x01` report.
const IMU_PAYLOAD_OFFSET: usize = 0x2a;

const REPORT_IMU: u8 = 0x01;
const REPORT_COMMAND_RESPONSE: u8 = 0x02;

/// Sub-discriminants of a command response.
const RESPONSE_CALIBRATION_LENGTH: u8 = 0x00;
const RESPONSE_CALIBRATION_PART: u8 = 0x01;
const RESPONSE_CALIBRATION_END: u8 = 0x03;
const RESPONSE_IMU_STREAM_ACK: u8 = 0x04;

/// IMU bias triples parsed from the calibration file.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Biases {
    accelerometer: AccelerometerVector,
    gyroscope: GyroscopeVector,
}

/// Channel to the OV580 controller: a short binary command protocol plus
/// the IMU sample stream.
///
/// Owns the HID handle and one 10 ms read-drain task. Initialization pulls
/// the calibration file off the device and installs the IMU biases before
/// any sample is decoded.
pub struct Ov580Channel {
    device_path: Option<String>,
    serial_number: Option<String>,
    handlers: Arc<RwLock<EventHandlers>>,
    active: Option<Active>,
}

struct Active {
    shared: Arc<Shared>,
    _api: HidApi,
    stop_reader: Sender<()>,
    reader: JoinHandle<()>,
}

struct Shared {
    device: Mutex<HidDevice>,
    initialized: AtomicBool,
    biases: RwLock<Option<Biases>>,
    handlers: Arc<RwLock<EventHandlers>>,
    response_tx: Sender<Vec<u8>>,
    response_rx: Receiver<Vec<u8>>,
}

impl Ov580Channel {
    pub fn new(
        device_path: Option<String>,
        serial_number: Option<String>,
        handlers: Arc<RwLock<EventHandlers>>,
    ) -> Ov580Channel {
        Ov580Channel {
            device_path,
            serial_number,
            handlers,
            active: None,
        }
    }

    /// Open the OV580 interface, start the read drain, read the calibration
    /// file, and re-enable the IMU stream.
    pub fn connect(&mut self) -> Result<()> {
        if self.active.is_some() {
            return Ok(());
        }

        let opened = hid::open_interface(
            OV580_VID,
            OV580_PID,
            self.device_path.as_deref(),
            self.serial_number.as_deref(),
        )?;
        if opened.path.is_some() {
            self.device_path = opened.path.clone();
        }
        if opened.serial_number.is_some() {
            self.serial_number = opened.serial_number.clone();
        }

        let (response_tx, response_rx) = bounded(1);
        let shared = Arc::new(Shared {
            device: Mutex::new(opened.device),
            initialized: AtomicBool::new(false),
            biases: RwLock::new(None),
            handlers: Arc::clone(&self.handlers),
            response_tx,
            response_rx,
        });

        let (stop_reader, reader_stop_rx) = bounded::<()>(0);
        let reader_shared = Arc::clone(&shared);
        let reader = std::thread::Builder::new()
            .name("xreal-ov580-reader".into())
            .spawn(move || reader_loop(reader_shared, reader_stop_rx))
            .map_err(|err| LightError::Open(format!("failed to spawn reader task: {err}")))?;

        self.active = Some(Active {
            shared: Arc::clone(&shared),
            _api: opened.api,
            stop_reader,
            reader,
        });

        // We must get the calibration file before decoding any sample.
        loop {
            match read_calibration(&shared) {
                Ok(biases) => {
                    log::debug!("IMU biases installed: {biases:?}");
                    *shared.biases.write().unwrap_or_else(PoisonError::into_inner) = Some(biases);
                    break;
                }
                Err(err) => {
                    log::warn!("failed to read calibration file, retrying: {err}");
                }
            }
        }

        shared.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Stop the read drain, join it, and close the HID handle. Idempotent.
    pub fn disconnect(&mut self) -> Result<()> {
        let Some(active) = self.active.take() else {
            return Ok(());
        };

        active.shared.initialized.store(false, Ordering::SeqCst);
        drop(active.stop_reader);
        let _ = active.reader.join();

        *active
            .shared
            .biases
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
        drop(active.shared);
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.active
            .as_ref()
            .map(|a| a.shared.initialized.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Toggle OV580-side event reporting ("0" off, "1" on). The only
    /// reporting stream the controller exposes is the IMU.
    pub fn enable_event_reporting(&self, instruction: Instruction, enabled: &str) -> Result<()> {
        let shared = match &self.active {
            Some(active) if active.shared.initialized.load(Ordering::SeqCst) => &active.shared,
            _ => return Err(LightError::NotReady),
        };
        let command = ov580_command(instruction)?;
        set_reporting(shared, command, enabled == "1")
    }
}

impl Drop for Ov580Channel {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}

/// OV580 instructions are firmware independent.
fn ov580_command(instruction: Instruction) -> Result<Command> {
    command::resolve(instruction, "")
}

/// Write one 7-byte command: `[type, id, value, 0, 0, 0, 0]`.
fn execute_only(shared: &Shared, command: Command, value: u8) -> Result<()> {
    let mut buffer = [0u8; COMMAND_SIZE];
    buffer[0] = command.ty;
    buffer[1] = command.id;
    buffer[2] = value;
    let device = shared
        .device
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    device.write(&buffer)?;
    Ok(())
}

/// Post a command and wait for any `0x02` report. Unlike the MCU there is
/// no request/response arithmetic; the next response is the answer.
fn execute_and_wait(shared: &Shared, command: Command, value: u8) -> Result<Vec<u8>> {
    execute_only(shared, command, value)?;
    for _ in 0..RETRY_MAX_ATTEMPTS {
        match shared.response_rx.recv_timeout(RESPONSE_TIMEOUT) {
            Ok(response) => return Ok(response),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return Err(LightError::NotReady),
        }
    }
    Err(LightError::Timeout)
}

fn set_reporting(shared: &Shared, command: Command, enabled: bool) -> Result<()> {
    let value = u8::from(enabled);
    let mut last_err = LightError::Timeout;
    for _ in 0..RETRY_MAX_ATTEMPTS {
        match execute_and_wait(shared, command, value) {
            Ok(response) => {
                let first = response.first().copied().unwrap_or(0);
                if first != REPORT_COMMAND_RESPONSE && first != RESPONSE_IMU_STREAM_ACK {
                    return Err(LightError::Format(format!(
                        "unexpected reporting ack: 0x{first:02x}"
                    )));
                }
                return Ok(());
            }
            Err(err) => last_err = err,
        }
    }
    Err(last_err)
}

/// Pull the calibration file: IMU stream off, read declared length, read
/// parts until the end marker, IMU stream back on, parse the biases.
fn read_calibration(shared: &Shared) -> Result<Biases> {
    // Quiet the IMU stream first so responses are not drowned out.
    set_reporting(shared, ov580_command(Instruction::Ov580EnableImuStream)?, false)?;

    let length_cmd = ov580_command(Instruction::Ov580GetCalibrationFileLength)?;
    let response = execute_and_wait(shared, length_cmd, 0x1)?;
    let declared = declared_length(&response)?;
    log::debug!("calibration file length: {declared}");

    let part_cmd = ov580_command(Instruction::Ov580GetCalibrationFilePart)?;
    let mut file = Vec::with_capacity(declared);
    loop {
        let response = execute_and_wait(shared, part_cmd, 0x1)?;
        match calibration_part(&response)? {
            CalibrationPart::End => break,
            CalibrationPart::Chunk(chunk) => file.extend_from_slice(chunk),
        }
    }
    if file.len() != declared {
        log::debug!(
            "calibration file length mismatch: declared {declared}, read {}",
            file.len()
        );
    }

    set_reporting(shared, ov580_command(Instruction::Ov580EnableImuStream)?, true)?;

    parse_calibration(&file)
}

/// Declared file length: little-endian u24 at bytes [3..6] of the length
/// response.
fn declared_length(response: &[u8]) -> Result<usize> {
    if response.len() < 6 {
        return Err(LightError::Format(
            "calibration length response too short".into(),
        ));
    }
    Ok(u32::from_le_bytes([response[3], response[4], response[5], 0]) as usize)
}

enum CalibrationPart<'a> {
    Chunk(&'a [u8]),
    End,
}

/// One part response: `resp[1]` 0x03 ends the read; otherwise `resp[2]`
/// bytes of payload start at `resp[3]`.
fn calibration_part(response: &[u8]) -> Result<CalibrationPart<'_>> {
    if response.len() < 3 {
        return Err(LightError::Format("calibration part too short".into()));
    }
    if response[1] == RESPONSE_CALIBRATION_END {
        return Ok(CalibrationPart::End);
    }
    let length = response[2] as usize;
    response
        .get(3..3 + length)
        .map(CalibrationPart::Chunk)
        .ok_or_else(|| {
            LightError::Format(format!(
                "calibration part declares {length} bytes, got {}",
                response.len().saturating_sub(3)
            ))
        })
}

/// Extract the bias triples from the assembled calibration file. The file
/// embeds an XML document followed by a JSON object; only the JSON matters
/// here, through the path `IMU.device_1.{accel_bias,gyro_bias}`.
fn parse_calibration(file: &[u8]) -> Result<Biases> {
    let content = String::from_utf8_lossy(file);
    if let (Some(start), Some(end)) = (content.find('<'), content.rfind('>')) {
        if start < end {
            log::debug!("calibration xml: {}", &content[start..=end]);
        }
    }

    let start = content
        .find('{')
        .ok_or_else(|| LightError::Format("calibration file carries no JSON".into()))?;
    let end = content
        .rfind('}')
        .ok_or_else(|| LightError::Format("calibration JSON is unterminated".into()))?;
    if end < start {
        return Err(LightError::Format("calibration JSON is unterminated".into()));
    }

    let json: serde_json::Value = serde_json::from_str(&content[start..=end])
        .map_err(|err| LightError::Format(format!("calibration JSON: {err}")))?;

    let device_1 = json
        .get("IMU")
        .and_then(|imu| imu.get("device_1"))
        .ok_or_else(|| LightError::Format("calibration JSON missing IMU.device_1".into()))?;

    Ok(Biases {
        accelerometer: bias_triple(device_1, "accel_bias").map(
            |[x, y, z]| AccelerometerVector { x, y, z },
        )?,
        gyroscope: bias_triple(device_1, "gyro_bias")
            .map(|[x, y, z]| GyroscopeVector { x, y, z })?,
    })
}

fn bias_triple(device: &serde_json::Value, key: &str) -> Result<[f32; 3]> {
    let numbers = device
        .get(key)
        .and_then(|v| v.as_array())
        .filter(|a| a.len() >= 3)
        .ok_or_else(|| LightError::Format(format!("calibration JSON missing {key}[3]")))?;
    let mut triple = [0f32; 3];
    for (slot, value) in triple.iter_mut().zip(numbers) {
        *slot = value
            .as_f64()
            .ok_or_else(|| LightError::Format(format!("{key} holds a non-number")))?
            as f32;
    }
    Ok(triple)
}

fn reader_loop(shared: Arc<Shared>, stop: Receiver<()>) {
    let ticker = tick(READ_TICK);
    loop {
        select! {
            recv(ticker) -> _ => {
                if let Err(err) = read_and_process(&shared) {
                    log::debug!("read batch: {err}");
                }
            }
            recv(stop) -> _ => return,
        }
    }
}

fn read_and_process(shared: &Shared) -> Result<()> {
    let mut buffer = [0u8; REPORT_SIZE];
    let read = {
        let device = shared
            .device
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        device.read_timeout(&mut buffer, READ_TIMEOUT.as_millis() as i32)?
    };
    if read == 0 {
        // Timed out: nothing pending this tick.
        return Ok(());
    }

    match buffer[0] {
        REPORT_IMU => {
            if !shared.initialized.load(Ordering::SeqCst) {
                return Ok(());
            }
            let biases = *shared
                .biases
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            let Some(biases) = biases else {
                return Ok(());
            };
            let event = decode_imu_report(&buffer, &biases)?;
            let handlers = shared
                .handlers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(handler) = &handlers.imu {
                handler(event);
            }
        }
        REPORT_COMMAND_RESPONSE => {
            match buffer[1] {
                RESPONSE_CALIBRATION_LENGTH
                | RESPONSE_CALIBRATION_PART
                | RESPONSE_CALIBRATION_END
                | RESPONSE_IMU_STREAM_ACK => {}
                other => log::debug!("unexpected response discriminant: 0x{other:02x}"),
            }
            if shared.response_tx.try_send(buffer.to_vec()).is_err() {
                log::debug!("response rendezvous full, dropping report");
            }
        }
        other => {
            log::debug!("got unhandled report discriminant: 0x{other:02x}");
        }
    }

    Ok(())
}

/// Decode one IMU report. Little-endian fields starting at offset 0x2a:
/// temperature u16, gyro timestamp ns u64, gyro multiplier/divisor u32,
/// gyro xyz i32, accel timestamp ns u64, accel multiplier/divisor u32,
/// accel xyz i32.
fn decode_imu_report(buffer: &[u8], biases: &Biases) -> Result<ImuEvent> {
    const FIELDS_LEN: usize = 2 + 8 + 4 + 4 + 12 + 8 + 4 + 4 + 12;
    let payload = buffer
        .get(IMU_PAYLOAD_OFFSET..IMU_PAYLOAD_OFFSET + FIELDS_LEN)
        .ok_or_else(|| LightError::Format("IMU report too short".into()))?;

    let temperature = u16_le(payload, 0);
    log::debug!("IMU temperature word: {temperature}");

    let gyro_timestamp_ns = u64_le(payload, 2);
    let gyro_mul = u32_le(payload, 10) as f32;
    let gyro_div = u32_le(payload, 14) as f32;
    let gx = i32_le(payload, 18) as f32;
    let gy = i32_le(payload, 22) as f32;
    let gz = i32_le(payload, 26) as f32;

    let deg_to_rad = PI / 180.0;
    let gyroscope = GyroscopeVector {
        x: (gx * gyro_mul / gyro_div) * deg_to_rad - biases.gyroscope.x,
        y: -(gy * gyro_mul / gyro_div) * deg_to_rad + biases.gyroscope.y,
        z: -(gz * gyro_mul / gyro_div) * deg_to_rad + biases.gyroscope.z,
    };

    let accel_timestamp_ns = u64_le(payload, 30);
    let accel_mul = u32_le(payload, 38) as f32;
    let accel_div = u32_le(payload, 42) as f32;
    let ax = i32_le(payload, 46) as f32;
    let ay = i32_le(payload, 50) as f32;
    let az = i32_le(payload, 54) as f32;

    const STANDARD_GRAVITY: f32 = 9.81;
    let accelerometer = AccelerometerVector {
        x: (ax * accel_mul / accel_div) * STANDARD_GRAVITY - biases.accelerometer.x,
        y: -(ay * accel_mul / accel_div) * STANDARD_GRAVITY + biases.accelerometer.y,
        z: -(az * accel_mul / accel_div) * STANDARD_GRAVITY + biases.accelerometer.z,
    };

    if gyro_timestamp_ns != accel_timestamp_ns {
        log::warn!(
            "gyro and accel carry different timestamps: {gyro_timestamp_ns} vs {accel_timestamp_ns} ns"
        );
    }

    Ok(ImuEvent {
        accelerometer,
        gyroscope,
        time_since_boot_ms: gyro_timestamp_ns / 1_000_000,
    })
}

fn u16_le(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn u32_le(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn i32_le(buf: &[u8], off: usize) -> i32 {
    i32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn u64_le(buf: &[u8], off: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zero_biases() -> Biases {
        Biases {
            accelerometer: AccelerometerVector {
                x: 0.0,
                y: 0.0,
                z: 0.0,
            },
            gyroscope: GyroscopeVector {
                x: 0.0,
                y: 0.0,
                z: 0.0,
            },
        }
    }

    /// Build a 0x01 report with the given raw IMU fields.
    #[allow(clippy::too_many_arguments)]
    fn imu_report(
        gyro_ts: u64,
        gyro_mul: u32,
        gyro_div: u32,
        gyro: [i32; 3],
        accel_ts: u64,
        accel_mul: u32,
        accel_div: u32,
        accel: [i32; 3],
    ) -> [u8; REPORT_SIZE] {
        let mut report = [0u8; REPORT_SIZE];
        report[0] = REPORT_IMU;
        let p = IMU_PAYLOAD_OFFSET;
        report[p..p + 2].copy_from_slice(&0u16.to_le_bytes());
        report[p + 2..p + 10].copy_from_slice(&gyro_ts.to_le_bytes());
        report[p + 10..p + 14].copy_from_slice(&gyro_mul.to_le_bytes());
        report[p + 14..p + 18].copy_from_slice(&gyro_div.to_le_bytes());
        for (i, v) in gyro.iter().enumerate() {
            report[p + 18 + 4 * i..p + 22 + 4 * i].copy_from_slice(&v.to_le_bytes());
        }
        report[p + 30..p + 38].copy_from_slice(&accel_ts.to_le_bytes());
        report[p + 38..p + 42].copy_from_slice(&accel_mul.to_le_bytes());
        report[p + 42..p + 46].copy_from_slice(&accel_div.to_le_bytes());
        for (i, v) in accel.iter().enumerate() {
            report[p + 46 + 4 * i..p + 50 + 4 * i].copy_from_slice(&v.to_le_bytes());
        }
        report
    }

    #[test]
    fn imu_decode_scales_and_negates() {
        let report = imu_report(
            2_000_000,
            10,
            1,
            [9, 9, 9],
            2_000_000,
            2,
            1,
            [1, 1, 1],
        );
        let event = decode_imu_report(&report, &zero_biases()).unwrap();

        // 9 * 10 = 90 deg/s -> pi/2 rad/s; y and z are negated.
        assert!((event.gyroscope.x - 1.570_796_3).abs() < 1e-6);
        assert!((event.gyroscope.y + 1.570_796_3).abs() < 1e-6);
        assert!((event.gyroscope.z + 1.570_796_3).abs() < 1e-6);

        // 1 * 2 g -> 19.62 m/s^2; y and z are negated.
        assert!((event.accelerometer.x - 19.62).abs() < 1e-4);
        assert!((event.accelerometer.y + 19.62).abs() < 1e-4);
        assert!((event.accelerometer.z + 19.62).abs() < 1e-4);

        assert_eq!(event.time_since_boot_ms, 2);
    }

    #[test]
    fn imu_decode_applies_biases() {
        let report = imu_report(1, 1, 1, [0, 0, 0], 1, 1, 1, [0, 0, 0]);
        let biases = Biases {
            accelerometer: AccelerometerVector {
                x: 0.5,
                y: 0.25,
                z: -0.25,
            },
            gyroscope: GyroscopeVector {
                x: 0.1,
                y: 0.2,
                z: 0.3,
            },
        };
        let event = decode_imu_report(&report, &biases).unwrap();
        assert!((event.gyroscope.x + 0.1).abs() < 1e-6);
        assert!((event.gyroscope.y - 0.2).abs() < 1e-6);
        assert!((event.gyroscope.z - 0.3).abs() < 1e-6);
        assert!((event.accelerometer.x + 0.5).abs() < 1e-6);
        assert!((event.accelerometer.y - 0.25).abs() < 1e-6);
        assert!((event.accelerometer.z + 0.25).abs() < 1e-6);
    }

    #[test]
    fn calibration_json_path_query() {
        let file = br#"<?xml version="1.0"?><calib><body/></calib>
        {"IMU":{"device_1":{"accel_bias":[0.1,0.2,0.3],"gyro_bias":[-0.01,0.02,-0.03]}}}tail"#;
        let biases = parse_calibration(file).unwrap();
        assert!((biases.accelerometer.x - 0.1).abs() < 1e-6);
        assert!((biases.accelerometer.y - 0.2).abs() < 1e-6);
        assert!((biases.accelerometer.z - 0.3).abs() < 1e-6);
        assert!((biases.gyroscope.x + 0.01).abs() < 1e-6);
        assert!((biases.gyroscope.y - 0.02).abs() < 1e-6);
        assert!((biases.gyroscope.z + 0.03).abs() < 1e-6);
    }

    #[test]
    fn calibration_shape_mismatch_is_format_error() {
        let missing_gyro = br#"{"IMU":{"device_1":{"accel_bias":[0.1,0.2,0.3]}}}"#;
        assert!(matches!(
            parse_calibration(missing_gyro),
            Err(LightError::Format(_))
        ));

        let short_array = br#"{"IMU":{"device_1":{"accel_bias":[0.1],"gyro_bias":[0,0,0]}}}"#;
        assert!(matches!(
            parse_calibration(short_array),
            Err(LightError::Format(_))
        ));

        let no_json = b"no braces here";
        assert!(matches!(
            parse_calibration(no_json),
            Err(LightError::Format(_))
        ));
    }

    #[test]
    fn calibration_parts_assemble_until_end_marker() {
        let mut part = vec![0x02, RESPONSE_CALIBRATION_PART, 4];
        part.extend_from_slice(b"abcd");
        part.resize(REPORT_SIZE, 0);
        match calibration_part(&part).unwrap() {
            CalibrationPart::Chunk(chunk) => assert_eq!(chunk, b"abcd"),
            CalibrationPart::End => panic!("expected a chunk"),
        }

        let mut end = vec![0x02, RESPONSE_CALIBRATION_END, 0];
        end.resize(REPORT_SIZE, 0);
        assert!(matches!(
            calibration_part(&end).unwrap(),
            CalibrationPart::End
        ));
    }

    #[test]
    fn declared_length_is_le_u24() {
        let mut response = vec![0x02, RESPONSE_CALIBRATION_LENGTH, 0, 0x10, 0x02, 0x01];
        response.resize(REPORT_SIZE, 0);
        assert_eq!(declared_length(&response).unwrap(), 0x010210);
    }
}
