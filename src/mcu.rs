use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, select, tick, Receiver, RecvTimeoutError, Sender};
use hidapi::{HidApi, HidDevice};

use crate::command::{self, Command, Instruction};
use crate::hid;
use crate::packet::{Packet, PacketKind, DUMMY_PAYLOAD, REPORT_SIZE};
use crate::types::{
    DisplayMode, EventHandlers, KeyEvent, MagnetometerVector, ProximityEvent,
};
use crate::{LightError, Result};

/// XREAL Light MCU HID interface.
pub const MCU_VID: u16 = 0x0486;
pub const MCU_PID: u16 = 0x573c;

pub(crate) const READ_TIMEOUT: Duration = Duration::from_millis(30);
pub(crate) const READ_TICK: Duration = Duration::from_millis(10);
pub(crate) const RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);
pub(crate) const RETRY_MAX_ATTEMPTS: usize = 3;
const HEART_BEAT_PERIOD: Duration = Duration::from_millis(500);
const READS_PER_BATCH: usize = 32;

/// Control channel to the glasses' MCU.
///
/// Owns the HID handle and two background tasks: a 500 ms heart-beat and a
/// 10 ms read drain that feeds the response rendezvous and dispatches
/// asynchronous MCU events.
pub struct McuChannel {
    device_path: Option<String>,
    serial_number: Option<String>,
    handlers: Arc<RwLock<EventHandlers>>,
    active: Option<Active>,
}

struct Active {
    shared: Arc<Shared>,
    // Keeps the hidapi context alive for the lifetime of the handle.
    _api: HidApi,
    stop_heart_beat: Sender<()>,
    stop_reader: Sender<()>,
    heart_beat: JoinHandle<()>,
    reader: JoinHandle<()>,
}

struct Shared {
    device: Mutex<HidDevice>,
    initialized: AtomicBool,
    firmware: RwLock<String>,
    handlers: Arc<RwLock<EventHandlers>>,
    response_tx: Sender<Packet>,
    response_rx: Receiver<Packet>,
}

impl McuChannel {
    pub fn new(
        device_path: Option<String>,
        serial_number: Option<String>,
        handlers: Arc<RwLock<EventHandlers>>,
    ) -> McuChannel {
        McuChannel {
            device_path,
            serial_number,
            handlers,
            active: None,
        }
    }

    /// Open the MCU interface and run the initialization sequence:
    /// heart-beat task, read-drain task, firmware query, glass activation,
    /// best-effort vsync-reporting off.
    pub fn connect(&mut self) -> Result<()> {
        if self.active.is_some() {
            return Ok(());
        }

        let opened = hid::open_interface(
            MCU_VID,
            MCU_PID,
            self.device_path.as_deref(),
            self.serial_number.as_deref(),
        )?;
        if opened.path.is_some() {
            self.device_path = opened.path.clone();
        }
        if opened.serial_number.is_some() {
            self.serial_number = opened.serial_number.clone();
        }

        // Capacity 1 is enough: one outstanding request per channel.
        let (response_tx, response_rx) = bounded(1);
        let shared = Arc::new(Shared {
            device: Mutex::new(opened.device),
            initialized: AtomicBool::new(false),
            firmware: RwLock::new(String::new()),
            handlers: Arc::clone(&self.handlers),
            response_tx,
            response_rx,
        });

        let (stop_heart_beat, heart_beat_stop_rx) = bounded::<()>(0);
        let heart_beat_shared = Arc::clone(&shared);
        let heart_beat = std::thread::Builder::new()
            .name("xreal-mcu-heartbeat".into())
            .spawn(move || heart_beat_loop(heart_beat_shared, heart_beat_stop_rx))
            .map_err(|err| LightError::Open(format!("failed to spawn heart-beat task: {err}")))?;

        let (stop_reader, reader_stop_rx) = bounded::<()>(0);
        let reader_shared = Arc::clone(&shared);
        let reader = std::thread::Builder::new()
            .name("xreal-mcu-reader".into())
            .spawn(move || reader_loop(reader_shared, reader_stop_rx))
            .map_err(|err| LightError::Open(format!("failed to spawn reader task: {err}")))?;

        self.active = Some(Active {
            shared: Arc::clone(&shared),
            _api: opened.api,
            stop_heart_beat,
            stop_reader,
            heart_beat,
            reader,
        });

        // We must get the firmware version; command resolution depends on it.
        loop {
            let packet = build_packet(&shared, Instruction::GetFirmwareVersion, DUMMY_PAYLOAD)?;
            match execute_and_wait(&shared, &packet) {
                Ok(response) => {
                    let firmware = String::from_utf8_lossy(&response).into_owned();
                    log::info!("connected to MCU, firmware {firmware}");
                    *shared.firmware.write().unwrap_or_else(PoisonError::into_inner) = firmware;
                    break;
                }
                Err(err) => {
                    log::warn!("failed to read firmware version, retrying: {err}");
                }
            }
        }

        // Ensure the glass is activated.
        loop {
            let packet = build_packet(&shared, Instruction::SetGlassActivation, b"1")?;
            match execute_and_wait(&shared, &packet) {
                Ok(_) => break,
                Err(err) => log::warn!("failed to activate glass, retrying: {err}"),
            }
        }

        // Vsync reporting off by default, best effort.
        if let Err(err) = enable_event_reporting(&shared, Instruction::EnableVsync, "0") {
            log::debug!("could not disable vsync reporting: {err}");
        }

        shared.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Stop both background tasks, join them, and close the HID handle.
    /// Idempotent.
    pub fn disconnect(&mut self) -> Result<()> {
        let Some(active) = self.active.take() else {
            return Ok(());
        };

        active.shared.initialized.store(false, Ordering::SeqCst);

        // Dropping the stop senders wakes both select loops.
        drop(active.stop_heart_beat);
        drop(active.stop_reader);
        let _ = active.heart_beat.join();
        let _ = active.reader.join();

        active
            .shared
            .firmware
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        // Last reference: closes the response channel and the HID handle.
        drop(active.shared);
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.active
            .as_ref()
            .map(|a| a.shared.initialized.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub fn device_path(&self) -> Option<&str> {
        self.device_path.as_deref()
    }

    pub fn serial_number(&self) -> Option<&str> {
        self.serial_number.as_deref()
    }

    fn shared(&self) -> Result<&Arc<Shared>> {
        match &self.active {
            Some(active) if active.shared.initialized.load(Ordering::SeqCst) => {
                Ok(&active.shared)
            }
            _ => Err(LightError::NotReady),
        }
    }

    /// Firmware version captured during initialization. No I/O.
    pub fn firmware_version(&self) -> Result<String> {
        let shared = self.shared()?;
        let firmware = shared
            .firmware
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if firmware.is_empty() {
            return Err(LightError::NotReady);
        }
        Ok(firmware)
    }

    pub fn get_serial(&self) -> Result<String> {
        self.query_string(Instruction::GetSerialNumber)
    }

    pub fn get_display_mode(&self) -> Result<DisplayMode> {
        let shared = self.shared()?;
        let packet = build_packet(shared, Instruction::GetDisplayMode, DUMMY_PAYLOAD)?;
        let response = execute_and_wait(shared, &packet)?;
        let first = *response
            .first()
            .ok_or_else(|| LightError::Format("empty display mode response".into()))?;
        DisplayMode::from_wire_byte(first).ok_or_else(|| {
            LightError::Format(format!(
                "unrecognized display mode response: {}",
                String::from_utf8_lossy(&response)
            ))
        })
    }

    pub fn set_display_mode(&self, mode: DisplayMode) -> Result<()> {
        let shared = self.shared()?;
        let wire = mode.wire_byte();
        let packet = build_packet(shared, Instruction::SetDisplayMode, &[wire])?;
        let response = execute_and_wait(shared, &packet)?;
        if response.first() != Some(&wire) {
            return Err(LightError::Format(format!(
                "display mode not applied: want {} got {}",
                wire as char,
                String::from_utf8_lossy(&response)
            )));
        }
        Ok(())
    }

    pub fn get_brightness_level(&self) -> Result<String> {
        self.query_string(Instruction::GetBrightnessLevel)
    }

    pub fn set_brightness_level(&self, level: &str) -> Result<()> {
        let valid = level.len() == 1 && (b'0'..=b'7').contains(&level.as_bytes()[0]);
        if !valid {
            return Err(LightError::InvalidArgument(format!(
                "invalid level {level:?}, must be a single digit 0-7"
            )));
        }

        let shared = self.shared()?;
        let packet = build_packet(shared, Instruction::SetBrightnessLevel, level.as_bytes())?;
        let response = execute_and_wait(shared, &packet)?;
        if response.first() != Some(&level.as_bytes()[0]) {
            return Err(LightError::Format(format!(
                "brightness not applied: want {level} got {}",
                String::from_utf8_lossy(&response)
            )));
        }
        Ok(())
    }

    /// Toggle an MCU-side event-reporting flag ("0" off, "1" on).
    pub fn enable_event_reporting(&self, instruction: Instruction, enabled: &str) -> Result<()> {
        let shared = self.shared()?;
        enable_event_reporting(shared, instruction, enabled)
    }

    pub fn get_display_hdcp(&self) -> Result<String> {
        self.query_string(Instruction::DisplayHdcp)
    }

    pub fn get_display_firmware(&self) -> Result<String> {
        self.query_string(Instruction::DisplayFirmware)
    }

    pub fn get_stock_firmware_version(&self) -> Result<String> {
        self.query_string(Instruction::GetStockFirmwareVersion)
    }

    pub fn get_glass_activated(&self) -> Result<String> {
        self.query_string(Instruction::GetGlassActivated)
    }

    /// Activation time as reported, epoch seconds.
    pub fn get_glass_activation_time(&self) -> Result<String> {
        self.query_string(Instruction::GetGlassActivationTime)
    }

    pub fn set_sdk_works(&self, enabled: bool) -> Result<()> {
        let shared = self.shared()?;
        let payload: &[u8] = if enabled { b"1" } else { b"0" };
        let packet = build_packet(shared, Instruction::SetSdkWorks, payload)?;
        execute_and_wait(shared, &packet)?;
        Ok(())
    }

    /// Send an arbitrary command and return the raw response payload.
    /// Development helper; no validation beyond the wire framing.
    pub fn execute_raw(&self, ty: u8, id: u8, payload: &[u8]) -> Result<Vec<u8>> {
        let shared = self.shared()?;
        let packet = Packet::command_packet(Command::new(ty, id), payload);
        execute_and_wait(shared, &packet)
    }

    fn query_string(&self, instruction: Instruction) -> Result<String> {
        let shared = self.shared()?;
        let packet = build_packet(shared, instruction, DUMMY_PAYLOAD)?;
        let response = execute_and_wait(shared, &packet)?;
        Ok(String::from_utf8_lossy(&response).into_owned())
    }
}

impl Drop for McuChannel {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}

/// Resolve `instruction` against the connected firmware and build a
/// COMMAND packet stamped now.
fn build_packet(shared: &Shared, instruction: Instruction, payload: &[u8]) -> Result<Packet> {
    let firmware = shared
        .firmware
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    let command = command::resolve(instruction, &firmware)?;
    Ok(Packet::command_packet(command, payload))
}

/// Serialize and write one packet. Writes are serialized by the device
/// mutex; the lock is held only across the single write.
fn execute_only(shared: &Shared, packet: &Packet) -> Result<()> {
    let serialized = packet.serialize()?;
    let device = shared
        .device
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    device.write(&serialized)?;
    Ok(())
}

/// Post a packet and rendezvous with its response: `type` must be the
/// request's plus one with an equal `id`. A non-matching response is
/// dropped and consumes one attempt.
fn execute_and_wait(shared: &Shared, packet: &Packet) -> Result<Vec<u8>> {
    let request = packet
        .command
        .ok_or_else(|| LightError::InvalidArgument("packet carries no command".into()))?;

    execute_only(shared, packet)?;

    for _ in 0..RETRY_MAX_ATTEMPTS {
        match shared.response_rx.recv_timeout(RESPONSE_TIMEOUT) {
            Ok(response) => {
                if let Some(command) = response.command {
                    if command.ty == request.ty.wrapping_add(1) && command.id == request.id {
                        return Ok(response.payload);
                    }
                }
                log::debug!("dropping non-matching response for {request:?}");
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return Err(LightError::NotReady),
        }
    }
    Err(LightError::Timeout)
}

fn enable_event_reporting(shared: &Shared, instruction: Instruction, enabled: &str) -> Result<()> {
    if enabled != "0" && enabled != "1" {
        return Err(LightError::InvalidArgument(format!(
            "event reporting takes \"0\" or \"1\", got {enabled:?}"
        )));
    }
    let packet = build_packet(shared, instruction, enabled.as_bytes())?;
    let response = execute_and_wait(shared, &packet)?;
    if response.first() != Some(&enabled.as_bytes()[0]) {
        return Err(LightError::Format(format!(
            "event reporting not applied: want {enabled} got {}",
            String::from_utf8_lossy(&response)
        )));
    }
    Ok(())
}

fn heart_beat_loop(shared: Arc<Shared>, stop: Receiver<()>) {
    let ticker = tick(HEART_BEAT_PERIOD);
    loop {
        select! {
            recv(ticker) -> _ => {
                if !shared.initialized.load(Ordering::SeqCst) {
                    continue;
                }
                match build_packet(&shared, Instruction::HeartBeat, DUMMY_PAYLOAD) {
                    Ok(packet) => {
                        if let Err(err) = execute_only(&shared, &packet) {
                            log::debug!("failed to send a heart beat: {err}");
                        }
                    }
                    Err(err) => log::debug!("failed to build heart beat: {err}"),
                }
            }
            recv(stop) -> _ => return,
        }
    }
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

/// What the read drain does with one inbound packet.
#[derive(Debug, PartialEq, Eq)]
enum Inbound {
    /// CRC complaints and heart-beat responses carry no information.
    Discard,
    /// Echo of the drain's own throwaway request; ends the batch.
    EndBatch,
    /// A caller's response, to be pushed onto the rendezvous.
    Deliver,
    /// Asynchronous MCU event for the handler bundle.
    Event,
    Unhandled,
}

fn classify_inbound(throwaway: Command, packet: &Packet) -> Inbound {
    if matches!(
        packet.kind,
        PacketKind::CrcError | PacketKind::HeartBeatResponse
    ) {
        return Inbound::Discard;
    }
    if let Some(command) = packet.command {
        if command.ty == throwaway.ty.wrapping_add(1) && command.id == throwaway.id {
            return Inbound::EndBatch;
        }
    }
    match packet.kind {
        PacketKind::Response => Inbound::Deliver,
        PacketKind::Mcu => Inbound::Event,
        _ => Inbound::Unhandled,
    }
}

/// One drain batch: send the throwaway request that flushes the device's
/// outbound queue, then read up to 32 reports.
fn read_and_process(shared: &Shared) -> Result<()> {
    let throwaway = build_packet(shared, Instruction::GetNrealFwString, DUMMY_PAYLOAD)?;
    execute_only(shared, &throwaway)?;
    let Some(throwaway_cmd) = throwaway.command else {
        return Ok(());
    };

    for _ in 0..READS_PER_BATCH {
        let mut buffer = [0u8; REPORT_SIZE];
        let read = {
            let device = shared
                .device
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            device.read_timeout(&mut buffer, READ_TIMEOUT.as_millis() as i32)?
        };
        if read == 0 {
            // Timed out: the queue is drained for this tick.
            return Ok(());
        }

        let packet = match Packet::deserialize(&buffer) {
            Ok(packet) => packet,
            Err(err) => {
                log::debug!("failed to deserialize report: {err}");
                continue;
            }
        };

        match classify_inbound(throwaway_cmd, &packet) {
            Inbound::Discard => continue,
            Inbound::EndBatch => return Ok(()),
            Inbound::Deliver => {
                if shared.response_tx.try_send(packet).is_err() {
                    log::debug!("response rendezvous full, dropping packet");
                }
            }
            Inbound::Event => {
                if shared.initialized.load(Ordering::SeqCst) {
                    dispatch_mcu_event(shared, &packet);
                }
            }
            Inbound::Unhandled => {
                log::debug!("got unhandled packet: {packet:?}");
            }
        }
    }

    Ok(())
}

fn dispatch_mcu_event(shared: &Shared, packet: &Packet) {
    let Some(command) = packet.command else {
        return;
    };
    let handlers = shared
        .handlers
        .read()
        .unwrap_or_else(PoisonError::into_inner);

    if command.is(Instruction::McuEventKeyPress) {
        let event = match packet.payload.as_slice() {
            b"UP" => KeyEvent::UpPressed,
            b"DN" => KeyEvent::DownPressed,
            other => {
                log::debug!("key press unrecognized: {}", String::from_utf8_lossy(other));
                KeyEvent::Unknown
            }
        };
        if let Some(handler) = &handlers.key {
            handler(event);
        }
    } else if command.is(Instruction::McuEventProximity) {
        let event = match packet.payload.as_slice() {
            b"near" => ProximityEvent::Near,
            b"away" => ProximityEvent::Far,
            other => {
                log::info!("proximity unrecognized: {}", String::from_utf8_lossy(other));
                ProximityEvent::Unknown
            }
        };
        if let Some(handler) = &handlers.proximity {
            handler(event);
        }
    } else if command.is(Instruction::McuEventAmbientLight) {
        let text = String::from_utf8_lossy(&packet.payload);
        match text.parse::<u16>() {
            Ok(value) => {
                if let Some(handler) = &handlers.ambient_light {
                    handler(value);
                }
            }
            Err(_) => log::debug!("ambient light failed to parse: {text}"),
        }
    } else if command.is(Instruction::McuEventVsync) {
        if let Some(handler) = &handlers.vsync {
            handler(&String::from_utf8_lossy(&packet.payload));
        }
    } else if command.is(Instruction::McuEventTemperatureA)
        || command.is(Instruction::McuEventTemperatureB)
    {
        if let Some(handler) = &handlers.temperature {
            handler(&String::from_utf8_lossy(&packet.payload));
        }
    } else if command.is(Instruction::McuEventMagnetometer) {
        match parse_magnetometer(&packet.payload) {
            Some((x, y, z)) => {
                if let Some(handler) = &handlers.magnetometer {
                    handler(MagnetometerVector {
                        x,
                        y,
                        z,
                        timestamp: packet.decode_timestamp(),
                    });
                }
            }
            None => log::debug!(
                "magnetometer payload failed to parse: {}",
                String::from_utf8_lossy(&packet.payload)
            ),
        }
    } else {
        log::debug!(
            "got unhandled MCU packet: {command:?} {}",
            String::from_utf8_lossy(&packet.payload)
        );
    }
}

/// Parse a magnetometer payload of the form `"x<int>y<int>z<int>"`; each
/// integer may be negative. Partial readings yield `None`.
fn parse_magnetometer(payload: &[u8]) -> Option<(i32, i32, i32)> {
    let text = std::str::from_utf8(payload).ok()?;
    let x_idx = text.find('x')?;
    let y_idx = text.find('y')?;
    let z_idx = text.find('z')?;
    if x_idx >= y_idx || y_idx >= z_idx {
        return None;
    }
    let x = text[x_idx + 1..y_idx].parse().ok()?;
    let y = text[y_idx + 1..z_idx].parse().ok()?;
    let z = text[z_idx + 1..].parse().ok()?;
    Some((x, y, z))
}
