use crate::{LightError, Result};

/// Product name reported by the façade.
pub const DEVICE_NAME: &str = "XREAL Light";

/// Known firmware builds with firmware-dependent command ids.
pub const FIRMWARE_05_5_08_059: &str = "05.5.08.059_20230518";
pub const FIRMWARE_05_1_08_021: &str = "05.1.08.021_20221114";

/// Firmware builds this driver has been validated against. Callers compare
/// the string reported by [`crate::XrealLight::get_firmware_version`]
/// against this list and decide their own policy on a mismatch.
pub const SUPPORTED_FIRMWARE: &[&str] = &[FIRMWARE_05_5_08_059];

/// A command as it appears on the wire: one type byte and one id byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Command {
    pub ty: u8,
    pub id: u8,
}

impl Command {
    pub const fn new(ty: u8, id: u8) -> Command {
        Command { ty, id }
    }

    /// Whether this wire command is the firmware-independent mapping of
    /// `instruction`. Used to match incoming MCU event packets.
    pub fn is(self, instruction: Instruction) -> bool {
        firmware_independent(instruction) == Some(self)
    }
}

/// Stable semantic name for a device operation or event. An instruction
/// plus the connected firmware version resolves to one [`Command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Instruction {
    HeartBeat,
    GetNrealFwString,
    GetFirmwareVersion,
    GetStockFirmwareVersion,
    GetSerialNumber,

    GetDisplayMode,
    SetDisplayMode,
    GetBrightnessLevel,
    SetBrightnessLevel,

    GetAmbientLightEnabled,
    EnableAmbientLight,
    GetVsyncEnabled,
    EnableVsync,
    GetMagnetometerEnabled,
    EnableMagnetometer,
    GetTemperatureEnabled,
    EnableTemperature,
    EnableRgbCamera,

    GetGlassActivated,
    SetGlassActivation,
    GetGlassActivationTime,
    SetSdkWorks,

    McuEventAmbientLight,
    McuEventKeyPress,
    McuEventMagnetometer,
    McuEventProximity,
    McuEventTemperatureA,
    McuEventTemperatureB,
    McuEventVsync,

    // Firmware-dependent, resolved through the override table.
    DisplayHdcp,
    SetMaxBrightness,
    DisplayFirmware,

    Ov580EnableImuStream,
    Ov580GetCalibrationFileLength,
    Ov580GetCalibrationFilePart,
}

/// Firmware-independent instruction table. Covers every instruction the
/// driver sends for control plus every incoming event it recognizes.
pub fn firmware_independent(instruction: Instruction) -> Option<Command> {
    use Instruction::*;
    let command = match instruction {
        HeartBeat => Command::new(0x40, 0x4b),
        // Always answers the hardcoded string `NrealFW`; used by the read
        // drain to flush the device's outbound queue.
        GetNrealFwString => Command::new(0x33, 0x56),
        // (0x33, 0x61) is documented identical; this one is in active use.
        GetFirmwareVersion => Command::new(0x33, 0x35),
        GetStockFirmwareVersion => Command::new(0x33, 0x30),
        GetSerialNumber => Command::new(0x33, 0x43),

        GetDisplayMode => Command::new(0x33, 0x33),
        SetDisplayMode => Command::new(0x31, 0x33),
        GetBrightnessLevel => Command::new(0x33, 0x31),
        SetBrightnessLevel => Command::new(0x31, 0x31),

        GetAmbientLightEnabled => Command::new(0x33, 0x4c),
        EnableAmbientLight => Command::new(0x31, 0x4c),
        GetVsyncEnabled => Command::new(0x33, 0x4e),
        EnableVsync => Command::new(0x31, 0x4e),
        GetMagnetometerEnabled => Command::new(0x33, 0x55),
        EnableMagnetometer => Command::new(0x31, 0x55),
        GetTemperatureEnabled => Command::new(0x33, 0x60),
        EnableTemperature => Command::new(0x31, 0x60),
        EnableRgbCamera => Command::new(0x31, 0x68),

        GetGlassActivated => Command::new(0x33, 0x65),
        SetGlassActivation => Command::new(0x31, 0x65),
        GetGlassActivationTime => Command::new(0x33, 0x66),
        SetSdkWorks => Command::new(0x40, 0x33),

        McuEventAmbientLight => Command::new(0x35, 0x4c),
        McuEventKeyPress => Command::new(0x35, 0x4b),
        McuEventMagnetometer => Command::new(0x35, 0x4d),
        McuEventProximity => Command::new(0x35, 0x50),
        McuEventTemperatureA => Command::new(0x35, 0x52),
        McuEventTemperatureB => Command::new(0x35, 0x54),
        McuEventVsync => Command::new(0x35, 0x53),

        Ov580EnableImuStream => Command::new(0x02, 0x19),
        Ov580GetCalibrationFileLength => Command::new(0x02, 0x14),
        Ov580GetCalibrationFilePart => Command::new(0x02, 0x15),

        DisplayHdcp | SetMaxBrightness | DisplayFirmware => return None,
    };
    Some(command)
}

/// Firmware-dependent override table, keyed by (instruction, firmware).
fn firmware_override(instruction: Instruction, firmware: &str) -> Option<Command> {
    use Instruction::*;
    match (instruction, firmware) {
        // Answers the hardcoded string "ELLA2_1224_HDCP".
        (DisplayHdcp, FIRMWARE_05_5_08_059) => Some(Command::new(0x33, 0x48)),
        (DisplayHdcp, FIRMWARE_05_1_08_021) => Some(Command::new(0x33, 0x34)),
        // Static, takes no input.
        (SetMaxBrightness, FIRMWARE_05_5_08_059) => Some(Command::new(0x31, 0x32)),
        (SetMaxBrightness, FIRMWARE_05_1_08_021) => Some(Command::new(0x33, 0x32)),
        // "ELLA2_0518_V017"
        (DisplayFirmware, FIRMWARE_05_5_08_059) => Some(Command::new(0x33, 0x34)),
        _ => None,
    }
}

/// Resolve an instruction against the connected firmware: the override
/// table wins, then the firmware-independent table.
pub fn resolve(instruction: Instruction, firmware: &str) -> Result<Command> {
    firmware_override(instruction, firmware)
        .or_else(|| firmware_independent(instruction))
        .ok_or_else(|| LightError::UnknownInstruction(instruction, firmware.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn independent_table_covers_core_set() {
        let cases = [
            (Instruction::HeartBeat, (0x40, 0x4b)),
            (Instruction::GetNrealFwString, (0x33, 0x56)),
            (Instruction::GetFirmwareVersion, (0x33, 0x35)),
            (Instruction::GetDisplayMode, (0x33, 0x33)),
            (Instruction::SetDisplayMode, (0x31, 0x33)),
            (Instruction::GetBrightnessLevel, (0x33, 0x31)),
            (Instruction::SetBrightnessLevel, (0x31, 0x31)),
            (Instruction::GetSerialNumber, (0x33, 0x43)),
            (Instruction::McuEventMagnetometer, (0x35, 0x4d)),
            (Instruction::Ov580EnableImuStream, (0x02, 0x19)),
            (Instruction::Ov580GetCalibrationFileLength, (0x02, 0x14)),
            (Instruction::Ov580GetCalibrationFilePart, (0x02, 0x15)),
        ];
        for (instruction, (ty, id)) in cases {
            assert_eq!(
                firmware_independent(instruction),
                Some(Command::new(ty, id)),
                "{instruction:?}"
            );
        }
    }

    #[test]
    fn overrides_differ_between_firmwares() {
        let newer = resolve(Instruction::DisplayHdcp, FIRMWARE_05_5_08_059).unwrap();
        assert_eq!(newer, Command::new(0x33, 0x48));

        let older = resolve(Instruction::DisplayHdcp, FIRMWARE_05_1_08_021).unwrap();
        assert_eq!(older, Command::new(0x33, 0x34));

        assert_eq!(
            resolve(Instruction::SetMaxBrightness, FIRMWARE_05_5_08_059).unwrap(),
            Command::new(0x31, 0x32)
        );
        assert_eq!(
            resolve(Instruction::SetMaxBrightness, FIRMWARE_05_1_08_021).unwrap(),
            Command::new(0x33, 0x32)
        );
    }

    #[test]
    fn override_misses_fall_through_or_fail() {
        // Independent instructions resolve on any firmware.
        assert_eq!(
            resolve(Instruction::GetSerialNumber, "00.0.00.000_00000000").unwrap(),
            Command::new(0x33, 0x43)
        );
        // Firmware-dependent instructions fail on unknown firmware.
        assert!(matches!(
            resolve(Instruction::DisplayFirmware, "00.0.00.000_00000000"),
            Err(LightError::UnknownInstruction(
                Instruction::DisplayFirmware,
                _
            ))
        ));
    }

    #[test]
    fn command_matches_instruction() {
        assert!(Command::new(0x35, 0x4b).is(Instruction::McuEventKeyPress));
        assert!(!Command::new(0x35, 0x4b).is(Instruction::McuEventProximity));
    }
}
