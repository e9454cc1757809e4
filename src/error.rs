use std::fmt;

use crate::command::Instruction;

/// Errors that can occur when talking to the XREAL Light glasses.
#[derive(Debug, thiserror::Error)]
pub enum LightError {
    #[error("HID error: {0}")]
    Hid(#[from] hidapi::HidError),

    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("no matching device found (VID={vid:04x} PID={pid:04x})")]
    NotFound { vid: u16, pid: u16 },

    #[error(
        "multiple XREAL Light glasses found, specify either a device path or a serial number:\n{0}"
    )]
    Ambiguous(DeviceCandidates),

    #[error("failed to open device: {0}")]
    Open(String),

    #[error("timed out waiting for a response")]
    Timeout,

    #[error("malformed packet: {0}")]
    Format(String),

    #[error("CRC check failed: {0}")]
    Crc(String),

    #[error("no command mapping for {0:?} on firmware \"{1}\"")]
    UnknownInstruction(Instruction, String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("channel not connected / initialized")]
    NotReady,

    #[error("{0}")]
    Channels(ChannelFailures),
}

/// Enumeration candidates attached to [`LightError::Ambiguous`].
#[derive(Debug, Clone)]
pub struct DeviceCandidates(pub Vec<(String, String)>);

impl fmt::Display for DeviceCandidates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (path, serial) in &self.0 {
            writeln!(f, "- path: {path}\n  serial: {serial}")?;
        }
        Ok(())
    }
}

/// Per-channel failures collected by the façade's connect/disconnect.
#[derive(Debug)]
pub struct ChannelFailures {
    pub context: &'static str,
    pub failures: Vec<(&'static str, LightError)>,
}

impl ChannelFailures {
    pub(crate) fn into_result(self) -> crate::Result<()> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(LightError::Channels(self))
        }
    }
}

impl fmt::Display for ChannelFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed on", self.context)?;
        for (i, (channel, err)) in self.failures.iter().enumerate() {
            let sep = if i == 0 { ' ' } else { ';' };
            write!(f, "{sep}{channel}: {err}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_failures_name_each_channel() {
        let err = ChannelFailures {
            context: "connect",
            failures: vec![
                ("mcu", LightError::Timeout),
                ("camera", LightError::NotReady),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("connect failed on"));
        assert!(msg.contains("mcu:"));
        assert!(msg.contains("camera:"));
    }

    #[test]
    fn empty_failures_collapse_to_ok() {
        let none = ChannelFailures {
            context: "disconnect",
            failures: Vec::new(),
        };
        assert!(none.into_result().is_ok());
    }
}
