use std::time::Duration;

use rusb::{DeviceHandle, GlobalContext};

use crate::types::SlamFrame;
use crate::{LightError, Result};

/// XREAL Light SLAM camera (same USB device as the OV580 HID interface).
pub const SLAM_CAM_VID: u16 = 0x05a9;
pub const SLAM_CAM_PID: u16 = 0x0680;

/// XREAL Light RGB camera.
pub const RGB_CAM_VID: u16 = 0x0817;
pub const RGB_CAM_PID: u16 = 0x0909;

pub const FRAME_WIDTH: usize = 640;
pub const FRAME_HEIGHT: usize = 480;

/// One bulk transfer of the stereo stream, headers included.
const SLAM_FRAME_SIZE: usize = 615_908;
/// Pixel payload of one stereo frame: two interleaved 640x480 planes.
const PIXELS_PER_FRAME: usize = FRAME_WIDTH * FRAME_HEIGHT * 2;
/// The device prepends a chunk header every 0x8000 bytes.
const CHUNK_SIZE: usize = 0x8000;
/// Header size of a payload-carrying chunk; other sizes flag filler data.
const PAYLOAD_HEADER_SIZE: usize = 12;

const SLAM_INTERFACE: u8 = 1;
const RGB_INTERFACE: u8 = 0;
const BULK_ENDPOINT: u8 = 0x81;

// LIBUSB_REQUEST_TYPE_CLASS | LIBUSB_RECIPIENT_INTERFACE, host-to-device.
const REQUEST_TYPE_CLASS_INTERFACE: u8 = 0x21;
const UVC_SET_CUR: u8 = 0x01;
const UVC_VS_COMMIT_CONTROL: u16 = 0x02;
const COMMIT_TIMEOUT: Duration = Duration::from_secs(1);

const SLAM_MAX_VIDEO_FRAME_SIZE: u32 = 615_680;
const RGB_MAX_VIDEO_FRAME_SIZE: u32 = 15_116_544;

/// UVC probe/commit block selecting 640x480 grayscale at 30 Hz.
fn commit_control_payload(max_video_frame_size: u32) -> [u8; 34] {
    let mut payload = [0u8; 34];
    payload[0..2].copy_from_slice(&1u16.to_le_bytes()); // bmHint
    payload[2] = 0x01; // bFormatIndex
    payload[3] = 0x01; // bFrameIndex
    payload[4..8].copy_from_slice(&333_333u32.to_le_bytes()); // bFrameInterval, 30 Hz
    // wKeyFrameRate, wPFrameRate, wCompQuality, wCompWindowSize stay zero.
    payload[16..18].copy_from_slice(&0x65u16.to_le_bytes()); // wDelay
    payload[18..22].copy_from_slice(&max_video_frame_size.to_le_bytes());
    payload[22..26].copy_from_slice(&0x8000u32.to_le_bytes()); // dwMaxPayloadTransferSize
    payload[26..30].copy_from_slice(&0x08F0_D180u32.to_le_bytes()); // dwClockFrequency
    payload[30] = 0x08; // bmFramingInfo
    payload[31] = 0xF0; // bPreferredVersion
    payload[32] = 0xA9; // bMinVersion
    payload[33] = 0x18; // bMaxVersion
    payload
}

/// UVC channel for the stereo SLAM stream plus the RGB camera endpoint.
///
/// No background tasks: frame pulls are synchronous bulk reads driven by
/// the caller.
pub struct CameraChannel {
    slam: Option<DeviceHandle<GlobalContext>>,
    rgb: Option<DeviceHandle<GlobalContext>>,
    initialized: bool,
}

impl CameraChannel {
    pub fn new() -> CameraChannel {
        CameraChannel {
            slam: None,
            rgb: None,
            initialized: false,
        }
    }

    /// Open both cameras and issue the streaming commit on each.
    pub fn connect(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }

        let slam = open_camera(SLAM_CAM_VID, SLAM_CAM_PID, "SLAM")?;
        let rgb = open_camera(RGB_CAM_VID, RGB_CAM_PID, "RGB")?;

        commit_streaming(&slam, SLAM_INTERFACE, SLAM_MAX_VIDEO_FRAME_SIZE)?;
        commit_streaming(&rgb, RGB_INTERFACE, RGB_MAX_VIDEO_FRAME_SIZE)?;

        self.slam = Some(slam);
        self.rgb = Some(rgb);
        self.initialized = true;
        Ok(())
    }

    /// Close both handles. Claimed interfaces are released on drop.
    /// Idempotent.
    pub fn disconnect(&mut self) -> Result<()> {
        self.initialized = false;
        self.slam = None;
        self.rgb = None;
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.initialized
    }

    /// Pull one stereo frame: bulk-read until a full transfer arrives,
    /// strip the chunk headers, split the interleaved rows.
    pub fn get_slam_frame(&self) -> Result<SlamFrame> {
        let handle = match (&self.slam, self.initialized) {
            (Some(handle), true) => handle,
            _ => return Err(LightError::NotReady),
        };

        let mut data = vec![0u8; SLAM_FRAME_SIZE * 2];
        loop {
            // Unlimited timeout; cancelled only by closing the device.
            let received = handle.read_bulk(BULK_ENDPOINT, &mut data, Duration::ZERO)?;
            if received == SLAM_FRAME_SIZE && data[0] != 0 {
                break;
            }
            log::debug!("got {received} instead of {SLAM_FRAME_SIZE}, try again");
        }

        let cleaned = strip_chunk_headers(&data[..SLAM_FRAME_SIZE]);
        if cleaned.len() < PIXELS_PER_FRAME {
            return Err(LightError::Format(format!(
                "de-chunked frame too short: {} of {PIXELS_PER_FRAME} bytes",
                cleaned.len()
            )));
        }
        let pixels = &cleaned[..PIXELS_PER_FRAME];
        if pixels.iter().all(|&b| b == 0) {
            return Err(LightError::Format("got an empty frame".into()));
        }

        Ok(deinterleave_rows(pixels))
    }
}

impl Default for CameraChannel {
    fn default() -> Self {
        CameraChannel::new()
    }
}

fn open_camera(vid: u16, pid: u16, label: &str) -> Result<DeviceHandle<GlobalContext>> {
    let mut matches = Vec::new();
    for device in rusb::devices()?.iter() {
        let descriptor = match device.device_descriptor() {
            Ok(descriptor) => descriptor,
            Err(err) => {
                log::warn!("failed to get device descriptor, skip: {err}");
                continue;
            }
        };
        if descriptor.vendor_id() == vid && descriptor.product_id() == pid {
            matches.push(device);
        }
    }

    let Some(device) = matches.first() else {
        return Err(LightError::NotFound { vid, pid });
    };
    if matches.len() > 1 {
        log::warn!("multiple {label} cameras found, assuming the first one");
    }

    device
        .open()
        .map_err(|err| LightError::Open(format!("{label} camera: {err}")))
}

/// Claim the video streaming interface and issue the
/// SET_CUR/VS_COMMIT_CONTROL handshake that selects the format before bulk
/// streaming starts.
fn commit_streaming(
    handle: &DeviceHandle<GlobalContext>,
    interface: u8,
    max_video_frame_size: u32,
) -> Result<()> {
    handle.set_auto_detach_kernel_driver(true)?;
    handle.claim_interface(interface)?;
    handle.write_control(
        REQUEST_TYPE_CLASS_INTERFACE,
        UVC_SET_CUR,
        UVC_VS_COMMIT_CONTROL << 8,
        u16::from(interface),
        &commit_control_payload(max_video_frame_size),
        COMMIT_TIMEOUT,
    )?;
    Ok(())
}

/// Walk the raw transfer and drop the per-chunk headers. Each chunk starts
/// at a 0x8000 boundary with its header size in the first byte; only
/// 12-byte-header chunks carry frame payload, anything else is filler and
/// its span is discarded.
fn strip_chunk_headers(data: &[u8]) -> Vec<u8> {
    let mut cleaned = Vec::with_capacity(data.len());
    let mut read = 0usize;
    while read < data.len() {
        let header_size = data[read] as usize;
        read += header_size;
        if read >= data.len() {
            break;
        }
        let span = CHUNK_SIZE - (read % CHUNK_SIZE);
        let end = (read + span).min(data.len());
        if header_size == PAYLOAD_HEADER_SIZE {
            cleaned.extend_from_slice(&data[read..end]);
        }
        read = end;
    }
    cleaned
}

/// Rows alternate left, right, left, right; rebuild the two planes.
fn deinterleave_rows(pixels: &[u8]) -> SlamFrame {
    let mut left = Vec::with_capacity(FRAME_WIDTH * FRAME_HEIGHT);
    let mut right = Vec::with_capacity(FRAME_WIDTH * FRAME_HEIGHT);
    for (i, row) in pixels.chunks_exact(FRAME_WIDTH).enumerate() {
        if i % 2 == 0 {
            left.extend_from_slice(row);
        } else {
            right.extend_from_slice(row);
        }
    }
    SlamFrame { left, right }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_payload_matches_wire_literal() {
        // Byte-for-byte the block captured from the stock driver.
        let expected: [u8; 34] = [
            0x01, 0x00, // bmHint
            0x01, // bFormatIndex
            0x01, // bFrameIndex
            0x15, 0x16, 0x05, 0x00, // bFrameInterval (333333)
            0x00, 0x00, // wKeyFrameRate
            0x00, 0x00, // wPFrameRate
            0x00, 0x00, // wCompQuality
            0x00, 0x00, // wCompWindowSize
            0x65, 0x00, // wDelay
            0x00, 0x65, 0x09, 0x00, // dwMaxVideoFrameSize (615680)
            0x00, 0x80, 0x00, 0x00, // dwMaxPayloadTransferSize
            0x80, 0xd1, 0xf0, 0x08, // dwClockFrequency
            0x08, // bmFramingInfo
            0xf0, // bPreferredVersion
            0xa9, // bMinVersion
            0x18, // bMaxVersion
        ];
        assert_eq!(commit_control_payload(SLAM_MAX_VIDEO_FRAME_SIZE), expected);
    }

    #[test]
    fn commit_payload_carries_rgb_frame_size() {
        let payload = commit_control_payload(RGB_MAX_VIDEO_FRAME_SIZE);
        assert_eq!(&payload[18..22], &RGB_MAX_VIDEO_FRAME_SIZE.to_le_bytes());
        // Everything else is shared with the SLAM block.
        let slam = commit_control_payload(SLAM_MAX_VIDEO_FRAME_SIZE);
        assert_eq!(payload[..18], slam[..18]);
        assert_eq!(payload[22..], slam[22..]);
    }

    /// Build a synthetic transfer: chunks at 0x8000 boundaries, each with
    /// the given header size and a payload of recognizable bytes. Returns
    /// the raw buffer and the expected cleaned concatenation.
    fn synthetic_transfer(total: usize, filler_chunks: &[usize]) -> (Vec<u8>, Vec<u8>) {
        let mut raw = vec![0u8; total];
        let mut expected = Vec::new();
        let mut offset = 0usize;
        let mut chunk_index = 0usize;
        let mut value: u8 = 1;
        while offset < total {
            let filler = filler_chunks.contains(&chunk_index);
            let header_size = if filler { 32 } else { PAYLOAD_HEADER_SIZE };
            let chunk_end = (offset + CHUNK_SIZE).min(total);
            raw[offset] = header_size as u8;
            for byte in raw[offset + header_size..chunk_end].iter_mut() {
                *byte = value;
                value = value.wrapping_add(1).max(1);
            }
            if !filler {
                expected.extend_from_slice(&raw[offset + header_size..chunk_end]);
            }
            offset = chunk_end;
            chunk_index += 1;
        }
        (raw, expected)
    }

    #[test]
    fn dechunk_keeps_payload_chunks_and_drops_filler() {
        let (raw, expected) = synthetic_transfer(SLAM_FRAME_SIZE, &[5]);
        let cleaned = strip_chunk_headers(&raw);
        assert_eq!(cleaned, expected);
    }

    #[test]
    fn dechunk_of_all_payload_chunks_covers_the_pixel_prefix() {
        // A real transfer carries only 12-byte headers; the cleaned buffer
        // must at least cover the two pixel planes.
        let (raw, expected) = synthetic_transfer(SLAM_FRAME_SIZE, &[]);
        let cleaned = strip_chunk_headers(&raw);
        assert_eq!(cleaned, expected);
        assert!(cleaned.len() >= PIXELS_PER_FRAME);
    }

    #[test]
    fn rows_deinterleave_into_left_and_right_planes() {
        let mut pixels = vec![0u8; PIXELS_PER_FRAME];
        for (i, row) in pixels.chunks_exact_mut(FRAME_WIDTH).enumerate() {
            // Even rows belong to the left plane, odd rows to the right.
            row.fill((i % 2) as u8 + 1);
            row[0] = (i / 2) as u8;
        }

        let frame = deinterleave_rows(&pixels);
        assert_eq!(frame.left.len(), FRAME_WIDTH * FRAME_HEIGHT);
        assert_eq!(frame.right.len(), FRAME_WIDTH * FRAME_HEIGHT);
        for i in 0..FRAME_HEIGHT {
            let left_row = &frame.left[i * FRAME_WIDTH..(i + 1) * FRAME_WIDTH];
            let right_row = &frame.right[i * FRAME_WIDTH..(i + 1) * FRAME_WIDTH];
            assert_eq!(left_row[0], i as u8);
            assert!(left_row[1..].iter().all(|&b| b == 1));
            assert_eq!(right_row[0], i as u8);
            assert!(right_row[1..].iter().all(|&b| b == 2));
        }
    }
}
