//! CRC-32 checksum for MCU control packets.
//!
//! The MCU frames its ASCII packets with the classic reflected CRC-32
//! (polynomial 0xEDB88320, init and final XOR 0xFFFFFFFF), which is the
//! stock `CRC_32_ISO_HDLC` algorithm.

use crc::{Crc, CRC_32_ISO_HDLC};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Checksum of a byte slice, as appended to every serialized packet.
#[inline]
#[must_use]
pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_answers() {
        assert_eq!(crc32(b"Hello, world!"), 0xebe6c6e6);
        assert_eq!(crc32(b"Lorem ipsum dolor sit amet"), 0x5f29d461);
    }

    #[test]
    fn empty_input() {
        assert_eq!(crc32(&[]), 0x00000000);
    }
}
