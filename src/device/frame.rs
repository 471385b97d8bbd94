//! Decoder for the 7 byte weight frames the scale notifies.
//!
//! ```text
//! [0] model tag    (0x03)
//! [1] stability    (0xCE stable, 0xCA unstable)
//! [2..3] weight    big-endian i16, grams * 10
//! [4..5] reserved
//! [6] checksum     XOR of [0..5]
//! ```

use crate::device::constants::{FRAME_LEN, MODEL_BYTE, STABLE_BYTE, UNSTABLE_BYTE};
use crate::error::DecodeError;

/// A successfully decoded weight frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    /// Grams, one decimal digit of precision.
    pub weight: f32,
    pub is_stable: bool,
    /// The frame as uppercase hex, e.g. "03 CE 04 E6 00 00 2F".
    pub raw_frame: String,
}

pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, byte| acc ^ byte)
}

pub fn format_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|byte| format!("{:02X}", byte))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Decode the first 7 bytes of `bytes`.
///
/// The checksum is verified before any other byte is interpreted, so a corrupted
/// frame is never mistaken for a valid-looking reading.
pub fn decode(bytes: &[u8]) -> Result<Reading, DecodeError> {
    if bytes.len() < FRAME_LEN {
        return Err(DecodeError::FrameTooShort { len: bytes.len() });
    }
    let frame = &bytes[..FRAME_LEN];

    let expected = checksum(&frame[..FRAME_LEN - 1]);
    let actual = frame[FRAME_LEN - 1];
    if expected != actual {
        return Err(DecodeError::ChecksumMismatch { expected, actual });
    }

    if frame[0] != MODEL_BYTE {
        return Err(DecodeError::UnexpectedModelByte(frame[0]));
    }

    let is_stable = match frame[1] {
        STABLE_BYTE => true,
        UNSTABLE_BYTE => false,
        other => return Err(DecodeError::UnexpectedStabilityByte(other)),
    };

    let weight_tenths = i16::from_be_bytes([frame[2], frame[3]]);

    Ok(Reading {
        weight: f32::from(weight_tenths) / 10.0,
        is_stable,
        raw_frame: format_hex(frame),
    })
}

/// Build the frame the scale would send for `weight_tenths` (grams * 10).
pub fn encode(weight_tenths: i16, is_stable: bool) -> [u8; FRAME_LEN] {
    let [high, low] = weight_tenths.to_be_bytes();
    let stability = if is_stable { STABLE_BYTE } else { UNSTABLE_BYTE };

    let mut frame = [MODEL_BYTE, stability, high, low, 0x00, 0x00, 0x00];
    frame[FRAME_LEN - 1] = checksum(&frame[..FRAME_LEN - 1]);
    frame
}

/// Inverse of the weight arithmetic in [`decode`]: grams back to the raw 16 bit value.
pub fn weight_to_tenths(weight: f32) -> Option<i16> {
    let tenths = (weight * 10.0).round();
    if tenths.is_finite() && tenths >= f32::from(i16::MIN) && tenths <= f32::from(i16::MAX) {
        Some(tenths as i16)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_stable_weight() {
        let reading = decode(&[0x03, 0xCE, 0x04, 0xE6, 0x00, 0x00, 0x2F]).unwrap();
        assert_eq!(reading.weight, 125.4);
        assert!(reading.is_stable);
        assert_eq!(reading.raw_frame, "03 CE 04 E6 00 00 2F");
    }

    #[test]
    fn decodes_unstable_zero() {
        let reading = decode(&[0x03, 0xCA, 0x00, 0x00, 0x00, 0x00, 0xC9]).unwrap();
        assert_eq!(reading.weight, 0.0);
        assert!(!reading.is_stable);
        assert_eq!(reading.raw_frame, "03 CA 00 00 00 00 C9");
    }

    #[test]
    fn decodes_negative_weight() {
        // -12.3g after a tare overshoot
        let frame = encode(-123, true);
        assert_eq!(&frame[2..4], &[0xFF, 0x85]);
        let reading = decode(&frame).unwrap();
        assert_eq!(reading.weight, -12.3);
    }

    #[test]
    fn checksum_is_verified_before_tags() {
        // wrong model byte and wrong checksum: the checksum wins
        let result = decode(&[0x07, 0x05, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(result, Err(DecodeError::ChecksumMismatch { expected: 0x02, actual: 0x00 }));
    }

    #[test]
    fn misreported_checksum_is_rejected() {
        // XOR(03, CE, 04, E6, 00, 00) is 2F, not 2B
        let result = decode(&[0x03, 0xCE, 0x04, 0xE6, 0x00, 0x00, 0x2B]);
        assert_eq!(result, Err(DecodeError::ChecksumMismatch { expected: 0x2F, actual: 0x2B }));
    }

    #[test]
    fn rejects_unknown_model_byte() {
        let mut frame = [0x04, 0xCE, 0x00, 0x10, 0x00, 0x00, 0x00];
        frame[6] = checksum(&frame[..6]);
        assert_eq!(decode(&frame), Err(DecodeError::UnexpectedModelByte(0x04)));
    }

    #[test]
    fn rejects_unknown_stability_byte() {
        let mut frame = [0x03, 0x05, 0x00, 0x10, 0x00, 0x00, 0x00];
        frame[6] = checksum(&frame[..6]);
        assert_eq!(decode(&frame), Err(DecodeError::UnexpectedStabilityByte(0x05)));
    }

    #[test]
    fn short_frames_are_rejected() {
        for len in 0..FRAME_LEN {
            let bytes = vec![0x03; len];
            assert_eq!(decode(&bytes), Err(DecodeError::FrameTooShort { len }));
        }
    }

    #[test]
    fn trailing_bytes_are_ignored() {
        let reading = decode(&[0x03, 0xCE, 0x04, 0xE6, 0x00, 0x00, 0x2F, 0xAA, 0xBB]).unwrap();
        assert_eq!(reading.weight, 125.4);
        assert_eq!(reading.raw_frame, "03 CE 04 E6 00 00 2F");
    }

    #[test]
    fn weight_to_tenths_rounds_and_bounds() {
        assert_eq!(weight_to_tenths(125.4), Some(1254));
        assert_eq!(weight_to_tenths(-12.3), Some(-123));
        assert_eq!(weight_to_tenths(3276.7), Some(i16::MAX));
        assert_eq!(weight_to_tenths(4000.0), None);
        assert_eq!(weight_to_tenths(f32::NAN), None);
    }
}
