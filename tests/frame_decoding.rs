use scale_link::device::frame::{checksum, decode, encode, format_hex, weight_to_tenths};
use scale_link::error::DecodeError;

#[test]
fn encoded_weights_decode_back() {
    for weight in [0.0_f32, 0.1, 125.4, 1999.9, -12.3, -0.5] {
        let tenths = weight_to_tenths(weight).unwrap();
        for is_stable in [true, false] {
            let reading = decode(&encode(tenths, is_stable)).unwrap();
            assert!((reading.weight - weight).abs() < 0.05, "{} decoded as {}", weight, reading.weight);
            assert_eq!(reading.is_stable, is_stable);
        }
    }
}

#[test]
fn every_valid_frame_reencodes_to_itself() {
    for tenths in i16::MIN..=i16::MAX {
        for is_stable in [true, false] {
            let frame = encode(tenths, is_stable);
            let reading = decode(&frame).unwrap();
            let reencoded = encode(weight_to_tenths(reading.weight).unwrap(), reading.is_stable);
            assert_eq!(reencoded, frame, "frame {} did not survive a round trip", format_hex(&frame));
        }
    }
}

#[test]
fn corrupted_checksum_byte_reports_both_values() {
    let mut frame = encode(1254, true);
    assert_eq!(frame[6], 0x2F);
    frame[6] = 0x2B;
    assert_eq!(decode(&frame), Err(DecodeError::ChecksumMismatch { expected: 0x2F, actual: 0x2B }));
}

#[test]
fn decoding_is_deterministic() {
    let frame = [0x03, 0xCA, 0x01, 0x00, 0x00, 0x00, 0xC8];
    assert_eq!(decode(&frame), decode(&frame));
    assert_eq!(decode(&frame).unwrap().raw_frame, format_hex(&frame));
}

#[test]
fn raw_frame_is_uppercase_hex() {
    let reading = decode(&[0x03, 0xCE, 0x04, 0xE6, 0x00, 0x00, 0x2F]).unwrap();
    assert_eq!(reading.raw_frame, "03 CE 04 E6 00 00 2F");
    assert!((reading.weight - 125.4).abs() < 1e-4);
    assert!(reading.is_stable);
}

#[test]
fn short_frames_are_rejected() {
    for len in 0..7 {
        let frame = vec![0x03; len];
        assert_eq!(decode(&frame), Err(DecodeError::FrameTooShort { len }));
    }
}

#[test]
fn any_single_corrupted_byte_is_caught() {
    let frame = encode(1254, true);
    for index in 0..frame.len() {
        let mut corrupted = frame;
        corrupted[index] ^= 0x10;
        assert!(decode(&corrupted).is_err(), "corruption at {} went unnoticed", index);
    }
}

#[test]
fn checksum_covers_first_six_bytes() {
    let frame = encode(-123, false);
    assert_eq!(checksum(&frame[..6]), frame[6]);
}
