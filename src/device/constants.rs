use uuid::Uuid;

/**
 * The advertised name of the scale.
 */
pub const DEFAULT_DEVICE_NAME: &str = "Decent Scale";

/**
 * How long (milliseconds) to scan before giving up on finding the scale.
 */
pub const SCAN_TIMEOUT: u64 = 10_000;

/**
 * How long (milliseconds) an error state is shown before reverting to idle.
 */
pub const COOL_DOWN: u64 = 2_000;

/**
 * How long (milliseconds) connecting, discovering services and subscribing may take together.
 */
pub const CONNECT_TIMEOUT: u64 = 15_000;

/**
 * How long (milliseconds) a write to a characteristic may take.
 */
pub const WRITE_DEADLINE: u64 = 2_000;

/**
 * The UUID of the Bluetooth BLE service of the scale
 */
pub const SCALE_SERVICE: Uuid = Uuid::from_u128(0x0000FFF0_0000_1000_8000_00805F9B34FB);

/**
 * The UUID of the characteristic that notifies weight frames.
 */
pub const SCALE_NOTIFY_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0000FFF4_0000_1000_8000_00805F9B34FB);

/**
 * The UUID of the characteristic to send commands to.
 */
pub const SCALE_WRITE_CHARACTERISTIC: Uuid = Uuid::from_u128(0x000036F5_0000_1000_8000_00805F9B34FB);

/**
 * Client Characteristic Configuration Descriptor
 */
pub const CCCD: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805F9B34FB);

pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

pub const GATT_SUCCESS: i32 = 0;
pub const GATT_FAILURE: i32 = 0x101;

pub const FRAME_LEN: usize = 7;
pub const MODEL_BYTE: u8 = 0x03;
pub const STABLE_BYTE: u8 = 0xCE;
pub const UNSTABLE_BYTE: u8 = 0xCA;

// The trailing byte is what the scale firmware expects, it is not the XOR of the preceding bytes.
pub const COMMAND_TARE: [u8; 7] = [0x03, 0x0F, 0x00, 0x00, 0x00, 0x01, 0x0E];

/// Short label used in log lines, e.g. "FFF4" for 0000fff4-0000-1000-8000-00805f9b34fb.
pub fn short_uuid(uuid: &Uuid) -> String {
    let (high, ..) = uuid.as_fields();
    format!("{:04X}", high & 0xFFFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_uuid_uses_the_16_bit_alias() {
        assert_eq!(short_uuid(&SCALE_SERVICE), "FFF0");
        assert_eq!(short_uuid(&SCALE_NOTIFY_CHARACTERISTIC), "FFF4");
        assert_eq!(short_uuid(&SCALE_WRITE_CHARACTERISTIC), "36F5");
    }
}
