use serde::{Deserialize, Serialize};

use crate::device::constants::{CONNECT_TIMEOUT, COOL_DOWN, DEFAULT_DEVICE_NAME, SCAN_TIMEOUT};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub device_name: String,
    pub scan_timeout_ms: u64,
    pub cool_down_ms: u64,
    pub connect_timeout_ms: u64,
    pub auto_connect: bool,
    /// The scale used last time, preferred over other scales in range.
    pub saved_device_address: Option<String>,
}

impl Config {
    /// Returns true if the address changed and the config needs saving.
    pub fn save_device(&mut self, address: &str) -> bool {
        if self.saved_device_address.as_deref() == Some(address) {
            return false;
        }
        self.saved_device_address = Some(address.to_string());
        true
    }

    pub fn clear_saved_device(&mut self) {
        self.saved_device_address = None;
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            device_name: String::from(DEFAULT_DEVICE_NAME),
            scan_timeout_ms: SCAN_TIMEOUT,
            cool_down_ms: COOL_DOWN,
            connect_timeout_ms: CONNECT_TIMEOUT,
            auto_connect: true,
            saved_device_address: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config: Config = serde_json::from_str(r#"{"deviceName": "Kitchen", "savedDeviceAddress": "AA:BB"}"#).unwrap();

        assert_eq!(config.device_name, "Kitchen");
        assert_eq!(config.saved_device_address.as_deref(), Some("AA:BB"));
        assert_eq!(config.scan_timeout_ms, SCAN_TIMEOUT);
        assert_eq!(config.cool_down_ms, COOL_DOWN);
        assert!(config.auto_connect);
    }

    #[test]
    fn save_device_reports_changes() {
        let mut config = Config::default();

        assert!(config.save_device("AA:BB"));
        assert!(!config.save_device("AA:BB"));
        assert!(config.save_device("CC:DD"));

        config.clear_saved_device();
        assert_eq!(config.saved_device_address, None);
    }
}
