use std::fmt;

use crate::device::frame::Reading;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Scanning,
    DeviceFound {
        address: String,
        rssi: i16,
    },
    Connecting,
    Connected,
    Disconnecting,
    Error {
        message: String,
    },
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "Idle"),
            ConnectionState::Scanning => write!(f, "Scanning"),
            ConnectionState::DeviceFound { address, rssi } => write!(f, "Found {} ({} dBm)", address, rssi),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Disconnecting => write!(f, "Disconnecting"),
            ConnectionState::Error { message } => write!(f, "Error: {}", message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedDevice {
    pub name: String,
    pub address: String,
    pub rssi: i16,
}

impl ScannedDevice {
    pub fn display_name(&self) -> String {
        let tail = self.address.len().saturating_sub(8);
        let short_address = self.address.get(tail..).unwrap_or(&self.address);
        format!("{} ({}) - RSSI: {}", self.name, short_address, self.rssi)
    }
}

/// Everything a session publishes. Updated as a whole, so a reading is never
/// visible without the log line that documents it.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionView {
    pub state: ConnectionState,
    pub reading: Option<Reading>,
    pub log: Vec<String>,
    /// Bumped whenever `log` is cleared for a new connection attempt.
    pub log_generation: u64,
    /// Matching devices seen during the current scan, strongest signal first.
    pub devices: Vec<ScannedDevice>,
}

impl Default for SessionView {
    fn default() -> Self {
        SessionView {
            state: ConnectionState::Idle,
            reading: None,
            log: Vec::new(),
            log_generation: 0,
            devices: Vec::new(),
        }
    }
}

impl SessionView {
    pub fn clear_log(&mut self) {
        self.log.clear();
        self.log_generation += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    StartScan,
    ConnectToAddress(String),
    Disconnect,
    SendTare,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_name_shortens_the_address() {
        let device = ScannedDevice {
            name: String::from("Decent Scale"),
            address: String::from("AA:BB:CC:DD:EE:FF"),
            rssi: -61,
        };
        assert_eq!(device.display_name(), "Decent Scale (DD:EE:FF) - RSSI: -61");
    }

    #[test]
    fn display_name_keeps_short_addresses() {
        let device = ScannedDevice {
            name: String::from("Decent Scale"),
            address: String::from("EE:FF"),
            rssi: -40,
        };
        assert_eq!(device.display_name(), "Decent Scale (EE:FF) - RSSI: -40");
    }
}
