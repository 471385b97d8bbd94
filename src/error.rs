use std::io;
use std::str::Utf8Error;
use thiserror::Error;
use btleplug;
use serde_json;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to determine path to config file")]
    NoConfigPath,

    #[error("Failed to acquire file lock on config file: {source}")]
    CanNotLock { source: io::Error },

    #[error("Failed to encode/decode config as utf-8: {source}")]
    Utf8Error { #[from] source: Utf8Error },

    #[error("Failed to read/write config file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to parse/build config file: {source}")]
    JsonError { #[from] source: serde_json::Error },
}

/// Rejection of a notification payload. None of these are fatal to a session.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Data too short: expected 7 bytes, got {len}")]
    FrameTooShort { len: usize },

    #[error("XOR verification failed: calculated {expected:02X}, received {actual:02X}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    #[error("Invalid model byte: expected 03, got {0:02X}")]
    UnexpectedModelByte(u8),

    #[error("Invalid type byte: expected CE or CA, got {0:02X}")]
    UnexpectedStabilityByte(u8),
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Error communicating with device (btleplug): {source}")]
    Btle { #[from] source: btleplug::Error },

    #[error("Bluetooth not supported on this device")]
    NoAdapter,

    #[error("No scanned peripheral with address {address}")]
    UnknownPeripheral { address: String },

    #[error("A required bluetooth characteristic is not available")]
    MissingCharacteristic,
}

#[derive(Error, Debug)]
pub enum AppRunError {
    #[error("Failed to start application (config): {source}")]
    ConfigError { #[from] source: ConfigError },

    #[error("Failed to start application (device): {source}")]
    DeviceError { #[from] source: DeviceError },

    #[error("Failed to decode frame: {source}")]
    DecodeError { #[from] source: DecodeError },

    #[error("Invalid hex input: {input}")]
    InvalidHex { input: String },

    #[error("Weight {weight} does not fit in a frame")]
    WeightOutOfRange { weight: f32 },

    #[error("Failed to wait for ctrl-c: {source}")]
    Signal { source: std::io::Error },

    #[error("The scale session stopped unexpectedly")]
    SessionClosed,

    #[error("{message}")]
    Session { message: String },
}
