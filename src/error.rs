//! Error types for the dongle client

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("Cipher error: {0}")]
    Cipher(#[from] CipherError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// USB link errors
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Device {vendor_id:04x}:{product_id:04x} not found")]
    DeviceNotFound { vendor_id: u16, product_id: u16 },

    #[error("USB error during {stage}: {source}")]
    Usb {
        stage: &'static str,
        #[source]
        source: rusb::Error,
    },

    #[error("No bulk endpoints in interface descriptor")]
    MissingEndpoints,

    #[error("Device disconnected")]
    Disconnected,

    #[error("Link not established")]
    NotLinked,
}

impl LinkError {
    pub(crate) fn usb(stage: &'static str, source: rusb::Error) -> Self {
        Self::Usb { stage, source }
    }
}

/// Session cipher errors
#[derive(Error, Debug)]
pub enum CipherError {
    #[error("Base key must be exactly {expected} bytes, got {actual}")]
    BadKeyLength { expected: usize, actual: usize },
}

/// Frame and command layer errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Header magic {0:#010x} is not a known frame marker")]
    BadMagic(u32),

    #[error("Header typecheck mismatch: cmd {cmd:#x}, check {check:#x}")]
    TypecheckMismatch { cmd: u32, check: u32 },

    #[error("Truncated header: {0} bytes")]
    ShortHeader(usize),

    #[error("Payload too short for command {cmd}: {length} bytes")]
    ShortPayload { cmd: u32, length: usize },

    #[error("Virtual file value too long: {0} bytes")]
    FileValueTooLong(usize),
}

/// Audio subsystem errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("No output device available")]
    NoOutputDevice,

    #[error("No input device available")]
    NoInputDevice,

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0} Hz / {1} ch")]
    UnsupportedFormat(u32, u16),
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
