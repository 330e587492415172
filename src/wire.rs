//! Wire frame layout
//!
//! Every transfer starts with a fixed 16-byte little-endian header:
//!
//! ```text
//! u32 magic | u32 length | u32 cmd | u32 check (= !cmd)
//! ```
//!
//! Two magic values distinguish plaintext from cipher-transformed payloads.
//! A header whose `check` field is not the bitwise complement of `cmd` is
//! corrupt and the whole frame is discarded.

use bytes::{Buf, BufMut};

use crate::error::ProtocolError;

/// Marker for plaintext payloads
pub const MAGIC: u32 = 0x55aa55aa;
/// Marker for encrypted payloads
pub const MAGIC_ENCRYPTED: u32 = 0x55bb55bb;

/// Size of the frame header on the wire
pub const HEADER_LEN: usize = 16;

/// Command ids interpreted by the client; the rest pass through as opaque
pub mod cmd {
    pub const OPEN: u32 = 1;
    pub const PLUGGED: u32 = 2;
    pub const STATE: u32 = 3;
    pub const UNPLUGGED: u32 = 4;
    pub const TOUCH: u32 = 5;
    pub const VIDEO_DATA: u32 = 6;
    pub const AUDIO_DATA: u32 = 7;
    pub const CONTROL: u32 = 8;
    pub const APP_INFO: u32 = 10;
    pub const BLUETOOTH_INFO: u32 = 13;
    pub const WIFI_INFO: u32 = 14;
    pub const DEVICE_LIST: u32 = 18;
    pub const MANUFACTURER: u32 = 20;
    pub const JSON_CONTROL: u32 = 25;
    pub const MEDIA_INFO: u32 = 42;
    pub const SEND_FILE: u32 = 153;
    pub const DAYNIGHT: u32 = 162;
    pub const HEARTBEAT: u32 = 170;
    pub const VERSION: u32 = 204;
    pub const ENCRYPTION: u32 = 240;
}

/// Human-readable command name for diagnostics
pub fn cmd_name(id: u32) -> &'static str {
    match id {
        cmd::OPEN => "Open",
        cmd::PLUGGED => "Plugged",
        cmd::STATE => "State",
        cmd::UNPLUGGED => "Unplugged",
        cmd::TOUCH => "Touch",
        cmd::VIDEO_DATA => "Video",
        cmd::AUDIO_DATA => "Audio",
        cmd::CONTROL => "Control",
        cmd::APP_INFO => "AppInfo",
        cmd::BLUETOOTH_INFO => "BluetoothInfo",
        cmd::WIFI_INFO => "WifiInfo",
        cmd::DEVICE_LIST => "DeviceList",
        cmd::MANUFACTURER => "Manufacturer",
        cmd::JSON_CONTROL => "JsonControl",
        cmd::MEDIA_INFO => "MediaInfo",
        cmd::SEND_FILE => "SendFile",
        cmd::DAYNIGHT => "DayNight",
        cmd::HEARTBEAT => "Heartbeat",
        cmd::VERSION => "Version",
        cmd::ENCRYPTION => "Encryption",
        _ => "Unknown",
    }
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u32,
    pub length: u32,
    pub cmd: u32,
}

impl FrameHeader {
    /// Header for a plaintext frame
    pub fn plain(cmd: u32, length: u32) -> Self {
        Self {
            magic: MAGIC,
            length,
            cmd,
        }
    }

    /// Header for a cipher-transformed frame
    pub fn encrypted(cmd: u32, length: u32) -> Self {
        Self {
            magic: MAGIC_ENCRYPTED,
            length,
            cmd,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.magic == MAGIC_ENCRYPTED
    }

    /// Serialize to the 16-byte wire layout
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        let mut dst = &mut buf[..];
        dst.put_u32_le(self.magic);
        dst.put_u32_le(self.length);
        dst.put_u32_le(self.cmd);
        dst.put_u32_le(!self.cmd);
        buf
    }

    /// Parse and validate a header read off the wire
    pub fn decode(raw: &[u8]) -> Result<Self, ProtocolError> {
        if raw.len() < HEADER_LEN {
            return Err(ProtocolError::ShortHeader(raw.len()));
        }

        let mut src = raw;
        let magic = src.get_u32_le();
        let length = src.get_u32_le();
        let cmd = src.get_u32_le();
        let check = src.get_u32_le();

        if magic != MAGIC && magic != MAGIC_ENCRYPTED {
            return Err(ProtocolError::BadMagic(magic));
        }
        if check != !cmd {
            return Err(ProtocolError::TypecheckMismatch { cmd, check });
        }

        Ok(Self { magic, length, cmd })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = FrameHeader::plain(cmd::VIDEO_DATA, 1024);
        let raw = header.encode();
        assert_eq!(FrameHeader::decode(&raw).unwrap(), header);

        let header = FrameHeader::encrypted(cmd::ENCRYPTION, 4);
        let raw = header.encode();
        let decoded = FrameHeader::decode(&raw).unwrap();
        assert!(decoded.is_encrypted());
        assert_eq!(decoded.cmd, cmd::ENCRYPTION);
    }

    #[test]
    fn wire_layout_is_little_endian() {
        let raw = FrameHeader::plain(cmd::HEARTBEAT, 0).encode();
        assert_eq!(&raw[0..4], &[0xaa, 0x55, 0xaa, 0x55]);
        assert_eq!(&raw[4..8], &[0, 0, 0, 0]);
        assert_eq!(&raw[8..12], &[170, 0, 0, 0]);
        assert_eq!(&raw[12..16], &[85, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn typecheck_mismatch_rejected() {
        let mut raw = FrameHeader::plain(cmd::TOUCH, 16).encode();
        raw[12] ^= 0x01;
        assert!(matches!(
            FrameHeader::decode(&raw),
            Err(ProtocolError::TypecheckMismatch { cmd: 5, .. })
        ));
    }

    #[test]
    fn bad_magic_rejected() {
        let mut raw = FrameHeader::plain(cmd::OPEN, 0).encode();
        raw[0] = 0x00;
        assert!(matches!(
            FrameHeader::decode(&raw),
            Err(ProtocolError::BadMagic(_))
        ));
    }

    #[test]
    fn short_header_rejected() {
        assert!(matches!(
            FrameHeader::decode(&[0u8; 8]),
            Err(ProtocolError::ShortHeader(8))
        ));
    }
}
