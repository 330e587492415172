//! Runtime configuration
//!
//! One `Config` is built at startup and passed by reference into each component
//! constructor. Nothing in here is global; file parsing belongs to the caller.

use crate::constants;

/// Sample rate / channel count pair for one audio stream format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    pub const fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }
}

/// Static configuration for the whole client
#[derive(Debug, Clone)]
pub struct Config {
    /// USB vendor id of the dongle
    pub vendor_id: u16,
    /// USB product id of the dongle
    pub product_id: u16,

    /// Negotiated video width in pixels
    pub width: u32,
    /// Negotiated video height in pixels
    pub height: u32,
    /// Negotiated video frame rate
    pub fps: u32,
    /// Display density sent to the dongle when non-zero
    pub dpi: u32,

    /// Offer the encryption handshake after link-up
    pub encryption: bool,

    /// 0 = day, 1 = night, 2 = automatic
    pub night_mode: u32,
    /// Steering side reported to the phone
    pub left_hand_drive: bool,
    /// Reduce charging current on weak ports
    pub weak_charge: bool,
    /// Accessory name reported to the phone
    pub box_name: String,

    /// Scratch bytes appended past the end of each video payload; the decoder
    /// reads past the logical end
    pub video_padding: usize,

    /// Capacity of the video segment queue
    pub video_queue: usize,
    /// Capacity of each audio segment queue
    pub audio_queue: usize,

    /// Volume floor a ducked audio channel fades toward
    pub audio_fade_floor: f32,
    /// Consecutive empty pull callbacks before a stuck backlog is flushed
    pub audio_underflow_limit: u32,

    /// Wire format id to playback format; unknown ids use `audio_fallback`
    pub audio_formats: Vec<(i32, AudioFormat)>,
    /// Playback format for format ids missing from the table
    pub audio_fallback: AudioFormat,
    /// Wire channel selector to audio queue index
    pub audio_channels: Vec<(i32, usize)>,

    /// Microphone capture format for the upstream path
    pub capture_format: AudioFormat,
    /// Wire format id stamped on outbound microphone chunks
    pub capture_format_id: i32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vendor_id: constants::DEFAULT_VENDOR_ID,
            product_id: constants::DEFAULT_PRODUCT_ID,
            width: 720,
            height: 576,
            fps: 50,
            dpi: 0,
            encryption: false,
            night_mode: 0,
            left_hand_drive: true,
            weak_charge: true,
            box_name: "CarPlay".to_string(),
            video_padding: 64,
            video_queue: constants::VIDEO_QUEUE_CAPACITY,
            audio_queue: constants::AUDIO_QUEUE_CAPACITY,
            audio_fade_floor: 0.3,
            audio_underflow_limit: 16,
            audio_formats: vec![
                (3, AudioFormat::new(8000, 1)),
                (4, AudioFormat::new(48000, 2)),
                (5, AudioFormat::new(16000, 1)),
                (6, AudioFormat::new(24000, 1)),
                (7, AudioFormat::new(16000, 2)),
            ],
            audio_fallback: AudioFormat::new(44100, 2),
            audio_channels: vec![(0, 0), (1, 1), (2, 2)],
            capture_format: AudioFormat::new(16000, 1),
            capture_format_id: 5,
        }
    }
}

impl Config {
    /// Look up the playback format for a wire format id
    pub fn audio_format(&self, id: i32) -> AudioFormat {
        self.audio_formats
            .iter()
            .find(|(fid, _)| *fid == id)
            .map(|(_, f)| *f)
            .unwrap_or(self.audio_fallback)
    }

    /// Map a wire channel selector to an audio queue index
    pub fn audio_queue_index(&self, channel: i32) -> Option<usize> {
        self.audio_channels
            .iter()
            .find(|(ch, _)| *ch == channel)
            .map(|(_, idx)| *idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_table_lookup() {
        let config = Config::default();
        assert_eq!(config.audio_format(4), AudioFormat::new(48000, 2));
        assert_eq!(config.audio_format(5), AudioFormat::new(16000, 1));
        // Unknown ids fall back
        assert_eq!(config.audio_format(99), AudioFormat::new(44100, 2));
    }

    #[test]
    fn channel_map_is_configuration() {
        let mut config = Config::default();
        assert_eq!(config.audio_queue_index(1), Some(1));
        assert_eq!(config.audio_queue_index(7), None);

        // Two-queue protocol variant: selectors 1/2 share the aux queue
        config.audio_channels = vec![(0, 0), (1, 1), (2, 1)];
        assert_eq!(config.audio_queue_index(2), Some(1));
    }
}
