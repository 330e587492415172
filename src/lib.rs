//! # carlink
//!
//! Client side of the USB "car-dongle" tethering protocol used by
//! phone-mirroring accessories.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           USB dongle                             │
//! └────────────────────────────────┬─────────────────────────────────┘
//!                                  │ bulk IN / bulk OUT
//! ┌────────────────────────────────┴─────────────────────────────────┐
//! │  LinkTransport (link)                                            │
//! │    writer loop: connect, heartbeat, reconnect backoff            │
//! │    reader loop: header + payload, decrypt, typecheck             │
//! └────────────────────────────────┬─────────────────────────────────┘
//!                                  │ (cmd, payload)
//! ┌────────────────────────────────┴─────────────────────────────────┐
//! │  SessionProtocol (session)                                       │
//! │    dispatch by command id, encryption handshake, device config   │
//! └───────┬──────────────────┬──────────────────┬────────────────────┘
//!         │ video queue      │ audio queues     │ touch/key/file out
//!         ▼                  ▼                  ▼
//!   decode thread      AudioOutput ×3     LinkTransport::send
//!         │            (cpal pull callback, fade/duck)
//!         ▼
//!   triple frame buffer ──▶ render consumer
//! ```
//!
//! All hops between threads go through [`queue::BoundedQueue`]; decoded video
//! frames are handed to the renderer through the lock-free triple buffer in
//! [`video`].

pub mod audio;
pub mod cipher;
pub mod config;
pub mod error;
pub mod link;
pub mod queue;
pub mod session;
pub mod video;
pub mod wire;

pub use config::Config;
pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default dongle vendor id
    pub const DEFAULT_VENDOR_ID: u16 = 4884;

    /// Default dongle product id
    pub const DEFAULT_PRODUCT_ID: u16 = 5408;

    /// Shared base key the cipher key schedule rotates
    pub const ENCRYPTION_BASE_KEY: &[u8; 16] = b"SkBRDy3gmrw1ieH0";

    /// Bulk read timeout for the header/payload transfers
    pub const READ_TIMEOUT_MS: u64 = 3000;

    /// Interval between outbound heartbeats while linked
    pub const HEARTBEAT_INTERVAL_MS: u64 = 2000;

    /// Backoff before retrying link establishment
    pub const RECONNECT_DELAY_MS: u64 = 1000;

    /// Consecutive downgrade signals required before Error/NoDevice latch
    pub const STATE_LATCH_THRESHOLD: u8 = 10;

    /// Sub-header bytes skipped at the front of each video frame payload
    pub const VIDEO_HEADER_SKIP: usize = 20;

    /// Sub-header bytes skipped at the front of each audio frame payload
    pub const AUDIO_HEADER_SKIP: usize = 12;

    /// Raw offset of the audio channel selector inside the sub-header
    pub const AUDIO_CHANNEL_OFFSET: usize = 8;

    /// Default capacity of the video segment queue
    pub const VIDEO_QUEUE_CAPACITY: usize = 32;

    /// Default capacity of each audio segment queue
    pub const AUDIO_QUEUE_CAPACITY: usize = 16;

    /// Default capacity of the microphone chunk queue
    pub const CAPTURE_QUEUE_CAPACITY: usize = 8;
}
