//! Command layer above the USB link
//!
//! Classifies inbound frames and fans them out: video segments to the video
//! queue, audio segments to the channel queues, plug/control events to the
//! UI hook. Outbound it builds the binary payloads for touch, key, virtual
//! file and microphone traffic, and runs the one-shot encryption handshake
//! after every link-up.
//!
//! Ownership rule: an inbound buffer either moves into exactly one queue or
//! is dropped before dispatch returns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::{Mutex, RwLock};

use crate::audio::capture::{AudioSink, Recorder};
use crate::config::Config;
use crate::constants;
use crate::error::{Error, ProtocolError, Result};
use crate::link::{LinkEvents, LinkState, LinkTransport};
use crate::queue::{BoundedQueue, Segment};
use crate::wire::{cmd, cmd_name};

/// Number of demultiplexed audio channels
pub const AUDIO_CHANNEL_COUNT: usize = 3;

/// Control codes carried in 4-byte `Control` frames
pub mod control {
    pub const START_RECORDING: i32 = 1;
    pub const STOP_RECORDING: i32 = 2;
}

/// Hooks for the UI/input layer. All methods default to no-ops.
pub trait SessionEvents: Send + Sync {
    /// Phone plugged into or removed from the dongle
    fn on_phone(&self, _plugged: bool) {}

    /// Link connectivity changed
    fn on_state(&self, _state: LinkState) {}

    /// Control frame not handled internally
    fn on_control(&self, _code: i32) {}
}

/// No-op event sink for headless use
pub struct NullEvents;

impl SessionEvents for NullEvents {}

/// The command-routing layer; owns the transport and all demux queues.
pub struct SessionProtocol {
    transport: LinkTransport,
    config: Config,
    events: Arc<dyn SessionEvents>,
    phone_plugged: AtomicBool,
    recorder: Mutex<Recorder>,
    self_ref: RwLock<Weak<SessionProtocol>>,

    /// Compressed video segments, 20-byte sub-header skipped
    pub video: Arc<BoundedQueue<Segment>>,
    /// Raw PCM segments per channel, 12-byte sub-header skipped
    pub audio: [Arc<BoundedQueue<Segment>>; AUDIO_CHANNEL_COUNT],
}

impl SessionProtocol {
    pub fn new(config: Config, events: Arc<dyn SessionEvents>) -> Result<Arc<Self>> {
        let transport = LinkTransport::new(&config)?;
        let video = Arc::new(BoundedQueue::new(config.video_queue));
        let audio = [
            Arc::new(BoundedQueue::new(config.audio_queue)),
            Arc::new(BoundedQueue::new(config.audio_queue)),
            Arc::new(BoundedQueue::new(config.audio_queue)),
        ];
        let recorder = Mutex::new(Recorder::new(&config));

        let session = Arc::new(Self {
            transport,
            config,
            events,
            phone_plugged: AtomicBool::new(false),
            recorder,
            self_ref: RwLock::new(Weak::new()),
            video,
            audio,
        });
        *session.self_ref.write() = Arc::downgrade(&session);
        Ok(session)
    }

    /// Bring the link up; returns immediately, the transport threads own the
    /// connection lifecycle.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        self.transport.start(self.clone() as Arc<dyn LinkEvents>)
    }

    pub fn stop(&self) {
        self.recorder.lock().stop();
        self.transport.stop();
        self.video.notify_all();
        for queue in &self.audio {
            queue.notify_all();
        }
    }

    pub fn phone_plugged(&self) -> bool {
        self.phone_plugged.load(Ordering::Acquire)
    }

    pub fn state(&self) -> LinkState {
        self.transport.state()
    }

    // ---- outbound -------------------------------------------------------

    /// Key press/release as carried in a control frame
    pub fn send_key(&self, code: u32) {
        tracing::debug!(code, "send key");
        self.send(cmd::CONTROL, true, &code.to_le_bytes());
    }

    /// Absolute pointer press or release at normalized coordinates
    pub fn send_click(&self, x: f32, y: f32, down: bool) {
        let action = if down {
            touch::ACTION_DOWN
        } else {
            touch::ACTION_UP
        };
        self.send(cmd::TOUCH, true, &touch_payload(action, x, y));
    }

    /// Pointer move at normalized coordinates
    pub fn send_move(&self, x: f32, y: f32) {
        self.send(cmd::TOUCH, true, &touch_payload(touch::ACTION_MOVE, x, y));
    }

    /// Write a small virtual file on the dongle
    pub fn send_file(&self, name: &str, content: &[u8]) {
        self.send(cmd::SEND_FILE, true, &file_payload(name, content));
    }

    /// Virtual file holding one little-endian integer
    pub fn send_file_int(&self, name: &str, value: u32) {
        self.send_file(name, &value.to_le_bytes());
    }

    /// Virtual file holding a short ASCII value (16 bytes max, no NUL)
    pub fn send_file_str(&self, name: &str, value: &str) -> Result<()> {
        if value.len() > 16 {
            return Err(Error::Protocol(ProtocolError::FileValueTooLong(
                value.len(),
            )));
        }
        self.send_file(name, value.as_bytes());
        Ok(())
    }

    fn send(&self, command: u32, encrypt: bool, payload: &[u8]) {
        if let Err(e) = self.transport.send(command, encrypt, payload) {
            tracing::debug!(command = cmd_name(command), error = %e, "send skipped");
        }
    }

    /// Offer the session cipher seed so the peer can derive the same key
    fn send_encryption_offer(&self) {
        let seed = self.transport.cipher_seed();
        tracing::info!("offering encryption handshake");
        self.send(cmd::ENCRYPTION, false, &seed.to_le_bytes());
    }

    /// Negotiated geometry plus protocol-fixed constants
    fn send_init(&self) {
        let mut buf = BytesMut::with_capacity(28);
        buf.put_u32_le(self.config.width);
        buf.put_u32_le(self.config.height);
        buf.put_u32_le(self.config.fps);
        buf.put_u32_le(5);
        buf.put_u32_le(49152);
        buf.put_u32_le(2);
        buf.put_u32_le(2);
        self.send(cmd::OPEN, true, &buf);
    }

    /// Fire-and-forget device environment batch
    fn send_device_config(&self) {
        self.send_file_int("/tmp/night_mode", self.config.night_mode);
        self.send_file_int(
            "/tmp/hand_drive_mode",
            if self.config.left_hand_drive { 0 } else { 1 },
        );
        self.send_file_int(
            "/tmp/charge_mode",
            if self.config.weak_charge { 1 } else { 0 },
        );
        let box_name = self.config.box_name.clone();
        if let Err(e) = self.send_file_str("/etc/box_name", &box_name) {
            tracing::warn!(error = %e, "box name not sent");
        }
        if self.config.dpi > 0 {
            self.send_file_int("/tmp/screen_dpi", self.config.dpi);
        }
    }

    // ---- inbound --------------------------------------------------------

    fn on_phone_plugged(&self, plugged: bool) {
        // Repeat announcements are idempotent; only edges propagate
        if self.phone_plugged.swap(plugged, Ordering::AcqRel) == plugged {
            return;
        }
        tracing::info!(plugged, "phone");
        self.transport.phone_state(plugged);
        self.events.on_phone(plugged);
    }

    fn on_video(&self, length: usize, data: Vec<u8>) {
        if length <= constants::VIDEO_HEADER_SKIP {
            return;
        }
        let segment = Segment::new(data, constants::VIDEO_HEADER_SKIP);
        if !self.video.push_discard(segment) {
            tracing::trace!("video queue full, frame dropped");
        }
    }

    fn on_audio(&self, length: usize, data: Vec<u8>) {
        if length <= constants::AUDIO_HEADER_SKIP {
            tracing::debug!(length, "short audio frame dropped");
            return;
        }

        let mut selector = &data[constants::AUDIO_CHANNEL_OFFSET..];
        let channel = selector.get_i32_le();
        match self.config.audio_queue_index(channel) {
            Some(index) if index < AUDIO_CHANNEL_COUNT => {
                let segment = Segment::new(data, constants::AUDIO_HEADER_SKIP);
                if !self.audio[index].push_discard(segment) {
                    tracing::trace!(channel, "audio queue full, segment dropped");
                }
            }
            _ => {
                tracing::debug!(channel, length, "unmapped audio channel dropped");
            }
        }
    }

    fn on_control_frame(&self, data: &[u8]) {
        if data.len() < 4 {
            tracing::debug!(length = data.len(), "short control frame dropped");
            return;
        }
        let code = (&data[..4]).get_i32_le();
        tracing::debug!(code, "control");

        match code {
            control::START_RECORDING => {
                if let Some(session) = self.self_ref.read().upgrade() {
                    self.recorder.lock().start(session as Arc<dyn AudioSink>);
                }
            }
            control::STOP_RECORDING => {
                self.recorder.lock().stop();
            }
            _ => {}
        }
        self.events.on_control(code);
    }
}

impl LinkEvents for SessionProtocol {
    fn on_frame(&self, command: u32, length: usize, data: Vec<u8>) {
        match command {
            cmd::PLUGGED => self.on_phone_plugged(true),
            cmd::UNPLUGGED => self.on_phone_plugged(false),
            cmd::VIDEO_DATA => self.on_video(length, data),
            cmd::AUDIO_DATA => self.on_audio(length, data),
            cmd::CONTROL => self.on_control_frame(&data),
            cmd::ENCRYPTION if length == 0 => {
                self.transport.set_encryption(true);
            }
            _ => {
                tracing::debug!(
                    command = cmd_name(command),
                    id = command,
                    length,
                    "unhandled frame"
                );
            }
        }
        // Anything not moved into a queue above dropped here with `data`
    }

    fn on_device(&self, connected: bool) {
        tracing::info!(connected, "device");
        if connected {
            if self.config.encryption {
                self.send_encryption_offer();
            }
            self.send_init();
            self.send_device_config();
        } else {
            self.on_phone_plugged(false);
            self.recorder.lock().stop();
        }
    }

    fn on_state(&self, state: LinkState) {
        self.events.on_state(state);
    }
}

impl AudioSink for SessionProtocol {
    /// Upstream microphone chunk, already carrying its 12-byte sub-header
    fn send_audio(&self, chunk: &[u8]) {
        self.send(cmd::AUDIO_DATA, true, chunk);
    }
}

impl Drop for SessionProtocol {
    fn drop(&mut self) {
        self.stop();
    }
}

mod touch {
    pub const ACTION_DOWN: u32 = 14;
    pub const ACTION_MOVE: u32 = 15;
    pub const ACTION_UP: u32 = 16;
}

/// Pointer event payload: subtype, then 10000x fixed-point coordinates
fn touch_payload(action: u32, x: f32, y: f32) -> [u8; 16] {
    let mut buf = [0u8; 16];
    let mut dst = &mut buf[..];
    dst.put_u32_le(action);
    dst.put_i32_le((x * 10000.0) as i32);
    dst.put_i32_le((y * 10000.0) as i32);
    dst.put_u32_le(0);
    buf
}

/// Virtual file payload: NUL-terminated name with its length, then content
fn file_payload(name: &str, content: &[u8]) -> Vec<u8> {
    let name_len = name.len() + 1;
    let mut buf = BytesMut::with_capacity(4 + name_len + 4 + content.len());
    buf.put_u32_le(name_len as u32);
    buf.put_slice(name.as_bytes());
    buf.put_u8(0);
    buf.put_u32_le(content.len() as u32);
    buf.put_slice(content);
    buf.to_vec()
}
