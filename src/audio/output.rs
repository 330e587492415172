//! Pulled audio playback
//!
//! One `AudioOutput` per logical audio channel. A management thread watches
//! the channel's segment queue and opens a cpal output stream sized for the
//! format id carried in the head segment's sub-header; it reopens the device
//! only when that format actually changes. The platform audio subsystem then
//! pulls samples through the stream callback, which drains segments across
//! item boundaries, zero-fills on underflow and applies the volume/fade
//! ramp. A voice channel can duck a peer channel while it is audibly
//! playing.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, StreamConfig};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use crate::config::{AudioFormat, Config};
use crate::error::AudioError;
use crate::queue::{BoundedQueue, Segment};

const OPEN_RETRY_DELAY: Duration = Duration::from_millis(250);
const DATA_WAIT: Duration = Duration::from_millis(500);
const PARK_INTERVAL: Duration = Duration::from_millis(500);

/// Per-sample gain step for the fade ramp. A full 1.0 ↔ 0.3 swing spans
/// 7000 samples, under half a second at the slowest configured rate.
const FADE_STEP: f32 = 0.0001;

/// State shared between the handle, the management thread and the stream
/// callback.
struct Shared {
    active: AtomicBool,
    fading: AtomicBool,
    /// User volume as f32 bits, 0.0..=1.0
    volume: AtomicU32,
    /// Set by the callback when the head-of-queue format no longer matches
    /// the open device
    reconfigure: AtomicBool,

    park_lock: Mutex<()>,
    park_cv: Condvar,
}

impl Shared {
    fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            fading: AtomicBool::new(false),
            volume: AtomicU32::new(1.0f32.to_bits()),
            reconfigure: AtomicBool::new(false),
            park_lock: Mutex::new(()),
            park_cv: Condvar::new(),
        }
    }

    fn wake(&self) {
        let _guard = self.park_lock.lock();
        self.park_cv.notify_all();
    }
}

/// Playback side of one audio channel queue
pub struct AudioOutput {
    config: Config,
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl AudioOutput {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
            shared: Arc::new(Shared::new()),
            thread: Mutex::new(None),
        }
    }

    /// Spawn the management thread draining `queue`. While this channel is
    /// audibly playing it fades `duck` down; `duck` recovers when this
    /// channel goes quiet.
    pub fn start(&self, queue: Arc<BoundedQueue<Segment>>, duck: Option<&AudioOutput>) {
        if self.shared.active.swap(true, Ordering::AcqRel) {
            return;
        }

        let shared = self.shared.clone();
        let config = self.config.clone();
        let duck = duck.map(|peer| Arc::downgrade(&peer.shared));
        let handle = thread::Builder::new()
            .name("audio-out".into())
            .spawn(move || run(shared, config, queue, duck));
        match handle {
            Ok(handle) => *self.thread.lock() = Some(handle),
            Err(e) => {
                tracing::error!(error = %e, "failed to spawn audio output thread");
                self.shared.active.store(false, Ordering::Release);
            }
        }
    }

    /// Tear down the stream and join the management thread
    pub fn stop(&self) {
        self.shared.active.store(false, Ordering::Release);
        self.shared.wake();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }

    /// Ramp toward the fade floor while true, back to full gain otherwise
    pub fn set_fade(&self, fading: bool) {
        self.shared.fading.store(fading, Ordering::Relaxed);
    }

    pub fn set_volume(&self, volume: f32) {
        self.shared
            .volume
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.shared.volume.load(Ordering::Relaxed))
    }
}

impl Drop for AudioOutput {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    shared: Arc<Shared>,
    config: Config,
    queue: Arc<BoundedQueue<Segment>>,
    duck: Option<Weak<Shared>>,
) {
    while shared.active.load(Ordering::Acquire) {
        if !queue.wait(&shared.active, 0, Some(DATA_WAIT)) {
            continue;
        }
        // The head segment decides the device configuration
        let format = match queue.peek_with(|s| s.int_at(0).unwrap_or(-1)) {
            Some(id) => config.audio_format(id),
            None => continue,
        };
        shared.reconfigure.store(false, Ordering::Release);

        let (error_tx, error_rx) = bounded::<AudioError>(4);
        let stream = match open_stream(&shared, &config, &queue, &duck, format, error_tx) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(error = %e, "audio device open failed, retrying");
                pause(&shared, OPEN_RETRY_DELAY);
                continue;
            }
        };
        if let Err(e) = stream.play() {
            tracing::warn!(error = %e, "audio stream start failed, retrying");
            drop(stream);
            pause(&shared, OPEN_RETRY_DELAY);
            continue;
        }
        tracing::info!(
            rate = format.sample_rate,
            channels = format.channels,
            "audio output configured"
        );

        // Park until the callback asks for a different format, the stream
        // dies, or we shut down; the device keeps pulling in the meantime.
        park(&shared, &error_rx);
        drop(stream);
        // Callback state is torn down with the stream
    }
}

fn park(shared: &Shared, errors: &Receiver<AudioError>) {
    let mut guard = shared.park_lock.lock();
    while shared.active.load(Ordering::Acquire) && !shared.reconfigure.load(Ordering::Acquire) {
        if let Ok(e) = errors.try_recv() {
            tracing::warn!(error = %e, "audio stream failed, reopening");
            return;
        }
        let _ = shared.park_cv.wait_for(&mut guard, PARK_INTERVAL);
    }
}

fn open_stream(
    shared: &Arc<Shared>,
    config: &Config,
    queue: &Arc<BoundedQueue<Segment>>,
    duck: &Option<Weak<Shared>>,
    format: AudioFormat,
    error_tx: Sender<AudioError>,
) -> Result<cpal::Stream, AudioError> {
    let device = cpal::default_host()
        .default_output_device()
        .ok_or(AudioError::NoOutputDevice)?;
    let stream_config = StreamConfig {
        channels: format.channels,
        sample_rate: SampleRate(format.sample_rate),
        buffer_size: BufferSize::Default,
    };

    let mut drainer = Drainer {
        queue: queue.clone(),
        shared: shared.clone(),
        duck: duck.clone(),
        config: config.clone(),
        format,
        carry: None,
        gain: 1.0,
        empty_streak: 0,
    };
    device
        .build_output_stream(
            &stream_config,
            move |out: &mut [i16], _: &cpal::OutputCallbackInfo| drainer.fill(out),
            move |err| {
                let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
            },
            None,
        )
        .map_err(|e| AudioError::StreamError(e.to_string()))
}

/// Interruptible delay; returns early on `wake`
fn pause(shared: &Shared, duration: Duration) {
    let mut guard = shared.park_lock.lock();
    if shared.active.load(Ordering::Acquire) {
        let _ = shared.park_cv.wait_for(&mut guard, duration);
    }
}

/// Callback-side state: drains the queue into the device's sample buffer.
///
/// Lives inside the stream closure, so one instance exists per open device
/// and dies with it on reconfiguration.
struct Drainer {
    queue: Arc<BoundedQueue<Segment>>,
    shared: Arc<Shared>,
    duck: Option<Weak<Shared>>,
    config: Config,
    /// Format the open device was configured for
    format: AudioFormat,
    /// Partially consumed segment and its byte position
    carry: Option<(Segment, usize)>,
    gain: f32,
    empty_streak: u32,
}

impl Drainer {
    fn fill(&mut self, out: &mut [i16]) {
        let target = if self.shared.fading.load(Ordering::Relaxed) {
            self.config.audio_fade_floor
        } else {
            1.0
        };
        let volume = f32::from_bits(self.shared.volume.load(Ordering::Relaxed));

        let mut filled = 0usize;
        let mut played = false;
        while filled < out.len() {
            let (seg, mut consumed) = match self.carry.take() {
                Some(carry) => carry,
                None => match self.next_segment() {
                    Some(seg) => (seg, 0),
                    None => break,
                },
            };

            let payload = seg.payload();
            while consumed + 2 <= payload.len() && filled < out.len() {
                let sample = i16::from_le_bytes([payload[consumed], payload[consumed + 1]]);
                self.step_gain(target);
                out[filled] = (f32::from(sample) * self.gain * volume) as i16;
                filled += 1;
                consumed += 2;
            }
            played = true;
            if consumed + 2 <= payload.len() {
                self.carry = Some((seg, consumed));
            }
        }

        if filled < out.len() {
            out[filled..].fill(0);
        }

        if played {
            self.empty_streak = 0;
        } else {
            // Underflow. After enough consecutive dry callbacks the backlog
            // (if any) is stale; drop it instead of playing it late.
            self.empty_streak += 1;
            if self.empty_streak >= self.config.audio_underflow_limit {
                self.queue.clear();
                self.empty_streak = 0;
            }
            self.shared.wake();
        }
        self.set_peer_fade(played);
    }

    /// Pop the next segment, unless its format no longer matches the open
    /// device; then signal the management thread instead.
    fn next_segment(&mut self) -> Option<Segment> {
        let head = self.queue.peek_with(|s| s.int_at(0).unwrap_or(-1))?;
        if self.config.audio_format(head) != self.format {
            if !self.shared.reconfigure.swap(true, Ordering::AcqRel) {
                self.shared.wake();
            }
            return None;
        }
        self.queue.pop()
    }

    fn step_gain(&mut self, target: f32) {
        if self.gain < target {
            self.gain = (self.gain + FADE_STEP).min(target);
        } else if self.gain > target {
            self.gain = (self.gain - FADE_STEP).max(target);
        }
    }

    fn set_peer_fade(&self, playing: bool) {
        if let Some(peer) = self.duck.as_ref().and_then(Weak::upgrade) {
            peer.fading.store(playing, Ordering::Relaxed);
        }
    }
}
