//! Microphone capture and upstream forwarding
//!
//! Started and stopped by dongle control codes while a call is active. A
//! capture thread owns the cpal input stream and pushes headed chunks into a
//! small bounded queue; an uplink thread drains that queue through
//! [`AudioSink`], which the session layer implements as encrypted audio
//! frames back to the dongle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, StreamConfig};

use crate::config::{AudioFormat, Config};
use crate::constants;
use crate::error::AudioError;
use crate::queue::{BoundedQueue, Segment};

/// Chunk sub-header ahead of the samples, mirroring the downstream audio
/// frame layout: format id, then reserved zeros
const CHUNK_HEADER_LEN: usize = 12;

const UPLINK_WAIT: Duration = Duration::from_millis(250);

/// Receiver for captured microphone chunks
pub trait AudioSink: Send + Sync {
    /// `chunk` is the complete upstream payload: 12-byte sub-header plus
    /// s16le samples
    fn send_audio(&self, chunk: &[u8]);
}

/// Microphone capture session
pub struct Recorder {
    format: AudioFormat,
    format_id: i32,
    queue: Arc<BoundedQueue<Segment>>,
    running: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl Recorder {
    pub fn new(config: &Config) -> Self {
        Self {
            format: config.capture_format,
            format_id: config.capture_format_id,
            queue: Arc::new(BoundedQueue::new(constants::CAPTURE_QUEUE_CAPACITY)),
            running: Arc::new(AtomicBool::new(false)),
            threads: Vec::new(),
        }
    }

    /// Begin capturing; chunks flow to `sink` until [`stop`](Self::stop).
    /// A missing or failing input device is logged and leaves the recorder
    /// idle rather than failing the session.
    pub fn start(&mut self, sink: Arc<dyn AudioSink>) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }

        let running = self.running.clone();
        let queue = self.queue.clone();
        let format = self.format;
        let format_id = self.format_id;
        let capture = thread::Builder::new()
            .name("mic-capture".into())
            .spawn(move || capture_loop(running, queue, format, format_id));

        let running = self.running.clone();
        let queue = self.queue.clone();
        let uplink = thread::Builder::new()
            .name("mic-uplink".into())
            .spawn(move || uplink_loop(running, queue, sink));

        for handle in [capture, uplink] {
            match handle {
                Ok(handle) => self.threads.push(handle),
                Err(e) => tracing::error!(error = %e, "failed to spawn recorder thread"),
            }
        }
    }

    /// Stop both threads and discard anything still queued
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.queue.notify_all();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        self.queue.clear();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_loop(
    running: Arc<AtomicBool>,
    queue: Arc<BoundedQueue<Segment>>,
    format: AudioFormat,
    format_id: i32,
) {
    let device = match cpal::default_host().default_input_device() {
        Some(device) => device,
        None => {
            tracing::warn!(error = %AudioError::NoInputDevice, "recording unavailable");
            return;
        }
    };
    let stream_config = StreamConfig {
        channels: format.channels,
        sample_rate: SampleRate(format.sample_rate),
        buffer_size: BufferSize::Default,
    };

    let callback_running = running.clone();
    let stream = device.build_input_stream(
        &stream_config,
        move |data: &[i16], _: &cpal::InputCallbackInfo| {
            if !callback_running.load(Ordering::Relaxed) {
                return;
            }
            // Full queue tail-drops the chunk; the uplink is behind
            queue.push_discard(Segment::new(chunk(format_id, data), 0));
        },
        |err| tracing::warn!(error = %err, "input stream error"),
        None,
    );

    match stream {
        Ok(stream) => {
            if let Err(e) = stream.play() {
                tracing::warn!(error = %e, "failed to start input stream");
                return;
            }
            while running.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(10));
            }
            // Stream drops here, releasing the device
        }
        Err(e) => tracing::warn!(error = %e, "failed to open input stream"),
    }
}

fn uplink_loop(running: Arc<AtomicBool>, queue: Arc<BoundedQueue<Segment>>, sink: Arc<dyn AudioSink>) {
    while running.load(Ordering::Acquire) {
        if !queue.wait(&running, 0, Some(UPLINK_WAIT)) {
            continue;
        }
        while let Some(segment) = queue.pop() {
            sink.send_audio(segment.raw());
        }
    }
}

fn chunk(format_id: i32, samples: &[i16]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(CHUNK_HEADER_LEN + samples.len() * 2);
    buf.extend_from_slice(&format_id.to_le_bytes());
    buf.resize(CHUNK_HEADER_LEN, 0);
    for sample in samples {
        buf.extend_from_slice(&sample.to_le_bytes());
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct CollectingSink {
        chunks: Mutex<Vec<Vec<u8>>>,
    }

    impl AudioSink for CollectingSink {
        fn send_audio(&self, chunk: &[u8]) {
            self.chunks.lock().push(chunk.to_vec());
        }
    }

    #[test]
    fn chunk_layout() {
        let buf = chunk(5, &[1, -2]);
        assert_eq!(buf.len(), 16);
        assert_eq!(&buf[..4], &5i32.to_le_bytes());
        assert_eq!(&buf[4..12], &[0u8; 8]);
        assert_eq!(&buf[12..14], &1i16.to_le_bytes());
        assert_eq!(&buf[14..16], &(-2i16).to_le_bytes());
    }

    #[test]
    fn uplink_forwards_queued_chunks() {
        let running = Arc::new(AtomicBool::new(true));
        let queue = Arc::new(BoundedQueue::new(4));
        let sink = Arc::new(CollectingSink {
            chunks: Mutex::new(Vec::new()),
        });

        let worker = {
            let running = running.clone();
            let queue = queue.clone();
            let sink = sink.clone() as Arc<dyn AudioSink>;
            thread::spawn(move || uplink_loop(running, queue, sink))
        };

        queue.push_discard(Segment::new(chunk(5, &[7, 8]), 0));
        queue.push_discard(Segment::new(chunk(5, &[9]), 0));
        thread::sleep(Duration::from_millis(50));

        running.store(false, Ordering::Release);
        queue.notify_all();
        worker.join().unwrap();

        let chunks = sink.chunks.lock();
        assert_eq!(chunks.len(), 2);
        assert_eq!(&chunks[0][12..], &[7, 0, 8, 0]);
        assert_eq!(&chunks[1][12..], &[9, 0]);
    }

    #[test]
    fn stop_without_start_is_a_no_op() {
        let mut recorder = Recorder::new(&Config::default());
        recorder.stop();
        assert!(!recorder.is_running());
    }
}
