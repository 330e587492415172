//! Headless dongle monitor
//!
//! Brings the link up with default configuration, plays all three audio
//! channels and logs link/video activity once per second. Useful for
//! soak-testing a dongle without the UI stack.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use carlink::audio::AudioOutput;
use carlink::link::LinkState;
use carlink::session::{SessionEvents, SessionProtocol};
use carlink::video::{triple_buffer, VideoFrame};
use carlink::Config;

struct Monitor;

impl SessionEvents for Monitor {
    fn on_phone(&self, plugged: bool) {
        tracing::info!(plugged, "phone");
    }

    fn on_state(&self, state: LinkState) {
        tracing::info!(?state, "link");
    }

    fn on_control(&self, code: i32) {
        tracing::info!(code, "control");
    }
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::default();
    tracing::info!(
        vendor = config.vendor_id,
        product = config.product_id,
        width = config.width,
        height = config.height,
        "starting dongle monitor"
    );

    let session = SessionProtocol::new(config.clone(), Arc::new(Monitor))?;
    session.start()?;

    // Channel 0 carries media; voice and navigation duck it while playing
    let media = AudioOutput::new(&config);
    let voice = AudioOutput::new(&config);
    let navigation = AudioOutput::new(&config);
    media.start(session.audio[0].clone(), None);
    voice.start(session.audio[1].clone(), Some(&media));
    navigation.start(session.audio[2].clone(), Some(&media));

    // Stand-in for the decode thread: move compressed segments into the
    // triple buffer so the handoff path is exercised end to end.
    let frame_len = (config.width * config.height) as usize * 4;
    let (mut writer, mut reader) = triple_buffer([
        VideoFrame::new(config.width, config.height, frame_len),
        VideoFrame::new(config.width, config.height, frame_len),
        VideoFrame::new(config.width, config.height, frame_len),
    ]);

    let running = Arc::new(AtomicBool::new(true));
    let video_frames = Arc::new(AtomicU64::new(0));
    let video_bytes = Arc::new(AtomicU64::new(0));

    let _video = {
        let queue = session.video.clone();
        let running = running.clone();
        let frames = video_frames.clone();
        let bytes = video_bytes.clone();
        thread::Builder::new()
            .name("monitor-video".into())
            .spawn(move || {
                let mut next_id = 1u32;
                while running.load(Ordering::Acquire) {
                    if !queue.wait(&running, 0, Some(Duration::from_millis(500))) {
                        continue;
                    }
                    while let Some(segment) = queue.pop() {
                        let payload = segment.payload();
                        frames.fetch_add(1, Ordering::Relaxed);
                        bytes.fetch_add(payload.len() as u64, Ordering::Relaxed);

                        let frame = writer.slot(next_id);
                        frame.data.clear();
                        frame.data.extend_from_slice(payload);
                        writer.commit();
                        next_id = next_id.wrapping_add(1);
                    }
                }
            })?
    };

    // Report once per second until interrupted
    loop {
        thread::sleep(Duration::from_secs(1));
        let frames = video_frames.swap(0, Ordering::Relaxed);
        let bytes = video_bytes.swap(0, Ordering::Relaxed);
        let latest = reader.latest().map(|frame| frame.id());
        tracing::info!(
            state = ?session.state(),
            plugged = session.phone_plugged(),
            frames,
            bytes,
            ?latest,
            "stats"
        );
    }
}
