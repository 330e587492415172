//! Audio subsystem: pulled playback per logical channel, microphone capture

pub mod capture;
pub mod output;

pub use capture::{AudioSink, Recorder};
pub use output::AudioOutput;
