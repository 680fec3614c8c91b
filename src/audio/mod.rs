//! # Audio Processing Module
//!
//! Everything that looks at raw client audio before it reaches the recognizer.
//!
//! ## Key Components:
//! - **pcm**: 16-bit little-endian sample decoding, frame energy, WAV container
//! - **vad**: energy-based turn detection with a silence timeout
//! - **buffer**: per-session accumulator with partial and final flushes
//!
//! ## Audio Format Requirements:
//! - **Sample Rate**: configurable, 16kHz by default
//! - **Bit Depth**: 16-bit PCM
//! - **Channels**: Mono by default
//! - **Encoding**: Little-endian signed integers

pub mod buffer;
pub mod pcm;
pub mod vad;

pub use buffer::AudioAccumulator;
pub use vad::{TurnDetector, TurnEvent};
