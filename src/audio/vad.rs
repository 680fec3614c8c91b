//! # Turn Detection
//!
//! Energy-based voice activity detection with a silence hangover.
//!
//! ## State Machine:
//! Two states (Silent, Speaking) and one timed edge:
//! - Silent → Speaking on the first speech frame (emits `SpeechStarted`)
//! - Speaking stays Speaking on speech frames (pending silence is cleared)
//! - Speaking + silence frame starts the silence clock if it is not running
//! - Speaking → Silent once the silence clock reaches the timeout (emits `TurnComplete`)
//! - Silence while Silent does nothing
//!
//! The detector is re-evaluated on every incoming frame rather than on a timer,
//! so frame arrival cadence drives the wall-clock comparison. Callers pass `now`
//! explicitly.

use crate::audio::pcm;
use std::time::{Duration, Instant};

/// Transition emitted by [`TurnDetector::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnEvent {
    SpeechStarted,
    TurnComplete,
}

/// Classify one frame: `true` if its mean squared energy exceeds the threshold.
pub fn classify(frame: &[u8], energy_threshold: f64) -> bool {
    pcm::mean_square_energy(frame) > energy_threshold
}

/// Per-session turn tracker.
#[derive(Debug, Clone)]
pub struct TurnDetector {
    energy_threshold: f64,
    silence_timeout: Duration,
    speaking: bool,
    /// Set only while speaking and the latest frame was silent
    silence_started_at: Option<Instant>,
    speech_ever_detected: bool,
}

impl TurnDetector {
    pub fn new(energy_threshold: f64, silence_timeout: Duration) -> Self {
        Self {
            energy_threshold,
            silence_timeout,
            speaking: false,
            silence_started_at: None,
            speech_ever_detected: false,
        }
    }

    /// Feed one frame received at `now`.
    pub fn update(&mut self, frame: &[u8], now: Instant) -> Option<TurnEvent> {
        let speech = classify(frame, self.energy_threshold);

        if speech {
            self.silence_started_at = None;
            if !self.speaking {
                self.speaking = true;
                self.speech_ever_detected = true;
                return Some(TurnEvent::SpeechStarted);
            }
            return None;
        }

        if !self.speaking {
            return None;
        }

        let silence_started_at = *self.silence_started_at.get_or_insert(now);
        if now.saturating_duration_since(silence_started_at) >= self.silence_timeout {
            self.speaking = false;
            self.silence_started_at = None;
            return Some(TurnEvent::TurnComplete);
        }

        None
    }

    /// Forget everything; used when a new session turn starts.
    pub fn reset(&mut self) {
        self.speaking = false;
        self.silence_started_at = None;
        self.speech_ever_detected = false;
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    pub fn speech_ever_detected(&self) -> bool {
        self.speech_ever_detected
    }

    pub fn silence_started_at(&self) -> Option<Instant> {
        self.silence_started_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLD: f64 = 1_000_000.0;

    fn frame(amplitude: i16, samples: usize) -> Vec<u8> {
        (0..samples)
            .flat_map(|i| {
                let s = if i % 2 == 0 { amplitude } else { -amplitude };
                s.to_le_bytes()
            })
            .collect()
    }

    fn detector() -> TurnDetector {
        TurnDetector::new(THRESHOLD, Duration::from_secs(2))
    }

    #[test]
    fn test_classify() {
        assert!(!classify(&[], THRESHOLD));
        assert!(!classify(&frame(500, 160), THRESHOLD));
        assert!(!classify(&frame(1000, 160), THRESHOLD)); // equal is not above
        assert!(classify(&frame(5000, 160), THRESHOLD));

        let mut odd = frame(5000, 160);
        odd.push(0x7f);
        assert!(classify(&odd, THRESHOLD));
    }

    #[test]
    fn test_silence_only_never_completes_a_turn() {
        let mut vad = detector();
        let start = Instant::now();

        for i in 0..50 {
            let now = start + Duration::from_millis(100 * i);
            assert_eq!(vad.update(&frame(10, 1600), now), None);
        }

        assert!(!vad.speech_ever_detected());
        assert!(vad.silence_started_at().is_none());
    }

    #[test]
    fn test_speech_then_silence_emits_exactly_one_of_each() {
        let mut vad = detector();
        let start = Instant::now();
        let mut events = Vec::new();

        for i in 0..3 {
            let now = start + Duration::from_millis(100 * i);
            events.extend(vad.update(&frame(8000, 1600), now));
        }
        for i in 3..40 {
            let now = start + Duration::from_millis(100 * i);
            events.extend(vad.update(&frame(10, 1600), now));
        }

        assert_eq!(events, vec![TurnEvent::SpeechStarted, TurnEvent::TurnComplete]);
        assert!(!vad.is_speaking());
    }

    #[test]
    fn test_turn_completes_at_timeout_boundary() {
        let mut vad = detector();
        let start = Instant::now();

        assert_eq!(vad.update(&frame(8000, 160), start), Some(TurnEvent::SpeechStarted));

        let silence_at = start + Duration::from_millis(100);
        assert_eq!(vad.update(&frame(0, 160), silence_at), None);
        assert_eq!(vad.silence_started_at(), Some(silence_at));

        let almost = silence_at + Duration::from_millis(1999);
        assert_eq!(vad.update(&frame(0, 160), almost), None);

        let exactly = silence_at + Duration::from_secs(2);
        assert_eq!(vad.update(&frame(0, 160), exactly), Some(TurnEvent::TurnComplete));
        assert!(vad.silence_started_at().is_none());
    }

    #[test]
    fn test_speech_resets_silence_clock() {
        let mut vad = detector();
        let start = Instant::now();

        vad.update(&frame(8000, 160), start);
        vad.update(&frame(0, 160), start + Duration::from_millis(100));
        vad.update(&frame(0, 160), start + Duration::from_millis(1500));

        // Speech again clears the pending silence
        assert_eq!(vad.update(&frame(8000, 160), start + Duration::from_millis(1600)), None);
        assert!(vad.silence_started_at().is_none());

        // 2.1s after the first silence frame, but only 0.5s after the new one
        vad.update(&frame(0, 160), start + Duration::from_millis(1700));
        assert_eq!(vad.update(&frame(0, 160), start + Duration::from_millis(2200)), None);
        assert!(vad.is_speaking());
    }

    #[test]
    fn test_reset() {
        let mut vad = detector();
        vad.update(&frame(8000, 160), Instant::now());
        assert!(vad.is_speaking());

        vad.reset();
        assert!(!vad.is_speaking());
        assert!(!vad.speech_ever_detected());
    }
}
