//! Energy-gated utterance segmentation
//!
//! Turns the raw frame stream into discrete utterances: a frame whose RMS
//! energy crosses the threshold opens a segment, and the segment closes
//! once energy stays below the threshold for the configured silence span.
//! While the pause flag is set (the assistant is speaking), every frame is
//! discarded so the system never captures its own voice.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::voice::capture::AudioFrame;

/// One contiguous spoken segment, immutable once emitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    samples: Vec<i16>,
}

impl Utterance {
    /// The PCM samples making up the segment
    #[must_use]
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    /// Number of samples
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True when the segment holds no samples
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Segment duration at the given sample rate
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn duration_secs(&self, sample_rate: u32) -> f32 {
        self.samples.len() as f32 / sample_rate as f32
    }
}

/// Cross-task flag that suspends segmentation during playback
///
/// The only mutable state shared between the capture thread and the
/// foreground loop; a plain atomic is enough since it carries no derived
/// invariants.
#[derive(Debug, Clone)]
pub struct PauseHandle {
    flag: Arc<AtomicBool>,
}

impl Default for PauseHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseHandle {
    /// Create an un-paused handle
    #[must_use]
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Suspend segmentation; in-progress segments are dropped
    pub fn pause(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Resume segmentation
    pub fn resume(&self) {
        self.flag.store(false, Ordering::Relaxed);
    }

    /// True while paused
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Pause for the lifetime of the returned guard
    ///
    /// Resume happens on drop, so it is guaranteed even when playback
    /// returns early with an error.
    #[must_use]
    pub fn pause_scoped(&self) -> PauseGuard {
        self.pause();
        PauseGuard {
            handle: self.clone(),
        }
    }
}

/// RAII guard that resumes segmentation when dropped
#[derive(Debug)]
pub struct PauseGuard {
    handle: PauseHandle,
}

impl Drop for PauseGuard {
    fn drop(&mut self) {
        self.handle.resume();
    }
}

/// Segmentation state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentState {
    /// Waiting for speech
    Idle,
    /// Accumulating an utterance
    Speaking,
}

/// Splits a frame stream into utterances by energy gating
pub struct UtteranceSegmenter {
    threshold: f32,
    silence_limit_samples: u64,
    pause: PauseHandle,
    state: SegmentState,
    buffer: Vec<i16>,
    // Accumulated below-threshold samples; armed only while Speaking
    silence_samples: Option<u64>,
}

impl UtteranceSegmenter {
    /// Create a segmenter
    ///
    /// `threshold` is in the i16 RMS domain; `silence_limit_secs` is how
    /// long energy must stay below it before the segment is emitted.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn new(threshold: f32, silence_limit_secs: f32, sample_rate: u32) -> Self {
        let silence_limit_samples = (silence_limit_secs * sample_rate as f32).max(1.0) as u64;
        Self {
            threshold,
            silence_limit_samples,
            pause: PauseHandle::new(),
            state: SegmentState::Idle,
            buffer: Vec::new(),
            silence_samples: None,
        }
    }

    /// Handle controlling the pause flag from another task
    #[must_use]
    pub fn pause_handle(&self) -> PauseHandle {
        self.pause.clone()
    }

    /// True while an utterance is being accumulated
    #[must_use]
    pub fn is_speaking(&self) -> bool {
        self.state == SegmentState::Speaking
    }

    /// Feed one frame; returns a finished utterance when a segment closes
    pub fn process(&mut self, frame: &AudioFrame) -> Option<Utterance> {
        if self.pause.is_paused() {
            if self.state == SegmentState::Speaking {
                tracing::debug!(
                    dropped_samples = self.buffer.len(),
                    "playback in progress, dropping in-progress segment"
                );
                self.buffer.clear();
            }
            self.silence_samples = None;
            self.state = SegmentState::Idle;
            return None;
        }

        let energy = rms_energy(frame);

        match self.state {
            SegmentState::Idle => {
                if energy > self.threshold {
                    tracing::debug!(energy, "speech detected");
                    self.state = SegmentState::Speaking;
                    self.buffer.clear();
                    self.buffer.extend_from_slice(frame);
                    self.silence_samples = None;
                }
            }
            SegmentState::Speaking => {
                self.buffer.extend_from_slice(frame);

                if energy > self.threshold {
                    self.silence_samples = None;
                } else {
                    let silent = self.silence_samples.get_or_insert(0);
                    *silent += frame.len() as u64;

                    if *silent >= self.silence_limit_samples {
                        let utterance = Utterance {
                            samples: std::mem::take(&mut self.buffer),
                        };
                        self.state = SegmentState::Idle;
                        self.silence_samples = None;
                        tracing::debug!(samples = utterance.len(), "utterance complete");
                        return Some(utterance);
                    }
                }
            }
        }

        None
    }
}

/// RMS energy of a frame in the i16 sample domain
///
/// Degenerate input (empty frame, NaN) counts as silence.
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
pub fn rms_energy(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = samples
        .iter()
        .map(|&s| {
            let s = f64::from(s);
            s * s
        })
        .sum();
    let rms = (sum_squares / samples.len() as f64).sqrt() as f32;
    if rms.is_nan() { 0.0 } else { rms }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loud_frame(len: usize) -> AudioFrame {
        vec![8000i16; len]
    }

    fn quiet_frame(len: usize) -> AudioFrame {
        vec![10i16; len]
    }

    #[test]
    fn energy_of_silence_is_zero() {
        assert_eq!(rms_energy(&[]), 0.0);
        assert_eq!(rms_energy(&[0, 0, 0]), 0.0);
    }

    #[test]
    fn energy_of_constant_signal_is_magnitude() {
        let energy = rms_energy(&vec![1000i16; 64]);
        assert!((energy - 1000.0).abs() < 1.0);
    }

    #[test]
    fn idle_discards_quiet_frames() {
        let mut seg = UtteranceSegmenter::new(1000.0, 0.5, 16000);
        for _ in 0..20 {
            assert!(seg.process(&quiet_frame(1024)).is_none());
        }
        assert!(!seg.is_speaking());
    }

    #[test]
    fn loud_frame_opens_segment_and_seeds_buffer() {
        let mut seg = UtteranceSegmenter::new(1000.0, 0.5, 16000);
        assert!(seg.process(&loud_frame(1024)).is_none());
        assert!(seg.is_speaking());
    }

    #[test]
    fn silence_timeout_emits_accumulated_utterance() {
        // 0.25s of silence at 16kHz = 4000 samples = 4 frames of 1000
        let mut seg = UtteranceSegmenter::new(1000.0, 0.25, 16000);

        for _ in 0..3 {
            assert!(seg.process(&loud_frame(1000)).is_none());
        }
        let mut emitted = None;
        for _ in 0..4 {
            if let Some(u) = seg.process(&quiet_frame(1000)) {
                emitted = Some(u);
                break;
            }
        }

        // 3 loud frames + 4 quiet frames, all part of the segment
        let utterance = emitted.expect("utterance should be emitted");
        assert_eq!(utterance.len(), 7000);
        assert!(!seg.is_speaking());
    }

    #[test]
    fn loud_frame_rearms_silence_timer() {
        let mut seg = UtteranceSegmenter::new(1000.0, 0.25, 16000);

        seg.process(&loud_frame(1000));
        // Almost enough silence, then speech again
        for _ in 0..3 {
            assert!(seg.process(&quiet_frame(1000)).is_none());
        }
        assert!(seg.process(&loud_frame(1000)).is_none());
        // Timer restarted: three more quiet frames are not enough
        for _ in 0..3 {
            assert!(seg.process(&quiet_frame(1000)).is_none());
        }
        let utterance = seg.process(&quiet_frame(1000));
        assert!(utterance.is_some());
    }

    #[test]
    fn pause_drops_in_progress_segment() {
        let mut seg = UtteranceSegmenter::new(1000.0, 0.25, 16000);
        let pause = seg.pause_handle();

        seg.process(&loud_frame(1000));
        assert!(seg.is_speaking());

        pause.pause();
        assert!(seg.process(&loud_frame(1000)).is_none());
        assert!(!seg.is_speaking());

        // Silence after resume does not resurrect the dropped segment
        pause.resume();
        for _ in 0..8 {
            assert!(seg.process(&quiet_frame(1000)).is_none());
        }
    }

    #[test]
    fn paused_segmenter_discards_all_frames() {
        let mut seg = UtteranceSegmenter::new(1000.0, 0.25, 16000);
        let pause = seg.pause_handle();

        pause.pause();
        for _ in 0..10 {
            assert!(seg.process(&loud_frame(1000)).is_none());
        }
        assert!(!seg.is_speaking());
    }

    #[test]
    fn pause_guard_resumes_on_drop() {
        let pause = PauseHandle::new();
        {
            let _guard = pause.pause_scoped();
            assert!(pause.is_paused());
        }
        assert!(!pause.is_paused());
    }
}
