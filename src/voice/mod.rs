//! Voice processing module
//!
//! Continuous capture, energy-gated segmentation, the capture pipe feeding
//! the foreground loop, playback, and the STT/TTS collaborator contracts.

mod capture;
mod pipeline;
mod playback;
mod segmenter;
mod stt;
mod tts;

pub use capture::{AudioCapture, AudioFrame, FrameSource, MicFrameSource, samples_to_wav};
pub use pipeline::{CapturePipe, Recv};
pub use playback::{AudioPlayback, Player};
pub use segmenter::{PauseGuard, PauseHandle, Utterance, UtteranceSegmenter, rms_energy};
pub use stt::{HttpSpeechToText, SpeechRecognizer};
pub use tts::{HttpTextToSpeech, SpeechSynthesizer};
