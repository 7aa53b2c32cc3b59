//! Audio capture from microphone
//!
//! The microphone is owned exclusively by the capture side: a cpal input
//! stream appends converted i16 samples to a shared buffer, and
//! [`MicFrameSource`] slices that buffer into the fixed-size frames the
//! segmenter consumes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleRate, Stream, StreamConfig};

use crate::{Error, Result};

/// A fixed-size block of mono 16-bit PCM samples
pub type AudioFrame = Vec<i16>;

/// Anything that yields fixed-size PCM frames
///
/// `Ok(None)` means the source ended cleanly (interrupt/shutdown); it is not
/// an error. Transient read faults are returned as `Err` and the caller is
/// expected to log and keep reading.
pub trait FrameSource {
    /// Read the next frame, blocking until one is available
    ///
    /// # Errors
    ///
    /// Returns [`Error::Capture`] on a transient device read fault.
    fn next_frame(&mut self) -> Result<Option<AudioFrame>>;
}

/// Captures audio from the default input device
pub struct AudioCapture {
    #[allow(dead_code)]
    device: Device,
    config: StreamConfig,
    sample_rate: u32,
    buffer: Arc<Mutex<Vec<i16>>>,
    stream: Option<Stream>,
}

impl AudioCapture {
    /// Create a new audio capture instance at the given sample rate
    ///
    /// # Errors
    ///
    /// Returns error if no input device supports mono capture at
    /// `sample_rate`. This is the one startup error that aborts
    /// initialization.
    pub fn new(sample_rate: u32) -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or_else(|| Error::Audio("no input device available".to_string()))?;

        let supported_config = device
            .supported_input_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| {
                c.channels() == 1
                    && c.min_sample_rate() <= SampleRate(sample_rate)
                    && c.max_sample_rate() >= SampleRate(sample_rate)
            })
            .ok_or_else(|| Error::Audio("no suitable input config found".to_string()))?;

        let config = supported_config
            .with_sample_rate(SampleRate(sample_rate))
            .config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate,
            channels = config.channels,
            "audio capture initialized"
        );

        Ok(Self {
            device,
            config,
            sample_rate,
            buffer: Arc::new(Mutex::new(Vec::new())),
            stream: None,
        })
    }

    /// Start the input stream
    ///
    /// # Errors
    ///
    /// Returns error if the stream cannot be built or started
    pub fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let buffer = Arc::clone(&self.buffer);
        let stream = self
            .device
            .build_input_stream(
                &self.config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if let Ok(mut buf) = buffer.lock() {
                        buf.extend(data.iter().map(|&s| f32_to_i16(s)));
                    }
                },
                |err| {
                    tracing::error!(error = %err, "audio capture error");
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;
        self.stream = Some(stream);

        tracing::debug!("audio capture started");
        Ok(())
    }

    /// Stop capturing and release the stream
    pub fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            tracing::debug!("audio capture stopped");
        }
    }

    /// Take all samples captured since the last call
    #[must_use]
    pub fn take_buffer(&self) -> Vec<i16> {
        self.buffer
            .lock()
            .map(|mut buf| std::mem::take(&mut *buf))
            .unwrap_or_default()
    }

    /// Copy the captured samples without clearing them
    #[must_use]
    pub fn peek_buffer(&self) -> Vec<i16> {
        self.buffer
            .lock()
            .map(|buf| buf.clone())
            .unwrap_or_default()
    }

    /// Discard everything captured so far
    pub fn clear_buffer(&self) {
        if let Ok(mut buf) = self.buffer.lock() {
            buf.clear();
        }
    }

    /// Configured sample rate
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Slices the capture buffer into fixed-size frames
///
/// Owns the [`AudioCapture`] (and therefore the cpal stream, which is not
/// `Send`): construct this on the thread that will read it.
pub struct MicFrameSource {
    capture: AudioCapture,
    frame_size: usize,
    pending: Vec<i16>,
    running: Arc<AtomicBool>,
    poll_interval: Duration,
}

impl MicFrameSource {
    /// Open the default microphone and start streaming
    ///
    /// `running` is the shutdown flag; once cleared the source reports a
    /// clean end of stream.
    ///
    /// # Errors
    ///
    /// Returns error if the audio device cannot be acquired or started.
    pub fn open(sample_rate: u32, frame_size: usize, running: Arc<AtomicBool>) -> Result<Self> {
        let mut capture = AudioCapture::new(sample_rate)?;
        capture.start()?;

        // Wake up a few times per frame so shutdown stays prompt
        let frame_millis = frame_size as u64 * 1000 / u64::from(sample_rate);
        let poll_interval = Duration::from_millis((frame_millis / 4).max(2));

        Ok(Self {
            capture,
            frame_size,
            pending: Vec::new(),
            running,
            poll_interval,
        })
    }
}

impl FrameSource for MicFrameSource {
    fn next_frame(&mut self) -> Result<Option<AudioFrame>> {
        loop {
            if !self.running.load(Ordering::Relaxed) {
                self.capture.stop();
                return Ok(None);
            }

            if self.pending.len() >= self.frame_size {
                let frame: Vec<i16> = self.pending.drain(..self.frame_size).collect();
                return Ok(Some(frame));
            }

            let fresh = self.capture.take_buffer();
            if fresh.is_empty() {
                std::thread::sleep(self.poll_interval);
            } else {
                self.pending.extend(fresh);
            }
        }
    }
}

/// Convert one f32 sample in [-1, 1] to i16
#[allow(clippy::cast_possible_truncation)]
fn f32_to_i16(sample: f32) -> i16 {
    (sample * 32767.0).clamp(-32768.0, 32767.0) as i16
}

/// Encode i16 PCM samples as WAV bytes for STT upload
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;
        for &sample in samples {
            writer
                .write_sample(sample)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }
        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn f32_conversion_clamps() {
        assert_eq!(f32_to_i16(0.0), 0);
        assert_eq!(f32_to_i16(1.5), 32767);
        assert_eq!(f32_to_i16(-1.5), -32768);
    }

    #[test]
    fn wav_header_and_size() {
        let samples = vec![0i16, 100, -100, 32000];
        let wav = samples_to_wav(&samples, 16000).unwrap();

        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(wav.len(), 44 + samples.len() * 2);
    }
}
