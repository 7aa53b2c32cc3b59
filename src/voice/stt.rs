//! Speech-to-text (STT) collaborator

use std::time::Duration;

use async_trait::async_trait;

use crate::config::SttConfig;
use crate::{Error, Result};

/// Turns captured speech into text
///
/// An empty string is a valid result (silence, unintelligible audio); the
/// caller drops such utterances without treating them as faults.
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Transcribe WAV-encoded audio to text
    ///
    /// # Errors
    ///
    /// Returns error if the recognition service is unreachable or rejects
    /// the request; callers degrade to empty text.
    async fn transcribe(&self, wav: Vec<u8>) -> Result<String>;
}

/// Response from a Whisper-style transcription API
#[derive(serde::Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// Whisper-style HTTP transcription client
pub struct HttpSpeechToText {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl HttpSpeechToText {
    /// Create a client from configuration
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(config: &SttConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl SpeechRecognizer for HttpSpeechToText {
    async fn transcribe(&self, wav: Vec<u8>) -> Result<String> {
        tracing::debug!(audio_bytes = wav.len(), "starting transcription");

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(wav)
                    .file_name("audio.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::Stt(e.to_string()))?,
            )
            .text("model", self.model.clone());

        let mut request = self.client.post(&self.endpoint).multipart(form);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| Error::Stt(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Stt(format!("transcription failed: {status} - {body}")));
        }

        let parsed: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| Error::Stt(e.to_string()))?;

        tracing::debug!(text = %parsed.text, "transcription complete");
        Ok(parsed.text.trim().to_string())
    }
}
