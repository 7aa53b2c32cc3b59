//! Text-to-speech (TTS) collaborator

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::TtsConfig;
use crate::{Error, Result};

/// Turns reply text into playable audio
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize `text` to MP3 bytes
    ///
    /// # Errors
    ///
    /// Returns error if synthesis fails or times out; callers skip the
    /// spoken reply rather than aborting the turn.
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>>;
}

/// Request body for an OpenAI-style speech endpoint
#[derive(Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    speed: f32,
}

/// OpenAI-style HTTP speech synthesis client
pub struct HttpTextToSpeech {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    voice: String,
    speed: f32,
    api_key: Option<String>,
}

impl HttpTextToSpeech {
    /// Create a client from configuration
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(config: &TtsConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            voice: config.voice.clone(),
            speed: config.speed,
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpTextToSpeech {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        tracing::debug!(chars = text.chars().count(), "synthesizing speech");

        let body = SpeechRequest {
            model: &self.model,
            input: text,
            voice: &self.voice,
            speed: self.speed,
        };

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| Error::Tts(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("synthesis failed: {status} - {body}")));
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| Error::Tts(e.to_string()))?;

        tracing::debug!(audio_bytes = audio.len(), "synthesis complete");
        Ok(audio.to_vec())
    }
}
