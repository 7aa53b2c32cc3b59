//! Configuration for the harken gateway
//!
//! All values are plain scalars fixed at startup: an optional TOML file
//! provides the base, `HARKEN_*` environment variables override individual
//! fields. There is no runtime reconfiguration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::Result;

/// Gateway configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Capture and segmentation parameters
    pub audio: AudioConfig,

    /// Turn-taking parameters
    pub arbiter: ArbiterConfig,

    /// Command transport parameters
    pub broker: BrokerConfig,

    /// Speech recognition service
    pub stt: SttConfig,

    /// Speech synthesis service
    pub tts: TtsConfig,

    /// Language model service
    pub llm: LlmConfig,
}

/// Capture and segmentation parameters
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Capture sample rate in Hz
    pub sample_rate: u32,

    /// Samples per frame fed to the segmenter
    pub frame_size: usize,

    /// RMS energy gate in the i16 sample domain; tune with `harken calibrate`
    pub energy_threshold: f32,

    /// Silence span that closes an utterance, in seconds
    pub silence_limit_secs: f32,

    /// Capacity of the utterance hand-off queue
    pub queue_capacity: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            frame_size: 1024,
            energy_threshold: 1000.0,
            silence_limit_secs: 0.8,
            queue_capacity: 8,
        }
    }
}

/// Turn-taking parameters
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArbiterConfig {
    /// Span after a reply during which ambiguous input is biased to chat
    pub active_window_secs: u64,

    /// Conversation turns kept for model context
    pub max_history: usize,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            active_window_secs: 30,
            max_history: 10,
        }
    }
}

/// Command transport parameters
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Shared append-only log file; empty means `<data dir>/commands.jsonl`
    pub log_path: Option<PathBuf>,

    /// Tailer poll interval in milliseconds
    pub poll_interval_ms: u64,

    /// Topic device commands are published to
    pub command_topic: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            log_path: None,
            poll_interval_ms: 200,
            command_topic: "smart_home/command".to_string(),
        }
    }
}

/// Speech recognition service endpoint
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    /// Whisper-style transcription endpoint
    pub endpoint: String,

    /// Model identifier sent with each request
    pub model: String,

    /// Bearer token, if the endpoint requires one
    pub api_key: Option<String>,

    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8000/v1/audio/transcriptions".to_string(),
            model: "whisper-1".to_string(),
            api_key: None,
            timeout_secs: 30,
        }
    }
}

/// Speech synthesis service endpoint
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// OpenAI-style speech endpoint returning MP3
    pub endpoint: String,

    /// Model identifier
    pub model: String,

    /// Voice identifier
    pub voice: String,

    /// Speed multiplier
    pub speed: f32,

    /// Bearer token, if the endpoint requires one
    pub api_key: Option<String>,

    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8000/v1/audio/speech".to_string(),
            model: "tts-1".to_string(),
            voice: "zh-CN-XiaoxiaoNeural".to_string(),
            speed: 1.0,
            api_key: None,
            timeout_secs: 30,
        }
    }
}

/// Language model service endpoint
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Ollama base URL
    pub base_url: String,

    /// Model name
    pub model: String,

    /// Request timeout in seconds (generous: first call may load the model)
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:11434".to_string(),
            model: "qwen2.5:7b".to_string(),
            timeout_secs: 120,
        }
    }
}

/// Platform data directory (`~/.local/share/harken` on Linux)
#[must_use]
pub fn data_dir() -> PathBuf {
    directories::ProjectDirs::from("dev", "omni", "harken")
        .map_or_else(|| PathBuf::from("."), |d| d.data_dir().to_path_buf())
}

/// Default config file location (`~/.config/harken/config.toml` on Linux)
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "omni", "harken")
        .map(|d| d.config_dir().join("config.toml"))
}

impl Config {
    /// Load configuration from `path` (or the default location) and apply
    /// environment overrides
    ///
    /// A missing config file is not an error; defaults apply.
    ///
    /// # Errors
    ///
    /// Returns error if an existing config file cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = path.map(Path::to_path_buf).or_else(default_config_path);

        let mut config = match file {
            Some(p) if p.exists() => {
                let content = std::fs::read_to_string(&p)?;
                let config: Self = toml::from_str(&content)?;
                tracing::info!(path = %p.display(), "loaded config file");
                config
            }
            _ => Self::default(),
        };

        config.apply_env();
        Ok(config)
    }

    /// Apply `HARKEN_*` environment variable overrides
    fn apply_env(&mut self) {
        read_env("HARKEN_SAMPLE_RATE", &mut self.audio.sample_rate);
        read_env("HARKEN_FRAME_SIZE", &mut self.audio.frame_size);
        read_env("HARKEN_ENERGY_THRESHOLD", &mut self.audio.energy_threshold);
        read_env("HARKEN_SILENCE_LIMIT_SECS", &mut self.audio.silence_limit_secs);
        read_env("HARKEN_QUEUE_CAPACITY", &mut self.audio.queue_capacity);
        read_env("HARKEN_ACTIVE_WINDOW_SECS", &mut self.arbiter.active_window_secs);
        read_env("HARKEN_MAX_HISTORY", &mut self.arbiter.max_history);
        read_env("HARKEN_POLL_INTERVAL_MS", &mut self.broker.poll_interval_ms);

        if let Ok(path) = std::env::var("HARKEN_BROKER_LOG") {
            self.broker.log_path = Some(PathBuf::from(path));
        }
        if let Ok(topic) = std::env::var("HARKEN_COMMAND_TOPIC") {
            self.broker.command_topic = topic;
        }
        if let Ok(url) = std::env::var("HARKEN_STT_ENDPOINT") {
            self.stt.endpoint = url;
        }
        if let Ok(url) = std::env::var("HARKEN_TTS_ENDPOINT") {
            self.tts.endpoint = url;
        }
        if let Ok(url) = std::env::var("HARKEN_LLM_URL") {
            self.llm.base_url = url;
        }
        if let Ok(model) = std::env::var("HARKEN_LLM_MODEL") {
            self.llm.model = model;
        }
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            self.stt.api_key.get_or_insert_with(|| key.clone());
            self.tts.api_key.get_or_insert(key);
        }
    }

    /// Resolved broker log path (explicit or under the data dir)
    #[must_use]
    pub fn broker_log_path(&self) -> PathBuf {
        self.broker
            .log_path
            .clone()
            .unwrap_or_else(|| data_dir().join("commands.jsonl"))
    }

    /// Tailer poll interval as a [`Duration`]
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.broker.poll_interval_ms)
    }

    /// Active window as a [`Duration`]
    #[must_use]
    pub const fn active_window(&self) -> Duration {
        Duration::from_secs(self.arbiter.active_window_secs)
    }
}

/// Overwrite `target` with a parsed environment value, if present and valid
fn read_env<T: std::str::FromStr>(name: &str, target: &mut T) {
    if let Ok(raw) = std::env::var(name) {
        match raw.parse() {
            Ok(value) => *target = value,
            Err(_) => {
                tracing::warn!(name, value = %raw, "ignoring unparseable environment override");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.audio.sample_rate, 16000);
        assert_eq!(config.audio.frame_size, 1024);
        assert!((config.audio.silence_limit_secs - 0.8).abs() < f32::EPSILON);
        assert_eq!(config.arbiter.active_window_secs, 30);
        assert_eq!(config.broker.command_topic, "smart_home/command");
        assert_eq!(config.broker.poll_interval_ms, 200);
    }

    #[test]
    fn partial_toml_keeps_defaults_elsewhere() {
        let config: Config = toml::from_str(
            r#"
            [audio]
            energy_threshold = 250.0

            [broker]
            command_topic = "cmd"
            "#,
        )
        .unwrap();

        assert!((config.audio.energy_threshold - 250.0).abs() < f32::EPSILON);
        assert_eq!(config.broker.command_topic, "cmd");
        assert_eq!(config.audio.sample_rate, 16000);
        assert_eq!(config.llm.model, "qwen2.5:7b");
    }
}
