//! Harken - full-duplex voice assistant gateway
//!
//! Wake-word-free spoken interaction: harken listens continuously, carves
//! the microphone stream into utterances by energy gating, decides per
//! utterance whether to ignore, chat, or control a device, and delivers
//! recognized commands to other processes over a file-backed broker.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                 Capture thread                        │
//! │   Microphone → frames → energy gate → utterances     │
//! └────────────────────┬─────────────────────────────────┘
//!                      │ bounded queue (backpressure ok)
//! ┌────────────────────▼─────────────────────────────────┐
//! │                 Assistant loop                        │
//! │   STT → intent arbiter → chat reply / commands       │
//! │   TTS playback pauses capture (no self-hearing)      │
//! └────────────────────┬─────────────────────────────────┘
//!                      │ publish (append + flush)
//! ┌────────────────────▼─────────────────────────────────┐
//! │            File broker (commands.jsonl)               │
//! │   other processes tail the log at their own offset   │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod arbiter;
pub mod assistant;
pub mod broker;
pub mod config;
pub mod context;
pub mod devices;
pub mod error;
pub mod llm;
pub mod voice;

pub use assistant::Assistant;
pub use broker::{BrokerMessage, FileBroker, MessageQueue, TailFrom};
pub use config::Config;
pub use error::{Error, Result};
