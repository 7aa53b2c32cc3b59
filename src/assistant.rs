//! The assistant loop
//!
//! Single foreground task that owns the turn arbiter and every collaborator
//! call: drain the utterance queue, transcribe, resolve pronouns, classify,
//! then either drop the utterance, chat, or extract and dispatch device
//! commands. Any branch that replies pauses capture for the playback span
//! so the assistant never hears itself.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::arbiter::{Disposition, TurnArbiter};
use crate::broker::FileBroker;
use crate::config::Config;
use crate::context::{Role, TurnContext};
use crate::devices::{Command, DeviceStore};
use crate::llm::{CommandExtraction, IntentAnalysis, LanguageModel};
use crate::voice::{
    CapturePipe, PauseHandle, Player, Recv, SpeechRecognizer, SpeechSynthesizer, Utterance,
    samples_to_wav,
};
use crate::{Error, Result};

/// How long one queue poll waits before checking for shutdown
const RECV_TIMEOUT: Duration = Duration::from_secs(1);

/// Reply when command extraction found nothing actionable
const NOT_UNDERSTOOD: &str = "抱歉，我没听懂具体的指令。";

/// Reply when the chat model is unavailable
const APOLOGY: &str = "抱歉，我没听清，请再说一遍。";

/// The full-duplex interaction loop
pub struct Assistant<R, M, S, P> {
    config: Config,
    broker: FileBroker,
    recognizer: R,
    model: M,
    synthesizer: S,
    player: P,
    arbiter: TurnArbiter,
    context: TurnContext,
    devices: DeviceStore,
}

impl<R, M, S, P> Assistant<R, M, S, P>
where
    R: SpeechRecognizer,
    M: LanguageModel,
    S: SpeechSynthesizer,
    P: Player,
{
    /// Assemble the loop from its collaborators
    #[must_use]
    pub fn new(
        config: Config,
        broker: FileBroker,
        recognizer: R,
        model: M,
        synthesizer: S,
        player: P,
    ) -> Self {
        let arbiter = TurnArbiter::new(config.active_window());
        let context = TurnContext::new(config.arbiter.max_history);
        Self {
            config,
            broker,
            recognizer,
            model,
            synthesizer,
            player,
            arbiter,
            context,
            devices: DeviceStore::new(),
        }
    }

    /// Conversation window, for inspection
    #[must_use]
    pub fn context(&self) -> &TurnContext {
        &self.context
    }

    /// Device-state store, for inspection
    #[must_use]
    pub fn devices(&self) -> &DeviceStore {
        &self.devices
    }

    /// True while the activity window is open
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.arbiter.is_active()
    }

    /// Run until shutdown is signalled or the capture pipeline ends
    ///
    /// # Errors
    ///
    /// Currently infallible at runtime; faults inside a turn degrade and
    /// the loop keeps listening.
    pub async fn run(
        &mut self,
        pipe: &mut CapturePipe,
        shutdown: &mut mpsc::Receiver<()>,
    ) -> Result<()> {
        let pause = pipe.pause_handle();
        tracing::info!("assistant running, listening");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("shutdown requested");
                    break;
                }
                recv = pipe.recv_timeout(RECV_TIMEOUT) => match recv {
                    Recv::Utterance(utterance) => {
                        self.handle_utterance(&utterance, &pause).await;
                    }
                    Recv::Empty => {}
                    Recv::Closed => {
                        tracing::error!("capture pipeline ended unexpectedly");
                        break;
                    }
                }
            }
        }

        pipe.stop();
        tracing::info!("assistant stopped");
        Ok(())
    }

    /// Process one captured utterance end to end
    pub async fn handle_utterance(&mut self, utterance: &Utterance, pause: &PauseHandle) {
        let wav = match samples_to_wav(utterance.samples(), self.config.audio.sample_rate) {
            Ok(wav) => wav,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode utterance");
                return;
            }
        };

        let text = match self.recognizer.transcribe(wav).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "transcription failed");
                String::new()
            }
        };
        if text.trim().is_empty() {
            tracing::debug!("nothing recognized, dropping segment");
            return;
        }
        tracing::info!(text = %text, "utterance recognized");

        let resolved = match self.context.resolve_pronoun(&text, &self.devices) {
            Some(resolved) => {
                tracing::debug!(from = %text, to = %resolved, "pronoun resolved");
                resolved
            }
            None => text,
        };

        let context_text = self.context.format();
        let analysis = match self.model.analyze_intent(&resolved, &context_text).await {
            Ok(analysis) => analysis,
            Err(e) => {
                tracing::warn!(error = %e, "intent analysis failed, using fallback");
                IntentAnalysis::fallback(&resolved)
            }
        };
        let corrected = if analysis.corrected_text.trim().is_empty() {
            resolved
        } else {
            analysis.corrected_text.clone()
        };
        tracing::info!(
            intent = ?analysis.intent,
            reason = %analysis.reason,
            active = self.arbiter.is_active(),
            "intent classified"
        );

        match self.arbiter.classify(analysis.intent, &corrected) {
            Disposition::Drop => {
                tracing::debug!("utterance dropped");
            }
            Disposition::Chat => self.handle_chat(&corrected, &context_text, pause).await,
            Disposition::Command => self.handle_command(&corrected, &context_text, pause).await,
        }
    }

    /// Chat branch: free-form reply
    async fn handle_chat(&mut self, text: &str, context_text: &str, pause: &PauseHandle) {
        let reply = match self.model.chat_reply(text, context_text).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(error = %e, "chat reply failed");
                APOLOGY.to_string()
            }
        };
        self.reply(text, &reply, None, pause).await;
    }

    /// Command branch: extract, dispatch, confirm
    async fn handle_command(&mut self, text: &str, context_text: &str, pause: &PauseHandle) {
        let states = self.devices.summary();
        let extraction = match self
            .model
            .recognize_command(text, context_text, &states)
            .await
        {
            Ok(extraction) => extraction,
            Err(e) => {
                tracing::warn!(error = %e, "command extraction failed");
                CommandExtraction::default()
            }
        };

        if extraction.commands.is_empty() {
            // Nothing actionable: ask about a suggestion if the model has
            // one, otherwise admit defeat. Both count as replies.
            let reply = extraction
                .potential
                .first()
                .filter(|s| !s.suggestion.is_empty())
                .map_or_else(|| NOT_UNDERSTOOD.to_string(), |s| s.suggestion.clone());
            self.reply(text, &reply, None, pause).await;
            return;
        }

        let mut confirmations = Vec::new();
        let mut last_dispatched = None;
        for command in extraction.commands {
            let described = command.describe();
            let dispatched = serde_json::to_value(command.clone().stamped())
                .map_err(Error::from)
                .and_then(|payload| {
                    self.broker
                        .publish(&self.config.broker.command_topic, payload)
                });

            match dispatched {
                Ok(()) => {
                    tracing::info!(command = %described, "command dispatched");
                    self.devices.apply(&command);
                    confirmations.push(format!("好的，{described}"));
                    last_dispatched = Some(command);
                }
                Err(e) => {
                    // Not retried; device state stays untouched
                    tracing::error!(error = %e, command = %described, "command publish failed");
                    confirmations.push(format!("抱歉，{described}失败了"));
                }
            }
        }

        let reply = confirmations.join("，");
        self.reply(text, &reply, last_dispatched, pause).await;
    }

    /// Append the turn, open the activity window, then speak
    async fn reply(
        &mut self,
        user_text: &str,
        reply_text: &str,
        command: Option<Command>,
        pause: &PauseHandle,
    ) {
        self.context.push(Role::User, user_text);
        match command {
            Some(command) => self
                .context
                .push_with_command(Role::Assistant, reply_text, command),
            None => self.context.push(Role::Assistant, reply_text),
        }

        // Stamp the window before playback: a barge-in spoken while we are
        // talking gets dropped and must not re-open the window itself
        self.arbiter.note_reply();

        tracing::info!(reply = %reply_text, "speaking");
        let _pause = pause.pause_scoped();
        match self.synthesizer.synthesize(reply_text).await {
            Ok(audio) => {
                if let Err(e) = self.player.play_mp3(&audio).await {
                    tracing::warn!(error = %e, "playback failed");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "synthesis failed, skipping spoken reply");
            }
        }
        // Dropping the guard resumes capture even when playback failed
    }
}
