//! Turn arbiter
//!
//! Decides, per utterance, whether to drop it, chat, or treat it as a
//! device command. The only persistent state is the activity window: for a
//! short span after the assistant last replied, ambiguous input is biased
//! toward continued conversation.

use std::time::{Duration, Instant};

use crate::llm::Intent;

/// Ambiguous `ignore` classifications shorter than this many characters are
/// always dropped, even inside the activity window
const RECLASSIFY_MIN_CHARS: usize = 3;

/// Tracks when the assistant last replied
#[derive(Debug)]
pub struct ActivityWindow {
    span: Duration,
    last_interaction: Option<Instant>,
}

impl ActivityWindow {
    /// Create a window of the given span
    #[must_use]
    pub const fn new(span: Duration) -> Self {
        Self {
            span,
            last_interaction: None,
        }
    }

    /// True while the last reply is more recent than the window span
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.last_interaction
            .is_some_and(|t| t.elapsed() < self.span)
    }

    /// Record a reply. Called before playback starts, so speech captured
    /// (and dropped) during playback cannot re-stamp the window.
    pub fn mark(&mut self) {
        self.last_interaction = Some(Instant::now());
    }
}

/// Per-utterance outcome of arbitration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Drop the utterance: no reply, no context update
    Drop,
    /// Generate a conversational reply
    Chat,
    /// Extract and dispatch device commands
    Command,
}

/// The turn-taking state machine
#[derive(Debug)]
pub struct TurnArbiter {
    window: ActivityWindow,
}

impl TurnArbiter {
    /// Create an arbiter with the given active-window span
    #[must_use]
    pub const fn new(active_window: Duration) -> Self {
        Self {
            window: ActivityWindow::new(active_window),
        }
    }

    /// True while the activity window is open
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.window.is_active()
    }

    /// Record that a reply was produced, opening the activity window
    pub fn note_reply(&mut self) {
        self.window.mark();
    }

    /// Classify one utterance
    #[must_use]
    pub fn classify(&self, intent: Intent, text: &str) -> Disposition {
        decide(intent, self.window.is_active(), text)
    }
}

/// Arbitration rules, separated out for direct testing
///
/// Text length is counted in characters, not bytes: utterances are
/// routinely CJK and the 3-character gate refers to what was said.
#[must_use]
pub fn decide(intent: Intent, is_active: bool, text: &str) -> Disposition {
    match intent {
        Intent::Command => Disposition::Command,
        Intent::Chat => Disposition::Chat,
        Intent::Ignore => {
            // Inside the window, a non-trivial "ignore" is more likely a
            // continued conversation than background noise
            if is_active && text.chars().count() > RECLASSIFY_MIN_CHARS {
                Disposition::Chat
            } else {
                Disposition::Drop
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_and_chat_pass_through() {
        assert_eq!(decide(Intent::Command, false, "开灯"), Disposition::Command);
        assert_eq!(decide(Intent::Chat, false, "你好"), Disposition::Chat);
    }

    #[test]
    fn ignore_dropped_outside_window() {
        assert_eq!(
            decide(Intent::Ignore, false, "今天天气怎么样"),
            Disposition::Drop
        );
    }

    #[test]
    fn ignore_reclassified_inside_window() {
        assert_eq!(
            decide(Intent::Ignore, true, "今天天气怎么样"),
            Disposition::Chat
        );
    }

    #[test]
    fn short_ignore_dropped_even_inside_window() {
        // Three characters is the boundary: 3 drops, 4 reclassifies
        assert_eq!(decide(Intent::Ignore, true, "嗯嗯嗯"), Disposition::Drop);
        assert_eq!(decide(Intent::Ignore, true, "嗯嗯嗯嗯"), Disposition::Chat);
    }

    #[test]
    fn window_opens_on_reply_and_expires() {
        let mut arbiter = TurnArbiter::new(Duration::from_millis(40));
        assert!(!arbiter.is_active());

        arbiter.note_reply();
        assert!(arbiter.is_active());
        assert_eq!(
            arbiter.classify(Intent::Ignore, "把空调关小一点"),
            Disposition::Chat
        );

        std::thread::sleep(Duration::from_millis(60));
        assert!(!arbiter.is_active());
        assert_eq!(
            arbiter.classify(Intent::Ignore, "把空调关小一点"),
            Disposition::Drop
        );
    }
}
