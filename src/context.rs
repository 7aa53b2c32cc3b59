//! Rolling conversation window
//!
//! Keeps the N most recent turns for model prompts, remembers which device
//! was last talked about, and rewrites demonstrative pronouns ("把它关了")
//! to the concrete device before intent analysis.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::devices::{Command, DeviceKind, DeviceStore};

/// Who produced a context entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The person speaking
    User,
    /// The assistant's reply
    Assistant,
}

impl Role {
    /// Label used when formatting context for model prompts
    const fn label(self) -> &'static str {
        match self {
            Self::User => "用户",
            Self::Assistant => "系统",
        }
    }
}

/// One turn in the conversation window
#[derive(Debug, Clone)]
pub struct ContextEntry {
    /// Speaker
    pub role: Role,
    /// Utterance or reply text
    pub text: String,
    /// When the entry was appended
    pub timestamp: DateTime<Utc>,
    /// Command attached to an assistant confirmation, if any
    pub command: Option<Command>,
}

/// Bounded conversation history, oldest entries evicted first
#[derive(Debug)]
pub struct TurnContext {
    entries: VecDeque<ContextEntry>,
    max_entries: usize,
}

/// Pronouns rewritten by [`TurnContext::resolve_pronoun`], longest first so
/// "刚才那个" never matches as its shorter pieces
const DIRECT_PRONOUNS: [&str; 4] = ["刚才那个", "它", "那个", "这个"];
const TEMPORAL_PRONOUNS: [&str; 3] = ["上面", "刚才", "之前"];

impl TurnContext {
    /// Create a window bounded to `max_entries` turns
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_entries),
            max_entries,
        }
    }

    /// Append a plain turn
    pub fn push(&mut self, role: Role, text: &str) {
        self.push_entry(role, text, None);
    }

    /// Append a turn carrying the command it confirmed
    pub fn push_with_command(&mut self, role: Role, text: &str, command: Command) {
        self.push_entry(role, text, Some(command));
    }

    fn push_entry(&mut self, role: Role, text: &str, command: Option<Command>) {
        if self.entries.len() == self.max_entries {
            self.entries.pop_front();
        }
        self.entries.push_back(ContextEntry {
            role,
            text: text.to_string(),
            timestamp: Utc::now(),
            command,
        });
    }

    /// Number of turns currently held
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no turns are held
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate turns, oldest first
    pub fn entries(&self) -> impl Iterator<Item = &ContextEntry> {
        self.entries.iter()
    }

    /// Format the window for model prompts, one "角色：内容" line per turn
    #[must_use]
    pub fn format(&self) -> String {
        self.entries
            .iter()
            .map(|e| format!("{}：{}", e.role.label(), e.text))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Commands attached to turns in the window, oldest first
    pub fn recent_commands(&self) -> impl Iterator<Item = &Command> {
        self.entries.iter().filter_map(|e| e.command.as_ref())
    }

    /// Device kind of the most recent command in the window
    #[must_use]
    pub fn last_device_mentioned(&self) -> Option<DeviceKind> {
        self.entries
            .iter()
            .rev()
            .find_map(|e| e.command.as_ref().map(|c| c.kind))
    }

    /// Rewrite demonstrative pronouns to the device last talked about
    ///
    /// Falls back to the most recently operated device in `store` when the
    /// window holds no command. Returns `None` when the text has no pronoun
    /// or no referent device is known.
    #[must_use]
    pub fn resolve_pronoun(&self, text: &str, store: &DeviceStore) -> Option<String> {
        let has_pronoun = DIRECT_PRONOUNS
            .iter()
            .chain(TEMPORAL_PRONOUNS.iter())
            .any(|p| text.contains(p));
        if !has_pronoun {
            return None;
        }

        let device = self
            .last_device_mentioned()
            .or_else(|| store.recently_operated())?;
        let name = device.display_name();

        for pronoun in DIRECT_PRONOUNS {
            if text.contains(pronoun) {
                return Some(text.replace(pronoun, name));
            }
        }
        for pronoun in TEMPORAL_PRONOUNS {
            if text.contains(pronoun) {
                return Some(text.replace(pronoun, &format!("{name}的{pronoun}")));
            }
        }
        None
    }
}
