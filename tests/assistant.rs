//! Full-loop scripted conversation tests
//!
//! Run the assistant's utterance handling end to end with mock
//! collaborators: scripted recognition and intent results in, spoken
//! replies and broker records out. No audio hardware, no network.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use harken::devices::{Command, DeviceKind, SwitchState};
use harken::llm::{CommandExtraction, Intent, IntentAnalysis, LanguageModel};
use harken::voice::{
    PauseHandle, Player, SpeechRecognizer, SpeechSynthesizer, Utterance, UtteranceSegmenter,
};
use harken::{Assistant, Config, Error, FileBroker, Result};

/// Build a real utterance by driving the segmenter over synthetic frames
fn make_utterance() -> Utterance {
    let mut segmenter = UtteranceSegmenter::new(1000.0, 0.25, 16000);
    for _ in 0..3 {
        segmenter.process(&vec![8000i16; 1000]);
    }
    (0..6)
        .find_map(|_| segmenter.process(&vec![0i16; 1000]))
        .expect("segmenter should emit an utterance")
}

/// Recognizer that replays a script of transcripts
struct ScriptedRecognizer {
    texts: Mutex<VecDeque<String>>,
}

impl ScriptedRecognizer {
    fn new(texts: &[&str]) -> Self {
        Self {
            texts: Mutex::new(texts.iter().map(ToString::to_string).collect()),
        }
    }
}

#[async_trait]
impl SpeechRecognizer for ScriptedRecognizer {
    async fn transcribe(&self, _wav: Vec<u8>) -> Result<String> {
        Ok(self.texts.lock().unwrap().pop_front().unwrap_or_default())
    }
}

/// Language model that replays scripted analyses and extractions
#[derive(Default)]
struct ScriptedModel {
    analyses: Mutex<VecDeque<IntentAnalysis>>,
    extractions: Mutex<VecDeque<CommandExtraction>>,
    replies: Mutex<VecDeque<String>>,
}

impl ScriptedModel {
    fn with_analysis(self, intent: Intent, corrected: &str) -> Self {
        self.analyses.lock().unwrap().push_back(IntentAnalysis {
            corrected_text: corrected.to_string(),
            intent,
            reason: String::new(),
        });
        self
    }

    fn with_extraction(self, extraction: CommandExtraction) -> Self {
        self.extractions.lock().unwrap().push_back(extraction);
        self
    }

    fn with_reply(self, reply: &str) -> Self {
        self.replies.lock().unwrap().push_back(reply.to_string());
        self
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn analyze_intent(&self, _text: &str, _context: &str) -> Result<IntentAnalysis> {
        self.analyses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::Llm("analysis script exhausted".to_string()))
    }

    async fn recognize_command(
        &self,
        _text: &str,
        _context: &str,
        _device_states: &str,
    ) -> Result<CommandExtraction> {
        self.extractions
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::Llm("extraction script exhausted".to_string()))
    }

    async fn chat_reply(&self, _text: &str, _context: &str) -> Result<String> {
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::Llm("reply script exhausted".to_string()))
    }
}

/// Synthesizer returning a placeholder clip
struct StubSynthesizer;

#[async_trait]
impl SpeechSynthesizer for StubSynthesizer {
    async fn synthesize(&self, _text: &str) -> Result<Vec<u8>> {
        Ok(b"mp3".to_vec())
    }
}

/// Synthesizer that always fails
struct FailingSynthesizer;

#[async_trait]
impl SpeechSynthesizer for FailingSynthesizer {
    async fn synthesize(&self, _text: &str) -> Result<Vec<u8>> {
        Err(Error::Tts("synthesis backend down".to_string()))
    }
}

/// Player that records whether capture was paused during each playback
struct RecordingPlayer {
    pause: PauseHandle,
    paused_during_play: Arc<Mutex<Vec<bool>>>,
}

#[async_trait]
impl Player for RecordingPlayer {
    async fn play_mp3(&mut self, _data: &[u8]) -> Result<()> {
        self.paused_during_play
            .lock()
            .unwrap()
            .push(self.pause.is_paused());
        Ok(())
    }
}

/// Test fixture: config + broker over a scratch log
fn scratch_setup() -> (tempfile::TempDir, Config, FileBroker) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.broker.log_path = Some(dir.path().join("commands.jsonl"));
    let broker = FileBroker::open(&config.broker_log_path(), config.poll_interval()).unwrap();
    (dir, config, broker)
}

fn recording_player(pause: &PauseHandle) -> (RecordingPlayer, Arc<Mutex<Vec<bool>>>) {
    let plays = Arc::new(Mutex::new(Vec::new()));
    (
        RecordingPlayer {
            pause: pause.clone(),
            paused_during_play: Arc::clone(&plays),
        },
        plays,
    )
}

#[tokio::test]
async fn command_flow_publishes_and_confirms() {
    let (_dir, config, broker) = scratch_setup();
    let log_path = config.broker_log_path();

    let model = ScriptedModel::default()
        .with_analysis(Intent::Command, "帮我把空调打开")
        .with_extraction(CommandExtraction {
            commands: vec![Command::new(DeviceKind::Ac, "空调", "开")],
            potential: vec![],
        });

    let pause = PauseHandle::new();
    let (player, plays) = recording_player(&pause);
    let mut assistant = Assistant::new(
        config,
        broker,
        ScriptedRecognizer::new(&["帮我把空调打开"]),
        model,
        StubSynthesizer,
        player,
    );

    assistant.handle_utterance(&make_utterance(), &pause).await;

    // The command reached the log, stamped
    let content = std::fs::read_to_string(&log_path).unwrap();
    let lines: Vec<_> = content.lines().collect();
    assert_eq!(lines.len(), 1);
    let record: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(record["topic"], "smart_home/command");
    assert_eq!(record["payload"]["type"], "ac");
    assert_eq!(record["payload"]["action"], "开");
    assert!(record["payload"]["timestamp"].is_string());

    // Device bookkeeping and conversation window updated
    assert_eq!(
        assistant.devices().switch_state(DeviceKind::Ac),
        Some(SwitchState::On)
    );
    let entries: Vec<_> = assistant.context().entries().collect();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].text, "帮我把空调打开");
    assert_eq!(entries[1].text, "好的，开空调");
    assert_eq!(
        entries[1].command.as_ref().map(|c| c.kind),
        Some(DeviceKind::Ac)
    );

    // The reply opened the activity window and playback ran while paused
    assert!(assistant.is_active());
    assert_eq!(plays.lock().unwrap().as_slice(), &[true]);
    assert!(!pause.is_paused(), "capture resumes after playback");
}

#[tokio::test]
async fn ignored_utterance_leaves_no_trace() {
    let (_dir, config, broker) = scratch_setup();
    let log_path = config.broker_log_path();

    let model = ScriptedModel::default().with_analysis(Intent::Ignore, "今天天气真不错");

    let pause = PauseHandle::new();
    let (player, plays) = recording_player(&pause);
    let mut assistant = Assistant::new(
        config,
        broker,
        ScriptedRecognizer::new(&["今天天气真不错"]),
        model,
        StubSynthesizer,
        player,
    );

    assistant.handle_utterance(&make_utterance(), &pause).await;

    // Outside the activity window: dropped entirely
    assert!(assistant.context().is_empty());
    assert!(!assistant.is_active());
    assert!(plays.lock().unwrap().is_empty());
    assert_eq!(std::fs::read_to_string(&log_path).unwrap(), "");
}

#[tokio::test]
async fn ignore_becomes_chat_inside_the_window() {
    let (_dir, config, broker) = scratch_setup();

    let model = ScriptedModel::default()
        .with_analysis(Intent::Chat, "你好")
        .with_reply("你好呀")
        .with_analysis(Intent::Ignore, "顺便讲个笑话吧")
        .with_reply("好的，来一个");

    let pause = PauseHandle::new();
    let (player, plays) = recording_player(&pause);
    let mut assistant = Assistant::new(
        config,
        broker,
        ScriptedRecognizer::new(&["你好", "顺便讲个笑话吧"]),
        model,
        StubSynthesizer,
        player,
    );

    // First turn opens the window
    assistant.handle_utterance(&make_utterance(), &pause).await;
    assert!(assistant.is_active());

    // Second turn is classified ignore but reclassifies to chat
    assistant.handle_utterance(&make_utterance(), &pause).await;

    let entries: Vec<_> = assistant.context().entries().collect();
    assert_eq!(entries.len(), 4);
    assert_eq!(entries[3].text, "好的，来一个");
    assert_eq!(plays.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn empty_extraction_still_counts_as_a_reply() {
    let (_dir, config, broker) = scratch_setup();

    let model = ScriptedModel::default()
        .with_analysis(Intent::Command, "做点什么吧")
        .with_extraction(CommandExtraction::default());

    let pause = PauseHandle::new();
    let (player, _plays) = recording_player(&pause);
    let mut assistant = Assistant::new(
        config,
        broker,
        ScriptedRecognizer::new(&["做点什么吧"]),
        model,
        StubSynthesizer,
        player,
    );

    assistant.handle_utterance(&make_utterance(), &pause).await;

    let entries: Vec<_> = assistant.context().entries().collect();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1].text, "抱歉，我没听懂具体的指令。");
    // "Did not understand" opens the window like any other reply
    assert!(assistant.is_active());
}

#[tokio::test]
async fn suggestion_is_spoken_when_nothing_concrete_matched() {
    let (_dir, config, broker) = scratch_setup();

    let extraction: CommandExtraction = {
        let content = r#"{
            "commands": [],
            "potential": [{"type": "ac", "action": "开", "suggestion": "为您打开空调？"}]
        }"#;
        let raw: serde_json::Value = serde_json::from_str(content).unwrap();
        CommandExtraction {
            commands: vec![],
            potential: serde_json::from_value(raw["potential"].clone()).unwrap(),
        }
    };

    let model = ScriptedModel::default()
        .with_analysis(Intent::Command, "有点热")
        .with_extraction(extraction);

    let pause = PauseHandle::new();
    let (player, _plays) = recording_player(&pause);
    let mut assistant = Assistant::new(
        config,
        broker,
        ScriptedRecognizer::new(&["有点热"]),
        model,
        StubSynthesizer,
        player,
    );

    assistant.handle_utterance(&make_utterance(), &pause).await;

    let entries: Vec<_> = assistant.context().entries().collect();
    assert_eq!(entries[1].text, "为您打开空调？");
}

#[tokio::test]
async fn publish_failure_yields_failure_reply_and_no_state_change() {
    let dir = tempfile::tempdir().unwrap();
    let sub_dir = dir.path().join("gone");
    std::fs::create_dir_all(&sub_dir).unwrap();

    let mut config = Config::default();
    config.broker.log_path = Some(sub_dir.join("commands.jsonl"));
    let broker = FileBroker::open(&config.broker_log_path(), config.poll_interval()).unwrap();

    // Pull the directory out from under the broker so appends fail
    std::fs::remove_dir_all(&sub_dir).unwrap();

    let model = ScriptedModel::default()
        .with_analysis(Intent::Command, "开灯")
        .with_extraction(CommandExtraction {
            commands: vec![Command::new(DeviceKind::Light, "灯", "开")],
            potential: vec![],
        });

    let pause = PauseHandle::new();
    let (player, _plays) = recording_player(&pause);
    let mut assistant = Assistant::new(
        config,
        broker,
        ScriptedRecognizer::new(&["开灯"]),
        model,
        StubSynthesizer,
        player,
    );

    assistant.handle_utterance(&make_utterance(), &pause).await;

    // Command was not retried and device state is untouched
    assert_eq!(
        assistant.devices().switch_state(DeviceKind::Light),
        Some(SwitchState::Off)
    );
    let entries: Vec<_> = assistant.context().entries().collect();
    assert_eq!(entries[1].text, "抱歉，开灯失败了");
    assert!(entries[1].command.is_none());
}

#[tokio::test]
async fn tts_failure_still_resumes_capture() {
    let (_dir, config, broker) = scratch_setup();

    let model = ScriptedModel::default()
        .with_analysis(Intent::Chat, "你好")
        .with_reply("你好呀");

    let pause = PauseHandle::new();
    let (player, plays) = recording_player(&pause);
    let mut assistant = Assistant::new(
        config,
        broker,
        ScriptedRecognizer::new(&["你好"]),
        model,
        FailingSynthesizer,
        player,
    );

    assistant.handle_utterance(&make_utterance(), &pause).await;

    // No playback happened, but the turn is recorded, the window is open,
    // and the pause guard released capture
    assert!(plays.lock().unwrap().is_empty());
    assert_eq!(assistant.context().len(), 2);
    assert!(assistant.is_active());
    assert!(!pause.is_paused());
}

#[tokio::test]
async fn empty_transcription_drops_the_segment() {
    let (_dir, config, broker) = scratch_setup();

    let pause = PauseHandle::new();
    let (player, plays) = recording_player(&pause);
    let mut assistant = Assistant::new(
        config,
        broker,
        ScriptedRecognizer::new(&["   "]),
        ScriptedModel::default(),
        StubSynthesizer,
        player,
    );

    assistant.handle_utterance(&make_utterance(), &pause).await;

    assert!(assistant.context().is_empty());
    assert!(plays.lock().unwrap().is_empty());
}
