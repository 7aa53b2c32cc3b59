//! Language model collaborators
//!
//! Three narrow contracts: intent analysis (with ASR error correction),
//! device command extraction, and free-form chat replies. The concrete
//! client speaks the Ollama generate API; responses are JSON that may
//! arrive wrapped in markdown code fences, so parsing extracts the
//! outermost object before deserializing.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::devices::{Command, SuggestedCommand};
use crate::{Error, Result};

/// Classified intent of an utterance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    /// Contains a device control instruction
    Command,
    /// Conversation addressed to the assistant
    Chat,
    /// Background noise, self-talk, or garbled recognition
    #[default]
    Ignore,
}

/// Result of intent analysis
#[derive(Debug, Clone, Deserialize)]
pub struct IntentAnalysis {
    /// Input text with ASR errors corrected (may equal the input)
    #[serde(default)]
    pub corrected_text: String,

    /// Classified intent; missing field counts as ignore
    #[serde(default)]
    pub intent: Intent,

    /// Model's stated reason, for logs only
    #[serde(default)]
    pub reason: String,
}

impl IntentAnalysis {
    /// Conservative fallback when the classifier is unavailable: very short
    /// input is noise, anything longer is probably conversation
    #[must_use]
    pub fn fallback(text: &str) -> Self {
        let intent = if text.chars().count() < 2 {
            Intent::Ignore
        } else {
            Intent::Chat
        };
        Self {
            corrected_text: text.to_string(),
            intent,
            reason: "classifier unavailable".to_string(),
        }
    }
}

/// Result of command extraction
#[derive(Debug, Clone, Default)]
pub struct CommandExtraction {
    /// Commands the model is certain about
    pub commands: Vec<Command>,
    /// Inferred-but-unconfirmed commands, each with a question to ask
    pub potential: Vec<SuggestedCommand>,
}

/// The LLM collaborator contract
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Correct ASR errors and classify intent
    ///
    /// # Errors
    ///
    /// Returns error on service failure; callers degrade via
    /// [`IntentAnalysis::fallback`].
    async fn analyze_intent(&self, text: &str, context: &str) -> Result<IntentAnalysis>;

    /// Extract concrete and potential device commands
    ///
    /// # Errors
    ///
    /// Returns error on service failure; callers degrade to an empty
    /// extraction.
    async fn recognize_command(
        &self,
        text: &str,
        context: &str,
        device_states: &str,
    ) -> Result<CommandExtraction>;

    /// Generate a short conversational reply
    ///
    /// # Errors
    ///
    /// Returns error on service failure; callers degrade to a canned
    /// apology.
    async fn chat_reply(&self, text: &str, context: &str) -> Result<String>;
}

/// Request body for the Ollama generate endpoint
#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

/// Response body from the Ollama generate endpoint
#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

/// Ollama-backed language model client
pub struct OllamaModel {
    client: reqwest::Client,
    api_url: String,
    model: String,
}

impl OllamaModel {
    /// Create a client from configuration
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_url: format!("{}/api/generate", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
        })
    }

    /// Run one non-streaming generation
    async fn generate(&self, prompt: &str) -> Result<String> {
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
        };

        let response = self
            .client
            .post(&self.api_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Llm(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::Llm(format!(
                "generate failed: {}",
                response.status()
            )));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| Error::Llm(e.to_string()))?;

        let content = parsed.response.trim().to_string();
        if content.is_empty() {
            return Err(Error::Llm("model returned empty response".to_string()));
        }
        Ok(content)
    }
}

#[async_trait]
impl LanguageModel for OllamaModel {
    async fn analyze_intent(&self, text: &str, context: &str) -> Result<IntentAnalysis> {
        let prompt = format!(
            "你是一个智能语音助手。用户输入来自语音识别（ASR），可能存在同音字错误或不完整。\
             请先结合上下文修正识别错误（只有在非常有把握时才纠错，完全不通顺的\
             乱码保留原文并判为 ignore），然后判断意图：\n\
             - command: 包含智能家居控制指令（如开灯、关空调、查温度）\n\
             - chat: 针对助手的闲聊或提问\n\
             - ignore: 背景噪音、自言自语、或明显不是对助手说的话\n\n\
             上下文：\n{context}\n\n\
             原始语音文本：\"{text}\"\n\n\
             请严格按照JSON格式返回：\n\
             {{\"corrected_text\": \"修正后的文本\", \"intent\": \"command\" | \"chat\" | \"ignore\", \"reason\": \"判断理由\"}}"
        );

        let content = self.generate(&prompt).await?;
        parse_intent(&content)
    }

    async fn recognize_command(
        &self,
        text: &str,
        context: &str,
        device_states: &str,
    ) -> Result<CommandExtraction> {
        let mut context_section = String::new();
        if !context.is_empty() {
            context_section.push_str(&format!("最近对话历史：\n{context}\n\n"));
        }
        if !device_states.is_empty() {
            context_section.push_str(&format!("当前设备状态：\n{device_states}\n\n"));
        }

        let prompt = format!(
            "你是一个智能家居指令识别系统，从用户的自然语言输入中提取明确的控制指令。\
             忽略礼貌性修饰语（\"帮我\"、\"请\"），注意否定和修正指令\
             （\"不要打开空调\"意味着确保空调处于关闭状态）。\n\n\
             支持的指令类型：\n\
             1. 开关灯（light）：开、关\n\
             2. 开关空调（ac）：开、关\n\
             3. 开关窗户（window）：开、关\n\
             4. 温度检测（temperature）：检测\n\n\
             示例：\n\
             - \"帮我把空调打开\" -> {{\"commands\": [{{\"type\": \"ac\", \"device\": \"空调\", \"action\": \"开\"}}], \"potential\": []}}\n\
             - \"有点热\" -> {{\"commands\": [], \"potential\": [{{\"type\": \"ac\", \"action\": \"开\", \"suggestion\": \"为您打开空调？\"}}]}}\n\
             - \"查看当前温度\" -> {{\"commands\": [{{\"type\": \"temperature\", \"device\": \"\", \"action\": \"检测\"}}], \"potential\": []}}\n\n\
             {context_section}用户输入：{text}\n\n\
             只返回JSON，不要其他文字说明。"
        );

        let content = self.generate(&prompt).await?;
        parse_extraction(&content)
    }

    async fn chat_reply(&self, text: &str, context: &str) -> Result<String> {
        let prompt = format!(
            "你是一个智能语音助手。请以亲切、自然的口语风格回复用户。\
             回复将转为语音播放，所以要简短有力，避免长篇大论。\n\n\
             对话历史：\n{context}\n\n\
             用户：{text}\n助手："
        );

        self.generate(&prompt).await
    }
}

/// Strip markdown fences by slicing the outermost JSON object
fn extract_json(content: &str) -> &str {
    if let (Some(start), Some(end)) = (content.find('{'), content.rfind('}')) {
        if end > start {
            return &content[start..=end];
        }
    }
    content
}

/// Parse an intent analysis response
fn parse_intent(content: &str) -> Result<IntentAnalysis> {
    serde_json::from_str(extract_json(content))
        .map_err(|e| Error::Llm(format!("unparseable intent analysis: {e}")))
}

/// Loose wire shape of a command extraction response
#[derive(Deserialize)]
struct RawExtraction {
    #[serde(default)]
    commands: Vec<serde_json::Value>,
    #[serde(default)]
    potential: Vec<serde_json::Value>,
}

/// Parse a command extraction response, dropping entries with unknown or
/// malformed device types instead of failing the whole extraction
fn parse_extraction(content: &str) -> Result<CommandExtraction> {
    let raw: RawExtraction = serde_json::from_str(extract_json(content))
        .map_err(|e| Error::Llm(format!("unparseable command extraction: {e}")))?;

    let commands = raw
        .commands
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<Command>(value) {
            Ok(command) => Some(command),
            Err(e) => {
                tracing::debug!(error = %e, "dropping invalid command from extraction");
                None
            }
        })
        .collect();

    let potential = raw
        .potential
        .into_iter()
        .filter_map(|value| serde_json::from_value::<SuggestedCommand>(value).ok())
        .collect();

    Ok(CommandExtraction { commands, potential })
}
