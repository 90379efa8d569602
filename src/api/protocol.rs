//! Wire types for the OpenAI-compatible endpoints.
//!
//! Requests deserialize leniently: optional sampling fields stay `None` so
//! the backend default applies. Responses serialize to the exact shapes
//! clients of the chat completions API expect.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::{GenerationOptions, InferenceError, OutputGrammar, Penalties};
use crate::error::GatewayError;

/// Token accounting for one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn with_prompt(prompt_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens: 0,
            total_tokens: prompt_tokens,
        }
    }

    pub fn add_completion(&mut self, tokens: u32) {
        self.completion_tokens += tokens;
        self.total_tokens = self.prompt_tokens + self.completion_tokens;
    }
}

/// Embeddings have no completion phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingUsage {
    pub prompt_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(text.into()),
        }
    }
}

/// Plain text, or a list of typed parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
    Audio { input_audio: InputAudio },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputAudio {
    pub data: String,
    pub format: String,
}

/// `stop` accepts one string or a list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StopSequences {
    One(String),
    Many(Vec<String>),
}

impl StopSequences {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(stop) => vec![stop],
            Self::Many(stops) => stops,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseFormat {
    Text,
    JsonObject,
    JsonSchema {
        #[serde(default)]
        json_schema: Option<JsonSchemaFormat>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonSchemaFormat {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub schema: Option<Value>,
}

impl ResponseFormat {
    /// Grammar the backend must honor, if any.
    pub fn grammar(&self) -> Result<Option<OutputGrammar>, InferenceError> {
        match self {
            Self::Text => Ok(None),
            Self::JsonObject => Ok(Some(OutputGrammar::json_object())),
            Self::JsonSchema { json_schema } => match json_schema.as_ref().and_then(|f| f.schema.clone()) {
                Some(schema) => OutputGrammar::json_schema(schema).map(Some),
                None => Ok(None),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamOptions {
    #[serde(default)]
    pub include_usage: bool,
}

/// Sampling fields shared by chat and raw completions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sampling {
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stop: Option<StopSequences>,
    #[serde(default)]
    pub frequency_penalty: Option<f32>,
    #[serde(default)]
    pub presence_penalty: Option<f32>,
}

impl Sampling {
    /// Engine options with stop sequences normalized to a list.
    pub fn to_options(
        &self,
        max_tokens: Option<u32>,
        grammar: Option<OutputGrammar>,
    ) -> Result<GenerationOptions, GatewayError> {
        let options = GenerationOptions {
            temperature: self.temperature,
            top_p: self.top_p,
            max_tokens,
            stop: self.stop.clone().map(StopSequences::into_vec).unwrap_or_default(),
            penalties: Penalties {
                frequency: self.frequency_penalty,
                presence: self.presence_penalty,
            },
            grammar,
        };
        options.validate()?;
        Ok(options)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(flatten)]
    pub sampling: Sampling,
    #[serde(default)]
    pub max_completion_tokens: Option<u32>,
    #[serde(default)]
    pub response_format: Option<ResponseFormat>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub stream_options: Option<StreamOptions>,
}

impl ChatCompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            sampling: Sampling::default(),
            max_completion_tokens: None,
            response_format: None,
            stream: false,
            stream_options: None,
        }
    }

    pub fn include_usage(&self) -> bool {
        self.stream_options.map(|o| o.include_usage).unwrap_or(false)
    }

    pub fn generation_options(&self) -> Result<GenerationOptions, GatewayError> {
        let grammar = match &self.response_format {
            Some(format) => format.grammar()?,
            None => None,
        };
        let max_tokens = self.sampling.max_tokens.or(self.max_completion_tokens);
        self.sampling.to_options(max_tokens, grammar)
    }
}

/// One prompt or a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Prompt {
    One(String),
    Many(Vec<String>),
}

impl Prompt {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(prompt) => vec![prompt],
            Self::Many(prompts) => prompts,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::One(_) => 1,
            Self::Many(prompts) => prompts.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Default `max_tokens` for raw completions.
pub const DEFAULT_COMPLETION_MAX_TOKENS: u32 = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: Prompt,
    #[serde(flatten)]
    pub sampling: Sampling,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub stream_options: Option<StreamOptions>,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, prompt: Prompt) -> Self {
        Self {
            model: model.into(),
            prompt,
            sampling: Sampling::default(),
            stream: false,
            stream_options: None,
        }
    }

    pub fn include_usage(&self) -> bool {
        self.stream_options.map(|o| o.include_usage).unwrap_or(false)
    }

    pub fn generation_options(&self) -> Result<GenerationOptions, GatewayError> {
        let max_tokens = self.sampling.max_tokens.unwrap_or(DEFAULT_COMPLETION_MAX_TOKENS);
        self.sampling.to_options(Some(max_tokens), None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EmbeddingKind {
    Text,
    ImageBase64,
    ImageUrl,
}

impl EmbeddingKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::ImageBase64 => "image-base64",
            Self::ImageUrl => "image-url",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EmbeddingItem {
    Text(String),
    Typed {
        #[serde(rename = "type")]
        kind: EmbeddingKind,
        content: String,
    },
}

impl EmbeddingItem {
    pub fn kind(&self) -> EmbeddingKind {
        match self {
            Self::Text(_) => EmbeddingKind::Text,
            Self::Typed { kind, .. } => *kind,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Self::Text(content) | Self::Typed { content, .. } => content,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EmbeddingInput {
    One(String),
    Many(Vec<EmbeddingItem>),
}

impl EmbeddingInput {
    pub fn into_items(self) -> Vec<EmbeddingItem> {
        match self {
            Self::One(text) => vec![EmbeddingItem::Text(text)],
            Self::Many(items) => items,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingsRequest {
    pub model: String,
    pub input: EmbeddingInput,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub role: String,
    pub content: String,
    pub refusal: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatChoice {
    pub index: u32,
    pub message: AssistantMessage,
    pub logprobs: Option<Value>,
    pub finish_reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    pub usage: Usage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatChunkChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatChunkChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ChatCompletionChunk {
    pub fn finish_reason(&self) -> Option<&str> {
        self.choices.first().and_then(|c| c.finish_reason.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextChoice {
    pub index: u32,
    pub text: String,
    pub logprobs: Option<Value>,
    pub finish_reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<TextChoice>,
    pub usage: Usage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextChunkChoice {
    pub index: u32,
    pub text: String,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<TextChunkChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl TextCompletionChunk {
    pub fn finish_reason(&self) -> Option<&str> {
        self.choices.first().and_then(|c| c.finish_reason.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingData {
    pub index: u32,
    pub object: String,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingsResponse {
    pub object: String,
    pub data: Vec<EmbeddingData>,
    pub model: String,
    pub usage: EmbeddingUsage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCard {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelCard>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chat_request_accepts_string_and_part_content() {
        let request: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "m.gguf",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": [
                    {"type": "text", "text": "what is this?"},
                    {"type": "image_url", "image_url": {"url": "http://x/cat.png"}},
                    {"type": "audio", "input_audio": {"data": "AAAA", "format": "wav"}}
                ]}
            ],
            "stop": "\n\n",
            "max_completion_tokens": 12,
            "stream": true,
            "stream_options": {"include_usage": true}
        }))
        .unwrap();

        assert!(request.stream);
        assert!(request.include_usage());
        let MessageContent::Parts(parts) = &request.messages[1].content else {
            panic!("expected parts");
        };
        assert_eq!(parts.len(), 3);

        let options = request.generation_options().unwrap();
        assert_eq!(options.stop, vec!["\n\n".to_string()]);
        assert_eq!(options.max_tokens, Some(12));
        assert_eq!(options.grammar, None);
    }

    #[test]
    fn max_tokens_wins_over_max_completion_tokens() {
        let mut request = ChatCompletionRequest::new("m", vec![ChatMessage::new(Role::User, "hi")]);
        request.sampling.max_tokens = Some(5);
        request.max_completion_tokens = Some(50);
        assert_eq!(request.generation_options().unwrap().max_tokens, Some(5));
    }

    #[test]
    fn response_formats_map_to_grammars() {
        let object: ResponseFormat = serde_json::from_value(json!({"type": "json_object"})).unwrap();
        assert_eq!(object.grammar().unwrap(), Some(OutputGrammar::json_object()));

        let schema: ResponseFormat = serde_json::from_value(json!({
            "type": "json_schema",
            "json_schema": {"name": "reply", "schema": {"type": "object"}}
        }))
        .unwrap();
        assert_eq!(
            schema.grammar().unwrap().unwrap().schema(),
            &json!({"type": "object"})
        );

        let text: ResponseFormat = serde_json::from_value(json!({"type": "text"})).unwrap();
        assert_eq!(text.grammar().unwrap(), None);

        let bad: ResponseFormat = serde_json::from_value(json!({
            "type": "json_schema",
            "json_schema": {"schema": "not an object"}
        }))
        .unwrap();
        assert!(bad.grammar().is_err());
    }

    #[test]
    fn completion_prompt_and_default_max_tokens() {
        let request: CompletionRequest = serde_json::from_value(json!({
            "model": "m.gguf",
            "prompt": ["a", "b", "c"],
            "stop": ["x", "y"]
        }))
        .unwrap();
        assert_eq!(request.prompt.len(), 3);
        let options = request.generation_options().unwrap();
        assert_eq!(options.max_tokens, Some(DEFAULT_COMPLETION_MAX_TOKENS));
        assert_eq!(options.stop.len(), 2);
    }

    #[test]
    fn embedding_input_mixes_strings_and_typed_items() {
        let request: EmbeddingsRequest = serde_json::from_value(json!({
            "model": "m.gguf",
            "input": ["hello", {"type": "image-url", "content": "http://x/cat.png"}]
        }))
        .unwrap();
        let items = request.input.into_items();
        assert_eq!(items[0].kind(), EmbeddingKind::Text);
        assert_eq!(items[1].kind(), EmbeddingKind::ImageUrl);
        assert_eq!(items[1].kind().as_str(), "image-url");

        let single: EmbeddingInput = serde_json::from_value(json!("hello")).unwrap();
        assert_eq!(single.into_items(), vec![EmbeddingItem::Text("hello".into())]);
    }

    #[test]
    fn chunk_usage_is_omitted_when_absent() {
        let chunk = TextCompletionChunk {
            id: "cmpl-1".into(),
            object: "text.completion.chunk".into(),
            created: 0,
            model: "m".into(),
            choices: vec![TextChunkChoice {
                index: 0,
                text: "hi".into(),
                finish_reason: None,
            }],
            usage: None,
        };
        let value = serde_json::to_value(&chunk).unwrap();
        assert!(value.get("usage").is_none());
        assert_eq!(value["choices"][0]["finish_reason"], Value::Null);
    }

    #[test]
    fn usage_tracks_totals() {
        let mut usage = Usage::with_prompt(10);
        usage.add_completion(3);
        usage.add_completion(2);
        assert_eq!(usage.total_tokens, 15);
        assert_eq!(usage.completion_tokens, 5);
    }
}
