use engram_core::{Category, MemoryCandidate};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::client::{
    create_chat_completion, ChatCompletion, ChatCompletionRequest, ChatMessage, Provider,
    DEFAULT_TEMPERATURE,
};

pub const DEFAULT_MODEL: &str = "deepseek-chat";

pub const SYSTEM_INSTRUCTION: &str =
    "You are a rigorous memory extractor that outputs strictly formatted JSON.";

const PROMPT_TEMPLATE: &str = r#"
You are an assistant for extracting conversational memories.
Please extract memories that can be used long-term from the conversation between the user and the assistant.

The allowed memory types are:
- profile (long-term stable information, such as identity or family)
- project (ongoing projects)
- goal (short- to mid-term goals)
- preference (language, style, or other preferences)
- temp (temporary states)

Rules:
- Only output memories when the information is clear and has long-term value; if there is no valid information, return an empty array.
- For each memory, return a JSON object:
  { "type": <type>, "content": <string>, "rationale": <string>, "confidence": <0-1> }
- If there are no extractable memories, return [].

Conversation content:
"#;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ConversationMessage {
    pub role: MessageRole,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractorConfig {
    pub api_key: String,
    pub model: String,
    pub provider: Provider,
    pub base_url: Option<String>,
}

impl ExtractorConfig {
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            provider: Provider::default(),
            base_url: None,
        }
    }

    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    #[must_use]
    pub fn with_provider(mut self, provider: Provider) -> Self {
        self.provider = provider;
        self
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: Option<String>) -> Self {
        self.base_url = base_url;
        self
    }
}

/// Extraction prompt: the fixed instructions followed by one `role: message` line per turn.
#[must_use]
pub fn build_prompt(messages: &[ConversationMessage]) -> String {
    let conversation = messages
        .iter()
        .map(|item| format!("{}: {}", item.role.as_str(), item.message))
        .collect::<Vec<_>>()
        .join("\n");
    format!("{PROMPT_TEMPLATE}{conversation}").trim().to_string()
}

fn strip_code_fence(reply: &str) -> &str {
    let trimmed = reply.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop an info string such as `json` on the opening fence line.
    let body = match rest.split_once('\n') {
        Some((_, body)) => body,
        None => rest.trim_start_matches("json"),
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

fn candidate_from_value(value: &Value) -> Option<MemoryCandidate> {
    let item = value.as_object()?;
    let category = item.get("type").and_then(Value::as_str).and_then(Category::parse)?;
    let content = item.get("content").and_then(Value::as_str)?;
    let rationale = item.get("rationale").and_then(Value::as_str).unwrap_or_default();
    let confidence = item.get("confidence").and_then(Value::as_f64);

    Some(MemoryCandidate {
        category,
        content: content.to_string(),
        rationale: rationale.to_string(),
        confidence,
    })
}

/// Decode a model reply into candidates.
///
/// Returns `None` when the reply is not a JSON array. Entries with an unknown `type` or no
/// string `content` are skipped.
#[must_use]
pub fn parse_candidates(reply: &str) -> Option<Vec<MemoryCandidate>> {
    let items = match serde_json::from_str::<Vec<Value>>(strip_code_fence(reply)) {
        Ok(items) => items,
        Err(err) => {
            tracing::warn!(error = %err, reply, "extractor reply is not a JSON array");
            return None;
        }
    };

    let candidates = items
        .iter()
        .enumerate()
        .filter_map(|(index, item)| {
            let candidate = candidate_from_value(item);
            if candidate.is_none() {
                tracing::warn!(index, entry = %item, "skipping invalid memory candidate");
            }
            candidate
        })
        .collect();
    Some(candidates)
}

/// Ask the model for memory candidates found in `messages`.
///
/// `None` means the call or the decoding failed; an empty list means nothing worth keeping.
pub fn extract_memories<C>(
    client: &C,
    messages: &[ConversationMessage],
    config: &ExtractorConfig,
) -> Option<Vec<MemoryCandidate>>
where
    C: ChatCompletion + ?Sized,
{
    let request = ChatCompletionRequest {
        provider: config.provider,
        api_key: config.api_key.clone(),
        model: config.model.clone(),
        messages: vec![
            ChatMessage::system(SYSTEM_INSTRUCTION),
            ChatMessage::user(build_prompt(messages)),
        ],
        temperature: Some(DEFAULT_TEMPERATURE),
        base_url: config.base_url.clone(),
    };
    let response = create_chat_completion(client, &request)?;
    let candidates = parse_candidates(&response.content)?;
    tracing::debug!(count = candidates.len(), "extracted memory candidates");
    Some(candidates)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::client::{ChatCompletionResponse, ChatRole, LlmError};

    struct FakeClient {
        reply: Result<String, ()>,
        seen: RefCell<Vec<ChatCompletionRequest>>,
    }

    impl FakeClient {
        fn replying(reply: &str) -> Self {
            Self { reply: Ok(reply.to_string()), seen: RefCell::new(Vec::new()) }
        }

        fn failing() -> Self {
            Self { reply: Err(()), seen: RefCell::new(Vec::new()) }
        }
    }

    impl ChatCompletion for FakeClient {
        fn complete(
            &self,
            request: &ChatCompletionRequest,
        ) -> Result<ChatCompletionResponse, LlmError> {
            self.seen.borrow_mut().push(request.clone());
            match &self.reply {
                Ok(content) => Ok(ChatCompletionResponse { content: content.clone() }),
                Err(()) => Err(LlmError::EmptyContent),
            }
        }
    }

    fn conversation() -> Vec<ConversationMessage> {
        vec![
            ConversationMessage { role: MessageRole::User, message: "I'm Steve.".to_string() },
            ConversationMessage { role: MessageRole::Assistant, message: "Hi Steve!".to_string() },
        ]
    }

    #[test]
    fn prompt_ends_with_rendered_conversation() {
        let prompt = build_prompt(&conversation());

        assert!(prompt.starts_with("You are an assistant for extracting conversational memories."));
        assert!(prompt.contains("- temp (temporary states)"));
        assert!(prompt.ends_with("Conversation content:\nuser: I'm Steve.\nassistant: Hi Steve!"));
    }

    #[test]
    fn empty_conversation_prompt_is_trimmed() {
        assert!(build_prompt(&[]).ends_with("Conversation content:"));
    }

    #[test]
    fn parses_plain_and_fenced_arrays() {
        let plain =
            r#"[{"type":"profile","content":"name: Steve","rationale":"stated","confidence":0.95}]"#;
        let fenced = format!("```json\n{plain}\n```");

        for reply in [plain.to_string(), fenced] {
            let candidates = parse_candidates(&reply)
                .unwrap_or_else(|| panic!("reply should parse: {reply}"));
            assert_eq!(
                candidates,
                vec![MemoryCandidate::new(Category::Profile, "name: Steve", 0.95)
                    .with_rationale("stated")]
            );
        }
    }

    #[test]
    fn single_line_fence_keeps_its_body() {
        assert_eq!(parse_candidates("```[]```"), Some(Vec::new()));
        assert_eq!(parse_candidates("```json[]```"), Some(Vec::new()));

        let candidates = parse_candidates(r#"```json [{"type":"goal","content":"ship v1"}] ```"#)
            .unwrap_or_else(|| panic!("single-line fence should parse"));
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].category, Category::Goal);
    }

    #[test]
    fn invalid_entries_are_skipped() {
        let reply = r#"[
            {"type":"hobby","content":"chess"},
            {"type":"goal"},
            "loose string",
            {"type":"temp","content":"tired today"}
        ]"#;

        let candidates = parse_candidates(reply).unwrap_or_else(|| panic!("array should parse"));
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].category, Category::Temp);
        assert_eq!(candidates[0].rationale, "");
        assert_eq!(candidates[0].confidence, None);
    }

    #[test]
    fn non_array_reply_is_none() {
        assert_eq!(parse_candidates("Sure! Here are the memories."), None);
        assert_eq!(parse_candidates(r#"{"type":"profile","content":"x"}"#), None);
        assert_eq!(parse_candidates("[]"), Some(Vec::new()));
    }

    #[test]
    fn extract_sends_system_and_user_messages() {
        let client = FakeClient::replying(
            r#"[{"type":"preference","content":"likes TypeScript","confidence":0.8}]"#,
        );
        let config = ExtractorConfig::new("key")
            .with_provider(Provider::OpenAi)
            .with_model("gpt-4o-mini");

        let candidates = extract_memories(&client, &conversation(), &config);

        assert_eq!(candidates.map(|items| items.len()), Some(1));
        let seen = client.seen.borrow();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].provider, Provider::OpenAi);
        assert_eq!(seen[0].model, "gpt-4o-mini");
        assert_eq!(seen[0].temperature, Some(0.2));
        assert_eq!(seen[0].messages[0].role, ChatRole::System);
        assert_eq!(seen[0].messages[0].content, SYSTEM_INSTRUCTION);
        assert_eq!(seen[0].messages[1].role, ChatRole::User);
        assert_eq!(seen[0].messages[1].content, build_prompt(&conversation()));
    }

    #[test]
    fn extract_returns_none_on_client_failure() {
        let client = FakeClient::failing();
        assert_eq!(extract_memories(&client, &conversation(), &ExtractorConfig::new("key")), None);
    }

    #[test]
    fn config_defaults_to_deepseek_chat() {
        let config = ExtractorConfig::new("key");
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.provider, Provider::DeepSeek);
        assert_eq!(config.base_url, None);
    }
}
