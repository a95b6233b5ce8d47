use std::fmt::{Display, Formatter};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

pub const DEFAULT_TEMPERATURE: f64 = 0.2;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com/v1";
const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("missing base URL for openai-compatible provider")]
    MissingBaseUrl,
    #[error("invalid base URL `{url}`: {source}")]
    InvalidBaseUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("LLM response fail: {status} {status_text}: {body}")]
    Status { status: u16, status_text: String, body: String },
    #[error("LLM transport error: {0}")]
    Transport(String),
    #[error("malformed completion response: {0}")]
    MalformedResponse(String),
    #[error("no content returned from LLM")]
    EmptyContent,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub enum Provider {
    #[default]
    #[serde(rename = "deepseek")]
    DeepSeek,
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "openai-compatible")]
    OpenAiCompatible,
}

impl Provider {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DeepSeek => "deepseek",
            Self::OpenAi => "openai",
            Self::OpenAiCompatible => "openai-compatible",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "deepseek" => Some(Self::DeepSeek),
            "openai" => Some(Self::OpenAi),
            "openai-compatible" => Some(Self::OpenAiCompatible),
            _ => None,
        }
    }

    /// Provider named by configuration, falling back to DeepSeek for absent or unknown names.
    #[must_use]
    pub fn resolve(value: Option<&str>) -> Self {
        value.and_then(Self::parse).unwrap_or_default()
    }

    fn default_base_url(self) -> Option<&'static str> {
        match self {
            Self::DeepSeek => Some(DEEPSEEK_BASE_URL),
            Self::OpenAi => Some(OPENAI_BASE_URL),
            Self::OpenAiCompatible => None,
        }
    }
}

impl Display for Provider {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: content.into() }
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: content.into() }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatCompletionRequest {
    pub provider: Provider,
    pub api_key: String,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f64>,
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ChatCompletionResponse {
    pub content: String,
}

#[derive(Debug, Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f64,
}

#[derive(Debug, Deserialize)]
struct CompletionReply {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    message: Option<CompletionMessage>,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Seam between the extractor and the transport.
pub trait ChatCompletion {
    /// Issue one completion request and return the trimmed first-choice text.
    ///
    /// # Errors
    /// Returns [`LlmError`] for configuration, transport, status, or decoding failures.
    fn complete(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, LlmError>;
}

/// Explicit base URL, else the provider's well-known endpoint.
///
/// # Errors
/// Returns [`LlmError::MissingBaseUrl`] for `openai-compatible` without a base URL.
pub fn resolve_base_url(provider: Provider, base_url: Option<&str>) -> Result<String, LlmError> {
    match base_url.filter(|url| !url.is_empty()) {
        Some(url) => Ok(url.to_string()),
        None => provider.default_base_url().map(str::to_string).ok_or(LlmError::MissingBaseUrl),
    }
}

/// `<base>/chat/completions`, tolerating a base with or without a trailing slash.
///
/// # Errors
/// Returns [`LlmError::InvalidBaseUrl`] when the base cannot be parsed.
pub fn chat_completions_url(base_url: &str) -> Result<Url, LlmError> {
    let normalized =
        if base_url.ends_with('/') { base_url.to_string() } else { format!("{base_url}/") };
    Url::parse(&normalized)
        .and_then(|base| base.join("chat/completions"))
        .map_err(|source| LlmError::InvalidBaseUrl { url: base_url.to_string(), source })
}

/// Blocking HTTP implementation over `ureq`.
#[derive(Debug, Clone)]
pub struct UreqChatClient {
    agent: ureq::Agent,
}

impl UreqChatClient {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { agent: ureq::AgentBuilder::new().timeout(timeout).build() }
    }
}

impl Default for UreqChatClient {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl ChatCompletion for UreqChatClient {
    fn complete(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, LlmError> {
        let base_url = resolve_base_url(request.provider, request.base_url.as_deref())?;
        let url = chat_completions_url(&base_url)?;
        let body = CompletionBody {
            model: &request.model,
            messages: &request.messages,
            temperature: request.temperature.unwrap_or(DEFAULT_TEMPERATURE),
        };

        tracing::debug!(
            provider = %request.provider,
            model = %request.model,
            %url,
            "sending chat completion"
        );
        let response = match self
            .agent
            .post(url.as_str())
            .set("Content-Type", "application/json")
            .set("Authorization", &format!("Bearer {}", request.api_key))
            .send_json(&body)
        {
            Ok(response) => response,
            Err(ureq::Error::Status(status, response)) => {
                let status_text = response.status_text().to_string();
                let body = response.into_string().unwrap_or_default();
                return Err(LlmError::Status { status, status_text, body });
            }
            Err(ureq::Error::Transport(transport)) => {
                return Err(LlmError::Transport(transport.to_string()));
            }
        };

        let reply: CompletionReply = response
            .into_json()
            .map_err(|err| LlmError::MalformedResponse(err.to_string()))?;
        let content = reply
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .and_then(|message| message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or(LlmError::EmptyContent)?;

        Ok(ChatCompletionResponse { content })
    }
}

/// Run one request, logging and swallowing any failure.
pub fn create_chat_completion<C>(
    client: &C,
    request: &ChatCompletionRequest,
) -> Option<ChatCompletionResponse>
where
    C: ChatCompletion + ?Sized,
{
    match client.complete(request) {
        Ok(response) => Some(response),
        Err(err) => {
            tracing::warn!(provider = %request.provider, error = %err, "chat completion failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread::{self, JoinHandle};

    use super::*;

    fn find_header_end(buffer: &[u8]) -> Option<usize> {
        buffer.windows(4).position(|window| window == b"\r\n\r\n")
    }

    fn read_request(stream: &mut std::net::TcpStream) -> String {
        let mut buffer = Vec::new();
        let mut chunk = [0_u8; 4096];
        loop {
            let read = stream
                .read(&mut chunk)
                .unwrap_or_else(|err| panic!("failed to read request: {err}"));
            if read == 0 {
                break;
            }
            buffer.extend_from_slice(&chunk[..read]);
            if let Some(header_end) = find_header_end(&buffer) {
                let headers = String::from_utf8_lossy(&buffer[..header_end]).to_ascii_lowercase();
                let length = headers
                    .lines()
                    .find_map(|line| line.strip_prefix("content-length:"))
                    .and_then(|value| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buffer.len() >= header_end + 4 + length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }

    /// One-shot HTTP responder; the join handle yields the raw request it received.
    fn serve_once(status_line: &'static str, body: &str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0")
            .unwrap_or_else(|err| panic!("failed to bind test listener: {err}"));
        let addr = listener
            .local_addr()
            .unwrap_or_else(|err| panic!("failed to read listener address: {err}"));
        let body = body.to_string();
        let handle = thread::spawn(move || {
            let (mut stream, _) =
                listener.accept().unwrap_or_else(|err| panic!("failed to accept: {err}"));
            let request = read_request(&mut stream);
            let response = format!(
                "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream
                .write_all(response.as_bytes())
                .unwrap_or_else(|err| panic!("failed to write response: {err}"));
            request
        });
        (format!("http://{addr}/v1"), handle)
    }

    fn request_for(base_url: Option<String>, provider: Provider) -> ChatCompletionRequest {
        ChatCompletionRequest {
            provider,
            api_key: "test-key".to_string(),
            model: "test-model".to_string(),
            messages: vec![ChatMessage::system("be strict"), ChatMessage::user("hello")],
            temperature: None,
            base_url,
        }
    }

    #[test]
    fn provider_resolution_defaults_to_deepseek() {
        assert_eq!(Provider::resolve(None), Provider::DeepSeek);
        assert_eq!(Provider::resolve(Some("anthropic")), Provider::DeepSeek);
        assert_eq!(Provider::resolve(Some("openai")), Provider::OpenAi);
        assert_eq!(Provider::resolve(Some("openai-compatible")), Provider::OpenAiCompatible);
    }

    #[test]
    fn base_url_prefers_explicit_value() {
        assert!(matches!(
            resolve_base_url(Provider::OpenAi, Some("http://localhost:8080/v1")),
            Ok(url) if url == "http://localhost:8080/v1"
        ));
        assert!(matches!(
            resolve_base_url(Provider::DeepSeek, None),
            Ok(url) if url == "https://api.deepseek.com/v1"
        ));
        assert!(matches!(
            resolve_base_url(Provider::OpenAiCompatible, None),
            Err(LlmError::MissingBaseUrl)
        ));
    }

    #[test]
    fn completions_url_handles_trailing_slash() {
        for base in ["https://api.openai.com/v1", "https://api.openai.com/v1/"] {
            match chat_completions_url(base) {
                Ok(url) => assert_eq!(url.as_str(), "https://api.openai.com/v1/chat/completions"),
                Err(err) => panic!("url should build: {err}"),
            }
        }
        assert!(matches!(chat_completions_url("not a url"), Err(LlmError::InvalidBaseUrl { .. })));
    }

    #[test]
    fn openai_compatible_without_base_url_fails_before_any_io() {
        let client = UreqChatClient::default();
        let request = request_for(None, Provider::OpenAiCompatible);

        assert!(matches!(client.complete(&request), Err(LlmError::MissingBaseUrl)));
        assert_eq!(create_chat_completion(&client, &request), None);
    }

    #[test]
    fn successful_reply_is_trimmed_and_request_is_openai_shaped() {
        let (base_url, server) =
            serve_once("200 OK", r#"{"choices":[{"message":{"content":"  [] \n"}}]}"#);
        let client = UreqChatClient::new(Duration::from_secs(5));

        let response = client.complete(&request_for(Some(base_url), Provider::OpenAiCompatible));
        let request = server.join().unwrap_or_else(|_| panic!("server thread panicked"));

        match response {
            Ok(response) => assert_eq!(response.content, "[]"),
            Err(err) => panic!("completion should succeed: {err}"),
        }
        assert!(request.starts_with("POST /v1/chat/completions"));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer test-key"));
        assert!(request.contains(r#""temperature":0.2"#));
        assert!(request.contains(r#""role":"system""#));
        assert!(request.contains(r#""model":"test-model""#));
    }

    #[test]
    fn non_success_status_is_reported() {
        let (base_url, server) = serve_once("500 Internal Server Error", r#"{"error":"boom"}"#);
        let client = UreqChatClient::new(Duration::from_secs(5));

        let result = client.complete(&request_for(Some(base_url), Provider::OpenAi));
        let _ = server.join();

        match result {
            Err(LlmError::Status { status, body, .. }) => {
                assert_eq!(status, 500);
                assert!(body.contains("boom"));
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[test]
    fn blank_content_is_treated_as_failure() {
        let (base_url, server) =
            serve_once("200 OK", r#"{"choices":[{"message":{"content":"   "}}]}"#);
        let client = UreqChatClient::new(Duration::from_secs(5));

        let request = request_for(Some(base_url), Provider::OpenAi);
        let result = create_chat_completion(&client, &request);
        let _ = server.join();

        assert_eq!(result, None);
    }

    #[test]
    fn reply_without_choices_is_treated_as_failure() {
        let (base_url, server) = serve_once("200 OK", r#"{"id":"x"}"#);
        let client = UreqChatClient::new(Duration::from_secs(5));

        let result = client.complete(&request_for(Some(base_url), Provider::OpenAi));
        let _ = server.join();

        assert!(matches!(result, Err(LlmError::EmptyContent)));
    }
}
