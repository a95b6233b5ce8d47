//! Chat completion client and memory extractor.
//!
//! Both are thin glue over an OpenAI-compatible endpoint. Failures surface as `None` from
//! the high-level entry points so callers can treat them as "no update this cycle".

mod client;
mod extractor;

pub use client::{
    chat_completions_url, create_chat_completion, resolve_base_url, ChatCompletion,
    ChatCompletionRequest, ChatCompletionResponse, ChatMessage, ChatRole, LlmError, Provider,
    UreqChatClient, DEFAULT_TEMPERATURE, DEFAULT_TIMEOUT,
};
pub use extractor::{
    build_prompt, extract_memories, parse_candidates, ConversationMessage, ExtractorConfig,
    MessageRole, DEFAULT_MODEL, SYSTEM_INSTRUCTION,
};
