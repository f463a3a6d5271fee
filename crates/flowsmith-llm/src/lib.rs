//! Minimal multi-provider chat client.
//!
//! Flowsmith only needs single-shot, non-streaming text completions to
//! classify prompts, so this crate covers exactly that for the Anthropic
//! Messages API and the OpenAI Chat Completions API (plus compatible
//! endpoints such as Gemini's OpenAI surface, Ollama, or vLLM).

pub mod client;
pub mod error;
pub mod types;

pub use client::{LlmClient, LlmClientConfig, LlmProvider};
pub use error::{LlmError, Result};
pub use types::{ChatRequest, ChatResponse, Message, Role};
