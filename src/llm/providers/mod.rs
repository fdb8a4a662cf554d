//! Concrete [`LlmProvider`](crate::llm::LlmProvider) implementations

pub mod openai;

pub use openai::{OpenAiConfig, OpenAiProvider};
