//! LLM provider abstraction used by the inference layer

pub mod provider;
pub mod providers;

pub use provider::*;
pub use providers::*;
