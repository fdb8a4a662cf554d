//! Testing utilities and mock implementations
//!
//! Scripted inference and LLM doubles for driving sessions without a model
//! backend.

pub mod mocks;

pub use mocks::*;
