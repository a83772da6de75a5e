//! Model provider implementations for Coxswain.
//!
//! A provider turns a system prompt plus transcript history into a lazily
//! consumed stream of text chunks and usage totals, behind the
//! `ProviderClient` trait from `coxswain-core`.

mod anthropic;

pub use anthropic::AnthropicClient;
