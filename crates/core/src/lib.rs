//! # steploop core
//!
//! Domain types, traits, and error definitions for the steploop tool-calling
//! runtime. This crate has no framework dependencies; it defines the domain
//! model the orchestration loop and its backends implement against.
//!
//! ## Design Philosophy
//!
//! The model backend and tool bodies are traits here. Implementations live in
//! their respective crates, which keeps the loop testable with scripted
//! backends and plain closures.

pub mod error;
pub mod event;
pub mod message;
pub mod provider;
pub mod shape;
pub mod step;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{Error, ProviderError, RegistryError, Result, ToolError};
pub use event::{DomainEvent, EventBus};
pub use message::{ConversationId, Message, MessageToolCall, Role};
pub use provider::{
    Provider, ProviderRequest, ProviderResponse, ProviderStream, StreamEvent, ToolDeclaration,
    Usage,
};
pub use shape::{FieldKind, FieldSpec, InputShape};
pub use step::{FinishReason, Step, ToolCall, ToolOutcome, ToolResult};
pub use tool::{Tool, ToolDefinition, ToolExecutor, ToolInputHooks, ToolRegistry};
