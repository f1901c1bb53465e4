//! Tools and the tool registry.
//!
//! A tool is a named action with a declared input shape and an optional
//! execution body. Tools without a body are still declared to the model;
//! a call to one is handed back to the caller unexecuted.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use crate::error::{RegistryError, ToolError};
use crate::provider::ToolDeclaration;
use crate::shape::InputShape;

/// The execution body of a tool.
///
/// Implementations may be non-deterministic: the same input can yield
/// different outputs across steps.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, input: Value) -> Result<Value, ToolError>;
}

/// Adapts an async closure into a [`ToolExecutor`].
struct FnExecutor<F>(F);

#[async_trait]
impl<F, Fut> ToolExecutor for FnExecutor<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
{
    async fn execute(&self, input: Value) -> Result<Value, ToolError> {
        (self.0)(input).await
    }
}

/// Observers of a tool call's input while the model streams it.
///
/// Purely observational: they cannot change the call, and a panicking hook
/// does not affect the step.
pub trait ToolInputHooks: Send + Sync {
    /// The model started producing input for a call.
    fn on_input_start(&self, _call_id: &str) {}

    /// A fragment of the raw input text arrived.
    fn on_input_delta(&self, _call_id: &str, _delta: &str) {}

    /// The complete, parsed input is available.
    fn on_input_available(&self, _call_id: &str, _input: &Value) {}
}

/// The struct-based tool trait.
///
/// Built-in tools implement this trait and are registered with
/// [`ToolRegistry::register_tool`].
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "findOrders").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the model).
    fn description(&self) -> &str;

    /// The declared input shape.
    fn input_shape(&self) -> InputShape;

    /// Execute the tool with already validated input.
    async fn execute(&self, input: Value) -> Result<Value, ToolError>;
}

struct ToolAdapter(Arc<dyn Tool>);

#[async_trait]
impl ToolExecutor for ToolAdapter {
    async fn execute(&self, input: Value) -> Result<Value, ToolError> {
        self.0.execute(input).await
    }
}

/// A registry entry: declaration plus optional body and hooks.
#[derive(Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_shape: InputShape,
    executor: Option<Arc<dyn ToolExecutor>>,
    hooks: Option<Arc<dyn ToolInputHooks>>,
}

impl ToolDefinition {
    /// A tool with no execution body.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_shape: InputShape,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_shape,
            executor: None,
            hooks: None,
        }
    }

    /// Wrap a struct-based tool.
    pub fn from_tool(tool: Arc<dyn Tool>) -> Self {
        Self::new(tool.name(), tool.description(), tool.input_shape())
            .with_executor(Arc::new(ToolAdapter(tool)))
    }

    pub fn with_executor(mut self, executor: Arc<dyn ToolExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Attach an async closure as the execution body.
    pub fn with_execute<F, Fut>(self, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        self.with_executor(Arc::new(FnExecutor(f)))
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn ToolInputHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn executor(&self) -> Option<&Arc<dyn ToolExecutor>> {
        self.executor.as_ref()
    }

    pub fn hooks(&self) -> Option<&Arc<dyn ToolInputHooks>> {
        self.hooks.as_ref()
    }

    pub fn has_executor(&self) -> bool {
        self.executor.is_some()
    }

    /// Parse the model's raw input text against the declared shape.
    pub fn parse_input(&self, raw: &str) -> Result<Value, ToolError> {
        self.input_shape.parse(&self.name, raw)
    }

    /// Convert this tool into a declaration for the model.
    pub fn to_declaration(&self) -> ToolDeclaration {
        ToolDeclaration {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.input_shape.to_json_schema(),
        }
    }
}

impl std::fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("input_shape", &self.input_shape)
            .field("has_executor", &self.executor.is_some())
            .field("has_hooks", &self.hooks.is_some())
            .finish()
    }
}

/// A registry of available tools, keyed by name.
///
/// The step executor uses this to:
/// 1. Get tool declarations to send to the model
/// 2. Resolve the tool the model asked for, by explicit lookup
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, ToolDefinition>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Fails if the name is already taken.
    pub fn register(&mut self, definition: ToolDefinition) -> Result<(), RegistryError> {
        if self.tools.contains_key(&definition.name) {
            return Err(RegistryError::DuplicateTool(definition.name));
        }
        self.tools.insert(definition.name.clone(), definition);
        Ok(())
    }

    /// Register a struct-based tool.
    pub fn register_tool(&mut self, tool: Box<dyn Tool>) -> Result<(), RegistryError> {
        self.register(ToolDefinition::from_tool(Arc::from(tool)))
    }

    /// Look up a tool by name.
    pub fn resolve(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.get(name)
    }

    /// Declarations for every registered tool, sorted by name.
    pub fn declarations(&self) -> Vec<ToolDeclaration> {
        self.tools.values().map(|t| t.to_declaration()).collect()
    }

    /// All registered tool names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
