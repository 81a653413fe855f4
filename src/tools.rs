//! # Tool Adapter
//!
//! Turns the tool server's generic tool list into named, independently
//! invocable [`Tool`]s, and collects them in a [`ToolSet`] the orchestration
//! loop can dispatch into.
//!
//! ## Schema normalization
//!
//! Remote servers are free to describe inputs however they like. Every schema
//! exposed to the model goes through [`normalize_input_schema`], which always
//! yields an object schema with `"additionalProperties": false`, so
//! downstream validation sees one shape regardless of the server.
//!
//! ## Handler Pattern
//!
//! Handlers are stored as `Arc<dyn Fn(Value) -> Pin<Box<dyn Future>>>`: boxing
//! erases the concrete future type so remote and local tools share one
//! collection, and `Arc` lets a `Tool` be cloned into concurrent invocations.
//!
//! ```rust,no_run
//! use toolwire::{Tool, ToolSet};
//! use serde_json::json;
//!
//! # async fn example() -> toolwire::Result<()> {
//! let mut tools = ToolSet::new();
//! tools.insert(Tool::new(
//!     "echo",
//!     "Echo the arguments back",
//!     json!({"type": "object", "properties": {"text": {"type": "string"}}}),
//!     |args| async move { Ok(args) },
//! ));
//!
//! let result = tools.invoke("echo", json!({"text": "hi"})).await?;
//! assert_eq!(result["text"], "hi");
//! # Ok(())
//! # }
//! ```

use crate::completion::ToolDefinition;
use crate::connection::Connection;
use crate::{Error, Result};
use serde_json::{Map, Value};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Type alias for tool handler functions.
///
/// ```text
/// Arc<                                      // shared across clones
///   dyn Fn(Value)                           // JSON arguments
///     -> Pin<Box<                           // type-erased future
///       dyn Future<Output = Result<Value>>
///         + Send>>
///     + Send + Sync>
/// ```
pub type ToolHandler =
    Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>> + Send + Sync>;

/// A named callable with a declared input schema.
///
/// Cloning is cheap: the handler is shared through an `Arc`.
#[derive(Clone)]
pub struct Tool {
    name: String,
    description: String,
    /// Always an object schema; see [`normalize_input_schema`]
    input_schema: Value,
    handler: ToolHandler,
}

impl Tool {
    /// Create a tool. The schema is normalized on the way in.
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: normalize_input_schema(input_schema),
            handler: Arc::new(move |args| Box::pin(handler(args))),
        }
    }

    /// Run the tool's handler.
    pub async fn execute(&self, arguments: Value) -> Result<Value> {
        (self.handler)(arguments).await
    }

    /// Description of this tool for a completion request.
    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
        }
    }

    /// OpenAI function-calling format
    pub fn to_openai_format(&self) -> Value {
        self.definition().to_openai_format()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn input_schema(&self) -> &Value {
        &self.input_schema
    }
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("input_schema", &self.input_schema)
            .finish()
    }
}

/// Force a schema into the shape every exposed tool declares.
///
/// - non-object input becomes an empty object schema
/// - `"type"` is set to `"object"`
/// - `"properties"` defaults to `{}`
/// - `"additionalProperties"` is set to `false`
///
/// Everything else (`required`, descriptions, nested schemas) is kept.
pub fn normalize_input_schema(schema: Value) -> Value {
    let mut obj = match schema {
        Value::Object(obj) => obj,
        other => {
            if !other.is_null() {
                log::debug!("replacing non-object input schema: {}", other);
            }
            Map::new()
        }
    };

    obj.insert("type".to_string(), Value::String("object".to_string()));
    obj.entry("properties")
        .or_insert_with(|| Value::Object(Map::new()));
    obj.insert("additionalProperties".to_string(), Value::Bool(false));

    Value::Object(obj)
}

/// Tools available for one request, in discovery order.
#[derive(Debug, Clone, Default)]
pub struct ToolSet {
    tools: Vec<Tool>,
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool, replacing any tool with the same name.
    pub fn insert(&mut self, tool: Tool) {
        match self.tools.iter_mut().find(|t| t.name == tool.name) {
            Some(existing) => {
                log::warn!("duplicate tool name '{}'; keeping the last one", tool.name);
                *existing = tool;
            }
            None => self.tools.push(tool),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Tool> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.iter().map(|t| t.name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tool> {
        self.tools.iter()
    }

    /// Definitions for a completion request
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(Tool::definition).collect()
    }

    /// Invoke a tool by name. A missing tool is a [`Error::ToolExecution`].
    pub async fn invoke(&self, name: &str, arguments: Value) -> Result<Value> {
        match self.get(name) {
            Some(tool) => tool.execute(arguments).await,
            None => Err(Error::tool(format!("Tool not found: {}", name))),
        }
    }
}

impl FromIterator<Tool> for ToolSet {
    fn from_iter<I: IntoIterator<Item = Tool>>(iter: I) -> Self {
        let mut set = ToolSet::new();
        for tool in iter {
            set.insert(tool);
        }
        set
    }
}

/// Wrap every tool the connection's server offers.
///
/// Each handler forwards to `tools/call`. A result flagged `isError` becomes
/// an [`Error::ToolExecution`] carrying the result text; a successful result
/// yields its `content` unchanged.
pub async fn remote_tools(connection: &Connection) -> Result<ToolSet> {
    let descriptors = connection.tools().await?;

    Ok(descriptors
        .iter()
        .map(|descriptor| {
            let client = Arc::clone(connection.client());
            let name = descriptor.name.clone();
            Tool::new(
                descriptor.name.clone(),
                descriptor.description.clone().unwrap_or_default(),
                descriptor.input_schema.clone(),
                move |arguments| {
                    let client = Arc::clone(&client);
                    let name = name.clone();
                    async move {
                        let result = client.call_tool(&name, arguments).await?;
                        if result.is_error {
                            return Err(Error::tool(result.text()));
                        }
                        Ok(result.content)
                    }
                },
            )
        })
        .collect())
}
