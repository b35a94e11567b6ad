//! Agent Tool Framework
//!
//! JSON schema-based tool definitions for the agent loop:
//! - tool registration with parameter schemas
//! - parameter validation before dispatch
//! - async handlers returning structured results
//! - OpenAI function-calling format

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::info;

use crate::openai::ToolCallRequest;

/// JSON Schema for tool parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    /// Tool name (snake_case)
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// JSON Schema for parameters
    pub parameters: Value,
    /// Required parameter names
    pub required: Vec<String>,
}

impl ToolSchema {
    /// Create a new tool schema
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {}
            }),
            required: vec![],
        }
    }

    /// Add a string parameter
    pub fn with_string_param(mut self, name: &str, description: &str, required: bool) -> Self {
        if let Some(props) = self.parameters.get_mut("properties") {
            props[name] = serde_json::json!({
                "type": "string",
                "description": description
            });
        }
        if required {
            self.required.push(name.to_string());
        }
        self
    }

    /// Add an integer parameter
    pub fn with_int_param(mut self, name: &str, description: &str, required: bool) -> Self {
        if let Some(props) = self.parameters.get_mut("properties") {
            props[name] = serde_json::json!({
                "type": "integer",
                "description": description
            });
        }
        if required {
            self.required.push(name.to_string());
        }
        self
    }

    /// Add a number parameter
    pub fn with_number_param(mut self, name: &str, description: &str, required: bool) -> Self {
        if let Some(props) = self.parameters.get_mut("properties") {
            props[name] = serde_json::json!({
                "type": "number",
                "description": description
            });
        }
        if required {
            self.required.push(name.to_string());
        }
        self
    }

    /// Validate parameters against schema
    pub fn validate(&self, params: &Value) -> Result<()> {
        for req in &self.required {
            if params.get(req).is_none() {
                return Err(anyhow!("Missing required parameter: {}", req));
            }
        }

        if let Some(props) = self.parameters.get("properties") {
            if let Some(obj) = props.as_object() {
                for (name, schema) in obj {
                    if let Some(value) = params.get(name) {
                        let expected_type = schema.get("type").and_then(|t| t.as_str());
                        let valid = match expected_type {
                            Some("string") => value.is_string(),
                            Some("integer") => value.is_i64(),
                            Some("number") => value.is_number(),
                            Some("boolean") => value.is_boolean(),
                            Some("array") => value.is_array(),
                            Some("object") => value.is_object(),
                            _ => true,
                        };
                        if !valid {
                            return Err(anyhow!(
                                "Parameter '{}' has wrong type, expected {}",
                                name,
                                expected_type.unwrap_or("unknown")
                            ));
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Format as an OpenAI function-calling tool definition
    pub fn to_openai_format(&self) -> Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": {
                    "type": "object",
                    "properties": self.parameters.get("properties").cloned()
                        .unwrap_or(Value::Object(Default::default())),
                    "required": self.required
                }
            }
        })
    }
}

/// Result from tool execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Tool name that was called
    pub tool_name: String,
    /// Whether execution succeeded
    pub success: bool,
    /// Result content (success or error message)
    pub content: String,
    /// Execution duration in milliseconds
    pub duration_ms: u64,
}

impl ToolResult {
    /// Create a successful result
    pub fn success(tool_name: &str, content: String) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            success: true,
            content,
            duration_ms: 0,
        }
    }

    /// Create an error result
    pub fn error(tool_name: &str, error: String) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            success: false,
            content: error,
            duration_ms: 0,
        }
    }
}

/// A tool call, decoded from the model's function-call request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Call id, echoed back in the tool result turn
    pub id: String,
    /// Tool name
    pub name: String,
    /// Decoded arguments
    pub arguments: Value,
}

impl ToolCall {
    /// Create a new tool call
    pub fn new(name: &str, arguments: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            arguments,
        }
    }

    /// Decode the model's request; malformed argument JSON becomes null and
    /// fails validation downstream instead of panicking here.
    pub fn from_request(request: &ToolCallRequest) -> Self {
        Self {
            id: request.id.clone(),
            name: request.function.name.clone(),
            arguments: serde_json::from_str(&request.function.arguments).unwrap_or(Value::Null),
        }
    }
}

/// Type alias for tool handler function
pub type ToolHandler = Arc<
    dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<ToolResult>> + Send>>
        + Send
        + Sync,
>;

/// A registered tool with schema and handler
pub struct Tool {
    pub schema: ToolSchema,
    handler: ToolHandler,
}

impl Tool {
    /// Create a new tool
    pub fn new<F, Fut>(schema: ToolSchema, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolResult>> + Send + 'static,
    {
        Self {
            schema,
            handler: Arc::new(move |params| Box::pin(handler(params))),
        }
    }

    /// Execute the tool
    pub async fn execute(&self, params: Value) -> Result<ToolResult> {
        let start = std::time::Instant::now();

        self.schema.validate(&params)?;

        let mut result = (self.handler)(params).await?;
        result.duration_ms = start.elapsed().as_millis() as u64;

        Ok(result)
    }
}

/// Tool registry for managing available tools
pub struct ToolRegistry {
    tools: HashMap<String, Tool>,
}

impl ToolRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool
    pub fn register(&mut self, tool: Tool) {
        info!("Registered tool: {}", tool.schema.name);
        self.tools.insert(tool.schema.name.clone(), tool);
    }

    /// Get a tool by name
    pub fn get(&self, name: &str) -> Option<&Tool> {
        self.tools.get(name)
    }

    /// List all tool names
    pub fn list(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    /// Execute a single tool call; failures become error results so the
    /// model sees them instead of the loop aborting
    pub async fn execute(&self, call: &ToolCall) -> ToolResult {
        match self.tools.get(&call.name) {
            Some(tool) => match tool.execute(call.arguments.clone()).await {
                Ok(result) => result,
                Err(e) => ToolResult::error(&call.name, e.to_string()),
            },
            None => ToolResult::error(&call.name, format!("Unknown tool: {}", call.name)),
        }
    }

    /// Format all tools for the chat completions API
    pub fn to_openai_format(&self) -> Vec<Value> {
        self.tools
            .values()
            .map(|t| t.schema.to_openai_format())
            .collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract the first balanced JSON object from text
pub fn extract_json_object(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let mut depth = 0;
    let mut end = start;

    for (i, c) in s[start..].char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    end = start + i + 1;
                    break;
                }
            }
            _ => {}
        }
    }

    if end > start {
        Some(&s[start..end])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openai::FunctionCall;

    #[test]
    fn test_tool_schema_creation() {
        let schema = ToolSchema::new("test", "A test tool")
            .with_string_param("name", "User name", true)
            .with_int_param("age", "User age", false);

        assert_eq!(schema.name, "test");
        assert_eq!(schema.required.len(), 1);
        assert!(schema.required.contains(&"name".to_string()));
    }

    #[test]
    fn test_schema_validation() {
        let schema = ToolSchema::new("test", "Test")
            .with_string_param("name", "Name", true)
            .with_number_param("value", "Value", false);

        let valid = serde_json::json!({"name": "Alice", "value": 1.5});
        assert!(schema.validate(&valid).is_ok());

        let missing = serde_json::json!({});
        assert!(schema.validate(&missing).is_err());

        let wrong_type = serde_json::json!({"name": 123});
        assert!(schema.validate(&wrong_type).is_err());
    }

    #[test]
    fn test_openai_format() {
        let schema = ToolSchema::new("save_memory", "Save a memory")
            .with_string_param("content", "The memory text", true);

        let formatted = schema.to_openai_format();
        assert_eq!(formatted["type"], "function");
        assert_eq!(formatted["function"]["name"], "save_memory");
        assert!(formatted["function"]["parameters"]["required"]
            .as_array()
            .unwrap()
            .contains(&Value::String("content".to_string())));
    }

    #[test]
    fn test_tool_call_from_request() {
        let request = ToolCallRequest {
            id: "call_1".to_string(),
            r#type: "function".to_string(),
            function: FunctionCall {
                name: "save_memory".to_string(),
                arguments: r#"{"content":"likes tea"}"#.to_string(),
            },
        };

        let call = ToolCall::from_request(&request);
        assert_eq!(call.id, "call_1");
        assert_eq!(call.arguments["content"], "likes tea");

        let broken = ToolCallRequest {
            id: "call_2".to_string(),
            r#type: "function".to_string(),
            function: FunctionCall {
                name: "save_memory".to_string(),
                arguments: "not json".to_string(),
            },
        };
        assert_eq!(ToolCall::from_request(&broken).arguments, Value::Null);
    }

    #[tokio::test]
    async fn test_tool_execution() {
        let mut registry = ToolRegistry::new();
        registry.register(Tool::new(
            ToolSchema::new("echo", "Echo input").with_string_param("text", "Text", true),
            |params| async move {
                let text = params.get("text").and_then(|v| v.as_str()).unwrap_or("");
                Ok(ToolResult::success("echo", format!("echo: {}", text)))
            },
        ));

        let result = registry
            .execute(&ToolCall::new("echo", serde_json::json!({"text": "hi"})))
            .await;
        assert!(result.success);
        assert_eq!(result.content, "echo: hi");

        // Validation failure surfaces as an error result
        let result = registry.execute(&ToolCall::new("echo", serde_json::json!({}))).await;
        assert!(!result.success);
        assert!(result.content.contains("Missing required parameter"));

        let result = registry
            .execute(&ToolCall::new("nope", serde_json::json!({})))
            .await;
        assert!(!result.success);
        assert!(result.content.contains("Unknown tool"));
    }

    #[test]
    fn test_extract_json_object() {
        let text = "Here you go: {\"a\": {\"b\": 1}} trailing";
        assert_eq!(extract_json_object(text), Some("{\"a\": {\"b\": 1}}"));
        assert_eq!(extract_json_object("no json here"), None);
    }
}
