//! Conversational Agent
//!
//! A tool-using agent over OpenAI function calling: each turn the model
//! decides which tool to invoke (save a memory, search memories, manage
//! tracked parameters) until it produces a final answer. Thread state is
//! checkpointed so conversations survive restarts.

pub mod tools;

pub use tools::{Tool, ToolCall, ToolRegistry, ToolResult, ToolSchema};

use anyhow::Result;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::conversation::ConversationStore;
use crate::memory::MemoryService;
use crate::openai::{ChatMessage, ChatModel};
use crate::parameters::{CorrelateClient, NewMeasurement, NewParameter};
use crate::users::User;

/// Upper bound on tool rounds in a single turn
const MAX_STEPS: usize = 8;

/// How much thread history is replayed to the model
const HISTORY_LIMIT: usize = 50;

/// A tool-using conversational agent with checkpointed threads
pub struct Agent {
    model: Arc<dyn ChatModel>,
    tools: ToolRegistry,
    checkpoints: Arc<Mutex<ConversationStore>>,
}

impl Agent {
    pub fn new(
        model: Arc<dyn ChatModel>,
        tools: ToolRegistry,
        checkpoints: Arc<Mutex<ConversationStore>>,
    ) -> Self {
        Self {
            model,
            tools,
            checkpoints,
        }
    }

    fn system_prompt(user: &User) -> String {
        format!(
            "You are Merlin, a personal assistant with long-term memory and health \
             tracking tools. Decide for yourself which tools to call, if any, before \
             answering. The current user's id is {} and their external id is {}. \
             When a tool takes a user_id or external_id argument, pass these values.",
            user.id, user.external_id
        )
    }

    /// Run one agent turn for a thread. Loads the checkpoint, loops over tool
    /// calls until the model answers in plain text, persists the new turns.
    pub async fn invoke(&self, thread_id: i64, user: &User, text: &str) -> Result<String> {
        let mut messages = vec![ChatMessage::system(Self::system_prompt(user))];
        {
            let store = self
                .checkpoints
                .lock()
                .map_err(|e| anyhow::anyhow!("checkpoint lock poisoned: {}", e))?;
            messages.extend(store.history(thread_id, HISTORY_LIMIT)?);
        }

        let user_turn = ChatMessage::user(text);
        messages.push(user_turn.clone());
        let mut new_turns = vec![user_turn];

        let tool_defs = self.tools.to_openai_format();

        for step in 0..MAX_STEPS {
            let reply = self.model.chat_with_tools(&messages, &tool_defs).await?;

            let calls = reply.tool_calls.clone().unwrap_or_default();
            if calls.is_empty() {
                let answer = reply.text().to_string();
                new_turns.push(reply);

                let store = self
                    .checkpoints
                    .lock()
                    .map_err(|e| anyhow::anyhow!("checkpoint lock poisoned: {}", e))?;
                store.append_all(thread_id, &new_turns)?;

                info!(
                    "Agent answered thread {} after {} tool round(s)",
                    thread_id, step
                );
                return Ok(answer);
            }

            messages.push(reply.clone());
            new_turns.push(reply);

            for request in &calls {
                let call = ToolCall::from_request(request);
                debug!("Agent tool call: {} {}", call.name, call.arguments);

                let result = self.tools.execute(&call).await;
                if !result.success {
                    warn!("Tool {} failed: {}", call.name, result.content);
                }

                let tool_turn = ChatMessage::tool(&request.id, &result.content);
                messages.push(tool_turn.clone());
                new_turns.push(tool_turn);
            }
        }

        anyhow::bail!("agent exceeded {} tool rounds without answering", MAX_STEPS)
    }

    /// Drop a thread's checkpoint
    pub fn clear_thread(&self, thread_id: i64) -> Result<usize> {
        let store = self
            .checkpoints
            .lock()
            .map_err(|e| anyhow::anyhow!("checkpoint lock poisoned: {}", e))?;
        store.clear(thread_id)
    }
}

fn str_arg(params: &Value, name: &str) -> String {
    params
        .get(name)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// The standard toolset: memory plus parameter tracking
pub fn standard_toolset(
    memories: Arc<MemoryService>,
    parameters: Arc<CorrelateClient>,
) -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    let memory = memories.clone();
    registry.register(Tool::new(
        ToolSchema::new("save_memory", "Saves a user's memory.")
            .with_string_param("user_id", "The unique identifier for the user.", true)
            .with_string_param("content", "The content of the memory to save.", true),
        move |params| {
            let memory = memory.clone();
            async move {
                let user_id = str_arg(&params, "user_id");
                let content = str_arg(&params, "content");
                memory.save_memory(&user_id, &content).await?;
                Ok(ToolResult::success("save_memory", "Memory saved successfully!".to_string()))
            }
        },
    ));

    let memory = memories;
    registry.register(Tool::new(
        ToolSchema::new(
            "retrieve_memories",
            "Retrieves relevant memories based on a query.",
        )
        .with_string_param("user_id", "The unique identifier for the user.", true)
        .with_string_param("content", "The query text to search for relevant memories.", true)
        .with_int_param("k", "The number of memories to retrieve.", false),
        move |params| {
            let memory = memory.clone();
            async move {
                let user_id = str_arg(&params, "user_id");
                let content = str_arg(&params, "content");
                let k = params.get("k").and_then(Value::as_u64).unwrap_or(5) as usize;
                let answer = memory.find_relevant_memories(&user_id, &content, k).await?;
                Ok(ToolResult::success("retrieve_memories", answer))
            }
        },
    ));

    let client = parameters.clone();
    registry.register(Tool::new(
        ToolSchema::new(
            "list_parameters",
            "Lists the parameters the user tracks (weight, calories, ...).",
        )
        .with_string_param("external_id", "The user's external id.", true),
        move |params| {
            let client = client.clone();
            async move {
                let external_id = str_arg(&params, "external_id");
                let user = client.get_user_by_external_id(&external_id).await?;
                let parameters = client.list_parameters_by_user(&user.id).await?;

                if parameters.is_empty() {
                    return Ok(ToolResult::success(
                        "list_parameters",
                        "No parameters tracked yet.".to_string(),
                    ));
                }

                let lines = parameters
                    .iter()
                    .map(|p| format!("- {} ({}): {} [id {}]", p.name, p.unit, p.description, p.id))
                    .collect::<Vec<_>>()
                    .join("\n");
                Ok(ToolResult::success("list_parameters", lines))
            }
        },
    ));

    let client = parameters.clone();
    registry.register(Tool::new(
        ToolSchema::new("create_parameter", "Creates a new tracked parameter for the user.")
            .with_string_param("external_id", "The user's external id.", true)
            .with_string_param("name", "Parameter name, e.g. 'weight'.", true)
            .with_string_param("description", "What the parameter measures.", true)
            .with_string_param("unit", "Measurement unit, e.g. 'kg'.", true),
        move |params| {
            let client = client.clone();
            async move {
                let external_id = str_arg(&params, "external_id");
                let user = client.get_user_by_external_id(&external_id).await?;
                let parameter = client
                    .create_parameter(NewParameter {
                        user_id: user.id,
                        name: str_arg(&params, "name"),
                        description: str_arg(&params, "description"),
                        unit: str_arg(&params, "unit"),
                    })
                    .await?;
                Ok(ToolResult::success(
                    "create_parameter",
                    format!("Created parameter '{}' with id {}", parameter.name, parameter.id),
                ))
            }
        },
    ));

    let client = parameters;
    registry.register(Tool::new(
        ToolSchema::new("log_measurement", "Logs a measurement for a tracked parameter.")
            .with_string_param("parameter_id", "Id of the parameter being measured.", true)
            .with_number_param("value", "The measured value.", true)
            .with_string_param("notes", "Free-text notes for this measurement.", false),
        move |params| {
            let client = client.clone();
            async move {
                let measurement = client
                    .create_measurement(NewMeasurement {
                        parameter_id: str_arg(&params, "parameter_id"),
                        notes: str_arg(&params, "notes"),
                        value: params.get("value").and_then(Value::as_f64).unwrap_or(0.0),
                    })
                    .await?;
                Ok(ToolResult::success(
                    "log_measurement",
                    format!("Logged {} at {}", measurement.value, measurement.timestamp),
                ))
            }
        },
    ));

    registry
}
