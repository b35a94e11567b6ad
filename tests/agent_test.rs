//! Agent loop tests: tool rounds, checkpoint persistence, thread replay.

mod common;

use std::sync::{Arc, Mutex};

use common::ScriptedModel;
use merlin_bot::agent::{Agent, Tool, ToolRegistry, ToolResult, ToolSchema};
use merlin_bot::conversation::ConversationStore;
use merlin_bot::openai::{ChatMessage, FunctionCall, ToolCallRequest};
use merlin_bot::users::User;
use tempfile::TempDir;

fn test_user() -> User {
    User {
        id: "u-1".to_string(),
        external_id: "284307817".to_string(),
        first_name: "Max".to_string(),
        last_name: None,
        created_at: "2025-01-01T00:00:00Z".to_string(),
    }
}

/// Assistant turn requesting a single tool call
fn tool_call_turn(call_id: &str, name: &str, arguments: &str) -> ChatMessage {
    ChatMessage {
        role: "assistant".to_string(),
        content: None,
        tool_calls: Some(vec![ToolCallRequest {
            id: call_id.to_string(),
            r#type: "function".to_string(),
            function: FunctionCall {
                name: name.to_string(),
                arguments: arguments.to_string(),
            },
        }]),
        tool_call_id: None,
    }
}

/// Registry with one note-taking tool that records its inputs
fn note_registry(notes: Arc<Mutex<Vec<String>>>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Tool::new(
        ToolSchema::new("save_note", "Save a note").with_string_param("text", "Note text", true),
        move |params| {
            let notes = notes.clone();
            async move {
                let text = params.get("text").and_then(|v| v.as_str()).unwrap_or("");
                notes.lock().unwrap().push(text.to_string());
                Ok(ToolResult::success("save_note", "Note saved".to_string()))
            }
        },
    ));
    registry
}

fn checkpoint_store(dir: &TempDir) -> Arc<Mutex<ConversationStore>> {
    Arc::new(Mutex::new(
        ConversationStore::open(&dir.path().join("threads.db")).unwrap(),
    ))
}

#[tokio::test]
async fn agent_runs_tool_round_then_answers() {
    let dir = TempDir::new().unwrap();
    let notes = Arc::new(Mutex::new(Vec::new()));

    let model = Arc::new(ScriptedModel::new(vec![
        tool_call_turn("call_1", "save_note", r#"{"text":"buy milk"}"#),
        ChatMessage::assistant("Done, I noted that."),
    ]));

    let agent = Agent::new(model.clone(), note_registry(notes.clone()), checkpoint_store(&dir));

    let answer = agent.invoke(7, &test_user(), "note: buy milk").await.unwrap();

    assert_eq!(answer, "Done, I noted that.");
    assert_eq!(notes.lock().unwrap().as_slice(), ["buy milk"]);

    // Second model call must see the tool result turn
    let calls = model.calls.lock().unwrap();
    assert_eq!(calls.len(), 2);
    let last = calls.last().unwrap();
    let tool_turn = last.iter().find(|m| m.role == "tool").unwrap();
    assert_eq!(tool_turn.tool_call_id.as_deref(), Some("call_1"));
    assert_eq!(tool_turn.text(), "Note saved");
}

#[tokio::test]
async fn agent_persists_thread_and_replays_history() {
    let dir = TempDir::new().unwrap();
    let store = checkpoint_store(&dir);
    let notes = Arc::new(Mutex::new(Vec::new()));

    let model = Arc::new(ScriptedModel::new(vec![
        tool_call_turn("call_1", "save_note", r#"{"text":"buy milk"}"#),
        ChatMessage::assistant("Done."),
        ChatMessage::assistant("You asked me to note 'buy milk'."),
    ]));

    let agent = Agent::new(model.clone(), note_registry(notes), store.clone());
    let user = test_user();

    agent.invoke(7, &user, "note: buy milk").await.unwrap();

    // Checkpoint holds the full first turn: user, tool call, tool result, answer
    {
        let store = store.lock().unwrap();
        let history = store.history(7, 50).unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].role, "user");
        assert!(history[1].tool_calls.is_some());
        assert_eq!(history[2].role, "tool");
        assert_eq!(history[3].text(), "Done.");
    }

    let answer = agent.invoke(7, &user, "what did I ask?").await.unwrap();
    assert_eq!(answer, "You asked me to note 'buy milk'.");

    // The replayed request = system prompt + 4 checkpointed turns + new user turn
    let calls = model.calls.lock().unwrap();
    let replay = calls.last().unwrap();
    assert_eq!(replay.len(), 6);
    assert_eq!(replay[0].role, "system");
    assert!(replay[0].text().contains("u-1"));
    assert!(replay[0].text().contains("284307817"));
    assert_eq!(replay[5].text(), "what did I ask?");
}

#[tokio::test]
async fn agent_threads_are_isolated_and_clearable() {
    let dir = TempDir::new().unwrap();
    let store = checkpoint_store(&dir);

    let model = Arc::new(ScriptedModel::new(vec![
        ChatMessage::assistant("hi thread 1"),
        ChatMessage::assistant("hi thread 2"),
    ]));

    let agent = Agent::new(model, ToolRegistry::new(), store.clone());
    let user = test_user();

    agent.invoke(1, &user, "hello").await.unwrap();
    agent.invoke(2, &user, "hello").await.unwrap();

    {
        let store = store.lock().unwrap();
        assert_eq!(store.history(1, 50).unwrap().len(), 2);
        assert_eq!(store.history(2, 50).unwrap().len(), 2);
    }

    let cleared = agent.clear_thread(1).unwrap();
    assert_eq!(cleared, 2);

    let store = store.lock().unwrap();
    assert!(store.history(1, 50).unwrap().is_empty());
    assert_eq!(store.history(2, 50).unwrap().len(), 2);
}

#[tokio::test]
async fn agent_surfaces_unknown_tools_to_the_model() {
    let dir = TempDir::new().unwrap();

    let model = Arc::new(ScriptedModel::new(vec![
        tool_call_turn("call_1", "no_such_tool", "{}"),
        ChatMessage::assistant("That tool does not exist."),
    ]));

    let agent = Agent::new(model.clone(), ToolRegistry::new(), checkpoint_store(&dir));

    let answer = agent.invoke(9, &test_user(), "do something odd").await.unwrap();
    assert_eq!(answer, "That tool does not exist.");

    let calls = model.calls.lock().unwrap();
    let tool_turn = calls.last().unwrap().iter().find(|m| m.role == "tool").unwrap();
    assert!(tool_turn.text().contains("Unknown tool"));
}
