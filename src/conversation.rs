//! Agent Thread Checkpoints
//!
//! Stores agent conversation turns per thread (thread id = Telegram chat id)
//! so the agent resumes mid-conversation across restarts. Turns are kept as
//! serialized JSON because assistant turns carry tool calls, not just text.

use anyhow::Result;
use rusqlite::{params, Connection};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::openai::ChatMessage;

/// Maximum turns kept per thread (rolling window)
const MAX_MESSAGES_PER_THREAD: usize = 50;

/// Default TTL in seconds (7 days)
const DEFAULT_TTL_SECONDS: i64 = 7 * 24 * 60 * 60;

/// Summary of a thread
#[derive(Debug, Clone)]
pub struct ThreadSummary {
    pub thread_id: i64,
    pub message_count: usize,
    pub oldest_timestamp: Option<i64>,
    pub newest_timestamp: Option<i64>,
}

/// Checkpoint store with SQLite backend
pub struct ConversationStore {
    conn: Connection,
    max_messages: usize,
    ttl_seconds: i64,
}

impl ConversationStore {
    /// Open or create the checkpoint database
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        let store = Self {
            conn,
            max_messages: MAX_MESSAGES_PER_THREAD,
            ttl_seconds: DEFAULT_TTL_SECONDS,
        };
        store.init_schema()?;

        info!("Checkpoint store opened: {}", path.display());
        Ok(store)
    }

    /// Open with custom limits
    pub fn open_with_config(path: &Path, max_messages: usize, ttl_seconds: i64) -> Result<Self> {
        let mut store = Self::open(path)?;
        store.max_messages = max_messages;
        store.ttl_seconds = ttl_seconds;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS thread_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                thread_id INTEGER NOT NULL,
                message TEXT NOT NULL,
                timestamp INTEGER NOT NULL DEFAULT (unixepoch())
            );

            CREATE INDEX IF NOT EXISTS idx_thread_messages_thread
                ON thread_messages(thread_id);
            CREATE INDEX IF NOT EXISTS idx_thread_messages_timestamp
                ON thread_messages(thread_id, timestamp DESC);
            "#,
        )?;

        Ok(())
    }

    /// Append one turn to a thread
    pub fn append(&self, thread_id: i64, message: &ChatMessage) -> Result<()> {
        self.append_all(thread_id, std::slice::from_ref(message))
    }

    /// Append a batch of turns atomically, preserving their order
    pub fn append_all(&self, thread_id: i64, messages: &[ChatMessage]) -> Result<()> {
        let base = chrono::Utc::now().timestamp_millis();

        self.conn.execute("BEGIN", [])?;

        let result = (|| -> Result<()> {
            for (i, message) in messages.iter().enumerate() {
                let serialized = serde_json::to_string(message)?;
                self.conn.execute(
                    "INSERT INTO thread_messages (thread_id, message, timestamp)
                     VALUES (?1, ?2, ?3)",
                    params![thread_id, serialized, base + i as i64],
                )?;
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                self.conn.execute("COMMIT", [])?;
                self.trim(thread_id, self.max_messages)?;
                debug!("Appended {} turns to thread {}", messages.len(), thread_id);
                Ok(())
            }
            Err(e) => {
                let _ = self.conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }

    /// Get thread history in chronological order
    pub fn history(&self, thread_id: i64, limit: usize) -> Result<Vec<ChatMessage>> {
        let mut stmt = self.conn.prepare(
            "SELECT message FROM thread_messages
             WHERE thread_id = ?1
             ORDER BY timestamp DESC, id DESC
             LIMIT ?2",
        )?;

        let mut messages: Vec<ChatMessage> = stmt
            .query_map(params![thread_id, limit], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .filter_map(|raw| match serde_json::from_str(&raw) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!("Dropping corrupt checkpoint turn: {}", e);
                    None
                }
            })
            .collect();

        messages.reverse();
        Ok(messages)
    }

    /// Clear a thread, returning the number of turns removed
    pub fn clear(&self, thread_id: i64) -> Result<usize> {
        let rows = self.conn.execute(
            "DELETE FROM thread_messages WHERE thread_id = ?1",
            params![thread_id],
        )?;
        info!("Cleared {} turns from thread {}", rows, thread_id);
        Ok(rows)
    }

    /// Get thread summary
    pub fn summary(&self, thread_id: i64) -> Result<ThreadSummary> {
        let mut stmt = self.conn.prepare(
            "SELECT COUNT(*), MIN(timestamp), MAX(timestamp)
             FROM thread_messages WHERE thread_id = ?1",
        )?;

        let summary = stmt.query_row(params![thread_id], |row| {
            Ok(ThreadSummary {
                thread_id,
                message_count: row.get::<_, i64>(0)? as usize,
                oldest_timestamp: row.get(1)?,
                newest_timestamp: row.get(2)?,
            })
        })?;

        Ok(summary)
    }

    /// Trim a thread to the newest `keep_count` turns
    pub fn trim(&self, thread_id: i64, keep_count: usize) -> Result<usize> {
        let rows = self.conn.execute(
            "DELETE FROM thread_messages
             WHERE thread_id = ?1 AND id NOT IN (
                 SELECT id FROM thread_messages
                 WHERE thread_id = ?1
                 ORDER BY timestamp DESC, id DESC
                 LIMIT ?2
             )",
            params![thread_id, keep_count],
        )?;
        Ok(rows)
    }

    /// Clean up turns older than the TTL
    pub fn cleanup_expired(&self) -> Result<usize> {
        let cutoff = chrono::Utc::now().timestamp_millis() - (self.ttl_seconds * 1000);
        let rows = self.conn.execute(
            "DELETE FROM thread_messages WHERE timestamp < ?1",
            params![cutoff],
        )?;
        if rows > 0 {
            info!("Cleaned up {} expired checkpoint turns", rows);
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_store() -> (TempDir, ConversationStore) {
        let dir = TempDir::new().unwrap();
        let store = ConversationStore::open(&dir.path().join("threads.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_append_and_history() {
        let (_dir, store) = temp_store();
        let thread_id = 12345;

        store.append(thread_id, &ChatMessage::user("Hello, my name is Max")).unwrap();
        store.append(thread_id, &ChatMessage::assistant("Nice to meet you, Max!")).unwrap();
        store.append(thread_id, &ChatMessage::user("What's my name?")).unwrap();

        let history = store.history(thread_id, 10).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].role, "user");
        assert!(history[0].text().contains("Max"));
        assert_eq!(history[2].role, "user");
        assert!(history[2].text().contains("name"));
    }

    #[test]
    fn test_append_all_preserves_order() {
        let (_dir, store) = temp_store();
        let thread_id = 1;

        store
            .append_all(
                thread_id,
                &[
                    ChatMessage::user("first"),
                    ChatMessage::assistant("second"),
                    ChatMessage::user("third"),
                ],
            )
            .unwrap();

        let history = store.history(thread_id, 10).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].text(), "first");
        assert_eq!(history[2].text(), "third");
    }

    #[test]
    fn test_tool_call_turns_survive() {
        let (_dir, store) = temp_store();
        let thread_id = 7;

        let raw = r#"{
            "role": "assistant",
            "tool_calls": [{
                "id": "call_1",
                "type": "function",
                "function": {"name": "save_memory", "arguments": "{}"}
            }]
        }"#;
        let assistant: ChatMessage = serde_json::from_str(raw).unwrap();

        store.append(thread_id, &assistant).unwrap();
        store.append(thread_id, &ChatMessage::tool("call_1", "Memory saved successfully!")).unwrap();

        let history = store.history(thread_id, 10).unwrap();
        assert_eq!(history.len(), 2);
        let calls = history[0].tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.name, "save_memory");
        assert_eq!(history[1].tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn test_clear() {
        let (_dir, store) = temp_store();
        let thread_id = 12345;

        store.append(thread_id, &ChatMessage::user("Test 1")).unwrap();
        store.append(thread_id, &ChatMessage::user("Test 2")).unwrap();

        let cleared = store.clear(thread_id).unwrap();
        assert_eq!(cleared, 2);
        assert!(store.history(thread_id, 10).unwrap().is_empty());
    }

    #[test]
    fn test_trim_keeps_newest() {
        let dir = TempDir::new().unwrap();
        let store =
            ConversationStore::open_with_config(&dir.path().join("threads.db"), 3, DEFAULT_TTL_SECONDS)
                .unwrap();
        let thread_id = 12345;

        for i in 0..5 {
            store.append(thread_id, &ChatMessage::user(format!("Message {}", i))).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(5));
        }

        let history = store.history(thread_id, 10).unwrap();
        assert_eq!(history.len(), 3);
        assert!(history[2].text().contains("Message 4"));
    }

    #[test]
    fn test_thread_isolation() {
        let (_dir, store) = temp_store();

        store.append(111, &ChatMessage::user("Thread 1 message")).unwrap();
        store.append(222, &ChatMessage::user("Thread 2 message")).unwrap();

        let history1 = store.history(111, 10).unwrap();
        let history2 = store.history(222, 10).unwrap();

        assert_eq!(history1.len(), 1);
        assert_eq!(history2.len(), 1);
        assert!(history1[0].text().contains("Thread 1"));
        assert!(history2[0].text().contains("Thread 2"));
    }

    #[test]
    fn test_summary() {
        let (_dir, store) = temp_store();
        let thread_id = 12345;

        store
            .append_all(thread_id, &[ChatMessage::user("Hello"), ChatMessage::assistant("Hi")])
            .unwrap();

        let summary = store.summary(thread_id).unwrap();
        assert_eq!(summary.message_count, 2);
        assert!(summary.oldest_timestamp.is_some());
        assert!(summary.newest_timestamp.is_some());
    }
}
