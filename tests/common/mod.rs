//! Shared in-memory fakes for integration tests.
//!
//! Not every test binary uses every fake.
#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;

use merlin_bot::embeddings::Embedder;
use merlin_bot::memory::{ScoredMatch, VectorRecord, VectorStore};
use merlin_bot::openai::{ChatMessage, ChatModel};
use merlin_bot::EmbeddingClient;

/// Chat model that replays scripted replies and records every request
#[derive(Default)]
pub struct ScriptedModel {
    replies: Mutex<VecDeque<ChatMessage>>,
    pub calls: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<ChatMessage>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Convenience: plain-text assistant replies
    pub fn with_texts(texts: &[&str]) -> Self {
        Self::new(texts.iter().map(|t| ChatMessage::assistant(*t)).collect())
    }

    fn next_reply(&self, messages: &[ChatMessage]) -> Result<ChatMessage> {
        self.calls.lock().unwrap().push(messages.to_vec());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("ScriptedModel ran out of replies"))
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<ChatMessage> {
        self.next_reply(messages)
    }

    async fn chat_with_tools(
        &self,
        messages: &[ChatMessage],
        _tools: &[Value],
    ) -> Result<ChatMessage> {
        self.next_reply(messages)
    }
}

/// Deterministic embedder: 8 buckets of character counts, no network
pub struct HashEmbedder;

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; 8];
        for (i, byte) in text.bytes().enumerate() {
            vector[(byte as usize + i) % 8] += 1.0;
        }
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        8
    }
}

/// In-memory stand-in for the vector index
#[derive(Default)]
pub struct InMemoryVectorStore {
    pub records: Mutex<Vec<VectorRecord>>,
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(&self, record: VectorRecord) -> Result<()> {
        let mut records = self.records.lock().unwrap();
        records.retain(|r| r.id != record.id);
        records.push(record);
        Ok(())
    }

    async fn query(&self, vector: &[f32], k: usize, user_id: &str) -> Result<Vec<ScoredMatch>> {
        let records = self.records.lock().unwrap();

        let mut matches: Vec<ScoredMatch> = records
            .iter()
            .filter(|r| {
                r.metadata.get("user_id").and_then(Value::as_str) == Some(user_id)
            })
            .map(|r| ScoredMatch {
                id: r.id.clone(),
                score: EmbeddingClient::cosine_similarity(vector, &r.values),
                metadata: r.metadata.clone(),
            })
            .collect();

        matches.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        matches.truncate(k);
        Ok(matches)
    }

    async fn list_ids(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.id.starts_with(prefix))
            .map(|r| r.id.clone())
            .collect())
    }

    async fn fetch(&self, ids: &[String]) -> Result<Vec<VectorRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| ids.contains(&r.id))
            .cloned()
            .collect())
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        self.records.lock().unwrap().retain(|r| !ids.contains(&r.id));
        Ok(())
    }
}
