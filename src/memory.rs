//! Semantic Memory
//!
//! Memories are free-text facts embedded and stored in a Pinecone index,
//! one vector per memory. Ids are `{user_id}#{uuid}` so a user's memories
//! can be listed by id prefix; queries additionally filter on the `user_id`
//! metadata field, so a memory is only ever visible to its owner.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::embeddings::Embedder;
use crate::openai::{ChatMessage, ChatModel};

const PINECONE_CONTROL_URL: &str = "https://api.pinecone.io";
const PINECONE_API_VERSION: &str = "2025-01";

/// A stored memory
#[derive(Debug, Clone, PartialEq)]
pub struct Memory {
    pub id: String,
    pub user_id: String,
    pub content: String,
    pub created_at: String,
}

/// Search hit with its similarity score
#[derive(Debug, Clone)]
pub struct ScoredMemory {
    pub memory: Memory,
    pub score: f32,
}

/// A raw vector record as the store sees it
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub id: String,
    pub values: Vec<f32>,
    pub metadata: Value,
}

/// A raw query match
#[derive(Debug, Clone)]
pub struct ScoredMatch {
    pub id: String,
    pub score: f32,
    pub metadata: Value,
}

/// Storage seam for the vector index
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(&self, record: VectorRecord) -> Result<()>;

    /// Nearest-neighbour search restricted to one user's vectors
    async fn query(&self, vector: &[f32], k: usize, user_id: &str) -> Result<Vec<ScoredMatch>>;

    /// All vector ids starting with `prefix`
    async fn list_ids(&self, prefix: &str) -> Result<Vec<String>>;

    async fn fetch(&self, ids: &[String]) -> Result<Vec<VectorRecord>>;

    async fn delete(&self, ids: &[String]) -> Result<()>;
}

/// Pinecone REST wrapper
///
/// The index host is resolved once from the control plane; all data-plane
/// calls go to that host under the configured namespace.
pub struct PineconeStore {
    client: reqwest::Client,
    api_key: String,
    host: String,
    namespace: String,
}

#[derive(Debug, Deserialize)]
struct DescribeIndexResponse {
    host: String,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<QueryMatch>,
}

#[derive(Debug, Deserialize)]
struct QueryMatch {
    id: String,
    #[serde(default)]
    score: f32,
    #[serde(default)]
    metadata: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    vectors: Vec<ListedVector>,
    #[serde(default)]
    pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
struct ListedVector {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Pagination {
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FetchResponse {
    #[serde(default)]
    vectors: HashMap<String, FetchedVector>,
}

#[derive(Debug, Deserialize)]
struct FetchedVector {
    id: String,
    #[serde(default)]
    values: Vec<f32>,
    #[serde(default)]
    metadata: Option<Value>,
}

impl PineconeStore {
    /// Resolve the index host and build the store
    pub async fn connect(api_key: &str, index_name: &str, namespace: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");

        let url = format!("{}/indexes/{}", PINECONE_CONTROL_URL, index_name);
        let response = client
            .get(&url)
            .header("Api-Key", api_key)
            .header("X-Pinecone-API-Version", PINECONE_API_VERSION)
            .send()
            .await
            .with_context(|| format!("request to {} failed", url))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("describe index '{}' returned {}: {}", index_name, status, body);
        }

        let described: DescribeIndexResponse = response
            .json()
            .await
            .with_context(|| format!("unexpected response shape from {}", url))?;

        info!("Pinecone index '{}' at {}", index_name, described.host);

        Ok(Self {
            client,
            api_key: api_key.to_string(),
            host: format!("https://{}", described.host),
            namespace: namespace.to_string(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.host, path))
            .header("Api-Key", &self.api_key)
            .header("X-Pinecone-API-Version", PINECONE_API_VERSION)
    }

    async fn check(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Pinecone {} returned {}: {}", what, status, body);
        }
        Ok(response)
    }
}

#[async_trait]
impl VectorStore for PineconeStore {
    async fn upsert(&self, record: VectorRecord) -> Result<()> {
        let response = self
            .request(reqwest::Method::POST, "/vectors/upsert")
            .json(&json!({
                "vectors": [{
                    "id": record.id,
                    "values": record.values,
                    "metadata": record.metadata,
                }],
                "namespace": self.namespace,
            }))
            .send()
            .await
            .context("upsert request failed")?;

        Self::check(response, "upsert").await?;
        Ok(())
    }

    async fn query(&self, vector: &[f32], k: usize, user_id: &str) -> Result<Vec<ScoredMatch>> {
        let response = self
            .request(reqwest::Method::POST, "/query")
            .json(&json!({
                "vector": vector,
                "topK": k,
                "namespace": self.namespace,
                "filter": { "user_id": { "$eq": user_id } },
                "includeMetadata": true,
            }))
            .send()
            .await
            .context("query request failed")?;

        let response = Self::check(response, "query").await?;
        let result: QueryResponse = response.json().await.context("query response")?;

        Ok(result
            .matches
            .into_iter()
            .map(|m| ScoredMatch {
                id: m.id,
                score: m.score,
                metadata: m.metadata.unwrap_or(Value::Null),
            })
            .collect())
    }

    async fn list_ids(&self, prefix: &str) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let mut request = self
                .request(reqwest::Method::GET, "/vectors/list")
                .query(&[("namespace", self.namespace.as_str()), ("prefix", prefix)]);
            if let Some(ref t) = token {
                request = request.query(&[("paginationToken", t.as_str())]);
            }

            let response = request.send().await.context("list request failed")?;
            let response = Self::check(response, "list").await?;
            let page: ListResponse = response.json().await.context("list response")?;

            ids.extend(page.vectors.into_iter().map(|v| v.id));

            token = page.pagination.and_then(|p| p.next);
            if token.is_none() {
                break;
            }
        }

        Ok(ids)
    }

    async fn fetch(&self, ids: &[String]) -> Result<Vec<VectorRecord>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }

        let mut request = self
            .request(reqwest::Method::GET, "/vectors/fetch")
            .query(&[("namespace", self.namespace.as_str())]);
        for id in ids {
            request = request.query(&[("ids", id.as_str())]);
        }

        let response = request.send().await.context("fetch request failed")?;
        let response = Self::check(response, "fetch").await?;
        let result: FetchResponse = response.json().await.context("fetch response")?;

        Ok(result
            .vectors
            .into_values()
            .map(|v| VectorRecord {
                id: v.id,
                values: v.values,
                metadata: v.metadata.unwrap_or(Value::Null),
            })
            .collect())
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        let response = self
            .request(reqwest::Method::POST, "/vectors/delete")
            .json(&json!({ "ids": ids, "namespace": self.namespace }))
            .send()
            .await
            .context("delete request failed")?;

        Self::check(response, "delete").await?;
        Ok(())
    }
}

/// Service layer over the vector store: embeds on the way in, and turns
/// retrieved memories into a ready-to-send answer on the way out.
pub struct MemoryService {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    model: Arc<dyn ChatModel>,
}

impl MemoryService {
    pub fn new(
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        model: Arc<dyn ChatModel>,
    ) -> Self {
        Self {
            store,
            embedder,
            model,
        }
    }

    /// Embed and store a memory for a user
    pub async fn save_memory(&self, user_id: &str, content: &str) -> Result<Memory> {
        let values = self.embedder.embed(content).await?;

        let memory = Memory {
            id: format!("{}#{}", user_id, uuid::Uuid::new_v4()),
            user_id: user_id.to_string(),
            content: content.to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
        };

        self.store
            .upsert(VectorRecord {
                id: memory.id.clone(),
                values,
                metadata: json!({
                    "user_id": memory.user_id,
                    "content": memory.content,
                    "created_at": memory.created_at,
                }),
            })
            .await?;

        info!("Saved memory {} for user {}", memory.id, user_id);
        Ok(memory)
    }

    /// Top-k semantic search over one user's memories
    pub async fn search(&self, user_id: &str, content: &str, k: usize) -> Result<Vec<ScoredMemory>> {
        let vector = self.embedder.embed(content).await?;
        let matches = self.store.query(&vector, k, user_id).await?;

        debug!("Query for user {} matched {} memories", user_id, matches.len());

        Ok(matches
            .into_iter()
            .map(|m| ScoredMemory {
                memory: memory_from_metadata(&m.id, &m.metadata),
                score: m.score,
            })
            .collect())
    }

    /// Answer a user's message from their stored memories.
    /// Returns a ready-to-send reply string.
    pub async fn find_relevant_memories(
        &self,
        user_id: &str,
        content: &str,
        k: usize,
    ) -> Result<String> {
        let hits = self.search(user_id, content, k).await?;

        if hits.is_empty() {
            return Ok("I could not find anything relevant in your memories.".to_string());
        }

        let memories_block = hits
            .iter()
            .enumerate()
            .map(|(i, hit)| format!("{}. {}", i + 1, hit.memory.content))
            .collect::<Vec<_>>()
            .join("\n");

        let system = format!(
            "You are Merlin, a personal assistant. Answer the user's message using \
             only their saved memories below. If the memories do not contain the \
             answer, say that you do not know.\n\nMemories:\n{}",
            memories_block
        );

        let reply = self
            .model
            .chat(&[ChatMessage::system(system), ChatMessage::user(content)])
            .await?;

        Ok(reply.text().to_string())
    }

    /// All memories belonging to a user, via the id prefix
    pub async fn list_memories(&self, user_id: &str) -> Result<Vec<Memory>> {
        let ids = self.store.list_ids(&format!("{}#", user_id)).await?;
        let records = self.store.fetch(&ids).await?;

        Ok(records
            .iter()
            .map(|r| memory_from_metadata(&r.id, &r.metadata))
            .collect())
    }

    pub async fn delete_memory(&self, id: &str) -> Result<()> {
        self.store.delete(&[id.to_string()]).await
    }
}

/// Rebuild a [`Memory`] from a vector id and its metadata
fn memory_from_metadata(id: &str, metadata: &Value) -> Memory {
    let field = |name: &str| {
        metadata
            .get(name)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    Memory {
        id: id.to_string(),
        user_id: field("user_id"),
        content: field("content"),
        created_at: field("created_at"),
    }
}
