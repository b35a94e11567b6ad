//! Merlin - Personal Assistant Telegram Bot
//!
//! An allow-listed Telegram bot with LLM-classified intents and semantic
//! long-term memory.
//!
//! # Architecture
//!
//! ```text
//! Telegram ──► Dispatcher / Webhook ──► Intent classifier (OpenAI)
//!                      │                      │
//!                      │              ┌───────┴────────┐
//!                      │            save            retrieve
//!                      │              │                │
//!                      │              ▼                ▼
//!                      │        MemoryService ── Pinecone + Embeddings
//!                      │
//!                      ├── UserDirectory ──── Supabase (PostgREST)
//!                      ├── Agent (tool loop) ─ memory + parameter tools
//!                      ├── MealCalculator ─── strict-JSON extraction
//!                      └── CorrelateClient ── parameter tracking API
//! ```

pub mod agent;
pub mod config;
pub mod conversation;
pub mod embeddings;
pub mod meals;
pub mod memory;
pub mod openai;
pub mod parameters;
pub mod server;
pub mod telegram;
pub mod users;

pub use agent::{Agent, ToolCall, ToolRegistry, ToolResult, ToolSchema};
pub use config::Config;
pub use conversation::{ConversationStore, ThreadSummary};
pub use embeddings::{Embedder, EmbeddingClient, EmbeddingConfig};
pub use meals::{MealCalculator, MealReport};
pub use memory::{
    Memory, MemoryService, PineconeStore, ScoredMatch, ScoredMemory, VectorRecord, VectorStore,
};
pub use openai::{ChatMessage, ChatModel, Intent, OpenAiClient};
pub use parameters::{CorrelateClient, Measurement, Parameter};
pub use server::verify_init_data;
pub use telegram::{dispatch_message, BotData, Outcome};
pub use users::{NewUser, SupabaseUserRepository, User, UserDirectory, UserRepository};
