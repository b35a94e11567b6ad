//! Configuration management
//!
//! Every setting comes from environment variables (loaded via dotenvy in main).
//! Secrets for the external services are required; the rest have defaults.

use anyhow::{Context, Result};
use std::path::PathBuf;

/// Bot configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Telegram bot token
    pub telegram_bot_token: String,

    /// OpenAI API key (chat, intent classification, embeddings)
    pub openai_api_key: String,

    /// Supabase project URL (user store)
    pub supabase_url: String,

    /// Supabase service key
    pub supabase_key: String,

    /// Pinecone API key (semantic memory)
    pub pinecone_api_key: String,

    /// Pinecone index name
    pub pinecone_index_name: String,

    /// Pinecone namespace
    pub pinecone_namespace: String,

    /// Correlate API base URL (parameter tracking)
    pub correlate_api_url: String,

    /// Correlate API key (optional)
    pub correlate_api_key: Option<String>,

    /// Telegram user ids allowed to talk to the bot (empty = allow all)
    pub allowed_user_ids: Vec<i64>,

    /// Chat completion model
    pub chat_model: String,

    /// Embedding model
    pub embedding_model: String,

    /// Default number of memories retrieved per query
    pub retrieval_k: usize,

    /// SQLite path for agent thread checkpoints
    pub db_path: PathBuf,

    /// Public URL Telegram delivers webhook updates to (webhook mode only)
    pub webhook_url: Option<String>,

    /// HTTP bind port (webhook mode)
    pub port: u16,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let telegram_bot_token =
            std::env::var("TELEGRAM_BOT_TOKEN").context("TELEGRAM_BOT_TOKEN must be set")?;
        let openai_api_key =
            std::env::var("OPENAI_API_KEY").context("OPENAI_API_KEY must be set")?;
        let supabase_url = std::env::var("SUPABASE_URL").context("SUPABASE_URL must be set")?;
        let supabase_key = std::env::var("SUPABASE_KEY").context("SUPABASE_KEY must be set")?;
        let pinecone_api_key =
            std::env::var("PINECONE_API_KEY").context("PINECONE_API_KEY must be set")?;

        let pinecone_index_name =
            std::env::var("PINECONE_INDEX_NAME").unwrap_or_else(|_| "merlin".to_string());
        let pinecone_namespace =
            std::env::var("PINECONE_NAMESPACE").unwrap_or_else(|_| "ns1".to_string());

        let correlate_api_url = std::env::var("CORRELATE_API_URL")
            .unwrap_or_else(|_| "https://correlateapp-be.onrender.com".to_string());
        let correlate_api_key = std::env::var("CORRELATE_API_KEY").ok();

        let allowed_user_ids = parse_id_list(
            &std::env::var("TELEGRAM_ALLOWED_USERS").unwrap_or_default(),
        );

        let chat_model =
            std::env::var("CHAT_MODEL").unwrap_or_else(|_| "gpt-3.5-turbo".to_string());
        let embedding_model = std::env::var("EMBEDDING_MODEL")
            .unwrap_or_else(|_| "text-embedding-3-small".to_string());

        let retrieval_k = std::env::var("RETRIEVAL_K")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(50);

        let db_path = std::env::var("MERLIN_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("merlin.db"));

        let webhook_url = std::env::var("WEBHOOK_URL").ok();

        let port = std::env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8080);

        Ok(Self {
            telegram_bot_token,
            openai_api_key,
            supabase_url,
            supabase_key,
            pinecone_api_key,
            pinecone_index_name,
            pinecone_namespace,
            correlate_api_url,
            correlate_api_key,
            allowed_user_ids,
            chat_model,
            embedding_model,
            retrieval_k,
            db_path,
            webhook_url,
            port,
        })
    }

    /// Check whether a Telegram user id may talk to the bot.
    /// An empty allow-list means everyone is allowed.
    pub fn is_allowed(&self, user_id: i64) -> bool {
        self.allowed_user_ids.is_empty() || self.allowed_user_ids.contains(&user_id)
    }
}

/// Parse a comma-separated list of Telegram user ids, ignoring junk entries
fn parse_id_list(raw: &str) -> Vec<i64> {
    raw.split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_id_list() {
        assert_eq!(parse_id_list("284307817, 263786736"), vec![284307817, 263786736]);
        assert_eq!(parse_id_list(""), Vec::<i64>::new());
        assert_eq!(parse_id_list("123,abc, 456 ,"), vec![123, 456]);
    }

    #[test]
    fn test_empty_allow_list_allows_everyone() {
        let mut config = test_config();
        config.allowed_user_ids = vec![];
        assert!(config.is_allowed(42));

        config.allowed_user_ids = vec![1, 2];
        assert!(config.is_allowed(1));
        assert!(!config.is_allowed(42));
    }

    fn test_config() -> Config {
        Config {
            telegram_bot_token: "token".into(),
            openai_api_key: "key".into(),
            supabase_url: "https://example.supabase.co".into(),
            supabase_key: "key".into(),
            pinecone_api_key: "key".into(),
            pinecone_index_name: "merlin".into(),
            pinecone_namespace: "ns1".into(),
            correlate_api_url: "https://correlateapp-be.onrender.com".into(),
            correlate_api_key: None,
            allowed_user_ids: vec![],
            chat_model: "gpt-3.5-turbo".into(),
            embedding_model: "text-embedding-3-small".into(),
            retrieval_k: 50,
            db_path: PathBuf::from("merlin.db"),
            webhook_url: None,
            port: 8080,
        }
    }
}
