//! User Store
//!
//! Users live in a Supabase `users` table, reached over PostgREST.
//! `UserDirectory` is the service layer: it mints ids and timestamps on
//! registration and resolves users by either id or Telegram external id.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// A registered user
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: String,
    /// Telegram user id, stored as text
    pub external_id: String,
    pub first_name: String,
    #[serde(default)]
    pub last_name: Option<String>,
    pub created_at: String,
}

/// Input for registration; id and created_at are minted by the service
#[derive(Debug, Clone)]
pub struct NewUser {
    pub external_id: String,
    pub first_name: String,
    pub last_name: Option<String>,
}

/// Storage seam for the user table
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn create(&self, user: &User) -> Result<User>;
    async fn find_by_id(&self, id: &str) -> Result<Option<User>>;
    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<User>>;
    async fn delete(&self, id: &str) -> Result<()>;
}

/// PostgREST wrapper over the Supabase `users` table
pub struct SupabaseUserRepository {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl SupabaseUserRepository {
    pub fn new(supabase_url: &str, supabase_key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: supabase_url.trim_end_matches('/').to_string(),
            api_key: supabase_key.to_string(),
        }
    }

    fn users_url(&self) -> String {
        format!("{}/rest/v1/users", self.base_url)
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("apikey", &self.api_key).bearer_auth(&self.api_key)
    }

    async fn select(&self, column: &str, value: &str) -> Result<Vec<User>> {
        let url = self.users_url();
        let response = self
            .authed(self.client.get(&url))
            .query(&[(column, format!("eq.{}", value)), ("select", "*".to_string())])
            .send()
            .await
            .with_context(|| format!("request to {} failed", url))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("{} returned {}: {}", url, status, body);
        }

        response
            .json()
            .await
            .with_context(|| format!("unexpected response shape from {}", url))
    }
}

#[async_trait]
impl UserRepository for SupabaseUserRepository {
    async fn create(&self, user: &User) -> Result<User> {
        let url = self.users_url();
        let response = self
            .authed(self.client.post(&url))
            .header("Prefer", "return=representation")
            .json(user)
            .send()
            .await
            .with_context(|| format!("request to {} failed", url))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("{} returned {}: {}", url, status, body);
        }

        let mut rows: Vec<User> = response
            .json()
            .await
            .with_context(|| format!("unexpected response shape from {}", url))?;

        rows.pop()
            .ok_or_else(|| anyhow::anyhow!("insert into {} returned no rows", url))
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<User>> {
        Ok(self.select("id", id).await?.into_iter().next())
    }

    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<User>> {
        Ok(self.select("external_id", external_id).await?.into_iter().next())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let url = self.users_url();
        let response = self
            .authed(self.client.delete(&url))
            .query(&[("id", format!("eq.{}", id))])
            .send()
            .await
            .with_context(|| format!("request to {} failed", url))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("{} returned {}: {}", url, status, body);
        }

        Ok(())
    }
}

/// Service layer over the user repository
pub struct UserDirectory {
    repository: Arc<dyn UserRepository>,
}

impl UserDirectory {
    pub fn new(repository: Arc<dyn UserRepository>) -> Self {
        Self { repository }
    }

    /// Register a new user: mints the id and creation timestamp
    pub async fn register(&self, input: NewUser) -> Result<User> {
        let user = User {
            id: uuid::Uuid::new_v4().to_string(),
            external_id: input.external_id,
            first_name: input.first_name,
            last_name: input.last_name,
            created_at: chrono::Utc::now().to_rfc3339(),
        };

        let created = self.repository.create(&user).await?;
        info!("Registered user {} (external {})", created.id, created.external_id);
        Ok(created)
    }

    pub async fn is_registered(&self, external_id: &str) -> Result<bool> {
        Ok(self.repository.find_by_external_id(external_id).await?.is_some())
    }

    /// Resolve a user by internal id or external id. UUID-shaped keys are
    /// tried as internal ids first, then fall back to external lookup.
    pub async fn get_by_id_or_external_id(&self, key: &str) -> Result<Option<User>> {
        if uuid::Uuid::parse_str(key).is_ok() {
            if let Some(user) = self.repository.find_by_id(key).await? {
                return Ok(Some(user));
            }
        }

        let user = self.repository.find_by_external_id(key).await?;
        debug!("Lookup {}: {}", key, if user.is_some() { "found" } else { "missing" });
        Ok(user)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.repository.delete(id).await
    }
}
