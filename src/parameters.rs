//! Parameter Tracking
//!
//! Wrapper over the Correlate REST API: user-defined tracked parameters
//! (weight, calories, ...) and their measurements. Correlate keeps its own
//! user records keyed by the same Telegram external id as ours.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

/// Correlate's view of a user
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelateUser {
    pub id: String,
    pub external_id: String,
    pub created_at: String,
    pub updated_at: String,
}

/// A tracked parameter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Parameter {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub description: String,
    pub data_type: String,
    pub unit: String,
    pub created_at: String,
    pub updated_at: String,
}

/// A single measurement of a parameter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Measurement {
    pub r#type: String,
    pub id: String,
    pub user_id: String,
    pub parameter_id: String,
    pub timestamp: String,
    pub notes: String,
    pub value: f64,
    pub created_at: String,
    pub updated_at: String,
}

/// Input for creating a parameter (data type is always float)
#[derive(Debug, Clone)]
pub struct NewParameter {
    pub user_id: String,
    pub name: String,
    pub description: String,
    pub unit: String,
}

/// Input for logging a measurement
#[derive(Debug, Clone)]
pub struct NewMeasurement {
    pub parameter_id: String,
    pub notes: String,
    pub value: f64,
}

/// Correlate REST client
pub struct CorrelateClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl CorrelateClient {
    pub fn new(base_url: &str, api_key: Option<&str>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.map(|s| s.to_string()),
        }
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        debug!("Correlate GET {}", url);

        let response = self
            .authed(self.client.get(&url))
            .send()
            .await
            .with_context(|| format!("request to {} failed", url))?;

        Self::decode(response, &url).await
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        debug!("Correlate POST {}", url);

        let response = self
            .authed(self.client.post(&url))
            .json(body)
            .send()
            .await
            .with_context(|| format!("request to {} failed", url))?;

        Self::decode(response, &url).await
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
        url: &str,
    ) -> Result<T> {
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

    pub async fn get_user_by_external_id(&self, external_id: &str) -> Result<CorrelateUser> {
        self.get_json(&format!("/api/users/external/{}", external_id))
            .await
    }

    pub async fn create_parameter(&self, input: NewParameter) -> Result<Parameter> {
        self.post_json(
            "/api/parameters",
            &json!({
                "userId": input.user_id,
                "name": input.name,
                "description": input.description,
                "dataType": "float",
                "unit": input.unit,
            }),
        )
        .await
    }

    pub async fn list_parameters_by_user(&self, user_id: &str) -> Result<Vec<Parameter>> {
        self.get_json(&format!("/api/parameters/user/{}", user_id))
            .await
    }

    pub async fn create_measurement(&self, input: NewMeasurement) -> Result<Measurement> {
        self.post_json(
            "/api/measurements",
            &json!({
                "parameterId": input.parameter_id,
                "notes": input.notes,
                "value": input.value,
            }),
        )
        .await
    }

    pub async fn list_measurements_by_parameter(
        &self,
        parameter_id: &str,
    ) -> Result<Vec<Measurement>> {
        self.get_json(&format!("/api/measurements/parameter/{}", parameter_id))
            .await
    }
}
