//! Webhook HTTP Server
//!
//! Axum server for webhook mode: the Telegram webhook route (mounted through
//! teloxide's axum listener), a liveness endpoint, and validation of Telegram
//! WebApp `initData` payloads for the companion mini-app.

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use std::net::SocketAddr;
use std::sync::Arc;
use teloxide::{
    dispatching::Dispatcher,
    dptree,
    error_handlers::LoggingErrorHandler,
    prelude::*,
    update_listeners::webhooks,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

use crate::telegram::{log_startup, update_handler, verify_bot, BotData};

type HmacSha256 = Hmac<Sha256>;

/// Why an initData payload was rejected
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InitDataError {
    #[error("initData is missing the hash parameter")]
    MissingHash,
    #[error("initData signature mismatch")]
    BadSignature,
}

struct AppState {
    bot_token: String,
}

#[derive(Debug, Deserialize)]
struct ValidateRequest {
    data: ValidateData,
}

#[derive(Debug, Deserialize)]
struct ValidateData {
    #[serde(rename = "initData")]
    init_data: String,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct WebAppUser {
    id: String,
    first_name: String,
    last_name: String,
    username: String,
}

/// Run the bot in webhook mode: Telegram delivers updates over HTTPS to
/// `WEBHOOK_URL`, and the same server answers the API endpoints.
pub async fn run_webhook_server(data: Arc<BotData>) -> Result<()> {
    let bot = Bot::new(&data.config.telegram_bot_token);

    verify_bot(&bot).await?;
    log_startup(&data);

    let addr = SocketAddr::from(([0, 0, 0, 0], data.config.port));
    let webhook_url = data
        .config
        .webhook_url
        .as_deref()
        .context("WEBHOOK_URL must be set in webhook mode (or run with --polling)")?
        .parse()
        .context("WEBHOOK_URL is not a valid URL")?;

    let (listener, stop_flag, bot_router) =
        webhooks::axum_to_router(bot.clone(), webhooks::Options::new(addr, webhook_url))
            .await
            .context("failed to register Telegram webhook")?;

    let state = Arc::new(AppState {
        bot_token: data.config.telegram_bot_token.clone(),
    });

    let app = Router::new()
        .route("/alive", get(alive))
        .route("/api/validate-telegram", post(validate_telegram))
        .with_state(state)
        .merge(bot_router)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    tokio::spawn(async move {
        let tcp = match tokio::net::TcpListener::bind(addr).await {
            Ok(tcp) => tcp,
            Err(e) => {
                error!("Failed to bind {}: {}", addr, e);
                return;
            }
        };
        info!("Webhook server listening on {}", addr);

        if let Err(e) = axum::serve(tcp, app).with_graceful_shutdown(stop_flag).await {
            error!("Webhook server error: {}", e);
        }
    });

    Dispatcher::builder(bot, update_handler())
        .dependencies(dptree::deps![data])
        .default_handler(|upd| async move {
            tracing::debug!("Unhandled update: {:?}", upd);
        })
        .enable_ctrlc_handler()
        .build()
        .dispatch_with_listener(
            listener,
            LoggingErrorHandler::with_custom_text("Error in webhook update listener"),
        )
        .await;

    Ok(())
}

async fn alive() -> String {
    format!(
        "It is alive 🔥🔥🔥 Now: {} UTC",
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
    )
}

async fn validate_telegram(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ValidateRequest>,
) -> Response {
    let init_data = request.data.init_data;

    if init_data.is_empty() {
        return (StatusCode::BAD_REQUEST, "Bad request").into_response();
    }

    if let Err(e) = verify_init_data(&init_data, &state.bot_token) {
        info!("initData validation failed: {}", e);
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }

    Json(extract_user(&init_data)).into_response()
}

/// Validate a Telegram WebApp `initData` string.
///
/// The data-check-string is every decoded `key=value` pair except `hash`,
/// sorted and joined with newlines. The secret key is
/// HMAC-SHA256("WebAppData", bot_token); the payload is valid when
/// HMAC-SHA256(secret, data-check-string) equals the supplied hash.
pub fn verify_init_data(init_data: &str, bot_token: &str) -> Result<(), InitDataError> {
    let mut received_hash = None;
    let mut lines: Vec<String> = Vec::new();

    for (key, value) in url::form_urlencoded::parse(init_data.as_bytes()) {
        if key == "hash" {
            received_hash = Some(value.into_owned());
        } else {
            lines.push(format!("{}={}", key, value));
        }
    }

    let received_hash = received_hash.ok_or(InitDataError::MissingHash)?;
    let received_hash = hex::decode(received_hash).map_err(|_| InitDataError::BadSignature)?;

    lines.sort();
    let data_check_string = lines.join("\n");

    let mut secret = HmacSha256::new_from_slice(b"WebAppData").expect("HMAC accepts any key length");
    secret.update(bot_token.as_bytes());
    let secret_key = secret.finalize().into_bytes();

    let mut mac = HmacSha256::new_from_slice(&secret_key).expect("HMAC accepts any key length");
    mac.update(data_check_string.as_bytes());

    mac.verify_slice(&received_hash)
        .map_err(|_| InitDataError::BadSignature)
}

/// Pull the embedded user object out of a (verified) initData string
fn extract_user(init_data: &str) -> WebAppUser {
    let raw = url::form_urlencoded::parse(init_data.as_bytes())
        .find(|(key, _)| key == "user")
        .map(|(_, value)| value.into_owned())
        .unwrap_or_default();

    let value: Value = serde_json::from_str(&raw).unwrap_or(Value::Null);

    let string_field = |name: &str| match value.get(name) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    };

    WebAppUser {
        id: string_field("id"),
        first_name: string_field("first_name"),
        last_name: string_field("last_name"),
        username: string_field("username"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOT_TOKEN: &str = "123456:ABC-DEF1234ghIkl-zyx57W2v1u123ew11";

    /// Build a signed initData string the way Telegram does
    fn sign_init_data(pairs: &[(&str, &str)], bot_token: &str) -> String {
        let mut lines: Vec<String> = pairs.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        lines.sort();
        let data_check_string = lines.join("\n");

        let mut secret =
            HmacSha256::new_from_slice(b"WebAppData").expect("HMAC accepts any key length");
        secret.update(bot_token.as_bytes());
        let secret_key = secret.finalize().into_bytes();

        let mut mac =
            HmacSha256::new_from_slice(&secret_key).expect("HMAC accepts any key length");
        mac.update(data_check_string.as_bytes());
        let hash = hex::encode(mac.finalize().into_bytes());

        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in pairs {
            serializer.append_pair(k, v);
        }
        serializer.append_pair("hash", &hash);
        serializer.finish()
    }

    fn sample_pairs() -> Vec<(&'static str, &'static str)> {
        vec![
            ("auth_date", "1700000000"),
            ("query_id", "AAGq3kMS"),
            (
                "user",
                r#"{"id":284307817,"first_name":"Max","last_name":"M","username":"maxm"}"#,
            ),
        ]
    }

    #[test]
    fn test_verify_round_trip() {
        let init_data = sign_init_data(&sample_pairs(), BOT_TOKEN);
        assert_eq!(verify_init_data(&init_data, BOT_TOKEN), Ok(()));
    }

    #[test]
    fn test_verify_rejects_wrong_token() {
        let init_data = sign_init_data(&sample_pairs(), BOT_TOKEN);
        assert_eq!(
            verify_init_data(&init_data, "999999:other-token"),
            Err(InitDataError::BadSignature)
        );
    }

    #[test]
    fn test_verify_rejects_tampered_field() {
        let init_data = sign_init_data(&sample_pairs(), BOT_TOKEN);
        let tampered = init_data.replace("1700000000", "1700000001");
        assert_eq!(
            verify_init_data(&tampered, BOT_TOKEN),
            Err(InitDataError::BadSignature)
        );
    }

    #[test]
    fn test_verify_requires_hash() {
        assert_eq!(
            verify_init_data("auth_date=1700000000", BOT_TOKEN),
            Err(InitDataError::MissingHash)
        );
    }

    #[test]
    fn test_extract_user() {
        let init_data = sign_init_data(&sample_pairs(), BOT_TOKEN);

        let user = extract_user(&init_data);
        assert_eq!(
            user,
            WebAppUser {
                id: "284307817".to_string(),
                first_name: "Max".to_string(),
                last_name: "M".to_string(),
                username: "maxm".to_string(),
            }
        );
    }

    #[test]
    fn test_extract_user_missing_fields() {
        let user = extract_user("auth_date=1");
        assert!(user.id.is_empty());
        assert!(user.first_name.is_empty());
    }
}
