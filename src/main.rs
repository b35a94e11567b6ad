//! Merlin - Entry Point
//!
//! Modes:
//! - Default: webhook server (Telegram pushes updates to WEBHOOK_URL)
//! - --polling / -p: long polling (no public URL needed)

use merlin_bot::{server, telegram, BotData, Config};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Parse args
    let args: Vec<String> = std::env::args().collect();
    let polling_mode = args.iter().any(|a| a == "--polling" || a == "-p");
    let help_mode = args.iter().any(|a| a == "--help" || a == "-h");

    if help_mode {
        println!("Merlin v{}", env!("CARGO_PKG_VERSION"));
        println!();
        println!("Usage: merlin-bot [OPTIONS]");
        println!();
        println!("Options:");
        println!("  --polling, -p  Run with long polling instead of a webhook");
        println!("  --help, -h     Show this help");
        println!();
        println!("Default: webhook server on PORT (requires WEBHOOK_URL)");
        println!();
        println!("Environment variables:");
        println!("  TELEGRAM_BOT_TOKEN       Telegram bot token");
        println!("  OPENAI_API_KEY           OpenAI API key");
        println!("  SUPABASE_URL             Supabase project URL");
        println!("  SUPABASE_KEY             Supabase service key");
        println!("  PINECONE_API_KEY         Pinecone API key");
        println!("  PINECONE_INDEX_NAME      Pinecone index (default: merlin)");
        println!("  TELEGRAM_ALLOWED_USERS   Comma-separated allow-list (empty: allow all)");
        println!("  WEBHOOK_URL              Public webhook URL (webhook mode)");
        println!("  PORT                     HTTP port (default: 8080)");
        return Ok(());
    }

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Merlin v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    let data = BotData::from_config(config).await?;

    if polling_mode {
        telegram::run_polling(data).await?;
    } else {
        server::run_webhook_server(data).await?;
    }

    Ok(())
}
