//! Telegram Bot
//!
//! The front end: an explicit teloxide Dispatcher with an allow-list check on
//! every update, registration commands, and the core message flow — classify
//! the message's intent, then save a memory, answer from memories, or admit
//! defeat.

use anyhow::{Context, Result};
use std::sync::{Arc, Mutex};
use teloxide::{
    dispatching::{Dispatcher, UpdateFilterExt, UpdateHandler},
    dptree,
    error_handlers::LoggingErrorHandler,
    prelude::*,
    types::{ChatAction, ReactionType},
};
use tracing::{info, warn};

use crate::agent::{standard_toolset, Agent};
use crate::config::Config;
use crate::conversation::ConversationStore;
use crate::embeddings::{Embedder, EmbeddingClient};
use crate::meals::MealCalculator;
use crate::memory::{MemoryService, PineconeStore, VectorStore};
use crate::openai::{ChatModel, Intent, OpenAiClient};
use crate::parameters::CorrelateClient;
use crate::users::{NewUser, SupabaseUserRepository, UserDirectory, UserRepository};

/// Telegram message length limit
const MAX_MESSAGE_LEN: usize = 4096;

const REGISTER_FIRST: &str = "Please register first using /register command";

/// Everything the handlers need, wired once at startup
pub struct BotData {
    pub config: Config,
    pub users: UserDirectory,
    pub memories: Arc<MemoryService>,
    pub agent: Agent,
    pub meals: MealCalculator,
    pub parameters: Arc<CorrelateClient>,
    pub model: Arc<dyn ChatModel>,
}

impl BotData {
    /// Build all services from config
    pub async fn from_config(config: Config) -> Result<Arc<Self>> {
        let model: Arc<OpenAiClient> = Arc::new(OpenAiClient::from_config(&config));
        let model_dyn: Arc<dyn ChatModel> = model.clone();

        let embedder: Arc<dyn Embedder> = Arc::new(EmbeddingClient::new(
            &config.openai_api_key,
            &config.embedding_model,
        ));
        info!(
            "Embedding model: {} ({} dims)",
            config.embedding_model,
            embedder.dimension()
        );

        let repository: Arc<dyn UserRepository> = Arc::new(SupabaseUserRepository::new(
            &config.supabase_url,
            &config.supabase_key,
        ));
        let users = UserDirectory::new(repository);

        let store: Arc<dyn VectorStore> = Arc::new(
            PineconeStore::connect(
                &config.pinecone_api_key,
                &config.pinecone_index_name,
                &config.pinecone_namespace,
            )
            .await?,
        );
        let memories = Arc::new(MemoryService::new(store, embedder, model_dyn.clone()));

        let parameters = Arc::new(CorrelateClient::new(
            &config.correlate_api_url,
            config.correlate_api_key.as_deref(),
        ));

        let checkpoints = ConversationStore::open(&config.db_path)?;
        checkpoints.cleanup_expired()?;
        let checkpoints = Arc::new(Mutex::new(checkpoints));
        let agent = Agent::new(
            model_dyn.clone(),
            standard_toolset(memories.clone(), parameters.clone()),
            checkpoints,
        );

        let meals = MealCalculator::new(model_dyn.clone());

        Ok(Arc::new(Self {
            config,
            users,
            memories,
            agent,
            meals,
            parameters,
            model: model_dyn,
        }))
    }

    pub fn is_allowed(&self, user_id: i64) -> bool {
        self.config.is_allowed(user_id)
    }
}

/// What the core dispatch decided to do with a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// React to the user's message with an emoji
    React(&'static str),
    /// Send a text reply
    Reply(String),
}

/// The core flow: classify the message, then branch.
///
/// Save → store the message as a memory and acknowledge with a reaction.
/// Retrieve → answer from the user's memories.
/// Unknown → apologize.
pub async fn dispatch_message(
    model: &dyn ChatModel,
    memories: &MemoryService,
    user_id: &str,
    text: &str,
    k: usize,
) -> Result<Outcome> {
    match model.identify_intent(text).await? {
        Intent::Save => {
            memories.save_memory(user_id, text).await?;
            Ok(Outcome::React("👍"))
        }
        Intent::Retrieve => {
            let answer = memories.find_relevant_memories(user_id, text, k).await?;
            Ok(Outcome::Reply(answer))
        }
        Intent::Unknown => Ok(Outcome::Reply(
            "I do not understand what you are saying. 😔".to_string(),
        )),
    }
}

/// The dptree handler tree, shared by polling and webhook modes
pub fn update_handler() -> UpdateHandler<teloxide::RequestError> {
    dptree::entry().branch(Update::filter_message().endpoint(message_handler))
}

/// Run the bot with long polling
pub async fn run_polling(data: Arc<BotData>) -> Result<()> {
    let bot = Bot::new(&data.config.telegram_bot_token);

    verify_bot(&bot).await?;

    // Polling and webhooks are mutually exclusive on the Telegram side
    info!("Clearing webhook (if any)...");
    if let Err(e) = bot.delete_webhook().await {
        warn!("Failed to delete webhook: {} (continuing anyway)", e);
    }

    log_startup(&data);
    info!("Starting dispatcher with long polling...");

    Dispatcher::builder(bot, update_handler())
        .dependencies(dptree::deps![data])
        .default_handler(|upd| async move {
            tracing::debug!("Unhandled update: {:?}", upd);
        })
        .error_handler(LoggingErrorHandler::with_custom_text(
            "Error in message handler",
        ))
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    warn!("Dispatcher stopped");
    Ok(())
}

/// Verify the bot token by calling getMe
pub async fn verify_bot(bot: &Bot) -> Result<()> {
    let me = bot.get_me().await.context("Bot authentication failed")?;
    info!(
        "Bot authenticated: @{} (ID: {})",
        me.username.as_deref().unwrap_or("unknown"),
        me.id
    );
    Ok(())
}

pub(crate) fn log_startup(data: &BotData) {
    info!("===========================================");
    info!("  Merlin - Starting...");
    info!("===========================================");
    info!(
        "Allowed users: {}",
        if data.config.allowed_user_ids.is_empty() {
            "ALL".to_string()
        } else {
            format!("{:?}", data.config.allowed_user_ids)
        }
    );
    info!("Pinecone namespace: {}", data.config.pinecone_namespace);
    info!("Chat model: {}", data.config.chat_model);
}

/// Message handler endpoint for the dispatcher
async fn message_handler(bot: Bot, msg: Message, data: Arc<BotData>) -> ResponseResult<()> {
    let user_id = msg.from.as_ref().map(|u| u.id.0 as i64).unwrap_or(0);
    let preview = msg
        .text()
        .unwrap_or("<non-text>")
        .chars()
        .take(50)
        .collect::<String>();

    info!(
        ">>> Message received: user={}, chat={}, text={:?}",
        user_id, msg.chat.id.0, preview
    );

    if let Err(e) = handle_message(bot, msg, data).await {
        tracing::error!("Error handling message: {:#}", e);
    }

    Ok(())
}

async fn handle_message(bot: Bot, msg: Message, data: Arc<BotData>) -> Result<()> {
    let user_id = msg.from.as_ref().map(|u| u.id.0 as i64).unwrap_or(0);
    let chat_id = msg.chat.id;

    if !data.is_allowed(user_id) {
        warn!("Unauthorized user: {}", user_id);
        bot.send_message(chat_id, "Unauthorized.").await?;
        return Ok(());
    }

    let Some(text) = msg.text() else {
        return Ok(());
    };

    if text.starts_with('/') {
        return handle_command(&bot, &msg, &data, text).await;
    }

    let external_id = user_id.to_string();
    if !data.users.is_registered(&external_id).await? {
        bot.send_message(chat_id, REGISTER_FIRST).await?;
        return Ok(());
    }

    let user = data
        .users
        .get_by_id_or_external_id(&external_id)
        .await?
        .context("registered user not found")?;

    bot.send_chat_action(chat_id, ChatAction::Typing).await?;

    let outcome = dispatch_message(
        data.model.as_ref(),
        &data.memories,
        &user.id,
        text,
        data.config.retrieval_k,
    )
    .await?;

    match outcome {
        Outcome::React(emoji) => {
            bot.set_message_reaction(chat_id, msg.id)
                .reaction(vec![ReactionType::Emoji {
                    emoji: emoji.to_string(),
                }])
                .await?;
        }
        Outcome::Reply(reply) => {
            send_long_message(&bot, chat_id, &reply).await?;
        }
    }

    Ok(())
}

async fn handle_command(bot: &Bot, msg: &Message, data: &BotData, text: &str) -> Result<()> {
    let chat_id = msg.chat.id;
    let user_id = msg.from.as_ref().map(|u| u.id.0 as i64).unwrap_or(0);
    let external_id = user_id.to_string();

    let parts: Vec<&str> = text.splitn(2, ' ').collect();
    let cmd = parts[0];
    let args = parts.get(1).map(|s| s.trim()).unwrap_or("");

    match cmd {
        "/start" => {
            if !data.users.is_registered(&external_id).await? {
                bot.send_message(chat_id, REGISTER_FIRST).await?;
                return Ok(());
            }

            let user = data
                .users
                .get_by_id_or_external_id(&external_id)
                .await?
                .context("registered user not found")?;

            bot.send_message(
                chat_id,
                format!("Hello, {}! Welcome to Merlin! 🧙‍♂️", user.first_name),
            )
            .await?;
        }

        "/register" => {
            if data.users.is_registered(&external_id).await? {
                bot.send_message(chat_id, "You are already registered!").await?;
                return Ok(());
            }

            let from = msg
                .from
                .as_ref()
                .context("message without sender cannot register")?;

            data.users
                .register(NewUser {
                    external_id,
                    first_name: from.first_name.clone(),
                    last_name: from.last_name.clone(),
                })
                .await?;

            bot.send_message(chat_id, "You have been successfully registered!")
                .await?;
        }

        "/help" => {
            bot.send_message(
                chat_id,
                "Merlin 🧙‍♂️\n\n\
                Talk to me in plain text:\n\
                - Tell me something to remember and I save it\n\
                - Ask about something you told me and I answer from your memories\n\n\
                Commands:\n\
                /start - Greeting\n\
                /register - Create your account\n\
                /ask <question> - Ask the assistant (tools: memory, tracking)\n\
                /meal <description> - Nutrition breakdown of a meal\n\
                /params - List your tracked parameters\n\
                /forget - Clear this chat's assistant thread\n\
                /help - This message",
            )
            .await?;
        }

        "/ask" => {
            if args.is_empty() {
                bot.send_message(chat_id, "Usage: /ask <question>").await?;
                return Ok(());
            }

            let Some(user) = require_registered(bot, chat_id, data, &external_id).await? else {
                return Ok(());
            };

            bot.send_chat_action(chat_id, ChatAction::Typing).await?;
            let answer = data.agent.invoke(chat_id.0, &user, args).await?;
            send_long_message(bot, chat_id, &answer).await?;
        }

        "/meal" => {
            if args.is_empty() {
                bot.send_message(chat_id, "Usage: /meal <what you ate>").await?;
                return Ok(());
            }

            if require_registered(bot, chat_id, data, &external_id).await?.is_none() {
                return Ok(());
            }

            bot.send_chat_action(chat_id, ChatAction::Typing).await?;
            match data.meals.calculate(args).await {
                Ok(report) => {
                    bot.send_message(chat_id, report.format_reply()).await?;
                }
                Err(e) => {
                    warn!("Meal calculation failed: {:#}", e);
                    bot.send_message(chat_id, "I could not work out the nutrition for that meal.")
                        .await?;
                }
            }
        }

        "/params" => {
            if require_registered(bot, chat_id, data, &external_id).await?.is_none() {
                return Ok(());
            }

            let correlate_user = data.parameters.get_user_by_external_id(&external_id).await?;
            let parameters = data
                .parameters
                .list_parameters_by_user(&correlate_user.id)
                .await?;

            if parameters.is_empty() {
                bot.send_message(chat_id, "You are not tracking any parameters yet.")
                    .await?;
            } else {
                let lines = parameters
                    .iter()
                    .map(|p| format!("- {} ({}): {}", p.name, p.unit, p.description))
                    .collect::<Vec<_>>()
                    .join("\n");
                bot.send_message(chat_id, format!("Tracked parameters:\n{}", lines))
                    .await?;
            }
        }

        "/forget" => {
            let cleared = data.agent.clear_thread(chat_id.0)?;
            bot.send_message(chat_id, format!("Forgot {} turns of this conversation.", cleared))
                .await?;
        }

        _ => {
            bot.send_message(chat_id, "Unknown command. Try /help.").await?;
        }
    }

    Ok(())
}

/// Require registration for a command; replies and returns None when missing
async fn require_registered(
    bot: &Bot,
    chat_id: ChatId,
    data: &BotData,
    external_id: &str,
) -> Result<Option<crate::users::User>> {
    let user = data.users.get_by_id_or_external_id(external_id).await?;
    if user.is_none() {
        bot.send_message(chat_id, REGISTER_FIRST).await?;
    }
    Ok(user)
}

/// Send a message, splitting it to respect Telegram's length limit
pub async fn send_long_message(bot: &Bot, chat_id: ChatId, text: &str) -> Result<()> {
    for chunk in split_message(text, MAX_MESSAGE_LEN) {
        bot.send_message(chat_id, chunk).await?;
    }
    Ok(())
}

/// Split text into chunks of at most `max_len` characters, preferring to
/// break at newlines
pub(crate) fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.is_empty() {
        return vec![String::new()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();

    for line in text.split_inclusive('\n') {
        if current.chars().count() + line.chars().count() > max_len {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }

            // A single oversized line gets hard-split on char boundaries
            let mut rest: Vec<char> = line.chars().collect();
            while rest.len() > max_len {
                chunks.push(rest.drain(..max_len).collect());
            }
            current = rest.into_iter().collect();
        } else {
            current.push_str(line);
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}
