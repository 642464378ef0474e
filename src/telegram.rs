//! Telegram Transport
//!
//! teloxide-backed implementation of [`ChatTransport`] plus the long-polling
//! dispatcher that feeds the pipeline. Telegram embeds the replied-to
//! message inside each update, so reply-target senders are resolved from a
//! small cache filled during mapping; a miss is treated as unknown, never as
//! an error.

use crate::admission::{AdmissionConfig, AdmissionPolicy};
use crate::config::Config;
use crate::context::ConversationMemory;
use crate::credentials::CredentialPool;
use crate::openrouter::OpenRouterClient;
use crate::pipeline::{PipelineConfig, QuickReplies, ResponsePipeline};
use crate::rate_limit::RateLimiter;
use crate::transport::{ChatTransport, IncomingMessage, SenderKind};
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use teloxide::{
    dispatching::{Dispatcher, UpdateFilterExt},
    dptree,
    error_handlers::LoggingErrorHandler,
    prelude::*,
    types::{ChatAction, MessageId, ReplyParameters, Update},
};
use tracing::{debug, info, warn};

/// Telegram message length cap, with margin for entities
const MAX_CHUNK: usize = 4000;

/// Reply-target senders remembered for resolution
const SENDER_CACHE_CAP: usize = 512;

/// Drain window for in-flight requests at shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

struct SenderCache {
    map: HashMap<(i64, i32), SenderKind>,
    order: VecDeque<(i64, i32)>,
}

impl SenderCache {
    fn new() -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn insert(&mut self, key: (i64, i32), kind: SenderKind) {
        if self.map.insert(key, kind).is_none() {
            self.order.push_back(key);
            if self.order.len() > SENDER_CACHE_CAP {
                if let Some(old) = self.order.pop_front() {
                    self.map.remove(&old);
                }
            }
        }
    }
}

/// [`ChatTransport`] over the Telegram Bot API
pub struct TelegramTransport {
    bot: Bot,
    bot_user_id: u64,
    senders: Mutex<SenderCache>,
}

impl TelegramTransport {
    pub fn new(bot: Bot, bot_user_id: u64) -> Self {
        Self {
            bot,
            bot_user_id,
            senders: Mutex::new(SenderCache::new()),
        }
    }

    /// Remember who sent the message a new update replies to, so the
    /// pipeline can ask later without another network round-trip.
    fn cache_reply_sender(&self, chat_id: i64, msg: &Message) {
        let Some(replied) = msg.reply_to_message() else {
            return;
        };
        let kind = match replied.from.as_ref() {
            None => SenderKind::Unknown,
            Some(user) if user.is_bot || user.id.0 == self.bot_user_id => SenderKind::Bot,
            Some(user) => SenderKind::Human {
                handle: user.username.clone(),
            },
        };
        self.senders
            .lock()
            .insert((chat_id, replied.id.0), kind);
    }
}

#[async_trait]
impl ChatTransport for TelegramTransport {
    async fn resolve_reply_sender(&self, chat_id: i64, reply_target_id: i32) -> SenderKind {
        self.senders
            .lock()
            .map
            .get(&(chat_id, reply_target_id))
            .cloned()
            .unwrap_or(SenderKind::Unknown)
    }

    async fn reply(&self, msg: &IncomingMessage, text: &str) {
        for chunk in chunk_message(text) {
            let result = self
                .bot
                .send_message(ChatId(msg.chat_id), chunk)
                .reply_parameters(ReplyParameters::new(MessageId(msg.message_id)))
                .await;
            match result {
                Ok(sent) => {
                    // Our own messages become valid reply targets
                    self.senders
                        .lock()
                        .insert((msg.chat_id, sent.id.0), SenderKind::Bot);
                }
                Err(e) => {
                    warn!(chat_id = msg.chat_id, error = %e, "reply delivery failed");
                    return;
                }
            }
        }
    }

    async fn send_typing(&self, chat_id: i64) {
        if let Err(e) = self
            .bot
            .send_chat_action(ChatId(chat_id), ChatAction::Typing)
            .await
        {
            debug!(chat_id, error = %e, "typing indicator failed");
        }
    }
}

/// Split on char boundaries into Telegram-sized pieces
fn chunk_message(text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        let split_at = remaining
            .char_indices()
            .take_while(|(i, _)| *i < MAX_CHUNK)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(remaining.len());
        chunks.push(remaining[..split_at].to_string());
        remaining = &remaining[split_at..];
    }
    chunks
}

struct BotData {
    pipeline: Arc<ResponsePipeline>,
    transport: Arc<TelegramTransport>,
    bot_user_id: u64,
}

/// Build every component from config and run the long-polling dispatcher
/// until interrupted, then drain in-flight requests.
pub async fn run_bot(config: Config) -> Result<()> {
    let bot = Bot::new(config.telegram_token.clone());

    info!("Verifying bot token...");
    let me = bot.get_me().await?;
    let bot_user_id = me.id.0;
    info!(
        "Bot authenticated: @{} (ID: {})",
        me.username.as_deref().unwrap_or("unknown"),
        bot_user_id
    );

    if let Err(e) = bot.delete_webhook().await {
        warn!("Failed to delete webhook: {} (continuing anyway)", e);
    }

    let transport = Arc::new(TelegramTransport::new(bot.clone(), bot_user_id));

    let model = Arc::new(OpenRouterClient::new(
        &config.model_id,
        config.max_tokens,
        config.temperature,
        config.api_timeout,
    )?);

    let pipeline = ResponsePipeline::new(
        PipelineConfig {
            bot_handle: config.bot_handle.clone(),
            system_prompt: config.system_prompt.clone(),
            retry_attempts: config.retry_attempts,
            retry_delay: config.retry_delay,
        },
        ConversationMemory::new(config.max_context_messages, config.group_context_messages),
        AdmissionPolicy::new(AdmissionConfig {
            min_query_chars: config.min_query_chars,
            ignore_greetings: config.ignore_greetings,
            reject_repeats: true,
        }),
        RateLimiter::new(
            config.rate_limit,
            config.spam_window_max,
            config.max_concurrent_requests,
        ),
        CredentialPool::new(
            &config.api_keys,
            config.credential_failure_threshold,
            config.credential_cooldown,
        ),
        model,
        transport.clone() as Arc<dyn ChatTransport>,
        QuickReplies::from_entropy(),
    );

    let data = Arc::new(BotData {
        pipeline: Arc::clone(&pipeline),
        transport,
        bot_user_id,
    });

    info!("===========================================");
    info!("  seekbot - Starting...");
    info!("===========================================");
    info!("{}", config.summary());

    let handler = dptree::entry().branch(Update::filter_message().endpoint(message_handler));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![data])
        .default_handler(|upd| async move {
            debug!("Unhandled update: {:?}", upd);
        })
        .error_handler(LoggingErrorHandler::with_custom_text(
            "Error in message handler",
        ))
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    warn!("Dispatcher stopped");
    pipeline.shutdown(SHUTDOWN_TIMEOUT).await;
    Ok(())
}

async fn message_handler(msg: Message, data: Arc<BotData>) -> ResponseResult<()> {
    let Some(text) = msg.text() else {
        return Ok(());
    };

    // Skip our own echoes and other bots
    let Some(from) = msg.from.as_ref() else {
        return Ok(());
    };
    if from.is_bot || from.id.0 == data.bot_user_id {
        return Ok(());
    }

    let chat_id = msg.chat.id.0;
    data.transport.cache_reply_sender(chat_id, &msg);

    let incoming = IncomingMessage {
        message_id: msg.id.0,
        sender_id: from.id.0 as i64,
        chat_id,
        text: text.to_string(),
        sender_display_name: from.username.clone(),
        is_group: msg.chat.is_group() || msg.chat.is_supergroup(),
        reply_target_id: msg.reply_to_message().map(|m| m.id.0),
    };

    debug!(
        user_id = incoming.sender_id,
        chat_id,
        preview = %incoming.text.chars().take(50).collect::<String>(),
        "message received"
    );

    data.pipeline.handle_message(incoming).await;
    Ok(())
}
