//! Configuration management
//!
//! All knobs come from environment variables (`.env` supported via dotenvy).
//! Mandatory values missing at startup terminate the process before any
//! network connection is made.

use std::time::Duration;
use thiserror::Error;

/// How failed credentials become usable again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownStrategy {
    /// Failure marks persist for the process lifetime (cleared only by a
    /// success report or the all-failed reset).
    Never,
    /// A failure mark expires once this duration has elapsed, checked lazily
    /// the next time the credential is considered.
    After(Duration),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration: {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

/// Bot configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Telegram bot token
    pub telegram_token: String,

    /// Handle the bot answers to in group chats (without leading '@')
    pub bot_handle: String,

    /// OpenRouter API keys, tried in rotation on failure
    pub api_keys: Vec<String>,

    /// System prompt sent with every completion
    pub system_prompt: String,

    /// Model identifier passed to the remote endpoint
    pub model_id: String,

    /// Max messages kept per user
    pub max_context_messages: usize,

    /// Max messages kept per group chat
    pub group_context_messages: usize,

    /// Per-user cooldown between admitted requests
    pub rate_limit: Duration,

    /// Max requests a single user may issue within the trailing 60 seconds
    pub spam_window_max: u32,

    /// Minimum trimmed query length before a model call is considered
    pub min_query_chars: usize,

    /// Drop bare greetings and 1-2 letter tokens instead of answering them
    pub ignore_greetings: bool,

    /// Ceiling on concurrently processed requests
    pub max_concurrent_requests: u32,

    /// Remote call timeout
    pub api_timeout: Duration,

    /// Attempts per request before giving up (each with a fresh credential)
    pub retry_attempts: u32,

    /// Pause between failed attempts
    pub retry_delay: Duration,

    /// Max tokens requested from the model
    pub max_tokens: u32,

    /// Sampling temperature
    pub temperature: f32,

    /// Consecutive failures before a credential is marked failed
    pub credential_failure_threshold: u32,

    /// How failed credentials recover
    pub credential_cooldown: CooldownStrategy,
}

const DEFAULT_SYSTEM_PROMPT: &str = "You are MrxSeek, an intelligent and helpful AI assistant. \
You provide accurate, concise, and contextually relevant responses. You can help with programming, \
general knowledge, problem-solving, and creative tasks. Use the provided conversation context to \
give more personalized and relevant responses. Keep responses conversational and engaging while \
being informative.";

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let telegram_token = std::env::var("TELEGRAM_BOT_TOKEN")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .ok_or(ConfigError::Missing("TELEGRAM_BOT_TOKEN"))?;

        let bot_handle = std::env::var("BOT_USERNAME")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .ok_or(ConfigError::Missing("BOT_USERNAME"))?;
        // Mention matching is case-insensitive and '@'-agnostic
        let bot_handle = bot_handle.trim().trim_start_matches('@').to_string();

        let keys_raw = std::env::var("API_KEYS")
            .or_else(|_| std::env::var("API_KEY"))
            .unwrap_or_default();
        let api_keys: Vec<String> = keys_raw
            .split(',')
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        if api_keys.is_empty() {
            return Err(ConfigError::Missing("API_KEYS or API_KEY"));
        }

        let system_prompt =
            std::env::var("SYSTEM_PROMPT").unwrap_or_else(|_| DEFAULT_SYSTEM_PROMPT.to_string());

        let model_id = std::env::var("MODEL_ID")
            .unwrap_or_else(|_| "deepseek/deepseek-r1-0528:free".to_string());

        let credential_cooldown = match std::env::var("KEY_COOLDOWN_HOURS").ok() {
            None => CooldownStrategy::Never,
            Some(v) => {
                let hours: u64 = v.parse().map_err(|_| ConfigError::Invalid {
                    key: "KEY_COOLDOWN_HOURS",
                    value: v.clone(),
                })?;
                if hours == 0 {
                    CooldownStrategy::Never
                } else {
                    CooldownStrategy::After(Duration::from_secs(hours * 3600))
                }
            }
        };

        Ok(Self {
            telegram_token,
            bot_handle,
            api_keys,
            system_prompt,
            model_id,
            max_context_messages: env_parse("MAX_CONTEXT_MESSAGES", 10)?,
            group_context_messages: env_parse("GROUP_CONTEXT_MESSAGES", 5)?,
            rate_limit: Duration::from_secs(env_parse("RATE_LIMIT_SECONDS", 3u64)?),
            spam_window_max: env_parse("SPAM_WINDOW_MAX", 10)?,
            min_query_chars: env_parse("MIN_QUERY_CHARS", 2)?,
            ignore_greetings: env_parse("IGNORE_GREETINGS", false)?,
            max_concurrent_requests: env_parse("MAX_CONCURRENT_REQUESTS", 20)?,
            api_timeout: Duration::from_secs(env_parse("API_TIMEOUT", 60u64)?),
            retry_attempts: env_parse("RETRY_ATTEMPTS", 3)?,
            retry_delay: Duration::from_millis(env_parse("RETRY_DELAY_MS", 1000u64)?),
            max_tokens: env_parse("MAX_TOKENS", 2048)?,
            temperature: env_parse("TEMPERATURE", 0.7f32)?,
            credential_failure_threshold: env_parse("KEY_FAILURE_THRESHOLD", 3)?,
            credential_cooldown,
        })
    }

    /// One-line startup summary for the log
    pub fn summary(&self) -> String {
        format!(
            "handle=@{} keys={} model={} context={}u/{}g cooldown={}s concurrency={} retries={}",
            self.bot_handle,
            self.api_keys.len(),
            self.model_id,
            self.max_context_messages,
            self.group_context_messages,
            self.rate_limit.as_secs(),
            self.max_concurrent_requests,
            self.retry_attempts,
        )
    }
}

fn env_parse<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Err(_) => Ok(default),
        Ok(v) => v
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: v }),
    }
}
