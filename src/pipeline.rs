//! Response Pipeline
//!
//! Orchestrates one request from ingestion to reply:
//!
//! ```text
//! transport ──► record context ──► eligibility ──► admission ──► rate gates
//!                                                                   │
//!          reply ◄── retry loop over credential pool ◄── spawn ◄────┘
//! ```
//!
//! Ingestion and gating are synchronous and brief; only the model call and
//! the final reply run on a spawned task so a slow request never blocks
//! other users. Per-request bookkeeping (in-flight set, global counter) is
//! released exactly once on every exit path.

use crate::admission::AdmissionPolicy;
use crate::context::ConversationMemory;
use crate::credentials::CredentialPool;
use crate::openrouter::{CompletionRequest, ModelClient};
use crate::rate_limit::{Admission, GlobalGuard, RateLimiter};
use crate::transport::{ChatTransport, IncomingMessage, SenderKind};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Fixed apology sent when every retry attempt has failed
pub const FALLBACK_REPLY: &str =
    "I'm having trouble connecting to my AI service right now. Please try again in a moment.";

/// User-visible notices with a little variation so the bot does not sound
/// canned. The RNG is injected and seedable so tests can pin the choice set.
pub struct QuickReplies {
    rng: Mutex<StdRng>,
}

pub const BUSY_REPLIES: &[&str] = &[
    "System is busy, please try again in a moment.",
    "I'm handling a lot of requests right now, give me a second.",
    "Too much going on at once, try again shortly.",
];

impl QuickReplies {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn from_entropy() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn busy(&self) -> &'static str {
        let idx = self.rng.lock().gen_range(0..BUSY_REPLIES.len());
        BUSY_REPLIES[idx]
    }

    pub fn cooldown(&self, remaining_secs: f64) -> String {
        format!(
            "Please wait {:.1} seconds before your next request.",
            remaining_secs
        )
    }
}

/// Pipeline tuning taken from [`crate::config::Config`]
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub bot_handle: String,
    pub system_prompt: String,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
}

/// Per-message orchestrator wiring memory, admission, rate limiting,
/// credential failover and the remote model together.
pub struct ResponsePipeline {
    config: PipelineConfig,
    memory: ConversationMemory,
    admission: AdmissionPolicy,
    rate_limiter: RateLimiter,
    credentials: CredentialPool,
    model: Arc<dyn ModelClient>,
    transport: Arc<dyn ChatTransport>,
    quick_replies: QuickReplies,
    accepting: AtomicBool,
    active_requests: Mutex<HashSet<String>>,
}

impl ResponsePipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: PipelineConfig,
        memory: ConversationMemory,
        admission: AdmissionPolicy,
        rate_limiter: RateLimiter,
        credentials: CredentialPool,
        model: Arc<dyn ModelClient>,
        transport: Arc<dyn ChatTransport>,
        quick_replies: QuickReplies,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            memory,
            admission,
            rate_limiter,
            credentials,
            model,
            transport,
            quick_replies,
            accepting: AtomicBool::new(true),
            active_requests: Mutex::new(HashSet::new()),
        })
    }

    /// Entry point for every delivered message. Records context
    /// unconditionally, then decides whether this message becomes a request.
    /// Nothing here propagates an error back into the delivery loop.
    pub async fn handle_message(self: &Arc<Self>, msg: IncomingMessage) {
        if !self.accepting.load(Ordering::Acquire) {
            debug!(chat_id = msg.chat_id, "shutting down, message dropped");
            return;
        }

        // Context includes messages the bot never replies to
        self.memory.record(
            msg.sender_id,
            msg.chat_id,
            &msg.text,
            msg.sender_display_name.as_deref(),
            msg.is_group,
        );

        if !self.is_eligible(&msg).await {
            return;
        }

        let query = self.extract_query(&msg.text);

        let decision = self
            .admission
            .should_respond(&query, msg.sender_id, msg.is_group);
        if !decision.admitted {
            debug!(
                user_id = msg.sender_id,
                reason = decision.reason,
                "query not admitted"
            );
            return;
        }

        match self.rate_limiter.try_admit(msg.sender_id) {
            Admission::Admitted => {}
            Admission::CoolingDown(remaining) => {
                let notice = self.quick_replies.cooldown(remaining);
                self.transport.reply(&msg, &notice).await;
                return;
            }
            Admission::SpamLimited => {
                // Deliberately silent
                return;
            }
        }

        let Some(guard) = self.rate_limiter.try_start_global() else {
            self.transport.reply(&msg, self.quick_replies.busy()).await;
            return;
        };

        let request_key = format!("{}_{}", msg.sender_id, msg.message_id);
        self.active_requests.lock().insert(request_key.clone());
        info!(
            user_id = msg.sender_id,
            chat_id = msg.chat_id,
            in_flight = self.rate_limiter.in_flight(),
            "processing query"
        );

        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            pipeline.run_request(&msg, &query, guard).await;
            pipeline.active_requests.lock().remove(&request_key);
        });
    }

    /// Direct chats always proceed; group chats need a mention of the bot's
    /// handle or a reply to one of the bot's own messages.
    async fn is_eligible(&self, msg: &IncomingMessage) -> bool {
        if !msg.is_group {
            return true;
        }
        if self.is_mentioned(&msg.text) {
            return true;
        }
        if let Some(target_id) = msg.reply_target_id {
            // Resolution failure counts as "not a reply to the bot"
            return self
                .transport
                .resolve_reply_sender(msg.chat_id, target_id)
                .await
                == SenderKind::Bot;
        }
        false
    }

    fn is_mentioned(&self, text: &str) -> bool {
        is_mentioned(&self.config.bot_handle, text)
    }

    fn extract_query(&self, text: &str) -> String {
        extract_query(&self.config.bot_handle, text)
    }

    /// The long-running half: typing indicator, context assembly, the retry
    /// loop over the credential pool, and the final reply. The global slot
    /// is held in `_guard` and released on every path when it drops.
    async fn run_request(&self, msg: &IncomingMessage, query: &str, _guard: GlobalGuard) {
        self.transport.send_typing(msg.chat_id).await;

        let context = self.memory.context_for(msg.sender_id, msg.chat_id);
        let request = CompletionRequest {
            system_prompt: self.config.system_prompt.clone(),
            context,
            query: query.to_string(),
        };

        let reply_text = self.dispatch_with_retry(&request, msg.sender_id).await;
        // A delivery failure after a successful model call is logged by the
        // transport and not retried
        self.transport.reply(msg, &reply_text).await;

        info!(user_id = msg.sender_id, chat_id = msg.chat_id, "response sent");
    }

    /// Up to `retry_attempts` calls, each with the pool's current credential.
    /// Failures rotate the pool and pause briefly; exhaustion yields the
    /// fixed fallback string instead of an error.
    async fn dispatch_with_retry(&self, request: &CompletionRequest, user_id: i64) -> String {
        for attempt in 1..=self.config.retry_attempts {
            let credential = self.credentials.current();
            match self.model.complete(request, &credential).await {
                Ok(text) => {
                    self.credentials.report_success(&credential);
                    return text;
                }
                Err(e) => {
                    warn!(user_id, attempt, error = %e, "model call failed");
                    self.credentials.report_failure(&credential, &e.to_string());
                    if attempt < self.config.retry_attempts {
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
            }
        }

        warn!(user_id, attempts = self.config.retry_attempts, "all retry attempts failed");
        FALLBACK_REPLY.to_string()
    }

    /// Number of requests currently being processed
    pub fn active_count(&self) -> usize {
        self.active_requests.lock().len()
    }

    /// Credential pool health snapshot
    pub fn credential_stats(&self) -> crate::credentials::PoolStats {
        self.credentials.stats()
    }

    /// Stop admitting new requests, then wait up to `timeout` for in-flight
    /// ones to drain. Requests still outstanding afterwards are abandoned.
    pub async fn shutdown(&self, timeout: Duration) {
        self.accepting.store(false, Ordering::Release);
        info!("shutdown requested, draining in-flight requests");

        let deadline = Instant::now() + timeout;
        while self.active_count() > 0 && Instant::now() < deadline {
            debug!(active = self.active_count(), "waiting for active requests");
            tokio::time::sleep(Duration::from_millis(250)).await;
        }

        let leftover = self.active_count();
        if leftover > 0 {
            warn!(leftover, "drain timeout reached, abandoning requests");
        }

        let stats = self.credentials.stats();
        info!(
            total = stats.total_keys,
            active = stats.active_keys,
            failed = stats.failed_keys,
            uses = stats.total_uses,
            "final credential statistics"
        );
    }
}

/// Case-insensitive containment of the bot handle
fn is_mentioned(handle: &str, text: &str) -> bool {
    text.to_lowercase().contains(&handle.to_lowercase())
}

/// Strip the bot handle (with or without '@', any case, adjacent
/// punctuation included) and collapse whitespace.
fn extract_query(handle: &str, text: &str) -> String {
    let handle = handle.to_lowercase();
    let mut out = String::with_capacity(text.len());
    for word in text.split_whitespace() {
        let bare = word
            .trim_start_matches('@')
            .trim_end_matches(|c: char| c.is_ascii_punctuation());
        if bare.to_lowercase() == handle {
            continue;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quick_replies_draw_from_fixed_set() {
        let replies = QuickReplies::new(7);
        for _ in 0..20 {
            assert!(BUSY_REPLIES.contains(&replies.busy()));
        }
    }

    #[test]
    fn test_quick_replies_deterministic_with_same_seed() {
        let a = QuickReplies::new(42);
        let b = QuickReplies::new(42);
        let seq_a: Vec<&str> = (0..10).map(|_| a.busy()).collect();
        let seq_b: Vec<&str> = (0..10).map(|_| b.busy()).collect();
        assert_eq!(seq_a, seq_b);
    }

    #[test]
    fn test_cooldown_notice_includes_remaining_time() {
        let replies = QuickReplies::new(0);
        let notice = replies.cooldown(1.54);
        assert!(notice.contains("1.5 seconds"));
    }

    #[test]
    fn test_extract_query_strips_mention() {
        // Scenario B: "@BotName help" in a group yields "help"
        assert_eq!(extract_query("MrxSeek", "@MrxSeek help"), "help");
        assert_eq!(
            extract_query("MrxSeek", "mrxseek   what   time is it"),
            "what time is it"
        );
        assert_eq!(
            extract_query("MrxSeek", "no mention at all"),
            "no mention at all"
        );
    }

    #[test]
    fn test_extract_query_strips_mention_with_adjacent_punctuation() {
        assert_eq!(extract_query("MrxSeek", "@MrxSeek, help"), "help");
        assert_eq!(extract_query("MrxSeek", "@MrxSeek: what's up?"), "what's up?");
        assert_eq!(extract_query("MrxSeek", "thanks @mrxseek!"), "thanks");
    }

    #[test]
    fn test_mention_detection_case_insensitive() {
        assert!(is_mentioned("MrxSeek", "hey @mrxseek what's up"));
        assert!(is_mentioned("MrxSeek", "MRXSEEK help"));
        assert!(!is_mentioned("MrxSeek", "nothing relevant"));
    }
}
