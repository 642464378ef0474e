//! seekbot
//!
//! Telegram group-chat LLM relay bot.
//!
//! # Features
//!
//! - **API-key failover**: rotating credential pool with failure marking,
//!   all-failed reset, and optional cool-down expiry
//! - **Conversation context**: bounded per-user and per-group rolling history
//! - **Admission policy**: deterministic noise/spam/repetition gate in front
//!   of every paid model call
//! - **Rate limiting**: per-user cooldown, 60s spam window, global
//!   concurrency cap with RAII pairing
//! - **Graceful shutdown**: in-flight requests drained with a bounded timeout
//!
//! # Architecture
//!
//! ```text
//! Telegram ──► Transport ──► ResponsePipeline ──► OpenRouter API
//!                                │
//!                                ├── ConversationMemory (user + group)
//!                                ├── AdmissionPolicy (noise/spam gate)
//!                                ├── RateLimiter (cooldown + global cap)
//!                                └── CredentialPool (rotation + failover)
//! ```

pub mod admission;
pub mod config;
pub mod context;
pub mod credentials;
pub mod openrouter;
pub mod pipeline;
pub mod rate_limit;
pub mod telegram;
pub mod transport;

pub use admission::{AdmissionConfig, AdmissionPolicy, Decision};
pub use config::{Config, ConfigError, CooldownStrategy};
pub use context::ConversationMemory;
pub use credentials::{CredentialPool, PoolStats};
pub use openrouter::{CompletionRequest, ModelClient, ModelError, OpenRouterClient};
pub use pipeline::{PipelineConfig, QuickReplies, ResponsePipeline, FALLBACK_REPLY};
pub use rate_limit::{Admission, GlobalGuard, RateLimiter};
pub use transport::{ChatTransport, IncomingMessage, SenderKind};
