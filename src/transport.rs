//! Chat Transport Interface
//!
//! The chat platform is an opaque collaborator: it delivers incoming
//! messages and accepts replies. The pipeline only sees this trait, so
//! tests can swap the platform out entirely.

use async_trait::async_trait;

/// One message delivered by the platform
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Platform message id, unique within the chat
    pub message_id: i32,
    pub sender_id: i64,
    pub chat_id: i64,
    pub text: String,
    pub sender_display_name: Option<String>,
    pub is_group: bool,
    /// Message id this one replies to, if any
    pub reply_target_id: Option<i32>,
}

/// Resolved identity of a message sender.
///
/// Resolution failure is an explicit variant, not an error to catch: an
/// unknown sender is treated conservatively by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderKind {
    /// The bot itself, or any other bot account
    Bot,
    /// A human account, with an optional public handle
    Human { handle: Option<String> },
    /// Could not be resolved (deleted account, network error)
    Unknown,
}

/// Platform operations the pipeline consumes.
///
/// `reply` and `send_typing` are fire-and-forget from the pipeline's
/// perspective; their errors are logged by the implementation and never
/// retried.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Identity of the sender of the message a given message replies to.
    /// Implementations return [`SenderKind::Unknown`] instead of erroring
    /// when the target cannot be resolved.
    async fn resolve_reply_sender(&self, chat_id: i64, reply_target_id: i32) -> SenderKind;

    /// Send `text` as a reply to the given message. Delivery failure is
    /// logged and swallowed.
    async fn reply(&self, msg: &IncomingMessage, text: &str);

    /// Best-effort typing indicator; failures ignored.
    async fn send_typing(&self, chat_id: i64);
}
