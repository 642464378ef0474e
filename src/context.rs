//! Conversation Memory
//!
//! Bounded rolling message history per user and per group chat, combined
//! into a short transcript fed to the model as advisory context. Everything
//! is in-memory; nothing survives a restart.

use chrono::Local;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// Per-record cap so one giant message cannot bloat the prompt
const MAX_RECORD_CHARS: usize = 500;

/// A single remembered message
#[derive(Debug, Clone)]
pub struct MemoryRecord {
    pub text: String,
    pub display_name: Option<String>,
    /// Wall-clock label ("HH:MM"), display only
    pub time_label: String,
}

impl MemoryRecord {
    fn new(text: &str, display_name: Option<&str>) -> Self {
        Self {
            text: truncate_chars(text, MAX_RECORD_CHARS),
            display_name: display_name.map(|s| s.to_string()),
            time_label: Local::now().format("%H:%M").to_string(),
        }
    }

    fn sender_label(&self, user_id: i64) -> String {
        match &self.display_name {
            Some(name) => format!("@{}", name),
            None => format!("User_{}", user_id),
        }
    }
}

struct MemoryInner {
    user_history: HashMap<i64, VecDeque<MemoryRecord>>,
    group_history: HashMap<i64, VecDeque<(i64, MemoryRecord)>>,
}

/// Rolling per-user and per-group message history
pub struct ConversationMemory {
    inner: Mutex<MemoryInner>,
    max_user_messages: usize,
    max_group_messages: usize,
}

impl ConversationMemory {
    pub fn new(max_user_messages: usize, max_group_messages: usize) -> Self {
        Self {
            inner: Mutex::new(MemoryInner {
                user_history: HashMap::new(),
                group_history: HashMap::new(),
            }),
            max_user_messages: max_user_messages.max(1),
            max_group_messages: max_group_messages.max(1),
        }
    }

    /// Record a message into the sender's personal history and, for group
    /// chats, into the group's shared history. Never fails; oldest entries
    /// are silently evicted once a buffer is full.
    pub fn record(
        &self,
        user_id: i64,
        chat_id: i64,
        text: &str,
        display_name: Option<&str>,
        is_group: bool,
    ) {
        let record = MemoryRecord::new(text, display_name);
        let mut inner = self.inner.lock();

        let personal = inner.user_history.entry(user_id).or_default();
        if personal.len() >= self.max_user_messages {
            personal.pop_front();
        }
        personal.push_back(record.clone());
        debug!(user_id, len = personal.len(), "recorded personal message");

        if is_group {
            let group = inner.group_history.entry(chat_id).or_default();
            if group.len() >= self.max_group_messages {
                group.pop_front();
            }
            group.push_back((user_id, record));
        }
    }

    /// Short human-readable transcript: recent group conversation (if any)
    /// followed by the sender's recent messages. Empty string when nothing
    /// is stored. Advisory only, never blocks a response.
    pub fn context_for(&self, user_id: i64, chat_id: i64) -> String {
        let inner = self.inner.lock();
        let mut out = String::new();

        if let Some(group) = inner.group_history.get(&chat_id) {
            if !group.is_empty() {
                out.push_str("Recent group conversation:\n");
                for (sender_id, rec) in group.iter() {
                    out.push_str(&format!(
                        "- [{}] {}: {}\n",
                        rec.time_label,
                        rec.sender_label(*sender_id),
                        rec.text
                    ));
                }
            }
        }

        if let Some(personal) = inner.user_history.get(&user_id) {
            if !personal.is_empty() {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str("User's recent messages:\n");
                for rec in personal.iter() {
                    out.push_str(&format!("- [{}] {}\n", rec.time_label, rec.text));
                }
            }
        }

        out.trim_end().to_string()
    }

    /// Number of messages currently stored for a user (test/monitoring aid)
    pub fn user_len(&self, user_id: i64) -> usize {
        self.inner
            .lock()
            .user_history
            .get(&user_id)
            .map(|h| h.len())
            .unwrap_or(0)
    }
}

/// UTF-8 safe character truncation
fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max).collect();
    out.push_str("...");
    out
}
