//! Admission Policy
//!
//! Decides whether a message is worth a paid model call. This is a cost
//! gate, not a correctness gate: under-triggering is preferred to wasting a
//! call, so every rule here errs toward rejection of trivial input.
//!
//! The ladder is evaluated in order, first match wins:
//! 1. too short
//! 2. matches an ignore pattern (pure noise)
//! 3. repeats the user's previous admitted query
//! 4. spam-shaped (low character diversity or punctuation-heavy)
//! 5. otherwise admitted

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::{HashMap, HashSet, VecDeque};

/// Previous admitted queries remembered per user for the repetition check
const REPETITION_BUFFER: usize = 5;

static NOISE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        // All symbols/punctuation
        Regex::new(r"^[\p{P}\p{S}\s]+$").unwrap(),
        // All digits
        Regex::new(r"^\d+$").unwrap(),
        // One punctuation mark repeated ("???", "!!!!")
        Regex::new(r"^(.)\1{2,}$").unwrap(),
    ]
});

static GREETING_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(hi|hey|hello|yo|sup|ok|okay|thanks|thx)[!.?\s]*$").unwrap());

/// Why a query was admitted or rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub admitted: bool,
    pub reason: &'static str,
}

impl Decision {
    fn admit() -> Self {
        Self {
            admitted: true,
            reason: "Valid query",
        }
    }

    fn reject(reason: &'static str) -> Self {
        Self {
            admitted: false,
            reason,
        }
    }
}

/// Tuning knobs for the ladder
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Minimum trimmed length; 0 means any non-empty text qualifies
    pub min_query_chars: usize,
    /// Reject bare greetings and 1-2 letter tokens
    pub ignore_greetings: bool,
    /// Reject a query identical (case-insensitive) to the user's previous
    /// admitted one
    pub reject_repeats: bool,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            min_query_chars: 2,
            ignore_greetings: false,
            reject_repeats: true,
        }
    }
}

/// Deterministic message-admission gate with per-user repetition tracking
pub struct AdmissionPolicy {
    config: AdmissionConfig,
    recent: Mutex<HashMap<i64, VecDeque<String>>>,
}

impl AdmissionPolicy {
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            config,
            recent: Mutex::new(HashMap::new()),
        }
    }

    /// Run the ladder. On acceptance the query is recorded into the user's
    /// repetition buffer; rejections leave state untouched.
    pub fn should_respond(&self, query: &str, user_id: i64, _is_group: bool) -> Decision {
        let trimmed = query.trim();

        if trimmed.is_empty() || trimmed.chars().count() < self.config.min_query_chars {
            return Decision::reject("Query too short");
        }

        if NOISE_PATTERNS.iter().any(|p| p.is_match(trimmed)) {
            return Decision::reject("Noise pattern");
        }

        if self.config.ignore_greetings
            && (trimmed.chars().count() <= 2 || GREETING_PATTERN.is_match(trimmed))
        {
            return Decision::reject("Greeting or filler");
        }

        let lowered = trimmed.to_lowercase();

        if self.config.reject_repeats {
            let recent = self.recent.lock();
            if let Some(buf) = recent.get(&user_id) {
                if buf.back().map(|last| last == &lowered).unwrap_or(false) {
                    return Decision::reject("Repeated query");
                }
            }
        }

        if is_spam_shaped(trimmed) {
            return Decision::reject("Spam-like content");
        }

        let mut recent = self.recent.lock();
        let buf = recent.entry(user_id).or_default();
        if buf.len() >= REPETITION_BUFFER {
            buf.pop_front();
        }
        buf.push_back(lowered);

        Decision::admit()
    }
}

/// Excessive repetition of a small alphabet, or punctuation making up more
/// than half the text.
fn is_spam_shaped(text: &str) -> bool {
    let len = text.chars().count();
    if len == 0 {
        return true;
    }

    let distinct: HashSet<char> = text.chars().collect();
    if distinct.len() * 3 < len {
        return true;
    }

    let punct = text
        .chars()
        .filter(|c| c.is_ascii_punctuation() || *c == '…')
        .count();
    punct * 2 > len
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> AdmissionPolicy {
        AdmissionPolicy::new(AdmissionConfig::default())
    }

    #[test]
    fn test_valid_query_admitted() {
        let p = policy();
        let d = p.should_respond("what is the capital of France?", 1, true);
        assert!(d.admitted);
        assert_eq!(d.reason, "Valid query");
    }

    #[test]
    fn test_short_query_rejected() {
        let p = policy();
        assert!(!p.should_respond("x", 1, false).admitted);
        assert!(!p.should_respond("   ", 1, false).admitted);
        assert!(!p.should_respond("", 1, false).admitted);
    }

    #[test]
    fn test_min_length_one_admits_hi() {
        // Scenario A: lenient variant, "hi" in a direct chat is admitted
        let p = AdmissionPolicy::new(AdmissionConfig {
            min_query_chars: 1,
            ignore_greetings: false,
            reject_repeats: true,
        });
        let d = p.should_respond("hi", 1, false);
        assert!(d.admitted);
        assert_eq!(d.reason, "Valid query");
    }

    #[test]
    fn test_noise_patterns_rejected() {
        let p = policy();
        assert_eq!(p.should_respond("???", 1, false).reason, "Noise pattern");
        assert_eq!(p.should_respond("12345", 1, false).reason, "Noise pattern");
        assert_eq!(p.should_respond("!!! ...", 1, false).reason, "Noise pattern");
        assert_eq!(p.should_respond("aaaaa", 1, false).reason, "Noise pattern");
    }

    #[test]
    fn test_greeting_rejected_when_enabled() {
        let p = AdmissionPolicy::new(AdmissionConfig {
            min_query_chars: 1,
            ignore_greetings: true,
            reject_repeats: true,
        });
        assert!(!p.should_respond("hello", 1, false).admitted);
        assert!(!p.should_respond("ok", 1, false).admitted);
        assert!(p.should_respond("hello, can you explain lifetimes", 1, false).admitted);
    }

    #[test]
    fn test_repeated_query_rejected() {
        let p = policy();
        assert!(p.should_respond("tell me a joke", 1, false).admitted);
        let d = p.should_respond("TELL ME A JOKE", 1, false);
        assert!(!d.admitted);
        assert_eq!(d.reason, "Repeated query");

        // A different query in between clears the way
        assert!(p.should_respond("what about puns", 1, false).admitted);
        assert!(p.should_respond("tell me a joke", 1, false).admitted);
    }

    #[test]
    fn test_repetition_tracked_per_user() {
        let p = policy();
        assert!(p.should_respond("same question", 1, false).admitted);
        assert!(p.should_respond("same question", 2, false).admitted);
    }

    #[test]
    fn test_spam_shaped_rejected() {
        let p = policy();
        // Low diversity: few distinct chars across a long string
        let d = p.should_respond("ababababababababababab", 1, false);
        assert_eq!(d.reason, "Spam-like content");
        // Punctuation-heavy
        let d = p.should_respond("w!?!?!?!?!?!", 1, false);
        assert_eq!(d.reason, "Spam-like content");
    }

    #[test]
    fn test_rejection_does_not_update_repetition_buffer() {
        let p = policy();
        assert!(p.should_respond("real question here", 1, false).admitted);
        // Rejected noise in between
        assert!(!p.should_respond("???", 1, false).admitted);
        // Still counts as a repeat of the last *admitted* query
        assert!(!p.should_respond("real question here", 1, false).admitted);
    }

    #[test]
    fn test_decision_is_deterministic() {
        let p = policy();
        let a = p.should_respond("???", 7, true);
        let b = p.should_respond("???", 7, true);
        assert_eq!(a, b);
    }
}
