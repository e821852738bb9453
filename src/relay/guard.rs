//! Self-loop guard.
//!
//! Replies relayed back into a source chat come straight back through the
//! driver's listener path. The guard remembers the most recent relayed
//! replies in a small ring buffer and drops inbound text that matches one
//! exactly — or near-exactly, using a character-set Jaccard similarity to
//! catch the formatting drift chat apps apply to pasted text. This sits on
//! top of the driver's explicit self-authorship flag, not instead of it.

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, PoisonError};

use tracing::debug;

/// Minimum length (in chars) on both sides before the similarity check
/// applies; short strings collide too easily on character sets.
const MIN_SIMILARITY_LEN: usize = 20;

/// Ring buffer of recently relayed replies.
pub struct ReplyGuard {
    entries: Mutex<VecDeque<String>>,
    capacity: usize,
    similarity_threshold: f64,
}

impl ReplyGuard {
    /// Create a guard remembering up to `capacity` replies.
    #[must_use]
    pub fn new(capacity: usize, similarity_threshold: f64) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            similarity_threshold,
        }
    }

    /// Remember a relayed reply, evicting the oldest past capacity.
    pub fn record(&self, reply: &str) {
        let mut entries = self.lock();
        entries.push_back(reply.trim().to_owned());
        while entries.len() > self.capacity {
            entries.pop_front();
        }
        debug!(recorded = entries.len(), "relay reply recorded");
    }

    /// Whether `content` matches a recently relayed reply.
    #[must_use]
    pub fn is_recent_reply(&self, content: &str) -> bool {
        let trimmed = content.trim();
        let entries = self.lock();

        if entries.iter().any(|entry| entry == trimmed) {
            return true;
        }

        if trimmed.chars().count() <= MIN_SIMILARITY_LEN {
            return false;
        }
        entries.iter().any(|entry| {
            entry.chars().count() > MIN_SIMILARITY_LEN
                && jaccard_chars(trimmed, entry) > self.similarity_threshold
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<String>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Jaccard similarity over the character sets of two strings.
fn jaccard_chars(a: &str, b: &str) -> f64 {
    let set_a: HashSet<char> = a.chars().collect();
    let set_b: HashSet<char> = b.chars().collect();
    let union = set_a.union(&set_b).count();
    if union == 0 {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    #[allow(clippy::cast_precision_loss)] // Character-set sizes are tiny.
    {
        intersection as f64 / union as f64
    }
}
