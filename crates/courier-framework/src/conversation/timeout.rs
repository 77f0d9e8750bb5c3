//! Debounced idle timers for conversations.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use super::ConversationKey;

/// Marker placed in the context of conversation timeout handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutExpired {
    /// Name of the conversation that timed out.
    pub conversation: String,
    /// Key of the expired conversation.
    pub key: ConversationKey,
}

/// A handle to one armed timer.
#[derive(Debug, Clone)]
pub(crate) struct TimerHandle {
    pub(crate) id: u64,
    pub(crate) generation: u64,
    pub(crate) token: CancellationToken,
}

/// One armed timer per conversation key.
///
/// Arming a key cancels its previous timer. Every method is called while the
/// conversation holds the key's lock.
#[derive(Default)]
pub(crate) struct TimeoutScheduler {
    timers: DashMap<ConversationKey, TimerHandle>,
    next_id: AtomicU64,
}

impl TimeoutScheduler {
    /// Replaces the key's timer with a fresh one.
    pub(crate) fn arm(&self, key: ConversationKey, generation: u64) -> TimerHandle {
        let handle = TimerHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            generation,
            token: CancellationToken::new(),
        };
        if let Some(previous) = self.timers.insert(key, handle.clone()) {
            previous.token.cancel();
        }
        handle
    }

    /// Cancels the key's timer, if any.
    pub(crate) fn cancel(&self, key: &ConversationKey) {
        if let Some((_, timer)) = self.timers.remove(key) {
            timer.token.cancel();
        }
    }

    /// Whether `handle` is still the key's live timer.
    pub(crate) fn is_current(&self, key: &ConversationKey, handle: &TimerHandle) -> bool {
        !handle.token.is_cancelled()
            && self
                .timers
                .get(key)
                .is_some_and(|t| t.id == handle.id && t.generation == handle.generation)
    }

    /// Whether the key has an armed timer.
    pub(crate) fn contains(&self, key: &ConversationKey) -> bool {
        self.timers.contains_key(key)
    }

    /// Forgets the key's timer once it has fired, unless it was re-armed.
    pub(crate) fn finish(&self, key: &ConversationKey, handle: &TimerHandle) {
        self.timers.remove_if(key, |_, t| t.id == handle.id);
    }

    /// Cancels every timer.
    pub(crate) fn cancel_all(&self) {
        for timer in self.timers.iter() {
            timer.token.cancel();
        }
        self.timers.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.timers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rearm_cancels_previous() {
        let scheduler = TimeoutScheduler::default();
        let key = ConversationKey::new(Some(1), Some(1));

        let first = scheduler.arm(key, 1);
        let second = scheduler.arm(key, 1);
        assert!(first.token.is_cancelled());
        assert!(!scheduler.is_current(&key, &first));
        assert!(scheduler.is_current(&key, &second));

        scheduler.finish(&key, &first);
        assert_eq!(scheduler.len(), 1);
        assert!(scheduler.contains(&key));

        scheduler.cancel(&key);
        assert!(second.token.is_cancelled());
        assert!(!scheduler.contains(&key));
    }
}
