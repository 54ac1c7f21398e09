//! Content-addressed message cache shared by all sessions.

use std::{
    collections::{HashMap, HashSet},
    sync::{Mutex, MutexGuard, PoisonError},
};

use serde::{Deserialize, Serialize};

use crate::{Message, MessageHash, RunKind, traits::SessionId};

/// Default number of completed runs a cached message survives unsent.
pub const DEFAULT_MAX_CACHED_MESSAGE_AGE: u32 = 2;

/// Eviction policy for the message cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Entries older than this many completed runs are evicted.
    pub max_cached_message_age: u32,
    /// Whether fragment runs advance entry ages.
    pub include_fragment_runs: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_cached_message_age: DEFAULT_MAX_CACHED_MESSAGE_AGE,
            include_fragment_runs: false,
        }
    }
}

/// Cache size snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: usize,
}

struct CacheEntry {
    message: Message,
    age: u32,
    /// Sessions that have received the full payload.
    referencing_sessions: HashSet<SessionId>,
}

/// Process-wide store of previously sent messages.
///
/// Every mutation goes through one mutex: sessions produce concurrently and
/// two of them may emit content with the same hash at the same time.
/// Eviction is driven only by run completions, never by wall-clock time or by
/// an entry losing its last referencing session.
pub struct MessageCache {
    config: CacheConfig,
    entries: Mutex<HashMap<MessageHash, CacheEntry>>,
}

impl Default for MessageCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl MessageCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn config(&self) -> CacheConfig {
        self.config
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<MessageHash, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decide what to put on the wire for `msg` going to `session_id`.
    ///
    /// Returns `msg` itself unless the session already holds this exact
    /// content, in which case a reference carrying `msg`'s metadata is
    /// returned instead. Touching an entry resets its age.
    #[must_use]
    pub fn prepare_for_send(&self, session_id: SessionId, msg: Message) -> Message {
        if !msg.is_cacheable() {
            return msg;
        }

        let mut entries = self.lock();
        match entries.get_mut(msg.hash()) {
            Some(entry) => {
                entry.age = 0;
                if entry.referencing_sessions.insert(session_id) {
                    msg
                } else {
                    tracing::debug!(%session_id, hash = %msg.hash(), "sending cached reference");
                    Message::ref_hash(&msg)
                }
            }
            None => {
                entries.insert(
                    msg.hash().clone(),
                    CacheEntry {
                        message: msg.clone(),
                        age: 0,
                        referencing_sessions: HashSet::from([session_id]),
                    },
                );
                msg
            }
        }
    }

    /// Get a cached message by hash.
    #[must_use]
    pub fn get_message(&self, hash: &MessageHash) -> Option<Message> {
        self.lock().get(hash).map(|e| e.message.clone())
    }

    /// Whether `session_id` has been sent the full payload for `hash`.
    #[must_use]
    pub fn has_message_reference(&self, hash: &MessageHash, session_id: SessionId) -> bool {
        self.lock()
            .get(hash)
            .is_some_and(|e| e.referencing_sessions.contains(&session_id))
    }

    /// Record a run completion and evict expired entries.
    ///
    /// Returns the number of evicted entries.
    pub fn advance_run(&self, kind: RunKind) -> usize {
        let counts = match kind {
            RunKind::Full => true,
            RunKind::Fragment => self.config.include_fragment_runs,
            RunKind::CompileError => false,
        };
        if !counts {
            return 0;
        }

        let max_age = self.config.max_cached_message_age;
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|hash, entry| {
            entry.age = entry.age.saturating_add(1);
            let keep = entry.age <= max_age;
            if !keep {
                tracing::debug!(%hash, age = entry.age, "evicting cached message");
            }
            keep
        });
        before - entries.len()
    }

    /// Forget that `session_id` holds any cached payload.
    pub fn drop_session_refs(&self, session_id: SessionId) {
        for entry in self.lock().values_mut() {
            entry.referencing_sessions.remove(&session_id);
        }
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.lock().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Current entry count and payload size.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let entries = self.lock();
        CacheStats {
            entries: entries.len(),
            total_bytes: entries.values().map(|e| e.message.payload_len()).sum(),
        }
    }
}
