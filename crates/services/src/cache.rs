use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};

use progress_core::model::{LessonProgress, ModuleId, ModuleProgress, UserId};

/// A user's progress within one module, as read in one pass.
#[derive(Debug, Clone)]
pub struct ModuleSnapshot {
    pub module: ModuleProgress,
    pub lessons: Vec<LessonProgress>,
}

struct CacheEntry {
    stored_at: DateTime<Utc>,
    snapshot: ModuleSnapshot,
}

/// Short-lived memoization of aggregate progress reads, keyed by user.
///
/// Never the source of truth: a miss or an expired entry falls through
/// to storage with identical results. Every write path invalidates the
/// writing user's entries before returning, so a read within the same
/// request chain cannot observe data older than its own write; the TTL
/// only bounds staleness across users of the same record.
pub struct ProgressCache {
    ttl: Duration,
    entries: Mutex<HashMap<UserId, HashMap<ModuleId, CacheEntry>>>,
}

impl ProgressCache {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Default short TTL suitable for the per-navigation read pattern.
    #[must_use]
    pub fn with_default_ttl() -> Self {
        Self::new(Duration::seconds(30))
    }

    /// Fetch a live snapshot, if one is cached and within its TTL.
    #[must_use]
    pub fn get(&self, user_id: UserId, module_id: ModuleId, now: DateTime<Utc>) -> Option<ModuleSnapshot> {
        let guard = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let entry = guard.get(&user_id)?.get(&module_id)?;
        if now - entry.stored_at >= self.ttl {
            return None;
        }
        Some(entry.snapshot.clone())
    }

    /// Store a snapshot for the (user, module) pair.
    pub fn put(
        &self,
        user_id: UserId,
        module_id: ModuleId,
        snapshot: ModuleSnapshot,
        now: DateTime<Utc>,
    ) {
        let mut guard = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        guard.entry(user_id).or_default().insert(
            module_id,
            CacheEntry {
                stored_at: now,
                snapshot,
            },
        );
    }

    /// Drop every cached entry for a user. Called by each write path
    /// before it reports success.
    pub fn invalidate(&self, user_id: UserId) {
        let mut guard = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        guard.remove(&user_id);
    }
}
