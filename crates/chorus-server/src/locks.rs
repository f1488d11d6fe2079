use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Coordination primitive arbitrating which peer may act on a guild.
/// The in-memory table is authoritative while every peer shares one
/// process; a store-backed implementation can replace it without
/// touching the router.
pub trait GuildLocks: Send + Sync {
    /// Atomic check-and-set. Succeeds when the guild is unclaimed, the
    /// existing claim has expired, or the caller already owns it.
    /// Failure means another peer is handling this guild right now;
    /// there is no waiting and no queueing.
    fn acquire(&self, guild_id: &str, peer_id: &str) -> bool;

    /// Removes the claim only when the caller still owns it. A peer
    /// whose claim expired and was taken over must not evict the new
    /// owner.
    fn release(&self, guild_id: &str, peer_id: &str);

    /// Ownership check; deletes an expired entry when it sees one.
    fn has_lock(&self, guild_id: &str, peer_id: &str) -> bool;

    /// True when a live claim exists that belongs to a different peer.
    fn held_by_other(&self, guild_id: &str, peer_id: &str) -> bool;
}

#[derive(Debug)]
struct LockEntry {
    owner: String,
    acquired_at: Instant,
}

pub struct MemoryLockTable {
    timeout: Duration,
    entries: Mutex<HashMap<String, LockEntry>>,
}

impl MemoryLockTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, LockEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn expired(&self, entry: &LockEntry) -> bool {
        entry.acquired_at.elapsed() > self.timeout
    }
}

impl GuildLocks for MemoryLockTable {
    fn acquire(&self, guild_id: &str, peer_id: &str) -> bool {
        let mut entries = self.entries();
        match entries.get(guild_id) {
            Some(entry) if !self.expired(entry) && entry.owner != peer_id => false,
            _ => {
                entries.insert(
                    guild_id.to_string(),
                    LockEntry {
                        owner: peer_id.to_string(),
                        acquired_at: Instant::now(),
                    },
                );
                true
            }
        }
    }

    fn release(&self, guild_id: &str, peer_id: &str) {
        let mut entries = self.entries();
        if entries
            .get(guild_id)
            .is_some_and(|entry| entry.owner == peer_id)
        {
            entries.remove(guild_id);
        }
    }

    fn has_lock(&self, guild_id: &str, peer_id: &str) -> bool {
        let mut entries = self.entries();
        match entries.get(guild_id) {
            Some(entry) if self.expired(entry) => {
                entries.remove(guild_id);
                false
            }
            Some(entry) => entry.owner == peer_id,
            None => false,
        }
    }

    fn held_by_other(&self, guild_id: &str, peer_id: &str) -> bool {
        let mut entries = self.entries();
        match entries.get(guild_id) {
            Some(entry) if self.expired(entry) => {
                entries.remove(guild_id);
                false
            }
            Some(entry) => entry.owner != peer_id,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn acquire_is_exclusive_and_idempotent() {
        let table = MemoryLockTable::new(Duration::from_secs(10));
        assert!(table.acquire("guild1", "a"));
        assert!(table.acquire("guild1", "a"));
        assert!(!table.acquire("guild1", "b"));
        assert!(table.has_lock("guild1", "a"));
        assert!(!table.has_lock("guild1", "b"));
        assert!(table.held_by_other("guild1", "b"));
        assert!(!table.held_by_other("guild1", "a"));
    }

    #[test]
    fn expired_claim_can_be_taken_and_stale_release_is_noop() {
        let table = MemoryLockTable::new(Duration::from_millis(20));
        assert!(table.acquire("guild1", "a"));
        assert!(!table.acquire("guild1", "b"));
        std::thread::sleep(Duration::from_millis(40));
        assert!(table.acquire("guild1", "b"));
        // a's claim is long gone; releasing must not evict b.
        table.release("guild1", "a");
        assert!(table.has_lock("guild1", "b"));
    }

    #[test]
    fn has_lock_lazily_deletes_expired_entries() {
        let table = MemoryLockTable::new(Duration::from_millis(10));
        assert!(table.acquire("guild1", "a"));
        std::thread::sleep(Duration::from_millis(25));
        assert!(!table.has_lock("guild1", "a"));
        assert!(table.entries().is_empty());
    }

    #[test]
    fn release_only_removes_own_claim() {
        let table = MemoryLockTable::new(Duration::from_secs(10));
        assert!(table.acquire("guild1", "a"));
        table.release("guild1", "b");
        assert!(table.has_lock("guild1", "a"));
        table.release("guild1", "a");
        assert!(!table.has_lock("guild1", "a"));
        assert!(table.acquire("guild1", "b"));
    }

    #[test]
    fn concurrent_acquires_admit_exactly_one_winner() {
        let table = Arc::new(MemoryLockTable::new(Duration::from_secs(10)));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || table.acquire("guild1", &format!("peer-{i}")))
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join())
            .filter(|r| matches!(r, Ok(true)))
            .count();
        assert_eq!(wins, 1);
    }
}
