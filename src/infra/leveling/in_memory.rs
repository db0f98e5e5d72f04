// In-memory implementation of the leveling ports.
//
// Used by the tests and by `LEVELING_STORE=memory` for throwaway runs. All
// mutations go through DashMap's entry API, which holds the shard lock for
// the duration of the closure, so each trait call is atomic per key.

use crate::core::leveling::{
    GuildLevelStats, LevelRoleIndex, LevelingError, UserLevelRecord, XpStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Users can be in several guilds, so records are keyed by both ids.
#[derive(Hash, Eq, PartialEq, Clone, Copy, Debug)]
struct UserGuildKey {
    user_id: u64,
    guild_id: u64,
}

impl UserGuildKey {
    fn new(user_id: u64, guild_id: u64) -> Self {
        Self { user_id, guild_id }
    }
}

pub struct InMemoryXpStore {
    records: DashMap<UserGuildKey, UserLevelRecord>,
    /// (guild_id, level) -> role_id
    level_roles: DashMap<(u64, u32), u64>,
}

impl InMemoryXpStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            level_roles: DashMap::new(),
        }
    }

    fn guild_records(&self, guild_id: u64) -> Vec<UserLevelRecord> {
        self.records
            .iter()
            .filter(|entry| entry.key().guild_id == guild_id)
            .map(|entry| entry.value().clone())
            .collect()
    }
}

impl Default for InMemoryXpStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl XpStore for InMemoryXpStore {
    async fn get_record(
        &self,
        user_id: u64,
        guild_id: u64,
    ) -> Result<Option<UserLevelRecord>, LevelingError> {
        let key = UserGuildKey::new(user_id, guild_id);
        Ok(self.records.get(&key).map(|entry| entry.value().clone()))
    }

    async fn get_or_create_record(
        &self,
        user_id: u64,
        guild_id: u64,
        now: DateTime<Utc>,
    ) -> Result<UserLevelRecord, LevelingError> {
        let key = UserGuildKey::new(user_id, guild_id);
        let entry = self
            .records
            .entry(key)
            .or_insert_with(|| UserLevelRecord::new(user_id, guild_id, now));
        Ok(entry.value().clone())
    }

    async fn increment_xp(
        &self,
        user_id: u64,
        guild_id: u64,
        amount: u64,
        now: DateTime<Utc>,
        cooldown_cutoff: Option<DateTime<Utc>>,
    ) -> Result<Option<UserLevelRecord>, LevelingError> {
        let key = UserGuildKey::new(user_id, guild_id);
        match self.records.entry(key) {
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                let blocked = matches!(
                    (record.last_xp_gain, cooldown_cutoff),
                    (Some(last), Some(cutoff)) if last > cutoff
                );
                if blocked {
                    return Ok(None);
                }
                record.xp = record.xp.saturating_add(amount);
                record.message_count = record.message_count.saturating_add(1);
                record.last_xp_gain = Some(now);
                Ok(Some(record.clone()))
            }
            Entry::Vacant(vacant) => {
                let mut record = UserLevelRecord::new(user_id, guild_id, now);
                record.xp = amount;
                record.message_count = 1;
                record.last_xp_gain = Some(now);
                Ok(Some(vacant.insert(record).value().clone()))
            }
        }
    }

    async fn set_level(
        &self,
        user_id: u64,
        guild_id: u64,
        level: u32,
    ) -> Result<(), LevelingError> {
        let key = UserGuildKey::new(user_id, guild_id);
        if let Some(mut record) = self.records.get_mut(&key) {
            record.level = level;
        }
        Ok(())
    }

    async fn set_progress(
        &self,
        user_id: u64,
        guild_id: u64,
        xp: u64,
        level: u32,
        message_count: Option<u64>,
    ) -> Result<Option<UserLevelRecord>, LevelingError> {
        let key = UserGuildKey::new(user_id, guild_id);
        let Some(mut record) = self.records.get_mut(&key) else {
            return Ok(None);
        };
        record.xp = xp;
        record.level = level;
        if let Some(count) = message_count {
            record.message_count = count;
        }
        Ok(Some(record.clone()))
    }

    async fn adjust_xp(
        &self,
        user_id: u64,
        guild_id: u64,
        delta: i64,
    ) -> Result<Option<(UserLevelRecord, i64)>, LevelingError> {
        let key = UserGuildKey::new(user_id, guild_id);
        let Some(mut record) = self.records.get_mut(&key) else {
            return Ok(None);
        };
        let before = record.xp;
        record.xp = if delta >= 0 {
            before.saturating_add(delta as u64)
        } else {
            before.saturating_sub(delta.unsigned_abs())
        };
        let applied = record.xp as i128 - before as i128;
        Ok(Some((record.clone(), applied as i64)))
    }

    async fn list_records(&self, guild_id: u64) -> Result<Vec<UserLevelRecord>, LevelingError> {
        Ok(self.guild_records(guild_id))
    }

    async fn top_by_xp(
        &self,
        guild_id: u64,
        limit: usize,
    ) -> Result<Vec<UserLevelRecord>, LevelingError> {
        let mut records = self.guild_records(guild_id);
        records.sort_by(|a, b| b.xp.cmp(&a.xp).then(a.user_id.cmp(&b.user_id)));
        records.truncate(limit);
        Ok(records)
    }

    async fn count_with_xp_above(&self, guild_id: u64, xp: u64) -> Result<u64, LevelingError> {
        let count = self
            .records
            .iter()
            .filter(|entry| entry.key().guild_id == guild_id && entry.value().xp > xp)
            .count();
        Ok(count as u64)
    }

    async fn aggregate(&self, guild_id: u64) -> Result<Option<GuildLevelStats>, LevelingError> {
        let records = self.guild_records(guild_id);
        if records.is_empty() {
            return Ok(None);
        }
        let total_users = records.len() as u64;
        let level_sum: u64 = records.iter().map(|r| r.level as u64).sum();
        Ok(Some(GuildLevelStats {
            total_users,
            total_xp: records.iter().fold(0u64, |acc, r| acc.saturating_add(r.xp)),
            total_messages: records
                .iter()
                .fold(0u64, |acc, r| acc.saturating_add(r.message_count)),
            average_level: level_sum as f64 / total_users as f64,
            max_level: records.iter().map(|r| r.level).max().unwrap_or(0),
        }))
    }
}

#[async_trait]
impl LevelRoleIndex for InMemoryXpStore {
    async fn get_level_role(
        &self,
        guild_id: u64,
        level: u32,
    ) -> Result<Option<u64>, LevelingError> {
        Ok(self.level_roles.get(&(guild_id, level)).map(|entry| *entry))
    }

    async fn set_level_role(
        &self,
        guild_id: u64,
        level: u32,
        role_id: u64,
    ) -> Result<(), LevelingError> {
        self.level_roles.insert((guild_id, level), role_id);
        Ok(())
    }

    async fn clear_level_role(&self, guild_id: u64, level: u32) -> Result<(), LevelingError> {
        self.level_roles.remove(&(guild_id, level));
        Ok(())
    }

    async fn level_roles(&self, guild_id: u64) -> Result<Vec<(u32, u64)>, LevelingError> {
        let mut roles: Vec<(u32, u64)> = self
            .level_roles
            .iter()
            .filter(|entry| entry.key().0 == guild_id)
            .map(|entry| (entry.key().1, *entry.value()))
            .collect();
        roles.sort_unstable();
        Ok(roles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn increment_creates_then_accumulates() {
        let store = InMemoryXpStore::new();
        let now = Utc::now();

        let first = store.increment_xp(1, 10, 40, now, None).await.unwrap().unwrap();
        assert_eq!((first.xp, first.message_count), (40, 1));

        let second = store
            .increment_xp(1, 10, 15, now + chrono::Duration::seconds(1), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!((second.xp, second.message_count), (55, 2));
        // A different guild is a different record.
        assert!(store.get_record(1, 11).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cutoff_blocks_recent_gains() {
        let store = InMemoryXpStore::new();
        let start = Utc::now();
        store.increment_xp(1, 10, 40, start, None).await.unwrap();

        let cutoff = start - chrono::Duration::seconds(1);
        let blocked = store
            .increment_xp(1, 10, 40, start + chrono::Duration::seconds(59), Some(cutoff))
            .await
            .unwrap();
        assert!(blocked.is_none());

        let record = store.get_record(1, 10).await.unwrap().unwrap();
        assert_eq!(record.xp, 40);
        assert_eq!(record.last_xp_gain, Some(start));
    }

    #[tokio::test]
    async fn adjust_clamps_and_reports_applied_delta() {
        let store = InMemoryXpStore::new();
        store.increment_xp(1, 10, 30, Utc::now(), None).await.unwrap();

        let (record, applied) = store.adjust_xp(1, 10, -100).await.unwrap().unwrap();
        assert_eq!(record.xp, 0);
        assert_eq!(applied, -30);

        assert!(store.adjust_xp(2, 10, 5).await.unwrap().is_none());
        assert!(store.get_record(2, 10).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn set_progress_never_creates() {
        let store = InMemoryXpStore::new();
        assert!(store.set_progress(1, 10, 5, 0, None).await.unwrap().is_none());
        assert!(store.get_record(1, 10).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parallel_increments_are_atomic() {
        let store = Arc::new(InMemoryXpStore::new());
        let now = Utc::now();
        let mut handles = Vec::new();
        for _ in 0..100 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.increment_xp(1, 10, 3, now, None).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let record = store.get_record(1, 10).await.unwrap().unwrap();
        assert_eq!(record.xp, 300);
        assert_eq!(record.message_count, 100);
    }

    #[tokio::test]
    async fn role_index_is_scoped_per_guild() {
        let store = InMemoryXpStore::new();
        store.set_level_role(1, 5, 500).await.unwrap();
        store.set_level_role(1, 2, 200).await.unwrap();
        store.set_level_role(2, 5, 900).await.unwrap();

        assert_eq!(store.level_roles(1).await.unwrap(), vec![(2, 200), (5, 500)]);
        assert_eq!(store.get_level_role(2, 5).await.unwrap(), Some(900));

        store.clear_level_role(1, 5).await.unwrap();
        assert_eq!(store.get_level_role(1, 5).await.unwrap(), None);
    }
}
