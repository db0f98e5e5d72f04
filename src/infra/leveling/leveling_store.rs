// Storage backends for the leveling system.
//
// `LevelingStore` picks one at startup (`LEVELING_STORE=sqlite|memory`) and
// forwards every port call to it, so the Discord layer can name one concrete
// store type.

pub mod in_memory;
pub mod sqlite_store;

pub use in_memory::InMemoryXpStore;
pub use sqlite_store::SqliteXpStore;

use crate::core::leveling::{
    GuildLevelStats, LevelRoleIndex, LevelingError, UserLevelRecord, XpStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub enum LevelingStore {
    Sqlite(SqliteXpStore),
    Memory(InMemoryXpStore),
}

impl LevelingStore {
    /// `kind` is `"sqlite"` (default) or `"memory"`.
    pub async fn open(kind: &str, database_path: &str) -> anyhow::Result<Self> {
        match kind.trim().to_ascii_lowercase().as_str() {
            "" | "sqlite" => Ok(Self::Sqlite(SqliteXpStore::new(database_path).await?)),
            "memory" => {
                tracing::warn!("Using in-memory leveling store; XP is lost on restart");
                Ok(Self::Memory(InMemoryXpStore::new()))
            }
            other => anyhow::bail!("unknown LEVELING_STORE '{other}', expected sqlite or memory"),
        }
    }

    fn xp(&self) -> &dyn XpStore {
        match self {
            Self::Sqlite(store) => store,
            Self::Memory(store) => store,
        }
    }

    fn roles(&self) -> &dyn LevelRoleIndex {
        match self {
            Self::Sqlite(store) => store,
            Self::Memory(store) => store,
        }
    }
}

#[async_trait]
impl XpStore for LevelingStore {
    async fn get_record(
        &self,
        user_id: u64,
        guild_id: u64,
    ) -> Result<Option<UserLevelRecord>, LevelingError> {
        self.xp().get_record(user_id, guild_id).await
    }

    async fn get_or_create_record(
        &self,
        user_id: u64,
        guild_id: u64,
        now: DateTime<Utc>,
    ) -> Result<UserLevelRecord, LevelingError> {
        self.xp().get_or_create_record(user_id, guild_id, now).await
    }

    async fn increment_xp(
        &self,
        user_id: u64,
        guild_id: u64,
        amount: u64,
        now: DateTime<Utc>,
        cooldown_cutoff: Option<DateTime<Utc>>,
    ) -> Result<Option<UserLevelRecord>, LevelingError> {
        self.xp()
            .increment_xp(user_id, guild_id, amount, now, cooldown_cutoff)
            .await
    }

    async fn set_level(
        &self,
        user_id: u64,
        guild_id: u64,
        level: u32,
    ) -> Result<(), LevelingError> {
        self.xp().set_level(user_id, guild_id, level).await
    }

    async fn set_progress(
        &self,
        user_id: u64,
        guild_id: u64,
        xp: u64,
        level: u32,
        message_count: Option<u64>,
    ) -> Result<Option<UserLevelRecord>, LevelingError> {
        self.xp()
            .set_progress(user_id, guild_id, xp, level, message_count)
            .await
    }

    async fn adjust_xp(
        &self,
        user_id: u64,
        guild_id: u64,
        delta: i64,
    ) -> Result<Option<(UserLevelRecord, i64)>, LevelingError> {
        self.xp().adjust_xp(user_id, guild_id, delta).await
    }

    async fn list_records(&self, guild_id: u64) -> Result<Vec<UserLevelRecord>, LevelingError> {
        self.xp().list_records(guild_id).await
    }

    async fn top_by_xp(
        &self,
        guild_id: u64,
        limit: usize,
    ) -> Result<Vec<UserLevelRecord>, LevelingError> {
        self.xp().top_by_xp(guild_id, limit).await
    }

    async fn count_with_xp_above(&self, guild_id: u64, xp: u64) -> Result<u64, LevelingError> {
        self.xp().count_with_xp_above(guild_id, xp).await
    }

    async fn aggregate(&self, guild_id: u64) -> Result<Option<GuildLevelStats>, LevelingError> {
        self.xp().aggregate(guild_id).await
    }
}

#[async_trait]
impl LevelRoleIndex for LevelingStore {
    async fn get_level_role(
        &self,
        guild_id: u64,
        level: u32,
    ) -> Result<Option<u64>, LevelingError> {
        self.roles().get_level_role(guild_id, level).await
    }

    async fn set_level_role(
        &self,
        guild_id: u64,
        level: u32,
        role_id: u64,
    ) -> Result<(), LevelingError> {
        self.roles().set_level_role(guild_id, level, role_id).await
    }

    async fn clear_level_role(&self, guild_id: u64, level: u32) -> Result<(), LevelingError> {
        self.roles().clear_level_role(guild_id, level).await
    }

    async fn level_roles(&self, guild_id: u64) -> Result<Vec<(u32, u64)>, LevelingError> {
        self.roles().level_roles(guild_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_picks_the_backend() {
        let memory = LevelingStore::open("memory", "unused.db").await.unwrap();
        assert!(matches!(memory, LevelingStore::Memory(_)));

        let sqlite = LevelingStore::open("SQLite", "sqlite::memory:").await.unwrap();
        assert!(matches!(sqlite, LevelingStore::Sqlite(_)));

        assert!(LevelingStore::open("redis", "x").await.is_err());
    }

    #[tokio::test]
    async fn calls_reach_the_selected_backend() {
        let store = LevelingStore::open("memory", "unused.db").await.unwrap();
        store.increment_xp(1, 2, 30, Utc::now(), None).await.unwrap();
        store.set_level_role(2, 1, 55).await.unwrap();

        assert_eq!(store.get_record(1, 2).await.unwrap().unwrap().xp, 30);
        assert_eq!(store.level_roles(2).await.unwrap(), vec![(1, 55)]);
    }
}
