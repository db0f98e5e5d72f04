// SQLite implementation of the leveling ports.
//
// Timestamps are stored as unix milliseconds. Ids and counters are stored as
// INTEGER (i64); Discord snowflakes fit comfortably.

use crate::core::leveling::{
    GuildLevelStats, LevelRoleIndex, LevelingError, UserLevelRecord, XpStore,
};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::path::Path;
use std::str::FromStr;

const RECORD_COLUMNS: &str =
    "user_id, guild_id, xp, level, message_count, last_xp_gain, created_at";

pub struct SqliteXpStore {
    pool: Pool<Sqlite>,
}

impl SqliteXpStore {
    /// Open (or create) the database at `database_url` and run migrations.
    ///
    /// Accepts a bare path, a `sqlite:` URL, or `sqlite::memory:`.
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        let in_memory = database_url.contains(":memory:");
        let conn_str = if database_url.starts_with("sqlite:") {
            database_url.to_string()
        } else {
            format!("sqlite://{}", database_url)
        };

        if !in_memory {
            let path = Path::new(conn_str.trim_start_matches("sqlite://"));
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::from_str(&conn_str)?.create_if_missing(true);
        // Every connection to `:memory:` is its own database, so keep one.
        let max_connections = if in_memory { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        tracing::info!(database = %database_url, "Leveling database ready");
        Ok(store)
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_levels (
                user_id INTEGER NOT NULL,
                guild_id INTEGER NOT NULL,
                xp INTEGER NOT NULL DEFAULT 0,
                level INTEGER NOT NULL DEFAULT 0,
                message_count INTEGER NOT NULL DEFAULT 0,
                last_xp_gain INTEGER,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (user_id, guild_id)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_user_levels_guild_xp ON user_levels (guild_id, xp DESC)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS level_roles (
                guild_id INTEGER NOT NULL,
                level INTEGER NOT NULL,
                role_id INTEGER NOT NULL,
                PRIMARY KEY (guild_id, level)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, LevelingError> {
    Utc.timestamp_millis_opt(millis).single().ok_or_else(|| {
        LevelingError::CollaboratorUnavailable(format!("corrupt timestamp in database: {millis}"))
    })
}

fn row_to_record(row: &SqliteRow) -> Result<UserLevelRecord, LevelingError> {
    let last_xp_gain = row
        .try_get::<Option<i64>, _>("last_xp_gain")?
        .map(from_millis)
        .transpose()?;

    Ok(UserLevelRecord {
        user_id: row.try_get::<i64, _>("user_id")? as u64,
        guild_id: row.try_get::<i64, _>("guild_id")? as u64,
        xp: row.try_get::<i64, _>("xp")?.max(0) as u64,
        level: row.try_get::<i64, _>("level")?.max(0) as u32,
        message_count: row.try_get::<i64, _>("message_count")?.max(0) as u64,
        last_xp_gain,
        created_at: from_millis(row.try_get::<i64, _>("created_at")?)?,
    })
}

fn clamp_to_i64(value: u64) -> i64 {
    value.min(i64::MAX as u64) as i64
}

#[async_trait]
impl XpStore for SqliteXpStore {
    async fn get_record(
        &self,
        user_id: u64,
        guild_id: u64,
    ) -> Result<Option<UserLevelRecord>, LevelingError> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM user_levels WHERE user_id = ? AND guild_id = ?"
        ))
        .bind(user_id as i64)
        .bind(guild_id as i64)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn get_or_create_record(
        &self,
        user_id: u64,
        guild_id: u64,
        now: DateTime<Utc>,
    ) -> Result<UserLevelRecord, LevelingError> {
        sqlx::query(
            "INSERT INTO user_levels (user_id, guild_id, created_at) VALUES (?, ?, ?) \
             ON CONFLICT(user_id, guild_id) DO NOTHING",
        )
        .bind(user_id as i64)
        .bind(guild_id as i64)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;

        self.get_record(user_id, guild_id).await?.ok_or_else(|| {
            LevelingError::CollaboratorUnavailable("record vanished after insert".to_string())
        })
    }

    async fn increment_xp(
        &self,
        user_id: u64,
        guild_id: u64,
        amount: u64,
        now: DateTime<Utc>,
        cooldown_cutoff: Option<DateTime<Utc>>,
    ) -> Result<Option<UserLevelRecord>, LevelingError> {
        // One statement: the cooldown check and the increment can't interleave
        // with another writer. A blocked update returns no row.
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO user_levels (user_id, guild_id, xp, level, message_count, last_xp_gain, created_at)
            VALUES (?1, ?2, ?3, 0, 1, ?4, ?4)
            ON CONFLICT(user_id, guild_id) DO UPDATE SET
                xp = user_levels.xp + excluded.xp,
                message_count = user_levels.message_count + 1,
                last_xp_gain = excluded.last_xp_gain
            WHERE ?5 IS NULL
               OR user_levels.last_xp_gain IS NULL
               OR user_levels.last_xp_gain <= ?5
            RETURNING {RECORD_COLUMNS}
            "#
        ))
        .bind(user_id as i64)
        .bind(guild_id as i64)
        .bind(clamp_to_i64(amount))
        .bind(to_millis(now))
        .bind(cooldown_cutoff.map(to_millis))
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn set_level(
        &self,
        user_id: u64,
        guild_id: u64,
        level: u32,
    ) -> Result<(), LevelingError> {
        sqlx::query("UPDATE user_levels SET level = ? WHERE user_id = ? AND guild_id = ?")
            .bind(level as i64)
            .bind(user_id as i64)
            .bind(guild_id as i64)
            .execute(&self.pool)
            .await?;
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
        let row = sqlx::query(&format!(
            r#"
            UPDATE user_levels SET
                xp = ?1,
                level = ?2,
                message_count = COALESCE(?3, message_count)
            WHERE user_id = ?4 AND guild_id = ?5
            RETURNING {RECORD_COLUMNS}
            "#
        ))
        .bind(clamp_to_i64(xp))
        .bind(level as i64)
        .bind(message_count.map(clamp_to_i64))
        .bind(user_id as i64)
        .bind(guild_id as i64)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn adjust_xp(
        &self,
        user_id: u64,
        guild_id: u64,
        delta: i64,
    ) -> Result<Option<(UserLevelRecord, i64)>, LevelingError> {
        let mut tx = self.pool.begin().await?;

        let before: Option<i64> =
            sqlx::query_scalar("SELECT xp FROM user_levels WHERE user_id = ? AND guild_id = ?")
                .bind(user_id as i64)
                .bind(guild_id as i64)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(before) = before else {
            return Ok(None);
        };

        let after = before.saturating_add(delta).max(0);
        let row = sqlx::query(&format!(
            "UPDATE user_levels SET xp = ? WHERE user_id = ? AND guild_id = ? RETURNING {RECORD_COLUMNS}"
        ))
        .bind(after)
        .bind(user_id as i64)
        .bind(guild_id as i64)
        .fetch_one(&mut *tx)
        .await?;
        let record = row_to_record(&row)?;

        tx.commit().await?;
        Ok(Some((record, after - before)))
    }

    async fn list_records(&self, guild_id: u64) -> Result<Vec<UserLevelRecord>, LevelingError> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM user_levels WHERE guild_id = ?"
        ))
        .bind(guild_id as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_record).collect()
    }

    async fn top_by_xp(
        &self,
        guild_id: u64,
        limit: usize,
    ) -> Result<Vec<UserLevelRecord>, LevelingError> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM user_levels WHERE guild_id = ? \
             ORDER BY xp DESC, user_id ASC LIMIT ?"
        ))
        .bind(guild_id as i64)
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_record).collect()
    }

    async fn count_with_xp_above(&self, guild_id: u64, xp: u64) -> Result<u64, LevelingError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM user_levels WHERE guild_id = ? AND xp > ?")
                .bind(guild_id as i64)
                .bind(clamp_to_i64(xp))
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }

    async fn aggregate(&self, guild_id: u64) -> Result<Option<GuildLevelStats>, LevelingError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total_users,
                   COALESCE(SUM(xp), 0) AS total_xp,
                   COALESCE(SUM(message_count), 0) AS total_messages,
                   AVG(level) AS average_level,
                   COALESCE(MAX(level), 0) AS max_level
            FROM user_levels WHERE guild_id = ?
            "#,
        )
        .bind(guild_id as i64)
        .fetch_one(&self.pool)
        .await?;

        let total_users = row.try_get::<i64, _>("total_users")?;
        if total_users == 0 {
            return Ok(None);
        }
        Ok(Some(GuildLevelStats {
            total_users: total_users as u64,
            total_xp: row.try_get::<i64, _>("total_xp")?.max(0) as u64,
            total_messages: row.try_get::<i64, _>("total_messages")?.max(0) as u64,
            average_level: row.try_get::<Option<f64>, _>("average_level")?.unwrap_or(0.0),
            max_level: row.try_get::<i64, _>("max_level")?.max(0) as u32,
        }))
    }
}

#[async_trait]
impl LevelRoleIndex for SqliteXpStore {
    async fn get_level_role(
        &self,
        guild_id: u64,
        level: u32,
    ) -> Result<Option<u64>, LevelingError> {
        let role_id: Option<i64> =
            sqlx::query_scalar("SELECT role_id FROM level_roles WHERE guild_id = ? AND level = ?")
                .bind(guild_id as i64)
                .bind(level as i64)
                .fetch_optional(&self.pool)
                .await?;
        Ok(role_id.map(|id| id as u64))
    }

    async fn set_level_role(
        &self,
        guild_id: u64,
        level: u32,
        role_id: u64,
    ) -> Result<(), LevelingError> {
        sqlx::query(
            "INSERT INTO level_roles (guild_id, level, role_id) VALUES (?, ?, ?) \
             ON CONFLICT(guild_id, level) DO UPDATE SET role_id = excluded.role_id",
        )
        .bind(guild_id as i64)
        .bind(level as i64)
        .bind(role_id as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_level_role(&self, guild_id: u64, level: u32) -> Result<(), LevelingError> {
        sqlx::query("DELETE FROM level_roles WHERE guild_id = ? AND level = ?")
            .bind(guild_id as i64)
            .bind(level as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn level_roles(&self, guild_id: u64) -> Result<Vec<(u32, u64)>, LevelingError> {
        let rows = sqlx::query(
            "SELECT level, role_id FROM level_roles WHERE guild_id = ? ORDER BY level ASC",
        )
        .bind(guild_id as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<(u32, u64), LevelingError> {
                Ok((
                    row.try_get::<i64, _>("level")? as u32,
                    row.try_get::<i64, _>("role_id")? as u64,
                ))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn memory_store() -> SqliteXpStore {
        SqliteXpStore::new("sqlite::memory:").await.unwrap()
    }

    /// Millisecond precision, same as what the table keeps.
    fn now_ms() -> DateTime<Utc> {
        from_millis(Utc::now().timestamp_millis()).unwrap()
    }

    #[tokio::test]
    async fn increment_upserts_and_respects_cutoff() {
        let store = memory_store().await;
        let start = now_ms();

        let first = store.increment_xp(1, 10, 25, start, None).await.unwrap().unwrap();
        assert_eq!((first.xp, first.message_count, first.level), (25, 1, 0));
        assert_eq!(first.last_xp_gain, Some(start));
        assert_eq!(first.created_at, start);

        let later = start + chrono::Duration::seconds(30);
        let blocked = store
            .increment_xp(1, 10, 25, later, Some(later - chrono::Duration::seconds(60)))
            .await
            .unwrap();
        assert!(blocked.is_none());

        let allowed = store
            .increment_xp(1, 10, 25, later, Some(later - chrono::Duration::seconds(30)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!((allowed.xp, allowed.message_count), (50, 2));
        assert_eq!(allowed.last_xp_gain, Some(later));
    }

    #[tokio::test]
    async fn admin_writes_need_an_existing_record() {
        let store = memory_store().await;
        assert!(store.set_progress(1, 10, 500, 2, None).await.unwrap().is_none());
        assert!(store.adjust_xp(1, 10, 5).await.unwrap().is_none());
        assert!(store.get_record(1, 10).await.unwrap().is_none());

        let created = store.get_or_create_record(1, 10, now_ms()).await.unwrap();
        assert_eq!(created.xp, 0);
        // Second call returns the same row instead of resetting it.
        store.set_progress(1, 10, 500, 2, Some(9)).await.unwrap();
        let again = store.get_or_create_record(1, 10, now_ms()).await.unwrap();
        assert_eq!((again.xp, again.level, again.message_count), (500, 2, 9));

        let (record, applied) = store.adjust_xp(1, 10, -800).await.unwrap().unwrap();
        assert_eq!(record.xp, 0);
        assert_eq!(applied, -500);
    }

    #[tokio::test]
    async fn ranking_queries() {
        let store = memory_store().await;
        let now = now_ms();
        for (user, xp) in [(3, 300), (2, 500), (1, 500), (4, 10)] {
            store.increment_xp(user, 10, xp, now, None).await.unwrap();
        }
        store.increment_xp(9, 11, 9_999, now, None).await.unwrap();

        let top: Vec<u64> = store
            .top_by_xp(10, 3)
            .await
            .unwrap()
            .iter()
            .map(|r| r.user_id)
            .collect();
        assert_eq!(top, vec![1, 2, 3]);
        assert_eq!(store.count_with_xp_above(10, 500).await.unwrap(), 0);
        assert_eq!(store.count_with_xp_above(10, 300).await.unwrap(), 2);

        store.set_level(1, 10, 4).await.unwrap();
        let stats = store.aggregate(10).await.unwrap().unwrap();
        assert_eq!(stats.total_users, 4);
        assert_eq!(stats.total_xp, 1_310);
        assert_eq!(stats.total_messages, 4);
        assert_eq!(stats.max_level, 4);
        assert!((stats.average_level - 1.0).abs() < f64::EPSILON);
        assert!(store.aggregate(12).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn role_index_upserts() {
        let store = memory_store().await;
        store.set_level_role(10, 3, 333).await.unwrap();
        store.set_level_role(10, 3, 334).await.unwrap();
        store.set_level_role(10, 1, 111).await.unwrap();
        assert_eq!(store.level_roles(10).await.unwrap(), vec![(1, 111), (3, 334)]);

        store.clear_level_role(10, 3).await.unwrap();
        assert_eq!(store.get_level_role(10, 3).await.unwrap(), None);
    }

    #[tokio::test]
    async fn data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("leveling.db");
        let path = path.to_str().unwrap();
        let start = now_ms();

        {
            let store = SqliteXpStore::new(path).await.unwrap();
            store.increment_xp(1, 10, 40, start, None).await.unwrap();
            store.set_level_role(10, 1, 777).await.unwrap();
        }

        let reopened = SqliteXpStore::new(path).await.unwrap();
        let record = reopened.get_record(1, 10).await.unwrap().unwrap();
        assert_eq!(record.xp, 40);
        assert_eq!(record.last_xp_gain, Some(start));
        assert_eq!(reopened.get_level_role(10, 1).await.unwrap(), Some(777));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_increments_are_not_lost() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leveling.db");
        let store = Arc::new(SqliteXpStore::new(path.to_str().unwrap()).await.unwrap());
        let now = now_ms();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                // SQLITE_BUSY is possible with several writers; retry until it lands.
                loop {
                    match store.increment_xp(1, 10, 5, now, None).await {
                        Ok(_) => break,
                        Err(LevelingError::CollaboratorUnavailable(_)) => {
                            tokio::time::sleep(std::time::Duration::from_millis(5)).await
                        }
                        Err(other) => panic!("unexpected error: {other}"),
                    }
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let record = store.get_record(1, 10).await.unwrap().unwrap();
        assert_eq!(record.xp, 100);
        assert_eq!(record.message_count, 20);
    }
}
