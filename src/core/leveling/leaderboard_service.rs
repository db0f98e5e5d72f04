// Read-only views over persisted XP: top lists, ranks and guild stats.

use super::level_curve::LevelCurve;
use super::leveling_models::{GuildLevelStats, LevelingError, UserLevelRecord, XpStore};
use std::sync::Arc;

/// Hard cap on a single leaderboard page.
const MAX_LEADERBOARD_SIZE: usize = 100;

pub struct LeaderboardService<S: XpStore> {
    store: Arc<S>,
    curve: LevelCurve,
}

impl<S: XpStore> LeaderboardService<S> {
    pub fn new(store: Arc<S>, curve: LevelCurve) -> Self {
        Self { store, curve }
    }

    /// Top `n` records by XP, ties broken by ascending user id.
    pub async fn top_n(
        &self,
        guild_id: u64,
        n: usize,
    ) -> Result<Vec<UserLevelRecord>, LevelingError> {
        if n == 0 {
            return Ok(Vec::new());
        }
        self.store
            .top_by_xp(guild_id, n.min(MAX_LEADERBOARD_SIZE))
            .await
    }

    /// 1-based rank: one plus the number of users with strictly more XP, so
    /// tied users share a rank. `None` if the user has no record.
    pub async fn rank_of(&self, user_id: u64, guild_id: u64) -> Result<Option<u64>, LevelingError> {
        let Some(record) = self.store.get_record(user_id, guild_id).await? else {
            return Ok(None);
        };
        let above = self.store.count_with_xp_above(guild_id, record.xp).await?;
        Ok(Some(above + 1))
    }

    /// Totals come from the store. Levels are recomputed from XP because the
    /// stored `level` column can trail the XP by one failed write.
    pub async fn aggregate_stats(
        &self,
        guild_id: u64,
    ) -> Result<Option<GuildLevelStats>, LevelingError> {
        let Some(mut stats) = self.store.aggregate(guild_id).await? else {
            return Ok(None);
        };
        let levels: Vec<u32> = self
            .store
            .list_records(guild_id)
            .await?
            .iter()
            .map(|record| self.curve.level_from_xp(record.xp))
            .collect();
        if !levels.is_empty() {
            let sum: u64 = levels.iter().map(|level| *level as u64).sum();
            stats.average_level = sum as f64 / levels.len() as f64;
            stats.max_level = levels.iter().copied().max().unwrap_or(0);
        }
        Ok(Some(stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::leveling::InMemoryXpStore;
    use chrono::Utc;

    async fn seeded(xps: &[(u64, u64)]) -> LeaderboardService<InMemoryXpStore> {
        let store = Arc::new(InMemoryXpStore::new());
        let now = Utc::now();
        for (user_id, xp) in xps {
            store.get_or_create_record(*user_id, 1, now).await.unwrap();
            store.set_progress(*user_id, 1, *xp, 0, Some(3)).await.unwrap();
        }
        LeaderboardService::new(store, LevelCurve::new(100.0, 1.5, 100).unwrap())
    }

    #[tokio::test]
    async fn tied_users_share_a_rank() {
        let service = seeded(&[(1, 500), (2, 500), (3, 300)]).await;
        assert_eq!(service.rank_of(1, 1).await.unwrap(), Some(1));
        assert_eq!(service.rank_of(2, 1).await.unwrap(), Some(1));
        assert_eq!(service.rank_of(3, 1).await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn top_n_breaks_ties_by_user_id() {
        let service = seeded(&[(9, 500), (4, 500), (3, 300), (5, 10)]).await;
        let top: Vec<u64> = service
            .top_n(1, 3)
            .await
            .unwrap()
            .into_iter()
            .map(|record| record.user_id)
            .collect();
        assert_eq!(top, vec![4, 9, 3]);
        assert!(service.top_n(1, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_user_is_unranked() {
        let service = seeded(&[(1, 50)]).await;
        assert_eq!(service.rank_of(42, 1).await.unwrap(), None);
        // Other guilds don't leak in.
        assert_eq!(service.rank_of(1, 2).await.unwrap(), None);
    }

    #[tokio::test]
    async fn stats_cover_the_whole_guild() {
        let service = seeded(&[(1, 100), (2, 300)]).await;
        let stats = service.aggregate_stats(1).await.unwrap().unwrap();
        assert_eq!(stats.total_users, 2);
        assert_eq!(stats.total_xp, 400);
        assert_eq!(stats.total_messages, 6);

        assert!(service.aggregate_stats(77).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stats_levels_follow_xp_not_the_stored_level() {
        // Stored level stays 0 while the XP says levels 1 and 2.
        let service = seeded(&[(1, 100), (2, 383)]).await;
        let stats = service.aggregate_stats(1).await.unwrap().unwrap();
        assert_eq!(stats.max_level, 2);
        assert!((stats.average_level - 1.5).abs() < f64::EPSILON);
    }
}
