// The leveling engine: runs one award cycle per activity event and the
// administrative overrides, in this order:
//
//   cooldown check -> award computed -> atomic persist -> level compared
//   -> (roles reconciled, level-up announced)
//
// The only concurrency safeguard is the store's atomic increment. Level
// comparison always uses the post-increment XP the store hands back, never a
// value derived from an earlier read.

use super::level_curve::LevelCurve;
use super::level_roles::{BackfillControl, BackfillReport, LevelRoleManager, RoleProvisioner};
use super::leveling_config::LevelingConfig;
use super::leveling_models::{
    ActivityEvent, AdminAdjustment, AwardDeclined, AwardOutcome, DeclineReason, LevelChanged,
    LevelDirection, LevelRoleIndex, LevelUpNotice, LevelingError, MemberRoles, UserLevelRecord,
    XpStore,
};
use super::xp_policy::{XpAwardPolicy, XpGain};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Highest level an admin may set directly.
const MAX_ADMIN_LEVEL: u32 = 10_000;
/// Largest single XP adjustment an admin may apply, in either direction.
const MAX_ADMIN_XP_DELTA: i64 = 1_000_000_000;
/// Cache size at which expired cooldown entries are swept out.
const RECENT_AWARDS_SWEEP_AT: usize = 10_000;

/// Where level-up notifications go (a designated channel in production).
#[async_trait]
pub trait LevelAnnouncer: Send + Sync {
    async fn announce_level_up(
        &self,
        guild_id: u64,
        notice: &LevelUpNotice,
    ) -> Result<(), LevelingError>;
}

pub struct LevelingEngine<S, P, A>
where
    S: XpStore + LevelRoleIndex,
    P: RoleProvisioner,
    A: LevelAnnouncer,
{
    store: Arc<S>,
    roles: LevelRoleManager<P, S>,
    announcer: A,
    policy: XpAwardPolicy,
    curve: LevelCurve,
    milestones: Vec<u32>,
    /// Fast-path cooldown cache. Not authoritative: the persisted
    /// `last_xp_gain` decides, this only saves a round-trip.
    recent_awards: DashMap<(u64, u64), DateTime<Utc>>,
    sweep_at: usize,
    rng: Mutex<StdRng>,
}

impl<S, P, A> LevelingEngine<S, P, A>
where
    S: XpStore + LevelRoleIndex,
    P: RoleProvisioner,
    A: LevelAnnouncer,
{
    pub fn new(
        store: Arc<S>,
        provisioner: P,
        announcer: A,
        config: &LevelingConfig,
    ) -> Result<Self, LevelingError> {
        config.validate()?;
        let curve = config.level_curve()?;
        let roles = LevelRoleManager::new(provisioner, Arc::clone(&store), curve.clone(), config);

        Ok(Self {
            store,
            roles,
            announcer,
            policy: XpAwardPolicy::from_config(config),
            curve,
            milestones: config.milestone_levels.clone(),
            recent_awards: DashMap::new(),
            sweep_at: RECENT_AWARDS_SWEEP_AT,
            rng: Mutex::new(StdRng::from_entropy()),
        })
    }

    /// Replace the entropy-seeded generator with a fixed seed.
    pub fn with_rng_seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    pub fn curve(&self) -> &LevelCurve {
        &self.curve
    }

    pub fn roles(&self) -> &LevelRoleManager<P, S> {
        &self.roles
    }

    fn validate_ids(user_id: u64, guild_id: u64) -> Result<(), LevelingError> {
        if user_id == 0 || guild_id == 0 {
            Err(LevelingError::InvalidArgument(
                "user and guild ids must be non-zero".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    // ========================================================================
    // AWARD CYCLE
    // ========================================================================

    /// Run one activity event through the award cycle.
    ///
    /// Storage errors abort the cycle with nothing written. Role and
    /// announcement failures after a successful write are logged only.
    pub async fn process_activity(
        &self,
        event: &ActivityEvent,
    ) -> Result<AwardOutcome, LevelingError> {
        Self::validate_ids(event.user_id, event.guild_id)?;
        let key = (event.user_id, event.guild_id);
        let now = event.timestamp;

        let cached_last = self.recent_awards.get(&key).map(|entry| *entry.value());
        if let Some(remaining) = self.policy.cooldown_remaining(now, cached_last) {
            return Ok(self.declined(event, remaining));
        }

        let last_gain_at = self
            .store
            .get_record(event.user_id, event.guild_id)
            .await?
            .and_then(|record| record.last_xp_gain);

        let gain = {
            let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            self.policy
                .compute_gain(&event.content, now, last_gain_at, &mut *rng)
        };
        let amount = match gain {
            XpGain::Blocked { remaining } => return Ok(self.declined(event, remaining)),
            granted => granted.total(),
        };

        let cooldown = self.policy.cooldown();
        let cutoff = if cooldown.is_zero() {
            None
        } else {
            chrono::Duration::from_std(cooldown)
                .ok()
                .map(|cooldown| now - cooldown)
        };
        let Some(updated) = self
            .store
            .increment_xp(event.user_id, event.guild_id, amount, now, cutoff)
            .await?
        else {
            // Another event for the same user got its write in first.
            return Ok(self.declined(event, self.policy.cooldown()));
        };
        self.remember_award(key, now);

        let old_level = self.curve.level_from_xp(updated.xp.saturating_sub(amount));
        let new_level = self.curve.level_from_xp(updated.xp);
        self.sync_stored_level(&updated, new_level).await;

        let level_change = if new_level != old_level {
            let change = self.level_changed(&updated, old_level, new_level);
            let member = MemberRoles {
                user_id: event.user_id,
                role_ids: event.member_role_ids.clone(),
            };
            self.apply_level_change(&change, &member, event.channel_id)
                .await;
            Some(change)
        } else {
            None
        };

        Ok(AwardOutcome::Awarded {
            gained: amount,
            total_xp: updated.xp,
            level: new_level,
            level_change,
        })
    }

    fn remember_award(&self, key: (u64, u64), now: DateTime<Utc>) {
        self.recent_awards.insert(key, now);
        if self.recent_awards.len() < self.sweep_at {
            return;
        }
        let Ok(cooldown) = chrono::Duration::from_std(self.policy.cooldown()) else {
            return;
        };
        let before = self.recent_awards.len();
        self.recent_awards.retain(|_, at| now - *at < cooldown);
        tracing::debug!(
            before,
            after = self.recent_awards.len(),
            "Swept expired cooldown cache entries"
        );
    }

    fn declined(&self, event: &ActivityEvent, remaining: std::time::Duration) -> AwardOutcome {
        tracing::debug!(
            user_id = event.user_id,
            guild_id = event.guild_id,
            remaining_ms = remaining.as_millis() as u64,
            "XP award declined: cooldown"
        );
        AwardOutcome::Declined(AwardDeclined {
            user_id: event.user_id,
            guild_id: event.guild_id,
            reason: DeclineReason::Cooldown { remaining },
        })
    }

    /// Persist `level` if the stored value disagrees with the XP. A failure
    /// here leaves XP correct and the level one write behind; the next cycle
    /// repairs it.
    async fn sync_stored_level(&self, record: &UserLevelRecord, level: u32) {
        if record.level == level {
            return;
        }
        if let Err(err) = self
            .store
            .set_level(record.user_id, record.guild_id, level)
            .await
        {
            tracing::warn!(
                user_id = record.user_id,
                guild_id = record.guild_id,
                level,
                error = %err,
                "Failed to persist level; will retry on next award"
            );
        }
    }

    fn level_changed(&self, record: &UserLevelRecord, old_level: u32, new_level: u32) -> LevelChanged {
        LevelChanged {
            user_id: record.user_id,
            guild_id: record.guild_id,
            old_level,
            new_level,
            total_xp: record.xp,
            xp_to_next: self.curve.xp_to_next_level(record.xp),
        }
    }

    /// Roles first, then the announcement (increases only).
    async fn apply_level_change(
        &self,
        change: &LevelChanged,
        member: &MemberRoles,
        source_channel_id: Option<u64>,
    ) {
        let report = self
            .roles
            .reconcile(change.guild_id, member, Some(change.old_level), change.new_level)
            .await;
        if report.failures > 0 {
            tracing::warn!(
                user_id = change.user_id,
                guild_id = change.guild_id,
                level = change.new_level,
                failures = report.failures,
                "Level role out of sync; run a role backfill to repair"
            );
        }

        match change.direction() {
            LevelDirection::Increased => {
                tracing::info!(
                    user_id = change.user_id,
                    guild_id = change.guild_id,
                    old_level = change.old_level,
                    new_level = change.new_level,
                    total_xp = change.total_xp,
                    "User leveled up"
                );
                let notice = LevelUpNotice {
                    change: change.clone(),
                    level_floor_xp: self.curve.cumulative_xp_for_level(change.new_level),
                    next_level_xp: self
                        .curve
                        .cumulative_xp_for_level(change.new_level.saturating_add(1)),
                    milestone: self.milestone_message(change.new_level),
                    source_channel_id,
                };
                if let Err(err) = self
                    .announcer
                    .announce_level_up(change.guild_id, &notice)
                    .await
                {
                    tracing::warn!(
                        user_id = change.user_id,
                        guild_id = change.guild_id,
                        error = %err,
                        "Failed to announce level-up"
                    );
                }
            }
            LevelDirection::Decreased => {
                tracing::info!(
                    user_id = change.user_id,
                    guild_id = change.guild_id,
                    old_level = change.old_level,
                    new_level = change.new_level,
                    total_xp = change.total_xp,
                    "User level lowered"
                );
            }
        }
    }

    pub fn milestone_message(&self, level: u32) -> Option<String> {
        if !self.milestones.contains(&level) {
            return None;
        }
        let text = match level {
            5 => "Level 5! Officially one of the regulars.".to_string(),
            10 => "Double digits. The grind is real.".to_string(),
            25 => "Quarter-century club. Respect.".to_string(),
            50 => "Level 50. Halfway to legend.".to_string(),
            100 => "Level 100. Absolute legend.".to_string(),
            other => format!("Milestone reached: level {other}!"),
        };
        Some(text)
    }

    // ========================================================================
    // ADMINISTRATIVE OVERRIDES
    // ========================================================================
    // These skip the cooldown entirely and never create records: an unknown
    // target is an InvalidArgument and nothing is written.

    /// xp = 0, level = 0, message_count = 0.
    pub async fn reset(
        &self,
        user_id: u64,
        guild_id: u64,
        member: &MemberRoles,
    ) -> Result<AdminAdjustment, LevelingError> {
        let before = self.existing_record(user_id, guild_id).await?;
        let after = self
            .store
            .set_progress(user_id, guild_id, 0, 0, Some(0))
            .await?
            .ok_or_else(|| Self::unknown_target(user_id, guild_id))?;
        self.recent_awards.remove(&(user_id, guild_id));

        let applied = -(before.xp.min(i64::MAX as u64) as i64);
        tracing::info!(user_id, guild_id, applied_delta = applied, "Admin reset user level");
        self.finish_admin(before, after, applied, member).await
    }

    /// xp = cumulative threshold of `level`, so the result is reproducible.
    pub async fn set_level(
        &self,
        user_id: u64,
        guild_id: u64,
        level: u32,
        member: &MemberRoles,
    ) -> Result<AdminAdjustment, LevelingError> {
        if level > MAX_ADMIN_LEVEL {
            return Err(LevelingError::InvalidArgument(format!(
                "level {level} is above the maximum of {MAX_ADMIN_LEVEL}"
            )));
        }
        let before = self.existing_record(user_id, guild_id).await?;
        let xp = self.curve.cumulative_xp_for_level(level);
        let after = self
            .store
            .set_progress(user_id, guild_id, xp, level, None)
            .await?
            .ok_or_else(|| Self::unknown_target(user_id, guild_id))?;

        let applied = xp as i64 - before.xp as i64;
        tracing::info!(user_id, guild_id, level, applied_delta = applied, "Admin set level");
        self.finish_admin(before, after, applied, member).await
    }

    /// Absolute XP set. Negative input is rejected.
    pub async fn set_xp(
        &self,
        user_id: u64,
        guild_id: u64,
        xp: i64,
        member: &MemberRoles,
    ) -> Result<AdminAdjustment, LevelingError> {
        let level = self.curve.level_from_signed_xp(xp)?;
        let xp = xp as u64;
        let before = self.existing_record(user_id, guild_id).await?;
        let after = self
            .store
            .set_progress(user_id, guild_id, xp, level, None)
            .await?
            .ok_or_else(|| Self::unknown_target(user_id, guild_id))?;

        let applied = xp as i64 - before.xp as i64;
        tracing::info!(user_id, guild_id, xp, applied_delta = applied, "Admin set XP");
        self.finish_admin(before, after, applied, member).await
    }

    /// xp = max(0, xp + delta), applied atomically by the store.
    pub async fn adjust_xp(
        &self,
        user_id: u64,
        guild_id: u64,
        delta: i64,
        member: &MemberRoles,
    ) -> Result<AdminAdjustment, LevelingError> {
        Self::validate_ids(user_id, guild_id)?;
        if delta.unsigned_abs() > MAX_ADMIN_XP_DELTA as u64 {
            return Err(LevelingError::InvalidArgument(format!(
                "xp adjustment {delta} exceeds the limit of {MAX_ADMIN_XP_DELTA}"
            )));
        }
        let (after, applied) = self
            .store
            .adjust_xp(user_id, guild_id, delta)
            .await?
            .ok_or_else(|| Self::unknown_target(user_id, guild_id))?;

        let old_xp = (after.xp as i64 - applied).max(0) as u64;
        let old_level = self.curve.level_from_xp(old_xp);
        let new_level = self.curve.level_from_xp(after.xp);
        self.sync_stored_level(&after, new_level).await;

        if applied != delta {
            tracing::info!(
                user_id,
                guild_id,
                requested_delta = delta,
                applied_delta = applied,
                "Admin XP adjustment clamped at zero"
            );
        } else {
            tracing::info!(user_id, guild_id, applied_delta = applied, "Admin XP adjustment");
        }

        let record = UserLevelRecord {
            level: new_level,
            ..after
        };
        let level_change = if new_level != old_level {
            let change = self.level_changed(&record, old_level, new_level);
            self.apply_level_change(&change, member, None).await;
            Some(change)
        } else {
            None
        };

        Ok(AdminAdjustment {
            record,
            applied_delta: applied,
            level_change,
        })
    }

    async fn existing_record(
        &self,
        user_id: u64,
        guild_id: u64,
    ) -> Result<UserLevelRecord, LevelingError> {
        Self::validate_ids(user_id, guild_id)?;
        self.store
            .get_record(user_id, guild_id)
            .await?
            .ok_or_else(|| Self::unknown_target(user_id, guild_id))
    }

    fn unknown_target(user_id: u64, guild_id: u64) -> LevelingError {
        LevelingError::InvalidArgument(format!(
            "no level record for user {user_id} in guild {guild_id}"
        ))
    }

    async fn finish_admin(
        &self,
        before: UserLevelRecord,
        after: UserLevelRecord,
        applied_delta: i64,
        member: &MemberRoles,
    ) -> Result<AdminAdjustment, LevelingError> {
        let old_level = self.curve.level_from_xp(before.xp);
        let level_change = if after.level != old_level {
            let change = self.level_changed(&after, old_level, after.level);
            self.apply_level_change(&change, member, None).await;
            Some(change)
        } else {
            None
        };
        Ok(AdminAdjustment {
            record: after,
            applied_delta,
            level_change,
        })
    }

    // ========================================================================
    // QUERIES AND BULK
    // ========================================================================

    /// The user's record, created at level zero on first lookup.
    pub async fn record_for(
        &self,
        user_id: u64,
        guild_id: u64,
    ) -> Result<UserLevelRecord, LevelingError> {
        Self::validate_ids(user_id, guild_id)?;
        self.store
            .get_or_create_record(user_id, guild_id, Utc::now())
            .await
    }

    /// Give every member lacking a level role the one matching their
    /// persisted XP. See `LevelRoleManager::reconcile_missing`.
    pub async fn backfill_roles(
        &self,
        guild_id: u64,
        members: &[MemberRoles],
        control: &BackfillControl,
    ) -> Result<BackfillReport, LevelingError> {
        let levels: HashMap<u64, u32> = self
            .store
            .list_records(guild_id)
            .await?
            .into_iter()
            .map(|record| (record.user_id, self.curve.level_from_xp(record.xp)))
            .collect();

        tracing::info!(
            guild_id,
            members = members.len(),
            records = levels.len(),
            "Starting level role backfill"
        );
        let report = self
            .roles
            .reconcile_missing(guild_id, members, &levels, control)
            .await;
        tracing::info!(
            guild_id,
            assigned = report.assigned,
            already_had_role = report.already_had_role,
            failures = report.failures,
            cancelled = report.cancelled,
            "Level role backfill finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::leveling::leaderboard_service::LeaderboardService;
    use crate::core::leveling::test_support::{
        FakeRoleProvisioner, FlakyStore, RecordingAnnouncer,
    };
    use crate::infra::leveling::InMemoryXpStore;

    type TestEngine = LevelingEngine<InMemoryXpStore, FakeRoleProvisioner, RecordingAnnouncer>;

    /// 100 XP per message, no random bonus, no length bonus.
    fn flat_config(cooldown_seconds: u64) -> LevelingConfig {
        LevelingConfig {
            xp_per_message: 100,
            xp_bonus_min: 0,
            xp_bonus_max: 0,
            cooldown_seconds,
            min_message_length: 10_000,
            backfill_batch_delay_ms: 0,
            ..LevelingConfig::default()
        }
    }

    struct Harness {
        engine: TestEngine,
        store: Arc<InMemoryXpStore>,
        roles: FakeRoleProvisioner,
        announcer: RecordingAnnouncer,
    }

    fn harness(config: LevelingConfig) -> Harness {
        let store = Arc::new(InMemoryXpStore::new());
        let roles = FakeRoleProvisioner::default();
        let announcer = RecordingAnnouncer::default();
        let engine = LevelingEngine::new(
            Arc::clone(&store),
            roles.clone(),
            announcer.clone(),
            &config,
        )
        .unwrap()
        .with_rng_seed(11);
        Harness {
            engine,
            store,
            roles,
            announcer,
        }
    }

    fn message(user_id: u64, at: DateTime<Utc>) -> ActivityEvent {
        ActivityEvent {
            user_id,
            guild_id: 1,
            content: "hello world".to_string(),
            timestamp: at,
            member_role_ids: vec![],
            channel_id: Some(99),
        }
    }

    fn nobody(user_id: u64) -> MemberRoles {
        MemberRoles {
            user_id,
            role_ids: vec![],
        }
    }

    #[tokio::test]
    async fn first_hundred_xp_reaches_level_one() {
        let h = harness(flat_config(60));

        let outcome = h.engine.process_activity(&message(7, Utc::now())).await.unwrap();

        let AwardOutcome::Awarded {
            gained,
            total_xp,
            level,
            level_change,
        } = outcome
        else {
            panic!("expected an award, got {outcome:?}");
        };
        assert_eq!(gained, 100);
        assert_eq!(total_xp, 100);
        assert_eq!(level, 1);
        let change = level_change.unwrap();
        assert_eq!((change.old_level, change.new_level), (0, 1));
        assert_eq!(change.direction(), LevelDirection::Increased);

        let notices = h.announcer.notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].source_channel_id, Some(99));
        assert_eq!(notices[0].level_floor_xp, 100);

        let stored = h.store.get_record(7, 1).await.unwrap().unwrap();
        assert_eq!(stored.level, 1);
        assert!(h.roles.role_id_by_name("Level 1 (XP 100)").is_some());
    }

    #[tokio::test]
    async fn cooldown_allows_one_increment() {
        let h = harness(flat_config(10));
        let start = Utc::now();

        let first = h.engine.process_activity(&message(7, start)).await.unwrap();
        let second = h
            .engine
            .process_activity(&message(7, start + chrono::Duration::seconds(3)))
            .await
            .unwrap();

        assert!(matches!(first, AwardOutcome::Awarded { .. }));
        assert!(matches!(second, AwardOutcome::Declined(_)));
        let stored = h.store.get_record(7, 1).await.unwrap().unwrap();
        assert_eq!(stored.message_count, 1);
        assert_eq!(stored.xp, 100);
        // The blocked attempt didn't move the cooldown anchor.
        assert_eq!(stored.last_xp_gain, Some(start));
    }

    #[tokio::test]
    async fn store_outage_drops_the_award_cleanly() {
        let store = Arc::new(FlakyStore::default());
        let announcer = RecordingAnnouncer::default();
        let engine = LevelingEngine::new(
            Arc::clone(&store),
            FakeRoleProvisioner::default(),
            announcer.clone(),
            &flat_config(60),
        )
        .unwrap();
        let start = Utc::now();

        store.fail_increments(true);
        let result = engine.process_activity(&message(7, start)).await;
        assert!(matches!(result, Err(LevelingError::CollaboratorUnavailable(_))));
        assert!(store.get_record(7, 1).await.unwrap().is_none());
        assert!(engine.recent_awards.is_empty());
        assert!(announcer.notices().is_empty());

        store.fail_increments(false);
        store.fail_reads(true);
        let result = engine.process_activity(&message(7, start)).await;
        assert!(matches!(result, Err(LevelingError::CollaboratorUnavailable(_))));
        store.fail_reads(false);
        assert!(store.get_record(7, 1).await.unwrap().is_none());
        assert!(engine.recent_awards.is_empty());

        // Once the store is back the same message counts, with no cooldown
        // left over from the failed attempts.
        let outcome = engine.process_activity(&message(7, start)).await.unwrap();
        assert!(matches!(outcome, AwardOutcome::Awarded { total_xp: 100, .. }));
        assert_eq!(announcer.notices().len(), 1);
    }

    #[tokio::test]
    async fn expired_cooldown_entries_are_swept() {
        let mut h = harness(LevelingConfig {
            xp_per_message: 1,
            ..flat_config(10)
        });
        h.engine.sweep_at = 3;
        let start = Utc::now();

        h.engine.process_activity(&message(7, start)).await.unwrap();
        h.engine.process_activity(&message(8, start)).await.unwrap();
        assert_eq!(h.engine.recent_awards.len(), 2);

        // Third entry hits the threshold; 7 and 8 are past their cooldown.
        let later = start + chrono::Duration::seconds(11);
        h.engine.process_activity(&message(9, later)).await.unwrap();
        assert_eq!(h.engine.recent_awards.len(), 1);
        assert!(h.engine.recent_awards.contains_key(&(9, 1)));

        // The survivor is still cooling down.
        let again = h
            .engine
            .process_activity(&message(9, later + chrono::Duration::seconds(1)))
            .await
            .unwrap();
        assert!(matches!(again, AwardOutcome::Declined(_)));
    }

    #[tokio::test]
    async fn cooldown_survives_a_restart() {
        let h = harness(flat_config(10));
        let start = Utc::now();
        h.engine.process_activity(&message(7, start)).await.unwrap();

        // Fresh engine, empty fast-path cache, same store.
        let restarted = LevelingEngine::new(
            Arc::clone(&h.store),
            FakeRoleProvisioner::default(),
            RecordingAnnouncer::default(),
            &flat_config(10),
        )
        .unwrap();
        let outcome = restarted
            .process_activity(&message(7, start + chrono::Duration::seconds(3)))
            .await
            .unwrap();
        assert!(matches!(outcome, AwardOutcome::Declined(_)));
    }

    #[tokio::test]
    async fn awards_after_cooldown_without_level_change() {
        let h = harness(LevelingConfig {
            xp_per_message: 10,
            ..flat_config(10)
        });
        let start = Utc::now();
        h.engine.process_activity(&message(7, start)).await.unwrap();
        let outcome = h
            .engine
            .process_activity(&message(7, start + chrono::Duration::seconds(10)))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            AwardOutcome::Awarded {
                gained: 10,
                total_xp: 20,
                level: 0,
                level_change: None,
            }
        );
        assert!(h.announcer.notices().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_awards_are_not_lost() {
        let h = harness(LevelingConfig {
            xp_per_message: 1,
            ..flat_config(0)
        });
        let engine = Arc::new(h.engine);
        let now = Utc::now();

        let mut handles = Vec::new();
        for i in 0..50 {
            let engine = Arc::clone(&engine);
            handles.push(tokio::spawn(async move {
                let event = ActivityEvent {
                    content: format!("message {i}"),
                    ..message(7, now)
                };
                engine.process_activity(&event).await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let stored = h.store.get_record(7, 1).await.unwrap().unwrap();
        assert_eq!(stored.xp, stored.message_count);
        assert_eq!(stored.message_count, 50);
    }

    #[tokio::test]
    async fn zero_ids_are_rejected() {
        let h = harness(flat_config(10));
        let err = h.engine.process_activity(&message(0, Utc::now())).await.unwrap_err();
        assert!(matches!(err, LevelingError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn role_failure_does_not_block_announcement() {
        let h = harness(flat_config(60));
        h.roles.fail_adds_for(7);

        let outcome = h.engine.process_activity(&message(7, Utc::now())).await.unwrap();

        assert!(matches!(outcome, AwardOutcome::Awarded { level: 1, .. }));
        assert_eq!(h.announcer.notices().len(), 1);
        assert_eq!(h.engine.roles().failure_count(), 1);
    }

    #[tokio::test]
    async fn announcer_failure_keeps_the_award() {
        let h = harness(flat_config(60));
        h.announcer.fail_sends();
        let outcome = h.engine.process_activity(&message(7, Utc::now())).await.unwrap();
        assert!(matches!(outcome, AwardOutcome::Awarded { total_xp: 100, .. }));
    }

    #[tokio::test]
    async fn milestone_levels_carry_flavor_text() {
        let h = harness(flat_config(60));
        assert!(h.engine.milestone_message(5).is_some());
        assert!(h.engine.milestone_message(6).is_none());

        h.engine.record_for(7, 1).await.unwrap();
        h.engine.set_level(7, 1, 5, &nobody(7)).await.unwrap();
        let notices = h.announcer.notices();
        assert_eq!(notices.len(), 1);
        assert!(notices[0].milestone.is_some());
    }

    #[tokio::test]
    async fn set_level_uses_cumulative_threshold() {
        let h = harness(flat_config(60));
        h.engine.record_for(7, 1).await.unwrap();

        let result = h.engine.set_level(7, 1, 3, &nobody(7)).await.unwrap();

        assert_eq!(result.record.xp, h.engine.curve().cumulative_xp_for_level(3));
        assert_eq!(result.record.level, 3);
        assert_eq!(result.applied_delta, 903);
        assert_eq!(result.level_change.unwrap().new_level, 3);
    }

    #[tokio::test]
    async fn negative_adjustment_clamps_at_zero() {
        let h = harness(flat_config(60));
        h.engine.process_activity(&message(7, Utc::now())).await.unwrap();
        let notices_before = h.announcer.notices().len();

        let result = h.engine.adjust_xp(7, 1, -1_000, &nobody(7)).await.unwrap();

        assert_eq!(result.record.xp, 0);
        assert_eq!(result.record.level, 0);
        assert_eq!(result.applied_delta, -100);
        let change = result.level_change.unwrap();
        assert_eq!(change.direction(), LevelDirection::Decreased);
        // Decreases never produce a level-up announcement.
        assert_eq!(h.announcer.notices().len(), notices_before);
        assert_eq!(h.store.get_record(7, 1).await.unwrap().unwrap().level, 0);
    }

    #[tokio::test]
    async fn invalid_admin_targets_change_nothing() {
        let h = harness(flat_config(60));

        let err = h.engine.adjust_xp(7, 1, 50, &nobody(7)).await.unwrap_err();
        assert!(matches!(err, LevelingError::InvalidArgument(_)));
        assert!(h.store.get_record(7, 1).await.unwrap().is_none());

        h.engine.process_activity(&message(7, Utc::now())).await.unwrap();
        let err = h.engine.set_xp(7, 1, -5, &nobody(7)).await.unwrap_err();
        assert!(matches!(err, LevelingError::InvalidArgument(_)));
        let err = h.engine.set_level(7, 1, 1_000_000, &nobody(7)).await.unwrap_err();
        assert!(matches!(err, LevelingError::InvalidArgument(_)));
        let err = h
            .engine
            .adjust_xp(7, 1, i64::MAX, &nobody(7))
            .await
            .unwrap_err();
        assert!(matches!(err, LevelingError::InvalidArgument(_)));

        assert_eq!(h.store.get_record(7, 1).await.unwrap().unwrap().xp, 100);
    }

    #[tokio::test]
    async fn reset_zeroes_the_record_and_drops_rank() {
        let h = harness(flat_config(60));
        let now = Utc::now();
        for user in [7, 8, 9] {
            h.engine.process_activity(&message(user, now)).await.unwrap();
        }

        let result = h.engine.reset(7, 1, &nobody(7)).await.unwrap();
        assert_eq!(result.record.xp, 0);
        assert_eq!(result.record.message_count, 0);
        assert_eq!(result.record.level, 0);

        let leaderboard = LeaderboardService::new(Arc::clone(&h.store), h.engine.curve().clone());
        assert_eq!(leaderboard.rank_of(7, 1).await.unwrap(), Some(3));
        assert_eq!(leaderboard.rank_of(8, 1).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn reset_keeps_the_persisted_cooldown() {
        let h = harness(flat_config(60));
        let now = Utc::now();
        h.engine.process_activity(&message(7, now)).await.unwrap();
        h.engine.reset(7, 1, &nobody(7)).await.unwrap();
        // Persisted last_xp_gain still applies after a reset.
        let outcome = h
            .engine
            .process_activity(&message(7, now + chrono::Duration::seconds(1)))
            .await
            .unwrap();
        assert!(matches!(outcome, AwardOutcome::Declined(_)));
    }

    #[tokio::test]
    async fn record_for_creates_lazily() {
        let h = harness(flat_config(60));
        assert!(h.store.get_record(7, 1).await.unwrap().is_none());
        let record = h.engine.record_for(7, 1).await.unwrap();
        assert_eq!(record.xp, 0);
        assert_eq!(record.level, 0);
        assert!(h.store.get_record(7, 1).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn backfill_uses_persisted_xp() {
        let h = harness(flat_config(60));
        let now = Utc::now();
        for user in [7, 8] {
            h.engine.process_activity(&message(user, now)).await.unwrap();
        }
        // Pretend roles were lost in an outage.
        let members = vec![nobody(7), nobody(8), nobody(9)];

        let report = h
            .engine
            .backfill_roles(1, &members, &BackfillControl::default())
            .await
            .unwrap();

        // 7 and 8 already got their role during the award; the fake still
        // reports them as role-less because `members` is stale, so they're
        // re-assigned (add is idempotent). 9 has no record.
        assert_eq!(report.scanned, 3);
        assert_eq!(report.assigned, 2);
        assert_eq!(report.no_role_for_level, 1);
    }
}
