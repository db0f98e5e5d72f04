// Test doubles for the role provisioner and the announcer.

use super::level_roles::RoleProvisioner;
use super::leveling_engine::LevelAnnouncer;
use super::leveling_models::{
    GuildLevelStats, GuildRole, LevelRoleIndex, LevelUpNotice, LevelingError, RoleError,
    UserLevelRecord, XpStore,
};
use crate::infra::leveling::InMemoryXpStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct FakeState {
    roles: Vec<GuildRole>,
    members: HashMap<u64, Vec<u64>>,
    next_id: u64,
    calls: usize,
    add_calls: usize,
    failing_members: HashSet<u64>,
    rate_limit_next_add: Option<Duration>,
    yield_on_call: bool,
}

/// In-memory role provider that records what it was asked to do.
#[derive(Clone, Default)]
pub struct FakeRoleProvisioner {
    state: Arc<Mutex<FakeState>>,
}

impl FakeRoleProvisioner {
    pub fn seed_role(&self, name: &str) -> u64 {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = 1_000 + state.next_id;
        state.roles.push(GuildRole {
            id,
            name: name.to_string(),
        });
        id
    }

    pub fn delete_role(&self, role_id: u64) {
        let mut state = self.state.lock().unwrap();
        state.roles.retain(|role| role.id != role_id);
    }

    pub fn role_id_by_name(&self, name: &str) -> Option<u64> {
        let state = self.state.lock().unwrap();
        state.roles.iter().find(|role| role.name == name).map(|role| role.id)
    }

    pub fn role_count(&self) -> usize {
        self.state.lock().unwrap().roles.len()
    }

    pub fn member_roles(&self, user_id: u64) -> Vec<u64> {
        let state = self.state.lock().unwrap();
        state.members.get(&user_id).cloned().unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().unwrap().calls
    }

    pub fn add_calls(&self) -> usize {
        self.state.lock().unwrap().add_calls
    }

    pub fn fail_adds_for(&self, user_id: u64) {
        self.state.lock().unwrap().failing_members.insert(user_id);
    }

    pub fn rate_limit_next_add(&self, retry_after: Duration) {
        self.state.lock().unwrap().rate_limit_next_add = Some(retry_after);
    }

    /// Make every call suspend once first, like a real HTTP round-trip.
    pub fn yield_on_each_call(&self) {
        self.state.lock().unwrap().yield_on_call = true;
    }

    async fn round_trip(&self) {
        let yielding = self.state.lock().unwrap().yield_on_call;
        if yielding {
            tokio::task::yield_now().await;
        }
    }
}

#[async_trait]
impl RoleProvisioner for FakeRoleProvisioner {
    async fn guild_roles(&self, _guild_id: u64) -> Result<Vec<GuildRole>, RoleError> {
        self.round_trip().await;
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        Ok(state.roles.clone())
    }

    async fn create_role(
        &self,
        _guild_id: u64,
        name: &str,
        _color: u32,
    ) -> Result<GuildRole, RoleError> {
        self.round_trip().await;
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        state.next_id += 1;
        let role = GuildRole {
            id: 1_000 + state.next_id,
            name: name.to_string(),
        };
        state.roles.push(role.clone());
        Ok(role)
    }

    async fn rename_role(
        &self,
        _guild_id: u64,
        role_id: u64,
        name: &str,
        _color: u32,
    ) -> Result<(), RoleError> {
        self.round_trip().await;
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        let role = state
            .roles
            .iter_mut()
            .find(|role| role.id == role_id)
            .ok_or(RoleError::NotFound)?;
        role.name = name.to_string();
        Ok(())
    }

    async fn add_role_to_member(
        &self,
        _guild_id: u64,
        user_id: u64,
        role_id: u64,
    ) -> Result<(), RoleError> {
        self.round_trip().await;
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        if let Some(retry_after) = state.rate_limit_next_add.take() {
            return Err(RoleError::RateLimited { retry_after });
        }
        if state.failing_members.contains(&user_id) {
            return Err(RoleError::PermissionDenied("missing MANAGE_ROLES".to_string()));
        }
        state.add_calls += 1;
        let held = state.members.entry(user_id).or_default();
        if !held.contains(&role_id) {
            held.push(role_id);
        }
        Ok(())
    }

    async fn remove_role_from_member(
        &self,
        _guild_id: u64,
        user_id: u64,
        role_id: u64,
    ) -> Result<(), RoleError> {
        self.round_trip().await;
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        if !state.roles.iter().any(|role| role.id == role_id) {
            return Err(RoleError::NotFound);
        }
        if let Some(held) = state.members.get_mut(&user_id) {
            held.retain(|id| *id != role_id);
        }
        Ok(())
    }
}

/// Announcer that keeps every notice it was handed.
#[derive(Clone, Default)]
pub struct RecordingAnnouncer {
    notices: Arc<Mutex<Vec<LevelUpNotice>>>,
    fail: Arc<Mutex<bool>>,
}

impl RecordingAnnouncer {
    pub fn notices(&self) -> Vec<LevelUpNotice> {
        self.notices.lock().unwrap().clone()
    }

    pub fn fail_sends(&self) {
        *self.fail.lock().unwrap() = true;
    }
}

#[async_trait]
impl LevelAnnouncer for RecordingAnnouncer {
    async fn announce_level_up(
        &self,
        _guild_id: u64,
        notice: &LevelUpNotice,
    ) -> Result<(), LevelingError> {
        self.notices.lock().unwrap().push(notice.clone());
        if *self.fail.lock().unwrap() {
            return Err(LevelingError::CollaboratorUnavailable(
                "announcement channel gone".to_string(),
            ));
        }
        Ok(())
    }
}

/// In-memory store whose reads or increments can be switched to fail, the
/// way a dropped database connection would.
#[derive(Default)]
pub struct FlakyStore {
    inner: InMemoryXpStore,
    fail_reads: AtomicBool,
    fail_increments: AtomicBool,
}

impl FlakyStore {
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_increments(&self, fail: bool) {
        self.fail_increments.store(fail, Ordering::SeqCst);
    }

    fn outage(flag: &AtomicBool) -> Result<(), LevelingError> {
        if flag.load(Ordering::SeqCst) {
            Err(LevelingError::CollaboratorUnavailable(
                "database is locked".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl XpStore for FlakyStore {
    async fn get_record(
        &self,
        user_id: u64,
        guild_id: u64,
    ) -> Result<Option<UserLevelRecord>, LevelingError> {
        Self::outage(&self.fail_reads)?;
        self.inner.get_record(user_id, guild_id).await
    }

    async fn get_or_create_record(
        &self,
        user_id: u64,
        guild_id: u64,
        now: DateTime<Utc>,
    ) -> Result<UserLevelRecord, LevelingError> {
        self.inner.get_or_create_record(user_id, guild_id, now).await
    }

    async fn increment_xp(
        &self,
        user_id: u64,
        guild_id: u64,
        amount: u64,
        now: DateTime<Utc>,
        cooldown_cutoff: Option<DateTime<Utc>>,
    ) -> Result<Option<UserLevelRecord>, LevelingError> {
        Self::outage(&self.fail_increments)?;
        self.inner
            .increment_xp(user_id, guild_id, amount, now, cooldown_cutoff)
            .await
    }

    async fn set_level(
        &self,
        user_id: u64,
        guild_id: u64,
        level: u32,
    ) -> Result<(), LevelingError> {
        self.inner.set_level(user_id, guild_id, level).await
    }

    async fn set_progress(
        &self,
        user_id: u64,
        guild_id: u64,
        xp: u64,
        level: u32,
        message_count: Option<u64>,
    ) -> Result<Option<UserLevelRecord>, LevelingError> {
        self.inner
            .set_progress(user_id, guild_id, xp, level, message_count)
            .await
    }

    async fn adjust_xp(
        &self,
        user_id: u64,
        guild_id: u64,
        delta: i64,
    ) -> Result<Option<(UserLevelRecord, i64)>, LevelingError> {
        self.inner.adjust_xp(user_id, guild_id, delta).await
    }

    async fn list_records(&self, guild_id: u64) -> Result<Vec<UserLevelRecord>, LevelingError> {
        self.inner.list_records(guild_id).await
    }

    async fn top_by_xp(
        &self,
        guild_id: u64,
        limit: usize,
    ) -> Result<Vec<UserLevelRecord>, LevelingError> {
        self.inner.top_by_xp(guild_id, limit).await
    }

    async fn count_with_xp_above(&self, guild_id: u64, xp: u64) -> Result<u64, LevelingError> {
        self.inner.count_with_xp_above(guild_id, xp).await
    }

    async fn aggregate(&self, guild_id: u64) -> Result<Option<GuildLevelStats>, LevelingError> {
        self.inner.aggregate(guild_id).await
    }
}

#[async_trait]
impl LevelRoleIndex for FlakyStore {
    async fn get_level_role(
        &self,
        guild_id: u64,
        level: u32,
    ) -> Result<Option<u64>, LevelingError> {
        self.inner.get_level_role(guild_id, level).await
    }

    async fn set_level_role(
        &self,
        guild_id: u64,
        level: u32,
        role_id: u64,
    ) -> Result<(), LevelingError> {
        self.inner.set_level_role(guild_id, level, role_id).await
    }

    async fn clear_level_role(&self, guild_id: u64, level: u32) -> Result<(), LevelingError> {
        self.inner.clear_level_role(guild_id, level).await
    }

    async fn level_roles(&self, guild_id: u64) -> Result<Vec<(u32, u64)>, LevelingError> {
        self.inner.level_roles(guild_id).await
    }
}
