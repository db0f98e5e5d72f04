// Domain models, errors and storage ports for the leveling system.
//
// Everything here works with primitive ids (u64) and chrono timestamps so the
// same types serve the SQLite store, the in-memory store and the tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// DOMAIN MODELS
// ============================================================================

/// XP state of one user in one guild.
///
/// There is at most one record per (user_id, guild_id) pair. `level` is kept
/// in sync with `xp` by the engine after every successful update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserLevelRecord {
    pub user_id: u64,
    pub guild_id: u64,
    pub xp: u64,
    pub level: u32,
    pub message_count: u64,
    /// Last *successful* award. Blocked attempts never touch it.
    pub last_xp_gain: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl UserLevelRecord {
    /// A fresh level-zero record.
    pub fn new(user_id: u64, guild_id: u64, created_at: DateTime<Utc>) -> Self {
        Self {
            user_id,
            guild_id,
            xp: 0,
            level: 0,
            message_count: 0,
            last_xp_gain: None,
            created_at,
        }
    }
}

/// A qualifying user action, usually a chat message.
///
/// Bots and system accounts are filtered out by the caller before an event is
/// ever built.
#[derive(Debug, Clone)]
pub struct ActivityEvent {
    pub user_id: u64,
    pub guild_id: u64,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Role ids the member currently holds, used for level-role reconciliation.
    pub member_role_ids: Vec<u64>,
    /// Where the message was posted, so announcements can fall back to it.
    pub channel_id: Option<u64>,
}

/// Which way a level moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LevelDirection {
    Increased,
    Decreased,
}

/// Emitted whenever a user's level changes, whether from chatting or from an
/// administrative override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelChanged {
    pub user_id: u64,
    pub guild_id: u64,
    pub old_level: u32,
    pub new_level: u32,
    pub total_xp: u64,
    pub xp_to_next: u64,
}

impl LevelChanged {
    pub fn direction(&self) -> LevelDirection {
        if self.new_level > self.old_level {
            LevelDirection::Increased
        } else {
            LevelDirection::Decreased
        }
    }
}

/// Payload handed to the announcer when someone levels up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelUpNotice {
    pub change: LevelChanged,
    /// XP threshold of the level just reached, for progress rendering.
    pub level_floor_xp: u64,
    /// XP threshold of the following level.
    pub next_level_xp: u64,
    /// Flavor text for milestone levels. Purely cosmetic.
    pub milestone: Option<String>,
    /// Channel the triggering message came from, if any.
    pub source_channel_id: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclineReason {
    Cooldown { remaining: Duration },
}

/// Observability event for an award the cooldown blocked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwardDeclined {
    pub user_id: u64,
    pub guild_id: u64,
    pub reason: DeclineReason,
}

/// Result of running one activity event through the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AwardOutcome {
    Declined(AwardDeclined),
    Awarded {
        gained: u64,
        total_xp: u64,
        level: u32,
        /// Present only when this award changed the level.
        level_change: Option<LevelChanged>,
    },
}

/// Result of an administrative XP/level override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminAdjustment {
    pub record: UserLevelRecord,
    /// Delta actually applied; differs from the request when clamped at zero.
    pub applied_delta: i64,
    pub level_change: Option<LevelChanged>,
}

/// Guild-wide aggregates for the stats view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuildLevelStats {
    pub total_users: u64,
    pub total_xp: u64,
    pub total_messages: u64,
    pub average_level: f64,
    pub max_level: u32,
}

/// A member of a guild as seen by the reconciliation logic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRoles {
    pub user_id: u64,
    pub role_ids: Vec<u64>,
}

/// A role as reported by the role-provisioning collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuildRole {
    pub id: u64,
    pub name: String,
}

/// What the role for a given level should look like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelRoleSpec {
    pub level: u32,
    pub name: String,
    pub color: u32,
}

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum LevelingError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Collaborator unavailable: {0}")]
    CollaboratorUnavailable(String),

    #[error("Rate limited, retry after {0:?}")]
    RateLimited(Duration),
}

impl From<sqlx::Error> for LevelingError {
    fn from(err: sqlx::Error) -> Self {
        LevelingError::CollaboratorUnavailable(err.to_string())
    }
}

/// Failures reported by the role-provisioning collaborator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoleError {
    #[error("Role or member not found")]
    NotFound,

    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Role provider unavailable: {0}")]
    Unavailable(String),
}

impl From<RoleError> for LevelingError {
    fn from(err: RoleError) -> Self {
        match err {
            RoleError::RateLimited { retry_after } => LevelingError::RateLimited(retry_after),
            other => LevelingError::CollaboratorUnavailable(other.to_string()),
        }
    }
}

// ============================================================================
// STORAGE TRAITS (PORTS)
// ============================================================================
// The core says WHAT it needs from persistence. `infra::leveling` says HOW.

/// Persistence collaborator for per-(user, guild) XP state.
///
/// Every mutating method is a single atomic operation from the caller's point
/// of view. The engine never does read-modify-write on `xp` itself.
#[async_trait]
pub trait XpStore: Send + Sync {
    /// Full record, or `None` if the user was never seen in this guild.
    async fn get_record(
        &self,
        user_id: u64,
        guild_id: u64,
    ) -> Result<Option<UserLevelRecord>, LevelingError>;

    /// Fetch the record, creating a level-zero one if it doesn't exist yet.
    async fn get_or_create_record(
        &self,
        user_id: u64,
        guild_id: u64,
        now: DateTime<Utc>,
    ) -> Result<UserLevelRecord, LevelingError>;

    /// Upsert-increment `xp` by `amount`, bump `message_count` and set
    /// `last_xp_gain = now`.
    ///
    /// When `cooldown_cutoff` is given the write only happens if the stored
    /// `last_xp_gain` is absent or `<= cooldown_cutoff`; otherwise `None` is
    /// returned and nothing changes. Returns the post-write record.
    async fn increment_xp(
        &self,
        user_id: u64,
        guild_id: u64,
        amount: u64,
        now: DateTime<Utc>,
        cooldown_cutoff: Option<DateTime<Utc>>,
    ) -> Result<Option<UserLevelRecord>, LevelingError>;

    /// Overwrite just the level field.
    async fn set_level(&self, user_id: u64, guild_id: u64, level: u32)
        -> Result<(), LevelingError>;

    /// Absolute set of xp and level, and optionally message_count.
    /// Returns `None` if no record exists (nothing is created).
    async fn set_progress(
        &self,
        user_id: u64,
        guild_id: u64,
        xp: u64,
        level: u32,
        message_count: Option<u64>,
    ) -> Result<Option<UserLevelRecord>, LevelingError>;

    /// Atomically apply `xp = max(0, xp + delta)`.
    /// Returns the post-write record and the delta actually applied, or
    /// `None` if no record exists.
    async fn adjust_xp(
        &self,
        user_id: u64,
        guild_id: u64,
        delta: i64,
    ) -> Result<Option<(UserLevelRecord, i64)>, LevelingError>;

    /// All records of a guild, in no particular order.
    async fn list_records(&self, guild_id: u64) -> Result<Vec<UserLevelRecord>, LevelingError>;

    /// Up to `limit` records ordered by xp desc, then user_id asc.
    async fn top_by_xp(
        &self,
        guild_id: u64,
        limit: usize,
    ) -> Result<Vec<UserLevelRecord>, LevelingError>;

    /// How many records in the guild have strictly more than `xp`.
    async fn count_with_xp_above(&self, guild_id: u64, xp: u64) -> Result<u64, LevelingError>;

    /// Sum/avg/max over the guild, or `None` for a guild with no records.
    async fn aggregate(&self, guild_id: u64) -> Result<Option<GuildLevelStats>, LevelingError>;
}

/// Explicit level -> role id mapping per guild.
///
/// Once a level role is known its identity comes from here, not from matching
/// display names.
#[async_trait]
pub trait LevelRoleIndex: Send + Sync {
    async fn get_level_role(&self, guild_id: u64, level: u32)
        -> Result<Option<u64>, LevelingError>;

    async fn set_level_role(
        &self,
        guild_id: u64,
        level: u32,
        role_id: u64,
    ) -> Result<(), LevelingError>;

    async fn clear_level_role(&self, guild_id: u64, level: u32) -> Result<(), LevelingError>;

    /// Every known (level, role_id) pair for the guild.
    async fn level_roles(&self, guild_id: u64) -> Result<Vec<(u32, u64)>, LevelingError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_record_starts_at_level_zero() {
        let now = Utc::now();
        let record = UserLevelRecord::new(1, 2, now);
        assert_eq!(record.xp, 0);
        assert_eq!(record.level, 0);
        assert_eq!(record.message_count, 0);
        assert!(record.last_xp_gain.is_none());
        assert_eq!(record.created_at, now);
    }

    #[test]
    fn level_changed_reports_direction() {
        let mut change = LevelChanged {
            user_id: 1,
            guild_id: 2,
            old_level: 3,
            new_level: 4,
            total_xp: 1000,
            xp_to_next: 10,
        };
        assert_eq!(change.direction(), LevelDirection::Increased);
        change.new_level = 1;
        assert_eq!(change.direction(), LevelDirection::Decreased);
    }

    #[test]
    fn role_rate_limit_maps_to_leveling_rate_limit() {
        let err: LevelingError = RoleError::RateLimited {
            retry_after: Duration::from_secs(2),
        }
        .into();
        assert!(matches!(err, LevelingError::RateLimited(d) if d == Duration::from_secs(2)));

        let err: LevelingError = RoleError::PermissionDenied("manage roles".into()).into();
        assert!(err.to_string().contains("manage roles"));
    }
}
