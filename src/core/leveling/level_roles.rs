// Level roles: what the role for a level looks like, and bringing a member's
// roles in line with their level.
//
// Actual role objects belong to the role provisioner (Discord in production).
// This module only computes specs and issues ensure/assign/remove intents.
// Role identity comes from the `LevelRoleIndex`; display-name matching is only
// used to adopt roles created before the index existed (including the old
// "Level N" names without an XP suffix).

use super::level_curve::LevelCurve;
use super::leveling_config::LevelingConfig;
use super::leveling_models::{
    GuildRole, LevelRoleIndex, LevelRoleSpec, LevelingError, MemberRoles, RoleError,
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};

const LIGHT_RED: (u8, u8, u8) = (255, 153, 153);
const DARK_RED: (u8, u8, u8) = (139, 0, 0);

// ============================================================================
// ROLE PROVISIONING TRAIT (PORT)
// ============================================================================

/// The role side of the notification collaborator.
///
/// Add/remove treat "already has it" / "already lacks it" as success.
/// `RoleError::NotFound` means the role or member no longer exists.
#[async_trait]
pub trait RoleProvisioner: Send + Sync {
    async fn guild_roles(&self, guild_id: u64) -> Result<Vec<GuildRole>, RoleError>;

    async fn find_role_by_name(
        &self,
        guild_id: u64,
        name: &str,
    ) -> Result<Option<GuildRole>, RoleError> {
        Ok(self
            .guild_roles(guild_id)
            .await?
            .into_iter()
            .find(|role| role.name == name))
    }

    async fn create_role(&self, guild_id: u64, name: &str, color: u32)
        -> Result<GuildRole, RoleError>;

    /// Rename a role and refresh its color.
    async fn rename_role(
        &self,
        guild_id: u64,
        role_id: u64,
        name: &str,
        color: u32,
    ) -> Result<(), RoleError>;

    async fn add_role_to_member(
        &self,
        guild_id: u64,
        user_id: u64,
        role_id: u64,
    ) -> Result<(), RoleError>;

    async fn remove_role_from_member(
        &self,
        guild_id: u64,
        user_id: u64,
        role_id: u64,
    ) -> Result<(), RoleError>;
}

// ============================================================================
// REPORTS
// ============================================================================

/// What a single-member reconciliation did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleReconcileReport {
    pub created: u32,
    pub renamed: u32,
    pub assigned: u32,
    pub removed: u32,
    pub failures: u32,
}

/// Incremental progress of a backfill run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillProgress {
    pub processed: usize,
    pub total: usize,
    pub assigned: usize,
    pub failures: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillReport {
    pub scanned: usize,
    pub assigned: usize,
    pub already_had_role: usize,
    /// Members whose level has no generated role (level 0 or past the cap).
    pub no_role_for_level: usize,
    pub failures: usize,
    pub cancelled: bool,
}

/// Cancellation and progress hooks for a backfill run.
#[derive(Debug, Default)]
pub struct BackfillControl {
    /// Flip to `true` to stop before the next batch.
    pub cancel: Option<watch::Receiver<bool>>,
    pub progress: Option<watch::Sender<BackfillProgress>>,
}

impl BackfillControl {
    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    fn publish(&self, progress: &BackfillProgress) {
        if let Some(tx) = &self.progress {
            // No receivers left is fine, nobody is watching.
            let _ = tx.send(progress.clone());
        }
    }
}

// ============================================================================
// MANAGER
// ============================================================================

pub struct LevelRoleManager<P: RoleProvisioner, I: LevelRoleIndex> {
    provisioner: P,
    index: Arc<I>,
    curve: LevelCurve,
    enabled: bool,
    prefix: String,
    color_spread: u32,
    batch_size: usize,
    batch_delay: Duration,
    failures: AtomicU64,
    /// One lock per (guild, level) so concurrent level-ups share a role.
    provisioning: DashMap<(u64, u32), Arc<Mutex<()>>>,
}

impl<P: RoleProvisioner, I: LevelRoleIndex> LevelRoleManager<P, I> {
    pub fn new(
        provisioner: P,
        index: Arc<I>,
        curve: LevelCurve,
        config: &LevelingConfig,
    ) -> Self {
        Self {
            provisioner,
            index,
            curve,
            enabled: config.roles_enabled,
            prefix: config.role_prefix.clone(),
            color_spread: config.role_color_spread,
            batch_size: config.backfill_batch_size.max(1),
            batch_delay: config.backfill_delay(),
            failures: AtomicU64::new(0),
            provisioning: DashMap::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Provisioning failures swallowed since startup.
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------------
    // Naming
    // ------------------------------------------------------------------------

    /// Role spec for `level`, or `None` when the level gets no role
    /// (level 0, or above the configured cap).
    pub fn spec_for(&self, level: u32) -> Option<LevelRoleSpec> {
        if level == 0 || level > self.curve.max_level() {
            return None;
        }
        Some(LevelRoleSpec {
            level,
            name: self.role_name(level),
            color: self.role_color(level),
        })
    }

    pub fn role_name(&self, level: u32) -> String {
        format!(
            "{} {} (XP {})",
            self.prefix,
            level,
            format_thousands(self.curve.cumulative_xp_for_level(level))
        )
    }

    pub fn legacy_role_name(&self, level: u32) -> String {
        format!("{} {}", self.prefix, level)
    }

    /// Linear light-red to dark-red gradient; everything past the spread
    /// renders the darkest shade.
    pub fn role_color(&self, level: u32) -> u32 {
        let t = if self.color_spread == 0 {
            1.0
        } else {
            (level.saturating_sub(1) as f64 / self.color_spread as f64).min(1.0)
        };
        let mix = |from: u8, to: u8| -> u32 {
            (from as f64 + (to as f64 - from as f64) * t).round() as u32
        };
        (mix(LIGHT_RED.0, DARK_RED.0) << 16)
            | (mix(LIGHT_RED.1, DARK_RED.1) << 8)
            | mix(LIGHT_RED.2, DARK_RED.2)
    }

    /// Which level a role name stands for, under the current or legacy naming.
    pub fn parse_role_level(&self, name: &str) -> Option<u32> {
        let rest = name.strip_prefix(self.prefix.as_str())?.strip_prefix(' ')?;
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        if digits_end == 0 {
            return None;
        }
        let level: u32 = rest[..digits_end].parse().ok()?;
        let suffix = &rest[digits_end..];
        if suffix.is_empty() || (suffix.starts_with(" (XP ") && suffix.ends_with(')')) {
            Some(level)
        } else {
            None
        }
    }

    // ------------------------------------------------------------------------
    // Single member
    // ------------------------------------------------------------------------

    /// Bring one member's level roles in line with `new_level`.
    ///
    /// Never fails: provisioning errors are logged and counted in the report,
    /// and XP/level state is left alone either way.
    pub async fn reconcile(
        &self,
        guild_id: u64,
        member: &MemberRoles,
        old_level: Option<u32>,
        new_level: u32,
    ) -> RoleReconcileReport {
        let mut report = RoleReconcileReport::default();
        if !self.enabled {
            return report;
        }

        if let Err(err) = self
            .try_reconcile(guild_id, member, old_level, new_level, &mut report)
            .await
        {
            self.record_failure();
            report.failures += 1;
            tracing::warn!(
                guild_id,
                user_id = member.user_id,
                new_level,
                error = %err,
                "Level role reconciliation failed; leaving it for backfill"
            );
        }
        report
    }

    async fn try_reconcile(
        &self,
        guild_id: u64,
        member: &MemberRoles,
        old_level: Option<u32>,
        new_level: u32,
        report: &mut RoleReconcileReport,
    ) -> Result<(), LevelingError> {
        let mut roles = self.provisioner.guild_roles(guild_id).await?;
        let known = self.known_level_roles(guild_id, &roles).await?;

        let target = match self.spec_for(new_level) {
            Some(spec) => Some(self.ensure_role(guild_id, &spec, &mut roles, report).await?),
            None => None,
        };

        let mut to_remove: HashSet<u64> = HashSet::new();
        if let Some(old) = old_level.filter(|old| *old != new_level) {
            to_remove.extend(
                known
                    .iter()
                    .filter(|(_, level)| **level == old)
                    .map(|(role_id, _)| *role_id),
            );
        }
        // Stray level roles the member still carries from earlier levels.
        to_remove.extend(
            member
                .role_ids
                .iter()
                .filter(|role_id| known.contains_key(role_id))
                .copied(),
        );
        if let Some(target) = target {
            to_remove.remove(&target);
        }

        for role_id in to_remove {
            match self
                .provisioner
                .remove_role_from_member(guild_id, member.user_id, role_id)
                .await
            {
                Ok(()) => report.removed += 1,
                Err(RoleError::NotFound) => {}
                Err(err) => {
                    self.record_failure();
                    report.failures += 1;
                    tracing::warn!(
                        guild_id,
                        user_id = member.user_id,
                        role_id,
                        error = %err,
                        "Failed to remove old level role"
                    );
                }
            }
        }

        if let Some(target) = target {
            if !member.role_ids.contains(&target) {
                self.provisioner
                    .add_role_to_member(guild_id, member.user_id, target)
                    .await?;
                report.assigned += 1;
            }
        }

        Ok(())
    }

    /// Role id -> level for every role recognised as a level role, from the
    /// index first and display names second.
    async fn known_level_roles(
        &self,
        guild_id: u64,
        roles: &[GuildRole],
    ) -> Result<HashMap<u64, u32>, LevelingError> {
        let mut known: HashMap<u64, u32> = self
            .index
            .level_roles(guild_id)
            .await?
            .into_iter()
            .map(|(level, role_id)| (role_id, level))
            .collect();
        for role in roles {
            if let Some(level) = self.parse_role_level(&role.name) {
                known.entry(role.id).or_insert(level);
            }
        }
        Ok(known)
    }

    /// Find or create the role for `spec` and record it in the index.
    ///
    /// Order of preference: the indexed role (renamed if its name drifted),
    /// a role already carrying the current name, a role recognisable as this
    /// level under any naming (renamed), and only then a brand-new role.
    /// Serialized per (guild, level); the index is read under the lock.
    async fn ensure_role(
        &self,
        guild_id: u64,
        spec: &LevelRoleSpec,
        roles: &mut Vec<GuildRole>,
        report: &mut RoleReconcileReport,
    ) -> Result<u64, LevelingError> {
        let lock = Arc::clone(
            self.provisioning
                .entry((guild_id, spec.level))
                .or_default()
                .value(),
        );
        let _held = lock.lock().await;

        if let Some(role_id) = self.index.get_level_role(guild_id, spec.level).await? {
            if !roles.iter().any(|role| role.id == role_id) {
                // Our snapshot may predate a role another task just created.
                *roles = self.provisioner.guild_roles(guild_id).await?;
            }
            if let Some(role) = roles.iter_mut().find(|role| role.id == role_id) {
                if role.name != spec.name {
                    self.provisioner
                        .rename_role(guild_id, role_id, &spec.name, spec.color)
                        .await?;
                    role.name = spec.name.clone();
                    report.renamed += 1;
                }
                return Ok(role_id);
            }
            tracing::info!(
                guild_id,
                level = spec.level,
                role_id,
                "Indexed level role is gone; re-provisioning"
            );
            self.index.clear_level_role(guild_id, spec.level).await?;
        }

        let exact = roles.iter().position(|role| role.name == spec.name);
        let adoptable = exact.or_else(|| {
            roles
                .iter()
                .position(|role| self.parse_role_level(&role.name) == Some(spec.level))
        });

        let role_id = match adoptable {
            Some(pos) => {
                let role = &mut roles[pos];
                if role.name != spec.name {
                    tracing::info!(
                        guild_id,
                        level = spec.level,
                        from = %role.name,
                        to = %spec.name,
                        "Migrating legacy level role name"
                    );
                    self.provisioner
                        .rename_role(guild_id, role.id, &spec.name, spec.color)
                        .await?;
                    role.name = spec.name.clone();
                    report.renamed += 1;
                }
                role.id
            }
            None => {
                let role = self
                    .provisioner
                    .create_role(guild_id, &spec.name, spec.color)
                    .await?;
                tracing::info!(guild_id, level = spec.level, role_id = role.id, "Created level role");
                report.created += 1;
                let id = role.id;
                roles.push(role);
                id
            }
        };

        self.index.set_level_role(guild_id, spec.level, role_id).await?;
        Ok(role_id)
    }

    // ------------------------------------------------------------------------
    // Bulk backfill
    // ------------------------------------------------------------------------

    /// Give every member without any level role the role for their persisted
    /// level. Members missing from `levels` count as level 0.
    ///
    /// Runs in batches with a pause in between, backs off once on rate limits,
    /// and can be cancelled between batches. Safe to re-run: members that
    /// already hold a level role are skipped.
    pub async fn reconcile_missing(
        &self,
        guild_id: u64,
        members: &[MemberRoles],
        levels: &HashMap<u64, u32>,
        control: &BackfillControl,
    ) -> BackfillReport {
        let mut report = BackfillReport::default();
        if !self.enabled {
            return report;
        }

        let mut progress = BackfillProgress {
            total: members.len(),
            ..BackfillProgress::default()
        };

        let mut roles = match self
            .with_backoff(|| self.provisioner.guild_roles(guild_id))
            .await
        {
            Ok(roles) => roles,
            Err(err) => {
                self.record_failure();
                tracing::error!(guild_id, error = %err, "Backfill could not list guild roles");
                report.failures += 1;
                return report;
            }
        };
        let known = match self.known_level_roles(guild_id, &roles).await {
            Ok(known) => known,
            Err(err) => {
                tracing::error!(guild_id, error = %err, "Backfill could not load the level role index");
                report.failures += 1;
                return report;
            }
        };

        let mut resolved: HashMap<u32, u64> = HashMap::new();
        let batch_count = members.len().div_ceil(self.batch_size);

        for (batch_index, batch) in members.chunks(self.batch_size).enumerate() {
            if control.is_cancelled() {
                tracing::info!(guild_id, processed = progress.processed, "Backfill cancelled");
                report.cancelled = true;
                break;
            }

            for member in batch {
                report.scanned += 1;
                progress.processed += 1;

                if member.role_ids.iter().any(|id| known.contains_key(id)) {
                    report.already_had_role += 1;
                    continue;
                }

                let level = levels.get(&member.user_id).copied().unwrap_or(0);
                let Some(spec) = self.spec_for(level) else {
                    report.no_role_for_level += 1;
                    continue;
                };

                match self
                    .assign_for_backfill(guild_id, member.user_id, &spec, &mut roles, &mut resolved)
                    .await
                {
                    Ok(()) => {
                        report.assigned += 1;
                        progress.assigned += 1;
                    }
                    Err(err) => {
                        self.record_failure();
                        report.failures += 1;
                        progress.failures += 1;
                        tracing::warn!(
                            guild_id,
                            user_id = member.user_id,
                            level,
                            error = %err,
                            "Backfill failed for member"
                        );
                    }
                }
            }

            control.publish(&progress);
            tracing::info!(
                guild_id,
                batch = batch_index + 1,
                batches = batch_count,
                processed = progress.processed,
                assigned = progress.assigned,
                "Backfill batch done"
            );

            if batch_index + 1 < batch_count && !self.batch_delay.is_zero() {
                tokio::time::sleep(self.batch_delay).await;
            }
        }

        report
    }

    async fn assign_for_backfill(
        &self,
        guild_id: u64,
        user_id: u64,
        spec: &LevelRoleSpec,
        roles: &mut Vec<GuildRole>,
        resolved: &mut HashMap<u32, u64>,
    ) -> Result<(), LevelingError> {
        let role_id = match resolved.get(&spec.level) {
            Some(role_id) => *role_id,
            None => {
                let mut scratch = RoleReconcileReport::default();
                let role_id = match self.ensure_role(guild_id, spec, roles, &mut scratch).await {
                    Err(LevelingError::RateLimited(wait)) => {
                        tokio::time::sleep(wait).await;
                        self.ensure_role(guild_id, spec, roles, &mut scratch).await?
                    }
                    other => other?,
                };
                resolved.insert(spec.level, role_id);
                role_id
            }
        };

        self.with_backoff(|| self.provisioner.add_role_to_member(guild_id, user_id, role_id))
            .await
    }

    /// Run `op`, and if it was rate limited wait the advertised time and try
    /// exactly once more.
    async fn with_backoff<T, F, Fut>(&self, op: F) -> Result<T, LevelingError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, RoleError>>,
    {
        match op().await {
            Err(RoleError::RateLimited { retry_after }) => {
                tracing::warn!(?retry_after, "Role provider rate limited; backing off");
                tokio::time::sleep(retry_after).await;
                op().await.map_err(LevelingError::from)
            }
            other => other.map_err(LevelingError::from),
        }
    }

    fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }
}

/// 12345678 -> "12,345,678"
pub fn format_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}
