// Leveling domain: XP accrual, the level curve, level roles and leaderboards.
//
// Nothing in here knows about Discord. The discord layer feeds primitive ids
// and message text in, and renders whatever comes back out.

pub mod leaderboard_service;
pub mod level_curve;
pub mod level_roles;
pub mod leveling_config;
pub mod leveling_engine;
pub mod leveling_models;
pub mod xp_policy;

pub use leaderboard_service::LeaderboardService;
pub use level_curve::LevelCurve;
pub use level_roles::{
    BackfillControl, BackfillProgress, BackfillReport, LevelRoleManager, RoleProvisioner,
    RoleReconcileReport,
};
pub use leveling_config::LevelingConfig;
pub use leveling_engine::{LevelAnnouncer, LevelingEngine};
pub use leveling_models::*;
pub use xp_policy::{XpAwardPolicy, XpGain};

#[cfg(test)]
pub mod test_support;
