// Configuration for the leveling system.
//
// Defaults are the production values. `from_env` overlays LEVELING_* variables
// (loaded from .env by main) and validates the result.

use super::level_curve::LevelCurve;
use super::leveling_models::LevelingError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelingConfig {
    /// Flat XP for every qualifying message.
    pub xp_per_message: u64,

    /// Inclusive range of the random bonus rolled per message.
    pub xp_bonus_min: u64,
    pub xp_bonus_max: u64,

    /// Minimum time between two awards for the same user.
    pub cooldown_seconds: u64,

    /// Trimmed messages shorter than this earn no length bonus.
    pub min_message_length: usize,
    pub length_multiplier: f64,
    pub max_length_bonus: u64,

    /// Level curve parameters (see `LevelCurve`).
    pub level_base: f64,
    pub level_growth: f64,

    pub roles_enabled: bool,
    pub role_prefix: String,
    /// Highest level that gets a generated role.
    pub max_level_roles: u32,
    /// Levels over which the role color walks from light to dark red.
    pub role_color_spread: u32,

    /// Levels whose announcement gets extra flavor text.
    pub milestone_levels: Vec<u32>,

    /// Members handled per batch during role backfill.
    pub backfill_batch_size: usize,
    /// Pause between backfill batches.
    pub backfill_batch_delay_ms: u64,
}

impl Default for LevelingConfig {
    fn default() -> Self {
        Self {
            xp_per_message: 15,
            xp_bonus_min: 0,
            xp_bonus_max: 10,
            cooldown_seconds: 60,
            min_message_length: 5,
            length_multiplier: 0.1,
            max_length_bonus: 50,
            level_base: 100.0,
            level_growth: 1.5,
            roles_enabled: true,
            role_prefix: "Level".to_string(),
            max_level_roles: 100,
            role_color_spread: 50,
            milestone_levels: vec![5, 10, 25, 50, 100],
            backfill_batch_size: 10,
            backfill_batch_delay_ms: 1_000,
        }
    }
}

impl LevelingConfig {
    /// Build a config from LEVELING_* environment variables on top of the defaults.
    pub fn from_env() -> Result<Self, LevelingError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env`, with the variable source injected (tests use a map).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, LevelingError> {
        let mut config = Self::default();

        override_parsed(&lookup, "LEVELING_XP_PER_MESSAGE", &mut config.xp_per_message)?;
        override_parsed(&lookup, "LEVELING_XP_BONUS_MIN", &mut config.xp_bonus_min)?;
        override_parsed(&lookup, "LEVELING_XP_BONUS_MAX", &mut config.xp_bonus_max)?;
        override_parsed(&lookup, "LEVELING_COOLDOWN_SECONDS", &mut config.cooldown_seconds)?;
        override_parsed(
            &lookup,
            "LEVELING_MIN_MESSAGE_LENGTH",
            &mut config.min_message_length,
        )?;
        override_parsed(
            &lookup,
            "LEVELING_LENGTH_MULTIPLIER",
            &mut config.length_multiplier,
        )?;
        override_parsed(&lookup, "LEVELING_MAX_LENGTH_BONUS", &mut config.max_length_bonus)?;
        override_parsed(&lookup, "LEVELING_LEVEL_BASE", &mut config.level_base)?;
        override_parsed(&lookup, "LEVELING_LEVEL_GROWTH", &mut config.level_growth)?;
        override_parsed(&lookup, "LEVELING_ROLES_ENABLED", &mut config.roles_enabled)?;
        override_parsed(&lookup, "LEVELING_MAX_LEVEL_ROLES", &mut config.max_level_roles)?;
        override_parsed(&lookup, "LEVELING_ROLE_COLOR_SPREAD", &mut config.role_color_spread)?;
        override_parsed(
            &lookup,
            "LEVELING_BACKFILL_BATCH_SIZE",
            &mut config.backfill_batch_size,
        )?;
        override_parsed(
            &lookup,
            "LEVELING_BACKFILL_BATCH_DELAY_MS",
            &mut config.backfill_batch_delay_ms,
        )?;

        if let Some(prefix) = lookup("LEVELING_ROLE_PREFIX") {
            config.role_prefix = prefix.trim().to_string();
        }

        // Either a JSON array ("[5, 10, 25]") or a plain comma list ("5,10,25").
        if let Some(raw) = lookup("LEVELING_MILESTONE_LEVELS") {
            config.milestone_levels = parse_levels(&raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), LevelingError> {
        // Reuse the curve's own parameter checks.
        self.level_curve()?;

        if self.xp_bonus_min > self.xp_bonus_max {
            return Err(LevelingError::InvalidArgument(format!(
                "xp bonus min ({}) is greater than max ({})",
                self.xp_bonus_min, self.xp_bonus_max
            )));
        }
        if !self.length_multiplier.is_finite() || self.length_multiplier < 0.0 {
            return Err(LevelingError::InvalidArgument(format!(
                "length multiplier must be a non-negative number, got {}",
                self.length_multiplier
            )));
        }
        if self.role_prefix.is_empty() {
            return Err(LevelingError::InvalidArgument(
                "role prefix must not be empty".to_string(),
            ));
        }
        if self.backfill_batch_size == 0 {
            return Err(LevelingError::InvalidArgument(
                "backfill batch size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn level_curve(&self) -> Result<LevelCurve, LevelingError> {
        LevelCurve::new(self.level_base, self.level_growth, self.max_level_roles)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_seconds)
    }

    pub fn backfill_delay(&self) -> Duration {
        Duration::from_millis(self.backfill_batch_delay_ms)
    }
}

fn override_parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) -> Result<(), LevelingError> {
    if let Some(raw) = lookup(key) {
        *target = raw.trim().parse::<T>().map_err(|_| {
            LevelingError::InvalidArgument(format!("{key} has an invalid value: {raw:?}"))
        })?;
    }
    Ok(())
}

fn parse_levels(raw: &str) -> Result<Vec<u32>, LevelingError> {
    let trimmed = raw.trim();
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).map_err(|e| {
            LevelingError::InvalidArgument(format!("LEVELING_MILESTONE_LEVELS: {e}"))
        });
    }
    trimmed
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<u32>().map_err(|_| {
                LevelingError::InvalidArgument(format!("invalid milestone level {part:?}"))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = LevelingConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cooldown(), Duration::from_secs(60));
    }

    #[test]
    fn env_values_override_defaults() {
        let config = LevelingConfig::from_lookup(lookup_from(&[
            ("LEVELING_XP_PER_MESSAGE", "20"),
            ("LEVELING_COOLDOWN_SECONDS", "10"),
            ("LEVELING_ROLE_PREFIX", "Rank"),
            ("LEVELING_ROLES_ENABLED", "false"),
            ("LEVELING_MILESTONE_LEVELS", "3, 6,9"),
        ]))
        .unwrap();

        assert_eq!(config.xp_per_message, 20);
        assert_eq!(config.cooldown_seconds, 10);
        assert_eq!(config.role_prefix, "Rank");
        assert!(!config.roles_enabled);
        assert_eq!(config.milestone_levels, vec![3, 6, 9]);
    }

    #[test]
    fn milestones_accept_json_arrays() {
        let config =
            LevelingConfig::from_lookup(lookup_from(&[("LEVELING_MILESTONE_LEVELS", "[1, 2]")]))
                .unwrap();
        assert_eq!(config.milestone_levels, vec![1, 2]);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = LevelingConfig::from_lookup(lookup_from(&[("LEVELING_LEVEL_BASE", "0")]))
            .unwrap_err();
        assert!(matches!(err, LevelingError::InvalidArgument(_)));

        let err = LevelingConfig::from_lookup(lookup_from(&[("LEVELING_XP_PER_MESSAGE", "lots")]))
            .unwrap_err();
        assert!(err.to_string().contains("LEVELING_XP_PER_MESSAGE"));

        let err = LevelingConfig::from_lookup(lookup_from(&[
            ("LEVELING_XP_BONUS_MIN", "10"),
            ("LEVELING_XP_BONUS_MAX", "5"),
        ]))
        .unwrap_err();
        assert!(matches!(err, LevelingError::InvalidArgument(_)));
    }
}
