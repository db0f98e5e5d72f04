// Decides whether a message earns XP and how much.
//
// Pure apart from the random roll, and the random source is passed in, so a
// seeded StdRng makes every outcome reproducible in tests.

use super::leveling_config::LevelingConfig;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;

/// Outcome of `XpAwardPolicy::compute_gain`.
///
/// `Blocked` is distinct from a zero-XP grant so callers can tell "cooldown
/// said no" from "earned nothing extra".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XpGain {
    Blocked { remaining: Duration },
    Granted { base: u64, bonus: u64, length_bonus: u64 },
}

impl XpGain {
    pub fn total(&self) -> u64 {
        match self {
            XpGain::Blocked { .. } => 0,
            XpGain::Granted {
                base,
                bonus,
                length_bonus,
            } => base.saturating_add(*bonus).saturating_add(*length_bonus),
        }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, XpGain::Blocked { .. })
    }
}

#[derive(Debug, Clone)]
pub struct XpAwardPolicy {
    base_xp: u64,
    bonus_min: u64,
    bonus_max: u64,
    cooldown: Duration,
    min_message_length: usize,
    length_multiplier: f64,
    max_length_bonus: u64,
}

impl XpAwardPolicy {
    pub fn from_config(config: &LevelingConfig) -> Self {
        Self {
            base_xp: config.xp_per_message,
            bonus_min: config.xp_bonus_min,
            // A validated config never has min > max, but don't let a bad one panic the roll.
            bonus_max: config.xp_bonus_max.max(config.xp_bonus_min),
            cooldown: config.cooldown(),
            min_message_length: config.min_message_length,
            length_multiplier: config.length_multiplier,
            max_length_bonus: config.max_length_bonus,
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Time left on the cooldown, or `None` if an award is allowed now.
    pub fn cooldown_remaining(
        &self,
        now: DateTime<Utc>,
        last_gain_at: Option<DateTime<Utc>>,
    ) -> Option<Duration> {
        if self.cooldown.is_zero() {
            return None;
        }
        let last = last_gain_at?;
        let elapsed = now.signed_duration_since(last);
        let cooldown = chrono::Duration::from_std(self.cooldown).ok()?;
        if elapsed >= cooldown {
            return None;
        }
        // A timestamp from the future (clock skew) counts as a fresh award.
        let remaining = (cooldown - elapsed).to_std().unwrap_or(self.cooldown);
        Some(remaining.min(self.cooldown))
    }

    pub fn compute_gain<R: Rng + ?Sized>(
        &self,
        content: &str,
        now: DateTime<Utc>,
        last_gain_at: Option<DateTime<Utc>>,
        rng: &mut R,
    ) -> XpGain {
        if let Some(remaining) = self.cooldown_remaining(now, last_gain_at) {
            return XpGain::Blocked { remaining };
        }

        XpGain::Granted {
            base: self.base_xp,
            bonus: rng.gen_range(self.bonus_min..=self.bonus_max),
            length_bonus: self.length_bonus(content),
        }
    }

    pub fn length_bonus(&self, content: &str) -> u64 {
        let length = content.trim().chars().count();
        if length < self.min_message_length {
            return 0;
        }
        let raw = (length as f64 * self.length_multiplier).floor() as u64;
        raw.min(self.max_length_bonus)
    }
}
