// The level curve: pure functions mapping XP to levels and back.
//
// Level L costs `ceil(base * L^growth)` XP on top of level L-1, and a user's
// level is the highest L whose cumulative cost fits in their total XP. Level
// derivation walks the curve level by level instead of inverting it with
// logarithms, so thresholds never drift by a floating-point hair.

use super::leveling_models::LevelingError;

#[derive(Debug, Clone, PartialEq)]
pub struct LevelCurve {
    base: f64,
    growth: f64,
    /// Cap for role generation only. XP and levels keep going past it.
    max_level: u32,
}

impl LevelCurve {
    pub fn new(base: f64, growth: f64, max_level: u32) -> Result<Self, LevelingError> {
        if !base.is_finite() || base <= 0.0 {
            return Err(LevelingError::InvalidArgument(format!(
                "level base must be positive, got {base}"
            )));
        }
        if !growth.is_finite() || growth <= 0.0 {
            return Err(LevelingError::InvalidArgument(format!(
                "level growth must be positive, got {growth}"
            )));
        }
        Ok(Self {
            base,
            growth,
            max_level,
        })
    }

    pub fn max_level(&self) -> u32 {
        self.max_level
    }

    /// XP needed to go from `level - 1` to `level`. Zero for level 0.
    pub fn incremental_xp(&self, level: u32) -> u64 {
        if level == 0 {
            return 0;
        }
        // `as u64` saturates on overflow, which is what we want for absurd levels.
        (self.base * (level as f64).powf(self.growth)).ceil() as u64
    }

    /// Cost of completing `level` on its own, i.e. the incremental threshold.
    pub fn xp_required_for_level(&self, level: u32) -> u64 {
        self.incremental_xp(level)
    }

    /// Total XP needed to have reached `level` starting from zero.
    pub fn cumulative_xp_for_level(&self, level: u32) -> u64 {
        (1..=level).fold(0u64, |total, l| total.saturating_add(self.incremental_xp(l)))
    }

    /// The unique `L` with `cumulative(L) <= xp < cumulative(L + 1)`.
    pub fn level_from_xp(&self, xp: u64) -> u32 {
        let mut level = 0u32;
        let mut reached = 0u64;
        loop {
            if level == u32::MAX || reached == u64::MAX {
                return level;
            }
            let next = reached.saturating_add(self.incremental_xp(level + 1));
            if next > xp {
                return level;
            }
            level += 1;
            reached = next;
        }
    }

    /// Same as [`level_from_xp`](Self::level_from_xp) for signed input coming
    /// from admin commands. Negative XP is rejected.
    pub fn level_from_signed_xp(&self, xp: i64) -> Result<u32, LevelingError> {
        let xp = u64::try_from(xp).map_err(|_| {
            LevelingError::InvalidArgument(format!("xp must not be negative, got {xp}"))
        })?;
        Ok(self.level_from_xp(xp))
    }

    /// XP still missing before the next level.
    pub fn xp_to_next_level(&self, xp: u64) -> u64 {
        let level = self.level_from_xp(xp);
        self.cumulative_xp_for_level(level.saturating_add(1))
            .saturating_sub(xp)
    }
}
