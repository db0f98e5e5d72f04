use crate::core::leveling::{LevelAnnouncer, LevelUpNotice, LevelingError};
use async_trait::async_trait;
use poise::serenity_prelude::{self as serenity, builder::CreateMessage};
use rand::seq::SliceRandom;
use std::sync::Arc;

/// Posts level-up embeds to the configured announcement channel, or to the
/// channel the triggering message came from when none is configured.
pub struct DiscordLevelAnnouncer {
    http: Arc<serenity::Http>,
    channel_id: Option<u64>,
}

impl DiscordLevelAnnouncer {
    pub fn new(http: Arc<serenity::Http>, channel_id: Option<u64>) -> Self {
        Self { http, channel_id }
    }
}

#[async_trait]
impl LevelAnnouncer for DiscordLevelAnnouncer {
    async fn announce_level_up(
        &self,
        guild_id: u64,
        notice: &LevelUpNotice,
    ) -> Result<(), LevelingError> {
        let Some(channel_id) = self.channel_id.or(notice.source_channel_id) else {
            tracing::debug!(
                guild_id,
                user_id = notice.change.user_id,
                "No channel to announce level-up in"
            );
            return Ok(());
        };

        serenity::ChannelId::new(channel_id)
            .send_message(&*self.http, CreateMessage::new().embed(level_up_embed(notice)))
            .await
            .map(|_| ())
            .map_err(|e| LevelingError::CollaboratorUnavailable(e.to_string()))
    }
}

fn level_up_embed(notice: &LevelUpNotice) -> serenity::CreateEmbed {
    let change = &notice.change;
    let (xp_in_level, level_span) = level_progress(
        change.total_xp,
        notice.level_floor_xp,
        notice.next_level_xp,
    );
    let progress = xp_in_level as f64 / level_span as f64;

    let mut embed = serenity::CreateEmbed::new()
        .title("Level Up!")
        .description(format!(
            "<@{}> reached level {}!",
            change.user_id, change.new_level
        ))
        .color(level_color(change.new_level))
        .field("Total XP", change.total_xp.to_string(), true)
        .field("XP to next level", change.xp_to_next.to_string(), true)
        .field(
            "Progress",
            format!(
                "{}/{} XP\n{}",
                xp_in_level,
                level_span,
                build_progress_bar(progress, 18)
            ),
            false,
        );
    if let Some(milestone) = &notice.milestone {
        embed = embed.field("Milestone", milestone.clone(), false);
    }
    embed.footer(serenity::CreateEmbedFooter::new(random_flavor_line()))
}

/// XP earned inside the current level and the width of that level.
/// The span is never zero.
pub fn level_progress(total_xp: u64, floor_xp: u64, next_xp: u64) -> (u64, u64) {
    let span = next_xp.saturating_sub(floor_xp).max(1);
    let inside = total_xp.saturating_sub(floor_xp).min(span);
    (inside, span)
}

fn level_color(level: u32) -> serenity::Colour {
    if level >= 50 {
        serenity::Colour::DARK_PURPLE
    } else if level >= 25 {
        serenity::Colour::ORANGE
    } else if level >= 10 {
        serenity::Colour::GOLD
    } else if level >= 5 {
        serenity::Colour::BLURPLE
    } else {
        serenity::Colour::LIGHT_GREY
    }
}

pub fn build_progress_bar(progress: f64, length: usize) -> String {
    let clamped = if progress.is_finite() {
        progress.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let mut filled = (clamped * length as f64).round() as usize;
    // Any progress at all shows at least one segment.
    if clamped > 0.0 && filled == 0 {
        filled = 1;
    }
    filled = filled.min(length);
    let bar = "▰".repeat(filled) + &"▱".repeat(length - filled);
    format!("{} ({}%)", bar, (clamped * 100.0).round() as u32)
}

fn random_flavor_line() -> &'static str {
    const FLAVOR_LINES: [&str; 4] = [
        "Keep the streak going!",
        "Your grind is paying off.",
        "Another level, another flex.",
        "That XP bar never stood a chance.",
    ];

    FLAVOR_LINES
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(FLAVOR_LINES[0])
}
