// Discord commands for the leveling system.
//
// Same shape for every command: pull primitive ids out of the Discord types,
// call the core, render whatever comes back. No leveling rules live here.

use crate::core::leveling::level_roles::format_thousands;
use crate::core::leveling::{
    AdminAdjustment, BackfillControl, BackfillProgress, LeaderboardService, LevelingEngine,
    LevelingError, MemberRoles,
};
use crate::discord::leveling_announcements::{
    build_progress_bar, level_progress, DiscordLevelAnnouncer,
};
use crate::discord::role_provisioner::SerenityRoleProvisioner;
use crate::infra::leveling::LevelingStore;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use poise::serenity_prelude as serenity;
use std::sync::Arc;
use tokio::sync::watch;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Context<'a> = poise::Context<'a, Data, Error>;

pub type Engine = LevelingEngine<LevelingStore, SerenityRoleProvisioner, DiscordLevelAnnouncer>;

/// Shared state handed to every command and event.
pub struct Data {
    pub leveling: Arc<Engine>,
    pub leaderboard: Arc<LeaderboardService<LevelingStore>>,
    /// Running role backfills by guild, holding the cancel switch.
    pub backfills: DashMap<u64, watch::Sender<bool>>,
}

const LEADERBOARD_PAGE_SIZE: usize = 10;
const LEADERBOARD_MAX_ENTRIES: usize = 100;
const MEMBER_PAGE_SIZE: u64 = 1000;

fn guild_id_of(ctx: &Context<'_>) -> Result<u64, Error> {
    Ok(ctx
        .guild_id()
        .ok_or("This command only works in servers")?
        .get())
}

/// Show your current level, XP and rank.
#[poise::command(slash_command, guild_only)]
pub async fn rank(
    ctx: Context<'_>,
    #[description = "User to check (defaults to you)"] user: Option<serenity::User>,
) -> Result<(), Error> {
    show_rank(ctx, user).await
}

/// Show your current level and XP.
#[poise::command(slash_command, guild_only)]
pub async fn level(
    ctx: Context<'_>,
    #[description = "User to check (defaults to you)"] user: Option<serenity::User>,
) -> Result<(), Error> {
    show_rank(ctx, user).await
}

async fn show_rank(ctx: Context<'_>, user: Option<serenity::User>) -> Result<(), Error> {
    let target_user = user.as_ref().unwrap_or_else(|| ctx.author());
    if target_user.bot {
        ctx.say("Bots don't earn XP! 🤖").await?;
        return Ok(());
    }
    let user_id = target_user.id.get();
    let guild_id = guild_id_of(&ctx)?;

    let data = ctx.data();
    let record = data.leveling.record_for(user_id, guild_id).await?;
    let rank = data.leaderboard.rank_of(user_id, guild_id).await?;

    let curve = data.leveling.curve();
    let level = curve.level_from_xp(record.xp);
    let (xp_in_level, level_span) = level_progress(
        record.xp,
        curve.cumulative_xp_for_level(level),
        curve.cumulative_xp_for_level(level.saturating_add(1)),
    );
    let progress = xp_in_level as f64 / level_span as f64;

    let rank_text = rank
        .map(|r| format!("#{}", r))
        .unwrap_or_else(|| "Unranked".to_string());

    let embed = serenity::CreateEmbed::new()
        .title(format!("Rank of {}", target_user.name))
        .color(0x00ff00)
        .thumbnail(target_user.face())
        .field("Level", format!("**{}**", level), true)
        .field("Rank", format!("**{}**", rank_text), true)
        .field("Total XP", format!("**{}**", format_thousands(record.xp)), true)
        .field(
            "Progress",
            format!(
                "{}/{} XP\n{}",
                xp_in_level,
                level_span,
                build_progress_bar(progress, 15)
            ),
            false,
        )
        .field(
            "XP to next level",
            format_thousands(curve.xp_to_next_level(record.xp)),
            true,
        )
        .field("Messages", format_thousands(record.message_count), true);

    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

/// Show the server's XP leaderboard.
#[poise::command(slash_command, guild_only)]
pub async fn leaderboard(
    ctx: Context<'_>,
    #[description = "Page number (default: 1)"]
    #[min = 1]
    page: Option<usize>,
) -> Result<(), Error> {
    let guild_id = guild_id_of(&ctx)?;
    let records = ctx
        .data()
        .leaderboard
        .top_n(guild_id, LEADERBOARD_MAX_ENTRIES)
        .await?;

    if records.is_empty() {
        ctx.say("No one has earned XP yet! Start chatting to get on the leaderboard! 💬")
            .await?;
        return Ok(());
    }

    let total_pages = records.len().div_ceil(LEADERBOARD_PAGE_SIZE);
    let current_page = page.unwrap_or(1).clamp(1, total_pages);
    let offset = (current_page - 1) * LEADERBOARD_PAGE_SIZE;
    let me = ctx.author().id.get();

    let mut description = String::new();
    match ctx.data().leaderboard.rank_of(me, guild_id).await? {
        Some(rank) => description.push_str(&format!("Your rank: **#{}**\n\n", rank)),
        None => description.push_str("You are not ranked yet.\n\n"),
    }

    let curve = ctx.data().leveling.curve();
    // Rank by position so equal XP on the same page shows as a shared rank.
    let mut previous: Option<(u64, usize)> = None;
    for (index, record) in records.iter().enumerate() {
        let position = index + 1;
        let rank = match previous {
            Some((xp, rank)) if xp == record.xp => rank,
            _ => position,
        };
        previous = Some((record.xp, rank));
        if index < offset || index >= offset + LEADERBOARD_PAGE_SIZE {
            continue;
        }

        let medal = match rank {
            1 => "🥇",
            2 => "🥈",
            3 => "🥉",
            _ => "▫️",
        };
        let name = resolve_display_name_cached(&ctx, guild_id, record.user_id);
        let name = if record.user_id == me {
            format!("**{}** (You)", name)
        } else {
            name
        };
        description.push_str(&format!(
            "{} **#{}** {} · Level {} · {} XP\n",
            medal,
            rank,
            name,
            curve.level_from_xp(record.xp),
            format_thousands(record.xp)
        ));
    }

    let embed = serenity::CreateEmbed::new()
        .title("🏆 XP Leaderboard")
        .description(description)
        .color(0xFFD700)
        .footer(serenity::CreateEmbedFooter::new(format!(
            "Page {}/{}",
            current_page, total_pages
        )));

    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

/// Server-wide leveling statistics.
#[poise::command(slash_command, guild_only)]
pub async fn levelstats(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = guild_id_of(&ctx)?;
    let Some(stats) = ctx.data().leaderboard.aggregate_stats(guild_id).await? else {
        ctx.say("No leveling data for this server yet.").await?;
        return Ok(());
    };

    let embed = serenity::CreateEmbed::new()
        .title("📊 Leveling Stats")
        .color(0x008080)
        .field("Members tracked", format_thousands(stats.total_users), true)
        .field("Total XP", format_thousands(stats.total_xp), true)
        .field("Messages counted", format_thousands(stats.total_messages), true)
        .field("Average level", format!("{:.1}", stats.average_level), true)
        .field("Highest level", stats.max_level.to_string(), true);

    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

// ============================================================================
// ADMIN
// ============================================================================

/// Administrative XP overrides.
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "ADMINISTRATOR",
    subcommands("reset", "setlevel", "setxp", "addxp")
)]
pub async fn xpadmin(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Reset a member's XP, level and message count to zero.
#[poise::command(slash_command, guild_only, required_permissions = "ADMINISTRATOR")]
pub async fn reset(
    ctx: Context<'_>,
    #[description = "Member to reset"] user: serenity::User,
) -> Result<(), Error> {
    let guild_id = guild_id_of(&ctx)?;
    let member = member_roles(&ctx, guild_id, &user).await;
    let result = ctx
        .data()
        .leveling
        .reset(user.id.get(), guild_id, &member)
        .await;
    report_adjustment(ctx, &user, result).await
}

/// Put a member at the start of a level.
#[poise::command(slash_command, guild_only, required_permissions = "ADMINISTRATOR")]
pub async fn setlevel(
    ctx: Context<'_>,
    #[description = "Member to change"] user: serenity::User,
    #[description = "New level"] level: u32,
) -> Result<(), Error> {
    let guild_id = guild_id_of(&ctx)?;
    let member = member_roles(&ctx, guild_id, &user).await;
    let result = ctx
        .data()
        .leveling
        .set_level(user.id.get(), guild_id, level, &member)
        .await;
    report_adjustment(ctx, &user, result).await
}

/// Set a member's total XP.
#[poise::command(slash_command, guild_only, required_permissions = "ADMINISTRATOR")]
pub async fn setxp(
    ctx: Context<'_>,
    #[description = "Member to change"] user: serenity::User,
    #[description = "New total XP"] xp: i64,
) -> Result<(), Error> {
    let guild_id = guild_id_of(&ctx)?;
    let member = member_roles(&ctx, guild_id, &user).await;
    let result = ctx
        .data()
        .leveling
        .set_xp(user.id.get(), guild_id, xp, &member)
        .await;
    report_adjustment(ctx, &user, result).await
}

/// Add (or with a negative amount, remove) XP.
#[poise::command(slash_command, guild_only, required_permissions = "ADMINISTRATOR")]
pub async fn addxp(
    ctx: Context<'_>,
    #[description = "Member to change"] user: serenity::User,
    #[description = "XP to add, negative to remove"] amount: i64,
) -> Result<(), Error> {
    let guild_id = guild_id_of(&ctx)?;
    let member = member_roles(&ctx, guild_id, &user).await;
    let result = ctx
        .data()
        .leveling
        .adjust_xp(user.id.get(), guild_id, amount, &member)
        .await;
    report_adjustment(ctx, &user, result).await
}

async fn report_adjustment(
    ctx: Context<'_>,
    user: &serenity::User,
    result: Result<AdminAdjustment, LevelingError>,
) -> Result<(), Error> {
    let adjustment = match result {
        Ok(adjustment) => adjustment,
        Err(LevelingError::InvalidArgument(reason)) => {
            ctx.say(format!("❌ {}", reason)).await?;
            return Ok(());
        }
        Err(other) => return Err(other.into()),
    };

    let mut text = format!(
        "✅ {} now has {} XP (level {}), change {:+}.",
        user.name,
        format_thousands(adjustment.record.xp),
        adjustment.record.level,
        adjustment.applied_delta
    );
    if let Some(change) = &adjustment.level_change {
        text.push_str(&format!(
            "\nLevel {} → {}.",
            change.old_level, change.new_level
        ));
    }
    ctx.say(text).await?;
    Ok(())
}

/// Role ids the member holds right now; empty if Discord can't tell us.
async fn member_roles(ctx: &Context<'_>, guild_id: u64, user: &serenity::User) -> MemberRoles {
    let role_ids = match serenity::GuildId::new(guild_id).member(ctx, user.id).await {
        Ok(member) => member.roles.iter().map(|role| role.get()).collect(),
        Err(err) => {
            tracing::warn!(guild_id, user_id = user.id.get(), error = %err, "Could not fetch member roles");
            Vec::new()
        }
    };
    MemberRoles {
        user_id: user.id.get(),
        role_ids,
    }
}

// ============================================================================
// ROLE BACKFILL
// ============================================================================

/// Level role maintenance.
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "ADMINISTRATOR",
    subcommands("start", "cancel")
)]
pub async fn syncroles(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Give every member missing a level role the one matching their XP.
#[poise::command(slash_command, guild_only, required_permissions = "ADMINISTRATOR")]
pub async fn start(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = guild_id_of(&ctx)?;
    if !ctx.data().leveling.roles().enabled() {
        ctx.say("Level roles are disabled.").await?;
        return Ok(());
    }
    // Claimed before the first await; released when `_slot` drops.
    let Some((_slot, cancel_rx)) = BackfillSlot::claim(&ctx.data().backfills, guild_id) else {
        ctx.say("A role sync is already running here. Use `/syncroles cancel` to stop it.")
            .await?;
        return Ok(());
    };

    let reply = ctx.say("⏳ Fetching members...").await?;
    let members = fetch_members(&ctx, guild_id).await?;

    let (progress_tx, mut progress_rx) = watch::channel(BackfillProgress::default());

    let control = BackfillControl {
        cancel: Some(cancel_rx),
        progress: Some(progress_tx),
    };
    let engine = Arc::clone(&ctx.data().leveling);
    let run = async move {
        let report = engine.backfill_roles(guild_id, &members, &control).await;
        // Closes the progress channel so the updater below finishes.
        drop(control);
        report
    };
    let updates = async {
        while progress_rx.changed().await.is_ok() {
            let progress = progress_rx.borrow_and_update().clone();
            let text = format!(
                "⏳ Syncing level roles: {}/{} members, {} assigned, {} failed",
                progress.processed, progress.total, progress.assigned, progress.failures
            );
            if let Err(err) = reply
                .edit(ctx, poise::CreateReply::default().content(text))
                .await
            {
                tracing::debug!(error = %err, "Failed to update sync progress message");
            }
        }
    };
    let (report, ()) = tokio::join!(run, updates);
    let report = report?;

    let headline = if report.cancelled {
        "🛑 Role sync cancelled"
    } else {
        "✅ Role sync finished"
    };
    let text = format!(
        "{}: scanned {}, assigned {}, already correct {}, below level 1 {}, failed {}.",
        headline,
        report.scanned,
        report.assigned,
        report.already_had_role,
        report.no_role_for_level,
        report.failures
    );
    reply
        .edit(ctx, poise::CreateReply::default().content(text))
        .await?;
    Ok(())
}

/// A guild's entry in `Data::backfills`, removed again on drop.
struct BackfillSlot<'a> {
    backfills: &'a DashMap<u64, watch::Sender<bool>>,
    guild_id: u64,
}

impl<'a> BackfillSlot<'a> {
    /// Reserve the guild atomically. `None` if a sync already holds it.
    fn claim(
        backfills: &'a DashMap<u64, watch::Sender<bool>>,
        guild_id: u64,
    ) -> Option<(Self, watch::Receiver<bool>)> {
        match backfills.entry(guild_id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let (cancel_tx, cancel_rx) = watch::channel(false);
                slot.insert(cancel_tx);
                Some((Self { backfills, guild_id }, cancel_rx))
            }
        }
    }
}

impl Drop for BackfillSlot<'_> {
    fn drop(&mut self) {
        self.backfills.remove(&self.guild_id);
    }
}

/// Stop a running role sync after its current batch.
#[poise::command(slash_command, guild_only, required_permissions = "ADMINISTRATOR")]
pub async fn cancel(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = guild_id_of(&ctx)?;
    let signalled = ctx
        .data()
        .backfills
        .get(&guild_id)
        .map(|switch| switch.send(true).is_ok())
        .unwrap_or(false);
    if signalled {
        ctx.say("Stopping the role sync after the current batch.")
            .await?;
    } else {
        ctx.say("No role sync is running.").await?;
    }
    Ok(())
}

/// Every non-bot member of the guild, paged through the HTTP API.
async fn fetch_members(ctx: &Context<'_>, guild_id: u64) -> Result<Vec<MemberRoles>, Error> {
    let guild = serenity::GuildId::new(guild_id);
    let mut members = Vec::new();
    let mut after: Option<serenity::UserId> = None;
    loop {
        let page = guild
            .members(ctx.http(), Some(MEMBER_PAGE_SIZE), after)
            .await?;
        let page_len = page.len() as u64;
        after = page.last().map(|member| member.user.id);
        members.extend(page.into_iter().filter(|m| !m.user.bot).map(|m| MemberRoles {
            user_id: m.user.id.get(),
            role_ids: m.roles.iter().map(|role| role.get()).collect(),
        }));
        if page_len < MEMBER_PAGE_SIZE || after.is_none() {
            break;
        }
    }
    Ok(members)
}

fn resolve_display_name_cached(ctx: &Context<'_>, guild_id: u64, user_id: u64) -> String {
    let guild_id_s = serenity::GuildId::new(guild_id);
    let user_id_s = serenity::UserId::new(user_id);

    if let Some(guild) = ctx.serenity_context().cache.guild(guild_id_s) {
        if let Some(member) = guild.members.get(&user_id_s) {
            return member.display_name().to_string();
        }
    }
    if let Some(user) = ctx.serenity_context().cache.user(user_id_s) {
        return user.name.clone();
    }
    // No HTTP lookups here: a leaderboard page would take seconds.
    format!("<@{}>", user_id)
}
