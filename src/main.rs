// Entry point of the leveling bot.
//
// **Architecture Overview:**
// - `core/` = Leveling rules (platform-agnostic)
// - `infra/` = Storage implementations of the core ports
// - `discord/` = Discord adapters (commands, role provisioning, announcements)
//
// This file loads configuration, wires the services together and hands
// gateway events to the engine.

// These attrs point each module declaration at a more descriptive root file
// so we don't end up with several mod.rs files that all look the same.
#[path = "core/core_layer.rs"]
mod core;
#[path = "discord/discord_layer.rs"]
mod discord;
#[path = "infra/infra_layer.rs"]
mod infra;

use crate::core::leveling::{
    ActivityEvent, AwardOutcome, LeaderboardService, LevelingConfig, LevelingEngine,
};
use crate::discord::leveling_announcements::DiscordLevelAnnouncer;
use crate::discord::role_provisioner::SerenityRoleProvisioner;
use crate::discord::{Data, Error};
use crate::infra::leveling::LevelingStore;
use anyhow::Context as _;
use dashmap::DashMap;
use poise::serenity_prelude as serenity;
use std::sync::Arc;

const DEFAULT_DB_PATH: &str = "data/leveling.db";

/// Event handler for non-command Discord events: every guild message from a
/// human is an XP award attempt.
async fn event_handler(
    _ctx: &serenity::Context,
    event: &serenity::FullEvent,
    _framework: poise::FrameworkContext<'_, Data, Error>,
    data: &Data,
) -> Result<(), Error> {
    if let serenity::FullEvent::Message { new_message } = event {
        // Ignore bots (including ourselves), webhooks and DMs.
        if new_message.author.bot || new_message.webhook_id.is_some() {
            return Ok(());
        }
        let Some(guild_id) = new_message.guild_id else {
            return Ok(());
        };

        let activity = ActivityEvent {
            user_id: new_message.author.id.get(),
            guild_id: guild_id.get(),
            content: new_message.content.clone(),
            timestamp: chrono::Utc::now(),
            member_role_ids: new_message
                .member
                .as_ref()
                .map(|member| member.roles.iter().map(|role| role.get()).collect())
                .unwrap_or_default(),
            channel_id: Some(new_message.channel_id.get()),
        };

        match data.leveling.process_activity(&activity).await {
            Ok(AwardOutcome::Awarded {
                gained,
                total_xp,
                level,
                ..
            }) => {
                tracing::debug!(
                    user_id = activity.user_id,
                    guild_id = activity.guild_id,
                    gained,
                    total_xp,
                    level,
                    "XP awarded"
                );
            }
            // Cooldown, already logged by the engine.
            Ok(AwardOutcome::Declined(_)) => {}
            Err(e) => {
                // Log it but keep the gateway loop alive.
                tracing::error!(
                    user_id = activity.user_id,
                    guild_id = activity.guild_id,
                    error = %e,
                    "Error processing XP for message"
                );
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging so we can see what's happening
    tracing_subscriber::fmt::init();

    // Load environment variables from .env file (if it exists)
    dotenv::dotenv().ok();

    let token = std::env::var("DISCORD_TOKEN").context(
        "Missing DISCORD_TOKEN environment variable! Create a .env file with your bot token.",
    )?;
    let config = LevelingConfig::from_env().context("Invalid leveling configuration")?;
    let store_kind = std::env::var("LEVELING_STORE").unwrap_or_else(|_| "sqlite".to_string());
    let db_path =
        std::env::var("LEVELING_DB_PATH").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());
    let announce_channel = match std::env::var("LEVEL_UP_CHANNEL_ID") {
        Ok(raw) => Some(
            raw.trim()
                .parse::<u64>()
                .context("LEVEL_UP_CHANNEL_ID must be a channel id")?,
        ),
        Err(_) => None,
    };

    // ========================================================================
    // DEPENDENCY INJECTION
    // ========================================================================
    // The composition root: stores, Discord adapters and services meet here.

    let store = Arc::new(
        LevelingStore::open(&store_kind, &db_path)
            .await
            .context("Failed to initialize leveling store")?,
    );

    // Role and announcement calls go through their own Http client, so the
    // engine exists before the gateway connects.
    let http = Arc::new(serenity::Http::new(&token));
    let engine = LevelingEngine::new(
        Arc::clone(&store),
        SerenityRoleProvisioner::new(Arc::clone(&http)),
        DiscordLevelAnnouncer::new(Arc::clone(&http), announce_channel),
        &config,
    )
    .context("Failed to build leveling engine")?;

    let leaderboard = LeaderboardService::new(Arc::clone(&store), engine.curve().clone());
    let data = Data {
        leveling: Arc::new(engine),
        leaderboard: Arc::new(leaderboard),
        backfills: DashMap::new(),
    };

    tracing::info!(
        store = %store_kind,
        cooldown_seconds = config.cooldown_seconds,
        roles_enabled = config.roles_enabled,
        announce_channel = ?announce_channel,
        "Leveling configured"
    );

    // ========================================================================
    // DISCORD FRAMEWORK SETUP
    // ========================================================================

    let intents = serenity::GatewayIntents::GUILD_MESSAGES
        | serenity::GatewayIntents::MESSAGE_CONTENT // Required for the length bonus
        | serenity::GatewayIntents::GUILDS
        | serenity::GatewayIntents::GUILD_MEMBERS;

    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: vec![
                discord::commands::leveling::rank(),
                discord::commands::leveling::level(),
                discord::commands::leveling::leaderboard(),
                discord::commands::leveling::levelstats(),
                discord::commands::leveling::xpadmin(),
                discord::commands::leveling::syncroles(),
            ],
            event_handler: |ctx, event, framework, data| {
                Box::pin(event_handler(ctx, event, framework, data))
            },
            ..Default::default()
        })
        .setup(|ctx, ready, framework| {
            Box::pin(async move {
                tracing::info!(user = %ready.user.name, "Bot is starting up");

                // Global registration can take up to an hour to propagate.
                poise::builtins::register_globally(ctx, &framework.options().commands).await?;

                tracing::info!("Commands registered, bot is ready");
                Ok(data)
            })
        })
        .build();

    let mut client = serenity::ClientBuilder::new(&token, intents)
        .framework(framework)
        .await
        .context("Error creating client")?;

    client.start().await.context("Error running bot")?;
    Ok(())
}
