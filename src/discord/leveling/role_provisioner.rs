// Discord-backed RoleProvisioner: turns core role requests into HTTP calls.

use crate::core::leveling::{GuildRole, RoleError, RoleProvisioner};
use async_trait::async_trait;
use poise::serenity_prelude as serenity;
use std::sync::Arc;
use std::time::Duration;

const AUDIT_REASON: &str = "Level role sync";

/// Fallback when Discord answers 429 without us seeing a retry hint.
/// serenity's own ratelimiter normally absorbs these before they reach us.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(2);

pub struct SerenityRoleProvisioner {
    http: Arc<serenity::Http>,
}

impl SerenityRoleProvisioner {
    pub fn new(http: Arc<serenity::Http>) -> Self {
        Self { http }
    }
}

fn classify_status(status: u16, detail: String) -> RoleError {
    match status {
        404 => RoleError::NotFound,
        401 | 403 => RoleError::PermissionDenied(detail),
        429 => RoleError::RateLimited {
            retry_after: DEFAULT_RETRY_AFTER,
        },
        _ => RoleError::Unavailable(detail),
    }
}

fn map_err(err: serenity::Error) -> RoleError {
    match &err {
        serenity::Error::Http(serenity::http::HttpError::UnsuccessfulRequest(response)) => {
            classify_status(response.status_code.as_u16(), response.error.message.clone())
        }
        _ => RoleError::Unavailable(err.to_string()),
    }
}

#[async_trait]
impl RoleProvisioner for SerenityRoleProvisioner {
    async fn guild_roles(&self, guild_id: u64) -> Result<Vec<GuildRole>, RoleError> {
        let roles = serenity::GuildId::new(guild_id)
            .roles(&self.http)
            .await
            .map_err(map_err)?;
        Ok(roles
            .into_values()
            .map(|role| GuildRole {
                id: role.id.get(),
                name: role.name,
            })
            .collect())
    }

    async fn create_role(
        &self,
        guild_id: u64,
        name: &str,
        color: u32,
    ) -> Result<GuildRole, RoleError> {
        let builder = serenity::EditRole::new()
            .name(name)
            .colour(serenity::Colour::new(color))
            .hoist(false)
            .mentionable(false)
            .audit_log_reason(AUDIT_REASON);
        let role = serenity::GuildId::new(guild_id)
            .create_role(&*self.http, builder)
            .await
            .map_err(map_err)?;
        tracing::info!(guild_id, role_id = role.id.get(), name, "Created level role");
        Ok(GuildRole {
            id: role.id.get(),
            name: role.name,
        })
    }

    async fn rename_role(
        &self,
        guild_id: u64,
        role_id: u64,
        name: &str,
        color: u32,
    ) -> Result<(), RoleError> {
        let builder = serenity::EditRole::new()
            .name(name)
            .colour(serenity::Colour::new(color))
            .audit_log_reason(AUDIT_REASON);
        serenity::GuildId::new(guild_id)
            .edit_role(&*self.http, serenity::RoleId::new(role_id), builder)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn add_role_to_member(
        &self,
        guild_id: u64,
        user_id: u64,
        role_id: u64,
    ) -> Result<(), RoleError> {
        self.http
            .add_member_role(
                serenity::GuildId::new(guild_id),
                serenity::UserId::new(user_id),
                serenity::RoleId::new(role_id),
                Some(AUDIT_REASON),
            )
            .await
            .map_err(map_err)
    }

    async fn remove_role_from_member(
        &self,
        guild_id: u64,
        user_id: u64,
        role_id: u64,
    ) -> Result<(), RoleError> {
        self.http
            .remove_member_role(
                serenity::GuildId::new(guild_id),
                serenity::UserId::new(user_id),
                serenity::RoleId::new(role_id),
                Some(AUDIT_REASON),
            )
            .await
            .map_err(map_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_statuses_map_to_role_errors() {
        assert_eq!(classify_status(404, "Unknown Role".into()), RoleError::NotFound);
        assert!(matches!(
            classify_status(403, "Missing Permissions".into()),
            RoleError::PermissionDenied(msg) if msg == "Missing Permissions"
        ));
        assert_eq!(
            classify_status(429, String::new()),
            RoleError::RateLimited {
                retry_after: DEFAULT_RETRY_AFTER
            }
        );
        assert!(matches!(
            classify_status(502, "Bad Gateway".into()),
            RoleError::Unavailable(_)
        ));
    }
}
