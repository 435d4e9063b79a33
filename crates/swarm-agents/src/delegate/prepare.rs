//! Delegation resolution: identity, target, link, user rules, team attribution

use tracing::debug;

use swarm_core::store::{AgentRecord, LinkSettings};
use swarm_core::RunContext;

use super::{DelegateManager, DelegateOptions};
use crate::error::{AgentError, Result};

/// Everything admission needs, resolved from the stores
#[derive(Debug, Clone)]
pub(crate) struct Prepared {
    pub source: AgentRecord,
    pub target: AgentRecord,
    pub user_id: Option<String>,
    pub team_task_id: Option<String>,
    pub link_max: usize,
    pub target_max: usize,
}

/// Configured limit, or `default` when unset or not positive
pub(crate) fn resolve_limit(configured: Option<i64>, default: usize) -> usize {
    match configured {
        Some(n) if n > 0 => n as usize,
        _ => default,
    }
}

/// Deny wins over allow; a non-empty allow-list is exclusive and rejects
/// callers without a user id.
pub(crate) fn check_user(
    settings: &LinkSettings,
    user_id: Option<&str>,
    from: &str,
    to: &str,
) -> Result<()> {
    if let Some(user) = user_id {
        if settings.user_deny.iter().any(|u| u == user) {
            return Err(AgentError::UserDenied {
                user_id: user.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }
    }

    if !settings.user_allow.is_empty() {
        let allowed = user_id.is_some_and(|user| settings.user_allow.iter().any(|u| u == user));
        if !allowed {
            return Err(AgentError::UserNotAllowed {
                user_id: user_id.unwrap_or("unknown").to_string(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }
    }

    Ok(())
}

impl DelegateManager {
    /// Resolve and authorize a delegation. Capacity is checked later, at
    /// registry insert.
    pub(crate) async fn prepare_delegation(
        &self,
        ctx: &RunContext,
        opts: &DelegateOptions,
    ) -> Result<Prepared> {
        let identity = ctx.agent.as_ref().ok_or(AgentError::NoAgentContext)?;

        let source = match self.agents.get_agent(&identity.id).await? {
            Some(agent) => agent,
            None => self
                .agents
                .get_agent_by_key(&identity.key)
                .await?
                .ok_or_else(|| AgentError::AgentNotFound(identity.key.clone()))?,
        };

        let target_key = opts.target_agent_key.trim();
        let target = self
            .agents
            .get_agent_by_key(target_key)
            .await?
            .ok_or_else(|| AgentError::AgentNotFound(target_key.to_string()))?;

        if source.id == target.id {
            return Err(AgentError::SelfDelegation(source.key.clone()));
        }

        let link = match self.links.get_link(&source.id, &target.id).await? {
            Some(link) => link,
            None => {
                return Err(AgentError::NoLink {
                    from: source.key.clone(),
                    to: target.key.clone(),
                    hint: self.available_targets_hint(&source).await,
                });
            }
        };

        let user_id = ctx.origin.user_id.clone();
        check_user(&link.settings, user_id.as_deref(), &source.key, &target.key)?;

        let team_task_id = opts
            .team_task_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string);
        if team_task_id.is_none() {
            if let Some(teams) = &self.teams {
                if let Some(team) = teams.team_for_agent(&source.id).await? {
                    return Err(AgentError::TeamTaskRequired {
                        agent: source.key.clone(),
                        team: team.name,
                    });
                }
            }
        }

        let link_max = resolve_limit(
            Some(link.max_concurrent),
            self.config.default_link_max_concurrent,
        );
        let target_max = resolve_limit(target.max_load, self.config.default_max_load);

        debug!(
            source = %source.key,
            target = %target.key,
            link_max,
            target_max,
            "Delegation resolved"
        );

        Ok(Prepared {
            source,
            target,
            user_id,
            team_task_id,
            link_max,
            target_max,
        })
    }

    /// Lists the keys `source` can delegate to, for the no-link message
    async fn available_targets_hint(&self, source: &AgentRecord) -> String {
        let links = match self.links.links_from(&source.id).await {
            Ok(links) => links,
            Err(e) => {
                debug!(source = %source.key, "Failed to list delegation links: {}", e);
                Vec::new()
            }
        };

        let mut keys = Vec::new();
        for link in links {
            if let Ok(Some(agent)) = self.agents.get_agent(&link.target_agent_id).await {
                keys.push(agent.key);
            }
        }

        if keys.is_empty() {
            "This agent has no delegation targets configured. Handle the task directly.".to_string()
        } else {
            keys.sort();
            format!(
                "Available targets: {}. Pick one of these or handle the task directly.",
                keys.join(", ")
            )
        }
    }
}
