//! Typed policy layers and the canonical layer order

use crate::config::ToolPolicyConfig;

/// One stage of tool-visibility evaluation.
///
/// Layers are applied strictly in list order; allow, deny and also-allow do
/// not commute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyLayer {
    /// Intersect with a named profile's members (`full` keeps everything)
    Profile(String),
    /// Intersect with the listed tools; an empty list is a no-op
    Allow(Vec<String>),
    /// Remove the listed tools
    Deny(Vec<String>),
    /// Re-add the listed tools if they exist in the universe
    AlsoAllow(Vec<String>),
}

impl PolicyLayer {
    pub fn deny_group(group: &str) -> Self {
        Self::Deny(vec![group.to_string()])
    }

    /// Apply `f` to every tool name in the layer
    pub fn map_names(self, f: impl Fn(String) -> String) -> Self {
        match self {
            Self::Profile(name) => Self::Profile(name),
            Self::Allow(list) => Self::Allow(list.into_iter().map(f).collect()),
            Self::Deny(list) => Self::Deny(list.into_iter().map(f).collect()),
            Self::AlsoAllow(list) => Self::AlsoAllow(list.into_iter().map(f).collect()),
        }
    }
}

/// Policy sources for one invocation
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyInputs<'a> {
    /// Global policy from configuration
    pub global: Option<&'a ToolPolicyConfig>,
    /// Policy stored on the calling agent
    pub agent: Option<&'a ToolPolicyConfig>,
    /// Active provider name, selects `by_provider` entries
    pub provider: Option<&'a str>,
    /// Allow-list attached to the originating chat group
    pub group_allow: Option<&'a [String]>,
}

impl<'a> PolicyInputs<'a> {
    pub fn global(global: &'a ToolPolicyConfig) -> Self {
        Self {
            global: Some(global),
            ..Default::default()
        }
    }

    /// Canonical layer list:
    /// profile -> allow (global, global/provider, agent, agent/provider, group)
    /// -> deny (global, agent) -> also-allow (global, agent).
    pub fn layers(&self) -> Vec<PolicyLayer> {
        let mut layers = Vec::new();

        let profile = self
            .agent
            .and_then(|a| a.profile.clone())
            .or_else(|| self.global.and_then(|g| g.profile.clone()));
        if let Some(profile) = profile {
            layers.push(PolicyLayer::Profile(profile));
        }

        let provider_allow = |policy: Option<&ToolPolicyConfig>| -> Vec<String> {
            match (policy, self.provider) {
                (Some(p), Some(provider)) => p
                    .by_provider
                    .get(provider)
                    .map(|pp| pp.allow.clone())
                    .unwrap_or_default(),
                _ => vec![],
            }
        };

        let allows = [
            self.global.map(|g| g.allow.clone()).unwrap_or_default(),
            provider_allow(self.global),
            self.agent.map(|a| a.allow.clone()).unwrap_or_default(),
            provider_allow(self.agent),
            self.group_allow.map(<[String]>::to_vec).unwrap_or_default(),
        ];
        layers.extend(
            allows
                .into_iter()
                .filter(|l| !l.is_empty())
                .map(PolicyLayer::Allow),
        );

        for policy in [self.global, self.agent].into_iter().flatten() {
            if !policy.deny.is_empty() {
                layers.push(PolicyLayer::Deny(policy.deny.clone()));
            }
        }
        for policy in [self.global, self.agent].into_iter().flatten() {
            if !policy.also_allow.is_empty() {
                layers.push(PolicyLayer::AlsoAllow(policy.also_allow.clone()));
            }
        }

        layers
    }
}
