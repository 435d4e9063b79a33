//! Layered tool-visibility evaluation

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, warn};

use super::groups::{GroupTable, FULL_PROFILE, LEAF_DENY_GROUP, SUBAGENT_DENY_GROUP};
use super::layers::PolicyLayer;
use crate::tool::{ToolManager, ToolView};

/// Who is asking for a tool set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallerKind {
    /// A top-level agent run
    Agent,
    /// A subagent that may still spawn
    Subagent,
    /// A subagent at the maximum spawn depth
    LeafSubagent,
}

impl CallerKind {
    /// Caller kind for a task running at `depth` under `max_depth`
    pub fn for_depth(depth: u32, max_depth: u32) -> Self {
        if depth == 0 {
            Self::Agent
        } else if depth >= max_depth {
            Self::LeafSubagent
        } else {
            Self::Subagent
        }
    }

    fn extra_layers(self) -> Vec<PolicyLayer> {
        match self {
            Self::Agent => vec![],
            Self::Subagent => vec![PolicyLayer::deny_group(SUBAGENT_DENY_GROUP)],
            Self::LeafSubagent => vec![
                PolicyLayer::deny_group(SUBAGENT_DENY_GROUP),
                PolicyLayer::deny_group(LEAF_DENY_GROUP),
            ],
        }
    }
}

/// Stateless policy evaluator over a static group table
#[derive(Debug, Clone, Default)]
pub struct PolicyEngine {
    groups: Arc<GroupTable>,
}

impl PolicyEngine {
    pub fn new(groups: GroupTable) -> Self {
        Self {
            groups: Arc::new(groups),
        }
    }

    pub fn groups(&self) -> &GroupTable {
        &self.groups
    }

    /// Apply `layers` in order to `all_tools` and return the visible names
    pub fn evaluate(&self, all_tools: &BTreeSet<String>, layers: &[PolicyLayer]) -> BTreeSet<String> {
        let mut allowed = all_tools.clone();

        for layer in layers {
            match layer {
                PolicyLayer::Profile(name) => {
                    if name == FULL_PROFILE {
                        continue;
                    }
                    match self.groups.profile(name) {
                        Some(members) => {
                            let members = self.groups.expand(members, all_tools);
                            allowed.retain(|t| members.contains(t));
                        }
                        None => {
                            warn!(profile = %name, "Unknown tool profile, using full");
                        }
                    }
                }
                PolicyLayer::Allow(list) => {
                    if list.is_empty() {
                        continue;
                    }
                    let members = self.groups.expand(list, all_tools);
                    allowed.retain(|t| members.contains(t));
                }
                PolicyLayer::Deny(list) => {
                    let members = self.groups.expand(list, all_tools);
                    allowed.retain(|t| !members.contains(t));
                }
                PolicyLayer::AlsoAllow(list) => {
                    let members = self.groups.expand(list, all_tools);
                    allowed.extend(members.into_iter().filter(|t| all_tools.contains(t)));
                }
            }
        }

        allowed
    }

    /// Build the per-task tool view for `caller`.
    ///
    /// Aliases in the layers are resolved to canonical names first, then the
    /// caller's fixed deny sets are appended after the configured layers.
    pub fn filter_tools(
        &self,
        registry: &Arc<ToolManager>,
        layers: &[PolicyLayer],
        caller: CallerKind,
    ) -> ToolView {
        let universe = registry.tool_names();
        let mut resolved: Vec<PolicyLayer> = layers
            .iter()
            .cloned()
            .map(|l| l.map_names(|n| registry.resolve(&n).to_string()))
            .collect();
        resolved.extend(caller.extra_layers());

        let allowed = self.evaluate(&universe, &resolved);
        debug!(
            caller = ?caller,
            visible = allowed.len(),
            total = universe.len(),
            "Filtered tool set"
        );
        registry.view(allowed)
    }
}
