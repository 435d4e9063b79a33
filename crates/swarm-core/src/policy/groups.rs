//! Static tool group and profile tables

use std::collections::{BTreeSet, HashMap};

/// Prefix marking a group reference inside a policy list
pub const GROUP_PREFIX: &str = "group:";

/// Tools a subagent never sees
pub const SUBAGENT_DENY_GROUP: &str = "group:subagent_deny";

/// Additional tools hidden from subagents at the maximum spawn depth
pub const LEAF_DENY_GROUP: &str = "group:leaf_deny";

/// Profile that leaves the tool set untouched
pub const FULL_PROFILE: &str = "full";

/// Wildcard entry matching the whole tool universe
pub const WILDCARD: &str = "*";

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// Named groups and profiles used to expand policy lists
#[derive(Debug, Clone)]
pub struct GroupTable {
    groups: HashMap<String, Vec<String>>,
    profiles: HashMap<String, Vec<String>>,
}

impl GroupTable {
    /// Empty table (no groups, no profiles besides `full`)
    pub fn empty() -> Self {
        Self {
            groups: HashMap::new(),
            profiles: HashMap::new(),
        }
    }

    /// Built-in groups and profiles
    pub fn builtin() -> Self {
        Self::empty()
            .with_group("group:fs", &["read_file", "write_file", "edit_file", "list_files"])
            .with_group("group:runtime", &["exec", "process"])
            .with_group("group:web", &["web_search", "web_fetch"])
            .with_group("group:memory", &["memory_search", "memory_get"])
            .with_group(
                "group:sessions",
                &[
                    "sessions_list",
                    "sessions_history",
                    "sessions_send",
                    "session_status",
                    "spawn",
                    "subagents",
                ],
            )
            .with_group("group:delegation", &["delegate"])
            .with_group("group:messaging", &["message"])
            .with_group(
                SUBAGENT_DENY_GROUP,
                &[
                    "gateway",
                    "agents_list",
                    "session_status",
                    "cron",
                    "memory_search",
                    "memory_get",
                    "sessions_send",
                ],
            )
            .with_group(
                LEAF_DENY_GROUP,
                &["sessions_list", "sessions_history", "spawn", "subagents"],
            )
            .with_profile("minimal", &["session_status"])
            .with_profile(
                "coding",
                &[
                    "group:fs",
                    "group:runtime",
                    "group:sessions",
                    "group:memory",
                    "group:delegation",
                ],
            )
            .with_profile(
                "messaging",
                &[
                    "group:messaging",
                    "sessions_list",
                    "sessions_history",
                    "sessions_send",
                    "session_status",
                ],
            )
    }

    pub fn with_group(mut self, name: &str, members: &[&str]) -> Self {
        self.groups.insert(name.to_string(), names(members));
        self
    }

    pub fn with_profile(mut self, name: &str, members: &[&str]) -> Self {
        self.profiles.insert(name.to_string(), names(members));
        self
    }

    /// Members of a profile; `None` for unknown names. `full` has no member list.
    pub fn profile(&self, name: &str) -> Option<&[String]> {
        self.profiles.get(name).map(Vec::as_slice)
    }

    pub fn has_profile(&self, name: &str) -> bool {
        name == FULL_PROFILE || self.profiles.contains_key(name)
    }

    /// Expand a policy list into concrete tool names.
    ///
    /// Groups may reference other groups; `*` expands to `universe`.
    /// Names that are not groups pass through unchanged, whether or not the
    /// tool exists.
    pub fn expand(&self, entries: &[String], universe: &BTreeSet<String>) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        let mut visiting = Vec::new();
        for entry in entries {
            self.expand_into(entry, universe, &mut out, &mut visiting);
        }
        out
    }

    fn expand_into(
        &self,
        entry: &str,
        universe: &BTreeSet<String>,
        out: &mut BTreeSet<String>,
        visiting: &mut Vec<String>,
    ) {
        if entry == WILDCARD {
            out.extend(universe.iter().cloned());
            return;
        }
        if !entry.starts_with(GROUP_PREFIX) {
            out.insert(entry.to_string());
            return;
        }
        // Cycle guard
        if visiting.iter().any(|v| v == entry) {
            return;
        }
        if let Some(members) = self.groups.get(entry) {
            visiting.push(entry.to_string());
            for member in members {
                self.expand_into(member, universe, out, visiting);
            }
            visiting.pop();
        }
    }
}

impl Default for GroupTable {
    fn default() -> Self {
        Self::builtin()
    }
}
