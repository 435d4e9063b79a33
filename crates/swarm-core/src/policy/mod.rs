//! Tool access policy
//!
//! Decides which registered tools a caller may see. Evaluation is a pure
//! function over the tool universe and an ordered list of [`PolicyLayer`]s;
//! group and profile names are expanded from a static [`GroupTable`].

mod engine;
mod groups;
mod layers;

pub use engine::{CallerKind, PolicyEngine};
pub use groups::{GroupTable, LEAF_DENY_GROUP, SUBAGENT_DENY_GROUP};
pub use layers::{PolicyInputs, PolicyLayer};

/// Default alias table: shell-style names mapped to canonical tool names
pub const DEFAULT_ALIASES: &[(&str, &str)] = &[
    ("bash", "exec"),
    ("read", "read_file"),
    ("write", "write_file"),
    ("edit", "edit_file"),
];
