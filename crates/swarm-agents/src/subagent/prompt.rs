//! System prompt for subagent runs

/// Inputs that shape the subagent's role description
#[derive(Debug, Clone)]
pub struct PromptParams<'a> {
    pub label: &'a str,
    /// Who spawned this subagent
    pub parent_label: &'a str,
    pub depth: u32,
    pub max_depth: u32,
}

impl PromptParams<'_> {
    pub fn can_spawn(&self) -> bool {
        self.depth < self.max_depth
    }
}

pub fn build_system_prompt(params: &PromptParams<'_>) -> String {
    let mut prompt = format!(
        "# Subagent\n\n\
         You are a subagent named \"{}\", spawned by {} to complete one focused task.\n\n\
         ## Rules\n\
         - Stay on the assigned task. Do not start unrelated work.\n\
         - You are not talking to the end user. Your final answer is returned to {}.\n\
         - Finish with a clear, self-contained answer: what you did, what you found, \
         and anything left unresolved.\n\
         - Use the available tools when they help. If a tool fails, adapt or report it.\n",
        params.label, params.parent_label, params.parent_label
    );

    prompt.push_str(&format!(
        "\n## Nesting\nDepth {} of {}. ",
        params.depth, params.max_depth
    ));
    if params.can_spawn() {
        prompt.push_str(
            "You may spawn further subagents for independent parts of the task, \
             but prefer doing the work yourself when it is small.\n",
        );
    } else {
        prompt.push_str("You cannot spawn further subagents. Complete the task yourself.\n");
    }

    prompt
}
