//! Quality gate retry loop for delegation results
//!
//! Gates never hard-fail a delegation: a blocking gate that keeps failing
//! after its retries is logged and the last result is accepted.

use tracing::{debug, info, warn};

use swarm_core::gate::{GateSpec, HookEvaluator, HookInput, DELEGATION_COMPLETED};
use swarm_core::runner::{AgentRunner, RunOutput};

use super::TargetRun;

/// Message sent to the target agent when a blocking gate rejects its result
pub fn feedback_message(gate: &GateSpec, feedback: &str, task: &str) -> String {
    let feedback = if feedback.trim().is_empty() {
        "(no feedback given)"
    } else {
        feedback.trim()
    };
    format!(
        "[Quality Gate Feedback]\n\
         Your previous result did not pass the '{}' quality check.\n\n\
         Feedback:\n{}\n\n\
         Original task:\n{}\n\n\
         Revise your work to address the feedback and reply with the complete revised result.",
        gate.evaluator, feedback, task
    )
}

/// Run every gate configured for the delegation-completed event over
/// `output`, re-running the target on blocking failures.
///
/// Returns the accepted output; `iterations` is summed over every run.
pub(crate) async fn apply_quality_gates(
    evaluator: &dyn HookEvaluator,
    runner: &dyn AgentRunner,
    run: &TargetRun<'_>,
    mut output: RunOutput,
) -> RunOutput {
    let task = run.task;
    let gates = run
        .prepared
        .source
        .quality_gates
        .iter()
        .filter(|g| g.matches(DELEGATION_COMPLETED));

    for gate in gates {
        let mut retries = 0u32;
        loop {
            let input = HookInput {
                event: DELEGATION_COMPLETED.to_string(),
                source_agent: task.source_agent_key.clone(),
                target_agent: task.target_agent_key.clone(),
                user_id: task.user_id.clone(),
                content: output.content.clone(),
                task: task.task.clone(),
            };

            let verdict = match evaluator.evaluate_single_hook(&run.ctx, gate, &input).await {
                Ok(verdict) => verdict,
                Err(e) => {
                    warn!(
                        delegation_id = %task.id,
                        gate = %gate.evaluator,
                        "Quality gate evaluator failed, skipping gate: {}",
                        e
                    );
                    break;
                }
            };

            if verdict.passed {
                debug!(delegation_id = %task.id, gate = %gate.evaluator, "Quality gate passed");
                break;
            }

            if !gate.block_on_failure {
                warn!(
                    delegation_id = %task.id,
                    gate = %gate.evaluator,
                    "Non-blocking quality gate failed: {}",
                    verdict.feedback
                );
                break;
            }

            if retries >= gate.max_retries {
                warn!(
                    delegation_id = %task.id,
                    gate = %gate.evaluator,
                    retries,
                    "Quality gate retries exhausted, accepting last result"
                );
                break;
            }

            retries += 1;
            info!(
                delegation_id = %task.id,
                gate = %gate.evaluator,
                attempt = retries,
                max_retries = gate.max_retries,
                "Quality gate failed, re-running target agent"
            );

            let message = feedback_message(gate, &verdict.feedback, &task.task);
            match run.invoke(runner, message).await {
                Ok(revised) => {
                    output = RunOutput {
                        content: revised.content,
                        iterations: output.iterations + revised.iterations,
                    };
                }
                Err(e) => {
                    warn!(
                        delegation_id = %task.id,
                        "Quality gate re-run failed, keeping previous result: {}",
                        e
                    );
                    break;
                }
            }
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feedback_message_embeds_feedback_and_task() {
        let gate = GateSpec::new(DELEGATION_COMPLETED, "command").blocking(1);
        let msg = feedback_message(&gate, "tests fail: 2 errors", "Fix the parser");
        assert!(msg.contains("'command' quality check"));
        assert!(msg.contains("tests fail: 2 errors"));
        assert!(msg.contains("Original task:\nFix the parser"));
    }

    #[test]
    fn test_feedback_message_without_feedback() {
        let gate = GateSpec::new(DELEGATION_COMPLETED, "agent");
        assert!(feedback_message(&gate, "  ", "t").contains("(no feedback given)"));
    }
}
