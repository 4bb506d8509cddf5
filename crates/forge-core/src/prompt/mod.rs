//! Prompt construction for agent invocations.
//!
//! Every builder is a pure function of the state and task, so a given
//! input always produces the same byte string. That matters for retries:
//! the truncated gate output embedded in a retry prompt must be stable
//! across runs.

use forge_state::{State, Task, TaskStatus};

/// Default character limit for gate output embedded in retry prompts.
pub const DEFAULT_TRUNCATE_LIMIT: usize = 4000;

/// Bound a command transcript for inclusion in a prompt.
///
/// Output at or under `limit` characters is used verbatim. Longer output
/// keeps the first and last 2/5 of the limit, joined by an explicit
/// marker, so both the invocation banner and the final error survive.
pub fn truncate_output(output: &str, limit: usize) -> String {
    let total = output.chars().count();
    if total <= limit {
        return output.to_string();
    }

    let keep = limit * 2 / 5;
    let head: String = output.chars().take(keep).collect();
    let tail: String = output.chars().skip(total - keep).collect();
    let dropped = total - 2 * keep;

    format!("{head}[... {dropped} chars truncated ...]{tail}")
}

/// The shared project context block: fixed header, project facts, gate
/// commands, and plan progress.
fn context_block(state: &State) -> String {
    let mut out = String::new();
    out.push_str("You are working in an existing codebase. Project context:\n\n");
    out.push_str(&format!("PROJECT: {}\n", state.project_name));

    if let Some(ref language) = state.settings.language {
        out.push_str(&format!("LANGUAGE: {language}\n"));
    }
    if !state.settings.frameworks.is_empty() {
        out.push_str(&format!(
            "FRAMEWORKS: {}\n",
            state.settings.frameworks.join(", ")
        ));
    }
    if let Some(ref test_command) = state.settings.test_command {
        out.push_str(&format!("TEST COMMAND: {test_command}\n"));
    }
    if let Some(ref build_command) = state.settings.build_command {
        out.push_str(&format!("BUILD COMMAND: {build_command}\n"));
    }

    let completed: Vec<&str> = state
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Done)
        .map(|t| t.title.as_str())
        .collect();
    if !completed.is_empty() {
        out.push_str("\nCOMPLETED TASKS:\n");
        for title in completed {
            out.push_str(&format!("- {title}\n"));
        }
    }

    let remaining: Vec<&str> = state
        .tasks
        .iter()
        .filter(|t| !t.status.is_terminal())
        .map(|t| t.title.as_str())
        .collect();
    if !remaining.is_empty() {
        out.push_str("\nREMAINING TASKS:\n");
        for title in remaining {
            out.push_str(&format!("- {title}\n"));
        }
    }

    if let Some(ref extra) = state.settings.extra_context {
        out.push('\n');
        out.push_str(extra);
        out.push('\n');
    }

    out
}

/// The task block: identity, description, acceptance criteria.
fn task_block(task: &Task) -> String {
    let mut out = String::new();
    out.push_str(&format!("TASK: {} — {}\n\n", task.id, task.title));
    out.push_str(&task.description);
    out.push('\n');

    if !task.acceptance_criteria.is_empty() {
        out.push_str("\nACCEPTANCE CRITERIA:\n");
        for criterion in &task.acceptance_criteria {
            out.push_str(&format!("- {criterion}\n"));
        }
    }

    out
}

/// The instructions block appended to every implementation prompt.
fn instructions_block(state: &State) -> String {
    let mut out = String::new();
    out.push_str("INSTRUCTIONS:\n");
    out.push_str("- Implement the task completely.\n");
    out.push_str("- Write tests where applicable.\n");
    if let Some(ref test_command) = state.settings.test_command {
        out.push_str(&format!(
            "- Run the test command before finishing: {test_command}\n"
        ));
    }
    if let Some(ref build_command) = state.settings.build_command {
        out.push_str(&format!(
            "- Run the build command before finishing: {build_command}\n"
        ));
    }
    out.push_str("- Do not modify files unrelated to this task.\n");
    out.push_str("- Follow the existing conventions of the codebase.\n");
    out
}

/// The prompt for a task's first attempt.
pub fn build_task_prompt(state: &State, task: &Task) -> String {
    format!(
        "{}\n{}\n{}",
        context_block(state),
        task_block(task),
        instructions_block(state)
    )
}

/// The system prompt: the implementer role plus the rules in assertive
/// form.
pub fn build_system_prompt(state: &State) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "You are an expert software engineer implementing a single, \
         well-scoped task in the {} codebase. ",
        state.project_name
    ));
    out.push_str(
        "You implement the task completely before finishing. You write \
         tests where applicable. You never modify files unrelated to the \
         task. You follow the conventions already present in the codebase.",
    );
    out
}

/// The prompt for attempt `attempt` (1-based) of `max_attempts`, carrying
/// the truncated output of the previous attempt's failed gate.
pub fn build_retry_prompt(
    state: &State,
    task: &Task,
    attempt: u32,
    max_attempts: u32,
    last_output: &str,
) -> String {
    let mut out = String::new();
    out.push_str(&context_block(state));
    out.push('\n');
    out.push_str(&task_block(task));
    out.push('\n');

    out.push_str(&format!(
        "This is attempt {attempt} of {max_attempts} for this task.\n"
    ));
    if attempt == max_attempts {
        out.push_str("THIS IS THE FINAL ATTEMPT.\n");
    }
    out.push_str("\nThe previous attempt failed verification. Command output:\n\n");
    out.push_str(&truncate_output(last_output, DEFAULT_TRUNCATE_LIMIT));
    out.push_str(
        "\n\nIdentify the root cause, make the minimal change that fixes \
         it, and re-run the tests before finishing.\n",
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_state::Complexity;

    fn sample_state() -> State {
        let mut state = State::new("shopd");
        state.settings.language = Some("go".to_string());
        state.settings.frameworks = vec!["gin".to_string(), "gorm".to_string()];
        state.settings.test_command = Some("go test ./...".to_string());
        state.settings.build_command = Some("go build ./...".to_string());
        state.add_task(
            "add session middleware",
            "wire session handling into the router",
            Complexity::Medium,
            vec!["requests carry a session".to_string()],
            vec![],
        );
        state
    }

    #[test]
    fn truncate_short_input_verbatim() {
        assert_eq!(truncate_output("short", 4000), "short");
    }

    #[test]
    fn truncate_exactly_at_limit_verbatim() {
        let s = "x".repeat(200);
        assert_eq!(truncate_output(&s, 200), s);
    }

    #[test]
    fn truncate_keeps_head_and_tail() {
        let s: String = ('a'..='z').cycle().take(1000).collect();
        let out = truncate_output(&s, 200);

        let keep = 200 * 2 / 5;
        let head: String = s.chars().take(keep).collect();
        let tail: String = s.chars().skip(1000 - keep).collect();
        assert!(out.starts_with(&head));
        assert!(out.ends_with(&tail));
        assert!(out.contains(&format!("[... {} chars truncated ...]", 1000 - 2 * keep)));
    }

    #[test]
    fn truncate_is_idempotent() {
        let s: String = "test output line\n".repeat(600);
        let once = truncate_output(&s, DEFAULT_TRUNCATE_LIMIT);
        let twice = truncate_output(&once, DEFAULT_TRUNCATE_LIMIT);
        assert_eq!(once, twice);
    }

    #[test]
    fn truncate_is_deterministic() {
        let s: String = "flaky? never.\n".repeat(500);
        assert_eq!(
            truncate_output(&s, DEFAULT_TRUNCATE_LIMIT),
            truncate_output(&s, DEFAULT_TRUNCATE_LIMIT)
        );
    }

    #[test]
    fn truncate_counts_characters_not_bytes() {
        // Multi-byte characters must not split; char counting guarantees it.
        let s = "é".repeat(500);
        let out = truncate_output(&s, 200);
        assert!(out.contains("chars truncated"));
        assert!(out.starts_with(&"é".repeat(80)));
    }

    #[test]
    fn task_prompt_contains_all_blocks() {
        let state = sample_state();
        let task = state.find_task("task-001").unwrap();
        let prompt = build_task_prompt(&state, task);

        assert!(prompt.contains("PROJECT: shopd"));
        assert!(prompt.contains("LANGUAGE: go"));
        assert!(prompt.contains("FRAMEWORKS: gin, gorm"));
        assert!(prompt.contains("TEST COMMAND: go test ./..."));
        assert!(prompt.contains("TASK: task-001 — add session middleware"));
        assert!(prompt.contains("ACCEPTANCE CRITERIA:"));
        assert!(prompt.contains("- requests carry a session"));
        assert!(prompt.contains("Run the test command before finishing: go test ./..."));
        assert!(prompt.contains("- Do not modify files unrelated to this task."));
    }

    #[test]
    fn task_prompt_lists_completed_and_remaining_titles() {
        let mut state = sample_state();
        let done = state.add_task("earlier work", "d", Complexity::Small, vec![], vec![]);
        state.find_task_mut(&done).unwrap().status = forge_state::TaskStatus::Done;

        let task = state.find_task("task-001").unwrap();
        let prompt = build_task_prompt(&state, task);
        assert!(prompt.contains("COMPLETED TASKS:\n- earlier work"));
        assert!(prompt.contains("REMAINING TASKS:\n- add session middleware"));
    }

    #[test]
    fn retry_prompt_carries_attempt_numbers_and_output() {
        let state = sample_state();
        let task = state.find_task("task-001").unwrap();
        let prompt = build_retry_prompt(&state, task, 2, 3, "TestAuth expected 200 got 401");

        assert!(prompt.contains("attempt 2 of 3"));
        assert!(!prompt.contains("FINAL ATTEMPT"));
        assert!(prompt.contains("TestAuth expected 200 got 401"));
        assert!(prompt.contains("Identify the root cause"));
    }

    #[test]
    fn retry_prompt_marks_final_attempt() {
        let state = sample_state();
        let task = state.find_task("task-001").unwrap();
        let prompt = build_retry_prompt(&state, task, 3, 3, "still failing");
        assert!(prompt.contains("THIS IS THE FINAL ATTEMPT."));
    }

    #[test]
    fn system_prompt_names_the_project() {
        let state = sample_state();
        let prompt = build_system_prompt(&state);
        assert!(prompt.contains("shopd"));
        assert!(prompt.contains("expert software engineer"));
    }

    #[test]
    fn prompts_are_stable_across_calls() {
        let state = sample_state();
        let task = state.find_task("task-001").unwrap();
        assert_eq!(
            build_task_prompt(&state, task),
            build_task_prompt(&state, task)
        );
    }
}
