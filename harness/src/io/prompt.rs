//! Prompt rendering for backend turns.
//!
//! A first attempt gets the implement prompt; any attempt that follows a known
//! failure gets the retry prompt carrying the tail of that failure's output.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::task::Task;

const IMPLEMENT_TEMPLATE: &str = include_str!("prompts/implement.md");
const RETRY_TEMPLATE: &str = include_str!("prompts/retry.md");

/// Failure output kept in a retry prompt.
pub const FAILURE_MAX_LINES: usize = 100;
pub const FAILURE_MAX_CHARS: usize = 4096;

#[derive(Debug, Serialize)]
struct TaskContext<'a> {
    id: &'a str,
    title: &'a str,
    description: &'a str,
    acceptance: Vec<&'a str>,
    verify: Vec<&'a str>,
}

impl<'a> TaskContext<'a> {
    fn from_task(task: &'a Task) -> Self {
        Self {
            id: &task.id,
            title: task.title.trim(),
            description: task.description.trim(),
            acceptance: non_empty(&task.acceptance),
            verify: non_empty(&task.verify),
        }
    }
}

fn non_empty(items: &[String]) -> Vec<&str> {
    items
        .iter()
        .map(|item| item.trim())
        .filter(|item| !item.is_empty())
        .collect()
}

fn engine() -> Result<Environment<'static>> {
    let mut env = Environment::new();
    env.add_template("implement", IMPLEMENT_TEMPLATE)
        .context("load implement template")?;
    env.add_template("retry", RETRY_TEMPLATE)
        .context("load retry template")?;
    Ok(env)
}

/// Prompt for the first attempt at a task.
pub fn render_implement(task: &Task) -> Result<String> {
    let env = engine()?;
    let rendered = env
        .get_template("implement")?
        .render(context! { task => TaskContext::from_task(task) })
        .context("render implement prompt")?;
    Ok(finish(rendered))
}

/// Prompt for an attempt following a failure.
pub fn render_retry(task: &Task, rotation: u32, attempt: u32, failure: &str) -> Result<String> {
    let env = engine()?;
    let rendered = env
        .get_template("retry")?
        .render(context! {
            task => TaskContext::from_task(task),
            rotation => rotation,
            attempt => attempt,
            fresh_rotation => rotation > 1 && attempt == 1,
            failure => trim_failure_output(failure),
        })
        .context("render retry prompt")?;
    Ok(finish(rendered))
}

/// Keep the last [`FAILURE_MAX_LINES`] lines, then the last
/// [`FAILURE_MAX_CHARS`] bytes (on a char boundary, prefixed with `...`).
pub fn trim_failure_output(out: &str) -> String {
    let out = out.trim_end();
    let lines: Vec<&str> = out.split('\n').collect();
    let mut tail = if lines.len() > FAILURE_MAX_LINES {
        lines[lines.len() - FAILURE_MAX_LINES..].join("\n")
    } else {
        out.to_string()
    };
    if tail.len() > FAILURE_MAX_CHARS {
        let mut cut = tail.len() - FAILURE_MAX_CHARS;
        while !tail.is_char_boundary(cut) {
            cut += 1;
        }
        tail = format!("...{}", &tail[cut..]);
    }
    tail
}

fn finish(mut rendered: String) -> String {
    let trimmed = rendered.trim_end().len();
    rendered.truncate(trimmed);
    rendered.push('\n');
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::task;

    fn sample() -> Task {
        let mut t = task("T7");
        t.title = "Add parser".to_string();
        t.description = "Parse config files.".to_string();
        t.acceptance = vec!["handles empty input".to_string(), " ".to_string()];
        t.verify = vec!["cargo test".to_string()];
        t
    }

    #[test]
    fn implement_prompt_lists_task_sections() {
        let prompt = render_implement(&sample()).expect("render");
        assert!(prompt.contains("## Task: Add parser (T7)"));
        assert!(prompt.contains("### Description\nParse config files."));
        assert!(prompt.contains("- handles empty input\n"));
        assert!(prompt.contains("- `cargo test`"));
        assert!(!prompt.contains("Failure Output"));
    }

    #[test]
    fn implement_prompt_skips_empty_sections() {
        let mut t = sample();
        t.acceptance.clear();
        t.verify.clear();
        let prompt = render_implement(&t).expect("render");
        assert!(!prompt.contains("Acceptance Criteria"));
        assert!(!prompt.contains("Verification Commands"));
    }

    #[test]
    fn retry_prompt_carries_failure_and_rotation_hint() {
        let prompt = render_retry(&sample(), 1, 2, "error: boom\n").expect("render");
        assert!(prompt.contains("## Retry Task: Add parser (T7), rotation 1 attempt 2"));
        assert!(prompt.contains("```\nerror: boom\n```"));
        assert!(!prompt.contains("reset to the last"));

        let fresh = render_retry(&sample(), 2, 1, "error").expect("render");
        assert!(fresh.contains("reset to the last"));
    }

    #[test]
    fn failure_output_keeps_the_tail() {
        let long: String = (0..150).map(|i| format!("line {i}\n")).collect();
        let trimmed = trim_failure_output(&long);
        assert!(trimmed.starts_with("line 50\n"));
        assert!(trimmed.ends_with("line 149"));

        let wide = "x".repeat(5000);
        let trimmed = trim_failure_output(&wide);
        assert_eq!(trimmed.len(), FAILURE_MAX_CHARS + 3);
        assert!(trimmed.starts_with("..."));
    }

    #[test]
    fn failure_trim_respects_char_boundaries() {
        let wide = "é".repeat(3000);
        let trimmed = trim_failure_output(&wide);
        assert!(trimmed.starts_with("..."));
        assert!(trimmed.len() <= FAILURE_MAX_CHARS + 3);
    }
}
