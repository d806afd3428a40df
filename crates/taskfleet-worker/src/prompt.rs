//! Instruction building for agent sessions.
//!
//! User prompts are sanitized before they reach a subprocess argument:
//! markup-like tags are stripped, instruction-override keywords are removed
//! as whole words (case-insensitive), and whitespace is collapsed. Fixed
//! operational context always comes first and the result is capped at
//! [`MAX_INSTRUCTION_CHARS`], so a long prompt can only lose its own tail.

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

use taskfleet_core::{IssueRef, TaskId};

/// Hard cap on the instruction handed to the agent.
pub const MAX_INSTRUCTION_CHARS: usize = 4000;

/// Cap on an issue title inside the operational context.
const MAX_ISSUE_TITLE_CHARS: usize = 200;

/// Words commonly used to override an agent's standing instructions.
const DENYLIST: &[&str] = &[
    "ignore",
    "disregard",
    "override",
    "forget",
    "jailbreak",
    "bypass",
    "sudo",
];

/// Inputs for one task's instruction.
#[derive(Debug, Clone)]
pub struct PromptContext<'a> {
    pub task_id: &'a TaskId,
    pub workspace: &'a Path,
    pub machine: &'a str,
    pub issue: Option<&'a IssueRef>,
}

/// Build the full, bounded instruction for a task.
pub fn build_instruction(ctx: &PromptContext<'_>, raw_prompt: &str) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "You are an autonomous coding agent working on task {} on machine {}.\n",
        ctx.task_id, ctx.machine
    ));
    out.push_str(&format!("Workspace: {}\n", ctx.workspace.display()));
    out.push_str("Work only inside this workspace and commit your changes to the current branch.\n");

    if let Some(issue) = ctx.issue {
        let title = issue
            .title
            .as_deref()
            .map(|t| truncate_chars(&sanitize(t), MAX_ISSUE_TITLE_CHARS))
            .unwrap_or_default();
        let issue_id = sanitize(&issue.id);
        out.push_str("\nMANDATORY FIRST ACTION: before doing anything else, open issue ");
        out.push_str(&issue_id);
        if !title.is_empty() {
            out.push_str(&format!(" (\"{}\")", title));
        }
        out.push_str(" in the issue tracker, mark it in progress and reference it in every commit.\n");
    }

    out.push_str("\nTask:\n");
    out.push_str(&sanitize(raw_prompt));

    truncate_chars(&out, MAX_INSTRUCTION_CHARS)
}

/// `<tag ...>`, `</tag>` and `<!...>` constructs. A lone `<` (as in
/// `a < b`) is not a tag.
static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<[a-z/!][^<>]*>").expect("tag pattern is valid"));

/// Any denylisted word, whole-word and case-insensitive.
static DENYLISTED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?i)\b(?:{})\b", DENYLIST.join("|"))).expect("denylist pattern is valid")
});

/// Strip tags and denylisted words, then collapse whitespace.
pub fn sanitize(input: &str) -> String {
    // Tags become a space to keep the words on either side apart.
    let without_tags = TAG.replace_all(input, " ");
    let without_keywords = DENYLISTED.replace_all(&without_tags, "");
    without_keywords.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}
