//! Prompt construction and naming helpers.

use crate::types::{Chunk, Id, Spec};

/// Maximum slug length used in spec branch names.
pub const BRANCH_SLUG_MAX: usize = 40;

/// Git subject lines are truncated to this length.
pub const COMMIT_SUBJECT_MAX: usize = 72;

/// Create a slug from a title: lowercase, alphanumeric, hyphen-separated.
pub fn slug(title: &str, max_len: usize) -> String {
    let slugged = title
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");

    let truncated: String = slugged.chars().take(max_len).collect();
    let trimmed = truncated.trim_end_matches('-');
    if trimmed.is_empty() {
        "spec".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Spec branch name: `spec/<slug(title, 40)>-<first 7 of id>`.
pub fn spec_branch_name(title: &str, spec_id: &Id) -> String {
    format!("spec/{}-{}", slug(title, BRANCH_SLUG_MAX), spec_id.short())
}

/// Commit message for a committed chunk:
/// `feat(<chunk-title>): <first line of output>`, subject capped at 72 chars.
pub fn commit_message(chunk_title: &str, output: &str) -> String {
    let first_line = output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("implement chunk");

    let subject = format!("feat({chunk_title}): {first_line}");
    if subject.chars().count() <= COMMIT_SUBJECT_MAX {
        return subject;
    }
    let mut truncated: String = subject.chars().take(COMMIT_SUBJECT_MAX - 3).collect();
    truncated.push_str("...");
    truncated
}

/// Build the executor prompt for a chunk.
pub fn build_chunk_prompt(spec: &Spec, chunk: &Chunk) -> String {
    format!(
        r#"You are implementing one task from the spec "{spec_title}".

Task: {chunk_title}

{description}

Constraints:
- Implement only this task. Avoid unrelated changes.
- Do not commit; the orchestrator commits on your behalf after review.
- If the task requires no file changes, say so explicitly and explain why.

When finished, summarise what you changed in one short paragraph."#,
        spec_title = spec.title,
        chunk_title = chunk.title,
        description = chunk.description,
    )
}

/// Build the reviewer prompt for a single chunk.
///
/// The response format section matches what `review::parse_verdict` accepts.
pub fn build_review_prompt(chunk: &Chunk) -> String {
    let output = chunk.output.as_deref().unwrap_or("(no output captured)");
    format!(
        r#"You are a senior engineer reviewing one implementation task.

## Task

Title: {title}

{description}

## Implementation output

{output}

## Response format (strict)

Respond with a single JSON object and nothing else:

{{"status": "pass" | "needs_fix" | "fail", "feedback": "<short reasoning>", "fixChunk": {{"title": "...", "description": "..."}}}}

- "pass": the work is correct and complete.
- "needs_fix": fixable issues remain; include a fixChunk describing the follow-up.
- "fail": the approach is wrong and should not be committed.
- Omit "fixChunk" unless status is "needs_fix"."#,
        title = chunk.title,
        description = chunk.description,
    )
}

/// Build the final-review prompt over the whole spec diff.
pub fn build_final_review_prompt(spec: &Spec, diff: &str) -> String {
    format!(
        r#"You are reviewing the complete change set for the spec "{title}".

## Spec

{content}

## Diff (base..HEAD)

{diff}

## Response format (strict)

Respond with a single JSON object and nothing else:

{{"status": "pass" | "needs_fix", "feedback": "<short reasoning>", "fixChunk": {{"title": "...", "description": "..."}}}}

Only request fixes for defects that block delivery; style nits pass."#,
        title = spec.title,
        content = spec.content,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChunkStatus, SpecStatus};
    use chrono::Utc;

    fn test_spec() -> Spec {
        Spec {
            id: Id::from_string("0193a1b2-aaaa-bbbb-cccc-ddddeeeeffff"),
            project_id: Id::new(),
            title: "Add Rate Limiting".to_string(),
            content: "# Rate limiting\n...".to_string(),
            status: SpecStatus::Ready,
            branch_name: None,
            pr_number: None,
            pr_url: None,
            version: 1,
            error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn test_chunk() -> Chunk {
        Chunk {
            id: Id::new(),
            spec_id: Id::from_string("s1"),
            title: "add-limiter".to_string(),
            description: "Implement a token bucket limiter.".to_string(),
            ordinal: 0,
            status: ChunkStatus::Pending,
            output: Some("Added limiter module.\nDetails follow.".to_string()),
            error: None,
            review_status: None,
            review_feedback: None,
            depends_on: Vec::new(),
            parent_chunk_id: None,
            commit_hash: None,
            attempts: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn slug_normalises_titles() {
        assert_eq!(slug("Add Rate Limiting", 40), "add-rate-limiting");
        assert_eq!(slug("Fix Bug #123!", 40), "fix-bug-123");
        assert_eq!(slug("  spaces  ", 40), "spaces");
        assert_eq!(slug("", 40), "spec");
    }

    #[test]
    fn slug_respects_max_length() {
        let long = "a very long spec title that keeps going and going forever";
        let s = slug(long, 10);
        assert!(s.len() <= 10);
        assert!(!s.ends_with('-'));
    }

    #[test]
    fn branch_name_shape() {
        let spec = test_spec();
        let branch = spec_branch_name(&spec.title, &spec.id);
        assert_eq!(branch, "spec/add-rate-limiting-0193a1b");
    }

    #[test]
    fn commit_message_uses_first_output_line() {
        let msg = commit_message("add-limiter", "Added limiter module.\nMore detail.");
        assert_eq!(msg, "feat(add-limiter): Added limiter module.");
    }

    #[test]
    fn commit_message_truncates_subject() {
        let long_output = "x".repeat(200);
        let msg = commit_message("chunk", &long_output);
        assert_eq!(msg.chars().count(), COMMIT_SUBJECT_MAX);
        assert!(msg.ends_with("..."));
    }

    #[test]
    fn commit_message_handles_empty_output() {
        let msg = commit_message("chunk", "\n\n");
        assert_eq!(msg, "feat(chunk): implement chunk");
    }

    #[test]
    fn chunk_prompt_includes_task() {
        let prompt = build_chunk_prompt(&test_spec(), &test_chunk());
        assert!(prompt.contains("add-limiter"));
        assert!(prompt.contains("token bucket"));
        assert!(prompt.contains("Do not commit"));
    }

    #[test]
    fn review_prompt_includes_output_and_format() {
        let prompt = build_review_prompt(&test_chunk());
        assert!(prompt.contains("Added limiter module."));
        assert!(prompt.contains(r#""status": "pass" | "needs_fix" | "fail""#));
    }

    #[test]
    fn final_review_prompt_includes_diff() {
        let prompt = build_final_review_prompt(&test_spec(), "diff --git a/x b/x");
        assert!(prompt.contains("diff --git"));
        assert!(prompt.contains("Add Rate Limiting"));
    }
}
