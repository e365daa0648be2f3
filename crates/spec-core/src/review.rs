//! Review verdict parsing.
//!
//! The reviewer backend is asked for a JSON object `{status, feedback,
//! fixChunk?}` but models wrap answers in prose and markdown code fences.
//! The parser scans for JSON objects and takes the last one that carries a
//! recognisable status; anything else is a parse error the caller maps to
//! a synthetic needs-fix.

use crate::types::ReviewStatus;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum VerdictError {
    #[error("no JSON verdict found in reviewer output (tail: {tail})")]
    NoJson { tail: String },
    #[error("unrecognised review status: {0}")]
    UnknownStatus(String),
}

/// Replacement chunk suggested by the reviewer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixChunkSpec {
    pub title: String,
    #[serde(default)]
    pub description: String,
}

/// Parsed reviewer verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewVerdict {
    pub status: ReviewStatus,
    #[serde(default)]
    pub feedback: String,
    #[serde(default, rename = "fixChunk")]
    pub fix_chunk: Option<FixChunkSpec>,
}

#[derive(Deserialize)]
struct RawVerdict {
    status: String,
    #[serde(default)]
    feedback: String,
    #[serde(default, rename = "fixChunk")]
    fix_chunk: Option<FixChunkSpec>,
}

/// Parse a reviewer response into a verdict.
///
/// Strips markdown code fences, then scans for balanced JSON objects.
/// The last object with a `status` field wins; noise lines are ignored.
pub fn parse_verdict(raw: &str) -> Result<ReviewVerdict, VerdictError> {
    let cleaned = strip_code_fences(raw);

    let mut last: Option<RawVerdict> = None;
    for candidate in json_object_candidates(&cleaned) {
        if let Ok(parsed) = serde_json::from_str::<RawVerdict>(candidate) {
            last = Some(parsed);
        }
    }

    let Some(raw_verdict) = last else {
        return Err(VerdictError::NoJson {
            tail: tail_excerpt(raw, 256),
        });
    };

    let status = match raw_verdict.status.trim().to_lowercase().as_str() {
        "pass" | "approved" => ReviewStatus::Pass,
        "needs_fix" | "needs-fix" | "needsfix" => ReviewStatus::NeedsFix,
        "fail" | "failed" => ReviewStatus::Fail,
        other => return Err(VerdictError::UnknownStatus(other.to_string())),
    };

    Ok(ReviewVerdict {
        status,
        feedback: raw_verdict.feedback,
        fix_chunk: raw_verdict.fix_chunk,
    })
}

/// Remove ``` fence lines so fenced JSON parses like bare JSON.
fn strip_code_fences(raw: &str) -> String {
    raw.lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Yield balanced `{...}` slices found in the input.
///
/// Brace matching ignores braces inside JSON strings. Unterminated objects
/// are dropped, so a truncated stream degrades to the last complete one.
fn json_object_candidates(input: &str) -> Vec<&str> {
    let bytes = input.as_bytes();
    let mut candidates = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'{' {
            i += 1;
            continue;
        }

        let start = i;
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        let mut end = None;

        for (offset, &b) in bytes[start..].iter().enumerate() {
            if in_string {
                if escaped {
                    escaped = false;
                } else if b == b'\\' {
                    escaped = true;
                } else if b == b'"' {
                    in_string = false;
                }
                continue;
            }
            match b {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        end = Some(start + offset + 1);
                        break;
                    }
                }
                _ => {}
            }
        }

        match end {
            Some(end) => {
                candidates.push(&input[start..end]);
                i = end;
            }
            // Unterminated object: step past the brace and keep scanning so a
            // later complete object is still found.
            None => i = start + 1,
        }
    }

    candidates
}

/// Last `max` characters of the input, for error context.
fn tail_excerpt(input: &str, max: usize) -> String {
    if input.len() <= max {
        return input.to_string();
    }
    let mut start = input.len() - max;
    while !input.is_char_boundary(start) {
        start += 1;
    }
    input[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_json() {
        let verdict = parse_verdict(r#"{"status": "pass", "feedback": "looks good"}"#).unwrap();
        assert_eq!(verdict.status, ReviewStatus::Pass);
        assert_eq!(verdict.feedback, "looks good");
        assert!(verdict.fix_chunk.is_none());
    }

    #[test]
    fn parses_fenced_json() {
        let raw = "Here is my review:\n```json\n{\"status\": \"needs_fix\", \"feedback\": \"missing tests\"}\n```\n";
        let verdict = parse_verdict(raw).unwrap();
        assert_eq!(verdict.status, ReviewStatus::NeedsFix);
        assert_eq!(verdict.feedback, "missing tests");
    }

    #[test]
    fn parses_fix_chunk_payload() {
        let raw = r#"{"status": "needs_fix", "feedback": "rename the module", "fixChunk": {"title": "Rename module", "description": "Rename foo to bar"}}"#;
        let verdict = parse_verdict(raw).unwrap();
        let fix = verdict.fix_chunk.unwrap();
        assert_eq!(fix.title, "Rename module");
        assert_eq!(fix.description, "Rename foo to bar");
    }

    #[test]
    fn last_verdict_wins_over_noise() {
        let raw = "thinking...\n{\"status\": \"fail\"}\nactually no\n{\"status\": \"pass\", \"feedback\": \"fine\"}";
        let verdict = parse_verdict(raw).unwrap();
        assert_eq!(verdict.status, ReviewStatus::Pass);
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_matching() {
        let raw = r#"{"status": "pass", "feedback": "watch out for { and } in text"}"#;
        let verdict = parse_verdict(raw).unwrap();
        assert_eq!(verdict.feedback, "watch out for { and } in text");
    }

    #[test]
    fn truncated_object_falls_back_to_previous() {
        let raw = "{\"status\": \"pass\"}\n{\"status\": \"fail\", \"feedback\": \"trunc";
        let verdict = parse_verdict(raw).unwrap();
        assert_eq!(verdict.status, ReviewStatus::Pass);
    }

    #[test]
    fn no_json_is_an_error_with_tail() {
        let result = parse_verdict("I could not review this chunk.");
        match result {
            Err(VerdictError::NoJson { tail }) => {
                assert!(tail.contains("could not review"));
            }
            other => panic!("expected NoJson, got {other:?}"),
        }
    }

    #[test]
    fn unknown_status_is_an_error() {
        let result = parse_verdict(r#"{"status": "maybe"}"#);
        assert!(matches!(result, Err(VerdictError::UnknownStatus(s)) if s == "maybe"));
    }

    #[test]
    fn accepts_alternate_status_spellings() {
        assert_eq!(
            parse_verdict(r#"{"status": "APPROVED"}"#).unwrap().status,
            ReviewStatus::Pass
        );
        assert_eq!(
            parse_verdict(r#"{"status": "needs-fix"}"#).unwrap().status,
            ReviewStatus::NeedsFix
        );
        assert_eq!(
            parse_verdict(r#"{"status": "failed"}"#).unwrap().status,
            ReviewStatus::Fail
        );
    }
}
