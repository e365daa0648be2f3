//! Git workspace management for spec isolation.
//!
//! Every spec runs on its own branch, preferably inside a dedicated worktree
//! under `<projectDir>/../.worktrees/<specId>` so parallel specs never touch
//! each other's checkouts. Provides transactional reset semantics per chunk
//! (snapshot/reset), commit/push, PR creation through the `gh` CLI, and
//! orphan/stale worktree scans.

use chrono::Utc;
use spec_core::{prompt::spec_branch_name, GitState, Id, Spec};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("failed to execute git: {0}")]
    Execution(#[from] std::io::Error),
    #[error("invalid utf-8 in git output")]
    InvalidUtf8,
    #[error("provider CLI failed: {0}\n  → install `gh` and authenticate, then re-run; commits are intact")]
    Provider(String),
}

pub type Result<T> = std::result::Result<T, GitError>;

/// Point-in-time state of a working tree: HEAD plus every tracked and
/// untracked (non-ignored) file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub head: String,
    pub files: BTreeSet<String>,
}

/// Result of a commit attempt. Empty when nothing was staged.
#[derive(Debug, Clone, Default)]
pub struct CommitResult {
    pub hash: Option<String>,
    pub files_changed: usize,
}

/// An open pull request.
#[derive(Debug, Clone)]
pub struct PullRequest {
    pub number: i64,
    pub url: String,
}

/// A worktree flagged by the orphan/stale scans.
#[derive(Debug, Clone)]
pub struct WorktreeReport {
    pub spec_id: String,
    pub path: PathBuf,
    pub age_days: i64,
}

/// Workspace manager configuration.
#[derive(Debug, Clone)]
pub struct GitWorkspace {
    pub base_branch: String,
    pub worktrees: bool,
}

impl GitWorkspace {
    pub fn new(base_branch: &str, worktrees: bool) -> Self {
        Self {
            base_branch: base_branch.to_string(),
            worktrees,
        }
    }

    /// Deterministic worktree path for a spec.
    pub fn worktree_path(project_dir: &Path, spec_id: &Id) -> PathBuf {
        worktrees_dir(project_dir).join(spec_id.as_ref())
    }

    /// Initialise the workspace for a spec.
    ///
    /// Non-repo directories yield a disabled state and pipelines proceed
    /// without commits. Otherwise the spec branch is created from the base
    /// and checked out in a worktree (adopted if one already exists at the
    /// deterministic path).
    pub fn init(&self, spec: &Spec, project_dir: &Path) -> Result<GitState> {
        if !is_git_repo(project_dir) {
            debug!(dir = %project_dir.display(), "not a git repository; git workflow disabled");
            return Ok(GitState::disabled(project_dir));
        }

        let branch = spec_branch_name(&spec.title, &spec.id);
        let original_branch = current_branch(project_dir).ok();

        if !self.worktrees {
            // In-place checkout: create the branch from base and switch.
            if !branch_exists(project_dir, &branch)? {
                create_branch(project_dir, &branch, &self.base_branch)?;
            }
            checkout_branch(project_dir, &branch)?;
            return Ok(GitState {
                enabled: true,
                original_branch,
                branch: Some(branch),
                working_dir: project_dir.to_path_buf(),
                worktree: false,
                base_branch: self.base_branch.clone(),
            });
        }

        let path = Self::worktree_path(project_dir, &spec.id);
        if is_registered_worktree(project_dir, &path)? {
            debug!(path = %path.display(), "adopting existing worktree");
        } else {
            if !branch_exists(project_dir, &branch)? {
                create_branch(project_dir, &branch, &self.base_branch)?;
            }
            create_worktree(project_dir, &path, &branch)?;
        }

        Ok(GitState {
            enabled: true,
            original_branch,
            branch: Some(branch),
            working_dir: path,
            worktree: true,
            base_branch: self.base_branch.clone(),
        })
    }

    /// Capture HEAD and the current file set.
    pub fn snapshot(&self, state: &GitState) -> Result<Snapshot> {
        let head = rev_parse(&state.working_dir, "HEAD")?;
        let files = list_files(&state.working_dir)?;
        Ok(Snapshot { head, files })
    }

    /// Discard working-tree changes and untracked files not present in the
    /// snapshot, returning the tree to the snapshot's state.
    pub fn reset(&self, state: &GitState, snapshot: &Snapshot) -> Result<()> {
        run_git(&state.working_dir, &["reset", "--hard", &snapshot.head])?;

        let current = list_files(&state.working_dir)?;
        for file in current.difference(&snapshot.files) {
            let path = state.working_dir.join(file);
            if path.is_file() {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!(file = %path.display(), error = %e, "failed to remove untracked file");
                }
            }
        }
        Ok(())
    }

    /// Paths changed since the given snapshot (staged, unstaged, untracked;
    /// ignored files excluded). The pipeline commits after validation, so
    /// HEAD equals the snapshot head while this runs.
    pub fn changed_files(&self, state: &GitState) -> Result<Vec<String>> {
        let output = run_git(&state.working_dir, &["status", "--porcelain"])?;
        Ok(output
            .lines()
            .filter(|l| l.len() > 3)
            .map(|l| l[3..].trim().to_string())
            .collect())
    }

    /// Stage everything and commit. Returns an empty result when nothing is
    /// staged. The message is passed verbatim as a single argument, so no
    /// shell quoting applies.
    pub fn commit(&self, state: &GitState, message: &str) -> Result<CommitResult> {
        run_git(&state.working_dir, &["add", "-A"])?;

        // Anything staged?
        let staged = Command::new("git")
            .args(["diff", "--cached", "--quiet"])
            .current_dir(&state.working_dir)
            .output()?;
        if staged.status.success() {
            return Ok(CommitResult::default());
        }

        run_git(&state.working_dir, &["commit", "-m", message])?;
        let hash = rev_parse(&state.working_dir, "HEAD")?;
        let files = run_git(
            &state.working_dir,
            &["diff-tree", "--no-commit-id", "--name-only", "-r", "HEAD"],
        )?;
        Ok(CommitResult {
            hash: Some(hash),
            files_changed: files.lines().filter(|l| !l.trim().is_empty()).count(),
        })
    }

    /// Push the spec branch with upstream tracking.
    pub fn push(&self, state: &GitState) -> Result<()> {
        let Some(branch) = state.branch.as_deref() else {
            return Ok(());
        };
        run_git(&state.working_dir, &["push", "-u", "origin", branch])?;
        Ok(())
    }

    /// Open a pull request through the provider CLI.
    ///
    /// CLI absence or auth failure is a `Provider` error the sequencer
    /// treats as non-fatal; commits stay intact either way.
    pub fn open_pr(
        &self,
        state: &GitState,
        title: &str,
        body: &str,
        base: &str,
    ) -> Result<PullRequest> {
        let output = Command::new("gh")
            .args(["pr", "create", "--title", title, "--body", body, "--base", base])
            .current_dir(&state.working_dir)
            .output()
            .map_err(|e| GitError::Provider(format!("failed to run gh: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GitError::Provider(format!("gh pr create: {stderr}")));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let url = stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| l.starts_with("http"))
            .ok_or_else(|| GitError::Provider(format!("no PR url in gh output: {stdout}")))?
            .to_string();
        let number = url
            .rsplit('/')
            .next()
            .and_then(|n| n.parse::<i64>().ok())
            .ok_or_else(|| GitError::Provider(format!("unparseable PR url: {url}")))?;

        Ok(PullRequest { number, url })
    }

    /// Release the workspace. Always safe to call, idempotent.
    ///
    /// Worktrees are retained on success (needed for PR updates); on failure
    /// with zero commits the worktree is removed. In-place checkouts restore
    /// the original branch best-effort.
    pub fn cleanup(&self, project_dir: &Path, state: &GitState, commits: usize) {
        if !state.enabled {
            return;
        }

        if state.worktree {
            if commits == 0 && state.working_dir.exists() {
                if let Err(e) = remove_worktree(project_dir, &state.working_dir) {
                    warn!(
                        path = %state.working_dir.display(),
                        error = %e,
                        "worktree cleanup failed"
                    );
                }
            }
            return;
        }

        if let Some(original) = state.original_branch.as_deref() {
            if let Err(e) = checkout_branch(project_dir, original) {
                warn!(branch = original, error = %e, "failed to restore original branch");
            }
        }
    }

    /// Worktrees whose spec no longer exists (or was deleted).
    pub fn scan_orphans(
        &self,
        project_dir: &Path,
        live_spec_ids: &BTreeSet<String>,
    ) -> Vec<WorktreeReport> {
        scan_worktrees(project_dir)
            .into_iter()
            .filter(|report| !live_spec_ids.contains(&report.spec_id))
            .collect()
    }

    /// Worktrees older than `max_age_days`. The caller filters out specs
    /// whose PR already merged before surfacing removal.
    pub fn scan_stale(&self, project_dir: &Path, max_age_days: i64) -> Vec<WorktreeReport> {
        scan_worktrees(project_dir)
            .into_iter()
            .filter(|report| report.age_days > max_age_days)
            .collect()
    }

    /// Explicitly remove a scanned worktree.
    pub fn remove(&self, project_dir: &Path, path: &Path) -> Result<()> {
        remove_worktree(project_dir, path)
    }
}

fn worktrees_dir(project_dir: &Path) -> PathBuf {
    project_dir
        .parent()
        .unwrap_or(project_dir)
        .join(".worktrees")
}

fn scan_worktrees(project_dir: &Path) -> Vec<WorktreeReport> {
    let dir = worktrees_dir(project_dir);
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return Vec::new();
    };

    let now = Utc::now();
    entries
        .filter_map(std::result::Result::ok)
        .filter(|e| e.path().is_dir())
        .map(|e| {
            let age_days = e
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .map(|modified| {
                    let modified: chrono::DateTime<Utc> = modified.into();
                    (now - modified).num_days()
                })
                .unwrap_or(0);
            WorktreeReport {
                spec_id: e.file_name().to_string_lossy().to_string(),
                path: e.path(),
                age_days,
            }
        })
        .collect()
}

// --- git plumbing ---

fn run_git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git").args(args).current_dir(dir).output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!(
            "git {}: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    String::from_utf8(output.stdout)
        .map(|s| s.trim_end().to_string())
        .map_err(|_| GitError::InvalidUtf8)
}

pub fn is_git_repo(dir: &Path) -> bool {
    Command::new("git")
        .args(["rev-parse", "--is-inside-work-tree"])
        .current_dir(dir)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

pub fn current_branch(dir: &Path) -> Result<String> {
    run_git(dir, &["branch", "--show-current"])
}

pub fn rev_parse(dir: &Path, rev: &str) -> Result<String> {
    run_git(dir, &["rev-parse", rev])
}

/// Object type of a revision (`commit`, `tree`, ...), via `git cat-file -t`.
pub fn cat_file_type(dir: &Path, rev: &str) -> Result<String> {
    run_git(dir, &["cat-file", "-t", rev])
}

pub fn branch_exists(dir: &Path, branch: &str) -> Result<bool> {
    let output = Command::new("git")
        .args(["rev-parse", "--verify", &format!("refs/heads/{branch}")])
        .current_dir(dir)
        .output()?;
    Ok(output.status.success())
}

pub fn create_branch(dir: &Path, branch: &str, base: &str) -> Result<()> {
    run_git(dir, &["branch", branch, base])?;
    Ok(())
}

pub fn checkout_branch(dir: &Path, branch: &str) -> Result<()> {
    run_git(dir, &["checkout", branch])?;
    Ok(())
}

/// Diff between two revisions, for the final review.
pub fn diff_range(dir: &Path, base: &str, head: &str) -> Result<String> {
    run_git(dir, &["diff", &format!("{base}..{head}")])
}

/// Tracked plus untracked (non-ignored) files.
fn list_files(dir: &Path) -> Result<BTreeSet<String>> {
    let output = run_git(dir, &["ls-files", "--cached", "--others", "--exclude-standard"])?;
    Ok(output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}

fn create_worktree(project_dir: &Path, path: &Path, branch: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| GitError::CommandFailed(format!("failed to create {}: {e}", parent.display())))?;
    }
    run_git(
        project_dir,
        &["worktree", "add", path.to_string_lossy().as_ref(), branch],
    )?;
    Ok(())
}

fn is_registered_worktree(project_dir: &Path, path: &Path) -> Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    let output = run_git(project_dir, &["worktree", "list", "--porcelain"])?;
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    Ok(output.lines().any(|line| {
        line.strip_prefix("worktree ")
            .map(|p| Path::new(p) == canonical || Path::new(p) == path)
            .unwrap_or(false)
    }))
}

fn remove_worktree(project_dir: &Path, path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    run_git(
        project_dir,
        &["worktree", "remove", "--force", path.to_string_lossy().as_ref()],
    )?;
    Ok(())
}
