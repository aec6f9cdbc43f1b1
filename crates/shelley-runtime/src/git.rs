//! Git-state polling (§4.1 step 7, §3 "Turn State" — "last-known git
//! state"). Only the branch/commit/dirty snapshot is tracked here; git-diff
//! HTTP handlers and any other git-facing surface are out of scope (§1
//! Non-goals).

use std::process::Command;

/// A conversation's last-known git state, compared by value to decide
/// whether a `gitinfo` message should be emitted (§4.1 step 7).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GitState {
    pub branch: Option<String>,
    pub commit: Option<String>,
    pub dirty: bool,
}

impl GitState {
    /// Poll `cwd` for its current git state. No `cwd`, no `git` binary, or
    /// `cwd` not inside a repo all resolve to the default (no-git) state.
    pub fn poll(cwd: Option<&str>) -> Self {
        let Some(cwd) = cwd else {
            return Self::default();
        };

        let branch = run_git(cwd, &["symbolic-ref", "--short", "-q", "HEAD"]).filter(|s| !s.is_empty());
        let commit = run_git(cwd, &["rev-parse", "HEAD"]).filter(|s| !s.is_empty());
        let dirty = run_git(cwd, &["status", "--porcelain"])
            .map(|s| !s.is_empty())
            .unwrap_or(false);

        Self { branch, commit, dirty }
    }

    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "branch": self.branch,
            "commit": self.commit,
            "dirty": self.dirty,
        })
    }
}

fn run_git(cwd: &str, args: &[&str]) -> Option<String> {
    Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
}
