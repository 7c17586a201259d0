//! Version-control seam.
//!
//! [`Vcs`] is the narrow set of git operations the supervisor and the merge
//! orchestrator need. [`GitCli`] shells out to `git`; tests use
//! [`crate::fakes::FakeVcs`].

use std::path::Path;
use std::process::{Command, Output};

use tracing::debug;

use crate::error::{EngineError, EngineResult};

/// Run `f` on tokio's blocking pool. Git subprocesses and lock waits go
/// through here so they never stall the runtime's worker threads.
pub(crate) async fn blocking<T, F>(f: F) -> EngineResult<T>
where
    F: FnOnce() -> EngineResult<T> + Send + 'static,
    T: Send + 'static,
{
    let span = tracing::Span::current();
    tokio::task::spawn_blocking(move || span.in_scope(f))
        .await
        .map_err(|e| {
            EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("blocking task failed: {e}"),
            ))
        })?
}

/// Result of merging a branch into the checked-out baseline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Merge commit created.
    Merged { head: String },
    /// Conflicts in `paths`; the merge was aborted and the baseline is at its
    /// pre-merge commit.
    Conflict { paths: Vec<String> },
}

pub trait Vcs: Send + Sync {
    /// Tracked files differ from HEAD.
    fn is_dirty(&self, dir: &Path) -> EngineResult<bool>;

    fn current_branch(&self, repo: &Path) -> EngineResult<String>;

    fn head_sha(&self, dir: &Path) -> EngineResult<String>;

    fn branch_exists(&self, repo: &Path, branch: &str) -> EngineResult<bool>;

    /// New worktree at `path` on new branch `branch` from `base`.
    fn add_worktree(&self, repo: &Path, path: &Path, branch: &str, base: &str)
        -> EngineResult<()>;

    /// Remove the worktree at `path`. Missing worktrees are not an error.
    fn remove_worktree(&self, repo: &Path, path: &Path) -> EngineResult<()>;

    /// Delete `branch`. A missing branch is not an error.
    fn delete_branch(&self, repo: &Path, branch: &str) -> EngineResult<()>;

    /// Stage and commit every change in `dir`. Returns the new HEAD, or
    /// `None` when there was nothing to commit.
    fn commit_all(&self, dir: &Path, message: &str) -> EngineResult<Option<String>>;

    /// Commits reachable from `branch` but not from `base`.
    fn commit_count(&self, repo: &Path, base: &str, branch: &str) -> EngineResult<usize>;

    /// `git merge --no-ff` of `branch` into the current checkout of `repo`.
    fn merge(&self, repo: &Path, branch: &str, message: &str) -> EngineResult<MergeOutcome>;

    /// `branch` is already contained in the current HEAD of `repo`.
    fn is_merged(&self, repo: &Path, branch: &str) -> EngineResult<bool>;

    /// Add `pattern` to the repository-local exclude file.
    fn exclude(&self, repo: &Path, pattern: &str) -> EngineResult<()>;
}

/// [`Vcs`] backed by the `git` command line.
#[derive(Debug, Clone, Default)]
pub struct GitCli;

impl GitCli {
    pub fn new() -> Self {
        Self
    }

    fn run(&self, dir: &Path, args: &[&str]) -> EngineResult<Output> {
        debug!(dir = %dir.display(), ?args, "git");
        Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .map_err(|e| EngineError::Git {
                command: args.join(" "),
                stderr: format!("failed to run git: {e}"),
            })
    }

    /// Run and require success; returns trimmed stdout.
    fn run_ok(&self, dir: &Path, args: &[&str]) -> EngineResult<String> {
        let output = self.run(dir, args)?;
        if !output.status.success() {
            return Err(EngineError::Git {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

impl Vcs for GitCli {
    fn is_dirty(&self, dir: &Path) -> EngineResult<bool> {
        let out = self.run_ok(dir, &["status", "--porcelain", "--untracked-files=no"])?;
        Ok(!out.is_empty())
    }

    fn current_branch(&self, repo: &Path) -> EngineResult<String> {
        self.run_ok(repo, &["rev-parse", "--abbrev-ref", "HEAD"])
    }

    fn head_sha(&self, dir: &Path) -> EngineResult<String> {
        self.run_ok(dir, &["rev-parse", "HEAD"])
    }

    fn branch_exists(&self, repo: &Path, branch: &str) -> EngineResult<bool> {
        let refname = format!("refs/heads/{branch}");
        let output = self.run(repo, &["rev-parse", "--verify", "--quiet", &refname])?;
        Ok(output.status.success())
    }

    fn add_worktree(
        &self,
        repo: &Path,
        path: &Path,
        branch: &str,
        base: &str,
    ) -> EngineResult<()> {
        let path = path_arg(path);
        self.run_ok(repo, &["worktree", "add", &path, "-b", branch, base])?;
        Ok(())
    }

    fn remove_worktree(&self, repo: &Path, path: &Path) -> EngineResult<()> {
        if path.exists() {
            let p = path_arg(path);
            let output = self.run(repo, &["worktree", "remove", "--force", &p])?;
            if !output.status.success() && path.exists() {
                // Not a registered worktree (or already detached); drop the
                // directory so prune can forget it.
                std::fs::remove_dir_all(path)?;
            }
        }
        self.run_ok(repo, &["worktree", "prune"])?;
        Ok(())
    }

    fn delete_branch(&self, repo: &Path, branch: &str) -> EngineResult<()> {
        if self.branch_exists(repo, branch)? {
            self.run_ok(repo, &["branch", "-D", branch])?;
        }
        Ok(())
    }

    fn commit_all(&self, dir: &Path, message: &str) -> EngineResult<Option<String>> {
        self.run_ok(dir, &["add", "-A"])?;
        if self.run_ok(dir, &["status", "--porcelain"])?.is_empty() {
            return Ok(None);
        }
        self.run_ok(dir, &["commit", "--no-verify", "-m", message])?;
        self.head_sha(dir).map(Some)
    }

    fn commit_count(&self, repo: &Path, base: &str, branch: &str) -> EngineResult<usize> {
        let range = format!("{base}..{branch}");
        let out = self.run_ok(repo, &["rev-list", "--count", &range])?;
        out.parse().map_err(|_| EngineError::Git {
            command: format!("rev-list --count {range}"),
            stderr: format!("unexpected output: {out}"),
        })
    }

    fn merge(&self, repo: &Path, branch: &str, message: &str) -> EngineResult<MergeOutcome> {
        let output = self.run(repo, &["merge", "--no-ff", "--no-edit", "-m", message, branch])?;
        if output.status.success() {
            return Ok(MergeOutcome::Merged {
                head: self.head_sha(repo)?,
            });
        }

        let conflicted = self.run_ok(repo, &["diff", "--name-only", "--diff-filter=U"])?;
        let paths: Vec<String> = conflicted
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        if paths.is_empty() {
            return Err(EngineError::Git {
                command: format!("merge --no-ff {branch}"),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        self.run_ok(repo, &["merge", "--abort"])?;
        Ok(MergeOutcome::Conflict { paths })
    }

    fn is_merged(&self, repo: &Path, branch: &str) -> EngineResult<bool> {
        let output = self.run(repo, &["merge-base", "--is-ancestor", branch, "HEAD"])?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(EngineError::Git {
                command: format!("merge-base --is-ancestor {branch} HEAD"),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
        }
    }

    fn exclude(&self, repo: &Path, pattern: &str) -> EngineResult<()> {
        let rel = self.run_ok(repo, &["rev-parse", "--git-path", "info/exclude"])?;
        let path = repo.join(rel);
        let existing = std::fs::read_to_string(&path).unwrap_or_default();
        if existing.lines().any(|l| l.trim() == pattern) {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut body = existing;
        if !body.is_empty() && !body.ends_with('\n') {
            body.push('\n');
        }
        body.push_str(pattern);
        body.push('\n');
        std::fs::write(&path, body)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::process::Command as StdCommand;

    fn run_git(repo_dir: &Path, args: &[&str]) {
        let output = StdCommand::new("git")
            .args(args)
            .current_dir(repo_dir)
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    fn make_git_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        run_git(dir.path(), &["init", "-b", "main"]);
        run_git(dir.path(), &["config", "user.name", "test-user"]);
        run_git(dir.path(), &["config", "user.email", "test@example.com"]);
        fs::write(dir.path().join("shared.txt"), "base\n").unwrap();
        run_git(dir.path(), &["add", "."]);
        run_git(dir.path(), &["commit", "-m", "initial"]);
        dir
    }

    #[test]
    fn dirty_check_ignores_untracked_files() {
        let repo = make_git_repo();
        let git = GitCli::new();
        fs::write(repo.path().join("scratch.txt"), "x").unwrap();
        assert!(!git.is_dirty(repo.path()).unwrap());
        fs::write(repo.path().join("shared.txt"), "changed\n").unwrap();
        assert!(git.is_dirty(repo.path()).unwrap());
    }

    #[test]
    fn worktree_commit_and_clean_merge() {
        let repo = make_git_repo();
        let git = GitCli::new();
        let wts = tempfile::tempdir().unwrap();
        let wt = wts.path().join("wt-a");
        git.add_worktree(repo.path(), &wt, "feature/a", "main").unwrap();
        assert!(git.branch_exists(repo.path(), "feature/a").unwrap());

        fs::write(wt.join("a.txt"), "a\n").unwrap();
        assert!(git.commit_all(&wt, "add a").unwrap().is_some());
        assert!(git.commit_all(&wt, "nothing").unwrap().is_none());
        assert_eq!(git.commit_count(repo.path(), "main", "feature/a").unwrap(), 1);
        assert!(!git.is_merged(repo.path(), "feature/a").unwrap());

        let outcome = git.merge(repo.path(), "feature/a", "merge a").unwrap();
        assert!(matches!(outcome, MergeOutcome::Merged { .. }));
        assert!(git.is_merged(repo.path(), "feature/a").unwrap());
        assert!(repo.path().join("a.txt").exists());

        git.remove_worktree(repo.path(), &wt).unwrap();
        git.delete_branch(repo.path(), "feature/a").unwrap();
        assert!(!wt.exists());
        assert!(!git.branch_exists(repo.path(), "feature/a").unwrap());
        // Idempotent.
        git.remove_worktree(repo.path(), &wt).unwrap();
        git.delete_branch(repo.path(), "feature/a").unwrap();
    }

    #[test]
    fn conflicting_merge_is_aborted() {
        let repo = make_git_repo();
        let git = GitCli::new();
        let wts = tempfile::tempdir().unwrap();
        let wt = wts.path().join("wt-b");
        git.add_worktree(repo.path(), &wt, "feature/b", "main").unwrap();
        fs::write(wt.join("shared.txt"), "branch\n").unwrap();
        git.commit_all(&wt, "branch edit").unwrap();

        fs::write(repo.path().join("shared.txt"), "main\n").unwrap();
        git.commit_all(repo.path(), "main edit").unwrap();
        let before = git.head_sha(repo.path()).unwrap();

        match git.merge(repo.path(), "feature/b", "merge b").unwrap() {
            MergeOutcome::Conflict { paths } => assert_eq!(paths, vec!["shared.txt"]),
            other => panic!("expected conflict, got {other:?}"),
        }
        assert_eq!(git.head_sha(repo.path()).unwrap(), before);
        assert!(!git.is_dirty(repo.path()).unwrap());
        assert_eq!(
            fs::read_to_string(repo.path().join("shared.txt")).unwrap(),
            "main\n"
        );
    }

    #[test]
    fn excluded_state_dir_is_never_committed() {
        let repo = make_git_repo();
        let git = GitCli::new();
        git.exclude(repo.path(), "/.epicflow/").unwrap();
        git.exclude(repo.path(), "/.epicflow/").unwrap();
        fs::create_dir_all(repo.path().join(".epicflow")).unwrap();
        fs::write(repo.path().join(".epicflow/registry.json"), "{}").unwrap();
        assert!(git.commit_all(repo.path(), "nothing to add").unwrap().is_none());
    }
}
