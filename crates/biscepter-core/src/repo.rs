//! Repository operations, driven through the `git` CLI.
//!
//! A [`Repository`] is a working tree on disk. The job owns one pristine
//! clone; every replica gets its own deep copy so checkouts never interfere.
//! All history questions (range enumeration, merge parents, metadata) are
//! answered by shelling out to `git` with captured output.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;

use crate::error::{BisectError, BisectResult};

/// Metadata of a single commit, as reported on convergence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitMetadata {
    /// Full commit message, trimmed.
    pub message: String,
    /// Author date in RFC 2822 format.
    pub date: String,
    /// `"Author Name <email>"`.
    pub author: String,
}

/// A git working tree.
#[derive(Debug, Clone)]
pub struct Repository {
    path: PathBuf,
}

impl Repository {
    /// Wrap an existing working tree.
    #[must_use]
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Clone `url` into `dest` (which must exist and be empty).
    ///
    /// # Errors
    ///
    /// Fails if `git clone` exits non-zero.
    pub fn clone_from(url: &str, dest: &Path) -> BisectResult<Self> {
        debug!(target: "biscepter.repo", url, dest = %dest.display(), "cloning repository");
        run_tool(
            "git",
            &["clone", url, &dest.to_string_lossy()],
            None,
        )?;
        Ok(Self::at(dest))
    }

    /// Deep-copy this working tree to `dest`, yielding an independent
    /// repository with the same history.
    ///
    /// # Errors
    ///
    /// Fails if the copy fails.
    pub fn copy_to(&self, dest: &Path) -> BisectResult<Self> {
        // `src/.` copies the directory contents including dotfiles (.git).
        let src = format!("{}/.", self.path.display());
        run_tool("cp", &["-R", &src, &dest.to_string_lossy()], None)?;
        Ok(Self::at(dest))
    }

    /// Path of the working tree.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolve `spec` (hash, abbreviation, ref) to a full commit hash.
    ///
    /// # Errors
    ///
    /// Fails if `spec` does not name a commit in this repository.
    pub fn rev_parse(&self, spec: &str) -> BisectResult<String> {
        Ok(self.git(&["rev-parse", spec])?.trim().to_owned())
    }

    /// Whether `good` is reachable from `bad` along first-parent history.
    ///
    /// # Errors
    ///
    /// Fails if `bad` is not a valid commit in this repository.
    pub fn reachable_first_parent(&self, good: &str, bad: &str) -> BisectResult<bool> {
        let out = self.git(&["rev-list", "--first-parent", bad])?;
        Ok(out.lines().any(|line| line == good))
    }

    /// The first-parent commit list from `good` to `bad`, both inclusive,
    /// ordered chronologically (`good` first).
    ///
    /// # Errors
    ///
    /// Fails if either hash is unknown to the repository.
    pub fn first_parent_range(&self, good: &str, bad: &str) -> BisectResult<Vec<String>> {
        let exclude = format!("^{good}");
        let out = self.git(&["rev-list", "--reverse", "--first-parent", &exclude, bad])?;
        // Normalize the good endpoint to its full hash so callers can
        // compare sequence entries directly.
        let full_good = self.git(&["rev-parse", good])?.trim().to_owned();
        let mut commits = vec![full_good];
        commits.extend(out.lines().map(str::to_owned));
        Ok(commits)
    }

    /// For a two-parent merge commit `commit` with `known_parent` on the
    /// branch it was merged into, return the tip of the merged side branch.
    ///
    /// Returns `Ok(None)` for non-merge commits and for octopus merges
    /// (more than two parents), which are deliberately not recursed into.
    ///
    /// # Errors
    ///
    /// Fails if `commit` is unknown, or if `known_parent` is not actually
    /// one of the merge's parents.
    pub fn merged_parent(
        &self,
        commit: &str,
        known_parent: &str,
    ) -> BisectResult<Option<String>> {
        let spec = format!("{commit}^@");
        let out = self.git(&["rev-parse", &spec])?;
        let parents: Vec<&str> = out.lines().collect();
        if parents.len() != 2 {
            return Ok(None);
        }
        if known_parent == parents[0] {
            Ok(Some(parents[1].to_owned()))
        } else if known_parent == parents[1] {
            Ok(Some(parents[0].to_owned()))
        } else {
            Err(BisectError::UnknownCommit {
                commit: known_parent.to_owned(),
            })
        }
    }

    /// Commit message, author date, and author of `commit`.
    ///
    /// # Errors
    ///
    /// Fails if `commit` is unknown to the repository.
    pub fn metadata(&self, commit: &str) -> BisectResult<CommitMetadata> {
        let message = self.git(&["show", "-s", "--format=%B", commit])?;
        let date = self.git(&["show", "-s", "--format=%aD", commit])?;
        let author = self.git(&["show", "-s", "--format=%an <%ae>", commit])?;
        Ok(CommitMetadata {
            message: message.trim().to_owned(),
            date: date.trim().to_owned(),
            author: author.trim().to_owned(),
        })
    }

    /// Reset the working tree to exactly `commit`, discarding any local
    /// modifications (including a previously injected Dockerfile), and
    /// bring submodules up to date.
    ///
    /// # Errors
    ///
    /// Fails if any of the underlying git commands exit non-zero.
    pub fn checkout_clean(&self, commit: &str) -> BisectResult<()> {
        debug!(target: "biscepter.repo", commit, path = %self.path.display(), "checking out");
        // Stage everything first so untracked files are swept up by the
        // hard reset as well.
        self.git(&["add", "."])?;
        self.git(&["reset", "--hard", commit])?;
        self.git(&["submodule", "update", "--init", "--recursive"])?;
        Ok(())
    }

    fn git(&self, args: &[&str]) -> BisectResult<String> {
        run_tool("git", args, Some(&self.path))
    }
}

/// Run an external tool, capture stdout, and map non-zero exits to
/// [`BisectError::ToolFailed`] carrying the trimmed stderr.
pub(crate) fn run_tool(
    tool: &'static str,
    args: &[&str],
    cwd: Option<&Path>,
) -> BisectResult<String> {
    run_tool_with_env(tool, args, cwd, &HashMap::new())
}

/// [`run_tool`] with extra environment variables for the child process.
pub(crate) fn run_tool_with_env(
    tool: &'static str,
    args: &[&str],
    cwd: Option<&Path>,
    env: &HashMap<String, String>,
) -> BisectResult<String> {
    let mut command = Command::new(tool);
    command.args(args);
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }
    for (key, value) in env {
        command.env(key, value);
    }
    let output = command
        .output()
        .map_err(|source| BisectError::ToolUnavailable { tool, source })?;
    if !output.status.success() {
        return Err(BisectError::ToolFailed {
            tool,
            args: args.iter().map(|s| (*s).to_owned()).collect(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FixtureRepo;

    #[test]
    fn range_includes_both_endpoints_in_order() {
        let fixture = FixtureRepo::linear(&["one", "two", "three", "four"]);
        let repo = fixture.repo();
        let commits = &fixture.commits;

        let range = repo.first_parent_range(&commits[0], &commits[3]).unwrap();
        assert_eq!(range, commits.to_vec());
        assert_eq!(range.first().unwrap(), &commits[0]);
        assert_eq!(range.last().unwrap(), &commits[3]);
    }

    #[test]
    fn range_respects_sub_windows() {
        let fixture = FixtureRepo::linear(&["one", "two", "three", "four"]);
        let repo = fixture.repo();
        let commits = &fixture.commits;

        let range = repo.first_parent_range(&commits[1], &commits[2]).unwrap();
        assert_eq!(range, commits[1..=2].to_vec());
    }

    #[test]
    fn reachability_detects_disconnected_endpoints() {
        let fixture = FixtureRepo::linear(&["one", "two", "three"]);
        let repo = fixture.repo();
        let commits = &fixture.commits;

        assert!(repo.reachable_first_parent(&commits[0], &commits[2]).unwrap());
        // Reversed endpoints: the "bad" commit is older than the "good" one.
        assert!(!repo.reachable_first_parent(&commits[2], &commits[0]).unwrap());
    }

    #[test]
    fn merged_parent_of_linear_commit_is_none() {
        let fixture = FixtureRepo::linear(&["one", "two"]);
        let repo = fixture.repo();
        assert_eq!(
            repo.merged_parent(&fixture.commits[1], &fixture.commits[0])
                .unwrap(),
            None
        );
    }

    #[test]
    fn merged_parent_returns_side_branch_tip() {
        let fixture = FixtureRepo::with_merge();
        let repo = fixture.repo();

        let merged = repo
            .merged_parent(&fixture.merge_commit, &fixture.mainline_parent)
            .unwrap();
        assert_eq!(merged, Some(fixture.branch_tip.clone()));
    }

    #[test]
    fn merged_parent_rejects_non_parent() {
        let fixture = FixtureRepo::with_merge();
        let repo = fixture.repo();

        let err = repo
            .merged_parent(&fixture.merge_commit, "0000000000000000000000000000000000000000")
            .unwrap_err();
        assert!(matches!(err, BisectError::UnknownCommit { .. }));
    }

    #[test]
    fn metadata_reports_message_and_author() {
        let fixture = FixtureRepo::linear(&["one", "two"]);
        let repo = fixture.repo();

        let meta = repo.metadata(&fixture.commits[1]).unwrap();
        assert_eq!(meta.message, "two");
        assert_eq!(meta.author, "Fixture <fixture@example.com>");
        assert!(!meta.date.is_empty());
    }

    #[test]
    fn copy_produces_independent_checkout() {
        let fixture = FixtureRepo::linear(&["one", "two", "three"]);
        let repo = fixture.repo();

        let dir = tempfile::tempdir().unwrap();
        let copy = repo.copy_to(dir.path()).unwrap();
        copy.checkout_clean(&fixture.commits[0]).unwrap();

        // The copy is at "one"; the original must still be at "three".
        assert!(copy.path().join("file_one").exists());
        assert!(!copy.path().join("file_three").exists());
        assert!(repo.path().join("file_three").exists());
    }

    #[test]
    fn checkout_clean_discards_injected_files() {
        let fixture = FixtureRepo::linear(&["one", "two"]);
        let repo = fixture.repo();

        std::fs::write(repo.path().join("Dockerfile"), "FROM scratch\n").unwrap();
        repo.checkout_clean(&fixture.commits[1]).unwrap();
        assert!(!repo.path().join("Dockerfile").exists());
    }
}
