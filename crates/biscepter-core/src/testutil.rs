//! Fixture repositories and an in-memory container runtime for tests.
//!
//! Fixture repos are real git repositories built in a temp directory with
//! the `git` CLI, so repository operations are exercised for real. The
//! [`MockRuntime`] stands in for Docker: "building" a commit records its
//! tag, "running" it does nothing, and individual commits can be scripted
//! to fail their build so replacement handling can be tested end to end.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

use tempfile::TempDir;

use crate::container::{ContainerRuntime, ContainerSpec, LabeledArtifact};
use crate::error::{BisectError, BisectResult};
use crate::repo::{run_tool, Repository};

// ---------------------------------------------------------------------------
// Fixture repositories
// ---------------------------------------------------------------------------

/// A throwaway git repository with known history.
///
/// `values` maps every commit hash to its creation sequence number (1-based,
/// across all branches). Oracles in tests treat a system as defective when
/// its commit's value is at or above a chosen threshold; this is sound as
/// long as the defect-introducing commit is chosen on the branch being
/// bisected.
pub struct FixtureRepo {
    dir: TempDir,
    /// First-parent mainline commits, oldest first.
    pub commits: Vec<String>,
    /// Side-branch commits, oldest first (empty for linear histories).
    pub branch_commits: Vec<String>,
    /// The merge commit (empty for linear histories).
    pub merge_commit: String,
    /// The merge's parent on the mainline.
    pub mainline_parent: String,
    /// The merge's parent on the side branch.
    pub branch_tip: String,
    /// Commit hash to creation sequence number.
    pub values: HashMap<String, u32>,
    next_value: u32,
}

impl FixtureRepo {
    /// A linear history with one commit per name, oldest first.
    ///
    /// # Panics
    ///
    /// Panics if any git command fails; fixtures are test-only.
    #[must_use]
    pub fn linear(names: &[&str]) -> Self {
        let mut fixture = Self::init();
        for name in names {
            let hash = fixture.commit(name);
            fixture.commits.push(hash);
        }
        fixture
    }

    /// A history with a merged side branch and one commit after the merge:
    ///
    /// ```text
    /// base -- main-one ------ M -- after        (mainline, first-parent)
    ///      \                 /
    ///       side-one -- side-two                (side branch)
    /// ```
    ///
    /// `commits` is the mainline first-parent range
    /// `[base, main-one, M, after]`.
    ///
    /// # Panics
    ///
    /// Panics if any git command fails; fixtures are test-only.
    #[must_use]
    pub fn with_merge() -> Self {
        let mut fixture = Self::init();
        let base = fixture.commit("base");
        let main_one = fixture.commit("main-one");
        fixture.commits.push(base.clone());
        fixture.commits.push(main_one.clone());
        fixture.git(&["branch", "-M", "main"]);

        fixture.git(&["checkout", "-b", "side", &base]);
        let side_one = fixture.commit("side-one");
        let side_two = fixture.commit("side-two");
        fixture.branch_commits = vec![side_one, side_two.clone()];
        fixture.branch_tip = side_two;

        fixture.git(&["checkout", "main"]);
        fixture.git(&["merge", "--no-ff", "side", "-m", "merge side"]);
        fixture.merge_commit = fixture.head();
        fixture.mainline_parent = main_one;
        let merge_value = fixture.next_value;
        fixture.next_value += 1;
        fixture
            .values
            .insert(fixture.merge_commit.clone(), merge_value);
        fixture.commits.push(fixture.merge_commit.clone());

        let after = fixture.commit("after");
        fixture.commits.push(after);
        fixture
    }

    fn init() -> Self {
        let dir = TempDir::with_prefix("biscepter-fixture").expect("create fixture dir");
        let fixture = Self {
            dir,
            commits: Vec::new(),
            branch_commits: Vec::new(),
            merge_commit: String::new(),
            mainline_parent: String::new(),
            branch_tip: String::new(),
            values: HashMap::new(),
            next_value: 1,
        };
        fixture.git(&["init"]);
        fixture
    }

    fn commit(&mut self, name: &str) -> String {
        let file = self.dir.path().join(format!("file_{name}"));
        std::fs::write(&file, name).expect("write fixture file");
        self.git(&["add", "."]);
        self.git(&["commit", "-m", name]);
        let hash = self.head();
        self.values.insert(hash.clone(), self.next_value);
        self.next_value += 1;
        hash
    }

    fn head(&self) -> String {
        self.git(&["rev-parse", "HEAD"]).trim().to_owned()
    }

    fn git(&self, args: &[&str]) -> String {
        let mut full: Vec<&str> = vec![
            "-c",
            "user.name=Fixture",
            "-c",
            "user.email=fixture@example.com",
            "-c",
            "init.defaultBranch=main",
        ];
        full.extend_from_slice(args);
        run_tool("git", &full, Some(self.dir.path())).expect("fixture git command failed")
    }

    /// The fixture as a [`Repository`].
    #[must_use]
    pub fn repo(&self) -> Repository {
        Repository::at(self.dir.path())
    }

    /// A `file://` URL suitable for `git clone`.
    #[must_use]
    pub fn url(&self) -> String {
        format!("file://{}", self.dir.path().display())
    }
}

// ---------------------------------------------------------------------------
// Mock container runtime
// ---------------------------------------------------------------------------

/// An in-memory [`ContainerRuntime`].
///
/// Builds and containers are bookkeeping only. Commits listed in
/// `failing_builds` fail their `docker build` equivalent, which is how
/// broken-commit recovery is exercised without a real daemon.
#[derive(Debug, Default)]
pub struct MockRuntime {
    state: Mutex<MockState>,
}

#[derive(Debug, Default)]
struct MockState {
    failing_builds: HashSet<String>,
    built_tags: Vec<String>,
    running: HashSet<String>,
    build_count: HashMap<String, u32>,
}

impl MockRuntime {
    /// A runtime where every build succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a commit's build as failing.
    pub fn fail_build_of(&self, commit: &str) {
        self.state
            .lock()
            .expect("mock runtime lock poisoned")
            .failing_builds
            .insert(commit.to_owned());
    }

    /// Tags built so far, in order.
    #[must_use]
    pub fn built_tags(&self) -> Vec<String> {
        self.state
            .lock()
            .expect("mock runtime lock poisoned")
            .built_tags
            .clone()
    }

    /// How many times `tag` was built.
    #[must_use]
    pub fn build_count(&self, tag: &str) -> u32 {
        self.state
            .lock()
            .expect("mock runtime lock poisoned")
            .build_count
            .get(tag)
            .copied()
            .unwrap_or(0)
    }

    /// Names of containers currently running.
    #[must_use]
    pub fn running_containers(&self) -> Vec<String> {
        let state = self.state.lock().expect("mock runtime lock poisoned");
        let mut names: Vec<String> = state.running.iter().cloned().collect();
        names.sort();
        names
    }
}

impl ContainerRuntime for MockRuntime {
    fn build_image(&self, _context: &Path, tag: &str) -> BisectResult<()> {
        let mut state = self.state.lock().expect("mock runtime lock poisoned");
        *state.build_count.entry(tag.to_owned()).or_insert(0) += 1;
        let commit = crate::cache::parse_image_tag(tag)
            .map(|(commit, _)| commit)
            .unwrap_or_default();
        if state.failing_builds.contains(&commit) {
            return Err(BisectError::ToolFailed {
                tool: "docker",
                args: vec!["build".into(), tag.into()],
                status: "exit status: 1".into(),
                stderr: "scripted build failure".into(),
            });
        }
        state.built_tags.push(tag.to_owned());
        Ok(())
    }

    fn start_container(&self, spec: &ContainerSpec) -> BisectResult<()> {
        self.state
            .lock()
            .expect("mock runtime lock poisoned")
            .running
            .insert(spec.name.clone());
        Ok(())
    }

    fn stop_container(&self, name: &str) -> BisectResult<()> {
        self.state
            .lock()
            .expect("mock runtime lock poisoned")
            .running
            .remove(name);
        Ok(())
    }

    fn labeled_images(&self) -> BisectResult<Vec<LabeledArtifact>> {
        Ok(self
            .built_tags()
            .into_iter()
            .map(|tag| LabeledArtifact {
                id: tag.clone(),
                name: tag,
            })
            .collect())
    }

    fn labeled_containers(&self) -> BisectResult<Vec<LabeledArtifact>> {
        Ok(self
            .running_containers()
            .into_iter()
            .map(|name| LabeledArtifact {
                id: name.clone(),
                name,
            })
            .collect())
    }

    fn remove_container(&self, id: &str) -> BisectResult<()> {
        self.stop_container(id)
    }

    fn remove_image(&self, id: &str) -> BisectResult<()> {
        let mut state = self.state.lock().expect("mock runtime lock poisoned");
        state.built_tags.retain(|tag| tag != id);
        Ok(())
    }
}
