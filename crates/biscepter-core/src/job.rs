//! The job: the aggregate of replicas bisecting one commit range.
//!
//! [`Job::run`] bootstraps everything the replicas share (the clone, the
//! commit sequence, the image cache, the replacement journal, the admission
//! semaphore) and then spawns one worker per replica. Results flow out of
//! two bounded streams: ready-to-test systems and offending commits. When
//! every replica has converged, all stream senders are gone and the
//! receivers report disconnection, which is how consumers detect that the
//! job has finished.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;
use std::thread;

use tempfile::TempDir;
use tracing::{info, warn};

use crate::cache::{dockerfile_digest, ImageCache, ReplacementJournal};
use crate::concurrency::Semaphore;
use crate::container::{ContainerRuntime, DockerCli};
use crate::error::{BisectError, BisectResult};
use crate::healthcheck::Healthcheck;
use crate::replica::{OffendingCommit, Replica, RunningSystem};
use crate::repo::Repository;

/// Default bind address for container ports.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default path of the replacement journal.
pub const DEFAULT_REPLACEMENTS_PATH: &str = ".biscepter-replacements~";

/// Capacity of the ready-system and offending-commit streams.
const STREAM_CAPACITY: usize = 100;

/// Everything the replicas of one job share.
pub(crate) struct JobContext {
    pub(crate) cache: ImageCache,
    pub(crate) runtime: Arc<dyn ContainerRuntime>,
    pub(crate) semaphore: Semaphore,
    pub(crate) host: String,
    pub(crate) guest_ports: BTreeSet<u16>,
    pub(crate) healthchecks: Vec<Healthcheck>,
    pub(crate) dockerfile: String,
    pub(crate) build_cost: f64,
}

struct RunState {
    ctx: Arc<JobContext>,
    clone_dir: Option<TempDir>,
    repo: Repository,
    commits: Vec<String>,
    replicas: Vec<Replica>,
}

/// A bisection job: the blueprint plus, once running, its replicas.
///
/// Fill in the public fields (or use [`Job::from_config_reader`]) and call
/// [`run`](Self::run). Each of the `replicas_count` replicas bisects one
/// independent defect over the same `good_commit..bad_commit` range.
#[derive(Default)]
pub struct Job {
    /// How many replicas to spawn; each bisects one defect.
    pub replicas_count: usize,
    /// Build-cost multiplier β. Building a commit is treated as β times as
    /// expensive as running an already built one; β < 1 always probes the
    /// exact midpoint.
    pub build_cost: f64,
    /// Host address container ports bind to. Empty means `127.0.0.1`; use
    /// `0.0.0.0` to make systems reachable from elsewhere.
    pub host: String,
    /// Guest ports the system under test exposes.
    pub ports: Vec<u16>,
    /// Readiness checks each system must pass before being published.
    pub healthchecks: Vec<Healthcheck>,
    /// The known-good commit (no defect).
    pub good_commit: String,
    /// The known-bad commit (exhibits the defects under bisection).
    pub bad_commit: String,
    /// Dockerfile text used to build every commit.
    pub dockerfile: Option<String>,
    /// Path to the Dockerfile; only used when `dockerfile` is `None`.
    pub dockerfile_path: Option<PathBuf>,
    /// URL of the repository to bisect.
    pub repository: String,
    /// Cap on concurrently probing replicas; 0 means unlimited.
    pub max_concurrent_replicas: usize,
    /// Where commit replacements are journaled across runs. `None` uses
    /// [`DEFAULT_REPLACEMENTS_PATH`] in the working directory.
    pub replacements_path: Option<PathBuf>,
    /// Container backend; `None` uses the Docker CLI.
    pub runtime: Option<Arc<dyn ContainerRuntime>>,
    /// Keep replacements in memory only (single-commit convenience runs).
    pub(crate) transient_replacements: bool,
    state: Option<RunState>,
}

impl Job {
    /// Start the job: clone, enumerate the range, warm the cache, spawn
    /// the replicas.
    ///
    /// Returns the ready-system and offending-commit streams. Every
    /// replica publishes each probe on the first stream and its final
    /// verdict on the second; once an [`OffendingCommit`] for a replica
    /// arrived, that replica publishes nothing further.
    ///
    /// # Errors
    ///
    /// Configuration problems (missing Dockerfile, malformed journal),
    /// an unreachable range, and container runtime discovery failures are
    /// all fatal here. If any replica fails to start, every previously
    /// started replica is stopped before the error is returned.
    pub fn run(
        &mut self,
    ) -> BisectResult<(Receiver<RunningSystem>, Receiver<OffendingCommit>)> {
        let host = if self.host.is_empty() {
            DEFAULT_HOST.to_owned()
        } else {
            self.host.clone()
        };
        let permits = if self.max_concurrent_replicas == 0 {
            usize::MAX
        } else {
            self.max_concurrent_replicas
        };

        let journal = if self.transient_replacements {
            ReplacementJournal::in_memory()
        } else {
            let path = self
                .replacements_path
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_REPLACEMENTS_PATH));
            ReplacementJournal::open(&path)?
        };

        let dockerfile = self.resolve_dockerfile()?;
        let digest = dockerfile_digest(&dockerfile);

        info!(target: "biscepter.job", repository = %self.repository, "cloning repository");
        let clone_dir = TempDir::with_prefix("biscepter")
            .map_err(|e| BisectError::io("<tempdir>", e))?;
        let repo = Repository::clone_from(&self.repository, clone_dir.path())?;

        let good = repo.rev_parse(&self.good_commit)?;
        let bad = repo.rev_parse(&self.bad_commit)?;
        if !repo.reachable_first_parent(&good, &bad)? {
            return Err(BisectError::UnreachableRange { good, bad });
        }

        info!(target: "biscepter.job", "enumerating commit range");
        let commits = repo.first_parent_range(&good, &bad)?;

        let runtime = self
            .runtime
            .clone()
            .unwrap_or_else(DockerCli::shared);

        info!(target: "biscepter.job", "discovering previously built images");
        let cache = ImageCache::new(digest, journal);
        cache.warm(
            runtime
                .labeled_images()?
                .into_iter()
                .map(|artifact| artifact.name),
        );

        let mut guest_ports: BTreeSet<u16> = self.ports.iter().copied().collect();
        guest_ports.extend(self.healthchecks.iter().map(|check| check.port));

        let ctx = Arc::new(JobContext {
            cache,
            runtime,
            semaphore: Semaphore::new(permits),
            host,
            guest_ports,
            healthchecks: self.healthchecks.clone(),
            dockerfile,
            build_cost: self.build_cost,
        });

        let (rs_tx, rs_rx) = sync_channel(STREAM_CAPACITY);
        let (oc_tx, oc_rx) = sync_channel(STREAM_CAPACITY);

        info!(
            target: "biscepter.job",
            replicas = self.replicas_count,
            commits = commits.len(),
            "starting replicas"
        );
        let mut replicas: Vec<Replica> = Vec::with_capacity(self.replicas_count);
        for index in 0..self.replicas_count {
            match Replica::spawn(
                Arc::clone(&ctx),
                index,
                commits.clone(),
                &repo,
                rs_tx.clone(),
                oc_tx.clone(),
            ) {
                Ok(replica) => replicas.push(replica),
                Err(err) => {
                    warn!(
                        target: "biscepter.job",
                        replica = index,
                        error = %err,
                        "replica failed to start, rolling back"
                    );
                    for started in &mut replicas {
                        started.stop();
                    }
                    return Err(err);
                }
            }
        }

        self.state = Some(RunState {
            ctx,
            clone_dir: Some(clone_dir),
            repo,
            commits,
            replicas,
        });
        Ok((rs_rx, oc_rx))
    }

    /// Stop all replicas, their containers, and remove all working
    /// directories including the shared clone. In-flight builds finish
    /// into the cache and are reused by the next run.
    pub fn stop(&mut self) {
        if let Some(mut state) = self.state.take() {
            for replica in &mut state.replicas {
                replica.stop();
            }
            drop(state.clone_dir.take());
        }
    }

    /// The enumerated commit sequence, available once [`run`](Self::run)
    /// has succeeded.
    #[must_use]
    pub fn commits(&self) -> Option<&[String]> {
        self.state.as_ref().map(|state| state.commits.as_slice())
    }

    /// Spin up a single system running the commit at `offset` in the
    /// enumerated sequence (0 is the good commit). Blocks until the
    /// system passed its healthchecks. Rendering any verdict on the
    /// returned system terminates it.
    ///
    /// # Errors
    ///
    /// Fails if [`run`](Self::run) was not called, the offset is out of
    /// range, or the system could not be brought up.
    pub fn run_commit_by_offset(&self, offset: usize) -> BisectResult<RunningSystem> {
        let state = self.state.as_ref().ok_or_else(|| BisectError::InvalidConfig {
            field: "job".into(),
            value: "<not running>".into(),
            reason: "run() must succeed before run_commit_by_offset".into(),
        })?;
        let commit = state
            .commits
            .get(offset)
            .ok_or(BisectError::OffsetOutOfRange {
                offset,
                len: state.commits.len(),
            })?;
        self.run_commit_by_hash(commit)
    }

    /// Spin up a single system running `commit`, which does not have to
    /// lie within the bisected range. Blocks until the system passed its
    /// healthchecks. Rendering any verdict on the returned system
    /// terminates it.
    ///
    /// Replacements recorded during such a run are not journaled.
    ///
    /// # Errors
    ///
    /// Fails if the commit is unknown to the repository or the system
    /// could not be brought up.
    pub fn run_commit_by_hash(&self, commit: &str) -> BisectResult<RunningSystem> {
        let mut sub = Job {
            replicas_count: 0,
            build_cost: self.build_cost,
            host: self.host.clone(),
            ports: self.ports.clone(),
            healthchecks: self.healthchecks.clone(),
            good_commit: commit.to_owned(),
            bad_commit: commit.to_owned(),
            dockerfile: self.dockerfile.clone(),
            dockerfile_path: self.dockerfile_path.clone(),
            repository: self.repository.clone(),
            max_concurrent_replicas: 0,
            replacements_path: None,
            runtime: self.runtime.clone(),
            transient_replacements: true,
            state: None,
        };
        let (_rs, _oc) = sub.run()?;

        let state = sub.state.as_ref().ok_or_else(|| BisectError::InvalidConfig {
            field: "job".into(),
            value: commit.to_owned(),
            reason: "single-commit sub-job did not initialize".into(),
        })?;
        let full = state.repo.rev_parse(commit)?;

        let (rs_tx, rs_rx): (SyncSender<RunningSystem>, _) = sync_channel(1);
        let (oc_tx, oc_rx) = sync_channel(1);
        // Repeating the commit three times gives the replica exactly one
        // probe (the midpoint) before it converges.
        let mut replica = Replica::spawn(
            Arc::clone(&state.ctx),
            0,
            vec![full.clone(), full.clone(), full],
            &state.repo,
            rs_tx,
            oc_tx,
        )?;

        // Tear the sub-job down once the verdict arrived.
        thread::spawn(move || {
            let _ = oc_rx.recv();
            replica.stop();
            sub.stop();
        });

        rs_rx
            .recv()
            .map_err(|_| BisectError::ReplicaStopped { replica: 0 })
    }

    fn resolve_dockerfile(&self) -> BisectResult<String> {
        if let Some(text) = self.dockerfile.as_ref().filter(|text| !text.is_empty()) {
            return Ok(text.clone());
        }
        match &self.dockerfile_path {
            Some(path) => std::fs::read_to_string(path).map_err(|e| BisectError::io(path, e)),
            None => Err(BisectError::InvalidConfig {
                field: "dockerfile".into(),
                value: String::new(),
                reason: "either dockerfile or dockerfilePath must be set".into(),
            }),
        }
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        self.stop();
    }
}
