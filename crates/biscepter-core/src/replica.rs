//! The replica: one independent bisection of one defect.
//!
//! Each replica owns a private working copy of the repository and a
//! background worker thread that drives the window `[lo, hi]` to
//! convergence: select a probe with the cost-model scheduler, build or
//! fetch its image, start a container, pass healthchecks, publish a
//! [`RunningSystem`], block until the oracle's verdict, shrink the window,
//! repeat. Converging on a merge commit re-bisects the merged side branch;
//! converging anywhere else emits an [`OffendingCommit`] and ends the
//! worker.
//!
//! # Turn-taking
//!
//! Probe and verdict strictly alternate. The worker parks on a condition
//! variable after publishing a system; [`RunningSystem::is_good`] /
//! [`RunningSystem::is_bad`] deposit the verdict and wake it. Taking the
//! verdict methods by value makes rating a system twice impossible.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use tempfile::TempDir;
use tracing::{debug, error, info, warn};

use crate::container::launch_container;
use crate::error::{BisectError, BisectResult};
use crate::job::JobContext;
use crate::repo::Repository;
use crate::scheduler;

/// A container that passed its healthchecks and awaits the oracle's verdict.
///
/// Exactly one of [`is_good`](Self::is_good) or [`is_bad`](Self::is_bad)
/// must eventually be called; both consume the system and free the
/// replica for its next probe.
#[derive(Debug)]
pub struct RunningSystem {
    /// Index of the replica this system belongs to.
    pub replica_index: usize,
    /// Guest port to host port, for reaching the system under test.
    pub ports: HashMap<u16, u16>,
    /// The commit actually running (after replacement resolution).
    pub commit: String,
    /// The probed position in the replica's commit sequence.
    pub commit_index: usize,
    container: String,
    turn: Arc<Turn>,
}

impl RunningSystem {
    /// Report that this system does **not** exhibit the defect.
    pub fn is_good(self) {
        self.turn.submit(Verdict::Good, self.commit_index);
    }

    /// Report that this system exhibits the defect.
    pub fn is_bad(self) {
        self.turn.submit(Verdict::Bad, self.commit_index);
    }

    /// Name of the container backing this system.
    #[must_use]
    pub fn container_name(&self) -> &str {
        &self.container
    }
}

/// The finished bisection of one replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffendingCommit {
    /// Index of the replica that converged.
    pub replica_index: usize,
    /// The first bad commit.
    pub commit: String,
    /// Its position in the replica's commit sequence.
    pub commit_index: usize,
    /// Commit message.
    pub message: String,
    /// Author date, RFC 2822.
    pub date: String,
    /// `"Author Name <email>"`.
    pub author: String,
    /// Commits collapsed into this one by the replacement map; any of
    /// these may equally be the culprit.
    pub possibly_also: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Good,
    Bad,
}

// ---------------------------------------------------------------------------
// Turn state
// ---------------------------------------------------------------------------

/// Shared rendezvous between a replica's worker, the oracle-facing
/// [`RunningSystem`], and [`Job::stop`](crate::job::Job::stop).
#[derive(Debug)]
struct Turn {
    state: Mutex<TurnState>,
    notify: Condvar,
    stopped: AtomicBool,
}

#[derive(Debug, Default)]
struct TurnState {
    verdict: Option<(Verdict, usize)>,
    live_container: Option<String>,
}

impl Turn {
    fn new() -> Self {
        Self {
            state: Mutex::new(TurnState::default()),
            notify: Condvar::new(),
            stopped: AtomicBool::new(false),
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn stopped_flag(&self) -> &AtomicBool {
        &self.stopped
    }

    /// Flag the replica as stopped, wake the worker, and hand back the
    /// live container (if any) for the caller to stop.
    fn stop(&self) -> Option<String> {
        self.stopped.store(true, Ordering::Release);
        let name = self
            .state
            .lock()
            .expect("turn lock poisoned")
            .live_container
            .take();
        self.notify.notify_all();
        name
    }

    fn set_live(&self, name: String) {
        self.state
            .lock()
            .expect("turn lock poisoned")
            .live_container = Some(name);
    }

    fn take_live(&self) -> Option<String> {
        self.state
            .lock()
            .expect("turn lock poisoned")
            .live_container
            .take()
    }

    fn submit(&self, verdict: Verdict, index: usize) {
        let mut state = self.state.lock().expect("turn lock poisoned");
        debug_assert!(state.verdict.is_none(), "system rated twice");
        state.verdict = Some((verdict, index));
        drop(state);
        self.notify.notify_all();
    }

    /// Park until a verdict arrives; `None` means the replica was stopped.
    fn wait_for_verdict(&self) -> Option<(Verdict, usize)> {
        let mut state = self.state.lock().expect("turn lock poisoned");
        loop {
            if self.is_stopped() {
                return None;
            }
            if let Some(verdict) = state.verdict.take() {
                return Some(verdict);
            }
            state = self.notify.wait(state).expect("turn lock poisoned");
        }
    }
}

// ---------------------------------------------------------------------------
// Replica
// ---------------------------------------------------------------------------

/// Handle held by the job for one replica.
pub(crate) struct Replica {
    index: usize,
    ctx: Arc<JobContext>,
    turn: Arc<Turn>,
    workdir: Option<TempDir>,
    worker: Option<thread::JoinHandle<()>>,
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

impl Replica {
    /// Copy the shared clone into a private working directory and start
    /// the worker on `commits`.
    pub(crate) fn spawn(
        ctx: Arc<JobContext>,
        index: usize,
        commits: Vec<String>,
        source: &Repository,
        rs_tx: SyncSender<RunningSystem>,
        oc_tx: SyncSender<OffendingCommit>,
    ) -> BisectResult<Self> {
        let workdir = TempDir::with_prefix("biscepter-replica")
            .map_err(|e| BisectError::io("<tempdir>", e))?;
        let repo = source.copy_to(workdir.path())?;
        let turn = Arc::new(Turn::new());

        info!(
            target: "biscepter.replica",
            replica = index,
            commits = commits.len(),
            "replica starting"
        );
        let worker = Worker {
            ctx: Arc::clone(&ctx),
            turn: Arc::clone(&turn),
            index,
            repo,
            commits,
            rs_tx,
            oc_tx,
        };
        let handle = thread::Builder::new()
            .name(format!("biscepter-replica-{index}"))
            .spawn(move || worker.run())
            .map_err(|e| BisectError::io("<worker thread>", e))?;

        Ok(Self {
            index,
            ctx,
            turn,
            workdir: Some(workdir),
            worker: Some(handle),
        })
    }

    /// Stop the worker, stop its live container, and delete the working
    /// directory. In-flight builds are left to finish into the cache.
    pub(crate) fn stop(&mut self) {
        info!(target: "biscepter.replica", replica = self.index, "stopping replica");
        if let Some(container) = self.turn.stop() {
            if let Err(err) = self.ctx.runtime.stop_container(&container) {
                warn!(
                    target: "biscepter.replica",
                    replica = self.index,
                    container = %container,
                    error = %err,
                    "failed to stop live container"
                );
            }
        }
        // The worker is detached: it observes the stop flag at its next
        // suspension point and exits on its own.
        drop(self.worker.take());
        drop(self.workdir.take());
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

struct Worker {
    ctx: Arc<JobContext>,
    turn: Arc<Turn>,
    index: usize,
    repo: Repository,
    commits: Vec<String>,
    rs_tx: SyncSender<RunningSystem>,
    oc_tx: SyncSender<OffendingCommit>,
}

impl Worker {
    fn run(mut self) {
        if let Err(err) = self.bisect() {
            if self.turn.is_stopped() {
                debug!(
                    target: "biscepter.replica",
                    replica = self.index,
                    error = %err,
                    "ignoring error from stopped replica"
                );
            } else {
                error!(
                    target: "biscepter.replica",
                    replica = self.index,
                    error = %err,
                    "replica terminated with error"
                );
            }
        }
    }

    fn bisect(&mut self) -> BisectResult<()> {
        let mut lo = 0_usize;
        let mut hi = self.commits.len() - 1;
        loop {
            debug_assert!(lo <= hi && hi < self.commits.len());
            if self.turn.is_stopped() {
                return Ok(());
            }

            // Convergence, possibly through a chain of merge commits.
            while hi <= lo + 1 {
                if hi > 0
                    && self.commits[hi] != self.commits[lo]
                    && self.recurse_into_merge(&mut lo, &mut hi)?
                {
                    continue;
                }
                self.emit_offending(hi)?;
                return Ok(());
            }

            let Some(_permit) = self.ctx.semaphore.acquire(self.turn.stopped_flag()) else {
                return Ok(());
            };

            let probe_index = scheduler::next_probe_index(
                lo,
                hi,
                &self.commits,
                self.ctx.build_cost,
                &|commit| self.ctx.cache.is_commit_built(commit),
            );
            debug!(
                target: "biscepter.replica",
                replica = self.index,
                lo,
                hi,
                probe = probe_index,
                commit = %self.commits[probe_index],
                "probing"
            );

            let Some((verdict, position)) = self.probe(probe_index)? else {
                return Ok(()); // stopped mid-probe
            };

            match verdict {
                Verdict::Good => {
                    if position >= lo {
                        lo = position;
                    }
                }
                Verdict::Bad => {
                    if position <= hi {
                        hi = position;
                    }
                }
            }
            debug!(
                target: "biscepter.replica",
                replica = self.index,
                ?verdict,
                position,
                lo,
                hi,
                "verdict applied"
            );
        }
    }

    /// Build, launch, healthcheck, publish, and await the verdict for the
    /// commit at `probe_index`. Broken commits are replaced and retried
    /// within the same turn (the admission permit stays held by the
    /// caller). Returns `None` when the replica was stopped.
    fn probe(&self, probe_index: usize) -> BisectResult<Option<(Verdict, usize)>> {
        let target = self.commits[probe_index].clone();
        let repo = &self.repo;
        let ctx = &self.ctx;

        loop {
            if self.turn.is_stopped() {
                return Ok(None);
            }

            let built = ctx.cache.build_or_get(&target, &self.commits, &|commit, tag| {
                repo.checkout_clean(commit)?;
                let dockerfile = repo.path().join("Dockerfile");
                std::fs::write(&dockerfile, &ctx.dockerfile)
                    .map_err(|e| BisectError::io(dockerfile, e))?;
                ctx.runtime.build_image(repo.path(), tag)
            })?;

            let launched = launch_container(
                ctx.runtime.as_ref(),
                &built.tag,
                &ctx.host,
                &ctx.guest_ports,
            )?;

            let mut failed_check = None;
            for check in &ctx.healthchecks {
                if let Err(err) = check.run(&ctx.host, &launched.ports) {
                    failed_check = Some(err);
                    break;
                }
            }
            if let Some(err) = failed_check {
                warn!(
                    target: "biscepter.replica",
                    replica = self.index,
                    commit = %built.commit,
                    error = %err,
                    "healthchecks failed, replacing commit"
                );
                if let Err(stop_err) = ctx.runtime.stop_container(&launched.name) {
                    warn!(
                        target: "biscepter.replica",
                        replica = self.index,
                        container = %launched.name,
                        error = %stop_err,
                        "failed to stop unhealthy container"
                    );
                }
                ctx.cache.replace_commit(&built.commit, &self.commits)?;
                continue;
            }

            self.turn.set_live(launched.name.clone());
            let system = RunningSystem {
                replica_index: self.index,
                ports: launched.ports.clone(),
                commit: built.commit.clone(),
                commit_index: probe_index,
                container: launched.name.clone(),
                turn: Arc::clone(&self.turn),
            };
            info!(
                target: "biscepter.replica",
                replica = self.index,
                commit = %built.commit,
                container = %launched.name,
                "system ready for testing"
            );
            if self.rs_tx.send(system).is_err() {
                // Nobody is listening anymore; shut the container down and
                // end the bisection quietly.
                self.turn.take_live();
                let _ = ctx.runtime.stop_container(&launched.name);
                return Ok(None);
            }

            let Some(verdict) = self.turn.wait_for_verdict() else {
                // Stopped while waiting. Whoever takes the live entry stops
                // the container; Job::stop may already have done so.
                if let Some(name) = self.turn.take_live() {
                    let _ = ctx.runtime.stop_container(&name);
                }
                return Ok(None);
            };

            if self.turn.take_live().is_some() {
                let runtime = Arc::clone(&ctx.runtime);
                let name = launched.name.clone();
                thread::spawn(move || {
                    let _ = runtime.stop_container(&name);
                });
            }
            return Ok(Some(verdict));
        }
    }

    /// If the window converged onto a merge commit whose first parent is
    /// the known-good boundary, restart the bisection over the merged side
    /// branch. Returns whether a recursion happened.
    fn recurse_into_merge(&mut self, lo: &mut usize, hi: &mut usize) -> BisectResult<bool> {
        // A merge whose parents do not include the known-good boundary is
        // treated like an ordinary commit.
        let merged = match self
            .repo
            .merged_parent(&self.commits[*hi], &self.commits[*lo])
        {
            Ok(Some(merged)) => merged,
            Ok(None) | Err(BisectError::UnknownCommit { .. }) => return Ok(false),
            Err(err) => return Err(err),
        };
        info!(
            target: "biscepter.replica",
            replica = self.index,
            merge = %self.commits[*hi],
            merged_branch_tip = %merged,
            "converged on merge commit, bisecting merged branch"
        );
        let sequence = self
            .repo
            .first_parent_range(&self.commits[*lo], &merged)?;
        if sequence.len() < 2 {
            return Ok(false);
        }
        self.commits = sequence;
        *lo = 0;
        *hi = self.commits.len() - 1;
        Ok(true)
    }

    fn emit_offending(&self, hi: usize) -> BisectResult<()> {
        let commit = self.commits[hi].clone();
        let meta = self.repo.metadata(&commit)?;
        let possibly_also = self.ctx.cache.replacements().equivalence_class(&commit);
        info!(
            target: "biscepter.replica",
            replica = self.index,
            commit = %commit,
            aliases = possibly_also.len(),
            "bisection converged"
        );
        let offending = OffendingCommit {
            replica_index: self.index,
            commit,
            commit_index: hi,
            message: meta.message,
            date: meta.date,
            author: meta.author,
            possibly_also,
        };
        // A dropped receiver just means nobody cares about the result.
        let _ = self.oc_tx.send(offending);
        Ok(())
    }
}
