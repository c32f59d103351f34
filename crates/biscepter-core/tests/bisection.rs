//! End-to-end bisection scenarios against throwaway git repositories.
//!
//! The container side runs on the in-memory mock runtime, so these tests
//! exercise the real repository operations, cache, scheduler, replica
//! state machine, and job plumbing without a Docker daemon. The oracle
//! decides verdicts from each commit's creation sequence number: a system
//! is defective when its commit's number is at or above the defect
//! commit's number.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use biscepter_core::testutil::{FixtureRepo, MockRuntime};
use biscepter_core::{
    BisectResult, ContainerRuntime, ContainerSpec, Job, LabeledArtifact, OffendingCommit,
    RunningSystem,
};

const DEADLINE: Duration = Duration::from_secs(60);

fn base_job(
    fixture: &FixtureRepo,
    replicas: usize,
    runtime: Arc<dyn ContainerRuntime>,
) -> (Job, tempfile::TempDir) {
    let journal_dir = tempfile::tempdir().unwrap();
    let mut job = Job::default();
    job.replicas_count = replicas;
    job.good_commit = fixture.commits.first().cloned().unwrap();
    job.bad_commit = fixture.commits.last().cloned().unwrap();
    job.repository = fixture.url();
    job.dockerfile = Some("FROM scratch\nCMD true\n".into());
    job.ports = vec![3333];
    job.build_cost = 10.0;
    job.runtime = Some(runtime);
    job.replacements_path = Some(journal_dir.path().join("replacements~"));
    (job, journal_dir)
}

/// Drive a running job to completion: answer every published system using
/// `is_defective` and collect one offending commit per replica.
fn drive_oracle(
    systems: &Receiver<RunningSystem>,
    offenders: &Receiver<OffendingCommit>,
    replicas: usize,
    is_defective: impl Fn(&RunningSystem) -> bool,
) -> Vec<OffendingCommit> {
    let started = Instant::now();
    let mut found: Vec<OffendingCommit> = Vec::new();
    let mut disconnected = false;
    while found.len() < replicas {
        assert!(started.elapsed() < DEADLINE, "bisection did not converge");
        while let Ok(offending) = offenders.try_recv() {
            found.push(offending);
        }
        if found.len() >= replicas {
            break;
        }
        if disconnected {
            match offenders.recv_timeout(Duration::from_millis(200)) {
                Ok(offending) => found.push(offending),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    panic!("streams closed before every replica converged")
                }
            }
            continue;
        }
        match systems.recv_timeout(Duration::from_millis(100)) {
            Ok(system) => {
                assert!(
                    system.ports.contains_key(&3333),
                    "exposed port 3333 was not mapped"
                );
                if is_defective(&system) {
                    system.is_bad();
                } else {
                    system.is_good();
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => disconnected = true,
        }
    }
    found
}

fn offender_by_replica(found: &[OffendingCommit], replica: usize) -> &OffendingCommit {
    found
        .iter()
        .find(|offending| offending.replica_index == replica)
        .unwrap_or_else(|| panic!("no offending commit for replica {replica}"))
}

#[test]
fn single_replica_converges_on_the_defect() {
    let fixture = FixtureRepo::linear(&["one", "two", "three", "four", "five", "six"]);
    let defect = fixture.commits[3].clone();
    let threshold = fixture.values[&defect];
    let values = fixture.values.clone();

    let (mut job, _journal) = base_job(&fixture, 1, Arc::new(MockRuntime::new()));
    let dir = tempfile::tempdir().unwrap();
    job.replacements_path = Some(dir.path().join("replacements~"));

    let (systems, offenders) = job.run().unwrap();
    let found = drive_oracle(&systems, &offenders, 1, |system| {
        values[&system.commit] >= threshold
    });

    assert_eq!(found.len(), 1);
    let offending = &found[0];
    assert_eq!(offending.commit, defect);
    assert_eq!(offending.commit_index, 3);
    assert_eq!(offending.message, "four");
    assert_eq!(offending.author, "Fixture <fixture@example.com>");
    assert!(offending.possibly_also.is_empty());
    job.stop();
}

#[test]
fn probes_stay_strictly_inside_the_window() {
    let fixture = FixtureRepo::linear(&["a", "b", "c", "d", "e", "f", "g", "h"]);
    let defect = fixture.commits[5].clone();
    let threshold = fixture.values[&defect];
    let values = fixture.values.clone();

    let (mut job, _journal) = base_job(&fixture, 1, Arc::new(MockRuntime::new()));
    let (systems, offenders) = job.run().unwrap();

    // Shadow the replica's window with the published verdict rules and
    // assert every probe lands strictly inside it.
    let mut lo = 0_usize;
    let mut hi = fixture.commits.len() - 1;
    let started = Instant::now();
    let offending = loop {
        assert!(started.elapsed() < DEADLINE, "bisection did not converge");
        if let Ok(offending) = offenders.try_recv() {
            break offending;
        }
        match systems.recv_timeout(Duration::from_millis(100)) {
            Ok(system) => {
                let probe = system.commit_index;
                assert!(probe > lo && probe < hi, "probe {probe} outside ({lo}, {hi})");
                if values[&system.commit] >= threshold {
                    assert!(probe <= hi, "hi must never increase");
                    hi = probe;
                    system.is_bad();
                } else {
                    assert!(probe >= lo, "lo must never decrease");
                    lo = probe;
                    system.is_good();
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                break offenders.recv().expect("offending commit after close");
            }
        }
    };
    assert_eq!(hi, lo + 1, "converged window must have length two");
    assert_eq!(offending.commit, defect);
    job.stop();
}

#[test]
fn three_replicas_bisect_three_defects() {
    let fixture = FixtureRepo::linear(&["one", "two", "three", "four", "five", "six"]);
    let defects = [
        fixture.commits[1].clone(),
        fixture.commits[2].clone(),
        fixture.commits[4].clone(),
    ];
    let thresholds: Vec<u32> = defects.iter().map(|c| fixture.values[c]).collect();
    let values = fixture.values.clone();

    let (mut job, _journal) = base_job(&fixture, 3, Arc::new(MockRuntime::new()));
    let (systems, offenders) = job.run().unwrap();
    let found = drive_oracle(&systems, &offenders, 3, |system| {
        values[&system.commit] >= thresholds[system.replica_index]
    });

    for (replica, defect) in defects.iter().enumerate() {
        assert_eq!(&offender_by_replica(&found, replica).commit, defect);
    }
    job.stop();
}

#[test]
fn concurrency_cap_of_one_still_converges() {
    let fixture = FixtureRepo::linear(&["one", "two", "three", "four", "five"]);
    let defects = [fixture.commits[2].clone(), fixture.commits[3].clone()];
    let thresholds: Vec<u32> = defects.iter().map(|c| fixture.values[c]).collect();
    let values = fixture.values.clone();

    let (mut job, _journal) = base_job(&fixture, 2, Arc::new(MockRuntime::new()));
    job.max_concurrent_replicas = 1;
    let (systems, offenders) = job.run().unwrap();
    let found = drive_oracle(&systems, &offenders, 2, |system| {
        values[&system.commit] >= thresholds[system.replica_index]
    });

    for (replica, defect) in defects.iter().enumerate() {
        assert_eq!(&offender_by_replica(&found, replica).commit, defect);
    }
    job.stop();
}

#[test]
fn merge_commits_are_bisected_into_the_side_branch() {
    let fixture = FixtureRepo::with_merge();
    // Three replicas whose defects converge through three different paths:
    // inside the merged branch, at its tip, and past the merge.
    let defects = [
        fixture.branch_commits[0].clone(),
        fixture.branch_commits[1].clone(),
        fixture.commits[3].clone(),
    ];
    let thresholds: Vec<u32> = defects.iter().map(|c| fixture.values[c]).collect();
    let values = fixture.values.clone();

    let (mut job, _journal) = base_job(&fixture, 3, Arc::new(MockRuntime::new()));
    let (systems, offenders) = job.run().unwrap();
    let found = drive_oracle(&systems, &offenders, 3, |system| {
        values[&system.commit] >= thresholds[system.replica_index]
    });

    for (replica, defect) in defects.iter().enumerate() {
        assert_eq!(
            &offender_by_replica(&found, replica).commit,
            defect,
            "replica {replica} converged on the wrong commit"
        );
    }
    job.stop();
}

#[test]
fn broken_build_is_replaced_and_journaled() {
    let fixture = FixtureRepo::linear(&["one", "two", "three", "four", "five", "six"]);
    let broken = fixture.commits[3].clone();
    let substitute = fixture.commits[4].clone();
    let threshold = fixture.values[&broken];
    let values = fixture.values.clone();

    let runtime = Arc::new(MockRuntime::new());
    runtime.fail_build_of(&broken);

    let dir = tempfile::tempdir().unwrap();
    let journal_path = dir.path().join("replacements~");
    let (mut job, _journal) = base_job(&fixture, 1, runtime);
    job.replacements_path = Some(journal_path.clone());

    let (systems, offenders) = job.run().unwrap();
    let found = drive_oracle(&systems, &offenders, 1, |system| {
        values[&system.commit] >= threshold
    });

    assert_eq!(
        std::fs::read_to_string(&journal_path).unwrap(),
        format!("{broken}:{substitute},")
    );
    let offending = &found[0];
    assert_eq!(offending.commit, broken);
    assert_eq!(offending.possibly_also, vec![substitute]);
    job.stop();
}

/// Delegates to [`MockRuntime`] but records the commit of the most recently
/// started container in a marker file, so a script healthcheck can fail
/// for one specific commit.
struct CommitMarkingRuntime {
    inner: MockRuntime,
    marker: PathBuf,
}

impl ContainerRuntime for CommitMarkingRuntime {
    fn build_image(&self, context: &Path, tag: &str) -> BisectResult<()> {
        self.inner.build_image(context, tag)
    }

    fn start_container(&self, spec: &ContainerSpec) -> BisectResult<()> {
        let commit = biscepter_core::parse_image_tag(&spec.image)
            .map(|(commit, _)| commit)
            .unwrap_or_default();
        std::fs::write(&self.marker, commit).expect("write commit marker");
        self.inner.start_container(spec)
    }

    fn stop_container(&self, name: &str) -> BisectResult<()> {
        self.inner.stop_container(name)
    }

    fn labeled_images(&self) -> BisectResult<Vec<LabeledArtifact>> {
        self.inner.labeled_images()
    }

    fn labeled_containers(&self) -> BisectResult<Vec<LabeledArtifact>> {
        self.inner.labeled_containers()
    }

    fn remove_container(&self, id: &str) -> BisectResult<()> {
        self.inner.remove_container(id)
    }

    fn remove_image(&self, id: &str) -> BisectResult<()> {
        self.inner.remove_image(id)
    }
}

#[test]
fn broken_healthcheck_is_replaced_and_journaled() {
    let fixture = FixtureRepo::linear(&["one", "two", "three", "four", "five", "six"]);
    let broken = fixture.commits[3].clone();
    let substitute = fixture.commits[4].clone();
    let threshold = fixture.values[&broken];
    let values = fixture.values.clone();

    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("current-commit");
    let journal_path = dir.path().join("replacements~");
    let runtime = Arc::new(CommitMarkingRuntime {
        inner: MockRuntime::new(),
        marker: marker.clone(),
    });

    let (mut job, _journal) = base_job(&fixture, 1, runtime);
    job.replacements_path = Some(journal_path.clone());
    job.healthchecks = vec![biscepter_core::Healthcheck {
        port: 3333,
        kind: biscepter_core::HealthcheckKind::Script,
        data: format!(
            "if [ \"$(cat {})\" = \"{broken}\" ]; then exit 1; fi; exit 0",
            marker.display()
        ),
        policy: biscepter_core::RetryPolicy {
            retries: 2,
            backoff: Duration::from_millis(1),
            backoff_increment: Duration::ZERO,
            max_backoff: Duration::from_millis(1),
        },
    }];

    let (systems, offenders) = job.run().unwrap();
    let found = drive_oracle(&systems, &offenders, 1, |system| {
        values[&system.commit] >= threshold
    });

    assert_eq!(
        std::fs::read_to_string(&journal_path).unwrap(),
        format!("{broken}:{substitute},")
    );
    assert_eq!(found[0].commit, broken);
    job.stop();
}

#[test]
fn journal_from_previous_run_short_circuits_rebuilds() {
    let fixture = FixtureRepo::linear(&["one", "two", "three", "four", "five", "six"]);
    let broken = fixture.commits[3].clone();
    let substitute = fixture.commits[4].clone();
    let threshold = fixture.values[&broken];
    let values = fixture.values.clone();

    let dir = tempfile::tempdir().unwrap();
    let journal_path = dir.path().join("replacements~");
    std::fs::write(&journal_path, format!("{broken}:{substitute},")).unwrap();

    let runtime = Arc::new(MockRuntime::new());
    let (mut job, _journal) = base_job(&fixture, 1, Arc::clone(&runtime) as Arc<dyn ContainerRuntime>);
    job.replacements_path = Some(journal_path);

    let (systems, offenders) = job.run().unwrap();
    let found = drive_oracle(&systems, &offenders, 1, |system| {
        assert_ne!(system.commit, broken, "replaced commit must never run");
        values[&system.commit] >= threshold
    });

    assert_eq!(found[0].commit, broken);
    let broken_tag_builds: u32 = runtime
        .built_tags()
        .iter()
        .filter(|tag| tag.contains(&broken))
        .count() as u32;
    assert_eq!(broken_tag_builds, 0, "journaled commit was rebuilt");
    job.stop();
}

#[test]
fn stop_terminates_workers_and_containers() {
    let fixture = FixtureRepo::linear(&["one", "two", "three", "four", "five"]);
    let runtime = Arc::new(MockRuntime::new());
    let (mut job, _journal) = base_job(&fixture, 1, Arc::clone(&runtime) as Arc<dyn ContainerRuntime>);

    let (systems, _offenders) = job.run().unwrap();
    // Wait for the first system, then stop the job instead of rating it.
    let system = systems
        .recv_timeout(DEADLINE)
        .expect("first system never appeared");
    assert_eq!(runtime.running_containers().len(), 1);
    job.stop();
    drop(system);

    let started = Instant::now();
    loop {
        match systems.recv_timeout(Duration::from_millis(100)) {
            Err(RecvTimeoutError::Disconnected) => break,
            Ok(_) | Err(RecvTimeoutError::Timeout) => {
                assert!(started.elapsed() < DEADLINE, "worker did not shut down");
            }
        }
    }
    assert!(
        runtime.running_containers().is_empty(),
        "live container survived stop"
    );
}

#[test]
fn run_commit_by_offset_brings_up_exactly_that_commit() {
    let fixture = FixtureRepo::linear(&["one", "two", "three"]);
    let runtime = Arc::new(MockRuntime::new());
    let (mut job, _journal) = base_job(&fixture, 0, runtime);

    let (_systems, _offenders) = job.run().unwrap();
    let system = job.run_commit_by_offset(1).unwrap();
    assert_eq!(system.commit, fixture.commits[1]);
    assert!(system.ports.contains_key(&3333));
    system.is_good();

    let err = job.run_commit_by_offset(99).unwrap_err();
    assert!(matches!(
        err,
        biscepter_core::BisectError::OffsetOutOfRange { .. }
    ));
    job.stop();
}

#[test]
fn shared_cache_builds_each_commit_once_across_replicas() {
    let fixture = FixtureRepo::linear(&["one", "two", "three", "four", "five", "six"]);
    let defect = fixture.commits[3].clone();
    let threshold = fixture.values[&defect];
    let values = fixture.values.clone();

    let runtime = Arc::new(MockRuntime::new());
    let (mut job, _journal) = base_job(&fixture, 3, Arc::clone(&runtime) as Arc<dyn ContainerRuntime>);
    let (systems, offenders) = job.run().unwrap();
    // All three replicas hunt the same defect, so they probe overlapping
    // commits; the per-commit build mutex must deduplicate the builds.
    let _found = drive_oracle(&systems, &offenders, 3, |system| {
        values[&system.commit] >= threshold
    });

    let mut counts: HashMap<String, u32> = HashMap::new();
    for tag in runtime.built_tags() {
        *counts.entry(tag).or_insert(0) += 1;
    }
    for (tag, count) in counts {
        assert_eq!(count, 1, "image {tag} was built {count} times");
    }
    job.stop();
}
