//! Concurrent, build-cost-aware git bisection over container images.
//!
//! Given a good and a bad commit, a [`Job`] locates the first offending
//! commit by building candidate commits into Docker images, running them,
//! and asking an external oracle for a good/bad verdict on each
//! [`RunningSystem`]. Several replicas can bisect independent defects over
//! the same range at once; they share a process-wide image cache so
//! expensive builds are amortized, and the scheduler picks probes that
//! favor already built commits when builds are costly.
//!
//! Commits that fail to build (or whose containers never become healthy)
//! are transparently replaced by their successors and journaled to disk so
//! later runs skip them immediately.
//!
//! ```no_run
//! use biscepter_core::Job;
//!
//! let mut job = Job::default();
//! job.replicas_count = 1;
//! job.repository = "https://github.com/example/service.git".into();
//! job.good_commit = "8ee0e2a".into();
//! job.bad_commit = "9b70eda".into();
//! job.ports = vec![3333];
//! job.dockerfile = Some("FROM rust:1.75\nCOPY . .\nCMD cargo run".into());
//! let (systems, offenders) = job.run()?;
//! for system in systems {
//!     // Drive the system under test through its mapped ports, then:
//!     system.is_bad();
//! }
//! let offending = offenders.recv().expect("bisection result");
//! println!("first bad commit: {}", offending.commit);
//! # Ok::<(), biscepter_core::BisectError>(())
//! ```

pub mod cache;
pub mod concurrency;
pub mod config;
pub mod container;
pub mod error;
pub mod healthcheck;
pub mod job;
pub mod replica;
pub mod repo;
mod scheduler;
pub mod testutil;

pub use cache::{dockerfile_digest, image_tag, parse_image_tag, ImageCache, ReplacementJournal, IMAGE_LABEL};
pub use config::{CheckType, HealthcheckConfig, JobConfig};
pub use container::{ContainerRuntime, ContainerSpec, DockerCli, LabeledArtifact};
pub use error::{BisectError, BisectResult};
pub use healthcheck::{Healthcheck, HealthcheckKind, RetryPolicy};
pub use job::{Job, DEFAULT_HOST, DEFAULT_REPLACEMENTS_PATH};
pub use replica::{OffendingCommit, RunningSystem};
pub use repo::{CommitMetadata, Repository};
