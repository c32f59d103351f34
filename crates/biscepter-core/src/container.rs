//! Container lifecycle: building images, launching probe containers, and
//! allocating host ports.
//!
//! All Docker interaction is behind the [`ContainerRuntime`] trait; the
//! production implementation ([`DockerCli`]) shells out to the `docker`
//! binary. Containers run detached with `--rm`, so stopping one also
//! removes it, and everything biscepter creates carries the
//! `biscepter=1` label for later cleanup.

use std::collections::{BTreeSet, HashMap};
use std::net::TcpListener;
use std::path::Path;
use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::debug;

use crate::cache::IMAGE_LABEL;
use crate::error::{BisectError, BisectResult};
use crate::repo::run_tool;

/// An image or container found by a label query, for cleanup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabeledArtifact {
    /// Runtime identifier (image ID / container ID).
    pub id: String,
    /// Human-facing name (repo:tag / container name).
    pub name: String,
}

/// Everything needed to start one probe container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Unique container name (`biscepter-<suffix>`).
    pub name: String,
    /// Image tag to run.
    pub image: String,
    /// Host address the ports are bound to.
    pub host: String,
    /// Guest port to allocated host port.
    pub ports: HashMap<u16, u16>,
}

/// The seam between the bisection engine and the container backend.
pub trait ContainerRuntime: Send + Sync {
    /// Build `context` into an image tagged `tag`, labeled for cleanup.
    ///
    /// # Errors
    ///
    /// Any failure of the underlying build (including a broken Dockerfile
    /// or failing build steps) must surface as an error; the cache turns it
    /// into a commit replacement.
    fn build_image(&self, context: &Path, tag: &str) -> BisectResult<()>;

    /// Create and start a detached container per `spec`.
    ///
    /// # Errors
    ///
    /// Fails if the container cannot be created or started.
    fn start_container(&self, spec: &ContainerSpec) -> BisectResult<()>;

    /// Stop (and, with auto-removal, delete) the container `name`.
    ///
    /// # Errors
    ///
    /// Fails if the runtime reports an error stopping the container.
    fn stop_container(&self, name: &str) -> BisectResult<()>;

    /// All images labeled `biscepter=1`.
    ///
    /// # Errors
    ///
    /// Fails if the runtime cannot be queried.
    fn labeled_images(&self) -> BisectResult<Vec<LabeledArtifact>>;

    /// All containers (running or not) labeled `biscepter=1`.
    ///
    /// # Errors
    ///
    /// Fails if the runtime cannot be queried.
    fn labeled_containers(&self) -> BisectResult<Vec<LabeledArtifact>>;

    /// Force-remove a container by ID.
    ///
    /// # Errors
    ///
    /// Fails if the removal fails.
    fn remove_container(&self, id: &str) -> BisectResult<()>;

    /// Force-remove an image by ID.
    ///
    /// # Errors
    ///
    /// Fails if the removal fails.
    fn remove_image(&self, id: &str) -> BisectResult<()>;
}

// ---------------------------------------------------------------------------
// Docker CLI backend
// ---------------------------------------------------------------------------

/// [`ContainerRuntime`] backed by the `docker` command-line client.
#[derive(Debug, Default, Clone)]
pub struct DockerCli;

impl DockerCli {
    /// Create the default Docker CLI runtime.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Boxed, shared form used by jobs.
    #[must_use]
    pub fn shared() -> Arc<dyn ContainerRuntime> {
        Arc::new(Self)
    }
}

impl ContainerRuntime for DockerCli {
    fn build_image(&self, context: &Path, tag: &str) -> BisectResult<()> {
        debug!(target: "biscepter.container", tag, context = %context.display(), "docker build");
        run_tool(
            "docker",
            &[
                "build",
                "--label",
                IMAGE_LABEL,
                "-t",
                tag,
                &context.to_string_lossy(),
            ],
            None,
        )?;
        Ok(())
    }

    fn start_container(&self, spec: &ContainerSpec) -> BisectResult<()> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--rm".into(),
            "--label".into(),
            IMAGE_LABEL.into(),
            "--name".into(),
            spec.name.clone(),
        ];
        // Deterministic argument order keeps logs and errors readable.
        let ports: BTreeSet<(u16, u16)> =
            spec.ports.iter().map(|(g, h)| (*g, *h)).collect();
        for (guest, host_port) in ports {
            args.push("-p".into());
            args.push(format!("{}:{host_port}:{guest}", spec.host));
        }
        args.push(spec.image.clone());
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        debug!(target: "biscepter.container", name = %spec.name, image = %spec.image, "docker run");
        run_tool("docker", &arg_refs, None)?;
        Ok(())
    }

    fn stop_container(&self, name: &str) -> BisectResult<()> {
        debug!(target: "biscepter.container", name, "docker stop");
        run_tool("docker", &["stop", name], None)?;
        Ok(())
    }

    fn labeled_images(&self) -> BisectResult<Vec<LabeledArtifact>> {
        let filter = format!("label={IMAGE_LABEL}");
        let out = run_tool(
            "docker",
            &[
                "image",
                "ls",
                "--filter",
                &filter,
                "--format",
                "{{.ID}} {{.Repository}}:{{.Tag}}",
            ],
            None,
        )?;
        Ok(parse_artifact_lines(&out))
    }

    fn labeled_containers(&self) -> BisectResult<Vec<LabeledArtifact>> {
        let filter = format!("label={IMAGE_LABEL}");
        let out = run_tool(
            "docker",
            &[
                "ps",
                "-a",
                "--filter",
                &filter,
                "--format",
                "{{.ID}} {{.Names}}",
            ],
            None,
        )?;
        Ok(parse_artifact_lines(&out))
    }

    fn remove_container(&self, id: &str) -> BisectResult<()> {
        run_tool("docker", &["rm", "-f", id], None)?;
        Ok(())
    }

    fn remove_image(&self, id: &str) -> BisectResult<()> {
        run_tool("docker", &["rmi", "-f", id], None)?;
        Ok(())
    }
}

fn parse_artifact_lines(out: &str) -> Vec<LabeledArtifact> {
    out.lines()
        .filter_map(|line| {
            let (id, name) = line.split_once(' ')?;
            Some(LabeledArtifact {
                id: id.to_owned(),
                name: name.trim().to_owned(),
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Launch helpers
// ---------------------------------------------------------------------------

/// A started probe container with its port mapping.
#[derive(Debug, Clone)]
pub struct LaunchedContainer {
    /// The container name, for stopping.
    pub name: String,
    /// Guest port to allocated host port.
    pub ports: HashMap<u16, u16>,
}

/// Allocate host ports for every guest port and start a container.
///
/// `guest_ports` should be the union of the job's exposed ports and every
/// healthcheck port.
///
/// # Errors
///
/// Fails on port allocation or container start failure.
pub(crate) fn launch_container(
    runtime: &dyn ContainerRuntime,
    image: &str,
    host: &str,
    guest_ports: &BTreeSet<u16>,
) -> BisectResult<LaunchedContainer> {
    let mut ports = HashMap::new();
    for guest in guest_ports {
        ports.insert(*guest, allocate_host_port(host)?);
    }
    let spec = ContainerSpec {
        name: random_container_name(),
        image: image.to_owned(),
        host: host.to_owned(),
        ports,
    };
    runtime.start_container(&spec)?;
    Ok(LaunchedContainer {
        name: spec.name,
        ports: spec.ports,
    })
}

/// Ask the OS for a free TCP port on `host`.
///
/// The listener is dropped before the container binds the port; the window
/// in between is small enough in practice, and a clash surfaces as a
/// container start failure that aborts the probe.
pub(crate) fn allocate_host_port(host: &str) -> BisectResult<u16> {
    let listener =
        TcpListener::bind((host, 0)).map_err(|source| BisectError::PortAllocation {
            host: host.to_owned(),
            source,
        })?;
    let port = listener
        .local_addr()
        .map_err(|source| BisectError::PortAllocation {
            host: host.to_owned(),
            source,
        })?
        .port();
    Ok(port)
}

/// `biscepter-<6 random alphanumerics>`.
pub(crate) fn random_container_name() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    format!("biscepter-{suffix}")
}
