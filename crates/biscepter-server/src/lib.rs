//! REST adapter over a running bisection job.
//!
//! The oracle drives the bisection entirely over four routes:
//!
//! | Route | Behavior |
//! |---|---|
//! | `GET /system` | Block until a system is ready or a replica converged; return whichever arrives first as JSON. |
//! | `POST /isGood/:systemId` | Report the system as defect-free. 404 for unknown IDs. |
//! | `POST /isBad/:systemId` | Report the system as defective. 404 for unknown IDs. |
//! | `POST /stop` | Shut the server down gracefully. |
//!
//! Once the job has finished (every replica converged and both streams
//! closed), `GET /system` answers `204 No Content`.
//!
//! The core's streams are blocking; two forwarder threads merge them into
//! one event channel, and `GET /system` drains it via `spawn_blocking` so
//! the async executor is never parked.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{debug, info};

use biscepter_core::{OffendingCommit, RunningSystem};

/// Length of generated system IDs.
const SYSTEM_ID_LEN: usize = 16;

/// A ready system, serialized for the oracle.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunningSystemResponse {
    system_index: String,
    replica_index: usize,
    /// Guest port to host port. String keys because JSON objects cannot
    /// have numeric keys.
    ports: HashMap<String, String>,
}

/// A finished bisection, serialized for the oracle.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OffendingCommitResponse {
    replica_index: usize,
    commit: String,
    commit_offset: usize,
    commit_message: String,
    commit_date: String,
    commit_author: String,
}

enum Event {
    System(RunningSystem),
    Offending(OffendingCommit),
}

struct AdapterState {
    events: Mutex<Receiver<Event>>,
    registry: Mutex<HashMap<String, RunningSystem>>,
    shutdown: tokio::sync::Notify,
}

/// Serve the adapter on `127.0.0.1:<port>` until `POST /stop` arrives or
/// the listener fails.
///
/// # Errors
///
/// Returns the bind or accept error from the underlying listener.
pub async fn serve(
    port: u16,
    systems: Receiver<RunningSystem>,
    offenders: Receiver<OffendingCommit>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    info!(target: "biscepter.server", port, "REST adapter listening");
    serve_on(listener, systems, offenders).await
}

/// [`serve`] on an already bound listener (lets tests use an ephemeral
/// port).
///
/// # Errors
///
/// Returns any accept-loop error.
pub async fn serve_on(
    listener: TcpListener,
    systems: Receiver<RunningSystem>,
    offenders: Receiver<OffendingCommit>,
) -> std::io::Result<()> {
    let (event_tx, event_rx) = mpsc::channel();
    let offending_tx = event_tx.clone();
    thread::spawn(move || {
        for system in systems {
            if event_tx.send(Event::System(system)).is_err() {
                break;
            }
        }
    });
    thread::spawn(move || {
        for offending in offenders {
            if offending_tx.send(Event::Offending(offending)).is_err() {
                break;
            }
        }
    });

    let state = Arc::new(AdapterState {
        events: Mutex::new(event_rx),
        registry: Mutex::new(HashMap::new()),
        shutdown: tokio::sync::Notify::new(),
    });
    let shutdown_state = Arc::clone(&state);

    let app = Router::new()
        .route("/system", get(get_system))
        .route("/isGood/:system_id", post(post_is_good))
        .route("/isBad/:system_id", post(post_is_bad))
        .route("/stop", post(post_stop))
        .with_state(state);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown_state.shutdown.notified().await })
        .await
}

/// Run the adapter on a fresh multi-threaded runtime, blocking the caller
/// until shutdown. This is what the CLI uses.
///
/// # Errors
///
/// Returns runtime construction and server errors.
pub fn serve_blocking(
    port: u16,
    systems: Receiver<RunningSystem>,
    offenders: Receiver<OffendingCommit>,
) -> std::io::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(port, systems, offenders))
}

async fn get_system(State(state): State<Arc<AdapterState>>) -> Response {
    let recv_state = Arc::clone(&state);
    let event = tokio::task::spawn_blocking(move || {
        recv_state
            .events
            .lock()
            .expect("event stream lock poisoned")
            .recv()
    })
    .await
    .expect("event receiver task panicked");

    match event {
        Ok(Event::System(system)) => {
            let id: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(SYSTEM_ID_LEN)
                .map(char::from)
                .collect();
            let response = RunningSystemResponse {
                system_index: id.clone(),
                replica_index: system.replica_index,
                ports: system
                    .ports
                    .iter()
                    .map(|(guest, host)| (guest.to_string(), host.to_string()))
                    .collect(),
            };
            debug!(
                target: "biscepter.server",
                system = %id,
                replica = system.replica_index,
                "handing out running system"
            );
            state
                .registry
                .lock()
                .expect("system registry lock poisoned")
                .insert(id, system);
            (StatusCode::OK, Json(response)).into_response()
        }
        Ok(Event::Offending(offending)) => {
            let response = OffendingCommitResponse {
                replica_index: offending.replica_index,
                commit: offending.commit,
                commit_offset: offending.commit_index,
                commit_message: offending.message,
                commit_date: offending.date,
                commit_author: offending.author,
            };
            (StatusCode::OK, Json(response)).into_response()
        }
        // Both streams closed: the job is done.
        Err(_) => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn post_is_good(
    State(state): State<Arc<AdapterState>>,
    Path(system_id): Path<String>,
) -> StatusCode {
    render_verdict(&state, &system_id, true)
}

async fn post_is_bad(
    State(state): State<Arc<AdapterState>>,
    Path(system_id): Path<String>,
) -> StatusCode {
    render_verdict(&state, &system_id, false)
}

fn render_verdict(state: &AdapterState, system_id: &str, good: bool) -> StatusCode {
    let system = state
        .registry
        .lock()
        .expect("system registry lock poisoned")
        .remove(system_id);
    match system {
        Some(system) => {
            if good {
                system.is_good();
            } else {
                system.is_bad();
            }
            StatusCode::OK
        }
        None => StatusCode::NOT_FOUND,
    }
}

async fn post_stop(State(state): State<Arc<AdapterState>>) -> StatusCode {
    info!(target: "biscepter.server", "stop requested, shutting down adapter");
    state.shutdown.notify_one();
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_system_response_shape() {
        let response = RunningSystemResponse {
            system_index: "abc123".into(),
            replica_index: 2,
            ports: [("3333".to_owned(), "54321".to_owned())].into_iter().collect(),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["systemIndex"], "abc123");
        assert_eq!(json["replicaIndex"], 2);
        assert_eq!(json["ports"]["3333"], "54321");
    }

    #[test]
    fn offending_commit_response_shape() {
        let response = OffendingCommitResponse {
            replica_index: 0,
            commit: "deadbeef".into(),
            commit_offset: 4,
            commit_message: "fix: nothing".into(),
            commit_date: "Thu, 1 Feb 2024 12:00:00 +0000".into(),
            commit_author: "Dev <dev@example.com>".into(),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["commit"], "deadbeef");
        assert_eq!(json["commitOffset"], 4);
        assert_eq!(json["commitMessage"], "fix: nothing");
        assert_eq!(json["commitDate"], "Thu, 1 Feb 2024 12:00:00 +0000");
        assert_eq!(json["commitAuthor"], "Dev <dev@example.com>");
    }
}
