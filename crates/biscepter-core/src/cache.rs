//! Process-wide image cache, commit replacement map, and replacement journal.
//!
//! Every built image is tagged `biscepter-<commit>:<dockerfile-digest>`.
//! Scoping the tag to the digest of the Dockerfile means a changed build
//! recipe silently invalidates every previously cached image without any
//! explicit eviction.
//!
//! Commits that cannot be built (or whose containers never pass their
//! healthchecks) are recorded in the replacement map: probing such a commit
//! transparently probes its successor in the commit sequence instead. The
//! map is write-through to an append-only journal so substitutions survive
//! restarts and are shared between runs.
//!
//! # Thread model
//!
//! The cache is shared by all replicas of a job. The built-tag set and the
//! replacement map each sit behind a mutex; [`ImageCache::build_or_get`]
//! additionally holds the per-commit build mutex from
//! [`CommitLocks`](crate::concurrency::CommitLocks) across the whole
//! build-or-fetch so only one build per commit is ever in flight.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use sha2::{Digest, Sha256};
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::concurrency::CommitLocks;
use crate::error::{BisectError, BisectResult};

/// Label attached to every image and container biscepter creates, so the
/// cleanup tool can find them.
pub const IMAGE_LABEL: &str = "biscepter=1";

/// Prefix of every biscepter image tag.
const TAG_PREFIX: &str = "biscepter-";

// ---------------------------------------------------------------------------
// Tag format
// ---------------------------------------------------------------------------

/// Hex-encoded SHA-256 digest of the Dockerfile text.
#[must_use]
pub fn dockerfile_digest(dockerfile: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(dockerfile.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Format the image tag for `commit` built with the Dockerfile `digest`.
#[must_use]
pub fn image_tag(commit: &str, digest: &str) -> String {
    format!("{TAG_PREFIX}{commit}:{digest}")
}

/// Parse an image tag back into `(commit, digest)`.
///
/// Returns `None` for tags that were not produced by [`image_tag`].
#[must_use]
pub fn parse_image_tag(tag: &str) -> Option<(String, String)> {
    let rest = tag.strip_prefix(TAG_PREFIX)?;
    let (commit, digest) = rest.split_once(':')?;
    if commit.is_empty() || digest.is_empty() {
        return None;
    }
    Some((commit.to_owned(), digest.to_owned()))
}

// ---------------------------------------------------------------------------
// Replacement journal
// ---------------------------------------------------------------------------

/// On-disk format: ASCII `<orig>:<subst>,` tuples, concatenated.
///
/// The journal is append-only and flushed on every write, so a crash can at
/// worst lose the final tuple, never corrupt earlier ones.
#[derive(Debug)]
pub struct ReplacementJournal {
    inner: Mutex<JournalInner>,
}

#[derive(Debug)]
struct JournalInner {
    map: HashMap<String, String>,
    /// `None` for in-memory journals (single-commit convenience runs).
    file: Option<File>,
}

impl ReplacementJournal {
    /// Open (or create) the journal at `path` and replay its contents.
    ///
    /// # Errors
    ///
    /// Returns [`BisectError::JournalCorrupt`] for malformed tuples and
    /// [`BisectError::Io`] for filesystem failures.
    pub fn open(path: &Path) -> BisectResult<Self> {
        let mut map = HashMap::new();
        if path.exists() {
            let contents =
                std::fs::read_to_string(path).map_err(|e| BisectError::io(path, e))?;
            for pair in contents.trim_end_matches(',').split(',') {
                if pair.is_empty() {
                    continue;
                }
                let (orig, subst) = pair.split_once(':').ok_or_else(|| {
                    BisectError::JournalCorrupt {
                        path: path.to_owned(),
                        reason: format!("entry {pair:?} is not a <hash>:<hash> tuple"),
                    }
                })?;
                debug!(
                    target: "biscepter.cache",
                    orig,
                    subst,
                    "replayed replacement from journal"
                );
                map.insert(orig.to_owned(), subst.to_owned());
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| BisectError::io(path, e))?;
        Ok(Self {
            inner: Mutex::new(JournalInner {
                map,
                file: Some(file),
            }),
        })
    }

    /// A journal that never touches disk. Replacements recorded here are
    /// forgotten when the process exits.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(JournalInner {
                map: HashMap::new(),
                file: None,
            }),
        }
    }

    /// Follow the replacement chain from `commit` to its fixed point.
    ///
    /// The map steps strictly forward in the commit sequence, so chains are
    /// finite; a corrupt journal introducing a cycle is cut off after
    /// `map.len()` hops.
    #[must_use]
    pub fn resolve(&self, commit: &str) -> String {
        let inner = self.inner.lock().expect("journal lock poisoned");
        let mut current = commit;
        for _ in 0..=inner.map.len() {
            match inner.map.get(current) {
                Some(next) => current = next,
                None => return current.to_owned(),
            }
        }
        warn!(
            target: "biscepter.cache",
            commit,
            "replacement chain did not terminate; journal is corrupt"
        );
        current.to_owned()
    }

    /// Direct (single-hop) substitute for `commit`, if any.
    #[must_use]
    pub fn get(&self, commit: &str) -> Option<String> {
        self.inner
            .lock()
            .expect("journal lock poisoned")
            .map
            .get(commit)
            .cloned()
    }

    /// Record `orig -> subst` and append it to the journal file.
    ///
    /// The map insert and the journal append happen under one lock so
    /// concurrent replacements are linearized.
    ///
    /// # Errors
    ///
    /// Returns [`BisectError::Io`] if the journal append fails; the
    /// in-memory map is still updated in that case.
    pub fn record(&self, orig: &str, subst: &str) -> BisectResult<()> {
        let mut inner = self.inner.lock().expect("journal lock poisoned");
        inner.map.insert(orig.to_owned(), subst.to_owned());
        if let Some(file) = inner.file.as_mut() {
            file.write_all(format!("{orig}:{subst},").as_bytes())
                .and_then(|()| file.flush())
                .map_err(|e| BisectError::io("<replacement journal>", e))?;
        }
        Ok(())
    }

    /// All commits whose replacement chain ends at the same commit as
    /// `commit`'s chain, excluding `commit` itself.
    #[must_use]
    pub fn equivalence_class(&self, commit: &str) -> Vec<String> {
        let target = self.resolve(commit);
        let mut keys: Vec<String> = {
            let inner = self.inner.lock().expect("journal lock poisoned");
            inner.map.keys().cloned().collect()
        };
        keys.sort();
        let mut class: Vec<String> = Vec::new();
        if target != commit {
            class.push(target.clone());
        }
        for key in keys {
            if key != commit && self.resolve(&key) == target && !class.contains(&key) {
                class.push(key);
            }
        }
        class
    }
}

// ---------------------------------------------------------------------------
// Image cache
// ---------------------------------------------------------------------------

/// Outcome of a single [`ImageCache::build_or_get`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltImage {
    /// The tag of the runnable image.
    pub tag: String,
    /// The commit that actually got built, after replacement resolution.
    pub commit: String,
}

/// Process-wide mapping from commit to built image, with at-most-one
/// concurrent build per commit and transparent broken-commit substitution.
#[derive(Debug)]
pub struct ImageCache {
    digest: String,
    built: Mutex<HashSet<String>>,
    locks: CommitLocks,
    replacements: ReplacementJournal,
}

impl ImageCache {
    /// Create a cache scoped to the given Dockerfile digest.
    #[must_use]
    pub fn new(digest: String, replacements: ReplacementJournal) -> Self {
        Self {
            digest,
            built: Mutex::new(HashSet::new()),
            locks: CommitLocks::new(),
            replacements,
        }
    }

    /// The Dockerfile digest this cache is scoped to.
    #[must_use]
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// The replacement journal backing this cache.
    #[must_use]
    pub fn replacements(&self) -> &ReplacementJournal {
        &self.replacements
    }

    /// Load pre-existing image tags discovered from the container runtime.
    pub fn warm(&self, tags: impl IntoIterator<Item = String>) {
        let mut built = self.built.lock().expect("image cache lock poisoned");
        for tag in tags {
            debug!(target: "biscepter.cache", tag, "adding pre-built image");
            built.insert(tag);
        }
    }

    /// Tag for `commit` under the current Dockerfile digest.
    #[must_use]
    pub fn tag_for(&self, commit: &str) -> String {
        image_tag(commit, &self.digest)
    }

    /// Whether a runnable image for `commit` (after replacement resolution)
    /// is already cached.
    #[must_use]
    pub fn is_commit_built(&self, commit: &str) -> bool {
        let actual = self.replacements.resolve(commit);
        self.built
            .lock()
            .expect("image cache lock poisoned")
            .contains(&self.tag_for(&actual))
    }

    fn tag_present(&self, tag: &str) -> bool {
        self.built
            .lock()
            .expect("image cache lock poisoned")
            .contains(tag)
    }

    fn mark_built(&self, tag: String) {
        self.built
            .lock()
            .expect("image cache lock poisoned")
            .insert(tag);
    }

    /// Return a runnable image for `commit`, building it if necessary.
    ///
    /// `build(commit, tag)` must produce an image tagged `tag` from a
    /// checked-out tree of `commit`; it is only invoked while this commit's
    /// build mutex is held, so at most one build per commit runs
    /// process-wide. A failed build records a replacement and the call
    /// transparently moves on to the substitute commit.
    ///
    /// # Errors
    ///
    /// Returns [`BisectError::EndpointUnbuildable`] when the broken commit
    /// has no successor left to substitute, or any error from `build` that
    /// is not a build failure (wrapped I/O problems propagate as-is).
    pub fn build_or_get(
        &self,
        commit: &str,
        sequence: &[String],
        build: &dyn Fn(&str, &str) -> BisectResult<()>,
    ) -> BisectResult<BuiltImage> {
        let mut current = self.replacements.resolve(commit);
        loop {
            let lock = self.locks.lock_for(&current);
            let guard = lock.lock().expect("commit build mutex poisoned");

            // Another replica may have recorded a replacement between our
            // resolve and taking the mutex; a cached tag for a replaced
            // commit is a leftover from the failed attempt.
            if let Some(next) = self.replacements.get(&current) {
                drop(guard);
                current = self.replacements.resolve(&next);
                continue;
            }

            let tag = self.tag_for(&current);
            if self.tag_present(&tag) {
                return Ok(BuiltImage {
                    tag,
                    commit: current,
                });
            }

            match build(&current, &tag) {
                Ok(()) => {
                    self.mark_built(tag.clone());
                    debug!(target: "biscepter.cache", commit = %current, tag, "image built");
                    return Ok(BuiltImage {
                        tag,
                        commit: current,
                    });
                }
                Err(err) => {
                    warn!(
                        target: "biscepter.cache",
                        commit = %current,
                        error = %err,
                        "build failed, replacing commit"
                    );
                    let substitute = self.replace_commit(&current, sequence)?;
                    drop(guard);
                    current = self.replacements.resolve(&substitute);
                }
            }
        }
    }

    /// Record that `commit` is broken and must be treated as equivalent to
    /// its successor in `sequence`. Returns the substitute.
    ///
    /// # Errors
    ///
    /// Returns [`BisectError::EndpointUnbuildable`] if the commit resolves
    /// to the final commit of the sequence: the endpoints are required to
    /// build, so there is nothing left to substitute.
    pub fn replace_commit(&self, commit: &str, sequence: &[String]) -> BisectResult<String> {
        let end = self.replacements.resolve(commit);
        let index = sequence
            .iter()
            .position(|c| *c == end)
            .ok_or_else(|| BisectError::UnknownCommit {
                commit: end.clone(),
            })?;
        if index + 1 >= sequence.len() {
            return Err(BisectError::EndpointUnbuildable { commit: end });
        }
        let substitute = sequence[index + 1].clone();
        self.replacements.record(commit, &substitute)?;
        Ok(substitute)
    }
}
