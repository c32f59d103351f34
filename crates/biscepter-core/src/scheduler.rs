//! Build-cost-aware probe selection.
//!
//! Plain binary search always probes the midpoint of the window, which
//! forces an image build whenever the midpoint commit has never been built.
//! When several replicas bisect the same range, or when a previous run left
//! images behind, a commit *near* the midpoint is often already cached, and
//! running it costs a fraction of a fresh build.
//!
//! [`next_probe_index`] weighs the two options: probe the exact midpoint
//! (optimal halving, but possibly a build) or probe the nearest cached
//! commit (a cheap run, but a lopsided split that leaves a larger expected
//! window). The build-cost multiplier β expresses how expensive a build is
//! relative to a cached run; β ≤ 1 effectively disables cache-biased
//! selection and always probes the midpoint.

use tracing::trace;

/// Pick the next commit index to probe inside the window `[lo, hi]`.
///
/// `is_built(commit)` reports whether a runnable image for the commit is
/// already cached. `build_cost` is the β multiplier from the job config.
///
/// The caller must only invoke this while `hi - lo >= 2`; a window of
/// length two has already converged.
pub(crate) fn next_probe_index(
    lo: usize,
    hi: usize,
    commits: &[String],
    build_cost: f64,
    is_built: &dyn Fn(&str) -> bool,
) -> usize {
    debug_assert!(lo < hi && hi < commits.len());

    let mid = (lo + hi) / 2;

    // Nearest cached commit, searching outward from the midpoint. Upward
    // wins ties. The known-good endpoint at `lo` is never a candidate.
    let mut offset: isize = 0;
    for step in 1..=(hi - mid) {
        if is_built(&commits[mid + step]) {
            offset = step as isize;
            break;
        }
        if mid >= step && mid - step > lo && is_built(&commits[mid - step]) {
            offset = -(step as isize);
            break;
        }
    }

    if offset == 0 {
        trace!(
            target: "biscepter.scheduler",
            lo,
            hi,
            probe = mid,
            "no cached commit nearby, probing midpoint"
        );
        return mid;
    }

    let candidate = (mid as isize + offset) as usize;

    // Expected number of probes remaining after each choice, under a
    // uniform prior over which in-window commit introduced the defect.
    // All arithmetic is IEEE: degenerate windows produce NaN, every
    // comparison with NaN is false, and the midpoint wins by default.
    let total = hi as f64 - lo as f64 - 2.0;
    let above = hi as f64 - candidate as f64 - 1.0;
    let below = candidate as f64 - lo as f64 - 1.0;
    let expected_remaining = (above / total) * above + (below / total) * below;
    let runs_with_offset = expected_remaining.log2();
    let runs_at_midpoint = total.log2();

    let cached_inside = commits[lo + 1..hi]
        .iter()
        .filter(|commit| is_built(commit))
        .count() as f64;
    let cached_frac = cached_inside / total;
    let uncached_frac = 1.0 - cached_frac;

    // The cached candidate costs one cheap run now (+1); the midpoint costs
    // one build now (+β). Future probes split by cache likelihood.
    let offset_cost =
        cached_frac * runs_with_offset + uncached_frac * runs_with_offset * build_cost + 1.0;
    let midpoint_cost =
        cached_frac * runs_at_midpoint + uncached_frac * (runs_at_midpoint + 1.0) * build_cost;

    let probe = if offset_cost <= midpoint_cost {
        candidate
    } else {
        mid
    };
    trace!(
        target: "biscepter.scheduler",
        lo,
        hi,
        offset,
        offset_cost,
        midpoint_cost,
        probe,
        "selected probe"
    );
    probe
}
