//! Property tests for the cache laws: tag round-tripping and replacement
//! map fixed points.

use proptest::prelude::*;

use biscepter_core::{dockerfile_digest, image_tag, parse_image_tag, ReplacementJournal};

proptest! {
    #[test]
    fn tag_round_trip(commit in "[0-9a-f]{6,40}", digest in "[0-9a-f]{8,64}") {
        let tag = image_tag(&commit, &digest);
        prop_assert_eq!(parse_image_tag(&tag), Some((commit, digest)));
    }

    #[test]
    fn digest_is_deterministic_and_injective_in_practice(
        a in ".{0,200}",
        b in ".{0,200}",
    ) {
        prop_assert_eq!(dockerfile_digest(&a), dockerfile_digest(&a));
        if a != b {
            prop_assert_ne!(dockerfile_digest(&a), dockerfile_digest(&b));
        }
    }

    /// The replacement map only ever steps forward in the commit sequence,
    /// so transitive resolution terminates and yields a fixed point.
    #[test]
    fn replacement_resolution_reaches_a_fixed_point(
        len in 2_usize..24,
        edges in proptest::collection::vec(any::<prop::sample::Index>(), 0..16),
    ) {
        let commits: Vec<String> = (0..len).map(|i| format!("c{i:02}")).collect();
        let journal = ReplacementJournal::in_memory();
        for edge in edges {
            let origin = edge.index(len - 1);
            journal.record(&commits[origin], &commits[origin + 1]).unwrap();
        }
        for commit in &commits {
            let fixed = journal.resolve(commit);
            prop_assert_eq!(journal.resolve(&fixed), fixed.clone());
        }
    }
}
