//! Cause Algebra Property Suite
//!
//! Property tests over randomly-shaped cause trees: composition keeps
//! every failure, mapping preserves structure, and the interruption
//! predicates agree with the collected interruptors.

use filament::services::Timestamp;
use filament::{Cause, Defect, FiberId};
use proptest::prelude::*;

fn fid(seq: u64) -> FiberId {
    FiberId::Gen {
        seq,
        started_at: Timestamp::ZERO,
    }
}

fn cause_strategy() -> impl Strategy<Value = Cause<u32>> {
    let leaf = prop_oneof![
        Just(Cause::Empty),
        any::<u32>().prop_map(Cause::fail),
        "[a-z]{1,8}".prop_map(|m| Cause::die(Defect::new(m))),
        (0u64..8).prop_map(|seq| Cause::interrupt(fid(seq))),
    ];
    leaf.prop_recursive(4, 24, 2, |inner| {
        prop_oneof![
            (inner.clone(), inner.clone()).prop_map(|(l, r)| l.then(r)),
            (inner.clone(), inner.clone()).prop_map(|(l, r)| l.both(r)),
            (inner, any::<bool>())
                .prop_map(|(c, traced)| Cause::Stackless(Box::new(c), traced)),
        ]
    })
}

proptest! {
    #[test]
    fn composition_keeps_every_failure(a in cause_strategy(), b in cause_strategy()) {
        let expected = a.failures().len() + b.failures().len();
        let expected_defects = a.defects().len() + b.defects().len();
        let sequenced = a.clone().then(b.clone());
        let parallel = a.both(b);
        prop_assert_eq!(sequenced.failures().len(), expected);
        prop_assert_eq!(parallel.failures().len(), expected);
        prop_assert_eq!(sequenced.defects().len(), expected_defects);
        prop_assert_eq!(parallel.defects().len(), expected_defects);
    }

    #[test]
    fn empty_is_the_identity_of_composition(c in cause_strategy()) {
        prop_assert_eq!(&c.clone().then(Cause::Empty), &c);
        prop_assert_eq!(&Cause::Empty.then(c.clone()), &c);
        prop_assert_eq!(&c.clone().both(Cause::Empty), &c);
        prop_assert_eq!(&Cause::Empty.both(c.clone()), &c);
    }

    #[test]
    fn map_preserves_counts_and_interruption(c in cause_strategy()) {
        let failures = c.failures().len();
        let defects = c.defects().len();
        let interrupted = c.is_interrupted();
        let mapped = c.map(|n| n.to_string());
        prop_assert_eq!(mapped.failures().len(), failures);
        prop_assert_eq!(mapped.defects().len(), defects);
        prop_assert_eq!(mapped.is_interrupted(), interrupted);
    }

    #[test]
    fn interruption_predicates_agree_with_interruptors(c in cause_strategy()) {
        prop_assert_eq!(c.is_interrupted(), !c.interruptors().is_empty());
        if c.is_interrupted_only() && !c.is_empty() {
            prop_assert!(c.failures().is_empty());
            prop_assert!(c.defects().is_empty());
        }
    }
}
