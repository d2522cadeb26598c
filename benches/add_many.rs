//! This bench test builds a wide, nested criteria tree one edit at a time and
//! then composes and fingerprints it, as happens after every edit.

#![allow(missing_docs)]

use cohort::{
    domain::{GroupDraft, LeafDraft},
    CohortState, NodeId,
};
use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use non_empty_string::NonEmptyString;

/// 50 groups of 20 criteria each, below the root.
fn build() -> CohortState {
    let kind = NonEmptyString::new("Condition".to_string()).unwrap();
    let mut state = CohortState::default();
    for _ in 0..50 {
        let (next, group) = state.add_group(NodeId::ROOT, GroupDraft::new()).unwrap();
        state = next;
        for i in 0..20 {
            let draft = LeafDraft::new(kind.clone()).with_title(format!("criterion {i}"));
            state = state.add_leaf(group, draft).unwrap().0;
        }
    }
    state
}

fn add_many(c: &mut Criterion) {
    c.bench_function("add 1000 criteria", |b| b.iter(build));

    c.bench_function("compose and fingerprint", |b| {
        b.iter_batched(
            build,
            |state| {
                let _ = state.composed();
                state.fingerprint()
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, add_many);
criterion_main!(benches);
