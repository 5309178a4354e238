//! Convergence properties of the operation transformer.

use colabri_sync::ot::{transform, transform_one, DocumentState, OpKind, Operation};
use proptest::prelude::*;

fn text_strategy() -> impl Strategy<Value = String> {
    proptest::collection::vec(prop::sample::select(vec!['a', 'b', 'c', 'é', '日', ' ']), 0..12)
        .prop_map(|chars| chars.into_iter().collect())
}

/// An insert or delete that is valid against a text of `len` chars.
fn op_strategy(len: usize, origin: &'static str) -> BoxedStrategy<Operation> {
    let insert = (0..=len, "[xyz]{1,3}")
        .prop_map(move |(position, content)| Operation::insert(position, content, 0, origin));
    if len == 0 {
        return insert.boxed();
    }
    let delete = (0..len)
        .prop_flat_map(move |position| (Just(position), 0..=len - position))
        .prop_map(move |(position, length)| Operation::delete(position, length, 0, origin));
    prop_oneof![insert, delete].boxed()
}

fn concurrent_pair() -> impl Strategy<Value = (String, Operation, Operation)> {
    text_strategy().prop_flat_map(|base| {
        let len = base.chars().count();
        (Just(base), op_strategy(len, "pa"), op_strategy(len, "pb"))
    })
}

/// A base text, a run of sequential operations applied after it, and one operation
/// authored concurrently against the base.
fn lagging_op() -> impl Strategy<Value = (String, Vec<Operation>, Operation)> {
    (text_strategy(), proptest::collection::vec((any::<bool>(), any::<prop::sample::Index>(), any::<prop::sample::Index>()), 0..6))
        .prop_flat_map(|(base, steps)| {
            let mut text = base.clone();
            let mut applied = Vec::new();
            for (is_insert, at, span) in steps {
                let len = text.chars().count();
                let op = if is_insert || len == 0 {
                    Operation::insert(at.index(len + 1), "q", 0, "pa")
                } else {
                    let position = at.index(len);
                    Operation::delete(position, span.index(len - position + 1), 0, "pa")
                };
                text = op.apply(&text).expect("generated op is valid");
                applied.push(op);
            }
            let len = base.chars().count();
            (Just(base), Just(applied), op_strategy(len, "pb"))
        })
}

proptest! {
    #[test]
    fn concurrent_pairs_converge((base, a, b) in concurrent_pair()) {
        let left = transform_one(&b, &a).apply(&a.apply(&base).unwrap()).unwrap();
        let right = transform_one(&a, &b).apply(&b.apply(&base).unwrap()).unwrap();
        prop_assert_eq!(left, right);
    }

    #[test]
    fn rebased_op_stays_in_bounds((base, applied, op) in lagging_op()) {
        let mut text = base.clone();
        for prior in &applied {
            text = prior.apply(&text).unwrap();
        }
        let rebased = transform(&op, applied.iter());
        if rebased.kind == OpKind::Delete {
            prop_assert!(rebased.end() <= text.chars().count());
        }
        prop_assert!(rebased.apply(&text).is_ok());
    }

    #[test]
    fn submission_order_does_not_matter((base, a, b) in concurrent_pair()) {
        let mut first = DocumentState::new("doc", base.clone(), 0, 100);
        first.submit(a.clone()).unwrap();
        first.submit(b.clone()).unwrap();

        let mut second = DocumentState::new("doc", base, 0, 100);
        second.submit(b).unwrap();
        second.submit(a).unwrap();

        prop_assert_eq!(first.text(), second.text());
        prop_assert_eq!(first.version(), 2);
        prop_assert!(first.check_invariants().is_ok());
    }
}

#[test]
fn three_way_concurrent_edits_converge() {
    let base = "hello world";
    let ops = [
        Operation::insert(5, ",", 0, "pa"),
        Operation::delete(0, 5, 0, "pb"),
        Operation::insert(11, "!", 0, "pc"),
    ];

    let orders = [[0, 1, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];
    let texts: Vec<String> = orders
        .iter()
        .map(|order| {
            let mut doc = DocumentState::new("doc", base, 0, 100);
            for &i in order {
                doc.submit(ops[i].clone()).unwrap();
            }
            doc.text().to_string()
        })
        .collect();

    assert!(texts.iter().all(|t| t == &texts[0]), "diverged: {:?}", texts);
    assert_eq!(texts[0], ", world!");
}
