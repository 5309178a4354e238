//! Operational transformation for single-range insert/delete operations.
//!
//! [`transform`] rebases an operation over the operations the room applied after the
//! version it was authored against. Every pair rule below satisfies the convergence
//! property for two concurrent operations `a` and `b` authored against the same text:
//!
//! ```text
//! apply(apply(s, a), transform(b, [a])) == apply(apply(s, b), transform(a, [b]))
//! ```
//!
//! Two rules make that hold where a naive offset shift would not:
//! - inserts at the same position are ordered by origin participant id, never by arrival;
//! - an insert strictly inside a range deleted concurrently is swallowed by that delete
//!   (the delete grows over it, the insert shrinks to a no-op).

use std::cmp::Ordering;

use super::operation::{OpKind, Operation};

/// Rebase `op` over `prior_ops`, in the order they were applied.
pub fn transform<'a, I>(op: &Operation, prior_ops: I) -> Operation
where
    I: IntoIterator<Item = &'a Operation>,
{
    prior_ops
        .into_iter()
        .fold(op.clone(), |current, prior| transform_one(&current, prior))
}

/// Rebase `op` over a single operation applied before it.
pub fn transform_one(op: &Operation, prior: &Operation) -> Operation {
    if prior.is_noop() {
        return op.clone();
    }

    match (op.kind, prior.kind) {
        (OpKind::Insert, OpKind::Insert) => {
            if prior.position < op.position
                || (prior.position == op.position && prior_wins_tie(prior, op))
            {
                op.rebased(op.position.saturating_add(prior.length), op.length)
            } else {
                op.clone()
            }
        }
        (OpKind::Insert, OpKind::Delete) => {
            if op.position <= prior.position {
                op.clone()
            } else if op.position >= prior.end() {
                op.rebased(op.position - prior.length, op.length)
            } else {
                // landed inside text that no longer exists
                op.rebased(prior.position, 0)
            }
        }
        (OpKind::Delete, OpKind::Insert) => {
            if prior.position <= op.position {
                op.rebased(op.position.saturating_add(prior.length), op.length)
            } else if prior.position >= op.end() {
                op.clone()
            } else {
                op.rebased(op.position, op.length.saturating_add(prior.length))
            }
        }
        (OpKind::Delete, OpKind::Delete) => {
            if prior.end() <= op.position {
                op.rebased(op.position - prior.length, op.length)
            } else if prior.position >= op.end() {
                op.clone()
            } else {
                let overlap = op.end().min(prior.end()) - op.position.max(prior.position);
                op.rebased(
                    op.position.min(prior.position),
                    op.length.saturating_sub(overlap),
                )
            }
        }
    }
}

/// Total order for inserts at the same position: lower origin id goes first.
fn prior_wins_tie(prior: &Operation, op: &Operation) -> bool {
    match prior.origin_participant_id.cmp(&op.origin_participant_id) {
        Ordering::Less | Ordering::Equal => true,
        Ordering::Greater => false,
    }
}
