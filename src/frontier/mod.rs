//! This module provides the implementation of usual frontiers.
use compare::Compare;
use std::cmp::Ordering;

use crate::{StateRanking, SubProblem};

/// Ranks open subproblems for exploration: the greatest upper bound pops
/// first, and among equal bounds the state the client ranking prefers.
#[derive(Debug, Clone, Copy)]
struct UbThenRanking<'a, O>(&'a O);

impl<O: StateRanking> Compare<SubProblem<O::State>> for UbThenRanking<'_, O> {
    fn compare(&self, a: &SubProblem<O::State>, b: &SubProblem<O::State>) -> Ordering {
        match a.ub.cmp(&b.ub) {
            Ordering::Equal => self.0.compare(&a.state, &b.state),
            decided => decided,
        }
    }
}

pub mod no_dup;
pub mod simple;

pub use no_dup::*;
pub use simple::*;
