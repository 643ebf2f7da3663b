use binary_heap_plus::BinaryHeap;

use crate::{Frontier, StateRanking, SubProblem};

use super::UbThenRanking;

/// The plain frontier: a binary heap of open subproblems popped in decreasing
/// upper bound order. Several subproblems rooted in the same state may coexist
/// in the queue; each of them is explored on its own.
pub struct SimpleFrontier<'a, O: StateRanking> {
    queue: BinaryHeap<SubProblem<O::State>, UbThenRanking<'a, O>>,
}

impl<'a, O: StateRanking> SimpleFrontier<'a, O> {
    pub fn new(ranking: &'a O) -> Self {
        let cmp = UbThenRanking(ranking);
        Self {
            queue: BinaryHeap::from_vec_cmp(vec![], cmp),
        }
    }
}

impl<O: StateRanking> Frontier for SimpleFrontier<'_, O> {
    type State = O::State;

    fn push(&mut self, sub: SubProblem<O::State>) {
        self.queue.push(sub);
    }

    fn pop(&mut self) -> Option<SubProblem<O::State>> {
        self.queue.pop()
    }

    fn clear(&mut self) {
        self.queue.clear();
    }

    fn len(&self) -> usize {
        self.queue.len()
    }
}
