use std::{collections::hash_map::Entry, hash::Hash, sync::Arc};

use rustc_hash::FxHashMap;

use crate::{
    prelude::{CompilationInput, CompilationType, Decision, Problem, Relaxation, StateRanking},
    utils::VarSet,
    DecisionDiagram, SubProblem, VariableHeuristic,
};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
struct NodeId(usize);

#[derive(Debug, Clone, Copy)]
struct EdgeId(usize);

#[derive(Debug, Clone)]
struct Node<T> {
    state: Arc<T>,
    /// Longest path from the subproblem root to this node.
    value: isize,
    best: Option<EdgeId>,
    inbound: Option<EdgeId>,
    /// Rough upper bound: value + fast upper bound, saturated.
    rub: isize,
    /// Longest path from this node to a terminal. Only filled in by relaxed
    /// compilations; stays `None` on nodes that reach no terminal.
    suffix: Option<isize>,
}

#[derive(Debug, Clone, Copy)]
struct Edge {
    from: NodeId,
    decision: Decision,
    cost: isize,
    next: Option<EdgeId>,
}

/// A decision diagram developed one layer at a time, in exact, restricted or
/// relaxed mode. Nodes and edges live in flat arenas that are recycled across
/// compilations; incoming edges form an intrusive linked list threaded by
/// `Edge::next`. The nodes of the last exact layer are remembered so that
/// `drain_cutset` can export them once the compilation is over.
#[derive(Debug, Clone)]
pub struct LayeredMdd<T>
where
    T: Eq + PartialEq + Hash + Clone,
{
    root_pa: Vec<Decision>,
    //
    nodes: Vec<Node<T>>,
    edges: Vec<Edge>,
    //
    prev_l: Vec<NodeId>,
    next_l: FxHashMap<Arc<T>, NodeId>,
    cutset: Vec<NodeId>,
    //
    best_n: Option<NodeId>,
    exact: bool,
}

impl<T> Default for LayeredMdd<T>
where
    T: Eq + PartialEq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DecisionDiagram for LayeredMdd<T>
where
    T: Eq + PartialEq + Hash + Clone,
{
    type State = T;

    fn compile<P, R, V, O>(&mut self, input: &CompilationInput<P, R, V, O>)
    where
        P: Problem<State = Self::State>,
        R: Relaxation<State = P::State>,
        V: VariableHeuristic<P::State>,
        O: StateRanking<State = P::State>,
    {
        self._compile(input)
    }

    fn is_exact(&self) -> bool {
        self.exact
    }

    fn best_value(&self) -> Option<isize> {
        self._best_value()
    }

    fn best_solution(&self) -> Option<Vec<Decision>> {
        self._best_solution()
    }

    fn drain_cutset<F>(&mut self, func: F)
    where
        F: FnMut(SubProblem<T>),
    {
        self._drain_cutset(func)
    }
}

impl<T> LayeredMdd<T>
where
    T: Eq + PartialEq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            root_pa: vec![],
            nodes: vec![],
            edges: vec![],
            prev_l: Default::default(),
            next_l: Default::default(),
            cutset: vec![],
            best_n: None,
            exact: true,
        }
    }

    fn clear(&mut self) {
        self.root_pa.clear();
        self.nodes.clear();
        self.edges.clear();
        self.prev_l.clear();
        self.next_l.clear();
        self.cutset.clear();
        self.best_n = None;
        self.exact = true;
    }

    fn _best_value(&self) -> Option<isize> {
        self.best_n.map(|id| self.nodes[id.0].value)
    }

    fn _best_solution(&self) -> Option<Vec<Decision>> {
        self.best_n.map(|id| self._best_path(id))
    }

    fn _best_path(&self, id: NodeId) -> Vec<Decision> {
        Self::_best_path_partial_borrow(id, &self.root_pa, &self.nodes, &self.edges)
    }

    fn _best_path_partial_borrow(
        id: NodeId,
        root_pa: &[Decision],
        nodes: &[Node<T>],
        edges: &[Edge],
    ) -> Vec<Decision> {
        let mut sol = root_pa.to_owned();
        let mut edge_id = nodes[id.0].best;
        while let Some(eid) = edge_id {
            let edge = edges[eid.0];
            sol.push(edge.decision);
            edge_id = nodes[edge.from.0].best;
        }
        sol
    }

    fn _drain_cutset<F>(&mut self, mut func: F)
    where
        F: FnMut(SubProblem<T>),
    {
        if self.best_n.is_some() {
            for node_id in self.cutset.drain(..) {
                let node = &self.nodes[node_id.0];

                let locb = node
                    .suffix
                    .map_or(isize::MIN, |s| node.value.saturating_add(s));
                let ub = node.rub.min(locb);

                func(SubProblem {
                    state: node.state.clone(),
                    value: node.value,
                    path: Self::_best_path_partial_borrow(
                        node_id,
                        &self.root_pa,
                        &self.nodes,
                        &self.edges,
                    ),
                    ub,
                })
            }
        }
    }

    fn _compile<P, R, V, O>(&mut self, input: &CompilationInput<P, R, V, O>)
    where
        P: Problem<State = T>,
        R: Relaxation<State = P::State>,
        V: VariableHeuristic<P::State>,
        O: StateRanking<State = P::State>,
    {
        self.clear();

        let mut curr_l = vec![];

        input
            .residual
            .path
            .iter()
            .copied()
            .for_each(|x| self.root_pa.push(x));

        let root_s = input.residual.state.clone();
        let root_n = Node {
            state: root_s.clone(),
            value: input.residual.value,
            best: None,
            inbound: None,
            rub: input.residual.ub,
            suffix: None,
        };

        self.nodes.push(root_n);
        self.next_l.insert(root_s, NodeId(0));

        let mut free_vars = VarSet::all(input.problem.nb_variables());
        self.root_pa.iter().for_each(|d| free_vars.remove(d.var));

        let mut depth = 0;

        while !free_vars.is_empty() {
            let var = input
                .var_heu
                .next_variable(&free_vars, &mut self.next_l.keys().map(|s| s.as_ref()));

            let var = match var {
                Some(var) => var,
                None => return, // no valid choice left: the subproblem is a dead end
            };

            self.prev_l.clear();
            for node_id in curr_l.drain(..) {
                self.prev_l.push(node_id);
            }
            for (_, node_id) in self.next_l.drain() {
                curr_l.push(node_id);
            }
            for node_id in curr_l.iter() {
                let est = input
                    .relaxation
                    .fast_upper_bound(self.nodes[node_id.0].state.as_ref(), &free_vars);
                self.nodes[node_id.0].rub = self.nodes[node_id.0].value.saturating_add(est);
            }

            if curr_l.is_empty() {
                return;
            }

            free_vars.remove(var);

            // a layer may only be shrunk once it is two levels below the root,
            // otherwise the cutset would degenerate to the root itself and the
            // branch and bound would not make progress
            match input.comp_type {
                CompilationType::Exact => { /* do nothing: you want to explore the complete DD */ }
                CompilationType::Restricted => {
                    if depth >= 2 && curr_l.len() > input.max_width {
                        self.restrict(input, &mut curr_l)
                    }
                }
                CompilationType::Relaxed => {
                    if depth >= 2 && curr_l.len() > input.max_width {
                        self.relax(input, &mut curr_l)
                    }
                }
            }

            for node_id in curr_l.iter() {
                if self.nodes[node_id.0].rub <= input.best_lb {
                    continue;
                }
                let state = self.nodes[node_id.0].state.clone();
                input
                    .problem
                    .for_each_in_domain(var, state.as_ref(), |decision| {
                        self.branch_on(*node_id, decision, input.problem)
                    });
            }

            depth += 1;
        }

        self.best_n = self
            .next_l
            .values()
            .copied()
            .max_by_key(|id| self.nodes[id.0].value);
        //
        if matches!(input.comp_type, CompilationType::Relaxed) && !self.exact {
            self.compute_local_bounds();
        }
    }

    fn branch_on<P: Problem<State = T>>(
        &mut self,
        from_id: NodeId,
        decision: Decision,
        problem: &P,
    ) {
        let state = self.nodes[from_id.0].state.as_ref();
        let next_state = Arc::new(problem.transition(state, decision));
        let cost = problem.transition_cost(state, decision);
        let value = self.nodes[from_id.0].value.saturating_add(cost);

        match self.next_l.entry(next_state.clone()) {
            Entry::Vacant(e) => {
                let node_id = NodeId(self.nodes.len());
                let edge_id = EdgeId(self.edges.len());

                self.edges.push(Edge {
                    from: from_id,
                    decision,
                    cost,
                    next: None,
                });
                self.nodes.push(Node {
                    state: next_state,
                    value,
                    best: Some(edge_id),
                    inbound: Some(edge_id),
                    rub: isize::MAX,
                    suffix: None,
                });

                e.insert(node_id);
            }
            Entry::Occupied(e) => {
                let node_id = *e.get();
                let edge_id = EdgeId(self.edges.len());

                self.edges.push(Edge {
                    from: from_id,
                    decision,
                    cost,
                    next: self.nodes[node_id.0].inbound,
                });

                let node = &mut self.nodes[node_id.0];
                node.inbound = Some(edge_id);
                if value >= node.value {
                    node.value = value;
                    node.best = Some(edge_id);
                }
            }
        }
    }

    /// Remembers the previous layer as the last exact layer the first time a
    /// layer must be shrunk.
    fn save_cutset(&mut self) {
        if self.exact {
            for id in self.prev_l.iter() {
                self.cutset.push(*id);
            }
            self.exact = false;
        }
    }

    fn restrict<P, R, V, O>(
        &mut self,
        input: &CompilationInput<P, R, V, O>,
        curr_l: &mut Vec<NodeId>,
    ) where
        P: Problem<State = T>,
        R: Relaxation<State = P::State>,
        V: VariableHeuristic<P::State>,
        O: StateRanking<State = P::State>,
    {
        self.save_cutset();
        curr_l.sort_unstable_by(|a, b| {
            self.nodes[a.0]
                .value
                .cmp(&self.nodes[b.0].value)
                .then_with(|| {
                    input
                        .ranking
                        .compare(self.nodes[a.0].state.as_ref(), self.nodes[b.0].state.as_ref())
                })
                .reverse()
        }); // reverse because greater means more likely to be kept
        curr_l.truncate(input.max_width);
    }

    fn relax<P, R, V, O>(
        &mut self,
        input: &CompilationInput<P, R, V, O>,
        curr_l: &mut Vec<NodeId>,
    ) where
        P: Problem<State = T>,
        R: Relaxation<State = P::State>,
        V: VariableHeuristic<P::State>,
        O: StateRanking<State = P::State>,
    {
        self.save_cutset();
        curr_l.sort_unstable_by(|a, b| {
            self.nodes[a.0]
                .value
                .cmp(&self.nodes[b.0].value)
                .then_with(|| {
                    input
                        .ranking
                        .compare(self.nodes[a.0].state.as_ref(), self.nodes[b.0].state.as_ref())
                })
                .reverse()
        }); // reverse because greater means more likely to be kept

        //--
        let (keep, merge) = curr_l.split_at_mut(input.max_width - 1);
        let merged = Arc::new(
            input
                .relaxation
                .merge_states(&mut merge.iter().map(|node_id| self.nodes[node_id.0].state.as_ref())),
        );

        let recycled = keep
            .iter()
            .find(|node_id| self.nodes[node_id.0].state.eq(&merged))
            .copied();

        let merged_id = recycled.unwrap_or_else(|| {
            let node_id = NodeId(self.nodes.len());
            self.nodes.push(Node {
                state: merged.clone(),
                value: isize::MIN,
                best: None,    // yet
                inbound: None, // yet
                rub: isize::MIN,
                suffix: None,
            });
            node_id
        });

        for drop_id in merge.iter() {
            self.nodes[merged_id.0].rub = self.nodes[merged_id.0]
                .rub
                .max(self.nodes[drop_id.0].rub);

            let mut edge_id = self.nodes[drop_id.0].inbound;
            while let Some(eid) = edge_id {
                let edge = self.edges[eid.0];
                let src = self.nodes[edge.from.0].state.as_ref();

                let rcost = input.relaxation.relax_edge(
                    src,
                    self.nodes[drop_id.0].state.as_ref(),
                    merged.as_ref(),
                    edge.decision,
                    edge.cost,
                );

                let new_eid = EdgeId(self.edges.len());
                self.edges.push(Edge {
                    from: edge.from,
                    decision: edge.decision,
                    cost: rcost,
                    next: self.nodes[merged_id.0].inbound,
                });
                self.nodes[merged_id.0].inbound = Some(new_eid);

                let new_value = self.nodes[edge.from.0].value.saturating_add(rcost);
                if new_value > self.nodes[merged_id.0].value {
                    self.nodes[merged_id.0].value = new_value;
                    self.nodes[merged_id.0].best = Some(new_eid);
                }

                edge_id = edge.next;
            }
        }

        curr_l.truncate(input.max_width - 1);
        if recycled.is_none() {
            curr_l.push(merged_id);
        }
    }

    /// Bottom-up pass filling in the longest suffix of every node that can
    /// reach a terminal. Nodes were pushed in topological order, so a single
    /// reverse sweep suffices, and it can stop as soon as every node of the
    /// cutset has been visited.
    fn compute_local_bounds(&mut self) {
        for node_id in self.next_l.values() {
            self.nodes[node_id.0].suffix = Some(0);
        }

        let stop = self.cutset.iter().map(|id| id.0).min().unwrap_or(0);
        for node_id in (stop..self.nodes.len()).rev() {
            if let Some(suffix) = self.nodes[node_id].suffix {
                let mut inbound = self.nodes[node_id].inbound;
                while let Some(edge_id) = inbound {
                    let edge = self.edges[edge_id.0];

                    let through = suffix.saturating_add(edge.cost);
                    let origin = &mut self.nodes[edge.from.0];
                    origin.suffix = Some(origin.suffix.map_or(through, |s| s.max(through)));

                    inbound = edge.next;
                }
            }
        }
    }
}
