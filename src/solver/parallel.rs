use std::{hash::Hash, sync::Arc};

use parking_lot::{Condvar, Mutex};

use crate::{
    CompilationInput, CompilationType, Decision, DecisionDiagram, Frontier, LayeredMdd, Problem,
    Relaxation, Solver, StateRanking, SubProblem, VariableHeuristic, WidthHeuristic,
};

/// The shared data that may only be manipulated within critical sections
struct Critical<F>
where
    F: Frontier,
{
    /// This is the fringe: the set of nodes that must still be explored before
    /// the problem can be considered 'solved'.
    ///
    /// # Note:
    /// This fringe orders the nodes by upper bound (so the highest ub is going
    /// to pop first). So, it is guaranteed that the upper bound of the first
    /// node being popped is an upper bound on the value reachable by exploring
    /// any of the nodes remaining on the fringe. As a consequence, the
    /// exploration can be stopped as soon as a node with an ub <= current best
    /// lower bound is popped.
    fringe: F,
    /// This is the number of nodes that are currently being explored.
    ///
    /// # Note
    /// This information may seem innocuous/superfluous, whereas in fact it is
    /// very important. Indeed, this is the piece of information that lets us
    /// distinguish between a node-starvation and the completion of the problem
    /// resolution. The bottom line is, this counter needs to be carefully
    /// managed to guarantee the termination of all threads.
    ongoing: usize,
    /// This is a counter that tracks the number of nodes that have effectively
    /// been explored. That is, the number of nodes that have been popped from
    /// the fringe, and for which a restricted and relaxed mdd have been developed.
    explored: usize,
    /// This is the value of the best known lower bound.
    best_lb: isize,
    /// This is the value of the best known upper bound.
    /// *WARNING* This one only gets set when the problem is solved.
    best_ub: isize,
    /// If set, this keeps the info about the best solution so far.
    best_sol: Option<Vec<Decision>>,
    /// This vector is used to store the upper bound on the node which is
    /// currently processed by each thread.
    ///
    /// # Note
    /// When a thread is idle (or more generally when it is done with processing
    /// its node), it should place the value isize::MAX in its corresponding
    /// cell.
    upper_bounds: Vec<isize>,
}
/// The state which is shared among the many running threads: it provides an
/// access to the critical data (protected by a mutex) as well as a monitor
/// (condvar) to park threads in case of node-starvation.
struct Shared<'a, P, R, V, O, W, F>
where
    P: Problem + Send + Sync + 'a,
    P::State: Eq + PartialEq + Hash + Clone,
    R: Relaxation<State = P::State> + Send + Sync + 'a,
    V: VariableHeuristic<P::State> + Send + Sync + 'a,
    O: StateRanking<State = P::State> + Send + Sync + 'a,
    W: WidthHeuristic<P::State> + Send + Sync + 'a,
    F: Frontier<State = P::State> + Send,
{
    problem: &'a P,
    relaxation: &'a R,
    var_heu: &'a V,
    ranking: &'a O,
    width_heu: &'a W,

    /// This is the shared state data which can only be accessed within critical
    /// sections. Therefore, it is protected by a mutex which prevents concurrent
    /// reads/writes.
    critical: Mutex<Critical<F>>,
    /// This is the monitor on which nodes must wait when facing an empty fringe.
    /// The corollary, it that whenever a node has completed the processing of
    /// a subproblem, it must wakeup all parked threads waiting on this monitor.
    monitor: Condvar,
}
/// The workload a thread can get from the shared state
enum WorkLoad<T> {
    /// There is no work left to be done: you can safely terminate
    Complete,
    /// There is nothing you can do right now. Check again when you wake up
    Starvation,
    /// The item to process
    WorkItem { node: SubProblem<T> },
}

/// Branch and bound resolution driven by as many long running workers as
/// requested. Each worker owns one reusable decision diagram; everything they
/// exchange goes through the critical section.
pub struct ParallelSolver<'a, P, R, V, O, W, F>
where
    P: Problem + Send + Sync + 'a,
    P::State: Eq + PartialEq + Hash + Clone,
    R: Relaxation<State = P::State> + Send + Sync + 'a,
    V: VariableHeuristic<P::State> + Send + Sync + 'a,
    O: StateRanking<State = P::State> + Send + Sync + 'a,
    W: WidthHeuristic<P::State> + Send + Sync + 'a,
    F: Frontier<State = P::State> + Send,
{
    /// This is the shared state. Each thread is going to take a reference to it.
    shared: Shared<'a, P, R, V, O, W, F>,
    /// This is a configuration parameter that tunes the number of threads that
    /// will be spawned to solve the problem. By default, this number amounts
    /// to the number of hardware threads available on the machine.
    nb_threads: usize,
}

impl<'a, P, R, V, O, W, F> ParallelSolver<'a, P, R, V, O, W, F>
where
    P: Problem + Send + Sync + 'a,
    P::State: Eq + PartialEq + Hash + Clone,
    R: Relaxation<State = P::State> + Send + Sync + 'a,
    V: VariableHeuristic<P::State> + Send + Sync + 'a,
    O: StateRanking<State = P::State> + Send + Sync + 'a,
    W: WidthHeuristic<P::State> + Send + Sync + 'a,
    F: Frontier<State = P::State> + Send,
{
    pub fn new(
        problem: &'a P,
        relaxation: &'a R,
        var_heu: &'a V,
        ranking: &'a O,
        width_heu: &'a W,
        frontier: F,
    ) -> Self {
        Self::custom(
            num_cpus::get(),
            problem,
            relaxation,
            var_heu,
            ranking,
            width_heu,
            frontier,
        )
    }

    pub fn custom(
        nb_threads: usize,
        problem: &'a P,
        relaxation: &'a R,
        var_heu: &'a V,
        ranking: &'a O,
        width_heu: &'a W,
        frontier: F,
    ) -> Self {
        ParallelSolver {
            shared: Shared {
                problem,
                relaxation,
                var_heu,
                ranking,
                width_heu,
                //
                monitor: Condvar::new(),
                critical: Mutex::new(Critical {
                    best_sol: None,
                    best_lb: isize::MIN,
                    best_ub: isize::MAX,
                    upper_bounds: vec![isize::MAX; nb_threads],
                    fringe: frontier,
                    ongoing: 0,
                    explored: 0,
                }),
            },
            nb_threads,
        }
    }

    /// This method initializes the problem resolution. Put more simply, this
    /// method posts the root node of the mdd onto the fringe so that a thread
    /// can pick it up and the processing can be bootstrapped.
    fn initialize(&self) {
        let root = self.root_node();
        self.shared.critical.lock().fringe.push(root);
    }

    fn root_node(&self) -> SubProblem<P::State> {
        let shared = &self.shared;
        SubProblem {
            state: Arc::new(shared.problem.initial_state()),
            value: shared.problem.initial_value(),
            path: vec![],
            ub: isize::MAX,
        }
    }

    /// This method processes the given `node`. To do so, it reads the current
    /// best lower bound from the critical data. Then it expands a restricted
    /// and possibly a relaxed mdd rooted in `node`. If that is necessary,
    /// it stores cutset nodes onto the fringe for further parallel processing.
    fn process_one_node(
        mdd: &mut LayeredMdd<P::State>,
        shared: &Shared<'a, P, R, V, O, W, F>,
        node: SubProblem<P::State>,
    ) {
        // 1. RESTRICTION
        let node_ub = node.ub;
        let best_lb = Self::best_lb(shared);

        if node_ub <= best_lb {
            return;
        }

        let width = shared.width_heu.max_width(&node.state);
        let mut compilation = CompilationInput {
            comp_type: CompilationType::Restricted,
            max_width: width,
            problem: shared.problem,
            relaxation: shared.relaxation,
            var_heu: shared.var_heu,
            ranking: shared.ranking,
            residual: node,
            //
            best_lb,
        };

        mdd.compile(&compilation);
        Self::maybe_update_best(mdd, shared);
        if mdd.is_exact() {
            return;
        }

        // 2. RELAXATION
        compilation.comp_type = CompilationType::Relaxed;
        compilation.best_lb = Self::best_lb(shared);
        mdd.compile(&compilation);
        if mdd.is_exact() {
            Self::maybe_update_best(mdd, shared);
        } else {
            Self::enqueue_cutset(mdd, shared, node_ub);
        }
    }

    fn best_lb(shared: &Shared<'a, P, R, V, O, W, F>) -> isize {
        shared.critical.lock().best_lb
    }

    /// This private method updates the shared best known node and lower bound in
    /// case the best value of the current `mdd` expansion improves the current
    /// bounds.
    fn maybe_update_best(mdd: &LayeredMdd<P::State>, shared: &Shared<'a, P, R, V, O, W, F>) {
        let mut shared = shared.critical.lock();
        let dd_best_value = mdd.best_value().unwrap_or(isize::MIN);
        if dd_best_value > shared.best_lb {
            shared.best_lb = dd_best_value;
            shared.best_sol = mdd.best_solution();
        }
    }
    /// If necessary, tightens the bound of nodes in the cutset of `mdd` and
    /// then add the relevant nodes to the shared fringe.
    fn enqueue_cutset(
        mdd: &mut LayeredMdd<P::State>,
        shared: &Shared<'a, P, R, V, O, W, F>,
        ub: isize,
    ) {
        let mut critical = shared.critical.lock();
        let best_lb = critical.best_lb;

        mdd.drain_cutset(|mut cutset_node| {
            cutset_node.ub = ub.min(cutset_node.ub);
            if cutset_node.ub > best_lb {
                critical.fringe.push(cutset_node);
            }
        });
    }
    /// Acknowledges that a thread finished processing its node.
    fn notify_node_finished(shared: &Shared<'a, P, R, V, O, W, F>, thread_id: usize) {
        let mut critical = shared.critical.lock();
        critical.ongoing -= 1;
        critical.upper_bounds[thread_id] = isize::MAX;

        shared.monitor.notify_all();
    }

    /// Consults the shared state to fetch a workload. Depending on the current
    /// state, the workload can either be:
    ///
    ///   + Complete, when the problem is solved and all threads should stop
    ///   + Starvation, when there is no subproblem available for processing
    ///     at the time being (but some subproblem are still being processed
    ///     and thus the problem cannot be considered solved).
    ///   + WorkItem, when the thread successfully obtained a subproblem to
    ///     process.
    fn get_workload(
        shared: &Shared<'a, P, R, V, O, W, F>,
        thread_id: usize,
    ) -> WorkLoad<P::State> {
        let mut critical = shared.critical.lock();

        // Are we done ?
        if critical.ongoing == 0 && critical.fringe.is_empty() {
            critical.best_ub = critical.best_lb;
            shared.monitor.notify_all();
            return WorkLoad::Complete;
        }

        // Nothing to do yet ? => Wait for someone to post jobs
        if critical.fringe.is_empty() {
            shared.monitor.wait(&mut critical);
            return WorkLoad::Starvation;
        }

        // What we are about to pop is the most promising of the open nodes. If
        // it cannot improve on the incumbent, nothing in the fringe can.
        let nn = critical.fringe.pop().unwrap();
        if nn.ub <= critical.best_lb {
            critical.fringe.clear();
            return WorkLoad::Starvation;
        }

        // Consume the current node and process it
        critical.ongoing += 1;
        critical.explored += 1;
        critical.upper_bounds[thread_id] = nn.ub;

        WorkLoad::WorkItem { node: nn }
    }
}

impl<'a, P, R, V, O, W, F> Solver for ParallelSolver<'a, P, R, V, O, W, F>
where
    P: Problem + Send + Sync + 'a,
    P::State: Eq + PartialEq + Hash + Clone + Send + Sync,
    R: Relaxation<State = P::State> + Send + Sync + 'a,
    V: VariableHeuristic<P::State> + Send + Sync + 'a,
    O: StateRanking<State = P::State> + Send + Sync + 'a,
    W: WidthHeuristic<P::State> + Send + Sync + 'a,
    F: Frontier<State = P::State> + Send,
{
    /// Applies the branch and bound algorithm proposed by Bergman et al. to
    /// solve the problem to optimality. To do so, it spawns `nb_threads` workers
    /// (long running threads); each of which will continually get a workload
    /// and process it until the problem is solved.
    fn maximize(&mut self) {
        self.initialize();

        std::thread::scope(|s| {
            for i in 0..self.nb_threads {
                let shared = &self.shared;
                s.spawn(move || {
                    let mut mdd = LayeredMdd::<P::State>::new();
                    loop {
                        match Self::get_workload(shared, i) {
                            WorkLoad::Complete => break,
                            WorkLoad::Starvation => continue,
                            WorkLoad::WorkItem { node } => {
                                Self::process_one_node(&mut mdd, shared, node);
                                Self::notify_node_finished(shared, i);
                            }
                        }
                    }
                });
            }
        });
    }

    /// Returns the best solution that has been identified for this problem.
    fn best_solution(&self) -> Option<Vec<Decision>> {
        self.shared.critical.lock().best_sol.clone()
    }
    /// Returns the value of the best solution that has been identified for
    /// this problem.
    fn best_value(&self) -> Option<isize> {
        let critical = self.shared.critical.lock();
        critical.best_sol.as_ref().map(|_sol| critical.best_lb)
    }

    fn best_lower_bound(&self) -> isize {
        self.shared.critical.lock().best_lb
    }

    fn best_upper_bound(&self) -> isize {
        let critical = self.shared.critical.lock();
        if critical.ongoing == 0 && critical.fringe.is_empty() {
            critical.best_ub
        } else {
            critical
                .upper_bounds
                .iter()
                .copied()
                .filter(|ub| *ub != isize::MAX)
                .max()
                .unwrap_or(isize::MAX)
        }
    }

    fn explored(&self) -> usize {
        self.shared.critical.lock().explored
    }
}

// ############################################################################
// #### TESTS #################################################################
// ############################################################################

/// Unlike the rest of the library, the solver module is not tested in depth
/// with unit tests (this is way too hard to do). So we basically unit test the
/// configuration capabilities of the solver and then resort to the solving of
/// small instances with known optimum solution to validate the behavior of
/// the maximize function.

#[cfg(test)]
mod test_solver {
    use std::cmp::Ordering;

    use crate::{
        Decision, Fixed, Frontier, NaturalOrder, NoDupFrontier, ParallelSolver, Problem,
        Relaxation, SimpleFrontier, Solver, StateRanking, VarSet, Variable,
    };

    /// Describe the binary knapsack problem in terms of a dynamic program.
    /// The state of a node keeps track of the remaining capacity of the sack
    /// along with the number of items that have been considered so far. Two
    /// subproblems sharing a state are thus interchangeable, which makes the
    /// model safe to use with the no-dup frontier.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    struct KnapsackState {
        depth: usize,
        capacity: usize,
    }

    #[derive(Debug, Clone)]
    struct Knapsack {
        capacity: usize,
        profit: Vec<usize>,
        weight: Vec<usize>,
    }
    impl Problem for Knapsack {
        type State = KnapsackState;

        fn nb_variables(&self) -> usize {
            self.profit.len()
        }
        fn initial_state(&self) -> KnapsackState {
            KnapsackState {
                depth: 0,
                capacity: self.capacity,
            }
        }
        fn initial_value(&self) -> isize {
            0
        }
        fn for_each_in_domain<F>(&self, var: Variable, state: &KnapsackState, mut f: F)
        where
            F: FnMut(Decision),
        {
            f(Decision { var, value: 0 });
            if state.capacity >= self.weight[var.id()] {
                f(Decision { var, value: 1 });
            }
        }
        fn transition(&self, state: &KnapsackState, d: Decision) -> KnapsackState {
            KnapsackState {
                depth: state.depth + 1,
                capacity: state.capacity - self.weight[d.var.id()] * d.value as usize,
            }
        }
        fn transition_cost(&self, _state: &KnapsackState, d: Decision) -> isize {
            self.profit[d.var.id()] as isize * d.value
        }
    }

    /// Merge the nodes by creating a new fake node that has the maximum
    /// remaining capacity from the merged nodes: an obvious relaxation as it
    /// allows us to put more items in the sack.
    #[derive(Debug, Clone)]
    struct KpRelax<'a> {
        pb: &'a Knapsack,
    }
    impl Relaxation for KpRelax<'_> {
        type State = KnapsackState;

        fn merge_states(&self, states: &mut dyn Iterator<Item = &KnapsackState>) -> KnapsackState {
            let mut depth = 0;
            let mut capacity = 0;
            for state in states {
                depth = state.depth;
                capacity = capacity.max(state.capacity);
            }
            KnapsackState { depth, capacity }
        }
        fn relax_edge(
            &self,
            _src: &KnapsackState,
            _dst: &KnapsackState,
            _merged: &KnapsackState,
            _d: Decision,
            cost: isize,
        ) -> isize {
            cost
        }
        fn fast_upper_bound(&self, _state: &KnapsackState, free_vars: &VarSet) -> isize {
            // optimistically assume every remaining item fits in the sack;
            // sound because profits are non negative
            free_vars.iter().map(|v| self.pb.profit[v.id()] as isize).sum()
        }
    }

    #[derive(Debug, Clone, Copy)]
    struct KpRanking;
    impl StateRanking for KpRanking {
        type State = KnapsackState;
        fn compare(&self, a: &KnapsackState, b: &KnapsackState) -> Ordering {
            a.capacity.cmp(&b.capacity)
        }
    }

    fn instance() -> Knapsack {
        Knapsack {
            capacity: 269,
            profit: vec![55, 10, 47, 5, 4, 50, 8, 61, 85, 87],
            weight: vec![95, 4, 60, 32, 23, 72, 80, 62, 65, 46],
        }
    }

    /// Checks that the solution is a complete assignment and recomputes its
    /// value and weight against the model.
    fn check_solution(pb: &Knapsack, sln: &[Decision], expected: isize) {
        let mut sln = sln.to_vec();
        sln.sort_unstable_by_key(|d| d.var.id());

        let vars = sln.iter().map(|d| d.var.id()).collect::<Vec<_>>();
        assert_eq!(vars, (0..pb.nb_variables()).collect::<Vec<_>>());

        let value = sln
            .iter()
            .map(|d| pb.profit[d.var.id()] as isize * d.value)
            .sum::<isize>();
        let weight = sln
            .iter()
            .map(|d| pb.weight[d.var.id()] * d.value as usize)
            .sum::<usize>();

        assert_eq!(value, expected);
        assert!(weight <= pb.capacity);
    }

    fn solve<F>(pb: &Knapsack, width: usize, nb_threads: usize, frontier: F) -> (Option<isize>, Option<Vec<Decision>>, usize)
    where
        F: Frontier<State = KnapsackState> + Send,
    {
        let relax = KpRelax { pb };
        let var_heu = NaturalOrder;
        let ranking = KpRanking;
        let width_heu = Fixed(width);

        let mut solver =
            ParallelSolver::custom(nb_threads, pb, &relax, &var_heu, &ranking, &width_heu, frontier);
        solver.maximize();
        (solver.best_value(), solver.best_solution(), solver.explored())
    }

    #[test]
    fn by_default_best_lb_is_min_infinity() {
        let pb = instance();
        let relax = KpRelax { pb: &pb };
        let var_heu = NaturalOrder;
        let ranking = KpRanking;
        let width_heu = Fixed(2);
        let solver = ParallelSolver::custom(
            1,
            &pb,
            &relax,
            &var_heu,
            &ranking,
            &width_heu,
            SimpleFrontier::new(&ranking),
        );
        assert_eq!(solver.best_lower_bound(), isize::MIN);
        assert_eq!(solver.best_value(), None);
        assert_eq!(solver.explored(), 0);
    }

    #[test]
    fn by_default_best_ub_is_plus_infinity() {
        let pb = instance();
        let relax = KpRelax { pb: &pb };
        let var_heu = NaturalOrder;
        let ranking = KpRanking;
        let width_heu = Fixed(2);
        let solver = ParallelSolver::custom(
            1,
            &pb,
            &relax,
            &var_heu,
            &ranking,
            &width_heu,
            SimpleFrontier::new(&ranking),
        );
        assert_eq!(solver.best_upper_bound(), isize::MAX);
    }

    #[test]
    fn when_the_problem_is_solved_both_bounds_meet_the_best_value() {
        let pb = instance();
        let relax = KpRelax { pb: &pb };
        let var_heu = NaturalOrder;
        let ranking = KpRanking;
        let width_heu = Fixed(2);
        let mut solver = ParallelSolver::custom(
            1,
            &pb,
            &relax,
            &var_heu,
            &ranking,
            &width_heu,
            SimpleFrontier::new(&ranking),
        );
        solver.maximize();

        assert_eq!(solver.best_lower_bound(), 295);
        assert_eq!(solver.best_upper_bound(), 295);
        assert!(solver.explored() >= 1);
    }

    #[test]
    fn maximizes_yields_the_optimum_with_width_two() {
        let pb = instance();
        let ranking = KpRanking;
        let (value, sln, _) = solve(&pb, 2, 2, SimpleFrontier::new(&ranking));

        assert_eq!(value, Some(295));
        check_solution(&pb, &sln.unwrap(), 295);
    }

    #[test]
    fn maximizes_yields_the_optimum_with_width_one() {
        let pb = instance();
        let ranking = KpRanking;
        let (value, sln, _) = solve(&pb, 1, 2, SimpleFrontier::new(&ranking));

        assert_eq!(value, Some(295));
        check_solution(&pb, &sln.unwrap(), 295);
    }

    #[test]
    fn the_optimum_does_not_depend_on_the_number_of_threads() {
        let pb = instance();
        for nb_threads in [1, 2, 4] {
            let ranking = KpRanking;
            let (value, sln, _) = solve(&pb, 2, nb_threads, SimpleFrontier::new(&ranking));
            assert_eq!(value, Some(295));
            check_solution(&pb, &sln.unwrap(), 295);
        }
    }

    #[test]
    fn the_no_dup_frontier_finds_the_same_optimum() {
        let pb = instance();
        let ranking = KpRanking;
        let (value, sln, _) = solve(&pb, 2, 2, NoDupFrontier::new(&ranking));

        assert_eq!(value, Some(295));
        check_solution(&pb, &sln.unwrap(), 295);
    }

    #[test]
    fn a_sack_with_no_capacity_takes_no_item() {
        let pb = Knapsack {
            capacity: 0,
            profit: vec![55, 10, 47],
            weight: vec![95, 4, 60],
        };
        let ranking = KpRanking;
        let (value, sln, _) = solve(&pb, 2, 2, SimpleFrontier::new(&ranking));

        assert_eq!(value, Some(0));
        let sln = sln.unwrap();
        check_solution(&pb, &sln, 0);
        assert!(sln.iter().all(|d| d.value == 0));
    }

    #[test]
    fn an_item_that_does_not_fit_is_left_out() {
        let pb = Knapsack {
            capacity: 4,
            profit: vec![7],
            weight: vec![5],
        };
        let ranking = KpRanking;
        let (value, sln, _) = solve(&pb, 2, 1, SimpleFrontier::new(&ranking));

        assert_eq!(value, Some(0));
        let sln = sln.unwrap();
        check_solution(&pb, &sln, 0);
        assert_eq!(sln[0].value, 0);
    }

    #[test]
    fn two_small_items_are_both_taken() {
        let pb = Knapsack {
            capacity: 2,
            profit: vec![1, 1],
            weight: vec![1, 1],
        };
        let ranking = KpRanking;
        let (value, sln, _) = solve(&pb, 2, 1, SimpleFrontier::new(&ranking));

        assert_eq!(value, Some(2));
        let sln = sln.unwrap();
        check_solution(&pb, &sln, 2);
        assert!(sln.iter().all(|d| d.value == 1));
    }
}
