//! Property tests for index arithmetic, call matrices and the level solver

use dtt_kernel::ast::{DefId, Expr, Sort, TeleEntry};
use dtt_kernel::levels::{LevelEquation, LevelEquations, LevelValue};
use dtt_kernel::termination::{CallGraph, CallMatrix, Relation};
use proptest::prelude::*;
use std::rc::Rc;

// =============================================================================
// STRATEGIES
// =============================================================================

fn expr_strategy() -> impl Strategy<Value = Rc<Expr>> {
    let leaf = prop_oneof![
        (0usize..4).prop_map(Expr::var),
        Just(Expr::universe(Sort::PROP)),
        Just(Expr::universe(Sort::SET0)),
        Just(Expr::fun(DefId(0))),
    ];
    leaf.prop_recursive(4, 32, 3, |inner| {
        prop_oneof![
            (inner.clone(), inner.clone()).prop_map(|(f, a)| Expr::app(f, a)),
            (inner.clone(), inner.clone()).prop_map(|(ty, body)| Expr::lam(vec![TeleEntry::single("x", ty)], body)),
            (inner.clone(), inner.clone(), inner.clone()).prop_map(|(a, b, codomain)| {
                Expr::pi(vec![TeleEntry::new(["x", "y"], a), TeleEntry::single("z", b)], codomain)
            }),
            (inner.clone(), 0usize..2).prop_map(|(tuple, field)| Rc::new(Expr::Proj(tuple, field))),
        ]
    })
}

fn relation_strategy() -> impl Strategy<Value = Relation> {
    prop_oneof![Just(Relation::Unknown), Just(Relation::Equal), Just(Relation::Less)]
}

fn matrix_strategy() -> impl Strategy<Value = CallMatrix> {
    prop::collection::vec(relation_strategy(), 4).prop_map(|entries| {
        let mut matrix = CallMatrix::new(DefId(0), DefId(0), 2, 2);
        for (i, relation) in entries.into_iter().enumerate() {
            matrix.set(i / 2, i % 2, relation);
        }
        matrix
    })
}

/// `upper >= lower + constant` over three variables and the base level,
/// binding only above `max_constant` when one is given.
type Bound = (Option<u8>, Option<u8>, i64, Option<i64>);

fn level_equation_strategy() -> impl Strategy<Value = Bound> {
    (prop::option::of(0u8..3), prop::option::of(0u8..3), -2i64..=2, prop::option::of(0i64..3))
}

fn level_of(assignment: &[LevelValue; 3], vertex: Option<u8>) -> LevelValue {
    vertex.map_or(LevelValue::Finite(0), |var| assignment[var as usize])
}

fn holds(assignment: &[LevelValue; 3], &(lower, upper, constant, max_constant): &Bound) -> bool {
    match (level_of(assignment, lower), level_of(assignment, upper)) {
        (_, LevelValue::Infinity) => true,
        (LevelValue::Infinity, LevelValue::Finite(_)) => false,
        (LevelValue::Finite(a), LevelValue::Finite(b)) => max_constant.is_some_and(|max| a <= max) || b >= a + constant,
    }
}

/// Every assignment satisfying all equations in which exactly the variables
/// at or above a forced infinity are infinite and the rest lie in
/// `0..=bound`.
fn satisfying(equations: &[Bound], infinite: &[u8], bound: i64) -> Vec<[LevelValue; 3]> {
    let mut forced = [false; 3];
    for &var in infinite {
        forced[var as usize] = true;
    }
    loop {
        let mut changed = false;
        for &(lower, upper, _, _) in equations {
            if let (Some(lower), Some(upper)) = (lower, upper) {
                if forced[lower as usize] && !forced[upper as usize] {
                    forced[upper as usize] = true;
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }

    let domain = |var: usize| -> Vec<LevelValue> {
        if forced[var] {
            vec![LevelValue::Infinity]
        } else {
            (0..=bound).map(LevelValue::Finite).collect()
        }
    };
    let mut out = Vec::new();
    for &a in &domain(0) {
        for &b in &domain(1) {
            for &c in &domain(2) {
                let assignment = [a, b, c];
                if equations.iter().all(|equation| holds(&assignment, equation)) {
                    out.push(assignment);
                }
            }
        }
    }
    out
}

// =============================================================================
// PROPERTIES
// =============================================================================

proptest! {
    /// Substituting into a freshly lifted term changes nothing, at any depth.
    #[test]
    fn substitution_cancels_lift(e in expr_strategy(), r in expr_strategy(), depth in 0usize..4) {
        prop_assert_eq!(e.lift(depth, 1).substitute(depth, &r), e);
    }

    /// Lifting by `i` then by `j` is lifting by `i + j`.
    #[test]
    fn lifts_compose(e in expr_strategy(), from in 0usize..3, i in 0isize..4, j in 0isize..4) {
        prop_assert_eq!(e.lift(from, i).lift(from, j), e.lift(from, i + j));
    }

    /// e[y := a][x := b] == e[x := b][y := a[x := b]], with y the innermost.
    #[test]
    fn substitution_lemma(e in expr_strategy(), a in expr_strategy(), b in expr_strategy()) {
        let direct = e.substitute(0, &a).substitute(0, &b);
        let swapped = e.substitute(1, &b.lift(0, 1)).substitute(0, &a.substitute(0, &b));
        prop_assert_eq!(direct, swapped);
    }

    #[test]
    fn matrix_composition_is_associative(
        a in matrix_strategy(),
        b in matrix_strategy(),
        c in matrix_strategy(),
    ) {
        let left = a.compose(&b).and_then(|ab| ab.compose(&c));
        let right = b.compose(&c).and_then(|bc| a.compose(&bc));
        prop_assert_eq!(left, right);
    }

    #[test]
    fn relation_composition_is_monotone(
        a in relation_strategy(),
        b in relation_strategy(),
        c in relation_strategy(),
    ) {
        if a <= b {
            prop_assert!(a.compose(c) <= b.compose(c));
            prop_assert!(c.compose(a) <= c.compose(b));
        }
    }

    /// A cycle whose calls never shrink an argument stays non-decreasing
    /// however often it is taken.
    #[test]
    fn powers_of_non_decreasing_cycle_never_decrease(
        entries in prop::collection::vec(prop_oneof![Just(Relation::Unknown), Just(Relation::Equal)], 4),
        times in 1usize..6,
    ) {
        let mut cycle = CallMatrix::new(DefId(0), DefId(0), 2, 2);
        for (i, relation) in entries.into_iter().enumerate() {
            cycle.set(i / 2, i % 2, relation);
        }
        let mut power = cycle.clone();
        for _ in 1..times {
            power = power.compose(&cycle).expect("a self-loop chains with itself");
            for i in 0..2 {
                for j in 0..2 {
                    prop_assert_ne!(power.get(i, j), Relation::Less);
                }
            }
        }
        prop_assert_eq!(power.path.len(), times + 1);
    }

    /// A call that keeps every argument in place (or drops it) terminates
    /// exactly when one of them shrinks.
    #[test]
    fn diagonal_call_terminates_iff_decreasing(diagonal in prop::collection::vec(relation_strategy(), 1..4)) {
        let n = diagonal.len();
        let mut matrix = CallMatrix::new(DefId(0), DefId(0), n, n);
        for (i, relation) in diagonal.iter().enumerate() {
            matrix.set(i, i, *relation);
        }
        let mut graph = CallGraph::new(64);
        graph.add_call(matrix);
        prop_assert!(graph.close().is_ok());
        let decreasing = diagonal.contains(&Relation::Less);
        prop_assert_eq!(graph.witnesses().is_empty(), decreasing);
    }

    /// The solver succeeds exactly when a small assignment exists, and its
    /// answer satisfies every equation and is below every other solution.
    #[test]
    fn level_solver_agrees_with_brute_force(
        equations in prop::collection::vec(level_equation_strategy(), 0..6),
        infinite in prop::collection::vec(0u8..3, 0..2),
    ) {
        let mut solver = LevelEquations::new();
        for &(lower, upper, constant, max_constant) in &equations {
            let equation = LevelEquation::new(lower, upper, constant);
            solver.add(match max_constant {
                Some(max) => equation.with_max_constant(max),
                None => equation,
            });
        }
        for &var in &infinite {
            solver.add_infinity(var);
        }
        let result = solver.solve();
        let others = satisfying(&equations, &infinite, 8);
        prop_assert_eq!(result.is_ok(), !others.is_empty(), "{:?}", result);

        if let Ok(solution) = result {
            let assignment = [solution.get(0), solution.get(1), solution.get(2)];
            for equation in &equations {
                prop_assert!(holds(&assignment, equation), "{:?} violates {:?}", assignment, equation);
            }
            for &var in &infinite {
                prop_assert_eq!(assignment[var as usize], LevelValue::Infinity);
            }
            for other in &others {
                for var in 0..3 {
                    prop_assert!(assignment[var] <= other[var]);
                }
            }
        }
    }
}
