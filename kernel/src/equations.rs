//! Deferred comparisons, inference-variable solutions and level constraints
//! collected while elaborating one definition.

use crate::ast::{Binding, BindingId, Expr, Level, LevelVar, Sort};
use crate::checker::{compare, normalize, type_of, Context, Env};
use crate::diagnostics::{ElabError, ErrorReporter};
use crate::levels::{LevelEquation, LevelEquations};
use crate::subst::{ExprSubstitution, LevelSubstitution};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;
use thiserror::Error;
use tracing::{debug, instrument, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cmp {
    Le,
    Eq,
    Ge,
}

impl Cmp {
    pub fn flip(self) -> Cmp {
        match self {
            Cmp::Le => Cmp::Ge,
            Cmp::Eq => Cmp::Eq,
            Cmp::Ge => Cmp::Le,
        }
    }
}

impl fmt::Display for Cmp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            Cmp::Le => "<=",
            Cmp::Eq => "==",
            Cmp::Ge => ">=",
        };
        f.write_str(symbol)
    }
}

/// Opaque handle of the syntax an obligation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SourceNode(pub u32);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EquationKind {
    Compare,
    /// The solution `lhs` of the variable must have a type below `rhs`.
    TypeOf(Rc<Binding>),
}

#[derive(Debug, Clone)]
pub struct CmpEquation {
    pub lhs: Rc<Expr>,
    pub rhs: Rc<Expr>,
    pub cmp: Cmp,
    pub source: SourceNode,
    pub kind: EquationKind,
}

impl CmpEquation {
    pub fn mentions(&self, id: BindingId) -> bool {
        self.lhs.mentions(id) || self.rhs.mentions(id)
    }
}

impl fmt::Display for CmpEquation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            EquationKind::Compare => write!(f, "{} {} {}", self.lhs, self.cmp, self.rhs),
            EquationKind::TypeOf(var) => write!(f, "type of ?{} := {} {} {}", var.name, self.lhs, self.cmp, self.rhs),
        }
    }
}

fn render_path(path: &[LevelEquation<LevelVar>]) -> String {
    path.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

#[derive(Debug, Error, Clone)]
pub enum SolveError {
    #[error("cannot satisfy {lhs} {cmp} {rhs}")]
    Mismatch { lhs: Rc<Expr>, rhs: Rc<Expr>, cmp: Cmp, node: SourceNode },
    #[error("conflicting solutions for ?{var}: {first} and {second}")]
    Conflict { var: String, first: Rc<Expr>, second: Rc<Expr> },
    #[error("?{var} occurs in its own solution {solution}")]
    Cyclic { var: String, solution: Rc<Expr> },
    #[error("solution of ?{var} has type {actual}, expected {expected}")]
    SolutionTypeMismatch { var: String, expected: Rc<Expr>, actual: Rc<Expr> },
    #[error("{binding} is used outside of its scope in {equation}")]
    EscapedBinding { binding: String, equation: String },
    #[error("unsolvable level constraints: {}", render_path(.path))]
    UnsolvableLevels { path: Vec<LevelEquation<LevelVar>> },
    #[error("cannot infer ?{var}")]
    Unsolved { var: String },
    #[error("cannot solve {lhs} {cmp} {rhs}: stuck on an inference variable")]
    Stuck { lhs: Rc<Expr>, rhs: Rc<Expr>, cmp: Cmp, node: SourceNode },
}

#[derive(Debug, Clone)]
struct Solution {
    binding: Rc<Binding>,
    expr: Rc<Expr>,
    source: SourceNode,
}

/// Result of [`Equations::solve`].
#[derive(Debug, Clone, Default)]
pub struct Substitution {
    pub exprs: ExprSubstitution,
    pub levels: LevelSubstitution,
}

impl Substitution {
    pub fn apply(&self, expr: &Expr) -> Rc<Expr> {
        self.levels.apply(&self.exprs.apply(expr))
    }
}

/// Constraint store of one elaboration unit.
#[derive(Debug, Default)]
pub struct Equations {
    equations: Vec<CmpEquation>,
    solutions: IndexMap<BindingId, Solution>,
    levels: LevelEquations<LevelVar>,
    errors: Vec<SolveError>,
}

impl Equations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.equations.is_empty() && self.solutions.is_empty() && self.levels.is_empty()
    }

    /// Equations waiting for more information.
    pub fn deferred(&self) -> &[CmpEquation] {
        &self.equations
    }

    pub fn errors(&self) -> &[SolveError] {
        &self.errors
    }

    pub fn take_errors(&mut self) -> Vec<SolveError> {
        std::mem::take(&mut self.errors)
    }

    pub fn solution(&self, id: BindingId) -> Option<&Rc<Expr>> {
        self.solutions.get(&id).map(|solution| &solution.expr)
    }

    pub fn level_equations(&self) -> &LevelEquations<LevelVar> {
        &self.levels
    }

    // -------------------------------------------------------------------------
    // Collection
    // -------------------------------------------------------------------------

    /// Records `lhs cmp rhs` where at least one side may be an inference
    /// variable. A bare unsolved variable on one side takes the other side
    /// as its solution; everything else waits.
    pub fn add(&mut self, env: &Env, lhs: Rc<Expr>, rhs: Rc<Expr>, cmp: Cmp, source: SourceNode) -> bool {
        if let (Expr::Meta(a), Expr::Meta(b)) = (&*lhs, &*rhs) {
            if a.id == b.id {
                return true;
            }
        }
        if let Expr::Meta(var) = &*lhs {
            if let Some(result) = self.try_solve(env, var, &rhs, source) {
                return result;
            }
        }
        if let Expr::Meta(var) = &*rhs {
            if let Some(result) = self.try_solve(env, var, &lhs, source) {
                return result;
            }
        }
        self.defer(lhs, rhs, cmp, source);
        true
    }

    fn try_solve(&mut self, env: &Env, var: &Rc<Binding>, other: &Rc<Expr>, source: SourceNode) -> Option<bool> {
        if !self.solutions.contains_key(&var.id) && other.has_free_vars() {
            return None;
        }
        Some(self.add_solution(env, var, other.clone(), source))
    }

    /// First writer wins; a later solution must compare equal to it.
    pub fn add_solution(&mut self, env: &Env, var: &Rc<Binding>, expr: Rc<Expr>, source: SourceNode) -> bool {
        if let Some(existing) = self.solutions.get(&var.id).map(|solution| solution.expr.clone()) {
            if compare(env, self, Cmp::Eq, &existing, &expr, source) {
                return true;
            }
            debug!(var = %var.name, first = %existing, second = %expr, "conflicting solutions");
            self.errors.push(SolveError::Conflict {
                var: var.name.clone(),
                first: normalize(env, &existing),
                second: normalize(env, &expr),
            });
            return false;
        }
        debug!(var = %var.name, solution = %expr, "solved inference variable");
        self.solutions.insert(var.id, Solution { binding: var.clone(), expr, source });
        self.retry(env, var.id);
        true
    }

    /// Parks an equation until one of its variables is solved. Equations over
    /// variables that are solved already are picked up again by `solve`.
    pub fn defer(&mut self, lhs: Rc<Expr>, rhs: Rc<Expr>, cmp: Cmp, source: SourceNode) {
        let equation = CmpEquation { lhs, rhs, cmp, source, kind: EquationKind::Compare };
        debug!(%equation, "deferred equation");
        self.equations.push(equation);
    }

    pub fn fresh_level_var(&mut self) -> LevelVar {
        let var = LevelVar::fresh();
        self.levels.add_variable(var);
        var
    }

    pub fn add_level(&mut self, lhs: Level, rhs: Level, cmp: Cmp) -> bool {
        match cmp {
            Cmp::Le => self.add_level_le(lhs, rhs),
            Cmp::Ge => self.add_level_le(rhs, lhs),
            Cmp::Eq => self.add_level_le(lhs, rhs) & self.add_level_le(rhs, lhs),
        }
    }

    fn add_level_le(&mut self, lower: Level, upper: Level) -> bool {
        match (lower, upper) {
            (_, Level::Infinity) => true,
            (Level::Infinity, Level::Finite { var: Some(var), .. }) => {
                self.levels.add_infinity(var);
                true
            }
            (Level::Infinity, Level::Finite { var: None, .. }) => false,
            (Level::Finite { var: v1, constant: c1 }, Level::Finite { var: v2, constant: c2 }) => {
                if v1 == v2 {
                    return c1 <= c2;
                }
                // v2 + c2 >= v1 + c1
                self.levels.add(LevelEquation::new(v1, v2, c1 - c2));
                true
            }
        }
    }

    pub fn add_sort(&mut self, lhs: Sort, rhs: Sort, cmp: Cmp) -> bool {
        self.add_level(lhs.plevel, rhs.plevel, cmp) & self.add_level(lhs.hlevel, rhs.hlevel, cmp)
    }

    /// Called when `binding` goes out of scope: every obligation still
    /// mentioning it can no longer be discharged.
    pub fn abstract_binding(&mut self, binding: &Rc<Binding>) {
        let (escaped, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.equations).into_iter().partition(|eq| eq.mentions(binding.id));
        self.equations = kept;
        for equation in escaped {
            debug!(binding = %binding.name, %equation, "binding escapes its scope");
            self.errors.push(SolveError::EscapedBinding {
                binding: binding.name.clone(),
                equation: equation.to_string(),
            });
        }
        let stale: Vec<BindingId> = self
            .solutions
            .iter()
            .filter(|(_, solution)| solution.expr.mentions(binding.id))
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            if let Some(solution) = self.solutions.shift_remove(&id) {
                self.errors.push(SolveError::EscapedBinding {
                    binding: binding.name.clone(),
                    equation: format!("?{} := {}", solution.binding.name, solution.expr),
                });
            }
        }
    }

    // -------------------------------------------------------------------------
    // Resolution
    // -------------------------------------------------------------------------

    /// All solutions, with solved variables inside them replaced as far as
    /// that terminates.
    fn current_substitution(&self) -> ExprSubstitution {
        let mut direct = ExprSubstitution::new();
        for solution in self.solutions.values() {
            direct.insert(&solution.binding, solution.expr.clone());
        }
        let mut resolved = direct.clone();
        for _ in 0..self.solutions.len() {
            let next = resolved.then(&direct);
            if next == resolved {
                break;
            }
            resolved = next;
        }
        resolved
    }

    fn retry(&mut self, env: &Env, solved: BindingId) {
        let (waiting, rest): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.equations).into_iter().partition(|eq| eq.mentions(solved));
        self.equations = rest;
        for equation in waiting {
            self.resolve(env, equation);
        }
    }

    fn retry_all(&mut self, env: &Env) {
        for equation in std::mem::take(&mut self.equations) {
            self.resolve(env, equation);
        }
    }

    /// Substitutes the known solutions into a deferred equation, normalizes
    /// both sides and compares them again.
    fn resolve(&mut self, env: &Env, equation: CmpEquation) {
        let subst = self.current_substitution();
        let lhs = normalize(env, &subst.apply(&equation.lhs));
        let rhs = normalize(env, &subst.apply(&equation.rhs));
        trace!(%lhs, %rhs, "retrying equation");
        match &equation.kind {
            EquationKind::Compare => {
                if !compare(env, self, equation.cmp, &lhs, &rhs, equation.source) {
                    debug!(%lhs, %rhs, "deferred equation failed");
                    self.errors.push(SolveError::Mismatch { lhs, rhs, cmp: equation.cmp, node: equation.source });
                }
            }
            EquationKind::TypeOf(var) => match type_of(env, &Context::new(), &lhs) {
                Some(actual) => {
                    if !compare(env, self, Cmp::Le, &actual, &rhs, equation.source) {
                        self.errors.push(SolveError::SolutionTypeMismatch {
                            var: var.name.clone(),
                            expected: rhs,
                            actual: normalize(env, &actual),
                        });
                    }
                }
                None => self.equations.push(CmpEquation {
                    lhs,
                    rhs,
                    cmp: equation.cmp,
                    source: equation.source,
                    kind: EquationKind::TypeOf(var.clone()),
                }),
            },
        }
    }

    /// Removes the solved variables among `vars` from the store and returns
    /// their solutions. A solution is rejected (and reported) if it mentions
    /// its own variable or its type is not below the declared one.
    pub fn get_inference_variables(&mut self, env: &Env, vars: &mut HashSet<BindingId>) -> ExprSubstitution {
        let subst = self.current_substitution();
        let ids: Vec<BindingId> = self.solutions.keys().copied().filter(|id| vars.contains(id)).collect();
        let mut result = ExprSubstitution::new();
        for id in ids {
            let Some(solution) = self.solutions.shift_remove(&id) else {
                continue;
            };
            vars.remove(&id);
            let var = &solution.binding;
            let expr = subst.get(id).cloned().unwrap_or_else(|| solution.expr.clone());
            if expr.mentions(id) {
                debug!(var = %var.name, %expr, "cyclic solution");
                self.errors.push(SolveError::Cyclic { var: var.name.clone(), solution: expr });
                continue;
            }
            match type_of(env, &Context::new(), &expr) {
                Some(actual) => {
                    if !compare(env, self, Cmp::Le, &actual, &var.ty, solution.source) {
                        self.errors.push(SolveError::SolutionTypeMismatch {
                            var: var.name.clone(),
                            expected: normalize(env, &var.ty),
                            actual: normalize(env, &actual),
                        });
                        continue;
                    }
                }
                None => self.equations.push(CmpEquation {
                    lhs: expr.clone(),
                    rhs: var.ty.clone(),
                    cmp: Cmp::Le,
                    source: solution.source,
                    kind: EquationKind::TypeOf(var.clone()),
                }),
            }
            result.insert(var, expr);
        }
        result
    }

    /// Final pass: retries everything, extracts the solutions of `vars`,
    /// solves the level constraints and reports whatever is left.
    #[instrument(level = "debug", skip_all, fields(vars = vars.len()))]
    pub fn solve(&mut self, env: &Env, vars: &[Rc<Binding>]) -> Substitution {
        self.retry_all(env);
        let mut wanted: HashSet<BindingId> = vars.iter().map(|var| var.id).collect();
        let exprs = self.get_inference_variables(env, &mut wanted);
        for var in vars {
            if wanted.contains(&var.id) {
                self.errors.push(SolveError::Unsolved { var: var.name.clone() });
            }
        }

        let levels = match self.levels.solve() {
            Ok(solution) => LevelSubstitution::from_solution(&solution),
            Err(path) => {
                debug!(path = %render_path(&path), "unsolvable levels");
                self.errors.push(SolveError::UnsolvableLevels { path });
                LevelSubstitution::new()
            }
        };

        for equation in std::mem::take(&mut self.equations) {
            self.errors.push(SolveError::Stuck {
                lhs: normalize(env, &equation.lhs),
                rhs: normalize(env, &equation.rhs),
                cmp: equation.cmp,
                node: equation.source,
            });
        }
        debug!(solved = exprs.len(), errors = self.errors.len(), "solved equations");
        Substitution { exprs, levels }
    }

    /// Moves the state of `other` into this store.
    pub fn merge(&mut self, env: &Env, other: Equations) {
        self.levels.merge(other.levels);
        self.errors.extend(other.errors);
        self.equations.extend(other.equations);
        for solution in other.solutions.into_values() {
            self.add_solution(env, &solution.binding, solution.expr, solution.source);
        }
    }

    pub fn report_errors(&mut self, reporter: &mut dyn ErrorReporter) {
        for error in self.errors.drain(..) {
            reporter.report(ElabError::Solve(error));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::levels::LevelValue;

    fn prop() -> Rc<Expr> {
        Expr::universe(Sort::PROP)
    }

    fn set0() -> Rc<Expr> {
        Expr::universe(Sort::SET0)
    }

    fn meta(name: &str) -> Rc<Binding> {
        Binding::inference(name, Expr::universe(Sort::PROP.succ()))
    }

    #[test]
    fn bare_meta_is_solved() {
        let env = Env::new();
        let mut eqs = Equations::new();
        let m = meta("m");
        assert!(eqs.add(&env, Expr::reference(&m), prop(), Cmp::Eq, SourceNode(0)));
        assert!(eqs.deferred().is_empty());
        let subst = eqs.solve(&env, &[m.clone()]);
        assert_eq!(subst.exprs.get(m.id), Some(&prop()));
        assert!(eqs.errors().is_empty(), "{:?}", eqs.errors());
    }

    #[test]
    fn same_meta_on_both_sides_is_discharged() {
        let env = Env::new();
        let mut eqs = Equations::new();
        let m = meta("m");
        assert!(eqs.add(&env, Expr::reference(&m), Expr::reference(&m), Cmp::Le, SourceNode(0)));
        assert!(eqs.is_empty());
    }

    #[test]
    fn second_distinct_solution_conflicts() {
        let env = Env::new();
        let mut eqs = Equations::new();
        let m = Binding::inference("m", Expr::universe(Sort::SET0.succ()));
        assert!(eqs.add(&env, Expr::reference(&m), prop(), Cmp::Eq, SourceNode(1)));
        assert!(!eqs.add(&env, set0(), Expr::reference(&m), Cmp::Eq, SourceNode(2)));
        assert!(matches!(&eqs.errors()[0], SolveError::Conflict { var, .. } if var == "m"));
    }

    #[test]
    fn escaping_binding_purges_obligations() {
        let env = Env::new();
        let mut eqs = Equations::new();
        let x = Binding::new("x", set0());
        let m = meta("m");
        let k = meta("k");
        eqs.add(&env, Expr::reference(&m), Expr::reference(&x), Cmp::Eq, SourceNode(0));
        eqs.defer(Expr::app(Expr::reference(&k), Expr::reference(&x)), prop(), Cmp::Eq, SourceNode(1));
        eqs.abstract_binding(&x);
        assert!(eqs.deferred().is_empty());
        assert!(eqs.solution(m.id).is_none());
        assert_eq!(eqs.errors().len(), 2);
        assert!(eqs.errors().iter().all(|e| matches!(e, SolveError::EscapedBinding { binding, .. } if binding == "x")));
    }

    #[test]
    fn cyclic_solution_is_rejected() {
        let env = Env::new();
        let mut eqs = Equations::new();
        let f = Binding::new("f", Expr::arrow(set0(), set0()));
        let m = meta("m");
        let looping = Expr::app(Expr::reference(&f), Expr::reference(&m));
        assert!(eqs.add(&env, Expr::reference(&m), looping, Cmp::Eq, SourceNode(0)));
        let subst = eqs.solve(&env, &[m.clone()]);
        assert!(subst.exprs.is_empty());
        assert!(matches!(&eqs.errors()[0], SolveError::Cyclic { var, .. } if var == "m"));
    }

    #[test]
    fn unsolved_variable_is_reported() {
        let env = Env::new();
        let mut eqs = Equations::new();
        let m = meta("m");
        eqs.solve(&env, &[m]);
        assert_eq!(eqs.errors().len(), 1);
        assert_eq!(eqs.errors()[0].to_string(), "cannot infer ?m");
    }

    #[test]
    fn universe_comparison_feeds_the_level_solver() {
        let env = Env::new();
        let mut eqs = Equations::new();
        let p = eqs.fresh_level_var();
        let h = eqs.fresh_level_var();
        let lhs = Expr::universe(Sort::new(Level::constant(2), Level::constant(0)));
        let rhs = Expr::universe(Sort::new(Level::var(p), Level::var(h)));
        assert!(compare(&env, &mut eqs, Cmp::Le, &lhs, &rhs, SourceNode(0)));
        let subst = eqs.solve(&env, &[]);
        assert_eq!(subst.levels.get(p), Some(Level::constant(2)));
        assert_eq!(subst.levels.get(h), Some(Level::constant(0)));
        assert!(eqs.errors().is_empty());
    }

    #[test]
    fn constant_levels_are_checked_immediately() {
        let mut eqs = Equations::new();
        assert!(eqs.add_level(Level::constant(1), Level::constant(2), Cmp::Le));
        assert!(!eqs.add_level(Level::constant(3), Level::constant(2), Cmp::Le));
        assert!(!eqs.add_level(Level::Infinity, Level::constant(2), Cmp::Le));
        assert!(eqs.level_equations().is_empty());
    }

    #[test]
    fn infinity_lower_bound_forces_variable() {
        let mut eqs = Equations::new();
        let v = eqs.fresh_level_var();
        assert!(eqs.add_level(Level::Infinity, Level::var(v), Cmp::Le));
        let solution = eqs.level_equations().solve().expect("solvable");
        assert_eq!(solution.get(v), LevelValue::Infinity);
    }
}
