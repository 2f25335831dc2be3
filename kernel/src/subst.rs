use crate::ast::{Binding, BindingId, Expr, Level, LevelVar, Sort};
use crate::levels::{LevelSolution, LevelValue};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// Maps bindings (local or inference) to expressions.
///
/// Iteration follows insertion order, so everything derived from a
/// substitution (counterexamples, contexts) is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExprSubstitution {
    entries: IndexMap<BindingId, (Rc<Binding>, Rc<Expr>)>,
}

impl ExprSubstitution {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn singleton(binding: &Rc<Binding>, expr: Rc<Expr>) -> Self {
        let mut subst = Self::new();
        subst.insert(binding, expr);
        subst
    }

    /// Maps every binding to a reference to itself.
    pub fn identity(bindings: &[Rc<Binding>]) -> Self {
        let mut subst = Self::new();
        for binding in bindings {
            subst.insert(binding, Expr::reference(binding));
        }
        subst
    }

    /// Inserts or replaces; a replaced entry keeps its position.
    pub fn insert(&mut self, binding: &Rc<Binding>, expr: Rc<Expr>) {
        self.entries.insert(binding.id, (binding.clone(), expr));
    }

    pub fn get(&self, id: BindingId) -> Option<&Rc<Expr>> {
        self.entries.get(&id).map(|(_, expr)| expr)
    }

    pub fn remove(&mut self, id: BindingId) -> Option<Rc<Expr>> {
        self.entries.shift_remove(&id).map(|(_, expr)| expr)
    }

    pub fn contains(&self, id: BindingId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Rc<Binding>, &Rc<Expr>)> {
        self.entries.values().map(|(binding, expr)| (binding, expr))
    }

    pub fn extend(&mut self, other: ExprSubstitution) {
        self.entries.extend(other.entries);
    }

    pub fn apply(&self, expr: &Expr) -> Rc<Expr> {
        if self.is_empty() {
            return Rc::new(expr.clone());
        }
        expr.map_expr(0, &mut |node, depth| match node {
            Expr::Ref(binding) | Expr::Meta(binding) => {
                self.get(binding.id).map(|value| value.lift(0, depth as isize))
            }
            _ => None,
        })
    }

    /// Same keys, with `next` applied to every value.
    pub fn then(&self, next: &ExprSubstitution) -> ExprSubstitution {
        let entries = self
            .entries
            .iter()
            .map(|(id, (binding, expr))| (*id, (binding.clone(), next.apply(expr))))
            .collect();
        ExprSubstitution { entries }
    }

    /// `self` extended by `inner` pushed through `self`; on shared keys the
    /// entry of `inner` wins.
    pub fn compose(&self, inner: &ExprSubstitution) -> ExprSubstitution {
        let mut result = self.clone();
        for (binding, expr) in inner.iter() {
            result.insert(binding, self.apply(expr));
        }
        result
    }
}

impl fmt::Display for ExprSubstitution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (binding, expr)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{} := {}", binding.name, expr)?;
        }
        Ok(())
    }
}

/// Assignment of level variables, produced by the level solver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LevelSubstitution {
    levels: HashMap<LevelVar, Level>,
}

impl LevelSubstitution {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_solution(solution: &LevelSolution<LevelVar>) -> Self {
        let levels = solution
            .iter()
            .map(|(var, value)| {
                let level = match value {
                    LevelValue::Finite(constant) => Level::constant(constant),
                    LevelValue::Infinity => Level::Infinity,
                };
                (*var, level)
            })
            .collect();
        LevelSubstitution { levels }
    }

    pub fn insert(&mut self, var: LevelVar, level: Level) {
        self.levels.insert(var, level);
    }

    pub fn get(&self, var: LevelVar) -> Option<Level> {
        self.levels.get(&var).copied()
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn apply_level(&self, level: Level) -> Level {
        match level {
            Level::Finite { var: Some(var), constant } => match self.get(var) {
                Some(Level::Finite { var, constant: offset }) => Level::Finite { var, constant: constant + offset },
                Some(Level::Infinity) => Level::Infinity,
                None => level,
            },
            _ => level,
        }
    }

    pub fn apply_sort(&self, sort: Sort) -> Sort {
        Sort::new(self.apply_level(sort.plevel), self.apply_level(sort.hlevel))
    }

    pub fn apply(&self, expr: &Expr) -> Rc<Expr> {
        expr.map_expr(0, &mut |node, _| match node {
            Expr::Universe(sort) => Some(Expr::universe(self.apply_sort(*sort))),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::TeleEntry;

    fn set0() -> Rc<Expr> {
        Expr::universe(Sort::SET0)
    }

    #[test]
    fn apply_replaces_references_under_binders() {
        let x = Binding::new("x", set0());
        let subst = ExprSubstitution::singleton(&x, Expr::var(0));
        // \lam (y : U) => x, with x := #0 seen from outside
        let e = Expr::lam(vec![TeleEntry::single("y", set0())], Expr::reference(&x));
        assert_eq!(
            subst.apply(&e),
            Expr::lam(vec![TeleEntry::single("y", set0())], Expr::var(1))
        );
    }

    #[test]
    fn compose_pushes_inner_values_through_outer() {
        let n = Binding::new("n", set0());
        let m = Binding::new("m", set0());
        let outer = ExprSubstitution::singleton(&m, Expr::universe(Sort::PROP));
        let inner = ExprSubstitution::singleton(&n, Expr::reference(&m));
        let composed = outer.compose(&inner);
        assert_eq!(composed.get(n.id), Some(&Expr::universe(Sort::PROP)));
        assert_eq!(composed.get(m.id), Some(&Expr::universe(Sort::PROP)));
        assert_eq!(composed.len(), 2);
    }

    #[test]
    fn insert_keeps_position_of_replaced_entry() {
        let a = Binding::new("a", set0());
        let b = Binding::new("b", set0());
        let mut subst = ExprSubstitution::identity(&[a.clone(), b.clone()]);
        subst.insert(&a, set0());
        let order: Vec<_> = subst.iter().map(|(binding, _)| binding.name.clone()).collect();
        assert_eq!(order, vec!["a", "b"]);
        assert_eq!(subst.to_string(), "a := \\Set0, b := b");
    }

    #[test]
    fn level_substitution_offsets_constants() {
        let v = LevelVar(3);
        let mut subst = LevelSubstitution::new();
        subst.insert(v, Level::constant(2));
        let sort = Sort::new(Level::Finite { var: Some(v), constant: 1 }, Level::var(v));
        assert_eq!(subst.apply_sort(sort), Sort::new(Level::constant(3), Level::constant(2)));
        let expr = Expr::universe(sort);
        assert_eq!(
            subst.apply(&expr),
            Expr::universe(Sort::new(Level::constant(3), Level::constant(2)))
        );
    }
}
