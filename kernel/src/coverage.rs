//! Exhaustiveness of elimination trees.

use crate::ast::{data_call, spine, Binding, Expr};
use crate::checker::{matched_constructors, sort_of, whnf, Context, Env, MatchedConstructor};
use crate::definition::Truncation;
use crate::elim::{scrutinee_index, split_binding, ElimNode, ElimTree, NodeScope};
use crate::subst::ExprSubstitution;
use std::rc::Rc;
use thiserror::Error;
use tracing::{debug, instrument, trace};

/// How deep the uninhabitedness search looks into constructor arguments.
const EMPTINESS_DEPTH: usize = 2;

#[derive(Debug, Error, Clone)]
pub enum CoverageError {
    #[error("missing clause: {rendered}")]
    MissingClause {
        /// Value of every parameter in the uncovered case.
        counterexample: ExprSubstitution,
        rendered: String,
    },
}

impl CoverageError {
    pub fn missing_clause(env: &Env, counterexample: &ExprSubstitution) -> Self {
        let rendered = counterexample
            .iter()
            .map(|(_, pattern)| render_pattern(env, pattern, false))
            .collect::<Vec<_>>()
            .join(" ");
        CoverageError::MissingClause { counterexample: counterexample.clone(), rendered }
    }
}

/// Prints a pattern with constructor and binding names.
pub fn render_pattern(env: &Env, pattern: &Rc<Expr>, nested: bool) -> String {
    let (head, args) = spine(pattern);
    let name = match &*head {
        Expr::ConCall(id, _) => match env.get(*id) {
            Ok(def) => def.name().to_string(),
            Err(_) => head.to_string(),
        },
        Expr::Ref(binding) => binding.name.clone(),
        _ => head.to_string(),
    };
    if args.is_empty() {
        return name;
    }
    let mut out = name;
    for arg in &args {
        out.push(' ');
        out.push_str(&render_pattern(env, arg, true));
    }
    if nested {
        format!("({out})")
    } else {
        out
    }
}

/// Checks that every constructor which can occur at a Branch has an edge,
/// growing missing edges with Empty children. Every Empty node must have a
/// provably uninhabited context; otherwise `on_missing` receives the values
/// of the root parameters in the uncovered case and the result is `false`.
///
/// Truncation constructors need no clause when the result type is itself
/// truncated at their level.
#[instrument(level = "debug", skip_all, fields(nodes = tree.len()))]
pub fn check_coverage(
    env: &Env,
    tree: &mut ElimTree,
    result_type: &Rc<Expr>,
    on_missing: &mut dyn FnMut(&ExprSubstitution),
) -> bool {
    let result_sort = sort_of(env, &Context::new(), result_type);
    let elided = |truncation: Option<Truncation>| match (truncation, result_sort) {
        (Some(Truncation::Prop), Some(sort)) => sort.is_prop(),
        (Some(Truncation::Set), Some(sort)) => sort.is_prop() || sort.is_set(),
        _ => false,
    };

    let mut covered = true;
    let mut stack = vec![(tree.root(), NodeScope::root(tree.context()))];
    while let Some((node, scope)) = stack.pop() {
        let (scrutinee, tail, clauses) = match tree.node(node) {
            Some(ElimNode::Branch { scrutinee, tail, clauses }) => (scrutinee.clone(), tail.clone(), clauses.clone()),
            Some(ElimNode::Empty) => {
                if !check_empty(env, &scope.context) {
                    debug!(case = %scope.patterns, "missing clause");
                    on_missing(&scope.patterns);
                    covered = false;
                }
                continue;
            }
            Some(ElimNode::Leaf { .. }) | None => continue,
        };
        let Some(index) = scrutinee_index(scope.context.len(), tail.len()) else {
            continue;
        };
        let mut children = Vec::new();
        let ty = whnf(env, &scrutinee.ty);
        let matched = data_call(&ty).and_then(|(data, args)| matched_constructors(env, data, &args));
        match matched {
            Some(matched) => {
                for constructor in matched {
                    if let Some(clause) = clauses.get(&constructor.constructor) {
                        children.push((clause.child, scope.descend(index, &clause.split)));
                        continue;
                    }
                    if elided(constructor.truncation) {
                        trace!(constructor = ?constructor.constructor, "truncation constructor elided");
                        continue;
                    }
                    let Ok(split) = split_binding(env, &scrutinee, &tail, &constructor) else {
                        continue;
                    };
                    let child_scope = scope.descend(index, &split);
                    if let Some(child) = tree.builder().add_clause(node, split) {
                        trace!(constructor = ?constructor.constructor, child = child.0, "grew missing edge");
                        children.push((child, child_scope));
                    }
                }
            }
            None => {
                debug!(scrutinee = %scrutinee.name, "constructors undecided, branch accepted");
                for clause in clauses.values() {
                    children.push((clause.child, scope.descend(index, &clause.split)));
                }
            }
        }
        // Visit children in declaration order.
        stack.extend(children.into_iter().rev());
    }
    covered
}

/// Whether some binding of `context` has a provably uninhabited type.
/// Bindings are tried in order and the search is bounded, so `false` means
/// "not shown empty", not "inhabited".
pub fn check_empty(env: &Env, context: &[Rc<Binding>]) -> bool {
    context.iter().any(|binding| is_uninhabited(env, &binding.ty, EMPTINESS_DEPTH))
}

fn is_uninhabited(env: &Env, ty: &Rc<Expr>, depth: usize) -> bool {
    let ty = whnf(env, ty);
    let Some((data, args)) = data_call(&ty) else {
        return false;
    };
    let Some(matched) = matched_constructors(env, data, &args) else {
        return false;
    };
    matched
        .iter()
        .all(|constructor| depth > 0 && has_uninhabited_argument(env, constructor, depth - 1))
}

fn has_uninhabited_argument(env: &Env, constructor: &MatchedConstructor, depth: usize) -> bool {
    let Ok(con_def) = env.constructor(constructor.constructor) else {
        return false;
    };
    let mut values = constructor.context_values.clone();
    for entry in &con_def.args {
        let ty = entry.ty.instantiate(&values);
        for name in &entry.names {
            if is_uninhabited(env, &ty, depth) {
                return true;
            }
            values.push(Expr::reference(&Binding::new(name.clone(), ty.clone())));
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Prelude;

    #[test]
    fn empty_datatype_is_uninhabited() {
        let prelude = Prelude::new();
        let x = Binding::new("x", Expr::data(prelude.empty));
        assert!(check_empty(&prelude.env, &[x]));
    }

    #[test]
    fn nat_is_not_shown_empty() {
        let prelude = Prelude::new();
        let n = Binding::new("n", prelude.nat_type());
        assert!(!check_empty(&prelude.env, &[n]));
    }

    #[test]
    fn constructor_with_empty_argument_is_uninhabited() {
        // Vec Empty (suc zero) only has cons, whose head would be in Empty
        let prelude = Prelude::new();
        let one = prelude.numeral(1);
        let xs = Binding::new("xs", prelude.vec_type(Expr::data(prelude.empty), one));
        assert!(check_empty(&prelude.env, &[xs]));
    }

    #[test]
    fn counterexample_renders_with_names() {
        let prelude = Prelude::new();
        let n = Binding::new("n", prelude.nat_type());
        let x = Binding::new("x", prelude.nat_type());
        let subst = ExprSubstitution::singleton(&n, prelude.suc(Expr::reference(&x)));
        let error = CoverageError::missing_clause(&prelude.env, &subst);
        assert_eq!(error.to_string(), "missing clause: suc x");
    }
}
