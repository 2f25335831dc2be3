//! Elaboration of function definitions, one group at a time.

use crate::ast::{Binding, DefId};
use crate::checker::Env;
use crate::clauses::{typecheck_clauses, Clause};
use crate::coverage::{check_coverage, CoverageError};
use crate::definition::Totality;
use crate::diagnostics::{ElabError, ErrorReporter};
use crate::elim::ElimNode;
use crate::equations::Equations;
use crate::termination::{check_termination, TerminationError};
use std::collections::BTreeSet;
use std::rc::Rc;
use tracing::{debug, instrument};

/// Compiles, checks and stores the body of the declared function `id`.
///
/// The tree is stored even when errors were reported, so later definitions
/// can still refer to the function. Returns whether no error was reported.
#[instrument(level = "debug", skip(env, clauses, reporter), fields(clauses = clauses.len()))]
pub fn elaborate_function(env: &mut Env, id: DefId, clauses: &[Clause], reporter: &mut dyn ErrorReporter) -> bool {
    let function = match env.function(id) {
        Ok(function) => function.clone(),
        Err(error) => {
            reporter.report(error.into());
            return false;
        }
    };
    let mut equations = Equations::new();
    let (mut tree, errors) = typecheck_clauses(env, &mut equations, &function.params, clauses, &function.result_type);
    let mut ok = errors.is_empty();
    for error in errors {
        reporter.report(error);
    }

    {
        let env = &*env;
        ok &= check_coverage(env, &mut tree, &function.result_type, &mut |counterexample| {
            reporter.report(CoverageError::missing_clause(env, counterexample).into());
        });
    }

    let mut metas: Vec<Rc<Binding>> = Vec::new();
    for leaf in tree.leaves() {
        if let Some(ElimNode::Leaf { expr, .. }) = tree.node(leaf) {
            for meta in expr.metas() {
                if !metas.contains(&meta) {
                    metas.push(meta);
                }
            }
        }
    }
    let solution = equations.solve(env, &metas);
    ok &= equations.errors().is_empty();
    equations.report_errors(reporter);

    let mut builder = tree.builder();
    builder.map_leaves(|expr| solution.apply(expr));
    builder.update_leaves_matched();
    if let Err(error) = env.set_elim_tree(id, tree) {
        reporter.report(error.into());
        ok = false;
    }
    debug!(ok, "elaborated function");
    ok
}

/// Runs the termination check on a group whose bodies are all set. Members
/// of a non-decreasing cycle (or the whole group, if the check gave up) are
/// marked [`Totality::Partial`].
#[instrument(level = "debug", skip(env, reporter))]
pub fn finalize_group(env: &mut Env, group: &[DefId], reporter: &mut dyn ErrorReporter) -> bool {
    let error = match check_termination(env, group) {
        Ok(()) => return true,
        Err(error) => error,
    };
    let partial: BTreeSet<DefId> = match &error {
        TerminationError::NonDecreasing { witnesses } => {
            witnesses.iter().flat_map(|witness| witness.definitions.iter().copied()).collect()
        }
        TerminationError::TooManyCalls { .. } => group.iter().copied().collect(),
    };
    for id in partial {
        if let Err(error) = env.set_totality(id, Totality::Partial) {
            reporter.report(ElabError::from(error));
        }
    }
    reporter.report(error.into());
    false
}
