//! Compilation of user clauses into an elimination tree.
//!
//! Clauses arrive name-resolved: every pattern variable is a distinct
//! [`Binding`]. The compiler keeps a matrix of rows, one per clause still
//! able to match, whose columns line up with the context of the node being
//! built. It splits on the first constructor pattern of the first row until
//! that row consists of variables only; the row's right-hand side then
//! becomes the leaf, with its pattern variables renamed to the bindings of
//! the leaf's context.

use crate::ast::{data_call, Binding, DefId, Expr};
use crate::checker::{check, matched_constructors, whnf, Context, Env, MatchedConstructor};
use crate::diagnostics::ElabError;
use crate::elim::{split_binding, ElimTree, NodeId, NodeScope};
use crate::equations::{Equations, SourceNode};
use crate::subst::ExprSubstitution;
use std::rc::Rc;
use thiserror::Error;
use tracing::{debug, instrument, trace};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    Binding(Rc<Binding>),
    /// Wildcard.
    Any,
    Constructor(DefId, Vec<Pattern>),
}

impl Pattern {
    pub fn con(constructor: DefId, args: Vec<Pattern>) -> Self {
        Pattern::Constructor(constructor, args)
    }
}

/// One row of a definition by pattern matching. A missing right-hand side
/// marks an absurd clause, whose patterns must cover no values.
#[derive(Debug, Clone)]
pub struct Clause {
    pub patterns: Vec<Pattern>,
    pub rhs: Option<Rc<Expr>>,
}

impl Clause {
    pub fn new(patterns: Vec<Pattern>, rhs: Rc<Expr>) -> Self {
        Clause { patterns, rhs: Some(rhs) }
    }

    pub fn absurd(patterns: Vec<Pattern>) -> Self {
        Clause { patterns, rhs: None }
    }
}

#[derive(Debug, Error, Clone)]
pub enum PatternError {
    #[error("clause {clause} has {actual} patterns, expected {expected}")]
    WrongPatternCount { clause: usize, expected: usize, actual: usize },
    #[error("cannot match on {binding}: its type {ty} is not a datatype")]
    NotADataType { binding: String, ty: Rc<Expr> },
    #[error("constructor {constructor} does not belong to {ty}")]
    ForeignConstructor { constructor: String, ty: Rc<Expr> },
    #[error("constructor {constructor} cannot produce a value of type {ty}")]
    UnavailableConstructor { constructor: String, ty: Rc<Expr> },
    #[error("constructor {constructor} takes {expected} arguments, the pattern has {actual}")]
    WrongArity { constructor: String, expected: usize, actual: usize },
    #[error("cannot decide which constructors of {ty} apply to {binding}")]
    CannotSplit { binding: String, ty: Rc<Expr> },
}

#[derive(Debug, Clone)]
struct Row {
    clause: usize,
    patterns: Vec<Pattern>,
    rhs: Option<Rc<Expr>>,
    /// Pattern variables bound so far, in terms of the current context.
    renaming: ExprSubstitution,
}

struct Compiler<'a> {
    env: &'a Env,
    equations: &'a mut Equations,
    expected: &'a Rc<Expr>,
    errors: Vec<ElabError>,
}

/// Compiles `clauses` over the parameters `params` into an elimination tree
/// and checks every right-hand side against `expected` (a type over
/// `params`). Errors are collected, not fatal: the tree is always returned,
/// with error leaves where a clause could not be used.
#[instrument(level = "debug", skip_all, fields(params = params.len(), clauses = clauses.len()))]
pub fn typecheck_clauses(
    env: &Env,
    equations: &mut Equations,
    params: &[Rc<Binding>],
    clauses: &[Clause],
    expected: &Rc<Expr>,
) -> (ElimTree, Vec<ElabError>) {
    let mut compiler = Compiler { env, equations, expected, errors: Vec::new() };
    let mut rows = Vec::with_capacity(clauses.len());
    for (index, clause) in clauses.iter().enumerate() {
        if clause.patterns.len() != params.len() {
            compiler.errors.push(
                PatternError::WrongPatternCount {
                    clause: index,
                    expected: params.len(),
                    actual: clause.patterns.len(),
                }
                .into(),
            );
            continue;
        }
        rows.push(Row {
            clause: index,
            patterns: clause.patterns.clone(),
            rhs: clause.rhs.clone(),
            renaming: ExprSubstitution::new(),
        });
    }

    let mut tree = ElimTree::new(params.to_vec());
    let root = tree.root();
    compiler.compile(&mut tree, root, NodeScope::root(params), rows);
    debug!(nodes = tree.len(), errors = compiler.errors.len(), "compiled clauses");
    (tree, compiler.errors)
}

impl Compiler<'_> {
    fn compile(&mut self, tree: &mut ElimTree, node: NodeId, scope: NodeScope, rows: Vec<Row>) {
        let Some(first) = rows.first() else {
            // Left Empty; coverage decides whether that is a missing clause.
            return;
        };
        let column = first.patterns.iter().position(|pattern| matches!(pattern, Pattern::Constructor(..)));
        match column {
            None => self.leaf(tree, node, &scope, first),
            Some(column) => self.split(tree, node, scope, rows, column),
        }
    }

    fn leaf(&mut self, tree: &mut ElimTree, node: NodeId, scope: &NodeScope, row: &Row) {
        let mut renaming = row.renaming.clone();
        for (pattern, binding) in row.patterns.iter().zip(&scope.context) {
            if let Pattern::Binding(var) = pattern {
                renaming.insert(var, Expr::reference(binding));
            }
        }
        let Some(rhs) = &row.rhs else {
            trace!(clause = row.clause, "absurd clause");
            tree.builder().make_empty(node);
            return;
        };
        let body = renaming.apply(rhs);
        let expected = scope.patterns.apply(self.expected);
        let source = SourceNode(u32::try_from(row.clause).unwrap_or(u32::MAX));
        if let Err(error) = check(self.env, self.equations, &Context::new(), &body, &expected, source) {
            self.errors.push(error.into());
        }
        tree.builder().make_leaf(node, body);
    }

    fn fail(&mut self, tree: &mut ElimTree, node: NodeId, error: PatternError) {
        self.errors.push(error.into());
        tree.builder().make_leaf(node, Expr::error());
    }

    fn split(&mut self, tree: &mut ElimTree, node: NodeId, scope: NodeScope, rows: Vec<Row>, column: usize) {
        let env = self.env;
        let scrutinee = scope.context[column].clone();
        let ty = whnf(env, &scrutinee.ty);
        let Some((data, data_args)) = data_call(&ty) else {
            return self.fail(tree, node, PatternError::NotADataType { binding: scrutinee.name.clone(), ty });
        };
        let Some(matched) = matched_constructors(env, data, &data_args) else {
            return self.fail(tree, node, PatternError::CannotSplit { binding: scrutinee.name.clone(), ty });
        };

        // Rows whose pattern in this column can never match are dropped
        // with an error.
        let leader = rows[0].clause;
        let mut live = Vec::with_capacity(rows.len());
        for row in rows {
            if let Pattern::Constructor(constructor, args) = &row.patterns[column] {
                if let Err(error) = self.validate(*constructor, args.len(), data, &ty, &matched) {
                    self.errors.push(error);
                    continue;
                }
            }
            live.push(row);
        }
        if live.first().map(|row| row.clause) != Some(leader) {
            // The row that chose this column is gone.
            return self.compile(tree, node, scope, live);
        }

        let tail = scope.context[column + 1..].to_vec();
        tree.builder().make_branch(node, scrutinee.clone(), tail.clone());
        for constructor in &matched {
            let selected: Vec<&Row> = live
                .iter()
                .filter(|row| match &row.patterns[column] {
                    Pattern::Constructor(id, _) => *id == constructor.constructor,
                    Pattern::Binding(_) | Pattern::Any => true,
                })
                .collect();
            if selected.is_empty() {
                continue;
            }
            let split = match split_binding(env, &scrutinee, &tail, constructor) {
                Ok(split) => split,
                Err(error) => {
                    self.errors.push(error.into());
                    continue;
                }
            };
            let Some(pattern) = split.subst.get(scrutinee.id).cloned() else {
                continue;
            };
            let arity = split.params.len();
            let child_rows = selected
                .into_iter()
                .map(|row| {
                    let mut renaming = row.renaming.then(&split.subst);
                    let mut patterns = row.patterns[..column].to_vec();
                    match &row.patterns[column] {
                        Pattern::Constructor(_, args) => patterns.extend(args.iter().cloned()),
                        Pattern::Binding(var) => {
                            renaming.insert(var, pattern.clone());
                            patterns.extend(std::iter::repeat(Pattern::Any).take(arity));
                        }
                        Pattern::Any => patterns.extend(std::iter::repeat(Pattern::Any).take(arity)),
                    }
                    patterns.extend(row.patterns[column + 1..].iter().cloned());
                    Row { clause: row.clause, patterns, rhs: row.rhs.clone(), renaming }
                })
                .collect();
            let child_scope = scope.descend(column, &split);
            let Some(child) = tree.builder().add_clause(node, split) else {
                continue;
            };
            trace!(constructor = ?constructor.constructor, child = child.0, "split");
            self.compile(tree, child, child_scope, child_rows);
        }
    }

    fn validate(
        &self,
        constructor: DefId,
        actual: usize,
        data: DefId,
        ty: &Rc<Expr>,
        matched: &[MatchedConstructor],
    ) -> Result<(), ElabError> {
        let con_def = self.env.constructor(constructor).map_err(ElabError::from)?;
        if con_def.data != data {
            return Err(PatternError::ForeignConstructor { constructor: con_def.name.clone(), ty: ty.clone() }.into());
        }
        if !matched.iter().any(|m| m.constructor == constructor) {
            return Err(PatternError::UnavailableConstructor { constructor: con_def.name.clone(), ty: ty.clone() }.into());
        }
        if con_def.arity() != actual {
            return Err(PatternError::WrongArity {
                constructor: con_def.name.clone(),
                expected: con_def.arity(),
                actual,
            }
            .into());
        }
        Ok(())
    }
}
