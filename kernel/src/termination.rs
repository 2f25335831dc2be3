//! Size-change termination of mutually recursive groups.
//!
//! Every recursive call found in a leaf of an elimination tree yields a call
//! matrix relating the caller's parameters (rows) to the callee's arguments
//! (columns). The closure of the call graph under composition is computed;
//! the group terminates iff every idempotent self-loop in the closure has a
//! strictly decreasing entry on its diagonal.

use crate::ast::{constructor_head, spine, DefId, Expr};
use crate::checker::Env;
use indexmap::IndexSet;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use thiserror::Error;
use tracing::{debug, instrument, trace};

// =============================================================================
// Relations and matrices
// =============================================================================

/// Size of an argument compared to a parameter. Ordered by strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Relation {
    Unknown,
    Equal,
    Less,
}

impl Relation {
    /// Relation along a path of two steps.
    pub fn compose(self, next: Relation) -> Relation {
        match (self, next) {
            (Relation::Unknown, _) | (_, Relation::Unknown) => Relation::Unknown,
            (Relation::Less, _) | (_, Relation::Less) => Relation::Less,
            (Relation::Equal, Relation::Equal) => Relation::Equal,
        }
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            Relation::Unknown => "?",
            Relation::Equal => "=",
            Relation::Less => "<",
        };
        f.write_str(symbol)
    }
}

#[derive(Debug, Clone)]
pub struct CallMatrix {
    pub domain: DefId,
    pub codomain: DefId,
    rows: usize,
    cols: usize,
    entries: Vec<Relation>,
    /// Definitions along the path, both ends included.
    pub path: Vec<DefId>,
}

impl PartialEq for CallMatrix {
    fn eq(&self, other: &Self) -> bool {
        self.domain == other.domain
            && self.codomain == other.codomain
            && self.rows == other.rows
            && self.cols == other.cols
            && self.entries == other.entries
    }
}

impl Eq for CallMatrix {}

impl Hash for CallMatrix {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.domain.hash(state);
        self.codomain.hash(state);
        self.rows.hash(state);
        self.cols.hash(state);
        self.entries.hash(state);
    }
}

impl CallMatrix {
    /// All entries Unknown.
    pub fn new(domain: DefId, codomain: DefId, rows: usize, cols: usize) -> Self {
        CallMatrix {
            domain,
            codomain,
            rows,
            cols,
            entries: vec![Relation::Unknown; rows * cols],
            path: vec![domain, codomain],
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn get(&self, row: usize, col: usize) -> Relation {
        if row < self.rows && col < self.cols {
            self.entries[row * self.cols + col]
        } else {
            Relation::Unknown
        }
    }

    pub fn set(&mut self, row: usize, col: usize, relation: Relation) {
        if row < self.rows && col < self.cols {
            self.entries[row * self.cols + col] = relation;
        }
    }

    /// The matrix of the path `self` followed by `next`; `None` when the
    /// two calls do not chain.
    pub fn compose(&self, next: &CallMatrix) -> Option<CallMatrix> {
        if self.codomain != next.domain || self.cols != next.rows {
            return None;
        }
        let mut result = CallMatrix::new(self.domain, next.codomain, self.rows, next.cols);
        for i in 0..self.rows {
            for k in 0..next.cols {
                let best = (0..self.cols)
                    .map(|j| self.get(i, j).compose(next.get(j, k)))
                    .max()
                    .unwrap_or(Relation::Unknown);
                result.set(i, k, best);
            }
        }
        result.path = self.path.clone();
        result.path.extend(next.path.iter().skip(1));
        Some(result)
    }

    pub fn is_self_loop(&self) -> bool {
        self.domain == self.codomain
    }

    pub fn is_idempotent(&self) -> bool {
        self.compose(self).as_ref() == Some(self)
    }

    pub fn has_decreasing_diagonal(&self) -> bool {
        (0..self.rows.min(self.cols)).any(|i| self.get(i, i) == Relation::Less)
    }
}

impl fmt::Display for CallMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for row in 0..self.rows {
            if row > 0 {
                write!(f, "; ")?;
            }
            for col in 0..self.cols {
                if col > 0 {
                    write!(f, " ")?;
                }
                write!(f, "{}", self.get(row, col))?;
            }
        }
        write!(f, "]")
    }
}

// =============================================================================
// Call graph
// =============================================================================

/// Call matrices closed under composition, up to a size limit.
#[derive(Debug, Clone)]
pub struct CallGraph {
    calls: Vec<CallMatrix>,
    closure: IndexSet<CallMatrix>,
    limit: usize,
}

impl CallGraph {
    pub fn new(limit: usize) -> Self {
        CallGraph { calls: Vec::new(), closure: IndexSet::new(), limit }
    }

    pub fn add_call(&mut self, matrix: CallMatrix) {
        if self.closure.insert(matrix.clone()) {
            self.calls.push(matrix);
        }
    }

    pub fn calls(&self) -> &[CallMatrix] {
        &self.calls
    }

    /// Extends every known path by one more call until nothing new appears.
    pub fn close(&mut self) -> Result<(), TerminationError> {
        let mut work: Vec<CallMatrix> = self.closure.iter().cloned().collect();
        while let Some(path) = work.pop() {
            for call in &self.calls {
                let Some(longer) = path.compose(call) else {
                    continue;
                };
                if self.closure.contains(&longer) {
                    continue;
                }
                if self.closure.len() >= self.limit {
                    debug!(limit = self.limit, "call graph closure too large");
                    return Err(TerminationError::TooManyCalls { limit: self.limit });
                }
                trace!(matrix = %longer, "new path");
                self.closure.insert(longer.clone());
                work.push(longer);
            }
        }
        Ok(())
    }

    pub fn closure(&self) -> impl Iterator<Item = &CallMatrix> {
        self.closure.iter()
    }

    /// Idempotent self-loops of the closure without a decreasing diagonal.
    pub fn witnesses(&self) -> Vec<&CallMatrix> {
        self.closure
            .iter()
            .filter(|m| m.is_self_loop() && m.is_idempotent() && !m.has_decreasing_diagonal())
            .collect()
    }
}

// =============================================================================
// Errors
// =============================================================================

/// A cycle of calls with no decreasing argument.
#[derive(Debug, Clone)]
pub struct Witness {
    pub definitions: Vec<DefId>,
    pub names: Vec<String>,
    pub matrix: CallMatrix,
}

impl fmt::Display for Witness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.names.join(" -> "), self.matrix)
    }
}

fn render_witnesses(witnesses: &[Witness]) -> String {
    witnesses.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

#[derive(Debug, Error, Clone)]
pub enum TerminationError {
    #[error("cannot prove termination: {}", render_witnesses(.witnesses))]
    NonDecreasing { witnesses: Vec<Witness> },
    #[error("cannot prove termination: more than {limit} call matrices")]
    TooManyCalls { limit: usize },
}

// =============================================================================
// Collecting calls
// =============================================================================

/// Compares an argument of a recursive call with the pattern a parameter
/// was matched against.
pub fn relate(arg: &Rc<Expr>, pattern: &Rc<Expr>) -> Relation {
    if arg == pattern {
        Relation::Equal
    } else if is_strict_subterm(arg, pattern) {
        Relation::Less
    } else {
        Relation::Unknown
    }
}

fn is_strict_subterm(arg: &Rc<Expr>, pattern: &Rc<Expr>) -> bool {
    match constructor_head(pattern) {
        Some((_, _, args)) => args.iter().any(|sub| sub == arg || is_strict_subterm(arg, sub)),
        None => false,
    }
}

fn collect_calls(expr: &Rc<Expr>, group: &BTreeSet<DefId>, out: &mut Vec<(DefId, Vec<Rc<Expr>>)>) {
    let (head, args) = spine(expr);
    if args.is_empty() {
        if let Expr::FunCall(id) = &*head {
            if group.contains(id) {
                out.push((*id, Vec::new()));
            }
        }
        for child in expr.children() {
            collect_calls(child, group, out);
        }
        return;
    }
    match &*head {
        Expr::FunCall(id) if group.contains(id) => out.push((*id, args.clone())),
        Expr::FunCall(_) => {}
        _ => collect_calls(&head, group, out),
    }
    for arg in &args {
        collect_calls(arg, group, out);
    }
}

/// Call matrices of every call to a member of `group` made by `caller`.
pub fn call_matrices(env: &Env, caller: DefId, group: &BTreeSet<DefId>) -> Vec<CallMatrix> {
    let Ok(function) = env.function(caller) else {
        return Vec::new();
    };
    let Some(tree) = &function.elim_tree else {
        return Vec::new();
    };
    let scopes = tree.scopes();
    let mut matrices = Vec::new();
    for leaf in tree.leaves() {
        let Some(Some(scope)) = scopes.get(leaf.0 as usize) else {
            continue;
        };
        let Some(body) = tree.instantiate_leaf(leaf, &Default::default()) else {
            continue;
        };
        let patterns: Vec<Rc<Expr>> = scope.patterns.iter().map(|(_, pattern)| pattern.clone()).collect();
        let mut calls = Vec::new();
        collect_calls(&body, group, &mut calls);
        for (callee, args) in calls {
            let arity = env.function(callee).map(|f| f.params.len()).unwrap_or(args.len());
            let mut matrix = CallMatrix::new(caller, callee, patterns.len(), arity);
            for (row, pattern) in patterns.iter().enumerate() {
                for (col, arg) in args.iter().take(arity).enumerate() {
                    matrix.set(row, col, relate(arg, pattern));
                }
            }
            trace!(caller = caller.0, callee = callee.0, %matrix, "call");
            matrices.push(matrix);
        }
    }
    matrices
}

/// Size-change check of a group of mutually recursive functions.
#[instrument(level = "debug", skip(env))]
pub fn check_termination(env: &Env, group: &[DefId]) -> Result<(), TerminationError> {
    let members: BTreeSet<DefId> = group.iter().copied().collect();
    let mut graph = CallGraph::new(env.config().max_call_matrices);
    for &caller in group {
        for matrix in call_matrices(env, caller, &members) {
            graph.add_call(matrix);
        }
    }
    graph.close()?;

    let witnesses: Vec<Witness> = graph
        .witnesses()
        .into_iter()
        .map(|matrix| Witness {
            definitions: matrix.path.clone(),
            names: matrix
                .path
                .iter()
                .map(|id| env.get(*id).map(|def| def.name().to_string()).unwrap_or_else(|_| format!("{id:?}")))
                .collect(),
            matrix: matrix.clone(),
        })
        .collect();
    if witnesses.is_empty() {
        debug!("group terminates");
        Ok(())
    } else {
        debug!(count = witnesses.len(), "non-decreasing cycles");
        Err(TerminationError::NonDecreasing { witnesses })
    }
}
