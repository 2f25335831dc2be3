//! Elimination trees: compiled pattern matches.
//!
//! A tree lives in an arena of nodes addressed by [`NodeId`]; every node
//! knows its parent edge. The tree is read through [`ElimTree`] (matching,
//! scopes) and grown only through an [`ElimTreeBuilder`], which needs
//! exclusive access.
//!
//! The context of the root is the parameter list of the function. A Branch
//! splits one binding of the current context (the scrutinee); the bindings
//! after it form its tail. Following the edge of constructor `c` replaces
//! the scrutinee by fresh bindings for the arguments of `c` and the tail by
//! fresh copies whose types see the scrutinee as `c` applied to them.

use crate::ast::{constructor_head, Binding, BindingId, DefId, Expr};
use crate::checker::{whnf_with_fuel, Env, EnvError, MatchedConstructor};
use crate::subst::ExprSubstitution;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::rc::Rc;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// The effect of following one constructor edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Split {
    pub constructor: DefId,
    /// Bindings for the constructor's arguments.
    pub params: Vec<Rc<Binding>>,
    /// Fresh copies of the tail of the scrutinee.
    pub tail: Vec<Rc<Binding>>,
    /// Scrutinee to the constructor pattern, old tail to new tail.
    pub subst: ExprSubstitution,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstructorClause {
    pub split: Split,
    pub child: NodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ElimNode {
    Leaf {
        expr: Rc<Expr>,
        /// Context bindings the right-hand side uses, once computed.
        matched: Option<Vec<BindingId>>,
    },
    Branch {
        scrutinee: Rc<Binding>,
        tail: Vec<Rc<Binding>>,
        clauses: IndexMap<DefId, ConstructorClause>,
    },
    /// No inhabitants, proven or asserted.
    Empty,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct NodeSlot {
    pub(crate) node: ElimNode,
    pub(crate) parent: Option<(NodeId, DefId)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElimTree {
    pub(crate) context: Vec<Rc<Binding>>,
    pub(crate) nodes: Vec<NodeSlot>,
    pub(crate) root: NodeId,
}

/// Why matching could not reach a leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StuckReason {
    /// The scrutinee is headed by a constructor the branch has no edge for.
    MissingClause(DefId),
    /// The scrutinee (in weak head normal form) is not a constructor
    /// application, or applies a constructor partially.
    NotConstructor(Rc<Expr>),
    /// Matching reached an Empty node.
    Empty,
    /// Wrong number of arguments for the tree.
    Arity { expected: usize, actual: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Match {
    Leaf { node: NodeId, subst: ExprSubstitution },
    Stuck { node: NodeId, subst: ExprSubstitution, reason: StuckReason },
}

/// The context of a node, and the value of each root parameter in it.
#[derive(Debug, Clone)]
pub struct NodeScope {
    pub context: Vec<Rc<Binding>>,
    pub patterns: ExprSubstitution,
}

impl NodeScope {
    pub(crate) fn root(context: &[Rc<Binding>]) -> Self {
        NodeScope { context: context.to_vec(), patterns: ExprSubstitution::identity(context) }
    }

    pub(crate) fn descend(&self, index: usize, split: &Split) -> NodeScope {
        let mut context = self.context[..index].to_vec();
        context.extend(split.params.iter().cloned());
        context.extend(split.tail.iter().cloned());
        NodeScope { context, patterns: self.patterns.then(&split.subst) }
    }
}

/// Position of the scrutinee in a context with the given tail.
pub(crate) fn scrutinee_index(context_len: usize, tail_len: usize) -> Option<usize> {
    context_len.checked_sub(tail_len + 1)
}

fn bind(context: &[Rc<Binding>], values: &[Rc<Expr>]) -> ExprSubstitution {
    let mut subst = ExprSubstitution::new();
    for (binding, value) in context.iter().zip(values) {
        subst.insert(binding, value.clone());
    }
    subst
}

/// Builds the edge for `matched` at a branch on `scrutinee` with `tail`.
pub fn split_binding(
    env: &Env,
    scrutinee: &Rc<Binding>,
    tail: &[Rc<Binding>],
    matched: &MatchedConstructor,
) -> Result<Split, EnvError> {
    let con_def = env.constructor(matched.constructor)?;
    let mut params: Vec<Rc<Binding>> = Vec::with_capacity(con_def.arity());
    for entry in &con_def.args {
        let mut values = matched.context_values.clone();
        values.extend(params.iter().map(Expr::reference));
        let ty = entry.ty.instantiate(&values);
        for name in &entry.names {
            params.push(Binding::new(name.clone(), ty.clone()));
        }
    }

    let pattern = Expr::apps(
        Expr::con(matched.constructor, matched.data_args.clone()),
        params.iter().map(Expr::reference),
    );
    let mut subst = ExprSubstitution::singleton(scrutinee, pattern);
    let mut new_tail = Vec::with_capacity(tail.len());
    for binding in tail {
        let fresh = Binding::new(binding.name.clone(), subst.apply(&binding.ty));
        subst.insert(binding, Expr::reference(&fresh));
        new_tail.push(fresh);
    }
    Ok(Split { constructor: matched.constructor, params, tail: new_tail, subst })
}

impl ElimTree {
    /// A tree over `context` consisting of a single Empty root.
    pub fn new(context: Vec<Rc<Binding>>) -> Self {
        ElimTree {
            context,
            nodes: vec![NodeSlot { node: ElimNode::Empty, parent: None }],
            root: NodeId(0),
        }
    }

    pub fn builder(&mut self) -> ElimTreeBuilder<'_> {
        ElimTreeBuilder { tree: self }
    }

    pub fn context(&self) -> &[Rc<Binding>] {
        &self.context
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> Option<&ElimNode> {
        self.nodes.get(id.index()).map(|slot| &slot.node)
    }

    /// The branch and constructor edge leading to `id`.
    pub fn parent(&self, id: NodeId) -> Option<(NodeId, DefId)> {
        self.nodes.get(id.index()).and_then(|slot| slot.parent)
    }

    pub fn child(&self, id: NodeId, constructor: DefId) -> Option<NodeId> {
        match self.node(id)? {
            ElimNode::Branch { clauses, .. } => clauses.get(&constructor).map(|clause| clause.child),
            _ => None,
        }
    }

    pub fn leaves(&self) -> Vec<NodeId> {
        (0..self.nodes.len())
            .filter_map(|i| u32::try_from(i).ok().map(NodeId))
            .filter(|id| matches!(self.node(*id), Some(ElimNode::Leaf { .. })))
            .collect()
    }

    /// Scope of every node reachable from the root, indexed by node.
    pub fn scopes(&self) -> Vec<Option<NodeScope>> {
        let mut scopes = vec![None; self.nodes.len()];
        let mut stack = vec![(self.root, NodeScope::root(&self.context))];
        while let Some((id, scope)) = stack.pop() {
            if let Some(ElimNode::Branch { tail, clauses, .. }) = self.node(id) {
                if let Some(index) = scrutinee_index(scope.context.len(), tail.len()) {
                    for clause in clauses.values() {
                        stack.push((clause.child, scope.descend(index, &clause.split)));
                    }
                }
            }
            if let Some(slot) = scopes.get_mut(id.index()) {
                *slot = Some(scope);
            }
        }
        scopes
    }

    pub fn collect_globals(&self, out: &mut BTreeSet<DefId>) {
        for binding in &self.context {
            binding.ty.collect_globals(out);
        }
        for slot in &self.nodes {
            match &slot.node {
                ElimNode::Leaf { expr, .. } => expr.collect_globals(out),
                ElimNode::Branch { clauses, .. } => out.extend(clauses.keys().copied()),
                ElimNode::Empty => {}
            }
        }
    }

    /// Right-hand side of a leaf under the substitution matching produced.
    pub fn instantiate_leaf(&self, node: NodeId, subst: &ExprSubstitution) -> Option<Rc<Expr>> {
        match self.node(node)? {
            ElimNode::Leaf { expr, .. } => Some(subst.apply(expr)),
            _ => None,
        }
    }

    /// Matches `args` (one per root parameter) down to a leaf. `None` when
    /// matching is stuck.
    pub fn match_args(&self, env: &Env, args: &[Rc<Expr>]) -> Option<(NodeId, ExprSubstitution)> {
        let mut fuel = env.config().normalization_fuel;
        self.match_args_with_fuel(env, args, &mut fuel)
    }

    pub(crate) fn match_args_with_fuel(
        &self,
        env: &Env,
        args: &[Rc<Expr>],
        fuel: &mut usize,
    ) -> Option<(NodeId, ExprSubstitution)> {
        match self.walk(env, args, fuel) {
            Match::Leaf { node, subst } => Some((node, subst)),
            Match::Stuck { .. } => None,
        }
    }

    /// Matches as far as the arguments allow and reports where and why it
    /// stopped.
    pub fn match_until_stuck(&self, env: &Env, args: &[Rc<Expr>]) -> Match {
        let mut fuel = env.config().normalization_fuel;
        self.walk(env, args, &mut fuel)
    }

    fn walk(&self, env: &Env, args: &[Rc<Expr>], fuel: &mut usize) -> Match {
        if args.len() != self.context.len() {
            return Match::Stuck {
                node: self.root,
                subst: ExprSubstitution::new(),
                reason: StuckReason::Arity { expected: self.context.len(), actual: args.len() },
            };
        }
        let mut context = self.context.clone();
        let mut values = args.to_vec();
        let mut node = self.root;
        loop {
            let (tail, clauses) = match self.node(node) {
                Some(ElimNode::Leaf { .. }) => {
                    return Match::Leaf { node, subst: bind(&context, &values) };
                }
                Some(ElimNode::Branch { tail, clauses, .. }) => (tail, clauses),
                Some(ElimNode::Empty) | None => {
                    return Match::Stuck { node, subst: bind(&context, &values), reason: StuckReason::Empty };
                }
            };
            let Some(index) = scrutinee_index(context.len(), tail.len()) else {
                return Match::Stuck { node, subst: bind(&context, &values), reason: StuckReason::Empty };
            };
            let value = whnf_with_fuel(env, &values[index], fuel);
            let Some((constructor, _, con_args)) = constructor_head(&value) else {
                let reason = StuckReason::NotConstructor(value);
                return Match::Stuck { node, subst: bind(&context, &values), reason };
            };
            let Some(clause) = clauses.get(&constructor) else {
                let reason = StuckReason::MissingClause(constructor);
                return Match::Stuck { node, subst: bind(&context, &values), reason };
            };
            if con_args.len() != clause.split.params.len() {
                let reason = StuckReason::NotConstructor(value);
                return Match::Stuck { node, subst: bind(&context, &values), reason };
            }
            trace!(?constructor, node = node.0, "matched constructor");
            values.splice(index..=index, con_args);
            context.truncate(index);
            context.extend(clause.split.params.iter().cloned());
            context.extend(clause.split.tail.iter().cloned());
            node = clause.child;
        }
    }
}

/// Exclusive, mutating view of a tree.
pub struct ElimTreeBuilder<'a> {
    tree: &'a mut ElimTree,
}

impl ElimTreeBuilder<'_> {
    fn slot(&mut self, node: NodeId) -> Option<&mut NodeSlot> {
        self.tree.nodes.get_mut(node.index())
    }

    pub fn make_leaf(&mut self, node: NodeId, expr: Rc<Expr>) {
        if let Some(slot) = self.slot(node) {
            slot.node = ElimNode::Leaf { expr, matched: None };
        }
    }

    pub fn make_branch(&mut self, node: NodeId, scrutinee: Rc<Binding>, tail: Vec<Rc<Binding>>) {
        if let Some(slot) = self.slot(node) {
            slot.node = ElimNode::Branch { scrutinee, tail, clauses: IndexMap::new() };
        }
    }

    pub fn make_empty(&mut self, node: NodeId) {
        if let Some(slot) = self.slot(node) {
            slot.node = ElimNode::Empty;
        }
    }

    /// Adds an edge with an Empty child, or returns the existing child for
    /// that constructor. `None` if `branch` is not a Branch or the arena has
    /// run out of node ids.
    pub fn add_clause(&mut self, branch: NodeId, split: Split) -> Option<NodeId> {
        let child = NodeId(u32::try_from(self.tree.nodes.len()).ok()?);
        let constructor = split.constructor;
        match &mut self.tree.nodes.get_mut(branch.index())?.node {
            ElimNode::Branch { clauses, .. } => {
                if let Some(existing) = clauses.get(&constructor) {
                    return Some(existing.child);
                }
                clauses.insert(constructor, ConstructorClause { split, child });
            }
            _ => return None,
        }
        self.tree.nodes.push(NodeSlot { node: ElimNode::Empty, parent: Some((branch, constructor)) });
        Some(child)
    }

    /// Rewrites every right-hand side.
    pub fn map_leaves(&mut self, mut f: impl FnMut(&Rc<Expr>) -> Rc<Expr>) {
        for slot in &mut self.tree.nodes {
            if let ElimNode::Leaf { expr, .. } = &mut slot.node {
                *expr = f(expr);
            }
        }
    }

    /// Records, for every leaf, which bindings of its context the
    /// right-hand side refers to.
    pub fn update_leaves_matched(&mut self) {
        let scopes = self.tree.scopes();
        for (slot, scope) in self.tree.nodes.iter_mut().zip(scopes) {
            if let (ElimNode::Leaf { expr, matched }, Some(scope)) = (&mut slot.node, scope) {
                let used = scope
                    .context
                    .iter()
                    .filter(|binding| expr.mentions(binding.id))
                    .map(|binding| binding.id)
                    .collect();
                *matched = Some(used);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Prelude;

    #[test]
    fn plus_reduces_on_its_first_argument() {
        let mut prelude = Prelude::new();
        let plus = prelude.define_plus();
        let tree = prelude.env.function(plus).unwrap().elim_tree.clone().unwrap();
        let args = [prelude.numeral(2), prelude.numeral(1)];
        let (node, subst) = tree.match_args(&prelude.env, &args).expect("constructor-headed arguments match");
        let body = tree.instantiate_leaf(node, &subst).unwrap();
        // suc (plus 1 1)
        let (con, _, con_args) = constructor_head(&body).expect("suc on top");
        assert_eq!(con, prelude.suc);
        assert_eq!(con_args.len(), 1);
    }

    #[test]
    fn variable_scrutinee_is_stuck() {
        let mut prelude = Prelude::new();
        let plus = prelude.define_plus();
        let tree = prelude.env.function(plus).unwrap().elim_tree.clone().unwrap();
        let x = Binding::new("x", prelude.nat_type());
        let args = [Expr::reference(&x), prelude.numeral(0)];
        match tree.match_until_stuck(&prelude.env, &args) {
            Match::Stuck { reason: StuckReason::NotConstructor(value), node, .. } => {
                assert_eq!(value, Expr::reference(&x));
                assert_eq!(node, tree.root());
            }
            other => panic!("expected to be stuck on x: {other:?}"),
        }
        assert!(tree.match_args(&prelude.env, &args).is_none());
    }

    #[test]
    fn matching_is_deterministic() {
        let mut prelude = Prelude::new();
        let plus = prelude.define_plus();
        let tree = prelude.env.function(plus).unwrap().elim_tree.clone().unwrap();
        let args = [prelude.numeral(3), prelude.numeral(2)];
        let first = tree.match_until_stuck(&prelude.env, &args);
        let second = tree.match_until_stuck(&prelude.env, &args);
        assert_eq!(first, second);
        assert!(matches!(first, Match::Leaf { .. }));
    }

    #[test]
    fn wrong_argument_count_is_stuck() {
        let mut prelude = Prelude::new();
        let plus = prelude.define_plus();
        let tree = prelude.env.function(plus).unwrap().elim_tree.clone().unwrap();
        let result = tree.match_until_stuck(&prelude.env, &[prelude.numeral(1)]);
        assert!(matches!(
            result,
            Match::Stuck { reason: StuckReason::Arity { expected: 2, actual: 1 }, .. }
        ));
    }

    #[test]
    fn builder_grows_edges_once() {
        let prelude = Prelude::new();
        let n = Binding::new("n", prelude.nat_type());
        let mut tree = ElimTree::new(vec![n.clone()]);
        let root = tree.root();
        let matched = crate::checker::matched_constructors(&prelude.env, prelude.nat, &[]).unwrap();
        let split = split_binding(&prelude.env, &n, &[], &matched[1]).unwrap();
        let mut builder = tree.builder();
        builder.make_branch(root, n.clone(), Vec::new());
        let child = builder.add_clause(root, split.clone()).unwrap();
        assert_eq!(builder.add_clause(root, split), Some(child));
        assert_eq!(tree.parent(child), Some((root, prelude.suc)));
        assert_eq!(tree.len(), 2);
        assert!(matches!(tree.node(child), Some(ElimNode::Empty)));
    }

    #[test]
    fn leaves_record_used_bindings() {
        let mut prelude = Prelude::new();
        let plus = prelude.define_plus();
        let tree = prelude.env.function(plus).unwrap().elim_tree.clone().unwrap();
        let scopes = tree.scopes();
        for leaf in tree.leaves() {
            let Some(ElimNode::Leaf { expr, matched }) = tree.node(leaf) else { unreachable!() };
            let scope = scopes[leaf.0 as usize].as_ref().expect("leaves are reachable");
            let matched = matched.as_ref().expect("computed when the body was set");
            assert!(!matched.is_empty());
            for id in matched {
                assert!(expr.mentions(*id));
                assert!(scope.context.iter().any(|binding| binding.id == *id));
            }
        }
    }
}
