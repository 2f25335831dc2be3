use crate::ast::{telescope_len, Binding, DefId, Expr, Sort, TeleEntry};
use crate::elim::ElimTree;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::rc::Rc;

// =============================================================================
// Totality
// =============================================================================

/// Termination status of a definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Totality {
    /// Not known to diverge: either certified by the termination checker or
    /// not yet checked.
    Total,
    /// Failed the termination check. Still has a type, but is only unfolded
    /// when the configuration allows it.
    Partial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DefinitionKind {
    Data,
    Constructor,
    Function,
}

impl fmt::Display for DefinitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DefinitionKind::Data => "datatype",
            DefinitionKind::Constructor => "constructor",
            DefinitionKind::Function => "function",
        };
        f.write_str(name)
    }
}

/// Truncation constructors of higher inductive types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Truncation {
    Prop,
    Set,
}

/// Pattern over the parameters of a datatype, restricting where a
/// constructor lives (`nil` only in `Vec A zero`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexPattern {
    Var(String),
    Con(DefId, Vec<IndexPattern>),
}

impl IndexPattern {
    pub fn var(name: impl Into<String>) -> Self {
        IndexPattern::Var(name.into())
    }

    /// Number of variables bound by the pattern.
    pub fn var_count(&self) -> usize {
        match self {
            IndexPattern::Var(_) => 1,
            IndexPattern::Con(_, args) => args.iter().map(IndexPattern::var_count).sum(),
        }
    }
}

// =============================================================================
// Definitions
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataDefinition {
    pub id: DefId,
    pub name: String,
    pub params: Vec<TeleEntry>,
    pub sort: Sort,
    pub constructors: Vec<DefId>,
}

impl DataDefinition {
    pub fn param_count(&self) -> usize {
        telescope_len(&self.params)
    }

    pub fn ty(&self) -> Rc<Expr> {
        let universe = Expr::universe(self.sort);
        if self.params.is_empty() {
            universe
        } else {
            Expr::pi(self.params.clone(), universe)
        }
    }
}

/// A constructor. Its argument telescope is expressed over the datatype's
/// parameters, or over the variables of `patterns` when it has them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstructorDefinition {
    pub id: DefId,
    pub name: String,
    pub data: DefId,
    pub patterns: Option<Vec<IndexPattern>>,
    pub args: Vec<TeleEntry>,
    pub truncation: Option<Truncation>,
}

impl ConstructorDefinition {
    pub fn arity(&self) -> usize {
        telescope_len(&self.args)
    }
}

/// Input to [`Env::add_constructor`](crate::checker::Env::add_constructor).
#[derive(Debug, Clone)]
pub struct ConstructorDecl {
    pub name: String,
    pub patterns: Option<Vec<IndexPattern>>,
    pub args: Vec<TeleEntry>,
    pub truncation: Option<Truncation>,
}

impl ConstructorDecl {
    pub fn new(name: impl Into<String>) -> Self {
        ConstructorDecl { name: name.into(), patterns: None, args: Vec::new(), truncation: None }
    }

    pub fn with_args(mut self, args: Vec<TeleEntry>) -> Self {
        self.args = args;
        self
    }

    pub fn with_patterns(mut self, patterns: Vec<IndexPattern>) -> Self {
        self.patterns = Some(patterns);
        self
    }

    pub fn truncating(mut self, truncation: Truncation) -> Self {
        self.truncation = Some(truncation);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub id: DefId,
    pub name: String,
    pub params: Vec<Rc<Binding>>,
    pub result_type: Rc<Expr>,
    pub elim_tree: Option<ElimTree>,
    pub totality: Totality,
}

impl FunctionDefinition {
    /// Pi type over the parameters.
    pub fn ty(&self) -> Rc<Expr> {
        if self.params.is_empty() {
            return self.result_type.clone();
        }
        let tele = self
            .params
            .iter()
            .enumerate()
            .map(|(i, param)| TeleEntry::single(param.name.clone(), param.ty.abstract_over(&self.params[..i], 0)))
            .collect();
        Expr::pi(tele, self.result_type.abstract_over(&self.params, 0))
    }

    pub fn is_abstract(&self) -> bool {
        self.elim_tree.is_none()
    }

    /// Definitions referenced by the type or the body.
    pub fn dependencies(&self) -> BTreeSet<DefId> {
        let mut deps = BTreeSet::new();
        for param in &self.params {
            param.ty.collect_globals(&mut deps);
        }
        self.result_type.collect_globals(&mut deps);
        if let Some(tree) = &self.elim_tree {
            tree.collect_globals(&mut deps);
        }
        deps.remove(&self.id);
        deps
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Definition {
    Data(DataDefinition),
    Constructor(ConstructorDefinition),
    Function(FunctionDefinition),
}

impl Definition {
    pub fn id(&self) -> DefId {
        match self {
            Definition::Data(data) => data.id,
            Definition::Constructor(con) => con.id,
            Definition::Function(function) => function.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Definition::Data(data) => &data.name,
            Definition::Constructor(con) => &con.name,
            Definition::Function(function) => &function.name,
        }
    }

    pub fn kind(&self) -> DefinitionKind {
        match self {
            Definition::Data(_) => DefinitionKind::Data,
            Definition::Constructor(_) => DefinitionKind::Constructor,
            Definition::Function(_) => DefinitionKind::Function,
        }
    }
}
