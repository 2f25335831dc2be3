use crate::ast::{constructor_head, spine, Binding, DefId, Expr, Level, Sort, TeleEntry};
use crate::config::KernelConfig;
use crate::definition::{
    ConstructorDecl, ConstructorDefinition, DataDefinition, Definition, DefinitionKind, FunctionDefinition,
    IndexPattern, Totality, Truncation,
};
use crate::elim::{ElimTree, Match, StuckReason};
use crate::equations::{Cmp, Equations, SourceNode};
use std::rc::Rc;
use thiserror::Error;
use tracing::{trace, warn};

#[derive(Error, Debug, Clone)]
pub enum TypeError {
    #[error("type mismatch: expected {expected}, got {actual}")]
    Mismatch { expected: Rc<Expr>, actual: Rc<Expr> },
    #[error("cannot infer the type of {0}")]
    Uninferable(Rc<Expr>),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvError {
    #[error("unknown definition {0:?}")]
    UnknownDefinition(DefId),
    #[error("definition {id:?} is a {actual}, expected a {expected}")]
    WrongKind {
        id: DefId,
        expected: DefinitionKind,
        actual: DefinitionKind,
    },
    #[error("definition {0:?} already has a body")]
    AlreadyDefined(DefId),
    #[error("constructor {name} has {actual} index patterns but its datatype has {expected} parameters")]
    IndexPatternCount { name: String, expected: usize, actual: usize },
    #[error("definition {actual:?} restored out of order, next slot is {expected:?}")]
    OutOfOrder { expected: DefId, actual: DefId },
    #[error("no definition ids left after {0} definitions")]
    TooManyDefinitions(usize),
}

// =============================================================================
// Contexts
// =============================================================================

/// Types of the de Bruijn variables in scope, innermost last.
#[derive(Debug, Clone, Default)]
pub struct Context {
    types: Vec<Rc<Expr>>,
}

impl Context {
    pub fn new() -> Self {
        Context { types: Vec::new() }
    }

    pub fn push(&self, ty: Rc<Expr>) -> Self {
        let mut types = self.types.clone();
        types.push(ty);
        Context { types }
    }

    /// Pushes every name of a telescope.
    pub fn extend(&self, tele: &[TeleEntry]) -> Self {
        let mut types = self.types.clone();
        for entry in tele {
            for offset in 0..entry.names.len() {
                types.push(entry.ty.lift(0, offset as isize));
            }
        }
        Context { types }
    }

    /// Type of index `idx`, valid at the current depth.
    pub fn get(&self, idx: usize) -> Option<Rc<Expr>> {
        // 0 is the most recently pushed
        if idx < self.types.len() {
            Some(self.types[self.types.len() - 1 - idx].lift(0, idx as isize + 1))
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

// =============================================================================
// Environment
// =============================================================================

/// Append-only arena of definitions, threaded explicitly through every
/// kernel operation.
#[derive(Debug, Clone, Default)]
pub struct Env {
    definitions: Vec<Definition>,
    config: KernelConfig,
}

impl Env {
    pub fn new() -> Self {
        Env::default()
    }

    pub fn with_config(config: KernelConfig) -> Self {
        Env { definitions: Vec::new(), config }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Definition> {
        self.definitions.iter()
    }

    pub fn find(&self, name: &str) -> Option<DefId> {
        self.definitions.iter().find(|def| def.name() == name).map(Definition::id)
    }

    pub fn get(&self, id: DefId) -> Result<&Definition, EnvError> {
        self.definitions.get(id.index()).ok_or(EnvError::UnknownDefinition(id))
    }

    pub fn data(&self, id: DefId) -> Result<&DataDefinition, EnvError> {
        match self.get(id)? {
            Definition::Data(data) => Ok(data),
            other => Err(wrong_kind(id, DefinitionKind::Data, other)),
        }
    }

    pub fn constructor(&self, id: DefId) -> Result<&ConstructorDefinition, EnvError> {
        match self.get(id)? {
            Definition::Constructor(con) => Ok(con),
            other => Err(wrong_kind(id, DefinitionKind::Constructor, other)),
        }
    }

    pub fn function(&self, id: DefId) -> Result<&FunctionDefinition, EnvError> {
        match self.get(id)? {
            Definition::Function(function) => Ok(function),
            other => Err(wrong_kind(id, DefinitionKind::Function, other)),
        }
    }

    fn function_mut(&mut self, id: DefId) -> Result<&mut FunctionDefinition, EnvError> {
        match self.definitions.get_mut(id.index()) {
            Some(Definition::Function(function)) => Ok(function),
            Some(other) => Err(wrong_kind(id, DefinitionKind::Function, other)),
            None => Err(EnvError::UnknownDefinition(id)),
        }
    }

    fn next_id(&self) -> Result<DefId, EnvError> {
        let count = self.definitions.len();
        DefId::try_from(count).map_err(|_| EnvError::TooManyDefinitions(count))
    }

    pub fn add_data(
        &mut self,
        name: impl Into<String>,
        params: Vec<TeleEntry>,
        sort: Sort,
    ) -> Result<DefId, EnvError> {
        let id = self.next_id()?;
        self.definitions.push(Definition::Data(DataDefinition {
            id,
            name: name.into(),
            params,
            sort,
            constructors: Vec::new(),
        }));
        Ok(id)
    }

    pub fn add_constructor(&mut self, data: DefId, decl: ConstructorDecl) -> Result<DefId, EnvError> {
        let expected = self.data(data)?.param_count();
        if let Some(patterns) = &decl.patterns {
            if patterns.len() != expected {
                return Err(EnvError::IndexPatternCount {
                    name: decl.name,
                    expected,
                    actual: patterns.len(),
                });
            }
        }
        let id = self.next_id()?;
        if let Some(Definition::Data(data_def)) = self.definitions.get_mut(data.index()) {
            data_def.constructors.push(id);
        }
        self.definitions.push(Definition::Constructor(ConstructorDefinition {
            id,
            name: decl.name,
            data,
            patterns: decl.patterns,
            args: decl.args,
            truncation: decl.truncation,
        }));
        Ok(id)
    }

    /// Adds a function without a body, so that a recursive group can refer
    /// to its members before any of them is elaborated.
    pub fn declare_function(
        &mut self,
        name: impl Into<String>,
        params: Vec<Rc<Binding>>,
        result_type: Rc<Expr>,
    ) -> Result<DefId, EnvError> {
        let id = self.next_id()?;
        self.definitions.push(Definition::Function(FunctionDefinition {
            id,
            name: name.into(),
            params,
            result_type,
            elim_tree: None,
            totality: Totality::Total,
        }));
        Ok(id)
    }

    /// Sets the body of a declared function; a body is set at most once.
    pub fn set_elim_tree(&mut self, id: DefId, tree: ElimTree) -> Result<(), EnvError> {
        let function = self.function_mut(id)?;
        if function.elim_tree.is_some() {
            return Err(EnvError::AlreadyDefined(id));
        }
        function.elim_tree = Some(tree);
        Ok(())
    }

    pub fn set_totality(&mut self, id: DefId, totality: Totality) -> Result<(), EnvError> {
        self.function_mut(id)?.totality = totality;
        Ok(())
    }

    /// Appends a complete definition, e.g. one loaded from a cache. It must
    /// land in the slot its id names.
    pub fn add_definition(&mut self, definition: Definition) -> Result<DefId, EnvError> {
        let expected = self.next_id()?;
        if definition.id() != expected {
            return Err(EnvError::OutOfOrder { expected, actual: definition.id() });
        }
        self.definitions.push(definition);
        Ok(expected)
    }
}

fn wrong_kind(id: DefId, expected: DefinitionKind, actual: &Definition) -> EnvError {
    EnvError::WrongKind { id, expected, actual: actual.kind() }
}

// =============================================================================
// Reduction
// =============================================================================

/// Weak head normal form: beta, projections of tuples and unfolding of
/// functions through their elimination trees.
pub fn whnf(env: &Env, expr: &Rc<Expr>) -> Rc<Expr> {
    let mut fuel = env.config.normalization_fuel;
    whnf_with_fuel(env, expr, &mut fuel)
}

/// [`whnf`] drawing from a shared budget. On exhaustion the term reached so
/// far is returned, as if it were stuck.
pub fn whnf_with_fuel(env: &Env, expr: &Rc<Expr>, fuel: &mut usize) -> Rc<Expr> {
    let mut current = expr.clone();
    loop {
        if *fuel == 0 {
            warn!(expr = %current, "normalization fuel exhausted");
            return current;
        }
        match step(env, &current, fuel) {
            Some(next) => {
                *fuel = fuel.saturating_sub(1);
                current = next;
            }
            None => return current,
        }
    }
}

fn step(env: &Env, expr: &Rc<Expr>, fuel: &mut usize) -> Option<Rc<Expr>> {
    match &**expr {
        Expr::Lam(tele, body) | Expr::Pi(tele, body) if tele.is_empty() => Some(body.clone()),
        Expr::Proj(tuple, field) => match &*whnf_with_fuel(env, tuple, fuel) {
            Expr::Tuple(fields, _) => fields.get(*field).cloned(),
            _ => None,
        },
        Expr::App(..) | Expr::FunCall(_) => {
            let (head, args) = spine(expr);
            match &*head {
                Expr::Lam(tele, body) if tele.is_empty() => Some(Expr::apps(body.clone(), args)),
                Expr::Lam(..) => {
                    let (_, rest) = head.peel_binder()?;
                    let mut args = args.into_iter();
                    let first = args.next()?;
                    trace!("beta");
                    Some(Expr::apps(rest.substitute(0, &first), args))
                }
                Expr::FunCall(id) => unfold(env, *id, &args, fuel),
                Expr::Proj(..) => {
                    let reduced = step(env, &head, fuel)?;
                    Some(Expr::apps(reduced, args))
                }
                _ => None,
            }
        }
        _ => None,
    }
}

fn unfold(env: &Env, id: DefId, args: &[Rc<Expr>], fuel: &mut usize) -> Option<Rc<Expr>> {
    let function = env.function(id).ok()?;
    if function.totality == Totality::Partial && !env.config.unfold_partial {
        return None;
    }
    let tree = function.elim_tree.as_ref()?;
    let arity = function.params.len();
    if args.len() < arity {
        return None;
    }
    let (node, subst) = tree.match_args_with_fuel(env, &args[..arity], fuel)?;
    let body = tree.instantiate_leaf(node, &subst)?;
    trace!(function = %function.name, "unfolded");
    Some(Expr::apps(body, args[arity..].iter().cloned()))
}

/// Full normal form, used to show terms to people.
pub fn normalize(env: &Env, expr: &Rc<Expr>) -> Rc<Expr> {
    let mut fuel = env.config.normalization_fuel;
    normalize_with_fuel(env, expr, &mut fuel)
}

fn normalize_with_fuel(env: &Env, expr: &Rc<Expr>, fuel: &mut usize) -> Rc<Expr> {
    let head_normal = whnf_with_fuel(env, expr, fuel);
    match &*head_normal {
        Expr::Var(_) | Expr::Ref(_) | Expr::Meta(_) | Expr::FunCall(_) | Expr::DataCall(_) | Expr::Universe(_) => {
            head_normal.clone()
        }
        Expr::ConCall(id, params) => {
            let params = params.iter().map(|param| normalize_with_fuel(env, param, fuel)).collect();
            Expr::con(*id, params)
        }
        Expr::App(..) => {
            let (head, args) = spine(&head_normal);
            let head = normalize_with_fuel(env, &head, fuel);
            let args: Vec<_> = args.iter().map(|arg| normalize_with_fuel(env, arg, fuel)).collect();
            Expr::apps(head, args)
        }
        Expr::Lam(tele, body) => {
            let tele = normalize_telescope(env, tele, fuel);
            Expr::lam(tele, normalize_with_fuel(env, body, fuel))
        }
        Expr::Pi(tele, codomain) => {
            let tele = normalize_telescope(env, tele, fuel);
            Expr::pi(tele, normalize_with_fuel(env, codomain, fuel))
        }
        Expr::Sigma(tele) => Expr::sigma(normalize_telescope(env, tele, fuel)),
        Expr::Tuple(fields, ty) => {
            let fields = fields.iter().map(|field| normalize_with_fuel(env, field, fuel)).collect();
            Expr::tuple(fields, normalize_with_fuel(env, ty, fuel))
        }
        Expr::Proj(tuple, field) => Expr::proj(normalize_with_fuel(env, tuple, fuel), *field),
        Expr::Error(inner) => Rc::new(Expr::Error(inner.as_ref().map(|inner| normalize_with_fuel(env, inner, fuel)))),
    }
}

fn normalize_telescope(env: &Env, tele: &[TeleEntry], fuel: &mut usize) -> Vec<TeleEntry> {
    tele.iter()
        .map(|entry| TeleEntry {
            names: entry.names.clone(),
            ty: normalize_with_fuel(env, &entry.ty, fuel),
            explicit: entry.explicit,
        })
        .collect()
}

// =============================================================================
// Constructors of indexed families
// =============================================================================

/// A constructor that can produce a value of `data data_args`.
#[derive(Debug, Clone)]
pub struct MatchedConstructor {
    pub constructor: DefId,
    pub data: DefId,
    pub data_args: Vec<Rc<Expr>>,
    /// Values of the variables the constructor's argument telescope is
    /// expressed over: its index-pattern variables, or the datatype
    /// arguments when it has no patterns.
    pub context_values: Vec<Rc<Expr>>,
    pub truncation: Option<Truncation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PatternOutcome {
    Yes,
    No,
    Maybe,
}

fn match_index_pattern(env: &Env, pattern: &IndexPattern, arg: &Rc<Expr>, values: &mut Vec<Rc<Expr>>) -> PatternOutcome {
    match pattern {
        IndexPattern::Var(_) => {
            values.push(arg.clone());
            PatternOutcome::Yes
        }
        IndexPattern::Con(id, subpatterns) => {
            let value = whnf(env, arg);
            match constructor_head(&value) {
                Some((con, _, args)) if con == *id && args.len() == subpatterns.len() => {
                    let mut outcome = PatternOutcome::Yes;
                    for (subpattern, arg) in subpatterns.iter().zip(&args) {
                        match match_index_pattern(env, subpattern, arg, values) {
                            PatternOutcome::No => return PatternOutcome::No,
                            PatternOutcome::Maybe => outcome = PatternOutcome::Maybe,
                            PatternOutcome::Yes => {}
                        }
                    }
                    outcome
                }
                Some(_) => PatternOutcome::No,
                None => PatternOutcome::Maybe,
            }
        }
    }
}

/// Matches index patterns against datatype arguments. `Err(true)` means the
/// match is undecided, `Err(false)` that it fails.
fn match_index_patterns(env: &Env, patterns: &[IndexPattern], args: &[Rc<Expr>]) -> Result<Vec<Rc<Expr>>, bool> {
    if patterns.len() != args.len() {
        return Err(false);
    }
    let mut values = Vec::new();
    let mut stuck = false;
    for (pattern, arg) in patterns.iter().zip(args) {
        match match_index_pattern(env, pattern, arg, &mut values) {
            PatternOutcome::No => return Err(false),
            PatternOutcome::Maybe => stuck = true,
            PatternOutcome::Yes => {}
        }
    }
    if stuck {
        Err(true)
    } else {
        Ok(values)
    }
}

/// Constructors of `data` consistent with the arguments `args`, in
/// declaration order. `None` when some index pattern cannot be decided yet
/// because an argument is not constructor-headed, or when `data` is unknown.
pub fn matched_constructors(env: &Env, data: DefId, args: &[Rc<Expr>]) -> Option<Vec<MatchedConstructor>> {
    let data_def = env.data(data).ok()?;
    let mut matched = Vec::new();
    for &constructor in &data_def.constructors {
        let con_def = env.constructor(constructor).ok()?;
        let context_values = match &con_def.patterns {
            None => args.to_vec(),
            Some(patterns) => match match_index_patterns(env, patterns, args) {
                Ok(values) => values,
                Err(true) => return None,
                Err(false) => continue,
            },
        };
        matched.push(MatchedConstructor {
            constructor,
            data,
            data_args: args.to_vec(),
            context_values,
            truncation: con_def.truncation,
        });
    }
    Some(matched)
}

/// Type of `con data_args` as a function of the constructor's own arguments.
pub fn constructor_type(env: &Env, constructor: DefId, data_args: &[Rc<Expr>]) -> Option<Rc<Expr>> {
    let con_def = env.constructor(constructor).ok()?;
    if env.data(con_def.data).ok()?.param_count() != data_args.len() {
        return None;
    }
    let context_values = match &con_def.patterns {
        None => data_args.to_vec(),
        Some(patterns) => match_index_patterns(env, patterns, data_args).ok()?,
    };
    let shift = (context_values.len() + con_def.arity()) as isize;
    let result = Expr::apps(
        Expr::data(con_def.data),
        data_args.iter().map(|arg| arg.lift(0, shift)),
    );
    let open = if con_def.args.is_empty() { result } else { Expr::pi(con_def.args.clone(), result) };
    Some(open.instantiate(&context_values))
}

// =============================================================================
// Type synthesis
// =============================================================================

/// Synthesizes the type of a core expression. `None` when the expression
/// carries too little information (an error node, an ill-formed
/// application).
pub fn type_of(env: &Env, ctx: &Context, expr: &Rc<Expr>) -> Option<Rc<Expr>> {
    match &**expr {
        Expr::Var(index) => ctx.get(*index),
        Expr::Ref(binding) | Expr::Meta(binding) => Some(binding.ty.clone()),
        Expr::FunCall(id) => Some(env.function(*id).ok()?.ty()),
        Expr::DataCall(id) => Some(env.data(*id).ok()?.ty()),
        Expr::ConCall(id, data_args) => constructor_type(env, *id, data_args),
        Expr::App(fun, arg) => {
            let fun_ty = whnf(env, &type_of(env, ctx, fun)?);
            match &*fun_ty {
                Expr::Pi(..) => {
                    let (_, rest) = fun_ty.peel_binder()?;
                    Some(rest.substitute(0, arg))
                }
                _ => None,
            }
        }
        Expr::Lam(tele, body) => {
            let inner = ctx.extend(tele);
            Some(Expr::pi(tele.clone(), type_of(env, &inner, body)?))
        }
        Expr::Pi(tele, codomain) => {
            let mut inner = ctx.clone();
            let mut plevel = Level::ZERO;
            for entry in tele {
                plevel = plevel.max(sort_of(env, &inner, &entry.ty)?.plevel)?;
                inner = inner.extend(std::slice::from_ref(entry));
            }
            let codomain_sort = sort_of(env, &inner, codomain)?;
            let sort = if codomain_sort.is_prop() {
                Sort::PROP
            } else {
                Sort::new(plevel.max(codomain_sort.plevel)?, codomain_sort.hlevel)
            };
            Some(Expr::universe(sort))
        }
        Expr::Sigma(tele) => {
            let mut inner = ctx.clone();
            let mut sort = Sort::PROP;
            for entry in tele {
                let component = sort_of(env, &inner, &entry.ty)?;
                sort = Sort::new(sort.plevel.max(component.plevel)?, sort.hlevel.max(component.hlevel)?);
                inner = inner.extend(std::slice::from_ref(entry));
            }
            Some(Expr::universe(sort))
        }
        Expr::Tuple(_, ty) => Some(ty.clone()),
        Expr::Proj(tuple, field) => {
            let mut ty = whnf(env, &type_of(env, ctx, tuple)?);
            for previous in 0..*field {
                if !matches!(&*ty, Expr::Sigma(_)) {
                    return None;
                }
                let (_, rest) = ty.peel_binder()?;
                ty = rest.substitute(0, &Expr::proj(tuple.clone(), previous));
            }
            match &*ty {
                Expr::Sigma(_) => ty.peel_binder().map(|(domain, _)| domain),
                _ => None,
            }
        }
        Expr::Universe(sort) => Some(Expr::universe(sort.succ())),
        Expr::Error(ty) => ty.clone(),
    }
}

/// The sort of a type.
pub fn sort_of(env: &Env, ctx: &Context, ty: &Rc<Expr>) -> Option<Sort> {
    match &*whnf(env, &type_of(env, ctx, ty)?) {
        Expr::Universe(sort) => Some(*sort),
        _ => None,
    }
}

/// Checks `expr` against `expected`, recording deferred obligations.
pub fn check(
    env: &Env,
    equations: &mut Equations,
    ctx: &Context,
    expr: &Rc<Expr>,
    expected: &Rc<Expr>,
    source: SourceNode,
) -> Result<(), TypeError> {
    let actual = type_of(env, ctx, expr).ok_or_else(|| TypeError::Uninferable(expr.clone()))?;
    if compare(env, equations, Cmp::Le, &actual, expected, source) {
        Ok(())
    } else {
        Err(TypeError::Mismatch {
            expected: normalize(env, expected),
            actual: normalize(env, &actual),
        })
    }
}

// =============================================================================
// Comparison
// =============================================================================

/// Whether the reduction of a weak-head-normal term is blocked on an
/// unsolved inference variable.
pub fn stuck_on_meta(env: &Env, expr: &Rc<Expr>) -> bool {
    let (head, args) = spine(expr);
    match &*head {
        Expr::Meta(_) => true,
        Expr::FunCall(id) => {
            let Ok(function) = env.function(*id) else {
                return false;
            };
            let Some(tree) = &function.elim_tree else {
                return false;
            };
            let arity = function.params.len();
            if args.len() < arity {
                return false;
            }
            match tree.match_until_stuck(env, &args[..arity]) {
                Match::Stuck { reason: StuckReason::NotConstructor(value), .. } => stuck_on_meta(env, &value),
                _ => false,
            }
        }
        Expr::Proj(tuple, _) => stuck_on_meta(env, &whnf(env, tuple)),
        _ => false,
    }
}

/// Compares two expressions, `lhs cmp rhs`. Obligations that cannot be
/// decided yet go to `equations`.
pub fn compare(
    env: &Env,
    equations: &mut Equations,
    cmp: Cmp,
    lhs: &Rc<Expr>,
    rhs: &Rc<Expr>,
    source: SourceNode,
) -> bool {
    if lhs == rhs {
        return true;
    }
    let lhs = whnf(env, lhs);
    let rhs = whnf(env, rhs);
    trace!(%lhs, %rhs, ?cmp, "compare");
    compare_whnf(env, equations, cmp, &lhs, &rhs, source)
}

fn compare_whnf(
    env: &Env,
    equations: &mut Equations,
    cmp: Cmp,
    lhs: &Rc<Expr>,
    rhs: &Rc<Expr>,
    source: SourceNode,
) -> bool {
    if lhs == rhs {
        return true;
    }
    match (&**lhs, &**rhs) {
        (Expr::Error(_), _) | (_, Expr::Error(_)) => return true,
        (Expr::Meta(_), _) | (_, Expr::Meta(_)) => {
            return equations.add(env, lhs.clone(), rhs.clone(), cmp, source);
        }
        _ => {}
    }
    if stuck_on_meta(env, lhs) || stuck_on_meta(env, rhs) {
        equations.defer(lhs.clone(), rhs.clone(), cmp, source);
        return true;
    }

    match (&**lhs, &**rhs) {
        (Expr::Universe(s1), Expr::Universe(s2)) => equations.add_sort(*s1, *s2, cmp),
        (Expr::Pi(..), Expr::Pi(..)) => compare_binders(env, equations, Cmp::Eq, cmp, lhs, rhs, source),
        (Expr::Sigma(t1), Expr::Sigma(t2)) => {
            if t1.is_empty() || t2.is_empty() {
                return t1.is_empty() && t2.is_empty();
            }
            compare_binders(env, equations, cmp, cmp, lhs, rhs, source)
        }
        (Expr::Lam(..), Expr::Lam(..)) => match (lhs.peel_binder(), rhs.peel_binder()) {
            (Some((_, body1)), Some((_, body2))) => compare(env, equations, Cmp::Eq, &body1, &body2, source),
            _ => false,
        },
        (Expr::Lam(..), _) => compare_eta(env, equations, lhs, rhs, source),
        (_, Expr::Lam(..)) => compare_eta(env, equations, rhs, lhs, source),
        (Expr::Tuple(f1, _), Expr::Tuple(f2, _)) => {
            f1.len() == f2.len()
                && f1.iter().zip(f2).all(|(a, b)| compare(env, equations, Cmp::Eq, a, b, source))
        }
        (Expr::Tuple(fields, _), _) => compare_tuple_eta(env, equations, fields, rhs, source),
        (_, Expr::Tuple(fields, _)) => compare_tuple_eta(env, equations, fields, lhs, source),
        _ => compare_spines(env, equations, lhs, rhs, source),
    }
}

fn compare_binders(
    env: &Env,
    equations: &mut Equations,
    domain_cmp: Cmp,
    cmp: Cmp,
    lhs: &Rc<Expr>,
    rhs: &Rc<Expr>,
    source: SourceNode,
) -> bool {
    let pi = matches!(&**lhs, Expr::Pi(..));
    let mut lhs = lhs.clone();
    let mut rhs = rhs.clone();
    loop {
        // A remainder may only become a binder after reduction.
        if !(same_binder(pi, &lhs) && same_binder(pi, &rhs)) {
            return compare(env, equations, cmp, &lhs, &rhs, source);
        }
        match (lhs.peel_binder(), rhs.peel_binder()) {
            (Some((d1, rest1)), Some((d2, rest2))) => {
                if !compare(env, equations, domain_cmp, &d1, &d2, source) {
                    return false;
                }
                lhs = whnf(env, &rest1);
                rhs = whnf(env, &rest2);
            }
            _ => return compare(env, equations, cmp, &lhs, &rhs, source),
        }
    }
}

fn same_binder(pi: bool, expr: &Expr) -> bool {
    if pi {
        matches!(expr, Expr::Pi(..))
    } else {
        matches!(expr, Expr::Sigma(..))
    }
}

/// `\lam x => b` against `f`: compares `b` with `f x`.
fn compare_eta(env: &Env, equations: &mut Equations, lam: &Rc<Expr>, other: &Rc<Expr>, source: SourceNode) -> bool {
    match lam.peel_binder() {
        Some((_, body)) => {
            let applied = Expr::app(other.lift(0, 1), Expr::var(0));
            compare(env, equations, Cmp::Eq, &body, &applied, source)
        }
        None => false,
    }
}

fn compare_tuple_eta(
    env: &Env,
    equations: &mut Equations,
    fields: &[Rc<Expr>],
    other: &Rc<Expr>,
    source: SourceNode,
) -> bool {
    fields
        .iter()
        .enumerate()
        .all(|(i, field)| compare(env, equations, Cmp::Eq, field, &Expr::proj(other.clone(), i), source))
}

fn compare_spines(env: &Env, equations: &mut Equations, lhs: &Rc<Expr>, rhs: &Rc<Expr>, source: SourceNode) -> bool {
    let (h1, a1) = spine(lhs);
    let (h2, a2) = spine(rhs);
    if a1.len() != a2.len() {
        return false;
    }
    let heads_agree = match (&*h1, &*h2) {
        (Expr::Var(i), Expr::Var(j)) => i == j,
        (Expr::Ref(a), Expr::Ref(b)) => a.id == b.id,
        (Expr::FunCall(f), Expr::FunCall(g)) | (Expr::DataCall(f), Expr::DataCall(g)) => f == g,
        (Expr::ConCall(c, p1), Expr::ConCall(d, p2)) => {
            c == d
                && p1.len() == p2.len()
                && p1.iter().zip(p2).all(|(a, b)| compare(env, equations, Cmp::Eq, a, b, source))
        }
        (Expr::Proj(t1, i), Expr::Proj(t2, j)) => i == j && compare(env, equations, Cmp::Eq, t1, t2, source),
        _ => false,
    };
    heads_agree && a1.iter().zip(&a2).all(|(a, b)| compare(env, equations, Cmp::Eq, a, b, source))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Binding, TeleEntry};

    fn set0() -> Rc<Expr> {
        Expr::universe(Sort::SET0)
    }

    #[test]
    fn context_lifts_types_to_the_use_site() {
        // (A : Set0) (x : A): the type of x seen from inside is #1
        let ctx = Context::new().push(set0()).push(Expr::var(0));
        assert_eq!(ctx.get(0), Some(Expr::var(1)));
        assert_eq!(ctx.get(1), Some(set0()));
        assert_eq!(ctx.get(2), None);
    }

    #[test]
    fn beta_reduces_grouped_lambda() {
        let env = Env::new();
        // (\lam (x y : Set0) => x) Prop Set0
        let lam = Expr::lam(vec![TeleEntry::new(["x", "y"], set0())], Expr::var(1));
        let prop = Expr::universe(Sort::PROP);
        let applied = Expr::apps(lam, [prop.clone(), set0()]);
        assert_eq!(whnf(&env, &applied), prop);
    }

    #[test]
    fn projection_of_tuple_reduces() {
        let env = Env::new();
        let sigma = Expr::sigma(vec![TeleEntry::new(["a", "b"], set0())]);
        let tuple = Expr::tuple(vec![Expr::universe(Sort::PROP), set0()], sigma);
        assert_eq!(whnf(&env, &Expr::proj(tuple, 1)), set0());
    }

    #[test]
    fn universe_types_step_up() {
        let env = Env::new();
        let ty = type_of(&env, &Context::new(), &set0()).expect("universes have types");
        assert_eq!(ty, Expr::universe(Sort::new(Level::constant(1), Level::constant(1))));
        let prop = Expr::universe(Sort::PROP);
        assert_eq!(type_of(&env, &Context::new(), &prop), Some(set0()));
    }

    #[test]
    fn pi_into_prop_is_prop() {
        let env = Env::new();
        let p = Binding::new("P", Expr::universe(Sort::PROP));
        let pi = Expr::pi(vec![TeleEntry::single("A", set0())], Expr::reference(&p));
        let sort = sort_of(&env, &Context::new(), &pi).expect("pi has a sort");
        assert!(sort.is_prop());
    }

    #[test]
    fn lambda_type_is_pi_over_body_type() {
        let env = Env::new();
        let lam = Expr::lam(vec![TeleEntry::single("x", set0())], Expr::var(0));
        let ty = type_of(&env, &Context::new(), &lam).expect("identity has a type");
        assert_eq!(ty, Expr::pi(vec![TeleEntry::single("x", set0())], set0()));
    }

    #[test]
    fn codomain_reducing_to_pi_is_compared_under_the_binder() {
        use crate::clauses::Clause;
        use crate::diagnostics::ListErrorReporter;
        use crate::driver::elaborate_function;
        use crate::test_support::Prelude;

        let mut prelude = Prelude::new();
        let nat = prelude.nat_type();
        let arrow = Expr::pi(vec![TeleEntry::single("y", nat.clone())], nat.clone());
        // T = Nat -> Nat
        let alias = prelude.env.declare_function("T", Vec::new(), set0()).expect("fresh slot");
        let mut reporter = ListErrorReporter::new();
        let clauses = [Clause::new(Vec::new(), arrow.clone())];
        assert!(elaborate_function(&mut prelude.env, alias, &clauses, &mut reporter), "{:?}", reporter.messages());

        let over_nat = |codomain: Rc<Expr>| Expr::pi(vec![TeleEntry::single("x", nat.clone())], codomain);
        let via_alias = over_nat(Expr::fun(alias));
        let spelled_out = over_nat(arrow);
        let mut equations = Equations::new();
        assert!(compare(&prelude.env, &mut equations, Cmp::Eq, &via_alias, &spelled_out, SourceNode(0)));
        assert!(compare(&prelude.env, &mut equations, Cmp::Le, &spelled_out, &via_alias, SourceNode(0)));
        assert!(!compare(&prelude.env, &mut equations, Cmp::Eq, &via_alias, &over_nat(nat.clone()), SourceNode(0)));
        assert!(equations.deferred().is_empty());
    }

    #[test]
    fn unknown_definition_is_reported() {
        let env = Env::new();
        assert_eq!(env.get(DefId(3)).unwrap_err(), EnvError::UnknownDefinition(DefId(3)));
    }
}
