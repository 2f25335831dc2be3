use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;

// =============================================================================
// Identifiers
// =============================================================================

/// Stable index of a definition in the [`Env`](crate::checker::Env) arena.
///
/// Global references inside expressions are these indices, which is also
/// what the binary form of a module stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DefId(pub u32);

impl DefId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl TryFrom<usize> for DefId {
    type Error = std::num::TryFromIntError;

    fn try_from(index: usize) -> Result<Self, Self::Error> {
        u32::try_from(index).map(DefId)
    }
}

/// Identity of a [`Binding`]. Names are only for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BindingId(pub u32);

static NEXT_BINDING: AtomicU32 = AtomicU32::new(0);

impl BindingId {
    pub fn fresh() -> Self {
        BindingId(NEXT_BINDING.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BindingKind {
    /// Function parameter, pattern variable or constructor argument.
    Local,
    /// Inference variable waiting for a solution from the equation solver.
    Inference,
}

/// A named, typed variable referenced by identity.
///
/// The type is expressed over the bindings introduced before this one, so it
/// never contains de Bruijn indices of its own.
#[derive(Clone, Serialize, Deserialize)]
pub struct Binding {
    pub id: BindingId,
    pub name: String,
    pub ty: Rc<Expr>,
    pub kind: BindingKind,
}

impl Binding {
    pub fn new(name: impl Into<String>, ty: Rc<Expr>) -> Rc<Self> {
        Rc::new(Binding {
            id: BindingId::fresh(),
            name: name.into(),
            ty,
            kind: BindingKind::Local,
        })
    }

    pub fn inference(name: impl Into<String>, ty: Rc<Expr>) -> Rc<Self> {
        Rc::new(Binding {
            id: BindingId::fresh(),
            name: name.into(),
            ty,
            kind: BindingKind::Inference,
        })
    }

    pub fn is_inference(&self) -> bool {
        self.kind == BindingKind::Inference
    }
}

impl PartialEq for Binding {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Binding {}

impl Hash for Binding {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.id.0)
    }
}

// =============================================================================
// Universe levels and sorts
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LevelVar(pub u32);

static NEXT_LEVEL_VAR: AtomicU32 = AtomicU32::new(0);

impl LevelVar {
    pub fn fresh() -> Self {
        LevelVar(NEXT_LEVEL_VAR.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for LevelVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lv{}", self.0)
    }
}

/// A universe level: `var + constant`, a plain constant, or infinity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Level {
    Finite { var: Option<LevelVar>, constant: i64 },
    Infinity,
}

impl Level {
    pub const ZERO: Level = Level::Finite { var: None, constant: 0 };

    pub const fn constant(constant: i64) -> Level {
        Level::Finite { var: None, constant }
    }

    pub const fn var(var: LevelVar) -> Level {
        Level::Finite { var: Some(var), constant: 0 }
    }

    pub fn succ(self) -> Level {
        match self {
            Level::Finite { var, constant } => Level::Finite { var, constant: constant + 1 },
            Level::Infinity => Level::Infinity,
        }
    }

    /// The value of a level without variables.
    pub fn as_constant(self) -> Option<i64> {
        match self {
            Level::Finite { var: None, constant } => Some(constant),
            _ => None,
        }
    }

    /// Maximum of two levels, when it is expressible as a single level.
    pub fn max(self, other: Level) -> Option<Level> {
        match (self, other) {
            (Level::Infinity, _) | (_, Level::Infinity) => Some(Level::Infinity),
            (
                Level::Finite { var: v1, constant: c1 },
                Level::Finite { var: v2, constant: c2 },
            ) => match (v1, v2) {
                (None, None) => Some(Level::constant(c1.max(c2))),
                (Some(_), None) if c1 >= c2 => Some(self),
                (None, Some(_)) if c2 >= c1 => Some(other),
                (Some(a), Some(b)) if a == b => Some(Level::Finite { var: Some(a), constant: c1.max(c2) }),
                _ => None,
            },
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Infinity => write!(f, "\\oo"),
            Level::Finite { var: None, constant } => write!(f, "{constant}"),
            Level::Finite { var: Some(v), constant: 0 } => write!(f, "{v}"),
            Level::Finite { var: Some(v), constant } => write!(f, "{v}{constant:+}"),
        }
    }
}

/// Sort of a universe: a predicative level and a homotopy level.
///
/// The homotopy level of `\Prop` is -1 and that of `\Set` is 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sort {
    pub plevel: Level,
    pub hlevel: Level,
}

impl Sort {
    pub const PROP: Sort = Sort { plevel: Level::ZERO, hlevel: Level::constant(-1) };
    pub const SET0: Sort = Sort { plevel: Level::ZERO, hlevel: Level::constant(0) };

    pub const fn new(plevel: Level, hlevel: Level) -> Sort {
        Sort { plevel, hlevel }
    }

    /// The sort of the universe of this sort. `\Prop` lives in `\Set0`.
    pub fn succ(self) -> Sort {
        if self.is_prop() {
            return Sort::SET0;
        }
        Sort { plevel: self.plevel.succ(), hlevel: self.hlevel.succ() }
    }

    pub fn is_prop(self) -> bool {
        matches!(self.hlevel.as_constant(), Some(h) if h < 0)
    }

    pub fn is_set(self) -> bool {
        matches!(self.hlevel.as_constant(), Some(h) if h <= 0)
    }
}

impl fmt::Display for Sort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_prop() {
            write!(f, "\\Prop")
        } else if self.hlevel.as_constant() == Some(0) {
            write!(f, "\\Set{}", self.plevel)
        } else {
            write!(f, "\\Type({}, {})", self.plevel, self.hlevel)
        }
    }
}

// =============================================================================
// Telescopes
// =============================================================================

/// One group of a telescope: several names sharing a type.
///
/// The type is valid at the depth where the group starts, for every name of
/// the group; the group extends the context by `names.len()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeleEntry {
    pub names: Vec<String>,
    pub ty: Rc<Expr>,
    pub explicit: bool,
}

impl TeleEntry {
    pub fn new<I, S>(names: I, ty: Rc<Expr>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        TeleEntry {
            names: names.into_iter().map(Into::into).collect(),
            ty,
            explicit: true,
        }
    }

    pub fn single(name: impl Into<String>, ty: Rc<Expr>) -> Self {
        TeleEntry { names: vec![name.into()], ty, explicit: true }
    }

    pub fn implicit(mut self) -> Self {
        self.explicit = false;
        self
    }
}

/// Number of names a telescope introduces.
pub fn telescope_len(tele: &[TeleEntry]) -> usize {
    tele.iter().map(|entry| entry.names.len()).sum()
}

// =============================================================================
// Expressions
// =============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("de Bruijn index {index} shifted by {by} drops below zero")]
pub struct NegativeIndex {
    pub index: usize,
    pub by: isize,
}

/// Core expressions. Children are shared through `Rc` and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Expr {
    /// de Bruijn index, 0 is the innermost binder.
    Var(usize),
    /// Named local binding.
    Ref(Rc<Binding>),
    /// Inference variable.
    Meta(Rc<Binding>),
    FunCall(DefId),
    DataCall(DefId),
    /// Constructor together with the parameters of its datatype. The
    /// constructor's own arguments are applied with `App`.
    ConCall(DefId, Vec<Rc<Expr>>),
    App(Rc<Expr>, Rc<Expr>),
    Lam(Vec<TeleEntry>, Rc<Expr>),
    Pi(Vec<TeleEntry>, Rc<Expr>),
    Sigma(Vec<TeleEntry>),
    /// Tuple with its Sigma type.
    Tuple(Vec<Rc<Expr>>, Rc<Expr>),
    /// Zero-based projection out of a tuple.
    Proj(Rc<Expr>, usize),
    Universe(Sort),
    /// Placeholder left behind by an earlier error.
    Error(Option<Rc<Expr>>),
}

impl Expr {
    pub fn var(index: usize) -> Rc<Self> {
        Rc::new(Expr::Var(index))
    }

    /// Reference to a binding; inference bindings become `Meta`.
    pub fn reference(binding: &Rc<Binding>) -> Rc<Self> {
        if binding.is_inference() {
            Rc::new(Expr::Meta(binding.clone()))
        } else {
            Rc::new(Expr::Ref(binding.clone()))
        }
    }

    pub fn fun(id: DefId) -> Rc<Self> {
        Rc::new(Expr::FunCall(id))
    }

    pub fn data(id: DefId) -> Rc<Self> {
        Rc::new(Expr::DataCall(id))
    }

    pub fn con(id: DefId, data_args: Vec<Rc<Expr>>) -> Rc<Self> {
        Rc::new(Expr::ConCall(id, data_args))
    }

    pub fn app(fun: Rc<Expr>, arg: Rc<Expr>) -> Rc<Self> {
        Rc::new(Expr::App(fun, arg))
    }

    pub fn apps(head: Rc<Expr>, args: impl IntoIterator<Item = Rc<Expr>>) -> Rc<Self> {
        args.into_iter().fold(head, Expr::app)
    }

    pub fn lam(tele: Vec<TeleEntry>, body: Rc<Expr>) -> Rc<Self> {
        Rc::new(Expr::Lam(tele, body))
    }

    pub fn pi(tele: Vec<TeleEntry>, codomain: Rc<Expr>) -> Rc<Self> {
        Rc::new(Expr::Pi(tele, codomain))
    }

    /// Non-dependent function type; `codomain` does not see the new binder.
    pub fn arrow(domain: Rc<Expr>, codomain: Rc<Expr>) -> Rc<Self> {
        Expr::pi(vec![TeleEntry::single("_", domain)], codomain.lift(0, 1))
    }

    pub fn sigma(tele: Vec<TeleEntry>) -> Rc<Self> {
        Rc::new(Expr::Sigma(tele))
    }

    pub fn tuple(fields: Vec<Rc<Expr>>, ty: Rc<Expr>) -> Rc<Self> {
        Rc::new(Expr::Tuple(fields, ty))
    }

    pub fn proj(tuple: Rc<Expr>, field: usize) -> Rc<Self> {
        Rc::new(Expr::Proj(tuple, field))
    }

    pub fn universe(sort: Sort) -> Rc<Self> {
        Rc::new(Expr::Universe(sort))
    }

    pub fn error() -> Rc<Self> {
        Rc::new(Expr::Error(None))
    }

    // -------------------------------------------------------------------------
    // Index arithmetic
    // -------------------------------------------------------------------------

    /// Shifts every index `>= from` by `by`.
    ///
    /// # Panics
    ///
    /// Panics if an index would become negative: that means a substitution
    /// was applied at the wrong depth.
    pub fn lift(&self, from: usize, by: isize) -> Rc<Expr> {
        match self.try_lift(from, by) {
            Ok(lifted) => lifted,
            Err(err) => panic!("{err}"),
        }
    }

    pub fn try_lift(&self, from: usize, by: isize) -> Result<Rc<Expr>, NegativeIndex> {
        if by == 0 {
            return Ok(Rc::new(self.clone()));
        }
        Ok(Rc::new(match self {
            Expr::Var(index) if *index < from => Expr::Var(*index),
            Expr::Var(index) => {
                let shifted = *index as isize + by;
                if shifted < 0 {
                    return Err(NegativeIndex { index: *index, by });
                }
                Expr::Var(shifted as usize)
            }
            Expr::Ref(_) | Expr::Meta(_) | Expr::FunCall(_) | Expr::DataCall(_) | Expr::Universe(_) => {
                self.clone()
            }
            Expr::ConCall(id, args) => {
                let mut lifted = Vec::with_capacity(args.len());
                for arg in args {
                    lifted.push(arg.try_lift(from, by)?);
                }
                Expr::ConCall(*id, lifted)
            }
            Expr::App(fun, arg) => Expr::App(fun.try_lift(from, by)?, arg.try_lift(from, by)?),
            Expr::Lam(tele, body) => {
                let (tele, inner) = lift_telescope(tele, from, by)?;
                Expr::Lam(tele, body.try_lift(inner, by)?)
            }
            Expr::Pi(tele, codomain) => {
                let (tele, inner) = lift_telescope(tele, from, by)?;
                Expr::Pi(tele, codomain.try_lift(inner, by)?)
            }
            Expr::Sigma(tele) => Expr::Sigma(lift_telescope(tele, from, by)?.0),
            Expr::Tuple(fields, ty) => {
                let mut lifted = Vec::with_capacity(fields.len());
                for field in fields {
                    lifted.push(field.try_lift(from, by)?);
                }
                Expr::Tuple(lifted, ty.try_lift(from, by)?)
            }
            Expr::Proj(tuple, field) => Expr::Proj(tuple.try_lift(from, by)?, *field),
            Expr::Error(inner) => Expr::Error(match inner {
                Some(inner) => Some(inner.try_lift(from, by)?),
                None => None,
            }),
        }))
    }

    /// Replaces index `d` by `r`, lowering every index above `d` by one.
    ///
    /// `r` is lifted by the number of binders crossed on the way down.
    pub fn substitute(&self, d: usize, r: &Rc<Expr>) -> Rc<Expr> {
        self.substitute_under(d, r, 0)
    }

    fn substitute_under(&self, d: usize, r: &Rc<Expr>, crossed: usize) -> Rc<Expr> {
        Rc::new(match self {
            Expr::Var(index) if *index < d => Expr::Var(*index),
            Expr::Var(index) if *index == d => return r.lift(0, crossed as isize),
            Expr::Var(index) => Expr::Var(index - 1),
            Expr::Ref(_) | Expr::Meta(_) | Expr::FunCall(_) | Expr::DataCall(_) | Expr::Universe(_) => {
                self.clone()
            }
            Expr::ConCall(id, args) => {
                let mut out = Vec::with_capacity(args.len());
                for arg in args {
                    out.push(arg.substitute_under(d, r, crossed));
                }
                Expr::ConCall(*id, out)
            }
            Expr::App(fun, arg) => Expr::App(
                fun.substitute_under(d, r, crossed),
                arg.substitute_under(d, r, crossed),
            ),
            Expr::Lam(tele, body) => {
                let (tele, k) = substitute_telescope(tele, d, r, crossed);
                Expr::Lam(tele, body.substitute_under(d + k, r, crossed + k))
            }
            Expr::Pi(tele, codomain) => {
                let (tele, k) = substitute_telescope(tele, d, r, crossed);
                Expr::Pi(tele, codomain.substitute_under(d + k, r, crossed + k))
            }
            Expr::Sigma(tele) => Expr::Sigma(substitute_telescope(tele, d, r, crossed).0),
            Expr::Tuple(fields, ty) => {
                let mut out = Vec::with_capacity(fields.len());
                for field in fields {
                    out.push(field.substitute_under(d, r, crossed));
                }
                Expr::Tuple(out, ty.substitute_under(d, r, crossed))
            }
            Expr::Proj(tuple, field) => Expr::Proj(tuple.substitute_under(d, r, crossed), *field),
            Expr::Error(inner) => {
                Expr::Error(inner.as_ref().map(|inner| inner.substitute_under(d, r, crossed)))
            }
        })
    }

    /// Instantiates the innermost `values.len()` indices, `values[0]` being
    /// the outermost of them. The values live outside those binders.
    pub fn instantiate(&self, values: &[Rc<Expr>]) -> Rc<Expr> {
        let mut result = Rc::new(self.clone());
        for (depth, value) in values.iter().enumerate().rev() {
            result = result.substitute(0, &value.lift(0, depth as isize));
        }
        result
    }

    /// Turns references to `bindings` into indices, the last binding being
    /// the innermost. Inverse of [`Expr::instantiate`] with references.
    pub fn abstract_over(&self, bindings: &[Rc<Binding>], depth: usize) -> Rc<Expr> {
        let count = bindings.len();
        self.map_expr(depth, &mut |expr, depth| match expr {
            Expr::Ref(binding) => bindings
                .iter()
                .position(|b| b.id == binding.id)
                .map(|position| Expr::var(depth + count - 1 - position)),
            _ => None,
        })
    }

    // -------------------------------------------------------------------------
    // Traversals
    // -------------------------------------------------------------------------

    /// Rebuilds the expression bottom-up, letting `f` replace any node.
    /// `f` also receives the number of binders crossed so far.
    pub(crate) fn map_expr(
        &self,
        depth: usize,
        f: &mut dyn FnMut(&Expr, usize) -> Option<Rc<Expr>>,
    ) -> Rc<Expr> {
        if let Some(replacement) = f(self, depth) {
            return replacement;
        }
        Rc::new(match self {
            Expr::Var(_) | Expr::Ref(_) | Expr::Meta(_) | Expr::FunCall(_) | Expr::DataCall(_) | Expr::Universe(_) => {
                self.clone()
            }
            Expr::ConCall(id, args) => {
                let mut out = Vec::with_capacity(args.len());
                for arg in args {
                    out.push(arg.map_expr(depth, f));
                }
                Expr::ConCall(*id, out)
            }
            Expr::App(fun, arg) => Expr::App(fun.map_expr(depth, f), arg.map_expr(depth, f)),
            Expr::Lam(tele, body) => {
                let (tele, inner) = map_telescope(tele, depth, f);
                Expr::Lam(tele, body.map_expr(inner, f))
            }
            Expr::Pi(tele, codomain) => {
                let (tele, inner) = map_telescope(tele, depth, f);
                Expr::Pi(tele, codomain.map_expr(inner, f))
            }
            Expr::Sigma(tele) => Expr::Sigma(map_telescope(tele, depth, f).0),
            Expr::Tuple(fields, ty) => {
                let mut out = Vec::with_capacity(fields.len());
                for field in fields {
                    out.push(field.map_expr(depth, f));
                }
                Expr::Tuple(out, ty.map_expr(depth, f))
            }
            Expr::Proj(tuple, field) => Expr::Proj(tuple.map_expr(depth, f), *field),
            Expr::Error(inner) => Expr::Error(match inner {
                Some(inner) => Some(inner.map_expr(depth, f)),
                None => None,
            }),
        })
    }

    /// Whether `pred` holds for some node; `pred` receives the binder depth.
    pub fn exists(&self, depth: usize, pred: &mut dyn FnMut(&Expr, usize) -> bool) -> bool {
        if pred(self, depth) {
            return true;
        }
        match self {
            Expr::Var(_) | Expr::Ref(_) | Expr::Meta(_) | Expr::FunCall(_) | Expr::DataCall(_) | Expr::Universe(_) => {
                false
            }
            Expr::ConCall(_, args) => {
                for arg in args {
                    if arg.exists(depth, pred) {
                        return true;
                    }
                }
                false
            }
            Expr::App(fun, arg) => fun.exists(depth, pred) || arg.exists(depth, pred),
            Expr::Lam(tele, body) | Expr::Pi(tele, body) => {
                let mut inner = depth;
                for entry in tele {
                    if entry.ty.exists(inner, pred) {
                        return true;
                    }
                    inner += entry.names.len();
                }
                body.exists(inner, pred)
            }
            Expr::Sigma(tele) => {
                let mut inner = depth;
                for entry in tele {
                    if entry.ty.exists(inner, pred) {
                        return true;
                    }
                    inner += entry.names.len();
                }
                false
            }
            Expr::Tuple(fields, ty) => {
                for field in fields {
                    if field.exists(depth, pred) {
                        return true;
                    }
                }
                ty.exists(depth, pred)
            }
            Expr::Proj(tuple, _) => tuple.exists(depth, pred),
            Expr::Error(inner) => match inner {
                Some(inner) => inner.exists(depth, pred),
                None => false,
            },
        }
    }

    /// Direct subexpressions, ignoring binder depth.
    pub fn children(&self) -> Vec<&Rc<Expr>> {
        match self {
            Expr::Var(_) | Expr::Ref(_) | Expr::Meta(_) | Expr::FunCall(_) | Expr::DataCall(_) | Expr::Universe(_) => {
                Vec::new()
            }
            Expr::ConCall(_, args) => args.iter().collect(),
            Expr::App(fun, arg) => vec![fun, arg],
            Expr::Lam(tele, body) | Expr::Pi(tele, body) => {
                tele.iter().map(|entry| &entry.ty).chain(std::iter::once(body)).collect()
            }
            Expr::Sigma(tele) => tele.iter().map(|entry| &entry.ty).collect(),
            Expr::Tuple(fields, ty) => fields.iter().chain(std::iter::once(ty)).collect(),
            Expr::Proj(tuple, _) => vec![tuple],
            Expr::Error(inner) => inner.iter().collect(),
        }
    }

    /// Whether the binding or inference variable `id` occurs.
    pub fn mentions(&self, id: BindingId) -> bool {
        self.exists(0, &mut |expr, _| match expr {
            Expr::Ref(binding) | Expr::Meta(binding) => binding.id == id,
            _ => false,
        })
    }

    /// Whether some index points outside the expression.
    pub fn has_free_vars(&self) -> bool {
        self.exists(0, &mut |expr, depth| matches!(expr, Expr::Var(index) if *index >= depth))
    }

    /// Inference variables occurring in the expression, in first-occurrence order.
    pub fn metas(&self) -> Vec<Rc<Binding>> {
        let mut found: Vec<Rc<Binding>> = Vec::new();
        self.exists(0, &mut |expr, _| {
            if let Expr::Meta(binding) = expr {
                if !found.iter().any(|b| b.id == binding.id) {
                    found.push(binding.clone());
                }
            }
            false
        });
        found
    }

    /// Collects every global definition referenced.
    pub fn collect_globals(&self, out: &mut BTreeSet<DefId>) {
        self.exists(0, &mut |expr, _| {
            match expr {
                Expr::FunCall(id) | Expr::DataCall(id) | Expr::ConCall(id, _) => {
                    out.insert(*id);
                }
                _ => {}
            }
            false
        });
    }

    /// Splits off the first name of a Lam, Pi or Sigma binder.
    ///
    /// Returns the type of that name and the remaining binder, which lives one
    /// index deeper. A Pi or Lam with a single name left returns its body.
    pub fn peel_binder(&self) -> Option<(Rc<Expr>, Rc<Expr>)> {
        let (tele, body) = match self {
            Expr::Lam(tele, body) | Expr::Pi(tele, body) => (tele, Some(body)),
            Expr::Sigma(tele) => (tele, None),
            _ => return None,
        };
        let first = tele.first()?;
        let mut rest = Vec::with_capacity(tele.len());
        if first.names.len() > 1 {
            rest.push(TeleEntry {
                names: first.names[1..].to_vec(),
                ty: first.ty.lift(0, 1),
                explicit: first.explicit,
            });
        }
        rest.extend(tele[1..].iter().cloned());
        let remainder = match (self, body) {
            (Expr::Lam(..), Some(body)) if rest.is_empty() => body.clone(),
            (Expr::Pi(..), Some(body)) if rest.is_empty() => body.clone(),
            (Expr::Lam(..), Some(body)) => Expr::lam(rest, body.clone()),
            (Expr::Pi(..), Some(body)) => Expr::pi(rest, body.clone()),
            _ => Expr::sigma(rest),
        };
        Some((first.ty.clone(), remainder))
    }
}

fn lift_telescope(
    tele: &[TeleEntry],
    mut from: usize,
    by: isize,
) -> Result<(Vec<TeleEntry>, usize), NegativeIndex> {
    let mut out = Vec::with_capacity(tele.len());
    for entry in tele {
        out.push(TeleEntry {
            names: entry.names.clone(),
            ty: entry.ty.try_lift(from, by)?,
            explicit: entry.explicit,
        });
        from += entry.names.len();
    }
    Ok((out, from))
}

fn substitute_telescope(
    tele: &[TeleEntry],
    d: usize,
    r: &Rc<Expr>,
    crossed: usize,
) -> (Vec<TeleEntry>, usize) {
    let mut out = Vec::with_capacity(tele.len());
    let mut k = 0;
    for entry in tele {
        out.push(TeleEntry {
            names: entry.names.clone(),
            ty: entry.ty.substitute_under(d + k, r, crossed + k),
            explicit: entry.explicit,
        });
        k += entry.names.len();
    }
    (out, k)
}

fn map_telescope(
    tele: &[TeleEntry],
    mut depth: usize,
    f: &mut dyn FnMut(&Expr, usize) -> Option<Rc<Expr>>,
) -> (Vec<TeleEntry>, usize) {
    let mut out = Vec::with_capacity(tele.len());
    for entry in tele {
        out.push(TeleEntry {
            names: entry.names.clone(),
            ty: entry.ty.map_expr(depth, f),
            explicit: entry.explicit,
        });
        depth += entry.names.len();
    }
    (out, depth)
}

// =============================================================================
// Spines
// =============================================================================

/// Splits an application into its head and its arguments, in order.
pub fn spine(expr: &Rc<Expr>) -> (Rc<Expr>, Vec<Rc<Expr>>) {
    let mut args = Vec::new();
    let mut head = expr.clone();
    while let Expr::App(fun, arg) = &*head {
        args.push(arg.clone());
        let next = fun.clone();
        head = next;
    }
    args.reverse();
    (head, args)
}

/// `con data_args args...` split into constructor, datatype arguments and
/// constructor arguments.
pub fn constructor_head(expr: &Rc<Expr>) -> Option<(DefId, Vec<Rc<Expr>>, Vec<Rc<Expr>>)> {
    let (head, args) = spine(expr);
    match &*head {
        Expr::ConCall(id, data_args) => Some((*id, data_args.clone(), args)),
        _ => None,
    }
}

/// `D args...` split into the datatype and its arguments.
pub fn data_call(expr: &Rc<Expr>) -> Option<(DefId, Vec<Rc<Expr>>)> {
    let (head, args) = spine(expr);
    match &*head {
        Expr::DataCall(id) => Some((*id, args)),
        _ => None,
    }
}

// =============================================================================
// Display
// =============================================================================

fn write_atom(f: &mut fmt::Formatter<'_>, expr: &Expr) -> fmt::Result {
    match expr {
        Expr::App(..) | Expr::Lam(..) | Expr::Pi(..) | Expr::Sigma(..) => write!(f, "({expr})"),
        _ => write!(f, "{expr}"),
    }
}

fn write_telescope(f: &mut fmt::Formatter<'_>, tele: &[TeleEntry]) -> fmt::Result {
    for (i, entry) in tele.iter().enumerate() {
        if i > 0 {
            write!(f, " ")?;
        }
        let (open, close) = if entry.explicit { ("(", ")") } else { ("{", "}") };
        write!(f, "{open}{} : {}{close}", entry.names.join(" "), entry.ty)?;
    }
    Ok(())
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Var(index) => write!(f, "#{index}"),
            Expr::Ref(binding) => write!(f, "{}", binding.name),
            Expr::Meta(binding) => write!(f, "?{}", binding.name),
            Expr::FunCall(id) => write!(f, "fun#{}", id.0),
            Expr::DataCall(id) => write!(f, "data#{}", id.0),
            Expr::ConCall(id, _) => write!(f, "con#{}", id.0),
            Expr::App(fun, arg) => {
                write!(f, "{fun} ")?;
                write_atom(f, arg)
            }
            Expr::Lam(tele, body) => {
                write!(f, "\\lam ")?;
                write_telescope(f, tele)?;
                write!(f, " => {body}")
            }
            Expr::Pi(tele, codomain) => {
                write!(f, "\\Pi ")?;
                write_telescope(f, tele)?;
                write!(f, " -> {codomain}")
            }
            Expr::Sigma(tele) => {
                write!(f, "\\Sigma ")?;
                write_telescope(f, tele)
            }
            Expr::Tuple(fields, _) => {
                write!(f, "(")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{field}")?;
                }
                write!(f, ")")
            }
            Expr::Proj(tuple, field) => {
                write_atom(f, tuple)?;
                write!(f, ".{}", field + 1)
            }
            Expr::Universe(sort) => write!(f, "{sort}"),
            Expr::Error(_) => write!(f, "{{?}}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set0() -> Rc<Expr> {
        Expr::universe(Sort::SET0)
    }

    #[test]
    fn lift_skips_indices_below_cutoff() {
        let e = Expr::app(Expr::var(0), Expr::var(2));
        assert_eq!(e.lift(1, 3), Expr::app(Expr::var(0), Expr::var(5)));
    }

    #[test]
    fn lift_crosses_telescope_by_name_count() {
        // \lam (x y : #0) => #2, the body refers to the first free variable
        let e = Expr::lam(vec![TeleEntry::new(["x", "y"], Expr::var(0))], Expr::var(2));
        let lifted = e.lift(0, 1);
        assert_eq!(
            lifted,
            Expr::lam(vec![TeleEntry::new(["x", "y"], Expr::var(1))], Expr::var(3))
        );
    }

    #[test]
    fn negative_lift_is_reported() {
        let err = Expr::var(1).try_lift(0, -2).unwrap_err();
        assert_eq!(err, NegativeIndex { index: 1, by: -2 });
    }

    #[test]
    #[should_panic(expected = "drops below zero")]
    fn negative_lift_panics() {
        Expr::var(0).lift(0, -1);
    }

    #[test]
    fn substitute_lifts_replacement_under_binders() {
        // (\lam (z : U) => #1)[0 := #5] = \lam (z : U) => #6
        let e = Expr::lam(vec![TeleEntry::single("z", set0())], Expr::var(1));
        let r = Expr::var(5);
        assert_eq!(
            e.substitute(0, &r),
            Expr::lam(vec![TeleEntry::single("z", set0())], Expr::var(6))
        );
    }

    #[test]
    fn substitute_lowers_indices_above_target() {
        let e = Expr::app(Expr::app(Expr::var(0), Expr::var(1)), Expr::var(2));
        let r = Expr::universe(Sort::PROP);
        assert_eq!(
            e.substitute(1, &r),
            Expr::app(Expr::app(Expr::var(0), r.clone()), Expr::var(1))
        );
    }

    #[test]
    fn instantiate_outermost_first() {
        let a = Expr::universe(Sort::PROP);
        let b = Expr::universe(Sort::SET0);
        // #1 is the outer value, #0 the inner one
        let e = Expr::app(Expr::var(1), Expr::var(0));
        assert_eq!(e.instantiate(&[a.clone(), b.clone()]), Expr::app(a, b));
    }

    #[test]
    fn abstract_over_inverts_instantiate() {
        let x = Binding::new("x", set0());
        let y = Binding::new("y", set0());
        let e = Expr::app(Expr::reference(&x), Expr::reference(&y));
        let abstracted = e.abstract_over(&[x.clone(), y.clone()], 0);
        assert_eq!(abstracted, Expr::app(Expr::var(1), Expr::var(0)));
        assert_eq!(
            abstracted.instantiate(&[Expr::reference(&x), Expr::reference(&y)]),
            e
        );
    }

    #[test]
    fn peel_binder_splits_grouped_names() {
        let pi = Expr::pi(vec![TeleEntry::new(["x", "y"], set0())], Expr::var(1));
        let (domain, rest) = pi.peel_binder().expect("pi has a binder");
        assert_eq!(domain, set0());
        assert_eq!(rest, Expr::pi(vec![TeleEntry::single("y", set0())], Expr::var(1)));
        let (_, body) = rest.peel_binder().expect("one name left");
        assert_eq!(body, Expr::var(1));
    }

    #[test]
    fn bindings_compare_by_identity() {
        let a = Binding::new("x", set0());
        let b = Binding::new("x", set0());
        assert_ne!(Expr::reference(&a), Expr::reference(&b));
        assert_eq!(Expr::reference(&a), Expr::reference(&a));
    }

    #[test]
    fn free_variables_respect_binders() {
        let closed = Expr::lam(vec![TeleEntry::single("x", set0())], Expr::var(0));
        let open = Expr::lam(vec![TeleEntry::single("x", set0())], Expr::var(1));
        assert!(!closed.has_free_vars());
        assert!(open.has_free_vars());
    }

    #[test]
    fn level_max_keeps_representable_cases() {
        let v = LevelVar(0);
        assert_eq!(Level::constant(1).max(Level::constant(3)), Some(Level::constant(3)));
        assert_eq!(
            Level::Finite { var: Some(v), constant: 2 }.max(Level::constant(1)),
            Some(Level::Finite { var: Some(v), constant: 2 })
        );
        assert_eq!(Level::var(v).max(Level::var(LevelVar(1))), None);
        assert_eq!(Level::var(v).max(Level::Infinity), Some(Level::Infinity));
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn def_ids_beyond_u32_are_refused() {
        assert_eq!(DefId::try_from(7usize), Ok(DefId(7)));
        assert!(DefId::try_from(u32::MAX as usize + 1).is_err());
    }

    #[test]
    fn prop_lives_in_set0() {
        assert_eq!(Sort::PROP.succ(), Sort::SET0);
        assert_eq!(Sort::SET0.succ(), Sort::new(Level::constant(1), Level::constant(1)));
    }

    #[test]
    fn display_is_compact() {
        let x = Binding::new("x", set0());
        let e = Expr::app(Expr::con(DefId(1), vec![]), Expr::reference(&x));
        assert_eq!(e.to_string(), "con#1 x");
        assert_eq!(Expr::universe(Sort::PROP).to_string(), "\\Prop");
    }
}
