//! Elaboration kernel of a dependently typed language.
//!
//! Terms use de Bruijn indices under binders and named [`ast::Binding`]s for
//! contexts. Definitions by pattern matching are compiled into elimination
//! trees ([`elim`]), checked for coverage ([`coverage`]) and termination
//! ([`termination`]), with inference variables and universe levels solved by
//! [`equations`]. Everything is threaded through an explicit
//! [`checker::Env`].

pub mod ast;
pub mod checker;
pub mod clauses;
pub mod config;
pub mod coverage;
pub mod definition;
pub mod diagnostics;
pub mod driver;
pub mod elim;
pub mod equations;
pub mod levels;
pub mod serialize;
pub mod subst;
pub mod termination;

#[doc(hidden)]
pub mod test_support;

pub use ast::{Binding, BindingId, DefId, Expr, Level, LevelVar, Sort, TeleEntry};
pub use checker::{Context, Env};
pub use config::KernelConfig;
pub use diagnostics::{ElabError, ErrorReporter, ListErrorReporter};
