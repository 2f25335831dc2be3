//! A small environment of datatypes shared by the tests.

use crate::ast::{Binding, DefId, Expr, Sort, TeleEntry};
use crate::checker::{Env, EnvError};
use crate::clauses::{Clause, Pattern};
use crate::definition::{ConstructorDecl, IndexPattern, Truncation};
use crate::diagnostics::ListErrorReporter;
use crate::driver::{elaborate_function, finalize_group};
use std::rc::Rc;

/// Definitions, in order:
///
/// ```text
/// data Nat | zero | suc (n : Nat)
/// data Vec (A : \Set0) (n : Nat)
///   | A, zero => nil
///   | A, suc n => cons (x : A) (xs : Vec A n)
/// data Empty
/// data TruncP (A : \Set0) : \Prop | inP (a : A) | truncP (x y : TruncP A)   -- Prop truncation
/// ```
pub struct Prelude {
    pub env: Env,
    pub nat: DefId,
    pub zero: DefId,
    pub suc: DefId,
    pub vec: DefId,
    pub nil: DefId,
    pub cons: DefId,
    pub empty: DefId,
    pub trunc: DefId,
    pub in_p: DefId,
    pub trunc_p: DefId,
}

impl Default for Prelude {
    fn default() -> Self {
        Self::new()
    }
}

impl Prelude {
    pub fn new() -> Self {
        Self::with_env(Env::new())
    }

    /// The prelude on top of a configured environment.
    pub fn with_env(mut env: Env) -> Self {
        let set0 = Expr::universe(Sort::SET0);

        let nat = fixture(env.add_data("Nat", Vec::new(), Sort::SET0));
        let nat_type = Expr::data(nat);
        let zero = add(&mut env, nat, ConstructorDecl::new("zero"));
        let suc = add(&mut env, nat, ConstructorDecl::new("suc").with_args(vec![TeleEntry::single("n", nat_type.clone())]));

        let vec = fixture(env.add_data(
            "Vec",
            vec![TeleEntry::single("A", set0.clone()), TeleEntry::single("n", nat_type)],
            Sort::SET0,
        ));
        let nil = add(
            &mut env,
            vec,
            ConstructorDecl::new("nil").with_patterns(vec![IndexPattern::var("A"), IndexPattern::Con(zero, Vec::new())]),
        );
        let cons = add(
            &mut env,
            vec,
            ConstructorDecl::new("cons")
                .with_patterns(vec![IndexPattern::var("A"), IndexPattern::Con(suc, vec![IndexPattern::var("n")])])
                .with_args(vec![
                    // over (A, n)
                    TeleEntry::single("x", Expr::var(1)),
                    TeleEntry::single("xs", Expr::apps(Expr::data(vec), [Expr::var(2), Expr::var(1)])),
                ]),
        );

        let empty = fixture(env.add_data("Empty", Vec::new(), Sort::SET0));

        let trunc = fixture(env.add_data("TruncP", vec![TeleEntry::single("A", set0)], Sort::PROP));
        let in_p = add(&mut env, trunc, ConstructorDecl::new("inP").with_args(vec![TeleEntry::single("a", Expr::var(0))]));
        let trunc_p = add(
            &mut env,
            trunc,
            ConstructorDecl::new("truncP")
                .with_args(vec![TeleEntry::new(["x", "y"], Expr::app(Expr::data(trunc), Expr::var(0)))])
                .truncating(Truncation::Prop),
        );

        Prelude { env, nat, zero, suc, vec, nil, cons, empty, trunc, in_p, trunc_p }
    }

    pub fn nat_type(&self) -> Rc<Expr> {
        Expr::data(self.nat)
    }

    pub fn vec_type(&self, elem: Rc<Expr>, len: Rc<Expr>) -> Rc<Expr> {
        Expr::apps(Expr::data(self.vec), [elem, len])
    }

    pub fn trunc_type(&self, ty: Rc<Expr>) -> Rc<Expr> {
        Expr::app(Expr::data(self.trunc), ty)
    }

    pub fn zero(&self) -> Rc<Expr> {
        Expr::con(self.zero, Vec::new())
    }

    pub fn suc(&self, n: Rc<Expr>) -> Rc<Expr> {
        Expr::app(Expr::con(self.suc, Vec::new()), n)
    }

    pub fn numeral(&self, k: usize) -> Rc<Expr> {
        (0..k).fold(self.zero(), |acc, _| self.suc(acc))
    }

    pub fn nat_binding(&self, name: &str) -> Rc<Binding> {
        Binding::new(name, self.nat_type())
    }

    /// Declares and elaborates a Nat-valued function of Nat parameters.
    /// Returns the id and the errors reported.
    pub fn define_nat_function(
        &mut self,
        name: &str,
        params: &[&str],
        clauses: impl FnOnce(&Self, DefId) -> Vec<Clause>,
    ) -> (DefId, ListErrorReporter) {
        let params = params.iter().map(|param| self.nat_binding(param)).collect();
        let result_type = self.nat_type();
        let id = fixture(self.env.declare_function(name, params, result_type));
        let clauses = clauses(self, id);
        let mut reporter = ListErrorReporter::new();
        elaborate_function(&mut self.env, id, &clauses, &mut reporter);
        finalize_group(&mut self.env, &[id], &mut reporter);
        (id, reporter)
    }

    /// `plus zero n = n; plus (suc k) n = suc (plus k n)`.
    pub fn define_plus(&mut self) -> DefId {
        let (id, reporter) = self.define_nat_function("plus", &["m", "n"], |prelude, plus| {
            let n = prelude.nat_binding("n");
            let k = prelude.nat_binding("k");
            let n2 = prelude.nat_binding("n");
            let recursive = Expr::apps(Expr::fun(plus), [Expr::reference(&k), Expr::reference(&n2)]);
            vec![
                Clause::new(vec![Pattern::con(prelude.zero, Vec::new()), Pattern::Binding(n.clone())], Expr::reference(&n)),
                Clause::new(
                    vec![Pattern::con(prelude.suc, vec![Pattern::Binding(k)]), Pattern::Binding(n2)],
                    prelude.suc(recursive),
                ),
            ]
        });
        assert!(reporter.is_empty(), "plus must elaborate cleanly: {:?}", reporter.messages());
        id
    }
}

fn add(env: &mut Env, data: DefId, decl: ConstructorDecl) -> DefId {
    fixture(env.add_constructor(data, decl))
}

fn fixture(result: Result<DefId, EnvError>) -> DefId {
    match result {
        Ok(id) => id,
        Err(error) => panic!("prelude definition rejected: {error}"),
    }
}
