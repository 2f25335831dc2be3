//! Binary form of definitions and resolution of their references on load

use dtt_kernel::ast::{Binding, DefId, Expr, Sort, TeleEntry};
use dtt_kernel::checker::{normalize, Env};
use dtt_kernel::definition::{ConstructorDecl, Definition, DefinitionKind};
use dtt_kernel::serialize::{decode_definitions, encode_definitions, DeserializationError};
use dtt_kernel::test_support::Prelude;

fn encoded_plus() -> (Prelude, DefId, Vec<u8>) {
    let mut prelude = Prelude::new();
    let plus = prelude.define_plus();
    let bytes = encode_definitions(&prelude.env, &[plus]).expect("plus is defined");
    (prelude, plus, bytes)
}

// =============================================================================
// ROUND TRIP
// =============================================================================

#[test]
fn function_loads_on_top_of_its_dependencies() {
    let (source, plus, bytes) = encoded_plus();
    let mut target = Prelude::new();
    let decoded = decode_definitions(&bytes, &target.env).expect("dependencies are present");
    assert_eq!(decoded.len(), 1);
    for definition in decoded {
        assert_eq!(target.env.add_definition(definition).unwrap(), plus);
    }

    let sum = Expr::apps(Expr::fun(plus), [target.numeral(2), target.numeral(1)]);
    assert_eq!(normalize(&target.env, &sum), target.numeral(3));

    // bindings are not shared with the encoding environment
    let original = &source.env.function(plus).unwrap().params;
    let loaded = &target.env.function(plus).unwrap().params;
    assert_eq!(original.len(), loaded.len());
    assert!(original.iter().zip(loaded).all(|(a, b)| a.id != b.id && a.name == b.name));
}

#[test]
fn whole_environment_loads_into_empty_one() {
    let mut prelude = Prelude::new();
    let plus = prelude.define_plus();
    let ids: Vec<DefId> = (0..=plus.0).map(DefId).collect();
    let bytes = encode_definitions(&prelude.env, &ids).unwrap();

    let mut env = Env::new();
    for definition in decode_definitions(&bytes, &Env::new()).unwrap() {
        env.add_definition(definition).unwrap();
    }
    let sum = Expr::apps(Expr::fun(plus), [prelude.numeral(1), prelude.numeral(1)]);
    assert_eq!(normalize(&env, &sum), prelude.numeral(2));
    assert_eq!(env.get(prelude.cons).unwrap().name(), "cons");
}

#[test]
fn datatype_and_constructor_telescopes_get_fresh_bindings() {
    let a = Binding::new("A", Expr::universe(Sort::SET0));
    let mut env = Env::new();
    let fam = env
        .add_data("Fam", vec![TeleEntry::single("x", Expr::reference(&a))], Sort::SET0)
        .expect("fresh slot");
    let mk = env
        .add_constructor(fam, ConstructorDecl::new("mk").with_args(vec![TeleEntry::single("y", Expr::reference(&a))]))
        .expect("fresh slot");
    let bytes = encode_definitions(&env, &[fam, mk]).unwrap();
    let decoded = decode_definitions(&bytes, &Env::new()).unwrap();

    let (param, arg) = match &decoded[..] {
        [Definition::Data(data), Definition::Constructor(con)] => (data.params[0].ty.clone(), con.args[0].ty.clone()),
        other => panic!("expected Fam and mk, got {other:?}"),
    };
    match (&*param, &*arg) {
        (Expr::Ref(in_data), Expr::Ref(in_con)) => {
            assert_ne!(in_data.id, a.id);
            assert_eq!(in_data.name, "A");
            assert_eq!(in_data.id, in_con.id, "one decoded binding per encoded binding");
        }
        other => panic!("expected references, got {other:?}"),
    }
}

// =============================================================================
// RESOLUTION FAILURES
// =============================================================================

/// Negative test: the datatype of the parameters is missing
#[test]
fn missing_dependency() {
    let (_, _, bytes) = encoded_plus();
    let err = decode_definitions(&bytes, &Env::new()).unwrap_err();
    assert!(matches!(err, DeserializationError::MissingIndex(DefId(0))), "{err:?}");
}

/// Negative test: the index names a definition of another kind
#[test]
fn dependency_of_wrong_kind() {
    let (_, _, bytes) = encoded_plus();
    let mut env = Env::new();
    env.declare_function("impostor", Vec::new(), Expr::universe(Sort::SET0)).expect("fresh slot");
    let err = decode_definitions(&bytes, &env).unwrap_err();
    assert!(
        matches!(
            err,
            DeserializationError::WrongKind {
                id: DefId(0),
                expected: DefinitionKind::Data,
                actual: DefinitionKind::Function,
            }
        ),
        "{err:?}"
    );
}

/// Negative test: decoded definitions must be added in order
#[test]
fn out_of_order_definition_is_refused() {
    let (_, _, bytes) = encoded_plus();
    let target = Prelude::new();
    let decoded = decode_definitions(&bytes, &target.env).unwrap();
    let mut env = Env::new();
    let definition: Definition = decoded.into_iter().next().unwrap();
    assert!(env.add_definition(definition).is_err());
}
