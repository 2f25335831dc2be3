//! Binary form of finalized definitions.
//!
//! Global references are stored as [`DefId`] indices. On decoding, every
//! index is resolved against the definitions of the payload itself and then
//! against a [`CallTargetProvider`], and must name a definition of the kind
//! the reference expects. Local bindings get fresh identities.

use crate::ast::{Binding, BindingId, DefId, Expr, TeleEntry};
use crate::checker::{Env, EnvError};
use crate::definition::{Definition, DefinitionKind, IndexPattern};
use crate::elim::{ElimNode, ElimTree, Split};
use crate::subst::ExprSubstitution;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::rc::Rc;
use thiserror::Error;
use tracing::{debug, instrument};

pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum DeserializationError {
    #[error("malformed module data: {0}")]
    Malformed(#[from] bincode::Error),
    #[error("module format version {found} is not supported (expected {expected})")]
    Version { expected: u32, found: u32 },
    #[error("reference to missing definition {0:?}")]
    MissingIndex(DefId),
    #[error("definition {id:?} is a {actual}, expected a {expected}")]
    WrongKind { id: DefId, expected: DefinitionKind, actual: DefinitionKind },
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error(transparent)]
    Env(#[from] EnvError),
    #[error("cannot encode module: {0}")]
    Bincode(#[from] bincode::Error),
}

/// Lookup of already loaded definitions by index.
pub trait CallTargetProvider {
    fn call_target(&self, id: DefId) -> Option<&Definition>;

    fn call_target_of_kind(&self, id: DefId, kind: DefinitionKind) -> Result<&Definition, DeserializationError> {
        let definition = self.call_target(id).ok_or(DeserializationError::MissingIndex(id))?;
        if definition.kind() != kind {
            return Err(DeserializationError::WrongKind { id, expected: kind, actual: definition.kind() });
        }
        Ok(definition)
    }
}

impl CallTargetProvider for Env {
    fn call_target(&self, id: DefId) -> Option<&Definition> {
        self.get(id).ok()
    }
}

#[derive(Serialize, Deserialize)]
struct ModulePayload {
    version: u32,
    definitions: Vec<Definition>,
}

pub fn encode_definitions(env: &Env, ids: &[DefId]) -> Result<Vec<u8>, EncodeError> {
    let definitions = ids.iter().map(|id| env.get(*id).cloned()).collect::<Result<Vec<_>, _>>()?;
    let payload = ModulePayload { version: FORMAT_VERSION, definitions };
    Ok(bincode::serialize(&payload)?)
}

/// Decodes definitions written by [`encode_definitions`]. The caller adds
/// them to its environment in order.
#[instrument(level = "debug", skip_all, fields(bytes = bytes.len()))]
pub fn decode_definitions(
    bytes: &[u8],
    provider: &dyn CallTargetProvider,
) -> Result<Vec<Definition>, DeserializationError> {
    let version: u32 = bincode::deserialize(bytes)?;
    if version != FORMAT_VERSION {
        return Err(DeserializationError::Version { expected: FORMAT_VERSION, found: version });
    }
    let payload: ModulePayload = bincode::deserialize(bytes)?;

    let local: HashMap<DefId, DefinitionKind> =
        payload.definitions.iter().map(|def| (def.id(), def.kind())).collect();
    let resolver = Resolver { local: &local, provider };
    for definition in &payload.definitions {
        resolver.definition(definition)?;
    }

    let mut relinker = Relinker::default();
    let definitions: Vec<Definition> = payload.definitions.iter().map(|def| relinker.definition(def)).collect();
    debug!(count = definitions.len(), "decoded definitions");
    Ok(definitions)
}

// =============================================================================
// Reference checking
// =============================================================================

struct Resolver<'a> {
    local: &'a HashMap<DefId, DefinitionKind>,
    provider: &'a dyn CallTargetProvider,
}

impl Resolver<'_> {
    fn expect(&self, id: DefId, kind: DefinitionKind) -> Result<(), DeserializationError> {
        match self.local.get(&id) {
            Some(&actual) if actual == kind => Ok(()),
            Some(&actual) => Err(DeserializationError::WrongKind { id, expected: kind, actual }),
            None => self.provider.call_target_of_kind(id, kind).map(|_| ()),
        }
    }

    fn expr(&self, expr: &Expr) -> Result<(), DeserializationError> {
        let mut result = Ok(());
        expr.exists(0, &mut |node, _| {
            let checked = match node {
                Expr::FunCall(id) => self.expect(*id, DefinitionKind::Function),
                Expr::DataCall(id) => self.expect(*id, DefinitionKind::Data),
                Expr::ConCall(id, _) => self.expect(*id, DefinitionKind::Constructor),
                Expr::Ref(binding) | Expr::Meta(binding) => self.expr(&binding.ty),
                _ => Ok(()),
            };
            match checked {
                Ok(()) => false,
                Err(error) => {
                    result = Err(error);
                    true
                }
            }
        });
        result
    }

    fn telescope(&self, tele: &[TeleEntry]) -> Result<(), DeserializationError> {
        tele.iter().try_for_each(|entry| self.expr(&entry.ty))
    }

    fn index_pattern(&self, pattern: &IndexPattern) -> Result<(), DeserializationError> {
        match pattern {
            IndexPattern::Var(_) => Ok(()),
            IndexPattern::Con(id, args) => {
                self.expect(*id, DefinitionKind::Constructor)?;
                args.iter().try_for_each(|arg| self.index_pattern(arg))
            }
        }
    }

    fn definition(&self, definition: &Definition) -> Result<(), DeserializationError> {
        match definition {
            Definition::Data(data) => {
                self.telescope(&data.params)?;
                data.constructors.iter().try_for_each(|id| self.expect(*id, DefinitionKind::Constructor))
            }
            Definition::Constructor(con) => {
                self.expect(con.data, DefinitionKind::Data)?;
                if let Some(patterns) = &con.patterns {
                    patterns.iter().try_for_each(|pattern| self.index_pattern(pattern))?;
                }
                self.telescope(&con.args)
            }
            Definition::Function(function) => {
                for param in &function.params {
                    self.expr(&param.ty)?;
                }
                self.expr(&function.result_type)?;
                match &function.elim_tree {
                    Some(tree) => self.tree(tree),
                    None => Ok(()),
                }
            }
        }
    }

    fn tree(&self, tree: &ElimTree) -> Result<(), DeserializationError> {
        for slot in &tree.nodes {
            match &slot.node {
                ElimNode::Leaf { expr, .. } => self.expr(expr)?,
                ElimNode::Branch { clauses, .. } => {
                    for (constructor, clause) in clauses {
                        self.expect(*constructor, DefinitionKind::Constructor)?;
                        for (_, value) in clause.split.subst.iter() {
                            self.expr(value)?;
                        }
                    }
                }
                ElimNode::Empty => {}
            }
        }
        Ok(())
    }
}

// =============================================================================
// Fresh bindings
// =============================================================================

/// Replaces every decoded binding by a fresh one, consistently.
#[derive(Default)]
struct Relinker {
    bindings: HashMap<BindingId, Rc<Binding>>,
}

impl Relinker {
    fn binding(&mut self, binding: &Rc<Binding>) -> Rc<Binding> {
        if let Some(fresh) = self.bindings.get(&binding.id) {
            return fresh.clone();
        }
        let ty = self.expr(&binding.ty);
        let fresh = Rc::new(Binding { id: BindingId::fresh(), name: binding.name.clone(), ty, kind: binding.kind });
        self.bindings.insert(binding.id, fresh.clone());
        fresh
    }

    fn bindings(&mut self, bindings: &[Rc<Binding>]) -> Vec<Rc<Binding>> {
        bindings.iter().map(|binding| self.binding(binding)).collect()
    }

    fn expr(&mut self, expr: &Expr) -> Rc<Expr> {
        expr.map_expr(0, &mut |node, _| match node {
            Expr::Ref(binding) => Some(Rc::new(Expr::Ref(self.binding(binding)))),
            Expr::Meta(binding) => Some(Rc::new(Expr::Meta(self.binding(binding)))),
            _ => None,
        })
    }

    fn telescope(&mut self, tele: &[TeleEntry]) -> Vec<TeleEntry> {
        tele.iter()
            .map(|entry| TeleEntry { names: entry.names.clone(), ty: self.expr(&entry.ty), explicit: entry.explicit })
            .collect()
    }

    fn subst(&mut self, subst: &ExprSubstitution) -> ExprSubstitution {
        let mut out = ExprSubstitution::new();
        for (binding, value) in subst.iter() {
            let binding = self.binding(binding);
            let value = self.expr(value);
            out.insert(&binding, value);
        }
        out
    }

    fn tree(&mut self, tree: &ElimTree) -> ElimTree {
        let mut out = tree.clone();
        out.context = self.bindings(&tree.context);
        for slot in &mut out.nodes {
            slot.node = match &slot.node {
                ElimNode::Leaf { expr, matched } => ElimNode::Leaf {
                    expr: self.expr(expr),
                    matched: matched
                        .as_ref()
                        .map(|ids| ids.iter().map(|id| self.bindings.get(id).map_or(*id, |fresh| fresh.id)).collect()),
                },
                ElimNode::Branch { scrutinee, tail, clauses } => {
                    let scrutinee = self.binding(scrutinee);
                    let tail = self.bindings(tail);
                    let mut relinked = clauses.clone();
                    for clause in relinked.values_mut() {
                        clause.split = Split {
                            constructor: clause.split.constructor,
                            params: self.bindings(&clause.split.params),
                            tail: self.bindings(&clause.split.tail),
                            subst: self.subst(&clause.split.subst),
                        };
                    }
                    ElimNode::Branch { scrutinee, tail, clauses: relinked }
                }
                ElimNode::Empty => ElimNode::Empty,
            };
        }
        out
    }

    fn definition(&mut self, definition: &Definition) -> Definition {
        match definition {
            Definition::Function(function) => {
                let mut function = function.clone();
                function.params = self.bindings(&function.params);
                function.result_type = self.expr(&function.result_type);
                function.elim_tree = function.elim_tree.as_ref().map(|tree| self.tree(tree));
                Definition::Function(function)
            }
            Definition::Data(data) => {
                let mut data = data.clone();
                data.params = self.telescope(&data.params);
                Definition::Data(data)
            }
            Definition::Constructor(con) => {
                let mut con = con.clone();
                con.args = self.telescope(&con.args);
                Definition::Constructor(con)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Prelude;

    #[test]
    fn version_is_checked_first() {
        let prelude = Prelude::new();
        let mut bytes = encode_definitions(&prelude.env, &[prelude.nat]).unwrap();
        bytes[..4].copy_from_slice(&7u32.to_le_bytes());
        let err = decode_definitions(&bytes, &prelude.env).unwrap_err();
        assert!(matches!(err, DeserializationError::Version { expected: FORMAT_VERSION, found: 7 }), "{err:?}");
    }

    #[test]
    fn truncated_bytes_are_malformed() {
        let prelude = Prelude::new();
        let bytes = encode_definitions(&prelude.env, &[prelude.nat]).unwrap();
        let err = decode_definitions(&bytes[..bytes.len() / 2], &prelude.env).unwrap_err();
        assert!(matches!(err, DeserializationError::Malformed(_)), "{err:?}");
    }

    #[test]
    fn unknown_id_cannot_be_encoded() {
        let env = Env::new();
        assert!(matches!(encode_definitions(&env, &[DefId(0)]), Err(EncodeError::Env(_))));
    }
}
