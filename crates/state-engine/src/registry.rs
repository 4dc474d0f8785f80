//! Registry of transformers and actions
//!
//! The registry maps transformer ids to templates, keeps every registered
//! action, and indexes actions by the object kinds they accept so that the
//! actions available for a cell can be listed quickly.
//!
//! Kinds are told apart by id. Registering two kinds that share an id but
//! not a description is a configuration error.
//!
//! A registry is populated up front and then handed to a
//! [`crate::State`] behind an `Arc`; from then on it is read-only.
//!
//! # Usage
//!
//! ```ignore
//! let mut registry = Registry::with_builtins()?;
//! registry.register_transformer(my_transformer.clone())?;
//! registry.register_action(Action::from_transformer(&my_transformer))?;
//! let state = State::new(Arc::new(registry));
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use crate::action::{Action, ActionFn, ActionId};
use crate::context::GlobalContext;
use crate::error::{Result, StateError};
use crate::kind::{ObjectKind, StateObject};
use crate::transformer::{Transformer, TransformerFn};

/// Registry of transform templates and actions
#[derive(Debug, Default)]
pub struct Registry {
    transformers: HashMap<String, Arc<Transformer>>,
    transformer_order: Vec<String>,
    actions: HashMap<ActionId, Arc<Action>>,
    action_order: Vec<ActionId>,
    capabilities: HashMap<ObjectKind, Vec<ActionId>>,
    kinds: HashMap<&'static str, ObjectKind>,
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding every transformer and action submitted
    /// through `inventory` by linked crates.
    pub fn with_builtins() -> Result<Self> {
        let mut registry = Self::new();
        for entry in inventory::iter::<TransformerFn> {
            registry.register_transformer((entry.0)())?;
        }
        for entry in inventory::iter::<ActionFn> {
            registry.register_action((entry.0)())?;
        }
        log::debug!(
            "Registered {} built-in transformers and {} actions",
            registry.transformer_order.len(),
            registry.action_order.len()
        );
        Ok(registry)
    }

    /// Register a transformer under its metadata id
    pub fn register_transformer(&mut self, transformer: Arc<Transformer>) -> Result<()> {
        let id = transformer.id().to_string();
        if self.transformers.contains_key(&id) {
            return Err(StateError::configuration(format!(
                "Transformer '{}' is already registered",
                id
            )));
        }
        let metadata = transformer.metadata();
        let mut kinds = accepted_kinds(&metadata.from);
        kinds.push(metadata.to);
        self.declare_kinds(&kinds)?;
        self.transformer_order.push(id.clone());
        self.transformers.insert(id, transformer);
        Ok(())
    }

    /// Register an action and index it by the kinds it accepts
    pub fn register_action(&mut self, action: Arc<Action>) -> Result<()> {
        let id = action.id().to_string();
        if self.actions.contains_key(&id) {
            return Err(StateError::configuration(format!(
                "Action '{}' is already registered",
                id
            )));
        }
        let kinds = accepted_kinds(action.from());
        self.declare_kinds(&kinds)?;
        for kind in kinds {
            let ids = self.capabilities.entry(kind).or_default();
            if !ids.contains(&id) {
                ids.push(id.clone());
            }
        }
        self.action_order.push(id.clone());
        self.actions.insert(id, action);
        Ok(())
    }

    /// Record the kinds a registration refers to.
    ///
    /// Nothing is recorded unless every kind is consistent with the ones
    /// already known.
    fn declare_kinds(&mut self, kinds: &[ObjectKind]) -> Result<()> {
        for kind in kinds {
            if let Some(known) = self.kinds.get(kind.id()) {
                if known.description() != kind.description() {
                    return Err(StateError::configuration(format!(
                        "Kind id '{}' names two kinds: '{}' and '{}'",
                        kind.id(),
                        known.description(),
                        kind.description()
                    )));
                }
            }
        }
        for kind in kinds {
            self.kinds.entry(kind.id()).or_insert(*kind);
        }
        Ok(())
    }

    /// Register a transformer together with its derived action
    pub fn register_with_action(&mut self, transformer: Arc<Transformer>) -> Result<Arc<Action>> {
        let action = Action::from_transformer(&transformer);
        self.register_transformer(transformer)?;
        self.register_action(action.clone())?;
        Ok(action)
    }

    pub fn transformer(&self, id: &str) -> Option<&Arc<Transformer>> {
        self.transformers.get(id)
    }

    pub fn has_transformer(&self, id: &str) -> bool {
        self.transformers.contains_key(id)
    }

    /// All transformers in registration order
    pub fn transformers(&self) -> impl Iterator<Item = &Arc<Transformer>> {
        self.transformer_order
            .iter()
            .filter_map(|id| self.transformers.get(id))
    }

    pub fn action(&self, id: &str) -> Option<&Arc<Action>> {
        self.actions.get(id)
    }

    /// All actions in registration order
    pub fn actions(&self) -> impl Iterator<Item = &Arc<Action>> {
        self.action_order.iter().filter_map(|id| self.actions.get(id))
    }

    /// Actions whose `from` set contains `kind`, in registration order
    pub fn actions_for_kind(&self, kind: ObjectKind) -> Vec<&Arc<Action>> {
        self.capabilities
            .get(&kind)
            .map(|ids| ids.iter().filter_map(|id| self.actions.get(id)).collect())
            .unwrap_or_default()
    }

    /// Actions applicable to a concrete object
    pub fn applicable_actions(&self, target: &StateObject, global: &GlobalContext) -> Vec<&Arc<Action>> {
        self.actions_for_kind(target.kind())
            .into_iter()
            .filter(|a| a.is_applicable(target, global))
            .collect()
    }

    /// Transformers applicable to a concrete object
    pub fn applicable_transformers(&self, input: &StateObject, global: &GlobalContext) -> Vec<&Arc<Transformer>> {
        self.transformers()
            .filter(|t| t.is_applicable(input, global))
            .collect()
    }
}

/// Kinds a `from` set admits; empty means the root only
fn accepted_kinds(from: &[ObjectKind]) -> Vec<ObjectKind> {
    if from.is_empty() {
        vec![ObjectKind::ROOT]
    } else {
        from.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionDisplay, ActionOutput};
    use crate::params::ParamSchema;
    use crate::transformer::TransformerMetadata;

    const NUMBER: ObjectKind = ObjectKind::new("number", "A number");
    const TEXT: ObjectKind = ObjectKind::new("text", "A string");

    fn t(id: &str, from: &[ObjectKind], to: ObjectKind) -> Arc<Transformer> {
        Transformer::from_fn(TransformerMetadata::new(id, to).from(from), ParamSchema::new(), move |_, _| {
            Ok(StateObject::new(to, "out", 0.0_f64))
        })
    }

    #[test]
    fn test_duplicate_transformer_is_rejected() {
        let mut registry = Registry::new();
        registry.register_transformer(t("load", &[], NUMBER)).unwrap();
        let err = registry
            .register_transformer(t("load", &[], NUMBER))
            .unwrap_err();
        assert!(matches!(err, StateError::Configuration(_)));
        assert_eq!(registry.transformers().count(), 1);
    }

    #[test]
    fn test_kind_id_clash_is_rejected() {
        const OTHER_NUMBER: ObjectKind = ObjectKind::new("number", "A phone number");

        let mut registry = Registry::new();
        registry.register_transformer(t("load", &[], NUMBER)).unwrap();
        registry.register_transformer(t("scale", &[NUMBER], NUMBER)).unwrap();

        let err = registry
            .register_transformer(t("dial", &[OTHER_NUMBER], TEXT))
            .unwrap_err();
        assert!(matches!(err, StateError::Configuration(ref msg) if msg.contains("'number'")));
        assert!(!registry.has_transformer("dial"));

        let action = Action::build(&[OTHER_NUMBER]).define(|_| Ok(ActionOutput::None));
        assert!(registry.register_action(action).is_err());
        assert_eq!(registry.actions().count(), 0);
    }

    #[test]
    fn test_duplicate_action_is_rejected() {
        let mut registry = Registry::new();
        let action = Action::from_transformer(&t("load", &[], NUMBER));
        registry.register_action(action.clone()).unwrap();
        assert!(registry.register_action(action).is_err());
    }

    #[test]
    fn test_actions_indexed_by_kind() {
        let mut registry = Registry::new();
        let load = registry.register_with_action(t("load", &[], NUMBER)).unwrap();
        let scale = registry
            .register_with_action(t("scale", &[NUMBER], NUMBER))
            .unwrap();
        let show = Action::build(&[NUMBER, TEXT])
            .with_display(ActionDisplay::new("Show"))
            .define(|_| Ok(ActionOutput::None));
        registry.register_action(show.clone()).unwrap();

        let root_ids: Vec<&str> = registry
            .actions_for_kind(ObjectKind::ROOT)
            .iter()
            .map(|a| a.id())
            .collect();
        assert_eq!(root_ids, vec![load.id()]);

        let number_ids: Vec<&str> = registry
            .actions_for_kind(NUMBER)
            .iter()
            .map(|a| a.id())
            .collect();
        assert_eq!(number_ids, vec![scale.id(), show.id()]);

        assert_eq!(registry.actions_for_kind(TEXT).len(), 1);
    }

    #[test]
    fn test_applicability_respects_predicate() {
        let mut registry = Registry::new();
        registry
            .register_action(
                Action::build(&[NUMBER])
                    .with_applicable(|obj, _| obj.data::<f64>().is_some_and(|x| *x > 0.0))
                    .define(|_| Ok(ActionOutput::None)),
            )
            .unwrap();
        registry.register_transformer(t("scale", &[NUMBER], NUMBER)).unwrap();
        registry.register_transformer(t("load", &[], NUMBER)).unwrap();

        let global = GlobalContext::new();
        let positive = StateObject::new(NUMBER, "p", 1.0_f64);
        let negative = StateObject::new(NUMBER, "n", -1.0_f64);
        assert_eq!(registry.applicable_actions(&positive, &global).len(), 1);
        assert!(registry.applicable_actions(&negative, &global).is_empty());

        let ids: Vec<&str> = registry
            .applicable_transformers(&StateObject::root(), &global)
            .iter()
            .map(|t| t.id())
            .collect();
        assert_eq!(ids, vec!["load"]);
    }
}
