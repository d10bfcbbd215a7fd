//! Handler Registry
//!
//! Task logic and pre-conditions are referenced from workflow definitions by
//! string identifiers. The registry maps those identifiers to factories that
//! build fresh handler and condition instances.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;

use super::builtin;
use crate::error::{EngineError, TaskError};
use crate::workflow::{Metadata, TaskConfig};

/// Business logic of a task.
///
/// Handlers may read and extend the shared context; changes are written back
/// to the workflow instance once the handler returns successfully.
pub trait TaskHandler: Send {
    fn run(&mut self, context: &mut Metadata, config: &TaskConfig) -> Result<(), TaskError>;
}

/// A pre-condition evaluator.
pub trait Condition: Send + Sync {
    fn evaluate(&self, context: &Metadata, config: &TaskConfig) -> bool;
}

/// Adapts a closure into a [`TaskHandler`].
pub struct FnHandler<F>(Arc<F>);

impl<F> TaskHandler for FnHandler<F>
where
    F: Fn(&mut Metadata, &TaskConfig) -> Result<(), TaskError> + Send + Sync,
{
    fn run(&mut self, context: &mut Metadata, config: &TaskConfig) -> Result<(), TaskError> {
        (self.0)(context, config)
    }
}

/// Adapts a closure into a [`Condition`].
pub struct FnCondition<F>(Arc<F>);

impl<F> Condition for FnCondition<F>
where
    F: Fn(&Metadata, &TaskConfig) -> bool + Send + Sync,
{
    fn evaluate(&self, context: &Metadata, config: &TaskConfig) -> bool {
        (self.0)(context, config)
    }
}

type HandlerFactory = Arc<dyn Fn() -> Box<dyn TaskHandler> + Send + Sync>;
type ConditionFactory = Arc<dyn Fn() -> Arc<dyn Condition> + Send + Sync>;

/// String-keyed factories for task handlers and conditions.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, HandlerFactory>,
    conditions: HashMap<String, ConditionFactory>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in handlers and conditions.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::register_builtins(&mut registry);
        registry
    }

    /// Registers a handler factory, replacing any previous one under `id`.
    pub fn register_handler<F, H>(&mut self, id: impl Into<String>, factory: F)
    where
        F: Fn() -> H + Send + Sync + 'static,
        H: TaskHandler + 'static,
    {
        let id = id.into();
        debug!("Registering task handler '{}'", id);
        self.handlers
            .insert(id, Arc::new(move || Box::new(factory()) as Box<dyn TaskHandler>));
    }

    /// Registers a closure as a stateless handler.
    ///
    /// # Example
    ///
    /// ```
    /// use flowrunner::execution::HandlerRegistry;
    ///
    /// let mut registry = HandlerRegistry::new();
    /// registry.register_handler_fn("stamp", |context, _config| {
    ///     context.replace("Stamped", "yes");
    ///     Ok(())
    /// });
    /// assert!(registry.has_handler("stamp"));
    /// ```
    pub fn register_handler_fn<F>(&mut self, id: impl Into<String>, f: F)
    where
        F: Fn(&mut Metadata, &TaskConfig) -> Result<(), TaskError> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.register_handler(id, move || FnHandler(Arc::clone(&f)));
    }

    /// Registers a condition factory, replacing any previous one under `id`.
    pub fn register_condition<F, C>(&mut self, id: impl Into<String>, factory: F)
    where
        F: Fn() -> C + Send + Sync + 'static,
        C: Condition + 'static,
    {
        let id = id.into();
        debug!("Registering condition '{}'", id);
        self.conditions
            .insert(id, Arc::new(move || Arc::new(factory()) as Arc<dyn Condition>));
    }

    /// Registers a closure as a condition.
    pub fn register_condition_fn<F>(&mut self, id: impl Into<String>, f: F)
    where
        F: Fn(&Metadata, &TaskConfig) -> bool + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.register_condition(id, move || FnCondition(Arc::clone(&f)));
    }

    pub fn has_handler(&self, id: &str) -> bool {
        self.handlers.contains_key(id)
    }

    pub fn has_condition(&self, id: &str) -> bool {
        self.conditions.contains_key(id)
    }

    /// Builds a new handler instance.
    pub fn create_handler(&self, id: &str) -> Result<Box<dyn TaskHandler>, EngineError> {
        self.handlers
            .get(id)
            .map(|factory| factory())
            .ok_or_else(|| EngineError::UnknownHandler(id.to_string()))
    }

    /// Builds a new condition instance.
    pub fn create_condition(&self, id: &str) -> Result<Arc<dyn Condition>, EngineError> {
        self.conditions
            .get(id)
            .map(|factory| factory())
            .ok_or_else(|| EngineError::UnknownCondition(id.to_string()))
    }

    /// Registered handler ids, sorted.
    pub fn handler_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Registered condition ids, sorted.
    pub fn condition_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.conditions.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handler_ids())
            .field("conditions", &self.condition_ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_registered() {
        let registry = HandlerRegistry::with_builtins();
        assert_eq!(registry.handler_ids(), vec!["noop", "shell"]);
        assert_eq!(
            registry.condition_ids(),
            vec!["false", "metadata_equals", "metadata_present", "true"]
        );
    }

    #[test]
    fn test_unknown_handler_fails() {
        let registry = HandlerRegistry::new();
        assert!(matches!(
            registry.create_handler("nope"),
            Err(EngineError::UnknownHandler(_))
        ));
        assert!(matches!(
            registry.create_condition("nope"),
            Err(EngineError::UnknownCondition(_))
        ));
    }

    #[test]
    fn test_closure_handler() {
        let mut registry = HandlerRegistry::new();
        registry.register_handler_fn("stamp", |context, config| {
            context.replace("Stamp", config.get_or("value", "none"));
            Ok(())
        });

        let mut handler = registry.create_handler("stamp").unwrap();
        let mut context = Metadata::new();
        handler
            .run(&mut context, &TaskConfig::new().with("value", "42"))
            .unwrap();

        assert_eq!(context.get("Stamp"), Some("42"));
    }

    #[test]
    fn test_closure_condition() {
        let mut registry = HandlerRegistry::new();
        registry.register_condition_fn("has_x", |context, _| context.contains_key("X"));

        let condition = registry.create_condition("has_x").unwrap();
        let context: Metadata = [("X", "1")].into_iter().collect();
        assert!(condition.evaluate(&context, &TaskConfig::new()));
        assert!(!condition.evaluate(&Metadata::new(), &TaskConfig::new()));
    }

    #[test]
    fn test_factory_builds_fresh_instances() {
        struct Counter(u32);
        impl TaskHandler for Counter {
            fn run(&mut self, context: &mut Metadata, _: &TaskConfig) -> Result<(), TaskError> {
                self.0 += 1;
                context.replace("Count", self.0.to_string());
                Ok(())
            }
        }

        let mut registry = HandlerRegistry::new();
        registry.register_handler("counter", || Counter(0));

        let mut context = Metadata::new();
        registry.create_handler("counter").unwrap().run(&mut context, &TaskConfig::new()).unwrap();
        registry.create_handler("counter").unwrap().run(&mut context, &TaskConfig::new()).unwrap();

        assert_eq!(context.get("Count"), Some("1"));
    }
}
