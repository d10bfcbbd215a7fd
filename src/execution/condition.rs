//! Condition Evaluation
//!
//! Evaluates a task's pre-conditions against the shared context. Evaluator
//! instances are built on first use per (task, condition) pair and reused
//! for the lifetime of the owning driver.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use log::{debug, error};

use super::panic_message;
use super::registry::{Condition, HandlerRegistry};
use crate::error::EngineError;
use crate::workflow::{ConditionDef, Metadata};

/// task id -> condition id -> evaluator
type ConditionCache = HashMap<String, HashMap<String, Arc<dyn Condition>>>;

pub struct ConditionEvaluator {
    registry: Arc<HandlerRegistry>,
    cache: Mutex<ConditionCache>,
}

impl ConditionEvaluator {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self {
            registry,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// True when every condition holds.
    ///
    /// Conditions are evaluated in order and evaluation stops at the first
    /// one that does not hold. An evaluator that panics is reported as an
    /// error.
    pub fn satisfied(
        &self,
        conditions: &[ConditionDef],
        task_id: &str,
        context: &Metadata,
    ) -> Result<bool, EngineError> {
        for def in conditions {
            let condition = self.condition_for(task_id, def)?;

            let evaluated = panic::catch_unwind(AssertUnwindSafe(|| {
                condition.evaluate(context, &def.config)
            }));
            let holds = evaluated.map_err(|payload| {
                let message = panic_message(payload.as_ref());
                error!("Condition '{}' of task '{}' panicked: {}", def.name, task_id, message);
                EngineError::Condition(format!("condition '{}' panicked: {}", def.name, message))
            })?;

            if !holds {
                debug!("Condition '{}' of task '{}' not satisfied", def.name, task_id);
                return Ok(false);
            }
        }

        Ok(true)
    }

    fn condition_for(&self, task_id: &str, def: &ConditionDef) -> Result<Arc<dyn Condition>, EngineError> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| EngineError::Dispatch("condition cache lock poisoned".to_string()))?;

        let per_task = cache.entry(task_id.to_string()).or_default();
        if let Some(existing) = per_task.get(&def.id) {
            return Ok(Arc::clone(existing));
        }

        let created = self.registry.create_condition(&def.evaluator)?;
        per_task.insert(def.id.clone(), Arc::clone(&created));
        debug!("Created condition '{}' ({}) for task '{}'", def.id, def.evaluator, task_id);

        Ok(created)
    }

    /// Number of cached evaluator instances.
    pub fn cached_count(&self) -> usize {
        self.cache
            .lock()
            .map(|cache| cache.values().map(HashMap::len).sum())
            .unwrap_or(0)
    }
}
