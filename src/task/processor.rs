//! Split logic registry.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use super::{processors, Task, TaskType};
use crate::certs::CertIssuer;
use crate::core::{DeployError, EngineConfig, Result};

/// Inputs a processor may use while splitting. No remote I/O happens here.
#[derive(Clone)]
pub struct SplitContext {
    pub issuer: Arc<dyn CertIssuer>,
    pub config: Arc<EngineConfig>,
}

impl SplitContext {
    pub fn new(issuer: Arc<dyn CertIssuer>, config: Arc<EngineConfig>) -> Self {
        Self { issuer, config }
    }
}

/// Fills a task with its sub-tasks or actions.
///
/// A processor must attach all children in one call, or none on error.
pub trait Processor: Send + Sync {
    fn split_task(&self, task: &Task, ctx: &SplitContext) -> Result<()>;
}

/// Registry for processors, keyed by task type
#[derive(Clone)]
pub struct ProcessorRegistry {
    processors: Arc<RwLock<HashMap<TaskType, Arc<dyn Processor>>>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self {
            processors: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// A registry with every built-in processor
    pub fn with_defaults() -> Result<Self> {
        let registry = Self::new();
        processors::register_builtin(&registry)?;
        Ok(registry)
    }

    pub fn register(&self, task_type: TaskType, processor: Arc<dyn Processor>) -> Result<()> {
        let mut processors = self.processors.write();
        if processors.contains_key(&task_type) {
            return Err(DeployError::already_registered("processor", task_type.as_str()));
        }
        processors.insert(task_type, processor);
        Ok(())
    }

    pub fn get(&self, task_type: TaskType) -> Result<Arc<dyn Processor>> {
        self.processors
            .read()
            .get(&task_type)
            .cloned()
            .ok_or_else(|| DeployError::not_found("processor", task_type.as_str()))
    }

    pub fn contains(&self, task_type: TaskType) -> bool {
        self.processors.read().contains_key(&task_type)
    }

    /// Split `task` with the processor registered for its type
    pub fn split_task(&self, task: &Task, ctx: &SplitContext) -> Result<()> {
        self.get(task.task_type())?.split_task(task, ctx)
    }
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certs::RcgenIssuer;
    use crate::model::NodeConfig;
    use std::path::Path;

    struct Noop;

    impl Processor for Noop {
        fn split_task(&self, _task: &Task, _ctx: &SplitContext) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_register_twice_fails() {
        let registry = ProcessorRegistry::new();
        registry.register(TaskType::NodeCheck, Arc::new(Noop)).unwrap();
        assert!(matches!(
            registry.register(TaskType::NodeCheck, Arc::new(Noop)),
            Err(DeployError::AlreadyRegistered { .. })
        ));
    }

    #[test]
    fn test_unregistered_type_is_not_found() {
        let registry = ProcessorRegistry::new();
        let task = Task::new_node_check("c", vec![NodeConfig::new("n1", "10.0.0.1")], Path::new("/tmp")).unwrap();
        let ctx = SplitContext::new(Arc::new(RcgenIssuer), Arc::new(EngineConfig::default()));
        assert!(matches!(
            registry.split_task(&task, &ctx),
            Err(DeployError::NotFound { .. })
        ));
    }

    #[test]
    fn test_defaults_cover_every_type() {
        let registry = ProcessorRegistry::with_defaults().unwrap();
        for task_type in TaskType::ALL {
            assert!(registry.contains(task_type), "{task_type} missing");
        }
    }
}
