//! In-process task store: root task name -> task tree.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::{DeployError, Result};
use crate::task::Task;

#[derive(Default)]
pub struct Store {
    tasks: RwLock<HashMap<String, Arc<Task>>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new task; fails if the name is taken
    pub fn add_task(&self, task: Arc<Task>) -> Result<()> {
        let mut tasks = self.tasks.write();
        if tasks.contains_key(task.name()) {
            return Err(DeployError::TaskExists {
                name: task.name().to_string(),
            });
        }
        tasks.insert(task.name().to_string(), task);
        Ok(())
    }

    /// Replace an existing task; fails if the name is unknown
    pub fn update_task(&self, task: Arc<Task>) -> Result<()> {
        let mut tasks = self.tasks.write();
        match tasks.get_mut(task.name()) {
            Some(slot) => {
                *slot = task;
                Ok(())
            }
            None => Err(DeployError::TaskMissing {
                name: task.name().to_string(),
            }),
        }
    }

    pub fn update_or_add_task(&self, task: Arc<Task>) {
        self.tasks.write().insert(task.name().to_string(), task);
    }

    pub fn get_task(&self, name: &str) -> Result<Arc<Task>> {
        self.tasks
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| DeployError::TaskMissing { name: name.to_string() })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.read().contains_key(name)
    }
}
