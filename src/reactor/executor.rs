use crate::error::Error;
use std::fmt;
use std::thread;

/// A unit of work handed to a [`TaskExecutor`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs delegated engine tasks away from the loop thread.
pub trait TaskExecutor: Send + Sync + fmt::Debug {
    /// Takes `task` for execution. An error means the task was dropped
    /// without running.
    fn execute(&self, task: Task) -> Result<(), Error>;
}

/// Runs every task on its own named thread.
#[derive(Debug, Clone)]
pub struct ThreadExecutor {
    name: String,
}

impl ThreadExecutor {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl TaskExecutor for ThreadExecutor {
    fn execute(&self, task: Task) -> Result<(), Error> {
        thread::Builder::new()
            .name(format!("{}-task", self.name))
            .spawn(task)?;
        Ok(())
    }
}

/// Runs tasks on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineExecutor;

impl TaskExecutor for InlineExecutor {
    fn execute(&self, task: Task) -> Result<(), Error> {
        task();
        Ok(())
    }
}
