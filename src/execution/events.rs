//! Progress events emitted while a pipeline runs

use crate::core::{ExecutionStatus, RunStage};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Events that can occur during a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    RunStarted {
        run_id: Uuid,
    },
    StageStarted {
        stage: RunStage,
    },
    ImagePullStarted {
        image: String,
    },
    ImagePulled {
        image: String,
    },
    RepositoryCloning {
        name: String,
        location: String,
    },
    ServiceStarted {
        name: String,
        container_id: String,
    },
    ServiceStopped {
        name: String,
    },
    StepStarted {
        name: String,
        index: usize,
        total: usize,
    },
    StepFinished {
        name: String,
        success: bool,
    },
    RunFinished {
        run_id: Uuid,
        status: ExecutionStatus,
    },
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(PipelineEvent) + Send + Sync>;

/// Fan-out of events to every registered handler
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Vec<EventHandler>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&mut self, handler: F)
    where
        F: Fn(PipelineEvent) + Send + Sync + 'static,
    {
        self.handlers.push(Arc::new(handler));
    }

    pub fn emit(&self, event: PipelineEvent) {
        for handler in &self.handlers {
            handler(event.clone());
        }
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}
