//! Run state models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Overall run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    /// Run has not started
    Pending,
    /// Run is in progress
    Running,
    /// Every stage succeeded
    Completed,
    /// At least one stage failed
    Failed,
}

/// Stages a run moves through, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RunStage {
    Init,
    ResourcesUp,
    Cloning,
    ServicesUp,
    Injecting,
    Steps,
    Extracting,
    ServicesDown,
    ResourcesDown,
    Done,
}

impl RunStage {
    /// Teardown stages run even after a failure
    pub fn is_teardown(&self) -> bool {
        matches!(self, RunStage::ServicesDown | RunStage::ResourcesDown | RunStage::Done)
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStage::Init => "init",
            RunStage::ResourcesUp => "resources up",
            RunStage::Cloning => "cloning",
            RunStage::ServicesUp => "services up",
            RunStage::Injecting => "injecting",
            RunStage::Steps => "steps",
            RunStage::Extracting => "extracting",
            RunStage::ServicesDown => "services down",
            RunStage::ResourcesDown => "resources down",
            RunStage::Done => "done",
        };
        write!(f, "{}", name)
    }
}

/// State of one pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    /// Unique run ID
    pub run_id: Uuid,

    /// Current status
    pub status: ExecutionStatus,

    /// Stage the run is in
    pub stage: RunStage,

    /// Set once anything fails; never cleared
    pub failed: bool,

    /// When the run started
    pub started_at: Option<DateTime<Utc>>,

    /// When the run finished
    pub completed_at: Option<DateTime<Utc>>,

    /// Number of build steps that completed
    pub completed_steps: usize,
}

impl RunState {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            status: ExecutionStatus::Pending,
            stage: RunStage::Init,
            failed: false,
            started_at: None,
            completed_at: None,
            completed_steps: 0,
        }
    }

    pub fn start(&mut self) {
        self.status = ExecutionStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Move to a later stage. Stages never go backwards.
    pub fn advance(&mut self, stage: RunStage) {
        if stage > self.stage {
            self.stage = stage;
        }
    }

    pub fn fail(&mut self) {
        self.failed = true;
    }

    /// Whether a setup stage should still run
    pub fn should_run(&self, stage: RunStage) -> bool {
        !self.failed || stage.is_teardown()
    }

    /// Close the run, picking the final status from the failure flag
    pub fn finish(&mut self) {
        self.stage = RunStage::Done;
        self.status = if self.failed {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Completed
        };
        self.completed_at = Some(Utc::now());
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}
