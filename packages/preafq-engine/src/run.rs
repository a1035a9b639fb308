use crate::dag::PortValue;
use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use uuid::Uuid;

/// Workflow run state
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunState {
    Queued { queued_at: DateTime<Utc> },
    Running {
        started_at: DateTime<Utc>,
        current_phase: usize,
    },
    Completed {
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        duration_ms: u64,
        nodes_executed: usize,
    },
    Failed {
        started_at: DateTime<Utc>,
        failed_at: DateTime<Utc>,
        error: String,
        failed_node: Option<String>,
    },
}

impl RunState {
    pub fn state_name(&self) -> &'static str {
        match self {
            RunState::Queued { .. } => "queued",
            RunState::Running { .. } => "running",
            RunState::Completed { .. } => "completed",
            RunState::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed { .. } | RunState::Failed { .. })
    }
}

/// Run state machine for transitions
#[derive(Debug, Clone)]
pub struct RunStateMachine {
    state: RunState,
}

impl RunStateMachine {
    pub fn new() -> Self {
        Self {
            state: RunState::Queued {
                queued_at: Utc::now(),
            },
        }
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn into_state(self) -> RunState {
        self.state
    }

    fn invalid(&self, to: &str) -> EngineError {
        EngineError::InvalidStateTransition {
            from: self.state.state_name().to_string(),
            to: to.to_string(),
        }
    }

    /// Transition: QUEUED → RUNNING
    pub fn start(&mut self) -> Result<()> {
        match &self.state {
            RunState::Queued { .. } => {
                self.state = RunState::Running {
                    started_at: Utc::now(),
                    current_phase: 0,
                };
                Ok(())
            }
            _ => Err(self.invalid("running")),
        }
    }

    /// Update current phase (for running workflows)
    pub fn enter_phase(&mut self, phase: usize) -> Result<()> {
        if let RunState::Running { current_phase, .. } = &mut self.state {
            *current_phase = phase;
            return Ok(());
        }
        Err(self.invalid("enter_phase"))
    }

    /// Transition: RUNNING → COMPLETED
    pub fn complete(&mut self, nodes_executed: usize) -> Result<()> {
        match &self.state {
            RunState::Running { started_at, .. } => {
                let now = Utc::now();
                let duration_ms = (now - *started_at).num_milliseconds().max(0) as u64;
                self.state = RunState::Completed {
                    started_at: *started_at,
                    completed_at: now,
                    duration_ms,
                    nodes_executed,
                };
                Ok(())
            }
            _ => Err(self.invalid("completed")),
        }
    }

    /// Transition: RUNNING → FAILED
    pub fn fail(&mut self, error: String, failed_node: Option<String>) -> Result<()> {
        match &self.state {
            RunState::Running { started_at, .. } => {
                self.state = RunState::Failed {
                    started_at: *started_at,
                    failed_at: Utc::now(),
                    error,
                    failed_node,
                };
                Ok(())
            }
            _ => Err(self.invalid("failed")),
        }
    }
}

impl Default for RunStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// How a node produced its outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Executed,
    Cached,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node: String,
    pub status: NodeStatus,
    pub duration_ms: u64,
}

/// Summary of a workflow run, written as `_report.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub workflow: String,
    pub state: RunState,
    pub nodes: Vec<NodeRecord>,
    pub outputs: BTreeMap<String, BTreeMap<String, PortValue>>,
}

impl RunReport {
    pub const REPORT_FILE: &'static str = "_report.json";

    pub fn record(&self, node: &str) -> Option<&NodeRecord> {
        self.nodes.iter().find(|r| r.node == node)
    }

    pub fn output(&self, node: &str, port: &str) -> Option<&PortValue> {
        self.outputs.get(node).and_then(|ports| ports.get(port))
    }

    pub fn executed_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|r| r.status == NodeStatus::Executed)
            .count()
    }

    pub fn write_to(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        std::fs::write(
            dir.join(Self::REPORT_FILE),
            serde_json::to_vec_pretty(self)?,
        )?;
        Ok(())
    }
}
