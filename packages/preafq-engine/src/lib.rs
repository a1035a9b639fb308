/*
 * preafq-engine - Typed Workflow Graph Engine
 *
 * Runs graphs of external-tool nodes the way a neuroimaging workflow
 * engine does: typed ports, upfront validation, phased execution.
 *
 * Architecture:
 * - Typed graph (nodes, ports, edges, literal inputs)
 * - Validation + phase planning (acyclic, every required input bound)
 * - Pluggable node handlers (async trait)
 * - External tool runner (tokio::process)
 * - Per-node working directories + result cache
 * - Run state machine + JSON run report
 */

pub mod cache;
pub mod dag;
pub mod error;
pub mod executor;
pub mod handler;
pub mod process;
pub mod run;

pub use cache::{CachedResult, ResultCache};
pub use dag::{Edge, ExecutionPlan, NodeSpec, PortRef, PortSpec, PortType, PortValue, WorkflowGraph};
pub use error::{EngineError, Result};
pub use executor::{ExecutorConfig, WorkflowExecutor};
pub use handler::{NodeContext, NodeHandler, NodeInputs, NodeOutputs};
pub use process::{SystemRunner, ToolCommand, ToolOutput, ToolRunner};
pub use run::{NodeRecord, NodeStatus, RunReport, RunState, RunStateMachine};
