use crate::cache::ResultCache;
use crate::dag::{ExecutionPlan, PortRef, PortSpec, WorkflowGraph};
use crate::error::{EngineError, Result};
use crate::handler::{NodeContext, NodeHandler, NodeInputs, NodeOutputs};
use crate::process::{SystemRunner, ToolRunner};
use crate::run::{NodeRecord, NodeStatus, RunReport, RunStateMachine};
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{error, info};
use uuid::Uuid;

/// Executor configuration
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Root of all node working directories (`<base_dir>/<workflow>/...`)
    pub base_dir: PathBuf,
    /// Maximum number of nodes (and tool fan-out) running at once
    pub max_parallel: usize,
    pub node_timeout: Duration,
    pub use_cache: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            base_dir: std::env::temp_dir().join("preafq"),
            max_parallel: (num_cpus::get() * 3 / 4).max(1), // 75% of cores
            node_timeout: Duration::from_secs(24 * 60 * 60),
            use_cache: true,
        }
    }
}

/// Runs a validated workflow graph phase by phase
pub struct WorkflowExecutor {
    graph: Arc<WorkflowGraph>,
    handlers: HashMap<String, Arc<dyn NodeHandler>>,
    runner: Arc<dyn ToolRunner>,
    config: ExecutorConfig,
    run_id: Uuid,
}

impl WorkflowExecutor {
    pub fn new(graph: WorkflowGraph) -> Self {
        Self {
            graph: Arc::new(graph),
            handlers: HashMap::new(),
            runner: Arc::new(SystemRunner::new()),
            config: ExecutorConfig::default(),
            run_id: Uuid::new_v4(),
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_runner(mut self, runner: Arc<dyn ToolRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Register (or replace) the handler for a node
    pub fn register_handler(&mut self, node: impl Into<String>, handler: Arc<dyn NodeHandler>) {
        self.handlers.insert(node.into(), handler);
    }

    pub fn graph(&self) -> &WorkflowGraph {
        &self.graph
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn workflow_dir(&self) -> PathBuf {
        self.config.base_dir.join(self.graph.name())
    }

    /// Working directory of a node; dotted names become nested directories
    pub fn node_dir(&self, node: &str) -> PathBuf {
        node.split('.')
            .fold(self.workflow_dir(), |dir, part| dir.join(part))
    }

    /// Validate the graph and check that every node has a handler
    pub fn plan(&self) -> Result<ExecutionPlan> {
        let plan = self.graph.validate()?;
        for node in self.graph.nodes() {
            if !self.handlers.contains_key(&node.name) {
                return Err(EngineError::HandlerNotRegistered(node.name.clone()));
            }
        }
        Ok(plan)
    }

    /// Execute the workflow (main entry point)
    pub async fn run(&self) -> Result<RunReport> {
        let plan = self.plan()?;
        let start_time = Instant::now();

        info!(
            "Starting workflow {} (run {}) - {} nodes in {} phases",
            self.graph.name(),
            self.run_id,
            plan.node_count(),
            plan.phases().len()
        );
        info!("Execution plan:\n{}", plan.describe());

        let mut state_machine = RunStateMachine::new();
        state_machine.start()?;

        let outputs: Arc<DashMap<String, NodeOutputs>> = Arc::new(DashMap::new());
        let mut records = Vec::with_capacity(plan.node_count());

        let result = self
            .run_phases(&plan, &mut state_machine, &outputs, &mut records)
            .await;

        match &result {
            Ok(()) => {
                let executed = records
                    .iter()
                    .filter(|r: &&NodeRecord| r.status == NodeStatus::Executed)
                    .count();
                state_machine.complete(executed)?;
                info!(
                    "Workflow {} completed - {} nodes executed, {} cached in {}ms",
                    self.graph.name(),
                    executed,
                    records.len() - executed,
                    start_time.elapsed().as_millis()
                );
            }
            Err(e) => {
                error!("Workflow {} failed: {}", self.graph.name(), e);
                let failed_node = match e {
                    EngineError::NodeFailed { node, .. } => Some(node.clone()),
                    EngineError::NodePanicked(node) => Some(node.clone()),
                    _ => None,
                };
                state_machine.fail(e.to_string(), failed_node)?;
            }
        }

        let report = RunReport {
            run_id: self.run_id,
            workflow: self.graph.name().to_string(),
            state: state_machine.into_state(),
            nodes: records,
            outputs: outputs
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone().into_map()))
                .collect::<BTreeMap<_, _>>(),
        };
        report.write_to(&self.workflow_dir())?;

        result.map(|_| report)
    }

    async fn run_phases(
        &self,
        plan: &ExecutionPlan,
        state_machine: &mut RunStateMachine,
        outputs: &Arc<DashMap<String, NodeOutputs>>,
        records: &mut Vec<NodeRecord>,
    ) -> Result<()> {
        let cache = ResultCache::new(self.config.use_cache);
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel.max(1)));

        for (phase_idx, group) in plan.phases().iter().enumerate() {
            state_machine.enter_phase(phase_idx)?;
            info!(
                "Phase {} - {} nodes{}",
                phase_idx + 1,
                group.len(),
                if group.len() > 1 { " (parallel)" } else { "" }
            );

            let mut tasks = Vec::with_capacity(group.len());
            for node in group {
                let inputs = self.collect_inputs(node, outputs)?;
                let handler = self
                    .handlers
                    .get(node)
                    .ok_or_else(|| EngineError::HandlerNotRegistered(node.clone()))?
                    .clone();
                let declared = self
                    .graph
                    .node(node)
                    .ok_or_else(|| EngineError::NodeNotFound(node.clone()))?
                    .outputs
                    .clone();

                let ctx = NodeContext {
                    run_id: self.run_id,
                    workflow: self.graph.name().to_string(),
                    node: node.clone(),
                    work_dir: self.node_dir(node),
                    runner: self.runner.clone(),
                    max_parallel: self.config.max_parallel.max(1),
                };
                let cache = cache.clone();
                let timeout = self.config.node_timeout;
                let semaphore = semaphore.clone();
                let outputs = outputs.clone();

                tasks.push(tokio::spawn(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|e| EngineError::Other(anyhow::anyhow!(e)))?;
                    let node = ctx.node.clone();
                    let (node_outputs, record) =
                        Self::execute_node(handler, inputs, ctx, cache, timeout, &declared).await?;
                    outputs.insert(node, node_outputs);
                    Ok::<NodeRecord, EngineError>(record)
                }));
            }

            // Wait for the whole phase, then fail on the first error
            let results = futures::future::join_all(tasks).await;
            for (node, task_result) in group.iter().zip(results) {
                match task_result {
                    Ok(Ok(record)) => records.push(record),
                    Ok(Err(e)) => {
                        error!("Node {} failed: {}", node, e);
                        return Err(EngineError::NodeFailed {
                            node: node.clone(),
                            source: Box::new(e),
                        });
                    }
                    Err(join_err) => {
                        error!("Node {} panicked: {}", node, join_err);
                        return Err(EngineError::NodePanicked(node.clone()));
                    }
                }
            }
        }

        Ok(())
    }

    /// Gather every bound input of a node from upstream outputs and literals
    fn collect_inputs(
        &self,
        node: &str,
        outputs: &DashMap<String, NodeOutputs>,
    ) -> Result<NodeInputs> {
        let spec = self
            .graph
            .node(node)
            .ok_or_else(|| EngineError::NodeNotFound(node.to_string()))?;

        let mut inputs = NodeInputs::new();
        for port in &spec.inputs {
            let target = PortRef::new(node, port.name.as_str());

            if let Some(edge) = self.graph.incoming(node).find(|e| e.to == target) {
                let value = outputs
                    .get(&edge.from.node)
                    .and_then(|produced| produced.get(&edge.from.port).cloned())
                    .ok_or_else(|| EngineError::MissingOutput {
                        node: edge.from.node.clone(),
                        port: edge.from.port.clone(),
                    })?;
                inputs.insert(port.name.clone(), value.coerce_to(port.ty));
            } else if let Some(value) = self.graph.literal(&target) {
                inputs.insert(port.name.clone(), value.clone());
            }
        }

        Ok(inputs)
    }

    /// Execute a single node (or reuse its cached result)
    async fn execute_node(
        handler: Arc<dyn NodeHandler>,
        inputs: NodeInputs,
        ctx: NodeContext,
        cache: ResultCache,
        timeout: Duration,
        declared: &[PortSpec],
    ) -> Result<(NodeOutputs, NodeRecord)> {
        let start = Instant::now();
        tokio::fs::create_dir_all(&ctx.work_dir).await?;

        let input_hash = ResultCache::input_hash(&ctx.node, &handler.fingerprint(), &inputs)?;
        if handler.cacheable() {
            if let Some(cached) = cache.load(&ctx.work_dir, &input_hash)? {
                info!("Node {} reused cached result", ctx.node);
                return Ok((
                    cached,
                    NodeRecord {
                        node: ctx.node.clone(),
                        status: NodeStatus::Cached,
                        duration_ms: start.elapsed().as_millis() as u64,
                    },
                ));
            }
        }

        info!("Executing node {}", ctx.node);
        let outputs = match tokio::time::timeout(timeout, handler.execute(inputs, &ctx)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(EngineError::Timeout {
                    node: ctx.node.clone(),
                    secs: timeout.as_secs(),
                });
            }
        };

        for port in declared {
            let value = outputs
                .get(&port.name)
                .ok_or_else(|| EngineError::MissingOutput {
                    node: ctx.node.clone(),
                    port: port.name.clone(),
                })?;
            if !port.ty.accepts(value.port_type()) {
                return Err(EngineError::PortTypeMismatch {
                    port: format!("{}.{}", ctx.node, port.name),
                    expected: port.ty.to_string(),
                    found: value.port_type().to_string(),
                });
            }
        }

        if handler.cacheable() {
            cache.save(&ctx.work_dir, &ctx.node, &input_hash, &outputs)?;
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        info!("Node {} completed in {}ms", ctx.node, duration_ms);

        Ok((
            outputs,
            NodeRecord {
                node: ctx.node.clone(),
                status: NodeStatus::Executed,
                duration_ms,
            },
        ))
    }
}
