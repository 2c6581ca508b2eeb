//! Task generation for BatchSandbox replicas.

use std::sync::LazyLock;

use sandbox_api::{BatchSandbox, Process, ProcessTask, Task, TaskTemplateSpec};
use sandbox_reconcile::{strategic_merge_typed, PatchError, PatchSchema};
use thiserror::Error;

/// Merge keys of [`TaskTemplateSpec`]. Env entries merge by name; every
/// other list is atomic.
static TASK_TEMPLATE_SCHEMA: LazyLock<PatchSchema> =
    LazyLock::new(|| PatchSchema::new().merge_key("spec.process.env", "name"));

/// A shard patch could not be applied.
///
/// Carries the tasks built before the failing index for diagnostics; they
/// must not be acted on.
#[derive(Debug, Error)]
#[error("failed to merge patch {patch} at index {index}: {source}")]
pub struct TaskGenerationError {
    pub index: usize,
    pub patch: String,
    pub partial: Vec<Task>,
    #[source]
    pub source: PatchError,
}

/// Capability exposed by every task scheduling variant.
pub trait TaskSchedulingStrategy {
    /// True when replicas run a derived Task rather than the pod's own
    /// entrypoint.
    fn need_task_scheduling(&self) -> bool;

    /// One task per replica, index aligned.
    fn generate_task_specs(&self) -> Result<Vec<Task>, TaskGenerationError>;
}

/// Base template plus optional per-index strategic merge patches.
#[derive(Debug, Clone, Copy)]
pub struct DefaultTaskSchedulingStrategy<'a> {
    batch_sandbox: &'a BatchSandbox,
}

impl<'a> DefaultTaskSchedulingStrategy<'a> {
    pub fn new(batch_sandbox: &'a BatchSandbox) -> Self {
        Self { batch_sandbox }
    }

    fn task_spec(&self, index: usize) -> Result<Task, (String, PatchError)> {
        let spec = &self.batch_sandbox.spec;
        let name = self.batch_sandbox.metadata.name.as_deref().unwrap_or_default();
        let mut task = Task {
            name: format!("{name}-{index}"),
            process: None,
        };

        let base = spec.task_template.clone().unwrap_or_default();
        let timeout_seconds = base.spec.timeout_seconds;

        match spec.shard_task_patches.as_ref().and_then(|p| p.get(index)) {
            Some(patch) => {
                let patched: TaskTemplateSpec =
                    strategic_merge_typed(&base, patch, &TASK_TEMPLATE_SCHEMA)
                        .map_err(|e| (patch.to_string(), e))?;
                // Shards may reshape the process but never the time budget.
                task.process = patched
                    .spec
                    .process
                    .map(|process| to_process(process, timeout_seconds));
            }
            None => {
                task.process = base
                    .spec
                    .process
                    .map(|process| to_process(process, timeout_seconds));
            }
        }

        Ok(task)
    }
}

fn to_process(process: ProcessTask, timeout_seconds: Option<i64>) -> Process {
    Process {
        command: process.command,
        args: process.args,
        env: process.env,
        working_dir: process.working_dir,
        timeout_seconds,
    }
}

impl TaskSchedulingStrategy for DefaultTaskSchedulingStrategy<'_> {
    fn need_task_scheduling(&self) -> bool {
        self.batch_sandbox.spec.task_template.is_some()
    }

    fn generate_task_specs(&self) -> Result<Vec<Task>, TaskGenerationError> {
        let replicas = self.batch_sandbox.replicas();
        let mut tasks = Vec::with_capacity(replicas);
        for index in 0..replicas {
            match self.task_spec(index) {
                Ok(task) => tasks.push(task),
                Err((patch, source)) => {
                    return Err(TaskGenerationError {
                        index,
                        patch,
                        partial: tasks,
                        source,
                    })
                }
            }
        }
        Ok(tasks)
    }
}

/// The task strategy variant selected for a BatchSandbox.
#[derive(Debug, Clone, Copy)]
#[non_exhaustive]
pub enum ResolvedTaskStrategy<'a> {
    Default(DefaultTaskSchedulingStrategy<'a>),
}

impl TaskSchedulingStrategy for ResolvedTaskStrategy<'_> {
    fn need_task_scheduling(&self) -> bool {
        match self {
            ResolvedTaskStrategy::Default(s) => s.need_task_scheduling(),
        }
    }

    fn generate_task_specs(&self) -> Result<Vec<Task>, TaskGenerationError> {
        match self {
            ResolvedTaskStrategy::Default(s) => s.generate_task_specs(),
        }
    }
}

/// Select the task strategy for a BatchSandbox.
pub fn resolve_task_strategy(batch_sandbox: &BatchSandbox) -> ResolvedTaskStrategy<'_> {
    ResolvedTaskStrategy::Default(DefaultTaskSchedulingStrategy::new(batch_sandbox))
}
