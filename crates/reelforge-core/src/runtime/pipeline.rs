//! Generic runner over a fixed list of stage descriptors.

use tracing::{info, warn};

use crate::runtime::stage::{
    RunContext, Stage, StageDescriptor, StageEnv, StageOutcome, SuccessPolicy, avatar_video_stages,
};
use crate::runtime::types::{
    ErrorKind, PipelineRun, RunStatus, RuntimeError, StageResult, TaskError, TaskKey,
};

/// Executes a stage chain for one run and records its progress.
///
/// The run record is created by the caller; the coordinator appends each
/// stage name before running it, stores fan-out results as they land, and
/// finally sets the run's terminal status:
///
/// * `Cancelled` when the token is seen tripped at a stage boundary, or a
///   stage gives up because of it. No error is attached.
/// * `Failed` when a single stage errors or a fan-out ends with zero
///   successes (`NoQuorum`). The error is surfaced verbatim.
/// * `PartiallySucceeded` when some fan-out stage continued with a strict
///   subset of its tasks.
/// * `Succeeded` otherwise.
pub struct PipelineCoordinator {
    stages: Vec<Box<dyn Stage>>,
}

impl std::fmt::Debug for PipelineCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.descriptors().iter().map(|d| d.name))
            .finish()
    }
}

impl PipelineCoordinator {
    pub fn new(stages: Vec<Box<dyn Stage>>) -> Self {
        Self { stages }
    }

    /// `SelectVoice → … → PollVideos`.
    pub fn avatar_video() -> Self {
        Self::new(avatar_video_stages())
    }

    pub fn descriptors(&self) -> Vec<StageDescriptor> {
        self.stages.iter().map(|s| s.descriptor()).collect()
    }

    /// Run every stage in order and return the final run record.
    pub async fn execute(
        &self,
        env: &StageEnv,
        mut ctx: RunContext,
    ) -> Result<PipelineRun, RuntimeError> {
        let run_id = env.run_id;
        let mut partial = false;

        for stage in &self.stages {
            if env.cancel.is_cancelled() {
                return self.finish(env, RunStatus::Cancelled, None).await;
            }
            let descriptor = stage.descriptor();
            env.state()
                .update_run(run_id, |run| {
                    run.stages.push(descriptor.name.to_owned());
                    Ok(())
                })
                .await?;
            info!(run_id = %run_id, stage = descriptor.name, "stage started");

            let outcome = match stage.run(env, &mut ctx).await {
                Ok(outcome) => outcome,
                Err(RuntimeError::Cancelled) => {
                    return self.finish(env, RunStatus::Cancelled, None).await;
                }
                Err(e) => {
                    warn!(run_id = %run_id, stage = descriptor.name, error = %e, "stage failed");
                    return self.finish(env, RunStatus::Failed, Some(e.to_task_error())).await;
                }
            };

            let StageOutcome::FanOut(fan_out) = outcome else {
                continue;
            };
            env.state()
                .update_run(run_id, |run| {
                    run.stage_results.insert(
                        descriptor.name.to_owned(),
                        StageResult {
                            succeeded: fan_out.succeeded.clone(),
                            failed: fan_out.failed.clone(),
                        },
                    );
                    Ok(())
                })
                .await?;

            if fan_out.succeeded.is_empty() {
                let e = RuntimeError::NoQuorum {
                    stage: descriptor.name.to_owned(),
                };
                warn!(run_id = %run_id, stage = descriptor.name, "no task of the stage succeeded");
                return self.finish(env, RunStatus::Failed, Some(e.to_task_error())).await;
            }
            if fan_out.failed.is_empty() {
                continue;
            }
            if descriptor.policy == SuccessPolicy::Required {
                let error = match fan_out.failed.first() {
                    Some(key) => env.state().task(*key).await.and_then(|t| t.error),
                    None => None,
                }
                .unwrap_or_else(|| TaskError::rejection("required task failed"));
                let e = RuntimeError::stage_failed(descriptor.name, &error);
                return self.finish(env, RunStatus::Failed, Some(e.to_task_error())).await;
            }

            partial = true;
            let warning = TaskError::new(
                ErrorKind::PartialFailure,
                format!(
                    "{}: {} of {} tasks failed",
                    descriptor.name,
                    fan_out.failed.len(),
                    fan_out.total()
                ),
            );
            info!(
                run_id = %run_id,
                stage = descriptor.name,
                warning = %warning.message,
                "stage partially succeeded"
            );
            env.state()
                .update_run(run_id, |run| {
                    run.warnings.push(warning);
                    Ok(())
                })
                .await?;
        }

        let status = if partial {
            RunStatus::PartiallySucceeded
        } else {
            RunStatus::Succeeded
        };
        self.finish(env, status, None).await
    }

    async fn finish(
        &self,
        env: &StageEnv,
        status: RunStatus,
        error: Option<TaskError>,
    ) -> Result<PipelineRun, RuntimeError> {
        if status == RunStatus::Cancelled {
            // Stages may have launched tasks after the token tripped.
            let open: Vec<TaskKey> = env
                .state()
                .snapshot()
                .await
                .tasks
                .iter()
                .filter(|t| t.run_id == Some(env.run_id) && t.status.is_open())
                .map(|t| t.key)
                .collect();
            for key in open {
                if let Err(e) = env.dispatcher.cancel_task(key).await {
                    warn!(task = %key, error = %e, "failed to cancel run task");
                }
            }
        }
        info!(run_id = %env.run_id, %status, "run finished");
        env.state()
            .update_run(env.run_id, |run| {
                run.status = status;
                run.error = error;
                Ok(run.clone())
            })
            .await
    }
}
