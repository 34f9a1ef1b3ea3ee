//! Stage descriptors and the avatar-video stage chain.
//!
//! Each stage declares its name, whether it fans out, and how many of its
//! tasks must succeed. The generic runner in
//! [`pipeline`](crate::runtime::pipeline) applies that policy; stages only
//! do their work and report what happened.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::runtime::cancel::CancelToken;
use crate::runtime::dispatch::{Dispatcher, FanOut};
use crate::runtime::provider::{ProviderError, ProviderRegistry};
use crate::runtime::quorum::{QuorumDecision, QuorumWaiter};
use crate::runtime::state::SessionState;
use crate::runtime::types::{
    AssetRef, RunId, RuntimeError, TaskError, TaskInput, TaskKey, TaskKind,
};

/// Minimum-success rule of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuccessPolicy {
    /// Any failure aborts the run.
    Required,
    /// The run continues with the succeeded subset; zero successes abort
    /// it with `NoQuorum`.
    AtLeastOne,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageDescriptor {
    pub name: &'static str,
    pub fan_out: bool,
    pub policy: SuccessPolicy,
}

impl StageDescriptor {
    const fn single(name: &'static str) -> Self {
        Self {
            name,
            fan_out: false,
            policy: SuccessPolicy::Required,
        }
    }

    const fn fan_out(name: &'static str) -> Self {
        Self {
            name,
            fan_out: true,
            policy: SuccessPolicy::AtLeastOne,
        }
    }
}

/// What a stage produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Single,
    FanOut(FanOut),
}

/// One step of a pipeline run.
#[async_trait]
pub trait Stage: Send + Sync {
    fn descriptor(&self) -> StageDescriptor;

    /// Consume upstream outputs from `ctx` and leave this stage's outputs
    /// there for the next one.
    async fn run(&self, env: &StageEnv, ctx: &mut RunContext) -> Result<StageOutcome, RuntimeError>;
}

/// Services available to every stage of one run.
#[derive(Debug, Clone)]
pub struct StageEnv {
    pub run_id: RunId,
    pub dispatcher: Dispatcher,
    pub cancel: CancelToken,
}

impl StageEnv {
    pub fn state(&self) -> &SessionState {
        self.dispatcher.state()
    }

    pub fn providers(&self) -> &ProviderRegistry {
        self.dispatcher.providers()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        self.dispatcher.config()
    }

    pub fn quorum(&self) -> QuorumWaiter {
        QuorumWaiter::new(self.state().clone(), self.config().quorum)
    }

    /// Call a single-shot collaborator, retrying transient failures up to
    /// [`OrchestratorConfig::collaborator_attempts`] times.
    ///
    /// A rejection, or the last transient failure, is surfaced verbatim as
    /// a failure of `stage`.
    async fn call<T, F, Fut>(&self, stage: &str, mut call: F) -> Result<T, RuntimeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let attempts = self.config().collaborator_attempts.max(1);
        let mut attempt = 1;
        loop {
            let err = match call().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !err.is_transient() || attempt >= attempts {
                return Err(RuntimeError::stage_failed(stage, &TaskError::from(err)));
            }
            warn!(
                run_id = %self.run_id,
                stage,
                attempt,
                error = %err,
                "transient collaborator error; retrying"
            );
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(RuntimeError::Cancelled),
                _ = tokio::time::sleep(self.config().poll_interval) => {}
            }
            attempt += 1;
        }
    }

    async fn create_tasks(
        &self,
        kind: TaskKind,
        inputs: Vec<TaskInput>,
    ) -> Result<Vec<TaskKey>, RuntimeError> {
        self.dispatcher
            .create_tasks(kind, inputs, Some(self.run_id))
            .await
    }

    /// Error of a failed task, falling back to a generic rejection.
    async fn task_error(&self, key: TaskKey) -> TaskError {
        self.state()
            .task(key)
            .await
            .and_then(|t| t.error)
            .unwrap_or_else(|| TaskError::rejection(format!("task {key} did not complete")))
    }

    async fn artifact_url(&self, key: TaskKey) -> Option<String> {
        self.state()
            .task(key)
            .await
            .and_then(|t| t.artifact_url().map(str::to_owned))
    }
}

/// Input of a pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub title: String,
    /// Narration text for the voice-over.
    pub script: String,
    #[serde(default)]
    pub voice_id: Option<String>,
    /// Avatar source images; the first seeds the avatar group.
    pub assets: Vec<AssetRef>,
}

impl RunRequest {
    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.script.trim().is_empty() {
            return Err(RuntimeError::InvalidRequest("script must not be empty".into()));
        }
        if self.assets.is_empty() {
            return Err(RuntimeError::InvalidRequest(
                "at least one avatar asset is required".into(),
            ));
        }
        Ok(())
    }
}

/// Run-level context threaded through the stages.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub request: RunRequest,
    pub voice_id: Option<String>,
    pub audio_url: Option<String>,
    /// Public URLs of the uploaded assets, in request order.
    pub uploaded: Vec<String>,
    pub group_id: Option<String>,
    /// Look ids, one per uploaded asset.
    pub looks: Vec<String>,
    /// Accepted motion tasks and the look each one animates.
    pub motion_tasks: Vec<(TaskKey, String)>,
    /// Looks whose motion completed within the quorum window.
    pub ready_looks: Vec<String>,
    pub audio_asset_url: Option<String>,
    pub video_tasks: Vec<TaskKey>,
}

impl RunContext {
    pub fn new(request: RunRequest) -> Self {
        Self {
            request,
            ..Default::default()
        }
    }
}

fn missing(stage: &str, what: &str) -> RuntimeError {
    RuntimeError::InvalidRequest(format!("stage '{stage}' started without {what}"))
}

/// The fixed avatar-video chain, in execution order.
pub fn avatar_video_stages() -> Vec<Box<dyn Stage>> {
    vec![
        Box::new(SelectVoice),
        Box::new(SynthesizeAudio),
        Box::new(UploadAssets),
        Box::new(CreateGroup),
        Box::new(AddLooks),
        Box::new(AddMotion),
        Box::new(QuorumWait),
        Box::new(UploadAudioAsset),
        Box::new(RenderVideo),
        Box::new(PollVideos),
    ]
}

// ─── Voice ────────────────────────────────────────────────────────────────────

pub struct SelectVoice;

#[async_trait]
impl Stage for SelectVoice {
    fn descriptor(&self) -> StageDescriptor {
        StageDescriptor::single("select_voice")
    }

    async fn run(
        &self,
        env: &StageEnv,
        ctx: &mut RunContext,
    ) -> Result<StageOutcome, RuntimeError> {
        let voice = ctx
            .request
            .voice_id
            .clone()
            .or_else(|| env.config().default_voice_id.clone())
            .ok_or_else(|| {
                RuntimeError::Configuration(
                    "no voice selected and no default voice configured".into(),
                )
            })?;
        debug!(run_id = %env.run_id, voice = %voice, "voice selected");
        ctx.voice_id = Some(voice);
        Ok(StageOutcome::Single)
    }
}

pub struct SynthesizeAudio;

#[async_trait]
impl Stage for SynthesizeAudio {
    fn descriptor(&self) -> StageDescriptor {
        StageDescriptor::single("synthesize_audio")
    }

    async fn run(
        &self,
        env: &StageEnv,
        ctx: &mut RunContext,
    ) -> Result<StageOutcome, RuntimeError> {
        let name = self.descriptor().name;
        let voice = ctx.voice_id.clone().ok_or_else(|| missing(name, "a voice"))?;
        let input = TaskInput::prompt(ctx.request.script.clone()).with_voice(voice);
        let keys = env.create_tasks(TaskKind::Audio, vec![input]).await?;

        let task = keys.first().copied().ok_or_else(|| missing(name, "an audio task"))?;

        let outcome = env.dispatcher.run_batch(&keys, 1, &env.cancel).await?;
        let Some(key) = outcome.succeeded.first().copied() else {
            return Err(RuntimeError::stage_failed(name, &env.task_error(task).await));
        };
        ctx.audio_url = env.artifact_url(key).await;
        if ctx.audio_url.is_none() {
            return Err(missing(name, "an audio artifact"));
        }
        Ok(StageOutcome::Single)
    }
}

// ─── Avatar assets ────────────────────────────────────────────────────────────

pub struct UploadAssets;

#[async_trait]
impl Stage for UploadAssets {
    fn descriptor(&self) -> StageDescriptor {
        StageDescriptor::fan_out("upload_assets")
    }

    async fn run(
        &self,
        env: &StageEnv,
        ctx: &mut RunContext,
    ) -> Result<StageOutcome, RuntimeError> {
        let inputs = ctx
            .request
            .assets
            .iter()
            .map(|asset| {
                TaskInput::asset(asset.clone()).with_params(json!({ "purpose": "avatar" }))
            })
            .collect();
        let keys = env.create_tasks(TaskKind::Image, inputs).await?;

        let capacity = env.config().upload_concurrency;
        let outcome = env.dispatcher.run_batch(&keys, capacity, &env.cancel).await?;
        for key in &keys {
            if !outcome.succeeded.contains(key) {
                continue;
            }
            if let Some(url) = env.artifact_url(*key).await {
                ctx.uploaded.push(url);
            }
        }
        info!(
            run_id = %env.run_id,
            uploaded = ctx.uploaded.len(),
            requested = keys.len(),
            "assets uploaded"
        );
        Ok(StageOutcome::FanOut(outcome))
    }
}

pub struct CreateGroup;

#[async_trait]
impl Stage for CreateGroup {
    fn descriptor(&self) -> StageDescriptor {
        StageDescriptor::single("create_group")
    }

    async fn run(
        &self,
        env: &StageEnv,
        ctx: &mut RunContext,
    ) -> Result<StageOutcome, RuntimeError> {
        let name = self.descriptor().name;
        let first = ctx
            .uploaded
            .first()
            .ok_or_else(|| missing(name, "an uploaded asset"))?;
        let groups = env.providers().groups();
        let title = &ctx.request.title;
        let group = env.call(name, || groups.create_group(title, first)).await?;
        info!(run_id = %env.run_id, group_id = %group.group_id, "avatar group created");
        ctx.group_id = Some(group.group_id);
        ctx.looks = vec![group.look_id];
        Ok(StageOutcome::Single)
    }
}

pub struct AddLooks;

#[async_trait]
impl Stage for AddLooks {
    fn descriptor(&self) -> StageDescriptor {
        StageDescriptor::single("add_looks")
    }

    async fn run(
        &self,
        env: &StageEnv,
        ctx: &mut RunContext,
    ) -> Result<StageOutcome, RuntimeError> {
        let name = self.descriptor().name;
        let group_id = ctx
            .group_id
            .clone()
            .ok_or_else(|| missing(name, "an avatar group"))?;
        let rest = ctx.uploaded.get(1..).unwrap_or_default();
        if rest.is_empty() {
            return Ok(StageOutcome::Single);
        }
        let groups = env.providers().groups();
        let looks = env.call(name, || groups.add_looks(&group_id, rest)).await?;
        debug!(run_id = %env.run_id, added = looks.len(), "looks added");
        ctx.looks.extend(looks);
        Ok(StageOutcome::Single)
    }
}

// ─── Motion ───────────────────────────────────────────────────────────────────

pub struct AddMotion;

#[async_trait]
impl Stage for AddMotion {
    fn descriptor(&self) -> StageDescriptor {
        StageDescriptor::fan_out("add_motion")
    }

    async fn run(
        &self,
        env: &StageEnv,
        ctx: &mut RunContext,
    ) -> Result<StageOutcome, RuntimeError> {
        let group_id = ctx
            .group_id
            .clone()
            .ok_or_else(|| missing(self.descriptor().name, "an avatar group"))?;
        let inputs = ctx
            .looks
            .iter()
            .map(|look| {
                TaskInput::default().with_params(json!({ "group_id": group_id, "look_id": look }))
            })
            .collect();
        let keys = env.create_tasks(TaskKind::Motion, inputs).await?;

        let outcome = env.dispatcher.submit_all(&keys).await;
        ctx.motion_tasks = keys
            .iter()
            .zip(&ctx.looks)
            .filter(|(key, _)| outcome.succeeded.contains(key))
            .map(|(key, look)| (*key, look.clone()))
            .collect();
        Ok(StageOutcome::FanOut(outcome))
    }
}

pub struct QuorumWait;

#[async_trait]
impl Stage for QuorumWait {
    fn descriptor(&self) -> StageDescriptor {
        StageDescriptor::fan_out("quorum_wait")
    }

    async fn run(
        &self,
        env: &StageEnv,
        ctx: &mut RunContext,
    ) -> Result<StageOutcome, RuntimeError> {
        let siblings: Vec<TaskKey> = ctx.motion_tasks.iter().map(|(key, _)| *key).collect();
        let client = env.providers().client(TaskKind::Motion)?;
        let outcome = env.quorum().wait(client.as_ref(), &siblings, &env.cancel).await?;

        if outcome.decision == QuorumDecision::NoQuorum {
            return Err(RuntimeError::NoQuorum {
                stage: self.descriptor().name.to_owned(),
            });
        }
        ctx.ready_looks = ctx
            .motion_tasks
            .iter()
            .filter(|(key, _)| outcome.completed.contains(key))
            .map(|(_, look)| look.clone())
            .collect();
        Ok(StageOutcome::FanOut(FanOut {
            succeeded: outcome.completed,
            failed: outcome.failed,
        }))
    }
}

// ─── Video ────────────────────────────────────────────────────────────────────

pub struct UploadAudioAsset;

#[async_trait]
impl Stage for UploadAudioAsset {
    fn descriptor(&self) -> StageDescriptor {
        StageDescriptor::single("upload_audio_asset")
    }

    async fn run(
        &self,
        env: &StageEnv,
        ctx: &mut RunContext,
    ) -> Result<StageOutcome, RuntimeError> {
        let name = self.descriptor().name;
        let audio = ctx
            .audio_url
            .as_deref()
            .ok_or_else(|| missing(name, "synthesized audio"))?;
        let relocator = env.providers().relocator();
        let url = env.call(name, || relocator.ensure_publicly_reachable(audio)).await?;
        ctx.audio_asset_url = Some(url);
        Ok(StageOutcome::Single)
    }
}

pub struct RenderVideo;

#[async_trait]
impl Stage for RenderVideo {
    fn descriptor(&self) -> StageDescriptor {
        StageDescriptor::fan_out("render_video")
    }

    async fn run(
        &self,
        env: &StageEnv,
        ctx: &mut RunContext,
    ) -> Result<StageOutcome, RuntimeError> {
        let audio = ctx
            .audio_asset_url
            .clone()
            .ok_or_else(|| missing(self.descriptor().name, "a reachable audio asset"))?;
        let inputs = ctx
            .ready_looks
            .iter()
            .map(|look| {
                TaskInput::prompt(ctx.request.title.clone()).with_params(json!({
                    "look_id": look,
                    "audio_url": audio,
                }))
            })
            .collect();
        let keys = env.create_tasks(TaskKind::Video, inputs).await?;

        let outcome = env.dispatcher.submit_all(&keys).await;
        ctx.video_tasks = outcome.succeeded.clone();
        Ok(StageOutcome::FanOut(outcome))
    }
}

/// Polls every launched render to its own terminal state; no grace window.
pub struct PollVideos;

#[async_trait]
impl Stage for PollVideos {
    fn descriptor(&self) -> StageDescriptor {
        StageDescriptor::fan_out("poll_videos")
    }

    async fn run(
        &self,
        env: &StageEnv,
        ctx: &mut RunContext,
    ) -> Result<StageOutcome, RuntimeError> {
        let outcome = env
            .dispatcher
            .run_batch(&ctx.video_tasks, usize::MAX, &env.cancel)
            .await?;
        Ok(StageOutcome::FanOut(outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_order_and_policies() {
        let descriptors: Vec<StageDescriptor> =
            avatar_video_stages().iter().map(|s| s.descriptor()).collect();
        let names: Vec<&str> = descriptors.iter().map(|d| d.name).collect();
        assert_eq!(
            names,
            [
                "select_voice",
                "synthesize_audio",
                "upload_assets",
                "create_group",
                "add_looks",
                "add_motion",
                "quorum_wait",
                "upload_audio_asset",
                "render_video",
                "poll_videos",
            ]
        );
        for d in &descriptors {
            let expected = if d.fan_out {
                SuccessPolicy::AtLeastOne
            } else {
                SuccessPolicy::Required
            };
            assert_eq!(d.policy, expected, "{}", d.name);
        }
    }

    #[test]
    fn request_requires_script_and_assets() {
        let mut req = RunRequest {
            title: "demo".into(),
            script: "hello".into(),
            voice_id: None,
            assets: vec![],
        };
        assert!(req.validate().is_err());
        req.assets.push(AssetRef::Local("face.png".into()));
        assert!(req.validate().is_ok());
        req.script = "   ".into();
        assert!(req.validate().is_err());
    }
}
