#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    use crate::config::{OrchestratorConfig, PollConfig, QuorumConfig};
    use crate::runtime::cancel::CancelToken;
    use crate::runtime::orchestrator::Orchestrator;
    use crate::runtime::persist::{MemoryStore, SessionStore};
    use crate::runtime::poller::{StatusPoller, TaskEvent};
    use crate::runtime::provider::{
        AssetRelocator, AvatarGroup, AvatarGroups, ProviderClient, ProviderError,
        ProviderRegistry, StatusReport,
    };
    use crate::runtime::quorum::{QuorumDecision, QuorumWaiter};
    use crate::runtime::stage::RunRequest;
    use crate::runtime::state::{SessionSnapshot, SessionState};
    use crate::runtime::types::{
        AssetRef, ErrorKind, PipelineRun, RunStatus, RuntimeError, TaskInput, TaskKey, TaskKind,
        TaskRecord, TaskResult, TaskStatus,
    };

    // ── Fakes ─────────────────────────────────────────────────────────────────

    type Script = dyn Fn(&str, u32) -> Result<StatusReport, ProviderError> + Send + Sync;

    /// Scriptable provider: ids are `{prefix}-{n}` in submission order and
    /// each check is answered by `script(id, check_number)`.
    struct FakeProvider {
        prefix: &'static str,
        seq: AtomicU32,
        script: Box<Script>,
        overrides: Mutex<HashMap<String, StatusReport>>,
        checks: Mutex<HashMap<String, u32>>,
        submissions: Mutex<Vec<TaskInput>>,
        cancels: Mutex<Vec<String>>,
        rejected_submissions: Mutex<HashSet<u32>>,
        submit_delay: Mutex<Option<Duration>>,
    }

    impl FakeProvider {
        fn new(
            prefix: &'static str,
            script: impl Fn(&str, u32) -> Result<StatusReport, ProviderError>
            + Send
            + Sync
            + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                prefix,
                seq: AtomicU32::new(0),
                script: Box::new(script),
                overrides: Mutex::new(HashMap::new()),
                checks: Mutex::new(HashMap::new()),
                submissions: Mutex::new(Vec::new()),
                cancels: Mutex::new(Vec::new()),
                rejected_submissions: Mutex::new(HashSet::new()),
                submit_delay: Mutex::new(None),
            })
        }

        fn processing(prefix: &'static str) -> Arc<Self> {
            Self::new(prefix, |_, _| Ok(StatusReport::processing()))
        }

        /// Completes with `https://cdn/{id}` on check `n`.
        fn completes_on(prefix: &'static str, n: u32) -> Arc<Self> {
            Self::new(prefix, move |id, check| {
                if check >= n {
                    Ok(StatusReport::completed(TaskResult::url(format!("https://cdn/{id}"))))
                } else {
                    Ok(StatusReport::processing())
                }
            })
        }

        fn finish(&self, id: &str, report: StatusReport) {
            self.overrides.lock().unwrap().insert(id.to_owned(), report);
        }

        fn reject_submission(&self, ordinal: u32) {
            self.rejected_submissions.lock().unwrap().insert(ordinal);
        }

        /// Hold every submission for `delay` after its id is assigned.
        fn delay_submissions(&self, delay: Duration) {
            *self.submit_delay.lock().unwrap() = Some(delay);
        }

        fn checks(&self, id: &str) -> u32 {
            self.checks.lock().unwrap().get(id).copied().unwrap_or(0)
        }

        fn submissions(&self) -> Vec<TaskInput> {
            self.submissions.lock().unwrap().clone()
        }

        fn cancels(&self) -> Vec<String> {
            self.cancels.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ProviderClient for FakeProvider {
        async fn submit(&self, input: &TaskInput) -> Result<String, ProviderError> {
            let n = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
            self.submissions.lock().unwrap().push(input.clone());
            if self.rejected_submissions.lock().unwrap().contains(&n) {
                return Err(ProviderError::Rejected(format!(
                    "{} submission {n} rejected",
                    self.prefix
                )));
            }
            let delay = *self.submit_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok(format!("{}-{n}", self.prefix))
        }

        async fn check_status(&self, id: &str) -> Result<StatusReport, ProviderError> {
            let check = {
                let mut checks = self.checks.lock().unwrap();
                let count = checks.entry(id.to_owned()).or_insert(0);
                *count += 1;
                *count
            };
            if let Some(report) = self.overrides.lock().unwrap().get(id) {
                return Ok(report.clone());
            }
            (self.script)(id, check)
        }

        async fn cancel(&self, id: &str) -> Result<(), ProviderError> {
            self.cancels.lock().unwrap().push(id.to_owned());
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeRelocator {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AssetRelocator for FakeRelocator {
        async fn ensure_publicly_reachable(
            &self,
            local_ref: &str,
        ) -> Result<String, ProviderError> {
            self.calls.lock().unwrap().push(local_ref.to_owned());
            Ok(format!("https://public.example/{local_ref}"))
        }
    }

    /// Group creation fails with each queued error before succeeding.
    #[derive(Default)]
    struct FakeGroups {
        create_failures: Mutex<VecDeque<ProviderError>>,
        create_calls: AtomicU32,
    }

    impl FakeGroups {
        fn fail_create(&self, error: ProviderError) {
            self.create_failures.lock().unwrap().push_back(error);
        }

        fn create_calls(&self) -> u32 {
            self.create_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AvatarGroups for FakeGroups {
        async fn create_group(
            &self,
            _name: &str,
            _first_asset: &str,
        ) -> Result<AvatarGroup, ProviderError> {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(error) = self.create_failures.lock().unwrap().pop_front() {
                return Err(error);
            }
            Ok(AvatarGroup {
                group_id: "group-1".into(),
                look_id: "look-0".into(),
            })
        }

        async fn add_looks(
            &self,
            _group_id: &str,
            assets: &[String],
        ) -> Result<Vec<String>, ProviderError> {
            Ok((1..=assets.len()).map(|i| format!("look-{i}")).collect())
        }
    }

    struct Providers {
        image: Arc<FakeProvider>,
        audio: Arc<FakeProvider>,
        motion: Arc<FakeProvider>,
        video: Arc<FakeProvider>,
        relocator: Arc<FakeRelocator>,
        groups: Arc<FakeGroups>,
    }

    impl Providers {
        fn new(motion: Arc<FakeProvider>) -> Self {
            Self {
                image: FakeProvider::completes_on("img", 1),
                audio: FakeProvider::completes_on("audio", 1),
                motion,
                video: FakeProvider::completes_on("vid", 2),
                relocator: Arc::new(FakeRelocator::default()),
                groups: Arc::new(FakeGroups::default()),
            }
        }

        fn registry(&self) -> ProviderRegistry {
            ProviderRegistry::new(self.relocator.clone(), self.groups.clone())
                .register(TaskKind::Image, self.image.clone())
                .register(TaskKind::Audio, self.audio.clone())
                .register(TaskKind::Motion, self.motion.clone())
                .register(TaskKind::Video, self.video.clone())
        }
    }

    fn orchestrator(providers: &Providers, config: OrchestratorConfig) -> Orchestrator {
        Orchestrator::new(
            SessionState::new(SessionSnapshot::new("test")),
            providers.registry(),
            config,
        )
    }

    fn run_request(assets: usize) -> RunRequest {
        RunRequest {
            title: "launch teaser".into(),
            script: "Meet the new release.".into(),
            voice_id: Some("narrator".into()),
            assets: (0..assets)
                .map(|i| AssetRef::Local(format!("face-{i}.png")))
                .collect(),
        }
    }

    fn submitted(kind: TaskKind, provider_id: &str) -> TaskRecord {
        let mut record = TaskRecord::new(kind, TaskInput::prompt("p"));
        record.id = Some(provider_id.to_owned());
        record.status = TaskStatus::Submitted;
        record
    }

    /// Let spawned work run without crossing a poll tick.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    async fn status(orch: &Orchestrator, key: TaskKey) -> TaskStatus {
        orch.state().task(key).await.unwrap().status
    }

    async fn in_flight(orch: &Orchestrator, keys: &[TaskKey]) -> usize {
        orch.state()
            .statuses(keys)
            .await
            .iter()
            .filter(|(_, s)| s.is_in_flight())
            .count()
    }

    // ── Admission control ─────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn queued_task_is_promoted_on_first_completion() {
        let providers = Providers::new(FakeProvider::processing("motion"));
        let images = FakeProvider::processing("img");
        let providers = Providers {
            image: images.clone(),
            ..providers
        };
        let orch = orchestrator(&providers, OrchestratorConfig::default());

        let inputs = ["a", "b", "c"].into_iter().map(TaskInput::prompt).collect();
        let batch = orch.submit_tasks(TaskKind::Image, inputs).await.unwrap();
        let keys = batch.keys.clone();
        settle().await;

        assert_eq!(in_flight(&orch, &keys).await, 2);
        assert_eq!(status(&orch, keys[2]).await, TaskStatus::Queued);
        assert_eq!(images.submissions().len(), 2);

        images.finish("img-1", StatusReport::completed(TaskResult::url("https://cdn/img-1.png")));
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(status(&orch, keys[0]).await, TaskStatus::Completed);
        assert!(status(&orch, keys[2]).await.is_in_flight());
        assert_eq!(in_flight(&orch, &keys).await, 2);

        images.finish("img-2", StatusReport::completed(TaskResult::url("https://cdn/img-2.png")));
        images.finish("img-3", StatusReport::failed("nsfw"));
        let fan_out = tokio::time::timeout(Duration::from_secs(30), batch.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fan_out.succeeded, vec![keys[0], keys[1]]);
        assert_eq!(fan_out.failed, vec![keys[2]]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_submission_releases_its_slot() {
        let providers = Providers::new(FakeProvider::processing("motion"));
        let images = FakeProvider::processing("img");
        images.reject_submission(1);
        let providers = Providers {
            image: images.clone(),
            ..providers
        };
        let config = OrchestratorConfig {
            batch_concurrency: 1,
            ..Default::default()
        };
        let orch = orchestrator(&providers, config);

        let inputs = vec![TaskInput::prompt("a"), TaskInput::prompt("b")];
        let batch = orch.submit_tasks(TaskKind::Image, inputs).await.unwrap();
        settle().await;

        let first = orch.state().task(batch.keys[0]).await.unwrap();
        assert_eq!(first.status, TaskStatus::Failed);
        assert_eq!(first.error.unwrap().message, "img submission 1 rejected");
        assert_eq!(status(&orch, batch.keys[1]).await, TaskStatus::Submitted);
    }

    #[tokio::test(start_paused = true)]
    async fn relocation_is_deferred_until_dispatch() {
        let providers = Providers::new(FakeProvider::processing("motion"));
        let images = FakeProvider::processing("img");
        let providers = Providers {
            image: images.clone(),
            ..providers
        };
        let config = OrchestratorConfig {
            batch_concurrency: 1,
            ..Default::default()
        };
        let orch = orchestrator(&providers, config);

        let inputs = vec![
            TaskInput::asset(AssetRef::Local("one.png".into())),
            TaskInput::asset(AssetRef::Local("two.png".into())),
        ];
        let batch = orch.submit_tasks(TaskKind::Image, inputs).await.unwrap();
        settle().await;

        assert_eq!(*providers.relocator.calls.lock().unwrap(), vec!["one.png".to_owned()]);
        assert_eq!(
            images.submissions()[0].assets,
            vec![AssetRef::Reachable("https://public.example/one.png".into())]
        );
        // The recorded input is never rewritten.
        let recorded = orch.state().task(batch.keys[0]).await.unwrap();
        assert!(recorded.input.assets[0].is_local());
        assert!(orch.state().flags().await.is_uploading);
    }

    // ── Cancellation ──────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn cancelling_processing_task_frees_slot() {
        let providers = Providers::new(FakeProvider::processing("motion"));
        let images = FakeProvider::processing("img");
        let providers = Providers {
            image: images.clone(),
            ..providers
        };
        let config = OrchestratorConfig {
            batch_concurrency: 1,
            ..Default::default()
        };
        let orch = orchestrator(&providers, config);

        let inputs = vec![TaskInput::prompt("a"), TaskInput::prompt("b")];
        let batch = orch.submit_tasks(TaskKind::Image, inputs).await.unwrap();
        let (first, second) = (batch.keys[0], batch.keys[1]);
        tokio::time::sleep(Duration::from_millis(5_010)).await;
        assert_eq!(status(&orch, first).await, TaskStatus::Processing);
        assert_eq!(status(&orch, second).await, TaskStatus::Queued);

        assert!(orch.cancel_task(first).await.unwrap());
        settle().await;

        let cancelled = orch.state().task(first).await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert_eq!(cancelled.error.map(|e| e.kind), Some(ErrorKind::Cancelled));
        assert_eq!(status(&orch, second).await, TaskStatus::Submitted);
        assert_eq!(images.cancels(), vec!["img-1".to_owned()]);

        let checks_at_cancel = images.checks("img-1");
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(images.checks("img-1"), checks_at_cancel, "cancelled poll kept ticking");
        assert!(!orch.cancel_task(first).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_submission_withdraws_the_new_id() {
        let providers = Providers::new(FakeProvider::processing("motion"));
        let images = FakeProvider::processing("img");
        images.delay_submissions(Duration::from_secs(2));
        let providers = Providers {
            image: images.clone(),
            ..providers
        };
        let config = OrchestratorConfig {
            batch_concurrency: 1,
            ..Default::default()
        };
        let orch = orchestrator(&providers, config);

        let inputs = vec![TaskInput::prompt("a"), TaskInput::prompt("b")];
        let batch = orch.submit_tasks(TaskKind::Image, inputs).await.unwrap();
        let (first, second) = (batch.keys[0], batch.keys[1]);
        settle().await;
        // The first submit holds its slot while the provider call is in flight.
        assert_eq!(images.submissions().len(), 1);
        assert_eq!(status(&orch, first).await, TaskStatus::Queued);

        assert!(orch.cancel_task(first).await.unwrap());
        tokio::time::sleep(Duration::from_secs(3)).await;

        let cancelled = orch.state().task(first).await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert_eq!(cancelled.id.as_deref(), Some("img-1"));
        assert_eq!(images.cancels(), vec!["img-1".to_owned()]);
        assert_eq!(images.submissions().len(), 2);
        assert_eq!(status(&orch, second).await, TaskStatus::Submitted);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(images.checks("img-1"), 0, "withdrawn task was polled");
    }

    // ── Polling ───────────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn poll_times_out_after_max_attempts() {
        let provider = FakeProvider::processing("vid");
        let record = submitted(TaskKind::Video, "vid-1");
        let key = record.key;
        let mut snap = SessionSnapshot::new("s1");
        snap.tasks.push(record);
        let state = SessionState::new(snap);

        let poller = StatusPoller::new(state.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client: Arc<dyn ProviderClient> = provider.clone();
        let config = PollConfig {
            interval: Duration::from_secs(5),
            max_attempts: 3,
        };
        assert!(poller.start(key, client, config, tx));

        tokio::time::sleep(Duration::from_secs(16)).await;
        let task = state.task(key).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempts, 3);
        assert_eq!(task.error.map(|e| e.kind), Some(ErrorKind::Timeout));
        assert_eq!(rx.try_recv().unwrap(), TaskEvent { key, status: TaskStatus::Failed });

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(provider.checks("vid-1"), 3, "a fourth tick fired");
        assert!(!poller.is_polling(key));
    }

    // ── Quorum ────────────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn quorum_proceeds_after_grace_window() {
        let motion = FakeProvider::new("motion", |id, check| {
            if id == "motion-1" && check >= 4 {
                Ok(StatusReport::completed(TaskResult::url("https://cdn/motion-1")))
            } else {
                Ok(StatusReport::processing())
            }
        });
        let records: Vec<TaskRecord> = (1..=3)
            .map(|i| submitted(TaskKind::Motion, &format!("motion-{i}")))
            .collect();
        let keys: Vec<TaskKey> = records.iter().map(|r| r.key).collect();
        let mut snap = SessionSnapshot::new("s1");
        snap.tasks = records;
        let state = SessionState::new(snap);

        let waiter = QuorumWaiter::new(state.clone(), QuorumConfig::default());
        let started = Instant::now();
        let outcome = waiter
            .wait(motion.as_ref(), &keys, &CancelToken::never())
            .await
            .unwrap();

        assert_eq!(outcome.decision, QuorumDecision::Proceed);
        assert_eq!(outcome.cycles, 16);
        assert_eq!(started.elapsed(), Duration::from_secs(80));
        assert_eq!(outcome.completed, vec![keys[0]]);
        assert_eq!(outcome.stragglers, vec![keys[1], keys[2]]);
        for key in &keys[1..] {
            let task = state.task(*key).await.unwrap();
            assert_eq!(task.status, TaskStatus::Failed);
            assert_eq!(task.error.map(|e| e.kind), Some(ErrorKind::Timeout));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn quorum_wait_observes_cancellation() {
        let motion = FakeProvider::processing("motion");
        let records = vec![submitted(TaskKind::Motion, "motion-1")];
        let keys: Vec<TaskKey> = records.iter().map(|r| r.key).collect();
        let mut snap = SessionSnapshot::new("s1");
        snap.tasks = records;
        let waiter = QuorumWaiter::new(SessionState::new(snap), QuorumConfig::default());

        let controller = crate::runtime::cancel::CancellationController::new();
        let token = controller.token();
        let wait = waiter.wait(motion.as_ref(), &keys, &token);
        let cancel = async {
            tokio::time::sleep(Duration::from_secs(12)).await;
            controller.cancel();
        };
        let (res, ()) = tokio::join!(wait, cancel);

        assert!(matches!(res, Err(RuntimeError::Cancelled)));
        assert_eq!(motion.checks("motion-1"), 2);
    }

    // ── Pipeline ──────────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn pipeline_continues_with_quorum_survivors() {
        let motion = FakeProvider::new("motion", |id, check| {
            if id != "motion-2" {
                Ok(StatusReport::completed(TaskResult::url(format!("https://cdn/{id}"))))
            } else if check >= 2 {
                Ok(StatusReport::failed("face not detected"))
            } else {
                Ok(StatusReport::processing())
            }
        });
        let providers = Providers::new(motion);
        let orch = orchestrator(&providers, OrchestratorConfig::default());

        let handle = orch.start_run(run_request(3)).await.unwrap();
        let run: PipelineRun = handle.wait().await.unwrap();

        assert_eq!(run.status, RunStatus::PartiallySucceeded);
        assert!(run.error.is_none());
        assert_eq!(run.stages.len(), 10);
        assert_eq!(run.warnings.len(), 1);
        assert_eq!(run.warnings[0].kind, ErrorKind::PartialFailure);
        assert_eq!(run.warnings[0].message, "quorum_wait: 1 of 3 tasks failed");

        let uploads = &run.stage_results["upload_assets"];
        assert_eq!(uploads.succeeded.len(), 3);
        let videos = &run.stage_results["poll_videos"];
        assert_eq!(videos.succeeded.len(), 2);
        assert!(videos.failed.is_empty());

        let looks: Vec<String> = providers
            .video
            .submissions()
            .iter()
            .map(|input| input.params["look_id"].as_str().unwrap().to_owned())
            .collect();
        assert_eq!(looks, vec!["look-0", "look-2"]);
        assert_eq!(
            providers.video.submissions()[0].params["audio_url"],
            "https://public.example/https://cdn/audio-1"
        );
        assert_eq!(providers.audio.submissions()[0].voice_id.as_deref(), Some("narrator"));

        let relocated = providers.relocator.calls.lock().unwrap().clone();
        assert!(relocated.contains(&"face-0.png".to_owned()));
        assert_eq!(orch.state().flags().await, Default::default());
    }

    #[tokio::test(start_paused = true)]
    async fn pipeline_fails_when_every_motion_fails() {
        let motion =
            FakeProvider::new("motion", |_, _| Ok(StatusReport::failed("moderation rejected")));
        let providers = Providers::new(motion);
        let orch = orchestrator(&providers, OrchestratorConfig::default());

        let run = orch.start_run(run_request(2)).await.unwrap().wait().await.unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.map(|e| e.kind), Some(ErrorKind::NoQuorum));
        assert_eq!(run.stages.last().map(String::as_str), Some("quorum_wait"));
        assert!(providers.video.submissions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn single_stage_failure_is_surfaced_verbatim() {
        let providers = Providers::new(FakeProvider::processing("motion"));
        let audio =
            FakeProvider::new("audio", |_, _| Ok(StatusReport::failed("voice quota exhausted")));
        let providers = Providers { audio, ..providers };
        let orch = orchestrator(&providers, OrchestratorConfig::default());

        let run = orch.start_run(run_request(1)).await.unwrap().wait().await.unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        let error = run.error.unwrap();
        assert_eq!(error.kind, ErrorKind::ProviderRejection);
        assert_eq!(error.message, "voice quota exhausted");
        assert!(providers.image.submissions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_group_failure_is_retried() {
        let providers = Providers::new(FakeProvider::completes_on("motion", 1));
        providers
            .groups
            .fail_create(ProviderError::Transient("connection reset".into()));
        let orch = orchestrator(&providers, OrchestratorConfig::default());

        let run = orch.start_run(run_request(1)).await.unwrap().wait().await.unwrap();

        assert_eq!(run.status, RunStatus::Succeeded);
        assert!(run.error.is_none());
        assert_eq!(providers.groups.create_calls(), 2);
        assert_eq!(providers.video.submissions().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_group_retries_surface_the_last_error() {
        let providers = Providers::new(FakeProvider::completes_on("motion", 1));
        for _ in 0..2 {
            providers
                .groups
                .fail_create(ProviderError::Transient("connection reset".into()));
        }
        let config = OrchestratorConfig {
            collaborator_attempts: 2,
            ..Default::default()
        };
        let orch = orchestrator(&providers, config);

        let run = orch.start_run(run_request(1)).await.unwrap().wait().await.unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        let error = run.error.unwrap();
        assert_eq!(error.kind, ErrorKind::TransientNetwork);
        assert_eq!(error.message, "connection reset");
        assert_eq!(providers.groups.create_calls(), 2);
        assert!(providers.motion.submissions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_group_is_not_retried() {
        let providers = Providers::new(FakeProvider::completes_on("motion", 1));
        providers
            .groups
            .fail_create(ProviderError::Rejected("group limit reached".into()));
        let orch = orchestrator(&providers, OrchestratorConfig::default());

        let run = orch.start_run(run_request(1)).await.unwrap().wait().await.unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        let error = run.error.unwrap();
        assert_eq!(error.kind, ErrorKind::ProviderRejection);
        assert_eq!(error.message, "group limit reached");
        assert_eq!(providers.groups.create_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_a_run_cancels_its_open_tasks() {
        let motion = FakeProvider::processing("motion");
        let providers = Providers::new(motion.clone());
        let orch = orchestrator(&providers, OrchestratorConfig::default());

        let handle = orch.start_run(run_request(2)).await.unwrap();
        let run_id = handle.run_id;
        // Audio finishes at 5s, uploads at 10s; motion is then in its quorum wait.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(orch.state().flags().await.is_adding_motion);

        assert!(orch.cancel_run(run_id).await.unwrap());
        let run = handle.wait().await.unwrap();
        settle().await;

        assert_eq!(run.status, RunStatus::Cancelled);
        assert!(run.error.is_none());
        let snapshot = orch.snapshot().await;
        assert!(snapshot
            .tasks
            .iter()
            .filter(|t| t.kind == TaskKind::Motion)
            .all(|t| t.status == TaskStatus::Cancelled));
        let mut cancels = motion.cancels();
        cancels.sort();
        assert_eq!(cancels, vec!["motion-1", "motion-2"]);
        assert!(!snapshot.flags.is_adding_motion);
    }

    #[tokio::test]
    async fn run_without_voice_is_a_configuration_error() {
        let providers = Providers::new(FakeProvider::processing("motion"));
        let orch = orchestrator(&providers, OrchestratorConfig::default());
        let mut request = run_request(1);
        request.voice_id = None;

        let run = orch.start_run(request).await.unwrap().wait().await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.map(|e| e.kind), Some(ErrorKind::Configuration));
        assert!(orch.snapshot().await.tasks.is_empty());
    }

    // ── Persistence & restore ─────────────────────────────────────────────────

    #[tokio::test]
    async fn snapshot_round_trip_preserves_tasks() {
        let store = MemoryStore::new();
        let mut snap = SessionSnapshot::new("s1");
        let mut done = submitted(TaskKind::Video, "vid-1");
        done.status = TaskStatus::Downloaded;
        done.result = Some(TaskResult {
            url: Some("file:///out.mp4".into()),
            duration_secs: Some(31.5),
            thumbnail_url: Some("https://cdn/thumb.jpg".into()),
        });
        snap.tasks = vec![
            done,
            submitted(TaskKind::Motion, "motion-1"),
            TaskRecord::new(TaskKind::Image, TaskInput::asset(AssetRef::Local("a.png".into()))),
        ];
        snap.runs.push(PipelineRun::new());

        store.save_snapshot("s1", &snap).await.unwrap();
        let loaded = store.load_snapshot("s1").await.unwrap().unwrap();
        assert_eq!(loaded, snap);

        store.save_snapshot("s1", &loaded).await.unwrap();
        let again = store.load_snapshot("s1").await.unwrap().unwrap();
        let statuses = |s: &SessionSnapshot| s.tasks.iter().map(|t| t.status).collect::<Vec<_>>();
        assert_eq!(statuses(&again), statuses(&snap));
    }

    #[tokio::test(start_paused = true)]
    async fn open_resumes_polling_without_resubmitting() {
        let providers = Providers::new(FakeProvider::processing("motion"));
        let store = Arc::new(MemoryStore::new());

        let mut snap = SessionSnapshot::new("s1");
        let run = PipelineRun::new();
        let run_id = run.run_id;
        let mut video = submitted(TaskKind::Video, "vid-41").for_run(run_id);
        video.status = TaskStatus::Processing;
        let video_key = video.key;
        let queued = TaskRecord::new(TaskKind::Image, TaskInput::prompt("later"));
        let queued_key = queued.key;
        snap.runs.push(run);
        snap.tasks = vec![video, queued];
        store.save_snapshot("s1", &snap).await.unwrap();

        let (orch, resumed) = Orchestrator::open(
            "s1",
            store.clone(),
            providers.registry(),
            OrchestratorConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(resumed.len(), 2);
        for handle in resumed {
            handle.wait().await.unwrap();
        }

        let snapshot = orch.snapshot().await;
        assert_eq!(snapshot.task(video_key).unwrap().status, TaskStatus::Completed);
        assert_eq!(snapshot.task(queued_key).unwrap().status, TaskStatus::Completed);
        let run = snapshot.run(run_id).unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_ref().map(|e| e.kind), Some(ErrorKind::Interrupted));
        assert!(providers.video.submissions().is_empty());
        assert_eq!(providers.image.submissions().len(), 1);

        orch.shutdown().await.unwrap();
        let stored = store.load_snapshot("s1").await.unwrap().unwrap();
        assert_eq!(stored.task(video_key).unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn missing_provider_aborts_open() {
        let providers = Providers::new(FakeProvider::processing("motion"));
        let registry = ProviderRegistry::new(providers.relocator.clone(), providers.groups.clone())
            .register(TaskKind::Image, providers.image.clone());
        let store = Arc::new(MemoryStore::new());

        let err = Orchestrator::open("s1", store.clone(), registry, OrchestratorConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Configuration(_)));
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn downloaded_transition_is_persisted_immediately() {
        let providers = Providers::new(FakeProvider::processing("motion"));
        let store = Arc::new(MemoryStore::new());
        let (orch, _) = Orchestrator::open(
            "s1",
            store.clone(),
            providers.registry(),
            OrchestratorConfig::default(),
        )
        .await
        .unwrap();

        let batch = orch
            .submit_tasks(TaskKind::Video, vec![TaskInput::prompt("clip")])
            .await
            .unwrap();
        let key = batch.keys[0];
        batch.wait().await.unwrap();

        orch.mark_downloaded(key, Some("file:///videos/clip.mp4".into()))
            .await
            .unwrap();
        let stored = store.load_snapshot("s1").await.unwrap().unwrap();
        let task = stored.task(key).unwrap();
        assert_eq!(task.status, TaskStatus::Downloaded);
        assert_eq!(task.artifact_url(), Some("file:///videos/clip.mp4"));
    }
}
