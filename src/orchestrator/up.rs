//! Bringing a stack up
//!
//! The batch cursor only releases a service once its dependencies have
//! satisfied their gates. Starts within a batch run concurrently; health
//! outcomes and background restarts under `always` arrive as completions
//! and may release further batches.

use super::instance::{InstanceState, ServiceInstance};
use super::launcher::{Launched, Launcher};
use super::{instance_plan, Orchestrator, StackState, UpReport};
use crate::cancel::CancelToken;
use crate::driver::RuntimeHandle;
use crate::error::{FailureCause, OrchestrationError, Result, ServiceFailure, StackFailure};
use crate::health::HealthOutcome;
use crate::stack::{BatchCursor, HealthProbe, RestartPolicy, Service};
use chrono::Utc;
use futures::future::{join_all, BoxFuture};
use futures::stream::{FuturesUnordered, Stream, StreamExt};
use futures::FutureExt;
use std::collections::HashMap;
use tokio::task::AbortHandle;

/// Asynchronous result folded back into the run
enum Completion {
    Health {
        service: String,
        replica: u32,
        outcome: HealthOutcome,
    },
    Launch {
        service: String,
        replica: u32,
        result: std::result::Result<Launched, FailureCause>,
    },
}

/// Why a batch stopped early
enum Interrupt {
    Cancelled,
    Fatal,
}

/// Health bookkeeping for one service
#[derive(Debug, Default)]
struct Progress {
    /// Starts still in flight
    launching: u32,
    /// Instances being watched or already healthy
    expected: u32,
    healthy: u32,
    failed: bool,
}

impl Progress {
    fn all_healthy(&self) -> bool {
        self.launching == 0 && !self.failed && self.expected > 0 && self.healthy == self.expected
    }
}

/// State of one `up` call
pub(super) struct UpRun<'a> {
    orchestrator: &'a Orchestrator,
    state: &'a mut StackState,
    cursor: BatchCursor,
    pending: FuturesUnordered<BoxFuture<'static, Completion>>,
    watches: Vec<CancelToken>,
    background: Vec<AbortHandle>,
    progress: HashMap<String, Progress>,
    /// Instances created by this call, in creation order
    created: Vec<(String, u32)>,
    report: UpReport,
    failures: Vec<ServiceFailure>,
}

impl<'a> UpRun<'a> {
    pub fn new(orchestrator: &'a Orchestrator, state: &'a mut StackState) -> Self {
        let cursor = state.graph.cursor();
        Self {
            orchestrator,
            state,
            cursor,
            pending: FuturesUnordered::new(),
            watches: Vec::new(),
            background: Vec::new(),
            progress: HashMap::new(),
            created: Vec::new(),
            report: UpReport::default(),
            failures: Vec::new(),
        }
    }

    pub async fn execute(mut self, cancel: &CancelToken) -> Result<UpReport> {
        loop {
            if cancel.is_cancelled() {
                return Err(self.cancelled().await);
            }

            let batch = self.cursor.next_batch();
            if !batch.is_empty() {
                tracing::info!(batch = ?batch, "Releasing batch {}", self.report.batches.len() + 1);
                self.report.batches.push(batch.clone());
                match self.start_batch(&batch, cancel).await {
                    Ok(()) => continue,
                    Err(Interrupt::Cancelled) => return Err(self.cancelled().await),
                    Err(Interrupt::Fatal) => return Err(self.abort().await),
                }
            }

            if self.pending.is_empty() {
                break;
            }

            let step = tokio::select! {
                _ = cancel.cancelled() => None,
                completion = self.pending.next() => Some(completion),
            };
            match step {
                None => return Err(self.cancelled().await),
                Some(Some(completion)) => self.complete(completion).await,
                Some(None) => {}
            }
        }

        self.finish()
    }

    async fn start_batch(
        &mut self,
        batch: &[String],
        cancel: &CancelToken,
    ) -> std::result::Result<(), Interrupt> {
        let launcher = self.orchestrator.launcher.clone();
        let services: Vec<Service> = batch
            .iter()
            .filter_map(|name| self.state.graph.get(name).cloned())
            .collect();

        let resolutions = join_all(
            services
                .iter()
                .map(|s| launcher.resolve(&s.name, &s.image, s.restart)),
        );
        let images = tokio::select! {
            _ = cancel.cancelled() => return Err(Interrupt::Cancelled),
            images = resolutions => images,
        };

        let mut fatal = false;
        let mut starts = FuturesUnordered::new();

        for (service, image) in services.iter().zip(images) {
            let image = match image {
                Ok(image) => image,
                Err(cause) => {
                    self.failures.push(ServiceFailure::service(&service.name, cause));
                    fatal = true;
                    continue;
                }
            };

            let desired = self.state.desired(service);
            let mut existing_healthy = 0;
            let mut rewatch = Vec::new();
            let mut to_start = Vec::new();

            for replica in 1..=desired {
                match self.state.instance_mut(&service.name, replica) {
                    Some(existing) if existing.state.is_up() => {
                        self.report.unchanged.push(existing.id.clone());
                        if existing.state == InstanceState::Healthy {
                            existing_healthy += 1;
                        } else if let Some(handle) = existing.handle.clone() {
                            rewatch.push((replica, handle));
                        }
                    }
                    _ => to_start.push(replica),
                }
            }

            if desired > to_start.len() as u32 {
                self.cursor.mark_started(&service.name);
            }

            if let Some(probe) = &service.healthcheck {
                let progress = self.progress.entry(service.name.clone()).or_default();
                progress.expected += existing_healthy + rewatch.len() as u32;
                progress.healthy += existing_healthy;
                for (replica, handle) in rewatch {
                    self.watch(&service.name, replica, handle, probe.clone());
                }
            }

            let attempts = launcher.start_attempts(service.restart);
            for replica in to_start {
                if let Some(stale) = self.state.remove(&service.name, replica) {
                    launcher.detach_all(stale.attachments).await;
                }

                let (spec, resources) = instance_plan(&self.state.project, service, replica, &image);
                let mut instance = ServiceInstance::new(&self.state.project, &service.name, replica);
                self.orchestrator.transition(&mut instance, InstanceState::Starting);

                match launcher.attach_all(&instance.id, &resources).await {
                    Ok(attachments) => instance.attachments = attachments,
                    Err(cause) => {
                        instance.last_error = Some(cause.to_string());
                        self.orchestrator.transition(&mut instance, InstanceState::Failed);
                        self.failures
                            .push(ServiceFailure::instance(&service.name, replica, cause));
                        self.state.insert(instance);
                        fatal = true;
                        continue;
                    }
                }
                self.state.insert(instance);
                self.created.push((service.name.clone(), replica));

                let name = service.name.clone();
                let launcher = launcher.clone();
                self.progress.entry(name.clone()).or_default().launching += 1;
                if service.restart == RestartPolicy::Always {
                    let task =
                        tokio::spawn(async move { launcher.launch(spec, resources, attempts).await });
                    self.background.push(task.abort_handle());
                    self.pending.push(
                        async move {
                            let result = task.await.unwrap_or(Err(FailureCause::Aborted));
                            Completion::Launch {
                                service: name,
                                replica,
                                result,
                            }
                        }
                        .boxed(),
                    );
                } else {
                    starts.push(async move {
                        let result = launcher.launch(spec, resources, attempts).await;
                        (name, replica, result)
                    });
                }
            }

            self.settle(&service.name);
        }

        if fatal {
            return Err(Interrupt::Fatal);
        }

        loop {
            let step = tokio::select! {
                _ = cancel.cancelled() => None,
                next = starts.next() => Some(next),
            };
            let Some(next) = step else {
                stop_stragglers(launcher, starts);
                return Err(Interrupt::Cancelled);
            };
            let Some((service, replica, result)) = next else {
                break;
            };
            if self.record_launch(&service, replica, result).await {
                fatal = true;
            }
        }

        if fatal {
            Err(Interrupt::Fatal)
        } else {
            Ok(())
        }
    }

    /// Fold a start result into the instance table. Returns true when the
    /// failure is fatal to the run.
    async fn record_launch(
        &mut self,
        service: &str,
        replica: u32,
        result: std::result::Result<Launched, FailureCause>,
    ) -> bool {
        let background = self
            .state
            .graph
            .get(service)
            .is_some_and(|s| s.restart == RestartPolicy::Always);
        let probe = self.state.graph.get(service).and_then(|s| s.healthcheck.clone());

        let Some(instance) = self.state.instance_mut(service, replica) else {
            return false;
        };

        let fatal = match result {
            Ok(launched) => {
                mark_running(self.orchestrator, instance, &launched);
                self.report.started.push(instance.id.clone());
                self.cursor.mark_started(service);

                if let Some(probe) = probe {
                    self.progress.entry(service.to_string()).or_default().expected += 1;
                    self.watch(service, replica, launched.handle, probe);
                }
                false
            }
            Err(cause) => {
                instance.last_error = Some(cause.to_string());
                self.orchestrator.transition(instance, InstanceState::Failed);
                let attachments = std::mem::take(&mut instance.attachments);
                self.orchestrator.launcher.detach_all(attachments).await;
                self.failures
                    .push(ServiceFailure::instance(service, replica, cause));
                if background {
                    self.progress.entry(service.to_string()).or_default().failed = true;
                }
                !background
            }
        };

        let progress = self.progress.entry(service.to_string()).or_default();
        progress.launching = progress.launching.saturating_sub(1);
        self.settle(service);
        fatal
    }

    async fn complete(&mut self, completion: Completion) {
        match completion {
            Completion::Launch {
                service,
                replica,
                result,
            } => {
                self.record_launch(&service, replica, result).await;
            }
            Completion::Health {
                service,
                replica,
                outcome,
            } => {
                let Some(instance) = self.state.instance_mut(&service, replica) else {
                    return;
                };
                let progress = self.progress.entry(service.clone()).or_default();
                match outcome {
                    HealthOutcome::Healthy { .. } => {
                        Orchestrator::record_health(instance, InstanceState::Healthy);
                        progress.healthy += 1;
                    }
                    HealthOutcome::Unhealthy { checks, last_error } => {
                        Orchestrator::record_health(instance, InstanceState::Unhealthy);
                        instance.last_error = Some(last_error.clone());
                        progress.failed = true;
                        self.failures.push(ServiceFailure::instance(
                            &service,
                            replica,
                            FailureCause::Unhealthy { checks, last_error },
                        ));
                    }
                    HealthOutcome::Cancelled => {}
                }
                self.settle(&service);
            }
        }
    }

    fn watch(&mut self, service: &str, replica: u32, handle: RuntimeHandle, probe: HealthProbe) {
        if let Some(instance) = self.state.instance_mut(service, replica) {
            Orchestrator::record_health(instance, InstanceState::HealthChecking);
        }

        let watch = self.orchestrator.health.watch(service, handle, probe);
        self.watches.push(watch.canceller());

        let service = service.to_string();
        self.pending.push(
            async move {
                Completion::Health {
                    service,
                    replica,
                    outcome: watch.outcome().await,
                }
            }
            .boxed(),
        );
    }

    /// Mark the healthy gate once every instance of a service resolved healthy
    fn settle(&mut self, service: &str) {
        if self.progress.get(service).is_some_and(|p| p.all_healthy()) {
            self.cursor.mark_healthy(service);
        }
    }

    /// Stop watches and background restarts, then fold in every launch
    /// that completed. A task that finished before its abort still yields
    /// the handle of a running instance.
    async fn interrupt(&mut self) {
        for watch in &self.watches {
            watch.cancel();
        }
        for task in &self.background {
            task.abort();
        }
        while let Some(completion) = self.pending.next().await {
            if let Completion::Launch {
                service,
                replica,
                result,
            } = completion
            {
                self.adopt(&service, replica, result).await;
            }
        }
    }

    /// Record a launch that completed while the run was being interrupted.
    /// No health watch is started for it.
    async fn adopt(
        &mut self,
        service: &str,
        replica: u32,
        result: std::result::Result<Launched, FailureCause>,
    ) {
        let Some(instance) = self.state.instance_mut(service, replica) else {
            return;
        };
        match result {
            Ok(launched) => {
                mark_running(self.orchestrator, instance, &launched);
                self.report.started.push(instance.id.clone());
            }
            // Still `starting`; the caller settles it
            Err(FailureCause::Aborted) => {}
            Err(cause) => {
                instance.last_error = Some(cause.to_string());
                self.orchestrator.transition(instance, InstanceState::Failed);
                let attachments = std::mem::take(&mut instance.attachments);
                self.orchestrator.launcher.detach_all(attachments).await;
                self.failures
                    .push(ServiceFailure::instance(service, replica, cause));
            }
        }
    }

    /// Cancellation: leave started instances and attachments in place
    async fn cancelled(mut self) -> OrchestrationError {
        self.interrupt().await;

        for (service, replica) in &self.created {
            let Some(instance) = self.state.instance_mut(service, *replica) else {
                continue;
            };
            match instance.state {
                InstanceState::Starting => {
                    instance.last_error = Some("start cancelled".to_string());
                    self.orchestrator.transition(instance, InstanceState::Failed);
                }
                InstanceState::HealthChecking => {
                    self.orchestrator.transition(instance, InstanceState::Running)
                }
                _ => {}
            }
        }

        tracing::warn!(
            started = self.report.started.len(),
            "Up of {} cancelled",
            self.state.project
        );
        OrchestrationError::Cancelled
    }

    /// Fatal failure: stop what this call started, newest first
    async fn abort(mut self) -> OrchestrationError {
        self.interrupt().await;
        tracing::error!(
            "Up of {} failed, rolling back {} instance(s)",
            self.state.project,
            self.created.len()
        );

        for (service, replica) in self.created.iter().rev() {
            let Some(instance) = self.state.instance_mut(service, *replica) else {
                continue;
            };
            if instance.state == InstanceState::Failed {
                continue;
            }
            if let Err(e) = self.orchestrator.retire(instance).await {
                self.failures.push(ServiceFailure::instance(
                    service,
                    *replica,
                    FailureCause::Stop(e),
                ));
                continue;
            }
            self.state.remove(service, *replica);
        }

        for service in self.cursor.unissued() {
            self.failures
                .push(ServiceFailure::service(&service, FailureCause::Aborted));
        }

        OrchestrationError::Up(StackFailure {
            failures: self.failures,
            rolled_back: true,
        })
    }

    fn finish(mut self) -> Result<UpReport> {
        for service in self.cursor.unissued() {
            if let Some((dependency, gate)) = self.cursor.unmet_dependency(&service) {
                tracing::warn!("{} blocked: {} never became {}", service, dependency, gate);
                self.failures.push(ServiceFailure::service(
                    &service,
                    FailureCause::Blocked { dependency, gate },
                ));
            }
        }

        if self.failures.is_empty() {
            tracing::info!(
                started = self.report.started.len(),
                unchanged = self.report.unchanged.len(),
                "Stack {} is up",
                self.state.project
            );
            Ok(self.report)
        } else {
            Err(OrchestrationError::Up(StackFailure {
                failures: self.failures,
                rolled_back: false,
            }))
        }
    }
}

fn mark_running(orchestrator: &Orchestrator, instance: &mut ServiceInstance, launched: &Launched) {
    instance.handle = Some(launched.handle.clone());
    instance.restarts = launched.attempts - 1;
    instance.started_at = Some(Utc::now());
    orchestrator.transition(instance, InstanceState::Running);
}

/// Let abandoned foreground starts finish in the background and stop any
/// instance they bring up
fn stop_stragglers<S>(launcher: Launcher, mut starts: S)
where
    S: Stream<Item = (String, u32, std::result::Result<Launched, FailureCause>)>
        + Unpin
        + Send
        + 'static,
{
    tokio::spawn(async move {
        while let Some((_, _, result)) = starts.next().await {
            if let Ok(launched) = result {
                tracing::info!(
                    "Stopping {}, which came up after cancellation",
                    launched.handle.instance
                );
                if let Err(e) = launcher.stop(&launched.handle).await {
                    tracing::warn!("Failed to stop {}: {}", launched.handle.instance, e);
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::driver::{MemoryRuntime, ProbeStep, RuntimeEvent};
    use crate::orchestrator::tests::{fast_config, fast_probe, orchestrator};
    use crate::orchestrator::StackHandle;
    use crate::resource::ResourceKind;
    use crate::stack::{Gate, ResourceDecl, Stack};
    use std::sync::Arc;
    use std::time::Duration;

    fn started(id: &str) -> RuntimeEvent {
        RuntimeEvent::Started {
            instance: id.to_string(),
        }
    }

    fn probed(id: &str, passed: bool) -> RuntimeEvent {
        RuntimeEvent::Probed {
            instance: id.to_string(),
            passed,
        }
    }

    fn up_failure(err: OrchestrationError) -> StackFailure {
        match err {
            OrchestrationError::Up(failure) => failure,
            other => panic!("expected up failure, got {:?}", other),
        }
    }

    fn cause<'a>(failure: &'a StackFailure, service: &'a str) -> &'a FailureCause {
        &failure
            .for_service(service)
            .next()
            .unwrap_or_else(|| panic!("no failure for {}", service))
            .cause
    }

    #[tokio::test]
    async fn test_healthy_gate_opens_on_the_third_probe() {
        let runtime = MemoryRuntime::new();
        runtime.script_probe("db", vec![ProbeStep::Fail, ProbeStep::Fail]);
        let stack = StackHandle::load(
            Stack::new("shop")
                .service(Service::new("db", "postgres:16").healthcheck(fast_probe(3)))
                .service(Service::new("web", "nginx:1").depends_on("db", Gate::Healthy)),
        )
        .unwrap();

        let report = orchestrator(&runtime)
            .up(&stack, &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(report.batches, vec![vec!["db"], vec!["web"]]);
        assert_eq!(runtime.probe_count("shop-db-1"), 3);
        let passed = runtime.position(&probed("shop-db-1", true)).unwrap();
        let web = runtime.position(&started("shop-web-1")).unwrap();
        assert!(web > passed);
    }

    #[tokio::test]
    async fn test_started_gates_follow_the_chain() {
        let runtime = MemoryRuntime::new();
        let stack = StackHandle::load(
            Stack::new("app")
                .service(Service::new("a", "a:1"))
                .service(Service::new("b", "b:1").depends_on("a", Gate::Started))
                .service(Service::new("c", "c:1").depends_on("b", Gate::Started))
                .service(Service::new("d", "d:1")),
        )
        .unwrap();

        let report = orchestrator(&runtime)
            .up(&stack, &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(report.batches, vec![vec!["a", "d"], vec!["b"], vec!["c"]]);
        let a = runtime.position(&started("app-a-1")).unwrap();
        let b = runtime.position(&started("app-b-1")).unwrap();
        let c = runtime.position(&started("app-c-1")).unwrap();
        assert!(a < b && b < c);
        assert_eq!(report.started.len(), 4);
    }

    #[tokio::test]
    async fn test_never_policy_failure_rolls_back() {
        let runtime = MemoryRuntime::new();
        runtime.fail_starts_always("api");
        let orchestrator = orchestrator(&runtime);
        let stack = StackHandle::load(
            Stack::new("shop")
                .service(Service::new("db", "postgres:16").volume("pgdata", "/data"))
                .service(Service::new("api", "api:1").depends_on("db", Gate::Started))
                .service(Service::new("web", "web:1").depends_on("api", Gate::Started))
                .volume("pgdata", ResourceDecl::default()),
        )
        .unwrap();

        let failure = up_failure(orchestrator.up(&stack, &CancelToken::new()).await.unwrap_err());

        assert!(failure.rolled_back);
        assert!(matches!(cause(&failure, "api"), FailureCause::Start { attempts: 1, .. }));
        assert_eq!(cause(&failure, "web"), &FailureCause::Aborted);
        assert!(!failure.contains("db"));

        assert!(runtime.running_instances().is_empty());
        assert!(runtime
            .position(&RuntimeEvent::Stopped {
                instance: "shop-db-1".into()
            })
            .is_some());
        assert_eq!(orchestrator.resources().ref_count("pgdata", ResourceKind::Volume).await, 0);
        assert!(runtime.volume_exists("pgdata"));
    }

    #[tokio::test]
    async fn test_on_failure_retries_until_running() {
        let runtime = MemoryRuntime::new();
        runtime.fail_starts("api", 2);
        let stack = StackHandle::load(Stack::new("shop").service(
            Service::new("api", "api:1").restart(RestartPolicy::OnFailure {
                max_retries: Some(3),
            }),
        ))
        .unwrap();

        orchestrator(&runtime)
            .up(&stack, &CancelToken::new())
            .await
            .unwrap();

        let status = stack.status().await;
        assert_eq!(status[0].state, InstanceState::Running);
        assert_eq!(status[0].restarts, 2);
        let failed_starts = runtime
            .events()
            .into_iter()
            .filter(|e| matches!(e, RuntimeEvent::StartFailed { .. }))
            .count();
        assert_eq!(failed_starts, 2);
    }

    #[tokio::test]
    async fn test_on_failure_budget_exhausted() {
        let runtime = MemoryRuntime::new();
        runtime.fail_starts("api", 10);
        let stack = StackHandle::load(Stack::new("shop").service(
            Service::new("api", "api:1").restart(RestartPolicy::OnFailure {
                max_retries: Some(2),
            }),
        ))
        .unwrap();

        let failure = up_failure(
            orchestrator(&runtime)
                .up(&stack, &CancelToken::new())
                .await
                .unwrap_err(),
        );
        let api = failure.for_service("api").next().unwrap();
        assert_eq!(api.replica, Some(1));
        assert!(matches!(api.cause, FailureCause::Start { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_unhealthy_blocks_only_health_gated_dependents() {
        let runtime = MemoryRuntime::new();
        runtime.script_probe("db", vec![ProbeStep::Fail; 4]);
        let stack = StackHandle::load(
            Stack::new("shop")
                .service(Service::new("db", "postgres:16").healthcheck(fast_probe(2)))
                .service(Service::new("web", "web:1").depends_on("db", Gate::Healthy))
                .service(Service::new("worker", "worker:1").depends_on("db", Gate::Started))
                .service(Service::new("cache", "redis:7")),
        )
        .unwrap();

        let failure = up_failure(
            orchestrator(&runtime)
                .up(&stack, &CancelToken::new())
                .await
                .unwrap_err(),
        );

        assert!(!failure.rolled_back);
        assert!(matches!(cause(&failure, "db"), FailureCause::Unhealthy { checks: 2, .. }));
        assert_eq!(
            cause(&failure, "web"),
            &FailureCause::Blocked {
                dependency: "db".into(),
                gate: Gate::Healthy
            }
        );
        assert!(!failure.contains("worker"));
        assert!(!failure.contains("cache"));

        assert_eq!(
            runtime.running_instances(),
            vec!["shop-cache-1", "shop-db-1", "shop-worker-1"]
        );
        let db = stack.status().await.into_iter().find(|s| s.service == "db").unwrap();
        assert_eq!(db.state, InstanceState::Unhealthy);
    }

    #[tokio::test]
    async fn test_resource_failure_is_fatal_under_any_policy() {
        let runtime = MemoryRuntime::new();
        runtime.fail_resource("pgdata");
        let stack = StackHandle::load(
            Stack::new("shop")
                .service(
                    Service::new("db", "postgres:16")
                        .volume("pgdata", "/data")
                        .restart(RestartPolicy::Always),
                )
                .service(Service::new("cache", "redis:7")),
        )
        .unwrap();

        let failure = up_failure(
            orchestrator(&runtime)
                .up(&stack, &CancelToken::new())
                .await
                .unwrap_err(),
        );

        assert!(failure.rolled_back);
        assert!(matches!(cause(&failure, "db"), FailureCause::Resource(_)));
        assert!(runtime.running_instances().is_empty());
    }

    #[tokio::test]
    async fn test_image_failure_is_fatal() {
        let runtime = MemoryRuntime::new();
        runtime.fail_image("ghost:1");
        let stack = StackHandle::load(Stack::new("shop").service(Service::new("ghost", "ghost:1")))
            .unwrap();

        let failure = up_failure(
            orchestrator(&runtime)
                .up(&stack, &CancelToken::new())
                .await
                .unwrap_err(),
        );
        assert!(matches!(cause(&failure, "ghost"), FailureCause::Image(_)));
    }

    #[tokio::test]
    async fn test_always_restarts_in_background() {
        let runtime = MemoryRuntime::new();
        runtime.fail_starts("api", 2);
        let stack = StackHandle::load(
            Stack::new("shop")
                .service(Service::new("api", "api:1").restart(RestartPolicy::Always))
                .service(Service::new("web", "web:1").depends_on("api", Gate::Started)),
        )
        .unwrap();

        orchestrator(&runtime)
            .up(&stack, &CancelToken::new())
            .await
            .unwrap();

        let api = runtime.position(&started("shop-api-1")).unwrap();
        let web = runtime.position(&started("shop-web-1")).unwrap();
        assert!(api < web);
        let status = stack.status().await;
        assert_eq!(status[0].service, "api");
        assert_eq!(status[0].restarts, 2);
    }

    #[tokio::test]
    async fn test_always_attempt_cap_blocks_dependents() {
        let runtime = MemoryRuntime::new();
        runtime.fail_starts_always("api");
        let config = OrchestratorConfig {
            always_max_attempts: Some(2),
            ..fast_config()
        };
        let orchestrator = Orchestrator::new(Arc::new(runtime.clone()), Arc::new(runtime.clone()), config);
        let stack = StackHandle::load(
            Stack::new("shop")
                .service(Service::new("api", "api:1").restart(RestartPolicy::Always))
                .service(Service::new("web", "web:1").depends_on("api", Gate::Started)),
        )
        .unwrap();

        let failure = up_failure(orchestrator.up(&stack, &CancelToken::new()).await.unwrap_err());

        assert!(!failure.rolled_back);
        assert!(matches!(cause(&failure, "api"), FailureCause::Start { attempts: 2, .. }));
        assert_eq!(
            cause(&failure, "web"),
            &FailureCause::Blocked {
                dependency: "api".into(),
                gate: Gate::Started
            }
        );
    }

    #[tokio::test]
    async fn test_cancel_during_start() {
        let runtime = MemoryRuntime::new();
        runtime.delay_starts("db", Duration::from_secs(30));
        let orchestrator = orchestrator(&runtime);
        let stack = StackHandle::load(
            Stack::new("shop")
                .service(Service::new("db", "postgres:16").network("backend"))
                .service(Service::new("web", "web:1").depends_on("db", Gate::Started)),
        )
        .unwrap();

        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(Duration::from_secs(5), orchestrator.up(&stack, &cancel))
            .await
            .unwrap();
        assert!(matches!(result, Err(OrchestrationError::Cancelled)));
        assert!(runtime.running_instances().is_empty());

        // Attachments made before the cancel stay in place
        assert_eq!(orchestrator.resources().ref_count("backend", ResourceKind::Network).await, 1);
        let status = stack.status().await;
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].state, InstanceState::Failed);

        // down releases them
        orchestrator.down(&stack, &CancelToken::new()).await.unwrap();
        assert_eq!(orchestrator.resources().ref_count("backend", ResourceKind::Network).await, 0);
    }

    #[tokio::test]
    async fn test_rollback_stops_always_instance_from_the_same_batch() {
        let runtime = MemoryRuntime::new();
        runtime.fail_starts_always("slow");
        runtime.delay_starts("slow", Duration::from_millis(100));
        let orchestrator = orchestrator(&runtime);
        let stack = StackHandle::load(
            Stack::new("shop")
                .service(Service::new("api", "api:1").restart(RestartPolicy::Always))
                .service(Service::new("slow", "slow:1")),
        )
        .unwrap();

        let failure = up_failure(orchestrator.up(&stack, &CancelToken::new()).await.unwrap_err());

        assert!(failure.rolled_back);
        assert!(matches!(cause(&failure, "slow"), FailureCause::Start { .. }));
        assert!(!failure.contains("api"));
        assert!(runtime.running_instances().is_empty());
        assert!(runtime
            .position(&RuntimeEvent::Stopped {
                instance: "shop-api-1".into()
            })
            .is_some());
    }

    #[tokio::test]
    async fn test_cancel_keeps_handle_of_always_instance() {
        let runtime = MemoryRuntime::new();
        runtime.delay_starts("slow", Duration::from_secs(30));
        let orchestrator = orchestrator(&runtime);
        let stack = StackHandle::load(
            Stack::new("shop")
                .service(Service::new("api", "api:1").restart(RestartPolicy::Always))
                .service(Service::new("slow", "slow:1")),
        )
        .unwrap();

        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(Duration::from_secs(5), orchestrator.up(&stack, &cancel))
            .await
            .unwrap();
        assert!(matches!(result, Err(OrchestrationError::Cancelled)));
        assert_eq!(runtime.running_instances(), vec!["shop-api-1"]);

        let status = stack.status().await;
        let state_of = |service: &str| {
            status
                .iter()
                .find(|s| s.service == service)
                .map(|s| s.state)
                .unwrap()
        };
        assert_eq!(state_of("api"), InstanceState::Running);
        assert_eq!(state_of("slow"), InstanceState::Failed);

        orchestrator.down(&stack, &CancelToken::new()).await.unwrap();
        assert!(runtime.running_instances().is_empty());
    }

    #[tokio::test]
    async fn test_second_up_leaves_running_instances_alone() {
        let runtime = MemoryRuntime::new();
        let orchestrator = orchestrator(&runtime);
        let stack = StackHandle::load(
            Stack::new("shop")
                .service(Service::new("db", "postgres:16").healthcheck(fast_probe(1)))
                .service(Service::new("web", "web:1").depends_on("db", Gate::Healthy)),
        )
        .unwrap();

        orchestrator.up(&stack, &CancelToken::new()).await.unwrap();
        let again = orchestrator.up(&stack, &CancelToken::new()).await.unwrap();

        assert!(again.started.is_empty());
        assert_eq!(again.unchanged, vec!["shop-db-1", "shop-web-1"]);
        let starts = runtime
            .events()
            .into_iter()
            .filter(|e| matches!(e, RuntimeEvent::Started { .. }))
            .count();
        assert_eq!(starts, 2);
    }

    #[tokio::test]
    async fn test_every_replica_must_be_healthy_before_dependents() {
        let runtime = MemoryRuntime::new();
        runtime.script_probe("db", vec![ProbeStep::Fail]);
        let stack = StackHandle::load(
            Stack::new("shop")
                .service(
                    Service::new("db", "postgres:16")
                        .replicas(2)
                        .healthcheck(fast_probe(3)),
                )
                .service(Service::new("web", "web:1").depends_on("db", Gate::Healthy)),
        )
        .unwrap();

        orchestrator(&runtime)
            .up(&stack, &CancelToken::new())
            .await
            .unwrap();

        let web = runtime.position(&started("shop-web-1")).unwrap();
        assert!(web > runtime.position(&probed("shop-db-1", true)).unwrap());
        assert!(web > runtime.position(&probed("shop-db-2", true)).unwrap());
    }
}
