//! Health monitor
//!
//! One task per watched instance drives a [`ProbeMachine`] against the
//! runtime driver and reports the outcome through a [`WatchHandle`].

use super::probe::{CheckResult, HealthOutcome, ProbeMachine, ProbeState};
use crate::cancel::CancelToken;
use crate::driver::{RuntimeDriver, RuntimeHandle};
use crate::orchestrator::{InstanceEvent, InstanceState};
use crate::stack::HealthProbe;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Capacity of the event channel created by [`HealthMonitor::standalone`]
const EVENT_CAPACITY: usize = 256;

/// Spawns and tracks health watches
#[derive(Clone)]
pub struct HealthMonitor {
    driver: Arc<dyn RuntimeDriver>,
    events: broadcast::Sender<InstanceEvent>,
}

impl HealthMonitor {
    /// Create a monitor publishing transitions on `events`
    pub fn new(driver: Arc<dyn RuntimeDriver>, events: broadcast::Sender<InstanceEvent>) -> Self {
        Self { driver, events }
    }

    /// Create a monitor with its own event channel
    pub fn standalone(driver: Arc<dyn RuntimeDriver>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self::new(driver, events)
    }

    /// Subscribe to the transitions this monitor publishes
    pub fn subscribe(&self) -> broadcast::Receiver<InstanceEvent> {
        self.events.subscribe()
    }

    /// Start watching a running instance
    pub fn watch(&self, service: &str, handle: RuntimeHandle, probe: HealthProbe) -> WatchHandle {
        let cancel = CancelToken::new();
        let instance = handle.instance.clone();

        let task = tokio::spawn(run_watch(
            self.driver.clone(),
            self.events.clone(),
            service.to_string(),
            handle,
            probe,
            cancel.clone(),
        ));

        WatchHandle {
            instance,
            cancel,
            task,
        }
    }
}

/// A running watch
pub struct WatchHandle {
    instance: String,
    cancel: CancelToken,
    task: JoinHandle<HealthOutcome>,
}

impl WatchHandle {
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Stop the watch; its outcome becomes `Cancelled` unless already resolved
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this watch
    pub fn canceller(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Wait for the watch to resolve
    pub async fn outcome(self) -> HealthOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(instance = %self.instance, "health watch task failed: {}", e);
                HealthOutcome::Cancelled
            }
        }
    }
}

async fn run_watch(
    driver: Arc<dyn RuntimeDriver>,
    events: broadcast::Sender<InstanceEvent>,
    service: String,
    handle: RuntimeHandle,
    probe: HealthProbe,
    cancel: CancelToken,
) -> HealthOutcome {
    let mut machine = ProbeMachine::new(&probe);
    publish(&events, &handle.instance, &service, InstanceState::HealthChecking);

    loop {
        let delay = machine.next_delay();
        tokio::select! {
            _ = cancel.cancelled() => {
                machine.cancel();
                break;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        if !machine.begin_check() {
            break;
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                machine.cancel();
                break;
            }
            result = tokio::time::timeout(probe.timeout, driver.probe(&handle, &probe.command)) => {
                match result {
                    Ok(Ok(status)) if status.success() => CheckResult::Pass,
                    Ok(Ok(status)) => CheckResult::Fail(format!(
                        "exit code {}: {}",
                        status.code,
                        status.output.trim()
                    )),
                    Ok(Err(e)) => CheckResult::Fail(e.to_string()),
                    Err(_) => CheckResult::TimedOut,
                }
            }
        };

        tracing::debug!(
            instance = %handle.instance,
            check = machine.checks() + 1,
            passed = result == CheckResult::Pass,
            "health check"
        );

        if let ProbeState::Resolved(_) = machine.record(result) {
            break;
        }
    }

    let outcome = machine
        .outcome()
        .cloned()
        .unwrap_or(HealthOutcome::Cancelled);

    match &outcome {
        HealthOutcome::Healthy { checks } => {
            tracing::info!("{} is healthy after {} check(s)", handle.instance, checks);
            publish(&events, &handle.instance, &service, InstanceState::Healthy);
        }
        HealthOutcome::Unhealthy { checks, last_error } => {
            tracing::warn!(
                "{} is unhealthy after {} check(s): {}",
                handle.instance,
                checks,
                last_error
            );
            publish(&events, &handle.instance, &service, InstanceState::Unhealthy);
        }
        HealthOutcome::Cancelled => {
            tracing::debug!(instance = %handle.instance, "health watch cancelled");
        }
    }

    outcome
}

fn publish(
    events: &broadcast::Sender<InstanceEvent>,
    instance: &str,
    service: &str,
    state: InstanceState,
) {
    // No subscribers is fine
    let _ = events.send(InstanceEvent {
        instance: instance.to_string(),
        service: service.to_string(),
        state,
        at: Utc::now(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{ImageRef, InstanceSpec, MemoryRuntime, ProbeStep};
    use std::collections::BTreeMap;
    use std::time::Duration;

    async fn started(runtime: &MemoryRuntime, service: &str) -> RuntimeHandle {
        let spec = InstanceSpec {
            id: format!("t-{}-1", service),
            service: service.to_string(),
            replica: 1,
            image: ImageRef {
                reference: "img".into(),
                digest: "sha256:0".into(),
            },
            command: None,
            environment: BTreeMap::new(),
            ports: Vec::new(),
            mounts: Vec::new(),
            labels: BTreeMap::new(),
        };
        runtime.start(&spec, &[]).await.unwrap()
    }

    fn fast_probe(retries: u32) -> HealthProbe {
        HealthProbe::new(vec!["true".into()])
            .interval(Duration::from_millis(5))
            .timeout(Duration::from_millis(50))
            .retries(retries)
    }

    #[tokio::test]
    async fn test_healthy_on_the_first_passing_check() {
        let runtime = MemoryRuntime::new();
        runtime.script_probe("db", vec![ProbeStep::Fail, ProbeStep::Fail]);
        let handle = started(&runtime, "db").await;

        let monitor = HealthMonitor::standalone(Arc::new(runtime.clone()));
        let outcome = monitor.watch("db", handle, fast_probe(3)).outcome().await;

        assert_eq!(outcome, HealthOutcome::Healthy { checks: 3 });
        assert_eq!(runtime.probe_count("t-db-1"), 3);
    }

    #[tokio::test]
    async fn test_exhausted_budget_is_unhealthy() {
        let runtime = MemoryRuntime::new();
        runtime.script_probe("db", vec![ProbeStep::Fail; 5]);
        let handle = started(&runtime, "db").await;

        let monitor = HealthMonitor::standalone(Arc::new(runtime.clone()));
        let outcome = monitor.watch("db", handle, fast_probe(2)).outcome().await;

        assert!(matches!(outcome, HealthOutcome::Unhealthy { checks: 2, .. }));
        assert_eq!(runtime.probe_count("t-db-1"), 2);
    }

    #[tokio::test]
    async fn test_hanging_probe_counts_as_failure() {
        let runtime = MemoryRuntime::new();
        runtime.script_probe("api", vec![ProbeStep::Hang]);
        let handle = started(&runtime, "api").await;

        let monitor = HealthMonitor::standalone(Arc::new(runtime.clone()));
        let outcome = monitor.watch("api", handle, fast_probe(2)).outcome().await;

        assert_eq!(outcome, HealthOutcome::Healthy { checks: 2 });

        let runtime = MemoryRuntime::new();
        runtime.script_probe("api", vec![ProbeStep::Hang]);
        let handle = started(&runtime, "api").await;
        let monitor = HealthMonitor::standalone(Arc::new(runtime.clone()));
        match monitor.watch("api", handle, fast_probe(1)).outcome().await {
            HealthOutcome::Unhealthy { last_error, .. } => assert!(last_error.contains("timed out")),
            other => panic!("expected unhealthy, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_resolves_cancelled() {
        let runtime = MemoryRuntime::new();
        let handle = started(&runtime, "web").await;

        let monitor = HealthMonitor::standalone(Arc::new(runtime.clone()));
        let probe = fast_probe(3).start_period(Duration::from_secs(60));
        let watch = monitor.watch("web", handle, probe);
        watch.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(1), watch.outcome())
            .await
            .unwrap();
        assert_eq!(outcome, HealthOutcome::Cancelled);
        assert_eq!(runtime.probe_count("t-web-1"), 0);
    }

    #[tokio::test]
    async fn test_transitions_are_published() {
        let runtime = MemoryRuntime::new();
        let handle = started(&runtime, "db").await;

        let monitor = HealthMonitor::standalone(Arc::new(runtime.clone()));
        let mut events = monitor.subscribe();
        monitor.watch("db", handle, fast_probe(1)).outcome().await;

        assert_eq!(events.recv().await.unwrap().state, InstanceState::HealthChecking);
        let healthy = events.recv().await.unwrap();
        assert_eq!(healthy.state, InstanceState::Healthy);
        assert_eq!(healthy.instance, "t-db-1");
    }
}
