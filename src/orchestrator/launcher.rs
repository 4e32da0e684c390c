//! Instance start and stop with restart-policy retries

use crate::config::OrchestratorConfig;
use crate::driver::{
    AttachedResource, ImageProvider, ImageRef, InstanceSpec, RuntimeDriver, RuntimeHandle,
};
use crate::error::{DriverError, FailureCause};
use crate::resource::{AttachmentHandle, ResourceRegistry};
use crate::stack::{ImageSource, RestartPolicy};
use std::sync::Arc;
use std::time::Duration;

/// A successful start
#[derive(Debug, Clone)]
pub(crate) struct Launched {
    pub handle: RuntimeHandle,
    pub attempts: u32,
}

/// Driver access shared by foreground starts and background restart loops
#[derive(Clone)]
pub(crate) struct Launcher {
    images: Arc<dyn ImageProvider>,
    driver: Arc<dyn RuntimeDriver>,
    resources: Arc<ResourceRegistry>,
    restart_delay: Duration,
    stop_timeout: Duration,
    default_max_retries: u32,
    always_max_attempts: Option<u32>,
}

impl Launcher {
    pub fn new(
        images: Arc<dyn ImageProvider>,
        driver: Arc<dyn RuntimeDriver>,
        resources: Arc<ResourceRegistry>,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            images,
            driver,
            resources,
            restart_delay: config.restart_delay,
            stop_timeout: config.stop_timeout,
            default_max_retries: config.default_max_retries,
            always_max_attempts: config.always_max_attempts,
        }
    }

    /// Start attempts allowed by a policy; `None` is unbounded
    pub fn start_attempts(&self, policy: RestartPolicy) -> Option<u32> {
        match policy {
            RestartPolicy::Never => Some(1),
            RestartPolicy::OnFailure { max_retries } => {
                Some(max_retries.unwrap_or(self.default_max_retries).saturating_add(1))
            }
            RestartPolicy::Always => self.always_max_attempts,
        }
    }

    /// Image resolution attempts; nothing can run without an image, so
    /// `always` falls back to the `on-failure` budget when uncapped
    fn image_attempts(&self, policy: RestartPolicy) -> u32 {
        self.start_attempts(policy)
            .unwrap_or(self.default_max_retries.saturating_add(1))
    }

    /// Resolve a service image, retrying per policy
    pub async fn resolve(
        &self,
        service: &str,
        source: &ImageSource,
        policy: RestartPolicy,
    ) -> Result<ImageRef, FailureCause> {
        let max = self.image_attempts(policy);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.images.resolve(source).await {
                Ok(image) => {
                    tracing::debug!(service, image = %image.reference, digest = %image.digest, "image resolved");
                    return Ok(image);
                }
                Err(e) if attempt >= max => {
                    tracing::error!("Image for {} unavailable: {}", service, e);
                    return Err(FailureCause::Image(e));
                }
                Err(e) => {
                    tracing::warn!(
                        "Resolving image for {} failed (attempt {}/{}): {}",
                        service,
                        attempt,
                        max,
                        e
                    );
                    tokio::time::sleep(self.restart_delay).await;
                }
            }
        }
    }

    /// Attach every registry-managed resource of an instance. On failure
    /// the attachments made so far are released.
    pub async fn attach_all(
        &self,
        instance: &str,
        resources: &[AttachedResource],
    ) -> Result<Vec<AttachmentHandle>, FailureCause> {
        let mut handles: Vec<AttachmentHandle> = Vec::with_capacity(resources.len());
        for resource in resources {
            // A volume mounted at two targets is still one attachment
            if handles
                .iter()
                .any(|h| h.name() == resource.name && h.kind() == resource.kind)
            {
                continue;
            }
            match self
                .resources
                .attach(&resource.name, resource.kind, instance)
                .await
            {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    self.detach_all(handles).await;
                    return Err(FailureCause::Resource(e));
                }
            }
        }
        Ok(handles)
    }

    /// Release attachments, logging failures
    pub async fn detach_all(&self, handles: Vec<AttachmentHandle>) {
        for handle in handles {
            if let Err(e) = self.resources.detach(handle).await {
                tracing::warn!("Failed to detach: {}", e);
            }
        }
    }

    /// Start an instance, retrying failed starts up to `max_attempts`
    pub async fn launch(
        &self,
        spec: InstanceSpec,
        resources: Vec<AttachedResource>,
        max_attempts: Option<u32>,
    ) -> Result<Launched, FailureCause> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.driver.start(&spec, &resources).await {
                Ok(handle) => {
                    tracing::info!(
                        instance = %spec.id,
                        runtime_id = %handle.id,
                        attempt,
                        "Started {}",
                        spec.id
                    );
                    return Ok(Launched {
                        handle,
                        attempts: attempt,
                    });
                }
                Err(error) if max_attempts.is_some_and(|max| attempt >= max) => {
                    tracing::error!("Failed to start {}: {}", spec.id, error);
                    return Err(FailureCause::Start {
                        attempts: attempt,
                        error,
                    });
                }
                Err(error) => {
                    tracing::warn!(
                        "Start of {} failed (attempt {}), retrying in {:?}: {}",
                        spec.id,
                        attempt,
                        self.restart_delay,
                        error
                    );
                    tokio::time::sleep(self.restart_delay).await;
                }
            }
        }
    }

    /// Stop an instance within the configured stop timeout
    pub async fn stop(&self, handle: &RuntimeHandle) -> Result<(), DriverError> {
        match tokio::time::timeout(self.stop_timeout, self.driver.stop(handle)).await {
            Ok(result) => result,
            Err(_) => Err(DriverError::Timeout(format!(
                "{} did not stop within {:?}",
                handle.instance, self.stop_timeout
            ))),
        }
    }
}
