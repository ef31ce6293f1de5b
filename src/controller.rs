use crate::config::{Config, DeploymentTarget, Image};
use crate::error::{Error, ErrorKind, Result};
use crate::inspector::DeploymentInspector;
use crate::registry::DigestResolver;
use crate::state::ControllerState;
use crate::tracker::Observation;
use futures::future::join_all;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, info, warn};

/// What the sync step did for one deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    InSync,
    Restarted,
    RestartFailed,
    /// No ready pod could be inspected, typically during a rollout.
    NotReady,
    InspectFailed,
}

#[derive(Debug)]
pub struct ImageReport {
    pub key: String,
    pub digest: String,
    pub observation: Observation,
    /// `namespace/name` of every matching deployment with its sync outcome.
    pub syncs: Vec<(String, SyncOutcome)>,
}

pub struct Controller<R, I> {
    config: Arc<Config>,
    resolver: R,
    inspector: I,
    state: Arc<ControllerState>,
}

impl<R, I> Controller<R, I>
where
    R: DigestResolver,
    I: DeploymentInspector,
{
    pub fn new(config: Arc<Config>, resolver: R, inspector: I, state: Arc<ControllerState>) -> Self {
        Controller {
            config,
            resolver,
            inspector,
            state,
        }
    }

    /// Runs one cycle immediately and then one per `checkInterval` until `shutdown` fires.
    /// Always ends with [`Error::Cancelled`], which callers treat as a clean stop.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(
            "Starting controller for {} images and {} deployments, checking every {:?}",
            self.config.images.len(),
            self.config.deployments.len(),
            self.config.check_interval
        );

        let mut ticker = tokio::time::interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if shutdown.is_cancelled() {
                break;
            }
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if shutdown.is_cancelled() {
                break;
            }

            let results = self.check_cycle(&shutdown).await;
            log_cycle_summary(&results);
            self.state.mark_cycle_completed();
        }

        info!("Controller stopping");
        Err(Error::Cancelled)
    }

    /// Checks every configured image concurrently and waits for all of them.
    pub async fn check_cycle(&self, shutdown: &CancellationToken) -> Vec<Result<ImageReport>> {
        info!("Checking {} images for digest changes", self.config.images.len());

        let checks = self.config.images.iter().map(|image| async move {
            let result = tokio::select! {
                biased;
                _ = shutdown.cancelled() => Err(Error::Cancelled),
                result = self.check_image(image) => result,
            };
            if let Err(err) = &result {
                log_image_error(image, err);
            }
            result
        });

        join_all(checks).await
    }

    async fn check_image(&self, image: &Image) -> Result<ImageReport> {
        let key = image.key();
        let registry =
            self.config
                .find_registry(&image.registry)
                .ok_or_else(|| Error::RegistryNotFound {
                    image: key.clone(),
                    registry: image.registry.clone(),
                })?;

        let digest = self.resolver.resolve(image, registry).await?;

        // each image key has a single writer per cycle
        let tracker = self.state.tracker();
        let observation = Observation::between(tracker.get(&key), &digest);
        tracker.set(&key, &digest);
        match &observation {
            Observation::First => info!("Initial digest for {}: {}", key, digest),
            Observation::Changed { previous } => {
                info!("Digest changed for {}: {} -> {}", key, previous, digest)
            }
            Observation::Unchanged => debug!("No change for {} (digest {})", key, digest),
        }

        // Deployments are synced on every cycle, so drift is repaired even when the registry is quiet.
        let mut syncs = Vec::new();
        for deployment in self.config.deployments_for(image) {
            let outcome = self.sync_deployment(deployment, &digest).await;
            syncs.push((
                format!("{}/{}", deployment.namespace, deployment.name),
                outcome,
            ));
        }

        Ok(ImageReport {
            key,
            digest,
            observation,
            syncs,
        })
    }

    async fn sync_deployment(&self, deployment: &DeploymentTarget, digest: &str) -> SyncOutcome {
        let DeploymentTarget {
            name,
            namespace,
            container,
            ..
        } = deployment;

        let running = match self
            .inspector
            .current_running_digest(namespace, name, container)
            .await
        {
            Ok(running) => running,
            Err(err) if err.is_not_ready() => {
                info!(
                    "Skipping deployment {}/{} container {} until next check: {}",
                    namespace, name, container, err
                );
                return SyncOutcome::NotReady;
            }
            Err(err) => {
                warn!(
                    "Failed to inspect deployment {}/{} container {}: {}",
                    namespace, name, container, err
                );
                return SyncOutcome::InspectFailed;
            }
        };

        if running.ends_with(digest) {
            debug!(
                "Deployment {}/{} container {} is up to date with {}",
                namespace, name, container, digest
            );
            return SyncOutcome::InSync;
        }

        info!(
            "Deployment {}/{} container {} runs {}, registry has {}. Triggering rollout restart",
            namespace, name, container, running, digest
        );
        match self.inspector.rollout_restart(namespace, name).await {
            Ok(()) => {
                info!(
                    "Successfully triggered rollout for deployment {}/{}",
                    namespace, name
                );
                SyncOutcome::Restarted
            }
            Err(err) => {
                warn!("Failed to restart deployment {}/{}: {}", namespace, name, err);
                SyncOutcome::RestartFailed
            }
        }
    }
}

fn log_cycle_summary(results: &[Result<ImageReport>]) {
    let mut failed = 0;
    let mut restarted = 0;
    for result in results {
        match result {
            Ok(report) => {
                debug!(
                    "{} resolved to {} ({:?}), deployments: {:?}",
                    report.key, report.digest, report.observation, report.syncs
                );
                restarted += report
                    .syncs
                    .iter()
                    .filter(|(_, outcome)| *outcome == SyncOutcome::Restarted)
                    .count();
            }
            Err(_) => failed += 1,
        }
    }
    info!(
        "Check finished: {} images checked, {} failed, {} deployments restarted",
        results.len(),
        failed,
        restarted
    );
}

fn log_image_error(image: &Image, err: &Error) {
    let key = image.key();
    let message = match err.kind() {
        ErrorKind::Cancelled => format!("Check of {} cancelled", key),
        ErrorKind::Configuration => format!("Skipping image {}: {}", key, err),
        ErrorKind::Protocol | ErrorKind::Transport => {
            format!("Failed to resolve digest for {}: {}", key, err)
        }
        ErrorKind::KubeRead | ErrorKind::KubeWrite => format!("Failed to check {}: {}", key, err),
    };
    if image_error_level(err.kind()) == Level::DEBUG {
        debug!("{}", message);
    } else {
        warn!("{}", message);
    }
}

/// Per-image failures never stop the loop, so none of them is logged above `warn`.
fn image_error_level(kind: ErrorKind) -> Level {
    match kind {
        ErrorKind::Cancelled => Level::DEBUG,
        _ => Level::WARN,
    }
}
