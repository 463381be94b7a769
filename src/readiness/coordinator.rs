//! Readiness coordinator
//!
//! Owns the single acquisition workflow of the process. Callers ask for a model
//! with [`ReadinessCoordinator::request_ready`]; concurrent callers for the same
//! model attach to the attempt already in flight and all receive the same
//! [`Outcome`]. Each attempt runs in its own task:
//!
//! 1. check the cache and validate every candidate directory
//! 2. wait while another process is downloading the model
//! 3. remove corrupted files and interrupted-download markers
//! 4. download, then validate the result
//! 5. retry recoverable failures with a linear backoff
//!
//! Every attempt carries a generation number. `reset` bumps it, so transitions
//! from a superseded attempt are dropped instead of overwriting fresh state.
//! Filesystem work runs on the blocking pool and never under the state lock.

use super::state::{
    FailureClass, Outcome, ReadinessFailure, ReadinessSnapshot, ReadinessState, ReadyModel,
};
use crate::error::{CacheError, CacheResult};
use crate::models::descriptor::{ModelDescriptor, ModelId};
use crate::models::download::{Downloader, ProgressReporter};
use crate::models::external::ExternalActivityDetector;
use crate::models::janitor::{CacheJanitor, CleanupReport};
use crate::models::locator::{CacheLocator, ResolvedModelDirectory};
use crate::models::validator::{self, ArtifactProblem, ValidationResult};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::futures::Notified;
use tokio::sync::{Notify, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Coordinator tuning
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Model probed by `is_ready_now` before anything was requested
    pub default_model: ModelId,
    /// How long an `is_ready_now` answer is reused
    pub ready_debounce: Duration,
    /// Poll interval while an external download is active
    pub external_poll_interval: Duration,
    /// Upper bound on waiting for external downloads within one workflow
    pub external_wait_timeout: Duration,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Backoff unit; attempt `n` sleeps `n * retry_backoff`
    pub retry_backoff: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_model: ModelId::Qwen3_0_6B,
            ready_debounce: Duration::from_millis(1500),
            external_poll_interval: Duration::from_secs(2),
            external_wait_timeout: Duration::from_secs(300),
            max_retries: 2,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

type OutcomeSlot = watch::Sender<Option<Outcome>>;

/// The attempt currently in flight
struct Flight {
    model: ModelId,
    generation: u64,
    outcome: Arc<OutcomeSlot>,
    cancel: CancellationToken,
}

struct ReadyProbe {
    model: ModelId,
    ready: bool,
    checked_at: Instant,
}

struct Inner {
    generation: u64,
    model: Option<ModelId>,
    state: ReadinessState,
    attempt: u32,
    flight: Option<Flight>,
    last_outcome: Option<(ModelId, Outcome)>,
    probe: Option<ReadyProbe>,
}

enum RequestPlan {
    Done(Outcome),
    /// `own` is false when the flight belongs to another model
    Attach {
        rx: watch::Receiver<Option<Outcome>>,
        own: bool,
    },
}

enum WaitPlan {
    Done(Outcome),
    Attach(watch::Receiver<Option<Outcome>>),
    Park,
}

enum CacheCheck {
    Ready(ResolvedModelDirectory),
    Missing,
    Invalid {
        resolved: ResolvedModelDirectory,
        problem: ArtifactProblem,
    },
}

struct Shared {
    config: CoordinatorConfig,
    locator: Arc<CacheLocator>,
    detector: Arc<ExternalActivityDetector>,
    janitor: Arc<CacheJanitor>,
    downloader: Arc<dyn Downloader>,
    inner: Mutex<Inner>,
    snapshots: watch::Sender<ReadinessSnapshot>,
    progress: Arc<watch::Sender<f32>>,
    flight_started: Notify,
    /// Held by acquisition and cleanup so they never touch the cache together
    filesystem: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
}

/// Single source of truth for model readiness
#[derive(Clone)]
pub struct ReadinessCoordinator {
    shared: Arc<Shared>,
}

impl ReadinessCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        locator: Arc<CacheLocator>,
        detector: Arc<ExternalActivityDetector>,
        downloader: Arc<dyn Downloader>,
    ) -> Self {
        let inner = Inner {
            generation: 0,
            model: None,
            state: ReadinessState::NotStarted,
            attempt: 0,
            flight: None,
            last_outcome: None,
            probe: None,
        };
        let (snapshots, _) = watch::channel(ReadinessSnapshot {
            generation: 0,
            model: None,
            state: ReadinessState::NotStarted,
            attempt: 0,
            progress: 0.0,
            ready_path: None,
            updated_at: chrono::Utc::now(),
        });
        let (progress, _) = watch::channel(0.0);

        Self {
            shared: Arc::new(Shared {
                config,
                locator,
                janitor: Arc::new(CacheJanitor::new(Arc::clone(&detector))),
                detector,
                downloader,
                inner: Mutex::new(inner),
                snapshots,
                progress: Arc::new(progress),
                flight_started: Notify::new(),
                filesystem: tokio::sync::Mutex::new(()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.shared.config
    }

    pub fn locator(&self) -> &Arc<CacheLocator> {
        &self.shared.locator
    }

    pub fn janitor(&self) -> &CacheJanitor {
        &self.shared.janitor
    }

    /// Make `descriptor` ready, starting or joining the acquisition workflow
    ///
    /// A terminal outcome for the same model is returned as-is until
    /// [`reset`](Self::reset). A request for another model waits for the
    /// current attempt to finish and then starts its own.
    pub async fn request_ready(&self, descriptor: &ModelDescriptor) -> Outcome {
        let model = descriptor.id;
        loop {
            match self.shared.plan_request(model) {
                RequestPlan::Done(outcome) => return outcome,
                RequestPlan::Attach { mut rx, own } => {
                    let outcome = await_outcome(&mut rx).await;
                    if own {
                        return outcome;
                    }
                    tracing::debug!(model = %model, "Previous acquisition finished, starting requested model");
                }
            }
        }
    }

    /// Wait for the outcome of the current or next acquisition
    ///
    /// When nothing has been requested yet this parks until a request starts.
    pub async fn wait(&self) -> Outcome {
        loop {
            let notified = self.shared.flight_started.notified();
            tokio::pin!(notified);

            match self.shared.plan_wait(notified.as_mut()) {
                WaitPlan::Done(outcome) => return outcome,
                WaitPlan::Attach(mut rx) => return await_outcome(&mut rx).await,
                WaitPlan::Park => {
                    tokio::select! {
                        _ = notified.as_mut() => {}
                        _ = self.shared.shutdown.cancelled() => {
                            return Err(ReadinessFailure::cancelled(0));
                        }
                    }
                }
            }
        }
    }

    /// Cheap readiness probe for UI polling
    ///
    /// Checks only that the required files of the active (or default) model
    /// exist; contents are validated by the acquisition workflow. Answers are
    /// reused for `ready_debounce`.
    pub fn is_ready_now(&self) -> bool {
        let shared = &self.shared;
        let model = {
            let inner = shared.lock();
            let model = inner.model.unwrap_or(shared.config.default_model);
            if let Some(probe) = &inner.probe
                && probe.model == model
                && probe.checked_at.elapsed() < shared.config.ready_debounce
            {
                return probe.ready;
            }
            model
        };

        let descriptor = model.descriptor();
        let ready = shared
            .locator
            .locate_all(descriptor)
            .iter()
            .any(|resolved| validator::files_exist(&resolved.snapshot_dir, descriptor.required_files));

        shared.lock().probe = Some(ReadyProbe {
            model,
            ready,
            checked_at: Instant::now(),
        });
        crate::metrics::update_ready(ready);
        ready
    }

    /// Cancel any attempt and return to `NotStarted`
    ///
    /// Waiters of the cancelled attempt receive a cancelled failure.
    pub fn reset(&self) {
        let shared = &self.shared;
        {
            let mut inner = shared.lock();
            let attempts = inner.attempt;
            if let Some(flight) = inner.flight.take() {
                tracing::info!(
                    model = %flight.model,
                    generation = flight.generation,
                    "Cancelling in-flight acquisition"
                );
                flight.cancel.cancel();
                resolve_slot(&flight.outcome, Err(ReadinessFailure::cancelled(attempts)));
            }
            inner.generation += 1;
            inner.state = ReadinessState::NotStarted;
            inner.attempt = 0;
            inner.last_outcome = None;
            inner.probe = None;
            shared.progress.send_replace(0.0);
            shared.publish(&inner);
        }

        shared.locator.invalidate();
        shared.detector.invalidate();
        tracing::info!("Readiness state reset");
    }

    /// Reset, then clean every cache root
    pub async fn clear_cache(&self) -> CleanupReport {
        self.reset();

        let shared = &self.shared;
        let _guard = shared.filesystem.lock().await;
        let locator = Arc::clone(&shared.locator);
        let janitor = Arc::clone(&shared.janitor);

        let report = shared
            .blocking(move || {
                let mut report = CleanupReport::default();
                for root in locator.list_cache_roots() {
                    report.merge(janitor.cleanup_all(&root));
                }
                report
            })
            .await
            .unwrap_or_else(|e| {
                tracing::error!(error = %e, "Cache cleanup task failed");
                CleanupReport::default()
            });

        shared.locator.invalidate();
        report
    }

    /// Cancel everything; waiters resolve as cancelled and later requests fail fast
    pub fn shutdown(&self) {
        let shared = &self.shared;
        shared.shutdown.cancel();

        let mut inner = shared.lock();
        if let Some(flight) = inner.flight.take() {
            let cancelled: Outcome = Err(ReadinessFailure::cancelled(inner.attempt));
            resolve_slot(&flight.outcome, cancelled.clone());
            inner.state = ReadinessState::Failed {
                class: FailureClass::Cancelled,
                retrying: false,
            };
            inner.last_outcome = Some((flight.model, cancelled));
            shared.publish(&inner);
        }
        drop(inner);

        tracing::info!("Readiness coordinator shut down");
    }

    pub fn snapshot(&self) -> ReadinessSnapshot {
        let inner = self.shared.lock();
        self.shared.build_snapshot(&inner)
    }

    /// Receiver updated on every state transition
    pub fn subscribe(&self) -> watch::Receiver<ReadinessSnapshot> {
        self.shared.snapshots.subscribe()
    }

    /// Snapshot directory of the model that last became ready
    pub fn ready_directory(&self) -> Option<PathBuf> {
        match &self.shared.lock().last_outcome {
            Some((_, Ok(ready))) => Some(ready.path.clone()),
            _ => None,
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn build_snapshot(&self, inner: &Inner) -> ReadinessSnapshot {
        ReadinessSnapshot {
            generation: inner.generation,
            model: inner.model,
            state: inner.state,
            attempt: inner.attempt,
            progress: *self.progress.borrow(),
            ready_path: match &inner.last_outcome {
                Some((_, Ok(ready))) => Some(ready.path.clone()),
                _ => None,
            },
            updated_at: chrono::Utc::now(),
        }
    }

    fn publish(&self, inner: &Inner) {
        self.snapshots.send_replace(self.build_snapshot(inner));
    }

    fn plan_request(self: &Arc<Self>, model: ModelId) -> RequestPlan {
        let mut inner = self.lock();

        if self.shutdown.is_cancelled() {
            return RequestPlan::Done(Err(ReadinessFailure::cancelled(inner.attempt)));
        }
        if let Some((last, outcome)) = &inner.last_outcome
            && *last == model
        {
            return RequestPlan::Done(outcome.clone());
        }
        if let Some(flight) = &inner.flight {
            return RequestPlan::Attach {
                rx: flight.outcome.subscribe(),
                own: flight.model == model,
            };
        }

        RequestPlan::Attach {
            rx: self.start_flight(&mut inner, model),
            own: true,
        }
    }

    fn plan_wait(&self, notified: Pin<&mut Notified<'_>>) -> WaitPlan {
        let inner = self.lock();

        if self.shutdown.is_cancelled() {
            return WaitPlan::Done(Err(ReadinessFailure::cancelled(inner.attempt)));
        }
        if let Some(flight) = &inner.flight {
            return WaitPlan::Attach(flight.outcome.subscribe());
        }
        if let Some((_, outcome)) = &inner.last_outcome {
            return WaitPlan::Done(outcome.clone());
        }

        // Registered before the lock is released so a flight started right
        // after cannot be missed
        notified.enable();
        WaitPlan::Park
    }

    fn start_flight(
        self: &Arc<Self>,
        inner: &mut Inner,
        model: ModelId,
    ) -> watch::Receiver<Option<Outcome>> {
        inner.generation += 1;
        let generation = inner.generation;
        let (tx, rx) = watch::channel(None);
        let slot = Arc::new(tx);
        let cancel = self.shutdown.child_token();

        inner.model = Some(model);
        inner.attempt = 0;
        inner.last_outcome = None;
        inner.probe = None;
        inner.state = ReadinessState::CheckingCache;
        inner.flight = Some(Flight {
            model,
            generation,
            outcome: Arc::clone(&slot),
            cancel: cancel.clone(),
        });
        self.progress.send_replace(0.0);
        self.publish(inner);
        self.flight_started.notify_waiters();

        tracing::info!(model = %model, generation, "Starting model acquisition");
        crate::metrics::record_acquisition_started(model);

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let result = AssertUnwindSafe(shared.acquire(model, generation, cancel))
                .catch_unwind()
                .await;
            let outcome = result.unwrap_or_else(|_| {
                tracing::error!(model = %model, generation, "Acquisition task panicked");
                Err(ReadinessFailure::new(
                    FailureClass::Generic,
                    CacheError::Io {
                        message: "acquisition task panicked".to_string(),
                    },
                    0,
                ))
            });
            shared.finish(model, generation, &slot, outcome);
        });

        rx
    }

    fn finish(&self, model: ModelId, generation: u64, slot: &OutcomeSlot, outcome: Outcome) {
        let mut inner = self.lock();
        let current = inner
            .flight
            .as_ref()
            .is_some_and(|flight| flight.generation == generation);

        if !current {
            // Reset or shutdown already answered the waiters
            resolve_slot(slot, outcome);
            return;
        }

        inner.flight = None;
        inner.probe = None;
        inner.state = match &outcome {
            Ok(_) => ReadinessState::Ready,
            Err(failure) => ReadinessState::Failed {
                class: failure.class,
                retrying: false,
            },
        };
        inner.last_outcome = Some((model, outcome.clone()));
        resolve_slot(slot, outcome.clone());
        self.publish(&inner);
        drop(inner);

        match &outcome {
            Ok(ready) => {
                tracing::info!(model = %model, path = ?ready.path, "Model is ready");
                crate::metrics::record_outcome(model, None);
            }
            Err(failure) => {
                tracing::warn!(
                    model = %model,
                    class = failure.class.category(),
                    attempts = failure.attempts,
                    error = %failure.error,
                    "Model acquisition failed"
                );
                crate::metrics::record_outcome(model, Some(failure.class));
            }
        }
    }

    /// Apply `state` if `generation` is still the flight in progress
    fn transition(&self, generation: u64, attempt: u32, state: ReadinessState) -> bool {
        let mut inner = self.lock();
        let model = match inner.flight.as_ref() {
            Some(flight) if flight.generation == generation => flight.model,
            _ => return false,
        };
        inner.state = state;
        inner.attempt = attempt;
        self.publish(&inner);
        drop(inner);

        tracing::debug!(model = %model, state = %state, attempt, "Readiness state changed");
        crate::metrics::record_state_transition(model, &state);
        true
    }

    async fn blocking<T, F>(&self, f: F) -> CacheResult<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| CacheError::Io {
                message: format!("filesystem task failed: {}", e),
            })
    }

    async fn acquire(
        &self,
        model: ModelId,
        generation: u64,
        cancel: CancellationToken,
    ) -> Outcome {
        let descriptor = model.descriptor();
        let _guard = tokio::select! {
            _ = cancel.cancelled() => return Err(ReadinessFailure::cancelled(0)),
            guard = self.filesystem.lock() => guard,
        };

        let max_attempts = self.config.max_retries.saturating_add(1);
        let mut attempt: u32 = 1;
        let mut external_deadline: Option<tokio::time::Instant> = None;
        let mut external_expired = false;

        loop {
            if !self.transition(generation, attempt, ReadinessState::CheckingCache) {
                return Err(ReadinessFailure::cancelled(attempt));
            }

            let check = match self.check_cache(descriptor).await {
                Ok(check) => check,
                Err(e) => return Err(ReadinessFailure::new(FailureClass::Generic, e, attempt)),
            };

            let invalid = match check {
                CacheCheck::Ready(resolved) => {
                    tracing::info!(
                        model = %model,
                        path = ?resolved.snapshot_dir,
                        snapshot = %resolved.snapshot_id,
                        "Found valid cached model"
                    );
                    return Ok(ReadyModel {
                        model,
                        path: resolved.snapshot_dir,
                    });
                }
                CacheCheck::Missing => None,
                CacheCheck::Invalid { resolved, problem } => {
                    let class = FailureClass::from_problem(&problem);
                    if !class.is_retryable() {
                        return Err(ReadinessFailure::new(class, problem.into(), attempt));
                    }
                    tracing::info!(
                        model = %model,
                        file = %problem.file,
                        reason = %problem.reason,
                        "Cached model is incomplete"
                    );
                    Some((resolved, problem))
                }
            };

            if !external_expired && self.external_active(descriptor).await {
                let deadline = *external_deadline.get_or_insert_with(|| {
                    tokio::time::Instant::now() + self.config.external_wait_timeout
                });
                match self
                    .wait_for_external(generation, attempt, descriptor, deadline, &cancel)
                    .await
                {
                    Ok(()) => continue,
                    Err(CacheError::Cancelled) => return Err(ReadinessFailure::cancelled(attempt)),
                    Err(e) => {
                        tracing::warn!(
                            model = %model,
                            timeout_secs = self.config.external_wait_timeout.as_secs(),
                            error = %e,
                            "Treating external download as abandoned, downloading ourselves"
                        );
                        external_expired = true;
                    }
                }
            }

            self.prepare_download(descriptor, invalid).await;

            let failure = match self
                .download_and_validate(model, generation, attempt, &cancel)
                .await
            {
                Ok(ready) => return Ok(ready),
                Err(failure) => failure,
            };

            if failure.is_cancelled() || !failure.class.is_retryable() {
                return Err(failure);
            }
            if attempt >= max_attempts {
                return Err(ReadinessFailure::new(
                    failure.class,
                    CacheError::RetryBudgetExhausted {
                        attempts: attempt,
                        last: Box::new(failure.error),
                    },
                    attempt,
                ));
            }

            tracing::warn!(
                model = %model,
                attempt,
                max_attempts,
                class = failure.class.category(),
                error = %failure.error,
                "Acquisition attempt failed, retrying"
            );
            crate::metrics::record_retry(model, failure.class);

            let retrying = ReadinessState::Failed {
                class: failure.class,
                retrying: true,
            };
            if !self.transition(generation, attempt, retrying) {
                return Err(ReadinessFailure::cancelled(attempt));
            }

            let backoff = self.config.retry_backoff * attempt;
            tokio::select! {
                _ = cancel.cancelled() => return Err(ReadinessFailure::cancelled(attempt)),
                _ = tokio::time::sleep(backoff) => {}
            }
            attempt += 1;
        }
    }

    async fn check_cache(
        &self,
        descriptor: &'static ModelDescriptor,
    ) -> CacheResult<CacheCheck> {
        let locator = Arc::clone(&self.locator);
        self.blocking(move || {
            let mut first_invalid = None;
            for resolved in locator.locate_all(descriptor) {
                match validator::validate(&resolved.snapshot_dir, descriptor.required_files) {
                    ValidationResult::Complete => return CacheCheck::Ready(resolved),
                    ValidationResult::Incomplete(problem) => {
                        if first_invalid.is_none() {
                            first_invalid = Some((resolved, problem));
                        }
                    }
                }
            }
            match first_invalid {
                Some((resolved, problem)) => CacheCheck::Invalid { resolved, problem },
                None => CacheCheck::Missing,
            }
        })
        .await
    }

    async fn external_active(&self, descriptor: &'static ModelDescriptor) -> bool {
        let detector = Arc::clone(&self.detector);
        self.blocking(move || detector.is_external_acquisition_active(descriptor))
            .await
            .unwrap_or(false)
    }

    async fn wait_for_external(
        &self,
        generation: u64,
        attempt: u32,
        descriptor: &'static ModelDescriptor,
        deadline: tokio::time::Instant,
        cancel: &CancellationToken,
    ) -> CacheResult<()> {
        if !self.transition(generation, attempt, ReadinessState::WaitingForExternalActivity) {
            return Err(CacheError::Cancelled);
        }
        tracing::info!(model = %descriptor.id, "External download in progress, waiting");

        let mut ticker = tokio::time::interval(self.config.external_poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Err(CacheError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => {
                    break Err(CacheError::ExternalActivityTimeout);
                }
                _ = ticker.tick() => {}
            }
            if !self.external_active(descriptor).await {
                break Ok(());
            }
        };

        match &result {
            Ok(()) => {
                crate::metrics::record_external_wait(descriptor.id, false);
                tracing::info!(model = %descriptor.id, "External download finished");
            }
            Err(CacheError::ExternalActivityTimeout) => {
                crate::metrics::record_external_wait(descriptor.id, true)
            }
            Err(_) => {}
        }
        result
    }

    /// Remove the corrupted file and any interrupted-download markers
    async fn prepare_download(
        &self,
        descriptor: &'static ModelDescriptor,
        invalid: Option<(ResolvedModelDirectory, ArtifactProblem)>,
    ) {
        let locator = Arc::clone(&self.locator);
        let janitor = Arc::clone(&self.janitor);

        let result = self
            .blocking(move || {
                let mut report = CleanupReport::default();
                if let Some((resolved, problem)) = invalid
                    && problem.is_corruption()
                {
                    report.merge(janitor.remove_artifact(&resolved.snapshot_dir, &problem.file));
                }
                for root in locator.list_cache_roots() {
                    let model_dir = root.join(descriptor.cache_dir_name);
                    if model_dir.is_dir() {
                        report.merge(janitor.cleanup_markers(&model_dir));
                    }
                }
                report
            })
            .await;

        match result {
            Ok(report) if !report.removed.is_empty() || !report.failed.is_empty() => {
                tracing::info!(
                    model = %descriptor.id,
                    removed = report.removed.len(),
                    failed = report.failed.len(),
                    "Cleaned cache before download"
                );
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(model = %descriptor.id, error = %e, "Pre-download cleanup failed"),
        }
    }

    async fn download_and_validate(
        &self,
        model: ModelId,
        generation: u64,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Result<ReadyModel, ReadinessFailure> {
        let descriptor = model.descriptor();
        if !self.transition(generation, attempt, ReadinessState::Downloading) {
            return Err(ReadinessFailure::cancelled(attempt));
        }

        tracing::info!(model = %model, repo = %descriptor.repo_id, attempt, "Downloading model");
        crate::metrics::record_download_started(model);
        self.progress.send_replace(0.0);

        let reporter = ProgressReporter::new(Arc::clone(&self.progress));
        let downloaded = tokio::select! {
            _ = cancel.cancelled() => return Err(ReadinessFailure::cancelled(attempt)),
            result = self.downloader.download(descriptor, reporter) => result,
        };

        let snapshot_dir = match downloaded {
            Ok(dir) => dir,
            Err(e) => {
                let class = FailureClass::from_download(&e);
                tracing::warn!(model = %model, error = %e, "Download failed");
                return Err(ReadinessFailure::new(class, e.into(), attempt));
            }
        };

        // New roots may have been created by the download
        self.locator.invalidate();

        if !self.transition(generation, attempt, ReadinessState::Validating) {
            return Err(ReadinessFailure::cancelled(attempt));
        }

        let dir = snapshot_dir.clone();
        let validation = self
            .blocking(move || validator::validate(&dir, descriptor.required_files))
            .await
            .map_err(|e| ReadinessFailure::new(FailureClass::Generic, e, attempt))?;

        let problem = match validation {
            ValidationResult::Complete => {
                return Ok(ReadyModel {
                    model,
                    path: snapshot_dir,
                });
            }
            ValidationResult::Incomplete(problem) => problem,
        };

        let class = FailureClass::from_problem(&problem);
        tracing::warn!(
            model = %model,
            file = %problem.file,
            reason = %problem.reason,
            "Downloaded model failed validation"
        );

        self.discard_downloaded(descriptor, snapshot_dir, problem.clone())
            .await;
        Err(ReadinessFailure::new(class, problem.into(), attempt))
    }

    async fn discard_downloaded(
        &self,
        descriptor: &'static ModelDescriptor,
        snapshot_dir: PathBuf,
        problem: ArtifactProblem,
    ) {
        let janitor = Arc::clone(&self.janitor);
        let result = self
            .blocking(move || {
                let mut report = CleanupReport::default();
                if problem.is_corruption() {
                    report.merge(janitor.remove_artifact(&snapshot_dir, &problem.file));
                }
                let model_dir = model_dir_of(&snapshot_dir, descriptor);
                report.merge(janitor.cleanup_markers(model_dir));
                report
            })
            .await;

        if let Err(e) = result {
            tracing::warn!(model = %descriptor.id, error = %e, "Post-download cleanup failed");
        }
    }
}

/// Model directory owning a hub snapshot, or the snapshot itself for flat layouts
fn model_dir_of<'a>(snapshot_dir: &'a Path, descriptor: &ModelDescriptor) -> &'a Path {
    snapshot_dir
        .ancestors()
        .nth(2)
        .filter(|dir| {
            dir.file_name()
                .is_some_and(|name| name == descriptor.cache_dir_name)
        })
        .unwrap_or(snapshot_dir)
}

/// Write `outcome` unless the slot already holds one
fn resolve_slot(slot: &OutcomeSlot, outcome: Outcome) -> bool {
    slot.send_if_modified(move |current| {
        if current.is_some() {
            return false;
        }
        *current = Some(outcome);
        true
    })
}

async fn await_outcome(rx: &mut watch::Receiver<Option<Outcome>>) -> Outcome {
    match rx.wait_for(Option::is_some).await {
        Ok(slot) => {
            let outcome: Option<Outcome> = (*slot).clone();
            outcome.unwrap_or_else(|| Err(ReadinessFailure::cancelled(0)))
        }
        Err(_) => Err(ReadinessFailure::cancelled(0)),
    }
}
