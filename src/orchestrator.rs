//! Orchestrator: the single logical owner of admission decisions and state
//! transitions.
//!
//! One loop multiplexes discovery events, pipeline progress messages, and
//! scheduled re-checks. Every WorkItem mutation passes through the state
//! store's compare-and-transition, so pipeline tasks can race discovery
//! events and retry timers without double-admitting or double-publishing
//! anything. Denied admissions sleep until the limiter's reported reset
//! time; nothing polls tighter than that.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alerts::AlertGate;
use crate::clients::{FileMover, StepError};
use crate::dispatch::{Dispatcher, PipelineEvent, PipelineOutcome, Step};
use crate::error::{Error, Result};
use crate::limiter::{Admission, RateLimiter};
use crate::model::{Discovery, ErrorKind, FileId, State, WorkItem};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::store::{CreateResult, StateStore};
use crate::telemetry::metrics;

pub struct Orchestrator {
    store: Arc<StateStore>,
    limiter: RateLimiter,
    policy: RetryPolicy,
    dispatcher: Dispatcher,
    mover: Arc<dyn FileMover>,
    alerts: AlertGate,
    discoveries: tokio::sync::mpsc::Receiver<Discovery>,
    events: tokio::sync::mpsc::Receiver<PipelineEvent>,
    /// External stop signal (ctrl-c).
    shutdown: CancellationToken,
    /// Propagated into in-flight pipeline steps once the grace period ends.
    work_cancel: CancellationToken,
    /// Pending admission re-checks, keyed by wake-up time.
    schedule: BTreeMap<DateTime<Utc>, Vec<FileId>>,
    in_flight: usize,
    grace: Duration,
}

#[allow(clippy::too_many_arguments)]
impl Orchestrator {
    pub fn new(
        store: Arc<StateStore>,
        limiter: RateLimiter,
        policy: RetryPolicy,
        dispatcher: Dispatcher,
        mover: Arc<dyn FileMover>,
        alerts: AlertGate,
        discoveries: tokio::sync::mpsc::Receiver<Discovery>,
        events: tokio::sync::mpsc::Receiver<PipelineEvent>,
        shutdown: CancellationToken,
        work_cancel: CancellationToken,
        grace: Duration,
    ) -> Self {
        Self {
            store,
            limiter,
            policy,
            dispatcher,
            mover,
            alerts,
            discoveries,
            events,
            shutdown,
            work_cancel,
            schedule: BTreeMap::new(),
            in_flight: 0,
            grace,
        }
    }

    /// Run until the shutdown signal fires, then drain.
    pub async fn run(mut self) -> Result<()> {
        self.recover().await?;
        info!("orchestrator started");

        loop {
            let next_wake = self.schedule.keys().next().copied();
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                maybe = self.discoveries.recv() => match maybe {
                    Some(discovery) => self.on_discovery(discovery).await?,
                    None => {
                        warn!("discovery feed closed");
                        break;
                    }
                },
                Some(event) = self.events.recv() => self.on_pipeline_event(event).await?,
                _ = sleep_until(next_wake), if next_wake.is_some() => self.pump_due().await?,
            }
        }

        self.drain().await
    }

    // -----------------------------------------------------------------------
    // Startup
    // -----------------------------------------------------------------------

    /// Resume what a previous run left behind: mid-pipeline items go back to
    /// Retrying, items published but never archived get finalized (re-running
    /// them would double-publish), and everything waiting is scheduled.
    async fn recover(&mut self) -> Result<()> {
        let swept = self.store.sweep_in_flight()?;
        if !swept.is_empty() {
            info!(count = swept.len(), "resuming items interrupted by previous run");
        }

        for item in self.store.list_by_state(State::Published)? {
            warn!(id = %item.id, "finalizing item published before previous shutdown");
            self.finalize(item, None).await?;
        }

        for state in [State::Discovered, State::Retrying] {
            for item in self.store.list_by_state(state)? {
                self.schedule_now(item.id);
            }
        }
        self.pump_due().await
    }

    // -----------------------------------------------------------------------
    // Discovery
    // -----------------------------------------------------------------------

    async fn on_discovery(&mut self, discovery: Discovery) -> Result<()> {
        let id = discovery.file_id();
        match self
            .store
            .create(&id, &discovery.path, &discovery.category, discovery.size)?
        {
            CreateResult::Created(item) => {
                info!(
                    id = %item.id,
                    trace_id = %item.trace_id,
                    path = %item.path.display(),
                    category = %item.category,
                    "file discovered"
                );
                metrics::files_discovered().add(1, &[category_attr(&item.category)]);
                self.try_start(id).await?;
            }
            CreateResult::AlreadyExists(item) => {
                debug!(id = %item.id, state = %item.state, "duplicate discovery ignored");
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Admission
    // -----------------------------------------------------------------------

    /// Ask the limiter whether `id` may run now. Admitted items move to
    /// Admitted and enter the dispatcher; denied items are re-checked at
    /// exactly the limiter's reported reset time.
    async fn try_start(&mut self, id: FileId) -> Result<()> {
        let Some(item) = self.store.get(&id)? else {
            return Ok(());
        };
        if !matches!(item.state, State::Discovered | State::Retrying) {
            return Ok(());
        }

        match self.limiter.try_admit() {
            Admission::Denied { retry_at } => {
                debug!(id = %id, retry_at = %retry_at, "admission denied");
                metrics::admissions_denied().add(1, &[]);
                self.schedule_at(retry_at, id);
            }
            Admission::Admitted => match self.store.transition(&id, item.state, State::Admitted) {
                Ok(admitted) => {
                    self.in_flight += 1;
                    self.dispatcher.submit(admitted).await;
                }
                Err(Error::StaleState { actual, .. }) => {
                    // Another path (a duplicate timer, a racing event) got
                    // here first; this admission is simply dropped.
                    debug!(id = %id, state = %actual, "admission raced; skipping");
                }
                Err(e) => return Err(e),
            },
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Pipeline events
    // -----------------------------------------------------------------------

    async fn on_pipeline_event(&mut self, event: PipelineEvent) -> Result<()> {
        match event {
            PipelineEvent::StepStarted { id, step } => {
                let to = match step {
                    Step::Analyze => State::Analyzing,
                    Step::Convert => State::Converting,
                    Step::Publish => State::Publishing,
                };
                self.apply_transition(&id, to).await;
                Ok(())
            }
            PipelineEvent::Finished { id, outcome } => {
                self.in_flight = self.in_flight.saturating_sub(1);
                self.on_finished(id, outcome).await
            }
        }
    }

    async fn on_finished(&mut self, id: FileId, outcome: PipelineOutcome) -> Result<()> {
        match outcome {
            PipelineOutcome::Published {
                post_id,
                converted,
                duration,
            } => {
                self.store.set_post_id(&id, &post_id)?;
                metrics::pipeline_duration_ms().record(duration.as_millis() as f64, &[]);
                match self.store.transition(&id, State::Publishing, State::Published) {
                    Ok(item) => self.finalize(item, converted).await?,
                    Err(e) => self.contract_violation(&id, &e).await,
                }
                Ok(())
            }
            PipelineOutcome::Failed {
                step,
                error,
                converted,
                duration,
            } => {
                metrics::pipeline_duration_ms().record(duration.as_millis() as f64, &[]);
                self.on_failure(id, step, error, converted).await
            }
            PipelineOutcome::Cancelled { converted } => {
                self.cleanup_artifact(&id, converted).await;
                // Not a failure: the item goes back to Retrying with its
                // attempt count untouched, for the next run to resume.
                if let Some(item) = self.store.get(&id)? {
                    if !item.state.is_terminal() && item.state != State::Retrying {
                        let _ = self.store.transition(&id, item.state, State::Retrying);
                    }
                }
                Ok(())
            }
        }
    }

    async fn on_failure(
        &mut self,
        id: FileId,
        step: Step,
        error: StepError,
        converted: Option<std::path::PathBuf>,
    ) -> Result<()> {
        self.cleanup_artifact(&id, converted).await;

        let attempts = self.store.record_attempt(&id, error.kind, &error.message)?;
        let Some(item) = self.store.get(&id)? else {
            return Ok(());
        };

        match self.policy.decide(attempts, error.kind) {
            RetryDecision::Proceed => {
                warn!(
                    id = %id,
                    step = %step,
                    attempts,
                    "transient failure; retrying on next admission"
                );
                self.apply_transition(&id, State::Retrying).await;
                self.try_start(id).await?;
            }
            RetryDecision::Defer(delay) => {
                warn!(
                    id = %id,
                    step = %step,
                    kind = %error.kind,
                    attempts,
                    delay_secs = delay.as_secs(),
                    "transient failure; retry deferred"
                );
                self.apply_transition(&id, State::Retrying).await;
                self.schedule_at(Utc::now() + to_chrono(delay), id);
            }
            RetryDecision::Abandon => {
                error!(
                    id = %id,
                    trace_id = %item.trace_id,
                    step = %step,
                    kind = %error.kind,
                    attempts,
                    error = %error.message,
                    "abandoning item"
                );
                self.apply_transition(&id, State::Failed).await;
                metrics::items_abandoned().add(1, &[kind_attr(error.kind)]);

                match self.mover.quarantine(&item.path, &item.category).await {
                    Ok(dest) => info!(id = %id, dest = %dest.display(), "file quarantined"),
                    Err(e) => error!(id = %id, error = %e, "quarantine failed"),
                }

                let file_name = item
                    .path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| item.path.display().to_string());
                self.alerts
                    .alert(
                        error.kind,
                        &format!("upload abandoned: {}", error.kind),
                        &format!(
                            "{file_name} ({}) failed {attempts} attempt(s) at {step}: {}",
                            item.category, error.message
                        ),
                    )
                    .await;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Finalization
    // -----------------------------------------------------------------------

    /// Published -> archive the original, drop the conversion artifact,
    /// mark Archived.
    async fn finalize(&mut self, item: WorkItem, converted: Option<std::path::PathBuf>) -> Result<()> {
        match self.mover.archive(&item.path, &item.category).await {
            Ok(dest) => {
                self.cleanup_artifact(&item.id, converted).await;
                match self.store.transition(&item.id, State::Published, State::Archived) {
                    Ok(done) => {
                        info!(
                            id = %done.id,
                            trace_id = %done.trace_id,
                            post_id = done.post_id.as_deref().unwrap_or("-"),
                            archived_to = %dest.display(),
                            attempts = done.attempt_count,
                            "item published and archived"
                        );
                        metrics::items_published().add(1, &[category_attr(&done.category)]);
                    }
                    Err(e) => self.contract_violation(&item.id, &e).await,
                }
            }
            Err(e) => {
                error!(id = %item.id, error = %e, "archive move failed");
                let _ = self
                    .store
                    .record_attempt(&item.id, ErrorKind::Internal, &format!("archive: {e}"));
                self.apply_transition(&item.id, State::Failed).await;
                self.alerts
                    .alert(
                        ErrorKind::Internal,
                        "archive failed",
                        &format!("{} could not be archived: {e}", item.path.display()),
                    )
                    .await;
            }
        }
        Ok(())
    }

    async fn cleanup_artifact(&self, id: &FileId, converted: Option<std::path::PathBuf>) {
        if let Some(tmp) = converted {
            if let Ok(Some(item)) = self.store.get(id) {
                if tmp == item.path {
                    return;
                }
            }
            if let Err(e) = tokio::fs::remove_file(&tmp).await {
                debug!(path = %tmp.display(), error = %e, "conversion artifact cleanup failed");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Transition plumbing
    // -----------------------------------------------------------------------

    /// Move an item to `to` from whatever state it is currently in, treating
    /// a rejected edge as a contract violation.
    async fn apply_transition(&mut self, id: &FileId, to: State) {
        let current = match self.store.get(id) {
            Ok(Some(item)) => item.state,
            Ok(None) => {
                error!(id = %id, "transition target vanished");
                return;
            }
            Err(e) => {
                error!(id = %id, error = %e, "state read failed");
                return;
            }
        };
        if current == to {
            return;
        }
        match self.store.transition(id, current, to) {
            Ok(item) => {
                debug!(id = %id, from = %current, to = %item.state, "state transition");
                metrics::state_transitions().add(
                    1,
                    &[
                        opentelemetry::KeyValue::new("from", current.as_str()),
                        opentelemetry::KeyValue::new("to", to.as_str()),
                    ],
                );
            }
            Err(e) => self.contract_violation(id, &e).await,
        }
    }

    /// An invariant broke (illegal edge, raced terminal state). Log with
    /// full context and force the item to Failed rather than leaving it
    /// inconsistent.
    async fn contract_violation(&mut self, id: &FileId, cause: &Error) {
        error!(id = %id, error = %cause, "state machine contract violation");
        if let Ok(Some(item)) = self.store.get(id) {
            if !item.state.is_terminal() {
                let _ = self.store.transition(id, item.state, State::Failed);
            }
        }
        self.alerts
            .alert(
                ErrorKind::Internal,
                "pipeline invariant violation",
                &format!("item {id} forced to failed: {cause}"),
            )
            .await;
    }

    // -----------------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------------

    fn schedule_now(&mut self, id: FileId) {
        self.schedule_at(Utc::now(), id);
    }

    fn schedule_at(&mut self, at: DateTime<Utc>, id: FileId) {
        self.schedule.entry(at).or_default().push(id);
    }

    /// Re-check every item whose wake-up time has passed.
    async fn pump_due(&mut self) -> Result<()> {
        let now = Utc::now();
        loop {
            let due = match self.schedule.first_key_value() {
                Some((&at, _)) if at <= now => at,
                _ => break,
            };
            let ids = self.schedule.remove(&due).unwrap_or_default();
            for id in ids {
                self.try_start(id).await?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Drain in-flight pipelines up to the grace deadline, then cancel the
    /// rest and revert anything still mid-pipeline to Retrying so the next
    /// run resumes it.
    async fn drain(mut self) -> Result<()> {
        info!(in_flight = self.in_flight, "shutting down");
        let deadline = tokio::time::Instant::now() + self.grace;

        while self.in_flight > 0 {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                Some(event) = self.events.recv() => self.on_pipeline_event(event).await?,
            }
        }

        if self.in_flight > 0 {
            info!(remaining = self.in_flight, "grace period elapsed; cancelling in-flight work");
            self.work_cancel.cancel();
            let settle = tokio::time::Instant::now() + Duration::from_secs(2);
            while self.in_flight > 0 {
                tokio::select! {
                    _ = tokio::time::sleep_until(settle) => break,
                    Some(event) = self.events.recv() => self.on_pipeline_event(event).await?,
                }
            }
        }

        let swept = self.store.sweep_in_flight()?;
        if !swept.is_empty() {
            warn!(count = swept.len(), "items left mid-pipeline; reverted to retrying");
        }
        info!("orchestrator stopped");
        Ok(())
    }
}

fn category_attr(category: &str) -> opentelemetry::KeyValue {
    opentelemetry::KeyValue::new("category", category.to_string())
}

fn kind_attr(kind: ErrorKind) -> opentelemetry::KeyValue {
    opentelemetry::KeyValue::new("kind", kind.as_str())
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}

async fn sleep_until(at: Option<DateTime<Utc>>) {
    let Some(at) = at else {
        return;
    };
    let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    tokio::time::sleep(delay).await;
}
