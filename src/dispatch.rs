//! Bounded-concurrency pipeline executor.
//!
//! Holds a fixed pool of execution slots. `submit` suspends the caller
//! until a slot frees, then runs analyze -> convert? -> publish for one
//! item on its own task. The dispatcher never touches the state store:
//! step starts and the final outcome go back to the orchestrator as
//! messages, and the slot is an owned semaphore permit so every exit path
//! — success, failure, panic, cancellation — releases it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, warn};

use crate::clients::{Analyzer, Converter, PostRequest, Publisher, StepError, StepResult};
use crate::model::{ErrorKind, FileId, WorkItem};
use crate::telemetry::pipeline::start_item_span;

/// Pipeline behavior knobs, from configuration.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Deadline applied to each sub-step independently.
    pub step_timeout: Duration,
    /// When false the analyze step is skipped entirely.
    pub analysis_enabled: bool,
    /// Lowercased extensions (with dot) that must be re-encoded before
    /// upload, e.g. ".bmp".
    pub convert_extensions: Vec<String>,
    /// Post state forwarded to the publisher (published, draft, queue).
    pub post_state: String,
    /// Tags attached to every post, in addition to the item's category.
    pub common_tags: Vec<String>,
}

/// One pipeline step, for progress reporting and failure attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Analyze,
    Convert,
    Publish,
}

impl Step {
    pub fn as_str(self) -> &'static str {
        match self {
            Step::Analyze => "analyze",
            Step::Convert => "convert",
            Step::Publish => "publish",
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message from a pipeline task to the orchestrator.
#[derive(Debug)]
pub enum PipelineEvent {
    /// A sub-step is about to run. The orchestrator mirrors this into the
    /// state store (Analyzing / Converting / Publishing).
    StepStarted { id: FileId, step: Step },
    /// The pipeline finished; the slot has been released.
    Finished { id: FileId, outcome: PipelineOutcome },
}

/// Final result of one pipeline run.
#[derive(Debug)]
pub enum PipelineOutcome {
    Published {
        post_id: String,
        /// Conversion artifact to clean up during finalization.
        converted: Option<PathBuf>,
        duration: Duration,
    },
    Failed {
        step: Step,
        error: StepError,
        converted: Option<PathBuf>,
        duration: Duration,
    },
    /// Shutdown cancelled the run mid-step. Not a failure.
    Cancelled { converted: Option<PathBuf> },
}

enum Bounded<T> {
    Done(T),
    TimedOut,
    Cancelled,
}

pub struct Dispatcher {
    slots: Arc<Semaphore>,
    analyzer: Arc<dyn Analyzer>,
    converter: Arc<dyn Converter>,
    publisher: Arc<dyn Publisher>,
    settings: PipelineSettings,
    events: mpsc::Sender<PipelineEvent>,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        max_concurrent: usize,
        analyzer: Arc<dyn Analyzer>,
        converter: Arc<dyn Converter>,
        publisher: Arc<dyn Publisher>,
        settings: PipelineSettings,
        events: mpsc::Sender<PipelineEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(max_concurrent.max(1))),
            analyzer,
            converter,
            publisher,
            settings,
            events,
            cancel,
        }
    }

    /// Run the pipeline for one admitted item. Suspends until an execution
    /// slot is free, then returns while the pipeline runs on its own task.
    pub async fn submit(&self, item: WorkItem) {
        let permit = match self.slots.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                error!(id = %item.id, "slot pool closed; dropping submission");
                return;
            }
        };

        let runner = PipelineRun {
            analyzer: self.analyzer.clone(),
            converter: self.converter.clone(),
            publisher: self.publisher.clone(),
            settings: self.settings.clone(),
            events: self.events.clone(),
            cancel: self.cancel.clone(),
        };

        let span = start_item_span(&item.trace_id, item.id.as_str(), &item.category);
        tokio::spawn(
            async move {
                let _permit = permit; // held for the whole run
                let id = item.id.clone();
                let outcome = runner.run(item).await;
                if runner
                    .events
                    .send(PipelineEvent::Finished { id, outcome })
                    .await
                    .is_err()
                {
                    warn!("orchestrator gone; pipeline outcome dropped");
                }
            }
            .instrument(span),
        );
    }
}

struct PipelineRun {
    analyzer: Arc<dyn Analyzer>,
    converter: Arc<dyn Converter>,
    publisher: Arc<dyn Publisher>,
    settings: PipelineSettings,
    events: mpsc::Sender<PipelineEvent>,
    cancel: CancellationToken,
}

impl PipelineRun {
    async fn run(&self, item: WorkItem) -> PipelineOutcome {
        let started = Instant::now();
        let mut converted: Option<PathBuf> = None;

        // Analyze
        let caption = if self.settings.analysis_enabled {
            self.step_started(&item.id, Step::Analyze).await;
            match self.bounded(self.analyzer.analyze(&item.path)).await {
                Bounded::Done(Ok(caption)) => Some(caption),
                Bounded::Done(Err(error)) => {
                    return self.failed(Step::Analyze, error, converted, started);
                }
                Bounded::TimedOut => {
                    return self.timed_out(Step::Analyze, converted, started);
                }
                Bounded::Cancelled => return PipelineOutcome::Cancelled { converted },
            }
        } else {
            None
        };

        // Convert, only for formats the platform rejects
        if self.needs_conversion(&item) {
            self.step_started(&item.id, Step::Convert).await;
            match self.bounded(self.converter.convert(&item.path)).await {
                Bounded::Done(Ok(path)) => converted = Some(path),
                Bounded::Done(Err(error)) => {
                    return self.failed(Step::Convert, error, converted, started);
                }
                Bounded::TimedOut => return self.timed_out(Step::Convert, converted, started),
                Bounded::Cancelled => return PipelineOutcome::Cancelled { converted },
            }
        }

        // Publish
        self.step_started(&item.id, Step::Publish).await;
        let mut tags = vec![item.category.clone()];
        tags.extend(self.settings.common_tags.iter().cloned());
        let request = PostRequest {
            file: converted.clone().unwrap_or_else(|| item.path.clone()),
            category: item.category.clone(),
            tags,
            caption,
            state: self.settings.post_state.clone(),
            trace_id: item.trace_id,
        };
        match self.bounded(self.publisher.publish(&request)).await {
            Bounded::Done(Ok(post_id)) => PipelineOutcome::Published {
                post_id,
                converted,
                duration: started.elapsed(),
            },
            Bounded::Done(Err(error)) => self.failed(Step::Publish, error, converted, started),
            Bounded::TimedOut => self.timed_out(Step::Publish, converted, started),
            Bounded::Cancelled => PipelineOutcome::Cancelled { converted },
        }
    }

    fn needs_conversion(&self, item: &WorkItem) -> bool {
        let Some(ext) = item.path.extension() else {
            return false;
        };
        let ext = format!(".{}", ext.to_string_lossy().to_lowercase());
        self.settings.convert_extensions.contains(&ext)
    }

    async fn step_started(&self, id: &FileId, step: Step) {
        let _ = self
            .events
            .send(PipelineEvent::StepStarted {
                id: id.clone(),
                step,
            })
            .await;
    }

    /// Run one sub-step under the per-step deadline and the shutdown token.
    async fn bounded<T>(&self, fut: impl Future<Output = StepResult<T>>) -> Bounded<StepResult<T>> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Bounded::Cancelled,
            result = tokio::time::timeout(self.settings.step_timeout, fut) => match result {
                Ok(inner) => Bounded::Done(inner),
                Err(_) => Bounded::TimedOut,
            }
        }
    }

    fn failed(
        &self,
        step: Step,
        error: StepError,
        converted: Option<PathBuf>,
        started: Instant,
    ) -> PipelineOutcome {
        warn!(step = %step, kind = %error.kind, error = %error.message, "pipeline step failed");
        PipelineOutcome::Failed {
            step,
            error,
            converted,
            duration: started.elapsed(),
        }
    }

    fn timed_out(
        &self,
        step: Step,
        converted: Option<PathBuf>,
        started: Instant,
    ) -> PipelineOutcome {
        self.failed(
            step,
            StepError::new(
                ErrorKind::Timeout,
                format!("{step} exceeded {:?}", self.settings.step_timeout),
            ),
            converted,
            started,
        )
    }
}
