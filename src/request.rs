//! The single-slot AI request lifecycle.
//!
//! At most one generation runs at a time. Starting another requires an explicit, awaited
//! [`RequestController::cancel`] first, so callers always observe the teardown.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::document::Fragment;
use crate::error::{Error, Precondition, Result};
use crate::project::Project;
use crate::templates::PromptTemplate;

/// The current or most recent generation request. Replaced wholesale, never mutated.
#[derive(Debug, Clone)]
pub struct AiRequest {
    /// Monotonic request number within this process.
    pub sequence: u64,
    /// Root fragment the request targets.
    pub fragment: Fragment,
    pub template: PromptTemplate,
    pub label: String,
    /// The rendered prompt sent to the backend.
    pub prompt: String,
}

/// Output streamed by a running generation.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationEvent {
    /// Assistant text, possibly a partial line.
    Text(String),
    /// One-line summary of a tool invocation.
    Tool(String),
    /// A line the backend wrote to stderr.
    Stderr(String),
}

/// Usage reported by the backend at the end of a generation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Usage {
    pub cost_usd: Option<f64>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationSummary {
    pub usage: Option<Usage>,
}

/// Something that turns a request into generated output.
///
/// Implementations must watch `cancel` and return promptly once it fires. Events sent after
/// cancellation are discarded by the controller.
#[async_trait]
pub trait GenerationBackend: Send + Sync + 'static {
    async fn generate(
        &self,
        request: &AiRequest,
        cancel: CancellationToken,
        events: mpsc::UnboundedSender<GenerationEvent>,
    ) -> Result<GenerationSummary>;
}

#[derive(Debug, Clone)]
pub enum RequestState {
    Idle,
    Running(Arc<AiRequest>),
    Completed(Arc<AiRequest>),
}

impl RequestState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Running(_) => "RUNNING",
            Self::Completed(_) => "COMPLETED",
        }
    }

    /// The request this state refers to, if any.
    pub fn request(&self) -> Option<&Arc<AiRequest>> {
        match self {
            Self::Idle => None,
            Self::Running(request) | Self::Completed(request) => Some(request),
        }
    }
}

/// Handles to the task running the backend.
struct ActiveGeneration {
    cancel: CancellationToken,
    events: mpsc::UnboundedReceiver<GenerationEvent>,
    task: JoinHandle<Result<GenerationSummary>>,
}

pub struct RequestController {
    backend: Arc<dyn GenerationBackend>,
    state: RequestState,
    /// Survives cancellation and completion so the request can be repeated.
    last: Option<Arc<AiRequest>>,
    active: Option<ActiveGeneration>,
    teardown_timeout: Duration,
    sequence: u64,
}

impl RequestController {
    pub fn new(backend: Arc<dyn GenerationBackend>, teardown_timeout: Duration) -> Self {
        Self {
            backend,
            state: RequestState::Idle,
            last: None,
            active: None,
            teardown_timeout,
            sequence: 0,
        }
    }

    pub fn state(&self) -> &RequestState {
        &self.state
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, RequestState::Running(_))
    }

    pub fn last_request(&self) -> Option<&Arc<AiRequest>> {
        self.last.as_ref()
    }

    /// Start a generation for `template` against the root of `fragment`.
    ///
    /// Precondition: no request is running. Callers must `cancel().await` first; a call while
    /// running is rejected with [`Precondition::AlreadyRunning`].
    ///
    /// The fragment is looked up again by id in `project`, so a handle captured before a
    /// re-parse is never used directly. On any error the state is unchanged.
    pub fn start(
        &mut self,
        project: &Project,
        fragment: &Fragment,
        template: &PromptTemplate,
        label: &str,
    ) -> Result<Arc<AiRequest>> {
        if self.is_running() {
            warn!(template = %template.id, "start_while_running");
            return Err(Precondition::AlreadyRunning.into());
        }

        let stale = || Error::Stale {
            full_id: fragment.full_id.clone(),
        };
        let current = project.fragment(&fragment.full_id).ok_or_else(stale)?;
        let root = project.root_fragment(current);
        let document = project.document(&root.file).ok_or_else(stale)?;

        self.sequence += 1;
        let request = Arc::new(AiRequest {
            sequence: self.sequence,
            fragment: root.clone(),
            template: template.clone(),
            label: label.to_string(),
            prompt: template.render(document, root, label),
        });

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let backend = Arc::clone(&self.backend);
        let task_request = Arc::clone(&request);
        let task_cancel = cancel.clone();
        let task =
            tokio::spawn(async move { backend.generate(&task_request, task_cancel, tx).await });

        info!(
            sequence = request.sequence,
            fragment = %request.fragment.full_id,
            template = %template.id,
            label = %request.label,
            "request_started"
        );

        self.active = Some(ActiveGeneration {
            cancel,
            events: rx,
            task,
        });
        self.last = Some(Arc::clone(&request));
        self.state = RequestState::Running(Arc::clone(&request));
        Ok(request)
    }

    /// The next streamed event of the running request, or `None` once its output has ended
    /// (or nothing is running).
    pub async fn next_event(&mut self) -> Option<GenerationEvent> {
        self.active.as_mut()?.events.recv().await
    }

    /// Wait for the running request to finish and move to `Completed`.
    ///
    /// Drain [`Self::next_event`] first; events still queued are dropped. Returns `None` when
    /// nothing is running.
    pub async fn finish(&mut self) -> Option<Result<GenerationSummary>> {
        let active = self.active.take()?;
        let result = match active.task.await {
            Ok(result) => result,
            Err(e) => Err(Error::Generation(format!("generation task failed: {}", e))),
        };

        if let RequestState::Running(request) = &self.state {
            match &result {
                Ok(summary) => info!(sequence = request.sequence, usage = ?summary.usage, "request_completed"),
                Err(e) => warn!(sequence = request.sequence, error = %e, "request_failed"),
            }
            self.state = RequestState::Completed(Arc::clone(request));
        }
        Some(result)
    }

    /// Cancel the running request and wait for the backend to stop.
    ///
    /// No-op (returns `false`) when idle or completed. Once this returns, no further output of
    /// the cancelled request is delivered. The backend gets `teardown_timeout` to acknowledge;
    /// after that its task is aborted.
    pub async fn cancel(&mut self) -> bool {
        let Some(ActiveGeneration {
            cancel,
            events,
            mut task,
        }) = self.active.take()
        else {
            return false;
        };

        cancel.cancel();
        drop(events);

        match tokio::time::timeout(self.teardown_timeout, &mut task).await {
            Ok(_) => debug!("generation_acknowledged_cancel"),
            Err(_) => {
                warn!(
                    timeout_ms = self.teardown_timeout.as_millis() as u64,
                    "generation_teardown_timeout"
                );
                task.abort();
            }
        }

        if let RequestState::Running(request) = &self.state {
            info!(sequence = request.sequence, "request_cancelled");
        }
        self.state = RequestState::Idle;
        true
    }

    /// The last request record, even after it completed or was cancelled.
    pub fn resume_previous(&self) -> Result<Arc<AiRequest>> {
        self.last
            .clone()
            .ok_or_else(|| Precondition::NoPreviousRequest.into())
    }
}

impl Drop for RequestController {
    fn drop(&mut self) {
        if let Some(active) = &self.active {
            active.cancel.cancel();
        }
    }
}
