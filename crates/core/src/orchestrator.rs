//! Export orchestration
//!
//! [`ExportOrchestrator`] turns an [`ExportRequest`] into numbered page files.
//! A run moves through [`ExportState`]s:
//!
//! ```text
//! Idle → Preparing → Rendering → Completed
//!                              ↘ Cancelled
//!                              ↘ Failed
//! ```
//!
//! [`ExportOrchestrator::start`] executes the run on a dedicated worker thread
//! and returns an [`ExportHandle`] immediately. Progress arrives as
//! [`ExportEvent`]s; cancellation is cooperative and checked before every page
//! and between items.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, PoisonError};

use card_export_cache::DiskCacheStore;
use card_export_render::{
    CellPosition, ColorCorrector, GridLayoutCalculator, PageJob, PageOutcome, PageRenderer,
    RenderCaches, RenderError, RenderResult, RenderedPage, Substitution,
};
use card_export_scheduler::{event_channel, BackgroundWorker, CancellationToken};
use serde::Serialize;

use crate::config::{ConfigError, ExportConfig};
use crate::error::{ExportError, ExportResult};

const WORKER_NAME: &str = "card-export-worker";

/// File name of the 0-based page `page_index`
pub fn page_file_name(page_index: u32) -> String {
    format!("sequence_card_page_{:03}.png", page_index + 1)
}

/// What to export and where
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRequest {
    /// Source images in sequence order
    pub sources: Vec<PathBuf>,
    /// Selects the grid; defaults to the number of sources
    pub sequence_length: Option<u32>,
    pub output_dir: PathBuf,
}

impl ExportRequest {
    pub fn new(sources: Vec<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            sources,
            sequence_length: None,
            output_dir: output_dir.into(),
        }
    }

    pub fn with_sequence_length(mut self, length: u32) -> Self {
        self.sequence_length = Some(length);
        self
    }
}

/// Lifecycle of one export run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExportState {
    Idle,
    Preparing,
    Rendering,
    Cancelled,
    Completed,
    Failed,
}

impl ExportState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Completed | Self::Failed)
    }
}

/// Notification sent to the caller while a run progresses
#[derive(Debug, Clone, PartialEq)]
pub enum ExportEvent {
    Progress {
        done: usize,
        total: usize,
        message: String,
    },
    Completed {
        output_dir: PathBuf,
        page_count: u32,
        summary: ExportSummary,
    },
    Cancelled {
        pages_written: u32,
    },
    Failed {
        reason: String,
    },
}

impl ExportEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress { .. })
    }
}

/// Totals for a finished or cancelled run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExportSummary {
    pub pages_written: u32,
    /// Pages that rendered but could not be encoded or written
    pub pages_skipped: u32,
    pub substitutions: Vec<Substitution>,
    pub total_items: usize,
    pub output_files: Vec<PathBuf>,
}

/// User-facing verdict of a run that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SummaryStatus {
    FullySucceeded,
    SucceededWithSubstitutions(usize),
    SucceededWithSkippedPages(u32),
}

impl ExportSummary {
    /// Skipped pages outrank substitutions
    pub fn status(&self) -> SummaryStatus {
        if self.pages_skipped > 0 {
            SummaryStatus::SucceededWithSkippedPages(self.pages_skipped)
        } else if !self.substitutions.is_empty() {
            SummaryStatus::SucceededWithSubstitutions(self.substitutions.len())
        } else {
            SummaryStatus::FullySucceeded
        }
    }
}

/// How a run that did not fail ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportOutcome {
    Completed(ExportSummary),
    Cancelled(ExportSummary),
}

impl ExportOutcome {
    pub fn summary(&self) -> &ExportSummary {
        match self {
            Self::Completed(summary) | Self::Cancelled(summary) => summary,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

#[derive(Debug, Clone)]
struct SharedState(Arc<Mutex<ExportState>>);

impl SharedState {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(ExportState::Idle)))
    }

    fn get(&self) -> ExportState {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, state: ExportState) {
        tracing::debug!(?state, "export state");
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

/// Drives export runs with one configuration
#[derive(Clone)]
pub struct ExportOrchestrator {
    config: ExportConfig,
    layout: GridLayoutCalculator,
    renderer: Arc<PageRenderer>,
}

impl ExportOrchestrator {
    /// Build the corrector, the cache tiers and the disk store.
    ///
    /// A disk store that cannot be opened is not fatal; the run proceeds
    /// with the memory tiers only.
    pub fn new(config: ExportConfig) -> ExportResult<Self> {
        config.validate()?;
        let corrector = ColorCorrector::new(config.color.clone())
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        let mut caches = RenderCaches::new(config.cache.raw_capacity, config.cache.scaled_capacity);
        if config.cache.disk_enabled {
            match DiskCacheStore::open(&config.cache.disk_cache_dir, config.cache.disk_policy()) {
                Ok(store) => caches = caches.with_disk(store),
                Err(e) => tracing::warn!(
                    dir = %config.cache.disk_cache_dir.display(),
                    error = %e,
                    "disk cache unavailable; continuing without it"
                ),
            }
        }

        let renderer = PageRenderer::new(
            config.page.clone(),
            Arc::new(corrector),
            caches,
            config.limits,
        );
        Ok(Self {
            layout: GridLayoutCalculator::new(config.page.clone()),
            renderer: Arc::new(renderer),
            config,
        })
    }

    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    /// The disk store, if one could be opened
    pub fn disk_cache(&self) -> Option<&DiskCacheStore> {
        self.renderer.caches().disk.as_ref()
    }

    /// Split `request` into row-major page jobs
    pub fn plan(&self, request: &ExportRequest) -> Vec<PageJob> {
        let item_count = u32::try_from(request.sources.len()).unwrap_or(u32::MAX);
        let geometry = self.layout.calculate(item_count, request.sequence_length);
        let capacity = geometry.capacity().max(1) as usize;

        request
            .sources
            .chunks(capacity)
            .enumerate()
            .map(|(page_index, chunk)| PageJob {
                page_index: page_index as u32,
                geometry,
                items: chunk
                    .iter()
                    .enumerate()
                    .map(|(i, path)| {
                        (CellPosition::from_index(i as u32, geometry.cols), path.clone())
                    })
                    .collect(),
            })
            .collect()
    }

    /// Start a run on a background worker and return immediately
    pub fn start(&self, request: ExportRequest) -> ExportResult<ExportHandle> {
        let (events, receiver) = event_channel();
        let state = SharedState::new();
        let orchestrator = self.clone();
        let worker_state = state.clone();

        let worker = BackgroundWorker::spawn(WORKER_NAME, CancellationToken::new(), move |token| {
            orchestrator.run_with_state(&request, &token, &worker_state, &mut |event: ExportEvent| {
                events.send(event);
            })
        })
        .map_err(|e| ExportError::infrastructure(format!("cannot start export worker: {e}")))?;

        Ok(ExportHandle {
            worker,
            events: receiver,
            state,
        })
    }

    /// Run an export on the calling thread, reporting through `emit`
    pub fn run(
        &self,
        request: &ExportRequest,
        token: &CancellationToken,
        emit: &mut dyn FnMut(ExportEvent),
    ) -> ExportResult<ExportOutcome> {
        self.run_with_state(request, token, &SharedState::new(), emit)
    }

    #[tracing::instrument(
        skip_all,
        fields(items = request.sources.len(), output = %request.output_dir.display())
    )]
    fn run_with_state(
        &self,
        request: &ExportRequest,
        token: &CancellationToken,
        state: &SharedState,
        emit: &mut dyn FnMut(ExportEvent),
    ) -> ExportResult<ExportOutcome> {
        let result = self.execute(request, token, state, emit);
        match &result {
            Ok(ExportOutcome::Completed(summary)) => {
                state.set(ExportState::Completed);
                tracing::info!(
                    pages = summary.pages_written,
                    skipped = summary.pages_skipped,
                    substitutions = summary.substitutions.len(),
                    "export completed"
                );
                emit(ExportEvent::Completed {
                    output_dir: request.output_dir.clone(),
                    page_count: summary.pages_written,
                    summary: summary.clone(),
                });
            }
            Ok(ExportOutcome::Cancelled(summary)) => {
                state.set(ExportState::Cancelled);
                tracing::info!(pages = summary.pages_written, "export cancelled");
                emit(ExportEvent::Cancelled {
                    pages_written: summary.pages_written,
                });
            }
            Err(e) => {
                state.set(ExportState::Failed);
                tracing::error!(error = %e, "export failed");
                emit(ExportEvent::Failed {
                    reason: e.to_string(),
                });
            }
        }
        result
    }

    fn execute(
        &self,
        request: &ExportRequest,
        token: &CancellationToken,
        state: &SharedState,
        emit: &mut dyn FnMut(ExportEvent),
    ) -> ExportResult<ExportOutcome> {
        state.set(ExportState::Preparing);
        if request.sources.is_empty() {
            return Err(ConfigError::Invalid("export request has no sources".to_string()).into());
        }
        fs::create_dir_all(&request.output_dir).map_err(|e| {
            ExportError::infrastructure(format!(
                "cannot create output directory {}: {e}",
                request.output_dir.display()
            ))
        })?;

        let jobs = self.plan(request);
        let page_total = jobs.len();
        let mut summary = ExportSummary {
            total_items: request.sources.len(),
            ..ExportSummary::default()
        };
        let mut done = 0;

        tracing::info!(pages = page_total, "export started");
        state.set(ExportState::Rendering);
        emit(ExportEvent::Progress {
            done,
            total: summary.total_items,
            message: format!("Preparing {page_total} page(s)"),
        });

        for job in &jobs {
            if token.is_cancelled() {
                return Ok(ExportOutcome::Cancelled(summary));
            }

            let rendered = match self.renderer.render_until(job, || token.is_cancelled()) {
                Ok(PageOutcome::Rendered(page)) => Ok(page),
                Ok(PageOutcome::Interrupted { .. }) => {
                    return Ok(ExportOutcome::Cancelled(summary));
                }
                Err(e) => Err(e),
            };
            let written = self.store_page(request, job, rendered, &mut summary)?;

            done += job.items.len();
            let verb = if written { "Rendered" } else { "Skipped" };
            emit(ExportEvent::Progress {
                done,
                total: summary.total_items,
                message: format!("{verb} page {} of {page_total}", job.page_index + 1),
            });
        }

        Ok(ExportOutcome::Completed(summary))
    }

    /// Record one page's result in `summary`; `Ok(false)` means the page was
    /// skipped. Only render failures other than encoding end the run.
    fn store_page(
        &self,
        request: &ExportRequest,
        job: &PageJob,
        rendered: RenderResult<RenderedPage>,
        summary: &mut ExportSummary,
    ) -> ExportResult<bool> {
        let page = match rendered {
            Ok(page) => page,
            Err(RenderError::Encode(reason)) => {
                tracing::warn!(
                    page = job.page_index,
                    %reason,
                    "page could not be encoded; skipped"
                );
                summary.pages_skipped += 1;
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        let path = request.output_dir.join(page_file_name(job.page_index));
        summary.substitutions.extend(page.substitutions.iter().cloned());
        match write_page(&path, &page) {
            Ok(()) => {
                summary.pages_written += 1;
                summary.output_files.push(path);
                Ok(true)
            }
            Err(e) => {
                tracing::warn!(error = %e, "page could not be written; skipped");
                summary.pages_skipped += 1;
                Ok(false)
            }
        }
    }
}

/// Write through a temp file so a page file is either complete or absent
fn write_page(path: &Path, page: &RenderedPage) -> ExportResult<()> {
    let temp_path = path.with_extension("png.tmp");
    let result = fs::write(&temp_path, &page.png).and_then(|()| fs::rename(&temp_path, path));
    if let Err(e) = result {
        let _ = fs::remove_file(&temp_path);
        return Err(ExportError::disk_write(path, e));
    }
    tracing::debug!(path = %path.display(), bytes = page.png.len(), "wrote page");
    Ok(())
}

/// Caller's side of a run started with [`ExportOrchestrator::start`]
pub struct ExportHandle {
    worker: BackgroundWorker<ExportResult<ExportOutcome>>,
    events: Receiver<ExportEvent>,
    state: SharedState,
}

impl ExportHandle {
    /// Blocking iterator source for events; ends when the worker is done
    pub fn events(&self) -> &Receiver<ExportEvent> {
        &self.events
    }

    /// Next pending event without blocking
    pub fn try_next_event(&self) -> Option<ExportEvent> {
        self.events.try_recv().ok()
    }

    /// Request cancellation; the run stops before the next page or item
    pub fn cancel(&self) {
        self.worker.cancel();
    }

    pub fn state(&self) -> ExportState {
        self.state.get()
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Block until the run ends
    pub fn wait(self) -> ExportResult<ExportOutcome> {
        self.worker
            .join()
            .map_err(|e| ExportError::infrastructure(e.to_string()))?
    }
}
