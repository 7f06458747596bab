//! Card Export Core Library
//!
//! Turns an ordered list of source images into numbered sequence-card pages.
//! [`ExportOrchestrator`] wires the color corrector, the cache tiers and the
//! page renderer together and drives a run on a background worker.
//!
//! # Example
//!
//! ```no_run
//! use card_export_core::{ExportConfig, ExportEvent, ExportOrchestrator, ExportRequest};
//!
//! let orchestrator = ExportOrchestrator::new(ExportConfig::default())?;
//! let request = ExportRequest::new(vec!["a.png".into(), "b.png".into()], "out")
//!     .with_sequence_length(8);
//!
//! let handle = orchestrator.start(request)?;
//! for event in handle.events() {
//!     if let ExportEvent::Progress { done, total, message } = event {
//!         println!("{done}/{total} {message}");
//!     }
//! }
//! let outcome = handle.wait()?;
//! println!("{:?}", outcome.summary().status());
//! # Ok::<(), card_export_core::ExportError>(())
//! ```

pub mod config;
pub mod error;
pub mod orchestrator;

pub use config::{ConfigError, ExportConfig};
pub use error::{ExportError, ExportResult};
pub use orchestrator::{
    page_file_name, ExportEvent, ExportHandle, ExportOrchestrator, ExportOutcome, ExportRequest,
    ExportState, ExportSummary, SummaryStatus,
};

pub use card_export_scheduler::CancellationToken;
