//! Card Export Scheduler Library
//!
//! Background execution primitives for export runs: a cooperative
//! cancellation token, a dedicated worker thread and a fire-and-forget event
//! channel.
//!
//! # Example
//!
//! ```
//! use card_export_scheduler::{event_channel, BackgroundWorker, CancellationToken};
//!
//! let (events, rx) = event_channel();
//! let worker = BackgroundWorker::spawn("card-export", CancellationToken::new(), move |token| {
//!     for page in 1..=3 {
//!         if token.is_cancelled() {
//!             break;
//!         }
//!         events.send(format!("page {page} done"));
//!     }
//! })
//! .unwrap();
//!
//! worker.join().unwrap();
//! assert_eq!(rx.iter().count(), 3);
//! ```

mod cancel;
mod events;
mod worker;

// Re-export public API
pub use cancel::CancellationToken;
pub use events::{event_channel, EventSender};
pub use worker::{BackgroundWorker, WorkerError};
