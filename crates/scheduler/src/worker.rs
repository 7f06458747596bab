//! Dedicated background worker thread.
//!
//! An export run executes entirely on one named thread so that the caller is
//! never blocked by decoding, correction, encoding or disk I/O. The caller
//! keeps a [`BackgroundWorker`] handle and may poll or join it.

use std::any::Any;
use std::io;
use std::thread::{self, JoinHandle};

use crate::CancellationToken;

/// Errors from joining a [`BackgroundWorker`]
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker thread {name} panicked: {message}")]
    Panicked { name: String, message: String },
}

/// Handle to a task running on its own thread.
///
/// # Example
///
/// ```
/// use card_export_scheduler::{BackgroundWorker, CancellationToken};
///
/// let token = CancellationToken::new();
/// let worker = BackgroundWorker::spawn("card-export-demo", token.clone(), |token| {
///     let mut pages = 0;
///     while pages < 3 && !token.is_cancelled() {
///         pages += 1;
///     }
///     pages
/// })
/// .unwrap();
///
/// assert_eq!(worker.join().unwrap(), 3);
/// ```
pub struct BackgroundWorker<T> {
    name: String,
    token: CancellationToken,
    thread: JoinHandle<T>,
}

impl<T: Send + 'static> BackgroundWorker<T> {
    /// Start `task` on a new thread named `name`.
    ///
    /// The task receives a clone of `token`. Fails only when the OS refuses
    /// to create the thread.
    pub fn spawn<F>(name: impl Into<String>, token: CancellationToken, task: F) -> io::Result<Self>
    where
        F: FnOnce(CancellationToken) -> T + Send + 'static,
    {
        let name = name.into();
        let task_token = token.clone();
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || task(task_token))?;

        tracing::debug!(worker = %name, "spawned background worker");
        Ok(Self {
            name,
            token,
            thread,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request cooperative cancellation of the task
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// True once the task has returned (or panicked)
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the task and return its output
    pub fn join(self) -> Result<T, WorkerError> {
        let name = self.name;
        self.thread.join().map_err(|payload| {
            let message = panic_message(payload.as_ref());
            tracing::error!(worker = %name, %message, "background worker panicked");
            WorkerError::Panicked { name, message }
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
