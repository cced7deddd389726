//! Progress reporting and cooperative cancellation

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Severity of a user-facing message
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// A message surfaced to the user alongside a build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildMessage {
    pub severity: Severity,
    pub text: String,
}

/// Receives progress ticks and user messages from long-running operations
pub trait ProgressListener: Send + Sync {
    fn begin_task(&self, _name: &str, _total_work: u64) {}

    fn worked(&self, _work: u64) {}

    fn done(&self) {}

    fn message(&self, severity: Severity, text: &str) {
        match severity {
            Severity::Info => tracing::info!("{}", text),
            Severity::Warning => tracing::warn!("{}", text),
            Severity::Error => tracing::error!("{}", text),
        }
    }
}

/// Ignores progress, logs messages
#[derive(Debug, Default, Clone, Copy)]
pub struct NullListener;

impl ProgressListener for NullListener {}

/// Logs task boundaries through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct LogListener;

impl ProgressListener for LogListener {
    fn begin_task(&self, name: &str, total_work: u64) {
        tracing::info!("{} ({} units)", name, total_work);
    }

    fn done(&self) {
        tracing::debug!("task done");
    }
}

/// Cooperative cancellation flag shared between a caller and running work
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// `Err(Cancelled)` once cancellation was requested
    #[inline]
    pub fn check(&self) -> crate::HeapResult<()> {
        if self.is_cancelled() {
            Err(crate::HeapError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Listener + cancellation handed down through a build
#[derive(Clone, Copy)]
pub struct Monitor<'a> {
    pub listener: &'a dyn ProgressListener,
    pub cancel: &'a CancellationToken,
}

impl<'a> Monitor<'a> {
    pub fn new(listener: &'a dyn ProgressListener, cancel: &'a CancellationToken) -> Self {
        Self { listener, cancel }
    }
}

/// Collects messages emitted during a build and forwards them to a listener
#[derive(Default)]
pub struct MessageLog {
    messages: Mutex<Vec<BuildMessage>>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&self, listener: &dyn ProgressListener, severity: Severity, text: String) {
        listener.message(severity, &text);
        self.messages.lock().push(BuildMessage { severity, text });
    }

    pub fn into_messages(self) -> Vec<BuildMessage> {
        self.messages.into_inner()
    }

    pub fn warning_count(&self) -> usize {
        self.messages
            .lock()
            .iter()
            .filter(|m| m.severity == Severity::Warning)
            .count()
    }
}
