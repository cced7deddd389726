//! Terminal progress bars for long-running tasks

use heapgraph::{ProgressListener, Severity};
use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::Mutex;

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} {msg} [{bar:40.cyan/blue}] {percent}% ({eta})")
        .map(|style| style.progress_chars("█▓▒░  "))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}

/// One bar per task; messages are logged above the bar
#[derive(Default)]
pub struct BarListener {
    bar: Mutex<Option<ProgressBar>>,
}

impl BarListener {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressListener for BarListener {
    fn begin_task(&self, name: &str, total_work: u64) {
        let bar = ProgressBar::new(total_work.max(1));
        bar.set_style(bar_style());
        bar.set_message(name.to_string());
        if let Some(previous) = self.bar.lock().replace(bar) {
            previous.finish_and_clear();
        }
    }

    fn worked(&self, work: u64) {
        if let Some(bar) = self.bar.lock().as_ref() {
            bar.inc(work);
        }
    }

    fn done(&self) {
        if let Some(bar) = self.bar.lock().take() {
            bar.finish_and_clear();
        }
    }

    fn message(&self, severity: Severity, text: &str) {
        let log = || match severity {
            Severity::Info => tracing::info!("{}", text),
            Severity::Warning => tracing::warn!("{}", text),
            Severity::Error => tracing::error!("{}", text),
        };
        match self.bar.lock().as_ref() {
            Some(bar) => bar.suspend(log),
            None => log(),
        }
    }
}
