//! Progress reporting for the stages of a sync pass.
//!
//! The CLI uses `IndicatifReporter` to draw a bar on stderr.
//! Library callers can use `NoopReporter` or provide their own implementation.

use std::sync::atomic::{AtomicU64, Ordering};

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

/// The stages of one pass, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStage {
    Fetch,
    Filter,
    Upsert,
    Resolve,
    Derive,
}

impl SyncStage {
    pub fn label(self) -> &'static str {
        match self {
            Self::Fetch => "Fetching upstream records",
            Self::Filter => "Applying retention filter",
            Self::Upsert => "Upserting entities",
            Self::Resolve => "Resolving cross-references",
            Self::Derive => "Deriving hierarchy",
        }
    }
}

/// Receives stage transitions and per-record progress from `SyncEngine`.
pub trait ProgressReporter: Send + Sync {
    /// Begin a stage with an optional total record count.
    fn start(&self, stage: SyncStage, total: Option<u64>);

    fn advance(&self, amount: u64);

    /// Mark the current stage as finished.
    fn finish(&self);

    /// Display an informational line without disturbing the bar.
    fn message(&self, msg: &str);
}

#[derive(Debug, Default)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn start(&self, _stage: SyncStage, _total: Option<u64>) {}
    fn advance(&self, _amount: u64) {}
    fn finish(&self) {}
    fn message(&self, _msg: &str) {}
}

/// Reporter backed by an `indicatif` progress bar.
#[derive(Debug)]
pub struct IndicatifReporter {
    bar: ProgressBar,
    completed: AtomicU64,
}

impl IndicatifReporter {
    /// A reporter drawing to stderr, or a hidden one when `visible` is false.
    pub fn new(visible: bool) -> Self {
        let target = if visible {
            ProgressDrawTarget::stderr()
        } else {
            ProgressDrawTarget::hidden()
        };
        Self {
            bar: ProgressBar::with_draw_target(None, target),
            completed: AtomicU64::new(0),
        }
    }

    /// Records advanced in the current stage.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    fn style(total: Option<u64>) -> ProgressStyle {
        let template = if total.is_some() {
            "{spinner:.green} {msg} [{bar:30.cyan/blue}] {pos}/{len}"
        } else {
            "{spinner:.green} {msg} {pos} records"
        };
        ProgressStyle::with_template(template)
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .progress_chars("=> ")
    }
}

impl ProgressReporter for IndicatifReporter {
    fn start(&self, stage: SyncStage, total: Option<u64>) {
        self.completed.store(0, Ordering::Relaxed);
        self.bar.set_style(Self::style(total));
        self.bar.set_length(total.unwrap_or(0));
        self.bar.set_message(stage.label());
        self.bar.reset();
    }

    fn advance(&self, amount: u64) {
        self.completed.fetch_add(amount, Ordering::Relaxed);
        self.bar.inc(amount);
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }

    fn message(&self, msg: &str) {
        self.bar.println(msg);
    }
}
