use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::borrow::Cow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::info;

/// Progress sink for the analysis stages. A reporter is initialized lazily
/// with the number of steps once a stage knows it, and each stage gets its own
/// child reporter.
pub trait ProgressReporter: Send + Sync + Sized {
    fn initialize(&self, total_items: u64);

    /// Advance by one step.
    fn progress(&self);

    /// Reporter for a nested stage.
    fn sub_progress(&self, name: Cow<'static, str>) -> Self;

    /// Finish this stage (also happens on drop).
    fn finish(self) {
        drop(self)
    }
}

/// Discards all progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpProgressReporter;

impl ProgressReporter for NoOpProgressReporter {
    fn initialize(&self, _total_items: u64) {}
    fn progress(&self) {}
    fn sub_progress(&self, _name: Cow<'static, str>) -> Self {
        NoOpProgressReporter
    }
}

/// Terminal progress bars, one per stage, stacked in a [`MultiProgress`].
pub struct IndicatifProgressBar {
    stage: Cow<'static, str>,
    multi_progress: Option<MultiProgress>,
    bar: Arc<Mutex<Option<ProgressBar>>>,
}

impl IndicatifProgressBar {
    pub fn new(stage: impl Into<Cow<'static, str>>, multi_progress: Option<MultiProgress>) -> Self {
        Self {
            stage: stage.into(),
            multi_progress,
            bar: Arc::new(Mutex::new(None)),
        }
    }
}

impl ProgressReporter for IndicatifProgressBar {
    fn initialize(&self, total_items: u64) {
        let mut slot = self.bar.lock().unwrap();
        match slot.as_ref() {
            // Draining a queue can grow it; re-initializing resets the length.
            Some(bar) => {
                bar.set_length(total_items);
                bar.set_position(0);
            }
            None => {
                let bar = ProgressBar::new(total_items)
                    .with_style(default_progress_style())
                    .with_message(self.stage.clone());
                if let Some(multi) = &self.multi_progress {
                    multi.insert_from_back(1, bar.clone());
                }
                *slot = Some(bar);
            }
        }
    }

    fn progress(&self) {
        if let Some(bar) = self.bar.lock().unwrap().as_ref() {
            if bar.position() >= bar.length().unwrap_or(0) {
                bar.inc_length(1);
            }
            bar.inc(1);
        }
    }

    fn sub_progress(&self, stage: Cow<'static, str>) -> Self {
        Self::new(stage, self.multi_progress.clone())
    }
}

impl Drop for IndicatifProgressBar {
    fn drop(&mut self) {
        if let Some(bar) = self.bar.lock().unwrap().take() {
            bar.finish_and_clear();
            if let Some(multi) = &self.multi_progress {
                multi.remove(&bar);
            }
        }
    }
}

/// Reports stage boundaries as `info` events instead of drawing bars, for
/// non-interactive runs.
pub struct TracingProgress {
    stage: Cow<'static, str>,
    total: AtomicU64,
    done: AtomicU64,
}

impl TracingProgress {
    pub fn new(stage: impl Into<Cow<'static, str>>) -> Self {
        Self {
            stage: stage.into(),
            total: AtomicU64::new(0),
            done: AtomicU64::new(0),
        }
    }
}

impl ProgressReporter for TracingProgress {
    fn initialize(&self, total_items: u64) {
        self.total.fetch_add(total_items, Ordering::Relaxed);
        info!(target: "fnbound::progress", stage = %self.stage, items = total_items, "Stage started");
    }

    fn progress(&self) {
        self.done.fetch_add(1, Ordering::Relaxed);
    }

    fn sub_progress(&self, stage: Cow<'static, str>) -> Self {
        Self::new(stage)
    }
}

impl Drop for TracingProgress {
    fn drop(&mut self) {
        info!(
            target: "fnbound::progress",
            stage = %self.stage,
            done = self.done.load(Ordering::Relaxed),
            "Stage finished"
        );
    }
}

pub fn default_progress_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec}, {eta}) {msg}")
        .unwrap()
        .progress_chars("#>-")
}
