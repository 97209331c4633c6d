//! Producer loop: detect → debounce → package → commit
//!
//! One background task drives every dataset sequentially within a tick
//! to bound disk pressure. All waits are cancellable through the
//! process-wide shutdown channel, so stopping the hub never has to sit
//! out a debounce window.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Local, TimeDelta, Utc};
use color_eyre::Result;
use color_eyre::eyre::eyre;
use tokio::sync::watch;
use tokio::task;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use hubsync_core::config::{DatasetSpec, HubConfig};
use hubsync_core::freshness::{self, FreshnessReport};
use hubsync_core::scan::Scanner;
use hubsync_core::state::StateStore;

use crate::packager::Packager;

/// What one scheduler pass decided for one dataset
#[derive(Debug)]
pub enum DatasetOutcome {
    /// Below threshold, or the source directory is empty
    NotFresh,
    /// Source directory could not be scanned
    SourceUnreadable,
    /// Last packaging trigger is within the debounce window
    TriggerTooRecent,
    /// The confirmation scan disagreed with the first
    Unstable,
    /// The stable majority minute equals the published version
    Unchanged,
    /// Shutdown interrupted the debounce wait
    Interrupted,
    /// Packaging or the state write-through failed
    Failed(color_eyre::Report),
    /// A new version was published
    Packaged {
        version: DateTime<Local>,
        file_count: usize,
        package_size: u64,
    },
}

/// Drives the per-dataset freshness pipeline on a timer
pub struct Scheduler {
    config: Arc<HubConfig>,
    store: Arc<StateStore>,
    packager: Arc<Packager>,
    shutdown: watch::Receiver<bool>,
}

impl Scheduler {
    #[must_use]
    pub fn new(
        config: Arc<HubConfig>,
        store: Arc<StateStore>,
        packager: Arc<Packager>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            store,
            packager,
            shutdown,
        }
    }

    /// Run until shutdown; the first pass starts immediately
    pub async fn run(self) {
        let mut ticks = tokio::time::interval(self.config.tick_interval());
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                _ = ticks.tick() => {}
                _ = shutdown.changed() => {
                    info!("scheduler stopping");
                    return;
                }
            }
            let _ = self.run_pass().await;
        }
    }

    /// One pass over every configured dataset
    ///
    /// Per-dataset failures never abort the siblings.
    pub async fn run_pass(&self) -> Vec<(String, DatasetOutcome)> {
        debug!("checking {} datasets", self.config.datasets.len());

        let mut outcomes = Vec::with_capacity(self.config.datasets.len());
        for spec in &self.config.datasets {
            if *self.shutdown.borrow() {
                break;
            }
            let outcome = self.process_dataset(spec).await;
            match &outcome {
                DatasetOutcome::Packaged {
                    version,
                    file_count,
                    ..
                } => info!(
                    dataset = %spec.name,
                    version = %version.to_rfc3339(),
                    files = file_count,
                    "new version published"
                ),
                DatasetOutcome::Failed(e) => {
                    error!(dataset = %spec.name, "pipeline failed: {e:#}");
                }
                other => debug!(dataset = %spec.name, "no action: {other:?}"),
            }
            outcomes.push((spec.name.clone(), outcome));
        }
        outcomes
    }

    async fn process_dataset(&self, spec: &DatasetSpec) -> DatasetOutcome {
        let source = spec.source_path(&self.config.server.data_root);
        let state = self.store.get(&spec.name).unwrap_or_default();
        let last_updated = state.last_updated.map(|t| t.with_timezone(&Utc));

        let first = match self.scan(&source, last_updated).await {
            Ok(Some(report)) => report,
            Ok(None) => {
                debug!(dataset = %spec.name, "source directory has no tabular files");
                return DatasetOutcome::NotFresh;
            }
            Err(e) => {
                warn!(dataset = %spec.name, "source unreadable, skipping: {e:#}");
                return DatasetOutcome::SourceUnreadable;
            }
        };

        if !first.is_fresh(spec.newer_ratio_threshold) {
            debug!(
                dataset = %spec.name,
                ratio = first.newer_ratio,
                threshold = spec.newer_ratio_threshold,
                "below freshness threshold"
            );
            return DatasetOutcome::NotFresh;
        }

        // The previous trigger must be at least one debounce window old
        if let Some(trigger) = state.last_trigger_at {
            let elapsed = Utc::now().signed_duration_since(trigger.with_timezone(&Utc));
            let window = TimeDelta::seconds(self.config.freshness.debounce_seconds as i64);
            if elapsed < window {
                debug!(dataset = %spec.name, "last trigger too recent, deferring");
                return DatasetOutcome::TriggerTooRecent;
            }
        }

        // Confirmation scan after the debounce window
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            () = tokio::time::sleep(self.config.debounce()) => {}
            _ = shutdown.changed() => return DatasetOutcome::Interrupted,
        }

        let second = match self.scan(&source, last_updated).await {
            Ok(Some(report)) => report,
            Ok(None) => return DatasetOutcome::Unstable,
            Err(e) => {
                warn!(dataset = %spec.name, "source unreadable on re-scan: {e:#}");
                return DatasetOutcome::SourceUnreadable;
            }
        };

        if !second.is_fresh(spec.newer_ratio_threshold) || !first.agrees_with(&second) {
            info!(
                dataset = %spec.name,
                first_ratio = first.newer_ratio,
                second_ratio = second.newer_ratio,
                "still changing, deferring to next tick"
            );
            return DatasetOutcome::Unstable;
        }

        let majority = second.majority_minute;
        if let Some(current) = last_updated {
            if majority == current {
                return DatasetOutcome::Unchanged;
            }
            if majority < current {
                warn!(
                    dataset = %spec.name,
                    majority = %majority,
                    published = %current,
                    "majority minute moved backwards, refusing to republish"
                );
                return DatasetOutcome::Unchanged;
            }
        }

        let version = majority.with_timezone(&Local);
        let summary = match self.packager.package(&spec.name, &source, version).await {
            Ok(summary) => summary,
            Err(e) => return DatasetOutcome::Failed(e),
        };

        let now = Local::now().fixed_offset();
        let committed = self.store.update(&spec.name, |s| {
            s.last_updated = Some(version.fixed_offset());
            s.file_count = summary.file_count as u64;
            s.total_size = summary.uncompressed_size;
            s.package_ready = true;
            s.package_size = summary.compressed_size;
            s.package_path = Some(summary.archive_path.clone());
            s.last_trigger_at = Some(now);
        });
        if let Err(e) = committed {
            // In-memory state already advanced; the next update retries the write
            error!(dataset = %spec.name, "state write failed: {e:#}");
        }

        DatasetOutcome::Packaged {
            version,
            file_count: summary.file_count,
            package_size: summary.compressed_size,
        }
    }

    async fn scan(
        &self,
        source: &Path,
        last_updated: Option<DateTime<Utc>>,
    ) -> Result<Option<FreshnessReport>> {
        let source = source.to_path_buf();
        let granularity = self.config.freshness.mtime_granularity;

        let observations = task::spawn_blocking(move || Scanner::new(&source).scan())
            .await
            .map_err(|e| eyre!("scan task panicked: {e}"))??;

        Ok(freshness::evaluate(&observations, last_updated, granularity))
    }
}
