//! Client sync engine
//!
//! Timestamp-driven: the hub's listing declares one version timestamp
//! per dataset, and a dataset is fetched only when that timestamp is
//! ahead of the locally recorded one. Downloads are resumable through
//! HTTP ranges, extraction happens in a staging directory next to the
//! target, and the final swap is a pair of renames so the target
//! directory is never observable in a mixed state.

use std::fs;
use std::path::{Path, PathBuf};

use color_eyre::Result;
use futures_util::StreamExt;
use reqwest::StatusCode;
use reqwest::header;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use hubsync_core::archive;
use hubsync_core::config::{ClientConfig, ClientDataset, LISTING_TIMEOUT};
use hubsync_core::wire::DatasetListing;

use crate::error::{DatasetReport, SyncError, SyncOutcome};
use crate::state::SyncState;

/// Backoff doubles up to this ceiling
const MAX_BACKOFF: std::time::Duration = std::time::Duration::from_secs(60);

/// What `status` reports for one dataset without downloading anything
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanEntry {
    /// The hub has a newer version
    Behind,
    /// Local copy matches the hub
    Current,
    /// The hub has not published this dataset yet
    NotPublished,
}

enum DownloadFailure {
    Transient(String),
    Terminal(SyncError),
}

/// One client instance; datasets are processed sequentially
pub struct SyncClient {
    http: reqwest::Client,
    config: ClientConfig,
    state: SyncState,
}

impl SyncClient {
    /// Build a client from its configuration
    ///
    /// # Errors
    /// Returns an error when the HTTP client cannot be constructed or
    /// the sync state file is unreadable.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder().build()?;
        let state = SyncState::load(&config.state_file)?;
        Ok(Self {
            http,
            config,
            state,
        })
    }

    /// Sync every configured dataset, isolating per-dataset failures
    ///
    /// # Errors
    /// Returns an error only when the listing endpoint is unreachable;
    /// everything after that is reported per dataset.
    pub async fn sync_all(&mut self) -> Result<Vec<DatasetReport>, SyncError> {
        let listing = self.fetch_listing().await?;

        let datasets = self.config.datasets.clone();
        let mut reports = Vec::with_capacity(datasets.len());
        for dataset in &datasets {
            let result = self.sync_with_listing(dataset, &listing).await;
            match &result {
                Ok(SyncOutcome::Synced { version }) => {
                    info!(dataset = %dataset.name, version = %version.to_rfc3339(), "synced");
                }
                Ok(SyncOutcome::UpToDate) => {
                    debug!(dataset = %dataset.name, "up to date");
                }
                Err(e) => error!(dataset = %dataset.name, "sync failed: {e}"),
            }
            reports.push(DatasetReport {
                dataset: dataset.name.clone(),
                result,
            });
        }
        Ok(reports)
    }

    /// Sync one dataset by name
    ///
    /// # Errors
    /// All the per-dataset kinds of [`SyncError`], plus listing
    /// failures.
    pub async fn sync_dataset(&mut self, name: &str) -> Result<SyncOutcome, SyncError> {
        let dataset = self
            .config
            .datasets
            .iter()
            .find(|d| d.name == name)
            .cloned()
            .ok_or_else(|| SyncError::DatasetUnknown(name.to_string()))?;

        let listing = self.fetch_listing().await?;
        self.sync_with_listing(&dataset, &listing).await
    }

    /// Report which datasets are behind, without downloading
    ///
    /// # Errors
    /// Returns an error when the listing endpoint is unreachable.
    pub async fn plan(&self) -> Result<Vec<(String, PlanEntry)>, SyncError> {
        let listing = self.fetch_listing().await?;

        Ok(self
            .config
            .datasets
            .iter()
            .map(|dataset| {
                let entry = match listing.find(&dataset.name) {
                    None => PlanEntry::NotPublished,
                    Some(remote) => {
                        match remote.last_updated.filter(|_| remote.package_ready) {
                            None => PlanEntry::NotPublished,
                            Some(remote_version) => {
                                let local = self.state.last_updated(&dataset.name);
                                if local.is_some_and(|l| remote_version <= l) {
                                    PlanEntry::Current
                                } else {
                                    PlanEntry::Behind
                                }
                            }
                        }
                    }
                };
                (dataset.name.clone(), entry)
            })
            .collect())
    }

    async fn sync_with_listing(
        &mut self,
        dataset: &ClientDataset,
        listing: &DatasetListing,
    ) -> Result<SyncOutcome, SyncError> {
        let remote = listing
            .find(&dataset.name)
            .ok_or_else(|| SyncError::DatasetUnknown(dataset.name.clone()))?;

        // Nothing published yet counts as nothing to fetch
        let Some(remote_version) = remote.last_updated.filter(|_| remote.package_ready) else {
            debug!(dataset = %dataset.name, "no package published yet");
            return Ok(SyncOutcome::UpToDate);
        };

        if let Some(local) = self.state.last_updated(&dataset.name) {
            if remote_version <= local {
                if remote_version == local {
                    // Idempotent refresh of the recorded timestamp
                    if let Err(e) = self.state.record(&dataset.name, remote_version) {
                        warn!(dataset = %dataset.name, "state refresh failed: {e}");
                    }
                }
                return Ok(SyncOutcome::UpToDate);
            }
        }

        info!(
            dataset = %dataset.name,
            version = %remote_version.to_rfc3339(),
            "fetching new version"
        );

        let scratch = self.config.scratch_dir(dataset);
        fs::create_dir_all(&scratch)?;
        let part = scratch.join(format!("{}.zip.part", dataset.name));

        let expected = (remote.package_size > 0).then_some(remote.package_size);
        self.download_with_retry(&dataset.name, &part, expected)
            .await?;

        let zip_path = scratch.join(format!("{}.zip", dataset.name));
        fs::rename(&part, &zip_path)?;

        let installed = install(dataset, &zip_path);
        let _ = fs::remove_file(&zip_path);
        installed?;

        // State advances only after the swap landed
        self.state
            .record(&dataset.name, remote_version)
            .map_err(|e| SyncError::State(e.to_string()))?;

        Ok(SyncOutcome::Synced {
            version: remote_version,
        })
    }

    /// Fetch the dataset listing, retrying transient failures
    async fn fetch_listing(&self) -> Result<DatasetListing, SyncError> {
        let url = self.endpoint("api/datasets");

        let mut attempt: u32 = 0;
        let mut backoff = self.config.initial_backoff();

        loop {
            let outcome = async {
                let response = self
                    .http
                    .get(&url)
                    .timeout(LISTING_TIMEOUT)
                    .send()
                    .await
                    .map_err(|e| DownloadFailure::Transient(e.to_string()))?;

                let status = response.status();
                if is_transient_status(status) {
                    return Err(DownloadFailure::Transient(format!("HTTP {status}")));
                }
                if !status.is_success() {
                    return Err(DownloadFailure::Terminal(SyncError::NetworkTerminal {
                        status,
                    }));
                }

                response
                    .json::<DatasetListing>()
                    .await
                    .map_err(|e| DownloadFailure::Transient(format!("bad listing body: {e}")))
            }
            .await;

            match outcome {
                Ok(listing) => return Ok(listing),
                Err(DownloadFailure::Terminal(err)) => return Err(err),
                Err(DownloadFailure::Transient(last)) => {
                    attempt += 1;
                    if attempt > self.config.retries.max {
                        return Err(SyncError::NetworkTransient {
                            attempts: attempt,
                            last,
                        });
                    }
                    warn!("listing attempt {attempt} failed: {last}, retrying in {backoff:?}");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    /// Download the package into `part`, resuming any previous partial
    async fn download_with_retry(
        &self,
        name: &str,
        part: &Path,
        expected: Option<u64>,
    ) -> Result<(), SyncError> {
        let mut size_retry_used = false;
        let mut attempt: u32 = 0;
        let mut backoff = self.config.initial_backoff();

        loop {
            match self.download_once(name, part).await {
                Ok(()) => {
                    let actual = fs::metadata(part)?.len();
                    if let Some(expected) = expected {
                        if actual != expected {
                            let _ = fs::remove_file(part);
                            if !size_retry_used {
                                size_retry_used = true;
                                warn!(
                                    dataset = %name,
                                    expected,
                                    actual,
                                    "size mismatch, discarding partial and retrying once"
                                );
                                continue;
                            }
                            return Err(SyncError::SizeMismatch { expected, actual });
                        }
                    }
                    return Ok(());
                }
                Err(DownloadFailure::Terminal(err)) => return Err(err),
                Err(DownloadFailure::Transient(last)) => {
                    attempt += 1;
                    if attempt > self.config.retries.max {
                        return Err(SyncError::NetworkTransient {
                            attempts: attempt,
                            last,
                        });
                    }
                    warn!(
                        dataset = %name,
                        "download attempt {attempt} failed: {last}, retrying in {backoff:?}"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    async fn download_once(&self, name: &str, part: &Path) -> Result<(), DownloadFailure> {
        let have = fs::metadata(part).map(|m| m.len()).unwrap_or(0);
        let url = self.endpoint(&format!("package/{name}.zip"));

        let mut request = self
            .http
            .get(&url)
            .timeout(self.config.download_timeout());
        if have > 0 {
            debug!(dataset = %name, offset = have, "resuming partial download");
            request = request.header(header::RANGE, format!("bytes={have}-"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| DownloadFailure::Transient(e.to_string()))?;
        let status = response.status();

        let mut file = match status {
            StatusCode::OK => tokio::fs::File::create(part)
                .await
                .map_err(|e| DownloadFailure::Terminal(e.into()))?,
            StatusCode::PARTIAL_CONTENT if have > 0 => tokio::fs::OpenOptions::new()
                .append(true)
                .open(part)
                .await
                .map_err(|e| DownloadFailure::Terminal(e.into()))?,
            StatusCode::RANGE_NOT_SATISFIABLE if have > 0 => {
                // The hub no longer honors our offset; start over
                let _ = fs::remove_file(part);
                return Err(DownloadFailure::Transient(
                    "resume offset rejected, restarting download".to_string(),
                ));
            }
            s if is_transient_status(s) => {
                return Err(DownloadFailure::Transient(format!("HTTP {s}")));
            }
            s => {
                return Err(DownloadFailure::Terminal(SyncError::NetworkTerminal {
                    status: s,
                }));
            }
        };

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| DownloadFailure::Transient(e.to_string()))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| DownloadFailure::Terminal(e.into()))?;
        }
        file.flush()
            .await
            .map_err(|e| DownloadFailure::Terminal(e.into()))?;

        Ok(())
    }

    fn endpoint(&self, path: &str) -> String {
        let base = self.config.hub.url.as_str().trim_end_matches('/');
        format!("{base}/{path}")
    }
}

/// 5xx plus the two retryable 4xx codes (408, 429)
fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

/// Extract the downloaded archive and swap it into the target directory
///
/// The staging directory is a sibling of the target so the final
/// rename stays on one filesystem. On any swap failure the previous
/// directory is restored.
fn install(dataset: &ClientDataset, zip_path: &Path) -> Result<(), SyncError> {
    let local_dir = &dataset.local_dir;
    if let Some(parent) = local_dir.parent() {
        fs::create_dir_all(parent)?;
    }

    let suffix = format!(
        "{}-{}",
        std::process::id(),
        &Uuid::new_v4().simple().to_string()[..8]
    );
    let staging = sibling_path(local_dir, &format!(".staging-{suffix}"));

    fs::create_dir_all(&staging)?;
    let entries = match archive::extract_archive(zip_path, &staging) {
        Ok(entries) => entries,
        Err(e) => {
            let _ = fs::remove_dir_all(&staging);
            return Err(SyncError::from_extract(e));
        }
    };
    debug!(dataset = %dataset.name, files = entries.len(), "staged new version");

    let old = sibling_path(local_dir, &format!(".old-{suffix}"));
    let had_previous = local_dir.exists();

    if had_previous {
        if let Err(e) = fs::rename(local_dir, &old) {
            let _ = fs::remove_dir_all(&staging);
            return Err(SyncError::SwapFailed(e));
        }
    }

    if let Err(e) = fs::rename(&staging, local_dir) {
        // Roll back: put the previous version where it was
        if had_previous {
            if let Err(restore) = fs::rename(&old, local_dir) {
                error!(
                    dataset = %dataset.name,
                    "rollback failed, previous version left at {}: {restore}",
                    old.display()
                );
            }
        }
        let _ = fs::remove_dir_all(&staging);
        return Err(SyncError::SwapFailed(e));
    }

    // Displaced and stale directories go away off the critical path
    sweep_leftovers(local_dir);

    Ok(())
}

/// Remove displaced `.old-*` and abandoned `.staging-*` siblings
fn sweep_leftovers(local_dir: &Path) {
    let Some(parent) = local_dir.parent() else {
        return;
    };
    let Some(base) = local_dir.file_name().and_then(|n| n.to_str()) else {
        return;
    };
    let Ok(entries) = fs::read_dir(parent) else {
        return;
    };

    let old_prefix = format!("{base}.old-");
    let staging_prefix = format!("{base}.staging-");

    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with(&old_prefix) || name.starts_with(&staging_prefix) {
            let path = entry.path();
            if tokio::runtime::Handle::try_current().is_ok() {
                tokio::spawn(async move {
                    let _ = tokio::fs::remove_dir_all(path).await;
                });
            } else {
                let _ = fs::remove_dir_all(path);
            }
        }
    }
}

fn sibling_path(dir: &Path, suffix: &str) -> PathBuf {
    let mut name = dir.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    dir.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hubsync_core::scan::Scanner;
    use std::io::Write as _;
    use tempfile::TempDir;

    fn dataset(dir: &TempDir) -> ClientDataset {
        ClientDataset {
            name: "quotes".to_string(),
            local_dir: dir.path().join("quotes"),
        }
    }

    fn make_archive(dir: &Path, files: &[(&str, &str)]) -> PathBuf {
        let source = dir.join("source");
        fs::create_dir_all(&source).unwrap();
        for (name, contents) in files {
            fs::write(source.join(name), contents).unwrap();
        }
        let observations = Scanner::new(&source).scan().unwrap();
        let dest = dir.join("version.zip");
        archive::write_archive(&source, &observations, &dest).unwrap();
        dest
    }

    #[test]
    fn test_install_into_empty_target() {
        let dir = TempDir::new().unwrap();
        let dataset = dataset(&dir);
        let zip = make_archive(dir.path(), &[("a.csv", "1\n"), ("b.csv", "2\n")]);

        install(&dataset, &zip).unwrap();

        assert_eq!(
            fs::read_to_string(dataset.local_dir.join("a.csv")).unwrap(),
            "1\n"
        );
        assert_eq!(
            fs::read_to_string(dataset.local_dir.join("b.csv")).unwrap(),
            "2\n"
        );
    }

    #[test]
    fn test_install_replaces_previous_version_completely() {
        let dir = TempDir::new().unwrap();
        let dataset = dataset(&dir);

        fs::create_dir_all(&dataset.local_dir).unwrap();
        fs::write(dataset.local_dir.join("stale.csv"), "old\n").unwrap();

        let zip = make_archive(dir.path(), &[("fresh.csv", "new\n")]);
        install(&dataset, &zip).unwrap();

        // Nothing from the prior version survives
        assert!(!dataset.local_dir.join("stale.csv").exists());
        assert_eq!(
            fs::read_to_string(dataset.local_dir.join("fresh.csv")).unwrap(),
            "new\n"
        );
    }

    #[test]
    fn test_zip_slip_preserves_local_dir() {
        let dir = TempDir::new().unwrap();
        let dataset = dataset(&dir);

        fs::create_dir_all(&dataset.local_dir).unwrap();
        fs::write(dataset.local_dir.join("keep.csv"), "safe\n").unwrap();

        // Hand-craft a hostile archive
        let zip_path = dir.path().join("evil.zip");
        let file = fs::File::create(&zip_path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        writer
            .start_file("../evil", zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"gotcha").unwrap();
        writer.finish().unwrap();

        let err = install(&dataset, &zip_path).unwrap_err();
        assert!(matches!(err, SyncError::ZipSlipDetected { .. }));
        assert_eq!(
            fs::read_to_string(dataset.local_dir.join("keep.csv")).unwrap(),
            "safe\n"
        );
        assert!(!dir.path().join("evil").exists());
    }

    #[test]
    fn test_invalid_archive_preserves_local_dir() {
        let dir = TempDir::new().unwrap();
        let dataset = dataset(&dir);

        fs::create_dir_all(&dataset.local_dir).unwrap();
        fs::write(dataset.local_dir.join("keep.csv"), "safe\n").unwrap();

        let zip_path = dir.path().join("broken.zip");
        fs::write(&zip_path, b"not a zip at all").unwrap();

        let err = install(&dataset, &zip_path).unwrap_err();
        assert!(matches!(err, SyncError::ArchiveInvalid(_)));
        assert!(dataset.local_dir.join("keep.csv").exists());
    }

    #[test]
    fn test_install_leaves_no_staging_or_old_dirs() {
        let dir = TempDir::new().unwrap();
        let dataset = dataset(&dir);

        fs::create_dir_all(&dataset.local_dir).unwrap();
        fs::write(dataset.local_dir.join("v1.csv"), "1\n").unwrap();

        let zip = make_archive(dir.path(), &[("v2.csv", "2\n")]);
        install(&dataset, &zip).unwrap();

        let leftovers: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .filter(|n| n.contains(".staging-") || n.contains(".old-"))
            .collect();
        assert!(leftovers.is_empty(), "leftovers: {leftovers:?}");
    }
}
