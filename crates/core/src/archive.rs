//! Archive packaging and extraction
//!
//! One dataset version is distributed as a single deflate-compressed
//! zip whose entries are flat file basenames (no directory entries, no
//! path prefixes). Archives are written to a `.tmp` sibling and renamed
//! into place so a partial file is never exposed under its final name.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Local, NaiveDateTime, Timelike};
use color_eyre::Result;
use color_eyre::eyre::{WrapErr, eyre};
use tracing::warn;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::scan::FileObservation;

/// Timestamp layout embedded in archive file names
const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Summary of a freshly written archive
#[derive(Debug, Clone)]
pub struct ArchiveSummary {
    /// Final path of the archive
    pub archive_path: PathBuf,
    /// Number of entries written
    pub file_count: usize,
    /// Total bytes before compression
    pub uncompressed_size: u64,
    /// Size of the archive on disk
    pub compressed_size: u64,
}

/// Errors from archive extraction
///
/// Unsafe entry paths are split out from plain corruption so callers
/// can report a slipped archive differently from a truncated one.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("archive cannot be read: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("archive entry `{entry}` would escape the extraction root")]
    UnsafeEntryPath { entry: String },
}

/// File name for one dataset version: `{name}_{YYYYMMDD_HHMMSS}.zip`
#[must_use]
pub fn archive_file_name(dataset: &str, stamp: DateTime<Local>) -> String {
    format!("{dataset}_{}.zip", stamp.format(STAMP_FORMAT))
}

/// Recover the embedded timestamp from an archive file name
///
/// Returns `None` when the name does not belong to `dataset` or the
/// stamp does not parse. Retention sorts on this value.
#[must_use]
pub fn parse_archive_stamp(file_name: &str, dataset: &str) -> Option<NaiveDateTime> {
    let rest = file_name
        .strip_prefix(dataset)?
        .strip_prefix('_')?
        .strip_suffix(".zip")?;
    NaiveDateTime::parse_from_str(rest, STAMP_FORMAT).ok()
}

/// Write the given observations into a flat zip at `dest`
///
/// The archive is produced at `{dest}.tmp` and renamed on success; on
/// failure the temp file is removed and the previous archive (if any)
/// is untouched. Entry mtimes are carried over from the source files.
/// Duplicate basenames across nested directories collapse to the first
/// occurrence, with a warning.
///
/// # Errors
/// Returns an error on any I/O failure; the caller treats it as
/// retryable.
pub fn write_archive(
    source_root: &Path,
    observations: &[FileObservation],
    dest: &Path,
) -> Result<ArchiveSummary> {
    let tmp = sibling_tmp_path(dest);

    let result = write_archive_inner(source_root, observations, &tmp);

    match result {
        Ok((file_count, uncompressed_size)) => {
            fs::rename(&tmp, dest)
                .wrap_err_with(|| format!("publishing archive {}", dest.display()))?;
            let compressed_size = fs::metadata(dest)?.len();
            Ok(ArchiveSummary {
                archive_path: dest.to_path_buf(),
                file_count,
                uncompressed_size,
                compressed_size,
            })
        }
        Err(e) => {
            if let Err(cleanup) = fs::remove_file(&tmp) {
                if cleanup.kind() != io::ErrorKind::NotFound {
                    warn!("leaving temp archive {}: {cleanup}", tmp.display());
                }
            }
            Err(e)
        }
    }
}

fn write_archive_inner(
    source_root: &Path,
    observations: &[FileObservation],
    tmp: &Path,
) -> Result<(usize, u64)> {
    let file = File::create(tmp)
        .wrap_err_with(|| format!("creating temp archive {}", tmp.display()))?;
    let mut writer = ZipWriter::new(file);

    let mut seen = std::collections::HashSet::new();
    let mut file_count = 0_usize;
    let mut uncompressed_size = 0_u64;

    for obs in observations {
        let Some(basename) = obs.path.file_name().and_then(|n| n.to_str()) else {
            warn!("skipping entry with unrepresentable name: {}", obs.path.display());
            continue;
        };

        if !seen.insert(basename.to_string()) {
            warn!("duplicate basename {basename}, keeping first occurrence");
            continue;
        }

        let mut options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated);
        if let Some(stamp) = zip_entry_time(obs.mtime.with_timezone(&Local)) {
            options = options.last_modified_time(stamp);
        }

        let source = source_root.join(&obs.path);
        let mut input = File::open(&source)
            .wrap_err_with(|| format!("opening {}", source.display()))?;

        writer.start_file(basename, options)?;
        uncompressed_size += io::copy(&mut input, &mut writer)
            .wrap_err_with(|| format!("compressing {}", source.display()))?;
        file_count += 1;
    }

    writer.finish()?.sync_all()?;

    Ok((file_count, uncompressed_size))
}

/// Extract a flat archive into `dest`, which must already exist
///
/// Every entry name must be a plain basename: separators, `..`/`.`
/// segments, and absolute paths are rejected before anything is
/// written. Returns the extracted entry names.
///
/// # Errors
/// [`ExtractError::UnsafeEntryPath`] on the first hostile entry name;
/// [`ExtractError::Archive`]/[`ExtractError::Io`] on corruption or
/// filesystem failures.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<Vec<String>, ExtractError> {
    let file = File::open(archive)?;
    let mut zip = ZipArchive::new(file)?;

    let mut names = Vec::with_capacity(zip.len());

    for index in 0..zip.len() {
        let mut entry = zip.by_index(index)?;
        let name = entry.name().to_string();

        if !is_safe_entry_name(&name) {
            return Err(ExtractError::UnsafeEntryPath { entry: name });
        }

        let target = dest.join(&name);
        // Belt-and-braces: the checked name can only land inside dest
        if !target.starts_with(dest) {
            return Err(ExtractError::UnsafeEntryPath { entry: name });
        }

        let mut output = File::create(&target)?;
        io::copy(&mut entry, &mut output)?;
        names.push(name);
    }

    Ok(names)
}

/// Count the entries of an existing archive without extracting it
///
/// # Errors
/// Returns an error if the archive cannot be opened or parsed.
pub fn entry_count(archive: &Path) -> Result<usize> {
    let file = File::open(archive)
        .wrap_err_with(|| format!("opening archive {}", archive.display()))?;
    let zip = ZipArchive::new(file).map_err(|e| eyre!("reading archive: {e}"))?;
    Ok(zip.len())
}

fn is_safe_entry_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
}

fn sibling_tmp_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    dest.with_file_name(name)
}

fn zip_entry_time(t: DateTime<Local>) -> Option<zip::DateTime> {
    zip::DateTime::from_date_and_time(
        u16::try_from(t.year()).ok()?,
        t.month() as u8,
        t.day() as u8,
        t.hour() as u8,
        t.minute() as u8,
        t.second() as u8,
    )
    .ok()
}
