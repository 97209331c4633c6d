//! Freshness detection over file modification times
//!
//! A dataset is considered to have settled into a new version when a
//! large enough fraction of its files carry modification times newer
//! than the last published version. The version timestamp assigned to
//! a settled dataset is the *majority minute*: the minute-truncated
//! mtime that occurs most often across the scan. Using the majority
//! rather than the maximum resists a few stale stragglers and a few
//! premature writers alike.

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::scan::FileObservation;

/// Default fraction of files that must be newer than `last_updated`
pub const DEFAULT_NEWER_RATIO_THRESHOLD: f64 = 0.30;

/// Two reports agree when their ratios differ by no more than this
pub const STABILITY_TOLERANCE: f64 = 0.01;

/// Granularity to which modification times are truncated before any
/// comparison or counting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MtimeGranularity {
    #[default]
    Minute,
}

impl MtimeGranularity {
    /// Truncate a timestamp to this granularity
    #[must_use]
    pub fn truncate(self, t: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            // duration_trunc only fails on out-of-range timestamps
            Self::Minute => t.duration_trunc(TimeDelta::minutes(1)).unwrap_or(t),
        }
    }
}

/// Result of evaluating one scan against the current version
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FreshnessReport {
    /// Number of tabular files observed
    pub total: usize,
    /// Files whose truncated mtime is strictly newer than `last_updated`
    pub newer_count: usize,
    /// `newer_count / total`
    pub newer_ratio: f64,
    /// Most frequent truncated mtime; ties resolved to the later minute
    pub majority_minute: DateTime<Utc>,
}

impl FreshnessReport {
    /// Whether the dataset crossed the freshness threshold
    #[must_use]
    pub fn is_fresh(&self, threshold: f64) -> bool {
        self.newer_ratio >= threshold
    }

    /// Whether a re-scan confirms this report
    ///
    /// Two reports agree when their ratios are within
    /// [`STABILITY_TOLERANCE`] and they elected the same majority
    /// minute.
    #[must_use]
    pub fn agrees_with(&self, other: &Self) -> bool {
        (self.newer_ratio - other.newer_ratio).abs() <= STABILITY_TOLERANCE
            && self.majority_minute == other.majority_minute
    }
}

/// Evaluate one scan's observations against the current version
///
/// `last_updated` absent means the dataset has never been published;
/// every file then counts as newer. Returns `None` for an empty scan,
/// which callers treat as *not fresh*.
#[must_use]
pub fn evaluate(
    observations: &[FileObservation],
    last_updated: Option<DateTime<Utc>>,
    granularity: MtimeGranularity,
) -> Option<FreshnessReport> {
    if observations.is_empty() {
        return None;
    }

    let last_updated = last_updated.unwrap_or(DateTime::UNIX_EPOCH);

    let mut newer_count = 0_usize;
    let mut minute_counts: std::collections::HashMap<DateTime<Utc>, usize> =
        std::collections::HashMap::new();

    for obs in observations {
        let truncated = granularity.truncate(obs.mtime);
        if truncated > last_updated {
            newer_count += 1;
        }
        *minute_counts.entry(truncated).or_default() += 1;
    }

    let majority_minute = minute_counts
        .iter()
        .max_by(|(ta, ca), (tb, cb)| ca.cmp(cb).then(ta.cmp(tb)))
        .map(|(t, _)| *t)?;

    let total = observations.len();

    Some(FreshnessReport {
        total,
        newer_count,
        newer_ratio: newer_count as f64 / total as f64,
        majority_minute,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn obs(path: &str, mtime: &str) -> FileObservation {
        FileObservation {
            path: PathBuf::from(path),
            size: 1,
            mtime: ts(mtime),
        }
    }

    #[test]
    fn test_truncate_to_minute() {
        let g = MtimeGranularity::Minute;
        assert_eq!(
            g.truncate(ts("2025-02-04T20:16:42.123Z")),
            ts("2025-02-04T20:16:00Z")
        );
        assert_eq!(
            g.truncate(ts("2025-02-04T20:16:00Z")),
            ts("2025-02-04T20:16:00Z")
        );
    }

    #[test]
    fn test_empty_scan_is_not_fresh() {
        assert!(evaluate(&[], None, MtimeGranularity::Minute).is_none());
    }

    #[test]
    fn test_all_newer_without_prior_version() {
        let files = vec![
            obs("a.csv", "2025-02-04T20:16:10Z"),
            obs("b.csv", "2025-02-04T20:16:50Z"),
        ];
        let report = evaluate(&files, None, MtimeGranularity::Minute).unwrap();

        assert_eq!(report.total, 2);
        assert_eq!(report.newer_count, 2);
        assert!((report.newer_ratio - 1.0).abs() < f64::EPSILON);
        assert_eq!(report.majority_minute, ts("2025-02-04T20:16:00Z"));
    }

    #[test]
    fn test_newer_ratio_against_last_updated() {
        // 2 of 5 newer than the published minute -> ratio 0.4
        let files = vec![
            obs("a.csv", "2025-02-04T10:00:05Z"),
            obs("b.csv", "2025-02-04T10:00:30Z"),
            obs("c.csv", "2025-02-04T10:00:59Z"),
            obs("d.csv", "2025-02-04T12:30:00Z"),
            obs("e.csv", "2025-02-04T12:30:20Z"),
        ];
        let last = Some(ts("2025-02-04T10:00:00Z"));
        let report = evaluate(&files, last, MtimeGranularity::Minute).unwrap();

        assert_eq!(report.newer_count, 2);
        assert!((report.newer_ratio - 0.4).abs() < 1e-9);
        assert!(report.is_fresh(0.30));
        assert!(!report.is_fresh(0.50));
    }

    #[test]
    fn test_files_at_published_minute_are_not_newer() {
        let files = vec![obs("a.csv", "2025-02-04T10:00:45Z")];
        let last = Some(ts("2025-02-04T10:00:00Z"));
        let report = evaluate(&files, last, MtimeGranularity::Minute).unwrap();

        assert_eq!(report.newer_count, 0);
    }

    #[test]
    fn test_majority_minute_prefers_most_frequent() {
        let files = vec![
            obs("a.csv", "2025-02-04T09:00:00Z"),
            obs("b.csv", "2025-02-04T09:00:10Z"),
            obs("c.csv", "2025-02-04T09:00:20Z"),
            obs("d.csv", "2025-02-04T11:00:00Z"),
        ];
        let report = evaluate(&files, None, MtimeGranularity::Minute).unwrap();

        assert_eq!(report.majority_minute, ts("2025-02-04T09:00:00Z"));
    }

    #[test]
    fn test_majority_minute_tie_resolves_to_later() {
        let files = vec![
            obs("a.csv", "2025-02-04T09:00:00Z"),
            obs("b.csv", "2025-02-04T09:00:30Z"),
            obs("c.csv", "2025-02-04T11:00:00Z"),
            obs("d.csv", "2025-02-04T11:00:30Z"),
        ];
        let report = evaluate(&files, None, MtimeGranularity::Minute).unwrap();

        assert_eq!(report.majority_minute, ts("2025-02-04T11:00:00Z"));
    }

    #[test]
    fn test_single_file_ratio_is_zero_or_one() {
        let newer = vec![obs("a.csv", "2025-02-04T12:00:00Z")];
        let last = Some(ts("2025-02-04T10:00:00Z"));

        let report = evaluate(&newer, last, MtimeGranularity::Minute).unwrap();
        assert!((report.newer_ratio - 1.0).abs() < f64::EPSILON);
        assert!(report.is_fresh(0.30));

        let stale = vec![obs("a.csv", "2025-02-04T09:00:00Z")];
        let report = evaluate(&stale, last, MtimeGranularity::Minute).unwrap();
        assert!(report.newer_ratio.abs() < f64::EPSILON);
        assert!(!report.is_fresh(0.30));
    }

    #[test]
    fn test_agreement_tolerance() {
        let base = FreshnessReport {
            total: 100,
            newer_count: 31,
            newer_ratio: 0.31,
            majority_minute: ts("2025-02-04T20:16:00Z"),
        };

        let within = FreshnessReport {
            newer_count: 32,
            newer_ratio: 0.32,
            ..base
        };
        assert!(base.agrees_with(&within));

        let drifted = FreshnessReport {
            newer_count: 36,
            newer_ratio: 0.36,
            ..base
        };
        assert!(!base.agrees_with(&drifted));

        let moved_minute = FreshnessReport {
            majority_minute: ts("2025-02-04T20:17:00Z"),
            ..base
        };
        assert!(!base.agrees_with(&moved_minute));
    }
}
