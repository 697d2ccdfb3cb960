//! Startup replay of the commit log into the column-family stores.

use anyhow::Result;
use commitlog::SegmentFailure;
use model::CfId;
use std::collections::BTreeMap;

use crate::Inner;

/// Summary of one recovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub segments_read: usize,
    pub entries_read: usize,
    pub updates_replayed: usize,
    /// Updates at or below their CF's recovery floor.
    pub updates_skipped: usize,
    /// Updates for column families the schema no longer declares.
    pub updates_unknown_cf: usize,
    pub replayed_per_cf: BTreeMap<CfId, usize>,
    /// Segments whose replay stopped early at a corrupt entry.
    pub failures: Vec<SegmentFailure>,
    /// Column families flushed after receiving replayed data.
    pub flushed: Vec<CfId>,
    pub segments_retired: usize,
}

impl RecoveryReport {
    /// `true` if every segment was replayed to its end.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Replays the commit log above each column family's recovery floor.
///
/// 1. Compute every known CF's floor: max(flush metadata, truncation
///    record, coverage of tables on disk).
/// 2. Replay the log, applying entries above their CF's floor.
/// 3. Flush every CF that received replayed data.
/// 4. Retire the segments the new floors cover.
///
/// Every store's admission guard is held exclusively, in CF-id order, for
/// the whole pass, so no write or truncate can move a floor between step 1
/// and step 4. Running it again with no writes in between replays nothing.
pub(crate) struct RecoveryManager<'a> {
    inner: &'a Inner,
}

impl<'a> RecoveryManager<'a> {
    pub(crate) fn new(inner: &'a Inner) -> Self {
        Self { inner }
    }

    pub(crate) fn run(&self) -> Result<RecoveryReport> {
        let _admissions: Vec<_> = self
            .inner
            .stores
            .values()
            .map(|store| store.admission.write())
            .collect();

        let floors = self.inner.floors();
        for (cf_id, floor) in &floors {
            tracing::debug!(cf_id, floor = %floor, "recovery floor");
        }

        let mut replayed_per_cf: BTreeMap<CfId, usize> = BTreeMap::new();
        let stats = self.inner.commit_log.recover(&floors, |_pos, mutation, update| {
            if let Some(store) = self.inner.stores.get(&update.cf_id) {
                store.apply_replayed(&mutation.key, &update.row);
                *replayed_per_cf.entry(update.cf_id).or_default() += 1;
            }
        })?;

        let mut flushed = Vec::new();
        for cf_id in replayed_per_cf.keys() {
            if let Some(store) = self.inner.stores.get(cf_id) {
                if store.flush()?.is_some() {
                    flushed.push(*cf_id);
                }
            }
        }

        let segments_retired = self.inner.discard_completed()?;

        let report = RecoveryReport {
            segments_read: stats.segments_read,
            entries_read: stats.entries_read,
            updates_replayed: stats.updates_replayed,
            updates_skipped: stats.updates_skipped,
            updates_unknown_cf: stats.updates_unknown_cf,
            replayed_per_cf,
            failures: stats.failures,
            flushed,
            segments_retired,
        };

        if report.is_clean() {
            tracing::info!(
                segments = report.segments_read,
                replayed = report.updates_replayed,
                skipped = report.updates_skipped,
                retired = report.segments_retired,
                "recovery complete"
            );
        } else {
            tracing::warn!(
                segments = report.segments_read,
                replayed = report.updates_replayed,
                skipped = report.updates_skipped,
                failed_segments = report.failures.len(),
                "recovery complete with corrupt segments"
            );
        }
        Ok(report)
    }
}
