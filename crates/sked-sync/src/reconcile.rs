use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sked_core::{
    ChangeRecord, ChangeReport, DuplicateKeyWarning, KeySpec, NaturalKey, Record, RecordDraft,
    RemovalPolicy, StoreSnapshot,
};
use tracing::warn;

/// Run metadata stamped onto every record the run writes.
#[derive(Debug, Clone)]
pub struct RunStamp {
    pub source_id: String,
    /// Human-readable label for the store root, e.g. `NFL schedule`.
    pub source_label: Option<String>,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub snapshot: StoreSnapshot,
    pub report: ChangeReport,
}

/// Merges one run's drafts into a prior snapshot. Pure: no I/O, no shared state.
#[derive(Debug, Clone)]
pub struct Reconciler {
    key_spec: KeySpec,
    removal_policy: RemovalPolicy,
}

impl Reconciler {
    pub fn new(key_spec: KeySpec, removal_policy: RemovalPolicy) -> Self {
        Self {
            key_spec,
            removal_policy,
        }
    }

    pub fn reconcile(&self, prior: &StoreSnapshot, drafts: Vec<RecordDraft>, stamp: &RunStamp) -> ReconcileOutcome {
        let mut report = ChangeReport {
            removal_policy: self.removal_policy,
            ..Default::default()
        };

        let mut order: Vec<NaturalKey> = Vec::new();
        let mut latest: BTreeMap<NaturalKey, (Record, usize)> = BTreeMap::new();

        for (idx, draft) in drafts.into_iter().enumerate() {
            match self
                .key_spec
                .build(draft, idx, Some(&stamp.source_id), Some(stamp.observed_at))
            {
                Ok(record) => match latest.get_mut(&record.key) {
                    Some((kept, seen)) => {
                        *kept = record;
                        *seen += 1;
                    }
                    None => {
                        order.push(record.key.clone());
                        latest.insert(record.key.clone(), (record, 1));
                    }
                },
                Err(err) => {
                    warn!(source_id = %stamp.source_id, error = %err, "skipping draft");
                    report.invalid.push(err);
                }
            }
        }
        report.skipped_invalid = report.invalid.len();

        let mut merged = prior.clone();
        for key in &order {
            let Some((record, seen)) = latest.get(key) else {
                continue;
            };
            if *seen > 1 {
                let warning = DuplicateKeyWarning {
                    key: key.clone(),
                    occurrences: *seen,
                };
                warn!(source_id = %stamp.source_id, "{warning}");
                report.duplicates.push(warning);
            }

            let change = match prior.get(key) {
                None => ChangeRecord::added(key.clone()),
                Some(old) => {
                    let diffs = old.diff(record);
                    if diffs.is_empty() {
                        ChangeRecord::unchanged(key.clone())
                    } else {
                        ChangeRecord::updated(key.clone(), diffs)
                    }
                }
            };
            report.changes.push(change);
            merged.upsert(record.clone());
        }

        for key in prior.keys() {
            if latest.contains_key(key) {
                continue;
            }
            report.changes.push(ChangeRecord::removed(key.clone()));
            if self.removal_policy == RemovalPolicy::Drop {
                merged.remove(key);
            }
        }

        if let Some(label) = &stamp.source_label {
            merged.meta.source = Some(label.clone());
        }
        if report.has_mutations() {
            merged.meta.last_updated = Some(stamp.observed_at);
        }

        ReconcileOutcome {
            snapshot: merged,
            report,
        }
    }
}
