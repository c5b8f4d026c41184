//! Core record model for SKED: drafts, keyed records, snapshots and change reports.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "sked-core";

/// Group label used when a record lacks a grouping field.
pub const UNKNOWN_GROUP: &str = "Unknown";

/// Separator between key-field values in a rendered natural key.
pub const KEY_SEPARATOR: char = '|';
/// Escapes `KEY_SEPARATOR` (and itself) inside the parts of a composite key.
pub const KEY_ESCAPE: char = '\\';

/// Flat, untyped handoff from adapters into the reconciler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordDraft {
    pub fields: BTreeMap<String, String>,
}

impl RecordDraft {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            fields: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn with(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(field, value);
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(field.into(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Stable identity of a record across runs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NaturalKey(String);

impl NaturalKey {
    /// Wraps an already-rendered key, as read back from a persisted store.
    pub fn from_rendered(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeySpecError {
    #[error("key spec must name at least one field")]
    Empty,
    #[error("key spec names field {0:?} more than once")]
    DuplicateField(String),
}

/// A draft rejected because one or more key fields are absent or blank.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("draft #{draft_index} has no usable natural key (missing: {})", .missing.join(", "))]
pub struct InvalidKeyError {
    pub draft_index: usize,
    pub missing: Vec<String>,
}

/// Two or more drafts of one run shared a key; the last one was kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateKeyWarning {
    pub key: NaturalKey,
    pub occurrences: usize,
}

impl fmt::Display for DuplicateKeyWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "key {} appeared {} times in one run; last occurrence kept",
            self.key, self.occurrences
        )
    }
}

/// Ordered list of fields that together form the natural key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct KeySpec {
    fields: Vec<String>,
}

impl KeySpec {
    pub fn new<S: Into<String>>(fields: impl IntoIterator<Item = S>) -> Result<Self, KeySpecError> {
        let fields: Vec<String> = fields.into_iter().map(Into::into).collect();
        if fields.is_empty() {
            return Err(KeySpecError::Empty);
        }
        for (i, field) in fields.iter().enumerate() {
            if fields[..i].contains(field) {
                return Err(KeySpecError::DuplicateField(field.clone()));
            }
        }
        Ok(Self { fields })
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Renders the natural key for a draft, or reports every missing/blank key field.
    pub fn key_for(&self, draft: &RecordDraft, draft_index: usize) -> Result<NaturalKey, InvalidKeyError> {
        let mut parts = Vec::with_capacity(self.fields.len());
        let mut missing = Vec::new();
        for field in &self.fields {
            match draft.get(field).map(str::trim) {
                Some(value) if !value.is_empty() => parts.push(value),
                _ => missing.push(field.clone()),
            }
        }
        if !missing.is_empty() {
            return Err(InvalidKeyError {
                draft_index,
                missing,
            });
        }
        if let [only] = parts.as_slice() {
            return Ok(NaturalKey((*only).to_string()));
        }
        let mut rendered = String::new();
        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                rendered.push(KEY_SEPARATOR);
            }
            for ch in part.chars() {
                if ch == KEY_SEPARATOR || ch == KEY_ESCAPE {
                    rendered.push(KEY_ESCAPE);
                }
                rendered.push(ch);
            }
        }
        Ok(NaturalKey(rendered))
    }

    pub fn build(
        &self,
        draft: RecordDraft,
        draft_index: usize,
        source: Option<&str>,
        observed_at: Option<DateTime<Utc>>,
    ) -> Result<Record, InvalidKeyError> {
        let key = self.key_for(&draft, draft_index)?;
        Ok(Record {
            key,
            fields: draft.fields,
            source: source.map(str::to_string),
            observed_at,
        })
    }
}

impl TryFrom<Vec<String>> for KeySpec {
    type Error = KeySpecError;

    fn try_from(fields: Vec<String>) -> Result<Self, Self::Error> {
        Self::new(fields)
    }
}

impl From<KeySpec> for Vec<String> {
    fn from(spec: KeySpec) -> Self {
        spec.fields
    }
}

/// A keyed record. `source` and `observed_at` sit outside the compared field set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub key: NaturalKey,
    pub fields: BTreeMap<String, String>,
    pub source: Option<String>,
    pub observed_at: Option<DateTime<Utc>>,
}

impl Record {
    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    /// String-exact comparison over the union of both field sets; an absent field
    /// compares as the empty string.
    pub fn diff(&self, newer: &Record) -> Vec<FieldDiff> {
        let mut names: Vec<&String> = self.fields.keys().chain(newer.fields.keys()).collect();
        names.sort();
        names.dedup();

        names
            .into_iter()
            .filter_map(|name| {
                let old = self.get(name).unwrap_or_default();
                let new = newer.get(name).unwrap_or_default();
                (old != new).then(|| FieldDiff {
                    field: name.clone(),
                    old: old.to_string(),
                    new: new.to_string(),
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDiff {
    pub field: String,
    pub old: String,
    pub new: String,
}

impl fmt::Display for FieldDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: '{}' -> '{}'", self.field, self.old, self.new)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub source: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Full store state. Keyed by natural key, so a key can never appear twice.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreSnapshot {
    pub meta: SnapshotMeta,
    records: BTreeMap<NaturalKey, Record>,
}

impl StoreSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_meta(meta: SnapshotMeta) -> Self {
        Self {
            meta,
            records: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, key: &NaturalKey) -> Option<&Record> {
        self.records.get(key)
    }

    pub fn contains(&self, key: &NaturalKey) -> bool {
        self.records.contains_key(key)
    }

    /// Inserts or replaces the record under its key, returning the previous one.
    pub fn upsert(&mut self, record: Record) -> Option<Record> {
        self.records.insert(record.key.clone(), record)
    }

    pub fn remove(&mut self, key: &NaturalKey) -> Option<Record> {
        self.records.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &NaturalKey> {
        self.records.keys()
    }

    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }
}

/// Where a prior record absent from the new run ends up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalPolicy {
    /// New records are a partial view; keep the record and flag it.
    #[default]
    Retain,
    /// New records are authoritative; delete the record.
    Drop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Updated { diffs: Vec<FieldDiff> },
    Unchanged,
    Removed,
}

impl ChangeKind {
    pub fn label(&self) -> &'static str {
        match self {
            ChangeKind::Added => "added",
            ChangeKind::Updated { .. } => "updated",
            ChangeKind::Unchanged => "unchanged",
            ChangeKind::Removed => "removed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub key: NaturalKey,
    #[serde(flatten)]
    pub kind: ChangeKind,
}

impl ChangeRecord {
    pub fn added(key: NaturalKey) -> Self {
        Self {
            key,
            kind: ChangeKind::Added,
        }
    }

    pub fn updated(key: NaturalKey, diffs: Vec<FieldDiff>) -> Self {
        Self {
            key,
            kind: ChangeKind::Updated { diffs },
        }
    }

    pub fn unchanged(key: NaturalKey) -> Self {
        Self {
            key,
            kind: ChangeKind::Unchanged,
        }
    }

    pub fn removed(key: NaturalKey) -> Self {
        Self {
            key,
            kind: ChangeKind::Removed,
        }
    }
}

/// Outcome of one reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeReport {
    pub changes: Vec<ChangeRecord>,
    pub duplicates: Vec<DuplicateKeyWarning>,
    pub invalid: Vec<InvalidKeyError>,
    pub skipped_invalid: usize,
    pub removal_policy: RemovalPolicy,
}

impl ChangeReport {
    fn count(&self, pred: impl Fn(&ChangeKind) -> bool) -> usize {
        self.changes.iter().filter(|c| pred(&c.kind)).count()
    }

    pub fn added(&self) -> usize {
        self.count(|k| matches!(k, ChangeKind::Added))
    }

    pub fn updated(&self) -> usize {
        self.count(|k| matches!(k, ChangeKind::Updated { .. }))
    }

    pub fn unchanged(&self) -> usize {
        self.count(|k| matches!(k, ChangeKind::Unchanged))
    }

    pub fn removed(&self) -> usize {
        self.count(|k| matches!(k, ChangeKind::Removed))
    }

    pub fn change_for(&self, key: &NaturalKey) -> Option<&ChangeRecord> {
        self.changes.iter().find(|c| &c.key == key)
    }

    /// True when persisting the merged snapshot would alter the stored records.
    pub fn has_mutations(&self) -> bool {
        self.added() > 0
            || self.updated() > 0
            || (self.removal_policy == RemovalPolicy::Drop && self.removed() > 0)
    }

    pub fn summary_line(&self) -> String {
        format!(
            "{} added, {} updated, {} unchanged, {} removed, {} skipped (invalid key), {} duplicate keys",
            self.added(),
            self.updated(),
            self.unchanged(),
            self.removed(),
            self.skipped_invalid,
            self.duplicates.len()
        )
    }
}

/// Presentation-only nesting of records, e.g. `[week, date]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupingSpec {
    pub levels: Vec<String>,
}

impl GroupingSpec {
    pub fn new<S: Into<String>>(levels: impl IntoIterator<Item = S>) -> Self {
        Self {
            levels: levels.into_iter().map(Into::into).collect(),
        }
    }

    pub fn group_value<'a>(record: &'a Record, field: &str) -> &'a str {
        match record.get(field).map(str::trim) {
            Some(value) if !value.is_empty() => value,
            _ => UNKNOWN_GROUP,
        }
    }
}

/// Numeric-aware ordering for group labels: `2` before `10`, `Unknown` last.
pub fn compare_group_values(a: &str, b: &str) -> Ordering {
    match (a == UNKNOWN_GROUP, b == UNKNOWN_GROUP) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Greater,
        (false, true) => return Ordering::Less,
        _ => {}
    }
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}
