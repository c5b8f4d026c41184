use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use sked_core::{ChangeKind, ChangeReport, FieldDiff};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::StoreError;

/// Identifies the run every audit line belongs to.
#[derive(Debug, Clone)]
pub struct AuditContext {
    pub ts: DateTime<Utc>,
    pub run_id: Uuid,
    pub source: String,
}

#[derive(Debug, Serialize)]
struct AuditLine<'a> {
    ts: String,
    run_id: Uuid,
    source: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    key: Option<&'a str>,
    change: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    diffs: Option<&'a [FieldDiff]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    occurrences: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    draft_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    missing: Option<&'a [String]>,
}

impl<'a> AuditLine<'a> {
    fn new(ctx: &'a AuditContext, change: &'a str) -> Self {
        Self {
            ts: ctx.ts.to_rfc3339_opts(SecondsFormat::Secs, true),
            run_id: ctx.run_id,
            source: &ctx.source,
            key: None,
            change,
            diffs: None,
            occurrences: None,
            draft_index: None,
            missing: None,
        }
    }
}

/// Append-only JSON-lines change log shared by every source.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn render(ctx: &AuditContext, report: &ChangeReport) -> Result<String, serde_json::Error> {
        let mut out = String::new();
        let mut push = |line: AuditLine<'_>| -> Result<(), serde_json::Error> {
            out.push_str(&serde_json::to_string(&line)?);
            out.push('\n');
            Ok(())
        };

        for change in &report.changes {
            let mut line = AuditLine::new(ctx, change.kind.label());
            line.key = Some(change.key.as_str());
            if let ChangeKind::Updated { diffs } = &change.kind {
                line.diffs = Some(diffs.as_slice());
            }
            push(line)?;
        }
        for dup in &report.duplicates {
            let mut line = AuditLine::new(ctx, "duplicate_key");
            line.key = Some(dup.key.as_str());
            line.occurrences = Some(dup.occurrences);
            push(line)?;
        }
        for invalid in &report.invalid {
            let mut line = AuditLine::new(ctx, "skipped_invalid");
            line.draft_index = Some(invalid.draft_index);
            line.missing = Some(invalid.missing.as_slice());
            push(line)?;
        }
        Ok(out)
    }

    /// Returns the number of lines written.
    pub async fn append(&self, ctx: &AuditContext, report: &ChangeReport) -> Result<usize, StoreError> {
        let audit_err = |source: std::io::Error| StoreError::Audit {
            path: self.path.clone(),
            source,
        };

        let body = Self::render(ctx, report).map_err(|err| audit_err(err.into()))?;
        let lines = body.lines().count();
        if lines == 0 {
            return Ok(0);
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(audit_err)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(audit_err)?;
        file.write_all(body.as_bytes()).await.map_err(audit_err)?;
        file.flush().await.map_err(audit_err)?;
        Ok(lines)
    }
}
