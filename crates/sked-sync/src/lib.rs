//! Sync pipeline orchestration: source registry, fetch, reconcile, commit, report.

mod reconcile;

pub use reconcile::{ReconcileOutcome, Reconciler, RunStamp};

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sked_adapters::{
    adapter_for_format, load_fixture_page, parse_pages, AdapterContext, AdapterError, AdapterSettings,
    FetchedPage, SourceAdapter, SourceFormat,
};
use sked_core::{ChangeKind, ChangeReport, GroupingSpec, KeySpec, RecordDraft, RemovalPolicy, StoreSnapshot};
use sked_storage::{
    AuditContext, AuditLog, BackoffPolicy, BackupHandle, BackupNaming, HttpClientConfig, HttpFetcher, PageArchive,
    RecordStore, StoreError,
};
use tokio::fs;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "sked-sync";

pub const RUN_REPORT_FILE: &str = "run_report.json";
pub const RUN_BRIEF_FILE: &str = "run_brief.md";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    #[default]
    Live,
    Fixture,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupRetention {
    #[default]
    Always,
    /// Remove the backup again when the run changed nothing.
    DiscardWhenUnchanged,
}

impl FromStr for BackupRetention {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "always" => Ok(Self::Always),
            "discard_when_unchanged" => Ok(Self::DiscardWhenUnchanged),
            other => Err(format!("unknown backup retention {other:?}")),
        }
    }
}

fn parse_backup_naming(s: &str) -> Result<BackupNaming, String> {
    match s.trim().to_ascii_lowercase().as_str() {
        "fixed" => Ok(BackupNaming::Fixed),
        "timestamped" => Ok(BackupNaming::Timestamped),
        other => Err(format!("unknown backup naming {other:?}")),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub format: SourceFormat,
    #[serde(default)]
    pub mode: SourceMode,
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub fixture_path: Option<PathBuf>,
    pub store_path: PathBuf,
    pub key_fields: KeySpec,
    #[serde(default)]
    pub group_by: GroupingSpec,
    #[serde(default)]
    pub removal_policy: Option<RemovalPolicy>,
    #[serde(flatten)]
    pub adapter: AdapterSettings,
}

impl SourceConfig {
    pub fn effective_removal_policy(&self) -> RemovalPolicy {
        self.removal_policy.unwrap_or_else(|| {
            warn!(source_id = %self.source_id, "no removal_policy configured; retaining records missing from the run");
            RemovalPolicy::Retain
        })
    }
}

impl SourceRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing source registry")?;
        registry.validate()?;
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for source in &self.sources {
            if !seen.insert(source.source_id.as_str()) {
                bail!("source {} is declared more than once", source.source_id);
            }
            match source.mode {
                SourceMode::Live if source.urls.is_empty() => {
                    bail!("source {} is live but lists no urls", source.source_id)
                }
                SourceMode::Fixture if source.fixture_path.is_none() => {
                    bail!("source {} is in fixture mode without fixture_path", source.source_id)
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Enabled sources, or exactly the named one (enabled or not).
    pub fn select(&self, only: Option<&str>) -> Result<Vec<&SourceConfig>> {
        match only {
            Some(id) => {
                let source = self
                    .sources
                    .iter()
                    .find(|s| s.source_id == id)
                    .with_context(|| format!("no source named {id} in registry"))?;
                Ok(vec![source])
            }
            None => Ok(self.sources.iter().filter(|s| s.enabled).collect()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub sources_path: PathBuf,
    pub audit_log_path: PathBuf,
    pub reports_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_max_retries: usize,
    pub request_delay_ms: u64,
    pub backup_naming: BackupNaming,
    pub backup_retention: BackupRetention,
    pub abort_on_corrupt_store: bool,
    pub skip_unchanged_writes: bool,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_flag(name: &str, default: bool) -> bool {
    env_var(name)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

fn env_parse<T, E>(name: &str, parse: impl Fn(&str) -> Result<T, E>, default: T) -> T
where
    E: std::fmt::Display,
{
    match env_var(name) {
        Some(raw) => parse(&raw).unwrap_or_else(|err| {
            warn!(var = name, value = %raw, error = %err, "ignoring invalid setting");
            default
        }),
        None => default,
    }
}

impl SyncConfig {
    /// Defaults with every path relative to `root`.
    pub fn for_workspace(root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: root.into(),
            sources_path: PathBuf::from("sources.yaml"),
            audit_log_path: PathBuf::from("logs/audit.jsonl"),
            reports_dir: PathBuf::from("reports"),
            archive_dir: PathBuf::from("archive"),
            user_agent: "sked-bot/0.1".to_string(),
            http_timeout_secs: 20,
            http_max_retries: 3,
            request_delay_ms: 1000,
            backup_naming: BackupNaming::Fixed,
            backup_retention: BackupRetention::Always,
            abort_on_corrupt_store: false,
            skip_unchanged_writes: true,
        }
    }

    pub fn from_env() -> Self {
        let root = env_var("SKED_WORKSPACE").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
        let mut config = Self::for_workspace(root);
        if let Some(v) = env_var("SKED_SOURCES") {
            config.sources_path = PathBuf::from(v);
        }
        if let Some(v) = env_var("SKED_AUDIT_LOG") {
            config.audit_log_path = PathBuf::from(v);
        }
        if let Some(v) = env_var("SKED_REPORTS_DIR") {
            config.reports_dir = PathBuf::from(v);
        }
        if let Some(v) = env_var("SKED_ARCHIVE_DIR") {
            config.archive_dir = PathBuf::from(v);
        }
        if let Some(v) = env_var("SKED_USER_AGENT") {
            config.user_agent = v;
        }
        config.http_timeout_secs = env_parse("SKED_HTTP_TIMEOUT_SECS", str::parse, config.http_timeout_secs);
        config.http_max_retries = env_parse("SKED_HTTP_MAX_RETRIES", str::parse, config.http_max_retries);
        config.request_delay_ms = env_parse("SKED_REQUEST_DELAY_MS", str::parse, config.request_delay_ms);
        config.backup_naming = env_parse("SKED_BACKUP_NAMING", parse_backup_naming, config.backup_naming);
        config.backup_retention = env_parse("SKED_BACKUP_RETENTION", str::parse, config.backup_retention);
        config.abort_on_corrupt_store = env_flag("SKED_ABORT_ON_CORRUPT_STORE", config.abort_on_corrupt_store);
        config.skip_unchanged_writes = env_flag("SKED_SKIP_UNCHANGED_WRITES", config.skip_unchanged_writes);
        config
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_root.join(path)
        }
    }
}

/// Persistence seam the commit sequence runs against.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    fn describe(&self) -> String;
    async fn load(&self) -> Result<StoreSnapshot, StoreError>;
    async fn backup(&self, at: DateTime<Utc>) -> Result<BackupHandle, StoreError>;
    /// Sets an unreadable document aside without touching the routine backup.
    async fn preserve_corrupt(&self, at: DateTime<Utc>) -> Result<BackupHandle, StoreError>;
    async fn save(&self, snapshot: &StoreSnapshot, grouping: &GroupingSpec) -> Result<(), StoreError>;
    async fn discard_backup(&self, handle: &BackupHandle) -> Result<bool, StoreError>;
}

#[async_trait]
impl SnapshotStore for RecordStore {
    fn describe(&self) -> String {
        self.path().display().to_string()
    }

    async fn load(&self) -> Result<StoreSnapshot, StoreError> {
        RecordStore::load(self).await
    }

    async fn backup(&self, at: DateTime<Utc>) -> Result<BackupHandle, StoreError> {
        RecordStore::backup(self, at).await
    }

    async fn preserve_corrupt(&self, at: DateTime<Utc>) -> Result<BackupHandle, StoreError> {
        RecordStore::preserve_corrupt(self, at).await
    }

    async fn save(&self, snapshot: &StoreSnapshot, grouping: &GroupingSpec) -> Result<(), StoreError> {
        RecordStore::save(self, snapshot, grouping).await
    }

    async fn discard_backup(&self, handle: &BackupHandle) -> Result<bool, StoreError> {
        RecordStore::discard_backup(self, handle).await
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CommitOptions {
    pub backup_retention: BackupRetention,
    pub abort_on_corrupt_store: bool,
    pub skip_unchanged_writes: bool,
    /// Reconcile and report only; nothing is written.
    pub dry_run: bool,
}

impl From<&SyncConfig> for CommitOptions {
    fn from(config: &SyncConfig) -> Self {
        Self {
            backup_retention: config.backup_retention,
            abort_on_corrupt_store: config.abort_on_corrupt_store,
            skip_unchanged_writes: config.skip_unchanged_writes,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourceJob<'a> {
    pub reconciler: Reconciler,
    pub grouping: &'a GroupingSpec,
    pub stamp: RunStamp,
    pub run_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitOutcome {
    pub report: ChangeReport,
    pub written: bool,
    pub backup: Option<BackupHandle>,
    pub backup_discarded: bool,
    pub recovered_from_corrupt: bool,
    pub audit_lines: usize,
}

/// Load, reconcile, then backup -> save -> audit. A failed backup returns before
/// `save` is attempted.
pub async fn reconcile_and_commit(
    store: &dyn SnapshotStore,
    audit: Option<&AuditLog>,
    job: &SourceJob<'_>,
    drafts: Vec<RecordDraft>,
    options: CommitOptions,
) -> Result<CommitOutcome> {
    let (prior, recovered_from_corrupt) = match store.load().await {
        Ok(snapshot) => (snapshot, false),
        Err(err @ StoreError::Corrupt { .. }) if !options.abort_on_corrupt_store => {
            warn!(store = %store.describe(), error = %err, "store unreadable; continuing from an empty snapshot");
            (StoreSnapshot::empty(), true)
        }
        Err(err) => return Err(err).with_context(|| format!("loading store {}", store.describe())),
    };

    let ReconcileOutcome { snapshot, report } = job.reconciler.reconcile(&prior, drafts, &job.stamp);
    info!(store = %store.describe(), "{}", report.summary_line());

    let mut outcome = CommitOutcome {
        report,
        written: false,
        backup: None,
        backup_discarded: false,
        recovered_from_corrupt,
        audit_lines: 0,
    };
    if options.dry_run {
        return Ok(outcome);
    }

    let mutated = outcome.report.has_mutations();
    if mutated || !options.skip_unchanged_writes {
        let handle = if outcome.recovered_from_corrupt {
            store.preserve_corrupt(job.stamp.observed_at).await
        } else {
            store.backup(job.stamp.observed_at).await
        }
        .with_context(|| format!("backing up {}; store left untouched", store.describe()))?;
        store
            .save(&snapshot, job.grouping)
            .await
            .with_context(|| format!("writing store {}", store.describe()))?;
        outcome.written = true;

        if !mutated
            && !outcome.recovered_from_corrupt
            && options.backup_retention == BackupRetention::DiscardWhenUnchanged
        {
            outcome.backup_discarded = store
                .discard_backup(&handle)
                .await
                .with_context(|| format!("discarding backup of {}", store.describe()))?;
        }
        outcome.backup = Some(handle);
    } else {
        debug!(store = %store.describe(), "no mutations; store not rewritten");
    }

    if let Some(audit) = audit {
        let ctx = AuditContext {
            ts: job.stamp.observed_at,
            run_id: job.run_id,
            source: job.stamp.source_id.clone(),
        };
        outcome.audit_lines = audit
            .append(&ctx, &outcome.report)
            .await
            .with_context(|| format!("appending to {}", audit.path().display()))?;
    }

    Ok(outcome)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRunReport {
    pub source_id: String,
    pub display_name: String,
    pub store_path: String,
    pub pages: usize,
    pub drafts_parsed: usize,
    pub skipped_reason: Option<String>,
    pub commit: Option<CommitOutcome>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub observed_at: DateTime<Utc>,
    pub dry_run: bool,
    pub sources: Vec<SourceRunReport>,
    pub reports_dir: Option<String>,
}

impl SyncRunSummary {
    pub fn source(&self, source_id: &str) -> Option<&SourceRunReport> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    http: HttpFetcher,
    archive: PageArchive,
    audit: AuditLog,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: config.http_max_retries,
                ..Default::default()
            },
            request_delay: Duration::from_millis(config.request_delay_ms),
        })?;
        let archive = PageArchive::new(config.resolve(&config.archive_dir));
        let audit = AuditLog::new(config.resolve(&config.audit_log_path));
        Ok(Self {
            config,
            http,
            archive,
            audit,
        })
    }

    pub async fn run_once(&self, only: Option<&str>) -> Result<SyncRunSummary> {
        self.run_once_at(Utc::now(), only, false).await
    }

    /// Fetch and reconcile without writing anything.
    pub async fn diff(&self, only: Option<&str>) -> Result<SyncRunSummary> {
        self.run_once_at(Utc::now(), only, true).await
    }

    pub async fn run_once_at(
        &self,
        observed_at: DateTime<Utc>,
        only: Option<&str>,
        dry_run: bool,
    ) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, dry_run);
        self.run_inner(run_id, observed_at, only, dry_run)
            .instrument(span)
            .await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        observed_at: DateTime<Utc>,
        only: Option<&str>,
        dry_run: bool,
    ) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let registry = SourceRegistry::load(&self.config.resolve(&self.config.sources_path)).await?;
        let selected = registry.select(only)?;
        info!(sources = selected.len(), "sync run started");

        let mut sources = Vec::with_capacity(selected.len());
        for source in selected {
            let span = info_span!("source", source_id = %source.source_id);
            let report = self
                .run_source(run_id, observed_at, source, dry_run)
                .instrument(span)
                .await
                .with_context(|| format!("syncing source {}", source.source_id))?;
            sources.push(report);
        }

        let mut summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            observed_at,
            dry_run,
            sources,
            reports_dir: None,
        };
        if !dry_run {
            let dir = self.config.resolve(&self.config.reports_dir).join(run_id.to_string());
            summary.reports_dir = Some(dir.display().to_string());
            write_reports(&dir, &summary).await?;
        }
        Ok(summary)
    }

    async fn run_source(
        &self,
        run_id: Uuid,
        observed_at: DateTime<Utc>,
        source: &SourceConfig,
        dry_run: bool,
    ) -> Result<SourceRunReport> {
        let ctx = AdapterContext {
            run_id,
            source_id: source.source_id.clone(),
            fetched_at: observed_at,
        };
        let adapter = adapter_for_format(source.format, source.adapter.clone());
        let store_path = self.config.resolve(&source.store_path);

        let mut report = SourceRunReport {
            source_id: source.source_id.clone(),
            display_name: source.display_name.clone(),
            store_path: store_path.display().to_string(),
            pages: 0,
            drafts_parsed: 0,
            skipped_reason: None,
            commit: None,
        };

        let pages = self
            .collect_pages(adapter.as_ref(), source, &ctx)
            .await
            .context("fetching source pages")?;
        report.pages = pages.len();

        if !dry_run {
            for page in &pages {
                self.archive
                    .archive_page(observed_at, &source.source_id, page.extension(), &page.body)
                    .await?;
            }
        }

        let drafts = match parse_pages(adapter.as_ref(), &pages, &source.adapter.static_fields) {
            Ok(drafts) => drafts,
            Err(AdapterError::NoData(reason)) => {
                warn!(%reason, "source produced no records; skipping");
                report.skipped_reason = Some(reason);
                return Ok(report);
            }
            Err(err) => return Err(err).context("parsing source pages"),
        };
        report.drafts_parsed = drafts.len();

        let store = RecordStore::new(store_path).with_backup_naming(self.config.backup_naming);
        let job = SourceJob {
            reconciler: Reconciler::new(source.key_fields.clone(), source.effective_removal_policy()),
            grouping: &source.group_by,
            stamp: RunStamp {
                source_id: source.source_id.clone(),
                source_label: Some(source.display_name.clone()),
                observed_at,
            },
            run_id,
        };
        let options = CommitOptions {
            dry_run,
            ..CommitOptions::from(&self.config)
        };
        let audit = (!dry_run).then_some(&self.audit);

        report.commit = Some(reconcile_and_commit(&store, audit, &job, drafts, options).await?);
        Ok(report)
    }

    async fn collect_pages(
        &self,
        adapter: &dyn SourceAdapter,
        source: &SourceConfig,
        ctx: &AdapterContext,
    ) -> Result<Vec<FetchedPage>, AdapterError> {
        match source.mode {
            SourceMode::Live => adapter.fetch_pages(&self.http, ctx, &source.urls).await,
            SourceMode::Fixture => {
                let Some(path) = &source.fixture_path else {
                    return Err(AdapterError::NoData("no fixture_path configured".to_string()));
                };
                Ok(vec![load_fixture_page(self.config.resolve(path), ctx.fetched_at)?])
            }
        }
    }
}

pub async fn run_sync_once_from_env(only: Option<&str>) -> Result<SyncRunSummary> {
    SyncPipeline::new(SyncConfig::from_env())?.run_once(only).await
}

async fn write_reports(dir: &Path, summary: &SyncRunSummary) -> Result<()> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run report")?;
    fs::write(dir.join(RUN_REPORT_FILE), json)
        .await
        .with_context(|| format!("writing {RUN_REPORT_FILE}"))?;
    fs::write(dir.join(RUN_BRIEF_FILE), render_run_markdown(summary, true))
        .await
        .with_context(|| format!("writing {RUN_BRIEF_FILE}"))?;
    Ok(())
}

/// Markdown digest of one run. With `details`, every non-unchanged change is listed.
pub fn render_run_markdown(summary: &SyncRunSummary, details: bool) -> String {
    let mut lines = vec![
        format!("## Run `{}`{}", summary.run_id, if summary.dry_run { " (dry run)" } else { "" }),
        format!("- Observed at: {}", summary.observed_at.to_rfc3339()),
        format!("- Sources: {}", summary.sources.len()),
    ];

    for source in &summary.sources {
        lines.push(String::new());
        lines.push(format!("### {} (`{}`)", source.display_name, source.source_id));
        lines.push(format!("- store: `{}`", source.store_path));
        if let Some(reason) = &source.skipped_reason {
            lines.push(format!("- skipped: {reason}"));
            continue;
        }
        let Some(commit) = &source.commit else {
            continue;
        };
        lines.push(format!("- {}", commit.report.summary_line()));
        if commit.recovered_from_corrupt {
            lines.push("- prior store was unreadable and was replaced".to_string());
        }
        lines.push(format!(
            "- written: {}{}",
            if commit.written { "yes" } else { "no" },
            commit
                .backup
                .as_ref()
                .and_then(|b| b.path.as_ref())
                .filter(|_| !commit.backup_discarded)
                .map(|p| format!(" (backup `{}`)", p.display()))
                .unwrap_or_default()
        ));

        if details {
            for change in &commit.report.changes {
                match &change.kind {
                    ChangeKind::Unchanged => {}
                    ChangeKind::Updated { diffs } => {
                        lines.push(format!("  - updated `{}`", change.key));
                        for diff in diffs {
                            lines.push(format!("    - {diff}"));
                        }
                    }
                    kind => lines.push(format!("  - {} `{}`", kind.label(), change.key)),
                }
            }
            for dup in &commit.report.duplicates {
                lines.push(format!("  - warning: {dup}"));
            }
            for invalid in &commit.report.invalid {
                lines.push(format!("  - skipped: {invalid}"));
            }
        }
    }

    lines.push(String::new());
    lines.join("\n")
}

/// Digest of the `runs` most recent run reports under `reports_dir`.
pub fn report_markdown(runs: usize, reports_dir: &Path) -> Result<String> {
    let entries = std::fs::read_dir(reports_dir)
        .with_context(|| format!("reading {}", reports_dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false));

    let mut summaries = Vec::new();
    for entry in entries {
        let path = entry.path().join(RUN_REPORT_FILE);
        if !path.exists() {
            continue;
        }
        let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        let summary: SyncRunSummary =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        summaries.push(summary);
    }
    summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));

    let mut out = vec!["# SKED Run Report".to_string(), String::new()];
    for summary in summaries.iter().take(runs.max(1)) {
        out.push(render_run_markdown(summary, false));
    }
    if summaries.is_empty() {
        out.push("No runs recorded yet.".to_string());
    }
    Ok(out.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use sked_core::NaturalKey;
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct FakeStore {
        prior: StoreSnapshot,
        corrupt: bool,
        fail_backup: bool,
        calls: Mutex<Vec<&'static str>>,
        saved: Mutex<Option<StoreSnapshot>>,
    }

    impl FakeStore {
        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SnapshotStore for FakeStore {
        fn describe(&self) -> String {
            "fake".to_string()
        }

        async fn load(&self) -> Result<StoreSnapshot, StoreError> {
            self.calls.lock().unwrap().push("load");
            if self.corrupt {
                return Err(StoreError::Corrupt {
                    path: PathBuf::from("fake.xml"),
                    reason: "truncated document".into(),
                });
            }
            Ok(self.prior.clone())
        }

        async fn backup(&self, _at: DateTime<Utc>) -> Result<BackupHandle, StoreError> {
            self.calls.lock().unwrap().push("backup");
            if self.fail_backup {
                return Err(StoreError::BackupFailed {
                    path: PathBuf::from("fake.backup.xml"),
                    source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
                });
            }
            Ok(BackupHandle {
                path: Some(PathBuf::from("fake.backup.xml")),
                sha256: None,
                byte_size: 0,
            })
        }

        async fn preserve_corrupt(&self, _at: DateTime<Utc>) -> Result<BackupHandle, StoreError> {
            self.calls.lock().unwrap().push("preserve_corrupt");
            Ok(BackupHandle {
                path: Some(PathBuf::from("fake.corrupt.xml")),
                sha256: None,
                byte_size: 0,
            })
        }

        async fn save(&self, snapshot: &StoreSnapshot, _grouping: &GroupingSpec) -> Result<(), StoreError> {
            self.calls.lock().unwrap().push("save");
            *self.saved.lock().unwrap() = Some(snapshot.clone());
            Ok(())
        }

        async fn discard_backup(&self, _handle: &BackupHandle) -> Result<bool, StoreError> {
            self.calls.lock().unwrap().push("discard_backup");
            Ok(true)
        }
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 1, hour, 0, 0).single().unwrap()
    }

    fn job(grouping: &GroupingSpec, hour: u32) -> SourceJob<'_> {
        SourceJob {
            reconciler: Reconciler::new(KeySpec::new(["key"]).unwrap(), RemovalPolicy::Retain),
            grouping,
            stamp: RunStamp {
                source_id: "nfl-schedule".into(),
                source_label: Some("NFL schedule".into()),
                observed_at: at(hour),
            },
            run_id: Uuid::nil(),
        }
    }

    fn drafts() -> Vec<RecordDraft> {
        vec![
            RecordDraft::new().with("key", "A").with("network", "FOX"),
            RecordDraft::new().with("key", "B").with("network", "CBS"),
        ]
    }

    fn prior_from(drafts: Vec<RecordDraft>) -> StoreSnapshot {
        Reconciler::new(KeySpec::new(["key"]).unwrap(), RemovalPolicy::Retain)
            .reconcile(&StoreSnapshot::empty(), drafts, &job(&GroupingSpec::default(), 1).stamp)
            .snapshot
    }

    #[tokio::test]
    async fn failed_backup_never_reaches_save() {
        let store = FakeStore {
            fail_backup: true,
            ..Default::default()
        };
        let grouping = GroupingSpec::default();

        let err = reconcile_and_commit(&store, None, &job(&grouping, 1), drafts(), CommitOptions::default())
            .await
            .unwrap_err();

        assert!(format!("{err:#}").contains("store left untouched"));
        assert_eq!(store.calls(), vec!["load", "backup"]);
        assert!(store.saved.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn commit_runs_backup_then_save_then_audit() {
        let dir = tempdir().expect("tempdir");
        let audit = AuditLog::new(dir.path().join("audit.jsonl"));
        let store = FakeStore::default();
        let grouping = GroupingSpec::default();

        let outcome = reconcile_and_commit(&store, Some(&audit), &job(&grouping, 1), drafts(), CommitOptions::default())
            .await
            .expect("commit");

        assert_eq!(store.calls(), vec!["load", "backup", "save"]);
        assert!(outcome.written);
        assert_eq!(outcome.audit_lines, 2);
        let saved = store.saved.lock().unwrap().clone().expect("saved snapshot");
        assert!(saved.contains(&NaturalKey::from_rendered("B")));
    }

    #[tokio::test]
    async fn unchanged_run_skips_writes_but_still_audits() {
        let dir = tempdir().expect("tempdir");
        let audit = AuditLog::new(dir.path().join("audit.jsonl"));
        let store = FakeStore {
            prior: prior_from(drafts()),
            ..Default::default()
        };
        let grouping = GroupingSpec::default();
        let options = CommitOptions {
            skip_unchanged_writes: true,
            ..Default::default()
        };

        let outcome = reconcile_and_commit(&store, Some(&audit), &job(&grouping, 2), drafts(), options)
            .await
            .expect("commit");

        assert_eq!(store.calls(), vec!["load"]);
        assert!(!outcome.written);
        assert_eq!(outcome.report.unchanged(), 2);
        assert_eq!(outcome.audit_lines, 2);
    }

    #[tokio::test]
    async fn unchanged_forced_write_can_discard_backup() {
        let store = FakeStore {
            prior: prior_from(drafts()),
            ..Default::default()
        };
        let grouping = GroupingSpec::default();
        let options = CommitOptions {
            skip_unchanged_writes: false,
            backup_retention: BackupRetention::DiscardWhenUnchanged,
            ..Default::default()
        };

        let outcome = reconcile_and_commit(&store, None, &job(&grouping, 2), drafts(), options)
            .await
            .expect("commit");

        assert_eq!(store.calls(), vec!["load", "backup", "save", "discard_backup"]);
        assert!(outcome.backup_discarded);
    }

    #[tokio::test]
    async fn corrupt_store_recovers_unless_configured_to_abort() {
        let store = FakeStore {
            corrupt: true,
            ..Default::default()
        };
        let grouping = GroupingSpec::default();

        let outcome = reconcile_and_commit(&store, None, &job(&grouping, 1), drafts(), CommitOptions::default())
            .await
            .expect("recovered commit");
        assert!(outcome.recovered_from_corrupt);
        assert_eq!(outcome.report.added(), 2);
        assert_eq!(store.calls(), vec!["load", "preserve_corrupt", "save"]);

        let strict = CommitOptions {
            abort_on_corrupt_store: true,
            ..Default::default()
        };
        let err = reconcile_and_commit(&store, None, &job(&grouping, 1), drafts(), strict)
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<StoreError>(), Some(StoreError::Corrupt { .. })));
    }

    #[tokio::test]
    async fn dry_run_touches_nothing() {
        let store = FakeStore::default();
        let grouping = GroupingSpec::default();
        let options = CommitOptions {
            dry_run: true,
            ..Default::default()
        };
        let outcome = reconcile_and_commit(&store, None, &job(&grouping, 1), drafts(), options)
            .await
            .expect("dry run");
        assert_eq!(outcome.report.added(), 2);
        assert_eq!(store.calls(), vec!["load"]);
    }

    const REGISTRY: &str = r#"
sources:
  - source_id: nfl-schedule
    display_name: NFL schedule
    format: schedule_table
    mode: fixture
    fixture_path: fixtures/nfl-schedule/schedule.html
    store_path: data/nfl_schedule.xml
    key_fields: [week, away_team, home_team, date]
    group_by: [week, date]
    removal_policy: drop
    static_fields:
      league: NFL
  - source_id: nfl-teams
    display_name: NFL teams
    enabled: false
    format: roster_table
    mode: live
    urls: ["https://example.test/teams"]
    store_path: data/nfl_teams.xml
    key_fields: [team_code]
"#;

    #[test]
    fn registry_parses_and_selects_sources() {
        let registry = SourceRegistry::from_yaml_str(REGISTRY).expect("registry");
        assert_eq!(registry.sources.len(), 2);

        let schedule = &registry.sources[0];
        assert_eq!(schedule.key_fields.fields().len(), 4);
        assert_eq!(schedule.group_by.levels, vec!["week".to_string(), "date".to_string()]);
        assert_eq!(schedule.effective_removal_policy(), RemovalPolicy::Drop);
        assert_eq!(schedule.adapter.static_fields.get("league").map(String::as_str), Some("NFL"));

        let teams = &registry.sources[1];
        assert_eq!(teams.effective_removal_policy(), RemovalPolicy::Retain);

        let enabled = registry.select(None).unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(registry.select(Some("nfl-teams")).unwrap()[0].source_id, "nfl-teams");
        assert!(registry.select(Some("mlb")).is_err());
    }

    #[test]
    fn registry_rejects_inconsistent_sources() {
        let duplicate = format!("{REGISTRY}{}", &REGISTRY["\nsources:\n".len()..]);
        assert!(SourceRegistry::from_yaml_str(&duplicate).is_err());

        let no_urls = r#"
sources:
  - source_id: x
    display_name: X
    format: json_records
    store_path: x.xml
    key_fields: [key]
"#;
        assert!(SourceRegistry::from_yaml_str(no_urls).is_err());

        let empty_key = r#"
sources:
  - source_id: x
    display_name: X
    format: json_records
    mode: fixture
    fixture_path: x.json
    store_path: x.xml
    key_fields: []
"#;
        assert!(SourceRegistry::from_yaml_str(empty_key).is_err());
    }

    #[test]
    fn config_paths_resolve_against_workspace() {
        let config = SyncConfig::for_workspace("/srv/sked");
        assert_eq!(config.resolve(&config.sources_path), PathBuf::from("/srv/sked/sources.yaml"));
        assert_eq!(config.resolve(Path::new("/abs/store.xml")), PathBuf::from("/abs/store.xml"));
        assert!(config.skip_unchanged_writes);
        assert_eq!(config.backup_retention, BackupRetention::Always);
        assert_eq!("discard_when_unchanged".parse::<BackupRetention>(), Ok(BackupRetention::DiscardWhenUnchanged));
        assert_eq!(parse_backup_naming("Timestamped"), Ok(BackupNaming::Timestamped));
    }

    #[test]
    fn report_markdown_lists_latest_runs_first() {
        let dir = tempdir().expect("tempdir");
        for (hour, id) in [(1, 1u128), (3, 3), (2, 2)] {
            let summary = SyncRunSummary {
                run_id: Uuid::from_u128(id),
                started_at: at(hour),
                finished_at: at(hour),
                observed_at: at(hour),
                dry_run: false,
                sources: vec![],
                reports_dir: None,
            };
            let run_dir = dir.path().join(summary.run_id.to_string());
            std::fs::create_dir_all(&run_dir).unwrap();
            std::fs::write(run_dir.join(RUN_REPORT_FILE), serde_json::to_vec(&summary).unwrap()).unwrap();
        }

        let md = report_markdown(2, dir.path()).expect("report");
        let third = md.find(&Uuid::from_u128(3).to_string()).expect("latest run");
        let second = md.find(&Uuid::from_u128(2).to_string()).expect("second run");
        assert!(third < second);
        assert!(!md.contains(&Uuid::from_u128(1).to_string()));
    }
}
