//! Source adapter contracts + generic table/JSON adapters that turn fetched pages
//! into record drafts.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sked_core::RecordDraft;
use sked_storage::{FetchError, HttpFetcher};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "sked-adapters";

pub const DEFAULT_TABLE_SELECTOR: &str = "table";
pub const MATCHUP_COLUMN: &str = "matchup";

const MIN_GAME_CELLS: usize = 3;

const DAY_NAMES: [&str; 7] = [
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
    "Sunday",
];

const MONTH_NAMES: [&str; 13] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Sept", "Oct", "Nov", "Dec",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    ScheduleTable,
    RosterTable,
    JsonRecords,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

impl FetchedPage {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// File extension used when archiving the page.
    pub fn extension(&self) -> &'static str {
        let content_type = self.content_type.as_deref().unwrap_or_default();
        if content_type.contains("json") || self.url.ends_with(".json") {
            "json"
        } else if content_type.contains("html") || self.url.ends_with(".html") || self.url.ends_with(".htm") {
            "html"
        } else {
            "bin"
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub source_id: String,
    pub fetched_at: DateTime<Utc>,
}

/// Per-source parsing knobs, read from the source registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterSettings {
    #[serde(default)]
    pub table_selector: Option<String>,
    /// Field names by cell position. For schedules a `matchup` column expands into
    /// `away_team`, `home_team` and `location_note`.
    #[serde(default)]
    pub columns: Vec<String>,
    /// JSON pointer to the records array, e.g. `/games`.
    #[serde(default)]
    pub records_pointer: Option<String>,
    /// Filled into every draft that lacks the field.
    #[serde(default)]
    pub static_fields: BTreeMap<String, String>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    /// The page parsed but held nothing to reconcile.
    #[error("no data: {0}")]
    NoData(String),
    #[error("malformed input: {0}")]
    Malformed(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl AdapterError {
    pub fn is_no_data(&self) -> bool {
        matches!(self, AdapterError::NoData(_))
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn format(&self) -> SourceFormat;

    async fn fetch_pages(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        urls: &[String],
    ) -> Result<Vec<FetchedPage>, AdapterError> {
        let mut pages = Vec::with_capacity(urls.len());
        for url in urls {
            let resp = http.fetch_bytes(ctx.run_id, &ctx.source_id, url).await?;
            debug!(url = %resp.final_url, bytes = resp.body.len(), "page fetched");
            pages.push(FetchedPage {
                url: resp.final_url,
                content_type: resp.content_type,
                body: resp.body,
                fetched_at: ctx.fetched_at,
            });
        }
        Ok(pages)
    }

    fn parse_page(&self, page: &FetchedPage) -> Result<Vec<RecordDraft>, AdapterError>;
}

pub fn load_fixture_page(path: impl AsRef<Path>, fetched_at: DateTime<Utc>) -> Result<FetchedPage, AdapterError> {
    let path = path.as_ref();
    let body = fs::read(path).map_err(|source| AdapterError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let content_type = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => Some("application/json".to_string()),
        Some("html") | Some("htm") => Some("text/html".to_string()),
        _ => None,
    };
    Ok(FetchedPage {
        url: format!("file://{}", path.display()),
        content_type,
        body,
        fetched_at,
    })
}

/// Parses every page and applies static fields. A page without data is tolerated
/// as long as some page produced drafts.
pub fn parse_pages(
    adapter: &dyn SourceAdapter,
    pages: &[FetchedPage],
    static_fields: &BTreeMap<String, String>,
) -> Result<Vec<RecordDraft>, AdapterError> {
    debug!(format = ?adapter.format(), pages = pages.len(), "parsing pages");
    let mut drafts = Vec::new();
    let mut last_no_data = None;
    for page in pages {
        match adapter.parse_page(page) {
            Ok(mut parsed) => drafts.append(&mut parsed),
            Err(AdapterError::NoData(reason)) => {
                warn!(url = %page.url, %reason, "page yielded no records");
                last_no_data = Some(reason);
            }
            Err(err) => return Err(err),
        }
    }

    if drafts.is_empty() {
        return Err(AdapterError::NoData(
            last_no_data.unwrap_or_else(|| "no pages to parse".to_string()),
        ));
    }

    for draft in &mut drafts {
        for (field, value) in static_fields {
            draft
                .fields
                .entry(field.clone())
                .or_insert_with(|| value.clone());
        }
    }
    Ok(drafts)
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Malformed(format!("invalid selector {selector:?}: {e}")))
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn cell_text(cell: ElementRef<'_>) -> String {
    collapse_whitespace(&cell.text().collect::<Vec<_>>().join(" "))
}

struct TableRow {
    cells: Vec<String>,
    is_header: bool,
}

fn table_rows(table: ElementRef<'_>, row_sel: &Selector, cell_sel: &Selector) -> Vec<TableRow> {
    table
        .select(row_sel)
        .map(|row| {
            let cells: Vec<ElementRef<'_>> = row.select(cell_sel).collect();
            let is_header = !cells.is_empty() && cells.iter().all(|c| c.value().name() == "th");
            TableRow {
                cells: cells.into_iter().map(cell_text).collect(),
                is_header,
            }
        })
        .collect()
}

fn select_tables<'a>(document: &'a Html, selector: &str) -> Result<Vec<ElementRef<'a>>, AdapterError> {
    let sel = parse_selector(selector)?;
    let tables: Vec<ElementRef<'a>> = document.select(&sel).collect();
    if tables.is_empty() {
        return Err(AdapterError::NoData(format!("no element matches {selector:?}")));
    }
    Ok(tables)
}

/// Lowercase snake_case field name for a header label, e.g. `Team Name` -> `team_name`.
pub fn to_field_name(label: &str) -> String {
    let mut out = String::with_capacity(label.len());
    for ch in label.chars() {
        if ch.is_alphanumeric() {
            out.extend(ch.to_lowercase());
        } else if !out.ends_with('_') && !out.is_empty() {
            out.push('_');
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matchup {
    pub away_team: String,
    pub home_team: String,
    pub location_note: String,
}

/// Splits `Cowboys at Eagles (London)` style text. Text without a recognised
/// separator becomes the away team with an empty home team.
pub fn parse_matchup(text: &str) -> Matchup {
    let mut teams_text = text.to_string();
    let mut location_note = String::new();
    if let Some(open) = teams_text.find('(') {
        if let Some(close_rel) = teams_text[open..].find(')') {
            let close = open + close_rel;
            location_note = teams_text[open + 1..close].trim().to_string();
            teams_text.replace_range(open..=close, "");
        }
    }
    let teams_text = collapse_whitespace(&teams_text);

    for separator in [" at ", " @ ", " vs. ", " vs "] {
        if let Some((away, home)) = teams_text.split_once(separator) {
            return Matchup {
                away_team: away.trim().to_string(),
                home_team: home.trim().to_string(),
                location_note,
            };
        }
    }
    Matchup {
        away_team: teams_text,
        home_team: String::new(),
        location_note,
    }
}

fn has_matchup_separator(text: &str) -> bool {
    [" at ", " @ ", " vs. ", " vs "].iter().any(|s| text.contains(s))
}

/// Week number from a `WEEK 3` style header.
pub fn extract_week_number(text: &str) -> Option<String> {
    let upper = text.to_uppercase();
    let mut rest = upper.as_str();
    while let Some(pos) = rest.find("WEEK") {
        let after = rest[pos + 4..].trim_start();
        let digits: String = after.chars().take_while(char::is_ascii_digit).collect();
        if !digits.is_empty() && after.len() < rest[pos + 4..].len() {
            return Some(digits);
        }
        rest = &rest[pos + 4..];
    }
    None
}

/// `Thursday, Sep 4`, `Thu Sep 4` and `Thurs. Sep 4` all count.
fn is_date_header(text: &str) -> bool {
    let has_day = text
        .split(|c: char| !c.is_ascii_alphabetic())
        .any(is_day_word);
    has_day && MONTH_NAMES.iter().any(|m| text.contains(m))
}

fn is_day_word(word: &str) -> bool {
    if word.len() < 3 {
        return false;
    }
    let word = word.to_ascii_lowercase();
    DAY_NAMES
        .iter()
        .any(|day| day.to_ascii_lowercase().starts_with(&word))
}

/// Schedule pages: week header rows, date header rows, then one row per game.
#[derive(Debug, Clone)]
pub struct ScheduleTableAdapter {
    settings: AdapterSettings,
}

impl ScheduleTableAdapter {
    pub fn new(settings: AdapterSettings) -> Self {
        Self { settings }
    }

    fn columns(&self) -> Vec<String> {
        if self.settings.columns.is_empty() {
            [MATCHUP_COLUMN, "time_et", "time_local", "network"]
                .iter()
                .map(|c| c.to_string())
                .collect()
        } else {
            self.settings.columns.clone()
        }
    }
}

#[async_trait]
impl SourceAdapter for ScheduleTableAdapter {
    fn format(&self) -> SourceFormat {
        SourceFormat::ScheduleTable
    }

    fn parse_page(&self, page: &FetchedPage) -> Result<Vec<RecordDraft>, AdapterError> {
        let document = Html::parse_document(&page.text());
        let selector = self
            .settings
            .table_selector
            .as_deref()
            .unwrap_or(DEFAULT_TABLE_SELECTOR);
        let row_sel = parse_selector("tr")?;
        let cell_sel = parse_selector("td, th")?;
        let columns = self.columns();

        let mut drafts = Vec::new();
        for table in select_tables(&document, selector)? {
            let mut current_week: Option<String> = None;
            let mut current_date: Option<String> = None;

            for row in table_rows(table, &row_sel, &cell_sel) {
                let joined = row.cells.join(" ");
                if let Some(week) = extract_week_number(&joined) {
                    current_week = Some(week);
                } else if is_date_header(&joined) && !row.cells.first().is_some_and(|c| has_matchup_separator(c)) {
                    current_date = Some(joined);
                } else if row.cells.len() >= MIN_GAME_CELLS
                    && row.cells.first().is_some_and(|c| has_matchup_separator(c))
                {
                    let mut draft = RecordDraft::new();
                    if let Some(week) = &current_week {
                        draft.insert("week", week.clone());
                    }
                    if let Some(date) = &current_date {
                        draft.insert("date", date.clone());
                    }
                    for (idx, column) in columns.iter().enumerate() {
                        let value = row.cells.get(idx).cloned().unwrap_or_default();
                        if column == MATCHUP_COLUMN {
                            let matchup = parse_matchup(&value);
                            draft.insert("away_team", matchup.away_team);
                            draft.insert("home_team", matchup.home_team);
                            draft.insert("location_note", matchup.location_note);
                        } else {
                            draft.insert(column.clone(), value);
                        }
                    }
                    drafts.push(draft);
                }
            }
        }

        if drafts.is_empty() {
            return Err(AdapterError::NoData(format!("no game rows in {}", page.url)));
        }
        Ok(drafts)
    }
}

/// Roster pages: a header row naming the columns, one data row per team or player.
#[derive(Debug, Clone)]
pub struct RosterTableAdapter {
    settings: AdapterSettings,
}

impl RosterTableAdapter {
    pub fn new(settings: AdapterSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl SourceAdapter for RosterTableAdapter {
    fn format(&self) -> SourceFormat {
        SourceFormat::RosterTable
    }

    fn parse_page(&self, page: &FetchedPage) -> Result<Vec<RecordDraft>, AdapterError> {
        let document = Html::parse_document(&page.text());
        let selector = self
            .settings
            .table_selector
            .as_deref()
            .unwrap_or(DEFAULT_TABLE_SELECTOR);
        let row_sel = parse_selector("tr")?;
        let cell_sel = parse_selector("td, th")?;

        let mut drafts = Vec::new();
        for table in select_tables(&document, selector)? {
            let rows = table_rows(table, &row_sel, &cell_sel);
            let columns: Vec<String> = if self.settings.columns.is_empty() {
                match rows.iter().find(|r| r.is_header) {
                    Some(header) => header.cells.iter().map(|c| to_field_name(c)).collect(),
                    None => {
                        return Err(AdapterError::Malformed(format!(
                            "table in {} has no header row and no configured columns",
                            page.url
                        )))
                    }
                }
            } else {
                self.settings.columns.clone()
            };

            for row in rows.iter().filter(|r| !r.is_header) {
                if row.cells.len() < 2 || row.cells.iter().all(|c| c.is_empty()) {
                    continue;
                }
                let mut draft = RecordDraft::new();
                for (idx, column) in columns.iter().enumerate() {
                    if column.is_empty() {
                        continue;
                    }
                    draft.insert(column.clone(), row.cells.get(idx).cloned().unwrap_or_default());
                }
                drafts.push(draft);
            }
        }

        if drafts.is_empty() {
            return Err(AdapterError::NoData(format!("no data rows in {}", page.url)));
        }
        Ok(drafts)
    }
}

/// JSON APIs returning an array of flat objects.
#[derive(Debug, Clone)]
pub struct JsonRecordsAdapter {
    settings: AdapterSettings,
}

impl JsonRecordsAdapter {
    pub fn new(settings: AdapterSettings) -> Self {
        Self { settings }
    }
}

fn json_to_text(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

#[async_trait]
impl SourceAdapter for JsonRecordsAdapter {
    fn format(&self) -> SourceFormat {
        SourceFormat::JsonRecords
    }

    fn parse_page(&self, page: &FetchedPage) -> Result<Vec<RecordDraft>, AdapterError> {
        let value: JsonValue = serde_json::from_slice(&page.body)
            .map_err(|e| AdapterError::Malformed(format!("invalid JSON from {}: {e}", page.url)))?;

        let records = match self.settings.records_pointer.as_deref() {
            Some(pointer) => value.pointer(pointer).ok_or_else(|| {
                AdapterError::Malformed(format!("pointer {pointer:?} not found in {}", page.url))
            })?,
            None => &value,
        };
        let items = records
            .as_array()
            .ok_or_else(|| AdapterError::Malformed(format!("expected a JSON array of records in {}", page.url)))?;

        if items.is_empty() {
            return Err(AdapterError::NoData(format!("empty record array in {}", page.url)));
        }

        items
            .iter()
            .enumerate()
            .map(|(idx, item)| -> Result<RecordDraft, AdapterError> {
                let object = item.as_object().ok_or_else(|| {
                    AdapterError::Malformed(format!("record #{idx} in {} is not an object", page.url))
                })?;
                Ok(RecordDraft::from_pairs(
                    object.iter().map(|(k, v)| (k.clone(), json_to_text(v))),
                ))
            })
            .collect()
    }
}

pub fn adapter_for_format(format: SourceFormat, settings: AdapterSettings) -> Box<dyn SourceAdapter> {
    match format {
        SourceFormat::ScheduleTable => Box::new(ScheduleTableAdapter::new(settings)),
        SourceFormat::RosterTable => Box::new(RosterTableAdapter::new(settings)),
        SourceFormat::JsonRecords => Box::new(JsonRecordsAdapter::new(settings)),
    }
}
