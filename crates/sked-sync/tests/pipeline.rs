use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use sked_sync::{SyncConfig, SyncPipeline, RUN_REPORT_FILE};
use tempfile::TempDir;

const SOURCES: &str = r#"
sources:
  - source_id: nfl-schedule
    display_name: NFL schedule
    format: schedule_table
    mode: fixture
    fixture_path: fixtures/schedule.html
    store_path: data/nfl_schedule.xml
    key_fields: [week, away_team, home_team, date]
    group_by: [week, date]
    removal_policy: retain
    static_fields:
      league: NFL
"#;

fn schedule_html(first_network: &str, include_jets: bool) -> String {
    let jets = if include_jets {
        "<tr><td>Steelers at Jets</td><td>4:25p</td><td>4:25p</td><td>CBS</td></tr>"
    } else {
        ""
    };
    format!(
        r#"<table>
  <tr><th colspan="4">WEEK 1</th></tr>
  <tr><td colspan="4">Thursday, Sep 4</td></tr>
  <tr><td>Cowboys at Eagles</td><td>8:20p</td><td>8:20p</td><td>{first_network}</td></tr>
  <tr><td colspan="4">Sunday, Sep 7</td></tr>
  {jets}
  <tr><th colspan="4">WEEK 10</th></tr>
  <tr><td colspan="4">Sunday, Nov 9</td></tr>
  <tr><td>Lions at Commanders</td><td>8:20p</td><td>8:20p</td><td>NBC</td></tr>
</table>"#
    )
}

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new(html: &str) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("fixtures")).unwrap();
        std::fs::write(dir.path().join("sources.yaml"), SOURCES).unwrap();
        let ws = Self { dir };
        ws.set_fixture(html);
        ws
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn set_fixture(&self, html: &str) {
        std::fs::write(self.root().join("fixtures/schedule.html"), html).unwrap();
    }

    fn store_path(&self) -> PathBuf {
        self.root().join("data/nfl_schedule.xml")
    }

    fn backup_path(&self) -> PathBuf {
        self.root().join("data/nfl_schedule.backup.xml")
    }

    fn corrupt_copy_path(&self, hour: u32) -> PathBuf {
        self.root()
            .join(format!("data/nfl_schedule.corrupt.20250901_{hour:02}0000.xml"))
    }

    fn pipeline(&self) -> SyncPipeline {
        SyncPipeline::new(SyncConfig::for_workspace(self.root())).expect("pipeline")
    }

    fn audit_lines(&self) -> usize {
        std::fs::read_to_string(self.root().join("logs/audit.jsonl"))
            .map(|t| t.lines().count())
            .unwrap_or(0)
    }
}

fn at(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 9, 1, hour, 0, 0).single().unwrap()
}

#[tokio::test]
async fn second_identical_run_changes_nothing() {
    let ws = Workspace::new(&schedule_html("NBC", true));
    let pipeline = ws.pipeline();

    let first = pipeline.run_once_at(at(1), None, false).await.expect("first run");
    let commit = first.source("nfl-schedule").and_then(|s| s.commit.as_ref()).expect("commit");
    assert_eq!(commit.report.added(), 3);
    assert!(commit.written);
    let bytes_after_first = std::fs::read(ws.store_path()).unwrap();

    let second = pipeline.run_once_at(at(2), None, false).await.expect("second run");
    let commit = second.source("nfl-schedule").and_then(|s| s.commit.as_ref()).expect("commit");
    assert_eq!(commit.report.unchanged(), 3);
    assert!(!commit.report.has_mutations());
    assert!(!commit.written);
    assert_eq!(std::fs::read(ws.store_path()).unwrap(), bytes_after_first);
    assert_eq!(ws.audit_lines(), 6);

    let report_dir = PathBuf::from(second.reports_dir.as_deref().expect("reports dir"));
    assert!(report_dir.join(RUN_REPORT_FILE).exists());
}

#[tokio::test]
async fn store_document_is_grouped_by_week_in_numeric_order() {
    let ws = Workspace::new(&schedule_html("NBC", true));
    ws.pipeline().run_once_at(at(1), None, false).await.expect("run");

    let xml = std::fs::read_to_string(ws.store_path()).unwrap();
    let week1 = xml.find(r#"<group field="week" value="1">"#).expect("week 1 group");
    let week10 = xml.find(r#"<group field="week" value="10">"#).expect("week 10 group");
    assert!(week1 < week10);
    assert!(xml.contains(r#"key="1|Cowboys|Eagles|Thursday, Sep 4""#));
    assert!(xml.contains(r#"<field name="league">NFL</field>"#));
}

#[tokio::test]
async fn changed_field_is_backed_up_then_updated() {
    let ws = Workspace::new(&schedule_html("NBC", true));
    let pipeline = ws.pipeline();
    pipeline.run_once_at(at(1), None, false).await.expect("first run");
    let original = std::fs::read(ws.store_path()).unwrap();

    ws.set_fixture(&schedule_html("Peacock", true));
    let run = pipeline.run_once_at(at(2), None, false).await.expect("second run");
    let commit = run.source("nfl-schedule").and_then(|s| s.commit.as_ref()).expect("commit");

    assert_eq!(commit.report.updated(), 1);
    assert_eq!(commit.report.unchanged(), 2);
    assert_eq!(std::fs::read(ws.backup_path()).unwrap(), original);
    assert!(std::fs::read_to_string(ws.store_path()).unwrap().contains("Peacock"));
}

#[tokio::test]
async fn vanished_game_is_retained_and_flagged() {
    let ws = Workspace::new(&schedule_html("NBC", true));
    let pipeline = ws.pipeline();
    pipeline.run_once_at(at(1), None, false).await.expect("first run");

    ws.set_fixture(&schedule_html("NBC", false));
    let run = pipeline.run_once_at(at(2), None, false).await.expect("second run");
    let commit = run.source("nfl-schedule").and_then(|s| s.commit.as_ref()).expect("commit");

    assert_eq!(commit.report.removed(), 1);
    assert!(std::fs::read_to_string(ws.store_path()).unwrap().contains("Jets"));
}

#[tokio::test]
async fn failed_backup_leaves_store_untouched() {
    let ws = Workspace::new(&schedule_html("NBC", true));
    let pipeline = ws.pipeline();
    pipeline.run_once_at(at(1), None, false).await.expect("first run");
    let original = std::fs::read(ws.store_path()).unwrap();

    std::fs::create_dir_all(ws.backup_path()).unwrap();
    std::fs::write(ws.backup_path().join("occupied"), "x").unwrap();
    ws.set_fixture(&schedule_html("Peacock", true));

    let err = pipeline.run_once_at(at(2), None, false).await.unwrap_err();
    assert!(format!("{err:#}").contains("store left untouched"), "{err:#}");
    assert_eq!(std::fs::read(ws.store_path()).unwrap(), original);
}

#[tokio::test]
async fn corrupt_store_is_replaced_and_preserved_aside() {
    let ws = Workspace::new(&schedule_html("NBC", true));
    std::fs::create_dir_all(ws.root().join("data")).unwrap();
    std::fs::write(ws.store_path(), "<store><record key=").unwrap();

    let run = ws.pipeline().run_once_at(at(1), None, false).await.expect("run");
    let commit = run.source("nfl-schedule").and_then(|s| s.commit.as_ref()).expect("commit");

    assert!(commit.recovered_from_corrupt);
    assert_eq!(commit.report.added(), 3);
    assert_eq!(
        std::fs::read_to_string(ws.corrupt_copy_path(1)).unwrap(),
        "<store><record key="
    );
    assert!(!ws.backup_path().exists());
}

#[tokio::test]
async fn corrupt_recovery_keeps_the_last_good_backup() {
    let ws = Workspace::new(&schedule_html("NBC", true));
    let pipeline = ws.pipeline();
    pipeline.run_once_at(at(1), None, false).await.expect("first run");

    ws.set_fixture(&schedule_html("FOX", true));
    pipeline.run_once_at(at(2), None, false).await.expect("second run");
    let good_backup = std::fs::read_to_string(ws.backup_path()).unwrap();
    assert!(good_backup.contains("Steelers|Jets"));

    std::fs::write(ws.store_path(), "<store><record key=").unwrap();
    ws.set_fixture(&schedule_html("FOX", false));
    let run = pipeline.run_once_at(at(3), None, false).await.expect("third run");
    let commit = run.source("nfl-schedule").and_then(|s| s.commit.as_ref()).expect("commit");

    assert!(commit.recovered_from_corrupt);
    assert!(!std::fs::read_to_string(ws.store_path()).unwrap().contains("Jets"));
    assert_eq!(std::fs::read_to_string(ws.backup_path()).unwrap(), good_backup);
    assert_eq!(
        std::fs::read_to_string(ws.corrupt_copy_path(3)).unwrap(),
        "<store><record key="
    );
}

#[tokio::test]
async fn page_without_games_skips_the_source() {
    let ws = Workspace::new("<html><body><p>Schedule coming soon</p></body></html>");
    let run = ws.pipeline().run_once_at(at(1), None, false).await.expect("run");
    let source = run.source("nfl-schedule").expect("source report");

    assert!(source.skipped_reason.is_some());
    assert!(source.commit.is_none());
    assert!(!ws.store_path().exists());
}

#[tokio::test]
async fn dry_run_writes_nothing() {
    let ws = Workspace::new(&schedule_html("NBC", true));
    let run = ws.pipeline().diff(None).await.expect("diff");
    let commit = run.source("nfl-schedule").and_then(|s| s.commit.as_ref()).expect("commit");

    assert_eq!(commit.report.added(), 3);
    assert!(!ws.store_path().exists());
    assert!(!ws.root().join("reports").exists());
    assert_eq!(ws.audit_lines(), 0);
}
