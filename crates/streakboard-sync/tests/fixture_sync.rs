use std::path::{Path, PathBuf};

use streakboard_adapters::FixtureMailbox;
use streakboard_storage::ReportRepository;
use streakboard_sync::{process_message, MessageOutcome, SyncPipeline};

fn fixtures_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/mailbox")
}

#[tokio::test]
async fn fixture_mailbox_sync_end_to_end() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let url = format!("sqlite://{}", tmp.path().join("reports.db").display());
    let repository = ReportRepository::open(&url).await.expect("open db");
    let mailbox = FixtureMailbox::load_dir(fixtures_dir()).expect("fixtures");
    assert_eq!(mailbox.len(), 5);

    let pipeline = SyncPipeline::new(Box::new(mailbox), repository.clone());
    let first = pipeline.run_once().await.expect("first sync");
    assert_eq!(first.candidates, 5);
    assert_eq!(first.rejected, 2);
    assert_eq!(first.without_metrics, 1);
    assert_eq!(first.new_records, 2);
    assert_eq!(first.total_records, 2);

    let second = pipeline.run_once().await.expect("second sync");
    assert_eq!(second.new_records, 0);
    assert_eq!(second.total_records, 2);

    let stored = repository.get_all().await.expect("reports");
    assert_eq!(stored[0].message_id, "1990a1f0c0de0002");
    assert_eq!(
        (stored[0].xp, stored[0].minutes, stored[0].lessons, stored[0].streak),
        (4022, 346, 69, 55)
    );
    assert_eq!(stored[1].message_id, "1990a1f0c0de0001");
    assert_eq!(
        (stored[1].xp, stored[1].minutes, stored[1].lessons, stored[1].streak),
        (3510, 298, 61, 48)
    );
    assert_eq!(
        repository.latest_date().await.expect("latest").as_deref(),
        Some(stored[0].date.as_str())
    );
}

#[tokio::test]
async fn html_only_report_is_flattened_before_classification() {
    let message = streakboard_adapters::load_message_file(
        fixtures_dir().join("02-weekly-report-html.json"),
    )
    .expect("fixture");
    match process_message(&message) {
        MessageOutcome::Report(report) => assert_eq!(report.metrics.len(), 4),
        other => panic!("unexpected outcome {other:?}"),
    }
}
