use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use newsmig_core::{ContentMetadata, ContentRecord};
use newsmig_extract::{HtmlExtractor, UrlNormalizer};
use newsmig_storage::{
    AssetUploader, BackoffPolicy, LocalObjectStore, LocalSource, SourceError, SourceReader,
    UploaderConfig,
};
use newsmig_sync::{
    BatchCoordinator, ContentReconciler, CoordinatorError, MemoryPersistence, RunSummary,
};
use serde_json::json;
use tempfile::TempDir;

const JPEG: &[u8] = b"\xFF\xD8\xFF\xE0\0\x10JFIF\0";

const SCENARIO_HTML: &str = r#"<p>Opening <b>match</b> report.</p>
<img src="images/x.jpg">
<p><a href="https://youtu.be/ABC123">Watch</a></p>"#;

/// Delays reads of one path past the uploader timeout.
struct StallingSource {
    inner: LocalSource,
    stalled_path: String,
}

#[async_trait]
impl SourceReader for StallingSource {
    async fn read(&self, relative_path: &str) -> Result<Vec<u8>, SourceError> {
        if relative_path == self.stalled_path {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        self.inner.read(relative_path).await
    }
}

struct Harness {
    db: MemoryPersistence,
    source_dir: TempDir,
    store_dir: TempDir,
    stalled_path: Option<String>,
}

impl Harness {
    fn new() -> Self {
        Self {
            db: MemoryPersistence::new(),
            source_dir: tempfile::tempdir().expect("source dir"),
            store_dir: tempfile::tempdir().expect("store dir"),
            stalled_path: None,
        }
    }

    fn add_source_file(&self, relative_path: &str) {
        let path = self.source_dir.path().join(relative_path);
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(path, JPEG).expect("write source file");
    }

    fn stored_object(&self, file_name: &str) -> PathBuf {
        self.store_dir.path().join(file_name)
    }

    fn coordinator(&self, batch_size: usize) -> BatchCoordinator {
        let local = LocalSource::new(self.source_dir.path());
        let source: Arc<dyn SourceReader> = match &self.stalled_path {
            Some(stalled_path) => Arc::new(StallingSource {
                inner: local,
                stalled_path: stalled_path.clone(),
            }),
            None => Arc::new(local),
        };
        let uploader = AssetUploader::new(
            source,
            Arc::new(LocalObjectStore::new(self.store_dir.path())),
            UploaderConfig {
                timeout: Duration::from_millis(200),
                max_concurrent_uploads: 4,
                backoff: BackoffPolicy {
                    max_retries: 0,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(1),
                },
                skip_existing: false,
            },
        );
        let reconciler = ContentReconciler::new(
            Arc::new(uploader),
            Arc::new(HtmlExtractor),
            UrlNormalizer::new("legacy.example"),
            1,
        );
        BatchCoordinator::new(Arc::new(self.db.clone()), reconciler, batch_size)
    }

    async fn run(&self, batch_size: usize) -> RunSummary {
        self.coordinator(batch_size).run().await.expect("run succeeds")
    }

    fn asset_id(&self, file_name: &str) -> i64 {
        self.db
            .assets()
            .into_iter()
            .find(|a| a.file_name == file_name)
            .unwrap_or_else(|| panic!("asset {file_name} missing"))
            .id
    }
}

fn record_with_intro(id: i64, html: &str, image_intro: &str) -> ContentRecord {
    ContentRecord::new(id, format!("news {id}"), html).with_metadata(ContentMetadata::from_json(
        Some(json!({ "image_intro": image_intro, "float_intro": "" })),
    ))
}

#[tokio::test]
async fn scenario_record_is_normalized_and_cataloged() {
    let h = Harness::new();
    h.add_source_file("images/x.jpg");
    h.add_source_file("images/main.jpg");
    h.db.seed_content(record_with_intro(
        1,
        SCENARIO_HTML,
        "http://legacy.example/images/main.jpg",
    ));

    let summary = h.run(25).await;

    let record = h.db.content(1).expect("record");
    assert_eq!(record.text, "    Opening match report. Watch");
    let x = h.asset_id("x.jpg");
    let main = h.asset_id("main.jpg");
    assert_eq!(h.db.assets().len(), 2);
    assert_eq!(record.asset_ids, vec![x]);
    assert_eq!(record.primary_asset_id, Some(main));
    assert_eq!(
        record.metadata.video_links(),
        vec!["https://youtu.be/ABC123".to_string()]
    );
    assert_eq!(record.metadata.get_str("float_intro"), Some(""));
    assert_eq!(record.updated_by_id, Some(1));
    assert!(h.stored_object("x.jpg").exists());
    assert!(h.stored_object("main.jpg").exists());

    assert_eq!(summary.records_processed, 1);
    assert_eq!(summary.assets_created, 2);
    assert_eq!(summary.links_created, 1);
    assert_eq!(summary.primary_assets_set, 1);
    assert_eq!(summary.batches_committed, 1);
}

#[tokio::test]
async fn legacy_article_fixture_migrates_end_to_end() {
    let fixtures = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/legacy-article");
    let body = std::fs::read_to_string(fixtures.join("body.html")).expect("body");
    let expected = std::fs::read_to_string(fixtures.join("expected_text.txt")).expect("text");
    let metadata: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(fixtures.join("metadata.json")).expect("metadata"),
    )
    .expect("metadata json");

    let dir = "images/novosti/2023_The_combined_team_of_the_Minsk_diocese_of_the_BOC_and_the_Military_Academy_of_the_Republic_of_Belarus_took_part_in_the_Open_Tournament";
    let h = Harness::new();
    h.add_source_file(&format!("{dir}/photo_2023-03-26_21-34-54.jpg"));
    h.add_source_file(&format!("{dir}/photo_2023-03-26_21- 34-54.jpg"));
    h.db.seed_content(
        ContentRecord::new(1, "tournament", body)
            .with_metadata(ContentMetadata::from_json(Some(metadata))),
    );

    h.run(25).await;

    let record = h.db.content(1).expect("record");
    assert_eq!(record.text, expected.trim_end_matches('\n'));
    assert_eq!(h.db.assets().len(), 2);
    assert_eq!(h.db.links().len(), 1);
    assert_eq!(
        record.asset_ids,
        vec![h.asset_id("photo_2023-03-26_21-34-54.jpg")]
    );
    assert_eq!(
        record.primary_asset_id,
        Some(h.asset_id("photo_2023-03-26_21- 34-54.jpg"))
    );
    assert_eq!(
        record.metadata.video_links(),
        vec!["https://youtu.be/IeODSXm4s_E".to_string()]
    );
    assert_eq!(record.metadata.get_str("image_intro_alt"), Some(""));
}

#[tokio::test]
async fn second_run_creates_nothing_new() {
    let h = Harness::new();
    h.add_source_file("images/x.jpg");
    h.add_source_file("images/main.jpg");
    h.db.seed_content(record_with_intro(
        1,
        SCENARIO_HTML,
        "http://legacy.example/images/main.jpg",
    ));

    h.run(25).await;
    let assets = h.db.assets();
    let links = h.db.links();
    let first = h.db.content(1).expect("record");

    let again = h.run(25).await;
    let second = h.db.content(1).expect("record");

    assert_eq!(h.db.assets(), assets);
    assert_eq!(h.db.links(), links);
    assert_eq!(again.assets_created, 0);
    assert_eq!(again.links_created, 0);
    assert_eq!(again.records_skipped, 1);
    assert_eq!(second.text, first.text);
    assert_eq!(second.metadata, first.metadata);
    assert_eq!(second.primary_asset_id, first.primary_asset_id);
}

#[tokio::test]
async fn shared_file_name_yields_one_asset_and_two_links() {
    let h = Harness::new();
    h.add_source_file("images/2021/shared.jpg");
    h.add_source_file("images/2022/shared.jpg");
    h.db.seed_content(ContentRecord::new(
        1,
        "a",
        r#"<p>one</p><img src="images/2021/shared.jpg">"#,
    ));
    h.db.seed_content(ContentRecord::new(
        2,
        "b",
        r#"<p>two</p><img src="http://legacy.example/images/2022/shared.jpg">"#,
    ));

    let summary = h.run(25).await;

    assert_eq!(h.db.assets().len(), 1);
    let shared = h.asset_id("shared.jpg");
    assert_eq!(h.db.links().len(), 2);
    assert_eq!(h.db.content(1).expect("1").asset_ids, vec![shared]);
    assert_eq!(h.db.content(2).expect("2").asset_ids, vec![shared]);
    assert_eq!(summary.assets_created, 1);
    assert_eq!(summary.links_created, 2);
}

#[tokio::test]
async fn timed_out_upload_does_not_block_other_images() {
    let mut h = Harness::new();
    for name in ["a.jpg", "slow.jpg", "c.jpg"] {
        h.add_source_file(&format!("images/{name}"));
    }
    h.stalled_path = Some("images/slow.jpg".to_string());
    h.db.seed_content(ContentRecord::new(
        1,
        "t",
        r#"<p>gallery</p><img src="images/a.jpg"><img src="images/slow.jpg"><img src="images/c.jpg">"#,
    ));

    let summary = h.run(25).await;

    let record = h.db.content(1).expect("record");
    let names: Vec<_> = h.db.assets().into_iter().map(|a| a.file_name).collect();
    assert_eq!(names, vec!["a.jpg".to_string(), "c.jpg".to_string()]);
    assert_eq!(record.asset_ids.len(), 2);
    assert_eq!(record.text, "    gallery");
    assert_eq!(summary.uploads_failed, 1);
    assert_eq!(summary.records_failed, 0);
    assert!(!h.stored_object("slow.jpg").exists());
}

#[tokio::test]
async fn missing_source_file_is_skipped() {
    let h = Harness::new();
    h.add_source_file("images/present.jpg");
    h.db.seed_content(ContentRecord::new(
        1,
        "t",
        r#"<img src="images/absent.jpg"><img src="images/present.jpg">"#,
    ));

    let summary = h.run(25).await;

    assert_eq!(summary.uploads_failed, 1);
    assert_eq!(h.db.assets().len(), 1);
    assert_eq!(
        h.db.content(1).expect("record").asset_ids,
        vec![h.asset_id("present.jpg")]
    );
}

#[tokio::test]
async fn failing_record_is_rolled_back_and_batch_continues() {
    let h = Harness::new();
    for id in 1..=3 {
        h.add_source_file(&format!("images/{id}.jpg"));
        h.db.seed_content(ContentRecord::new(
            id,
            "t",
            format!(r#"<p>record {id}</p><img src="images/{id}.jpg">"#),
        ));
    }
    h.db.fail_updates_for(2);

    let summary = h.run(25).await;

    assert_eq!(summary.records_processed, 2);
    assert_eq!(summary.records_failed, 1);
    assert_eq!(summary.batches_committed, 1);
    let names: Vec<_> = h.db.assets().into_iter().map(|a| a.file_name).collect();
    assert!(!names.contains(&"2.jpg".to_string()));
    let failed = h.db.content(2).expect("record 2");
    assert!(failed.text.starts_with("<p>"));
    assert!(failed.asset_ids.is_empty());
    assert_eq!(h.db.content(1).expect("1").text, "    record 1");
    assert_eq!(h.db.content(3).expect("3").text, "    record 3");
}

#[tokio::test]
async fn commit_failure_halts_run_and_keeps_earlier_batches() {
    let h = Harness::new();
    for id in 1..=5 {
        h.db.seed_content(ContentRecord::new(id, "t", format!("<p>record {id}</p>")));
    }
    // Pre-pass commit plus the first batch.
    h.db.fail_commits_after(2);

    let err = h.coordinator(2).run().await.unwrap_err();

    match err {
        CoordinatorError::Batch {
            batch_index,
            committed_batches,
            ..
        } => {
            assert_eq!(batch_index, 1);
            assert_eq!(committed_batches, 1);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(h.db.content(5).expect("5").text, "    record 5");
    assert_eq!(h.db.content(4).expect("4").text, "    record 4");
    for id in 1..=3 {
        assert!(h.db.content(id).expect("record").text.starts_with("<p>"));
    }
}

#[tokio::test]
async fn pre_pass_deletes_empty_records_and_clears_only_stale_video_links() {
    let h = Harness::new();
    h.add_source_file("images/kept.jpg");
    let kept = h.db.seed_asset("kept.jpg");

    let mut stale = ContentMetadata::new();
    stale.set_video_links(vec!["https://youtu.be/STALE".to_string()]);

    h.db.seed_content(ContentRecord::new(1, "empty", "  \n "));
    h.db.seed_link(1, kept.id);
    h.db.seed_content(
        ContentRecord::new(2, "markup, no video", "<p>no video here</p>")
            .with_metadata(stale.clone()),
    );
    h.db.seed_content(
        ContentRecord::new(3, "already linked", "<p>no video here</p>")
            .with_metadata(stale.clone()),
    );
    h.db.seed_link(3, kept.id);
    h.db.seed_content(
        ContentRecord::new(4, "normalized", "    plain text").with_metadata(stale.clone()),
    );

    let summary = h.run(25).await;

    assert_eq!(summary.empty_records_deleted, 1);
    assert_eq!(summary.metadata_cleared, 1);
    assert!(h.db.content(1).is_none());
    assert!(h.db.links().iter().all(|link| link.content_id != 1));
    assert!(h.db.content(2).expect("2").metadata.video_links().is_empty());
    assert_eq!(
        h.db.content(3).expect("3").metadata.video_links(),
        vec!["https://youtu.be/STALE".to_string()]
    );
    assert_eq!(
        h.db.content(4).expect("4").metadata.video_links(),
        vec!["https://youtu.be/STALE".to_string()]
    );
    assert_eq!(h.db.assets().len(), 1);
}

#[tokio::test]
async fn row_limit_caps_processed_records() {
    let h = Harness::new();
    for id in 1..=5 {
        h.db.seed_content(ContentRecord::new(id, "t", format!("<p>record {id}</p>")));
    }

    let summary = h
        .coordinator(2)
        .with_row_limit(Some(3))
        .run()
        .await
        .expect("run");

    assert_eq!(summary.total_records, 3);
    assert_eq!(summary.records_processed, 3);
    assert_eq!(summary.batches_committed, 2);
    assert!(h.db.content(1).expect("1").text.starts_with("<p>"));
    assert!(h.db.content(2).expect("2").text.starts_with("<p>"));
    assert_eq!(h.db.content(3).expect("3").text, "    record 3");
}

#[tokio::test]
async fn escaped_markup_in_text_survives_repeated_runs() {
    let h = Harness::new();
    h.add_source_file("images/x.jpg");
    h.db.seed_content(ContentRecord::new(
        1,
        "with image",
        r#"<p>Wrap text in &lt;b&gt;bold&lt;/b&gt; tags</p><img src="images/x.jpg">"#,
    ));
    h.db.seed_content(ContentRecord::new(
        2,
        "text only",
        "<p>Use &lt;i&gt; for emphasis</p>",
    ));

    h.run(25).await;
    let first_1 = h.db.content(1).expect("1");
    let first_2 = h.db.content(2).expect("2");
    assert_eq!(first_1.text, "    Wrap text in <b>bold</b> tags");
    assert_eq!(first_2.text, "    Use <i> for emphasis");

    let again = h.run(25).await;
    let second_1 = h.db.content(1).expect("1");
    let second_2 = h.db.content(2).expect("2");

    assert_eq!(second_1.text, first_1.text);
    assert_eq!(second_2.text, first_2.text);
    assert_eq!(second_2.metadata, first_2.metadata);
    assert_eq!(second_2.updated_at, first_2.updated_at);
    assert_eq!(again.metadata_cleared, 0);
    assert_eq!(again.records_skipped, 2);
    assert_eq!(h.db.assets().len(), 1);
}

#[tokio::test]
async fn row_limit_bounds_metadata_cleanup_to_processed_rows() {
    let h = Harness::new();
    let mut stale = ContentMetadata::new();
    stale.set_video_links(vec!["https://youtu.be/STALE".to_string()]);
    for id in 1..=5 {
        h.db.seed_content(
            ContentRecord::new(id, "t", format!("<p>record {id}</p>")).with_metadata(stale.clone()),
        );
    }

    let summary = h
        .coordinator(2)
        .with_row_limit(Some(1))
        .run()
        .await
        .expect("run");

    assert_eq!(summary.records_processed, 1);
    assert_eq!(summary.metadata_cleared, 1);
    assert!(h.db.content(5).expect("5").metadata.video_links().is_empty());
    for id in 1..=4 {
        let record = h.db.content(id).expect("record");
        assert_eq!(
            record.metadata.video_links(),
            vec!["https://youtu.be/STALE".to_string()]
        );
        assert_eq!(record.updated_by_id, None);
    }
}
