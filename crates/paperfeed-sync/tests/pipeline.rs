use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use paperfeed_adapters::{ListingSource, PageRequest, SourceError};
use paperfeed_core::{Collection, RawRecord};
use paperfeed_storage::{CollectionStore, HttpError};
use paperfeed_sync::{
    export_pages_from_store, normalize, HarvestConfig, HarvestPipeline, SubjectStatus,
};
use tempfile::tempdir;
use tokio::time::Instant;

type Scripted = Result<Vec<RawRecord>, SourceError>;

/// Serves scripted pages per subject; an exhausted script means end of listing.
#[derive(Default)]
struct FakeArxiv {
    pages: Mutex<HashMap<String, VecDeque<Scripted>>>,
    stalled: Vec<String>,
    calls: Mutex<usize>,
    starts: Mutex<Vec<Instant>>,
}

impl FakeArxiv {
    fn with(mut self, subject: &str, pages: Vec<Scripted>) -> Self {
        self.pages
            .get_mut()
            .unwrap()
            .insert(subject.to_string(), pages.into());
        self
    }

    fn stalling(mut self, subject: &str) -> Self {
        self.stalled.push(subject.to_string());
        self
    }

    fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }

    fn start_times(&self) -> Vec<Instant> {
        let mut starts = self.starts.lock().unwrap().clone();
        starts.sort();
        starts
    }
}

#[async_trait]
impl ListingSource for FakeArxiv {
    fn source_id(&self) -> &'static str {
        "fake-arxiv"
    }

    fn max_page_size(&self) -> usize {
        100
    }

    async fn fetch_page(&self, request: &PageRequest<'_>) -> Result<Vec<RawRecord>, SourceError> {
        *self.calls.lock().unwrap() += 1;
        self.starts.lock().unwrap().push(Instant::now());
        if self.stalled.iter().any(|s| s == request.subject) {
            std::future::pending::<()>().await;
        }
        let next = self
            .pages
            .lock()
            .unwrap()
            .get_mut(request.subject)
            .and_then(|pages| pages.pop_front());
        next.unwrap_or_else(|| Ok(Vec::new()))
    }
}

fn raw(id: &str, category: &str) -> RawRecord {
    RawRecord {
        reference: Some(format!("http://arxiv.org/abs/{id}v1")),
        title: Some(format!("Paper {id}")),
        authors: vec!["Ada Lovelace".into()],
        categories: vec![category.to_string()],
        summary: Some("Abstract.".into()),
        published: Some("2023-01-02T10:00:00Z".into()),
    }
}

fn untitled(id: &str) -> RawRecord {
    RawRecord {
        title: None,
        ..raw(id, "cs.AI")
    }
}

fn config(dir: &Path) -> HarvestConfig {
    HarvestConfig {
        output_path: dir.join("data/papers.json"),
        request_interval: Duration::ZERO,
        page_size: 10,
        max_pages: 10,
        max_retries: 1,
        ..HarvestConfig::default()
    }
}

fn subjects(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

async fn stored(path: &Path) -> Collection {
    CollectionStore::new(path).load().await.expect("load store")
}

#[tokio::test]
async fn first_run_adds_valid_and_drops_untitled() {
    let dir = tempdir().expect("tempdir");
    let cfg = config(dir.path());
    let source = FakeArxiv::default().with(
        "cs.AI",
        vec![Ok(vec![raw("2301.00001", "cs.AI"), untitled("2301.00002")])],
    );
    let pipeline = HarvestPipeline::with_source(cfg.clone(), Arc::new(source));

    let summary = pipeline.run_once(&subjects(&["cs.AI"])).await.expect("run");
    assert_eq!(summary.records_added, 1);
    assert_eq!(summary.records_dropped, 1);
    assert_eq!(summary.records_skipped, 0);
    assert_eq!(summary.pages_fetched, 1);
    assert_eq!(summary.collection_size, 1);
    assert_eq!(summary.subjects_completed, 1);

    let collection = stored(&cfg.output_path).await;
    assert_eq!(collection.len(), 1);
    assert!(collection.contains("2301.00001"));
}

#[tokio::test]
async fn rerun_skips_known_records_and_leaves_store_unchanged() {
    let dir = tempdir().expect("tempdir");
    let cfg = config(dir.path());
    let existing: Collection = vec![normalize(&raw("2301.00001", "cs.AI")).expect("normalize")]
        .into_iter()
        .collect();
    CollectionStore::new(&cfg.output_path)
        .save_atomic(&existing)
        .await
        .expect("seed");
    let before = std::fs::read(&cfg.output_path).expect("read");

    let mut refetched = raw("2301.00001", "cs.AI");
    refetched.reference = Some("http://arxiv.org/abs/2301.00001v2".into());
    refetched.title = Some("A revised title".into());
    let source = FakeArxiv::default().with("cs.AI", vec![Ok(vec![refetched])]);
    let pipeline = HarvestPipeline::with_source(cfg.clone(), Arc::new(source));

    let summary = pipeline.run_once(&subjects(&["cs.AI"])).await.expect("run");
    assert_eq!(summary.records_added, 0);
    assert_eq!(summary.records_skipped, 1);
    assert_eq!(stored(&cfg.output_path).await, existing);
    assert_eq!(std::fs::read(&cfg.output_path).expect("read"), before);
}

#[tokio::test]
async fn terminal_failure_only_loses_the_failing_subjects_remaining_pages() {
    let dir = tempdir().expect("tempdir");
    let cfg = config(dir.path());
    let source = FakeArxiv::default()
        .with("cs.AI", vec![Ok(vec![raw("2301.00001", "cs.AI")])])
        .with(
            "cs.LG",
            vec![
                Ok(vec![raw("2301.00002", "cs.LG"), untitled("2301.00009")]),
                Err(SourceError::Rejected("unknown category".into())),
                Ok(vec![raw("2301.00099", "cs.LG")]),
            ],
        )
        .with(
            "math.CO",
            vec![
                Ok(vec![raw("2301.00003", "math.CO")]),
                Ok(vec![raw("2301.00004", "math.CO")]),
            ],
        );
    let pipeline = HarvestPipeline::with_source(cfg.clone(), Arc::new(source));

    let summary = pipeline
        .run_once(&subjects(&["cs.AI", "cs.LG", "math.CO"]))
        .await
        .expect("partial failures are not fatal");

    assert_eq!(summary.subjects_total, 3);
    assert_eq!(summary.subjects_completed, 2);
    assert_eq!(summary.subjects_abandoned, 1);
    assert_eq!(summary.records_added, 4);
    assert_eq!(summary.records_dropped, 1);

    let failed = &summary.subjects[1];
    assert_eq!(failed.subject, "cs.LG");
    assert_eq!(failed.status, SubjectStatus::Abandoned);
    assert_eq!(failed.pages_fetched, 1);
    assert!(failed.error.as_deref().unwrap().contains("unknown category"));

    let collection = stored(&cfg.output_path).await;
    let ids: Vec<&str> = collection.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(ids, vec!["2301.00001", "2301.00002", "2301.00003", "2301.00004"]);
}

#[tokio::test]
async fn exhausted_retries_keep_already_merged_pages() {
    let dir = tempdir().expect("tempdir");
    let cfg = HarvestConfig {
        max_retries: 0,
        ..config(dir.path())
    };
    let unavailable = || {
        Err(SourceError::Http(HttpError::HttpStatus {
            status: 503,
            url: "http://fake/api".into(),
        }))
    };
    let source = FakeArxiv::default().with(
        "cs.AI",
        vec![Ok(vec![raw("2301.00001", "cs.AI")]), unavailable()],
    );
    let pipeline = HarvestPipeline::with_source(cfg.clone(), Arc::new(source));

    let summary = pipeline.run_once(&subjects(&["cs.AI"])).await.expect("run");
    assert_eq!(summary.subjects_abandoned, 1);
    assert_eq!(summary.records_added, 1);
    assert!(stored(&cfg.output_path).await.contains("2301.00001"));
}

#[tokio::test]
async fn corrupt_store_aborts_before_fetching_or_writing() {
    let dir = tempdir().expect("tempdir");
    let cfg = config(dir.path());
    std::fs::create_dir_all(cfg.output_path.parent().unwrap()).expect("mkdir");
    std::fs::write(&cfg.output_path, b"[not json").expect("write");
    let source = Arc::new(FakeArxiv::default().with("cs.AI", vec![Ok(vec![raw("2301.00001", "cs.AI")])]));
    let pipeline = HarvestPipeline::with_source(cfg.clone(), source.clone());

    let err = pipeline.run_once(&subjects(&["cs.AI"])).await.unwrap_err();
    assert!(format!("{err:#}").contains("corrupt"));
    assert_eq!(source.calls(), 0);
    assert_eq!(std::fs::read(&cfg.output_path).expect("read"), b"[not json".to_vec());
}

#[tokio::test]
async fn run_timeout_still_saves_merged_results() {
    let dir = tempdir().expect("tempdir");
    let cfg = HarvestConfig {
        run_timeout: Some(Duration::from_millis(200)),
        ..config(dir.path())
    };
    let source = FakeArxiv::default()
        .with("cs.AI", vec![Ok(vec![raw("2301.00001", "cs.AI")])])
        .stalling("cs.LG");
    let pipeline = HarvestPipeline::with_source(cfg.clone(), Arc::new(source));

    let summary = pipeline
        .run_once(&subjects(&["cs.AI", "cs.LG", "math.CO"]))
        .await
        .expect("run");
    assert!(summary.timed_out);
    assert_eq!(summary.subjects_completed, 1);
    assert_eq!(summary.subjects_unfinished, 2);
    assert!(stored(&cfg.output_path).await.contains("2301.00001"));
}

#[tokio::test]
async fn concurrent_subjects_merge_to_the_same_collection() {
    let scripted = || {
        FakeArxiv::default()
            .with(
                "cs.AI",
                vec![
                    Ok(vec![raw("2301.00001", "cs.AI"), raw("2301.00002", "cs.AI")]),
                    Ok(vec![raw("2301.00003", "cs.AI")]),
                ],
            )
            .with("cs.LG", vec![Ok(vec![raw("2301.00002", "cs.AI"), raw("2301.00004", "cs.LG")])])
            .with("stat.ML", vec![Ok(vec![raw("2301.00005", "stat.ML")])])
    };
    let list = subjects(&["cs.AI", "cs.LG", "stat.ML"]);

    let sequential_dir = tempdir().expect("tempdir");
    let sequential = HarvestPipeline::with_source(config(sequential_dir.path()), Arc::new(scripted()));
    let seq_summary = sequential.run_once(&list).await.expect("sequential run");

    let concurrent_dir = tempdir().expect("tempdir");
    let concurrent = HarvestPipeline::with_source(
        HarvestConfig {
            concurrency: 3,
            ..config(concurrent_dir.path())
        },
        Arc::new(scripted()),
    );
    let con_summary = concurrent.run_once(&list).await.expect("concurrent run");

    assert_eq!(seq_summary.records_added, 5);
    assert_eq!(con_summary.records_added, 5);
    assert_eq!(con_summary.records_skipped, 1);
    assert_eq!(
        stored(sequential.store().path()).await,
        stored(concurrent.store().path()).await
    );
}

#[tokio::test]
async fn subject_pages_are_exported_after_save() {
    let dir = tempdir().expect("tempdir");
    let cfg = HarvestConfig {
        subject_pages: true,
        ..config(dir.path())
    };
    let source = FakeArxiv::default().with(
        "cs.AI",
        vec![Ok(vec![raw("2301.00001", "cs.AI"), raw("2301.00002", "cs.AI")])],
    );
    let pipeline = HarvestPipeline::with_source(cfg, Arc::new(source));

    let summary = pipeline.run_once(&subjects(&["cs.AI"])).await.expect("run");
    assert_eq!(summary.subject_pages_written, 1);
    assert!(dir.path().join("data/subjects/cs.AI/page_1.json").exists());
}

#[tokio::test(start_paused = true)]
async fn concurrent_subjects_share_the_request_interval() {
    let dir = tempdir().expect("tempdir");
    let cfg = HarvestConfig {
        concurrency: 3,
        request_interval: Duration::from_secs(3),
        ..config(dir.path())
    };
    let source = Arc::new(
        FakeArxiv::default()
            .with("cs.AI", vec![Ok(vec![raw("2301.00001", "cs.AI")])])
            .with("cs.LG", vec![Ok(vec![raw("2301.00002", "cs.LG")])])
            .with("stat.ML", vec![Ok(vec![raw("2301.00003", "stat.ML")])]),
    );
    let pipeline = HarvestPipeline::with_source(cfg, source.clone());

    let summary = pipeline
        .run_once(&subjects(&["cs.AI", "cs.LG", "stat.ML"]))
        .await
        .expect("run");
    assert_eq!(summary.records_added, 3);

    let starts = source.start_times();
    assert_eq!(starts.len(), 6);
    let gaps: Vec<Duration> = starts.windows(2).map(|w| w[1] - w[0]).collect();
    assert!(
        gaps.iter().all(|gap| *gap >= Duration::from_secs(3)),
        "request starts too close together: {gaps:?}"
    );
}

#[tokio::test]
async fn failed_subject_pages_do_not_fail_a_saved_run() {
    let dir = tempdir().expect("tempdir");
    let cfg = HarvestConfig {
        subject_pages: true,
        ..config(dir.path())
    };
    std::fs::create_dir_all(dir.path().join("data")).expect("mkdir");
    std::fs::write(dir.path().join("data/subjects"), b"not a directory").expect("write");
    let source = FakeArxiv::default().with("cs.AI", vec![Ok(vec![raw("2301.00001", "cs.AI")])]);
    let pipeline = HarvestPipeline::with_source(cfg.clone(), Arc::new(source));

    let summary = pipeline
        .run_once(&subjects(&["cs.AI"]))
        .await
        .expect("store was saved");
    assert_eq!(summary.subject_pages_written, 0);
    assert!(summary
        .subject_pages_error
        .as_deref()
        .unwrap()
        .contains("subject page"));
    assert!(stored(&cfg.output_path).await.contains("2301.00001"));
}

#[tokio::test]
async fn pages_are_exported_from_an_existing_store() {
    let dir = tempdir().expect("tempdir");
    let store_path = dir.path().join("data/papers.json");
    let existing: Collection = vec![
        normalize(&raw("2301.00001", "cs.AI")).expect("normalize"),
        normalize(&raw("2301.00002", "cs.LG")).expect("normalize"),
        normalize(&raw("2301.00003", "cs.AI")).expect("normalize"),
    ]
    .into_iter()
    .collect();
    CollectionStore::new(&store_path)
        .save_atomic(&existing)
        .await
        .expect("seed");

    let written = export_pages_from_store(&store_path).await.expect("export");
    assert_eq!(written, 2);
    let first: serde_json::Value = serde_json::from_slice(
        &std::fs::read(dir.path().join("data/subjects/cs.AI/page_1.json")).expect("read page"),
    )
    .expect("page json");
    assert!(first.to_string().contains("2301.00003"));
    assert!(dir.path().join("data/subjects/cs.LG/page_1.json").exists());
}

#[tokio::test]
async fn mismatched_store_key_aborts_before_fetching() {
    let dir = tempdir().expect("tempdir");
    let cfg = config(dir.path());
    let record = normalize(&raw("2301.00001", "cs.AI")).expect("normalize");
    let json = serde_json::to_vec(&serde_json::json!({ "bogus": record })).expect("serialize");
    std::fs::create_dir_all(cfg.output_path.parent().unwrap()).expect("mkdir");
    std::fs::write(&cfg.output_path, &json).expect("write");
    let source = Arc::new(FakeArxiv::default().with("cs.AI", vec![Ok(vec![raw("2301.00001", "cs.AI")])]));
    let pipeline = HarvestPipeline::with_source(cfg.clone(), source.clone());

    let err = pipeline.run_once(&subjects(&["cs.AI"])).await.unwrap_err();
    assert!(format!("{err:#}").contains("under key \"bogus\""));
    assert_eq!(source.calls(), 0);
    assert_eq!(std::fs::read(&cfg.output_path).expect("read"), json);
}
