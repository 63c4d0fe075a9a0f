//! Integration tests for the worker pool driven through the dispatcher.
//!
//! This test suite validates:
//! - Dispatcher round trips for all three job kinds
//! - Failed jobs surface as `Error::Computation`
//! - Worker events are broadcast for started/completed/failed jobs
//! - Concurrency is bounded by `max_concurrent_jobs`
//! - Jobs exceeding the worker timeout fail instead of hanging

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nsweb_db::ArtifactStore;
use nsweb_jobs::test_fixtures::{self, pattern};
use nsweb_jobs::{
    decoding_worker, Error, JobContext, JobHandler, JobResult, JobType, ReferenceLibrary,
    ScatterplotPayload, WorkerBuilder, WorkerConfig, WorkerEvent, WorkerHandle,
};
use tempfile::TempDir;

struct Fixture {
    _reference: TempDir,
    data: TempDir,
    artifacts: ArtifactStore,
    handle: WorkerHandle,
}

async fn start_decoding_worker() -> Fixture {
    let reference = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    test_fixtures::write_reference_library(reference.path());

    let artifacts = ArtifactStore::new(
        data.path().join("decoded"),
        data.path().join("results"),
        data.path().join("scatter"),
    );
    let library = Arc::new(ReferenceLibrary::new(reference.path()));
    let handle = decoding_worker(WorkerConfig::default(), library, artifacts.clone())
        .build()
        .await
        .start();

    Fixture {
        _reference: reference,
        data,
        artifacts,
        handle,
    }
}

/// Handler that sleeps and records peak concurrency.
struct SlowHandler {
    delay: Duration,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait]
impl JobHandler for SlowHandler {
    fn job_type(&self) -> JobType {
        JobType::VoxelLookup
    }

    async fn execute(&self, _ctx: JobContext) -> JobResult {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        JobResult::Success(Some(serde_json::json!([])))
    }
}

#[tokio::test]
async fn test_voxel_lookup_round_trip() {
    let fx = start_decoding_worker().await;
    let dispatcher = fx.handle.dispatcher(Duration::from_secs(10));

    let rows = dispatcher.voxel_lookup("topics", 0, 0, 0, true).await.unwrap();
    assert_eq!(rows.len(), 3);
    let pain = rows.iter().find(|r| r.analysis == "pain").unwrap();
    assert_eq!(pain.z, pattern(5, 6, 5) as f64);
    assert!(pain.pp.is_some());

    // Unknown references fall back to terms rather than failing.
    let fallback = dispatcher.voxel_lookup("nope", 0, 0, 0, false).await.unwrap();
    assert_eq!(fallback.len(), 3);
}

#[tokio::test]
async fn test_out_of_volume_lookup_is_computation_error() {
    let fx = start_decoding_worker().await;
    let dispatcher = fx.handle.dispatcher(Duration::from_secs(10));
    let err = dispatcher
        .voxel_lookup("terms", 0, 500, 0, false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Computation(_)));
}

#[tokio::test]
async fn test_decode_then_scatterplot() {
    let fx = start_decoding_worker().await;
    let dispatcher = fx.handle.dispatcher(Duration::from_secs(30));
    let mut events = fx.handle.events();

    let uuid = "c".repeat(32);
    let image = fx.data.path().join("input.nii.gz");
    test_fixtures::write_input_image(&image);
    let image_path = image.to_string_lossy().into_owned();

    assert!(dispatcher
        .decode_image(&image_path, "terms_20k", &uuid)
        .await
        .unwrap());
    let rows = fx.artifacts.read_results(&uuid).await.unwrap();
    assert_eq!(rows.first().map(|r| r.analysis.as_str()), Some("pain"));
    assert_eq!(rows.first().map(|r| r.r), Some(1.0));

    let output = fx.artifacts.scatterplot_path(&uuid, "memory").unwrap();
    let payload = ScatterplotPayload {
        image_path,
        decoding_set: "terms_20k".into(),
        analysis: "memory".into(),
        decoding_uuid: uuid.clone(),
        output_path: output.to_string_lossy().into_owned(),
        x_label: "input".into(),
    };
    assert!(dispatcher.render_scatterplot(payload).await.unwrap());
    assert!(fx.artifacts.has_scatterplot(&uuid, "memory").await.unwrap());

    let mut completed = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, WorkerEvent::JobCompleted { .. }) {
            completed += 1;
        }
    }
    assert_eq!(completed, 2);
}

#[tokio::test]
async fn test_decode_failure_broadcasts_job_failed() {
    let fx = start_decoding_worker().await;
    let dispatcher = fx.handle.dispatcher(Duration::from_secs(10));
    let mut events = fx.handle.events();

    let missing = fx.data.path().join("missing.nii");
    let err = dispatcher
        .decode_image(&missing.to_string_lossy(), "terms_20k", &"d".repeat(32))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Computation(_)));

    let mut saw_failed = false;
    while let Ok(event) = events.try_recv() {
        if let WorkerEvent::JobFailed { job_type, .. } = event {
            assert_eq!(job_type, JobType::DecodeImage);
            saw_failed = true;
        }
    }
    assert!(saw_failed);
}

#[tokio::test]
async fn test_concurrency_is_bounded() {
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let handle = WorkerBuilder::new()
        .with_config(WorkerConfig::default().with_max_concurrent(2))
        .with_handler(SlowHandler {
            delay: Duration::from_millis(50),
            running: running.clone(),
            peak: peak.clone(),
        })
        .build()
        .await
        .start();
    let dispatcher = handle.dispatcher(Duration::from_secs(10));

    let calls = (0..6).map(|_| {
        let d = dispatcher.clone();
        tokio::spawn(async move { d.voxel_lookup("terms", 0, 0, 0, false).await })
    });
    for call in calls.collect::<Vec<_>>() {
        assert!(call.await.unwrap().is_ok());
    }
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(peak.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn test_worker_timeout_fails_job() {
    let handle = WorkerBuilder::new()
        .with_config(WorkerConfig::default().with_job_timeout(Duration::from_millis(20)))
        .with_handler(SlowHandler {
            delay: Duration::from_secs(5),
            running: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        })
        .build()
        .await
        .start();
    let dispatcher = handle.dispatcher(Duration::from_secs(5));

    let err = dispatcher
        .voxel_lookup("terms", 0, 0, 0, false)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("timeout"));
}

#[tokio::test]
async fn test_shutdown_closes_the_pool() {
    let fx = start_decoding_worker().await;
    let dispatcher = fx.handle.dispatcher(Duration::from_secs(2));
    fx.handle.shutdown().await.unwrap();
    // Let the run loop observe the signal.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = dispatcher
        .voxel_lookup("terms", 0, 0, 0, false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Computation(_)));
}
