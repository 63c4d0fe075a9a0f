//! Shared harness for router tests: in-memory repositories, a temp data
//! root with fixture reference sets, and a real worker pool whose decode
//! and scatterplot handlers count their invocations.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use tempfile::TempDir;
use tower::ServiceExt;

use nsweb_api::{build_router, AppConfig, AppState, Repositories};
use nsweb_core::{DecodingSet, Image, JobType, Peak, Study};
use nsweb_db::{ArtifactStore, MemoryStore};
use nsweb_jobs::test_fixtures;
use nsweb_jobs::{
    DecodeHandler, JobContext, JobHandler, JobResult, ReferenceLibrary, ScatterHandler,
    VoxelHandler, WorkerBuilder, WorkerConfig, WorkerHandle,
};

/// Forwards to an inner handler and counts calls.
pub struct Counting<H> {
    inner: H,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl<H: JobHandler> JobHandler for Counting<H> {
    fn job_type(&self) -> JobType {
        self.inner.job_type()
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.execute(ctx).await
    }
}

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub config: AppConfig,
    pub data: TempDir,
    pub decode_jobs: Arc<AtomicUsize>,
    pub voxel_jobs: Arc<AtomicUsize>,
    pub scatter_jobs: Arc<AtomicUsize>,
    _worker: WorkerHandle,
}

pub fn decoding_sets() -> Vec<DecodingSet> {
    ["terms_20k", "topics_20k"]
        .iter()
        .enumerate()
        .map(|(i, name)| DecodingSet {
            id: i as i64 + 1,
            name: name.to_string(),
            description: None,
            n_images: test_fixtures::FIXTURE_ANALYSES.len() as i32,
        })
        .collect()
}

fn study(pmid: i64, title: &str) -> Study {
    Study {
        pmid,
        title: title.to_string(),
        authors: "Doe J, Roe R".to_string(),
        journal: "NeuroImage".to_string(),
        year: Some(2012),
    }
}

fn peak(id: i64, pmid: i64, x: f64, y: f64, z: f64) -> Peak {
    Peak {
        id,
        pmid,
        table_name: None,
        x,
        y,
        z,
    }
}

/// Studies: 100 has two peaks at the origin, 200 one peak 15mm away,
/// 300 one peak 30mm away.
pub fn literature() -> (Vec<Study>, Vec<Peak>) {
    (
        vec![
            study(100, "Pain & <empathy>"),
            study(200, "Working memory"),
            study(300, "Far away"),
        ],
        vec![
            peak(1, 100, 0.0, 0.0, 0.0),
            peak(2, 100, 2.0, -2.0, 1.0),
            peak(3, 200, 15.0, 0.0, 0.0),
            peak(4, 300, 30.0, 0.0, 0.0),
        ],
    )
}

pub async fn spawn_app(cache_decodings: bool, neurovault_api_url: &str) -> TestApp {
    let data = tempfile::tempdir().expect("tempdir");
    let config = AppConfig::default()
        .with_data_root(data.path())
        .with_cache_decodings(cache_decodings)
        .with_neurovault_api_url(neurovault_api_url)
        .with_task_timeout(Duration::from_secs(30));

    test_fixtures::write_reference_library(&config.reference_data_dir);
    std::fs::create_dir_all(&config.image_dir).expect("image dir");
    test_fixtures::write_input_image(&config.image_dir.join("amygdala.nii.gz"));

    let (studies, peaks) = literature();
    let store = Arc::new(
        MemoryStore::new()
            .with_decoding_sets(decoding_sets())
            .with_literature(studies, peaks)
            .with_images(vec![
                Image {
                    id: 7,
                    name: "Amygdala coactivation".to_string(),
                    label: "amygdala".to_string(),
                    image_file: "amygdala.nii.gz".to_string(),
                    display: true,
                },
                Image {
                    id: 8,
                    name: "Hidden".to_string(),
                    label: "hidden".to_string(),
                    image_file: "hidden.nii.gz".to_string(),
                    display: false,
                },
            ])
            .with_location_image(0, 0, 0, 7)
            .with_location_image(0, 0, 0, 8),
    );

    let library = Arc::new(ReferenceLibrary::new(&config.reference_data_dir));
    let artifacts = ArtifactStore::new(
        &config.decoded_image_dir,
        &config.results_dir,
        &config.scatterplots_dir,
    );
    let decode_jobs = Arc::new(AtomicUsize::new(0));
    let voxel_jobs = Arc::new(AtomicUsize::new(0));
    let scatter_jobs = Arc::new(AtomicUsize::new(0));
    let worker = WorkerBuilder::new()
        .with_config(WorkerConfig::default())
        .with_handler(Counting {
            inner: VoxelHandler::new(library.clone()),
            calls: voxel_jobs.clone(),
        })
        .with_handler(Counting {
            inner: DecodeHandler::new(library.clone(), artifacts),
            calls: decode_jobs.clone(),
        })
        .with_handler(Counting {
            inner: ScatterHandler::new(library),
            calls: scatter_jobs.clone(),
        })
        .build()
        .await
        .start();

    let state = AppState::new(
        &config,
        Repositories::in_memory(store.clone()),
        worker.dispatcher(config.task_timeout),
    )
    .expect("app state");

    TestApp {
        router: build_router(state.clone()),
        state,
        store,
        config,
        data,
        decode_jobs,
        voxel_jobs,
        scatter_jobs,
        _worker: worker,
    }
}

impl TestApp {
    pub async fn get(&self, uri: &str) -> Response {
        self.router
            .clone()
            .oneshot(Request::get(uri).body(Body::empty()).expect("request"))
            .await
            .expect("router is infallible")
    }

    pub async fn get_json(&self, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = self.get(uri).await;
        let status = resp.status();
        let bytes = body_bytes(resp).await;
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    /// Follow a decode redirect and return the UUID it points at.
    pub async fn decode_uuid(&self, uri: &str) -> String {
        let resp = self.get(uri).await;
        assert_eq!(resp.status(), StatusCode::SEE_OTHER, "decode {}", uri);
        let location = resp
            .headers()
            .get("location")
            .and_then(|v| v.to_str().ok())
            .expect("location header")
            .to_string();
        location
            .trim_start_matches("/decode/")
            .trim_end_matches('/')
            .to_string()
    }

    pub fn decode_jobs(&self) -> usize {
        self.decode_jobs.load(Ordering::SeqCst)
    }

    pub fn scatter_jobs(&self) -> usize {
        self.scatter_jobs.load(Ordering::SeqCst)
    }

    pub fn voxel_jobs(&self) -> usize {
        self.voxel_jobs.load(Ordering::SeqCst)
    }
}

pub async fn body_bytes(resp: Response) -> Vec<u8> {
    axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .expect("body")
        .to_vec()
}

/// Percent-encode a URL for use as a query value.
pub fn encode_query(value: &str) -> String {
    value
        .bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                (b as char).to_string()
            }
            _ => format!("%{:02X}", b),
        })
        .collect()
}
