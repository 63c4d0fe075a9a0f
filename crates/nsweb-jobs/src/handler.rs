//! Job handlers for each job type.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use nsweb_core::{Job, JobType};

/// Progress callback type for job handlers.
pub type ProgressCallback = Box<dyn Fn(i32, Option<&str>) + Send + Sync>;

/// Context provided to job handlers.
pub struct JobContext {
    /// The job being processed.
    pub job: Job,
    progress_callback: Option<ProgressCallback>,
}

impl JobContext {
    pub fn new(job: Job) -> Self {
        Self {
            job,
            progress_callback: None,
        }
    }

    /// Set the progress callback.
    pub fn with_progress_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(i32, Option<&str>) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Box::new(callback));
        self
    }

    /// Report progress to the callback.
    pub fn report_progress(&self, percent: i32, message: Option<&str>) {
        if let Some(ref callback) = self.progress_callback {
            callback(percent, message);
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job.id
    }

    /// Get the job payload.
    pub fn payload(&self) -> Option<&JsonValue> {
        self.job.payload.as_ref()
    }

    /// Deserialize the payload into a typed struct.
    pub fn typed_payload<T: DeserializeOwned>(&self) -> Result<T, String> {
        let payload = self
            .payload()
            .ok_or_else(|| format!("{} job has no payload", self.job.job_type.as_str()))?;
        serde_json::from_value(payload.clone())
            .map_err(|e| format!("invalid {} payload: {}", self.job.job_type.as_str(), e))
    }
}

/// Result of job execution.
#[derive(Debug, Clone)]
pub enum JobResult {
    /// Job completed successfully with optional result data.
    Success(Option<JsonValue>),
    /// Job failed with an error message.
    Failed(String),
}

impl JobResult {
    pub fn is_success(&self) -> bool {
        matches!(self, JobResult::Success(_))
    }
}

/// Trait for job handlers.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The job type this handler processes.
    fn job_type(&self) -> JobType;

    /// Execute the job.
    async fn execute(&self, ctx: JobContext) -> JobResult;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_typed_payload() {
        let job = Job::new(
            JobType::DecodeImage,
            json!({"image_path": "/tmp/a.nii", "decoding_set": "terms_20k", "decoding_uuid": "abc"}),
        );
        let ctx = JobContext::new(job);
        let payload: nsweb_core::DecodeImagePayload = ctx.typed_payload().unwrap();
        assert_eq!(payload.decoding_set, "terms_20k");
    }

    #[test]
    fn test_typed_payload_reports_bad_shape() {
        let ctx = JobContext::new(Job::new(JobType::VoxelLookup, json!({"x": "nope"})));
        let err = ctx
            .typed_payload::<nsweb_core::VoxelLookupPayload>()
            .unwrap_err();
        assert!(err.contains("voxel_lookup"));
    }

    #[test]
    fn test_missing_payload() {
        let mut job = Job::new(JobType::RenderScatterplot, json!({}));
        job.payload = None;
        let ctx = JobContext::new(job);
        assert!(ctx
            .typed_payload::<nsweb_core::ScatterplotPayload>()
            .is_err());
    }

    struct Staged;

    #[async_trait]
    impl JobHandler for Staged {
        fn job_type(&self) -> JobType {
            JobType::VoxelLookup
        }

        async fn execute(&self, ctx: JobContext) -> JobResult {
            ctx.report_progress(50, Some("halfway"));
            ctx.report_progress(100, None);
            JobResult::Success(None)
        }
    }

    #[tokio::test]
    async fn test_progress_reaches_callback() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let ctx = JobContext::new(Job::new(JobType::VoxelLookup, json!({})))
            .with_progress_callback(move |percent, message| {
                sink.lock().unwrap().push((percent, message.map(String::from)));
            });

        assert!(Staged.execute(ctx).await.is_success());
        let log = log.lock().unwrap();
        assert_eq!(
            *log,
            vec![(50, Some("halfway".to_string())), (100, None)]
        );
    }
}
