//! Request-side entry point to the worker pool.
//!
//! Every call submits a job and waits for its reply with a mandatory timeout.
//! Jobs are not cancelled when the caller gives up; the worker finishes them
//! and the late reply is discarded.

use std::time::{Duration, Instant};

use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use nsweb_core::{
    defaults, DecodeImagePayload, Error, Job, JobType, Result, ScatterplotPayload,
    VoxelLookupPayload, VoxelValue,
};

use crate::handler::JobResult;
use crate::worker::Submission;

/// Resolve a voxel-lookup reference, falling back to the first allowed one.
pub fn voxel_reference(reference: &str) -> &'static str {
    defaults::VOXEL_REFERENCES
        .iter()
        .copied()
        .find(|r| *r == reference)
        .unwrap_or(defaults::VOXEL_REFERENCES[0])
}

/// Typed client for the worker pool.
#[derive(Clone)]
pub struct TaskDispatcher {
    tx: mpsc::Sender<Submission>,
    wait_timeout: Duration,
}

impl TaskDispatcher {
    pub fn new(tx: mpsc::Sender<Submission>, wait_timeout: Duration) -> Self {
        Self { tx, wait_timeout }
    }

    pub fn wait_timeout(&self) -> Duration {
        self.wait_timeout
    }

    /// Submit a job and wait for its result.
    ///
    /// Queueing time counts against the timeout. A failed job, a dropped
    /// reply or an elapsed timeout all surface as `Error::Computation`.
    pub async fn submit(&self, job_type: JobType, payload: JsonValue) -> Result<Option<JsonValue>> {
        let job = Job::new(job_type, payload);
        let job_id = job.id;
        let start = Instant::now();
        let (reply_tx, reply_rx) = oneshot::channel();

        let wait = async {
            self.tx
                .send(Submission {
                    job,
                    reply: reply_tx,
                })
                .await
                .map_err(|_| Error::Computation("worker pool is not running".to_string()))?;
            reply_rx.await.map_err(|_| {
                Error::Computation(format!("{} job was dropped by the worker", job_type.as_str()))
            })
        };

        let result = match tokio::time::timeout(self.wait_timeout, wait).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(
                    subsystem = "jobs",
                    component = "dispatcher",
                    %job_id,
                    job_type = job_type.as_str(),
                    timeout_secs = self.wait_timeout.as_secs_f64(),
                    "Timed out waiting for job"
                );
                return Err(Error::Computation(format!(
                    "{} job timed out after {:?}",
                    job_type.as_str(),
                    self.wait_timeout
                )));
            }
        };

        debug!(
            subsystem = "jobs",
            component = "dispatcher",
            %job_id,
            job_type = job_type.as_str(),
            success = result.is_success(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Job answered"
        );

        match result {
            JobResult::Success(data) => Ok(data),
            JobResult::Failed(message) => Err(Error::Computation(message)),
        }
    }

    /// Values of every map in a reference collection at an MNI coordinate.
    ///
    /// References other than `terms` / `topics` fall back to `terms`.
    pub async fn voxel_lookup(
        &self,
        reference: &str,
        x: i32,
        y: i32,
        z: i32,
        include_posterior: bool,
    ) -> Result<Vec<VoxelValue>> {
        let payload = VoxelLookupPayload {
            reference: voxel_reference(reference).to_string(),
            x,
            y,
            z,
            include_posterior,
        };
        let data = self
            .submit(JobType::VoxelLookup, serde_json::to_value(&payload)?)
            .await?
            .ok_or_else(|| Error::Computation("voxel lookup returned no data".to_string()))?;
        Ok(serde_json::from_value(data)?)
    }

    /// Decode an image against a reference set, writing its result table.
    pub async fn decode_image(
        &self,
        image_path: &str,
        set_name: &str,
        decoding_uuid: &str,
    ) -> Result<bool> {
        let payload = DecodeImagePayload {
            image_path: image_path.to_string(),
            decoding_set: set_name.to_string(),
            decoding_uuid: decoding_uuid.to_string(),
        };
        self.submit(JobType::DecodeImage, serde_json::to_value(&payload)?)
            .await?;
        Ok(true)
    }

    /// Render the scatterplot of an image against one reference map.
    pub async fn render_scatterplot(&self, payload: ScatterplotPayload) -> Result<bool> {
        self.submit(JobType::RenderScatterplot, serde_json::to_value(&payload)?)
            .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voxel_reference_fallback() {
        assert_eq!(voxel_reference("terms"), "terms");
        assert_eq!(voxel_reference("topics"), "topics");
        assert_eq!(voxel_reference("../secret"), "terms");
        assert_eq!(voxel_reference(""), "terms");
    }

    #[tokio::test]
    async fn test_closed_pool_is_computation_error() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let dispatcher = TaskDispatcher::new(tx, Duration::from_secs(1));
        let err = dispatcher
            .submit(JobType::VoxelLookup, serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Computation(_)));
    }

    #[tokio::test]
    async fn test_unanswered_job_times_out() {
        let (tx, mut rx) = mpsc::channel::<Submission>(1);
        // Hold submissions without replying.
        let holder = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Some(s) = rx.recv().await {
                held.push(s);
            }
        });
        let dispatcher = TaskDispatcher::new(tx, Duration::from_millis(50));
        let err = dispatcher
            .decode_image("/tmp/x.nii", "terms_20k", "abc")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
        holder.abort();
    }
}
