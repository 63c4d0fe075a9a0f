//! Worker pool executing dispatched jobs.
//!
//! Jobs arrive as [`Submission`]s over a bounded channel. Each accepted job
//! holds a semaphore permit while it runs, so at most `max_concurrent_jobs`
//! execute at once and the queue applies backpressure beyond that.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, oneshot, RwLock, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use nsweb_core::{defaults, Error, Job, JobType, Result};

use crate::dispatcher::TaskDispatcher;
use crate::handler::{JobContext, JobHandler, JobResult};

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum number of concurrent jobs.
    pub max_concurrent_jobs: usize,
    /// Bounded submission queue length.
    pub queue_capacity: usize,
    /// Hard execution limit per job.
    pub job_timeout: Duration,
    /// Whether to enable job processing.
    pub enabled: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: defaults::JOB_MAX_CONCURRENT,
            queue_capacity: defaults::JOB_QUEUE_CAPACITY,
            job_timeout: Duration::from_secs(defaults::JOB_TIMEOUT_SECS),
            enabled: true,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `JOB_WORKER_ENABLED` | `true` | Enable/disable job processing |
    /// | `JOB_MAX_CONCURRENT` | `4` | Max concurrent jobs |
    /// | `JOB_QUEUE_CAPACITY` | `64` | Pending submissions before senders wait |
    /// | `JOB_TIMEOUT_SECS` | `300` | Per-job execution limit |
    pub fn from_env() -> Self {
        let enabled = std::env::var("JOB_WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let max_concurrent_jobs = std::env::var("JOB_MAX_CONCURRENT")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults::JOB_MAX_CONCURRENT)
            .max(1);

        let queue_capacity = std::env::var("JOB_QUEUE_CAPACITY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults::JOB_QUEUE_CAPACITY)
            .max(1);

        let job_timeout_secs = std::env::var("JOB_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::JOB_TIMEOUT_SECS);

        Self {
            max_concurrent_jobs,
            queue_capacity,
            job_timeout: Duration::from_secs(job_timeout_secs),
            enabled,
        }
    }

    /// Set maximum concurrent jobs.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max.max(1);
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Enable or disable job processing.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Event emitted by the worker pool.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    JobStarted {
        job_id: Uuid,
        job_type: JobType,
    },
    JobProgress {
        job_id: Uuid,
        percent: i32,
        message: Option<String>,
    },
    JobCompleted {
        job_id: Uuid,
        job_type: JobType,
    },
    JobFailed {
        job_id: Uuid,
        job_type: JobType,
        error: String,
    },
    WorkerStarted,
    WorkerStopped,
}

/// A job plus the channel its result is delivered on.
pub struct Submission {
    pub job: Job,
    pub reply: oneshot::Sender<JobResult>,
}

/// Handle for controlling a running worker pool.
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    submit_tx: mpsc::Sender<Submission>,
    event_rx: broadcast::Receiver<WorkerEvent>,
}

impl WorkerHandle {
    /// Signal the worker to stop accepting jobs.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))?;
        Ok(())
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_rx.resubscribe()
    }

    /// Dispatcher that submits to this pool and waits at most `wait_timeout`.
    pub fn dispatcher(&self, wait_timeout: Duration) -> TaskDispatcher {
        TaskDispatcher::new(self.submit_tx.clone(), wait_timeout)
    }
}

/// Worker pool that executes submitted jobs with registered handlers.
pub struct JobWorker {
    config: WorkerConfig,
    handlers: Arc<RwLock<HashMap<JobType, Arc<dyn JobHandler>>>>,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl JobWorker {
    pub fn new(config: WorkerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(defaults::EVENT_BUS_CAPACITY);
        Self {
            config,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
        }
    }

    /// Start the worker and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (submit_tx, submit_rx) = mpsc::channel(self.config.queue_capacity);
        let event_rx = self.event_tx.subscribe();

        tokio::spawn(async move {
            self.run(shutdown_rx, submit_rx).await;
        });

        WorkerHandle {
            shutdown_tx,
            submit_tx,
            event_rx,
        }
    }

    async fn run(
        self,
        mut shutdown_rx: mpsc::Receiver<()>,
        mut submit_rx: mpsc::Receiver<Submission>,
    ) {
        if !self.config.enabled {
            info!("Job worker is disabled, not starting");
            return;
        }

        info!(
            subsystem = "jobs",
            component = "worker",
            max_concurrent = self.config.max_concurrent_jobs,
            queue_capacity = self.config.queue_capacity,
            job_timeout_secs = self.config.job_timeout.as_secs(),
            "Job worker started"
        );
        let _ = self.event_tx.send(WorkerEvent::WorkerStarted);

        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_jobs));

        loop {
            let submission = tokio::select! {
                Some(()) = shutdown_rx.recv() => {
                    info!("Job worker received shutdown signal");
                    break;
                }
                next = submit_rx.recv() => match next {
                    Some(submission) => submission,
                    None => break,
                },
            };

            let permit = match permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let runner = JobRunner {
                handlers: self.handlers.clone(),
                event_tx: self.event_tx.clone(),
                job_timeout: self.config.job_timeout,
            };
            tokio::spawn(async move {
                let Submission { job, reply } = submission;
                let result = runner.execute_job(job).await;
                // The caller may have timed out and dropped its receiver.
                let _ = reply.send(result);
                drop(permit);
            });
        }

        let _ = self.event_tx.send(WorkerEvent::WorkerStopped);
        info!("Job worker stopped");
    }
}

/// Reference bundle for executing a single job in a spawned task.
struct JobRunner {
    handlers: Arc<RwLock<HashMap<JobType, Arc<dyn JobHandler>>>>,
    event_tx: broadcast::Sender<WorkerEvent>,
    job_timeout: Duration,
}

impl JobRunner {
    async fn execute_job(self, job: Job) -> JobResult {
        let start = Instant::now();
        let job_id = job.id;
        let job_type = job.job_type;

        debug!(%job_id, job_type = job_type.as_str(), "Processing job");
        let _ = self
            .event_tx
            .send(WorkerEvent::JobStarted { job_id, job_type });

        let handler = {
            let handlers = self.handlers.read().await;
            handlers.get(&job_type).cloned()
        };

        let result = match handler {
            Some(handler) => {
                let event_tx = self.event_tx.clone();
                let ctx = JobContext::new(job).with_progress_callback(move |percent, message| {
                    let _ = event_tx.send(WorkerEvent::JobProgress {
                        job_id,
                        percent,
                        message: message.map(String::from),
                    });
                });

                match tokio::time::timeout(self.job_timeout, handler.execute(ctx)).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(
                            %job_id,
                            job_type = job_type.as_str(),
                            "Job exceeded timeout of {}s",
                            self.job_timeout.as_secs()
                        );
                        JobResult::Failed(format!(
                            "Job exceeded timeout of {}s",
                            self.job_timeout.as_secs()
                        ))
                    }
                }
            }
            None => {
                warn!(job_type = job_type.as_str(), "No handler registered for job type");
                JobResult::Failed(format!("No handler for job type: {}", job_type.as_str()))
            }
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        match &result {
            JobResult::Success(_) => {
                info!(
                    subsystem = "jobs",
                    component = "worker",
                    %job_id,
                    job_type = job_type.as_str(),
                    duration_ms,
                    "Job completed successfully"
                );
                let _ = self
                    .event_tx
                    .send(WorkerEvent::JobCompleted { job_id, job_type });
            }
            JobResult::Failed(error) => {
                error!(
                    subsystem = "jobs",
                    component = "worker",
                    %job_id,
                    job_type = job_type.as_str(),
                    %error,
                    duration_ms,
                    "Job failed"
                );
                let _ = self.event_tx.send(WorkerEvent::JobFailed {
                    job_id,
                    job_type,
                    error: error.clone(),
                });
            }
        }
        result
    }
}

/// Builder for creating a job worker with handlers.
pub struct WorkerBuilder {
    config: WorkerConfig,
    handlers: Vec<Box<dyn JobHandler>>,
}

impl Default for WorkerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerBuilder {
    pub fn new() -> Self {
        Self {
            config: WorkerConfig::default(),
            handlers: Vec::new(),
        }
    }

    /// Set the worker configuration.
    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a handler.
    pub fn with_handler<H: JobHandler + 'static>(mut self, handler: H) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Build and return the worker.
    pub async fn build(self) -> JobWorker {
        let worker = JobWorker::new(self.config);
        {
            let mut handlers = worker.handlers.write().await;
            for handler in self.handlers {
                handlers.insert(handler.job_type(), Arc::from(handler));
            }
        }
        worker
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.max_concurrent_jobs, 4);
        assert_eq!(config.queue_capacity, 64);
        assert_eq!(config.job_timeout, Duration::from_secs(300));
        assert!(config.enabled);
    }

    #[test]
    fn test_worker_config_builder() {
        let config = WorkerConfig::default()
            .with_max_concurrent(8)
            .with_queue_capacity(0)
            .with_job_timeout(Duration::from_secs(5))
            .with_enabled(false);

        assert_eq!(config.max_concurrent_jobs, 8);
        assert_eq!(config.queue_capacity, 1);
        assert_eq!(config.job_timeout, Duration::from_secs(5));
        assert!(!config.enabled);
    }

    #[test]
    fn test_worker_event_job_failed() {
        let job_id = Uuid::new_v4();
        let event = WorkerEvent::JobFailed {
            job_id,
            job_type: JobType::DecodeImage,
            error: "boom".to_string(),
        };
        match event {
            WorkerEvent::JobFailed { error, job_type, .. } => {
                assert_eq!(error, "boom");
                assert_eq!(job_type, JobType::DecodeImage);
            }
            _ => panic!("Wrong event variant"),
        }
    }
}
