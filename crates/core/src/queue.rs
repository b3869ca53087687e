use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::adapters::{compose, EffectiveModel};
use crate::backend::ModelBackend;
use crate::error::{EngineError, Result};
use crate::job::{AdapterSelection, Job, JobSpec, JobStatus, Progress};
use crate::media;
use crate::persistence::JobsPersistence;
use crate::registry::{ModelRegistry, ResolvedModel};
use crate::resources::ResourceManager;
use crate::window::{generate, GeneratorOptions};

/// CPU-side work done before a job touches the device lane.
struct PreparedJob {
    resolved: ResolvedModel,
    residency: Vec<(String, u64)>,
    effective: EffectiveModel,
}

struct JobEntry {
    job: Job,
    cancel: CancellationToken,
    prepare: Option<JoinHandle<Result<PreparedJob>>>,
}

pub struct QueueSetup {
    pub registry: Arc<ModelRegistry>,
    pub resources: Arc<ResourceManager>,
    pub backend: Arc<dyn ModelBackend>,
    pub persistence: Option<JobsPersistence>,
    pub output_dir: PathBuf,
    pub generator: GeneratorOptions,
    pub preprocess_workers: usize,
}

struct QueueInner {
    jobs: DashMap<Uuid, JobEntry>,
    pending: Mutex<VecDeque<Uuid>>,
    notify: Notify,
    // Exactly one job may hold the device at a time.
    device_lane: Semaphore,
    // Bounds concurrent CPU preprocessing; independent of the device lane.
    preprocess_lane: Arc<Semaphore>,
    registry: Arc<ModelRegistry>,
    resources: Arc<ResourceManager>,
    backend: Arc<dyn ModelBackend>,
    persistence: Option<JobsPersistence>,
    output_dir: PathBuf,
    generator: GeneratorOptions,
    shutdown: CancellationToken,
}

/// FIFO generation queue. Submission validates and resolves eagerly, CPU
/// preprocessing runs concurrently for queued jobs, and execution is
/// strictly one job at a time in arrival order.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl TaskQueue {
    pub fn start(setup: QueueSetup) -> Self {
        let inner = Arc::new(QueueInner {
            jobs: DashMap::new(),
            pending: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            device_lane: Semaphore::new(1),
            preprocess_lane: Arc::new(Semaphore::new(setup.preprocess_workers.max(1))),
            registry: setup.registry,
            resources: setup.resources,
            backend: setup.backend,
            persistence: setup.persistence,
            output_dir: setup.output_dir,
            generator: setup.generator,
            shutdown: CancellationToken::new(),
        });

        let worker_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            worker_loop(worker_inner).await;
        });

        Self { inner }
    }

    /// Validate, resolve, enqueue, and kick off preprocessing. Settings
    /// and registry errors are reported here, before the job enters the
    /// queue.
    pub fn submit(&self, spec: JobSpec) -> Result<Uuid> {
        spec.validate()?;
        let resolved = self.inner.registry.resolve(&spec.model)?;
        for selection in &spec.adapters {
            if self.inner.registry.adapter(&selection.name).is_none() {
                return Err(EngineError::InvalidSettings(format!(
                    "unknown adapter '{}'",
                    selection.name
                )));
            }
        }

        let adapter_selections = spec.adapters.clone();
        let conditioning_inputs = spec.conditioning_input_paths();
        let job = Job::new(spec);
        let id = job.id;
        let cancel = CancellationToken::new();
        self.persist(&job);

        let prepare = {
            let inner = Arc::clone(&self.inner);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                prepare_job(inner, resolved, adapter_selections, conditioning_inputs, cancel).await
            })
        };

        self.inner.jobs.insert(
            id,
            JobEntry {
                job,
                cancel,
                prepare: Some(prepare),
            },
        );
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(id);
        self.inner.notify.notify_one();
        info!(job_id = %id, "Job queued");
        Ok(id)
    }

    /// Cancel a job. Queued jobs leave the pending lane and never run;
    /// running jobs stop at the next step boundary and their partial
    /// output is discarded. Cancelling a terminal job is a no-op.
    pub fn cancel(&self, id: Uuid) -> Result<()> {
        let mut entry = self.inner.jobs.get_mut(&id).ok_or(EngineError::UnknownJob(id))?;
        if entry.job.status.is_terminal() {
            return Ok(());
        }

        entry.cancel.cancel();
        if entry.job.status == JobStatus::Queued {
            self.inner
                .pending
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .retain(|queued| *queued != id);
            if let Some(handle) = entry.prepare.take() {
                handle.abort();
            }
            entry.job.status = JobStatus::Cancelled;
            entry.job.updated_at = Utc::now();
            let snapshot = entry.job.clone();
            drop(entry);
            self.persist(&snapshot);
            info!(job_id = %id, "Queued job cancelled");
        } else {
            info!(job_id = %id, "Cancellation requested for running job");
        }
        Ok(())
    }

    pub fn poll(&self, id: Uuid) -> Option<Job> {
        self.inner.jobs.get(&id).map(|entry| entry.job.clone())
    }

    /// All known jobs, oldest first.
    pub fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .inner
            .jobs
            .iter()
            .map(|entry| entry.job.clone())
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        jobs
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.notify.notify_one();
    }

    fn persist(&self, job: &Job) {
        persist_job(&self.inner, job);
    }
}

fn persist_job(inner: &QueueInner, job: &Job) {
    if let Some(persistence) = &inner.persistence {
        if let Err(err) = persistence.upsert_job(job) {
            warn!(job_id = %job.id, error = %err, "Failed to persist job state");
        }
    }
}

async fn prepare_job(
    inner: Arc<QueueInner>,
    resolved: ResolvedModel,
    adapter_selections: Vec<AdapterSelection>,
    conditioning_inputs: Vec<PathBuf>,
    cancel: CancellationToken,
) -> Result<PreparedJob> {
    let _permit = inner
        .preprocess_lane
        .acquire()
        .await
        .map_err(|_| EngineError::Cancelled)?;
    if cancel.is_cancelled() {
        return Err(EngineError::Cancelled);
    }

    // Conditioning references are read here, off the device lane, so a
    // missing file fails the job before it ever holds the device.
    for path in &conditioning_inputs {
        if let Err(err) = tokio::fs::metadata(path).await {
            return Err(EngineError::InvalidSettings(format!(
                "conditioning input {} is not readable: {err}",
                path.display()
            )));
        }
    }

    // Resolution already validated embedded adapter references; here we
    // account for their residency alongside the weight files, then build
    // the composed weights the device run will use. Embedded adapters
    // apply first, user selections after, both in declaration order.
    let mut residency = resolved.residency_entries();
    let stacked: Vec<(String, f32)> = resolved
        .embedded_adapters
        .iter()
        .map(|e| (e.adapter.clone(), e.scale))
        .chain(
            adapter_selections
                .into_iter()
                .map(|selection| (selection.name, selection.scale)),
        )
        .collect();
    for (name, _) in &stacked {
        if let Some(source) = inner.registry.adapter(name) {
            residency.push((format!("adapter:{}", source.name), source.size_bytes));
        }
    }
    residency.sort();
    residency.dedup();

    let base = inner
        .backend
        .load_base_weights(&resolved)
        .map_err(|err| EngineError::BackendFailure {
            step: "load_weights".to_string(),
            source: err,
        })?;
    let mut stack = Vec::new();
    for (name, scale) in &stacked {
        let Some(source) = inner.registry.adapter(name) else {
            continue;
        };
        let delta =
            inner
                .backend
                .load_adapter(source)
                .map_err(|err| EngineError::BackendFailure {
                    step: format!("load_adapter[{name}]"),
                    source: err,
                })?;
        stack.push((delta, *scale));
    }
    let effective = compose(&base, &stack)?;

    Ok(PreparedJob {
        resolved,
        residency,
        effective,
    })
}

async fn worker_loop(inner: Arc<QueueInner>) {
    loop {
        let next = inner
            .pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front();

        match next {
            Some(id) => {
                let permit = match inner.device_lane.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                run_job(&inner, id).await;
                drop(permit);
            }
            None => {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => return,
                    _ = inner.notify.notified() => {}
                }
            }
        }
    }
}

async fn run_job(inner: &Arc<QueueInner>, id: Uuid) {
    let (cancel, prepare) = {
        let Some(mut entry) = inner.jobs.get_mut(&id) else {
            return;
        };
        // Cancelled while queued; nothing to do.
        if entry.job.status != JobStatus::Queued {
            return;
        }
        entry.job.status = JobStatus::Running;
        entry.job.updated_at = Utc::now();
        let snapshot = entry.job.clone();
        let cancel = entry.cancel.clone();
        let prepare = entry.prepare.take();
        drop(entry);
        persist_job(inner, &snapshot);
        (cancel, prepare)
    };

    let outcome = execute_job(inner, id, &cancel, prepare).await;
    inner.resources.release_pins(&id.to_string());

    let Some(mut entry) = inner.jobs.get_mut(&id) else {
        return;
    };
    entry.job.updated_at = Utc::now();
    match outcome {
        Ok(output_path) => {
            entry.job.status = JobStatus::Completed;
            entry.job.output_path = Some(output_path);
            info!(job_id = %id, "Job completed");
        }
        Err(err) if err.is_cancelled() => {
            entry.job.status = JobStatus::Cancelled;
            info!(job_id = %id, "Job cancelled");
        }
        Err(err) => {
            entry.job.status = JobStatus::Failed;
            entry.job.error = Some(format!("{}: {err}", err.kind()));
            error!(job_id = %id, kind = err.kind(), error = %err, "Job failed");
        }
    }
    let snapshot = entry.job.clone();
    drop(entry);
    persist_job(inner, &snapshot);
}

async fn execute_job(
    inner: &Arc<QueueInner>,
    id: Uuid,
    cancel: &CancellationToken,
    prepare: Option<JoinHandle<Result<PreparedJob>>>,
) -> Result<String> {
    let prepare = prepare.ok_or_else(|| EngineError::BackendFailure {
        step: "prepare".to_string(),
        source: anyhow::anyhow!("preprocessing handle missing"),
    })?;
    let prepared = prepare.await.map_err(|err| {
        if err.is_cancelled() {
            EngineError::Cancelled
        } else {
            EngineError::BackendFailure {
                step: "prepare".to_string(),
                source: anyhow::anyhow!(err),
            }
        }
    })??;

    if cancel.is_cancelled() {
        return Err(EngineError::Cancelled);
    }

    inner
        .resources
        .ensure_resident(&prepared.residency, Some(&id.to_string()))?;

    let spec = inner
        .jobs
        .get(&id)
        .map(|entry| entry.job.spec.clone())
        .ok_or(EngineError::UnknownJob(id))?;

    let backend = Arc::clone(&inner.backend);
    let options = inner.generator.clone();
    let cancel = cancel.clone();
    let progress_inner = Arc::clone(inner);
    let model = prepared.resolved.name.clone();
    let effective = prepared.effective;

    info!(job_id = %id, model = %model, frames = spec.frames, "Job starting on device lane");

    let clip = tokio::task::spawn_blocking(move || {
        let mut last_persisted_window = usize::MAX;
        let mut on_progress = |progress: &Progress| {
            if let Some(mut entry) = progress_inner.jobs.get_mut(&id) {
                entry.job.progress = *progress;
                entry.job.updated_at = Utc::now();
                if progress.windows_done != last_persisted_window {
                    last_persisted_window = progress.windows_done;
                    let snapshot = entry.job.clone();
                    drop(entry);
                    persist_job(&progress_inner, &snapshot);
                }
            }
        };
        generate(
            backend.as_ref(),
            &spec,
            &effective,
            &options,
            &cancel,
            &mut on_progress,
        )
    })
    .await
    .map_err(|err| EngineError::BackendFailure {
        step: "generate".to_string(),
        source: anyhow::anyhow!(err),
    })??;

    let output_path = inner.output_dir.join(format!("{id}.vtensor"));
    media::write_clip(&output_path, &clip).map_err(|source| EngineError::BackendFailure {
        step: "write_output".to_string(),
        source,
    })?;
    Ok(output_path.display().to_string())
}
