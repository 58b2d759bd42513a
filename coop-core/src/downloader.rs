use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use futures::future::join_all;
use reqwest::Client;
use tokio::{
    runtime::{self, Handle},
    sync::Semaphore,
    task::JoinSet,
};
use tracing::{debug, error, warn};

use crate::{
    blocking,
    download::{plan_parts, wants_multipart, DownloadPlan, ObjectDescriptor, Strategy},
    errors::{CoopError, CoopResult},
    event::{Event, NoProgress, ProgressSink},
    fetch::{fetch_part, fetch_whole, probe_range_support},
    inventory::{summarize, BatchSummary},
    storage::{combine_parts, discard_partial, discard_parts, prepare_parent},
};

/// Worker threads used when no async runtime can be started.
pub const FALLBACK_WORKERS: usize = 10;

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Objects transferred at the same time.
    pub max_concurrent: usize,
    /// Parts per large object; 0 or 1 disables multipart.
    pub part_count: u32,
    /// Ask before transferring anything.
    pub interactive: bool,
    /// Suppress per-object error output.
    pub quiet: bool,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        DownloadOptions {
            max_concurrent: 10,
            part_count: 8,
            interactive: true,
            quiet: false,
        }
    }
}

/// Outcome of one batch. Declined batches report zero successes and
/// failures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchResult {
    pub successful_count: usize,
    pub failed_count: usize,
    pub total_requested: usize,
}

/// Gate consulted before an interactive batch starts.
pub trait ConfirmGate: Send + Sync {
    fn confirm(&self, summary: &BatchSummary, output_dir: &Path) -> bool;
}

/// Confirms every batch.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoConfirm;

impl ConfirmGate for AutoConfirm {
    fn confirm(&self, _summary: &BatchSummary, _output_dir: &Path) -> bool {
        true
    }
}

/// The engine a batch runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    /// Async tasks on a current-thread tokio runtime, multipart capable.
    Cooperative,
    /// Fixed pool of worker threads doing blocking whole-object requests.
    ThreadPool,
}

impl Engine {
    /// A new runtime cannot be started from inside a running one.
    pub fn detect() -> Engine {
        if Handle::try_current().is_ok() {
            Engine::ThreadPool
        } else {
            Engine::Cooperative
        }
    }
}

/// Represents a bulk download into one output directory.
pub struct Downloader {
    /// Root the object keys are resolved against. Created on demand.
    pub output_dir: PathBuf,
    pub options: DownloadOptions,
    progress: Arc<dyn ProgressSink>,
    confirm: Arc<dyn ConfirmGate>,
}

enum Admission {
    Run(Vec<ObjectDescriptor>),
    Done(BatchResult),
}

impl Downloader {
    pub fn new(output_dir: impl Into<PathBuf>, options: DownloadOptions) -> CoopResult<Self> {
        if options.max_concurrent == 0 {
            return Err(CoopError::InvalidOptions(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        Ok(Downloader {
            output_dir: output_dir.into(),
            options,
            progress: Arc::new(NoProgress),
            confirm: Arc::new(AutoConfirm),
        })
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_confirm(mut self, confirm: Arc<dyn ConfirmGate>) -> Self {
        self.confirm = confirm;
        self
    }

    /// Downloads the batch on the best engine available on this thread.
    ///
    /// Outside of any async runtime a current-thread runtime is started for
    /// the cooperative engine. Inside one, or if the runtime cannot be
    /// built, the batch runs on the thread pool without multipart.
    pub fn download(&self, batch: Vec<ObjectDescriptor>) -> CoopResult<BatchResult> {
        let batch = match self.admit(batch) {
            Admission::Run(batch) => batch,
            Admission::Done(result) => return Ok(result),
        };

        if Engine::detect() == Engine::ThreadPool {
            warn!("already running inside an async runtime, falling back to thread pool downloads");
            return self.run_thread_pool(batch);
        }

        match runtime::Builder::new_current_thread().enable_all().build() {
            Ok(rt) => rt.block_on(self.run_batch(batch)),
            Err(e) => {
                warn!(error = %e, "could not start async runtime, falling back to thread pool downloads");
                self.run_thread_pool(batch)
            }
        }
    }

    /// Downloads the batch on the caller's runtime with the cooperative
    /// engine.
    pub async fn download_async(&self, batch: Vec<ObjectDescriptor>) -> CoopResult<BatchResult> {
        match self.admit(batch) {
            Admission::Run(batch) => self.run_batch(batch).await,
            Admission::Done(result) => Ok(result),
        }
    }

    /// Empty check, confirmation and largest-first ordering.
    fn admit(&self, mut batch: Vec<ObjectDescriptor>) -> Admission {
        if batch.is_empty() {
            return Admission::Done(BatchResult::default());
        }
        if self.options.interactive {
            let summary = summarize(&batch);
            if !self.confirm.confirm(&summary, &self.output_dir) {
                debug!(objects = batch.len(), "download declined");
                return Admission::Done(BatchResult {
                    total_requested: batch.len(),
                    ..BatchResult::default()
                });
            }
        }
        batch.sort_by(|a, b| b.size.cmp(&a.size));
        Admission::Run(batch)
    }

    fn run_thread_pool(&self, batch: Vec<ObjectDescriptor>) -> CoopResult<BatchResult> {
        blocking::download_blocking(
            batch,
            &self.output_dir,
            FALLBACK_WORKERS,
            self.options.quiet,
            self.progress.clone(),
        )
    }

    async fn run_batch(&self, batch: Vec<ObjectDescriptor>) -> CoopResult<BatchResult> {
        let total_requested = batch.len();
        let transfer = Arc::new(Transfer {
            client: Client::builder().build()?,
            output_dir: self.output_dir.clone(),
            part_count: self.options.part_count,
            quiet: self.options.quiet,
            progress: self.progress.clone(),
        });
        let slots = Arc::new(Semaphore::new(self.options.max_concurrent));
        let mut tasks = JoinSet::new();

        for (id, descriptor) in batch.into_iter().enumerate() {
            let transfer = transfer.clone();
            let slots = slots.clone();
            tasks.spawn(async move {
                let _slot = slots
                    .acquire_owned()
                    .await
                    .map_err(|e| CoopError::Scheduler(e.to_string()))?;
                Ok::<bool, CoopError>(transfer.download_object(id, descriptor).await)
            });
        }

        let mut result = BatchResult {
            total_requested,
            ..BatchResult::default()
        };
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(true)) => result.successful_count += 1,
                Ok(Ok(false)) => result.failed_count += 1,
                Ok(Err(e)) => {
                    tasks.abort_all();
                    return Err(e);
                }
                Err(e) => {
                    tasks.abort_all();
                    return Err(CoopError::Scheduler(e.to_string()));
                }
            }
        }
        Ok(result)
    }
}

/// Everything a single object transfer needs, shared by all tasks.
struct Transfer {
    client: Client,
    output_dir: PathBuf,
    part_count: u32,
    quiet: bool,
    progress: Arc<dyn ProgressSink>,
}

impl Transfer {
    /// Returns whether the object ended up on disk.
    async fn download_object(&self, id: usize, descriptor: ObjectDescriptor) -> bool {
        let destination = descriptor.destination(&self.output_dir);
        self.progress.on_event(Event::Started {
            id,
            name: descriptor.file_name().to_string(),
            total: descriptor.size,
        });

        let ranges_supported = wants_multipart(descriptor.size, self.part_count)
            && probe_range_support(&self.client, &descriptor.download_url).await;
        let DownloadPlan {
            descriptor,
            mut strategy,
        } = DownloadPlan::decide(descriptor, self.part_count, ranges_supported);
        debug!(key = %descriptor.key, size = descriptor.size, ?strategy, "dispatching");

        loop {
            match (strategy, self.execute(id, &descriptor, &destination, strategy).await) {
                (_, Ok(written)) => {
                    debug!(key = %descriptor.key, written, "downloaded");
                    self.progress.on_event(Event::Finished { id });
                    return true;
                }
                (Strategy::Multipart(_), Err(e)) => {
                    if !self.quiet {
                        warn!(key = %descriptor.key, error = %e, "multipart download failed, retrying as a single request");
                    }
                    self.progress.on_event(Event::Reset { id });
                    strategy = Strategy::Whole;
                }
                (Strategy::Whole, Err(e)) => {
                    if !self.quiet {
                        error!(key = %descriptor.key, error = %e, "download failed");
                    }
                    discard_partial(&destination).await;
                    self.progress.on_event(Event::Withdrawn { id });
                    return false;
                }
            }
        }
    }

    async fn execute(
        &self,
        id: usize,
        descriptor: &ObjectDescriptor,
        destination: &Path,
        strategy: Strategy,
    ) -> CoopResult<u64> {
        match strategy {
            Strategy::Whole => {
                fetch_whole(
                    &self.client,
                    &descriptor.download_url,
                    destination,
                    self.progress.as_ref(),
                    id,
                )
                .await
            }
            Strategy::Multipart(part_count) => {
                self.fetch_multipart(id, descriptor, destination, part_count)
                    .await
            }
        }
    }

    /// All parts run concurrently; any failure discards every part file.
    async fn fetch_multipart(
        &self,
        id: usize,
        descriptor: &ObjectDescriptor,
        destination: &Path,
        part_count: u32,
    ) -> CoopResult<u64> {
        prepare_parent(destination).await?;
        let parts = plan_parts(descriptor.size, part_count, destination);

        let results = join_all(parts.iter().map(|part| {
            fetch_part(
                &self.client,
                &descriptor.download_url,
                part,
                self.progress.as_ref(),
                id,
            )
        }))
        .await;

        for (part, result) in parts.iter().zip(results) {
            if let Err(e) = result {
                debug!(key = %descriptor.key, part = part.index, error = %e, "part failed");
                discard_parts(&parts).await;
                return Err(e);
            }
        }

        match combine_parts(&parts, destination).await {
            Ok(written) => Ok(written),
            Err(e) => {
                discard_parts(&parts).await;
                Err(e)
            }
        }
    }
}
