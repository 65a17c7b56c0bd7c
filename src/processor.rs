/*!
 * Batch processor: drives a loader through a pipeline to a consumer.
 *
 * Execution is inline when the CPU budget allows a single worker, or across
 * a fixed pool of worker threads otherwise. The parallel path preserves
 * strict loader-submission order at the consumer and bounds how far the
 * loader can run ahead: outstanding results are tracked in a FIFO queue,
 * new submissions block once the queue holds twice the worker count, and
 * completed results are only ever drained from the front.
 */

use log::info;
use parking_lot::Mutex;
use std::collections::{BTreeSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{mpsc, Arc};
use std::thread;

use crate::config::RootConfig;
use crate::errors::{ConfigError, ProcessError};
use crate::operator::registry::OperatorRegistry;
use crate::operator::ProcessType;
use crate::pipeline::{OptionsMap, Pipeline};
use crate::shared::{SharedResourceCache, SharedSnapshot};
use crate::unit::{Batch, BatchMeta, ProcessedBatch};

/// Environment variable carrying the CPU budget
pub const CPU_BUDGET_ENV: &str = "NB_CPU";

/// Worker count derived from the external CPU budget; a budget of one or
/// fewer selects inline execution.
pub fn num_workers_from_env() -> usize {
    let cpus = std::env::var(CPU_BUDGET_ENV)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(1);
    if cpus > 1 { cpus } else { 0 }
}

/// Producer of translation-unit batches
pub trait BatchLoader {
    fn next_batch(&mut self) -> Option<Batch>;
}

impl<I: Iterator<Item = Batch>> BatchLoader for I {
    fn next_batch(&mut self) -> Option<Batch> {
        self.next()
    }
}

/// Sink receiving processed batches, in strict loader order
pub trait BatchConsumer {
    fn accept(&mut self, batch: ProcessedBatch) -> Result<(), ProcessError>;
}

impl<F: FnMut(ProcessedBatch) -> Result<(), ProcessError>> BatchConsumer for F {
    fn accept(&mut self, batch: ProcessedBatch) -> Result<(), ProcessError> {
        self(batch)
    }
}

/// Drives an external loader through the pipeline to an external consumer
pub struct BatchProcessor {
    registry: Arc<OperatorRegistry>,
    config: Arc<RootConfig>,
    process_type: ProcessType,
    num_workers: usize,
    shared: Arc<SharedResourceCache>,
}

impl BatchProcessor {
    /// Processor with the worker count taken from the CPU budget
    pub fn new(
        registry: Arc<OperatorRegistry>,
        config: Arc<RootConfig>,
        process_type: ProcessType,
    ) -> Result<Self, ConfigError> {
        Self::with_workers(registry, config, process_type, num_workers_from_env())
    }

    /// Processor with an explicit worker count (0 = inline)
    pub fn with_workers(
        registry: Arc<OperatorRegistry>,
        config: Arc<RootConfig>,
        process_type: ProcessType,
        num_workers: usize,
    ) -> Result<Self, ConfigError> {
        let shared = Arc::new(SharedResourceCache::new(
            registry.clone(),
            config.clone(),
            process_type,
            None,
        )?);
        Ok(Self {
            registry,
            config,
            process_type,
            num_workers,
            shared,
        })
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// The shared-resource cache backing this processor
    pub fn shared_cache(&self) -> &Arc<SharedResourceCache> {
        &self.shared
    }

    /// Processes every loader batch with default settings
    pub fn process<L, C>(&self, loader: L, consumer: &mut C) -> Result<(), ProcessError>
    where
        L: BatchLoader,
        C: BatchConsumer,
    {
        self.process_with(loader, consumer, None, None, None)
    }

    /// Processes every loader batch.
    ///
    /// `exit_step` truncates the preprocess chain (inclusive) for staged
    /// vocabulary/subword extraction; `options` carries per-operator runtime
    /// options; `pipeline` optionally seeds the inline path with an already
    /// built pipeline, reused while batch labels match.
    pub fn process_with<L, C>(
        &self,
        loader: L,
        consumer: &mut C,
        exit_step: Option<usize>,
        options: Option<&OptionsMap>,
        pipeline: Option<Pipeline>,
    ) -> Result<(), ProcessError>
    where
        L: BatchLoader,
        C: BatchConsumer,
    {
        if self.num_workers == 0 {
            self.process_inline(loader, consumer, exit_step, options, pipeline)
        } else {
            self.process_parallel(loader, consumer, exit_step, options)
        }
    }

    fn process_inline<L, C>(
        &self,
        mut loader: L,
        consumer: &mut C,
        exit_step: Option<usize>,
        options: Option<&OptionsMap>,
        mut pipeline: Option<Pipeline>,
    ) -> Result<(), ProcessError>
    where
        L: BatchLoader,
        C: BatchConsumer,
    {
        info!("Start processing");
        while let Some(batch) = loader.next_batch() {
            let label = batch.meta.label_set();
            let snapshot = self.snapshot_for(&batch.meta)?;
            let (processed, rebuilt) = process_batch(
                pipeline.take(),
                batch,
                &self.registry,
                &self.config,
                self.process_type,
                exit_step,
                label,
                &snapshot,
                options,
            )?;
            pipeline = Some(rebuilt);
            consumer.accept(processed)?;
        }
        Ok(())
    }

    fn process_parallel<L, C>(
        &self,
        mut loader: L,
        consumer: &mut C,
        exit_step: Option<usize>,
        options: Option<&OptionsMap>,
    ) -> Result<(), ProcessError>
    where
        L: BatchLoader,
        C: BatchConsumer,
    {
        info!("Start processing using {} worker(s)", self.num_workers);

        let (job_tx, job_rx) = mpsc::channel::<Job>();
        let job_rx = Arc::new(Mutex::new(job_rx));
        let options = Arc::new(options.cloned());

        let mut handles = Vec::with_capacity(self.num_workers);
        for i in 0..self.num_workers {
            let jobs = job_rx.clone();
            let registry = self.registry.clone();
            let config = self.config.clone();
            let process_type = self.process_type;
            let options = options.clone();
            let handle = thread::Builder::new()
                .name(format!("worker-{}", i))
                .spawn(move || worker_loop(jobs, registry, config, process_type, exit_step, options))
                .map_err(|e| ProcessError::Other(format!("failed to spawn worker: {}", e)))?;
            handles.push(handle);
        }

        let mut pending: VecDeque<mpsc::Receiver<WorkerResult>> = VecDeque::new();
        let cap = 2 * self.num_workers;

        while let Some(batch) = loader.next_batch() {
            let label = batch.meta.label_set();
            let snapshot = self.snapshot_for(&batch.meta)?;
            let (result_tx, result_rx) = mpsc::sync_channel(1);
            job_tx
                .send(Job {
                    batch,
                    label,
                    snapshot,
                    result_tx,
                })
                .map_err(|_| ProcessError::Other("worker pool shut down unexpectedly".into()))?;
            pending.push_back(result_rx);

            // Backpressure: once the loader is a full queue ahead, wait on
            // the oldest outstanding result before submitting more.
            if pending.len() == cap {
                if let Some(front) = pending.pop_front() {
                    deliver(consumer, front.recv())?;
                }
            }

            // Consume whatever is ready at the head of the queue. Draining
            // strictly from the front keeps consumer order equal to loader
            // order even when workers finish out of order.
            while let Some(front) = pending.front() {
                match front.try_recv() {
                    Ok(result) => {
                        pending.pop_front();
                        deliver(consumer, Ok(result))?;
                    }
                    Err(mpsc::TryRecvError::Empty) => break,
                    Err(mpsc::TryRecvError::Disconnected) => {
                        return Err(worker_vanished());
                    }
                }
            }
        }

        // Wait for and consume all remaining batches, in order.
        while let Some(front) = pending.pop_front() {
            deliver(consumer, front.recv())?;
        }

        drop(job_tx);
        for handle in handles {
            let _ = handle.join();
        }
        Ok(())
    }

    fn snapshot_for(&self, meta: &BatchMeta) -> Result<SharedSnapshot, ProcessError> {
        // Absent and mapping-shaped labels both select the default state.
        match meta.label_set() {
            None => Ok(self.shared.default_snapshot()),
            Some(set) => Ok(self.shared.get(Some(&set))?),
        }
    }
}

type WorkerResult = Result<ProcessedBatch, ProcessError>;

struct Job {
    batch: Batch,
    label: Option<BTreeSet<String>>,
    snapshot: SharedSnapshot,
    result_tx: mpsc::SyncSender<WorkerResult>,
}

fn deliver<C: BatchConsumer>(
    consumer: &mut C,
    result: Result<WorkerResult, mpsc::RecvError>,
) -> Result<(), ProcessError> {
    let processed = result.map_err(|_| worker_vanished())??;
    consumer.accept(processed)
}

fn worker_vanished() -> ProcessError {
    ProcessError::Other("a worker exited before returning its result".into())
}

/// Rebuilds the pipeline if required and processes one batch.
///
/// The pipeline is reused as long as its override label matches the batch's;
/// a label change rebuilds it against the given shared snapshot.
#[allow(clippy::too_many_arguments)]
fn process_batch(
    pipeline: Option<Pipeline>,
    batch: Batch,
    registry: &OperatorRegistry,
    config: &RootConfig,
    process_type: ProcessType,
    exit_step: Option<usize>,
    label: Option<BTreeSet<String>>,
    snapshot: &SharedSnapshot,
    options: Option<&OptionsMap>,
) -> Result<(ProcessedBatch, Pipeline), ProcessError> {
    let pipeline = match pipeline {
        Some(existing) if existing.override_label() == label.as_ref() => existing,
        _ => {
            match &label {
                None => info!("Building default processing pipeline"),
                Some(label) => info!("Building processing pipeline for label {:?}", label),
            }
            Pipeline::new(
                registry,
                config,
                process_type,
                exit_step,
                label,
                Some(snapshot.as_ref()),
            )?
        }
    };

    info!(
        "Processing {} samples{}",
        batch.units.len(),
        batch
            .meta
            .base_name
            .as_deref()
            .map(|name| format!(" from {}", name))
            .unwrap_or_default()
    );

    let batch = pipeline.run(batch, options)?;
    let outputs = batch
        .units
        .iter()
        .map(|tu| tu.export(pipeline.process_type()))
        .collect();
    Ok((
        ProcessedBatch {
            outputs,
            meta: batch.meta,
        },
        pipeline,
    ))
}

/// Keeps one cached pipeline per worker, rebuilt inside the worker on label
/// change so bound operators and their resources never cross thread
/// boundaries.
fn worker_loop(
    jobs: Arc<Mutex<mpsc::Receiver<Job>>>,
    registry: Arc<OperatorRegistry>,
    config: Arc<RootConfig>,
    process_type: ProcessType,
    exit_step: Option<usize>,
    options: Arc<Option<OptionsMap>>,
) {
    let worker_name = thread::current()
        .name()
        .unwrap_or("worker")
        .to_string();
    let mut pipeline: Option<Pipeline> = None;

    loop {
        // Hold the lock only while taking a job off the queue.
        let job = { jobs.lock().recv() };
        let Ok(job) = job else {
            break;
        };

        let corpus = job.batch.meta.base_name.clone();
        let cached = pipeline.take();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            process_batch(
                cached,
                job.batch,
                &registry,
                &config,
                process_type,
                exit_step,
                job.label,
                &job.snapshot,
                options.as_ref().as_ref(),
            )
        }));

        let result = match outcome {
            Ok(Ok((processed, rebuilt))) => {
                pipeline = Some(rebuilt);
                Ok(processed)
            }
            Ok(Err(error)) => Err(ProcessError::Worker {
                worker: worker_name.clone(),
                corpus,
                message: error.to_string(),
            }),
            Err(panic) => Err(ProcessError::Worker {
                worker: worker_name.clone(),
                corpus,
                message: panic_message(&panic),
            }),
        };

        if job.result_tx.send(result).is_err() {
            // The orchestrator aborted the run.
            break;
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker panicked".to_string()
    }
}
