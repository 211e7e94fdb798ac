//! Bounded worker pool that runs charges off the request path.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::manager::BillingManager;
use super::metrics;
use crate::config::DispatcherConfig;
use crate::error::BillingError;
use crate::models::{BillingRecord, UsageLog};
use crate::policy::BillingBehavior;

#[derive(Debug, Clone)]
pub enum ChargeJob {
    Charge(BillingRecord),
    LogOnly(UsageLog),
}

impl ChargeJob {
    pub fn kind(&self) -> &'static str {
        match self {
            ChargeJob::Charge(_) => "charge",
            ChargeJob::LogOnly(_) => "log_only",
        }
    }

    pub fn request_id(&self) -> &str {
        match self {
            ChargeJob::Charge(record) => &record.request_id,
            ChargeJob::LogOnly(log) => &log.request_id,
        }
    }
}

pub struct ChargeDispatcher {
    config: DispatcherConfig,
    manager: Arc<BillingManager>,
    job_tx: mpsc::Sender<ChargeJob>,
    job_rx: Arc<Mutex<mpsc::Receiver<ChargeJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown_token: CancellationToken,
}

impl ChargeDispatcher {
    pub fn new(manager: Arc<BillingManager>, config: DispatcherConfig) -> Self {
        let (job_tx, job_rx) = mpsc::channel(config.queue_size);
        Self {
            config,
            manager,
            job_tx,
            job_rx: Arc::new(Mutex::new(job_rx)),
            workers: Mutex::new(Vec::new()),
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Spawn the workers. Calling it again while workers are running is a no-op.
    pub async fn start(&self) {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() || self.shutdown_token.is_cancelled() {
            return;
        }

        tracing::info!(
            worker_count = self.config.worker_count,
            queue_size = self.config.queue_size,
            "Starting charge dispatcher"
        );

        for worker_id in 0..self.config.worker_count {
            let worker = Worker {
                id: worker_id,
                manager: self.manager.clone(),
                timeout: self.config.charge_timeout(),
            };
            let job_rx = self.job_rx.clone();
            let shutdown = self.shutdown_token.clone();
            workers.push(tokio::spawn(async move {
                worker.run(job_rx, shutdown).await;
            }));
        }
    }

    /// Queue a job without waiting. A full queue is reported, never blocked on.
    pub fn dispatch(&self, job: ChargeJob) -> Result<(), BillingError> {
        if self.shutdown_token.is_cancelled() {
            return Err(BillingError::DispatcherStopped);
        }
        let kind = job.kind();
        match self.job_tx.try_send(job) {
            Ok(()) => {
                metrics::record_dispatch_job(kind, "queued");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(job)) => {
                tracing::warn!(
                    request_id = %job.request_id(),
                    job = kind,
                    "Charge queue full"
                );
                metrics::record_dispatch_job(kind, "rejected");
                Err(BillingError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(BillingError::DispatcherStopped),
        }
    }

    /// Route a classified request. Returns whether anything was queued.
    pub fn dispatch_for(
        &self,
        behavior: BillingBehavior,
        record: BillingRecord,
    ) -> Result<bool, BillingError> {
        match behavior {
            BillingBehavior::Skip => Ok(false),
            BillingBehavior::LogOnly => self
                .dispatch(ChargeJob::LogOnly(record.to_usage_log()))
                .map(|_| true),
            BillingBehavior::Normal => self.dispatch(ChargeJob::Charge(record)).map(|_| true),
        }
    }

    pub fn queued(&self) -> usize {
        self.config.queue_size - self.job_tx.capacity()
    }

    /// Stop accepting jobs, let workers finish what is queued, then join them.
    pub async fn shutdown(&self) {
        tracing::info!("Initiating charge dispatcher shutdown");
        self.shutdown_token.cancel();

        let handles: Vec<_> = self.workers.lock().await.drain(..).collect();
        for result in join_all(handles).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Charge worker terminated abnormally");
            }
        }
        tracing::info!("Charge dispatcher stopped");
    }
}

struct Worker {
    id: usize,
    manager: Arc<BillingManager>,
    timeout: std::time::Duration,
}

impl Worker {
    async fn run(
        &self,
        job_rx: Arc<Mutex<mpsc::Receiver<ChargeJob>>>,
        shutdown: CancellationToken,
    ) {
        loop {
            let job = {
                let mut rx = job_rx.lock().await;
                tokio::select! {
                    biased;
                    job = rx.recv() => job,
                    _ = shutdown.cancelled() => rx.try_recv().ok(),
                }
            };

            match job {
                Some(job) => self.process(job).await,
                None => break,
            }
        }
        tracing::debug!(worker_id = self.id, "Charge worker exiting");
    }

    async fn process(&self, job: ChargeJob) {
        let kind = job.kind();
        let request_id = job.request_id().to_string();
        let start = Instant::now();

        let outcome = tokio::time::timeout(self.timeout, async move {
            match job {
                ChargeJob::Charge(mut record) => {
                    self.manager.process_request(&mut record).await.map(|_| ())
                }
                ChargeJob::LogOnly(log) => {
                    self.manager.create_usage_log_only(log).await.map(|_| ())
                }
            }
        })
        .await;

        match outcome {
            Ok(Ok(())) => {
                metrics::record_dispatch_job(kind, "completed");
                tracing::debug!(
                    worker_id = self.id,
                    request_id = %request_id,
                    job = kind,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Charge job completed"
                );
            }
            Ok(Err(e)) => {
                metrics::record_dispatch_job(kind, "failed");
                tracing::error!(
                    worker_id = self.id,
                    request_id = %request_id,
                    job = kind,
                    error = %e,
                    "Charge job failed"
                );
            }
            Err(_) => {
                metrics::record_dispatch_job(kind, "timeout");
                tracing::error!(
                    worker_id = self.id,
                    request_id = %request_id,
                    job = kind,
                    timeout_secs = self.timeout.as_secs(),
                    "Charge job timed out"
                );
            }
        }
    }
}
