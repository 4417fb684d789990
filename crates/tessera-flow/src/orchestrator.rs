//! The stage orchestrator.
//!
//! Runs `(stage, month)` units:
//!
//! 1. Record `Pending` and evaluate the declared inputs' fingerprints.
//! 2. `Skipped` if the last `Succeeded` run saw the same fingerprints, every
//!    input is acknowledged by this stage at that fingerprint, and the output
//!    still exists (unless `force`).
//! 3. Otherwise `Running`: invoke the processor and publish its output under
//!    a per-attempt deadline, retrying transient failures with backoff.
//! 4. On success acknowledge every input for this stage, then record
//!    `Succeeded`; any failure records `Failed` with the captured error.
//!
//! Failures are scoped to one unit. `run_month` marks stages downstream of a
//! failure as failed without invoking them; `run_all` processes months
//! concurrently and collects everything into a [`RunReport`].
//!
//! Stage log appends are retried under the same [`RetryPolicy`] as stage
//! attempts, so a transient log outage does not lose a terminal record.
//!
//! [`RetryPolicy`]: crate::config::RetryPolicy

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tracing::Instrument;

use tessera_catalog::manifest::paths;
use tessera_catalog::{Fingerprint, FingerprintRegistry, PartitionStore};
use tessera_core::{stage_span, PartitionKey};

use crate::config::OrchestratorConfig;
use crate::error::{Error, Result};
use crate::log::StageLog;
use crate::metrics::FlowMetrics;
use crate::pipeline::{Pipeline, RegisteredStage};
use crate::processor::{check_output_month, StageContext, StageOutput};
use crate::report::RunReport;
use crate::stage::{StageRecord, StageStatus};

/// Signals running stages to stop.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Requests shutdown. In-flight attempts are abandoned and recorded
    /// `Failed`; nothing partially written becomes visible.
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    /// Returns true once shutdown was requested.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Where an attempt published its output.
struct Published {
    location: String,
    fingerprint: Fingerprint,
}

/// Sequences stages per month with skip-if-unchanged and retry semantics.
pub struct StageOrchestrator {
    pipeline: Pipeline,
    store: PartitionStore,
    registry: FingerprintRegistry,
    log: Arc<dyn StageLog>,
    config: OrchestratorConfig,
    shutdown: ShutdownHandle,
    metrics: FlowMetrics,
}

impl std::fmt::Debug for StageOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageOrchestrator")
            .field("pipeline", &self.pipeline)
            .field("store", &self.store)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl StageOrchestrator {
    /// Creates an orchestrator.
    #[must_use]
    pub fn new(
        pipeline: Pipeline,
        store: PartitionStore,
        log: Arc<dyn StageLog>,
        config: OrchestratorConfig,
    ) -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            registry: FingerprintRegistry::new(store.clone()),
            pipeline,
            store,
            log,
            config,
            shutdown: ShutdownHandle { tx: Arc::new(tx) },
            metrics: FlowMetrics::new(),
        }
    }

    /// The pipeline being run.
    #[must_use]
    pub const fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// The registry acknowledgements are written to.
    #[must_use]
    pub const fn registry(&self) -> &FingerprintRegistry {
        &self.registry
    }

    /// The stage log.
    #[must_use]
    pub fn log(&self) -> &Arc<dyn StageLog> {
        &self.log
    }

    /// A handle that cancels running stages.
    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Resolves once shutdown is requested.
    async fn cancelled(&self) {
        let mut rx = self.shutdown.tx.subscribe();
        let stopped = rx.wait_for(|stop| *stop).await.is_ok();
        if !stopped {
            std::future::pending::<()>().await;
        }
    }

    fn context(&self, stage: &RegisteredStage, key: PartitionKey) -> StageContext {
        StageContext {
            stage: stage.definition.name.clone(),
            key,
            inputs: stage.definition.inputs.clone(),
            output: stage.definition.output.clone(),
            store: self.store.clone(),
            registry: self.registry.clone(),
            attempt: 0,
        }
    }

    async fn append(&self, record: &StageRecord, from: Option<StageStatus>) -> Result<()> {
        let retry = self.config.retry;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.log.append(record).await {
                Ok(()) => break,
                Err(err) if err.is_transient() && retry.should_retry(attempt) => {
                    let delay = retry.delay_after(attempt);
                    tracing::warn!(
                        %err,
                        attempt,
                        ?delay,
                        stage = %record.stage_name,
                        status = record.status.as_label(),
                        "stage log append failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
        self.metrics.record_transition(
            &record.stage_name,
            from.map_or("none", |s| s.as_label()),
            record.status.as_label(),
        );
        Ok(())
    }

    /// Runs one stage for one month with the configured per-attempt deadline.
    ///
    /// Stage failures are reported through the returned record (`Failed`
    /// with `last_error`), not as `Err`.
    ///
    /// # Errors
    ///
    /// - `StageNotFound` for an unknown stage.
    /// - Errors writing the stage log that persist after retries.
    pub async fn run(&self, stage: &str, key: PartitionKey) -> Result<StageRecord> {
        self.run_with_deadline(stage, key, self.config.stage_timeout)
            .await
    }

    /// Like [`run`](Self::run), but each attempt is bounded by `deadline`
    /// instead of the configured stage timeout.
    ///
    /// # Errors
    ///
    /// Same as [`run`](Self::run).
    #[tracing::instrument(skip(self), fields(month = %key))]
    pub async fn run_with_deadline(
        &self,
        stage: &str,
        key: PartitionKey,
        deadline: Duration,
    ) -> Result<StageRecord> {
        let registered = self.pipeline.stage(stage)?;
        let ctx = self.context(registered, key);
        let mut record = StageRecord::pending(stage, key);
        self.append(&record, None).await?;

        if self.shutdown.is_shutdown() {
            let err = Error::Cancelled {
                stage: stage.to_string(),
                key,
            };
            return self.finish_failed(record, &err).await;
        }

        let processor = registered.processor.clone();
        let inputs = match self
            .with_retry(&ctx, deadline, |ctx| {
                let processor = processor.clone();
                async move { processor.input_fingerprints(&ctx).await }
            })
            .await
        {
            Ok((inputs, _)) => inputs,
            Err((err, _)) => {
                tracing::warn!(%err, "inputs unavailable");
                return self.finish_failed(record, &err).await;
            }
        };
        record.input_fingerprints = inputs;

        if self.config.force {
            tracing::info!("forced run");
        } else if let Some(previous) = self.up_to_date(&ctx, &record.input_fingerprints).await? {
            record.output_location = previous.output_location;
            record.output_fingerprint = previous.output_fingerprint;
            record.transition_to(StageStatus::Skipped)?;
            self.append(&record, Some(StageStatus::Pending)).await?;
            tracing::info!("inputs unchanged, skipped");
            return Ok(record);
        }

        record.transition_to(StageStatus::Running)?;
        self.append(&record, Some(StageStatus::Pending)).await?;
        let started = Instant::now();

        let outcome = self
            .with_retry(&ctx, deadline, |ctx| {
                let processor = processor.clone();
                async move {
                    let output = processor.process(&ctx).await?;
                    publish(&ctx, output).await
                }
            })
            .await;

        let outcome = match outcome {
            Ok((published, attempts)) => {
                record.attempt = attempts;
                self.acknowledge(&ctx, &record.input_fingerprints)
                    .await
                    .map(|()| published)
            }
            Err((err, attempts)) => {
                record.attempt = attempts;
                Err(err)
            }
        };

        match outcome {
            Ok(published) => {
                record.output_location = Some(published.location);
                record.output_fingerprint = Some(published.fingerprint);
                record.transition_to(StageStatus::Succeeded)?;
                tracing::info!(attempts = record.attempt, "stage succeeded");
            }
            Err(err) => {
                tracing::error!(%err, attempts = record.attempt, "stage failed");
                record.fail(&err)?;
            }
        }
        self.metrics
            .observe_duration(stage, record.status.as_label(), started.elapsed());
        self.append(&record, Some(StageStatus::Running)).await?;
        Ok(record)
    }

    /// Runs every stage of the pipeline for one month, in dependency order.
    ///
    /// A stage whose upstream failed is recorded `Failed` with an upstream
    /// error and not invoked.
    ///
    /// # Errors
    ///
    /// Errors writing the stage log that persist after retries.
    pub async fn run_month(&self, key: PartitionKey) -> Result<Vec<StageRecord>> {
        self.run_month_with_deadline(key, self.config.stage_timeout)
            .await
    }

    /// Like [`run_month`](Self::run_month), with a caller-supplied
    /// per-attempt deadline for every stage.
    ///
    /// # Errors
    ///
    /// Same as [`run_month`](Self::run_month).
    #[tracing::instrument(skip(self), fields(month = %key))]
    pub async fn run_month_with_deadline(
        &self,
        key: PartitionKey,
        deadline: Duration,
    ) -> Result<Vec<StageRecord>> {
        let mut failed: HashSet<String> = HashSet::new();
        let mut records = Vec::with_capacity(self.pipeline.len());

        for stage in self.pipeline.order() {
            let upstream = self.pipeline.upstream(stage)?;
            let record = match upstream.into_iter().find(|u| failed.contains(u)) {
                Some(upstream) => {
                    let record = StageRecord::pending(stage.clone(), key);
                    self.append(&record, None).await?;
                    self.finish_failed(record, &Error::UpstreamFailed { upstream })
                        .await?
                }
                None => self.run_with_deadline(stage, key, deadline).await?,
            };
            if record.status == StageStatus::Failed {
                failed.insert(stage.clone());
            }
            records.push(record);
        }
        Ok(records)
    }

    /// Runs the pipeline for every month in `keys`, up to `max_concurrency`
    /// months at a time. One month's failure never stops the others.
    pub async fn run_all(&self, keys: impl IntoIterator<Item = PartitionKey>) -> RunReport {
        let keys: Vec<PartitionKey> = keys
            .into_iter()
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        tracing::info!(months = keys.len(), "starting run");

        let results: Vec<(PartitionKey, Result<Vec<StageRecord>>)> = stream::iter(keys)
            .map(|key| async move { (key, self.run_month(key).await) })
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect()
            .await;

        let mut report = RunReport::default();
        for (key, result) in results {
            match result {
                Ok(records) => report.push_month(records),
                Err(err) => {
                    tracing::error!(month = %key, %err, "month aborted");
                    report.push_error(key, err.to_string());
                }
            }
        }
        let report = report.finish();
        tracing::info!(
            succeeded = report.count(StageStatus::Succeeded),
            skipped = report.count(StageStatus::Skipped),
            failed = report.count(StageStatus::Failed),
            "run finished"
        );
        report
    }

    /// Re-runs only the months that failed in `previous`.
    pub async fn replay_failed(&self, previous: &RunReport) -> RunReport {
        self.run_all(previous.failed_months()).await
    }

    async fn finish_failed(&self, mut record: StageRecord, err: &Error) -> Result<StageRecord> {
        let from = record.status;
        record.fail(err)?;
        self.append(&record, Some(from)).await?;
        Ok(record)
    }

    /// The last successful run, if this one may be skipped.
    async fn up_to_date(
        &self,
        ctx: &StageContext,
        inputs: &BTreeMap<String, Fingerprint>,
    ) -> Result<Option<StageRecord>> {
        let Some(previous) = self.log.last_succeeded(&ctx.stage, ctx.key).await? else {
            return Ok(None);
        };
        if previous.input_fingerprints != *inputs {
            tracing::debug!("input set or fingerprints changed since last success");
            return Ok(None);
        }
        for (input, fingerprint) in inputs {
            let acknowledged = self
                .registry
                .acknowledged(ctx.key, input, &ctx.stage)
                .await?
                .is_some_and(|ack| ack.fingerprint == *fingerprint);
            if !acknowledged {
                tracing::debug!(%input, "input not acknowledged at current fingerprint");
                return Ok(None);
            }
        }
        if !self.store.exists(ctx.key, &ctx.output).await? {
            tracing::debug!(output = %ctx.output, "output missing");
            return Ok(None);
        }
        Ok(Some(previous))
    }

    async fn acknowledge(
        &self,
        ctx: &StageContext,
        inputs: &BTreeMap<String, Fingerprint>,
    ) -> Result<()> {
        for (input, fingerprint) in inputs {
            self.registry
                .record(ctx.key, input, &ctx.stage, fingerprint)
                .await?;
        }
        Ok(())
    }

    /// Runs `op` under the deadline and shutdown signal, retrying transient
    /// failures. Returns the value or the final error, with attempts made.
    async fn with_retry<T, F, Fut>(
        &self,
        ctx: &StageContext,
        deadline: Duration,
        mut op: F,
    ) -> std::result::Result<(T, u32), (Error, u32)>
    where
        F: FnMut(StageContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let retry = self.config.retry;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut attempt_ctx = ctx.clone();
            attempt_ctx.attempt = attempt;
            let span = stage_span(&ctx.stage, ctx.key, attempt);

            let result = tokio::select! {
                biased;
                () = self.cancelled() => Err(Error::Cancelled {
                    stage: ctx.stage.clone(),
                    key: ctx.key,
                }),
                outcome = tokio::time::timeout(deadline, op(attempt_ctx)).instrument(span) => {
                    outcome.unwrap_or_else(|_| Err(Error::Timeout {
                        stage: ctx.stage.clone(),
                        key: ctx.key,
                        after: deadline,
                    }))
                }
            };

            match result {
                Ok(value) => return Ok((value, attempt)),
                Err(err) if err.is_transient() && retry.should_retry(attempt) => {
                    let delay = retry.delay_after(attempt);
                    tracing::warn!(%err, attempt, ?delay, stage = %ctx.stage, "transient failure, retrying");
                    self.metrics.record_retry(&ctx.stage);
                    tokio::select! {
                        biased;
                        () = self.cancelled() => {
                            return Err((
                                Error::Cancelled {
                                    stage: ctx.stage.clone(),
                                    key: ctx.key,
                                },
                                attempt,
                            ));
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => return Err((err, attempt)),
            }
        }
    }
}

/// Writes a stage output through the partition store.
async fn publish(ctx: &StageContext, output: StageOutput) -> Result<Published> {
    check_output_month(ctx, &output)?;
    let outcome = match &output {
        StageOutput::Partition(partition) => {
            ctx.store.write(ctx.key, &ctx.output, partition).await?
        }
        StageOutput::Combined(dataset) => ctx.store.write_combined(&ctx.output, dataset).await?,
    };
    tracing::debug!(
        written = outcome.is_written(),
        fingerprint = %outcome.fingerprint(),
        "output published"
    );
    Ok(Published {
        location: ctx
            .store
            .config()
            .join(&paths::partition_dir(&ctx.output, ctx.key)),
        fingerprint: outcome.fingerprint().clone(),
    })
}
