//! Generic periodic request scheduler.
//!
//! A [`RequestScheduler`] drains a pending request store on a timer. Each
//! cycle lists pending rows grouped by destination pod, turns them into one
//! [`OutboundBatch`] per pod with the configured builder, sends the batches
//! concurrently and deletes the rows of every batch the pod accepted. Rows of
//! a pod that failed stay in the store and are picked up by a later cycle.
//!
//! Scheduler kinds differ only by their [`SchedulerConfig`]: limits, the
//! request store and the batch builder.
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::backoff::PodBackoff;
use crate::config::Requests;
use crate::error::{SchedulerError, TransportError};
use crate::model::OutboundBatch;
use crate::transport::PodTransport;

/// Pending entries keyed by destination pod id.
pub type PendingGroups<E> = BTreeMap<i64, Vec<E>>;

/// Turns one cycle's pending entries into network-ready batches.
pub type BuildBatches<E, D> =
    Arc<dyn Fn(PendingGroups<E>) -> Vec<OutboundBatch<D>> + Send + Sync>;

/// Store of not-yet-sent requests of one scheduler kind.
#[async_trait]
pub trait RequestModel: Send + Sync {
    type Entry: Send + 'static;

    /// At most `limit_pods` pods and `limit_per_pod` entries per pod, oldest
    /// first, never including a pod of `exclude_pods`.
    async fn list_pending(
        &self,
        limit_pods: u32,
        limit_per_pod: u32,
        exclude_pods: &[i64],
    ) -> anyhow::Result<PendingGroups<Self::Entry>>;

    /// Atomically deletes the given request ids.
    async fn remove_by_ids(&self, ids: &[i64]) -> anyhow::Result<()>;

    async fn count_pending(&self) -> anyhow::Result<i64>;

    async fn remove_all(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchSettings {
    pub requests_in_parallel: usize,
    pub timeout: Duration,
    /// Zero disables per-pod backoff.
    pub max_backoff: Duration,
}

impl DispatchSettings {
    pub fn from_config(requests: &Requests) -> Self {
        Self {
            requests_in_parallel: requests.requests_in_parallel,
            timeout: requests.dispatch_timeout(),
            max_backoff: requests.max_backoff(),
        }
    }
}

pub struct SchedulerConfig<E, D>
where
    E: Send + 'static,
{
    pub description: &'static str,
    pub limit_pods: u32,
    pub limit_per_pod: u32,
    pub request_model: Arc<dyn RequestModel<Entry = E>>,
    pub build_batches: BuildBatches<E, D>,
    pub dispatch: DispatchSettings,
}

/// Outcome of one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub batches: usize,
    pub requests_retired: usize,
    pub pods_failed: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStats {
    pub description: &'static str,
    pub total_requests: i64,
    pub remaining_milli_seconds: Option<u64>,
    pub max_requests_in_parallel: usize,
    pub milli_seconds_interval: Option<u64>,
    pub limit_pods: u32,
    pub limit_per_pod: u32,
}

struct Activation {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
    interval: Duration,
}

enum Delivery {
    Delivered { pod_id: i64, retired: usize },
    Failed { pod_id: i64 },
}

pub struct RequestScheduler<E, D>
where
    E: Send + 'static,
{
    config: SchedulerConfig<E, D>,
    transport: Arc<dyn PodTransport>,
    backoff: Mutex<PodBackoff>,
    // Held for the whole cycle: timer ticks and force_send never overlap.
    cycle_lock: Mutex<()>,
    // Deadline of the next timer tick; only the timer task moves it.
    next_tick: Mutex<Option<Instant>>,
    activation: Mutex<Option<Activation>>,
}

impl<E, D> RequestScheduler<E, D>
where
    E: Send + 'static,
    D: Serialize + Send + Sync + 'static,
{
    pub fn new(config: SchedulerConfig<E, D>, transport: Arc<dyn PodTransport>) -> Self {
        let backoff = PodBackoff::new(config.dispatch.max_backoff);
        Self {
            config,
            transport,
            backoff: Mutex::new(backoff),
            cycle_lock: Mutex::new(()),
            next_tick: Mutex::new(None),
            activation: Mutex::new(None),
        }
    }

    pub fn description(&self) -> &'static str {
        self.config.description
    }

    /// Starts the timer. The first cycle runs one `interval` from now.
    pub async fn activate(self: &Arc<Self>, interval: Duration) {
        let description = self.config.description;
        if interval.is_zero() {
            warn!(description, "refusing to activate with a zero interval");
            return;
        }
        let mut slot = self.activation.lock().await;
        if slot.is_some() {
            warn!(description, "request scheduler already active");
            return;
        }

        let (stop, mut stopped) = watch::channel(false);
        let first_tick = Instant::now() + interval;
        *self.next_tick.lock().await = Some(first_tick);
        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(first_tick, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                let ticked = tokio::select! {
                    biased;
                    _ = stopped.changed() => break,
                    ticked = ticker.tick() => ticked,
                };
                // With `Delay`, the tick after a late one is one interval past
                // the moment it was observed.
                let due = ticked.max(Instant::now()) + interval;
                *scheduler.next_tick.lock().await = Some(due);
                match scheduler.run_cycle().await {
                    Ok(report) => debug!(description, ?report, "request cycle done"),
                    Err(err) => error!(description, %err, "request cycle failed"),
                }
            }
        });

        *slot = Some(Activation {
            stop,
            handle,
            interval,
        });
        info!(
            description,
            interval_ms = interval.as_millis() as u64,
            "request scheduler activated"
        );
    }

    /// Stops the timer and waits for an in-flight cycle to finish.
    pub async fn deactivate(&self) {
        let Some(activation) = self.activation.lock().await.take() else {
            return;
        };
        let _ = activation.stop.send(true);
        if let Err(err) = activation.handle.await {
            error!(
                description = self.config.description,
                ?err,
                "request scheduler task ended abnormally"
            );
        }
        *self.next_tick.lock().await = None;
        info!(description = self.config.description, "request scheduler deactivated");
    }

    pub async fn is_active(&self) -> bool {
        self.activation.lock().await.is_some()
    }

    /// Runs a cycle now instead of waiting for the timer.
    pub async fn force_send(&self) -> Result<CycleReport, SchedulerError> {
        info!(description = self.config.description, "force sending requests");
        self.run_cycle().await
    }

    /// Time left before the next timer tick; `None` when inactive. Forced
    /// cycles do not move the timer.
    pub async fn remaining_time(&self) -> Option<Duration> {
        if self.activation.lock().await.is_none() {
            return None;
        }
        let due = (*self.next_tick.lock().await)?;
        Some(due.saturating_duration_since(Instant::now()))
    }

    pub async fn stats(&self) -> Result<SchedulerStats, SchedulerError> {
        let total_requests = self
            .config
            .request_model
            .count_pending()
            .await
            .map_err(SchedulerError::Dependency)?;
        let interval = self
            .activation
            .lock()
            .await
            .as_ref()
            .map(|a| a.interval.as_millis() as u64);
        Ok(SchedulerStats {
            description: self.config.description,
            total_requests,
            remaining_milli_seconds: self.remaining_time().await.map(|d| d.as_millis() as u64),
            max_requests_in_parallel: self.config.dispatch.requests_in_parallel,
            milli_seconds_interval: interval,
            limit_pods: self.config.limit_pods,
            limit_per_pod: self.config.limit_per_pod,
        })
    }

    /// Drops every pending request, e.g. when leaving the federation.
    pub async fn clear_pending(&self) -> Result<(), SchedulerError> {
        let _running = self.cycle_lock.lock().await;
        self.config
            .request_model
            .remove_all()
            .await
            .map_err(SchedulerError::Dependency)?;
        info!(description = self.config.description, "pending requests cleared");
        Ok(())
    }

    /// One scheduling cycle, run to completion including every delete.
    #[instrument(skip_all, fields(description = self.config.description))]
    pub async fn run_cycle(&self) -> Result<CycleReport, SchedulerError> {
        let _running = self.cycle_lock.lock().await;
        let started = Instant::now();

        let blocked = self.backoff.lock().await.blocked(started);
        let pending = self
            .config
            .request_model
            .list_pending(self.config.limit_pods, self.config.limit_per_pod, &blocked)
            .await
            .map_err(SchedulerError::Cycle)?;
        if pending.is_empty() {
            debug!(skipped_pods = blocked.len(), "no requests to make");
            return Ok(CycleReport::default());
        }

        let batches = (self.config.build_batches)(pending);
        info!(pods = batches.len(), "making requests to pods");

        let parallel = self.config.dispatch.requests_in_parallel.max(1);
        let mut in_flight = FuturesUnordered::new();
        let mut deliveries = Vec::with_capacity(batches.len());
        for batch in batches {
            if in_flight.len() >= parallel {
                if let Some(delivery) = in_flight.next().await {
                    deliveries.push(delivery);
                }
            }
            in_flight.push(self.dispatch(batch));
        }
        while let Some(delivery) = in_flight.next().await {
            deliveries.push(delivery);
        }

        let mut report = CycleReport {
            batches: deliveries.len(),
            ..Default::default()
        };
        let mut backoff = self.backoff.lock().await;
        let now = Instant::now();
        for delivery in deliveries {
            match delivery {
                Delivery::Delivered { pod_id, retired } => {
                    backoff.record_success(pod_id);
                    report.requests_retired += retired;
                }
                Delivery::Failed { pod_id } => {
                    let delay = backoff.record_failure(pod_id, now);
                    debug!(
                        pod_id,
                        failures = backoff.failures(pod_id),
                        delay_ms = delay.as_millis() as u64,
                        "pod backed off"
                    );
                    report.pods_failed.push(pod_id);
                }
            }
        }
        report.pods_failed.sort_unstable();
        Ok(report)
    }

    async fn dispatch(&self, batch: OutboundBatch<D>) -> Delivery {
        let pod_id = batch.to_pod.id;
        if batch.datas.is_empty() {
            // Nothing worth sending; the ids only belong to skipped rows.
            return self.retire(pod_id, &batch.ids).await;
        }
        match self.send_batch(&batch).await {
            Ok(()) => self.retire(pod_id, &batch.ids).await,
            Err(source) => {
                let err = SchedulerError::Transport { pod_id, source };
                warn!(
                    %err,
                    host = %batch.to_pod.host,
                    requests = batch.ids.len(),
                    "error sending request to pod; keeping requests"
                );
                Delivery::Failed { pod_id }
            }
        }
    }

    async fn send_batch(&self, batch: &OutboundBatch<D>) -> Result<(), TransportError> {
        let payload = batch.payload()?;
        let timeout = self.config.dispatch.timeout;
        let send = self.transport.send(&batch.to_pod, batch.endpoint, &payload);
        match tokio::time::timeout(timeout, send).await {
            Ok(res) => res,
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }

    async fn retire(&self, pod_id: i64, ids: &[i64]) -> Delivery {
        match self.config.request_model.remove_by_ids(ids).await {
            Ok(()) => {
                debug!(pod_id, count = ids.len(), "requests retired");
                Delivery::Delivered {
                    pod_id,
                    retired: ids.len(),
                }
            }
            Err(err) => {
                error!(
                    pod_id,
                    ?err,
                    "cannot delete delivered requests; they will be sent again"
                );
                Delivery::Delivered { pod_id, retired: 0 }
            }
        }
    }
}
