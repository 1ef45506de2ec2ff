//! Quick and dirty updates of video statistics.
//!
//! Likes, dislikes and views change far too often to be sent as full video
//! updates. Every change enqueues one marker per known pod; each cycle merges
//! all markers of a (pod, video) pair into a single entry carrying the
//! current value of every statistic that changed.
use async_trait::async_trait;
use sqlx::{Sqlite, Transaction};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, instrument};

use crate::config::Config;
use crate::db::{self, Pool, QaduRequestRow};
use crate::error::SchedulerError;
use crate::model::{OutboundBatch, QaduType, RequestData, VideoStatSnapshot};
use crate::scheduler::{
    DispatchSettings, PendingGroups, RequestModel, RequestScheduler, SchedulerConfig,
};
use crate::transport::PodTransport;

pub const QADU_ENDPOINT: &str = "videos/qadu";

pub type QaduScheduler = RequestScheduler<QaduRequestRow, VideoStatSnapshot>;

/// A statistic change to fan out to every pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewQaduRequest {
    pub kind: QaduType,
    pub video_id: String,
}

/// Pending QADU markers stored in SQLite.
#[derive(Debug, Clone)]
pub struct SqliteQaduRequests {
    pool: Pool,
}

impl SqliteQaduRequests {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RequestModel for SqliteQaduRequests {
    type Entry = QaduRequestRow;

    async fn list_pending(
        &self,
        limit_pods: u32,
        limit_per_pod: u32,
        exclude_pods: &[i64],
    ) -> anyhow::Result<PendingGroups<QaduRequestRow>> {
        let rows = db::list_pending_qadu(&self.pool, limit_pods, limit_per_pod, exclude_pods).await?;
        let mut groups = PendingGroups::new();
        for row in rows {
            groups
                .entry(row.pod.id)
                .or_insert_with(Vec::new)
                .push(row);
        }
        Ok(groups)
    }

    async fn remove_by_ids(&self, ids: &[i64]) -> anyhow::Result<()> {
        db::delete_qadu_by_ids(&self.pool, ids).await
    }

    async fn count_pending(&self) -> anyhow::Result<i64> {
        db::count_pending_qadu(&self.pool).await
    }

    async fn remove_all(&self) -> anyhow::Result<()> {
        db::remove_all_qadu(&self.pool).await
    }
}

/// Builds one batch per pod, merging every marker of the same video into a
/// single entry. Entries keep the order in which videos were first seen.
///
/// A marker with an unknown type is logged and contributes no data, but its
/// id is still retired with the batch so it cannot clog the queue.
pub fn build_request_objects(
    groups: PendingGroups<QaduRequestRow>,
) -> Vec<OutboundBatch<VideoStatSnapshot>> {
    let mut batches = Vec::with_capacity(groups.len());

    for (pod_id, rows) in groups {
        let Some(first) = rows.first() else {
            continue;
        };
        let mut batch = OutboundBatch::new(first.pod.clone(), QADU_ENDPOINT);
        let mut position: HashMap<String, usize> = HashMap::new();
        let mut videos: Vec<VideoStatSnapshot> = Vec::new();

        for QaduRequestRow { request, video, .. } in rows {
            batch.ids.push(request.id);

            let kind = match request.kind.parse::<QaduType>() {
                Ok(kind) => kind,
                Err(err) => {
                    error!(pod_id, request_id = request.id, %err, "skipping video QADU request");
                    continue;
                }
            };

            let idx = *position.entry(video.id.clone()).or_insert_with(|| {
                videos.push(VideoStatSnapshot {
                    remote_id: video.id.clone(),
                    ..Default::default()
                });
                videos.len() - 1
            });
            let snapshot = &mut videos[idx];
            match kind {
                QaduType::Likes => snapshot.likes = Some(video.likes),
                QaduType::Dislikes => snapshot.dislikes = Some(video.dislikes),
                QaduType::Views => snapshot.views = Some(video.views),
            }
        }

        batch.datas = videos.into_iter().map(|data| RequestData { data }).collect();
        batches.push(batch);
    }

    batches
}

/// Scheduler configuration for quick and dirty updates.
pub fn scheduler_config(
    pool: Pool,
    cfg: &Config,
) -> SchedulerConfig<QaduRequestRow, VideoStatSnapshot> {
    SchedulerConfig {
        description: "video QADU requests",
        limit_pods: cfg.requests.qadu.limit_pods,
        limit_per_pod: cfg.requests.qadu.limit_per_pod,
        request_model: Arc::new(SqliteQaduRequests::new(pool)),
        build_batches: Arc::new(build_request_objects),
        dispatch: DispatchSettings::from_config(&cfg.requests),
    }
}

pub fn new_scheduler(pool: Pool, cfg: &Config, transport: Arc<dyn PodTransport>) -> QaduScheduler {
    RequestScheduler::new(scheduler_config(pool, cfg), transport)
}

/// Enqueues one marker per known pod for a statistic change.
///
/// With `tx` the pod list is read and the markers are written inside the
/// caller's transaction, so they commit or roll back with the change itself.
/// Returns the number of markers written.
#[instrument(skip_all, fields(kind = %request.kind, video_id = %request.video_id))]
pub async fn create_request(
    pool: &Pool,
    request: &NewQaduRequest,
    tx: Option<&mut Transaction<'_, Sqlite>>,
) -> Result<u64, SchedulerError> {
    match tx {
        Some(tx) => create_request_tx(tx, request).await,
        None => {
            let mut tx = pool
                .begin()
                .await
                .map_err(|err| SchedulerError::Dependency(err.into()))?;
            let written = create_request_tx(&mut tx, request).await?;
            tx.commit()
                .await
                .map_err(|err| SchedulerError::Dependency(err.into()))?;
            Ok(written)
        }
    }
}

async fn create_request_tx(
    tx: &mut Transaction<'_, Sqlite>,
    request: &NewQaduRequest,
) -> Result<u64, SchedulerError> {
    let pod_ids = db::list_all_pod_ids(&mut **tx)
        .await
        .map_err(SchedulerError::Dependency)?;
    db::bulk_create_qadu_tx(tx, request.kind, &request.video_id, &pod_ids)
        .await
        .map_err(SchedulerError::Dependency)
}
