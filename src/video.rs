//! Local statistic changes that must reach the other pods.
use anyhow::anyhow;
use tracing::{info, instrument};

use crate::db::{self, Pool};
use crate::error::SchedulerError;
use crate::model::{QaduType, VideoStats};
use crate::qadu::{self, NewQaduRequest};

/// Counts one view and queues a views update, atomically. Returns the
/// counters as committed.
#[instrument(skip(pool))]
pub async fn record_view(pool: &Pool, video_id: &str) -> Result<VideoStats, SchedulerError> {
    apply_changes(pool, video_id, 0, 0, 1).await
}

/// Applies a rating change (e.g. like -> dislike is `(-1, 1)`) and queues an
/// update for each counter that moved.
#[instrument(skip(pool))]
pub async fn apply_rating_change(
    pool: &Pool,
    video_id: &str,
    likes_delta: i64,
    dislikes_delta: i64,
) -> Result<VideoStats, SchedulerError> {
    if likes_delta == 0 && dislikes_delta == 0 {
        return db::fetch_video_stats(pool, video_id)
            .await
            .map_err(SchedulerError::Dependency)?
            .ok_or_else(|| not_found(video_id));
    }
    apply_changes(pool, video_id, likes_delta, dislikes_delta, 0).await
}

async fn apply_changes(
    pool: &Pool,
    video_id: &str,
    likes: i64,
    dislikes: i64,
    views: i64,
) -> Result<VideoStats, SchedulerError> {
    let dependency = |err: sqlx::Error| SchedulerError::Dependency(err.into());

    let mut tx = pool.begin().await.map_err(dependency)?;
    let found = db::bump_video_counters_tx(&mut tx, video_id, likes, dislikes, views)
        .await
        .map_err(SchedulerError::Dependency)?;
    if !found {
        return Err(not_found(video_id));
    }

    let changed = [
        (QaduType::Likes, likes),
        (QaduType::Dislikes, dislikes),
        (QaduType::Views, views),
    ];
    let mut queued = 0;
    for (kind, delta) in changed {
        if delta == 0 {
            continue;
        }
        let request = NewQaduRequest {
            kind,
            video_id: video_id.to_string(),
        };
        queued += qadu::create_request(pool, &request, Some(&mut tx)).await?;
    }

    let stats = db::fetch_video_stats(&mut *tx, video_id)
        .await
        .map_err(SchedulerError::Dependency)?
        .ok_or_else(|| not_found(video_id))?;
    tx.commit().await.map_err(dependency)?;
    info!(
        video_id,
        queued,
        likes = stats.likes,
        dislikes = stats.dislikes,
        views = stats.views,
        "video statistics changed"
    );
    Ok(stats)
}

fn not_found(video_id: &str) -> SchedulerError {
    SchedulerError::Dependency(anyhow!("video {} not found", video_id))
}
