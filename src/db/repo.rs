use super::model::QaduRequestRow;
use crate::model::{PendingRequest, Pod, QaduType, VideoStats};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, QueryBuilder, Row, Transaction};
use sqlx::{Sqlite, SqlitePool};
use tracing::instrument;

pub type Pool = SqlitePool;

// Three binds per row keeps every insert far below SQLite's parameter cap.
const BULK_INSERT_CHUNK: usize = 300;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    // sqlx only creates missing database files when asked to.
    let mut rebuilt = format!("sqlite://{}", expanded_path);
    match query_part {
        Some(q) => {
            rebuilt.push('?');
            rebuilt.push_str(q);
        }
        None => rebuilt.push_str("?mode=rwc"),
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn add_pod(pool: &Pool, host: &str) -> Result<i64> {
    let rec = sqlx::query("INSERT INTO pods (host) VALUES (?) RETURNING id")
        .bind(host)
        .fetch_one(pool)
        .await
        .with_context(|| format!("failed to add pod {}", host))?;
    Ok(rec.get("id"))
}

/// Removing a pod drops its pending requests as well.
#[instrument(skip_all)]
pub async fn remove_pod(pool: &Pool, pod_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM pods WHERE id = ?")
        .bind(pod_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Lists every known pod id. Pass a pool, or `&mut **tx` to read inside a
/// caller transaction.
#[instrument(skip_all)]
pub async fn list_all_pod_ids<'e, E>(executor: E) -> Result<Vec<i64>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let ids = sqlx::query_scalar::<_, i64>("SELECT id FROM pods ORDER BY id ASC")
        .fetch_all(executor)
        .await
        .context("failed to list pods")?;
    Ok(ids)
}

#[instrument(skip_all)]
pub async fn insert_video(pool: &Pool, name: &str) -> Result<String> {
    let id = uuid::Uuid::new_v4().to_string();
    sqlx::query("INSERT INTO videos (id, name) VALUES (?, ?)")
        .bind(&id)
        .bind(name)
        .execute(pool)
        .await?;
    Ok(id)
}

/// Current counters of a video. Pass a pool, or `&mut **tx` to see the
/// caller transaction's own changes.
#[instrument(skip_all)]
pub async fn fetch_video_stats<'e, E>(executor: E, video_id: &str) -> Result<Option<VideoStats>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query("SELECT id, likes, dislikes, views FROM videos WHERE id = ?")
        .bind(video_id)
        .fetch_optional(executor)
        .await?;
    Ok(row.map(|row| VideoStats {
        id: row.get("id"),
        likes: row.get("likes"),
        dislikes: row.get("dislikes"),
        views: row.get("views"),
    }))
}

/// Adds the deltas to a video's counters. Returns false when the video does
/// not exist.
#[instrument(skip_all)]
pub async fn bump_video_counters_tx(
    tx: &mut Transaction<'_, Sqlite>,
    video_id: &str,
    likes: i64,
    dislikes: i64,
    views: i64,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE videos SET likes = likes + ?, dislikes = dislikes + ?, views = views + ? WHERE id = ?",
    )
    .bind(likes)
    .bind(dislikes)
    .bind(views)
    .bind(video_id)
    .execute(&mut **tx)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Inserts one QADU marker per pod id. Returns the number of rows written.
#[instrument(skip_all)]
pub async fn bulk_create_qadu_tx(
    tx: &mut Transaction<'_, Sqlite>,
    kind: QaduType,
    video_id: &str,
    pod_ids: &[i64],
) -> Result<u64> {
    let now = Utc::now();
    let mut written = 0;
    for chunk in pod_ids.chunks(BULK_INSERT_CHUNK) {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("INSERT INTO request_video_qadu (kind, video_id, pod_id, created_at) ");
        qb.push_values(chunk, |mut b, pod_id| {
            b.push_bind(kind.as_str())
                .push_bind(video_id)
                .push_bind(*pod_id)
                .push_bind(now);
        });
        written += qb.build().execute(&mut **tx).await?.rows_affected();
    }
    Ok(written)
}

/// Pending QADU rows for at most `limit_pods` pods and `limit_per_pod` rows
/// each, oldest first. Pods in `exclude_pods` are left out entirely.
#[instrument(skip_all)]
pub async fn list_pending_qadu(
    pool: &Pool,
    limit_pods: u32,
    limit_per_pod: u32,
    exclude_pods: &[i64],
) -> Result<Vec<QaduRequestRow>> {
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT pod_id FROM request_video_qadu");
    if !exclude_pods.is_empty() {
        qb.push(" WHERE pod_id NOT IN (");
        let mut ids = qb.separated(", ");
        for id in exclude_pods {
            ids.push_bind(*id);
        }
        ids.push_unseparated(")");
    }
    qb.push(" GROUP BY pod_id ORDER BY MIN(id) ASC LIMIT ");
    qb.push_bind(i64::from(limit_pods));
    let pod_ids: Vec<i64> = qb
        .build()
        .fetch_all(pool)
        .await
        .context("failed to list destination pods")?
        .iter()
        .map(|row| row.get(0))
        .collect();

    let mut out = Vec::new();
    for pod_id in pod_ids {
        let rows = sqlx::query(
            "SELECT r.id, r.kind, r.video_id, r.pod_id, r.created_at, \
                    v.likes, v.dislikes, v.views, p.host \
             FROM request_video_qadu r \
             JOIN videos v ON v.id = r.video_id \
             JOIN pods p ON p.id = r.pod_id \
             WHERE r.pod_id = ? \
             ORDER BY r.id ASC LIMIT ?",
        )
        .bind(pod_id)
        .bind(i64::from(limit_per_pod))
        .fetch_all(pool)
        .await
        .with_context(|| format!("failed to list pending requests of pod {}", pod_id))?;
        out.extend(rows.iter().map(qadu_row));
    }
    Ok(out)
}

fn qadu_row(row: &SqliteRow) -> QaduRequestRow {
    let video_id: String = row.get("video_id");
    let pod_id: i64 = row.get("pod_id");
    QaduRequestRow {
        request: PendingRequest {
            id: row.get("id"),
            kind: row.get("kind"),
            video_id: video_id.clone(),
            pod_id,
            created_at: row.get::<DateTime<Utc>, _>("created_at"),
        },
        video: VideoStats {
            id: video_id,
            likes: row.get("likes"),
            dislikes: row.get("dislikes"),
            views: row.get("views"),
        },
        pod: Pod {
            id: pod_id,
            host: row.get("host"),
        },
    }
}

/// Pending QADU rows of one pod, oldest first.
#[instrument(skip_all)]
pub async fn list_pending_qadu_for_pod(pool: &Pool, pod_id: i64) -> Result<Vec<PendingRequest>> {
    let rows = sqlx::query(
        "SELECT id, kind, video_id, pod_id, created_at FROM request_video_qadu WHERE pod_id = ? ORDER BY id ASC",
    )
    .bind(pod_id)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .iter()
        .map(|row| PendingRequest {
            id: row.get("id"),
            kind: row.get("kind"),
            video_id: row.get("video_id"),
            pod_id: row.get("pod_id"),
            created_at: row.get("created_at"),
        })
        .collect())
}

/// Deletes all ids in one transaction: either every row goes or none.
#[instrument(skip_all)]
pub async fn delete_qadu_by_ids(pool: &Pool, ids: &[i64]) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    let mut tx = pool.begin().await?;
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("DELETE FROM request_video_qadu WHERE id IN (");
    let mut sep = qb.separated(", ");
    for id in ids {
        sep.push_bind(*id);
    }
    sep.push_unseparated(")");
    qb.build().execute(&mut *tx).await?;
    tx.commit().await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn count_pending_qadu(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM request_video_qadu")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[instrument(skip_all)]
pub async fn remove_all_qadu(pool: &Pool) -> Result<()> {
    sqlx::query("DELETE FROM request_video_qadu")
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_pool() -> Pool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    async fn enqueue(pool: &Pool, kind: QaduType, video_id: &str, pod_ids: &[i64]) {
        let mut tx = pool.begin().await.unwrap();
        bulk_create_qadu_tx(&mut tx, kind, video_id, pod_ids)
            .await
            .unwrap();
        tx.commit().await.unwrap();
    }

    #[test]
    fn sqlite_url_normalization() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(
            prepare_sqlite_url("postgres://localhost/db"),
            "postgres://localhost/db"
        );
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("nested/scheduler.db");
        let url = prepare_sqlite_url(&format!("sqlite://{}", path.display()));
        assert_eq!(url, format!("sqlite://{}?mode=rwc", path.display()));
        assert!(path.parent().unwrap().exists());
    }

    #[tokio::test]
    async fn test_pod_directory() {
        let pool = setup_pool().await;
        assert!(list_all_pod_ids(&pool).await.unwrap().is_empty());

        let a = add_pod(&pool, "pod-a.example").await.unwrap();
        let b = add_pod(&pool, "pod-b.example").await.unwrap();
        assert_eq!(list_all_pod_ids(&pool).await.unwrap(), vec![a, b]);
        assert!(add_pod(&pool, "pod-a.example").await.is_err());

        let mut tx = pool.begin().await.unwrap();
        assert_eq!(list_all_pod_ids(&mut *tx).await.unwrap(), vec![a, b]);
        tx.commit().await.unwrap();

        remove_pod(&pool, a).await.unwrap();
        assert_eq!(list_all_pod_ids(&pool).await.unwrap(), vec![b]);
    }

    #[tokio::test]
    async fn test_list_pending_applies_limits_oldest_first() {
        let pool = setup_pool().await;
        let video = insert_video(&pool, "clip").await.unwrap();
        let a = add_pod(&pool, "pod-a.example").await.unwrap();
        let b = add_pod(&pool, "pod-b.example").await.unwrap();
        let c = add_pod(&pool, "pod-c.example").await.unwrap();

        // pod c gets the oldest row, then a, then b
        enqueue(&pool, QaduType::Views, &video, &[c]).await;
        enqueue(&pool, QaduType::Likes, &video, &[a]).await;
        enqueue(&pool, QaduType::Views, &video, &[a, b]).await;
        enqueue(&pool, QaduType::Dislikes, &video, &[a]).await;

        let rows = list_pending_qadu(&pool, 2, 2, &[]).await.unwrap();
        let pods: Vec<i64> = rows.iter().map(|r| r.pod.id).collect();
        assert_eq!(pods, vec![c, a, a]);
        let kinds: Vec<&str> = rows.iter().map(|r| r.request.kind.as_str()).collect();
        assert_eq!(kinds, vec!["views", "likes", "views"]);
        assert_eq!(rows[1].pod.host, "pod-a.example");
        assert_eq!(rows[1].video.id, video);

        let rows = list_pending_qadu(&pool, 10, 10, &[a, c]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].pod.id, b);
    }

    #[tokio::test]
    async fn test_delete_and_cascade() {
        let pool = setup_pool().await;
        let video = insert_video(&pool, "clip").await.unwrap();
        let a = add_pod(&pool, "pod-a.example").await.unwrap();
        let b = add_pod(&pool, "pod-b.example").await.unwrap();
        enqueue(&pool, QaduType::Views, &video, &[a, b]).await;
        enqueue(&pool, QaduType::Likes, &video, &[a, b]).await;
        assert_eq!(count_pending_qadu(&pool).await.unwrap(), 4);

        let ids: Vec<i64> = list_pending_qadu_for_pod(&pool, a)
            .await
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        delete_qadu_by_ids(&pool, &ids).await.unwrap();
        assert!(list_pending_qadu_for_pod(&pool, a).await.unwrap().is_empty());
        assert_eq!(list_pending_qadu_for_pod(&pool, b).await.unwrap().len(), 2);

        remove_pod(&pool, b).await.unwrap();
        assert_eq!(count_pending_qadu(&pool).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_bump_counters() {
        let pool = setup_pool().await;
        let video = insert_video(&pool, "clip").await.unwrap();
        let mut tx = pool.begin().await.unwrap();
        assert!(bump_video_counters_tx(&mut tx, &video, 1, 0, 3).await.unwrap());
        assert!(!bump_video_counters_tx(&mut tx, "missing", 1, 0, 0).await.unwrap());
        tx.commit().await.unwrap();

        let stats = fetch_video_stats(&pool, &video).await.unwrap().unwrap();
        assert_eq!((stats.likes, stats.dislikes, stats.views), (1, 0, 3));
    }
}
