use crate::db;
use crate::model::{OutboxKind, OutboxTask, RouteStatus};
use crate::notify::{DriverNotifier, RouteAssignedNotice};
use anyhow::Result;
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

/// Build the notice for a task, or `None` when the route no longer belongs to
/// that driver (declined, reassigned or cancelled since it was queued).
async fn build_notice(pool: &SqlitePool, task: &OutboxTask) -> Result<Option<RouteAssignedNotice>> {
    let mut conn = pool.acquire().await?;
    let Some(route) = db::get_route(&mut conn, &task.route_id).await? else {
        return Ok(None);
    };
    let still_assigned = route.driver_id.as_deref() == Some(task.driver_id.as_str())
        && matches!(route.status, RouteStatus::Assigned | RouteStatus::InProgress);
    if !still_assigned {
        return Ok(None);
    }
    let Some(driver) = db::get_driver(&mut conn, &task.driver_id).await? else {
        return Ok(None);
    };
    Ok(Some(RouteAssignedNotice {
        event: task.kind.as_str(),
        message: format!(
            "New route assigned: {} stops starting {}",
            route.total_drops,
            route.start_time.format("%Y-%m-%d %H:%M UTC")
        ),
        route_id: route.id,
        driver_id: driver.id,
        driver_name: driver.name,
        driver_email: driver.email,
        driver_phone: driver.phone,
        start_time: route.start_time,
        total_drops: route.total_drops,
        estimated_duration_min: route.estimated_duration_min,
        distance_km: route.distance_km,
    }))
}

/// Deliver the oldest due task. Returns false when nothing was due.
#[instrument(skip_all)]
pub async fn process_next_task(
    pool: &SqlitePool,
    notifier: &dyn DriverNotifier,
    max_backoff_secs: i64,
) -> Result<bool> {
    let task = {
        let mut conn = pool.acquire().await?;
        db::next_due_outbox(&mut conn, Utc::now()).await?
    };
    let Some(task) = task else {
        return Ok(false);
    };

    let res = match task.kind {
        OutboxKind::RouteAssigned => match build_notice(pool, &task).await {
            Ok(Some(notice)) => notifier.route_assigned(&notice).await,
            Ok(None) => {
                info!(id = task.id, route_id = %task.route_id, "route no longer assigned; dropping notification");
                Ok(())
            }
            Err(err) => Err(err),
        },
    };

    let mut conn = pool.acquire().await?;
    match res {
        Ok(()) => {
            db::delete_outbox(&mut conn, task.id).await?;
            info!(id = task.id, kind = %task.kind, route_id = %task.route_id, "outbox task succeeded");
        }
        Err(err) => {
            warn!(
                ?err,
                id = task.id,
                route_id = %task.route_id,
                attempt = task.attempt,
                "outbox task failed; backoff"
            );
            db::backoff_outbox_with_cap(&mut conn, task.id, task.attempt, max_backoff_secs, Utc::now())
                .await?;
        }
    }
    Ok(true)
}

/// Run the outbox worker until the runtime shuts down.
pub fn spawn_worker(
    pool: SqlitePool,
    notifier: Arc<dyn DriverNotifier>,
    poll_sleep: Duration,
    max_backoff_secs: i64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match process_next_task(&pool, notifier.as_ref(), max_backoff_secs).await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(poll_sleep).await,
                Err(err) => {
                    error!(?err, "outbox worker error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    })
}
