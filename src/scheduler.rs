use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::manager::{RouteManager, RoutingError};
use crate::model::RoutingSettings;

pub const SCHEDULER_ACTOR: &str = "scheduler";

/// Whether automatic passes are switched on. Shared by the loop and the
/// cron hook.
pub fn is_enabled(settings: &RoutingSettings) -> bool {
    settings.auto_routing_enabled
}

/// Whether an auto-routing pass is due at `now`. A pass in flight is caught
/// by the manager's run guard, not by the persisted status.
pub fn should_run(settings: &RoutingSettings, now: DateTime<Utc>) -> bool {
    if !is_enabled(settings) {
        return false;
    }
    match settings.last_auto_routing_run {
        None => true,
        Some(last) => now - last >= Duration::minutes(settings.auto_routing_interval_min),
    }
}

/// One scheduler tick. Returns true when a pass ran.
pub async fn tick(manager: &RouteManager) -> Result<bool, RoutingError> {
    let settings = manager.settings().await?;
    if !should_run(&settings, Utc::now()) {
        return Ok(false);
    }
    match manager.run_auto_routing(SCHEDULER_ACTOR, false).await {
        Ok(report) => {
            info!(
                routes = report.routes_created,
                bookings = report.bookings_processed,
                errors = report.errors.len(),
                "scheduled auto-routing finished"
            );
            Ok(true)
        }
        Err(RoutingError::AlreadyRunning) => {
            debug!("auto-routing already running; tick skipped");
            Ok(false)
        }
        Err(err) => Err(err),
    }
}

pub fn spawn(manager: Arc<RouteManager>, tick_every: std::time::Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick_every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if let Err(err) = tick(&manager).await {
                error!(?err, "scheduler tick failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AutoRoutingStatus, RoutingMode};

    fn auto_settings(now: DateTime<Utc>) -> RoutingSettings {
        RoutingSettings {
            routing_mode: RoutingMode::Auto,
            auto_routing_enabled: true,
            ..RoutingSettings::defaults(now)
        }
    }

    #[test]
    fn runs_when_never_run() {
        let now = Utc::now();
        assert!(should_run(&auto_settings(now), now));
    }

    #[test]
    fn waits_for_interval() {
        let now = Utc::now();
        let mut s = auto_settings(now);
        s.last_auto_routing_run = Some(now - Duration::minutes(10));
        assert!(!should_run(&s, now));
        s.last_auto_routing_run = Some(now - Duration::minutes(15));
        assert!(should_run(&s, now));
    }

    #[test]
    fn enabled_flag_gates_regardless_of_mode() {
        let now = Utc::now();
        let mut s = auto_settings(now);
        s.auto_routing_enabled = false;
        assert!(!should_run(&s, now));

        let mut s = auto_settings(now);
        s.routing_mode = RoutingMode::Manual;
        assert!(should_run(&s, now));
    }

    #[test]
    fn stale_running_status_does_not_block() {
        let now = Utc::now();
        let mut s = auto_settings(now);
        s.auto_routing_status = AutoRoutingStatus::Running;
        s.last_auto_routing_run = Some(now - Duration::hours(2));
        assert!(should_run(&s, now));
    }
}
