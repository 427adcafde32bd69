use anyhow::{anyhow, Result};
use chrono::{Duration, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::Mutex;

use speedy_routing::config;
use speedy_routing::db::{self, NewBooking, NewDriver};
use speedy_routing::manager::{ManualRouteInput, RouteManager, RoutingError, SettingsPatch};
use speedy_routing::model::{
    ActorType, Address, AutoRoutingStatus, BookingStatus, Driver, DriverAvailability, DropStatus, RouteStatus,
    RoutingMode, ServiceTier, Urgency,
};
use speedy_routing::notify::{DriverNotifier, RouteAssignedNotice};
use speedy_routing::outbox::process_next_task;
use speedy_routing::scheduler;

const ADMIN: &str = "admin_1";

async fn setup_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

async fn setup() -> (SqlitePool, RouteManager) {
    let pool = setup_pool().await;
    let manager = RouteManager::with_limits(
        pool.clone(),
        config::Orchestration::default(),
        config::Earnings::default(),
    );
    (pool, manager)
}

fn booking(reference: &str, offset: f64) -> NewBooking {
    NewBooking {
        reference: reference.into(),
        status: BookingStatus::Confirmed,
        scheduled_at: Utc::now() + Duration::hours(2),
        pickup: Address {
            label: format!("{} pickup", reference),
            postcode: "g1 1aa".into(),
            lat: Some(55.860 + offset),
            lng: Some(-4.250 - offset),
        },
        dropoff: Address {
            label: format!("{} dropoff", reference),
            postcode: "G2 2BB".into(),
            lat: Some(55.870 + offset),
            lng: Some(-4.270 - offset),
        },
        total_pence: 12_000,
        urgency: Urgency::Standard,
        estimated_duration_min: None,
        distance_miles: 4.0,
        weight_kg: None,
        volume_m3: None,
        service_tier: ServiceTier::Standard,
    }
}

fn london_booking(reference: &str, offset: f64) -> NewBooking {
    let mut b = booking(reference, offset);
    b.pickup.postcode = "SW1A 1AA".into();
    b.pickup.lat = Some(51.500 + offset);
    b.pickup.lng = Some(-0.140 - offset);
    b.dropoff.postcode = "SE1 7PB".into();
    b.dropoff.lat = Some(51.505 + offset);
    b.dropoff.lng = Some(-0.110 - offset);
    b
}

async fn online_driver(manager: &RouteManager, name: &str) -> Driver {
    manager
        .create_driver(
            NewDriver {
                name: name.into(),
                email: Some(format!("{}@example.com", name.to_lowercase())),
                phone: None,
                availability: DriverAvailability::Online,
            },
            ADMIN,
        )
        .await
        .unwrap()
}

async fn two_bookings(manager: &RouteManager) -> Vec<String> {
    let mut ids = Vec::new();
    for (i, reference) in ["SV-1001", "SV-1002"].iter().enumerate() {
        let b = manager
            .create_booking(booking(reference, i as f64 * 0.01), ADMIN)
            .await
            .unwrap();
        ids.push(b.id);
    }
    ids
}

fn manual(booking_ids: Vec<String>, driver_id: Option<String>, skip_approval: bool) -> ManualRouteInput {
    ManualRouteInput {
        booking_ids,
        driver_id,
        start_time: Utc::now() + Duration::hours(2),
        admin_id: ADMIN.into(),
        skip_approval,
        ..ManualRouteInput::default()
    }
}

#[derive(Clone, Default)]
struct RecordingNotifier {
    notices: Arc<Mutex<Vec<RouteAssignedNotice>>>,
    fail: bool,
}

#[async_trait::async_trait]
impl DriverNotifier for RecordingNotifier {
    async fn route_assigned(&self, notice: &RouteAssignedNotice) -> Result<()> {
        if self.fail {
            return Err(anyhow!("webhook down"));
        }
        self.notices.lock().await.push(notice.clone());
        Ok(())
    }
}

async fn outbox_len(pool: &SqlitePool) -> i64 {
    let mut conn = pool.acquire().await.unwrap();
    db::count_outbox(&mut conn).await.unwrap()
}

#[tokio::test]
async fn manual_route_waits_for_approval_then_notifies_driver() {
    let (pool, manager) = setup().await;
    let bookings = two_bookings(&manager).await;
    let driver = online_driver(&manager, "Sam").await;

    let outcome = manager
        .create_manual_route(&manual(bookings.clone(), Some(driver.id.clone()), false))
        .await
        .unwrap();
    assert!(outcome.requires_approval);
    assert_eq!(outcome.route.status, RouteStatus::Pending);
    assert_eq!(outcome.route.total_drops, 2);
    assert_eq!(outcome.route.total_value_pence, 24_000);
    let approval = outcome.approval.expect("approval record");
    assert!(!approval.auto_generated);
    assert_eq!(approval.preview["stops"].as_array().unwrap().len(), 4);
    assert!(outcome.assignment.is_none());

    // Pending routes stay invisible to drivers and queue nothing.
    assert!(manager.driver_routes(&driver.id).await.unwrap().is_empty());
    assert_eq!(outbox_len(&pool).await, 0);
    assert_eq!(manager.pending_approvals().await.unwrap().len(), 1);

    let route = manager.approve_route(&outcome.route.id, ADMIN, None).await.unwrap();
    assert_eq!(route.status, RouteStatus::Assigned);
    assert_eq!(route.driver_id.as_deref(), Some(driver.id.as_str()));
    assert!(manager.pending_approvals().await.unwrap().is_empty());
    assert_eq!(manager.driver_routes(&driver.id).await.unwrap().len(), 1);

    let again = manager.approve_route(&outcome.route.id, ADMIN, None).await;
    assert!(matches!(again, Err(RoutingError::Conflict(_))));

    let notifier = RecordingNotifier::default();
    assert!(process_next_task(&pool, &notifier, 300).await.unwrap());
    let notices = notifier.notices.lock().await.clone();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].route_id, route.id);
    assert_eq!(notices[0].driver_name, "Sam");
    assert_eq!(notices[0].total_drops, 2);
    assert_eq!(outbox_len(&pool).await, 0);
    assert!(!process_next_task(&pool, &notifier, 300).await.unwrap());
}

#[tokio::test]
async fn failed_notification_is_retried_later() {
    let (pool, manager) = setup().await;
    let bookings = two_bookings(&manager).await;
    let driver = online_driver(&manager, "Sam").await;
    manager
        .create_manual_route(&manual(bookings, Some(driver.id), true))
        .await
        .unwrap();

    let failing = RecordingNotifier {
        fail: true,
        ..RecordingNotifier::default()
    };
    assert!(process_next_task(&pool, &failing, 300).await.unwrap());
    assert_eq!(outbox_len(&pool).await, 1);
    // Backed off: nothing due right now.
    assert!(!process_next_task(&pool, &failing, 300).await.unwrap());
}

#[tokio::test]
async fn unavailable_bookings_conflict() {
    let (_pool, manager) = setup().await;
    let bookings = two_bookings(&manager).await;
    manager
        .create_manual_route(&manual(bookings.clone(), None, true))
        .await
        .unwrap();

    let err = manager
        .create_manual_route(&manual(vec![bookings[0].clone()], None, true))
        .await
        .unwrap_err();
    match err {
        RoutingError::Conflict(msg) => assert!(msg.contains(&bookings[0])),
        other => panic!("expected conflict, got {:?}", other),
    }

    let err = manager
        .create_manual_route(&manual(vec!["bk_missing".into()], None, true))
        .await
        .unwrap_err();
    assert!(matches!(err, RoutingError::NotFound(_)));

    let err = manager
        .create_manual_route(&ManualRouteInput {
            admin_id: ADMIN.into(),
            ..ManualRouteInput::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, RoutingError::Invalid(_)));
}

#[tokio::test]
async fn rejected_route_releases_its_bookings() {
    let (pool, manager) = setup().await;
    let bookings = two_bookings(&manager).await;
    let outcome = manager
        .create_manual_route(&manual(bookings.clone(), None, false))
        .await
        .unwrap();

    let err = manager.reject_route(&outcome.route.id, ADMIN, "  ").await.unwrap_err();
    assert!(matches!(err, RoutingError::Invalid(_)));

    let route = manager
        .reject_route(&outcome.route.id, ADMIN, "too far apart")
        .await
        .unwrap();
    assert_eq!(route.status, RouteStatus::Cancelled);

    let detail = manager.route_detail(&route.id).await.unwrap();
    assert!(detail.drops.is_empty());
    let approval = detail.approval.unwrap();
    assert_eq!(approval.rejection_reason.as_deref(), Some("too far apart"));

    {
        let mut conn = pool.acquire().await.unwrap();
        let released = db::get_bookings(&mut conn, &bookings[..1]).await.unwrap();
        assert!(released[0].route_id.is_none());
    }

    // The same bookings can be routed again, reusing their drops.
    let retry = manager
        .create_manual_route(&manual(bookings, None, true))
        .await
        .unwrap();
    assert_eq!(retry.route.status, RouteStatus::Planned);
    assert_eq!(manager.route_detail(&retry.route.id).await.unwrap().drops.len(), 2);
}

#[tokio::test]
async fn driver_runs_route_to_completion() {
    let (pool, manager) = setup().await;
    let bookings = two_bookings(&manager).await;
    let driver = online_driver(&manager, "Sam").await;
    let other = online_driver(&manager, "Alex").await;

    let outcome = manager
        .create_manual_route(&manual(bookings.clone(), Some(driver.id.clone()), true))
        .await
        .unwrap();
    assert!(!outcome.requires_approval);
    assert_eq!(outcome.route.status, RouteStatus::Assigned);
    assert!(outcome.assignment.is_some());
    let route_id = outcome.route.id;

    let err = manager.start_route(&route_id, &other.id).await.unwrap_err();
    assert!(matches!(err, RoutingError::NotFound(_)));

    let drops = manager.route_detail(&route_id).await.unwrap().drops;
    let early = manager.complete_drop(&route_id, &drops[0].id, &driver.id).await;
    assert!(matches!(early, Err(RoutingError::Conflict(_))));

    let route = manager.start_route(&route_id, &driver.id).await.unwrap();
    assert_eq!(route.status, RouteStatus::InProgress);

    let first = manager.complete_drop(&route_id, &drops[0].id, &driver.id).await.unwrap();
    assert!(!first.route_completed);
    assert_eq!(first.route.completed_drops, 1);
    assert!(first.earnings.is_none());

    let repeat = manager.complete_drop(&route_id, &drops[0].id, &driver.id).await;
    assert!(matches!(repeat, Err(RoutingError::Conflict(_))));
    let unknown = manager.complete_drop(&route_id, "drp_unknown", &driver.id).await;
    assert!(matches!(unknown, Err(RoutingError::NotFound(_))));

    let last = manager.complete_drop(&route_id, &drops[1].id, &driver.id).await.unwrap();
    assert!(last.route_completed);
    assert_eq!(last.route.status, RouteStatus::Completed);
    let earnings = last.earnings.expect("route earnings");
    assert!(earnings.total_earnings_pence > 0);
    assert_eq!(earnings.number_of_stops, 2);

    let mut conn = pool.acquire().await.unwrap();
    let completed = db::get_bookings(&mut conn, &bookings).await.unwrap();
    assert_eq!(completed.len(), 2);
    assert!(completed.iter().all(|b| b.status == BookingStatus::Completed));
    let delivered = db::drops_for_route(&mut conn, &route_id).await.unwrap();
    assert!(delivered.iter().all(|d| d.status == DropStatus::Delivered));
    let earned = db::earned_on_day(&mut conn, &driver.id, Utc::now()).await.unwrap();
    assert_eq!(earned, earnings.total_earnings_pence.min(50_000));
}

#[tokio::test]
async fn declined_route_returns_to_planning_and_drops_notification() {
    let (pool, manager) = setup().await;
    let bookings = two_bookings(&manager).await;
    let driver = online_driver(&manager, "Sam").await;
    let other = online_driver(&manager, "Alex").await;
    let outcome = manager
        .create_manual_route(&manual(bookings, Some(driver.id.clone()), true))
        .await
        .unwrap();

    let err = manager.decline_route(&outcome.route.id, &other.id).await.unwrap_err();
    assert!(matches!(err, RoutingError::NotFound(_)));

    let route = manager.decline_route(&outcome.route.id, &driver.id).await.unwrap();
    assert_eq!(route.status, RouteStatus::Planned);
    assert!(route.driver_id.is_none());

    let notifier = RecordingNotifier::default();
    assert!(process_next_task(&pool, &notifier, 300).await.unwrap());
    assert!(notifier.notices.lock().await.is_empty());

    // Reassign to the other driver.
    let route = manager.assign_driver(&route.id, &other.id, ADMIN).await.unwrap();
    assert_eq!(route.status, RouteStatus::Assigned);
    assert_eq!(route.driver_id.as_deref(), Some(other.id.as_str()));
    let detail = manager.route_detail(&route.id).await.unwrap();
    assert_eq!(detail.assignments.len(), 2);

    manager
        .set_driver_availability(&driver.id, DriverAvailability::Offline, ADMIN, ActorType::Admin)
        .await
        .unwrap();
    let err = manager.assign_driver(&route.id, &driver.id, ADMIN).await.unwrap_err();
    assert!(matches!(err, RoutingError::Invalid(_)));
}

#[tokio::test]
async fn auto_routing_respects_mode_and_batches_bookings() {
    let (_pool, manager) = setup().await;
    for i in 0..3 {
        manager
            .create_booking(booking(&format!("SV-20{}", i), i as f64 * 0.005), ADMIN)
            .await
            .unwrap();
    }

    let report = manager.run_auto_routing("cron", false).await.unwrap();
    assert!(!report.success);
    assert_eq!(report.errors, vec!["auto-routing is disabled".to_string()]);

    let settings = manager.set_routing_mode(RoutingMode::Auto, ADMIN).await.unwrap();
    assert!(settings.auto_routing_enabled);

    let report = manager.run_auto_routing("cron", false).await.unwrap();
    assert!(report.success, "errors: {:?}", report.errors);
    assert_eq!(report.bookings_processed, 3);
    assert_eq!(report.drops_created, 3);
    assert_eq!(report.routes_created, 1);
    assert_eq!(report.routes_awaiting_approval, 1);
    assert!(report.unassigned_drop_ids.is_empty());

    let pending = manager.pending_approvals().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert!(pending[0].approval.auto_generated);
    assert_eq!(pending[0].route.total_drops, 3);

    let settings = manager.settings().await.unwrap();
    assert_eq!(settings.auto_routing_status, AutoRoutingStatus::Idle);
    assert!(settings.last_auto_routing_run.is_some());

    // Everything is routed now.
    let report = manager.run_auto_routing("cron", false).await.unwrap();
    assert!(!report.success);
    assert!(report.errors[0].starts_with("not enough bookings"));

    let history = manager.auto_routing_history(10).await.unwrap();
    assert!(history.iter().any(|e| e.event_type == "auto_routing_completed"));
    assert!(history.iter().any(|e| e.event_type == "auto_routing_started"));
}

#[tokio::test]
async fn auto_routing_assigns_drivers_without_approval() {
    let (pool, manager) = setup().await;
    for i in 0..2 {
        manager
            .create_booking(booking(&format!("SV-30{}", i), i as f64 * 0.005), ADMIN)
            .await
            .unwrap();
    }
    let driver = online_driver(&manager, "Sam").await;
    manager
        .update_settings(
            &SettingsPatch {
                require_admin_approval: Some(false),
                auto_assign_drivers: Some(true),
                ..SettingsPatch::default()
            },
            ADMIN,
        )
        .await
        .unwrap();

    let report = manager.run_auto_routing(ADMIN, true).await.unwrap();
    assert_eq!(report.routes_created, 1);
    assert_eq!(report.routes_assigned, 1);
    assert_eq!(report.routes_awaiting_approval, 0);

    let routes = manager.driver_routes(&driver.id).await.unwrap();
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].status, RouteStatus::Assigned);
    assert_eq!(outbox_len(&pool).await, 1);
}

#[tokio::test]
async fn preview_persists_nothing() {
    let (_pool, manager) = setup().await;
    let bookings = two_bookings(&manager).await;

    let preview = manager.preview_route(&bookings).await.unwrap();
    assert_eq!(preview.total_drops, 2);
    assert_eq!(preview.stops.len(), 4);
    assert!(preview.unrouted_booking_ids.is_empty());
    assert!(preview.stops.windows(2).all(|w| w[0].estimated_time <= w[1].estimated_time));
    assert!(manager.list_routes(None, 50).await.unwrap().is_empty());

    let err = manager.preview_route(&["bk_missing".to_string()]).await.unwrap_err();
    assert!(matches!(err, RoutingError::NotFound(_)));
    let err = manager.preview_route(&bookings[..1]).await.unwrap_err();
    assert!(matches!(err, RoutingError::Invalid(_)));
}

#[tokio::test]
async fn booking_intake_validates_and_rejects_duplicates() {
    let (_pool, manager) = setup().await;
    let created = manager.create_booking(booking("SV-1", 0.0), ADMIN).await.unwrap();
    assert_eq!(created.pickup.postcode, "G1 1AA");

    let dup = manager.create_booking(booking("SV-1", 0.0), ADMIN).await.unwrap_err();
    assert!(matches!(dup, RoutingError::Conflict(_)));

    let mut bad = booking("SV-2", 0.0);
    bad.dropoff.postcode = "nowhere".into();
    let err = manager.create_booking(bad, ADMIN).await.unwrap_err();
    assert!(matches!(err, RoutingError::Invalid(_)));
}

#[tokio::test]
async fn settings_updates_are_validated() {
    let (_pool, manager) = setup().await;
    let err = manager
        .update_settings(
            &SettingsPatch {
                min_drops_for_auto_route: Some(0),
                ..SettingsPatch::default()
            },
            ADMIN,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RoutingError::Invalid(_)));

    let updated = manager
        .update_settings(
            &SettingsPatch {
                auto_routing_interval_min: Some(30),
                ..SettingsPatch::default()
            },
            ADMIN,
        )
        .await
        .unwrap();
    assert_eq!(updated.auto_routing_interval_min, 30);
    assert_eq!(updated.updated_by, ADMIN);
    assert_eq!(manager.settings().await.unwrap().auto_routing_interval_min, 30);
}

#[tokio::test]
async fn auto_assign_proposes_each_driver_once() {
    let (_pool, manager) = setup().await;
    for i in 0..2 {
        let offset = i as f64 * 0.005;
        manager.create_booking(booking(&format!("SV-40{}", i), offset), ADMIN).await.unwrap();
        manager.create_booking(london_booking(&format!("SV-41{}", i), offset), ADMIN).await.unwrap();
    }
    let driver = online_driver(&manager, "Sam").await;
    manager
        .update_settings(
            &SettingsPatch {
                auto_assign_drivers: Some(true),
                ..SettingsPatch::default()
            },
            ADMIN,
        )
        .await
        .unwrap();

    let report = manager.run_auto_routing(ADMIN, true).await.unwrap();
    assert_eq!(report.routes_created, 2, "errors: {:?}", report.errors);
    assert_eq!(report.routes_awaiting_approval, 2);

    let pending = manager.pending_approvals().await.unwrap();
    let proposed: Vec<_> = pending.iter().filter_map(|p| p.route.driver_id.clone()).collect();
    assert_eq!(proposed, vec![driver.id.clone()]);

    let mut statuses = Vec::new();
    for p in &pending {
        let route = manager.approve_route(&p.route.id, ADMIN, None).await.unwrap();
        statuses.push(route.status);
    }
    statuses.sort_by_key(|s| s.as_str());
    assert_eq!(statuses, vec![RouteStatus::Assigned, RouteStatus::Planned]);

    let routes = manager.driver_routes(&driver.id).await.unwrap();
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].status, RouteStatus::Assigned);
}

#[tokio::test]
async fn approval_skips_proposed_driver_already_on_a_route() {
    let (_pool, manager) = setup().await;
    let mut ids = Vec::new();
    for i in 0..4 {
        let b = manager
            .create_booking(booking(&format!("SV-50{}", i), i as f64 * 0.01), ADMIN)
            .await
            .unwrap();
        ids.push(b.id);
    }
    let driver = online_driver(&manager, "Sam").await;

    let first = manager
        .create_manual_route(&manual(ids[..2].to_vec(), Some(driver.id.clone()), false))
        .await
        .unwrap();
    let second = manager
        .create_manual_route(&manual(ids[2..].to_vec(), Some(driver.id.clone()), false))
        .await
        .unwrap();
    assert_eq!(second.route.status, RouteStatus::Pending);
    assert_eq!(second.route.driver_id.as_deref(), Some(driver.id.as_str()));

    let route = manager.approve_route(&first.route.id, ADMIN, None).await.unwrap();
    assert_eq!(route.status, RouteStatus::Assigned);

    let route = manager.approve_route(&second.route.id, ADMIN, None).await.unwrap();
    assert_eq!(route.status, RouteStatus::Planned);
    assert!(route.driver_id.is_none());
    let detail = manager.route_detail(&second.route.id).await.unwrap();
    assert!(detail.assignments.is_empty());
    assert_eq!(manager.driver_routes(&driver.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn stale_running_status_does_not_stall_scheduler() {
    let (pool, manager) = setup().await;
    two_bookings(&manager).await;
    manager.set_routing_mode(RoutingMode::Auto, ADMIN).await.unwrap();
    {
        let mut conn = pool.acquire().await.unwrap();
        db::set_auto_routing_status(&mut conn, AutoRoutingStatus::Running, None, None)
            .await
            .unwrap();
    }

    assert!(scheduler::tick(&manager).await.unwrap());
    let settings = manager.settings().await.unwrap();
    assert_eq!(settings.auto_routing_status, AutoRoutingStatus::Idle);

    {
        let mut conn = pool.acquire().await.unwrap();
        db::set_auto_routing_status(&mut conn, AutoRoutingStatus::Running, None, None)
            .await
            .unwrap();
    }
    assert!(manager.recover_interrupted_run().await.unwrap());
    assert!(!manager.recover_interrupted_run().await.unwrap());
    let settings = manager.settings().await.unwrap();
    assert_eq!(settings.auto_routing_status, AutoRoutingStatus::Idle);
    let history = manager.auto_routing_history(10).await.unwrap();
    assert!(history.iter().any(|e| e.event_type == "auto_routing_recovered"));
}

#[tokio::test]
async fn scheduler_follows_enabled_flag_in_manual_mode() {
    let (_pool, manager) = setup().await;
    two_bookings(&manager).await;
    assert!(!scheduler::tick(&manager).await.unwrap());

    let settings = manager
        .update_settings(
            &SettingsPatch {
                auto_routing_enabled: Some(true),
                ..SettingsPatch::default()
            },
            ADMIN,
        )
        .await
        .unwrap();
    assert_eq!(settings.routing_mode, RoutingMode::Manual);
    assert!(scheduler::tick(&manager).await.unwrap());
    assert_eq!(manager.pending_approvals().await.unwrap().len(), 1);
}

#[tokio::test]
async fn concurrent_auto_routing_runs_once() {
    let (_pool, manager) = setup().await;
    two_bookings(&manager).await;

    let (a, b) = tokio::join!(
        manager.run_auto_routing("cron", true),
        manager.run_auto_routing("cron", true)
    );
    let (ok, busy): (Vec<_>, Vec<_>) = [a, b].into_iter().partition(|r| r.is_ok());
    assert_eq!(ok.len(), 1);
    assert!(matches!(busy[0], Err(RoutingError::AlreadyRunning)));
    assert_eq!(manager.list_routes(None, 50).await.unwrap().len(), 1);

    // The guard is released once the pass returns.
    let again = manager.run_auto_routing("cron", true).await.unwrap();
    assert_eq!(again.bookings_processed, 0);
}
