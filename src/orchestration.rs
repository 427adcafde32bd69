//! Multi-drop route orchestration engine.
//!
//! Groups pending drops into route proposals: greedy geographic clustering
//! around a seed drop, time-window splitting, capacity and quality checks.
//! The engine is pure; persisting proposals is the route manager's job.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, instrument};

use crate::config;
use crate::geo;
use crate::model::{Drop, GeoPoint, RoutingSettings, ServiceTier};

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Fixed clustering radius. `None` picks one from the drop volume.
    pub cluster_radius_miles: Option<f64>,
    /// Upper bound applied to whichever radius is used.
    pub radius_cap_km: Option<f64>,
    pub min_drops_per_cluster: usize,
    pub max_drops_per_cluster: usize,
    pub max_route_weight_kg: f64,
    pub max_route_volume_m3: f64,
    pub max_route_duration_min: i64,
    pub max_time_window_spread_min: i64,
    pub buffer_min_per_drop: i64,
    pub allow_mixed_tiers: bool,
    pub priority_weighting: f64,
    pub max_driving_distance_km: f64,
    pub min_route_value_pence: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cluster_radius_miles: None,
            radius_cap_km: None,
            min_drops_per_cluster: 2,
            max_drops_per_cluster: 8,
            max_route_weight_kg: 500.0,
            max_route_volume_m3: 10.0,
            max_route_duration_min: 480,
            max_time_window_spread_min: 240,
            buffer_min_per_drop: 15,
            allow_mixed_tiers: false,
            priority_weighting: 0.3,
            max_driving_distance_km: 200.0,
            min_route_value_pence: 10_000,
        }
    }
}

impl EngineConfig {
    /// Combine admin-editable settings with the static engine limits.
    pub fn from_settings(settings: &RoutingSettings, limits: &config::Orchestration) -> Self {
        let defaults = Self::default();
        let max_drops = usize::try_from(settings.max_drops_per_route.max(1)).unwrap_or(1);
        Self {
            radius_cap_km: Some(settings.max_route_distance_km),
            max_drops_per_cluster: max_drops,
            max_route_weight_kg: limits.max_route_weight_kg,
            max_route_volume_m3: limits.max_route_volume_m3,
            max_route_duration_min: limits.max_route_duration_min,
            max_driving_distance_km: limits.max_driving_distance_km,
            min_route_value_pence: limits.min_route_value_pence,
            ..defaults
        }
    }

    /// Radius used for a batch of `drop_count` drops: busier periods get
    /// tighter clusters.
    pub fn effective_radius_miles(&self, drop_count: usize) -> f64 {
        let radius = self
            .cluster_radius_miles
            .unwrap_or_else(|| smart_radius_miles(drop_count));
        match self.radius_cap_km {
            Some(cap_km) => radius.min(geo::km_to_miles(cap_km)),
            None => radius,
        }
    }
}

pub fn smart_radius_miles(drop_count: usize) -> f64 {
    match drop_count {
        n if n > 50 => 25.0,
        n if n > 20 => 50.0,
        n if n > 10 => 75.0,
        n if n > 5 => 100.0,
        _ => 125.0,
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Geofence {
    pub center: GeoPoint,
    pub radius_km: f64,
}

#[derive(Debug, Clone, Default)]
pub struct OrchestrateOptions {
    /// Skips the minimum route value check.
    pub emergency_mode: bool,
    pub preferred_start_time: Option<DateTime<Utc>>,
    pub geofences: Vec<Geofence>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteProposal {
    pub drops: Vec<Drop>,
    pub service_tier: ServiceTier,
    pub estimated_duration_min: i64,
    pub total_distance_km: f64,
    pub total_value_pence: i64,
    pub total_weight_kg: f64,
    pub total_volume_m3: f64,
    pub priority: f64,
    pub proposed_start_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct RouteMetrics {
    pub total_routes: usize,
    pub total_drops: usize,
    pub assigned_drops: usize,
    pub unassigned_drops: usize,
    pub assignment_rate: f64,
    pub average_drops_per_route: f64,
    pub total_value_pence: i64,
    pub average_value_per_route: f64,
    pub total_estimated_duration_min: i64,
    pub average_duration_per_route: f64,
    pub efficiency_score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Orchestration {
    pub routes: Vec<RouteProposal>,
    pub unassigned: Vec<Drop>,
    pub warnings: Vec<String>,
    pub metrics: RouteMetrics,
}

#[derive(Debug, Default, Clone, Copy)]
struct Load {
    drops: usize,
    weight_kg: f64,
    volume_m3: f64,
    duration_min: i64,
}

impl Load {
    fn with(self, drop: &Drop, buffer_min: i64) -> Self {
        Self {
            drops: self.drops + 1,
            weight_kg: self.weight_kg + drop.weight_kg,
            volume_m3: self.volume_m3 + drop.volume_m3,
            duration_min: self.duration_min + drop.estimated_duration_min + buffer_min,
        }
    }

    fn fits(&self, cfg: &EngineConfig) -> bool {
        self.drops <= cfg.max_drops_per_cluster
            && self.weight_kg <= cfg.max_route_weight_kg
            && self.volume_m3 <= cfg.max_route_volume_m3
            && self.duration_min <= cfg.max_route_duration_min
    }
}

/// Build route proposals from `drops`.
#[instrument(skip_all, fields(drops = drops.len()))]
pub fn orchestrate(drops: &[Drop], cfg: &EngineConfig, options: &OrchestrateOptions) -> Orchestration {
    let radius_miles = cfg.effective_radius_miles(drops.len());
    debug!(radius_miles, "clustering radius");

    let mut candidates: Vec<Drop> = drops.iter().filter(|d| is_routable(d, cfg)).cloned().collect();
    candidates.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.window.earliest.cmp(&b.window.earliest))
    });

    let clusters = cluster(candidates, radius_miles, cfg, &options.geofences);
    let clusters: Vec<Vec<Drop>> = clusters
        .into_iter()
        .flat_map(|c| split_by_time_windows(c, cfg))
        .filter(|c| within_capacity(c, cfg))
        .collect();

    let routes: Vec<RouteProposal> = clusters
        .into_iter()
        .map(|c| propose(c, cfg, options))
        .filter(|r| passes_quality(r, cfg, options.emergency_mode))
        .collect();

    let assigned: HashSet<&str> = routes
        .iter()
        .flat_map(|r| r.drops.iter().map(|d| d.id.as_str()))
        .collect();
    let unassigned: Vec<Drop> = drops
        .iter()
        .filter(|d| !assigned.contains(d.id.as_str()))
        .cloned()
        .collect();

    let metrics = route_metrics(&routes, drops.len());
    let warnings = gather_warnings(&routes, &metrics, cfg);
    debug!(routes = routes.len(), unassigned = unassigned.len(), "orchestration complete");

    Orchestration {
        routes,
        unassigned,
        warnings,
        metrics,
    }
}

fn is_routable(drop: &Drop, cfg: &EngineConfig) -> bool {
    if drop.weight_kg <= 0.0 || drop.volume_m3 <= 0.0 || drop.estimated_duration_min <= 0 {
        return false;
    }
    if !geo::is_valid(drop.pickup.point) || !geo::is_valid(drop.delivery.point) {
        return false;
    }
    let span = drop.window.span_minutes();
    span >= 0 && span <= cfg.max_time_window_spread_min
}

fn cluster(mut remaining: Vec<Drop>, radius_miles: f64, cfg: &EngineConfig, fences: &[Geofence]) -> Vec<Vec<Drop>> {
    let spread = Duration::minutes(cfg.max_time_window_spread_min);
    let mut clusters = Vec::new();

    while !remaining.is_empty() {
        let seed = remaining.remove(0);
        let mut load = Load::default().with(&seed, cfg.buffer_min_per_drop);
        let mut members = vec![seed];

        let mut i = 0;
        while i < remaining.len() {
            let seed = &members[0];
            let drop = &remaining[i];
            let next = load.with(drop, cfg.buffer_min_per_drop);
            let close = geo::haversine_miles(seed.pickup.point, drop.pickup.point) <= radius_miles;
            let same_tier = cfg.allow_mixed_tiers || drop.service_tier == seed.service_tier;
            let in_time = (drop.window.earliest - seed.window.earliest).abs() <= spread;
            let fenced = fences.is_empty() || within_geofence(drop, fences);

            if close && same_tier && in_time && fenced && next.fits(cfg) {
                load = next;
                members.push(remaining.remove(i));
            } else {
                i += 1;
            }
        }

        if members.len() >= cfg.min_drops_per_cluster {
            clusters.push(members);
        }
    }

    clusters
}

fn within_geofence(drop: &Drop, fences: &[Geofence]) -> bool {
    fences
        .iter()
        .any(|f| geo::haversine_km(f.center, drop.pickup.point) <= f.radius_km)
}

/// Order by earliest window and break the cluster wherever a drop starts
/// more than the allowed spread after the current fragment's first drop.
fn split_by_time_windows(mut cluster: Vec<Drop>, cfg: &EngineConfig) -> Vec<Vec<Drop>> {
    cluster.sort_by_key(|d| d.window.earliest);
    let spread = Duration::minutes(cfg.max_time_window_spread_min);

    let mut fragments = Vec::new();
    let mut current: Vec<Drop> = Vec::new();
    for drop in cluster {
        match current.first() {
            Some(first) if drop.window.earliest - first.window.earliest > spread => {
                let done = std::mem::replace(&mut current, vec![drop]);
                if done.len() >= cfg.min_drops_per_cluster {
                    fragments.push(done);
                }
            }
            _ => current.push(drop),
        }
    }
    if current.len() >= cfg.min_drops_per_cluster {
        fragments.push(current);
    }
    fragments
}

fn within_capacity(cluster: &[Drop], cfg: &EngineConfig) -> bool {
    cluster
        .iter()
        .fold(Load::default(), |load, d| load.with(d, cfg.buffer_min_per_drop))
        .fits(cfg)
}

fn propose(drops: Vec<Drop>, cfg: &EngineConfig, options: &OrchestrateOptions) -> RouteProposal {
    let total_value_pence = drops.iter().map(|d| d.value_pence).sum();
    let proposed_start_time = options
        .preferred_start_time
        .or_else(|| drops.first().map(|d| d.window.earliest))
        .unwrap_or_else(Utc::now);
    RouteProposal {
        service_tier: majority_tier(&drops),
        estimated_duration_min: route_duration_min(&drops, cfg.buffer_min_per_drop),
        total_distance_km: route_distance_km(&drops),
        total_value_pence,
        total_weight_kg: drops.iter().map(|d| d.weight_kg).sum(),
        total_volume_m3: drops.iter().map(|d| d.volume_m3).sum(),
        priority: route_priority(&drops, cfg.priority_weighting),
        proposed_start_time,
        drops,
    }
}

fn passes_quality(route: &RouteProposal, cfg: &EngineConfig, emergency_mode: bool) -> bool {
    if !emergency_mode && route.total_value_pence < cfg.min_route_value_pence {
        debug!(value = route.total_value_pence, "route below minimum value");
        return false;
    }
    if !cfg.allow_mixed_tiers {
        let first = route.drops.first().map(|d| d.service_tier);
        if route.drops.iter().any(|d| Some(d.service_tier) != first) {
            debug!("route has mixed service tiers");
            return false;
        }
    }
    if route.total_distance_km > cfg.max_driving_distance_km {
        debug!(distance_km = route.total_distance_km, "route exceeds driving distance");
        return false;
    }
    true
}

/// Premium or standard when more than half of the drops are, else economy.
pub fn majority_tier(drops: &[Drop]) -> ServiceTier {
    let half = drops.len() as f64 / 2.0;
    let count = |tier| drops.iter().filter(|d| d.service_tier == tier).count() as f64;
    if count(ServiceTier::Premium) > half {
        ServiceTier::Premium
    } else if count(ServiceTier::Standard) > half {
        ServiceTier::Standard
    } else {
        ServiceTier::Economy
    }
}

pub fn route_duration_min(drops: &[Drop], buffer_min_per_drop: i64) -> i64 {
    drops
        .iter()
        .map(|d| d.estimated_duration_min + buffer_min_per_drop)
        .sum()
}

/// Loaded legs (pickup to delivery) plus repositioning legs (delivery to the
/// next pickup), in route order.
pub fn route_distance_km(drops: &[Drop]) -> f64 {
    let loaded: f64 = drops
        .iter()
        .map(|d| geo::haversine_km(d.pickup.point, d.delivery.point))
        .sum();
    let repositioning: f64 = drops
        .windows(2)
        .map(|w| geo::haversine_km(w[0].delivery.point, w[1].pickup.point))
        .sum();
    loaded + repositioning
}

fn route_priority(drops: &[Drop], weighting: f64) -> f64 {
    if drops.is_empty() {
        return 0.0;
    }
    let average = drops.iter().map(|d| f64::from(d.priority)).sum::<f64>() / drops.len() as f64;
    let value: i64 = drops.iter().map(|d| d.value_pence).sum();
    let value_weight = (value as f64 / 100_000.0).min(1.0);
    average * (1.0 - weighting) + value_weight * 10.0 * weighting
}

fn route_metrics(routes: &[RouteProposal], total_drops: usize) -> RouteMetrics {
    let assigned_drops: usize = routes.iter().map(|r| r.drops.len()).sum();
    let total_value_pence: i64 = routes.iter().map(|r| r.total_value_pence).sum();
    let total_duration: i64 = routes.iter().map(|r| r.estimated_duration_min).sum();
    let per_route = |x: f64| if routes.is_empty() { 0.0 } else { x / routes.len() as f64 };
    let assignment_rate = if total_drops == 0 {
        0.0
    } else {
        assigned_drops as f64 / total_drops as f64
    };

    RouteMetrics {
        total_routes: routes.len(),
        total_drops,
        assigned_drops,
        unassigned_drops: total_drops - assigned_drops,
        assignment_rate,
        average_drops_per_route: per_route(assigned_drops as f64),
        total_value_pence,
        average_value_per_route: per_route(total_value_pence as f64),
        total_estimated_duration_min: total_duration,
        average_duration_per_route: per_route(total_duration as f64),
        efficiency_score: efficiency_score(routes, assignment_rate),
    }
}

/// 0..=100 blend of assignment rate, value per drop and value per minute.
fn efficiency_score(routes: &[RouteProposal], assignment_rate: f64) -> f64 {
    if routes.is_empty() {
        return assignment_rate * 40.0;
    }
    let n = routes.len() as f64;
    let avg_value_per_drop_gbp = routes
        .iter()
        .map(|r| r.total_value_pence as f64 / 100.0 / r.drops.len().max(1) as f64)
        .sum::<f64>()
        / n;
    let avg_gbp_per_minute = routes
        .iter()
        .map(|r| r.total_value_pence as f64 / 100.0 / r.estimated_duration_min.max(1) as f64)
        .sum::<f64>()
        / n;
    (assignment_rate * 0.4
        + (avg_value_per_drop_gbp / 100.0).min(1.0) * 0.3
        + (avg_gbp_per_minute / 10.0).min(1.0) * 0.3)
        * 100.0
}

fn gather_warnings(routes: &[RouteProposal], metrics: &RouteMetrics, cfg: &EngineConfig) -> Vec<String> {
    let mut warnings = Vec::new();
    if metrics.total_drops == 0 {
        return warnings;
    }
    if routes.is_empty() {
        warnings.push("No viable routes could be formed".to_string());
        return warnings;
    }
    if metrics.assignment_rate < 0.9 {
        warnings.push(format!(
            "Low assignment rate: {:.1}%",
            metrics.assignment_rate * 100.0
        ));
    }
    if metrics.average_drops_per_route < cfg.min_drops_per_cluster as f64 {
        warnings.push(format!(
            "Low drops per route: {:.1} average",
            metrics.average_drops_per_route
        ));
    }
    if metrics.efficiency_score < 70.0 {
        warnings.push(format!("Low efficiency score: {:.1}", metrics.efficiency_score));
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DropStatus, Location, TimeWindow, Urgency};
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, hour, 0, 0).unwrap()
    }

    fn drop(id: &str, lat: f64, lng: f64, hour: u32) -> Drop {
        Drop {
            id: id.to_string(),
            booking_id: None,
            route_id: None,
            sequence: None,
            status: DropStatus::Pending,
            pickup: Location {
                point: GeoPoint { lat, lng },
                address: format!("{} pickup", id),
            },
            delivery: Location {
                point: GeoPoint { lat: lat + 0.02, lng: lng + 0.02 },
                address: format!("{} delivery", id),
            },
            window: TimeWindow {
                earliest: at(hour),
                latest: at(hour) + Duration::hours(4),
            },
            weight_kg: 50.0,
            volume_m3: 1.0,
            service_tier: ServiceTier::Standard,
            priority: 5,
            estimated_duration_min: 60,
            value_pence: 8_000,
            distance_miles: 2.0,
            urgency: Urgency::Standard,
        }
    }

    #[test]
    fn smart_radius_tightens_with_volume() {
        assert_eq!(smart_radius_miles(3), 125.0);
        assert_eq!(smart_radius_miles(6), 100.0);
        assert_eq!(smart_radius_miles(11), 75.0);
        assert_eq!(smart_radius_miles(21), 50.0);
        assert_eq!(smart_radius_miles(51), 25.0);
    }

    #[test]
    fn radius_is_capped_by_settings_distance() {
        let cfg = EngineConfig {
            radius_cap_km: Some(16.0934),
            ..EngineConfig::default()
        };
        assert!((cfg.effective_radius_miles(3) - 10.0).abs() < 1e-6);
    }

    #[test]
    fn nearby_drops_form_one_route() {
        let drops = vec![
            drop("a", 55.86, -4.25, 9),
            drop("b", 55.87, -4.26, 10),
            drop("c", 55.85, -4.24, 11),
        ];
        let result = orchestrate(&drops, &EngineConfig::default(), &OrchestrateOptions::default());
        assert_eq!(result.routes.len(), 1);
        assert!(result.unassigned.is_empty());
        let ids: Vec<&str> = result.routes[0].drops.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(result.routes[0].total_value_pence, 24_000);
        assert_eq!(result.routes[0].estimated_duration_min, 3 * (60 + 15));
        assert_eq!(result.routes[0].proposed_start_time, at(9));
        assert_eq!(result.metrics.assignment_rate, 1.0);
    }

    #[test]
    fn distant_drop_is_left_unassigned() {
        let cfg = EngineConfig {
            cluster_radius_miles: Some(20.0),
            ..EngineConfig::default()
        };
        let drops = vec![
            drop("a", 55.86, -4.25, 9),
            drop("b", 55.87, -4.26, 10),
            // London
            drop("far", 51.50, -0.12, 9),
        ];
        let result = orchestrate(&drops, &cfg, &OrchestrateOptions::default());
        assert_eq!(result.routes.len(), 1);
        assert_eq!(result.unassigned.len(), 1);
        assert_eq!(result.unassigned[0].id, "far");
        assert!(result.warnings.iter().any(|w| w.contains("assignment rate")));
    }

    #[test]
    fn capacity_limits_split_the_batch() {
        let cfg = EngineConfig {
            max_route_duration_min: 160,
            ..EngineConfig::default()
        };
        let drops: Vec<Drop> = (0..4)
            .map(|i| drop(&format!("d{}", i), 55.86, -4.25, 9))
            .collect();
        let result = orchestrate(&drops, &cfg, &OrchestrateOptions::default());
        // 75 minutes per drop including buffer: two per route
        assert_eq!(result.routes.len(), 2);
        assert!(result.routes.iter().all(|r| r.drops.len() == 2));
        assert!(result.routes.iter().all(|r| r.estimated_duration_min <= 160));
    }

    #[test]
    fn low_value_routes_need_emergency_mode() {
        let mut drops = vec![drop("a", 55.86, -4.25, 9), drop("b", 55.86, -4.25, 9)];
        for d in &mut drops {
            d.value_pence = 1_000;
        }
        let cfg = EngineConfig::default();
        let normal = orchestrate(&drops, &cfg, &OrchestrateOptions::default());
        assert!(normal.routes.is_empty());
        assert_eq!(normal.unassigned.len(), 2);

        let emergency = orchestrate(
            &drops,
            &cfg,
            &OrchestrateOptions {
                emergency_mode: true,
                ..OrchestrateOptions::default()
            },
        );
        assert_eq!(emergency.routes.len(), 1);
    }

    #[test]
    fn tiers_are_not_mixed() {
        let mut premium = drop("p", 55.86, -4.25, 9);
        premium.service_tier = ServiceTier::Premium;
        let drops = vec![drop("a", 55.86, -4.25, 9), premium, drop("b", 55.86, -4.25, 9)];
        let result = orchestrate(&drops, &EngineConfig::default(), &OrchestrateOptions::default());
        assert_eq!(result.routes.len(), 1);
        assert_eq!(result.unassigned.len(), 1);
        assert_eq!(result.unassigned[0].id, "p");
    }

    #[test]
    fn windows_far_apart_do_not_share_a_route() {
        let drops = vec![
            drop("morning", 55.86, -4.25, 6),
            drop("morning2", 55.86, -4.25, 7),
            drop("evening", 55.86, -4.25, 17),
        ];
        let result = orchestrate(&drops, &EngineConfig::default(), &OrchestrateOptions::default());
        assert_eq!(result.routes.len(), 1);
        assert_eq!(result.unassigned[0].id, "evening");
    }

    #[test]
    fn invalid_drops_are_rejected() {
        let mut heavy = drop("zero", 55.86, -4.25, 9);
        heavy.weight_kg = 0.0;
        let mut wide = drop("wide", 55.86, -4.25, 9);
        wide.window.latest = wide.window.earliest + Duration::hours(10);
        let drops = vec![heavy, wide, drop("a", 55.86, -4.25, 9)];
        let result = orchestrate(&drops, &EngineConfig::default(), &OrchestrateOptions::default());
        assert!(result.routes.is_empty());
        assert_eq!(result.unassigned.len(), 3);
        assert_eq!(result.warnings, vec!["No viable routes could be formed".to_string()]);
    }

    #[test]
    fn geofence_excludes_outside_pickups() {
        let fence = Geofence {
            center: GeoPoint { lat: 55.86, lng: -4.25 },
            radius_km: 5.0,
        };
        let drops = vec![
            drop("a", 55.86, -4.25, 9),
            drop("b", 55.861, -4.251, 9),
            drop("outside", 55.95, -3.19, 9),
        ];
        let options = OrchestrateOptions {
            geofences: vec![fence],
            ..OrchestrateOptions::default()
        };
        let result = orchestrate(&drops, &EngineConfig::default(), &options);
        assert_eq!(result.routes.len(), 1);
        assert_eq!(result.routes[0].drops.len(), 2);
    }

    #[test]
    fn majority_tier_falls_back_to_economy() {
        let mut a = drop("a", 0.0, 0.0, 9);
        a.service_tier = ServiceTier::Premium;
        let b = drop("b", 0.0, 0.0, 9);
        assert_eq!(majority_tier(&[a.clone(), b.clone()]), ServiceTier::Economy);
        assert_eq!(majority_tier(&[a.clone(), a, b]), ServiceTier::Premium);
    }

    #[test]
    fn distance_counts_loaded_and_repositioning_legs() {
        let a = drop("a", 55.86, -4.25, 9);
        let b = drop("b", 55.90, -4.30, 9);
        let expected = geo::haversine_km(a.pickup.point, a.delivery.point)
            + geo::haversine_km(a.delivery.point, b.pickup.point)
            + geo::haversine_km(b.pickup.point, b.delivery.point);
        assert!((route_distance_km(&[a, b]) - expected).abs() < 1e-9);
    }
}
