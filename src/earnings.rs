//! Driver payout calculation.
//!
//! All amounts are integer pence. Rates come from a [`RateCard`]; the
//! configured `driver_rate_multiplier` scales the four base rates.

use serde::Serialize;
use tracing::debug;

use crate::geo;
use crate::model::{Drop, Route, ServiceTier, Urgency};

#[derive(Debug, Clone, PartialEq)]
pub struct RateCard {
    pub base_fare_pence: i64,
    pub per_drop_pence: i64,
    pub per_mile_pence: i64,
    pub per_minute_pence: i64,
    pub on_time_bonus_pence: i64,
    pub multi_drop_bonus_per_stop_pence: i64,
    pub multi_drop_min_bonus_pence: i64,
    pub multi_drop_threshold: u32,
    pub high_rating_bonus_pence: i64,
    pub long_distance_threshold_miles: f64,
    pub long_distance_bonus_per_mile_pence: i64,
    pub route_excellence_bonus_pence: i64,
    pub late_delivery_penalty_pence: i64,
    pub low_rating_penalty_pence: i64,
    /// Share of the customer payment a driver may earn on one job.
    pub max_share_of_booking: f64,
    pub min_earnings_per_job_pence: i64,
    pub default_helper_share: f64,
    pub high_rating_threshold: f64,
    pub low_rating_threshold: f64,
    pub approval_threshold_pence: i64,
    pub cap_loss_approval_pence: i64,
}

impl Default for RateCard {
    fn default() -> Self {
        Self {
            base_fare_pence: 2500,
            per_drop_pence: 1200,
            per_mile_pence: 55,
            per_minute_pence: 15,
            on_time_bonus_pence: 500,
            multi_drop_bonus_per_stop_pence: 1000,
            multi_drop_min_bonus_pence: 2000,
            multi_drop_threshold: 2,
            high_rating_bonus_pence: 800,
            long_distance_threshold_miles: 50.0,
            long_distance_bonus_per_mile_pence: 10,
            route_excellence_bonus_pence: 500,
            late_delivery_penalty_pence: 1000,
            low_rating_penalty_pence: 500,
            max_share_of_booking: 0.70,
            min_earnings_per_job_pence: 2000,
            default_helper_share: 0.20,
            high_rating_threshold: 4.5,
            low_rating_threshold: 3.0,
            approval_threshold_pence: 50_000,
            cap_loss_approval_pence: 5000,
        }
    }
}

impl RateCard {
    /// Default card with the four base rates scaled by `multiplier`.
    pub fn scaled(multiplier: f64) -> Self {
        let card = Self::default();
        let scale = |pence: i64| (pence as f64 * multiplier).round() as i64;
        Self {
            base_fare_pence: scale(card.base_fare_pence),
            per_drop_pence: scale(card.per_drop_pence),
            per_mile_pence: scale(card.per_mile_pence),
            per_minute_pence: scale(card.per_minute_pence),
            ..card
        }
    }

    pub fn urgency_multiplier(&self, urgency: Option<Urgency>) -> f64 {
        match urgency {
            Some(Urgency::Express) => 1.4,
            Some(Urgency::Premium) => 2.0,
            // urgent has no rate of its own
            Some(Urgency::Standard) | Some(Urgency::Urgent) | None => 1.0,
        }
    }

    pub fn service_multiplier(&self, tier: Option<ServiceTier>) -> f64 {
        match tier {
            Some(ServiceTier::Economy) => 0.85,
            Some(ServiceTier::Premium) => 1.5,
            Some(ServiceTier::Standard) | None => 1.0,
        }
    }

    /// Flat route bonus for more than `multi_drop_threshold` stops.
    pub fn multi_drop_bonus(&self, drop_count: u32) -> i64 {
        if drop_count <= self.multi_drop_threshold {
            return 0;
        }
        let extra = i64::from(drop_count - self.multi_drop_threshold);
        (extra * self.multi_drop_bonus_per_stop_pence).max(self.multi_drop_min_bonus_pence)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EarningsInput {
    pub distance_miles: f64,
    pub duration_min: i64,
    pub drop_count: u32,
    pub customer_payment_pence: i64,
    pub urgency: Option<Urgency>,
    pub service_tier: Option<ServiceTier>,
    /// `None` means unknown: neither the on-time bonus nor the late penalty.
    pub on_time: Option<bool>,
    pub customer_rating: Option<f64>,
    pub toll_pence: i64,
    pub parking_pence: i64,
    pub admin_bonus_pence: i64,
    pub admin_penalty_pence: i64,
    pub has_helper: bool,
    pub helper_share: Option<f64>,
}

/// Driver's running total for the current day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailyCap {
    pub cap_pence: i64,
    pub earned_today_pence: i64,
}

impl DailyCap {
    pub fn remaining(&self) -> i64 {
        (self.cap_pence - self.earned_today_pence).max(0)
    }

    /// Clamp `net` to what is left of the cap. Returns the clamped amount
    /// and whether clamping happened.
    pub fn apply(&self, net: i64) -> (i64, bool) {
        if self.earned_today_pence + net > self.cap_pence {
            (self.remaining(), true)
        } else {
            (net, false)
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct Bonuses {
    pub on_time: i64,
    pub multi_drop: i64,
    pub high_rating: i64,
    pub admin: i64,
    pub long_distance: i64,
    pub route_excellence: i64,
    pub total: i64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct Penalties {
    pub late_delivery: i64,
    pub low_rating: i64,
    pub admin: i64,
    pub total: i64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct Reimbursements {
    pub tolls: i64,
    pub parking: i64,
    pub total: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EarningsBreakdown {
    pub base_fare: i64,
    pub per_drop_fee: i64,
    pub mileage_fee: i64,
    pub time_fee: i64,
    pub urgency_multiplier: f64,
    pub service_multiplier: f64,
    pub performance_multiplier: f64,
    pub bonuses: Bonuses,
    pub penalties: Penalties,
    pub reimbursements: Reimbursements,
    pub subtotal: i64,
    pub gross: i64,
    pub helper_share: i64,
    /// Final payout after cap, floor and daily cap.
    pub net: i64,
    pub capped_net: i64,
    pub cap_applied: bool,
    pub floor_applied: bool,
    pub daily_cap_applied: bool,
    pub earnings_cap: i64,
    pub earnings_floor: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EarningsResult {
    pub breakdown: EarningsBreakdown,
    pub requires_admin_approval: bool,
    pub warnings: Vec<String>,
    pub recommendations: Vec<String>,
}

fn is_high_rating(card: &RateCard, rating: Option<f64>) -> bool {
    rating.is_some_and(|r| r >= card.high_rating_threshold)
}

fn bonuses(card: &RateCard, input: &EarningsInput) -> Bonuses {
    let high_rating = is_high_rating(card, input.customer_rating);
    let on_time = input.on_time == Some(true);
    let mut b = Bonuses {
        admin: input.admin_bonus_pence,
        multi_drop: card.multi_drop_bonus(input.drop_count),
        ..Bonuses::default()
    };
    if on_time {
        b.on_time = card.on_time_bonus_pence;
    }
    if high_rating {
        b.high_rating = card.high_rating_bonus_pence;
    }
    if input.distance_miles > card.long_distance_threshold_miles {
        let extra = input.distance_miles - card.long_distance_threshold_miles;
        b.long_distance = (extra * card.long_distance_bonus_per_mile_pence as f64).round() as i64;
    }
    if on_time && high_rating {
        b.route_excellence = card.route_excellence_bonus_pence;
    }
    b.total = b.on_time + b.multi_drop + b.high_rating + b.admin + b.long_distance + b.route_excellence;
    b
}

fn penalties(card: &RateCard, input: &EarningsInput) -> Penalties {
    let mut p = Penalties {
        admin: input.admin_penalty_pence,
        ..Penalties::default()
    };
    if input.on_time == Some(false) {
        p.late_delivery = card.late_delivery_penalty_pence;
    }
    if input.customer_rating.is_some_and(|r| r < card.low_rating_threshold) {
        p.low_rating = card.low_rating_penalty_pence;
    }
    p.total = p.late_delivery + p.low_rating + p.admin;
    p
}

fn input_warnings(input: &EarningsInput) -> Vec<String> {
    let mut warnings = Vec::new();
    if input.distance_miles <= 0.0 || input.distance_miles > 1000.0 {
        warnings.push(format!("Invalid distance: {} miles", input.distance_miles));
    }
    if input.duration_min <= 0 || input.duration_min > 780 {
        warnings.push(format!("Invalid duration: {} minutes", input.duration_min));
    }
    if input.drop_count == 0 || input.drop_count > 20 {
        warnings.push(format!("Invalid drop count: {}", input.drop_count));
    }
    if input.customer_payment_pence <= 0 {
        warnings.push(format!(
            "Invalid customer payment: {} pence",
            input.customer_payment_pence
        ));
    }
    warnings
}

pub fn format_gbp(pence: i64) -> String {
    let sign = if pence < 0 { "-" } else { "" };
    let abs = pence.abs();
    format!("{}£{}.{:02}", sign, abs / 100, abs % 100)
}

/// Payout breakdown for one job. `daily` clamps the result to the driver's
/// remaining daily allowance when given.
pub fn calculate(card: &RateCard, input: &EarningsInput, daily: Option<DailyCap>) -> EarningsResult {
    let mut warnings = input_warnings(input);
    let mut recommendations = Vec::new();

    let base_fare = card.base_fare_pence;
    let per_drop_fee = i64::from(input.drop_count) * card.per_drop_pence;
    let mileage_fee = (input.distance_miles * card.per_mile_pence as f64).round() as i64;
    let time_fee = input.duration_min * card.per_minute_pence;

    let urgency_multiplier = card.urgency_multiplier(input.urgency);
    let service_multiplier = card.service_multiplier(input.service_tier);
    let mut performance_multiplier = 1.0;
    if input.on_time == Some(true) {
        performance_multiplier += 0.05;
    }
    if is_high_rating(card, input.customer_rating) {
        performance_multiplier += 0.05;
    }

    let bonuses = bonuses(card, input);
    let penalties = penalties(card, input);
    let reimbursements = Reimbursements {
        tolls: input.toll_pence,
        parking: input.parking_pence,
        total: input.toll_pence + input.parking_pence,
    };

    let subtotal = ((base_fare + per_drop_fee + mileage_fee + time_fee) as f64
        * urgency_multiplier
        * service_multiplier
        * performance_multiplier)
        .round() as i64;
    let gross = subtotal + bonuses.total - penalties.total + reimbursements.total;

    let helper_pct = if input.has_helper {
        input.helper_share.unwrap_or(card.default_helper_share)
    } else {
        0.0
    };
    let helper_share = (gross as f64 * helper_pct).round() as i64;
    let uncapped = gross - helper_share;

    let earnings_cap = (input.customer_payment_pence as f64 * card.max_share_of_booking).round() as i64;
    let cap_applied = uncapped > earnings_cap;
    let capped_net = uncapped.min(earnings_cap);

    let earnings_floor = card.min_earnings_per_job_pence;
    let floor_applied = capped_net < earnings_floor;
    let mut net = if floor_applied {
        warnings.push(format!(
            "Earnings below minimum ({}), floor applied",
            format_gbp(earnings_floor)
        ));
        earnings_floor
    } else {
        capped_net
    };
    if cap_applied {
        warnings.push(format!(
            "Earnings capped at {:.0}% of booking value",
            card.max_share_of_booking * 100.0
        ));
    }

    let mut daily_cap_applied = false;
    if let Some(daily) = daily {
        let (clamped, hit) = daily.apply(net);
        if hit {
            warnings.push(format!(
                "Daily earnings cap ({}) reached. Current: {}, requested: {}, capped to: {}",
                format_gbp(daily.cap_pence),
                format_gbp(daily.earned_today_pence),
                format_gbp(net),
                format_gbp(clamped)
            ));
            if clamped == 0 {
                warnings.push("Driver has reached the daily cap; job requires admin approval".into());
            }
            net = clamped;
            daily_cap_applied = true;
        }
    }
    net = net.max(0);

    if input.distance_miles > 100.0 && !input.has_helper {
        recommendations.push("Consider adding a helper for long-distance routes".to_string());
    }
    if input.drop_count > 5 {
        recommendations
            .push("Route optimization can improve efficiency for multi-drop deliveries".to_string());
    }
    if net < 3000 {
        recommendations
            .push("Earnings are low, consider route optimization or pricing adjustment".to_string());
    }

    let requires_admin_approval = net > card.approval_threshold_pence
        || input.admin_bonus_pence != 0
        || input.admin_penalty_pence != 0
        || (cap_applied && gross - capped_net > card.cap_loss_approval_pence);

    debug!(net, gross, drops = input.drop_count, "driver earnings calculated");

    EarningsResult {
        breakdown: EarningsBreakdown {
            base_fare,
            per_drop_fee,
            mileage_fee,
            time_fee,
            urgency_multiplier,
            service_multiplier,
            performance_multiplier,
            bonuses,
            penalties,
            reimbursements,
            subtotal,
            gross,
            helper_share,
            net,
            capped_net,
            cap_applied,
            floor_applied,
            daily_cap_applied,
            earnings_cap,
            earnings_floor,
        },
        requires_admin_approval,
        warnings,
        recommendations,
    }
}

/// Estimated payout for a whole route, shown to a driver before accepting.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RouteEarnings {
    pub route_id: String,
    pub total_earnings_pence: i64,
    pub formatted_earnings: String,
    pub total_gross_pence: i64,
    pub route_bonus_pence: i64,
    pub total_distance_km: f64,
    pub total_distance_miles: f64,
    pub total_duration_min: i64,
    pub number_of_stops: usize,
    pub earnings_per_stop: f64,
    pub earnings_per_km: f64,
    pub earnings_per_hour: f64,
    pub requires_admin_approval: bool,
    pub breakdowns: Vec<EarningsBreakdown>,
}

/// One calculation per drop, each priced as part of a route of
/// `drops.len()` stops and assumed on time, plus the route multi-drop bonus.
pub fn route_earnings(card: &RateCard, route: &Route, drops: &[Drop]) -> RouteEarnings {
    let stops = u32::try_from(drops.len()).unwrap_or(u32::MAX);
    let mut total = 0;
    let mut gross = 0;
    let mut requires_admin_approval = false;
    let mut breakdowns = Vec::with_capacity(drops.len());

    for drop in drops {
        let result = calculate(
            card,
            &EarningsInput {
                distance_miles: drop.distance_miles,
                duration_min: drop.estimated_duration_min,
                drop_count: stops,
                customer_payment_pence: drop.value_pence,
                urgency: Some(drop.urgency),
                service_tier: Some(drop.service_tier),
                on_time: Some(true),
                ..EarningsInput::default()
            },
            None,
        );
        total += result.breakdown.capped_net;
        gross += result.breakdown.gross;
        requires_admin_approval |= result.requires_admin_approval;
        breakdowns.push(result.breakdown);
    }

    let route_bonus_pence = card.multi_drop_bonus(stops);
    total += route_bonus_pence;

    let distance_km = route.distance_km;
    let duration = route.estimated_duration_min;
    let per = |divisor: f64| if divisor > 0.0 { total as f64 / divisor } else { 0.0 };

    RouteEarnings {
        route_id: route.id.clone(),
        total_earnings_pence: total,
        formatted_earnings: format_gbp(total),
        total_gross_pence: gross,
        route_bonus_pence,
        total_distance_km: distance_km,
        total_distance_miles: geo::km_to_miles(distance_km),
        total_duration_min: duration,
        number_of_stops: drops.len(),
        earnings_per_stop: per(drops.len() as f64),
        earnings_per_km: per(distance_km),
        earnings_per_hour: per(duration as f64) * 60.0,
        requires_admin_approval: requires_admin_approval || total > card.approval_threshold_pence,
        breakdowns,
    }
}
