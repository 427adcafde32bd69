//! Booking intake helpers: postcode normalisation, validation and the
//! conversion of a confirmed booking into a routable drop.

use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::db::NewBooking;
use crate::geo;
use crate::model::{Booking, Drop, DropStatus, GeoPoint, Location, TimeWindow};

pub const DEFAULT_WEIGHT_KG: f64 = 50.0;
pub const DEFAULT_VOLUME_M3: f64 = 1.0;
pub const DEFAULT_DURATION_MIN: i64 = 120;
pub const DEFAULT_WINDOW_HOURS: i64 = 4;

static UK_POSTCODE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Z]{1,2}[0-9][A-Z0-9]?)\s*([0-9][A-Z]{2})$").expect("valid postcode regex")
});

/// Upper-case a UK postcode and put a single space before the inward code.
/// Returns `None` when the input is not a postcode.
pub fn normalize_postcode(raw: &str) -> Option<String> {
    let upper = raw.trim().to_ascii_uppercase();
    let caps = UK_POSTCODE.captures(&upper)?;
    Some(format!("{} {}", &caps[1], &caps[2]))
}

/// Normalise and validate an incoming booking. Returns a message naming the
/// first offending field.
pub fn prepare(mut booking: NewBooking) -> Result<NewBooking, String> {
    if booking.reference.trim().is_empty() {
        return Err("reference must not be empty".into());
    }
    if booking.total_pence < 0 {
        return Err("total_pence must not be negative".into());
    }
    for (name, address) in [("pickup", &mut booking.pickup), ("dropoff", &mut booking.dropoff)] {
        address.postcode = normalize_postcode(&address.postcode)
            .ok_or_else(|| format!("{} postcode {:?} is not a UK postcode", name, address.postcode))?;
        if let Some((lat, lng)) = address.coordinates() {
            if !geo::is_valid(GeoPoint { lat, lng }) {
                return Err(format!("{} coordinates are out of range", name));
            }
        } else if address.lat.is_some() != address.lng.is_some() {
            return Err(format!("{} needs both lat and lng", name));
        }
    }
    if matches!(booking.estimated_duration_min, Some(d) if d <= 0) {
        return Err("estimated_duration_min must be positive".into());
    }
    Ok(booking)
}

/// Pending drop for a booking, or `None` when either address lacks
/// coordinates.
pub fn drop_from_booking(booking: &Booking, id: String) -> Option<Drop> {
    let (pickup_lat, pickup_lng) = booking.pickup.coordinates()?;
    let (delivery_lat, delivery_lng) = booking.dropoff.coordinates()?;
    let earliest: DateTime<Utc> = booking.scheduled_at;
    Some(Drop {
        id,
        booking_id: Some(booking.id.clone()),
        route_id: None,
        sequence: None,
        status: DropStatus::Pending,
        pickup: Location {
            point: GeoPoint { lat: pickup_lat, lng: pickup_lng },
            address: booking.pickup.label.clone(),
        },
        delivery: Location {
            point: GeoPoint { lat: delivery_lat, lng: delivery_lng },
            address: booking.dropoff.label.clone(),
        },
        window: TimeWindow {
            earliest,
            latest: earliest + Duration::hours(DEFAULT_WINDOW_HOURS),
        },
        weight_kg: booking.weight_kg.unwrap_or(DEFAULT_WEIGHT_KG),
        volume_m3: booking.volume_m3.unwrap_or(DEFAULT_VOLUME_M3),
        service_tier: booking.service_tier,
        priority: booking.urgency.drop_priority(),
        estimated_duration_min: booking.estimated_duration_min.unwrap_or(DEFAULT_DURATION_MIN),
        value_pence: booking.total_pence,
        distance_miles: booking.distance_miles,
        urgency: booking.urgency,
    })
}
