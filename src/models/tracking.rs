use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::partner::GeoPoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Started,
    InProgress,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RoutePoint {
    pub location: GeoPoint,
    pub recorded_at: DateTime<Utc>,
}

/// Live record of one partner's movement during one delivery, keyed by
/// (partner, order). Removed from the live map once completed or cancelled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingSession {
    pub partner_id: Uuid,
    pub order_id: Uuid,
    pub start_location: GeoPoint,
    pub current_location: GeoPoint,
    pub destination: GeoPoint,
    pub route: Vec<RoutePoint>,
    pub started_at: DateTime<Utc>,
    pub estimated_delivery_at: Option<DateTime<Utc>>,
    pub distance_traveled_km: f64,
    pub status: SessionStatus,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TrackingSession {
    pub fn is_active(&self) -> bool {
        matches!(self.status, SessionStatus::Started | SessionStatus::InProgress)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GeofenceKind {
    Pickup,
    Delivery,
    Campus,
    Restricted,
}

/// A named circular region; crossing into it emits a tracking event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Geofence {
    pub id: Uuid,
    pub name: String,
    pub center: GeoPoint,
    pub radius_m: f64,
    pub kind: GeofenceKind,
}

/// A single location ping from a partner, optionally tied to the delivery
/// the partner is currently working.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationUpdate {
    pub partner_id: Uuid,
    pub location: GeoPoint,
    pub order_id: Option<Uuid>,
}
