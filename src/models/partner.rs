use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum VehicleKind {
    Walking,
    Bicycle,
    Scooter,
}

impl VehicleKind {
    pub fn average_speed_kmh(&self) -> f64 {
        match self {
            VehicleKind::Walking => 5.0,
            VehicleKind::Bicycle => 12.0,
            VehicleKind::Scooter => 25.0,
        }
    }
}

/// A delivery partner as seen through the partner directory. Priority-class
/// partners (campus students) get first look in broadcast dispatch and are
/// subject to the daily delivery cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Partner {
    pub id: Uuid,
    pub name: String,
    pub online: bool,
    pub active: bool,
    pub rating: f64,
    pub total_deliveries: u32,
    pub priority_class: bool,
    pub vehicle: VehicleKind,
    pub location: Option<GeoPoint>,
    pub updated_at: DateTime<Utc>,
}
