use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchStatus {
    Pending,
    Matched,
    Accepted,
    Expired,
}

/// One partner matched by a broadcast dispatch search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchedPartner {
    pub partner_id: Uuid,
    pub distance_km: f64,
    pub priority_class: bool,
    /// The search radius at which this partner was picked up.
    pub search_radius_km: f64,
}

/// A transient broadcast-matching record offering one order to several
/// partners at once. Lives only in dispatcher memory; the first successful
/// acceptance wins, and untouched dispatches expire on a timer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dispatch {
    pub order_id: Uuid,
    pub candidates: Vec<MatchedPartner>,
    pub status: DispatchStatus,
    pub accepted_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Dispatch {
    /// Still open for acceptance.
    pub fn is_open(&self) -> bool {
        matches!(self.status, DispatchStatus::Pending | DispatchStatus::Matched)
    }

    pub fn contains(&self, partner_id: Uuid) -> bool {
        self.candidates.iter().any(|c| c.partner_id == partner_id)
    }
}
