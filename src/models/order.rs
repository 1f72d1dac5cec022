use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::partner::GeoPoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    Placed,
    Confirmed,
    Preparing,
    Ready,
    Assigned,
    PickedUp,
    OutForDelivery,
    Delivered,
    Cancelled,
    Failed,
    Refunded,
}

impl OrderStatus {
    /// Terminal statuses admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Delivered
                | OrderStatus::Cancelled
                | OrderStatus::Failed
                | OrderStatus::Refunded
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderItem {
    pub product_id: Uuid,
    pub quantity: u32,
}

/// An order as the workflow engine sees it. The persistent store owns the
/// record; the core only mutates status, assignment, payment state, and the
/// per-status timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub assigned_partner_id: Option<Uuid>,
    pub items: Vec<OrderItem>,
    pub delivery_location: Option<GeoPoint>,
    pub placed_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub picked_up_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Order {
    pub fn new(id: Uuid, items: Vec<OrderItem>, delivery_location: Option<GeoPoint>) -> Self {
        Self {
            id,
            status: OrderStatus::Placed,
            payment_status: PaymentStatus::Pending,
            assigned_partner_id: None,
            items,
            delivery_location,
            placed_at: Utc::now(),
            paid_at: None,
            accepted_at: None,
            picked_up_at: None,
            delivered_at: None,
            cancelled_at: None,
        }
    }

    /// Sets the timestamp that corresponds to entering `status`. Each
    /// timestamp is written at most once; later writes keep the first value.
    pub fn stamp(&mut self, status: OrderStatus, at: DateTime<Utc>) {
        match status {
            OrderStatus::Confirmed => {
                self.accepted_at.get_or_insert(at);
            }
            OrderStatus::PickedUp => {
                self.picked_up_at.get_or_insert(at);
            }
            OrderStatus::Delivered => {
                self.delivered_at.get_or_insert(at);
            }
            OrderStatus::Cancelled => {
                self.cancelled_at.get_or_insert(at);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(OrderStatus::Delivered.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Failed.is_terminal());
        assert!(OrderStatus::Refunded.is_terminal());
        assert!(!OrderStatus::Placed.is_terminal());
        assert!(!OrderStatus::OutForDelivery.is_terminal());
    }

    #[test]
    fn stamp_writes_each_timestamp_once() {
        let mut order = Order::new(Uuid::new_v4(), Vec::new(), None);
        let first = Utc::now();
        order.stamp(OrderStatus::Delivered, first);
        order.stamp(OrderStatus::Delivered, first + chrono::Duration::minutes(5));
        assert_eq!(order.delivered_at, Some(first));
    }
}
