//! Ports onto the collaborators the core depends on but does not own:
//! the persistent order/partner store, the inventory reservation service,
//! the notification sink, and geocoding. All are object-safe async traits
//! injected at construction; `memory` provides in-process implementations.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::models::order::{Order, OrderStatus, PaymentStatus};
use crate::models::partner::{GeoPoint, Partner};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Audience {
    Customer,
    Partner,
    Admin,
}

/// Fire-and-forget event payload handed to the notification sink. The
/// delivery mechanism (push, socket, log) is the sink's business.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub audience: Audience,
    pub order_id: Uuid,
    pub partner_id: Option<Uuid>,
    pub message: String,
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn load_order(&self, order_id: Uuid) -> Result<Order, OrchestratorError>;

    async fn insert_order(&self, order: Order) -> Result<(), OrchestratorError>;

    /// Persists the new status and stamps the timestamp that corresponds to
    /// entering it.
    async fn update_status(
        &self,
        order_id: Uuid,
        status: OrderStatus,
        at: DateTime<Utc>,
    ) -> Result<(), OrchestratorError>;

    async fn set_payment_status(
        &self,
        order_id: Uuid,
        status: PaymentStatus,
        at: DateTime<Utc>,
    ) -> Result<(), OrchestratorError>;

    async fn set_assigned_partner(
        &self,
        order_id: Uuid,
        partner_id: Option<Uuid>,
    ) -> Result<(), OrchestratorError>;

    async fn set_delivery_location(
        &self,
        order_id: Uuid,
        location: GeoPoint,
    ) -> Result<(), OrchestratorError>;

    /// Orders in a non-terminal status, used to re-derive timers after a
    /// restart.
    async fn active_orders(&self) -> Result<Vec<Order>, OrchestratorError>;
}

#[async_trait]
pub trait PartnerDirectory: Send + Sync {
    async fn online_partners(&self) -> Result<Vec<Partner>, OrchestratorError>;

    async fn load_partner(&self, partner_id: Uuid) -> Result<Partner, OrchestratorError>;
}

#[async_trait]
pub trait InventoryService: Send + Sync {
    async fn reserve(&self, product_id: Uuid, quantity: u32) -> Result<(), OrchestratorError>;

    async fn release(&self, product_id: Uuid, quantity: u32) -> Result<(), OrchestratorError>;

    async fn confirm_sale(&self, product_id: Uuid, quantity: u32)
        -> Result<(), OrchestratorError>;
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<(), OrchestratorError>;
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, address: &str) -> Result<GeoPoint, OrchestratorError>;
}
