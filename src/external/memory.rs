//! In-memory collaborator implementations backed by the same concurrent
//! maps the rest of the core uses. The integration tests run against these,
//! and embedders can use them until a real store is wired in.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::external::{
    Audience, Geocoder, InventoryService, Notification, NotificationSink, OrderStore,
    PartnerDirectory,
};
use crate::models::order::{Order, OrderStatus, PaymentStatus};
use crate::models::partner::{GeoPoint, Partner};

#[derive(Default)]
pub struct InMemoryOrderStore {
    orders: DashMap<Uuid, Order>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn order_count(&self) -> usize {
        self.orders.len()
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn load_order(&self, order_id: Uuid) -> Result<Order, OrchestratorError> {
        self.orders
            .get(&order_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| OrchestratorError::NotFound(format!("order {order_id}")))
    }

    async fn insert_order(&self, order: Order) -> Result<(), OrchestratorError> {
        self.orders.insert(order.id, order);
        Ok(())
    }

    async fn update_status(
        &self,
        order_id: Uuid,
        status: OrderStatus,
        at: DateTime<Utc>,
    ) -> Result<(), OrchestratorError> {
        let mut order = self
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("order {order_id}")))?;

        order.status = status;
        order.stamp(status, at);
        Ok(())
    }

    async fn set_payment_status(
        &self,
        order_id: Uuid,
        status: PaymentStatus,
        at: DateTime<Utc>,
    ) -> Result<(), OrchestratorError> {
        let mut order = self
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("order {order_id}")))?;

        order.payment_status = status;
        if status == PaymentStatus::Completed {
            order.paid_at.get_or_insert(at);
        }
        Ok(())
    }

    async fn set_assigned_partner(
        &self,
        order_id: Uuid,
        partner_id: Option<Uuid>,
    ) -> Result<(), OrchestratorError> {
        let mut order = self
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("order {order_id}")))?;

        order.assigned_partner_id = partner_id;
        Ok(())
    }

    async fn set_delivery_location(
        &self,
        order_id: Uuid,
        location: GeoPoint,
    ) -> Result<(), OrchestratorError> {
        let mut order = self
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("order {order_id}")))?;

        order.delivery_location = Some(location);
        Ok(())
    }

    async fn active_orders(&self) -> Result<Vec<Order>, OrchestratorError> {
        Ok(self
            .orders
            .iter()
            .filter(|entry| !entry.status.is_terminal())
            .map(|entry| entry.value().clone())
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryPartnerDirectory {
    partners: DashMap<Uuid, Partner>,
}

impl InMemoryPartnerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, partner: Partner) {
        self.partners.insert(partner.id, partner);
    }

    pub fn set_online(&self, partner_id: Uuid, online: bool) {
        if let Some(mut partner) = self.partners.get_mut(&partner_id) {
            partner.online = online;
            partner.updated_at = Utc::now();
        }
    }
}

#[async_trait]
impl PartnerDirectory for InMemoryPartnerDirectory {
    async fn online_partners(&self) -> Result<Vec<Partner>, OrchestratorError> {
        Ok(self
            .partners
            .iter()
            .filter(|entry| entry.online)
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn load_partner(&self, partner_id: Uuid) -> Result<Partner, OrchestratorError> {
        self.partners
            .get(&partner_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| OrchestratorError::NotFound(format!("partner {partner_id}")))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StockLevel {
    pub on_hand: u32,
    pub reserved: u32,
    pub sold: u32,
}

#[derive(Default)]
pub struct InMemoryInventory {
    stock: DashMap<Uuid, StockLevel>,
}

impl InMemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_stock(&self, product_id: Uuid, on_hand: u32) {
        self.stock.insert(
            product_id,
            StockLevel {
                on_hand,
                ..StockLevel::default()
            },
        );
    }

    pub fn level(&self, product_id: Uuid) -> StockLevel {
        self.stock
            .get(&product_id)
            .map(|entry| *entry.value())
            .unwrap_or_default()
    }
}

#[async_trait]
impl InventoryService for InMemoryInventory {
    async fn reserve(&self, product_id: Uuid, quantity: u32) -> Result<(), OrchestratorError> {
        let mut level = self
            .stock
            .get_mut(&product_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("product {product_id}")))?;

        if level.on_hand < quantity {
            return Err(OrchestratorError::Store(format!(
                "insufficient stock for product {product_id}: {} on hand, {quantity} requested",
                level.on_hand
            )));
        }
        level.on_hand -= quantity;
        level.reserved += quantity;
        Ok(())
    }

    async fn release(&self, product_id: Uuid, quantity: u32) -> Result<(), OrchestratorError> {
        let mut level = self
            .stock
            .get_mut(&product_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("product {product_id}")))?;

        let released = quantity.min(level.reserved);
        level.reserved -= released;
        level.on_hand += released;
        Ok(())
    }

    async fn confirm_sale(
        &self,
        product_id: Uuid,
        quantity: u32,
    ) -> Result<(), OrchestratorError> {
        let mut level = self
            .stock
            .get_mut(&product_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("product {product_id}")))?;

        if level.reserved < quantity {
            return Err(OrchestratorError::Store(format!(
                "cannot confirm sale for product {product_id}: {} reserved, {quantity} requested",
                level.reserved
            )));
        }
        level.reserved -= quantity;
        level.sold += quantity;
        Ok(())
    }
}

/// Records everything it is asked to send; tests assert on the log.
#[derive(Default)]
pub struct RecordingNotificationSink {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().expect("notification log poisoned").clone()
    }

    pub fn sent_to(&self, audience: Audience) -> Vec<Notification> {
        self.sent()
            .into_iter()
            .filter(|n| n.audience == audience)
            .collect()
    }
}

#[async_trait]
impl NotificationSink for RecordingNotificationSink {
    async fn notify(&self, notification: Notification) -> Result<(), OrchestratorError> {
        self.sent
            .lock()
            .expect("notification log poisoned")
            .push(notification);
        Ok(())
    }
}

/// Geocoder over a fixed address table.
#[derive(Default)]
pub struct FixedGeocoder {
    table: HashMap<String, GeoPoint>,
}

impl FixedGeocoder {
    pub fn new(table: HashMap<String, GeoPoint>) -> Self {
        Self { table }
    }
}

#[async_trait]
impl Geocoder for FixedGeocoder {
    async fn geocode(&self, address: &str) -> Result<GeoPoint, OrchestratorError> {
        self.table
            .get(address)
            .copied()
            .ok_or_else(|| OrchestratorError::NotFound(format!("address {address:?}")))
    }
}
