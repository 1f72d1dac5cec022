//! Binds the workflow engine to the persistent store, inventory, and
//! notifications, and exposes the orchestration API the surrounding
//! service consumes. Side effects run after the transition has committed;
//! their failures are surfaced but never roll the transition back.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::dispatch::assignment::{Assignment, PartnerDispatcher};
use crate::dispatch::scoring::ScoringStrategy;
use crate::error::OrchestratorError;
use crate::external::{
    Audience, Geocoder, InventoryService, Notification, NotificationSink, OrderStore,
    PartnerDirectory,
};
use crate::models::dispatch::Dispatch;
use crate::models::order::{Order, OrderStatus, PaymentStatus};
use crate::models::partner::GeoPoint;
use crate::models::tracking::{LocationUpdate, TrackingSession};
use crate::observability::metrics::Metrics;
use crate::tracking::{LocationTracker, PartnerPosition};
use crate::workflow::engine::{TransitionEvent, WorkflowEngine, WorkflowEvent};
use crate::workflow::rules::TriggerKind;

/// Snapshot answered to `get_workflow_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStatus {
    pub current_status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub assigned_to: Option<Uuid>,
    pub estimated_delivery_minutes: Option<i64>,
}

/// Outcome of a committed transition. The status change is authoritative;
/// `side_effect_failures` lists best-effort work that did not land.
#[derive(Debug, Clone)]
pub struct TransitionReport {
    pub event: TransitionEvent,
    pub side_effect_failures: Vec<String>,
}

impl TransitionReport {
    pub fn fully_applied(&self) -> bool {
        self.side_effect_failures.is_empty()
    }
}

pub struct Orchestrator {
    engine: Arc<WorkflowEngine>,
    dispatcher: Arc<PartnerDispatcher>,
    tracker: Arc<LocationTracker>,
    store: Arc<dyn OrderStore>,
    inventory: Arc<dyn InventoryService>,
    notifier: Arc<dyn NotificationSink>,
    geocoder: Arc<dyn Geocoder>,
    metrics: Arc<Metrics>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        store: Arc<dyn OrderStore>,
        partners: Arc<dyn PartnerDirectory>,
        inventory: Arc<dyn InventoryService>,
        notifier: Arc<dyn NotificationSink>,
        geocoder: Arc<dyn Geocoder>,
    ) -> Arc<Self> {
        let metrics = Arc::new(Metrics::new());
        let engine = WorkflowEngine::new(store.clone(), metrics.clone(), config.event_buffer_size);
        let dispatcher = PartnerDispatcher::new(
            partners,
            store.clone(),
            notifier.clone(),
            config.clone(),
            metrics.clone(),
        );
        let tracker = LocationTracker::new(config, metrics.clone());

        Arc::new(Self {
            engine,
            dispatcher,
            tracker,
            store,
            inventory,
            notifier,
            geocoder,
            metrics,
        })
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    pub fn dispatcher(&self) -> &Arc<PartnerDispatcher> {
        &self.dispatcher
    }

    pub fn tracker(&self) -> &Arc<LocationTracker> {
        &self.tracker
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub async fn initialize_order(
        &self,
        order_id: Uuid,
        initial_status: OrderStatus,
    ) -> Result<(), OrchestratorError> {
        self.engine.initialize(order_id, initial_status).await
    }

    /// Applies a transition and runs its declared side effects inline.
    /// Automatic triggers are left to the background worker so effects are
    /// performed exactly once per event.
    pub async fn transition_order(
        &self,
        order_id: Uuid,
        target: OrderStatus,
        trigger: TriggerKind,
    ) -> Result<TransitionReport, OrchestratorError> {
        let event = self.engine.transition(order_id, target, trigger).await?;

        let side_effect_failures = if trigger == TriggerKind::Automatic {
            Vec::new()
        } else {
            self.apply_side_effects(&event).await
        };

        Ok(TransitionReport {
            event,
            side_effect_failures,
        })
    }

    pub async fn handle_payment_confirmation(
        &self,
        order_id: Uuid,
    ) -> Result<TransitionReport, OrchestratorError> {
        self.store
            .set_payment_status(order_id, PaymentStatus::Completed, Utc::now())
            .await?;
        self.transition_order(order_id, OrderStatus::Confirmed, TriggerKind::Payment)
            .await
    }

    /// Commits an assignment and moves the order to `Assigned`. If the
    /// transition is rejected the partner write is rolled back so the
    /// assignment invariant holds.
    pub async fn handle_partner_assignment(
        &self,
        order_id: Uuid,
        partner_id: Uuid,
    ) -> Result<TransitionReport, OrchestratorError> {
        self.store
            .set_assigned_partner(order_id, Some(partner_id))
            .await?;

        match self
            .transition_order(order_id, OrderStatus::Assigned, TriggerKind::PartnerAction)
            .await
        {
            Ok(report) => Ok(report),
            Err(err) => {
                if let Err(rollback_err) =
                    self.store.set_assigned_partner(order_id, None).await
                {
                    warn!(
                        order_id = %order_id,
                        error = %rollback_err,
                        "failed to roll back partner assignment"
                    );
                }
                Err(err)
            }
        }
    }

    pub async fn handle_order_pickup(
        &self,
        order_id: Uuid,
        partner_id: Uuid,
    ) -> Result<TransitionReport, OrchestratorError> {
        let order = self.store.load_order(order_id).await?;
        self.verify_assigned(&order, partner_id)?;

        let report = self
            .transition_order(order_id, OrderStatus::PickedUp, TriggerKind::PartnerAction)
            .await?;

        // Begin live tracking from the partner's last known position.
        if let Some(destination) = order.delivery_location {
            match self.tracker.partner_location(partner_id) {
                Some(position) => {
                    self.tracker
                        .start_session(partner_id, order_id, position.location, destination);
                }
                None => {
                    debug!(
                        order_id = %order_id,
                        partner_id = %partner_id,
                        "no known partner position, tracking session not started"
                    );
                }
            }
        }

        Ok(report)
    }

    pub async fn handle_order_delivery(
        &self,
        order_id: Uuid,
        partner_id: Uuid,
    ) -> Result<TransitionReport, OrchestratorError> {
        let order = self.store.load_order(order_id).await?;
        self.verify_assigned(&order, partner_id)?;

        let report = self
            .transition_order(order_id, OrderStatus::Delivered, TriggerKind::PartnerAction)
            .await?;

        self.dispatcher.record_completed_delivery(partner_id);
        if let Some(session) = self.tracker.complete_session(partner_id, order_id) {
            info!(
                order_id = %order_id,
                partner_id = %partner_id,
                distance_km = session.distance_traveled_km,
                "delivery tracking sealed"
            );
        }

        Ok(report)
    }

    pub async fn handle_order_cancellation(
        &self,
        order_id: Uuid,
        reason: &str,
    ) -> Result<TransitionReport, OrchestratorError> {
        let order = self.store.load_order(order_id).await?;

        let mut report = self
            .transition_order(order_id, OrderStatus::Cancelled, TriggerKind::Manual)
            .await?;

        if let Some(partner_id) = order.assigned_partner_id {
            if let Some(session) = self.tracker.cancel_session(partner_id, order_id) {
                debug!(
                    order_id = %order_id,
                    distance_km = session.distance_traveled_km,
                    "tracking session cancelled"
                );
            }
        }

        // Refund hook: a paid order being cancelled flips its payment state.
        if order.payment_status == PaymentStatus::Completed {
            if let Err(err) = self
                .store
                .set_payment_status(order_id, PaymentStatus::Refunded, Utc::now())
                .await
            {
                report
                    .side_effect_failures
                    .push(format!("refund: {err}"));
            } else if let Err(err) = self
                .notifier
                .notify(Notification {
                    audience: Audience::Customer,
                    order_id,
                    partner_id: None,
                    message: format!("your order was cancelled ({reason}), refund initiated"),
                })
                .await
            {
                report
                    .side_effect_failures
                    .push(format!("refund notification: {err}"));
            }
        }

        info!(order_id = %order_id, reason = reason, "order cancelled");
        Ok(report)
    }

    pub async fn get_workflow_status(
        &self,
        order_id: Uuid,
    ) -> Result<WorkflowStatus, OrchestratorError> {
        let order = self.store.load_order(order_id).await?;

        let estimated_delivery_minutes = order
            .assigned_partner_id
            .and_then(|partner_id| self.tracker.session(partner_id, order_id))
            .and_then(|session| session.estimated_delivery_at)
            .map(|eta| (eta - Utc::now()).num_minutes().max(0));

        Ok(WorkflowStatus {
            current_status: order.status,
            payment_status: order.payment_status,
            assigned_to: order.assigned_partner_id,
            estimated_delivery_minutes,
        })
    }

    pub async fn find_available_partners(
        &self,
        order_id: Uuid,
        destination: GeoPoint,
        max_partners: usize,
    ) -> Result<Dispatch, OrchestratorError> {
        self.dispatcher
            .find_available_partners(order_id, destination, max_partners)
            .await
    }

    /// Resolves the broadcast accept race and, for the winner, commits the
    /// assignment through the normal workflow path.
    pub async fn accept_order(
        &self,
        order_id: Uuid,
        partner_id: Uuid,
    ) -> Result<TransitionReport, OrchestratorError> {
        self.dispatcher.accept_order(order_id, partner_id)?;
        self.handle_partner_assignment(order_id, partner_id).await
    }

    /// Direct best-partner assignment, the alternate to broadcast dispatch.
    pub async fn assign_best_partner(
        &self,
        order_id: Uuid,
        destination: GeoPoint,
        strategy: ScoringStrategy,
        max_distance_km: f64,
    ) -> Result<(Assignment, TransitionReport), OrchestratorError> {
        let assignment = self
            .dispatcher
            .assign_best_partner(order_id, destination, strategy, max_distance_km)
            .await?;

        match self
            .transition_order(order_id, OrderStatus::Assigned, TriggerKind::PartnerAction)
            .await
        {
            Ok(report) => Ok((assignment, report)),
            Err(err) => {
                if let Err(rollback_err) =
                    self.store.set_assigned_partner(order_id, None).await
                {
                    warn!(
                        order_id = %order_id,
                        error = %rollback_err,
                        "failed to roll back partner assignment"
                    );
                }
                Err(err)
            }
        }
    }

    pub fn update_partner_location(&self, update: LocationUpdate) {
        self.tracker.update_partner_location(update);
    }

    pub fn start_tracking_session(
        &self,
        partner_id: Uuid,
        order_id: Uuid,
        start_location: GeoPoint,
        destination: GeoPoint,
    ) -> TrackingSession {
        self.tracker
            .start_session(partner_id, order_id, start_location, destination)
    }

    pub fn complete_tracking_session(
        &self,
        partner_id: Uuid,
        order_id: Uuid,
    ) -> Option<TrackingSession> {
        self.tracker.complete_session(partner_id, order_id)
    }

    pub fn get_partner_location(&self, partner_id: Uuid) -> Option<PartnerPosition> {
        self.tracker.partner_location(partner_id)
    }

    pub fn get_tracking_session(
        &self,
        partner_id: Uuid,
        order_id: Uuid,
    ) -> Option<TrackingSession> {
        self.tracker.session(partner_id, order_id)
    }

    /// Resolves a free-text delivery address and persists the coordinates.
    pub async fn set_delivery_address(
        &self,
        order_id: Uuid,
        address: &str,
    ) -> Result<GeoPoint, OrchestratorError> {
        let location = self.geocoder.geocode(address).await?;
        self.store.set_delivery_location(order_id, location).await?;
        Ok(location)
    }

    /// Re-derives a timeout for every non-terminal order. Meant to run once
    /// at process start; returns how many timers were armed.
    pub async fn recover_timers(&self) -> Result<usize, OrchestratorError> {
        let orders = self.store.active_orders().await?;
        let mut armed = 0;
        for order in &orders {
            if self.engine.rearm_from_status(order) {
                armed += 1;
            }
        }
        info!(orders = orders.len(), armed = armed, "workflow timers recovered");
        Ok(armed)
    }

    fn verify_assigned(
        &self,
        order: &Order,
        partner_id: Uuid,
    ) -> Result<(), OrchestratorError> {
        if order.assigned_partner_id != Some(partner_id) {
            return Err(OrchestratorError::PreconditionNotMet(format!(
                "partner {partner_id} is not assigned to order {}",
                order.id
            )));
        }
        Ok(())
    }

    /// Performs the side effects a committed transition declares. Failures
    /// are collected, never propagated: the transition is the source of
    /// truth and stays committed.
    async fn apply_side_effects(&self, event: &TransitionEvent) -> Vec<String> {
        let mut failures = Vec::new();

        let order = match self.store.load_order(event.order_id).await {
            Ok(order) => order,
            Err(err) => {
                failures.push(format!("load order for side effects: {err}"));
                return failures;
            }
        };

        if event.effects.notify_customer {
            let notification = Notification {
                audience: Audience::Customer,
                order_id: event.order_id,
                partner_id: None,
                message: customer_message(event.to),
            };
            if let Err(err) = self.notifier.notify(notification).await {
                failures.push(format!("customer notification: {err}"));
            }
        }

        if event.effects.notify_partner {
            if let Some(partner_id) = order.assigned_partner_id {
                let notification = Notification {
                    audience: Audience::Partner,
                    order_id: event.order_id,
                    partner_id: Some(partner_id),
                    message: format!("order update: now {:?}", event.to),
                };
                if let Err(err) = self.notifier.notify(notification).await {
                    failures.push(format!("partner notification: {err}"));
                }
            }
        }

        if event.effects.notify_admin {
            let notification = Notification {
                audience: Audience::Admin,
                order_id: event.order_id,
                partner_id: order.assigned_partner_id,
                message: format!("order moved {:?} -> {:?}", event.from, event.to),
            };
            if let Err(err) = self.notifier.notify(notification).await {
                failures.push(format!("admin notification: {err}"));
            }
        }

        if event.effects.update_inventory {
            for item in &order.items {
                let result = match event.to {
                    OrderStatus::Delivered => {
                        self.inventory
                            .confirm_sale(item.product_id, item.quantity)
                            .await
                    }
                    OrderStatus::Cancelled | OrderStatus::Refunded | OrderStatus::Failed => {
                        self.inventory.release(item.product_id, item.quantity).await
                    }
                    _ => Ok(()),
                };
                if let Err(err) = result {
                    failures.push(format!("inventory for product {}: {err}", item.product_id));
                }
            }
        }

        if event.effects.generate_invoice {
            let notification = Notification {
                audience: Audience::Customer,
                order_id: event.order_id,
                partner_id: None,
                message: "your invoice is ready".to_string(),
            };
            if let Err(err) = self.notifier.notify(notification).await {
                failures.push(format!("invoice notification: {err}"));
            }
        }

        if event.effects.update_analytics {
            debug!(order_id = %event.order_id, to = ?event.to, "analytics event recorded");
        }

        if !failures.is_empty() {
            warn!(
                order_id = %event.order_id,
                failures = failures.len(),
                "side effects partially failed"
            );
        }
        failures
    }
}

fn customer_message(status: OrderStatus) -> String {
    match status {
        OrderStatus::Confirmed => "payment received, your order is confirmed".to_string(),
        OrderStatus::Preparing => "your order is being prepared".to_string(),
        OrderStatus::Ready => "your order is ready and awaiting a delivery partner".to_string(),
        OrderStatus::Assigned => "a delivery partner has been assigned".to_string(),
        OrderStatus::PickedUp => "your order has been picked up".to_string(),
        OrderStatus::OutForDelivery => "your order is out for delivery".to_string(),
        OrderStatus::Delivered => "your order has been delivered".to_string(),
        OrderStatus::Cancelled => "your order has been cancelled".to_string(),
        OrderStatus::Failed => "your delivery could not be completed".to_string(),
        OrderStatus::Refunded => "your order has been refunded".to_string(),
        OrderStatus::Placed => "your order has been placed".to_string(),
    }
}

/// Background companion to the orchestrator: performs side effects for
/// timer-driven transitions and forwards timeout alerts, so the engine
/// itself never does I/O beyond the store.
pub async fn run_side_effect_worker(orchestrator: Arc<Orchestrator>) {
    let mut events = orchestrator.engine.subscribe();
    info!("side effect worker started");

    loop {
        match events.recv().await {
            Ok(WorkflowEvent::Transitioned(event)) => {
                if event.trigger != TriggerKind::Automatic {
                    continue;
                }
                let failures = orchestrator.apply_side_effects(&event).await;
                if !failures.is_empty() {
                    warn!(
                        order_id = %event.order_id,
                        failures = failures.len(),
                        "automatic transition side effects partially failed"
                    );
                }
            }
            Ok(WorkflowEvent::TimeoutAlert {
                order_id,
                status,
                audience,
                ..
            }) => {
                let partner_id = match audience {
                    Audience::Partner => orchestrator
                        .store
                        .load_order(order_id)
                        .await
                        .ok()
                        .and_then(|order| order.assigned_partner_id),
                    _ => None,
                };
                let notification = Notification {
                    audience,
                    order_id,
                    partner_id,
                    message: format!("order has been waiting in {status:?} too long"),
                };
                if let Err(err) = orchestrator.notifier.notify(notification).await {
                    warn!(order_id = %order_id, error = %err, "timeout alert notification failed");
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped = skipped, "side effect worker lagged behind events");
            }
            Err(RecvError::Closed) => break,
        }
    }

    info!("side effect worker stopped");
}
