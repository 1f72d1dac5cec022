//! The order state machine. `transition` is the single mutation point:
//! rule lookup, precondition checks, persistence, timer rotation, and the
//! typed event emit either all happen or none do.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::external::{Audience, OrderStore};
use crate::models::order::{Order, OrderStatus, PaymentStatus};
use crate::observability::metrics::Metrics;
use crate::workflow::rules::{
    SideEffects, StatusTimeout, TimeoutAction, TransitionRule, TriggerKind, find_rule,
    standard_rules, status_timeouts,
};
use crate::workflow::timers::TimerRegistry;

/// A committed transition, carrying the side effects the matched rule
/// declares. The engine never performs the side-effect I/O itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub order_id: Uuid,
    pub from: OrderStatus,
    pub to: OrderStatus,
    pub trigger: TriggerKind,
    pub effects: SideEffects,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkflowEvent {
    Transitioned(TransitionEvent),
    /// A status timeout fired without an auto-transition configured.
    TimeoutAlert {
        order_id: Uuid,
        status: OrderStatus,
        audience: Audience,
        occurred_at: DateTime<Utc>,
    },
}

pub struct WorkflowEngine {
    /// Handle back to the Arc this engine lives in, for timer tasks.
    self_ref: Weak<WorkflowEngine>,
    store: Arc<dyn OrderStore>,
    rules: Vec<TransitionRule>,
    timeouts: HashMap<OrderStatus, StatusTimeout>,
    timers: TimerRegistry,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
    events_tx: broadcast::Sender<WorkflowEvent>,
    metrics: Arc<Metrics>,
}

impl WorkflowEngine {
    pub fn new(store: Arc<dyn OrderStore>, metrics: Arc<Metrics>, event_buffer: usize) -> Arc<Self> {
        let (events_tx, _unused_rx) = broadcast::channel(event_buffer);

        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            store,
            rules: standard_rules(),
            timeouts: status_timeouts(),
            timers: TimerRegistry::new(),
            locks: DashMap::new(),
            events_tx,
            metrics,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.events_tx.subscribe()
    }

    pub fn has_armed_timer(&self, order_id: Uuid) -> bool {
        self.timers.is_armed(order_id)
    }

    fn order_lock(&self, order_id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .entry(order_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Brings an order under workflow control: validates it exists, aligns
    /// the stored status, and arms the timeout for that status.
    pub async fn initialize(
        &self,
        order_id: Uuid,
        initial: OrderStatus,
    ) -> Result<(), OrchestratorError> {
        let lock = self.order_lock(order_id);
        let _guard = lock.lock().await;

        let order = self.store.load_order(order_id).await?;
        if order.status != initial {
            self.store
                .update_status(order_id, initial, Utc::now())
                .await?;
        }
        self.arm_timeout(order_id, initial);

        info!(order_id = %order_id, status = ?initial, "order initialized");
        Ok(())
    }

    /// Applies a single status transition. Fails without side effects when
    /// no rule matches or a precondition is unmet; on success the new status
    /// is persisted, the old timer is cancelled, the new one armed, and the
    /// transition event is both returned and published.
    pub async fn transition(
        &self,
        order_id: Uuid,
        target: OrderStatus,
        trigger: TriggerKind,
    ) -> Result<TransitionEvent, OrchestratorError> {
        let lock = self.order_lock(order_id);
        let _guard = lock.lock().await;

        let order = self.store.load_order(order_id).await?;
        let result = self.apply(&order, target, trigger).await;

        match &result {
            Ok(event) => {
                self.metrics
                    .transitions_total
                    .with_label_values(&["success"])
                    .inc();
                info!(
                    order_id = %order_id,
                    from = ?event.from,
                    to = ?event.to,
                    trigger = ?trigger,
                    "order transitioned"
                );
            }
            Err(err) => {
                self.metrics
                    .transitions_total
                    .with_label_values(&["rejected"])
                    .inc();
                debug!(order_id = %order_id, target = ?target, error = %err, "transition rejected");
            }
        }

        result
    }

    async fn apply(
        &self,
        order: &Order,
        target: OrderStatus,
        trigger: TriggerKind,
    ) -> Result<TransitionEvent, OrchestratorError> {
        let rule = find_rule(&self.rules, order.status, target, trigger).ok_or(
            OrchestratorError::InvalidTransition {
                from: order.status,
                to: target,
                trigger,
            },
        )?;

        if rule.requires_payment && order.payment_status != PaymentStatus::Completed {
            return Err(OrchestratorError::PreconditionNotMet(format!(
                "order {} requires completed payment for {:?}",
                order.id, target
            )));
        }
        if rule.requires_partner && order.assigned_partner_id.is_none() {
            return Err(OrchestratorError::PreconditionNotMet(format!(
                "order {} requires an assigned partner for {:?}",
                order.id, target
            )));
        }

        let now = Utc::now();
        self.store.update_status(order.id, target, now).await?;

        self.timers.cancel(order.id);
        self.arm_timeout(order.id, target);

        let event = TransitionEvent {
            order_id: order.id,
            from: order.status,
            to: target,
            trigger,
            effects: rule.effects,
            occurred_at: now,
        };
        let _ = self.events_tx.send(WorkflowEvent::Transitioned(event.clone()));

        Ok(event)
    }

    /// Re-derives the timer for an order from its current status. Used on
    /// restart recovery; the timeout restarts whole rather than crediting
    /// time elapsed before the crash.
    pub fn rearm_from_status(&self, order: &Order) -> bool {
        if order.status.is_terminal() {
            return false;
        }
        self.arm_timeout(order.id, order.status)
    }

    fn arm_timeout(&self, order_id: Uuid, status: OrderStatus) -> bool {
        let Some(timeout) = self.timeouts.get(&status).copied() else {
            self.timers.cancel(order_id);
            self.metrics.armed_timers.set(self.timers.armed_count() as i64);
            return false;
        };
        let Some(engine) = self.self_ref.upgrade() else {
            return false;
        };

        let generation = self.timers.next_generation();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout.after).await;
            engine.timers.disarm_if_current(order_id, generation);
            engine.fire_timeout(order_id, status, timeout.action).await;
            // The registration can land after an immediate firing; sweep it.
            engine.timers.disarm_if_current(order_id, generation);
            engine
                .metrics
                .armed_timers
                .set(engine.timers.armed_count() as i64);
        });
        self.timers.arm(order_id, generation, handle);
        self.metrics.armed_timers.set(self.timers.armed_count() as i64);
        true
    }

    /// A fired timer re-validates the order's current status before acting:
    /// the status may have changed between scheduling and firing, and a
    /// duplicate firing must be a no-op.
    async fn fire_timeout(&self, order_id: Uuid, expected: OrderStatus, action: TimeoutAction) {
        match action {
            TimeoutAction::Transition(target) => {
                match self.transition(order_id, target, TriggerKind::Automatic).await {
                    Ok(_) => {
                        self.metrics
                            .timer_firings_total
                            .with_label_values(&["transition"])
                            .inc();
                    }
                    Err(err) => {
                        self.metrics
                            .timer_firings_total
                            .with_label_values(&["skipped"])
                            .inc();
                        debug!(
                            order_id = %order_id,
                            target = ?target,
                            error = %err,
                            "timeout transition skipped"
                        );
                    }
                }
            }
            TimeoutAction::AlertAdmin | TimeoutAction::AlertPartner => {
                let order = match self.store.load_order(order_id).await {
                    Ok(order) => order,
                    Err(err) => {
                        warn!(order_id = %order_id, error = %err, "timeout alert load failed");
                        return;
                    }
                };
                if order.status != expected {
                    self.metrics
                        .timer_firings_total
                        .with_label_values(&["skipped"])
                        .inc();
                    return;
                }

                let audience = match action {
                    TimeoutAction::AlertAdmin => Audience::Admin,
                    _ => Audience::Partner,
                };
                self.metrics
                    .timer_firings_total
                    .with_label_values(&["alert"])
                    .inc();
                warn!(order_id = %order_id, status = ?expected, audience = ?audience, "status timeout alert");
                let _ = self.events_tx.send(WorkflowEvent::TimeoutAlert {
                    order_id,
                    status: expected,
                    audience,
                    occurred_at: Utc::now(),
                });
            }
        }
    }
}
