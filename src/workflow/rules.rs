//! The canonical transition table. The rule set is fixed at startup and
//! shared by every order; rules are configuration, never persisted per
//! order.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::order::OrderStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerKind {
    /// Engine-driven, fires from a status timeout with no external input.
    Automatic,
    /// Explicit API call.
    Manual,
    /// Gated on payment confirmation.
    Payment,
    /// Gated on an assignment existing.
    PartnerAction,
}

/// Side effects a transition declares. The engine only declares them on the
/// emitted event; the integration layer performs the I/O.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SideEffects {
    pub notify_customer: bool,
    pub notify_partner: bool,
    pub notify_admin: bool,
    pub update_inventory: bool,
    pub generate_invoice: bool,
    pub update_analytics: bool,
}

#[derive(Debug, Clone)]
pub struct TransitionRule {
    pub from: OrderStatus,
    pub to: OrderStatus,
    pub trigger: TriggerKind,
    pub requires_payment: bool,
    pub requires_partner: bool,
    pub effects: SideEffects,
}

fn rule(
    from: OrderStatus,
    to: OrderStatus,
    trigger: TriggerKind,
    requires_payment: bool,
    requires_partner: bool,
    effects: SideEffects,
) -> TransitionRule {
    TransitionRule {
        from,
        to,
        trigger,
        requires_payment,
        requires_partner,
        effects,
    }
}

pub fn standard_rules() -> Vec<TransitionRule> {
    use OrderStatus::*;
    use TriggerKind::*;

    let customer = SideEffects {
        notify_customer: true,
        ..SideEffects::default()
    };
    let cancel = SideEffects {
        notify_customer: true,
        notify_admin: true,
        update_inventory: true,
        ..SideEffects::default()
    };
    let failure = SideEffects {
        notify_customer: true,
        notify_admin: true,
        ..SideEffects::default()
    };
    let refund = SideEffects {
        notify_customer: true,
        notify_admin: true,
        update_inventory: true,
        ..SideEffects::default()
    };

    vec![
        rule(
            Placed,
            Confirmed,
            Payment,
            true,
            false,
            SideEffects {
                notify_customer: true,
                generate_invoice: true,
                update_analytics: true,
                ..SideEffects::default()
            },
        ),
        rule(Placed, Cancelled, Manual, false, false, cancel),
        rule(Placed, Cancelled, Automatic, false, false, cancel),
        rule(Confirmed, Preparing, Automatic, false, false, customer),
        rule(Confirmed, Preparing, Manual, false, false, customer),
        rule(Confirmed, Cancelled, Manual, false, false, cancel),
        rule(Confirmed, Refunded, Payment, true, false, refund),
        rule(Preparing, Ready, Automatic, false, false, customer),
        rule(Preparing, Ready, Manual, false, false, customer),
        rule(Preparing, Cancelled, Manual, false, false, cancel),
        rule(Preparing, Refunded, Payment, true, false, refund),
        rule(
            Ready,
            Assigned,
            PartnerAction,
            false,
            true,
            SideEffects {
                notify_customer: true,
                notify_partner: true,
                ..SideEffects::default()
            },
        ),
        rule(Ready, Cancelled, Manual, false, false, cancel),
        rule(Ready, Refunded, Payment, true, false, refund),
        rule(Assigned, PickedUp, PartnerAction, false, true, customer),
        rule(
            Assigned,
            Cancelled,
            Manual,
            false,
            false,
            SideEffects {
                notify_customer: true,
                notify_partner: true,
                notify_admin: true,
                update_inventory: true,
                ..SideEffects::default()
            },
        ),
        rule(Assigned, Failed, Manual, false, false, failure),
        rule(PickedUp, OutForDelivery, Automatic, false, false, customer),
        rule(PickedUp, OutForDelivery, PartnerAction, false, true, customer),
        rule(PickedUp, Failed, Manual, false, false, failure),
        rule(
            OutForDelivery,
            Delivered,
            PartnerAction,
            false,
            true,
            SideEffects {
                notify_customer: true,
                notify_partner: true,
                update_inventory: true,
                update_analytics: true,
                ..SideEffects::default()
            },
        ),
        rule(OutForDelivery, Failed, Manual, false, false, failure),
    ]
}

pub fn find_rule(
    rules: &[TransitionRule],
    from: OrderStatus,
    to: OrderStatus,
    trigger: TriggerKind,
) -> Option<&TransitionRule> {
    rules
        .iter()
        .find(|r| r.from == from && r.to == to && r.trigger == trigger)
}

/// What a fired status timeout does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutAction {
    /// Auto-transition to the target status.
    Transition(OrderStatus),
    /// Emit an admin alert; the order stays put.
    AlertAdmin,
    /// Emit a partner alert; the order stays put.
    AlertPartner,
}

#[derive(Debug, Clone, Copy)]
pub struct StatusTimeout {
    pub after: Duration,
    pub action: TimeoutAction,
}

/// Per-status timeout table. At most one timer is armed per order; arming a
/// new one always cancels the previous.
pub fn status_timeouts() -> HashMap<OrderStatus, StatusTimeout> {
    use OrderStatus::*;

    HashMap::from([
        (
            Placed,
            StatusTimeout {
                after: Duration::from_secs(10 * 60),
                action: TimeoutAction::Transition(Cancelled),
            },
        ),
        (
            Confirmed,
            StatusTimeout {
                after: Duration::from_secs(2 * 60),
                action: TimeoutAction::Transition(Preparing),
            },
        ),
        (
            Preparing,
            StatusTimeout {
                after: Duration::from_secs(15 * 60),
                action: TimeoutAction::Transition(Ready),
            },
        ),
        (
            Ready,
            StatusTimeout {
                after: Duration::from_secs(30 * 60),
                action: TimeoutAction::AlertAdmin,
            },
        ),
        (
            Assigned,
            StatusTimeout {
                after: Duration::from_secs(5 * 60),
                action: TimeoutAction::AlertPartner,
            },
        ),
        (
            PickedUp,
            StatusTimeout {
                after: Duration::from_secs(60),
                action: TimeoutAction::Transition(OutForDelivery),
            },
        ),
        (
            OutForDelivery,
            StatusTimeout {
                after: Duration::from_secs(45 * 60),
                action: TimeoutAction::AlertPartner,
            },
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::order::OrderStatus::*;

    #[test]
    fn no_rule_leaves_a_terminal_status() {
        for rule in standard_rules() {
            assert!(
                !rule.from.is_terminal(),
                "rule {:?} -> {:?} starts from a terminal status",
                rule.from,
                rule.to
            );
        }
    }

    #[test]
    fn happy_path_is_fully_connected() {
        let rules = standard_rules();
        let path = [
            (Placed, Confirmed, TriggerKind::Payment),
            (Confirmed, Preparing, TriggerKind::Automatic),
            (Preparing, Ready, TriggerKind::Automatic),
            (Ready, Assigned, TriggerKind::PartnerAction),
            (Assigned, PickedUp, TriggerKind::PartnerAction),
            (PickedUp, OutForDelivery, TriggerKind::Automatic),
            (OutForDelivery, Delivered, TriggerKind::PartnerAction),
        ];
        for (from, to, trigger) in path {
            assert!(
                find_rule(&rules, from, to, trigger).is_some(),
                "missing rule {from:?} -> {to:?} via {trigger:?}"
            );
        }
    }

    #[test]
    fn trigger_kind_disambiguates_rules() {
        let rules = standard_rules();
        assert!(find_rule(&rules, Placed, Confirmed, TriggerKind::Payment).is_some());
        assert!(find_rule(&rules, Placed, Confirmed, TriggerKind::Manual).is_none());
        assert!(find_rule(&rules, Delivered, Cancelled, TriggerKind::Manual).is_none());
    }

    #[test]
    fn payment_rule_requires_payment() {
        let rules = standard_rules();
        let confirm = find_rule(&rules, Placed, Confirmed, TriggerKind::Payment).unwrap();
        assert!(confirm.requires_payment);
        assert!(!confirm.requires_partner);
    }

    #[test]
    fn every_automatic_timeout_has_a_matching_rule() {
        let rules = standard_rules();
        for (from, timeout) in status_timeouts() {
            if let TimeoutAction::Transition(to) = timeout.action {
                assert!(
                    find_rule(&rules, from, to, TriggerKind::Automatic).is_some(),
                    "timeout for {from:?} targets {to:?} but no automatic rule exists"
                );
            }
        }
    }

    #[test]
    fn delivery_declares_inventory_effect() {
        let rules = standard_rules();
        let delivered =
            find_rule(&rules, OutForDelivery, Delivered, TriggerKind::PartnerAction).unwrap();
        assert!(delivered.effects.update_inventory);
        assert!(delivered.effects.notify_partner);
    }
}
