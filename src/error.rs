use thiserror::Error;
use uuid::Uuid;

use crate::models::order::OrderStatus;
use crate::workflow::rules::TriggerKind;

/// Failures surfaced by the orchestration core.
///
/// Structural failures (`InvalidTransition`, `PreconditionNotMet`,
/// `NotFound`, `AlreadyAssigned`, the two partner-search outcomes) are
/// returned to the caller so it can branch on them; they are never
/// panicked past an operation boundary. `Store` covers transient I/O
/// faults from the external collaborators.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("no transition {from:?} -> {to:?} for trigger {trigger:?}")]
    InvalidTransition {
        from: OrderStatus,
        to: OrderStatus,
        trigger: TriggerKind,
    },

    #[error("precondition not met: {0}")]
    PreconditionNotMet(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("order {0} already assigned or expired")]
    AlreadyAssigned(Uuid),

    #[error("no partners available")]
    NoPartnersAvailable,

    #[error("no partners in range")]
    NoPartnersInRange,

    #[error("store failure: {0}")]
    Store(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}
