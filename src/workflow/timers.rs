//! One cancellable timeout per in-flight order. Arming a new timer always
//! aborts the previous one, and fired tasks deregister themselves through a
//! generation tag so they can never remove a successor that replaced them.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use uuid::Uuid;

struct ArmedTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
pub struct TimerRegistry {
    next_generation: AtomicU64,
    timers: DashMap<Uuid, ArmedTimer>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers a spawned timer task, aborting whatever was armed before.
    pub fn arm(&self, order_id: Uuid, generation: u64, handle: JoinHandle<()>) {
        if let Some(previous) = self.timers.insert(order_id, ArmedTimer { generation, handle }) {
            previous.handle.abort();
        }
    }

    /// Cancels the armed timer for an order, if any.
    pub fn cancel(&self, order_id: Uuid) -> bool {
        match self.timers.remove(&order_id) {
            Some((_, timer)) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Removes a fired task's own registration. Returns false when a newer
    /// timer has replaced it in the meantime (the entry is left alone).
    pub fn disarm_if_current(&self, order_id: Uuid, generation: u64) -> bool {
        self.timers
            .remove_if(&order_id, |_, timer| timer.generation == generation)
            .is_some()
    }

    pub fn is_armed(&self, order_id: Uuid) -> bool {
        self.timers.contains_key(&order_id)
    }

    pub fn armed_count(&self) -> usize {
        self.timers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn arming_replaces_previous_timer() {
        let registry = TimerRegistry::new();
        let order_id = Uuid::new_v4();

        let first_gen = registry.next_generation();
        let first = tokio::spawn(std::future::pending::<()>());
        registry.arm(order_id, first_gen, first);

        let second_gen = registry.next_generation();
        let second = tokio::spawn(std::future::pending::<()>());
        registry.arm(order_id, second_gen, second);

        assert_eq!(registry.armed_count(), 1);
        // The replaced task's disarm must not touch the new registration.
        assert!(!registry.disarm_if_current(order_id, first_gen));
        assert!(registry.is_armed(order_id));
        assert!(registry.disarm_if_current(order_id, second_gen));
        assert!(!registry.is_armed(order_id));
    }

    #[tokio::test]
    async fn cancel_unknown_order_is_a_noop() {
        let registry = TimerRegistry::new();
        assert!(!registry.cancel(Uuid::new_v4()));
    }
}
