//! Partner matching. Two modes share the dispatcher: direct best-partner
//! assignment, and broadcast dispatch where several candidates are offered
//! the order and the first acceptance wins.

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Instant;

use chrono::{NaiveDate, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, sleep};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::dispatch::scoring::{ScoreBreakdown, ScoringStrategy, compute_score};
use crate::error::OrchestratorError;
use crate::external::{
    Audience, Notification, NotificationSink, OrderStore, PartnerDirectory,
};
use crate::geo::haversine_km;
use crate::models::dispatch::{Dispatch, DispatchStatus, MatchedPartner};
use crate::models::partner::{GeoPoint, Partner};
use crate::observability::metrics::Metrics;

/// Fixed handling buffer added on top of the travel-time estimate.
const DELIVERY_BUFFER_MINUTES: i64 = 10;

/// The committed result of a best-partner assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub order_id: Uuid,
    pub partner_id: Uuid,
    pub score: f64,
    pub breakdown: ScoreBreakdown,
    pub distance_km: f64,
    pub estimated_delivery_minutes: i64,
    pub assigned_at: chrono::DateTime<Utc>,
}

struct DailyTally {
    date: NaiveDate,
    count: u32,
}

pub struct PartnerDispatcher {
    /// Handle back to the Arc this dispatcher lives in, for expiry tasks.
    self_ref: Weak<PartnerDispatcher>,
    partners: Arc<dyn PartnerDirectory>,
    store: Arc<dyn OrderStore>,
    notifier: Arc<dyn NotificationSink>,
    dispatches: DashMap<Uuid, Dispatch>,
    daily_tallies: DashMap<Uuid, DailyTally>,
    config: Config,
    metrics: Arc<Metrics>,
}

impl PartnerDispatcher {
    pub fn new(
        partners: Arc<dyn PartnerDirectory>,
        store: Arc<dyn OrderStore>,
        notifier: Arc<dyn NotificationSink>,
        config: Config,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            partners,
            store,
            notifier,
            dispatches: DashMap::new(),
            daily_tallies: DashMap::new(),
            config,
            metrics,
        })
    }

    /// Scores every online partner within `max_distance_km` of the
    /// destination and commits the best one. "Nobody online" and "nobody
    /// close enough" are distinct outcomes.
    pub async fn assign_best_partner(
        &self,
        order_id: Uuid,
        destination: GeoPoint,
        strategy: ScoringStrategy,
        max_distance_km: f64,
    ) -> Result<Assignment, OrchestratorError> {
        let started = Instant::now();
        let result = self
            .assign_best_partner_inner(order_id, destination, strategy, max_distance_km)
            .await;

        let outcome = if result.is_ok() { "success" } else { "error" };
        self.metrics
            .assignment_latency_seconds
            .with_label_values(&[outcome])
            .observe(started.elapsed().as_secs_f64());

        result
    }

    async fn assign_best_partner_inner(
        &self,
        order_id: Uuid,
        destination: GeoPoint,
        strategy: ScoringStrategy,
        max_distance_km: f64,
    ) -> Result<Assignment, OrchestratorError> {
        let online = self.partners.online_partners().await?;
        if online.is_empty() {
            return Err(OrchestratorError::NoPartnersAvailable);
        }

        let now = Utc::now();
        let mut scored: Vec<(Partner, f64, ScoreBreakdown, f64)> = online
            .into_iter()
            .filter_map(|partner| {
                let location = partner.location?;
                let distance_km = haversine_km(&location, &destination);
                (distance_km <= max_distance_km).then_some((partner, distance_km))
            })
            .map(|(partner, distance_km)| {
                let (score, breakdown) =
                    compute_score(&partner, distance_km, max_distance_km, strategy, now);
                (partner, score, breakdown, distance_km)
            })
            .collect();

        if scored.is_empty() {
            return Err(OrchestratorError::NoPartnersInRange);
        }

        // Stable sort: ties keep original scan order.
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        let (winner, score, breakdown, distance_km) = scored.swap_remove(0);

        self.store
            .set_assigned_partner(order_id, Some(winner.id))
            .await?;

        let assignment = Assignment {
            order_id,
            partner_id: winner.id,
            score,
            breakdown,
            distance_km,
            estimated_delivery_minutes: estimated_delivery_minutes(
                distance_km,
                winner.vehicle.average_speed_kmh(),
            ),
            assigned_at: now,
        };

        info!(
            order_id = %order_id,
            partner_id = %winner.id,
            score = score,
            distance_km = distance_km,
            "best partner assigned"
        );
        Ok(assignment)
    }

    /// Broadcast search: priority-class partners get first look inside the
    /// initial radius, then the search widens and backfills with
    /// non-priority partners until `max_partners` are matched. Priority
    /// partners at the daily cap are excluded outright.
    pub async fn find_available_partners(
        &self,
        order_id: Uuid,
        destination: GeoPoint,
        max_partners: usize,
    ) -> Result<Dispatch, OrchestratorError> {
        let online = self.partners.online_partners().await?;
        if online.is_empty() {
            return Err(OrchestratorError::NoPartnersAvailable);
        }

        let located: Vec<(Partner, f64)> = online
            .into_iter()
            .filter_map(|partner| {
                let location = partner.location?;
                let distance_km = haversine_km(&location, &destination);
                Some((partner, distance_km))
            })
            .collect();

        let mut matched: Vec<MatchedPartner> = Vec::new();
        let mut matched_ids: HashSet<Uuid> = HashSet::new();
        let mut radius_km = self.config.initial_search_radius_km;

        while matched.len() < max_partners {
            // Priority class first at every radius, nearest first.
            for priority_pass in [true, false] {
                let mut tier: Vec<&(Partner, f64)> = located
                    .iter()
                    .filter(|(partner, distance_km)| {
                        partner.priority_class == priority_pass
                            && *distance_km <= radius_km
                            && !matched_ids.contains(&partner.id)
                    })
                    .collect();
                tier.sort_by(|a, b| a.1.total_cmp(&b.1));

                for (partner, distance_km) in tier {
                    if matched.len() >= max_partners {
                        break;
                    }
                    if partner.priority_class && !self.under_daily_cap(partner.id) {
                        debug!(partner_id = %partner.id, "priority partner at daily cap, skipped");
                        continue;
                    }
                    matched_ids.insert(partner.id);
                    matched.push(MatchedPartner {
                        partner_id: partner.id,
                        distance_km: *distance_km,
                        priority_class: partner.priority_class,
                        search_radius_km: radius_km,
                    });
                }
            }

            if radius_km >= self.config.max_search_radius_km {
                break;
            }
            radius_km =
                (radius_km + self.config.search_radius_step_km).min(self.config.max_search_radius_km);
        }

        if matched.is_empty() {
            return Err(OrchestratorError::NoPartnersInRange);
        }

        let now = Utc::now();
        let dispatch = Dispatch {
            order_id,
            candidates: matched,
            status: DispatchStatus::Pending,
            accepted_by: None,
            created_at: now,
            expires_at: now + chrono::Duration::seconds(self.config.dispatch_expiry_secs as i64),
        };
        self.dispatches.insert(order_id, dispatch.clone());
        self.metrics.dispatches_created_total.inc();

        for candidate in &dispatch.candidates {
            let notification = Notification {
                audience: Audience::Partner,
                order_id,
                partner_id: Some(candidate.partner_id),
                message: format!(
                    "new delivery offer, {:.1} km away, first to accept wins",
                    candidate.distance_km
                ),
            };
            if let Err(err) = self.notifier.notify(notification).await {
                warn!(
                    order_id = %order_id,
                    partner_id = %candidate.partner_id,
                    error = %err,
                    "dispatch offer notification failed"
                );
            }
        }

        self.spawn_expiry(order_id, dispatch.created_at);

        // Candidates are on notice; the record moves from pending to matched
        // unless something already settled it.
        let dispatch = match self.dispatches.get_mut(&order_id) {
            Some(mut entry)
                if entry.created_at == now && entry.status == DispatchStatus::Pending =>
            {
                entry.status = DispatchStatus::Matched;
                entry.clone()
            }
            _ => dispatch,
        };

        info!(
            order_id = %order_id,
            candidates = dispatch.candidates.len(),
            "dispatch created"
        );
        Ok(dispatch)
    }

    /// First caller to find the dispatch open, with itself among the
    /// candidates, wins. The check and the flip happen under the map entry's
    /// exclusive reference, so two concurrent acceptors cannot both see
    /// `Pending`.
    pub fn accept_order(
        &self,
        order_id: Uuid,
        partner_id: Uuid,
    ) -> Result<Dispatch, OrchestratorError> {
        let accepted = {
            let mut entry = self.dispatches.get_mut(&order_id).ok_or_else(|| {
                OrchestratorError::NotFound(format!("dispatch for order {order_id}"))
            })?;

            if !entry.is_open() || Utc::now() >= entry.expires_at {
                self.metrics
                    .dispatch_accepts_total
                    .with_label_values(&["rejected"])
                    .inc();
                return Err(OrchestratorError::AlreadyAssigned(order_id));
            }
            if !entry.contains(partner_id) {
                self.metrics
                    .dispatch_accepts_total
                    .with_label_values(&["rejected"])
                    .inc();
                return Err(OrchestratorError::NotFound(format!(
                    "partner {partner_id} is not a candidate for order {order_id}"
                )));
            }

            entry.status = DispatchStatus::Accepted;
            entry.accepted_by = Some(partner_id);
            entry.clone()
        };

        self.metrics
            .dispatch_accepts_total
            .with_label_values(&["success"])
            .inc();
        info!(order_id = %order_id, partner_id = %partner_id, "dispatch accepted");
        Ok(accepted)
    }

    pub fn dispatch_for(&self, order_id: Uuid) -> Option<Dispatch> {
        self.dispatches.get(&order_id).map(|entry| entry.value().clone())
    }

    /// Counts toward the priority-class daily cap; the tally resets at
    /// midnight because it is keyed by calendar date.
    pub fn record_completed_delivery(&self, partner_id: Uuid) {
        let today = Utc::now().date_naive();
        let mut tally = self
            .daily_tallies
            .entry(partner_id)
            .or_insert_with(|| DailyTally {
                date: today,
                count: 0,
            });
        if tally.date != today {
            tally.date = today;
            tally.count = 0;
        }
        tally.count += 1;
    }

    pub fn deliveries_today(&self, partner_id: Uuid) -> u32 {
        let today = Utc::now().date_naive();
        self.daily_tallies
            .get(&partner_id)
            .filter(|tally| tally.date == today)
            .map(|tally| tally.count)
            .unwrap_or(0)
    }

    fn under_daily_cap(&self, partner_id: Uuid) -> bool {
        self.deliveries_today(partner_id) < self.config.priority_daily_cap
    }

    /// An untouched dispatch flips to `Expired` after the configured expiry
    /// and is dropped from memory after a further grace period. Both steps
    /// are guarded by `created_at` so a fresh dispatch for the same order is
    /// never clobbered by a stale task.
    fn spawn_expiry(&self, order_id: Uuid, created_at: chrono::DateTime<Utc>) {
        let Some(dispatcher) = self.self_ref.upgrade() else {
            return;
        };
        let expiry = Duration::from_secs(self.config.dispatch_expiry_secs);
        let grace = Duration::from_secs(self.config.dispatch_grace_secs);

        tokio::spawn(async move {
            sleep(expiry).await;

            let expired = match dispatcher.dispatches.get_mut(&order_id) {
                Some(mut entry) if entry.created_at == created_at && entry.is_open() => {
                    entry.status = DispatchStatus::Expired;
                    true
                }
                _ => false,
            };
            if expired {
                info!(order_id = %order_id, "dispatch expired");
            }

            sleep(grace).await;
            dispatcher
                .dispatches
                .remove_if(&order_id, |_, dispatch| dispatch.created_at == created_at);
        });
    }
}

pub fn estimated_delivery_minutes(distance_km: f64, speed_kmh: f64) -> i64 {
    let travel_minutes = (distance_km / speed_kmh * 60.0).ceil() as i64;
    travel_minutes + DELIVERY_BUFFER_MINUTES
}

#[cfg(test)]
mod tests {
    use super::estimated_delivery_minutes;

    #[test]
    fn eta_includes_fixed_buffer() {
        // 6 km on a bicycle at 12 km/h is 30 minutes of travel.
        assert_eq!(estimated_delivery_minutes(6.0, 12.0), 40);
        assert_eq!(estimated_delivery_minutes(0.0, 12.0), 10);
    }
}
