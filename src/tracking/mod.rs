//! Live partner position, per-delivery tracking sessions, geofences, and
//! the fixed-speed ETA model. Location updates for different partners are
//! independent and never contend on shared locks.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::Config;
use crate::geo::haversine_km;
use crate::models::partner::GeoPoint;
use crate::models::tracking::{
    Geofence, GeofenceKind, LocationUpdate, RoutePoint, SessionStatus, TrackingSession,
};
use crate::observability::metrics::Metrics;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TrackingEvent {
    LocationUpdated {
        partner_id: Uuid,
        location: GeoPoint,
        order_id: Option<Uuid>,
        recorded_at: DateTime<Utc>,
    },
    EtaUpdated {
        partner_id: Uuid,
        order_id: Uuid,
        estimated_delivery_at: DateTime<Utc>,
    },
    GeofenceEntered {
        partner_id: Uuid,
        geofence_id: Uuid,
        name: String,
        kind: GeofenceKind,
        order_id: Option<Uuid>,
    },
    ApproachingPickup {
        partner_id: Uuid,
        order_id: Uuid,
        geofence_id: Uuid,
    },
    ApproachingDelivery {
        partner_id: Uuid,
        order_id: Uuid,
        geofence_id: Uuid,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PartnerPosition {
    pub location: GeoPoint,
    pub updated_at: DateTime<Utc>,
}

pub struct LocationTracker {
    positions: DashMap<Uuid, PartnerPosition>,
    history: DashMap<Uuid, VecDeque<RoutePoint>>,
    sessions: DashMap<(Uuid, Uuid), TrackingSession>,
    geofences: DashMap<Uuid, Geofence>,
    /// Which fences each partner is currently inside; entry events fire on
    /// the outside-to-inside crossing only.
    inside_fences: DashMap<Uuid, HashSet<Uuid>>,
    events_tx: broadcast::Sender<TrackingEvent>,
    config: Config,
    metrics: Arc<Metrics>,
}

impl LocationTracker {
    pub fn new(config: Config, metrics: Arc<Metrics>) -> Arc<Self> {
        let (events_tx, _unused_rx) = broadcast::channel(config.event_buffer_size);

        Arc::new(Self {
            positions: DashMap::new(),
            history: DashMap::new(),
            sessions: DashMap::new(),
            geofences: DashMap::new(),
            inside_fences: DashMap::new(),
            events_tx,
            config,
            metrics,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrackingEvent> {
        self.events_tx.subscribe()
    }

    pub fn add_geofence(&self, geofence: Geofence) {
        self.geofences.insert(geofence.id, geofence);
    }

    pub fn remove_geofence(&self, geofence_id: Uuid) {
        self.geofences.remove(&geofence_id);
    }

    /// Records a partner's latest position: last-known map, bounded history
    /// ring, any active session for the carried order, and geofence
    /// crossings.
    pub fn update_partner_location(&self, update: LocationUpdate) {
        let now = Utc::now();
        let LocationUpdate {
            partner_id,
            location,
            order_id,
        } = update;

        self.positions.insert(
            partner_id,
            PartnerPosition {
                location,
                updated_at: now,
            },
        );

        {
            let mut ring = self.history.entry(partner_id).or_default();
            ring.push_back(RoutePoint {
                location,
                recorded_at: now,
            });
            while ring.len() > self.config.location_history_limit {
                ring.pop_front();
            }
        }

        self.metrics.location_updates_total.inc();
        let _ = self.events_tx.send(TrackingEvent::LocationUpdated {
            partner_id,
            location,
            order_id,
            recorded_at: now,
        });

        if let Some(order_id) = order_id {
            self.extend_session(partner_id, order_id, location, now);
        }

        self.evaluate_geofences(partner_id, location, order_id);
    }

    fn extend_session(
        &self,
        partner_id: Uuid,
        order_id: Uuid,
        location: GeoPoint,
        now: DateTime<Utc>,
    ) {
        let eta = {
            let Some(mut session) = self.sessions.get_mut(&(partner_id, order_id)) else {
                return;
            };
            if !session.is_active() {
                return;
            }

            session.distance_traveled_km += haversine_km(&session.current_location, &location);
            session.current_location = location;
            session.route.push(RoutePoint {
                location,
                recorded_at: now,
            });
            session.status = SessionStatus::InProgress;

            let remaining_km = haversine_km(&location, &session.destination);
            let eta = now
                + chrono::Duration::seconds(
                    (remaining_km / self.config.tracking_speed_kmh * 3600.0) as i64,
                );
            session.estimated_delivery_at = Some(eta);
            eta
        };

        let _ = self.events_tx.send(TrackingEvent::EtaUpdated {
            partner_id,
            order_id,
            estimated_delivery_at: eta,
        });
    }

    fn evaluate_geofences(&self, partner_id: Uuid, location: GeoPoint, order_id: Option<Uuid>) {
        let mut entered: Vec<Geofence> = Vec::new();
        {
            let mut inside = self.inside_fences.entry(partner_id).or_default();
            for fence in self.geofences.iter() {
                let radius_km = fence.radius_m / 1000.0;
                let is_inside = haversine_km(&fence.center, &location) <= radius_km;

                if is_inside && inside.insert(fence.id) {
                    entered.push(fence.value().clone());
                } else if !is_inside {
                    inside.remove(&fence.id);
                }
            }
        }

        for fence in entered {
            self.metrics
                .geofence_events_total
                .with_label_values(&[kind_label(fence.kind)])
                .inc();
            debug!(
                partner_id = %partner_id,
                geofence = %fence.name,
                kind = ?fence.kind,
                "geofence entered"
            );
            let _ = self.events_tx.send(TrackingEvent::GeofenceEntered {
                partner_id,
                geofence_id: fence.id,
                name: fence.name.clone(),
                kind: fence.kind,
                order_id,
            });

            if let Some(order_id) = order_id {
                match fence.kind {
                    GeofenceKind::Pickup => {
                        let _ = self.events_tx.send(TrackingEvent::ApproachingPickup {
                            partner_id,
                            order_id,
                            geofence_id: fence.id,
                        });
                    }
                    GeofenceKind::Delivery => {
                        let _ = self.events_tx.send(TrackingEvent::ApproachingDelivery {
                            partner_id,
                            order_id,
                            geofence_id: fence.id,
                        });
                    }
                    _ => {}
                }
            }
        }
    }

    pub fn start_session(
        &self,
        partner_id: Uuid,
        order_id: Uuid,
        start_location: GeoPoint,
        destination: GeoPoint,
    ) -> TrackingSession {
        let now = Utc::now();
        let initial_eta = now
            + chrono::Duration::seconds(
                (haversine_km(&start_location, &destination) / self.config.tracking_speed_kmh
                    * 3600.0) as i64,
            );

        let session = TrackingSession {
            partner_id,
            order_id,
            start_location,
            current_location: start_location,
            destination,
            route: vec![RoutePoint {
                location: start_location,
                recorded_at: now,
            }],
            started_at: now,
            estimated_delivery_at: Some(initial_eta),
            distance_traveled_km: 0.0,
            status: SessionStatus::Started,
            completed_at: None,
        };

        self.sessions.insert((partner_id, order_id), session.clone());
        self.metrics
            .active_tracking_sessions
            .set(self.sessions.len() as i64);
        info!(partner_id = %partner_id, order_id = %order_id, "tracking session started");
        session
    }

    /// Seals the session and removes it from the live map. The returned
    /// value is the historical copy for the caller to archive.
    pub fn complete_session(&self, partner_id: Uuid, order_id: Uuid) -> Option<TrackingSession> {
        self.finish_session(partner_id, order_id, SessionStatus::Completed)
    }

    pub fn cancel_session(&self, partner_id: Uuid, order_id: Uuid) -> Option<TrackingSession> {
        self.finish_session(partner_id, order_id, SessionStatus::Cancelled)
    }

    fn finish_session(
        &self,
        partner_id: Uuid,
        order_id: Uuid,
        status: SessionStatus,
    ) -> Option<TrackingSession> {
        let (_, mut session) = self.sessions.remove(&(partner_id, order_id))?;
        session.status = status;
        session.completed_at = Some(Utc::now());

        self.metrics
            .active_tracking_sessions
            .set(self.sessions.len() as i64);
        info!(
            partner_id = %partner_id,
            order_id = %order_id,
            distance_km = session.distance_traveled_km,
            status = ?status,
            "tracking session finished"
        );
        Some(session)
    }

    pub fn session(&self, partner_id: Uuid, order_id: Uuid) -> Option<TrackingSession> {
        self.sessions
            .get(&(partner_id, order_id))
            .map(|entry| entry.value().clone())
    }

    pub fn partner_location(&self, partner_id: Uuid) -> Option<PartnerPosition> {
        self.positions.get(&partner_id).map(|entry| *entry.value())
    }

    pub fn partner_history(&self, partner_id: Uuid) -> Vec<RoutePoint> {
        self.history
            .get(&partner_id)
            .map(|ring| ring.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Partners with a location update inside the active window.
    pub fn active_partners(&self) -> Vec<Uuid> {
        let cutoff = Utc::now() - chrono::Duration::seconds(self.config.active_window_secs);
        self.positions
            .iter()
            .filter(|entry| entry.updated_at >= cutoff)
            .map(|entry| *entry.key())
            .collect()
    }

    /// Prunes stale history and drops partners with no recent update from
    /// the live position map.
    pub fn run_maintenance(&self) {
        let now = Utc::now();
        let history_cutoff = now - chrono::Duration::hours(self.config.history_retention_hours);
        let active_cutoff = now - chrono::Duration::seconds(self.config.active_window_secs);

        for mut ring in self.history.iter_mut() {
            while ring
                .front()
                .is_some_and(|point| point.recorded_at < history_cutoff)
            {
                ring.pop_front();
            }
        }
        self.history.retain(|_, ring| !ring.is_empty());

        let before = self.positions.len();
        self.positions
            .retain(|_, position| position.updated_at >= active_cutoff);
        let dropped = before - self.positions.len();
        if dropped > 0 {
            debug!(dropped = dropped, "inactive partners dropped from live view");
        }
    }
}

fn kind_label(kind: GeofenceKind) -> &'static str {
    match kind {
        GeofenceKind::Pickup => "pickup",
        GeofenceKind::Delivery => "delivery",
        GeofenceKind::Campus => "campus",
        GeofenceKind::Restricted => "restricted",
    }
}

/// Periodic upkeep, meant to be spawned next to the orchestrator.
pub async fn run_maintenance_loop(tracker: Arc<LocationTracker>) {
    let period = tokio::time::Duration::from_secs(tracker.config.maintenance_interval_secs);
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!(period_secs = period.as_secs(), "tracking maintenance loop started");
    loop {
        interval.tick().await;
        tracker.run_maintenance();
    }
}
