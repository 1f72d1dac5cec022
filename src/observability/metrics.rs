use prometheus::{
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub transitions_total: IntCounterVec,
    pub timer_firings_total: IntCounterVec,
    pub armed_timers: IntGauge,
    pub dispatches_created_total: IntCounter,
    pub dispatch_accepts_total: IntCounterVec,
    pub assignment_latency_seconds: HistogramVec,
    pub location_updates_total: IntCounter,
    pub geofence_events_total: IntCounterVec,
    pub active_tracking_sessions: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let transitions_total = IntCounterVec::new(
            Opts::new("transitions_total", "Workflow transitions by outcome"),
            &["outcome"],
        )
        .expect("valid transitions_total metric");

        let timer_firings_total = IntCounterVec::new(
            Opts::new("timer_firings_total", "Status timeout firings by action"),
            &["action"],
        )
        .expect("valid timer_firings_total metric");

        let armed_timers = IntGauge::new("armed_timers", "Currently armed order timeouts")
            .expect("valid armed_timers metric");

        let dispatches_created_total = IntCounter::new(
            "dispatches_created_total",
            "Broadcast dispatches created",
        )
        .expect("valid dispatches_created_total metric");

        let dispatch_accepts_total = IntCounterVec::new(
            Opts::new("dispatch_accepts_total", "Dispatch acceptance attempts by outcome"),
            &["outcome"],
        )
        .expect("valid dispatch_accepts_total metric");

        let assignment_latency_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "assignment_latency_seconds",
                "Latency of best-partner assignment in seconds",
            ),
            &["outcome"],
        )
        .expect("valid assignment_latency_seconds metric");

        let location_updates_total =
            IntCounter::new("location_updates_total", "Partner location pings processed")
                .expect("valid location_updates_total metric");

        let geofence_events_total = IntCounterVec::new(
            Opts::new("geofence_events_total", "Geofence entry events by fence kind"),
            &["kind"],
        )
        .expect("valid geofence_events_total metric");

        let active_tracking_sessions = IntGauge::new(
            "active_tracking_sessions",
            "Live delivery tracking sessions",
        )
        .expect("valid active_tracking_sessions metric");

        registry
            .register(Box::new(transitions_total.clone()))
            .expect("register transitions_total");
        registry
            .register(Box::new(timer_firings_total.clone()))
            .expect("register timer_firings_total");
        registry
            .register(Box::new(armed_timers.clone()))
            .expect("register armed_timers");
        registry
            .register(Box::new(dispatches_created_total.clone()))
            .expect("register dispatches_created_total");
        registry
            .register(Box::new(dispatch_accepts_total.clone()))
            .expect("register dispatch_accepts_total");
        registry
            .register(Box::new(assignment_latency_seconds.clone()))
            .expect("register assignment_latency_seconds");
        registry
            .register(Box::new(location_updates_total.clone()))
            .expect("register location_updates_total");
        registry
            .register(Box::new(geofence_events_total.clone()))
            .expect("register geofence_events_total");
        registry
            .register(Box::new(active_tracking_sessions.clone()))
            .expect("register active_tracking_sessions");

        Self {
            registry,
            transitions_total,
            timer_firings_total,
            armed_timers,
            dispatches_created_total,
            dispatch_accepts_total,
            assignment_latency_seconds,
            location_updates_total,
            geofence_events_total,
            active_tracking_sessions,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
