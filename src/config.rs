use std::env;

use crate::error::OrchestratorError;

/// Runtime knobs for the orchestration core. Workflow timeouts are part of
/// the transition table (see `workflow::rules`), not the config.
#[derive(Debug, Clone)]
pub struct Config {
    pub event_buffer_size: usize,
    /// How long a broadcast dispatch stays open for acceptance.
    pub dispatch_expiry_secs: u64,
    /// How long a settled dispatch record lingers before it is dropped.
    pub dispatch_grace_secs: u64,
    pub initial_search_radius_km: f64,
    pub search_radius_step_km: f64,
    pub max_search_radius_km: f64,
    /// Hard daily delivery cap for priority-class partners.
    pub priority_daily_cap: u32,
    /// Average speed assumed by the live-tracking ETA model.
    pub tracking_speed_kmh: f64,
    pub location_history_limit: usize,
    pub history_retention_hours: i64,
    /// A partner with no location update inside this window drops out of
    /// the active-partner view.
    pub active_window_secs: i64,
    pub maintenance_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            event_buffer_size: 1024,
            dispatch_expiry_secs: 300,
            dispatch_grace_secs: 60,
            initial_search_radius_km: 5.0,
            search_radius_step_km: 5.0,
            max_search_radius_km: 20.0,
            priority_daily_cap: 3,
            tracking_speed_kmh: 15.0,
            location_history_limit: 100,
            history_retention_hours: 24,
            active_window_secs: 3600,
            maintenance_interval_secs: 3600,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, OrchestratorError> {
        let _ = dotenvy::dotenv();
        let defaults = Self::default();

        Ok(Self {
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", defaults.event_buffer_size)?,
            dispatch_expiry_secs: parse_or_default(
                "DISPATCH_EXPIRY_SECS",
                defaults.dispatch_expiry_secs,
            )?,
            dispatch_grace_secs: parse_or_default(
                "DISPATCH_GRACE_SECS",
                defaults.dispatch_grace_secs,
            )?,
            initial_search_radius_km: parse_or_default(
                "INITIAL_SEARCH_RADIUS_KM",
                defaults.initial_search_radius_km,
            )?,
            search_radius_step_km: parse_or_default(
                "SEARCH_RADIUS_STEP_KM",
                defaults.search_radius_step_km,
            )?,
            max_search_radius_km: parse_or_default(
                "MAX_SEARCH_RADIUS_KM",
                defaults.max_search_radius_km,
            )?,
            priority_daily_cap: parse_or_default(
                "PRIORITY_DAILY_CAP",
                defaults.priority_daily_cap,
            )?,
            tracking_speed_kmh: parse_or_default(
                "TRACKING_SPEED_KMH",
                defaults.tracking_speed_kmh,
            )?,
            location_history_limit: parse_or_default(
                "LOCATION_HISTORY_LIMIT",
                defaults.location_history_limit,
            )?,
            history_retention_hours: parse_or_default(
                "HISTORY_RETENTION_HOURS",
                defaults.history_retention_hours,
            )?,
            active_window_secs: parse_or_default(
                "ACTIVE_WINDOW_SECS",
                defaults.active_window_secs,
            )?,
            maintenance_interval_secs: parse_or_default(
                "MAINTENANCE_INTERVAL_SECS",
                defaults.maintenance_interval_secs,
            )?,
        })
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, OrchestratorError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| OrchestratorError::Config(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}
