//! Weighted partner scoring. Every sub-score is normalized to [0, 1]; the
//! named strategies differ only in how the four are weighted.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::models::partner::Partner;

const ONLINE_WEIGHT: f64 = 0.5;
const ACTIVE_WEIGHT: f64 = 0.3;
const RECENT_UPDATE_WEIGHT: f64 = 0.2;

/// Experience saturates near 100 lifetime deliveries.
const EXPERIENCE_SATURATION: f64 = 101.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScoringStrategy {
    Balanced,
    DistanceFirst,
    QualityFirst,
}

#[derive(Debug, Clone, Copy)]
pub struct ScoreWeights {
    pub distance: f64,
    pub rating: f64,
    pub experience: f64,
    pub availability: f64,
}

impl ScoringStrategy {
    pub fn weights(&self) -> ScoreWeights {
        match self {
            ScoringStrategy::Balanced => ScoreWeights {
                distance: 0.4,
                rating: 0.3,
                experience: 0.2,
                availability: 0.1,
            },
            ScoringStrategy::DistanceFirst => ScoreWeights {
                distance: 0.7,
                rating: 0.15,
                experience: 0.1,
                availability: 0.05,
            },
            ScoringStrategy::QualityFirst => ScoreWeights {
                distance: 0.2,
                rating: 0.5,
                experience: 0.25,
                availability: 0.05,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub distance_score: f64,
    pub rating_score: f64,
    pub experience_score: f64,
    pub availability_score: f64,
}

pub fn compute_score(
    partner: &Partner,
    distance_km: f64,
    max_distance_km: f64,
    strategy: ScoringStrategy,
    now: DateTime<Utc>,
) -> (f64, ScoreBreakdown) {
    let breakdown = ScoreBreakdown {
        distance_score: distance_score(distance_km, max_distance_km),
        rating_score: rating_score(partner.rating),
        experience_score: experience_score(partner.total_deliveries),
        availability_score: availability_score(partner, now),
    };

    let weights = strategy.weights();
    let score = breakdown.distance_score * weights.distance
        + breakdown.rating_score * weights.rating
        + breakdown.experience_score * weights.experience
        + breakdown.availability_score * weights.availability;

    (score, breakdown)
}

/// Linear in remaining range; a partner right at the edge scores 0.
pub fn distance_score(distance_km: f64, max_distance_km: f64) -> f64 {
    if max_distance_km <= 0.0 {
        return 0.0;
    }
    ((max_distance_km - distance_km) / max_distance_km).max(0.0)
}

pub fn rating_score(rating: f64) -> f64 {
    ((rating - 1.0) / 4.0).clamp(0.0, 1.0)
}

/// Diminishing returns on lifetime deliveries.
pub fn experience_score(total_deliveries: u32) -> f64 {
    ((total_deliveries as f64 + 1.0).ln() / EXPERIENCE_SATURATION.ln()).min(1.0)
}

pub fn availability_score(partner: &Partner, now: DateTime<Utc>) -> f64 {
    let mut score = 0.0;
    if partner.online {
        score += ONLINE_WEIGHT;
    }
    if partner.active {
        score += ACTIVE_WEIGHT;
    }
    if now - partner.updated_at <= Duration::hours(1) {
        score += RECENT_UPDATE_WEIGHT;
    }
    score
}
