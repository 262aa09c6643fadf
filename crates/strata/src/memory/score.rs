//! Promotion score calculation
//!
//! The promotion score decides which records climb the ladder, which ones are
//! protected from expiry, and which ones are pushed down first when a tier is
//! over capacity. It combines three components:
//! - how often the record has been used (logarithmic, saturating)
//! - how recently it was used (linear decay over the tier's retention window)
//! - where its weight sits inside the tier's weight band

use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use crate::config::{ScoringConfig, TierConfig};
use crate::memory::types::TierAssignment;

/// Normalize an access count to [0, 1] with diminishing returns
///
/// Formula: ln(1 + count) / ln(1 + saturation), capped at 1.0
pub fn normalize_access(access_count: u32, saturation: u32) -> f32 {
    let saturation = saturation.max(1) as f32;
    ((access_count as f32).ln_1p() / saturation.ln_1p()).clamp(0.0, 1.0)
}

/// Linear recency decay: 1.0 when just accessed, 0.0 once the retention
/// window has fully elapsed
pub fn recency_factor(
    last_accessed: DateTime<Utc>,
    retention_days: u32,
    now: DateTime<Utc>,
) -> f32 {
    if retention_days == 0 {
        return 0.0;
    }
    let elapsed_secs = (now - last_accessed).num_seconds().max(0) as f32;
    let window_secs = retention_days as f32 * 86_400.0;
    (1.0 - elapsed_secs / window_secs).clamp(0.0, 1.0)
}

/// Position of a weight inside a tier's band, 0.0 at the floor and 1.0 at the
/// ceiling
pub fn band_position(weight: f32, tier: &TierConfig) -> f32 {
    ((weight - tier.min_weight) / tier.band_width()).clamp(0.0, 1.0)
}

/// Calculate the promotion score of an assignment relative to its tier
///
/// Formula: w_access * normalize(access_count)
///        + w_recency * recency_factor(last_accessed)
///        + w_weight * band_position(weight)
pub fn promotion_score(
    assignment: &TierAssignment,
    tier: &TierConfig,
    scoring: &ScoringConfig,
    now: DateTime<Utc>,
) -> f32 {
    let access = normalize_access(assignment.access_count, scoring.access_saturation);
    let recency = recency_factor(assignment.last_accessed, tier.retention_days, now);
    let position = band_position(assignment.weight, tier);

    scoring.access_weight * access
        + scoring.recency_weight * recency
        + scoring.importance_weight * position
}

/// Whether the assignment has gone unused for longer than its tier retains
pub fn is_past_retention(assignment: &TierAssignment, tier: &TierConfig, now: DateTime<Utc>) -> bool {
    let retention = chrono::Duration::days(i64::from(tier.retention_days));
    assignment.last_accessed + retention <= now
}

/// Selection order for demotion and eviction: lowest score first, then lowest
/// weight, then least recently accessed
pub fn weakest_first(a: &(TierAssignment, f32), b: &(TierAssignment, f32)) -> Ordering {
    a.1.total_cmp(&b.1)
        .then_with(|| a.0.weight.total_cmp(&b.0.weight))
        .then_with(|| a.0.last_accessed.cmp(&b.0.last_accessed))
}
