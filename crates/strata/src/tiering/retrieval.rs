//! Retrieval enhancer
//!
//! Re-weights an already ranked candidate list by tier. The upstream ranking
//! is never recomputed; it only contributes a similarity per position. A
//! query category routes to a preferred tier order, which breaks score ties.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::layer::LayerManager;
use crate::config::{ConfigManager, TieringConfig};
use crate::error::{Result, StrataError};
use crate::memory::types::Tier;
use crate::storage::MemoryStore;

/// Context accompanying a retrieval request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryContext {
    /// Query text, kept for diagnostics
    pub query: String,
    /// Coarse query category used for tier routing
    pub query_kind: Option<String>,
    /// Similarity per candidate, aligned with the candidate list. When
    /// absent, similarity is derived from the rank.
    pub similarity_scores: Option<Vec<f32>>,
}

impl QueryContext {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.query_kind = Some(kind.into());
        self
    }

    pub fn with_similarities(mut self, scores: Vec<f32>) -> Self {
        self.similarity_scores = Some(scores);
        self
    }
}

/// A candidate after tier re-weighting
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedCandidate {
    pub memory_id: String,
    /// `None` only on the pass-through path, when tiering was unavailable
    pub tier: Option<Tier>,
    pub similarity: f32,
    pub tier_weight: f32,
    pub score: f32,
}

pub struct RetrievalEnhancer {
    config: Arc<ConfigManager>,
    layers: Arc<LayerManager>,
    records: Arc<dyn MemoryStore>,
}

impl RetrievalEnhancer {
    pub fn new(
        config: Arc<ConfigManager>,
        layers: Arc<LayerManager>,
        records: Arc<dyn MemoryStore>,
    ) -> Self {
        Self {
            config,
            layers,
            records,
        }
    }

    /// Preferred tier search order for a query category. Unknown categories
    /// search the whole ladder top-down.
    pub fn smart_tier_selection(&self, query_kind: &str) -> Vec<Tier> {
        let config = self.config.snapshot();
        config
            .retrieval
            .routes
            .get(query_kind)
            .cloned()
            .unwrap_or_else(|| config.tier_order())
    }

    /// Re-rank candidates by `similarity * tier retrieval weight`
    ///
    /// Equal scores are ordered by the tier route of `context.query_kind`,
    /// tiers outside the route last; remaining ties keep their upstream
    /// order. Candidates without an assignment get one from their record's
    /// weight.
    pub async fn enhance_retrieval(
        &self,
        ids: &[String],
        context: &QueryContext,
    ) -> Result<Vec<RankedCandidate>> {
        if let Some(ref scores) = context.similarity_scores {
            if scores.len() != ids.len() {
                return Err(StrataError::InvalidInput(format!(
                    "Got {} similarity scores for {} candidates",
                    scores.len(),
                    ids.len()
                )));
            }
        }

        let config = self.config.snapshot();
        let total = ids.len();
        let mut ranked = Vec::with_capacity(total);

        for (rank, id) in ids.iter().enumerate() {
            let similarity = match context.similarity_scores {
                Some(ref scores) => scores[rank],
                None => rank_similarity(rank, total),
            };
            let tier = self.resolve_tier(&config, id).await?;
            let tier_weight = config.tier(&tier).map_or(1.0, |t| t.retrieval_weight);

            ranked.push(RankedCandidate {
                memory_id: id.clone(),
                tier: Some(tier),
                similarity,
                tier_weight,
                score: similarity * tier_weight,
            });
        }

        let route = context
            .query_kind
            .as_deref()
            .map(|kind| self.smart_tier_selection(kind))
            .unwrap_or_default();
        let route_rank = |tier: &Option<Tier>| {
            tier.as_ref()
                .and_then(|t| route.iter().position(|r| r == t))
                .unwrap_or(route.len())
        };

        // sort_by is stable: full ties keep upstream order
        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| route_rank(&a.tier).cmp(&route_rank(&b.tier)))
        });
        debug!(
            candidates = total,
            kind = context.query_kind.as_deref().unwrap_or("-"),
            "Re-ranked candidates"
        );
        Ok(ranked)
    }

    /// Keep ids whose tier is in `allowed`, preserving order. Unassigned ids
    /// count as the lowest tier.
    pub async fn filter_by_tier(&self, ids: &[String], allowed: &[Tier]) -> Result<Vec<String>> {
        let config = self.config.snapshot();
        let fallback = config.lowest_tier().map(|t| t.name.clone());

        let mut kept = Vec::new();
        for id in ids {
            let tier = match self.layers.find_assignment(id).await? {
                Some(assignment) => Some(assignment.tier),
                None => fallback.clone(),
            };
            if tier.is_some_and(|t| allowed.contains(&t)) {
                kept.push(id.clone());
            }
        }
        Ok(kept)
    }

    async fn resolve_tier(&self, config: &TieringConfig, id: &str) -> Result<Tier> {
        if let Some(assignment) = self.layers.find_assignment(id).await? {
            return Ok(assignment.tier);
        }

        let lowest = config
            .lowest_tier()
            .map(|t| t.name.clone())
            .ok_or_else(|| StrataError::ConfigInvalid("No tiers configured".to_string()))?;

        let Some(record) = self.records.get(id).await? else {
            return Ok(lowest);
        };
        match self.layers.ensure_assignment(id, record.weight).await {
            Ok(assignment) => Ok(assignment.tier),
            Err(StrataError::InvalidWeight(weight)) => {
                debug!(memory_id = id, weight, "Record weight out of range, ranking as lowest tier");
                Ok(lowest)
            }
            Err(e) => Err(e),
        }
    }
}

/// Similarity implied by a position in an upstream ranking: 1.0 for the
/// first candidate, decreasing linearly
fn rank_similarity(rank: usize, total: usize) -> f32 {
    if total == 0 {
        return 0.0;
    }
    1.0 - rank as f32 / total as f32
}
