//! Plan cache: goal signature to step decomposition.
//!
//! A lookup first tries the exact canonical signature, then the most
//! similar stored signature by token Jaccard similarity at or above the
//! configured threshold. Ties go to the lexicographically smallest
//! signature. Lookups never fail: a storage error counts as a miss, so
//! `hits + misses == lookups` always holds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use patchloop_state::{PlanEntry, PlanStore, StorageResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::domain::{GoalSignature, StepPlan};
use crate::metrics::Metrics;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanCacheConfig {
    /// Minimum Jaccard similarity for a near match.
    pub similarity_threshold: f64,
    /// Downstream failures after which an entry is evicted.
    pub evict_after_failures: u32,
}

impl Default for PlanCacheConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.85,
            evict_after_failures: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit {
    /// Signature of the stored entry, which may differ from the lookup key
    /// on a near match.
    pub signature: GoalSignature,
    pub similarity: f64,
    pub plan: StepPlan,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub lookups: u64,
    pub hits: u64,
    pub misses: u64,
}

pub struct PlanCache {
    store: Arc<dyn PlanStore>,
    config: PlanCacheConfig,
    metrics: Arc<Metrics>,
    writer: tokio::sync::Mutex<()>,
    lookups: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PlanCache {
    pub fn new(store: Arc<dyn PlanStore>, config: PlanCacheConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            config,
            metrics,
            writer: tokio::sync::Mutex::new(()),
            lookups: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            lookups: self.lookups.load(Ordering::SeqCst),
            hits: self.hits.load(Ordering::SeqCst),
            misses: self.misses.load(Ordering::SeqCst),
        }
    }

    #[instrument(skip(self), fields(signature = %signature))]
    pub async fn lookup(&self, signature: &GoalSignature) -> Option<CacheHit> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let found = match self.find(signature).await {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "plan store lookup failed; treating as miss");
                None
            }
        };
        match &found {
            Some(hit) => {
                self.hits.fetch_add(1, Ordering::SeqCst);
                self.metrics.inc_cache_hit();
                info!(matched = %hit.signature, similarity = hit.similarity, "plan cache hit");
            }
            None => {
                self.misses.fetch_add(1, Ordering::SeqCst);
                self.metrics.inc_cache_miss();
                debug!("plan cache miss");
            }
        }
        found
    }

    async fn find(&self, signature: &GoalSignature) -> StorageResult<Option<CacheHit>> {
        if let Some(entry) = self.store.get(signature.as_str()).await? {
            if let Some(plan) = decode(&entry) {
                return Ok(Some(CacheHit {
                    signature: signature.clone(),
                    similarity: 1.0,
                    plan,
                }));
            }
        }

        let mut best: Option<(f64, PlanEntry)> = None;
        // list() is ordered by signature, so strict `>` keeps the smallest on ties
        for entry in self.store.list().await? {
            let similarity = signature.similarity(&GoalSignature::from(entry.signature.clone()));
            if similarity < self.config.similarity_threshold {
                continue;
            }
            if best.as_ref().map_or(true, |(s, _)| similarity > *s) {
                best = Some((similarity, entry));
            }
        }
        Ok(best.and_then(|(similarity, entry)| {
            decode(&entry).map(|plan| CacheHit {
                signature: GoalSignature::from(entry.signature),
                similarity,
                plan,
            })
        }))
    }

    /// Store `plan` (reset to pending) under `signature`.
    pub async fn store(
        &self,
        signature: &GoalSignature,
        goal_text: &str,
        plan: &StepPlan,
    ) -> StorageResult<()> {
        let steps = serde_json::to_value(plan.fresh())?;
        let _guard = self.writer.lock().await;
        self.store
            .put(PlanEntry::new(signature.as_str(), goal_text, steps))
            .await
    }

    /// Count a downstream failure against an entry; evicts it once the
    /// threshold is reached. Returns whether it was evicted.
    pub async fn record_failure(&self, signature: &GoalSignature) -> StorageResult<bool> {
        let _guard = self.writer.lock().await;
        let Some(mut entry) = self.store.get(signature.as_str()).await? else {
            return Ok(false);
        };
        entry.failures += 1;
        if entry.failures >= self.config.evict_after_failures {
            info!(signature = %signature, failures = entry.failures, "evicting plan");
            self.store.remove(signature.as_str()).await?;
            return Ok(true);
        }
        self.store.put(entry).await?;
        Ok(false)
    }

    /// Reset an entry's failure count after it led to a success.
    pub async fn record_success(&self, signature: &GoalSignature) -> StorageResult<()> {
        let _guard = self.writer.lock().await;
        if let Some(mut entry) = self.store.get(signature.as_str()).await? {
            if entry.failures > 0 {
                entry.failures = 0;
                self.store.put(entry).await?;
            }
        }
        Ok(())
    }
}

fn decode(entry: &PlanEntry) -> Option<StepPlan> {
    match serde_json::from_value::<StepPlan>(entry.steps.clone()) {
        Ok(plan) => Some(plan.fresh()),
        Err(e) => {
            warn!(signature = %entry.signature, error = %e, "cached plan does not decode");
            None
        }
    }
}
