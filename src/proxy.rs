//! MCC Proxy Module
//!
//! Orchestrates one read or invalidation against the consistent cache, the
//! database and the cache store. A read is planned against the index without
//! mutating it, applied to the cache store in a single batch, and only then
//! committed to the index, so a failed collaborator call leaves the index as it
//! was.

use crate::cache_connector::CacheConnector;
use crate::cache_types::{CacheOpResult, ItemRecord, Version};
use crate::config::{CacheConfig, VersionSelectionPolicy};
use crate::consistent_cache::{ConsistentCache, ConsistentCacheStats};
use crate::db_connector::DbConnector;
use crate::metrics::ProxyMetrics;
use crate::predictor::ObsoleteItemsPredictor;
use crate::access_tracker::RawFeature;
use crate::{ProxyError, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a read will do to the index and the cache store, decided before any write
#[derive(Debug, Default)]
struct ReadPlan {
    hit: Vec<String>,
    outdated: Vec<String>,
    fetched: Vec<ItemRecord>,
    evict: Vec<String>,
    full_hit: bool,
    flip_phase: bool,
    obsolete_evictions: usize,
    lru_evictions: usize,
}

/// Cache proxy serving multi-key reads under Monotonic Cache Consistency
pub struct MccProxy {
    cache: ConsistentCache,
    db: Arc<dyn DbConnector>,
    store: Arc<dyn CacheConnector>,
    predictor: Arc<dyn ObsoleteItemsPredictor>,
    metrics: Arc<ProxyMetrics>,
    table: String,
    policy: VersionSelectionPolicy,
    time_step: u64,
    /// Last version returned per key; only kept when monotonic reads are verified
    last_read_versions: Option<HashMap<String, Version>>,
}

impl MccProxy {
    pub fn new(
        config: &CacheConfig,
        policy: VersionSelectionPolicy,
        db: Arc<dyn DbConnector>,
        store: Arc<dyn CacheConnector>,
        predictor: Arc<dyn ObsoleteItemsPredictor>,
    ) -> Self {
        info!(
            "Creating MCC proxy: cache_size={} table={} policy={:?} predictor={}",
            config.cache_size,
            config.table,
            policy,
            predictor.name()
        );
        Self {
            cache: ConsistentCache::with_tracker_kind(
                config.cache_size,
                config.access_tracker.kind(),
            ),
            db,
            store,
            predictor,
            metrics: Arc::new(ProxyMetrics::new()),
            table: config.table.clone(),
            policy,
            time_step: 0,
            last_read_versions: config.verify_monotonic_reads.then(HashMap::new),
        }
    }

    /// Connect both collaborators
    pub async fn start(&self) -> Result<()> {
        info!("Starting MCC proxy");
        self.store.connect().await?;
        self.db.connect().await?;
        Ok(())
    }

    /// Disconnect both collaborators; both are attempted even if the first fails
    pub async fn stop(&self) -> Result<()> {
        info!("Stopping MCC proxy");
        let store_result = self.store.disconnect().await;
        let db_result = self.db.disconnect().await;
        store_result.and(db_result)
    }

    pub fn metrics(&self) -> Arc<ProxyMetrics> {
        self.metrics.clone()
    }

    pub fn cache(&self) -> &ConsistentCache {
        &self.cache
    }

    pub fn cache_stats(&self) -> ConsistentCacheStats {
        self.cache.stats()
    }

    pub fn time_step(&self) -> u64 {
        self.time_step
    }

    /// Read `keys` and return one record per key found, cached hits first.
    ///
    /// Duplicate keys are served once. Keys that exist neither in the cache nor in
    /// the database are absent from the result.
    pub async fn process_read(&mut self, keys: &[String]) -> Result<Vec<ItemRecord>> {
        self.metrics.record_read_request();
        let keys = dedup_keys(keys);
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        self.time_step += 1;
        let time_step = self.time_step;
        debug!(time_step, keys = keys.len(), "Processing read");

        let plan = self.plan_read(&keys, time_step).await?;

        let results = self
            .store
            .batch_execute(&plan.hit, &plan.evict, &plan.fetched)
            .await?;
        let expected = plan.hit.len() + plan.evict.len() + plan.fetched.len();
        if results.len() != expected {
            return Err(ProxyError::CacheStoreError(format!(
                "Cache store returned {} results for {} operations",
                results.len(),
                expected
            )));
        }
        let hit_values = hit_values(&plan.hit, &results[..plan.hit.len()])?;

        self.commit(&keys, &plan, time_step);

        let lost: Vec<String> = plan
            .hit
            .iter()
            .zip(&hit_values)
            .filter(|(_, value)| value.is_none())
            .map(|(key, _)| key.clone())
            .collect();
        if !lost.is_empty() {
            // The store dropped values the index still tracks; forget them so the
            // next read goes to the database
            for key in &lost {
                self.cache.evict(key);
            }
            return Err(ProxyError::CacheStoreError(format!(
                "Cache store lost values for {:?}",
                lost
            )));
        }

        let mut response = Vec::with_capacity(plan.hit.len() + plan.fetched.len());
        for (key, value) in plan.hit.iter().zip(hit_values) {
            let version = self.cache.item_version(key).unwrap_or_default();
            response.push(ItemRecord::new(key.clone(), value.unwrap_or_default(), version));
        }
        response.extend(plan.fetched);

        self.verify_monotonic(&response)?;
        Ok(response)
    }

    /// Apply an invalidation of `keys` at `new_version`
    pub async fn process_invalidation(
        &mut self,
        keys: &[String],
        new_version: Version,
    ) -> Result<bool> {
        self.metrics.record_invalidation_request();
        self.time_step += 1;
        for key in keys {
            self.cache.invalidate(key, new_version);
            self.cache.record_write(key, self.time_step);
        }
        debug!(
            "Invalidated {} keys at {}; watermark {}",
            keys.len(),
            new_version,
            self.cache.max_invalidation_timestamp()
        );
        Ok(true)
    }

    async fn plan_read(&self, keys: &[String], time_step: u64) -> Result<ReadPlan> {
        let mut plan = ReadPlan::default();
        let mut missing = Vec::new();

        if self.cache.is_mcc_hit(keys) {
            plan.hit = keys.to_vec();
            plan.full_hit = true;
            debug!("MCC hit for {} keys", keys.len());
        } else {
            let triage = self.cache.make_mcc_hit(keys);
            missing = triage.missing_items;
            plan.outdated = triage.outdated_items;
            plan.hit = triage.hit_items;
            debug!(
                "Triage: missing={} outdated={} hit={}",
                missing.len(),
                plan.outdated.len(),
                plan.hit.len()
            );
        }

        let mut gap = missing;
        gap.extend(plan.outdated.iter().cloned());
        if !gap.is_empty() {
            plan.fetched = self.db.batch_select(&self.table, &gap).await?;
            self.metrics.record_db_read(gap.len());
        }

        if !plan.hit.is_empty() {
            self.reconcile_race(keys, &mut plan).await?;
        }

        if !plan.hit.is_empty() && plan.hit.len() == keys.len() {
            self.metrics.record_mcc_hit(keys.len());
        }

        self.plan_evictions(keys, &mut plan, time_step).await;
        Ok(plan)
    }

    /// Cached hits may predate writes the watermark does not cover yet when the
    /// database hands back a newer version; re-read the whole batch in that case.
    async fn reconcile_race(&self, keys: &[String], plan: &mut ReadPlan) -> Result<()> {
        let max_items_version = plan
            .fetched
            .iter()
            .map(|item| item.version)
            .chain(plan.hit.iter().filter_map(|key| self.cache.item_version(key)))
            .max()
            .unwrap_or(0);
        let watermark = self.cache.max_invalidation_timestamp();
        if max_items_version <= watermark {
            return Ok(());
        }

        match self.policy {
            VersionSelectionPolicy::Eager => {
                info!(
                    "Version race: max item version {} ahead of watermark {}, re-reading {} keys",
                    max_items_version,
                    watermark,
                    keys.len()
                );
                plan.fetched = self.db.batch_select(&self.table, keys).await?;
                self.metrics.record_db_read(keys.len());
                plan.outdated.append(&mut plan.hit);
                plan.full_hit = false;
            }
        }
        Ok(())
    }

    async fn plan_evictions(&self, keys: &[String], plan: &mut ReadPlan, time_step: u64) {
        let fetched_size: u64 = plan.fetched.iter().map(ItemRecord::size).sum();
        let outdated_size = self.cache.get_data_size(&plan.outdated);
        let limit = self.cache.cache_size_limit();
        let projected = (self.cache.cache_size() + fetched_size).saturating_sub(outdated_size);

        let mut freed: u64 = 0;
        if projected > limit {
            let mut needed = projected - limit;
            let mut decided: HashSet<String> =
                plan.hit.iter().chain(plan.outdated.iter()).cloned().collect();

            let marked_by_read: &[String] = if plan.full_hit { keys } else { &[] };
            if self.cache.is_all_marked_after(marked_by_read) {
                plan.flip_phase = true;
                for (key, size) in self.predict_obsolete(&decided, time_step).await {
                    needed = needed.saturating_sub(size);
                    freed += size;
                    decided.insert(key.clone());
                    plan.evict.push(key);
                    plan.obsolete_evictions += 1;
                }
            }

            if needed > 0 {
                let lru = self.cache.get_lru_items(&decided, needed);
                freed += self.cache.get_data_size(&lru);
                plan.lru_evictions = lru.len();
                plan.evict.extend(lru);
            }
            debug!(
                "Eviction: projected={} limit={} obsolete={} lru={}",
                projected, limit, plan.obsolete_evictions, plan.lru_evictions
            );
        }

        // Outdated items the database no longer returns cannot be refreshed
        let fetched_keys: HashSet<&str> = plan.fetched.iter().map(|i| i.key.as_str()).collect();
        let vanished: Vec<String> = plan
            .outdated
            .iter()
            .filter(|key| !fetched_keys.contains(key.as_str()))
            .cloned()
            .collect();
        plan.evict.extend(vanished);

        if projected.saturating_sub(freed) > limit {
            warn!(
                "Cache will exceed its budget: projected {} bytes, freed {}, limit {}",
                projected, freed, limit
            );
            self.metrics.record_size_overshoot();
        }
    }

    /// Candidates the predictor flags as obsolete, with their sizes.
    async fn predict_obsolete(
        &self,
        exclude: &HashSet<String>,
        time_step: u64,
    ) -> Vec<(String, u64)> {
        let candidates = self.cache.obsolete_candidates(exclude, time_step);
        if candidates.is_empty() {
            return Vec::new();
        }
        let features: Vec<RawFeature> = candidates.iter().map(|c| c.feature.clone()).collect();
        let verdicts = match self.predictor.predict(&features).await {
            Ok(verdicts) => verdicts,
            Err(e) => {
                warn!("Obsolescence prediction failed, falling back to LRU: {}", e);
                Vec::new()
            }
        };
        candidates
            .into_iter()
            .zip(verdicts)
            .filter(|(_, obsolete)| *obsolete)
            .map(|(candidate, _)| (candidate.key, candidate.data_size))
            .collect()
    }

    fn commit(&mut self, keys: &[String], plan: &ReadPlan, time_step: u64) {
        if plan.full_hit {
            self.cache.mark_items(keys);
        }
        if plan.flip_phase {
            self.cache.start_new_phase();
        }
        self.cache
            .post_cache_update(&plan.hit, &plan.evict, &plan.fetched);
        self.cache.record_reads(keys, time_step);
        self.metrics
            .record_evictions(plan.obsolete_evictions, plan.lru_evictions);
        debug_assert!(self.cache.validate_consistency().is_ok());
    }

    fn verify_monotonic(&mut self, response: &[ItemRecord]) -> Result<()> {
        let Some(last_read) = self.last_read_versions.as_mut() else {
            return Ok(());
        };
        for item in response {
            if let Some(&previous) = last_read.get(&item.key) {
                if item.version < previous {
                    return Err(ProxyError::InvariantViolation(format!(
                        "Read of {} returned version {} after version {}",
                        item.key, item.version, previous
                    )));
                }
            }
        }
        for item in response {
            last_read.insert(item.key.clone(), item.version);
        }
        Ok(())
    }
}

fn dedup_keys(keys: &[String]) -> Vec<String> {
    let mut seen = HashSet::with_capacity(keys.len());
    keys.iter()
        .filter(|key| seen.insert(key.as_str()))
        .cloned()
        .collect()
}

fn hit_values(hit: &[String], results: &[CacheOpResult]) -> Result<Vec<Option<String>>> {
    hit.iter()
        .zip(results)
        .map(|(key, result)| match result {
            CacheOpResult::Value(value) => Ok(value.clone()),
            other => Err(ProxyError::CacheStoreError(format!(
                "Unexpected cache store result for {}: {:?}",
                key, other
            ))),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_connector::InMemoryCacheStore;
    use crate::db_connector::InMemoryDatabase;
    use crate::predictor::SimpleObsoleteItemsPredictor;
    use async_trait::async_trait;
    use std::sync::Mutex;

    const TABLE: &str = "test";

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn cache_config(cache_size: u64) -> CacheConfig {
        CacheConfig {
            cache_size,
            ..CacheConfig::default()
        }
    }

    struct Fixture {
        proxy: MccProxy,
        db: Arc<InMemoryDatabase>,
        store: Arc<InMemoryCacheStore>,
    }

    fn fixture_with(cache_size: u64, predictor: Arc<dyn ObsoleteItemsPredictor>) -> Fixture {
        let db = Arc::new(InMemoryDatabase::new());
        let store = Arc::new(InMemoryCacheStore::new());
        let proxy = MccProxy::new(
            &cache_config(cache_size),
            VersionSelectionPolicy::Eager,
            db.clone(),
            store.clone(),
            predictor,
        );
        Fixture { proxy, db, store }
    }

    fn fixture(cache_size: u64) -> Fixture {
        fixture_with(cache_size, Arc::new(SimpleObsoleteItemsPredictor))
    }

    /// Answers with a fixed verdict list, or fails
    struct ScriptedPredictor {
        verdicts: Option<Vec<bool>>,
        calls: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl ObsoleteItemsPredictor for ScriptedPredictor {
        async fn predict(&self, features: &[RawFeature]) -> Result<Vec<bool>> {
            self.calls.lock().unwrap().push(features.len());
            self.verdicts
                .clone()
                .ok_or_else(|| ProxyError::PredictorError("model offline".to_string()))
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    /// Database whose rows and versions are set directly by the test
    #[derive(Default)]
    struct ScriptedDb {
        rows: Mutex<HashMap<String, (String, Version)>>,
    }

    impl ScriptedDb {
        fn set(&self, key: &str, value: &str, version: Version) {
            self.rows
                .lock()
                .unwrap()
                .insert(key.to_string(), (value.to_string(), version));
        }

        fn delete(&self, key: &str) {
            self.rows.lock().unwrap().remove(key);
        }
    }

    #[async_trait]
    impl DbConnector for ScriptedDb {
        async fn connect(&self) -> Result<()> {
            Ok(())
        }

        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }

        async fn batch_select(&self, _table: &str, keys: &[String]) -> Result<Vec<ItemRecord>> {
            let rows = self.rows.lock().unwrap();
            Ok(keys
                .iter()
                .filter_map(|key| {
                    rows.get(key)
                        .map(|(value, version)| ItemRecord::new(key.clone(), value.clone(), *version))
                })
                .collect())
        }
    }

    fn scripted_proxy(verify_monotonic_reads: bool) -> (MccProxy, Arc<ScriptedDb>) {
        let db = Arc::new(ScriptedDb::default());
        let config = CacheConfig {
            verify_monotonic_reads,
            ..CacheConfig::default()
        };
        let proxy = MccProxy::new(
            &config,
            VersionSelectionPolicy::Eager,
            db.clone(),
            Arc::new(InMemoryCacheStore::new()),
            Arc::new(SimpleObsoleteItemsPredictor),
        );
        (proxy, db)
    }

    #[tokio::test]
    async fn test_empty_read_touches_nothing() {
        let mut f = fixture(100);
        assert!(f.proxy.process_read(&[]).await.unwrap().is_empty());
        assert_eq!(f.db.select_count(), 0);
        assert_eq!(f.store.transaction_count(), 0);
        assert_eq!(f.proxy.time_step(), 0);
    }

    #[tokio::test]
    async fn test_miss_then_mcc_hit() {
        let mut f = fixture(100);
        let version = f.db.write_batch(TABLE, &[("a", "1"), ("b", "2")]).unwrap();
        f.proxy.process_invalidation(&keys(&["a", "b"]), version).await.unwrap();

        let first = f.proxy.process_read(&keys(&["a", "b", "a"])).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(f.store.get("a"), Some("1".to_string()));

        let second = f.proxy.process_read(&keys(&["b", "a"])).await.unwrap();
        assert_eq!(
            second,
            vec![ItemRecord::new("b", "2", version), ItemRecord::new("a", "1", version)]
        );

        let snapshot = f.proxy.metrics().snapshot();
        assert_eq!(snapshot.db_reads, 1);
        assert_eq!(snapshot.db_read_items, 2);
        assert_eq!(snapshot.mcc_hits, 1);
        assert_eq!(snapshot.mcc_hit_items, 2);
    }

    #[tokio::test]
    async fn test_version_race_rereads_whole_batch() {
        let mut f = fixture(100);
        let v1 = f.db.write(TABLE, "key1", "1").unwrap();
        f.proxy.process_invalidation(&keys(&["key1"]), v1).await.unwrap();
        f.proxy.process_read(&keys(&["key1"])).await.unwrap();

        // key2 is written but its invalidation has not arrived
        let v2 = f.db.write(TABLE, "key2", "2").unwrap();
        let items = f.proxy.process_read(&keys(&["key1", "key2"])).await.unwrap();
        assert_eq!(
            items,
            vec![ItemRecord::new("key1", "1", v1), ItemRecord::new("key2", "2", v2)]
        );

        let snapshot = f.proxy.metrics().snapshot();
        assert_eq!(snapshot.db_reads, 3);
        assert_eq!(snapshot.db_read_items, 4);
        assert_eq!(snapshot.mcc_hits, 0);
    }

    #[tokio::test]
    async fn test_lru_eviction_keeps_cache_within_budget() {
        let mut f = fixture(20);
        for key in ["k1", "k2", "k3", "k4"] {
            f.db.write(TABLE, key, "vvvv").unwrap();
        }
        for key in ["k1", "k2", "k3", "k4"] {
            f.proxy.process_read(&keys(&[key])).await.unwrap();
            assert!(f.proxy.cache_stats().current_size <= 20);
        }

        assert_eq!(f.proxy.cache().lru_keys(), keys(&["k4", "k3", "k2"]));
        assert_eq!(f.store.get("k1"), None);
        let snapshot = f.proxy.metrics().snapshot();
        assert_eq!(snapshot.lru_evictions, 1);
        assert_eq!(snapshot.size_overshoots, 0);
    }

    #[tokio::test]
    async fn test_predicted_obsolete_items_are_evicted_first() {
        let predictor = Arc::new(ScriptedPredictor {
            verdicts: Some(vec![false, true]),
            calls: Mutex::new(Vec::new()),
        });
        let mut f = fixture_with(20, predictor.clone());
        for key in ["k1", "k2", "k3", "k4"] {
            f.db.write(TABLE, key, "vvvv").unwrap();
        }
        for key in ["k1", "k2", "k3", "k4"] {
            f.proxy.process_read(&keys(&[key])).await.unwrap();
        }

        // Candidates come tail first: k1, k2, k3
        assert_eq!(*predictor.calls.lock().unwrap(), vec![3]);
        assert_eq!(f.proxy.cache().lru_keys(), keys(&["k4", "k3", "k1"]));
        assert_eq!(f.store.get("k2"), None);
        let snapshot = f.proxy.metrics().snapshot();
        assert_eq!(snapshot.obsolete_evictions, 1);
        assert_eq!(snapshot.lru_evictions, 0);
        assert_eq!(f.proxy.cache_stats().marked_item_count, 1);
    }

    #[tokio::test]
    async fn test_predictor_failure_falls_back_to_lru() {
        let predictor = Arc::new(ScriptedPredictor {
            verdicts: None,
            calls: Mutex::new(Vec::new()),
        });
        let mut f = fixture_with(20, predictor);
        for key in ["k1", "k2", "k3", "k4"] {
            f.db.write(TABLE, key, "vvvv").unwrap();
            f.proxy.process_read(&keys(&[key])).await.unwrap();
        }
        assert_eq!(f.proxy.cache().lru_keys(), keys(&["k4", "k3", "k2"]));
    }

    #[tokio::test]
    async fn test_oversized_item_records_overshoot() {
        let mut f = fixture(5);
        f.db.write(TABLE, "big", "0123456789").unwrap();
        let items = f.proxy.process_read(&keys(&["big"])).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(f.proxy.metrics().snapshot().size_overshoots, 1);
    }

    #[tokio::test]
    async fn test_store_failure_leaves_index_untouched() {
        let mut f = fixture(100);
        f.db.write(TABLE, "a", "1").unwrap();
        f.store.set_available(false);

        let err = f.proxy.process_read(&keys(&["a"])).await.unwrap_err();
        assert!(matches!(err, ProxyError::CacheStoreError(_)));
        assert_eq!(f.proxy.cache_stats().item_count, 0);

        f.store.set_available(true);
        f.proxy.process_read(&keys(&["a"])).await.unwrap();
        assert!(f.proxy.cache().contains("a"));
    }

    #[tokio::test]
    async fn test_store_failure_keeps_populated_index_unchanged() {
        let mut f = fixture(20);
        let mut last = 0;
        for key in ["k1", "k2", "k3", "k4"] {
            last = f.db.write(TABLE, key, "vvvv").unwrap();
        }
        f.proxy
            .process_invalidation(&keys(&["k1", "k2", "k3", "k4"]), last)
            .await
            .unwrap();
        for key in ["k1", "k2", "k3"] {
            f.proxy.process_read(&keys(&[key])).await.unwrap();
        }
        f.proxy.process_read(&keys(&["k1"])).await.unwrap();

        let items_before = f.proxy.cache().items();
        let stats_before = f.proxy.cache_stats();
        let lru_before = f.proxy.cache().lru_keys();
        let transactions_before = f.store.transaction_count();
        assert_eq!(stats_before.item_count, 3);

        // k1 would hit, k4 is fetched and forces an eviction
        f.store.set_available(false);
        let err = f.proxy.process_read(&keys(&["k1", "k4"])).await.unwrap_err();
        assert!(matches!(err, ProxyError::CacheStoreError(_)));

        assert_eq!(f.proxy.cache().items(), items_before);
        assert_eq!(f.proxy.cache_stats(), stats_before);
        assert_eq!(f.proxy.cache().lru_keys(), lru_before);
        assert_eq!(f.store.transaction_count(), transactions_before);
        assert!(!f.proxy.cache().contains("k4"));

        f.store.set_available(true);
        let items = f.proxy.process_read(&keys(&["k1", "k4"])).await.unwrap();
        assert_eq!(items.len(), 2);
        assert!(f.proxy.cache().contains("k4"));
        assert!(f.proxy.cache_stats().current_size <= 20);
    }

    #[tokio::test]
    async fn test_database_failure_leaves_index_untouched() {
        let mut f = fixture(100);
        f.db.write(TABLE, "a", "1").unwrap();
        f.db.set_available(false);
        let err = f.proxy.process_read(&keys(&["a"])).await.unwrap_err();
        assert!(err.is_collaborator_failure());
        assert_eq!(f.proxy.cache_stats().item_count, 0);
        assert_eq!(f.store.transaction_count(), 0);
    }

    #[tokio::test]
    async fn test_lost_store_value_is_forgotten() {
        let mut f = fixture(100);
        let v = f.db.write(TABLE, "a", "1").unwrap();
        f.proxy.process_invalidation(&keys(&["a"]), v).await.unwrap();
        f.proxy.process_read(&keys(&["a"])).await.unwrap();

        f.store.remove("a");
        let err = f.proxy.process_read(&keys(&["a"])).await.unwrap_err();
        assert!(matches!(err, ProxyError::CacheStoreError(_)));
        assert!(!f.proxy.cache().contains("a"));

        let items = f.proxy.process_read(&keys(&["a"])).await.unwrap();
        assert_eq!(items, vec![ItemRecord::new("a", "1", v)]);
    }

    #[tokio::test]
    async fn test_invalidation_raises_watermark_and_narrows_items() {
        let mut f = fixture(100);
        let v1 = f.db.write(TABLE, "a", "1").unwrap();
        f.proxy.process_read(&keys(&["a"])).await.unwrap();

        assert!(f.proxy.process_invalidation(&keys(&["a", "zz"]), v1 + 5).await.unwrap());
        assert_eq!(f.proxy.cache().max_invalidation_timestamp(), v1 + 5);
        assert_eq!(f.proxy.cache().item_valid_until("a"), Some(v1 + 5));
        assert_eq!(f.proxy.metrics().snapshot().invalidation_requests, 1);
    }

    #[tokio::test]
    async fn test_outdated_item_missing_from_database_is_evicted() {
        let (mut proxy, db) = scripted_proxy(false);
        db.set("a", "1", 1);
        db.set("b", "2", 1);
        proxy.process_invalidation(&keys(&["a", "b"]), 1).await.unwrap();
        proxy.process_read(&keys(&["a", "b"])).await.unwrap();

        db.delete("a");
        proxy.process_invalidation(&keys(&["a"]), 2).await.unwrap();
        // "c" exists nowhere, so the batch is triaged and "a" is outdated
        let items = proxy.process_read(&keys(&["a", "b", "c"])).await.unwrap();
        assert_eq!(items, vec![ItemRecord::new("b", "2", 1)]);
        assert!(!proxy.cache().contains("a"));
    }

    #[tokio::test]
    async fn test_monotonic_oracle_flags_version_regression() {
        let (mut proxy, db) = scripted_proxy(true);
        db.set("a", "new", 5);
        proxy.process_read(&keys(&["a"])).await.unwrap();

        // Version 5 is ahead of the watermark, so the next read refetches
        db.set("a", "old", 3);
        let err = proxy.process_read(&keys(&["a"])).await.unwrap_err();
        assert!(matches!(err, ProxyError::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn test_monotonic_oracle_disabled_allows_regression() {
        let (mut proxy, db) = scripted_proxy(false);
        db.set("a", "new", 5);
        proxy.process_read(&keys(&["a"])).await.unwrap();
        db.set("a", "old", 3);
        let items = proxy.process_read(&keys(&["a"])).await.unwrap();
        assert_eq!(items[0].version, 3);
    }

    #[test]
    fn test_dedup_keeps_first_occurrence() {
        assert_eq!(
            dedup_keys(&keys(&["b", "a", "b", "c", "a"])),
            keys(&["b", "a", "c"])
        );
    }
}
