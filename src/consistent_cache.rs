//! Consistent Cache Module
//!
//! Versioned index of the items held in the cache store. The index keeps, per key,
//! the database version of the cached value and the version at which it is known
//! to turn stale, an LRU order, the invalidation watermark and a two-phase marking
//! scheme used to batch obsolescence checks. Values themselves live in the cache
//! store; the index only holds metadata.
//!
//! The LRU list is an arena of slots linked by index. Slots 0 and 1 are the head
//! and tail sentinels and are never unlinked; freed slots are recycled through a
//! free list. The index is not synchronized internally: it relies on a single
//! writer (see `task_queue`).

use crate::access_tracker::{AccessTracker, AccessTrackerKind, RawFeature};
use crate::cache_types::{ItemRecord, MccHitResult, Version, VALID_FOREVER};
use crate::{ProxyError, Result};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

const HEAD: usize = 0;
const TAIL: usize = 1;

#[derive(Debug, Clone, Copy)]
struct Link {
    prev: usize,
    next: usize,
}

#[derive(Debug)]
struct ItemNode {
    key: String,
    version: Version,
    valid_until: Version,
    data_size: u64,
    mark: bool,
    tracker: Box<dyn AccessTracker>,
}

/// Metadata of one cached item, as exposed for inspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachedItemInfo {
    pub key: String,
    pub version: Version,
    pub valid_until: Version,
    pub data_size: u64,
}

/// An eviction candidate handed to the obsolescence predictor
#[derive(Debug, Clone)]
pub struct ObsoleteCandidate {
    pub key: String,
    pub data_size: u64,
    pub feature: RawFeature,
}

/// Consistent cache statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsistentCacheStats {
    pub current_size: u64,
    pub max_size: u64,
    pub item_count: usize,
    pub marked_item_count: usize,
    pub max_invalidation_timestamp: Version,
}

/// Versioned item index with LRU order and phase marking
#[derive(Debug)]
pub struct ConsistentCache {
    max_size: u64,
    current_size: u64,
    max_invalidation_timestamp: Version,
    links: Vec<Link>,
    nodes: Vec<Option<ItemNode>>,
    free_slots: Vec<usize>,
    index: HashMap<String, usize>,
    current_phase_mark: bool,
    item_count: usize,
    marked_item_count: usize,
    tracker_kind: AccessTrackerKind,
}

impl ConsistentCache {
    /// Create an empty cache holding at most `max_size` bytes
    pub fn new(max_size: u64) -> Self {
        Self::with_tracker_kind(max_size, AccessTrackerKind::default())
    }

    pub fn with_tracker_kind(max_size: u64, tracker_kind: AccessTrackerKind) -> Self {
        Self {
            max_size,
            current_size: 0,
            max_invalidation_timestamp: 0,
            links: vec![
                Link {
                    prev: HEAD,
                    next: TAIL,
                },
                Link {
                    prev: HEAD,
                    next: TAIL,
                },
            ],
            nodes: vec![None, None],
            free_slots: Vec::new(),
            index: HashMap::new(),
            current_phase_mark: false,
            item_count: 0,
            marked_item_count: 0,
            tracker_kind,
        }
    }

    pub fn cache_size(&self) -> u64 {
        self.current_size
    }

    pub fn cache_size_limit(&self) -> u64 {
        self.max_size
    }

    pub fn item_count(&self) -> usize {
        self.item_count
    }

    pub fn max_invalidation_timestamp(&self) -> Version {
        self.max_invalidation_timestamp
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn item_version(&self, key: &str) -> Option<Version> {
        self.node_by_key(key).map(|node| node.version)
    }

    pub fn item_valid_until(&self, key: &str) -> Option<Version> {
        self.node_by_key(key).map(|node| node.valid_until)
    }

    /// Insert an item or replace the cached version of an existing one.
    ///
    /// An update resets `valid_until` to unbounded and keeps the item's phase mark.
    /// A new item starts marked in the current phase.
    pub fn put(&mut self, key: &str, version: Version, data_size: u64) {
        if let Some(&slot) = self.index.get(key) {
            if let Some(node) = self.nodes[slot].as_mut() {
                if version < node.version {
                    warn!(
                        "Cached version of {} moves backwards: {} -> {}",
                        key, node.version, version
                    );
                }
                self.current_size = (self.current_size - node.data_size) + data_size;
                node.version = version;
                node.valid_until = VALID_FOREVER;
                node.data_size = data_size;
            }
            self.move_to_head(slot);
            return;
        }

        let node = ItemNode {
            key: key.to_string(),
            version,
            valid_until: VALID_FOREVER,
            data_size,
            mark: self.current_phase_mark,
            tracker: self.tracker_kind.create(),
        };
        let slot = self.alloc_slot(node);
        self.index.insert(key.to_string(), slot);
        self.link_at_head(slot);
        self.current_size += data_size;
        self.item_count += 1;
        self.marked_item_count += 1;
    }

    /// Remove an item; returns false when the key is not cached
    pub fn evict(&mut self, key: &str) -> bool {
        let Some(slot) = self.index.remove(key) else {
            debug!("Evict skipped, key not cached: {}", key);
            return false;
        };
        self.unlink(slot);
        if let Some(node) = self.nodes[slot].take() {
            self.current_size -= node.data_size;
            self.item_count -= 1;
            if node.mark == self.current_phase_mark {
                self.marked_item_count -= 1;
            }
        }
        self.free_slots.push(slot);
        true
    }

    /// Move an item to the most recently used position; returns false when absent
    pub fn access(&mut self, key: &str) -> bool {
        match self.index.get(key) {
            Some(&slot) => {
                self.move_to_head(slot);
                true
            }
            None => false,
        }
    }

    /// Apply an invalidation for `key` at `new_version`.
    ///
    /// The watermark is raised first, whether or not the key is cached. A cached
    /// unbounded item older than `new_version` has its `valid_until` narrowed to
    /// `new_version`; an already narrowed item is left alone. Replays and
    /// out-of-order invalidations never lower the watermark.
    pub fn invalidate(&mut self, key: &str, new_version: Version) {
        if new_version < self.max_invalidation_timestamp {
            debug!(
                "Out-of-order invalidation for {}: {} < watermark {}",
                key, new_version, self.max_invalidation_timestamp
            );
        }
        self.max_invalidation_timestamp = self.max_invalidation_timestamp.max(new_version);

        match self.node_by_key_mut(key) {
            Some(node) => {
                if node.valid_until == VALID_FOREVER && node.version < new_version {
                    node.valid_until = new_version;
                }
                debug_assert!(node.valid_until >= node.version);
            }
            None => {
                debug!("Invalidation for uncached key {} at {}", key, new_version);
            }
        }
    }

    /// True when every key is cached, every version is covered by the watermark and
    /// the life-cycle intervals `[version, valid_until)` of all keys intersect.
    pub fn is_mcc_hit(&self, keys: &[String]) -> bool {
        let mut life_start_max: Version = 0;
        let mut life_end_min: Version = VALID_FOREVER;

        for key in keys {
            let Some(node) = self.node_by_key(key) else {
                return false;
            };
            if node.version > self.max_invalidation_timestamp {
                return false;
            }
            life_start_max = life_start_max.max(node.version);
            life_end_min = life_end_min.min(node.valid_until);
            if life_start_max >= life_end_min {
                return false;
            }
        }
        true
    }

    /// Split `keys` into missing, outdated and hit items, keeping input order.
    ///
    /// An item is outdated when its version is ahead of the watermark or an
    /// invalidation has already narrowed it.
    pub fn make_mcc_hit(&self, keys: &[String]) -> MccHitResult {
        let mut result = MccHitResult::default();
        for key in keys {
            match self.node_by_key(key) {
                None => result.missing_items.push(key.clone()),
                Some(node)
                    if node.version > self.max_invalidation_timestamp
                        || node.valid_until != VALID_FOREVER =>
                {
                    result.outdated_items.push(key.clone())
                }
                Some(_) => result.hit_items.push(key.clone()),
            }
        }
        debug!("make_mcc_hit: {:?}", result);
        result
    }

    /// Mark the given items as touched in the current phase
    pub fn mark_items(&mut self, keys: &[String]) {
        for key in keys {
            let phase = self.current_phase_mark;
            if let Some(node) = self.node_by_key_mut(key) {
                if node.mark != phase {
                    node.mark = phase;
                    self.marked_item_count += 1;
                }
            }
        }
    }

    /// True once every cached item was touched since the last phase flip
    pub fn is_all_marked(&self) -> bool {
        self.marked_item_count == self.item_count
    }

    /// Whether `is_all_marked` would hold after `mark_items(keys)`, without marking.
    pub fn is_all_marked_after(&self, keys: &[String]) -> bool {
        let mut pending: HashSet<&str> = HashSet::new();
        for key in keys {
            if let Some(node) = self.node_by_key(key) {
                if node.mark != self.current_phase_mark {
                    pending.insert(key.as_str());
                }
            }
        }
        self.marked_item_count + pending.len() == self.item_count
    }

    /// Flip the phase flag; every item becomes unmarked
    pub fn start_new_phase(&mut self) {
        self.current_phase_mark = !self.current_phase_mark;
        self.marked_item_count = 0;
        info!("Started new marking phase over {} items", self.item_count);
    }

    /// Items eligible for obsolescence, least recently used first, with their access
    /// history as of `time_step`.
    pub fn obsolete_candidates(
        &self,
        exclude: &HashSet<String>,
        time_step: u64,
    ) -> Vec<ObsoleteCandidate> {
        self.iter_from_tail()
            .filter(|node| !exclude.contains(&node.key))
            .map(|node| ObsoleteCandidate {
                key: node.key.clone(),
                data_size: node.data_size,
                feature: node.tracker.raw_feature_at(time_step),
            })
            .collect()
    }

    /// Least recently used items, skipping `exclude`, until their total size reaches
    /// `needed_size` or the list is exhausted.
    pub fn get_lru_items(&self, exclude: &HashSet<String>, needed_size: u64) -> Vec<String> {
        let mut items = Vec::new();
        let mut accumulated: u64 = 0;
        for node in self.iter_from_tail() {
            if accumulated >= needed_size {
                break;
            }
            if exclude.contains(&node.key) {
                continue;
            }
            accumulated += node.data_size;
            items.push(node.key.clone());
        }
        if accumulated < needed_size {
            warn!(
                "LRU candidates exhausted: needed {} bytes, found {}",
                needed_size, accumulated
            );
        }
        items
    }

    /// Total size of the cached keys among `keys`
    pub fn get_data_size(&self, keys: &[String]) -> u64 {
        keys.iter()
            .filter_map(|key| self.node_by_key(key))
            .map(|node| node.data_size)
            .sum()
    }

    /// Commit a completed read: touch hits, evict evicted, put new items.
    pub fn post_cache_update(
        &mut self,
        hit_items: &[String],
        evicted_items: &[String],
        new_items: &[ItemRecord],
    ) {
        for key in hit_items {
            self.access(key);
        }
        for key in evicted_items {
            self.evict(key);
        }
        for item in new_items {
            self.put(&item.key, item.version, item.size());
        }
        debug!(
            "post_cache_update: hit={} evicted={} new={} size={}/{}",
            hit_items.len(),
            evicted_items.len(),
            new_items.len(),
            self.current_size,
            self.max_size
        );
    }

    /// Record a read at `time_step` in the trackers of the cached keys
    pub fn record_reads(&mut self, keys: &[String], time_step: u64) {
        for key in keys {
            if let Some(node) = self.node_by_key_mut(key) {
                node.tracker.record_read(time_step);
            }
        }
    }

    /// Record a write at `time_step` in the tracker of `key` if it is cached
    pub fn record_write(&mut self, key: &str, time_step: u64) {
        if let Some(node) = self.node_by_key_mut(key) {
            node.tracker.record_write(time_step);
        }
    }

    /// Keys from most to least recently used
    pub fn lru_keys(&self) -> Vec<String> {
        self.iter_from_head().map(|node| node.key.clone()).collect()
    }

    /// Item metadata from most to least recently used
    pub fn items(&self) -> Vec<CachedItemInfo> {
        self.iter_from_head()
            .map(|node| CachedItemInfo {
                key: node.key.clone(),
                version: node.version,
                valid_until: node.valid_until,
                data_size: node.data_size,
            })
            .collect()
    }

    pub fn stats(&self) -> ConsistentCacheStats {
        ConsistentCacheStats {
            current_size: self.current_size,
            max_size: self.max_size,
            item_count: self.item_count,
            marked_item_count: self.marked_item_count,
            max_invalidation_timestamp: self.max_invalidation_timestamp,
        }
    }

    /// Walk the list in both directions and cross-check it against the counters
    pub fn validate_consistency(&self) -> Result<()> {
        let forward: Vec<usize> = self.slots_from(HEAD, |link| link.next, TAIL);
        let mut backward: Vec<usize> = self.slots_from(TAIL, |link| link.prev, HEAD);
        backward.reverse();
        if forward != backward {
            return Err(ProxyError::InvariantViolation(
                "LRU list differs between forward and backward walks".to_string(),
            ));
        }
        if forward.len() != self.item_count || self.index.len() != self.item_count {
            return Err(ProxyError::InvariantViolation(format!(
                "Item count mismatch: list {} index {} counter {}",
                forward.len(),
                self.index.len(),
                self.item_count
            )));
        }

        let mut size = 0;
        let mut marked = 0;
        for &slot in &forward {
            let Some(node) = self.nodes[slot].as_ref() else {
                return Err(ProxyError::InvariantViolation(format!(
                    "Linked slot {} holds no item",
                    slot
                )));
            };
            if self.index.get(&node.key) != Some(&slot) {
                return Err(ProxyError::InvariantViolation(format!(
                    "Index entry for {} does not point at its slot",
                    node.key
                )));
            }
            if node.valid_until < node.version {
                return Err(ProxyError::InvariantViolation(format!(
                    "Item {} valid until {} before its version {}",
                    node.key, node.valid_until, node.version
                )));
            }
            size += node.data_size;
            if node.mark == self.current_phase_mark {
                marked += 1;
            }
        }
        if size != self.current_size {
            return Err(ProxyError::InvariantViolation(format!(
                "Size mismatch: calculated {} vs tracked {}",
                size, self.current_size
            )));
        }
        if marked != self.marked_item_count {
            return Err(ProxyError::InvariantViolation(format!(
                "Marked count mismatch: calculated {} vs tracked {}",
                marked, self.marked_item_count
            )));
        }
        Ok(())
    }

    fn node_by_key(&self, key: &str) -> Option<&ItemNode> {
        let slot = *self.index.get(key)?;
        self.nodes.get(slot)?.as_ref()
    }

    fn node_by_key_mut(&mut self, key: &str) -> Option<&mut ItemNode> {
        let slot = *self.index.get(key)?;
        self.nodes.get_mut(slot)?.as_mut()
    }

    fn alloc_slot(&mut self, node: ItemNode) -> usize {
        match self.free_slots.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                slot
            }
            None => {
                self.nodes.push(Some(node));
                self.links.push(Link {
                    prev: HEAD,
                    next: TAIL,
                });
                self.links.len() - 1
            }
        }
    }

    fn unlink(&mut self, slot: usize) {
        debug_assert!(slot != HEAD && slot != TAIL, "sentinels are never unlinked");
        let Link { prev, next } = self.links[slot];
        self.links[prev].next = next;
        self.links[next].prev = prev;
    }

    fn link_at_head(&mut self, slot: usize) {
        let first = self.links[HEAD].next;
        self.links[slot] = Link {
            prev: HEAD,
            next: first,
        };
        self.links[first].prev = slot;
        self.links[HEAD].next = slot;
    }

    fn move_to_head(&mut self, slot: usize) {
        if self.links[HEAD].next == slot {
            return;
        }
        self.unlink(slot);
        self.link_at_head(slot);
    }

    fn slots_from(&self, start: usize, step: impl Fn(&Link) -> usize, end: usize) -> Vec<usize> {
        let mut slots = Vec::new();
        let mut current = step(&self.links[start]);
        while current != end && slots.len() <= self.links.len() {
            slots.push(current);
            current = step(&self.links[current]);
        }
        slots
    }

    fn iter_from_head(&self) -> impl Iterator<Item = &ItemNode> + '_ {
        self.slots_from(HEAD, |link| link.next, TAIL)
            .into_iter()
            .filter_map(move |slot| self.nodes[slot].as_ref())
    }

    fn iter_from_tail(&self) -> impl Iterator<Item = &ItemNode> + '_ {
        self.slots_from(TAIL, |link| link.prev, HEAD)
            .into_iter()
            .filter_map(move |slot| self.nodes[slot].as_ref())
    }
}
