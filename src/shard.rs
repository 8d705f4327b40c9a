//! Orchestrates many [`Index`] shards behind a pluggable key-value [`Store`]
//! (§4.9-§4.11): routes inserts to the active shard, fans out searches and
//! merges top-k, and manages bounded LRU residency against the store.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::future::try_join_all;

use crate::codec;
use crate::config::{Config, ShardConfig};
use crate::error::{Error, Result};
use crate::heap::MergeEntry;
use crate::index::Index;

/// Namespacing helper for the `shard-NNNNNN` key format (§3, §6). Carries no
/// state; every shard key that matters lives as a plain `String` in the
/// manager, same as the teacher's store keys.
pub struct ShardKey;

impl ShardKey {
    pub fn format(n: u64) -> String {
        format!("shard-{n:06}")
    }

    /// Whether `key` matches `^shard-\d{6}$`.
    pub fn is_valid(key: &str) -> bool {
        match key.strip_prefix("shard-") {
            Some(digits) => digits.len() == 6 && digits.bytes().all(|b| b.is_ascii_digit()),
            None => false,
        }
    }
}

/// The pluggable storage collaborator (§4.11). Any concrete transport (disk,
/// object storage, an in-memory test double) implements this without the
/// manager depending on it directly.
#[async_trait]
pub trait Store: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn write(&self, key: &str, bytes: &[u8]) -> std::result::Result<(), Self::Error>;
    async fn read(&self, key: &str) -> std::result::Result<Option<Vec<u8>>, Self::Error>;
    async fn delete(&self, key: &str) -> std::result::Result<bool, Self::Error>;
    async fn list(&self) -> std::result::Result<Vec<String>, Self::Error>;
    async fn exists(&self, key: &str) -> std::result::Result<bool, Self::Error>;
}

struct ResidentShard {
    index: Index,
    dirty: bool,
    last_access_tick: u64,
}

/// A single search hit, optionally carrying the stored vector (§4.9
/// `include_vectors`).
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub ext_id: String,
    pub distance: f32,
    pub vector: Option<Vec<f32>>,
}

/// Query-time knobs for [`ShardManager::search`], mirroring `Index::search`'s
/// own optional arguments plus the cross-shard `include_vectors` flag.
#[derive(Default)]
pub struct SearchOptions<'a> {
    pub ef_override: Option<usize>,
    pub filter: Option<&'a dyn Fn(&str) -> bool>,
    pub include_vectors: bool,
}

/// Orchestrates `Index` shards over store `S` (§4.9). Cooperative-async: the
/// only suspension points are the `Store` calls; between them state mutation
/// is atomic relative to other manager operations (§5).
pub struct ShardManager<S: Store> {
    index_config: Config,
    shard_config: ShardConfig,
    store: Option<S>,

    resident: HashMap<String, ResidentShard, ahash::RandomState>,
    ext_to_shard: HashMap<String, String, ahash::RandomState>,
    shard_keys: Vec<String>,
    active_key: Option<String>,
    access_tick: u64,
}

impl<S: Store> ShardManager<S> {
    pub fn new(index_config: Config, shard_config: ShardConfig, store: Option<S>) -> Self {
        Self {
            index_config,
            shard_config,
            store,
            resident: HashMap::default(),
            ext_to_shard: HashMap::default(),
            shard_keys: Vec::new(),
            active_key: None,
            access_tick: 0,
        }
    }

    /// Slots ever allocated in the active shard (`Index::count`, not its live
    /// `len`), used to decide when to roll a new shard. Internal ids are
    /// never reused within a shard (§3), so this can only grow — unlike
    /// `len`, it isn't pulled back down by deletes, which would otherwise let
    /// an insert/delete/reinsert workload grow one shard's backing arrays
    /// past `max_vectors_per_shard` forever without ever rolling a new one.
    fn active_shard_count(&self) -> usize {
        self.active_key
            .as_ref()
            .and_then(|key| self.resident.get(key))
            .map(|r| r.index.count() as usize)
            .unwrap_or(0)
    }

    pub fn shard_keys(&self) -> &[String] {
        &self.shard_keys
    }

    pub fn resident_count(&self) -> usize {
        self.resident.len()
    }

    pub fn is_resident(&self, key: &str) -> bool {
        self.resident.contains_key(key)
    }

    /// Total live vectors known to the manager, including non-resident
    /// shards (tracked via the global ext-id map rather than summing `len()`
    /// over only-loaded shards).
    pub fn live_count(&self) -> usize {
        self.ext_to_shard.len()
    }

    fn next_tick(&mut self) -> u64 {
        self.access_tick += 1;
        self.access_tick
    }

    fn shard_seed(&self, shard_number: u64) -> Config {
        let mut cfg = self.index_config;
        if let Some(base) = self.index_config.seed {
            cfg.seed = Some(base.wrapping_add(shard_number as u32));
        }
        cfg
    }

    async fn ensure_loaded(&mut self, key: &str) -> Result<()> {
        if self.resident.contains_key(key) {
            let tick = self.next_tick();
            self.resident.get_mut(key).unwrap().last_access_tick = tick;
            return Ok(());
        }
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| Error::ShardNotLoaded(key.to_string()))?;
        let bytes = store
            .read(key)
            .await
            .map_err(Error::storage)?
            .ok_or_else(|| Error::ShardMissing(key.to_string()))?;
        let index = codec::decode(&bytes)?;
        let tick = self.next_tick();
        self.resident.insert(
            key.to_string(),
            ResidentShard {
                index,
                dirty: false,
                last_access_tick: tick,
            },
        );
        self.evict_if_needed().await?;
        Ok(())
    }

    /// Residency eviction (§4.10): while over `max_loaded_shards`, drop the
    /// non-active resident shard with the smallest `last_access_tick`,
    /// flushing first if it is dirty. Stops if only the active shard
    /// remains resident, even if still over the bound.
    async fn evict_if_needed(&mut self) -> Result<()> {
        while self.resident.len() > self.shard_config.max_loaded_shards {
            let victim = self
                .resident
                .iter()
                .filter(|(k, _)| Some(k.as_str()) != self.active_key.as_deref())
                .min_by_key(|(_, r)| r.last_access_tick)
                .map(|(k, _)| k.clone());

            let Some(key) = victim else {
                break;
            };

            let dirty = self.resident.get(&key).map(|r| r.dirty).unwrap_or(false);
            if dirty {
                if let Some(store) = self.store.as_ref() {
                    let bytes = codec::encode(&self.resident.get(&key).unwrap().index);
                    store.write(&key, &bytes).await.map_err(Error::storage)?;
                }
            }
            tracing::debug!(shard = %key, "evicting resident shard");
            self.resident.remove(&key);
        }
        Ok(())
    }

    /// Insert `vector` under `ext_id` (§4.9), routing to the active shard
    /// and rolling a new one when it reaches `max_vectors_per_shard`.
    #[tracing::instrument(skip(self, vector), fields(dim = vector.len()))]
    pub async fn insert(&mut self, ext_id: impl Into<String> + std::fmt::Debug, vector: &[f32]) -> Result<()> {
        let ext_id = ext_id.into();
        if self.ext_to_shard.contains_key(&ext_id) {
            let err = Error::DuplicateId(ext_id);
            tracing::error!(error = %err, "insert rejected");
            return Err(err);
        }

        if self.active_key.is_none() || self.active_shard_count() >= self.shard_config.max_vectors_per_shard {
            let shard_number = self.shard_keys.len() as u64;
            let key = ShardKey::format(shard_number);
            let cfg = self.shard_seed(shard_number);
            self.shard_keys.push(key.clone());
            let tick = self.next_tick();
            self.resident.insert(
                key.clone(),
                ResidentShard {
                    index: Index::new(cfg),
                    dirty: true,
                    last_access_tick: tick,
                },
            );
            self.active_key = Some(key);
            self.evict_if_needed().await?;
        }

        let key = self.active_key.clone().expect("active shard just ensured");
        self.ensure_loaded(&key).await?;

        let resident = self.resident.get_mut(&key).expect("just loaded");
        if let Err(err) = resident.index.insert(ext_id.clone(), vector) {
            tracing::error!(error = %err, shard = %key, "insert rejected");
            return Err(err);
        }
        resident.dirty = true;
        let tick = self.next_tick();
        resident.last_access_tick = tick;

        self.ext_to_shard.insert(ext_id, key);
        Ok(())
    }

    /// Fan out a search across every known shard key, loading non-resident
    /// shards from the store as needed, and merge the per-shard top-k by
    /// distance with insertion order as the tie-break (§4.9).
    ///
    /// `include_vectors` is resolved against each shard's resident `Index`
    /// while that shard is still the one just loaded, not after the whole
    /// fan-out has run: with `max_loaded_shards` smaller than the number of
    /// shards searched, a shard visited early would otherwise have been
    /// evicted by the time a later `ensure_loaded` call ran, turning a
    /// requested vector into a silent `None`.
    #[tracing::instrument(skip(self, query, options), fields(k))]
    pub async fn search(
        &mut self,
        query: &[f32],
        k: usize,
        options: SearchOptions<'_>,
    ) -> Result<Vec<SearchHit>> {
        let keys = self.shard_keys.clone();
        let mut entries: Vec<MergeEntry<SearchHit>> = Vec::new();
        let mut seq: u64 = 0;

        for key in &keys {
            self.ensure_loaded(key).await?;
            let resident = self.resident.get_mut(key).expect("just loaded");
            let hits = resident.index.search(query, k, options.ef_override, options.filter)?;
            for (ext_id, dist) in hits {
                let vector = if options.include_vectors {
                    resident.index.get_vector(&ext_id).map(|v| v.to_vec())
                } else {
                    None
                };
                entries.push(MergeEntry {
                    dist,
                    seq,
                    payload: SearchHit {
                        ext_id,
                        distance: dist,
                        vector,
                    },
                });
                seq += 1;
            }
        }

        entries.sort();
        entries.truncate(k);
        Ok(entries.into_iter().map(|e| e.payload).collect())
    }

    /// Delete `ext_id` from whichever shard holds it (§4.9).
    #[tracing::instrument(skip(self))]
    pub async fn delete(&mut self, ext_id: &str) -> Result<bool> {
        let Some(key) = self.ext_to_shard.get(ext_id).cloned() else {
            return Ok(false);
        };
        self.ensure_loaded(&key).await?;
        let resident = self.resident.get_mut(&key).expect("just loaded");
        let removed = resident.index.delete(ext_id);
        if removed {
            resident.dirty = true;
            self.ext_to_shard.remove(ext_id);
        }
        Ok(removed)
    }

    /// Write every dirty resident shard back to the store (§4.9). A no-op
    /// without a configured store. Writes for distinct shards proceed
    /// concurrently: each only needs a shared borrow of `store`.
    #[tracing::instrument(skip(self))]
    pub async fn flush(&mut self) -> Result<()> {
        let Some(store) = self.store.as_ref() else {
            return Ok(());
        };
        let dirty: Vec<(String, Vec<u8>)> = self
            .resident
            .iter()
            .filter(|(_, r)| r.dirty)
            .map(|(k, r)| (k.clone(), codec::encode(&r.index)))
            .collect();

        try_join_all(
            dirty
                .iter()
                .map(|(key, bytes)| store.write(key, bytes)),
        )
        .await
        .map_err(Error::storage)?;

        for (key, _) in &dirty {
            self.resident.get_mut(key).unwrap().dirty = false;
            tracing::debug!(shard = %key, "flushed shard");
        }
        Ok(())
    }

    /// Replace every shard's Index with its `compact()`ed form (§4.9). Does
    /// not flush; callers combine with `flush()` if they want it persisted.
    #[tracing::instrument(skip(self))]
    pub async fn compact(&mut self) -> Result<()> {
        let keys = self.shard_keys.clone();
        for key in &keys {
            self.ensure_loaded(key).await?;
            let resident = self.resident.get_mut(key).expect("just loaded");
            resident.index = resident.index.compact();
            resident.dirty = true;
        }
        Ok(())
    }

    /// Flush, then drop all resident state (§4.9).
    pub async fn close(&mut self) -> Result<()> {
        self.flush().await?;
        self.resident.clear();
        Ok(())
    }

    /// Rebuild manager state from the store (§4.9): enumerate keys, sort
    /// lexicographically (the `shard-NNNNNN` format is order-preserving),
    /// decode each to rebuild the global ext-id map, and keep up to
    /// `max_loaded_shards` resident. The last key (by sort order) becomes
    /// the active shard.
    #[tracing::instrument(skip(self))]
    pub async fn load_from_storage(&mut self) -> Result<()> {
        if self.store.is_none() {
            return Err(Error::NotOpenable);
        }

        let mut keys = self.store.as_ref().unwrap().list().await.map_err(Error::storage)?;
        keys.sort();

        self.resident.clear();
        self.ext_to_shard.clear();
        self.shard_keys = keys.clone();

        // Store reads for distinct keys only need a shared borrow, so they
        // can proceed concurrently; decoding and bookkeeping stay sequential.
        let store = self.store.as_ref().unwrap();
        let blobs = try_join_all(keys.iter().map(|key| store.read(key)))
            .await
            .map_err(Error::storage)?;

        for (key, bytes) in keys.iter().zip(blobs) {
            let bytes = bytes.ok_or_else(|| Error::ShardMissing(key.clone()))?;
            let index = codec::decode(&bytes)?;

            for ext_id in index.live_ids() {
                self.ext_to_shard.insert(ext_id.to_string(), key.clone());
            }

            if self.resident.len() < self.shard_config.max_loaded_shards {
                let tick = self.next_tick();
                self.resident.insert(
                    key.clone(),
                    ResidentShard {
                        index,
                        dirty: false,
                        last_access_tick: tick,
                    },
                );
            }
        }

        self.active_key = keys.last().cloned();
        if let Some(active) = self.active_key.clone() {
            self.ensure_loaded(&active).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    #[derive(Debug, thiserror::Error)]
    #[error("in-memory store error: {0}")]
    struct MemStoreError(String);

    #[derive(Default)]
    struct MemStore {
        data: Mutex<HashMap<String, Vec<u8>>>,
    }

    #[async_trait]
    impl Store for MemStore {
        type Error = MemStoreError;

        async fn write(&self, key: &str, bytes: &[u8]) -> std::result::Result<(), Self::Error> {
            self.data.lock().unwrap().insert(key.to_string(), bytes.to_vec());
            Ok(())
        }

        async fn read(&self, key: &str) -> std::result::Result<Option<Vec<u8>>, Self::Error> {
            Ok(self.data.lock().unwrap().get(key).cloned())
        }

        async fn delete(&self, key: &str) -> std::result::Result<bool, Self::Error> {
            Ok(self.data.lock().unwrap().remove(key).is_some())
        }

        async fn list(&self) -> std::result::Result<Vec<String>, Self::Error> {
            Ok(self.data.lock().unwrap().keys().cloned().collect())
        }

        async fn exists(&self, key: &str) -> std::result::Result<bool, Self::Error> {
            Ok(self.data.lock().unwrap().contains_key(key))
        }
    }

    fn manager(store: Option<MemStore>) -> ShardManager<MemStore> {
        let shard_config = ShardConfig {
            max_vectors_per_shard: 10,
            max_loaded_shards: 4,
        };
        ShardManager::new(Config::new(2).with_seed(1), shard_config, store)
    }

    #[test]
    fn shard_key_format_and_validation() {
        assert_eq!(ShardKey::format(0), "shard-000000");
        assert_eq!(ShardKey::format(42), "shard-000042");
        assert!(ShardKey::is_valid("shard-000042"));
        assert!(!ShardKey::is_valid("shard-42"));
        assert!(!ShardKey::is_valid("shrad-000042"));
    }

    #[tokio::test]
    async fn insert_rolls_a_new_shard_at_capacity() {
        let mut mgr = manager(None);
        for i in 0..25 {
            mgr.insert(format!("v{i}"), &[i as f32, 0.0]).await.unwrap();
        }
        assert_eq!(mgr.shard_keys().len(), 3);
        assert_eq!(mgr.live_count(), 25);
    }

    #[tokio::test]
    async fn duplicate_id_across_shards_is_rejected() {
        let mut mgr = manager(None);
        mgr.insert("a", &[1.0, 1.0]).await.unwrap();
        let err = mgr.insert("a", &[2.0, 2.0]).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateId(_)));
    }

    #[tokio::test]
    async fn search_merges_across_shards_in_ascending_order() {
        let mut mgr = manager(None);
        for i in 0..25 {
            mgr.insert(format!("v{i}"), &[i as f32, 0.0]).await.unwrap();
        }
        let hits = mgr
            .search(&[0.0, 0.0], 5, SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 5);
        for window in hits.windows(2) {
            assert!(window[0].distance <= window[1].distance);
        }
        assert_eq!(hits[0].ext_id, "v0");
    }

    #[tokio::test]
    async fn delete_updates_global_map_and_active_count() {
        let mut mgr = manager(None);
        mgr.insert("a", &[1.0, 1.0]).await.unwrap();
        assert!(mgr.delete("a").await.unwrap());
        assert!(!mgr.delete("a").await.unwrap());
        assert_eq!(mgr.live_count(), 0);
        mgr.insert("a", &[1.0, 1.0]).await.unwrap();
        assert_eq!(mgr.live_count(), 1);
    }

    #[tokio::test]
    async fn flush_then_load_from_storage_round_trips() {
        let store = MemStore::default();
        let mut mgr = manager(Some(store));
        for i in 0..25 {
            mgr.insert(format!("v{i}"), &[i as f32, 0.0]).await.unwrap();
        }
        mgr.flush().await.unwrap();

        let store2 = MemStore::default();
        {
            let data = mgr.store.as_ref().unwrap().data.lock().unwrap().clone();
            *store2.data.lock().unwrap() = data;
        }
        let mut mgr2 = manager(Some(store2));
        mgr2.load_from_storage().await.unwrap();
        assert_eq!(mgr2.live_count(), 25);
        assert_eq!(mgr2.shard_keys().len(), 3);

        let hits = mgr2
            .search(&[0.0, 0.0], 3, SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 3);
    }

    #[tokio::test]
    async fn eviction_keeps_active_shard_resident() {
        let shard_config = ShardConfig {
            max_vectors_per_shard: 2,
            max_loaded_shards: 1,
        };
        let store = MemStore::default();
        let mut mgr = ShardManager::new(Config::new(2).with_seed(1), shard_config, Some(store));
        for i in 0..10 {
            mgr.insert(format!("v{i}"), &[i as f32, 0.0]).await.unwrap();
        }
        assert!(mgr.resident_count() <= 2);
        assert!(mgr.is_resident(mgr.active_key.as_ref().unwrap()));
    }

    #[tokio::test]
    async fn search_include_vectors_survives_eviction_during_fan_out() {
        let shard_config = ShardConfig {
            max_vectors_per_shard: 1,
            max_loaded_shards: 2,
        };
        let store = MemStore::default();
        let mut mgr = ShardManager::new(Config::new(2).with_seed(1), shard_config, Some(store));
        for i in 0..5 {
            mgr.insert(format!("v{i}"), &[i as f32, 0.0]).await.unwrap();
        }
        assert_eq!(mgr.shard_keys().len(), 5);

        let hits = mgr
            .search(
                &[0.0, 0.0],
                5,
                SearchOptions {
                    include_vectors: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 5);
        for hit in &hits {
            assert!(
                hit.vector.is_some(),
                "shard {ext_id} lost its vector across eviction",
                ext_id = hit.ext_id
            );
        }
    }

    #[tokio::test]
    async fn search_without_include_vectors_omits_vectors() {
        let mut mgr = manager(None);
        mgr.insert("a", &[1.0, 1.0]).await.unwrap();
        let hits = mgr
            .search(&[0.0, 0.0], 1, SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].vector.is_none());
    }

    #[tokio::test]
    async fn delete_then_reinsert_churn_does_not_bypass_shard_rollover() {
        let shard_config = ShardConfig {
            max_vectors_per_shard: 10,
            max_loaded_shards: 4,
        };
        let mut mgr = ShardManager::new(Config::new(2).with_seed(1), shard_config, None);
        for i in 0..10 {
            mgr.insert(format!("v{i}"), &[i as f32, 0.0]).await.unwrap();
        }
        assert_eq!(mgr.shard_keys().len(), 1);

        for i in 0..10 {
            mgr.delete(&format!("v{i}")).await.unwrap();
        }
        for i in 10..20 {
            mgr.insert(format!("v{i}"), &[i as f32, 0.0]).await.unwrap();
        }

        assert_eq!(
            mgr.shard_keys().len(),
            2,
            "a shard whose allocated slots exceed max_vectors_per_shard must roll over \
             even if deletes dropped its live count back down"
        );
    }
}
