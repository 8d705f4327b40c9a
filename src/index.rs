//! The flat-array HNSW index (§3, §4.4-§4.7).
//!
//! Every backing array is a flat `Vec` addressed by a monotonic internal id
//! assigned in insertion order; there is no `Node` object and no pointer
//! chasing. Growth only ever appends to the tail of these arrays (§4.7), so a
//! capacity bump is a handful of `resize` calls rather than a rebuild.

use std::num::NonZeroUsize;

use crate::config::{Config, Metric};
use crate::distance::{compute_norm, DistanceFn};
use crate::error::{Error, Result};
use crate::heap::{BoundedMinHeap, Candidate, MinQueue};
use crate::prng::Prng;
use crate::bitset::Bitset;

const SENTINEL: u32 = u32::MAX;

#[inline]
fn vector_slice(vectors: &[f32], dim: usize, id: u32) -> &[f32] {
    let start = id as usize * dim;
    &vectors[start..start + dim]
}

#[inline]
fn node_norm(norms: &[f32], id: u32) -> f32 {
    norms.get(id as usize).copied().unwrap_or(0.0)
}

/// One layer's adjacency, flattened to `capacity * max_neighbors` with
/// [`SENTINEL`] marking unused slots (§3).
#[derive(Debug, Clone)]
pub(crate) struct Layer {
    pub(crate) max_neighbors: usize,
    adjacency: Vec<u32>,
    neighbor_counts: Vec<u8>,
}

impl Layer {
    fn new(capacity: usize, max_neighbors: usize) -> Self {
        Self {
            max_neighbors,
            adjacency: vec![SENTINEL; capacity * max_neighbors],
            neighbor_counts: vec![0; capacity],
        }
    }

    fn grow(&mut self, new_capacity: usize) {
        self.adjacency
            .resize(new_capacity * self.max_neighbors, SENTINEL);
        self.neighbor_counts.resize(new_capacity, 0);
    }

    fn shrink_to(&mut self, new_capacity: usize) {
        self.adjacency.truncate(new_capacity * self.max_neighbors);
        self.adjacency.shrink_to_fit();
        self.neighbor_counts.truncate(new_capacity);
        self.neighbor_counts.shrink_to_fit();
    }

    fn row(&self, id: u32) -> &[u32] {
        let start = id as usize * self.max_neighbors;
        &self.adjacency[start..start + self.max_neighbors]
    }

    fn row_mut(&mut self, id: u32) -> &mut [u32] {
        let mn = self.max_neighbors;
        let start = id as usize * mn;
        &mut self.adjacency[start..start + mn]
    }

    pub(crate) fn count(&self, id: u32) -> usize {
        self.neighbor_counts[id as usize] as usize
    }

    pub(crate) fn live_neighbors(&self, id: u32) -> &[u32] {
        &self.row(id)[..self.count(id)]
    }

    /// Full padded adjacency buffer, for the codec (§6): every row, not just
    /// the live prefix.
    pub(crate) fn raw_adjacency(&self) -> &[u32] {
        &self.adjacency
    }

    pub(crate) fn raw_neighbor_counts(&self) -> &[u8] {
        &self.neighbor_counts
    }

    /// Rebuild a layer from a decoded wire block (§6), trusting the counts
    /// the codec already validated against `max_neighbors`.
    pub(crate) fn from_raw(max_neighbors: usize, adjacency: Vec<u32>, neighbor_counts: Vec<u8>) -> Self {
        debug_assert_eq!(adjacency.len(), neighbor_counts.len() * max_neighbors);
        Self {
            max_neighbors,
            adjacency,
            neighbor_counts,
        }
    }

    fn set_neighbors(&mut self, id: u32, neighbors: &[u32]) {
        debug_assert!(neighbors.len() <= self.max_neighbors);
        let len = neighbors.len();
        {
            let row = self.row_mut(id);
            row[..len].copy_from_slice(neighbors);
            for slot in &mut row[len..] {
                *slot = SENTINEL;
            }
        }
        self.neighbor_counts[id as usize] = len as u8;
    }
}

/// Select up to `max_n` neighbors from `candidates` (already sorted
/// ascending by distance to the query). Either a plain nearest-first
/// truncation or Algorithm 4's diversity heuristic (§4.5).
fn select_neighbours(
    distance_fn: DistanceFn,
    vectors: &[f32],
    norms: &[f32],
    dim: usize,
    use_heuristic: bool,
    keep_pruned_connections: bool,
    max_n: usize,
    candidates: &[Candidate],
) -> Vec<u32> {
    if !use_heuristic {
        return candidates.iter().take(max_n).map(|c| c.id).collect();
    }

    let mut selected: Vec<Candidate> = Vec::with_capacity(max_n.min(candidates.len()));
    let mut discarded: Vec<Candidate> = Vec::new();

    for &c in candidates {
        if selected.len() >= max_n {
            break;
        }
        let c_vec = vector_slice(vectors, dim, c.id);
        let c_norm = node_norm(norms, c.id);
        let is_diverse = selected.iter().all(|s: &Candidate| {
            let s_vec = vector_slice(vectors, dim, s.id);
            let s_norm = node_norm(norms, s.id);
            distance_fn.distance(c_vec, s_vec, c_norm, s_norm) >= c.dist
        });
        if is_diverse {
            selected.push(c);
        } else {
            discarded.push(c);
        }
    }

    if keep_pruned_connections {
        for c in discarded {
            if selected.len() >= max_n {
                break;
            }
            if !selected.iter().any(|s| s.id == c.id) {
                selected.push(c);
            }
        }
    }

    selected.into_iter().map(|c| c.id).collect()
}

/// A single-threaded HNSW index over `f32` vectors of a fixed dimension
/// (§3). Construction, insertion, search and deletion all operate over the
/// flat arrays described in the module docs; there is no internal locking,
/// by design (§5).
#[derive(Debug)]
pub struct Index {
    pub(crate) dim: usize,
    pub(crate) m: usize,
    pub(crate) m_max_0: usize,
    pub(crate) ef_construction: usize,
    pub(crate) ef_search: usize,
    pub(crate) metric: Metric,
    pub(crate) m_l: f64,
    pub(crate) use_heuristic: bool,
    pub(crate) keep_pruned_connections: bool,
    pub(crate) seed: u32,

    distance_fn: DistanceFn,
    rng: Prng,

    pub(crate) count: u32,
    pub(crate) deleted_count: u32,
    pub(crate) capacity: u32,

    pub(crate) vectors: Vec<f32>,
    pub(crate) norms: Vec<f32>,
    pub(crate) levels: Vec<u8>,
    pub(crate) layers: Vec<Layer>,
    pub(crate) deleted_set: Bitset,
    pub(crate) ext_to_int: std::collections::HashMap<String, u32, ahash::RandomState>,
    pub(crate) int_to_ext: Vec<String>,
    pub(crate) entry_point: Option<u32>,
    pub(crate) max_level: i32,

    scratch_visited: Bitset,
    scratch_frontier: MinQueue,
    scratch_results: BoundedMinHeap<Candidate>,
}

impl Index {
    pub fn new(config: Config) -> Self {
        let seed = config.seed.unwrap_or_else(Prng::random_seed);
        Self {
            dim: config.dim,
            m: config.m,
            m_max_0: config.m_max_0,
            ef_construction: config.ef_construction,
            ef_search: config.ef_search,
            metric: config.metric,
            m_l: config.m_l,
            use_heuristic: config.use_heuristic,
            keep_pruned_connections: config.keep_pruned_connections,
            seed,

            distance_fn: DistanceFn::new(config.metric),
            rng: Prng::new(seed),

            count: 0,
            deleted_count: 0,
            capacity: 0,

            vectors: Vec::new(),
            norms: Vec::new(),
            levels: Vec::new(),
            layers: Vec::new(),
            deleted_set: Bitset::new(),
            ext_to_int: std::collections::HashMap::default(),
            int_to_ext: Vec::new(),
            entry_point: None,
            max_level: -1,

            scratch_visited: Bitset::new(),
            scratch_frontier: MinQueue::new(),
            scratch_results: BoundedMinHeap::new(NonZeroUsize::new(1).unwrap()),
        }
    }

    /// Rebuild an Index directly from a decoded wire image (§4.8), bypassing
    /// `insert` entirely: the codec already validated shape, so this just
    /// assembles the fields. `capacity` is tight (`= count`), matching decode's
    /// "zero tombstones" contract.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_decoded(
        config: Config,
        count: u32,
        max_level: i32,
        entry_point: Option<u32>,
        vectors: Vec<f32>,
        norms: Vec<f32>,
        levels: Vec<u8>,
        layers: Vec<Layer>,
        int_to_ext: Vec<String>,
        ext_to_int: std::collections::HashMap<String, u32, ahash::RandomState>,
    ) -> Self {
        let capacity = count;
        let seed = config.seed.unwrap_or_else(Prng::random_seed);
        Self {
            dim: config.dim,
            m: config.m,
            m_max_0: config.m_max_0,
            ef_construction: config.ef_construction,
            ef_search: config.ef_search,
            metric: config.metric,
            m_l: config.m_l,
            use_heuristic: config.use_heuristic,
            keep_pruned_connections: config.keep_pruned_connections,
            seed,

            distance_fn: DistanceFn::new(config.metric),
            rng: Prng::new(seed),

            count,
            deleted_count: 0,
            capacity,

            vectors,
            norms,
            levels,
            layers,
            deleted_set: Bitset::with_capacity(capacity as usize),
            ext_to_int,
            int_to_ext,
            entry_point,
            max_level,

            scratch_visited: Bitset::with_capacity(capacity as usize),
            scratch_frontier: MinQueue::new(),
            scratch_results: BoundedMinHeap::new(NonZeroUsize::new(1).unwrap()),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn m(&self) -> usize {
        self.m
    }

    pub fn m_max_0(&self) -> usize {
        self.m_max_0
    }

    pub fn ef_construction(&self) -> usize {
        self.ef_construction
    }

    pub fn ef_search(&self) -> usize {
        self.ef_search
    }

    pub fn seed(&self) -> u32 {
        self.seed
    }

    pub fn entry_point(&self) -> Option<u32> {
        self.entry_point
    }

    pub fn max_level(&self) -> i32 {
        self.max_level
    }

    /// Live (non-tombstoned) vector count.
    pub fn len(&self) -> usize {
        (self.count - self.deleted_count) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every internal id ever allocated, tombstoned or not.
    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn deleted_count(&self) -> u32 {
        self.deleted_count
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    fn config_max_n(&self, layer: usize) -> usize {
        if layer == 0 {
            self.m_max_0
        } else {
            self.m
        }
    }

    /// The configuration this Index was built with, reusable to build a
    /// fresh, structurally independent Index with identical parameters
    /// (used by [`Index::compact`]).
    pub fn to_config(&self) -> Config {
        Config {
            dim: self.dim,
            m: self.m,
            m_max_0: self.m_max_0,
            ef_construction: self.ef_construction,
            ef_search: self.ef_search,
            metric: self.metric,
            m_l: self.m_l,
            use_heuristic: self.use_heuristic,
            keep_pruned_connections: self.keep_pruned_connections,
            seed: Some(self.seed),
        }
    }

    pub fn has(&self, ext_id: &str) -> bool {
        self.ext_to_int
            .get(ext_id)
            .map(|&id| !self.deleted_set.get(id as usize))
            .unwrap_or(false)
    }

    /// External ids of every non-tombstoned slot, in internal-id order
    /// (used by `ShardManager::load_from_storage` to rebuild its global map).
    pub fn live_ids(&self) -> impl Iterator<Item = &str> + '_ {
        (0..self.count as usize)
            .filter(move |&i| !self.deleted_set.get(i))
            .map(move |i| self.int_to_ext[i].as_str())
    }

    pub fn get_vector(&self, ext_id: &str) -> Option<&[f32]> {
        let &id = self.ext_to_int.get(ext_id)?;
        if self.deleted_set.get(id as usize) {
            return None;
        }
        Some(vector_slice(&self.vectors, self.dim, id))
    }

    fn ensure_layers_up_to(&mut self, level: usize) {
        while self.layers.len() <= level {
            let layer_idx = self.layers.len();
            let max_n = self.config_max_n(layer_idx);
            self.layers.push(Layer::new(self.capacity as usize, max_n));
        }
    }

    fn grow_to(&mut self, new_capacity: u32) {
        let dim = self.dim;
        self.vectors.resize(new_capacity as usize * dim, 0.0);
        self.norms.resize(new_capacity as usize, 0.0);
        self.levels.resize(new_capacity as usize, 0);
        self.deleted_set.grow(new_capacity as usize);
        for layer in &mut self.layers {
            layer.grow(new_capacity as usize);
        }
        self.scratch_visited.grow(new_capacity as usize);
        self.capacity = new_capacity;
    }

    /// Capacity growth policy (§4.7): grow to
    /// `max(capacity + 1, ceil(capacity * 1.5))` whenever the next insert
    /// would overflow the current capacity.
    fn ensure_capacity_for_insert(&mut self) {
        if self.count >= self.capacity {
            let grown = ((self.capacity as f64) * 1.5).ceil() as u32;
            let new_capacity = (self.capacity + 1).max(grown);
            self.grow_to(new_capacity);
        }
    }

    /// Insert `vector` under `ext_id`, returning its internal id (§4.4).
    ///
    /// Dimension and duplicate-id checks happen before any state is
    /// mutated, so a rejected insert never leaves a partial slot, mapping
    /// or graph edge behind.
    #[tracing::instrument(skip(self, vector), fields(dim = vector.len()))]
    pub fn insert(&mut self, ext_id: impl Into<String> + std::fmt::Debug, vector: &[f32]) -> Result<u32> {
        let ext_id = ext_id.into();
        if vector.len() != self.dim {
            let err = Error::DimensionMismatch {
                expected: self.dim,
                found: vector.len(),
            };
            tracing::error!(error = %err, "insert rejected");
            return Err(err);
        }
        if self.ext_to_int.contains_key(&ext_id) {
            let err = Error::DuplicateId(ext_id);
            tracing::error!(error = %err, "insert rejected");
            return Err(err);
        }

        let id = self.count;
        self.ensure_capacity_for_insert();

        let dim = self.dim;
        self.vectors[id as usize * dim..(id as usize + 1) * dim].copy_from_slice(vector);
        if self.metric.needs_norm() {
            self.norms[id as usize] = compute_norm(vector);
        }

        let level = self.rng.sample_level(self.m_l).min(u8::MAX as usize);
        self.levels[id as usize] = level as u8;

        self.ext_to_int.insert(ext_id.clone(), id);
        if id as usize >= self.int_to_ext.len() {
            self.int_to_ext.resize(id as usize + 1, String::new());
        }
        self.int_to_ext[id as usize] = ext_id;
        self.count += 1;

        self.ensure_layers_up_to(level);

        let Some(mut ep) = self.entry_point else {
            self.entry_point = Some(id);
            self.max_level = level as i32;
            return Ok(id);
        };

        let old_top = self.max_level;
        let query_norm = node_norm(&self.norms, id);
        let query: Vec<f32> = vector.to_vec();

        for l in (level as i32 + 1..=old_top).rev() {
            let results = self.beam_search(&query, query_norm, ep, 1, l as usize);
            if let Some(nearest) = results.first() {
                ep = nearest.id;
            }
        }

        let start_layer = level.min(old_top as usize);
        for l in (0..=start_layer).rev() {
            let ef = self.ef_construction;
            let candidates = self.beam_search(&query, query_norm, ep, ef, l);
            let max_n = self.config_max_n(l);
            let selected = select_neighbours(
                self.distance_fn,
                &self.vectors,
                &self.norms,
                dim,
                self.use_heuristic,
                self.keep_pruned_connections,
                max_n,
                &candidates,
            );

            self.layers[l].set_neighbors(id, &selected);
            for &nb in &selected {
                self.add_backedge(nb, id, l);
            }

            if let Some(nearest) = candidates.first() {
                ep = nearest.id;
            }
        }

        if level as i32 > old_top {
            self.max_level = level as i32;
            self.entry_point = Some(id);
        }

        Ok(id)
    }

    /// Add `new_id` as a neighbor of `neighbor` at `layer`, reselecting the
    /// row from scratch if it was already full (§4.4 linking step).
    fn add_backedge(&mut self, neighbor: u32, new_id: u32, layer: usize) {
        let max_n = self.layers[layer].max_neighbors;
        if self.layers[layer].live_neighbors(neighbor).contains(&new_id) {
            return;
        }

        let existing_count = self.layers[layer].count(neighbor);
        if existing_count < max_n {
            let mut row: Vec<u32> = self.layers[layer].live_neighbors(neighbor).to_vec();
            row.push(new_id);
            self.layers[layer].set_neighbors(neighbor, &row);
            return;
        }

        let dim = self.dim;
        let neighbor_vec = vector_slice(&self.vectors, dim, neighbor).to_vec();
        let neighbor_norm = node_norm(&self.norms, neighbor);
        let mut ids: Vec<u32> = self.layers[layer].live_neighbors(neighbor).to_vec();
        ids.push(new_id);

        let distance_fn = self.distance_fn;
        let mut candidates: Vec<Candidate> = ids
            .iter()
            .map(|&id| {
                let dist = if id == neighbor {
                    0.0
                } else {
                    let v = vector_slice(&self.vectors, dim, id);
                    let n = node_norm(&self.norms, id);
                    distance_fn.distance(&neighbor_vec, v, neighbor_norm, n)
                };
                Candidate::new(id, dist)
            })
            .collect();
        candidates.sort();

        let selected = select_neighbours(
            distance_fn,
            &self.vectors,
            &self.norms,
            dim,
            self.use_heuristic,
            self.keep_pruned_connections,
            max_n,
            &candidates,
        );
        self.layers[layer].set_neighbors(neighbor, &selected);
    }

    /// Beam search at a single layer (§4.6, Algorithm 2). Returns results in
    /// ascending-distance order. Uses the pooled `visited`/`frontier`/
    /// `results` scratch rather than allocating per call.
    fn beam_search(
        &mut self,
        query: &[f32],
        query_norm: f32,
        entry: u32,
        ef: usize,
        layer: usize,
    ) -> Vec<Candidate> {
        self.scratch_visited.clear();
        self.scratch_frontier.clear();
        self.scratch_results.clear();
        self.scratch_results.set_capacity(ef.max(1));

        let dim = self.dim;
        let distance_fn = self.distance_fn;

        let entry_dist = {
            let v = vector_slice(&self.vectors, dim, entry);
            let n = node_norm(&self.norms, entry);
            distance_fn.distance(query, v, query_norm, n)
        };
        self.scratch_visited.set(entry as usize);
        self.scratch_frontier.push(Candidate::new(entry, entry_dist));
        self.scratch_results.push(Candidate::new(entry, entry_dist));

        while let Some(nearest) = self.scratch_frontier.pop() {
            if let Some(worst) = self.scratch_results.peek() {
                if nearest.dist > worst.dist {
                    break;
                }
            }

            let neighbor_ids: Vec<u32> = self.layers[layer].live_neighbors(nearest.id).to_vec();
            for m in neighbor_ids {
                if self.scratch_visited.get(m as usize) {
                    continue;
                }
                self.scratch_visited.set(m as usize);

                let d = {
                    let v = vector_slice(&self.vectors, dim, m);
                    let n = node_norm(&self.norms, m);
                    distance_fn.distance(query, v, query_norm, n)
                };

                let worst = self.scratch_results.peek().map(|c| c.dist);
                let should_add = self.scratch_results.len() < ef || worst.is_none_or(|w| d < w);
                if should_add {
                    self.scratch_frontier.push(Candidate::new(m, d));
                    self.scratch_results.push(Candidate::new(m, d));
                }
            }
        }

        self.scratch_results.drain_sorted()
    }

    /// Remove `ext_id` from the index, tombstoning it rather than
    /// rewriting any adjacency rows (§4.4). Returns `false` if the id is
    /// unknown or already removed.
    #[tracing::instrument(skip(self))]
    pub fn delete(&mut self, ext_id: &str) -> bool {
        let Some(&id) = self.ext_to_int.get(ext_id) else {
            return false;
        };
        if self.deleted_set.get(id as usize) {
            return false;
        }
        self.deleted_set.set(id as usize);
        self.deleted_count += 1;
        true
    }

    /// Approximate k-nearest-neighbor search (§4.4, Algorithm 5).
    ///
    /// `ef_override`, if given, is raised to at least `k` (§9 Open
    /// Question: silently, rather than rejected). `filter` is applied
    /// against each surviving external id before it counts toward `k`.
    pub fn search(
        &mut self,
        query: &[f32],
        k: usize,
        ef_override: Option<usize>,
        filter: Option<&dyn Fn(&str) -> bool>,
    ) -> Result<Vec<(String, f32)>> {
        if query.len() != self.dim {
            return Err(Error::DimensionMismatch {
                expected: self.dim,
                found: query.len(),
            });
        }
        let Some(mut ep) = self.entry_point else {
            return Ok(Vec::new());
        };
        if k == 0 {
            return Ok(Vec::new());
        }

        let query_norm = if self.metric.needs_norm() {
            compute_norm(query)
        } else {
            0.0
        };
        let query_owned = query.to_vec();

        let top = self.max_level;
        for l in (1..=top).rev() {
            let results = self.beam_search(&query_owned, query_norm, ep, 1, l as usize);
            if let Some(nearest) = results.first() {
                ep = nearest.id;
            }
        }

        let ef = ef_override.unwrap_or(self.ef_search).max(k);
        let candidates = self.beam_search(&query_owned, query_norm, ep, ef, 0);

        let mut out = Vec::with_capacity(k);
        for c in candidates {
            if self.deleted_set.get(c.id as usize) {
                continue;
            }
            let ext = &self.int_to_ext[c.id as usize];
            if let Some(f) = filter {
                if !f(ext) {
                    continue;
                }
            }
            out.push((ext.clone(), c.dist));
            if out.len() == k {
                break;
            }
        }
        Ok(out)
    }

    /// Rebuild into a fresh Index with tombstones actually removed (§4.4).
    /// Reinserts live vectors in ascending internal-id order under the same
    /// configuration (including seed), so two compacts of the same data
    /// produce the same graph.
    #[tracing::instrument(skip(self), fields(count = self.count, deleted = self.deleted_count))]
    pub fn compact(&self) -> Index {
        let mut fresh = Index::new(self.to_config());
        for id in 0..self.count {
            if self.deleted_set.get(id as usize) {
                continue;
            }
            let ext = self.int_to_ext[id as usize].clone();
            let v = vector_slice(&self.vectors, self.dim, id).to_vec();
            fresh
                .insert(ext, &v)
                .expect("compact: re-inserting a previously valid vector cannot fail");
        }
        fresh
    }

    /// Shrink every backing array to exactly the live capacity (§9 Open
    /// Question: the tombstone and pooled-visited bitsets are resized too,
    /// not left oversized).
    pub fn shrink_to_fit(&mut self) {
        let new_capacity = self.count.max(1);
        let dim = self.dim;

        self.vectors.truncate(new_capacity as usize * dim);
        self.vectors.shrink_to_fit();
        self.norms.truncate(new_capacity as usize);
        self.norms.shrink_to_fit();
        self.levels.truncate(new_capacity as usize);
        self.levels.shrink_to_fit();
        self.deleted_set.resize_to(new_capacity as usize);
        for layer in &mut self.layers {
            layer.shrink_to(new_capacity as usize);
        }
        self.scratch_visited.resize_to(new_capacity as usize);
        self.capacity = new_capacity;
    }

    /// Rough resident memory footprint in bytes: vectors, norms, levels and
    /// every layer's adjacency and neighbor-count arrays.
    pub fn memory_usage(&self) -> usize {
        let mut total = self.vectors.len() * 4 + self.norms.len() * 4 + self.levels.len();
        for layer in &self.layers {
            total += layer.adjacency.len() * 4 + layer.neighbor_counts.len();
        }
        total
    }
}
