/// Distance metric an [`crate::index::Index`] is built with.
///
/// Lower is always more similar, for every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    /// Squared Euclidean distance (no square root taken).
    Euclidean,
    /// `1 - cosine_similarity`.
    Cosine,
    /// Negated dot product.
    InnerProduct,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Euclidean => "euclidean",
            Metric::Cosine => "cosine",
            Metric::InnerProduct => "inner_product",
        }
    }

    /// On-disk tag used by the codec header (§6).
    pub(crate) fn tag(&self) -> u8 {
        match self {
            Metric::Euclidean => 0,
            Metric::Cosine => 1,
            Metric::InnerProduct => 2,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Metric::Euclidean),
            1 => Some(Metric::Cosine),
            2 => Some(Metric::InnerProduct),
            _ => None,
        }
    }

    /// Whether this metric needs a precomputed per-vector norm (§3 invariant 7).
    pub(crate) fn needs_norm(&self) -> bool {
        matches!(self, Metric::Cosine)
    }
}

/// Construction and query-time parameters for a single [`crate::index::Index`].
///
/// Mirrors §4.1: only `dim` is required, everything else defaults the way the
/// reference implementation does.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub dim: usize,
    pub m: usize,
    pub m_max_0: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    pub metric: Metric,
    pub m_l: f64,
    pub use_heuristic: bool,
    pub keep_pruned_connections: bool,
    pub seed: Option<u32>,
}

impl Config {
    /// Start from the default configuration for `dim`, matching §4.1's
    /// defaults (M=16, Mmax0=2M, ef_construction=200, ef_search=50,
    /// mL=1/ln(M), heuristic selection on, pruned connections kept).
    pub fn new(dim: usize) -> Self {
        let m = 16;
        Self {
            dim,
            m,
            m_max_0: 2 * m,
            ef_construction: 200,
            ef_search: 50,
            metric: Metric::Euclidean,
            m_l: 1.0 / (m as f64).ln(),
            use_heuristic: true,
            keep_pruned_connections: true,
            seed: None,
        }
    }

    pub fn with_metric(mut self, metric: Metric) -> Self {
        self.metric = metric;
        self
    }

    pub fn with_m(mut self, m: usize) -> Self {
        self.m = m;
        self.m_max_0 = 2 * m;
        self.m_l = 1.0 / (m as f64).ln();
        self
    }

    pub fn with_m_max_0(mut self, m_max_0: usize) -> Self {
        self.m_max_0 = m_max_0;
        self
    }

    pub fn with_ef_construction(mut self, ef_construction: usize) -> Self {
        self.ef_construction = ef_construction;
        self
    }

    pub fn with_ef_search(mut self, ef_search: usize) -> Self {
        self.ef_search = ef_search;
        self
    }

    pub fn with_seed(mut self, seed: u32) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_heuristic(mut self, use_heuristic: bool) -> Self {
        self.use_heuristic = use_heuristic;
        self
    }

    pub fn with_keep_pruned_connections(mut self, keep_pruned_connections: bool) -> Self {
        self.keep_pruned_connections = keep_pruned_connections;
        self
    }

    /// Maximum neighbor count for layer `l` (§3: `maxN`).
    pub(crate) fn max_n(&self, layer: usize) -> usize {
        if layer == 0 { self.m_max_0 } else { self.m }
    }
}

/// Bounds for a [`crate::shard::ShardManager`] (§4.1).
#[derive(Debug, Clone, Copy)]
pub struct ShardConfig {
    pub max_vectors_per_shard: usize,
    pub max_loaded_shards: usize,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            max_vectors_per_shard: 100_000,
            max_loaded_shards: 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_spec_defaults() {
        let cfg = Config::new(128);
        assert_eq!(cfg.m, 16);
        assert_eq!(cfg.m_max_0, 32);
        assert_eq!(cfg.ef_construction, 200);
        assert_eq!(cfg.ef_search, 50);
        assert!(cfg.use_heuristic);
        assert!(cfg.keep_pruned_connections);
        assert_eq!(cfg.seed, None);
        assert!((cfg.m_l - (1.0 / 16f64.ln())).abs() < 1e-12);
    }

    #[test]
    fn max_n_picks_layer_zero_cap() {
        let cfg = Config::new(8).with_m(16).with_m_max_0(40);
        assert_eq!(cfg.max_n(0), 40);
        assert_eq!(cfg.max_n(1), 16);
    }

    #[test]
    fn default_shard_config_matches_spec() {
        let cfg = ShardConfig::default();
        assert_eq!(cfg.max_vectors_per_shard, 100_000);
        assert_eq!(cfg.max_loaded_shards, 4);
    }
}
